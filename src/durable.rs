//! Crash-safe single-file persistence.
//!
//! Every replacement of an existing file goes through a sibling temp file
//! and a single rename, so readers see either the old or the new content.
//! Writers to the same path serialize on a `<name>.lock` sidecar; readers
//! never take the lock.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use fs2::FileExt;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::{ClawupError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableOptions {
    pub lock_attempts: u32,
    pub lock_backoff_min: Duration,
    pub lock_backoff_max: Duration,
    /// Extra rename attempts after the first one fails.
    pub rename_retries: u32,
    pub rename_jitter_max: Duration,
    /// Copy the temp file over the target when every rename attempt failed.
    pub copy_fallback: bool,
}

impl Default for DurableOptions {
    fn default() -> Self {
        let contended_rename = cfg!(windows);
        Self {
            lock_attempts: 5,
            lock_backoff_min: Duration::from_millis(100),
            lock_backoff_max: Duration::from_millis(1000),
            rename_retries: if contended_rename { 3 } else { 0 },
            rename_jitter_max: Duration::from_millis(2000),
            copy_fallback: contended_rename,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DurableWriter {
    options: DurableOptions,
}

impl DurableWriter {
    pub fn new(options: DurableOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &DurableOptions {
        &self.options
    }

    pub fn write(&self, path: &Path, content: impl AsRef<[u8]>) -> Result<()> {
        self.write_mode(path, content, None)
    }

    /// Like [`DurableWriter::write`], setting unix permission bits on the new file.
    pub fn write_mode(
        &self,
        path: &Path,
        content: impl AsRef<[u8]>,
        mode: Option<u32>,
    ) -> Result<()> {
        self.write_with_rename(path, content.as_ref(), mode, |from, to| {
            self.rename_into_place(from, to)
        })
    }

    fn write_with_rename<F>(
        &self,
        path: &Path,
        content: &[u8],
        mode: Option<u32>,
        rename: F,
    ) -> Result<()>
    where
        F: FnOnce(&Path, &Path) -> Result<()>,
    {
        ensure_parent(path).map_err(|err| ClawupError::write(path, err))?;

        if !path.exists() {
            match write_fresh(path, content, mode) {
                Ok(()) => {
                    debug!(path = %path.display(), "created file");
                    return Ok(());
                }
                // Another writer created it first; fall back to the locked path.
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                Err(err) => return Err(ClawupError::write(path, err.into())),
            }
        }

        let _lock = FileLock::acquire(path, &self.options)?;
        let tmp = temp_path_for(path);
        let result = stage(&tmp, content, mode)
            .map_err(ClawupError::from)
            .and_then(|()| rename(&tmp, path));
        if let Err(err) = result {
            if tmp.exists() {
                if let Err(cleanup) = fs::remove_file(&tmp) {
                    warn!(tmp = %tmp.display(), "failed to remove temp file: {cleanup}");
                }
            }
            return Err(ClawupError::write(path, err));
        }
        sync_parent_dir(path);
        Ok(())
    }

    fn rename_into_place(&self, from: &Path, to: &Path) -> Result<()> {
        self.rename_with(from, to, |from, to| fs::rename(from, to))
    }

    fn rename_with<R>(&self, from: &Path, to: &Path, mut rename: R) -> Result<()>
    where
        R: FnMut(&Path, &Path) -> io::Result<()>,
    {
        let mut attempt = 0;
        let last_err = loop {
            match rename(from, to) {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() != ErrorKind::NotFound && attempt < self.options.rename_retries => {
                    attempt += 1;
                    let delay = jitter(self.options.rename_jitter_max);
                    warn!(
                        target_path = %to.display(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "rename failed, retrying: {err}"
                    );
                    thread::sleep(delay);
                }
                Err(err) => break err,
            }
        };

        if self.options.copy_fallback && from.exists() {
            warn!(target_path = %to.display(), "rename kept failing, copying temp file instead");
            if fs::copy(from, to).is_ok() {
                if let Err(err) = fs::remove_file(from) {
                    warn!(tmp = %from.display(), "failed to remove temp file after copy: {err}");
                }
                return Ok(());
            }
        }

        Err(ClawupError::AtomicRename {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source: last_err,
        })
    }
}

/// Exclusive cross-process lock on `<target>.lock`, released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    pub fn acquire(target: &Path, options: &DurableOptions) -> Result<FileLock> {
        let path = lock_path_for(target);
        let attempts = options.lock_attempts.max(1);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| ClawupError::Lock {
                path: target.to_path_buf(),
                attempts: 0,
                source,
            })?;

        let mut delay = options.lock_backoff_min;
        let mut attempt = 1;
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(FileLock { file, path }),
                Err(err) if attempt < attempts => {
                    debug!(lock = %path.display(), attempt, "lock busy: {err}");
                    thread::sleep(delay);
                    delay = next_backoff(delay, options.lock_backoff_max);
                    attempt += 1;
                }
                Err(source) => {
                    return Err(ClawupError::Lock {
                        path: target.to_path_buf(),
                        attempts,
                        source,
                    })
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(lock = %self.path.display(), "failed to release lock: {err}");
        }
    }
}

/// Write with default options.
pub fn write_durable(path: &Path, content: impl AsRef<[u8]>) -> Result<()> {
    DurableWriter::default().write(path, content)
}

/// Read a whole file as UTF-8. Takes no lock.
pub fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|err| read_error(path, err))
}

fn read_error(path: &Path, err: io::Error) -> ClawupError {
    match err.kind() {
        ErrorKind::NotFound => ClawupError::NotFound {
            path: path.to_path_buf(),
        },
        ErrorKind::PermissionDenied => ClawupError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => ClawupError::Io(err),
    }
}

pub fn lock_path_for(target: &Path) -> PathBuf {
    sibling(target, |name| format!("{name}.lock"))
}

fn temp_path_for(target: &Path) -> PathBuf {
    sibling(target, |name| format!(".{name}.{}.tmp", uuid::Uuid::new_v4()))
}

fn sibling(target: &Path, name: impl FnOnce(&str) -> String) -> PathBuf {
    let file_name = target
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "clawup".to_string());
    target.with_file_name(name(&file_name))
}

pub(crate) fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn write_fresh(path: &Path, content: &[u8], mode: Option<u32>) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    apply_mode(path, mode)?;
    file.write_all(content)?;
    file.sync_all()
}

fn stage(tmp: &Path, content: &[u8], mode: Option<u32>) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(tmp)?;
    apply_mode(tmp, mode)?;
    file.write_all(content)?;
    file.sync_all()
}

fn apply_mode(path: &Path, mode: Option<u32>) -> io::Result<()> {
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
    Ok(())
}

fn sync_parent_dir(path: &Path) {
    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

fn next_backoff(delay: Duration, max: Duration) -> Duration {
    delay.saturating_mul(2).min(max)
}

fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use tempfile::tempdir;

    fn fast_options() -> DurableOptions {
        DurableOptions {
            lock_attempts: 2,
            lock_backoff_min: Duration::from_millis(1),
            lock_backoff_max: Duration::from_millis(2),
            rename_retries: 0,
            rename_jitter_max: Duration::ZERO,
            copy_fallback: false,
        }
    }

    fn temp_files(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .filter(|name| name.ends_with(".tmp"))
            .collect()
    }

    #[test]
    fn first_write_creates_parents_without_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        write_durable(&path, "v1").unwrap();
        assert_eq!(read_file(&path).unwrap(), "v1");
        assert!(!lock_path_for(&path).exists());
    }

    #[test]
    fn overwrite_replaces_content_and_cleans_temp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let writer = DurableWriter::new(fast_options());
        writer.write(&path, "v1").unwrap();
        writer.write(&path, "v2").unwrap();
        assert_eq!(read_file(&path).unwrap(), "v2");
        assert!(lock_path_for(&path).exists());
        assert!(temp_files(dir.path()).is_empty());
    }

    #[test]
    fn crash_before_rename_keeps_previous_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let writer = DurableWriter::new(fast_options());
        writer.write(&path, "v1").unwrap();

        let err = writer
            .write_with_rename(&path, b"v2", None, |tmp, target| {
                // The new content is fully staged but not yet visible.
                assert_eq!(fs::read_to_string(tmp).unwrap(), "v2");
                assert_eq!(fs::read_to_string(target).unwrap(), "v1");
                Err(io::Error::new(ErrorKind::Interrupted, "simulated crash").into())
            })
            .expect_err("interrupted write should fail");

        assert!(matches!(err, ClawupError::Write { .. }));
        assert!(err.to_string().contains("checkpoint.json"));
        assert_eq!(read_file(&path).unwrap(), "v1");
        assert!(temp_files(dir.path()).is_empty());
    }

    #[test]
    fn held_lock_aborts_write_and_leaves_target() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let writer = DurableWriter::new(fast_options());
        writer.write(&path, "v1").unwrap();

        let held = FileLock::acquire(&path, writer.options()).unwrap();
        let err = writer.write(&path, "v2").expect_err("lock is held");
        assert!(err.is_lock());
        assert_eq!(read_file(&path).unwrap(), "v1");
        drop(held);

        writer.write(&path, "v2").unwrap();
        assert_eq!(read_file(&path).unwrap(), "v2");
    }

    #[test]
    fn second_writer_waits_for_lock_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_durable(&path, "v1").unwrap();

        let patient = DurableOptions {
            lock_attempts: 200,
            lock_backoff_min: Duration::from_millis(5),
            lock_backoff_max: Duration::from_millis(10),
            ..fast_options()
        };
        let held = FileLock::acquire(&path, &patient).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        let worker_path = path.clone();
        let worker = thread::spawn(move || {
            let result = DurableWriter::new(patient).write(&worker_path, "v2");
            done_tx.send(()).unwrap();
            result
        });

        assert!(done_rx.recv_timeout(Duration::from_millis(150)).is_err());
        assert_eq!(read_file(&path).unwrap(), "v1");

        drop(held);
        worker.join().unwrap().unwrap();
        assert_eq!(read_file(&path).unwrap(), "v2");
    }

    #[test]
    fn concurrent_writers_never_interleave() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_durable(&path, "seed").unwrap();

        let payloads: Vec<String> = (0..4).map(|i| i.to_string().repeat(64 * 1024)).collect();
        let handles: Vec<_> = payloads
            .iter()
            .cloned()
            .map(|payload| {
                let path = path.clone();
                thread::spawn(move || {
                    let options = DurableOptions {
                        lock_attempts: 500,
                        lock_backoff_min: Duration::from_millis(1),
                        lock_backoff_max: Duration::from_millis(5),
                        ..fast_options()
                    };
                    DurableWriter::new(options).write(&path, payload)
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        let content = read_file(&path).unwrap();
        assert!(payloads.contains(&content));
    }

    #[test]
    fn rename_failure_surfaces_atomic_rename_after_retries() {
        let dir = tempdir().unwrap();
        // A non-empty directory at the target path makes every rename fail.
        let path = dir.path().join("occupied");
        fs::create_dir_all(path.join("child")).unwrap();

        let writer = DurableWriter::new(DurableOptions {
            rename_retries: 2,
            copy_fallback: true,
            ..fast_options()
        });
        let err = writer.write(&path, "v2").expect_err("rename onto a directory");
        match err {
            ClawupError::Write { source, .. } => {
                assert!(matches!(*source, ClawupError::AtomicRename { .. }))
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(temp_files(dir.path()).is_empty());
        assert!(path.join("child").is_dir());
    }

    #[test]
    fn transient_rename_failure_succeeds_on_retry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let writer = DurableWriter::new(DurableOptions {
            rename_retries: 3,
            ..fast_options()
        });
        writer.write(&path, "v1").unwrap();

        let mut attempts = 0;
        writer
            .write_with_rename(&path, b"v2", None, |tmp, target| {
                writer.rename_with(tmp, target, |from, to| {
                    attempts += 1;
                    if attempts < 3 {
                        return Err(io::Error::new(ErrorKind::PermissionDenied, "file in use"));
                    }
                    fs::rename(from, to)
                })
            })
            .unwrap();

        assert_eq!(attempts, 3);
        assert_eq!(read_file(&path).unwrap(), "v2");
        assert!(temp_files(dir.path()).is_empty());
    }

    #[test]
    fn copy_fallback_replaces_target_when_renames_keep_failing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let writer = DurableWriter::new(DurableOptions {
            rename_retries: 2,
            copy_fallback: true,
            ..fast_options()
        });
        writer.write(&path, "v1").unwrap();

        let mut attempts = 0;
        writer
            .write_with_rename(&path, b"v2", None, |tmp, target| {
                writer.rename_with(tmp, target, |_, _| {
                    attempts += 1;
                    Err(io::Error::new(ErrorKind::PermissionDenied, "file in use"))
                })
            })
            .unwrap();

        assert_eq!(attempts, 3);
        assert_eq!(read_file(&path).unwrap(), "v2");
        assert!(temp_files(dir.path()).is_empty());
    }

    #[test]
    fn lock_backoff_doubles_up_to_the_cap_without_overflow() {
        let max = Duration::from_millis(1000);
        assert_eq!(next_backoff(Duration::from_millis(100), max), Duration::from_millis(200));
        assert_eq!(next_backoff(Duration::from_millis(800), max), max);
        assert_eq!(next_backoff(Duration::MAX, Duration::MAX), Duration::MAX);
        assert_eq!(next_backoff(Duration::MAX, max), max);
    }

    #[test]
    fn read_errors_are_classified_by_kind() {
        let path = Path::new("/state/checkpoint.json");
        assert!(matches!(
            read_error(path, io::Error::from(ErrorKind::PermissionDenied)),
            ClawupError::PermissionDenied { .. }
        ));
        assert!(matches!(
            read_error(path, io::Error::from(ErrorKind::NotFound)),
            ClawupError::NotFound { .. }
        ));
        assert!(matches!(
            read_error(path, io::Error::from(ErrorKind::InvalidData)),
            ClawupError::Io(_)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn read_file_reports_permission_denied() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("locked.json");
        fs::write(&path, "{}").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o000)).unwrap();
        if fs::File::open(&path).is_ok() {
            // Running as root; permission bits are not enforced.
            return;
        }
        let err = read_file(&path).unwrap_err();
        assert!(matches!(err, ClawupError::PermissionDenied { .. }));
    }

    #[test]
    fn read_file_classifies_missing_file() {
        let dir = tempdir().unwrap();
        let err = read_file(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ClawupError::NotFound { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn mode_is_applied_to_new_and_replaced_files() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("secret.env");
        let writer = DurableWriter::new(fast_options());
        writer.write_mode(&path, "A=1\n", Some(0o600)).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o600);
        writer.write_mode(&path, "A=2\n", Some(0o600)).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o600);
    }
}
