use std::env;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dialoguer::console::style;
use serde::Serialize;
use serde_json::json;

use clawup::checkpoint::CheckpointStore;
use clawup::collaborators::Collaborators;
use clawup::config::{
    default_config_yaml, load_config, read_config, resolve_config_path, Config, ResolvedPaths,
};
use clawup::durable::DurableWriter;
use clawup::error::{ClawupError, Result};
use clawup::local::local_collaborators;
use clawup::logging;
use clawup::orchestrator::{InstallSummary, Orchestrator};
use clawup::progress::{JsonLinesSink, ProgressBus, ProgressEvent, ProgressSink, ProgressStatus};
use clawup::repair::{RepairReport, RepairRunner};

#[derive(Parser, Debug)]
#[command(name = "clawup", version, about = "Install and maintain the OpenClaw agent runtime")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install or resume installing the agent runtime.
    Install,
    /// Diagnose the installation and fix what can be fixed automatically.
    Repair,
    /// Show the install checkpoint and daemon state.
    Status,
    Paths,
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Show,
    Validate,
}

#[derive(Subcommand, Debug)]
enum DaemonCommand {
    Start,
    Stop,
    Restart,
    Status,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Clone)]
struct Context {
    config_path: PathBuf,
    json: bool,
}

/// Everything a command needs, resolved once from the config file.
struct Host {
    cfg: Config,
    paths: ResolvedPaths,
    writer: DurableWriter,
    checkpoints: CheckpointStore,
    collaborators: Collaborators,
}

impl Host {
    fn load(ctx: &Context) -> Result<Host> {
        let cfg = load_config(&ctx.config_path)?;
        let paths = ResolvedPaths::new(&ctx.config_path, &cfg);
        let writer = DurableWriter::new(cfg.durable.options());
        let checkpoints = CheckpointStore::new(
            paths.checkpoint.clone(),
            env!("CARGO_PKG_VERSION"),
            writer.clone(),
        );
        let collaborators = local_collaborators(&cfg, &paths, &writer);
        Ok(Host {
            cfg,
            paths,
            writer,
            checkpoints,
            collaborators,
        })
    }
}

/// Human-readable progress lines on stderr.
struct ConsoleSink;

impl ProgressSink for ConsoleSink {
    fn publish(&self, event: &ProgressEvent) -> Result<()> {
        let status = match event.status {
            ProgressStatus::Running => style(event.status.as_str()).cyan(),
            ProgressStatus::Completed => style(event.status.as_str()).green(),
            ProgressStatus::Failed => style(event.status.as_str()).red(),
            ProgressStatus::Skipped => style(event.status.as_str()).yellow(),
        };
        eprintln!("[{}] {}: {}", status, event.step, event.message);
        Ok(())
    }
}

fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();
    let ctx = Context {
        config_path: resolve_config_path(cli.config.as_ref()),
        json: cli.json,
    };

    let result = match cli.command {
        Commands::Install => handle_install(&ctx),
        Commands::Repair => handle_repair(&ctx),
        Commands::Status => handle_status(&ctx),
        Commands::Paths => handle_paths(&ctx),
        Commands::Config { command } => handle_config(&ctx, command),
        Commands::Daemon { command } => handle_daemon(&ctx, command),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn handle_install(ctx: &Context) -> Result<()> {
    let host = Host::load(ctx)?;
    let mut bus = ProgressBus::new().with(JsonLinesSink::new(&host.paths.progress_log));
    if !ctx.json {
        bus.subscribe(ConsoleSink);
    }
    let request = host.cfg.install_request(|name| env::var(name).ok());
    let orchestrator = Orchestrator::new(
        &host.collaborators,
        &host.checkpoints,
        &bus,
        host.writer.clone(),
        &host.paths.receipt,
    );
    let summary = orchestrator.install(&request)?;
    if ctx.json {
        return output(ctx, serde_json::to_value(&summary)?);
    }
    print_install_summary(&summary);
    Ok(())
}

fn print_install_summary(summary: &InstallSummary) {
    if summary.already_complete {
        println!("{}", style("already installed").green());
        return;
    }
    if let Some(step) = summary.resumed_from {
        println!("resumed after checkpoint `{step}`");
    }
    if summary.warnings.is_empty() {
        println!("{}", style("installation complete").green());
        return;
    }
    println!("{}", style("installation complete with warnings").yellow());
    for warning in &summary.warnings {
        println!("  {}: {}", warning.step, warning.message);
    }
    println!("run `clawup repair` to diagnose the failed steps");
}

fn handle_repair(ctx: &Context) -> Result<()> {
    let host = Host::load(ctx)?;
    let runner = RepairRunner::new(
        &host.collaborators,
        &host.checkpoints,
        host.cfg.repair.max_failures,
    );
    let report = runner.repair();
    let failed = report.failures().count();

    if ctx.json {
        let payload = JsonResult {
            ok: report.overall_success,
            error: (!report.overall_success)
                .then(|| format!("{failed} repair checks failed")),
            result: Some(report),
        };
        return print_json(&payload);
    }

    print_repair_report(&report);
    if report.overall_success {
        return Ok(());
    }
    Err(ClawupError::Process(format!(
        "repair found {failed} failing checks"
    )))
}

fn print_repair_report(report: &RepairReport) {
    for step in &report.steps {
        let state = if step.passed {
            style("ok").green()
        } else {
            style("fail").red()
        };
        println!("[{}] {} - {}", state, step.step, step.message);
        if let Some(action) = &step.suggested_action {
            println!("  suggested: {action}");
        }
    }
}

fn handle_status(ctx: &Context) -> Result<()> {
    let host = Host::load(ctx)?;
    let checkpoint = host.checkpoints.get()?;
    let bus = ProgressBus::new();
    let resume_at = Orchestrator::new(
        &host.collaborators,
        &host.checkpoints,
        &bus,
        host.writer.clone(),
        &host.paths.receipt,
    )
    .resume_point()?;
    let daemon = host.collaborators.daemon.status()?;
    output(
        ctx,
        json!({
            "checkpoint": checkpoint,
            "resume_at": resume_at,
            "installed": resume_at.is_none(),
            "daemon": daemon,
        }),
    )
}

fn handle_paths(ctx: &Context) -> Result<()> {
    let cfg = load_config(&ctx.config_path)?;
    let paths = ResolvedPaths::new(&ctx.config_path, &cfg);
    output(
        ctx,
        json!({
            "config_exists": ctx.config_path.exists(),
            "paths": paths,
        }),
    )
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(ctx, json!({"path": ctx.config_path, "created": false}));
            }
            DurableWriter::default().write(&ctx.config_path, default_config_yaml()?)?;
            output(ctx, json!({"path": ctx.config_path, "created": true}))
        }
        ConfigCommand::Show => {
            let cfg = load_config(&ctx.config_path)?;
            if ctx.json {
                return output(ctx, serde_json::to_value(&cfg)?);
            }
            print!("{}", serde_yaml::to_string(&cfg)?);
            Ok(())
        }
        ConfigCommand::Validate => {
            let _cfg = read_config(&ctx.config_path)?;
            output(ctx, json!({"path": ctx.config_path, "valid": true}))
        }
    }
}

fn handle_daemon(ctx: &Context, command: DaemonCommand) -> Result<()> {
    let host = Host::load(ctx)?;
    let daemon = &host.collaborators.daemon;
    match command {
        DaemonCommand::Start => daemon.start()?,
        DaemonCommand::Stop => daemon.stop()?,
        DaemonCommand::Restart => daemon.restart()?,
        DaemonCommand::Status => {}
    }
    let status = daemon.status()?;
    output(ctx, json!({"daemon": status, "pid_file": host.paths.daemon_pid}))
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<()> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&payload)?);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
