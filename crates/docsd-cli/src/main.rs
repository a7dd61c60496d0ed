mod generator;

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use docsd_core::config::DocsdConfig;
use docsd_core::git_remote::GitRemoteHeadChecker;
use docsd_core::livereload::BroadcastLiveReloadHub;
use docsd_core::{Daemon, DaemonDeps, DaemonPaths};

use generator::ExternalProcessGenerator;

#[derive(Parser, Debug)]
#[command(name = "docsd", version)]
#[command(about = "Documentation build daemon: watches repositories, debounces change signals, and drives a staged build pipeline")]
struct Cli {
    /// Path to `docsd.toml`.
    #[arg(long, default_value = "docsd.toml", global = true)]
    config: PathBuf,

    /// Directory for persisted daemon state (daemon-state.json, remote-head cache).
    #[arg(long, default_value = ".docsd", global = true)]
    state_dir: PathBuf,

    /// External command invoked to actually clone and render the site.
    /// Receives a JSON invocation on stdin, must print a JSON `BuildReport` on stdout.
    #[arg(long, default_value = "docsd-generate", global = true)]
    generator_command: String,

    /// Arguments passed to the generator command, in order.
    #[arg(long = "generator-arg", global = true)]
    generator_args: Vec<String>,

    /// Timeout for a single generator invocation.
    #[arg(long, default_value = "10m", global = true)]
    generator_timeout: String,

    /// Log filter, e.g. `info`, `docsd_core=debug`. Falls back to `RUST_LOG`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon until interrupted (Ctrl-C or SIGTERM).
    Run {
        /// How long to wait for in-flight builds to finish on shutdown.
        #[arg(long, default_value = "30s")]
        drain_timeout: String,
    },
    /// Enqueue one manual build and wait for it to finish.
    Trigger {
        /// How long to poll for completion before giving up.
        #[arg(long, default_value = "10m")]
        wait_timeout: String,
    },
    /// Print the persisted daemon state as JSON.
    Status,
    /// Validate configuration and check external dependencies.
    Doctor,
}

fn init_tracing(log_level: Option<&str>) {
    use tracing_subscriber::EnvFilter;

    let filter = log_level
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s).with_context(|| format!("invalid duration: {s}"))
}

fn build_deps(cli: &Cli) -> Result<DaemonDeps> {
    let timeout = parse_duration(&cli.generator_timeout)?;
    Ok(DaemonDeps {
        generator: Arc::new(ExternalProcessGenerator::new(
            cli.generator_command.clone(),
            cli.generator_args.clone(),
            timeout,
        )),
        remote_head_checker: Arc::new(GitRemoteHeadChecker::default()),
        livereload: Arc::new(BroadcastLiveReloadHub::default()),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    match &cli.cmd {
        Commands::Run { drain_timeout } => run(&cli, drain_timeout).await,
        Commands::Trigger { wait_timeout } => trigger(&cli, wait_timeout).await,
        Commands::Status => status(&cli).await,
        Commands::Doctor => doctor(&cli).await,
    }
}

async fn run(cli: &Cli, drain_timeout: &str) -> Result<()> {
    let drain_timeout = parse_duration(drain_timeout)?;
    let config = DocsdConfig::load(&cli.config).context("loading docsd.toml")?;
    std::fs::create_dir_all(&cli.state_dir).context("creating state directory")?;
    let deps = build_deps(cli)?;

    let daemon = Daemon::spawn(config, DaemonPaths::new(cli.state_dir.clone()), deps);
    tracing::info!("docsd running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown signal received, draining in-flight builds");

    daemon.stop(drain_timeout).await;
    Ok(())
}

async fn trigger(cli: &Cli, wait_timeout: &str) -> Result<()> {
    let wait_timeout = parse_duration(wait_timeout)?;
    let config = DocsdConfig::load(&cli.config).context("loading docsd.toml")?;
    std::fs::create_dir_all(&cli.state_dir).context("creating state directory")?;
    let deps = build_deps(cli)?;

    let daemon = Daemon::spawn(config, DaemonPaths::new(cli.state_dir.clone()), deps);
    let job_id = daemon
        .trigger_manual_build()
        .context("enqueuing manual build")?;
    println!("triggered job: {job_id}");

    let deadline = tokio::time::Instant::now() + wait_timeout;
    let outcome = loop {
        if tokio::time::Instant::now() >= deadline {
            break None;
        }
        match daemon.job_snapshot(&job_id) {
            Some(snapshot) if is_terminal(snapshot.status) => break Some(snapshot),
            _ => tokio::time::sleep(Duration::from_millis(200)).await,
        }
    };

    daemon.stop(Duration::from_secs(5)).await;

    match outcome {
        Some(snapshot) => {
            println!("status: {:?}", snapshot.status);
            for (repo, reason) in &snapshot.repo_reasons {
                println!("  {repo}: {reason}");
            }
            if snapshot.status == docsd_types::JobStatus::Failed {
                anyhow::bail!("build job {job_id} failed");
            }
            Ok(())
        }
        None => anyhow::bail!("timed out waiting for job {job_id} to finish"),
    }
}

fn is_terminal(status: docsd_types::JobStatus) -> bool {
    matches!(
        status,
        docsd_types::JobStatus::Completed | docsd_types::JobStatus::Failed
    )
}

async fn status(cli: &Cli) -> Result<()> {
    let path = DaemonPaths::new(cli.state_dir.clone()).state_file();
    if !path.exists() {
        println!("no persisted state at {}", path.display());
        return Ok(());
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading state file at {}", path.display()))?;
    let parsed: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("parsing state file at {}", path.display()))?;
    println!("{}", serde_json::to_string_pretty(&parsed)?);
    Ok(())
}

async fn doctor(cli: &Cli) -> Result<()> {
    match DocsdConfig::load(&cli.config) {
        Ok(config) => {
            println!("config: ok ({} repositories configured)", config.repositories.len());
        }
        Err(e) => {
            println!("config: error: {e}");
        }
    }

    match std::fs::create_dir_all(&cli.state_dir) {
        Ok(()) => println!("state_dir: {} (writable)", cli.state_dir.display()),
        Err(e) => println!("state_dir: {} (not writable: {e})", cli.state_dir.display()),
    }

    print_cmd_version("git");
    println!("generator_command: {}", cli.generator_command);

    Ok(())
}

fn print_cmd_version(cmd: &str) {
    match Command::new(cmd).arg("--version").output() {
        Ok(o) if o.status.success() => {
            let s = String::from_utf8_lossy(&o.stdout).trim().to_string();
            println!("{cmd}: {s}");
        }
        Ok(o) => {
            println!(
                "{cmd}: --version failed: {}",
                String::from_utf8_lossy(&o.stderr).trim()
            );
        }
        Err(e) => {
            println!("{cmd}: unable to run --version: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_handles_valid_and_invalid_inputs() {
        assert!(parse_duration("10m").is_ok());
        assert!(parse_duration("nonsense").is_err());
    }

    #[test]
    fn cli_parses_run_subcommand_with_defaults() {
        let cli = Cli::parse_from(["docsd", "run"]);
        assert_eq!(cli.config, PathBuf::from("docsd.toml"));
        assert_eq!(cli.state_dir, PathBuf::from(".docsd"));
        match cli.cmd {
            Commands::Run { drain_timeout } => assert_eq!(drain_timeout, "30s"),
            other => panic!("expected Run, got {other:?}"),
        }
    }

    #[test]
    fn cli_parses_generator_args_repeated_flag() {
        let cli = Cli::parse_from([
            "docsd",
            "--generator-command",
            "my-gen",
            "--generator-arg",
            "--verbose",
            "--generator-arg",
            "--fast",
            "trigger",
        ]);
        assert_eq!(cli.generator_command, "my-gen");
        assert_eq!(cli.generator_args, vec!["--verbose", "--fast"]);
    }

    #[test]
    fn print_cmd_version_does_not_panic_on_missing_command() {
        print_cmd_version("definitely-not-a-real-docsd-command");
    }

    // `doctor` drives `DocsdConfig::load`, which reads `DOCSD_*` overrides
    // straight out of the real process environment. Guarded with `#[serial]`
    // since that environment is global state shared by every test in this
    // binary.
    #[tokio::test]
    #[serial_test::serial]
    async fn doctor_succeeds_with_valid_config_and_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("docsd.toml");
        std::fs::write(
            &config_path,
            r#"
[[repositories]]
name = "repo"
clone_url = "https://example.com/org/repo.git"
branch = "main"
"#,
        )
        .unwrap();
        let state_dir = dir.path().join("state");

        let cli = Cli::parse_from([
            "docsd",
            "--config",
            config_path.to_str().unwrap(),
            "--state-dir",
            state_dir.to_str().unwrap(),
            "doctor",
        ]);

        unsafe { std::env::set_var("DOCSD_OUTPUT_CLEAN", "true") };
        let result = doctor(&cli).await;
        unsafe { std::env::remove_var("DOCSD_OUTPUT_CLEAN") };

        assert!(result.is_ok());
        assert!(state_dir.is_dir());
    }

    #[tokio::test]
    async fn status_reports_absence_of_state_file_without_erroring() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::parse_from([
            "docsd",
            "--state-dir",
            dir.path().to_str().unwrap(),
            "status",
        ]);
        status(&cli).await.unwrap();
    }
}
