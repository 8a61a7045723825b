//! StopBrowsing - layered local blocking of distracting websites.
//!
//! Thin front end over `stopbrowsing-core`: parses arguments, sets up
//! logging, loads the config file and dispatches to the session controller.

mod render;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use stopbrowsing_core::{Config, SessionController, SharedRunner, SystemRunner};
use stopbrowsing_server::RedirectServer;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// StopBrowsing - block distracting websites at the DNS and firewall level
#[derive(Parser, Debug)]
#[command(name = "stopbrowsing", version, about)]
struct Args {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Block the domains of a profile
    Block {
        /// Profile to enforce (defaults to the active profile)
        #[arg(long)]
        profile: Option<String>,
    },
    /// Remove every block layer
    Unblock,
    /// Show what is currently enforced
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a profile's domains and exceptions
    List {
        #[arg(long)]
        profile: Option<String>,
    },
    /// Write the newest hosts file backup back
    Restore,
    /// Add domains to a profile
    Add {
        #[arg(required = true)]
        domains: Vec<String>,
        #[arg(long)]
        profile: Option<String>,
    },
    /// Remove domains or exceptions from a profile
    Remove {
        #[arg(required = true)]
        domains: Vec<String>,
        #[arg(long)]
        profile: Option<String>,
    },
    /// Add exception patterns to a profile
    Except {
        #[arg(required = true)]
        patterns: Vec<String>,
        #[arg(long)]
        profile: Option<String>,
    },
    /// List profiles
    Profiles,
    /// Serve the block page for redirected requests
    Serve,
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "stopbrowsing", "stopbrowsing")
        .map(|dirs| dirs.data_dir().join("logs"))
}

/// Initialize logging with file rotation.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("stopbrowsing={},warn", log_level)));

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("stopbrowsing")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                // Console goes to stderr so `status --json` stays clean.
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::debug!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

fn config_path(args: &Args) -> Result<PathBuf> {
    match &args.config {
        Some(path) => Ok(path.clone()),
        None => Config::default_path().context("could not determine the config directory"),
    }
}

fn controller(config: &Config) -> SessionController {
    let runner: SharedRunner = Arc::new(SystemRunner::new(config.elevation));
    SessionController::from_config(config, runner)
}

fn edit_profile<F>(config: &mut Config, path: &Path, profile: Option<String>, edit: F) -> Result<()>
where
    F: FnOnce(&mut stopbrowsing_core::Profile, &str) -> Result<()>,
{
    let name = profile.unwrap_or_else(|| config.active_profile.clone());
    edit(config.profile_mut(&name), &name)?;
    config
        .save(path)
        .with_context(|| format!("failed to save {}", path.display()))
}

fn run(args: Args) -> Result<ExitCode> {
    let path = config_path(&args)?;
    let mut config =
        Config::load(&path).with_context(|| format!("failed to load {}", path.display()))?;

    match args.command {
        Command::Block { profile } => {
            let ctx = config.session_context(profile.as_deref())?;
            let report = controller(&config).block(&ctx)?;
            print!("{}", render::block_report(&report));
            if !report.is_success() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Unblock => {
            let report = controller(&config).unblock()?;
            print!("{}", render::unblock_report(&report));
            if !report.is_success() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Status { json } => {
            let status = controller(&config).status();
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print!("{}", render::status(&status));
            }
        }
        Command::List { profile } => {
            let name = profile.unwrap_or_else(|| config.active_profile.clone());
            print!("{}", render::profile(&name, config.profile(&name)?));
        }
        Command::Restore => {
            let restored = controller(&config).restore()?;
            println!("Restored hosts file from {}", restored.display());
        }
        Command::Add { domains, profile } => {
            edit_profile(&mut config, &path, profile, |p, name| {
                for domain in &domains {
                    if p.add_domain(domain)? {
                        println!("Added {domain} to {name}");
                    } else {
                        println!("{domain} is already in {name}");
                    }
                }
                Ok(())
            })?;
        }
        Command::Remove { domains, profile } => {
            edit_profile(&mut config, &path, profile, |p, name| {
                for domain in &domains {
                    if p.remove(domain) {
                        println!("Removed {domain} from {name}");
                    } else {
                        println!("{domain} is not in {name}");
                    }
                }
                Ok(())
            })?;
        }
        Command::Except { patterns, profile } => {
            edit_profile(&mut config, &path, profile, |p, name| {
                for pattern in &patterns {
                    if p.add_exception(pattern)? {
                        println!("Added exception {pattern} to {name}");
                    } else {
                        println!("Exception {pattern} is already in {name}");
                    }
                }
                Ok(())
            })?;
        }
        Command::Profiles => {
            for (name, profile) in &config.profiles {
                let marker = if *name == config.active_profile { "*" } else { " " };
                println!("{marker} {name} ({} domains)", profile.domains.len());
            }
        }
        Command::Serve => {
            let server = RedirectServer::new(config.redirect.clone())?;
            tokio::runtime::Runtime::new()
                .context("failed to start async runtime")?
                .block_on(server.run())?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let args = Args::parse();
    let _log_guard = init_logging(&args);

    match run(args) {
        Ok(code) => code,
        Err(e) => {
            tracing::debug!("command failed: {:?}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = Args::parse_from(["stopbrowsing", "status", "--json", "--debug"]);
        assert!(args.debug);
        assert!(matches!(args.command, Command::Status { json: true }));
    }

    #[test]
    fn test_block_profile() {
        let args = Args::parse_from([
            "stopbrowsing",
            "--config",
            "/tmp/c.json",
            "block",
            "--profile",
            "work",
        ]);
        assert_eq!(args.config, Some(PathBuf::from("/tmp/c.json")));
        match args.command {
            Command::Block { profile } => assert_eq!(profile.as_deref(), Some("work")),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_add_requires_domain() {
        assert!(Args::try_parse_from(["stopbrowsing", "add"]).is_err());
    }
}
