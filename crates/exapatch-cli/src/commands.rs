use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::debug;

use exapatch_agent::{Collaborators, PatchOrchestrator, PatchRequest};
use exapatch_core::config::PatchConfig;
use exapatch_core::observability::{self, LogFormat};
use exapatch_core::outcome::PatchOutcome;
use exapatch_core::target::TargetKind;
use exapatch_core::version;
use exapatch_runtime::executor::SshExecutor;
use exapatch_runtime::ledger_store::{ledger_path, load_ledger};
use exapatch_runtime::sink::FileStatusSink;

use crate::ui;

#[derive(Parser)]
#[command(
    name = "exapatch",
    version,
    about = "Rolling patch orchestration for Exadata infrastructure"
)]
struct Cli {
    /// Log format: human or json
    #[arg(long, global = true, default_value = "human")]
    log_format: String,

    /// Engine config (TOML); built-in defaults when omitted
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a patch request to completion and print its outcome as JSON
    Run {
        /// Request file (JSON)
        #[arg(long, short = 'r')]
        request: PathBuf,
        /// Directory for status snapshots (overrides engine.status_dir)
        #[arg(long)]
        status_dir: Option<PathBuf>,
    },
    /// Validate a request file and show what it would operate on
    RequestCheck {
        #[arg(long, short = 'r')]
        request: PathBuf,
    },
    /// Validate the config and print the effective settings
    ConfigCheck,
    /// Compare two dotted versions
    VersionCompare { a: String, b: String },
    /// Inspect the replicated progress ledger
    Ledger {
        #[command(subcommand)]
        action: LedgerCmd,
    },
}

#[derive(Subcommand)]
enum LedgerCmd {
    /// Print the first readable ledger replica
    Show {
        /// Target kind: dom0, domu, cell, ibswitch, roceswitch
        #[arg(long)]
        kind: String,
        /// Hosts holding replicas, tried in order
        #[arg(long, value_delimiter = ',', required = true)]
        hosts: Vec<String>,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let log_format: LogFormat = cli.log_format.parse()?;
    observability::init(log_format);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            request,
            status_dir,
        } => cmd_run(&config, &request, status_dir),
        Commands::RequestCheck { request } => cmd_request_check(&request),
        Commands::ConfigCheck => cmd_config_check(&config),
        Commands::VersionCompare { a, b } => cmd_version_compare(&a, &b),
        Commands::Ledger { action } => match action {
            LedgerCmd::Show { kind, hosts } => cmd_ledger_show(&config, &kind, &hosts),
        },
    }
}

fn load_config(path: Option<&Path>) -> Result<PatchConfig> {
    match path {
        Some(p) => PatchConfig::from_file(p),
        None => Ok(PatchConfig::default()),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")
}

// ============================================================================
// Command handlers
// ============================================================================

fn cmd_run(config: &PatchConfig, request: &Path, status_dir: Option<PathBuf>) -> Result<()> {
    let req = PatchRequest::from_file(request)?;
    debug!(request = %request.display(), request_id = %req.request_id, "Loaded request");
    let exec = Arc::new(SshExecutor::new(
        config.engine.ssh_user.clone(),
        config.command_timeout(),
    ));
    let sink = Arc::new(FileStatusSink::new(
        status_dir.unwrap_or_else(|| config.engine.status_dir.clone()),
    ));
    let deps = Collaborators::over_executor(exec, config, sink);
    let mut orchestrator = PatchOrchestrator::new(config.clone(), deps);

    ui::info(&format!(
        "{} {} on {} node(s), request {}",
        req.target_kind,
        req.operation,
        req.selected_nodes().len(),
        req.request_id
    ));

    let outcome = runtime()?.block_on(orchestrator.run(&req));

    ui::json(&json!({
        "request_id": req.request_id,
        "outcome": outcome.report(),
        "summary": orchestrator.summary(),
        "phases": orchestrator.phases(),
    }))?;

    match outcome {
        PatchOutcome::Success => {
            ui::success("Operation completed");
            Ok(())
        }
        PatchOutcome::NoActionRequired => {
            ui::success("Nothing to do: every node is already in the requested state");
            Ok(())
        }
        PatchOutcome::Failure(e) => {
            if !e.suggestion.is_empty() {
                ui::warn(&e.suggestion);
            }
            bail!("{} failed with {}: {}", req.operation, e.code.hex(), e.message)
        }
    }
}

fn cmd_request_check(request: &Path) -> Result<()> {
    let req = PatchRequest::from_file(request)?;
    ui::json(&json!({
        "request_id": req.request_id,
        "target_kind": req.target_kind,
        "operation": req.operation,
        "selected_nodes": req.selected_nodes(),
        "style": req.style.resolve(req.target_kind),
        "bundle": req.bundle_name(),
        "ledger_replicas": req.ledger_replicas(),
    }))?;
    ui::success("Request is valid");
    Ok(())
}

fn cmd_config_check(config: &PatchConfig) -> Result<()> {
    config.validate()?;
    ui::json(&serde_json::to_value(config)?)?;
    ui::success("Config is valid");
    Ok(())
}

fn cmd_version_compare(a: &str, b: &str) -> Result<()> {
    let word = match version::compare(a, b) {
        Some(Ordering::Less) => "less",
        Some(Ordering::Equal) => "equal",
        Some(Ordering::Greater) => "greater",
        None => bail!("'{}' and '{}' are not comparable dotted versions", a, b),
    };
    println!("{}", word);
    Ok(())
}

fn cmd_ledger_show(config: &PatchConfig, kind: &str, hosts: &[String]) -> Result<()> {
    let kind: TargetKind = kind.parse()?;
    let exec = SshExecutor::new(config.engine.ssh_user.clone(), config.command_timeout());
    let path = ledger_path(&config.engine.remote_root, kind);

    match runtime()?.block_on(load_ledger(&exec, &path, hosts)) {
        Some((host, doc)) => {
            ui::info(&format!("Ledger {} read from {}", path, host));
            ui::json(&serde_json::to_value(&doc)?)
        }
        None => bail!("No readable ledger at {} on {}", path, hosts.join(", ")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_ledger_hosts_split_on_commas() {
        let cli = Cli::try_parse_from([
            "exapatch", "ledger", "show", "--kind", "dom0", "--hosts", "db1,db2",
        ])
        .unwrap();
        match cli.command {
            Commands::Ledger {
                action: LedgerCmd::Show { kind, hosts },
            } => {
                assert_eq!(kind, "dom0");
                assert_eq!(hosts, vec!["db1".to_string(), "db2".to_string()]);
            }
            _ => panic!("expected ledger show"),
        }
    }

    #[test]
    fn test_missing_config_file_uses_defaults() {
        let config = load_config(None).unwrap();
        assert!(config.validate().is_ok());
    }
}
