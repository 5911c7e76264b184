// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod logger;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use siem_agent_core::identity::resolve;
use siem_agent_core::{
    AgentError, BuildInfo, Orchestrator, OrchestratorOptions, ShutdownReport, SignalGateway,
};
use siem_agent_stages::config::{self, ConfigError};
use siem_agent_stages::AgentPipeline;
use tracing::{debug, error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "siem-agent")]
#[command(about = "SIEM host agent for log collection and monitoring", long_about = None)]
#[command(disable_version_flag = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Run as daemon: timestamped, uncolored log lines
    #[arg(short, long)]
    daemon: bool,

    /// Agent ID (auto-generated if not provided)
    #[arg(short = 'i', long)]
    agent_id: Option<String>,

    /// Print version
    #[arg(short = 'V', long, action = ArgAction::SetTrue)]
    version: bool,
}

#[derive(Debug, thiserror::Error)]
enum RunError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Agent(#[from] AgentError),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let build = BuildInfo::current();

    if cli.version {
        println!("siem-agent {build}");
        return ExitCode::SUCCESS;
    }

    if let Err(e) = logger::init(&cli.log_level, cli.daemon) {
        eprintln!("siem-agent: {e}");
        return ExitCode::FAILURE;
    }
    debug!("Logging subsystem enabled");

    match run(&cli, build).await {
        Ok(report) => exit_code(&report),
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli, build: BuildInfo) -> Result<ShutdownReport, RunError> {
    let config = config::load(cli.config.as_deref())?;
    if let Some(path) = &cli.config {
        info!(config = %path.display(), "Configuration loaded");
    }

    let identity = resolve(cli.agent_id.as_deref());
    let gateway = SignalGateway::install().map_err(AgentError::Signal)?;
    let options = OrchestratorOptions {
        shutdown_timeout: config.shutdown_timeout(),
    };

    let orchestrator = Orchestrator::new(AgentPipeline::new(config), identity, build, options);
    Ok(orchestrator.run(gateway).await?)
}

fn exit_code(report: &ShutdownReport) -> ExitCode {
    if !report.is_clean() {
        warn!(
            stop_errors = report.stop_errors.len(),
            unconfirmed = report.unconfirmed.len(),
            "Agent did not shut down cleanly"
        );
    }
    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_short_flags() {
        let cli = Cli::try_parse_from([
            "siem-agent",
            "-c",
            "/etc/siem/agent.yaml",
            "-l",
            "debug",
            "-d",
            "-i",
            "web-01",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("/etc/siem/agent.yaml")));
        assert_eq!(cli.log_level, "debug");
        assert!(cli.daemon);
        assert_eq!(cli.agent_id.as_deref(), Some("web-01"));
        assert!(!cli.version);
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["siem-agent"]).unwrap();

        assert!(cli.config.is_none());
        assert_eq!(cli.log_level, "info");
        assert!(!cli.daemon);
        assert!(cli.agent_id.is_none());
    }

    #[test]
    fn test_version_flag() {
        assert!(Cli::try_parse_from(["siem-agent", "--version"]).unwrap().version);
        assert!(Cli::try_parse_from(["siem-agent", "-V"]).unwrap().version);
    }

    #[tokio::test]
    async fn test_missing_config_file_fails_before_start() {
        let cli = Cli::try_parse_from(["siem-agent", "-c", "/nonexistent/agent.yaml"]).unwrap();

        let err = run(&cli, BuildInfo::current()).await.unwrap_err();
        assert!(matches!(err, RunError::Config(ConfigError::MissingFile(_))));
    }
}
