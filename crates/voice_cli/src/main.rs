//! voicectl
//!
//! Inspect voice orchestrator configurations without starting any provider.

#![allow(clippy::print_stdout)]

mod plan;

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voice_orchestrator::{OrchestratorConfig, SelectionRequest, SelectionStrategy};
use voice_provider::{OperationKind, ProviderId};

/// Voice orchestrator CLI
#[derive(Parser)]
#[command(name = "voicectl")]
#[command(author, version, about = "Voice provider orchestrator tooling", long_about = None)]
struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (TOML); `VOICE_ORCHESTRATOR__*` variables override it
    #[arg(short, long, env = "VOICECTL_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a configuration
    ///
    /// Example: voicectl validate --config orchestrator.toml
    Validate,

    /// Print the default configuration as TOML
    Defaults,

    /// Print the candidate order a freshly started orchestrator would use
    ///
    /// Example: voicectl plan stt --strategy fast --config orchestrator.toml
    Plan {
        /// Operation to plan for
        #[arg(value_enum)]
        operation: OperationArg,

        /// Ranking strategy (defaults to `selection.strategy`)
        #[arg(short, long, value_enum)]
        strategy: Option<StrategyArg>,

        /// Prefer local deployments on ties
        #[arg(long)]
        prefer_local: Option<bool>,

        /// Move this provider to the front if it is eligible
        #[arg(long)]
        provider: Option<String>,

        /// Only consider providers that support this language
        #[arg(long)]
        language: Option<String>,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OperationArg {
    Stt,
    Tts,
}

impl From<OperationArg> for OperationKind {
    fn from(arg: OperationArg) -> Self {
        match arg {
            OperationArg::Stt => Self::Stt,
            OperationArg::Tts => Self::Tts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StrategyArg {
    Fast,
    Accurate,
    Cheap,
    Balanced,
}

impl From<StrategyArg> for SelectionStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Fast => Self::Fast,
            StrategyArg::Accurate => Self::Accurate,
            StrategyArg::Cheap => Self::Cheap,
            StrategyArg::Balanced => Self::Balanced,
        }
    }
}

/// Determine log filter level from verbosity count
const fn log_filter_from_verbosity(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<OrchestratorConfig> {
    if let Some(path) = path {
        if !path.exists() {
            bail!("Configuration file not found: {}", path.display());
        }
    }
    debug!(path = ?path, "Loading configuration");
    OrchestratorConfig::load(path).context("Invalid configuration")
}

fn build_request(
    strategy: Option<StrategyArg>,
    prefer_local: Option<bool>,
    provider: Option<&str>,
    language: Option<String>,
) -> anyhow::Result<SelectionRequest> {
    let mut request = SelectionRequest::new();
    if let Some(strategy) = strategy {
        request = request.with_strategy(strategy.into());
    }
    if let Some(prefer_local) = prefer_local {
        request = request.with_prefer_local(prefer_local);
    }
    if let Some(provider) = provider {
        let provider_id = ProviderId::parse(provider)
            .with_context(|| format!("Invalid provider id '{provider}'"))?;
        request = request.with_provider(provider_id);
    }
    if let Some(language) = language {
        request = request.with_language(language);
    }
    Ok(request)
}

fn describe(config: &OrchestratorConfig) -> String {
    let mut lines = vec![format!("✅ Configuration valid: {} provider(s)", config.providers.len())];
    for provider in &config.providers {
        let state = if provider.enabled { "" } else { ", disabled" };
        lines.push(format!(
            "   - {} ({}, {}, priority {}{state})",
            provider.id, provider.kind, provider.deployment_mode, provider.priority
        ));
    }
    for operation in [OperationKind::Stt, OperationKind::Tts] {
        if let Some(chain) = config.fallback_chains.for_operation(operation) {
            let chain: Vec<String> = chain.iter().map(ToString::to_string).collect();
            lines.push(format!("   {operation} chain: {}", chain.join(" → ")));
        }
    }
    lines.join("\n")
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays machine-readable
    let filter = log_filter_from_verbosity(cli.verbose);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Validate => {
            let config = load_config(cli.config.as_deref())?;
            println!("{}", describe(&config));
        },

        Commands::Defaults => {
            let rendered = toml::to_string_pretty(&OrchestratorConfig::default())
                .context("Failed to render default configuration")?;
            println!("{rendered}");
        },

        Commands::Plan {
            operation,
            strategy,
            prefer_local,
            provider,
            language,
            json,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let request = build_request(strategy, prefer_local, provider.as_deref(), language)?;
            let selection = plan::static_plan(&config, operation.into(), &request)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&selection)?);
            } else {
                print!("{}", plan::render(&config, &selection));
            }
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_filter_verbosity_levels() {
        assert_eq!(log_filter_from_verbosity(0), "warn");
        assert_eq!(log_filter_from_verbosity(1), "info");
        assert_eq!(log_filter_from_verbosity(2), "debug");
        assert_eq!(log_filter_from_verbosity(7), "trace");
    }

    #[test]
    fn parses_plan_arguments() {
        let cli = Cli::try_parse_from([
            "voicectl", "-vv", "plan", "tts", "--strategy", "cheap", "--json",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Plan {
                operation,
                strategy,
                json,
                ..
            } => {
                assert_eq!(operation, OperationArg::Tts);
                assert_eq!(strategy, Some(StrategyArg::Cheap));
                assert!(json);
            },
            _ => panic!("expected plan command"),
        }
    }

    #[test]
    fn unknown_operation_is_rejected() {
        assert!(Cli::try_parse_from(["voicectl", "plan", "translate"]).is_err());
    }

    #[test]
    fn request_carries_overrides() {
        let request = build_request(
            Some(StrategyArg::Fast),
            Some(false),
            Some("deepgram"),
            Some("de".to_string()),
        )
        .unwrap();
        assert_eq!(request.strategy, Some(SelectionStrategy::Fast));
        assert_eq!(request.prefer_local, Some(false));
        assert_eq!(request.provider_id, Some(ProviderId::parse("deepgram").unwrap()));
        assert_eq!(request.language.as_deref(), Some("de"));
    }

    #[test]
    fn invalid_provider_id_is_reported() {
        let err = build_request(None, None, Some("no spaces allowed"), None).unwrap_err();
        assert!(err.to_string().contains("no spaces allowed"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("missing.toml"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn describe_lists_providers() {
        let config: OrchestratorConfig = toml::from_str(
            r#"
            [[providers]]
            id = "piper"
            kind = "tts"
            deployment_mode = "system"
            priority = 1
            enabled = false
            "#,
        )
        .unwrap();
        let text = describe(&config);
        assert!(text.contains("1 provider(s)"));
        assert!(text.contains("piper (tts, system, priority 1, disabled)"));
    }
}
