use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use voice_relay_core::config::{Config, LoggingConfig, ProviderKind};
use voice_relay_upstream::UpstreamProvider;

#[derive(Parser)]
#[command(
    name = "voice-relay",
    about = "Relay browser WebRTC audio to cloud speech APIs",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the signaling gateway
    Serve {
        /// Port to listen on (default: 3000)
        #[arg(long)]
        port: Option<u16>,

        /// Upstream provider: gemini, openai, or whisper
        #[arg(long)]
        provider: Option<ProviderKind>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show whether a gateway is running
    Status,

    /// Diagnose common issues
    Doctor,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value
    Get { key: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let mut config = Config::load(&config_path)?;

    init_logging(&config.logging(), cli.verbose);

    match cli.command {
        Commands::Serve { port, provider } => {
            if let Some(provider) = provider {
                let mut upstream = config.upstream();
                upstream.provider = provider;
                config.upstream = Some(upstream);
            }
            serve(config, port).await?;
        }
        Commands::Status => status(&config, &config_path).await,
        Commands::Doctor => doctor(&config, &config_path),
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&redacted(&config))?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match redacted(&config).get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("No config value at '{key}'"),
            },
        },
    }

    Ok(())
}

async fn serve(config: Config, port: Option<u16>) -> anyhow::Result<()> {
    let (warnings, errors) = config.validate();
    for w in &warnings {
        tracing::warn!("{w}");
    }
    if !errors.is_empty() {
        for e in &errors {
            tracing::error!("{e}");
        }
        anyhow::bail!("Invalid configuration ({} error(s))", errors.len());
    }

    let port = port.unwrap_or_else(|| config.gateway_port());
    let upstream = config.upstream();
    let provider = voice_relay_upstream::provider_from_config(&upstream)?;
    tracing::info!(
        provider = provider.id(),
        model = upstream.model(),
        input_rate = upstream.input_rate(),
        batch_ms = upstream.batch_ms(),
        "Starting Voice Relay on port {port}"
    );

    let state = voice_relay_gateway::GatewayState::new(config, provider)?;
    voice_relay_gateway::start_gateway(Arc::new(state), port).await
}

async fn status(config: &Config, config_path: &Path) {
    let port = config.gateway_port();
    println!("Voice Relay v{}", env!("CARGO_PKG_VERSION"));
    println!("Config: {}", config_path.display());
    println!("Provider: {}", config.upstream().provider);
    println!("Gateway port: {port}");

    let url = format!("http://127.0.0.1:{port}/health");
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build();
    let health = match client {
        Ok(client) => match client.get(&url).send().await {
            Ok(resp) => resp.json::<serde_json::Value>().await.ok(),
            Err(_) => None,
        },
        Err(_) => None,
    };

    match health {
        Some(body) => {
            println!("Status: running (v{})", body["version"].as_str().unwrap_or("?"));
            println!("Sessions: {}", body["sessions"]);
            for session in body["session_details"].as_array().into_iter().flatten() {
                println!(
                    "  {} {} (since {})",
                    session["id"].as_str().unwrap_or("?"),
                    session["state"].as_str().unwrap_or("?"),
                    session["created_at"].as_str().unwrap_or("?"),
                );
            }
            println!("Serving provider: {}", body["provider"].as_str().unwrap_or("?"));
        }
        None => println!("Status: not running"),
    }
}

fn doctor(config: &Config, config_path: &Path) {
    let mut problems = 0;

    if config_path.exists() {
        println!("[ok]   Config file: {}", config_path.display());
    } else {
        println!("[info] No config file at {}, using defaults", config_path.display());
    }

    let (warnings, errors) = config.validate();
    for w in &warnings {
        println!("[warn] {w}");
    }
    for e in &errors {
        println!("[fail] {e}");
        problems += 1;
    }

    let upstream = config.upstream();
    match upstream.resolve_api_key() {
        Some(_) => println!("[ok]   Credential for {} found", upstream.provider),
        None if upstream.provider.is_duplex() => {
            println!("[fail] No credential for {} (set {})", upstream.provider, upstream.api_key_source())
        }
        None => println!("[info] No credential for {}", upstream.provider),
    }

    match voice_relay_media::codec::OpusEncoder::new(config.media().opus_bitrate) {
        Ok(_) => println!("[ok]   Opus codec available"),
        Err(e) => {
            println!("[fail] Opus codec: {e}");
            problems += 1;
        }
    }

    if problems == 0 {
        println!("\nNo problems found.");
    } else {
        println!("\n{problems} problem(s) found.");
    }
}

/// Copy of the config safe to print.
fn redacted(config: &Config) -> Config {
    let mut config = config.clone();
    if let Some(upstream) = config.upstream.as_mut() {
        if upstream.api_key.is_some() {
            upstream.api_key = Some("********".into());
        }
    }
    config
}

fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose {
        "debug".to_string()
    } else {
        logging.level.clone().unwrap_or_else(|| "info".into())
    };
    let directives = std::iter::once(level)
        .chain(logging.filters.iter().cloned())
        .collect::<Vec<_>>()
        .join(",");

    // RUST_LOG wins unless --verbose was given.
    let filter = if verbose {
        EnvFilter::new(&directives)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives))
    };

    let writer = if logging.output == "stdout" {
        BoxMakeWriter::new(std::io::stdout)
    } else {
        BoxMakeWriter::new(std::io::stderr)
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voice_relay_core::config::UpstreamConfig;

    #[test]
    fn test_serve_args_parse() {
        let cli = Cli::try_parse_from(["voice-relay", "serve", "--port", "4000", "--provider", "openai"])
            .unwrap();
        match cli.command {
            Commands::Serve { port, provider } => {
                assert_eq!(port, Some(4000));
                assert_eq!(provider, Some(ProviderKind::Openai));
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_unknown_provider_rejected() {
        assert!(Cli::try_parse_from(["voice-relay", "serve", "--provider", "nope"]).is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["voice-relay", "doctor", "-v", "-c", "/tmp/x.json"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config.as_deref(), Some("/tmp/x.json"));
    }

    #[test]
    fn test_redacted_hides_api_key() {
        let config = Config {
            upstream: Some(UpstreamConfig {
                api_key: Some("sk-secret".into()),
                ..UpstreamConfig::default()
            }),
            ..Config::default()
        };
        let shown = redacted(&config);
        let value = shown.get_path("upstream.api_key").unwrap();
        assert_eq!(value, "********");
        assert_eq!(config.upstream.unwrap().api_key.as_deref(), Some("sk-secret"));
    }
}
