//! # Watcher bridge daemon (`watcherd`)
//!
//! The `watcherd` binary runs the SenseCAP Watcher ↔ Home Assistant bridge
//! and provides a few maintenance commands for debugging an installation.
//!
//! ## Usage
//!
//! ```bash
//! watcherd --options /data/options.json <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `watcherd run` | Start the bridge daemon (the add-on entry point) |
//! | `watcherd check-config` | Load and validate options, print a masked summary |
//! | `watcherd entities` | Print the MQTT Discovery payloads as JSON |
//! | `watcherd analyze <image>` | Run a one-shot vision analysis against the configured provider |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use watcher_bridge::config::{self, mask};
use watcher_bridge::{bridge, entities, llm};

/// SenseCAP Watcher bridge: connects the Watcher device to Home Assistant
/// via MQTT and forwards camera snapshots to an LLM for scene description.
#[derive(Parser)]
#[command(
    name = "watcherd",
    about = "SenseCAP Watcher to Home Assistant bridge",
    version
)]
struct Cli {
    /// Path to the add-on options file (JSON).
    #[arg(long, global = true, default_value = "/data/options.json")]
    options: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge daemon.
    ///
    /// Resolves MQTT credentials (Supervisor API, then environment, then
    /// defaults), registers all Home Assistant entities via MQTT Discovery,
    /// and serves the device WebSocket and OTA/vision HTTP endpoints until
    /// SIGTERM.
    Run,

    /// Validate the options file and print a summary.
    ///
    /// Secrets are masked. Exits nonzero when validation fails, which makes
    /// it usable as a container health gate.
    CheckConfig,

    /// Print every MQTT Discovery payload as JSON.
    ///
    /// Useful for checking what Home Assistant will see without a broker.
    Entities,

    /// Analyze an image file with the configured LLM provider.
    ///
    /// Bypasses MQTT and the device entirely — reads a JPEG from disk, sends
    /// it to the provider, prints the description and confidence.
    Analyze {
        /// Path to a JPEG image.
        image: PathBuf,

        /// Override the analysis prompt.
        #[arg(long)]
        prompt: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let options = config::load_options(&cli.options)?;

    init_tracing(&options.log_level);

    match cli.command {
        Commands::Run => {
            bridge::run(options).await?;
        }
        Commands::CheckConfig => {
            println!("Options file: {}", cli.options.display());
            println!("llm_provider:         {}", options.llm_provider);
            println!("claude_model:         {}", options.claude_model);
            println!("claude_proxy_url:     {}", options.claude_proxy_url);
            println!("claude_proxy_key:     {}", mask(&options.claude_proxy_key));
            println!("claude_fallback_url:  {}", options.claude_fallback_url);
            println!(
                "claude_fallback_key:  {}",
                mask(&options.claude_fallback_key)
            );
            println!("ollama_url:           {}", options.ollama_url);
            println!("ollama_model:         {}", options.ollama_model);
            println!("ollama_vision_model:  {}", options.ollama_vision_model);
            println!("yandex_api_key:       {}", mask(&options.yandex_api_key));
            println!("monitoring_interval:  {}s", options.monitoring_interval);
            println!("confidence_threshold: {}", options.confidence_threshold);
            println!("websocket_port:       {}", options.websocket_port);
            println!("ota_port:             {}", options.ota_port);
            println!("snapshot_dir:         {}", options.snapshot_dir);
            println!("Configuration OK.");
        }
        Commands::Entities => {
            for entity in entities::entity_configs() {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "topic": entities::discovery_topic(entity.component, entity.object_id),
                        "config": entity.config,
                    }))?
                );
            }
            for (topic, config) in entities::event_configs() {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "topic": topic,
                        "config": config,
                    }))?
                );
            }
        }
        Commands::Analyze { image, prompt } => {
            let provider = llm::create_provider(&options)?;
            let frame = std::fs::read(&image)?;
            let prompt = prompt.unwrap_or_else(|| {
                watcher_bridge::monitoring::DEFAULT_ANALYSIS_PROMPT.to_string()
            });

            println!("Provider: {}", provider.name());
            let analysis = provider.vision(&frame, &prompt).await?;
            println!("Confidence: {:.2}", analysis.confidence);
            println!("{}", analysis.description);
        }
    }

    Ok(())
}

/// Log filtering: `RUST_LOG` wins, else the options' `log_level`.
fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("watcher_bridge={0},watcherd={0}", log_level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
