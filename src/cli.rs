//! Command-line entry point: `voicebridge serve` stands up the WebSocket
//! server; `voicebridge config` inspects the on-disk configuration.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::capability::registry::CapabilityRegistry;
use crate::capability::Capability;
use crate::config::Config;
use crate::error::ConversationError;

#[derive(Parser)]
#[command(name = "voicebridge")]
#[command(about = "Real-time voice conversation server (VAD -> ASR -> LLM -> TTS)", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the WebSocket conversation server
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
        /// Path to the YAML config file (default: platform config dir)
        #[arg(short, long)]
        config: Option<String>,
    },
    /// Show the current configuration with sensitive fields masked
    Config {
        /// Path to the YAML config file (default: platform config dir)
        #[arg(short, long)]
        config: Option<String>,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None => serve(None, None, None).await,
        Some(Commands::Serve { host, port, config }) => serve(host, port, config).await,
        Some(Commands::Config { config }) => {
            let path = resolve_config_path(config)?;
            let config = load_or_default(&path)?;
            let snapshot = config.masked_snapshot();
            println!("{}", serde_yaml::to_string(&snapshot)?);
            Ok(())
        }
    }
}

fn resolve_config_path(explicit: Option<String>) -> Result<std::path::PathBuf> {
    match explicit {
        Some(path) => Ok(std::path::PathBuf::from(path)),
        None => Config::default_path(),
    }
}

fn load_or_default(path: &std::path::Path) -> Result<Config> {
    if path.exists() {
        Config::load(path)
    } else {
        Ok(Config::default())
    }
}

async fn serve(host: Option<String>, port: Option<u16>, config_path: Option<String>) -> Result<()> {
    let path = resolve_config_path(config_path)?;
    let mut config = load_or_default(&path)?;

    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let capabilities = build_registry(&config).await.context("failed to build capability registry from config")?;
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let shutdown_capabilities = Arc::clone(&capabilities);
    let state = crate::protocol::ServerState::new(capabilities, config);
    let router = crate::protocol::router(state);

    info!(%addr, "starting voicebridge server");
    let listener = tokio::net::TcpListener::bind(&addr).await.with_context(|| format!("failed to bind {addr}"))?;
    let result = axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await;

    close_registry(&shutdown_capabilities).await;
    result.context("server exited with an error")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received, closing capability modules");
}

/// Process startup initializes all four capability roles (`setup()`); this is
/// the matching `close()` pass run once, at shutdown, before the process
/// exits.
async fn close_registry(registry: &CapabilityRegistry) {
    if let Some(vad) = registry.vad().await {
        if let Err(e) = vad.close().await {
            tracing::warn!(error = %e, "vad close failed");
        }
    }
    if let Some(asr) = registry.asr().await {
        if let Err(e) = asr.close().await {
            tracing::warn!(error = %e, "asr close failed");
        }
    }
    if let Some(llm) = registry.llm().await {
        if let Err(e) = llm.close().await {
            tracing::warn!(error = %e, "llm close failed");
        }
    }
    if let Some(tts) = registry.tts().await {
        if let Err(e) = tts.close().await {
            tracing::warn!(error = %e, "tts close failed");
        }
    }
}

/// Instantiate the four capability roles from `config.modules`, matched by
/// `adapter_type`. A role with no entry (or `enabled: false`) is left unset;
/// ASR is the only role the protocol server requires at connection time.
async fn build_registry(config: &Config) -> Result<Arc<CapabilityRegistry>> {
    let registry = CapabilityRegistry::new();

    if let Some(module) = active_module(config, "vad") {
        #[cfg(feature = "voice")]
        {
            match module.adapter_type.as_str() {
                "silero" => {
                    let threshold = field_f32(&module.config, "threshold").unwrap_or(0.5);
                    let vad = crate::adapters::SileroVadAdapter::new(threshold)?;
                    vad.setup().await.map_err(|e| ConversationError::init(format!("vad setup failed: {e:#}")))?;
                    registry.set_vad(Arc::new(vad)).await;
                }
                other => return Err(ConversationError::init(format!("unknown vad adapter_type: {other}")).into()),
            }
        }
        #[cfg(not(feature = "voice"))]
        {
            let _ = module;
            tracing::warn!("vad module configured but the `voice` feature is disabled; skipping");
        }
    }

    if let Some(module) = active_module(config, "asr") {
        match module.adapter_type.as_str() {
            "whisper_http" => {
                let base_url = field_str(&module.config, "base_url").unwrap_or_else(|| "http://127.0.0.1:9000".into());
                let model = field_str(&module.config, "model").unwrap_or_else(|| "whisper-1".into());
                let asr = crate::adapters::WhisperHttpAsr::new(base_url, model);
                asr.setup().await.map_err(|e| ConversationError::init(format!("asr setup failed: {e:#}")))?;
                registry.set_asr(Arc::new(asr)).await;
            }
            other => return Err(ConversationError::init(format!("unknown asr adapter_type: {other}")).into()),
        }
    }

    if let Some(module) = active_module(config, "llm") {
        match module.adapter_type.as_str() {
            "openai" => {
                let base_url = field_str(&module.config, "base_url").unwrap_or_else(|| "https://api.openai.com/v1".into());
                let api_key = field_str(&module.config, "api_key").unwrap_or_default();
                let model = field_str(&module.config, "model").unwrap_or_else(|| "gpt-4o-mini".into());
                let system_prompt = field_str(&module.config, "system_prompt");
                let llm = crate::adapters::OpenAiLlm::new(base_url, api_key, model, system_prompt);
                llm.setup().await.map_err(|e| ConversationError::init(format!("llm setup failed: {e:#}")))?;
                registry.set_llm(Arc::new(llm)).await;
            }
            other => return Err(ConversationError::init(format!("unknown llm adapter_type: {other}")).into()),
        }
    }

    if let Some(module) = active_module(config, "tts") {
        match module.adapter_type.as_str() {
            "http" => {
                let base_url = field_str(&module.config, "base_url").unwrap_or_else(|| "http://127.0.0.1:9001".into());
                let voice = field_str(&module.config, "voice").unwrap_or_else(|| "default".into());
                let tts = crate::adapters::HttpTts::new(base_url, voice);
                tts.setup().await.map_err(|e| ConversationError::init(format!("tts setup failed: {e:#}")))?;
                registry.set_tts(Arc::new(tts)).await;
            }
            other => return Err(ConversationError::init(format!("unknown tts adapter_type: {other}")).into()),
        }
    }

    Ok(registry)
}

fn active_module<'a>(config: &'a Config, role: &str) -> Option<&'a crate::config::ModuleConfig> {
    config.modules.get(role).filter(|m| m.enabled)
}

fn field_str(value: &serde_yaml::Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

fn field_f32(value: &serde_yaml::Value, key: &str) -> Option<f32> {
    value.get(key).and_then(|v| v.as_f64()).map(|f| f as f32)
}
