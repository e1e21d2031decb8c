//! voicebridge - real-time voice conversation server entry point.

use voicebridge::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Required for Rustls 0.23+.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    cli::run().await
}
