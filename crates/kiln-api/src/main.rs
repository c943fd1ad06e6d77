//! Kiln API entry point.

mod auth;
mod errors;
mod routes;
mod server;
mod state;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Settings are loaded again inside build_state; this early read only
    // feeds the log configuration.
    let settings = kiln_core::config::ConverterSettings::from_env()?;
    std::fs::create_dir_all(&settings.logging.log_dir)?;
    let file_appender =
        tracing_appender::rolling::daily(&settings.logging.log_dir, "kiln-api.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.logging.level.clone()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    let state = server::build_state().await?;
    server::serve(state).await?;
    tokio::signal::ctrl_c().await?;
    Ok(())
}
