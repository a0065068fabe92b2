use anyhow::Context;
use huddle::{config::Config, db::Journal, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    logging::init(config.log_format);

    let journal = match &config.database_url {
        Some(url) => Journal::connect(url)
            .await
            .with_context(|| format!("failed to open journal at {url}"))?,
        None => {
            tracing::warn!("DATABASE_URL not set; state will not survive a restart");
            Journal::disabled()
        }
    };

    let server = huddle::start(config, journal).await?;
    tokio::select! {
        result = server.wait() => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }
    Ok(())
}
