use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,minivault=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = minivault::config::ServiceConfig::from_env();
    let state = minivault::build_state(&config)?;
    let app = minivault::build_app(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "minivault listening");

    axum::serve(listener, app).await?;
    Ok(())
}
