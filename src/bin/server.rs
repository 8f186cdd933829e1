//! proxymeter HTTP service.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use proxymeter::web::Server;

const DEFAULT_PORT: u16 = 8070;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("proxymeter=info".parse()?),
        )
        .init();

    let port = std::env::var("PROXYMETER_HTTP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    Server::new(port).start().await
}
