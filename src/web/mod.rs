//! HTTP front-end.

mod handlers;

use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};

/// Web server exposing the measurement API and the local liveness endpoint.
pub struct Server {
    port: u16,
}

impl Server {
    pub fn new(port: u16) -> Self {
        Server { port }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/", get(handlers::handle_index))
            .route(
                "/api/clash_speedtest/v1/filter_alive",
                post(handlers::handle_filter_alive),
            )
            .route("/liveness", get(handlers::handle_liveness))
            .route("/_down", get(handlers::handle_down))
            .layer(cors)
    }

    /// Serve until the process ends.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_router() -> Router {
    Server::new(0).routes()
}
