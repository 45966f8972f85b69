mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, routing::get};
use cas_core::Registry;
use tokio::sync::watch;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
}

/// Run the admin API.
pub async fn run_server(
    addr: SocketAddr,
    registry: Arc<Registry>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(AppState { registry });

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown_rx.borrow_and_update() {
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/clients", get(routes::list_clients))
        .route(
            "/clients/{client_id}",
            get(routes::get_client)
                .put(routes::put_client)
                .delete(routes::delete_client),
        )
        .route("/services", get(routes::list_services))
        .with_state(state)
}
