use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use cas_core::{FeedStatus, KeyState};
use serde::Serialize;
use tracing::{info, warn};

use crate::clients::build_client;
use crate::config::ClientConfig;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct DescramblerView {
    pub client: String,
    pub key_state: KeyState,
}

#[derive(Debug, Serialize)]
pub struct ServiceView {
    pub name: String,
    pub service_id: u16,
    pub transport_stream_id: u16,
    pub adapter: u8,
    pub status: FeedStatus,
    pub descramblers: Vec<DescramblerView>,
}

/// List all clients with their connection state.
pub async fn list_clients(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.statuses())
}

pub async fn get_client(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let client = state
        .registry
        .client(&client_id)
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(client.status()))
}

/**
    Create or reconfigure a client. A reconfigured client replaces the old
    one, which detaches from every service first.
*/
pub async fn put_client(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    Json(config): Json<ClientConfig>,
) -> Result<impl IntoResponse, StatusCode> {
    if config.id() != client_id {
        return Err(StatusCode::BAD_REQUEST);
    }
    let existed = state.registry.client(&client_id).is_some();
    let client = build_client(config, state.registry.activity());
    if let Err(e) = state.registry.replace_client(Arc::clone(&client)).await {
        warn!(client = %client_id, error = %e, "client update failed");
        client.shutdown().await;
        return Err(StatusCode::CONFLICT);
    }
    state.registry.config_changed();
    info!(client = %client_id, replaced = existed, "client configured");

    let status = if existed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(client.status())))
}

pub async fn delete_client(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> StatusCode {
    match state.registry.remove_client(&client_id).await {
        Ok(()) => {
            state.registry.config_changed();
            StatusCode::NO_CONTENT
        }
        Err(_) => StatusCode::NOT_FOUND,
    }
}

/// Running services and the key state of each attached descrambler.
pub async fn list_services(State(state): State<AppState>) -> impl IntoResponse {
    let services: Vec<ServiceView> = state
        .registry
        .services()
        .iter()
        .map(|service| {
            let info = service.info();
            let streams = service.streams();
            ServiceView {
                name: info.name.clone(),
                service_id: info.service_id,
                transport_stream_id: info.transport_stream_id,
                adapter: info.adapter,
                status: streams.status,
                descramblers: streams
                    .descramblers
                    .iter()
                    .map(|d| DescramblerView {
                        client: d.client_id().to_string(),
                        key_state: d.key_state(),
                    })
                    .collect(),
            }
        })
        .collect();
    Json(services)
}

#[cfg(test)]
mod tests {
    use axum::response::IntoResponse;
    use cas_core::{CaidEntry, CcwClient, CcwConfig, Registry, ServiceInfo};

    use super::*;

    fn ccw(id: &str, sid: u16) -> CcwConfig {
        CcwConfig {
            id: id.into(),
            enabled: true,
            caid: 0x0600,
            tsid: 1,
            sid,
            key: [1, 2, 3, 4, 5, 6, 7, 8],
            comment: String::new(),
        }
    }

    fn state() -> AppState {
        let registry = Arc::new(Registry::new());
        registry.add_client(CcwClient::new(ccw("fixed", 100))).unwrap();
        AppState { registry }
    }

    #[tokio::test]
    async fn unknown_client_is_not_found() {
        let result = get_client(State(state()), Path("missing".into())).await;
        assert_eq!(result.err(), Some(StatusCode::NOT_FOUND));
        assert_eq!(
            delete_client(State(state()), Path("missing".into())).await,
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn put_requires_matching_id() {
        let result = put_client(
            State(state()),
            Path("other".into()),
            Json(ClientConfig::Ccw(ccw("fixed", 100))),
        )
        .await;
        assert_eq!(result.err(), Some(StatusCode::BAD_REQUEST));
    }

    #[tokio::test]
    async fn put_creates_then_replaces() {
        let state = state();
        let created = put_client(
            State(state.clone()),
            Path("second".into()),
            Json(ClientConfig::Ccw(ccw("second", 200))),
        )
        .await
        .unwrap()
        .into_response();
        assert_eq!(created.status(), StatusCode::CREATED);

        let replaced = put_client(
            State(state.clone()),
            Path("second".into()),
            Json(ClientConfig::Ccw(ccw("second", 201))),
        )
        .await
        .unwrap()
        .into_response();
        assert_eq!(replaced.status(), StatusCode::OK);
        assert_eq!(state.registry.clients().len(), 2);
    }

    #[tokio::test]
    async fn delete_detaches_from_services() {
        let state = state();
        let service = state.registry.service_started(
            ServiceInfo {
                name: "News".into(),
                service_id: 100,
                transport_stream_id: 1,
                ..Default::default()
            },
            vec![CaidEntry::new(0x0600, 0x101, 0)],
            Box::new(|_: &[u8]| {}),
        );
        assert_eq!(service.streams().descramblers.len(), 1);

        let status = delete_client(State(state.clone()), Path("fixed".into())).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(service.streams().descramblers.is_empty());
        assert!(state.registry.clients().is_empty());
    }
}
