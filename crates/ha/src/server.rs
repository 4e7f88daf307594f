//! Local listener for VRRP state-change notifications.
//!
//! Each request carries the router in `X-Neutron-Router-Id` and the new
//! state in `X-Neutron-State`. The handler queues the event and answers
//! right away; the transition is applied by the router's worker.

use crate::controller::HaController;
use crate::types::{HaState, ROUTER_ID_HEADER, STATE_HEADER};
use axum::{
    Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use common::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// HTTP listener feeding the HA controller.
pub struct NotificationServer {
    listener: TcpListener,
    controller: Arc<HaController>,
}

impl NotificationServer {
    /// Bind `addr` with an accept queue of `backlog` pending connections.
    pub async fn bind(
        addr: SocketAddr,
        backlog: u32,
        controller: Arc<HaController>,
    ) -> Result<Self> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(backlog)?;

        info!(listen_addr = %listener.local_addr()?, backlog, "HA notification listener bound");
        Ok(Self {
            listener,
            controller,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Request router of the listener.
    pub fn router(controller: Arc<HaController>) -> Router {
        Router::new()
            .fallback(handle_notification)
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(controller)
    }

    /// Serve notifications until the listener fails.
    pub async fn run(self) -> Result<()> {
        let app = Self::router(self.controller);
        axum::serve(self.listener, app).await?;
        Ok(())
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn handle_notification(
    State(controller): State<Arc<HaController>>,
    headers: HeaderMap,
) -> Response {
    let Some(router_id) = header(&headers, ROUTER_ID_HEADER) else {
        warn!("Notification without router id");
        return (StatusCode::BAD_REQUEST, format!("missing {} header", ROUTER_ID_HEADER))
            .into_response();
    };
    let Some(raw_state) = header(&headers, STATE_HEADER) else {
        warn!(router_id, "Notification without state");
        return (StatusCode::BAD_REQUEST, format!("missing {} header", STATE_HEADER))
            .into_response();
    };
    let state: HaState = match raw_state.parse() {
        Ok(state) => state,
        Err(e) => {
            warn!(router_id, error = %e, "Notification with invalid state");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    debug!(router_id, %state, "Handling notification");
    controller.enqueue(router_id, state).await;
    StatusCode::OK.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::MockMetadataProxy;
    use axum::http::{HeaderName, HeaderValue};

    fn controller() -> Arc<HaController> {
        let mut proxy = MockMetadataProxy::new();
        proxy.expect_spawn().returning(|_, _, _| Ok(()));
        proxy.expect_destroy().returning(|_, _| Ok(()));
        Arc::new(HaController::new(Arc::new(proxy), 9697, None))
    }

    fn headers(router_id: Option<&'static str>, state: Option<&'static str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(id) = router_id {
            headers.insert(
                HeaderName::from_bytes(ROUTER_ID_HEADER.as_bytes()).unwrap(),
                HeaderValue::from_static(id),
            );
        }
        if let Some(state) = state {
            headers.insert(
                HeaderName::from_bytes(STATE_HEADER.as_bytes()).unwrap(),
                HeaderValue::from_static(state),
            );
        }
        headers
    }

    #[tokio::test]
    async fn test_handler_enqueues_transition() {
        let ha = controller();
        ha.register("r1", "qrouter-r1");

        let response =
            handle_notification(State(ha.clone()), headers(Some("r1"), Some("master"))).await;
        assert_eq!(response.status(), StatusCode::OK);

        ha.settle("r1").await;
        assert_eq!(ha.status("r1").await.unwrap().state, HaState::Master);
    }

    #[tokio::test]
    async fn test_handler_rejects_bad_requests() {
        let ha = controller();

        let response = handle_notification(State(ha.clone()), headers(None, Some("master"))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = handle_notification(State(ha.clone()), headers(Some("r1"), None)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response =
            handle_notification(State(ha.clone()), headers(Some("r1"), Some("primary"))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unmanaged_router_still_answered() {
        let ha = controller();
        let response =
            handle_notification(State(ha), headers(Some("ghost"), Some("backup"))).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = NotificationServer::bind("127.0.0.1:0".parse().unwrap(), 16, controller())
            .await
            .unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }
}
