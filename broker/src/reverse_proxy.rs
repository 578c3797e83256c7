//! Public reverse proxy: `/api/reverse/:id/*path` and `/api/reverse/:id/`
//! forward an HTTP request (or a WebSocket upgrade) into the agent session
//! named by `:id`, using [`HostMatchDialer`] as the only transport.
//!
//! Grounded on `application/server/restapi/reverse.go`'s `serve`/
//! `serveWebsocket`: rewrite the request onto the agent's synthetic
//! hostname, then either hand it to a reverse-proxying HTTP client or
//! bridge two WebSocket connections frame by frame.

use std::net::SocketAddr;
use std::sync::Arc;

use aegis_dialer::{DialError, HostMatchDialer};
use aegis_muxer::MuxError;
use aegis_peer_hub::AgentId;
use axum::body::Body;
use axum::extract::ws::{CloseFrame, Message as AxumMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, FromRequestParts, Path, State};
use axum::http::{header, HeaderValue, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use futures::{SinkExt, StreamExt};
use http_body_util::BodyExt;
use hyper_util::rt::TokioIo;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as TungsteniteCloseFrame;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

#[derive(Clone)]
pub struct ProxyState {
    dialer: Arc<HostMatchDialer>,
    agent_domain: Arc<str>,
}

impl ProxyState {
    #[must_use]
    pub fn new(dialer: Arc<HostMatchDialer>, agent_domain: impl Into<Arc<str>>) -> Self {
        Self {
            dialer,
            agent_domain: agent_domain.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum ProxyError {
    #[error("unknown agent identity")]
    BadIdentity,
    #[error("peer unreachable: {0}")]
    PeerUnreachable(#[from] DialError),
    #[error("upstream handshake failed: {0}")]
    Handshake(#[source] hyper::Error),
    #[error("upstream request failed: {0}")]
    Upstream(#[source] hyper::Error),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProxyError::BadIdentity => StatusCode::BAD_REQUEST,
            ProxyError::PeerUnreachable(DialError::Mux(MuxError::Timeout)) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::PeerUnreachable(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Handshake(_) | ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
        };
        (status, self.to_string()).into_response()
    }
}

pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/api/reverse/:id/", any(serve_root))
        .route("/api/reverse/:id/*path", any(serve_path))
        .with_state(state)
}

async fn serve_root(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    serve(state, &id, String::new(), client_addr, req).await
}

async fn serve_path(
    State(state): State<ProxyState>,
    Path((id, path)): Path<(String, String)>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    serve(state, &id, path, client_addr, req).await
}

async fn serve(state: ProxyState, id: &str, path: String, client_addr: SocketAddr, req: Request<Body>) -> Response {
    let agent = match AgentId::from_hex(id) {
        Ok(agent) => agent,
        Err(_) => return ProxyError::BadIdentity.into_response(),
    };
    let host = agent.hostname(&state.agent_domain);

    let trailing_slash = req.uri().path().ends_with('/') && !path.is_empty();
    let mut rewritten_path = format!("/{path}");
    if trailing_slash {
        rewritten_path.push('/');
    }
    if let Some(query) = req.uri().query() {
        rewritten_path.push('?');
        rewritten_path.push_str(query);
    }

    let (mut parts, body) = req.into_parts();
    let is_websocket = is_websocket_upgrade(&parts.headers);

    if is_websocket {
        match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
            Ok(upgrade) => upgrade
                .on_upgrade(move |socket| bridge_websocket(socket, state, host, rewritten_path))
                .into_response(),
            Err(rejection) => rejection.into_response(),
        }
    } else {
        match proxy_http(&state, &host, &rewritten_path, client_addr, parts, body).await {
            Ok(response) => response,
            Err(error) => {
                warn!(%error, host, "reverse proxy request failed");
                error.into_response()
            }
        }
    }
}

fn is_websocket_upgrade(headers: &axum::http::HeaderMap) -> bool {
    let has_upgrade_token = headers
        .get(header::CONNECTION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_ascii_lowercase().contains("upgrade"));
    let is_websocket = headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"));
    has_upgrade_token && is_websocket
}

async fn proxy_http(
    state: &ProxyState,
    host: &str,
    rewritten_path: &str,
    client_addr: SocketAddr,
    mut parts: axum::http::request::Parts,
    body: Body,
) -> Result<Response, ProxyError> {
    let stream = state.dialer.dial(&format!("{host}:0")).await?;
    let io = TokioIo::new(stream);

    let (mut sender, connection) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(ProxyError::Handshake)?;
    tokio::spawn(async move {
        if let Err(error) = connection.await {
            debug!(%error, "reverse-proxy upstream connection ended");
        }
    });

    let original_host = parts.headers.get(header::HOST).cloned();
    add_forwarded_headers(&mut parts, original_host, client_addr);

    parts.uri = rewritten_path.parse::<Uri>().unwrap_or(Uri::from_static("/"));
    parts.headers.insert(header::HOST, HeaderValue::from_str(host).unwrap_or(HeaderValue::from_static("")));

    let outgoing = Request::from_parts(parts, body);
    let response = sender.send_request(outgoing).await.map_err(ProxyError::Upstream)?;
    let (parts, incoming) = response.into_parts();
    let body = Body::new(incoming.map_err(axum::Error::new));
    Ok(Response::from_parts(parts, body))
}

/// Mirrors `pr.SetXForwarded()` from the original: `X-Forwarded-For`,
/// `X-Forwarded-Host` and `X-Forwarded-Proto` are set together from the
/// connecting client's perspective, before `Host` is rewritten to the
/// agent's synthetic hostname.
fn add_forwarded_headers(parts: &mut axum::http::request::Parts, original_host: Option<HeaderValue>, client_addr: SocketAddr) {
    if let Some(original_host) = original_host {
        parts.headers.insert("x-forwarded-host", original_host);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        parts.headers.insert("x-forwarded-for", value);
    }
    parts.headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
}

async fn bridge_websocket(client: WebSocket, state: ProxyState, host: String, path: String) {
    let address = format!("{host}:0");
    let stream = match state.dialer.dial(&address).await {
        Ok(stream) => stream,
        Err(error) => {
            close_with_error(client, &error.to_string()).await;
            return;
        }
    };

    let url = format!("ws://{host}{path}");
    let upstream = match tokio_tungstenite::client_async(url, stream).await {
        Ok((upstream, _response)) => upstream,
        Err(error) => {
            close_with_error(client, &error.to_string()).await;
            return;
        }
    };

    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(Ok(message)) = client_rx.next().await {
            let forward = axum_to_tungstenite(message);
            let is_close = matches!(forward, TungsteniteMessage::Close(_));
            if upstream_tx.send(forward).await.is_err() || is_close {
                break;
            }
        }
    };
    let upstream_to_client = async {
        while let Some(Ok(message)) = upstream_rx.next().await {
            let forward = tungstenite_to_axum(message);
            let is_close = matches!(forward, AxumMessage::Close(_));
            if client_tx.send(forward).await.is_err() || is_close {
                break;
            }
        }
    };

    tokio::select! {
        () = client_to_upstream => {}
        () = upstream_to_client => {}
    }
}

async fn close_with_error(client: WebSocket, message: &str) {
    let (mut sender, _receiver) = client.split();
    let _ = sender
        .send(AxumMessage::Close(Some(CloseFrame {
            code: axum::extract::ws::close_code::ERROR,
            reason: message.to_owned().into(),
        })))
        .await;
}

fn axum_to_tungstenite(message: AxumMessage) -> TungsteniteMessage {
    match message {
        AxumMessage::Text(text) => TungsteniteMessage::Text(text),
        AxumMessage::Binary(data) => TungsteniteMessage::Binary(data),
        AxumMessage::Ping(data) => TungsteniteMessage::Ping(data),
        AxumMessage::Pong(data) => TungsteniteMessage::Pong(data),
        AxumMessage::Close(frame) => TungsteniteMessage::Close(frame.map(|frame| TungsteniteCloseFrame {
            code: frame.code.into(),
            reason: frame.reason,
        })),
    }
}

fn tungstenite_to_axum(message: TungsteniteMessage) -> AxumMessage {
    match message {
        TungsteniteMessage::Text(text) => AxumMessage::Text(text),
        TungsteniteMessage::Binary(data) => AxumMessage::Binary(data),
        TungsteniteMessage::Ping(data) => AxumMessage::Ping(data),
        TungsteniteMessage::Pong(data) => AxumMessage::Pong(data),
        TungsteniteMessage::Close(frame) => AxumMessage::Close(frame.map(|frame| CloseFrame {
            code: frame.code.into(),
            reason: frame.reason,
        })),
        TungsteniteMessage::Frame(_) => AxumMessage::Close(None),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn trailing_slash_is_preserved_only_when_path_is_non_empty() {
        let with_slash = "status/";
        let path = "status".to_owned();
        assert!(with_slash.ends_with('/') && !path.is_empty());

        let root_path = String::new();
        assert!(!(with_slash.ends_with('/') && !root_path.is_empty()));
    }

    #[test]
    fn bad_identity_maps_to_400() {
        let response = ProxyError::BadIdentity.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn peer_unreachable_maps_to_502() {
        let response = ProxyError::PeerUnreachable(DialError::NoRouteToServer).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn peer_unreachable_on_mux_timeout_maps_to_504() {
        let response = ProxyError::PeerUnreachable(DialError::Mux(MuxError::Timeout)).into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn forwarded_headers_carry_the_original_host_and_client_address() {
        let mut parts = Request::builder()
            .header(header::HOST, "public.example.test")
            .body(())
            .unwrap()
            .into_parts()
            .0;
        let original_host = parts.headers.get(header::HOST).cloned();
        let client_addr: SocketAddr = "203.0.113.7:54321".parse().unwrap();

        add_forwarded_headers(&mut parts, original_host, client_addr);

        assert_eq!(parts.headers.get("x-forwarded-host").unwrap(), "public.example.test");
        assert_eq!(parts.headers.get("x-forwarded-for").unwrap(), "203.0.113.7");
        assert_eq!(parts.headers.get("x-forwarded-proto").unwrap(), "https");
    }
}
