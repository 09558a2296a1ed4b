use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::InputError;

/// Headers the upstream expects on every request.
#[derive(Debug, Clone)]
pub struct UpstreamHeaders {
    pub user_agent: String,
    pub referer: String,
}

/// Request headers passed through to the upstream.
const FORWARDED_REQUEST: [HeaderName; 2] = [header::RANGE, header::IF_RANGE];
/// Response headers the proxy must not copy back.
const HOP_BY_HOP: [&str; 4] = ["connection", "transfer-encoding", "keep-alive", "upgrade"];

struct ProxyState {
    client: reqwest::Client,
    source: String,
    headers: UpstreamHeaders,
}

/// Starts a loopback HTTP proxy for `source` and returns its address. The
/// proxy stops accepting once `shutdown` is cancelled.
pub async fn spawn_proxy(
    client: reqwest::Client,
    source: String,
    headers: UpstreamHeaders,
    shutdown: CancellationToken,
) -> Result<SocketAddr, InputError> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(InputError::ProxyBind)?;
    let addr = listener.local_addr().map_err(InputError::ProxyBind)?;
    let state = Arc::new(ProxyState {
        client,
        source,
        headers,
    });
    let app = Router::new().fallback(forward).with_state(state);

    tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        match served {
            Ok(()) => debug!(%addr, "loopback proxy stopped"),
            Err(err) => warn!(%addr, error = %err, "loopback proxy failed"),
        }
    });
    debug!(%addr, "loopback proxy listening");
    Ok(addr)
}

async fn forward(
    State(state): State<Arc<ProxyState>>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let is_head = method == Method::HEAD;
    let mut request = if is_head {
        state.client.head(&state.source)
    } else {
        state.client.get(&state.source)
    };
    request = request
        .header(reqwest::header::USER_AGENT, &state.headers.user_agent)
        .header(reqwest::header::REFERER, &state.headers.referer);
    for name in &FORWARDED_REQUEST {
        if let Some(value) = headers.get(name) {
            request = request.header(name.as_str(), value.as_bytes());
        }
    }

    let upstream = match request.send().await {
        Ok(upstream) => upstream,
        Err(err) => {
            warn!(error = %err, "upstream request failed");
            return (StatusCode::BAD_GATEWAY, err.to_string()).into_response();
        }
    };

    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            response_headers.append(name, value);
        }
    }

    let body = if is_head {
        Body::empty()
    } else {
        Body::from_stream(upstream.bytes_stream())
    };
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    async fn upstream(headers: HeaderMap) -> Response {
        let range = headers
            .get(header::RANGE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("none")
            .to_string();
        let agent = headers
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let status = if range == "none" {
            StatusCode::OK
        } else {
            StatusCode::PARTIAL_CONTENT
        };
        (
            status,
            [("x-seen-range", range), ("x-seen-agent", agent)],
            "media-bytes",
        )
            .into_response()
    }

    #[tokio::test]
    async fn forwards_range_and_identity_headers() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let origin = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new().route("/video", get(upstream)))
                .await
                .unwrap();
        });

        let shutdown = CancellationToken::new();
        let proxy = spawn_proxy(
            reqwest::Client::new(),
            format!("http://{origin}/video"),
            UpstreamHeaders {
                user_agent: "RetroAgent/1.0".into(),
                referer: "https://example.test/".into(),
            },
            shutdown.clone(),
        )
        .await
        .unwrap();

        let client = reqwest::Client::new();
        let plain = client.get(format!("http://{proxy}/")).send().await.unwrap();
        assert_eq!(plain.status().as_u16(), 200);
        assert_eq!(plain.headers()["x-seen-agent"], "RetroAgent/1.0");
        assert_eq!(plain.text().await.unwrap(), "media-bytes");

        let ranged = client
            .get(format!("http://{proxy}/anything"))
            .header("Range", "bytes=100-")
            .send()
            .await
            .unwrap();
        assert_eq!(ranged.status().as_u16(), 206);
        assert_eq!(ranged.headers()["x-seen-range"], "bytes=100-");

        let head = client.head(format!("http://{proxy}/")).send().await.unwrap();
        assert_eq!(head.status().as_u16(), 200);

        shutdown.cancel();
    }
}
