//! Forwarding engine: relays admitted requests to the downstream service.

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use thiserror::Error;
use tracing::{error, warn};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::ratelimit::{forwarded_chain_bytes, X_FORWARDED_FOR};

/// Body returned when the downstream request cannot be built.
pub const BUILD_FAILED_BODY: &str = r#"{"error":"failed to create downstream request"}"#;
/// Body returned when the downstream service cannot be reached.
pub const UNAVAILABLE_BODY: &str = r#"{"error":"downstream target unavailable"}"#;

/// Errors raised while relaying a request downstream.
#[derive(Error, Debug)]
pub enum ForwardError {
    /// The outbound request could not be constructed
    #[error("failed to create downstream request: {0}")]
    Build(String),

    /// Connecting, sending or waiting for the response failed
    #[error("downstream target unavailable: {0}")]
    Unavailable(#[source] reqwest::Error),
}

impl IntoResponse for ForwardError {
    fn into_response(self) -> Response {
        let body = match self {
            ForwardError::Build(_) => BUILD_FAILED_BODY,
            ForwardError::Unavailable(_) => UNAVAILABLE_BODY,
        };
        (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
            body,
        )
            .into_response()
    }
}

/// Relays requests to a single fixed downstream base URL.
///
/// Headers keep their multi-value structure end to end; nothing is joined.
/// Hop-by-hop headers are dropped in both directions, and `Host` /
/// `Content-Length` are left for the client to set.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    base_url: String,
}

impl Forwarder {
    /// Create a forwarder for the configured downstream.
    ///
    /// The client never follows redirects, ignores system proxy settings and
    /// bounds every call by the configured downstream timeout.
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(config.downstream_timeout())
            .connect_timeout(config.connect_timeout())
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            base_url: config.downstream_url.trim_end_matches('/').to_string(),
        })
    }

    /// The downstream base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The downstream URL for an inbound request URI.
    pub fn target_url(&self, uri: &Uri) -> String {
        let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        format!("{}{}", self.base_url, path_and_query)
    }

    /// Build the outbound request.
    pub fn build_request(
        &self,
        method: Method,
        uri: &Uri,
        headers: HeaderMap,
        body: Bytes,
    ) -> std::result::Result<reqwest::Request, ForwardError> {
        self.client
            .request(method, self.target_url(uri))
            .headers(headers)
            .body(body)
            .build()
            .map_err(|e| {
                error!(error = %e, "Failed to build downstream request");
                ForwardError::Build(e.to_string())
            })
    }

    /// Send a built request and relay the response.
    ///
    /// Headers and status are copied first; the body is streamed back
    /// unmodified as it arrives.
    pub async fn dispatch(
        &self,
        request: reqwest::Request,
    ) -> std::result::Result<Response, ForwardError> {
        let downstream = self
            .client
            .execute(request)
            .await
            .map_err(ForwardError::Unavailable)?;

        let mut headers = HeaderMap::with_capacity(downstream.headers().len());
        for (name, value) in downstream.headers() {
            if !is_hop_by_hop_header(name) {
                headers.append(name.clone(), value.clone());
            }
        }
        let status = downstream.status();

        let mut response = Response::new(Body::from_stream(downstream.bytes_stream()));
        *response.headers_mut() = headers;
        *response.status_mut() = status;
        Ok(response)
    }
}

/// Headers to send downstream for an inbound request from `peer`.
///
/// The caller's IP is appended to the `X-Forwarded-For` chain.
pub fn outbound_headers(inbound: &HeaderMap, peer: SocketAddr) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len() + 1);
    for (name, value) in inbound {
        if is_hop_by_hop_header(name)
            || *name == header::HOST
            || *name == header::CONTENT_LENGTH
            || *name == X_FORWARDED_FOR
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    // Existing hops are carried as raw bytes so opaque values survive.
    let mut chain = forwarded_chain_bytes(inbound).unwrap_or_default();
    if !chain.is_empty() {
        chain.extend_from_slice(b", ");
    }
    chain.extend_from_slice(peer.ip().to_string().as_bytes());
    match HeaderValue::from_bytes(&chain) {
        Ok(value) => {
            headers.insert(X_FORWARDED_FOR, value);
        }
        Err(e) => warn!(error = %e, "Dropping unrepresentable X-Forwarded-For chain"),
    }

    headers
}

fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
