//! Request pipeline: admission, then rejection or forwarding.

use axum::body::Bytes;
use axum::extract::{ConnectInfo, FromRequest, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::forward::{outbound_headers, Forwarder};
use super::observer::{ProxyObserver, TracingObserver};
use super::reject::Tarpit;
use crate::config::SluiceConfig;
use crate::error::Result;
use crate::ratelimit::{Admission, AdmissionPolicy, BucketRegistry, RequestClass, X_FORWARDED_FOR};

/// The proxy's request handler and the state it shares across requests.
///
/// Cloning is cheap; every clone sees the same bucket registry.
#[derive(Clone)]
pub struct ProxyService {
    registry: Arc<BucketRegistry>,
    policy: Arc<AdmissionPolicy>,
    forwarder: Arc<Forwarder>,
    tarpit: Arc<Tarpit>,
    observer: Arc<dyn ProxyObserver>,
    max_body_bytes: usize,
}

impl ProxyService {
    /// Create a new service from its parts, observed through `tracing`.
    pub fn new(
        registry: Arc<BucketRegistry>,
        policy: AdmissionPolicy,
        forwarder: Forwarder,
        tarpit: Tarpit,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            registry,
            policy: Arc::new(policy),
            forwarder: Arc::new(forwarder),
            tarpit: Arc::new(tarpit),
            observer: Arc::new(TracingObserver),
            max_body_bytes,
        }
    }

    /// Create a service with a fresh registry from configuration.
    pub fn from_config(config: &SluiceConfig) -> Result<Self> {
        Ok(Self::new(
            Arc::new(BucketRegistry::new()),
            AdmissionPolicy::new(&config.rate_limiting),
            Forwarder::new(&config.server)?,
            Tarpit::new(&config.tarpit),
            config.server.max_body_bytes,
        ))
    }

    /// Replace the observer.
    pub fn with_observer(mut self, observer: Arc<dyn ProxyObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// The shared bucket registry.
    pub fn registry(&self) -> &Arc<BucketRegistry> {
        &self.registry
    }

    /// Handle one inbound request from `peer`.
    ///
    /// Always produces a response: downstream output on success, 429 when
    /// rate limited, 503 when the downstream call cannot be made.
    #[instrument(
        skip(self, request, peer),
        fields(
            request_id = %Uuid::new_v4(),
            method = %request.method(),
            path = %request.uri().path(),
            peer = %peer
        )
    )]
    pub async fn handle(&self, peer: SocketAddr, request: Request) -> Response {
        let class = RequestClass::from_method(request.method());
        let (key, params) = self.policy.key_for(request.method(), request.headers(), peer);

        self.observer.before_admission(&key, class);
        let admission = self.registry.check(&key, params);
        self.observer.after_decision(&key, &admission);

        if let Admission::Denied { retry_after } = admission {
            return self.tarpit.reject(retry_after).await;
        }

        if exceeds_limit(&request, self.max_body_bytes) {
            return json_error(StatusCode::PAYLOAD_TOO_LARGE, TOO_LARGE_BODY);
        }

        let (parts, body) = request.into_parts();
        let method = parts.method.clone();
        let uri = parts.uri.clone();
        let headers = outbound_headers(&parts.headers, peer);

        let body = match Bytes::from_request(Request::from_parts(parts, body), &()).await {
            Ok(body) => body,
            Err(rejection) => {
                warn!(error = %rejection, "Failed to read request body");
                return if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                    json_error(StatusCode::PAYLOAD_TOO_LARGE, TOO_LARGE_BODY)
                } else {
                    json_error(StatusCode::BAD_REQUEST, UNREADABLE_BODY)
                };
            }
        };

        debug!(body_bytes = body.len(), "Forwarding admitted request");

        let forwarded_for = headers
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let outbound = match self.forwarder.build_request(method.clone(), &uri, headers, body) {
            Ok(outbound) => outbound,
            Err(e) => {
                self.observer.on_forward_error(&e);
                return e.into_response();
            }
        };

        self.observer
            .before_dispatch(&method, outbound.url().as_str(), &forwarded_for);
        let started = Instant::now();

        match self.forwarder.dispatch(outbound).await {
            Ok(response) => {
                self.observer.after_response(response.status(), started.elapsed());
                response
            }
            Err(e) => {
                self.observer.on_forward_error(&e);
                e.into_response()
            }
        }
    }
}

/// Axum entry point: every method and path lands here.
pub async fn proxy_handler(
    State(service): State<ProxyService>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    service.handle(peer, request).await
}

const TOO_LARGE_BODY: &str = r#"{"error":"request body too large"}"#;
const UNREADABLE_BODY: &str = r#"{"error":"failed to read request body"}"#;

/// Whether a declared `Content-Length` is over the limit.
fn exceeds_limit(request: &Request, limit: usize) -> bool {
    request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .is_some_and(|len| len > limit as u64)
}

fn json_error(status: StatusCode, body: &'static str) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        body,
    )
        .into_response()
}
