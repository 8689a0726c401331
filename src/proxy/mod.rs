//! HTTP proxy: admission-gated forwarding to the downstream service.

mod forward;
mod observer;
mod reject;
mod server;
mod service;

pub use forward::{outbound_headers, ForwardError, Forwarder};
pub use observer::{NoopObserver, ProxyObserver, TracingObserver};
pub use reject::{rate_limited_response, Tarpit, RATE_LIMITED_BODY};
pub use server::ProxyServer;
pub use service::{proxy_handler, ProxyService};
