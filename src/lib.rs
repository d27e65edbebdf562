//! Traffic interception and recording proxy.
//!
//! A forward proxy that captures every HTTP(S) exchange passing through it,
//! applies regex-matched mutation rules at the request and response phases,
//! persists captured exchanges for later inspection and can replay a
//! captured request. Two interchangeable engines sit behind one interface:
//! a passthrough engine (opaque CONNECT tunnels) and a CA-backed TLS
//! interception engine.

pub mod api;
pub mod bypass;
pub mod ca;
pub mod config;
pub mod error;
pub mod handler;
pub mod intercept;
pub mod interceptor;
pub mod passthrough;
pub mod proxy;
pub mod replay;
pub mod rules;
pub mod store;

pub use bypass::BypassList;
pub use ca::CertificateAuthority;
pub use config::{CaptureLimits, ProxyConfig};
pub use error::ProxyError;
pub use intercept::InterceptEngine;
pub use interceptor::{CapturedRequest, CapturedResponse, RequestAction, TrafficInterceptor};
pub use passthrough::PassthroughEngine;
pub use proxy::{ProxyEngine, ProxyServer};
pub use replay::{ReplayClient, ReplayOutcome};
pub use rules::{Rule, RuleData, RuleEngine, RuleKind, RulePhase};
pub use store::{Packet, PacketStore};

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;
