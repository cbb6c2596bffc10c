//! Tarship Daemon - QUIC host and secure session
//!
//! This crate provides:
//! - [`TarshipHost`], which serves a local directory to authenticated clients
//! - [`QuicSession`] / [`QuicConnector`], the client side implementing
//!   `tarship_core::SecureSession`
//!
//! # Architecture
//!
//! The transfer pipeline is blocking; the network is async:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │           pack / ship / unpack (caller thread, sync)        │
//! │  SecureSession calls block until the request completes      │
//! └─────────────────────────────┬───────────────────────────────┘
//!                               │ Runtime::block_on
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Tokio Runtime (async)                      │
//! │  - QUIC connection (quinn), one stream per request          │
//! │  - SPAKE2 authentication bound to the host certificate      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod auth;
pub mod client;
pub mod host;
pub mod net;
pub mod rate_limiter;

pub use auth::{AuthError, AuthenticatedSession};
pub use client::{QuicConnector, QuicSession};
pub use host::{HostConfig, HostError, TarshipHost};
pub use net::{ConnectionError, QuicConnection};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
