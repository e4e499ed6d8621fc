//! Nbgate - the front-door router for a multi-tenant notebook service
//!
//! This library provides an HTTP/WebSocket router that:
//! - Classifies every request by path through an ordered rule table
//! - Gates non-essential traffic behind a filesystem EULA marker
//! - Hands the sign-in/out/callback paths to an external auth gateway
//! - Lazily starts a per-user backend on first use, parking concurrent
//!   requests behind a single-flight start until it settles
//! - Forwards ready traffic to the backend through a pooled HTTP client
//! - Bypasses all gating for protocol-upgrade (WebSocket) connections
//! - Survives any single request failure behind a fault boundary

pub mod auth;
pub mod config;
pub mod content;
pub mod error;
pub mod eula;
pub mod forward;
pub mod info;
pub mod lifecycle;
pub mod router;
pub mod server;
pub mod settings;
pub mod spawner;
pub mod user;
