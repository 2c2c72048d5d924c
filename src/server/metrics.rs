//! Handler metrics collection.
//!
//! Aggregate counters only; nothing here identifies a user or records an
//! address.

use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregate counters for one inbound handler.
#[derive(Debug, Default)]
pub struct HandlerMetrics {
    total_connections: AtomicU64,
    authenticated_sessions: AtomicU64,
    fallback_connections: AtomicU64,
    auth_failures: AtomicU64,
    handshake_errors: AtomicU64,
}

impl HandlerMetrics {
    /// Create a zeroed collector.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_connection(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_authenticated(&self) {
        self.authenticated_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fallback(&self) {
        self.fallback_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handshake_error(&self) {
        self.handshake_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Connections seen by the demultiplexer.
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    /// Connections that completed a handshake and entered the session loop.
    pub fn authenticated_sessions(&self) -> u64 {
        self.authenticated_sessions.load(Ordering::Relaxed)
    }

    /// Connections spliced to the cover server.
    pub fn fallback_connections(&self) -> u64 {
        self.fallback_connections.load(Ordering::Relaxed)
    }

    /// Handshakes rejected for an unknown UUID.
    pub fn auth_failures(&self) -> u64 {
        self.auth_failures.load(Ordering::Relaxed)
    }

    /// Handshakes that failed for other reasons (timestamp, truncation).
    pub fn handshake_errors(&self) -> u64 {
        self.handshake_errors.load(Ordering::Relaxed)
    }
}
