//! Periodic sync of machine state to the routing flag and status artifact.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use handoff_protocol::{OverallStatus, Recommendations, SessionState, StatusUpdate};

use crate::artifacts::{merge_status, write_routing_flag};
use crate::config::BackendConfig;
use crate::error::Result;
use crate::storage::StorageConfig;

/// Status fields owned by the state machine for `state`.
pub fn status_update_for(state: SessionState) -> StatusUpdate {
    let fallback = matches!(
        state,
        SessionState::Fallback | SessionState::LimitReached | SessionState::ResetPending
    );
    let (status, recommendations, token_limit_reached) = match state {
        // Waiting on a confirmed limit reads as an expired session to observers.
        SessionState::ResetPending => (
            OverallStatus::SessionExpired,
            Some(Recommendations::session_expired()),
            true,
        ),
        SessionState::LimitReached => (
            OverallStatus::TokenLimitReached,
            Some(Recommendations::for_fallback(true)),
            true,
        ),
        // Routing is left to whoever knows the latch.
        SessionState::Unknown => (OverallStatus::Unknown, None, false),
        other => (
            OverallStatus::from(other),
            Some(Recommendations::for_fallback(fallback)),
            false,
        ),
    };

    StatusUpdate {
        status: Some(status),
        fallback_mode: (state != SessionState::Unknown).then_some(fallback),
        session_state: Some(state),
        token_limit_reached: Some(token_limit_reached),
        recommendations,
        clear_warning: matches!(state, SessionState::Active | SessionState::Unknown),
        ..StatusUpdate::default()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backend Health
// ═══════════════════════════════════════════════════════════════════════════════

pub trait BackendHealth: Send + Sync {
    fn name(&self) -> &'static str;
    fn available(&self) -> bool;
}

/// Local Ollama server: a TCP connect within the timeout.
pub struct OllamaHealth {
    addr: String,
    timeout: Duration,
}

impl OllamaHealth {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    fn resolve(&self) -> Option<SocketAddr> {
        self.addr.to_socket_addrs().ok()?.next()
    }
}

impl BackendHealth for OllamaHealth {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn available(&self) -> bool {
        let Some(addr) = self.resolve() else {
            debug!(addr = %self.addr, "Ollama address does not resolve");
            return false;
        };
        TcpStream::connect_timeout(&addr, self.timeout).is_ok()
    }
}

/// MCP server: the configured entry point exists on disk.
pub struct McpHealth {
    path: Option<PathBuf>,
}

impl McpHealth {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

impl BackendHealth for McpHealth {
    fn name(&self) -> &'static str {
        "mcp"
    }

    fn available(&self) -> bool {
        self.path.as_ref().is_some_and(|path| path.exists())
    }
}

/// OpenRouter: an API key is configured.
pub struct OpenRouterHealth {
    env_var: String,
}

impl OpenRouterHealth {
    pub fn new(env_var: impl Into<String>) -> Self {
        Self {
            env_var: env_var.into(),
        }
    }
}

impl BackendHealth for OpenRouterHealth {
    fn name(&self) -> &'static str {
        "openrouter"
    }

    fn available(&self) -> bool {
        std::env::var(&self.env_var)
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false)
    }
}

pub struct Backends {
    pub ollama: Box<dyn BackendHealth>,
    pub mcp: Box<dyn BackendHealth>,
    pub open_router: Box<dyn BackendHealth>,
}

impl Backends {
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            ollama: Box::new(OllamaHealth::new(
                config.ollama_addr.clone(),
                config.check_timeout(),
            )),
            mcp: Box::new(McpHealth::new(config.mcp_server_path.as_ref().map(PathBuf::from))),
            open_router: Box::new(OpenRouterHealth::new(config.openrouter_key_env.clone())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackendAvailability {
    pub ollama: bool,
    pub mcp: bool,
    pub open_router: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Loop
// ═══════════════════════════════════════════════════════════════════════════════

pub struct ReconciliationLoop {
    status_path: PathBuf,
    routing_path: PathBuf,
    backends: Backends,
}

impl ReconciliationLoop {
    pub fn new(storage: &StorageConfig, backends: Backends) -> Self {
        Self {
            status_path: storage.status_file(),
            routing_path: storage.routing_file(),
            backends,
        }
    }

    pub fn check_backends(&self) -> BackendAvailability {
        let availability = BackendAvailability {
            ollama: self.backends.ollama.available(),
            mcp: self.backends.mcp.available(),
            open_router: self.backends.open_router.available(),
        };
        debug!(
            ollama = availability.ollama,
            mcp = availability.mcp,
            open_router = availability.open_router,
            "Backend availability"
        );
        availability
    }

    /// Sets the routing flag from `local_only` and merges the status artifact.
    pub fn reconcile(
        &self,
        state: SessionState,
        local_only: bool,
        now: DateTime<Utc>,
    ) -> Result<Value> {
        write_routing_flag(&self.routing_path, local_only, now)?;

        let availability = self.check_backends();
        let mut update = status_update_for(state);
        update.fallback_mode = Some(local_only);
        if update.recommendations.is_none() {
            update.recommendations = Some(Recommendations::for_fallback(local_only));
        }
        update.ollama_available = Some(availability.ollama);
        update.mcp_available = Some(availability.mcp);
        update.open_router_available = Some(availability.open_router);

        merge_status(&self.status_path, &update, now)
    }
}
