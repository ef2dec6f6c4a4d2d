//! Shared application state for the agent server.

use std::sync::Arc;

use autoship::execution::ExecutionAgent;

#[derive(Clone)]
pub struct AppState {
    pub agent: ExecutionAgent,
    /// Required bearer token for everything but `/health`.
    pub auth_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(agent: ExecutionAgent) -> Self {
        let auth_token = agent
            .config()
            .auth_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(Arc::from);
        Self { agent, auth_token }
    }
}
