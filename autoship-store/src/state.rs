//! Shared application state for the store server.

use autoship::store::ProjectRegistry;

#[derive(Clone)]
pub struct AppState {
    pub projects: ProjectRegistry,
}
