//! Application state shared across request handlers.

use std::sync::Arc;

use cloudterm_provision::Launcher;

use crate::bridge::SessionManager;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    sessions: SessionManager,
    launcher: Launcher,
}

impl AppState {
    pub fn new(sessions: SessionManager, launcher: Launcher) -> Self {
        Self {
            inner: Arc::new(AppStateInner { sessions, launcher }),
        }
    }

    /// Registry of live shell sessions.
    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    pub fn launcher(&self) -> &Launcher {
        &self.inner.launcher
    }
}
