//! Shared state for the HTTP API.

use crate::gateway::CallLog;
use crate::CompanyDeps;
use std::time::Instant;

/// State shared across all API handlers.
pub struct ApiState {
    pub deps: CompanyDeps,
    pub call_log: CallLog,
    pub started_at: Instant,
}

impl ApiState {
    pub fn new(deps: CompanyDeps, call_log: CallLog) -> Self {
        Self {
            deps,
            call_log,
            started_at: Instant::now(),
        }
    }
}
