use serde::Serialize;

use crate::conn::LinkState;
use crate::error::HealthError;

/// Liveness snapshot returned by `check_health`. A plain value: producing
/// it never mutates the cache and never initiates a connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub connected: bool,
    pub state: LinkState,
    /// Present only when the liveness probe itself failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl HealthStatus {
    pub(crate) fn up() -> Self {
        Self {
            connected: true,
            state: LinkState::Connected,
            detail: None,
        }
    }

    pub(crate) fn down(state: LinkState) -> Self {
        Self {
            connected: false,
            state,
            detail: None,
        }
    }

    pub(crate) fn probe_error(err: HealthError) -> Self {
        Self {
            connected: false,
            state: LinkState::Error,
            detail: Some(err.to_string()),
        }
    }
}
