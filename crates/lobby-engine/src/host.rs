use std::sync::Arc;

use lobby_core::{LobbyError, SessionId};
use serde::{Deserialize, Serialize};

use crate::registry::SessionRegistry;

/// Body of a host request. `displayName` is the only accepted name field.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRequest {
    pub display_name: String,
    #[serde(default)]
    pub capacity: Option<usize>,
}

impl HostRequest {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            capacity: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostResponse {
    pub session_id: SessionId,
}

/// Limits applied to host requests.
#[derive(Clone, Debug)]
pub struct HostLimits {
    pub max_display_name_len: usize,
    pub max_capacity: usize,
}

/// Trim a display name and check it is non-empty and within `max_len` chars.
pub fn validate_display_name(name: &str, max_len: usize) -> Result<String, LobbyError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(LobbyError::InvalidRequest("displayName must not be empty".into()));
    }
    let len = trimmed.chars().count();
    if len > max_len {
        return Err(LobbyError::InvalidRequest(format!(
            "displayName is {len} characters, limit is {max_len}"
        )));
    }
    Ok(trimmed.to_string())
}

/// Validates host requests and allocates sessions.
pub struct HostService {
    registry: Arc<SessionRegistry>,
    limits: HostLimits,
}

impl HostService {
    pub fn new(registry: Arc<SessionRegistry>, limits: HostLimits) -> Self {
        Self { registry, limits }
    }

    pub fn host(&self, request: HostRequest) -> Result<HostResponse, LobbyError> {
        let host_name = validate_display_name(&request.display_name, self.limits.max_display_name_len)?;
        let capacity = match request.capacity {
            None => self.registry.default_capacity(),
            Some(c) if (1..=self.limits.max_capacity).contains(&c) => c,
            Some(c) => {
                return Err(LobbyError::InvalidRequest(format!(
                    "capacity {c} is outside 1..={}",
                    self.limits.max_capacity
                )))
            }
        };

        let session = self.registry.create_with_capacity(&host_name, capacity);
        tracing::info!(
            session_id = %session.id,
            host = %host_name,
            capacity,
            "Session hosted"
        );
        Ok(HostResponse {
            session_id: session.id,
        })
    }
}
