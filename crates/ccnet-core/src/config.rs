//! Backend configuration.

use serde::{Deserialize, Serialize};

use crate::error::NetError;

fn default_request_limit() -> usize {
    32
}

fn default_max_unexpected_frames() -> usize {
    1024
}

/// Tunables applied to every endpoint the engine creates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    /// Maximum requests in flight per endpoint. Hitting the bound makes the
    /// next issue fail; nothing is ever queued behind the caller's back.
    #[serde(default = "default_request_limit")]
    pub request_limit: usize,

    /// Bound on frames buffered per receive endpoint before any posted
    /// receive claims them. Overflow is a transport fault.
    #[serde(default = "default_max_unexpected_frames")]
    pub max_unexpected_frames: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            request_limit: default_request_limit(),
            max_unexpected_frames: default_max_unexpected_frames(),
        }
    }
}

impl NetConfig {
    pub(crate) fn validate(&self) -> Result<(), NetError> {
        if self.request_limit == 0 {
            return Err(NetError::InvalidArgument(
                "request limit must be at least 1",
            ));
        }
        if self.max_unexpected_frames == 0 {
            return Err(NetError::InvalidArgument(
                "unexpected frame bound must be at least 1",
            ));
        }
        Ok(())
    }
}
