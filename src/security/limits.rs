//! Request size limits.
//!
//! # Responsibilities
//! - Reject a declared `Content-Length` over the limit before any body is read
//! - Reject a body once the accumulated size crosses the limit
//!
//! # Design Decisions
//! - Header and line limits live in the decoder; this module only owns body size
//! - A limit of zero or less in configuration means unlimited

use crate::config::LimitsConfig;
use crate::error::RequestError;
use crate::http::decoder::BodyFraming;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestSizeLimit {
    max: Option<usize>,
}

impl RequestSizeLimit {
    pub fn new(max: Option<usize>) -> Self {
        Self { max }
    }

    pub fn from_config(config: &LimitsConfig) -> Self {
        Self::new(config.max_request_size())
    }

    pub fn max(&self) -> Option<usize> {
        self.max
    }

    /// Early check against the framing announced in the head.
    pub fn check_declared(&self, framing: BodyFraming) -> Result<(), RequestError> {
        match (self.max, framing) {
            (Some(limit), BodyFraming::Length(declared)) if declared > limit as u64 => {
                Err(RequestError::RequestTooLarge {
                    limit,
                    received: usize::try_from(declared).unwrap_or(usize::MAX),
                })
            }
            _ => Ok(()),
        }
    }

    /// Check after each body chunk.
    pub fn check_received(&self, received: usize) -> Result<(), RequestError> {
        match self.max {
            Some(limit) if received > limit => Err(RequestError::RequestTooLarge { limit, received }),
            _ => Ok(()),
        }
    }
}
