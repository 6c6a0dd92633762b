//! Readiness gate.
//!
//! A job with a ready marker only runs once the marker file has been
//! deposited in its source directory. The marker is only looked at, never
//! created or removed here.

use crate::config::ReadyPolicy;
use crate::endpoint::SourceEndpoint;
use crate::error::NotReadyError;

#[derive(Debug, Clone, Copy)]
pub struct ReadinessGate<'a> {
    policy: &'a ReadyPolicy,
}

impl<'a> ReadinessGate<'a> {
    pub fn new(policy: &'a ReadyPolicy) -> Self {
        ReadinessGate { policy }
    }

    pub fn marker(&self) -> Option<&'a str> {
        self.policy.marker.as_deref()
    }

    /// Fail with `NotReadyError` if a marker is configured and absent.
    ///
    /// A marker that cannot be checked counts as absent.
    pub fn check(&self, job_id: &str, source: &mut SourceEndpoint<'_>) -> Result<(), NotReadyError> {
        let marker = match self.marker() {
            Some(m) => m,
            None => return Ok(()),
        };
        let present = source.has_marker(marker).unwrap_or_else(|e| {
            tracing::warn!("cannot check ready marker {}: {}", marker, e);
            false
        });
        if present {
            tracing::debug!("ready marker {} found", marker);
            Ok(())
        } else {
            Err(NotReadyError {
                job_id: job_id.to_string(),
                marker: marker.to_string(),
            })
        }
    }
}
