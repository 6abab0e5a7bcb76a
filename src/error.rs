//! Error types for semaphore operations.

use std::time::Duration;

use snafu::Snafu;

/// Errors from semaphore construction, acquisition and release.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SemaphoreError {
    /// Capacity must be at least one permit.
    #[snafu(display("invalid capacity {capacity}: must be >= 1"))]
    InvalidCapacity {
        /// The rejected capacity.
        capacity: u32,
    },

    /// Permit count outside the valid range for this operation.
    #[snafu(display("invalid permit count {requested}: must be within 1..={capacity}"))]
    InvalidPermitCount {
        /// Permits requested.
        requested: u32,
        /// Capacity of the semaphore.
        capacity: u32,
    },

    /// A lease was presented to a semaphore that did not issue it.
    #[snafu(display("lease issued by {lease_owner} cannot be released on {semaphore}"))]
    ForeignLease {
        /// Issuer recorded on the lease.
        lease_owner: String,
        /// The semaphore the lease was presented to.
        semaphore: String,
    },

    /// Capacity did not free up within the deadline.
    ///
    /// Expected under load; callers decide whether to retry, escalate or
    /// abandon.
    #[snafu(display("timed out after {timeout:?} waiting for {permits} permits on {semaphore}"))]
    LeaseTimeout {
        /// Permits that were requested.
        permits: u32,
        /// Deadline that elapsed.
        timeout: Duration,
        /// Description of the semaphore instance.
        semaphore: String,
    },

    /// The backing store reported a genuine failure.
    ///
    /// Script-cache misses are handled internally and never surface here.
    #[snafu(display("store error: {source}"))]
    Store {
        /// The underlying store error.
        source: redis::RedisError,
    },

    /// A pooled store connection could not be checked out.
    #[snafu(display("store unavailable: {reason}"))]
    StoreUnavailable {
        /// Human-readable description of the failure.
        reason: String,
    },

    /// A script replied with something outside the protocol.
    #[snafu(display("malformed reply from script '{script}': {detail}"))]
    MalformedReply {
        /// Name of the script.
        script: &'static str,
        /// What was wrong with the reply.
        detail: String,
    },
}

impl From<redis::RedisError> for SemaphoreError {
    fn from(source: redis::RedisError) -> Self {
        SemaphoreError::Store { source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_timeout_display_carries_context() {
        let err = SemaphoreError::LeaseTimeout {
            permits: 3,
            timeout: Duration::from_secs(30),
            semaphore: "jobs semaphore#7".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("3 permits"));
        assert!(msg.contains("30s"));
        assert!(msg.contains("jobs semaphore#7"));
    }

    #[test]
    fn invalid_permit_count_display() {
        let err = SemaphoreError::InvalidPermitCount {
            requested: 9,
            capacity: 5,
        };
        assert_eq!(err.to_string(), "invalid permit count 9: must be within 1..=5");
    }
}
