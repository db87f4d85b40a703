//! Error classification and retry policy, generalized from the named retry
//! policies used for the four Raft RPC kinds.
//!
//! This module is deliberately transport-agnostic: any `RaftNetwork`
//! implementation can wrap its RPC calls in [`ErrorHandler::execute_with_retry`].

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;

use crate::error::{ErrorType, NetworkError};

/// Backoff parameters for one named RPC kind.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn is_valid(&self) -> bool {
        self.initial_delay <= self.max_delay
            && self.backoff_multiplier >= 1.0
            && (0.0..=1.0).contains(&self.jitter_factor)
            && self.max_attempts >= 1
    }

    /// Delay before retry attempt `k` (1-based): `min(initial * mult^(k-1), max) * (1 + U[-jitter, jitter])`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi((attempt.max(1) - 1) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = if self.jitter_factor > 0.0 {
            rand::thread_rng().gen_range(-self.jitter_factor, self.jitter_factor)
        } else {
            0.0
        };
        let jittered = (capped * (1.0 + jitter)).max(0.001);
        Duration::from_secs_f64(jittered)
    }
}

/// The outcome of classifying a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ErrorClassification {
    pub kind: ErrorType,
    pub should_retry: bool,
}

/// Classifies network errors and drives the exponential-backoff retry loop
/// for the four named Raft RPC kinds (`heartbeat`, `append_entries`,
/// `request_vote`, `install_snapshot`), plus a partition-detection heuristic.
#[derive(Clone, Debug)]
pub struct ErrorHandler {
    policies: HashMap<String, RetryPolicy>,
}

impl Default for ErrorHandler {
    fn default() -> Self {
        let mut policies = HashMap::new();
        policies.insert(
            "heartbeat".to_string(),
            RetryPolicy {
                initial_delay: Duration::from_millis(50),
                max_delay: Duration::from_millis(1000),
                backoff_multiplier: 1.5,
                jitter_factor: 0.1,
                max_attempts: 3,
            },
        );
        policies.insert(
            "append_entries".to_string(),
            RetryPolicy {
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_millis(5000),
                backoff_multiplier: 2.0,
                jitter_factor: 0.1,
                max_attempts: 5,
            },
        );
        policies.insert(
            "request_vote".to_string(),
            RetryPolicy {
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_millis(2000),
                backoff_multiplier: 2.0,
                jitter_factor: 0.1,
                max_attempts: 3,
            },
        );
        policies.insert(
            "install_snapshot".to_string(),
            RetryPolicy {
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_millis(30_000),
                backoff_multiplier: 2.0,
                jitter_factor: 0.1,
                max_attempts: 10,
            },
        );
        Self { policies }
    }
}

impl ErrorHandler {
    pub fn set_policy(&mut self, operation: impl Into<String>, policy: RetryPolicy) {
        self.policies.insert(operation.into(), policy);
    }

    pub fn policy_for(&self, operation: &str) -> RetryPolicy {
        self.policies.get(operation).copied().unwrap_or(RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(5000),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 5,
        })
    }

    /// Classify a `NetworkError` into a retry decision. `SerializationError`
    /// and `ProtocolError` are never retryable.
    pub fn classify(&self, err: &NetworkError) -> ErrorClassification {
        let should_retry = !matches!(err.kind, ErrorType::SerializationError | ErrorType::ProtocolError);
        ErrorClassification { kind: err.kind, should_retry }
    }

    /// `true` when at least 2/3 of the last (at least 3) classified errors
    /// were network-related, suggesting the node is partitioned.
    pub fn detect_partition(&self, recent: &[ErrorClassification]) -> bool {
        if recent.len() < 3 {
            return false;
        }
        let network_related = recent
            .iter()
            .filter(|c| {
                matches!(
                    c.kind,
                    ErrorType::NetworkTimeout | ErrorType::NetworkUnreachable | ErrorType::ConnectionRefused
                )
            })
            .count();
        network_related * 3 >= recent.len() * 2
    }

    /// Run `op` under the named policy, retrying on retryable errors with
    /// exponential backoff until it succeeds, a non-retryable error occurs,
    /// or `max_attempts` is exhausted.
    pub async fn execute_with_retry<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, NetworkError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, NetworkError>>,
    {
        let policy = self.policy_for(operation);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let classification = self.classify(&err);
                    if !classification.should_retry || attempt >= policy.max_attempts {
                        return Err(err);
                    }
                    tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_policies_match_named_constants() {
        let handler = ErrorHandler::default();
        let hb = handler.policy_for("heartbeat");
        assert_eq!(hb.max_attempts, 3);
        assert_eq!(hb.initial_delay, Duration::from_millis(50));
        let install = handler.policy_for("install_snapshot");
        assert_eq!(install.max_attempts, 10);
        assert_eq!(install.max_delay, Duration::from_millis(30_000));
    }

    #[test]
    fn unknown_operation_falls_back_to_a_sane_default() {
        let handler = ErrorHandler::default();
        let fallback = handler.policy_for("not_a_real_rpc");
        assert!(fallback.is_valid());
    }

    #[test]
    fn partition_heuristic_needs_two_thirds_network_errors() {
        let handler = ErrorHandler::default();
        let mostly_network = vec![
            ErrorClassification { kind: ErrorType::NetworkTimeout, should_retry: true },
            ErrorClassification { kind: ErrorType::NetworkUnreachable, should_retry: true },
            ErrorClassification { kind: ErrorType::ProtocolError, should_retry: false },
        ];
        assert!(handler.detect_partition(&mostly_network));

        let mostly_protocol = vec![
            ErrorClassification { kind: ErrorType::ProtocolError, should_retry: false },
            ErrorClassification { kind: ErrorType::ProtocolError, should_retry: false },
            ErrorClassification { kind: ErrorType::NetworkTimeout, should_retry: true },
        ];
        assert!(!handler.detect_partition(&mostly_protocol));
    }

    #[test]
    fn serialization_and_protocol_errors_never_retry() {
        let handler = ErrorHandler::default();
        let ser = NetworkError::new(ErrorType::SerializationError, "bad payload");
        assert!(!handler.classify(&ser).should_retry);
        let proto = NetworkError::new(ErrorType::ProtocolError, "invalid term");
        assert!(!handler.classify(&proto).should_retry);
    }
}
