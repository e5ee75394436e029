/// Result of one forwarded attempt against a target, as recorded with the
/// passive health checker and the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamOutcome {
    /// Response received with this status
    Status(u16),
    /// TCP connect (or resolve) failed
    ConnectError,
    /// Timed out before response headers
    Timeout,
    /// Connection dropped mid-exchange
    Reset,
    /// Response could not be parsed
    Protocol,
}

impl UpstreamOutcome {
    /// Classify against a failure-status set.
    pub fn is_failure(&self, failure_statuses: &[u16], timeout_as_failure: bool) -> bool {
        match self {
            UpstreamOutcome::Status(s) => failure_statuses.contains(s),
            UpstreamOutcome::Timeout => timeout_as_failure,
            UpstreamOutcome::ConnectError
            | UpstreamOutcome::Reset
            | UpstreamOutcome::Protocol => true,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            UpstreamOutcome::Status(s) => Some(*s),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, UpstreamOutcome::Timeout)
    }
}
