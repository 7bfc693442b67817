//! Session configuration.

use std::collections::HashMap;
use std::time::Duration;

use crate::ble::connection::SessionState;
use crate::ble::transport::{status, LinkError};

/// Default time after which an unstopped scan stops itself.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default capacity of a transport's event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 100;

/// Terminal state a failed connection resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FailureOutcome {
    /// The session ends quietly; the caller may retry.
    Disconnected,
    /// The session ends in the error state.
    Error,
}

impl FailureOutcome {
    /// The session state this outcome resolves to.
    pub fn session_state(&self) -> SessionState {
        match self {
            Self::Disconnected => SessionState::Disconnected,
            Self::Error => SessionState::Error,
        }
    }
}

/// Maps link failure statuses to terminal outcomes.
///
/// A link that goes down without any status always resolves to
/// [`FailureOutcome::Disconnected`]. Statuses missing from the table use the
/// default outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FailureClassifier {
    table: HashMap<u16, FailureOutcome>,
    default_outcome: FailureOutcome,
}

impl FailureClassifier {
    /// A classifier with an empty table.
    pub fn new(default_outcome: FailureOutcome) -> Self {
        Self {
            table: HashMap::new(),
            default_outcome,
        }
    }

    /// Map a status to an outcome.
    pub fn with_status(mut self, status: u16, outcome: FailureOutcome) -> Self {
        self.table.insert(status, outcome);
        self
    }

    /// Set the outcome for statuses missing from the table.
    pub fn with_default(mut self, outcome: FailureOutcome) -> Self {
        self.default_outcome = outcome;
        self
    }

    /// The outcome for statuses missing from the table.
    pub fn default_outcome(&self) -> FailureOutcome {
        self.default_outcome
    }

    /// Classify a link failure.
    pub fn classify(&self, error: Option<&LinkError>) -> FailureOutcome {
        match error {
            None => FailureOutcome::Disconnected,
            Some(error) => self
                .table
                .get(&error.status)
                .copied()
                .unwrap_or(self.default_outcome),
        }
    }
}

impl Default for FailureClassifier {
    /// Timeouts and orderly terminations are not errors; anything else is.
    fn default() -> Self {
        Self::new(FailureOutcome::Error)
            .with_status(status::CONNECTION_TIMEOUT, FailureOutcome::Disconnected)
            .with_status(status::REMOTE_USER_TERMINATED, FailureOutcome::Disconnected)
            .with_status(status::LOCAL_HOST_TERMINATED, FailureOutcome::Disconnected)
    }
}

/// Configuration for a [`crate::ConnectionSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct SessionConfig {
    /// How long a scan runs before it stops by itself.
    pub scan_timeout: Duration,
    /// How link failures are classified.
    pub failure_classifier: FailureClassifier,
}

impl SessionConfig {
    /// Set the scan timeout.
    pub fn with_scan_timeout(mut self, scan_timeout: Duration) -> Self {
        self.scan_timeout = scan_timeout;
        self
    }

    /// Set the failure classifier.
    pub fn with_failure_classifier(mut self, failure_classifier: FailureClassifier) -> Self {
        self.failure_classifier = failure_classifier;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            failure_classifier: FailureClassifier::default(),
        }
    }
}
