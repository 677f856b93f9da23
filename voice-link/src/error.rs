//! Failure taxonomy for the voice session.
//!
//! Every hardware or network failure is converted into a `SessionError` at
//! the point where it happens. The session manager only looks at the
//! variant to decide between an automatic retry and a terminal error.

/// Errors that can end (or interrupt) a voice session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Microphone access was refused by the OS or the user.
    PermissionDenied(String),
    /// No usable input/output device, or the audio subsystem is unavailable.
    CapabilityMissing(String),
    /// Network hiccup or abnormal close. Eligible for automatic retry.
    Transient(String),
    /// The remote service rejected the session (bad key, bad config, policy).
    Policy(String),
}

/// Coarse classification used by the retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    PermissionDenied,
    CapabilityMissing,
    Transient,
    Policy,
}

impl SessionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::PermissionDenied(_) => FailureKind::PermissionDenied,
            Self::CapabilityMissing(_) => FailureKind::CapabilityMissing,
            Self::Transient(_) => FailureKind::Transient,
            Self::Policy(_) => FailureKind::Policy,
        }
    }

    /// Only transient failures are retried automatically.
    pub fn is_retriable(&self) -> bool {
        self.kind() == FailureKind::Transient
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PermissionDenied(msg) => write!(f, "Microphone permission denied: {}", msg),
            Self::CapabilityMissing(msg) => write!(f, "Audio device unavailable: {}", msg),
            Self::Transient(msg) => write!(f, "Connection lost: {}", msg),
            Self::Policy(msg) => write!(f, "Session rejected by the service: {}", msg),
        }
    }
}

impl std::error::Error for SessionError {}
