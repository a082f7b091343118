//! Identifier and counter definitions.

use crate::define_id;

define_id!(
    /// Handle of an authenticated (or anonymous) session on the orchestrator.
    SessionId,
    "sess"
);

define_id!(
    /// Token pairing a control-channel request with its reply.
    CorrelationId,
    "corr"
);

define_id!(
    /// Handle of one entry in a delay scheduler.
    TimerId,
    "tmr"
);

// =============================================================================
// Revision
// =============================================================================

/// Monotonic modification counter of a settings subject.
///
/// Starts at [`Revision::ZERO`] for a subject that was never configured and is
/// bumped on every effective change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Revision(u64);

impl Revision {
    /// Revision of a never-modified subject.
    pub const ZERO: Self = Self(0);

    /// Creates a revision from a raw counter.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw counter.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the following revision.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

impl serde::Serialize for Revision {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Revision {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Self)
    }
}
