//! Resource and unit identifiers
//!
//! Both sets are closed and known at build time. Adding a variant is a
//! schema change for downstream consumers.

use crate::error::ObservationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Category of shared infrastructure being consumed
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceId {
    Compute,
    Memory,
    Storage,
    Network,
    QueueBytes,
    QueueMessages,
    Cache,
}

impl ResourceId {
    pub const ALL: [ResourceId; 7] = [
        ResourceId::Compute,
        ResourceId::Memory,
        ResourceId::Storage,
        ResourceId::Network,
        ResourceId::QueueBytes,
        ResourceId::QueueMessages,
        ResourceId::Cache,
    ];

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceId::Compute => "compute",
            ResourceId::Memory => "memory",
            ResourceId::Storage => "storage",
            ResourceId::Network => "network",
            ResourceId::QueueBytes => "queue-bytes",
            ResourceId::QueueMessages => "queue-messages",
            ResourceId::Cache => "cache",
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceId {
    type Err = ObservationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        ResourceId::ALL
            .into_iter()
            .find(|r| r.as_str() == normalized)
            .ok_or_else(|| {
                ObservationError::InvalidObservation(format!("unrecognized resource '{}'", s))
            })
    }
}

/// Unit of measure for an amount
///
/// Amounts are always summed within a unit; the unit is part of the
/// aggregation key so different units never mix.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageUnit {
    Milliseconds,
    Bytes,
    BytesSec,
    Count,
}

impl UsageUnit {
    pub const ALL: [UsageUnit; 4] = [
        UsageUnit::Milliseconds,
        UsageUnit::Bytes,
        UsageUnit::BytesSec,
        UsageUnit::Count,
    ];

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageUnit::Milliseconds => "milliseconds",
            UsageUnit::Bytes => "bytes",
            UsageUnit::BytesSec => "bytes_sec",
            UsageUnit::Count => "count",
        }
    }
}

impl fmt::Display for UsageUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UsageUnit {
    type Err = ObservationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        UsageUnit::ALL
            .into_iter()
            .find(|u| u.as_str() == normalized)
            .ok_or_else(|| {
                ObservationError::InvalidObservation(format!("unrecognized unit '{}'", s))
            })
    }
}
