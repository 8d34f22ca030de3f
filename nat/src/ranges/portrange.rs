// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Port ranges used by rule predicates and translation pools.

use super::RangeError;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::num::NonZero;

/// An inclusive, non-empty range of non-zero ports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "PortSpec", into = "PortSpec")]
pub struct PortRange {
    first: NonZero<u16>,
    last: NonZero<u16>,
}

/// Serialized form of a [`PortRange`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortSpec {
    pub first: u16,
    pub last: u16,
}

impl TryFrom<PortSpec> for PortRange {
    type Error = RangeError;
    fn try_from(spec: PortSpec) -> Result<Self, Self::Error> {
        PortRange::new(spec.first, spec.last)
    }
}

impl From<PortRange> for PortSpec {
    fn from(range: PortRange) -> Self {
        PortSpec {
            first: range.first(),
            last: range.last(),
        }
    }
}

impl Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_singleton() {
            write!(f, "{}", self.first)
        } else {
            write!(f, "{}-{}", self.first, self.last)
        }
    }
}

impl PortRange {
    /// Create a `PortRange` from two `u16`. Both must be non-zero and well-ordered
    ///
    /// # Errors
    ///
    /// Returns `RangeError` if any of the ports is zero or last is smaller than first
    pub fn new(first: u16, last: u16) -> Result<Self, RangeError> {
        if last < first {
            Err(RangeError::InvalidPortRange(first, last))
        } else {
            let first = NonZero::try_from(first).map_err(|_| RangeError::InvalidPort(first))?;
            let last = NonZero::try_from(last).map_err(|_| RangeError::InvalidPort(last))?;
            Ok(Self { first, last })
        }
    }

    /// The range used when a rule needs ports but names none.
    #[must_use]
    pub fn unprivileged() -> Self {
        Self {
            first: NonZero::new(1024).unwrap_or_else(|| unreachable!()),
            last: NonZero::new(u16::MAX).unwrap_or_else(|| unreachable!()),
        }
    }

    #[must_use]
    pub fn first(self) -> u16 {
        self.first.get()
    }

    #[must_use]
    pub fn last(self) -> u16 {
        self.last.get()
    }

    #[must_use]
    #[allow(clippy::len_without_is_empty)]
    /// Returns number of ports contained in a `PortRange`
    pub fn len(self) -> u16 {
        self.last.get() - self.first.get() + 1
    }

    #[must_use]
    /// Returns true if a `PortRange` contains a single port
    pub fn is_singleton(self) -> bool {
        self.last == self.first
    }

    #[must_use]
    /// Returns a port at a certain index within the `PortRange` if the index is within the bounds
    pub fn get_port_at(self, index: u16) -> Option<NonZero<u16>> {
        if index >= self.len() {
            None
        } else {
            NonZero::new(self.first.get() + index)
        }
    }

    #[must_use]
    /// Tell if a given port is contained within this `PortRange`
    pub fn contains(&self, port: u16) -> bool {
        port >= self.first.get() && port <= self.last.get()
    }

    #[must_use]
    /// Returns the index of a port within a `PortRange` if it is contained in the range
    pub fn indexof(self, port: u16) -> Option<u16> {
        if self.contains(port) {
            Some(port - self.first.get())
        } else {
            None
        }
    }

    #[must_use]
    /// Given a port of this range, the port at the same index of `other`. When `other` is shorter,
    /// the index wraps around it.
    pub fn map_port_to(self, port: u16, other: Self) -> Option<NonZero<u16>> {
        let index = self.indexof(port)?;
        other.get_port_at(index % other.len())
    }

    #[must_use]
    /// Tell if this `PortRange` overlaps with another
    pub fn overlaps_with(&self, other: Self) -> bool {
        other.contains(self.first()) || other.contains(self.last()) || self.contains(other.first())
    }
}
