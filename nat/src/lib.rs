// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Stateful network address translation.
//!
//! [`NatEngine`] translates datagrams crossing a translation point. Outbound traffic matching a
//! MAP rule gets its source rewritten from the rule's pool; inbound traffic matching a REDIRECT
//! rule gets its destination rewritten; bimap and map-block rules compute the translation
//! arithmetically. Every translation creates a session indexed both by the original and by the
//! translated tuple, so replies are rewritten back and ICMP errors about the flow are repaired.

#![deny(clippy::all, clippy::unwrap_used, clippy::expect_used)]
#![allow(clippy::missing_errors_doc)]

pub mod alloc;
pub mod config;
pub mod engine;
mod frag;
pub mod lookup;
pub mod pressure;
pub mod ranges;
pub mod rules;
pub mod session;
pub mod stats;
pub mod sync;
pub mod walk;

pub use config::{ConfigError, NatConfig, NatTimeouts};
pub use engine::{BlockReason, FlushMode, NatEngine, NatError, NatLookup, NatVerdict, WildcardSpec};
pub use rules::{NatRuleSpec, RuleError, RuleId, RuleKind};
pub use session::{NatTuple, SessionId};

use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Direction of a datagram relative to the translation point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NatDirection {
    /// Leaving the internal network
    Outbound,
    /// Entering the internal network
    Inbound,
}

impl NatDirection {
    /// The opposite direction.
    #[must_use]
    pub fn reverse(self) -> Self {
        match self {
            NatDirection::Outbound => NatDirection::Inbound,
            NatDirection::Inbound => NatDirection::Outbound,
        }
    }
}

impl Display for NatDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NatDirection::Outbound => write!(f, "out"),
            NatDirection::Inbound => write!(f, "in"),
        }
    }
}
