//! Process-wide identifier allocation.
//!
//! [`IdentifierService`] hands out strictly increasing [`Identifier`]s from a
//! single atomic counter. One instance is created at startup and shared via
//! `Arc` with every component that registers droplets.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Opaque handle naming one configured droplet for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(u64);

impl Identifier {
    /// Raw integer value.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for Identifier {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(Self)
    }
}

/// Atomic counter producing unique identifiers.
#[derive(Debug, Default)]
pub struct IdentifierService {
    next: AtomicU64,
}

impl IdentifierService {
    /// Counter starting at zero.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }

    /// Counter whose first identifier is strictly greater than every one in
    /// `existing`. Used after loading persisted droplets.
    pub fn starting_after<I>(existing: I) -> Self
    where
        I: IntoIterator<Item = Identifier>,
    {
        let first = existing
            .into_iter()
            .map(|id| id.0.saturating_add(1))
            .max()
            .unwrap_or(0);
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Allocate the next identifier. Never returns the same value twice.
    pub fn next_identifier(&self) -> Identifier {
        Identifier(self.next.fetch_add(1, Ordering::Relaxed))
    }
}
