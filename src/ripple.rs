//! Normalized message records and feed ordering.
//!
//! A [`Ripple`] is what every droplet produces, whatever the provider. The
//! feed order is newest first; equal timestamps put the smaller
//! provider-local id first.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::identifier::Identifier;

/// One normalized message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ripple {
    id: u64,
    sender: String,
    subject: String,
    content: String,
    received_date: i64,
}

impl Ripple {
    /// Build a ripple. `received_date` is milliseconds since the Unix epoch.
    pub fn new(
        id: u64,
        sender: impl Into<String>,
        subject: impl Into<String>,
        content: impl Into<String>,
        received_date: i64,
    ) -> Self {
        Self {
            id,
            sender: sender.into(),
            subject: subject.into(),
            content: content.into(),
            received_date,
        }
    }

    /// Provider-local message id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Display name of the sender.
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Subject line.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Message body.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Receive timestamp in epoch milliseconds.
    pub fn received_date(&self) -> i64 {
        self.received_date
    }
}

impl Ord for Ripple {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .received_date
            .cmp(&self.received_date)
            .then_with(|| self.id.cmp(&other.id))
            .then_with(|| self.sender.cmp(&other.sender))
            .then_with(|| self.subject.cmp(&other.subject))
            .then_with(|| self.content.cmp(&other.content))
    }
}

impl PartialOrd for Ripple {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A ripple together with the droplet that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaggedRipple {
    /// Producing droplet.
    pub source: Identifier,
    /// The message.
    pub ripple: Ripple,
}

impl Ord for TaggedRipple {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ripple
            .cmp(&other.ripple)
            .then_with(|| self.source.cmp(&other.source))
    }
}

impl PartialOrd for TaggedRipple {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Merge per-droplet batches into one display-ready sequence.
///
/// The result does not depend on the order batches arrive in.
pub fn merge<I>(batches: I) -> Vec<TaggedRipple>
where
    I: IntoIterator<Item = (Identifier, Vec<Ripple>)>,
{
    let mut merged: Vec<TaggedRipple> = batches
        .into_iter()
        .flat_map(|(source, ripples)| {
            ripples
                .into_iter()
                .map(move |ripple| TaggedRipple { source, ripple })
        })
        .collect();
    merged.sort_unstable();
    merged
}
