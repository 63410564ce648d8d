//! Confluence: a poll-based message aggregator.
//!
//! Droplets wrap message sources and turn what they fetch into ripples. The
//! scheduler polls every initialized droplet on a worker pool and merges the
//! results into one feed; observers receive it through the event hub.
//!
//! See `DESIGN.md` for the architecture.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod credentials;
pub mod logging;

pub mod identifier;
pub mod interactive;
pub mod ripple;

pub mod droplet;
pub mod state;
pub mod vault;

pub mod dispatch;
pub mod scheduler;

pub mod aggregator;
