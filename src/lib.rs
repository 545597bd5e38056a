//! Terragraph E2E - control plane for a millimeter-wave wireless mesh.
//!
//! This library provides:
//! - The controller: link ignition, topology/status authority, layered
//!   config distribution, coordinated software upgrades, and primary/backup
//!   high availability
//! - The minion: per-node agent mediating the radio firmware through the
//!   netlink driver
//! - The shared message plane (typed envelopes over length-delimited TCP)
//!   both daemons are built on

// =============================================================================
// Lints - Enforce code quality and consistency
// =============================================================================

// Deny truly dangerous patterns (these will fail the build)
#![deny(unsafe_code)]
#![deny(unused_must_use)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]

// App lifecycle plumbing
pub mod apps;

// Message plane
pub mod bus;
pub mod events;
pub mod messages;
pub mod wire;

// Shared domain state
pub mod nodecfg;
pub mod shared;
pub mod topology;

// Subsystems
pub mod ctrl;
pub mod driver;
pub mod minion;
pub mod upgrade;

// Process-level support
pub mod config;
pub mod progress;
