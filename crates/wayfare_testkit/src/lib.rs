//! # Wayfare Testkit
//!
//! Test utilities for the Wayfare sync engine.
//!
//! This crate provides:
//! - An in-memory remote backend with scripted faults
//! - Simulated devices wired like the app wires the engine
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use wayfare_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn trip_reaches_second_device() {
//!     let remote = InMemoryRemote::new();
//!     let phone = Device::with_remote("phone", &remote.route("graphql"));
//!     let tablet = Device::with_remote("tablet", &remote.route("graphql"));
//!     let trip = phone.create_trip("Patagonia");
//!     phone.sync().await;
//!     tablet.sync().await;
//!     assert_converged(&phone, &tablet, &[trip.key]);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod remote;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::remote::*;
}

pub use fixtures::*;
pub use generators::*;
pub use remote::*;
