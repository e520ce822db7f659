//! # Introduction
//!
//! This crate is the engine behind `aft`: it flashes an OS image onto a
//! device under test, reserves that device across concurrent processes
//! with advisory file locks, runs an ordered external test plan against
//! it and writes an xunit report of the results.
//!
//! Configuration is a set of named-section `key=value` files: a platform
//! map selecting drivers per image, a device catalog mapping images and
//! probed signatures to models, a topology describing the wired-up
//! hardware and a test plan listing the cases to run. Drivers for
//! concrete hardware implement the [`DeviceDriver`], [`CutterDriver`]
//! and [`TesterDriver`] traits and register in a [`PluginRegistry`];
//! reference drivers that shell out to external tools ship in
//! [`drivers`].
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use aft_engine::{drivers, Pipeline, PluginRegistry, RunOutcome};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut registry = PluginRegistry::new();
//!     registry.register_cutter("usbrelay", Arc::new(drivers::ShellCutter::new("cutter_on_off")));
//!     registry.register_device("shelldevice", Arc::new(drivers::ShellDevice::new()));
//!     registry.register_tester("shelltester", Arc::new(drivers::ShellTester::new()));
//!
//!     let mut pipeline = Pipeline::new(&registry, "core-image.ext4", "/etc/aft/platform.cfg");
//!     assert_eq!(pipeline.run(false).await, RunOutcome::Success);
//! }
//! ```

mod catalog;
pub mod config;
mod device;
pub mod drivers;
mod error;
mod pattern;
mod pipeline;
mod registry;
mod reservation;
mod runner;
mod testplan;
mod topology;

#[cfg(test)]
pub(crate) mod testing;

pub use catalog::{Catalog, CatalogEntry};
pub use device::{Channel, CutterDriver, Device, DeviceDescriptor, DeviceDriver};
pub use error::Error;
pub use pipeline::{Pipeline, RunOutcome, SuccessLatch};
pub use registry::PluginRegistry;
pub use reservation::{ReservationLock, ReserveOptions};
pub use runner::{CmdOutcome, CmdResult, CommandRunner};
pub use testplan::{TestCase, TestContext, TestPlan, TestReport, TesterDriver};
pub use topology::Topology;
