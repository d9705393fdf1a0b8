//! Acquisition driver for an Arduino-based TCSPC histogrammer.
//!
//! This library contains the device controller, the live acquisition worker, the
//! backends (serial device, simulation, scripted mock) and the detector plugin a
//! data-acquisition host drives. It is used by the `tcspc` command-line host.
//!
//! # Layout
//!
//! - [`settings`]: typed device settings and their limits
//! - [`hardware`]: backends and the serial line protocol
//! - [`controller`]: connection, settings guard, start/stop
//! - [`worker`]: the read/accumulate/publish loop
//! - [`plugin`]: the host-facing detector plugin
//! - [`config`], [`logging`], [`storage`]: configuration, tracing setup, CSV export

pub mod config;
pub mod controller;
pub mod core;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod plugin;
pub mod settings;
pub mod storage;
pub mod worker;
