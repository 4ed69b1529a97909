//! Write firmware images to the flash of ESP32 devices
//!
//! `flashwriter` talks to the serial bootloader of an ESP32, either the one
//! in ROM or a flasher stub uploaded to RAM, and writes one or more
//! `(offset, image)` pairs to its flash, verifying every one of them with an
//! MD5 digest computed on the device.
//!
//! The [controller::SessionController] is the entry point for applications:
//! it owns the [connection::Connection], runs writes on a worker thread and
//! reports what happens as a stream of [events::Event]s.
//!
//! ## Cargo Features
//!
//! - `cli`: the command-line interface and the `flashwriter` binary
//! - `serialport`: [transport::SerialTransport], a transport over a serial
//!   port

#![cfg_attr(docsrs, feature(doc_cfg))]

pub use self::error::Error;

#[cfg(feature = "cli")]
#[cfg_attr(docsrs, doc(cfg(feature = "cli")))]
pub mod cli;
pub mod config;
pub mod connection;
pub mod controller;
pub mod error;
pub mod events;
pub mod flasher;
pub mod image_format;
pub mod slip;
pub mod targets;
pub mod transport;
