//! This crate provides an interface for communicating with and controlling Tricontinent C3000 syringe pumps.
//!
//! A [`pump::PumpController`] drives one pump over any interface implementing
//! [`embedded_io::Read`] and [`embedded_io::Write`]. The pump address is found by
//! trying every dial position in turn, so the pump must be alone on its
//! connection. A [`multi::MultiPumpController`] drives a whole setup described
//! by a JSON [`config::SetupConfig`], and moves groups of pumps in lock step.
//!
//! It speaks the C3000 "DT" ASCII protocol, and is suitable for RS232 or RS485
//! serial links as well as TCP bridges that forward the same bytes.
//!
//! The serial port used for pump comms should be configured like so:
//! * Default baud rate: 9600
//! * Data bits: 8
//! * Stop bits: 1
//! * Parity: None
//!
//! Reads on the interface must time out: a read failing with
//! [`embedded_io::ErrorKind::TimedOut`] ends a reply.
//!
//! Pumps tested with:
//! * C3000 with 3-way Y valve
//! * C3000 with 6-way distribution valve

pub mod config;
pub mod error;
pub mod multi;
pub mod protocol;
pub mod pump;
pub mod syringe;
pub mod types;

#[cfg(test)]
mod mock_serial;
