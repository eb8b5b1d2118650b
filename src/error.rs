//! Our error types for the C3000 pumps.

use thiserror::Error;

use crate::config::ConfigError;
use crate::protocol::DecodeError;
use crate::types::Fault;

pub type Result<T, I> = core::result::Result<T, Error<I>>;

/// Custom error type for C3000 pump communications.
#[derive(Error, Debug)]
pub enum Error<I: embedded_io::Error> {
    #[error("Serial communication error")]
    SerialError(I),
    /// No valid reply could be decoded before the transport timed out.
    #[error("Pump communication error: {0}")]
    Communication(DecodeError),
    /// A reply was framed correctly but its payload made no sense.
    #[error("Invalid response received: {0}")]
    InvalidResponse(DecodeError),
    #[error("Hardware error on pump {pump}: {fault}")]
    HardwareFault { pump: String, fault: Fault },
    #[error("Invalid input: {0}")]
    InvalidInput(#[from] InvalidInput),
    #[error("Too many failed attempts ({attempts}) on pump {pump}")]
    RepeatedOperation { pump: String, attempts: u32 },
    #[error("No pump answered on any dial position for {pump}")]
    DeviceNotFound { pump: String },
    #[error("Receive buffer full")]
    BufferError,
    #[error("Transfer cannot progress with {remaining_ml} ml left to move")]
    TransferStalled { remaining_ml: f64 },
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// A value handed to the crate that it cannot act on.
///
/// Raised by the call receiving the value, before anything is sent.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvalidInput {
    #[error("Valve position {0:?} unknown")]
    UnknownValvePosition(String),
    #[error("Microstep mode {0} is not handled")]
    UnsupportedMicrostepMode(u8),
    #[error("Microstep operand must be in [0-2], got {0}")]
    MicrostepOperand(u8),
    #[error("Flow rate must not be zero")]
    ZeroFlowrate,
    #[error("Syringe volume {0} ml gives less than one step per ml")]
    SyringeVolume(f64),
    #[error("Unknown pump {0:?}")]
    UnknownPump(String),
    #[error("Unknown group {0:?}")]
    UnknownGroup(String),
}
