//! BACnet Data Link Layer Module
//!
//! This module implements the data link layer for BACnet communication over
//! MS/TP (Master-Slave/Token-Passing), the RS-485 field bus defined in
//! ASHRAE 135 Clause 9. The data link layer sits between the physical layer
//! and the network layer, handling frame-level communication and medium
//! access control.
//!
//! # Overview
//!
//! The data link layer is responsible for:
//! - **Frame Assembly/Disassembly**: Constructing and parsing MS/TP frames
//! - **Error Detection**: CRC calculation and verification for data integrity
//! - **Media Access Control**: Circulating the token that grants the right
//!   to transmit on the shared bus
//! - **Reply Management**: Answering data frames within the protocol's reply
//!   window, or postponing the answer when the upper layer is slow
//!
//! See [`mstp`] for the master node implementation.

use std::error::Error;
use std::fmt;

/// Result type for data link operations.
pub type Result<T> = std::result::Result<T, DataLinkError>;

/// Errors that can occur during data link layer operations.
///
/// Configuration and frame-type errors are programmer errors surfaced at the
/// API boundary; framing errors on the wire never reach the caller, they are
/// consumed by the state machine.
#[derive(Debug)]
pub enum DataLinkError {
    /// I/O error on the underlying octet stream.
    IoError(std::io::Error),

    /// Invalid frame format detected.
    ///
    /// A frame does not conform to the MS/TP structure, for example a data
    /// field longer than the 501 octet maximum or a truncated buffer.
    InvalidFrame,

    /// CRC check failed during frame validation.
    CrcError,

    /// Address validation failed. The string carries the specifics.
    AddressError(String),

    /// A configuration value is outside its permitted range.
    InvalidConfiguration(String),

    /// The frame type may not be submitted through this entry point.
    FrameTypeNotAllowed(u8),

    /// The transmit queue has reached its capacity.
    QueueFull,
}

impl fmt::Display for DataLinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataLinkError::IoError(e) => write!(f, "I/O error: {}", e),
            DataLinkError::InvalidFrame => write!(f, "Invalid frame format"),
            DataLinkError::CrcError => write!(f, "CRC check failed"),
            DataLinkError::AddressError(msg) => write!(f, "Address error: {}", msg),
            DataLinkError::InvalidConfiguration(msg) => {
                write!(f, "Invalid configuration: {}", msg)
            }
            DataLinkError::FrameTypeNotAllowed(t) => {
                write!(f, "Frame type 0x{:02X} not allowed here", t)
            }
            DataLinkError::QueueFull => write!(f, "Transmit queue full"),
        }
    }
}

impl Error for DataLinkError {}

impl From<std::io::Error> for DataLinkError {
    fn from(error: std::io::Error) -> Self {
        DataLinkError::IoError(error)
    }
}

/// MS/TP (Master-Slave/Token-Passing) implementation.
///
/// This module provides BACnet communication over RS-485 serial links using a
/// token-passing protocol. It's commonly used for field-level devices due to
/// its low cost and ability to support long cable runs.
pub mod mstp;
