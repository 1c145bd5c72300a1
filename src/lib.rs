#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_numeric_casts,
    //unstable_features,
    //unused_imports,
    unused_import_braces,
    unused_qualifications,
    clippy::uninlined_format_args
)]

//! A crate which provides measurement and calibration client sessions for ECUs speaking
//! CCP or XCP on CAN
//!
//! ## Protocol support
//!
//! ### CAN Calibration Protocol (CCP)
//! ASAM CCP 2.1, with 2.0 targets supported by emulating the commands 2.0 lacks.
//! Targets needing the DAQ bit of the session status to be maintained, and targets that only
//! stop a single DAQ list, are selected through the configured protocol version.
//!
//! ### Universal Measurement and Calibration Protocol (XCP)
//! XCP on CAN, covering connection, identification, seed & key, dynamic DAQ configuration and
//! calibration page handling.
//!
//! ## Sessions
//!
//! Up to 4 connections per protocol are driven by an [Engine]. A connection can measure
//! (stream signals through DAQ lists) and calibrate (keep parameters in sync with the target)
//! at the same time over one CONNECT. Every operation is non blocking, the engine advances each
//! connection by at most one request per [Engine::tick].
//!
//! ## Transports
//!
//! The engine talks to the CAN bus through a [channel::Transport]. [hardware] contains
//! an in process channel transport, a simulated transport for bench tests and, on Linux, a
//! SocketCAN backend behind the `socketcan` feature.
//!
//! ## Seed & key
//!
//! Protected targets are unlocked with vendor libraries (ASAP1A entry points) loaded at run
//! time with the default `seed-key-dll` feature, or with a custom [seed_key::SeedKey] set on
//! a connection.

pub mod calibration;
pub mod ccp;
pub mod channel;
pub mod codec;
pub mod config;
pub mod dto;
pub mod engine;
pub mod hardware;
pub mod seed_key;
mod session;
pub mod variables;
pub mod xcp;

use calibration::CalibrationError;
use channel::ChannelError;
use config::ConfigError;
use dto::DtoError;
use seed_key::SeedKeyError;

pub use config::Protocol;
pub use engine::{Engine, MAX_CONNECTIONS};
pub use session::{CommandSequence, ConnectionState, SessionMode};

/// Error code of a connection whose target stopped answering
pub const TIMEOUT_ERROR: i32 = -1;

/// Error code of a measurement whose signals could not be packed into DTOs
pub const DTO_BUILD_ERROR: i32 = -2;

/// Engine result
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
/// Error returned by the [Engine] API
pub enum EngineError {
    /// Connection index is out of range
    #[error("Invalid connection {0}, only 0...3 are available")]
    InvalidConnection(usize),
    /// An other command is still pending on the connection
    #[error("Connection is busy with an other command")]
    Busy,
    /// The CAN process is not running
    #[error("CAN transport is not running")]
    TransportUnavailable,
    /// The connection is not measuring or calibrating
    #[error("{0}")]
    NotActive(String),
    /// Error with underlying communication channel
    #[error("Transport channel error")]
    ChannelError(
        #[from]
        #[source]
        ChannelError,
    ),
    /// Configuration could not be read or written
    #[error("Configuration error")]
    ConfigError(
        #[from]
        #[source]
        ConfigError,
    ),
    /// Seed & key computation failed
    #[error("Seed & key error")]
    SeedKeyError(
        #[from]
        #[source]
        SeedKeyError,
    ),
    /// The signals do not fit the DAQ lists of the target
    #[error("DTO build error")]
    DtoError(
        #[from]
        #[source]
        DtoError,
    ),
    /// The calibration list could not be built
    #[error("Calibration list error")]
    CalibrationError(
        #[from]
        #[source]
        CalibrationError,
    ),
}

/// Converts a protocol error code into a human readable description
pub trait ProtocolError {
    /// Returns a string description of the error
    fn desc(&self) -> String;
}
