//! Module for the transport boundary between the session engine and the CAN process
//!
//! The engine never touches a CAN interface itself. Everything it wants from the bus
//! is handed to a [Transport] as a [TransportRequest], and everything the bus produces
//! comes back as a [TransportEvent]. Neither direction blocks.
//!
//! Transport connection numbers are shared by both protocols:
//! * 0...3 - XCP connections 0...3
//! * 4...7 - CCP connections 0...3

use crate::{
    codec::{ByteOrder, FRAME_SIZE, ScalarValue},
    dto::DtoTable,
    variables::VariableId,
};

/// Communication channel result
pub type ChannelResult<T> = Result<T, ChannelError>;

#[derive(Debug, thiserror::Error)]
/// Error produced by a transport
pub enum ChannelError {
    /// Underlying IO Error with channel
    #[error("IO error")]
    IOError(
        #[from]
        #[source]
        std::io::Error,
    ),
    /// The other end of the transport has gone away
    #[error("transport peer has disconnected")]
    Disconnected,
    /// The channels Tx buffer is full
    #[error("channel's Transmit buffer is full")]
    BufferFull,
    /// Unsupported transport request
    #[error("unsupported transport request")]
    UnsupportedRequest,
    /// The interface is not open
    #[error("channel's interface is not open")]
    InterfaceNotOpen,
}

/// A single classic CAN frame
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CanFrame {
    /// Logical CAN channel the frame belongs to
    pub channel: u8,
    /// CAN identifier
    pub identifier: u32,
    /// 29 bit identifier
    pub extended: bool,
    /// Data length code
    pub size: u8,
    /// Payload, bytes past `size` are zero
    pub data: [u8; FRAME_SIZE],
}

impl CanFrame {
    /// Creates a full 8 byte frame
    pub fn new(channel: u8, identifier: u32, extended: bool, data: [u8; FRAME_SIZE]) -> Self {
        Self {
            channel,
            identifier,
            extended,
            size: FRAME_SIZE as u8,
            data,
        }
    }

    /// Creates a frame from a payload of up to 8 bytes
    pub fn from_slice(channel: u8, identifier: u32, extended: bool, payload: &[u8]) -> Self {
        let mut data = [0u8; FRAME_SIZE];
        let size = payload.len().min(FRAME_SIZE);
        data[..size].copy_from_slice(&payload[..size]);
        Self {
            channel,
            identifier,
            extended,
            size: size as u8,
            data,
        }
    }

    /// Valid part of the payload
    pub fn payload(&self) -> &[u8] {
        &self.data[..(self.size as usize).min(FRAME_SIZE)]
    }
}

/// CAN objects and byte order used by one connection.
/// Published to the transport before a connection is activated
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ObjectLayout {
    /// CAN channel
    pub channel: u8,
    /// Command receive object, master to slave
    pub cro_id: u32,
    /// Command return message, slave to master
    pub crm_id: u32,
    /// Data transmission object, slave to master
    pub dto_id: u32,
    /// Identifiers are 29 bit
    pub extended: bool,
    /// Byte order of the target
    pub byte_order: ByteOrder,
}

/// Requests the session engine issues to the transport.
/// Every `usize` is a transport connection number
#[derive(Debug, Clone, PartialEq)]
pub enum TransportRequest {
    /// Put a frame on the bus
    Transmit(CanFrame),
    /// Install the CAN objects of a connection
    SetLayout {
        /// Transport connection number
        connection: usize,
        /// Objects of the connection
        layout: ObjectLayout,
    },
    /// Start forwarding CRM and DTO frames of a connection
    Activate(usize),
    /// Stop forwarding frames of a connection
    Deactivate(usize),
    /// Install the DTO layout of a connection
    PublishDtos {
        /// Transport connection number
        connection: usize,
        /// PID of the first package
        first_pid: u8,
        /// Package layout
        table: DtoTable,
    },
    /// Forget the DTO layout and measurement variables of a connection
    RemoveVariables(usize),
    /// Raise [TransportEvent::DtoTimeout] if no DTO arrives within `timeout_ms`.
    /// A value of 0 disables the watchdog
    ArmDtoTimeout {
        /// Transport connection number
        connection: usize,
        /// Watchdog period
        timeout_ms: u32,
    },
}

/// Events the transport hands back to the session engine
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A command return message
    Response {
        /// Transport connection number the CRM object belongs to
        connection: usize,
        /// Received frame
        frame: CanFrame,
    },
    /// The DTO watchdog of a connection ran out
    DtoTimeout(usize),
    /// The first DTO after [TransportRequest::ArmDtoTimeout] arrived
    FirstSampleReceived(usize),
    /// Decoded measurement values
    Samples {
        /// Transport connection number
        connection: usize,
        /// Decoded values
        values: Vec<(VariableId, ScalarValue)>,
    },
}

/// Non blocking link to the CAN process
pub trait Transport: Send {
    /// Returns false once the CAN process is gone. Sessions refuse to start while
    /// the transport is not running
    fn is_running(&self) -> bool;

    /// Hands a request to the transport
    ///
    /// ## Parameters
    /// * request - The request to deliver. Requests of one connection must be processed in order
    fn send(&mut self, request: TransportRequest) -> ChannelResult<()>;

    /// Returns the next pending event, or `None` if nothing is queued
    fn try_recv(&mut self) -> Option<TransportEvent>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn is_running(&self) -> bool {
        (**self).is_running()
    }

    fn send(&mut self, request: TransportRequest) -> ChannelResult<()> {
        (**self).send(request)
    }

    fn try_recv(&mut self) -> Option<TransportEvent> {
        (**self).try_recv()
    }
}
