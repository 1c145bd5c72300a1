//! The hardware module contains the transports the engine can run on
//!
//! * [channel_transport] - An in process transport over [std::sync::mpsc], for a CAN process
//!   running on its own thread
//! * [simulation::SimulationTransport] - A transport that answers CRO frames with a
//!   simulated ECU, used for bench tests
//! * [socketcan::SocketCanTransport] - SocketCAN interfaces (Linux only, `socketcan` feature)
//!
//! Backends that talk to real CAN hardware use [DtoFilter] to sort received frames.

pub mod dto_filter;
pub mod simulation;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
    mpsc::{self, Receiver, Sender, TryRecvError},
};

pub use dto_filter::DtoFilter;

use crate::channel::{ChannelError, ChannelResult, Transport, TransportEvent, TransportRequest};

/// Creates a connected transport pair. The [ChannelTransport] goes to the engine, the
/// [TransportPeer] to the CAN process
pub fn channel_transport() -> (ChannelTransport, TransportPeer) {
    let (req_tx, req_rx) = mpsc::channel();
    let (evt_tx, evt_rx) = mpsc::channel();
    let running = Arc::new(AtomicBool::new(true));
    (
        ChannelTransport {
            requests: req_tx,
            events: evt_rx,
            running: running.clone(),
        },
        TransportPeer {
            requests: req_rx,
            events: evt_tx,
            running,
        },
    )
}

/// Engine side of [channel_transport]
#[derive(Debug)]
pub struct ChannelTransport {
    requests: Sender<TransportRequest>,
    events: Receiver<TransportEvent>,
    running: Arc<AtomicBool>,
}

impl Transport for ChannelTransport {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    fn send(&mut self, request: TransportRequest) -> ChannelResult<()> {
        self.requests.send(request).map_err(|_| {
            self.running.store(false, Ordering::Relaxed);
            ChannelError::Disconnected
        })
    }

    fn try_recv(&mut self) -> Option<TransportEvent> {
        match self.events.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.running.store(false, Ordering::Relaxed);
                None
            }
        }
    }
}

/// CAN process side of [channel_transport]. Dropping it stops the transport
#[derive(Debug)]
pub struct TransportPeer {
    requests: Receiver<TransportRequest>,
    events: Sender<TransportEvent>,
    running: Arc<AtomicBool>,
}

impl TransportPeer {
    /// Returns the next request of the engine without blocking
    pub fn try_recv_request(&self) -> ChannelResult<Option<TransportRequest>> {
        match self.requests.try_recv() {
            Ok(r) => Ok(Some(r)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ChannelError::Disconnected),
        }
    }

    /// Waits for the next request of the engine
    pub fn recv_request(&self) -> ChannelResult<TransportRequest> {
        self.requests.recv().map_err(|_| ChannelError::Disconnected)
    }

    /// Hands an event to the engine
    pub fn send_event(&self, event: TransportEvent) -> ChannelResult<()> {
        self.events.send(event).map_err(|_| ChannelError::Disconnected)
    }

    /// Marks the CAN process as running or stopped
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
    }
}

impl Drop for TransportPeer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}
