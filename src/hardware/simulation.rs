//! Simulation hardware for testing calibration sessions without a CAN bus

use std::{collections::VecDeque, fmt, time::Instant};

use crate::channel::{CanFrame, ChannelResult, Transport, TransportEvent, TransportRequest};

use super::DtoFilter;

/// Simulated ECU. Called with every transmitted CRO frame, returns the frames the
/// ECU puts on the bus in reply
pub type SimulatedEcu = Box<dyn FnMut(&CanFrame) -> Vec<CanFrame> + Send>;

/// Transport that answers transmitted frames with a [SimulatedEcu]
///
/// Replies are routed through a [DtoFilter] exactly like frames received from a real
/// bus, so responses show up on the next [Transport::try_recv].
pub struct SimulationTransport {
    ecu: SimulatedEcu,
    filter: DtoFilter,
    events: VecDeque<TransportEvent>,
    requests: Vec<TransportRequest>,
    running: bool,
    clock: Option<Instant>,
}

impl fmt::Debug for SimulationTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulationTransport")
            .field("filter", &self.filter)
            .field("events", &self.events)
            .field("running", &self.running)
            .finish()
    }
}

impl SimulationTransport {
    /// Creates a running transport around a simulated ECU
    pub fn new<F>(ecu: F) -> Self
    where
        F: FnMut(&CanFrame) -> Vec<CanFrame> + Send + 'static,
    {
        Self {
            ecu: Box::new(ecu),
            filter: DtoFilter::new(),
            events: VecDeque::new(),
            requests: Vec::new(),
            running: true,
            clock: None,
        }
    }

    /// Simulates the CAN process starting or stopping
    pub fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    /// Pins the time the DTO watchdog is evaluated with. Without a pinned time the
    /// wall clock is used
    pub fn set_clock(&mut self, now: Instant) {
        self.clock = Some(now);
    }

    fn now(&self) -> Instant {
        self.clock.unwrap_or_else(Instant::now)
    }

    /// Puts a frame on the simulated bus as if the ECU sent it unprompted,
    /// such as a DTO
    pub fn inject(&mut self, frame: &CanFrame) {
        let now = self.now();
        self.events.extend(self.filter.receive(frame, now));
    }

    /// Every request the engine issued so far
    pub fn requests(&self) -> &[TransportRequest] {
        &self.requests
    }

    /// Every frame the engine transmitted so far
    pub fn transmitted(&self) -> Vec<CanFrame> {
        self.requests
            .iter()
            .filter_map(|r| match r {
                TransportRequest::Transmit(f) => Some(*f),
                _ => None,
            })
            .collect()
    }

    /// Forgets the request log
    pub fn clear_requests(&mut self) {
        self.requests.clear();
    }

    /// Frame routing state
    pub fn filter(&self) -> &DtoFilter {
        &self.filter
    }
}

impl Transport for SimulationTransport {
    fn is_running(&self) -> bool {
        self.running
    }

    fn send(&mut self, request: TransportRequest) -> ChannelResult<()> {
        self.requests.push(request.clone());
        let now = self.now();
        if let Some(frame) = self.filter.apply(request, now) {
            for reply in (self.ecu)(&frame) {
                self.events.extend(self.filter.receive(&reply, now));
            }
        }
        Ok(())
    }

    fn try_recv(&mut self) -> Option<TransportEvent> {
        let now = self.now();
        self.events.extend(self.filter.poll(now));
        self.events.pop_front()
    }
}
