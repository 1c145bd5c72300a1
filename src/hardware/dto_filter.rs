//! Transport side routing of received frames
//!
//! [DtoFilter] mirrors what the engine told the transport about each connection and sorts
//! received CAN frames into command return messages and measurement data. DTO frames are
//! decoded against the published package table and turned into [TransportEvent::Samples].

use std::time::{Duration, Instant};

use crate::{
    channel::{CanFrame, ObjectLayout, TransportEvent, TransportRequest},
    codec::ScalarValue,
    dto::DtoTable,
};

/// Transport connection numbers, XCP 0...3 and CCP 4...7
pub const TRANSPORT_CONNECTIONS: usize = 8;

#[derive(Debug, Clone, Default)]
struct Watchdog {
    period: Duration,
    last: Option<Instant>,
}

#[derive(Debug, Clone, Default)]
struct Connection {
    layout: Option<ObjectLayout>,
    active: bool,
    first_pid: u8,
    table: DtoTable,
    seen: Vec<bool>,
    first_sample_sent: bool,
    watchdog: Option<Watchdog>,
}

impl Connection {
    fn forget_dtos(&mut self) {
        self.table = DtoTable::default();
        self.seen.clear();
        self.first_sample_sent = false;
        self.watchdog = None;
    }

    /// Returns true if `frame` is a command return message of this connection
    fn is_response(&self, layout: &ObjectLayout, frame: &CanFrame) -> bool {
        if frame.identifier != layout.crm_id {
            return false;
        }
        // CRM and DTO may share one identifier, PIDs below 0xFE are data then
        layout.crm_id != layout.dto_id || frame.data[0] >= 0xFE
    }
}

/// Sorts received frames by connection and decodes DTOs
#[derive(Debug, Clone)]
pub struct DtoFilter {
    connections: Vec<Connection>,
}

impl Default for DtoFilter {
    fn default() -> Self {
        Self {
            connections: vec![Connection::default(); TRANSPORT_CONNECTIONS],
        }
    }
}

impl DtoFilter {
    /// Creates a filter with every connection inactive
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a request of the engine. Returns the frame to put on the bus for
    /// [TransportRequest::Transmit], `None` for everything else
    pub fn apply(&mut self, request: TransportRequest, now: Instant) -> Option<CanFrame> {
        match request {
            TransportRequest::Transmit(frame) => return Some(frame),
            TransportRequest::SetLayout { connection, layout } => {
                if let Some(c) = self.connections.get_mut(connection) {
                    c.layout = Some(layout);
                }
            }
            TransportRequest::Activate(connection) => {
                if let Some(c) = self.connections.get_mut(connection) {
                    c.active = true;
                }
            }
            TransportRequest::Deactivate(connection) => {
                if let Some(c) = self.connections.get_mut(connection) {
                    c.active = false;
                    c.watchdog = None;
                }
            }
            TransportRequest::PublishDtos {
                connection,
                first_pid,
                table,
            } => {
                if let Some(c) = self.connections.get_mut(connection) {
                    c.forget_dtos();
                    c.first_pid = first_pid;
                    c.seen = vec![false; table.package_count()];
                    c.table = table;
                }
            }
            TransportRequest::RemoveVariables(connection) => {
                if let Some(c) = self.connections.get_mut(connection) {
                    c.forget_dtos();
                }
            }
            TransportRequest::ArmDtoTimeout { connection, timeout_ms } => {
                if let Some(c) = self.connections.get_mut(connection) {
                    c.seen.iter_mut().for_each(|s| *s = false);
                    c.first_sample_sent = false;
                    c.watchdog = (timeout_ms > 0).then(|| Watchdog {
                        period: Duration::from_millis(timeout_ms as u64),
                        last: Some(now),
                    });
                }
            }
        }
        None
    }

    /// Sorts a received frame. A frame matching no active connection produces no event
    pub fn receive(&mut self, frame: &CanFrame, now: Instant) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        for (number, c) in self.connections.iter_mut().enumerate() {
            let Some(layout) = c.layout else { continue };
            if !c.active || layout.channel != frame.channel || layout.extended != frame.extended {
                continue;
            }
            if c.is_response(&layout, frame) {
                events.push(TransportEvent::Response {
                    connection: number,
                    frame: *frame,
                });
                continue;
            }
            if frame.identifier != layout.dto_id {
                continue;
            }
            let Some(pid) = frame.data[0].checked_sub(c.first_pid).map(usize::from) else {
                continue;
            };
            let Some(package) = c.table.packages.get(pid) else {
                continue;
            };
            let values: Vec<_> = package
                .entries
                .iter()
                .filter_map(|e| {
                    let start = e.byte_offset as usize;
                    let bytes = frame.data.get(start..start + e.size as usize)?;
                    ScalarValue::decode(e.kind, bytes, layout.byte_order).map(|v| (e.variable, v))
                })
                .collect();
            if let Some(w) = c.watchdog.as_mut() {
                w.last = Some(now);
            }
            if let Some(seen) = c.seen.get_mut(pid) {
                *seen = true;
            }
            if !values.is_empty() {
                events.push(TransportEvent::Samples {
                    connection: number,
                    values,
                });
            }
            if !c.first_sample_sent && !c.seen.is_empty() && c.seen.iter().all(|s| *s) {
                c.first_sample_sent = true;
                events.push(TransportEvent::FirstSampleReceived(number));
            }
        }
        events
    }

    /// Checks the DTO watchdogs. A connection whose watchdog ran out is reported once
    pub fn poll(&mut self, now: Instant) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        for (number, c) in self.connections.iter_mut().enumerate() {
            let expired = c
                .watchdog
                .as_ref()
                .and_then(|w| w.last.map(|last| now.duration_since(last) > w.period))
                .unwrap_or(false);
            if expired {
                log::warn!("No DTO on transport connection {number} for too long");
                c.watchdog = None;
                events.push(TransportEvent::DtoTimeout(number));
            }
        }
        events
    }

    /// True if the connection currently forwards frames
    pub fn is_active(&self, connection: usize) -> bool {
        self.connections.get(connection).is_some_and(|c| c.active)
    }

    /// Package table published for a connection
    pub fn table(&self, connection: usize) -> Option<&DtoTable> {
        self.connections.get(connection).map(|c| &c.table)
    }
}
