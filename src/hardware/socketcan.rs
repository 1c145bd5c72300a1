//! SocketCAN transport
//!
//! Every interface handed to [SocketCanTransport::open] becomes one CAN channel, the first
//! interface is channel 0. Sockets are non blocking, received frames are collected whenever
//! the engine polls for events.

use std::{collections::VecDeque, io::ErrorKind, time::Instant};

use socketcan::{CanSocket, EmbeddedFrame, ExtendedId, Id, Socket, StandardId};

use crate::channel::{CanFrame, ChannelError, ChannelResult, Transport, TransportEvent, TransportRequest};

use super::DtoFilter;

/// Frames read from one interface per poll, so a flooded bus cannot stall a tick
const MAX_READS_PER_POLL: usize = 256;

#[derive(Debug)]
struct Interface {
    name: String,
    socket: CanSocket,
}

/// Transport on one or more SocketCAN interfaces
#[derive(Debug)]
pub struct SocketCanTransport {
    interfaces: Vec<Interface>,
    filter: DtoFilter,
    events: VecDeque<TransportEvent>,
    running: bool,
}

impl SocketCanTransport {
    /// Opens the interfaces, `interfaces[n]` becomes CAN channel `n`
    pub fn open(interfaces: &[&str]) -> ChannelResult<Self> {
        let mut opened = Vec::with_capacity(interfaces.len());
        for name in interfaces {
            let socket = CanSocket::open(name)?;
            socket.set_nonblocking(true)?;
            log::info!("SocketCAN channel {} on {name}", opened.len());
            opened.push(Interface {
                name: name.to_string(),
                socket,
            });
        }
        if opened.is_empty() {
            return Err(ChannelError::InterfaceNotOpen);
        }
        Ok(Self {
            interfaces: opened,
            filter: DtoFilter::new(),
            events: VecDeque::new(),
            running: true,
        })
    }

    fn transmit(&mut self, frame: &CanFrame) -> ChannelResult<()> {
        let iface = self
            .interfaces
            .get(frame.channel as usize)
            .ok_or(ChannelError::InterfaceNotOpen)?;
        let id: Id = if frame.extended {
            ExtendedId::new(frame.identifier).map(Id::Extended)
        } else {
            u16::try_from(frame.identifier)
                .ok()
                .and_then(StandardId::new)
                .map(Id::Standard)
        }
        .ok_or(ChannelError::UnsupportedRequest)?;
        let out = socketcan::CanFrame::new(id, frame.payload()).ok_or(ChannelError::UnsupportedRequest)?;
        match iface.socket.write_frame(&out) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(ChannelError::BufferFull),
            Err(e) => Err(e.into()),
        }
    }

    fn collect(&mut self) {
        let now = Instant::now();
        for (channel, iface) in self.interfaces.iter().enumerate() {
            for _ in 0..MAX_READS_PER_POLL {
                let read = match iface.socket.read_frame() {
                    Ok(f) => f,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        log::error!("Cannot read from {}: {e}", iface.name);
                        self.running = false;
                        break;
                    }
                };
                if !read.is_data_frame() {
                    continue;
                }
                let identifier = match read.id() {
                    Id::Standard(id) => id.as_raw() as u32,
                    Id::Extended(id) => id.as_raw(),
                };
                let frame = CanFrame::from_slice(channel as u8, identifier, read.is_extended(), read.data());
                self.events.extend(self.filter.receive(&frame, now));
            }
        }
        self.events.extend(self.filter.poll(now));
    }
}

impl Transport for SocketCanTransport {
    fn is_running(&self) -> bool {
        self.running
    }

    fn send(&mut self, request: TransportRequest) -> ChannelResult<()> {
        match self.filter.apply(request, Instant::now()) {
            Some(frame) => self.transmit(&frame),
            None => Ok(()),
        }
    }

    fn try_recv(&mut self) -> Option<TransportEvent> {
        if self.events.is_empty() {
            self.collect();
        }
        self.events.pop_front()
    }
}
