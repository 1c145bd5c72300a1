//! Per connection session state and the command stepping shared by CCP and XCP
//!
//! A [Session] is driven once per tick. Every command of a protocol is split into two
//! halves: the issue half transmits one frame and arms the deadline, the wait half
//! polls the connection's inbox until the matching response arrives or the deadline
//! passes. Only one request is ever in flight per connection.
//!
//! The protocol specific part lives behind [CommandTable], which is implemented by the
//! command enum of each protocol.

use std::{
    collections::VecDeque,
    fmt::Debug,
    time::{Duration, Instant},
};

use bitflags::bitflags;
use strum_macros::Display;

use crate::{
    TIMEOUT_ERROR,
    calibration::{CalibrationList, ParameterTransfer, ReadState},
    channel::{CanFrame, ObjectLayout, TransportRequest},
    codec::{ByteOrder, CommandFrame, FRAME_SIZE},
    config::{ConnectionConfig, IniFile, Protocol, SeedKeyMode},
    dto::DtoTable,
    seed_key::{DllSeedKey, SeedKey, SeedKeyError, SeedKeyResult, SimulatedKey},
    variables::VariableStore,
};

/// Timeout used for bulk copies on the target (MOVE_MEMORY, COPY_CAL_PAGE)
pub(crate) const BULK_COPY_TIMEOUT_MS: u32 = 30_000;

/// Responses kept for a CCP connection before the oldest one is dropped
const INBOX_DEPTH: usize = 16;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    /// Connection state mask, published as the `Status` variable
    pub struct ConnectionState: u32 {
        /// The target accepted CONNECT
        const CONNECTED = 0x01;
        /// DAQ lists are running
        const MEASUREMENT_RUNNING = 0x02;
        /// A calibration session is active
        const CALIBRATION_ACTIVE = 0x04;
    }
}

/// High level operation a connection is working on
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CommandSequence {
    /// Idle
    #[default]
    None = 0,
    /// Connect and read the target identification
    ReadEcuInfo = 1,
    /// Set up and start the DAQ lists
    StartMeasurement = 2,
    /// Stop the DAQ lists
    StopMeasurement = 3,
    /// Reserved, finishes immediately
    ReadMemory = 4,
    /// Download a single parameter
    Download = 5,
    /// Upload a single parameter
    Upload = 6,
    /// Open a calibration session
    StartCalibration = 7,
    /// Close the calibration session
    StopCalibration = 8,
    /// Keep alive round trip of an idle calibration session
    AlivePing = 9,
}

/// What a session is started or stopped for
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SessionMode {
    /// Measurement (DAQ)
    Measure,
    /// Calibration
    Calibrate,
}

/// Classified command return message
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Response {
    /// Positive response, full frame
    Ack([u8; FRAME_SIZE]),
    /// Negative response with the protocol error code
    Nack(u8),
}

/// Result of the issue half of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Issue<C> {
    /// Transmit this frame and wait for its response. `timeout_ms` overrides the
    /// configured timeout
    Send {
        frame: [u8; FRAME_SIZE],
        timeout_ms: Option<u32>,
    },
    /// Nothing to transmit, continue with another command next tick
    Goto(C),
    /// Nothing to do yet
    Wait,
    /// The sequence is complete
    Finish,
    /// Tear the connection down with this error
    Teardown(i32),
}

impl<C> Issue<C> {
    pub(crate) fn send(frame: CommandFrame) -> Self {
        Issue::Send {
            frame: frame.into_bytes(),
            timeout_ms: None,
        }
    }

    pub(crate) fn send_with_timeout(frame: CommandFrame, timeout_ms: u32) -> Self {
        Issue::Send {
            frame: frame.into_bytes(),
            timeout_ms: Some(timeout_ms),
        }
    }
}

/// Result of handling a response in the wait half of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome<C> {
    /// Continue with this command next tick
    Next(C),
    /// The sequence is complete
    Finish,
    /// Stop the sequence and keep the error, lists stay as they are
    Abort(i32),
    /// Tear the connection down with this error
    Teardown(i32),
}

/// Everything a command needs from outside its own session during one tick
pub(crate) struct Ctx<'a> {
    pub now: Instant,
    pub ini: &'a IniFile,
    pub store: &'a mut dyn VariableStore,
    pub requests: &'a mut Vec<TransportRequest>,
}

/// Protocol specific command table
pub(crate) trait CommandTable: Copy + Debug + PartialEq + Sized {
    /// Protocol family of the table
    const PROTOCOL: Protocol;
    /// True if responses go through a one slot mailbox that only accepts a frame
    /// while a request is outstanding. Otherwise they are queued
    const MAILBOX: bool;

    /// Protocol specific scratch state of a session
    type Scratch: Debug + Default;

    /// First command of `sequence`. `None` finishes the sequence right away
    fn start_point(sequence: CommandSequence) -> Option<Self>;

    /// Numeric code of the command, published as the `Command` variable
    fn code(self) -> u32;

    /// Issue half of the command
    fn issue(self, session: &mut Session<Self>, ctx: &mut Ctx<'_>) -> Issue<Self>;

    /// Handles a positive response to the command
    fn on_ack(self, data: &[u8; FRAME_SIZE], session: &mut Session<Self>, ctx: &mut Ctx<'_>) -> Outcome<Self>;

    /// Handles a negative response to the command
    fn on_nack(self, code: u8, _session: &mut Session<Self>, _ctx: &mut Ctx<'_>) -> Outcome<Self> {
        Outcome::Abort(code as i32)
    }

    /// Sorts a received frame. `None` means the frame is ignored
    fn classify(data: &[u8; FRAME_SIZE], session: &Session<Self>) -> Option<Response>;

    /// Text of an error code, including [TIMEOUT_ERROR]
    fn error_text(code: i32) -> String;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SlotFlag {
    Idle,
    Waiting,
    Arrived,
}

/// Command return messages of one connection waiting to be matched
#[derive(Debug, Clone)]
enum Inbox {
    Queue(VecDeque<[u8; FRAME_SIZE]>),
    Slot { flag: SlotFlag, data: [u8; FRAME_SIZE] },
}

impl Inbox {
    fn new(mailbox: bool) -> Self {
        if mailbox {
            Inbox::Slot {
                flag: SlotFlag::Idle,
                data: [0; FRAME_SIZE],
            }
        } else {
            Inbox::Queue(VecDeque::new())
        }
    }

    /// A request went out, stale responses are dropped
    fn arm(&mut self) {
        match self {
            Inbox::Queue(q) => q.clear(),
            Inbox::Slot { flag, .. } => *flag = SlotFlag::Waiting,
        }
    }

    fn deliver(&mut self, frame: [u8; FRAME_SIZE]) {
        match self {
            Inbox::Queue(q) => {
                if q.len() >= INBOX_DEPTH {
                    q.pop_front();
                }
                q.push_back(frame);
            }
            Inbox::Slot { flag, data } => {
                if *flag == SlotFlag::Waiting {
                    *data = frame;
                    *flag = SlotFlag::Arrived;
                }
            }
        }
    }

    fn take(&mut self) -> Option<[u8; FRAME_SIZE]> {
        match self {
            Inbox::Queue(q) => q.pop_front(),
            Inbox::Slot { flag, data } => {
                if *flag == SlotFlag::Arrived {
                    *flag = SlotFlag::Idle;
                    Some(*data)
                } else {
                    None
                }
            }
        }
    }

    /// The taken frame was not the awaited response, keep listening
    fn resume(&mut self) {
        if let Inbox::Slot { flag, .. } = self {
            *flag = SlotFlag::Waiting;
        }
    }

    fn reset(&mut self) {
        match self {
            Inbox::Queue(q) => q.clear(),
            Inbox::Slot { flag, .. } => *flag = SlotFlag::Idle,
        }
    }
}

/// What the target told us about itself
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct TargetInfo {
    /// CCP protocol version, major in the high byte
    pub version: u16,
    /// Identification string
    pub id: Vec<u8>,
    /// Announced length of the identification
    pub id_len: usize,
    pub availability: u8,
    pub protection: u8,
    pub daq_size: u8,
    pub daq_pid: u8,
    pub max_cto: u8,
    pub max_dto: u16,
}

impl TargetInfo {
    /// Identification as text, up to the first NUL
    pub fn id_string(&self) -> String {
        let end = self.id.iter().position(|b| *b == 0).unwrap_or(self.id.len());
        String::from_utf8_lossy(&self.id[..end]).into_owned()
    }

    /// Bytes of the identification still to upload, at most `chunk`
    pub fn id_chunk(&self, chunk: usize) -> usize {
        self.id_len.saturating_sub(self.id.len()).min(chunk)
    }

    /// Appends uploaded identification bytes. Returns true once complete
    pub fn push_id(&mut self, bytes: &[u8]) -> bool {
        let n = self.id_chunk(bytes.len());
        self.id.extend_from_slice(&bytes[..n]);
        self.id.len() >= self.id_len
    }
}

/// A parameter transfer in progress, chunked over several frames
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Transfer {
    pub param: ParameterTransfer,
    pub pos: usize,
    pub buffer: Vec<u8>,
}

impl Transfer {
    pub fn new(param: ParameterTransfer) -> Self {
        Self {
            param,
            pos: 0,
            buffer: Vec::new(),
        }
    }

    /// Bytes still to move, at most `chunk`
    pub fn chunk(&self, chunk: usize) -> usize {
        self.param.size().saturating_sub(self.pos).min(chunk)
    }

    pub fn is_complete(&self) -> bool {
        self.pos >= self.param.size()
    }
}

/// State of one CCP or XCP connection
#[derive(Debug)]
pub(crate) struct Session<C: CommandTable> {
    pub index: usize,
    pub config: ConnectionConfig,
    /// Byte order used on the wire, may differ from the configured one after an XCP CONNECT
    pub byte_order: ByteOrder,
    pub state: ConnectionState,
    pub sequence: CommandSequence,
    pub requested: CommandSequence,
    pub command: Option<C>,
    pub waiting: bool,
    pub error: i32,
    deadline: Option<Instant>,
    /// Set by the transport once every DTO package was received after arming the watchdog
    pub first_sample: bool,
    /// Names handed to the last `start` call
    pub labels: Vec<String>,
    pub dtos: DtoTable,
    pub calibration: CalibrationList,
    pub upload_in_progress: bool,
    pub alive_ticks: u32,
    pub target: TargetInfo,
    pub transfer: Option<Transfer>,
    /// Replaces the configured seed & key computation
    pub seed_key: Option<Box<dyn SeedKey>>,
    pub scratch: C::Scratch,
    inbox: Inbox,
}

impl<C: CommandTable> Session<C> {
    pub fn new(index: usize) -> Self {
        let config = ConnectionConfig::defaults(C::PROTOCOL);
        Self {
            index,
            byte_order: config.byte_order,
            config,
            state: ConnectionState::empty(),
            sequence: CommandSequence::None,
            requested: CommandSequence::None,
            command: None,
            waiting: false,
            error: 0,
            deadline: None,
            first_sample: false,
            labels: Vec::new(),
            dtos: DtoTable::default(),
            calibration: CalibrationList::default(),
            upload_in_progress: false,
            alive_ticks: 0,
            target: TargetInfo::default(),
            transfer: None,
            seed_key: None,
            scratch: C::Scratch::default(),
            inbox: Inbox::new(C::MAILBOX),
        }
    }

    /// Transport connection number of this session
    pub fn transport_connection(&self) -> usize {
        C::PROTOCOL.transport_connection(self.index)
    }

    /// Starts a frame in the session's wire byte order
    pub fn frame(&self, opcode: u8) -> CommandFrame {
        CommandFrame::new(opcode, self.byte_order)
    }

    /// Rereads the configuration and publishes the CAN objects to the transport
    pub fn reload_config(&mut self, ctx: &mut Ctx<'_>) {
        self.config = ConnectionConfig::from_ini(ctx.ini, C::PROTOCOL, self.index);
        if !self.state.contains(ConnectionState::CONNECTED) {
            self.byte_order = self.config.byte_order;
        }
        ctx.requests.push(TransportRequest::SetLayout {
            connection: self.transport_connection(),
            layout: ObjectLayout {
                channel: self.config.channel,
                cro_id: self.config.cro_id,
                crm_id: self.config.crm_id,
                dto_id: self.config.dto_id,
                extended: self.config.extended_ids,
                byte_order: self.byte_order,
            },
        });
    }

    pub fn push(&self, ctx: &mut Ctx<'_>, request: fn(usize) -> TransportRequest) {
        ctx.requests.push(request(self.transport_connection()));
    }

    /// True if nothing is queued, running or still being uploaded
    pub fn is_done(&self) -> bool {
        self.requested == CommandSequence::None
            && self.sequence == CommandSequence::None
            && !self.upload_in_progress
    }

    /// Published `Command` value: twice the command code, plus one while waiting for
    /// the response
    pub fn command_code(&self) -> u32 {
        self.command
            .map(|c| c.code() * 2 + self.waiting as u32)
            .unwrap_or(0)
    }

    /// Arms `sequence` at its first command
    pub fn start_sequence(&mut self, sequence: CommandSequence) {
        log::debug!("{} {}: {sequence} started", C::PROTOCOL, self.index);
        self.sequence = sequence;
        self.command = C::start_point(sequence);
        self.waiting = false;
        self.deadline = None;
    }

    /// One tick of the connection
    pub fn tick(&mut self, ctx: &mut Ctx<'_>, alive_threshold: u32) {
        if self.sequence == CommandSequence::None && self.requested != CommandSequence::None {
            let sequence = std::mem::take(&mut self.requested);
            log::info!("{} {}: {sequence}", C::PROTOCOL, self.index);
            self.start_sequence(sequence);
        } else if self.sequence == CommandSequence::None
            && self.state.contains(ConnectionState::CALIBRATION_ACTIVE)
        {
            self.poll_calibration(ctx);
            if !self.state.contains(ConnectionState::MEASUREMENT_RUNNING) {
                if self.sequence != CommandSequence::None {
                    self.alive_ticks = 0;
                } else if self.alive_ticks >= alive_threshold {
                    self.alive_ticks = 0;
                    self.start_sequence(CommandSequence::AlivePing);
                    self.step(ctx);
                } else {
                    self.alive_ticks += 1;
                }
            }
        } else if self.sequence != CommandSequence::None {
            self.step(ctx);
        }
    }

    fn poll_calibration(&mut self, ctx: &mut Ctx<'_>) {
        if self.upload_in_progress {
            match self.calibration.poll_read_next() {
                ReadState::Upload(param) => {
                    self.transfer = Some(Transfer::new(param));
                    self.start_sequence(CommandSequence::Upload);
                }
                ReadState::Skip => {}
                ReadState::Done => {
                    log::debug!("{} {}: all parameters uploaded", C::PROTOCOL, self.index);
                    self.upload_in_progress = false;
                }
            }
        } else if let Some(param) = self.calibration.poll_write(ctx.store, self.byte_order) {
            self.transfer = Some(Transfer::new(param));
            self.start_sequence(CommandSequence::Download);
        }
    }

    /// Advances the active sequence by one half command
    pub fn step(&mut self, ctx: &mut Ctx<'_>) {
        let Some(command) = self.command else {
            self.finish();
            return;
        };
        if !self.waiting {
            match command.issue(self, ctx) {
                Issue::Send { frame, timeout_ms } => self.transmit(frame, timeout_ms, ctx),
                Issue::Goto(next) => self.command = Some(next),
                Issue::Wait => {}
                Issue::Finish => self.finish(),
                Issue::Teardown(code) => self.teardown(code, ctx),
            }
            return;
        }

        if let Some(data) = self.inbox.take() {
            match C::classify(&data, self) {
                Some(Response::Ack(data)) => {
                    if self.config.debug {
                        log::debug!("{} {} {command:?} ACK: {data:02X?}", C::PROTOCOL, self.index);
                    }
                    let outcome = command.on_ack(&data, self, ctx);
                    self.apply(outcome, ctx);
                    return;
                }
                Some(Response::Nack(code)) => {
                    let outcome = command.on_nack(code, self, ctx);
                    self.apply(outcome, ctx);
                    return;
                }
                None => self.inbox.resume(),
            }
        }
        if self.deadline.is_some_and(|d| ctx.now > d) {
            log::error!("{}: Timeout", C::PROTOCOL);
            self.teardown(TIMEOUT_ERROR, ctx);
        }
    }

    fn apply(&mut self, outcome: Outcome<C>, ctx: &mut Ctx<'_>) {
        match outcome {
            Outcome::Next(next) => {
                self.command = Some(next);
                self.waiting = false;
                self.deadline = None;
            }
            Outcome::Finish => self.finish(),
            Outcome::Abort(code) => self.abort(code),
            Outcome::Teardown(code) => self.teardown(code, ctx),
        }
    }

    fn transmit(&mut self, data: [u8; FRAME_SIZE], timeout_ms: Option<u32>, ctx: &mut Ctx<'_>) {
        let frame = CanFrame::new(
            self.config.channel,
            self.config.cro_id,
            self.config.extended_ids,
            data,
        );
        if self.config.debug {
            log::debug!(
                "{} {} {:?}: ({}/0x{:X}) {data:02X?}",
                C::PROTOCOL,
                self.index,
                self.command,
                frame.channel,
                frame.identifier
            );
        }
        self.inbox.arm();
        ctx.requests.push(TransportRequest::Transmit(frame));
        self.deadline = match self.config.timeout_ms {
            0 => None,
            configured => {
                let ms = timeout_ms.unwrap_or(configured);
                Some(ctx.now + Duration::from_millis(ms as u64))
            }
        };
        self.waiting = true;
    }

    /// Hands a command return message to the session
    pub fn deliver(&mut self, data: [u8; FRAME_SIZE]) {
        self.inbox.deliver(data);
    }

    /// Ends the sequence normally
    pub fn finish(&mut self) {
        if self.sequence != CommandSequence::None {
            log::debug!("{} {}: {} finished", C::PROTOCOL, self.index, self.sequence);
        }
        self.sequence = CommandSequence::None;
        self.command = None;
        self.waiting = false;
        self.deadline = None;
    }

    /// Ends the sequence after a negative response. Lists are kept
    pub fn abort(&mut self, code: i32) {
        log::error!(
            "{} {}: protocol error: {}! ({code:02X}H)",
            C::PROTOCOL,
            self.index,
            C::error_text(code)
        );
        self.finish();
        self.error = code;
        self.state.remove(ConnectionState::CONNECTED);
    }

    /// Releases both lists and tells the transport to forget the connection
    fn release_all(&mut self, ctx: &mut Ctx<'_>) {
        self.dtos.release(ctx.store);
        self.calibration.delete(ctx.store);
        self.push(ctx, TransportRequest::Deactivate);
        self.push(ctx, TransportRequest::RemoveVariables);
        self.finish();
        self.state = ConnectionState::empty();
        self.upload_in_progress = false;
        self.transfer = None;
        self.inbox.reset();
    }

    /// Uniform teardown after a timeout or an unrecoverable failure
    pub fn teardown(&mut self, code: i32, ctx: &mut Ctx<'_>) {
        self.release_all(ctx);
        self.error = code;
    }

    /// The transport saw no DTO for too long
    pub fn on_dto_timeout(&mut self, ctx: &mut Ctx<'_>) {
        log::error!(
            "Timeout {} measurement connection {} stopped (receive some time no DTO messages)",
            C::PROTOCOL,
            self.index
        );
        self.release_all(ctx);
    }

    /// Computes a key with the injected provider or the configured one
    pub fn compute_key(&self, library: &str, privilege: u8, seed: &[u8]) -> SeedKeyResult<Vec<u8>> {
        if let Some(provider) = &self.seed_key {
            return provider.compute_key(privilege, seed);
        }
        match self.config.seed_key {
            SeedKeyMode::Simulated => SimulatedKey.compute_key(privilege, seed),
            SeedKeyMode::Dll => DllSeedKey::new(library, C::PROTOCOL).compute_key(privilege, seed),
            SeedKeyMode::None => Err(SeedKeyError::NotConfigured),
        }
    }

    /// True if a seed & key exchange is configured or injected
    pub fn uses_seed_key(&self) -> bool {
        self.seed_key.is_some() || self.config.seed_key != SeedKeyMode::None
    }
}
