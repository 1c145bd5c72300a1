//! Module for CCP (CAN Calibration Protocol 2.1)
//!
//! Every CRO frame carries the command code in byte 0 and the command counter in byte 1.
//! A command return message starts with 0xFF, echoes the error code in byte 1 and the
//! counter in byte 2. Frames starting with 0xFE are event messages.
//!
//! Protocol version 2.0 targets are supported by emulating START_STOP_ALL with a single
//! START_STOP of DAQ list 0. Targets that need the DAQ bit of the session status to be
//! maintained are selected with the `2.1 S_STATUS` protocol version string.

use crate::{
    ProtocolError, DTO_BUILD_ERROR, TIMEOUT_ERROR,
    calibration::CalibrationList,
    channel::TransportRequest,
    codec::{ByteOrder, CommandFrame, FRAME_SIZE},
    config::{CcpQuirks, Protocol},
    dto,
    seed_key::CCP_MAX_KEY,
    session::{
        BULK_COPY_TIMEOUT_MS, CommandSequence, CommandTable, ConnectionState, Ctx, Issue, Outcome, Response,
        Session, Transfer,
    },
};

mod error;
pub use error::*;

/// CCP command codes
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum CcpCommand {
    /// Connect to a station
    Connect = 0x01,
    /// Set memory transfer address 0 or 1
    SetMta = 0x02,
    /// Download up to 5 bytes
    Dnload = 0x03,
    /// Upload up to 5 bytes
    Upload = 0x04,
    /// Start, stop or prepare a single DAQ list
    StartStop = 0x06,
    /// Disconnect from a station
    Disconnect = 0x07,
    /// Start or stop all prepared DAQ lists
    StartStopAll = 0x08,
    /// Set the session status
    SetSStatus = 0x0C,
    /// Read the session status
    GetSStatus = 0x0D,
    /// Select the calibration page at MTA 0
    SelectCalPage = 0x11,
    /// Request a seed for a resource
    GetSeed = 0x12,
    /// Send the key for the last seed
    Unlock = 0x13,
    /// Read the size of a DAQ list
    GetDaqSize = 0x14,
    /// Set the DAQ list pointer
    SetDaqPtr = 0x15,
    /// Write a DAQ list entry
    WriteDaq = 0x16,
    /// Exchange station identifications
    ExchangeId = 0x17,
    /// Copy a memory block from MTA 0 to MTA 1
    MoveMemory = 0x19,
    /// Negotiate the protocol version
    GetCcpVersion = 0x1B,
}

impl From<CcpCommand> for u8 {
    fn from(cmd: CcpCommand) -> Self {
        cmd as u8
    }
}

/// Command counter. The target echoes it in every acknowledge
const CTR: u8 = 0xAA;
/// Address of this master in EXCHANGE_ID
const MASTER_ADDRESS: u8 = 0;

/// Calibration privilege
pub const PL_CAL: u8 = 0x01;
/// DAQ privilege
pub const PL_DAQ: u8 = 0x02;

/// DAQ running bit of the session status
const SS_DAQ: u8 = 0x02;
/// GET_S_STATUS attempts before the DAQ bit is cleared by force
const SS_ATTEMPTS: u32 = 5;
/// Bytes of one UPLOAD / DNLOAD
const CHUNK: usize = 5;
/// Longest identification kept
const MAX_ID_LEN: usize = 254;

/// Scratch data of a CCP session
#[derive(Debug, Default)]
pub(crate) struct CcpScratch {
    seed: [u8; 4],
    session_status: u8,
    status_attempts: u32,
    odt: usize,
    entry: usize,
}

/// CCP command steps. Each step transmits one frame and waits for its
/// acknowledge, unless noted otherwise
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum CcpStep {
    /// No frame. Resets the error and picks the first real step
    StartPoint = 1,
    StopAll,
    GetSessionStatus,
    ClearSessionStatus,
    /// No frame. Releases the DTO table after the lists were stopped
    MeasurementStopped,
    Connect,
    GetVersion,
    GetSeed,
    Unlock,
    /// DAQ seed of a calibration session
    GetSeedDaq,
    UnlockDaq,
    ExchangeId,
    UploadId,
    GetDaqSize,
    /// No frame. Packs the signals and publishes the table
    BuildDtos,
    SetDaqPtr,
    WriteDaq,
    CheckSessionStatus,
    SetSessionStatus,
    PrepareDaq,
    StartAll,
    /// No frame. Waits until every package was received once
    WaitFirstData,
    /// Source address for MOVE_MEMORY
    SetMtaRom,
    /// Destination address for MOVE_MEMORY
    SetMtaRam,
    MoveMemory,
    SetMtaCalPage,
    SelectCalPage,
    /// No frame. Builds the calibration list
    CalibrationReady,
    Disconnect,
    SetMtaParam,
    Download,
    UploadParam,
    AlivePing,
}

impl CcpStep {
    /// Continuation once the connection is established and the version is known
    fn after_version(s: &Session<Self>) -> Self {
        match s.sequence {
            CommandSequence::StartMeasurement | CommandSequence::StartCalibration if s.uses_seed_key() => {
                CcpStep::GetSeed
            }
            _ => CcpStep::ExchangeId,
        }
    }

    /// Continuation of CONNECT on an already connected target
    fn already_connected(s: &Session<Self>) -> Self {
        match s.sequence {
            CommandSequence::StartMeasurement if s.uses_seed_key() => CcpStep::GetSeed,
            CommandSequence::StartMeasurement => CcpStep::GetDaqSize,
            CommandSequence::StartCalibration if s.uses_seed_key() => CcpStep::GetSeed,
            CommandSequence::StartCalibration => Self::calibration_pages(s),
            _ => CcpStep::GetVersion,
        }
    }

    /// Continuation once the identification is known
    fn after_id(s: &Session<Self>) -> Self {
        match s.sequence {
            CommandSequence::StartCalibration => Self::calibration_pages(s),
            _ => CcpStep::GetDaqSize,
        }
    }

    fn calibration_pages(s: &Session<Self>) -> Self {
        if s.config.calibration.move_rom_to_ram {
            CcpStep::SetMtaRom
        } else if s.config.calibration.select_cal_page {
            CcpStep::SetMtaCalPage
        } else {
            CcpStep::CalibrationReady
        }
    }

    /// Continuation once the DAQ lists are stopped
    fn after_stop(s: &Session<Self>) -> Self {
        if s.config.quirks.contains(CcpQuirks::SESSION_STATUS) {
            CcpStep::GetSessionStatus
        } else {
            CcpStep::MeasurementStopped
        }
    }

    /// Privilege the seed of this step is requested for
    fn privilege(self, s: &Session<Self>) -> u8 {
        match (self, s.sequence) {
            (CcpStep::GetSeed | CcpStep::Unlock, CommandSequence::StartCalibration) => PL_CAL,
            _ => PL_DAQ,
        }
    }
}

fn frame(s: &Session<CcpStep>, cmd: CcpCommand) -> CommandFrame {
    s.frame(cmd.into()).with_u8(1, CTR)
}

/// Station address is sent LSB first from version 2.1 on
fn station_order(s: &Session<CcpStep>) -> ByteOrder {
    if s.target.version < 0x0201 {
        s.byte_order
    } else {
        ByteOrder::LsbFirst
    }
}

fn stop_all(s: &Session<CcpStep>) -> CommandFrame {
    if s.config.quirks.contains(CcpQuirks::SINGLE_LIST_STOP) || s.target.version < 0x0201 {
        frame(s, CcpCommand::StartStop).with_u8(2, 0).with_u8(3, 0)
    } else {
        frame(s, CcpCommand::StartStopAll).with_u8(2, 0)
    }
}

fn start_all(s: &Session<CcpStep>) -> CommandFrame {
    if s.target.version < 0x0201 {
        frame(s, CcpCommand::StartStop)
            .with_u8(2, 1)
            .with_u8(3, 0)
            .with_u8(4, s.dtos.package_count() as u8)
    } else {
        frame(s, CcpCommand::StartStopAll).with_u8(2, 1)
    }
}

fn unlock_frame(s: &Session<CcpStep>, privilege: u8) -> CommandFrame {
    let library = if privilege == PL_CAL {
        &s.config.seed_key_dll_cal
    } else {
        &s.config.seed_key_dll
    };
    let key = match s.compute_key(library, privilege, &s.scratch.seed) {
        Ok(key) => key,
        Err(e) => {
            log::error!("CCP {}: cannot compute key from seed: {e}", s.index);
            Vec::new()
        }
    };
    let n = key.len().min(CCP_MAX_KEY);
    frame(s, CcpCommand::Unlock).with_slice(2, &key[..n])
}

fn disconnect(s: &Session<CcpStep>) -> CommandFrame {
    frame(s, CcpCommand::Disconnect)
        .with_u8(2, 0x01)
        .with_u16_as(4, s.config.station_address, station_order(s))
}

/// Releases the DTO table once the DAQ lists are stopped. Returns true if a
/// calibration session keeps the connection
fn measurement_stopped(s: &mut Session<CcpStep>, ctx: &mut Ctx<'_>) -> bool {
    s.state.remove(ConnectionState::MEASUREMENT_RUNNING);
    s.dtos.release(ctx.store);
    s.push(ctx, TransportRequest::RemoveVariables);
    s.state.contains(ConnectionState::CALIBRATION_ACTIVE)
}

impl CommandTable for CcpStep {
    const PROTOCOL: Protocol = Protocol::Ccp;
    const MAILBOX: bool = false;

    type Scratch = CcpScratch;

    fn start_point(sequence: CommandSequence) -> Option<Self> {
        match sequence {
            CommandSequence::None | CommandSequence::ReadMemory => None,
            CommandSequence::Download | CommandSequence::Upload => Some(CcpStep::SetMtaParam),
            CommandSequence::AlivePing => Some(CcpStep::AlivePing),
            _ => Some(CcpStep::StartPoint),
        }
    }

    fn code(self) -> u32 {
        self as u32
    }

    fn issue(self, s: &mut Session<Self>, ctx: &mut Ctx<'_>) -> Issue<Self> {
        match self {
            CcpStep::StartPoint => {
                s.error = 0;
                match s.sequence {
                    CommandSequence::StartMeasurement => {
                        s.reload_config(ctx);
                        if s.state.contains(ConnectionState::MEASUREMENT_RUNNING) {
                            Issue::Goto(CcpStep::StopAll)
                        } else {
                            Issue::Goto(CcpStep::Connect)
                        }
                    }
                    CommandSequence::StopMeasurement => Issue::Goto(CcpStep::StopAll),
                    CommandSequence::StartCalibration => {
                        s.calibration.delete(ctx.store);
                        Issue::Goto(CcpStep::Connect)
                    }
                    CommandSequence::StopCalibration => {
                        s.state.remove(ConnectionState::CALIBRATION_ACTIVE);
                        s.calibration.delete(ctx.store);
                        if s.state.contains(ConnectionState::MEASUREMENT_RUNNING) {
                            Issue::Finish
                        } else {
                            Issue::Goto(CcpStep::Disconnect)
                        }
                    }
                    _ => Issue::Goto(CcpStep::Connect),
                }
            }
            CcpStep::StopAll => Issue::send(stop_all(s)),
            CcpStep::GetSessionStatus | CcpStep::CheckSessionStatus => {
                Issue::send(frame(s, CcpCommand::GetSStatus))
            }
            CcpStep::ClearSessionStatus => {
                s.scratch.session_status &= !SS_DAQ;
                Issue::send(frame(s, CcpCommand::SetSStatus).with_u8(2, s.scratch.session_status))
            }
            CcpStep::SetSessionStatus => {
                s.scratch.session_status |= SS_DAQ;
                Issue::send(frame(s, CcpCommand::SetSStatus).with_u8(2, s.scratch.session_status))
            }
            CcpStep::MeasurementStopped => {
                let keep = measurement_stopped(s, ctx);
                match s.sequence {
                    CommandSequence::StartMeasurement => {
                        s.push(ctx, TransportRequest::Deactivate);
                        s.push(ctx, TransportRequest::Activate);
                        Issue::Goto(CcpStep::Connect)
                    }
                    _ if keep => {
                        s.push(ctx, TransportRequest::Deactivate);
                        s.push(ctx, TransportRequest::Activate);
                        Issue::Finish
                    }
                    _ => Issue::Goto(CcpStep::Disconnect),
                }
            }
            CcpStep::Connect => {
                if s.sequence != CommandSequence::StartMeasurement {
                    s.reload_config(ctx);
                }
                s.push(ctx, TransportRequest::Activate);
                if s.state.contains(ConnectionState::CONNECTED) {
                    Issue::Goto(Self::already_connected(s))
                } else {
                    s.target.version = s.config.version;
                    Issue::send(
                        frame(s, CcpCommand::Connect).with_u16_as(2, s.config.station_address, station_order(s)),
                    )
                }
            }
            CcpStep::GetVersion => Issue::send(frame(s, CcpCommand::GetCcpVersion).with_u8(2, 2).with_u8(3, 1)),
            CcpStep::GetSeed | CcpStep::GetSeedDaq => {
                let privilege = self.privilege(s);
                Issue::send(frame(s, CcpCommand::GetSeed).with_u8(2, privilege))
            }
            CcpStep::Unlock | CcpStep::UnlockDaq => {
                let privilege = self.privilege(s);
                Issue::send(unlock_frame(s, privilege))
            }
            CcpStep::ExchangeId | CcpStep::AlivePing => {
                Issue::send(frame(s, CcpCommand::ExchangeId).with_u8(2, MASTER_ADDRESS))
            }
            CcpStep::UploadId => {
                let n = s.target.id_chunk(CHUNK);
                Issue::send(frame(s, CcpCommand::Upload).with_u8(2, n as u8))
            }
            CcpStep::GetDaqSize => {
                let dto_id = s.config.dto_id;
                Issue::send(frame(s, CcpCommand::GetDaqSize).with_u8(2, 0).with_u32(4, dto_id))
            }
            CcpStep::BuildDtos => {
                s.dtos.release(ctx.store);
                match dto::build(&s.labels, &s.config, s.target.daq_size as usize, ctx.store) {
                    Ok(table) => {
                        s.dtos = table;
                        ctx.requests.push(TransportRequest::PublishDtos {
                            connection: s.transport_connection(),
                            first_pid: s.target.daq_pid,
                            table: s.dtos.clone(),
                        });
                        s.scratch.odt = 0;
                        s.scratch.entry = 0;
                        Issue::Goto(CcpStep::SetDaqPtr)
                    }
                    Err(e) => {
                        log::error!("CCP {}: cannot build DTOs: {e}", s.index);
                        s.error = DTO_BUILD_ERROR;
                        Issue::Finish
                    }
                }
            }
            CcpStep::SetDaqPtr => Issue::send(
                frame(s, CcpCommand::SetDaqPtr)
                    .with_u8(2, 0)
                    .with_u8(3, s.scratch.odt as u8)
                    .with_u8(4, s.scratch.entry as u8),
            ),
            CcpStep::WriteDaq => match s.dtos.entry(s.scratch.odt, s.scratch.entry).copied() {
                Some(entry) => Issue::send(
                    frame(s, CcpCommand::WriteDaq)
                        .with_u8(2, entry.size)
                        .with_u8(3, 0)
                        .with_u32(4, entry.address),
                ),
                None => Issue::Goto(CcpStep::PrepareDaq),
            },
            CcpStep::PrepareDaq => {
                if s.target.version >= 0x0201 {
                    let last = s.dtos.package_count().saturating_sub(1) as u8;
                    Issue::send(
                        frame(s, CcpCommand::StartStop)
                            .with_u8(2, 2)
                            .with_u8(3, 0)
                            .with_u8(4, last)
                            .with_u8(5, s.config.event_channel as u8)
                            .with_u16(6, s.config.prescaler),
                    )
                } else {
                    Issue::Goto(CcpStep::StartAll)
                }
            }
            CcpStep::StartAll => Issue::send(start_all(s)),
            CcpStep::WaitFirstData => {
                if s.first_sample {
                    s.state.insert(ConnectionState::MEASUREMENT_RUNNING);
                    Issue::Finish
                } else {
                    Issue::Wait
                }
            }
            CcpStep::SetMtaRom => {
                let addr = s.config.calibration.rom_start;
                Issue::send(frame(s, CcpCommand::SetMta).with_u8(2, 0).with_u32(4, addr))
            }
            CcpStep::SetMtaRam => {
                let addr = s.config.calibration.ram_start;
                Issue::send(frame(s, CcpCommand::SetMta).with_u8(2, 1).with_u32(4, addr))
            }
            CcpStep::MoveMemory => {
                let size = s.config.calibration.size;
                Issue::send_with_timeout(frame(s, CcpCommand::MoveMemory).with_u32(2, size), BULK_COPY_TIMEOUT_MS)
            }
            CcpStep::SetMtaCalPage => {
                let addr = s.config.calibration.ram_start;
                Issue::send(frame(s, CcpCommand::SetMta).with_u8(2, 0).with_u32(4, addr))
            }
            CcpStep::SelectCalPage => Issue::send(frame(s, CcpCommand::SelectCalPage)),
            CcpStep::CalibrationReady => {
                match CalibrationList::build(&s.labels, &s.config, ctx.store) {
                    Ok(list) => s.calibration = list,
                    Err(e) => log::error!("CCP {}: cannot build calibration list: {e}", s.index),
                }
                s.upload_in_progress = true;
                s.state.insert(ConnectionState::CALIBRATION_ACTIVE);
                Issue::Finish
            }
            CcpStep::Disconnect => Issue::send(disconnect(s)),
            CcpStep::SetMtaParam => match &s.transfer {
                Some(t) => {
                    let addr = t.param.address;
                    Issue::send(frame(s, CcpCommand::SetMta).with_u8(2, 0).with_u32(4, addr))
                }
                None => Issue::Finish,
            },
            CcpStep::Download => match &s.transfer {
                Some(t) => {
                    let n = t.chunk(CHUNK);
                    let data = &t.param.bytes[t.pos..t.pos + n];
                    Issue::send(frame(s, CcpCommand::Dnload).with_u8(2, n as u8).with_slice(3, data))
                }
                None => Issue::Finish,
            },
            CcpStep::UploadParam => match &s.transfer {
                Some(t) => {
                    let n = t.chunk(CHUNK);
                    Issue::send(frame(s, CcpCommand::Upload).with_u8(2, n as u8))
                }
                None => Issue::Finish,
            },
        }
    }

    fn on_ack(self, data: &[u8; FRAME_SIZE], s: &mut Session<Self>, ctx: &mut Ctx<'_>) -> Outcome<Self> {
        match self {
            CcpStep::StopAll => {
                s.scratch.status_attempts = 0;
                Outcome::Next(Self::after_stop(s))
            }
            CcpStep::GetSessionStatus => {
                s.scratch.session_status = data[3];
                if data[3] & SS_DAQ == 0 {
                    Outcome::Next(CcpStep::MeasurementStopped)
                } else {
                    let attempts = s.scratch.status_attempts;
                    s.scratch.status_attempts += 1;
                    if attempts >= SS_ATTEMPTS {
                        Outcome::Next(CcpStep::ClearSessionStatus)
                    } else {
                        Outcome::Next(CcpStep::GetSessionStatus)
                    }
                }
            }
            CcpStep::ClearSessionStatus => Outcome::Next(CcpStep::MeasurementStopped),
            CcpStep::Connect => {
                s.state.insert(ConnectionState::CONNECTED);
                Outcome::Next(CcpStep::GetVersion)
            }
            CcpStep::GetVersion => {
                s.target.version = u16::from_be_bytes([data[3], data[4]]);
                Outcome::Next(Self::after_version(s))
            }
            CcpStep::GetSeed | CcpStep::GetSeedDaq => {
                s.scratch.seed.copy_from_slice(&data[4..8]);
                let unlock = if self == CcpStep::GetSeed {
                    CcpStep::Unlock
                } else {
                    CcpStep::UnlockDaq
                };
                if data[3] != 0 {
                    Outcome::Next(unlock)
                } else {
                    Outcome::Next(self.after_unlock(s))
                }
            }
            CcpStep::Unlock | CcpStep::UnlockDaq => Outcome::Next(self.after_unlock(s)),
            CcpStep::ExchangeId => {
                s.target.id.clear();
                s.target.id_len = (data[3] as usize).min(MAX_ID_LEN);
                s.target.availability = data[5];
                s.target.protection = data[6];
                if s.target.id_len == 0 {
                    Outcome::Next(Self::after_id(s))
                } else {
                    Outcome::Next(CcpStep::UploadId)
                }
            }
            CcpStep::UploadId => {
                if s.target.push_id(&data[3..3 + CHUNK]) {
                    log::info!("CCP {}: target \"{}\"", s.index, s.target.id_string());
                    Outcome::Next(Self::after_id(s))
                } else {
                    Outcome::Next(CcpStep::UploadId)
                }
            }
            CcpStep::GetDaqSize => {
                s.target.daq_size = data[3];
                s.target.daq_pid = data[4];
                match s.sequence {
                    CommandSequence::StartMeasurement => Outcome::Next(CcpStep::BuildDtos),
                    _ => Outcome::Finish,
                }
            }
            CcpStep::SetDaqPtr => Outcome::Next(CcpStep::WriteDaq),
            CcpStep::WriteDaq => {
                s.scratch.entry += 1;
                let in_package = s
                    .dtos
                    .packages
                    .get(s.scratch.odt)
                    .map(|p| p.entries.len())
                    .unwrap_or(0);
                if s.scratch.entry < in_package {
                    return Outcome::Next(CcpStep::SetDaqPtr);
                }
                s.scratch.entry = 0;
                s.scratch.odt += 1;
                if s.scratch.odt < s.dtos.package_count() {
                    Outcome::Next(CcpStep::SetDaqPtr)
                } else if s.config.quirks.contains(CcpQuirks::SESSION_STATUS) {
                    Outcome::Next(CcpStep::CheckSessionStatus)
                } else {
                    Outcome::Next(CcpStep::PrepareDaq)
                }
            }
            CcpStep::CheckSessionStatus => {
                s.scratch.session_status = data[3];
                if data[3] & SS_DAQ != 0 {
                    Outcome::Next(CcpStep::PrepareDaq)
                } else {
                    Outcome::Next(CcpStep::SetSessionStatus)
                }
            }
            CcpStep::SetSessionStatus | CcpStep::PrepareDaq => Outcome::Next(CcpStep::StartAll),
            CcpStep::StartAll => {
                s.first_sample = false;
                ctx.requests.push(TransportRequest::ArmDtoTimeout {
                    connection: s.transport_connection(),
                    timeout_ms: s.config.timeout_ms,
                });
                Outcome::Next(CcpStep::WaitFirstData)
            }
            CcpStep::SetMtaRom => Outcome::Next(CcpStep::SetMtaRam),
            CcpStep::SetMtaRam => Outcome::Next(CcpStep::MoveMemory),
            CcpStep::MoveMemory => Outcome::Next(CcpStep::SetMtaCalPage),
            CcpStep::SetMtaCalPage => Outcome::Next(CcpStep::SelectCalPage),
            CcpStep::SelectCalPage => Outcome::Next(CcpStep::CalibrationReady),
            CcpStep::Disconnect => {
                s.state = ConnectionState::empty();
                s.push(ctx, TransportRequest::Deactivate);
                Outcome::Finish
            }
            CcpStep::SetMtaParam => match (s.sequence, &mut s.transfer) {
                (CommandSequence::Download, Some(t)) => {
                    t.pos = 0;
                    Outcome::Next(CcpStep::Download)
                }
                (_, Some(t)) => {
                    t.pos = 0;
                    t.buffer.clear();
                    Outcome::Next(CcpStep::UploadParam)
                }
                (_, None) => Outcome::Finish,
            },
            CcpStep::Download => {
                let Some(t) = s.transfer.as_mut() else {
                    return Outcome::Finish;
                };
                t.pos += t.chunk(CHUNK);
                if !t.is_complete() {
                    return Outcome::Next(CcpStep::Download);
                }
                let readback = s.calibration.readback(t.param.index);
                match readback.filter(|_| s.config.read_parameter_after_calib) {
                    Some(param) => {
                        s.transfer = Some(Transfer::new(param));
                        s.sequence = CommandSequence::Upload;
                        Outcome::Next(CcpStep::SetMtaParam)
                    }
                    None => {
                        s.transfer = None;
                        Outcome::Finish
                    }
                }
            }
            CcpStep::UploadParam => {
                let Some(t) = s.transfer.as_mut() else {
                    return Outcome::Finish;
                };
                let n = t.chunk(CHUNK);
                t.buffer.extend_from_slice(&data[3..3 + n]);
                t.pos += n;
                if !t.is_complete() {
                    return Outcome::Next(CcpStep::UploadParam);
                }
                if let Some(t) = s.transfer.take() {
                    s.calibration
                        .apply_upload(t.param.index, &t.buffer, s.byte_order, ctx.store);
                }
                Outcome::Finish
            }
            CcpStep::AlivePing => Outcome::Finish,
            CcpStep::StartPoint
            | CcpStep::MeasurementStopped
            | CcpStep::BuildDtos
            | CcpStep::WaitFirstData
            | CcpStep::CalibrationReady => Outcome::Next(self),
        }
    }

    fn on_nack(self, code: u8, s: &mut Session<Self>, ctx: &mut Ctx<'_>) -> Outcome<Self> {
        if self == CcpStep::GetVersion {
            log::warn!("CCP {}: GET_CCP_VERSION not supported, assuming 2.0", s.index);
            let mut ack = [0u8; FRAME_SIZE];
            ack[3] = 2;
            return self.on_ack(&ack, s, ctx);
        }
        Outcome::Abort(code as i32)
    }

    fn classify(data: &[u8; FRAME_SIZE], s: &Session<Self>) -> Option<Response> {
        match data[0] {
            0xFF if data[2] != CTR => {
                log::error!("CCP {}: Bad ctr received.({data:02X?})", s.index);
                None
            }
            0xFF if data[1] != 0 => Some(Response::Nack(data[1])),
            0xFF => Some(Response::Ack(*data)),
            0xFE => {
                log::error!("CCP {}: received an event (ignoring) ({data:02X?})", s.index);
                None
            }
            _ => None,
        }
    }

    fn error_text(code: i32) -> String {
        match code {
            TIMEOUT_ERROR => "Timeout".to_string(),
            DTO_BUILD_ERROR => "Cannot build DTOs".to_string(),
            c => CcpError::from(c as u8).desc(),
        }
    }
}

impl CcpStep {
    /// Continuation after the seed of this step was answered
    fn after_unlock(self, s: &Session<Self>) -> Self {
        match (self, s.sequence) {
            (CcpStep::GetSeed | CcpStep::Unlock, CommandSequence::StartCalibration) => CcpStep::GetSeedDaq,
            _ => CcpStep::ExchangeId,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session<CcpStep> {
        let mut s = Session::new(0);
        s.target.version = 0x0201;
        s.byte_order = ByteOrder::MsbFirst;
        s
    }

    #[test]
    fn acks_are_classified_by_counter_and_code() {
        let s = session();
        assert_eq!(
            CcpStep::classify(&[0xFF, 0, CTR, 1, 2, 3, 4, 5], &s),
            Some(Response::Ack([0xFF, 0, CTR, 1, 2, 3, 4, 5]))
        );
        assert_eq!(
            CcpStep::classify(&[0xFF, 0x33, CTR, 0, 0, 0, 0, 0], &s),
            Some(Response::Nack(0x33))
        );
        assert_eq!(CcpStep::classify(&[0xFF, 0, 0x12, 0, 0, 0, 0, 0], &s), None);
        assert_eq!(CcpStep::classify(&[0xFE, 0, CTR, 0, 0, 0, 0, 0], &s), None);
    }

    #[test]
    fn station_address_is_intel_from_2_1() {
        let mut s = session();
        s.config.station_address = 0x1234;
        assert_eq!(disconnect(&s).into_bytes(), [0x07, CTR, 0x01, 0, 0x34, 0x12, 0, 0]);
        s.target.version = 0x0200;
        assert_eq!(disconnect(&s).into_bytes(), [0x07, CTR, 0x01, 0, 0x12, 0x34, 0, 0]);
    }

    #[test]
    fn version_2_0_emulates_start_stop_all() {
        let mut s = session();
        assert_eq!(start_all(&s).into_bytes()[..3], [0x08, CTR, 1]);
        assert_eq!(stop_all(&s).into_bytes()[..3], [0x08, CTR, 0]);
        s.target.version = 0x0200;
        assert_eq!(start_all(&s).into_bytes()[..4], [0x06, CTR, 1, 0]);
        assert_eq!(stop_all(&s).into_bytes()[..4], [0x06, CTR, 0, 0]);
        s.target.version = 0x0201;
        s.config.quirks = CcpQuirks::SINGLE_LIST_STOP;
        assert_eq!(stop_all(&s).into_bytes()[..4], [0x06, CTR, 0, 0]);
    }

    #[test]
    fn calibration_seeds_for_cal_then_daq() {
        let mut s = session();
        s.sequence = CommandSequence::StartCalibration;
        assert_eq!(CcpStep::GetSeed.privilege(&s), PL_CAL);
        assert_eq!(CcpStep::GetSeedDaq.privilege(&s), PL_DAQ);
        assert_eq!(CcpStep::Unlock.after_unlock(&s), CcpStep::GetSeedDaq);
        assert_eq!(CcpStep::UnlockDaq.after_unlock(&s), CcpStep::ExchangeId);
        s.sequence = CommandSequence::StartMeasurement;
        assert_eq!(CcpStep::GetSeed.privilege(&s), PL_DAQ);
        assert_eq!(CcpStep::Unlock.after_unlock(&s), CcpStep::ExchangeId);
    }

    #[test]
    fn calibration_pages_follow_config() {
        let mut s = session();
        s.sequence = CommandSequence::StartCalibration;
        s.config.calibration.move_rom_to_ram = true;
        assert_eq!(CcpStep::after_id(&s), CcpStep::SetMtaRom);
        s.config.calibration.move_rom_to_ram = false;
        s.config.calibration.select_cal_page = true;
        assert_eq!(CcpStep::after_id(&s), CcpStep::SetMtaCalPage);
        s.config.calibration.select_cal_page = false;
        assert_eq!(CcpStep::after_id(&s), CcpStep::CalibrationReady);
    }
}
