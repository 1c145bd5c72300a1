//! Module for XCP on CAN (Universal Measurement and Calibration Protocol)
//!
//! Command packets carry the command code in byte 0. Every response starts with the
//! packet identifier, 0xFF for a positive response and 0xFE for an error packet with the
//! error code in byte 1. Multi byte fields use the byte order the slave reports in its
//! CONNECT response.
//!
//! Only a single dynamic DAQ list (list 0) is used. Each DTO package becomes one ODT.

use crate::{
    ProtocolError, DTO_BUILD_ERROR, TIMEOUT_ERROR,
    calibration::CalibrationList,
    channel::TransportRequest,
    codec::{ByteOrder, CommandFrame, FRAME_SIZE, read_u32},
    config::Protocol,
    dto,
    seed_key::XCP_MAX_KEY,
    session::{
        BULK_COPY_TIMEOUT_MS, CommandSequence, CommandTable, ConnectionState, Ctx, Issue, Outcome, Response,
        Session, Transfer,
    },
};

mod error;
pub use error::*;

/// XCP command codes
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum XcpCommand {
    /// Open a session
    Connect = 0xFF,
    /// Close the session
    Disconnect = 0xFE,
    /// Read the session and protection status
    GetStatus = 0xFD,
    /// Read the slave identification
    GetId = 0xFA,
    /// Request a seed
    GetSeed = 0xF8,
    /// Send the key
    Unlock = 0xF7,
    /// Set the memory transfer address
    SetMta = 0xF6,
    /// Upload from the MTA
    Upload = 0xF5,
    /// Download to the MTA
    Download = 0xF0,
    /// Activate a calibration page
    SetCalPage = 0xEB,
    /// Copy a calibration page
    CopyCalPage = 0xE4,
    /// Set the DAQ list pointer
    SetDaqPtr = 0xE2,
    /// Write an ODT entry
    WriteDaq = 0xE1,
    /// Set the mode of a DAQ list
    SetDaqListMode = 0xE0,
    /// Start, stop or select a DAQ list
    StartStopDaqList = 0xDE,
    /// Start or stop all selected DAQ lists
    StartStopSynch = 0xDD,
    /// Read the DAQ processor capabilities
    GetDaqProcessorInfo = 0xDA,
    /// Clear the dynamic DAQ configuration
    FreeDaq = 0xD6,
    /// Allocate DAQ lists
    AllocDaq = 0xD5,
    /// Allocate ODTs of a DAQ list
    AllocOdt = 0xD4,
    /// Allocate entries of an ODT
    AllocOdtEntry = 0xD3,
}

impl From<XcpCommand> for u8 {
    fn from(cmd: XcpCommand) -> Self {
        cmd as u8
    }
}

/// Calibration and paging privilege
pub const PL_CAL: u8 = 0x01;
/// DAQ privilege
pub const PL_DAQ: u8 = 0x04;

const PID_RES: u8 = 0xFF;
const PID_ERR: u8 = 0xFE;

/// Payload bytes of one DOWNLOAD
const DOWNLOAD_CHUNK: usize = 6;
/// Payload bytes of one UPLOAD response
const UPLOAD_CHUNK: usize = 7;
/// Seed or key bytes per GET_SEED response / UNLOCK command
const SEED_CHUNK: usize = 6;
/// Longest identification kept
const MAX_ID_LEN: usize = 254;
/// Package budget of the single dynamic DAQ list
const MAX_ODTS: usize = 255;

/// Scratch data of an XCP session
#[derive(Debug, Default)]
pub(crate) struct XcpScratch {
    seed: Vec<u8>,
    seed_len: usize,
    key: Vec<u8>,
    key_pos: usize,
    odt: usize,
    entry: usize,
}

/// XCP command steps
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum XcpStep {
    /// No frame. Resets the error and picks the first real step
    StartPoint = 1,
    StopDaqList,
    StopSynch,
    Connect,
    /// No frame. Continuation of a calibration session on a connected slave
    Connected,
    GetStatus,
    GetSeed,
    Unlock,
    GetId,
    UploadId,
    GetDaqProcessorInfo,
    /// No frame. Packs the signals and publishes the table
    BuildDtos,
    FreeDaq,
    AllocDaq,
    AllocOdt,
    AllocOdtEntry,
    SetDaqPtr,
    WriteDaq,
    SetDaqListMode,
    SelectDaqList,
    StartSynch,
    /// No frame. Waits until every ODT was received once
    WaitFirstData,
    CopyCalPage,
    SetCalPage,
    /// No frame. Builds the calibration list
    CalibrationReady,
    Disconnect,
    SetMta,
    Download,
    UploadParam,
    AlivePing,
}

impl XcpStep {
    /// Privilege the running sequence has to unlock
    fn privilege(s: &Session<Self>) -> u8 {
        match s.sequence {
            CommandSequence::StartCalibration => PL_CAL,
            _ => PL_DAQ,
        }
    }

    /// Continuation once the identification is known
    fn after_id(s: &Session<Self>) -> Outcome<Self> {
        match s.sequence {
            CommandSequence::StartMeasurement => Outcome::Next(XcpStep::GetDaqProcessorInfo),
            CommandSequence::StartCalibration => Outcome::Next(Self::calibration_pages(s)),
            _ => Outcome::Finish,
        }
    }

    fn calibration_pages(s: &Session<Self>) -> Self {
        if s.config.calibration.move_rom_to_ram {
            XcpStep::CopyCalPage
        } else if s.config.calibration.select_cal_page {
            XcpStep::SetCalPage
        } else {
            XcpStep::CalibrationReady
        }
    }

    fn after_connect(s: &Session<Self>) -> Self {
        if s.uses_seed_key() {
            XcpStep::GetStatus
        } else {
            XcpStep::GetId
        }
    }

    /// Moves on to the next ODT once all entries of the current one are handled
    fn next_odt(s: &mut Session<Self>, within: Self, done: Self) -> Self {
        s.scratch.odt += 1;
        s.scratch.entry = 0;
        if s.scratch.odt < s.dtos.package_count() {
            within
        } else {
            s.scratch.odt = 0;
            done
        }
    }

    /// Nacks that leave the sequence running
    fn tolerates_nack(self) -> bool {
        matches!(
            self,
            XcpStep::UploadId
                | XcpStep::GetDaqProcessorInfo
                | XcpStep::FreeDaq
                | XcpStep::AllocDaq
                | XcpStep::AllocOdt
                | XcpStep::AllocOdtEntry
        )
    }
}

fn frame(s: &Session<XcpStep>, cmd: XcpCommand) -> CommandFrame {
    s.frame(cmd.into())
}

fn get_seed(s: &Session<XcpStep>) -> CommandFrame {
    let mode = u8::from(!s.scratch.seed.is_empty());
    frame(s, XcpCommand::GetSeed)
        .with_u8(1, mode)
        .with_u8(2, XcpStep::privilege(s))
}

fn unlock(s: &Session<XcpStep>) -> CommandFrame {
    let key = &s.scratch.key[s.scratch.key_pos..];
    let n = key.len().min(SEED_CHUNK);
    frame(s, XcpCommand::Unlock)
        .with_u8(1, key.len() as u8)
        .with_slice(2, &key[..n])
}

fn start_stop_daq_list(s: &Session<XcpStep>) -> CommandFrame {
    frame(s, XcpCommand::StartStopDaqList).with_u8(1, 2).with_u16(2, 0)
}

fn start_stop_synch(s: &Session<XcpStep>, start: bool) -> CommandFrame {
    frame(s, XcpCommand::StartStopSynch).with_u8(1, u8::from(start))
}

/// Collects seed bytes of a GET_SEED response. Returns true once the seed is complete
fn collect_seed(scratch: &mut XcpScratch, data: &[u8; FRAME_SIZE]) -> bool {
    if scratch.seed.is_empty() {
        scratch.seed_len = data[1] as usize;
    }
    let missing = scratch.seed_len.saturating_sub(scratch.seed.len());
    let n = missing.min(SEED_CHUNK);
    scratch.seed.extend_from_slice(&data[2..2 + n]);
    scratch.seed.len() >= scratch.seed_len
}

/// Releases the DTO table once the DAQ list is stopped. Returns true if a
/// calibration session keeps the connection
fn measurement_stopped(s: &mut Session<XcpStep>, ctx: &mut Ctx<'_>) -> bool {
    s.state.remove(ConnectionState::MEASUREMENT_RUNNING);
    s.dtos.release(ctx.store);
    s.push(ctx, TransportRequest::RemoveVariables);
    s.state.contains(ConnectionState::CALIBRATION_ACTIVE)
}

impl CommandTable for XcpStep {
    const PROTOCOL: Protocol = Protocol::Xcp;
    const MAILBOX: bool = true;

    type Scratch = XcpScratch;

    fn start_point(sequence: CommandSequence) -> Option<Self> {
        match sequence {
            CommandSequence::None | CommandSequence::ReadMemory => None,
            CommandSequence::Download | CommandSequence::Upload => Some(XcpStep::SetMta),
            CommandSequence::AlivePing => Some(XcpStep::AlivePing),
            _ => Some(XcpStep::StartPoint),
        }
    }

    fn code(self) -> u32 {
        self as u32
    }

    fn issue(self, s: &mut Session<Self>, ctx: &mut Ctx<'_>) -> Issue<Self> {
        match self {
            XcpStep::StartPoint => {
                s.error = 0;
                match s.sequence {
                    CommandSequence::StartMeasurement
                        if s.state.contains(ConnectionState::MEASUREMENT_RUNNING) =>
                    {
                        Issue::Goto(XcpStep::StopDaqList)
                    }
                    CommandSequence::StopMeasurement => Issue::Goto(XcpStep::StopDaqList),
                    CommandSequence::StartCalibration => {
                        s.calibration.delete(ctx.store);
                        Issue::Goto(XcpStep::Connect)
                    }
                    CommandSequence::StopCalibration => {
                        s.state.remove(ConnectionState::CALIBRATION_ACTIVE);
                        s.calibration.delete(ctx.store);
                        if s.state.contains(ConnectionState::MEASUREMENT_RUNNING) {
                            Issue::Finish
                        } else {
                            Issue::Goto(XcpStep::Disconnect)
                        }
                    }
                    _ => Issue::Goto(XcpStep::Connect),
                }
            }
            XcpStep::StopDaqList | XcpStep::SelectDaqList => Issue::send(start_stop_daq_list(s)),
            XcpStep::StopSynch => Issue::send(start_stop_synch(s, false)),
            XcpStep::Connect => {
                s.push(ctx, TransportRequest::Activate);
                s.reload_config(ctx);
                let connected = s.state.contains(ConnectionState::CONNECTED);
                match s.sequence {
                    CommandSequence::ReadEcuInfo if connected => Issue::Goto(XcpStep::GetId),
                    CommandSequence::StartCalibration if connected => Issue::Goto(XcpStep::Connected),
                    _ => Issue::send(frame(s, XcpCommand::Connect).with_u8(1, 0)),
                }
            }
            XcpStep::Connected => Issue::Goto(Self::after_connect(s)),
            XcpStep::GetStatus | XcpStep::AlivePing => Issue::send(frame(s, XcpCommand::GetStatus)),
            XcpStep::GetSeed => Issue::send(get_seed(s)),
            XcpStep::Unlock => Issue::send(unlock(s)),
            XcpStep::GetId => Issue::send(frame(s, XcpCommand::GetId).with_u8(1, 1)),
            XcpStep::UploadId => {
                let n = s.target.id_chunk(UPLOAD_CHUNK);
                Issue::send(frame(s, XcpCommand::Upload).with_u8(1, n as u8))
            }
            XcpStep::GetDaqProcessorInfo => Issue::send(frame(s, XcpCommand::GetDaqProcessorInfo)),
            XcpStep::BuildDtos => {
                s.dtos.release(ctx.store);
                match dto::build(&s.labels, &s.config, MAX_ODTS, ctx.store) {
                    Ok(table) => {
                        s.dtos = table;
                        ctx.requests.push(TransportRequest::PublishDtos {
                            connection: s.transport_connection(),
                            first_pid: 0,
                            table: s.dtos.clone(),
                        });
                        s.scratch.odt = 0;
                        s.scratch.entry = 0;
                        Issue::Goto(XcpStep::FreeDaq)
                    }
                    Err(e) => {
                        log::error!("XCP {}: cannot build DTOs: {e}", s.index);
                        s.error = DTO_BUILD_ERROR;
                        Issue::Finish
                    }
                }
            }
            XcpStep::FreeDaq => Issue::send(frame(s, XcpCommand::FreeDaq)),
            XcpStep::AllocDaq => Issue::send(frame(s, XcpCommand::AllocDaq).with_u16(2, 1)),
            XcpStep::AllocOdt => {
                let odts = s.dtos.package_count() as u8;
                Issue::send(frame(s, XcpCommand::AllocOdt).with_u16(2, 0).with_u8(4, odts))
            }
            XcpStep::AllocOdtEntry => {
                let entries = s
                    .dtos
                    .packages
                    .get(s.scratch.odt)
                    .map(|p| p.entries.len())
                    .unwrap_or(0);
                Issue::send(
                    frame(s, XcpCommand::AllocOdtEntry)
                        .with_u16(2, 0)
                        .with_u8(4, s.scratch.odt as u8)
                        .with_u8(5, entries as u8),
                )
            }
            XcpStep::SetDaqPtr => Issue::send(
                frame(s, XcpCommand::SetDaqPtr)
                    .with_u16(2, 0)
                    .with_u8(4, s.scratch.odt as u8)
                    .with_u8(5, 0),
            ),
            XcpStep::WriteDaq => match s.dtos.entry(s.scratch.odt, s.scratch.entry).copied() {
                Some(entry) => Issue::send(
                    frame(s, XcpCommand::WriteDaq)
                        .with_u8(1, 0xFF)
                        .with_u8(2, entry.size)
                        .with_u8(3, 0)
                        .with_u32(4, entry.address),
                ),
                None => Issue::Goto(XcpStep::SetDaqListMode),
            },
            XcpStep::SetDaqListMode => Issue::send(
                frame(s, XcpCommand::SetDaqListMode)
                    .with_u8(1, 0)
                    .with_u16(2, 0)
                    .with_u16(4, s.config.event_channel)
                    .with_u8(6, s.config.prescaler as u8)
                    .with_u8(7, 0),
            ),
            XcpStep::StartSynch => Issue::send(start_stop_synch(s, true)),
            XcpStep::WaitFirstData => {
                if s.first_sample {
                    s.state.insert(ConnectionState::MEASUREMENT_RUNNING);
                    Issue::Finish
                } else {
                    Issue::Wait
                }
            }
            XcpStep::CopyCalPage => {
                let pages = &s.config.calibration;
                Issue::send_with_timeout(
                    frame(s, XcpCommand::CopyCalPage)
                        .with_u8(1, pages.rom_segment)
                        .with_u8(2, pages.rom_page)
                        .with_u8(3, pages.ram_segment)
                        .with_u8(4, pages.ram_page),
                    BULK_COPY_TIMEOUT_MS,
                )
            }
            XcpStep::SetCalPage => {
                let pages = &s.config.calibration;
                Issue::send(
                    frame(s, XcpCommand::SetCalPage)
                        .with_u8(1, 3)
                        .with_u8(2, pages.ram_segment)
                        .with_u8(3, pages.ram_page),
                )
            }
            XcpStep::CalibrationReady => {
                match CalibrationList::build(&s.labels, &s.config, ctx.store) {
                    Ok(list) => s.calibration = list,
                    Err(e) => log::error!("XCP {}: cannot build calibration list: {e}", s.index),
                }
                s.upload_in_progress = true;
                s.state.insert(ConnectionState::CALIBRATION_ACTIVE);
                Issue::Finish
            }
            XcpStep::Disconnect => Issue::send(frame(s, XcpCommand::Disconnect)),
            XcpStep::SetMta => match &s.transfer {
                Some(t) => {
                    let addr = t.param.address;
                    Issue::send(frame(s, XcpCommand::SetMta).with_u32(4, addr))
                }
                None => Issue::Finish,
            },
            XcpStep::Download => match &s.transfer {
                Some(t) => {
                    let n = t.chunk(DOWNLOAD_CHUNK);
                    let data = &t.param.bytes[t.pos..t.pos + n];
                    Issue::send(frame(s, XcpCommand::Download).with_u8(1, n as u8).with_slice(2, data))
                }
                None => Issue::Finish,
            },
            XcpStep::UploadParam => match &s.transfer {
                Some(t) => {
                    let n = t.chunk(UPLOAD_CHUNK);
                    Issue::send(frame(s, XcpCommand::Upload).with_u8(1, n as u8))
                }
                None => Issue::Finish,
            },
        }
    }

    fn on_ack(self, data: &[u8; FRAME_SIZE], s: &mut Session<Self>, ctx: &mut Ctx<'_>) -> Outcome<Self> {
        match self {
            XcpStep::StopDaqList => Outcome::Next(XcpStep::StopSynch),
            XcpStep::StopSynch => {
                let keep = measurement_stopped(s, ctx);
                match s.sequence {
                    CommandSequence::StartMeasurement => {
                        s.push(ctx, TransportRequest::Deactivate);
                        s.push(ctx, TransportRequest::Activate);
                        Outcome::Next(XcpStep::GetId)
                    }
                    _ if keep => {
                        s.push(ctx, TransportRequest::Deactivate);
                        s.push(ctx, TransportRequest::Activate);
                        Outcome::Finish
                    }
                    _ => Outcome::Next(XcpStep::Disconnect),
                }
            }
            XcpStep::Connect => {
                s.target.availability = data[1];
                s.byte_order = if data[2] & 0x01 != 0 {
                    ByteOrder::MsbFirst
                } else {
                    ByteOrder::LsbFirst
                };
                if s.config.debug {
                    log::debug!("XCP {}: byte order {}", s.index, s.byte_order);
                }
                s.target.max_cto = data[3];
                s.target.max_dto = u16::from_be_bytes([data[4], data[5]]);
                s.state.insert(ConnectionState::CONNECTED);
                match s.sequence {
                    CommandSequence::ReadEcuInfo => Outcome::Next(XcpStep::GetId),
                    _ => Outcome::Next(Self::after_connect(s)),
                }
            }
            XcpStep::GetStatus => {
                s.target.protection = data[2];
                if data[2] & Self::privilege(s) != 0 {
                    s.scratch.seed.clear();
                    Outcome::Next(XcpStep::GetSeed)
                } else {
                    Outcome::Next(XcpStep::GetId)
                }
            }
            XcpStep::GetSeed => {
                if !collect_seed(&mut s.scratch, data) {
                    return Outcome::Next(XcpStep::GetSeed);
                }
                match s.compute_key(&s.config.seed_key_dll, Self::privilege(s), &s.scratch.seed) {
                    Ok(key) if key.len() <= XCP_MAX_KEY => {
                        s.scratch.key = key;
                        s.scratch.key_pos = 0;
                        Outcome::Next(XcpStep::Unlock)
                    }
                    Ok(key) => {
                        log::error!(
                            "XCP {}: only keys of up to {XCP_MAX_KEY} bytes are supported, got {}",
                            s.index,
                            key.len()
                        );
                        Outcome::Teardown(TIMEOUT_ERROR)
                    }
                    Err(e) => {
                        log::error!("XCP {}: cannot compute key from seed: {e}", s.index);
                        Outcome::Teardown(TIMEOUT_ERROR)
                    }
                }
            }
            XcpStep::Unlock => {
                let remaining = s.scratch.key.len() - s.scratch.key_pos;
                s.scratch.key_pos += remaining.min(SEED_CHUNK);
                if s.scratch.key_pos >= s.scratch.key.len() {
                    Outcome::Next(XcpStep::GetId)
                } else {
                    Outcome::Next(XcpStep::Unlock)
                }
            }
            XcpStep::GetId => {
                s.target.id.clear();
                let len = read_u32(data, 4, s.byte_order) as usize;
                if len > MAX_ID_LEN {
                    log::info!("XCP {}: length of TCU string ({len}) is larger than {MAX_ID_LEN}", s.index);
                }
                s.target.id_len = len.min(MAX_ID_LEN);
                if s.target.id_len == 0 {
                    Self::after_id(s)
                } else {
                    Outcome::Next(XcpStep::UploadId)
                }
            }
            XcpStep::UploadId => {
                if s.target.push_id(&data[1..1 + UPLOAD_CHUNK]) {
                    log::info!("XCP {}: target \"{}\"", s.index, s.target.id_string());
                    Self::after_id(s)
                } else {
                    Outcome::Next(XcpStep::UploadId)
                }
            }
            XcpStep::GetDaqProcessorInfo => Outcome::Next(XcpStep::BuildDtos),
            XcpStep::FreeDaq => Outcome::Next(XcpStep::AllocDaq),
            XcpStep::AllocDaq => Outcome::Next(XcpStep::AllocOdt),
            XcpStep::AllocOdt => Outcome::Next(XcpStep::AllocOdtEntry),
            XcpStep::AllocOdtEntry => Outcome::Next(Self::next_odt(s, XcpStep::AllocOdtEntry, XcpStep::SetDaqPtr)),
            XcpStep::SetDaqPtr => Outcome::Next(XcpStep::WriteDaq),
            XcpStep::WriteDaq => {
                s.scratch.entry += 1;
                if s.dtos.entry(s.scratch.odt, s.scratch.entry).is_some() {
                    Outcome::Next(XcpStep::WriteDaq)
                } else {
                    Outcome::Next(Self::next_odt(s, XcpStep::SetDaqPtr, XcpStep::SetDaqListMode))
                }
            }
            XcpStep::SetDaqListMode => Outcome::Next(XcpStep::SelectDaqList),
            XcpStep::SelectDaqList => Outcome::Next(XcpStep::StartSynch),
            XcpStep::StartSynch => {
                s.first_sample = false;
                ctx.requests.push(TransportRequest::ArmDtoTimeout {
                    connection: s.transport_connection(),
                    timeout_ms: s.config.timeout_ms,
                });
                Outcome::Next(XcpStep::WaitFirstData)
            }
            XcpStep::CopyCalPage => {
                if s.config.calibration.select_cal_page {
                    Outcome::Next(XcpStep::SetCalPage)
                } else {
                    Outcome::Next(XcpStep::CalibrationReady)
                }
            }
            XcpStep::SetCalPage => Outcome::Next(XcpStep::CalibrationReady),
            XcpStep::Disconnect => {
                s.state = ConnectionState::empty();
                s.push(ctx, TransportRequest::Deactivate);
                Outcome::Finish
            }
            XcpStep::SetMta => match (s.sequence, &mut s.transfer) {
                (CommandSequence::Download, Some(t)) => {
                    t.pos = 0;
                    Outcome::Next(XcpStep::Download)
                }
                (_, Some(t)) => {
                    t.pos = 0;
                    t.buffer.clear();
                    Outcome::Next(XcpStep::UploadParam)
                }
                (_, None) => Outcome::Finish,
            },
            XcpStep::Download => {
                let Some(t) = s.transfer.as_mut() else {
                    return Outcome::Finish;
                };
                t.pos += t.chunk(DOWNLOAD_CHUNK);
                if !t.is_complete() {
                    return Outcome::Next(XcpStep::Download);
                }
                let readback = s.calibration.readback(t.param.index);
                match readback.filter(|_| s.config.read_parameter_after_calib) {
                    Some(param) => {
                        s.transfer = Some(Transfer::new(param));
                        s.sequence = CommandSequence::Upload;
                        Outcome::Next(XcpStep::SetMta)
                    }
                    None => {
                        s.transfer = None;
                        Outcome::Finish
                    }
                }
            }
            XcpStep::UploadParam => {
                let Some(t) = s.transfer.as_mut() else {
                    return Outcome::Finish;
                };
                let n = t.chunk(UPLOAD_CHUNK);
                t.buffer.extend_from_slice(&data[1..1 + n]);
                t.pos += n;
                if !t.is_complete() {
                    return Outcome::Next(XcpStep::UploadParam);
                }
                if let Some(t) = s.transfer.take() {
                    s.calibration
                        .apply_upload(t.param.index, &t.buffer, s.byte_order, ctx.store);
                }
                Outcome::Finish
            }
            XcpStep::AlivePing => Outcome::Finish,
            XcpStep::StartPoint
            | XcpStep::Connected
            | XcpStep::BuildDtos
            | XcpStep::WaitFirstData
            | XcpStep::CalibrationReady => Outcome::Next(self),
        }
    }

    fn on_nack(self, code: u8, s: &mut Session<Self>, ctx: &mut Ctx<'_>) -> Outcome<Self> {
        if !self.tolerates_nack() {
            return Outcome::Abort(code as i32);
        }
        if s.config.debug {
            log::debug!(
                "XCP {}: {self:?} got a negative response error code (0x{code:02X}) \"{}\" (ignoring)",
                s.index,
                XcpError::from(code).desc()
            );
        }
        match self {
            XcpStep::UploadId => {
                s.target.id.clear();
                Self::after_id(s)
            }
            _ => {
                let ack = [PID_RES, 0, 0, 0, 0, 0, 0, 0];
                self.on_ack(&ack, s, ctx)
            }
        }
    }

    fn classify(data: &[u8; FRAME_SIZE], s: &Session<Self>) -> Option<Response> {
        match data[0] {
            PID_RES => Some(Response::Ack(*data)),
            PID_ERR => Some(Response::Nack(data[1])),
            other => {
                log::error!("XCP {}: got an unknown response 0x{other:02X}", s.index);
                None
            }
        }
    }

    fn error_text(code: i32) -> String {
        match code {
            TIMEOUT_ERROR => "Timeout".to_string(),
            DTO_BUILD_ERROR => "Cannot build DTOs".to_string(),
            c => XcpError::from(c as u8).desc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session<XcpStep> {
        Session::new(1)
    }

    #[test]
    fn responses_are_sorted_by_packet_id() {
        let s = session();
        assert_eq!(
            XcpStep::classify(&[0xFF, 1, 2, 3, 4, 5, 6, 7], &s),
            Some(Response::Ack([0xFF, 1, 2, 3, 4, 5, 6, 7]))
        );
        assert_eq!(
            XcpStep::classify(&[0xFE, 0x25, 0, 0, 0, 0, 0, 0], &s),
            Some(Response::Nack(0x25))
        );
        assert_eq!(XcpStep::classify(&[0xFD, 0, 0, 0, 0, 0, 0, 0], &s), None);
    }

    #[test]
    fn seed_spans_several_responses() {
        let mut scratch = XcpScratch::default();
        assert!(!collect_seed(&mut scratch, &[0xFF, 8, 1, 2, 3, 4, 5, 6]));
        assert!(collect_seed(&mut scratch, &[0xFF, 2, 7, 8, 0xEE, 0xEE, 0xEE, 0xEE]));
        assert_eq!(scratch.seed, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn key_is_sent_with_remaining_length() {
        let mut s = session();
        s.scratch.key = (1..=8).collect();
        assert_eq!(unlock(&s).into_bytes(), [0xF7, 8, 1, 2, 3, 4, 5, 6]);
        s.scratch.key_pos = 6;
        assert_eq!(unlock(&s).into_bytes(), [0xF7, 2, 7, 8, 0, 0, 0, 0]);
    }

    #[test]
    fn second_get_seed_asks_for_the_remainder() {
        let mut s = session();
        s.sequence = CommandSequence::StartCalibration;
        assert_eq!(get_seed(&s).into_bytes()[..3], [0xF8, 0, PL_CAL]);
        s.scratch.seed.push(0x11);
        s.sequence = CommandSequence::StartMeasurement;
        assert_eq!(get_seed(&s).into_bytes()[..3], [0xF8, 1, PL_DAQ]);
    }

    #[test]
    fn daq_setup_nacks_are_tolerated() {
        assert!(XcpStep::FreeDaq.tolerates_nack());
        assert!(XcpStep::AllocOdtEntry.tolerates_nack());
        assert!(XcpStep::UploadId.tolerates_nack());
        assert!(!XcpStep::WriteDaq.tolerates_nack());
        assert!(!XcpStep::Connect.tolerates_nack());
    }

    #[test]
    fn error_texts() {
        assert_eq!(XcpStep::error_text(-1), "Timeout");
        assert_eq!(XcpStep::error_text(0x25), "Access denied, Seed & Key is required");
        assert_eq!(XcpStep::error_text(0x77), "Unknown XCP Errorcode");
    }
}
