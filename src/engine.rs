//! The engine owns every CCP and XCP connection and drives them from one cyclic call
//!
//! ## Usage
//! ```no_run
//! use ecu_calibration::{Engine, Protocol, SessionMode};
//! use ecu_calibration::config::{EngineOptions, IniFile};
//! use ecu_calibration::hardware::channel_transport;
//! use ecu_calibration::variables::MemoryStore;
//!
//! let ini = IniFile::load("~/calibration.ini").unwrap();
//! let (transport, _can_process) = channel_transport();
//! let mut engine = Engine::new(transport, MemoryStore::new(), ini, EngineOptions::default());
//! engine.start(Protocol::Ccp, 0, SessionMode::Measure, &["Engine.Rpm", "Engine.Load"]).unwrap();
//! loop {
//!     engine.tick();
//!     let (done, error, text) = engine.is_done(Protocol::Ccp, 0).unwrap();
//!     if done {
//!         println!("measurement started: {error} {text}");
//!         break;
//!     }
//!     std::thread::sleep(std::time::Duration::from_millis(10));
//! }
//! ```

use std::{path::Path, time::Instant};

use crate::{
    EngineError, EngineResult,
    ccp::CcpStep,
    channel::{Transport, TransportEvent, TransportRequest},
    config::{ConfigError, EngineOptions, IniFile, Protocol},
    seed_key::SeedKey,
    session::{CommandSequence, CommandTable, ConnectionState, Ctx, Session, SessionMode},
    variables::VariableStore,
    xcp::XcpStep,
};

/// Connections available per protocol
pub const MAX_CONNECTIONS: usize = 4;

/// Runs up to [MAX_CONNECTIONS] CCP and XCP connections over one [Transport]
#[derive(Debug)]
pub struct Engine<T: Transport, S: VariableStore> {
    transport: T,
    store: S,
    ini: IniFile,
    options: EngineOptions,
    ccp: Vec<Session<CcpStep>>,
    xcp: Vec<Session<XcpStep>>,
    requests: Vec<TransportRequest>,
}

/// Validates a connection index handed in by the application
fn slot(index: usize) -> EngineResult<usize> {
    if index < MAX_CONNECTIONS {
        Ok(index)
    } else {
        log::error!("Connection number {index} too large (0...3)");
        Err(EngineError::InvalidConnection(index))
    }
}

impl<T: Transport, S: VariableStore> Engine<T, S> {
    /// Creates an engine with all connections idle
    ///
    /// ## Parameters
    /// * transport - Link to the CAN process
    /// * store - Variable store measured values and calibration parameters live in
    /// * ini - Configuration holding the `CCP/XCP Configuration for Target n` sections
    /// * options - Engine options
    pub fn new(transport: T, store: S, ini: IniFile, options: EngineOptions) -> Self {
        Self {
            transport,
            store,
            ini,
            options,
            ccp: (0..MAX_CONNECTIONS).map(Session::new).collect(),
            xcp: (0..MAX_CONNECTIONS).map(Session::new).collect(),
            requests: Vec::new(),
        }
    }

    /// Requests a sequence on a connection. Fails if the CAN process is not running or
    /// an other command is still queued
    fn request(&mut self, protocol: Protocol, index: usize, sequence: CommandSequence, what: &str) -> EngineResult<()> {
        let index = slot(index)?;
        if !self.transport.is_running() {
            log::error!("CAN transport not running. Start it before using {protocol}");
            return Err(EngineError::TransportUnavailable);
        }
        let requested = match protocol {
            Protocol::Ccp => &mut self.ccp[index].requested,
            Protocol::Xcp => &mut self.xcp[index].requested,
        };
        if *requested != CommandSequence::None {
            log::error!("cannot {what} {protocol} {index} because an other command is running");
            return Err(EngineError::Busy);
        }
        *requested = sequence;
        Ok(())
    }

    /// Starts measuring or calibrating on a connection
    ///
    /// ## Parameters
    /// * protocol - Protocol of the connection
    /// * index - Connection 0...3
    /// * mode - Measure the signals or calibrate the parameters named in `names`
    /// * names - Signal or parameter names, resolved against the `v`/`p` entries of the configuration
    pub fn start(&mut self, protocol: Protocol, index: usize, mode: SessionMode, names: &[&str]) -> EngineResult<()> {
        let sequence = match mode {
            SessionMode::Measure => CommandSequence::StartMeasurement,
            SessionMode::Calibrate => CommandSequence::StartCalibration,
        };
        self.request(protocol, index, sequence, "start")?;
        let labels = names.iter().map(|n| n.to_string()).collect();
        match protocol {
            Protocol::Ccp => self.ccp[index].labels = labels,
            Protocol::Xcp => self.xcp[index].labels = labels,
        }
        Ok(())
    }

    /// Stops measuring or calibrating on a connection. The target is disconnected once
    /// neither is active anymore
    pub fn stop(&mut self, protocol: Protocol, index: usize, mode: SessionMode) -> EngineResult<()> {
        let sequence = match mode {
            SessionMode::Measure => CommandSequence::StopMeasurement,
            SessionMode::Calibrate => CommandSequence::StopCalibration,
        };
        self.request(protocol, index, sequence, "stop")
    }

    /// Connects and reads the identification of the target
    pub fn request_ecu_info(&mut self, protocol: Protocol, index: usize) -> EngineResult<()> {
        self.request(protocol, index, CommandSequence::ReadEcuInfo, "read ECU infos over")
    }

    /// Returns `(done, error, error_text)` of a connection. A connection is done once nothing
    /// is queued or running and the initial parameter upload has finished
    pub fn is_done(&self, protocol: Protocol, index: usize) -> EngineResult<(bool, i32, String)> {
        let index = slot(index)?;
        Ok(match protocol {
            Protocol::Ccp => done_of(&self.ccp[index]),
            Protocol::Xcp => done_of(&self.xcp[index]),
        })
    }

    /// Returns `(done, errors)` over all connections of a protocol.
    /// `errors` is the bitwise OR of every connection's last error
    pub fn is_all_done(&self, protocol: Protocol) -> (bool, i32) {
        fn fold<C: CommandTable>(sessions: &[Session<C>]) -> (bool, i32) {
            sessions
                .iter()
                .fold((true, 0), |(done, err), s| (done && s.is_done(), err | s.error))
        }
        match protocol {
            Protocol::Ccp => fold(&self.ccp),
            Protocol::Xcp => fold(&self.xcp),
        }
    }

    /// Returns the target information of an active connection
    pub fn get_ecu_info_string(&self, protocol: Protocol, index: usize) -> EngineResult<String> {
        let index = slot(index)?;
        match protocol {
            Protocol::Ccp => {
                let s = &self.ccp[index];
                if !is_active(s.state) {
                    return Err(EngineError::NotActive("CCP conection not active".to_string()));
                }
                let t = &s.target;
                Ok(format!(
                    "CCP-Version = {}.{} TCU-String = \"{}\" AvailabilityMask = 0x{:02X} ProtectionMask = 0x{:02X} DAQ Size = {} DAQ pid = {}",
                    t.version >> 8,
                    t.version & 0xFF,
                    t.id_string(),
                    t.availability,
                    t.protection,
                    t.daq_size,
                    t.daq_pid
                ))
            }
            Protocol::Xcp => {
                let s = &self.xcp[index];
                if !is_active(s.state) {
                    return Err(EngineError::NotActive(format!("XCP {index} conection not active")));
                }
                let t = &s.target;
                Ok(format!(
                    "XCP TCU-String = \"{}\" AvailabilityMask = 0x{:02X} ProtectionMask = 0x{:02X} MaxCTO = {} MaxDTO = {}",
                    t.id_string(),
                    t.availability,
                    t.protection,
                    t.max_cto,
                    t.max_dto
                ))
            }
        }
    }

    /// Returns the identification string of an active connection
    pub fn get_ecu_string(&self, protocol: Protocol, index: usize) -> EngineResult<String> {
        let index = slot(index)?;
        let (state, id) = match protocol {
            Protocol::Ccp => (self.ccp[index].state, self.ccp[index].target.id_string()),
            Protocol::Xcp => (self.xcp[index].state, self.xcp[index].target.id_string()),
        };
        if is_active(state) {
            Ok(id)
        } else {
            Err(EngineError::NotActive(match protocol {
                Protocol::Ccp => "CCP conection not active".to_string(),
                Protocol::Xcp => format!("XCP {index} conection not active"),
            }))
        }
    }

    /// Copies the section `"CCP Configuration"` / `"XCP Configuration"` of the file at `path`
    /// into the configuration of connection `index`. The new configuration is used from the
    /// next start on
    pub fn load_config<P: AsRef<Path>>(&mut self, protocol: Protocol, index: usize, path: P) -> EngineResult<()> {
        let index = slot(index)?;
        let file = IniFile::load(path)?;
        let src = format!("{protocol} Configuration");
        self.ini.copy_section(&file, &src, &protocol.section_name(index))?;
        Ok(())
    }

    /// Writes the configuration of connection `index` as section `"CCP Configuration"` /
    /// `"XCP Configuration"` into a new file at `path`
    pub fn save_config<P: AsRef<Path>>(&self, protocol: Protocol, index: usize, path: P) -> EngineResult<()> {
        let index = slot(index)?;
        let mut file = IniFile::new();
        let dst = format!("{protocol} Configuration");
        file.copy_section(&self.ini, &protocol.section_name(index), &dst)?;
        std::fs::write(path.as_ref(), file.to_string()).map_err(|e| {
            log::error!("cannot save {protocol} config to file {}", path.as_ref().display());
            ConfigError::Io(e)
        })?;
        Ok(())
    }

    /// Replaces the configured seed & key computation of a connection.
    /// `None` goes back to the configured one
    pub fn set_seed_key(&mut self, protocol: Protocol, index: usize, provider: Option<Box<dyn SeedKey>>) -> EngineResult<()> {
        let index = slot(index)?;
        match protocol {
            Protocol::Ccp => self.ccp[index].seed_key = provider,
            Protocol::Xcp => self.xcp[index].seed_key = provider,
        }
        Ok(())
    }

    /// Connection state mask of a connection
    pub fn connection_state(&self, protocol: Protocol, index: usize) -> EngineResult<ConnectionState> {
        let index = slot(index)?;
        Ok(match protocol {
            Protocol::Ccp => self.ccp[index].state,
            Protocol::Xcp => self.xcp[index].state,
        })
    }

    /// Configuration the connections read on every start
    pub fn ini(&self) -> &IniFile {
        &self.ini
    }

    /// Mutable access to the configuration
    pub fn ini_mut(&mut self) -> &mut IniFile {
        &mut self.ini
    }

    /// Variable store of the engine
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Mutable access to the variable store. Writing a calibration parameter here
    /// downloads it to the target on one of the next ticks
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Transport of the engine
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable access to the transport
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Runs one engine cycle now
    pub fn tick(&mut self) {
        self.tick_at(Instant::now())
    }

    /// Runs one engine cycle with `now` as the current time. Every connection advances
    /// by at most one half command
    pub fn tick_at(&mut self, now: Instant) {
        let alive = self.options.alive_ping_ticks();
        while let Some(event) = self.transport.try_recv() {
            let mut ctx = Ctx {
                now,
                ini: &self.ini,
                store: &mut self.store,
                requests: &mut self.requests,
            };
            match connection_of(&event) {
                Some(c) if c < MAX_CONNECTIONS => route(&mut self.xcp[c], event, &mut ctx),
                Some(c) if c < 2 * MAX_CONNECTIONS => route(&mut self.ccp[c - MAX_CONNECTIONS], event, &mut ctx),
                _ => log::warn!("Event for an unknown connection: {event:?}"),
            }
        }

        {
            let mut ctx = Ctx {
                now,
                ini: &self.ini,
                store: &mut self.store,
                requests: &mut self.requests,
            };
            for s in self.xcp.iter_mut() {
                s.tick(&mut ctx, alive);
            }
            for s in self.ccp.iter_mut() {
                s.tick(&mut ctx, alive);
            }
        }

        for request in self.requests.drain(..) {
            if let Err(e) = self.transport.send(request) {
                log::error!("Transport request failed: {e}");
            }
        }
        self.publish_status();
    }

    /// Publishes the status variables of every connection
    fn publish_status(&mut self) {
        let prefix = &self.options.status_prefix;
        for s in &self.ccp {
            let version = s.target.version as f64;
            let status = s.state.bits() as f64;
            let command = s.command_code() as f64;
            let sequence = s.sequence as u32 as f64;
            let base = format!("{prefix}.CCP[{}]", s.index);
            self.store.publish(&format!("{base}.Version"), version);
            self.store.publish(&format!("{base}.Status"), status);
            self.store.publish(&format!("{base}.Command"), command);
            self.store.publish(&format!("{base}.CommandSequence"), sequence);
            if s.index == 0 {
                self.store.publish(&format!("{prefix}.CCPVersion"), version);
                self.store.publish(&format!("{prefix}.CCPStatus"), status);
                self.store.publish(&format!("{prefix}.CCPCommand"), command);
                self.store.publish(&format!("{prefix}.CCPCommandSequence"), sequence);
            }
        }
        for s in &self.xcp {
            let base = format!("{prefix}.XCP[{}]", s.index);
            self.store.publish(&format!("{base}.Status"), s.state.bits() as f64);
            self.store.publish(&format!("{base}.Command"), s.command_code() as f64);
            self.store.publish(&format!("{base}.CommandSequence"), s.sequence as u32 as f64);
        }
    }
}

fn is_active(state: ConnectionState) -> bool {
    state.intersects(ConnectionState::MEASUREMENT_RUNNING | ConnectionState::CALIBRATION_ACTIVE)
}

fn done_of<C: CommandTable>(s: &Session<C>) -> (bool, i32, String) {
    let text = if s.error == 0 {
        "OK".to_string()
    } else {
        C::error_text(s.error)
    };
    (s.is_done(), s.error, text)
}

fn connection_of(event: &TransportEvent) -> Option<usize> {
    match event {
        TransportEvent::Response { connection, .. }
        | TransportEvent::Samples { connection, .. }
        | TransportEvent::DtoTimeout(connection)
        | TransportEvent::FirstSampleReceived(connection) => Some(*connection),
    }
}

/// Hands a transport event to its session
fn route<C: CommandTable>(s: &mut Session<C>, event: TransportEvent, ctx: &mut Ctx<'_>) {
    match event {
        TransportEvent::Response { frame, .. } => {
            if s.config.debug {
                log::debug!("{} {} CRM: {:02X?}", C::PROTOCOL, s.index, frame.data);
            }
            s.deliver(frame.data)
        }
        TransportEvent::DtoTimeout(_) => {
            if s.state.contains(ConnectionState::MEASUREMENT_RUNNING) || s.sequence == CommandSequence::StartMeasurement {
                s.on_dto_timeout(ctx)
            }
        }
        TransportEvent::FirstSampleReceived(_) => s.first_sample = true,
        TransportEvent::Samples { values, .. } => {
            for (id, value) in values {
                ctx.store.write(id, value.as_f64());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hardware::simulation::SimulationTransport, variables::MemoryStore};

    fn engine() -> Engine<SimulationTransport, MemoryStore> {
        Engine::new(
            SimulationTransport::new(|_| Vec::new()),
            MemoryStore::new(),
            IniFile::new(),
            EngineOptions::default(),
        )
    }

    #[test]
    fn connection_index_is_checked() {
        let mut e = engine();
        assert!(matches!(
            e.start(Protocol::Ccp, 4, SessionMode::Measure, &[]),
            Err(EngineError::InvalidConnection(4))
        ));
        assert!(e.is_done(Protocol::Xcp, 7).is_err());
    }

    #[test]
    fn second_request_is_busy() {
        let mut e = engine();
        e.start(Protocol::Xcp, 1, SessionMode::Calibrate, &["p"]).unwrap();
        assert!(matches!(e.stop(Protocol::Xcp, 1, SessionMode::Calibrate), Err(EngineError::Busy)));
        assert!(e.start(Protocol::Ccp, 1, SessionMode::Calibrate, &["p"]).is_ok());
        assert!(!e.is_done(Protocol::Xcp, 1).unwrap().0);
        assert_eq!(e.is_all_done(Protocol::Xcp), (false, 0));
        assert_eq!(e.is_all_done(Protocol::Xcp).0, e.is_done(Protocol::Xcp, 1).unwrap().0);
    }

    #[test]
    fn stopped_transport_refuses_start() {
        let mut e = engine();
        e.transport_mut().set_running(false);
        assert!(matches!(
            e.request_ecu_info(Protocol::Ccp, 0),
            Err(EngineError::TransportUnavailable)
        ));
        assert_eq!(e.is_done(Protocol::Ccp, 0).unwrap(), (true, 0, "OK".to_string()));
    }

    #[test]
    fn inactive_connection_has_no_info() {
        let e = engine();
        let err = e.get_ecu_info_string(Protocol::Ccp, 0).unwrap_err();
        assert_eq!(err.to_string(), "CCP conection not active");
        let err = e.get_ecu_string(Protocol::Xcp, 2).unwrap_err();
        assert_eq!(err.to_string(), "XCP 2 conection not active");
    }

    #[test]
    fn status_is_published_every_tick() {
        let mut e = engine();
        e.tick();
        assert_eq!(e.store().read_by_name("CAN.CCP[3].Status"), Some(0.0));
        assert_eq!(e.store().read_by_name("CAN.CCPCommandSequence"), Some(0.0));
        assert_eq!(e.store().read_by_name("CAN.XCP[0].Command"), Some(0.0));
    }

    #[test]
    fn config_is_copied_between_files() {
        let dir = std::env::temp_dir().join(format!("ecu_calibration_cfg_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("xcp.ini");
        std::fs::write(&path, "[XCP Configuration]\nCRO_ID=0x100\nTimeout=20\n").unwrap();

        let mut e = engine();
        e.load_config(Protocol::Xcp, 2, &path).unwrap();
        let section = e.ini().section("XCP Configuration for Target 2").unwrap();
        assert_eq!(section.get("CRO_ID"), Some("0x100"));

        let out = dir.join("saved.ini");
        e.save_config(Protocol::Xcp, 2, &out).unwrap();
        let saved = IniFile::load(&out).unwrap();
        assert_eq!(saved.section("XCP Configuration").and_then(|s| s.get("Timeout")), Some("20"));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
