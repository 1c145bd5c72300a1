use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use ecu_calibration::{
    ConnectionState, Engine, EngineError, Protocol, SessionMode,
    channel::{CanFrame, TransportRequest},
    config::{EngineOptions, IniFile},
    hardware::simulation::SimulationTransport,
    seed_key::{SeedKey, SeedKeyError, SeedKeyResult},
    variables::MemoryStore,
};

const CRO: u32 = 0x7F0;
// CRM and DTO share one identifier
const CRM: u32 = 0x7F1;
const ID_ADDR: u32 = 0x8000_0000;
const MAX_TICKS: usize = 500;

const PL_CAL: u8 = 0x01;
const PL_DAQ: u8 = 0x04;

const INI: &str = r#"
[XCP Configuration for Target 0]
CRO_ID=0x7F0
CRM_ID=0x7F1
DTO_ID=0x7F1
Timeout=100
ReadParameterAfterCalib=1
v0=UWORD,Engine.Rpm,0x1000,rpm
v1=UBYTE,Engine.Load,0x1002
v2=UDWORD,Engine.Hours,0x1004
v3=UDWORD,Engine.Odometer,0x1008
p0=UWORD,k_gain,0x3000
"#;

/// Minimal XCP on CAN slave, Intel byte order, one dynamic DAQ list
#[derive(Debug, Default)]
struct XcpSimEcu {
    memory: HashMap<u32, u8>,
    mta: u32,
    id: Vec<u8>,
    protection: u8,
    seed: Vec<u8>,
    seed_pos: usize,
    key: Vec<u8>,
    /// Never answer this command
    silent_on: Option<u8>,
    /// Answer this command with this error code
    fail_on: Option<(u8, u8)>,
    odts: Vec<u8>,
    daq_ptr: u8,
    daq_entries: Vec<(u8, u8, u32)>,
    running: bool,
}

impl XcpSimEcu {
    fn new() -> Self {
        Self {
            id: b"XCP-SIM".to_vec(),
            seed: vec![0x10, 0x20, 0x30, 0x40, 0x50, 0x60, 0x70, 0x80],
            ..Self::default()
        }
    }

    fn poke(&mut self, address: u32, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            self.memory.insert(address + i as u32, *b);
        }
    }

    fn peek(&self, address: u32, len: usize) -> Vec<u8> {
        (0..len as u32)
            .map(|i| self.memory.get(&(address + i)).copied().unwrap_or(0))
            .collect()
    }

    fn expected_key(&self) -> Vec<u8> {
        self.seed.iter().map(|b| b ^ 0x5A).collect()
    }

    fn on_cto(&mut self, cto: &CanFrame) -> Vec<CanFrame> {
        if cto.identifier != CRO {
            return Vec::new();
        }
        let d = cto.data;
        if self.silent_on == Some(d[0]) {
            println!("-- ECU ignores {:02X?}", d);
            return Vec::new();
        }
        let nack = |code: u8| vec![CanFrame::new(0, CRM, false, [0xFE, code, 0, 0, 0, 0, 0, 0])];
        if let Some((cmd, code)) = self.fail_on {
            if cmd == d[0] {
                return nack(code);
            }
        }
        let mut r = [0xFF, 0, 0, 0, 0, 0, 0, 0];
        match d[0] {
            // CONNECT
            0xFF => {
                r[1] = PL_CAL | PL_DAQ;
                r[3] = 8;
                r[4..6].copy_from_slice(&[0x00, 0x08]);
            }
            // DISCONNECT
            0xFE => self.running = false,
            // GET_STATUS
            0xFD => r[2] = self.protection,
            // GET_ID
            0xFA => {
                r[4..8].copy_from_slice(&(self.id.len() as u32).to_le_bytes());
                let id = self.id.clone();
                self.poke(ID_ADDR, &id);
                self.mta = ID_ADDR;
            }
            // GET_SEED
            0xF8 => {
                if d[1] == 0 {
                    self.seed_pos = 0;
                    self.key.clear();
                }
                if self.protection & d[2] == 0 {
                    r[1] = 0;
                } else {
                    let remaining = &self.seed[self.seed_pos..];
                    let n = remaining.len().min(6);
                    r[1] = remaining.len() as u8;
                    r[2..2 + n].copy_from_slice(&remaining[..n]);
                    self.seed_pos += n;
                }
            }
            // UNLOCK
            0xF7 => {
                let remaining = d[1] as usize;
                let n = remaining.min(6);
                self.key.extend_from_slice(&d[2..2 + n]);
                if remaining <= 6 {
                    if self.key != self.expected_key() {
                        return nack(0x25);
                    }
                    self.protection = 0;
                }
                r[1] = self.protection;
            }
            // SET_MTA
            0xF6 => self.mta = u32::from_le_bytes([d[4], d[5], d[6], d[7]]),
            // UPLOAD
            0xF5 => {
                let n = d[1] as usize;
                let bytes = self.peek(self.mta, n);
                r[1..1 + n].copy_from_slice(&bytes);
                self.mta += n as u32;
            }
            // DOWNLOAD
            0xF0 => {
                let n = d[1] as usize;
                let mta = self.mta;
                self.poke(mta, &d[2..2 + n]);
                self.mta += n as u32;
            }
            // GET_DAQ_PROCESSOR_INFO
            0xDA => r[1] = 0x01,
            // FREE_DAQ
            0xD6 => {
                self.odts.clear();
                self.daq_entries.clear();
            }
            // ALLOC_DAQ
            0xD5 => {}
            // ALLOC_ODT
            0xD4 => self.odts = vec![0; d[4] as usize],
            // ALLOC_ODT_ENTRY
            0xD3 => match self.odts.get_mut(d[4] as usize) {
                Some(entries) => *entries = d[5],
                None => return nack(0x22),
            },
            // SET_DAQ_PTR
            0xE2 => self.daq_ptr = d[4],
            // WRITE_DAQ
            0xE1 => self
                .daq_entries
                .push((self.daq_ptr, d[2], u32::from_le_bytes([d[4], d[5], d[6], d[7]]))),
            // SET_DAQ_LIST_MODE, START_STOP_DAQ_LIST
            0xE0 | 0xDE => {}
            // START_STOP_SYNCH
            0xDD => self.running = d[1] == 1,
            _ => return nack(0x20),
        }
        vec![CanFrame::new(0, CRM, false, r)]
    }
}

/// Key provider matching [XcpSimEcu::expected_key]
#[derive(Debug)]
struct XorKey {
    privileges: Arc<Mutex<Vec<u8>>>,
}

impl SeedKey for XorKey {
    fn compute_key(&self, privilege: u8, seed: &[u8]) -> SeedKeyResult<Vec<u8>> {
        self.privileges.lock().unwrap().push(privilege);
        Ok(seed.iter().map(|b| b ^ 0x5A).collect())
    }
}

#[derive(Debug)]
struct RejectingKey;

impl SeedKey for RejectingKey {
    fn compute_key(&self, _privilege: u8, _seed: &[u8]) -> SeedKeyResult<Vec<u8>> {
        Err(SeedKeyError::WrongSeedLength)
    }
}

type SimEngine = Engine<SimulationTransport, MemoryStore>;

fn setup(ecu: XcpSimEcu) -> (SimEngine, Arc<Mutex<XcpSimEcu>>, Instant) {
    let _ = env_logger::builder().is_test(true).try_init();
    let ecu = Arc::new(Mutex::new(ecu));
    let sim = ecu.clone();
    let mut transport = SimulationTransport::new(move |f| sim.lock().unwrap().on_cto(f));
    let now = Instant::now();
    transport.set_clock(now);
    let engine = Engine::new(
        transport,
        MemoryStore::new(),
        IniFile::parse(INI).unwrap(),
        EngineOptions::default(),
    );
    (engine, ecu, now)
}

fn tick_until<F: Fn(&SimEngine) -> bool>(engine: &mut SimEngine, now: Instant, cond: F) {
    for _ in 0..MAX_TICKS {
        engine.tick_at(now);
        if cond(engine) {
            return;
        }
    }
    panic!("condition not reached within {MAX_TICKS} ticks");
}

fn done(engine: &SimEngine) -> bool {
    engine.is_done(Protocol::Xcp, 0).unwrap().0
}

fn opcodes(engine: &SimEngine) -> Vec<u8> {
    engine.transport().transmitted().iter().map(|f| f.data[0]).collect()
}

fn dto_armed(engine: &SimEngine) -> bool {
    engine
        .transport()
        .requests()
        .iter()
        .any(|r| matches!(r, TransportRequest::ArmDtoTimeout { connection: 0, .. }))
}

/// Ticks an idle engine and returns the ticks (counted from 1) on which a GET_STATUS went out
fn idle_pings(engine: &mut SimEngine, now: Instant, ticks: usize) -> Vec<usize> {
    let mut seen = opcodes(engine).iter().filter(|op| **op == 0xFD).count();
    let mut at = Vec::new();
    for t in 1..=ticks {
        engine.tick_at(now);
        let pings = opcodes(engine).iter().filter(|op| **op == 0xFD).count();
        if pings > seen {
            seen = pings;
            at.push(t);
        }
    }
    at
}

fn start_calibration(engine: &mut SimEngine, now: Instant) {
    engine
        .start(Protocol::Xcp, 0, SessionMode::Calibrate, &["k_gain"])
        .unwrap();
    tick_until(engine, now, |e| {
        done(e) && e.transport().transmitted().iter().filter(|f| f.data[0] == 0xF6).count() == 1
    });
    engine.transport_mut().clear_requests();
}

fn start_measurement(engine: &mut SimEngine, now: Instant) {
    engine
        .start(Protocol::Xcp, 0, SessionMode::Measure, &["Engine.Rpm"])
        .unwrap();
    tick_until(engine, now, dto_armed);
    engine
        .transport_mut()
        .inject(&CanFrame::new(0, CRM, false, [0x00, 0xB8, 0x0B, 0, 0, 0, 0, 0]));
    tick_until(engine, now, done);
}

#[test]
pub fn measurement_start_and_stop() {
    let (mut engine, ecu, now) = setup(XcpSimEcu::new());
    engine
        .start(Protocol::Xcp, 0, SessionMode::Measure, &["Engine.Rpm", "Engine.Load"])
        .unwrap();

    tick_until(&mut engine, now, dto_armed);
    assert!(!done(&engine));
    assert!(ecu.lock().unwrap().running);
    engine
        .transport_mut()
        .inject(&CanFrame::new(0, CRM, false, [0x00, 0xB8, 0x0B, 42, 0, 0, 0, 0]));
    tick_until(&mut engine, now, done);

    assert_eq!(
        opcodes(&engine),
        vec![0xFF, 0xFA, 0xF5, 0xDA, 0xD6, 0xD5, 0xD4, 0xD3, 0xE2, 0xE1, 0xE1, 0xE0, 0xDE, 0xDD]
    );
    assert_eq!(engine.is_done(Protocol::Xcp, 0).unwrap(), (true, 0, "OK".to_string()));
    assert_eq!(engine.store().read_by_name("Engine.Rpm"), Some(3000.0));
    assert_eq!(engine.store().read_by_name("Engine.Load"), Some(42.0));
    assert_eq!(
        ecu.lock().unwrap().daq_entries,
        vec![(0, 2, 0x1000), (0, 1, 0x1002)]
    );
    assert_eq!(ecu.lock().unwrap().odts, vec![2]);
    assert_eq!(
        engine.get_ecu_info_string(Protocol::Xcp, 0).unwrap(),
        "XCP TCU-String = \"XCP-SIM\" AvailabilityMask = 0x05 ProtectionMask = 0x00 MaxCTO = 8 MaxDTO = 8"
    );
    assert_eq!(engine.store().read_by_name("CAN.XCP[0].Status"), Some(3.0));

    engine.transport_mut().clear_requests();
    engine.stop(Protocol::Xcp, 0, SessionMode::Measure).unwrap();
    tick_until(&mut engine, now, done);
    assert_eq!(opcodes(&engine), vec![0xDE, 0xDD, 0xFE]);
    assert!(!ecu.lock().unwrap().running);
    assert_eq!(engine.connection_state(Protocol::Xcp, 0).unwrap(), ConnectionState::empty());
    assert_eq!(engine.store().attach_count("Engine.Rpm"), 0);
    assert!(matches!(
        engine.get_ecu_string(Protocol::Xcp, 0),
        Err(EngineError::NotActive(_))
    ));
}

#[test]
pub fn signals_are_split_over_several_odts() {
    let (mut engine, ecu, now) = setup(XcpSimEcu::new());
    engine
        .start(
            Protocol::Xcp,
            0,
            SessionMode::Measure,
            &["Engine.Load", "Engine.Hours", "Engine.Rpm", "Engine.Odometer"],
        )
        .unwrap();
    tick_until(&mut engine, now, dto_armed);

    // widest signals first, smaller ones fill the gaps
    assert_eq!(ecu.lock().unwrap().odts, vec![3, 1]);
    assert_eq!(
        ecu.lock().unwrap().daq_entries,
        vec![(0, 4, 0x1004), (0, 2, 0x1000), (0, 1, 0x1002), (1, 4, 0x1008)]
    );

    engine
        .transport_mut()
        .inject(&CanFrame::new(0, CRM, false, [0x00, 0x10, 0x27, 0, 0, 0xE8, 0x03, 7]));
    for _ in 0..5 {
        engine.tick_at(now);
    }
    assert!(!done(&engine));
    engine
        .transport_mut()
        .inject(&CanFrame::new(0, CRM, false, [0x01, 0x40, 0x42, 0x0F, 0, 0, 0, 0]));
    tick_until(&mut engine, now, done);

    assert_eq!(engine.store().read_by_name("Engine.Hours"), Some(10000.0));
    assert_eq!(engine.store().read_by_name("Engine.Rpm"), Some(1000.0));
    assert_eq!(engine.store().read_by_name("Engine.Load"), Some(7.0));
    assert_eq!(engine.store().read_by_name("Engine.Odometer"), Some(1_000_000.0));
}

#[test]
pub fn connect_timeout_tears_down() {
    let mut ecu = XcpSimEcu::new();
    ecu.silent_on = Some(0xFF);
    let (mut engine, _ecu, now) = setup(ecu);
    engine
        .start(Protocol::Xcp, 0, SessionMode::Measure, &["Engine.Rpm"])
        .unwrap();
    for _ in 0..10 {
        engine.tick_at(now);
    }
    assert!(!done(&engine));
    assert_eq!(opcodes(&engine), vec![0xFF]);

    engine.tick_at(now + Duration::from_millis(101));
    assert_eq!(
        engine.is_done(Protocol::Xcp, 0).unwrap(),
        (true, -1, "Timeout".to_string())
    );
    assert_eq!(engine.connection_state(Protocol::Xcp, 0).unwrap(), ConnectionState::empty());
    assert!(engine.transport().requests().contains(&TransportRequest::Deactivate(0)));
    assert_eq!(engine.is_all_done(Protocol::Xcp), (true, -1));
}

#[test]
pub fn missing_dtos_stop_the_measurement() {
    let (mut engine, _ecu, now) = setup(XcpSimEcu::new());
    engine
        .start(Protocol::Xcp, 0, SessionMode::Measure, &["Engine.Rpm"])
        .unwrap();
    tick_until(&mut engine, now, dto_armed);
    engine
        .transport_mut()
        .inject(&CanFrame::new(0, CRM, false, [0x00, 0x01, 0x00, 0, 0, 0, 0, 0]));
    tick_until(&mut engine, now, done);

    let later = now + Duration::from_millis(150);
    engine.transport_mut().set_clock(later);
    engine.tick_at(later);
    assert_eq!(engine.connection_state(Protocol::Xcp, 0).unwrap(), ConnectionState::empty());
    assert_eq!(engine.is_done(Protocol::Xcp, 0).unwrap().1, 0);
    assert_eq!(engine.store().attach_count("Engine.Rpm"), 0);
}

#[test]
pub fn protected_target_is_unlocked_with_long_key() {
    let mut ecu = XcpSimEcu::new();
    ecu.protection = PL_DAQ;
    let (mut engine, ecu, now) = setup(ecu);
    let privileges = Arc::new(Mutex::new(Vec::new()));
    engine
        .set_seed_key(
            Protocol::Xcp,
            0,
            Some(Box::new(XorKey {
                privileges: privileges.clone(),
            })),
        )
        .unwrap();
    engine
        .start(Protocol::Xcp, 0, SessionMode::Measure, &["Engine.Rpm"])
        .unwrap();
    tick_until(&mut engine, now, dto_armed);

    let frames = engine.transport().transmitted();
    let ops: Vec<u8> = frames.iter().map(|f| f.data[0]).collect();
    assert_eq!(&ops[..7], &[0xFF, 0xFD, 0xF8, 0xF8, 0xF7, 0xF7, 0xFA]);
    let seeds: Vec<[u8; 2]> = frames
        .iter()
        .filter(|f| f.data[0] == 0xF8)
        .map(|f| [f.data[1], f.data[2]])
        .collect();
    assert_eq!(seeds, vec![[0, PL_DAQ], [1, PL_DAQ]]);
    let unlock_lengths: Vec<u8> = frames.iter().filter(|f| f.data[0] == 0xF7).map(|f| f.data[1]).collect();
    assert_eq!(unlock_lengths, vec![8, 2]);

    assert_eq!(*privileges.lock().unwrap(), vec![PL_DAQ]);
    assert_eq!(ecu.lock().unwrap().protection, 0);
    assert_eq!(engine.is_done(Protocol::Xcp, 0).unwrap().1, 0);
}

#[test]
pub fn failed_key_computation_tears_down() {
    let mut ecu = XcpSimEcu::new();
    ecu.protection = PL_CAL;
    let (mut engine, _ecu, now) = setup(ecu);
    engine
        .set_seed_key(Protocol::Xcp, 0, Some(Box::new(RejectingKey)))
        .unwrap();
    engine
        .start(Protocol::Xcp, 0, SessionMode::Calibrate, &["k_gain"])
        .unwrap();
    tick_until(&mut engine, now, done);

    assert_eq!(engine.is_done(Protocol::Xcp, 0).unwrap().1, -1);
    assert!(!opcodes(&engine).contains(&0xF7));
    assert_eq!(engine.connection_state(Protocol::Xcp, 0).unwrap(), ConnectionState::empty());
}

#[test]
pub fn download_is_read_back() {
    let mut ecu = XcpSimEcu::new();
    ecu.poke(0x3000, &[0x07, 0x00]);
    let (mut engine, ecu, now) = setup(ecu);
    engine
        .start(Protocol::Xcp, 0, SessionMode::Calibrate, &["k_gain"])
        .unwrap();
    tick_until(&mut engine, now, |e| {
        done(e) && e.transport().transmitted().iter().filter(|f| f.data[0] == 0xF6).count() == 1
    });
    assert_eq!(engine.store().read_by_name("k_gain"), Some(7.0));
    assert!(
        engine
            .connection_state(Protocol::Xcp, 0)
            .unwrap()
            .contains(ConnectionState::CALIBRATION_ACTIVE)
    );
    engine.transport_mut().clear_requests();

    assert!(engine.store_mut().write_by_name("k_gain", 4660.0));
    tick_until(&mut engine, now, |e| {
        done(e) && e.transport().transmitted().iter().any(|f| f.data[0] == 0xF5)
    });

    assert_eq!(opcodes(&engine), vec![0xF6, 0xF0, 0xF6, 0xF5]);
    assert_eq!(ecu.lock().unwrap().peek(0x3000, 2), vec![0x34, 0x12]);
    assert_eq!(engine.store().read_by_name("k_gain"), Some(4660.0));
}

#[test]
pub fn daq_setup_nack_is_tolerated() {
    let mut ecu = XcpSimEcu::new();
    ecu.fail_on = Some((0xD6, 0x20));
    let (mut engine, _ecu, now) = setup(ecu);
    engine
        .start(Protocol::Xcp, 0, SessionMode::Measure, &["Engine.Rpm"])
        .unwrap();
    tick_until(&mut engine, now, dto_armed);
    assert!(opcodes(&engine).contains(&0xD5));
    assert_eq!(engine.is_done(Protocol::Xcp, 0).unwrap().1, 0);
}

#[test]
pub fn negative_response_aborts_with_code() {
    let mut ecu = XcpSimEcu::new();
    ecu.fail_on = Some((0xE1, 0x22));
    let (mut engine, _ecu, now) = setup(ecu);
    engine
        .start(Protocol::Xcp, 0, SessionMode::Measure, &["Engine.Rpm"])
        .unwrap();
    tick_until(&mut engine, now, done);
    assert_eq!(
        engine.is_done(Protocol::Xcp, 0).unwrap(),
        (
            true,
            0x22,
            "Command syntax valid but command parameter(s) out of range".to_string()
        )
    );
    assert!(
        !engine
            .connection_state(Protocol::Xcp, 0)
            .unwrap()
            .contains(ConnectionState::CONNECTED)
    );
}

#[test]
pub fn pending_request_makes_stop_busy() {
    let (mut engine, _ecu, now) = setup(XcpSimEcu::new());
    engine
        .start(Protocol::Xcp, 0, SessionMode::Calibrate, &["k_gain"])
        .unwrap();
    assert!(matches!(
        engine.stop(Protocol::Xcp, 0, SessionMode::Calibrate),
        Err(EngineError::Busy)
    ));
    tick_until(&mut engine, now, done);
    engine.stop(Protocol::Xcp, 0, SessionMode::Calibrate).unwrap();
    tick_until(&mut engine, now, done);
    assert_eq!(*opcodes(&engine).last().unwrap(), 0xFE);
    assert_eq!(engine.connection_state(Protocol::Xcp, 0).unwrap(), ConnectionState::empty());
}

#[test]
pub fn idle_calibration_sends_alive_pings() {
    let (mut engine, _ecu, now) = setup(XcpSimEcu::new());
    start_calibration(&mut engine, now);

    let period = EngineOptions::default().alive_ping_ticks() as usize + 2;
    let pings = idle_pings(&mut engine, now, 5 * period);
    assert_eq!(pings.len(), 5, "pings on ticks {pings:?}");
    assert!(pings.windows(2).all(|w| w[1] - w[0] == period), "pings on ticks {pings:?}");
    assert!(opcodes(&engine).iter().all(|op| *op == 0xFD));
    assert_eq!(engine.is_done(Protocol::Xcp, 0).unwrap().1, 0);
}

#[test]
pub fn download_restarts_the_alive_counter() {
    let (mut engine, _ecu, now) = setup(XcpSimEcu::new());
    start_calibration(&mut engine, now);
    let threshold = EngineOptions::default().alive_ping_ticks() as usize;

    for _ in 0..threshold / 2 {
        engine.tick_at(now);
    }
    assert!(engine.store_mut().write_by_name("k_gain", 1.0));
    tick_until(&mut engine, now, |e| {
        done(e) && e.transport().transmitted().iter().any(|f| f.data[0] == 0xF5)
    });
    assert_eq!(opcodes(&engine), vec![0xF6, 0xF0, 0xF6, 0xF5]);
    engine.transport_mut().clear_requests();

    let pings = idle_pings(&mut engine, now, threshold + 2);
    assert_eq!(pings.len(), 1, "pings on ticks {pings:?}");
    assert!(pings[0] >= threshold, "pings on ticks {pings:?}");
}

#[test]
pub fn no_alive_ping_while_measuring() {
    let (mut engine, _ecu, now) = setup(XcpSimEcu::new());
    start_calibration(&mut engine, now);
    start_measurement(&mut engine, now);
    assert!(engine.connection_state(Protocol::Xcp, 0).unwrap().contains(
        ConnectionState::CONNECTED | ConnectionState::MEASUREMENT_RUNNING | ConnectionState::CALIBRATION_ACTIVE
    ));
    assert_eq!(engine.store().read_by_name("Engine.Rpm"), Some(3000.0));
    engine.transport_mut().clear_requests();

    let period = EngineOptions::default().alive_ping_ticks() as usize + 2;
    for _ in 0..3 * period {
        engine.tick_at(now);
    }
    assert!(opcodes(&engine).is_empty(), "sent {:02X?}", opcodes(&engine));
}

#[test]
pub fn stop_after_rejected_stop_disconnects() {
    let (mut engine, ecu, now) = setup(XcpSimEcu::new());
    start_measurement(&mut engine, now);
    assert!(engine.transport().filter().is_active(0));

    ecu.lock().unwrap().fail_on = Some((0xDE, 0x22));
    engine.stop(Protocol::Xcp, 0, SessionMode::Measure).unwrap();
    tick_until(&mut engine, now, done);
    assert_eq!(engine.is_done(Protocol::Xcp, 0).unwrap().1, 0x22);
    assert_eq!(
        engine.connection_state(Protocol::Xcp, 0).unwrap(),
        ConnectionState::MEASUREMENT_RUNNING
    );

    ecu.lock().unwrap().fail_on = None;
    engine.transport_mut().clear_requests();
    engine.stop(Protocol::Xcp, 0, SessionMode::Measure).unwrap();
    tick_until(&mut engine, now, done);

    assert_eq!(opcodes(&engine), vec![0xDE, 0xDD, 0xFE]);
    assert_eq!(engine.is_done(Protocol::Xcp, 0).unwrap(), (true, 0, "OK".to_string()));
    assert_eq!(engine.connection_state(Protocol::Xcp, 0).unwrap(), ConnectionState::empty());
    assert!(!engine.transport().filter().is_active(0));
}

#[test]
pub fn unmeasurable_signals_finish_with_error() {
    let (mut engine, _ecu, now) = setup(XcpSimEcu::new());
    engine
        .start(Protocol::Xcp, 0, SessionMode::Measure, &["Engine.Missing"])
        .unwrap();
    tick_until(&mut engine, now, done);

    assert_eq!(
        engine.is_done(Protocol::Xcp, 0).unwrap(),
        (true, -2, "Cannot build DTOs".to_string())
    );
    assert!(!opcodes(&engine).contains(&0xD6));
}
