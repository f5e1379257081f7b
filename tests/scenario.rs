//! End-to-end scenarios against the simulated bus.

use std::path::Path;
use std::sync::Arc;

use gpib_session::sim::{MemoryLocks, Op, SimInstrument, SimulatedBus};
use gpib_session::translate::{self, EABO, EDVR};
use gpib_session::{
    last_count, last_status, Acquire, DeviceConfig, DeviceLock, Gpib, GpibError, Instrument,
    LockDir, SessionState, Status,
};

const IDENTITY: &str = "ACME Instruments,Model 42,SN0001,1.0.3\n";

fn bus_with_identity() -> Arc<SimulatedBus> {
    let bus = Arc::new(SimulatedBus::new());
    bus.attach(0, 3, SimInstrument::new().with_identity(IDENTITY));
    bus
}

#[test]
fn identify_by_address() {
    let gpib = Gpib::new(bus_with_identity(), Arc::new(MemoryLocks::new()));
    let mut session = gpib.open(&DeviceConfig::new(0, 3)).unwrap();

    assert_eq!(session.write(b"*IDN?").unwrap(), 5);
    let reply = session.read(128).unwrap();
    assert_eq!(reply, IDENTITY.as_bytes());
    assert_eq!(last_count(), reply.len());
    assert!(last_status().ended());

    session.close().unwrap();
    assert_eq!(session.state(), SessionState::Closed);
}

#[test]
fn identify_through_instrument() {
    let gpib = Gpib::new(bus_with_identity(), Arc::new(MemoryLocks::new()));
    let instrument = Instrument::new(gpib.open(&DeviceConfig::new(0, 3)).unwrap());

    let id = instrument.identify().unwrap();
    assert_eq!(id.manufacturer, "ACME Instruments");
    assert_eq!(id.firmware, "1.0.3");
}

#[test]
fn timeout_is_reported_with_catalog_text() {
    let bus = Arc::new(SimulatedBus::new());
    bus.attach(0, 3, SimInstrument::new());
    let gpib = Gpib::new(bus, Arc::new(MemoryLocks::new()));
    let session = gpib.open(&DeviceConfig::new(0, 3)).unwrap();

    let err = session.read(16).unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(
        err.to_string(),
        format!("ibrd failed: {}", translate::error_description(EABO).unwrap())
    );
    assert!(last_status().contains(Status::ERR | Status::TIMO));
}

#[test]
fn signal_interrupted_read_is_retried() {
    let bus = Arc::new(SimulatedBus::new());
    bus.attach(0, 3, SimInstrument::new().with_identity(IDENTITY));
    let gpib = Gpib::new(Arc::clone(&bus), Arc::new(MemoryLocks::new()));
    let session = gpib.open(&DeviceConfig::new(0, 3)).unwrap();

    session.write(b"*IDN?").unwrap();
    bus.fail_next_with_errno(Op::Read, EDVR, Some(libc::EINTR));
    assert_eq!(session.read_text(128).unwrap(), IDENTITY);
    assert_eq!(bus.count(Op::Read), 2);
}

#[test]
fn named_sessions_exclude_each_other_through_lock_files() {
    let dir = tempfile::tempdir().unwrap();
    let locks = Arc::new(LockDir::new(dir.path()));
    let gpib = Gpib::new(Arc::new(SimulatedBus::new()), Arc::clone(&locks));

    let mut session = gpib.find("gpib0").unwrap();
    assert!(session.is_locked());
    let lock_file = locks.lock_file(Path::new("/dev/gpib0"));
    let content = std::fs::read_to_string(&lock_file).unwrap();
    assert_eq!(content.trim(), std::process::id().to_string());

    session.close().unwrap();
    assert!(!lock_file.exists());
}

#[test]
fn foreign_lock_file_blocks_find() {
    let dir = tempfile::tempdir().unwrap();
    let locks = Arc::new(LockDir::new(dir.path()));
    // pid 1 is always alive.
    std::fs::write(locks.lock_file(Path::new("/dev/gpib0")), "         1\n").unwrap();
    let bus = Arc::new(SimulatedBus::new());
    let gpib = Gpib::new(Arc::clone(&bus), Arc::clone(&locks));

    match gpib.find("gpib0") {
        Err(GpibError::LockHeld { owner }) => assert_eq!(owner, 1),
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(bus.count(Op::Online), 1);
    assert_eq!(
        locks.acquire(Path::new("/dev/gpib0")).unwrap(),
        Acquire::HeldBy(1)
    );
}

#[test]
fn sessions_can_be_shared_across_threads() {
    let bus = Arc::new(SimulatedBus::new());
    bus.attach(0, 3, SimInstrument::loopback());
    let gpib = Gpib::new(bus, Arc::new(MemoryLocks::new()));
    let session = Arc::new(gpib.open(&DeviceConfig::new(0, 3)).unwrap());

    let writer = {
        let session = Arc::clone(&session);
        std::thread::spawn(move || {
            session.write(b"from thread").unwrap();
            last_count()
        })
    };
    assert_eq!(writer.join().unwrap(), 11);
    assert_eq!(session.read(64).unwrap(), b"from thread");
}
