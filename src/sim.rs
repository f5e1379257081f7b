//! In-process simulated GPIB bus.
//!
//! [`SimulatedBus`] implements [`Driver`] without hardware: boards,
//! named descriptors and addressable [`SimInstrument`]s that answer
//! queries with canned replies or echo writes back (loopback). Failures
//! can be scripted per operation with [`SimulatedBus::fail_next`], and
//! every call is logged for later inspection.
//!
//! [`MemoryLocks`] is the matching in-memory [`DeviceLock`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use gpib_session::sim::{MemoryLocks, SimInstrument, SimulatedBus};
//! use gpib_session::{DeviceConfig, Gpib};
//!
//! let bus = Arc::new(SimulatedBus::new());
//! bus.attach(0, 3, SimInstrument::new().with_identity("ACME,Model 1,42,1.0"));
//!
//! let gpib = Gpib::new(bus, Arc::new(MemoryLocks::new()));
//! let session = gpib.open(&DeviceConfig::new(0, 3))?;
//! session.write(b"*IDN?")?;
//! assert_eq!(session.read(128)?, b"ACME,Model 1,42,1.0");
//! # Ok::<(), gpib_session::GpibError>(())
//! ```

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::config::{ConfigOption, EosFlags, Timeout, MAX_ADDRESS, SECONDARY_ADDRESS_OFFSET};
use crate::driver::Driver;
use crate::lock::{Acquire, DeviceLock};
use crate::status::{Status, StatusSnapshot};
use crate::translate::{EABO, EARG, ENEB, ENOL};

/// Serial poll status byte bit signalling a service request.
pub const RQS_BIT: u8 = 0x40;

/// Number of received messages an instrument remembers.
pub const RECEIVED_HISTORY: usize = 1024;

/// Number of calls the bus and lock call logs remember.
pub const CALL_HISTORY: usize = 4096;

/// Driver operations, as recorded in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Op {
    Find,
    Dev,
    Read,
    Write,
    WriteAsync,
    Command,
    RemoteEnable,
    Clear,
    InterfaceClear,
    Online,
    Ask,
    Config,
    Wait,
    Timeout,
    SerialPoll,
    Trigger,
}

/// One logged driver call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Call {
    /// Operation invoked.
    pub op: Op,
    /// Descriptor passed, or the returned one for `Find`/`Dev` (-1 on failure).
    pub descriptor: i32,
}

#[derive(Debug, Clone)]
struct Fault {
    op: Op,
    skip: usize,
    error: i32,
    os_error: Option<i32>,
}

/// A simulated instrument attached to a bus address.
#[derive(Debug, Clone, Default)]
pub struct SimInstrument {
    replies: Vec<(Vec<u8>, VecDeque<Vec<u8>>)>,
    loopback: bool,
    output: VecDeque<u8>,
    received: Vec<Vec<u8>>,
    status_byte: u8,
    triggers: usize,
    clears: usize,
}

impl SimInstrument {
    /// An instrument that only answers configured queries.
    pub fn new() -> Self {
        Self::default()
    }

    /// An instrument that echoes every unrecognized write back.
    pub fn loopback() -> Self {
        Self {
            loopback: true,
            ..Self::default()
        }
    }

    /// Answers `query` with `reply`.
    pub fn with_reply(self, query: impl AsRef<[u8]>, reply: impl AsRef<[u8]>) -> Self {
        self.with_replies(query, [reply])
    }

    /// Answers successive `query` writes with successive replies; the last
    /// reply repeats once the others are used up.
    pub fn with_replies<R: AsRef<[u8]>>(
        mut self,
        query: impl AsRef<[u8]>,
        replies: impl IntoIterator<Item = R>,
    ) -> Self {
        let replies = replies.into_iter().map(|r| r.as_ref().to_vec()).collect();
        self.replies.push((query.as_ref().to_vec(), replies));
        self
    }

    /// Answers `*IDN?` with `identity`.
    pub fn with_identity(self, identity: &str) -> Self {
        self.with_reply("*IDN?", identity)
    }

    /// Sets the serial poll status byte.
    pub fn with_status_byte(mut self, status_byte: u8) -> Self {
        self.status_byte = status_byte;
        self
    }

    /// Messages written to the instrument, in order; older entries are
    /// discarded past [`RECEIVED_HISTORY`].
    pub fn received(&self) -> &[Vec<u8>] {
        &self.received
    }

    /// Number of triggers received.
    pub fn triggers(&self) -> usize {
        self.triggers
    }

    /// Number of device clears received.
    pub fn clears(&self) -> usize {
        self.clears
    }

    /// Current serial poll status byte.
    pub fn status_byte(&self) -> u8 {
        self.status_byte
    }

    fn accept(&mut self, data: &[u8]) {
        if self.received.len() >= RECEIVED_HISTORY {
            self.received.drain(..RECEIVED_HISTORY / 2);
        }
        self.received.push(data.to_vec());
        let end = data
            .iter()
            .rposition(|b| !matches!(b, b'\n' | b'\r'))
            .map_or(0, |i| i + 1);
        let key = &data[..end];
        let reply = self
            .replies
            .iter_mut()
            .find(|(query, _)| query.as_slice() == key)
            .and_then(|(_, replies)| {
                if replies.len() > 1 {
                    replies.pop_front()
                } else {
                    replies.front().cloned()
                }
            });
        match reply {
            Some(reply) => self.output.extend(reply),
            None if self.loopback => self.output.extend(data.iter().copied()),
            None => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Board(i32),
    Device { board: i32, pad: u8 },
}

impl Target {
    fn board(self) -> i32 {
        match self {
            Target::Board(board) | Target::Device { board, .. } => board,
        }
    }
}

#[derive(Debug)]
struct Handle {
    target: Target,
    options: HashMap<i32, i32>,
}

#[derive(Debug, Default)]
struct BoardState {
    remote_enable: bool,
    commands: Vec<u8>,
    interface_clears: usize,
}

#[derive(Debug, Default)]
struct BusState {
    next_descriptor: i32,
    boards: HashMap<i32, BoardState>,
    names: HashMap<String, Target>,
    instruments: HashMap<(i32, u8), SimInstrument>,
    handles: HashMap<i32, Handle>,
    faults: Vec<Fault>,
    calls: Vec<Call>,
}

impl BusState {
    fn log(&mut self, op: Op, descriptor: i32) {
        if self.calls.len() >= CALL_HISTORY {
            self.calls.drain(..CALL_HISTORY / 2);
        }
        self.calls.push(Call { op, descriptor });
    }

    fn take_fault(&mut self, op: Op) -> Option<StatusSnapshot> {
        let index = self.faults.iter().position(|f| f.op == op)?;
        if self.faults[index].skip > 0 {
            self.faults[index].skip -= 1;
            return None;
        }
        let fault = self.faults.remove(index);
        Some(StatusSnapshot::failed(Status::empty(), fault.error, fault.os_error))
    }

    fn allocate(&mut self, target: Target, options: HashMap<i32, i32>) -> i32 {
        let ud = self.next_descriptor;
        self.next_descriptor += 1;
        self.handles.insert(ud, Handle { target, options });
        ud
    }

    fn target(&self, ud: i32) -> Option<Target> {
        self.handles.get(&ud).map(|h| h.target)
    }

    fn instrument(&mut self, ud: i32) -> Option<&mut SimInstrument> {
        match self.target(ud)? {
            Target::Device { board, pad } => self.instruments.get_mut(&(board, pad)),
            Target::Board(_) => None,
        }
    }

    fn base_status(&self, ud: i32) -> Status {
        match self.target(ud) {
            Some(Target::Board(_)) => Status::CMPL | Status::CIC,
            _ => Status::CMPL,
        }
    }

    /// Runs the common prologue: log, scripted fault, descriptor check.
    fn begin(&mut self, op: Op, ud: i32) -> Result<Target, StatusSnapshot> {
        self.log(op, ud);
        if let Some(failed) = self.take_fault(op) {
            return Err(failed);
        }
        self.target(ud)
            .ok_or_else(|| StatusSnapshot::failed(Status::empty(), EARG, None))
    }
}

/// A simulated GPIB bus implementing [`Driver`].
#[derive(Debug)]
pub struct SimulatedBus {
    state: Mutex<BusState>,
}

impl SimulatedBus {
    /// Creates a bus with board 0, reachable by name as `gpib0`.
    pub fn new() -> Self {
        let bus = Self {
            state: Mutex::new(BusState {
                next_descriptor: 1,
                ..BusState::default()
            }),
        };
        bus.add_board(0);
        bus.name_board("gpib0", 0);
        bus
    }

    /// Adds a board with the given index (which is also its minor number).
    pub fn add_board(&self, board: i32) {
        self.state.lock().boards.entry(board).or_default();
    }

    /// Makes `board` reachable through `find(name)`.
    pub fn name_board(&self, name: &str, board: i32) {
        self.state.lock().names.insert(name.to_string(), Target::Board(board));
    }

    /// Makes the device at `pad` on `board` reachable through `find(name)`.
    pub fn name_device(&self, name: &str, board: i32, pad: u8) {
        self.state
            .lock()
            .names
            .insert(name.to_string(), Target::Device { board, pad });
    }

    /// Attaches an instrument at `pad` on `board`.
    pub fn attach(&self, board: i32, pad: u8, instrument: SimInstrument) {
        let mut state = self.state.lock();
        state.boards.entry(board).or_default();
        state.instruments.insert((board, pad), instrument);
    }

    /// Returns a copy of the instrument at `pad` on `board`.
    pub fn instrument(&self, board: i32, pad: u8) -> Option<SimInstrument> {
        self.state.lock().instruments.get(&(board, pad)).cloned()
    }

    /// Sets an instrument's status byte, e.g. to raise a service request.
    pub fn set_status_byte(&self, board: i32, pad: u8, status_byte: u8) {
        if let Some(instrument) = self.state.lock().instruments.get_mut(&(board, pad)) {
            instrument.status_byte = status_byte;
        }
    }

    /// Makes the next call of `op` fail with driver error `error`.
    pub fn fail_next(&self, op: Op, error: i32) {
        self.fail_next_with_errno(op, error, None);
    }

    /// Makes the next call of `op` fail with `error` and OS error `os_error`.
    pub fn fail_next_with_errno(&self, op: Op, error: i32, os_error: Option<i32>) {
        self.state.lock().faults.push(Fault {
            op,
            skip: 0,
            error,
            os_error,
        });
    }

    /// Lets `skip` calls of `op` succeed, then fails the next one with `error`.
    pub fn fail_after(&self, op: Op, skip: usize, error: i32) {
        self.state.lock().faults.push(Fault {
            op,
            skip,
            error,
            os_error: None,
        });
    }

    /// Returns the call log, the most recent [`CALL_HISTORY`] calls at most.
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Empties the call log.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Returns how many logged calls were of `op`.
    pub fn count(&self, op: Op) -> usize {
        self.state.lock().calls.iter().filter(|c| c.op == op).count()
    }

    fn set(&self, op: Op, ud: i32, option: i32, value: i32) -> StatusSnapshot {
        let mut state = self.state.lock();
        if let Err(failed) = state.begin(op, ud) {
            return failed;
        }
        if let Some(handle) = state.handles.get_mut(&ud) {
            handle.options.insert(option, value);
        }
        StatusSnapshot::ok(state.base_status(ud), 0)
    }

    /// Returns whether `ud` is currently open.
    pub fn is_open(&self, ud: i32) -> bool {
        self.state.lock().handles.contains_key(&ud)
    }

    /// Command bytes sent on `board`.
    pub fn commands(&self, board: i32) -> Vec<u8> {
        self.state
            .lock()
            .boards
            .get(&board)
            .map(|b| b.commands.clone())
            .unwrap_or_default()
    }

    /// Number of interface clears issued on `board`.
    pub fn interface_clears(&self, board: i32) -> usize {
        self.state
            .lock()
            .boards
            .get(&board)
            .map_or(0, |b| b.interface_clears)
    }

    /// Whether REN is asserted on `board`.
    pub fn remote_enabled(&self, board: i32) -> bool {
        self.state
            .lock()
            .boards
            .get(&board)
            .is_some_and(|b| b.remote_enable)
    }

    fn transfer(&self, op: Op, ud: i32, data: &[u8]) -> StatusSnapshot {
        let mut state = self.state.lock();
        if let Err(failed) = state.begin(op, ud) {
            return failed;
        }
        let status = state.base_status(ud);
        match state.instrument(ud) {
            Some(instrument) => {
                instrument.accept(data);
                StatusSnapshot::ok(status, data.len())
            }
            None => StatusSnapshot::failed(Status::empty(), ENOL, None),
        }
    }
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for SimulatedBus {
    fn find(&self, name: &str) -> (i32, StatusSnapshot) {
        let mut state = self.state.lock();
        if let Some(failed) = state.take_fault(Op::Find) {
            state.log(Op::Find, -1);
            return (-1, failed);
        }
        let Some(target) = state.names.get(name).copied() else {
            state.log(Op::Find, -1);
            return (-1, StatusSnapshot::failed(Status::empty(), ENEB, None));
        };
        let ud = state.allocate(target, HashMap::new());
        state.log(Op::Find, ud);
        let status = state.base_status(ud);
        (ud, StatusSnapshot::ok(status, 0))
    }

    fn dev(&self, board: i32, pad: i32, sad: i32, tmo: i32, eot: i32, eos: i32)
        -> (i32, StatusSnapshot) {
        let mut state = self.state.lock();
        if let Some(failed) = state.take_fault(Op::Dev) {
            state.log(Op::Dev, -1);
            return (-1, failed);
        }
        if !state.boards.contains_key(&board) {
            state.log(Op::Dev, -1);
            return (-1, StatusSnapshot::failed(Status::empty(), ENEB, None));
        }
        let pad = match u8::try_from(pad) {
            Ok(pad) if pad <= MAX_ADDRESS && Timeout::from_code(tmo).is_ok() => pad,
            _ => {
                state.log(Op::Dev, -1);
                return (-1, StatusSnapshot::failed(Status::empty(), EARG, None));
            }
        };
        let eos_flags = EosFlags::from_bits_truncate(eos as u16);
        let options = HashMap::from([
            (ConfigOption::PrimaryAddress.code(), i32::from(pad)),
            (ConfigOption::SecondaryAddress.code(), if sad == 0 { 0 } else { sad - SECONDARY_ADDRESS_OFFSET }),
            (ConfigOption::Timeout.code(), tmo),
            (ConfigOption::Eot.code(), eot),
            (ConfigOption::EosChar.code(), eos & 0xff),
            (ConfigOption::EosRead.code(), i32::from(eos_flags.contains(EosFlags::REOS))),
            (ConfigOption::EosWrite.code(), i32::from(eos_flags.contains(EosFlags::XEOS))),
            (ConfigOption::EosCompare8Bit.code(), i32::from(eos_flags.contains(EosFlags::BIN))),
        ]);
        let ud = state.allocate(Target::Device { board, pad }, options);
        state.log(Op::Dev, ud);
        (ud, StatusSnapshot::ok(Status::CMPL, 0))
    }

    fn read(&self, ud: i32, buf: &mut [u8]) -> StatusSnapshot {
        let mut state = self.state.lock();
        if let Err(failed) = state.begin(Op::Read, ud) {
            return failed;
        }
        let status = state.base_status(ud);
        let Some(instrument) = state.instrument(ud) else {
            return StatusSnapshot::failed(Status::TIMO, EABO, None);
        };
        if instrument.output.is_empty() {
            return StatusSnapshot::failed(Status::TIMO, EABO, None);
        }
        let n = buf.len().min(instrument.output.len());
        for (slot, byte) in buf.iter_mut().zip(instrument.output.drain(..n)) {
            *slot = byte;
        }
        let status = if instrument.output.is_empty() {
            status | Status::END
        } else {
            status
        };
        StatusSnapshot::ok(status, n)
    }

    fn write(&self, ud: i32, data: &[u8]) -> StatusSnapshot {
        self.transfer(Op::Write, ud, data)
    }

    fn write_async(&self, ud: i32, data: Vec<u8>) -> StatusSnapshot {
        self.transfer(Op::WriteAsync, ud, &data)
    }

    fn command(&self, ud: i32, data: &[u8]) -> StatusSnapshot {
        let mut state = self.state.lock();
        let target = match state.begin(Op::Command, ud) {
            Ok(target) => target,
            Err(failed) => return failed,
        };
        let status = state.base_status(ud) | Status::ATN;
        if let Some(board) = state.boards.get_mut(&target.board()) {
            board.commands.extend_from_slice(data);
        }
        StatusSnapshot::ok(status, data.len())
    }

    fn remote_enable(&self, ud: i32, enable: bool) -> StatusSnapshot {
        let mut state = self.state.lock();
        let target = match state.begin(Op::RemoteEnable, ud) {
            Ok(target) => target,
            Err(failed) => return failed,
        };
        if let Some(board) = state.boards.get_mut(&target.board()) {
            board.remote_enable = enable;
        }
        let status = state.base_status(ud);
        StatusSnapshot::ok(if enable { status | Status::REM } else { status }, 0)
    }

    fn clear(&self, ud: i32) -> StatusSnapshot {
        let mut state = self.state.lock();
        if let Err(failed) = state.begin(Op::Clear, ud) {
            return failed;
        }
        let status = state.base_status(ud);
        match state.instrument(ud) {
            Some(instrument) => {
                instrument.clears += 1;
                instrument.output.clear();
                StatusSnapshot::ok(status, 0)
            }
            None => StatusSnapshot::failed(Status::empty(), ENOL, None),
        }
    }

    fn interface_clear(&self, ud: i32) {
        let mut state = self.state.lock();
        state.log(Op::InterfaceClear, ud);
        if let Some(board) = state.target(ud).map(Target::board) {
            if let Some(board) = state.boards.get_mut(&board) {
                board.interface_clears += 1;
            }
        }
    }

    fn online(&self, ud: i32, online: bool) -> StatusSnapshot {
        let mut state = self.state.lock();
        if let Err(failed) = state.begin(Op::Online, ud) {
            return failed;
        }
        if !online {
            state.handles.remove(&ud);
        }
        StatusSnapshot::ok(Status::CMPL, 0)
    }

    fn ask(&self, ud: i32, option: i32) -> (i32, StatusSnapshot) {
        let mut state = self.state.lock();
        let target = match state.begin(Op::Ask, ud) {
            Ok(target) => target,
            Err(failed) => return (0, failed),
        };
        let value = if option == ConfigOption::BoardIndex.code() {
            target.board()
        } else if option == ConfigOption::SystemController.code() {
            i32::from(matches!(target, Target::Board(_)))
        } else {
            state
                .handles
                .get(&ud)
                .and_then(|h| h.options.get(&option).copied())
                .unwrap_or(0)
        };
        (value, StatusSnapshot::ok(state.base_status(ud), 0))
    }

    fn config(&self, ud: i32, option: i32, value: i32) -> StatusSnapshot {
        self.set(Op::Config, ud, option, value)
    }

    fn wait(&self, ud: i32, mask: Status) -> StatusSnapshot {
        let mut state = self.state.lock();
        let target = match state.begin(Op::Wait, ud) {
            Ok(target) => target,
            Err(failed) => return failed,
        };
        let mut status = state.base_status(ud);
        match target {
            Target::Device { board, pad } => {
                if state
                    .instruments
                    .get(&(board, pad))
                    .is_some_and(|i| i.status_byte & RQS_BIT != 0)
                {
                    status |= Status::RQS;
                }
            }
            Target::Board(board) => {
                if state
                    .instruments
                    .iter()
                    .any(|((b, _), i)| *b == board && i.status_byte & RQS_BIT != 0)
                {
                    status |= Status::SRQI;
                }
            }
        }
        if !mask.is_empty() && !status.intersects(mask) {
            status |= Status::TIMO;
        }
        StatusSnapshot::ok(status, 0)
    }

    fn timeout(&self, ud: i32, timeout: Timeout) -> StatusSnapshot {
        self.set(Op::Timeout, ud, ConfigOption::Timeout.code(), timeout.code())
    }

    fn serial_poll(&self, ud: i32) -> (u8, StatusSnapshot) {
        let mut state = self.state.lock();
        if let Err(failed) = state.begin(Op::SerialPoll, ud) {
            return (0, failed);
        }
        let status = state.base_status(ud);
        match state.instrument(ud) {
            Some(instrument) => {
                let byte = instrument.status_byte;
                instrument.status_byte &= !RQS_BIT;
                (byte, StatusSnapshot::ok(status, 1))
            }
            None => (0, StatusSnapshot::failed(Status::empty(), EARG, None)),
        }
    }

    fn trigger(&self, ud: i32) -> StatusSnapshot {
        let mut state = self.state.lock();
        if let Err(failed) = state.begin(Op::Trigger, ud) {
            return failed;
        }
        let status = state.base_status(ud);
        match state.instrument(ud) {
            Some(instrument) => {
                instrument.triggers += 1;
                StatusSnapshot::ok(status, 0)
            }
            None => StatusSnapshot::failed(Status::empty(), ENOL, None),
        }
    }
}

/// A logged lock operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockCall {
    /// `acquire(device)`.
    Acquire(PathBuf),
    /// `release(device, pid)`.
    Release(PathBuf, u32),
}

#[derive(Debug, Default)]
struct LockTable {
    held: HashMap<PathBuf, u32>,
    failure: Option<io::ErrorKind>,
    calls: Vec<LockCall>,
}

/// An in-memory lock table implementing [`DeviceLock`].
#[derive(Debug, Default)]
pub struct MemoryLocks {
    state: Mutex<LockTable>,
}

impl MemoryLocks {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `device` as locked by `pid`.
    pub fn hold(&self, device: impl Into<PathBuf>, pid: u32) {
        self.state.lock().held.insert(device.into(), pid);
    }

    /// Makes the next acquire fail with an OS error of `kind`.
    pub fn fail_next_acquire(&self, kind: io::ErrorKind) {
        self.state.lock().failure = Some(kind);
    }

    /// Returns the holder of `device`, if locked.
    pub fn holder(&self, device: &Path) -> Option<u32> {
        self.state.lock().held.get(device).copied()
    }

    /// Returns the call log, the most recent [`CALL_HISTORY`] calls at most.
    pub fn calls(&self) -> Vec<LockCall> {
        self.state.lock().calls.clone()
    }

    /// Empties the call log.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }
}

impl LockTable {
    fn log(&mut self, call: LockCall) {
        if self.calls.len() >= CALL_HISTORY {
            self.calls.drain(..CALL_HISTORY / 2);
        }
        self.calls.push(call);
    }
}

impl DeviceLock for MemoryLocks {
    fn acquire(&self, device: &Path) -> io::Result<Acquire> {
        let mut state = self.state.lock();
        state.log(LockCall::Acquire(device.to_path_buf()));
        if let Some(kind) = state.failure.take() {
            return Err(io::Error::from(kind));
        }
        let me = std::process::id();
        match state.held.get(device) {
            Some(&owner) if owner != me => Ok(Acquire::HeldBy(owner)),
            _ => {
                state.held.insert(device.to_path_buf(), me);
                Ok(Acquire::Acquired)
            }
        }
    }

    fn release(&self, device: &Path, pid: u32) -> io::Result<()> {
        let mut state = self.state.lock();
        state.log(LockCall::Release(device.to_path_buf(), pid));
        match state.held.get(device) {
            Some(&owner) if pid != 0 && owner != pid => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is locked by process {}", device.display(), owner),
            )),
            _ => {
                state.held.remove(device);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_named_board() {
        let bus = SimulatedBus::new();
        let (ud, snapshot) = bus.find("gpib0");
        assert!(ud >= 0);
        assert!(!snapshot.is_error());
        assert!(snapshot.status.contains(Status::CIC));

        let (ud, snapshot) = bus.find("nope");
        assert_eq!(ud, -1);
        assert_eq!(snapshot.error, ENEB);
    }

    #[test]
    fn test_dev_stores_configuration() {
        let bus = SimulatedBus::new();
        let (ud, _) = bus.dev(0, 5, 0x62, 12, 1, 0x140A);
        assert_eq!(bus.ask(ud, ConfigOption::PrimaryAddress.code()).0, 5);
        assert_eq!(bus.ask(ud, ConfigOption::SecondaryAddress.code()).0, 2);
        assert_eq!(bus.ask(ud, ConfigOption::Timeout.code()).0, 12);
        assert_eq!(bus.ask(ud, ConfigOption::EosChar.code()).0, 0x0A);
        assert_eq!(bus.ask(ud, ConfigOption::EosRead.code()).0, 1);
        assert_eq!(bus.ask(ud, ConfigOption::EosWrite.code()).0, 0);
        assert_eq!(bus.ask(ud, ConfigOption::BoardIndex.code()).0, 0);
    }

    #[test]
    fn test_dev_rejects_unknown_board_and_bad_address() {
        let bus = SimulatedBus::new();
        assert_eq!(bus.dev(4, 1, 0, 14, 1, 0).0, -1);
        let (ud, snapshot) = bus.dev(0, 31, 0, 14, 1, 0);
        assert_eq!(ud, -1);
        assert_eq!(snapshot.error, EARG);
    }

    #[test]
    fn test_reply_queue_repeats_last() {
        let mut instrument = SimInstrument::new().with_replies("Q?", ["1", "2"]);
        instrument.accept(b"Q?\n");
        instrument.accept(b"Q?");
        instrument.accept(b"Q?");
        let output: Vec<u8> = instrument.output.iter().copied().collect();
        assert_eq!(output, b"122");
        assert_eq!(instrument.received().len(), 3);
    }

    #[test]
    fn test_partial_reads_set_end_on_last_chunk() {
        let bus = SimulatedBus::new();
        bus.attach(0, 1, SimInstrument::loopback());
        let (ud, _) = bus.dev(0, 1, 0, 14, 1, 0);
        bus.write(ud, b"abcdef");

        let mut buf = [0u8; 4];
        let first = bus.read(ud, &mut buf);
        assert_eq!(first.count, 4);
        assert!(!first.status.ended());

        let second = bus.read(ud, &mut buf);
        assert_eq!(second.count, 2);
        assert!(second.status.ended());
        assert_eq!(&buf[..2], b"ef");

        let third = bus.read(ud, &mut buf);
        assert!(third.is_error());
        assert_eq!(third.error, EABO);
    }

    #[test]
    fn test_write_without_listener() {
        let bus = SimulatedBus::new();
        let (ud, _) = bus.dev(0, 9, 0, 14, 1, 0);
        assert_eq!(bus.write(ud, b"x").error, ENOL);
    }

    #[test]
    fn test_scripted_fault_applies_once() {
        let bus = SimulatedBus::new();
        bus.attach(0, 1, SimInstrument::loopback());
        let (ud, _) = bus.dev(0, 1, 0, 14, 1, 0);
        bus.fail_next(Op::Write, EABO);

        assert!(bus.write(ud, b"x").is_error());
        assert!(!bus.write(ud, b"x").is_error());
        assert_eq!(bus.count(Op::Write), 2);
    }

    #[test]
    fn test_serial_poll_clears_rqs() {
        let bus = SimulatedBus::new();
        bus.attach(0, 2, SimInstrument::new().with_status_byte(0x41));
        let (ud, _) = bus.dev(0, 2, 0, 14, 1, 0);

        assert!(bus.wait(ud, Status::RQS).status.service_requested());
        assert_eq!(bus.serial_poll(ud).0, 0x41);
        assert_eq!(bus.serial_poll(ud).0, 0x01);
        assert!(bus.wait(ud, Status::RQS).status.timed_out());
    }

    #[test]
    fn test_memory_locks() {
        let locks = MemoryLocks::new();
        let device = Path::new("/dev/gpib0");
        let me = std::process::id();

        assert_eq!(locks.acquire(device).unwrap(), Acquire::Acquired);
        assert_eq!(locks.holder(device), Some(me));
        locks.release(device, me).unwrap();
        assert_eq!(locks.holder(device), None);

        locks.hold(device, 1);
        assert_eq!(locks.acquire(device).unwrap(), Acquire::HeldBy(1));
        assert!(locks.release(device, me).is_err());

        locks.fail_next_acquire(io::ErrorKind::PermissionDenied);
        assert!(locks.acquire(Path::new("/dev/gpib1")).is_err());
        assert_eq!(locks.calls().len(), 5);

        locks.clear_calls();
        assert!(locks.calls().is_empty());
    }

    #[test]
    fn test_call_logs_are_bounded() {
        let bus = SimulatedBus::new();
        let locks = MemoryLocks::new();
        let device = Path::new("/dev/gpib0");
        let (ud, _) = bus.dev(0, 2, 0, 14, 1, 0);

        for _ in 0..3 * CALL_HISTORY {
            bus.trigger(ud);
            locks.release(device, 0).unwrap();
        }
        assert!(bus.calls().len() <= CALL_HISTORY);
        assert!(locks.calls().len() <= CALL_HISTORY);
        assert_eq!(bus.calls().last().map(|c| c.op), Some(Op::Trigger));

        bus.clear_calls();
        assert!(bus.calls().is_empty());
    }

    #[test]
    fn test_fail_after_skips_calls() {
        let bus = SimulatedBus::new();
        let (ud, _) = bus.dev(0, 2, 0, 14, 1, 0);
        bus.fail_after(Op::Timeout, 1, EARG);

        assert!(!bus.timeout(ud, Timeout::T1s).is_error());
        assert_eq!(bus.timeout(ud, Timeout::T3s).error, EARG);
        assert!(!bus.timeout(ud, Timeout::T3s).is_error());
        assert_eq!(bus.count(Op::Timeout), 3);
    }
}
