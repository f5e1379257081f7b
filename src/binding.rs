//! Node.js binding (feature `napi`).
//!
//! Flat functions keyed by descriptor, backed by [`LinuxGpib`] and lock
//! files from [`LockDir::from_env`]. Open sessions live in a registry until
//! `close`. Failures become JS errors carrying the [`GpibError`] message.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use napi::bindgen_prelude::Buffer;
use napi_derive::napi;
use parking_lot::{const_mutex, Mutex};

use crate::config::{ConfigOption, DeviceConfig, EosFlags, Timeout};
use crate::error::{GpibError, Result};
use crate::linux::LinuxGpib;
use crate::lock::LockDir;
use crate::session::{Gpib, Session};
use crate::status::{last_count, last_status, Status};

type LinuxSession = Session<LinuxGpib, LockDir>;

const DEFAULT_READ_LEN: u32 = 512;

static SESSIONS: Mutex<BTreeMap<i32, LinuxSession>> = const_mutex(BTreeMap::new());

fn gpib() -> &'static Gpib<LinuxGpib, LockDir> {
    static GPIB: OnceLock<Gpib<LinuxGpib, LockDir>> = OnceLock::new();
    GPIB.get_or_init(Gpib::linux)
}

fn to_js(err: GpibError) -> napi::Error {
    napi::Error::from_reason(err.to_string())
}

fn with_session<T>(ud: i32, f: impl FnOnce(&LinuxSession) -> Result<T>) -> napi::Result<T> {
    let sessions = SESSIONS.lock();
    let session = sessions
        .get(&ud)
        .ok_or_else(|| to_js(GpibError::SessionClosed { descriptor: ud }))?;
    f(session).map_err(to_js)
}

fn register(session: LinuxSession) -> i32 {
    let ud = session.descriptor();
    SESSIONS.lock().insert(ud, session);
    ud
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Opens a board or device by configured name and locks it.
#[napi]
pub fn find(name: String) -> napi::Result<i32> {
    gpib().find(&name).map(register).map_err(to_js)
}

/// Opens a device by address. `sad` is 0-30 or absent; `eos` is the raw EOS word.
#[napi]
pub fn ibdev(
    board: i32,
    pad: u32,
    sad: Option<u32>,
    tmo: Option<i32>,
    eot: Option<bool>,
    eos: Option<i32>,
) -> napi::Result<i32> {
    let address = |name: &str, value: u32| {
        u8::try_from(value).map_err(|_| to_js(GpibError::invalid_parameter(name, "must be 0-30")))
    };
    let mut config = DeviceConfig::new(board, address("pad", pad)?);
    if let Some(sad) = sad {
        config = config.with_secondary_address(address("sad", sad)?);
    }
    if let Some(tmo) = tmo {
        config = config.with_timeout(Timeout::from_code(tmo).map_err(to_js)?);
    }
    if let Some(eot) = eot {
        config = config.with_eot(eot);
    }
    if let Some(eos) = eos {
        config = config
            .with_eos_char((eos & 0xff) as u8)
            .with_eos_flags(EosFlags::from_bits_truncate((eos & 0xff00) as u16));
    }
    gpib().open(&config).map(register).map_err(to_js)
}

/// Queries a configuration option.
#[napi]
pub fn ibask(ud: i32, option: i32) -> napi::Result<i32> {
    let option = ConfigOption::from_code(option).map_err(to_js)?;
    with_session(ud, |s| s.query_option(option))
}

/// Sets a configuration option.
#[napi]
pub fn ibconfig(ud: i32, option: i32, value: i32) -> napi::Result<()> {
    let option = ConfigOption::from_code(option).map_err(to_js)?;
    with_session(ud, |s| s.set_option(option, value))
}

/// Reads text, up to the first NUL.
#[napi]
pub fn read(ud: i32, len: Option<u32>) -> napi::Result<String> {
    let len = len.unwrap_or(DEFAULT_READ_LEN) as usize;
    with_session(ud, |s| s.read_text(len))
}

/// Reads raw bytes.
#[napi]
pub fn readbin(ud: i32, len: Option<u32>) -> napi::Result<Buffer> {
    let len = len.unwrap_or(DEFAULT_READ_LEN) as usize;
    with_session(ud, |s| s.read(len)).map(Buffer::from)
}

/// Writes text; returns the byte count.
#[napi]
pub fn write(ud: i32, data: String) -> napi::Result<u32> {
    with_session(ud, |s| s.write(data.as_bytes())).map(count)
}

/// Writes raw bytes; returns the byte count.
#[napi]
pub fn writebin(ud: i32, data: Buffer) -> napi::Result<u32> {
    with_session(ud, |s| s.write(&data)).map(count)
}

/// Starts an asynchronous write; returns the status word.
#[napi]
pub fn writea(ud: i32, data: Buffer) -> napi::Result<u32> {
    with_session(ud, |s| s.write_async(&data)).map(|sta| u32::from(sta.bits()))
}

/// Sends command bytes; returns the status word.
#[napi]
pub fn cmd(ud: i32, data: Buffer) -> napi::Result<u32> {
    with_session(ud, |s| s.send_command(&*data)).map(|sta| u32::from(sta.bits()))
}

/// Asserts or releases REN.
#[napi]
pub fn ren(ud: i32, enable: bool) -> napi::Result<()> {
    with_session(ud, |s| s.remote_enable(enable).map(drop))
}

/// Sends a selected device clear.
#[napi]
pub fn clear(ud: i32) -> napi::Result<()> {
    with_session(ud, LinuxSession::clear)
}

/// Pulses IFC. Unknown descriptors are ignored.
#[napi]
pub fn ifc(ud: i32) {
    if let Some(session) = SESSIONS.lock().get(&ud) {
        session.interface_clear();
    }
}

/// Releases the lock and takes the descriptor offline.
#[napi]
pub fn close(ud: i32) -> napi::Result<()> {
    let session = SESSIONS.lock().remove(&ud);
    match session {
        Some(mut session) => session.close().map_err(to_js),
        None => Err(to_js(GpibError::SessionClosed { descriptor: ud })),
    }
}

/// Waits for any bit of `mask`; returns the status word.
#[napi]
pub fn wait(ud: i32, mask: u32) -> napi::Result<u32> {
    let mask = Status::from_raw(mask as i32);
    with_session(ud, |s| s.wait(mask)).map(|sta| u32::from(sta.bits()))
}

/// Sets the timeout class (0-17).
#[napi]
pub fn tmo(ud: i32, timeout: i32) -> napi::Result<()> {
    let timeout = Timeout::from_code(timeout).map_err(to_js)?;
    with_session(ud, |s| s.set_timeout(timeout))
}

/// Serial polls; returns the status byte.
#[napi]
pub fn rsp(ud: i32) -> napi::Result<u32> {
    with_session(ud, LinuxSession::serial_poll).map(u32::from)
}

/// Sends a group execute trigger.
#[napi]
pub fn trg(ud: i32) -> napi::Result<()> {
    with_session(ud, LinuxSession::trigger)
}

/// Status word of the last call.
#[napi]
pub fn ibsta() -> u32 {
    u32::from(last_status().bits())
}

/// Byte count of the last call.
#[napi]
pub fn ibcnt() -> u32 {
    count(last_count())
}
