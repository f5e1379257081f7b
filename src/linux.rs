//! [`Driver`] over the linux-gpib C library (`libgpib`).
//!
//! linux-gpib reports results through the process-global `ibsta`, `iberr`
//! and `ibcntl`. Every call here runs under one process-wide mutex and
//! copies those globals into a [`StatusSnapshot`] before the mutex is
//! released, so concurrent sessions never observe each other's status.
//!
//! Buffers handed to `ibwrta` stay owned by this module until `ibwait`
//! reports completion or the descriptor goes offline.

use std::collections::BTreeMap;
use std::ffi::{c_char, c_int, c_long, c_void, CString};
use std::io;
use std::ptr;

use parking_lot::{const_mutex, Mutex};
use tracing::trace;

use crate::config::Timeout;
use crate::driver::Driver;
use crate::status::{Status, StatusSnapshot};
use crate::translate::{is_os_error, EARG};

#[allow(non_upper_case_globals, non_snake_case)]
#[link(name = "gpib")]
extern "C" {
    static ibsta: c_int;
    static iberr: c_int;
    static ibcntl: c_long;

    fn ibfind(name: *const c_char) -> c_int;
    fn ibdev(board: c_int, pad: c_int, sad: c_int, tmo: c_int, eot: c_int, eos: c_int) -> c_int;
    fn ibrd(ud: c_int, buf: *mut c_void, count: c_long) -> c_int;
    fn ibwrt(ud: c_int, buf: *const c_void, count: c_long) -> c_int;
    fn ibwrta(ud: c_int, buf: *const c_void, count: c_long) -> c_int;
    fn ibcmd(ud: c_int, buf: *const c_void, count: c_long) -> c_int;
    fn ibsre(ud: c_int, enable: c_int) -> c_int;
    fn ibclr(ud: c_int) -> c_int;
    fn SendIFC(ud: c_int);
    fn ibonl(ud: c_int, online: c_int) -> c_int;
    fn ibask(ud: c_int, option: c_int, value: *mut c_int) -> c_int;
    fn ibconfig(ud: c_int, option: c_int, value: c_int) -> c_int;
    fn ibwait(ud: c_int, mask: c_int) -> c_int;
    fn ibtmo(ud: c_int, timeout: c_int) -> c_int;
    fn ibrsp(ud: c_int, status_byte: *mut c_char) -> c_int;
    fn ibtrg(ud: c_int) -> c_int;
}

/// State guarded by the driver mutex: in-flight `ibwrta` buffers by descriptor.
struct Pending {
    writes: BTreeMap<i32, Vec<u8>>,
}

static DRIVER: Mutex<Pending> = const_mutex(Pending {
    writes: BTreeMap::new(),
});

/// Copies the driver globals. Must run right after the call, under [`DRIVER`].
fn capture() -> StatusSnapshot {
    let errno = io::Error::last_os_error().raw_os_error();
    // SAFETY: plain loads of C globals; all writers are serialized by DRIVER.
    let (sta, err, cnt) = unsafe {
        (
            ptr::read_volatile(ptr::addr_of!(ibsta)),
            ptr::read_volatile(ptr::addr_of!(iberr)),
            ptr::read_volatile(ptr::addr_of!(ibcntl)),
        )
    };
    let status = Status::from_raw(sta);
    if !status.errored() {
        return StatusSnapshot::ok(status, usize::try_from(cnt).unwrap_or(0));
    }
    let os_error = if is_os_error(err) {
        i32::try_from(cnt).ok().filter(|e| *e != 0).or(errno)
    } else {
        None
    };
    StatusSnapshot::failed(status, err, os_error)
}

fn len(buf: &[u8]) -> c_long {
    c_long::try_from(buf.len()).unwrap_or(c_long::MAX)
}

/// The linux-gpib library.
///
/// All instances share the library's global state; the type carries no data.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxGpib;

impl LinuxGpib {
    /// Creates a handle to the library.
    pub fn new() -> Self {
        Self
    }
}

impl Driver for LinuxGpib {
    fn find(&self, name: &str) -> (i32, StatusSnapshot) {
        let Ok(name) = CString::new(name) else {
            return (-1, StatusSnapshot::failed(Status::empty(), EARG, None));
        };
        let _guard = DRIVER.lock();
        // SAFETY: `name` is a valid NUL-terminated string for the call.
        let ud = unsafe { ibfind(name.as_ptr()) };
        (ud, capture())
    }

    fn dev(&self, board: i32, pad: i32, sad: i32, tmo: i32, eot: i32, eos: i32)
        -> (i32, StatusSnapshot) {
        let _guard = DRIVER.lock();
        // SAFETY: integer arguments only.
        let ud = unsafe { ibdev(board, pad, sad, tmo, eot, eos) };
        (ud, capture())
    }

    fn read(&self, ud: i32, buf: &mut [u8]) -> StatusSnapshot {
        let _guard = DRIVER.lock();
        // SAFETY: the driver writes at most `buf.len()` bytes into `buf`.
        unsafe { ibrd(ud, buf.as_mut_ptr().cast(), len(buf)) };
        let mut snapshot = capture();
        snapshot.count = snapshot.count.min(buf.len());
        snapshot
    }

    fn write(&self, ud: i32, data: &[u8]) -> StatusSnapshot {
        let _guard = DRIVER.lock();
        // SAFETY: `data` is valid for reads of its length during the call.
        unsafe { ibwrt(ud, data.as_ptr().cast(), len(data)) };
        capture()
    }

    fn write_async(&self, ud: i32, data: Vec<u8>) -> StatusSnapshot {
        let mut pending = DRIVER.lock();
        // SAFETY: the heap buffer is kept alive in `pending` until the
        // transfer completes or the descriptor goes offline.
        unsafe { ibwrta(ud, data.as_ptr().cast(), len(&data)) };
        let snapshot = capture();
        if !snapshot.is_error() {
            pending.writes.insert(ud, data);
        }
        snapshot
    }

    fn command(&self, ud: i32, data: &[u8]) -> StatusSnapshot {
        let _guard = DRIVER.lock();
        // SAFETY: `data` is valid for reads of its length during the call.
        unsafe { ibcmd(ud, data.as_ptr().cast(), len(data)) };
        capture()
    }

    fn remote_enable(&self, ud: i32, enable: bool) -> StatusSnapshot {
        let _guard = DRIVER.lock();
        // SAFETY: integer arguments only.
        unsafe { ibsre(ud, c_int::from(enable)) };
        capture()
    }

    fn clear(&self, ud: i32) -> StatusSnapshot {
        let _guard = DRIVER.lock();
        // SAFETY: integer arguments only.
        unsafe { ibclr(ud) };
        capture()
    }

    fn interface_clear(&self, ud: i32) {
        let _guard = DRIVER.lock();
        // SAFETY: integer arguments only.
        unsafe { SendIFC(ud) };
    }

    fn online(&self, ud: i32, online: bool) -> StatusSnapshot {
        let mut pending = DRIVER.lock();
        // SAFETY: integer arguments only.
        unsafe { ibonl(ud, c_int::from(online)) };
        let snapshot = capture();
        if !online && pending.writes.remove(&ud).is_some() {
            trace!(descriptor = ud, "dropped pending async write buffer");
        }
        snapshot
    }

    fn ask(&self, ud: i32, option: i32) -> (i32, StatusSnapshot) {
        let mut value: c_int = 0;
        let _guard = DRIVER.lock();
        // SAFETY: `value` is a valid out-pointer for the call.
        unsafe { ibask(ud, option, &mut value) };
        (value, capture())
    }

    fn config(&self, ud: i32, option: i32, value: i32) -> StatusSnapshot {
        let _guard = DRIVER.lock();
        // SAFETY: integer arguments only.
        unsafe { ibconfig(ud, option, value) };
        capture()
    }

    fn wait(&self, ud: i32, mask: Status) -> StatusSnapshot {
        let mut pending = DRIVER.lock();
        // SAFETY: integer arguments only.
        unsafe { ibwait(ud, mask.raw()) };
        let snapshot = capture();
        if snapshot.status.completed() && !snapshot.is_error() {
            pending.writes.remove(&ud);
        }
        snapshot
    }

    fn timeout(&self, ud: i32, timeout: Timeout) -> StatusSnapshot {
        let _guard = DRIVER.lock();
        // SAFETY: integer arguments only.
        unsafe { ibtmo(ud, timeout.code()) };
        capture()
    }

    fn serial_poll(&self, ud: i32) -> (u8, StatusSnapshot) {
        let mut byte: c_char = 0;
        let _guard = DRIVER.lock();
        // SAFETY: `byte` is a valid out-pointer for the call.
        unsafe { ibrsp(ud, &mut byte) };
        (byte as u8, capture())
    }

    fn trigger(&self, ud: i32) -> StatusSnapshot {
        let _guard = DRIVER.lock();
        // SAFETY: integer arguments only.
        unsafe { ibtrg(ud) };
        capture()
    }
}
