//! Device sessions.
//!
//! A [`Gpib`] bundles a [`Driver`] with a [`DeviceLock`] table and opens
//! [`Session`]s, either by configured name ([`Gpib::find`], which also locks
//! the underlying device node) or by bus address ([`Gpib::open`]).
//!
//! Every session operation:
//!
//! 1. fails with [`GpibError::SessionClosed`] without touching the driver
//!    once the session is closed,
//! 2. issues exactly one driver call (reads may retry once after `EINTR`),
//! 3. records the call's status snapshot for [`last_status`](crate::last_status)
//!    and [`last_count`](crate::last_count),
//! 4. translates a failed snapshot into [`GpibError::DriverRejected`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use gpib_session::sim::{MemoryLocks, SimInstrument, SimulatedBus};
//! use gpib_session::{DeviceConfig, Gpib};
//!
//! let bus = Arc::new(SimulatedBus::new());
//! bus.attach(0, 7, SimInstrument::loopback());
//! let gpib = Gpib::new(bus, Arc::new(MemoryLocks::new()));
//!
//! let mut session = gpib.open(&DeviceConfig::new(0, 7))?;
//! assert_eq!(session.write(b"ping")?, 4);
//! assert_eq!(session.read_text(64)?, "ping");
//! session.close()?;
//! # Ok::<(), gpib_session::GpibError>(())
//! ```

use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::config::{ConfigOption, DeviceConfig, Timeout};
use crate::driver::Driver;
use crate::error::{GpibError, Result};
use crate::lock::{Acquire, DeviceLock, LockToken};
use crate::status::{self, Status, StatusSnapshot};
use crate::translate::{self, EDVR};

#[cfg(feature = "linux-gpib")]
use crate::linux::LinuxGpib;
#[cfg(feature = "linux-gpib")]
use crate::lock::LockDir;

/// Records `snapshot` as the thread's last status and translates it.
fn settle(operation: &'static str, ud: i32, snapshot: StatusSnapshot) -> Result<StatusSnapshot> {
    status::record(snapshot);
    trace!(
        operation,
        descriptor = ud,
        status = %snapshot.status,
        count = snapshot.count,
        error = snapshot.error,
        "driver call"
    );
    translate::check(operation, snapshot)
}

fn interrupted(snapshot: &StatusSnapshot) -> bool {
    snapshot.is_error() && snapshot.error == EDVR && snapshot.os_error == Some(libc::EINTR)
}

/// Entry point: a driver plus the lock table used for named opens.
pub struct Gpib<D: Driver, L: DeviceLock> {
    driver: Arc<D>,
    locks: Arc<L>,
}

impl<D: Driver, L: DeviceLock> Clone for Gpib<D, L> {
    fn clone(&self) -> Self {
        Self {
            driver: Arc::clone(&self.driver),
            locks: Arc::clone(&self.locks),
        }
    }
}

impl<D: Driver, L: DeviceLock> fmt::Debug for Gpib<D, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gpib").finish_non_exhaustive()
    }
}

#[cfg(feature = "linux-gpib")]
impl Gpib<LinuxGpib, LockDir> {
    /// Uses the linux-gpib library and lock files in `$GPIB_LOCK_DIR`
    /// (default `/var/lock`).
    pub fn linux() -> Self {
        Self::new(Arc::new(LinuxGpib::new()), Arc::new(LockDir::from_env()))
    }
}

impl<D: Driver, L: DeviceLock> Gpib<D, L> {
    /// Creates an entry point over `driver` and `locks`.
    pub fn new(driver: Arc<D>, locks: Arc<L>) -> Self {
        Self { driver, locks }
    }

    /// Returns the driver.
    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    /// Returns the lock table.
    pub fn locks(&self) -> &Arc<L> {
        &self.locks
    }

    fn session(&self, descriptor: i32, state: SessionState) -> Session<D, L> {
        Session {
            driver: Arc::clone(&self.driver),
            locks: Arc::clone(&self.locks),
            descriptor,
            state,
        }
    }

    /// Opens a board or device by its configured name and locks its device node.
    ///
    /// If the lock cannot be taken the descriptor is taken offline again
    /// before the error is returned.
    ///
    /// # Errors
    ///
    /// - `DriverRejected` if the name is unknown or the board index query fails
    /// - `LockHeld` if another live process holds the lock
    /// - `LockFailed` if the lock could not be examined or created
    pub fn find(&self, name: &str) -> Result<Session<D, L>> {
        let (ud, snapshot) = self.driver.find(name);
        status::record(snapshot);
        if ud < 0 || snapshot.is_error() {
            debug!(name, error = snapshot.error, "ibfind failed");
            return Err(translate::rejection("ibfind", &snapshot));
        }

        let mut session = self.session(ud, SessionState::Open);
        let token = match session.lock_token() {
            Ok(token) => token,
            Err(e) => {
                session.abandon();
                return Err(e);
            }
        };

        match self.locks.acquire(token.path()) {
            Ok(Acquire::Acquired) => {
                session.state = SessionState::Locked;
                debug!(name, descriptor = ud, lock = %token, "opened and locked");
                Ok(session)
            }
            Ok(Acquire::HeldBy(owner)) => {
                debug!(name, lock = %token, owner, "device is locked by another process");
                session.abandon();
                Err(GpibError::LockHeld { owner })
            }
            Err(e) => {
                warn!(name, lock = %token, error = %e, "cannot lock device");
                session.abandon();
                Err(GpibError::LockFailed(e))
            }
        }
    }

    /// Opens the device described by `config`. No lock is taken.
    ///
    /// # Errors
    ///
    /// - `InvalidParameter` if an address is out of range
    /// - `DriverRejected` if the driver refuses the descriptor
    pub fn open(&self, config: &DeviceConfig) -> Result<Session<D, L>> {
        config.validate()?;
        let (ud, snapshot) = self.driver.dev(
            config.board,
            i32::from(config.primary_address),
            config.sad_word(),
            config.timeout.code(),
            i32::from(config.eot),
            config.eos_word(),
        );
        status::record(snapshot);
        if ud < 0 || snapshot.is_error() {
            return Err(translate::rejection("ibdev", &snapshot));
        }
        debug!(
            board = config.board,
            pad = config.primary_address,
            descriptor = ud,
            "opened device"
        );
        Ok(self.session(ud, SessionState::Open))
    }
}

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Holding a descriptor, no device lock.
    Open,
    /// Holding a descriptor and the device lock.
    Locked,
    /// Descriptor released; every operation fails.
    Closed,
}

/// An open driver descriptor.
///
/// Dropping an unclosed session closes it. Unlike [`Session::close`], a
/// drop releases the device lock only if this session acquired it.
pub struct Session<D: Driver, L: DeviceLock> {
    driver: Arc<D>,
    locks: Arc<L>,
    descriptor: i32,
    state: SessionState,
}

impl<D: Driver, L: DeviceLock> fmt::Debug for Session<D, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("descriptor", &self.descriptor)
            .field("state", &self.state)
            .finish()
    }
}

impl<D: Driver, L: DeviceLock> Session<D, L> {
    /// Returns the driver descriptor, also after close.
    pub fn descriptor(&self) -> i32 {
        self.descriptor
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns whether the session holds its device lock.
    pub fn is_locked(&self) -> bool {
        self.state == SessionState::Locked
    }

    /// Returns whether the session has been closed.
    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    fn live(&self) -> Result<i32> {
        if self.is_closed() {
            Err(GpibError::SessionClosed {
                descriptor: self.descriptor,
            })
        } else {
            Ok(self.descriptor)
        }
    }

    /// Takes the descriptor offline without touching the lock table.
    fn abandon(&mut self) {
        let snapshot = self.driver.online(self.descriptor, false);
        if let Err(e) = settle("ibonl", self.descriptor, snapshot) {
            warn!(descriptor = self.descriptor, error = %e, "cannot take descriptor offline");
        }
        self.state = SessionState::Closed;
    }

    /// Derives the lock token from the board index the driver reports.
    ///
    /// # Errors
    ///
    /// Returns `DriverRejected` if the board index query fails.
    pub fn lock_token(&self) -> Result<LockToken> {
        let minor = self.query_option(ConfigOption::BoardIndex)?;
        Ok(LockToken::for_minor(minor))
    }

    /// Reads at most `max_len` bytes.
    ///
    /// A read interrupted by a signal is retried once; the retry's outcome
    /// is final.
    ///
    /// # Errors
    ///
    /// - `AllocationFailed` if the receive buffer cannot be allocated
    /// - `DriverRejected` on a driver failure (`ibrd`)
    pub fn read(&self, max_len: usize) -> Result<Vec<u8>> {
        let ud = self.live()?;
        let capacity = max_len
            .checked_add(1)
            .ok_or(GpibError::AllocationFailed { requested: max_len })?;
        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity)
            .map_err(|_| GpibError::AllocationFailed { requested: capacity })?;
        buf.resize(capacity, 0);

        let mut snapshot = self.driver.read(ud, &mut buf[..max_len]);
        if interrupted(&snapshot) {
            status::record(snapshot);
            debug!(descriptor = ud, "read interrupted by a signal, retrying");
            snapshot = self.driver.read(ud, &mut buf[..max_len]);
        }
        let snapshot = settle("ibrd", ud, snapshot)?;

        let count = snapshot.count.min(max_len);
        buf.truncate(count);
        Ok(buf)
    }

    /// Reads at most `max_len` bytes as text, up to the first NUL byte.
    ///
    /// Invalid UTF-8 is replaced.
    ///
    /// # Errors
    ///
    /// Same as [`read`](Session::read).
    pub fn read_text(&self, max_len: usize) -> Result<String> {
        let bytes = self.read(max_len)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    /// Writes `data` and returns the number of bytes transferred.
    ///
    /// # Errors
    ///
    /// Returns `DriverRejected` on a driver failure (`ibwrt`).
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let ud = self.live()?;
        let snapshot = settle("ibwrt", ud, self.driver.write(ud, data))?;
        Ok(snapshot.count)
    }

    /// Starts an asynchronous write of `data`.
    ///
    /// Completion is observed with [`wait`](Session::wait) on
    /// [`Status::CMPL`].
    ///
    /// # Errors
    ///
    /// Returns `DriverRejected` on a driver failure (`ibwrta`).
    pub fn write_async(&self, data: &[u8]) -> Result<Status> {
        let ud = self.live()?;
        let snapshot = settle("ibwrta", ud, self.driver.write_async(ud, data.to_vec()))?;
        Ok(snapshot.status)
    }

    /// Sends command bytes with ATN asserted.
    ///
    /// # Errors
    ///
    /// Returns `DriverRejected` on a driver failure (`ibcmd`).
    pub fn send_command(&self, command: impl AsRef<[u8]>) -> Result<Status> {
        let ud = self.live()?;
        let snapshot = settle("ibcmd", ud, self.driver.command(ud, command.as_ref()))?;
        Ok(snapshot.status)
    }

    /// Asserts or releases the REN line.
    ///
    /// # Errors
    ///
    /// Returns `DriverRejected` on a driver failure (`ibsre`).
    pub fn remote_enable(&self, enable: bool) -> Result<Status> {
        let ud = self.live()?;
        let snapshot = settle("ibsre", ud, self.driver.remote_enable(ud, enable))?;
        Ok(snapshot.status)
    }

    /// Sends a selected device clear.
    ///
    /// # Errors
    ///
    /// Returns `DriverRejected` on a driver failure (`ibclr`).
    pub fn clear(&self) -> Result<()> {
        let ud = self.live()?;
        settle("ibclr", ud, self.driver.clear(ud))?;
        Ok(())
    }

    /// Pulses the interface clear line. Never fails; a closed session
    /// does nothing.
    pub fn interface_clear(&self) {
        match self.live() {
            Ok(ud) => {
                trace!(descriptor = ud, "SendIFC");
                self.driver.interface_clear(ud);
            }
            Err(_) => debug!(descriptor = self.descriptor, "interface clear on closed session ignored"),
        }
    }

    /// Waits until any of the `mask` bits is set and returns the status word.
    ///
    /// # Errors
    ///
    /// Returns `DriverRejected` on a driver failure (`ibwait`).
    pub fn wait(&self, mask: Status) -> Result<Status> {
        let ud = self.live()?;
        let snapshot = settle("ibwait", ud, self.driver.wait(ud, mask))?;
        Ok(snapshot.status)
    }

    /// Sets the I/O timeout class.
    ///
    /// # Errors
    ///
    /// Returns `DriverRejected` on a driver failure (`ibtmo`).
    pub fn set_timeout(&self, timeout: Timeout) -> Result<()> {
        let ud = self.live()?;
        settle("ibtmo", ud, self.driver.timeout(ud, timeout))?;
        Ok(())
    }

    /// Returns the I/O timeout class currently configured in the driver.
    ///
    /// # Errors
    ///
    /// Returns `DriverRejected` on a driver failure, `InvalidParameter` if
    /// the driver reports an unknown class.
    pub fn timeout(&self) -> Result<Timeout> {
        Timeout::from_code(self.query_option(ConfigOption::Timeout)?)
    }

    /// Serial polls the device and returns its status byte.
    ///
    /// # Errors
    ///
    /// Returns `DriverRejected` on a driver failure (`ibrsp`).
    pub fn serial_poll(&self) -> Result<u8> {
        let ud = self.live()?;
        let (byte, snapshot) = self.driver.serial_poll(ud);
        settle("ibrsp", ud, snapshot)?;
        Ok(byte)
    }

    /// Sends a group execute trigger.
    ///
    /// # Errors
    ///
    /// Returns `DriverRejected` on a driver failure (`ibtrg`).
    pub fn trigger(&self) -> Result<()> {
        let ud = self.live()?;
        settle("ibtrg", ud, self.driver.trigger(ud))?;
        Ok(())
    }

    /// Reads a configuration option.
    ///
    /// # Errors
    ///
    /// Returns `DriverRejected` on a driver failure (`ibask`).
    pub fn query_option(&self, option: ConfigOption) -> Result<i32> {
        let ud = self.live()?;
        let (value, snapshot) = self.driver.ask(ud, option.code());
        settle("ibask", ud, snapshot)?;
        Ok(value)
    }

    /// Sets a configuration option.
    ///
    /// # Errors
    ///
    /// Returns `DriverRejected` on a driver failure (`ibconfig`).
    pub fn set_option(&self, option: ConfigOption, value: i32) -> Result<()> {
        let ud = self.live()?;
        settle("ibconfig", ud, self.driver.config(ud, option.code(), value))?;
        Ok(())
    }

    /// Releases the device lock and takes the descriptor offline.
    ///
    /// The lock is released first, under the current process id, whether
    /// or not this session acquired it; failing to release only logs. The
    /// session is closed afterwards even if the driver refuses to go
    /// offline.
    ///
    /// # Errors
    ///
    /// - `SessionClosed` if already closed
    /// - `DriverRejected` if taking the descriptor offline fails (`ibonl`)
    pub fn close(&mut self) -> Result<()> {
        self.close_inner(true)
    }

    fn close_inner(&mut self, release_always: bool) -> Result<()> {
        let ud = self.live()?;
        if release_always || self.is_locked() {
            self.release_lock();
        }

        let snapshot = self.driver.online(ud, false);
        self.state = SessionState::Closed;
        settle("ibonl", ud, snapshot)?;
        debug!(descriptor = ud, "closed");
        Ok(())
    }

    fn release_lock(&self) {
        let token = match self.lock_token() {
            Ok(token) => token,
            Err(e) => {
                warn!(descriptor = self.descriptor, error = %e, "cannot derive lock token, lock not released");
                return;
            }
        };
        if let Err(e) = self.locks.release(token.path(), std::process::id()) {
            if self.is_locked() {
                warn!(lock = %token, error = %e, "cannot release device lock");
            } else {
                debug!(lock = %token, error = %e, "no lock of ours to release");
            }
        }
    }
}

impl<D: Driver, L: DeviceLock> Drop for Session<D, L> {
    fn drop(&mut self) {
        if !self.is_closed() {
            if let Err(e) = self.close_inner(false) {
                warn!(descriptor = self.descriptor, error = %e, "close on drop failed");
            }
        }
    }
}
