//! Advisory locks on GPIB device nodes.
//!
//! A session opened by name locks the device node backing its descriptor
//! (`/dev/gpib<minor>`) so that two processes cannot drive the same board
//! at once. The lock lives outside the process: [`LockDir`] keeps
//! lockdev-style `LCK..<device>` files holding the owner's pid, which
//! interoperates with other tools using the same convention.
//!
//! # Example
//!
//! ```no_run
//! use gpib_session::{Acquire, DeviceLock, LockDir, LockToken};
//!
//! let locks = LockDir::from_env();
//! let token = LockToken::for_minor(0);
//! match locks.acquire(token.path())? {
//!     Acquire::Acquired => println!("locked {}", token),
//!     Acquire::HeldBy(pid) => println!("{} is held by {}", token, pid),
//! }
//! locks.release(token.path(), std::process::id())?;
//! # Ok::<(), std::io::Error>(())
//! ```

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::warn;

/// Default directory for lock files.
pub const DEFAULT_LOCK_DIR: &str = "/var/lock";

/// Environment variable overriding the lock directory.
pub const LOCK_DIR_ENV: &str = "GPIB_LOCK_DIR";

/// Age below which a lock file without a readable pid is left alone.
pub const UNREADABLE_GRACE: Duration = Duration::from_secs(5);

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Device-node path identifying the lock for a descriptor.
///
/// Derived from the board minor number reported by the driver; never cached
/// by sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(PathBuf);

impl LockToken {
    /// Builds the token for board minor number `minor`.
    ///
    /// # Example
    ///
    /// ```
    /// use gpib_session::LockToken;
    ///
    /// assert_eq!(LockToken::for_minor(2).path().to_str(), Some("/dev/gpib2"));
    /// ```
    pub fn for_minor(minor: i32) -> Self {
        Self(PathBuf::from(format!("/dev/gpib{}", minor)))
    }

    /// Returns the device-node path.
    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Outcome of a lock attempt that did not fail at the OS level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// The lock is now held by this process.
    Acquired,
    /// Another live process holds the lock.
    HeldBy(u32),
}

/// An advisory, process-scoped lock table keyed by device path.
pub trait DeviceLock: Send + Sync {
    /// Tries once to lock `device` for the current process.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the lock cannot be examined or created.
    fn acquire(&self, device: &Path) -> io::Result<Acquire>;

    /// Releases the lock on `device` held by `pid`.
    ///
    /// Releasing a lock that does not exist succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is held by another process or cannot
    /// be removed.
    fn release(&self, device: &Path, pid: u32) -> io::Result<()>;
}

/// Lock files in a lock directory (`/var/lock` by default).
///
/// A lock is taken the lockdev way: the pid is written to a private
/// temporary file which is then hard-linked to `LCK..<device>`, so the
/// lock file never exists without its owner. Stale locks (dead owner, or
/// no readable pid for longer than [`UNREADABLE_GRACE`]) are removed only
/// while holding an exclusive `flock` on a per-device guard file, after
/// re-checking the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockDir {
    dir: PathBuf,
}

impl LockDir {
    /// Uses `dir` for lock files.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Uses `$GPIB_LOCK_DIR`, falling back to `/var/lock`.
    pub fn from_env() -> Self {
        match std::env::var_os(LOCK_DIR_ENV) {
            Some(dir) if !dir.is_empty() => Self::new(dir),
            _ => Self::default(),
        }
    }

    /// Returns the lock directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the lock file used for `device`, e.g. `LCK..gpib0`.
    pub fn lock_file(&self, device: &Path) -> PathBuf {
        self.dir.join(lock_name(device))
    }

    /// Writes `pid` to a fresh temporary file next to the lock files.
    fn temp_file(&self, name: &str, pid: u32) -> io::Result<PathBuf> {
        let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.join(format!(".{}.{}.{}", name, pid, seq));
        let written = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .and_then(|mut file| writeln!(file, "{:>10}", pid));
        match written {
            Ok(()) => Ok(path),
            Err(e) => {
                if let Err(cleanup) = remove_if_present(&path) {
                    warn!(file = %path.display(), error = %cleanup, "cannot remove temporary lock file");
                }
                Err(e)
            }
        }
    }

    fn link_or_reclaim(
        &self,
        name: &str,
        temp: &Path,
        path: &Path,
        me: u32,
    ) -> io::Result<Acquire> {
        for _ in 0..3 {
            match fs::hard_link(temp, path) {
                Ok(()) => return Ok(Acquire::Acquired),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }
            match inspect(path)? {
                Holder::Free => {}
                Holder::Owner(owner) if owner == me => return Ok(Acquire::Acquired),
                Holder::Owner(owner) => return Ok(Acquire::HeldBy(owner)),
                Holder::Unreadable => {
                    return Err(io::Error::new(
                        io::ErrorKind::WouldBlock,
                        format!("lock file {} has no readable owner yet", path.display()),
                    ))
                }
                Holder::Stale => self.reclaim(name, path)?,
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("lock file {} reappeared while reclaiming it", path.display()),
        ))
    }

    /// Removes a stale lock file, re-checking it under the guard lock.
    fn reclaim(&self, name: &str, path: &Path) -> io::Result<()> {
        let _guard = lock_exclusive(&self.dir.join(format!(".{}.reclaim", name)))?;
        if inspect(path)? == Holder::Stale {
            warn!(lock = %path.display(), "removing stale lock file");
            remove_if_present(path)?;
        }
        Ok(())
    }
}

fn lock_name(device: &Path) -> String {
    let name = device
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| device.to_string_lossy().replace('/', "_"));
    format!("LCK..{}", name)
}

impl Default for LockDir {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_DIR)
    }
}

fn read_owner(path: &Path) -> io::Result<Option<u32>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content.trim().parse().ok()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only checks for the existence of the process.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Holder {
    Free,
    Owner(u32),
    Stale,
    Unreadable,
}

fn inspect(path: &Path) -> io::Result<Holder> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Holder::Free),
        Err(e) => return Err(e),
    };
    match content.trim().parse::<u32>() {
        Ok(pid) if process_alive(pid) => Ok(Holder::Owner(pid)),
        Ok(_) => Ok(Holder::Stale),
        Err(_) => {
            let modified = match fs::metadata(path).and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Holder::Free),
                Err(e) => return Err(e),
            };
            let old = modified
                .elapsed()
                .map_or(false, |age| age >= UNREADABLE_GRACE);
            Ok(if old { Holder::Stale } else { Holder::Unreadable })
        }
    }
}

/// Opens `path` and takes an exclusive `flock` on it, released on drop.
fn lock_exclusive(path: &Path) -> io::Result<File> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    loop {
        // SAFETY: the descriptor is owned by `file` and open for the call.
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } == 0 {
            return Ok(file);
        }
        let e = io::Error::last_os_error();
        if e.kind() != io::ErrorKind::Interrupted {
            return Err(e);
        }
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl DeviceLock for LockDir {
    fn acquire(&self, device: &Path) -> io::Result<Acquire> {
        let name = lock_name(device);
        let path = self.dir.join(&name);
        let me = std::process::id();

        let temp = self.temp_file(&name, me)?;
        let outcome = self.link_or_reclaim(&name, &temp, &path, me);
        if let Err(e) = remove_if_present(&temp) {
            warn!(file = %temp.display(), error = %e, "cannot remove temporary lock file");
        }
        outcome
    }

    fn release(&self, device: &Path, pid: u32) -> io::Result<()> {
        let path = self.lock_file(device);
        match read_owner(&path)? {
            Some(owner) if pid != 0 && owner != pid => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is locked by process {}", device.display(), owner),
            )),
            _ => remove_if_present(&path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> LockToken {
        LockToken::for_minor(0)
    }

    #[test]
    fn test_lock_file_name() {
        let locks = LockDir::new("/tmp/locks");
        assert_eq!(
            locks.lock_file(token().path()),
            PathBuf::from("/tmp/locks/LCK..gpib0")
        );
    }

    #[test]
    fn test_acquire_writes_pid() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockDir::new(dir.path());

        assert_eq!(locks.acquire(token().path()).unwrap(), Acquire::Acquired);
        let content = fs::read_to_string(locks.lock_file(token().path())).unwrap();
        assert_eq!(content, format!("{:>10}\n", std::process::id()));

        // Re-acquiring our own lock succeeds.
        assert_eq!(locks.acquire(token().path()).unwrap(), Acquire::Acquired);
    }

    #[test]
    fn test_acquire_reports_live_holder() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockDir::new(dir.path());
        // pid 1 always exists.
        fs::write(locks.lock_file(token().path()), "         1\n").unwrap();

        assert_eq!(locks.acquire(token().path()).unwrap(), Acquire::HeldBy(1));
    }

    // No process can have this pid.
    const DEAD_PID: &str = "2147483647\n";

    fn leftovers(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(".LCK..") && !name.ends_with(".reclaim"))
            .collect()
    }

    fn age(path: &Path, by: Duration) {
        let file = OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(std::time::SystemTime::now() - by).unwrap();
    }

    #[test]
    fn test_acquire_reclaims_stale_lock() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockDir::new(dir.path());
        let path = locks.lock_file(token().path());
        fs::write(&path, DEAD_PID).unwrap();

        assert_eq!(locks.acquire(token().path()).unwrap(), Acquire::Acquired);
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            format!("{:>10}\n", std::process::id())
        );
        assert!(leftovers(dir.path()).is_empty());
    }

    #[test]
    fn test_acquire_leaves_fresh_empty_lock_alone() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockDir::new(dir.path());
        let path = locks.lock_file(token().path());
        fs::write(&path, "").unwrap();

        let err = locks.acquire(token().path()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert!(path.exists());
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
        assert!(leftovers(dir.path()).is_empty());
    }

    #[test]
    fn test_acquire_reclaims_old_unreadable_lock() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockDir::new(dir.path());
        let path = locks.lock_file(token().path());
        fs::write(&path, "garbage\n").unwrap();
        age(&path, UNREADABLE_GRACE * 2);

        assert_eq!(locks.acquire(token().path()).unwrap(), Acquire::Acquired);
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            format!("{:>10}\n", std::process::id())
        );
    }

    #[test]
    fn test_acquire_keeps_live_lock_intact() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockDir::new(dir.path());
        let path = locks.lock_file(token().path());
        fs::write(&path, "         1\n").unwrap();
        age(&path, UNREADABLE_GRACE * 2);

        assert_eq!(locks.acquire(token().path()).unwrap(), Acquire::HeldBy(1));
        assert_eq!(fs::read_to_string(&path).unwrap(), "         1\n");
        assert!(leftovers(dir.path()).is_empty());
    }

    #[test]
    fn test_concurrent_acquirers_reclaim_once() {
        let dir = tempfile::tempdir().unwrap();
        let locks = std::sync::Arc::new(LockDir::new(dir.path()));
        let path = locks.lock_file(token().path());
        fs::write(&path, DEAD_PID).unwrap();

        let barrier = std::sync::Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    locks.acquire(token().path()).unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Acquire::Acquired);
        }

        // Every reader sees a complete pid, never a partial write.
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            format!("{:>10}\n", std::process::id())
        );
        assert!(leftovers(dir.path()).is_empty());
    }

    #[test]
    fn test_acquire_missing_dir_is_os_error() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockDir::new(dir.path().join("missing"));
        assert!(locks.acquire(token().path()).is_err());
        assert!(!locks.lock_file(token().path()).exists());
    }

    #[test]
    fn test_release() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockDir::new(dir.path());
        let me = std::process::id();

        locks.acquire(token().path()).unwrap();
        locks.release(token().path(), me).unwrap();
        assert!(!locks.lock_file(token().path()).exists());

        // Double release is harmless.
        locks.release(token().path(), me).unwrap();
    }

    #[test]
    fn test_release_refuses_foreign_lock() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockDir::new(dir.path());
        fs::write(locks.lock_file(token().path()), "         1\n").unwrap();

        let err = locks.release(token().path(), std::process::id()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        assert!(locks.lock_file(token().path()).exists());
    }

    #[test]
    fn test_token_display() {
        assert_eq!(token().to_string(), "/dev/gpib0");
    }
}
