//! Message-based helpers on top of a [`Session`].
//!
//! [`Instrument`] speaks the IEEE-488.2 common commands (`*IDN?`, `*RST`,
//! `*OPC?`, `*OPT?`) and SCPI's `SYST:ERR?` error queue. [`Controller`]
//! wraps a board session and exposes bus management: interface clear,
//! REN, raw command bytes and service requests.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use gpib_session::sim::{MemoryLocks, SimInstrument, SimulatedBus};
//! use gpib_session::{DeviceConfig, Gpib, Instrument};
//!
//! let bus = Arc::new(SimulatedBus::new());
//! bus.attach(0, 5, SimInstrument::new().with_identity("ACME,DMM-1,1234,2.1\n"));
//! let gpib = Gpib::new(bus, Arc::new(MemoryLocks::new()));
//!
//! let dmm = Instrument::new(gpib.open(&DeviceConfig::new(0, 5))?);
//! let id = dmm.identify()?;
//! assert_eq!(id.manufacturer, "ACME");
//! assert_eq!(id.firmware, "2.1");
//! # Ok::<(), gpib_session::GpibError>(())
//! ```

use std::fmt;

use tracing::{debug, warn};

use crate::command::CommandSequence;
use crate::config::{ConfigOption, Timeout};
use crate::driver::Driver;
use crate::error::{GpibError, Result};
use crate::lock::DeviceLock;
use crate::session::Session;
use crate::status::Status;

/// Default reply buffer size for text queries.
pub const DEFAULT_REPLY_LEN: usize = 1024;

/// Upper bound on error queue entries drained by [`Instrument::errors`].
pub const MAX_QUEUED_ERRORS: usize = 64;

/// Parsed `*IDN?` reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Identity {
    /// Manufacturer name.
    pub manufacturer: String,
    /// Model.
    pub model: String,
    /// Serial number, `"0"` if unavailable.
    pub serial: String,
    /// Firmware revision.
    pub firmware: String,
}

impl Identity {
    /// Parses a comma-separated identification string.
    ///
    /// Missing fields are left empty.
    ///
    /// # Example
    ///
    /// ```
    /// use gpib_session::Identity;
    ///
    /// let id = Identity::parse("KEITHLEY INSTRUMENTS INC.,MODEL 2000,0,A20\n");
    /// assert_eq!(id.model, "MODEL 2000");
    /// ```
    pub fn parse(reply: &str) -> Self {
        let mut fields = reply.trim().splitn(4, ',').map(|f| f.trim().to_string());
        Self {
            manufacturer: fields.next().unwrap_or_default(),
            model: fields.next().unwrap_or_default(),
            serial: fields.next().unwrap_or_default(),
            firmware: fields.next().unwrap_or_default(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.manufacturer, self.model, self.serial, self.firmware
        )
    }
}

/// One entry of an instrument's error queue.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceError {
    /// SCPI error number; 0 means no error.
    pub code: i32,
    /// Error message.
    pub message: String,
}

impl DeviceError {
    /// Creates an entry.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Parses a `SYST:ERR?` reply such as `-113,"Undefined header"`.
    ///
    /// # Errors
    ///
    /// Returns `GpibError::InvalidResponse` if the reply has no numeric code.
    pub fn parse(reply: &str) -> Result<Self> {
        let reply = reply.trim();
        let (code, message) = reply.split_once(',').unwrap_or((reply, ""));
        let code = code
            .trim()
            .parse()
            .map_err(|_| GpibError::invalid_response(format!("bad error queue entry: {:?}", reply)))?;
        Ok(Self::new(code, message.trim().trim_matches('"')))
    }

    /// Returns whether this entry marks an empty queue.
    pub fn is_none(&self) -> bool {
        self.code == 0
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, \"{}\"", self.code, self.message)
    }
}

/// A message-based instrument.
#[derive(Debug)]
pub struct Instrument<D: Driver, L: DeviceLock> {
    session: Session<D, L>,
}

impl<D: Driver, L: DeviceLock> Instrument<D, L> {
    /// Wraps a device session.
    pub fn new(session: Session<D, L>) -> Self {
        Self { session }
    }

    /// Returns the underlying session.
    pub fn session(&self) -> &Session<D, L> {
        &self.session
    }

    /// Returns the underlying session mutably, e.g. to close it.
    pub fn session_mut(&mut self) -> &mut Session<D, L> {
        &mut self.session
    }

    /// Unwraps the session.
    pub fn into_session(self) -> Session<D, L> {
        self.session
    }

    /// Writes `query` and reads at most `max_len` bytes of reply as text,
    /// without trailing line endings.
    ///
    /// # Errors
    ///
    /// Propagates write and read failures.
    pub fn ask(&self, query: &str, max_len: usize) -> Result<String> {
        self.session.write(query.as_bytes())?;
        let reply = self.session.read_text(max_len)?;
        Ok(reply.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Queries `*IDN?`.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures.
    pub fn identify(&self) -> Result<Identity> {
        Ok(Identity::parse(&self.ask("*IDN?", DEFAULT_REPLY_LEN)?))
    }

    /// Queries `*OPT?` and returns the installed options.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures.
    pub fn options(&self) -> Result<Vec<String>> {
        let reply = self.ask("*OPT?", DEFAULT_REPLY_LEN)?;
        Ok(reply
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty() && *o != "0")
            .map(str::to_string)
            .collect())
    }

    /// Serial polls the instrument.
    ///
    /// # Errors
    ///
    /// Propagates the driver failure.
    pub fn poll(&self) -> Result<u8> {
        self.session.serial_poll()
    }

    /// Triggers the instrument.
    ///
    /// # Errors
    ///
    /// Propagates the driver failure.
    pub fn trigger(&self) -> Result<()> {
        self.session.trigger()
    }

    /// Sends a device clear followed by `*RST`.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures.
    pub fn reset(&self) -> Result<()> {
        self.session.clear()?;
        self.session.write(b"*RST")?;
        Ok(())
    }

    /// Pops one entry from the error queue (`SYST:ERR?`).
    ///
    /// # Errors
    ///
    /// Propagates I/O failures; `InvalidResponse` on an unparsable reply.
    pub fn error(&self) -> Result<DeviceError> {
        DeviceError::parse(&self.ask("SYST:ERR?", DEFAULT_REPLY_LEN)?)
    }

    /// Drains the error queue, oldest first.
    ///
    /// # Errors
    ///
    /// Propagates I/O and parse failures.
    pub fn errors(&self) -> Result<Vec<DeviceError>> {
        let mut errors = Vec::new();
        for _ in 0..MAX_QUEUED_ERRORS {
            let entry = self.error()?;
            if entry.is_none() {
                break;
            }
            debug!(descriptor = self.session.descriptor(), code = entry.code, message = %entry.message, "instrument error");
            errors.push(entry);
        }
        Ok(errors)
    }

    /// Drains the error queue and fails if it was not empty.
    ///
    /// # Errors
    ///
    /// Returns `GpibError::DeviceErrors` with the drained entries.
    pub fn check_errors(&self) -> Result<()> {
        let errors = self.errors()?;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(GpibError::DeviceErrors { errors })
        }
    }

    /// Waits for the previous transfer, then starts an asynchronous write.
    ///
    /// # Errors
    ///
    /// Propagates the driver failure.
    pub fn send(&self, message: &[u8]) -> Result<Status> {
        self.session.wait(Status::CMPL)?;
        self.session.write_async(message)
    }

    /// Waits for the previous transfer, then reads at most `max_len` bytes.
    ///
    /// # Errors
    ///
    /// Propagates the driver failure.
    pub fn receive(&self, max_len: usize) -> Result<Vec<u8>> {
        self.session.wait(Status::CMPL)?;
        self.session.read(max_len)
    }

    /// Queries `query` and parses a comma-separated list of numbers.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures; `InvalidResponse` on a non-numeric field.
    pub fn read_values(&self, query: &str) -> Result<Vec<f64>> {
        let reply = self.ask(query, DEFAULT_REPLY_LEN)?;
        reply
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| {
                v.parse()
                    .map_err(|_| GpibError::invalid_response(format!("not a number: {:?}", v)))
            })
            .collect()
    }

    /// Blocks on `*OPC?` with the longest finite timeout, then returns the
    /// error queue.
    ///
    /// The previous timeout is restored even if the query fails.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures. A failed `*OPC?` is reported in preference
    /// to a failure restoring the timeout, which is then only logged.
    pub fn wait_to_complete(&self) -> Result<Vec<DeviceError>> {
        let previous = self.session.timeout()?;
        self.session.set_timeout(Timeout::T300s)?;
        let done = self.ask("*OPC?", DEFAULT_REPLY_LEN);
        let restored = self.session.set_timeout(previous);
        if let Err(e) = done {
            if let Err(restore) = restored {
                warn!(timeout = ?previous, error = %restore, "cannot restore timeout");
            }
            return Err(e);
        }
        restored?;
        self.errors()
    }
}

/// A board acting as controller-in-charge.
#[derive(Debug)]
pub struct Controller<D: Driver, L: DeviceLock> {
    session: Session<D, L>,
}

impl<D: Driver, L: DeviceLock> Controller<D, L> {
    /// Wraps a board session.
    pub fn new(session: Session<D, L>) -> Self {
        Self { session }
    }

    /// Returns the underlying session.
    pub fn session(&self) -> &Session<D, L> {
        &self.session
    }

    /// Unwraps the session.
    pub fn into_session(self) -> Session<D, L> {
        self.session
    }

    /// Pulses IFC, resetting the bus interface of every device.
    pub fn bus_clear(&self) {
        self.session.interface_clear();
    }

    /// Asserts or releases REN.
    ///
    /// # Errors
    ///
    /// Propagates the driver failure.
    pub fn remote_enable(&self, enable: bool) -> Result<Status> {
        self.session.remote_enable(enable)
    }

    /// Sends a command sequence with ATN asserted.
    ///
    /// # Errors
    ///
    /// Propagates the driver failure.
    pub fn send_commands(&self, commands: &CommandSequence) -> Result<Status> {
        self.session.send_command(commands)
    }

    /// Waits for a service request on the bus.
    ///
    /// # Errors
    ///
    /// Propagates the driver failure.
    pub fn wait_for_srq(&self) -> Result<Status> {
        self.session.wait(Status::SRQI | Status::TIMO)
    }

    /// Returns whether automatic serial polling is enabled.
    ///
    /// # Errors
    ///
    /// Propagates the driver failure.
    pub fn autopoll(&self) -> Result<bool> {
        Ok(self.session.query_option(ConfigOption::Autopoll)? != 0)
    }

    /// Enables or disables automatic serial polling.
    ///
    /// # Errors
    ///
    /// Propagates the driver failure.
    pub fn set_autopoll(&self, enable: bool) -> Result<()> {
        self.session
            .set_option(ConfigOption::Autopoll, i32::from(enable))
    }

    /// Returns whether the board is system controller.
    ///
    /// # Errors
    ///
    /// Propagates the driver failure.
    pub fn is_system_controller(&self) -> Result<bool> {
        Ok(self.session.query_option(ConfigOption::SystemController)? != 0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::command::{GET, UNL};
    use crate::config::DeviceConfig;
    use crate::session::Gpib;
    use crate::sim::{MemoryLocks, Op, SimInstrument, SimulatedBus};
    use crate::translate::EARG;

    type SimInstrumentSession = Instrument<SimulatedBus, MemoryLocks>;

    fn instrument(sim: SimInstrument) -> (Arc<SimulatedBus>, SimInstrumentSession) {
        let bus = Arc::new(SimulatedBus::new());
        bus.attach(0, 9, sim);
        let gpib = Gpib::new(Arc::clone(&bus), Arc::new(MemoryLocks::new()));
        let session = gpib.open(&DeviceConfig::new(0, 9)).unwrap();
        (bus, Instrument::new(session))
    }

    #[test]
    fn test_identity_parse() {
        let id = Identity::parse(" Agilent Technologies,34401A,0,11-5-2 \r\n");
        assert_eq!(id.manufacturer, "Agilent Technologies");
        assert_eq!(id.model, "34401A");
        assert_eq!(id.serial, "0");
        assert_eq!(id.firmware, "11-5-2");
        assert_eq!(id.to_string(), "Agilent Technologies,34401A,0,11-5-2");

        let partial = Identity::parse("ACME");
        assert_eq!(partial.manufacturer, "ACME");
        assert!(partial.firmware.is_empty());
    }

    #[test]
    fn test_device_error_parse() {
        let err = DeviceError::parse("-113,\"Undefined header\"\n").unwrap();
        assert_eq!(err, DeviceError::new(-113, "Undefined header"));
        assert!(DeviceError::parse("+0,\"No error\"").unwrap().is_none());
        assert!(DeviceError::parse("garbage").is_err());
    }

    #[test]
    fn test_identify() {
        let (_bus, dmm) = instrument(SimInstrument::new().with_identity("ACME,M1,42,1.0\n"));
        let id = dmm.identify().unwrap();
        assert_eq!(id.model, "M1");
        assert_eq!(id.serial, "42");
    }

    #[test]
    fn test_errors_drains_queue() {
        let (_bus, dmm) = instrument(SimInstrument::new().with_replies(
            "SYST:ERR?",
            ["-113,\"Undefined header\"", "-222,\"Data out of range\"", "0,\"No error\""],
        ));
        let errors = dmm.errors().unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[1].code, -222);
        assert!(dmm.errors().unwrap().is_empty());
    }

    #[test]
    fn test_check_errors() {
        let (_bus, dmm) = instrument(
            SimInstrument::new().with_replies("SYST:ERR?", ["-410,\"Query INTERRUPTED\"", "0,\"No error\""]),
        );
        match dmm.check_errors() {
            Err(GpibError::DeviceErrors { errors }) => assert_eq!(errors[0].code, -410),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(dmm.check_errors().is_ok());
    }

    #[test]
    fn test_reset_clears_then_sends_rst() {
        let (bus, dmm) = instrument(SimInstrument::new());
        dmm.reset().unwrap();
        let sim = bus.instrument(0, 9).unwrap();
        assert_eq!(sim.clears(), 1);
        assert_eq!(sim.received(), &[b"*RST".to_vec()]);
    }

    #[test]
    fn test_options_and_values() {
        let (_bus, dmm) = instrument(
            SimInstrument::new()
                .with_reply("*OPT?", "MEM,GPIB,0\n")
                .with_reply("READ?", "+1.5E+00, -2.25,3\n"),
        );
        assert_eq!(dmm.options().unwrap(), vec!["MEM", "GPIB"]);
        assert_eq!(dmm.read_values("READ?").unwrap(), vec![1.5, -2.25, 3.0]);
    }

    #[test]
    fn test_read_values_rejects_garbage() {
        let (_bus, dmm) = instrument(SimInstrument::new().with_reply("READ?", "1.0,abc"));
        assert!(matches!(
            dmm.read_values("READ?"),
            Err(GpibError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn test_send_and_receive() {
        let (bus, dmm) = instrument(SimInstrument::loopback());
        dmm.send(b"MEAS?").unwrap();
        assert_eq!(dmm.receive(16).unwrap(), b"MEAS?");
        assert_eq!(bus.count(Op::Wait), 2);
        assert_eq!(bus.count(Op::WriteAsync), 1);
    }

    #[test]
    fn test_wait_to_complete_restores_timeout() {
        let (_bus, dmm) = instrument(
            SimInstrument::new()
                .with_reply("*OPC?", "1")
                .with_reply("SYST:ERR?", "0,\"No error\""),
        );
        dmm.session().set_timeout(Timeout::T3s).unwrap();

        assert!(dmm.wait_to_complete().unwrap().is_empty());
        assert_eq!(dmm.session().timeout().unwrap(), Timeout::T3s);
    }

    #[test]
    fn test_wait_to_complete_restores_timeout_on_failure() {
        let (_bus, dmm) = instrument(SimInstrument::new());
        dmm.session().set_timeout(Timeout::T1s).unwrap();

        assert!(dmm.wait_to_complete().unwrap_err().is_timeout());
        assert_eq!(dmm.session().timeout().unwrap(), Timeout::T1s);
    }

    #[test]
    fn test_wait_to_complete_reports_query_error_over_restore_error() {
        let (bus, dmm) = instrument(SimInstrument::new());
        dmm.session().set_timeout(Timeout::T1s).unwrap();
        // The long timeout is set, restoring the old one fails.
        bus.fail_after(Op::Timeout, 1, EARG);

        let err = dmm.wait_to_complete().unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().starts_with("ibrd failed: "));
    }

    #[test]
    fn test_wait_to_complete_reports_restore_error() {
        let (bus, dmm) = instrument(SimInstrument::new().with_reply("*OPC?", "1"));
        bus.fail_after(Op::Timeout, 1, EARG);

        let err = dmm.wait_to_complete().unwrap_err();
        assert_eq!(err.code(), Some(EARG));
        assert!(err.to_string().starts_with("ibtmo failed: "));
    }

    #[test]
    fn test_controller() {
        let bus = Arc::new(SimulatedBus::new());
        bus.attach(0, 4, SimInstrument::new().with_status_byte(0x40));
        let gpib = Gpib::new(Arc::clone(&bus), Arc::new(MemoryLocks::new()));
        let controller = Controller::new(gpib.find("gpib0").unwrap());

        controller.bus_clear();
        assert_eq!(bus.interface_clears(0), 1);

        controller.remote_enable(true).unwrap();
        assert!(bus.remote_enabled(0));

        let seq = CommandSequence::new().push(UNL).listen(4).unwrap().push(GET);
        controller.send_commands(&seq).unwrap();
        assert_eq!(bus.commands(0), seq.as_bytes());

        assert!(controller.wait_for_srq().unwrap().contains(Status::SRQI));
        assert!(controller.is_system_controller().unwrap());

        controller.set_autopoll(true).unwrap();
        assert!(controller.autopoll().unwrap());
    }
}
