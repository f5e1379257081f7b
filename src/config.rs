//! Device configuration: bus address, timeout class and message termination.
//!
//! [`DeviceConfig`] carries everything `ibdev` needs to bind a descriptor to
//! an instrument. The defaults match the classic wrapper: no secondary
//! address, timeout class 14 ([`Timeout::T30s`]), EOI asserted on the last
//! byte of writes, and an EOS word of `BIN | '\n'`.
//!
//! # Example
//!
//! ```
//! use gpib_session::{DeviceConfig, EosFlags, Timeout};
//!
//! let config = DeviceConfig::new(0, 3)
//!     .with_timeout(Timeout::T3s)
//!     .with_eos_flags(EosFlags::REOS | EosFlags::BIN);
//!
//! assert_eq!(config.eos_word(), 0x140A);
//! ```

use std::fmt;
use std::time::Duration;

use bitflags::bitflags;

use crate::error::{GpibError, Result};

/// Highest valid primary or secondary address.
pub const MAX_ADDRESS: u8 = 30;

/// Offset added to a secondary address in the driver's `sad` argument.
pub const SECONDARY_ADDRESS_OFFSET: i32 = 0x60;

/// I/O timeout classes understood by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(i32)]
pub enum Timeout {
    /// Never time out.
    TNever = 0,
    /// 10 microseconds.
    T10us = 1,
    /// 30 microseconds.
    T30us = 2,
    /// 100 microseconds.
    T100us = 3,
    /// 300 microseconds.
    T300us = 4,
    /// 1 millisecond.
    T1ms = 5,
    /// 3 milliseconds.
    T3ms = 6,
    /// 10 milliseconds.
    T10ms = 7,
    /// 30 milliseconds.
    T30ms = 8,
    /// 100 milliseconds.
    T100ms = 9,
    /// 300 milliseconds.
    T300ms = 10,
    /// 1 second.
    T1s = 11,
    /// 3 seconds.
    T3s = 12,
    /// 10 seconds.
    T10s = 13,
    /// 30 seconds.
    T30s = 14,
    /// 100 seconds.
    T100s = 15,
    /// 300 seconds.
    T300s = 16,
    /// 1000 seconds.
    T1000s = 17,
}

impl Timeout {
    /// All timeout classes, in increasing order.
    pub const ALL: [Timeout; 18] = [
        Timeout::TNever,
        Timeout::T10us,
        Timeout::T30us,
        Timeout::T100us,
        Timeout::T300us,
        Timeout::T1ms,
        Timeout::T3ms,
        Timeout::T10ms,
        Timeout::T30ms,
        Timeout::T100ms,
        Timeout::T300ms,
        Timeout::T1s,
        Timeout::T3s,
        Timeout::T10s,
        Timeout::T30s,
        Timeout::T100s,
        Timeout::T300s,
        Timeout::T1000s,
    ];

    /// Returns the driver code for this class.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Looks up a timeout class by driver code.
    ///
    /// # Errors
    ///
    /// Returns `GpibError::InvalidParameter` for codes outside 0-17.
    ///
    /// # Example
    ///
    /// ```
    /// use gpib_session::Timeout;
    ///
    /// assert_eq!(Timeout::from_code(14).unwrap(), Timeout::T30s);
    /// assert!(Timeout::from_code(18).is_err());
    /// ```
    pub fn from_code(code: i32) -> Result<Self> {
        usize::try_from(code)
            .ok()
            .and_then(|index| Self::ALL.get(index).copied())
            .ok_or_else(|| GpibError::invalid_parameter("timeout", format!("bad timeout value: {}", code)))
    }

    /// Returns the duration of this class, `None` for [`Timeout::TNever`].
    pub fn duration(self) -> Option<Duration> {
        let micros: u64 = match self {
            Timeout::TNever => return None,
            Timeout::T10us => 10,
            Timeout::T30us => 30,
            Timeout::T100us => 100,
            Timeout::T300us => 300,
            Timeout::T1ms => 1_000,
            Timeout::T3ms => 3_000,
            Timeout::T10ms => 10_000,
            Timeout::T30ms => 30_000,
            Timeout::T100ms => 100_000,
            Timeout::T300ms => 300_000,
            Timeout::T1s => 1_000_000,
            Timeout::T3s => 3_000_000,
            Timeout::T10s => 10_000_000,
            Timeout::T30s => 30_000_000,
            Timeout::T100s => 100_000_000,
            Timeout::T300s => 300_000_000,
            Timeout::T1000s => 1_000_000_000,
        };
        Some(Duration::from_micros(micros))
    }

    /// Returns the shortest class that is not shorter than `duration`.
    ///
    /// Durations above 1000 s map to [`Timeout::TNever`].
    ///
    /// # Example
    ///
    /// ```
    /// use gpib_session::Timeout;
    /// use std::time::Duration;
    ///
    /// assert_eq!(Timeout::at_least(Duration::from_millis(2)), Timeout::T3ms);
    /// assert_eq!(Timeout::at_least(Duration::from_secs(1)), Timeout::T1s);
    /// ```
    pub fn at_least(duration: Duration) -> Self {
        Self::ALL[1..]
            .iter()
            .copied()
            .find(|t| t.duration().is_some_and(|d| d >= duration))
            .unwrap_or(Timeout::TNever)
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Timeout::T30s
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Board and device configuration options for `ibask`/`ibconfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ConfigOption {
    PrimaryAddress,
    SecondaryAddress,
    Timeout,
    Eot,
    ParallelPollConfig,
    Readdressing,
    Autopoll,
    CicProtocol,
    SystemController,
    RemoteEnable,
    EosRead,
    EosWrite,
    EosCompare8Bit,
    EosChar,
    LocalParallelPoll,
    Timing,
    ReadAdjust,
    WriteAdjust,
    EventQueue,
    SerialPollBit,
    SendLlo,
    SerialPollTime,
    ParallelPollTime,
    EndBitIsNormal,
    Unaddress,
    HsCableLength,
    Ist,
    Rsv,
    /// Board index (minor number) backing the descriptor.
    BoardIndex,
}

impl ConfigOption {
    /// All options.
    pub const ALL: [ConfigOption; 29] = [
        ConfigOption::PrimaryAddress,
        ConfigOption::SecondaryAddress,
        ConfigOption::Timeout,
        ConfigOption::Eot,
        ConfigOption::ParallelPollConfig,
        ConfigOption::Readdressing,
        ConfigOption::Autopoll,
        ConfigOption::CicProtocol,
        ConfigOption::SystemController,
        ConfigOption::RemoteEnable,
        ConfigOption::EosRead,
        ConfigOption::EosWrite,
        ConfigOption::EosCompare8Bit,
        ConfigOption::EosChar,
        ConfigOption::LocalParallelPoll,
        ConfigOption::Timing,
        ConfigOption::ReadAdjust,
        ConfigOption::WriteAdjust,
        ConfigOption::EventQueue,
        ConfigOption::SerialPollBit,
        ConfigOption::SendLlo,
        ConfigOption::SerialPollTime,
        ConfigOption::ParallelPollTime,
        ConfigOption::EndBitIsNormal,
        ConfigOption::Unaddress,
        ConfigOption::HsCableLength,
        ConfigOption::Ist,
        ConfigOption::Rsv,
        ConfigOption::BoardIndex,
    ];

    /// Looks up an option by driver code.
    ///
    /// # Errors
    ///
    /// Returns `GpibError::InvalidParameter` for unknown codes.
    pub fn from_code(code: i32) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|o| o.code() == code)
            .ok_or_else(|| GpibError::invalid_parameter("option", format!("unknown option 0x{:x}", code)))
    }

    /// Returns the option code passed to the driver.
    pub fn code(self) -> i32 {
        match self {
            ConfigOption::PrimaryAddress => 0x1,
            ConfigOption::SecondaryAddress => 0x2,
            ConfigOption::Timeout => 0x3,
            ConfigOption::Eot => 0x4,
            ConfigOption::ParallelPollConfig => 0x5,
            ConfigOption::Readdressing => 0x6,
            ConfigOption::Autopoll => 0x7,
            ConfigOption::CicProtocol => 0x8,
            ConfigOption::SystemController => 0xa,
            ConfigOption::RemoteEnable => 0xb,
            ConfigOption::EosRead => 0xc,
            ConfigOption::EosWrite => 0xd,
            ConfigOption::EosCompare8Bit => 0xe,
            ConfigOption::EosChar => 0xf,
            ConfigOption::LocalParallelPoll => 0x10,
            ConfigOption::Timing => 0x11,
            ConfigOption::ReadAdjust => 0x13,
            ConfigOption::WriteAdjust => 0x14,
            ConfigOption::EventQueue => 0x15,
            ConfigOption::SerialPollBit => 0x16,
            ConfigOption::SendLlo => 0x17,
            ConfigOption::SerialPollTime => 0x18,
            ConfigOption::ParallelPollTime => 0x19,
            ConfigOption::EndBitIsNormal => 0x1a,
            ConfigOption::Unaddress => 0x1b,
            ConfigOption::HsCableLength => 0x1f,
            ConfigOption::Ist => 0x20,
            ConfigOption::Rsv => 0x21,
            ConfigOption::BoardIndex => 0x200,
        }
    }
}

bitflags! {
    /// End-of-string policy bits combined with the EOS character.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    #[repr(transparent)]
    pub struct EosFlags: u16 {
        /// Terminate reads on the EOS character.
        const REOS = 0x400;
        /// Assert EOI when the EOS character is written.
        const XEOS = 0x800;
        /// Compare all 8 bits of the EOS character.
        const BIN = 0x1000;
    }
}

/// Configuration for opening a device by bus address.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceConfig {
    /// Board index.
    pub board: i32,
    /// Primary address (0-30).
    pub primary_address: u8,
    /// Secondary address (0-30), if any.
    pub secondary_address: Option<u8>,
    /// I/O timeout class.
    pub timeout: Timeout,
    /// Assert EOI with the last byte of each write.
    pub eot: bool,
    /// End-of-string character.
    pub eos_char: u8,
    /// End-of-string policy.
    pub eos_flags: EosFlags,
}

impl DeviceConfig {
    /// Creates a configuration for the device at `primary_address` on `board`.
    pub fn new(board: i32, primary_address: u8) -> Self {
        Self {
            board,
            primary_address,
            secondary_address: None,
            timeout: Timeout::default(),
            eot: true,
            eos_char: b'\n',
            eos_flags: EosFlags::BIN,
        }
    }

    /// Sets the secondary address.
    pub fn with_secondary_address(mut self, sad: u8) -> Self {
        self.secondary_address = Some(sad);
        self
    }

    /// Sets the I/O timeout class (default is [`Timeout::T30s`]).
    pub fn with_timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets whether EOI is asserted with the last written byte.
    pub fn with_eot(mut self, eot: bool) -> Self {
        self.eot = eot;
        self
    }

    /// Sets the end-of-string character (default `'\n'`).
    pub fn with_eos_char(mut self, eos: u8) -> Self {
        self.eos_char = eos;
        self
    }

    /// Sets the end-of-string policy (default `BIN`).
    pub fn with_eos_flags(mut self, flags: EosFlags) -> Self {
        self.eos_flags = flags;
        self
    }

    /// Checks address ranges.
    ///
    /// # Errors
    ///
    /// Returns `GpibError::InvalidParameter` if an address is above 30 or
    /// the board index is negative.
    pub fn validate(&self) -> Result<()> {
        if self.board < 0 {
            return Err(GpibError::invalid_parameter("board", "must not be negative"));
        }
        if self.primary_address > MAX_ADDRESS {
            return Err(GpibError::invalid_parameter("pad", "must be 0-30"));
        }
        if self.secondary_address.is_some_and(|sad| sad > MAX_ADDRESS) {
            return Err(GpibError::invalid_parameter("sad", "must be 0-30"));
        }
        Ok(())
    }

    /// Secondary address as the driver expects it: 0 for none, `0x60 + sad` otherwise.
    pub fn sad_word(&self) -> i32 {
        self.secondary_address
            .map_or(0, |sad| SECONDARY_ADDRESS_OFFSET + i32::from(sad))
    }

    /// End-of-string configuration word: policy bits in the high byte, character in the low byte.
    pub fn eos_word(&self) -> i32 {
        i32::from(self.eos_flags.bits() | u16::from(self.eos_char))
    }
}
