//! IEEE-488 bus command bytes.
//!
//! Command bytes are sent with ATN asserted and address, configure or
//! clear devices on the bus. They are handed to the driver through
//! [`Session::send_command`](crate::Session::send_command).
//!
//! # Example
//!
//! ```
//! use gpib_session::command::{CommandSequence, SDC, UNL, UNT};
//!
//! // Untalk, unlisten, address device 5 to listen and send it a selected device clear.
//! let seq = CommandSequence::new()
//!     .push(UNT)
//!     .push(UNL)
//!     .listen(5)?
//!     .push(SDC);
//!
//! assert_eq!(seq.as_bytes(), &[0x5F, 0x3F, 0x25, 0x04]);
//! # Ok::<(), gpib_session::GpibError>(())
//! ```

use crate::config::MAX_ADDRESS;
use crate::error::{GpibError, Result};

/// Go to local.
pub const GTL: u8 = 0x01;
/// Selected device clear.
pub const SDC: u8 = 0x04;
/// Parallel poll configure.
pub const PPC: u8 = 0x05;
/// Group execute trigger.
pub const GET: u8 = 0x08;
/// Take control.
pub const TCT: u8 = 0x09;
/// Local lockout.
pub const LLO: u8 = 0x11;
/// Device clear.
pub const DCL: u8 = 0x14;
/// Parallel poll unconfigure.
pub const PPU: u8 = 0x15;
/// Serial poll enable.
pub const SPE: u8 = 0x18;
/// Serial poll disable.
pub const SPD: u8 = 0x19;
/// Unlisten.
pub const UNL: u8 = 0x3F;
/// Untalk.
pub const UNT: u8 = 0x5F;

const LISTEN_BASE: u8 = 0x20;
const TALK_BASE: u8 = 0x40;
const SECONDARY_BASE: u8 = 0x60;

fn check_address(parameter: &str, address: u8) -> Result<u8> {
    if address > MAX_ADDRESS {
        return Err(GpibError::invalid_parameter(parameter, "must be 0-30"));
    }
    Ok(address)
}

/// My listen address (MLA) for a primary address.
///
/// # Errors
///
/// Returns an error if `pad` > 30.
pub fn listen_address(pad: u8) -> Result<u8> {
    Ok(LISTEN_BASE + check_address("pad", pad)?)
}

/// My talk address (MTA) for a primary address.
///
/// # Errors
///
/// Returns an error if `pad` > 30.
pub fn talk_address(pad: u8) -> Result<u8> {
    Ok(TALK_BASE + check_address("pad", pad)?)
}

/// My secondary address (MSA) for a secondary address.
///
/// # Errors
///
/// Returns an error if `sad` > 30.
pub fn secondary_address(sad: u8) -> Result<u8> {
    Ok(SECONDARY_BASE + check_address("sad", sad)?)
}

/// A sequence of command bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSequence {
    bytes: Vec<u8>,
}

impl CommandSequence {
    /// Creates an empty sequence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a raw command byte.
    pub fn push(mut self, byte: u8) -> Self {
        self.bytes.push(byte);
        self
    }

    /// Addresses a device to listen.
    ///
    /// # Errors
    ///
    /// Returns an error if `pad` > 30.
    pub fn listen(self, pad: u8) -> Result<Self> {
        Ok(self.push(listen_address(pad)?))
    }

    /// Addresses a device to talk.
    ///
    /// # Errors
    ///
    /// Returns an error if `pad` > 30.
    pub fn talk(self, pad: u8) -> Result<Self> {
        Ok(self.push(talk_address(pad)?))
    }

    /// Appends a secondary address to the preceding talk/listen address.
    ///
    /// # Errors
    ///
    /// Returns an error if `sad` > 30.
    pub fn secondary(self, sad: u8) -> Result<Self> {
        Ok(self.push(secondary_address(sad)?))
    }

    /// Unaddresses all talkers and listeners.
    pub fn unaddress(self) -> Self {
        self.push(UNT).push(UNL)
    }

    /// Returns the command bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns the number of command bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns whether the sequence is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl AsRef<[u8]> for CommandSequence {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_ranges() {
        assert_eq!(listen_address(0).unwrap(), 0x20);
        assert_eq!(listen_address(30).unwrap(), 0x3E);
        assert_eq!(talk_address(30).unwrap(), 0x5E);
        assert_eq!(secondary_address(30).unwrap(), 0x7E);
        assert!(listen_address(31).is_err());
        assert!(talk_address(31).is_err());
        assert!(secondary_address(31).is_err());
    }

    #[test]
    fn test_trigger_sequence() {
        let seq = CommandSequence::new()
            .unaddress()
            .listen(3)
            .unwrap()
            .secondary(1)
            .unwrap()
            .push(GET);
        assert_eq!(hex::encode(seq.as_bytes()), "5f3f236108");
        assert_eq!(seq.len(), 5);
    }

    #[test]
    fn test_talk_sequence() {
        let seq = CommandSequence::new().talk(7).unwrap().push(SPE);
        assert_eq!(seq.as_ref(), &[0x47, SPE]);
        assert!(CommandSequence::new().is_empty());
    }
}
