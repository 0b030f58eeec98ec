//! AVR serial programmer and bootloader command engine.
//!
//! Two firmware personalities share one line protocol:
//!
//! - [`Programmer`] drives a second AVR through its serial programming
//!   interface (flash, fuses, lock bits, signature).
//! - [`Bootloader`] validates the resident application by its CRC trailer
//!   and rewrites its own program memory page by page.
//!
//! All hardware is reached through the traits below, so the engines run on
//! the device itself, on a Linux host (`linux` feature) or against the
//! in-memory doubles in [`mock`].

#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::serial::{Read, Write};

use thiserror::Error;

pub mod bootloader;
#[cfg(any(test, feature = "std"))]
pub mod client;
pub mod codec;
pub mod console;
pub mod isp;
pub mod programmer;
pub mod protocol;
pub mod reader;
pub mod rx;
pub mod selfflash;
pub mod session;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub use bootloader::Bootloader;
pub use codec::HexError;
pub use programmer::Programmer;
pub use selfflash::{BootConfig, ImageStatus};
pub use session::{Session, State};

/// Character transport to the host
pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    /// Flush and release the port ahead of a mode transfer
    fn close(&mut self) -> Result<(), E>;
}

/// Serial programming interface of the target device
pub trait IspPort<E>: Transfer<u8, Error = E> {
    /// Drive the clock and data lines
    fn enable(&mut self) -> Result<(), E>;
    /// Release the clock and data lines
    fn disable(&mut self) -> Result<(), E>;
    /// Set the level of the target reset line (low holds the target in
    /// programming mode)
    fn set_reset(&mut self, level: bool) -> Result<(), E>;
}

/// Self-programming access to our own program memory
pub trait ProgramMemory<E> {
    fn read_byte(&mut self, address: u16) -> Result<u8, E>;
    /// Whether an erase, write or EEPROM operation is still in progress
    fn is_busy(&mut self) -> Result<bool, E>;
    fn erase_page(&mut self, address: u16) -> Result<(), E>;
    /// Load one word into the temporary page buffer
    fn fill_word(&mut self, address: u16, word: u16) -> Result<(), E>;
    fn write_page(&mut self, address: u16) -> Result<(), E>;
    /// Re-enable reads from the section that was just programmed
    fn enable_rww(&mut self) -> Result<(), E>;
    /// Run `f` with interrupts (including the SPM ready interrupt) masked
    fn without_interrupts<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R
    where
        Self: Sized;
}

/// Where control goes when the current personality gives it up
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ModeTransfer {
    /// Reset and run the application
    Application,
    /// Latch the stay-in-bootloader flag and jump to the bootloader
    Bootloader,
}

/// Board level services outside the command engine
pub trait Platform {
    /// Hand over control. Hardware implementations arm the watchdog or jump
    /// and never return; host implementations return and let the caller
    /// stop.
    fn request_mode_transfer(&mut self, target: ModeTransfer);

    /// Whether the application asked to stay in the bootloader, or the
    /// stay jumper is fitted
    fn stay_in_bootloader(&mut self) -> bool;
}

/// Recoverable command failures, reported to the host as a status line
#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum Fault {
    #[error("parameter error")]
    Parameter,
    #[error("address error")]
    Address,
    #[error("data error: {0}")]
    Data(HexError),
    #[error("unknown command")]
    UnknownCommand,
    #[error("not connected")]
    NotConnected,
    #[error("too long")]
    TooLong,
    /// Self-programming refused the request
    #[error("flash error")]
    Rejected,
}

impl Fault {
    pub(crate) fn raise<T, E>(self) -> Result<T, Error<E>> {
        Err(Error::Fault(self))
    }
}

#[derive(Clone, PartialEq, Debug, Error)]
pub enum Error<SerialError> {
    #[error("peripheral error: {0:?}")]
    Serial(SerialError),
    #[error("no input before the response timeout")]
    ResponseTimeout,
    #[error("non-volatile memory stayed busy")]
    Busy,
    #[error("output formatting failed")]
    Format,
    #[error("{0}")]
    Fault(Fault),
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Give up waiting for input after this many milliseconds (0 waits forever)
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "0"))]
    pub response_timeout_ms: u32,

    /// Period to sleep between empty receive polls
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Settle time between target reset transitions while connecting
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "20"))]
    pub reset_delay_ms: u32,

    /// Polls allowed while waiting for a self-programming operation
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100000"))]
    pub busy_poll_limit: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            response_timeout_ms: 0,
            poll_delay_ms: 1,
            reset_delay_ms: 20,
            busy_poll_limit: 100_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "structopt")]
    #[test]
    fn command_line_defaults_match_firmware_defaults() {
        use structopt::StructOpt;
        assert_eq!(Options::from_iter(vec!["avrprog"]), Options::default());
    }

    #[test]
    fn faults_render_as_status_lines() {
        assert_eq!(
            format!("{}", Fault::Data(HexError::Checksum)),
            "data error: checksum mismatch"
        );
        let e: Error<()> = Error::Fault(Fault::NotConnected);
        assert_eq!(format!("{}", e), "not connected");
    }
}
