//! In-memory doubles for the hardware collaborators.
//!
//! Used by the unit tests and by the utility's `--simulate` mode.

use std::collections::VecDeque;
use std::convert::Infallible;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::serial::{Read, Write};

use crate::selfflash::{BootConfig, Trailer};
use crate::{IspPort, ModeTransfer, ProgramMemory, SerialPort};

/// Scripted serial port
#[derive(Debug, Default)]
pub struct Serial {
    input: VecDeque<u8>,
    output: Vec<u8>,
    closed: bool,
}

impl Serial {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes for the engine to receive
    pub fn feed(&mut self, data: &[u8]) {
        self.input.extend(data.iter().copied());
        self.closed = false;
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    /// Take everything written so far
    pub fn take_output(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.output)
    }

    pub fn pending(&self) -> usize {
        self.input.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Read<u8> for Serial {
    type Error = Infallible;

    fn read(&mut self) -> nb::Result<u8, Infallible> {
        self.input.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl Write<u8> for Serial {
    type Error = Infallible;

    fn write(&mut self, word: u8) -> nb::Result<(), Infallible> {
        self.output.push(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Infallible> {
        Ok(())
    }
}

impl SerialPort<Infallible> for Serial {
    fn close(&mut self) -> Result<(), Infallible> {
        self.closed = true;
        Ok(())
    }
}

/// Delay that only counts
#[derive(Debug, Default)]
pub struct Delay {
    elapsed: u64,
}

impl Delay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed
    }
}

impl DelayMs<u32> for Delay {
    fn delay_ms(&mut self, ms: u32) {
        self.elapsed += ms as u64;
    }
}

#[derive(Debug, Default)]
pub struct Watchdog {
    feeds: u32,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feeds(&self) -> u32 {
        self.feeds
    }
}

impl embedded_hal::watchdog::Watchdog for Watchdog {
    fn feed(&mut self) {
        self.feeds = self.feeds.saturating_add(1);
    }
}

/// Records mode transfers instead of performing them
#[derive(Debug, Default)]
pub struct Platform {
    transfers: Vec<ModeTransfer>,
    stay: bool,
}

impl Platform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Act as if the stay-in-bootloader latch were set
    pub fn staying() -> Self {
        Self {
            stay: true,
            ..Self::default()
        }
    }

    pub fn transfers(&self) -> &[ModeTransfer] {
        &self.transfers
    }
}

impl crate::Platform for Platform {
    fn request_mode_transfer(&mut self, target: ModeTransfer) {
        self.transfers.push(target);
    }

    fn stay_in_bootloader(&mut self) -> bool {
        self.stay
    }
}

/// Simulated AVR answering the serial programming instruction set
#[derive(Debug, Clone)]
pub struct Target {
    flash: Vec<u8>,
    page_size: usize,
    page_buffer: Vec<u8>,
    signature: [u8; 3],
    calibration: u8,
    low: u8,
    high: u8,
    extended: u8,
    lock: u8,

    enabled: bool,
    reset: bool,
    programming: bool,
    refuse: bool,

    record: bool,
    resets: Vec<bool>,
    frames: Vec<[u8; 4]>,
    page_writes: Vec<u32>,
}

impl Target {
    pub fn new(flash_size: usize, page_size: usize, signature: [u8; 3]) -> Self {
        Self {
            flash: vec![0xFF; flash_size],
            page_size,
            page_buffer: vec![0xFF; page_size],
            signature,
            calibration: 0xa5,
            low: 0xe1,
            high: 0xd9,
            extended: 0xff,
            lock: 0xff,
            enabled: false,
            reset: true,
            programming: false,
            refuse: false,
            record: true,
            resets: Vec::new(),
            frames: Vec::new(),
            page_writes: Vec::new(),
        }
    }

    /// 8 KiB of flash in 64 byte pages
    pub fn atmega8() -> Self {
        Self::new(8 * 1024, 64, [0x1e, 0x93, 0x07])
    }

    /// Stop keeping frame, reset and page write history, for long
    /// running sessions
    pub fn quiet(mut self) -> Self {
        self.record = false;
        self
    }

    /// Never answer the programming enable frame
    pub fn refuse_enable(&mut self) {
        self.refuse = true;
    }

    /// Preload program memory, as if flashed earlier
    pub fn load(&mut self, address: usize, data: &[u8]) {
        self.flash[address..address + data.len()].copy_from_slice(data);
    }

    pub fn flash(&self) -> &[u8] {
        &self.flash
    }

    /// Levels driven onto the reset line, oldest first
    pub fn reset_history(&self) -> &[bool] {
        &self.resets
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn frames(&self) -> &[[u8; 4]] {
        &self.frames
    }

    /// Byte addresses of committed pages
    pub fn page_writes(&self) -> &[u32] {
        &self.page_writes
    }

    /// Frames that would change non-volatile state
    pub fn write_count(&self) -> usize {
        self.frames
            .iter()
            .filter(|f| matches!(f[0], 0x40 | 0x48 | 0x4C) || (f[0] == 0xAC && f[1] != 0x53))
            .count()
    }

    fn execute(&mut self, f: [u8; 4]) -> u8 {
        let word = ((f[1] as usize) << 8) | f[2] as usize;

        match (f[0], f[1]) {
            (0x20, _) => self.flash.get(word * 2).copied().unwrap_or(0xFF),
            (0x28, _) => self.flash.get(word * 2 + 1).copied().unwrap_or(0xFF),
            (0x40, _) | (0x48, _) => {
                let index = (f[2] as usize * 2 + (f[0] == 0x48) as usize) % self.page_size;
                self.page_buffer[index] = f[3];
                0
            }
            (0x4C, _) => {
                let base = (word * 2) & !(self.page_size - 1);
                if base + self.page_size <= self.flash.len() {
                    self.flash[base..base + self.page_size].copy_from_slice(&self.page_buffer);
                }
                self.page_buffer.iter_mut().for_each(|b| *b = 0xFF);
                if self.record {
                    self.page_writes.push(base as u32);
                }
                0
            }
            (0xAC, 0x80) => {
                self.flash.iter_mut().for_each(|b| *b = 0xFF);
                self.lock = 0xff;
                0
            }
            (0xAC, 0xA0) => {
                self.low = f[3];
                0
            }
            (0xAC, 0xA8) => {
                self.high = f[3];
                0
            }
            (0xAC, 0xA4) => {
                self.extended = f[3];
                0
            }
            (0xAC, 0xE0) => {
                self.lock = f[3];
                0
            }
            (0x50, 0x00) => self.low,
            (0x50, 0x08) => self.extended,
            (0x58, 0x08) => self.high,
            (0x58, 0x00) => self.lock,
            (0x38, _) => self.calibration,
            (0x30, _) => self.signature[f[2] as usize % 3],
            _ => 0,
        }
    }
}

impl Transfer<u8> for Target {
    type Error = Infallible;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Infallible> {
        for chunk in words.chunks_mut(4) {
            let mut f = [0u8; 4];
            f[..chunk.len()].copy_from_slice(chunk);
            if self.record {
                self.frames.push(f);
            }

            // Lines released or target running: nothing shifts back
            if !self.enabled || self.reset {
                chunk.iter_mut().for_each(|b| *b = 0);
                continue;
            }

            if f[0] == 0xAC && f[1] == 0x53 {
                self.programming = !self.refuse;
            }

            let value = if self.programming { self.execute(f) } else { 0 };
            let reply = if self.programming {
                [0, f[0], f[1], if f[0] == 0xAC && f[1] == 0x53 { f[2] } else { value }]
            } else {
                [0; 4]
            };
            chunk.copy_from_slice(&reply[..chunk.len()]);
        }
        Ok(words)
    }
}

impl IspPort<Infallible> for Target {
    fn enable(&mut self) -> Result<(), Infallible> {
        self.enabled = true;
        Ok(())
    }

    fn disable(&mut self) -> Result<(), Infallible> {
        self.enabled = false;
        self.programming = false;
        Ok(())
    }

    fn set_reset(&mut self, level: bool) -> Result<(), Infallible> {
        if self.record {
            self.resets.push(level);
        }
        self.reset = level;
        if level {
            self.programming = false;
        }
        Ok(())
    }
}

/// Operations seen by a [`Memory`], in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryOp {
    Erase { address: u16, interrupts: bool },
    Fill { address: u16, word: u16 },
    Write { address: u16, interrupts: bool },
    EnableRww,
}

/// Simulated self-programmable flash
#[derive(Debug, Clone)]
pub struct Memory {
    flash: Vec<u8>,
    page_size: usize,
    buffer: Vec<u8>,
    ops: Vec<MemoryOp>,
    interrupts: bool,
    busy_polls: u32,
    busy: u32,
}

impl Memory {
    /// Blank flash covering the application section and the bootloader
    pub fn erased(config: &BootConfig) -> Self {
        let size = config.boot_address as usize + 1024;
        Self::from_image(config, vec![0xFF; size])
    }

    /// Flash contents taken from an image, padded up to the bootloader
    pub fn from_image(config: &BootConfig, mut flash: Vec<u8>) -> Self {
        let size = config.boot_address as usize + 1024;
        if flash.len() < size {
            flash.resize(size, 0xFF);
        }
        Self {
            flash,
            page_size: config.page_size as usize,
            buffer: vec![0xFF; config.page_size as usize],
            ops: Vec::new(),
            interrupts: true,
            busy_polls: 0,
            busy: 0,
        }
    }

    /// Blank flash holding `app` at address zero, signed with a trailer
    pub fn with_image(config: &BootConfig, app: &[u8]) -> Self {
        let mut memory = Self::erased(config);
        memory.flash[..app.len()].copy_from_slice(app);
        if let Some(trailer) = Trailer::for_image(app) {
            memory.write_trailer(config, trailer);
        }
        memory
    }

    pub fn write_trailer(&mut self, config: &BootConfig, trailer: Trailer) {
        let base = config.trailer_address() as usize;
        self.flash[base..base + 4].copy_from_slice(&trailer.to_bytes());
    }

    pub fn poke(&mut self, address: usize, value: u8) {
        self.flash[address] = value;
    }

    pub fn read(&self, address: usize, len: usize) -> &[u8] {
        &self.flash[address..address + len]
    }

    pub fn image(&self) -> &[u8] {
        &self.flash
    }

    pub fn ops(&self) -> &[MemoryOp] {
        &self.ops
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts
    }

    /// Report busy for this many polls after each erase or write
    pub fn set_busy_polls(&mut self, polls: u32) {
        self.busy_polls = polls;
    }

    fn page_base(&self, address: u16) -> usize {
        address as usize & !(self.page_size - 1)
    }
}

impl ProgramMemory<Infallible> for Memory {
    fn read_byte(&mut self, address: u16) -> Result<u8, Infallible> {
        Ok(self.flash.get(address as usize).copied().unwrap_or(0xFF))
    }

    fn is_busy(&mut self) -> Result<bool, Infallible> {
        if self.busy > 0 {
            self.busy -= 1;
            return Ok(true);
        }
        Ok(false)
    }

    fn erase_page(&mut self, address: u16) -> Result<(), Infallible> {
        self.ops.push(MemoryOp::Erase {
            address,
            interrupts: self.interrupts,
        });
        let base = self.page_base(address);
        self.flash[base..base + self.page_size]
            .iter_mut()
            .for_each(|b| *b = 0xFF);
        self.busy = self.busy_polls;
        Ok(())
    }

    fn fill_word(&mut self, address: u16, word: u16) -> Result<(), Infallible> {
        self.ops.push(MemoryOp::Fill { address, word });
        let offset = address as usize % self.page_size;
        self.buffer[offset..offset + 2].copy_from_slice(&word.to_le_bytes());
        Ok(())
    }

    fn write_page(&mut self, address: u16) -> Result<(), Infallible> {
        self.ops.push(MemoryOp::Write {
            address,
            interrupts: self.interrupts,
        });
        let base = self.page_base(address);
        self.flash[base..base + self.page_size].copy_from_slice(&self.buffer);
        self.buffer.iter_mut().for_each(|b| *b = 0xFF);
        self.busy = self.busy_polls;
        Ok(())
    }

    fn enable_rww(&mut self) -> Result<(), Infallible> {
        self.ops.push(MemoryOp::EnableRww);
        Ok(())
    }

    fn without_interrupts<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let previous = self.interrupts;
        self.interrupts = false;
        let r = f(self);
        self.interrupts = previous;
        r
    }
}
