//! In-system programming of a target AVR over its serial programming
//! interface.
//!
//! Every instruction is a 4 byte full duplex frame. The target echoes the
//! previous byte while shifting, so the third reply byte of the programming
//! enable frame is the sync byte and the fourth reply byte of a read carries
//! the value.

use core::marker::PhantomData;

use embedded_hal::blocking::delay::DelayMs;

use crate::protocol::{
    Field, Instruction, CHIP_ERASE, CHIP_ERASE_DELAY_MS, ENABLE_PROGRAMMING, FUSE_WRITE_DELAY_MS,
    ISP_SYNC, PAGE_WRITE_DELAY_MS, READ_CHUNK,
};
use crate::IspPort;

/// Outcome of the programming enable handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// Target in sync, with its signature bytes
    Connected([u8; 3]),
    /// Target did not echo the sync byte, this is what came back instead
    Refused(u8),
}

pub struct Isp<I, E> {
    port: I,
    _err: PhantomData<E>,
}

impl<I, E> Isp<I, E>
where
    I: IspPort<E>,
    E: core::fmt::Debug,
{
    pub fn new(port: I) -> Self {
        Self {
            port,
            _err: PhantomData,
        }
    }

    /// Shift one frame out, returning the bytes shifted in.
    pub fn transaction(&mut self, frame: [u8; 4]) -> Result<[u8; 4], E> {
        let mut buffer = frame;
        self.port.transfer(&mut buffer)?;
        trace!("isp {:02x?} -> {:02x?}", frame, buffer);
        Ok(buffer)
    }

    fn command(&mut self, a: u8, b: u8, c: u8, d: u8) -> Result<u8, E> {
        Ok(self.transaction([a, b, c, d])?[3])
    }

    /// Put the target into programming mode.
    ///
    /// On refusal the interface is released and reset is driven high, so a
    /// later attempt starts from a known state.
    pub fn connect<D>(&mut self, delay: &mut D, reset_delay_ms: u32) -> Result<Handshake, E>
    where
        D: DelayMs<u32>,
    {
        debug!("Resetting target");

        self.port.set_reset(false)?;
        self.port.enable()?;
        delay.delay_ms(reset_delay_ms);

        self.port.set_reset(true)?;
        delay.delay_ms(reset_delay_ms);

        self.port.set_reset(false)?;
        delay.delay_ms(reset_delay_ms);

        debug!("Sending programming enable");

        let reply = self.transaction([Instruction::Enable as u8, ENABLE_PROGRAMMING, 0x12, 0x00])?;
        delay.delay_ms(reset_delay_ms);

        if reply[2] != ISP_SYNC {
            warn!("Target out of sync, received 0x{:02x}", reply[2]);
            self.disconnect()?;
            return Ok(Handshake::Refused(reply[2]));
        }

        let signature = self.signature()?;
        info!("Target connected, signature {:02x?}", signature);

        Ok(Handshake::Connected(signature))
    }

    /// Release the interface and let the target run. Safe to repeat.
    pub fn disconnect(&mut self) -> Result<(), E> {
        self.port.disable()?;
        self.port.set_reset(true)
    }

    pub fn signature(&mut self) -> Result<[u8; 3], E> {
        let mut signature = [0u8; 3];
        for (i, s) in signature.iter_mut().enumerate() {
            *s = self.command(Instruction::ReadSignature as u8, 0x00, i as u8, 0x00)?;
        }
        Ok(signature)
    }

    /// Read one program memory byte by byte address.
    pub fn read_byte(&mut self, address: u32) -> Result<u8, E> {
        let op = if address & 1 == 0 {
            Instruction::ReadFlashLow
        } else {
            Instruction::ReadFlashHigh
        };
        let word = address >> 1;
        self.command(op as u8, (word >> 8) as u8, word as u8, 0x00)
    }

    /// Read from `from` up to `to` (inclusive) or the end of the current
    /// 32 byte line, whichever comes first. Returns the count read.
    pub fn read_chunk(
        &mut self,
        from: u32,
        to: u32,
        out: &mut [u8; READ_CHUNK],
    ) -> Result<usize, E> {
        let mut address = from;
        let mut count = 0;

        while address <= to && count < READ_CHUNK {
            out[count] = self.read_byte(address)?;
            count += 1;
            address += 1;
            if address as usize % READ_CHUNK == 0 {
                break;
            }
        }

        Ok(count)
    }

    /// Load one page into the target page buffer and commit it.
    ///
    /// `address` is a page aligned byte address; the caller has already
    /// validated it and the data.
    pub fn write_page<D>(&mut self, address: u32, data: &[u8], delay: &mut D) -> Result<(), E>
    where
        D: DelayMs<u32>,
    {
        for (i, word) in data.chunks(2).enumerate() {
            let low = word[0];
            let high = word.get(1).copied().unwrap_or(0xFF);
            self.command(Instruction::LoadPageLow as u8, 0x00, i as u8, low)?;
            self.command(Instruction::LoadPageHigh as u8, 0x00, i as u8, high)?;
        }

        let word = address >> 1;
        debug!("Committing page at word 0x{:04x}", word);
        self.command(Instruction::WritePage as u8, (word >> 8) as u8, word as u8, 0x00)?;
        delay.delay_ms(PAGE_WRITE_DELAY_MS);

        Ok(())
    }

    pub fn read_field(&mut self, field: Field) -> Result<u8, E> {
        let frame = field.read_frame();
        Ok(self.transaction(frame)?[3])
    }

    /// Program a fuse or lock byte. Returns false for read-only fields.
    pub fn write_field<D>(&mut self, field: Field, value: u8, delay: &mut D) -> Result<bool, E>
    where
        D: DelayMs<u32>,
    {
        let frame = match field.write_frame(value) {
            Some(f) => f,
            None => return Ok(false),
        };
        debug!("Writing {} = 0x{:02x}", field.name(), value);
        self.transaction(frame)?;
        delay.delay_ms(FUSE_WRITE_DELAY_MS);
        Ok(true)
    }

    /// Erase flash and lock bits. The target reports no status.
    pub fn chip_erase<D>(&mut self, delay: &mut D) -> Result<(), E>
    where
        D: DelayMs<u32>,
    {
        info!("Erasing target");
        self.transaction([Instruction::Enable as u8, CHIP_ERASE, 0x00, 0x00])?;
        delay.delay_ms(CHIP_ERASE_DELAY_MS);
        Ok(())
    }

    pub fn port(&mut self) -> &mut I {
        &mut self.port
    }
}
