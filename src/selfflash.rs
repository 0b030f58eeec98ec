//! Application image validation and self-programming for the bootloader.
//!
//! The application is signed with a 4 byte trailer stored immediately
//! below the bootloader: `[size: u16 LE][crc: u16 LE]`, where `crc` is
//! CRC-16/ARC (reflected polynomial 0xA001, initial value 0) over the first
//! `size` bytes of program memory.

use crc::{Crc, NoTable, CRC_16_ARC};
use embedded_hal::watchdog::Watchdog;

use crate::{Error, Fault, Options, ProgramMemory};

/// Table-free CRC-16, the bootloader cannot spare flash for a table
pub const CRC16: Crc<u16, NoTable> = Crc::<u16, NoTable>::new(&CRC_16_ARC);

/// Smallest image accepted as an application
pub const MIN_IMAGE_SIZE: u16 = 0x0020;

pub const TRAILER_SIZE: u16 = 4;

pub fn crc16(bytes: &[u8]) -> u16 {
    CRC16.checksum(bytes)
}

/// Program memory layout of the device running the bootloader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootConfig {
    /// Byte address of the first bootloader page
    pub boot_address: u16,
    /// Self-programming page size in bytes
    pub page_size: u16,
    /// Value a `flash` request must carry
    pub magic: u16,
    pub cpu: &'static str,
}

impl BootConfig {
    /// ATmega8 with a 1 KiB boot section
    pub const fn atmega8() -> Self {
        Self {
            boot_address: 0x1C00,
            page_size: 64,
            magic: crate::protocol::PG_MAGIC,
            cpu: "atmega8",
        }
    }

    pub fn trailer_address(&self) -> u16 {
        self.boot_address.saturating_sub(TRAILER_SIZE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trailer {
    pub size: u16,
    pub crc: u16,
}

impl Trailer {
    /// Sign an application image.
    pub fn for_image(image: &[u8]) -> Option<Self> {
        let size = u16::try_from(image.len()).ok()?;
        Some(Self {
            size,
            crc: crc16(image),
        })
    }

    pub fn from_bytes(b: [u8; 4]) -> Self {
        Self {
            size: u16::from_le_bytes([b[0], b[1]]),
            crc: u16::from_le_bytes([b[2], b[3]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        let size = self.size.to_le_bytes();
        let crc = self.crc.to_le_bytes();
        [size[0], size[1], crc[0], crc[1]]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageStatus {
    Valid,
    /// The trailer size is out of range, the CRC was not computed
    BadSize(u16),
    BadCrc { stored: u16, computed: u16 },
}

impl ImageStatus {
    pub fn is_valid(&self) -> bool {
        *self == ImageStatus::Valid
    }
}

pub fn read_trailer<M, E>(memory: &mut M, config: &BootConfig) -> Result<Trailer, E>
where
    M: ProgramMemory<E>,
{
    let base = config.trailer_address();
    let mut b = [0u8; 4];
    for (i, v) in b.iter_mut().enumerate() {
        *v = memory.read_byte(base + i as u16)?;
    }
    Ok(Trailer::from_bytes(b))
}

/// Decide whether the resident application may be started.
pub fn check_image<M, W, E>(
    memory: &mut M,
    watchdog: &mut W,
    config: &BootConfig,
) -> Result<ImageStatus, E>
where
    M: ProgramMemory<E>,
    W: Watchdog,
{
    let trailer = read_trailer(memory, config)?;

    if trailer.size < MIN_IMAGE_SIZE || trailer.size > config.trailer_address() {
        warn!("Image size 0x{:04x} out of range", trailer.size);
        return Ok(ImageStatus::BadSize(trailer.size));
    }

    let mut digest = CRC16.digest();
    for address in 0..trailer.size {
        digest.update(&[memory.read_byte(address)?]);
        watchdog.feed();
    }
    let computed = digest.finalize();

    if computed != trailer.crc {
        warn!(
            "Image CRC mismatch, stored 0x{:04x} computed 0x{:04x}",
            trailer.crc, computed
        );
        return Ok(ImageStatus::BadCrc {
            stored: trailer.crc,
            computed,
        });
    }

    debug!("Image of {} bytes verified", trailer.size);
    Ok(ImageStatus::Valid)
}

/// Page aligned and entirely below the bootloader.
pub fn check_page_address<E>(config: &BootConfig, address: u16) -> Result<(), Error<E>> {
    if config.page_size == 0
        || address % config.page_size != 0
        || address as u32 + config.page_size as u32 > config.boot_address as u32
    {
        return Fault::Address.raise();
    }
    Ok(())
}

fn await_idle<M, W, E>(memory: &mut M, watchdog: &mut W, limit: u32) -> Result<(), Error<E>>
where
    M: ProgramMemory<E>,
    W: Watchdog,
{
    for _ in 0..limit {
        if !memory.is_busy()? {
            return Ok(());
        }
        watchdog.feed();
    }
    error!("Program memory still busy after {} polls", limit);
    Err(Error::Busy)
}

/// Erase and rewrite one page of our own program memory.
///
/// The magic value and the address are checked before any memory
/// operation; the bootloader itself can never be overwritten.
pub fn program_page<M, W, E>(
    memory: &mut M,
    watchdog: &mut W,
    options: &Options,
    config: &BootConfig,
    address: u16,
    magic: u16,
    data: &[u8],
) -> Result<(), Error<E>>
where
    M: ProgramMemory<E>,
    W: Watchdog,
{
    if magic != config.magic {
        warn!("Rejecting page write with magic 0x{:04x}", magic);
        return Fault::Rejected.raise();
    }
    check_page_address(config, address)?;

    let page = match data.get(..config.page_size as usize) {
        Some(p) => p,
        None => return Fault::Parameter.raise(),
    };

    debug!("Programming page 0x{:04x}", address);

    let limit = options.busy_poll_limit;
    memory.without_interrupts(|m: &mut M| -> Result<(), Error<E>> {
        await_idle(m, watchdog, limit)?;
        m.erase_page(address)?;
        await_idle(m, watchdog, limit)?;

        for (i, word) in page.chunks(2).enumerate() {
            let value = u16::from_le_bytes([word[0], word.get(1).copied().unwrap_or(0xFF)]);
            m.fill_word(address + 2 * i as u16, value)?;
        }

        m.write_page(address)?;
        await_idle(m, watchdog, limit)?;
        m.enable_rww()?;
        Ok(())
    })
}
