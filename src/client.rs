//! Host side of the line protocol.
//!
//! [`Client`] talks to either personality over a [`SerialPort`]: it
//! identifies the device, detects the target CPU, and writes, verifies and
//! dumps flash. Replies are collected line by line up to `ready`.

use core::fmt::Debug;
use core::marker::PhantomData;

use embedded_hal::blocking::delay::DelayMs;
use thiserror::Error;

use crate::codec;
use crate::protocol::{Field, BOOTLOADER_NAME, MAX_PAGE_SIZE, PG_MAGIC, PROGRAMMER_NAME};
use crate::selfflash::{BootConfig, Trailer, MIN_IMAGE_SIZE};
use crate::SerialPort;

/// Extra attempts after a command met silence
const RETRIES: usize = 2;

#[derive(Debug, Error)]
pub enum ClientError<E> {
    #[error("serial error: {0:?}")]
    Serial(E),
    #[error("device is not responding")]
    NotResponding,
    #[error("device is not ready, received: {0:?}")]
    NotReady(Vec<String>),
    #[error("'{command}' failed, received: {reply:?}")]
    Rejected { command: String, reply: Vec<String> },
    #[error("unexpected answer: {0:?}")]
    WrongAnswer(Vec<String>),
    #[error("unknown cpu with signature {0:02x?}")]
    UnknownCpu([u8; 3]),
    #[error("expected cpu {expected}, detected {detected}")]
    WrongCpu {
        expected: String,
        detected: &'static str,
    },
    #[error("image of {size} bytes does not fit in {space} bytes")]
    TooLarge { size: usize, space: usize },
    #[error("bad data line: {0}")]
    BadData(String),
    #[error("verify error at 0x{address:06x}: expected {expected:02x}, found {found:02x}")]
    Verify { address: u32, expected: u8, found: u8 },
}

impl<E> From<E> for ClientError<E> {
    fn from(e: E) -> Self {
        Self::Serial(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Programmer,
    Bootloader,
}

/// What a device reported in answer to `hello`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub kind: DeviceKind,
    pub version: String,
    /// Bootloader only: CPU running the bootloader
    pub cpu: Option<String>,
    pub boot_address: Option<u16>,
    pub page_size: Option<u16>,
    /// Bootloader only: whether the resident application passed its check
    pub application_ok: Option<bool>,
}

impl Device {
    /// Layout to sign images for, when talking to a bootloader
    pub fn boot_config(&self) -> Option<BootConfig> {
        match (self.kind, self.boot_address, self.page_size) {
            (DeviceKind::Bootloader, Some(boot_address), Some(page_size)) => Some(BootConfig {
                boot_address,
                page_size,
                ..BootConfig::atmega8()
            }),
            _ => None,
        }
    }
}

/// Targets the programmer knows how to program
#[derive(Debug, PartialEq, Eq)]
pub struct Cpu {
    pub name: &'static str,
    pub signature: [u8; 3],
    pub page_size: usize,
    pub flash_size: usize,
}

pub const CPUS: &[Cpu] = &[
    Cpu {
        name: "atmega8",
        signature: [0x1e, 0x93, 0x07],
        page_size: 64,
        flash_size: 8 * 1024,
    },
    Cpu {
        name: "atmega168",
        signature: [0x1e, 0x94, 0x06],
        page_size: 128,
        flash_size: 16 * 1024,
    },
    Cpu {
        name: "atmega328p",
        signature: [0x1e, 0x95, 0x0f],
        page_size: 128,
        flash_size: 32 * 1024,
    },
];

/// How pages reach program memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Writer {
    /// `avr flash write` through the programmer
    Isp { page_size: usize },
    /// `flash` requests to a bootloader
    SelfFlash { page_size: usize, magic: u16 },
}

impl Writer {
    pub fn for_cpu(cpu: &Cpu) -> Self {
        Writer::Isp {
            page_size: cpu.page_size,
        }
    }

    pub fn for_bootloader(config: &BootConfig) -> Self {
        Writer::SelfFlash {
            page_size: config.page_size as usize,
            magic: PG_MAGIC,
        }
    }

    fn page_size(&self) -> usize {
        match *self {
            Writer::Isp { page_size } | Writer::SelfFlash { page_size, .. } => page_size,
        }
    }
}

pub struct Client<S, D, E> {
    port: S,
    delay: D,
    timeout_ms: u32,
    _err: PhantomData<E>,
}

impl<S, D, E> Client<S, D, E>
where
    S: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    /// Create a client giving up on a reply line after `timeout_ms`
    pub fn new(port: S, delay: D, timeout_ms: u32) -> Self {
        Self {
            port,
            delay,
            timeout_ms,
            _err: PhantomData,
        }
    }

    pub fn port(&mut self) -> &mut S {
        &mut self.port
    }

    /// Send one command line and collect its reply up to `ready`.
    ///
    /// A silent device is nudged with an empty line before giving up.
    pub fn command(&mut self, line: &str) -> Result<Vec<String>, ClientError<E>> {
        self.discard_input()?;
        debug!(">> {}", line);
        self.send(line)?;

        let mut retries = RETRIES;
        loop {
            match self.receive() {
                Err(ClientError::NotResponding) if retries > 0 => {
                    warn!("No reply to '{}', retrying", line);
                    retries -= 1;
                    self.send("")?;
                }
                r => return r,
            }
        }
    }

    /// [`Client::command`], requiring `ok` among the reply lines
    fn require(&mut self, line: &str, ok: &str) -> Result<Vec<String>, ClientError<E>> {
        let reply = self.command(line)?;
        if !reply.iter().any(|l| l == ok) {
            return Err(ClientError::Rejected {
                command: line.to_string(),
                reply,
            });
        }
        Ok(reply)
    }

    fn send(&mut self, line: &str) -> Result<(), ClientError<E>> {
        for &b in line.as_bytes().iter().chain(b"\r\n") {
            block!(self.port.write(b))?;
        }
        block!(self.port.flush())?;
        Ok(())
    }

    fn discard_input(&mut self) -> Result<(), ClientError<E>> {
        loop {
            match self.port.read() {
                Ok(_) => (),
                Err(nb::Error::WouldBlock) => return Ok(()),
                Err(nb::Error::Other(e)) => return Err(e.into()),
            }
        }
    }

    fn receive(&mut self) -> Result<Vec<String>, ClientError<E>> {
        let mut lines = Vec::new();
        loop {
            match self.read_line()? {
                Some(l) if l == "ready" => return Ok(lines),
                Some(l) => lines.push(l),
                None if lines.is_empty() => return Err(ClientError::NotResponding),
                None => return Err(ClientError::NotReady(lines)),
            }
        }
    }

    /// Lines received until the device falls silent
    fn drain_lines(&mut self) -> Result<Vec<String>, ClientError<E>> {
        let mut lines = Vec::new();
        while let Some(l) = self.read_line()? {
            lines.push(l);
        }
        Ok(lines)
    }

    /// Next non-empty line, `None` once the timeout passes without one
    fn read_line(&mut self) -> Result<Option<String>, ClientError<E>> {
        let mut line = Vec::new();
        let mut waited = 0;

        loop {
            match self.port.read() {
                Ok(b'\n') => {
                    let text = String::from_utf8_lossy(&line).trim().to_string();
                    if !text.is_empty() {
                        trace!("<< {}", text);
                        return Ok(Some(text));
                    }
                    line.clear();
                    waited = 0;
                }
                Ok(b) => {
                    line.push(b);
                    waited = 0;
                }
                Err(nb::Error::WouldBlock) => {
                    if waited >= self.timeout_ms {
                        return Ok(None);
                    }
                    self.delay.delay_ms(1);
                    waited += 1;
                }
                Err(nb::Error::Other(e)) => return Err(e.into()),
            }
        }
    }

    /// Identify the device and start its session.
    pub fn hello(&mut self) -> Result<Device, ClientError<E>> {
        let reply = self.command("hello")?;

        let mut greeted = false;
        let mut device = None;
        let mut cpu = None;
        let mut boot_address = None;
        let mut page_size = None;
        let mut application_ok = None;

        for line in &reply {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields[..] {
                ["hello"] => greeted = true,
                ["device", name, version] => device = Some((name, version)),
                ["cpu", name] => cpu = Some(name.to_string()),
                ["bootaddr", v] => boot_address = v.parse().ok(),
                ["pagesize", v] => page_size = v.parse().ok(),
                ["crc", status] => application_ok = Some(status == "ok"),
                _ => debug!("Ignoring '{}'", line),
            }
        }

        let (kind, version) = match device {
            Some((PROGRAMMER_NAME, v)) if greeted => (DeviceKind::Programmer, v.to_string()),
            Some((BOOTLOADER_NAME, v)) if greeted => (DeviceKind::Bootloader, v.to_string()),
            _ => return Err(ClientError::WrongAnswer(reply.clone())),
        };

        info!("Found {:?} {}", kind, version);
        Ok(Device {
            kind,
            version,
            cpu,
            boot_address,
            page_size,
            application_ok,
        })
    }

    /// Attach the programmer to its target and identify the target CPU.
    ///
    /// With `expected` set, a different CPU is an error.
    pub fn connect_target(
        &mut self,
        expected: Option<&str>,
    ) -> Result<&'static Cpu, ClientError<E>> {
        let reply = self.require("avr connect", "avr connect ok")?;

        let signature = reply
            .iter()
            .find_map(|l| l.strip_prefix("signature "))
            .and_then(|s| {
                let bytes: Vec<u8> = s
                    .split_whitespace()
                    .filter_map(|b| u8::from_str_radix(b, 16).ok())
                    .collect();
                <[u8; 3]>::try_from(bytes).ok()
            })
            .ok_or_else(|| ClientError::WrongAnswer(reply.clone()))?;

        let cpu = CPUS
            .iter()
            .find(|c| c.signature == signature)
            .ok_or(ClientError::UnknownCpu(signature))?;
        info!("Detected {}", cpu.name);

        match expected {
            Some(name) if name != cpu.name => Err(ClientError::WrongCpu {
                expected: name.to_string(),
                detected: cpu.name,
            }),
            _ => Ok(cpu),
        }
    }

    pub fn disconnect_target(&mut self) -> Result<(), ClientError<E>> {
        self.require("avr disconnect", "avr disconnect ok")?;
        Ok(())
    }

    pub fn erase(&mut self) -> Result<(), ClientError<E>> {
        info!("Erasing chip");
        self.require("avr flash erase", "avr flash erase done")?;
        Ok(())
    }

    /// Read and optionally program one fuse field, returning its value.
    pub fn fuse(&mut self, field: Field, value: Option<u8>) -> Result<u8, ClientError<E>> {
        let command = match value {
            Some(v) => format!("avr fuse {} {:02x}", field.name(), v),
            None => format!("avr fuse {}", field.name()),
        };
        let reply = self.command(&command)?;

        let prefix = format!("avr fuse {} ", field.name());
        let read = reply
            .iter()
            .find_map(|l| l.strip_prefix(prefix.as_str()))
            .and_then(|v| u8::from_str_radix(v, 16).ok());

        match (read, value) {
            (Some(r), Some(v)) if r != v => Err(ClientError::Rejected { command, reply }),
            (Some(r), _) => Ok(r),
            (None, _) => Err(ClientError::Rejected { command, reply }),
        }
    }

    /// Read target flash from `from` to `to` inclusive.
    pub fn read_flash(&mut self, from: u32, to: u32) -> Result<Vec<u8>, ClientError<E>> {
        let command = format!("avr flash read {:06x} {:06x}", from, to);
        let reply = self.command(&command)?;

        let mut data = Vec::with_capacity((to.saturating_sub(from) + 1) as usize);
        let mut chunk = [0u8; MAX_PAGE_SIZE];
        let mut other = Vec::new();

        for line in &reply {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let (address, hex) = match fields[..] {
                ["data", address, hex] => (address, hex),
                _ => {
                    other.push(line.clone());
                    continue;
                }
            };

            let expected = from + data.len() as u32;
            if u32::from_str_radix(address, 16).ok() != Some(expected) {
                return Err(ClientError::BadData(line.clone()));
            }
            let count = match codec::decode_block(hex.as_bytes(), &mut chunk) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Rejecting data at 0x{:06x}: {}", expected, e);
                    return Err(ClientError::BadData(line.clone()));
                }
            };
            data.extend_from_slice(&chunk[..count]);
        }

        if data.len() as u32 != to.saturating_sub(from) + 1 {
            return Err(ClientError::Rejected {
                command,
                reply: other,
            });
        }
        Ok(data)
    }

    /// Compare target flash against `image`, stopping at the first
    /// difference.
    pub fn verify(&mut self, image: &[u8]) -> Result<(), ClientError<E>> {
        if image.is_empty() {
            return Ok(());
        }
        info!("Verifying {} bytes", image.len());

        let flash = self.read_flash(0, image.len() as u32 - 1)?;
        match image.iter().zip(flash.iter()).position(|(a, b)| a != b) {
            Some(i) => Err(ClientError::Verify {
                address: i as u32,
                expected: image[i],
                found: flash[i],
            }),
            None => Ok(()),
        }
    }

    /// Write `image` from address zero, skipping blank pages.
    ///
    /// Returns the number of pages sent.
    pub fn write_flash(&mut self, image: &[u8], writer: Writer) -> Result<usize, ClientError<E>> {
        let page_size = writer.page_size();
        let mut text = [0u8; (MAX_PAGE_SIZE + 1) * 2];
        let mut written = 0;

        for (index, chunk) in image.chunks(page_size).enumerate() {
            if chunk.iter().all(|&b| b == 0xFF) {
                continue;
            }

            let mut page = chunk.to_vec();
            page.resize(page_size, 0xFF);
            let len = codec::encode_block(&page, &mut text).map_err(|_| ClientError::TooLarge {
                size: page_size,
                space: MAX_PAGE_SIZE,
            })?;
            let payload = String::from_utf8_lossy(&text[..len]);

            let address = index * page_size;
            match writer {
                Writer::Isp { page_size } => self.require(
                    &format!("avr flash write {:04x} {:06x} {}", page_size, address, payload),
                    "avr flash write done",
                )?,
                Writer::SelfFlash { magic, .. } => self.require(
                    &format!("flash {:04x} {:04x} {}", address, magic, payload),
                    "flash ok",
                )?,
            };
            written += 1;
        }

        info!("Wrote {} pages of {} bytes", written, page_size);
        Ok(written)
    }

    /// Restart the device into its application
    pub fn reboot(&mut self) -> Result<(), ClientError<E>> {
        info!("Rebooting");
        self.discard_input()?;
        self.send("reboot")?;
        self.drain_lines()?;
        Ok(())
    }

    /// Ask the programmer to hand over to the bootloader
    pub fn enter_bootloader(&mut self) -> Result<(), ClientError<E>> {
        info!("Starting bootloader");
        self.discard_input()?;
        self.send("bootloader")?;

        let reply = self.drain_lines()?;
        if !reply.iter().any(|l| l == "starting bootloader..") {
            return Err(ClientError::WrongAnswer(reply));
        }
        Ok(())
    }

    /// Make sure a bootloader is answering, handing over from the
    /// programmer when needed.
    pub fn start_bootloader(&mut self, device: Device) -> Result<Device, ClientError<E>> {
        if device.kind == DeviceKind::Bootloader {
            return Ok(device);
        }
        self.enter_bootloader()?;

        let device = self.hello()?;
        if device.kind != DeviceKind::Bootloader {
            return Err(ClientError::WrongAnswer(vec![format!("{:?}", device)]));
        }
        Ok(device)
    }
}

/// Pad an application up to the trailer and append its size and CRC.
///
/// `None` when the application does not fit in front of the trailer.
pub fn sign_image(app: &[u8], config: &BootConfig) -> Option<Vec<u8>> {
    let trailer = Trailer::for_image(app)
        .filter(|t| t.size >= MIN_IMAGE_SIZE && t.size <= config.trailer_address())?;

    let mut image = app.to_vec();
    image.resize(config.trailer_address() as usize, 0xFF);
    image.extend_from_slice(&trailer.to_bytes());
    Some(image)
}

/// Canonical hex dump, identical lines collapsed into `*`
pub fn hexdump(base: u32, data: &[u8]) -> Vec<String> {
    let mut lines = Vec::new();
    let mut previous: Option<&[u8]> = None;
    let mut repeating = false;

    for (i, row) in data.chunks(16).enumerate() {
        let address = base + (i * 16) as u32;
        let last = (i + 1) * 16 >= data.len();

        if previous == Some(row) && !last {
            if !repeating {
                lines.push("*".to_string());
                repeating = true;
            }
            continue;
        }
        repeating = false;
        previous = Some(row);

        let mut line = format!("{:06x} ", address);
        for (j, b) in row.iter().enumerate() {
            if j == 8 {
                line.push(' ');
            }
            line.push_str(&format!(" {:02x}", b));
        }
        let pad = (16 - row.len()) * 3 + usize::from(row.len() <= 8);
        line.push_str(&" ".repeat(pad));

        let ascii: String = row
            .iter()
            .map(|&b| if (0x20..0x7f).contains(&b) { b as char } else { '.' })
            .collect();
        line.push_str(&format!("  |{}|", ascii));
        lines.push(line);
    }
    lines
}
