use std::fs;
use std::io::{self, ErrorKind as IoErrorKind, Read as _, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;
use embedded_hal::serial::{Read, Write};
use embedded_hal::watchdog::Watchdog;

use linux_embedded_hal::serial_core::{
    BaudRate, CharSize, FlowControl, Parity, SerialDevice as _, SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::spidev::{SpiModeFlags, SpidevOptions};
use linux_embedded_hal::sysfs_gpio::Direction;
use linux_embedded_hal::{Serial, Spidev, SysfsPin};

use crate::mock;
use crate::rx::{BufferedSerial, Pushed, RxProducer};
use crate::selfflash::BootConfig;
use crate::{IspPort, ModeTransfer, Platform, ProgramMemory, SerialPort};

impl SerialPort<IoErrorKind> for Serial {
    fn close(&mut self) -> Result<(), IoErrorKind> {
        block!(<Self as Write<u8>>::flush(self))
    }
}

/// Open a tty at `baud`, 8N1 without flow control
pub fn open_serial<P: AsRef<Path>>(port: P, baud: usize) -> anyhow::Result<Serial> {
    // Open port
    let mut port = Serial::open(port.as_ref())?;

    // Apply settings
    let mut settings = port.0.read_settings()?;

    settings.set_char_size(CharSize::Bits8);
    settings.set_stop_bits(StopBits::Stop1);
    settings.set_baud_rate(BaudRate::from_speed(baud))?;
    settings.set_flow_control(FlowControl::FlowNone);
    settings.set_parity(Parity::ParityNone);

    port.0.write_settings(&settings)?;

    Ok(port)
}

/// Transmit half for serving the protocol on standard output
pub struct Stdout(io::Stdout);

impl Stdout {
    pub fn new() -> Self {
        Self(io::stdout())
    }
}

impl Default for Stdout {
    fn default() -> Self {
        Self::new()
    }
}

impl Write<u8> for Stdout {
    type Error = IoErrorKind;

    fn write(&mut self, word: u8) -> nb::Result<(), IoErrorKind> {
        self.0
            .write_all(&[word])
            .map_err(|e| nb::Error::Other(e.kind()))
    }

    fn flush(&mut self) -> nb::Result<(), IoErrorKind> {
        io::Write::flush(&mut self.0).map_err(|e| nb::Error::Other(e.kind()))
    }
}

/// Copy `input` into a receive queue from a background thread.
///
/// The returned flag is raised once `input` is exhausted and every byte
/// has been queued.
pub fn spawn_reader<R, const N: usize>(
    input: R,
    mut producer: RxProducer<'static, N>,
) -> Arc<AtomicBool>
where
    R: io::Read + Send + 'static,
{
    let closed = Arc::new(AtomicBool::new(false));
    let flag = closed.clone();

    thread::spawn(move || {
        for byte in input.bytes() {
            let byte = match byte {
                Ok(b) => b,
                Err(e) => {
                    error!("Error reading input: {}", e);
                    break;
                }
            };
            // Unlike a receive interrupt this thread can wait for room
            while producer.push(byte) == Pushed::Dropped {
                thread::sleep(Duration::from_millis(1));
            }
        }
        debug!("Input closed");
        flag.store(true, Ordering::Release);
    });

    closed
}

/// Queued host input as a serial port.
///
/// Reads fail with `UnexpectedEof` once the input has closed and the queue
/// is drained, so a command loop over a pipe ends with its input.
pub struct StreamSerial<'a, W, const N: usize> {
    port: BufferedSerial<'a, W, IoErrorKind, N>,
    closed: Arc<AtomicBool>,
}

impl<'a, W, const N: usize> StreamSerial<'a, W, N>
where
    W: Write<u8, Error = IoErrorKind>,
{
    pub fn new(port: BufferedSerial<'a, W, IoErrorKind, N>, closed: Arc<AtomicBool>) -> Self {
        Self { port, closed }
    }

    pub fn transmitter(&self) -> &W {
        self.port.transmitter()
    }
}

impl<'a, W, const N: usize> Read<u8> for StreamSerial<'a, W, N>
where
    W: Write<u8, Error = IoErrorKind>,
{
    type Error = IoErrorKind;

    fn read(&mut self) -> nb::Result<u8, IoErrorKind> {
        // Checked first: once raised, an empty queue stays empty
        let closed = self.closed.load(Ordering::Acquire);
        match self.port.read() {
            Err(nb::Error::WouldBlock) if closed => {
                Err(nb::Error::Other(IoErrorKind::UnexpectedEof))
            }
            r => r,
        }
    }
}

impl<'a, W, const N: usize> Write<u8> for StreamSerial<'a, W, N>
where
    W: Write<u8, Error = IoErrorKind>,
{
    type Error = IoErrorKind;

    fn write(&mut self, word: u8) -> nb::Result<(), IoErrorKind> {
        self.port.write(word)
    }

    fn flush(&mut self) -> nb::Result<(), IoErrorKind> {
        self.port.flush()
    }
}

impl<'a, W, const N: usize> SerialPort<IoErrorKind> for StreamSerial<'a, W, N>
where
    W: Write<u8, Error = IoErrorKind>,
{
    fn close(&mut self) -> Result<(), IoErrorKind> {
        self.port.close()
    }
}

/// Target reached through a spidev bus with reset on a sysfs GPIO
pub struct SpiTarget {
    spi: Spidev,
    reset: SysfsPin,
    enabled: bool,
}

fn gpio_error(e: linux_embedded_hal::sysfs_gpio::Error) -> IoErrorKind {
    error!("GPIO error: {:?}", e);
    IoErrorKind::Other
}

impl SpiTarget {
    pub fn open<P: AsRef<Path>>(spi: P, reset_gpio: u64, speed_hz: u32) -> anyhow::Result<Self> {
        let mut spi = Spidev::open(spi)?;
        let options = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(speed_hz)
            .mode(SpiModeFlags::SPI_MODE_0)
            .build();
        spi.0.configure(&options)?;

        // Leave the target running until a client connects
        let reset = SysfsPin::new(reset_gpio);
        reset.0.export()?;
        reset.0.set_direction(Direction::High)?;

        Ok(Self {
            spi,
            reset,
            enabled: false,
        })
    }
}

impl Transfer<u8> for SpiTarget {
    type Error = IoErrorKind;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], IoErrorKind> {
        if !self.enabled {
            return Err(IoErrorKind::NotConnected);
        }
        self.spi.transfer(words).map_err(|e| e.kind())
    }
}

impl IspPort<IoErrorKind> for SpiTarget {
    fn enable(&mut self) -> Result<(), IoErrorKind> {
        self.enabled = true;
        Ok(())
    }

    fn disable(&mut self) -> Result<(), IoErrorKind> {
        self.enabled = false;
        Ok(())
    }

    fn set_reset(&mut self, level: bool) -> Result<(), IoErrorKind> {
        if level {
            self.reset.set_high().map_err(gpio_error)
        } else {
            self.reset.set_low().map_err(gpio_error)
        }
    }
}

/// Simulated target with host error types
pub struct Simulated(pub mock::Target);

impl Simulated {
    /// An ATmega8 that keeps no transaction history
    pub fn atmega8() -> Self {
        Self(mock::Target::atmega8().quiet())
    }
}

impl Transfer<u8> for Simulated {
    type Error = IoErrorKind;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], IoErrorKind> {
        self.0.transfer(words).map_err(|e| match e {})
    }
}

impl IspPort<IoErrorKind> for Simulated {
    fn enable(&mut self) -> Result<(), IoErrorKind> {
        self.0.enable().map_err(|e| match e {})
    }

    fn disable(&mut self) -> Result<(), IoErrorKind> {
        self.0.disable().map_err(|e| match e {})
    }

    fn set_reset(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_reset(level).map_err(|e| match e {})
    }
}

/// Program memory backed by an image file, rewritten after every page
pub struct FileMemory {
    path: PathBuf,
    flash: Vec<u8>,
    buffer: Vec<u8>,
    page_size: usize,
}

impl FileMemory {
    /// Load `path`, or start from blank flash if it does not exist yet
    pub fn open<P: AsRef<Path>>(path: P, config: &BootConfig) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut flash = match fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == IoErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };
        debug!("Loaded {} bytes from {}", flash.len(), path.display());

        // Cover the application section and the trailer page
        let size = config.boot_address as usize;
        if flash.len() < size {
            flash.resize(size, 0xFF);
        }

        let page_size = config.page_size as usize;
        Ok(Self {
            path,
            flash,
            buffer: vec![0xFF; page_size],
            page_size,
        })
    }

    pub fn image(&self) -> &[u8] {
        &self.flash
    }

    fn page(&mut self, address: u16) -> Result<&mut [u8], IoErrorKind> {
        let base = address as usize & !(self.page_size - 1);
        self.flash
            .get_mut(base..base + self.page_size)
            .ok_or(IoErrorKind::InvalidInput)
    }

    fn persist(&self) -> Result<(), IoErrorKind> {
        fs::write(&self.path, &self.flash).map_err(|e| e.kind())
    }
}

impl ProgramMemory<IoErrorKind> for FileMemory {
    fn read_byte(&mut self, address: u16) -> Result<u8, IoErrorKind> {
        Ok(self.flash.get(address as usize).copied().unwrap_or(0xFF))
    }

    fn is_busy(&mut self) -> Result<bool, IoErrorKind> {
        Ok(false)
    }

    fn erase_page(&mut self, address: u16) -> Result<(), IoErrorKind> {
        self.page(address)?.iter_mut().for_each(|b| *b = 0xFF);
        Ok(())
    }

    fn fill_word(&mut self, address: u16, word: u16) -> Result<(), IoErrorKind> {
        let offset = address as usize % self.page_size;
        self.buffer[offset..offset + 2].copy_from_slice(&word.to_le_bytes());
        Ok(())
    }

    fn write_page(&mut self, address: u16) -> Result<(), IoErrorKind> {
        let buffer = core::mem::replace(&mut self.buffer, vec![0xFF; self.page_size]);
        self.page(address)?.copy_from_slice(&buffer);
        self.persist()
    }

    fn enable_rww(&mut self) -> Result<(), IoErrorKind> {
        Ok(())
    }

    fn without_interrupts<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        f(self)
    }
}

/// Logs mode transfers and lets the engine return
#[derive(Debug, Default)]
pub struct LinuxPlatform {
    pub stay: bool,
    pub transfer: Option<ModeTransfer>,
}

impl Platform for LinuxPlatform {
    fn request_mode_transfer(&mut self, target: ModeTransfer) {
        info!("Mode transfer to {:?}", target);
        self.transfer = Some(target);
    }

    fn stay_in_bootloader(&mut self) -> bool {
        self.stay
    }
}

/// The host has no watchdog to feed
#[derive(Debug, Default)]
pub struct NoWatchdog;

impl Watchdog for NoWatchdog {
    fn feed(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rx::RxQueue;
    use crate::{selfflash, Error, Options, Programmer};
    use linux_embedded_hal::Delay;

    /// Collects transmitted bytes
    #[derive(Default)]
    struct Sink(Vec<u8>);

    impl Write<u8> for Sink {
        type Error = IoErrorKind;

        fn write(&mut self, word: u8) -> nb::Result<(), IoErrorKind> {
            self.0.push(word);
            Ok(())
        }

        fn flush(&mut self) -> nb::Result<(), IoErrorKind> {
            Ok(())
        }
    }

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("avrprog-{}-{}.bin", std::process::id(), name))
    }

    #[test]
    fn closed_input_ends_the_session() {
        let queue: &'static mut RxQueue<64> = Box::leak(Box::new(RxQueue::new()));
        let (producer, consumer) = queue.split();
        let closed = spawn_reader(io::Cursor::new(b"hello\nbye\n".to_vec()), producer);
        let port = StreamSerial::new(BufferedSerial::new(consumer, Sink::default()), closed);

        let mut p = Programmer::new(
            port,
            Simulated::atmega8(),
            Delay {},
            NoWatchdog,
            LinuxPlatform::default(),
            Options::default(),
        );

        assert_eq!(p.run(), Err(Error::Serial(IoErrorKind::UnexpectedEof)));
        let output = String::from_utf8_lossy(&p.serial().transmitter().0).into_owned();
        assert!(output.contains("device avrprog"), "{}", output);
        assert_eq!(p.platform().transfer, None);
    }

    #[test]
    fn file_memory_keeps_pages_across_opens() {
        let path = scratch("pages");
        let _ = fs::remove_file(&path);
        let config = BootConfig::atmega8();
        let options = Options::default();

        let mut memory = FileMemory::open(&path, &config).unwrap();
        assert!(memory.image().iter().all(|&b| b == 0xFF));
        let page: Vec<u8> = (0..64).map(|i| i as u8).collect();
        selfflash::program_page(
            &mut memory,
            &mut NoWatchdog,
            &options,
            &config,
            0x0040,
            config.magic,
            &page,
        )
        .unwrap();

        let mut reopened = FileMemory::open(&path, &config).unwrap();
        assert_eq!(&reopened.image()[0x40..0x80], &page[..]);
        assert_eq!(reopened.read_byte(0x41), Ok(1));
        assert_eq!(reopened.read_byte(0x80), Ok(0xFF));
        assert_eq!(reopened.image().len(), config.boot_address as usize);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn file_memory_rejects_pages_past_the_image() {
        let path = scratch("bounds");
        let _ = fs::remove_file(&path);
        let mut memory = FileMemory::open(&path, &BootConfig::atmega8()).unwrap();

        assert_eq!(memory.erase_page(0x1C00), Err(IoErrorKind::InvalidInput));
        assert_eq!(memory.write_page(0xFFC0), Err(IoErrorKind::InvalidInput));
        assert!(!path.exists());
    }

    #[test]
    fn simulated_target_keeps_no_history() {
        let mut target = Simulated::atmega8();
        target.enable().unwrap();
        target.set_reset(false).unwrap();

        let mut enable = [0xAC, 0x53, 0x12, 0x00];
        assert_eq!(target.transfer(&mut enable).unwrap()[2], 0x53);
        for _ in 0..1000 {
            let mut signature = [0x30, 0x00, 0x00, 0x00];
            assert_eq!(target.transfer(&mut signature).unwrap()[3], 0x1e);
        }

        assert!(target.0.frames().is_empty());
        assert!(target.0.reset_history().is_empty());
        assert!(target.0.page_writes().is_empty());
    }
}
