//! Command engine of the serial bootloader.

use core::fmt::Debug;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::watchdog::Watchdog;

use crate::codec;
use crate::console::Console;
use crate::protocol::{
    Keyword, BOOTLOADER_NAME, BOOTLOADER_VERSION, BUFFER_SIZE, MAX_CMD_SPLIT, MAX_PAGE_SIZE,
    MODE_TRANSFER_DELAY_MS, WORD_DIGITS,
};
use crate::reader::{LineBuffer, LineStep};
use crate::selfflash::{self, check_image, BootConfig, ImageStatus};
use crate::session::{Session, State};
use crate::{Error, Fault, ModeTransfer, Options, Platform, ProgramMemory, SerialPort};

pub struct Bootloader<S, M, D, W, P, E> {
    console: Console<S, E>,
    memory: M,
    delay: D,
    watchdog: W,
    platform: P,
    options: Options,
    config: BootConfig,
    session: Session,
    line: LineBuffer<BUFFER_SIZE>,
    page: [u8; MAX_PAGE_SIZE],
    image: Option<ImageStatus>,
}

impl<S, M, D, W, P, E> Bootloader<S, M, D, W, P, E>
where
    S: SerialPort<E>,
    M: ProgramMemory<E>,
    D: DelayMs<u32>,
    W: Watchdog,
    P: Platform,
    E: Debug,
{
    pub fn new(
        port: S,
        memory: M,
        delay: D,
        watchdog: W,
        platform: P,
        config: BootConfig,
        options: Options,
    ) -> Self {
        Self {
            console: Console::new(port),
            memory,
            delay,
            watchdog,
            platform,
            options,
            config,
            session: Session::new(),
            line: LineBuffer::new(),
            page: [0xFF; MAX_PAGE_SIZE],
            image: None,
        }
    }

    pub fn state(&self) -> State {
        self.session.state()
    }

    /// Result of the last image check, if one has run
    pub fn image(&self) -> Option<ImageStatus> {
        self.image
    }

    pub fn serial(&mut self) -> &mut S {
        self.console.port()
    }

    pub fn memory(&mut self) -> &mut M {
        &mut self.memory
    }

    pub fn platform(&mut self) -> &mut P {
        &mut self.platform
    }

    /// Check the resident application and start it, unless the platform
    /// asks to stay in the bootloader.
    pub fn start(&mut self) -> Result<Option<ModeTransfer>, Error<E>> {
        let status = check_image(&mut self.memory, &mut self.watchdog, &self.config)?;
        self.image = Some(status);

        if status.is_valid() && !self.platform.stay_in_bootloader() {
            info!("Starting application");
            self.platform.request_mode_transfer(ModeTransfer::Application);
            return Ok(Some(ModeTransfer::Application));
        }

        info!(
            "Staying in bootloader at 0x{:04x} ({:?})",
            self.config.boot_address, status
        );
        Ok(None)
    }

    /// [`Bootloader::start`], then serve commands until one hands control
    /// elsewhere.
    pub fn run(&mut self) -> Result<ModeTransfer, Error<E>> {
        if let Some(transfer) = self.start()? {
            return Ok(transfer);
        }
        loop {
            if let Some(transfer) = self.poll()? {
                return Ok(transfer);
            }
        }
    }

    /// Collect and handle one line.
    pub fn poll(&mut self) -> Result<Option<ModeTransfer>, Error<E>> {
        loop {
            let ch = self
                .console
                .wait_char(&mut self.delay, &mut self.watchdog, &self.options)?;
            if self.session.echoes() {
                self.console.put(ch)?;
            }

            match self.line.push(ch) {
                LineStep::Pending => (),
                LineStep::TooLong => {
                    warn!("Line exceeds {} bytes", BUFFER_SIZE);
                    if self.session.is_ready() {
                        self.report(Err(Fault::TooLong))?;
                    }
                    return Ok(None);
                }
                LineStep::Line => {
                    let r = self.dispatch();
                    self.line.clear();
                    return r;
                }
            }
        }
    }

    fn dispatch(&mut self) -> Result<Option<ModeTransfer>, Error<E>> {
        let keyword = {
            let tokens = self.line.split::<MAX_CMD_SPLIT>();
            match tokens.first() {
                Some(t) => Keyword::parse(t),
                None => return Ok(None),
            }
        };

        if keyword == Some(Keyword::Bye) {
            self.session.end();
            info!("Client disconnected");
            return Ok(None);
        }
        if keyword != Some(Keyword::Hello) && !self.session.is_ready() {
            return Ok(None);
        }

        let outcome = match keyword {
            Some(Keyword::Hello) => self.hello(),
            Some(Keyword::Echo) => self.echo(),
            Some(Keyword::Reboot) => return self.reboot().map(Some),
            Some(Keyword::Flash) => self.flash(),
            _ => Fault::UnknownCommand.raise(),
        };

        match outcome {
            Ok(()) => self.report(Ok(()))?,
            Err(Error::Fault(fault)) => self.report(Err(fault))?,
            Err(e) => return Err(e),
        }
        Ok(None)
    }

    fn report(&mut self, outcome: Result<(), Fault>) -> Result<(), Error<E>> {
        if let Err(fault) = outcome {
            debug!("Command failed: {}", fault);
            self.console.emit(format_args!("{}\n", fault))?;
        }
        self.console.ready()
    }

    fn hello(&mut self) -> Result<(), Error<E>> {
        self.session.greet();
        info!("Client connected");

        let crc = match self.image {
            Some(ImageStatus::Valid) => "ok",
            _ => "error",
        };
        self.console.emit(format_args!(
            "hello\ndevice {} {}\ncpu {}\nbootaddr {}\npagesize {}\ncrc {}\n",
            BOOTLOADER_NAME,
            BOOTLOADER_VERSION,
            self.config.cpu,
            self.config.boot_address,
            self.config.page_size,
            crc
        ))
    }

    fn echo(&mut self) -> Result<(), Error<E>> {
        let tokens = self.line.split::<MAX_CMD_SPLIT>();
        let echo = match tokens.get(1..).unwrap_or_default() {
            [] => None,
            [value] => match *value {
                b"0" => Some(false),
                b"1" => Some(true),
                _ => return Fault::Parameter.raise(),
            },
            _ => return Fault::Parameter.raise(),
        };
        if let Some(echo) = echo {
            self.session.set_echo(echo);
        }
        self.console
            .emit(format_args!("echo {}\n", self.session.echo() as u8))
    }

    fn reboot(&mut self) -> Result<ModeTransfer, Error<E>> {
        info!("Rebooting");
        self.console.write_bytes(b"rebooting..\n")?;
        self.console.close()?;
        self.delay.delay_ms(MODE_TRANSFER_DELAY_MS);
        self.platform.request_mode_transfer(ModeTransfer::Application);
        Ok(ModeTransfer::Application)
    }

    fn flash(&mut self) -> Result<(), Error<E>> {
        let tokens = self.line.split::<MAX_CMD_SPLIT>();
        let (address, magic, data) = match &tokens[..] {
            [_, address, magic, data] => (*address, *magic, *data),
            _ => return Fault::Parameter.raise(),
        };

        let parse = |t: &[u8]| -> Result<u16, Error<E>> {
            codec::parse_number(t, WORD_DIGITS)
                .map(|v| v as u16)
                .map_err(|_| Error::Fault(Fault::Parameter))
        };
        let address = parse(address)?;
        let magic = parse(magic)?;

        selfflash::check_page_address(&self.config, address)?;

        let size = self.config.page_size as usize;
        let page = match self.page.get_mut(..size) {
            Some(p) => p,
            None => return Fault::Parameter.raise(),
        };
        codec::decode_block(data, page).map_err(|e| Error::Fault(Fault::Data(e)))?;

        selfflash::program_page(
            &mut self.memory,
            &mut self.watchdog,
            &self.options,
            &self.config,
            address,
            magic,
            &self.page[..size],
        )?;

        self.console.emit(format_args!("flash ok\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{self, MemoryOp};
    use crate::protocol::PG_MAGIC;
    use crate::selfflash::crc16;
    use core::convert::Infallible;

    type TestBootloader = Bootloader<
        mock::Serial,
        mock::Memory,
        mock::Delay,
        mock::Watchdog,
        mock::Platform,
        Infallible,
    >;

    fn bootloader(memory: mock::Memory, platform: mock::Platform) -> TestBootloader {
        let options = Options {
            response_timeout_ms: 10,
            ..Options::default()
        };
        Bootloader::new(
            mock::Serial::new(),
            memory,
            mock::Delay::new(),
            mock::Watchdog::new(),
            platform,
            BootConfig::atmega8(),
            options,
        )
    }

    fn staying(memory: mock::Memory) -> TestBootloader {
        let mut b = bootloader(memory, mock::Platform::staying());
        assert_eq!(b.start(), Ok(None));
        b
    }

    fn exchange(b: &mut TestBootloader, input: &str) -> String {
        b.serial().feed(input.as_bytes());
        while b.serial().pending() > 0 {
            b.poll().unwrap();
        }
        String::from_utf8(b.serial().take_output())
            .unwrap()
            .replace("\r\n", "\n")
    }

    fn payload(data: &[u8]) -> String {
        let mut text = [0u8; (MAX_PAGE_SIZE + 1) * 2];
        let len = codec::encode_block(data, &mut text).unwrap();
        String::from_utf8(text[..len].to_vec()).unwrap()
    }

    fn app() -> [u8; 200] {
        core::array::from_fn(|i| (i * 5) as u8)
    }

    #[test]
    fn valid_image_starts_application() {
        let config = BootConfig::atmega8();
        let mut b = bootloader(mock::Memory::with_image(&config, &app()), mock::Platform::new());
        assert_eq!(b.run(), Ok(ModeTransfer::Application));
        assert_eq!(b.platform().transfers(), &[ModeTransfer::Application]);
        assert!(b.serial().output().is_empty());
    }

    #[test]
    fn invalid_image_stays() {
        let config = BootConfig::atmega8();
        let mut b = bootloader(mock::Memory::erased(&config), mock::Platform::new());
        assert_eq!(b.start(), Ok(None));
        assert_eq!(b.image(), Some(ImageStatus::BadSize(0xFFFF)));
        assert!(b.platform().transfers().is_empty());

        assert_eq!(
            exchange(&mut b, "hello\n"),
            "hello\ndevice avrboot v1.0\ncpu atmega8\nbootaddr 7168\npagesize 64\n\
             crc error\nready\n"
        );
    }

    #[test]
    fn stay_latch_keeps_valid_image_waiting() {
        let config = BootConfig::atmega8();
        let mut b = staying(mock::Memory::with_image(&config, &app()));
        assert_eq!(b.image(), Some(ImageStatus::Valid));
        assert!(b.platform().transfers().is_empty());
        assert!(exchange(&mut b, "hello\n").contains("\ncrc ok\n"));
    }

    #[test]
    fn silent_until_hello() {
        let config = BootConfig::atmega8();
        let mut b = staying(mock::Memory::erased(&config));
        let line = format!("flash 0000 4321 {}\n", payload(&[0u8; 64]));
        assert_eq!(exchange(&mut b, &line), "");
        assert_eq!(exchange(&mut b, "reboot\n"), "");
        assert!(b.memory().ops().is_empty());
        assert_eq!(b.state(), State::Idle);
    }

    #[test]
    fn flash_pages_then_boot() {
        let config = BootConfig::atmega8();
        let mut b = staying(mock::Memory::erased(&config));
        exchange(&mut b, "hello\n");

        let image = app();
        for (i, page) in image.chunks(64).enumerate() {
            let line = format!("flashboot {:04x} {:04x} {}\n", i * 64, PG_MAGIC, payload(page));
            assert_eq!(exchange(&mut b, &line), "flash ok\nready\n");
        }
        assert_eq!(b.memory().read(0, 200), &image[..]);
        // Last page was short and padded
        assert_eq!(b.memory().read(200, 56), &[0xff; 56][..]);

        // Sign the image in the last application page
        let trailer = config.trailer_address() as usize;
        let mut last = [0xffu8; 64];
        last[60..62].copy_from_slice(&200u16.to_le_bytes());
        last[62..64].copy_from_slice(&crc16(&image).to_le_bytes());
        let line = format!("flash {:04x} 4321 {}\n", trailer - 60, payload(&last));
        assert_eq!(exchange(&mut b, &line), "flash ok\nready\n");

        let mut next = bootloader(
            mock::Memory::from_image(&config, b.memory().image().to_vec()),
            mock::Platform::new(),
        );
        assert_eq!(next.start(), Ok(Some(ModeTransfer::Application)));
    }

    #[test]
    fn flash_rejections() {
        let config = BootConfig::atmega8();
        let mut b = staying(mock::Memory::erased(&config));
        exchange(&mut b, "hello\n");
        let page = payload(&[0x55u8; 64]);

        let cases = [
            (format!("flash 0040 1234 {}\n", page), "flash error"),
            (format!("flash 0041 4321 {}\n", page), "address error"),
            (format!("flash 1c00 4321 {}\n", page), "address error"),
            (format!("flash ffc0 4321 {}\n", page), "address error"),
            (format!("flash 10000 4321 {}\n", page), "parameter error"),
            ("flash 0040 4321\n".to_string(), "parameter error"),
            (format!("flash 0040 4321 {} 00\n", page), "parameter error"),
            (format!("flash 0040 4321 {}\n", payload(&[0u8; 65])), "data error: too long"),
            (format!("flash 0040 4321 {}0\n", page), "data error: odd length"),
        ];
        for (line, reply) in cases.iter() {
            assert_eq!(exchange(&mut b, line), format!("{}\nready\n", reply));
        }
        assert!(b.memory().ops().is_empty());
    }

    #[test]
    fn corrupted_payload_is_rejected() {
        let config = BootConfig::atmega8();
        let mut b = staying(mock::Memory::erased(&config));
        exchange(&mut b, "hello\n");

        let mut page = payload(&[0x12u8; 64]);
        page.replace_range(4..5, "f");
        let line = format!("flash 0000 4321 {}\n", page);
        assert_eq!(
            exchange(&mut b, &line),
            "data error: checksum mismatch\nready\n"
        );
        assert!(b.memory().ops().is_empty());
    }

    #[test]
    fn programming_masks_interrupts() {
        let config = BootConfig::atmega8();
        let mut b = staying(mock::Memory::erased(&config));
        exchange(&mut b, "hello\n");
        let line = format!("flash 0080 4321 {}\n", payload(&[0u8; 64]));
        exchange(&mut b, &line);

        assert!(b.memory().ops().iter().all(|op| match op {
            MemoryOp::Erase { interrupts, .. } | MemoryOp::Write { interrupts, .. } => !interrupts,
            _ => true,
        }));
        assert!(b.memory().interrupts_enabled());
    }

    #[test]
    fn echo_and_unknown() {
        let config = BootConfig::atmega8();
        let mut b = staying(mock::Memory::erased(&config));
        exchange(&mut b, "hello\n");
        assert_eq!(exchange(&mut b, "echo\n"), "echo 0\nready\n");
        assert_eq!(exchange(&mut b, "echo 9\n"), "parameter error\nready\n");
        assert_eq!(exchange(&mut b, "avr connect\n"), "unknown command\nready\n");
        assert_eq!(exchange(&mut b, "echo 1\n"), "echo 1\nready\n");
        assert_eq!(exchange(&mut b, "foo\n"), "foo\nunknown command\nready\n");
    }

    #[test]
    fn tabs_separate_arguments() {
        let config = BootConfig::atmega8();
        let mut b = staying(mock::Memory::erased(&config));
        exchange(&mut b, "hello\n");
        assert_eq!(exchange(&mut b, "echo\t1\n"), "echo 1\nready\n");

        let line = format!("flash\t0040\t4321\t{}\n", payload(&[0x77u8; 64]));
        assert!(exchange(&mut b, &line).ends_with("flash ok\nready\n"));
        assert_eq!(b.memory().read(0x40, 64), &[0x77u8; 64][..]);
    }

    #[test]
    fn long_lines_are_dropped() {
        let config = BootConfig::atmega8();
        let mut b = staying(mock::Memory::erased(&config));
        exchange(&mut b, "hello\n");
        let line = format!("flash 0000 4321 {}\n", "0".repeat(BUFFER_SIZE));
        assert_eq!(exchange(&mut b, &line), "too long\nready\n");
        assert!(b.memory().ops().is_empty());
    }

    #[test]
    fn bye_and_reboot() {
        let config = BootConfig::atmega8();
        let mut b = staying(mock::Memory::erased(&config));
        exchange(&mut b, "hello\n");
        assert_eq!(exchange(&mut b, "NO CARRIER 0 ERROR 0\n"), "");
        assert_eq!(b.state(), State::Idle);
        assert_eq!(exchange(&mut b, "reboot\n"), "");

        exchange(&mut b, "hello\n");
        b.serial().feed(b"reboot\n");
        assert_eq!(b.poll(), Ok(Some(ModeTransfer::Application)));
        assert_eq!(b.serial().output(), b"rebooting..\r\n");
        assert_eq!(b.platform().transfers(), &[ModeTransfer::Application]);
    }
}
