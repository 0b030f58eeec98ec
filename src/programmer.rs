//! Command engine of the ISP programmer.
//!
//! Lines are consumed one token at a time, so a payload is decoded
//! straight from the token buffer and a fault can be reported as soon as it
//! is detected; the rest of the line is then discarded.

use core::fmt::Debug;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::watchdog::Watchdog;

use crate::codec;
use crate::console::Console;
use crate::isp::{Handshake, Isp};
use crate::protocol::{
    AvrCommand, Field, FlashCommand, Keyword, ADDRESS_DIGITS, BUFFER_SIZE, BYTE_DIGITS,
    MAX_BYTE_ADDRESS, MAX_PAGE_SIZE, MODE_TRANSFER_DELAY_MS, PROGRAMMER_NAME, PROGRAMMER_VERSION,
    READ_CHUNK, WORD_DIGITS,
};
use crate::reader::{Step, TokenEnd, TokenReader};
use crate::session::{Session, State};
use crate::{Error, Fault, IspPort, ModeTransfer, Options, Platform, SerialPort};

pub struct Programmer<S, I, D, W, P, E> {
    console: Console<S, E>,
    isp: Isp<I, E>,
    delay: D,
    watchdog: W,
    platform: P,
    options: Options,
    session: Session,
    reader: TokenReader<BUFFER_SIZE>,
    line_open: bool,
    page: [u8; MAX_PAGE_SIZE],
}

impl<S, I, D, W, P, E> Programmer<S, I, D, W, P, E>
where
    S: SerialPort<E>,
    I: IspPort<E>,
    D: DelayMs<u32>,
    W: Watchdog,
    P: Platform,
    E: Debug,
{
    pub fn new(port: S, target: I, delay: D, watchdog: W, platform: P, options: Options) -> Self {
        Self {
            console: Console::new(port),
            isp: Isp::new(target),
            delay,
            watchdog,
            platform,
            options,
            session: Session::new(),
            reader: TokenReader::new(),
            line_open: false,
            page: [0xFF; MAX_PAGE_SIZE],
        }
    }

    pub fn state(&self) -> State {
        self.session.state()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn serial(&mut self) -> &mut S {
        self.console.port()
    }

    pub fn target(&mut self) -> &mut I {
        self.isp.port()
    }

    pub fn platform(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn watchdog(&self) -> &W {
        &self.watchdog
    }

    /// Serve commands until one of them hands control elsewhere.
    pub fn run(&mut self) -> Result<ModeTransfer, Error<E>> {
        loop {
            if let Some(transfer) = self.poll()? {
                return Ok(transfer);
            }
        }
    }

    /// Read and handle one line.
    ///
    /// Returns the mode transfer requested by `reboot` or `bootloader`.
    pub fn poll(&mut self) -> Result<Option<ModeTransfer>, Error<E>> {
        let keyword = match self.read_token() {
            Ok(()) if self.reader.token().is_empty() => return Ok(None),
            Ok(()) => Keyword::parse(self.reader.token()),
            Err(Error::Fault(fault)) => {
                self.conclude(Err(fault))?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        // The disconnect notification may cut a line short in any state
        if keyword == Some(Keyword::Bye) {
            self.drain()?;
            self.end_session()?;
            return Ok(None);
        }

        if keyword != Some(Keyword::Hello) && !self.session.is_ready() {
            self.drain()?;
            return Ok(None);
        }

        let outcome = match keyword {
            Some(Keyword::Hello) => self.hello(),
            Some(Keyword::Echo) => self.echo(),
            Some(Keyword::Avr) => self.avr(),
            Some(Keyword::Reboot) => {
                self.drain()?;
                return self.reboot().map(Some);
            }
            Some(Keyword::Bootloader) => {
                self.drain()?;
                return self.enter_bootloader().map(Some);
            }
            _ => Fault::UnknownCommand.raise(),
        };

        match outcome {
            Ok(()) => self.conclude(Ok(()))?,
            Err(Error::Fault(fault)) => self.conclude(Err(fault))?,
            Err(e) => return Err(e),
        }

        Ok(None)
    }

    fn receive(&mut self) -> Result<u8, Error<E>> {
        let ch = self
            .console
            .wait_char(&mut self.delay, &mut self.watchdog, &self.options)?;
        if self.session.echoes() {
            self.console.put(ch)?;
        }
        Ok(ch)
    }

    fn read_token(&mut self) -> Result<(), Error<E>> {
        loop {
            let ch = self.receive()?;
            match self.reader.push(ch) {
                Step::Pending => (),
                Step::Token(end) => {
                    self.line_open = end == TokenEnd::Separator;
                    return Ok(());
                }
                Step::Overflow => {
                    warn!("Token exceeds {} bytes", BUFFER_SIZE);
                    self.line_open = true;
                    return Fault::TooLong.raise();
                }
            }
        }
    }

    /// Pull the next argument of the current line, `false` once the line
    /// has ended.
    fn next_arg(&mut self) -> Result<bool, Error<E>> {
        if !self.line_open {
            return Ok(false);
        }
        self.read_token()?;
        Ok(!self.reader.token().is_empty())
    }

    fn expect_end(&mut self) -> Result<(), Error<E>> {
        if self.next_arg()? {
            return Fault::Parameter.raise();
        }
        Ok(())
    }

    fn token_number(&self, digits: usize) -> Result<u32, Error<E>> {
        codec::parse_number(self.reader.token(), digits).map_err(|_| Error::Fault(Fault::Parameter))
    }

    fn number_arg(&mut self, digits: usize) -> Result<u32, Error<E>> {
        if !self.next_arg()? {
            return Fault::Parameter.raise();
        }
        self.token_number(digits)
    }

    /// Discard input up to and including the next line feed.
    fn drain(&mut self) -> Result<(), Error<E>> {
        while self.line_open {
            if self.receive()? == b'\n' {
                self.line_open = false;
            }
        }
        self.reader.reset();
        Ok(())
    }

    /// Finish the line and report its outcome to a greeted client.
    fn conclude(&mut self, outcome: Result<(), Fault>) -> Result<(), Error<E>> {
        self.drain()?;

        if !self.session.is_ready() {
            return Ok(());
        }
        if let Err(fault) = outcome {
            debug!("Command failed: {}", fault);
            self.console.emit(format_args!("{}\n", fault))?;
        }
        self.console.ready()
    }

    fn release_target(&mut self) -> Result<(), Error<E>> {
        if self.session.is_connected() {
            self.isp.disconnect()?;
            self.session.set_connected(false);
        }
        Ok(())
    }

    fn end_session(&mut self) -> Result<(), Error<E>> {
        if self.session.end() {
            self.isp.disconnect()?;
        }
        info!("Client disconnected");
        Ok(())
    }

    fn hello(&mut self) -> Result<(), Error<E>> {
        self.session.greet();
        info!("Client connected");
        self.console.emit(format_args!(
            "hello\ndevice {} {}\n",
            PROGRAMMER_NAME, PROGRAMMER_VERSION
        ))
    }

    fn echo(&mut self) -> Result<(), Error<E>> {
        if self.next_arg()? {
            let echo = match self.reader.token() {
                b"0" => false,
                b"1" => true,
                _ => return Fault::Parameter.raise(),
            };
            self.expect_end()?;
            self.session.set_echo(echo);
        }
        self.console
            .emit(format_args!("echo {}\n", self.session.echo() as u8))
    }

    fn reboot(&mut self) -> Result<ModeTransfer, Error<E>> {
        info!("Rebooting");
        self.console.write_bytes(b"rebooting..\n")?;
        self.release_target()?;
        self.delay.delay_ms(MODE_TRANSFER_DELAY_MS);
        self.platform.request_mode_transfer(ModeTransfer::Application);
        Ok(ModeTransfer::Application)
    }

    fn enter_bootloader(&mut self) -> Result<ModeTransfer, Error<E>> {
        info!("Entering bootloader");
        self.console.write_bytes(b"starting bootloader..\n")?;
        self.release_target()?;
        self.session.end();
        self.console.close()?;
        self.platform.request_mode_transfer(ModeTransfer::Bootloader);
        Ok(ModeTransfer::Bootloader)
    }

    fn avr(&mut self) -> Result<(), Error<E>> {
        if !self.next_arg()? {
            let state = if self.session.is_connected() {
                "connected"
            } else {
                "disconnected"
            };
            return self.console.emit(format_args!("avr {}\n", state));
        }

        match AvrCommand::parse(self.reader.token()) {
            Some(AvrCommand::Connect) => {
                self.expect_end()?;
                self.connect()
            }
            Some(AvrCommand::Disconnect) => {
                self.expect_end()?;
                self.isp.disconnect()?;
                self.session.set_connected(false);
                self.console.emit(format_args!("avr disconnect ok\n"))
            }
            Some(_) if !self.session.is_connected() => Fault::NotConnected.raise(),
            Some(AvrCommand::Flash) => self.flash(),
            Some(AvrCommand::Fuse) => self.fuse(),
            None => Fault::UnknownCommand.raise(),
        }
    }

    fn connect(&mut self) -> Result<(), Error<E>> {
        // Always start the handshake from a released target
        self.release_target()?;

        match self.isp.connect(&mut self.delay, self.options.reset_delay_ms)? {
            Handshake::Connected(s) => {
                self.session.set_connected(true);
                self.console.emit(format_args!(
                    "avr connect ok\nsignature {:02x} {:02x} {:02x}\n",
                    s[0], s[1], s[2]
                ))
            }
            Handshake::Refused(byte) => self
                .console
                .emit(format_args!("avr connect error: {:02x}\n", byte)),
        }
    }

    fn flash(&mut self) -> Result<(), Error<E>> {
        if !self.next_arg()? {
            return Fault::Parameter.raise();
        }

        match FlashCommand::parse(self.reader.token()) {
            Some(FlashCommand::Erase) => {
                self.expect_end()?;
                self.isp.chip_erase(&mut self.delay)?;
                self.console.emit(format_args!("avr flash erase done\n"))
            }
            Some(FlashCommand::Read) => self.flash_read(),
            Some(FlashCommand::Write) => self.flash_write(),
            None => Fault::UnknownCommand.raise(),
        }
    }

    fn flash_read(&mut self) -> Result<(), Error<E>> {
        let from = self.number_arg(ADDRESS_DIGITS)?;
        let to = self.number_arg(ADDRESS_DIGITS)?;
        self.expect_end()?;

        if from > to {
            return Fault::Parameter.raise();
        }
        if to > MAX_BYTE_ADDRESS {
            return Fault::Address.raise();
        }

        debug!("Reading 0x{:06x}..=0x{:06x}", from, to);

        let mut chunk = [0u8; READ_CHUNK];
        let mut text = [0u8; (READ_CHUNK + 1) * 2];
        let mut address = from;

        while address <= to {
            self.watchdog.feed();

            let count = self.isp.read_chunk(address, to, &mut chunk)?;
            let len = codec::encode_block(&chunk[..count], &mut text)
                .map_err(|e| Error::Fault(Fault::Data(e)))?;

            self.console.emit(format_args!("data {:06x} ", address))?;
            self.console.write_bytes(&text[..len])?;
            self.console.put(b'\n')?;

            address += count as u32;
        }

        Ok(())
    }

    fn flash_write(&mut self) -> Result<(), Error<E>> {
        let size = self.number_arg(WORD_DIGITS)? as usize;
        let address = self.number_arg(ADDRESS_DIGITS)?;

        if !size.is_power_of_two() || !(2..=MAX_PAGE_SIZE).contains(&size) {
            return Fault::Parameter.raise();
        }
        if address as usize % size != 0 || address as usize + size > MAX_BYTE_ADDRESS as usize + 1
        {
            return Fault::Address.raise();
        }
        if !self.next_arg()? {
            return Fault::Parameter.raise();
        }

        // Nothing reaches the target until the whole page has been verified
        codec::decode_block(self.reader.token(), &mut self.page[..size])
            .map_err(|e| Error::Fault(Fault::Data(e)))?;
        self.expect_end()?;

        debug!("Writing {} byte page at 0x{:06x}", size, address);
        self.isp
            .write_page(address, &self.page[..size], &mut self.delay)?;

        self.console.emit(format_args!("avr flash write done\n"))
    }

    fn fuse(&mut self) -> Result<(), Error<E>> {
        if !self.next_arg()? {
            for field in Field::ALL.iter() {
                self.report_field(*field)?;
            }
            return Ok(());
        }

        let field = match Field::parse(self.reader.token()) {
            Some(f) => f,
            None => return Fault::UnknownCommand.raise(),
        };

        if self.next_arg()? {
            let value = self.token_number(BYTE_DIGITS)? as u8;
            self.expect_end()?;
            if !self.isp.write_field(field, value, &mut self.delay)? {
                return Fault::Parameter.raise();
            }
        }

        // Always read back, the host compares against what it sent
        self.report_field(field)
    }

    fn report_field(&mut self, field: Field) -> Result<(), Error<E>> {
        let value = self.isp.read_field(field)?;
        self.console
            .emit(format_args!("avr fuse {} {:02x}\n", field.name(), value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock;
    use core::convert::Infallible;

    type TestProgrammer = Programmer<
        mock::Serial,
        mock::Target,
        mock::Delay,
        mock::Watchdog,
        mock::Platform,
        Infallible,
    >;

    fn programmer(target: mock::Target) -> TestProgrammer {
        let options = Options {
            response_timeout_ms: 10,
            ..Options::default()
        };
        Programmer::new(
            mock::Serial::new(),
            target,
            mock::Delay::new(),
            mock::Watchdog::new(),
            mock::Platform::new(),
            options,
        )
    }

    /// Send complete lines and collect the reply with line endings
    /// normalised.
    fn exchange(p: &mut TestProgrammer, input: &str) -> String {
        p.serial().feed(input.as_bytes());
        while p.serial().pending() > 0 {
            p.poll().unwrap();
        }
        String::from_utf8(p.serial().take_output())
            .unwrap()
            .replace("\r\n", "\n")
    }

    fn connected(target: mock::Target) -> TestProgrammer {
        let mut p = programmer(target);
        exchange(&mut p, "hello\n");
        let reply = exchange(&mut p, "avr connect\n");
        assert!(reply.starts_with("avr connect ok\n"), "{}", reply);
        p
    }

    fn payload(data: &[u8]) -> String {
        let mut text = [0u8; (MAX_PAGE_SIZE + 1) * 2];
        let len = codec::encode_block(data, &mut text).unwrap();
        String::from_utf8(text[..len].to_vec()).unwrap()
    }

    #[test]
    fn ignores_everything_before_hello() {
        let mut p = programmer(mock::Target::atmega8());
        assert_eq!(exchange(&mut p, "avr connect\necho 1\nfoo\n"), "");
        assert_eq!(p.state(), State::Idle);
        assert!(p.target().frames().is_empty());

        assert_eq!(
            exchange(&mut p, "hello\n"),
            "hello\ndevice avrprog v1.1\nready\n"
        );
        assert_eq!(p.state(), State::Ready);
    }

    #[test]
    fn carriage_returns_and_blank_lines() {
        let mut p = programmer(mock::Target::atmega8());
        assert_eq!(
            exchange(&mut p, "\r\n  \nhello\r\n"),
            "hello\ndevice avrprog v1.1\nready\n"
        );
        assert_eq!(exchange(&mut p, "\n"), "");
    }

    #[test]
    fn unknown_commands() {
        let mut p = programmer(mock::Target::atmega8());
        exchange(&mut p, "hello\n");
        assert_eq!(
            exchange(&mut p, "frobnicate 1 2 3\n"),
            "unknown command\nready\n"
        );
        assert_eq!(exchange(&mut p, "avr jump\n"), "unknown command\nready\n");
        assert_eq!(exchange(&mut p, "Hello\n"), "unknown command\nready\n");
    }

    #[test]
    fn echo_flag() {
        let mut p = programmer(mock::Target::atmega8());
        exchange(&mut p, "hello\n");
        assert_eq!(exchange(&mut p, "echo\n"), "echo 0\nready\n");
        assert_eq!(exchange(&mut p, "echo 1\n"), "echo 1\nready\n");
        assert!(p.session().echoes());
        // Received characters now come back ahead of the reply
        assert_eq!(exchange(&mut p, "echo\n"), "echo\necho 1\nready\n");
        assert_eq!(exchange(&mut p, "echo 2\n"), "echo 2\nparameter error\nready\n");
    }

    #[test]
    fn connect_and_disconnect() {
        let mut p = programmer(mock::Target::atmega8());
        exchange(&mut p, "hello\n");
        assert_eq!(exchange(&mut p, "avr\n"), "avr disconnected\nready\n");
        assert_eq!(
            exchange(&mut p, "avr connect\n"),
            "avr connect ok\nsignature 1e 93 07\nready\n"
        );
        assert_eq!(p.state(), State::Connected);
        assert_eq!(exchange(&mut p, "avr\n"), "avr connected\nready\n");

        assert_eq!(
            exchange(&mut p, "avr disconnect\n"),
            "avr disconnect ok\nready\n"
        );
        assert_eq!(p.state(), State::Ready);
        assert!(!p.target().is_enabled());
        assert_eq!(p.target().reset_history().last(), Some(&true));

        // Releasing an already released target is harmless
        assert_eq!(
            exchange(&mut p, "avr disconnect\n"),
            "avr disconnect ok\nready\n"
        );
    }

    #[test]
    fn refused_handshake() {
        let mut target = mock::Target::atmega8();
        target.refuse_enable();
        let mut p = programmer(target);
        exchange(&mut p, "hello\n");

        assert_eq!(
            exchange(&mut p, "avr connect\n"),
            "avr connect error: 00\nready\n"
        );
        assert_eq!(p.state(), State::Ready);
        assert!(!p.target().is_enabled());
        assert_eq!(p.target().reset_history().last(), Some(&true));
    }

    #[test]
    fn target_commands_need_a_connection() {
        let mut p = programmer(mock::Target::atmega8());
        exchange(&mut p, "hello\n");

        for line in &[
            "avr flash erase\n",
            "avr flash read 000000 00001f\n",
            "avr flash write 40 0000 ffff\n",
            "avr fuse low 12\n",
        ] {
            assert_eq!(exchange(&mut p, line), "not connected\nready\n");
        }
        assert!(p.target().frames().is_empty());
    }

    #[test]
    fn page_write() {
        let mut p = connected(mock::Target::new(2048, 16, [0x1e, 0x91, 0x0a]));
        let data: [u8; 16] = core::array::from_fn(|i| 0x30 + i as u8);

        let line = format!("avr flash write 10 0020 {}\n", payload(&data));
        assert_eq!(exchange(&mut p, &line), "avr flash write done\nready\n");
        assert_eq!(&p.target().flash()[0x20..0x30], &data[..]);
        assert_eq!(p.target().page_writes(), &[0x20u32]);
    }

    #[test]
    fn short_payload_is_padded() {
        let mut p = connected(mock::Target::new(2048, 16, [0x1e, 0x91, 0x0a]));
        p.target().load(0x10, &[0u8; 16]);

        let line = format!("avr flash write 10 0010 {}\n", payload(&[1, 2, 3]));
        assert_eq!(exchange(&mut p, &line), "avr flash write done\nready\n");
        assert_eq!(&p.target().flash()[0x10..0x14], &[1, 2, 3, 0xff]);
        assert_eq!(&p.target().flash()[0x1c..0x20], &[0xff; 4]);
    }

    #[test]
    fn corrupted_payload_never_reaches_the_target() {
        let mut p = connected(mock::Target::new(2048, 16, [0x1e, 0x91, 0x0a]));
        let before = p.target().write_count();

        let data: [u8; 16] = core::array::from_fn(|i| 0x30 + i as u8);
        let mut text = payload(&data);
        // Flip one nibble
        text.replace_range(0..1, "2");

        let line = format!("avr flash write 10 0020 {}\n", text);
        assert_eq!(
            exchange(&mut p, &line),
            "data error: checksum mismatch\nready\n"
        );

        let line = format!("avr flash write 10 0020 {}x\n", &text[..text.len() - 1]);
        assert_eq!(exchange(&mut p, &line), "data error: invalid digit\nready\n");

        let line = format!("avr flash write 10 0020 {}\n", payload(&[0u8; 17]));
        assert_eq!(exchange(&mut p, &line), "data error: too long\nready\n");

        assert_eq!(p.target().write_count(), before);
        assert!(p.target().page_writes().is_empty());
    }

    #[test]
    fn page_write_parameters() {
        let mut p = connected(mock::Target::atmega8());
        let before = p.target().write_count();
        let page = payload(&[0u8; 16]);

        let cases = [
            ("avr flash write 10 0028", "address error"),
            ("avr flash write 10 1fff8", "address error"),
            ("avr flash write 0c 0000", "parameter error"),
            ("avr flash write 200 0000", "parameter error"),
            ("avr flash write 1 0000", "parameter error"),
            ("avr flash write 10 zz", "parameter error"),
            ("avr flash write 10 1000000", "parameter error"),
        ];
        for (command, reply) in cases.iter() {
            let line = format!("{} {}\n", command, page);
            assert_eq!(exchange(&mut p, &line), format!("{}\nready\n", reply));
        }

        assert_eq!(
            exchange(&mut p, "avr flash write 10 0000\n"),
            "parameter error\nready\n"
        );
        let line = format!("avr flash write 10 0000 {} extra\n", page);
        assert_eq!(exchange(&mut p, &line), "parameter error\nready\n");

        assert_eq!(p.target().write_count(), before);
    }

    #[test]
    fn flash_read_lines_carry_checksums() {
        let mut target = mock::Target::atmega8();
        let image: [u8; 64] = core::array::from_fn(|i| (i * 3) as u8);
        target.load(0, &image);
        let mut p = connected(target);

        let reply = exchange(&mut p, "avr flash read 000000 00001f\n");
        let lines: Vec<&str> = reply.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], "ready");

        let fields: Vec<&str> = lines[0].split(' ').collect();
        assert_eq!(&fields[..2], &["data", "000000"]);
        let mut out = [0u8; READ_CHUNK];
        assert_eq!(codec::decode_block(fields[2].as_bytes(), &mut out), Ok(32));
        assert_eq!(&out[..], &image[..32]);
    }

    #[test]
    fn flash_read_spans_chunks() {
        let mut target = mock::Target::atmega8();
        let image: [u8; 64] = core::array::from_fn(|i| i as u8);
        target.load(0, &image);
        let mut p = connected(target);

        assert_eq!(
            exchange(&mut p, "avr flash read 1e 21\n"),
            "data 00001e 1e1f01\ndata 000020 202101\nready\n"
        );

        let reply = exchange(&mut p, "avr flash read 000005 000044\n");
        let data: Vec<&str> = reply.lines().filter(|l| l.starts_with("data")).collect();
        assert_eq!(data.len(), 3);
        for line in data {
            let hex = line.rsplit(' ').next().unwrap();
            let mut out = [0u8; READ_CHUNK];
            assert!(codec::decode_block(hex.as_bytes(), &mut out).is_ok());
        }

        assert_eq!(
            exchange(&mut p, "avr flash read 20 10\n"),
            "parameter error\nready\n"
        );
        assert_eq!(
            exchange(&mut p, "avr flash read 0 20000\n"),
            "address error\nready\n"
        );
    }

    #[test]
    fn long_reads_keep_the_watchdog_fed() {
        let mut p = connected(mock::Target::atmega8());
        let before = p.watchdog().feeds();

        let command = "avr flash read 0 1fff\n";
        let reply = exchange(&mut p, command);
        assert_eq!(reply.lines().filter(|l| l.starts_with("data")).count(), 256);

        // one feed per received character plus one per emitted chunk
        let fed = (p.watchdog().feeds() - before) as usize;
        assert!(fed >= command.len() + 256, "{}", fed);
    }

    #[test]
    fn fuses() {
        let mut p = connected(mock::Target::atmega8());

        assert_eq!(exchange(&mut p, "avr fuse high\n"), "avr fuse high d9\nready\n");
        assert_eq!(exchange(&mut p, "avr fuse high c9\n"), "avr fuse high c9\nready\n");
        assert_eq!(exchange(&mut p, "avr fuse lock 3c\n"), "avr fuse lock 3c\nready\n");

        let before = p.target().write_count();
        assert_eq!(exchange(&mut p, "avr fuse low zz\n"), "parameter error\nready\n");
        assert_eq!(exchange(&mut p, "avr fuse low 123\n"), "parameter error\nready\n");
        assert_eq!(exchange(&mut p, "avr fuse calib 00\n"), "parameter error\nready\n");
        assert_eq!(exchange(&mut p, "avr fuse fusel\n"), "unknown command\nready\n");
        assert_eq!(p.target().write_count(), before);

        assert_eq!(
            exchange(&mut p, "avr fuse\n"),
            "avr fuse low e1\navr fuse high c9\navr fuse extend ff\n\
             avr fuse lock 3c\navr fuse calib a5\nready\n"
        );
    }

    #[test]
    fn chip_erase() {
        let mut target = mock::Target::atmega8();
        target.load(0, &[0u8; 64]);
        let mut p = connected(target);

        assert_eq!(
            exchange(&mut p, "avr flash erase\n"),
            "avr flash erase done\nready\n"
        );
        assert!(p.target().flash().iter().all(|b| *b == 0xff));
    }

    #[test]
    fn oversized_token_is_reported() {
        let mut p = connected(mock::Target::atmega8());

        let line = format!("avr flash write 10 0000 {}\n", "0".repeat(BUFFER_SIZE + 10));
        assert_eq!(exchange(&mut p, &line), "too long\nready\n");

        let line = format!("{} hello\n", "x".repeat(BUFFER_SIZE * 2));
        assert_eq!(exchange(&mut p, &line), "too long\nready\n");

        assert_eq!(exchange(&mut p, "echo\n"), "echo 0\nready\n");
    }

    #[test]
    fn disconnect_notification_drains_and_releases() {
        let mut p = connected(mock::Target::atmega8());

        assert_eq!(exchange(&mut p, "NO CARRIER 0 ERROR 0\n"), "");
        assert_eq!(p.state(), State::Idle);
        assert!(!p.target().is_enabled());
        assert_eq!(p.target().reset_history().last(), Some(&true));

        // Back to ignoring everything but hello
        assert_eq!(exchange(&mut p, "avr\n"), "");
        exchange(&mut p, "hello\n");
        assert_eq!(exchange(&mut p, "bye\n"), "");
        assert_eq!(p.state(), State::Idle);
    }

    #[test]
    fn reboot() {
        let mut p = connected(mock::Target::atmega8());
        p.serial().feed(b"reboot\n");
        assert_eq!(p.poll(), Ok(Some(ModeTransfer::Application)));
        assert_eq!(p.serial().output(), b"rebooting..\r\n");
        assert_eq!(p.platform().transfers(), &[ModeTransfer::Application]);
        assert!(!p.target().is_enabled());
    }

    #[test]
    fn enter_bootloader() {
        let mut p = connected(mock::Target::atmega8());
        p.serial().feed(b"bootloader\n");
        assert_eq!(p.run(), Ok(ModeTransfer::Bootloader));
        assert_eq!(p.serial().output(), b"starting bootloader..\r\n");
        assert!(p.serial().is_closed());
        assert_eq!(p.platform().transfers(), &[ModeTransfer::Bootloader]);
        assert!(!p.target().is_enabled());
        assert_eq!(p.state(), State::Idle);
    }

    #[test]
    fn trailing_arguments_are_rejected() {
        let mut p = connected(mock::Target::atmega8());
        assert_eq!(
            exchange(&mut p, "avr disconnect now\n"),
            "parameter error\nready\n"
        );
        assert_eq!(p.state(), State::Connected);
    }

    #[test]
    fn times_out_without_input() {
        let mut p = programmer(mock::Target::atmega8());
        assert_eq!(p.poll(), Err(Error::ResponseTimeout));
    }
}
