//! Host side character I/O.

use core::fmt;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::watchdog::Watchdog;

use crate::{Error, Options, SerialPort};

pub struct Console<S, E> {
    port: S,
    error: Option<E>,
}

impl<S, E> Console<S, E>
where
    S: SerialPort<E>,
{
    pub fn new(port: S) -> Self {
        Self {
            port,
            error: None,
        }
    }

    /// Block until a character arrives.
    ///
    /// The watchdog is fed on every poll. With a non-zero
    /// `response_timeout_ms` this gives up with [`Error::ResponseTimeout`].
    pub fn wait_char<D, W>(
        &mut self,
        delay: &mut D,
        watchdog: &mut W,
        options: &Options,
    ) -> Result<u8, Error<E>>
    where
        D: DelayMs<u32>,
        W: Watchdog,
    {
        let mut t = 0u32;

        loop {
            watchdog.feed();

            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(ch) => return Ok(ch),
            };

            if options.poll_delay_ms > 0 {
                delay.delay_ms(options.poll_delay_ms);
            }

            if options.response_timeout_ms > 0 {
                t = t.saturating_add(options.poll_delay_ms.max(1));
                if t > options.response_timeout_ms {
                    return Err(Error::ResponseTimeout);
                }
            }
        }
    }

    /// Send one character, preceding every line feed with a carriage return.
    pub fn put(&mut self, ch: u8) -> Result<(), E> {
        if ch == b'\n' {
            block!(self.port.write(b'\r'))?;
        }
        block!(self.port.write(ch))
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), E> {
        for &b in bytes {
            self.put(b)?;
        }
        Ok(())
    }

    /// Render formatted status text.
    pub fn emit(&mut self, args: fmt::Arguments) -> Result<(), Error<E>> {
        match fmt::write(self, args) {
            Ok(()) => Ok(()),
            Err(_) => Err(self.error.take().map(Error::Serial).unwrap_or(Error::Format)),
        }
    }

    /// Send the `ready` marker that ends every handled command.
    pub fn ready(&mut self) -> Result<(), Error<E>> {
        self.write_bytes(b"ready\n")?;
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), E> {
        self.port.close()
    }

    pub fn port(&mut self) -> &mut S {
        &mut self.port
    }

    pub fn release(self) -> S {
        self.port
    }
}

impl<S, E> fmt::Write for Console<S, E>
where
    S: SerialPort<E>,
{
    fn write_str(&mut self, s: &str) -> fmt::Result {
        match self.write_bytes(s.as_bytes()) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.error = Some(e);
                Err(fmt::Error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock;

    #[test]
    fn line_feeds_get_carriage_returns() {
        let mut c = Console::new(mock::Serial::new());
        c.emit(format_args!("echo {}\n", 1)).unwrap();
        c.ready().unwrap();
        assert_eq!(c.release().output(), b"echo 1\r\nready\r\n");
    }

    #[test]
    fn wait_char_times_out_and_feeds_watchdog() {
        let mut c = Console::new(mock::Serial::new());
        let mut delay = mock::Delay::new();
        let mut watchdog = mock::Watchdog::new();
        let options = Options {
            response_timeout_ms: 5,
            poll_delay_ms: 1,
            ..Options::default()
        };

        c.port().feed(b"x");
        assert_eq!(c.wait_char(&mut delay, &mut watchdog, &options), Ok(b'x'));
        assert_eq!(
            c.wait_char(&mut delay, &mut watchdog, &options),
            Err(Error::ResponseTimeout)
        );
        assert!(watchdog.feeds() > 5);
        assert_eq!(delay.elapsed_ms(), 6);
    }
}
