//! Turns the received character stream into tokens.
//!
//! [`TokenReader`] pulls one token at a time, which lets the programmer parse
//! arguments as they arrive. [`LineBuffer`] collects a whole line first and
//! splits it afterwards, which is all the bootloader needs.

use heapless::Vec;

/// How a token was terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenEnd {
    /// A blank follows, the line continues
    Separator,
    /// The line feed was consumed with this token
    EndOfLine,
}

/// Result of feeding one character to a [`TokenReader`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Pending,
    Token(TokenEnd),
    /// The token did not fit; the partial token was discarded and the
    /// line is still open
    Overflow,
}

/// Token separators shared by both readers
pub fn is_blank(ch: u8) -> bool {
    matches!(ch, b' ' | b'\t' | b'\r')
}

pub struct TokenReader<const N: usize> {
    buffer: [u8; N],
    count: usize,
    complete: bool,
}

impl<const N: usize> TokenReader<N> {
    pub fn new() -> Self {
        Self {
            buffer: [0u8; N],
            count: 0,
            complete: false,
        }
    }

    /// Forget any partially collected token.
    pub fn reset(&mut self) {
        self.count = 0;
        self.complete = false;
    }

    /// Process one received character.
    pub fn push(&mut self, ch: u8) -> Step {
        if self.complete {
            self.reset();
        }

        if ch == b'\n' {
            self.complete = true;
            return Step::Token(TokenEnd::EndOfLine);
        }

        if is_blank(ch) {
            if self.count == 0 {
                return Step::Pending;
            }
            self.complete = true;
            return Step::Token(TokenEnd::Separator);
        }

        if self.count == N {
            self.reset();
            return Step::Overflow;
        }

        self.buffer[self.count] = ch;
        self.count += 1;
        Step::Pending
    }

    /// Text of the last completed token, empty while one is in progress.
    pub fn token(&self) -> &[u8] {
        if self.complete {
            &self.buffer[..self.count]
        } else {
            &[]
        }
    }
}

impl<const N: usize> Default for TokenReader<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of feeding one character to a [`LineBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStep {
    Pending,
    Line,
    TooLong,
}

pub struct LineBuffer<const N: usize> {
    buffer: [u8; N],
    count: usize,
    overflow: bool,
}

impl<const N: usize> LineBuffer<N> {
    pub fn new() -> Self {
        Self {
            buffer: [0u8; N],
            count: 0,
            overflow: false,
        }
    }

    pub fn clear(&mut self) {
        self.count = 0;
        self.overflow = false;
    }

    /// Process one received character. A completed line stays available
    /// through [`LineBuffer::split`] until the next call.
    pub fn push(&mut self, ch: u8) -> LineStep {
        match ch {
            b'\r' => LineStep::Pending,
            b'\n' if self.overflow => {
                self.clear();
                LineStep::TooLong
            }
            b'\n' if self.count == 0 => LineStep::Pending,
            b'\n' => LineStep::Line,
            _ if self.count == N => {
                self.overflow = true;
                LineStep::Pending
            }
            _ => {
                self.buffer[self.count] = ch;
                self.count += 1;
                LineStep::Pending
            }
        }
    }

    pub fn line(&self) -> &[u8] {
        &self.buffer[..self.count]
    }

    /// Split the line on blanks into at most `M` tokens. Once `M` tokens
    /// have been found the last one runs to the end of the line.
    pub fn split<const M: usize>(&self) -> Vec<&[u8], M> {
        let line = self.line();
        let mut tokens = Vec::new();
        let mut start = None;

        for (i, &ch) in line.iter().enumerate() {
            match (is_blank(ch), start) {
                (true, Some(s)) => {
                    if tokens.push(&line[s..i]).is_err() {
                        return tokens;
                    }
                    start = None;
                }
                (false, None) => {
                    if tokens.len() + 1 == M {
                        let _ = tokens.push(&line[i..]);
                        return tokens;
                    }
                    start = Some(i);
                }
                _ => (),
            }
        }

        if let Some(s) = start {
            let _ = tokens.push(&line[s..]);
        }
        tokens
    }
}

impl<const N: usize> Default for LineBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}
