//! Wire constants for the line protocol and the AVR serial programming
//! instruction set.

pub const PROGRAMMER_NAME: &str = "avrprog";
pub const PROGRAMMER_VERSION: &str = "v1.1";

pub const BOOTLOADER_NAME: &str = "avrboot";
pub const BOOTLOADER_VERSION: &str = "v1.0";

/// Largest token (or bootloader line) accepted, in bytes
pub const BUFFER_SIZE: usize = 640;

/// Maximum number of tokens the bootloader splits a line into
pub const MAX_CMD_SPLIT: usize = 5;

/// Largest flash page either engine will buffer
pub const MAX_PAGE_SIZE: usize = 256;

/// Number of flash bytes reported per `data` line
pub const READ_CHUNK: usize = 32;

/// Highest byte address reachable without extended addressing
pub const MAX_BYTE_ADDRESS: u32 = 0x1_FFFF;

/// Digits accepted for 24-bit byte addresses
pub const ADDRESS_DIGITS: usize = 6;
/// Digits accepted for 16-bit sizes, bootloader addresses and magic values
pub const WORD_DIGITS: usize = 4;
/// Digits accepted for fuse and lock values
pub const BYTE_DIGITS: usize = 2;

/// Magic value a self-flash request must carry
pub const PG_MAGIC: u16 = 0x4321;

pub const FUSE_WRITE_DELAY_MS: u32 = 10;
pub const PAGE_WRITE_DELAY_MS: u32 = 10;
pub const CHIP_ERASE_DELAY_MS: u32 = 20;
pub const MODE_TRANSFER_DELAY_MS: u32 = 10;

/// Reply byte expected in the third position of the programming enable frame
pub const ISP_SYNC: u8 = 0x53;

/// AVR serial programming instructions, first byte of each 4 byte frame
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Instruction {
    /// Programming enable, also the prefix of every write/erase instruction
    Enable = 0xAC,
    /// Read low byte of a program memory word
    ReadFlashLow = 0x20,
    /// Read high byte of a program memory word
    ReadFlashHigh = 0x28,
    /// Load low byte into the page buffer
    LoadPageLow = 0x40,
    /// Load high byte into the page buffer
    LoadPageHigh = 0x48,
    /// Commit the page buffer to program memory
    WritePage = 0x4C,
    /// Read a signature byte
    ReadSignature = 0x30,
    /// Read the oscillator calibration byte
    ReadCalibration = 0x38,
}

/// Second byte of the `Enable` prefixed instructions
pub const ENABLE_PROGRAMMING: u8 = 0x53;
pub const CHIP_ERASE: u8 = 0x80;

/// Non-volatile configuration bytes reachable through `avr fuse`
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Field {
    Low,
    High,
    Extended,
    Lock,
    Calibration,
}

impl Field {
    /// Report order for `avr fuse` without a field name
    pub const ALL: [Field; 5] = [
        Field::Low,
        Field::High,
        Field::Extended,
        Field::Lock,
        Field::Calibration,
    ];

    pub fn parse(token: &[u8]) -> Option<Self> {
        match token {
            b"low" => Some(Field::Low),
            b"high" => Some(Field::High),
            b"extend" => Some(Field::Extended),
            b"lock" => Some(Field::Lock),
            b"calib" => Some(Field::Calibration),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Field::Low => "low",
            Field::High => "high",
            Field::Extended => "extend",
            Field::Lock => "lock",
            Field::Calibration => "calib",
        }
    }

    /// Frame that reads the field, value is returned in the fourth byte
    pub fn read_frame(self) -> [u8; 4] {
        match self {
            Field::Low => [0x50, 0x00, 0x00, 0x00],
            Field::High => [0x58, 0x08, 0x00, 0x00],
            Field::Extended => [0x50, 0x08, 0x00, 0x00],
            Field::Lock => [0x58, 0x00, 0x00, 0x00],
            Field::Calibration => [Instruction::ReadCalibration as u8, 0x00, 0x00, 0x00],
        }
    }

    /// Frame that programs the field, `None` for read-only fields
    pub fn write_frame(self, value: u8) -> Option<[u8; 4]> {
        let op = match self {
            Field::Low => 0xA0,
            Field::High => 0xA8,
            Field::Extended => 0xA4,
            Field::Lock => 0xE0,
            Field::Calibration => return None,
        };
        Some([Instruction::Enable as u8, op, 0x00, value])
    }
}

/// First token of a line
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Keyword {
    Hello,
    Echo,
    Reboot,
    Bootloader,
    /// `NO CARRIER ...` from the radio module, or `bye` from the host
    Bye,
    Avr,
    /// Self-flash page write (`flash` or `flashboot`)
    Flash,
}

impl Keyword {
    pub fn parse(token: &[u8]) -> Option<Self> {
        match token {
            b"hello" => Some(Keyword::Hello),
            b"NO" | b"bye" => Some(Keyword::Bye),
            b"echo" => Some(Keyword::Echo),
            b"reboot" => Some(Keyword::Reboot),
            b"bootloader" => Some(Keyword::Bootloader),
            b"avr" => Some(Keyword::Avr),
            b"flash" | b"flashboot" => Some(Keyword::Flash),
            _ => None,
        }
    }
}

/// Second token of an `avr` line
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AvrCommand {
    Connect,
    Disconnect,
    Flash,
    Fuse,
}

impl AvrCommand {
    pub fn parse(token: &[u8]) -> Option<Self> {
        match token {
            b"connect" => Some(AvrCommand::Connect),
            b"disconnect" => Some(AvrCommand::Disconnect),
            b"flash" => Some(AvrCommand::Flash),
            b"fuse" => Some(AvrCommand::Fuse),
            _ => None,
        }
    }
}

/// Third token of an `avr flash` line
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FlashCommand {
    Erase,
    Read,
    Write,
}

impl FlashCommand {
    pub fn parse(token: &[u8]) -> Option<Self> {
        match token {
            b"erase" => Some(FlashCommand::Erase),
            b"read" => Some(FlashCommand::Read),
            b"write" => Some(FlashCommand::Write),
            _ => None,
        }
    }
}
