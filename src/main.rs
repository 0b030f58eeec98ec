#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger, WriteLogger};

use std::fs;
use std::io::{self, ErrorKind as IoErrorKind};
use std::path::{Path, PathBuf};

use linux_embedded_hal::Delay;

use avrprog::linux::{
    self, FileMemory, LinuxPlatform, NoWatchdog, Simulated, SpiTarget, Stdout, StreamSerial,
};
use avrprog::client::{self, Client, Cpu, DeviceKind, Writer};
use avrprog::protocol::{Field, MAX_PAGE_SIZE};
use avrprog::rx::{BufferedSerial, RxQueue};
use avrprog::selfflash::MIN_IMAGE_SIZE;
use avrprog::{BootConfig, Bootloader, Error, ModeTransfer, Options, Programmer, SerialPort};

/// Bytes buffered between the stdin reader and the command loop
const STDIN_QUEUE: usize = 1024;

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to serve commands on, `-` for stdin/stdout
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    #[structopt(subcommand)]
    mode: Mode,

    #[structopt(flatten)]
    options: Options,

    /// Give up waiting for a reply line after this many milliseconds
    #[structopt(long, default_value = "500")]
    reply_timeout_ms: u32,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Mode {
    /// Serve the ISP programmer protocol
    Programmer {
        /// SPI device wired to the target
        #[structopt(long, default_value = "/dev/spidev0.0")]
        spi: String,

        /// sysfs GPIO number driving the target reset line
        #[structopt(long, default_value = "25")]
        reset_gpio: u64,

        /// SPI clock, keep below a quarter of the target clock
        #[structopt(long, default_value = "100000")]
        spi_speed: u32,

        /// Program an in-memory ATmega8 instead of real hardware
        #[structopt(long)]
        simulate: bool,
    },
    /// Serve the bootloader protocol over an image file
    Bootloader {
        /// Flash image, created on the first page write
        #[structopt(long, parse(from_os_str))]
        image: PathBuf,

        #[structopt(flatten)]
        layout: Layout,

        /// Do not start a valid application
        #[structopt(long)]
        stay: bool,
    },
    /// Write an image through a programmer or a bootloader
    Flash {
        #[structopt(parse(from_os_str))]
        image: PathBuf,

        /// Expected target CPU
        #[structopt(long)]
        cpu: Option<String>,

        /// Hand over to the bootloader and write a signed image through it
        #[structopt(long)]
        bootloader: bool,

        /// Erase the chip before writing
        #[structopt(long)]
        erase: bool,

        /// Read the image back after writing
        #[structopt(long)]
        verify: bool,
    },
    /// Compare target flash against an image
    Verify {
        #[structopt(parse(from_os_str))]
        image: PathBuf,

        #[structopt(long)]
        cpu: Option<String>,
    },
    /// Read target flash into a file, or print it
    Dump {
        /// First address (hex)
        #[structopt(long, default_value = "0", parse(try_from_str = parse_address))]
        from: u32,

        /// Last address (hex), the end of flash by default
        #[structopt(long, parse(try_from_str = parse_address))]
        to: Option<u32>,

        #[structopt(long, parse(from_os_str))]
        output: Option<PathBuf>,
    },
    /// Erase the target chip
    Erase,
    /// Read fuse and lock bytes, or program one of them
    Fuse {
        /// low, high, extend, lock or calib, all of them by default
        field: Option<String>,

        /// Value to program (hex)
        #[structopt(parse(try_from_str = parse_byte))]
        value: Option<u8>,
    },
    /// Restart the device into its application
    Reboot,
    /// Pad an application image and append its size and CRC trailer
    Sign {
        #[structopt(parse(from_os_str))]
        input: PathBuf,

        #[structopt(parse(from_os_str))]
        output: PathBuf,

        #[structopt(flatten)]
        layout: Layout,
    },
}

#[derive(Clone, Debug, StructOpt)]
pub struct Layout {
    /// Byte address of the bootloader (hex)
    #[structopt(long, default_value = "1c00", parse(try_from_str = parse_hex))]
    boot_address: u16,

    /// Self-programming page size in bytes
    #[structopt(long, default_value = "64")]
    page_size: u16,
}

fn parse_hex(s: &str) -> Result<u16, std::num::ParseIntError> {
    u16::from_str_radix(s.trim_start_matches("0x"), 16)
}

fn parse_address(s: &str) -> Result<u32, std::num::ParseIntError> {
    u32::from_str_radix(s.trim_start_matches("0x"), 16)
}

fn parse_byte(s: &str) -> Result<u8, std::num::ParseIntError> {
    u8::from_str_radix(s.trim_start_matches("0x"), 16)
}

impl Layout {
    fn config(&self) -> anyhow::Result<BootConfig> {
        anyhow::ensure!(
            self.page_size >= 2
                && self.page_size.is_power_of_two()
                && (self.page_size as usize) <= MAX_PAGE_SIZE,
            "page size must be a power of two up to {}",
            MAX_PAGE_SIZE
        );
        anyhow::ensure!(
            self.boot_address % self.page_size == 0 && self.boot_address > MIN_IMAGE_SIZE,
            "boot address must be page aligned"
        );

        Ok(BootConfig {
            boot_address: self.boot_address,
            page_size: self.page_size,
            ..BootConfig::atmega8()
        })
    }
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger, keeping stdout clean when it carries the protocol
    let _ = if o.port == "-" {
        WriteLogger::init(o.log_level, Config::default(), io::stderr())
    } else {
        SimpleLogger::init(o.log_level, Config::default())
    };

    let r = match &o.mode {
        Mode::Sign {
            input,
            output,
            layout,
        } => sign(input, output, layout),
        Mode::Programmer { .. } | Mode::Bootloader { .. } if o.port == "-" => serve_stdio(&o),
        Mode::Programmer { .. } | Mode::Bootloader { .. } => {
            linux::open_serial(&o.port, o.baud).and_then(|port| serve(port, &o))
        }
        _ if o.port == "-" => Err(anyhow::anyhow!("device commands need a serial port")),
        _ => linux::open_serial(&o.port, o.baud).and_then(|port| {
            let client = Client::new(port, Delay {}, o.reply_timeout_ms);
            drive(client, &o.mode)
        }),
    };

    if let Err(e) = r {
        error!("{:?}", e);
        std::process::exit(1);
    }
}

fn sign(input: &Path, output: &Path, layout: &Layout) -> anyhow::Result<()> {
    let config = layout.config()?;
    let app = fs::read(input)?;
    let image = signed(&app, &config)?;
    fs::write(output, &image)?;

    info!("Signed {} bytes into {}", app.len(), output.display());
    Ok(())
}

fn signed(app: &[u8], config: &BootConfig) -> anyhow::Result<Vec<u8>> {
    client::sign_image(app, config).ok_or_else(|| {
        anyhow::anyhow!(
            "image of {} bytes does not fit between 0x{:04x} and 0x{:04x}",
            app.len(),
            MIN_IMAGE_SIZE,
            config.trailer_address()
        )
    })
}

type HostClient = Client<linux_embedded_hal::Serial, Delay, IoErrorKind>;

/// Run one device command through a connected programmer or bootloader
fn drive(mut client: HostClient, mode: &Mode) -> anyhow::Result<()> {
    let device = client.hello()?;

    if let Mode::Flash {
        image,
        bootloader: true,
        ..
    } = mode
    {
        let device = client.start_bootloader(device)?;
        let config = device
            .boot_config()
            .ok_or_else(|| anyhow::anyhow!("bootloader did not report its layout"))?;
        let image = signed(&fs::read(image)?, &config)?;
        client.write_flash(&image, Writer::for_bootloader(&config))?;
        client.reboot()?;
        return Ok(());
    }

    if let Mode::Reboot = mode {
        return Ok(client.reboot()?);
    }

    anyhow::ensure!(
        device.kind == DeviceKind::Programmer,
        "{:?} cannot run this command",
        device.kind
    );

    let cpu = match mode {
        Mode::Flash { cpu, .. } | Mode::Verify { cpu, .. } => {
            client.connect_target(cpu.as_deref())?
        }
        _ => client.connect_target(None)?,
    };
    let r = target_command(&mut client, cpu, mode);
    client.disconnect_target()?;
    r
}

fn target_command(client: &mut HostClient, cpu: &Cpu, mode: &Mode) -> anyhow::Result<()> {
    match mode {
        Mode::Flash {
            image,
            erase,
            verify,
            ..
        } => {
            let image = fs::read(image)?;
            anyhow::ensure!(
                image.len() <= cpu.flash_size,
                "image of {} bytes does not fit in {} bytes of {}",
                image.len(),
                cpu.flash_size,
                cpu.name
            );
            if *erase {
                client.erase()?;
            }
            client.write_flash(&image, Writer::for_cpu(cpu))?;
            if *verify {
                client.verify(&image)?;
            }
        }
        Mode::Verify { image, .. } => client.verify(&fs::read(image)?)?,
        Mode::Dump { from, to, output } => {
            let to = to.unwrap_or(cpu.flash_size as u32 - 1);
            let data = client.read_flash(*from, to)?;
            match output {
                Some(path) => fs::write(path, &data)?,
                None => client::hexdump(*from, &data)
                    .iter()
                    .for_each(|l| println!("{}", l)),
            }
        }
        Mode::Erase => client.erase()?,
        Mode::Fuse { field, value } => {
            anyhow::ensure!(
                field.is_some() || value.is_none(),
                "name the field to program"
            );
            let fields = match field {
                Some(name) => vec![Field::parse(name.as_bytes())
                    .ok_or_else(|| anyhow::anyhow!("unknown field {}", name))?],
                None => Field::ALL.to_vec(),
            };
            for field in fields {
                let v = client.fuse(field, *value)?;
                println!("{:>6}: 0x{:02x}", field.name(), v);
            }
        }
        _ => anyhow::bail!("not a target command"),
    }
    Ok(())
}

fn serve_stdio(o: &Args) -> anyhow::Result<()> {
    let queue: &'static mut RxQueue<STDIN_QUEUE> = Box::leak(Box::new(RxQueue::new()));
    let (producer, consumer) = queue.split();

    let closed = linux::spawn_reader(io::stdin(), producer);
    serve(StreamSerial::new(BufferedSerial::new(consumer, Stdout::new()), closed), o)
}

/// A closed input ends the session without error
fn finish(r: Result<ModeTransfer, Error<IoErrorKind>>) -> anyhow::Result<Option<ModeTransfer>> {
    match r {
        Ok(t) => Ok(Some(t)),
        Err(Error::Serial(IoErrorKind::UnexpectedEof)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn serve<S>(port: S, o: &Args) -> anyhow::Result<()>
where
    S: SerialPort<IoErrorKind>,
{
    let transfer = match &o.mode {
        Mode::Programmer {
            simulate: true, ..
        } => {
            info!("Serving programmer with a simulated target");
            let target = Simulated::atmega8();
            let platform = LinuxPlatform::default();
            let mut programmer =
                Programmer::new(port, target, Delay {}, NoWatchdog, platform, o.options.clone());
            finish(programmer.run())?
        }
        Mode::Programmer {
            spi,
            reset_gpio,
            spi_speed,
            ..
        } => {
            info!("Serving programmer on {}", spi);
            let target = SpiTarget::open(spi, *reset_gpio, *spi_speed)?;
            let platform = LinuxPlatform::default();
            let mut programmer =
                Programmer::new(port, target, Delay {}, NoWatchdog, platform, o.options.clone());
            finish(programmer.run())?
        }
        Mode::Bootloader {
            image,
            layout,
            stay,
        } => {
            let config = layout.config()?;
            info!("Serving bootloader on {}", image.display());
            let memory = FileMemory::open(image, &config)?;
            let platform = LinuxPlatform {
                stay: *stay,
                ..LinuxPlatform::default()
            };
            finish(
                Bootloader::new(port, memory, Delay {}, NoWatchdog, platform, config, o.options.clone())
                    .run(),
            )?
        }
        _ => anyhow::bail!("nothing to serve"),
    };

    match transfer {
        Some(ModeTransfer::Application) => info!("Target would now run the application"),
        Some(ModeTransfer::Bootloader) => info!("Target would now enter the bootloader"),
        None => info!("Input closed"),
    }
    Ok(())
}
