//! hexloader CLI - Intel HEX generation and STK500 bootloader programming.
//!
//! ## Features
//!
//! - Export raw binaries to Intel HEX files
//! - Flash firmware to AVR serial bootloaders with read-back verification
//! - Read device memory and signatures
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable support

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{Shell, generate};
use console::style;
use env_logger::Env;
use hexloader::{
    ChipFamily, EncodeOptions, FirmwareImage, MemoryKind, encode_records,
    image::ihex::write_hex,
};
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

mod config;
mod serial;

use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set once the Ctrl-C handler fires.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// User-facing CLI failure classes, mapped to exit codes.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Usage or setup problem (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// Operation cancelled by the user (exit code 130).
    #[error("{0}")]
    Cancelled(String),
}

/// hexloader - generate Intel HEX images and program STK500 bootloaders.
///
/// Environment variables:
///   HEXLOADER_PORT              - Default serial port
///   HEXLOADER_BAUD              - Default baud rate
///   HEXLOADER_CHIP              - Default chip type (atmega328p, ...)
///   HEXLOADER_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "hexloader")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "HEXLOADER_PORT")]
    port: Option<String>,

    /// Baud rate (defaults to the chip's stock bootloader rate).
    #[arg(short, long, global = true, env = "HEXLOADER_BAUD")]
    baud: Option<u32>,

    /// Target chip type.
    #[arg(
        short,
        long,
        global = true,
        default_value = "atmega328p",
        env = "HEXLOADER_CHIP"
    )]
    chip: Chip,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "HEXLOADER_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Confirm port selection even for auto-detected ports.
    #[arg(long, global = true)]
    confirm_port: bool,

    /// List all available ports (including unknown types).
    #[arg(long, global = true)]
    list_all_ports: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Supported chip types.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum Chip {
    /// ATmega328P (Uno-class boards, default).
    Atmega328p,
    /// ATmega168 (older Uno/Nano-class boards).
    Atmega168,
    /// ATmega8 (legacy boards).
    Atmega8,
    /// ATmega2560 (Mega-class boards).
    Atmega2560,
    /// ATmega32U4 (Leonardo-class boards).
    Atmega32u4,
}

impl From<Chip> for ChipFamily {
    fn from(chip: Chip) -> Self {
        match chip {
            Chip::Atmega328p => ChipFamily::Atmega328p,
            Chip::Atmega168 => ChipFamily::Atmega168,
            Chip::Atmega8 => ChipFamily::Atmega8,
            Chip::Atmega2560 => ChipFamily::Atmega2560,
            Chip::Atmega32u4 => ChipFamily::Atmega32u4,
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Export a raw binary to an Intel HEX file.
    Export {
        /// Path to the binary file.
        input: PathBuf,

        /// Output path (defaults to the input with a .hex extension).
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Load address of the binary.
        #[arg(short, long, value_parser = parse_hex_u32, default_value = "0")]
        address: u32,

        /// Data bytes per record (1-255).
        #[arg(long, default_value_t = 16)]
        line_length: u8,

        /// Page size for zero-run elision (defaults to the chip's flash page).
        #[arg(long)]
        page_size: Option<u32>,

        /// Skip zero runs within a page instead of encoding them.
        #[arg(long)]
        omit_null_runs: bool,
    },

    /// Flash a raw binary to a device over its serial bootloader.
    Flash {
        /// Path to the binary file.
        input: PathBuf,

        /// Load address of the binary.
        #[arg(short, long, value_parser = parse_hex_u32, default_value = "0")]
        address: u32,

        /// Write to EEPROM instead of flash.
        #[arg(long)]
        eeprom: bool,

        /// Skip read-back verification.
        #[arg(long)]
        no_verify: bool,

        /// Skip the device signature check.
        #[arg(long)]
        skip_signature_check: bool,
    },

    /// Read device memory to a file.
    Read {
        /// Start address.
        #[arg(short, long, value_parser = parse_hex_u32, default_value = "0")]
        address: u32,

        /// Number of bytes to read.
        #[arg(short, long, value_parser = parse_hex_u32)]
        length: u32,

        /// Output file.
        #[arg(short, long)]
        output: PathBuf,

        /// Read EEPROM instead of flash.
        #[arg(long)]
        eeprom: bool,
    },

    /// Read the device signature and check it against the selected chip.
    Signature,

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Parse hexadecimal value (supports 0x prefix and underscores).
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    if let Some(hex) = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
    {
        let hex: String = hex.chars().filter(|c| *c != '_').collect();
        u32::from_str_radix(&hex, 16).map_err(|e| format!("Invalid hex value: {e}"))
    } else {
        // No prefix: decimal first, then hex for convenience
        s.parse::<u32>()
            .or_else(|_| u32::from_str_radix(s, 16))
            .map_err(|e| format!("Invalid value: {e}"))
    }
}

fn main() {
    let exit_code = match run() {
        Ok(()) => 0,
        Err(e) => match e.downcast_ref::<CliError>() {
            Some(CliError::Usage(msg)) => {
                eprintln!("{} {msg}", style("Error:").red().bold());
                2
            },
            Some(CliError::Cancelled(msg)) => {
                eprintln!("{} {msg}", style("Cancelled:").yellow().bold());
                130
            },
            None => {
                eprintln!("{} {e:#}", style("Error:").red().bold());
                1
            },
        },
    };
    std::process::exit(exit_code);
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "hexloader v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    // Wire Ctrl-C to the library's interrupt checker so long-running
    // sessions stop cleanly instead of being killed mid-command.
    let _ = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed));
    hexloader::set_interrupt_checker(was_interrupted);

    // Load configuration
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Export {
            input,
            output,
            address,
            line_length,
            page_size,
            omit_null_runs,
        } => cmd_export(
            &cli,
            input,
            output.as_deref(),
            *address,
            *line_length,
            *page_size,
            *omit_null_runs,
        ),
        Commands::Flash {
            input,
            address,
            eeprom,
            no_verify,
            skip_signature_check,
        } => {
            let no_verify = *no_verify || config.flash.no_verify;
            cmd_flash(
                &cli,
                &mut config,
                input,
                *address,
                *eeprom,
                no_verify,
                *skip_signature_check,
            )
        },
        Commands::Read {
            address,
            length,
            output,
            eeprom,
        } => cmd_read(&cli, &mut config, *address, *length, output, *eeprom),
        Commands::Signature => cmd_signature(&cli, &mut config),
        Commands::ListPorts { json } => {
            cmd_list_ports(*json);
            Ok(())
        },
        Commands::Completions { shell } => {
            cmd_completions(*shell);
            Ok(())
        },
    }
}

/// Get serial port from CLI args, config, or interactive selection.
fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        list_all_ports: cli.list_all_ports,
        non_interactive: cli.non_interactive,
        confirm_port: cli.confirm_port,
    };

    let selected = select_serial_port(&options, config)?;

    // Ask to remember if not a known device and interactive mode
    if !selected.is_known && !cli.non_interactive {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port.name)
}

/// Baud rate from flag, config, or the chip's stock bootloader rate.
fn get_baud(cli: &Cli, config: &Config) -> u32 {
    cli.baud
        .or(config.port.connection.baud)
        .unwrap_or_else(|| ChipFamily::from(cli.chip).default_baud())
}

/// Open a connected programmer for the selected chip and port.
fn open_programmer(
    cli: &Cli,
    config: &mut Config,
) -> Result<Box<dyn hexloader::Programmer>> {
    let port = get_port(cli, config)?;
    let baud = get_baud(cli, config);
    if !cli.quiet {
        eprintln!(
            "{} Using {} at {} baud",
            style("🔌").cyan(),
            style(&port).cyan(),
            baud
        );
    }

    let chip: ChipFamily = cli.chip.into();
    let mut programmer = chip
        .create_programmer(&port, baud)
        .with_context(|| format!("Failed to open {port}"))?;

    if !cli.quiet {
        eprintln!(
            "{} Connecting to the {chip} bootloader...",
            style("⏳").yellow()
        );
    }
    programmer.connect()?;
    if !cli.quiet {
        eprintln!("{} Connected", style("✓").green());
    }

    Ok(programmer)
}

/// Export command implementation.
fn cmd_export(
    cli: &Cli,
    input: &Path,
    output: Option<&Path>,
    address: u32,
    line_length: u8,
    page_size: Option<u32>,
    omit_null_runs: bool,
) -> Result<()> {
    let data = fs::read(input)
        .with_context(|| format!("Failed to read binary file {}", input.display()))?;

    let chip: ChipFamily = cli.chip.into();
    let opts = EncodeOptions::default()
        .with_line_data_len(line_length)
        .with_page_size(page_size.unwrap_or_else(|| u32::from(chip.device_params().page_size)))
        .with_omit_null_runs(omit_null_runs);

    let records = encode_records(&data, address, &opts)?;

    let output = output.map_or_else(|| input.with_extension("hex"), Path::to_path_buf);
    let mut file = fs::File::create(&output)
        .with_context(|| format!("Failed to create {}", output.display()))?;
    write_hex(&mut file, &records)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    if !cli.quiet {
        eprintln!(
            "{} Encoded {} bytes at {address:#010X} into {} records -> {}",
            style("✓").green(),
            data.len(),
            records.len(),
            style(output.display()).cyan()
        );
    }

    Ok(())
}

/// Build the page-progress bar used by flash.
fn page_progress_bar(quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(1);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} pages {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Flash command implementation.
fn cmd_flash(
    cli: &Cli,
    config: &mut Config,
    input: &Path,
    address: u32,
    eeprom: bool,
    no_verify: bool,
    skip_signature_check: bool,
) -> Result<()> {
    if !cli.quiet {
        eprintln!(
            "{} Loading {}",
            style("📦").cyan(),
            style(input.display()).cyan()
        );
    }

    let image = FirmwareImage::from_file(input, address)
        .with_context(|| format!("Failed to load image {}", input.display()))?;
    let memory = if eeprom {
        MemoryKind::Eeprom
    } else {
        MemoryKind::Flash
    };

    let mut programmer = open_programmer(cli, config)?;

    if skip_signature_check {
        debug!("Skipping signature check");
    } else {
        let signature = programmer.check_signature()?;
        if !cli.quiet {
            eprintln!(
                "{} Signature {} matches {}",
                style("✓").green(),
                signature,
                ChipFamily::from(cli.chip)
            );
        }
    }

    let pb = page_progress_bar(cli.quiet);
    let result = programmer.program(&image, memory, !no_verify, &mut |done, total| {
        pb.set_length(total as u64);
        pb.set_position(done as u64);
    });
    match &result {
        Ok(()) => pb.finish_with_message("done"),
        Err(_) => pb.abandon_with_message("failed"),
    }
    result?;

    programmer.close();

    if !cli.quiet {
        let verified = if no_verify { "" } else { ", verified" };
        eprintln!(
            "\n{} Wrote {} bytes of {memory}{verified}",
            style("🎉").green().bold(),
            image.len()
        );
    }

    Ok(())
}

/// Read command implementation.
fn cmd_read(
    cli: &Cli,
    config: &mut Config,
    address: u32,
    length: u32,
    output: &Path,
    eeprom: bool,
) -> Result<()> {
    let memory = if eeprom {
        MemoryKind::Eeprom
    } else {
        MemoryKind::Flash
    };

    let mut programmer = open_programmer(cli, config)?;
    let data = programmer.read_memory(memory, address, length)?;
    programmer.close();

    fs::write(output, &data)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    if !cli.quiet {
        eprintln!(
            "{} Read {} bytes of {memory} from {address:#010X} -> {}",
            style("✓").green(),
            data.len(),
            style(output.display()).cyan()
        );
    }

    Ok(())
}

/// Signature command implementation.
fn cmd_signature(cli: &Cli, config: &mut Config) -> Result<()> {
    let mut programmer = open_programmer(cli, config)?;
    let signature = programmer.read_signature()?;
    programmer.close();

    let chip: ChipFamily = cli.chip.into();
    let expected = chip.signature();
    if !cli.quiet {
        if signature == expected {
            eprintln!("{} Signature matches {chip}", style("✓").green());
        } else {
            eprintln!(
                "{} Signature does not match {chip} (expected {expected})",
                style("⚠").yellow()
            );
        }
    }

    // Machine-readable value on stdout
    println!("{signature}");

    Ok(())
}

/// List ports command implementation.
fn cmd_list_ports(json: bool) {
    let detected = hexloader::discover_ports();

    if json {
        let ports: Vec<serde_json::Value> = detected
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "device": p.device.name(),
                    "known": p.device.is_known(),
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                    "serial": p.serial,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&ports).unwrap_or_default()
        );
        return;
    }

    eprintln!("{}", style("Available serial ports").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return;
    }

    for port in &detected {
        let device_type = if port.device.is_known() {
            format!(" [{}]", style(port.device.name()).yellow())
        } else {
            String::new()
        };

        let product = port.product.as_deref().unwrap_or("");
        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };

        eprintln!(
            "  {} {}{}{}{}",
            style("•").green(),
            style(&port.name).cyan(),
            device_type,
            vid_pid,
            if !product.is_empty() {
                format!(" - {}", style(product).dim())
            } else {
                String::new()
            }
        );
    }

    if let Ok(auto_port) = hexloader::auto_detect_port() {
        eprintln!(
            "\n{} Auto-detected: {}",
            style("→").green().bold(),
            style(&auto_port.name).cyan().bold()
        );
    }
}

/// Generate shell completions.
fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}
