//! Interactive serial port selection.
//!
//! This module provides interactive serial port selection with support for:
//! - Auto-detection of known USB-UART bridges
//! - Interactive selection via dialoguer
//! - Remembering selected ports in configuration
//! - Non-interactive mode for CI/CD

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    hexloader::{DetectedPort, DeviceKind, TransportKind, discover_ports},
    log::debug,
    std::{cmp::Ordering, io::IsTerminal},
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// List all ports (including unknown types).
    pub list_all_ports: bool,
    /// Non-interactive mode (fail if multiple ports).
    pub non_interactive: bool,
    /// Force confirmation even for a single recognized port.
    pub confirm_port: bool,
}

/// Result of port selection including whether it was a known device.
#[derive(Debug)]
pub struct SelectedPort {
    /// The selected port info.
    pub port: DetectedPort,
    /// Whether this port matched a known/configured device.
    pub is_known: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    // Port-selection failures are setup issues, so they map to the CLI
    // usage exit code (2) rather than the generic runtime code (1).
    CliError::Usage(message.to_string()).into()
}

/// Check whether a port matches the built-in bridge table or a device the
/// user asked us to remember.
fn is_known_device(port: &DetectedPort, config: &Config) -> bool {
    if port.device.is_known() {
        return true;
    }
    if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        return config
            .port
            .usb_device
            .iter()
            .any(|d| d.matches(vid, pid));
    }
    false
}

/// Wrap an explicitly named port, carrying over USB metadata if the port is
/// currently attached.
fn find_port_by_name(name: &str) -> SelectedPort {
    let detected = discover_ports()
        .into_iter()
        .find(|p| p.name == name)
        .unwrap_or_else(|| DetectedPort {
            name: name.to_string(),
            transport: TransportKind::Unknown,
            device: DeviceKind::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        });

    SelectedPort {
        is_known: detected.device.is_known(),
        port: detected,
    }
}

fn select_non_interactive_port(
    selection_ports: Vec<DetectedPort>,
    config: &Config,
) -> Result<SelectedPort> {
    // Non-interactive mode must be deterministic and never prompt:
    // exactly one candidate is a valid auto-selection, anything else is a
    // setup issue.
    match selection_ports.len().cmp(&1) {
        Ordering::Equal => {
            let port = selection_ports
                .into_iter()
                .next()
                .expect("selection_ports has exactly 1 element here");
            Ok(SelectedPort {
                is_known: is_known_device(&port, config),
                port,
            })
        },
        Ordering::Greater => Err(usage_err(
            "Multiple serial ports found; specify one with --port",
        )),
        Ordering::Less => Err(usage_err("No serial ports available")),
    }
}

/// Select a serial port interactively or automatically.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    // If port explicitly specified, use it
    if let Some(port_name) = &options.port {
        return Ok(find_port_by_name(port_name));
    }

    // If port in config, use it
    if let Some(port_name) = &config.port.connection.serial {
        debug!("Using port from config: {port_name}");
        return Ok(find_port_by_name(port_name));
    }

    // Detect available ports
    let ports = discover_ports();

    if ports.is_empty() {
        return Err(usage_err("No serial ports found"));
    }

    // Filter to known devices (built-in + config)
    let known_ports: Vec<DetectedPort> = ports
        .iter()
        .filter(|p| is_known_device(p, config))
        .cloned()
        .collect();

    // Select candidate set: known first unless user asks for all
    let selection_ports: Vec<DetectedPort> = if options.list_all_ports || known_ports.is_empty() {
        ports
    } else {
        known_ports
    };

    // Non-interactive mode must never prompt
    if options.non_interactive {
        return select_non_interactive_port(selection_ports, config);
    }

    // A single known port can be taken without asking, unless the user
    // wants a confirmation prompt.
    if selection_ports.len() == 1 && !options.confirm_port {
        let port = selection_ports
            .into_iter()
            .next()
            .expect("selection_ports has exactly 1 element here");
        eprintln!(
            "{} Using {}{}",
            style("→").green().bold(),
            style(&port.name).cyan(),
            if port.device.is_known() {
                format!(" [{}]", port.device.name())
            } else {
                String::new()
            }
        );
        return Ok(SelectedPort {
            is_known: is_known_device(&port, config),
            port,
        });
    }

    // Interactive selection needs a terminal
    if !std::io::stderr().is_terminal() {
        return select_non_interactive_port(selection_ports, config);
    }

    let items: Vec<String> = selection_ports
        .iter()
        .map(|p| {
            let device = if p.device.is_known() {
                format!(" [{}]", p.device.name())
            } else {
                String::new()
            };
            let product = p
                .product
                .as_ref()
                .map(|s| format!(" - {s}"))
                .unwrap_or_default();
            format!("{}{device}{product}", p.name)
        })
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select a serial port")
        .items(&items)
        .default(0)
        .interact();

    match selection {
        Ok(index) => {
            let port = selection_ports
                .into_iter()
                .nth(index)
                .expect("selection index is within items");
            Ok(SelectedPort {
                is_known: is_known_device(&port, config),
                port,
            })
        },
        Err(DialoguerError::IO(e)) if e.kind() == std::io::ErrorKind::Interrupted => {
            Err(CliError::Cancelled("Port selection cancelled".to_string()).into())
        },
        Err(e) => Err(anyhow::anyhow!("Port selection failed: {e}")),
    }
}

/// Offer to remember an unrecognized USB device for future auto-detection.
pub fn ask_remember_port(port: &DetectedPort, config: &mut Config) -> Result<()> {
    let (Some(vid), Some(pid)) = (port.vid, port.pid) else {
        return Ok(());
    };

    if !std::io::stderr().is_terminal() {
        return Ok(());
    }

    let remember = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!(
            "Remember this device ({vid:04X}:{pid:04X}) for auto-detection?"
        ))
        .default(false)
        .interact()
        .unwrap_or(false);

    if remember {
        config.remember_usb_device(vid, pid)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str, device: DeviceKind, vid: Option<u16>, pid: Option<u16>) -> DetectedPort {
        DetectedPort {
            name: name.to_string(),
            transport: TransportKind::Serial,
            device,
            vid,
            pid,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    #[test]
    fn test_is_known_device_builtin() {
        let config = Config::default();
        let known = port("/dev/ttyUSB0", DeviceKind::Ch340, Some(0x1A86), Some(0x7523));
        let unknown = port("/dev/ttyS0", DeviceKind::Unknown, None, None);
        assert!(is_known_device(&known, &config));
        assert!(!is_known_device(&unknown, &config));
    }

    #[test]
    fn test_is_known_device_from_config() {
        let mut config = Config::default();
        config.port.usb_device.push(crate::config::UsbDevice {
            vid: 0x1234,
            pid: 0x5678,
        });
        let remembered = port(
            "/dev/ttyACM3",
            DeviceKind::Unknown,
            Some(0x1234),
            Some(0x5678),
        );
        assert!(is_known_device(&remembered, &config));
    }

    #[test]
    fn test_non_interactive_single_port() {
        let config = Config::default();
        let ports = vec![port(
            "/dev/ttyUSB0",
            DeviceKind::Ch340,
            Some(0x1A86),
            Some(0x7523),
        )];
        let selected = select_non_interactive_port(ports, &config).unwrap();
        assert_eq!(selected.port.name, "/dev/ttyUSB0");
        assert!(selected.is_known);
    }

    #[test]
    fn test_non_interactive_no_ports_is_usage_error() {
        let config = Config::default();
        let err = select_non_interactive_port(Vec::new(), &config).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Usage(_))
        ));
    }

    #[test]
    fn test_non_interactive_multiple_ports_is_usage_error() {
        let config = Config::default();
        let ports = vec![
            port("/dev/ttyUSB0", DeviceKind::Ch340, Some(0x1A86), Some(0x7523)),
            port("/dev/ttyUSB1", DeviceKind::Ftdi, Some(0x0403), Some(0x6001)),
        ];
        let err = select_non_interactive_port(ports, &config).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Usage(_))
        ));
    }
}
