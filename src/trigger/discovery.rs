//! Serial port discovery for the trigger device.
//!
//! The board enumerates as a generic USB serial adapter, so identification is
//! heuristic: known vendor ids, product strings and platform path patterns each
//! add to a score and the highest-scoring port wins.

use tokio_serial::SerialPortType;
use tracing::debug;

/// Arduino LLC / Arduino SRL boards.
const VID_ARDUINO: [u16; 2] = [0x2341, 0x2a03];
/// PJRC Teensy.
const VID_TEENSY: u16 = 0x16c0;
/// USB-serial bridges found on clone boards: WCH CH340, FTDI, Silicon Labs CP210x.
const VID_BRIDGES: [u16; 3] = [0x1a86, 0x0403, 0x10c4];

/// A serial port and how likely it is to be the trigger device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCandidate {
    /// OS path or name of the port.
    pub port_name: String,
    /// 0 means nothing about the port matched.
    pub score: u32,
    /// Human readable summary of the USB identity, if any.
    pub description: String,
}

/// Every serial port on the system, best candidates first.
pub fn list_candidates() -> Result<Vec<PortCandidate>, tokio_serial::Error> {
    let ports = tokio_serial::available_ports()?;
    let mut candidates: Vec<PortCandidate> = ports
        .into_iter()
        .map(|info| {
            let (vid, product, manufacturer, description) = match &info.port_type {
                SerialPortType::UsbPort(usb) => (
                    Some(usb.vid),
                    usb.product.clone(),
                    usb.manufacturer.clone(),
                    format!(
                        "USB {:04x}:{:04x} {}",
                        usb.vid,
                        usb.pid,
                        usb.product.as_deref().unwrap_or("")
                    )
                    .trim_end()
                    .to_string(),
                ),
                SerialPortType::PciPort => (None, None, None, "PCI".to_string()),
                SerialPortType::BluetoothPort => (None, None, None, "Bluetooth".to_string()),
                SerialPortType::Unknown => (None, None, None, "Unknown".to_string()),
            };
            PortCandidate {
                score: score(
                    &info.port_name,
                    vid,
                    product.as_deref(),
                    manufacturer.as_deref(),
                ),
                port_name: info.port_name,
                description,
            }
        })
        .collect();

    candidates.sort_by(|a, b| b.score.cmp(&a.score).then(a.port_name.cmp(&b.port_name)));
    Ok(candidates)
}

/// Best matching port, if any port matched at all.
pub fn find_device() -> Result<Option<String>, tokio_serial::Error> {
    let best = list_candidates()?.into_iter().find(|c| c.score > 0);
    if let Some(candidate) = &best {
        debug!(port = %candidate.port_name, score = candidate.score, "Selected trigger port");
    }
    Ok(best.map(|c| c.port_name))
}

fn score(port_name: &str, vid: Option<u16>, product: Option<&str>, manufacturer: Option<&str>) -> u32 {
    let mut score = 0;

    if let Some(vid) = vid {
        if VID_ARDUINO.contains(&vid) {
            score += 100;
        } else if vid == VID_TEENSY {
            score += 90;
        } else if VID_BRIDGES.contains(&vid) {
            score += 60;
        }
    }

    let named = [product, manufacturer].into_iter().flatten().any(|s| {
        let s = s.to_ascii_lowercase();
        s.contains("arduino") || s.contains("teensy")
    });
    if named {
        score += 50;
    }

    if port_name.contains("ttyACM") || port_name.contains("usbmodem") {
        score += 30;
    } else if port_name.contains("ttyUSB") || port_name.contains("usbserial") {
        score += 20;
    }

    score
}
