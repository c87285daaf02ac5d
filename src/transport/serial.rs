//! Serial transport: UARTs, USB-serial adapters and RFCOMM ttys.
//!
//! Opens a device through the `serialport` crate and hands cloned handles to
//! a [`StreamPort`]: one for the reader worker, one for the writer worker and
//! one for live line control.

use crate::config::SerialConfig;
use crate::port::{
    IoSink, IoSource, LineControl, PortError, PortOptions, StreamPair, StreamPort,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Serial line parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSettings {
    pub baud_rate: u32,
    /// Character framing, e.g. `8N1`.
    pub framing: Framing,
    pub flow_control: FlowControl,
    /// Bound on a single blocking read.
    pub read_timeout: Duration,
}

impl Default for LineSettings {
    /// 9600 baud, 8N1, no flow control.
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            framing: Framing::default(),
            flow_control: FlowControl::None,
            read_timeout: crate::port::stream::DEFAULT_READ_TIMEOUT,
        }
    }
}

impl LineSettings {
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }
}

impl From<&SerialConfig> for LineSettings {
    fn from(config: &SerialConfig) -> Self {
        Self {
            baud_rate: config.default_baud,
            flow_control: if config.hardware_flow_control {
                FlowControl::Hardware
            } else {
                FlowControl::None
            },
            read_timeout: config.read_timeout(),
            ..Self::default()
        }
    }
}

/// Data bits, parity and stop bits in the usual `8N1` notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Framing {
    data_bits: u8,
    parity: char,
    stop_bits: u8,
}

impl Framing {
    fn data_bits(self) -> serialport::DataBits {
        match self.data_bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            _ => serialport::DataBits::Eight,
        }
    }

    fn parity(self) -> serialport::Parity {
        match self.parity {
            'O' => serialport::Parity::Odd,
            'E' => serialport::Parity::Even,
            _ => serialport::Parity::None,
        }
    }

    fn stop_bits(self) -> serialport::StopBits {
        if self.stop_bits == 2 {
            serialport::StopBits::Two
        } else {
            serialport::StopBits::One
        }
    }
}

impl Default for Framing {
    fn default() -> Self {
        Self {
            data_bits: 8,
            parity: 'N',
            stop_bits: 1,
        }
    }
}

impl std::str::FromStr for Framing {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PortError::config(format!("invalid framing '{s}', expected e.g. 8N1"));
        let mut chars = s.trim().chars();
        let (Some(data), Some(parity), Some(stop), None) =
            (chars.next(), chars.next(), chars.next(), chars.next())
        else {
            return Err(invalid());
        };

        let data_bits = data.to_digit(10).filter(|d| (5..=8).contains(d)).ok_or_else(invalid)?;
        let parity = parity.to_ascii_uppercase();
        if !matches!(parity, 'N' | 'O' | 'E') {
            return Err(invalid());
        }
        let stop_bits = stop.to_digit(10).filter(|d| matches!(d, 1 | 2)).ok_or_else(invalid)?;

        Ok(Self {
            data_bits: data_bits as u8,
            parity,
            stop_bits: stop_bits as u8,
        })
    }
}

impl std::fmt::Display for Framing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.data_bits, self.parity, self.stop_bits)
    }
}

impl TryFrom<String> for Framing {
    type Error = PortError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Framing> for String {
    fn from(framing: Framing) -> Self {
        framing.to_string()
    }
}

/// Flow control modes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    /// XON/XOFF
    Software,
    /// RTS/CTS
    Hardware,
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => Self::None,
            FlowControl::Software => Self::Software,
            FlowControl::Hardware => Self::Hardware,
        }
    }
}

/// Live line control over an open device.
struct SerialControl(Box<dyn serialport::SerialPort>);

impl LineControl for SerialControl {
    fn baud_rate(&self) -> u32 {
        self.0.baud_rate().unwrap_or(0)
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), PortError> {
        if baud_rate == 0 {
            return Err(PortError::config("baud rate must be positive"));
        }
        self.0.set_baud_rate(baud_rate).map_err(PortError::Serial)
    }
}

fn map_open_error(path: &str, e: serialport::Error) -> PortError {
    match e.kind() {
        serialport::ErrorKind::NoDevice => PortError::not_found(path),
        serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => PortError::not_found(path),
        serialport::ErrorKind::InvalidInput => PortError::config(e.to_string()),
        _ => PortError::Serial(e),
    }
}

/// Open `path` and split it into reader, writer and control handles.
pub fn open_pair(path: &str, settings: &LineSettings) -> Result<StreamPair, PortError> {
    let device = serialport::new(path, settings.baud_rate)
        .data_bits(settings.framing.data_bits())
        .parity(settings.framing.parity())
        .stop_bits(settings.framing.stop_bits())
        .flow_control(settings.flow_control.into())
        .timeout(settings.read_timeout)
        .open()
        .map_err(|e| map_open_error(path, e))?;

    let writer = device.try_clone().map_err(PortError::Serial)?;
    let control = device.try_clone().map_err(PortError::Serial)?;

    Ok(StreamPair::new(Box::new(IoSource(device)), Box::new(IoSink(writer)))
        .with_control(Box::new(SerialControl(control))))
}

/// Open a serial device as a [`StreamPort`].
///
/// # Example
/// ```no_run
/// use flightlink::port::{Port, PortOptions};
/// use flightlink::transport::serial::{open_serial, LineSettings};
///
/// let settings = LineSettings::default().with_baud_rate(38400);
/// let port = open_serial("/dev/ttyUSB0", &settings, PortOptions::default())?;
/// port.write_all(b"$PFLAC,R,ID\r\n")?;
/// # Ok::<(), flightlink::port::PortError>(())
/// ```
pub fn open_serial(
    path: &str,
    settings: &LineSettings,
    options: PortOptions,
) -> Result<StreamPort, PortError> {
    let pair = open_pair(path, settings)?;
    info!("serial {} opened at {} baud", path, settings.baud_rate);
    StreamPort::open(path, pair, options)
}

/// One entry of [`available_ports`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortSummary {
    pub name: String,
    /// "usb", "bluetooth", "pci" or "unknown"
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl From<serialport::SerialPortInfo> for PortSummary {
    fn from(info: serialport::SerialPortInfo) -> Self {
        let (kind, description) = match info.port_type {
            serialport::SerialPortType::UsbPort(usb) => {
                let description = match (usb.manufacturer, usb.product) {
                    (Some(m), Some(p)) => Some(format!("{m} {p}")),
                    (Some(m), None) => Some(m),
                    (None, Some(p)) => Some(p),
                    (None, None) => Some(format!("{:04x}:{:04x}", usb.vid, usb.pid)),
                };
                ("usb", description)
            }
            serialport::SerialPortType::BluetoothPort => ("bluetooth", None),
            serialport::SerialPortType::PciPort => ("pci", None),
            serialport::SerialPortType::Unknown => ("unknown", None),
        };
        Self {
            name: info.port_name,
            kind,
            description,
        }
    }
}

/// List serial devices present on this machine.
pub fn available_ports() -> Result<Vec<PortSummary>, PortError> {
    let ports = serialport::available_ports().map_err(PortError::Serial)?;
    Ok(ports.into_iter().map(PortSummary::from).collect())
}
