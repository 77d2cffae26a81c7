//! Serial line ownership and RTU frame boundary detection
//!
//! The RTU framing rule: a frame ends after the line has been silent for at
//! least 3.5 character-times. We lean on the port's read timeout to observe
//! that silence, so this module performs the only blocking I/O in the crate.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use serialport::SerialPort;
use thiserror::Error;

use super::frame::MAX_FRAME_LEN;

/// Above 19200 baud the Modbus serial line spec fixes the inter-frame gap
/// at 1750 us rather than scaling it with the character time.
const HIGH_BAUD_SILENCE: Duration = Duration::from_micros(1750);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no frame received within timeout")]
    Timeout,

    #[error("serial I/O failure: {0}")]
    Io(#[from] io::Error),
}

/// Byte-level access to the bus, one conversation at a time.
///
/// Implemented by the real serial line and by simulated slaves in tests.
pub trait Transport: Send {
    /// Transmit one fully framed request.
    fn send(&mut self, raw: &[u8]) -> Result<(), TransportError>;

    /// Receive one silence-terminated frame, waiting at most `timeout` for
    /// its first byte.
    fn read_frame(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

/// Line parameters, fixed for the lifetime of a bus instance.
#[derive(Clone, Debug)]
pub struct SerialSettings {
    pub port: String,
    pub baud: u32,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl SerialSettings {
    /// Bits transmitted per character: start bit, 8 data bits, optional
    /// parity bit, stop bit(s).
    fn bits_per_char(&self) -> u32 {
        let parity = if self.parity == Parity::None { 0 } else { 1 };
        let stop = match self.stop_bits {
            StopBits::One => 1,
            StopBits::Two => 2,
        };
        1 + 8 + parity + stop
    }

    /// The 3.5 character-time inter-frame silence for these settings.
    pub fn silence_interval(&self) -> Duration {
        if self.baud > 19200 {
            return HIGH_BAUD_SILENCE;
        }
        let micros = 3_500_000u64 * self.bits_per_char() as u64 / self.baud as u64;
        Duration::from_micros(micros)
    }
}

/// Exclusive owner of one physical RS-485 line.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    silence: Duration,
}

impl SerialTransport {
    pub fn open(settings: &SerialSettings) -> Result<Self, TransportError> {
        let parity = match settings.parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        };
        let stop_bits = match settings.stop_bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        };

        let port = serialport::new(&settings.port, settings.baud)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(settings.silence_interval())
            .open()
            .map_err(io::Error::from)?;

        log::info!(
            "Opened {} at {} baud ({:?} parity, {:?} stop bits)",
            settings.port,
            settings.baud,
            settings.parity,
            settings.stop_bits
        );

        Ok(SerialTransport {
            port,
            silence: settings.silence_interval(),
        })
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, raw: &[u8]) -> Result<(), TransportError> {
        log::trace!("TX {}", hex::encode(raw));
        self.port.write_all(raw)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut frame: Vec<u8> = Vec::new();
        let mut chunk = [0u8; MAX_FRAME_LEN];

        loop {
            // Until the first byte arrives we wait out the caller's timeout;
            // afterwards a pause of one silence interval ends the frame.
            let wait = if frame.is_empty() {
                match deadline.checked_duration_since(Instant::now()) {
                    Some(remaining) if !remaining.is_zero() => remaining,
                    _ => return Err(TransportError::Timeout),
                }
            } else {
                self.silence
            };
            self.port.set_timeout(wait).map_err(io::Error::from)?;

            match self.port.read(&mut chunk) {
                Ok(0) => {
                    if !frame.is_empty() {
                        break;
                    }
                }
                Ok(n) => {
                    frame.extend_from_slice(&chunk[..n]);
                    if frame.len() >= MAX_FRAME_LEN {
                        frame.truncate(MAX_FRAME_LEN);
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    if !frame.is_empty() {
                        break;
                    }
                }
                Err(e) => return Err(TransportError::Io(e)),
            }
        }

        log::trace!("RX {}", hex::encode(&frame));
        Ok(frame)
    }
}
