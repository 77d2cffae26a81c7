//! Bus arbitration: one transaction in flight, retries with random backoff
//!
//! The RS-485 line is shared and collision-prone, so every request/reply
//! conversation holds the transport lock for its full duration, and failed
//! attempts are retried after a uniformly distributed delay to keep two
//! masters from colliding in lockstep.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;

use super::frame::{self, Frame, FrameError};
use super::serial::{Transport, TransportError};
use crate::constants::defaults;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("slave {0} unreachable after retries exhausted")]
    Unreachable(u8),

    #[error("bus hardware failure: {0}")]
    Fatal(String),
}

/// Why a single attempt failed; every variant takes the retry path.
#[derive(Error, Debug)]
enum AttemptError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("reply from slave {0}, expected {1}")]
    WrongSlave(u8, u8),

    #[error("reply function {0:#04x}, expected {1:#04x}")]
    WrongFunction(u8, u8),

    #[error("echo readback mismatch (collision)")]
    Collision,
}

#[derive(Clone, Debug)]
pub struct BusOptions {
    /// How long to wait for a reply before counting the attempt as failed.
    pub response_timeout: Duration,
    /// Retries after the initial attempt.
    pub max_retries: u32,
    /// Uniform range the pre-retry delay is drawn from.
    pub backoff: (Duration, Duration),
    /// Consecutive I/O failures after which the bus is declared dead.
    pub fatal_io_threshold: u32,
    /// Read back our own transmission and treat a mismatch as a collision.
    /// Only meaningful on transceivers that receive while sending.
    pub check_echo: bool,
}

impl Default for BusOptions {
    fn default() -> Self {
        BusOptions {
            response_timeout: defaults::RESPONSE_TIMEOUT,
            max_retries: defaults::MAX_RETRIES,
            backoff: (defaults::BACKOFF_MIN, defaults::BACKOFF_MAX),
            fatal_io_threshold: defaults::FATAL_IO_THRESHOLD,
            check_echo: false,
        }
    }
}

/// Serializes all conversations on one transport.
///
/// Shared between any number of logical callers; the internal lock guarantees
/// request and reply bytes of different transactions never interleave.
pub struct Bus {
    transport: Mutex<Box<dyn Transport>>,
    options: BusOptions,
    consecutive_io_failures: AtomicU32,
}

impl Bus {
    pub fn new(transport: Box<dyn Transport>, options: BusOptions) -> Self {
        Bus {
            transport: Mutex::new(transport),
            options,
            consecutive_io_failures: AtomicU32::new(0),
        }
    }

    /// Run one request/reply conversation, retrying on transient failure.
    pub fn transaction(&self, request: &Frame) -> Result<Frame, BusError> {
        let raw = request.encode();
        let mut transport = self.transport.lock().unwrap();

        for attempt in 0..=self.options.max_retries {
            if attempt > 0 {
                self.backoff_delay();
            }

            match self.attempt(transport.as_mut(), &raw, request) {
                Ok(reply) => {
                    self.consecutive_io_failures.store(0, Ordering::Relaxed);
                    return Ok(reply);
                }
                Err(e) => {
                    if let AttemptError::Transport(TransportError::Io(ref io_err)) = e {
                        let failures =
                            self.consecutive_io_failures.fetch_add(1, Ordering::Relaxed) + 1;
                        if failures >= self.options.fatal_io_threshold {
                            log::error!(
                                "Giving up on bus after {} consecutive I/O failures: {}",
                                failures,
                                io_err
                            );
                            return Err(BusError::Fatal(io_err.to_string()));
                        }
                    }
                    log::debug!(
                        "Attempt {}/{} to slave {} failed: {}",
                        attempt + 1,
                        self.options.max_retries + 1,
                        request.slave,
                        e
                    );
                }
            }
        }

        log::warn!("Slave {} unreachable, retries exhausted", request.slave);
        Err(BusError::Unreachable(request.slave))
    }

    /// Send a frame to the broadcast address (slave 0). No slave ever
    /// replies to a broadcast, so there is nothing to wait for or retry.
    pub fn broadcast(&self, request: &Frame) -> Result<(), BusError> {
        let raw = request.encode();
        let mut transport = self.transport.lock().unwrap();
        transport.send(&raw).map_err(|e| match e {
            TransportError::Io(io_err) => BusError::Fatal(io_err.to_string()),
            TransportError::Timeout => BusError::Unreachable(0),
        })
    }

    fn attempt(
        &self,
        transport: &mut dyn Transport,
        raw: &[u8],
        request: &Frame,
    ) -> Result<Frame, AttemptError> {
        transport.send(raw)?;

        if self.options.check_echo {
            let echo = transport.read_frame(self.options.response_timeout)?;
            if echo != raw {
                return Err(AttemptError::Collision);
            }
        }

        let reply_raw = transport.read_frame(self.options.response_timeout)?;
        let reply = frame::decode(&reply_raw)?;
        if reply.slave != request.slave {
            return Err(AttemptError::WrongSlave(reply.slave, request.slave));
        }
        if reply.function != request.function {
            return Err(AttemptError::WrongFunction(reply.function, request.function));
        }
        Ok(reply)
    }

    fn backoff_delay(&self) {
        let (min, max) = self.options.backoff;
        let delay = rand::thread_rng().gen_range(min..=max);
        std::thread::sleep(delay);
    }
}
