//! Byte-port abstraction over the physical link.
//!
//! The engine only needs three operations from the link: read some bytes,
//! write a buffer, and discard pending input; dropping the port closes it.
//! [`BytePort`] captures that contract behind a trait object so tests can
//! drive the engine with an in-memory port, and [`SerialBytePort`]
//! implements it over a serial line.

use async_trait::async_trait;
use ecrlink_core::{Error, Result, constants::DEFAULT_BAUD_RATE};
use serial2_tokio::{CharSize, Parity, SerialPort, StopBits};
use std::io;
use std::time::Duration;
use tracing::{debug, info};

/// Byte-stream access to the terminal link.
///
/// Implementations take `&self`; the engine shares one port between the
/// reader task (reads) and the sender (writes and input discards).
#[async_trait]
pub trait BytePort: Send + Sync {
    /// Read available bytes into `buf`; blocks until at least one byte
    /// arrives. A return of 0 means the port is gone.
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the whole buffer.
    async fn write_all(&self, buf: &[u8]) -> io::Result<()>;

    /// Drop any bytes already buffered on the input side.
    async fn discard_input(&self) -> io::Result<()>;
}

/// Serial line settings (19200 8-N-1 by default).
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port path, e.g. `/dev/ttyS0` or `COM3`.
    pub path: String,

    pub baud_rate: u32,
    pub char_size: CharSize,
    pub parity: Parity,
    pub stop_bits: StopBits,

    /// Timeout applied to writes (reads block indefinitely; the reader task
    /// only stops on port errors or teardown).
    pub io_timeout: Duration,
}

impl SerialConfig {
    /// Default settings for the given port path.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            char_size: CharSize::Bits8,
            parity: Parity::None,
            stop_bits: StopBits::One,
            io_timeout: Duration::from_millis(
                ecrlink_core::constants::DEFAULT_IO_TIMEOUT_MS,
            ),
        }
    }
}

/// [`BytePort`] implementation over a serial line.
pub struct SerialBytePort {
    port: SerialPort,
    write_timeout: Duration,
}

impl SerialBytePort {
    /// Open the configured serial port in raw mode.
    ///
    /// # Errors
    /// Returns `Error::Config` when the port cannot be opened, which is
    /// surfaced to the caller immediately (unknown or busy device).
    pub fn open(config: &SerialConfig) -> Result<Self> {
        info!(path = %config.path, baud = config.baud_rate, "opening serial port");
        let baud_rate = config.baud_rate;
        let char_size = config.char_size;
        let parity = config.parity;
        let stop_bits = config.stop_bits;
        let port = SerialPort::open(&config.path, move |mut settings: serial2_tokio::Settings| {
            settings.set_raw();
            settings.set_baud_rate(baud_rate)?;
            settings.set_char_size(char_size);
            settings.set_parity(parity);
            settings.set_stop_bits(stop_bits);
            Ok(settings)
        })
        .map_err(|e| Error::Config(format!("cannot open serial port {}: {e}", config.path)))?;

        debug!(path = %config.path, "serial port open");
        Ok(Self {
            port,
            write_timeout: config.io_timeout,
        })
    }
}

#[async_trait]
impl BytePort for SerialBytePort {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf).await
    }

    async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let write = async {
            let mut written = 0;
            while written < buf.len() {
                let n = self.port.write(&buf[written..]).await?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "serial port accepted no bytes",
                    ));
                }
                written += n;
            }
            Ok(())
        };
        tokio::time::timeout(self.write_timeout, write)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "serial write timed out"))?
    }

    async fn discard_input(&self) -> io::Result<()> {
        self.port.discard_input_buffer()
    }
}
