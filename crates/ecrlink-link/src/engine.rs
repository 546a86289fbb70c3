//! The link engine: exclusive owner of the port, pairing the reader task
//! with a retrying sender.
//!
//! The sender and reader meet at the [`ResponseGate`], a one-shot rendezvous
//! holding the first response byte after a write. The sender re-arms the
//! gate before every attempt; the reader fires it at most once per arming,
//! with ACK, NAK or the STX of an immediate reply.

use crate::port::BytePort;
use crate::reader::{LinkEvent, spawn_reader};
use ecrlink_core::{
    Error, Result,
    constants::{ACK, DEFAULT_ACK_DELAY_MS, DEFAULT_SEND_RETRIES, DEFAULT_SEND_TIMEOUT_MS, ENQ, NAK, STX},
};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Identifies the host command a send carries, for accepted/failed
/// notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Test,
    Transaction,
    Abort,
    AcceptTransaction,
    DisplayText,
    AuxiliaryMode,
    DeviceControl,
    BonusCardMode,
    CustomerRequest,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Command::Test => "Test",
            Command::Transaction => "Transaction",
            Command::Abort => "Abort",
            Command::AcceptTransaction => "AcceptTransaction",
            Command::DisplayText => "DisplayText",
            Command::AuxiliaryMode => "AuxiliaryMode",
            Command::DeviceControl => "DeviceControl",
            Command::BonusCardMode => "BonusCardMode",
            Command::CustomerRequest => "CustomerRequest",
        };
        write!(f, "{s}")
    }
}

/// One-shot rendezvous for the first response byte.
///
/// Armed by the sender before each attempt, fired at most once per arming by
/// the reader. Re-arming drops any stale sender from a previous attempt.
#[derive(Debug, Default)]
pub struct ResponseGate {
    slot: Mutex<Option<oneshot::Sender<u8>>>,
}

impl ResponseGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the gate and return the receiver for the next first byte.
    pub fn arm(&self) -> oneshot::Receiver<u8> {
        let (tx, rx) = oneshot::channel();
        *self.slot.lock().expect("gate lock poisoned") = Some(tx);
        rx
    }

    /// Fire the gate if armed; later bytes fall through until re-armed.
    pub fn signal(&self, byte: u8) {
        if let Some(tx) = self.slot.lock().expect("gate lock poisoned").take() {
            let _ = tx.send(byte);
        }
    }
}

/// Sender-side tuning for the engine.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Per-attempt wait for the first response byte.
    pub send_timeout: Duration,

    /// Total attempts per send before giving up.
    pub send_retries: u32,

    /// Delay before the reader acknowledges a received part.
    pub ack_delay: Duration,

    /// Capacity of the link event channel towards the coordinator.
    pub event_buffer: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_millis(DEFAULT_SEND_TIMEOUT_MS),
            send_retries: DEFAULT_SEND_RETRIES,
            ack_delay: Duration::from_millis(DEFAULT_ACK_DELAY_MS),
            event_buffer: 64,
        }
    }
}

/// The protocol engine: one reader task, one serialized sender, one port.
pub struct LinkEngine {
    port: Arc<dyn BytePort>,
    gate: Arc<ResponseGate>,
    reader: JoinHandle<()>,
    send_lock: tokio::sync::Mutex<()>,
    config: LinkConfig,
}

impl LinkEngine {
    /// Start the engine on an open port. Returns the engine and the channel
    /// carrying decoded messages and the disconnect notification.
    #[must_use]
    pub fn start(port: Arc<dyn BytePort>, config: LinkConfig) -> (Self, mpsc::Receiver<LinkEvent>) {
        let gate = Arc::new(ResponseGate::new());
        let (tx, rx) = mpsc::channel(config.event_buffer);
        let reader = spawn_reader(Arc::clone(&port), Arc::clone(&gate), tx, config.ack_delay);
        debug!("link engine started");
        (
            Self {
                port,
                gate,
                reader,
                send_lock: tokio::sync::Mutex::new(()),
                config,
            },
            rx,
        )
    }

    /// Send a framed request and wait for the terminal to accept it.
    ///
    /// One send is in flight at a time. Each attempt clears the rendezvous,
    /// discards stale input, writes the frame and waits for the first
    /// response byte: ACK or STX accepts, NAK and silence retry.
    ///
    /// # Errors
    /// `Error::Timeout` after all attempts fail; `Error::Communication` when
    /// the port itself breaks mid-send.
    pub async fn send(&self, frame: &[u8], command: Command) -> Result<()> {
        let _guard = self.send_lock.lock().await;
        let attempts = self.config.send_retries.max(1);

        for attempt in 1..=attempts {
            trace!(%command, attempt, "send attempt");
            let first_byte = self.gate.arm();

            self.port
                .discard_input()
                .await
                .map_err(|e| Error::Communication(format!("cannot discard input: {e}")))?;
            self.port
                .write_all(frame)
                .await
                .map_err(|e| Error::Communication(format!("cannot write frame: {e}")))?;

            match tokio::time::timeout(self.config.send_timeout, first_byte).await {
                Ok(Ok(byte)) if byte == ACK || byte == STX => {
                    info!(%command, attempt, "command accepted");
                    return Ok(());
                }
                Ok(Ok(NAK)) => {
                    warn!(%command, attempt, "terminal rejected frame (NAK)");
                }
                Ok(Ok(byte)) => {
                    warn!(%command, attempt, byte, "unexpected first response byte");
                }
                Ok(Err(_)) => {
                    return Err(Error::Communication(
                        "reader terminated while awaiting response".to_string(),
                    ));
                }
                Err(_) => {
                    warn!(%command, attempt, "no response within timeout");
                }
            }
        }

        Err(Error::Timeout { attempts })
    }

    /// Send the single-byte ENQ handshake (unframed).
    ///
    /// # Errors
    /// Same contract as [`send`](Self::send).
    pub async fn send_handshake(&self) -> Result<()> {
        self.send(&[ENQ], Command::Test).await
    }

    /// Stop the reader task and give up the port.
    pub fn shutdown(&self) {
        debug!("link engine shutting down");
        self.reader.abort();
    }

    /// True until the reader task has terminated.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.reader.is_finished()
    }
}

impl Drop for LinkEngine {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::io;

    /// In-memory port: reads are fed by the test, writes are recorded.
    struct ScriptPort {
        inbound: tokio::sync::Mutex<Inbound>,
        written: Mutex<Vec<u8>>,
    }

    struct Inbound {
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
        pending: VecDeque<u8>,
    }

    struct ScriptHandle {
        tx: mpsc::UnboundedSender<Vec<u8>>,
    }

    fn script_port() -> (Arc<ScriptPort>, ScriptHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(ScriptPort {
                inbound: tokio::sync::Mutex::new(Inbound {
                    rx,
                    pending: VecDeque::new(),
                }),
                written: Mutex::new(Vec::new()),
            }),
            ScriptHandle { tx },
        )
    }

    impl ScriptPort {
        fn written(&self) -> Vec<u8> {
            self.written.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BytePort for ScriptPort {
        async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
            let mut inbound = self.inbound.lock().await;
            if inbound.pending.is_empty() {
                match inbound.rx.recv().await {
                    Some(bytes) => inbound.pending.extend(bytes),
                    None => return Ok(0),
                }
            }
            let mut n = 0;
            while n < buf.len() {
                match inbound.pending.pop_front() {
                    Some(byte) => {
                        buf[n] = byte;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }

        async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(())
        }

        async fn discard_input(&self) -> io::Result<()> {
            Ok(())
        }
    }

    fn fast_config() -> LinkConfig {
        LinkConfig {
            send_timeout: Duration::from_millis(50),
            send_retries: 3,
            ack_delay: Duration::ZERO,
            event_buffer: 16,
        }
    }

    #[tokio::test]
    async fn test_send_accepted_on_ack() {
        let (port, handle) = script_port();
        let (engine, _events) = LinkEngine::start(port.clone(), fast_config());

        let send = tokio::spawn({
            let frame = ecrlink_protocol::build_frame(b"72");
            async move { engine.send(&frame, Command::Abort).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.tx.send(vec![ACK]).unwrap();

        send.await.unwrap().unwrap();
        assert!(port.written().starts_with(&ecrlink_protocol::build_frame(b"72")));
    }

    #[tokio::test]
    async fn test_send_retries_on_nak_then_accepts() {
        let (port, handle) = script_port();
        let (engine, _events) = LinkEngine::start(port.clone(), fast_config());

        let frame = ecrlink_protocol::build_frame(b"72");
        let send = tokio::spawn({
            let frame = frame.clone();
            async move { engine.send(&frame, Command::Abort).await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.tx.send(vec![NAK]).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.tx.send(vec![ACK]).unwrap();

        send.await.unwrap().unwrap();
        // Frame written twice: initial attempt plus one retry.
        assert_eq!(port.written().len(), frame.len() * 2);
    }

    #[tokio::test]
    async fn test_send_times_out_after_all_attempts() {
        let (port, _handle) = script_port();
        let (engine, _events) = LinkEngine::start(port, fast_config());

        let err = engine
            .send(&ecrlink_protocol::build_frame(b"72"), Command::Abort)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { attempts: 3 }));
    }

    #[tokio::test]
    async fn test_stx_reply_counts_as_accepted() {
        let (port, handle) = script_port();
        let (engine, mut events) = LinkEngine::start(port, fast_config());

        let send = tokio::spawn({
            let frame = ecrlink_protocol::build_frame(b"s00");
            async move { engine.send(&frame, Command::DeviceControl).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        // Terminal skips ACK and answers directly with a framed status.
        handle
            .tx
            .send(ecrlink_protocol::build_frame(b"2A000000042"))
            .unwrap();

        send.await.unwrap().unwrap();
        // The framed reply still arrives as a decoded message.
        let event = events.recv().await.unwrap();
        assert!(matches!(event, LinkEvent::Message(_)));
    }

    #[tokio::test]
    async fn test_reader_reports_disconnect() {
        let (port, handle) = script_port();
        let (_engine, mut events) = LinkEngine::start(port, fast_config());

        drop(handle); // read returns 0 => port closed
        let event = events.recv().await.unwrap();
        assert!(matches!(event, LinkEvent::Disconnected(_)));
    }

    #[tokio::test]
    async fn test_gate_fires_once_per_arming() {
        let gate = ResponseGate::new();
        let rx = gate.arm();
        gate.signal(ACK);
        gate.signal(NAK); // ignored: not armed any more
        assert_eq!(rx.await.unwrap(), ACK);

        let rx = gate.arm();
        gate.signal(STX);
        assert_eq!(rx.await.unwrap(), STX);
    }
}
