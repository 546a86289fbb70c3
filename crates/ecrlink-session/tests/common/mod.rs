//! Shared test fixtures: an in-memory byte port that plays the terminal.

use async_trait::async_trait;
use ecrlink_core::constants::{ACK, ENQ, STX};
use ecrlink_link::BytePort;
use ecrlink_protocol::build_frame;
use ecrlink_session::{ManagerConfig, PortFactory};
use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Scripted terminal side of the link.
///
/// Reads block on an injection channel; writes are recorded per call. With
/// `auto_ack` on (the default) the mock immediately acknowledges every host
/// frame and the ENQ handshake, which is what a healthy terminal does.
pub struct MockPort {
    inbound: tokio::sync::Mutex<Inbound>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    writes: Mutex<Vec<Vec<u8>>>,
    auto_ack: AtomicBool,
}

struct Inbound {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: VecDeque<u8>,
}

/// Test-side handle for injecting terminal traffic and observing writes.
#[derive(Clone)]
pub struct TerminalScript {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    port: Arc<MockPort>,
}

pub fn mock_port() -> (Arc<MockPort>, TerminalScript) {
    let (tx, rx) = mpsc::unbounded_channel();
    let port = Arc::new(MockPort {
        inbound: tokio::sync::Mutex::new(Inbound {
            rx,
            pending: VecDeque::new(),
        }),
        tx: tx.clone(),
        writes: Mutex::new(Vec::new()),
        auto_ack: AtomicBool::new(true),
    });
    let script = TerminalScript {
        tx,
        port: Arc::clone(&port),
    };
    (port, script)
}

impl TerminalScript {
    /// Stop acknowledging host frames automatically.
    pub fn manual_flow_control(&self) {
        self.port.auto_ack.store(false, Ordering::SeqCst);
    }

    /// Inject raw bytes on the terminal-to-host direction.
    pub fn inject(&self, bytes: impl Into<Vec<u8>>) {
        self.tx.send(bytes.into()).expect("reader gone");
    }

    /// Inject a framed payload.
    pub fn inject_frame(&self, payload: &[u8]) {
        self.inject(build_frame(payload));
    }

    /// Simulate the terminal going away: the next read returns EOF.
    pub fn drop_link(&self) {
        self.inject(Vec::new());
    }

    /// All host writes so far, one entry per `write_all` call.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.port.writes.lock().unwrap().clone()
    }

    /// Wait until the host writes something matching `pred`.
    pub async fn await_write<F>(&self, pred: F) -> Vec<u8>
    where
        F: Fn(&[u8]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(hit) = self.writes().iter().find(|w| pred(w)) {
                return hit.clone();
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "host never wrote the expected bytes; writes so far: {:?}",
                self.writes()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Wait for the n-th framed transaction request (STX + 80 bytes).
    pub async fn await_transaction_frame(&self, nth: usize) -> Vec<u8> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let frames: Vec<_> = self
                .writes()
                .into_iter()
                .filter(|w| w.len() == 83 && w[0] == STX && w[1] == b'y')
                .collect();
            if frames.len() > nth {
                return frames[nth].clone();
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "transaction frame {nth} never written; writes so far: {:?}",
                self.writes()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl BytePort for MockPort {
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
        self.writes.lock().unwrap().push(buf.to_vec());
        if self.auto_ack.load(Ordering::SeqCst) {
            let is_host_frame = buf.first() == Some(&STX) || buf == [ENQ];
            if is_host_frame {
                let _ = self.tx.send(vec![ACK]);
            }
        }
        Ok(())
    }

    async fn discard_input(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Manager configuration tuned for fast tests.
pub fn fast_config() -> ManagerConfig {
    let mut config = ManagerConfig::new("mock");
    config.link.ack_delay = Duration::ZERO;
    config.link.send_timeout = Duration::from_millis(100);
    config.bonus_disable_delay = Duration::from_millis(20);
    config
}

/// Port factory handing out the given mock port.
pub fn factory_for(port: Arc<MockPort>) -> PortFactory {
    Box::new(move || Ok(Arc::clone(&port) as Arc<dyn BytePort>))
}

/// Build a short-layout (`4`) transaction result payload.
pub fn result_payload(transaction_id: &str, amount_minor: u64) -> Vec<u8> {
    let mut p = Vec::new();
    p.push(b'4');
    p.push(b'0'); // transaction type
    p.push(b'1'); // payment method
    p.push(b'2'); // card type
    p.push(b'0'); // usage
    p.extend_from_slice(b"01"); // settlement id
    p.extend_from_slice(format!("{:<19}", "541333******1234").as_bytes());
    p.extend_from_slice(format!("{:<32}", "A0000000041010").as_bytes());
    p.extend_from_slice(format!("{:<16}", "0123456789ABCDEF").as_bytes());
    p.extend_from_slice(b"0000048000"); // TVR
    p.extend_from_slice(b"E800"); // TSI
    p.extend_from_slice(transaction_id.as_bytes());
    p.extend_from_slice(b"000000000123"); // filing code
    p.extend_from_slice(b"260802143015"); // timestamp
    p.extend_from_slice(format!("{amount_minor:07}").as_bytes());
    p.extend_from_slice(b"978"); // currency
    p.extend_from_slice(b"000001234"); // reader serial
    p.push(b'1'); // print payee receipt
    p.push(b'0'); // flags
    p
}
