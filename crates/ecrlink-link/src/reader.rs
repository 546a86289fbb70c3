//! The reader loop: the single long-lived task that owns the receive side.
//!
//! The reader pulls bytes from the port, classifies the first response byte
//! for the sender rendezvous (ACK, NAK or STX outside a frame), assembles
//! frames, answers each part with ACK or NAK, and pushes decoded messages in
//! wire order into the engine's event channel. It exits when the port fails
//! or the engine is torn down; the failure is forwarded as a single
//! communication error so the coordinator can release the engine.

use crate::engine::ResponseGate;
use crate::port::BytePort;
use ecrlink_protocol::{WireAssembler, WireEvent, WireMessage, decode_payload};
use ecrlink_core::constants::{ACK, NAK, STX};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Events the link layer delivers to its consumer (the session coordinator).
#[derive(Debug)]
pub enum LinkEvent {
    /// A decoded terminal message, in wire order.
    Message(WireMessage),

    /// The reader died on a port error; the engine must be released.
    Disconnected(String),
}

/// Spawn the reader task on the given port.
pub(crate) fn spawn_reader(
    port: Arc<dyn BytePort>,
    gate: Arc<ResponseGate>,
    events: mpsc::Sender<LinkEvent>,
    ack_delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reason = read_loop(port, gate, &events, ack_delay).await;
        if let Some(reason) = reason {
            warn!(%reason, "reader loop terminated");
            let _ = events.send(LinkEvent::Disconnected(reason)).await;
        } else {
            debug!("reader loop stopped: consumer went away");
        }
    })
}

/// Run until the port fails (`Some(reason)`) or the consumer drops (`None`).
async fn read_loop(
    port: Arc<dyn BytePort>,
    gate: Arc<ResponseGate>,
    events: &mpsc::Sender<LinkEvent>,
    ack_delay: Duration,
) -> Option<String> {
    let mut assembler = WireAssembler::new();
    let mut buf = [0u8; 64];

    loop {
        let n = match port.read(&mut buf).await {
            Ok(0) => return Some("port closed".to_string()),
            Ok(n) => n,
            Err(e) => return Some(format!("port read failed: {e}")),
        };

        for &byte in &buf[..n] {
            // The first response byte after a write is whatever arrives
            // outside a frame: ACK, NAK, or the STX of an immediate reply.
            if !assembler.in_frame() && matches!(byte, ACK | NAK | STX) {
                gate.signal(byte);
            }

            let Some(event) = assembler.push(byte) else {
                continue;
            };
            match event {
                WireEvent::Ack | WireEvent::Nak => {
                    trace!(byte, "flow-control byte consumed by rendezvous");
                }
                WireEvent::Enq => debug!("terminal handshake (ENQ) received"),
                WireEvent::Noise(b) => debug!(byte = b, "ignoring byte outside frame"),
                WireEvent::Part => {
                    if let Err(e) = acknowledge(&*port, ACK, ack_delay).await {
                        return Some(format!("cannot acknowledge part: {e}"));
                    }
                }
                WireEvent::BadChecksum { computed, received } => {
                    warn!(computed, received, "frame checksum mismatch, resynchronizing");
                    if let Err(e) = acknowledge(&*port, NAK, ack_delay).await {
                        return Some(format!("cannot reject part: {e}"));
                    }
                }
                WireEvent::Frame(payload) => {
                    if let Err(e) = acknowledge(&*port, ACK, ack_delay).await {
                        return Some(format!("cannot acknowledge frame: {e}"));
                    }
                    match decode_payload(&payload) {
                        Ok(message) => {
                            if dispatch(events, message).await.is_err() {
                                return None;
                            }
                        }
                        Err(e) => warn!(error = %e, "dropping undecodable payload"),
                    }
                }
            }
        }
    }
}

/// Answer a received part after the configured bus-turnaround delay.
async fn acknowledge(port: &dyn BytePort, byte: u8, delay: Duration) -> std::io::Result<()> {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    port.write_all(&[byte]).await
}

async fn dispatch(
    events: &mpsc::Sender<LinkEvent>,
    message: WireMessage,
) -> Result<(), mpsc::error::SendError<LinkEvent>> {
    trace!(?message, "dispatching terminal message");
    events.send(LinkEvent::Message(message)).await
}
