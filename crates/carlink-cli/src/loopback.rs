//! In-process link between a simulated head unit and a simulated phone.
//!
//! The head unit's [`SecureChannel`] writes into a tokio channel; the relay
//! hands each frame to the phone's [`Companion`] and feeds the replies back.

use std::sync::{Arc, Mutex};

use anyhow::{Context, bail};
use carlink_channel::{
    Callback, ChannelError, Companion, DeviceMessage, HandshakeFlavor, MessageStream,
    OperationType, SecureChannel,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

type Frame = (DeviceMessage, OperationType);

/// Head-unit side of the link.
#[derive(Debug)]
pub struct LinkStream(mpsc::UnboundedSender<Frame>);

impl MessageStream for LinkStream {
    fn write_message(&mut self, message: DeviceMessage, operation: OperationType) {
        if self.0.send((message, operation)).is_err() {
            warn!("phone side of the link is gone, dropping frame");
        }
    }
}

/// Create a link: the stream for the head unit, the receiver for the relay.
pub fn link() -> (LinkStream, mpsc::UnboundedReceiver<Frame>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LinkStream(tx), rx)
}

/// What the head unit reported through its callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadUnitEvent {
    DeviceId(String),
    Established,
    Failed(String),
}

/// Callback that records head-unit lifecycle events.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<HeadUnitEvent>>>);

impl EventLog {
    fn push(&self, event: HeadUnitEvent) {
        if let Ok(mut events) = self.0.lock() {
            events.push(event);
        }
    }

    pub fn events(&self) -> Vec<HeadUnitEvent> {
        self.0.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// The failure message, if the head unit reported one.
    pub fn failure(&self) -> Option<String> {
        self.events().into_iter().find_map(|e| match e {
            HeadUnitEvent::Failed(msg) => Some(msg),
            _ => None,
        })
    }
}

impl Callback for EventLog {
    fn on_secure_channel_established(&mut self) {
        self.push(HeadUnitEvent::Established);
    }

    fn on_secure_channel_failure(&mut self, error: &ChannelError) {
        self.push(HeadUnitEvent::Failed(format!("{}: {error}", error.code())));
    }

    fn on_device_id_received(&mut self, device_id: &str) {
        self.push(HeadUnitEvent::DeviceId(device_id.to_string()));
    }
}

/// Bail out with the head unit's own error if it failed.
pub fn check_head_unit<F: HandshakeFlavor>(
    car: &SecureChannel<F>,
    events: &EventLog,
) -> anyhow::Result<()> {
    if car.is_failed() {
        let reason = events
            .failure()
            .unwrap_or_else(|| "unknown failure".to_string());
        bail!("head unit rejected the handshake ({reason})");
    }
    Ok(())
}

/// Deliver one head-unit frame to the phone and its replies back.
pub async fn relay_once<F: HandshakeFlavor>(
    car: &mut SecureChannel<F>,
    phone: &mut Companion,
    frames: &mut mpsc::UnboundedReceiver<Frame>,
) -> anyhow::Result<()> {
    let (frame, operation) = frames
        .recv()
        .await
        .context("head unit closed the link")?;
    debug!(?operation, len = frame.payload.len(), "head unit -> phone");
    let replies = phone.handle(&frame).context("phone rejected a handshake frame")?;
    for reply in replies {
        debug!(len = reply.payload.len(), "phone -> head unit");
        car.on_message_received(reply, OperationType::EncryptionHandshake);
    }
    Ok(())
}
