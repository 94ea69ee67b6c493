//! # Loopback Transport
//!
//! Connects clients to a [`Host`] in the same process.
//!
//! Requests are handled synchronously on the calling thread. Notifications are
//! queued on a tokio channel and processed by whoever owns the
//! [`NotificationQueue`], so host code never re-enters a client while handling a
//! request.

use std::sync::Arc;

use remorpc::REQUEST_CHANNEL;
use tokio::sync::mpsc;

use crate::client::RemoteClient;
use crate::host::Endpoint;
use crate::host::Host;
use crate::transport;
use crate::transport::Channel;
use crate::transport::FrameId;
use crate::transport::FrameSink;
use crate::transport::TransportError;

/// One message the host sent to a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub frame: FrameId,
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Host-side sink that queues notifications for the client side.
pub struct QueueSink {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl QueueSink {
    pub fn new() -> (Self, NotificationQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (QueueSink { tx }, NotificationQueue { rx })
    }
}

impl FrameSink for QueueSink {
    fn send_to_frame(&self, frame: FrameId, channel: &str, payload: &[u8]) -> transport::Result<()> {
        self.tx
            .send(Delivery { frame, channel: channel.to_string(), payload: payload.to_vec() })
            .map_err(|_| TransportError::Closed("notification queue dropped".into()))
    }
}

/// Client-side end of the notification queue.
pub struct NotificationQueue {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl NotificationQueue {
    /// The next queued delivery, without waiting.
    pub fn try_next(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }

    /// Waits for the next delivery. `None` once the host side is gone.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

/// Client-side channel calling straight into the host.
pub struct LoopbackChannel {
    host: Arc<Host>,
    endpoint: Arc<Endpoint>,
    frame: FrameId,
}

impl LoopbackChannel {
    pub fn new(host: Arc<Host>, endpoint: Arc<Endpoint>, frame: FrameId) -> Self {
        LoopbackChannel { host, endpoint, frame }
    }

    fn deliver(&self, channel: &str, payload: &[u8]) -> transport::Result<Vec<u8>> {
        if channel != REQUEST_CHANNEL {
            return Err(TransportError::UnknownChannel(channel.to_string()));
        }
        if self.endpoint.is_destroyed() {
            return Err(TransportError::Closed(format!("endpoint {} destroyed", self.endpoint.id())));
        }
        Ok(self.host.handle(&self.endpoint, self.frame, payload))
    }
}

impl Channel for LoopbackChannel {
    fn send_sync(&self, channel: &str, payload: &[u8]) -> transport::Result<Vec<u8>> {
        self.deliver(channel, payload)
    }

    fn send(&self, channel: &str, payload: &[u8]) -> transport::Result<()> {
        self.deliver(channel, payload).map(|_| ())
    }
}

/// Both ends of an in-process connection.
pub struct Loopback {
    pub endpoint: Arc<Endpoint>,
    pub channel: Arc<LoopbackChannel>,
    pub notifications: NotificationQueue,
}

impl Loopback {
    /// A new client context on this connection.
    pub fn client(&self) -> RemoteClient {
        RemoteClient::builder(self.channel.clone()).build()
    }
}

/// Opens a connection to `host` through a fresh endpoint on frame 0.
pub fn connect(host: &Arc<Host>) -> Loopback {
    connect_with(host, |endpoint| endpoint)
}

/// Like [`connect`], letting the caller configure the endpoint first.
pub fn connect_with(host: &Arc<Host>, configure: impl FnOnce(Endpoint) -> Endpoint) -> Loopback {
    let (sink, notifications) = QueueSink::new();
    let endpoint = Arc::new(configure(Endpoint::new(Arc::new(sink))));
    let channel = Arc::new(LoopbackChannel::new(Arc::clone(host), Arc::clone(&endpoint), 0));
    Loopback { endpoint, channel, notifications }
}
