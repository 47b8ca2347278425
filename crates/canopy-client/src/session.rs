//! Instrument session
//!
//! Owns the protocol engine and the transport, and runs the event loop that
//! connects them: inbound notifications are stripped of their sequence byte
//! and fed to the engine, outbound frames are flushed after every engine
//! interaction, and a periodic heartbeat keeps the link alive once the
//! session is initialized.

use canopy_core::{Engine, Event, NodeId, Value};
use canopy_transport::{
    BleConfig, BleTransport, TransportEvent, TransportReceiver, TransportSender,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{SessionBuilder, SessionConfig};
use crate::error::{ClientError, Result};

/// A live session with one instrument.
///
/// Cheap to share; all methods take `&self`. Dropping the session does not
/// stop the event loop, call [`Session::stop`] for a clean teardown.
pub struct Session {
    engine: Arc<Mutex<Engine>>,
    sender: Arc<dyn TransportSender>,
    shutdown: Arc<Notify>,
    initialized: watch::Receiver<bool>,
}

impl Session {
    /// Create a builder.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Scan, connect and start a session over BLE.
    pub(crate) async fn connect_ble(config: SessionConfig) -> Result<Self> {
        let transport = BleTransport::with_config(BleConfig {
            device_name_filter: config.device_name_filter.clone(),
            scan_timeout: config.scan_timeout,
        })
        .await?;
        let device = transport.find_instrument().await?;
        let (sender, receiver) = transport.connect(&device).await?;
        Self::start(config, Arc::new(sender), Box::new(receiver)).await
    }

    /// Start a session over an already-connected transport.
    ///
    /// Sends the tree request immediately; the instrument answers with its
    /// descriptor and the engine takes the handshake from there.
    pub async fn start(
        config: SessionConfig,
        sender: Arc<dyn TransportSender>,
        receiver: Box<dyn TransportReceiver>,
    ) -> Result<Self> {
        let engine = Arc::new(Mutex::new(Engine::new(config.engine_config())));
        let shutdown = Arc::new(Notify::new());
        let (init_tx, init_rx) = watch::channel(false);

        engine.lock().request_tree();
        flush(&engine, sender.as_ref()).await?;

        tokio::spawn(run_loop(
            config,
            engine.clone(),
            sender.clone(),
            receiver,
            init_tx,
            shutdown.clone(),
        ));

        Ok(Self {
            engine,
            sender,
            shutdown,
            initialized: init_rx,
        })
    }

    /// Wait until the checksum handshake completes and values start flowing.
    pub async fn wait_until_initialized(&self) -> Result<()> {
        let mut rx = self.initialized.clone();
        while !*rx.borrow() {
            rx.changed().await.map_err(|_| ClientError::SessionClosed)?;
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        *self.initialized.borrow()
    }

    /// Resolve a colon-separated path, e.g. `"SAMPLING:TRIGGER:CONTINUOUS"`.
    pub fn find(&self, path: &str) -> Option<NodeId> {
        self.engine.lock().find(path)
    }

    /// Snapshot of a node's current value.
    pub fn value(&self, path: &str) -> Option<Value> {
        let engine = self.engine.lock();
        let node = engine.find(path)?;
        engine.value(node).cloned()
    }

    /// Register a callback invoked on every update of the node at `path`.
    pub fn subscribe<F>(&self, path: &str, callback: F) -> Result<u32>
    where
        F: Fn(&Value) + Send + 'static,
    {
        let mut engine = self.engine.lock();
        let node = engine
            .find(path)
            .ok_or_else(|| canopy_core::Error::NodeNotFound(path.to_string()))?;
        Ok(engine.subscribe(node, Box::new(callback))?)
    }

    /// Remove a subscription returned by [`Session::subscribe`].
    pub fn unsubscribe(&self, path: &str, sub_id: u32) -> bool {
        let mut engine = self.engine.lock();
        match engine.find(path) {
            Some(node) => engine.unsubscribe(node, sub_id),
            None => false,
        }
    }

    /// Ask the instrument to send the current value of the node at `path`.
    pub async fn request(&self, path: &str) -> Result<()> {
        self.engine.lock().request_path(path)?;
        flush(&self.engine, self.sender.as_ref()).await
    }

    /// Write a value to the node at `path`.
    pub async fn set(&self, path: &str, value: Value) -> Result<()> {
        {
            let mut engine = self.engine.lock();
            let node = engine
                .find(path)
                .ok_or_else(|| canopy_core::Error::NodeNotFound(path.to_string()))?;
            engine.write_value(node, value)?;
        }
        flush(&self.engine, self.sender.as_ref()).await
    }

    /// Select a chooser option by path, e.g. `"SAMPLING:TRIGGER:SINGLE"`.
    pub async fn choose(&self, path: &str) -> Result<()> {
        {
            let mut engine = self.engine.lock();
            let node = engine
                .find(path)
                .ok_or_else(|| canopy_core::Error::NodeNotFound(path.to_string()))?;
            engine.choose(node)?;
        }
        flush(&self.engine, self.sender.as_ref()).await
    }

    /// Stop the event loop and close the transport.
    pub async fn stop(&self) -> Result<()> {
        self.shutdown.notify_waiters();
        self.sender.close().await?;
        info!("session stopped");
        Ok(())
    }
}

/// Send everything the engine queued. The lock is released before awaiting.
async fn flush(engine: &Arc<Mutex<Engine>>, sender: &dyn TransportSender) -> Result<()> {
    let frames = engine.lock().drain_outbound();
    for frame in frames {
        sender.send(frame).await?;
    }
    Ok(())
}

async fn run_loop(
    config: SessionConfig,
    engine: Arc<Mutex<Engine>>,
    sender: Arc<dyn TransportSender>,
    mut receiver: Box<dyn TransportReceiver>,
    init_tx: watch::Sender<bool>,
    shutdown: Arc<Notify>,
) {
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut recv_seq: Option<u8> = None;

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                debug!("event loop shutting down");
                break;
            }

            _ = heartbeat.tick() => {
                if !*init_tx.borrow() {
                    continue;
                }
                if let Err(e) = engine.lock().request_path(&config.heartbeat_path) {
                    warn!("heartbeat request failed: {e}");
                }
                if let Err(e) = flush(&engine, sender.as_ref()).await {
                    error!("heartbeat send failed: {e}");
                    break;
                }
            }

            event = receiver.recv() => match event {
                Some(TransportEvent::Data(data)) => {
                    if !handle_fragment(&engine, &init_tx, &mut recv_seq, &data) {
                        break;
                    }
                    if let Err(e) = flush(&engine, sender.as_ref()).await {
                        error!("send failed: {e}");
                        break;
                    }
                }
                Some(TransportEvent::Disconnected { reason }) => {
                    info!(?reason, "instrument disconnected");
                    break;
                }
                None => {
                    info!("transport closed");
                    break;
                }
            },
        }
    }
    // dropping init_tx wakes anyone blocked in wait_until_initialized
}

/// Strip the sequence byte and feed the fragment to the engine. Returns
/// false when the session must end.
fn handle_fragment(
    engine: &Arc<Mutex<Engine>>,
    init_tx: &watch::Sender<bool>,
    recv_seq: &mut Option<u8>,
    data: &[u8],
) -> bool {
    let Some((&seq, payload)) = data.split_first() else {
        return true;
    };
    if let Some(prev) = *recv_seq {
        let expected = prev.wrapping_add(1);
        if seq != expected {
            warn!(seq, expected, "notification sequence gap");
        }
    }
    *recv_seq = Some(seq);

    let events = match engine.lock().receive(payload) {
        Ok(events) => events,
        Err(e) => {
            error!("protocol failure: {e}");
            return false;
        }
    };
    for event in events {
        match event {
            Event::TreeReady { checksum } => {
                info!(checksum = format_args!("0x{checksum:08x}"), "capability tree received");
            }
            Event::Initialized => {
                let _ = init_tx.send(true);
            }
            Event::ValueUpdated { .. } => {}
        }
    }
    true
}
