use std::sync::Mutex;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;

use crate::common::{ChannelEvent, ChannelState};
use crate::error::SyncError;

use super::backoff::Backoff;

/// Reconnecting WebSocket that delivers inbound message frames.
///
/// Outbound messages do not travel here; the channel reads frames and queues
/// them toward the sync engine over a bounded mpsc. The channel is owned by
/// whoever built it; `disconnect` stops the background loop and the state
/// settles at DISCONNECTED until `connect` is called again.
pub struct TransportChannel {
    url: String,
    backoff: Backoff,
    events: mpsc::Sender<ChannelEvent>,
    state_tx: watch::Sender<ChannelState>,
    worker: Mutex<Option<WorkerHandle>>,
}

/// Shutdown signal and task handle for one spawned worker. Each `connect`
/// gets a fresh pair, so stopping one worker can never leak into the next.
struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TransportChannel {
    pub fn new(
        url: impl Into<String>,
        backoff: Backoff,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        Self {
            url: url.into(),
            backoff,
            events,
            state_tx,
            worker: Mutex::new(None),
        }
    }

    /// Watch the DISCONNECTED/CONNECTING/CONNECTED/RECONNECTING state machine.
    pub fn state(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    /// Start the connect/read/reconnect loop in the background. At most one
    /// worker runs at a time; calling this again replaces the previous one.
    pub fn connect(&self, credential: impl Into<String>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = ChannelWorker {
            url: self.url.clone(),
            credential: credential.into(),
            backoff: self.backoff.clone(),
            events: self.events.clone(),
            state: self.state_tx.clone(),
            shutdown: shutdown_rx,
        };

        let Ok(mut slot) = self.worker.lock() else {
            log::error!("Channel worker slot poisoned; refusing to connect");
            return;
        };
        if let Some(old) = slot.take() {
            let _ = old.shutdown.send(true);
            old.task.abort();
        }
        let task = tokio::spawn(worker.run());
        *slot = Some(WorkerHandle {
            shutdown: shutdown_tx,
            task,
        });
    }

    /// Stop the background loop. The worker drains out on its own and the
    /// state settles at DISCONNECTED.
    pub fn disconnect(&self) {
        let Ok(slot) = self.worker.lock() else {
            return;
        };
        if let Some(handle) = slot.as_ref() {
            let _ = handle.shutdown.send(true);
        }
    }
}

struct ChannelWorker {
    url: String,
    credential: String,
    backoff: Backoff,
    events: mpsc::Sender<ChannelEvent>,
    state: watch::Sender<ChannelState>,
    shutdown: watch::Receiver<bool>,
}

impl ChannelWorker {
    async fn run(mut self) {
        let mut first_attempt = true;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            self.set_state(if first_attempt {
                ChannelState::Connecting
            } else {
                ChannelState::Reconnecting
            });
            first_attempt = false;

            if let Err(err) = self.connect_once().await {
                log::warn!("Channel connection to {} failed: {err}", self.url);
            }
            if *self.shutdown.borrow() {
                break;
            }

            let delay = self.backoff.next_delay();
            log::info!("Reconnecting to {} in {delay:?}", self.url);
            self.set_state(ChannelState::Reconnecting);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => {}
            }
        }
        self.set_state(ChannelState::Disconnected);
        log::info!("Channel loop for {} stopped", self.url);
    }

    /// One handshake plus the read loop until the socket drops or shutdown.
    async fn connect_once(&mut self) -> Result<(), SyncError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| SyncError::Channel(err.to_string()))?;
        let bearer = format!("Bearer {}", self.credential)
            .parse()
            .map_err(|_| SyncError::Channel("credential is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _) = connect_async(request)
            .await
            .map_err(|err| SyncError::Channel(err.to_string()))?;

        log::info!("Channel connected to {}", self.url);
        self.backoff.reset();
        self.set_state(ChannelState::Connected);
        let _ = self.events.send(ChannelEvent::Connected).await;

        let (mut sink, mut source) = stream.split();
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        return Ok(());
                    }
                }
                frame = source.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            if self
                                .events
                                .send(ChannelEvent::InboundFrame(text.to_string()))
                                .await
                                .is_err()
                            {
                                // Engine side hung up; nothing left to deliver to.
                                return Ok(());
                            }
                        }
                        Some(Ok(WsMessage::Ping(payload))) => {
                            sink.send(WsMessage::Pong(payload))
                                .await
                                .map_err(|err| SyncError::Channel(err.to_string()))?;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            log::info!("Channel closed by remote");
                            let _ = self.events.send(ChannelEvent::Disconnected).await;
                            return Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            let _ = self.events.send(ChannelEvent::Disconnected).await;
                            return Err(SyncError::Channel(err.to_string()));
                        }
                    }
                }
            }
        }
    }

    fn set_state(&self, state: ChannelState) {
        let _ = self.state.send_replace(state);
    }
}
