//! Signaled point-to-point data channel
//!
//! One reliable-ordered channel per peer pair, carried over TCP with a
//! 4-byte length prefix per frame. There is no rendezvous server: the
//! offering side binds a listener and publishes its address inside an
//! offer token (see `core_signal`), the accepting side decodes the
//! token, dials, and hands back an answer token naming itself.
//!
//! Roles after setup:
//! - the offerer keeps its listener and passively re-accepts;
//! - the accepter is the connection initiator and redials with a
//!   bounded backoff whenever the link drops.
//!
//! `send` fails fast with `ChannelNotOpen` unless the link is open.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core_signal::{SignalKind, SignalRecord};
use crate::core_wire::{DeviceId, Envelope};
use crate::metrics::record_counter;

use super::{gate_inbound, LinkState, Transport, TransportError};

/// Upper bound on a single frame; anything larger is a broken peer.
const MAX_FRAME_BYTES: u32 = 1 << 20;

struct Shared {
    local_id: DeviceId,
    shared_secret: String,
    writer: Mutex<Option<OwnedWriteHalf>>,
    state: watch::Sender<LinkState>,
    inbound_tx: mpsc::Sender<Envelope>,
    closed: AtomicBool,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    /// Peer id learned from the answer token, for logs only; the wire
    /// gate is what actually authenticates frames.
    remote_id: StdMutex<Option<DeviceId>>,
}

impl Shared {
    fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().expect("task list poisoned").push(handle);
    }
}

pub struct DataChannelTransport {
    shared: Arc<Shared>,
    incoming: StdMutex<Option<mpsc::Receiver<Envelope>>>,
}

impl DataChannelTransport {
    fn new(local_id: DeviceId, shared_secret: String, capacity: usize) -> (Self, Arc<Shared>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (state, _) = watch::channel(LinkState::Connecting);
        let shared = Arc::new(Shared {
            local_id,
            shared_secret,
            writer: Mutex::new(None),
            state,
            inbound_tx,
            closed: AtomicBool::new(false),
            tasks: StdMutex::new(Vec::new()),
            remote_id: StdMutex::new(None),
        });
        (
            Self {
                shared: shared.clone(),
                incoming: StdMutex::new(Some(inbound_rx)),
            },
            shared,
        )
    }

    /// Create the offering side: bind a listener and produce the offer
    /// token to hand out of band. The channel stays `Connecting` until a
    /// peer dials in.
    pub async fn offer(
        local_id: DeviceId,
        config: &Config,
    ) -> Result<(Self, SignalRecord), TransportError> {
        let listener = TcpListener::bind(&config.transport.bind_address)
            .await
            .map_err(|e| TransportError::Signal(format!("bind failed: {}", e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::Signal(e.to_string()))?;

        let (transport, shared) = Self::new(
            local_id.clone(),
            config.mesh.shared_secret.clone(),
            config.transport.channel_capacity,
        );

        let accept_shared = shared.clone();
        shared.track(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        if accept_shared.closed.load(Ordering::SeqCst) {
                            break;
                        }
                        info!(peer = %peer_addr, "data channel peer connected");
                        adopt_stream(accept_shared.clone(), stream).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "data channel accept failed");
                    }
                }
            }
        }));

        let offer = SignalRecord {
            kind: SignalKind::Offer,
            sdp: local_addr.to_string(),
            peer_id: local_id,
            secret: config.mesh.shared_secret.clone(),
        };
        Ok((transport, offer))
    }

    /// Create the accepting side from a decoded offer: dial the offerer
    /// and produce the answer token to hand back. The accepter is the
    /// initiator and owns reconnection.
    pub async fn accept(
        offer: &SignalRecord,
        local_id: DeviceId,
        config: &Config,
    ) -> Result<(Self, SignalRecord), TransportError> {
        if offer.kind != SignalKind::Offer {
            return Err(TransportError::Signal(
                "expected an offer token".to_string(),
            ));
        }

        let (transport, shared) = Self::new(
            local_id.clone(),
            config.mesh.shared_secret.clone(),
            config.transport.channel_capacity,
        );
        *shared.remote_id.lock().expect("remote id poisoned") = Some(offer.peer_id.clone());

        let stream = TcpStream::connect(&offer.sdp)
            .await
            .map_err(|e| TransportError::Signal(format!("dial {} failed: {}", offer.sdp, e)))?;
        adopt_stream(shared.clone(), stream).await;

        // Reconnect supervisor: redial on close, bounded backoff.
        let addr = offer.sdp.clone();
        let backoff = config.transport.reconnect_backoff;
        let reconnect_shared = shared.clone();
        shared.track(tokio::spawn(async move {
            reconnect_loop(reconnect_shared, addr, backoff).await;
        }));

        let answer = SignalRecord {
            kind: SignalKind::Answer,
            sdp: String::new(),
            peer_id: local_id,
            secret: config.mesh.shared_secret.clone(),
        };
        Ok((transport, answer))
    }

    /// Record the peer identity from the answer token on the offering
    /// side, completing the exchange.
    pub fn apply_answer(&self, answer: &SignalRecord) -> Result<(), TransportError> {
        if answer.kind != SignalKind::Answer {
            return Err(TransportError::Signal(
                "expected an answer token".to_string(),
            ));
        }
        debug!(peer = %answer.peer_id, "answer applied");
        *self
            .shared
            .remote_id
            .lock()
            .expect("remote id poisoned") = Some(answer.peer_id.clone());
        Ok(())
    }

    /// Peer identity learned during signaling, if the exchange finished.
    pub fn remote_id(&self) -> Option<DeviceId> {
        self.shared
            .remote_id
            .lock()
            .expect("remote id poisoned")
            .clone()
    }
}

async fn reconnect_loop(shared: Arc<Shared>, addr: String, backoff: Duration) {
    let mut state_rx = shared.state.subscribe();
    loop {
        if shared.closed.load(Ordering::SeqCst) {
            break;
        }
        let current = *state_rx.borrow();
        if current == LinkState::Closed {
            tokio::time::sleep(backoff).await;
            if shared.closed.load(Ordering::SeqCst) {
                break;
            }
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    info!(addr = %addr, "data channel reconnected");
                    adopt_stream(shared.clone(), stream).await;
                }
                Err(e) => {
                    debug!(addr = %addr, error = %e, "reconnect attempt failed");
                }
            }
        } else if state_rx.changed().await.is_err() {
            break;
        }
    }
}

/// Install an established stream: park the write half for `send` and
/// spawn the framed read loop. Flips the channel to `Open`.
async fn adopt_stream(shared: Arc<Shared>, stream: TcpStream) {
    let (mut read_half, write_half) = stream.into_split();
    *shared.writer.lock().await = Some(write_half);
    shared.state.send_replace(LinkState::Open);

    let read_shared = shared.clone();
    let handle = tokio::spawn(async move {
        loop {
            let mut len_buf = [0u8; 4];
            if read_shared_closed(&read_shared) || read_half.read_exact(&mut len_buf).await.is_err()
            {
                break;
            }
            let len = u32::from_be_bytes(len_buf);
            if len == 0 || len > MAX_FRAME_BYTES {
                warn!(len, "dropping connection after oversized frame header");
                break;
            }
            let mut frame = vec![0u8; len as usize];
            if read_half.read_exact(&mut frame).await.is_err() {
                break;
            }
            if let Some(envelope) = gate_inbound(
                &frame,
                &read_shared.local_id,
                &read_shared.shared_secret,
                "data-channel",
            ) {
                if read_shared.inbound_tx.send(envelope).await.is_err() {
                    break;
                }
            }
        }
        // Connection gone; drop our write half and flip to Closed so
        // the reconnect supervisor (if any) takes over.
        *read_shared.writer.lock().await = None;
        if !read_shared.closed.load(Ordering::SeqCst) {
            read_shared.state.send_replace(LinkState::Closed);
        }
    });
    shared.track(handle);
}

fn read_shared_closed(shared: &Shared) -> bool {
    shared.closed.load(Ordering::SeqCst)
}

#[async_trait]
impl Transport for DataChannelTransport {
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            debug!(kind = envelope.body.kind(), "send after close ignored");
            return Ok(());
        }
        let bytes = envelope
            .to_bytes()
            .map_err(|e| TransportError::Send(e.to_string()))?;

        let mut writer = self.shared.writer.lock().await;
        let Some(w) = writer.as_mut() else {
            return Err(TransportError::ChannelNotOpen);
        };

        let len = (bytes.len() as u32).to_be_bytes();
        let result = async {
            w.write_all(&len).await?;
            w.write_all(&bytes).await
        }
        .await;

        match result {
            Ok(()) => {
                record_counter("sync.messages.sent", 1);
                Ok(())
            }
            Err(e) => {
                *writer = None;
                self.shared.state.send_replace(LinkState::Closed);
                Err(TransportError::Send(e.to_string()))
            }
        }
    }

    fn take_incoming(&self) -> Result<mpsc::Receiver<Envelope>, TransportError> {
        self.incoming
            .lock()
            .expect("incoming slot poisoned")
            .take()
            .ok_or(TransportError::ReceiverTaken)
    }

    fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.shared.state.subscribe()
    }

    async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        // Dropping the write half sends FIN so the peer's read loop ends.
        *self.shared.writer.lock().await = None;
        for task in self
            .shared
            .tasks
            .lock()
            .expect("task list poisoned")
            .drain(..)
        {
            task.abort();
        }
        self.shared.state.send_replace(LinkState::Closed);
    }

    fn name(&self) -> &'static str {
        "data-channel"
    }
}

impl Drop for DataChannelTransport {
    fn drop(&mut self) {
        for task in self
            .shared
            .tasks
            .lock()
            .expect("task list poisoned")
            .drain(..)
        {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_wire::{now_ms, MessageBody};

    fn config() -> Config {
        let mut config = Config::default();
        config.transport.reconnect_backoff = Duration::from_millis(50);
        config
    }

    fn heartbeat(id: &str) -> Envelope {
        Envelope::new(
            MessageBody::Heartbeat,
            DeviceId::from(id),
            "brewcast-local".to_string(),
            now_ms(),
        )
    }

    async fn wait_for_open(transport: &DataChannelTransport) {
        let mut state = transport.watch_state();
        tokio::time::timeout(Duration::from_secs(2), async {
            while *state.borrow() != LinkState::Open {
                state.changed().await.unwrap();
            }
        })
        .await
        .expect("channel did not open");
    }

    #[tokio::test]
    async fn test_offer_accept_opens_both_sides() {
        let cfg = config();
        let (offerer, offer) = DataChannelTransport::offer(DeviceId::from("d1"), &cfg)
            .await
            .unwrap();
        let (accepter, answer) =
            DataChannelTransport::accept(&offer, DeviceId::from("d2"), &cfg)
                .await
                .unwrap();
        offerer.apply_answer(&answer).unwrap();

        wait_for_open(&offerer).await;
        wait_for_open(&accepter).await;
        assert_eq!(offerer.remote_id(), Some(DeviceId::from("d2")));
        assert_eq!(accepter.remote_id(), Some(DeviceId::from("d1")));
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let cfg = config();
        let (offerer, offer) = DataChannelTransport::offer(DeviceId::from("d1"), &cfg)
            .await
            .unwrap();
        let (accepter, _answer) =
            DataChannelTransport::accept(&offer, DeviceId::from("d2"), &cfg)
                .await
                .unwrap();
        wait_for_open(&offerer).await;
        wait_for_open(&accepter).await;

        let mut rx1 = offerer.take_incoming().unwrap();
        let mut rx2 = accepter.take_incoming().unwrap();

        offerer.send(&heartbeat("d1")).await.unwrap();
        accepter.send(&heartbeat("d2")).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), rx2.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.sender_id, DeviceId::from("d1"));

        let got = tokio::time::timeout(Duration::from_secs(1), rx1.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.sender_id, DeviceId::from("d2"));
    }

    #[tokio::test]
    async fn test_send_fails_fast_before_open() {
        let cfg = config();
        let (offerer, _offer) = DataChannelTransport::offer(DeviceId::from("d1"), &cfg)
            .await
            .unwrap();
        // Nobody dialed in yet; the channel is still Connecting.
        assert!(matches!(
            offerer.send(&heartbeat("d1")).await,
            Err(TransportError::ChannelNotOpen)
        ));
    }

    #[tokio::test]
    async fn test_accept_rejects_answer_token() {
        let cfg = config();
        let bogus = SignalRecord {
            kind: SignalKind::Answer,
            sdp: "127.0.0.1:1".to_string(),
            peer_id: DeviceId::from("d1"),
            secret: cfg.mesh.shared_secret.clone(),
        };
        let result = DataChannelTransport::accept(&bogus, DeviceId::from("d2"), &cfg).await;
        assert!(matches!(result, Err(TransportError::Signal(_))));
    }

    #[tokio::test]
    async fn test_peer_close_transitions_to_closed() {
        let cfg = config();
        let (offerer, offer) = DataChannelTransport::offer(DeviceId::from("d1"), &cfg)
            .await
            .unwrap();
        let (accepter, _answer) =
            DataChannelTransport::accept(&offer, DeviceId::from("d2"), &cfg)
                .await
                .unwrap();
        wait_for_open(&offerer).await;
        wait_for_open(&accepter).await;

        accepter.close().await;

        let mut state = offerer.watch_state();
        tokio::time::timeout(Duration::from_secs(2), async {
            while *state.borrow() != LinkState::Closed {
                state.changed().await.unwrap();
            }
        })
        .await
        .expect("offerer never observed peer close");
    }

    #[tokio::test]
    async fn test_offerer_passively_accepts_again() {
        let cfg = config();
        let (offerer, offer) = DataChannelTransport::offer(DeviceId::from("d1"), &cfg)
            .await
            .unwrap();

        let (first, _) = DataChannelTransport::accept(&offer, DeviceId::from("d2"), &cfg)
            .await
            .unwrap();
        wait_for_open(&offerer).await;
        first.close().await;

        // Wait until the offerer notices the drop, then a fresh peer
        // dials the same offer and the channel reopens.
        let mut state = offerer.watch_state();
        tokio::time::timeout(Duration::from_secs(2), async {
            while *state.borrow() != LinkState::Closed {
                state.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        let (_second, _) = DataChannelTransport::accept(&offer, DeviceId::from("d3"), &cfg)
            .await
            .unwrap();
        wait_for_open(&offerer).await;
    }
}
