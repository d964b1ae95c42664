//! Transport endpoint: one duplex, ordered envelope stream to a single peer.
//!
//! Each endpoint runs one reader task and one writer task over a split TCP
//! stream framed as line-delimited JSON. Writes are serialized through the
//! writer task's queue, so frames never interleave. If no bytes arrive for
//! the idle timeout the endpoint closes; the writer emits heartbeat frames
//! on its own tick to keep intermediaries alive. Closure is terminal:
//! buffered outbound frames are dropped and the close hook fires once.

use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, warn};

use tss_types::{decode_envelope, encode_envelope, Envelope, MessageType};

use crate::error::{NetworkError, NetworkResult};

/// Upper bound on one wire frame; a round payload for a large committee
/// stays far below this.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Outbound queue depth per endpoint.
const OUTBOUND_QUEUE: usize = 256;

pub(crate) type Reader = FramedRead<OwnedReadHalf, LinesCodec>;
pub(crate) type Writer = FramedWrite<OwnedWriteHalf, LinesCodec>;

/// Split a TCP stream into line-framed halves.
pub fn split(stream: TcpStream) -> (Reader, Writer) {
    let (read_half, write_half) = stream.into_split();
    (
        FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_FRAME_BYTES)),
        FramedWrite::new(write_half, LinesCodec::new_with_max_length(MAX_FRAME_BYTES)),
    )
}

/// Hook invoked for every decoded inbound envelope. Must not block: the
/// reader delivers synchronously and the usual implementation forwards into
/// an unbounded dispatch channel.
pub type EnvelopeHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Hook invoked exactly once when the endpoint closes.
pub type CloseHandler = Arc<dyn Fn() + Send + Sync>;

/// Timing knobs for an endpoint.
#[derive(Debug, Clone, Copy)]
pub struct EndpointConfig {
    /// Close the endpoint if no bytes are received for this long.
    pub idle_timeout: Duration,
    /// Emit a heartbeat frame at this interval.
    pub heartbeat_interval: Duration,
    /// Per-frame write deadline.
    pub write_deadline: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(54),
            write_deadline: Duration::from_secs(10),
        }
    }
}

/// One attached transport. Shared between the peer registry and any producer
/// queueing writes.
pub struct Endpoint {
    label: String,
    outbound: mpsc::Sender<Envelope>,
    closed: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Endpoint {
    /// Spawn reader and writer tasks over pre-split framed halves.
    ///
    /// `handler` receives every inbound envelope except heartbeats, in the
    /// exact order the peer wrote them. `on_close` fires once, whether the
    /// close came from an error, an idle timeout, or [`Endpoint::close`].
    pub fn spawn(
        reader: Reader,
        writer: Writer,
        label: impl Into<String>,
        config: EndpointConfig,
        handler: EnvelopeHandler,
        on_close: CloseHandler,
    ) -> Arc<Self> {
        let label = label.into();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let closed = Arc::new(AtomicBool::new(false));

        let notify_close = {
            let closed = Arc::clone(&closed);
            let label = label.clone();
            move |reason: &str| {
                if !closed.swap(true, Ordering::SeqCst) {
                    debug!(endpoint = %label, reason, "endpoint closed");
                    on_close();
                }
            }
        };

        let read_task = tokio::spawn(read_loop(
            reader,
            label.clone(),
            config,
            handler,
            notify_close.clone(),
        ));
        let write_task = tokio::spawn(write_loop(
            writer,
            outbound_rx,
            label.clone(),
            config,
            notify_close,
        ));

        Arc::new(Self {
            label,
            outbound: outbound_tx,
            closed,
            tasks: Mutex::new(vec![read_task, write_task]),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queue an envelope for the writer task. Fails once the endpoint is
    /// closed or the queue is gone.
    pub async fn send(&self, envelope: Envelope) -> NetworkResult<()> {
        if self.is_closed() {
            return Err(NetworkError::Closed {
                label: self.label.clone(),
            });
        }
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| NetworkError::Closed {
                label: self.label.clone(),
            })
    }

    /// Force-close the endpoint, dropping anything still queued.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("label", &self.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn read_loop(
    mut reader: Reader,
    label: String,
    config: EndpointConfig,
    handler: EnvelopeHandler,
    notify_close: impl Fn(&str),
) {
    loop {
        let frame = match tokio::time::timeout(config.idle_timeout, reader.next()).await {
            Err(_) => {
                warn!(endpoint = %label, "idle timeout, closing endpoint");
                notify_close("idle timeout");
                return;
            }
            Ok(None) => {
                notify_close("peer closed stream");
                return;
            }
            Ok(Some(Err(e))) => {
                warn!(endpoint = %label, error = %e, "read error, closing endpoint");
                notify_close("read error");
                return;
            }
            Ok(Some(Ok(line))) => line,
        };

        match decode_envelope(&frame) {
            Ok(envelope) => {
                if envelope.msg_type == MessageType::Heartbeat {
                    // Traffic alone resets the idle timer; nothing to route.
                    continue;
                }
                handler(envelope);
            }
            Err(e) => {
                // Malformed input is dropped without touching the transport.
                warn!(endpoint = %label, error = %e, "dropping malformed envelope");
            }
        }
    }
}

async fn write_loop(
    mut writer: Writer,
    mut outbound: mpsc::Receiver<Envelope>,
    label: String,
    config: EndpointConfig,
    notify_close: impl Fn(&str),
) {
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await; // the first tick fires immediately

    loop {
        let envelope = tokio::select! {
            maybe = outbound.recv() => match maybe {
                Some(envelope) => envelope,
                None => {
                    notify_close("outbound queue dropped");
                    return;
                }
            },
            _ = heartbeat.tick() => Envelope::new(MessageType::Heartbeat, ""),
        };

        let line = match encode_envelope(&envelope) {
            Ok(line) => line,
            Err(e) => {
                warn!(endpoint = %label, error = %e, "failed to encode envelope, dropping");
                continue;
            }
        };

        match tokio::time::timeout(config.write_deadline, writer.send(line)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(endpoint = %label, error = %e, "write error, closing endpoint");
                notify_close("write error");
                return;
            }
            Err(_) => {
                warn!(endpoint = %label, "write deadline exceeded, closing endpoint");
                notify_close("write deadline exceeded");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tss_types::AckData;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn collector() -> (EnvelopeHandler, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: EnvelopeHandler = Arc::new(move |envelope| {
            let _ = tx.send(envelope);
        });
        (handler, rx)
    }

    fn noop_close() -> CloseHandler {
        Arc::new(|| {})
    }

    #[tokio::test]
    async fn envelopes_arrive_in_send_order() {
        let (a, b) = pair().await;
        let (reader_a, writer_a) = split(a);
        let (reader_b, writer_b) = split(b);

        let (handler, mut rx) = collector();
        let left = Endpoint::spawn(
            reader_a,
            writer_a,
            "left",
            EndpointConfig::default(),
            Arc::new(|_| {}),
            noop_close(),
        );
        let _right = Endpoint::spawn(
            reader_b,
            writer_b,
            "right",
            EndpointConfig::default(),
            handler,
            noop_close(),
        );

        for round in 1..=5u16 {
            left.send(
                Envelope::new(MessageType::SignRound, "s").round(round),
            )
            .await
            .unwrap();
        }
        for round in 1..=5u16 {
            let got = rx.recv().await.unwrap();
            assert_eq!(got.round, round);
        }
    }

    #[tokio::test]
    async fn heartbeats_are_consumed_by_the_endpoint() {
        let (a, b) = pair().await;
        let (reader_a, writer_a) = split(a);
        let (reader_b, writer_b) = split(b);

        let config = EndpointConfig {
            heartbeat_interval: Duration::from_millis(20),
            ..EndpointConfig::default()
        };
        let (handler, mut rx) = collector();
        let left = Endpoint::spawn(
            reader_a,
            writer_a,
            "left",
            config,
            Arc::new(|_| {}),
            noop_close(),
        );
        let _right = Endpoint::spawn(
            reader_b,
            writer_b,
            "right",
            EndpointConfig::default(),
            handler,
            noop_close(),
        );

        tokio::time::sleep(Duration::from_millis(80)).await;
        left.send(Envelope::new(MessageType::Ack, "").data(&AckData::default()))
            .await
            .unwrap();
        // Only the ack surfaces; heartbeats stay inside the transport.
        let got = rx.recv().await.unwrap();
        assert_eq!(got.msg_type, MessageType::Ack);
    }

    #[tokio::test]
    async fn idle_timeout_fires_close_hook_once() {
        let (a, b) = pair().await;
        let (reader_a, writer_a) = split(a);
        drop(b);

        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        let on_close: CloseHandler = Arc::new(move || {
            let _ = closed_tx.send(());
        });
        let endpoint = Endpoint::spawn(
            reader_a,
            writer_a,
            "left",
            EndpointConfig {
                idle_timeout: Duration::from_millis(50),
                heartbeat_interval: Duration::from_secs(5),
                write_deadline: Duration::from_secs(1),
            },
            Arc::new(|_| {}),
            on_close,
        );

        closed_rx.recv().await.unwrap();
        assert!(endpoint.is_closed());
        assert!(endpoint
            .send(Envelope::new(MessageType::Ack, ""))
            .await
            .is_err());
        // No second close event.
        assert!(closed_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_lines_are_dropped_without_closing() {
        let (a, b) = pair().await;
        let (_reader_a, mut writer_a) = split(a);
        let (reader_b, writer_b) = split(b);

        let (handler, mut rx) = collector();
        let _right = Endpoint::spawn(
            reader_b,
            writer_b,
            "right",
            EndpointConfig::default(),
            handler,
            noop_close(),
        );

        writer_a.send("this is not json".to_string()).await.unwrap();
        let ok = encode_envelope(&Envelope::new(MessageType::Ack, "")).unwrap();
        writer_a.send(ok).await.unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got.msg_type, MessageType::Ack);
    }
}
