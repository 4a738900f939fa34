//! WebSocket transport adapter: a dialer with handshake timeout, send/dial
//! rate limits, and zlib decompression of incoming frames.

use crate::error::{Error, Result};
use flate2::Decompress;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Sliding-window token-bucket limiter: at most `budget` operations per `window`.
///
/// Grounded on the sliding-window sender-side limiter other Discord gateway
/// clients use for outbound control messages; here it also gates dials.
pub struct RateGate {
    timestamps: VecDeque<Instant>,
    budget: u32,
    window: Duration,
}

impl RateGate {
    pub fn new(budget: u32, window: Duration) -> Self {
        RateGate {
            timestamps: VecDeque::with_capacity(budget as usize),
            budget,
            window,
        }
    }

    fn delay(&mut self) -> Option<Duration> {
        let now = Instant::now();
        while let Some(&front) = self.timestamps.front() {
            if now.duration_since(front) >= self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }

        if (self.timestamps.len() as u32) < self.budget {
            return None;
        }

        self.timestamps
            .front()
            .map(|&oldest| (oldest + self.window).saturating_duration_since(now))
            .filter(|d| !d.is_zero())
    }

    fn record(&mut self) {
        self.timestamps.push_back(Instant::now());
    }
}

/// Waits on a [`RateGate`] honoring a cancellation token, recording the
/// acquisition on success.
async fn acquire(gate: &Mutex<RateGate>, token: &CancellationToken) -> Result<()> {
    loop {
        let delay = gate.lock().await.delay();
        match delay {
            None => {
                gate.lock().await.record();
                return Ok(());
            }
            Some(d) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(d) => {}
                }
            }
        }
    }
}

/// The receive half's mutable state: the split stream plus its zlib inflator.
struct RecvState {
    stream: WsSource,
    inflate: Decompress,
}

/// A rate-limited WebSocket connection carrying JSON envelopes, with
/// transparent zlib inflation of compressed binary frames.
///
/// The underlying socket is split into independent read and write halves,
/// each behind its own lock, so a blocking [`recv`](Self::recv) (the steady
/// state while idle, parked waiting for the next server frame) never
/// contends with a concurrent [`send`](Self::send) — the pacemaker's
/// heartbeat writes must be able to proceed while the read loop is parked.
pub struct Transport {
    sink: Mutex<WsSink>,
    send_gate: Mutex<RateGate>,
    recv: Mutex<RecvState>,
    closed: Arc<AtomicBool>,
}

impl Transport {
    /// Dial `url`, honoring `dial_gate` and `timeout`. The send limiter is
    /// freshly constructed on every successful dial, per this component's
    /// redial contract.
    pub async fn dial(
        url: &str,
        dial_gate: &Mutex<RateGate>,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<Transport> {
        acquire(dial_gate, token).await?;

        let connect = tokio_tungstenite::connect_async(url);

        let (stream, _response) = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(Error::Cancelled),
            result = tokio::time::timeout(timeout, connect) => {
                result.map_err(|_| Error::HandshakeFailed("dial timed out".into()))??
            }
        };

        let (sink, stream) = stream.split();

        Ok(Transport {
            sink: Mutex::new(sink),
            send_gate: Mutex::new(RateGate::new(120, Duration::from_secs(60))),
            recv: Mutex::new(RecvState {
                stream,
                inflate: Decompress::new(true),
            }),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Construct a fresh dial rate gate, shared across redials of the same logical connection.
    pub fn new_dial_gate() -> Mutex<RateGate> {
        Mutex::new(RateGate::new(1, Duration::from_secs(5)))
    }

    /// Send a JSON-serializable value as a text frame, honoring the send
    /// limiter. Only the write half is locked, so a concurrent [`recv`](Self::recv)
    /// parked on the next frame does not block this.
    pub async fn send<T: Serialize>(&self, value: &T, token: &CancellationToken) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::TransportClosed);
        }
        acquire(&self.send_gate, token).await?;

        let json = serde_json::to_string(value)?;
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(Message::Text(json)).await {
            self.closed.store(true, Ordering::SeqCst);
            return Err(Error::WebSocket(e));
        }
        Ok(())
    }

    /// Receive the next frame, decoded as JSON. Binary frames are assumed
    /// zlib-compressed and inflated before decoding; text frames pass through
    /// untouched. Returns `Ok(None)` on a clean stream close.
    ///
    /// Only the read half is locked, so this may park indefinitely (the
    /// common idle-server case) without blocking a concurrent [`send`](Self::send).
    pub async fn recv<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::TransportClosed);
        }
        let mut recv = self.recv.lock().await;

        loop {
            let message = match recv.stream.next().await {
                Some(Ok(m)) => m,
                Some(Err(e)) => {
                    self.closed.store(true, Ordering::SeqCst);
                    return Err(Error::WebSocket(e));
                }
                None => {
                    self.closed.store(true, Ordering::SeqCst);
                    return Ok(None);
                }
            };

            return match message {
                Message::Text(text) => {
                    if text.is_empty() {
                        return Err(Error::EmptyPayload);
                    }
                    Ok(Some(serde_json::from_str(&text)?))
                }
                Message::Binary(bytes) => {
                    if bytes.is_empty() {
                        return Err(Error::EmptyPayload);
                    }
                    let json = inflate_frame(&mut recv.inflate, &bytes)?;
                    Ok(Some(serde_json::from_slice(&json)?))
                }
                Message::Close(frame) => {
                    self.closed.store(true, Ordering::SeqCst);
                    let code = frame.map(|f| u16::from(f.code)).unwrap_or(1000);
                    return Err(Error::GatewayClosed(code));
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };
        }
    }

    /// Returns the raw JSON `Value` variant of [`recv`], for callers that
    /// need to branch on shape before committing to a concrete type.
    pub async fn recv_value(&self) -> Result<Option<Value>> {
        self.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn inflate_frame(inflate: &mut Decompress, bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(bytes.len() * 4);
    inflate
        .decompress_vec(bytes, &mut out, flate2::FlushDecompress::Sync)
        .map_err(std::io::Error::from)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_gate_blocks_past_budget() {
        let gate = Mutex::new(RateGate::new(2, Duration::from_millis(200)));
        let token = CancellationToken::new();

        acquire(&gate, &token).await.unwrap();
        acquire(&gate, &token).await.unwrap();

        let start = Instant::now();
        acquire(&gate, &token).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn rate_gate_honors_cancellation() {
        let gate = Mutex::new(RateGate::new(1, Duration::from_secs(5)));
        let token = CancellationToken::new();

        acquire(&gate, &token).await.unwrap();
        token.cancel();
        assert!(matches!(acquire(&gate, &token).await, Err(Error::Cancelled)));
    }

    /// A `recv` parked on an idle server (the steady-state Running condition)
    /// must not block a concurrent `send`: the two halves are locked
    /// independently.
    #[tokio::test]
    async fn send_does_not_block_on_a_parked_recv() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let _ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            // Stay connected without ever sending anything, so the client's
            // `recv` parks indefinitely, same as an idle live voice gateway.
            std::future::pending::<()>().await
        });

        let token = CancellationToken::new();
        let dial_gate = Transport::new_dial_gate();
        let transport = Arc::new(
            Transport::dial(&format!("ws://{addr}/"), &dial_gate, Duration::from_secs(5), &token)
                .await
                .unwrap(),
        );

        let recv_parked = tokio::spawn({
            let transport = transport.clone();
            async move { transport.recv::<Value>().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!recv_parked.is_finished(), "recv should still be parked");

        let heartbeat = serde_json::json!({"op": 3});
        let send = transport.send(&heartbeat, &token);
        tokio::time::timeout(Duration::from_millis(500), send)
            .await
            .expect("send must not be blocked by a concurrently parked recv")
            .unwrap();

        recv_parked.abort();
    }
}
