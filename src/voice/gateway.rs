//! Voice WebSocket control plane: handshake, heartbeat, reconnect, op dispatch.

use crate::error::{Error, Result};
use crate::sync::{EchoHandle, Pacemaker};
use crate::transport::{RateGate, Transport};
use crate::voice::op::{
    opcode, HelloData, IdentifyPayload, Op, ReadyData, ResumePayload, SelectProtocolData,
    SelectProtocolPayload, SessionDescriptionData, VoiceEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Credentials required to Identify (fresh) or Resume (after a prior Ready).
#[derive(Debug, Clone)]
pub struct VoiceCredentials {
    pub guild_id: String,
    pub user_id: String,
    pub session_id: String,
    pub token: String,
    pub endpoint: String,
}

/// Minimum reconnect backoff; actual delay is `4 + 2 * attempt` seconds.
const MIN_RECONNECT_BACKOFF: Duration = Duration::from_secs(4);

fn reconnect_backoff(attempt: u32) -> Duration {
    MIN_RECONNECT_BACKOFF + Duration::from_secs(2 * attempt as u64)
}

/// Events surfaced to the voice session as the gateway client runs.
#[derive(Debug, Clone)]
pub enum Dispatch {
    Event(Arc<VoiceEvent>),
    /// The connection dropped and a reconnect attempt is in progress.
    ReconnectError(String),
}

/// Drives the voice WebSocket to `Ready`, then to `SessionDescription`,
/// while maintaining heartbeats and forwarding incoming events.
pub struct VoiceGatewayClient {
    transport: Transport,
    dispatch: mpsc::Sender<Dispatch>,
    pacemaker: Mutex<Option<(Arc<Pacemaker>, tokio::task::JoinHandle<Result<()>>)>>,
    ready: Mutex<Option<Arc<ReadyData>>>,
    had_ready: std::sync::atomic::AtomicBool,
    config_timeout: Duration,
}

impl VoiceGatewayClient {
    /// Dial and run the handshake to completion. `dispatch` receives every
    /// decoded event plus reconnect-in-progress notices as they occur.
    ///
    /// `dial_gate` protects against reconnection storms and, per this
    /// component's contract, is meant to survive across the redials of a
    /// single logical voice connection rather than being rebuilt each call
    /// — callers driving a reconnect loop should pass the same gate back in.
    ///
    /// `resume_from`, when set, is the `Ready` payload from a prior
    /// connection on this same logical voice session: its presence selects
    /// Resume over Identify and is carried forward if the peer's `Resumed`
    /// reply (which has no payload of its own) confirms it.
    pub async fn connect(
        creds: &VoiceCredentials,
        ws_timeout: Duration,
        dial_gate: &Mutex<RateGate>,
        resume_from: Option<Arc<ReadyData>>,
        dispatch: mpsc::Sender<Dispatch>,
        token: &CancellationToken,
    ) -> Result<Arc<VoiceGatewayClient>> {
        let endpoint = creds.endpoint.strip_suffix(":80").unwrap_or(&creds.endpoint);
        let url = format!("wss://{endpoint}/?v=4");

        let transport = Transport::dial(&url, dial_gate, ws_timeout, token).await?;
        let had_ready = resume_from.is_some();

        let client = Arc::new(VoiceGatewayClient {
            transport,
            dispatch,
            pacemaker: Mutex::new(None),
            ready: Mutex::new(resume_from),
            had_ready: std::sync::atomic::AtomicBool::new(had_ready),
            config_timeout: ws_timeout,
        });

        client.handshake(creds, token).await?;
        Ok(client)
    }

    async fn handshake(self: &Arc<Self>, creds: &VoiceCredentials, token: &CancellationToken) -> Result<()> {
        let hello = self.await_hello(token).await?;
        self.identify_or_resume(creds).await?;
        self.start_pacemaker(Duration::from_secs_f64(hello.heartbeat_interval / 1000.0));
        self.await_ready(token).await?;
        Ok(())
    }

    async fn await_hello(&self, token: &CancellationToken) -> Result<HelloData> {
        let op: Op = self.recv_op(token).await?;
        match VoiceEvent::decode(op)? {
            VoiceEvent::Hello(hello) => Ok(hello),
            other => Err(Error::HandshakeFailed(format!(
                "expected Hello, got {other:?}"
            ))),
        }
    }

    async fn await_ready(&self, token: &CancellationToken) -> Result<()> {
        loop {
            let op: Op = self.recv_op(token).await?;
            match VoiceEvent::decode(op)? {
                VoiceEvent::Ready(ready) => {
                    *self.ready.lock().await = Some(Arc::new(ready));
                    self.had_ready.store(true, std::sync::atomic::Ordering::SeqCst);
                    return Ok(());
                }
                VoiceEvent::Resumed => return Ok(()),
                other => {
                    let _ = self.dispatch.send(Dispatch::Event(Arc::new(other))).await;
                }
            }
        }
    }

    async fn recv_op(&self, token: &CancellationToken) -> Result<Op> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(self.config_timeout, self.transport.recv::<Op>()) => {
                match result {
                    Err(_) => Err(Error::HandshakeFailed("timed out awaiting gateway frame".into())),
                    Ok(Ok(Some(op))) => Ok(op),
                    Ok(Ok(None)) => Err(Error::HandshakeFailed("gateway closed during handshake".into())),
                    Ok(Err(e)) => Err(e),
                }
            }
        }
    }

    async fn identify_or_resume(&self, creds: &VoiceCredentials) -> Result<()> {
        if !self.had_ready.load(std::sync::atomic::Ordering::SeqCst) {
            if creds.guild_id.is_empty() || creds.user_id.is_empty() {
                return Err(Error::MissingCredential("guild_id/user_id for Identify"));
            }
            if creds.session_id.is_empty() || creds.token.is_empty() {
                return Err(Error::MissingCredential("session_id/token for Identify"));
            }
            let payload = IdentifyPayload {
                server_id: creds.guild_id.clone(),
                user_id: creds.user_id.clone(),
                session_id: creds.session_id.clone(),
                token: creds.token.clone(),
            };
            let op = Op::new(opcode::IDENTIFY, serde_json::to_value(payload)?);
            self.transport.send(&op, &CancellationToken::new()).await?;
        } else {
            if creds.session_id.is_empty() || creds.token.is_empty() {
                return Err(Error::MissingCredential("session_id/token for Resume"));
            }
            let payload = ResumePayload {
                server_id: creds.guild_id.clone(),
                session_id: creds.session_id.clone(),
                token: creds.token.clone(),
            };
            let op = Op::new(opcode::RESUME, serde_json::to_value(payload)?);
            self.transport.send(&op, &CancellationToken::new()).await?;
        }
        Ok(())
    }

    fn start_pacemaker(self: &Arc<Self>, heartrate: Duration) {
        let pacemaker = Arc::new(Pacemaker::new(heartrate));
        let client = self.clone();
        let runner_pm = pacemaker.clone();
        let handle = tokio::spawn(async move {
            runner_pm
                .run(move || {
                    let client = client.clone();
                    async move { client.send_heartbeat().await }
                })
                .await
        });
        // pacemaker field swap happens without awaiting a lock that could
        // deadlock against the read loop, so use try_lock in a loop-free spot
        if let Ok(mut slot) = self.pacemaker.try_lock() {
            *slot = Some((pacemaker, handle));
        }
    }

    async fn send_heartbeat(&self) -> Result<()> {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let op = Op::new(opcode::HEARTBEAT, serde_json::json!(nanos));
        self.transport.send(&op, &CancellationToken::new()).await
    }

    /// Obtain an echo handle to feed the read loop's `HeartbeatAck`s into.
    pub async fn echo_handle(&self) -> Option<EchoHandle> {
        self.pacemaker
            .lock()
            .await
            .as_ref()
            .map(|(pm, _)| pm.echo_handle())
    }

    /// The `Ready` payload, once received.
    pub async fn ready(&self) -> Option<Arc<ReadyData>> {
        self.ready.lock().await.clone()
    }

    /// Send `SelectProtocol` and wait for the resulting `SessionDescription`.
    pub async fn select_protocol(
        &self,
        address: String,
        port: u16,
        token: &CancellationToken,
    ) -> Result<SessionDescriptionData> {
        {
            let payload = SelectProtocolPayload {
                protocol: "udp",
                data: SelectProtocolData {
                    address,
                    port,
                    mode: "xsalsa20_poly1305",
                },
            };
            let op = Op::new(opcode::SELECT_PROTOCOL, serde_json::to_value(payload)?);
            self.transport.send(&op, token).await?;
        }

        loop {
            let op = self.recv_op(token).await?;
            match VoiceEvent::decode(op)? {
                VoiceEvent::SessionDescription(desc) => return Ok(desc),
                VoiceEvent::HeartbeatAck => {
                    if let Some(echo) = self.echo_handle().await {
                        echo.echo();
                    }
                }
                other => {
                    let _ = self.dispatch.send(Dispatch::Event(Arc::new(other))).await;
                }
            }
        }
    }

    /// Send a pre-built op, e.g. `Speaking`, outside the handshake/read-loop flow.
    pub async fn send_op(&self, op: &Op, token: &CancellationToken) -> Result<()> {
        self.transport.send(op, token).await
    }

    /// Run the steady-state read loop: forward decoded events, feed
    /// heartbeat acks to the pacemaker, and surface close/read errors to the
    /// caller for reconnection.
    pub async fn run_read_loop(self: Arc<Self>, token: CancellationToken) -> Result<()> {
        loop {
            let op_result = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Error::Cancelled),
                result = self.transport.recv::<Op>() => result,
            };

            let op = match op_result {
                Ok(Some(op)) => op,
                Ok(None) => return Err(Error::HandshakeFailed("voice gateway closed".into())),
                Err(Error::GatewayClosed(code)) if Error::is_fatal_close_code(code) => {
                    return Err(Error::FatalCloseCode(code))
                }
                Err(Error::GatewayClosed(code)) => return Err(Error::GatewayClosed(code)),
                Err(Error::WebSocket(e)) => {
                    return Err(Error::HandshakeFailed(format!("websocket error: {e}")))
                }
                Err(e) => return Err(e),
            };

            let event = VoiceEvent::decode(op)?;
            if let VoiceEvent::HeartbeatAck = &event {
                if let Some(echo) = self.echo_handle().await {
                    echo.echo();
                }
            }
            if self
                .dispatch
                .send(Dispatch::Event(Arc::new(event)))
                .await
                .is_err()
            {
                return Ok(());
            }
        }
    }

    /// True for the documented unrecoverable voice-gateway close codes.
    pub fn is_fatal_close(code: u16) -> bool {
        Error::is_fatal_close_code(code)
    }

    pub fn backoff_for_attempt(attempt: u32) -> Duration {
        reconnect_backoff(attempt)
    }

    /// Stop the heartbeat pacemaker, if running.
    pub async fn stop(&self) {
        if let Some((pm, handle)) = self.pacemaker.lock().await.take() {
            pm.stop_handle().stop();
            let _ = handle.await;
        }
    }
}


