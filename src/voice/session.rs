//! Ties a [`crate::collab::MainGateway`] collaborator to the voice-gateway
//! control plane and the UDP media plane, and drives join/leave and
//! mid-session reconnection.

use crate::collab::{
    Channel, GatewayEvent, HandlerGuard, MainGateway, UpdateVoiceStateCommand,
};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::model::{ChannelId, VoiceState};
use crate::transport::Transport;
use crate::voice::connection::VoiceConnection;
use crate::voice::gateway::{Dispatch, VoiceCredentials, VoiceGatewayClient};
use crate::voice::op::{opcode, Op, ReadyData, SpeakingData};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio_util::sync::CancellationToken;

/// The live pieces of one established voice connection; replaced wholesale
/// on reconnect, torn down wholesale on leave.
struct ActiveVoice {
    gateway: Arc<VoiceGatewayClient>,
    udp: Arc<VoiceConnection>,
    gateway_token: CancellationToken,
    read_loop: tokio::task::JoinHandle<()>,
    dispatch_drain: tokio::task::JoinHandle<()>,
}

/// Owns one voice connection for one guild: `join`/`leave`, `speaking`,
/// `write`/`read_packet`, and the mid-session reconnection that follows a
/// voice-server move or a gateway drop.
///
/// Join is serialized by the `joining` flag: while a `Join` is in flight,
/// handler-triggered reconnection (from a `VoiceServerUpdate` or
/// `VoiceStateUpdate` arriving mid-handshake) is deferred to the join itself
/// rather than racing it.
pub struct VoiceSession {
    main_gateway: Arc<dyn MainGateway>,
    config: SessionConfig,
    state: StdMutex<VoiceState>,
    active: AsyncMutex<Option<ActiveVoice>>,
    running: AtomicBool,
    joining: AtomicBool,
    left: AtomicBool,
    handler_guards: StdMutex<Vec<HandlerGuard>>,
    handlers_registered: AtomicBool,
    wake: Notify,
    lifetime: CancellationToken,
}

impl VoiceSession {
    /// Construct a session bound to `main_gateway`. No voice connection is
    /// established until [`join`](Self::join) is called.
    pub fn new(main_gateway: Arc<dyn MainGateway>, config: SessionConfig) -> Arc<VoiceSession> {
        Arc::new(VoiceSession {
            main_gateway,
            config,
            state: StdMutex::new(VoiceState::default()),
            active: AsyncMutex::new(None),
            running: AtomicBool::new(false),
            joining: AtomicBool::new(false),
            left: AtomicBool::new(false),
            handler_guards: StdMutex::new(Vec::new()),
            handlers_registered: AtomicBool::new(false),
            wake: Notify::new(),
            lifetime: CancellationToken::new(),
        })
    }

    /// Join `channel_id`'s guild voice channel: send `UpdateVoiceState`,
    /// await the paired `VoiceServerUpdate`/`VoiceStateUpdate`, then dial the
    /// voice gateway and UDP connection through to a usable
    /// `SessionDescription`. Retries up to `max_retry` times on timeout.
    pub async fn join(
        self: &Arc<Self>,
        token: &CancellationToken,
        channel_id: ChannelId,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<()> {
        self.joining.store(true, Ordering::SeqCst);
        let result = self.join_inner(token, channel_id, self_mute, self_deaf).await;
        self.joining.store(false, Ordering::SeqCst);
        result
    }

    async fn join_inner(
        self: &Arc<Self>,
        token: &CancellationToken,
        channel_id: ChannelId,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<()> {
        if self.left.load(Ordering::SeqCst) {
            return Err(Error::HandshakeFailed("session already left".into()));
        }

        let channel: Channel = self.main_gateway.channel(channel_id).await?;

        {
            let mut state = self.state.lock().expect("voice state lock poisoned");
            state.guild_id = Some(channel.guild_id);
            state.channel_id = Some(channel_id);
            // A fresh join always Identifies; stale creds from a previous
            // session on this guild must not make it look resumable.
            state.session_id = None;
            state.token = None;
            state.endpoint = None;
        }
        self.populate_user_id().await?;
        self.ensure_handlers();

        let mut attempt = 0;
        let voice_state = loop {
            self.main_gateway
                .send_gateway(
                    token,
                    UpdateVoiceStateCommand {
                        guild_id: channel.guild_id,
                        channel_id: Some(channel_id),
                        self_mute,
                        self_deaf,
                    },
                )
                .await?;

            match self.wait_for_voice_state(token).await {
                Ok(vs) => break vs,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    if attempt >= self.config.max_retry {
                        return Err(e);
                    }
                    attempt += 1;
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(self.config.retry_delay) => {}
                    }
                }
            }
        };

        self.establish_voice(&voice_state, None, None, token).await
    }

    async fn populate_user_id(&self) -> Result<()> {
        let me = self.main_gateway.me().await?;
        self.state.lock().expect("voice state lock poisoned").user_id = Some(me.user_id);
        Ok(())
    }

    /// Wait up to `config.wait_duration` for a `VoiceServerUpdate` and
    /// matching `VoiceStateUpdate` to complete the current state.
    async fn wait_for_voice_state(&self, token: &CancellationToken) -> Result<VoiceState> {
        let deadline = tokio::time::Instant::now() + self.config.wait_duration;
        loop {
            {
                let state = self.state.lock().expect("voice state lock poisoned");
                if state.ready_to_dial() {
                    return Ok(state.clone());
                }
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(Error::HandshakeFailed(
                    "timed out waiting for voice server/state update".into(),
                ));
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Error::Cancelled),
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(remaining) => {}
            }
        }
    }

    /// Register the main-gateway handler exactly once for this session's
    /// lifetime; repeat calls (from retries, reconnects) are no-ops.
    fn ensure_handlers(self: &Arc<Self>) {
        if self.handlers_registered.swap(true, Ordering::SeqCst) {
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let guard = self.main_gateway.add_handler(Box::new(move |event: &GatewayEvent| {
            let _ = tx.send(event.clone());
        }));
        self.handler_guards.lock().expect("handler guard list poisoned").push(guard);

        let session = self.clone();
        tokio::spawn(async move { session.run_supervisor(rx).await });
    }

    async fn run_supervisor(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<GatewayEvent>) {
        while let Some(event) = rx.recv().await {
            let mut should_reconnect = false;
            {
                let mut state = self.state.lock().expect("voice state lock poisoned");
                match &event {
                    GatewayEvent::VoiceServerUpdate(e) if Some(e.guild_id) == state.guild_id => {
                        state.endpoint = Some(e.endpoint.clone());
                        state.token = Some(e.token.clone());
                        should_reconnect = true;
                    }
                    GatewayEvent::VoiceStateUpdate(e)
                        if Some(e.guild_id) == state.guild_id && Some(e.user_id) == state.user_id =>
                    {
                        state.channel_id = e.channel_id;
                        state.session_id = Some(e.session_id.clone());
                        should_reconnect = e.channel_id.is_some();
                    }
                    _ => {}
                }
            }
            self.wake.notify_waiters();

            if should_reconnect
                && self.running.load(Ordering::SeqCst)
                && !self.joining.load(Ordering::SeqCst)
            {
                let session = self.clone();
                tokio::spawn(async move { session.handle_mid_session_update().await });
            }
        }
    }

    /// Tear down (pause, don't close) the current UDP connection and
    /// voice-gateway client, then redial against the session's latest state.
    async fn handle_mid_session_update(self: Arc<Self>) {
        if self.joining.load(Ordering::SeqCst) {
            return;
        }
        let existing = self.active.lock().await.take();
        let Some(old) = existing else { return };

        old.gateway_token.cancel();
        old.udp.pause();
        old.gateway.stop().await;
        let _ = old.read_loop.await;
        old.dispatch_drain.abort();
        self.running.store(false, Ordering::SeqCst);

        let vs = self.state.lock().expect("voice state lock poisoned").clone();
        if !vs.ready_to_dial() {
            return;
        }

        let resume_from = old.gateway.ready().await;
        if let Err(e) = self
            .establish_voice(&vs, Some(old.udp), resume_from, &self.lifetime.clone())
            .await
        {
            tracing::error!(error = %e, "mid-session voice reconnect failed");
        }
    }

    /// Dial the voice gateway and UDP connection through to a usable secret
    /// key, reusing `existing_udp` (paused, re-pointed) when given instead of
    /// opening a fresh socket, and Resuming when `resume_from` is given.
    async fn establish_voice(
        self: &Arc<Self>,
        vs: &VoiceState,
        existing_udp: Option<Arc<VoiceConnection>>,
        resume_from: Option<Arc<ReadyData>>,
        token: &CancellationToken,
    ) -> Result<()> {
        let creds = VoiceCredentials {
            guild_id: vs.guild_id.expect("ready_to_dial implies guild_id").0.to_string(),
            user_id: vs.user_id.expect("ready_to_dial implies user_id").0.to_string(),
            session_id: vs.session_id.clone().expect("ready_to_dial implies session_id"),
            token: vs.token.clone().expect("ready_to_dial implies token"),
            endpoint: vs.endpoint.clone().expect("ready_to_dial implies endpoint"),
        };

        let dial_gate = Transport::new_dial_gate();
        let (dispatch_tx, mut dispatch_rx) = mpsc::channel(64);

        let gateway = VoiceGatewayClient::connect(
            &creds,
            self.config.ws_timeout,
            &dial_gate,
            resume_from,
            dispatch_tx,
            token,
        )
        .await?;

        let ready = gateway
            .ready()
            .await
            .ok_or_else(|| Error::HandshakeFailed("missing Ready after handshake".into()))?;

        let udp = match existing_udp {
            Some(udp) => {
                udp.redial(&ready.ip, ready.port).await?;
                udp
            }
            None => VoiceConnection::dial(&ready.ip, ready.port, ready.ssrc).await?,
        };
        let (own_ip, own_port) = udp.discover_ip().await?;
        let desc = gateway.select_protocol(own_ip, own_port, token).await?;
        if desc.secret_key.len() != 32 {
            return Err(Error::HandshakeFailed("secret key was not 32 bytes".into()));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&desc.secret_key);
        udp.install_secret_key(key);
        udp.resume();

        let gateway_token = CancellationToken::new();
        let read_loop = {
            let gateway = gateway.clone();
            let gt = gateway_token.clone();
            let session = self.clone();
            tokio::spawn(async move {
                let result = gateway.run_read_loop(gt).await;
                // `on_gateway_terminated` returns a boxed future: it can
                // recurse into `establish_voice` on reconnect, and a plain
                // `async fn` there would make this task's own future
                // reference its own type.
                session.on_gateway_terminated(result).await;
            })
        };
        let dispatch_drain = tokio::spawn(async move {
            while let Some(d) = dispatch_rx.recv().await {
                match d {
                    Dispatch::Event(event) => tracing::debug!(?event, "voice gateway event"),
                    Dispatch::ReconnectError(msg) => {
                        tracing::warn!(message = %msg, "voice gateway reconnecting")
                    }
                }
            }
        });

        *self.active.lock().await = Some(ActiveVoice {
            gateway,
            udp,
            gateway_token,
            read_loop,
            dispatch_drain,
        });
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    // Boxed rather than a plain `async fn`: this calls `reconnect_from_failure`,
    // which calls back into `establish_voice`, which spawns a task that calls
    // this again on the next drop — a named opaque return type here would
    // make the future's type infinitely recursive.
    fn on_gateway_terminated(
        self: Arc<Self>,
        result: Result<()>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            if self.joining.load(Ordering::SeqCst) || self.left.load(Ordering::SeqCst) {
                return;
            }
            self.running.store(false, Ordering::SeqCst);
            match result {
                Ok(()) => {}
                Err(Error::FatalCloseCode(code)) => {
                    tracing::error!(code, "voice gateway closed with a fatal code; giving up");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "voice gateway connection lost; reconnecting");
                    self.reconnect_from_failure().await;
                }
            }
        })
    }

    fn reconnect_from_failure(self: Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let mut attempt = 0u32;
            loop {
                if self.lifetime.is_cancelled() || self.left.load(Ordering::SeqCst) {
                    return;
                }
                let delay = VoiceGatewayClient::backoff_for_attempt(attempt);
                tokio::select! {
                    _ = self.lifetime.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }

                let vs = self.state.lock().expect("voice state lock poisoned").clone();
                if !vs.ready_to_dial() {
                    return;
                }
                let existing_udp = self.active.lock().await.as_ref().map(|a| a.udp.clone());

                match self
                    .establish_voice(&vs, existing_udp, None, &self.lifetime.clone())
                    .await
                {
                    Ok(()) => return,
                    Err(Error::FatalCloseCode(code)) => {
                        tracing::error!(code, "reconnect hit a fatal close code; giving up");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, attempt, "reconnect attempt failed");
                        attempt += 1;
                    }
                }
            }
        })
    }

    /// Leave the voice channel: send `UpdateVoiceState` with no channel, then
    /// tear down the live gateway/UDP connection. Idempotent after the first
    /// successful call.
    pub async fn leave(self: &Arc<Self>, token: &CancellationToken) -> Result<()> {
        if self.left.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let guild_id = self.state.lock().expect("voice state lock poisoned").guild_id;
        if let Some(guild_id) = guild_id {
            self.main_gateway
                .send_gateway(
                    token,
                    UpdateVoiceStateCommand {
                        guild_id,
                        channel_id: None,
                        self_mute: true,
                        self_deaf: true,
                    },
                )
                .await?;
        }

        self.lifetime.cancel();
        if let Some(active) = self.active.lock().await.take() {
            active.gateway_token.cancel();
            active.gateway.stop().await;
            let _ = active.read_loop.await;
            active.dispatch_drain.abort();
            active.udp.close();
        }
        self.running.store(false, Ordering::SeqCst);
        *self.state.lock().expect("voice state lock poisoned") = VoiceState::default();
        Ok(())
    }

    /// Send a `Speaking` update using the SSRC from the current `Ready`.
    /// A no-op if no voice connection is currently established. `flag == 0`
    /// ("not speaking") is destructive and silently succeeds even if the
    /// gateway send itself fails, since there is no harm in the server
    /// inferring silence on its own.
    pub async fn speaking(&self, token: &CancellationToken, flag: u32) -> Result<()> {
        let active = self.active.lock().await;
        let Some(active) = active.as_ref() else {
            return Ok(());
        };
        let ssrc = active.gateway.ready().await.map(|r| r.ssrc).unwrap_or(0);
        let payload = SpeakingData {
            speaking: flag,
            delay: 0,
            ssrc,
        };
        let op = Op::new(opcode::SPEAKING, serde_json::to_value(payload)?);
        match active.gateway.send_op(&op, token).await {
            Err(_) if flag == 0 => Ok(()),
            result => result,
        }
    }

    /// Enqueue one pre-encoded Opus frame on the UDP media plane.
    pub async fn write(&self, payload: Vec<u8>) -> Result<()> {
        match self.active.lock().await.as_ref() {
            Some(active) => active.udp.write(payload),
            None => Err(Error::NotReady),
        }
    }

    /// Read and decrypt the next inbound UDP datagram.
    pub async fn read_packet(&self) -> Result<Vec<u8>> {
        let udp = self.active.lock().await.as_ref().map(|a| a.udp.clone());
        match udp {
            Some(udp) => udp.read_packet().await,
            None => Err(Error::NotReady),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::mock::MockMainGateway;
    use crate::collab::{GatewayEvent, VoiceServerUpdateEvent, VoiceStateUpdateEvent};
    use crate::model::{GuildId, UserId};
    use std::time::Duration;

    fn config() -> SessionConfig {
        SessionConfig {
            wait_duration: Duration::from_millis(200),
            retry_delay: Duration::from_millis(10),
            max_retry: 1,
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn join_times_out_without_voice_server_update() {
        let gw = Arc::new(MockMainGateway::new(GuildId(1), UserId(2)));
        let session = VoiceSession::new(gw, config());
        let token = CancellationToken::new();

        let result = session.join(&token, ChannelId(3), false, false).await;
        assert!(matches!(result, Err(Error::HandshakeFailed(_))));
    }

    #[tokio::test]
    async fn join_is_cancellable() {
        let gw = Arc::new(MockMainGateway::new(GuildId(1), UserId(2)));
        let session = VoiceSession::new(gw, config());
        let token = CancellationToken::new();
        token.cancel();

        let result = session.join(&token, ChannelId(3), false, false).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn voice_state_populates_from_delivered_events() {
        let gw = Arc::new(MockMainGateway::new(GuildId(1), UserId(2)));
        let session = VoiceSession::new(gw.clone(), config());
        let token = CancellationToken::new();

        let session_for_join = session.clone();
        let join = tokio::spawn(async move {
            session_for_join
                .join(&token, ChannelId(3), false, false)
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        gw.deliver(GatewayEvent::VoiceServerUpdate(VoiceServerUpdateEvent {
            guild_id: GuildId(1),
            endpoint: "voice.example.invalid:80".into(),
            token: "server-token".into(),
        }));
        gw.deliver(GatewayEvent::VoiceStateUpdate(VoiceStateUpdateEvent {
            guild_id: GuildId(1),
            user_id: UserId(2),
            channel_id: Some(ChannelId(3)),
            session_id: "session-abc".into(),
        }));

        // The dial itself fails (no real voice server), but it must get past
        // waiting for these two events, proving the handler wiring works.
        let _ = join.await.unwrap();
        let state = session.state.lock().unwrap().clone();
        assert_eq!(state.session_id.as_deref(), Some("session-abc"));
        assert_eq!(state.token.as_deref(), Some("server-token"));
    }

    #[tokio::test]
    async fn leave_before_join_is_a_no_op() {
        let gw = Arc::new(MockMainGateway::new(GuildId(1), UserId(2)));
        let session = VoiceSession::new(gw, config());
        let token = CancellationToken::new();
        assert!(session.leave(&token).await.is_ok());
        assert!(session.leave(&token).await.is_ok());
    }
}

