use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, timeout, Instant};

use super::backoff::{Backoff, ReconnectPolicy};
use super::events::{
    close_code, opcode, GatewayMessage, HelloData, IdentifyData, IdentifyProperties,
    PresenceUpdateData, ReadyData, RequestGuildMembersData, ResumeData, VoiceStateUpdateData,
};
use super::heartbeat::{Beat, Heartbeat};
use super::intents;
use super::session::SessionState;
use super::socket::{Connector, SocketCommand, SocketEvent, SocketHandle};
use super::supervisor::SupervisorMessage;
use super::{GatewayConfig, GatewayEvent};
use crate::error::GatewayError;
use crate::ratelimit::TokenBucket;
use crate::snowflake;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    Idle,
    Connecting,
    Handshaking,
    Identifying,
    Resuming,
    Ready,
    Disconnected,
    /// Stopped for good after a fatal close.
    Failed,
}

/// Why a live connection ended.
#[derive(Debug, Clone, PartialEq)]
pub enum DisconnectReason {
    /// The socket failed or could not be opened.
    Transport(String),
    /// The server closed the socket.
    Closed { code: u16, reason: String },
    /// A heartbeat went unacknowledged until the next one was due.
    HeartbeatTimeout,
    /// The server asked for a reconnect.
    ReconnectRequested,
    InvalidSession { resumable: bool },
    /// The handshake was malformed.
    Protocol(String),
    /// The caller asked for a disconnect.
    Requested { reconnect: ReconnectPolicy },
    HardReset,
    Shutdown,
}

impl DisconnectReason {
    /// Whether the session may be resumed on the next connect.
    pub fn keeps_session(&self) -> bool {
        match self {
            DisconnectReason::Transport(_)
            | DisconnectReason::HeartbeatTimeout
            | DisconnectReason::ReconnectRequested
            | DisconnectReason::Shutdown => true,
            DisconnectReason::Closed { code, .. } => close_code::is_resumable(*code),
            DisconnectReason::InvalidSession { resumable } => *resumable,
            DisconnectReason::Requested { reconnect } => *reconnect != ReconnectPolicy::Never,
            DisconnectReason::Protocol(_) | DisconnectReason::HardReset => false,
        }
    }

    /// The error to surface when this reason rules out reconnecting.
    pub fn fatal(&self) -> Option<GatewayError> {
        match self {
            DisconnectReason::Closed { code, .. } if *code == close_code::AUTH_FAILED => {
                Some(GatewayError::AuthenticationFailed)
            }
            DisconnectReason::Closed { code, reason } if close_code::is_fatal(*code) => {
                Some(GatewayError::Fatal {
                    code: *code,
                    reason: if reason.is_empty() {
                        close_code::describe(*code).to_string()
                    } else {
                        reason.clone()
                    },
                })
            }
            _ => None,
        }
    }
}

/// Snapshot of a shard, readable from any task through its handle.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardStatus {
    pub state: ShardState,
    pub session_id: Option<String>,
    pub sequence: Option<u64>,
    pub latency: Option<Duration>,
    /// Interval announced by the last hello.
    pub heartbeat_interval: Option<Duration>,
    pub last_heartbeat_sent: Option<Instant>,
    pub last_heartbeat_ack: Option<Instant>,
    pub reconnect_attempts: u32,
    pub error: Option<GatewayError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameKind {
    /// Heartbeat, identify, resume: always eligible, jumps the queue.
    Control,
    Presence,
    Normal,
}

#[derive(Debug)]
pub(crate) struct OutboundFrame {
    kind: FrameKind,
    payload: String,
    done: Option<oneshot::Sender<Result<(), GatewayError>>>,
}

impl OutboundFrame {
    fn control(payload: String) -> Self {
        Self {
            kind: FrameKind::Control,
            payload,
            done: None,
        }
    }

    fn finish(self, result: Result<(), GatewayError>) {
        if let Some(done) = self.done {
            let _ = done.send(result);
        }
    }
}

#[derive(Debug)]
pub(crate) enum ShardCommand {
    /// The supervisor admitted this shard.
    Connect,
    Send(OutboundFrame),
    Disconnect { reconnect: ReconnectPolicy },
    HardReset,
    Shutdown,
}

/// Control surface for one shard.
#[derive(Debug, Clone)]
pub struct ShardHandle {
    id: u32,
    intents: u64,
    commands: mpsc::UnboundedSender<ShardCommand>,
    status: watch::Receiver<ShardStatus>,
}

impl ShardHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> ShardState {
        self.status.borrow().state
    }

    pub fn status(&self) -> ShardStatus {
        self.status.borrow().clone()
    }

    /// Round trip of the last acknowledged heartbeat.
    pub fn latency(&self) -> Option<Duration> {
        self.status.borrow().latency
    }

    /// Resolves once the shard is ready, or fails if it stopped for good.
    pub async fn wait_until_ready(&self) -> Result<(), GatewayError> {
        let mut status = self.status.clone();
        let snapshot = status
            .wait_for(|s| matches!(s.state, ShardState::Ready | ShardState::Failed))
            .await
            .map_err(|_| GatewayError::Closed)?
            .clone();
        match snapshot.error {
            Some(e) if snapshot.state == ShardState::Failed => Err(e),
            _ => Ok(()),
        }
    }

    /// Replace this shard's presence. Rapid updates are coalesced; only the
    /// latest one is sent.
    pub async fn update_presence(&self, presence: PresenceUpdateData) -> Result<(), GatewayError> {
        if !PresenceUpdateData::STATUSES.contains(&presence.status.as_str()) {
            return Err(GatewayError::InvalidRequest(format!(
                "unknown status {:?}",
                presence.status
            )));
        }
        let frame = GatewayMessage::new(opcode::PRESENCE_UPDATE, &presence);
        self.send(FrameKind::Presence, frame.to_text()).await
    }

    /// Join, move or leave (`channel_id: None`) a voice channel.
    pub async fn update_voice_state(&self, voice: VoiceStateUpdateData) -> Result<(), GatewayError> {
        if !snowflake::is_snowflake(&voice.guild_id) {
            return Err(GatewayError::InvalidRequest(format!(
                "invalid guild id {:?}",
                voice.guild_id
            )));
        }
        if let Some(ref channel) = voice.channel_id {
            if !snowflake::is_snowflake(channel) {
                return Err(GatewayError::InvalidRequest(format!(
                    "invalid channel id {channel:?}"
                )));
            }
        }
        let frame = GatewayMessage::new(opcode::VOICE_STATE_UPDATE, &voice);
        self.send(FrameKind::Normal, frame.to_text()).await
    }

    /// Ask for a member chunk stream. Returns the nonce that the resulting
    /// chunk dispatches will carry.
    pub async fn request_guild_members(
        &self,
        mut request: RequestGuildMembersData,
    ) -> Result<String, GatewayError> {
        validate_member_request(&request, self.intents)?;
        let nonce = request
            .nonce
            .get_or_insert_with(|| uuid::Uuid::new_v4().simple().to_string())
            .clone();
        let frame = GatewayMessage::new(opcode::REQUEST_GUILD_MEMBERS, &request);
        self.send(FrameKind::Normal, frame.to_text()).await?;
        Ok(nonce)
    }

    /// Drop the connection. Pending sends are cancelled unless the policy
    /// reconnects.
    pub fn disconnect(&self, reconnect: ReconnectPolicy) -> Result<(), GatewayError> {
        self.command(ShardCommand::Disconnect { reconnect })
    }

    /// Forget the session; the next connect identifies from scratch.
    pub fn hard_reset(&self) -> Result<(), GatewayError> {
        self.command(ShardCommand::HardReset)
    }

    pub(crate) fn command(&self, cmd: ShardCommand) -> Result<(), GatewayError> {
        self.commands.send(cmd).map_err(|_| GatewayError::Closed)
    }

    async fn send(&self, kind: FrameKind, payload: String) -> Result<(), GatewayError> {
        let (done, rx) = oneshot::channel();
        self.command(ShardCommand::Send(OutboundFrame {
            kind,
            payload,
            done: Some(done),
        }))?;
        rx.await.map_err(|_| GatewayError::Cancelled)?
    }
}

fn validate_member_request(
    request: &RequestGuildMembersData,
    declared: u64,
) -> Result<(), GatewayError> {
    if !snowflake::is_snowflake(&request.guild_id) {
        return Err(GatewayError::InvalidRequest(format!(
            "invalid guild id {:?}",
            request.guild_id
        )));
    }
    if request.query.is_some() == request.user_ids.is_some() {
        return Err(GatewayError::InvalidRequest(
            "exactly one of query or user_ids is required".to_string(),
        ));
    }
    if request.presences && !intents::has_intent(declared, intents::GUILD_PRESENCES) {
        return Err(GatewayError::InvalidRequest(
            "requesting presences needs the guild_presences intent".to_string(),
        ));
    }
    if request.query.as_deref() == Some("")
        && request.limit == 0
        && !intents::has_intent(declared, intents::GUILD_MEMBERS)
    {
        return Err(GatewayError::InvalidRequest(
            "listing all members needs the guild_members intent".to_string(),
        ));
    }
    if let Some(ref ids) = request.user_ids {
        if ids.len() > 100 {
            return Err(GatewayError::InvalidRequest(
                "at most 100 user ids per request".to_string(),
            ));
        }
    }
    if request.nonce.as_ref().is_some_and(|n| n.len() > 32) {
        return Err(GatewayError::InvalidRequest(
            "nonce longer than 32 bytes".to_string(),
        ));
    }
    Ok(())
}

enum Idle {
    Connect,
    Stop,
}

enum Plan {
    Stop,
    Stay,
    After(Duration),
}

/// One live socket plus the timers that only exist while it is open.
struct Live {
    socket: SocketHandle,
    heartbeat: Option<Heartbeat>,
    hello_deadline: Instant,
}

/// One gateway session's protocol state machine.
///
/// Runs as its own task. Every inbound frame, timer and command for the
/// shard is handled on that task, so transitions never interleave.
pub struct ShardConnection {
    id: u32,
    config: Arc<GatewayConfig>,
    connector: Arc<dyn Connector>,
    commands: mpsc::UnboundedReceiver<ShardCommand>,
    supervisor: mpsc::UnboundedSender<SupervisorMessage>,
    events: mpsc::UnboundedSender<GatewayEvent>,
    status: watch::Sender<ShardStatus>,
    state: ShardState,
    session: SessionState,
    send_bucket: TokenBucket<OutboundFrame>,
    presence_bucket: TokenBucket<OutboundFrame>,
    backoff: Backoff,
    reconnect_attempts: u32,
    resume_attempts: u32,
    ready_since: Option<Instant>,
    latency: Option<Duration>,
    heartbeat_interval: Option<Duration>,
    last_heartbeat_sent: Option<Instant>,
    last_heartbeat_ack: Option<Instant>,
    requested: Option<ReconnectPolicy>,
    /// Waiting in the supervisor's queue.
    queued: bool,
    /// Told to stay down; admissions are ignored until a reconnect request.
    parked: bool,
    error: Option<GatewayError>,
}

impl ShardConnection {
    pub(crate) fn new(
        id: u32,
        config: Arc<GatewayConfig>,
        connector: Arc<dyn Connector>,
        supervisor: mpsc::UnboundedSender<SupervisorMessage>,
        events: mpsc::UnboundedSender<GatewayEvent>,
    ) -> (Self, ShardHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ShardStatus {
            state: ShardState::Idle,
            session_id: None,
            sequence: None,
            latency: None,
            heartbeat_interval: None,
            last_heartbeat_sent: None,
            last_heartbeat_ack: None,
            reconnect_attempts: 0,
            error: None,
        });
        let handle = ShardHandle {
            id,
            intents: config.intents,
            commands: cmd_tx,
            status: status_rx,
        };
        let shard = Self {
            id,
            send_bucket: TokenBucket::with_reserved(
                config.send_limit,
                config.send_reserved,
                config.send_window,
            ),
            presence_bucket: TokenBucket::new(config.presence_limit, config.presence_window),
            backoff: Backoff::new(config.backoff_base, config.backoff_max)
                .with_jitter(config.backoff_jitter),
            config,
            connector,
            commands: cmd_rx,
            supervisor,
            events,
            status: status_tx,
            state: ShardState::Idle,
            session: SessionState::default(),
            reconnect_attempts: 0,
            resume_attempts: 0,
            ready_since: None,
            latency: None,
            heartbeat_interval: None,
            last_heartbeat_sent: None,
            last_heartbeat_ack: None,
            requested: None,
            queued: true,
            parked: false,
            error: None,
        };
        (shard, handle)
    }

    pub(crate) async fn run(mut self) {
        let mut enqueue_at: Option<Instant> = None;
        loop {
            match self.idle(&mut enqueue_at).await {
                Idle::Connect => {}
                Idle::Stop => break,
            }
            let reason = self.run_session().await;
            match self.plan(reason) {
                Plan::Stop => break,
                Plan::Stay => enqueue_at = None,
                Plan::After(delay) => enqueue_at = Some(Instant::now() + delay),
            }
        }
        self.cancel_pending();
        if self.state != ShardState::Failed {
            self.set_state(ShardState::Disconnected);
        }
        tracing::debug!(shard_id = self.id, "shard task stopped");
    }

    /// Between sessions: hold queued sends, honor lifecycle commands, and
    /// re-enter the supervisor's queue once the backoff delay expires.
    async fn idle(&mut self, enqueue_at: &mut Option<Instant>) -> Idle {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(ShardCommand::Connect) => {
                        self.queued = false;
                        if self.parked {
                            tracing::debug!(shard_id = self.id, "ignoring admission while parked");
                            continue;
                        }
                        *enqueue_at = None;
                        return Idle::Connect;
                    }
                    Some(ShardCommand::Send(frame)) => {
                        if self.parked {
                            frame.finish(Err(GatewayError::Cancelled));
                        } else {
                            self.enqueue(frame);
                        }
                    }
                    Some(ShardCommand::Disconnect { reconnect }) => match reconnect {
                        ReconnectPolicy::Never => {
                            self.parked = true;
                            *enqueue_at = None;
                            self.cancel_pending();
                        }
                        ReconnectPolicy::Auto | ReconnectPolicy::Immediate => {
                            self.parked = false;
                            if !self.queued && enqueue_at.is_none() {
                                *enqueue_at = Some(Instant::now());
                            }
                        }
                    },
                    Some(ShardCommand::HardReset) => self.session.reset(),
                    Some(ShardCommand::Shutdown) | None => return Idle::Stop,
                },
                _ = sleep_until_opt(*enqueue_at) => {
                    *enqueue_at = None;
                    self.queued = true;
                    if self.supervisor.send(SupervisorMessage::Enqueue(self.id)).is_err() {
                        return Idle::Stop;
                    }
                }
            }
        }
    }

    async fn run_session(&mut self) -> DisconnectReason {
        if self.session.can_resume() && self.resume_attempts >= self.config.max_resume_attempts {
            tracing::warn!(
                shard_id = self.id,
                attempts = self.resume_attempts,
                "too many failed resumes, identifying instead"
            );
            self.session.reset();
            self.resume_attempts = 0;
        }

        self.set_state(ShardState::Connecting);
        let base = match (self.session.can_resume(), self.session.resume_url.as_deref()) {
            (true, Some(url)) => url.to_string(),
            _ => self.config.url.clone(),
        };
        let url = self.config.connect_url(&base);
        tracing::debug!(shard_id = self.id, %url, "opening gateway socket");

        let socket = match timeout(self.config.connect_timeout, self.connector.connect(url)).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => return self.end_session(None, DisconnectReason::Transport(e.to_string())),
            Err(_) => {
                return self.end_session(
                    None,
                    DisconnectReason::Transport("connect timed out".to_string()),
                )
            }
        };

        self.emit(GatewayEvent::Connected { shard_id: self.id });
        self.set_state(ShardState::Handshaking);
        let mut live = Live {
            socket,
            heartbeat: None,
            hello_deadline: Instant::now() + self.config.connect_timeout,
        };
        let reason = self.drive(&mut live).await;
        self.end_session(Some(live), reason)
    }

    async fn drive(&mut self, live: &mut Live) -> DisconnectReason {
        loop {
            let heartbeat_due = live.heartbeat.as_ref().map(Heartbeat::next_due);
            let bucket_wake = self.next_bucket_wake();
            let awaiting_hello = live.heartbeat.is_none();

            tokio::select! {
                event = live.socket.rx.recv() => match event {
                    Some(SocketEvent::Text(text)) => {
                        if let Some(reason) = self.handle_frame(live, &text) {
                            return reason;
                        }
                    }
                    Some(SocketEvent::Closed { code: Some(code), reason }) => {
                        return DisconnectReason::Closed { code, reason };
                    }
                    Some(SocketEvent::Closed { code: None, reason }) => {
                        return DisconnectReason::Transport(reason);
                    }
                    None => return DisconnectReason::Transport("socket task ended".to_string()),
                },
                _ = sleep_until_opt(heartbeat_due) => {
                    let now = Instant::now();
                    let Some(heartbeat) = live.heartbeat.as_mut() else { continue };
                    match heartbeat.tick(now) {
                        Beat::Send => {
                            let frame = GatewayMessage::new(opcode::HEARTBEAT, self.session.sequence);
                            self.send_bucket.queue(OutboundFrame::control(frame.to_text()), true);
                            self.record_heartbeat(heartbeat);
                        }
                        Beat::Missed => {
                            tracing::warn!(
                                shard_id = self.id,
                                "heartbeat not acknowledged, treating connection as dead"
                            );
                            return DisconnectReason::HeartbeatTimeout;
                        }
                    }
                },
                _ = sleep_until(live.hello_deadline), if awaiting_hello => {
                    tracing::warn!(shard_id = self.id, "no hello before the connect timeout");
                    return DisconnectReason::Transport("no hello received".to_string());
                },
                cmd = self.commands.recv() => match cmd {
                    Some(ShardCommand::Send(frame)) => self.enqueue(frame),
                    Some(ShardCommand::Disconnect { reconnect }) => {
                        self.requested = Some(reconnect);
                        return DisconnectReason::Requested { reconnect };
                    }
                    Some(ShardCommand::HardReset) => {
                        self.session.reset();
                        return DisconnectReason::HardReset;
                    }
                    Some(ShardCommand::Connect) => {
                        tracing::debug!(shard_id = self.id, "already connected, ignoring admission");
                    }
                    Some(ShardCommand::Shutdown) | None => return DisconnectReason::Shutdown,
                },
                _ = sleep_until_opt(bucket_wake) => {}
            }

            self.flush(live);
        }
    }

    /// Handle one inbound frame. Returns a reason when the frame ends the
    /// connection.
    fn handle_frame(&mut self, live: &mut Live, text: &str) -> Option<DisconnectReason> {
        let msg: GatewayMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                if live.heartbeat.is_none() {
                    tracing::error!(shard_id = self.id, "malformed handshake frame: {e}");
                    self.session.reset();
                    return Some(DisconnectReason::Protocol(format!("malformed frame: {e}")));
                }
                tracing::warn!(shard_id = self.id, "dropping malformed frame: {e}");
                return None;
            }
        };

        let now = Instant::now();
        match msg.op {
            opcode::HELLO => {
                if live.heartbeat.is_some() {
                    tracing::debug!(shard_id = self.id, "ignoring repeated hello");
                    return None;
                }
                let hello = match serde_json::from_value::<HelloData>(msg.data) {
                    Ok(hello) if hello.heartbeat_interval > 0 => hello,
                    _ => {
                        tracing::error!(shard_id = self.id, "malformed hello, resetting session");
                        self.session.reset();
                        return Some(DisconnectReason::Protocol("malformed hello".to_string()));
                    }
                };
                let interval = Duration::from_millis(hello.heartbeat_interval);
                tracing::debug!(
                    shard_id = self.id,
                    interval_ms = hello.heartbeat_interval,
                    trace = ?hello.trace,
                    "received hello"
                );
                let heartbeat = Heartbeat::start(interval, self.config.heartbeat_jitter, now);
                self.record_heartbeat(&heartbeat);
                live.heartbeat = Some(heartbeat);
                self.authenticate();
            }
            opcode::HEARTBEAT_ACK => {
                if let Some(heartbeat) = live.heartbeat.as_mut() {
                    heartbeat.ack(now);
                    self.record_heartbeat(heartbeat);
                }
            }
            opcode::HEARTBEAT => {
                let frame = GatewayMessage::new(opcode::HEARTBEAT, self.session.sequence);
                self.send_bucket.queue(OutboundFrame::control(frame.to_text()), true);
                if let Some(heartbeat) = live.heartbeat.as_mut() {
                    heartbeat.sent_on_request(now);
                    self.record_heartbeat(heartbeat);
                }
            }
            opcode::RECONNECT => {
                tracing::info!(shard_id = self.id, "server requested reconnect");
                return Some(DisconnectReason::ReconnectRequested);
            }
            opcode::INVALID_SESSION => {
                let resumable = msg.data.as_bool().unwrap_or(false);
                tracing::warn!(shard_id = self.id, resumable, "invalid session");
                if !resumable {
                    self.session.reset();
                }
                return Some(DisconnectReason::InvalidSession { resumable });
            }
            opcode::DISPATCH => self.handle_dispatch(msg),
            op => tracing::debug!(shard_id = self.id, op, "ignoring unknown opcode"),
        }
        None
    }

    /// Send identify or resume, depending on what the session allows.
    fn authenticate(&mut self) {
        let resume = self.session.session_id.clone().zip(self.session.sequence);
        let frame = match resume {
            Some((session_id, seq)) => {
                self.resume_attempts += 1;
                self.set_state(ShardState::Resuming);
                tracing::info!(shard_id = self.id, seq, "resuming session");
                GatewayMessage::new(
                    opcode::RESUME,
                    ResumeData {
                        token: self.config.token.clone(),
                        session_id,
                        seq,
                    },
                )
            }
            None => {
                self.session.reset();
                self.set_state(ShardState::Identifying);
                tracing::info!(shard_id = self.id, "identifying");
                GatewayMessage::new(
                    opcode::IDENTIFY,
                    IdentifyData {
                        token: self.config.token.clone(),
                        properties: IdentifyProperties::default(),
                        compress: false,
                        large_threshold: self.config.large_threshold,
                        shard: [self.id, self.config.shard_count],
                        presence: self.config.presence.clone(),
                        intents: self.config.intents,
                    },
                )
            }
        };
        self.send_bucket.queue(OutboundFrame::control(frame.to_text()), true);
    }

    fn handle_dispatch(&mut self, msg: GatewayMessage) {
        let Some(sequence) = msg.seq else {
            tracing::warn!(shard_id = self.id, "dropping dispatch without sequence");
            return;
        };
        if let Some(gap) = self.session.observe(sequence) {
            tracing::warn!(shard_id = self.id, sequence, gap, "non-consecutive sequence");
        }
        let event = msg.event_type.unwrap_or_default();

        match event.as_str() {
            "READY" => match serde_json::from_value::<ReadyData>(msg.data.clone()) {
                Ok(ready) => {
                    let session_id = ready.session_id.clone();
                    self.session.begin(ready.session_id, ready.resume_gateway_url);
                    self.become_ready();
                    tracing::info!(shard_id = self.id, %session_id, "shard ready");
                    self.emit(GatewayEvent::Ready {
                        shard_id: self.id,
                        session_id,
                    });
                }
                Err(e) => {
                    tracing::warn!(shard_id = self.id, "dropping malformed READY: {e}");
                    return;
                }
            },
            "RESUMED" => {
                self.become_ready();
                tracing::info!(shard_id = self.id, "session resumed");
                self.emit(GatewayEvent::Resumed { shard_id: self.id });
            }
            _ => {}
        }

        self.publish();
        self.emit(GatewayEvent::Dispatch {
            shard_id: self.id,
            event,
            sequence,
            data: msg.data,
        });
    }

    /// Copy heartbeat bookkeeping into the published status.
    fn record_heartbeat(&mut self, heartbeat: &Heartbeat) {
        self.heartbeat_interval = Some(heartbeat.interval());
        self.last_heartbeat_sent = heartbeat.last_sent();
        self.last_heartbeat_ack = heartbeat.last_ack();
        if heartbeat.latency().is_some() {
            self.latency = heartbeat.latency();
        }
        self.publish();
    }

    fn become_ready(&mut self) {
        self.reconnect_attempts = 0;
        self.resume_attempts = 0;
        self.ready_since = Some(Instant::now());
        self.set_state(ShardState::Ready);
    }

    fn enqueue(&mut self, frame: OutboundFrame) {
        match frame.kind {
            FrameKind::Presence => {
                // only the latest presence matters
                for superseded in self.presence_bucket.drain() {
                    superseded.finish(Ok(()));
                }
                self.presence_bucket.queue(frame, false);
            }
            FrameKind::Control => self.send_bucket.queue(frame, true),
            FrameKind::Normal => self.send_bucket.queue(frame, false),
        }
    }

    /// Move whatever the buckets admit onto the socket.
    fn flush(&mut self, live: &Live) {
        let now = Instant::now();
        let ready = self.state == ShardState::Ready;
        while let Some(frame) = self.presence_bucket.pop(now, ready) {
            self.send_bucket.queue(frame, false);
        }
        while let Some(frame) = self.send_bucket.pop(now, ready) {
            let sent = live
                .socket
                .tx
                .send(SocketCommand::Text(frame.payload.clone()))
                .is_ok();
            frame.finish(if sent {
                Ok(())
            } else {
                Err(GatewayError::Cancelled)
            });
        }
    }

    fn next_bucket_wake(&self) -> Option<Instant> {
        match (self.send_bucket.next_refill(), self.presence_bucket.next_refill()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn end_session(&mut self, live: Option<Live>, reason: DisconnectReason) -> DisconnectReason {
        if let Some(live) = live {
            let code = if reason.keeps_session() {
                close_code::UNKNOWN_ERROR
            } else {
                close_code::NORMAL
            };
            let _ = live.socket.tx.send(SocketCommand::Close { code });
        }
        // handshake and heartbeat frames belong to the dead socket
        self.send_bucket.retain(|f| f.kind != FrameKind::Control);
        self.set_state(ShardState::Disconnected);
        tracing::info!(shard_id = self.id, ?reason, "shard disconnected");
        self.emit(GatewayEvent::Disconnected {
            shard_id: self.id,
            reason: reason.clone(),
        });
        reason
    }

    /// Decide what follows a disconnect.
    fn plan(&mut self, reason: DisconnectReason) -> Plan {
        if let Some(error) = reason.fatal() {
            tracing::error!(shard_id = self.id, %error, "not reconnecting");
            self.session.reset();
            self.fail(error);
            return Plan::Stop;
        }
        if reason == DisconnectReason::Shutdown {
            return Plan::Stop;
        }
        if !reason.keeps_session() && self.session.session_id.is_some() {
            tracing::info!(shard_id = self.id, "session invalidated, next connect identifies");
            self.session.reset();
        }
        if let Some(since) = self.ready_since.take() {
            if since.elapsed() > self.backoff.current() {
                self.backoff.reset();
            }
        }

        let policy = self.requested.take().unwrap_or(self.config.reconnect);
        if policy == ReconnectPolicy::Never {
            self.parked = true;
            self.cancel_pending();
            return Plan::Stay;
        }
        if let Some(max) = self.config.max_reconnect_attempts {
            if self.reconnect_attempts >= max {
                self.fail(GatewayError::Transport(format!(
                    "gave up after {max} reconnect attempts"
                )));
                return Plan::Stop;
            }
        }
        // immediate only skips the wait before the first attempt
        let delay = if policy == ReconnectPolicy::Immediate && self.reconnect_attempts == 0 {
            Duration::ZERO
        } else {
            self.backoff.next_delay()
        };
        self.reconnect_attempts += 1;
        self.publish();
        tracing::info!(
            shard_id = self.id,
            attempt = self.reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        self.emit(GatewayEvent::Reconnecting {
            shard_id: self.id,
            delay,
            attempt: self.reconnect_attempts,
        });
        Plan::After(delay)
    }

    fn fail(&mut self, error: GatewayError) {
        self.error = Some(error);
        self.cancel_pending();
        self.set_state(ShardState::Failed);
    }

    /// Drop every queued frame; their callers see `Cancelled`.
    fn cancel_pending(&mut self) {
        let dropped = self.send_bucket.drain().len() + self.presence_bucket.drain().len();
        if dropped > 0 {
            tracing::debug!(shard_id = self.id, dropped, "cancelled pending sends");
        }
    }

    fn set_state(&mut self, state: ShardState) {
        if self.state != state {
            tracing::trace!(shard_id = self.id, from = ?self.state, to = ?state, "state transition");
            self.state = state;
        }
        self.publish();
    }

    fn publish(&self) {
        self.status.send_replace(ShardStatus {
            state: self.state,
            session_id: self.session.session_id.clone(),
            sequence: self.session.sequence,
            latency: self.latency,
            heartbeat_interval: self.heartbeat_interval,
            last_heartbeat_sent: self.last_heartbeat_sent,
            last_heartbeat_ack: self.last_heartbeat_ack,
            reconnect_attempts: self.reconnect_attempts,
            error: self.error.clone(),
        });
    }

    fn emit(&self, event: GatewayEvent) {
        let _ = self.events.send(event);
    }
}

pub(super) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
