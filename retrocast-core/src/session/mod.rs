mod gate;
mod registry;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RtspSection;
use crate::encoder::{
    compose_args, EncodeTarget, EncoderExit, EncoderHandle, EncoderLauncher, EncoderSettings,
    LaunchRequest,
};
use crate::error::StreamError;
use crate::input::{InputAcquirer, InputRelease};
use crate::profile::Profile;
use crate::resolver::StreamResolver;
use crate::rtsp::{MediaDescription, MediaHub, RtspTransport, StreamKey, StreamRequest};
use crate::timespec::clamp_offset;

pub use gate::{GateSignal, ReadyGate};
pub use registry::{SessionRegistry, SessionSnapshot};

/// Identity of one publishing RTSP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PublisherId(Uuid);

impl PublisherId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PublisherId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PublisherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Address the encoder publishes to.
    pub publish_host: String,
    pub publish_port: u16,
    pub udp_enabled: bool,
    pub publisher_timeout: Duration,
    pub resolve_timeout: Duration,
    pub seek_tolerance: f64,
}

impl SessionOptions {
    pub fn from_config(rtsp: &RtspSection, publish_port: u16) -> Self {
        Self {
            publish_host: "127.0.0.1".into(),
            publish_port,
            udp_enabled: rtsp.udp_enabled(),
            publisher_timeout: rtsp.publisher_timeout(),
            resolve_timeout: rtsp.resolve_timeout(),
            seek_tolerance: rtsp.seek_tolerance_seconds,
        }
    }
}

/// Collaborators shared by every session.
pub struct SessionContext {
    pub resolver: Arc<dyn StreamResolver>,
    pub launcher: Arc<dyn EncoderLauncher>,
    pub acquirer: InputAcquirer,
    pub settings: EncoderSettings,
    pub options: SessionOptions,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("settings", &self.settings)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Transport the encoder publishes with. UDP needs the server's UDP ports.
pub fn publish_transport(preference: Option<RtspTransport>, udp_enabled: bool) -> RtspTransport {
    match preference {
        None | Some(RtspTransport::Tcp) => RtspTransport::Tcp,
        Some(udp) if udp_enabled => udp,
        Some(udp) => {
            warn!(requested = %udp, "udp transport not configured, publishing over tcp");
            RtspTransport::Tcp
        }
    }
}

/// What a RECORDing publisher needs to forward packets for its attempt.
#[derive(Debug, Clone)]
pub struct PublisherFeed {
    pub hub: MediaHub,
    /// Cancelled when the attempt is superseded or the session closes.
    pub attempt: CancellationToken,
}

struct SessionState {
    attempt: u64,
    offset: f64,
    running: bool,
    closed: bool,
    cancel: Option<CancellationToken>,
    encoder: Option<EncoderHandle>,
    release: Option<InputRelease>,
    description: Option<MediaDescription>,
    hub: Option<MediaHub>,
    publisher: Option<PublisherId>,
    last_error: Option<StreamError>,
    gate: ReadyGate,
}

/// Resources of an attempt being torn down, in teardown order.
#[derive(Default)]
struct Detached {
    cancel: Option<CancellationToken>,
    hub: Option<MediaHub>,
    encoder: Option<EncoderHandle>,
    release: Option<InputRelease>,
}

impl Detached {
    fn tear_down(self) {
        if let Some(cancel) = self.cancel {
            cancel.cancel();
        }
        if let Some(hub) = self.hub {
            hub.close();
        }
        if let Some(encoder) = self.encoder {
            encoder.kill();
        }
        if let Some(release) = self.release {
            release.release();
        }
    }
}

/// One playback intent and the encoder serving it.
pub struct StreamSession {
    key: StreamKey,
    profile: Profile,
    video_id: String,
    transport: Option<RtspTransport>,
    created_at: DateTime<Utc>,
    context: Arc<SessionContext>,
    registry: Weak<SessionRegistry>,
    state: Mutex<SessionState>,
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("key", &self.key)
            .field("profile", &self.profile)
            .field("video_id", &self.video_id)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl StreamSession {
    fn new(
        request: &StreamRequest,
        context: Arc<SessionContext>,
        registry: Weak<SessionRegistry>,
    ) -> Self {
        Self {
            key: request.key.clone(),
            profile: request.profile,
            video_id: request.video_id.clone(),
            transport: request.transport,
            created_at: Utc::now(),
            context,
            registry,
            state: Mutex::new(SessionState {
                attempt: 0,
                offset: clamp_offset(request.start),
                running: false,
                closed: false,
                cancel: None,
                encoder: None,
                release: None,
                description: None,
                hub: None,
                publisher: None,
                last_error: None,
                gate: ReadyGate::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    pub fn video_id(&self) -> &str {
        &self.video_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn offset(&self) -> f64 {
        self.lock().offset
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn is_ready(&self) -> bool {
        let state = self.lock();
        state.description.is_some() && state.publisher.is_some()
    }

    pub fn description(&self) -> Option<MediaDescription> {
        self.lock().description.clone()
    }

    pub fn hub(&self) -> Option<MediaHub> {
        self.lock().hub.clone()
    }

    pub fn publisher(&self) -> Option<PublisherId> {
        self.lock().publisher
    }

    pub fn last_error(&self) -> Option<StreamError> {
        self.lock().last_error.clone()
    }

    /// True when `start` is outside the seek tolerance of the current offset.
    pub fn offset_differs(&self, start: f64) -> bool {
        let tolerance = self.context.options.seek_tolerance;
        (self.lock().offset - clamp_offset(start)).abs() >= tolerance
    }

    /// Launches the encoder unless an attempt is already running.
    pub fn ensure_started(self: &Arc<Self>) {
        let (attempt, cancel, offset) = {
            let mut state = self.lock();
            if state.running || state.closed {
                return;
            }
            state.running = true;
            let cancel = CancellationToken::new();
            state.cancel = Some(cancel.clone());
            (state.attempt, cancel, state.offset)
        };
        debug!(key = %self.key, attempt, offset, "starting encode attempt");
        let session = Arc::clone(self);
        tokio::spawn(async move { session.run_attempt(attempt, cancel, offset).await });
    }

    async fn run_attempt(self: Arc<Self>, attempt: u64, cancel: CancellationToken, offset: f64) {
        if let Err(err) = self.start_encoder(attempt, &cancel, offset).await {
            if cancel.is_cancelled() {
                debug!(key = %self.key, attempt, error = %err, "abandoned encode attempt");
            } else {
                self.fail_attempt(attempt, err);
            }
        }
    }

    async fn start_encoder(
        self: &Arc<Self>,
        attempt: u64,
        cancel: &CancellationToken,
        offset: f64,
    ) -> Result<(), StreamError> {
        let context = &self.context;
        let resolve_timeout = context.options.resolve_timeout;
        let url = tokio::select! {
            _ = cancel.cancelled() => return Err(StreamError::Closed),
            resolved = timeout(resolve_timeout, context.resolver.resolve(&self.video_id)) => {
                match resolved {
                    Ok(Ok(url)) => url,
                    Ok(Err(err)) => return Err(StreamError::ResolveFailed(err.to_string())),
                    Err(_) => {
                        return Err(StreamError::ResolveFailed(format!(
                            "timed out after {}s",
                            resolve_timeout.as_secs()
                        )))
                    }
                }
            }
        };

        let (input, release) = context.acquirer.build_input(&url, offset).await?;
        let transport = publish_transport(self.transport, context.options.udp_enabled);
        let target = EncodeTarget::Rtsp {
            url: format!(
                "rtsp://{}:{}{}",
                context.options.publish_host,
                context.options.publish_port,
                self.key.resource()
            ),
            transport,
        };
        let args = compose_args(&context.settings, self.profile.spec(), &input, &target)?;
        if cancel.is_cancelled() {
            release.release();
            return Err(StreamError::Closed);
        }

        let mut process = context
            .launcher
            .launch(
                LaunchRequest {
                    args,
                    pipe_stdin: input.uses_pipe,
                    pipe_stdout: false,
                    label: self.key.to_string(),
                },
                cancel.clone(),
            )
            .await?;

        if let Some(stdin) = process.stdin.take() {
            context
                .acquirer
                .start_pump(stdin, input.source_url.clone(), cancel.clone());
        }

        let stale = {
            let mut state = self.lock();
            if state.attempt == attempt && !state.closed {
                state.encoder = Some(process.handle.clone());
                state.release = Some(release);
                None
            } else {
                Some(release)
            }
        };
        if let Some(release) = stale {
            process.handle.kill();
            release.release();
            return Ok(());
        }

        let session = Arc::clone(self);
        let exit = process.exit;
        tokio::spawn(async move {
            let outcome = exit.await.unwrap_or(EncoderExit::Killed);
            session.on_encoder_exit(attempt, outcome);
        });
        Ok(())
    }

    fn on_encoder_exit(self: &Arc<Self>, attempt: u64, outcome: EncoderExit) {
        {
            let mut state = self.lock();
            if state.attempt != attempt || state.closed {
                return;
            }
            state.running = false;
            state.encoder = None;
        }
        match outcome {
            EncoderExit::Killed => {}
            EncoderExit::Failed(reason) => self.fail(StreamError::EncoderRuntimeFailure(reason)),
            EncoderExit::Finished => {
                info!(key = %self.key, "encoder finished, closing session");
                self.remove_from_registry();
            }
        }
    }

    fn fail_attempt(self: &Arc<Self>, attempt: u64, err: StreamError) {
        if self.lock().attempt != attempt {
            return;
        }
        self.fail(err);
    }

    /// Records a fatal error for current and future waiters, then removes the
    /// session so a later request starts fresh.
    pub fn fail(self: &Arc<Self>, err: StreamError) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            if state.last_error.is_none() {
                state.last_error = Some(err.clone());
            }
            state.running = false;
            state.gate.close(GateSignal::Failed(err.clone()));
        }
        warn!(key = %self.key, error = %err, "stream session failed");
        self.remove_from_registry();
    }

    fn remove_from_registry(self: &Arc<Self>) {
        match self.registry.upgrade() {
            Some(registry) => registry.remove(self),
            None => self.shutdown(),
        }
    }

    /// Blocks until the current attempt has a publisher and a description,
    /// fails, is closed, or `wait` elapses.
    pub async fn wait_ready(&self, wait: Duration) -> Result<MediaDescription, StreamError> {
        let deadline = Instant::now() + wait;
        loop {
            let gate = {
                let state = self.lock();
                if let Some(err) = &state.last_error {
                    return Err(err.clone());
                }
                if state.closed {
                    return Err(StreamError::Closed);
                }
                if let (Some(description), Some(_)) = (&state.description, &state.publisher) {
                    return Ok(description.clone());
                }
                match state.gate.signal() {
                    None => state.gate.clone(),
                    Some(GateSignal::Failed(err)) => return Err(err),
                    Some(_) => return Err(StreamError::Closed),
                }
            };
            if timeout_at(deadline, gate.wait()).await.is_err() {
                return Err(StreamError::Timeout);
            }
        }
    }

    /// Restarts the encode at `offset` unless the session is already ready
    /// within the seek tolerance.
    pub async fn seek(self: &Arc<Self>, offset: f64) -> Result<MediaDescription, StreamError> {
        let offset = clamp_offset(offset);
        let tolerance = self.context.options.seek_tolerance;
        let (detached, publisher, old_gate) = {
            let mut state = self.lock();
            if state.closed {
                return Err(StreamError::Closed);
            }
            if (state.offset - offset).abs() < tolerance {
                if let Some(description) = &state.description {
                    debug!(key = %self.key, offset, "seek within tolerance");
                    return Ok(description.clone());
                }
            }
            state.offset = offset;
            state.attempt += 1;
            state.running = false;
            state.last_error = None;
            state.description = None;
            let old_gate = std::mem::replace(&mut state.gate, ReadyGate::new());
            let detached = Detached {
                cancel: state.cancel.take(),
                hub: None,
                encoder: state.encoder.take(),
                release: state.release.take(),
            };
            (detached, state.publisher.take(), old_gate)
        };

        info!(key = %self.key, offset, "seeking, relaunching encoder");
        if let (Some(publisher), Some(registry)) = (publisher, self.registry.upgrade()) {
            registry.unbind_publisher(publisher);
        }
        detached.tear_down();
        old_gate.close(GateSignal::Superseded);

        self.ensure_started();
        self.wait_ready(self.context.options.publisher_timeout).await
    }

    /// Binds the announcing publisher and its description. A second,
    /// different publisher is refused.
    pub fn attach_publisher(
        &self,
        publisher: PublisherId,
        description: MediaDescription,
    ) -> Result<(), StreamError> {
        let mut state = self.lock();
        if state.closed {
            return Err(StreamError::Closed);
        }
        if let Some(existing) = state.publisher {
            if existing != publisher {
                return Err(StreamError::PublisherConflict);
            }
        }
        state.description = Some(description);
        state.publisher = Some(publisher);
        state.hub.get_or_insert_with(MediaHub::new);
        if state.gate.close(GateSignal::Ready) {
            info!(key = %self.key, %publisher, "publisher attached");
        }
        Ok(())
    }

    /// Packet sink for `publisher`, if it is still the session's publisher.
    pub fn publisher_feed(&self, publisher: PublisherId) -> Option<PublisherFeed> {
        let state = self.lock();
        if state.closed || state.publisher != Some(publisher) {
            return None;
        }
        Some(PublisherFeed {
            hub: state.hub.clone()?,
            attempt: state.cancel.clone()?,
        })
    }

    /// Tears down everything the session holds. Waiters get `Closed`.
    pub fn shutdown(&self) {
        let (detached, gate) = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.running = false;
            state.description = None;
            state.publisher = None;
            let detached = Detached {
                cancel: state.cancel.take(),
                hub: state.hub.take(),
                encoder: state.encoder.take(),
                release: state.release.take(),
            };
            (detached, state.gate.clone())
        };
        debug!(key = %self.key, "shutting down stream session");
        detached.tear_down();
        gate.close(GateSignal::Closed);
    }

    fn snapshot(&self) -> SessionSnapshot {
        let state = self.lock();
        SessionSnapshot {
            key: self.key.to_string(),
            profile: self.profile,
            video_id: self.video_id.clone(),
            offset: state.offset,
            ready: state.description.is_some() && state.publisher.is_some(),
            created_at: self.created_at,
        }
    }
}
