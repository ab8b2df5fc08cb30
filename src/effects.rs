//! Effect runner for live sessions
//!
//! This module executes effects produced by the state machine. Session
//! lifecycle jobs (start, go live, teardown) run one at a time on a single
//! worker, so a new connect always waits for the previous teardown to
//! finish before it touches the microphone.
//!
//! Resources are acquired in a fixed order: credential, microphone, speaker,
//! recorder, remote session. A failure part way drops whatever was already
//! opened and reports `SetupFailed`; the state machine then issues the one
//! teardown for that session.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::agent::{Agent, SessionProfile};
use crate::audio::{
    generate_recording_path, run_capture, AudioDevices, AudioError, CaptureControls, CaptureTap,
    DeviceStream, FinishedRecording, MixRecorder, Mixer, VolumeLevel,
};
use crate::classification::{classify_sentiment, TextClassifier};
use crate::codec::{self, PcmBlob};
use crate::error::SessionError;
use crate::playback::{PlaybackController, ScheduleOutcome};
use crate::record::{assemble, is_nontrivial, RecordDraft};
use crate::settings::LiveSettings;
use crate::state_machine::{Effect, Event, TeardownReason};
use crate::store::CallRecordSink;
use crate::streaming::{
    run_outbound, ConnectRequest, RealtimeConnector, RemoteEvent, ServerEvent,
};
use crate::transcript::{Role, TranscriptAccumulator};

/// Microphone blocks buffered between the device thread and the capture task
const MIC_CHANNEL_CAPACITY: usize = 64;

/// Encoded frames waiting for the outbound sender (~8s at 4096 samples)
const OUTBOUND_CHANNEL_CAPACITY: usize = 32;

const REMOTE_CHANNEL_CAPACITY: usize = 64;

const ELAPSED_TICK: Duration = Duration::from_secs(1);

/// Upper bound on waiting for session tasks once they are cancelled
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Trait for running effects asynchronously.
/// Completion events are sent back via the provided channel.
#[async_trait]
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>);

    /// Wait for effects already handed to `spawn` to finish (used on exit)
    async fn drain(&self) {}
}

/// Returns the realtime credential, or `None` when it is not configured.
/// Called on every connect.
pub type CredentialSource = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Everything a live session is built from
pub struct SessionDeps {
    pub connector: Arc<dyn RealtimeConnector>,
    pub devices: Arc<dyn AudioDevices>,
    /// `None` leaves every record Neutral
    pub classifier: Option<Arc<dyn TextClassifier>>,
    pub sink: Arc<dyn CallRecordSink>,
    pub credential: CredentialSource,
    pub settings: LiveSettings,
    pub agent: Option<Agent>,
    pub recordings_dir: PathBuf,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn device_error(e: AudioError) -> SessionError {
    SessionError::Device(e.to_string())
}

/// Run a blocking device call on the blocking pool
async fn on_device_thread<T, F>(f: F) -> Result<T, AudioError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, AudioError> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.unwrap_or_else(|e| {
        Err(AudioError::StreamCreationFailed(format!(
            "device task failed: {}",
            e
        )))
    })
}

/// Lifecycle work, executed in order by the job worker
#[derive(Debug)]
enum Job {
    Start {
        id: Uuid,
        lifetime: CancellationToken,
    },
    GoLive {
        id: Uuid,
        muted: bool,
    },
    Teardown {
        id: Uuid,
        reason: TeardownReason,
    },
}

struct QueuedJob {
    job: Job,
    tx: mpsc::Sender<Event>,
    _pending: TaskTrackerToken,
}

struct RunnerInner {
    deps: SessionDeps,
    profile: SessionProfile,
    controls: Arc<CaptureControls>,
    /// The one session that may own the devices
    slot: tokio::sync::Mutex<Option<ActiveSession>>,
}

/// Real effect runner: CPAL devices (or any `AudioDevices`), a realtime
/// connector and a call record sink.
pub struct LiveEffectRunner {
    inner: Arc<RunnerInner>,
    jobs: mpsc::UnboundedSender<QueuedJob>,
    pending: TaskTracker,
    /// Cancelled as soon as the session's teardown is requested
    lifetime: Mutex<Option<(Uuid, CancellationToken)>>,
}

impl LiveEffectRunner {
    /// Create the runner and its job worker. Must be called within a Tokio runtime.
    pub fn new(deps: SessionDeps) -> Arc<Self> {
        let profile = SessionProfile::for_agent(deps.agent.as_ref());
        log::info!(
            "EffectRunner: voice {}, participant {:?}",
            profile.voice_name,
            profile.participant_label
        );

        let inner = Arc::new(RunnerInner {
            deps,
            profile,
            controls: Arc::new(CaptureControls::new(Arc::new(VolumeLevel::new()))),
            slot: tokio::sync::Mutex::new(None),
        });

        let (jobs, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_jobs(Arc::clone(&inner), rx));

        Arc::new(Self {
            inner,
            jobs,
            pending: TaskTracker::new(),
            lifetime: Mutex::new(None),
        })
    }

    /// Live microphone level (0-100), updated from the capture path
    pub fn volume(&self) -> Arc<VolumeLevel> {
        Arc::clone(self.inner.controls.volume())
    }

    pub fn controls(&self) -> &Arc<CaptureControls> {
        &self.inner.controls
    }

    pub async fn has_active_session(&self) -> bool {
        self.inner.slot.lock().await.is_some()
    }

    fn enqueue(&self, job: Job, tx: mpsc::Sender<Event>) {
        let queued = QueuedJob {
            job,
            tx,
            _pending: self.pending.token(),
        };
        if let Err(e) = self.jobs.send(queued) {
            log::error!("EffectRunner: job worker gone, dropping {:?}", e.0.job);
        }
    }

    fn lifetime_for(&self, id: Uuid) -> Option<CancellationToken> {
        match &*lock(&self.lifetime) {
            Some((current, token)) if *current == id => Some(token.clone()),
            _ => None,
        }
    }
}

#[async_trait]
impl EffectRunner for LiveEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::StartSession { id } => {
                let lifetime = CancellationToken::new();
                let replaced = lock(&self.lifetime).replace((id, lifetime.clone()));
                if let Some((previous, token)) = replaced {
                    log::warn!("EffectRunner: session {} still marked active", previous);
                    token.cancel();
                }
                self.enqueue(Job::Start { id, lifetime }, tx);
            }

            Effect::GoLive { id, muted } => self.enqueue(Job::GoLive { id, muted }, tx),

            Effect::StartElapsedTick { id } => match self.lifetime_for(id) {
                Some(lifetime) => {
                    tokio::spawn(tick_loop(id, lifetime, tx));
                }
                None => log::debug!("StartElapsedTick: session {} already ending", id),
            },

            Effect::SetMuted { id, muted } => {
                let label = if muted { "muted" } else { "unmuted" };
                log::info!("Session {}: microphone {}", id, label);
                self.inner.controls.set_muted(muted);
            }

            Effect::Teardown { id, reason } => {
                {
                    let mut lifetime = lock(&self.lifetime);
                    if matches!(&*lifetime, Some((current, _)) if *current == id) {
                        if let Some((_, token)) = lifetime.take() {
                            token.cancel();
                        }
                    }
                }
                self.enqueue(Job::Teardown { id, reason }, tx);
            }

            other @ (Effect::AppendLog(_) | Effect::EmitUi) => {
                log::warn!("EffectRunner: {:?} belongs to the state loop", other);
            }
        }
    }

    async fn drain(&self) {
        self.pending.close();
        self.pending.wait().await;
    }
}

async fn run_jobs(inner: Arc<RunnerInner>, mut rx: mpsc::UnboundedReceiver<QueuedJob>) {
    while let Some(QueuedJob { job, tx, _pending }) = rx.recv().await {
        match job {
            Job::Start { id, lifetime } => {
                let started = tokio::select! {
                    _ = lifetime.cancelled() => None,
                    result = ActiveSession::start(&inner, id, tx.clone()) => Some(result),
                };

                match started {
                    Some(Ok(session)) => {
                        *inner.slot.lock().await = Some(session);
                    }
                    Some(Err(err)) => {
                        log::error!("Session {}: setup failed: {}", id, err);
                        let _ = tx.send(Event::SetupFailed { id, err }).await;
                    }
                    None => log::info!("Session {}: cancelled while connecting", id),
                }
            }

            Job::GoLive { id, muted } => {
                let mut slot = inner.slot.lock().await;
                match slot.as_mut() {
                    Some(session) if session.id == id => {
                        session.live_since = Some(Instant::now());
                        session.started_at = Utc::now();
                        inner.controls.set_muted(muted);
                        inner.controls.wire(session.frames_tx.clone());
                        log::info!("Session {}: live, streaming microphone", id);
                    }
                    _ => log::debug!("GoLive: session {} not active", id),
                }
            }

            Job::Teardown { id, reason } => teardown(&inner, id, reason, &tx).await,
        }
    }

    log::debug!("EffectRunner: job worker exiting");
}

async fn tick_loop(id: Uuid, lifetime: CancellationToken, tx: mpsc::Sender<Event>) {
    let mut interval = tokio::time::interval(ELAPSED_TICK);
    // The first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = lifetime.cancelled() => break,
            _ = interval.tick() => {
                if tx.send(Event::ElapsedTick { id }).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Run the single teardown routine for `id`, then report `TeardownDone`
async fn teardown(inner: &RunnerInner, id: Uuid, reason: TeardownReason, tx: &mpsc::Sender<Event>) {
    // Held until every step below has finished
    let mut slot = inner.slot.lock().await;

    let record_saved = match slot.take() {
        Some(session) if session.id == id => session.teardown(inner, reason).await,
        Some(other) => {
            log::warn!(
                "Teardown: session {} requested but {} holds the devices",
                id,
                other.id
            );
            *slot = Some(other);
            let _ = tx.send(Event::TeardownDone { id, record_saved: false }).await;
            return;
        }
        None => {
            log::debug!("Teardown: nothing held for session {} ({:?})", id, reason);
            false
        }
    };

    // (6) Clear capture state shown to the user
    inner.controls.unwire();
    inner.controls.set_muted(false);
    inner.controls.reset_volume();
    drop(slot);

    log::info!("Teardown: session {} done (record saved: {})", id, record_saved);
    let _ = tx.send(Event::TeardownDone { id, record_saved }).await;
}

/// Resources owned by one live session
struct ActiveSession {
    id: Uuid,
    cancel: CancellationToken,
    tasks: TaskTracker,
    input: DeviceStream,
    output: DeviceStream,
    mixer: Arc<Mixer>,
    playback: Arc<PlaybackController>,
    recorder: Option<MixRecorder>,
    transcript: Arc<Mutex<TranscriptAccumulator>>,
    frames_tx: mpsc::Sender<PcmBlob>,
    started_at: DateTime<Utc>,
    live_since: Option<Instant>,
}

impl ActiveSession {
    async fn start(
        inner: &RunnerInner,
        id: Uuid,
        tx: mpsc::Sender<Event>,
    ) -> Result<Self, SessionError> {
        let deps = &inner.deps;

        let api_key = (deps.credential)()
            .filter(|key| !key.trim().is_empty())
            .ok_or(SessionError::CredentialMissing)?;

        let (mic_tx, mic_rx) = mpsc::channel::<Vec<f32>>(MIC_CHANNEL_CAPACITY);
        let devices = Arc::clone(&deps.devices);
        let input = on_device_thread(move || devices.open_input(mic_tx))
            .await
            .map_err(|e| SessionError::PermissionDenied(e.to_string()))?;

        let devices = Arc::clone(&deps.devices);
        let (mixer, output) = on_device_thread(move || {
            let mixer = Mixer::shared(devices.output_sample_rate()?);
            let output = devices.open_output(Arc::clone(&mixer))?;
            Ok((mixer, output))
        })
        .await
        .map_err(device_error)?;
        let output_rate = mixer.sample_rate();

        let (recorder, tracks) = MixRecorder::start(output_rate);
        mixer.attach_tap(tracks.agent);
        let tap = CaptureTap::new(
            Arc::clone(&inner.controls),
            input.sample_rate(),
            deps.settings.frame_samples,
        )
        .with_recording(output_rate, tracks.user);

        let (remote_tx, remote_rx) = mpsc::channel(REMOTE_CHANNEL_CAPACITY);
        let request = ConnectRequest {
            api_key,
            model: deps.settings.model.clone(),
            system_instruction: inner.profile.system_instruction.clone(),
            voice_name: inner.profile.voice_name.clone(),
        };
        let remote = deps.connector.connect(request, remote_tx).await?;

        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        let playback = Arc::new(PlaybackController::new(mixer.clone()));
        let transcript = Arc::new(Mutex::new(TranscriptAccumulator::new()));

        let capture_cancel = cancel.clone();
        tasks.spawn(async move {
            tokio::select! {
                _ = capture_cancel.cancelled() => {}
                _ = run_capture(mic_rx, tap) => {}
            }
        });

        let (frames_tx, frames_rx) = mpsc::channel::<PcmBlob>(OUTBOUND_CHANNEL_CAPACITY);
        tasks.spawn(run_outbound(remote, frames_rx, cancel.clone()));

        let (chunks_tx, chunks_rx) = mpsc::unbounded_channel();
        tasks.spawn(run_playback_queue(chunks_rx, cancel.clone()));

        let pump = SessionPump {
            id,
            tx,
            transcript: Arc::clone(&transcript),
            playback: Arc::clone(&playback),
            chunks: chunks_tx,
        };
        tasks.spawn(pump.run(remote_rx, cancel.clone()));

        log::info!("Session {}: devices open, waiting for setup", id);

        Ok(Self {
            id,
            cancel,
            tasks,
            input,
            output,
            mixer,
            playback,
            recorder: Some(recorder),
            transcript,
            frames_tx,
            started_at: Utc::now(),
            live_since: None,
        })
    }

    /// Steps 1-5 of teardown; returns whether a call record was saved
    async fn teardown(mut self, inner: &RunnerInner, reason: TeardownReason) -> bool {
        log::info!("Teardown: session {} ({:?})", self.id, reason);

        // Nothing reaches the remote or the speaker past this point
        inner.controls.unwire();
        self.mixer.detach();

        // (1) Pending fragments become turns
        let transcript = {
            let mut acc = lock(&self.transcript);
            let flushed = acc.flush_pending();
            if flushed > 0 {
                log::debug!("Teardown: flushed {} pending turn(s)", flushed);
            }
            acc.render_transcript()
        };

        // (2) Recorder
        let recording = match self.recorder.take() {
            Some(recorder) => match recorder.stop().await {
                Ok(recording) => Some(recording),
                Err(e) => {
                    log::warn!("Teardown: recorder did not stop cleanly: {}", e);
                    None
                }
            },
            None => None,
        };

        // (3) Call record
        let duration_seconds = self
            .live_since
            .map(|since| since.elapsed().as_secs())
            .unwrap_or(0);
        let record_saved = if is_nontrivial(duration_seconds, &transcript) {
            self.save_record(inner, duration_seconds, transcript, recording)
                .await
        } else {
            log::info!(
                "Teardown: {}s with no transcript, no call record",
                duration_seconds
            );
            false
        };

        // (4) Audio pipeline and remote session
        self.cancel.cancel();
        let (mut input, mut output) = (self.input, self.output);
        if let Err(e) = tokio::task::spawn_blocking(move || {
            input.stop();
            output.stop();
        })
        .await
        {
            log::warn!("Teardown: device release task failed: {}", e);
        }
        self.tasks.close();
        if tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, self.tasks.wait())
            .await
            .is_err()
        {
            log::warn!(
                "Teardown: {} session task(s) still running after {:?}",
                self.tasks.len(),
                TASK_SHUTDOWN_TIMEOUT
            );
        }

        // (5) Playback scheduling
        self.playback.reset();

        record_saved
    }

    async fn save_record(
        &self,
        inner: &RunnerInner,
        duration_seconds: u64,
        transcript: String,
        recording: Option<FinishedRecording>,
    ) -> bool {
        let recording_handle = match recording {
            Some(recording) if !recording.samples.is_empty() => {
                save_recording(&inner.deps.recordings_dir, self.id, self.started_at, recording)
                    .await
            }
            _ => None,
        };

        let Some(mut record) = assemble(RecordDraft {
            session_id: self.id,
            profile: &inner.profile,
            started_at: self.started_at,
            duration_seconds,
            transcript,
            recording_handle,
        }) else {
            return false;
        };

        let settings = &inner.deps.settings;
        if let Some(classifier) = inner.deps.classifier.as_deref() {
            if settings.sentiment_enabled {
                record.sentiment = classify_sentiment(
                    classifier,
                    &record.transcript,
                    settings.classification_timeout(),
                )
                .await;
            }
        }

        let sink = Arc::clone(&inner.deps.sink);
        match tokio::task::spawn_blocking(move || sink.append(record)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                log::warn!("Teardown: failed to save call record: {}", e);
                false
            }
            Err(e) => {
                log::warn!("Teardown: call record task failed: {}", e);
                false
            }
        }
    }
}

async fn save_recording(
    dir: &std::path::Path,
    id: Uuid,
    started_at: DateTime<Utc>,
    recording: FinishedRecording,
) -> Option<PathBuf> {
    let path = match generate_recording_path(dir, id, started_at) {
        Ok(path) => path,
        Err(e) => {
            log::warn!("Teardown: cannot create recordings dir {:?}: {}", dir, e);
            return None;
        }
    };

    match recording.save(path).await {
        Ok(path) => Some(path),
        Err(e) => {
            log::warn!("Teardown: failed to write recording: {}", e);
            None
        }
    }
}

/// Awaits scheduling futures one at a time, preserving arrival order
async fn run_playback_queue(
    mut chunks: mpsc::UnboundedReceiver<BoxFuture<'static, ScheduleOutcome>>,
    cancel: CancellationToken,
) {
    let mut scheduled = 0u64;
    let mut discarded = 0u64;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = chunks.recv() => next,
        };
        let Some(schedule) = next else { break };

        match schedule.await {
            ScheduleOutcome::Scheduled { .. } => scheduled += 1,
            ScheduleOutcome::Discarded { .. } => discarded += 1,
            ScheduleOutcome::Dropped(_) => {}
        }
    }

    log::debug!(
        "Playback: queue ended ({} scheduled, {} discarded)",
        scheduled,
        discarded
    );
}

/// Translates remote events into transcript, playback and reducer events
struct SessionPump {
    id: Uuid,
    tx: mpsc::Sender<Event>,
    transcript: Arc<Mutex<TranscriptAccumulator>>,
    playback: Arc<PlaybackController>,
    chunks: mpsc::UnboundedSender<BoxFuture<'static, ScheduleOutcome>>,
}

impl SessionPump {
    async fn run(self, mut remote: mpsc::Receiver<RemoteEvent>, cancel: CancellationToken) {
        let id = self.id;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = remote.recv() => next,
            };

            let event = match next {
                Some(RemoteEvent::Open) => Event::RemoteOpen { id },
                Some(RemoteEvent::Message(message)) => {
                    if !self.apply(message).await {
                        break;
                    }
                    continue;
                }
                Some(RemoteEvent::Closed { code, reason }) => Event::RemoteClosed {
                    id,
                    reason: match code {
                        Some(code) => format!("{} ({})", reason, code),
                        None => reason,
                    },
                },
                Some(RemoteEvent::Error(err)) => Event::RemoteError { id, err },
                None => Event::RemoteClosed {
                    id,
                    reason: "Event stream ended".to_string(),
                },
            };

            let terminal = !matches!(event, Event::RemoteOpen { .. });
            if self.tx.send(event).await.is_err() || terminal {
                break;
            }
        }

        log::debug!("Session {}: event pump ended", id);
    }

    /// Audio, then transcripts, then turn completion, then interruption.
    /// Returns false once the state loop is gone.
    async fn apply(&self, message: ServerEvent) -> bool {
        for audio in message.audio {
            let decode = async move {
                match tokio::task::spawn_blocking(move || {
                    codec::decode_chunk(&audio.data, &audio.mime_type)
                })
                .await
                {
                    Ok(result) => result,
                    Err(e) => Err(SessionError::MalformedAudio(format!(
                        "decode task failed: {}",
                        e
                    ))),
                }
            };

            let schedule: BoxFuture<'static, ScheduleOutcome> =
                Box::pin(self.playback.schedule_chunk(decode));
            if self.chunks.send(schedule).is_err() {
                log::debug!("Session {}: playback queue closed", self.id);
            }
        }

        {
            let mut transcript = lock(&self.transcript);
            if let Some(text) = &message.input_transcript {
                transcript.append_fragment(Role::User, text);
            }
            if let Some(text) = &message.output_transcript {
                transcript.append_fragment(Role::Agent, text);
            }
            if message.turn_complete {
                transcript.commit_turn(Role::User);
                transcript.commit_turn(Role::Agent);
            }
        }

        if message.interrupted {
            self.playback.on_interrupted();
            return self
                .tx
                .send(Event::Interrupted { id: self.id })
                .await
                .is_ok();
        }

        true
    }
}
