//! Turn and interruption control for inbound speech
//!
//! Inbound chunks are decoded asynchronously and then scheduled back to back
//! on the output clock. Barge-in bumps the epoch; any decode that was started
//! under an older epoch is thrown away when it completes, so the agent never
//! resumes talking over the user.
//!
//! The epoch check and the scheduling happen under the same lock that
//! [`PlaybackController::on_interrupted`] takes, so there is no window in
//! which a stale chunk can slip in after an interruption.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::audio::{OutputGraph, SourceId};
use crate::codec::AudioChunk;
use crate::error::SessionError;

/// Result of one `schedule_chunk` call
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleOutcome {
    /// Chunk queued on the output graph
    Scheduled {
        source: SourceId,
        start_at: f64,
        epoch: u64,
    },
    /// An interruption happened while the chunk was decoding
    Discarded { chunk_epoch: u64, live_epoch: u64 },
    /// Decode failed; the chunk is skipped
    Dropped(SessionError),
}

#[derive(Debug, Clone, Copy)]
struct ScheduledEntry {
    id: SourceId,
    end_at: f64,
}

#[derive(Debug, Default)]
struct PlaybackState {
    epoch: u64,
    cursor: f64,
    scheduled: Vec<ScheduledEntry>,
}

pub struct PlaybackController {
    output: Arc<dyn OutputGraph>,
    state: Mutex<PlaybackState>,
}

impl PlaybackController {
    pub fn new(output: Arc<dyn OutputGraph>) -> Self {
        Self {
            output,
            state: Mutex::new(PlaybackState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PlaybackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    /// Output time at which the next chunk will start (0 when idle)
    pub fn cursor(&self) -> f64 {
        self.lock().cursor
    }

    pub fn scheduled_len(&self) -> usize {
        self.lock().scheduled.len()
    }

    /// Schedule a chunk whose samples are produced by `decode`
    ///
    /// The epoch is captured when this is called, not when the returned
    /// future is first polled.
    pub fn schedule_chunk<F>(
        self: &Arc<Self>,
        decode: F,
    ) -> impl Future<Output = ScheduleOutcome> + Send + 'static
    where
        F: Future<Output = Result<AudioChunk, SessionError>> + Send + 'static,
    {
        let chunk_epoch = self.epoch();
        let this = Arc::clone(self);

        async move {
            match decode.await {
                Ok(chunk) => this.commit(chunk_epoch, chunk),
                Err(e) => {
                    log::warn!("Playback: dropping undecodable chunk: {}", e);
                    ScheduleOutcome::Dropped(e)
                }
            }
        }
    }

    fn commit(&self, chunk_epoch: u64, chunk: AudioChunk) -> ScheduleOutcome {
        let mut state = self.lock();

        if state.epoch != chunk_epoch {
            log::debug!(
                "Playback: discarding chunk from epoch {} (live epoch {})",
                chunk_epoch,
                state.epoch
            );
            return ScheduleOutcome::Discarded {
                chunk_epoch,
                live_epoch: state.epoch,
            };
        }

        let now = self.output.current_time();
        state.scheduled.retain(|entry| entry.end_at > now);

        let start_at = state.cursor.max(now);
        let duration = chunk.duration_secs();
        let source = self.output.start_source(chunk, start_at);

        let end_at = start_at + duration;
        state.cursor = end_at;
        state.scheduled.push(ScheduledEntry { id: source, end_at });

        ScheduleOutcome::Scheduled {
            source,
            start_at,
            epoch: chunk_epoch,
        }
    }

    fn stop_all(&self, state: &mut PlaybackState) -> usize {
        let stopped = state.scheduled.len();
        for entry in state.scheduled.drain(..) {
            self.output.stop_source(entry.id);
        }
        state.cursor = 0.0;
        stopped
    }

    /// Barge-in: invalidate in-flight work and silence everything queued
    pub fn on_interrupted(&self) -> u64 {
        let mut state = self.lock();
        state.epoch += 1;
        let stopped = self.stop_all(&mut state);
        log::info!(
            "Playback: interrupted, epoch now {} ({} source(s) stopped)",
            state.epoch,
            stopped
        );
        state.epoch
    }

    /// Session end: stop everything and start over at epoch 0
    pub fn reset(&self) {
        let mut state = self.lock();
        self.stop_all(&mut state);
        state.epoch = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::Mixer;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn controller(rate: u32) -> (Arc<Mixer>, Arc<PlaybackController>) {
        let mixer = Mixer::shared(rate);
        let playback = Arc::new(PlaybackController::new(mixer.clone()));
        (mixer, playback)
    }

    fn ready(samples: usize, rate: u32) -> impl Future<Output = Result<AudioChunk, SessionError>> {
        let chunk = AudioChunk::new(vec![0.1; samples], rate);
        async move { Ok(chunk) }
    }

    #[tokio::test]
    async fn chunks_play_back_to_back() {
        let (_mixer, playback) = controller(1000);

        let mut starts = Vec::new();
        for _ in 0..5 {
            match playback.schedule_chunk(ready(100, 1000)).await {
                ScheduleOutcome::Scheduled { start_at, .. } => starts.push(start_at),
                other => panic!("unexpected {:?}", other),
            }
        }

        for (i, start) in starts.iter().enumerate() {
            assert!((start - i as f64 * 0.1).abs() < 1e-9, "chunk {} at {}", i, start);
        }
        assert!(starts.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(playback.scheduled_len(), 5);
    }

    #[tokio::test]
    async fn start_is_never_in_the_past() {
        let (mixer, playback) = controller(1000);

        playback.schedule_chunk(ready(100, 1000)).await;

        // Let the clock run past the cursor (underrun)
        let mut block = vec![0.0; 500];
        mixer.render(&mut block);

        match playback.schedule_chunk(ready(100, 1000)).await {
            ScheduleOutcome::Scheduled { start_at, .. } => {
                assert!((start_at - mixer.current_time()).abs() < 1e-9);
            }
            other => panic!("unexpected {:?}", other),
        }
        // The first source finished and was pruned
        assert_eq!(playback.scheduled_len(), 1);
    }

    #[tokio::test]
    async fn epoch_counts_interruptions() {
        let (_mixer, playback) = controller(1000);
        for _ in 0..7 {
            playback.schedule_chunk(ready(10, 1000)).await;
            playback.on_interrupted();
        }
        assert_eq!(playback.epoch(), 7);
        assert_eq!(playback.scheduled_len(), 0);
        assert_eq!(playback.cursor(), 0.0);
    }

    #[tokio::test]
    async fn interruption_stops_queued_sources() {
        let (mixer, playback) = controller(1000);
        playback.schedule_chunk(ready(100, 1000)).await;
        playback.schedule_chunk(ready(100, 1000)).await;
        assert_eq!(mixer.active_sources(), 2);

        playback.on_interrupted();

        assert_eq!(mixer.active_sources(), 0);
        let mut block = vec![0.0; 200];
        mixer.render(&mut block);
        assert!(block.iter().all(|&s| s == 0.0));
    }

    #[tokio::test]
    async fn delayed_decode_is_discarded_after_interruption() {
        let (mixer, playback) = controller(1000);
        let (release, gate) = oneshot::channel::<()>();

        let pending = playback.schedule_chunk(async move {
            let _ = gate.await;
            Ok(AudioChunk::new(vec![0.5; 100], 1000))
        });
        let task = tokio::spawn(pending);

        tokio::time::sleep(Duration::from_millis(5)).await;
        playback.on_interrupted();
        let _ = release.send(());

        let outcome = task.await.unwrap();
        assert_eq!(
            outcome,
            ScheduleOutcome::Discarded {
                chunk_epoch: 0,
                live_epoch: 1
            }
        );
        assert_eq!(mixer.active_sources(), 0);
        assert_eq!(playback.scheduled_len(), 0);
    }

    #[tokio::test]
    async fn epoch_captured_at_call_not_at_poll() {
        let (_mixer, playback) = controller(1000);

        // Created before the interruption, polled after
        let pending = playback.schedule_chunk(ready(10, 1000));
        playback.on_interrupted();

        assert!(matches!(
            pending.await,
            ScheduleOutcome::Discarded { .. }
        ));

        // Work started after the interruption schedules normally
        assert!(matches!(
            playback.schedule_chunk(ready(10, 1000)).await,
            ScheduleOutcome::Scheduled { epoch: 1, .. }
        ));
    }

    #[tokio::test]
    async fn decode_failure_is_dropped() {
        let (_mixer, playback) = controller(1000);
        let outcome = playback
            .schedule_chunk(async { Err(SessionError::MalformedAudio("odd".into())) })
            .await;
        assert!(matches!(outcome, ScheduleOutcome::Dropped(_)));
        assert_eq!(playback.cursor(), 0.0);
    }

    #[tokio::test]
    async fn reset_returns_to_epoch_zero() {
        let (mixer, playback) = controller(1000);
        playback.on_interrupted();
        playback.schedule_chunk(ready(100, 1000)).await;

        playback.reset();

        assert_eq!(playback.epoch(), 0);
        assert_eq!(playback.cursor(), 0.0);
        assert_eq!(mixer.active_sources(), 0);
    }
}
