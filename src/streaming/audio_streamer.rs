//! Outbound audio loop
//!
//! Single consumer of the capture graph's encoded frames. It owns the
//! sending half of the realtime session, so frames leave in capture order,
//! and it closes the session when the loop ends.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::RealtimeSession;
use crate::codec::PcmBlob;

/// Forward frames until cancelled or the capture side unwires; returns frames sent
pub async fn run_outbound(
    mut session: Box<dyn RealtimeSession>,
    mut rx: mpsc::Receiver<PcmBlob>,
    cancel: CancellationToken,
) -> u64 {
    log::info!("AudioStreamer: starting outbound loop");
    let mut sent = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            blob = rx.recv() => {
                let Some(blob) = blob else { break };
                if let Err(e) = session.send_audio(blob).await {
                    log::warn!("AudioStreamer: send failed, stopping outbound audio: {}", e);
                    break;
                }
                sent += 1;
                // Periodic logging (every 20 frames = ~5 seconds)
                if sent % 20 == 0 {
                    log::debug!("AudioStreamer: sent {} frames", sent);
                }
            }
        }
    }

    session.close().await;
    log::info!("AudioStreamer: outbound loop ended, {} frames sent", sent);
    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::error::SessionError;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Log {
        sent: Vec<PcmBlob>,
        closed: usize,
    }

    struct RecordingSession(Arc<Mutex<Log>>);

    #[async_trait]
    impl RealtimeSession for RecordingSession {
        async fn send_audio(&mut self, blob: PcmBlob) -> Result<(), SessionError> {
            self.0.lock().unwrap().sent.push(blob);
            Ok(())
        }

        async fn close(&mut self) {
            self.0.lock().unwrap().closed += 1;
        }
    }

    #[tokio::test]
    async fn frames_are_sent_in_order_and_session_closed() {
        let log = Arc::new(Mutex::new(Log::default()));
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let frames: Vec<_> = (0..3).map(|i| codec::encode(&[i as f32 * 0.1; 4])).collect();
        for frame in &frames {
            tx.send(frame.clone()).await.unwrap();
        }
        drop(tx);

        let sent = run_outbound(Box::new(RecordingSession(log.clone())), rx, cancel).await;

        assert_eq!(sent, 3);
        let log = log.lock().unwrap();
        assert_eq!(log.sent, frames);
        assert_eq!(log.closed, 1);
    }

    #[tokio::test]
    async fn cancellation_ends_loop() {
        let log = Arc::new(Mutex::new(Log::default()));
        let (_tx, rx) = mpsc::channel::<PcmBlob>(8);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_outbound(
            Box::new(RecordingSession(log.clone())),
            rx,
            cancel.clone(),
        ));
        cancel.cancel();

        assert_eq!(handle.await.unwrap(), 0);
        assert_eq!(log.lock().unwrap().closed, 1);
    }
}
