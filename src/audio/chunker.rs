//! Audio frame production from a live-stream URL.
//!
//! Launches the configured muxer binary asking for raw PCM16 mono at the
//! pipeline rate and slices its stdout into fixed-duration frames. Stream
//! hiccups are retried with exponential back-off; a run of consecutive
//! failures is terminal and surfaces to the session controller.

use crate::config::IngestConfig;
use crate::error::{LiveError, Result};
use crate::pipeline::messages::AudioFrame;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Consecutive start/read failures after which the chunker gives up.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;
/// Back-off schedule: start 1 s, double, cap 15 s.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(15);

/// Pulls PCM from the live URL via the muxer subprocess.
pub struct AudioChunker {
    config: IngestConfig,
    live_url: String,
    /// A restarted stream that keeps producing for this long counts as
    /// recovered and resets the consecutive-failure budget.
    healthy_after: Duration,
}

impl AudioChunker {
    pub fn new(config: &IngestConfig, live_url: &str, stream_restart_sec: f64) -> Self {
        Self {
            config: config.clone(),
            live_url: live_url.to_owned(),
            healthy_after: Duration::from_secs_f64(stream_restart_sec),
        }
    }

    /// Verify the muxer binary is present and executable.
    ///
    /// # Errors
    ///
    /// Returns `MuxerUnavailable` when the binary cannot be spawned.
    pub async fn probe(config: &IngestConfig) -> Result<()> {
        let output = Command::new(&config.muxer_bin)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| {
                LiveError::MuxerUnavailable(format!("{}: {e}", config.muxer_bin))
            })?;
        if !output.success() {
            return Err(LiveError::MuxerUnavailable(format!(
                "{} exited with {output}",
                config.muxer_bin
            )));
        }
        Ok(())
    }

    /// Run the frame production loop until cancellation or terminal failure.
    ///
    /// Frames carry a monotonic `seq` that survives muxer restarts, so
    /// `captured_at = seq * chunk_sec` stays consistent for the session.
    ///
    /// # Errors
    ///
    /// Returns an error after `MAX_CONSECUTIVE_FAILURES` restarts in a row.
    pub async fn run(
        &self,
        tx: mpsc::Sender<AudioFrame>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let frame_samples =
            (f64::from(self.config.sample_rate) * self.config.chunk_sec).round() as usize;
        let frame_bytes = frame_samples * 2;
        let mut seq: u64 = 0;
        let mut failures: u32 = 0;
        let mut backoff = BACKOFF_INITIAL;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let mut child = match self.spawn_muxer() {
                Ok(child) => child,
                Err(e) => {
                    failures += 1;
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        return Err(e);
                    }
                    warn!("muxer spawn failed ({failures}/{MAX_CONSECUTIVE_FAILURES}): {e}");
                    tokio::select! {
                        () = cancel.cancelled() => return Ok(()),
                        () = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                    continue;
                }
            };

            let mut stdout = child
                .stdout
                .take()
                .ok_or_else(|| LiveError::Audio("muxer stdout not captured".to_owned()))?;

            info!(url = %self.live_url, "muxer started");
            let started = tokio::time::Instant::now();
            let mut buf = vec![0u8; frame_bytes];

            let read_error: Option<String> = loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        let _ = child.start_kill();
                        return Ok(());
                    }
                    read = stdout.read_exact(&mut buf) => match read {
                        Ok(_) => {
                            let pcm: Vec<i16> = buf
                                .chunks_exact(2)
                                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                                .collect();
                            let rms = AudioFrame::compute_rms(&pcm);
                            let frame = AudioFrame {
                                seq,
                                pcm,
                                captured_at: seq as f64 * self.config.chunk_sec,
                                rms,
                            };
                            seq += 1;
                            if started.elapsed() >= self.healthy_after {
                                failures = 0;
                                backoff = BACKOFF_INITIAL;
                            }
                            if tx.send(frame).await.is_err() {
                                let _ = child.start_kill();
                                return Ok(());
                            }
                        }
                        // Partial trailing frames are discarded with the stream.
                        Err(e) => break Some(e.to_string()),
                    }
                }
            };

            let _ = child.start_kill();
            failures += 1;
            let reason = read_error.unwrap_or_else(|| "stream ended".to_owned());
            if failures >= MAX_CONSECUTIVE_FAILURES {
                return Err(LiveError::Audio(format!(
                    "muxer stream failed {failures} times in a row: {reason}"
                )));
            }
            warn!("muxer stream interrupted ({failures}/{MAX_CONSECUTIVE_FAILURES}): {reason}");
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }

    fn spawn_muxer(&self) -> Result<Child> {
        Command::new(&self.config.muxer_bin)
            .arg("-loglevel")
            .arg("quiet")
            .arg("-i")
            .arg(&self.live_url)
            .arg("-f")
            .arg("s16le")
            .arg("-ac")
            .arg("1")
            .arg("-ar")
            .arg(self.config.sample_rate.to_string())
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LiveError::MuxerUnavailable(format!("{}: {e}", self.config.muxer_bin)))
    }
}
