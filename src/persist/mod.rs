//! Session artifact persistence.
//!
//! Three append-only sinks under `<root>/<room_id>/<YYYY-MM-DD>/`:
//! `transcripts.jsonl`, `events.jsonl`, and per-segment WAV files when
//! audio saving is on. Persistence never interrupts the pipeline — every
//! failure is logged, counted, and swallowed.

use crate::config::PersistConfig;
use crate::pipeline::messages::{ChatEvent, SpeechSegment, Transcript};
use crate::session::status::SessionMetrics;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

/// Append-only JSONL + WAV artifact writer for one session.
pub struct ArtifactPersister {
    enabled: bool,
    save_audio: bool,
    dir: PathBuf,
    transcripts: Option<BufWriter<File>>,
    events: Option<BufWriter<File>>,
    metrics: Arc<SessionMetrics>,
}

impl ArtifactPersister {
    /// Open the sinks for today's date directory. Failures disable the
    /// affected sink and count against `persist.failed`; they never error.
    pub fn open(config: &PersistConfig, room_id: &str, metrics: Arc<SessionMetrics>) -> Self {
        let date = chrono::Local::now().format("%Y-%m-%d").to_string();
        let dir = config.root.join(room_id).join(date);

        if !config.enabled {
            return Self {
                enabled: false,
                save_audio: false,
                dir,
                transcripts: None,
                events: None,
                metrics,
            };
        }

        let mut failed = false;
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), "cannot create artifact directory: {e}");
            failed = true;
        }
        if config.save_audio && !failed {
            if let Err(e) = std::fs::create_dir_all(dir.join("segments")) {
                warn!(dir = %dir.display(), "cannot create segments directory: {e}");
            }
        }

        let transcripts = if failed {
            None
        } else {
            open_append(&dir.join("transcripts.jsonl"), &metrics)
        };
        let events = if failed {
            None
        } else {
            open_append(&dir.join("events.jsonl"), &metrics)
        };
        if failed {
            let _ = metrics.persist_failed.fetch_add(1, Ordering::Relaxed);
        } else {
            info!(dir = %dir.display(), "artifact sinks open");
        }

        Self {
            enabled: true,
            save_audio: config.save_audio,
            dir,
            transcripts,
            events,
            metrics,
        }
    }

    /// Directory artifacts are written into.
    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    pub fn append_transcript(&mut self, transcript: &Transcript) {
        if !self.enabled {
            return;
        }
        let line = match serde_json::to_string(transcript) {
            Ok(line) => line,
            Err(e) => {
                self.count_failure(&format!("transcript serialize: {e}"));
                return;
            }
        };
        let failure = match self.transcripts.as_mut() {
            Some(writer) => writeln!(writer, "{line}").err().map(|e| e.to_string()),
            None => Some("transcript sink closed".to_owned()),
        };
        if let Some(e) = failure {
            self.count_failure(&e);
        }
    }

    pub fn append_event(&mut self, event: &ChatEvent) {
        if !self.enabled {
            return;
        }
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                self.count_failure(&format!("event serialize: {e}"));
                return;
            }
        };
        let failure = match self.events.as_mut() {
            Some(writer) => writeln!(writer, "{line}").err().map(|e| e.to_string()),
            None => Some("event sink closed".to_owned()),
        };
        if let Some(e) = failure {
            self.count_failure(&e);
        }
    }

    /// Write one segment's PCM as a WAV file when audio saving is on.
    pub fn save_segment(&mut self, segment: &SpeechSegment) {
        if !self.enabled || !self.save_audio {
            return;
        }
        let path = self
            .dir
            .join("segments")
            .join(format!("{}.wav", segment.segment_id));
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let result = (|| -> Result<(), hound::Error> {
            let mut writer = hound::WavWriter::create(&path, spec)?;
            for &sample in &segment.pcm {
                writer.write_sample(sample)?;
            }
            writer.finalize()
        })();
        if let Err(e) = result {
            self.count_failure(&format!("segment wav: {e}"));
        }
    }

    /// Flush buffers and fsync; called on the flush interval and at stop.
    pub fn flush(&mut self) {
        let mut failures = Vec::new();
        for writer in [self.transcripts.as_mut(), self.events.as_mut()]
            .into_iter()
            .flatten()
        {
            let failure = writer
                .flush()
                .and_then(|()| writer.get_ref().sync_data())
                .err()
                .map(|e| e.to_string());
            if let Some(e) = failure {
                failures.push(e);
            }
        }
        for e in failures {
            self.count_failure(&e);
        }
    }

    fn count_failure(&self, reason: &str) {
        let _ = self.metrics.persist_failed.fetch_add(1, Ordering::Relaxed);
        warn!("persist failure: {reason}");
    }
}

fn open_append(path: &PathBuf, metrics: &SessionMetrics) -> Option<BufWriter<File>> {
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(BufWriter::new(file)),
        Err(e) => {
            warn!(path = %path.display(), "cannot open sink: {e}");
            let _ = metrics.persist_failed.fetch_add(1, Ordering::Relaxed);
            None
        }
    }
}
