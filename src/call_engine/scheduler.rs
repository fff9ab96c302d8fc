//! Frame Scheduler
//!
//! Liefert Audio-Frames im festen Takt an den Transport. Der Takt ergibt
//! sich aus Frame-Größe und Ziel-Rate (`StreamConfig::frame_duration`).
//! Der Playback-Cursor rückt pro Tick um `frame_sample_count * playback_speed`
//! vor, unabhängig davon, wie viel Zeit tatsächlich vergangen ist.

use super::frame::AudioFrame;
use super::transport::FrameSink;
use crate::config::StreamConfig;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("A frame scheduler is already running for this session")]
    AlreadyRunning,
}

// ============================================================================
// EVENTS
// ============================================================================

/// Meldungen des Schedulers an seine Session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// Quelle vollständig ausgeliefert
    Finished { frames: u64, dropped: u64 },
    /// Zu viele Zustellfehler in Folge, Stream abgebrochen
    Failed { consecutive_failures: u32 },
}

/// Ergebnis eines einzelnen Ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Delivered,
    /// Frame verworfen, Cursor ist trotzdem weitergelaufen
    Dropped { consecutive_failures: u32 },
    Finished,
    Failed { consecutive_failures: u32 },
}

// ============================================================================
// PLAYBACK CURSOR
// ============================================================================

/// Position in der vorbereiteten Quelle, in Source-Samples
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlaybackCursor {
    position: f64,
}

impl PlaybackCursor {
    /// Ganzzahliger Start-Index des nächsten Frames
    pub fn index(&self) -> usize {
        self.position.floor() as usize
    }

    pub fn advance(&mut self, samples: f64) {
        self.position += samples;
    }

    pub fn reset(&mut self) {
        self.position = 0.0;
    }
}

// ============================================================================
// FRAME PUMP
// ============================================================================

/// Zustand eines laufenden Streams: Cursor, Frame-Zähler, Fehlerzähler
pub struct FramePump {
    samples: Arc<[i16]>,
    config: StreamConfig,
    cursor: PlaybackCursor,
    frame_index: u64,
    finished: bool,
    consecutive_failures: u32,
    dropped: u64,
}

impl FramePump {
    /// `samples` ist bereits gemischt, resampled und geformt
    pub fn new(samples: Arc<[i16]>, config: StreamConfig) -> Self {
        Self {
            samples,
            config,
            cursor: PlaybackCursor::default(),
            frame_index: 0,
            finished: false,
            consecutive_failures: 0,
            dropped: 0,
        }
    }

    pub fn cursor(&self) -> PlaybackCursor {
        self.cursor
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frame_index
    }

    pub fn frames_dropped(&self) -> u64 {
        self.dropped
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Schneidet den nächsten Frame aus der Quelle.
    ///
    /// Läuft der Frame über das Ende hinaus, wird er mit Nullen aufgefüllt
    /// und der Stream endet danach (oder springt mit `loop_playback` an den
    /// Anfang zurück).
    pub fn next_frame(&mut self) -> Option<AudioFrame> {
        if self.finished {
            return None;
        }

        let len = self.samples.len();
        let frame_len = self.config.frame_sample_count;

        let mut start = self.cursor.index();
        if start >= len {
            if self.config.loop_playback && len > 0 {
                self.cursor.reset();
                start = 0;
            } else {
                self.finished = true;
                return None;
            }
        }

        let end = start + frame_len;
        let available = end.min(len) - start;

        let mut samples = vec![0i16; frame_len];
        samples[..available].copy_from_slice(&self.samples[start..start + available]);

        let frame = AudioFrame {
            samples,
            sample_rate: self.config.target_sample_rate,
            channel_count: 1,
            timestamp_millis: self.config.frame_timestamp_millis(self.frame_index),
        };
        self.frame_index += 1;

        if end > len {
            if self.config.loop_playback {
                self.cursor.reset();
            } else {
                self.finished = true;
            }
        } else {
            self.cursor
                .advance(frame_len as f64 * self.config.playback_speed);
        }

        Some(frame)
    }

    /// Ein Tick: nächsten Frame schneiden und zustellen
    pub async fn tick<S: FrameSink + ?Sized>(&mut self, sink: &S) -> TickOutcome {
        let Some(frame) = self.next_frame() else {
            return TickOutcome::Finished;
        };

        match sink.push_audio_frame(&frame).await {
            Ok(()) => {
                self.consecutive_failures = 0;
                TickOutcome::Delivered
            }
            Err(e) => {
                self.consecutive_failures += 1;
                self.dropped += 1;
                tracing::warn!(
                    "Dropped audio frame at {}ms ({} in a row): {}",
                    frame.timestamp_millis,
                    self.consecutive_failures,
                    e
                );
                if self.consecutive_failures >= self.config.max_consecutive_failures {
                    TickOutcome::Failed {
                        consecutive_failures: self.consecutive_failures,
                    }
                } else {
                    TickOutcome::Dropped {
                        consecutive_failures: self.consecutive_failures,
                    }
                }
            }
        }
    }
}

// ============================================================================
// FRAME SCHEDULER
// ============================================================================

/// Treibt eine FramePump periodisch an. Höchstens ein Task pro Scheduler.
#[derive(Default)]
pub struct FrameScheduler {
    task: Option<JoinHandle<()>>,
}

impl FrameScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Startet den periodischen Task
    pub fn start<S>(
        &mut self,
        pump: FramePump,
        sink: Arc<S>,
        events: mpsc::UnboundedSender<SchedulerEvent>,
    ) -> Result<(), SchedulerError>
    where
        S: FrameSink + ?Sized + 'static,
    {
        if self.is_running() {
            return Err(SchedulerError::AlreadyRunning);
        }

        tracing::info!(
            "Starting frame scheduler: {} samples every {:?}",
            pump.config.frame_sample_count,
            pump.config.frame_duration()
        );

        self.task = Some(tokio::spawn(Self::run(pump, sink, events)));
        Ok(())
    }

    /// Stoppt den Task und wartet, bis er wirklich beendet ist.
    /// Danach wird kein Frame mehr zugestellt. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
            tracing::info!("Frame scheduler stopped");
        }
    }

    async fn run<S>(
        mut pump: FramePump,
        sink: Arc<S>,
        events: mpsc::UnboundedSender<SchedulerEvent>,
    ) where
        S: FrameSink + ?Sized,
    {
        let mut interval = tokio::time::interval(pump.config.frame_duration());
        interval.set_missed_tick_behavior(MissedTickBehavior::Burst);

        loop {
            interval.tick().await;

            let event = match pump.tick(sink.as_ref()).await {
                TickOutcome::Delivered | TickOutcome::Dropped { .. } => {
                    if !pump.is_finished() {
                        continue;
                    }
                    SchedulerEvent::Finished {
                        frames: pump.frames_emitted(),
                        dropped: pump.frames_dropped(),
                    }
                }
                TickOutcome::Finished => SchedulerEvent::Finished {
                    frames: pump.frames_emitted(),
                    dropped: pump.frames_dropped(),
                },
                TickOutcome::Failed {
                    consecutive_failures,
                } => SchedulerEvent::Failed {
                    consecutive_failures,
                },
            };

            tracing::info!("Frame scheduler done: {:?}", event);
            let _ = events.send(event);
            break;
        }
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
