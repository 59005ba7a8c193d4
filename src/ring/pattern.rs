//! Ring patterns: scheduling tones into single/double/triple chimes and
//! the continuous phone ring.
//!
//! A ring session is one spawned task driven by the tokio clock and a
//! `CancellationToken`. The engine owns at most one session; starting a
//! new one stops whatever was playing (last writer wins, nothing queues).
//! Stopping is synchronous: the flag flips, the token fires, and the task
//! is aborted before `stop` returns, so no further tone can start.

use super::{RingPattern, ToneSpec};
use crate::ring::tone::ToneSink;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing as log;

/// Gap between continuous-ring tones.
const CONTINUOUS_GAP_SECS: f32 = 0.1;

/// Repeat options for non-continuous patterns. Continuous ignores both.
#[derive(Debug, Clone, Copy)]
pub struct PatternOpts {
    /// Silence between pattern repetitions, in seconds.
    pub interval_secs: f32,
    /// Total times the pattern plays before the session ends itself.
    pub max_repeats: u32,
}

impl Default for PatternOpts {
    fn default() -> Self {
        PatternOpts {
            interval_secs: 2.0,
            max_repeats: 1,
        }
    }
}

struct SessionState {
    pattern: RingPattern,
    ringing: AtomicBool,
    tones: AtomicU32,
    repeats: AtomicU32,
}

struct Session {
    state: Arc<SessionState>,
    cancel: CancellationToken,
    abort: AbortHandle,
}

impl Session {
    fn halt(&self) {
        self.state.ringing.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        self.abort.abort();
    }
}

/// Live view of a ring session. Cheap to clone around; `stop` from any
/// clone (or from the engine) ends the same session.
#[derive(Clone)]
pub struct RingHandle {
    state: Arc<SessionState>,
    cancel: CancellationToken,
    abort: AbortHandle,
}

impl RingHandle {
    /// End the session. Idempotent; no tone starts after this returns.
    pub fn stop(&self) {
        self.state.ringing.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        self.abort.abort();
    }

    pub fn is_ringing(&self) -> bool {
        self.state.ringing.load(Ordering::SeqCst)
    }

    /// Tones handed to the sink so far.
    pub fn ring_count(&self) -> u32 {
        self.state.tones.load(Ordering::Relaxed)
    }

    /// Completed pattern repetitions.
    pub fn repeat_count(&self) -> u32 {
        self.state.repeats.load(Ordering::Relaxed)
    }

    pub fn pattern(&self) -> RingPattern {
        self.state.pattern
    }
}

/// Snapshot for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RingStatus {
    pub ringing: bool,
    pub pattern: Option<RingPattern>,
    pub tones_played: u32,
    pub repetitions: u32,
}

/// The process-wide ring engine: one session at a time.
pub struct RingEngine {
    sink: Arc<dyn ToneSink>,
    session: Mutex<Option<Session>>,
}

impl RingEngine {
    pub fn new(sink: Arc<dyn ToneSink>) -> RingEngine {
        RingEngine {
            sink,
            session: Mutex::new(None),
        }
    }

    /// Start a session, stopping any current one first.
    pub fn start(&self, pattern: RingPattern, tone: ToneSpec, opts: PatternOpts) -> RingHandle {
        let mut slot = self.session.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slot.take() {
            if old.state.ringing.load(Ordering::SeqCst) {
                log::debug!("replacing active {} ring", old.state.pattern);
            }
            old.halt();
        }

        let state = Arc::new(SessionState {
            pattern,
            ringing: AtomicBool::new(true),
            tones: AtomicU32::new(0),
            repeats: AtomicU32::new(0),
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_session(
            Arc::clone(&self.sink),
            pattern,
            tone,
            opts,
            Arc::clone(&state),
            cancel.clone(),
        ));
        let abort = task.abort_handle();
        log::info!("started {pattern} ring at {:.0} Hz", tone.frequency);

        *slot = Some(Session {
            state: Arc::clone(&state),
            cancel: cancel.clone(),
            abort: abort.clone(),
        });
        RingHandle {
            state,
            cancel,
            abort,
        }
    }

    /// Stop the current session if any. Safe to call when idle.
    pub fn stop(&self) {
        let slot = self.session.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = slot.as_ref() {
            if session.state.ringing.load(Ordering::SeqCst) {
                log::info!("ring stopped");
            }
            session.halt();
        }
    }

    pub fn is_ringing(&self) -> bool {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|s| s.state.ringing.load(Ordering::SeqCst))
    }

    /// Tones played by the current (or most recent) session.
    pub fn ring_count(&self) -> u32 {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(0, |s| s.state.tones.load(Ordering::Relaxed))
    }

    pub fn status(&self) -> RingStatus {
        let slot = self.session.lock().unwrap_or_else(|e| e.into_inner());
        match slot.as_ref() {
            Some(session) => RingStatus {
                ringing: session.state.ringing.load(Ordering::SeqCst),
                pattern: Some(session.state.pattern),
                tones_played: session.state.tones.load(Ordering::Relaxed),
                repetitions: session.state.repeats.load(Ordering::Relaxed),
            },
            None => RingStatus {
                ringing: false,
                pattern: None,
                tones_played: 0,
                repetitions: 0,
            },
        }
    }
}

/// Sleep, ending early on cancellation. Returns true when cancelled.
async fn pause(cancel: &CancellationToken, secs: f32) -> bool {
    if secs <= 0.0 {
        return cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(Duration::from_secs_f32(secs)) => false,
    }
}

async fn run_session(
    sink: Arc<dyn ToneSink>,
    pattern: RingPattern,
    tone: ToneSpec,
    opts: PatternOpts,
    state: Arc<SessionState>,
    cancel: CancellationToken,
) {
    if let RingPattern::Continuous = pattern {
        loop {
            sink.play(&tone);
            state.tones.fetch_add(1, Ordering::Relaxed);
            if pause(&cancel, tone.duration_secs + CONTINUOUS_GAP_SECS).await {
                return;
            }
            state.repeats.fetch_add(1, Ordering::Relaxed);
        }
    }

    let repeats = opts.max_repeats.max(1);
    for repetition in 0..repeats {
        if repetition > 0 && pause(&cancel, opts.interval_secs).await {
            return;
        }
        if play_pattern(&*sink, pattern, &tone, &state, &cancel).await {
            return;
        }
        state.repeats.fetch_add(1, Ordering::Relaxed);
    }
    state.ringing.store(false, Ordering::SeqCst);
    log::debug!(
        "{pattern} ring finished after {} tone(s)",
        state.tones.load(Ordering::Relaxed)
    );
}

/// Play one repetition of a non-continuous pattern, tones at their fixed
/// offsets, ending when the last tone has rung out. True when cancelled.
async fn play_pattern(
    sink: &dyn ToneSink,
    pattern: RingPattern,
    tone: &ToneSpec,
    state: &SessionState,
    cancel: &CancellationToken,
) -> bool {
    let d = tone.duration_secs;
    let (tone_secs, offsets): (f32, &[f32]) = match pattern {
        RingPattern::Single => (d, &[0.0]),
        RingPattern::Double => (0.4 * d, &[0.0, 0.6 * d]),
        RingPattern::Triple => (0.3 * d, &[0.0, 0.4 * d, 0.8 * d]),
        // Handled in run_session.
        RingPattern::Continuous => (d, &[0.0]),
    };

    let mut elapsed = 0.0;
    for &offset in offsets {
        if pause(cancel, offset - elapsed).await {
            return true;
        }
        elapsed = offset;
        sink.play(&ToneSpec {
            frequency: tone.frequency,
            duration_secs: tone_secs,
            volume: tone.volume,
        });
        state.tones.fetch_add(1, Ordering::Relaxed);
    }
    pause(cancel, tone_secs).await
}
