//! Sine tone synthesis and the audio device behind it.
//!
//! Synthesis is a pure function over a [`ToneSpec`]; playback goes through
//! the [`ToneSink`] trait so the pattern engine can be tested without a
//! sound card. The real sink, [`Speaker`], owns a dedicated audio thread
//! holding the rodio output stream; tones are handed over through a
//! channel, so callers never block on the device.

use super::ToneSpec;
use rodio::buffer::SamplesBuffer;
use std::sync::mpsc;
use std::sync::{Arc, LazyLock, Mutex};
use tracing as log;

pub const SAMPLE_RATE: u32 = 44_100;
/// Linear attack length. Keeps the tone from clicking at onset.
const ATTACK_SECS: f32 = 0.010;
/// Amplitude is decayed to 1/1000 of the target volume at the tone's end.
const DECAY_FLOOR: f32 = 1000.0;

/// Where tones go. Implementations must not block the caller.
pub trait ToneSink: Send + Sync {
    fn play(&self, spec: &ToneSpec);
}

/// Render a tone to mono f32 PCM at [`SAMPLE_RATE`].
///
/// The envelope ramps linearly to `volume` over the first ~10 ms, then
/// decays exponentially to near-silence at `duration_secs`.
pub fn synthesize(spec: &ToneSpec) -> Vec<f32> {
    let duration = spec.duration_secs.max(0.0);
    let samples = (duration * SAMPLE_RATE as f32).ceil() as usize;
    let attack = ATTACK_SECS.min(duration / 2.0);
    let decay_secs = (duration - attack).max(f32::EPSILON);
    let decay_rate = DECAY_FLOOR.ln() / decay_secs;

    let mut pcm = Vec::with_capacity(samples);
    for i in 0..samples {
        let t = i as f32 / SAMPLE_RATE as f32;
        let envelope = if t < attack {
            spec.volume * (t / attack)
        } else {
            spec.volume * (-decay_rate * (t - attack)).exp()
        };
        let phase = 2.0 * std::f32::consts::PI * spec.frequency * t;
        pcm.push(envelope * phase.sin());
    }
    pcm
}

/// The host audio device, behind a lazily spawned thread.
///
/// The thread is started on the first tone and reused. If it has died in
/// the meantime (output device unplugged, server suspend), the next play
/// makes one respawn attempt; if that fails too, the tone is dropped with
/// an error log. Silence is never worth crashing the daemon for.
pub struct Speaker {
    sender: Mutex<Option<mpsc::Sender<ToneSpec>>>,
}

static SHARED: LazyLock<Arc<Speaker>> = LazyLock::new(|| Arc::new(Speaker::new()));

impl Speaker {
    pub fn new() -> Speaker {
        Speaker {
            sender: Mutex::new(None),
        }
    }

    /// The process-wide speaker. All callers share one audio thread.
    pub fn shared() -> Arc<Speaker> {
        SHARED.clone()
    }

    fn spawn_audio_thread() -> Option<mpsc::Sender<ToneSpec>> {
        let (tx, rx) = mpsc::channel();
        let spawned = std::thread::Builder::new()
            .name("orderbell-audio".into())
            .spawn(move || audio_thread(rx));
        match spawned {
            Ok(_) => Some(tx),
            Err(err) => {
                log::error!("failed to spawn audio thread: {err}");
                None
            }
        }
    }
}

impl Default for Speaker {
    fn default() -> Self {
        Speaker::new()
    }
}

impl ToneSink for Speaker {
    fn play(&self, spec: &ToneSpec) {
        let mut sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        if sender.is_none() {
            *sender = Self::spawn_audio_thread();
        }
        let Some(tx) = sender.as_ref() else { return };
        if tx.send(*spec).is_ok() {
            return;
        }
        log::warn!("audio thread gone, respawning");
        *sender = Self::spawn_audio_thread();
        if let Some(tx) = sender.as_ref() {
            if tx.send(*spec).is_err() {
                log::error!("audio output unavailable, dropping tone");
                *sender = None;
            }
        }
    }
}

fn audio_thread(rx: mpsc::Receiver<ToneSpec>) {
    let (stream, handle) = match rodio::OutputStream::try_default() {
        Ok(out) => out,
        Err(err) => {
            log::error!("no audio output device: {err}");
            return;
        }
    };
    let sink = match rodio::Sink::try_new(&handle) {
        Ok(sink) => sink,
        Err(err) => {
            log::error!("failed to open audio sink: {err}");
            return;
        }
    };
    // The stream must outlive every tone we queue.
    let _keep_alive = stream;
    log::debug!("audio thread up");
    while let Ok(spec) = rx.recv() {
        log::trace!(
            "playing {:.0} Hz for {:.2}s at volume {:.2}",
            spec.frequency,
            spec.duration_secs,
            spec.volume
        );
        sink.append(SamplesBuffer::new(1, SAMPLE_RATE, synthesize(&spec)));
    }
    log::debug!("audio thread exiting");
}

/// Play one tone on the shared speaker. Fire-and-forget: returns
/// immediately, failures are logged by the speaker.
pub fn play_tone(frequency: f32, duration_secs: f32, volume: f32) {
    Speaker::shared().play(&ToneSpec {
        frequency,
        duration_secs,
        volume,
    });
}
