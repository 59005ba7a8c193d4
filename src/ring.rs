//! Audible alerts: tone synthesis and ring patterns.
//!
//! [`tone`] turns a [`ToneSpec`] into PCM and plays it on the host audio
//! device; [`pattern`] schedules tones into ring patterns and owns the
//! process-wide ring session.

pub mod pattern;
pub mod tone;

use crate::notifications::NotificationType;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One sine tone: pitch, length, loudness.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneSpec {
    pub frequency: f32,
    pub duration_secs: f32,
    /// 0.0 to 1.0.
    pub volume: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RingPattern {
    Single,
    Double,
    Triple,
    /// Rings until stopped; repeat options do not apply.
    Continuous,
}

impl fmt::Display for RingPattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            RingPattern::Single => "single",
            RingPattern::Double => "double",
            RingPattern::Triple => "triple",
            RingPattern::Continuous => "continuous",
        })
    }
}

impl std::str::FromStr for RingPattern {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<RingPattern> {
        Ok(match s {
            "single" => RingPattern::Single,
            "double" => RingPattern::Double,
            "triple" => RingPattern::Triple,
            "continuous" => RingPattern::Continuous,
            other => anyhow::bail!("unknown ring pattern `{other}`"),
        })
    }
}

/// The per-type alert sound: which pattern to play and with what tone.
pub fn alert_sound(ty: NotificationType) -> (RingPattern, ToneSpec) {
    let (pattern, frequency, duration_secs, volume) = match ty {
        NotificationType::OrderCreated => (RingPattern::Triple, 800.0, 0.5, 0.7),
        NotificationType::OrderPaid => (RingPattern::Double, 1000.0, 0.3, 0.8),
        NotificationType::OrderUpdated => (RingPattern::Single, 600.0, 0.2, 0.5),
        NotificationType::OrderCancelled => (RingPattern::Single, 400.0, 0.8, 0.6),
        NotificationType::PaymentFailed => (RingPattern::Continuous, 300.0, 1.0, 0.7),
        NotificationType::PaymentCompleted => (RingPattern::Single, 1200.0, 0.4, 0.8),
    };
    (
        pattern,
        ToneSpec {
            frequency,
            duration_secs,
            volume,
        },
    )
}
