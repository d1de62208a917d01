use serde::{Deserialize, Serialize};

use crate::job::JobKind;

/// Allowed drift between input and output duration for rate-conversion.
///
/// Frame interpolation preserves wall-clock duration by construction, so any
/// drift beyond this is an engine-level defect worth surfacing.
pub const DURATION_TOLERANCE: f64 = 0.1;

/// Outcome of comparing input and output durations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationCheck {
    /// output - input, in seconds (signed)
    pub delta: f64,
    pub is_valid: bool,
    pub message: String,
}

/// Compare durations against a tolerance in seconds
pub fn validate_duration(input: f64, output: f64, tolerance: f64) -> DurationCheck {
    let delta = output - input;
    let is_valid = delta.abs() <= tolerance;
    let message = if is_valid {
        format!("duration delta {:+.3}s within {:.1}s tolerance", delta, tolerance)
    } else {
        format!("duration delta {:+.3}s exceeds {:.1}s tolerance", delta, tolerance)
    };
    DurationCheck { delta, is_valid, message }
}

/// Duration tolerance policy per job kind.
///
/// Only rate-conversion carries the preservation guarantee; for the other
/// kinds drift is not semantically meaningful and no check applies.
pub fn tolerance_for(kind: &JobKind) -> Option<f64> {
    match kind {
        JobKind::RateConvert { .. } => Some(DURATION_TOLERANCE),
        JobKind::Upscale { .. } | JobKind::Compress { .. } | JobKind::PadAudio { .. } => None,
    }
}

/// Apply the per-kind policy. Unchecked kinds report the delta but always
/// validate; a failed check is a warning on a completed job, never a failure.
pub fn check_for_kind(kind: &JobKind, input: f64, output: f64) -> DurationCheck {
    if let Some(tolerance) = tolerance_for(kind) {
        return validate_duration(input, output, tolerance);
    }
    let delta = output - input;
    let message = match kind {
        JobKind::PadAudio { pad_before, pad_after, .. } => format!(
            "padded {:.3}s -> {:.3}s ({:+.3}s added, {:.1}s requested)",
            input,
            output,
            delta,
            pad_before + pad_after
        ),
        _ => format!("duration check not applied ({:+.3}s delta)", delta),
    };
    DurationCheck { delta, is_valid: true, message }
}
