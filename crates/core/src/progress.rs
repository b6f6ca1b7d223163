//! Progress arithmetic shared by the monitor and the status stream.
//!
//! Nodes report progress in several units (fractions, percentages,
//! sampler steps). Everything is converted to a whole percentage and
//! clamped into the display range before it is stored or published.

/// Lowest percentage ever displayed once generation has started.
///
/// A job sitting at 0% looks frozen, so the floor is 1.
pub const MIN_DISPLAY_PERCENT: i16 = 1;

/// Highest percentage; only genuine completion may report it.
pub const MAX_PERCENT: i16 = 100;

/// Upper bound for synthesized liveness progress. Always below
/// [`MAX_PERCENT`].
pub const LIVENESS_CAP: i16 = 95;

/// Clamp a raw percentage into `MIN_DISPLAY_PERCENT..=MAX_PERCENT`.
///
/// Non-finite input maps to the floor.
pub fn clamp_display_percent(raw: f64) -> i16 {
    if !raw.is_finite() {
        return MIN_DISPLAY_PERCENT;
    }
    (raw.round() as i64).clamp(MIN_DISPLAY_PERCENT as i64, MAX_PERCENT as i64) as i16
}

/// Convert a `step` of `total` pair into a percentage.
///
/// Returns `None` when `total` is not positive.
pub fn step_percent(step: f64, total: f64) -> Option<f64> {
    if total > 0.0 && step.is_finite() {
        Some(step / total * 100.0)
    } else {
        None
    }
}

/// Convert a `0.0..=1.0` fraction into a percentage.
pub fn fraction_percent(fraction: f64) -> Option<f64> {
    if fraction.is_finite() && (0.0..=1.0).contains(&fraction) {
        Some(fraction * 100.0)
    } else {
        None
    }
}

/// Whether `new` is worth storing given the last stored value.
pub fn is_informative(previous: i16, new: i16) -> bool {
    new > previous
}

/// Next synthesized liveness value, or `None` when `current` already
/// sits at or above `cap`.
///
/// The cap is itself clamped to [`LIVENESS_CAP`] so a synthesized value
/// can never reach 100%.
pub fn liveness_increment(current: i16, step: i16, cap: i16) -> Option<i16> {
    let cap = cap.min(LIVENESS_CAP);
    if current >= cap {
        return None;
    }
    Some((current.max(MIN_DISPLAY_PERCENT) + step.max(1)).min(cap))
}
