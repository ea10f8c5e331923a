//! Encoder unit conversion and strain arithmetic.
//!
//! The crush actuator's encoder reports 0.006 mm of platen travel per count.
//! Conversions to counts round to the nearest count, so a round trip through
//! millimetres never drifts by more than one count.

/// Millimetres of platen travel per encoder count.
pub const MM_PER_COUNT: f64 = 6.0 / 1000.0;

/// Convert an encoder count delta to millimetres.
pub fn counts_to_mm(counts: i64) -> f64 {
    counts as f64 * MM_PER_COUNT
}

/// Convert millimetres to the nearest whole encoder count.
pub fn mm_to_counts(mm: f64) -> i64 {
    (mm / MM_PER_COUNT).round() as i64
}

/// Actuator setpoint that compresses a specimen of `height_mm` by `strain`,
/// measured from the count at which the platen touched the specimen.
pub fn strain_setpoint(contact_count: i64, height_mm: f64, strain: f64) -> i64 {
    contact_count + mm_to_counts(height_mm * strain)
}

/// Realized strain from the encoder position after a move.
pub fn realized_strain(position: i64, contact_count: i64, height_mm: f64) -> f64 {
    counts_to_mm((position - contact_count).abs()) / height_mm
}

/// Upper bound on the number of steps in one specimen trial.
pub const MAX_STRAIN_STEPS: usize = 10_000;

/// Number of targets in the schedule for `limit` and `delta`, without building
/// it. `None` when `delta` is not positive, `limit` is not a finite
/// non-negative strain, or the count exceeds [`MAX_STRAIN_STEPS`].
pub fn strain_step_count(limit: f64, delta: f64) -> Option<usize> {
    if !delta.is_finite() || delta <= 0.0 || !limit.is_finite() || limit < 0.0 {
        return None;
    }
    let last = (limit / delta).ceil();
    if !last.is_finite() || last >= MAX_STRAIN_STEPS as f64 {
        return None;
    }
    Some(last as usize + 1)
}

/// Target strains visited by a specimen trial.
///
/// Targets are `i * delta` for `i = 0..=ceil(limit / delta)`. The final target
/// meets or exceeds `limit` and may overshoot it by up to one delta; trials
/// have always been run this way, so the overshoot is kept. Empty when
/// [`strain_step_count`] rejects the pair.
pub fn strain_schedule(limit: f64, delta: f64) -> Vec<f64> {
    match strain_step_count(limit, delta) {
        Some(count) => (0..count).map(|i| i as f64 * delta).collect(),
        None => Vec::new(),
    }
}

/// Arithmetic mean of a sample set, `None` for an empty set.
pub fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<f64>() / samples.len() as f64)
}

/// Carousel stepper frequency (Hz) for `num_photos` photos per rotation.
///
/// The cameras do not fire at a steady rate, so the estimate is slowed by a
/// factor of three to make sure a full rotation covers the photo budget.
pub fn rotation_frequency(num_photos: u32, seconds_per_photo: f64, steps_per_rotation: u32) -> f64 {
    if num_photos == 0 || seconds_per_photo <= 0.0 || steps_per_rotation == 0 {
        return 0.0;
    }
    let period = f64::from(num_photos) * seconds_per_photo * (1.0 / f64::from(steps_per_rotation));
    (1.0 / period / 3.0).round()
}
