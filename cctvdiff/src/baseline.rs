//! # Adaptive difference baseline
//!
//! The difference statistics of a static scene are not zero: sensor noise, compression and
//! lighting drift all contribute. The baseline tracks what "normal" looks like for a source with
//! two exponential filters, a fast one following the current scene and a slow one forming the
//! floor the fast one has to rise above.

/// Filtered difference statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct Baseline {
    pub fast_avg: f64,
    pub fast_sd: f64,
    pub slow_avg: f64,
    pub slow_sd: f64,
}

/// Persisted per-source detector state.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct BaselineState {
    pub baseline: Baseline,
    /// Current sequence group, see [`SequenceTracker`](crate::detection::SequenceTracker).
    pub seqno: u32,
    /// Image number of the last saved frame.
    pub last_saved: u64,
}

/// Filter coefficients in `0..=1`.
///
/// Attack applies when a sample is at or above the filtered value, decay when it is below.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct BaselineCoefficients {
    pub fast_attack: f64,
    pub fast_decay: f64,
    pub slow_attack: f64,
    pub slow_decay: f64,
}

impl Default for BaselineCoefficients {
    fn default() -> Self {
        Self {
            fast_attack: 0.1,
            fast_decay: 0.05,
            slow_attack: 0.001,
            slow_decay: 0.01,
        }
    }
}

/// Dual-rate baseline filter.
pub struct BaselineTracker {
    baseline: Baseline,
    coefficients: BaselineCoefficients,
    avg_factor: f64,
    sd_factor: f64,
}

impl BaselineTracker {
    /// Create a new tracker.
    ///
    /// # Arguments
    ///
    /// * `baseline` - starting point, usually restored from the statistics store.
    /// * `coefficients` - filter rates.
    /// * `avg_factor` - weight of the slow average in the level computation.
    /// * `sd_factor` - weight of the slow standard deviation in the level computation.
    pub fn new(
        baseline: Baseline,
        coefficients: BaselineCoefficients,
        avg_factor: f64,
        sd_factor: f64,
    ) -> Self {
        Self {
            baseline,
            coefficients,
            avg_factor,
            sd_factor,
        }
    }

    /// Change filter rates and level weights, keeping the filtered state.
    pub fn reconfigure(
        &mut self,
        coefficients: BaselineCoefficients,
        avg_factor: f64,
        sd_factor: f64,
    ) {
        self.coefficients = coefficients;
        self.avg_factor = avg_factor;
        self.sd_factor = sd_factor;
    }

    pub fn baseline(&self) -> Baseline {
        self.baseline
    }

    /// Fold a new sample into both filters.
    ///
    /// After filtering the slow values are clamped to the fast ones, so a long bright event cannot
    /// leave the floor above the scene once it ends.
    pub fn update(&mut self, avg: f64, sd: f64) -> Baseline {
        let c = self.coefficients;
        let b = &mut self.baseline;

        interpolate(&mut b.fast_avg, avg, c.fast_attack, c.fast_decay);
        interpolate(&mut b.fast_sd, sd, c.fast_attack, c.fast_decay);
        interpolate(&mut b.slow_avg, avg, c.slow_attack, c.slow_decay);
        interpolate(&mut b.slow_sd, sd, c.slow_attack, c.slow_decay);

        b.slow_avg = b.slow_avg.min(b.fast_avg);
        b.slow_sd = b.slow_sd.min(b.fast_sd);

        *b
    }

    /// Value the fast average has to exceed before the level goes positive.
    pub fn floor(&self) -> f64 {
        self.avg_factor * self.baseline.slow_avg + self.sd_factor * self.baseline.slow_sd
    }

    /// Detection level of the current state.
    pub fn level(&self) -> f64 {
        self.baseline.fast_avg - self.floor()
    }
}

/// Move `value` towards `sample` by the attack or decay fraction of the distance.
pub fn interpolate(value: &mut f64, sample: f64, attack: f64, decay: f64) {
    let coeff = if sample >= *value { attack } else { decay };
    *value += (sample - *value) * coeff;
}
