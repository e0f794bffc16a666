//! Variable-interval exponential smoothing for irregular sensor samples.
//!
//! Sensor conversions arrive whenever the hardware finishes them (I2C
//! conversion-done events, flow pulse periods), so the blend factor is
//! recomputed per sample as `a = exp(-dt / tau)` instead of using a fixed
//! coefficient. NaN is the "no value yet" sentinel: a freshly created
//! filter reports NaN for both the level and the rate, and a NaN raw
//! sample (sensor dropout) naturally poisons both again through IEEE
//! arithmetic, so every consumer sees the stagnation without a separate
//! flag.

#[derive(Debug, Clone)]
pub struct Filter {
    /// Level time constant, seconds.
    pub tau: f64,
    /// Rate time constant, seconds; NaN selects single smoothing, where
    /// the rate falls out of the level update instead of being tracked
    /// independently.
    pub sigma: f64,
    /// Smoothed level. NaN until the first sample.
    pub y: f64,
    /// Smoothed rate (per sample interval, not per second). NaN until the
    /// second sample.
    pub dy: f64,
    /// Timestamp of the last sample, seconds. NaN until the first sample.
    pub t: f64,
    /// Interval of the last sample, seconds. NaN until the second sample.
    pub dt: f64,
}

impl Filter {
    /// First-order low-pass with level time constant `tau`.
    pub fn single(tau: f64) -> Self {
        Self {
            tau,
            sigma: f64::NAN,
            y: f64::NAN,
            dy: f64::NAN,
            t: f64::NAN,
            dt: f64::NAN,
        }
    }

    /// Holt-style double smoother: `tau` for the level, `sigma` for the
    /// rate.
    pub fn double(tau: f64, sigma: f64) -> Self {
        Self {
            sigma,
            ..Self::single(tau)
        }
    }

    /// Feed a sample taken `dt` seconds after the previous one. Callers
    /// must pass `dt >= 0`.
    pub fn sample_dt(&mut self, raw: f64, dt: f64) {
        if self.y.is_nan() {
            self.y = raw;
        } else if self.dy.is_nan() {
            self.dy = raw - self.y;
            self.y = raw;
        } else {
            let a = (-dt / self.tau).exp();

            if !self.sigma.is_nan() {
                let g = (-dt / self.sigma).exp();

                // Predict forward by the current rate, blend toward the
                // raw sample, then smooth the realized discrepancy into
                // an updated rate.

                self.y = a * (self.y + self.dy) + (1.0 - a) * raw;
                self.dy = g * self.dy + (1.0 - g) * (raw - self.y);
            } else {
                self.dy = (a - 1.0) * self.y + (1.0 - a) * raw;
                self.y += self.dy;
            }
        }

        self.dt = dt;
    }

    /// Feed a sample with an absolute timestamp `t`, seconds.
    pub fn sample(&mut self, raw: f64, t: f64) {
        let dt = t - self.t;

        self.sample_dt(raw, dt);
        self.t = t;
    }

    /// Rate of change per second, NaN until two samples have been taken.
    pub fn rate(&self) -> f64 {
        self.dy / self.dt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_sets_level_only() {
        let mut f = Filter::double(1.0, 0.1);

        f.sample_dt(42.5, 0.25);
        assert_eq!(f.y, 42.5);
        assert!(f.dy.is_nan());
        assert_eq!(f.dt, 0.25);
    }

    #[test]
    fn test_second_sample_seeds_rate() {
        let mut f = Filter::double(1.0, 0.1);

        f.sample_dt(1.0, 0.1);
        f.sample_dt(1.5, 0.1);
        assert_eq!(f.y, 1.5);
        assert_eq!(f.dy, 0.5);
    }

    #[test]
    fn test_double_smoothing_matches_closed_form() {
        // On a constant-rate ramp x_k = r k dt the update
        // y' = a (y + dy) + (1 - a) x has the analytic fixed point
        // e* = y - x = -a r dt, dy* = a r dt: a constant tracking lag of
        // one prediction step. Check convergence onto it.
        let r = 2.0;
        let dt = 0.05;
        let mut f = Filter::double(0.5, 0.1);
        let a = (-dt / 0.5f64).exp();

        for k in 0..400 {
            f.sample_dt(r * dt * k as f64, dt);
        }

        let x = r * dt * 399.0;
        assert!((f.y - (x - a * r * dt)).abs() < 1e-9, "lagged level, y = {}", f.y);
        assert!((f.dy - a * r * dt).abs() < 1e-9, "steady rate, dy = {}", f.dy);
    }

    #[test]
    fn test_single_smoothing_step_response() {
        // Single smoothing of a unit step must follow 1 - exp(-t / tau).
        let tau = 0.3;
        let dt = 0.01;
        let mut f = Filter::single(tau);

        f.sample_dt(0.0, dt);
        f.sample_dt(0.0, dt);

        let mut t = 0.0;
        for _ in 0..300 {
            f.sample_dt(1.0, dt);
            t += dt;

            let expected = 1.0 - (-t / tau).exp();
            assert!((f.y - expected).abs() < 1e-9, "y = {}, expected {}", f.y, expected);
        }
    }

    #[test]
    fn test_nan_sample_signals_dropout() {
        let mut f = Filter::double(1.0, 0.1);

        f.sample_dt(2.0, 0.1);
        f.sample_dt(2.0, 0.1);
        f.sample_dt(f64::NAN, 0.1);
        assert!(f.y.is_nan());
        assert!(f.dy.is_nan());
        // dt is still stored.
        assert_eq!(f.dt, 0.1);
    }

    #[test]
    fn test_timestamped_sampling_tracks_dt() {
        let mut f = Filter::single(1.0);

        f.sample(10.0, 4.0);
        assert!(f.dt.is_nan());
        f.sample(11.0, 4.5);
        assert_eq!(f.dt, 0.5);
        assert_eq!(f.t, 4.5);
    }
}
