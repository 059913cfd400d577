//! Signal smoothing for tracked coordinates.
//!
//! The One-Euro filter keeps static points steady while following fast
//! motion with little lag; `min_cutoff` trades jitter for lag at rest and
//! `beta` reduces lag proportionally to speed.

use std::f64::consts::PI;

#[derive(Debug, Clone)]
pub struct LowPassFilter {
    alpha: f64,
    state: f64,
    initialized: bool,
}

impl LowPassFilter {
    pub fn new(alpha: f64) -> Self {
        LowPassFilter {
            alpha,
            state: 0.0,
            initialized: false,
        }
    }

    pub fn with_initial(alpha: f64, init_value: f64) -> Self {
        LowPassFilter {
            alpha,
            state: init_value,
            initialized: true,
        }
    }

    pub fn filter(&mut self, value: f64, alpha: Option<f64>) -> f64 {
        if let Some(alpha) = alpha {
            self.alpha = alpha;
        }
        if !self.initialized {
            self.initialized = true;
            self.state = value;
            return value;
        }
        self.state = self.alpha * value + (1.0 - self.alpha) * self.state;
        self.state
    }

    pub fn last_value(&self) -> f64 {
        self.state
    }
}

#[derive(Debug, Clone)]
pub struct OneEuroFilter {
    min_cutoff: f64,
    beta: f64,
    d_cutoff: f64,
    x_filter: LowPassFilter,
    dx_filter: LowPassFilter,
    t_prev: Option<f64>,
}

impl OneEuroFilter {
    pub fn new(min_cutoff: f64, beta: f64) -> Self {
        OneEuroFilter {
            min_cutoff,
            beta,
            d_cutoff: 1.0,
            x_filter: LowPassFilter::new(1.0),
            dx_filter: LowPassFilter::new(1.0),
            t_prev: None,
        }
    }

    fn alpha(&self, dt: f64, cutoff: f64) -> f64 {
        let tau = 1.0 / (2.0 * PI * cutoff);
        1.0 / (1.0 + tau / dt)
    }

    pub fn filter(&mut self, x: f64, t: f64) -> f64 {
        let Some(t_prev) = self.t_prev.replace(t) else {
            self.x_filter = LowPassFilter::with_initial(1.0, x);
            self.dx_filter = LowPassFilter::with_initial(1.0, 0.0);
            return x;
        };

        let dt = t - t_prev;
        if dt <= 0.0 {
            return self.x_filter.last_value();
        }

        let dx = (x - self.x_filter.last_value()) / dt;
        let alpha_d = self.alpha(dt, self.d_cutoff);
        let edx = self.dx_filter.filter(dx, Some(alpha_d));

        let cutoff = self.min_cutoff + self.beta * edx.abs();
        let alpha = self.alpha(dt, cutoff);
        self.x_filter.filter(x, Some(alpha))
    }
}

/// One-Euro smoothing of a 2-D coordinate pair.
#[derive(Debug, Clone)]
pub struct PointSmoother {
    fx: OneEuroFilter,
    fy: OneEuroFilter,
}

impl PointSmoother {
    pub fn new(min_cutoff: f64, beta: f64) -> Self {
        PointSmoother {
            fx: OneEuroFilter::new(min_cutoff, beta),
            fy: OneEuroFilter::new(min_cutoff, beta),
        }
    }

    pub fn filter(&mut self, x: f64, y: f64, timestamp: f64) -> (f64, f64) {
        (self.fx.filter(x, timestamp), self.fy.filter(y, timestamp))
    }
}

impl Default for PointSmoother {
    fn default() -> Self {
        // Studio defaults: steady at rest, responsive for pedal strokes.
        PointSmoother::new(0.5, 0.01)
    }
}
