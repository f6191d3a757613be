//! prepline-predict — the Pattern Predictor.
//!
//! Forecasts per-minute QPS by blending two signals: the seasonal average
//! for the target (day-of-week, hour) slot, and a least-squares trend over
//! the most recent per-minute samples. Near minutes lean on the trend, far
//! minutes on the seasonal pattern.
//!
//! [`forecast`] is a pure function; [`PatternPredictor`] feeds it from the
//! traffic observer and publishes horizon values as an atomically swapped
//! snapshot for the sizer.

pub mod forecast;
pub mod predictor;

pub use forecast::{ForecastPoint, forecast, linear_trend};
pub use predictor::PatternPredictor;
