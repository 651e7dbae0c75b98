pub mod constants;
pub mod lengths;
pub mod speed_estimator;
