//! Business logic services

pub mod cancellation;
pub mod geo;
pub mod jobs;
pub mod monte_carlo;
pub mod optimizer;
pub mod progress;
pub mod travel_time;
