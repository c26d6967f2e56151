//! Dispatch control
//!
//! The [`EventController`] claims ready events under an admission throttle and
//! runs them on a bounded worker pool until it is stopped.

mod dispatch;
mod throttle;

pub use dispatch::{ControllerConfig, ControllerError, ControllerState, EventController};
pub use throttle::{allowed_searches, throttle_interval, AdmissionThrottle, MIN_THROTTLE_INTERVAL};
