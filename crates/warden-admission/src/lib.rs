/// Admission control for the Warden pipeline.
///
/// Sliding-window rate limiting across five independent limit classes, with a
/// distributed store when one is attached and a transparent in-process
/// fallback when it is not (or when it misbehaves).
pub mod limiter;

pub use limiter::{AdmissionConfig, RateLimiter};
