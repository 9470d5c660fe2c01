//! Signed tokens carrying authentication-method history
//!
//! A base token records the first factor in `amr`. Each step-up adds the
//! method to `amr` and stamps a per-method expiry in `acr.values`; only
//! that expiry decides whether the factor is still fresh.

mod claims;
#[cfg(feature = "jwks")]
pub mod jwks;
mod provider;

use std::time::{SystemTime, UNIX_EPOCH};

pub use claims::{Acr, JwtClaims};
#[cfg(feature = "jwks")]
pub use jwks::{JwksCache, JwksRefreshTask};
pub use provider::TokenProvider;

/// Current time in epoch seconds
#[must_use]
pub fn now_epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}
