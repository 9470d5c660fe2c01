//! JWT claims types

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::mfa::AuthenticationMethod;

/// Authentication context class: per-method step-up expiry (epoch seconds)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acr {
    #[serde(default)]
    pub values: BTreeMap<AuthenticationMethod, i64>,
}

impl Acr {
    /// Whether `method` has a step-up grant that is still valid at `now`
    #[must_use]
    pub fn is_fresh(&self, method: AuthenticationMethod, now: i64) -> bool {
        self.values.get(&method).is_some_and(|expires| *expires > now)
    }
}

/// Complete JWT payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtClaims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    /// Every method used while building this token
    #[serde(default)]
    pub amr: Vec<AuthenticationMethod>,
    #[serde(default)]
    pub acr: Acr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}
