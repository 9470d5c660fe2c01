//! Multi-factor step-up rules
//!
//! Rules are keyed by role and by operation. For one caller and one access
//! type the applicable rules accumulate from the exact operation, from
//! `Write` when the access is a mutation, and from `All`, across every role
//! the caller holds plus `Everyone`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::acl::{AccessType, EVERYONE_ROLE};
use crate::context::AuthorizationContext;
use crate::error::{Error, Result};
use crate::token::JwtClaims;

/// Authentication method recorded in `amr` / `acr.values`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AuthenticationMethod {
    #[serde(rename = "pwd")]
    Password,
    #[serde(rename = "mgl")]
    MagicLink,
    #[serde(rename = "otp")]
    OneTimePassword,
    #[serde(rename = "wb3")]
    Web3,
    #[serde(rename = "passkey")]
    Passkey,
    #[serde(rename = "api_key")]
    ApiKey,
}

impl AuthenticationMethod {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Password => "pwd",
            Self::MagicLink => "mgl",
            Self::OneTimePassword => "otp",
            Self::Web3 => "wb3",
            Self::Passkey => "passkey",
            Self::ApiKey => "api_key",
        }
    }
}

impl fmt::Display for AuthenticationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthenticationMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pwd" | "password" => Ok(Self::Password),
            "mgl" | "magic_link" => Ok(Self::MagicLink),
            "otp" | "one_time_password" => Ok(Self::OneTimePassword),
            "wb3" | "web3" => Ok(Self::Web3),
            "passkey" => Ok(Self::Passkey),
            "api_key" | "apikey" => Ok(Self::ApiKey),
            other => Err(Error::Config(format!(
                "unknown authentication method: {other}"
            ))),
        }
    }
}

/// Operation keys a rule can be attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MfaOperation {
    Read,
    Create,
    Update,
    Delete,
    Write,
    All,
}

impl From<AccessType> for MfaOperation {
    fn from(access: AccessType) -> Self {
        match access {
            AccessType::Read => Self::Read,
            AccessType::Create => Self::Create,
            AccessType::Update => Self::Update,
            AccessType::Delete => Self::Delete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiFactorAuthenticationRule {
    pub factors_required: u32,
    /// Acceptable methods; empty accepts any
    #[serde(default)]
    pub providers: Vec<AuthenticationMethod>,
}

impl MultiFactorAuthenticationRule {
    #[must_use]
    pub const fn new(factors_required: u32, providers: Vec<AuthenticationMethod>) -> Self {
        Self {
            factors_required,
            providers,
        }
    }

    fn accepts(&self, method: AuthenticationMethod) -> bool {
        self.providers.is_empty() || self.providers.contains(&method)
    }

    /// Number of fresh factors in the token this rule accepts
    #[must_use]
    pub fn fresh_factors(&self, claims: Option<&JwtClaims>, now: i64) -> u32 {
        let Some(claims) = claims else {
            return 0;
        };

        let count = claims
            .acr
            .values
            .iter()
            .filter(|(method, expires_at)| self.accepts(**method) && **expires_at > now)
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }
}

/// role → operation → rules
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MultiFactorAuthentication(HashMap<String, HashMap<MfaOperation, Vec<MultiFactorAuthenticationRule>>>);

impl MultiFactorAuthentication {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn rule(
        mut self,
        role: impl Into<String>,
        operation: MfaOperation,
        rule: MultiFactorAuthenticationRule,
    ) -> Self {
        self.0
            .entry(role.into())
            .or_default()
            .entry(operation)
            .or_default()
            .push(rule);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.values().all(|ops| ops.values().all(Vec::is_empty))
    }

    /// Rules that apply to `access` for a caller holding `roles`
    #[must_use]
    pub fn required_rules(
        &self,
        roles: &[String],
        access: AccessType,
    ) -> Vec<&MultiFactorAuthenticationRule> {
        let mut operations = vec![MfaOperation::from(access), MfaOperation::All];
        if access.is_mutation() {
            operations.push(MfaOperation::Write);
        }

        let mut caller_roles: Vec<&str> = roles.iter().map(String::as_str).collect();
        if !caller_roles.contains(&EVERYONE_ROLE) {
            caller_roles.push(EVERYONE_ROLE);
        }

        caller_roles
            .into_iter()
            .filter_map(|role| self.0.get(role))
            .flat_map(|by_operation| {
                operations
                    .iter()
                    .filter_map(|op| by_operation.get(op))
                    .flatten()
            })
            .collect()
    }
}

/// Compare the applicable rules against the fresh factors in `claims`
pub fn check_step_up(
    mfa: &MultiFactorAuthentication,
    roles: &[String],
    access: AccessType,
    claims: Option<&JwtClaims>,
    now: i64,
) -> Result<()> {
    for rule in mfa.required_rules(roles, access) {
        let fresh = rule.fresh_factors(claims, now);
        if fresh < rule.factors_required {
            tracing::info!(
                access = access.as_str(),
                required = rule.factors_required,
                fresh,
                "Step-up authentication required"
            );
            return Err(Error::Challenge {
                providers: rule.providers.clone(),
                redirect_uri: None,
            });
        }
    }

    Ok(())
}

/// Step-up check for the caller described by `ctx`
pub fn check_authentication(
    mfa: &MultiFactorAuthentication,
    access: AccessType,
    ctx: &AuthorizationContext,
) -> Result<()> {
    if mfa.is_empty() {
        return Ok(());
    }

    check_step_up(
        mfa,
        ctx.roles(),
        access,
        ctx.claims(),
        crate::token::now_epoch_seconds(),
    )
    .map_err(|err| match err {
        Error::Challenge { providers, .. } => Error::Challenge {
            providers,
            redirect_uri: ctx.redirect_uri.clone(),
        },
        other => other,
    })
}
