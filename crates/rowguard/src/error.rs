use std::fmt;

use thiserror::Error;
use url::Url;

use crate::mfa::AuthenticationMethod;

/// Where a restricted field was referenced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldLocation {
    /// Output selection
    Selection,
    /// Filter argument
    Filter,
    /// Input argument (create/update payload)
    Input,
}

impl FieldLocation {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Selection => "selection",
            Self::Filter => "filter",
            Self::Input => "input",
        }
    }
}

/// A caller referenced a field their roles may not touch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestrictedFieldError {
    pub location: FieldLocation,
    pub entity: String,
    pub field: String,
}

impl fmt::Display for RestrictedFieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.location {
            FieldLocation::Selection => write!(
                f,
                "cannot query field \"{}\" on type \"{}\"",
                self.field, self.entity
            ),
            FieldLocation::Filter => write!(
                f,
                "field \"{}\" is not defined by type \"{}FilterInput\"",
                self.field, self.entity
            ),
            FieldLocation::Input => write!(
                f,
                "field \"{}\" is not defined by type \"{}Input\"",
                self.field, self.entity
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("forbidden")]
    Forbidden,

    #[error("authentication challenge: one of [{}] is required", format_methods(.providers))]
    Challenge {
        providers: Vec<AuthenticationMethod>,
        redirect_uri: Option<Url>,
    },

    #[error("{0}")]
    RestrictedField(RestrictedFieldError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("token verification failed")]
    Verification,

    #[error("{entity} with id {id} no longer exists")]
    NotFound { entity: String, id: String },

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("JWKS error: {0}")]
    Jwks(String),
}

fn format_methods(methods: &[AuthenticationMethod]) -> String {
    if methods.is_empty() {
        return "any".to_string();
    }
    methods
        .iter()
        .map(AuthenticationMethod::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    pub fn restricted_field(
        location: FieldLocation,
        entity: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        Self::RestrictedField(RestrictedFieldError {
            location,
            entity: entity.into(),
            field: field.into(),
        })
    }

    /// Category code shared by every variant of the same kind
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Forbidden => "FORBIDDEN",
            Self::Challenge { .. } => "CHALLENGE",
            Self::RestrictedField(_) => "RESTRICTED_FIELD",
            Self::Config(_) => "CONFIGURATION",
            Self::Verification => "UNAUTHENTICATED",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Provider(_) | Self::Jwks(_) => "INTERNAL",
        }
    }

    #[must_use]
    pub const fn is_forbidden(&self) -> bool {
        matches!(self, Self::Forbidden)
    }

    #[must_use]
    pub const fn is_challenge(&self) -> bool {
        matches!(self, Self::Challenge { .. })
    }

    #[must_use]
    pub const fn is_restricted_field(&self) -> bool {
        matches!(self, Self::RestrictedField(_))
    }

    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    #[must_use]
    pub const fn is_verification(&self) -> bool {
        matches!(self, Self::Verification)
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        // Signature, algorithm and payload failures look the same to callers
        tracing::debug!(error = %err, "JWT verification failed");
        Self::Verification
    }
}

pub type Result<T> = std::result::Result<T, Error>;
