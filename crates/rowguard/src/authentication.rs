//! Authentication layer: verifies the inbound token and populates the
//! request-scoped authorization context

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use url::Url;

use crate::context::{
    AuthorizationContext, TokenState, UserProfile, authorization_context,
    set_authorization_context, upsert_authorization_context, with_authorization_context,
};
use crate::error::{Error, Result};
use crate::mfa::AuthenticationMethod;
use crate::token::TokenProvider;

/// Resolves the profile (and roles) of a token subject
#[async_trait]
pub trait UserProfileLookup: Send + Sync {
    async fn user_profile(&self, subject: &str) -> Result<Option<UserProfile>>;
}

/// Fixed set of profiles keyed by id
#[derive(Debug, Default)]
pub struct StaticUserProfiles {
    profiles: RwLock<HashMap<String, UserProfile>>,
}

impl StaticUserProfiles {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_profile(self, profile: UserProfile) -> Self {
        self.insert(profile);
        self
    }

    pub fn insert(&self, profile: UserProfile) {
        self.profiles.write().insert(profile.id.clone(), profile);
    }
}

#[async_trait]
impl UserProfileLookup for StaticUserProfiles {
    async fn user_profile(&self, subject: &str) -> Result<Option<UserProfile>> {
        Ok(self.profiles.read().get(subject).cloned())
    }
}

/// A second factor that has already been checked for `subject`.
///
/// The engine never verifies OTP codes, passkey assertions or similar
/// itself. Build this only after your own verifier accepted the factor;
/// holding one is what [`Authenticator::step_up`] trusts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedFactor {
    subject: String,
    method: AuthenticationMethod,
}

impl VerifiedFactor {
    #[must_use]
    pub fn new(subject: impl Into<String>, method: AuthenticationMethod) -> Self {
        Self {
            subject: subject.into(),
            method,
        }
    }

    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    #[must_use]
    pub const fn method(&self) -> AuthenticationMethod {
        self.method
    }
}

pub struct Authenticator {
    tokens: Arc<TokenProvider>,
    users: Arc<dyn UserProfileLookup>,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("tokens", &self.tokens)
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    pub fn new(tokens: Arc<TokenProvider>, users: Arc<dyn UserProfileLookup>) -> Self {
        Self { tokens, users }
    }

    #[must_use]
    pub fn tokens(&self) -> &TokenProvider {
        &self.tokens
    }

    /// Verify `raw` and resolve the caller it identifies
    pub async fn authenticate(&self, raw: &str) -> Result<AuthorizationContext> {
        let claims = self.tokens.decode_token(raw).await?;

        let Some(user) = self.users.user_profile(&claims.sub).await? else {
            tracing::warn!(sub = %claims.sub, "Token subject has no profile");
            return Err(Error::Verification);
        };

        tracing::debug!(sub = %claims.sub, roles = ?user.roles, "Authenticated request");
        Ok(AuthorizationContext::for_user(user).with_claims(claims))
    }

    /// Run `handler` as one request: a fresh context scope, populated once
    /// from `raw_token` when present. Requests without a token run as
    /// anonymous callers holding only the `Everyone` role.
    pub async fn handle_request<F, T>(
        &self,
        raw_token: Option<&str>,
        redirect_uri: Option<Url>,
        handler: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        with_authorization_context(async move {
            let mut context = match raw_token {
                Some(raw) => self.authenticate(raw).await?,
                None => AuthorizationContext::default(),
            };
            context.redirect_uri = redirect_uri;
            set_authorization_context(context)?;

            handler.await
        })
        .await
    }

    /// Complete a step-up for the current request and return the new token.
    ///
    /// Grants whatever `factor` claims, so it must come from a real factor
    /// check. The factor has to belong to the token's subject. The request's
    /// context is updated so later checks see the new factor.
    pub fn step_up(&self, factor: VerifiedFactor) -> Result<String> {
        let context = authorization_context()?;
        let claims = context.claims().ok_or(Error::Verification)?;

        if claims.sub != factor.subject {
            tracing::warn!(
                sub = %claims.sub,
                factor_subject = %factor.subject,
                "Step-up factor was verified for a different subject"
            );
            return Err(Error::Verification);
        }

        let method = factor.method;
        let stepped = self.tokens.step_up_claims(claims, method);
        let token = self.tokens.encode_token(&stepped)?;
        tracing::info!(sub = %stepped.sub, method = %method, "Request stepped up");

        upsert_authorization_context(|ctx| {
            ctx.token = Some(TokenState::Decoded(Box::new(stepped)));
        })?;
        Ok(token)
    }
}
