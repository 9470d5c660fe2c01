//! Request-scoped authorization context
//!
//! Each inbound request runs inside [`with_authorization_context`], which
//! installs a fresh, empty store in tokio task-local storage. The
//! authentication layer populates it once; policy code only ever reads
//! snapshots. Stores never cross request boundaries, so interleaved
//! requests on the same runtime cannot observe each other.

use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use url::Url;

use crate::error::{Error, Result};
use crate::token::JwtClaims;

/// Caller identity resolved by the authentication layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
}

impl UserProfile {
    pub fn new(id: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            id: id.into(),
            roles,
            username: None,
        }
    }

    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Token attached to a request, before or after verification
#[derive(Debug, Clone)]
pub enum TokenState {
    Raw(String),
    Decoded(Box<JwtClaims>),
}

#[derive(Debug, Clone, Default)]
pub struct AuthorizationContext {
    pub token: Option<TokenState>,
    pub user: Option<UserProfile>,
    pub redirect_uri: Option<Url>,
}

impl AuthorizationContext {
    #[must_use]
    pub fn for_user(user: UserProfile) -> Self {
        Self {
            user: Some(user),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_claims(mut self, claims: JwtClaims) -> Self {
        self.token = Some(TokenState::Decoded(Box::new(claims)));
        self
    }

    #[must_use]
    pub fn with_redirect_uri(mut self, uri: Url) -> Self {
        self.redirect_uri = Some(uri);
        self
    }

    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.id.as_str())
    }

    #[must_use]
    pub fn roles(&self) -> &[String] {
        self.user
            .as_ref()
            .map(|u| u.roles.as_slice())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn claims(&self) -> Option<&JwtClaims> {
        match &self.token {
            Some(TokenState::Decoded(claims)) => Some(claims),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_populated(&self) -> bool {
        self.token.is_some() || self.user.is_some()
    }
}

#[derive(Debug, Default)]
struct ContextCell {
    context: AuthorizationContext,
    populated: bool,
}

type SharedCell = Arc<RwLock<ContextCell>>;

tokio::task_local! {
    static AUTHORIZATION_CONTEXT: SharedCell;
}

/// Run `future` inside a fresh request-scoped context store
pub async fn with_authorization_context<F>(future: F) -> F::Output
where
    F: Future,
{
    AUTHORIZATION_CONTEXT
        .scope(SharedCell::default(), future)
        .await
}

/// Populate the current request's context. Allowed once per request.
///
/// Callers outside the crate cannot rewrite a populated context:
///
/// ```compile_fail
/// use rowguard::context::upsert_authorization_context;
/// ```
pub fn set_authorization_context(context: AuthorizationContext) -> Result<()> {
    with_cell(|cell| {
        let mut cell = cell.write();
        if cell.populated {
            return Err(Error::Config(
                "authorization context already populated for this request".into(),
            ));
        }
        cell.context = context;
        cell.populated = true;
        Ok(())
    })?
}

/// Merge into the current request's context; only the authentication layer
/// may rewrite an already populated context
pub(crate) fn upsert_authorization_context<F>(update: F) -> Result<()>
where
    F: FnOnce(&mut AuthorizationContext),
{
    with_cell(|cell| {
        let mut cell = cell.write();
        update(&mut cell.context);
        cell.populated = true;
    })
}

/// Snapshot of the current request's context
pub fn authorization_context() -> Result<AuthorizationContext> {
    with_cell(|cell| cell.read().context.clone())
}

/// Spawn `future` on the runtime, sharing the current request's context store
pub fn spawn_with_authorization_context<F>(future: F) -> Result<JoinHandle<F::Output>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let cell = AUTHORIZATION_CONTEXT
        .try_with(Arc::clone)
        .map_err(|_| outside_scope())?;
    Ok(tokio::spawn(AUTHORIZATION_CONTEXT.scope(cell, future)))
}

fn with_cell<R>(f: impl FnOnce(&SharedCell) -> R) -> Result<R> {
    AUTHORIZATION_CONTEXT.try_with(f).map_err(|_| outside_scope())
}

fn outside_scope() -> Error {
    Error::Config("authorization context accessed outside of a request scope".into())
}
