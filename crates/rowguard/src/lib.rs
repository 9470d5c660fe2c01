//! Role-based, row-level and step-up authorization for entity data providers

pub mod acl;
pub mod authentication;
pub mod config;
pub mod consolidate;
pub mod context;
mod error;
pub mod evaluator;
pub mod filter;
pub mod hooks;
pub mod metadata;
pub mod mfa;
pub mod observability;
pub mod pipeline;
pub mod provider;
pub mod registry;
pub mod token;

pub use acl::{
    AccessControlEntry, AccessControlList, AccessFilterFn, AccessKey, AccessType, AccessValue,
    EVERYONE_ROLE, FilterOutcome,
};
pub use authentication::{Authenticator, StaticUserProfiles, UserProfileLookup, VerifiedFactor};
pub use config::{AuthConfig, ConfigBuilder, TelemetryConfig, TokenConfig};
pub use consolidate::{ConsolidatedAccessControlEntry, ConsolidatedValue, consolidate};
pub use context::{
    AuthorizationContext, TokenState, UserProfile, authorization_context,
    set_authorization_context, spawn_with_authorization_context, with_authorization_context,
};
pub use error::{Error, FieldLocation, RestrictedFieldError, Result};
pub use evaluator::evaluate_access_filter;
pub use filter::{Entity, Filter};
pub use hooks::{Hook, HookArgs, HookParams, HookRegistry, HookStage, Selection};
pub use metadata::{EntityMetadata, FieldMetadata, MetadataLookup, MetadataRegistry, RelationshipKind};
pub use mfa::{
    AuthenticationMethod, MfaOperation, MultiFactorAuthentication, MultiFactorAuthenticationRule,
    check_authentication, check_step_up,
};
pub use pipeline::{AuthorizationHooks, EntityOperations};
pub use provider::{DataProvider, InMemoryProvider, Pagination};
pub use registry::{AccessControlRegistry, PolicyView, RegisterOptions};
pub use token::{Acr, JwtClaims, TokenProvider};
