//! Access filter evaluation
//!
//! Turns a consolidated value into the query filter a data provider applies.

use futures::future::join_all;

use crate::acl::FilterOutcome;
use crate::consolidate::ConsolidatedValue;
use crate::context::AuthorizationContext;
use crate::error::{Error, Result};
use crate::filter::Filter;

/// Resolve `value` into a filter for the caller in `ctx`.
///
/// A missing value means no role granted the access type and fails as
/// [`Error::Forbidden`]. Predicates run concurrently; any predicate that
/// denies, or fails, rejects the whole evaluation.
pub async fn evaluate_access_filter(
    value: Option<&ConsolidatedValue>,
    ctx: &AuthorizationContext,
) -> Result<Filter> {
    let filters = match value {
        None => {
            tracing::warn!(user = ?ctx.user_id(), "No role grants this access type");
            return Err(Error::Forbidden);
        }
        Some(ConsolidatedValue::Unconditional) => return Ok(Filter::empty()),
        Some(ConsolidatedValue::Filtered(filters)) => filters,
    };

    if filters.is_empty() {
        tracing::warn!(user = ?ctx.user_id(), "Conditional grant without predicates");
        return Err(Error::Forbidden);
    }

    let outcomes = join_all(filters.iter().map(|f| f.evaluate(ctx.clone()))).await;

    let mut resolved = Vec::with_capacity(outcomes.len());
    for (index, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok(FilterOutcome::Grant(true)) => resolved.push(Filter::empty()),
            Ok(FilterOutcome::Filter(filter)) => resolved.push(filter),
            Ok(FilterOutcome::Grant(false)) => {
                tracing::warn!(
                    user = ?ctx.user_id(),
                    predicate = index,
                    "Access predicate denied"
                );
                return Err(Error::Forbidden);
            }
            Err(e) => {
                tracing::error!(
                    user = ?ctx.user_id(),
                    predicate = index,
                    error = %e,
                    "Access predicate failed, denying"
                );
                return Err(Error::Forbidden);
            }
        }
    }

    Ok(Filter::or(resolved))
}
