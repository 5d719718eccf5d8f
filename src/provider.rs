//! Collaborators the client depends on but does not implement.
//!
//! Auth codes come from the account's web session; stats and group data
//! come from a separate HTTP API. Both are supplied by the caller as
//! trait objects.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use crate::error::Result;

/// Boxed future type for collaborator calls.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Source of short-lived login auth codes.
pub trait AccountProvider: Send + Sync {
    /// Obtain a fresh auth code for `account`.
    fn auth_code(&self, account: u64) -> BoxFuture<'_, Result<String>>;
}

/// Source of per-persona secondary data.
pub trait StatsProvider: Send + Sync {
    /// Detailed statistics for a persona.
    ///
    /// `Ok(None)` means there is nothing to report; it is not cached.
    fn detailed_stats(&self, persona_id: u64) -> BoxFuture<'_, Result<Option<Value>>>;

    /// The persona's active group (platoon).
    ///
    /// `Value::Null` or an empty object when the persona has no group; that
    /// answer is cached like any other.
    fn active_group(&self, persona_id: u64) -> BoxFuture<'_, Result<Value>>;
}
