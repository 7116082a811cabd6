//! Causality context carried by every audited write.
//!
//! An [`ActionContext`] is built once per logical user action and handed to
//! the transaction that performs it. Every interceptor invocation in that
//! transaction reads the same values, resolved on first use into a
//! [`ResolvedContext`]. Missing values fall back to defaults: actor `-1`,
//! impersonator `-1`, a correlation id derived from the native transaction
//! counter, and no descriptor.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::schema::{ARCHIVE_AUDIT_LOG, RUN_MIGRATIONS};
use crate::audit::{AuditError, AuditResult};
use crate::registry::descriptor;

/// Actor recorded when the context names none.
pub const NO_ACTOR: i64 = -1;

/// Request-scoped causality context for one logical action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionContext {
    actor_id: Option<i64>,
    impersonator_id: Option<i64>,
    transaction_id: Option<Uuid>,
    descriptor: Option<String>,
    session_sig: Option<String>,
}

impl ActionContext {
    /// Create an empty context; every value takes its default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for migrations and engine bootstrap work.
    #[must_use]
    pub fn migration() -> Self {
        Self::new().actor(0).descriptor(RUN_MIGRATIONS)
    }

    /// Context that unlocks deletes from audit log tables.
    #[must_use]
    pub fn archival(actor_id: i64) -> Self {
        Self::new().actor(actor_id).descriptor(ARCHIVE_AUDIT_LOG)
    }

    /// Set the acting user.
    #[must_use]
    pub fn actor(mut self, actor_id: i64) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    /// Set the user being impersonated by the actor.
    #[must_use]
    pub fn impersonating(mut self, user_id: i64) -> Self {
        self.impersonator_id = Some(user_id);
        self
    }

    /// Set an explicit correlation id.
    #[must_use]
    pub fn transaction_id(mut self, id: Uuid) -> Self {
        self.transaction_id = Some(id);
        self
    }

    /// Set the reason for the action.
    #[must_use]
    pub fn descriptor(mut self, text: impl Into<String>) -> Self {
        self.descriptor = Some(text.into());
        self
    }

    /// Set an opaque signature for the issuing session.
    #[must_use]
    pub fn session_sig(mut self, sig: impl Into<String>) -> Self {
        self.session_sig = Some(sig.into());
        self
    }

    #[must_use]
    pub fn actor_id(&self) -> Option<i64> {
        self.actor_id
    }

    #[must_use]
    pub fn impersonator_id(&self) -> Option<i64> {
        self.impersonator_id
    }

    #[must_use]
    pub fn explicit_transaction_id(&self) -> Option<Uuid> {
        self.transaction_id
    }

    /// Descriptor text, with empty text treated as absent.
    #[must_use]
    pub fn descriptor_text(&self) -> Option<&str> {
        self.descriptor.as_deref().filter(|text| !text.is_empty())
    }

    /// Session signature, with empty text treated as absent.
    #[must_use]
    pub fn session_signature(&self) -> Option<&str> {
        self.session_sig.as_deref().filter(|sig| !sig.is_empty())
    }
}

/// Context values as written into audit rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedContext {
    pub actor_id: i64,
    pub impersonator_id: i64,
    pub transaction_id: Uuid,
    pub descriptor_id: Option<i64>,
    pub session_sig: Option<String>,
}

impl ResolvedContext {
    /// Resolve a context inside the transaction that will use it.
    ///
    /// Interns the descriptor and, when no correlation id was supplied,
    /// allocates the next native transaction id.
    pub(crate) fn resolve(conn: &Connection, context: &ActionContext) -> AuditResult<Self> {
        let transaction_id = match context.explicit_transaction_id() {
            Some(id) => id,
            None => native_transaction_uuid(next_native_txid(conn)?)?,
        };
        let descriptor_id = descriptor::resolve(conn, context.descriptor_text())?;

        Ok(Self {
            actor_id: context.actor_id().unwrap_or(NO_ACTOR),
            impersonator_id: context.impersonator_id().unwrap_or(NO_ACTOR),
            transaction_id,
            descriptor_id,
            session_sig: context.session_signature().map(String::from),
        })
    }
}

/// Advance the store's native transaction counter.
///
/// The counter moves inside the caller's transaction, so a rolled back
/// transaction releases its number along with every row that used it.
pub(crate) fn next_native_txid(conn: &Connection) -> AuditResult<i64> {
    conn.execute("UPDATE ZATxSequence SET value = value + 1 WHERE id = 1", [])?;
    let txid = conn.query_row(
        "SELECT value FROM ZATxSequence WHERE id = ?1",
        params![1],
        |row| row.get(0),
    )?;
    Ok(txid)
}

/// Derive a correlation id from a native transaction id.
///
/// The decimal id is left-padded with zeros to 32 digits and read as the
/// hex form of a UUID, so transaction 1234 becomes
/// `00000000-0000-0000-0000-000000001234`.
///
/// # Errors
///
/// Returns an error for negative ids.
pub fn native_transaction_uuid(txid: i64) -> AuditResult<Uuid> {
    if txid < 0 {
        return Err(AuditError::InvalidTransactionId(txid.to_string()));
    }
    Uuid::parse_str(&format!("{txid:0>32}"))
        .map_err(|e| AuditError::InvalidTransactionId(e.to_string()))
}
