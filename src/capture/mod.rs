//! Change capture: causality context, interceptors and audited transactions.

pub mod context;
pub(crate) mod gate;
pub mod interceptor;
mod policy;
mod tx;
pub(crate) mod values;

pub use gate::{GateKind, GATE_FUNCTION};
pub use context::{native_transaction_uuid, ActionContext, ResolvedContext, NO_ACTOR};
pub use interceptor::{diff_rows, ChangeInterceptor, PendingEntry, RowDiff};
pub use policy::AuditPolicy;
pub use tx::AuditedTx;
