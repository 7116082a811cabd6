//! Write gates consulted by the audit triggers.
//!
//! Every trigger the engine generates asks `rowtrail_gate('<kind>')` whether
//! the write in progress was issued by the engine. The answer comes from
//! state held in Rust and bound to one connection, so no SQL statement can
//! open a gate. A connection without the function registered cannot run the
//! triggers at all, which refuses the write.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;

use crate::audit::AuditResult;

/// Name of the SQL function the triggers call.
pub const GATE_FUNCTION: &str = "rowtrail_gate";

/// What an open gate lets through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateKind {
    /// Writes to a monitored table.
    Write,
    /// Deletes from an audit log table.
    Archive,
    /// Inserts into an audit log table.
    Log,
}

impl GateKind {
    /// Returns the name the triggers pass to the gate function.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Write => "write",
            Self::Archive => "archive",
            Self::Log => "log",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "write" => Some(Self::Write),
            "archive" => Some(Self::Archive),
            "log" => Some(Self::Log),
            _ => None,
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Write => 0,
            Self::Archive => 1,
            Self::Log => 2,
        }
    }
}

/// Gate state of one connection.
#[derive(Debug, Default)]
pub(crate) struct Gates {
    open: [AtomicBool; 3],
}

impl Gates {
    /// Register the gate function on a connection, with every gate closed.
    ///
    /// Registering again replaces the previous state.
    pub(crate) fn install(conn: &Connection) -> AuditResult<Arc<Self>> {
        let gates = Arc::new(Self::default());
        let state = Arc::clone(&gates);
        conn.create_scalar_function(
            GATE_FUNCTION,
            1,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_INNOCUOUS,
            move |ctx| {
                let name: String = ctx.get(0)?;
                Ok(GateKind::from_name(&name).is_some_and(|kind| state.is_open(kind)))
            },
        )?;
        Ok(gates)
    }

    pub(crate) fn is_open(&self, kind: GateKind) -> bool {
        self.open[kind.index()].load(Ordering::SeqCst)
    }

    /// Open a gate until the returned guard is dropped.
    pub(crate) fn open(&self, kind: GateKind) -> OpenGate<'_> {
        self.open[kind.index()].store(true, Ordering::SeqCst);
        OpenGate { gates: self, kind }
    }
}

/// An open gate; closes on drop.
pub(crate) struct OpenGate<'a> {
    gates: &'a Gates,
    kind: GateKind,
}

impl Drop for OpenGate<'_> {
    fn drop(&mut self) {
        self.gates.open[self.kind.index()].store(false, Ordering::SeqCst);
    }
}

/// SQL condition that holds while the gate is open.
pub(crate) fn gate_open_sql(kind: GateKind) -> String {
    format!("{GATE_FUNCTION}('{}')", kind.as_str())
}
