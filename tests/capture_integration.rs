//! Integration tests for row change capture.

use rowtrail::audit::{DmlType, Row};
use rowtrail::capture::{native_transaction_uuid, NO_ACTOR};
use rowtrail::config::TrailConfig;
use rowtrail::{ActionContext, AuditError, Store};
use serde_json::{json, Value};
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

fn row(value: Value) -> Row {
    value.as_object().cloned().expect("row literal must be an object")
}

/// Store with a `Widget` table created outside the engine and then
/// provisioned explicitly.
fn widget_store() -> Store {
    let mut store = Store::open_in_memory().expect("Failed to open store");
    store
        .connection()
        .execute_batch("CREATE TABLE Widget (id INTEGER PRIMARY KEY, name TEXT, updatedAt TEXT)")
        .expect("Failed to create Widget");
    assert_ok!(store.provision("Widget"));
    store
}

/// Walk through insert, filtered update and significant update.
#[test]
fn test_widget_scenario() {
    let mut store = widget_store();

    store
        .run(ActionContext::new().actor(7).descriptor("seed"), |tx| {
            tx.insert("Widget", &row(json!({"id": 1, "name": "a"})))
        })
        .expect("Failed to insert");

    let entries = store.audit_log("Widget").expect("Failed to read log");
    assert_eq!(entries.len(), 1);
    let insert = &entries[0];
    assert_eq!(insert.dml_type, DmlType::Insert);
    assert_eq!(insert.data_id, 1);
    assert_eq!(insert.dml_by, 7);
    assert!(insert.old_row_data.is_none());
    let new = insert.new_row_data.as_ref().expect("insert has new data");
    assert_eq!(new.get("id"), Some(&json!(1)));
    assert_eq!(new.get("name"), Some(&json!("a")));
    let descriptor = insert.descriptor_id.expect("descriptor recorded");
    assert_eq!(
        store.descriptor_text(descriptor).unwrap().as_deref(),
        Some("seed")
    );

    // Only a filtered column changes: no entry
    store
        .run(ActionContext::new().actor(7), |tx| {
            tx.update("Widget", 1, &row(json!({"updatedAt": "2026-01-01"})))
        })
        .expect("Failed to touch updatedAt");
    assert_eq!(store.count_entries("Widget").unwrap(), 1);

    // A significant change records every changed column
    store
        .run(ActionContext::new().actor(7), |tx| {
            tx.update(
                "Widget",
                1,
                &row(json!({"name": "b", "updatedAt": "2026-01-02"})),
            )
        })
        .expect("Failed to update");

    let entries = store.audit_log("Widget").unwrap();
    assert_eq!(entries.len(), 2);
    let update = &entries[1];
    assert_eq!(update.dml_type, DmlType::Update);
    assert_eq!(
        update.old_row_data,
        Some(row(json!({"name": "a", "updatedAt": "2026-01-01"})))
    );
    assert_eq!(
        update.new_row_data,
        Some(row(json!({"name": "b", "updatedAt": "2026-01-02"})))
    );

    // The application row itself is untouched by capture
    let stored: String = store
        .connection()
        .query_row("SELECT name FROM Widget WHERE id = 1", [], |r| r.get(0))
        .unwrap();
    assert_eq!(stored, "b");
}

/// A failing log write takes the data write down with it.
#[test]
fn test_atomicity_when_log_write_fails() {
    let mut store = widget_store();

    // Force every log insert to fail
    store
        .connection()
        .execute_batch(
            "CREATE TRIGGER FailLog BEFORE INSERT ON ZALWidget
             BEGIN SELECT RAISE(ABORT, 'log unavailable'); END;",
        )
        .unwrap();

    let result = store.run(ActionContext::new().actor(1), |tx| {
        tx.insert("Widget", &row(json!({"id": 1, "name": "a"})))
    });
    let err = assert_err!(result);
    assert!(err.to_string().contains("log unavailable"));

    let count: i64 = store
        .connection()
        .query_row("SELECT COUNT(*) FROM Widget", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count, 0);
}

/// A swallowed failure still prevents commit.
#[test]
fn test_poisoned_transaction_cannot_commit() {
    let mut store = widget_store();

    let mut tx = store.begin(ActionContext::new()).unwrap();
    tx.insert("Widget", &row(json!({"id": 1, "name": "a"})))
        .unwrap();
    // Duplicate primary key
    let _ = tx.insert("Widget", &row(json!({"id": 1, "name": "again"})));
    assert!(matches!(tx.commit(), Err(AuditError::TransactionAborted)));

    assert_eq!(store.count_entries("Widget").unwrap(), 0);
}

/// Writes under one explicit correlation id share it; other scopes differ.
#[test]
fn test_correlation_ids() {
    let mut store = widget_store();
    let txid = Uuid::new_v4();

    store
        .run(ActionContext::new().transaction_id(txid), |tx| {
            for id in 1..=3 {
                tx.insert("Widget", &row(json!({"id": id, "name": "x"})))?;
            }
            tx.update("Widget", 2, &row(json!({"name": "y"})))?;
            tx.delete("Widget", 3)
        })
        .unwrap();

    store
        .run(ActionContext::new(), |tx| {
            tx.insert("Widget", &row(json!({"id": 4, "name": "z"})))
        })
        .unwrap();

    let scoped = store.audit_log_for_transaction("Widget", txid).unwrap();
    assert_eq!(scoped.len(), 5);
    assert!(scoped.iter().all(|e| e.dml_txid == txid));

    let all = store.audit_log("Widget").unwrap();
    let other = all.last().unwrap();
    assert_ne!(other.dml_txid, txid);
}

/// Missing context values fall back to defaults.
#[test]
fn test_context_defaults() {
    let mut store = widget_store();

    let txid = store
        .run(ActionContext::new(), |tx| {
            tx.insert("Widget", &row(json!({"id": 1})))?;
            tx.transaction_id()
        })
        .unwrap();

    let entry = &store.audit_log("Widget").unwrap()[0];
    assert_eq!(entry.dml_by, NO_ACTOR);
    assert_eq!(entry.dml_as, NO_ACTOR);
    assert_eq!(entry.descriptor_id, None);
    assert_eq!(entry.session_sig, None);
    assert_eq!(entry.dml_txid, txid);

    // Derived ids come from the native transaction counter
    let native: Vec<Uuid> = (1..=10)
        .map(|n| native_transaction_uuid(n).unwrap())
        .collect();
    assert!(native.contains(&txid));
}

/// Impersonation and session signatures are recorded.
#[test]
fn test_impersonation_and_session_signature() {
    let mut store = widget_store();

    store
        .run(
            ActionContext::new()
                .actor(2)
                .impersonating(9)
                .session_sig("sess-abc"),
            |tx| tx.insert("Widget", &row(json!({"id": 1}))),
        )
        .unwrap();

    let entry = &store.audit_log("Widget").unwrap()[0];
    assert_eq!(entry.dml_by, 2);
    assert_eq!(entry.dml_as, 9);
    assert_eq!(entry.session_sig.as_deref(), Some("sess-abc"));
}

/// Every entry of a transaction carries its start time.
#[test]
fn test_entries_share_transaction_timestamp() {
    let mut store = widget_store();

    let started = store
        .run(ActionContext::new(), |tx| {
            tx.insert("Widget", &row(json!({"id": 1})))?;
            tx.insert("Widget", &row(json!({"id": 2})))?;
            Ok(tx.started_at())
        })
        .unwrap();

    let entries = store.audit_log("Widget").unwrap();
    assert_eq!(entries.len(), 2);
    for entry in entries {
        assert_eq!(entry.dml_timestamp.timestamp_micros(), started.timestamp_micros());
    }
}

/// Filtered updates and deletes write one entry per affected row.
#[test]
fn test_bulk_update_and_delete() {
    let mut store = widget_store();

    store
        .run(ActionContext::new().actor(1), |tx| {
            tx.insert("Widget", &row(json!({"id": 1, "name": "a"})))?;
            tx.insert("Widget", &row(json!({"id": 2, "name": "a"})))?;
            tx.insert("Widget", &row(json!({"id": 3, "name": "b"})))?;
            Ok(())
        })
        .unwrap();

    let updated = store
        .run(ActionContext::new().actor(1), |tx| {
            tx.update_where("Widget", &row(json!({"name": "a"})), &row(json!({"name": "c"})))
        })
        .unwrap();
    assert_eq!(updated, 2);

    let deleted = store
        .run(ActionContext::new().actor(1), |tx| {
            tx.delete_where("Widget", &row(json!({"name": "c"})))
        })
        .unwrap();
    assert_eq!(deleted, 2);

    let entries = store.audit_log("Widget").unwrap();
    let kinds: Vec<DmlType> = entries.iter().map(|e| e.dml_type).collect();
    assert_eq!(
        kinds,
        vec![
            DmlType::Insert,
            DmlType::Insert,
            DmlType::Insert,
            DmlType::Update,
            DmlType::Update,
            DmlType::Delete,
            DmlType::Delete,
        ]
    );
    let delete = entries.last().unwrap();
    assert_eq!(delete.data_id, 2);
    assert!(delete.new_row_data.is_none());
    assert_eq!(
        delete.old_row_data.as_ref().and_then(|r| r.get("name")),
        Some(&json!("c"))
    );
}

/// Per-table filter rules add to the global ones.
#[test]
fn test_table_filter_rules_are_additive() {
    let mut config = TrailConfig::default();
    config
        .audit
        .table_filters
        .insert("Widget".to_string(), vec!["cachedTotal".to_string()]);
    let mut store = Store::open_in_memory_with_config(&config).unwrap();
    store
        .execute_ddl(
            ActionContext::migration(),
            "CREATE TABLE Widget (id INTEGER PRIMARY KEY, name TEXT, updatedAt TEXT, cachedTotal INTEGER)",
        )
        .unwrap();

    store
        .run(ActionContext::new(), |tx| {
            tx.insert("Widget", &row(json!({"id": 1, "name": "a"})))?;
            tx.update(
                "Widget",
                1,
                &row(json!({"updatedAt": "t1", "cachedTotal": 10})),
            )
        })
        .unwrap();

    assert_eq!(store.count_entries("Widget").unwrap(), 1);
}

/// Unmonitored tables are written without capture.
#[test]
fn test_unmonitored_table_is_not_captured() {
    let mut store = widget_store();
    store
        .connection()
        .execute_batch("CREATE TABLE Scratch (id INTEGER PRIMARY KEY, note TEXT)")
        .unwrap();

    store
        .run(ActionContext::new(), |tx| {
            tx.insert("Scratch", &row(json!({"note": "hi"})))
        })
        .unwrap();

    assert!(matches!(
        store.audit_log("Scratch"),
        Err(AuditError::UnknownTable(_))
    ));
    assert_eq!(store.monitored_tables().unwrap(), vec!["Widget".to_string()]);
}
