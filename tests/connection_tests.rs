use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use anyhow::Result;
use sqlite_session::{
    Connection, CorruptionHandler, DataType, Error, OpenFlags, OperationLog, SqliteConfig, Value,
};
use tempfile::{tempdir, TempDir};

// WAL mode leaves -wal and -shm files next to the database, so every test
// gets its own directory.
fn test_config(dir: &TempDir) -> SqliteConfig {
    let path = dir.path().join("test.db");
    SqliteConfig::new("connection-tests", path.to_string_lossy())
}

fn open_test_db(dir: &TempDir) -> Result<Arc<Connection>> {
    let conn = Connection::connect(test_config(dir), "main")?;
    conn.execute(
        "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT, qty INTEGER)",
        &[],
        None,
    )?;
    Ok(conn)
}

#[tokio::test]
async fn test_open_applies_pragmas() {
    test_open_applies_pragmas_impl().unwrap();
}

fn test_open_applies_pragmas_impl() -> Result<()> {
    let dir = tempdir()?;
    let conn = Connection::connect(test_config(&dir), "main")?;
    assert!(conn.is_open());
    assert_eq!(
        conn.execute_for_string("PRAGMA journal_mode", &[], None)?.as_deref(),
        Some("wal")
    );
    assert_eq!(conn.execute_for_long("PRAGMA synchronous", &[], None)?, 2);
    assert_eq!(conn.execute_for_long("PRAGMA foreign_keys", &[], None)?, 0);
    assert_eq!(
        conn.execute_for_long("PRAGMA journal_size_limit", &[], None)?,
        3_000_000
    );
    assert_eq!(conn.execute_for_long("PRAGMA wal_autocheckpoint", &[], None)?, 1000);
    assert_eq!(
        conn.execute_for_string("PRAGMA locking_mode", &[], None)?.as_deref(),
        Some("normal")
    );
    assert!(conn.path().ends_with("test.db"));
    assert_eq!(conn.app_name(), "connection-tests");
    assert_eq!(conn.session_qualifier(), "main");
    conn.close()?;
    Ok(())
}

#[tokio::test]
async fn test_open_requires_wal() {
    test_open_requires_wal_impl().unwrap();
}

fn test_open_requires_wal_impl() -> Result<()> {
    let dir = tempdir()?;
    let config = test_config(&dir).with_open_flags(OpenFlags::CREATE_IF_NECESSARY);
    match Connection::connect(config, "main") {
        Err(Error::Misuse(message)) => assert!(message.contains("WAL"), "{message}"),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("opened without WAL"),
    }
    assert!(!dir.path().join("test.db").exists());
    Ok(())
}

#[tokio::test]
async fn test_close_is_idempotent() {
    test_close_is_idempotent_impl().unwrap();
}

fn test_close_is_idempotent_impl() -> Result<()> {
    let dir = tempdir()?;
    let conn = open_test_db(&dir)?;
    conn.close()?;
    conn.close()?;
    assert!(!conn.is_open());

    assert!(matches!(
        conn.execute("INSERT INTO items (name) VALUES ('x')", &[], None),
        Err(Error::ConnectionClosed)
    ));
    assert!(matches!(
        conn.execute_for_long("SELECT count(*) FROM items", &[], None),
        Err(Error::ConnectionClosed)
    ));
    assert!(matches!(conn.in_transaction(), Err(Error::ConnectionClosed)));
    assert!(matches!(
        conn.begin_transaction_non_exclusive(),
        Err(Error::ConnectionClosed)
    ));
    Ok(())
}

#[tokio::test]
async fn test_execute_result_shapes() {
    test_execute_result_shapes_impl().unwrap();
}

fn test_execute_result_shapes_impl() -> Result<()> {
    let dir = tempdir()?;
    let conn = open_test_db(&dir)?;

    let first = conn.execute_for_last_inserted_row_id(
        "INSERT INTO items (name, qty) VALUES (?, ?)",
        &["apple".into(), 3.into()],
        None,
    )?;
    assert_eq!(first, Some(1));
    let second = conn.execute_for_last_inserted_row_id(
        "INSERT INTO items (name, qty) VALUES (?, ?)",
        &["pear".into(), Value::Null],
        None,
    )?;
    assert_eq!(second, Some(2));

    // ignored insert changes nothing
    let ignored = conn.execute_for_last_inserted_row_id(
        "INSERT OR IGNORE INTO items (id, name) VALUES (?, ?)",
        &[1.into(), "dup".into()],
        None,
    )?;
    assert_eq!(ignored, None);

    assert_eq!(conn.execute_for_long("SELECT count(*) FROM items", &[], None)?, 2);
    assert_eq!(
        conn.execute_for_string("SELECT name FROM items WHERE id = ?", &[2.into()], None)?
            .as_deref(),
        Some("pear")
    );
    assert_eq!(
        conn.execute_for_string("SELECT qty FROM items WHERE id = ?", &[2.into()], None)?,
        None
    );
    assert!(matches!(
        conn.execute_for_long("SELECT qty FROM items WHERE id = ?", &[99.into()], None),
        Err(Error::NoRows)
    ));

    let changed =
        conn.execute_for_changed_row_count("UPDATE items SET qty = ?", &[10.into()], None)?;
    assert_eq!(changed, 2);

    let rows = conn
        .execute_for_rows("SELECT id, name, qty FROM items ORDER BY id", &[], None)?
        .expect("row set");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows.column_names(), &["id", "name", "qty"]);
    assert_eq!(
        rows.column_types(),
        &[DataType::Integer, DataType::Text, DataType::Integer]
    );
    assert_eq!(rows.get(1, 1), Some(&Value::Text("pear".into())));

    // rows are only returned through the query methods
    assert!(matches!(
        conn.execute("SELECT * FROM items", &[], None),
        Err(Error::Misuse(_))
    ));
    conn.close()?;
    Ok(())
}

#[tokio::test]
async fn test_bind_argument_count_is_checked() {
    test_bind_argument_count_is_checked_impl().unwrap();
}

fn test_bind_argument_count_is_checked_impl() -> Result<()> {
    let dir = tempdir()?;
    let conn = open_test_db(&dir)?;
    match conn.execute("INSERT INTO items (name, qty) VALUES (?, ?)", &["a".into()], None) {
        Err(Error::BindArgumentCount { expected, actual }) => {
            assert_eq!(expected, 2);
            assert_eq!(actual, 1);
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(conn.execute_for_long("SELECT count(*) FROM items", &[], None)?, 0);

    // the failure is recorded in the operation log
    let failed = conn
        .operation_log()
        .recent_operations()
        .into_iter()
        .find(|op| op.failure.is_some())
        .expect("failed operation");
    assert_eq!(failed.kind, "execute");
    conn.close()?;
    Ok(())
}

#[tokio::test]
async fn test_boolean_arguments_bind_as_integers() {
    test_boolean_arguments_bind_as_integers_impl().unwrap();
}

fn test_boolean_arguments_bind_as_integers_impl() -> Result<()> {
    let dir = tempdir()?;
    let conn = open_test_db(&dir)?;
    conn.execute(
        "INSERT INTO items (name, qty) VALUES (?, ?)",
        &["flag".into(), Value::Boolean(true)],
        None,
    )?;
    let rows = conn
        .execute_for_rows("SELECT qty, typeof(qty) FROM items", &[], None)?
        .expect("row set");
    assert_eq!(rows.get(0, 0), Some(&Value::Integer(1)));
    assert_eq!(rows.get(0, 1), Some(&Value::Text("integer".into())));
    conn.close()?;
    Ok(())
}

#[tokio::test]
async fn test_mixed_column_types_are_rejected() {
    test_mixed_column_types_are_rejected_impl().unwrap();
}

fn test_mixed_column_types_are_rejected_impl() -> Result<()> {
    let dir = tempdir()?;
    let conn = open_test_db(&dir)?;
    // no declared type, so values keep the storage class they were bound with
    conn.execute("CREATE TABLE loose (v)", &[], None)?;
    for value in [Value::from("text"), Value::from(42), Value::Null] {
        conn.execute("INSERT INTO loose (v) VALUES (?)", &[value], None)?;
    }
    assert!(matches!(
        conn.execute_for_rows("SELECT v FROM loose ORDER BY rowid", &[], None),
        Err(Error::MixedColumnTypes { column: 0, .. })
    ));
    // nulls alone never conflict
    let rows = conn
        .execute_for_rows("SELECT v FROM loose WHERE v IS NULL OR v = 42", &[], None)?
        .expect("row set");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows.column_types(), &[DataType::Integer]);
    conn.close()?;
    Ok(())
}

#[tokio::test]
async fn test_statement_cache_hits() {
    test_statement_cache_hits_impl().unwrap();
}

fn test_statement_cache_hits_impl() -> Result<()> {
    let dir = tempdir()?;
    let conn = open_test_db(&dir)?;
    let hits = conn.prepared_statement_cache_hit_count();
    let misses = conn.prepared_statement_cache_miss_count();

    for _ in 0..3 {
        conn.execute_for_long("SELECT count(*) FROM items", &[], None)?;
    }
    assert_eq!(conn.prepared_statement_cache_miss_count(), misses + 1);
    assert_eq!(conn.prepared_statement_cache_hit_count(), hits + 2);
    assert_eq!(conn.prepared_statement_cache_size(), 1);

    let dump = conn.dump(true);
    assert!(dump.contains("sql=\"SELECT count(*) FROM items\""), "{dump}");

    // schema changes flush the cache
    conn.execute("CREATE TABLE other (x)", &[], None)?;
    assert_eq!(conn.prepared_statement_cache_size(), 0);
    conn.close()?;
    Ok(())
}

#[tokio::test]
async fn test_prepare_describes_statement() {
    test_prepare_describes_statement_impl().unwrap();
}

fn test_prepare_describes_statement_impl() -> Result<()> {
    let dir = tempdir()?;
    let conn = open_test_db(&dir)?;
    let info = conn.prepare("SELECT id, name FROM items WHERE qty > ?")?;
    assert_eq!(info.num_parameters, 1);
    assert!(info.read_only);
    assert_eq!(info.column_names, vec!["id".to_string(), "name".to_string()]);

    let insert = conn.prepare("INSERT INTO items (name) VALUES (?)")?;
    assert!(!insert.read_only);
    assert!(conn.prepare("SELECT nope FROM items").is_err());
    conn.close()?;
    Ok(())
}

#[tokio::test]
async fn test_version_and_integrity() {
    test_version_and_integrity_impl().unwrap();
}

fn test_version_and_integrity_impl() -> Result<()> {
    let dir = tempdir()?;
    let conn = open_test_db(&dir)?;
    assert_eq!(conn.version()?, 0);
    conn.set_version(7)?;
    assert_eq!(conn.version()?, 7);
    assert!(conn.is_database_integrity_ok()?);
    conn.close()?;

    let reopened = Connection::connect(test_config(&dir), "main")?;
    assert_eq!(reopened.version()?, 7);
    reopened.close()?;
    Ok(())
}

#[tokio::test]
async fn test_reentrant_scalar_function() {
    test_reentrant_scalar_function_impl().unwrap();
}

fn test_reentrant_scalar_function_impl() -> Result<()> {
    let dir = tempdir()?;
    let conn = open_test_db(&dir)?;
    conn.execute(
        "INSERT INTO items (name, qty) VALUES ('apple', 3), ('pear', 5)",
        &[],
        None,
    )?;

    let weak: Weak<Connection> = Arc::downgrade(&conn);
    conn.create_scalar_function("stock_of", 1, move |args| {
        let conn = weak.upgrade().ok_or(Error::ConnectionClosed)?;
        let qty = conn.execute_for_long(
            "SELECT qty FROM items WHERE name = ?",
            &[args[0].clone()],
            None,
        )?;
        Ok(Value::Integer(qty))
    })?;

    let total = conn.execute_for_long(
        "SELECT stock_of('apple') + stock_of(name) FROM items WHERE name = 'pear'",
        &[],
        None,
    )?;
    assert_eq!(total, 8);
    conn.close()?;
    Ok(())
}

#[tokio::test]
async fn test_leaked_connection_is_closed() {
    test_leaked_connection_is_closed_impl().unwrap();
}

fn test_leaked_connection_is_closed_impl() -> Result<()> {
    let dir = tempdir()?;
    let log = Arc::new(OperationLog::new("connection-tests"));
    let conn = Connection::open(test_config(&dir), "leaky", Arc::clone(&log), None)?;
    conn.execute("CREATE TABLE t (x)", &[], None)?;
    conn.begin_transaction_non_exclusive()?;
    conn.execute("INSERT INTO t VALUES (1)", &[], None)?;
    assert_eq!(log.active_connections(), 1);

    drop(conn);
    assert_eq!(log.active_connections(), 0);
    assert_eq!(log.total_opens(), 1);
    assert_eq!(log.total_closes(), 1);

    // the open transaction was rolled back, not committed
    let conn = Connection::open(test_config(&dir), "check", Arc::clone(&log), None)?;
    assert_eq!(conn.execute_for_long("SELECT count(*) FROM t", &[], None)?, 0);
    conn.close()?;
    Ok(())
}

struct CountingHandler {
    calls: AtomicUsize,
}

impl CorruptionHandler for CountingHandler {
    fn on_corruption(&self, _connection: &Connection) -> sqlite_session::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_corrupt_file_reaches_handler() {
    test_corrupt_file_reaches_handler_impl().unwrap();
}

fn test_corrupt_file_reaches_handler_impl() -> Result<()> {
    let dir = tempdir()?;
    let config = test_config(&dir);
    std::fs::write(&config.db_path, b"this is not a database file at all".repeat(200))?;

    let handler = Arc::new(CountingHandler {
        calls: AtomicUsize::new(0),
    });
    let log = Arc::new(OperationLog::new("connection-tests"));
    let result = Connection::open(
        config.clone(),
        "main",
        Arc::clone(&log),
        Some(handler.clone() as Arc<dyn CorruptionHandler>),
    );
    let err = result.err().expect("garbage file opened");
    assert!(err.is_corruption(), "{err}");
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(log.active_connections(), 0);

    // the default handler turns it into a corruption error
    match Connection::connect(config, "main") {
        Err(Error::Corruption(_)) => {}
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("garbage file opened"),
    }
    Ok(())
}

#[tokio::test]
async fn test_open_under_foreign_exclusive_lock() {
    test_open_under_foreign_exclusive_lock_impl().unwrap();
}

fn test_open_under_foreign_exclusive_lock_impl() -> Result<()> {
    let dir = tempdir()?;
    let config = test_config(&dir);
    let other = rusqlite::Connection::open(&config.db_path)?;
    other.execute_batch("CREATE TABLE t (x); BEGIN EXCLUSIVE;")?;

    let handler = Arc::new(CountingHandler {
        calls: AtomicUsize::new(0),
    });
    let log = Arc::new(OperationLog::new("connection-tests"));
    // the pragmas cannot be read or changed until the busy timeout runs out
    let err = Connection::open(
        config.clone(),
        "main",
        Arc::clone(&log),
        Some(handler.clone() as Arc<dyn CorruptionHandler>),
    )
    .err()
    .expect("opened under an exclusive lock");
    assert_eq!(err.sqlite_error_code(), Some(rusqlite::ErrorCode::DatabaseBusy));
    assert!(!err.is_corruption());
    assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    assert_eq!(log.active_connections(), 0);

    other.execute_batch("COMMIT;")?;
    let conn = Connection::open(config, "main", Arc::clone(&log), None)?;
    let mode = conn.execute_for_string("PRAGMA journal_mode", &[], None)?;
    assert_eq!(mode.as_deref(), Some("wal"));
    assert_eq!(log.active_connections(), 1);
    conn.close()?;
    assert_eq!(log.active_connections(), 0);
    drop(other);
    Ok(())
}
