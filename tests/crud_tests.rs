use std::sync::Arc;

use anyhow::Result;
use sqlite_session::{
    ConflictAlgorithm, Connection, DeleteOperation, Error, InsertOperation, Query, QueryOperator,
    ReadOperation, SqliteConfig, UpdateOperation, Value,
};
use tempfile::{tempdir, TempDir};

// Helper function to create a file-based database with the users schema
fn create_test_db(dir: &TempDir) -> Result<Arc<Connection>> {
    let path = dir.path().join("crud.db");
    let conn = Connection::connect(SqliteConfig::new("crud-tests", path.to_string_lossy()), "main")?;
    conn.execute(
        "CREATE TABLE users (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT UNIQUE NOT NULL,
            age INTEGER
        )",
        &[],
        None,
    )?;
    conn.execute("CREATE INDEX idx_users_email ON users(email)", &[], None)?;
    Ok(conn)
}

fn insert_user(conn: &Connection, name: &str, email: &str, age: Option<i64>) -> Result<Option<i64>> {
    let op = InsertOperation::new("users")
        .with_value("name", name)
        .with_value("email", email)
        .with_value("age", age);
    Ok(conn.insert(&op)?)
}

fn by_id(id: i64) -> Query {
    Query::new().with_condition("id", QueryOperator::Equal(id.into()))
}

#[tokio::test]
async fn test_basic_operations() {
    test_basic_operations_impl().unwrap();
}

fn test_basic_operations_impl() -> Result<()> {
    let dir = tempdir()?;
    let conn = create_test_db(&dir)?;

    // Insert a new user
    let id = insert_user(&conn, "John Doe", "john@example.com", Some(30))?.expect("row id");
    assert_eq!(id, 1);

    // Query a user
    let read = ReadOperation::new("users")
        .with_fields(&["id", "name", "email", "age"])
        .with_query(by_id(id));
    let rows = conn.read_all(&read, None)?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows.get(0, 1), Some(&Value::Text("John Doe".into())));
    assert_eq!(rows.get(0, 2), Some(&Value::Text("john@example.com".into())));
    assert_eq!(rows.get(0, 3), Some(&Value::Integer(30)));

    // Update the user
    let update = UpdateOperation::new("users")
        .with_update("age", 31)
        .with_query(by_id(id));
    assert_eq!(conn.update(&update)?, 1);
    let age = conn.execute_for_long("SELECT age FROM users WHERE id = ?", &[id.into()], None)?;
    assert_eq!(age, 31);

    // Delete the user
    assert_eq!(conn.delete(&DeleteOperation::new("users", by_id(id)))?, 1);
    assert!(conn.read_all(&read, None)?.is_empty());

    conn.close()?;
    Ok(())
}

#[tokio::test]
async fn test_conflict_algorithms() {
    test_conflict_algorithms_impl().unwrap();
}

fn test_conflict_algorithms_impl() -> Result<()> {
    let dir = tempdir()?;
    let conn = create_test_db(&dir)?;
    insert_user(&conn, "Ann", "ann@example.com", None)?;

    // plain insert fails on the unique email
    let duplicate = InsertOperation::new("users")
        .with_value("name", "Other Ann")
        .with_value("email", "ann@example.com");
    let err = conn.insert(&duplicate).err().expect("unique violation");
    assert_eq!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    );

    // ignored: nothing inserted, no row id
    let ignored = duplicate.clone().with_conflict(ConflictAlgorithm::Ignore);
    assert_eq!(conn.insert(&ignored)?, None);

    // replaced: the old row goes away
    let replaced = duplicate.with_conflict(ConflictAlgorithm::Replace);
    assert_eq!(conn.insert(&replaced)?, Some(2));
    assert_eq!(conn.execute_for_long("SELECT count(*) FROM users", &[], None)?, 1);
    assert_eq!(
        conn.execute_for_string("SELECT name FROM users", &[], None)?.as_deref(),
        Some("Other Ann")
    );
    conn.close()?;
    Ok(())
}

#[tokio::test]
async fn test_read_with_cursor() {
    test_read_with_cursor_impl().unwrap();
}

fn test_read_with_cursor_impl() -> Result<()> {
    let dir = tempdir()?;
    let conn = create_test_db(&dir)?;
    conn.begin_transaction_non_exclusive()?;
    for i in 0..20 {
        insert_user(&conn, &format!("user{i}"), &format!("user{i}@example.com"), Some(20 + i % 5))?;
    }
    conn.set_transaction_successful()?;
    conn.end_transaction(None)?;

    let read = ReadOperation::new("users")
        .with_fields(&["name", "age"])
        .with_query(
            Query::new()
                .with_condition("age", QueryOperator::In(vec![20.into(), 21.into()]))
                .with_condition("name", QueryOperator::Like("user1%".into())),
        )
        .with_order_by("name", true)
        .with_limit("3");
    let mut cursor = conn.read(&read, None)?;
    let mut names = Vec::new();
    while cursor.move_to_next()? {
        names.push(cursor.get_string(0)?.unwrap_or_default());
    }
    // ages 20/21 with names starting user1: user1, user10, user11, user15, user16
    assert_eq!(names, vec!["user1", "user10", "user11"]);
    cursor.close();

    let grouped = ReadOperation::new("users")
        .with_fields(&["age", "count(*)"])
        .with_group_by("age", Some("count(*) >= 4".into()))
        .with_order_by("age", false);
    let rows = conn.read_all(&grouped, None)?;
    assert_eq!(rows.len(), 5);
    assert_eq!(rows.get(0, 0), Some(&Value::Integer(24)));
    assert_eq!(rows.get(0, 1), Some(&Value::Integer(4)));

    let invalid = ReadOperation::new("users").with_limit("all");
    assert!(matches!(conn.read_all(&invalid, None), Err(Error::InvalidArgument(_))));
    conn.close()?;
    Ok(())
}

#[tokio::test]
async fn test_update_and_delete_counts() {
    test_update_and_delete_counts_impl().unwrap();
}

fn test_update_and_delete_counts_impl() -> Result<()> {
    let dir = tempdir()?;
    let conn = create_test_db(&dir)?;
    for (name, age) in [("a", Some(10)), ("b", Some(40)), ("c", None)] {
        insert_user(&conn, name, &format!("{name}@example.com"), age)?;
    }

    let adults = Query::new().with_condition("age", QueryOperator::GreaterThanOrEqual(18.into()));
    let update = UpdateOperation::new("users")
        .with_update("name", "adult")
        .with_query(adults);
    assert_eq!(conn.update(&update)?, 1);

    let unknown_age = Query::new().with_condition("age", QueryOperator::Equal(Value::Null));
    assert_eq!(conn.delete(&DeleteOperation::new("users", unknown_age))?, 1);

    assert_eq!(conn.delete(&DeleteOperation::new("users", Query::new()))?, 2);
    assert!(matches!(
        conn.update(&UpdateOperation::new("users")),
        Err(Error::InvalidArgument(_))
    ));
    conn.close()?;
    Ok(())
}
