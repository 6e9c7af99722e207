//! Results filter dispatch tests.
//!
//! Live dispatch runs against the mock driver; intercepted dispatch runs
//! against a `StubResultsFilter` and must never reach the driver.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use db_execfilter::db::{Command, MockConnection, ResultSet, Value};
use db_execfilter::materialize::{Record, RowType, RowTypeRegistry};
use db_execfilter::results::{ResultsFilter, StubResultsFilter, TypeTag};
use db_execfilter::{ExecError, ExecFilter, Result};
use pretty_assertions::assert_eq;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

fn sample_pairs() -> ResultSet {
    ResultSet::from_pairs("id", "name", [(1i64, "a"), (2, "b"), (1, "c")])
}

fn open(filter: &ExecFilter, conn: &MockConnection) -> Command {
    filter.create_command(conn).unwrap()
}

#[tokio::test]
async fn test_dictionary_last_value_wins() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new().with_result_set(sample_pairs());
    let mut cmd = open(&filter, &conn);

    let map: HashMap<i64, String> = cmd
        .dictionary(Some("SELECT id, name FROM t"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        map,
        HashMap::from([(1, "c".to_string()), (2, "b".to_string())])
    );
    filter.dispose_command(cmd);
    assert_eq!(conn.commands_disposed(), 1);
}

#[tokio::test]
async fn test_lookup_preserves_group_order() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new().with_result_set(sample_pairs());
    let mut cmd = open(&filter, &conn);

    let groups: HashMap<i64, Vec<String>> = cmd
        .lookup(Some("SELECT id, name FROM t"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(groups[&1], vec!["a".to_string(), "c".to_string()]);
    assert_eq!(groups[&2], vec!["b".to_string()]);
    assert_eq!(groups.len(), 2);
}

#[tokio::test]
async fn test_column_distinct_collapses_duplicates() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new()
        .with_result_set(ResultSet::single_column("n", [5i64, 5, 3, 5, 3]));
    let mut cmd = open(&filter, &conn);

    let distinct: HashSet<i64> = cmd
        .column_distinct(Some("SELECT n FROM t"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(distinct, HashSet::from([3, 5]));
}

#[tokio::test]
async fn test_column_keeps_read_order() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new()
        .with_result_set(ResultSet::single_column("email", ["b@x.io", "a@x.io"]));
    let mut cmd = open(&filter, &conn);

    let emails: Vec<String> = cmd
        .column(Some("SELECT email FROM users"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(emails, vec!["b@x.io".to_string(), "a@x.io".to_string()]);
}

#[tokio::test]
async fn test_convert_to_list_and_single() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new().with_result_set(sample_pairs());
    let cancel = CancellationToken::new();
    let mut cmd = open(&filter, &conn);

    let rows: Vec<(i64, String)> = cmd
        .convert_to_list(Some("SELECT id, name FROM t"), &cancel)
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[2], (1, "c".to_string()));

    let first: Option<Record> = cmd.convert_to(None, &cancel).await.unwrap();
    let first = first.unwrap();
    assert_eq!(first.get("name"), Some(&Value::String("a".to_string())));
}

#[tokio::test]
async fn test_convert_to_empty_result_is_none() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new();
    let mut cmd = open(&filter, &conn);

    let row: Option<(i64,)> = cmd
        .convert_to(Some("SELECT id FROM t WHERE false"), &CancellationToken::new())
        .await
        .unwrap();
    assert!(row.is_none());
}

#[tokio::test]
async fn test_runtime_row_type() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new().with_result_set(sample_pairs());
    let cancel = CancellationToken::new();
    let mut registry = RowTypeRegistry::new();
    registry.register::<(i64, String)>("pair");
    let row_type = registry.resolve("pair").unwrap();
    let mut cmd = open(&filter, &conn);

    let rows = cmd
        .convert_to_list_of(&row_type, Some("SELECT id, name FROM t"), &cancel)
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);
    let second = rows[1].downcast_ref::<(i64, String)>().unwrap();
    assert_eq!(second, &(2, "b".to_string()));

    let single = cmd.convert_to_of(&row_type, None, &cancel).await.unwrap();
    assert!(single.unwrap().downcast_ref::<(i64, String)>().is_some());
}

#[tokio::test]
async fn test_scalars() {
    let filter = ExecFilter::default();
    let cancel = CancellationToken::new();

    let conn = MockConnection::new().with_scalar(5_000_000_000i64);
    let mut cmd = open(&filter, &conn);
    let count = cmd.long_scalar(Some("SELECT count(*) FROM events"), &cancel).await.unwrap();
    assert_eq!(count, 5_000_000_000);

    let conn = MockConnection::new().with_scalar(Value::Null);
    let mut cmd = open(&filter, &conn);
    assert_eq!(cmd.long_scalar(Some("SELECT max(id) FROM empty"), &cancel).await.unwrap(), 0);
    assert_eq!(cmd.scalar_value(None, &cancel).await.unwrap(), Value::Null);

    let conn = MockConnection::new().with_result_set(ResultSet::single_column("v", ["7"]));
    let mut cmd = open(&filter, &conn);
    let parsed: i64 = cmd.scalar(Some("SELECT v FROM settings"), &cancel).await.unwrap();
    assert_eq!(parsed, 7);
}

#[tokio::test]
async fn test_two_column_shape_mismatch() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new().with_result_set(ResultSet::single_column("n", [1i64]));

    let result = filter
        .exec_async(&conn, |cmd| {
            Box::pin(async move {
                cmd.dictionary::<i64, String>(Some("SELECT n FROM t"), &CancellationToken::new())
                    .await
            })
        })
        .await;

    assert!(matches!(result, Err(ExecError::Materialize(_))));
    assert_eq!(conn.commands_disposed(), 1);
}

#[tokio::test]
async fn test_sql_argument_replaces_text() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new().with_scalar(1);
    let cancel = CancellationToken::new();
    let mut cmd = open(&filter, &conn);

    cmd.set_text("X");
    cmd.scalar_value(Some("Y"), &cancel).await.unwrap();
    assert_eq!(conn.last_statement().unwrap().text, "Y");

    cmd.scalar_value(None, &cancel).await.unwrap();
    assert_eq!(conn.last_statement().unwrap().text, "Y");
    assert_eq!(cmd.text(), "Y");
}

#[tokio::test]
async fn test_non_query_binds_parameter_map() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new().with_rows_affected(1);
    let mut cmd = open(&filter, &conn);

    let params = HashMap::from([
        ("id".to_string(), Value::Int(9)),
        ("name".to_string(), Value::from("renamed")),
    ]);
    let rows = cmd
        .exec_non_query_sql(
            "UPDATE users SET name = @name WHERE id = @id",
            Some(&params),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(rows, 1);
    let statement = conn.last_statement().unwrap();
    assert_eq!(statement.text, "UPDATE users SET name = @name WHERE id = @id");
    assert_eq!(statement.parameters.len(), 2);
    assert_eq!(statement.parameters.get("id"), Some(&Value::Int(9)));
    assert_eq!(
        statement.parameters.get("name"),
        Some(&Value::String("renamed".to_string()))
    );
}

#[tokio::test]
async fn test_non_query_empty_map_binds_nothing() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new();
    let mut cmd = open(&filter, &conn);

    cmd.exec_non_query_sql("TRUNCATE audit_log", Some(&HashMap::new()), &CancellationToken::new())
        .await
        .unwrap();

    let statement = conn.last_statement().unwrap();
    assert_eq!(statement.text, "TRUNCATE audit_log");
    assert!(statement.parameters.is_empty());
}

#[tokio::test]
async fn test_non_query_binds_struct_fields() {
    #[derive(Serialize)]
    struct Rename<'a> {
        id: i64,
        name: &'a str,
        archived: Option<bool>,
    }

    let filter = ExecFilter::default();
    let conn = MockConnection::new().with_rows_affected(1);
    let mut cmd = open(&filter, &conn);

    cmd.exec_non_query_with(
        "UPDATE users SET name = @name, archived = @archived WHERE id = @id",
        &Rename {
            id: 3,
            name: "Ada",
            archived: None,
        },
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let params = conn.last_statement().unwrap().parameters;
    assert_eq!(params.len(), 3);
    assert_eq!(params.get("id"), Some(&Value::Int(3)));
    assert_eq!(params.get("archived"), Some(&Value::Null));
}

#[tokio::test]
async fn test_intercepted_scalar_never_reaches_driver() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new().with_scalar(7);
    let stub = Arc::new(StubResultsFilter::new().with_scalar(42));
    let _guard = filter.install_results_filter(stub.clone());

    // Interception does not consult the token.
    let cancel = CancellationToken::new();
    cancel.cancel();

    let value = filter
        .exec_async(&conn, move |cmd| {
            Box::pin(async move { cmd.scalar::<i64>(Some("SELECT anything"), &cancel).await })
        })
        .await
        .unwrap();

    assert_eq!(value, 42);
    assert_eq!(conn.driver_calls(), 0);
    assert_eq!(conn.commands_disposed(), 1);
    assert_eq!(stub.captured_sql(), vec!["SELECT anything".to_string()]);
}

#[tokio::test]
async fn test_intercepted_shapes() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new();
    let stub = Arc::new(
        StubResultsFilter::new()
            .with_rows_affected(3)
            .with_long_scalar(5_000_000_000)
            .with_scalar("v1")
            .with_list(vec![(1i64, "a".to_string())])
            .with_single(Some((2i64, "b".to_string())))
            .with_ref_list(vec![(3i64, "c".to_string())])
            .with_ref_single::<(i64, String)>(None)
            .with_column(vec![10i64, 20])
            .with_column_distinct(HashSet::from([9i64]))
            .with_dictionary(HashMap::from([(1i64, "x".to_string())]))
            .with_lookup(HashMap::from([(1i64, vec!["x".to_string(), "y".to_string()])])),
    );
    let _guard = filter.install_results_filter(stub.clone());
    let cancel = CancellationToken::new();
    let row_type = RowType::of::<(i64, String)>();
    let mut cmd = open(&filter, &conn);

    assert_eq!(cmd.exec_non_query(&cancel).await.unwrap(), 3);
    assert_eq!(cmd.long_scalar(Some("SELECT count(*) FROM big"), &cancel).await.unwrap(), 5_000_000_000);
    assert_eq!(cmd.scalar::<String>(None, &cancel).await.unwrap(), "v1");
    assert_eq!(cmd.scalar_value(None, &cancel).await.unwrap(), Value::from("v1"));

    let list: Vec<(i64, String)> = cmd.convert_to_list(Some("SELECT a"), &cancel).await.unwrap();
    assert_eq!(list, vec![(1, "a".to_string())]);

    let single: Option<(i64, String)> = cmd.convert_to(None, &cancel).await.unwrap();
    assert_eq!(single, Some((2, "b".to_string())));

    let refs = cmd.convert_to_list_of(&row_type, None, &cancel).await.unwrap();
    assert_eq!(refs[0].downcast_ref::<(i64, String)>(), Some(&(3, "c".to_string())));
    assert!(cmd.convert_to_of(&row_type, None, &cancel).await.unwrap().is_none());

    let column: Vec<i64> = cmd.column(None, &cancel).await.unwrap();
    assert_eq!(column, vec![10, 20]);

    let distinct: HashSet<i64> = cmd.column_distinct(None, &cancel).await.unwrap();
    assert_eq!(distinct, HashSet::from([9]));

    let dictionary: HashMap<i64, String> = cmd.dictionary(None, &cancel).await.unwrap();
    assert_eq!(dictionary[&1], "x");

    let lookup: HashMap<i64, Vec<String>> = cmd.lookup(Some("SELECT k, v"), &cancel).await.unwrap();
    assert_eq!(lookup[&1], vec!["x".to_string(), "y".to_string()]);

    assert_eq!(conn.driver_calls(), 0);
    assert_eq!(stub.captured_sql().len(), 12);
    assert_eq!(stub.captured_sql().last().map(String::as_str), Some("SELECT k, v"));
}

#[tokio::test]
async fn test_intercepted_sql_override() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let stub = StubResultsFilter::new()
        .with_scalar_fn(|cmd| Value::from(cmd.text().len() as i64))
        .with_sql_callback(move |sql| sink.lock().unwrap().push(sql.to_string()));
    let _guard = filter.install_results_filter(Arc::new(stub));
    let mut cmd = open(&filter, &conn);

    cmd.set_text("X");
    let len: i64 = cmd.scalar(Some("SELECT YY"), &CancellationToken::new()).await.unwrap();

    assert_eq!(len, 9);
    assert_eq!(*seen.lock().unwrap(), vec!["SELECT YY".to_string()]);
}

#[tokio::test]
async fn test_unanswered_shape_is_unsupported() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new();
    let _guard = filter.install_results_filter(Arc::new(StubResultsFilter::new()));
    let mut cmd = open(&filter, &conn);

    let result = cmd
        .column::<i64>(Some("SELECT n FROM t"), &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(ExecError::Unsupported(_))));
    assert_eq!(conn.driver_calls(), 0);
}

#[tokio::test]
async fn test_target_is_snapshotted_at_creation() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new().with_result_set(ResultSet::single_column("n", [1]));
    let cancel = CancellationToken::new();

    let mut live = open(&filter, &conn);
    let guard = filter.install_results_filter(Arc::new(StubResultsFilter::new().with_scalar(2)));
    let mut intercepted = open(&filter, &conn);
    drop(guard);

    assert_eq!(live.scalar::<i64>(Some("SELECT 1"), &cancel).await.unwrap(), 1);
    assert_eq!(intercepted.scalar::<i64>(Some("SELECT 1"), &cancel).await.unwrap(), 2);
    assert_eq!(conn.driver_calls(), 1);
    assert!(filter.results_filter().is_none());
}

/// A hand-written target answering only list requests for one row type.
struct FixtureRows;

impl ResultsFilter for FixtureRows {
    fn get_list(&self, cmd: &Command, row: TypeTag) -> Result<Box<dyn std::any::Any + Send>> {
        if row != TypeTag::of::<(i64, String)>() {
            return Err(ExecError::unsupported(format!("no fixture for {row:?}")));
        }
        let rows = vec![(cmd.text().len() as i64, cmd.text().to_string())];
        Ok(Box::new(rows))
    }
}

#[tokio::test]
async fn test_custom_target() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new();
    let _guard = filter.install_results_filter(Arc::new(FixtureRows));
    let cancel = CancellationToken::new();
    let mut cmd = open(&filter, &conn);

    let rows: Vec<(i64, String)> = cmd.convert_to_list(Some("SELECT 1"), &cancel).await.unwrap();
    assert_eq!(rows, vec![(8, "SELECT 1".to_string())]);

    let other = cmd.convert_to_list::<(i64,)>(None, &cancel).await;
    assert!(matches!(other, Err(ExecError::Unsupported(_))));

    let scalar = cmd.scalar_value(None, &cancel).await;
    assert!(matches!(scalar, Err(ExecError::Unsupported(_))));
}
