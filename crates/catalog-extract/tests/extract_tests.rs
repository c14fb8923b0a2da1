//! End-to-end extract tests against an in-process source and warehouse.

mod common;

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use catalog_extract::core::RowStream;
use catalog_extract::{
    Catalog, DataSourceConfig, DynamicReader, ErrorKind, ExecutionEngine, ExtractError, FieldSchema,
    FieldType, JobConfig, KeyManagementClient, LabelRowMapper, LocalEngine, MemoryWarehouse,
    Orchestrator, QualifiedTableName, RuntimeParameters, TableRow, TableSchema, TableSink, Value,
};

use common::{encrypt, row, CountingKms, FakeDatabase, FAKE_DRIVER_CLASS, FAKE_URL};

const T_COPY_CATALOG: &str = r#"
- query: SELECT id, name FROM t
  output_table_name: t_copy
  table_schema:
    fields:
      - { name: id, type: INTEGER, mode: REQUIRED }
      - { name: name, type: STRING }
"#;

const THREE_TABLE_CATALOG: &str = r#"
- query: SELECT id, name FROM users
  output_table_name: users
  table_schema:
    fields:
      - { name: id, type: INTEGER }
      - { name: name, type: STRING }
- query: SELECT id, name FROM orders
  output_table_name: orders
  table_schema:
    fields:
      - { name: id, type: INTEGER }
      - { name: name, type: STRING }
- query: SELECT id, name FROM products
  output_table_name: products
  table_schema:
    fields:
      - { name: id, type: INTEGER }
      - { name: name, type: STRING }
"#;

struct Job {
    db: Arc<FakeDatabase>,
    kms: Arc<CountingKms>,
    warehouse: MemoryWarehouse,
    params: RuntimeParameters,
    orchestrator: Orchestrator,
}

fn plain_config(password: &str) -> JobConfig {
    JobConfig::from_yaml(&format!(
        r#"
catalog: catalog.yaml
source:
  driver_class_name: org.fake.Driver
  connection_url: "{url}"
  username: etl
  password: {password}
target:
  output_dataset: analytics
  sink: memory
"#,
        url = FAKE_URL,
        password = password,
    ))
    .unwrap()
}

fn encrypted_config() -> JobConfig {
    JobConfig::from_yaml(&format!(
        r#"
catalog: catalog.yaml
source:
  driver_class_name: org.fake.Driver
  connection_url: "{url}"
  username: "{user}"
  password: "{password}"
target:
  output_dataset: analytics
  sink: memory
kms_encryption_key: projects/p/locations/global/keyRings/r/cryptoKeys/k
"#,
        url = encrypt(FAKE_URL),
        user = encrypt("etl"),
        password = encrypt("s3cret"),
    ))
    .unwrap()
}

fn job(config: &JobConfig, kms: Arc<CountingKms>) -> Job {
    let db = FakeDatabase::new();
    db.require_credentials("etl", "s3cret");
    for table in ["t", "users", "orders", "products"] {
        db.serve(
            &format!("SELECT id, name FROM {}", table),
            &["id", "name"],
            row(&[(1, "a"), (2, "b")]),
        );
    }

    let warehouse = MemoryWarehouse::new();
    let mut params = RuntimeParameters::new();
    let kms_client: Arc<dyn KeyManagementClient> = kms.clone();
    let sink: Arc<dyn TableSink> = Arc::new(warehouse.clone());
    let orchestrator = Orchestrator::from_config_with(config, &mut params, kms_client, sink)
        .unwrap()
        .with_drivers(db.registry());

    Job {
        db,
        kms,
        warehouse,
        params,
        orchestrator,
    }
}

async fn run(job: &Job, catalog: &Catalog) -> catalog_extract::Result<catalog_extract::RunReport> {
    let graph = job.orchestrator.build(catalog)?;
    LocalEngine::new()
        .execute(graph, CancellationToken::new())
        .await
}

fn table(name: &str) -> QualifiedTableName {
    QualifiedTableName::from_dataset("analytics", name).unwrap()
}

fn contents(warehouse: &MemoryWarehouse, name: &str) -> Vec<(Value, Value)> {
    warehouse
        .rows(&table(name))
        .unwrap_or_default()
        .iter()
        .map(|r| {
            (
                r.get("id").cloned().unwrap_or(Value::Null),
                r.get("name").cloned().unwrap_or(Value::Null),
            )
        })
        .collect()
}

fn expected_ab() -> Vec<(Value, Value)> {
    vec![
        (Value::Int(1), Value::from("a")),
        (Value::Int(2), Value::from("b")),
    ]
}

#[tokio::test]
async fn test_plain_credentials_make_no_decrypt_calls() {
    let job = job(&plain_config("s3cret"), CountingKms::new());
    let catalog = Catalog::from_yaml(T_COPY_CATALOG).unwrap();

    run(&job, &catalog).await.unwrap();

    assert_eq!(job.kms.calls(), 0);
    assert_eq!(contents(&job.warehouse, "t_copy"), expected_ab());
}

#[tokio::test]
async fn test_encrypted_values_decrypt_once_per_stage() {
    let job = job(&encrypted_config(), CountingKms::new());
    let catalog = Catalog::from_yaml(THREE_TABLE_CATALOG).unwrap();

    let graph = job.orchestrator.build(&catalog).unwrap();
    assert_eq!(job.kms.calls(), 0, "building the graph must not decrypt");

    let report = LocalEngine::new()
        .execute(graph, CancellationToken::new())
        .await
        .unwrap();

    // URL, username and password, once for each of the three stages.
    assert_eq!(job.kms.calls(), 9);
    assert_eq!(report.stages.len(), 3);
    for name in ["users", "orders", "products"] {
        assert_eq!(contents(&job.warehouse, name), expected_ab());
    }
}

#[tokio::test]
async fn test_stage_count_matches_catalog() {
    let job = job(&plain_config("s3cret"), CountingKms::new());
    let catalog = Catalog::from_yaml(THREE_TABLE_CATALOG).unwrap();
    assert_eq!(job.orchestrator.build(&catalog).unwrap().len(), 3);

    let mut reordered = catalog.entries().to_vec();
    reordered.reverse();
    let graph = job
        .orchestrator
        .build(&Catalog::new(reordered.clone()).unwrap())
        .unwrap();
    assert_eq!(graph.len(), 3);
    assert_eq!(graph.stages()[0].name(), "products");

    reordered.pop();
    let graph = job
        .orchestrator
        .build(&Catalog::new(reordered).unwrap())
        .unwrap();
    assert_eq!(graph.len(), 2);
}

#[tokio::test]
async fn test_duplicate_output_table_fails_before_any_stage() {
    let yaml = r#"
- query: SELECT id, name FROM users
  output_table_name: users
  table_schema: { fields: [ { name: id, type: INTEGER } ] }
- query: SELECT id, name FROM orders
  output_table_name: users
  table_schema: { fields: [ { name: id, type: INTEGER } ] }
"#;
    assert!(matches!(
        Catalog::from_yaml(yaml),
        Err(ExtractError::CatalogValidation(_))
    ));

    // A catalog deserialized without validation is still rejected by build.
    let unchecked: Catalog = serde_yaml::from_str(yaml).unwrap();
    let job = job(&plain_config("s3cret"), CountingKms::new());
    let err = job.orchestrator.build(&unchecked).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CatalogValidation);
    assert_eq!(job.db.connects(), 0);
}

#[tokio::test]
async fn test_full_refresh_replaces_prior_contents() {
    let job = job(&plain_config("s3cret"), CountingKms::new());
    let catalog = Catalog::from_yaml(T_COPY_CATALOG).unwrap();
    job.warehouse.seed(
        &table("t_copy"),
        catalog.entries()[0].table_schema.clone(),
        vec![
            TableRow::new().with("id", 99).with("name", "stale"),
            TableRow::new().with("id", 1).with("name", "old"),
        ],
    );

    let report = run(&job, &catalog).await.unwrap();

    assert_eq!(contents(&job.warehouse, "t_copy"), expected_ab());
    assert_eq!(report.rows_total, 2);
    assert!(!report.stages[0].created);
}

#[tokio::test]
async fn test_full_refresh_replaces_prior_schema() {
    let job = job(&plain_config("s3cret"), CountingKms::new());
    let catalog = Catalog::from_yaml(T_COPY_CATALOG).unwrap();
    job.warehouse.seed(
        &table("t_copy"),
        TableSchema::new(vec![FieldSchema::new("legacy_id", FieldType::String)]),
        vec![TableRow::new().with("legacy_id", "x")],
    );

    run(&job, &catalog).await.unwrap();

    let schema = job.warehouse.schema(&table("t_copy")).unwrap();
    assert_eq!(schema, catalog.entries()[0].table_schema);
    assert_eq!(contents(&job.warehouse, "t_copy"), expected_ab());
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let job = job(&plain_config("s3cret"), CountingKms::new());
    let catalog = Catalog::from_yaml(THREE_TABLE_CATALOG).unwrap();

    run(&job, &catalog).await.unwrap();
    let first: Vec<_> = ["users", "orders", "products"]
        .iter()
        .map(|t| contents(&job.warehouse, t))
        .collect();

    run(&job, &catalog).await.unwrap();
    let second: Vec<_> = ["users", "orders", "products"]
        .iter()
        .map(|t| contents(&job.warehouse, t))
        .collect();

    assert_eq!(first, second);
    assert_eq!(job.warehouse.table_names().len(), 3);
}

#[tokio::test]
async fn test_extra_source_column_is_dropped() {
    let job = job(&plain_config("s3cret"), CountingKms::new());
    job.db.serve(
        "SELECT id, name, extra FROM t",
        &["id", "name", "extra"],
        vec![vec![Value::Int(1), Value::from("a"), Value::from("ignored")]],
    );
    let catalog = Catalog::from_yaml(
        &T_COPY_CATALOG.replace("SELECT id, name FROM t", "SELECT id, name, extra FROM t"),
    )
    .unwrap();

    run(&job, &catalog).await.unwrap();

    let rows = job.warehouse.rows(&table("t_copy")).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].names().collect::<Vec<_>>(), vec!["id", "name"]);
}

#[tokio::test]
async fn test_decrypt_failure_fails_the_whole_run() {
    let job = job(&encrypted_config(), CountingKms::failing_on(4));
    let catalog = Catalog::from_yaml(THREE_TABLE_CATALOG).unwrap();

    let err = run(&job, &catalog).await.unwrap_err();

    assert!(matches!(err, ExtractError::Stage { .. }));
    assert_eq!(err.kind(), ErrorKind::DecryptionFailed);
    assert!(err.format_detailed().contains("PERMISSION_DENIED"));
}

#[tokio::test]
async fn test_unbound_parameter_fails_before_io() {
    let job = job(&plain_config("{ param: db_password }"), CountingKms::new());
    let catalog = Catalog::from_yaml(T_COPY_CATALOG).unwrap();

    let err = run(&job, &catalog).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ConfigurationMissing);
    assert_eq!(job.db.connects(), 0);
    assert!(job.warehouse.table_names().is_empty());
}

#[tokio::test]
async fn test_parameter_bound_after_build() {
    let job = job(&plain_config("{ param: db_password }"), CountingKms::new());
    let catalog = Catalog::from_yaml(T_COPY_CATALOG).unwrap();
    let graph = job.orchestrator.build(&catalog).unwrap();

    job.params.bind("db_password", "s3cret").unwrap();
    LocalEngine::new()
        .execute(graph, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(contents(&job.warehouse, "t_copy"), expected_ab());
}

#[tokio::test]
async fn test_wrong_password_is_connection_failure() {
    let job = job(&plain_config("wrong"), CountingKms::new());
    let catalog = Catalog::from_yaml(T_COPY_CATALOG).unwrap();

    let err = run(&job, &catalog).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
    assert!(err.is_retryable());
    assert!(job.warehouse.rows(&table("t_copy")).is_none());
}

#[tokio::test]
async fn test_missing_source_relation_is_query_failure() {
    let job = job(&plain_config("s3cret"), CountingKms::new());
    let catalog = Catalog::from_yaml(
        &T_COPY_CATALOG.replace("SELECT id, name FROM t", "SELECT id, name FROM missing"),
    )
    .unwrap();

    let err = run(&job, &catalog).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QueryExecutionFailed);
}

#[tokio::test]
async fn test_cancelled_run() {
    let job = job(&plain_config("s3cret"), CountingKms::new());
    let catalog = Catalog::from_yaml(THREE_TABLE_CATALOG).unwrap();
    let graph = job.orchestrator.build(&catalog).unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = LocalEngine::new().execute(graph, cancel).await.unwrap_err();

    assert!(matches!(err, ExtractError::Cancelled));
    assert_eq!(err.exit_code(), 130);
}

#[tokio::test]
async fn test_single_stage_at_a_time() {
    let job = job(&plain_config("s3cret"), CountingKms::new());
    let catalog = Catalog::from_yaml(THREE_TABLE_CATALOG).unwrap();
    let graph = job.orchestrator.build(&catalog).unwrap();

    let report = LocalEngine::new()
        .with_max_concurrent(Some(1))
        .execute(graph, CancellationToken::new())
        .await
        .unwrap();

    let names: Vec<_> = report.stages.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["users", "orders", "products"]);
    assert_eq!(report.rows_total, 6);
    assert!(report.to_json().unwrap().contains("\"rows_total\": 6"));
}

#[tokio::test]
async fn test_unknown_driver_class_fails_at_build() {
    let mut config = plain_config("s3cret");
    config.source.driver_class_name = catalog_extract::ParameterSpec::literal("com.mysql.jdbc.Driver");
    let job = job(&config, CountingKms::new());
    let catalog = Catalog::from_yaml(T_COPY_CATALOG).unwrap();

    let err = job.orchestrator.build(&catalog).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[tokio::test]
async fn test_check_connection_opens_and_closes() {
    let job = job(&plain_config("s3cret"), CountingKms::new());

    job.orchestrator.check_connection().await.unwrap();

    assert_eq!(job.db.connects(), 1);
    assert_eq!(job.db.closes.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_plan_describes_stages_without_io() {
    let job = job(&encrypted_config(), CountingKms::new());
    let catalog = Catalog::from_yaml(T_COPY_CATALOG).unwrap();

    let plan = job.orchestrator.build(&catalog).unwrap().plan();

    assert_eq!(plan.len(), 1);
    assert_eq!(plan[0].table, "analytics.t_copy");
    assert_eq!(plan[0].fields, vec!["id".to_string(), "name".to_string()]);
    assert_eq!(job.kms.calls(), 0);
    assert_eq!(job.db.connects(), 0);
}

/// Reader over a source that sends one row and then stalls.
fn stalled_reader(db: &Arc<FakeDatabase>, cancel: CancellationToken) -> RowStream {
    db.serve_then_stall("SELECT id, name FROM t", &["id", "name"], row(&[(1, "a")]));
    let source = DataSourceConfig::create(FAKE_DRIVER_CLASS, FAKE_URL).with_drivers(db.registry());
    DynamicReader::new(source, "SELECT id, name FROM t", Arc::new(LabelRowMapper::new()))
        .with_fetch_size(1)
        .read(cancel)
}

#[tokio::test]
async fn test_dropped_row_stream_releases_stalled_connection() {
    let db = FakeDatabase::new();
    let mut rows = stalled_reader(&db, CancellationToken::new());

    let first = rows.next().await.unwrap().unwrap();
    assert_eq!(first.get("id"), Some(&Value::Int(1)));
    assert_eq!(db.drops(), 0);

    drop(rows);
    assert!(db.wait_for_drops(1).await, "connection still held");
    assert_eq!(db.closes.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancel_during_read_releases_connection() {
    let db = FakeDatabase::new();
    let cancel = CancellationToken::new();
    let mut rows = stalled_reader(&db, cancel.clone());

    assert!(rows.next().await.unwrap().is_ok());
    assert_eq!(db.drops(), 0);

    cancel.cancel();
    assert!(matches!(rows.next().await, Some(Err(ExtractError::Cancelled))));
    assert!(rows.next().await.is_none());
    assert!(db.wait_for_drops(1).await, "connection still held");
}

#[tokio::test]
async fn test_cancelled_run_releases_stage_connection() {
    let job = job(&plain_config("s3cret"), CountingKms::new());
    job.db
        .serve_then_stall("SELECT id, name FROM t", &["id", "name"], row(&[(1, "a")]));
    let catalog = Catalog::from_yaml(T_COPY_CATALOG).unwrap();
    let graph = job.orchestrator.build(&catalog).unwrap();

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let handle =
        tokio::spawn(async move { LocalEngine::new().execute(graph, run_cancel).await });

    assert!(job.db.wait_for_connects(1).await, "stage never connected");
    cancel.cancel();
    let err = handle.await.unwrap().unwrap_err();

    assert!(matches!(err, ExtractError::Cancelled));
    assert!(job.db.wait_for_drops(1).await, "connection still held");
    assert!(job.warehouse.rows(&table("t_copy")).is_none());
}
