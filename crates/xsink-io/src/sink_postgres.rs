//! PostgreSQL sink: parameterized multi-row batch inserts.
//!
//! SQL goes through the narrow [`SqlGateway`] trait so tests can record
//! statements instead of opening connections; [`PgGateway`] is the
//! tokio-postgres implementation.
//!
//! Columnar tables get one column per top-level schema field plus an
//! auto-increment primary key and an insertion timestamp; nested and array
//! kinds land in JSONB, leaves in their native SQL types. Flattened tables
//! store the whole record as one JSON document in a single `data` column.
//! Identifiers are sanitized, lowercased and truncated to 63 characters.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::NoTls;
use tracing::{error, info, warn};

use xsink_core::{
    sanitize, ColumnNamer, DataKind, FieldDef, PostgresSpec, Record, RecordSink, SanitizeRules,
    Schema, TableShape, WriteMode, WriteSummary, XsinkError,
};

use crate::convert::{coerce_occurrence, format_decimal, Cell, JsonStyle};

/// PostgreSQL folds unquoted identifiers to lower case and truncates at 63
/// bytes; sanitizing the same way keeps names stable either way.
const PG_RULES: SanitizeRules = SanitizeRules::new(63, true);

/// One bound statement parameter in sink-neutral form.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null,
    Text(String),
    I32(i32),
    I64(i64),
    F64(f64),
    Bool(bool),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl ToSql for SqlParam {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            SqlParam::Null => Ok(IsNull::Yes),
            SqlParam::Text(v) => v.to_sql(ty, out),
            SqlParam::I32(v) => v.to_sql(ty, out),
            SqlParam::I64(v) => v.to_sql(ty, out),
            SqlParam::F64(v) => v.to_sql(ty, out),
            SqlParam::Bool(v) => v.to_sql(ty, out),
            SqlParam::Date(v) => v.to_sql(ty, out),
            SqlParam::Time(v) => v.to_sql(ty, out),
            SqlParam::Timestamp(v) => v.to_sql(ty, out),
            SqlParam::Json(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Narrow SQL execution surface of the sink.
#[async_trait]
pub trait SqlGateway: Send {
    async fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<u64>;
    async fn query_bool(&mut self, sql: &str, params: &[SqlParam]) -> Result<bool>;
}

/// tokio-postgres implementation of [`SqlGateway`].
pub struct PgGateway {
    client: tokio_postgres::Client,
}

impl PgGateway {
    pub async fn connect(spec: &PostgresSpec) -> Result<PgGateway> {
        let config = format!(
            "host={} port={} dbname={} user={} password={}",
            spec.host, spec.port, spec.dbname, spec.user, spec.password
        );
        let (client, connection) = tokio_postgres::connect(&config, NoTls)
            .await
            .map_err(|e| XsinkError::Sink(format!("postgres connection failed: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("postgres connection error: {e}");
            }
        });
        Ok(PgGateway { client })
    }
}

#[async_trait]
impl SqlGateway for PgGateway {
    async fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<u64> {
        let refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        self.client
            .execute(sql, &refs)
            .await
            .map_err(|e| XsinkError::Sink(format!("statement failed: {e}")).into())
    }

    async fn query_bool(&mut self, sql: &str, params: &[SqlParam]) -> Result<bool> {
        let refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let row = self
            .client
            .query_one(sql, &refs)
            .await
            .map_err(|e| XsinkError::Sink(format!("query failed: {e}")))?;
        Ok(row.get(0))
    }
}

struct PgColumn {
    source: String,
    name: String,
    sql_type: String,
    /// Explicit cast appended to the placeholder; NUMERIC binds as text.
    cast: &'static str,
    field: FieldDef,
}

pub struct PostgresSink {
    gateway: Box<dyn SqlGateway>,
    table: String,
    shape: TableShape,
    mode: WriteMode,
    create_table: bool,
    batch_size: usize,
    columns: Vec<PgColumn>,
    buffer: Vec<Vec<SqlParam>>,
    batch_index: u64,
    rows: u64,
    dropped: u64,
}

impl PostgresSink {
    pub fn new(schema: &Schema, spec: &PostgresSpec, gateway: Box<dyn SqlGateway>) -> PostgresSink {
        let mut namer = ColumnNamer::new(PG_RULES);
        let columns = schema
            .fields
            .iter()
            .map(|f| {
                let (sql_type, cast) = sql_type(f);
                PgColumn {
                    source: f.name.clone(),
                    name: namer.assign(&f.name),
                    sql_type,
                    cast,
                    field: f.clone(),
                }
            })
            .collect();
        PostgresSink {
            gateway,
            table: sanitize(&spec.table, &PG_RULES),
            shape: spec.shape,
            mode: spec.mode,
            create_table: spec.create_table,
            batch_size: spec.batch_size.max(1),
            columns,
            buffer: Vec::new(),
            batch_index: 0,
            rows: 0,
            dropped: 0,
        }
    }

    fn create_sql(&self) -> String {
        let mut columns = vec![
            "id BIGSERIAL PRIMARY KEY".to_string(),
            "loaded_at TIMESTAMPTZ NOT NULL DEFAULT now()".to_string(),
        ];
        match self.shape {
            TableShape::Columnar => {
                for col in &self.columns {
                    columns.push(format!("\"{}\" {}", col.name, col.sql_type));
                }
            }
            TableShape::Flattened => {
                columns.push("\"data\" JSONB".to_string());
            }
        }
        format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" ({})",
            self.table,
            columns.join(", ")
        )
    }

    fn insert_sql(&self, row_count: usize) -> String {
        let names: Vec<String> = match self.shape {
            TableShape::Columnar => self
                .columns
                .iter()
                .map(|c| format!("\"{}\"", c.name))
                .collect(),
            TableShape::Flattened => vec!["\"data\"".to_string()],
        };
        let width = names.len();
        let mut groups = Vec::with_capacity(row_count);
        for row in 0..row_count {
            let placeholders: Vec<String> = (0..width)
                .map(|col| {
                    let cast = match self.shape {
                        TableShape::Columnar => self.columns[col].cast,
                        TableShape::Flattened => "",
                    };
                    format!("${}{}", row * width + col + 1, cast)
                })
                .collect();
            groups.push(format!("({})", placeholders.join(", ")));
        }
        format!(
            "INSERT INTO \"{}\" ({}) VALUES {}",
            self.table,
            names.join(", "),
            groups.join(", ")
        )
    }

    async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let sql = self.insert_sql(self.buffer.len());
        let params: Vec<SqlParam> = self.buffer.drain(..).flatten().collect();
        let start_row = self.rows - params.len() as u64 / self.width() as u64;
        self.gateway
            .execute(&sql, &params)
            .await
            .with_context(|| {
                format!("batch {} (rows starting at {start_row})", self.batch_index)
            })?;
        self.batch_index += 1;
        Ok(())
    }

    fn width(&self) -> usize {
        match self.shape {
            TableShape::Columnar => self.columns.len().max(1),
            TableShape::Flattened => 1,
        }
    }

    fn columnar_params(&mut self, record: &Record) -> Vec<SqlParam> {
        let mut params = Vec::with_capacity(self.columns.len());
        let mut dropped = 0;
        for col in &self.columns {
            if col.source != record.name {
                params.push(SqlParam::Null);
                continue;
            }
            params.push(match coerce_pg(&col.field, &record.tree) {
                Ok(param) => param,
                Err(e) => {
                    warn!("dropping cell: {e}");
                    dropped += 1;
                    SqlParam::Null
                }
            });
        }
        self.dropped += dropped;
        params
    }
}

#[async_trait]
impl RecordSink for PostgresSink {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn begin(&mut self) -> Result<()> {
        let exists = self
            .gateway
            .query_bool(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = $1)",
                &[SqlParam::Text(self.table.clone())],
            )
            .await?;
        match (exists, self.mode) {
            (true, WriteMode::FailIfExists) => {
                return Err(XsinkError::Conflict(format!(
                    "table {} already exists",
                    self.table
                ))
                .into());
            }
            (true, WriteMode::Overwrite) => {
                self.gateway
                    .execute(&format!("TRUNCATE TABLE \"{}\"", self.table), &[])
                    .await?;
            }
            (false, _) if self.create_table => {
                let sql = self.create_sql();
                self.gateway.execute(&sql, &[]).await?;
            }
            (false, _) => {
                return Err(XsinkError::Sink(format!(
                    "table {} is missing and create_table is disabled",
                    self.table
                ))
                .into());
            }
            _ => {}
        }
        info!(table = %self.table, "postgres sink ready");
        Ok(())
    }

    async fn write(&mut self, record: Record) -> Result<()> {
        let params = match self.shape {
            TableShape::Columnar => self.columnar_params(&record),
            // The whole record as one JSON document.
            TableShape::Flattened => vec![SqlParam::Json(record.tree.to_json())],
        };
        self.buffer.push(params);
        self.rows += 1;
        if self.buffer.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<WriteSummary> {
        self.flush().await?;
        info!(table = %self.table, rows = self.rows, "postgres sink closed");
        Ok(WriteSummary {
            rows_written: self.rows,
            cells_dropped: self.dropped,
        })
    }
}

/// SQL column type for a field, plus the placeholder cast it needs. Nested
/// and array kinds map to JSONB; a repeating leaf still binds as its scalar
/// type, since each row carries exactly one record occurrence.
fn sql_type(field: &FieldDef) -> (String, &'static str) {
    match field.element_kind() {
        DataKind::Struct(_) | DataKind::Array(_) => ("JSONB".to_string(), ""),
        DataKind::Str => ("TEXT".to_string(), ""),
        DataKind::I32 => ("INTEGER".to_string(), ""),
        DataKind::I64 => ("BIGINT".to_string(), ""),
        DataKind::F64 => ("DOUBLE PRECISION".to_string(), ""),
        DataKind::Bool => ("BOOLEAN".to_string(), ""),
        DataKind::Date => ("DATE".to_string(), ""),
        DataKind::Time => ("TIME".to_string(), ""),
        DataKind::Timestamp => ("TIMESTAMPTZ".to_string(), ""),
        DataKind::Decimal { precision, scale } => {
            (format!("NUMERIC({precision},{scale})"), "::numeric")
        }
    }
}

/// Coerces one record occurrence into a bound parameter.
fn coerce_pg(field: &FieldDef, tree: &xsink_core::Value) -> Result<SqlParam, XsinkError> {
    match field.element_kind() {
        DataKind::Struct(_) | DataKind::Array(_) => Ok(SqlParam::Json(tree.to_json())),
        leaf => {
            let cell = coerce_occurrence(leaf, tree, &field.name, JsonStyle::Exact)?;
            Ok(match cell {
                Cell::Null => SqlParam::Null,
                Cell::Str(v) => SqlParam::Text(v),
                Cell::I32(v) => SqlParam::I32(v),
                Cell::I64(v) => SqlParam::I64(v),
                Cell::F64(v) => SqlParam::F64(v),
                Cell::Bool(v) => SqlParam::Bool(v),
                Cell::Date(v) => SqlParam::Date(v),
                Cell::Time(v) => SqlParam::Time(v),
                Cell::Timestamp(v) => SqlParam::Timestamp(v),
                Cell::Decimal { unscaled, scale } => {
                    SqlParam::Text(format_decimal(unscaled, scale))
                }
                Cell::Json(v) => SqlParam::Json(v),
                Cell::Repeated(_) => SqlParam::Json(tree.to_json()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};
    use xsink_core::{Value, TEXT_KEY};

    fn leaf(text: &str) -> Value {
        Value::Record(vec![(TEXT_KEY.to_string(), Value::Text(text.into()))])
    }

    #[derive(Debug, Default)]
    struct FakeState {
        exists: bool,
        rows: usize,
        executed: Vec<(String, Vec<SqlParam>)>,
    }

    #[derive(Clone, Default)]
    struct FakeGateway(Arc<Mutex<FakeState>>);

    impl FakeGateway {
        fn existing() -> FakeGateway {
            let fake = FakeGateway::default();
            fake.0.lock().unwrap().exists = true;
            fake
        }

        fn with_rows(rows: usize) -> FakeGateway {
            let fake = FakeGateway::existing();
            fake.0.lock().unwrap().rows = rows;
            fake
        }

        fn statements(&self) -> Vec<String> {
            self.0
                .lock()
                .unwrap()
                .executed
                .iter()
                .map(|(sql, _)| sql.clone())
                .collect()
        }

        fn rows(&self) -> usize {
            self.0.lock().unwrap().rows
        }
    }

    #[async_trait]
    impl SqlGateway for FakeGateway {
        async fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<u64> {
            let mut state = self.0.lock().unwrap();
            if sql.starts_with("TRUNCATE") {
                state.rows = 0;
            } else if sql.starts_with("INSERT") {
                state.rows += sql.matches("($").count();
            } else if sql.starts_with("CREATE") {
                state.exists = true;
            }
            state.executed.push((sql.to_string(), params.to_vec()));
            Ok(0)
        }
        async fn query_bool(&mut self, _sql: &str, _params: &[SqlParam]) -> Result<bool> {
            Ok(self.0.lock().unwrap().exists)
        }
    }

    fn spec(mode: WriteMode, shape: TableShape, batch_size: usize) -> PostgresSpec {
        PostgresSpec {
            host: "localhost".into(),
            port: 5432,
            dbname: "x".into(),
            user: "u".into(),
            password: String::new(),
            table: "People".into(),
            shape,
            mode,
            create_table: true,
            batch_size,
        }
    }

    fn age_schema(kind: DataKind) -> Schema {
        let mut schema = Schema::new("people");
        schema.fields.push(FieldDef::new("age", kind));
        schema
    }

    #[tokio::test]
    async fn creates_table_with_key_and_timestamp_columns() {
        let fake = FakeGateway::default();
        let mut sink = PostgresSink::new(
            &age_schema(DataKind::I32),
            &spec(WriteMode::Append, TableShape::Columnar, 500),
            Box::new(fake.clone()),
        );
        sink.begin().await.unwrap();
        let statements = fake.statements();
        assert_eq!(statements.len(), 1);
        let create = &statements[0];
        assert!(create.starts_with("CREATE TABLE IF NOT EXISTS \"people\""));
        assert!(create.contains("id BIGSERIAL PRIMARY KEY"));
        assert!(create.contains("loaded_at TIMESTAMPTZ NOT NULL DEFAULT now()"));
        assert!(create.contains("\"age\" INTEGER"));
    }

    #[tokio::test]
    async fn overwrite_truncates_then_inserts() {
        let fake = FakeGateway::existing();
        let mut sink = PostgresSink::new(
            &age_schema(DataKind::I32),
            &spec(WriteMode::Overwrite, TableShape::Columnar, 500),
            Box::new(fake.clone()),
        );
        sink.begin().await.unwrap();
        for n in ["1", "2", "3"] {
            sink.write(Record::new("age", leaf(n))).await.unwrap();
        }
        let summary = sink.finish().await.unwrap();
        assert_eq!(summary.rows_written, 3);

        let statements = fake.statements();
        assert_eq!(statements[0], "TRUNCATE TABLE \"people\"");
        assert!(statements[1].starts_with("INSERT INTO \"people\" (\"age\") VALUES"));
        let params = &fake.0.lock().unwrap().executed[1].1;
        assert_eq!(
            params,
            &vec![SqlParam::I32(1), SqlParam::I32(2), SqlParam::I32(3)]
        );
    }

    #[tokio::test]
    async fn overwrite_replaces_and_append_extends_existing_rows() {
        // A table pre-populated with 5 rows: an overwrite run with 3 records
        // leaves exactly 3, a subsequent append run leaves 8.
        let fake = FakeGateway::with_rows(5);
        let mut sink = PostgresSink::new(
            &age_schema(DataKind::I32),
            &spec(WriteMode::Overwrite, TableShape::Columnar, 500),
            Box::new(fake.clone()),
        );
        sink.begin().await.unwrap();
        for n in ["1", "2", "3"] {
            sink.write(Record::new("age", leaf(n))).await.unwrap();
        }
        sink.finish().await.unwrap();
        assert_eq!(fake.rows(), 3);

        let mut sink = PostgresSink::new(
            &age_schema(DataKind::I32),
            &spec(WriteMode::Append, TableShape::Columnar, 500),
            Box::new(fake.clone()),
        );
        sink.begin().await.unwrap();
        for n in ["4", "5", "6", "7", "8"] {
            sink.write(Record::new("age", leaf(n))).await.unwrap();
        }
        sink.finish().await.unwrap();
        assert_eq!(fake.rows(), 8);
    }

    #[tokio::test]
    async fn fail_if_exists_conflicts() {
        let fake = FakeGateway::existing();
        let mut sink = PostgresSink::new(
            &age_schema(DataKind::I32),
            &spec(WriteMode::FailIfExists, TableShape::Columnar, 500),
            Box::new(fake),
        );
        let err = sink.begin().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<XsinkError>(),
            Some(XsinkError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn widened_string_column_stores_conflicting_values_as_text() {
        // A type conflict widened to Str during inference lands in TEXT.
        let fake = FakeGateway::existing();
        let mut sink = PostgresSink::new(
            &age_schema(DataKind::Str),
            &spec(WriteMode::Append, TableShape::Columnar, 500),
            Box::new(fake.clone()),
        );
        assert_eq!(sink.columns[0].sql_type, "TEXT");
        sink.begin().await.unwrap();
        sink.write(Record::new("age", leaf("30"))).await.unwrap();
        sink.write(Record::new("age", leaf("thirty"))).await.unwrap();
        sink.finish().await.unwrap();

        let params = &fake.0.lock().unwrap().executed[0].1;
        assert_eq!(
            params,
            &vec![
                SqlParam::Text("30".into()),
                SqlParam::Text("thirty".into())
            ]
        );
    }

    #[tokio::test]
    async fn batches_split_with_numbered_placeholders() {
        let fake = FakeGateway::existing();
        let mut sink = PostgresSink::new(
            &age_schema(DataKind::I32),
            &spec(WriteMode::Append, TableShape::Columnar, 2),
            Box::new(fake.clone()),
        );
        sink.begin().await.unwrap();
        for n in ["1", "2", "3"] {
            sink.write(Record::new("age", leaf(n))).await.unwrap();
        }
        sink.finish().await.unwrap();

        let statements = fake.statements();
        assert!(statements[0].ends_with("VALUES ($1), ($2)"));
        assert!(statements[1].ends_with("VALUES ($1)"));
    }

    #[tokio::test]
    async fn nested_kinds_map_to_jsonb() {
        let kind = DataKind::Struct(vec![FieldDef::new("email", DataKind::Str)]);
        let fake = FakeGateway::default();
        let sink = PostgresSink::new(
            &age_schema(kind),
            &spec(WriteMode::Append, TableShape::Columnar, 500),
            Box::new(fake),
        );
        assert_eq!(sink.columns[0].sql_type, "JSONB");

        let decimal = FieldDef::new("price", DataKind::Decimal { precision: 10, scale: 2 });
        let (ty, cast) = sql_type(&decimal);
        assert_eq!(ty, "NUMERIC(10,2)");
        assert_eq!(cast, "::numeric");
    }

    #[tokio::test]
    async fn flattened_shape_stores_one_json_document_per_row() {
        let fake = FakeGateway::default();
        let mut sink = PostgresSink::new(
            &age_schema(DataKind::Str),
            &spec(WriteMode::Append, TableShape::Flattened, 500),
            Box::new(fake.clone()),
        );
        sink.begin().await.unwrap();
        let mut tree = Value::empty_record();
        tree.push_child("id", leaf("1"));
        sink.write(Record::new("user", tree)).await.unwrap();
        sink.finish().await.unwrap();

        let state = fake.0.lock().unwrap();
        assert!(state.executed[0].0.contains("\"data\" JSONB"));
        let (sql, params) = &state.executed[1];
        assert!(sql.starts_with("INSERT INTO \"people\" (\"data\") VALUES"));
        let SqlParam::Json(doc) = &params[0] else {
            panic!("expected json param");
        };
        assert_eq!(doc["id"][0]["#text"], "1");
    }

    #[tokio::test]
    async fn coercion_failure_drops_the_cell_and_counts_it() {
        let fake = FakeGateway::existing();
        let mut sink = PostgresSink::new(
            &age_schema(DataKind::I32),
            &spec(WriteMode::Append, TableShape::Columnar, 500),
            Box::new(fake.clone()),
        );
        sink.begin().await.unwrap();
        sink.write(Record::new("age", leaf("oops"))).await.unwrap();
        let summary = sink.finish().await.unwrap();
        assert_eq!(summary.rows_written, 1);
        assert_eq!(summary.cells_dropped, 1);
        let params = &fake.0.lock().unwrap().executed[0].1;
        assert_eq!(params, &vec![SqlParam::Null]);
    }
}
