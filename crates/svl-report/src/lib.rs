//! Reporting table, data dictionary and Parquet snapshot over the loaded survey store.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{Connection, Row};
use svl_storage::Store;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "svl-report";

pub const DEFAULT_TABLE: &str = "tabla_unificada_2025";
pub const DEFAULT_DICTIONARY_PATH: &str = "diccionario_datos_tabla_unificada.json";

const CATEGORICAL_COLUMNS: [&str; 2] = ["estado", "descripcion_calificacion"];
const EXAMPLE_VALUE_LIMIT: i64 = 10;
const DICTIONARY_SAMPLE_ROWS: i64 = 3;
const REPORT_SAMPLE_ROWS: i64 = 5;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("invalid table name {0:?}: use ASCII letters, digits and '_' only")]
    InvalidTableName(String),
    #[error("invalid report window: {0}")]
    InvalidWindow(String),
    #[error("table {0} does not exist; build the reporting table first")]
    MissingTable(String),
    #[error("{operation} on {table} failed: {source}")]
    Query {
        table: String,
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("decoding sample row from {table}: {source}")]
    SampleRow {
        table: String,
        #[source]
        source: serde_json::Error,
    },
}

fn query_err<'a>(
    table: &'a str,
    operation: &'static str,
) -> impl FnOnce(sqlx::Error) -> ReportError + 'a {
    move |source| ReportError::Query {
        table: table.to_string(),
        operation,
        source,
    }
}

/// Calendar year plus the months of `fecha_insercion` that belong in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportWindow {
    pub year: i32,
    pub months: Vec<u32>,
}

impl Default for ReportWindow {
    fn default() -> Self {
        Self {
            year: 2025,
            months: vec![6, 7, 8],
        }
    }
}

impl ReportWindow {
    pub fn new(year: i32, months: Vec<u32>) -> Result<Self, ReportError> {
        let window = Self { year, months };
        window.validate()?;
        Ok(window)
    }

    pub fn validate(&self) -> Result<(), ReportError> {
        if !(1..=9999).contains(&self.year) {
            return Err(ReportError::InvalidWindow(format!(
                "year {} out of range",
                self.year
            )));
        }
        if self.months.is_empty() {
            return Err(ReportError::InvalidWindow("no months selected".to_string()));
        }
        if let Some(month) = self.months.iter().find(|m| !(1..=12).contains(*m)) {
            return Err(ReportError::InvalidWindow(format!(
                "month {month} out of range"
            )));
        }
        Ok(())
    }

    /// Parse a comma list such as `6,7,8` or `06, 07`.
    pub fn parse_months(raw: &str) -> Result<Vec<u32>, ReportError> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<u32>()
                    .map_err(|_| ReportError::InvalidWindow(format!("month {s:?} is not a number")))
            })
            .collect()
    }

    fn year_literal(&self) -> String {
        format!("'{:04}'", self.year)
    }

    fn month_literals(&self) -> String {
        self.months
            .iter()
            .map(|m| format!("'{m:02}'"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for ReportWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let months = self
            .months
            .iter()
            .map(|m| format!("{m:02}"))
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "{:04}/{months}", self.year)
    }
}

#[derive(Debug, Clone)]
pub struct ReportConfig {
    pub table: String,
    pub window: ReportWindow,
    pub dictionary_path: PathBuf,
}

impl ReportConfig {
    pub fn from_env() -> Self {
        let defaults = ReportWindow::default();
        Self {
            table: std::env::var("SVL_REPORT_TABLE").unwrap_or_else(|_| DEFAULT_TABLE.to_string()),
            window: ReportWindow {
                year: std::env::var("SVL_REPORT_YEAR")
                    .ok()
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(defaults.year),
                months: std::env::var("SVL_REPORT_MONTHS")
                    .ok()
                    .and_then(|v| ReportWindow::parse_months(&v).ok())
                    .filter(|m| !m.is_empty())
                    .unwrap_or(defaults.months),
            },
            dictionary_path: std::env::var("SVL_DICTIONARY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_DICTIONARY_PATH)),
        }
    }
}

pub fn validate_table_name(table: &str) -> Result<(), ReportError> {
    if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ReportError::InvalidTableName(table.to_string()));
    }
    Ok(())
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn reporting_table_sql(table: &str, window: &ReportWindow) -> String {
    format!(
        r#"
        CREATE TABLE {table} AS
        SELECT
            e.id_encuesta,
            e.id_estado_encuesta,
            e.estado,
            e.id_cuestionario,
            e.descripcion_cuestionario,
            e.id_calificacion,
            dc.calificacion AS calificacion_valor,
            dc.descripcion AS descripcion_calificacion,
            e.fecha_limite,
            e.fecha_creado,
            e.hora_creado,
            e.fecha_modificado,
            e.hora_modificado,
            e.fecha_insercion,
            e.usuario_id,
            u.nombre AS nombre_usuario,
            u.telefono,
            u.email,
            strftime('%Y', e.fecha_insercion) AS "año",
            strftime('%m', e.fecha_insercion) AS mes,
            strftime('%Y-%m', e.fecha_insercion) AS "año_mes"
        FROM encuestas e
        INNER JOIN usuarios u ON e.usuario_id = u.id_usuario
        LEFT JOIN dimension_calificaciones dc ON e.id_calificacion = dc.id_calificacion
        WHERE strftime('%Y', e.fecha_insercion) = {year}
          AND strftime('%m', e.fecha_insercion) IN ({months})
          AND e.id_calificacion IS NOT NULL
        ORDER BY e.fecha_insercion DESC
        "#,
        table = quote_ident(table),
        year = window.year_literal(),
        months = window.month_literals(),
    )
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportSampleRow {
    pub id: i64,
    pub user_name: Option<String>,
    pub email: Option<String>,
    pub rating_value: Option<i64>,
    pub inserted_on: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportSummary {
    pub table: String,
    pub window: ReportWindow,
    pub total_rows: i64,
    pub unique_users: i64,
    pub average_rating: Option<f64>,
    pub sample: Vec<ReportSampleRow>,
}

async fn table_exists(conn: &mut SqliteConnection, table: &str) -> Result<bool, ReportError> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1")
            .bind(table)
            .fetch_one(&mut *conn)
            .await
            .map_err(query_err(table, "looking up table"))?;
    Ok(count > 0)
}

async fn require_table(conn: &mut SqliteConnection, table: &str) -> Result<(), ReportError> {
    validate_table_name(table)?;
    if !table_exists(conn, table).await? {
        return Err(ReportError::MissingTable(table.to_string()));
    }
    Ok(())
}

/// Drop and recreate `table` from the survey, user and rating tables for `window`.
///
/// Only rated surveys of known users are kept, newest `fecha_insercion` first.
/// The drop and create share one transaction, so a failed rebuild keeps the
/// previous table.
pub async fn build_reporting_table(
    store: &mut Store,
    table: &str,
    window: &ReportWindow,
) -> Result<ReportSummary, ReportError> {
    validate_table_name(table)?;
    window.validate()?;
    let conn = store.connection();

    let mut tx = conn
        .begin()
        .await
        .map_err(query_err(table, "starting report rebuild"))?;
    sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)))
        .execute(&mut *tx)
        .await
        .map_err(query_err(table, "dropping previous report"))?;
    sqlx::query(&reporting_table_sql(table, window))
        .execute(&mut *tx)
        .await
        .map_err(query_err(table, "creating reporting table"))?;
    tx.commit()
        .await
        .map_err(query_err(table, "committing report rebuild"))?;

    let summary = summarize(conn, table, window.clone()).await?;
    info!(
        table,
        window = %window,
        rows = summary.total_rows,
        unique_users = summary.unique_users,
        average_rating = ?summary.average_rating,
        "reporting table rebuilt"
    );
    Ok(summary)
}

async fn summarize(
    conn: &mut SqliteConnection,
    table: &str,
    window: ReportWindow,
) -> Result<ReportSummary, ReportError> {
    let quoted = quote_ident(table);
    let row = sqlx::query(&format!(
        "SELECT COUNT(*) AS total_rows, COUNT(DISTINCT usuario_id) AS unique_users, AVG(calificacion_valor) AS average_rating FROM {quoted}"
    ))
    .fetch_one(&mut *conn)
    .await
    .map_err(query_err(table, "summarizing report"))?;

    let total_rows: i64 = row
        .try_get("total_rows")
        .map_err(query_err(table, "decoding report summary"))?;
    let unique_users: i64 = row
        .try_get("unique_users")
        .map_err(query_err(table, "decoding report summary"))?;
    let average_rating: Option<f64> = row
        .try_get("average_rating")
        .map_err(query_err(table, "decoding report summary"))?;

    let rows = sqlx::query(&format!(
        "SELECT id_encuesta, nombre_usuario, email, calificacion_valor, fecha_insercion FROM {quoted} LIMIT {REPORT_SAMPLE_ROWS}"
    ))
    .fetch_all(&mut *conn)
    .await
    .map_err(query_err(table, "sampling report"))?;

    let sample = rows
        .iter()
        .map(sample_row)
        .collect::<Result<Vec<_>, _>>()
        .map_err(query_err(table, "decoding report sample"))?;

    Ok(ReportSummary {
        table: table.to_string(),
        window,
        total_rows,
        unique_users,
        average_rating,
        sample,
    })
}

fn sample_row(row: &SqliteRow) -> Result<ReportSampleRow, sqlx::Error> {
    Ok(ReportSampleRow {
        id: row.try_get("id_encuesta")?,
        user_name: row.try_get("nombre_usuario")?,
        email: row.try_get("email")?,
        rating_value: row.try_get("calificacion_valor")?,
        inserted_on: row.try_get("fecha_insercion")?,
    })
}

/// One column as reported by `pragma_table_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TableColumn {
    position: i64,
    name: String,
    declared_type: String,
    not_null: bool,
    default_value: Option<String>,
    primary_key: bool,
}

async fn table_columns(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<Vec<TableColumn>, ReportError> {
    let rows = sqlx::query(
        r#"SELECT cid, name, type, "notnull", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid"#,
    )
    .bind(table)
    .fetch_all(&mut *conn)
    .await
    .map_err(query_err(table, "reading table info"))?;

    rows.iter()
        .map(|row| -> Result<TableColumn, sqlx::Error> {
            Ok(TableColumn {
                position: row.try_get("cid")?,
                name: row.try_get("name")?,
                declared_type: row.try_get("type")?,
                not_null: row.try_get::<i64, _>("notnull")? != 0,
                default_value: row.try_get("dflt_value")?,
                primary_key: row.try_get::<i64, _>("pk")? != 0,
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(query_err(table, "decoding table info"))
}

fn column_description(name: &str) -> &'static str {
    match name {
        "id_encuesta" => "Unique survey identifier (autoincrement)",
        "id_estado_encuesta" => "Source identifier of the survey state",
        "estado" => "Current survey state",
        "id_cuestionario" => "Questionnaire type identifier",
        "descripcion_cuestionario" => "Questionnaire type description",
        "id_calificacion" => "Rating identifier, references the rating dimension",
        "calificacion_valor" => "Numeric rating value (1-5)",
        "descripcion_calificacion" => "Rating description",
        "fecha_limite" => "Deadline to answer the survey",
        "fecha_creado" => "Creation date of the source record",
        "hora_creado" => "Creation time of the source record",
        "fecha_modificado" => "Last modification date",
        "hora_modificado" => "Last modification time",
        "fecha_insercion" => "Insertion timestamp in the source system",
        "usuario_id" => "Identifier of the responding user",
        "nombre_usuario" => "User name",
        "telefono" => "User phone number",
        "email" => "User email address",
        "año" => "Year taken from fecha_insercion",
        "mes" => "Month taken from fecha_insercion",
        "año_mes" => "Year and month as YYYY-MM",
        _ => "No description defined",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DictionaryStatistics {
    pub unique_users: i64,
    pub questionnaire_types: i64,
    /// Rounded to two decimals, `0` for an empty table.
    pub average_rating: f64,
    pub first_inserted_on: Option<String>,
    pub last_inserted_on: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DictionaryMetadata {
    pub table: String,
    pub description: String,
    pub generated_at: DateTime<Utc>,
    pub total_rows: i64,
    pub statistics: DictionaryStatistics,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub position: i64,
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default_value: Option<String>,
    pub primary_key: bool,
    pub description: String,
    pub example_values: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataDictionary {
    pub metadata: DictionaryMetadata,
    pub columns: Vec<ColumnInfo>,
    pub sample_rows: Vec<serde_json::Value>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Describe an existing reporting table: columns, statistics and a few sample rows.
pub async fn describe_table(store: &mut Store, table: &str) -> Result<DataDictionary, ReportError> {
    let conn = store.connection();
    require_table(conn, table).await?;
    let quoted = quote_ident(table);

    let row = sqlx::query(&format!(
        r#"
        SELECT COUNT(*) AS total_rows,
               COUNT(DISTINCT usuario_id) AS unique_users,
               COUNT(DISTINCT id_cuestionario) AS questionnaire_types,
               AVG(calificacion_valor) AS average_rating,
               MIN(fecha_insercion) AS first_inserted_on,
               MAX(fecha_insercion) AS last_inserted_on
          FROM {quoted}
        "#
    ))
    .fetch_one(&mut *conn)
    .await
    .map_err(query_err(table, "reading dictionary statistics"))?;

    let stats_err = || query_err(table, "decoding dictionary statistics");
    let total_rows: i64 = row.try_get("total_rows").map_err(stats_err())?;
    let statistics = DictionaryStatistics {
        unique_users: row.try_get("unique_users").map_err(stats_err())?,
        questionnaire_types: row.try_get("questionnaire_types").map_err(stats_err())?,
        average_rating: row
            .try_get::<Option<f64>, _>("average_rating")
            .map_err(stats_err())?
            .map(round2)
            .unwrap_or(0.0),
        first_inserted_on: row.try_get("first_inserted_on").map_err(stats_err())?,
        last_inserted_on: row.try_get("last_inserted_on").map_err(stats_err())?,
    };

    let mut columns = Vec::new();
    for column in table_columns(conn, table).await? {
        let example_values = if CATEGORICAL_COLUMNS.contains(&column.name.as_str()) {
            let name = quote_ident(&column.name);
            let values: Vec<String> = sqlx::query_scalar(&format!(
                "SELECT DISTINCT CAST({name} AS TEXT) FROM {quoted} WHERE {name} IS NOT NULL LIMIT {EXAMPLE_VALUE_LIMIT}"
            ))
            .fetch_all(&mut *conn)
            .await
            .map_err(query_err(table, "reading example values"))?;
            Some(values)
        } else {
            None
        };
        columns.push(ColumnInfo {
            position: column.position,
            description: column_description(&column.name).to_string(),
            name: column.name,
            data_type: column.declared_type,
            nullable: !column.not_null,
            default_value: column.default_value,
            primary_key: column.primary_key,
            example_values,
        });
    }

    let object_args = columns
        .iter()
        .map(|c| format!("{}, {}", quote_literal(&c.name), quote_ident(&c.name)))
        .collect::<Vec<_>>()
        .join(", ");
    let raw_rows: Vec<String> = sqlx::query_scalar(&format!(
        "SELECT json_object({object_args}) FROM {quoted} LIMIT {DICTIONARY_SAMPLE_ROWS}"
    ))
    .fetch_all(&mut *conn)
    .await
    .map_err(query_err(table, "sampling rows"))?;
    let sample_rows = raw_rows
        .iter()
        .map(|raw| serde_json::from_str(raw))
        .collect::<Result<Vec<serde_json::Value>, _>>()
        .map_err(|source| ReportError::SampleRow {
            table: table.to_string(),
            source,
        })?;

    debug!(table, columns = columns.len(), "described reporting table");
    Ok(DataDictionary {
        metadata: DictionaryMetadata {
            table: table.to_string(),
            description: "Rated survey responses joined with their user and rating description"
                .to_string(),
            generated_at: Utc::now(),
            total_rows,
            statistics,
        },
        columns,
        sample_rows,
    })
}

/// Describe `table` and write the dictionary as pretty JSON to `output`.
pub async fn export_dictionary(store: &mut Store, table: &str, output: &Path) -> Result<DataDictionary> {
    let dictionary = describe_table(store, table).await?;

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let bytes = serde_json::to_vec_pretty(&dictionary).context("serializing data dictionary")?;
    fs::write(output, bytes)
        .await
        .with_context(|| format!("writing {}", output.display()))?;

    info!(
        table,
        path = %output.display(),
        rows = dictionary.metadata.total_rows,
        "data dictionary written"
    );
    Ok(dictionary)
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub table: String,
    pub generated_at: DateTime<Utc>,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Integer,
    Real,
    Text,
}

impl ColumnKind {
    /// SQLite affinity of a declared column type; untyped columns are exported as text.
    fn from_declared(declared: &str) -> Self {
        let upper = declared.to_ascii_uppercase();
        if upper.contains("INT") {
            ColumnKind::Integer
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            ColumnKind::Real
        } else {
            ColumnKind::Text
        }
    }

    fn sql_cast(self) -> &'static str {
        match self {
            ColumnKind::Integer => "INTEGER",
            ColumnKind::Real => "REAL",
            ColumnKind::Text => "TEXT",
        }
    }

    fn arrow_type(self) -> DataType {
        match self {
            ColumnKind::Integer => DataType::Int64,
            ColumnKind::Real => DataType::Float64,
            ColumnKind::Text => DataType::Utf8,
        }
    }
}

fn column_array(rows: &[SqliteRow], index: usize, kind: ColumnKind) -> Result<ArrayRef, sqlx::Error> {
    Ok(match kind {
        ColumnKind::Integer => Arc::new(Int64Array::from(
            rows.iter()
                .map(|r| r.try_get::<Option<i64>, _>(index))
                .collect::<Result<Vec<_>, _>>()?,
        )),
        ColumnKind::Real => Arc::new(Float64Array::from(
            rows.iter()
                .map(|r| r.try_get::<Option<f64>, _>(index))
                .collect::<Result<Vec<_>, _>>()?,
        )),
        ColumnKind::Text => Arc::new(StringArray::from(
            rows.iter()
                .map(|r| r.try_get::<Option<String>, _>(index))
                .collect::<Result<Vec<_>, _>>()?,
        )),
    })
}

/// Write `table` to `<reports_dir>/snapshots/<table>.parquet` plus a `manifest.json`.
pub async fn export_parquet_snapshot(store: &mut Store, table: &str, reports_dir: &Path) -> Result<PathBuf> {
    let conn = store.connection();
    require_table(conn, table).await?;
    let columns = table_columns(conn, table).await?;
    let kinds = columns
        .iter()
        .map(|c| ColumnKind::from_declared(&c.declared_type))
        .collect::<Vec<_>>();

    let select_list = columns
        .iter()
        .zip(&kinds)
        .map(|(c, kind)| format!("CAST({} AS {})", quote_ident(&c.name), kind.sql_cast()))
        .collect::<Vec<_>>()
        .join(", ");
    let rows = sqlx::query(&format!("SELECT {select_list} FROM {}", quote_ident(table)))
        .fetch_all(&mut *conn)
        .await
        .with_context(|| format!("reading {table} for snapshot"))?;

    let schema = Arc::new(Schema::new(
        columns
            .iter()
            .zip(&kinds)
            .map(|(c, kind)| ArrowField::new(c.name.as_str(), kind.arrow_type(), true))
            .collect::<Vec<_>>(),
    ));
    let arrays = kinds
        .iter()
        .enumerate()
        .map(|(index, kind)| column_array(&rows, index, *kind))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("decoding {table} rows"))?;
    let batch = RecordBatch::try_new(schema, arrays)
        .with_context(|| format!("building {table} record batch"))?;

    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;
    let parquet_path = snapshot_dir.join(format!("{table}.parquet"));
    write_parquet(&parquet_path, batch)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        table: table.to_string(),
        generated_at: Utc::now(),
        files: vec![manifest_entry(table, reports_dir, &parquet_path, rows.len())?],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(table, rows = rows.len(), path = %parquet_path.display(), "parquet snapshot written");
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path, rows: usize) -> Result<SnapshotFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(SnapshotFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parquet::file::reader::{FileReader, SerializedFileReader};
    use svl_core::{NewSurvey, RatingDimension, User};
    use tempfile::tempdir;

    fn survey(user_id: i64, inserted_on: &str, rating_id: Option<i64>) -> NewSurvey {
        NewSurvey {
            status_id: Some(2),
            status: "Cerrada".into(),
            questionnaire_id: Some(10),
            questionnaire_description: "Satisfaccion".into(),
            rating_id,
            due_date: String::new(),
            created_date: inserted_on[..10].to_string(),
            created_time: String::new(),
            modified_date: String::new(),
            modified_time: String::new(),
            inserted_on: inserted_on.to_string(),
            user_id,
            dedup_key: format!("{user_id}-{inserted_on}-{rating_id:?}"),
        }
    }

    async fn seeded_store() -> Store {
        let mut store = Store::open_in_memory().await.expect("open");
        store.bootstrap_schema().await.expect("schema");
        store
            .replace_users(&[
                User {
                    id: 1,
                    name: "Ana".into(),
                    phone: Some("555-0001".into()),
                    email: Some("ana@x.com".into()),
                },
                User {
                    id: 2,
                    name: "Luis".into(),
                    phone: None,
                    email: None,
                },
            ])
            .await
            .expect("users");
        store
            .replace_ratings(
                &[(1, "Muy insatisfecho"), (2, "Insatisfecho"), (3, "Neutral"), (4, "Satisfecho"), (5, "Muy satisfecho")]
                    .map(|(id, description)| RatingDimension {
                        id,
                        rating: Some(id),
                        description: description.into(),
                    }),
            )
            .await
            .expect("ratings");

        let mut batch = store.begin_surveys().await.expect("begin");
        for row in [
            survey(1, "2025-07-15 10:00:00", Some(5)),
            survey(1, "2025-05-01 09:00:00", Some(4)),
            survey(2, "2025-08-20 12:00:00", None),
            survey(2, "2024-07-10 08:00:00", Some(3)),
            survey(2, "2025-06-02 08:00:00", Some(2)),
        ] {
            batch.insert(&row).await.expect("insert");
        }
        batch.commit().await.expect("commit");
        store
    }

    #[test]
    fn table_names_are_restricted() {
        assert!(validate_table_name("tabla_unificada_2025").is_ok());
        assert!(matches!(
            validate_table_name("tabla; DROP TABLE encuestas"),
            Err(ReportError::InvalidTableName(_))
        ));
        assert!(validate_table_name("").is_err());
    }

    #[test]
    fn window_months_parse_and_validate() {
        assert_eq!(ReportWindow::parse_months("06, 7,8").expect("months"), vec![6, 7, 8]);
        assert!(ReportWindow::parse_months("6,x").is_err());
        assert!(ReportWindow::new(2025, vec![13]).is_err());
        assert!(ReportWindow::new(2025, vec![]).is_err());
        assert_eq!(ReportWindow::default().to_string(), "2025/06,07,08");
        assert_eq!(ReportWindow::default().month_literals(), "'06', '07', '08'");
    }

    #[tokio::test]
    async fn reporting_table_keeps_rated_rows_inside_the_window() {
        let mut store = seeded_store().await;
        let summary = build_reporting_table(&mut store, DEFAULT_TABLE, &ReportWindow::default())
            .await
            .expect("report");

        assert_eq!(summary.total_rows, 2);
        assert_eq!(summary.unique_users, 2);
        assert_eq!(summary.average_rating, Some(3.5));
        assert_eq!(summary.sample[0].inserted_on.as_deref(), Some("2025-07-15 10:00:00"));
        assert_eq!(summary.sample[0].user_name.as_deref(), Some("Ana"));
        assert_eq!(summary.sample[0].rating_value, Some(5));

        let may_rows: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tabla_unificada_2025 WHERE fecha_insercion LIKE '2025-05-%'",
        )
        .fetch_one(store.connection())
        .await
        .expect("count");
        assert_eq!(may_rows, 0);

        let year_month: String = sqlx::query_scalar(
            r#"SELECT "año_mes" FROM tabla_unificada_2025 ORDER BY fecha_insercion DESC LIMIT 1"#,
        )
        .fetch_one(store.connection())
        .await
        .expect("year month");
        assert_eq!(year_month, "2025-07");
    }

    #[tokio::test]
    async fn rebuilding_replaces_the_previous_table() {
        let mut store = seeded_store().await;
        build_reporting_table(&mut store, DEFAULT_TABLE, &ReportWindow::default())
            .await
            .expect("first report");
        let may = ReportWindow::new(2025, vec![5]).expect("window");
        let summary = build_reporting_table(&mut store, DEFAULT_TABLE, &may)
            .await
            .expect("second report");

        assert_eq!(summary.total_rows, 1);
        assert_eq!(summary.sample[0].rating_value, Some(4));
    }

    #[tokio::test]
    async fn date_only_insertion_dates_fall_in_their_month() {
        let mut store = Store::open_in_memory().await.expect("open");
        store.bootstrap_schema().await.expect("schema");
        store
            .replace_users(&[User {
                id: 1,
                name: "Ana".into(),
                phone: None,
                email: None,
            }])
            .await
            .expect("users");
        store
            .replace_ratings(&[RatingDimension {
                id: 4,
                rating: Some(4),
                description: "Satisfecho".into(),
            }])
            .await
            .expect("ratings");
        let mut batch = store.begin_surveys().await.expect("begin");
        for row in [survey(1, "2025-07-15", Some(4)), survey(1, "2025-05-01", Some(4))] {
            batch.insert(&row).await.expect("insert");
        }
        batch.commit().await.expect("commit");

        let summary = build_reporting_table(&mut store, DEFAULT_TABLE, &ReportWindow::default())
            .await
            .expect("report");
        assert_eq!(summary.total_rows, 1);
        assert_eq!(summary.sample[0].inserted_on.as_deref(), Some("2025-07-15"));
    }

    #[tokio::test]
    async fn dictionary_requires_the_reporting_table() {
        let mut store = seeded_store().await;
        let err = describe_table(&mut store, DEFAULT_TABLE)
            .await
            .expect_err("missing table");
        assert!(matches!(err, ReportError::MissingTable(_)));
        assert!(err.to_string().contains(DEFAULT_TABLE));
    }

    #[tokio::test]
    async fn dictionary_lists_every_reporting_column() {
        let mut store = seeded_store().await;
        build_reporting_table(&mut store, DEFAULT_TABLE, &ReportWindow::default())
            .await
            .expect("report");

        let dir = tempdir().expect("tempdir");
        let output = dir.path().join("out").join(DEFAULT_DICTIONARY_PATH);
        let dictionary = export_dictionary(&mut store, DEFAULT_TABLE, &output)
            .await
            .expect("dictionary");

        let names: Vec<&str> = dictionary.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names.len(), 21);
        assert_eq!(names[0], "id_encuesta");
        assert_eq!(names[20], "año_mes");
        assert!(dictionary.columns.iter().enumerate().all(|(i, c)| c.position == i as i64));

        let estado = &dictionary.columns[2];
        assert_eq!(estado.example_values.as_deref(), Some(&["Cerrada".to_string()][..]));
        let descriptions = dictionary
            .columns
            .iter()
            .find(|c| c.name == "descripcion_calificacion")
            .and_then(|c| c.example_values.clone())
            .expect("rating descriptions");
        assert_eq!(descriptions.len(), 2);
        assert!(dictionary.columns[0].example_values.is_none());
        assert_eq!(dictionary.columns[18].description, "Year taken from fecha_insercion");

        let stats = &dictionary.metadata.statistics;
        assert_eq!(dictionary.metadata.total_rows, 2);
        assert_eq!(stats.unique_users, 2);
        assert_eq!(stats.questionnaire_types, 1);
        assert_eq!(stats.average_rating, 3.5);
        assert_eq!(stats.first_inserted_on.as_deref(), Some("2025-06-02 08:00:00"));
        assert_eq!(stats.last_inserted_on.as_deref(), Some("2025-07-15 10:00:00"));

        assert_eq!(dictionary.sample_rows.len(), 2);
        assert_eq!(dictionary.sample_rows[0]["nombre_usuario"], "Ana");

        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&output).expect("read")).expect("json");
        assert_eq!(written["columns"].as_array().map(Vec::len), Some(21));
        assert_eq!(written["metadata"]["table"], DEFAULT_TABLE);
    }

    #[tokio::test]
    async fn empty_reporting_table_averages_to_zero() {
        let mut store = seeded_store().await;
        let window = ReportWindow::new(2023, vec![1]).expect("window");
        let summary = build_reporting_table(&mut store, DEFAULT_TABLE, &window)
            .await
            .expect("report");
        assert_eq!(summary.total_rows, 0);
        assert_eq!(summary.average_rating, None);

        let dictionary = describe_table(&mut store, DEFAULT_TABLE)
            .await
            .expect("dictionary");
        assert_eq!(dictionary.metadata.statistics.average_rating, 0.0);
        assert!(dictionary.sample_rows.is_empty());
        assert_eq!(dictionary.columns.len(), 21);
    }

    #[tokio::test]
    async fn parquet_snapshot_matches_its_manifest() {
        let mut store = seeded_store().await;
        build_reporting_table(&mut store, DEFAULT_TABLE, &ReportWindow::default())
            .await
            .expect("report");

        let dir = tempdir().expect("tempdir");
        let manifest_path = export_parquet_snapshot(&mut store, DEFAULT_TABLE, dir.path())
            .await
            .expect("snapshot");

        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&manifest_path).expect("manifest")).expect("json");
        let entry = &manifest["files"][0];
        assert_eq!(entry["rows"], 2);
        let parquet_path = dir.path().join(entry["path"].as_str().expect("path"));
        let bytes = std::fs::read(&parquet_path).expect("parquet");
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        assert_eq!(entry["sha256"], hex::encode(hasher.finalize()));

        let reader = SerializedFileReader::new(File::open(&parquet_path).expect("open")).expect("reader");
        assert_eq!(reader.metadata().file_metadata().num_rows(), 2);
        assert_eq!(reader.metadata().file_metadata().schema_descr().num_columns(), 21);
    }
}
