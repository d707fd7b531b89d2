//! SQLite persistence for users, the rating dimension and survey responses.
//!
//! One [`Store`] wraps a single connection. Foreign keys are enforced on every
//! connection and survey inserts go through a [`SurveyBatch`] transaction so the
//! duplicate lookup sees rows written earlier in the same batch.

use std::str::FromStr;

use serde::Serialize;
use sqlx::error::ErrorKind;
use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection, Row, Transaction};
use svl_core::{NewSurvey, RatingDimension, SurveyResponse, User};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "svl-storage";

pub const USERS_TABLE: &str = "usuarios";
pub const RATINGS_TABLE: &str = "dimension_calificaciones";
pub const SURVEYS_TABLE: &str = "encuestas";

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS usuarios (
        id_usuario INTEGER PRIMARY KEY,
        nombre TEXT NOT NULL,
        telefono TEXT,
        email TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dimension_calificaciones (
        id_calificacion INTEGER PRIMARY KEY,
        calificacion INTEGER,
        descripcion TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS encuestas (
        id_encuesta INTEGER PRIMARY KEY AUTOINCREMENT,
        id_estado_encuesta INTEGER,
        estado TEXT,
        id_cuestionario INTEGER,
        descripcion_cuestionario TEXT,
        id_calificacion INTEGER,
        fecha_limite TEXT,
        fecha_creado TEXT,
        hora_creado TEXT,
        fecha_modificado TEXT,
        hora_modificado TEXT,
        fecha_insercion TEXT,
        usuario_id INTEGER NOT NULL,
        hash_unico TEXT NOT NULL UNIQUE,
        FOREIGN KEY (usuario_id) REFERENCES usuarios (id_usuario),
        FOREIGN KEY (id_calificacion) REFERENCES dimension_calificaciones (id_calificacion)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_encuestas_fecha_insercion ON encuestas (fecha_insercion)",
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid database url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("connecting to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("{operation} failed: {source}")]
    Query {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("{operation} for {key} failed: {source}")]
    Record {
        operation: &'static str,
        key: String,
        #[source]
        source: sqlx::Error,
    },
}

impl StoreError {
    fn sqlx_source(&self) -> &sqlx::Error {
        match self {
            StoreError::InvalidUrl { source, .. }
            | StoreError::Connect { source, .. }
            | StoreError::Query { source, .. }
            | StoreError::Record { source, .. } => source,
        }
    }

    fn kind(&self) -> Option<ErrorKind> {
        self.sqlx_source().as_database_error().map(|e| e.kind())
    }

    pub fn is_foreign_key_violation(&self) -> bool {
        matches!(self.kind(), Some(ErrorKind::ForeignKeyViolation))
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self.kind(), Some(ErrorKind::UniqueViolation))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

fn query_err(operation: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |source| StoreError::Query { operation, source }
}

fn record_err(operation: &'static str, key: String) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |source| StoreError::Record {
        operation,
        key,
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TableCounts {
    pub users: i64,
    pub ratings: i64,
    pub surveys: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SurveyIdStats {
    pub min_id: Option<i64>,
    pub max_id: Option<i64>,
    pub total: i64,
    pub distinct: i64,
}

impl SurveyIdStats {
    pub fn all_unique(&self) -> bool {
        self.total == self.distinct
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SurveySample {
    pub id: i64,
    pub status_id: Option<i64>,
    pub status: Option<String>,
    pub rating_id: Option<i64>,
    pub user_name: Option<String>,
    pub inserted_on: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub counts: TableCounts,
    pub survey_ids: SurveyIdStats,
    pub samples: Vec<SurveySample>,
}

pub struct Store {
    conn: SqliteConnection,
    url: String,
}

impl Store {
    /// Open (creating if missing) the database at `url`, e.g. `sqlite:encuestas.db`.
    pub async fn open(url: &str) -> Result<Self> {
        Self::connect(url, true).await
    }

    /// Open a database that must already exist; nothing is created on disk.
    pub async fn open_existing(url: &str) -> Result<Self> {
        Self::connect(url, false).await
    }

    async fn connect(url: &str, create_if_missing: bool) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|source| StoreError::InvalidUrl {
                url: url.to_string(),
                source,
            })?
            .create_if_missing(create_if_missing)
            .foreign_keys(true);
        let conn = options.connect().await.map_err(|source| StoreError::Connect {
            url: url.to_string(),
            source,
        })?;
        debug!(url, "opened store connection");
        Ok(Self {
            conn,
            url: url.to_string(),
        })
    }

    pub async fn open_in_memory() -> Result<Self> {
        Self::open("sqlite::memory:").await
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Raw connection for read-only collaborators such as reporting.
    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }

    /// Create the three tables when absent. Safe to run on every start.
    pub async fn bootstrap_schema(&mut self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&mut self.conn)
                .await
                .map_err(query_err("creating schema"))?;
        }
        info!(url = %self.url, "schema ready");
        Ok(())
    }

    /// Clear and reinsert every user in one transaction.
    ///
    /// Foreign-key checks are deferred to commit, so surveys may keep pointing at
    /// users that are deleted and reinserted here. A user that disappears while
    /// still referenced fails the commit and the previous users stay in place.
    pub async fn replace_users(&mut self, users: &[User]) -> Result<usize> {
        let mut tx = self
            .conn
            .begin()
            .await
            .map_err(query_err("starting user replacement"))?;
        defer_foreign_keys(&mut tx).await?;
        sqlx::query("DELETE FROM usuarios")
            .execute(&mut *tx)
            .await
            .map_err(query_err("clearing users"))?;

        for user in users {
            sqlx::query(
                "INSERT INTO usuarios (id_usuario, nombre, telefono, email) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(user.id)
            .bind(&user.name)
            .bind(user.phone.as_deref())
            .bind(user.email.as_deref())
            .execute(&mut *tx)
            .await
            .map_err(record_err("inserting user", format!("id_usuario={}", user.id)))?;
        }

        tx.commit()
            .await
            .map_err(query_err("committing user replacement"))?;
        Ok(users.len())
    }

    /// Clear and reinsert the rating dimension, with the same deferred checks as users.
    pub async fn replace_ratings(&mut self, ratings: &[RatingDimension]) -> Result<usize> {
        let mut tx = self
            .conn
            .begin()
            .await
            .map_err(query_err("starting rating replacement"))?;
        defer_foreign_keys(&mut tx).await?;
        sqlx::query("DELETE FROM dimension_calificaciones")
            .execute(&mut *tx)
            .await
            .map_err(query_err("clearing ratings"))?;

        for rating in ratings {
            sqlx::query(
                "INSERT INTO dimension_calificaciones (id_calificacion, calificacion, descripcion) VALUES (?1, ?2, ?3)",
            )
            .bind(rating.id)
            .bind(rating.rating)
            .bind(&rating.description)
            .execute(&mut *tx)
            .await
            .map_err(record_err(
                "inserting rating",
                format!("id_calificacion={}", rating.id),
            ))?;
        }

        tx.commit()
            .await
            .map_err(query_err("committing rating replacement"))?;
        Ok(ratings.len())
    }

    pub async fn begin_surveys(&mut self) -> Result<SurveyBatch<'_>> {
        let tx = self
            .conn
            .begin()
            .await
            .map_err(query_err("starting survey batch"))?;
        Ok(SurveyBatch { tx })
    }

    /// Store tables that do not exist yet, in schema order.
    pub async fn missing_tables(&mut self) -> Result<Vec<&'static str>> {
        let mut missing = Vec::new();
        for table in [USERS_TABLE, RATINGS_TABLE, SURVEYS_TABLE] {
            let present: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            )
            .bind(table)
            .fetch_one(&mut self.conn)
            .await
            .map_err(query_err("listing tables"))?;
            if present == 0 {
                missing.push(table);
            }
        }
        Ok(missing)
    }

    pub async fn counts(&mut self) -> Result<TableCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM usuarios) AS users,
                (SELECT COUNT(*) FROM dimension_calificaciones) AS ratings,
                (SELECT COUNT(*) FROM encuestas) AS surveys
            "#,
        )
        .fetch_one(&mut self.conn)
        .await
        .map_err(query_err("counting rows"))?;

        Ok(TableCounts {
            users: row.try_get("users").map_err(query_err("reading row counts"))?,
            ratings: row.try_get("ratings").map_err(query_err("reading row counts"))?,
            surveys: row.try_get("surveys").map_err(query_err("reading row counts"))?,
        })
    }

    pub async fn survey_by_key(&mut self, dedup_key: &str) -> Result<Option<SurveyResponse>> {
        let row = sqlx::query(
            r#"
            SELECT id_encuesta, id_estado_encuesta, estado, id_cuestionario, descripcion_cuestionario,
                   id_calificacion, fecha_limite, fecha_creado, hora_creado, fecha_modificado,
                   hora_modificado, fecha_insercion, usuario_id, hash_unico
              FROM encuestas
             WHERE hash_unico = ?1
            "#,
        )
        .bind(dedup_key)
        .fetch_optional(&mut self.conn)
        .await
        .map_err(query_err("looking up survey"))?;

        row.map(|row| survey_from_row(&row))
            .transpose()
            .map_err(query_err("decoding survey"))
    }

    /// Row counts, survey id sanity numbers and a few rated surveys for operators.
    pub async fn stats(&mut self) -> Result<StoreStats> {
        let counts = self.counts().await?;

        let row = sqlx::query(
            r#"
            SELECT MIN(id_encuesta) AS min_id,
                   MAX(id_encuesta) AS max_id,
                   COUNT(*) AS total,
                   COUNT(DISTINCT id_encuesta) AS distinct_ids
              FROM encuestas
            "#,
        )
        .fetch_one(&mut self.conn)
        .await
        .map_err(query_err("reading survey id stats"))?;
        let survey_ids = SurveyIdStats {
            min_id: row.try_get("min_id").map_err(query_err("decoding survey id stats"))?,
            max_id: row.try_get("max_id").map_err(query_err("decoding survey id stats"))?,
            total: row.try_get("total").map_err(query_err("decoding survey id stats"))?,
            distinct: row
                .try_get("distinct_ids")
                .map_err(query_err("decoding survey id stats"))?,
        };

        let rows = sqlx::query(
            r#"
            SELECT e.id_encuesta, e.id_estado_encuesta, e.estado, e.id_calificacion,
                   u.nombre, e.fecha_insercion
              FROM encuestas e
              LEFT JOIN usuarios u ON e.usuario_id = u.id_usuario
             WHERE e.id_calificacion IS NOT NULL
             ORDER BY e.id_encuesta
             LIMIT 5
            "#,
        )
        .fetch_all(&mut self.conn)
        .await
        .map_err(query_err("sampling surveys"))?;

        let mut samples = Vec::with_capacity(rows.len());
        for row in rows {
            samples.push(SurveySample {
                id: row.try_get("id_encuesta").map_err(query_err("decoding survey sample"))?,
                status_id: row
                    .try_get("id_estado_encuesta")
                    .map_err(query_err("decoding survey sample"))?,
                status: row.try_get("estado").map_err(query_err("decoding survey sample"))?,
                rating_id: row
                    .try_get("id_calificacion")
                    .map_err(query_err("decoding survey sample"))?,
                user_name: row.try_get("nombre").map_err(query_err("decoding survey sample"))?,
                inserted_on: row
                    .try_get("fecha_insercion")
                    .map_err(query_err("decoding survey sample"))?,
            });
        }

        Ok(StoreStats {
            counts,
            survey_ids,
            samples,
        })
    }

    pub async fn close(self) -> Result<()> {
        self.conn.close().await.map_err(query_err("closing store"))
    }
}

async fn defer_foreign_keys(tx: &mut Transaction<'_, Sqlite>) -> Result<()> {
    sqlx::query("PRAGMA defer_foreign_keys = ON")
        .execute(&mut **tx)
        .await
        .map_err(query_err("deferring foreign keys"))?;
    Ok(())
}

fn survey_from_row(row: &sqlx::sqlite::SqliteRow) -> std::result::Result<SurveyResponse, sqlx::Error> {
    let text = |name: &str| -> std::result::Result<String, sqlx::Error> {
        Ok(row.try_get::<Option<String>, _>(name)?.unwrap_or_default())
    };
    Ok(SurveyResponse {
        id: row.try_get("id_encuesta")?,
        record: NewSurvey {
            status_id: row.try_get("id_estado_encuesta")?,
            status: text("estado")?,
            questionnaire_id: row.try_get("id_cuestionario")?,
            questionnaire_description: text("descripcion_cuestionario")?,
            rating_id: row.try_get("id_calificacion")?,
            due_date: text("fecha_limite")?,
            created_date: text("fecha_creado")?,
            created_time: text("hora_creado")?,
            modified_date: text("fecha_modificado")?,
            modified_time: text("hora_modificado")?,
            inserted_on: text("fecha_insercion")?,
            user_id: row.try_get("usuario_id")?,
            dedup_key: text("hash_unico")?,
        },
    })
}

/// Open transaction used by the survey loader for lookups and inserts.
pub struct SurveyBatch<'c> {
    tx: Transaction<'c, Sqlite>,
}

impl SurveyBatch<'_> {
    pub async fn key_exists(&mut self, dedup_key: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM encuestas WHERE hash_unico = ?1")
            .bind(dedup_key)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(record_err("checking dedup key", dedup_key.to_string()))?;
        Ok(count > 0)
    }

    /// Insert one survey and return its surrogate id.
    pub async fn insert(&mut self, survey: &NewSurvey) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO encuestas (
                id_estado_encuesta, estado, id_cuestionario, descripcion_cuestionario,
                id_calificacion, fecha_limite, fecha_creado, hora_creado,
                fecha_modificado, hora_modificado, fecha_insercion,
                usuario_id, hash_unico
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(survey.status_id)
        .bind(&survey.status)
        .bind(survey.questionnaire_id)
        .bind(&survey.questionnaire_description)
        .bind(survey.rating_id)
        .bind(&survey.due_date)
        .bind(&survey.created_date)
        .bind(&survey.created_time)
        .bind(&survey.modified_date)
        .bind(&survey.modified_time)
        .bind(&survey.inserted_on)
        .bind(survey.user_id)
        .bind(&survey.dedup_key)
        .execute(&mut *self.tx)
        .await
        .map_err(record_err("inserting survey", survey.dedup_key.clone()))?;
        Ok(result.last_insert_rowid())
    }

    pub async fn commit(self) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(query_err("committing survey batch"))
    }
}
