//! Survey loader: dedup keys, idempotent survey inserts and the users → ratings → surveys run.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use svl_core::{survey_fields, Coerced, Entity, NewSurvey, RawRecord};
use svl_sources::{
    rating_from_record, user_from_record, RowOutcome, SourceConfig, SourceError, SourceRegistry,
};
use svl_storage::{Store, StoreError, StoreStats};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "svl-load";

pub const SOURCE_REGISTRY_FILE: &str = "sources.yaml";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SurveyLoadOptions {
    /// Stop once this many surveys have been inserted in one run.
    pub max_records: Option<usize>,
    /// Commit every N inserted surveys instead of once at the end.
    pub commit_interval: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub database_url: String,
    pub workspace_root: PathBuf,
    pub users_file: PathBuf,
    pub surveys_file: PathBuf,
    pub ratings_file: PathBuf,
    pub reports_dir: PathBuf,
    pub options: SurveyLoadOptions,
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl LoadConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:encuestas_usuarios.db".to_string()),
            workspace_root: std::env::var("SVL_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            users_file: std::env::var("SVL_USERS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("usuarios.csv")),
            surveys_file: std::env::var("SVL_SURVEYS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("Encuestas.csv")),
            ratings_file: std::env::var("SVL_RATINGS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("dimension_calificaciones.csv")),
            reports_dir: std::env::var("REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            options: SurveyLoadOptions {
                max_records: env_usize("SVL_MAX_SURVEY_RECORDS"),
                commit_interval: env_usize("SVL_COMMIT_INTERVAL"),
            },
        }
    }

    pub async fn open_store(&self) -> Result<Store, LoadError> {
        let store = Store::open(&self.database_url)
            .await
            .map_err(LoadError::Open)?;
        info!(url = %self.database_url, "store opened");
        Ok(store)
    }

    /// `sources.yaml` from the workspace root when present, otherwise the configured files.
    pub fn source_registry(&self) -> Result<SourceRegistry, SourceError> {
        let registry_path = self.workspace_root.join(SOURCE_REGISTRY_FILE);
        if registry_path.exists() {
            return SourceRegistry::from_yaml_file(&registry_path);
        }
        Ok(SourceRegistry {
            sources: vec![
                SourceConfig::new(Entity::Users, self.workspace_root.join(&self.users_file)),
                SourceConfig::new(Entity::Ratings, self.workspace_root.join(&self.ratings_file)),
                SourceConfig::new(Entity::Surveys, self.workspace_root.join(&self.surveys_file)),
            ],
        })
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("opening store: {0}")]
    Open(#[source] StoreError),
    #[error("creating schema: {0}")]
    Schema(#[source] StoreError),
    #[error("{entity} record at line {line}: {source}")]
    Record {
        entity: Entity,
        line: u64,
        committed: usize,
        #[source]
        source: StoreError,
    },
    #[error("{entity} load: {source}")]
    Store {
        entity: Entity,
        committed: usize,
        #[source]
        source: StoreError,
    },
}

impl LoadError {
    /// Rows of the failing batch that were already committed.
    pub fn committed(&self) -> usize {
        match self {
            LoadError::Source(_) | LoadError::Open(_) | LoadError::Schema(_) => 0,
            LoadError::Record { committed, .. } | LoadError::Store { committed, .. } => *committed,
        }
    }

    pub fn is_partial(&self) -> bool {
        self.committed() > 0
    }

    /// The entity whose step failed; `None` when the store was never written.
    pub fn entity(&self) -> Option<Entity> {
        match self {
            LoadError::Source(_) | LoadError::Open(_) | LoadError::Schema(_) => None,
            LoadError::Record { entity, .. } | LoadError::Store { entity, .. } => Some(*entity),
        }
    }

    /// What the store holds after this failure, for operators.
    ///
    /// Steps run users, ratings, surveys in order, so a failing step implies
    /// every earlier one was committed.
    pub fn progress_note(&self) -> String {
        let Some(entity) = self.entity() else {
            return "nothing was loaded".to_string();
        };
        let committed = if self.is_partial() {
            format!("partial load, {} rows committed", self.committed())
        } else {
            "nothing committed".to_string()
        };
        let earlier = match entity {
            Entity::Users => "nothing else was loaded",
            Entity::Ratings => "users were reloaded",
            Entity::Surveys => "users and ratings were reloaded",
        };
        format!("{entity}: {committed} ({earlier})")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SurveyLoadSummary {
    pub records_read: usize,
    /// Surveys inserted.
    pub processed: usize,
    /// Inserted surveys that carry a rating.
    pub valid: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub rejected: usize,
    pub malformed_fields: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplaceSummary {
    pub records_read: usize,
    pub loaded: usize,
    pub skipped: usize,
    pub rejected: usize,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Content key of a survey row over the raw user, insertion date, questionnaire and rating.
pub fn dedup_key(record: &RawRecord) -> String {
    let material = format!(
        "{}-{}-{}-{}",
        record.get_or_empty(survey_fields::USER_ID),
        record.get_or_empty(survey_fields::INSERTED_ON),
        record.get_or_empty(survey_fields::QUESTIONNAIRE_ID),
        record.get_or_empty(survey_fields::RATING),
    );
    sha256_hex(material.as_bytes())
}

fn survey_from_record(record: &RawRecord, user_id: i64, dedup_key: String) -> (NewSurvey, usize) {
    let rating = Coerced::integer(record.get(survey_fields::RATING));
    let questionnaire = Coerced::integer(record.get(survey_fields::QUESTIONNAIRE_ID));
    let status = Coerced::integer(record.get(survey_fields::STATUS_ID));

    let malformed = [&rating, &questionnaire, &status]
        .iter()
        .filter(|c| c.is_malformed())
        .count();
    if malformed > 0 {
        debug!(
            line = record.line,
            rating = ?rating,
            questionnaire = ?questionnaire,
            status = ?status,
            "unparseable numeric fields stored as null"
        );
    }

    let text = |name: &str| record.get_or_empty(name).to_string();
    let survey = NewSurvey {
        status_id: status.into_option(),
        status: text(survey_fields::STATUS),
        questionnaire_id: questionnaire.into_option(),
        questionnaire_description: text(survey_fields::QUESTIONNAIRE_DESCRIPTION),
        rating_id: rating.into_option(),
        due_date: text(survey_fields::DUE_DATE),
        created_date: text(survey_fields::CREATED_DATE),
        created_time: text(survey_fields::CREATED_TIME),
        modified_date: text(survey_fields::MODIFIED_DATE),
        modified_time: text(survey_fields::MODIFIED_TIME),
        inserted_on: text(survey_fields::INSERTED_ON),
        user_id,
        dedup_key,
    };
    (survey, malformed)
}

/// Insert every survey whose dedup key is not stored yet.
///
/// Rows without `usuario_id` are skipped, rows with a non-numeric one are
/// rejected, and rows whose key already exists (from an earlier run or earlier
/// in this batch) are counted as duplicates and left alone. Store failures end
/// the batch; the error says how many rows were already committed.
pub async fn load_surveys<I>(
    store: &mut Store,
    records: I,
    options: SurveyLoadOptions,
) -> Result<SurveyLoadSummary, LoadError>
where
    I: IntoIterator<Item = RawRecord>,
{
    let mut summary = SurveyLoadSummary::default();
    let mut committed = 0usize;
    let mut since_commit = 0usize;

    let mut batch = store
        .begin_surveys()
        .await
        .map_err(|source| LoadError::Store {
            entity: Entity::Surveys,
            committed,
            source,
        })?;

    for record in records {
        if options.max_records.is_some_and(|cap| summary.processed >= cap) {
            summary.truncated = true;
            info!(
                cap = summary.processed,
                "survey cap reached, remaining input ignored"
            );
            break;
        }
        summary.records_read += 1;

        let Some(raw_user) = record.non_blank(survey_fields::USER_ID) else {
            summary.skipped += 1;
            continue;
        };
        let Coerced::Value(user_id) = Coerced::integer(Some(raw_user)) else {
            summary.rejected += 1;
            warn!(line = record.line, usuario_id = raw_user, "rejected survey row with non-numeric user");
            continue;
        };

        let record_err = |source| LoadError::Record {
            entity: Entity::Surveys,
            line: record.line,
            committed,
            source,
        };

        let key = dedup_key(&record);
        if batch.key_exists(&key).await.map_err(record_err)? {
            summary.duplicates += 1;
            debug!(line = record.line, dedup_key = %key, "duplicate survey skipped");
            continue;
        }

        let (survey, malformed) = survey_from_record(&record, user_id, key);
        summary.malformed_fields += malformed;
        batch.insert(&survey).await.map_err(record_err)?;
        summary.processed += 1;
        if survey.rating_id.is_some() {
            summary.valid += 1;
        }

        since_commit += 1;
        if options
            .commit_interval
            .is_some_and(|every| every > 0 && since_commit >= every)
        {
            batch.commit().await.map_err(record_err)?;
            committed = summary.processed;
            since_commit = 0;
            debug!(committed, "survey batch checkpoint");
            batch = store
                .begin_surveys()
                .await
                .map_err(|source| LoadError::Store {
                    entity: Entity::Surveys,
                    committed,
                    source,
                })?;
        }
    }

    batch.commit().await.map_err(|source| LoadError::Store {
        entity: Entity::Surveys,
        committed,
        source,
    })?;

    info!(
        processed = summary.processed,
        valid = summary.valid,
        duplicates = summary.duplicates,
        skipped = summary.skipped,
        rejected = summary.rejected,
        truncated = summary.truncated,
        "surveys loaded"
    );
    Ok(summary)
}

fn partition_rows<T>(
    entity: Entity,
    records: Vec<RawRecord>,
    map: impl Fn(&RawRecord) -> RowOutcome<T>,
) -> (Vec<T>, ReplaceSummary) {
    let mut summary = ReplaceSummary {
        records_read: records.len(),
        ..Default::default()
    };
    let mut accepted = Vec::with_capacity(records.len());
    for record in &records {
        match map(record) {
            RowOutcome::Accepted(row) => accepted.push(row),
            RowOutcome::Skipped => summary.skipped += 1,
            RowOutcome::Rejected(reason) => {
                summary.rejected += 1;
                warn!(%entity, line = record.line, %reason, "rejected row");
            }
        }
    }
    (accepted, summary)
}

/// Clear the user table and reload it from `records`.
pub async fn load_users<I>(store: &mut Store, records: I) -> Result<ReplaceSummary, LoadError>
where
    I: IntoIterator<Item = RawRecord>,
{
    let (users, mut summary) =
        partition_rows(Entity::Users, records.into_iter().collect(), user_from_record);
    summary.loaded = store
        .replace_users(&users)
        .await
        .map_err(|source| LoadError::Store {
            entity: Entity::Users,
            committed: 0,
            source,
        })?;
    info!(loaded = summary.loaded, skipped = summary.skipped, rejected = summary.rejected, "users loaded");
    Ok(summary)
}

/// Clear the rating dimension and reload it from `records`.
pub async fn load_ratings<I>(store: &mut Store, records: I) -> Result<ReplaceSummary, LoadError>
where
    I: IntoIterator<Item = RawRecord>,
{
    let (ratings, mut summary) =
        partition_rows(Entity::Ratings, records.into_iter().collect(), rating_from_record);
    summary.loaded = store
        .replace_ratings(&ratings)
        .await
        .map_err(|source| LoadError::Store {
            entity: Entity::Ratings,
            committed: 0,
            source,
        })?;
    info!(loaded = summary.loaded, rejected = summary.rejected, "ratings loaded");
    Ok(summary)
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub database_url: String,
    pub options: SurveyLoadOptions,
    pub users: ReplaceSummary,
    pub ratings: ReplaceSummary,
    pub surveys: SurveyLoadSummary,
    pub stats: StoreStats,
    pub reports_dir: String,
}

pub struct LoadPipeline {
    config: LoadConfig,
}

impl LoadPipeline {
    pub fn new(config: LoadConfig) -> Self {
        Self { config }
    }

    /// Read all three sources, then replace users and ratings and load surveys.
    ///
    /// Sources are parsed before the store is touched, so an unreadable file
    /// leaves the database as it was.
    pub async fn run_once(&self, store: &mut Store) -> Result<LoadRunSummary> {
        let run_id = Uuid::new_v4();
        self.run(store, run_id)
            .instrument(info_span!("load_run", %run_id))
            .await
    }

    async fn run(&self, store: &mut Store, run_id: Uuid) -> Result<LoadRunSummary> {
        let started_at = Utc::now();
        let registry = self
            .config
            .source_registry()
            .map_err(LoadError::from)
            .context("resolving source files")?;

        let user_rows = read_source(&registry, Entity::Users)?;
        let rating_rows = read_source(&registry, Entity::Ratings)?;
        let survey_rows = read_source(&registry, Entity::Surveys)?;
        info!(
            users = user_rows.len(),
            ratings = rating_rows.len(),
            surveys = survey_rows.len(),
            "sources read"
        );

        store.bootstrap_schema().await.map_err(LoadError::Schema)?;

        let users = load_users(store, user_rows)
            .await
            .context("replacing users; nothing was loaded")?;
        let ratings = load_ratings(store, rating_rows).await.with_context(|| {
            format!("replacing ratings after {} users were loaded", users.loaded)
        })?;
        let surveys = load_surveys(store, survey_rows, self.config.options)
            .await
            .with_context(|| {
                format!(
                    "loading surveys after {} users and {} ratings were loaded",
                    users.loaded, ratings.loaded
                )
            })?;

        let stats = store.stats().await.context("collecting store stats")?;
        let finished_at = Utc::now();
        let run_dir = self.config.reports_dir.join(run_id.to_string());

        let summary = LoadRunSummary {
            run_id,
            started_at,
            finished_at,
            database_url: store.url().to_string(),
            options: self.config.options,
            users,
            ratings,
            surveys,
            stats,
            reports_dir: run_dir.display().to_string(),
        };
        write_run_report(&run_dir, &summary).await?;
        Ok(summary)
    }
}

fn read_source(registry: &SourceRegistry, entity: Entity) -> Result<Vec<RawRecord>, LoadError> {
    Ok(registry.require(entity)?.read()?)
}

async fn write_run_report(run_dir: &Path, summary: &LoadRunSummary) -> Result<()> {
    fs::create_dir_all(run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing load summary")?;
    fs::write(run_dir.join("load_summary.json"), json)
        .await
        .context("writing load_summary.json")?;

    fs::write(run_dir.join("load_brief.md"), load_brief_markdown(summary))
        .await
        .context("writing load_brief.md")?;
    Ok(())
}

pub fn load_brief_markdown(summary: &LoadRunSummary) -> String {
    let s = &summary.surveys;
    format!(
        "# Survey Load\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Store: `{}`\n\n## Users\n- loaded: {}\n- skipped: {}\n- rejected: {}\n\n## Ratings\n- loaded: {}\n- rejected: {}\n\n## Surveys\n- inserted: {}\n- with rating: {}\n- duplicates skipped: {}\n- missing user skipped: {}\n- rejected: {}\n- malformed fields nulled: {}\n- truncated at cap: {}\n\n## Store\n- usuarios: {}\n- dimension_calificaciones: {}\n- encuestas: {}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.database_url,
        summary.users.loaded,
        summary.users.skipped,
        summary.users.rejected,
        summary.ratings.loaded,
        summary.ratings.rejected,
        s.processed,
        s.valid,
        s.duplicates,
        s.skipped,
        s.rejected,
        s.malformed_fields,
        s.truncated,
        summary.stats.counts.users,
        summary.stats.counts.ratings,
        summary.stats.counts.surveys,
    )
}
