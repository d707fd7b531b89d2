use std::path::{Path, PathBuf};

use svl_load::{LoadConfig, LoadPipeline, SurveyLoadOptions};
use svl_report::{
    build_reporting_table, export_dictionary, export_parquet_snapshot, ReportWindow, DEFAULT_TABLE,
};
use svl_storage::Store;
use tempfile::tempdir;

fn fixtures_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

async fn loaded_store(dir: &Path) -> Store {
    let config = LoadConfig {
        database_url: format!("sqlite:{}", dir.join("encuestas.db").display()),
        workspace_root: fixtures_root(),
        users_file: "usuarios.csv".into(),
        surveys_file: "Encuestas.csv".into(),
        ratings_file: "dimension_calificaciones.csv".into(),
        reports_dir: dir.join("reports"),
        options: SurveyLoadOptions::default(),
    };
    let mut store = Store::open(&config.database_url).await.expect("open");
    LoadPipeline::new(config)
        .run_once(&mut store)
        .await
        .expect("load fixtures");
    store
}

#[tokio::test]
async fn fixture_report_covers_june_to_august_rated_surveys() {
    let dir = tempdir().expect("tempdir");
    let mut store = loaded_store(dir.path()).await;

    let summary = build_reporting_table(&mut store, DEFAULT_TABLE, &ReportWindow::default())
        .await
        .expect("report");
    assert_eq!(summary.total_rows, 4);
    assert_eq!(summary.unique_users, 3);
    assert_eq!(summary.average_rating, Some(3.0));
    assert_eq!(
        summary.sample[0].inserted_on.as_deref(),
        Some("2025-08-30 18:31:00")
    );

    let mid_july: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM tabla_unificada_2025 WHERE fecha_insercion LIKE '2025-07-15%'",
    )
    .fetch_one(store.connection())
    .await
    .expect("count july");
    assert_eq!(mid_july, 1);

    let first_of_may: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM tabla_unificada_2025 WHERE fecha_insercion LIKE '2025-05-01%'",
    )
    .fetch_one(store.connection())
    .await
    .expect("count may");
    assert_eq!(first_of_may, 0);
}

#[tokio::test]
async fn fixture_dictionary_and_snapshot_are_written() {
    let dir = tempdir().expect("tempdir");
    let mut store = loaded_store(dir.path()).await;
    build_reporting_table(&mut store, DEFAULT_TABLE, &ReportWindow::default())
        .await
        .expect("report");

    let output = dir.path().join("diccionario.json");
    let dictionary = export_dictionary(&mut store, DEFAULT_TABLE, &output)
        .await
        .expect("dictionary");
    assert!(output.exists());
    assert_eq!(dictionary.metadata.total_rows, 4);
    assert_eq!(dictionary.metadata.statistics.questionnaire_types, 3);
    assert_eq!(dictionary.sample_rows.len(), 3);

    let manifest = export_parquet_snapshot(&mut store, DEFAULT_TABLE, &dir.path().join("reports"))
        .await
        .expect("snapshot");
    assert!(manifest.ends_with("snapshots/manifest.json"));
    assert!(dir
        .path()
        .join("reports/snapshots/tabla_unificada_2025.parquet")
        .exists());
}
