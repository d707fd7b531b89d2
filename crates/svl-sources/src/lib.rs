//! Delimited source files: registry, reader and typed row mapping.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use svl_core::{rating_fields, user_fields, Coerced, Entity, RatingDimension, RawRecord, User};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "svl-sources";

pub const DEFAULT_DELIMITER: char = ';';

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}{}: {source}", .path.display(), line_suffix(.line))]
    Csv {
        path: PathBuf,
        line: Option<u64>,
        #[source]
        source: csv::Error,
    },
    #[error("parsing source registry {}: {source}", .path.display())]
    Registry {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("no {0} source configured")]
    MissingSource(Entity),
    #[error("delimiter {0:?} is not a single-byte character")]
    InvalidDelimiter(char),
}

fn line_suffix(line: &Option<u64>) -> String {
    line.map(|l| format!(" at line {l}")).unwrap_or_default()
}

fn default_delimiter() -> char {
    DEFAULT_DELIMITER
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub kind: Entity,
    pub path: PathBuf,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

impl SourceConfig {
    pub fn new(kind: Entity, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            delimiter: DEFAULT_DELIMITER,
        }
    }

    pub fn read(&self) -> Result<Vec<RawRecord>, SourceError> {
        read_records(&self.path, self.delimiter)
    }
}

/// The set of input files for one load, usually from `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| SourceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut registry: SourceRegistry =
            serde_yaml::from_str(&text).map_err(|source| SourceError::Registry {
                path: path.to_path_buf(),
                source,
            })?;

        // Relative paths in the registry are relative to the registry file.
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for source in &mut registry.sources {
            if source.path.is_relative() {
                source.path = base.join(&source.path);
            }
        }
        Ok(registry)
    }

    pub fn get(&self, kind: Entity) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.kind == kind)
    }

    pub fn require(&self, kind: Entity) -> Result<&SourceConfig, SourceError> {
        self.get(kind).ok_or(SourceError::MissingSource(kind))
    }
}

/// Read a whole delimited file into records; the file is closed before returning.
pub fn read_records(path: impl AsRef<Path>, delimiter: char) -> Result<Vec<RawRecord>, SourceError> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let records = parse_records(&bytes, delimiter, path)?;
    debug!(path = %path.display(), records = records.len(), "read delimited source");
    Ok(records)
}

/// Parse delimited bytes with a header row. `origin` only labels errors.
pub fn parse_records(bytes: &[u8], delimiter: char, origin: &Path) -> Result<Vec<RawRecord>, SourceError> {
    if !delimiter.is_ascii() {
        return Err(SourceError::InvalidDelimiter(delimiter));
    }
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);

    let csv_err = |source: csv::Error| SourceError::Csv {
        path: origin.to_path_buf(),
        line: source.position().map(|p| p.line()),
        source,
    };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter as u8)
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);

    let headers: Vec<String> = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();

    let mut records = Vec::new();
    for (index, row) in reader.records().enumerate() {
        let row = row.map_err(csv_err)?;
        let line = row
            .position()
            .map(|p| p.line())
            .unwrap_or(index as u64 + 2);
        records.push(RawRecord::from_pairs(
            line,
            headers.iter().cloned().zip(row.iter().map(str::to_string)),
        ));
    }
    Ok(records)
}

/// What happened to one source row during typed mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome<T> {
    Accepted(T),
    /// Row has no identifier at all and is ignored silently.
    Skipped,
    /// Row has an identifier that cannot be used.
    Rejected(String),
}

fn optional_text(record: &RawRecord, name: &str) -> Option<String> {
    record.non_blank(name).map(str::to_string)
}

pub fn user_from_record(record: &RawRecord) -> RowOutcome<User> {
    let Some(raw_id) = record.non_blank(user_fields::ID) else {
        return RowOutcome::Skipped;
    };
    let Coerced::Value(id) = Coerced::integer(Some(raw_id)) else {
        return RowOutcome::Rejected(format!("{} {raw_id:?} is not an integer", user_fields::ID));
    };
    RowOutcome::Accepted(User {
        id,
        name: record.get_or_empty(user_fields::NAME).to_string(),
        phone: optional_text(record, user_fields::PHONE),
        email: optional_text(record, user_fields::EMAIL),
    })
}

pub fn rating_from_record(record: &RawRecord) -> RowOutcome<RatingDimension> {
    let raw_id = record.get_or_empty(rating_fields::ID);
    let Coerced::Value(id) = Coerced::integer(Some(raw_id)) else {
        return RowOutcome::Rejected(format!(
            "{} {raw_id:?} is not an integer",
            rating_fields::ID
        ));
    };
    RowOutcome::Accepted(RatingDimension {
        id,
        rating: Coerced::integer(record.get(rating_fields::RATING)).into_option(),
        description: record.get_or_empty(rating_fields::DESCRIPTION).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn origin() -> PathBuf {
        PathBuf::from("memory.csv")
    }

    #[test]
    fn bom_prefixed_header_is_clean() {
        let data = "\u{feff}usuario_id;Fecha_Insercion;Calificacion\n1;2025-07-01;5\n";
        let records = parse_records(data.as_bytes(), ';', &origin()).expect("parse");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("usuario_id"), Some("1"));
        assert_eq!(records[0].get("Calificacion"), Some("5"));
        assert_eq!(records[0].line, 2);
    }

    #[test]
    fn short_rows_leave_trailing_fields_absent_and_values_are_not_trimmed() {
        let data = "a;b;c\n 1 ;x\n2;y;z\n";
        let records = parse_records(data.as_bytes(), ';', &origin()).expect("parse");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("a"), Some(" 1 "));
        assert_eq!(records[0].get("c"), None);
        assert_eq!(records[1].get("c"), Some("z"));
        assert_eq!(records[1].line, 3);
    }

    #[test]
    fn invalid_utf8_reports_path_and_line() {
        let mut data = b"a;b\n1;ok\n".to_vec();
        data.extend_from_slice(b"2;\xff\xfe\n");
        let err = parse_records(&data, ';', &origin()).expect_err("utf8");
        let text = err.to_string();
        assert!(text.contains("memory.csv"), "{text}");
        assert!(text.contains("line 3"), "{text}");
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempdir().expect("tempdir");
        let err = read_records(dir.path().join("nope.csv"), ';').expect_err("missing");
        assert!(matches!(err, SourceError::Io { .. }));
    }

    #[test]
    fn user_rows_skip_blank_ids_and_reject_non_numeric_ones() {
        let ok = RawRecord::from_pairs(
            2,
            [("id_usuario", "1"), ("nombre", "Ana"), ("telefono", "555-0001"), ("email", "")],
        );
        assert_eq!(
            user_from_record(&ok),
            RowOutcome::Accepted(User {
                id: 1,
                name: "Ana".into(),
                phone: Some("555-0001".into()),
                email: None,
            })
        );
        let blank = RawRecord::from_pairs(3, [("id_usuario", " "), ("nombre", "Nadie")]);
        assert_eq!(user_from_record(&blank), RowOutcome::Skipped);
        let bad = RawRecord::from_pairs(4, [("id_usuario", "x1"), ("nombre", "Raro")]);
        assert!(matches!(user_from_record(&bad), RowOutcome::Rejected(_)));
    }

    #[test]
    fn rating_rows_coerce_value_and_reject_bad_ids() {
        let ok = RawRecord::from_pairs(
            2,
            [("id_calificacion", "5"), ("calificacion", "NULL"), ("descripcion", "Excelente")],
        );
        assert_eq!(
            rating_from_record(&ok),
            RowOutcome::Accepted(RatingDimension {
                id: 5,
                rating: None,
                description: "Excelente".into(),
            })
        );
        let bad = RawRecord::from_pairs(3, [("id_calificacion", "")]);
        assert!(matches!(rating_from_record(&bad), RowOutcome::Rejected(_)));
    }

    #[test]
    fn registry_paths_resolve_next_to_the_registry_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("sources.yaml");
        fs::write(
            &path,
            "sources:\n  - kind: users\n    path: data/usuarios.csv\n  - kind: surveys\n    path: /abs/Encuestas.csv\n    delimiter: ','\n",
        )
        .expect("write");

        let registry = SourceRegistry::from_yaml_file(&path).expect("registry");
        let users = registry.require(Entity::Users).expect("users");
        assert_eq!(users.path, dir.path().join("data/usuarios.csv"));
        assert_eq!(users.delimiter, ';');
        let surveys = registry.require(Entity::Surveys).expect("surveys");
        assert_eq!(surveys.path, PathBuf::from("/abs/Encuestas.csv"));
        assert_eq!(surveys.delimiter, ',');
        assert!(matches!(
            registry.require(Entity::Ratings),
            Err(SourceError::MissingSource(Entity::Ratings))
        ));
    }
}
