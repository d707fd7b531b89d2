//! Core domain model for the survey loader: source records, coercion results and entities.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "svl-core";

/// Marker some exports write instead of leaving a numeric cell empty.
pub const NULL_SENTINEL: &str = "NULL";

/// Header names of the survey export.
pub mod survey_fields {
    pub const USER_ID: &str = "usuario_id";
    pub const INSERTED_ON: &str = "Fecha_Insercion";
    pub const QUESTIONNAIRE_ID: &str = "IdCuestionario";
    pub const RATING: &str = "Calificacion";
    pub const STATUS_ID: &str = "IdEstadoEncuesta";
    pub const STATUS: &str = "Estado";
    pub const QUESTIONNAIRE_DESCRIPTION: &str = "DescripcionCuestionario";
    pub const DUE_DATE: &str = "FechaLimite";
    pub const CREATED_DATE: &str = "FechaCreado";
    pub const CREATED_TIME: &str = "HoraCreado";
    pub const MODIFIED_DATE: &str = "FechaModificado";
    pub const MODIFIED_TIME: &str = "HoraModificado";
}

/// Header names of the user export.
pub mod user_fields {
    pub const ID: &str = "id_usuario";
    pub const NAME: &str = "nombre";
    pub const PHONE: &str = "telefono";
    pub const EMAIL: &str = "email";
}

/// Header names of the rating dimension export.
pub mod rating_fields {
    pub const ID: &str = "id_calificacion";
    pub const RATING: &str = "calificacion";
    pub const DESCRIPTION: &str = "descripcion";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Users,
    Ratings,
    Surveys,
}

impl Entity {
    pub fn as_str(self) -> &'static str {
        match self {
            Entity::Users => "users",
            Entity::Ratings => "ratings",
            Entity::Surveys => "surveys",
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One delimited row keyed by header name, with the 1-based source line it came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawRecord {
    pub line: u64,
    fields: HashMap<String, String>,
}

impl RawRecord {
    pub fn new(line: u64) -> Self {
        Self {
            line,
            fields: HashMap::new(),
        }
    }

    pub fn from_pairs<I, K, V>(line: u64, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            line,
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Raw value exactly as read, if the column was present in this row.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn get_or_empty(&self, name: &str) -> &str {
        self.get(name).unwrap_or_default()
    }

    /// Raw value, or `None` when missing or whitespace only.
    pub fn non_blank(&self, name: &str) -> Option<&str> {
        self.get(name).filter(|v| !v.trim().is_empty())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Outcome of coercing one raw text cell into a typed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Coerced<T> {
    Value(T),
    /// Column missing or blank.
    Absent,
    /// Column carried the null sentinel.
    Null,
    /// Column had text that does not parse.
    Malformed(String),
}

impl<T> Coerced<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Coerced::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Coerced::Malformed(_))
    }
}

impl Coerced<i64> {
    pub fn integer(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Coerced::Absent;
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Coerced::Absent;
        }
        if trimmed.eq_ignore_ascii_case(NULL_SENTINEL) {
            return Coerced::Null;
        }
        match trimmed.parse::<i64>() {
            Ok(v) => Coerced::Value(v),
            Err(_) => Coerced::Malformed(raw.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingDimension {
    pub id: i64,
    pub rating: Option<i64>,
    pub description: String,
}

/// Survey row ready to insert; the surrogate id is assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSurvey {
    pub status_id: Option<i64>,
    pub status: String,
    pub questionnaire_id: Option<i64>,
    pub questionnaire_description: String,
    pub rating_id: Option<i64>,
    pub due_date: String,
    pub created_date: String,
    pub created_time: String,
    pub modified_date: String,
    pub modified_time: String,
    pub inserted_on: String,
    pub user_id: i64,
    pub dedup_key: String,
}

/// Persisted survey response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurveyResponse {
    pub id: i64,
    #[serde(flatten)]
    pub record: NewSurvey,
}
