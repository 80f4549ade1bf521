use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Serialize)]
pub struct CoreError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CoreError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    /// Store failure tagged with the table that rejected the write.
    pub fn store(code: &str, e: rusqlite::Error, table: &str) -> Self {
        Self {
            code: code.to_string(),
            message: e.to_string(),
            details: Some(serde_json::json!({ "table": table })),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Which students a subject reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Class,
    Batches,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Subtype {
    Theory,
    Practical,
    Tg,
}

impl Subtype {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "theory" => Some(Subtype::Theory),
            "practical" => Some(Subtype::Practical),
            "tg" => Some(Subtype::Tg),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Subtype::Theory => "theory",
            Subtype::Practical => "practical",
            Subtype::Tg => "tg",
        }
    }

    pub fn scope(self) -> Scope {
        match self {
            Subtype::Theory => Scope::Class,
            Subtype::Practical | Subtype::Tg => Scope::Batches,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Present,
    Absent,
}

impl Status {
    /// Missing or null means absent; anything else must be a known status.
    pub fn parse(raw: Option<&serde_json::Value>) -> Result<Self, CoreError> {
        let Some(v) = raw else {
            return Ok(Status::Absent);
        };
        if v.is_null() {
            return Ok(Status::Absent);
        }
        let Some(s) = v.as_str() else {
            return Err(CoreError::bad_params("status must be a string or null"));
        };
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "absent" => Ok(Status::Absent),
            "present" => Ok(Status::Present),
            other => Err(CoreError::bad_params("status must be present or absent")
                .with_details(serde_json::json!({ "status": other }))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Present => "present",
            Status::Absent => "absent",
        }
    }

    pub fn from_stored(raw: &str) -> Self {
        if raw == "present" {
            Status::Present
        } else {
            Status::Absent
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub id: String,
    pub name: String,
    pub class_id: String,
    pub teacher_id: Option<String>,
    pub department: String,
    pub sub_type: Subtype,
    pub batch_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub class_id: String,
    pub roll_number: String,
    pub name: String,
    pub subjects: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Faculty {
    pub id: String,
    pub name: String,
    pub department: String,
    pub email: Option<String>,
    pub is_admin: bool,
    pub subjects: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub id: String,
    pub class_id: String,
    pub name: String,
    pub students: Vec<String>,
}
