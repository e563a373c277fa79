//! Core types for the transfer system
//!
//! Value types shared by the executor, the traversal engine and the job store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Job ID - a random v4 UUID identifying one transfer request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parse from the hyphenated UUID form
    pub fn from_str(s: &str) -> Result<Self, String> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| format!("Invalid JobId: {}", e))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of data a job moves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Calendar,
    Contacts,
    Mail,
    Photos,
    Tasks,
    Videos,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Calendar => "calendar",
            DataType::Contacts => "contacts",
            DataType::Mail => "mail",
            DataType::Photos => "photos",
            DataType::Tasks => "tasks",
            DataType::Videos => "videos",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "calendar" => Some(DataType::Calendar),
            "contacts" => Some(DataType::Contacts),
            "mail" => Some(DataType::Mail),
            "photos" => Some(DataType::Photos),
            "tasks" => Some(DataType::Tasks),
            "videos" => Some(DataType::Videos),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decrypted credentials for one side of a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthData {
    Token {
        token: String,
    },
    TokensAndUrl {
        access_token: String,
        refresh_token: String,
        token_server_url: String,
    },
}

/// An item with a stable identity across import attempts
pub trait ImportableItem {
    /// Key under which the import side effect is de-duplicated
    fn idempotent_id(&self) -> String;

    /// User-visible name, used in error reports
    fn name(&self) -> String;
}

/// One unresolved import failure, as reported to operators and users
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub id: String,
    pub title: String,
    pub exception: String,
    pub can_skip: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ItemImportStatus {
    Success,
    Error,
}

/// Outcome of importing a single item
///
/// `data` is present iff the status is `Success`, `error` iff it is `Error`.
/// The only way to build one is through [`ItemImportResult::success`] and
/// [`ItemImportResult::error`].
#[derive(Debug, Clone, PartialEq)]
pub struct ItemImportResult<T> {
    status: ItemImportStatus,
    data: Option<T>,
    bytes: Option<u64>,
    error: Option<String>,
}

impl<T> ItemImportResult<T> {
    pub fn success(data: T, bytes: Option<u64>) -> Self {
        Self {
            status: ItemImportStatus::Success,
            data: Some(data),
            bytes,
            error: None,
        }
    }

    pub fn error(error: impl Into<String>, bytes: Option<u64>) -> Self {
        Self {
            status: ItemImportStatus::Error,
            data: None,
            bytes,
            error: Some(error.into()),
        }
    }

    pub fn status(&self) -> ItemImportStatus {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status == ItemImportStatus::Success
    }

    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    pub fn bytes(&self) -> Option<u64> {
        self.bytes
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn into_data(self) -> Option<T> {
        self.data
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImportResultType {
    Ok,
    Error,
}

/// Result of one importer call over a whole container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportResult {
    pub result_type: ImportResultType,
    /// Items imported, keyed by item kind
    pub counts: BTreeMap<String, u64>,
    pub bytes: Option<u64>,
    pub error: Option<String>,
}

impl ImportResult {
    pub fn ok() -> Self {
        Self {
            result_type: ImportResultType::Ok,
            counts: BTreeMap::new(),
            bytes: None,
            error: None,
        }
    }

    pub fn with_counts(mut self, counts: BTreeMap<String, u64>) -> Self {
        self.counts = counts;
        self
    }

    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes = Some(bytes);
        self
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            result_type: ImportResultType::Error,
            counts: BTreeMap::new(),
            bytes: None,
            error: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result_type == ImportResultType::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_parse_roundtrip() {
        let id = JobId::new();
        let parsed = JobId::from_str(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
        assert!(JobId::from_str("not-a-uuid").is_err());
    }

    #[test]
    fn test_data_type_strings() {
        assert_eq!(DataType::Calendar.as_str(), "calendar");
        assert_eq!(DataType::from_str("PHOTOS"), Some(DataType::Photos));
        assert_eq!(DataType::from_str("music"), None);
    }

    #[test]
    fn test_item_import_result_invariants() {
        let ok = ItemImportResult::success("album-1".to_string(), Some(2048));
        assert!(ok.is_success());
        assert_eq!(ok.data().map(String::as_str), Some("album-1"));
        assert!(ok.error_message().is_none());

        let failed: ItemImportResult<String> = ItemImportResult::error("quota exceeded", None);
        assert_eq!(failed.status(), ItemImportStatus::Error);
        assert!(failed.data().is_none());
        assert_eq!(failed.error_message(), Some("quota exceeded"));
    }

    #[test]
    fn test_error_detail_report_format() {
        let detail = ErrorDetail {
            id: "photo-1".to_string(),
            title: "Beach".to_string(),
            exception: "Transient provider error: timeout".to_string(),
            can_skip: true,
        };

        let json = serde_json::to_value(&detail).unwrap();
        assert_eq!(json["id"], "photo-1");
        assert_eq!(json["title"], "Beach");
        assert_eq!(json["exception"], "Transient provider error: timeout");
        assert_eq!(json["canSkip"], true);
    }

    #[test]
    fn test_auth_data_json() {
        let auth = AuthData::Token {
            token: "secret".to_string(),
        };
        let json = serde_json::to_string(&auth).unwrap();
        assert!(json.contains("\"type\":\"token\""));
        let parsed: AuthData = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, auth);
    }
}
