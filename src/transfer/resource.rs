//! Exported data and traversal descriptors
//!
//! `ContainerResource` is a closed set of verticals. The traversal engine
//! never looks inside one; it only moves them between exporter, queue and
//! importer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::transfer::error::{Result, TransferError};
use crate::transfer::types::ImportableItem;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarModel {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEventModel {
    pub calendar_id: String,
    pub title: String,
    pub location: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoAlbum {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoModel {
    pub title: String,
    pub fetchable_url: String,
    pub media_type: String,
    pub data_id: String,
    pub album_id: Option<String>,
}

impl ImportableItem for CalendarModel {
    fn idempotent_id(&self) -> String {
        self.id.clone()
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

impl ImportableItem for CalendarEventModel {
    fn idempotent_id(&self) -> String {
        let start = self
            .start_time
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        format!("{}:{}:{}", self.calendar_id, self.title, start)
    }

    fn name(&self) -> String {
        self.title.clone()
    }
}

impl ImportableItem for PhotoAlbum {
    fn idempotent_id(&self) -> String {
        self.id.clone()
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

impl ImportableItem for PhotoModel {
    fn idempotent_id(&self) -> String {
        self.data_id.clone()
    }

    fn name(&self) -> String {
        self.title.clone()
    }
}

/// Provider-defined bundle of exported items
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContainerResource {
    Calendar {
        calendars: Vec<CalendarModel>,
        events: Vec<CalendarEventModel>,
    },
    Photos {
        albums: Vec<PhotoAlbum>,
        photos: Vec<PhotoModel>,
    },
    /// Names a child to export next; carries no items itself
    IdOnly { id: String },
}

impl ContainerResource {
    pub fn id_only(id: impl Into<String>) -> Self {
        ContainerResource::IdOnly { id: id.into() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ContainerResource::Calendar { .. } => "calendar",
            ContainerResource::Photos { .. } => "photos",
            ContainerResource::IdOnly { .. } => "id_only",
        }
    }
}

/// The only things the engine and generic tooling may ask of a container
pub trait DataContainer: Sized {
    /// True when the container carries no importable items
    fn is_empty(&self) -> bool;

    /// Item counts keyed by item kind
    fn item_counts(&self) -> BTreeMap<String, u64>;

    /// Fold a same-typed sibling into this container
    fn merge(&mut self, other: Self) -> Result<()>;
}

impl DataContainer for ContainerResource {
    fn is_empty(&self) -> bool {
        match self {
            ContainerResource::Calendar { calendars, events } => {
                calendars.is_empty() && events.is_empty()
            }
            ContainerResource::Photos { albums, photos } => albums.is_empty() && photos.is_empty(),
            ContainerResource::IdOnly { .. } => true,
        }
    }

    fn item_counts(&self) -> BTreeMap<String, u64> {
        let mut counts = BTreeMap::new();
        match self {
            ContainerResource::Calendar { calendars, events } => {
                counts.insert("calendars".to_string(), calendars.len() as u64);
                counts.insert("events".to_string(), events.len() as u64);
            }
            ContainerResource::Photos { albums, photos } => {
                counts.insert("albums".to_string(), albums.len() as u64);
                counts.insert("photos".to_string(), photos.len() as u64);
            }
            ContainerResource::IdOnly { .. } => {}
        }
        counts.retain(|_, n| *n > 0);
        counts
    }

    fn merge(&mut self, other: Self) -> Result<()> {
        match (self, other) {
            (
                ContainerResource::Calendar { calendars, events },
                ContainerResource::Calendar {
                    calendars: more_calendars,
                    events: more_events,
                },
            ) => {
                calendars.extend(more_calendars);
                events.extend(more_events);
                Ok(())
            }
            (
                ContainerResource::Photos { albums, photos },
                ContainerResource::Photos {
                    albums: more_albums,
                    photos: more_photos,
                },
            ) => {
                albums.extend(more_albums);
                photos.extend(more_photos);
                Ok(())
            }
            (this, other) => Err(TransferError::IncompatibleContainers {
                from: other.kind(),
                into: this.kind(),
            }),
        }
    }
}

/// Provider-owned continuation cursor
///
/// `Phased` carries the level the token belongs to, so a provider that
/// serves several levels from one export entry point can tell which phase
/// a resumed call continues.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaginationData {
    Page { number: u64 },
    Token { token: String },
    Phased { phase: String, token: String },
}

impl PaginationData {
    pub fn page(number: u64) -> Self {
        PaginationData::Page { number }
    }

    pub fn token(token: impl Into<String>) -> Self {
        PaginationData::Token {
            token: token.into(),
        }
    }

    pub fn phased(phase: impl Into<String>, token: impl Into<String>) -> Self {
        PaginationData::Phased {
            phase: phase.into(),
            token: token.into(),
        }
    }

    /// Parse the `PHASE:token` text form
    pub fn parse_phased(s: &str) -> Option<Self> {
        let (phase, token) = s.split_once(':')?;
        if phase.is_empty() {
            return None;
        }
        Some(Self::phased(phase, token))
    }

    pub fn phase(&self) -> Option<&str> {
        match self {
            PaginationData::Phased { phase, .. } => Some(phase),
            _ => None,
        }
    }
}

impl fmt::Display for PaginationData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaginationData::Page { number } => write!(f, "{}", number),
            PaginationData::Token { token } => f.write_str(token),
            PaginationData::Phased { phase, token } => write!(f, "{}:{}", phase, token),
        }
    }
}

/// Input to one export call; both fields empty on the root call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportInformation {
    pub pagination_data: Option<PaginationData>,
    pub container_resource: Option<ContainerResource>,
}

impl ExportInformation {
    pub fn new(
        pagination_data: Option<PaginationData>,
        container_resource: Option<ContainerResource>,
    ) -> Self {
        Self {
            pagination_data,
            container_resource,
        }
    }

    pub fn is_root(&self) -> bool {
        self.pagination_data.is_none() && self.container_resource.is_none()
    }
}

/// What to fetch after the current export call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationData {
    pub pagination_data: Option<PaginationData>,
    pub container_resources: Vec<ContainerResource>,
}

impl ContinuationData {
    pub fn new(pagination_data: Option<PaginationData>) -> Self {
        Self {
            pagination_data,
            container_resources: Vec::new(),
        }
    }

    pub fn add_container_resource(&mut self, resource: ContainerResource) {
        self.container_resources.push(resource);
    }

    pub fn is_exhausted(&self) -> bool {
        self.pagination_data.is_none() && self.container_resources.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResultType {
    Continue,
    End,
    Error,
}

/// Output of one export call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportResult {
    pub result_type: ResultType,
    pub exported_data: Option<ContainerResource>,
    pub continuation_data: Option<ContinuationData>,
    pub error: Option<String>,
}

impl ExportResult {
    pub fn continue_with(
        exported_data: Option<ContainerResource>,
        continuation_data: ContinuationData,
    ) -> Self {
        Self {
            result_type: ResultType::Continue,
            exported_data,
            continuation_data: Some(continuation_data),
            error: None,
        }
    }

    pub fn end(exported_data: Option<ContainerResource>) -> Self {
        Self {
            result_type: ResultType::End,
            exported_data,
            continuation_data: None,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            result_type: ResultType::Error,
            exported_data: None,
            continuation_data: None,
            error: Some(message.into()),
        }
    }
}
