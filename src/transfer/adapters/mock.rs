//! Mock providers for testing and local runs
//!
//! `MockExporter` serves scripted export results keyed by the requested
//! descriptor; `MockImporter` records imported item ids and can be told to
//! fail specific items or to run out of space.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::traits::{Exporter, Importer};
use crate::transfer::error::ProviderError;
use crate::transfer::executor::IdempotentImportExecutor;
use crate::transfer::resource::{
    CalendarEventModel, CalendarModel, ContainerResource, ContinuationData, DataContainer,
    ExportInformation, ExportResult, PaginationData, PhotoAlbum, PhotoModel,
};
use crate::transfer::types::{AuthData, ImportResult, ImportableItem, ItemImportResult, JobId};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn descriptor_key(info: Option<&ExportInformation>) -> String {
    format!("{:?}", info.cloned().unwrap_or_default())
}

/// Mock exporter for testing
pub struct MockExporter {
    name: String,
    /// Map of descriptor -> scripted result
    results: Mutex<HashMap<String, ExportResult>>,
    /// Number of upcoming calls that fail with a transient error
    transient_failures: Mutex<u32>,
    calls: Mutex<Vec<ExportInformation>>,
    returned: Mutex<Vec<ExportResult>>,
}

impl MockExporter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            results: Mutex::new(HashMap::new()),
            transient_failures: Mutex::new(0),
            calls: Mutex::new(Vec::new()),
            returned: Mutex::new(Vec::new()),
        }
    }

    /// Set the result for a descriptor; `None` is the root call
    pub fn set_result(&self, info: Option<ExportInformation>, result: ExportResult) {
        lock(&self.results).insert(descriptor_key(info.as_ref()), result);
    }

    /// Fail the next `count` calls with a transient error
    pub fn fail_next(&self, count: u32) {
        *lock(&self.transient_failures) = count;
    }

    /// Descriptors requested so far, in call order
    pub fn calls(&self) -> Vec<ExportInformation> {
        lock(&self.calls).clone()
    }

    /// Results handed out so far, in call order
    pub fn returned(&self) -> Vec<ExportResult> {
        lock(&self.returned).clone()
    }

    /// Two calendars; the first one pages its events
    pub fn calendar_demo(name: &str) -> Self {
        let exporter = Self::new(name);

        let calendars = vec![
            CalendarModel {
                id: "work".to_string(),
                name: "Work".to_string(),
                description: None,
            },
            CalendarModel {
                id: "home".to_string(),
                name: "Home".to_string(),
                description: Some("Family".to_string()),
            },
        ];
        let mut root = ContinuationData::new(None);
        for calendar in &calendars {
            root.add_container_resource(ContainerResource::id_only(&calendar.id));
        }
        exporter.set_result(
            None,
            ExportResult::continue_with(
                Some(ContainerResource::Calendar {
                    calendars,
                    events: Vec::new(),
                }),
                root,
            ),
        );

        let event = |calendar_id: &str, title: &str, day: u32| CalendarEventModel {
            calendar_id: calendar_id.to_string(),
            title: title.to_string(),
            location: None,
            start_time: Utc.with_ymd_and_hms(2024, 5, day, 9, 0, 0).single(),
            end_time: Utc.with_ymd_and_hms(2024, 5, day, 10, 0, 0).single(),
        };
        let events = |list: Vec<CalendarEventModel>| ContainerResource::Calendar {
            calendars: Vec::new(),
            events: list,
        };

        let next_page = PaginationData::phased("EVENTS", "page-2");
        exporter.set_result(
            Some(ExportInformation::new(None, Some(ContainerResource::id_only("work")))),
            ExportResult::continue_with(
                Some(events(vec![event("work", "Standup", 1), event("work", "Review", 2)])),
                ContinuationData::new(Some(next_page.clone())),
            ),
        );
        exporter.set_result(
            Some(ExportInformation::new(
                Some(next_page),
                Some(ContainerResource::id_only("work")),
            )),
            ExportResult::end(Some(events(vec![event("work", "Retro", 3)]))),
        );
        exporter.set_result(
            Some(ExportInformation::new(None, Some(ContainerResource::id_only("home")))),
            ExportResult::end(Some(events(vec![event("home", "Dinner", 4)]))),
        );

        exporter
    }

    /// One album holding two photos
    pub fn photos_demo(name: &str) -> Self {
        let exporter = Self::new(name);

        let mut root = ContinuationData::new(None);
        root.add_container_resource(ContainerResource::id_only("album-1"));
        exporter.set_result(
            None,
            ExportResult::continue_with(
                Some(ContainerResource::Photos {
                    albums: vec![PhotoAlbum {
                        id: "album-1".to_string(),
                        name: "Holidays".to_string(),
                        description: None,
                    }],
                    photos: Vec::new(),
                }),
                root,
            ),
        );

        let photo = |id: &str, title: &str| PhotoModel {
            title: title.to_string(),
            fetchable_url: format!("https://photos.example.com/{}", id),
            media_type: "image/jpeg".to_string(),
            data_id: id.to_string(),
            album_id: Some("album-1".to_string()),
        };
        exporter.set_result(
            Some(ExportInformation::new(None, Some(ContainerResource::id_only("album-1")))),
            ExportResult::end(Some(ContainerResource::Photos {
                albums: Vec::new(),
                photos: vec![photo("p-1", "Beach"), photo("p-2", "Sunset")],
            })),
        );

        exporter
    }
}

#[async_trait]
impl Exporter for MockExporter {
    async fn export(
        &self,
        job_id: JobId,
        _auth_data: &AuthData,
        export_info: Option<ExportInformation>,
    ) -> Result<ExportResult, ProviderError> {
        log::debug!("[{}] export({}, {:?})", self.name, job_id, export_info);
        lock(&self.calls).push(export_info.clone().unwrap_or_default());

        {
            let mut failures = lock(&self.transient_failures);
            if *failures > 0 {
                *failures -= 1;
                return Err(ProviderError::Transient("injected failure".to_string()));
            }
        }

        let key = descriptor_key(export_info.as_ref());
        let result = lock(&self.results)
            .get(&key)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("nothing to export for {}", key)))?;
        lock(&self.returned).push(result.clone());
        Ok(result)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Mock importer for testing
pub struct MockImporter {
    name: String,
    imported: Mutex<Vec<String>>,
    failing_items: Mutex<HashSet<String>>,
    /// Items accepted before reporting the destination full
    quota: Mutex<Option<usize>>,
}

impl MockImporter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            imported: Mutex::new(Vec::new()),
            failing_items: Mutex::new(HashSet::new()),
            quota: Mutex::new(None),
        }
    }

    /// Make imports of `id` fail with a transient error
    pub fn set_failing(&self, id: &str) {
        lock(&self.failing_items).insert(id.to_string());
    }

    pub fn clear_failing(&self) {
        lock(&self.failing_items).clear();
    }

    pub fn set_quota(&self, items: usize) {
        *lock(&self.quota) = Some(items);
    }

    /// Idempotent ids written to the destination, in order
    pub fn imported(&self) -> Vec<String> {
        lock(&self.imported).clone()
    }

    fn check_quota(&self) -> Result<(), ProviderError> {
        match *lock(&self.quota) {
            Some(limit) if lock(&self.imported).len() >= limit => Err(
                ProviderError::DestinationFull("storage quota exceeded".to_string()),
            ),
            _ => Ok(()),
        }
    }

    fn write(&self, id: &str) -> Result<(), ProviderError> {
        if lock(&self.failing_items).contains(id) {
            return Err(ProviderError::Transient(format!("injected failure for {}", id)));
        }
        lock(&self.imported).push(id.to_string());
        Ok(())
    }
}

#[async_trait]
impl Importer for MockImporter {
    async fn import_item(
        &self,
        job_id: JobId,
        executor: &IdempotentImportExecutor,
        _auth_data: &AuthData,
        data: ContainerResource,
    ) -> Result<ImportResult, ProviderError> {
        log::debug!("[{}] import({}, {})", self.name, job_id, data.kind());
        let counts = data.item_counts();

        match data {
            ContainerResource::Calendar { calendars, events } => {
                for calendar in &calendars {
                    self.check_quota()?;
                    let id = calendar.idempotent_id();
                    executor
                        .execute_or_throw(&id, &calendar.name(), || async {
                            self.write(&id).map(|_| format!("dest-{}", id))
                        })
                        .await?;
                }
                for event in &events {
                    self.check_quota()?;
                    let parent = executor.get_cached_value::<String>(&event.calendar_id).ok();
                    let _: Option<String> = executor
                        .import_and_swallow_errors(event, || async {
                            let Some(parent) = parent else {
                                return Ok(ItemImportResult::error(
                                    format!("calendar {} was not imported", event.calendar_id),
                                    None,
                                ));
                            };
                            let id = event.idempotent_id();
                            self.write(&id)?;
                            Ok(ItemImportResult::success(format!("{}/{}", parent, id), None))
                        })
                        .await?;
                }
            }
            ContainerResource::Photos { albums, photos } => {
                for album in &albums {
                    self.check_quota()?;
                    let id = album.idempotent_id();
                    executor
                        .execute_or_throw(&id, &album.name(), || async {
                            self.write(&id).map(|_| format!("dest-{}", id))
                        })
                        .await?;
                }
                let mut bytes = 0u64;
                for photo in &photos {
                    self.check_quota()?;
                    let imported: Option<u64> = executor
                        .import_and_swallow_errors(photo, || async {
                            self.write(&photo.idempotent_id())?;
                            Ok(ItemImportResult::success(1024u64, Some(1024)))
                        })
                        .await?;
                    bytes += imported.unwrap_or(0);
                }
                return Ok(ImportResult::ok().with_counts(counts).with_bytes(bytes));
            }
            ContainerResource::IdOnly { .. } => {}
        }

        Ok(ImportResult::ok().with_counts(counts))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
