//! Provider registry
//!
//! Maps `(service id, data type)` to the factory that builds the adapter.
//! Everything is registered at startup; there is no runtime discovery.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::transfer::adapters::{Exporter, Importer, MockExporter, MockImporter};
use crate::transfer::error::{Result, TransferError};
use crate::transfer::types::DataType;

/// Shared client configuration handed to every adapter factory
#[derive(Debug, Clone)]
pub struct ProviderContext {
    pub service_id: String,
    pub data_type: DataType,
    pub request_timeout_ms: u64,
}

pub type ExporterFactory = fn(&ProviderContext) -> Arc<dyn Exporter>;
pub type ImporterFactory = fn(&ProviderContext) -> Arc<dyn Importer>;

pub const MOCK_SOURCE: &str = "mock-source";
pub const MOCK_DESTINATION: &str = "mock-dest";

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    exporters: HashMap<(String, DataType), ExporterFactory>,
    importers: HashMap<(String, DataType), ImporterFactory>,
    request_timeout_ms: u64,
}

impl ProviderRegistry {
    pub fn new(request_timeout_ms: u64) -> Self {
        Self {
            request_timeout_ms,
            ..Default::default()
        }
    }

    /// Registry serving the in-crate mock providers
    ///
    /// `mock-source` exports the demo calendar and photo data sets and
    /// `mock-dest` imports them.
    pub fn with_mock_providers() -> Self {
        let mut registry = Self::new(30_000);

        registry.register_exporter(MOCK_SOURCE, DataType::Calendar, |ctx: &ProviderContext| -> Arc<dyn Exporter> {
            Arc::new(MockExporter::calendar_demo(&ctx.service_id))
        });
        registry.register_exporter(MOCK_SOURCE, DataType::Photos, |ctx: &ProviderContext| -> Arc<dyn Exporter> {
            Arc::new(MockExporter::photos_demo(&ctx.service_id))
        });
        for data_type in [DataType::Calendar, DataType::Photos] {
            registry.register_importer(MOCK_DESTINATION, data_type, |ctx: &ProviderContext| -> Arc<dyn Importer> {
                Arc::new(MockImporter::new(&ctx.service_id))
            });
        }

        registry
    }

    pub fn register_exporter(&mut self, service_id: &str, data_type: DataType, factory: ExporterFactory) {
        self.exporters.insert((service_id.to_string(), data_type), factory);
    }

    pub fn register_importer(&mut self, service_id: &str, data_type: DataType, factory: ImporterFactory) {
        self.importers.insert((service_id.to_string(), data_type), factory);
    }

    pub fn exporter(&self, service_id: &str, data_type: DataType) -> Result<Arc<dyn Exporter>> {
        let factory = self
            .exporters
            .get(&(service_id.to_string(), data_type))
            .ok_or_else(|| unknown("exporter", service_id, data_type))?;
        Ok(factory(&self.context(service_id, data_type)))
    }

    pub fn importer(&self, service_id: &str, data_type: DataType) -> Result<Arc<dyn Importer>> {
        let factory = self
            .importers
            .get(&(service_id.to_string(), data_type))
            .ok_or_else(|| unknown("importer", service_id, data_type))?;
        Ok(factory(&self.context(service_id, data_type)))
    }

    pub fn has_exporter(&self, service_id: &str, data_type: DataType) -> bool {
        self.exporters.contains_key(&(service_id.to_string(), data_type))
    }

    pub fn has_importer(&self, service_id: &str, data_type: DataType) -> bool {
        self.importers.contains_key(&(service_id.to_string(), data_type))
    }

    /// Services able to export `data_type`, sorted
    pub fn export_services(&self, data_type: DataType) -> Vec<String> {
        services(self.exporters.keys(), data_type)
    }

    /// Services able to import `data_type`, sorted
    pub fn import_services(&self, data_type: DataType) -> Vec<String> {
        services(self.importers.keys(), data_type)
    }

    fn context(&self, service_id: &str, data_type: DataType) -> ProviderContext {
        ProviderContext {
            service_id: service_id.to_string(),
            data_type,
            request_timeout_ms: self.request_timeout_ms,
        }
    }
}

fn services<'a>(keys: impl Iterator<Item = &'a (String, DataType)>, data_type: DataType) -> Vec<String> {
    keys.filter(|(_, dt)| *dt == data_type)
        .map(|(service, _)| service.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn unknown(role: &'static str, service_id: &str, data_type: DataType) -> TransferError {
    TransferError::UnknownProvider {
        role,
        service: service_id.to_string(),
        data_type: data_type.to_string(),
    }
}
