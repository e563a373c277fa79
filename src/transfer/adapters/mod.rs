//! Adapters module - provider exporters and importers

pub mod traits;
pub mod mock;

pub use traits::{Exporter, Importer};
pub use mock::{MockExporter, MockImporter};
