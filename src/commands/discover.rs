//! Discover command: describe every configured stream as a Singer catalog.

use serde::Serialize;
use serde_json::Value;

use crate::catalog::SurveyCatalog;

#[derive(Debug, Serialize)]
pub struct DiscoveredStream {
    pub tap_stream_id: String,
    pub stream: String,
    pub schema: Value,
    pub metadata: Vec<Value>,
}

#[derive(Debug, Serialize)]
pub struct DiscoveredCatalog {
    pub streams: Vec<DiscoveredStream>,
}

/// Builds the catalog document, one entry per survey in catalog order.
pub fn discover(catalog: &SurveyCatalog) -> DiscoveredCatalog {
    DiscoveredCatalog {
        streams: catalog
            .surveys()
            .iter()
            .map(|survey| DiscoveredStream {
                tap_stream_id: survey.stream.clone(),
                stream: survey.stream.clone(),
                schema: survey.json_schema(),
                metadata: Vec::new(),
            })
            .collect(),
    }
}
