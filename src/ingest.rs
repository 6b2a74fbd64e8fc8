//! Loading the inputs of a run: keypress templates and the phone list

use crate::store::{EndpointStore, StoreError};
use indexmap::IndexMap;
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, warn};

/// Template name -> ordered keypress URLs, in file order
pub type Templates = IndexMap<String, Vec<String>>;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Failed to read '{path}': {source}")]
    Io {
        source: std::io::Error,
        path: String,
    },

    #[error("Failed to parse templates '{path}': {source}")]
    Yaml {
        source: serde_yaml::Error,
        path: String,
    },

    #[error("Unknown template {name:?}, available: {available:?}")]
    UnknownTemplate { name: String, available: Vec<String> },
}

fn read(path: &Path) -> Result<String, IngestError> {
    std::fs::read_to_string(path).map_err(|source| IngestError::Io {
        source,
        path: path.display().to_string(),
    })
}

/// Parse a YAML mapping of template names to keypress lists
pub fn parse_templates(text: &str) -> Result<Templates, serde_yaml::Error> {
    serde_yaml::from_str(text)
}

pub fn load_templates(path: &Path) -> Result<Templates, IngestError> {
    parse_templates(&read(path)?).map_err(|source| IngestError::Yaml {
        source,
        path: path.display().to_string(),
    })
}

/// Look up the keypress list of one template
pub fn select_template<'a>(templates: &'a Templates, name: &str) -> Result<&'a [String], IngestError> {
    templates
        .get(name)
        .map(Vec::as_slice)
        .ok_or_else(|| IngestError::UnknownTemplate {
            name: name.to_string(),
            available: templates.keys().cloned().collect(),
        })
}

/// Extract phone addresses, one per line.
///
/// Cells of a comma-separated line are joined. Values that are not an
/// IPv4/IPv6 literal are logged and skipped.
pub fn parse_addresses(text: &str) -> Vec<String> {
    let mut addresses = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let joined: String = line
            .split(',')
            .map(|cell| cell.trim().trim_matches('"'))
            .collect();
        if joined.is_empty() {
            continue;
        }
        match joined.parse::<IpAddr>() {
            Ok(_) => addresses.push(joined),
            Err(e) => warn!("Line {}: skipping {:?}: {}", number + 1, joined, e),
        }
    }
    addresses
}

pub fn read_addresses(path: &Path) -> Result<Vec<String>, IngestError> {
    Ok(parse_addresses(&read(path)?))
}

/// Insert every new address, returning how many were added
pub async fn ingest(store: &dyn EndpointStore, addresses: &[String]) -> Result<usize, StoreError> {
    let mut inserted = 0;
    for address in addresses {
        if store.find(address).await?.is_some() {
            debug!("{} already known", address);
            continue;
        }
        inserted += store.insert(address).await?;
    }
    Ok(inserted)
}
