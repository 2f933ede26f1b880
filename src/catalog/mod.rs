//! Image catalog
//!
//! Fetches and parses the release catalog into [`Variant`]s.

mod filters;
mod models;

pub use filters::{extract_variants, filter_variants, get_unique_boards, BoardInfo, VariantFilter};
pub use models::{
    Architecture, Channel, Checksum, ChecksumAlgorithm, Codec, ContainerType, Variant,
    VariantSource,
};

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::config;
use crate::{log_error, log_info};

const MODULE: &str = "catalog";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to fetch catalog: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("Catalog request failed with status {0}")]
    Status(u16),
    #[error("Failed to read catalog {}: {source}", .path.display())]
    Read {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Raw catalog record as published
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CatalogEntry {
    pub id: Option<String>,
    pub name: Option<String>,
    pub subvariant: Option<String>,
    pub version: Option<String>,
    pub arch: Option<String>,
    pub board: Option<String>,
    pub channel: Option<String>,
    pub link: String,
    /// Numbers or numeric strings, both occur in the wild
    pub size: Option<serde_json::Value>,
    pub image_size: Option<serde_json::Value>,
    pub sha256: Option<String>,
    pub sha512: Option<String>,
    /// "sha256:<hex>" style digest
    pub digest: Option<String>,
    pub container: Option<ContainerType>,
    pub live: Option<bool>,
}

/// Parse catalog JSON text
pub fn parse_catalog(text: &str) -> Result<Vec<Variant>, CatalogError> {
    let json: serde_json::Value = serde_json::from_str(text)?;
    let variants = extract_variants(&json);
    log_info!(MODULE, "Catalog lists {} variants", variants.len());
    Ok(variants)
}

/// Load a catalog from a local JSON file
pub fn load_catalog_file(path: &Path) -> Result<Vec<Variant>, CatalogError> {
    let text = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_catalog(&text)
}

/// Fetch the catalog from `url`
pub async fn fetch_catalog(url: &str) -> Result<Vec<Variant>, CatalogError> {
    log_info!(MODULE, "Fetching catalog from {}", url);

    let client = reqwest::Client::builder()
        .user_agent(config::app::USER_AGENT)
        .build()?;

    let response = client.get(url).send().await.map_err(|e| {
        log_error!(MODULE, "Failed to fetch catalog: {}", e);
        e
    })?;

    if !response.status().is_success() {
        return Err(CatalogError::Status(response.status().as_u16()));
    }

    let text = response.text().await?;
    parse_catalog(&text)
}
