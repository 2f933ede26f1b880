//! Catalog extraction and filtering
//!
//! Functions for pulling variant records out of release JSON and
//! narrowing them down to what the user is interested in.

use std::collections::HashMap;

use crate::log_warn;
use crate::utils::normalize_slug;

use super::models::{Architecture, Channel, Checksum, ChecksumAlgorithm, ContainerType, Variant};
use super::models::VariantSource;
use super::CatalogEntry;

const MODULE: &str = "catalog";

/// Extract all variant records from the nested JSON structure
pub fn extract_variants(json: &serde_json::Value) -> Vec<Variant> {
    let mut variants = Vec::new();
    extract_variants_recursive(json, &mut variants);
    variants
}

fn extract_variants_recursive(value: &serde_json::Value, variants: &mut Vec<Variant>) {
    match value {
        serde_json::Value::Object(map) => {
            if map.contains_key("link") {
                match serde_json::from_value::<CatalogEntry>(value.clone()) {
                    Ok(entry) => {
                        if let Some(variant) = entry_to_variant(entry) {
                            variants.push(variant);
                        }
                    }
                    Err(e) => log_warn!(MODULE, "Skipping malformed catalog entry: {}", e),
                }
                return;
            }
            for (_, v) in map {
                extract_variants_recursive(v, variants);
            }
        }
        serde_json::Value::Array(arr) => {
            for v in arr {
                extract_variants_recursive(v, variants);
            }
        }
        _ => {}
    }
}

fn parse_size(size: Option<&serde_json::Value>) -> Option<u64> {
    match size? {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn entry_checksum(entry: &CatalogEntry) -> Option<Checksum> {
    let parsed = if let Some(ref digest) = entry.digest {
        Checksum::parse(digest)
    } else if let Some(ref hex) = entry.sha512 {
        Checksum::new(ChecksumAlgorithm::Sha512, hex)
    } else if let Some(ref hex) = entry.sha256 {
        Checksum::new(ChecksumAlgorithm::Sha256, hex)
    } else {
        return None;
    };

    match parsed {
        Ok(sum) => Some(sum),
        Err(e) => {
            log_warn!(MODULE, "Ignoring checksum for {}: {}", entry.link, e);
            None
        }
    }
}

/// Turn a raw catalog record into a [`Variant`]. Records without a
/// recognizable image type are dropped.
pub(super) fn entry_to_variant(entry: CatalogEntry) -> Option<Variant> {
    let file_name = crate::utils::file_name_from_url(&entry.link)?;
    let container = match entry.container {
        Some(container) => container,
        None => match ContainerType::from_file_name(file_name) {
            Some(container) => container,
            None => {
                log_warn!(MODULE, "Skipping {}: unknown image type", entry.link);
                return None;
            }
        },
    };

    let checksum = entry_checksum(&entry);
    let channel = entry
        .channel
        .as_deref()
        .and_then(Channel::parse)
        .unwrap_or(Channel::Stable);
    let arch = entry
        .arch
        .as_deref()
        .map(Architecture::parse)
        .unwrap_or(Architecture::Unknown);
    let name = entry
        .name
        .clone()
        .or_else(|| entry.subvariant.clone())
        .unwrap_or_else(|| file_name.to_string());
    let version = entry.version.clone().unwrap_or_default();
    let board = entry.board.clone().unwrap_or_default();
    let id = entry.id.clone().unwrap_or_else(|| {
        normalize_slug(&format!("{}-{}-{}-{}", name, version, arch.name(), board))
    });

    Some(Variant {
        id,
        name,
        version,
        channel,
        arch,
        board,
        size: parse_size(entry.size.as_ref()).unwrap_or(0),
        image_size: parse_size(entry.image_size.as_ref()),
        checksum,
        container,
        live: entry.live.unwrap_or(false),
        source: VariantSource::Remote { url: entry.link },
    })
}

/// Criteria for narrowing a variant list. `None` matches anything.
#[derive(Debug, Clone, Default)]
pub struct VariantFilter {
    pub arch: Option<Architecture>,
    pub board: Option<String>,
    pub channel: Option<Channel>,
    /// Hide pre-release channels
    pub stable_only: bool,
    /// Only variants that can be written to a drive as-is
    pub writable_only: bool,
}

/// Filter and sort variants: stable first, then newest version first
pub fn filter_variants(variants: &[Variant], filter: &VariantFilter) -> Vec<Variant> {
    let board = filter.board.as_deref().map(normalize_slug);

    let mut filtered: Vec<Variant> = variants
        .iter()
        .filter(|v| {
            if let Some(arch) = filter.arch {
                if v.arch != arch {
                    return false;
                }
            }

            if let Some(ref board) = board {
                if &normalize_slug(&v.board) != board {
                    return false;
                }
            }

            if let Some(channel) = filter.channel {
                if v.channel != channel {
                    return false;
                }
            }

            if filter.stable_only && v.channel != Channel::Stable {
                return false;
            }

            !(filter.writable_only && !v.container.can_write())
        })
        .cloned()
        .collect();

    filtered.sort_by(|a, b| {
        b.channel
            .cmp(&a.channel)
            .then_with(|| compare_versions(&b.version, &a.version))
            .then_with(|| a.name.cmp(&b.name))
    });

    filtered
}

/// Compare dotted version strings numerically where possible
fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let mut left = a.split(['.', '-']);
    let mut right = b.split(['.', '-']);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return std::cmp::Ordering::Equal,
            (None, Some(_)) => return std::cmp::Ordering::Less,
            (Some(_), None) => return std::cmp::Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    _ => x.cmp(y),
                };
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Board summary for listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardInfo {
    pub slug: String,
    pub name: String,
    pub variant_count: usize,
}

/// Get unique board list from variants
pub fn get_unique_boards(variants: &[Variant]) -> Vec<BoardInfo> {
    let mut board_map: HashMap<String, BoardInfo> = HashMap::new();

    for variant in variants.iter().filter(|v| !v.board.is_empty()) {
        let slug = normalize_slug(&variant.board);
        board_map
            .entry(slug.clone())
            .or_insert_with(|| BoardInfo {
                slug,
                name: variant.board.clone(),
                variant_count: 0,
            })
            .variant_count += 1;
    }

    let mut boards: Vec<BoardInfo> = board_map.into_values().collect();
    boards.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    boards
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> serde_json::Value {
        json!({
            "releases": [
                {
                    "name": "Workstation",
                    "version": "38",
                    "arch": "x86_64",
                    "link": "https://example.org/Fedora-38-x86_64.iso",
                    "size": "2147483648",
                    "sha256": "ab".repeat(32),
                    "live": true
                },
                {
                    "name": "Workstation",
                    "version": "39",
                    "arch": "x86_64",
                    "channel": "beta",
                    "link": "https://example.org/Fedora-39-x86_64.iso",
                    "size": 2200000000u64
                },
                {
                    "name": "Minimal",
                    "version": "38",
                    "arch": "aarch64",
                    "board": "Raspberry Pi 4",
                    "link": "https://example.org/Minimal-38-aarch64.raw.xz",
                    "image_size": "4294967296"
                },
                {
                    "name": "Recovery",
                    "version": "1",
                    "arch": "aarch64",
                    "board": "raspberry-pi-4",
                    "link": "https://example.org/board.recovery.tar"
                },
                { "name": "Notes", "link": "https://example.org/README.txt" }
            ]
        })
    }

    #[test]
    fn test_extract_variants() {
        let variants = extract_variants(&sample());
        assert_eq!(variants.len(), 4);

        let ws = &variants[0];
        assert_eq!(ws.size, 2147483648);
        assert!(ws.live);
        assert!(ws.checksum.is_some());
        assert_eq!(ws.container, ContainerType::Raw);

        let minimal = &variants[2];
        assert_eq!(minimal.container, ContainerType::RawXz);
        assert_eq!(minimal.image_size, Some(4294967296));
    }

    #[test]
    fn test_filter_variants_sorting_and_criteria() {
        let variants = extract_variants(&sample());

        let x86 = filter_variants(
            &variants,
            &VariantFilter {
                arch: Some(Architecture::X86_64),
                ..Default::default()
            },
        );
        assert_eq!(x86.len(), 2);
        assert_eq!(x86[0].channel, Channel::Stable);

        let stable = filter_variants(
            &variants,
            &VariantFilter {
                stable_only: true,
                writable_only: true,
                ..Default::default()
            },
        );
        assert!(stable.iter().all(|v| v.channel == Channel::Stable));
        assert!(stable.iter().all(|v| v.container.can_write()));
        assert_eq!(stable.len(), 2);
    }

    #[test]
    fn test_unique_boards_merges_slugs() {
        let variants = extract_variants(&sample());
        let boards = get_unique_boards(&variants);
        assert_eq!(boards.len(), 1);
        assert_eq!(boards[0].slug, "raspberry-pi-4");
        assert_eq!(boards[0].variant_count, 2);
    }

    #[test]
    fn test_compare_versions() {
        use std::cmp::Ordering;
        assert_eq!(compare_versions("10", "9"), Ordering::Greater);
        assert_eq!(compare_versions("38.1", "38"), Ordering::Greater);
        assert_eq!(compare_versions("38", "38"), Ordering::Equal);
    }
}
