//! Image data models
//!
//! Types representing downloadable image variants.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Release channel of a variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Alpha,
    Beta,
    Rc,
    Stable,
}

impl Channel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "alpha" => Some(Self::Alpha),
            "beta" => Some(Self::Beta),
            "rc" => Some(Self::Rc),
            "stable" | "release" | "" => Some(Self::Stable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    X86_64,
    I686,
    Aarch64,
    Armv7hl,
    Ppc64le,
    Riscv64,
    Unknown,
}

impl Architecture {
    /// Parse the usual spellings ("amd64", "x86-64", "arm64", ...)
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "x86_64" | "x86-64" | "amd64" | "x64" => Self::X86_64,
            "i686" | "i586" | "i386" | "x86" => Self::I686,
            "aarch64" | "arm64" => Self::Aarch64,
            "armv7hl" | "armhf" | "armv7" | "arm" => Self::Armv7hl,
            "ppc64le" | "ppc64el" => Self::Ppc64le,
            "riscv64" => Self::Riscv64,
            _ => Self::Unknown,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::I686 => "i686",
            Self::Aarch64 => "aarch64",
            Self::Armv7hl => "armv7hl",
            Self::Ppc64le => "ppc64le",
            Self::Riscv64 => "riscv64",
            Self::Unknown => "unknown",
        }
    }
}

/// Compression codec wrapping the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    None,
    Gzip,
    Xz,
}

/// Outer compression/archive wrapping of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerType {
    #[serde(rename = "raw")]
    Raw,
    #[serde(rename = "tar")]
    Tar,
    #[serde(rename = "gzip-tar")]
    TarGz,
    #[serde(rename = "xz-tar")]
    TarXz,
    #[serde(rename = "gzip-raw")]
    RawGz,
    #[serde(rename = "xz-raw")]
    RawXz,
    #[serde(rename = "recovery")]
    Recovery,
}

/// File name suffixes, longest first within each type
const SUFFIXES: &[(ContainerType, &[&str])] = &[
    (ContainerType::Recovery, &[".recovery.tar", ".trc"]),
    (ContainerType::TarGz, &[".tar.gz", ".tgz"]),
    (ContainerType::TarXz, &[".tar.xz", ".txz", ".archive"]),
    (ContainerType::Tar, &[".tar"]),
    (ContainerType::RawGz, &[".img.gz", ".iso.gz", ".raw.gz", ".igz", ".gz"]),
    (ContainerType::RawXz, &[".img.xz", ".iso.xz", ".raw.xz", ".ixz", ".xz"]),
    (ContainerType::Raw, &[".img", ".iso", ".raw", ".dvd"]),
];

impl ContainerType {
    /// Detect the container type from a file name or URL path
    pub fn from_file_name(name: &str) -> Option<Self> {
        let lower = name.to_lowercase();
        SUFFIXES
            .iter()
            .find(|(_, suffixes)| suffixes.iter().any(|s| lower.ends_with(s)))
            .map(|(kind, _)| *kind)
    }

    pub fn codec(self) -> Codec {
        match self {
            Self::Raw | Self::Tar | Self::Recovery => Codec::None,
            Self::TarGz | Self::RawGz => Codec::Gzip,
            Self::TarXz | Self::RawXz => Codec::Xz,
        }
    }

    pub fn is_tar(self) -> bool {
        matches!(self, Self::Tar | Self::TarGz | Self::TarXz | Self::Recovery)
    }

    /// Recovery archives are meant for a recovery tool, not for a raw drive
    pub fn can_write(self) -> bool {
        self != Self::Recovery
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Raw => "IMG",
            Self::Tar => "TAR Archive",
            Self::TarGz => "GZIP TAR Archive",
            Self::TarXz => "LZMA TAR Archive",
            Self::RawGz => "GZIP IMG",
            Self::RawXz => "LZMA IMG",
            Self::Recovery => "Recovery TAR Archive",
        }
    }
}

impl fmt::Display for ContainerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Sha256,
    Sha512,
}

impl ChecksumAlgorithm {
    fn hex_len(self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha512 => 128,
        }
    }
}

/// Declared digest of a downloadable file
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub digest: String,
}

impl Checksum {
    /// Build a checksum, validating that `digest` is hex of the right length
    pub fn new(algorithm: ChecksumAlgorithm, digest: &str) -> Result<Self, String> {
        let digest = digest.trim().to_lowercase();
        if digest.len() != algorithm.hex_len() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("Invalid {:?} digest: {}", algorithm, digest));
        }
        Ok(Self { algorithm, digest })
    }

    /// Parse "sha256:<hex>" / "sha512:<hex>", or a bare SHA-256 hex string
    pub fn parse(s: &str) -> Result<Self, String> {
        match s.split_once(':') {
            Some((alg, digest)) => {
                let algorithm = match alg.trim().to_lowercase().as_str() {
                    "sha256" => ChecksumAlgorithm::Sha256,
                    "sha512" => ChecksumAlgorithm::Sha512,
                    other => return Err(format!("Unsupported checksum algorithm: {}", other)),
                };
                Self::new(algorithm, digest)
            }
            None => Self::new(ChecksumAlgorithm::Sha256, s),
        }
    }
}

/// Where a variant's image comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantSource {
    Remote { url: String },
    Local { path: PathBuf },
}

/// One selectable, downloadable OS image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    pub name: String,
    pub version: String,
    pub channel: Channel,
    pub arch: Architecture,
    pub board: String,
    pub source: VariantSource,
    /// Declared size of the file to download
    pub size: u64,
    /// Declared size after decompression, when the catalog knows it
    pub image_size: Option<u64>,
    pub checksum: Option<Checksum>,
    pub container: ContainerType,
    pub live: bool,
}

impl Variant {
    /// Variant for an image file the user already has
    pub fn local(path: &Path) -> Result<Self, String> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or("Invalid filename")?;
        let container = ContainerType::from_file_name(file_name)
            .ok_or_else(|| format!("Unknown image type: {}", file_name))?;
        let size = std::fs::metadata(path)
            .map_err(|e| format!("Cannot read {}: {}", path.display(), e))?
            .len();

        Ok(Self {
            id: format!("local:{}", path.display()),
            name: file_name.to_string(),
            version: String::new(),
            channel: Channel::Stable,
            arch: Architecture::Unknown,
            board: String::new(),
            source: VariantSource::Local {
                path: path.to_path_buf(),
            },
            size,
            image_size: (container.codec() == Codec::None && !container.is_tar()).then_some(size),
            checksum: None,
            container,
            live: false,
        })
    }

    pub fn is_local(&self) -> bool {
        matches!(self.source, VariantSource::Local { .. })
    }

    pub fn url(&self) -> Option<&str> {
        match &self.source {
            VariantSource::Remote { url } => Some(url),
            VariantSource::Local { .. } => None,
        }
    }

    /// File name the image is stored under
    pub fn file_name(&self) -> String {
        match &self.source {
            VariantSource::Remote { url } => crate::utils::file_name_from_url(url)
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}.img", crate::utils::normalize_slug(&self.id))),
            VariantSource::Local { path } => path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
        }
    }

    /// Path of the image file: the local file, or the file inside `downloads_dir`
    pub fn file_path(&self, downloads_dir: &Path) -> PathBuf {
        match &self.source {
            VariantSource::Local { path } => path.clone(),
            VariantSource::Remote { .. } => downloads_dir.join(self.file_name()),
        }
    }

    pub fn display_name(&self) -> String {
        let mut out = format!("{} {} | {}", self.name, self.version, self.arch.name());
        if !self.board.is_empty() {
            out.push_str(" | ");
            out.push_str(&self.board);
        }
        if self.live {
            out.push_str(" LIVE");
        }
        out
    }
}
