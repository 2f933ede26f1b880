//! Formatting utilities for human-readable output

/// Bytes per megabyte
pub const MB: u64 = 1024 * 1024;

/// Convert bytes to megabytes as f64 (for calculations and logging)
#[inline]
pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / MB as f64
}

/// Format bytes into human-readable size string (e.g., "1.5 GB", "256 MB")
pub fn format_size(bytes: u64) -> String {
    const UNITS: [(&str, u64); 4] = [
        ("TB", 1 << 40),
        ("GB", 1 << 30),
        ("MB", 1 << 20),
        ("KB", 1 << 10),
    ];

    for (unit, scale) in UNITS {
        if bytes >= scale {
            let value = bytes as f64 / scale as f64;
            return if scale >= 1 << 30 {
                format!("{:.1} {}", value, unit)
            } else {
                format!("{:.0} {}", value, unit)
            };
        }
    }
    format!("{} B", bytes)
}

/// Transfer rate, e.g. "12.3 MB/s"
pub fn format_rate(bytes: u64, elapsed_secs: f64) -> String {
    if elapsed_secs <= 0.0 {
        return "-".to_string();
    }
    format!("{:.1} MB/s", bytes_to_mb(bytes) / elapsed_secs)
}

/// Lowercase, hyphen-separated form of a name for matching
pub fn normalize_slug(slug: &str) -> String {
    slug.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1024), "1 KB");
        assert_eq!(format_size(1048576), "1 MB");
        assert_eq!(format_size(1073741824), "1.0 GB");
        assert_eq!(format_size(1610612736), "1.5 GB");
    }

    #[test]
    fn test_format_rate() {
        assert_eq!(format_rate(10 * MB, 2.0), "5.0 MB/s");
        assert_eq!(format_rate(10 * MB, 0.0), "-");
    }

    #[test]
    fn test_normalize_slug() {
        assert_eq!(normalize_slug("Orange-Pi-5"), "orange-pi-5");
        assert_eq!(normalize_slug("rock__pi__4"), "rock-pi-4");
        assert_eq!(normalize_slug("Raspberry Pi 4"), "raspberry-pi-4");
    }
}
