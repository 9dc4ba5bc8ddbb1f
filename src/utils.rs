//! Utility functions for tapestream

use std::path::Path;
use std::time::SystemTime;

/// Format bytes in human-readable format (B, KB, MB, GB, TB)
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    const THRESHOLD: u64 = 1024;

    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= THRESHOLD as f64 && unit_index < UNITS.len() - 1 {
        size /= THRESHOLD as f64;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Format duration in human-readable format
pub fn format_duration(duration_secs: f64) -> String {
    if duration_secs < 60.0 {
        format!("{:.1}s", duration_secs)
    } else if duration_secs < 3600.0 {
        let minutes = (duration_secs / 60.0) as u32;
        let seconds = duration_secs % 60.0;
        format!("{}m {:.1}s", minutes, seconds)
    } else {
        let hours = (duration_secs / 3600.0) as u32;
        let minutes = ((duration_secs % 3600.0) / 60.0) as u32;
        let seconds = duration_secs % 60.0;
        format!("{}h {}m {:.1}s", hours, minutes, seconds)
    }
}

/// Calculate transfer speed in human-readable format
pub fn format_speed(bytes: u64, duration_secs: f64) -> String {
    if duration_secs <= 0.0 {
        return "0 B/s".to_string();
    }

    let speed = bytes as f64 / duration_secs;
    format!("{}/s", format_bytes(speed as u64))
}

/// Truncate string to specified length with ellipsis
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        "...".to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

/// Manifest key for a source path: the absolute path without its leading `/`.
///
/// The same string is used as the archive entry name, so a restore into a
/// target directory recreates the source hierarchy beneath it.
pub fn archive_name(path: &Path) -> String {
    path.to_string_lossy().trim_start_matches('/').to_string()
}

/// Nanoseconds since the Unix epoch, negative for pre-epoch times.
pub fn system_time_ns(time: SystemTime) -> i64 {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64,
        Err(e) => -(e.duration().as_nanos() as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(16 << 30), "16.00 GB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(5.0), "5.0s");
        assert_eq!(format_duration(125.0), "2m 5.0s");
        assert_eq!(format_duration(3725.0), "1h 2m 5.0s");
    }

    #[test]
    fn test_archive_name_and_mtime() {
        assert_eq!(archive_name(Path::new("/data/a.txt")), "data/a.txt");
        let t = SystemTime::UNIX_EPOCH + Duration::new(10, 5);
        assert_eq!(system_time_ns(t), 10_000_000_005);
    }
}
