use std::time::Duration;
use crate::core::Progress;

/// Human readable byte count, binary units
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const UNIT_SIZE: f64 = 1024.0;

    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= UNIT_SIZE && unit_index < UNITS.len() - 1 {
        size /= UNIT_SIZE;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

pub fn format_speed(bytes_per_second: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_second.max(0.0) as u64))
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// One-line summary used by log output, e.g. `3.00 MB / 10.00 MB (30.0%) 1.00 MB/s, 7s left`
pub fn format_progress(progress: &Progress) -> String {
    let eta = progress
        .eta
        .map(|eta| format!(", {} left", format_duration(eta)))
        .unwrap_or_default();

    format!(
        "{} / {} ({:.1}%) {}{}",
        format_bytes(progress.loaded),
        format_bytes(progress.total),
        progress.percentage,
        format_speed(progress.speed),
        eta
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_utils() {
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");

        assert_eq!(format_speed(1048576.0), "1.00 MB/s");
        assert_eq!(format_speed(-3.0), "0.00 B/s");

        assert_eq!(format_duration(Duration::from_secs(59)), "59s");
        assert_eq!(format_duration(Duration::from_secs(120)), "2m 0s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 1m 1s");
    }

    #[test]
    fn test_format_progress() {
        let progress = Progress {
            loaded: 3 * 1024 * 1024,
            total: 10 * 1024 * 1024,
            percentage: 30.0,
            speed: 1024.0 * 1024.0,
            eta: Some(Duration::from_secs(7)),
        };

        assert_eq!(format_progress(&progress), "3.00 MB / 10.00 MB (30.0%) 1.00 MB/s, 7s left");
    }
}
