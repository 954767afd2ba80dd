use crate::AppEvent;
use crate::error::ProtocolViolation;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

/// Longest file name accepted from a peer, in bytes
pub const MAX_FILENAME_LENGTH: usize = 255;

const FALLBACK_NAME: &str = "unnamed_file";

const RESERVED_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Check a peer's declared file against the receiver limits
pub fn validate_transfer_info(
    file_name: &str,
    file_size: u64,
    max_file_size: u64,
) -> Result<(), ProtocolViolation> {
    if file_size > max_file_size {
        return Err(ProtocolViolation::FileRejected(format!(
            "{} declares {} bytes, limit is {}",
            file_name, file_size, max_file_size
        )));
    }
    if file_name.len() > MAX_FILENAME_LENGTH * 4 {
        return Err(ProtocolViolation::FileRejected(format!(
            "name is {} bytes long",
            file_name.len()
        )));
    }
    Ok(())
}

/// Reduce a peer-supplied name to a single safe path component
pub fn sanitize_file_name(file_name: &str) -> String {
    let last = file_name.rsplit(['/', '\\']).next().unwrap_or_default();
    let mut name: String = last.chars().filter(|c| !c.is_control()).collect();
    let trimmed = name.trim().trim_end_matches('.').to_string();

    if trimmed.is_empty() || trimmed == ".." {
        return FALLBACK_NAME.to_string();
    }
    let stem = trimmed.split('.').next().unwrap_or_default();
    if RESERVED_NAMES.iter().any(|r| stem.eq_ignore_ascii_case(r)) {
        return format!("_{}", trimmed);
    }
    name = trimmed;

    if name.len() > MAX_FILENAME_LENGTH {
        name = truncate_keeping_extension(&name, MAX_FILENAME_LENGTH);
    }
    name
}

fn truncate_keeping_extension(name: &str, limit: usize) -> String {
    let (base, ext) = match name.rfind('.') {
        Some(idx) if idx > 0 && name.len() - idx < 20 => name.split_at(idx),
        _ => (name, ""),
    };
    let mut cutoff = limit - ext.len();
    while !base.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    format!("{}{}", &base[..cutoff], ext)
}

/// Candidate name for the n-th collision: `report.bin` -> `report (n).bin`
fn numbered_name(name: &str, n: u32) -> String {
    match name.rfind('.') {
        Some(idx) if idx > 0 => format!("{} ({}){}", &name[..idx], n, &name[idx..]),
        _ => format!("{} ({})", name, n),
    }
}

/// Write a received artifact into `dir` without replacing existing files.
/// Files are created owner-only (0o600) on Unix.
pub async fn save_artifact(dir: &Path, file_name: &str, data: &[u8]) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let name = sanitize_file_name(file_name);

    let mut attempt = 0u32;
    loop {
        let candidate = if attempt == 0 {
            dir.join(&name)
        } else {
            dir.join(numbered_name(&name, attempt))
        };

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        match options.open(&candidate).await {
            Ok(mut file) => {
                file.write_all(data).await?;
                file.flush().await?;
                return Ok(candidate);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && attempt < 10_000 => {
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Format transfer speed from bytes and elapsed time
pub fn format_transfer_speed(bytes_transferred: u64, elapsed_secs: f64) -> String {
    if elapsed_secs <= 0.0 {
        return "Starting...".to_string();
    }

    format_speed(bytes_transferred as f64 / elapsed_secs)
}

/// Human-readable rate for a bytes-per-second figure
pub fn format_speed(speed_bps: f64) -> String {
    if speed_bps > 1_000_000.0 {
        format!("{:.2} MB/s", speed_bps / 1_000_000.0)
    } else if speed_bps > 1_000.0 {
        format!("{:.1} KB/s", speed_bps / 1_000.0)
    } else {
        format!("{:.0} B/s", speed_bps)
    }
}

/// Percentage of `total` covered by `done`, clamped to 100. An empty file is
/// complete as soon as it starts.
pub fn progress_percent(done: u64, total: u64) -> f32 {
    if total == 0 {
        return 100.0;
    }
    ((done as f64 / total as f64) * 100.0).min(100.0) as f32
}

/// Running-average throughput since `start_time`
pub fn average_speed(bytes_done: u64, start_time: Instant) -> f64 {
    let elapsed = start_time.elapsed().as_secs_f64();
    if elapsed > 0.0 {
        bytes_done as f64 / elapsed
    } else {
        0.0
    }
}

/// Report transfer progress to the event channel
pub async fn report_progress(
    event_tx: &mpsc::Sender<AppEvent>,
    file_name: &str,
    bytes_done: u64,
    total_bytes: u64,
    start_time: Instant,
    is_sending: bool,
) {
    let elapsed = start_time.elapsed().as_secs_f64();
    let _ = event_tx
        .send(AppEvent::TransferProgress {
            file_name: file_name.to_string(),
            progress: progress_percent(bytes_done, total_bytes),
            speed: format_transfer_speed(bytes_done, elapsed),
            speed_bps: average_speed(bytes_done, start_time),
            is_sending,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_transfer_info() {
        assert!(validate_transfer_info("ok.txt", 1024, 2048).is_ok());
        assert!(matches!(
            validate_transfer_info("huge.iso", 4096, 2048),
            Err(ProtocolViolation::FileRejected(_))
        ));
        let long_name = "a".repeat(MAX_FILENAME_LENGTH * 4 + 1);
        assert!(validate_transfer_info(&long_name, 1, 2048).is_err());
    }

    #[test]
    fn test_sanitize_strips_directories() {
        assert_eq!(sanitize_file_name("report.bin"), "report.bin");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\me\\notes.txt"), "notes.txt");
        assert_eq!(sanitize_file_name("dir/..\\a.txt"), "a.txt");
    }

    #[test]
    fn test_sanitize_degenerate_names() {
        assert_eq!(sanitize_file_name(""), FALLBACK_NAME);
        assert_eq!(sanitize_file_name(".."), FALLBACK_NAME);
        assert_eq!(sanitize_file_name("."), FALLBACK_NAME);
        assert_eq!(sanitize_file_name("dir/"), FALLBACK_NAME);
        assert_eq!(sanitize_file_name("a\u{0}b\nc.txt"), "abc.txt");
    }

    #[test]
    fn test_sanitize_reserved_names() {
        assert_eq!(sanitize_file_name("con"), "_con");
        assert_eq!(sanitize_file_name("LPT1.txt"), "_LPT1.txt");
        assert_eq!(sanitize_file_name("console.log"), "console.log");
    }

    #[test]
    fn test_sanitize_truncates_on_char_boundary() {
        let long = "🦀".repeat(100) + ".txt";
        let clean = sanitize_file_name(&long);
        assert!(clean.len() <= MAX_FILENAME_LENGTH);
        assert!(clean.ends_with("🦀.txt"));

        let plain = "b".repeat(400);
        assert_eq!(sanitize_file_name(&plain).len(), MAX_FILENAME_LENGTH);
    }

    #[test]
    fn test_progress_percent_clamps() {
        assert_eq!(progress_percent(0, 0), 100.0);
        assert_eq!(progress_percent(512, 1024), 50.0);
        assert_eq!(progress_percent(2048, 1024), 100.0);
    }

    #[test]
    fn test_format_transfer_speed() {
        assert_eq!(format_transfer_speed(10, 0.0), "Starting...");
        assert_eq!(format_transfer_speed(500, 1.0), "500 B/s");
        assert_eq!(format_transfer_speed(2_500, 1.0), "2.5 KB/s");
        assert_eq!(format_transfer_speed(3_000_000, 1.0), "3.00 MB/s");
    }

    #[test]
    fn test_numbered_name() {
        assert_eq!(numbered_name("report.bin", 1), "report (1).bin");
        assert_eq!(numbered_name("README", 2), "README (2)");
        assert_eq!(numbered_name(".env", 1), ".env (1)");
    }
}
