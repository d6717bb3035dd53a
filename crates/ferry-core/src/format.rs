//! Human-facing text: sizes, progress bars, captions and status listings.

use std::time::Duration;

use indicatif::HumanDuration;

use crate::model::{RequestStatus, TransferRequest};

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.2} {}", UNITS[unit])
    }
}

/// `[████░░░░] 50.0%`. With nothing to measure the bar is empty and unlabelled.
pub fn progress_bar(current: u64, total: u64, width: usize) -> String {
    if total == 0 {
        return "░".repeat(width);
    }
    let current = current.min(total);
    let filled = ((width as u128 * current as u128) / total as u128) as usize;
    let percent = current as f64 / total as f64 * 100.0;
    format!(
        "[{}{}] {percent:.1}%",
        "█".repeat(filled),
        "░".repeat(width - filled)
    )
}

pub fn status_icon(status: RequestStatus) -> &'static str {
    match status {
        RequestStatus::Pending | RequestStatus::Analyzing => "⏳",
        RequestStatus::Downloading => "📥",
        RequestStatus::Uploading => "📤",
        RequestStatus::Completed => "✅",
        RequestStatus::Failed => "❌",
        RequestStatus::Paused => "⏸️",
    }
}

/// Estimated time to move `remaining` bytes at `speed` bytes per second.
pub fn eta(remaining: u64, speed: f64) -> Option<Duration> {
    if speed <= 0.0 || !speed.is_finite() {
        return None;
    }
    Some(Duration::from_secs_f64(remaining as f64 / speed))
}

fn shorten(name: &str, max: usize) -> String {
    if name.chars().count() <= max {
        return name.to_string();
    }
    let head: String = name.chars().take(max).collect();
    format!("{head}...")
}

/// Snapshot of a running download, rendered by [`progress_message`].
#[derive(Clone, Debug, Default)]
pub struct ProgressView<'a> {
    pub name: &'a str,
    pub current_file: &'a str,
    pub file_bytes: u64,
    pub file_total: u64,
    pub chunk: u32,
    pub total_chunks: u32,
    pub overall_bytes: u64,
    pub overall_total: u64,
    pub speed: f64,
}

pub fn progress_message(view: &ProgressView<'_>) -> String {
    let mut lines = vec![
        format!("📥 Downloading: {}", view.name),
        String::new(),
        format!("📄 Current: {}", shorten(view.current_file, 30)),
        progress_bar(view.file_bytes, view.file_total, 15),
        format!(
            "{} / {}",
            format_bytes(view.file_bytes),
            format_bytes(view.file_total)
        ),
        String::new(),
        format!("📦 Chunk: {}/{}", view.chunk + 1, view.total_chunks),
        String::new(),
        "📊 Overall Progress:".to_string(),
        progress_bar(view.overall_bytes, view.overall_total, 15),
        format!(
            "{} / {}",
            format_bytes(view.overall_bytes),
            format_bytes(view.overall_total)
        ),
        String::new(),
        format!("⚡ Speed: {}/s", format_bytes(view.speed.max(0.0) as u64)),
    ];
    if let Some(left) = eta(
        view.overall_total.saturating_sub(view.overall_bytes),
        view.speed,
    ) {
        lines.push(format!("ETA: {}", HumanDuration(left)));
    }
    lines.join("\n")
}

/// Caption attached to a delivered chunk archive.
pub fn chunk_caption(name: &str, chunk: u32, total_chunks: u32, size: u64) -> String {
    format!(
        "📦 {name}\nChunk {}/{total_chunks}\nSize: {}",
        chunk + 1,
        format_bytes(size)
    )
}

/// Caption for part `index` (0-based) of `count`; the first part keeps the original caption.
pub fn part_caption(artifact_name: &str, caption: &str, index: usize, count: usize) -> String {
    let label = format!("📁 {artifact_name} (Part {}/{count})", index + 1);
    if index == 0 && !caption.is_empty() {
        format!("{caption}\n\n{label}")
    } else {
        label
    }
}

pub fn status_message(requests: &[TransferRequest]) -> String {
    if requests.is_empty() {
        return "📭 No active downloads.".to_string();
    }
    let mut lines = vec!["📋 Your Active Downloads:".to_string(), String::new()];
    for req in requests {
        let percent = if req.total_size > 0 {
            req.downloaded_bytes as f64 / req.total_size as f64 * 100.0
        } else {
            0.0
        };
        lines.push(format!("{} #{} {}", status_icon(req.status), req.id, req.name));
        lines.push(format!("   Status: {}", req.status));
        lines.push(format!("   Progress: {percent:.1}%"));
        lines.push(format!(
            "   Chunk: {}/{}",
            (req.current_chunk + 1).min(req.total_chunks.max(1)),
            req.total_chunks
        ));
        if let Some(error) = &req.error {
            lines.push(format!("   Note: {error}"));
        }
        lines.push(String::new());
    }
    lines.join("\n").trim_end().to_string()
}
