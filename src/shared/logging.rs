use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn core_log_path(state_root: &Path) -> PathBuf {
    state_root.join("logs/core.log")
}

/// One JSON object per line. Level and event are internal constants and go
/// in verbatim; the message is caller-supplied and gets JSON-escaped. A
/// failure at any step drops the line silently, logging must never feed an
/// error back into the caller's control flow.
pub fn append_core_log(state_root: &Path, level: &str, event: &str, message: &str) {
    let path = core_log_path(state_root);
    match path.parent() {
        Some(parent) if fs::create_dir_all(parent).is_ok() => {}
        _ => return,
    }

    let line = render_line(level, event, message);
    if let Ok(mut file) = fs::OpenOptions::new().append(true).create(true).open(&path) {
        let _ = writeln!(file, "{line}");
    }
}

fn render_line(level: &str, event: &str, message: &str) -> String {
    format!(
        "{{\"ts\":\"{}\",\"level\":\"{level}\",\"event\":\"{event}\",\"message\":{}}}",
        crate::shared::ids::now_iso(),
        serde_json::Value::from(message),
    )
}
