use crate::shared::fs_atomic::atomic_write_file;
use std::fs;
use std::path::{Path, PathBuf};

pub const CLOSE_SENTINEL: &str = "_close";

#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("mailbox io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("mailbox payload encoding failed: {source}")]
    Encode {
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> MailboxError {
    MailboxError::Io {
        path: path.display().to_string(),
        source,
    }
}

pub fn input_dir(ipc_root: &Path, container_id: &str) -> PathBuf {
    ipc_root.join(container_id).join("input")
}

/// Atomically drop a follow-up message file into a running worker's inbox.
/// The write-then-rename keeps the child from ever observing a partial file.
pub fn send_follow_up(
    ipc_root: &Path,
    container_id: &str,
    text: &str,
) -> Result<PathBuf, MailboxError> {
    let dir = input_dir(ipc_root, container_id);
    fs::create_dir_all(&dir).map_err(|source| io_err(&dir, source))?;

    let payload = serde_json::json!({ "type": "message", "text": text });
    let body = serde_json::to_vec(&payload).map_err(|source| MailboxError::Encode { source })?;

    let name = format!(
        "msg-{}-{}.json",
        crate::shared::ids::now_millis(),
        crate::shared::ids::short_token(6)
    );
    let path = dir.join(name);
    atomic_write_file(&path, &body).map_err(|source| io_err(&path, source))?;
    Ok(path)
}

/// Zero-byte sentinel asking the child to shut down cleanly.
pub fn request_close(ipc_root: &Path, container_id: &str) -> Result<PathBuf, MailboxError> {
    let dir = input_dir(ipc_root, container_id);
    fs::create_dir_all(&dir).map_err(|source| io_err(&dir, source))?;
    let path = dir.join(CLOSE_SENTINEL);
    atomic_write_file(&path, b"").map_err(|source| io_err(&path, source))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn follow_up_lands_as_parseable_json_without_tmp_leftovers() {
        let tmp = tempdir().expect("tempdir");
        let path = send_follow_up(tmp.path(), "coreclaw-worker-abc", "status update please")
            .expect("send");

        let raw = fs::read_to_string(&path).expect("read");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value["type"], "message");
        assert_eq!(value["text"], "status update please");

        let dir = input_dir(tmp.path(), "coreclaw-worker-abc");
        let stray: Vec<_> = fs::read_dir(&dir)
            .expect("read dir")
            .flatten()
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".part"))
            .collect();
        assert!(stray.is_empty());
    }

    #[test]
    fn close_sentinel_is_a_zero_byte_file() {
        let tmp = tempdir().expect("tempdir");
        let path = request_close(tmp.path(), "coreclaw-worker-abc").expect("close");
        assert_eq!(path.file_name().and_then(|n| n.to_str()), Some("_close"));
        assert_eq!(fs::metadata(&path).expect("meta").len(), 0);
    }
}
