use crate::shared::ids::short_token;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Write-then-rename so readers never observe a partial file. The scratch
/// file lives next to the target under a random `.part` name and is removed
/// again if any step before the rename fails.
pub fn atomic_write_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let scratch = scratch_path(&dir, path);

    if let Err(err) = write_scratch(&scratch, content).and_then(|_| fs::rename(&scratch, path)) {
        let _ = fs::remove_file(&scratch);
        return Err(err);
    }
    flush_dir(&dir)
}

fn scratch_path(dir: &Path, target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("file");
    dir.join(format!("{name}.{}.part", short_token(8)))
}

fn write_scratch(scratch: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(scratch)?;
    file.write_all(content)?;
    file.sync_all()
}

/// Copy preserving the relative directory shape under `dest_root`.
pub fn copy_into_tree(source: &Path, dest_root: &Path, rel: &Path) -> std::io::Result<()> {
    let dest = dest_root.join(rel);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, &dest)?;
    Ok(())
}

// The rename is only durable once the directory entry itself is flushed.
#[cfg(unix)]
fn flush_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn flush_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
