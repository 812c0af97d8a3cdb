//! Durable writes
//!
//! Artifacts are written to a hidden temporary sibling, fsynced, and renamed
//! into place, so a reader never sees a half-written file under its final
//! name. The parent directory is fsynced after the rename.

use std::path::Path;

use keel_core::StorageError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Atomically replace `path` with `bytes`
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let parent = parent_of(path)?;
    fs::create_dir_all(parent).await?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));

    let result = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }

    sync_dir(parent).await;
    Ok(())
}

/// Pretty-printed JSON, atomically
pub async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StorageError> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    write_atomic(path, &bytes).await
}

/// Read JSON if the file exists
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Corrupt {
                path: path.display().to_string(),
                detail: e.to_string(),
            }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Append one JSON line and fsync before returning
pub async fn append_line<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StorageError> {
    fs::create_dir_all(parent_of(path)?).await?;
    repair_tail(path).await?;

    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&line).await?;
    file.sync_data().await?;
    Ok(())
}

/// Parse a JSON Lines file. A torn final line (crash mid-append) is skipped;
/// a bad line anywhere else means the log is corrupt.
pub async fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StorageError> {
    let content = match fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    let mut out = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        match serde_json::from_str(line) {
            Ok(v) => out.push(v),
            Err(_) if i + 1 == lines.len() && !content.ends_with('\n') => {
                tracing::warn!(path = %path.display(), "Skipping torn trailing line");
            }
            Err(e) => {
                return Err(StorageError::Corrupt {
                    path: path.display().to_string(),
                    detail: format!("line {}: {}", i + 1, e),
                })
            }
        }
    }
    Ok(out)
}

/// Make sure the log ends on a line boundary before appending.
///
/// A record that was written whole but lost its newline is terminated; a torn
/// fragment is cut off. Either way the next line starts fresh and never
/// glues onto a broken one.
async fn repair_tail(path: &Path) -> Result<(), StorageError> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(());
    }
    file.seek(std::io::SeekFrom::Start(len - 1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    if last[0] == b'\n' {
        return Ok(());
    }

    let mut content = Vec::with_capacity(len as usize);
    file.seek(std::io::SeekFrom::Start(0)).await?;
    file.read_to_end(&mut content).await?;
    let keep = content.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);

    if serde_json::from_slice::<serde_json::Value>(&content[keep..]).is_ok() {
        file.seek(std::io::SeekFrom::End(0)).await?;
        file.write_all(b"\n").await?;
    } else {
        tracing::warn!(
            path = %path.display(),
            dropped = content.len() - keep,
            "Truncating torn trailing line"
        );
        file.set_len(keep as u64).await?;
    }
    file.sync_data().await?;
    Ok(())
}

fn parent_of(path: &Path) -> Result<&Path, StorageError> {
    path.parent().ok_or_else(|| {
        StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} has no parent directory", path.display()),
        ))
    })
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) {
    if let Ok(d) = fs::File::open(dir).await {
        let _ = d.sync_all().await;
    }
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_write_atomic_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("a.json");
        write_json(&path, &json!({"x": 1})).await.unwrap();
        write_json(&path, &json!({"x": 2})).await.unwrap();

        let v: serde_json::Value = read_json(&path).await.unwrap().unwrap();
        assert_eq!(v["x"], 2);

        let names: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.json".to_string()]);
    }

    #[tokio::test]
    async fn test_read_missing_is_none() {
        let dir = tempdir().unwrap();
        let v: Option<serde_json::Value> = read_json(&dir.path().join("nope.json")).await.unwrap();
        assert!(v.is_none());
    }

    #[tokio::test]
    async fn test_torn_trailing_line_is_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        append_line(&path, &json!({"n": 1})).await.unwrap();
        append_line(&path, &json!({"n": 2})).await.unwrap();
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{\"n\":");
        std::fs::write(&path, raw).unwrap();

        let lines: Vec<serde_json::Value> = read_lines(&path).await.unwrap();
        assert_eq!(lines.len(), 2);
    }

    #[tokio::test]
    async fn test_append_after_torn_line_keeps_log_readable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        std::fs::write(&path, "{\"n\":1}\n{\"n\":").unwrap();

        append_line(&path, &json!({"n": 2})).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"n\":1}\n{\"n\":2}\n");
        let lines: Vec<serde_json::Value> = read_lines(&path).await.unwrap();
        assert_eq!(lines, vec![json!({"n": 1}), json!({"n": 2})]);
    }

    #[tokio::test]
    async fn test_append_terminates_whole_unterminated_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        std::fs::write(&path, "{\"n\":1}").unwrap();

        append_line(&path, &json!({"n": 2})).await.unwrap();
        let lines: Vec<serde_json::Value> = read_lines(&path).await.unwrap();
        assert_eq!(lines, vec![json!({"n": 1}), json!({"n": 2})]);
    }

    #[tokio::test]
    async fn test_corrupt_middle_line_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        std::fs::write(&path, "{\"n\":1}\ngarbage\n{\"n\":3}\n").unwrap();
        let res: Result<Vec<serde_json::Value>, _> = read_lines(&path).await;
        assert!(matches!(res, Err(StorageError::Corrupt { .. })));
    }
}
