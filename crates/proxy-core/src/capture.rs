use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const TRUNCATED_MARKER: &str = "[[truncated]]";

/// Direction of a captured wire frame, used in the header line (spec.md §6
/// wire-capture file format).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureDirection {
    Outbound,
    Inbound,
}

impl CaptureDirection {
    fn as_str(self) -> &'static str {
        match self {
            CaptureDirection::Outbound => "OUTBOUND",
            CaptureDirection::Inbound => "INBOUND",
        }
    }
}

/// Configuration for wire capture. `file` is `None` when capture is
/// disabled or misconfigured, in which case every write is a no-op and
/// never raises (spec.md §5 "if the capture file is misconfigured, capture
/// becomes a no-op").
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub file: Option<PathBuf>,
    pub max_bytes: u64,
    pub max_files: u32,
    pub total_max_bytes: u64,
    pub truncate_bytes: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            file: None,
            max_bytes: 50 * 1024 * 1024,
            max_files: 5,
            total_max_bytes: 250 * 1024 * 1024,
            truncate_bytes: 64 * 1024,
        }
    }
}

struct WriterState {
    file: Option<File>,
    bytes_written: u64,
}

/// Append-only, size- and time-rotated audit log of every outbound/inbound
/// wire frame (spec.md §4.11 step 8, §6 file format). A single writer lock
/// serializes appends and rotations (spec.md §5 "Shared resources").
pub struct WireCapture {
    config: CaptureConfig,
    writer: Mutex<WriterState>,
}

impl WireCapture {
    pub async fn new(config: CaptureConfig) -> Self {
        let file = match &config.file {
            Some(path) => open_append(path).await,
            None => None,
        };
        let bytes_written = match &file {
            Some(_) => config
                .file
                .as_ref()
                .and_then(|p| std::fs::metadata(p).ok())
                .map(|m| m.len())
                .unwrap_or(0),
            None => 0,
        };
        Self {
            config,
            writer: Mutex::new(WriterState { file, bytes_written }),
        }
    }

    fn truncate(&self, body: &str) -> String {
        if body.len() <= self.config.truncate_bytes {
            return body.to_string();
        }
        let mut cut = self.config.truncate_bytes;
        while cut > 0 && !body.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}{}", &body[..cut], TRUNCATED_MARKER)
    }

    /// Appends one frame. Never returns an error to the caller; capture is
    /// best-effort and must never interrupt the request pipeline.
    pub async fn record(
        &self,
        direction: CaptureDirection,
        client: &str,
        agent: Option<&str>,
        session: &str,
        backend: &str,
        model: &str,
        key: Option<&str>,
        body: &str,
    ) {
        let Some(path) = self.config.file.clone() else {
            return;
        };

        let agent_part = agent.map(|a| format!(" agent={a}")).unwrap_or_default();
        let key_part = key.map(|k| format!(" key={k}")).unwrap_or_default();
        let header = format!(
            "----- {} {} -----\nclient={client}{agent_part} session={session} -> backend={backend} model={model}{key_part}\n",
            direction.as_str(),
            Utc::now().to_rfc3339(),
        );
        let body = self.truncate(body);
        let frame = format!("{header}{body}\n");

        let mut guard = self.writer.lock().await;
        if guard.file.is_none() {
            guard.file = open_append(&path).await;
        }
        let Some(file) = guard.file.as_mut() else {
            return;
        };
        if file.write_all(frame.as_bytes()).await.is_err() {
            guard.file = None;
            return;
        }
        guard.bytes_written += frame.len() as u64;

        if guard.bytes_written >= self.config.max_bytes {
            drop(guard.file.take());
            rotate(&path, self.config.max_files).await;
            guard.file = open_append(&path).await;
            guard.bytes_written = 0;
            enforce_total_cap(&path, self.config.max_files, self.config.total_max_bytes).await;
        }
    }
}

async fn open_append(path: &Path) -> Option<File> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent).await;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .ok()
}

/// Cascades `<file>` → `<file>.1` → ... → `<file>.N` (spec.md §6 rotation).
async fn rotate(path: &Path, max_files: u32) {
    for i in (1..max_files).rev() {
        let from = rotated_name(path, i);
        let to = rotated_name(path, i + 1);
        let _ = fs::rename(&from, &to).await;
    }
    let _ = fs::rename(path, rotated_name(path, 1)).await;
}

fn rotated_name(path: &Path, index: u32) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

async fn enforce_total_cap(path: &Path, max_files: u32, total_max_bytes: u64) {
    let mut total = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    for i in 1..=max_files {
        let rotated = rotated_name(path, i);
        let Ok(meta) = std::fs::metadata(&rotated) else {
            continue;
        };
        total += meta.len();
        if total > total_max_bytes {
            let _ = fs::remove_file(&rotated).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile_like::temp_dir;

    /// Minimal scratch-dir helper so this module doesn't need an extra
    /// `tempfile` dev-dependency just for a handful of capture tests.
    mod tempfile_like {
        use std::path::PathBuf;

        pub struct TempDir(pub PathBuf);
        impl Drop for TempDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
        pub fn temp_dir(tag: &str) -> TempDir {
            let mut path = std::env::temp_dir();
            path.push(format!("proxy-capture-test-{tag}-{}", std::process::id()));
            let _ = std::fs::create_dir_all(&path);
            TempDir(path)
        }
    }

    #[tokio::test]
    async fn disabled_capture_is_a_silent_no_op() {
        let capture = WireCapture::new(CaptureConfig::default()).await;
        capture
            .record(
                CaptureDirection::Outbound,
                "1.2.3.4",
                None,
                "s1",
                "openrouter",
                "m",
                None,
                "{}",
            )
            .await;
    }

    #[tokio::test]
    async fn enabled_capture_writes_header_and_body() {
        let dir = temp_dir("basic");
        let path = dir.0.join("wire.log");
        let capture = WireCapture::new(CaptureConfig {
            file: Some(path.clone()),
            ..CaptureConfig::default()
        })
        .await;
        capture
            .record(
                CaptureDirection::Outbound,
                "1.2.3.4",
                Some("cline"),
                "s1",
                "openrouter",
                "m",
                Some("K1"),
                "{\"hello\":true}",
            )
            .await;
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(contents.contains("OUTBOUND"));
        assert!(contents.contains("agent=cline"));
        assert!(contents.contains("session=s1"));
        assert!(contents.contains("key=K1"));
        assert!(contents.contains("{\"hello\":true}"));
    }

    #[tokio::test]
    async fn body_longer_than_threshold_is_truncated() {
        let dir = temp_dir("truncate");
        let path = dir.0.join("wire.log");
        let capture = WireCapture::new(CaptureConfig {
            file: Some(path.clone()),
            truncate_bytes: 4,
            ..CaptureConfig::default()
        })
        .await;
        capture
            .record(
                CaptureDirection::Inbound,
                "1.2.3.4",
                None,
                "s1",
                "openrouter",
                "m",
                None,
                "0123456789",
            )
            .await;
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(contents.contains("[[truncated]]"));
        assert!(!contents.contains("0123456789"));
    }
}
