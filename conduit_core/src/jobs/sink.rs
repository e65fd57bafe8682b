use crate::jobs::models::stream_label;
use crate::jobs::traits::RecordSink;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

/// Appends records as JSON lines to `<dir>/<namespace.stream>.jsonl`.
///
/// Stands in for a landing-zone writer in the `conduit` binary.
pub struct JsonLinesSink {
    dir: PathBuf,
    files: Mutex<HashMap<String, BufWriter<File>>>,
}

impl JsonLinesSink {
    #[tracing::instrument(level = "debug")]
    pub async fn new(dir: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::backend(format!("create sink dir {}", dir.display()), e))?;
        Ok(Self {
            dir,
            files: Mutex::new(HashMap::new()),
        })
    }
}

fn file_name(label: &str) -> String {
    let safe: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{safe}.jsonl")
}

#[async_trait]
impl RecordSink for JsonLinesSink {
    async fn accept(
        &self,
        stream: &str,
        namespace: Option<&str>,
        record: &serde_json::Value,
        emitted_at: DateTime<Utc>,
    ) -> Result<()> {
        let label = stream_label(stream, namespace);
        let line = serde_json::to_string(&serde_json::json!({
            "emitted_at": emitted_at,
            "data": record,
        }))
        .map_err(|e| Error::backend("encode sink record", e))?;

        let mut files = self.files.lock().await;
        if !files.contains_key(&label) {
            let path = self.dir.join(file_name(&label));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(|e| Error::backend(format!("open {}", path.display()), e))?;
            files.insert(label.clone(), BufWriter::new(file));
        }
        let writer = files
            .get_mut(&label)
            .ok_or_else(|| Error::BackendMessage("sink writer vanished".to_string()))?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::backend("write sink record", e))?;
        writer
            .write_all(b"\n")
            .await
            .map_err(|e| Error::backend("write sink record", e))?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let mut files = self.files.lock().await;
        for writer in files.values_mut() {
            writer
                .flush()
                .await
                .map_err(|e| Error::backend("flush sink", e))?;
        }
        Ok(())
    }
}
