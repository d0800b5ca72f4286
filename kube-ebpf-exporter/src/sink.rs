use std::fs::{DirBuilder, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;

use crate::config::{NodeIdentity, SinkConfig};

/// Event name written to the event log each time a new spool file starts.
pub const ROTATION_EVENT_NAME: &str = "kube-ebpf-exporter.sink.rotated";

/// Shared telemetry spool: readable and writable by every local consumer.
const SPOOL_MODE: u32 = 0o777;

/// Appends sink records to hourly gzip files under a per-node root.
pub struct SinkExporter {
    root: PathBuf,
    event_log: PathBuf,
    node: NodeIdentity,
    current: Mutex<Option<PathBuf>>,
}

impl SinkExporter {
    pub fn new(config: &SinkConfig, node: NodeIdentity) -> Self {
        let root = node.sink_root(&config.root);
        if let Err(e) = DirBuilder::new()
            .recursive(true)
            .mode(SPOOL_MODE)
            .create(&root)
        {
            log::warn!("creating sink root {}: {e}", root.display());
        }
        Self {
            root,
            event_log: config.event_log.clone(),
            node,
            current: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dump(&self, records: &[String]) {
        self.dump_at(records, Local::now());
    }

    /// Append `records` to the file for `now`'s local hour. Failures are
    /// logged and swallowed.
    pub fn dump_at(&self, records: &[String], now: DateTime<Local>) {
        if records.is_empty() {
            return;
        }
        let path = self.file_for(now);

        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_deref() != Some(path.as_path()) {
            if let Err(e) = self.append_event(&path, now) {
                log::warn!("writing rotation event to {}: {e:#}", self.event_log.display());
            }
            *current = Some(path.clone());
        }

        if let Err(e) = write_records(&path, records) {
            log::warn!("writing sink records to {}: {e:#}", path.display());
        }
    }

    fn file_for(&self, now: DateTime<Local>) -> PathBuf {
        self.root.join(format!("{}.gz", now.format("%Y%m%d%H")))
    }

    fn append_event(&self, path: &Path, now: DateTime<Local>) -> Result<()> {
        let event = json!({
            "event_node": self.node.node,
            "event_cluster": self.node.cluster,
            "event_zone": self.node.zone,
            "event_region": self.node.region,
            "event_provider": self.node.provider,
            "event_time": now.timestamp_nanos_opt().unwrap_or_default(),
            "event_name": ROTATION_EVENT_NAME,
            "event_value": path.display().to_string(),
        });
        let mut file = open_append(&self.event_log)?;
        writeln!(file, "{event}").context("appending event")?;
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(SPOOL_MODE)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))
}

/// One gzip member per call, finished before returning.
fn write_records(path: &Path, records: &[String]) -> Result<()> {
    let mut encoder = GzEncoder::new(open_append(path)?, Compression::default());
    for record in records {
        encoder.write_all(record.as_bytes())?;
        encoder.write_all(b"\n")?;
    }
    encoder.finish().context("finishing gzip stream")?;
    Ok(())
}
