//! Telemetry persistence collaborators.
//!
//! The router persists sensor readings and raw NMEA sentences
//! fire-and-forget: a store failure is logged and never blocks or fails
//! message forwarding. The file store appends JSON lines to a daily file;
//! the no-op store is wired in when persistence is disabled.

use crate::protocol::Measurements;
use async_trait::async_trait;
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[async_trait]
pub trait TelemetryStore: Send + Sync {
    async fn persist_sensor_reading(
        &self,
        time: i64,
        sensor: &str,
        measurements: &Measurements,
    ) -> io::Result<()>;

    async fn persist_nmea(&self, time: i64, sentence: &str) -> io::Result<()>;
}

/// Store used when persistence is disabled.
pub struct NoopTelemetryStore;

#[async_trait]
impl TelemetryStore for NoopTelemetryStore {
    async fn persist_sensor_reading(
        &self,
        _time: i64,
        _sensor: &str,
        _measurements: &Measurements,
    ) -> io::Result<()> {
        Ok(())
    }

    async fn persist_nmea(&self, _time: i64, _sentence: &str) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Record<'a> {
    Sensor {
        time: i64,
        sensor: &'a str,
        measurements: &'a Measurements,
    },
    Nmea {
        time: i64,
        sentence: &'a str,
    },
}

/// Appends one JSON object per record to `<dir>/<YYYY-MM-DD>.jsonl`,
/// rolling to a new file when the date changes.
pub struct FileTelemetryStore {
    dir: PathBuf,
    open: Mutex<Option<(String, File)>>,
}

impl FileTelemetryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileTelemetryStore {
            dir: dir.into(),
            open: Mutex::new(None),
        }
    }

    async fn append(&self, record: &Record<'_>) -> io::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let mut open = self.open.lock().await;
        let stale = !matches!(&*open, Some((date, _)) if *date == today);
        if stale {
            tokio::fs::create_dir_all(&self.dir).await?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.dir.join(format!("{today}.jsonl")))
                .await?;
            *open = Some((today, file));
        }
        if let Some((_, file)) = open.as_mut() {
            file.write_all(&line).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TelemetryStore for FileTelemetryStore {
    async fn persist_sensor_reading(
        &self,
        time: i64,
        sensor: &str,
        measurements: &Measurements,
    ) -> io::Result<()> {
        self.append(&Record::Sensor {
            time,
            sensor,
            measurements,
        })
        .await
    }

    async fn persist_nmea(&self, time: i64, sentence: &str) -> io::Result<()> {
        self.append(&Record::Nmea { time, sentence }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_store_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTelemetryStore::new(dir.path());

        let mut measurements = Measurements::new();
        measurements.insert("temp".into(), Some(21.5));
        measurements.insert("humidity".into(), None);
        store
            .persist_sensor_reading(1_000, "internal_bme", &measurements)
            .await
            .unwrap();
        store.persist_nmea(2_000, "$GPGGA,...*47").await.unwrap();

        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let contents =
            std::fs::read_to_string(dir.path().join(format!("{today}.jsonl"))).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["kind"], "sensor");
        assert_eq!(first["sensor"], "internal_bme");
        assert_eq!(first["measurements"]["temp"], 21.5);
        assert!(first["measurements"]["humidity"].is_null());

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["kind"], "nmea");
        assert_eq!(second["sentence"], "$GPGGA,...*47");
    }
}
