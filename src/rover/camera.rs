//! Camera streamer management.
//!
//! The video pipeline is an external streamer process; this module owns
//! its lifecycle and the `camera.*` options that configure it. Setting
//! any option to a new value restarts the streamer with the new
//! parameters; setting `camera.source` to null stops it.

use super::Upstream;
use crate::protocol::LogLevel;
use serde_json::{json, Map, Value};
use tokio::process::{Child, Command as ProcessCommand};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraSource {
    Pretticam,
    Navicam,
}

impl CameraSource {
    fn device(self) -> &'static str {
        match self {
            CameraSource::Pretticam => "/dev/video0",
            CameraSource::Navicam => "/dev/video1",
        }
    }

    /// Accepts the operator-facing aliases, case-insensitively.
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "p" | "pretticam" | "prettycam" => Some(CameraSource::Pretticam),
            "n" | "navicam" | "navcam" => Some(CameraSource::Navicam),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
struct CameraOptions {
    source: Option<CameraSource>,
    resolution: (u32, u32),
    framerate: u32,
}

impl Default for CameraOptions {
    fn default() -> Self {
        CameraOptions {
            source: None,
            resolution: (256, 144),
            framerate: 10,
        }
    }
}

impl CameraOptions {
    fn value_of(&self, key: &str) -> Value {
        match key {
            "camera.source" => match self.source {
                Some(source) => json!(source.device()),
                None => Value::Null,
            },
            "camera.resolution" => json!([self.resolution.0, self.resolution.1]),
            "camera.framerate" => json!(self.framerate),
            _ => Value::Null,
        }
    }
}

pub struct CameraController {
    streamer_path: String,
    options: CameraOptions,
    child: Option<Child>,
}

impl CameraController {
    pub fn new(streamer_path: impl Into<String>) -> Self {
        CameraController {
            streamer_path: streamer_path.into(),
            options: CameraOptions::default(),
            child: None,
        }
    }

    /// Applies an `option` message: validates and stores the `set` keys,
    /// restarts the streamer if anything changed, and returns the values
    /// of every key that was set or asked for.
    pub async fn apply(
        &mut self,
        get: &[String],
        set: &Map<String, Value>,
        upstream: &Upstream,
    ) -> Map<String, Value> {
        let old = self.options.clone();

        if let Some(raw) = set.get("camera.source") {
            match raw {
                Value::Null => self.options.source = None,
                Value::String(s) => match CameraSource::parse(s) {
                    Some(source) => self.options.source = Some(source),
                    None => upstream.log(
                        LogLevel::Error,
                        format!("Unknown camera.source: {s}"),
                    ),
                },
                _ => upstream.log(
                    LogLevel::Error,
                    "Option camera.source must be a string or null",
                ),
            }
        }

        if let Some(raw) = set.get("camera.resolution") {
            match parse_resolution(raw) {
                Some(resolution) => self.options.resolution = resolution,
                None => upstream.log(
                    LogLevel::Error,
                    "Option camera.resolution must be an array of two integers",
                ),
            }
        }

        if let Some(raw) = set.get("camera.framerate") {
            match raw.as_u64().and_then(|v| u32::try_from(v).ok()) {
                Some(framerate) => self.options.framerate = framerate,
                None => upstream.log(
                    LogLevel::Error,
                    "Option camera.framerate must be an int",
                ),
            }
        }

        if self.options != old {
            self.restart_streamer(upstream).await;
        }

        let mut values = Map::new();
        for key in set.keys().map(String::as_str).chain(get.iter().map(String::as_str)) {
            values.insert(key.to_string(), self.options.value_of(key));
        }
        values
    }

    async fn restart_streamer(&mut self, upstream: &Upstream) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "Failed to stop camera streamer");
            }
        }
        let Some(source) = self.options.source else {
            return;
        };

        let (width, height) = self.options.resolution;
        let spawned = ProcessCommand::new(&self.streamer_path)
            .arg(source.device())
            .arg("--resolution")
            .arg(width.to_string())
            .arg(height.to_string())
            .arg("--framerate")
            .arg(self.options.framerate.to_string())
            .kill_on_drop(true)
            .spawn();
        match spawned {
            Ok(child) => {
                tracing::info!(device = source.device(), width, height, "Started camera streamer");
                self.child = Some(child);
            }
            Err(e) => upstream.log(
                LogLevel::Error,
                format!("Failed to start camera streamer: {e}"),
            ),
        }
    }
}

fn parse_resolution(raw: &Value) -> Option<(u32, u32)> {
    let array = raw.as_array()?;
    if array.len() != 2 {
        return None;
    }
    let width = array[0].as_u64().and_then(|v| u32::try_from(v).ok())?;
    let height = array[1].as_u64().and_then(|v| u32::try_from(v).ok())?;
    Some((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;

    // Setting the source would spawn the streamer, so tests stick to the
    // options that leave it stopped.

    #[tokio::test]
    async fn get_returns_defaults() {
        let (upstream, _rx) = Upstream::channel();
        let mut camera = CameraController::new("/bin/true");

        let get = vec![
            "camera.source".to_string(),
            "camera.resolution".to_string(),
            "camera.framerate".to_string(),
        ];
        let values = camera.apply(&get, &Map::new(), &upstream).await;

        assert_eq!(values["camera.source"], Value::Null);
        assert_eq!(values["camera.resolution"], json!([256, 144]));
        assert_eq!(values["camera.framerate"], json!(10));
    }

    #[tokio::test]
    async fn set_keys_are_echoed_back() {
        let (upstream, _rx) = Upstream::channel();
        let mut camera = CameraController::new("/bin/true");

        let mut set = Map::new();
        set.insert("camera.resolution".to_string(), json!([640, 480]));
        set.insert("camera.framerate".to_string(), json!(30));
        let values = camera.apply(&[], &set, &upstream).await;

        assert_eq!(values["camera.resolution"], json!([640, 480]));
        assert_eq!(values["camera.framerate"], json!(30));
        assert_eq!(camera.options.resolution, (640, 480));
    }

    #[tokio::test]
    async fn invalid_values_are_rejected_and_reported() {
        let (upstream, mut rx) = Upstream::channel();
        let mut camera = CameraController::new("/bin/true");

        let mut set = Map::new();
        set.insert("camera.resolution".to_string(), json!([640]));
        set.insert("camera.framerate".to_string(), json!("fast"));
        set.insert("camera.source".to_string(), json!("telescope"));
        let values = camera.apply(&[], &set, &upstream).await;

        // Options keep their previous values.
        assert_eq!(values["camera.resolution"], json!([256, 144]));
        assert_eq!(values["camera.framerate"], json!(10));
        assert_eq!(values["camera.source"], Value::Null);

        let mut errors = 0;
        while let Ok(msg) = rx.try_recv() {
            if let Message::Log { level, .. } = msg {
                assert_eq!(level, LogLevel::Error);
                errors += 1;
            }
        }
        assert_eq!(errors, 3);
    }

    #[test]
    fn source_aliases_parse() {
        assert_eq!(CameraSource::parse("P"), Some(CameraSource::Pretticam));
        assert_eq!(CameraSource::parse("prettycam"), Some(CameraSource::Pretticam));
        assert_eq!(CameraSource::parse("navcam"), Some(CameraSource::Navicam));
        assert_eq!(CameraSource::parse("telescope"), None);
    }
}
