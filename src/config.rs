//! YAML configuration.
//!
//! Raw `*File` structs mirror the file with every field optional; the
//! resolved settings structs apply defaults and validation. Detector
//! `params` stay an opaque mapping here and are interpreted by the
//! detector factories (unrecognised keys are ignored there).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::Deserialize;

use crate::detect::DetectorParams;
use crate::frame_source::HlsSourceConfig;
use crate::geometry::Polygon;
use crate::publish::{DdbConfig, KdsConfig, S3Config};

const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_BATCH_SIZE: usize = 500;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BASE_BACKOFF_MS: u64 = 100;
const DEFAULT_EVENT_ID_BUCKET_MS: i64 = 1000;
const DEFAULT_S3_PREFIX: &str = "snapshots";
const DEFAULT_JPEG_QUALITY: u8 = 90;
const DEFAULT_SESSION_SECONDS: u64 = 300;
const DEFAULT_REFRESH_MARGIN: u64 = 30;
const DEFAULT_RECONNECT_DELAY_SEC: f64 = 1.0;
const DEFAULT_MAX_RECONNECT_DELAY_SEC: f64 = 30.0;
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 10;

const CAMERA_ID_PATTERN: &str = "^[A-Za-z0-9_-]+$";

// -------------------- raw file model --------------------

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    publishers: Option<PublishersFile>,
    cameras: Option<BTreeMap<String, CameraFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct PublishersFile {
    kds: Option<KdsFile>,
    s3: Option<S3File>,
    ddb: Option<DdbFile>,
}

#[derive(Debug, Deserialize, Default)]
struct KdsFile {
    enabled: Option<bool>,
    region: Option<String>,
    stream_name: Option<String>,
    batch_size: Option<usize>,
    max_retries: Option<u32>,
    base_backoff_ms: Option<u64>,
    event_id_bucket_ms: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
struct S3File {
    enabled: Option<bool>,
    bucket: Option<String>,
    prefix: Option<String>,
    region: Option<String>,
    jpeg_quality: Option<u8>,
    save_snapshots: Option<bool>,
    label_font_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DdbFile {
    enabled: Option<bool>,
    table_name: Option<String>,
    region: Option<String>,
    ttl_days: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraFile {
    enabled: Option<bool>,
    kvs_stream_name: Option<String>,
    kvs: Option<KvsFile>,
    fps_target: Option<f32>,
    roi: Option<Vec<Polygon>>,
    min_box_area: Option<f32>,
    detectors: Option<Vec<DetectorFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct KvsFile {
    region: Option<String>,
    hls_session_seconds: Option<u64>,
    url_refresh_margin: Option<u64>,
    reconnect_delay_sec: Option<f64>,
    max_reconnect_delay_sec: Option<f64>,
    backoff_multiplier: Option<f64>,
    max_consecutive_errors: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct DetectorFile {
    #[serde(rename = "type")]
    kind: String,
    params: Option<DetectorParams>,
}

// -------------------- resolved settings --------------------

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub publishers: PublisherSettings,
    pub cameras: Vec<CameraSettings>,
}

#[derive(Debug, Clone, Default)]
pub struct PublisherSettings {
    /// Present iff the event stream sink is enabled.
    pub kds: Option<KdsConfig>,
    /// Present iff the snapshot sink is enabled.
    pub s3: Option<S3Settings>,
    /// Present iff the metadata sink is enabled.
    pub ddb: Option<DdbConfig>,
}

#[derive(Debug, Clone)]
pub struct S3Settings {
    pub publisher: S3Config,
    /// Upload an annotated snapshot for every event-producing frame.
    pub save_snapshots: bool,
}

#[derive(Debug, Clone)]
pub struct DetectorSpec {
    pub kind: String,
    pub params: DetectorParams,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub camera_id: String,
    pub enabled: bool,
    pub source: HlsSourceConfig,
    pub fps_target: Option<f32>,
    pub roi: Vec<Polygon>,
    pub min_box_area: Option<f32>,
    pub detectors: Vec<DetectorSpec>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let file: ConfigFile = serde_yaml::from_str(raw).context("malformed YAML configuration")?;
        resolve(file)
    }

    /// Cameras with `enabled: true`.
    pub fn enabled_cameras(&self) -> impl Iterator<Item = &CameraSettings> {
        self.cameras.iter().filter(|c| c.enabled)
    }
}

fn resolve(file: ConfigFile) -> Result<AppConfig> {
    let publishers = resolve_publishers(file.publishers.unwrap_or_default())?;

    let camera_id_re = Regex::new(CAMERA_ID_PATTERN).expect("camera id pattern is valid");
    let mut cameras = Vec::new();
    for (camera_id, camera) in file.cameras.unwrap_or_default() {
        if !camera_id_re.is_match(&camera_id) {
            return Err(anyhow!(
                "camera id '{}' invalid: only alphanumerics, '-' and '_' allowed",
                camera_id
            ));
        }
        cameras.push(resolve_camera(camera_id, camera)?);
    }

    Ok(AppConfig {
        publishers,
        cameras,
    })
}

fn resolve_publishers(file: PublishersFile) -> Result<PublisherSettings> {
    let mut settings = PublisherSettings::default();

    if let Some(kds) = file.kds {
        if kds.enabled.unwrap_or(false) {
            let stream_name = kds
                .stream_name
                .filter(|s| !s.is_empty())
                .ok_or_else(|| anyhow!("publishers.kds.stream_name required when enabled"))?;
            settings.kds = Some(KdsConfig {
                stream_name,
                region: kds.region.unwrap_or_else(|| DEFAULT_REGION.to_string()),
                batch_size: kds.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
                max_retries: kds.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
                base_backoff_ms: kds.base_backoff_ms.unwrap_or(DEFAULT_BASE_BACKOFF_MS),
                event_id_bucket_ms: kds
                    .event_id_bucket_ms
                    .unwrap_or(DEFAULT_EVENT_ID_BUCKET_MS),
                ..KdsConfig::default()
            });
        }
    }

    if let Some(s3) = file.s3 {
        if s3.enabled.unwrap_or(false) {
            let bucket = s3
                .bucket
                .filter(|s| !s.is_empty())
                .ok_or_else(|| anyhow!("publishers.s3.bucket required when enabled"))?;
            settings.s3 = Some(S3Settings {
                publisher: S3Config {
                    bucket,
                    prefix: s3.prefix.unwrap_or_else(|| DEFAULT_S3_PREFIX.to_string()),
                    region: s3.region.unwrap_or_else(|| DEFAULT_REGION.to_string()),
                    jpeg_quality: s3.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
                    label_font_path: s3.label_font_path,
                },
                save_snapshots: s3.save_snapshots.unwrap_or(true),
            });
        }
    }

    if let Some(ddb) = file.ddb {
        if ddb.enabled.unwrap_or(false) {
            let table_name = ddb
                .table_name
                .filter(|s| !s.is_empty())
                .ok_or_else(|| anyhow!("publishers.ddb.table_name required when enabled"))?;
            settings.ddb = Some(DdbConfig {
                table_name,
                region: ddb.region.unwrap_or_else(|| DEFAULT_REGION.to_string()),
                ttl_days: ddb.ttl_days,
            });
        }
    }

    Ok(settings)
}

fn resolve_camera(camera_id: String, file: CameraFile) -> Result<CameraSettings> {
    let stream_name = file
        .kvs_stream_name
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("camera '{}' missing kvs_stream_name", camera_id))?;
    let kvs = file.kvs.unwrap_or_default();

    let reconnect_delay_sec = kvs.reconnect_delay_sec.unwrap_or(DEFAULT_RECONNECT_DELAY_SEC);
    let max_reconnect_delay_sec = kvs
        .max_reconnect_delay_sec
        .unwrap_or(DEFAULT_MAX_RECONNECT_DELAY_SEC);
    for (name, value) in [
        ("reconnect_delay_sec", reconnect_delay_sec),
        ("max_reconnect_delay_sec", max_reconnect_delay_sec),
    ] {
        if !value.is_finite() || value <= 0.0 {
            return Err(anyhow!(
                "camera '{}' kvs.{} must be a positive number",
                camera_id,
                name
            ));
        }
    }

    let source = HlsSourceConfig {
        camera_id: camera_id.clone(),
        stream_name,
        region: kvs.region.unwrap_or_else(|| DEFAULT_REGION.to_string()),
        session_seconds: kvs.hls_session_seconds.unwrap_or(DEFAULT_SESSION_SECONDS),
        refresh_margin: kvs.url_refresh_margin.unwrap_or(DEFAULT_REFRESH_MARGIN),
        reconnect_delay: Duration::from_secs_f64(reconnect_delay_sec),
        max_reconnect_delay: Duration::from_secs_f64(max_reconnect_delay_sec),
        backoff_multiplier: kvs.backoff_multiplier.unwrap_or(DEFAULT_BACKOFF_MULTIPLIER),
        max_consecutive_errors: kvs
            .max_consecutive_errors
            .unwrap_or(DEFAULT_MAX_CONSECUTIVE_ERRORS),
    };
    source
        .validate()
        .with_context(|| format!("camera '{}' kvs settings invalid", camera_id))?;

    if let Some(fps) = file.fps_target {
        if fps <= 0.0 {
            return Err(anyhow!("camera '{}' fps_target must be positive", camera_id));
        }
    }

    let detectors = file
        .detectors
        .unwrap_or_default()
        .into_iter()
        .map(|d| DetectorSpec {
            kind: d.kind,
            params: d.params.unwrap_or_default(),
        })
        .collect();

    Ok(CameraSettings {
        camera_id,
        enabled: file.enabled.unwrap_or(true),
        source,
        fps_target: file.fps_target,
        roi: file.roi.unwrap_or_default(),
        min_box_area: file.min_box_area,
        detectors,
    })
}
