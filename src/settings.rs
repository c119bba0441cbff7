use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

const MIN_DISTANCE_FLOOR_M: f64 = 10.0;
const MIN_DISTANCE_CEILING_M: f64 = 100_000.0;
const INTERVAL_FLOOR_MS: u64 = 1_000;
const INTERVAL_CEILING_MS: u64 = 3_600_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingSettings {
    pub min_distance_m: f64,
    pub tracking_interval_ms: u64,
    pub notifications_enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTrackingSettingsPayload {
    pub min_distance_m: Option<f64>,
    pub tracking_interval_ms: Option<u64>,
    pub notifications_enabled: Option<bool>,
}

impl TrackingSettings {
    pub fn load(path: &Path, config: &AppConfig) -> AppResult<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<Self>(&contents) {
                Ok(settings) => Ok(settings.clamped()),
                Err(err) => {
                    warn!(
                        target: "settings",
                        error = ?err,
                        "failed to parse settings file; regenerating defaults"
                    );
                    let defaults = Self::from_config(config);
                    defaults.persist(path)?;
                    Ok(defaults)
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let defaults = Self::from_config(config);
                defaults.persist(path)?;
                Ok(defaults)
            }
            Err(err) => Err(AppError::Io(err)),
        }
    }

    pub fn persist(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized)?;
        Ok(())
    }

    pub fn apply_patch(&mut self, payload: &UpdateTrackingSettingsPayload) {
        if let Some(distance) = payload.min_distance_m {
            self.min_distance_m = clamp_distance(distance);
        }
        if let Some(interval) = payload.tracking_interval_ms {
            self.tracking_interval_ms = clamp_interval(interval);
        }
        if let Some(enabled) = payload.notifications_enabled {
            self.notifications_enabled = enabled;
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            min_distance_m: clamp_distance(config.tracking_min_distance_m),
            tracking_interval_ms: clamp_interval(config.tracking_interval_ms),
            notifications_enabled: true,
        }
    }

    fn clamped(mut self) -> Self {
        self.min_distance_m = clamp_distance(self.min_distance_m);
        self.tracking_interval_ms = clamp_interval(self.tracking_interval_ms);
        self
    }
}

fn clamp_distance(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(MIN_DISTANCE_FLOOR_M, MIN_DISTANCE_CEILING_M)
    } else {
        MIN_DISTANCE_FLOOR_M
    }
}

fn clamp_interval(value: u64) -> u64 {
    value.clamp(INTERVAL_FLOOR_MS, INTERVAL_CEILING_MS)
}

pub fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join("settings.json")
}
