use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::DmacamError;
use crate::types::{PixelEncoding, Resolution};

/// Environment variable naming an optional JSON config file.
pub const CONFIG_ENV: &str = "DMACAM_CONFIG";

/// Largest pool the capture side will ask for.
pub const MAX_BUFFER_COUNT: u32 = 32;

/// How the texture is made to reflect a newly reclaimed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshPolicy {
    /// Re-attach the slot's existing EGL image to the texture every frame.
    #[default]
    Rebind,
    /// Destroy and recreate the slot's EGL image every frame, then attach it.
    Reimport,
}

/// Ordering between "texture sampled" and "buffer resubmitted".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    /// Resubmit right after rebinding and trust driver-level implicit sync.
    #[default]
    Implicit,
    /// Hold the buffer until a GL fence placed after the draw has signalled.
    Fence,
}

/// Capture + import configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub device: PathBuf,
    pub resolution: Resolution,
    #[serde(alias = "pixelFormat")]
    pub pixel_format: PixelEncoding,
    #[serde(alias = "bufferCount")]
    pub buffer_count: u32,
    pub refresh: RefreshPolicy,
    pub sync: SyncPolicy,
    /// Stop after this many rendered frames. `None` runs until the window closes.
    #[serde(alias = "maxFrames")]
    pub max_frames: Option<u64>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/video0"),
            resolution: Resolution::HD,
            pixel_format: PixelEncoding::Bgrx32,
            buffer_count: 1,
            refresh: RefreshPolicy::Rebind,
            sync: SyncPolicy::Implicit,
            max_frames: None,
        }
    }
}

impl CaptureConfig {
    /// Defaults, then the file named by `DMACAM_CONFIG`, then `DMACAM_*` overrides.
    pub fn load() -> Result<Self, DmacamError> {
        let mut cfg = match std::env::var_os(CONFIG_ENV) {
            Some(path) => {
                let text = std::fs::read_to_string(&path)?;
                debug!("Loaded config file {}", PathBuf::from(&path).display());
                Self::from_json(&text)?
            }
            None => Self::default(),
        };
        cfg.apply_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json(text: &str) -> Result<Self, DmacamError> {
        serde_json::from_str(text).map_err(|e| DmacamError::ConfigurationInvalid {
            reason: format!("config file: {e}"),
        })
    }

    /// Apply `DMACAM_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), DmacamError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(device) = lookup("DMACAM_DEVICE") {
            self.device = PathBuf::from(device);
        }
        if let Some(w) = lookup("DMACAM_WIDTH") {
            self.resolution.width = parse_env("DMACAM_WIDTH", &w)?;
        }
        if let Some(h) = lookup("DMACAM_HEIGHT") {
            self.resolution.height = parse_env("DMACAM_HEIGHT", &h)?;
        }
        if let Some(n) = lookup("DMACAM_BUFFER_COUNT") {
            self.buffer_count = parse_env("DMACAM_BUFFER_COUNT", &n)?;
        }
        if let Some(n) = lookup("DMACAM_MAX_FRAMES") {
            self.max_frames = Some(parse_env("DMACAM_MAX_FRAMES", &n)?);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), DmacamError> {
        if self.resolution.width == 0 || self.resolution.height == 0 {
            return Err(DmacamError::ConfigurationInvalid {
                reason: format!("resolution {} has a zero dimension", self.resolution),
            });
        }
        if !(1..=MAX_BUFFER_COUNT).contains(&self.buffer_count) {
            return Err(DmacamError::ConfigurationInvalid {
                reason: format!(
                    "buffer count {} outside 1..={MAX_BUFFER_COUNT}",
                    self.buffer_count
                ),
            });
        }
        if self.buffer_count == 1 && self.sync == SyncPolicy::Fence {
            warn!("Fence sync with a single buffer stalls capture for one frame per fence");
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, DmacamError> {
    value.trim().parse().map_err(|_| DmacamError::ConfigurationInvalid {
        reason: format!("{key}={value:?} is not a valid number"),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_match_single_buffer_hd_bgrx() {
        let cfg = CaptureConfig::default();
        assert_eq!(cfg.device, PathBuf::from("/dev/video0"));
        assert_eq!(cfg.resolution, Resolution::new(1280, 720));
        assert_eq!(cfg.pixel_format, PixelEncoding::Bgrx32);
        assert_eq!(cfg.buffer_count, 1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserializes_camel_case_fields() {
        let json = r#"{
            "device": "/dev/video2",
            "resolution": {"width": 1920, "height": 1080},
            "pixelFormat": "nv12",
            "bufferCount": 4,
            "sync": "fence",
            "maxFrames": 120
        }"#;

        let cfg = CaptureConfig::from_json(json).expect("valid camelCase config");
        assert_eq!(cfg.device, PathBuf::from("/dev/video2"));
        assert_eq!(cfg.pixel_format, PixelEncoding::Nv12);
        assert_eq!(cfg.buffer_count, 4);
        assert_eq!(cfg.sync, SyncPolicy::Fence);
        assert_eq!(cfg.refresh, RefreshPolicy::Rebind);
        assert_eq!(cfg.max_frames, Some(120));
    }

    #[test]
    fn deserializes_snake_case_fields() {
        let json = r#"{"pixel_format": "yuyv", "buffer_count": 2, "refresh": "reimport"}"#;
        let cfg = CaptureConfig::from_json(json).expect("valid snake_case config");
        assert_eq!(cfg.pixel_format, PixelEncoding::Yuyv);
        assert_eq!(cfg.buffer_count, 2);
        assert_eq!(cfg.refresh, RefreshPolicy::Reimport);
        assert_eq!(cfg.resolution, Resolution::HD);
    }

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> = [
            ("DMACAM_DEVICE", "/dev/video7"),
            ("DMACAM_WIDTH", "640"),
            ("DMACAM_HEIGHT", "480"),
            ("DMACAM_BUFFER_COUNT", "3"),
        ]
        .into_iter()
        .collect();

        let mut cfg = CaptureConfig::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.device, PathBuf::from("/dev/video7"));
        assert_eq!(cfg.resolution, Resolution::new(640, 480));
        assert_eq!(cfg.buffer_count, 3);
        assert_eq!(cfg.max_frames, None);
    }

    #[test]
    fn bad_override_is_configuration_error() {
        let mut cfg = CaptureConfig::default();
        let err = cfg
            .apply_overrides(|k| (k == "DMACAM_BUFFER_COUNT").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, DmacamError::ConfigurationInvalid { .. }));
    }

    #[test]
    fn validate_rejects_zero_and_oversized_pools() {
        let mut cfg = CaptureConfig { buffer_count: 0, ..Default::default() };
        assert!(cfg.validate().is_err());
        cfg.buffer_count = MAX_BUFFER_COUNT + 1;
        assert!(cfg.validate().is_err());
        cfg.buffer_count = MAX_BUFFER_COUNT;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_resolution() {
        let cfg = CaptureConfig { resolution: Resolution::new(0, 720), ..Default::default() };
        assert!(cfg.validate().is_err());
    }
}
