//! ORB-SLAM3 settings file (OpenCV YAML).
//!
//! Both the v1.0 layout (`Camera1.fx`, `File.version: "1.0"`) and the legacy
//! layout (`Camera.fx`) are accepted. Keys are flat, dotted names.
//!
//! `Camera.imageScale` tells the capture side to scale frames; `Camera.newWidth`
//! and `Camera.newHeight` make the engine resize every frame to that exact size.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::tracking::frame::{CameraModel, OrbParams};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("missing required setting `{0}`")]
    Missing(String),

    #[error("setting `{key}` is invalid: {msg}")]
    Invalid { key: String, msg: String },
}

/// Flat keys of an ORB-SLAM3 settings file. Unknown keys are ignored.
#[derive(Debug, Deserialize)]
struct SettingsYaml {
    #[serde(rename = "File.version")]
    version: Option<serde_yaml::Value>,

    #[serde(rename = "Camera1.fx", alias = "Camera.fx")]
    fx: Option<f64>,
    #[serde(rename = "Camera1.fy", alias = "Camera.fy")]
    fy: Option<f64>,
    #[serde(rename = "Camera1.cx", alias = "Camera.cx")]
    cx: Option<f64>,
    #[serde(rename = "Camera1.cy", alias = "Camera.cy")]
    cy: Option<f64>,
    #[serde(rename = "Camera1.k1", alias = "Camera.k1", default)]
    k1: f64,
    #[serde(rename = "Camera1.k2", alias = "Camera.k2", default)]
    k2: f64,
    #[serde(rename = "Camera1.p1", alias = "Camera.p1", default)]
    p1: f64,
    #[serde(rename = "Camera1.p2", alias = "Camera.p2", default)]
    p2: f64,
    #[serde(rename = "Camera1.k3", alias = "Camera.k3", default)]
    k3: f64,

    #[serde(rename = "Camera.width")]
    width: Option<f64>,
    #[serde(rename = "Camera.height")]
    height: Option<f64>,
    #[serde(rename = "Camera.newWidth")]
    new_width: Option<f64>,
    #[serde(rename = "Camera.newHeight")]
    new_height: Option<f64>,
    #[serde(rename = "Camera.imageScale")]
    image_scale: Option<f64>,
    #[serde(rename = "Camera.fps")]
    fps: Option<f64>,
    #[serde(rename = "Camera.RGB")]
    rgb: Option<f64>,

    #[serde(rename = "ORBextractor.nFeatures")]
    n_features: Option<i32>,
    #[serde(rename = "ORBextractor.scaleFactor")]
    scale_factor: Option<f64>,
    #[serde(rename = "ORBextractor.nLevels")]
    n_levels: Option<i32>,
    #[serde(rename = "ORBextractor.iniThFAST")]
    ini_th_fast: Option<i32>,
    #[serde(rename = "ORBextractor.minThFAST")]
    min_th_fast: Option<i32>,
}

/// Engine settings read from the settings file.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Calibration at the capture resolution.
    pub camera: CameraModel,
    /// Resolution the engine resizes frames to before tracking, if any.
    pub new_size: Option<(u32, u32)>,
    /// `Camera.imageScale`: factor the driver resizes captured frames by.
    pub scale: f64,
    pub fps: f64,
    /// Input images are RGB rather than BGR.
    pub rgb: bool,
    pub orb: OrbParams,
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, SettingsError> {
        // serde_yaml rejects OpenCV's `%YAML:1.0` directive.
        let body: String = text
            .lines()
            .filter(|l| !l.trim_start().starts_with('%'))
            .collect::<Vec<_>>()
            .join("\n");
        let raw: SettingsYaml = serde_yaml::from_str(&body)?;

        let prefix = if raw.version.is_some() { "Camera1" } else { "Camera" };
        let intrinsic = |value: Option<f64>, name: &str| {
            value.ok_or_else(|| SettingsError::Missing(format!("{prefix}.{name}")))
        };

        let width = required(raw.width, "Camera.width")?;
        let height = required(raw.height, "Camera.height")?;
        let camera = CameraModel::new(
            intrinsic(raw.fx, "fx")?,
            intrinsic(raw.fy, "fy")?,
            intrinsic(raw.cx, "cx")?,
            intrinsic(raw.cy, "cy")?,
            positive_dimension("Camera.width", width)?,
            positive_dimension("Camera.height", height)?,
        )
        .with_distortion([raw.k1, raw.k2, raw.p1, raw.p2, raw.k3]);

        let new_size = match (raw.new_width, raw.new_height) {
            (Some(w), Some(h)) => Some((
                positive_dimension("Camera.newWidth", w)?,
                positive_dimension("Camera.newHeight", h)?,
            )),
            (None, None) => None,
            (Some(_), None) => return Err(SettingsError::Missing("Camera.newHeight".into())),
            (None, Some(_)) => return Err(SettingsError::Missing("Camera.newWidth".into())),
        };

        let scale = raw.image_scale.unwrap_or(1.0);
        if !(scale > 0.0 && scale.is_finite()) {
            return Err(invalid("Camera.imageScale", &format!("{scale} is not a positive factor")));
        }

        let defaults = OrbParams::default();
        let orb = OrbParams {
            n_features: raw.n_features.unwrap_or(defaults.n_features),
            scale_factor: raw.scale_factor.unwrap_or(defaults.scale_factor),
            n_levels: raw.n_levels.unwrap_or(defaults.n_levels),
            ini_th_fast: raw.ini_th_fast.unwrap_or(defaults.ini_th_fast),
            min_th_fast: raw.min_th_fast.unwrap_or(defaults.min_th_fast),
        };
        if orb.n_features <= 0 || orb.n_levels <= 0 || orb.scale_factor <= 1.0 {
            return Err(SettingsError::Invalid {
                key: "ORBextractor".into(),
                msg: format!("{orb:?}"),
            });
        }

        Ok(Self {
            camera,
            new_size,
            scale,
            fps: raw.fps.unwrap_or(30.0),
            rgb: raw.rgb.unwrap_or(0.0) != 0.0,
            orb,
        })
    }

    /// Factor captured frames are resized by before they reach the engine.
    pub fn image_scale(&self) -> f64 {
        self.scale
    }

    /// Size of the images the tracker works on.
    pub fn tracking_size(&self) -> (u32, u32) {
        let camera = self.tracking_camera();
        (camera.width, camera.height)
    }

    /// Calibration at the tracking resolution.
    ///
    /// `Camera.newWidth`/`newHeight` win over `Camera.imageScale`: the engine
    /// resizes whatever it receives to that size.
    pub fn tracking_camera(&self) -> CameraModel {
        match self.new_size {
            Some((w, h)) => self.camera.resized(w, h),
            None if self.scale != 1.0 => self.camera.scaled(self.scale),
            None => self.camera,
        }
    }
}

fn required(value: Option<f64>, key: &str) -> Result<f64, SettingsError> {
    value.ok_or_else(|| SettingsError::Missing(key.to_string()))
}

fn invalid(key: &str, msg: &str) -> SettingsError {
    SettingsError::Invalid {
        key: key.to_string(),
        msg: msg.to_string(),
    }
}

fn positive_dimension(key: &str, value: f64) -> Result<u32, SettingsError> {
    if value >= 1.0 && value.fract() == 0.0 {
        Ok(value as u32)
    } else {
        Err(invalid(key, &format!("{value} is not a positive integer")))
    }
}
