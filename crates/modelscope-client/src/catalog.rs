/// Model catalog and image size presets
///
/// Checkpoints and LoRA weights are referenced by ModelScope model version id.
/// The catalog ships with built-in defaults and can be refreshed from the
/// `checkpoint.json` / `loraArgs.json` files the local service exposes.
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::http::{join_url, HttpClient};

/// Output image dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub const MIN_SIDE: u32 = 64;
    pub const MAX_SIDE: u32 = 2048;

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn validate(&self) -> Result<()> {
        let in_range = |side: u32| (Self::MIN_SIDE..=Self::MAX_SIDE).contains(&side);
        if !in_range(self.width) || !in_range(self.height) {
            return Err(ClientError::InvalidRequest(format!(
                "image size {} outside {}x{}..={}x{}",
                self,
                Self::MIN_SIDE,
                Self::MIN_SIDE,
                Self::MAX_SIDE,
                Self::MAX_SIDE
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for ImageSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for ImageSize {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        let (w, h) = s
            .trim()
            .split_once(['x', 'X', '*'])
            .ok_or_else(|| ClientError::InvalidRequest(format!("invalid size '{s}', expected WxH")))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<u32>()
                .map_err(|_| ClientError::InvalidRequest(format!("invalid size '{s}', expected WxH")))
        };
        Ok(Self::new(parse(w)?, parse(h)?))
    }
}

/// Resolution tier for presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionTier {
    /// ~1 megapixel
    Sm,
    /// ~1.7 megapixel
    Hd,
    /// ~4 megapixel
    TwoK,
}

impl FromStr for ResolutionTier {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sm" => Ok(Self::Sm),
            "hd" => Ok(Self::Hd),
            "2k" => Ok(Self::TwoK),
            other => Err(ClientError::InvalidRequest(format!(
                "unknown resolution tier '{other}' (sm, hd, 2k)"
            ))),
        }
    }
}

impl std::fmt::Display for ResolutionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sm => write!(f, "SM"),
            Self::Hd => write!(f, "HD"),
            Self::TwoK => write!(f, "2k"),
        }
    }
}

const SM_PRESETS: &[(&str, u32, u32)] = &[
    ("21:9", 1024, 394),
    ("16:9", 1024, 576),
    ("4:3", 1024, 768),
    ("1:1", 1024, 1024),
    ("3:4", 768, 1024),
    ("9:16", 576, 1024),
];

const HD_PRESETS: &[(&str, u32, u32)] = &[
    ("1:1", 1328, 1328),
    ("2:3", 1056, 1584),
    ("3:4", 1104, 1472),
    ("4:3", 1472, 1104),
    ("3:2", 1584, 1056),
    ("16:9", 1664, 936),
    ("9:16", 936, 1664),
];

const TWO_K_PRESETS: &[(&str, u32, u32)] = &[
    ("1:1", 2048, 2048),
    ("2:3", 1664, 2496),
    ("3:4", 1728, 2304),
    ("4:3", 2304, 1728),
    ("3:2", 2496, 1664),
    ("16:9", 2560, 1440),
    ("9:16", 1440, 2560),
];

/// Preset table for a tier, as `(aspect ratio, size)` pairs
pub fn presets(tier: ResolutionTier) -> Vec<(&'static str, ImageSize)> {
    let table = match tier {
        ResolutionTier::Sm => SM_PRESETS,
        ResolutionTier::Hd => HD_PRESETS,
        ResolutionTier::TwoK => TWO_K_PRESETS,
    };
    table
        .iter()
        .map(|(ratio, w, h)| (*ratio, ImageSize::new(*w, *h)))
        .collect()
}

/// Look up a preset such as `("hd", "16:9")`.
pub fn preset(tier: ResolutionTier, ratio: &str) -> Option<ImageSize> {
    presets(tier)
        .into_iter()
        .find(|(r, _)| *r == ratio)
        .map(|(_, size)| size)
}

/// LoRA reference passed as a generation parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraArg {
    #[serde(rename = "LoraName", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(rename = "modelVersionId")]
    pub model_version_id: u64,

    #[serde(default = "default_scale")]
    pub scale: f32,
}

fn default_scale() -> f32 {
    1.0
}

impl LoraArg {
    pub fn new(model_version_id: u64, scale: f32) -> Self {
        Self {
            name: None,
            model_version_id,
            scale,
        }
    }

    pub fn named(name: impl Into<String>, model_version_id: u64, scale: f32) -> Self {
        Self {
            name: Some(name.into()),
            model_version_id,
            scale,
        }
    }

    /// Key used by services that address LoRAs by a single string
    pub fn key(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.model_version_id.to_string())
    }
}

impl FromStr for LoraArg {
    type Err = ClientError;

    /// Parses `ID` or `ID:SCALE`.
    fn from_str(s: &str) -> Result<Self> {
        let (id, scale) = match s.split_once(':') {
            Some((id, scale)) => (id, Some(scale)),
            None => (s, None),
        };
        let model_version_id = id
            .trim()
            .parse::<u64>()
            .map_err(|_| ClientError::InvalidRequest(format!("invalid LoRA id in '{s}'")))?;
        let scale = match scale {
            Some(v) => v
                .trim()
                .parse::<f32>()
                .map_err(|_| ClientError::InvalidRequest(format!("invalid LoRA scale in '{s}'")))?,
            None => default_scale(),
        };
        Ok(Self::new(model_version_id, scale))
    }
}

/// Base checkpoint for Muse generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(rename = "CheckpointName")]
    pub name: String,

    #[serde(rename = "checkpointModelVersionId")]
    pub model_version_id: u64,

    #[serde(rename = "checkpointShowInfo")]
    pub show_info: String,

    #[serde(rename = "numInferenceSteps", default = "default_steps")]
    pub num_inference_steps: u32,

    #[serde(rename = "guidanceScale", default = "default_guidance")]
    pub guidance_scale: f32,
}

fn default_steps() -> u32 {
    50
}

fn default_guidance() -> f32 {
    4.0
}

impl Checkpoint {
    pub fn qwen_image() -> Self {
        Self {
            name: "Qwen_Image_v1".to_string(),
            model_version_id: 275167,
            show_info: "Qwen_Image_v1.safetensors".to_string(),
            num_inference_steps: 50,
            guidance_scale: 4.0,
        }
    }

    pub fn z_image_turbo() -> Self {
        Self {
            name: "造相-Z-Image-Turbo_master".to_string(),
            model_version_id: 469191,
            show_info: "造相-Z-Image-Turbo_master.safetensors".to_string(),
            num_inference_steps: 9,
            guidance_scale: 2.5,
        }
    }
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::qwen_image()
    }
}

/// Known checkpoints and LoRA weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCatalog {
    pub checkpoints: Vec<Checkpoint>,
    pub loras: Vec<LoraArg>,
}

pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const LORA_FILE: &str = "loraArgs.json";

impl Default for ModelCatalog {
    fn default() -> Self {
        Self {
            checkpoints: vec![Checkpoint::qwen_image(), Checkpoint::z_image_turbo()],
            loras: vec![
                LoraArg::named("FEIFEI", 310150, 1.0),
                LoraArg::named("FEIFEI_V2", 313167, 1.0),
                LoraArg::named("GUA", 332699, 1.0),
                LoraArg::named("GUA_V2", 334516, 1.0),
                LoraArg::named("GUA_V8", 346999, 1.0),
                LoraArg::named("GUA_V9", 365553, 1.0),
            ],
        }
    }
}

impl ModelCatalog {
    /// Load `checkpoint.json` and `loraArgs.json` from a directory.
    ///
    /// Each file falls back to the built-in list independently when it is
    /// missing or unreadable.
    pub fn load_dir(dir: &Path) -> Self {
        let defaults = Self::default();
        Self {
            checkpoints: load_list(&dir.join(CHECKPOINT_FILE)).unwrap_or(defaults.checkpoints),
            loras: load_list(&dir.join(LORA_FILE)).unwrap_or(defaults.loras),
        }
    }

    /// Fetch the catalog served by the local service, falling back to the
    /// built-in lists on any failure.
    pub async fn fetch(http: &HttpClient, base_url: &str) -> Self {
        let checkpoints = http
            .get_json(&join_url(base_url, "comfyui_modelscope/checkpoint.json"), &[])
            .await
            .and_then(|value| Ok(serde_json::from_value::<Vec<Checkpoint>>(value)?));
        let loras = http
            .get_json(&join_url(base_url, "comfyui_modelscope/loraArgs.json"), &[])
            .await
            .and_then(|value| Ok(serde_json::from_value::<Vec<LoraArg>>(value)?));

        match (checkpoints, loras) {
            (Ok(checkpoints), Ok(loras)) => Self { checkpoints, loras },
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to load model catalog, using defaults: {}", e);
                Self::default()
            }
        }
    }

    pub fn checkpoint(&self, name: &str) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .find(|c| c.name == name || c.show_info == name)
    }

    pub fn lora(&self, name: &str) -> Option<&LoraArg> {
        self.loras
            .iter()
            .find(|l| l.name.as_deref() == Some(name) || l.model_version_id.to_string() == name)
    }
}

fn load_list<T: serde::de::DeserializeOwned>(path: &Path) -> Option<Vec<T>> {
    let json = match std::fs::read_to_string(path) {
        Ok(json) => json,
        Err(e) => {
            debug!("Catalog file {} not readable: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str(&json) {
        Ok(list) => Some(list),
        Err(e) => {
            warn!("Catalog file {} is malformed: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_size_parse() {
        let size: ImageSize = "928x1664".parse().unwrap();
        assert_eq!(size, ImageSize::new(928, 1664));
        assert_eq!(size.to_string(), "928x1664");

        assert!("928".parse::<ImageSize>().is_err());
        assert!("ax1".parse::<ImageSize>().is_err());
    }

    #[test]
    fn test_image_size_bounds() {
        assert!(ImageSize::new(512, 512).validate().is_ok());
        assert!(ImageSize::new(2048, 2048).validate().is_ok());
        assert!(ImageSize::new(2560, 1440).validate().is_err());
        assert!(ImageSize::new(0, 512).validate().is_err());
    }

    #[test]
    fn test_presets() {
        assert_eq!(
            preset(ResolutionTier::Hd, "9:16"),
            Some(ImageSize::new(936, 1664))
        );
        assert_eq!(
            preset(ResolutionTier::Sm, "1:1"),
            Some(ImageSize::new(1024, 1024))
        );
        assert_eq!(preset(ResolutionTier::TwoK, "21:9"), None);
        assert_eq!(presets(ResolutionTier::TwoK).len(), 7);
        assert_eq!("2K".parse::<ResolutionTier>().unwrap(), ResolutionTier::TwoK);
    }

    #[test]
    fn test_lora_arg_parse() {
        let lora: LoraArg = "313167:0.8".parse().unwrap();
        assert_eq!(lora.model_version_id, 313167);
        assert!((lora.scale - 0.8).abs() < f32::EPSILON);

        let lora: LoraArg = "310150".parse().unwrap();
        assert_eq!(lora.scale, 1.0);
        assert_eq!(lora.key(), "310150");

        assert!("gua".parse::<LoraArg>().is_err());
    }

    #[test]
    fn test_catalog_json_field_names() {
        let json = r#"[{"LoraName":"GUA","modelVersionId":332699,"scale":1}]"#;
        let loras: Vec<LoraArg> = serde_json::from_str(json).unwrap();
        assert_eq!(loras[0], LoraArg::named("GUA", 332699, 1.0));

        let json = r#"[{"CheckpointName":"Qwen_Image_v1","checkpointModelVersionId":275167,"checkpointShowInfo":"Qwen_Image_v1.safetensors"}]"#;
        let checkpoints: Vec<Checkpoint> = serde_json::from_str(json).unwrap();
        assert_eq!(checkpoints[0], Checkpoint::qwen_image());
    }

    #[test]
    fn test_catalog_load_dir_fallback() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(LORA_FILE),
            r#"[{"LoraName":"ONLY","modelVersionId":1,"scale":0.5}]"#,
        )
        .unwrap();

        let catalog = ModelCatalog::load_dir(dir.path());
        assert_eq!(catalog.loras.len(), 1);
        assert_eq!(catalog.lora("ONLY").unwrap().scale, 0.5);
        assert_eq!(catalog.checkpoints, ModelCatalog::default().checkpoints);
        assert!(catalog.checkpoint("Qwen_Image_v1.safetensors").is_some());
    }
}
