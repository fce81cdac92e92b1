/// Persisted user settings
///
/// Credentials, output sizes and model selection live in one JSON file under
/// the platform config directory. The file is loaded once at startup; missing
/// fields take their defaults and credential environment variables override
/// the stored values.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::catalog::{Checkpoint, ImageSize, LoraArg};
use crate::error::{ClientError, Result};

pub const TOKEN_ENV: &str = "MODELSCOPE_TOKEN";
pub const COOKIE_ENV: &str = "MODELSCOPE_COOKIE";
pub const OPENAI_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Bearer token for the ModelScope inference API
    pub modelscope_token: Option<String>,

    /// Browser cookie for the ModelScope studio (Muse) API
    pub modelscope_cookie: Option<String>,

    /// Key forwarded for captioning
    pub openai_api_key: Option<String>,

    /// Generation output size
    pub image_size: ImageSize,

    /// Edit output size
    pub edit_size: ImageSize,

    /// Edit model
    pub selected_model: String,

    /// Prompt prefilled for edits
    pub custom_prompt: String,

    pub checkpoint: Option<Checkpoint>,

    pub loras: Vec<LoraArg>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            modelscope_token: None,
            modelscope_cookie: None,
            openai_api_key: None,
            image_size: ImageSize::new(928, 1664),
            edit_size: ImageSize::new(1280, 1920),
            selected_model: "Qwen/Qwen-Image-Edit-2511".to_string(),
            custom_prompt: String::new(),
            checkpoint: None,
            loras: vec![LoraArg::new(310150, 1.0)],
        }
    }
}

/// Keys accepted by [`Settings::set`]
pub const SETTING_KEYS: &[&str] = &[
    "modelscope_token",
    "modelscope_cookie",
    "openai_api_key",
    "image_size",
    "edit_size",
    "selected_model",
    "custom_prompt",
    "loras",
];

impl Settings {
    pub fn token(&self) -> Option<&str> {
        non_empty(&self.modelscope_token)
    }

    pub fn cookie(&self) -> Option<&str> {
        non_empty(&self.modelscope_cookie)
    }

    pub fn openai_key(&self) -> Option<&str> {
        non_empty(&self.openai_api_key)
    }

    /// Override credentials from the environment
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(token) = lookup(TOKEN_ENV).filter(|v| !v.is_empty()) {
            self.modelscope_token = Some(token);
        }
        if let Some(cookie) = lookup(COOKIE_ENV).filter(|v| !v.is_empty()) {
            self.modelscope_cookie = Some(cookie);
        }
        if let Some(key) = lookup(OPENAI_KEY_ENV).filter(|v| !v.is_empty()) {
            self.openai_api_key = Some(key);
        }
        self
    }

    /// Update one setting from its text form
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let optional = |v: &str| {
            let v = v.trim();
            (!v.is_empty()).then(|| v.to_string())
        };
        match key {
            "modelscope_token" => self.modelscope_token = optional(value),
            "modelscope_cookie" => self.modelscope_cookie = optional(value),
            "openai_api_key" => self.openai_api_key = optional(value),
            "image_size" => self.image_size = checked_size(value)?,
            "edit_size" => self.edit_size = checked_size(value)?,
            "selected_model" => self.selected_model = value.trim().to_string(),
            "custom_prompt" => self.custom_prompt = value.to_string(),
            "loras" => {
                self.loras = value
                    .split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::parse)
                    .collect::<Result<Vec<LoraArg>>>()?;
            }
            other => {
                return Err(ClientError::InvalidRequest(format!(
                    "unknown setting '{other}', expected one of: {}",
                    SETTING_KEYS.join(", ")
                )))
            }
        }
        Ok(())
    }

    /// Copy with credentials masked, for display
    pub fn redacted(&self) -> Self {
        let mask = |v: &Option<String>| {
            v.as_ref().map(|s| {
                let visible: String = s.chars().take(4).collect();
                format!("{visible}…({} chars)", s.chars().count())
            })
        };
        Self {
            modelscope_token: mask(&self.modelscope_token),
            modelscope_cookie: mask(&self.modelscope_cookie),
            openai_api_key: mask(&self.openai_api_key),
            ..self.clone()
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn checked_size(value: &str) -> Result<ImageSize> {
    let size: ImageSize = value.parse()?;
    size.validate()?;
    Ok(size)
}

/// JSON file holding [`Settings`]
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// `<config dir>/modelscope-client/settings.json`
    pub fn default_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(std::env::temp_dir);
        base.join("modelscope-client").join("settings.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings, falling back to defaults when the file does not exist
    pub fn load(&self) -> Result<Settings> {
        match std::fs::read_to_string(&self.path) {
            Ok(json) => {
                let settings = serde_json::from_str(&json)?;
                debug!("Loaded settings from {}", self.path.display());
                Ok(settings)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings at {}, using defaults", self.path.display());
                Ok(Settings::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(settings)?)?;
        info!("Settings saved to {}", self.path.display());
        Ok(())
    }

    pub fn reset(&self) -> Result<Settings> {
        let settings = Settings::default();
        self.save(&settings)?;
        Ok(settings)
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new(Self::default_path())
    }
}
