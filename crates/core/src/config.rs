use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::InferenceBackend;
use crate::motion::{MotionThresholds, DEFAULT_MOTION_THRESHOLD, DEFAULT_SKIP_THRESHOLD};
use crate::pipeline::DEFAULT_QUEUE_CAPACITY;
use crate::scheduler::{validate_exp, SchedulerConfig};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "TEMPORA_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub interpolation: InterpolationConfig,
    pub pipeline: PipelineConfig,
    pub inference: InferenceConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InterpolationConfig {
    pub exp: u32,
    pub high_res: bool,
    pub skip_static: bool,
    pub skip_threshold: f32,
    pub motion_threshold: f32,
    pub montage: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InferenceConfig {
    pub backend: InferenceBackend,
    pub model_path: PathBuf,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutputConfig {
    pub codec: String,
    pub crf: u32,
    pub pixel_format: String,
    /// Container extension for video output.
    pub extension: String,
}

impl Default for InterpolationConfig {
    fn default() -> Self {
        Self {
            exp: 1,
            high_res: false,
            skip_static: false,
            skip_threshold: DEFAULT_SKIP_THRESHOLD,
            motion_threshold: DEFAULT_MOTION_THRESHOLD,
            montage: false,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            backend: InferenceBackend::default(),
            model_path: PathBuf::from("models/flownet.onnx"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            codec: "libx264".to_string(),
            crf: 18,
            pixel_format: "yuv420p".to_string(),
            extension: "mp4".to_string(),
        }
    }
}

impl InterpolationConfig {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            exp: self.exp,
            high_res: self.high_res,
            skip_static: self.skip_static,
            thresholds: MotionThresholds {
                skip: self.skip_threshold,
                large_motion: self.motion_threshold,
            },
            montage: self.montage,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        validate_exp(self.interpolation.exp)?;

        if self.pipeline.queue_capacity == 0 {
            bail!("pipeline.queue_capacity must be at least 1");
        }

        for (name, value) in [
            ("skip_threshold", self.interpolation.skip_threshold),
            ("motion_threshold", self.interpolation.motion_threshold),
        ] {
            if !value.is_finite() || value < 0.0 {
                bail!("interpolation.{name} must be a finite, non-negative number (got {value})");
            }
        }

        if self.output.extension.trim_start_matches('.').is_empty() {
            bail!("output.extension must not be empty");
        }

        Ok(())
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. TEMPORA_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Creates the data directory and writes a default `config.toml` on first run.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns `path` unchanged when absolute, otherwise joined onto `base`.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.interpolation.exp, 1);
        assert!(!cfg.interpolation.high_res);
        assert!(!cfg.interpolation.skip_static);
        assert_eq!(cfg.interpolation.skip_threshold, 0.002);
        assert_eq!(cfg.interpolation.motion_threshold, 0.2);
        assert!(!cfg.interpolation.montage);
        assert_eq!(cfg.pipeline.queue_capacity, 500);
        assert_eq!(cfg.inference.backend, InferenceBackend::Cuda);
        assert_eq!(cfg.inference.model_path, PathBuf::from("models/flownet.onnx"));
        assert_eq!(cfg.inference.trt_cache_dir, PathBuf::from("trt_cache"));
        assert_eq!(cfg.output.codec, "libx264");
        assert_eq!(cfg.output.crf, 18);
        assert_eq!(cfg.output.pixel_format, "yuv420p");
        assert_eq!(cfg.output.extension, "mp4");
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut original = AppConfig::default();
        original.interpolation.exp = 3;
        original.inference.backend = InferenceBackend::Tensorrt;
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_toml_fills_missing_sections_with_defaults() {
        let raw = "[interpolation]\nexp = 2\nskip_static = true\n\n[inference]\nbackend = \"trt\"\n";
        let cfg: AppConfig = toml::from_str(raw).expect("deserialize partial config");
        assert_eq!(cfg.interpolation.exp, 2);
        assert!(cfg.interpolation.skip_static);
        assert_eq!(cfg.interpolation.motion_threshold, 0.2);
        assert_eq!(cfg.inference.backend, InferenceBackend::Tensorrt);
        assert_eq!(cfg.pipeline, PipelineConfig::default());
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let mut cfg = AppConfig::default();
        cfg.interpolation.exp = 7;
        let error = cfg.validate().unwrap_err();
        assert!(matches!(
            error.downcast_ref::<PipelineError>(),
            Some(PipelineError::InvalidExponent(7))
        ));

        let mut cfg = AppConfig::default();
        cfg.pipeline.queue_capacity = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.interpolation.skip_threshold = f32::NAN;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.interpolation.motion_threshold = -0.1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn scheduler_config_carries_thresholds() {
        let mut cfg = InterpolationConfig::default();
        cfg.exp = 4;
        cfg.montage = true;
        cfg.motion_threshold = 0.3;
        let scheduler = cfg.scheduler_config();
        assert_eq!(scheduler.exp, 4);
        assert!(scheduler.montage);
        assert_eq!(scheduler.thresholds.large_motion, 0.3);
        assert_eq!(scheduler.thresholds.skip, 0.002);
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let loaded = AppConfig::load_from_path(&temp.path().join("missing.toml"))
            .expect("load config from nonexistent path");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn data_dir_uses_env_var_when_no_cli() {
        env::set_var(ENV_DATA_DIR, "/env/path");
        let result = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        assert_eq!(result, PathBuf::from("/env/path"));
    }

    #[test]
    fn config_path_is_data_dir_join_config_toml() {
        let result = config_path(Path::new("/data"));
        assert_eq!(result, PathBuf::from("/data/config.toml"));
    }

    #[test]
    fn initialize_creates_data_dir_and_config() {
        let temp = tempfile::tempdir().unwrap();
        let data = temp.path().join("data");
        initialize_data_dir(&data).expect("initialize data dir");

        assert!(data.join("config.toml").exists());
        let loaded = AppConfig::load_from_path(&config_path(&data)).unwrap();
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = tempfile::tempdir().unwrap();
        let cfg_path = temp.path().join("config.toml");
        let custom_content = "[interpolation]\nexp = 4\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(temp.path()).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }

    #[test]
    fn resolve_relative_to_handles_both_kinds() {
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("/abs/path")),
            PathBuf::from("/abs/path")
        );
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("sub")),
            PathBuf::from("/base/sub")
        );
    }
}
