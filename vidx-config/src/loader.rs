use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};

use crate::models::VidxConfig;

/// Path to a TOML or JSON configuration file.
pub const CONFIG_PATH_ENV: &str = "VIDX_CONFIG_PATH";
/// Inline JSON configuration.
pub const CONFIG_JSON_ENV: &str = "VIDX_CONFIG_JSON";

const DEFAULT_CANDIDATES: &[&str] = &[
    "vidx.toml",
    "vidx.json",
    "config/vidx.toml",
    "config/vidx.json",
];

/// Where the active configuration came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

impl VidxConfig {
    /// Load configuration using environment variables.
    /// Evaluation order:
    /// 1) `$VIDX_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$VIDX_CONFIG_JSON` (inline JSON),
    /// 3) the first of `vidx.toml`, `vidx.json`, `config/vidx.toml`,
    ///    `config/vidx.json` in the working directory,
    /// 4) defaults.
    ///
    /// The result is validated before it is returned.
    pub fn load_from_env() -> anyhow::Result<(Self, ConfigSource)> {
        let cwd = env::current_dir().context("failed to resolve working directory")?;
        Self::load_from_env_in(&cwd)
    }

    /// Like [`VidxConfig::load_from_env`], searching for default files
    /// under `dir` instead of the working directory.
    pub fn load_from_env_in(dir: &Path) -> anyhow::Result<(Self, ConfigSource)> {
        let (config, source) = Self::resolve(dir)?;
        config
            .validate()
            .with_context(|| format!("invalid configuration from {source:?}"))?;
        Ok((config, source))
    }

    fn resolve(dir: &Path) -> anyhow::Result<(Self, ConfigSource)> {
        if let Ok(path_str) = env::var(CONFIG_PATH_ENV)
            && !path_str.trim().is_empty()
        {
            let path = PathBuf::from(path_str);
            let config = Self::load_from_file(&path)?;
            return Ok((config, ConfigSource::EnvPath(path)));
        }

        if let Ok(raw) = env::var(CONFIG_JSON_ENV)
            && !raw.trim().is_empty()
        {
            let parsed = Self::parse_json(&raw).with_context(|| {
                format!("failed to parse {CONFIG_JSON_ENV}")
            })?;
            return Ok((parsed, ConfigSource::EnvInline));
        }

        if let Some(path) = Self::find_default_file(dir) {
            let config = Self::load_from_file(&path)?;
            return Ok((config, ConfigSource::File(path)));
        }

        Ok((Self::default(), ConfigSource::Default))
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&contents)
                .with_context(|| format!("invalid config {}", path.display())),
            Some("toml") | Some("tml") => toml::from_str(&contents)
                .map_err(|err| anyhow!("invalid config {}: {}", path.display(), err)),
            _ => Self::parse_from_str(&contents, &path.display().to_string()),
        }
    }

    /// TOML first, then JSON.
    pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<Self> {
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| {
                anyhow!(
                    "failed to parse config {}: toml error: {}; json error: {}",
                    origin,
                    toml_err,
                    json_err
                )
            })
        })
    }

    pub fn parse_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).map_err(|err| anyhow!("invalid config json: {err}"))
    }

    pub fn find_default_file(dir: &Path) -> Option<PathBuf> {
        DEFAULT_CANDIDATES
            .iter()
            .map(|candidate| dir.join(candidate))
            .find(|path| path.is_file())
    }

    /// Render as TOML, e.g. to seed a config file with the defaults.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("failed to render config as toml")
    }
}
