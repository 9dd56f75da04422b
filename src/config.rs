//! Configuration for leadrun.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (LEADRUN_HOME, LEADRUN_BASE_URL, LEADRUN_API_KEY)
//! 2. Config file (.leadrun/config.yaml)
//! 3. Defaults (~/.leadrun)
//!
//! Config file discovery:
//! - Searches current directory and parents for .leadrun/config.yaml
//! - `paths.home` is relative to the .leadrun/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::HttpGeneratorConfig;
use crate::core::{MutexSettings, OrchestratorSettings};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const DEFAULT_API_KEY_ENV: &str = "LEADRUN_API_KEY";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub generator: GeneratorFileConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorFileConfig,
    #[serde(default)]
    pub storage: StorageFileConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .leadrun/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeneratorFileConfig {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub repair_model: Option<String>,
    /// Name of the environment variable holding the API key
    pub api_key_env: Option<String>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrchestratorFileConfig {
    pub lock_ttl_minutes: Option<i64>,
    pub stale_run_hours: Option<i64>,
    pub step_delay_ms: Option<u64>,
    pub mutex_ttl_ms: Option<u64>,
    pub mutex_jitter_min_ms: Option<u64>,
    pub mutex_jitter_max_ms: Option<u64>,
    pub mutex_settle_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageFileConfig {
    pub max_value_bytes: Option<usize>,
}

/// Generator connection settings
#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    pub base_url: String,
    pub model: String,
    pub repair_model: String,
    pub api_key_env: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl GeneratorSettings {
    pub fn http_config(&self) -> HttpGeneratorConfig {
        HttpGeneratorConfig {
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            timeout: self.timeout,
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to leadrun home
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub generator: GeneratorSettings,
    pub orchestrator: OrchestratorSettings,
    /// Per-value capacity of the file store
    pub max_value_bytes: Option<usize>,
}

impl ResolvedConfig {
    /// Directory holding the key-value files
    pub fn store_dir(&self) -> PathBuf {
        self.home.join("store")
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".leadrun").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn resolve_generator(file: &GeneratorFileConfig) -> GeneratorSettings {
    let api_key_env = file
        .api_key_env
        .clone()
        .unwrap_or_else(|| DEFAULT_API_KEY_ENV.to_string());

    GeneratorSettings {
        base_url: non_empty_env("LEADRUN_BASE_URL")
            .or_else(|| file.base_url.clone())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        api_key: non_empty_env(&api_key_env),
        api_key_env,
        model: file.model.clone().unwrap_or_else(|| "gpt-4o".to_string()),
        repair_model: file
            .repair_model
            .clone()
            .unwrap_or_else(|| "gpt-4o-mini".to_string()),
        timeout: Duration::from_secs(file.timeout_seconds.unwrap_or(60)),
    }
}

/// A positive whole number of minutes or hours, checked against chrono's range
fn positive_span(
    value: Option<i64>,
    field: &str,
    convert: fn(i64) -> Option<chrono::Duration>,
    default: chrono::Duration,
) -> Result<chrono::Duration> {
    match value {
        None => Ok(default),
        Some(v) if v <= 0 => anyhow::bail!("orchestrator.{} must be positive, got {}", field, v),
        Some(v) => convert(v).with_context(|| format!("orchestrator.{} is out of range: {}", field, v)),
    }
}

fn resolve_orchestrator(
    file: &OrchestratorFileConfig,
    generator: &GeneratorSettings,
) -> Result<OrchestratorSettings> {
    let defaults = OrchestratorSettings::default();
    let mutex_defaults = MutexSettings::default();

    let jitter_min = file
        .mutex_jitter_min_ms
        .map(Duration::from_millis)
        .unwrap_or(mutex_defaults.jitter_min);
    // A max below min collapses to a fixed delay
    let jitter_max = file
        .mutex_jitter_max_ms
        .map(Duration::from_millis)
        .unwrap_or(mutex_defaults.jitter_max)
        .max(jitter_min);

    let lock_ttl = positive_span(
        file.lock_ttl_minutes,
        "lock_ttl_minutes",
        chrono::Duration::try_minutes,
        defaults.lock_ttl,
    )?;
    let stale_after = positive_span(
        file.stale_run_hours,
        "stale_run_hours",
        chrono::Duration::try_hours,
        defaults.stale_after,
    )?;

    Ok(OrchestratorSettings {
        model: generator.model.clone(),
        repair_model: generator.repair_model.clone(),
        lock_ttl,
        stale_after,
        step_delay: file
            .step_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.step_delay),
        mutex_ttl: file
            .mutex_ttl_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.mutex_ttl),
        mutex: MutexSettings {
            jitter_min,
            jitter_max,
            settle: file
                .mutex_settle_ms
                .map(Duration::from_millis)
                .unwrap_or(mutex_defaults.settle),
        },
    })
}

/// Build resolved settings from an (optional) parsed file
fn resolve(file: ConfigFile, config_file: Option<PathBuf>, default_home: PathBuf) -> Result<ResolvedConfig> {
    let home = if let Some(env_home) = non_empty_env("LEADRUN_HOME") {
        PathBuf::from(env_home)
    } else if let (Some(home_path), Some(config_path)) = (&file.paths.home, &config_file) {
        let leadrun_dir = config_path.parent().unwrap_or(Path::new("."));
        resolve_path(leadrun_dir, home_path)
    } else {
        default_home
    };

    let generator = resolve_generator(&file.generator);
    let orchestrator = resolve_orchestrator(&file.orchestrator, &generator)?;

    Ok(ResolvedConfig {
        home,
        config_file,
        generator,
        orchestrator,
        max_value_bytes: file.storage.max_value_bytes,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".leadrun");

    let config_file = find_config_file();
    let file = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    resolve(file, config_file, default_home)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the leadrun home directory
pub fn leadrun_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let leadrun_dir = temp.path().join(".leadrun");
        std::fs::create_dir_all(&leadrun_dir).unwrap();

        let config_path = leadrun_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1"
paths:
  home: ./state
generator:
  model: gpt-4.1
  api_key_env: ACME_TEST_KEY_UNSET
  timeout_seconds: 15
orchestrator:
  lock_ttl_minutes: 10
  step_delay_ms: 0
  mutex_jitter_min_ms: 50
  mutex_jitter_max_ms: 20
storage:
  max_value_bytes: 4096
"#
        )
        .unwrap();

        let parsed = load_config_file(&config_path).unwrap();
        assert_eq!(parsed.version.as_deref(), Some("1"));
        assert_eq!(parsed.generator.model.as_deref(), Some("gpt-4.1"));
        assert_eq!(parsed.orchestrator.lock_ttl_minutes, Some(10));

        let resolved = resolve(parsed, Some(config_path), PathBuf::from("/default")).unwrap();
        assert!(resolved.home.ends_with("state") || std::env::var("LEADRUN_HOME").is_ok());
        assert_eq!(resolved.generator.model, "gpt-4.1");
        assert_eq!(resolved.orchestrator.model, "gpt-4.1");
        assert_eq!(resolved.generator.api_key_env, "ACME_TEST_KEY_UNSET");
        assert!(resolved.generator.api_key.is_none());
        assert_eq!(resolved.generator.timeout, Duration::from_secs(15));
        assert_eq!(resolved.orchestrator.lock_ttl, chrono::Duration::minutes(10));
        assert!(resolved.orchestrator.step_delay.is_zero());
        assert_eq!(resolved.orchestrator.mutex.jitter_min, Duration::from_millis(50));
        assert_eq!(resolved.orchestrator.mutex.jitter_max, Duration::from_millis(50));
        assert_eq!(resolved.max_value_bytes, Some(4096));
    }

    #[test]
    fn test_defaults_without_file() {
        let resolved = resolve(ConfigFile::default(), None, PathBuf::from("/default/.leadrun")).unwrap();
        let defaults = OrchestratorSettings::default();

        if std::env::var("LEADRUN_HOME").is_err() {
            assert_eq!(resolved.home, PathBuf::from("/default/.leadrun"));
            assert_eq!(resolved.store_dir(), PathBuf::from("/default/.leadrun/store"));
        }
        assert_eq!(resolved.generator.api_key_env, DEFAULT_API_KEY_ENV);
        assert_eq!(resolved.generator.repair_model, "gpt-4o-mini");
        assert_eq!(resolved.orchestrator.lock_ttl, defaults.lock_ttl);
        assert_eq!(resolved.orchestrator.stale_after, defaults.stale_after);
        assert!(resolved.max_value_bytes.is_none());
    }

    #[test]
    fn test_invalid_spans_are_rejected() {
        for yaml in [
            "orchestrator:\n  lock_ttl_minutes: -5\n",
            "orchestrator:\n  stale_run_hours: 0\n",
            "orchestrator:\n  lock_ttl_minutes: 9223372036854775807\n",
            "orchestrator:\n  stale_run_hours: 9223372036854775807\n",
        ] {
            let parsed: ConfigFile = serde_yaml::from_str(yaml).unwrap();
            let err = resolve(parsed, None, PathBuf::from("/default")).unwrap_err();
            assert!(err.to_string().starts_with("orchestrator."), "{}", err);
        }
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
