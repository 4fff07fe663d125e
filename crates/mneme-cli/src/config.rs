//! Configuration Vault – reads/writes `~/.mneme/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use mneme_kernel::{RateLimitConfig, SecurityConfig};
use mneme_memory::MemoryConfig;
use mneme_runtime::embedder::{DEFAULT_BASE_URL, DEFAULT_MODEL};
use serde::{Deserialize, Serialize};

/// Where embeddings come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedderKind {
    /// Offline feature hashing; no server needed.
    #[default]
    Hashing,
    Ollama,
}

impl std::fmt::Display for EmbedderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmbedderKind::Hashing => write!(f, "hashing"),
            EmbedderKind::Ollama => write!(f, "ollama"),
        }
    }
}

/// Persisted user configuration stored in `~/.mneme/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub embedder: EmbedderKind,

    /// Base URL of the Ollama instance.
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,

    /// Embedding model served by Ollama (e.g. "all-minilm", "nomic-embed-text").
    #[serde(default = "default_embed_model")]
    pub embed_model: String,

    /// JSON-lines audit trail. Defaults to `~/.mneme/audit.jsonl`.
    #[serde(default = "default_audit_log", skip_serializing_if = "Option::is_none")]
    pub audit_log: Option<PathBuf>,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Engine settings, straight into [`MemoryConfig`].
    #[serde(default = "default_memory")]
    pub memory: MemoryConfig,
}

fn default_ollama_url() -> String {
    DEFAULT_BASE_URL.to_string()
}
fn default_embed_model() -> String {
    DEFAULT_MODEL.to_string()
}
fn default_audit_log() -> Option<PathBuf> {
    Some(mneme_home().join("audit.jsonl"))
}
fn default_memory() -> MemoryConfig {
    let mut memory = MemoryConfig::default();
    memory.storage.path = Some(mneme_home().join("memory.db"));
    memory
}

impl Default for Config {
    fn default() -> Self {
        Self {
            embedder: EmbedderKind::default(),
            ollama_url: default_ollama_url(),
            embed_model: default_embed_model(),
            audit_log: default_audit_log(),
            security: SecurityConfig::default(),
            rate_limit: RateLimitConfig::default(),
            memory: default_memory(),
        }
    }
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

/// `~/.mneme`
pub fn mneme_home() -> PathBuf {
    mneme_home_for(&home_dir())
}

pub(crate) fn mneme_home_for(home: &str) -> PathBuf {
    PathBuf::from(home).join(".mneme")
}

/// Return the path to `~/.mneme/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    mneme_home_for(home).join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    validate(&cfg)?;
    Ok(Some(cfg))
}

/// Apply `MNEME_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `MNEME_STORAGE_PATH` | `memory.storage.path` (`:memory:` for an in-memory store) |
/// | `MNEME_OLLAMA_URL` | `ollama_url` |
/// | `MNEME_EMBED_MODEL` | `embed_model` |
/// | `MNEME_DIMENSION` | `memory.storage.dimension` |
/// | `MNEME_QUOTA_MB` | `memory.storage.max_size_mb` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("MNEME_STORAGE_PATH") {
        cfg.memory.storage.path = match v.as_str() {
            ":memory:" => None,
            path => Some(PathBuf::from(path)),
        };
    }
    if let Ok(v) = std::env::var("MNEME_OLLAMA_URL") {
        cfg.ollama_url = v;
    }
    if let Ok(v) = std::env::var("MNEME_EMBED_MODEL") {
        cfg.embed_model = v;
    }
    if let Ok(v) = std::env::var("MNEME_DIMENSION")
        && let Ok(dim) = v.parse::<usize>()
    {
        cfg.memory.storage.dimension = dim;
    }
    if let Ok(v) = std::env::var("MNEME_QUOTA_MB")
        && let Ok(mb) = v.parse::<u64>()
    {
        cfg.memory.storage.max_size_mb = mb;
    }
}

/// Reject settings the engine cannot run with.
pub fn validate(cfg: &Config) -> Result<(), String> {
    let storage = &cfg.memory.storage;
    if storage.dimension == 0 {
        return Err("memory.storage.dimension must be greater than 0".into());
    }
    if storage.max_size_mb == 0 {
        return Err("memory.storage.max_size_mb must be greater than 0".into());
    }
    if !(0.0..=100.0).contains(&storage.warning_percent) || storage.warning_percent == 0.0 {
        return Err("memory.storage.warning_percent must be within (0, 100]".into());
    }
    if storage.cleanup_target_percent <= 0.0
        || storage.cleanup_target_percent >= storage.warning_percent
    {
        return Err(
            "memory.storage.cleanup_target_percent must be above 0 and below warning_percent"
                .into(),
        );
    }
    cfg.memory
        .retention
        .validate()
        .map_err(|e| format!("memory.retention: {e}"))?;
    if cfg.embedder == EmbedderKind::Ollama && cfg.embed_model.trim().is_empty() {
        return Err("embed_model must be set when embedder = \"ollama\"".into());
    }
    Ok(())
}

/// Save the config to disk, creating `~/.mneme/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    validate(cfg)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Owner only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    // Owner-only read/write (rw-------) on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
