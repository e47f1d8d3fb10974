//! Layered configuration loading.
//!
//! Precedence, lowest to highest:
//! 1. Built-in defaults.
//! 2. A configuration file: either the explicit path given by the caller, or
//!    `reel.toml` in the platform configuration directory if it exists.
//! 3. Environment variables prefixed with `REEL_`, using `__` to descend into
//!    sections (`REEL_STORAGE__INPUT_DIR=/srv/reel`).

use crate::error::{ErrorKind, Result};
use crate::model::{Config, ToolsConfig};
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "REEL_";
const DEFAULT_FILE_NAME: &str = "reel.toml";

impl Config {
    /// Load the configuration from defaults, an optional file, and the environment, then validate it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        match path {
            Some(path) => {
                if !path.is_file() {
                    exn::bail!(ErrorKind::NotFound(path.to_path_buf()));
                }
                figment = merge_file(figment, path);
            },
            None => {
                if let Some(path) = default_path().filter(|path| path.is_file()) {
                    tracing::debug!(path = %path.display(), "using configuration file from config directory");
                    figment = merge_file(figment, &path);
                }
            },
        }
        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the cross-section constraints that serde can't express.
    pub fn validate(&self) -> Result<()> {
        if self.storage.container_threshold == 0 {
            exn::bail!(ErrorKind::invalid("storage.container_threshold"));
        }
        if self.storage.read_cache_capacity == 0 {
            exn::bail!(ErrorKind::invalid("storage.read_cache_capacity"));
        }
        if self.tools.block_size == 0 {
            exn::bail!(ErrorKind::invalid("tools.block_size"));
        }
        if self.listener.max_attempts == 0 {
            exn::bail!(ErrorKind::invalid("listener.max_attempts"));
        }
        let mut indices = HashSet::new();
        for drive in &self.library.drives {
            if !indices.insert(drive.index) {
                exn::bail!(ErrorKind::invalid(format!("library.drives[{}]", drive.index)));
            }
        }
        if !self.library.drives.is_empty() && self.library.robots.is_empty() {
            exn::bail!(ErrorKind::invalid("library.robots"));
        }
        let mut labels = HashSet::new();
        for (name, bucket) in &self.buckets {
            if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
                exn::bail!(ErrorKind::invalid(format!("buckets.{name}")));
            }
            if !indices.contains(&bucket.drive) {
                exn::bail!(ErrorKind::invalid(format!("buckets.{name}.drive")));
            }
            if bucket.tapes.is_empty() {
                exn::bail!(ErrorKind::invalid(format!("buckets.{name}.tapes")));
            }
            // A cartridge can only ever belong to one bucket.
            for label in &bucket.tapes {
                if !labels.insert(label.as_str()) {
                    exn::bail!(ErrorKind::invalid(format!("buckets.{name}.tapes.{label}")));
                }
            }
        }
        Ok(())
    }
}

impl ToolsConfig {
    /// Resolve bare executable names against `PATH`.
    ///
    /// Paths with more than one component are taken as-is; this is only meant
    /// to be called when the real hardware tools are going to be used.
    pub fn resolved(&self) -> Result<Self> {
        Ok(Self {
            mt: resolve_executable(&self.mt)?,
            mtx: resolve_executable(&self.mtx)?,
            dd: resolve_executable(&self.dd)?,
            ..self.clone()
        })
    }
}

fn resolve_executable(path: &Path) -> Result<PathBuf> {
    if path.components().count() > 1 {
        return Ok(path.to_path_buf());
    }
    match which::which(path) {
        Ok(resolved) => {
            tracing::trace!(executable = %resolved.display(), "resolved external tool");
            Ok(resolved)
        },
        Err(_) => exn::bail!(ErrorKind::ExecutableNotFound(path.display().to_string())),
    }
}

fn merge_file(figment: Figment, path: &Path) -> Figment {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
        Some("json") => figment.merge(Json::file(path)),
        _ => figment.merge(Toml::file(path)),
    }
}

/// `reel.toml` inside the platform-specific configuration directory.
pub fn default_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "reel").map(|dirs| dirs.config_dir().join(DEFAULT_FILE_NAME))
}
