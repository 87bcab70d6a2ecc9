//! Builder configuration.
//!
//! Loaded from TOML. Every key is optional; defaults reproduce the
//! timeouts and tool names the pipelines have always used.
//!
//! ```toml
//! make = "make"
//! build_user = "kbuild"
//! sandbox = "auto"
//! staging_root = "/var/tmp"
//!
//! [timeouts]
//! compile_secs = 10800
//! ```

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

const CONFIG_DIR_NAME: &str = "kernel-image-builder";
const CONFIG_FILE_NAME: &str = "config.toml";

/// When sandboxed build steps drop privileges and confine the filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    /// Sandbox when running as root and the build user exists.
    #[default]
    Auto,
    /// Sandbox or fail.
    Enforce,
    /// Run build steps with the caller's own credentials.
    Off,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    pub resolve_defaults_secs: u64,
    pub compile_secs: u64,
    pub clean_secs: u64,
    pub image_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            resolve_defaults_secs: 10 * 60,
            // A large kernel can take hours on a 1 CPU VM.
            compile_secs: 3 * 60 * 60,
            clean_secs: 10 * 60,
            image_secs: 60 * 60,
        }
    }
}

impl Timeouts {
    pub fn resolve_defaults(&self) -> Duration {
        Duration::from_secs(self.resolve_defaults_secs)
    }

    pub fn compile(&self) -> Duration {
        Duration::from_secs(self.compile_secs)
    }

    pub fn clean(&self) -> Duration {
        Duration::from_secs(self.clean_secs)
    }

    pub fn image(&self) -> Duration {
        Duration::from_secs(self.image_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuilderConfig {
    /// Build tool invoked for config resolution, compilation and clean.
    pub make: String,
    /// Unprivileged account sandboxed steps run as.
    pub build_user: String,
    pub sandbox: SandboxMode,
    /// Parent directory for image staging directories. Defaults to the
    /// system temp dir.
    pub staging_root: Option<PathBuf>,
    /// Parallelism hint passed to the build tool. Defaults to the number of
    /// available CPUs.
    pub jobs: Option<usize>,
    pub timeouts: Timeouts,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            make: "make".to_string(),
            build_user: "kbuild".to_string(),
            sandbox: SandboxMode::Auto,
            staging_root: None,
            jobs: None,
            timeouts: Timeouts::default(),
        }
    }
}

impl BuilderConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: BuilderConfig =
            toml::from_str(text).map_err(|e| Error::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or from the per-user default location.
    ///
    /// An explicit path must exist. A missing default file yields the
    /// defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match default_config_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        if !required && !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let text = fs::read_to_string(&path)
            .map_err(|e| Error::io_at("reading config", &path, e))?;
        Self::from_toml(&text).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("{} ({})", msg, path.display())),
            other => other,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.make.trim().is_empty() {
            return Err(Error::Config("config: 'make' must not be empty".into()));
        }
        if self.build_user.trim().is_empty() {
            return Err(Error::Config("config: 'build_user' must not be empty".into()));
        }
        if self.jobs == Some(0) {
            return Err(Error::Config("config: 'jobs' must be at least 1".into()));
        }
        let t = &self.timeouts;
        if [
            t.resolve_defaults_secs,
            t.compile_secs,
            t.clean_secs,
            t.image_secs,
        ]
        .contains(&0)
        {
            return Err(Error::Config("config: timeouts must be non-zero".into()));
        }
        Ok(())
    }

    /// Parallelism hint for the build tool.
    pub fn jobs(&self) -> usize {
        if let Some(jobs) = self.jobs {
            return jobs;
        }
        match std::thread::available_parallelism() {
            Ok(n) => n.get(),
            Err(e) => {
                tracing::warn!("could not detect CPU count ({}), using 1 job", e);
                1
            }
        }
    }

    /// Directory image staging directories are created in.
    pub fn staging_root(&self) -> PathBuf {
        self.staging_root
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

/// `$XDG_CONFIG_HOME/kernel-image-builder/config.toml`, when a config dir is known.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_default() {
        let config = BuilderConfig::from_toml("").unwrap();
        assert_eq!(config, BuilderConfig::default());
        assert_eq!(config.timeouts.compile(), Duration::from_secs(3 * 60 * 60));
        assert_eq!(config.timeouts.resolve_defaults(), Duration::from_secs(600));
        assert_eq!(config.sandbox, SandboxMode::Auto);
    }

    #[test]
    fn test_partial_config() {
        let config = BuilderConfig::from_toml(
            "make = \"gmake\"\nsandbox = \"off\"\njobs = 3\n\n[timeouts]\nclean_secs = 30\n",
        )
        .unwrap();
        assert_eq!(config.make, "gmake");
        assert_eq!(config.sandbox, SandboxMode::Off);
        assert_eq!(config.jobs(), 3);
        assert_eq!(config.timeouts.clean(), Duration::from_secs(30));
        assert_eq!(config.timeouts.image_secs, 3600);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = BuilderConfig::from_toml("mkae = \"make\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_bad_sandbox_mode_rejected() {
        assert!(BuilderConfig::from_toml("sandbox = \"sometimes\"\n").is_err());
    }

    #[test]
    fn test_zero_values_rejected() {
        assert!(BuilderConfig::from_toml("jobs = 0\n").is_err());
        assert!(BuilderConfig::from_toml("[timeouts]\ncompile_secs = 0\n").is_err());
    }

    #[test]
    fn test_load_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "build_user = \"builder\"\n").unwrap();

        let config = BuilderConfig::load(Some(&path)).unwrap();
        assert_eq!(config.build_user, "builder");
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = BuilderConfig::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn test_jobs_defaults_to_cpus() {
        assert!(BuilderConfig::default().jobs() >= 1);
    }
}
