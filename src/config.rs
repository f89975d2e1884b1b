//! Configuration loading.
//!
//! Settings live in `~/.nailbliss/config.toml`. A missing file means
//! defaults. `SUPABASE_URL` and `SUPABASE_ANON_KEY` in the environment take
//! precedence over the file so deployments can inject credentials without
//! writing them to disk.

use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the per-user state directory under `$HOME`.
const APP_DIR_NAME: &str = ".nailbliss";

// ── Sections ─────────────────────────────────────────────────────

/// Supabase project connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SupabaseConfig {
    /// Supabase project URL (e.g., https://xxxx.supabase.co).
    pub url: String,
    /// Public anon key. Row-level security applies to every request.
    pub anon_key: String,
}

impl SupabaseConfig {
    /// Load from environment variables.
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("SUPABASE_URL").ok()?;
        let anon_key = std::env::var("SUPABASE_ANON_KEY").ok()?;

        if url.is_empty() || anon_key.is_empty() {
            return None;
        }

        Some(Self { url, anon_key })
    }

    pub fn is_configured(&self) -> bool {
        !self.url.trim().is_empty() && !self.anon_key.trim().is_empty()
    }
}

/// Bounds and retry budget for the auth bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Budget for restoring the persisted session.
    pub session_timeout_secs: u64,
    /// Budget for each profile fetch.
    pub profile_timeout_secs: u64,
    /// Delay before the single retry of a "profile not found" result.
    pub profile_retry_delay_ms: u64,
    /// How many explicit retries are allowed before a forced reset.
    pub max_retries: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: 10,
            profile_timeout_secs: 5,
            profile_retry_delay_ms: 1_000,
            max_retries: 1,
        }
    }
}

impl AuthConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn profile_timeout(&self) -> Duration {
        Duration::from_secs(self.profile_timeout_secs)
    }

    pub fn profile_retry_delay(&self) -> Duration {
        Duration::from_millis(self.profile_retry_delay_ms)
    }
}

/// QR token settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QrConfig {
    /// Validity window of a token, and its regeneration period.
    pub window_secs: u64,
    /// When set, tokens are signed with HMAC-SHA256 under this secret.
    pub signing_secret: Option<String>,
}

impl Default for QrConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            signing_secret: None,
        }
    }
}

// ── Root config ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub supabase: SupabaseConfig,
    pub auth: AuthConfig,
    pub qr: QrConfig,
    /// Where the remembered preference and persisted session are kept.
    /// Defaults to the directory holding `config.toml`.
    pub data_dir: Option<PathBuf>,

    /// Path the config was loaded from. Not serialized.
    #[serde(skip)]
    pub config_path: PathBuf,
}

impl Config {
    /// Default location: `~/.nailbliss/config.toml`.
    pub fn default_path() -> Result<PathBuf> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .context("Could not find home directory")?;
        Ok(home.join(APP_DIR_NAME).join("config.toml"))
    }

    /// Load from `path`, falling back to defaults when the file is absent,
    /// then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            toml::from_str::<Config>(&contents)
                .with_context(|| format!("Failed to parse config {}", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Config::default()
        };
        config.config_path = path.to_path_buf();

        if let Some(env) = SupabaseConfig::from_env() {
            config.supabase = env;
        }

        config.validate()?;
        Ok(config)
    }

    /// Directory for durable client state.
    pub fn data_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.data_dir {
            return dir.clone();
        }
        self.config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(APP_DIR_NAME))
    }

    pub fn qr_window(&self) -> Duration {
        Duration::from_secs(self.qr.window_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.qr.window_secs == 0 {
            anyhow::bail!("qr.window_secs must be greater than zero");
        }
        if self.auth.session_timeout_secs == 0 || self.auth.profile_timeout_secs == 0 {
            anyhow::bail!("auth timeouts must be greater than zero");
        }
        if let Some(ref secret) = self.qr.signing_secret {
            if secret.trim().is_empty() {
                anyhow::bail!("qr.signing_secret cannot be empty when set");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_bootstrap_budget() {
        let config = Config::default();
        assert_eq!(config.auth.session_timeout(), Duration::from_secs(10));
        assert_eq!(config.auth.profile_timeout(), Duration::from_secs(5));
        assert_eq!(config.auth.profile_retry_delay(), Duration::from_secs(1));
        assert_eq!(config.auth.max_retries, 1);
        assert_eq!(config.qr_window(), Duration::from_secs(60));
        assert!(config.qr.signing_secret.is_none());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.auth.max_retries, 1);
        assert_eq!(config.data_dir(), tmp.path());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "[auth]\nmax_retries = 3\n\n[qr]\nsigning_secret = \"s3cret\"\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.auth.max_retries, 3);
        assert_eq!(config.auth.session_timeout_secs, 10);
        assert_eq!(config.qr.window_secs, 60);
        assert_eq!(config.qr.signing_secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn explicit_data_dir_wins() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "data_dir = \"/var/lib/nailbliss\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.data_dir(), PathBuf::from("/var/lib/nailbliss"));
    }

    #[test]
    fn zero_window_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[qr]\nwindow_secs = 0\n").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("window_secs"));
    }

    #[test]
    fn malformed_file_reports_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[auth\n").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn supabase_configured_check() {
        let cfg = SupabaseConfig {
            url: "https://test-project.supabase.co".into(),
            anon_key: "anon".into(),
        };
        assert!(cfg.is_configured());
        assert!(!SupabaseConfig::default().is_configured());
    }
}
