//! Board configuration.
//!
//! Values come from an optional JSON file (path in `KDS_CONFIG`) and are then
//! overridden by `KDS_*` environment variables. Terminal credentials may be
//! given as a single connection string, the same format the POS terminal is
//! onboarded with.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::Zeroizing;

use crate::api::{
    extract_admin_url_from_connection_string, extract_api_key_from_connection_string,
    extract_tenant_id_from_connection_string, extract_terminal_id_from_connection_string,
    normalize_admin_url,
};
use crate::channel::Subscription;
use crate::error::KdsError;
use crate::logging::{default_log_dir, LogSettings};
use crate::priority::OverduePolicy;
use crate::ticket::DEFAULT_PREP_MINUTES;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_OVERDUE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_ROLE: &str = "kitchen";

/// Opaque principal presented to the push channel and the order API.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: Zeroizing<String>,
    pub terminal_id: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("terminal_id", &self.terminal_id)
            .finish()
    }
}

#[derive(Clone)]
pub struct KdsConfig {
    pub admin_url: String,
    pub api_key: Zeroizing<String>,
    pub terminal_id: Option<String>,
    pub tenant_id: String,
    pub role: String,
    pub poll_interval: Duration,
    pub overdue_sweep_interval: Duration,
    pub default_prep_minutes: i64,
    pub sound_enabled: bool,
    pub overdue_policy: OverduePolicy,
    pub log: LogSettings,
}

impl std::fmt::Debug for KdsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KdsConfig")
            .field("admin_url", &self.admin_url)
            .field("api_key", &"<redacted>")
            .field("terminal_id", &self.terminal_id)
            .field("tenant_id", &self.tenant_id)
            .field("role", &self.role)
            .field("poll_interval", &self.poll_interval)
            .field("overdue_sweep_interval", &self.overdue_sweep_interval)
            .field("default_prep_minutes", &self.default_prep_minutes)
            .field("sound_enabled", &self.sound_enabled)
            .field("overdue_policy", &self.overdue_policy)
            .field("log", &self.log)
            .finish()
    }
}

/// On-disk configuration. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ConfigFile {
    connection_string: Option<String>,
    admin_url: Option<String>,
    api_key: Option<String>,
    terminal_id: Option<String>,
    tenant_id: Option<String>,
    role: Option<String>,
    poll_interval_secs: Option<u64>,
    overdue_sweep_secs: Option<u64>,
    default_prep_minutes: Option<i64>,
    sound_enabled: Option<bool>,
    overdue_policy: Option<String>,
    log_dir: Option<PathBuf>,
    log_json: Option<bool>,
}

impl KdsConfig {
    /// Load from `KDS_CONFIG` (if set) and the process environment.
    pub fn from_env() -> Result<Self, KdsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` for environment values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, KdsError> {
        let file = match lookup("KDS_CONFIG").filter(|p| !p.trim().is_empty()) {
            Some(path) => read_config_file(Path::new(path.trim()))?,
            None => ConfigFile::default(),
        };
        Self::resolve(file, lookup)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            api_key: self.api_key.clone(),
            terminal_id: self.terminal_id.clone(),
        }
    }

    /// Push channel subscription for this board's tenant and role.
    pub fn subscription(&self) -> Subscription {
        Subscription {
            tenant_id: self.tenant_id.clone(),
            role: self.role.clone(),
            credentials: self.credentials(),
        }
    }

    fn resolve(
        mut file: ConfigFile,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, KdsError> {
        let env = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        override_with(&mut file.connection_string, env("KDS_CONNECTION_STRING"));
        override_with(&mut file.admin_url, env("KDS_ADMIN_URL"));
        override_with(&mut file.api_key, env("KDS_API_KEY"));
        override_with(&mut file.terminal_id, env("KDS_TERMINAL_ID"));
        override_with(&mut file.tenant_id, env("KDS_TENANT_ID"));
        override_with(&mut file.role, env("KDS_ROLE"));
        override_with(&mut file.overdue_policy, env("KDS_OVERDUE_POLICY"));
        override_with(&mut file.log_dir, env("KDS_LOG_DIR").map(PathBuf::from));
        override_with(&mut file.poll_interval_secs, parse_env(&env, "KDS_POLL_INTERVAL_SECS")?);
        override_with(&mut file.overdue_sweep_secs, parse_env(&env, "KDS_OVERDUE_SWEEP_SECS")?);
        override_with(
            &mut file.default_prep_minutes,
            parse_env(&env, "KDS_DEFAULT_PREP_MINUTES")?,
        );
        override_with(&mut file.sound_enabled, parse_bool_env(&env, "KDS_SOUND")?);
        override_with(&mut file.log_json, parse_bool_env(&env, "KDS_LOG_JSON")?);

        // Explicit values win over the connection string.
        if let Some(conn) = file.connection_string.as_deref() {
            file.admin_url = file
                .admin_url
                .or_else(|| extract_admin_url_from_connection_string(conn));
            file.api_key = file
                .api_key
                .or_else(|| extract_api_key_from_connection_string(conn));
            file.terminal_id = file
                .terminal_id
                .or_else(|| extract_terminal_id_from_connection_string(conn));
            file.tenant_id = file
                .tenant_id
                .or_else(|| extract_tenant_id_from_connection_string(conn));
        }

        let admin_url = file
            .admin_url
            .as_deref()
            .map(normalize_admin_url)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| KdsError::Config("admin dashboard URL is required".into()))?;

        let raw_key = Zeroizing::new(
            file.api_key
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| KdsError::Config("API key is required".into()))?,
        );
        // A pasted connection string in the key slot still yields the key.
        let api_key = Zeroizing::new(
            extract_api_key_from_connection_string(&raw_key)
                .unwrap_or_else(|| raw_key.trim().to_string()),
        );

        let tenant_id = file
            .tenant_id
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| KdsError::Config("tenant id is required".into()))?;

        let overdue_policy = match file.overdue_policy.as_deref() {
            Some(raw) => OverduePolicy::parse(raw)
                .ok_or_else(|| KdsError::Config(format!("unknown overdue policy: {raw}")))?,
            None => OverduePolicy::default(),
        };

        Ok(KdsConfig {
            admin_url,
            api_key,
            terminal_id: file.terminal_id,
            tenant_id,
            role: file.role.unwrap_or_else(|| DEFAULT_ROLE.to_string()),
            poll_interval: file
                .poll_interval_secs
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_POLL_INTERVAL),
            overdue_sweep_interval: file
                .overdue_sweep_secs
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_OVERDUE_SWEEP_INTERVAL),
            default_prep_minutes: file
                .default_prep_minutes
                .filter(|m| *m > 0)
                .unwrap_or(DEFAULT_PREP_MINUTES),
            sound_enabled: file.sound_enabled.unwrap_or(true),
            overdue_policy,
            log: LogSettings {
                dir: file.log_dir.unwrap_or_else(default_log_dir),
                json: file.log_json.unwrap_or(false),
            },
        })
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile, KdsError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| KdsError::Config(format!("read {}: {e}", path.display())))?;
    serde_json::from_str(&text)
        .map_err(|e| KdsError::Config(format!("parse {}: {e}", path.display())))
}

fn override_with<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn parse_env<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, KdsError> {
    env(key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|_| KdsError::Config(format!("{key} must be a number, got {raw:?}")))
        })
        .transpose()
}

fn parse_bool_env(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<bool>, KdsError> {
    env(key)
        .map(|raw| match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(KdsError::Config(format!("{key} must be a boolean, got {raw:?}"))),
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_explicit_values_and_defaults() {
        let config = KdsConfig::from_lookup(lookup(&[
            ("KDS_ADMIN_URL", "admin.thesmall.app/api"),
            ("KDS_API_KEY", "pos_live_key"),
            ("KDS_TENANT_ID", "branch-7"),
        ]))
        .unwrap();

        assert_eq!(config.admin_url, "https://admin.thesmall.app");
        assert_eq!(config.api_key.as_str(), "pos_live_key");
        assert_eq!(config.tenant_id, "branch-7");
        assert_eq!(config.role, "kitchen");
        assert_eq!(config.poll_interval, Duration::from_secs(15));
        assert_eq!(config.overdue_sweep_interval, Duration::from_secs(30));
        assert_eq!(config.default_prep_minutes, 15);
        assert!(config.sound_enabled);
        assert_eq!(config.overdue_policy, OverduePolicy::PreparingOnly);
    }

    #[test]
    fn test_connection_string_fills_missing_fields() {
        let json = r#"{"key":"pos_live_from_conn","url":"localhost:3001","tid":"term-2","tenantId":"branch-3"}"#;
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json);
        let config = KdsConfig::from_lookup(lookup(&[
            ("KDS_CONNECTION_STRING", encoded.as_str()),
            ("KDS_TENANT_ID", "branch-override"),
        ]))
        .unwrap();

        assert_eq!(config.admin_url, "http://localhost:3001");
        assert_eq!(config.api_key.as_str(), "pos_live_from_conn");
        assert_eq!(config.terminal_id.as_deref(), Some("term-2"));
        assert_eq!(config.tenant_id, "branch-override");
    }

    #[test]
    fn test_missing_required_fields_error() {
        let err = KdsConfig::from_lookup(lookup(&[("KDS_API_KEY", "k")])).unwrap_err();
        assert!(err.to_string().contains("admin dashboard URL"));

        let err = KdsConfig::from_lookup(lookup(&[
            ("KDS_ADMIN_URL", "admin.thesmall.app"),
            ("KDS_API_KEY", "k"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("tenant"));
    }

    #[test]
    fn test_invalid_numbers_and_flags_are_reported() {
        let base = [
            ("KDS_ADMIN_URL", "admin.thesmall.app"),
            ("KDS_API_KEY", "k"),
            ("KDS_TENANT_ID", "t"),
        ];
        let mut pairs = base.to_vec();
        pairs.push(("KDS_POLL_INTERVAL_SECS", "soon"));
        assert!(KdsConfig::from_lookup(lookup(&pairs)).is_err());

        let mut pairs = base.to_vec();
        pairs.push(("KDS_SOUND", "loud"));
        assert!(KdsConfig::from_lookup(lookup(&pairs)).is_err());

        let mut pairs = base.to_vec();
        pairs.push(("KDS_SOUND", "off"));
        pairs.push(("KDS_OVERDUE_POLICY", "any_active"));
        pairs.push(("KDS_POLL_INTERVAL_SECS", "0"));
        let config = KdsConfig::from_lookup(lookup(&pairs)).unwrap();
        assert!(!config.sound_enabled);
        assert_eq!(config.overdue_policy, OverduePolicy::AnyActive);
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
    }

    #[test]
    fn test_config_file_with_env_override() {
        let path = std::env::temp_dir().join(format!("kds-config-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"{"adminUrl":"https://admin.example","apiKey":"file-key","tenantId":"file-tenant","pollIntervalSecs":5,"role":"bar"}"#,
        )
        .unwrap();
        let path_str = path.to_string_lossy().to_string();

        let config = KdsConfig::from_lookup(lookup(&[
            ("KDS_CONFIG", path_str.as_str()),
            ("KDS_API_KEY", "env-key"),
        ]))
        .unwrap();
        assert_eq!(config.api_key.as_str(), "env-key");
        assert_eq!(config.tenant_id, "file-tenant");
        assert_eq!(config.role, "bar");
        assert_eq!(config.poll_interval, Duration::from_secs(5));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let config = KdsConfig::from_lookup(lookup(&[
            ("KDS_ADMIN_URL", "admin.thesmall.app"),
            ("KDS_API_KEY", "super-secret"),
            ("KDS_TENANT_ID", "t"),
        ]))
        .unwrap();
        let rendered = format!("{config:?} {:?}", config.credentials());
        assert!(!rendered.contains("super-secret"));
    }

    #[test]
    #[serial]
    fn test_from_env_reads_process_environment() {
        std::env::set_var("KDS_ADMIN_URL", "admin.thesmall.app");
        std::env::set_var("KDS_API_KEY", "env-process-key");
        std::env::set_var("KDS_TENANT_ID", "branch-env");
        std::env::remove_var("KDS_CONFIG");
        std::env::remove_var("KDS_CONNECTION_STRING");

        let config = KdsConfig::from_env();

        std::env::remove_var("KDS_ADMIN_URL");
        std::env::remove_var("KDS_API_KEY");
        std::env::remove_var("KDS_TENANT_ID");

        let config = config.unwrap();
        assert_eq!(config.api_key.as_str(), "env-process-key");
        assert_eq!(config.tenant_id, "branch-env");
    }
}
