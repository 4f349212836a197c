use crate::error::AppError;
use crate::fetch::{DEFAULT_PACING_DELAY, DEFAULT_PACING_EVERY};
use crate::providers::{CloudProvider, Operation};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const SERVICE_NAME: &str = "costpilot";
const ENV_PREFIX: &str = "COSTPILOT";

fn app_home_dir() -> Result<PathBuf, AppError> {
    if let Ok(custom) = std::env::var("COSTPILOT_HOME") {
        return Ok(PathBuf::from(custom));
    }

    if let Some(dirs) = ProjectDirs::from("com", "costpilot", SERVICE_NAME) {
        let candidate = dirs.data_local_dir().to_path_buf();
        if fs::create_dir_all(&candidate).is_ok() {
            return Ok(candidate);
        }
    }

    let cwd = std::env::current_dir()?;
    Ok(cwd.join(".costpilot"))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accounts: Vec<CloudAccount>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rate_limits: Vec<RateLimitRule>,
    #[serde(default)]
    pub fetch: FetchSettings,
}

/// One cloud account. The secret key never lives in the file; see
/// [`get_secret_key`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudAccount {
    #[serde(default)]
    pub name: String,
    pub provider: CloudProvider,
    pub access_key: String,
    #[serde(default)]
    pub region_id: String,
    pub endpoint: Option<String>,
    pub fixture: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub provider: CloudProvider,
    pub operation: Operation,
    pub per_second: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchSettings {
    #[serde(default = "default_pacing_every")]
    pub pacing_every: usize,
    #[serde(default = "default_pacing_delay_ms")]
    pub pacing_delay_ms: u64,
}

fn default_pacing_every() -> usize {
    DEFAULT_PACING_EVERY
}

fn default_pacing_delay_ms() -> u64 {
    DEFAULT_PACING_DELAY.as_millis() as u64
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            pacing_every: default_pacing_every(),
            pacing_delay_ms: default_pacing_delay_ms(),
        }
    }
}

impl FetchSettings {
    pub fn pacing_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.pacing_delay_ms)
    }
}

pub fn config_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("config"))
}

pub fn data_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("data"))
}

pub fn config_path() -> Result<PathBuf, AppError> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn ensure_dirs() -> Result<(), AppError> {
    fs::create_dir_all(config_dir()?)?;
    fs::create_dir_all(data_dir()?)?;
    Ok(())
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// A single account described by `COSTPILOT_PROVIDER`, `COSTPILOT_AK` and
/// friends. Both the provider and the access key must be set.
fn env_account() -> Result<Option<CloudAccount>, AppError> {
    let (Some(provider), Some(access_key)) = (
        non_empty_env("COSTPILOT_PROVIDER"),
        non_empty_env("COSTPILOT_AK"),
    ) else {
        return Ok(None);
    };
    Ok(Some(CloudAccount {
        name: non_empty_env("COSTPILOT_ACCOUNT_NAME").unwrap_or_default(),
        provider: provider.parse()?,
        access_key,
        region_id: non_empty_env("COSTPILOT_REGION_ID").unwrap_or_default(),
        endpoint: non_empty_env("COSTPILOT_ENDPOINT"),
        fixture: non_empty_env("COSTPILOT_FIXTURE").map(PathBuf::from),
    }))
}

fn normalize_config(config: &mut AppConfig) -> bool {
    let mut changed = false;

    let mut accounts: Vec<CloudAccount> = Vec::new();
    for mut account in std::mem::take(&mut config.accounts) {
        let trimmed = account.name.trim();
        let name = if trimmed.is_empty() {
            account.access_key.trim().to_string()
        } else {
            trimmed.to_string()
        };
        if name != account.name {
            account.name = name;
            changed = true;
        }
        if accounts.iter().any(|a| a.name == account.name) {
            changed = true;
            continue;
        }
        accounts.push(account);
    }
    config.accounts = accounts;

    changed
}

/// Reads `config.toml` (when present) with `COSTPILOT__SECTION__KEY`
/// environment overrides on top. An account from the plain `COSTPILOT_*`
/// variables replaces the configured ones.
pub fn load_config() -> Result<AppConfig, AppError> {
    let path = config_path()?;
    let settings = ::config::Config::builder()
        .add_source(
            ::config::File::from(path.as_path())
                .format(::config::FileFormat::Toml)
                .required(false),
        )
        .add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    let mut parsed: AppConfig = settings.try_deserialize()?;

    if let Some(account) = env_account()? {
        debug!(provider = %account.provider, "using account from environment");
        parsed.accounts = vec![account];
    }
    if normalize_config(&mut parsed) {
        debug!(accounts = parsed.accounts.len(), "normalized account list");
    }
    Ok(parsed)
}

/// The file alone, without environment overrides. Used when editing.
pub fn load_config_file() -> Result<AppConfig, AppError> {
    let path = config_path()?;
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let raw = fs::read_to_string(&path)?;
    let mut parsed: AppConfig = toml::from_str(&raw)?;
    normalize_config(&mut parsed);
    Ok(parsed)
}

pub fn save_config(config: &AppConfig) -> Result<(), AppError> {
    ensure_dirs()?;
    let path = config_path()?;
    let raw = toml::to_string_pretty(config)?;
    fs::write(path, raw)?;
    Ok(())
}

/// Adds `account`, replacing any account of the same name.
pub fn upsert_account(config: &mut AppConfig, account: CloudAccount) {
    match config.accounts.iter_mut().find(|a| a.name == account.name) {
        Some(existing) => *existing = account,
        None => config.accounts.push(account),
    }
}

fn secret_entry(account: &str) -> Result<keyring::Entry, AppError> {
    Ok(keyring::Entry::new(SERVICE_NAME, &format!("account:{account}"))?)
}

pub fn set_secret_key(account: &str, key: &str) -> Result<(), AppError> {
    secret_entry(account)?.set_password(key)?;
    Ok(())
}

fn secret_env_name(account: &str) -> String {
    let upper: String = account
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("COSTPILOT_{upper}_SECRET_KEY")
}

pub fn get_secret_key(account: &CloudAccount) -> Result<String, AppError> {
    if let Ok(value) = secret_entry(&account.name)?.get_password() {
        if !value.is_empty() {
            return Ok(value);
        }
    }

    if let Some(value) = non_empty_env(&secret_env_name(&account.name)) {
        return Ok(value);
    }

    if non_empty_env("COSTPILOT_AK").as_deref() == Some(account.access_key.as_str()) {
        if let Some(value) = non_empty_env("COSTPILOT_SK") {
            return Ok(value);
        }
    }

    Err(AppError::Config(format!(
        "No secret key found for account '{}'. Run add-account with --secret-key or set {}.",
        account.name,
        secret_env_name(&account.name)
    )))
}

pub fn ensure_initialized() -> Result<(), AppError> {
    ensure_dirs()?;
    let cfg_path = config_path()?;
    if !Path::new(&cfg_path).exists() {
        save_config(&AppConfig::default())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(name: &str, access_key: &str) -> CloudAccount {
        CloudAccount {
            name: name.into(),
            provider: CloudProvider::Alibaba,
            access_key: access_key.into(),
            region_id: "cn-hangzhou".into(),
            endpoint: None,
            fixture: None,
        }
    }

    #[test]
    fn normalize_config_trims_defaults_and_dedupes() {
        let mut cfg = AppConfig {
            accounts: vec![
                account(" prod ", "AK1"),
                account("prod", "AK2"),
                account("", " AK3 "),
            ],
            ..AppConfig::default()
        };

        let changed = normalize_config(&mut cfg);
        assert!(changed);
        let names: Vec<&str> = cfg.accounts.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["prod", "AK3"]);
        assert_eq!(cfg.accounts[0].access_key, "AK1");
        assert!(!normalize_config(&mut cfg));
    }

    #[test]
    fn config_round_trips_through_toml() {
        let cfg = AppConfig {
            accounts: vec![account("prod", "AK1")],
            rate_limits: vec![RateLimitRule {
                provider: CloudProvider::Baidu,
                operation: Operation::DescribeMetricList,
                per_second: 5,
            }],
            fetch: FetchSettings {
                pacing_every: 4,
                pacing_delay_ms: 50,
            },
        };
        let raw = toml::to_string_pretty(&cfg).expect("serialize");
        assert!(raw.contains("provider = \"AlibabaCloud\""));
        let back: AppConfig = toml::from_str(&raw).expect("parse");
        assert_eq!(back, cfg);
    }

    #[test]
    fn missing_sections_take_defaults() {
        let cfg: AppConfig = toml::from_str("").expect("parse");
        assert!(cfg.accounts.is_empty());
        assert_eq!(cfg.fetch, FetchSettings::default());
        assert_eq!(cfg.fetch.pacing_delay(), DEFAULT_PACING_DELAY);
    }

    #[test]
    fn upsert_replaces_accounts_by_name() {
        let mut cfg = AppConfig::default();
        upsert_account(&mut cfg, account("prod", "AK1"));
        upsert_account(&mut cfg, account("prod", "AK2"));
        upsert_account(&mut cfg, account("dev", "AK3"));
        assert_eq!(cfg.accounts.len(), 2);
        assert_eq!(cfg.accounts[0].access_key, "AK2");
    }

    #[test]
    fn secret_env_names_are_shell_safe() {
        assert_eq!(secret_env_name("prod-cn"), "COSTPILOT_PROD_CN_SECRET_KEY");
    }
}
