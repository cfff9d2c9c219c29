use anyhow::{Context, Result, anyhow};
use dotenvy::dotenv;
use keyring::Entry;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use resumable_upload::{ClientConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, time::Duration};
use url::Url;

pub const KEYRING_SERVICE: &str = "rupload-token";
pub const KEYRING_USER: &str = "rupload";

#[derive(Debug, Deserialize, Serialize, Default)]
pub struct ConfigFile {
    pub endpoint: Option<Url>,
    pub chunk_size: Option<u64>,
    /// Per-request timeout, e.g. `"30s"`.
    pub request_timeout: Option<String>,
    pub max_attempts: Option<u32>,
    /// Longest pause between retries, e.g. `"15s"`.
    pub max_retry_delay: Option<String>,
}

/// Read from `RUPLOAD_*` environment variables.
#[derive(Debug, Deserialize, Default)]
struct ConfigEnv {
    endpoint: Option<Url>,
    chunk_size: Option<u64>,
    request_timeout: Option<String>,
    max_attempts: Option<u32>,
    max_retry_delay: Option<String>,
    token: Option<String>,
}

pub struct Config {
    pub endpoint: Option<Url>,
    pub token: Option<String>,
    pub client: ClientConfig,
}

fn parse_duration(name: &str, value: Option<String>) -> Result<Option<Duration>> {
    value
        .map(|v| humantime::parse_duration(&v).with_context(|| format!("Invalid {name}: {v}")))
        .transpose()
}

fn merge_config(
    base: ConfigFile,
    override_config: ConfigEnv,
    keyring_token: impl FnOnce() -> Option<String>,
) -> Result<Config> {
    let endpoint = override_config.endpoint.or(base.endpoint);
    let token = override_config.token.or_else(keyring_token);

    let mut client = ClientConfig::default();
    if let Some(chunk_size) = override_config.chunk_size.or(base.chunk_size) {
        client.chunk_size = chunk_size;
    }
    client.request_timeout = parse_duration(
        "request_timeout",
        override_config.request_timeout.or(base.request_timeout),
    )?;

    let mut retry = RetryPolicy::default();
    if let Some(max_attempts) = override_config.max_attempts.or(base.max_attempts) {
        retry.max_attempts = max_attempts.max(1);
    }
    if let Some(max_delay) = parse_duration(
        "max_retry_delay",
        override_config.max_retry_delay.or(base.max_retry_delay),
    )? {
        retry.max_delay = max_delay;
    }
    client.retry = retry;

    if let Some(token) = &token {
        let mut headers = HeaderMap::new();
        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
            .context("Token contains characters not allowed in a header")?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
        client.default_headers = headers;
    }

    Ok(Config {
        endpoint,
        token,
        client,
    })
}

fn config_file_path() -> Result<PathBuf> {
    let project_dirs = directories::ProjectDirs::from("dev", "rupload", "rupload")
        .ok_or(anyhow!("Unable to determine home directory"))?;
    Ok(project_dirs.config_dir().join("config.toml"))
}

fn keyring_token() -> Option<String> {
    let entry = Entry::new(KEYRING_SERVICE, KEYRING_USER).ok()?;
    let secret = entry.get_secret().ok()?;
    String::from_utf8(secret).ok()
}

pub fn read_config() -> Result<Config> {
    let _ = dotenv();
    let env_config = envy::prefixed("RUPLOAD_")
        .from_env::<ConfigEnv>()
        .context("Invalid RUPLOAD_* environment variable")?;

    let file_config = if let Ok(config) = fs::read_to_string(config_file_path()?) {
        toml::from_str(&config).context("Invalid config file")?
    } else {
        ConfigFile::default()
    };

    merge_config(file_config, env_config, keyring_token)
}

pub fn write_config(config: ConfigFile) -> Result<()> {
    let path = config_file_path()?;
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    fs::write(&path, toml::to_string(&config)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

pub fn set_token_keyring(token: String) -> Result<()> {
    let entry = Entry::new(KEYRING_SERVICE, KEYRING_USER)?;
    entry.set_secret(token.as_bytes())?;
    println!("Token stored for use with rupload");
    Ok(())
}
