use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::Deserialize;
use tessera_ai::{ClientConfig, ProviderSettings, RetryPolicy, TimeoutConfig};

use crate::paths::TesseraPaths;

const DEFAULT_PROVIDER: &str = "openai";
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, PartialEq)]
pub struct CliConfig {
    pub provider: ProviderSettings,
    pub model: Option<String>,
    pub client: ClientConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub file_path: PathBuf,
    pub level: String,
    pub stdout: bool,
}

#[derive(Debug, Deserialize, Default)]
struct TesseraTomlFile {
    #[serde(default)]
    provider: TesseraTomlProvider,
    #[serde(default)]
    timeout: TimeoutConfig,
    #[serde(default)]
    retry: RetryPolicy,
    #[serde(default)]
    log: TesseraTomlLog,
    #[serde(default)]
    env: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Default)]
struct TesseraTomlProvider {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    api_key_env: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Default)]
struct TesseraTomlLog {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    stdout: Option<bool>,
}

/// Load `tessera.toml` from the resolved home. A missing file yields the defaults.
pub fn load_cli_config(paths: &TesseraPaths) -> Result<CliConfig, String> {
    let path = paths.config_file();
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(error) => return Err(format!("read {} failed: {error}", path.display())),
    };
    parse_cli_config(&content, paths, |key| std::env::var(key).ok())
}

pub(crate) fn parse_cli_config<F>(
    content: &str,
    paths: &TesseraPaths,
    process_env: F,
) -> Result<CliConfig, String>
where
    F: Fn(&str) -> Option<String>,
{
    let parsed: TesseraTomlFile =
        toml::from_str(content).map_err(|error| format!("parse tessera.toml failed: {error}"))?;

    let provider_id = non_empty(parsed.provider.id.as_deref())
        .unwrap_or(DEFAULT_PROVIDER)
        .to_string();
    let api_key = match parsed.provider.api_key.as_deref() {
        Some(value) => resolve_config_value(value, &parsed.env, &process_env),
        None => non_empty(parsed.provider.api_key_env.as_deref())
            .or_else(|| default_key_env(&provider_id))
            .and_then(|key| resolve_env_key(key, &parsed.env, &process_env)),
    };
    let base_url = parsed
        .provider
        .base_url
        .as_deref()
        .and_then(|value| resolve_config_value(value, &parsed.env, &process_env));
    let mut headers = BTreeMap::new();
    for (name, value) in &parsed.provider.headers {
        if let Some(value) = resolve_config_value(value, &parsed.env, &process_env) {
            headers.insert(name.clone(), value);
        }
    }

    let client = ClientConfig {
        timeout: parsed.timeout,
        retry: parsed.retry,
    };
    client.validate().map_err(|error| error.to_string())?;

    let file_path = paths.log_file(parsed.log.path.as_deref());

    Ok(CliConfig {
        provider: ProviderSettings {
            provider: provider_id,
            api_key,
            base_url,
            headers,
        },
        model: non_empty(parsed.provider.model.as_deref()).map(str::to_string),
        client,
        log: LogConfig {
            file_path,
            level: non_empty(parsed.log.level.as_deref())
                .unwrap_or(DEFAULT_LOG_LEVEL)
                .to_string(),
            stdout: parsed.log.stdout.unwrap_or(false),
        },
    })
}

/// Conventional environment variable holding the key for a backend.
pub fn default_key_env(provider_id: &str) -> Option<&'static str> {
    match provider_id.trim().to_ascii_lowercase().as_str() {
        "openai" | "openai-compatible" => Some("OPENAI_API_KEY"),
        "anthropic" => Some("ANTHROPIC_API_KEY"),
        "deepseek" => Some("DEEPSEEK_API_KEY"),
        "groq" => Some("GROQ_API_KEY"),
        "openrouter" => Some("OPENROUTER_API_KEY"),
        "mistral" => Some("MISTRAL_API_KEY"),
        "xai" => Some("XAI_API_KEY"),
        "together" => Some("TOGETHER_API_KEY"),
        _ => None,
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn resolve_config_value<F>(
    value: &str,
    env_map: &HashMap<String, String>,
    process_env: &F,
) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(env_key) = trimmed.strip_prefix('$') {
        return resolve_env_key(env_key, env_map, process_env);
    }
    Some(trimmed.to_string())
}

fn resolve_env_key<F>(key: &str, env_map: &HashMap<String, String>, process_env: &F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    env_map
        .get(key)
        .cloned()
        .or_else(|| process_env(key))
        .filter(|resolved| !resolved.trim().is_empty())
}
