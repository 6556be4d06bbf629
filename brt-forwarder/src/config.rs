use crate::env_overlay::{apply_env_overrides, AppliedOverride};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ForwarderConfig {
    pub server: ServerConf,
    pub receiver: ReceiverConf,
    pub processing: ProcessingConf,
    pub cache: CacheConf,
    pub forwarder: ForwarderConf,
    pub logging: LoggingConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConf {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ReceiverConf {
    pub path: String,
    pub auth: AuthConf,
    /// Taille maximale d'un payload entrant (413 au-delà)
    pub max_body_bytes: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AuthConf {
    pub enabled: bool,
    pub valid_tokens: Vec<String>,
    pub header: String,
    pub query_param: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProcessingConf {
    pub enabled: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConf {
    pub file_path: PathBuf,
    pub special_metrics: Vec<String>,
    pub invalid_patterns: Vec<String>,
    pub sync_interval_secs: u64,
    /// false = toute écriture valide écrase l'entrée, même avec un scan_time plus ancien
    pub reject_out_of_order: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ForwarderConf {
    pub targets: Vec<TargetConf>,
    pub retry: RetryConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TargetConf {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    /// Surcharge du bloc retry global pour cette cible
    #[serde(default)]
    pub retry: Option<RetryConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConf {
    pub enabled: bool,
    /// Tentatives supplémentaires après la première
    pub max_attempts: u32,
    pub delay_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConf {
    pub level: String,
}

fn default_timeout_secs() -> f64 {
    5.0
}

impl Default for ServerConf {
    fn default() -> Self {
        Self { host: "0.0.0.0".into(), port: 8080 }
    }
}

impl Default for ReceiverConf {
    fn default() -> Self {
        Self {
            path: "/receive_brt_data".into(),
            auth: AuthConf::default(),
            max_body_bytes: 2 * 1024 * 1024,
        }
    }
}

impl Default for AuthConf {
    fn default() -> Self {
        Self {
            enabled: false,
            valid_tokens: Vec::new(),
            header: "Authorization".into(),
            query_param: "auth_token".into(),
        }
    }
}

impl Default for ProcessingConf {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for CacheConf {
    fn default() -> Self {
        Self {
            file_path: PathBuf::from("./data/cache.json"),
            special_metrics: Vec::new(),
            invalid_patterns: vec!["FFFF".into(), "FFFE".into()],
            sync_interval_secs: 30,
            reject_out_of_order: false,
        }
    }
}

impl Default for RetryConf {
    fn default() -> Self {
        Self { enabled: false, max_attempts: 0, delay_ms: 1000 }
    }
}

impl Default for LoggingConf {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

/// Cible de relais résolue (retry global ou surchargé déjà appliqué)
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardTarget {
    pub url: String,
    pub timeout: Duration,
    pub retry_enabled: bool,
    pub max_extra_attempts: u32,
    pub retry_delay: Duration,
}

impl ForwardTarget {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
            retry_enabled: false,
            max_extra_attempts: 0,
            retry_delay: Duration::from_millis(RetryConf::default().delay_ms),
        }
    }

    pub fn with_retry(mut self, extra_attempts: u32, delay: Duration) -> Self {
        self.retry_enabled = true;
        self.max_extra_attempts = extra_attempts;
        self.retry_delay = delay;
        self
    }

    /// 1 + tentatives supplémentaires si le retry est actif
    pub fn max_attempts(&self) -> u32 {
        1 + if self.retry_enabled { self.max_extra_attempts } else { 0 }
    }
}

impl ForwarderConfig {
    /// Cibles dans l'ordre de configuration. Les URL vides sont ignorées.
    pub fn resolved_targets(&self) -> Vec<ForwardTarget> {
        self.forwarder
            .targets
            .iter()
            .filter(|t| !t.url.trim().is_empty())
            .map(|t| {
                let retry = t.retry.as_ref().unwrap_or(&self.forwarder.retry);
                ForwardTarget {
                    url: t.url.trim().to_string(),
                    timeout: target_timeout(t.timeout_secs)
                        .unwrap_or_else(|| Duration::from_secs_f64(default_timeout_secs())),
                    retry_enabled: retry.enabled,
                    max_extra_attempts: retry.max_attempts,
                    retry_delay: Duration::from_millis(retry.delay_ms),
                }
            })
            .collect()
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.cache.sync_interval_secs)
    }

    fn validate(&self) -> Result<Vec<String>, ConfigError> {
        let mut warnings = Vec::new();
        if self.cache.sync_interval_secs == 0 {
            return Err(ConfigError::Invalid("cache.sync_interval_secs must be >= 1".into()));
        }
        if self.receiver.max_body_bytes == 0 {
            return Err(ConfigError::Invalid("receiver.max_body_bytes must be >= 1".into()));
        }
        if !self.receiver.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "receiver.path must start with '/': {}",
                self.receiver.path
            )));
        }
        for (idx, target) in self.forwarder.targets.iter().enumerate() {
            if target_timeout(target.timeout_secs).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "forwarder.targets[{idx}].timeout_secs must be a positive duration, got {}",
                    target.timeout_secs
                )));
            }
            if target.url.trim().is_empty() {
                warnings.push(format!("forwarder.targets[{idx}] has no url, skipped"));
            }
        }
        if self.cache.invalid_patterns.is_empty() {
            warnings.push("cache.invalid_patterns is empty, no value will be repaired".into());
        }
        Ok(warnings)
    }
}

// None pour 0, négatif, NaN, infini ou trop grand pour une Duration
fn target_timeout(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok().filter(|d| !d.is_zero())
}

/// Configuration chargée + ce qu'il faudra journaliser une fois les logs initialisés
#[derive(Debug)]
pub struct LoadedConfig {
    pub config: ForwarderConfig,
    pub source: Option<PathBuf>,
    pub overrides: Vec<AppliedOverride>,
    pub warnings: Vec<String>,
}

/// Fichier YAML (optionnel) + surcharge BRT_* de l'environnement du processus
pub async fn load_config(path: &Path) -> Result<LoadedConfig, ConfigError> {
    let (text, source, mut warnings) = if Path::new(path).exists() {
        let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        (txt, Some(path.to_path_buf()), Vec::new())
    } else {
        (
            String::new(),
            None,
            vec![format!("config file {} not found, using defaults", path.display())],
        )
    };

    let mut loaded = from_yaml_str(&text, std::env::vars())?;
    loaded.source = source;
    warnings.append(&mut loaded.warnings);
    loaded.warnings = warnings;
    Ok(loaded)
}

/// Construction pure : texte YAML + variables d'environnement fournies
pub fn from_yaml_str<I>(text: &str, env: I) -> Result<LoadedConfig, ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut tree: serde_yaml::Value = if text.trim().is_empty() {
        serde_yaml::Value::Null
    } else {
        serde_yaml::from_str(text)?
    };

    let report = apply_env_overrides(&mut tree, env);
    let config: ForwarderConfig = serde_yaml::from_value(tree)?;
    let mut warnings = report.warnings;
    warnings.extend(config.validate()?);

    Ok(LoadedConfig {
        config,
        source: None,
        overrides: report.applied,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
server:
  port: 8081
receiver:
  path: /receive_brt_data
  auth:
    enabled: true
    valid_tokens: ["your-secret-token-123"]
cache:
  file_path: ./data/cache.json
  special_metrics: [co2, voc, hcho]
  invalid_patterns: [FFFF, FFFE]
  sync_interval_secs: 10
forwarder:
  targets:
    - url: http://a.example/ingest
      timeout_secs: 3
    - url: ""
    - url: http://b.example/ingest
      retry:
        enabled: true
        max_attempts: 2
        delay_ms: 10
  retry:
    enabled: false
    max_attempts: 5
"#;

    fn no_env() -> Vec<(String, String)> {
        Vec::new()
    }

    #[test]
    fn test_defaults_from_empty_text() {
        let loaded = from_yaml_str("", no_env()).unwrap();
        let cfg = loaded.config;
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.receiver.path, "/receive_brt_data");
        assert!(cfg.processing.enabled);
        assert_eq!(cfg.cache.invalid_patterns, vec!["FFFF", "FFFE"]);
        assert_eq!(cfg.sync_interval(), Duration::from_secs(30));
        assert!(cfg.resolved_targets().is_empty());
    }

    #[test]
    fn test_targets_resolution_keeps_order_and_overrides() {
        let loaded = from_yaml_str(SAMPLE, no_env()).unwrap();
        let targets = loaded.config.resolved_targets();
        assert_eq!(targets.len(), 2);

        assert_eq!(targets[0].url, "http://a.example/ingest");
        assert_eq!(targets[0].timeout, Duration::from_secs(3));
        assert_eq!(targets[0].max_attempts(), 1);

        assert_eq!(targets[1].url, "http://b.example/ingest");
        assert_eq!(targets[1].timeout, Duration::from_secs(5));
        assert_eq!(targets[1].max_attempts(), 3);
        assert_eq!(targets[1].retry_delay, Duration::from_millis(10));

        assert!(loaded.warnings.iter().any(|w| w.contains("targets[1]")));
    }

    #[test]
    fn test_env_overlay_applied_before_typing() {
        let env = vec![
            ("BRT_PROCESSING__ENABLED".to_string(), "false".to_string()),
            ("BRT_SERVER__PORT".to_string(), "9000".to_string()),
            ("BRT_FORWARDER__RETRY__ENABLED".to_string(), "1".to_string()),
        ];
        let loaded = from_yaml_str(SAMPLE, env).unwrap();
        assert!(!loaded.config.processing.enabled);
        assert_eq!(loaded.config.server.port, 9000);
        assert_eq!(loaded.overrides.len(), 3);
        // la cible A hérite maintenant du retry global (5 tentatives supplémentaires)
        assert_eq!(loaded.config.resolved_targets()[0].max_attempts(), 6);
    }

    #[test]
    fn test_zero_sync_interval_rejected() {
        let err = from_yaml_str("cache:\n  sync_interval_secs: 0\n", no_env()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_unrepresentable_timeout_rejected() {
        for bad in ["0", "-1", "1e30", ".nan"] {
            let yaml = format!("forwarder:\n  targets:\n    - url: http://a\n      timeout_secs: {bad}\n");
            let err = from_yaml_str(&yaml, no_env()).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{bad} accepted");
        }
    }

    #[test]
    fn test_unvalidated_huge_timeout_falls_back_to_default() {
        let mut cfg = ForwarderConfig::default();
        cfg.forwarder.targets.push(TargetConf { url: "http://a".into(), timeout_secs: 1e30, retry: None });
        assert_eq!(cfg.resolved_targets()[0].timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_bad_yaml_type_is_an_error() {
        let err = from_yaml_str("server:\n  port: eighty\n", no_env()).unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }

    #[tokio::test]
    async fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let loaded = load_config(&dir.path().join("config.yaml")).await.unwrap();
        assert!(loaded.source.is_none());
        assert!(loaded.warnings.iter().any(|w| w.contains("not found")));
    }
}
