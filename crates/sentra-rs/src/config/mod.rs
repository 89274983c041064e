use std::{env, fs, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// Domains that may be scanned without hosting the verification marker.
    pub verify_allowlist: Vec<String>,
    pub verify_marker: String,
    pub verify_timeout_secs: u64,
    pub baseline_timeout_secs: u64,
    pub followup_timeout_secs: u64,
    /// Delay inserted between pipeline stages so live observers can follow along.
    pub pacing_ms: u64,
    pub recent_limit: i64,
    pub oracle: OracleConfig,
    pub tools: ToolPaths,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub timeout_secs: u64,
}

/// Explicit binary locations. Empty values are resolved from `PATH` at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub nmap_path: Option<String>,
    pub nikto_path: Option<String>,
    pub docker_path: Option<String>,
    pub sslscan_path: Option<String>,
    pub gobuster_path: Option<String>,
    pub gobuster_wordlist: String,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = env::var("SENTRA_CONFIG").unwrap_or_else(|_| "config.json".to_string());
        Self::load_from(&path, |key| env::var(key).ok())
    }

    fn load_from(path: &str, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let file_cfg: Option<AppConfig> = fs::read_to_string(path)
            .ok()
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .with_context(|| format!("failed to parse {path}"))?;

        let mut cfg = file_cfg.unwrap_or_default();
        cfg.apply_env(var);
        Ok(cfg)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("SENTRA_HOST") {
            self.host = v;
        }
        if let Some(v) = var("SENTRA_PORT") {
            self.port = v.parse().unwrap_or(self.port);
        }
        if let Some(v) = var("SENTRA_DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = var("SENTRA_VERIFY_ALLOWLIST") {
            self.verify_allowlist = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Some(v) = var("SENTRA_PACING_MS") {
            self.pacing_ms = v.parse().unwrap_or(self.pacing_ms);
        }
        if let Some(v) = var("SENTRA_ORACLE_ENDPOINT") {
            self.oracle.endpoint = v;
        }
        if let Some(v) = var("SENTRA_ORACLE_MODEL") {
            self.oracle.model = v;
        }
        if let Some(v) = var("SENTRA_ORACLE_API_KEY") {
            self.oracle.api_key = v;
        }
        if self.oracle.api_key.trim().is_empty() {
            if let Some(v) = var("OPENROUTER_API_KEY") {
                self.oracle.api_key = v;
            }
        }
    }

    pub fn baseline_timeout(&self) -> Duration {
        Duration::from_secs(self.baseline_timeout_secs)
    }

    pub fn followup_timeout(&self) -> Duration {
        Duration::from_secs(self.followup_timeout_secs)
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            database_url: "sqlite://sentra.db?mode=rwc".to_string(),
            verify_allowlist: vec![
                "scanme.nmap.org".to_string(),
                "testphp.vulnweb.com".to_string(),
                "demo.testfire.net".to_string(),
            ],
            verify_marker: "sentra-verify.txt".to_string(),
            verify_timeout_secs: 5,
            baseline_timeout_secs: 120,
            followup_timeout_secs: 75,
            pacing_ms: 250,
            recent_limit: 50,
            oracle: OracleConfig::default(),
            tools: ToolPaths {
                gobuster_wordlist: "/usr/share/wordlists/dirb/common.txt".to_string(),
                ..ToolPaths::default()
            },
        }
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            api_key: String::new(),
            model: "moonshotai/kimi-k2.5".to_string(),
            temperature: 0.3,
            timeout_secs: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let cfg: AppConfig =
            serde_json::from_str(r#"{"port": 9001, "oracle": {"model": "local/llm"}}"#)
                .expect("config should parse");
        assert_eq!(cfg.port, 9001);
        assert_eq!(cfg.oracle.model, "local/llm");
        assert_eq!(cfg.oracle.timeout_secs, 60);
        assert_eq!(cfg.baseline_timeout_secs, 120);
        assert!(cfg.verify_allowlist.contains(&"scanme.nmap.org".to_string()));
    }

    #[test]
    fn env_overrides_win_and_api_key_falls_back() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("SENTRA_PORT", "7000"),
            ("SENTRA_VERIFY_ALLOWLIST", "a.example, b.example"),
            ("OPENROUTER_API_KEY", "sk-test"),
        ]);
        let mut cfg = AppConfig::default();
        cfg.apply_env(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.verify_allowlist, vec!["a.example", "b.example"]);
        assert_eq!(cfg.oracle.api_key, "sk-test");
    }

    #[test]
    fn load_from_file_then_env() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sentra.json");
        fs::write(&path, r#"{"host": "0.0.0.0", "pacing_ms": 0}"#).expect("write config");
        let path = path.to_string_lossy().to_string();

        let cfg = AppConfig::load_from(&path, |k| (k == "SENTRA_PORT").then(|| "9443".to_string()))
            .expect("load");
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 9443);
        assert_eq!(cfg.pacing(), Duration::ZERO);
    }

    #[test]
    fn missing_file_uses_defaults_and_bad_json_errors() {
        let cfg = AppConfig::load_from("/nonexistent/sentra.json", |_| None).expect("defaults");
        assert_eq!(cfg.port, 8000);

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").expect("write");
        assert!(AppConfig::load_from(&path.to_string_lossy(), |_| None).is_err());
    }
}
