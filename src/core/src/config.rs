use crate::error::{KeelError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Where the model runs relative to this machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    #[default]
    Local,
    Hybrid,
    Cloud,
}

impl fmt::Display for AgentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentMode::Local => "local",
            AgentMode::Hybrid => "hybrid",
            AgentMode::Cloud => "cloud",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentMode {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(AgentMode::Local),
            "hybrid" => Ok(AgentMode::Hybrid),
            "cloud" => Ok(AgentMode::Cloud),
            other => Err(KeelError::Config(format!(
                "unknown mode '{other}' (expected local, hybrid or cloud)"
            ))),
        }
    }
}

/// Model provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
    Google,
}

impl Provider {
    /// Model used when none is configured.
    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::Anthropic => "claude-sonnet-4-20250514",
            Provider::OpenAi => "gpt-4o",
            Provider::Google => "gemini-2.0-flash",
        }
    }

    /// Environment variables consulted for the API key, in order.
    pub fn api_key_vars(&self) -> &'static [&'static str] {
        match self {
            Provider::Anthropic => &["ANTHROPIC_API_KEY"],
            Provider::OpenAi => &["OPENAI_API_KEY"],
            Provider::Google => &["GOOGLE_API_KEY", "GEMINI_API_KEY"],
        }
    }

    /// Environment variable that overrides the API base URL.
    pub fn base_url_var(&self) -> &'static str {
        match self {
            Provider::Anthropic => "ANTHROPIC_BASE_URL",
            Provider::OpenAi => "OPENAI_BASE_URL",
            Provider::Google => "GOOGLE_BASE_URL",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Provider::Anthropic => "anthropic",
            Provider::OpenAi => "openai",
            Provider::Google => "google",
        };
        f.write_str(s)
    }
}

impl FromStr for Provider {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Provider::Anthropic),
            "openai" | "gpt" => Ok(Provider::OpenAi),
            "google" | "gemini" => Ok(Provider::Google),
            other => Err(KeelError::Config(format!(
                "unknown provider '{other}' (expected anthropic, openai or google)"
            ))),
        }
    }
}

/// Isolation level for tool execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    /// Direct host execution, no path confinement
    None,
    /// Paths confined to the working directory
    #[default]
    Basic,
    /// Shell commands run inside a container
    Container,
}

impl fmt::Display for SandboxMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SandboxMode::None => "none",
            SandboxMode::Basic => "basic",
            SandboxMode::Container => "container",
        };
        f.write_str(s)
    }
}

impl FromStr for SandboxMode {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(SandboxMode::None),
            "basic" => Ok(SandboxMode::Basic),
            "container" => Ok(SandboxMode::Container),
            other => Err(KeelError::Config(format!(
                "unknown sandbox mode '{other}' (expected none, basic or container)"
            ))),
        }
    }
}

/// Persisted user settings (`settings.json` in the keel home)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub agent: AgentSettings,
    pub sandbox: SandboxSettings,
    pub checkpoint: CheckpointSettings,
    pub retention: RetentionSettings,
}

impl Settings {
    /// Load settings from disk. A missing file yields defaults; a malformed
    /// file is a configuration error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        let settings = serde_json::from_str(&data)
            .map_err(|e| KeelError::Config(format!("{}: {}", path.display(), e)))?;
        tracing::debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }
}

/// Agent defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub mode: AgentMode,
    pub provider: Provider,
    /// Model name (provider default when unset)
    pub model: Option<String>,
    pub max_iterations: usize,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Snapshot the tree before the first mutating tool batch of a run
    pub auto_checkpoint: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            mode: AgentMode::Local,
            provider: Provider::Anthropic,
            model: None,
            max_iterations: 25,
            temperature: 0.2,
            max_tokens: 4096,
            auto_checkpoint: true,
        }
    }
}

/// Sandbox defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub mode: SandboxMode,
    /// Container runtime binary (docker, podman)
    pub container_runtime: String,
    /// Image used for container execution
    pub image: String,
    /// Memory limit passed to the runtime
    pub memory: String,
    /// CPU limit passed to the runtime
    pub cpus: String,
    /// Allow network access inside the container
    pub network: bool,
    /// Per-call timeout for shell execution
    pub timeout_secs: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            mode: SandboxMode::Basic,
            container_runtime: "docker".to_string(),
            image: "ubuntu:24.04".to_string(),
            memory: "1g".to_string(),
            cpus: "1.0".to_string(),
            network: false,
            timeout_secs: 120,
        }
    }
}

/// Checkpoint defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSettings {
    /// Also snapshot files matched by `.gitignore`. Off by default since
    /// build output and dependency trees are usually ignored; when off,
    /// restore and undo leave ignored files as they are.
    pub include_ignored: bool,
}

/// Session retention defaults used by `session cleanup`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    pub max_age_days: u32,
    pub max_sessions: usize,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            max_age_days: 30,
            max_sessions: 100,
        }
    }
}

/// Configuration of a single agent run. Immutable once the run starts.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub mode: AgentMode,
    pub provider: Provider,
    pub model: String,
    pub max_iterations: usize,
    pub auto_approve: bool,
    pub temperature: f32,
    pub max_tokens: u32,
    pub auto_checkpoint: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::from_settings(&AgentSettings::default())
    }
}

impl AgentConfig {
    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self {
            mode: settings.mode,
            provider: settings.provider,
            model: settings
                .model
                .clone()
                .unwrap_or_else(|| settings.provider.default_model().to_string()),
            max_iterations: settings.max_iterations,
            auto_approve: false,
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            auto_checkpoint: settings.auto_checkpoint,
        }
    }

    /// Reject values no provider accepts.
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(KeelError::Config(
                "max iterations must be at least 1".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(KeelError::Config(format!(
                "temperature {} is outside 0.0..=2.0",
                self.temperature
            )));
        }
        if self.max_tokens == 0 {
            return Err(KeelError::Config(
                "max tokens must be at least 1".to_string(),
            ));
        }
        if self.model.trim().is_empty() {
            return Err(KeelError::Config("model name is empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.agent.mode, AgentMode::Local);
        assert_eq!(settings.agent.max_iterations, 25);
        assert_eq!(settings.sandbox.mode, SandboxMode::Basic);
        assert_eq!(settings.retention.max_age_days, 30);
        assert_eq!(settings.retention.max_sessions, 100);
    }

    #[test]
    fn test_settings_load_missing_file() {
        let tmp = TempDir::new().unwrap();
        let settings = Settings::load(&tmp.path().join("settings.json")).unwrap();
        assert_eq!(settings.agent.provider, Provider::Anthropic);
    }

    #[test]
    fn test_settings_load_partial_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"agent": {"provider": "openai", "max_iterations": 5}, "sandbox": {"mode": "container"}}"#,
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.agent.provider, Provider::OpenAi);
        assert_eq!(settings.agent.max_iterations, 5);
        assert_eq!(settings.agent.max_tokens, 4096);
        assert_eq!(settings.sandbox.mode, SandboxMode::Container);
        assert_eq!(settings.sandbox.image, "ubuntu:24.04");
        assert!(!settings.checkpoint.include_ignored);
    }

    #[test]
    fn test_settings_checkpoint_section() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("settings.json");
        std::fs::write(&path, r#"{"checkpoint": {"include_ignored": true}}"#).unwrap();

        let settings = Settings::load(&path).unwrap();
        assert!(settings.checkpoint.include_ignored);
        assert_eq!(settings.agent.max_iterations, 25);
    }

    #[test]
    fn test_settings_load_malformed_is_config_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = Settings::load(&path).unwrap_err();
        assert!(matches!(err, KeelError::Config(_)));
        assert!(err.to_string().contains("settings.json"));
    }

    #[test]
    fn test_provider_parsing() {
        assert_eq!("claude".parse::<Provider>().unwrap(), Provider::Anthropic);
        assert_eq!("OpenAI".parse::<Provider>().unwrap(), Provider::OpenAi);
        assert_eq!("gemini".parse::<Provider>().unwrap(), Provider::Google);
        assert!("mistral".parse::<Provider>().is_err());
    }

    #[test]
    fn test_mode_and_sandbox_parsing() {
        assert_eq!("hybrid".parse::<AgentMode>().unwrap(), AgentMode::Hybrid);
        assert!("remote".parse::<AgentMode>().is_err());
        assert_eq!("none".parse::<SandboxMode>().unwrap(), SandboxMode::None);
        assert_eq!(SandboxMode::Container.to_string(), "container");
    }

    #[test]
    fn test_agent_config_from_settings_uses_provider_default_model() {
        let settings = AgentSettings {
            provider: Provider::Google,
            ..Default::default()
        };
        let config = AgentConfig::from_settings(&settings);
        assert_eq!(config.model, "gemini-2.0-flash");
        assert!(!config.auto_approve);
    }

    #[test]
    fn test_agent_config_validate() {
        let mut config = AgentConfig::default();
        assert!(config.validate().is_ok());

        config.max_iterations = 0;
        assert!(config.validate().is_err());

        config.max_iterations = 3;
        config.temperature = 3.5;
        assert!(config.validate().is_err());
    }
}
