//! Server, worker, and credential configuration.

use std::env;

/// Environment variable carrying the Anthropic API key.
pub const ANTHROPIC_API_KEY_VAR: &str = "ANTHROPIC_API_KEY";
/// Environment variable carrying the E2B sandbox API key.
pub const E2B_API_KEY_VAR: &str = "E2B_API_KEY";

/// Default port for the relay server.
pub const DEFAULT_PORT: u16 = 3000;

/// Error type for configuration loading.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// One or both credential environment variables are unset or empty.
    #[error("Missing API keys")]
    MissingCredentials,
}

/// Configuration for the relay HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    /// Get the configured address as a string.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration for the worker command invoked per request.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Program to execute.
    pub program: String,
    /// Fixed arguments placed before the prompt.
    pub args: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: "claude-worker".to_string(),
            args: Vec::new(),
        }
    }
}

impl WorkerConfig {
    /// Parse a whitespace-separated command line into a worker config.
    ///
    /// Returns the default config when the input is blank.
    #[must_use]
    pub fn from_command_line(command: &str) -> Self {
        let mut parts = command.split_whitespace().map(String::from);
        match parts.next() {
            Some(program) => Self {
                program,
                args: parts.collect(),
            },
            None => Self::default(),
        }
    }
}

/// API credentials forwarded to the worker's environment.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Anthropic API key.
    pub anthropic_api_key: String,
    /// E2B sandbox API key.
    pub e2b_api_key: String,
}

impl Credentials {
    /// Load credentials from the environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingCredentials` if either variable is
    /// unset or empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        let anthropic_api_key =
            env::var(ANTHROPIC_API_KEY_VAR).map_err(|_| ConfigError::MissingCredentials)?;
        let e2b_api_key = env::var(E2B_API_KEY_VAR).map_err(|_| ConfigError::MissingCredentials)?;

        if anthropic_api_key.is_empty() || e2b_api_key.is_empty() {
            return Err(ConfigError::MissingCredentials);
        }

        Ok(Self {
            anthropic_api_key,
            e2b_api_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.address(), "127.0.0.1:3000");
    }

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.program, "claude-worker");
        assert!(config.args.is_empty());
    }

    #[test]
    fn test_worker_config_from_command_line() {
        let config = WorkerConfig::from_command_line("bun run agent.ts");
        assert_eq!(config.program, "bun");
        assert_eq!(config.args, vec!["run".to_string(), "agent.ts".to_string()]);
    }

    #[test]
    fn test_worker_config_from_blank_command_line() {
        let config = WorkerConfig::from_command_line("   ");
        assert_eq!(config.program, "claude-worker");
    }

    #[test]
    fn test_missing_credentials_display() {
        assert_eq!(
            ConfigError::MissingCredentials.to_string(),
            "Missing API keys"
        );
    }
}
