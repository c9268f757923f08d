//! Command-line interface

use std::path::PathBuf;

use clap::Parser;
use relay_core::ConfigOverrides;

/// HTTP polling proxy for streaming chat sessions
#[derive(Debug, Parser)]
#[command(name = "chat-relay", version, about)]
pub struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, env = "CHAT_RELAY_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Listen host
    #[arg(long)]
    pub host: Option<String>,

    /// Listen port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Model used when a start request names none
    #[arg(short, long)]
    pub model: Option<String>,

    /// Evict finished sessions idle this many seconds (0 disables)
    #[arg(long, value_name = "SECS")]
    pub idle_timeout: Option<u64>,
}

impl Cli {
    /// Flags that override file and environment configuration
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            host: self.host.clone(),
            port: self.port,
            model: self.model.clone(),
            idle_timeout_secs: self.idle_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_overrides_from_flags() {
        let cli = Cli::try_parse_from([
            "chat-relay",
            "--port",
            "8080",
            "--model",
            "gemini-2.0-flash",
            "--idle-timeout",
            "600",
        ])
        .unwrap();

        let overrides = cli.overrides();
        assert_eq!(overrides.port, Some(8080));
        assert_eq!(overrides.model.as_deref(), Some("gemini-2.0-flash"));
        assert_eq!(overrides.idle_timeout_secs, Some(600));
        assert_eq!(overrides.host, None);
    }

    #[test]
    fn test_rejects_invalid_port() {
        assert!(Cli::try_parse_from(["chat-relay", "--port", "99999"]).is_err());
    }
}
