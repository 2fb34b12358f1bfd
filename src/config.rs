//! Startup configuration: `.env`, environment variables, then CLI flags

use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use crate::broker::{BrokerConfig, BrokerEndpoint, BrokerError};
use crate::profile::{DestinationConfig, Profile, RoleBindings};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("No profile selected; pass --profile client1|client2 or set APP_PROFILE")]
    MissingProfile,

    #[error("Invalid profile: {0}")]
    InvalidProfile(String),

    #[error("Invalid HTTP bind address: {0}")]
    InvalidBind(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Command line flags; each one overrides its environment variable
#[derive(Debug, Default, Parser)]
#[command(name = "exchange-client", about = "Stock exchange client bridging a message broker to WebSocket clients")]
pub struct Cli {
    /// Client role: client1 or client2 (also --spring.profiles.active)
    #[arg(long)]
    pub profile: Option<String>,

    /// Also write logs to this file (also --logging.file.name)
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// tcp://host:port for STOMP, or memory:// for an in-process broker
    #[arg(long)]
    pub broker_url: Option<String>,

    /// HTTP/WebSocket port
    #[arg(long)]
    pub port: Option<u16>,
}

const FLAG_ALIASES: &[(&str, &str)] = &[
    ("--spring.profiles.active", "--profile"),
    ("--logging.file.name", "--log-file"),
];

/// Rewrite the Spring-style flags of the original launch command to ours
pub fn normalize_args<I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    args.into_iter()
        .map(|arg| {
            for (alias, flag) in FLAG_ALIASES {
                if arg == *alias {
                    return flag.to_string();
                }
                if let Some(value) = arg.strip_prefix(alias).and_then(|s| s.strip_prefix('=')) {
                    return format!("{}={}", flag, value);
                }
            }
            arg
        })
        .collect()
}

impl Cli {
    pub fn parse_normalized() -> Self {
        Cli::parse_from(normalize_args(std::env::args()))
    }
}

/// Read an environment variable, trimmed; unset and blank are both None
pub(crate) fn env_trimmed(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Parse an environment variable. Unset is Ok(None); a value that doesn't
/// parse is an error naming the variable.
pub(crate) fn env_parsed<T: FromStr>(name: &str) -> Result<Option<T>, String> {
    match env_trimmed(name) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| format!("{}={} is not a valid value", name, raw)),
        None => Ok(None),
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub profile: Profile,
    pub bindings: RoleBindings,
    pub broker: BrokerConfig,
    pub bind_addr: SocketAddr,
    pub log_file: Option<PathBuf>,
}

impl AppConfig {
    /// Merge environment and CLI into a validated config
    pub fn load(cli: Cli) -> Result<Self, ConfigError> {
        let profile: Profile = cli
            .profile
            .or_else(|| env_trimmed("APP_PROFILE"))
            .ok_or(ConfigError::MissingProfile)?
            .parse()
            .map_err(ConfigError::InvalidProfile)?;

        let bindings = RoleBindings::for_profile(profile, &DestinationConfig::from_env());

        let mut broker = BrokerConfig::from_env()?;
        if let Some(url) = cli.broker_url {
            broker.url = url;
        }
        BrokerEndpoint::parse(&broker.url)?;

        let host = env_trimmed("HTTP_BIND").unwrap_or_else(|| "0.0.0.0".to_string());
        let ip: IpAddr = host
            .parse()
            .map_err(|_| ConfigError::InvalidBind(host.clone()))?;
        let port = match cli.port {
            Some(port) => port,
            None => env_parsed("HTTP_PORT")
                .map_err(ConfigError::InvalidBind)?
                .unwrap_or_else(|| profile.default_port()),
        };

        let log_file = cli
            .log_file
            .or_else(|| env_trimmed("LOG_FILE").map(PathBuf::from));

        Ok(Self {
            profile,
            bindings,
            broker,
            bind_addr: SocketAddr::new(ip, port),
            log_file,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "APP_PROFILE",
        "BROKER_URL",
        "HTTP_BIND",
        "HTTP_PORT",
        "LOG_FILE",
        "JMS_STATUS_PREFIX",
        "BROKER_RECEIPT_TIMEOUT_SECS",
        "BROKER_RECONNECT_MAX_ATTEMPTS",
        "BROKER_RECONNECT_INITIAL_MS",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_normalize_spring_flags() {
        let args = normalize_args(
            [
                "exchange-client",
                "--spring.profiles.active=client2",
                "--logging.file.name",
                "./build/log/application.log",
                "--port=9000",
            ]
            .map(String::from),
        );
        assert_eq!(
            args,
            vec![
                "exchange-client",
                "--profile=client2",
                "--log-file",
                "./build/log/application.log",
                "--port=9000",
            ]
        );

        let cli = Cli::parse_from(args);
        assert_eq!(cli.profile.as_deref(), Some("client2"));
        assert_eq!(cli.port, Some(9000));
    }

    #[test]
    #[serial]
    fn test_missing_profile() {
        clear_env();
        assert!(matches!(
            AppConfig::load(Cli::default()),
            Err(ConfigError::MissingProfile)
        ));
    }

    #[test]
    #[serial]
    fn test_profile_from_env_and_default_port() {
        clear_env();
        std::env::set_var("APP_PROFILE", "client2");

        let config = AppConfig::load(Cli::default()).unwrap();
        assert_eq!(config.profile, Profile::Client2);
        assert_eq!(config.bind_addr.port(), 8082);
        assert_eq!(config.bindings.client_id, "client2");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_cli_overrides_env() {
        clear_env();
        std::env::set_var("APP_PROFILE", "client2");
        std::env::set_var("BROKER_URL", "tcp://env-broker:61613");
        std::env::set_var("HTTP_PORT", "7000");

        let cli = Cli {
            profile: Some("client1".to_string()),
            log_file: Some(PathBuf::from("/tmp/x.log")),
            broker_url: Some("memory://".to_string()),
            port: Some(7100),
        };
        let config = AppConfig::load(cli).unwrap();
        assert_eq!(config.profile, Profile::Client1);
        assert_eq!(config.broker.url, "memory://");
        assert_eq!(config.bind_addr.port(), 7100);
        assert_eq!(config.log_file, Some(PathBuf::from("/tmp/x.log")));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_values_are_rejected() {
        clear_env();
        std::env::set_var("APP_PROFILE", "client9");
        assert!(matches!(
            AppConfig::load(Cli::default()),
            Err(ConfigError::InvalidProfile(_))
        ));

        std::env::set_var("APP_PROFILE", "client1");
        std::env::set_var("BROKER_URL", "amqp://broker:5672");
        assert!(matches!(
            AppConfig::load(Cli::default()),
            Err(ConfigError::Broker(_))
        ));

        std::env::remove_var("BROKER_URL");
        std::env::set_var("HTTP_BIND", "not-an-ip");
        assert!(matches!(
            AppConfig::load(Cli::default()),
            Err(ConfigError::InvalidBind(_))
        ));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_destination_prefix_from_env() {
        clear_env();
        std::env::set_var("APP_PROFILE", "client1");
        std::env::set_var("JMS_STATUS_PREFIX", "exchange.status");

        let config = AppConfig::load(Cli::default()).unwrap();
        assert_eq!(
            config
                .bindings
                .status_destination(crate::types::Exchange::Frankfurt)
                .name,
            "exchange.status.Frankfurt.client1"
        );
        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_parsed_distinguishes_unset_blank_and_garbage() {
        clear_env();
        assert_eq!(env_parsed::<u16>("HTTP_PORT"), Ok(None));

        std::env::set_var("HTTP_PORT", "   ");
        assert_eq!(env_parsed::<u16>("HTTP_PORT"), Ok(None));

        std::env::set_var("HTTP_PORT", " 9100 ");
        assert_eq!(env_parsed::<u16>("HTTP_PORT"), Ok(Some(9100)));

        std::env::set_var("HTTP_PORT", "ninety");
        let err = env_parsed::<u16>("HTTP_PORT").unwrap_err();
        assert!(err.contains("HTTP_PORT=ninety"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_unparseable_broker_settings_are_rejected() {
        clear_env();
        std::env::set_var("APP_PROFILE", "client1");

        std::env::set_var("BROKER_RECEIPT_TIMEOUT_SECS", "5s");
        match AppConfig::load(Cli::default()) {
            Err(ConfigError::Broker(BrokerError::Config(msg))) => {
                assert!(msg.contains("BROKER_RECEIPT_TIMEOUT_SECS"))
            }
            other => panic!("Expected broker config error, got {:?}", other),
        }

        std::env::remove_var("BROKER_RECEIPT_TIMEOUT_SECS");
        std::env::set_var("BROKER_RECONNECT_MAX_ATTEMPTS", "-1");
        assert!(matches!(
            AppConfig::load(Cli::default()),
            Err(ConfigError::Broker(BrokerError::Config(_)))
        ));

        std::env::remove_var("BROKER_RECONNECT_MAX_ATTEMPTS");
        std::env::set_var("BROKER_RECONNECT_INITIAL_MS", "250");
        std::env::set_var("HTTP_PORT", "99999");
        assert!(matches!(
            AppConfig::load(Cli::default()),
            Err(ConfigError::InvalidBind(_))
        ));

        std::env::remove_var("HTTP_PORT");
        let config = AppConfig::load(Cli::default()).unwrap();
        assert_eq!(
            config.broker.reconnect.initial_delay,
            std::time::Duration::from_millis(250)
        );
        clear_env();
    }
}
