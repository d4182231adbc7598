use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{ArgAction, Parser, ValueEnum};
use snafu::{ResultExt, Snafu};

use crate::{identity::DEFAULT_DRIVER_NAME, wait::RetryPolicy};

/// Which CSI services the process serves besides Identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PluginRole {
    Controller,
    #[value(alias = "agent")]
    Node,
}

/// Command line arguments.
#[derive(Debug, Parser)]
#[command(name = "jiva-csi-driver", version, about = "CSI plugin for jiva volumes")]
pub struct CliArgs {
    /// Identifier of the node the plugin runs on.
    #[arg(long, default_value = "")]
    pub nodeid: String,

    /// CSI endpoint, unix:///path or tcp://host:port.
    #[arg(long, default_value = "unix:///csi/csi.sock")]
    pub endpoint: String,

    /// Name the driver registers under.
    #[arg(long, default_value = DEFAULT_DRIVER_NAME)]
    pub name: String,

    /// Run the controller or the node plugin.
    #[arg(long, value_enum)]
    pub plugin: PluginRole,

    /// Namespace the volume resources live in.
    #[arg(long, env = "OPENEBS_NAMESPACE", default_value = "openebs")]
    pub namespace: String,

    /// Log iscsiadm invocations and their output.
    #[arg(short = 'd', long)]
    pub enable_iscsi_debug: bool,

    /// Sets the verbosity level.
    #[arg(short, action = ArgAction::Count)]
    pub verbose: u8,

    /// Number of readiness and reachability checks before staging fails.
    #[arg(long, default_value_t = 10)]
    pub retry_count: u32,

    /// Time between readiness and reachability checks.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "2s")]
    pub retry_interval: Duration,
}

/// Where the gRPC server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum ConfigError {
    #[snafu(display("Unsupported endpoint '{}', expected unix:// or tcp://", endpoint))]
    UnsupportedEndpoint { endpoint: String },
    #[snafu(display("Invalid tcp endpoint '{}': {}", endpoint, source))]
    InvalidAddress {
        endpoint: String,
        source: std::net::AddrParseError,
    },
    #[snafu(display("The node plugin requires --nodeid"))]
    MissingNodeId {},
}

impl std::str::FromStr for Endpoint {
    type Err = ConfigError;

    fn from_str(endpoint: &str) -> Result<Self, Self::Err> {
        if let Some(path) = endpoint.strip_prefix("unix://") {
            if !path.is_empty() {
                return Ok(Endpoint::Unix(PathBuf::from(path)));
            }
        } else if let Some(address) = endpoint.strip_prefix("tcp://") {
            let address = address.parse().context(InvalidAddress {
                endpoint,
            })?;
            return Ok(Endpoint::Tcp(address));
        }
        UnsupportedEndpoint {
            endpoint,
        }
        .fail()
    }
}

/// Validated process configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    node_id: String,
    endpoint: Endpoint,
    driver_name: String,
    role: PluginRole,
    namespace: String,
    iscsi_debug: bool,
    verbose: u8,
    retry: RetryPolicy,
}

impl TryFrom<CliArgs> for Config {
    type Error = ConfigError;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.plugin == PluginRole::Node && args.nodeid.is_empty() {
            return MissingNodeId {}.fail();
        }
        Ok(Self {
            endpoint: args.endpoint.parse()?,
            node_id: args.nodeid,
            driver_name: args.name,
            role: args.plugin,
            namespace: args.namespace,
            iscsi_debug: args.enable_iscsi_debug,
            verbose: args.verbose,
            retry: RetryPolicy::new(args.retry_count, args.retry_interval),
        })
    }
}

impl Config {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }
    pub fn role(&self) -> PluginRole {
        self.role
    }
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
    /// Policy for the readiness and reachability waits.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Default log filter directives, used when RUST_LOG is not set.
    /// The iSCSI debug toggle only applies to the node plugin.
    pub fn log_directives(&self) -> String {
        let level = match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        let iscsi = if self.iscsi_debug && self.role == PluginRole::Node {
            "debug"
        } else {
            "info"
        };
        format!("{},iscsi={}", level, iscsi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn parse(args: &[&str]) -> Result<Config, ConfigError> {
        let args = CliArgs::try_parse_from(
            std::iter::once("jiva-csi-driver").chain(args.iter().copied()),
        )
        .unwrap();
        Config::try_from(args)
    }

    #[test]
    fn defaults() {
        let config = parse(&["--plugin", "controller"]).unwrap();
        assert_eq!(
            config.endpoint(),
            &Endpoint::Unix(PathBuf::from("/csi/csi.sock"))
        );
        assert_eq!(config.driver_name(), DEFAULT_DRIVER_NAME);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.log_directives(), "info,iscsi=info");
    }

    #[test]
    fn node_plugin() {
        let config = parse(&[
            "--plugin",
            "agent",
            "--nodeid",
            "worker-1",
            "--endpoint",
            "tcp://127.0.0.1:10000",
            "-d",
            "-vv",
            "--retry-count",
            "3",
            "--retry-interval",
            "500ms",
        ])
        .unwrap();
        assert_eq!(config.role(), PluginRole::Node);
        assert_eq!(config.node_id(), "worker-1");
        assert_matches!(config.endpoint(), Endpoint::Tcp(_));
        assert_eq!(config.log_directives(), "trace,iscsi=debug");
        assert_eq!(
            config.retry_policy(),
            RetryPolicy::new(3, Duration::from_millis(500))
        );
    }

    #[test]
    fn node_plugin_requires_node_id() {
        assert_matches!(
            parse(&["--plugin", "node"]),
            Err(ConfigError::MissingNodeId {})
        );
    }

    #[test]
    fn iscsi_debug_is_ignored_by_the_controller() {
        let config = parse(&["--plugin", "controller", "-d"]).unwrap();
        assert_eq!(config.log_directives(), "info,iscsi=info");
    }

    #[test]
    fn endpoints() {
        assert_matches!(
            "http://x".parse::<Endpoint>(),
            Err(ConfigError::UnsupportedEndpoint { .. })
        );
        assert_matches!(
            "tcp://nowhere".parse::<Endpoint>(),
            Err(ConfigError::InvalidAddress { .. })
        );
        assert_matches!(
            "unix://".parse::<Endpoint>(),
            Err(ConfigError::UnsupportedEndpoint { .. })
        );
    }
}
