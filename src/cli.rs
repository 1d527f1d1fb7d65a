use std::fmt::{self, Display};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{Args, Parser};

#[derive(Debug, Parser)]
#[command(
    name = "mqttmock",
    about = "Spin up many mqtt clients and publish to or subscribe from a broker.",
    version
)]
pub enum Cli {
    /// Publish `count` fixed size messages, spread over all the clients
    Pub(PubConfig),
    /// Subscribe every client to a topic and measure incoming throughput
    Sub(SubConfig),
}

impl Cli {
    pub fn debug(&self) -> bool {
        match self {
            Cli::Pub(config) => config.common_config.debug,
            Cli::Sub(config) => config.common_config.debug,
        }
    }
}

#[derive(Debug, Parser)]
pub struct PubConfig {
    #[command(flatten)]
    network_config: _NetworkConfig,

    #[command(flatten)]
    common_config: _CommonConfig,

    /// Size of every published message
    #[arg(short = 's', long = "size", default_value = "1024", value_name = "BYTES")]
    pub message_size: usize,
}

#[derive(Debug, Parser)]
pub struct SubConfig {
    #[command(flatten)]
    network_config: _NetworkConfig,

    #[command(flatten)]
    common_config: _CommonConfig,

    /// Interval at which incoming throughput is logged
    #[arg(short = 'w', long, default_value = "3", value_name = "SECS")]
    pub window: u64,
}

#[derive(Debug, Clone, Args)]
struct _CommonConfig {
    #[arg(short = 'c', long, default_value = "20", value_name = "NUM")]
    pub clients: usize,

    #[arg(
        short = 'n',
        long,
        default_value = "100",
        value_name = "NUM",
        long_help = "\
Number of messages to publish (spread over all clients) or to receive
(summed over all clients). When subscribing, 0 runs until interrupted.
"
    )]
    pub count: u64,

    #[arg(
        short = 't',
        long,
        default_value = "mqtt-mock/benchmark/",
        long_help = "\
Base topic. Publishers append their client index to it,
subscribers use it as is, so it may contain wildcards.
"
    )]
    pub topic: String,

    #[arg(
        short = 'q',
        long,
        default_value = "0",
        value_name = "QoS",
        value_parser = clap::value_parser!(u8).range(0..=2)
    )]
    pub qos: u8,

    /// Log every message sent and received
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Write the run summary as json to this file
    #[arg(long, value_name = "PATH")]
    pub report: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct _NetworkConfig {
    #[arg(
        short = 'b',
        long,
        value_name = "URI",
        long_help = "\
Broker to connect to, e.g. `tcp://127.0.0.1:1883`.
`ssl://`, `tls://` and `mqtts://` connect over tls and need `--ca-file`.
"
    )]
    pub broker: BrokerAddr,

    #[arg(short = 'u', long)]
    pub username: Option<String>,
    #[arg(long)]
    pub password: Option<String>,

    /// Keep alive, 0 disables pings. Goes on the wire as 16 bits.
    #[arg(short = 'k', long, default_value = "90", value_name = "SECS")]
    pub keep_alive: u16,
    #[arg(
        short = 'i',
        long,
        default_value = "100",
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub max_inflight: u16,
    #[arg(long, default_value = "10", value_name = "SECS")]
    pub conn_timeout: u64,

    #[arg(short = 'R', long)]
    pub ca_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Tls,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Tcp => 1883,
            Scheme::Tls => 8883,
        }
    }
}

/// Address of the broker under test, parsed from `[scheme://]host[:port]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddr {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum BrokerAddrError {
    #[error("unsupported scheme `{0}`, expected one of tcp, mqtt, ssl, tls, mqtts")]
    Scheme(String),
    #[error("missing host")]
    MissingHost,
    #[error("invalid port `{0}`")]
    Port(String),
}

impl FromStr for BrokerAddr {
    type Err = BrokerAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = match s.split_once("://") {
            Some((scheme, rest)) => {
                let scheme = match scheme.to_ascii_lowercase().as_str() {
                    "tcp" | "mqtt" => Scheme::Tcp,
                    "ssl" | "tls" | "mqtts" => Scheme::Tls,
                    _ => return Err(BrokerAddrError::Scheme(scheme.to_owned())),
                };
                (scheme, rest)
            }
            None => (Scheme::Tcp, s),
        };

        let rest = rest.trim_end_matches('/');
        let (host, port) = match rest.rsplit_once(':') {
            // `::1` without brackets is a bare v6 host, not a port
            Some((host, port)) if !host.contains(':') || host.ends_with(']') => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| BrokerAddrError::Port(port.to_owned()))?;
                (host, port)
            }
            _ => (rest, scheme.default_port()),
        };

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(BrokerAddrError::MissingHost);
        }

        Ok(BrokerAddr {
            scheme,
            host: host.to_owned(),
            port,
        })
    }
}

impl Display for BrokerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            Scheme::Tcp => "tcp",
            Scheme::Tls => "ssl",
        };

        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", scheme, self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Publish { message_size: usize },
    Subscribe { window: Duration },
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Mode::Publish { .. } => "publish",
            Mode::Subscribe { .. } => "subscribe",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub broker: BrokerAddr,
    pub username: Option<String>,
    pub password: Option<String>,
    pub clients: usize,
    pub count: u64,
    pub topic: String,
    pub qos: u8,
    pub keep_alive: u16,
    pub max_inflight: u16,
    pub conn_timeout: u64,
    pub ca_file: Option<PathBuf>,
    pub debug: bool,
    pub report: Option<PathBuf>,
    pub mode: Mode,
}

impl RunnerConfig {
    fn new(network: _NetworkConfig, common: _CommonConfig, mode: Mode) -> RunnerConfig {
        RunnerConfig {
            broker: network.broker,
            username: network.username,
            password: network.password,
            clients: common.clients,
            count: common.count,
            topic: common.topic,
            qos: common.qos,
            keep_alive: network.keep_alive,
            max_inflight: network.max_inflight,
            conn_timeout: network.conn_timeout,
            ca_file: network.ca_file,
            debug: common.debug,
            report: common.report,
            mode,
        }
    }

    /// Defaults of the command line with only the broker and mode given
    #[cfg(test)]
    pub(crate) fn with_defaults(broker: &str, mode: Mode) -> RunnerConfig {
        RunnerConfig {
            broker: broker.parse().expect("test broker should parse"),
            username: None,
            password: None,
            clients: 20,
            count: 100,
            topic: "mqtt-mock/benchmark/".to_owned(),
            qos: 0,
            keep_alive: 90,
            max_inflight: 100,
            conn_timeout: 10,
            ca_file: None,
            debug: false,
            report: None,
            mode,
        }
    }
}

impl From<PubConfig> for RunnerConfig {
    fn from(value: PubConfig) -> Self {
        let mode = Mode::Publish {
            message_size: value.message_size,
        };

        RunnerConfig::new(value.network_config, value.common_config, mode)
    }
}

impl From<SubConfig> for RunnerConfig {
    fn from(value: SubConfig) -> Self {
        let mode = Mode::Subscribe {
            window: Duration::from_secs(value.window),
        };

        RunnerConfig::new(value.network_config, value.common_config, mode)
    }
}

impl Display for RunnerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Mock Info:")?;
        writeln!(f, "\taction:       {}", self.mode.name())?;
        writeln!(f, "\tbroker:       {}", self.broker)?;
        writeln!(f, "\tc:            {}", self.clients)?;
        writeln!(f, "\tn:            {}", self.count)?;
        match self.mode {
            Mode::Publish { message_size } => writeln!(f, "\tsize:         {}", message_size)?,
            Mode::Subscribe { window } => writeln!(f, "\twindow:       {}s", window.as_secs())?,
        }
        writeln!(
            f,
            "\tusername:     {}",
            self.username.as_deref().unwrap_or("<none>")
        )?;
        writeln!(
            f,
            "\tpassword:     {}",
            if self.password.is_some() { "******" } else { "<none>" }
        )?;
        writeln!(f, "\ttopic:        {}", self.topic)?;
        writeln!(f, "\tqos:          {}", self.qos)?;
        write!(f, "\tdebug:        {}", self.debug)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(args: &[&str]) -> RunnerConfig {
        match Cli::try_parse_from(args).unwrap() {
            Cli::Pub(config) => config.into(),
            Cli::Sub(config) => config.into(),
        }
    }

    #[test]
    fn broker_uri_variants() {
        let addr: BrokerAddr = "tcp://127.0.0.1:1884".parse().unwrap();
        assert_eq!(addr.scheme, Scheme::Tcp);
        assert_eq!(addr.host, "127.0.0.1");
        assert_eq!(addr.port, 1884);

        let addr: BrokerAddr = "broker.local".parse().unwrap();
        assert_eq!(addr.scheme, Scheme::Tcp);
        assert_eq!(addr.port, 1883);

        let addr: BrokerAddr = "mqtts://broker.local/".parse().unwrap();
        assert_eq!(addr.scheme, Scheme::Tls);
        assert_eq!(addr.host, "broker.local");
        assert_eq!(addr.port, 8883);

        let addr: BrokerAddr = "tcp://[::1]:1883".parse().unwrap();
        assert_eq!(addr.host, "::1");
        assert_eq!(addr.to_string(), "tcp://[::1]:1883");

        let addr: BrokerAddr = "::1".parse().unwrap();
        assert_eq!(addr.host, "::1");
        assert_eq!(addr.port, 1883);
    }

    #[test]
    fn broker_uri_errors() {
        assert_eq!(
            "ws://localhost:80".parse::<BrokerAddr>(),
            Err(BrokerAddrError::Scheme("ws".to_owned()))
        );
        assert_eq!(
            "tcp://:1883".parse::<BrokerAddr>(),
            Err(BrokerAddrError::MissingHost)
        );
        assert_eq!(
            "tcp://localhost:99999".parse::<BrokerAddr>(),
            Err(BrokerAddrError::Port("99999".to_owned()))
        );
    }

    #[test]
    fn publish_defaults() {
        let config = runner(&["mqttmock", "pub", "-b", "tcp://localhost:1883"]);
        assert_eq!(config.clients, 20);
        assert_eq!(config.count, 100);
        assert_eq!(config.topic, "mqtt-mock/benchmark/");
        assert_eq!(config.qos, 0);
        assert_eq!(config.keep_alive, 90);
        assert_eq!(config.max_inflight, 100);
        assert!(!config.debug);
        assert!(config.report.is_none());
        assert_eq!(config.mode, Mode::Publish { message_size: 1024 });
    }

    #[test]
    fn subscribe_flags() {
        let config = runner(&[
            "mqttmock", "sub", "-b", "localhost", "-c", "4", "-n", "0", "-t", "bench/#", "-q",
            "2", "-w", "5", "-u", "admin", "--password", "secret", "-d",
        ]);
        assert_eq!(config.clients, 4);
        assert_eq!(config.count, 0);
        assert_eq!(config.topic, "bench/#");
        assert_eq!(config.qos, 2);
        assert_eq!(config.username.as_deref(), Some("admin"));
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert!(config.debug);
        assert_eq!(
            config.mode,
            Mode::Subscribe {
                window: Duration::from_secs(5)
            }
        );
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(Cli::try_parse_from(["mqttmock", "pub"]).is_err());
        assert!(Cli::try_parse_from(["mqttmock", "pub", "-b", "localhost", "-q", "3"]).is_err());
        assert!(Cli::try_parse_from(["mqttmock", "sub", "-b", "ws://localhost"]).is_err());
        assert!(Cli::try_parse_from(["mqttmock", "sub", "-b", "localhost", "-s", "10"]).is_err());

        // rumqttc refuses an empty inflight window
        assert!(Cli::try_parse_from(["mqttmock", "pub", "-b", "localhost", "-i", "0"]).is_err());
        // keep alive is 16 bits on the wire
        assert!(Cli::try_parse_from(["mqttmock", "pub", "-b", "localhost", "-k", "65536"]).is_err());
    }

    #[test]
    fn network_limits_at_the_edges() {
        let config = runner(&[
            "mqttmock", "pub", "-b", "localhost", "-i", "1", "-k", "65535",
        ]);
        assert_eq!(config.max_inflight, 1);
        assert_eq!(config.keep_alive, 65535);

        let config = runner(&["mqttmock", "sub", "-b", "localhost", "-k", "0"]);
        assert_eq!(config.keep_alive, 0);
    }

    #[test]
    fn debug_flag_is_visible_before_dispatch() {
        let cli = Cli::try_parse_from(["mqttmock", "pub", "-b", "localhost", "--debug"]).unwrap();
        assert!(cli.debug());
    }

    #[test]
    fn banner_masks_password() {
        let config = runner(&[
            "mqttmock", "pub", "-b", "localhost", "-u", "admin", "--password", "hunter2",
        ]);
        let banner = config.to_string();
        assert!(banner.starts_with("Mock Info:"));
        assert!(banner.contains("admin"));
        assert!(banner.contains("******"));
        assert!(!banner.contains("hunter2"));
        assert!(banner.contains("size:         1024"));
    }
}
