use std::net::ToSocketAddrs;
use std::path::Path;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use serde::Deserialize;

use super::network::Network;

const DEFAULT_CONFIG_FILENAME: &str = "walletd.toml";
const DEFAULT_CA_FILENAME: &str = "upstream.cert";
const DEFAULT_KEYPOOL_SIZE: u32 = 100;
const DEFAULT_DEBUG_LEVEL: &str = "info";

const VALID_DEBUG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "critical"];

/// Command-line options.
///
/// Every option can also be given in the TOML config file; command-line
/// values take precedence over the file, which takes precedence over the
/// built-in defaults.
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "walletd", version, about = "Bitcoin wallet daemon")]
pub struct Args {
    /// File containing root certificates to authenticate the TLS connection
    /// with the upstream node.
    #[arg(long)]
    pub cafile: Option<PathBuf>,

    /// Hostname/IP and port of the upstream node RPC server to connect to
    /// (default localhost:18334, mainnet: localhost:8334).
    #[arg(short = 'c', long)]
    pub rpcconnect: Option<String>,

    /// Logging level {trace, debug, info, warn, error, critical}.
    #[arg(short = 'd', long)]
    pub debuglevel: Option<String>,

    /// Path to configuration file.
    #[arg(short = 'C', long)]
    pub configfile: Option<PathBuf>,

    /// Listen for RPC/websocket connections on this interface/port
    /// (default port: 18332, mainnet: 8332). May be given multiple times.
    #[arg(long = "rpclisten")]
    pub rpclisten: Vec<String>,

    /// Directory to store wallets and transactions.
    #[arg(short = 'D', long)]
    pub datadir: Option<PathBuf>,

    /// Username for upstream node authorization and local RPC auth.
    #[arg(short = 'u', long)]
    pub username: Option<String>,

    /// Password for upstream node authorization and local RPC auth.
    #[arg(short = 'P', long)]
    pub password: Option<String>,

    /// File containing the RPC server certificate.
    #[arg(long)]
    pub rpccert: Option<PathBuf>,

    /// File containing the RPC server certificate key.
    #[arg(long)]
    pub rpckey: Option<PathBuf>,

    /// Use the main Bitcoin network (default testnet3).
    #[arg(long)]
    pub mainnet: bool,

    /// Maximum number of addresses in the keypool.
    #[arg(short = 'k', long)]
    pub keypoolsize: Option<u32>,

    /// Force transactions to always include a fee.
    #[arg(long)]
    pub disallowfree: bool,

    /// Connect via SOCKS5 proxy (eg. 127.0.0.1:9050).
    #[arg(long)]
    pub proxy: Option<String>,

    /// Username for proxy server.
    #[arg(long)]
    pub proxyuser: Option<String>,

    /// Password for proxy server.
    #[arg(long)]
    pub proxypass: Option<String>,

    /// Enable HTTP profiling on the given port (between 1024 and 65535).
    #[arg(long)]
    pub profile: Option<u16>,
}

/// Options read from the TOML config file. Any absent key falls back to the
/// built-in default; any option given on the command line overrides the file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    cafile: Option<PathBuf>,
    rpcconnect: Option<String>,
    debuglevel: Option<String>,
    rpclisten: Vec<String>,
    datadir: Option<PathBuf>,
    username: Option<String>,
    password: Option<String>,
    rpccert: Option<PathBuf>,
    rpckey: Option<PathBuf>,
    mainnet: bool,
    keypoolsize: Option<u32>,
    disallowfree: bool,
    proxy: Option<String>,
    proxyuser: Option<String>,
    proxypass: Option<String>,
    profile: Option<u16>,
}

/// Fully-resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub network: Network,
    pub rpcconnect: String,
    pub rpclisten: Vec<String>,
    pub datadir: PathBuf,
    pub username: String,
    pub password: String,
    pub cafile: PathBuf,
    pub rpccert: PathBuf,
    pub rpckey: PathBuf,
    pub keypool_size: u32,
    pub disallow_free: bool,
    pub proxy: Option<String>,
    pub proxyuser: Option<String>,
    pub proxypass: Option<String>,
    pub profile: Option<u16>,
    pub debug_level: String,
    /// Deferred warning about the config file, logged once tracing is up.
    pub config_file_warning: Option<String>,
}

impl Config {
    /// Load configuration from defaults, the config file, and the already
    /// parsed command line, in increasing order of precedence.
    pub fn load(args: Args) -> Result<Config> {
        let home = default_home_dir();
        let config_path = args
            .configfile
            .clone()
            .unwrap_or_else(|| home.join(DEFAULT_CONFIG_FILENAME));

        let mut warning = None;
        let file = match std::fs::read_to_string(&config_path) {
            Ok(contents) => {
                toml::from_str::<FileConfig>(&contents).with_context(|| {
                    format!("malformed config file {}", config_path.display())
                })?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                // A missing config file is not an error.
                warning = Some(format!(
                    "config file {} not found: {err}",
                    config_path.display()
                ));
                FileConfig::default()
            }
            Err(err) => {
                bail!("cannot read config file {}: {err}", config_path.display())
            }
        };

        let mut cfg = Config::resolve(args, file, &home)?;
        cfg.config_file_warning = warning;
        Ok(cfg)
    }

    fn resolve(args: Args, file: FileConfig, home: &Path) -> Result<Config> {
        let network = if args.mainnet || file.mainnet {
            Network::Mainnet
        } else {
            Network::Testnet3
        };

        let debug_level = args
            .debuglevel
            .or(file.debuglevel)
            .unwrap_or_else(|| DEFAULT_DEBUG_LEVEL.to_owned());
        if !VALID_DEBUG_LEVELS.contains(&debug_level.as_str()) {
            bail!("the specified debug level [{debug_level}] is invalid");
        }

        if let Some(port) = args.profile.or(file.profile) {
            if port < 1024 {
                bail!("profile port must be between 1024 and 65535");
            }
        }

        let rpcconnect = normalize_address(
            &args
                .rpcconnect
                .or(file.rpcconnect)
                .unwrap_or_else(|| "localhost".to_owned()),
            network.upstream_port(),
        );

        let mut rpclisten = if !args.rpclisten.is_empty() {
            args.rpclisten
        } else {
            file.rpclisten
        };
        if rpclisten.is_empty() {
            rpclisten = localhost_listeners(network.listen_port())?;
        }
        let rpclisten = normalize_addresses(rpclisten, network.listen_port());

        let datadir = args
            .datadir
            .or(file.datadir)
            .unwrap_or_else(|| home.to_path_buf());

        let cafile = match args.cafile.or(file.cafile) {
            Some(path) => path,
            None => default_ca_file(home, &rpcconnect),
        };

        Ok(Config {
            network,
            rpcconnect,
            rpclisten,
            datadir,
            username: args.username.or(file.username).unwrap_or_default(),
            password: args.password.or(file.password).unwrap_or_default(),
            cafile,
            rpccert: args
                .rpccert
                .or(file.rpccert)
                .unwrap_or_else(|| home.join("rpc.cert")),
            rpckey: args
                .rpckey
                .or(file.rpckey)
                .unwrap_or_else(|| home.join("rpc.key")),
            keypool_size: args
                .keypoolsize
                .or(file.keypoolsize)
                .unwrap_or(DEFAULT_KEYPOOL_SIZE),
            disallow_free: args.disallowfree || file.disallowfree,
            proxy: args.proxy.or(file.proxy),
            proxyuser: args.proxyuser.or(file.proxyuser),
            proxypass: args.proxypass.or(file.proxypass),
            profile: args.profile.or(file.profile),
            debug_level,
            config_file_warning: None,
        })
    }

    /// The filter directive handed to the tracing subscriber.
    pub fn tracing_filter(&self) -> &str {
        // "critical" has no tracing counterpart; error is the closest level.
        match self.debug_level.as_str() {
            "critical" => "error",
            other => other,
        }
    }
}

#[cfg(test)]
impl Config {
    /// A fully-resolved testnet configuration for unit tests.
    pub(crate) fn for_tests() -> Config {
        Config {
            network: Network::Testnet3,
            rpcconnect: "localhost:18334".into(),
            rpclisten: vec!["127.0.0.1:18332".into()],
            datadir: std::env::temp_dir().join("walletd-tests"),
            username: "user".into(),
            password: "pass".into(),
            cafile: PathBuf::new(),
            rpccert: PathBuf::new(),
            rpckey: PathBuf::new(),
            keypool_size: 5,
            disallow_free: false,
            proxy: None,
            proxyuser: None,
            proxypass: None,
            profile: None,
            debug_level: "info".into(),
            config_file_warning: None,
        }
    }
}

fn default_home_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "walletd")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// If no CA file was configured and the bundled copy does not exist, fall
/// back to the local node's own certificate when connecting over loopback.
/// Only `localhost`, `127.0.0.1`, and `::1` are recognized.
fn default_ca_file(home: &Path, rpcconnect: &str) -> PathBuf {
    let cafile = home.join(DEFAULT_CA_FILENAME);
    if cafile.exists() {
        return cafile;
    }

    let host = split_host(rpcconnect);
    if matches!(host.as_str(), "localhost" | "127.0.0.1" | "::1") {
        if let Some(dirs) = directories::ProjectDirs::from("", "", "btcd") {
            let node_cert = dirs.data_dir().join("rpc.cert");
            if node_cert.exists() {
                return node_cert;
            }
        }
    }
    cafile
}

fn split_host(addr: &str) -> String {
    // [::1]:port, host:port, or a bare host.
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return rest[..end].to_owned();
        }
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_owned(),
        _ => addr.to_owned(),
    }
}

/// Append the default port when the address does not already carry one.
fn normalize_address(addr: &str, default_port: u16) -> String {
    if addr.starts_with('[') || addr.parse::<std::net::SocketAddr>().is_ok() {
        return addr.to_owned();
    }
    match addr.rsplit_once(':') {
        Some((_, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            addr.to_owned()
        }
        _ => format!("{addr}:{default_port}"),
    }
}

/// Normalize all listener addresses and drop duplicates, keeping order.
fn normalize_addresses(addrs: Vec<String>, default_port: u16) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    addrs
        .into_iter()
        .map(|addr| normalize_address(&addr, default_port))
        .filter(|addr| seen.insert(addr.clone()))
        .collect()
}

fn localhost_listeners(port: u16) -> Result<Vec<String>> {
    let addrs: Vec<String> = ("localhost", port)
        .to_socket_addrs()
        .context("cannot resolve localhost")?
        .map(|sa| sa.to_string())
        .collect();
    if addrs.is_empty() {
        bail!("cannot resolve localhost");
    }
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(args: Args, file: FileConfig) -> Config {
        Config::resolve(args, file, Path::new("/tmp/walletd-test")).unwrap()
    }

    #[test]
    fn defaults_are_testnet() {
        let cfg = resolve(Args::default(), FileConfig::default());
        assert_eq!(cfg.network, Network::Testnet3);
        assert_eq!(cfg.rpcconnect, "localhost:18334");
        assert_eq!(cfg.keypool_size, 100);
        assert_eq!(cfg.debug_level, "info");
        assert!(!cfg.rpclisten.is_empty());
        assert!(cfg.rpclisten.iter().all(|a| a.ends_with(":18332")));
    }

    #[test]
    fn cli_overrides_file() {
        let args = Args {
            rpcconnect: Some("10.0.0.2".into()),
            keypoolsize: Some(7),
            ..Args::default()
        };
        let file = FileConfig {
            rpcconnect: Some("10.0.0.1:8334".into()),
            keypoolsize: Some(50),
            debuglevel: Some("debug".into()),
            ..FileConfig::default()
        };
        let cfg = resolve(args, file);
        assert_eq!(cfg.rpcconnect, "10.0.0.2:18334");
        assert_eq!(cfg.keypool_size, 7);
        // untouched on the command line, so the file wins
        assert_eq!(cfg.debug_level, "debug");
    }

    #[test]
    fn mainnet_switches_default_ports() {
        let args = Args {
            mainnet: true,
            ..Args::default()
        };
        let cfg = resolve(args, FileConfig::default());
        assert_eq!(cfg.network, Network::Mainnet);
        assert_eq!(cfg.rpcconnect, "localhost:8334");
    }

    #[test]
    fn invalid_debug_level_is_a_config_error() {
        let args = Args {
            debuglevel: Some("chatty".into()),
            ..Args::default()
        };
        assert!(Config::resolve(args, FileConfig::default(), Path::new("/tmp")).is_err());
    }

    #[test]
    fn profile_port_range_is_validated() {
        let args = Args {
            profile: Some(80),
            ..Args::default()
        };
        assert!(Config::resolve(args, FileConfig::default(), Path::new("/tmp")).is_err());
    }

    #[test]
    fn listener_addresses_are_normalized_and_deduped() {
        let args = Args {
            rpclisten: vec!["127.0.0.1".into(), "127.0.0.1:18332".into()],
            ..Args::default()
        };
        let cfg = resolve(args, FileConfig::default());
        assert_eq!(cfg.rpclisten, vec!["127.0.0.1:18332".to_owned()]);
    }

    #[test]
    fn critical_maps_to_error_filter() {
        let args = Args {
            debuglevel: Some("critical".into()),
            ..Args::default()
        };
        let cfg = resolve(args, FileConfig::default());
        assert_eq!(cfg.tracing_filter(), "error");
    }
}
