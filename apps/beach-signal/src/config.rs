use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Args;

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to bind the HTTP/websocket listener to.
    #[arg(long, env = "BEACH_SIGNAL_LISTEN_ADDR", default_value = "0.0.0.0:8181")]
    pub listen_addr: String,

    /// Shared secret every client must present to be admitted.
    #[arg(
        long,
        env = "BEACH_SIGNAL_SHARED_SECRET",
        default_value = "x",
        hide_env_values = true
    )]
    pub shared_secret: String,

    /// Maximum time a client has to send its connect frame.
    #[arg(long, env = "BEACH_SIGNAL_HANDSHAKE_TIMEOUT_SECS", default_value_t = 5)]
    pub handshake_timeout_secs: u64,

    /// Expire unanswered offers after this many seconds. Offers never expire when unset.
    #[arg(long, env = "BEACH_SIGNAL_OFFER_TTL_SECS")]
    pub offer_ttl_secs: Option<u64>,

    /// How often the expiry sweep runs.
    #[arg(long, env = "BEACH_SIGNAL_SWEEP_INTERVAL_SECS", default_value_t = 30)]
    pub sweep_interval_secs: u64,

    /// PEM certificate chain. Serves HTTPS/WSS when given together with `--tls-key`.
    #[arg(long, env = "BEACH_SIGNAL_TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key matching `--tls-cert`.
    #[arg(long, env = "BEACH_SIGNAL_TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// Directory of static files (the built web client) served for unmatched paths.
    #[arg(long, env = "BEACH_SIGNAL_STATIC_DIR")]
    pub static_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub shared_secret: String,
    pub handshake_timeout: Duration,
    pub offer_ttl: Option<Duration>,
    pub sweep_interval: Duration,
    pub tls: Option<TlsPaths>,
    pub static_dir: Option<PathBuf>,
}

impl TryFrom<ServeArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        if args.shared_secret.is_empty() {
            bail!("shared secret must not be empty");
        }
        if args.handshake_timeout_secs == 0 {
            bail!("handshake timeout must be greater than zero");
        }
        if args.sweep_interval_secs == 0 {
            bail!("sweep interval must be greater than zero");
        }
        let offer_ttl = match args.offer_ttl_secs {
            Some(0) => bail!("offer ttl must be greater than zero"),
            other => other.map(Duration::from_secs),
        };

        let tls = match (args.tls_cert, args.tls_key) {
            (Some(cert), Some(key)) => Some(TlsPaths { cert, key }),
            (None, None) => None,
            _ => bail!("--tls-cert and --tls-key must be given together"),
        };
        if let Some(dir) = &args.static_dir {
            if !dir.is_dir() {
                bail!("static dir {} is not a directory", dir.display());
            }
        }

        Ok(ServerConfig {
            listen_addr,
            shared_secret: args.shared_secret,
            handshake_timeout: Duration::from_secs(args.handshake_timeout_secs),
            offer_ttl,
            sweep_interval: Duration::from_secs(args.sweep_interval_secs),
            tls,
            static_dir: args.static_dir,
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8181)),
            shared_secret: "x".to_string(),
            handshake_timeout: Duration::from_secs(5),
            offer_ttl: None,
            sweep_interval: Duration::from_secs(30),
            tls: None,
            static_dir: None,
        }
    }
}
