use anyhow::bail;
use clap::Parser;
use grpc_framework::config::{ServerConfig, TlsConfig, TransportKind};
use grpc_framework::rate_limit::{
    CallerTokenBuckets, DEFAULT_CALLER_RATE_LIMIT, DEFAULT_RATE_LIMIT, TokenBucket,
};

/// Runtime configuration for the `grpc-framework-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a
/// `.env` file is loaded first), with defaults suitable for local use.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "grpc-framework-server",
    version,
    about = "A gRPC server with admission control, interceptors and health checks"
)]
pub struct CliArgs {
    /// Name used in logs.
    ///
    /// Environment variable: `SERVER_NAME`
    #[arg(long, env = "SERVER_NAME")]
    pub name: Option<String>,

    /// Address to listen on (TCP or Unix socket path; use --uds for Unix socket).
    ///
    /// Example: "0.0.0.0:50051" or "/tmp/grpc-framework.sock"
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:50051"))]
    pub server_addr: String,

    /// Listen on a Unix socket instead of TCP. If set, `SERVER_ADDR` must be a file path.
    #[arg(short, long, default_value_t = false)]
    pub uds: bool,

    /// PEM certificate chain. Requires `--tls-key`; ignored for Unix sockets.
    ///
    /// Environment variable: `TLS_CERT_FILE`
    #[arg(long, env = "TLS_CERT_FILE", requires = "tls_key")]
    pub tls_cert: Option<String>,

    /// PEM private key. Requires `--tls-cert`.
    ///
    /// Environment variable: `TLS_KEY_FILE`
    #[arg(long, env = "TLS_KEY_FILE", requires = "tls_cert")]
    pub tls_key: Option<String>,

    /// Calls per second admitted across all callers. Zero disables the global
    /// limiter.
    ///
    /// Environment variable: `RATE_LIMIT`
    #[arg(long, env = "RATE_LIMIT", default_value_t = DEFAULT_RATE_LIMIT.0)]
    pub rate_limit: f64,

    /// Burst size of the global limiter.
    ///
    /// Environment variable: `RATE_BURST`
    #[arg(long, env = "RATE_BURST", default_value_t = DEFAULT_RATE_LIMIT.1)]
    pub rate_burst: u32,

    /// Calls per second admitted per caller address. Zero disables the
    /// per-caller limiter.
    ///
    /// Environment variable: `CALLER_RATE_LIMIT`
    #[arg(long, env = "CALLER_RATE_LIMIT", default_value_t = DEFAULT_CALLER_RATE_LIMIT.0)]
    pub caller_rate_limit: f64,

    /// Burst size of the per-caller limiter.
    ///
    /// Environment variable: `CALLER_RATE_BURST`
    #[arg(long, env = "CALLER_RATE_BURST", default_value_t = DEFAULT_CALLER_RATE_LIMIT.1)]
    pub caller_rate_burst: u32,

    /// Disable the `grpc.health.v1.Health` service.
    ///
    /// Environment variable: `NO_HEALTH`
    #[arg(long, env = "NO_HEALTH", default_value_t = false)]
    pub no_health: bool,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.rate_limit < 0.0 || args.caller_rate_limit < 0.0 {
            bail!("rate limits must not be negative");
        }
        if args.rate_limit > 0.0 && args.rate_burst == 0 {
            bail!("RATE_BURST must be greater than 0 when RATE_LIMIT is set");
        }
        if args.caller_rate_limit > 0.0 && args.caller_rate_burst == 0 {
            bail!("CALLER_RATE_BURST must be greater than 0 when CALLER_RATE_LIMIT is set");
        }

        let transport = if args.uds {
            TransportKind::Unix
        } else {
            TransportKind::Tcp
        };

        let mut builder = ServerConfig::builder()
            .transport(transport)
            .address(args.server_addr)
            .health(!args.no_health);

        if let Some(name) = args.name {
            builder = builder.name(name);
        }
        if let (Some(cert), Some(key)) = (args.tls_cert, args.tls_key) {
            builder = builder.tls(TlsConfig::new(cert, key));
        }
        if args.rate_limit > 0.0 {
            builder = builder.rate_limiter(TokenBucket::new(args.rate_limit, args.rate_burst));
        }
        if args.caller_rate_limit > 0.0 {
            builder = builder.caller_rate_limiter(CallerTokenBuckets::new(
                args.caller_rate_limit,
                args.caller_rate_burst,
            ));
        }

        Ok(builder.build()?)
    }
}
