use crate::classifier::{Classifier, Handler};
use crate::keylog::KeyMaterial;
use crate::ordering::OrderingMode;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::level_filters::LevelFilter;

#[derive(Parser, Debug)]
#[command(name = "replaycrab")]
#[command(about = "Convert HTTP and HTTPS exchanges in a packet capture into flow records")]
pub struct Cli {
    /// Input capture (pcap or pcapng)
    pub capture: PathBuf,

    /// TLS key log (CLIENT_RANDOM or RSA Session-ID lines)
    #[arg(short, long)]
    pub keylog: Option<PathBuf>,

    /// Output file for JSON lines; `-` writes to stdout
    #[arg(short, long, default_value = "-")]
    pub output: String,

    /// Emit flows as streams complete instead of sorting by timestamp
    #[arg(long)]
    pub stream: bool,

    /// Additional port carrying HTTP over TLS
    #[arg(long = "tls-port", value_name = "PORT")]
    pub tls_ports: Vec<u16>,

    /// Port always parsed as plain HTTP
    #[arg(long = "http-port", value_name = "PORT")]
    pub http_ports: Vec<u16>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: LevelFilter,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    Stdout,
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub capture: PathBuf,
    pub keylog: Option<PathBuf>,
    pub output: OutputTarget,
    pub mode: OrderingMode,
    pub tls_ports: Vec<u16>,
    pub http_ports: Vec<u16>,
    pub log_target: LogTarget,
    pub log_level: LevelFilter,
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        let output = if cli.output == "-" {
            OutputTarget::Stdout
        } else {
            OutputTarget::File(PathBuf::from(cli.output))
        };
        let log_target = match cli.log_file {
            Some(path) => LogTarget::File(path),
            None => LogTarget::Stderr,
        };
        Self {
            capture: cli.capture,
            keylog: cli.keylog,
            output,
            mode: OrderingMode::from_stream_flag(cli.stream),
            tls_ports: cli.tls_ports,
            http_ports: cli.http_ports,
            log_target,
            log_level: cli.log_level,
        }
    }
}

impl Config {
    /// Builds the port table: the reserved TLS ports plus any configured
    /// overrides. Plain HTTP overrides win over TLS ones for the same port.
    pub fn classifier(&self, keys: Arc<KeyMaterial>) -> Classifier {
        let mut classifier = Classifier::new(Arc::clone(&keys));
        for &port in &self.tls_ports {
            classifier.register(port, Handler::Encrypted(Arc::clone(&keys)));
        }
        for &port in &self.http_ports {
            classifier.register(port, Handler::Plaintext);
        }
        classifier
    }
}
