//! TLS key material loaded once at startup.
//!
//! Two line formats are understood:
//! - NSS key log: `CLIENT_RANDOM <64 hex> <96 hex>`
//! - session-id dumps: `RSA Session-ID:<hex> Master-Key:<96 hex>`
//!
//! TLS 1.3 secret labels are recognised and skipped; only TLS 1.2 master
//! secrets can be used for decryption.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};


pub type MasterSecret = [u8; 48];

const TLS13_LABELS: &[&str] = &[
    "CLIENT_HANDSHAKE_TRAFFIC_SECRET",
    "SERVER_HANDSHAKE_TRAFFIC_SECRET",
    "CLIENT_TRAFFIC_SECRET_0",
    "SERVER_TRAFFIC_SECRET_0",
    "EXPORTER_SECRET",
    "EARLY_EXPORTER_SECRET",
    "CLIENT_EARLY_TRAFFIC_SECRET",
];

/// Why a key log line was skipped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyLogError {
    #[error("invalid hex at line {line}: {message}")]
    InvalidHex { line: usize, message: String },

    #[error("invalid format at line {line}: {message}")]
    InvalidFormat { line: usize, message: String },

    #[error("unknown key type at line {line}: {key_type}")]
    UnknownKeyType { line: usize, key_type: String },
}

#[derive(Debug, Clone, Default)]
pub struct KeyMaterial {
    by_client_random: HashMap<[u8; 32], MasterSecret>,
    by_session_id: HashMap<Vec<u8>, MasterSecret>,
}

#[derive(Debug, PartialEq, Eq)]
enum KeyLine {
    ClientRandom([u8; 32], MasterSecret),
    SessionId(Vec<u8>, MasterSecret),
    Ignored,
}

impl KeyMaterial {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read key material {path:?}"))?;
        let keys = Self::parse(&content);
        info!(
            path = ?path,
            client_randoms = keys.by_client_random.len(),
            session_ids = keys.by_session_id.len(),
            "Loaded TLS key material"
        );
        Ok(keys)
    }

    /// Malformed lines are logged and skipped so one bad entry does not cost
    /// every other session its keys.
    pub fn parse(content: &str) -> Self {
        let mut keys = Self::default();
        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_line(line, index + 1) {
                Ok(KeyLine::ClientRandom(random, secret)) => {
                    keys.by_client_random.insert(random, secret);
                }
                Ok(KeyLine::SessionId(id, secret)) => {
                    keys.by_session_id.insert(id, secret);
                }
                Ok(KeyLine::Ignored) => {
                    debug!(line = index + 1, "Skipping unsupported key log entry");
                }
                Err(error) => {
                    warn!(error = %error, "Skipping malformed key log entry");
                }
            }
        }
        keys
    }

    pub fn insert_client_random(&mut self, client_random: [u8; 32], secret: MasterSecret) {
        self.by_client_random.insert(client_random, secret);
    }

    pub fn insert_session_id(&mut self, session_id: Vec<u8>, secret: MasterSecret) {
        self.by_session_id.insert(session_id, secret);
    }

    /// Looks up by client random first, then by session id.
    pub fn master_secret(
        &self,
        client_random: &[u8; 32],
        session_id: Option<&[u8]>,
    ) -> Option<&MasterSecret> {
        self.by_client_random.get(client_random).or_else(|| {
            session_id
                .filter(|id| !id.is_empty())
                .and_then(|id| self.by_session_id.get(id))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.by_client_random.is_empty() && self.by_session_id.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_client_random.len() + self.by_session_id.len()
    }
}

fn parse_line(text: &str, line: usize) -> Result<KeyLine, KeyLogError> {
    if let Some(rest) = text.strip_prefix("RSA Session-ID:") {
        let (session_hex, master_hex) = rest
            .split_once("Master-Key:")
            .ok_or_else(|| KeyLogError::InvalidFormat {
                line,
                message: "missing Master-Key field".to_string(),
            })?;
        let session_id = decode_hex(session_hex.trim(), line)?;
        let secret = decode_fixed::<48>(master_hex.trim(), line)?;
        return Ok(KeyLine::SessionId(session_id, secret));
    }

    let parts: Vec<&str> = text.split_whitespace().collect();
    if parts.len() != 3 {
        return Err(KeyLogError::InvalidFormat {
            line,
            message: format!("expected 3 space-separated fields, got {}", parts.len()),
        });
    }

    match parts[0] {
        "CLIENT_RANDOM" => Ok(KeyLine::ClientRandom(
            decode_fixed::<32>(parts[1], line)?,
            decode_fixed::<48>(parts[2], line)?,
        )),
        label if TLS13_LABELS.contains(&label) => Ok(KeyLine::Ignored),
        label => Err(KeyLogError::UnknownKeyType {
            line,
            key_type: label.to_string(),
        }),
    }
}

fn decode_fixed<const N: usize>(hex: &str, line: usize) -> Result<[u8; N], KeyLogError> {
    let bytes = decode_hex(hex, line)?;
    bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| KeyLogError::InvalidHex {
            line,
            message: format!("expected {N} bytes, got {}", bytes.len()),
        })
}

fn decode_hex(hex: &str, line: usize) -> Result<Vec<u8>, KeyLogError> {
    if hex.len() % 2 != 0 {
        return Err(KeyLogError::InvalidHex {
            line,
            message: "hex string has odd length".to_string(),
        });
    }
    hex.as_bytes()
        .chunks(2)
        .map(|pair| match (hex_digit(pair[0]), hex_digit(pair[1])) {
            (Some(high), Some(low)) => Ok(high << 4 | low),
            _ => Err(KeyLogError::InvalidHex {
                line,
                message: format!("invalid hex digits {:?}", String::from_utf8_lossy(pair)),
            }),
        })
        .collect()
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}
