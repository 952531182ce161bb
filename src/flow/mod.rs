use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;

use crate::identity::FlowId;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IPAddress {
    V4([u8; 4]),
    V6([u8; 16]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Endpoint {
    pub ip: IPAddress,
    pub port: u16,
}

/// The 4-tuple of one reassembled stream. `source` is the side that opened
/// the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionKey {
    pub source: Endpoint,
    pub destination: Endpoint,
}

/// Tag assigned by the handler that produced a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolTag {
    Http,
    Https,
    Tls,
    Tcp,
}

/// Capture times of the bytes of one direction. Each mark is the offset a
/// segment's data starts at and the time that segment was captured; offsets
/// are strictly increasing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timeline {
    marks: Vec<(usize, f64)>,
}

/// One completed stream as handed over by a stream source.
#[derive(Debug, Clone)]
pub struct RawExchange {
    pub key: ConnectionKey,
    pub timestamp: f64,
    pub protocol: ProtocolTag,
    pub sent: Vec<u8>,
    pub received: Vec<u8>,
    pub sent_last: Option<f64>,
    pub received_last: Option<f64>,
    pub sent_times: Timeline,
    pub received_times: Timeline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestRecord {
    pub method: String,
    pub scheme: ProtocolTag,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub authority: Option<String>,
    pub http_version: String,
    pub headers: Vec<Header>,
    #[serde(serialize_with = "serialize_body")]
    pub body: Vec<u8>,
    pub trailers: Vec<Header>,
    pub timestamp_start: f64,
    pub timestamp_end: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseRecord {
    pub http_version: String,
    pub status_code: u16,
    pub reason: String,
    pub headers: Vec<Header>,
    #[serde(serialize_with = "serialize_body")]
    pub body: Vec<u8>,
    pub trailers: Vec<Header>,
    pub timestamp_start: f64,
    pub timestamp_end: Option<f64>,
}

/// Outcome of parsing the server side of an exchange.
///
/// A request that parsed is always emitted, so a broken response is carried
/// along instead of discarding the flow.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ResponseSlot {
    Complete(ResponseRecord),
    /// The head parsed but the body could not be read; `response.body` is empty.
    Truncated {
        response: ResponseRecord,
        reason: String,
    },
    Absent {
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub endpoint: Endpoint,
    pub timestamp_start: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowRecord {
    pub id: FlowId,
    pub client: ConnectionInfo,
    pub server: ConnectionInfo,
    pub request: RequestRecord,
    pub response: ResponseSlot,
}

impl fmt::Display for IPAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IPAddress::V4(bytes) => {
                write!(f, "{}.{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3])
            }
            IPAddress::V6(bytes) => {
                let segments: Vec<String> = bytes
                    .chunks(2)
                    .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
                    .map(|segment| format!("{:x}", segment))
                    .collect();
                write!(f, "{}", segments.join(":"))
            }
        }
    }
}

impl Serialize for IPAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl Ord for IPAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (IPAddress::V4(a), IPAddress::V4(b)) => a.cmp(b),
            (IPAddress::V4(_), IPAddress::V6(_)) => Ordering::Less,
            (IPAddress::V6(_), IPAddress::V4(_)) => Ordering::Greater,
            (IPAddress::V6(a), IPAddress::V6(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for IPAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Endpoint {
    pub fn new(ip: IPAddress, port: u16) -> Self {
        Self { ip, port }
    }
}

impl Ord for Endpoint {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.ip.cmp(&other.ip) {
            Ordering::Equal => self.port.cmp(&other.port),
            ord => ord,
        }
    }
}

impl PartialOrd for Endpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IPAddress::V4(_) => write!(f, "{}:{}", self.ip, self.port),
            IPAddress::V6(_) => write!(f, "[{}]:{}", self.ip, self.port),
        }
    }
}

impl ConnectionKey {
    pub fn new(source: Endpoint, destination: Endpoint) -> Self {
        Self {
            source,
            destination,
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} → {}", self.source, self.destination)
    }
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks that data from `offset` on arrived at `timestamp`. Marks that do
    /// not move past the previous offset are ignored.
    pub fn push(&mut self, offset: usize, timestamp: f64) {
        if self.marks.last().is_some_and(|&(last, _)| last >= offset) {
            return;
        }
        self.marks.push((offset, timestamp));
    }

    /// Time the byte at `offset` was captured.
    pub fn at(&self, offset: usize) -> Option<f64> {
        let after = self.marks.partition_point(|&(start, _)| start <= offset);
        after.checked_sub(1).map(|index| self.marks[index].1)
    }

    /// Rebuilds the timeline for derived data. Each `(derived, source)` pair
    /// says derived bytes from `derived` on came from source byte `source`.
    pub fn remap(&self, offsets: &[(usize, usize)]) -> Self {
        let mut remapped = Self::new();
        for &(derived, source) in offsets {
            if let Some(timestamp) = self.at(source) {
                remapped.push(derived, timestamp);
            }
        }
        remapped
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }
}

impl ProtocolTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolTag::Http => "http",
            ProtocolTag::Https => "https",
            ProtocolTag::Tls => "tls",
            ProtocolTag::Tcp => "tcp",
        }
    }

    /// Only HTTP and HTTP-over-TLS streams turn into flows.
    pub fn is_application(&self) -> bool {
        matches!(self, ProtocolTag::Http | ProtocolTag::Https)
    }
}

impl fmt::Display for ProtocolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ResponseSlot {
    /// Body that feeds the flow identity; empty unless the response parsed fully.
    pub fn identity_body(&self) -> &[u8] {
        match self {
            ResponseSlot::Complete(response) => &response.body,
            _ => &[],
        }
    }

    pub fn record(&self) -> Option<&ResponseRecord> {
        match self {
            ResponseSlot::Complete(response) | ResponseSlot::Truncated { response, .. } => {
                Some(response)
            }
            ResponseSlot::Absent { .. } => None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        !matches!(self, ResponseSlot::Complete(_))
    }
}

impl FlowRecord {
    pub fn timestamp(&self) -> f64 {
        self.client.timestamp_start
    }
}

impl fmt::Display for FlowRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self.response.record() {
            Some(response) => response.status_code.to_string(),
            None => "-".to_string(),
        };
        write!(
            f,
            "{} {} {}://{}:{}{} {}",
            self.id,
            self.request.method,
            self.request.scheme,
            self.request.host,
            self.request.port,
            self.request.path,
            status
        )
    }
}

fn serialize_body<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(body))
}
