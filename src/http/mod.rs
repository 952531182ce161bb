//! HTTP/1.x exchange parsing.
//!
//! Requests in the client bytes are paired in order with final responses in
//! the server bytes, so a keep-alive connection yields one exchange per
//! round trip. Request and response failures are handled differently: a
//! request that does not parse ends the stream without a flow, while a broken
//! response only degrades the flow it belongs to and ends the stream after it.

use crate::flow::{Endpoint, Header, ProtocolTag, RawExchange, RequestRecord, ResponseRecord, ResponseSlot};
use httparse::{EMPTY_HEADER, Status};
use thiserror::Error;

pub mod framing;

#[cfg(test)]
mod tests;

use framing::{read_body, request_framing, response_framing};

/// Maximum number of headers accepted per message head.
const MAX_HEADERS: usize = 100;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("incomplete message head")]
    IncompleteHead,
    #[error("malformed message head: {0}")]
    Malformed(#[from] httparse::Error),
    #[error("unparseable content-length {0:?}")]
    InvalidContentLength(String),
    #[error("conflicting content-length headers")]
    ConflictingContentLength,
    #[error("body truncated: expected {expected} bytes, {available} available")]
    TruncatedBody { expected: usize, available: usize },
    #[error("invalid chunked encoding: {0}")]
    InvalidChunk(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetForm {
    Origin,
    Absolute,
    Authority,
    Asterisk,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: u8,
    pub headers: Vec<Header>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: u8,
    pub status_code: u16,
    pub reason: String,
    pub headers: Vec<Header>,
}

#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub head: RequestHead,
    pub body: Vec<u8>,
    pub trailers: Vec<Header>,
    pub consumed: usize,
}

#[derive(Debug, Clone)]
pub struct ParsedResponse {
    pub head: ResponseHead,
    pub body: Vec<u8>,
    pub trailers: Vec<Header>,
    pub consumed: usize,
}

#[derive(Debug)]
pub enum ResponseFailure {
    Head(ParseError),
    Body { head: ResponseHead, error: ParseError },
}

/// One request and the response paired with it.
#[derive(Debug, Clone)]
pub struct ParsedExchange {
    /// Start of the exchange: the connection start for the first exchange,
    /// the capture time of the request's first segment for later ones.
    pub timestamp: f64,
    pub request: RequestRecord,
    pub response: ResponseSlot,
}

/// Every exchange found in one stream, in order.
#[derive(Debug)]
pub struct ParsedStream {
    pub exchanges: Vec<ParsedExchange>,
    /// The request that stopped parsing, if one failed.
    pub request_error: Option<ParseError>,
    /// Client bytes not consumed by any exchange.
    pub trailing_sent: usize,
}

pub fn parse_request(buf: &[u8]) -> Result<ParsedRequest, ParseError> {
    let mut headers = [EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    let head_len = match request.parse(buf)? {
        Status::Complete(len) => len,
        Status::Partial => return Err(ParseError::IncompleteHead),
    };

    let head = RequestHead {
        method: request.method.ok_or(ParseError::IncompleteHead)?.to_string(),
        target: request.path.ok_or(ParseError::IncompleteHead)?.to_string(),
        version: request.version.ok_or(ParseError::IncompleteHead)?,
        headers: collect_headers(request.headers),
    };

    let framing = request_framing(&head)?;
    let body = read_body(&buf[head_len..], framing)?;

    Ok(ParsedRequest {
        head,
        body: body.data,
        trailers: body.trailers,
        consumed: head_len + body.consumed,
    })
}

/// Interim 1xx responses (other than 101) are skipped; the first final
/// response is returned.
pub fn parse_response(buf: &[u8], request: &RequestHead) -> Result<ParsedResponse, ResponseFailure> {
    let mut offset = 0;
    loop {
        let (head, head_len) = parse_response_head(&buf[offset..]).map_err(ResponseFailure::Head)?;
        offset += head_len;

        if (100..200).contains(&head.status_code) && head.status_code != 101 {
            continue;
        }

        let body = response_framing(request, &head)
            .and_then(|framing| read_body(&buf[offset..], framing));
        return match body {
            Ok(body) => Ok(ParsedResponse {
                head,
                body: body.data,
                trailers: body.trailers,
                consumed: offset + body.consumed,
            }),
            Err(error) => Err(ResponseFailure::Body { head, error }),
        };
    }
}

fn parse_response_head(buf: &[u8]) -> Result<(ResponseHead, usize), ParseError> {
    let mut headers = [EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    let head_len = match response.parse(buf)? {
        Status::Complete(len) => len,
        Status::Partial => return Err(ParseError::IncompleteHead),
    };

    let head = ResponseHead {
        version: response.version.ok_or(ParseError::IncompleteHead)?,
        status_code: response.code.ok_or(ParseError::IncompleteHead)?,
        reason: response.reason.unwrap_or_default().to_string(),
        headers: collect_headers(response.headers),
    };
    Ok((head, head_len))
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> Vec<Header> {
    headers
        .iter()
        .filter(|h| !h.name.is_empty())
        .map(|h| Header {
            name: h.name.to_string(),
            value: String::from_utf8_lossy(h.value).into_owned(),
        })
        .collect()
}

/// Parses every exchange in `raw`. Parsing stops at the first request that
/// fails, or after the first exchange whose response is degraded.
pub fn parse_stream(raw: &RawExchange) -> ParsedStream {
    let mut exchanges = Vec::new();
    let mut request_error = None;
    let mut sent_at = 0;
    let mut received_at = 0;

    while exchanges.is_empty() || sent_at < raw.sent.len() {
        if !exchanges.is_empty() && raw.sent[sent_at..].iter().all(u8::is_ascii_whitespace) {
            break;
        }
        let request = match parse_request(&raw.sent[sent_at..]) {
            Ok(request) => request,
            Err(error) => {
                request_error = Some(error);
                break;
            }
        };
        let timestamp = if exchanges.is_empty() {
            raw.timestamp
        } else {
            raw.sent_times.at(sent_at).unwrap_or(raw.timestamp)
        };
        sent_at += request.consumed;
        let request_end = raw.sent_times.at(sent_at - 1).or(raw.sent_last);

        let mut switched = false;
        let response = match parse_response(&raw.received[received_at..], &request.head) {
            Ok(response) => {
                switched = response.head.switches_protocol(&request.head);
                received_at += response.consumed;
                let response_end = received_at
                    .checked_sub(1)
                    .and_then(|last| raw.received_times.at(last))
                    .or(raw.received_last);
                ResponseSlot::Complete(response.into_record(timestamp, response_end))
            }
            Err(ResponseFailure::Body { head, error }) => ResponseSlot::Truncated {
                response: head.into_record(Vec::new(), Vec::new(), timestamp, raw.received_last),
                reason: error.to_string(),
            },
            Err(ResponseFailure::Head(error)) => ResponseSlot::Absent {
                reason: error.to_string(),
            },
        };
        let degraded = response.is_degraded();

        exchanges.push(ParsedExchange {
            timestamp,
            request: request.into_record(raw.protocol, raw.key.destination, timestamp, request_end),
            response,
        });
        if degraded || switched {
            break;
        }
    }

    ParsedStream {
        exchanges,
        request_error,
        trailing_sent: raw.sent.len() - sent_at,
    }
}

impl RequestHead {
    pub fn target_form(&self) -> TargetForm {
        if self.target == "*" {
            TargetForm::Asterisk
        } else if self.method.eq_ignore_ascii_case("CONNECT") {
            TargetForm::Authority
        } else if !self.target.starts_with('/') && self.target.contains("://") {
            TargetForm::Absolute
        } else {
            TargetForm::Origin
        }
    }

    /// Splits the request target into an optional authority and a path.
    pub fn split_target(&self) -> (Option<String>, String) {
        match self.target_form() {
            TargetForm::Origin | TargetForm::Asterisk => (None, self.target.clone()),
            TargetForm::Authority => (Some(self.target.clone()), String::new()),
            TargetForm::Absolute => {
                let after_scheme = self
                    .target
                    .split_once("://")
                    .map(|(_, rest)| rest)
                    .unwrap_or(&self.target);
                let path_start = after_scheme
                    .find(['/', '?'])
                    .unwrap_or(after_scheme.len());
                let (authority, path) = after_scheme.split_at(path_start);
                let path = if path.starts_with('/') {
                    path.to_string()
                } else {
                    format!("/{path}")
                };
                (Some(authority.to_string()), path)
            }
        }
    }
}

impl ParsedRequest {
    /// Builds the record in one step. Host and port always come from the
    /// reconstructed connection and the scheme from the stream's protocol
    /// tag, whatever the request line claims.
    pub fn into_record(
        self,
        scheme: ProtocolTag,
        destination: Endpoint,
        timestamp_start: f64,
        timestamp_end: Option<f64>,
    ) -> RequestRecord {
        let (authority, path) = self.head.split_target();
        RequestRecord {
            method: self.head.method,
            scheme,
            host: destination.ip.to_string(),
            port: destination.port,
            path,
            authority,
            http_version: http_version(self.head.version),
            headers: self.head.headers,
            body: self.body,
            trailers: self.trailers,
            timestamp_start,
            timestamp_end,
        }
    }
}

impl ParsedResponse {
    pub fn into_record(self, timestamp_start: f64, timestamp_end: Option<f64>) -> ResponseRecord {
        self.head
            .into_record(self.body, self.trailers, timestamp_start, timestamp_end)
    }
}

impl ResponseHead {
    /// After a protocol upgrade or an accepted CONNECT the connection no
    /// longer carries HTTP.
    pub fn switches_protocol(&self, request: &RequestHead) -> bool {
        self.status_code == 101
            || (request.method.eq_ignore_ascii_case("CONNECT")
                && (200..300).contains(&self.status_code))
    }

    pub fn into_record(
        self,
        body: Vec<u8>,
        trailers: Vec<Header>,
        timestamp_start: f64,
        timestamp_end: Option<f64>,
    ) -> ResponseRecord {
        ResponseRecord {
            http_version: http_version(self.version),
            status_code: self.status_code,
            reason: self.reason,
            headers: self.headers,
            body,
            trailers,
            timestamp_start,
            timestamp_end,
        }
    }
}

fn http_version(minor: u8) -> String {
    format!("HTTP/1.{minor}")
}

/// Cheap check used by the generic handler: does the client open with
/// something shaped like an HTTP request line?
pub fn looks_like_request(buf: &[u8]) -> bool {
    let line_end = buf
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or(buf.len())
        .min(8192);
    let line = &buf[..line_end];
    let mut parts = line.splitn(3, |&b| b == b' ');
    let method = parts.next().unwrap_or_default();
    let target = parts.next();
    !method.is_empty()
        && method.len() <= 16
        && method.iter().all(|b| b.is_ascii_uppercase())
        && target.is_some_and(|t| !t.is_empty())
        && parts.next().is_some_and(|v| v.starts_with(b"HTTP/"))
}
