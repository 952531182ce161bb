//! Body length rules for HTTP/1.x messages (RFC 7230 §3.3.3).

use super::{ParseError, RequestHead, ResponseHead};
use crate::flow::Header;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(usize),
    Chunked,
    /// No length information: the body runs to the end of the stream.
    UntilClose,
}

/// Requests never read until close; without framing headers the body is empty.
/// `Expect: 100-continue` does not change the framing, so a body that follows
/// the interim response is kept.
pub fn request_framing(request: &RequestHead) -> Result<BodyFraming, ParseError> {
    if request.method.eq_ignore_ascii_case("CONNECT") {
        return Ok(BodyFraming::Empty);
    }
    Ok(header_framing(&request.headers)?.unwrap_or(BodyFraming::Empty))
}

pub fn response_framing(
    request: &RequestHead,
    response: &ResponseHead,
) -> Result<BodyFraming, ParseError> {
    let status = response.status_code;
    if request.method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304
        || ((200..300).contains(&status) && request.method.eq_ignore_ascii_case("CONNECT"))
    {
        return Ok(BodyFraming::Empty);
    }
    Ok(header_framing(&response.headers)?.unwrap_or(BodyFraming::UntilClose))
}

fn header_framing(headers: &[Header]) -> Result<Option<BodyFraming>, ParseError> {
    let chunked = headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case("transfer-encoding"))
        .any(|h| h.value.to_ascii_lowercase().contains("chunked"));
    if chunked {
        return Ok(Some(BodyFraming::Chunked));
    }

    let mut length: Option<usize> = None;
    for header in headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case("content-length"))
    {
        for value in header.value.split(',') {
            let value = value.trim();
            let parsed = value
                .parse::<usize>()
                .map_err(|_| ParseError::InvalidContentLength(value.to_string()))?;
            match length {
                Some(existing) if existing != parsed => {
                    return Err(ParseError::ConflictingContentLength);
                }
                _ => length = Some(parsed),
            }
        }
    }

    Ok(length.map(BodyFraming::Length))
}

#[derive(Debug, Default)]
pub struct Body {
    pub data: Vec<u8>,
    pub trailers: Vec<Header>,
    pub consumed: usize,
}

pub fn read_body(buf: &[u8], framing: BodyFraming) -> Result<Body, ParseError> {
    match framing {
        BodyFraming::Empty => Ok(Body::default()),
        BodyFraming::Length(expected) => {
            if buf.len() < expected {
                return Err(ParseError::TruncatedBody {
                    expected,
                    available: buf.len(),
                });
            }
            Ok(Body {
                data: buf[..expected].to_vec(),
                trailers: Vec::new(),
                consumed: expected,
            })
        }
        BodyFraming::UntilClose => Ok(Body {
            data: buf.to_vec(),
            trailers: Vec::new(),
            consumed: buf.len(),
        }),
        BodyFraming::Chunked => read_chunked(buf),
    }
}

fn read_chunked(buf: &[u8]) -> Result<Body, ParseError> {
    let mut body = Body::default();
    let mut pos = 0;

    loop {
        let (line, next) = read_line(buf, pos)
            .ok_or_else(|| ParseError::InvalidChunk("truncated chunk size line".to_string()))?;
        let line = String::from_utf8_lossy(line);
        let size_field = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_field, 16)
            .map_err(|_| ParseError::InvalidChunk(format!("invalid chunk size {size_field:?}")))?;
        pos = next;

        if size == 0 {
            break;
        }

        let available = buf.len() - pos;
        if available < size {
            return Err(ParseError::TruncatedBody {
                expected: size,
                available,
            });
        }
        body.data.extend_from_slice(&buf[pos..pos + size]);
        pos += size;

        let rest = &buf[pos..];
        if rest.starts_with(b"\r\n") {
            pos += 2;
        } else if rest.starts_with(b"\n") {
            pos += 1;
        } else {
            return Err(ParseError::InvalidChunk(
                "missing line break after chunk data".to_string(),
            ));
        }
    }

    // A capture cut right after the last chunk still carries a complete body.
    while let Some((line, next)) = read_line(buf, pos) {
        pos = next;
        if line.is_empty() {
            body.consumed = pos;
            return Ok(body);
        }
        let line = String::from_utf8_lossy(line);
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ParseError::InvalidChunk(format!("malformed trailer {line:?}")))?;
        body.trailers.push(Header {
            name: name.trim().to_string(),
            value: value.trim().to_string(),
        });
    }

    body.consumed = buf.len();
    Ok(body)
}

/// Returns the line starting at `pos` without its terminator, and the offset
/// just past the terminator.
fn read_line(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let rest = buf.get(pos..)?;
    let newline = rest.iter().position(|&b| b == b'\n')?;
    let line = &rest[..newline];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    Some((line, pos + newline + 1))
}
