use super::framing::{BodyFraming, request_framing, response_framing};
use super::*;
use crate::flow::{ConnectionKey, IPAddress, Timeline};

fn raw(sent: &[u8], received: &[u8]) -> RawExchange {
    RawExchange {
        key: ConnectionKey::new(
            Endpoint::new(IPAddress::V4([192, 168, 0, 10]), 51000),
            Endpoint::new(IPAddress::V4([93, 184, 216, 34]), 8080),
        ),
        timestamp: 1_000.5,
        protocol: ProtocolTag::Http,
        sent: sent.to_vec(),
        received: received.to_vec(),
        sent_last: Some(1_000.6),
        received_last: Some(1_000.9),
        sent_times: Timeline::new(),
        received_times: Timeline::new(),
    }
}

/// Parses a stream expected to hold exactly one exchange.
fn single(raw: &RawExchange) -> ParsedExchange {
    let mut parsed = parse_stream(raw);
    assert!(parsed.request_error.is_none(), "request failed: {:?}", parsed.request_error);
    assert_eq!(parsed.exchanges.len(), 1);
    parsed.exchanges.remove(0)
}

fn head(method: &str, target: &str) -> RequestHead {
    RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: 1,
        headers: Vec::new(),
    }
}

fn response_head(status_code: u16, headers: &[(&str, &str)]) -> ResponseHead {
    ResponseHead {
        version: 1,
        status_code,
        reason: String::new(),
        headers: headers
            .iter()
            .map(|(name, value)| Header {
                name: name.to_string(),
                value: value.to_string(),
            })
            .collect(),
    }
}

#[test]
fn parses_simple_get() {
    let parsed = parse_request(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .expect("parse request");

    assert_eq!(parsed.head.method, "GET");
    assert_eq!(parsed.head.target, "/index.html");
    assert_eq!(parsed.head.version, 1);
    assert_eq!(parsed.head.headers.len(), 1);
    assert!(parsed.body.is_empty());
}

#[test]
fn request_body_follows_content_length() {
    let parsed = parse_request(b"POST /f HTTP/1.1\r\nContent-Length: 5\r\n\r\nhelloEXTRA")
        .expect("parse request");

    assert_eq!(parsed.body, b"hello");
    assert_eq!(parsed.consumed, 44);
}

#[test]
fn request_without_framing_has_empty_body() {
    let parsed = parse_request(b"POST /f HTTP/1.0\r\n\r\nignored").expect("parse request");
    assert!(parsed.body.is_empty());
}

#[test]
fn request_headers_keep_order_and_duplicates() {
    let parsed = parse_request(b"GET / HTTP/1.1\r\nX-A: 1\r\nCookie: a\r\nCookie: b\r\n\r\n")
        .expect("parse request");
    let names: Vec<_> = parsed.head.headers.iter().map(|h| h.name.as_str()).collect();
    assert_eq!(names, ["X-A", "Cookie", "Cookie"]);
    assert_eq!(parsed.head.headers[2].value, "b");
}

#[test]
fn truncated_request_head_is_an_error() {
    let err = parse_request(b"GET /index.html HTTP/1.1\r\nHost: exa").unwrap_err();
    assert!(matches!(err, ParseError::IncompleteHead));
}

#[test]
fn garbage_request_is_malformed() {
    let err = parse_request(b"\x16\x03\x01\x02\x00\x01\x00\x01\xfc\x03\x03\r\n\r\n").unwrap_err();
    assert!(matches!(err, ParseError::Malformed(_)));
}

#[test]
fn truncated_request_body_is_an_error() {
    let err = parse_request(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc").unwrap_err();
    assert!(matches!(
        err,
        ParseError::TruncatedBody {
            expected: 10,
            available: 3
        }
    ));
}

#[test]
fn conflicting_content_lengths_are_rejected() {
    let err = parse_request(b"POST / HTTP/1.1\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\nabcd")
        .unwrap_err();
    assert!(matches!(err, ParseError::ConflictingContentLength));

    let parsed = parse_request(b"POST / HTTP/1.1\r\nContent-Length: 3, 3\r\n\r\nabc")
        .expect("repeated identical lengths are fine");
    assert_eq!(parsed.body, b"abc");
}

#[test]
fn unparseable_content_length_is_rejected() {
    let err = parse_request(b"POST / HTTP/1.1\r\nContent-Length: -1\r\n\r\n").unwrap_err();
    assert!(matches!(err, ParseError::InvalidContentLength(_)));
}

#[test]
fn chunked_request_body_is_decoded_with_trailers() {
    let parsed = parse_request(
        b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Sum: 9\r\n\r\n",
    )
    .expect("parse chunked");

    assert_eq!(parsed.body, b"Wikipedia");
    assert_eq!(parsed.trailers.len(), 1);
    assert_eq!(parsed.trailers[0].name, "X-Sum");
    assert_eq!(parsed.trailers[0].value, "9");
}

#[test]
fn chunked_body_tolerates_missing_final_line_break() {
    let parsed = parse_request(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nok\r\n0\r\n")
        .expect("parse chunked");
    assert_eq!(parsed.body, b"ok");
}

#[test]
fn truncated_chunk_is_an_error() {
    let err = parse_request(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\na\r\nshort")
        .unwrap_err();
    assert!(matches!(err, ParseError::TruncatedBody { .. }));

    let err = parse_request(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n").unwrap_err();
    assert!(matches!(err, ParseError::InvalidChunk(_)));
}

#[test]
fn request_framing_ignores_body_for_connect() {
    let mut connect = head("CONNECT", "example.com:443");
    connect.headers.push(Header {
        name: "Content-Length".to_string(),
        value: "10".to_string(),
    });
    assert_eq!(request_framing(&connect).unwrap(), BodyFraming::Empty);
}

#[test]
fn response_framing_rules() {
    let get = head("GET", "/");
    let head_req = head("HEAD", "/");
    let connect = head("CONNECT", "h:443");
    let sized = [("Content-Length", "12")];

    assert_eq!(
        response_framing(&head_req, &response_head(200, &sized)).unwrap(),
        BodyFraming::Empty
    );
    for status in [101, 204, 304] {
        assert_eq!(
            response_framing(&get, &response_head(status, &sized)).unwrap(),
            BodyFraming::Empty
        );
    }
    assert_eq!(
        response_framing(&connect, &response_head(200, &[])).unwrap(),
        BodyFraming::Empty
    );
    assert_eq!(
        response_framing(&get, &response_head(200, &sized)).unwrap(),
        BodyFraming::Length(12)
    );
    assert_eq!(
        response_framing(&get, &response_head(200, &[("Transfer-Encoding", "gzip, Chunked")])).unwrap(),
        BodyFraming::Chunked
    );
    assert_eq!(
        response_framing(&get, &response_head(200, &[])).unwrap(),
        BodyFraming::UntilClose
    );
}

#[test]
fn response_without_length_reads_to_end() {
    let request = head("GET", "/");
    let parsed = parse_response(b"HTTP/1.0 200 OK\r\nServer: x\r\n\r\nall of it", &request)
        .expect("parse response");
    assert_eq!(parsed.head.status_code, 200);
    assert_eq!(parsed.head.reason, "OK");
    assert_eq!(parsed.body, b"all of it");
}

#[test]
fn head_response_has_no_body() {
    let request = head("HEAD", "/");
    let parsed = parse_response(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n", &request)
        .expect("parse response");
    assert!(parsed.body.is_empty());
}

#[test]
fn interim_responses_are_skipped() {
    let request = head("POST", "/");
    let parsed = parse_response(
        b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok",
        &request,
    )
    .expect("parse response");
    assert_eq!(parsed.head.status_code, 201);
    assert_eq!(parsed.body, b"ok");
}

#[test]
fn response_failures_distinguish_head_and_body() {
    let request = head("GET", "/");

    match parse_response(b"HTTP/1.1 200 O", &request) {
        Err(ResponseFailure::Head(ParseError::IncompleteHead)) => {}
        other => panic!("expected head failure, got {other:?}"),
    }

    match parse_response(b"HTTP/1.1 200 OK\r\nContent-Length: 9\r\n\r\nabc", &request) {
        Err(ResponseFailure::Body { head, error }) => {
            assert_eq!(head.status_code, 200);
            assert!(matches!(error, ParseError::TruncatedBody { .. }));
        }
        other => panic!("expected body failure, got {other:?}"),
    }
}

#[test]
fn target_forms_split_into_authority_and_path() {
    assert_eq!(head("GET", "/a?b=1").split_target(), (None, "/a?b=1".to_string()));
    assert_eq!(
        head("GET", "http://proxy.test:8080/x/y").split_target(),
        (Some("proxy.test:8080".to_string()), "/x/y".to_string())
    );
    assert_eq!(
        head("GET", "http://proxy.test?q").split_target(),
        (Some("proxy.test".to_string()), "/?q".to_string())
    );
    assert_eq!(
        head("CONNECT", "example.com:443").split_target(),
        (Some("example.com:443".to_string()), String::new())
    );
    assert_eq!(head("OPTIONS", "*").target_form(), TargetForm::Asterisk);
}

#[test]
fn exchange_overrides_host_port_and_scheme() {
    let exchange = single(&raw(
        b"GET http://elsewhere.example:9999/a HTTP/1.1\r\nHost: elsewhere.example\r\n\r\n",
        b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
    ));

    assert_eq!(exchange.timestamp, 1_000.5);
    assert_eq!(exchange.request.host, "93.184.216.34");
    assert_eq!(exchange.request.port, 8080);
    assert_eq!(exchange.request.scheme, ProtocolTag::Http);
    assert_eq!(exchange.request.path, "/a");
    assert_eq!(exchange.request.authority.as_deref(), Some("elsewhere.example:9999"));
    assert_eq!(exchange.request.http_version, "HTTP/1.1");
    assert_eq!(exchange.request.timestamp_start, 1_000.5);
    assert_eq!(exchange.request.timestamp_end, Some(1_000.6));

    match &exchange.response {
        ResponseSlot::Complete(response) => {
            assert_eq!(response.body, b"ok");
            assert_eq!(response.timestamp_start, 1_000.5);
            assert_eq!(response.timestamp_end, Some(1_000.9));
        }
        other => panic!("expected complete response, got {other:?}"),
    }
}

#[test]
fn exchange_with_broken_response_head_is_absent() {
    let exchange = single(&raw(b"GET / HTTP/1.1\r\n\r\n", b"HTTP/1.1 20"));

    assert!(matches!(exchange.response, ResponseSlot::Absent { .. }));
    assert!(exchange.response.is_degraded());
    assert!(exchange.response.identity_body().is_empty());
}

#[test]
fn exchange_with_truncated_response_body_keeps_head() {
    let exchange = single(&raw(
        b"GET / HTTP/1.1\r\n\r\n",
        b"HTTP/1.1 404 Not Found\r\nContent-Length: 50\r\n\r\npartial",
    ));

    match &exchange.response {
        ResponseSlot::Truncated { response, reason } => {
            assert_eq!(response.status_code, 404);
            assert!(response.body.is_empty());
            assert!(reason.contains("truncated"));
        }
        other => panic!("expected truncated response, got {other:?}"),
    }
}

#[test]
fn keep_alive_requests_pair_with_responses_in_order() {
    let mut stream = raw(
        b"GET /1 HTTP/1.1\r\n\r\nPOST /2 HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc",
        b"HTTP/1.1 204 No Content\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\ndone",
    );
    stream.sent_times.push(0, 1_000.5);
    stream.sent_times.push(19, 1_002.25);
    stream.received_times.push(0, 1_000.75);
    stream.received_times.push(27, 1_002.5);

    let parsed = parse_stream(&stream);

    assert!(parsed.request_error.is_none());
    assert_eq!(parsed.trailing_sent, 0);
    assert_eq!(parsed.exchanges.len(), 2);

    let first = &parsed.exchanges[0];
    assert_eq!(first.timestamp, 1_000.5);
    assert_eq!(first.request.path, "/1");
    assert_eq!(first.request.timestamp_end, Some(1_000.5));
    match &first.response {
        ResponseSlot::Complete(response) => {
            assert_eq!(response.status_code, 204);
            assert_eq!(response.timestamp_end, Some(1_000.75));
        }
        other => panic!("expected complete response, got {other:?}"),
    }

    let second = &parsed.exchanges[1];
    assert_eq!(second.timestamp, 1_002.25);
    assert_eq!(second.request.path, "/2");
    assert_eq!(second.request.body, b"abc");
    match &second.response {
        ResponseSlot::Complete(response) => {
            assert_eq!(response.body, b"done");
            assert_eq!(response.timestamp_start, 1_002.25);
            assert_eq!(response.timestamp_end, Some(1_002.5));
        }
        other => panic!("expected complete response, got {other:?}"),
    }
}

#[test]
fn later_request_without_timeline_uses_connection_start() {
    let parsed = parse_stream(&raw(
        b"GET /1 HTTP/1.1\r\n\r\nGET /2 HTTP/1.1\r\n\r\n",
        b"HTTP/1.1 204 No Content\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n",
    ));

    assert_eq!(parsed.exchanges.len(), 2);
    assert_eq!(parsed.exchanges[1].timestamp, 1_000.5);
}

#[test]
fn missing_response_ends_the_stream_after_a_degraded_flow() {
    let parsed = parse_stream(&raw(
        b"GET /1 HTTP/1.1\r\n\r\nGET /2 HTTP/1.1\r\n\r\nGET /3 HTTP/1.1\r\n\r\n",
        b"HTTP/1.1 204 No Content\r\n\r\n",
    ));

    let paths: Vec<&str> = parsed.exchanges.iter().map(|e| e.request.path.as_str()).collect();
    assert_eq!(paths, ["/1", "/2"]);
    assert!(matches!(parsed.exchanges[1].response, ResponseSlot::Absent { .. }));
    assert!(parsed.request_error.is_none());
    assert_eq!(parsed.trailing_sent, 19);
}

#[test]
fn broken_later_request_keeps_earlier_exchanges() {
    let parsed = parse_stream(&raw(
        b"GET /1 HTTP/1.1\r\n\r\nGET /2 HTTP/1.1\r\nHost: exa",
        b"HTTP/1.1 204 No Content\r\n\r\n",
    ));

    assert_eq!(parsed.exchanges.len(), 1);
    assert!(matches!(parsed.request_error, Some(ParseError::IncompleteHead)));
    assert_eq!(parsed.trailing_sent, 26);
}

#[test]
fn trailing_line_breaks_are_not_a_request() {
    let parsed = parse_stream(&raw(
        b"POST /f HTTP/1.1\r\nContent-Length: 1\r\n\r\nx\r\n",
        b"HTTP/1.1 204 No Content\r\n\r\n",
    ));

    assert_eq!(parsed.exchanges.len(), 1);
    assert!(parsed.request_error.is_none());
    assert_eq!(parsed.trailing_sent, 2);
}

#[test]
fn protocol_switch_ends_http_parsing() {
    let parsed = parse_stream(&raw(
        b"GET /chat HTTP/1.1\r\nUpgrade: websocket\r\n\r\n\x81\x05hello",
        b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n\x81\x02hi",
    ));

    assert_eq!(parsed.exchanges.len(), 1);
    assert!(parsed.request_error.is_none());
    assert_eq!(parsed.trailing_sent, 7);
}

#[test]
fn expect_continue_does_not_change_request_framing() {
    let parsed = parse_stream(&raw(
        b"PUT /upload HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 4\r\n\r\ndata",
        b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n",
    ));

    assert_eq!(parsed.exchanges.len(), 1);
    let exchange = &parsed.exchanges[0];
    assert_eq!(exchange.request.body, b"data");
    assert_eq!(exchange.response.record().map(|r| r.status_code), Some(201));
    assert_eq!(parsed.trailing_sent, 0);
}

#[test]
fn stream_without_a_request_fails() {
    let parsed = parse_stream(&raw(b"", b"HTTP/1.1 200 OK\r\n\r\n"));
    assert!(parsed.exchanges.is_empty());
    assert!(matches!(parsed.request_error, Some(ParseError::IncompleteHead)));
}

#[test]
fn request_line_sniffing() {
    assert!(looks_like_request(b"GET / HTTP/1.1\r\n"));
    assert!(looks_like_request(b"PROPFIND /dav HTTP/1.1\r\nDepth: 1\r\n"));
    assert!(!looks_like_request(b"SSH-2.0-OpenSSH_9.6\r\n"));
    assert!(!looks_like_request(b"\x16\x03\x01\x00\x05hello"));
    assert!(!looks_like_request(b"get / HTTP/1.1\r\n"));
    assert!(!looks_like_request(b""));
}
