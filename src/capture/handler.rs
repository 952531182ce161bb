use super::reassembly::TcpStream;
use super::tls;
use crate::classifier::Handler;
use crate::flow::{ProtocolTag, RawExchange};
use crate::http;
use tracing::{debug, warn};

/// Runs a reassembled stream through its handler and tags the result.
pub fn apply(handler: &Handler, stream: TcpStream) -> RawExchange {
    match handler {
        Handler::Plaintext => tagged(stream, ProtocolTag::Http),
        Handler::Generic => {
            let protocol = if http::looks_like_request(&stream.sent) {
                ProtocolTag::Http
            } else {
                ProtocolTag::Tcp
            };
            tagged(stream, protocol)
        }
        Handler::Encrypted(keys) => {
            match tls::decrypt_stream(&stream.sent, &stream.received, keys) {
                Ok(plaintext) => {
                    debug!(
                        key = %stream.key,
                        sent = plaintext.client.len(),
                        received = plaintext.server.len(),
                        "Decrypted TLS stream"
                    );
                    RawExchange {
                        key: stream.key,
                        timestamp: stream.timestamp,
                        protocol: ProtocolTag::Https,
                        sent_times: stream.sent_times.remap(&plaintext.client_offsets),
                        received_times: stream.received_times.remap(&plaintext.server_offsets),
                        sent: plaintext.client,
                        received: plaintext.server,
                        sent_last: stream.sent_last,
                        received_last: stream.received_last,
                    }
                }
                Err(error) => {
                    warn!(key = %stream.key, error = %error, "Unable to decrypt TLS stream");
                    tagged(stream, ProtocolTag::Tls)
                }
            }
        }
    }
}

fn tagged(stream: TcpStream, protocol: ProtocolTag) -> RawExchange {
    RawExchange {
        key: stream.key,
        timestamp: stream.timestamp,
        protocol,
        sent: stream.sent,
        received: stream.received,
        sent_last: stream.sent_last,
        received_last: stream.received_last,
        sent_times: stream.sent_times,
        received_times: stream.received_times,
    }
}
