//! Recorded TLS 1.2 session (TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256) carrying
//! one HTTP exchange, with the matching key log.

pub const TLS_CLIENT: &[u8] = include_bytes!("../../tests/data/tls12_client.bin");
pub const TLS_SERVER: &[u8] = include_bytes!("../../tests/data/tls12_server.bin");
pub const TLS13_SERVER_HELLO: &[u8] = include_bytes!("../../tests/data/tls13_server_hello.bin");
pub const KEYLOG: &str = include_str!("../../tests/data/tls12_keylog.txt");

pub const CLIENT_RANDOM: [u8; 32] = [
    0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1a, 0x1b, 0x1c, 0x1d, 0x1e, 0x1f,
    0x20, 0x21, 0x22, 0x23, 0x24, 0x25, 0x26, 0x27, 0x28, 0x29, 0x2a, 0x2b, 0x2c, 0x2d, 0x2e, 0x2f,
];

pub const HTTP_REQUEST: &[u8] = b"GET /a HTTP/1.1\r\nHost: example.com\r\n\r\n";
pub const HTTP_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
