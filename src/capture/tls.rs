//! TLS 1.2 record decryption for reassembled streams.
//!
//! Only AEAD suites are handled (AES-GCM and ChaCha20-Poly1305). Keys come
//! from the master secret matched by client random or session id; TLS 1.3
//! sessions are recognised and rejected.

use crate::keylog::{KeyMaterial, MasterSecret};
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use ring::hmac;
use thiserror::Error;
use tls_parser::{
    TlsExtension, TlsMessage, TlsMessageHandshake, TlsRawRecord, TlsRecordType,
    parse_tls_extensions, parse_tls_message_handshake, parse_tls_raw_record,
};

const RECORD_HEADER_LEN: usize = 5;
const TAG_LEN: usize = 16;
const EXPLICIT_NONCE_LEN: usize = 8;
const TLS13: u16 = 0x0304;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("no TLS key material loaded")]
    NoKeyMaterial,
    #[error("stream does not start with a TLS record")]
    NotTls,
    #[error("malformed TLS record")]
    MalformedRecord,
    #[error("{0} not found in handshake")]
    MissingHello(&'static str),
    #[error("TLS 1.3 sessions cannot be decrypted with a master secret")]
    UnsupportedVersion,
    #[error("unsupported cipher suite 0x{0:04x}")]
    UnsupportedCipherSuite(u16),
    #[error("no master secret for this session")]
    UnknownSession,
    #[error("invalid key material for cipher suite 0x{0:04x}")]
    InvalidKey(u16),
    #[error("record {sequence} too short: {length} bytes")]
    ShortRecord { sequence: u64, length: usize },
    #[error("record {sequence} failed authentication")]
    AuthenticationFailed { sequence: u64 },
}

/// Application data recovered from both directions of one connection.
///
/// The offset lists pair a plaintext offset with the stream offset of the
/// record it was decrypted from.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Plaintext {
    pub client: Vec<u8>,
    pub server: Vec<u8>,
    pub client_offsets: Vec<(usize, usize)>,
    pub server_offsets: Vec<(usize, usize)>,
}

pub fn looks_like_tls(payload: &[u8]) -> bool {
    if payload.len() < RECORD_HEADER_LEN {
        return false;
    }
    let content_type = payload[0];
    let version_major = payload[1];
    (20..=23).contains(&content_type) && version_major == 3
}

/// Decrypts the application data records of a TLS 1.2 connection.
pub fn decrypt_stream(
    client: &[u8],
    server: &[u8],
    keys: &KeyMaterial,
) -> Result<Plaintext, TlsError> {
    if keys.is_empty() {
        return Err(TlsError::NoKeyMaterial);
    }
    if !looks_like_tls(client) {
        return Err(TlsError::NotTls);
    }

    let client_records = split_records(client)?;
    let server_records = split_records(server)?;

    let client_hello = read_hello(&client_records, Side::Client)?;
    let server_hello = read_hello(&server_records, Side::Server)?;
    if server_hello.tls13 {
        return Err(TlsError::UnsupportedVersion);
    }
    let suite = CipherSuite::from_id(server_hello.cipher)
        .ok_or(TlsError::UnsupportedCipherSuite(server_hello.cipher))?;

    let session_id = if server_hello.session_id.is_empty() {
        &client_hello.session_id
    } else {
        &server_hello.session_id
    };
    let master = keys
        .master_secret(&client_hello.random, Some(session_id))
        .ok_or(TlsError::UnknownSession)?;

    let (client_keys, server_keys) =
        derive_keys(&suite, master, &client_hello.random, &server_hello.random)?;

    let (client, client_offsets) = decrypt_direction(&client_records, client_keys)?;
    let (server, server_offsets) = decrypt_direction(&server_records, server_keys)?;
    Ok(Plaintext {
        client,
        server,
        client_offsets,
        server_offsets,
    })
}

/// Splits a byte stream into complete records; a truncated final record is
/// dropped.
fn split_records(mut data: &[u8]) -> Result<Vec<TlsRawRecord<'_>>, TlsError> {
    let mut records = Vec::new();
    while data.len() >= RECORD_HEADER_LEN {
        let length = u16::from_be_bytes([data[3], data[4]]) as usize;
        if data.len() < RECORD_HEADER_LEN + length {
            break;
        }
        let (rest, record) = parse_tls_raw_record(data).map_err(|_| TlsError::MalformedRecord)?;
        records.push(record);
        data = rest;
    }
    Ok(records)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

#[derive(Debug)]
struct Hello {
    random: [u8; 32],
    session_id: Vec<u8>,
    cipher: u16,
    tls13: bool,
}

fn read_hello(records: &[TlsRawRecord<'_>], side: Side) -> Result<Hello, TlsError> {
    let mut handshake = Vec::new();
    for record in records {
        match record.hdr.record_type {
            TlsRecordType::ChangeCipherSpec => break,
            TlsRecordType::Handshake => handshake.extend_from_slice(record.data),
            _ => {}
        }
    }

    let missing = match side {
        Side::Client => TlsError::MissingHello("ClientHello"),
        Side::Server => TlsError::MissingHello("ServerHello"),
    };

    let mut rest = handshake.as_slice();
    while !rest.is_empty() {
        let Ok((remaining, message)) = parse_tls_message_handshake(rest) else {
            break;
        };
        match (side, message) {
            (Side::Client, TlsMessage::Handshake(TlsMessageHandshake::ClientHello(hello))) => {
                return Ok(Hello {
                    random: hello_random(hello.rand_time, hello.rand_data)?,
                    session_id: hello.session_id.unwrap_or_default().to_vec(),
                    cipher: 0,
                    tls13: false,
                });
            }
            (Side::Server, TlsMessage::Handshake(TlsMessageHandshake::ServerHello(hello))) => {
                return Ok(Hello {
                    random: hello_random(hello.rand_time, hello.rand_data)?,
                    session_id: hello.session_id.unwrap_or_default().to_vec(),
                    cipher: hello.cipher.0,
                    tls13: hello.version.0 == TLS13 || hello.ext.is_some_and(negotiates_tls13),
                });
            }
            _ => {}
        }
        rest = remaining;
    }
    Err(missing)
}

/// The hello random is split by the parser into its leading `gmt_unix_time`
/// and the remaining 28 bytes.
fn hello_random(rand_time: u32, rand_data: &[u8]) -> Result<[u8; 32], TlsError> {
    let mut random = [0u8; 32];
    if rand_data.len() != random.len() - 4 {
        return Err(TlsError::MalformedRecord);
    }
    random[..4].copy_from_slice(&rand_time.to_be_bytes());
    random[4..].copy_from_slice(rand_data);
    Ok(random)
}

fn negotiates_tls13(ext: &[u8]) -> bool {
    let Ok((_, extensions)) = parse_tls_extensions(ext) else {
        return false;
    };
    extensions.iter().any(|extension| match extension {
        TlsExtension::SupportedVersions(versions) => versions.iter().any(|v| v.0 == TLS13),
        _ => false,
    })
}

#[derive(Debug, Clone, Copy)]
struct CipherSuite {
    id: u16,
    aead: &'static aead::Algorithm,
    prf: hmac::Algorithm,
    fixed_iv_len: usize,
}

impl CipherSuite {
    fn from_id(id: u16) -> Option<Self> {
        let (aead, prf, fixed_iv_len) = match id {
            // *_WITH_AES_128_GCM_SHA256
            0x009C | 0x009E | 0xC02B | 0xC02F => (&aead::AES_128_GCM, hmac::HMAC_SHA256, 4),
            // *_WITH_AES_256_GCM_SHA384
            0x009D | 0x009F | 0xC02C | 0xC030 => (&aead::AES_256_GCM, hmac::HMAC_SHA384, 4),
            // *_WITH_CHACHA20_POLY1305_SHA256
            0xCCA8 | 0xCCA9 | 0xCCAA => (&aead::CHACHA20_POLY1305, hmac::HMAC_SHA256, 12),
            _ => return None,
        };
        Some(Self {
            id,
            aead,
            prf,
            fixed_iv_len,
        })
    }

    fn key_len(&self) -> usize {
        self.aead.key_len()
    }

    /// GCM suites carry an 8 byte explicit nonce in every record.
    fn explicit_nonce(&self) -> bool {
        self.fixed_iv_len == 4
    }
}

/// TLS 1.2 PRF (P_hash with the suite's HMAC).
pub(crate) fn prf(
    algorithm: hmac::Algorithm,
    secret: &[u8],
    label: &[u8],
    seed: &[u8],
    len: usize,
) -> Vec<u8> {
    let key = hmac::Key::new(algorithm, secret);
    let mut label_seed = Vec::with_capacity(label.len() + seed.len());
    label_seed.extend_from_slice(label);
    label_seed.extend_from_slice(seed);

    let mut output = Vec::with_capacity(len);
    let mut a = hmac::sign(&key, &label_seed);
    while output.len() < len {
        let mut ctx = hmac::Context::with_key(&key);
        ctx.update(a.as_ref());
        ctx.update(&label_seed);
        let block = ctx.sign();
        let take = (len - output.len()).min(block.as_ref().len());
        output.extend_from_slice(&block.as_ref()[..take]);
        a = hmac::sign(&key, a.as_ref());
    }
    output
}

fn derive_keys(
    suite: &CipherSuite,
    master: &MasterSecret,
    client_random: &[u8; 32],
    server_random: &[u8; 32],
) -> Result<(RecordDecrypter, RecordDecrypter), TlsError> {
    let key_len = suite.key_len();
    let iv_len = suite.fixed_iv_len;

    let mut seed = Vec::with_capacity(64);
    seed.extend_from_slice(server_random);
    seed.extend_from_slice(client_random);
    let block = prf(
        suite.prf,
        master,
        b"key expansion",
        &seed,
        2 * key_len + 2 * iv_len,
    );

    let (client_key, rest) = block.split_at(key_len);
    let (server_key, rest) = rest.split_at(key_len);
    let (client_iv, server_iv) = rest.split_at(iv_len);

    Ok((
        RecordDecrypter::new(suite, client_key, client_iv)?,
        RecordDecrypter::new(suite, server_key, server_iv)?,
    ))
}

struct RecordDecrypter {
    key: LessSafeKey,
    iv: [u8; 12],
    explicit_nonce: bool,
    sequence: u64,
}

impl RecordDecrypter {
    fn new(suite: &CipherSuite, key: &[u8], iv: &[u8]) -> Result<Self, TlsError> {
        let unbound = UnboundKey::new(suite.aead, key).map_err(|_| TlsError::InvalidKey(suite.id))?;
        let mut fixed = [0u8; 12];
        fixed[..iv.len()].copy_from_slice(iv);
        Ok(Self {
            key: LessSafeKey::new(unbound),
            iv: fixed,
            explicit_nonce: suite.explicit_nonce(),
            sequence: 0,
        })
    }

    fn open(&mut self, record: &TlsRawRecord<'_>) -> Result<Vec<u8>, TlsError> {
        let data = record.data;
        let overhead = if self.explicit_nonce {
            EXPLICIT_NONCE_LEN + TAG_LEN
        } else {
            TAG_LEN
        };
        if data.len() < overhead {
            return Err(TlsError::ShortRecord {
                sequence: self.sequence,
                length: data.len(),
            });
        }

        let mut nonce = self.iv;
        let ciphertext = if self.explicit_nonce {
            nonce[4..].copy_from_slice(&data[..EXPLICIT_NONCE_LEN]);
            &data[EXPLICIT_NONCE_LEN..]
        } else {
            for (byte, seq) in nonce[4..].iter_mut().zip(self.sequence.to_be_bytes()) {
                *byte ^= seq;
            }
            data
        };

        let plaintext_len = (ciphertext.len() - TAG_LEN) as u16;
        let mut aad = [0u8; 13];
        aad[..8].copy_from_slice(&self.sequence.to_be_bytes());
        aad[8] = record.hdr.record_type.0;
        aad[9..11].copy_from_slice(&record.hdr.version.0.to_be_bytes());
        aad[11..].copy_from_slice(&plaintext_len.to_be_bytes());

        let mut buffer = ciphertext.to_vec();
        let opened_len = self
            .key
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::from(aad), &mut buffer)
            .map_err(|_| TlsError::AuthenticationFailed {
                sequence: self.sequence,
            })?
            .len();
        buffer.truncate(opened_len);
        self.sequence += 1;
        Ok(buffer)
    }
}

/// Sequence numbers start at zero at the direction's ChangeCipherSpec.
/// Records are contiguous in the stream, so each one starts where the
/// previous one ended.
fn decrypt_direction(
    records: &[TlsRawRecord<'_>],
    mut decrypter: RecordDecrypter,
) -> Result<(Vec<u8>, Vec<(usize, usize)>), TlsError> {
    let mut plaintext = Vec::new();
    let mut offsets = Vec::new();
    let mut encrypted = false;
    let mut stream_offset = 0;
    for record in records {
        match record.hdr.record_type {
            TlsRecordType::ChangeCipherSpec => encrypted = true,
            TlsRecordType::ApplicationData if encrypted => {
                let data = decrypter.open(record)?;
                if !data.is_empty() {
                    offsets.push((plaintext.len(), stream_offset));
                    plaintext.extend_from_slice(&data);
                }
            }
            TlsRecordType::Handshake | TlsRecordType::Alert if encrypted => {
                decrypter.open(record)?;
            }
            _ => {}
        }
        stream_offset += RECORD_HEADER_LEN + record.data.len();
    }
    Ok((plaintext, offsets))
}
