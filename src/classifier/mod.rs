use crate::flow::ConnectionKey;
use crate::keylog::KeyMaterial;
use std::collections::HashMap;
use std::sync::Arc;


/// Ports that carry HTTP over TLS unless overridden.
pub const ENCRYPTED_PORTS: [u16; 2] = [443, 4443];

/// How the bytes of a stream are turned into an exchange.
#[derive(Debug, Clone)]
pub enum Handler {
    /// Always treated as HTTP.
    Plaintext,
    /// TLS, decrypted with the shared key material before parsing.
    Encrypted(Arc<KeyMaterial>),
    /// Treated as HTTP only when the client opens with a request line.
    Generic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Plaintext,
    Encrypted,
    Generic,
}

impl Handler {
    pub fn kind(&self) -> HandlerKind {
        match self {
            Handler::Plaintext => HandlerKind::Plaintext,
            Handler::Encrypted(_) => HandlerKind::Encrypted,
            Handler::Generic => HandlerKind::Generic,
        }
    }
}

/// Maps destination ports to handlers. Resolution never fails: unregistered
/// ports fall back to [`Handler::Generic`].
#[derive(Debug, Clone)]
pub struct Classifier {
    ports: HashMap<u16, Handler>,
    fallback: Handler,
}

impl Classifier {
    pub fn new(keys: Arc<KeyMaterial>) -> Self {
        let mut classifier = Self {
            ports: HashMap::new(),
            fallback: Handler::Generic,
        };

        for port in ENCRYPTED_PORTS {
            classifier.register(port, Handler::Encrypted(Arc::clone(&keys)));
        }

        classifier
    }

    pub fn with_port(mut self, port: u16, handler: Handler) -> Self {
        self.register(port, handler);
        self
    }

    pub fn register(&mut self, port: u16, handler: Handler) {
        self.ports.insert(port, handler);
    }

    pub fn resolve(&self, key: &ConnectionKey) -> &Handler {
        self.resolve_port(key.destination.port)
    }

    pub fn resolve_port(&self, port: u16) -> &Handler {
        self.ports.get(&port).unwrap_or(&self.fallback)
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(Arc::new(KeyMaterial::empty()))
    }
}
