use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Content-derived 128-bit flow identifier.
///
/// Two exchanges with the same timestamps and bodies share an id, which lets
/// consumers deduplicate flows coming from overlapping captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct FlowId(Uuid);

impl FlowId {
    /// Timestamps are truncated to whole seconds and hashed as big-endian
    /// `i64`, followed by the raw request and response bodies.
    pub fn derive(
        client_timestamp: f64,
        server_timestamp: f64,
        request_body: &[u8],
        response_body: &[u8],
    ) -> Self {
        let mut context = md5::Context::new();
        context.consume((client_timestamp as i64).to_be_bytes());
        context.consume((server_timestamp as i64).to_be_bytes());
        context.consume(request_body);
        context.consume(response_body);
        let digest = context.compute();
        FlowId(Uuid::from_bytes(digest.0))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
