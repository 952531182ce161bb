use crate::flow::FlowRecord;

/// Emission order of flow records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderingMode {
    /// Emit in the order streams complete in the source.
    Streaming,
    /// Buffer the whole capture and emit by ascending exchange timestamp.
    #[default]
    Sorted,
}

impl OrderingMode {
    pub fn from_stream_flag(stream: bool) -> Self {
        if stream {
            OrderingMode::Streaming
        } else {
            OrderingMode::Sorted
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, OrderingMode::Streaming)
    }
}

/// Stable sort by exchange timestamp; records with equal timestamps keep
/// their arrival order.
pub fn sort_by_timestamp(records: &mut [FlowRecord]) {
    records.sort_by(|a, b| a.timestamp().total_cmp(&b.timestamp()));
}
