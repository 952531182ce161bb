//! TCP stream reassembly.
//!
//! Segments are kept per direction keyed by their offset from the initial
//! sequence number, so retransmissions collapse and out-of-order delivery is
//! put back in order. A connection is handed out once both sides have sent
//! FIN or either side has sent RST; connections still open when the capture
//! ends are flushed in the order they were first seen.

use super::decoder::TcpSegment;
use crate::flow::{ConnectionKey, Endpoint, Timeline};
use std::collections::{BTreeMap, HashMap, btree_map, hash_map};
use tracing::{debug, trace};

/// Offsets this far past the initial sequence number are treated as data
/// from before the stream started.
const MAX_FORWARD_OFFSET: u32 = u32::MAX / 2;

/// Both directions of one reassembled connection.
#[derive(Debug, Clone, PartialEq)]
pub struct TcpStream {
    pub key: ConnectionKey,
    /// Timestamp of the first packet seen for the connection.
    pub timestamp: f64,
    pub sent: Vec<u8>,
    pub received: Vec<u8>,
    pub sent_last: Option<f64>,
    pub received_last: Option<f64>,
    pub sent_times: Timeline,
    pub received_times: Timeline,
}

#[derive(Debug, Default)]
struct DirectionBuffer {
    isn: Option<u32>,
    /// Payload and capture time per offset; a retransmission keeps the time
    /// the offset was first seen.
    segments: BTreeMap<u32, (Vec<u8>, f64)>,
    last_seen: Option<f64>,
    fin: bool,
}

impl DirectionBuffer {
    fn observe(&mut self, segment: &TcpSegment, timestamp: f64) {
        if segment.fin {
            self.fin = true;
        }
        let mut data_sequence = segment.sequence;
        if segment.syn {
            data_sequence = data_sequence.wrapping_add(1);
            if self.segments.is_empty() {
                self.isn = Some(data_sequence);
            }
        }
        if segment.payload.is_empty() {
            return;
        }

        let base = *self.isn.get_or_insert(data_sequence);
        let offset = data_sequence.wrapping_sub(base);
        if offset > MAX_FORWARD_OFFSET {
            trace!(offset = offset, "Dropping segment from before stream start");
            return;
        }
        self.last_seen = Some(timestamp);

        match self.segments.entry(offset) {
            btree_map::Entry::Occupied(mut existing) => {
                let (payload, _) = existing.get_mut();
                if payload.len() < segment.payload.len() {
                    *payload = segment.payload.clone();
                }
            }
            btree_map::Entry::Vacant(slot) => {
                slot.insert((segment.payload.clone(), timestamp));
            }
        }
    }

    fn has_data(&self) -> bool {
        !self.segments.is_empty()
    }

    /// Joins segments in sequence order, trimming overlaps. Assembly stops at
    /// the first gap.
    fn assemble(&self) -> (Vec<u8>, Timeline) {
        let mut data = Vec::new();
        let mut times = Timeline::new();
        let mut next: u64 = 0;
        for (&offset, (payload, timestamp)) in &self.segments {
            let offset = u64::from(offset);
            let end = offset + payload.len() as u64;
            if offset > next {
                debug!(missing = offset - next, "Gap in reassembled stream; truncating");
                break;
            }
            if end <= next {
                continue;
            }
            times.push(data.len(), *timestamp);
            data.extend_from_slice(&payload[(next - offset) as usize..]);
            next = end;
        }
        (data, times)
    }
}

#[derive(Debug)]
struct Connection {
    key: ConnectionKey,
    order: u64,
    timestamp: f64,
    client: DirectionBuffer,
    server: DirectionBuffer,
    reset: bool,
}

impl Connection {
    fn open(segment: &TcpSegment, timestamp: f64, order: u64) -> Self {
        // A SYN-ACK comes from the server; anything else is taken to come from
        // the side that opened the connection.
        let key = if segment.syn && segment.ack {
            ConnectionKey::new(segment.destination, segment.source)
        } else {
            ConnectionKey::new(segment.source, segment.destination)
        };
        Self {
            key,
            order,
            timestamp,
            client: DirectionBuffer::default(),
            server: DirectionBuffer::default(),
            reset: false,
        }
    }

    fn observe(&mut self, segment: &TcpSegment, timestamp: f64) {
        if segment.rst {
            self.reset = true;
        }
        if segment.source == self.key.source {
            self.client.observe(segment, timestamp);
        } else {
            self.server.observe(segment, timestamp);
        }
    }

    fn is_finished(&self) -> bool {
        self.reset || (self.client.fin && self.server.fin)
    }

    /// A fresh SYN from the client on a tuple that already carried data
    /// means the port was reused for a new connection.
    fn is_reopened_by(&self, segment: &TcpSegment) -> bool {
        segment.syn
            && !segment.ack
            && segment.source == self.key.source
            && (self.client.has_data()
                || self
                    .client
                    .isn
                    .is_some_and(|isn| isn != segment.sequence.wrapping_add(1)))
    }

    fn into_stream(self) -> Option<TcpStream> {
        if !self.client.has_data() && !self.server.has_data() {
            trace!(key = %self.key, "Discarding connection without payload");
            return None;
        }
        let (sent, sent_times) = self.client.assemble();
        let (received, received_times) = self.server.assemble();
        Some(TcpStream {
            key: self.key,
            timestamp: self.timestamp,
            sent,
            received,
            sent_last: self.client.last_seen,
            received_last: self.server.last_seen,
            sent_times,
            received_times,
        })
    }
}

/// Connections are indexed by their unordered endpoint pair.
fn endpoint_pair(segment: &TcpSegment) -> (Endpoint, Endpoint) {
    if segment.source <= segment.destination {
        (segment.source, segment.destination)
    } else {
        (segment.destination, segment.source)
    }
}

#[derive(Debug, Default)]
pub struct Reassembler {
    connections: HashMap<(Endpoint, Endpoint), Connection>,
    next_order: u64,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    /// Feeds one segment; returns the streams it completed, oldest first.
    pub fn push(&mut self, segment: &TcpSegment, timestamp: f64) -> Vec<TcpStream> {
        let mut completed = Vec::new();
        let tuple = endpoint_pair(segment);

        let reopened = self
            .connections
            .get(&tuple)
            .is_some_and(|existing| existing.is_reopened_by(segment));
        if reopened && let Some(previous) = self.connections.remove(&tuple) {
            debug!(key = %previous.key, "Port reuse; closing previous connection");
            completed.extend(previous.into_stream());
        }

        let connection = match self.connections.entry(tuple) {
            hash_map::Entry::Occupied(entry) => entry.into_mut(),
            hash_map::Entry::Vacant(entry) => {
                // Stray ACKs and FINs after a connection closed must not open
                // a new one.
                if !segment.syn && segment.payload.is_empty() {
                    return completed;
                }
                let order = self.next_order;
                self.next_order += 1;
                entry.insert(Connection::open(segment, timestamp, order))
            }
        };
        connection.observe(segment, timestamp);

        if connection.is_finished()
            && let Some(finished) = self.connections.remove(&tuple)
        {
            trace!(key = %finished.key, reset = finished.reset, "Connection finished");
            completed.extend(finished.into_stream());
        }
        completed
    }

    /// Flushes every connection still open, in first-seen order.
    pub fn finish(self) -> Vec<TcpStream> {
        let mut open: Vec<Connection> = self.connections.into_values().collect();
        open.sort_by_key(|connection| connection.order);
        open.into_iter().filter_map(Connection::into_stream).collect()
    }
}
