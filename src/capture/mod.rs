//! Stream source backed by a pcap or pcapng file.

pub mod decoder;
pub mod handler;
pub mod reader;
pub mod reassembly;
pub mod tls;

#[cfg(test)]
mod fixtures;

use crate::classifier::Classifier;
use crate::flow::RawExchange;
use crate::pipeline::StreamSource;
use anyhow::Result;
use reassembly::{Reassembler, TcpStream};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

pub struct PcapStreamSource {
    path: PathBuf,
}

impl PcapStreamSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StreamSource for PcapStreamSource {
    fn for_each_stream(
        &mut self,
        classifier: &Classifier,
        on_stream: &mut dyn FnMut(RawExchange) -> Result<()>,
    ) -> Result<()> {
        let mut reassembler = Reassembler::new();
        let mut undecodable = 0usize;
        let mut emit = |stream: TcpStream| -> Result<()> {
            let assigned = classifier.resolve(&stream.key);
            trace!(key = %stream.key, handler = ?assigned.kind(), "Handing stream to handler");
            on_stream(handler::apply(assigned, stream))
        };

        reader::read_packets(&self.path, |packet| {
            match decoder::decode_segment(packet.linktype, packet.data) {
                Ok(Some(segment)) => {
                    for stream in reassembler.push(&segment, packet.timestamp) {
                        emit(stream)?;
                    }
                }
                Ok(None) => {}
                Err(_) => undecodable += 1,
            }
            Ok(())
        })?;

        debug!(
            open = reassembler.open_connections(),
            undecodable = undecodable,
            "Flushing connections still open at end of capture"
        );
        for stream in reassembler.finish() {
            emit(stream)?;
        }
        Ok(())
    }
}
