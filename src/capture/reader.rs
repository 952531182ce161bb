use anyhow::{Context, Result, bail};
use pcap_parser::pcapng::EnhancedPacketBlock;
use pcap_parser::traits::PcapNGPacketBlock;
use pcap_parser::*;
use std::fs::File;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

const READ_BUFFER: usize = 65536;

struct InterfaceDescription {
    linktype: Linktype,
    ts_resolution: u8,
    ts_offset: i64,
}

/// One frame as stored in the capture.
#[derive(Debug, Clone, Copy)]
pub struct CapturedPacket<'a> {
    pub linktype: Linktype,
    pub timestamp: f64,
    pub data: &'a [u8],
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReadStats {
    pub blocks: usize,
    pub packets: usize,
}

/// Walks a pcap or pcapng file and hands every captured frame to
/// `on_packet` in file order.
pub fn read_packets<F>(file_path: &Path, mut on_packet: F) -> Result<ReadStats>
where
    F: FnMut(CapturedPacket<'_>) -> Result<()>,
{
    let file = File::open(file_path)
        .with_context(|| format!("Failed to open capture {file_path:?}"))?;
    let file_size = file.metadata()?.len();
    info!(path = ?file_path, size_bytes = file_size, "Starting capture read");
    let mut reader = create_reader(READ_BUFFER, file)
        .map_err(|e| anyhow::anyhow!("{e:?}"))
        .with_context(|| format!("Failed to read {file_path:?} as pcap or pcapng"))?;

    let mut stats = ReadStats::default();
    let mut interfaces: Vec<InterfaceDescription> = Vec::new();
    let mut legacy_linktype = Linktype::ETHERNET;
    let mut legacy_nanos = false;
    let start_time = Instant::now();

    loop {
        match reader.next() {
            Ok((offset, block)) => {
                stats.blocks += 1;
                match block {
                    PcapBlockOwned::LegacyHeader(header) => {
                        legacy_linktype = header.network;
                        legacy_nanos = header.is_nanosecond_precision();
                        debug!(linktype = ?header.network, "Read legacy pcap header");
                    }
                    PcapBlockOwned::Legacy(packet) => {
                        let fraction = if legacy_nanos { 1e-9 } else { 1e-6 };
                        let timestamp = packet.ts_sec as f64 + packet.ts_usec as f64 * fraction;
                        stats.packets += 1;
                        on_packet(CapturedPacket {
                            linktype: legacy_linktype,
                            timestamp,
                            data: packet.data,
                        })?;
                    }
                    PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                        debug!("Encountered SectionHeader; clearing interface descriptions");
                        interfaces.clear();
                    }
                    PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                        interfaces.push(InterfaceDescription {
                            linktype: idb.linktype,
                            ts_resolution: idb.if_tsresol,
                            ts_offset: idb.if_tsoffset,
                        });
                        debug!(
                            if_id = interfaces.len() - 1,
                            linktype = ?idb.linktype,
                            "Registered interface description"
                        );
                    }
                    PcapBlockOwned::NG(Block::EnhancedPacket(ref epb)) => {
                        let if_id = epb.if_id as usize;
                        match interfaces.get(if_id) {
                            Some(interface) => {
                                stats.packets += 1;
                                on_packet(CapturedPacket {
                                    linktype: interface.linktype,
                                    timestamp: parse_timestamp(epb, interface),
                                    data: epb.packet_data(),
                                })?;
                            }
                            None => warn!(
                                if_id = if_id,
                                "EPB references unknown interface; skipping packet"
                            ),
                        }
                    }
                    PcapBlockOwned::NG(Block::SimplePacket(_)) => {
                        debug!("Unsupported block type: SimplePacket")
                    }
                    PcapBlockOwned::NG(_) => debug!("Skipping non-packet pcapng block"),
                }
                reader.consume(offset);
            }
            Err(PcapError::Eof) => break,
            Err(PcapError::Incomplete(_)) => {
                reader
                    .refill()
                    .map_err(|e| anyhow::anyhow!("{e:?}"))
                    .context("Failed to refill capture reader")?;
            }
            Err(PcapError::UnexpectedEof) => {
                warn!(path = ?file_path, "Capture ends in the middle of a block");
                break;
            }
            Err(e) => bail!("Error while reading {file_path:?}: {e:?}"),
        }
    }

    info!(
        path = ?file_path,
        blocks = stats.blocks,
        packets = stats.packets,
        elapsed_ms = start_time.elapsed().as_millis(),
        "Completed capture read"
    );
    Ok(stats)
}

pub(crate) fn calculate_ts_unit(resolution: u8) -> u64 {
    if resolution & 0x80 != 0 {
        2u64.pow((resolution & 0x7F) as u32)
    } else {
        10u64.pow(resolution as u32)
    }
}

fn parse_timestamp(epb: &EnhancedPacketBlock, interface: &InterfaceDescription) -> f64 {
    let unit = calculate_ts_unit(interface.ts_resolution);
    epb.decode_ts_f64(interface.ts_offset as u64, unit)
}
