use crate::flow::{Endpoint, IPAddress};
use etherparse::{NetHeaders, PacketHeaders, TransportHeader};
use pcap_parser::Linktype;
use tracing::trace;

/// BSD loopback prefixes every frame with a 4 byte address family.
const LOOPBACK_HEADER_LEN: usize = 4;
const LINUX_SLL_HEADER_LEN: usize = 16;

/// The parts of one TCP packet the reassembler needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub source: Endpoint,
    pub destination: Endpoint,
    pub sequence: u32,
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub payload: Vec<u8>,
}

/// Decodes a captured frame down to its TCP segment. Frames that are not
/// TCP over IP yield `Ok(None)`.
pub fn decode_segment(linktype: Linktype, packet: &[u8]) -> Result<Option<TcpSegment>, String> {
    let parsed = if linktype == Linktype::ETHERNET {
        PacketHeaders::from_ethernet_slice(packet)
    } else if linktype == Linktype::RAW || linktype == Linktype::IPV4 || linktype == Linktype::IPV6 {
        PacketHeaders::from_ip_slice(packet)
    } else if linktype == Linktype::NULL || linktype == Linktype::LOOP {
        PacketHeaders::from_ip_slice(packet.get(LOOPBACK_HEADER_LEN..).unwrap_or_default())
    } else if linktype == Linktype::LINUX_SLL {
        PacketHeaders::from_ip_slice(packet.get(LINUX_SLL_HEADER_LEN..).unwrap_or_default())
    } else {
        return Err(format!("unsupported link type {linktype:?}"));
    };
    let headers = parsed.map_err(|err| {
        trace!(error = ?err, "Failed to parse packet headers");
        format!("header parse error: {err:?}")
    })?;

    let (source_ip, destination_ip) = match &headers.net {
        Some(NetHeaders::Ipv4(ip, _)) => (IPAddress::V4(ip.source), IPAddress::V4(ip.destination)),
        Some(NetHeaders::Ipv6(ip, _)) => (IPAddress::V6(ip.source), IPAddress::V6(ip.destination)),
        _ => return Ok(None),
    };

    let Some(TransportHeader::Tcp(tcp)) = &headers.transport else {
        return Ok(None);
    };

    Ok(Some(TcpSegment {
        source: Endpoint::new(source_ip, tcp.source_port),
        destination: Endpoint::new(destination_ip, tcp.destination_port),
        sequence: tcp.sequence_number,
        syn: tcp.syn,
        ack: tcp.ack,
        fin: tcp.fin,
        rst: tcp.rst,
        payload: headers.payload.slice().to_vec(),
    }))
}
