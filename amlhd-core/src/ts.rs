// TS / PES HELPERS - packet level accessors used on the delivery path
//
// The host hands over one 188-byte transport packet at a time. These
// functions pull out what the controller needs from it:
// • PID and payload-unit-start flag from the TS header
// • payload, skipping the adaptation field
// • PES stream id, declared length, PTS and header length

use crate::pts::Pts;

// ============================================================================
// Constants
// ============================================================================

pub const TS_PACKET_SIZE: usize = 188;
pub const TS_SYNC_BYTE: u8 = 0x47;
const TS_HEADER_SIZE: usize = 4;

pub const PAT_PID: u16 = 0x0000;
pub const NULL_PID: u16 = 0x1FFF;

const PES_START_CODE: [u8; 3] = [0x00, 0x00, 0x01];
const PES_FIXED_HEADER: usize = 6;

// Streams without the optional PES header (ISO 13818-1 2.4.3.7)
const PROGRAM_STREAM_MAP: u8 = 0xBC;
const PADDING_STREAM: u8 = 0xBE;
const PRIVATE_STREAM_2: u8 = 0xBF;
const ECM_STREAM: u8 = 0xF0;
const EMM_STREAM: u8 = 0xF1;
const DSMCC_STREAM: u8 = 0xF2;
const H222_TYPE_E_STREAM: u8 = 0xF8;
const PROGRAM_STREAM_DIRECTORY: u8 = 0xFF;

// ============================================================================
// TS Packet Header
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct TsHeader {
    payload_unit_start: bool,
    pid: u16,
    adaptation_field_exists: bool,
    payload_exists: bool,
}

impl TsHeader {
    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < TS_HEADER_SIZE || data[0] != TS_SYNC_BYTE {
            return None;
        }

        Some(Self {
            payload_unit_start: (data[1] & 0x40) != 0,
            pid: ((data[1] as u16 & 0x1F) << 8) | data[2] as u16,
            adaptation_field_exists: (data[3] & 0x20) != 0,
            payload_exists: (data[3] & 0x10) != 0,
        })
    }
}

/// PID of a transport packet.
pub fn pid(packet: &[u8]) -> Option<u16> {
    TsHeader::parse(packet).map(|h| h.pid)
}

/// Whether a PES packet (or PSI section) starts in this transport packet.
pub fn payload_unit_start(packet: &[u8]) -> bool {
    TsHeader::parse(packet).is_some_and(|h| h.payload_unit_start)
}

/// Offset of the payload within a transport packet.
pub fn payload_offset(packet: &[u8]) -> Option<usize> {
    let header = TsHeader::parse(packet)?;
    if !header.payload_exists {
        return None;
    }

    let offset = if header.adaptation_field_exists {
        TS_HEADER_SIZE + 1 + *packet.get(TS_HEADER_SIZE)? as usize
    } else {
        TS_HEADER_SIZE
    };

    if offset >= packet.len() {
        return None;
    }
    Some(offset)
}

/// Payload of a transport packet, adaptation field skipped.
pub fn payload(packet: &[u8]) -> Option<&[u8]> {
    payload_offset(packet).map(|offset| &packet[offset..])
}

// ============================================================================
// PES Parsing
// ============================================================================

/// True if `data` begins with a PES start code and stream id.
pub fn is_pes(data: &[u8]) -> bool {
    data.len() >= PES_FIXED_HEADER && data[..3] == PES_START_CODE
}

pub fn pes_stream_id(data: &[u8]) -> Option<u8> {
    is_pes(data).then(|| data[3])
}

/// PES_packet_length. Zero (unbounded video) is reported as `None`.
pub fn pes_declared_length(data: &[u8]) -> Option<usize> {
    if !is_pes(data) {
        return None;
    }
    let len = ((data[4] as usize) << 8) | data[5] as usize;
    (len > 0).then_some(len)
}

fn has_optional_header(stream_id: u8) -> bool {
    !matches!(
        stream_id,
        PROGRAM_STREAM_MAP
            | PADDING_STREAM
            | PRIVATE_STREAM_2
            | ECM_STREAM
            | EMM_STREAM
            | DSMCC_STREAM
            | H222_TYPE_E_STREAM
            | PROGRAM_STREAM_DIRECTORY
    )
}

/// Offset of the elementary stream bytes within a PES packet.
pub fn pes_payload_offset(data: &[u8]) -> Option<usize> {
    let stream_id = pes_stream_id(data)?;
    if !has_optional_header(stream_id) {
        return Some(PES_FIXED_HEADER);
    }
    if data.len() < 9 {
        return None;
    }
    let offset = 9 + data[8] as usize;
    (offset <= data.len()).then_some(offset)
}

pub fn pes_has_pts(data: &[u8]) -> bool {
    match pes_stream_id(data) {
        Some(id) if has_optional_header(id) => data.len() >= 14 && (data[7] & 0x80) != 0,
        _ => false,
    }
}

/// PTS of a PES packet, if it carries one.
pub fn pes_pts(data: &[u8]) -> Option<Pts> {
    if !pes_has_pts(data) {
        return None;
    }
    Some(Pts::new(parse_timestamp(&data[9..14])))
}

fn parse_timestamp(data: &[u8]) -> i64 {
    // 33-bit timestamp encoded in 5 bytes with marker bits
    (((data[0] as i64) >> 1) & 0x07) << 30
        | ((data[1] as i64) << 22)
        | (((data[2] as i64) >> 1) << 15)
        | ((data[3] as i64) << 7)
        | ((data[4] as i64) >> 1)
}

/// Splits a buffer of concatenated PES packets by their declared length.
/// An unbounded packet runs to the end of the buffer; trailing garbage
/// that does not start with a start code ends the walk.
pub fn split_pes(data: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let rest = &data[pos..];
        if !is_pes(rest) {
            break;
        }
        let end = match pes_declared_length(rest) {
            Some(len) => (PES_FIXED_HEADER + len).min(rest.len()),
            None => rest.len(),
        };
        units.push(&rest[..end]);
        pos += end;
    }

    units
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn encode_pts(pts: i64) -> [u8; 5] {
        [
            0x21 | (((pts >> 30) as u8 & 0x07) << 1),
            (pts >> 22) as u8,
            0x01 | (((pts >> 15) as u8) << 1),
            (pts >> 7) as u8,
            0x01 | ((pts as u8) << 1),
        ]
    }

    /// PES packet with an optional PTS and the given payload.
    pub(crate) fn pes(stream_id: u8, pts: Option<i64>, payload: &[u8]) -> Vec<u8> {
        let header_data: Vec<u8> = pts.map(|p| encode_pts(p).to_vec()).unwrap_or_default();
        let flags = if pts.is_some() { 0x80 } else { 0x00 };
        let len = 3 + header_data.len() + payload.len();
        let mut out = vec![0x00, 0x00, 0x01, stream_id, (len >> 8) as u8, len as u8];
        out.extend_from_slice(&[0x80, flags, header_data.len() as u8]);
        out.extend_from_slice(&header_data);
        out.extend_from_slice(payload);
        out
    }

    /// 188-byte transport packet carrying `payload`, stuffed with an
    /// adaptation field when the payload is short.
    pub(crate) fn ts_packet(pid: u16, start: bool, payload: &[u8]) -> Vec<u8> {
        let room = TS_PACKET_SIZE - TS_HEADER_SIZE;
        assert!(payload.len() <= room);
        let mut out = vec![
            TS_SYNC_BYTE,
            ((start as u8) << 6) | ((pid >> 8) as u8 & 0x1F),
            pid as u8,
            0x10,
        ];
        if payload.len() < room {
            out[3] |= 0x20;
            let af_len = room - payload.len() - 1;
            out.push(af_len as u8);
            if af_len > 0 {
                out.push(0x00);
                out.extend(std::iter::repeat(0xFF).take(af_len - 1));
            }
        }
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_ts_header() {
        let pkt = ts_packet(0x1FF, true, &[1, 2, 3]);
        assert_eq!(pkt.len(), TS_PACKET_SIZE);
        assert_eq!(pid(&pkt), Some(0x1FF));
        assert!(payload_unit_start(&pkt));
        assert_eq!(payload(&pkt), Some(&[1u8, 2, 3][..]));

        let full = ts_packet(101, false, &[0xAA; 184]);
        assert_eq!(payload_offset(&full), Some(4));
        assert!(!payload_unit_start(&full));
        assert_eq!(pid(&[0x00, 0x01, 0x02, 0x10]), None);
    }

    #[test]
    fn test_pes_pts() {
        let p = pes(0xE0, Some(0x1_2345_6789), &[9, 9]);
        assert!(pes_has_pts(&p));
        assert_eq!(pes_pts(&p), Some(Pts::new(0x1_2345_6789)));
        assert_eq!(pes_payload_offset(&p), Some(14));
        assert_eq!(&p[14..], &[9, 9]);
        assert_eq!(pes_declared_length(&p), Some(p.len() - 6));

        let q = pes(0xC0, None, &[1]);
        assert!(!pes_has_pts(&q));
        assert_eq!(pes_pts(&q), None);
        assert_eq!(pes_payload_offset(&q), Some(9));
    }

    #[test]
    fn test_padding_stream_has_no_optional_header() {
        let p = [0x00, 0x00, 0x01, 0xBE, 0x00, 0x02, 0xFF, 0xFF];
        assert_eq!(pes_payload_offset(&p), Some(6));
        assert!(!pes_has_pts(&p));
    }

    #[test]
    fn test_split_pes() {
        let mut buf = pes(0xE0, None, &[1, 2, 3]);
        buf.extend(pes(0xC0, None, &[4]));
        let mut unbounded = pes(0xE0, None, &[5, 6]);
        unbounded[4] = 0;
        unbounded[5] = 0;
        buf.extend(&unbounded);

        let units = split_pes(&buf);
        assert_eq!(units.len(), 3);
        assert_eq!(pes_stream_id(units[1]), Some(0xC0));
        assert_eq!(units[2].len(), unbounded.len());
        assert!(split_pes(&[0x12, 0x34]).is_empty());
    }
}
