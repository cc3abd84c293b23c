// PSI - program map discovery from PAT/PMT sections
//
// Only what the stream router consults is kept: the video PID with its
// stream type, the primary audio list, and the secondary list of
// AC-3 class streams that are announced by descriptor rather than by
// stream type. Sections are expected to fit in one transport packet.

use serde::{Deserialize, Serialize};

use crate::codec::{
    AC3_DESCRIPTOR_TAG, ENHANCED_AC3_DESCRIPTOR_TAG, STREAM_TYPE_AAC, STREAM_TYPE_AAC_LATM,
    STREAM_TYPE_H264, STREAM_TYPE_MPEG1_AUDIO, STREAM_TYPE_MPEG1_VIDEO, STREAM_TYPE_MPEG2_AUDIO,
    STREAM_TYPE_MPEG2_VIDEO,
};
use crate::ts;

// ============================================================================
// Constants
// ============================================================================

const TABLE_ID_PAT: u8 = 0x00;
const TABLE_ID_PMT: u8 = 0x02;

const STREAM_TYPE_PRIVATE_PES: u8 = 0x06;
const STREAM_TYPE_H265: u8 = 0x24;
const STREAM_TYPE_ATSC_AC3: u8 = 0x81;
const STREAM_TYPE_ATSC_EAC3: u8 = 0x87;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EsEntry {
    pub pid: u16,
    pub stream_type: u8,
}

/// Elementary streams signaled for the current program.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramMap {
    pub video: Option<EsEntry>,
    pub audio: Vec<EsEntry>,
    /// AC-3 class streams; `stream_type` holds the announcing descriptor tag.
    pub secondary_audio: Vec<EsEntry>,
}

impl ProgramMap {
    pub fn video_pid(&self) -> Option<u16> {
        self.video.map(|v| v.pid)
    }

    pub fn video_stream_type(&self) -> Option<u8> {
        self.video.map(|v| v.stream_type)
    }

    /// Stream type of an audio PID, primary list first.
    pub fn audio_stream_type(&self, pid: u16) -> Option<u8> {
        self.audio
            .iter()
            .chain(self.secondary_audio.iter())
            .find(|e| e.pid == pid)
            .map(|e| e.stream_type)
    }

    pub fn is_empty(&self) -> bool {
        self.video.is_none() && self.audio.is_empty() && self.secondary_audio.is_empty()
    }
}

// ============================================================================
// Scanner
// ============================================================================

/// Follows PAT and PMT of the first program in a transport stream.
#[derive(Debug, Default)]
pub struct PsiScanner {
    pmt_pid: Option<u16>,
    pmt_version: Option<u8>,
    map: ProgramMap,
}

impl PsiScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn program_map(&self) -> &ProgramMap {
        &self.map
    }

    /// Feeds one transport packet. Returns the new map when a PMT with a
    /// new version has been parsed.
    pub fn push(&mut self, packet: &[u8]) -> Option<&ProgramMap> {
        let pid = ts::pid(packet)?;
        if !ts::payload_unit_start(packet) {
            return None;
        }
        let payload = ts::payload(packet)?;

        if pid == ts::PAT_PID {
            if let Some(pmt_pid) = parse_pat(payload) {
                if self.pmt_pid != Some(pmt_pid) {
                    tracing::debug!("PAT: program map on PID {}", pmt_pid);
                    self.pmt_pid = Some(pmt_pid);
                    self.pmt_version = None;
                }
            }
            return None;
        }

        if Some(pid) != self.pmt_pid {
            return None;
        }

        let (version, map) = parse_pmt(payload)?;
        if self.pmt_version == Some(version) {
            return None;
        }
        tracing::info!(
            "PMT v{}: video {:?}, {} audio, {} secondary audio",
            version,
            map.video,
            map.audio.len(),
            map.secondary_audio.len()
        );
        self.pmt_version = Some(version);
        self.map = map;
        Some(&self.map)
    }
}

/// Skips the pointer field and checks the table id.
fn section(payload: &[u8], table_id: u8) -> Option<&[u8]> {
    let pointer = *payload.first()? as usize;
    let section = payload.get(1 + pointer..)?;
    if section.len() < 8 || section[0] != table_id {
        return None;
    }
    let section_length = (((section[1] as usize) & 0x0F) << 8) | section[2] as usize;
    // Drop the trailing CRC
    let end = (3 + section_length).min(section.len()).checked_sub(4)?;
    Some(&section[..end])
}

/// PMT PID of the first real program.
fn parse_pat(payload: &[u8]) -> Option<u16> {
    let section = section(payload, TABLE_ID_PAT)?;

    section
        .get(8..)?
        .chunks_exact(4)
        .find(|entry| ((entry[0] as u16) << 8 | entry[1] as u16) != 0)
        .map(|entry| ((entry[2] as u16 & 0x1F) << 8) | entry[3] as u16)
}

fn parse_pmt(payload: &[u8]) -> Option<(u8, ProgramMap)> {
    let section = section(payload, TABLE_ID_PMT)?;
    if section.len() < 12 {
        return None;
    }

    let version = (section[5] >> 1) & 0x1F;
    let program_info_length = (((section[10] as usize) & 0x0F) << 8) | section[11] as usize;
    let mut pos = 12 + program_info_length;
    let mut map = ProgramMap::default();

    while pos + 5 <= section.len() {
        let stream_type = section[pos];
        let pid = (((section[pos + 1] as u16) & 0x1F) << 8) | section[pos + 2] as u16;
        let es_info_length =
            (((section[pos + 3] as usize) & 0x0F) << 8) | section[pos + 4] as usize;
        let descriptors = section
            .get(pos + 5..pos + 5 + es_info_length)
            .unwrap_or(&[]);

        match stream_type {
            STREAM_TYPE_MPEG1_VIDEO | STREAM_TYPE_MPEG2_VIDEO | STREAM_TYPE_H264
            | STREAM_TYPE_H265 => {
                if map.video.is_none() {
                    map.video = Some(EsEntry { pid, stream_type });
                }
            }
            STREAM_TYPE_MPEG1_AUDIO | STREAM_TYPE_MPEG2_AUDIO | STREAM_TYPE_AAC
            | STREAM_TYPE_AAC_LATM => {
                map.audio.push(EsEntry { pid, stream_type });
            }
            STREAM_TYPE_ATSC_AC3 => map.secondary_audio.push(EsEntry {
                pid,
                stream_type: AC3_DESCRIPTOR_TAG,
            }),
            STREAM_TYPE_ATSC_EAC3 => map.secondary_audio.push(EsEntry {
                pid,
                stream_type: ENHANCED_AC3_DESCRIPTOR_TAG,
            }),
            STREAM_TYPE_PRIVATE_PES => {
                if let Some(tag) = ac3_descriptor(descriptors) {
                    map.secondary_audio.push(EsEntry {
                        pid,
                        stream_type: tag,
                    });
                }
            }
            _ => {}
        }

        pos += 5 + es_info_length;
    }

    Some((version, map))
}

fn ac3_descriptor(data: &[u8]) -> Option<u8> {
    let mut pos = 0;

    while pos + 2 <= data.len() {
        let tag = data[pos];
        if tag == AC3_DESCRIPTOR_TAG || tag == ENHANCED_AC3_DESCRIPTOR_TAG {
            return Some(tag);
        }
        pos += 2 + data[pos + 1] as usize;
    }

    None
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ts::tests::ts_packet;

    pub(crate) const NO_DESCRIPTORS: &[u8] = &[];

    fn wrap_section(table_id: u8, body: &[u8]) -> Vec<u8> {
        // body starts after section_length; CRC is not checked
        let len = body.len() + 4;
        let mut s = vec![0x00, table_id, 0xB0 | (len >> 8) as u8, len as u8];
        s.extend_from_slice(body);
        s.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        s
    }

    pub(crate) fn pat_packet(pmt_pid: u16) -> Vec<u8> {
        let body = [
            0x00, 0x01, 0xC1, 0x00, 0x00, // tsid, version, section numbers
            0x00, 0x00, 0xE0, 0x10, // program 0 -> NIT
            0x00, 0x01, 0xE0 | (pmt_pid >> 8) as u8, pmt_pid as u8,
        ];
        ts_packet(ts::PAT_PID, true, &wrap_section(TABLE_ID_PAT, &body))
    }

    /// PMT with `(stream_type, pid, descriptors)` entries.
    pub(crate) fn pmt_packet(pmt_pid: u16, version: u8, streams: &[(u8, u16, &[u8])]) -> Vec<u8> {
        let mut body = vec![
            0x00,
            0x01,
            0xC1 | (version << 1),
            0x00,
            0x00,
            0xE1,
            0x00, // PCR PID
            0xF0,
            0x00, // program info length
        ];
        for (stream_type, pid, desc) in streams {
            body.push(*stream_type);
            body.push(0xE0 | (pid >> 8) as u8);
            body.push(*pid as u8);
            body.push(0xF0 | (desc.len() >> 8) as u8);
            body.push(desc.len() as u8);
            body.extend_from_slice(desc);
        }
        ts_packet(pmt_pid, true, &wrap_section(TABLE_ID_PMT, &body))
    }

    #[test]
    fn test_scan_program_map() {
        let mut scanner = PsiScanner::new();
        assert!(scanner.push(&pat_packet(0x100)).is_none());

        let streams: [(u8, u16, &[u8]); 5] = [
            (0x1B, 101, &[]),
            (0x03, 201, &[0x0A, 0x04, b'd', b'e', b'u', 0x00]),
            (0x06, 202, &[0x0A, 0x04, b'e', b'n', b'g', 0x00, 0x6A, 0x01, 0x00]),
            (0x06, 203, &[0x59, 0x00]),
            (0x87, 204, &[]),
        ];
        let pmt = pmt_packet(0x100, 3, &streams);
        let map = scanner.push(&pmt).expect("pmt parsed").clone();
        assert_eq!(map.video, Some(EsEntry { pid: 101, stream_type: 0x1B }));
        assert_eq!(map.audio, vec![EsEntry { pid: 201, stream_type: 0x03 }]);
        assert_eq!(map.audio_stream_type(202), Some(AC3_DESCRIPTOR_TAG));
        assert_eq!(map.audio_stream_type(204), Some(ENHANCED_AC3_DESCRIPTOR_TAG));
        assert_eq!(map.audio_stream_type(203), None);

        // Same version again is not reported
        assert!(scanner.push(&pmt).is_none());
        let bumped = pmt_packet(0x100, 4, &[(0x02, 110, NO_DESCRIPTORS)]);
        let map = scanner.push(&bumped).expect("new version");
        assert_eq!(map.video_pid(), Some(110));
        assert!(map.audio.is_empty());
    }

    #[test]
    fn test_pmt_on_unknown_pid_ignored() {
        let mut scanner = PsiScanner::new();
        assert!(scanner
            .push(&pmt_packet(0x100, 0, &[(0x1B, 101, NO_DESCRIPTORS)]))
            .is_none());
        assert!(scanner.program_map().is_empty());
    }
}
