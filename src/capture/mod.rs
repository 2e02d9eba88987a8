//! Raw capture container decoding.
//!
//! Producers deposit little-endian binary capture files: a fixed header
//! carrying the run id and declared event count, followed by one frame per
//! event. Header probing and full decoding are separate so the watcher can
//! inspect a file without pulling the whole payload.
//!
//! Layout:
//!
//! ```text
//! header   magic "WCA1" | run u32 | events u32 | reserved u32
//! event    seq u32 | payload_len u32 | payload
//! payload  hit records: layer u8 | cell u16 | adc u16
//! ```

use std::path::Path;

use thiserror::Error;
use tokio::io::AsyncReadExt;

/// File magic, first four bytes of every capture file.
pub const MAGIC: [u8; 4] = *b"WCA1";

/// Capture header size in bytes.
pub const HEADER_SIZE: usize = 16;

/// Per-event frame header size in bytes (seq + payload length).
pub const FRAME_HEADER_SIZE: usize = 8;

/// Hit record size in bytes (layer + cell + adc).
pub const HIT_SIZE: usize = 5;

/// Errors that can occur while decoding a capture file.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("reading capture file: {0}")]
    Io(#[from] std::io::Error),

    #[error("capture too short: {size} bytes")]
    Truncated { size: usize },

    #[error("bad capture magic: {found:02x?}")]
    BadMagic { found: [u8; 4] },

    #[error("event frame {index}: unexpected end of data")]
    FrameTruncated { index: u32 },

    #[error("event frame {index}: payload length {len} is not hit-aligned")]
    UnalignedPayload { index: u32, len: u32 },

    #[error("capture declares {declared} events but contains {found}")]
    CountMismatch { declared: u32, found: u32 },
}

/// Decoded capture header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureHeader {
    pub run: u32,
    pub events: u32,
}

/// One hit record from an event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hit {
    pub layer: u8,
    pub cell: u16,
    pub adc: u16,
}

/// One fully decoded event frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    pub seq: u32,
    pub hits: Vec<Hit>,
}

impl DecodedEvent {
    /// Size of the event payload on disk.
    pub fn payload_bytes(&self) -> usize {
        self.hits.len() * HIT_SIZE
    }
}

/// Parse a capture header from the first [`HEADER_SIZE`] bytes.
pub fn parse_header(data: &[u8]) -> Result<CaptureHeader, CaptureError> {
    if data.len() < HEADER_SIZE {
        return Err(CaptureError::Truncated { size: data.len() });
    }

    let mut found = [0u8; 4];
    found.copy_from_slice(&data[..4]);
    if found != MAGIC {
        return Err(CaptureError::BadMagic { found });
    }

    Ok(CaptureHeader {
        run: read_u32_le(data, 4),
        events: read_u32_le(data, 8),
    })
}

/// Decode a full capture buffer into its header and events.
///
/// The declared event count must match the number of frames present.
pub fn decode(data: &[u8]) -> Result<(CaptureHeader, Vec<DecodedEvent>), CaptureError> {
    let header = parse_header(data)?;

    let mut events = Vec::with_capacity(header.events as usize);
    let mut offset = HEADER_SIZE;

    while offset < data.len() {
        let index = events.len() as u32;
        if data.len() - offset < FRAME_HEADER_SIZE {
            return Err(CaptureError::FrameTruncated { index });
        }

        let seq = read_u32_le(data, offset);
        let len = read_u32_le(data, offset + 4);
        offset += FRAME_HEADER_SIZE;

        if len as usize % HIT_SIZE != 0 {
            return Err(CaptureError::UnalignedPayload { index, len });
        }
        if data.len() - offset < len as usize {
            return Err(CaptureError::FrameTruncated { index });
        }

        let mut hits = Vec::with_capacity(len as usize / HIT_SIZE);
        let payload_end = offset + len as usize;
        while offset < payload_end {
            hits.push(Hit {
                layer: data[offset],
                cell: read_u16_le(data, offset + 1),
                adc: read_u16_le(data, offset + 3),
            });
            offset += HIT_SIZE;
        }

        events.push(DecodedEvent { seq, hits });
    }

    let found = events.len() as u32;
    if found != header.events {
        return Err(CaptureError::CountMismatch {
            declared: header.events,
            found,
        });
    }

    Ok((header, events))
}

/// Read only the header of a capture file.
pub async fn probe(path: &Path) -> Result<CaptureHeader, CaptureError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = [0u8; HEADER_SIZE];
    file.read_exact(&mut buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            CaptureError::Truncated { size: 0 }
        } else {
            CaptureError::Io(e)
        }
    })?;
    parse_header(&buf)
}

/// Read and decode a whole capture file.
pub async fn read_file(path: &Path) -> Result<(CaptureHeader, Vec<DecodedEvent>), CaptureError> {
    let data = tokio::fs::read(path).await?;
    decode(&data)
}

// ---------------------------------------------------------------------------
// Byte-reading helpers. Callers verify lengths before reading fixed offsets.
// ---------------------------------------------------------------------------

#[inline]
fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    let mut b = [0u8; 2];
    b.copy_from_slice(&data[offset..offset + 2]);
    u16::from_le_bytes(b)
}

#[inline]
fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(run: u32, events: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&run.to_le_bytes());
        buf.extend_from_slice(&events.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf
    }

    fn push_event(buf: &mut Vec<u8>, seq: u32, hits: &[(u8, u16, u16)]) {
        buf.extend_from_slice(&seq.to_le_bytes());
        buf.extend_from_slice(&((hits.len() * HIT_SIZE) as u32).to_le_bytes());
        for &(layer, cell, adc) in hits {
            buf.push(layer);
            buf.extend_from_slice(&cell.to_le_bytes());
            buf.extend_from_slice(&adc.to_le_bytes());
        }
    }

    fn capture_bytes(run: u32, events: &[Vec<(u8, u16, u16)>]) -> Vec<u8> {
        let mut buf = header_bytes(run, events.len() as u32);
        for (i, hits) in events.iter().enumerate() {
            push_event(&mut buf, i as u32, hits);
        }
        buf
    }

    #[test]
    fn test_parse_header() {
        let buf = header_bytes(4242, 7);
        let header = parse_header(&buf).expect("parse header");
        assert_eq!(header.run, 4242);
        assert_eq!(header.events, 7);
    }

    #[test]
    fn test_parse_header_bad_magic() {
        let mut buf = header_bytes(1, 1);
        buf[0] = b'X';
        assert!(matches!(
            parse_header(&buf),
            Err(CaptureError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_parse_header_truncated() {
        let buf = header_bytes(1, 1);
        assert!(matches!(
            parse_header(&buf[..10]),
            Err(CaptureError::Truncated { size: 10 })
        ));
    }

    #[test]
    fn test_decode_events_and_hits() {
        let buf = capture_bytes(
            99,
            &[
                vec![(0, 10, 500), (0, 11, 300)],
                vec![(1, 200, 80)],
                vec![],
            ],
        );

        let (header, events) = decode(&buf).expect("decode");
        assert_eq!(header.run, 99);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].hits.len(), 2);
        assert_eq!(
            events[0].hits[1],
            Hit {
                layer: 0,
                cell: 11,
                adc: 300
            }
        );
        assert_eq!(events[1].seq, 1);
        assert!(events[2].hits.is_empty());
        assert_eq!(events[0].payload_bytes(), 2 * HIT_SIZE);
    }

    #[test]
    fn test_decode_count_mismatch() {
        let mut buf = header_bytes(5, 2);
        push_event(&mut buf, 0, &[(0, 1, 2)]);
        assert!(matches!(
            decode(&buf),
            Err(CaptureError::CountMismatch {
                declared: 2,
                found: 1
            })
        ));
    }

    #[test]
    fn test_decode_truncated_frame() {
        let buf = capture_bytes(5, &[vec![(0, 1, 2)]]);
        assert!(matches!(
            decode(&buf[..buf.len() - 2]),
            Err(CaptureError::FrameTruncated { index: 0 })
        ));
    }

    #[test]
    fn test_decode_unaligned_payload() {
        let mut buf = header_bytes(5, 1);
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&7u32.to_le_bytes());
        buf.extend_from_slice(&[0u8; 7]);
        assert!(matches!(
            decode(&buf),
            Err(CaptureError::UnalignedPayload { index: 0, len: 7 })
        ));
    }

    #[tokio::test]
    async fn test_probe_reads_header_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("unit_20250101_1200.raw");
        std::fs::write(&path, capture_bytes(7, &[vec![(0, 1, 2)]])).expect("write");

        let header = probe(&path).await.expect("probe");
        assert_eq!(header.run, 7);
        assert_eq!(header.events, 1);
    }

    #[tokio::test]
    async fn test_probe_empty_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("empty.raw");
        std::fs::write(&path, b"").expect("write");
        assert!(matches!(
            probe(&path).await,
            Err(CaptureError::Truncated { .. })
        ));
    }
}
