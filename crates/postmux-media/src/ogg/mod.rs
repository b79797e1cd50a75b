//! Ogg pages: CRC, encoding and a small page reader.
//!
//! [`OggWriter`] re-wraps an Opus or Vorbis track demuxed from WebM into an
//! Ogg stream; [`OggPageReader`] walks the pages back for validation.

mod writer;

pub use writer::{OggWriter, OPUS_GRANULE_RATE};

use crate::stream::SeekableSource;
use crate::{Error, Result};
use bytes::{BufMut, BytesMut};

/// Capture pattern at the start of every page.
pub const OGG_MAGIC: [u8; 4] = *b"OggS";

/// Page continues a packet from the previous page.
pub const FLAG_CONTINUED: u8 = 0x01;
/// First page of the logical stream.
pub const FLAG_BOS: u8 = 0x02;
/// Last page of the logical stream.
pub const FLAG_EOS: u8 = 0x04;

/// Fixed part of the page header.
pub const PAGE_HEADER_SIZE: usize = 27;
/// Offset of the CRC field in the page header.
const CHECKSUM_OFFSET: usize = 22;
/// Maximum lacing values per page.
pub const MAX_SEGMENTS: usize = 255;
/// Payload of a page filled with 255-byte segments.
pub const MAX_PAGE_PAYLOAD: usize = MAX_SEGMENTS * 255;

const CRC_TABLE: [u32; 256] = crc_table();

const fn crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Continue an Ogg CRC-32 (polynomial 0x04C11DB7, MSB first) over `data`.
pub fn crc32_update(crc: u32, data: &[u8]) -> u32 {
    data.iter().fold(crc, |crc, &byte| {
        (crc << 8) ^ CRC_TABLE[((crc >> 24) as u8 ^ byte) as usize]
    })
}

/// Ogg CRC-32 of `data`, starting from zero.
pub fn crc32(data: &[u8]) -> u32 {
    crc32_update(0, data)
}

/// Lacing values for one packet: 255-byte runs, then the remainder.
///
/// A packet whose size is a multiple of 255 ends with a 0 value.
pub fn lacing_values(size: usize) -> Vec<u8> {
    let mut values = vec![255u8; size / 255];
    values.push((size % 255) as u8);
    values
}

/// One decoded page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OggPage {
    pub flags: u8,
    pub granule_position: u64,
    pub serial: u32,
    pub sequence: u32,
    /// Lacing values.
    pub segments: Vec<u8>,
    pub payload: Vec<u8>,
}

impl OggPage {
    pub fn is_continued(&self) -> bool {
        self.flags & FLAG_CONTINUED != 0
    }

    pub fn is_bos(&self) -> bool {
        self.flags & FLAG_BOS != 0
    }

    pub fn is_eos(&self) -> bool {
        self.flags & FLAG_EOS != 0
    }

    /// Encoded size of the page.
    pub fn size(&self) -> usize {
        PAGE_HEADER_SIZE + self.segments.len() + self.payload.len()
    }

    /// Packets completed on this page. A trailing partial packet is dropped,
    /// and on a continued page the first entry is the tail of an earlier packet.
    pub fn packets(&self) -> Vec<&[u8]> {
        let mut packets = Vec::new();
        let mut start = 0;
        let mut end = 0;
        for &value in &self.segments {
            end += value as usize;
            if value < 255 {
                packets.push(&self.payload[start..end]);
                start = end;
            }
        }
        packets
    }

    /// Serialize the page, computing its CRC.
    pub fn encode(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_slice(&OGG_MAGIC);
        buf.put_u8(0); // version
        buf.put_u8(self.flags);
        buf.put_u64_le(self.granule_position);
        buf.put_u32_le(self.serial);
        buf.put_u32_le(self.sequence);
        buf.put_u32_le(0); // checksum placeholder
        buf.put_u8(self.segments.len() as u8);
        buf.put_slice(&self.segments);
        buf.put_slice(&self.payload);

        let checksum = crc32(&buf[start..]);
        buf[start + CHECKSUM_OFFSET..start + CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_le_bytes());
    }
}

/// Join the packets of consecutive pages, following continuations.
pub fn collect_packets(pages: &[OggPage]) -> Result<Vec<Vec<u8>>> {
    let mut packets = Vec::new();
    let mut partial: Option<Vec<u8>> = None;
    for page in pages {
        if page.is_continued() != partial.is_some() {
            return Err(Error::malformed(format!(
                "Ogg page {} breaks a packet continuation",
                page.sequence
            )));
        }
        let mut start = 0;
        for &value in &page.segments {
            let end = start + value as usize;
            partial
                .get_or_insert_with(Vec::new)
                .extend_from_slice(&page.payload[start..end]);
            start = end;
            if value < 255 {
                packets.extend(partial.take());
            }
        }
    }
    if partial.is_some() {
        return Err(Error::malformed("Ogg stream ends inside a packet"));
    }
    Ok(packets)
}

/// Sequential page reader that validates every CRC.
pub struct OggPageReader<'a, S: ?Sized> {
    source: &'a mut S,
}

impl<'a, S: SeekableSource + ?Sized> OggPageReader<'a, S> {
    pub fn new(source: &'a mut S) -> Self {
        Self { source }
    }

    /// Read the next page, or `None` at the end of the source.
    pub fn next_page(&mut self) -> Result<Option<OggPage>> {
        if self.source.available() == 0 {
            return Ok(None);
        }
        let offset = self.source.position();

        let mut header = [0u8; PAGE_HEADER_SIZE];
        self.source.read_fully(&mut header)?;
        if header[..4] != OGG_MAGIC {
            return Err(Error::malformed(format!("no Ogg capture pattern at {}", offset)));
        }
        if header[4] != 0 {
            return Err(Error::unsupported(format!("Ogg page version {}", header[4])));
        }

        let segments = self.source.read_vec(header[26] as usize)?;
        let payload_size: usize = segments.iter().map(|&v| v as usize).sum();
        let payload = self.source.read_vec(payload_size)?;

        let stored = u32::from_le_bytes([header[22], header[23], header[24], header[25]]);
        header[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].fill(0);
        let computed = crc32_update(crc32_update(crc32(&header), &segments), &payload);
        if stored != computed {
            return Err(Error::malformed(format!(
                "Ogg page at {} has CRC {:08X}, expected {:08X}",
                offset, stored, computed
            )));
        }

        let mut granule = [0u8; 8];
        granule.copy_from_slice(&header[6..14]);
        let page = OggPage {
            flags: header[5],
            granule_position: u64::from_le_bytes(granule),
            serial: u32::from_le_bytes([header[14], header[15], header[16], header[17]]),
            sequence: u32::from_le_bytes([header[18], header[19], header[20], header[21]]),
            segments,
            payload,
        };
        tracing::trace!(
            "Ogg page {} at {}: {} bytes, granule {}",
            page.sequence,
            offset,
            page.payload.len(),
            page.granule_position
        );
        Ok(Some(page))
    }

    /// Read every remaining page.
    pub fn read_all(&mut self) -> Result<Vec<OggPage>> {
        let mut pages = Vec::new();
        while let Some(page) = self.next_page()? {
            pages.push(page);
        }
        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemorySource;

    #[test]
    fn test_crc_check_value() {
        assert_eq!(crc32(b""), 0);
        assert_eq!(crc32(b"123456789"), 0x89A1_897F);
        assert_eq!(crc32_update(crc32(b"1234"), b"56789"), 0x89A1_897F);
    }

    #[test]
    fn test_lacing_values() {
        assert_eq!(lacing_values(0), vec![0]);
        assert_eq!(lacing_values(100), vec![100]);
        assert_eq!(lacing_values(255), vec![255, 0]);
        assert_eq!(lacing_values(600), vec![255, 255, 90]);
    }

    #[test]
    fn test_page_encode_and_read() {
        let mut segments = lacing_values(300);
        segments.extend(lacing_values(5));
        let page = OggPage {
            flags: FLAG_BOS,
            granule_position: 960,
            serial: 7,
            sequence: 0,
            segments,
            payload: vec![0x55; 305],
        };
        let mut buf = BytesMut::new();
        page.encode(&mut buf);
        assert_eq!(buf.len(), page.size());

        let mut source = MemorySource::new(buf.freeze());
        let pages = OggPageReader::new(&mut source).read_all().unwrap();
        assert_eq!(pages, vec![page.clone()]);
        let sizes: Vec<usize> = pages[0].packets().iter().map(|p| p.len()).collect();
        assert_eq!(sizes, vec![300, 5]);
    }

    #[test]
    fn test_collect_packets_across_pages() {
        let page = |flags, segments: Vec<u8>| {
            let size = segments.iter().map(|&v| v as usize).sum();
            OggPage {
                flags,
                granule_position: 0,
                serial: 1,
                sequence: 0,
                segments,
                payload: vec![9; size],
            }
        };
        let first = page(0, vec![10, 255, 255]);
        let second = page(FLAG_CONTINUED, vec![255, 0, 3]);

        let packets = collect_packets(&[first.clone(), second.clone()]).unwrap();
        let sizes: Vec<usize> = packets.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10, 765, 3]);

        assert!(collect_packets(&[first.clone()]).is_err());
        assert!(collect_packets(&[second]).is_err());
        assert!(collect_packets(&[first.clone(), first]).is_err());
    }

    #[test]
    fn test_corrupt_page_is_rejected() {
        let page = OggPage {
            flags: 0,
            granule_position: 0,
            serial: 1,
            sequence: 3,
            segments: vec![4],
            payload: vec![1, 2, 3, 4],
        };
        let mut buf = BytesMut::new();
        page.encode(&mut buf);
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;

        let mut source = MemorySource::new(buf.freeze());
        let result = OggPageReader::new(&mut source).next_page();
        assert!(matches!(result, Err(Error::MalformedContainer(_))));
    }
}
