//! EBML primitives: element IDs, variable-size integers and element values.

use crate::stream::SeekableSource;
use crate::{Error, Result};
use bytes::{BufMut, BytesMut};

/// Element IDs, with their length marker bits kept.
pub mod ids {
    pub const EBML: u32 = 0x1A45DFA3;
    pub const EBML_VERSION: u32 = 0x4286;
    pub const EBML_READ_VERSION: u32 = 0x42F7;
    pub const EBML_MAX_ID_LENGTH: u32 = 0x42F2;
    pub const EBML_MAX_SIZE_LENGTH: u32 = 0x42F3;
    pub const DOC_TYPE: u32 = 0x4282;
    pub const DOC_TYPE_VERSION: u32 = 0x4287;
    pub const DOC_TYPE_READ_VERSION: u32 = 0x4285;
    pub const VOID: u32 = 0xEC;

    pub const SEGMENT: u32 = 0x18538067;
    pub const SEEK_HEAD: u32 = 0x114D9B74;
    pub const SEEK: u32 = 0x4DBB;
    pub const SEEK_ID: u32 = 0x53AB;
    pub const SEEK_POSITION: u32 = 0x53AC;

    pub const INFO: u32 = 0x1549A966;
    pub const TIMECODE_SCALE: u32 = 0x2AD7B1;
    pub const DURATION: u32 = 0x4489;
    pub const MUXING_APP: u32 = 0x4D80;
    pub const WRITING_APP: u32 = 0x5741;

    pub const TRACKS: u32 = 0x1654AE6B;
    pub const TRACK_ENTRY: u32 = 0xAE;
    pub const TRACK_NUMBER: u32 = 0xD7;
    pub const TRACK_UID: u32 = 0x73C5;
    pub const TRACK_TYPE: u32 = 0x83;
    pub const FLAG_LACING: u32 = 0x9C;
    pub const LANGUAGE: u32 = 0x22B59C;
    pub const CODEC_ID: u32 = 0x86;
    pub const CODEC_PRIVATE: u32 = 0x63A2;
    pub const CODEC_DELAY: u32 = 0x56AA;
    pub const SEEK_PRE_ROLL: u32 = 0x56BB;
    pub const DEFAULT_DURATION: u32 = 0x23E383;
    pub const VIDEO: u32 = 0xE0;
    pub const PIXEL_WIDTH: u32 = 0xB0;
    pub const PIXEL_HEIGHT: u32 = 0xBA;
    pub const AUDIO: u32 = 0xE1;
    pub const SAMPLING_FREQUENCY: u32 = 0xB5;
    pub const CHANNELS: u32 = 0x9F;
    pub const BIT_DEPTH: u32 = 0x6264;

    pub const CLUSTER: u32 = 0x1F43B675;
    pub const TIMECODE: u32 = 0xE7;
    pub const SIMPLE_BLOCK: u32 = 0xA3;
    pub const BLOCK_GROUP: u32 = 0xA0;
    pub const BLOCK: u32 = 0xA1;
    pub const BLOCK_DURATION: u32 = 0x9B;
    pub const REFERENCE_BLOCK: u32 = 0xFB;

    pub const CUES: u32 = 0x1C53BB6B;
    pub const CUE_POINT: u32 = 0xBB;
    pub const CUE_TIME: u32 = 0xB3;
    pub const CUE_TRACK_POSITIONS: u32 = 0xB7;
    pub const CUE_TRACK: u32 = 0xF7;
    pub const CUE_CLUSTER_POSITION: u32 = 0xF1;

    pub const CHAPTERS: u32 = 0x1043A770;
    pub const TAGS: u32 = 0x1254C367;
    pub const ATTACHMENTS: u32 = 0x1941A469;

    /// Whether `id` is a direct child of Segment.
    pub fn is_top_level(id: u32) -> bool {
        matches!(
            id,
            SEEK_HEAD | INFO | TRACKS | CLUSTER | CUES | CHAPTERS | TAGS | ATTACHMENTS
        )
    }
}

/// Largest value a vint can carry; all-ones is reserved for "unknown".
pub const MAX_VINT: u64 = (1 << 56) - 2;

/// Header of an element in a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Element {
    pub id: u32,
    /// Offset of the first ID byte.
    pub offset: u64,
    /// Offset of the payload.
    pub data_offset: u64,
    /// Payload size. Unknown sizes are resolved to the end of the parent.
    pub size: u64,
    /// The size field held the reserved "unknown" value.
    pub unknown_size: bool,
}

impl Element {
    /// Offset just past the payload.
    pub fn end(&self) -> u64 {
        self.data_offset + self.size
    }
}

fn read_byte<S: SeekableSource + ?Sized>(source: &mut S) -> Result<u8> {
    let mut byte = [0u8; 1];
    source.read_fully(&mut byte)?;
    Ok(byte[0])
}

/// Read an element ID, keeping the marker bits.
pub fn read_id<S: SeekableSource + ?Sized>(source: &mut S) -> Result<u32> {
    let first = read_byte(source)?;
    let len = first.leading_zeros() as usize + 1;
    if first == 0 || len > 4 {
        return Err(Error::malformed(format!(
            "invalid EBML id at {}",
            source.position() - 1
        )));
    }
    let mut id = first as u32;
    for _ in 1..len {
        id = (id << 8) | read_byte(source)? as u32;
    }
    Ok(id)
}

/// Read a vint, returning `None` for the reserved "unknown" value.
pub fn read_vint<S: SeekableSource + ?Sized>(source: &mut S) -> Result<Option<u64>> {
    let first = read_byte(source)?;
    if first == 0 {
        return Err(Error::malformed(format!(
            "invalid EBML vint at {}",
            source.position() - 1
        )));
    }
    let len = first.leading_zeros() as usize + 1;
    let mut value = first as u64 & (0xFFu64 >> len);
    for _ in 1..len {
        value = (value << 8) | read_byte(source)? as u64;
    }

    let unknown = (1u64 << (7 * len)) - 1;
    Ok(if value == unknown { None } else { Some(value) })
}

/// Read the element header at the current position.
///
/// The element must fit within `parent_end`; an unknown size extends to it.
pub fn read_element<S: SeekableSource + ?Sized>(source: &mut S, parent_end: u64) -> Result<Element> {
    let offset = source.position();
    let id = read_id(source)?;
    let size = read_vint(source)?;
    let data_offset = source.position();

    let available = parent_end.saturating_sub(data_offset);
    let unknown_size = size.is_none();
    let size = match size {
        Some(size) if size > available => {
            return Err(Error::malformed(format!(
                "element {:#X} at {} ({} bytes) overruns its parent ending at {}",
                id, offset, size, parent_end
            )));
        }
        Some(size) => size,
        None => available,
    };

    Ok(Element {
        id,
        offset,
        data_offset,
        size,
        unknown_size,
    })
}

/// Read a big-endian unsigned integer payload.
pub fn read_uint<S: SeekableSource + ?Sized>(source: &mut S, element: &Element) -> Result<u64> {
    if element.size > 8 {
        return Err(Error::malformed(format!(
            "integer element {:#X} has {} bytes",
            element.id, element.size
        )));
    }
    let mut buf = [0u8; 8];
    let start = 8 - element.size as usize;
    source.read_fully(&mut buf[start..])?;
    Ok(u64::from_be_bytes(buf))
}

/// Read a float payload (0, 4 or 8 bytes).
pub fn read_float<S: SeekableSource + ?Sized>(source: &mut S, element: &Element) -> Result<f64> {
    match element.size {
        0 => Ok(0.0),
        4 => {
            let mut buf = [0u8; 4];
            source.read_fully(&mut buf)?;
            Ok(f32::from_be_bytes(buf) as f64)
        }
        8 => {
            let mut buf = [0u8; 8];
            source.read_fully(&mut buf)?;
            Ok(f64::from_be_bytes(buf))
        }
        other => Err(Error::malformed(format!(
            "float element {:#X} has {} bytes",
            element.id, other
        ))),
    }
}

/// Read a string payload, dropping trailing NUL padding.
pub fn read_string<S: SeekableSource + ?Sized>(source: &mut S, element: &Element) -> Result<String> {
    let data = read_binary(source, element)?;
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    Ok(String::from_utf8_lossy(&data[..end]).into_owned())
}

/// Maximum binary payload loaded into memory (codec private, settings).
const MAX_BINARY_SIZE: u64 = 16 * 1024 * 1024;

pub fn read_binary<S: SeekableSource + ?Sized>(source: &mut S, element: &Element) -> Result<Vec<u8>> {
    if element.size > MAX_BINARY_SIZE {
        return Err(Error::malformed(format!(
            "element {:#X} payload of {} bytes is too large",
            element.id, element.size
        )));
    }
    source.read_vec(element.size as usize)
}

/// Encoded length of an ID.
pub fn id_len(id: u32) -> usize {
    match id {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    }
}

/// Smallest vint length able to carry `value`.
pub fn vint_len(value: u64) -> usize {
    (1..=8)
        .find(|&len| value < (1u64 << (7 * len)) - 1)
        .unwrap_or(8)
}

/// Full size of an element whose payload has `payload` bytes.
pub fn element_size(id: u32, payload: u64) -> u64 {
    id_len(id) as u64 + vint_len(payload) as u64 + payload
}

pub fn put_id(buf: &mut BytesMut, id: u32) {
    let len = id_len(id);
    buf.put_slice(&id.to_be_bytes()[4 - len..]);
}

/// Write `value` as a vint of exactly `len` bytes.
pub fn put_vint(buf: &mut BytesMut, value: u64, len: usize) {
    let marked = value | (1u64 << (7 * len));
    buf.put_slice(&marked.to_be_bytes()[8 - len..]);
}

/// Write an element with the given payload.
pub fn put_element(buf: &mut BytesMut, id: u32, payload: &[u8]) {
    put_id(buf, id);
    put_vint(buf, payload.len() as u64, vint_len(payload.len() as u64));
    buf.put_slice(payload);
}

/// Unsigned integer element using the fewest bytes.
pub fn put_uint(buf: &mut BytesMut, id: u32, value: u64) {
    let width = ((64 - value.leading_zeros() as usize) + 7) / 8;
    put_uint_fixed(buf, id, value, width.max(1));
}

/// Unsigned integer element with a fixed payload width.
pub fn put_uint_fixed(buf: &mut BytesMut, id: u32, value: u64, width: usize) {
    put_element(buf, id, &value.to_be_bytes()[8 - width..]);
}

/// Signed integer element using the fewest bytes.
pub fn put_int(buf: &mut BytesMut, id: u32, value: i64) {
    let width = (1..=8)
        .find(|&w| {
            let bits = 8 * w as u32;
            bits == 64 || (value >= -(1i64 << (bits - 1)) && value < (1i64 << (bits - 1)))
        })
        .unwrap_or(8);
    put_element(buf, id, &value.to_be_bytes()[8 - width..]);
}

/// Read a big-endian two's complement integer payload.
pub fn read_int<S: SeekableSource + ?Sized>(source: &mut S, element: &Element) -> Result<i64> {
    let raw = read_uint(source, element)?;
    let bits = element.size as u32 * 8;
    if bits == 0 || bits == 64 {
        return Ok(raw as i64);
    }
    let shift = 64 - bits;
    Ok(((raw << shift) as i64) >> shift)
}

pub fn put_float(buf: &mut BytesMut, id: u32, value: f64) {
    put_element(buf, id, &value.to_be_bytes());
}

pub fn put_string(buf: &mut BytesMut, id: u32, value: &str) {
    put_element(buf, id, value.as_bytes());
}

/// Open a master element with an 8-byte size placeholder.
pub fn begin_master(buf: &mut BytesMut, id: u32) -> usize {
    put_id(buf, id);
    let start = buf.len();
    buf.put_u64(0); // placeholder size
    start
}

/// Backpatch a master element opened with [`begin_master`].
pub fn end_master(buf: &mut BytesMut, start: usize) {
    let size = (buf.len() - start - 8) as u64;
    let mut encoded = BytesMut::with_capacity(8);
    put_vint(&mut encoded, size, 8);
    buf[start..start + 8].copy_from_slice(&encoded);
}
