//! MP4 atom definitions.

use crate::track::TrackKind;

/// Four-character atom type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AtomType(pub [u8; 4]);

impl AtomType {
    pub const FTYP: Self = Self(*b"ftyp");
    pub const STYP: Self = Self(*b"styp");
    pub const MOOV: Self = Self(*b"moov");
    pub const MDAT: Self = Self(*b"mdat");
    pub const MVHD: Self = Self(*b"mvhd");
    pub const TRAK: Self = Self(*b"trak");
    pub const TKHD: Self = Self(*b"tkhd");
    pub const EDTS: Self = Self(*b"edts");
    pub const ELST: Self = Self(*b"elst");
    pub const MDIA: Self = Self(*b"mdia");
    pub const MDHD: Self = Self(*b"mdhd");
    pub const HDLR: Self = Self(*b"hdlr");
    pub const MINF: Self = Self(*b"minf");
    pub const STBL: Self = Self(*b"stbl");
    pub const STSD: Self = Self(*b"stsd");
    pub const STTS: Self = Self(*b"stts");
    pub const STSS: Self = Self(*b"stss");
    pub const STSC: Self = Self(*b"stsc");
    pub const STSZ: Self = Self(*b"stsz");
    pub const STCO: Self = Self(*b"stco");
    pub const CO64: Self = Self(*b"co64");
    pub const CTTS: Self = Self(*b"ctts");
    pub const MVEX: Self = Self(*b"mvex");
    pub const TREX: Self = Self(*b"trex");
    pub const MOOF: Self = Self(*b"moof");
    pub const MFHD: Self = Self(*b"mfhd");
    pub const TRAF: Self = Self(*b"traf");
    pub const TFHD: Self = Self(*b"tfhd");
    pub const TFDT: Self = Self(*b"tfdt");
    pub const TRUN: Self = Self(*b"trun");
    pub const SIDX: Self = Self(*b"sidx");
    pub const FREE: Self = Self(*b"free");
    pub const SKIP: Self = Self(*b"skip");
    pub const UDTA: Self = Self(*b"udta");

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Get the 4-char code as a string.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("????")
    }
}

impl std::fmt::Display for AtomType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parsed atom header.
#[derive(Debug, Clone)]
pub struct Atom {
    /// Atom type code.
    pub atom_type: AtomType,
    /// Atom size including header.
    pub size: u64,
    /// Source offset where atom data starts (after header).
    pub data_offset: u64,
    /// Size of the header (8 or 16 bytes).
    pub header_size: u8,
}

impl Atom {
    /// Get the data size (size - header).
    pub fn data_size(&self) -> u64 {
        self.size.saturating_sub(self.header_size as u64)
    }

    /// Source offset of the first header byte.
    pub fn start(&self) -> u64 {
        self.data_offset - self.header_size as u64
    }

    /// Source offset just past the atom.
    pub fn end(&self) -> u64 {
        self.data_offset + self.data_size()
    }

    /// Check if this atom contains child atoms.
    pub fn is_container(&self) -> bool {
        matches!(
            self.atom_type,
            AtomType::MOOV
                | AtomType::TRAK
                | AtomType::EDTS
                | AtomType::MDIA
                | AtomType::MINF
                | AtomType::STBL
                | AtomType::MVEX
                | AtomType::MOOF
                | AtomType::TRAF
                | AtomType::UDTA
        )
    }
}

/// Handler type for a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerType {
    Video,
    Audio,
    Hint,
    Meta,
    Text,
    Subtitle,
    Unknown([u8; 4]),
}

impl HandlerType {
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        match &bytes {
            b"vide" => Self::Video,
            b"soun" => Self::Audio,
            b"hint" => Self::Hint,
            b"meta" => Self::Meta,
            b"text" => Self::Text,
            b"subt" | b"sbtl" => Self::Subtitle,
            _ => Self::Unknown(bytes),
        }
    }

    /// Handler written for a track of the given kind.
    pub fn for_kind(kind: TrackKind) -> Self {
        match kind {
            TrackKind::Video => Self::Video,
            TrackKind::Audio => Self::Audio,
            TrackKind::Subtitle => Self::Subtitle,
            TrackKind::Other => Self::Meta,
        }
    }

    pub fn as_bytes(&self) -> [u8; 4] {
        match self {
            Self::Video => *b"vide",
            Self::Audio => *b"soun",
            Self::Hint => *b"hint",
            Self::Meta => *b"meta",
            Self::Text => *b"text",
            Self::Subtitle => *b"subt",
            Self::Unknown(bytes) => *bytes,
        }
    }

    pub fn track_kind(&self) -> TrackKind {
        match self {
            Self::Video => TrackKind::Video,
            Self::Audio => TrackKind::Audio,
            Self::Text | Self::Subtitle => TrackKind::Subtitle,
            _ => TrackKind::Other,
        }
    }
}

/// Pack an ISO-639-2 code into the 15-bit mdhd representation.
///
/// Anything that is not three lowercase letters becomes `und`.
pub fn pack_language(code: &str) -> u16 {
    let bytes = code.as_bytes();
    if bytes.len() != 3 || !bytes.iter().all(u8::is_ascii_lowercase) {
        return 0x55C4;
    }
    bytes
        .iter()
        .fold(0u16, |acc, &c| (acc << 5) | (c - 0x60) as u16)
}

/// Unpack a 15-bit mdhd language code.
pub fn unpack_language(packed: u16) -> Option<String> {
    let chars = [
        ((packed >> 10) & 0x1F) as u8,
        ((packed >> 5) & 0x1F) as u8,
        (packed & 0x1F) as u8,
    ];
    if chars.iter().any(|&c| c == 0 || c > 26) {
        return None;
    }
    Some(chars.iter().map(|&c| (c + 0x60) as char).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_packing() {
        assert_eq!(pack_language("und"), 0x55C4);
        assert_eq!(pack_language("eng"), 0x15C7);
        assert_eq!(pack_language("EN"), 0x55C4);
        assert_eq!(unpack_language(0x15C7).as_deref(), Some("eng"));
        assert_eq!(unpack_language(0), None);
    }

    #[test]
    fn test_handler_mapping() {
        assert_eq!(HandlerType::from_bytes(*b"soun").track_kind(), TrackKind::Audio);
        assert_eq!(HandlerType::for_kind(TrackKind::Video).as_bytes(), *b"vide");
        assert_eq!(
            HandlerType::from_bytes(*b"abcd").track_kind(),
            TrackKind::Other
        );
    }
}
