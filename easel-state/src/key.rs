use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The canonical identifier of an artwork's file.
///
/// Stored as 16 raw bytes on disk; rendered as the 36-char hyphenated
/// lowercase form at interfaces. The two forms round-trip bit-exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageKey(pub Uuid);
impl StorageKey {
    /// Reconstruct a key from its 16 raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// The key's 16 raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Parse the 36-char hyphenated form. Returns `None` for anything else.
    pub fn parse(s: &str) -> Option<Self> {
        // Uuid::parse_str also accepts non-hyphenated and braced forms;
        // interfaces only ever carry the canonical one.
        if s.len() != 36 {
            return None;
        }
        Uuid::parse_str(s).ok().map(Self)
    }

    /// The canonical 36-char hyphenated lowercase form.
    pub fn to_canonical_string(&self) -> String {
        self.0.hyphenated().to_string()
    }
}
impl std::fmt::Display for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// An artwork's file format tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Extension {
    /// WebP.
    #[default]
    Webp,
    /// GIF.
    Gif,
    /// PNG.
    Png,
    /// JPEG.
    Jpeg,
}
impl Extension {
    /// Decode the on-disk tag byte. Unknown values map to WebP.
    pub fn from_tag(tag: u8) -> Self {
        match tag {
            1 => Extension::Gif,
            2 => Extension::Png,
            3 => Extension::Jpeg,
            _ => Extension::Webp,
        }
    }

    /// The on-disk tag byte.
    pub fn tag(&self) -> u8 {
        match self {
            Extension::Webp => 0,
            Extension::Gif => 1,
            Extension::Png => 2,
            Extension::Jpeg => 3,
        }
    }

    /// Parse the wire form ("webp", "gif", "png", "jpg"/"jpeg").
    /// Unknown values map to WebP.
    pub fn from_suffix(suffix: &str) -> Self {
        match suffix {
            "gif" => Extension::Gif,
            "png" => Extension::Png,
            "jpg" | "jpeg" => Extension::Jpeg,
            _ => Extension::Webp,
        }
    }

    /// The filename suffix, with the leading dot.
    pub fn suffix(&self) -> &'static str {
        match self {
            Extension::Webp => ".webp",
            Extension::Gif => ".gif",
            Extension::Png => ".png",
            Extension::Jpeg => ".jpg",
        }
    }
}
