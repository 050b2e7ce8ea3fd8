use serde::{Deserialize, Serialize};

use crate::{Extension, StorageKey, ec};

/// The size of an encoded [`ChannelEntry`], in bytes.
pub const ENTRY_SIZE: usize = 64;

/// The kind of a post, as the cache stores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostKind {
    /// A single artwork.
    Artwork,
    /// An ordered collection of artworks.
    Playlist,
}
impl PostKind {
    /// Decode the on-disk tag byte. Unknown values map to Artwork.
    pub fn from_tag(tag: u8) -> Self {
        match tag {
            1 => PostKind::Playlist,
            _ => PostKind::Artwork,
        }
    }

    /// The on-disk tag byte.
    pub fn tag(&self) -> u8 {
        match self {
            PostKind::Artwork => 0,
            PostKind::Playlist => 1,
        }
    }
}
impl From<ec::PostKind> for PostKind {
    fn from(kind: ec::PostKind) -> Self {
        match kind {
            ec::PostKind::Artwork => PostKind::Artwork,
            ec::PostKind::Playlist => PostKind::Playlist,
        }
    }
}

/// The identity a post is merged on: unique within a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    /// The post ID.
    pub post_id: i32,
    /// The post kind.
    pub kind: PostKind,
}

/// One post of a channel, as the cache stores it.
///
/// Encodes to a fixed 64-byte little-endian record:
///
/// ```text
/// offset size field
/// 0      4    post_id               i32
/// 4      1    kind                  u8
/// 5      1    extension             u8
/// 6      2    filter_flags          u16
/// 8      8    created_at            i64
/// 16     8    metadata_modified_at  i64
/// 24     8    artwork_modified_at   i64
/// 32     4    dwell_time_ms         u32
/// 36     4    total_artworks        u32
/// 40     16   storage_key           [u8; 16]
/// 56     8    reserved              zeroes
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelEntry {
    /// The post ID.
    pub post_id: i32,
    /// The post kind.
    pub kind: PostKind,
    /// The artwork's file format.
    pub extension: Extension,
    /// Content filter flags.
    pub filter_flags: u16,
    /// When the post was created, unix seconds.
    pub created_at: i64,
    /// When the post's metadata last changed, unix seconds.
    pub metadata_modified_at: i64,
    /// When the artwork file itself last changed, unix seconds.
    pub artwork_modified_at: i64,
    /// Display dwell time in milliseconds; 0 means unset.
    pub dwell_time_ms: u32,
    /// The number of artworks in the playlist; 0 for artworks.
    pub total_artworks: u32,
    /// The artwork's storage key; the nil key for playlists.
    pub storage_key: StorageKey,
}

impl ChannelEntry {
    /// The post's merge identity.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            post_id: self.post_id,
            kind: self.kind,
        }
    }

    /// Encode into the fixed 64-byte record.
    pub fn encode(&self) -> [u8; ENTRY_SIZE] {
        let mut buf = [0u8; ENTRY_SIZE];
        buf[0..4].copy_from_slice(&self.post_id.to_le_bytes());
        buf[4] = self.kind.tag();
        buf[5] = self.extension.tag();
        buf[6..8].copy_from_slice(&self.filter_flags.to_le_bytes());
        buf[8..16].copy_from_slice(&self.created_at.to_le_bytes());
        buf[16..24].copy_from_slice(&self.metadata_modified_at.to_le_bytes());
        buf[24..32].copy_from_slice(&self.artwork_modified_at.to_le_bytes());
        buf[32..36].copy_from_slice(&self.dwell_time_ms.to_le_bytes());
        buf[36..40].copy_from_slice(&self.total_artworks.to_le_bytes());
        buf[40..56].copy_from_slice(self.storage_key.as_bytes());
        buf
    }

    /// Decode a fixed 64-byte record.
    pub fn decode(buf: &[u8; ENTRY_SIZE]) -> Self {
        ChannelEntry {
            post_id: i32::from_le_bytes(buf[0..4].try_into().unwrap()),
            kind: PostKind::from_tag(buf[4]),
            extension: Extension::from_tag(buf[5]),
            filter_flags: u16::from_le_bytes(buf[6..8].try_into().unwrap()),
            created_at: i64::from_le_bytes(buf[8..16].try_into().unwrap()),
            metadata_modified_at: i64::from_le_bytes(buf[16..24].try_into().unwrap()),
            artwork_modified_at: i64::from_le_bytes(buf[24..32].try_into().unwrap()),
            dwell_time_ms: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
            total_artworks: u32::from_le_bytes(buf[36..40].try_into().unwrap()),
            storage_key: StorageKey::from_bytes(buf[40..56].try_into().unwrap()),
        }
    }

    /// Build an entry from a catalog post.
    ///
    /// Returns `None` for an artwork post without a parseable storage key;
    /// such a post cannot be fetched or addressed in the vault.
    pub fn from_post(post: &ec::Post) -> Option<Self> {
        let kind = PostKind::from(post.kind);
        let storage_key = match kind {
            PostKind::Artwork => StorageKey::parse(post.storage_key.as_deref()?)?,
            PostKind::Playlist => StorageKey::from_bytes([0; 16]),
        };
        Some(ChannelEntry {
            post_id: post.post_id,
            kind,
            extension: post
                .extension
                .as_deref()
                .map(Extension::from_suffix)
                .unwrap_or_default(),
            filter_flags: post.filter_flags,
            created_at: post.created_at,
            metadata_modified_at: post.metadata_modified_at,
            artwork_modified_at: post.artwork_modified_at.unwrap_or(0),
            dwell_time_ms: post.dwell_time_ms,
            total_artworks: post.total_artworks.unwrap_or(0),
            storage_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> ChannelEntry {
        ChannelEntry {
            post_id: 42,
            kind: PostKind::Artwork,
            extension: Extension::Png,
            filter_flags: 0x0102,
            created_at: 1_700_000_000,
            metadata_modified_at: 1_700_000_100,
            artwork_modified_at: 1_700_000_200,
            dwell_time_ms: 15_000,
            total_artworks: 0,
            storage_key: StorageKey::parse("0d9fa1f0-8c3b-4a5e-9d2f-6b7c8d9e0f1a").unwrap(),
        }
    }

    #[test]
    fn encode_decode_round_trips() {
        let entry = sample_entry();
        assert_eq!(ChannelEntry::decode(&entry.encode()), entry);

        let playlist = ChannelEntry {
            post_id: -7,
            kind: PostKind::Playlist,
            total_artworks: 12,
            storage_key: StorageKey::from_bytes([0; 16]),
            ..entry
        };
        assert_eq!(ChannelEntry::decode(&playlist.encode()), playlist);
    }

    #[test]
    fn encoding_is_little_endian_at_fixed_offsets() {
        let buf = sample_entry().encode();
        assert_eq!(&buf[0..4], &42i32.to_le_bytes());
        assert_eq!(buf[4], 0);
        assert_eq!(buf[5], 2);
        assert_eq!(&buf[6..8], &0x0102u16.to_le_bytes());
        assert_eq!(&buf[32..36], &15_000u32.to_le_bytes());
        assert_eq!(&buf[56..64], &[0u8; 8]);
    }

    #[test]
    fn artwork_post_without_storage_key_is_rejected() {
        let post = ec::Post {
            post_id: 1,
            kind: ec::PostKind::Artwork,
            owner_handle: "ana".to_string(),
            created_at: 1000,
            metadata_modified_at: 1000,
            dwell_time_ms: 0,
            filter_flags: 0,
            storage_key: None,
            art_url: None,
            artwork_modified_at: None,
            extension: None,
            total_artworks: None,
            artworks: None,
        };
        assert!(ChannelEntry::from_post(&post).is_none());

        let with_key = ec::Post {
            storage_key: Some("0d9fa1f0-8c3b-4a5e-9d2f-6b7c8d9e0f1a".to_string()),
            extension: Some("gif".to_string()),
            ..post
        };
        let entry = ChannelEntry::from_post(&with_key).unwrap();
        assert_eq!(entry.extension, Extension::Gif);
        assert_eq!(entry.kind, PostKind::Artwork);
    }
}
