use serde::{Deserialize, Serialize};

/// Bit-flag identifier for the remote service an entity came from.
///
/// Values are stored as plain integers; only [`Source::is_valid`] values may
/// be written by the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Source(i64);

impl Source {
    pub const FEED: Source = Source(1 << 0);
    pub const BOARD: Source = Source(1 << 1);
    pub const FEED_VIA_BOARD: Source = Source((1 << 0) | (1 << 1));
    /// Rows created by out-of-band importers. Recognised but never synced.
    pub const IMPORTED: Source = Source(1 << 16);

    pub const fn from_bits(bits: i64) -> Self {
        Source(bits)
    }

    pub const fn bits(self) -> i64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        matches!(self, Self::FEED | Self::BOARD | Self::FEED_VIA_BOARD)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FEED => "feed",
            Self::BOARD => "board",
            Self::FEED_VIA_BOARD => "feed-board",
            Self::IMPORTED => "imported",
            _ => "unknown",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "feed" => Some(Self::FEED),
            "board" => Some(Self::BOARD),
            "feed-board" | "feed_board" => Some(Self::FEED_VIA_BOARD),
            "imported" => Some(Self::IMPORTED),
            _ => None,
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Source {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Source {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Source::from_str(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown source '{s}'")))
    }
}

/// Kind of a downloaded media file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
    Gif,
    Audio,
}

impl MediaKind {
    /// Convert to the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Gif => "gif",
            Self::Audio => "audio",
        }
    }

    /// Parse from the string stored in the database.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "photo" => Some(Self::Photo),
            "video" => Some(Self::Video),
            "gif" => Some(Self::Gif),
            "audio" => Some(Self::Audio),
            _ => None,
        }
    }
}

/// The paginated content collections tracked per profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    Posts,
    Messages,
    Stories,
}

impl ContentKind {
    pub const ALL: [ContentKind; 3] = [Self::Stories, Self::Posts, Self::Messages];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Posts => "posts",
            Self::Messages => "messages",
            Self::Stories => "stories",
        }
    }
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a source pages through a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Pagination {
    #[default]
    Offset,
    BeforeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_sources() {
        assert!(Source::FEED.is_valid());
        assert!(Source::BOARD.is_valid());
        assert!(Source::FEED_VIA_BOARD.is_valid());
        assert!(!Source::IMPORTED.is_valid());
        assert!(!Source::from_bits(0).is_valid());
        assert!(!Source::from_bits(1 << 5).is_valid());
    }

    #[test]
    fn test_source_names_round_trip() {
        for s in [Source::FEED, Source::BOARD, Source::FEED_VIA_BOARD, Source::IMPORTED] {
            assert_eq!(Source::from_str(s.as_str()), Some(s));
        }
        assert_eq!(Source::from_str("nope"), None);
    }

    #[test]
    fn test_media_kind_strings() {
        assert_eq!(MediaKind::from_str("gif"), Some(MediaKind::Gif));
        assert_eq!(MediaKind::Audio.as_str(), "audio");
        assert_eq!(MediaKind::from_str("live_photo"), None);
    }

    #[test]
    fn test_source_deserialize() {
        #[derive(Deserialize)]
        struct Wrap {
            source: Source,
        }
        let w: Wrap = toml::from_str("source = \"board\"").unwrap();
        assert_eq!(w.source, Source::BOARD);
        assert!(toml::from_str::<Wrap>("source = \"bogus\"").is_err());
    }
}
