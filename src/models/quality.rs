use std::fmt;

/// Requested fidelity of a decoded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageQuality {
    Thumbnail,
    HighQuality,
    Original,
}

impl ImageQuality {
    pub const ALL: [ImageQuality; 3] = [Self::Thumbnail, Self::HighQuality, Self::Original];

    /// Tag mixed into the cache key so each quality gets its own entry.
    pub fn cache_tag(self) -> &'static str {
        match self {
            Self::Thumbnail => "_KeyThumb",
            Self::HighQuality => "_KeyHQ",
            Self::Original => "_KeyOriginal",
        }
    }
}

impl fmt::Display for ImageQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thumbnail => write!(f, "thumbnail"),
            Self::HighQuality => write!(f, "high-quality"),
            Self::Original => write!(f, "original"),
        }
    }
}

/// Loading state of one photo for one tier.
///
/// "Loaded" is not a state: a loaded image is one that is present in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum LoadingState {
    #[default]
    Undefined = 0,
    InQueue = 1,
    /// Sticky until the error sets are cleared by a retry.
    Invalid = 2,
}

impl LoadingState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::InQueue,
            2 => Self::Invalid,
            _ => Self::Undefined,
        }
    }
}

/// Anything the gallery surface can show and query visibility for.
pub trait GalleryItem {
    fn unique_key(&self) -> &str;
}
