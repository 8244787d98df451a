//! Media classification and status types.
//!
//! [`MediaType`] is a small set-of-flags newtype: every named constituent is
//! a distinct power-of-two bit, and composite classifications are unions.
//! [`MediaStatus`] is the device state, [`MediaError`] the outcome of a
//! device-control operation.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Bitmask describing the content found on a medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaType(u32);

impl MediaType {
    pub const UNKNOWN: Self = Self(0x0001);
    pub const DATA: Self = Self(0x0002);
    /// Contains a mixture of types.
    pub const MIXED: Self = Self(0x0004);
    /// Audio CD.
    pub const AUDIO: Self = Self(0x0008);
    pub const DVD: Self = Self(0x0010);
    pub const VCD: Self = Self(0x0020);
    /// Music files (mp3, ogg, ...).
    pub const MUSIC_FILES: Self = Self(0x0040);
    /// Video files (mpg, mkv, ...).
    pub const VIDEO_FILES: Self = Self(0x0080);
    /// Picture files (jpg, png, ...).
    pub const GALLERY_FILES: Self = Self(0x0100);
    pub const BLURAY: Self = Self(0x0200);

    /// One past the highest constituent bit.
    const END: u32 = 0x0400;

    /// Every constituent with its rendered name, in ascending bit order.
    const NAMES: [(Self, &'static str); 10] = [
        (Self::UNKNOWN, "MEDIATYPE_UNKNOWN"),
        (Self::DATA, "MEDIATYPE_DATA"),
        (Self::MIXED, "MEDIATYPE_MIXED"),
        (Self::AUDIO, "MEDIATYPE_AUDIO"),
        (Self::DVD, "MEDIATYPE_DVD"),
        (Self::VCD, "MEDIATYPE_VCD"),
        (Self::MUSIC_FILES, "MEDIATYPE_MMUSIC"),
        (Self::VIDEO_FILES, "MEDIATYPE_MVIDEO"),
        (Self::GALLERY_FILES, "MEDIATYPE_MGALLERY"),
        (Self::BLURAY, "MEDIATYPE_BD"),
    ];

    /// The empty set. Not a valid classification on its own.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Builds a mask from raw bits, dropping bits outside the known range.
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & (Self::END - 1))
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Decomposes the mask into its single-bit constituents, lowest bit first.
    pub fn constituents(self) -> impl Iterator<Item = MediaType> {
        let mut bit = 1u32;
        std::iter::from_fn(move || {
            while bit != Self::END {
                let current = bit;
                bit <<= 1;
                if self.0 & current != 0 {
                    return Some(MediaType(current));
                }
            }
            None
        })
    }

    /// Looks up a constituent by its config name (`"dvd"`, `"MEDIATYPE_DVD"`, ...).
    pub fn from_name(name: &str) -> Result<Self> {
        let upper = name.trim().to_ascii_uppercase();
        let short = upper.strip_prefix("MEDIATYPE_").unwrap_or(&upper);
        let found = match short {
            "UNKNOWN" => Self::UNKNOWN,
            "DATA" => Self::DATA,
            "MIXED" => Self::MIXED,
            "AUDIO" => Self::AUDIO,
            "DVD" => Self::DVD,
            "VCD" => Self::VCD,
            "MMUSIC" | "MUSIC" => Self::MUSIC_FILES,
            "MVIDEO" | "VIDEO" => Self::VIDEO_FILES,
            "MGALLERY" | "GALLERY" => Self::GALLERY_FILES,
            "BD" | "BLURAY" => Self::BLURAY,
            _ => {
                return Err(Error::UnknownMediaType {
                    name: name.to_string(),
                });
            }
        };
        Ok(found)
    }
}

impl Default for MediaType {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

impl BitOr for MediaType {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for MediaType {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for MediaType {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        self.intersection(rhs)
    }
}

/// Renders the set bits as `MEDIATYPE_*` names joined by `|`, in bit order.
impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.0 & flag.0 == 0 {
                continue;
            }
            if !first {
                f.write_str("|")?;
            }
            f.write_str(name)?;
            first = false;
        }
        Ok(())
    }
}

/// Device status, ordered by meaning rather than by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaStatus {
    Error,
    #[default]
    Unknown,
    Unplugged,
    /// Tray is open.
    Open,
    NoDisk,
    Unformatted,
    /// Content identified and ready for a player.
    Useable,
    NotMounted,
    Mounted,
}

impl MediaStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "MEDIASTAT_ERROR",
            Self::Unknown => "MEDIASTAT_UNKNOWN",
            Self::Unplugged => "MEDIASTAT_UNPLUGGED",
            Self::Open => "MEDIASTAT_OPEN",
            Self::NoDisk => "MEDIASTAT_NODISK",
            Self::Unformatted => "MEDIASTAT_UNFORMATTED",
            Self::Useable => "MEDIASTAT_USEABLE",
            Self::NotMounted => "MEDIASTAT_NOTMOUNTED",
            Self::Mounted => "MEDIASTAT_MOUNTED",
        }
    }

    /// Statuses that imply the medium is not (and must not stay) mounted.
    pub fn forces_unmount(self) -> bool {
        matches!(
            self,
            Self::Error | Self::Open | Self::NoDisk | Self::NotMounted
        )
    }
}

impl fmt::Display for MediaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure outcome of a device-control operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaError {
    /// The operation was attempted and did not succeed.
    Failed,
    /// The operation has no implementation on this platform.
    Unsupported,
}

impl MediaError {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Failed => "MEDIAERR_FAILED",
            Self::Unsupported => "MEDIAERR_UNSUPPORTED",
        }
    }
}

impl fmt::Display for MediaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for MediaError {}

/// `Ok(())` is `MEDIAERR_OK`.
pub type MediaResult = std::result::Result<(), MediaError>;
