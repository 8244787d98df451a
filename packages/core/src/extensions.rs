//! File extension to media type registry.
//!
//! The registry is filled once at startup and shared read-only afterwards,
//! usually behind an `Arc`, by every [`crate::device::MediaDevice`].

use std::collections::HashMap;

use crate::media_type::MediaType;

/// Extensions of music files recognised by default.
pub const MUSIC_EXTENSIONS: &str =
    "cda,mp3,mp2,ogg,oga,opus,flac,wma,wav,ac3,oma,omg,atp,ra,dts,aac,m4a,aa3,tta,mka,aiff,swa,wv";

/// Extensions of video files recognised by default.
pub const VIDEO_EXTENSIONS: &str =
    "mpg,mpeg,vob,avi,divx,xvid,mkv,mp4,m4v,mov,qt,wmv,asf,flv,ogm,ogv,ts,m2ts,mts,webm,nuv,rm,3gp";

/// Extensions of picture files recognised by default.
pub const GALLERY_EXTENSIONS: &str = "jpg,jpeg,png,gif,bmp,tif,tiff,webp,heic";

/// Maps extensions (no leading dot, any case) to a media type mask.
#[derive(Debug, Clone, Default)]
pub struct ExtensionRegistry {
    entries: HashMap<String, MediaType>,
}

impl ExtensionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry pre-loaded with the music, video and picture tables.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(MediaType::MUSIC_FILES, MUSIC_EXTENSIONS);
        registry.register(MediaType::VIDEO_FILES, VIDEO_EXTENSIONS);
        registry.register(MediaType::GALLERY_FILES, GALLERY_EXTENSIONS);
        registry
    }

    /// Registers a comma separated list of extensions such as `"mp3,ogg,flac"`.
    ///
    /// Repeated registrations accumulate: an extension that is registered for
    /// two types carries both bits. Case is ignored.
    pub fn register(&mut self, media_type: MediaType, extensions: &str) {
        for ext in extensions.split(',') {
            let ext = ext.trim().trim_start_matches('.');
            if ext.is_empty() {
                continue;
            }
            *self
                .entries
                .entry(ext.to_lowercase())
                .or_insert_with(MediaType::empty) |= media_type;
        }
    }

    /// Returns the accumulated mask for an extension, ignoring case.
    pub fn lookup(&self, extension: &str) -> Option<MediaType> {
        self.entries.get(&extension.to_lowercase()).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ExtensionRegistry::new();
        registry.register(MediaType::MUSIC_FILES, "mp3,ogg,flac");

        assert_eq!(registry.lookup("mp3"), Some(MediaType::MUSIC_FILES));
        assert_eq!(registry.lookup("flac"), Some(MediaType::MUSIC_FILES));
        assert_eq!(registry.lookup("avi"), None);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_registrations_accumulate() {
        let mut registry = ExtensionRegistry::new();
        registry.register(MediaType::VIDEO_FILES, "ogg,mkv");
        registry.register(MediaType::MUSIC_FILES, "ogg");

        assert_eq!(
            registry.lookup("ogg"),
            Some(MediaType::VIDEO_FILES | MediaType::MUSIC_FILES)
        );
        assert_eq!(registry.lookup("mkv"), Some(MediaType::VIDEO_FILES));
    }

    #[test]
    fn test_register_skips_empty_items() {
        let mut registry = ExtensionRegistry::new();
        registry.register(MediaType::GALLERY_FILES, "jpg,, .png ,");

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup("png"), Some(MediaType::GALLERY_FILES));
    }

    #[test]
    fn test_case_is_ignored() {
        let mut registry = ExtensionRegistry::new();
        registry.register(MediaType::VIDEO_FILES, "VRO,Mpv");
        registry.register(MediaType::MUSIC_FILES, "vro");

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.lookup("vro"),
            Some(MediaType::VIDEO_FILES | MediaType::MUSIC_FILES)
        );
        assert_eq!(registry.lookup("MPV"), Some(MediaType::VIDEO_FILES));
    }

    #[test]
    fn test_defaults() {
        let registry = ExtensionRegistry::with_defaults();
        assert_eq!(registry.lookup("mp3"), Some(MediaType::MUSIC_FILES));
        assert_eq!(registry.lookup("mkv"), Some(MediaType::VIDEO_FILES));
        assert_eq!(registry.lookup("jpeg"), Some(MediaType::GALLERY_FILES));
    }
}
