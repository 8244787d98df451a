//! Disc image classification without mounting.
//!
//! An image (or any seekable stream) is read through the UDF reader and
//! classified by the top-level directories it carries: `/BDMV` for Blu-ray,
//! `/VIDEO_TS` for DVD. Classification is best effort: every failure
//! degrades to [`ImageType::Unknown`].

use std::fmt;
use std::fs::File;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::block::{ByteStream, StreamBlockInput};
use crate::error::{Error, Result};
use crate::udf::Udf;

const BLURAY_SCHEME: &str = "bd:";
const DVD_SCHEME: &str = "dvd:";

/// Kind of disc image found at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageType {
    #[default]
    Unknown,
    Dvd,
    Bluray,
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "Unknown",
            Self::Dvd => "DVD",
            Self::Bluray => "Blu-ray",
        })
    }
}

/// Opens a path or URI as a seekable byte stream.
pub trait StreamOpener {
    fn open(&self, path: &str) -> Result<Box<dyn ByteStream>>;
}

/// Opens local files, accepting an optional `file://` prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileOpener;

impl StreamOpener for LocalFileOpener {
    fn open(&self, path: &str) -> Result<Box<dyn ByteStream>> {
        let local = path.strip_prefix("file://").unwrap_or(path);
        let file = File::open(local).map_err(|source| Error::StreamOpen {
            path: path.to_string(),
            source,
        })?;
        Ok(Box::new(file))
    }
}

/// Classifies the image at `path`, opening it as a local file.
pub fn inspect_image(path: &str) -> ImageType {
    inspect_image_with(&LocalFileOpener, path)
}

/// Classifies the image at `path`, opening it through `opener`.
///
/// `bd:` and `dvd:` scheme prefixes are trusted without any I/O.
pub fn inspect_image_with(opener: &dyn StreamOpener, path: &str) -> ImageType {
    if path.starts_with(BLURAY_SCHEME) {
        return ImageType::Bluray;
    }
    if path.starts_with(DVD_SCHEME) {
        return ImageType::Dvd;
    }

    let stream = match opener.open(path) {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "inspect_image - unable to open \"{path}\"");
            return ImageType::Unknown;
        }
    };

    let mut udf = match StreamBlockInput::new(stream).and_then(|input| Udf::open(Box::new(input))) {
        Ok(udf) => udf,
        Err(e) => {
            error!(error = %e, "inspect_image - \"{path}\" is not a UDF image");
            return ImageType::Unknown;
        }
    };

    if udf.open_dir("/BDMV").is_ok() {
        info!("Found Bluray at {path}");
        ImageType::Bluray
    } else if udf.open_dir("/VIDEO_TS").is_ok() {
        info!("Found DVD at {path}");
        ImageType::Dvd
    } else {
        error!("inspect_image - unknown");
        ImageType::Unknown
    }
}
