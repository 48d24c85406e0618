//! Subtitle source formats
//!
//! The format records how a piece of text was produced. OCR-derived formats
//! (PGS, VobSub) are noisier than text subtitles and get their own thresholds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::Error;

/// How the subtitle text was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    /// Text subtitles (SRT, ASS/SSA, WebVTT, MicroDVD)
    TextBased,
    /// Blu-ray bitmap subtitles, text recovered by OCR
    Pgs,
    /// DVD bitmap subtitles, text recovered by OCR
    VobSub,
}

impl SourceFormat {
    /// All formats, in configuration order
    pub const ALL: [SourceFormat; 3] = [SourceFormat::TextBased, SourceFormat::Pgs, SourceFormat::VobSub];

    /// Configuration / database key
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::TextBased => "text_based",
            SourceFormat::Pgs => "pgs",
            SourceFormat::VobSub => "vobsub",
        }
    }

    /// True when the text came out of an OCR pass
    pub fn is_ocr(&self) -> bool {
        matches!(self, SourceFormat::Pgs | SourceFormat::VobSub)
    }

    /// Infer the format from a subtitle file extension
    ///
    /// Returns `None` for extensions that are not subtitle files.
    pub fn infer_from_extension(path: &Path) -> Option<SourceFormat> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "srt" | "ass" | "ssa" | "vtt" | "sub" | "txt" => Some(SourceFormat::TextBased),
            "sup" => Some(SourceFormat::Pgs),
            "idx" => Some(SourceFormat::VobSub),
            _ => None,
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text_based" | "text" | "textbased" => Ok(SourceFormat::TextBased),
            "pgs" => Ok(SourceFormat::Pgs),
            "vobsub" | "vob_sub" => Ok(SourceFormat::VobSub),
            other => Err(Error::InvalidInput(format!("Unknown source format: {}", other))),
        }
    }
}
