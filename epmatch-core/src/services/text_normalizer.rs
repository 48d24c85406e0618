//! Text normalization
//!
//! Produces the four canonical variants of a subtitle text so that hashing
//! and comparison survive cosmetic differences between releases (cue
//! numbering, timing shifts, styling markup, punctuation, case).
//!
//! Pure functions: no I/O, no failure modes. Empty input yields empty variants.

use crate::models::TextVariants;
use once_cell::sync::Lazy;
use regex::Regex;

/// SRT / WebVTT cue timing line ("00:01:02,345 --> 00:01:04,000 ...")
static TIMECODE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*(?:\d{1,2}:)?\d{1,2}:\d{2}[,.]\d{1,3}\s*-->\s*(?:\d{1,2}:)?\d{1,2}:\d{2}[,.]\d{1,3}.*$",
    )
    .expect("timecode pattern is valid")
});

/// Bare number; a cue index only when a timing line follows
static CUE_INDEX_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\d+\s*$").expect("cue index pattern is valid"));

/// ASS/SSA event prefix up to the Text field
static ASS_DIALOGUE_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*Dialogue:\s*[^,]*,[^,]*,[^,]*,(?:[^,]*,){6}")
        .expect("dialogue pattern is valid")
});

static HTML_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"</?[A-Za-z][^<>]*>").expect("html tag pattern is valid"));

/// ASS override block ("{\i1}", "{\an8\pos(10,20)}")
static ASS_OVERRIDE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\\[^}]*\}").expect("ass override pattern is valid"));

/// ASS hard/soft line breaks and hard space
static ASS_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\[Nnh]").expect("ass escape pattern is valid"));

static HTML_ENTITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&(?:[A-Za-z]+|#\d+);").expect("entity pattern is valid"));

/// Compute all four variants
pub fn normalize(text: &str) -> TextVariants {
    if text.is_empty() {
        return TextVariants::default();
    }

    let no_timecodes = strip_timecodes(text);
    let no_html = strip_markup(text);
    let clean = clean(&strip_markup(&no_timecodes));

    TextVariants {
        original: text.to_string(),
        no_timecodes,
        no_html,
        clean,
    }
}

/// Null-tolerant entry point
pub fn normalize_opt(text: Option<&str>) -> TextVariants {
    normalize(text.unwrap_or_default())
}

/// Drop cue numbers, timing lines and the WebVTT header; unwrap ASS events
pub fn strip_timecodes(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let is_cue_index = |i: usize| {
        CUE_INDEX_LINE.is_match(lines[i])
            && lines.get(i + 1).is_some_and(|next| TIMECODE_LINE.is_match(next))
    };

    lines
        .iter()
        .enumerate()
        .filter(|&(i, line)| {
            !TIMECODE_LINE.is_match(line)
                && !is_cue_index(i)
                && !line.trim_start().starts_with("WEBVTT")
        })
        .map(|(_, line)| ASS_DIALOGUE_PREFIX.replace(line, ""))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Remove HTML tags and ASS override blocks
pub fn strip_markup(text: &str) -> String {
    let without_html = HTML_TAG.replace_all(text, "");
    ASS_OVERRIDE.replace_all(&without_html, "").into_owned()
}

/// Lower-case, keep alphanumerics, collapse everything else to single spaces
pub fn clean(text: &str) -> String {
    let text = ASS_ESCAPE.replace_all(text, " ");
    let text = HTML_ENTITY.replace_all(&text, " ");

    let mapped: String = text
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}
