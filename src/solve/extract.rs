//! Extraction of astrometric fields from solve-field stdout.
//!
//! Every field is located by an anchor substring and read as a whitespace
//! token at a fixed offset from where the anchor starts:
//!
//! ```text
//!   RA,Dec = (358.242,64.0045), pixel scale 2.05136 arcsec/pix.
//!                               ^anchor     ^+2
//! Field center: (RA H:M:S, Dec D:M:S) = (23:52:58.233, +64:00:14.433).
//!               ^anchor                 ^+5            ^+6
//! Field rotation angle: up is -152.913 degrees E of N
//! ^anchor                     ^+5
//! ```
//!
//! Counting from the anchor rather than the line start keeps the offsets valid
//! whatever indentation or prefix the line carries.

use serde::Serialize;
use std::path::Path;

pub const PIXEL_SCALE_ANCHOR: &str = "pixel scale";
pub const RA_DEC_ANCHOR: &str = "(RA H:M:S, Dec D:M:S)";
pub const ROTATION_ANCHOR: &str = "Field rotation angle";
pub const LOG_ODDS_ANCHOR: &str = "log-odds ratio";

/// Solved fields of one image. Fields whose anchor line was not found are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SolverResult {
    /// Right ascension, "H M S"
    pub ra: Option<String>,
    /// Declination, "±D M S"
    pub dec: Option<String>,
    /// Arcseconds per pixel
    pub pixel_scale: Option<String>,
    /// Degrees east of north
    pub field_rotation: Option<String>,
    pub log_odds: Option<String>,
}

impl SolverResult {
    /// Parse a solve-field stdout capture.
    pub fn parse(text: &str) -> Self {
        let (ra, dec) = match extract_ra_dec(text) {
            Some((ra, dec)) => (Some(ra), Some(dec)),
            None => (None, None),
        };
        Self {
            ra,
            dec,
            pixel_scale: extract_pixel_scale(text),
            field_rotation: extract_field_rotation(text),
            log_odds: extract_log_odds(text),
        }
    }

    /// Whether no field was found at all.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Token `offset` places after the start of `anchor` on the first line containing it.
fn token_after_anchor<'a>(text: &'a str, anchor: &str, offset: usize) -> Option<&'a str> {
    text.lines().find_map(|line| {
        let start = line.find(anchor)?;
        line[start..].split_whitespace().nth(offset)
    })
}

pub fn extract_pixel_scale(text: &str) -> Option<String> {
    token_after_anchor(text, PIXEL_SCALE_ANCHOR, 2).map(str::to_string)
}

pub fn extract_field_rotation(text: &str) -> Option<String> {
    token_after_anchor(text, ROTATION_ANCHOR, 5).map(str::to_string)
}

pub fn extract_log_odds(text: &str) -> Option<String> {
    token_after_anchor(text, LOG_ODDS_ANCHOR, 2).map(str::to_string)
}

/// Right ascension and declination in sexagesimal, colons turned into spaces.
pub fn extract_ra_dec(text: &str) -> Option<(String, String)> {
    text.lines().find_map(|line| {
        let start = line.find(RA_DEC_ANCHOR)?;
        let mut tokens = line[start..].split_whitespace().skip(5);
        let ra = tokens.next()?;
        let dec = tokens.next()?;
        Some((clean_sexagesimal(ra), clean_sexagesimal(dec)))
    })
}

fn clean_sexagesimal(token: &str) -> String {
    token
        .trim_matches(|c| matches!(c, '(' | ')' | ','))
        .trim_end_matches(|c| matches!(c, '.' | ')' | ','))
        .replace(':', " ")
}

/// Read a capture file. `None` when the file is empty: the task has not
/// produced output (yet).
pub async fn read_capture(path: &Path) -> anyhow::Result<Option<String>> {
    let text = tokio::fs::read_to_string(path).await?;
    Ok((!text.trim().is_empty()).then_some(text))
}
