//! Anchored regex matching shared by the catalog and the platform map.

use regex::Regex;

/// Compile `pattern` and test whether it matches at the very start of
/// `text`. `.` spans embedded newlines, and a match need not cover the
/// whole string.
pub(crate) fn matches_start(pattern: &str, text: &str) -> Result<bool, regex::Error> {
    let re = Regex::new(&format!("(?s)^(?:{pattern})"))?;
    Ok(re.is_match(text))
}
