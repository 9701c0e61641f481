//! Text helpers for migrating legacy free-text columns.

use crate::error::AniTrackError;

/// Delimiters that mark a genre list this code refuses to guess about.
pub const AMBIGUOUS_GENRE_DELIMITERS: &[char] = &[';', '|', '/'];

/// Alias fixes applied before genre lookup; the legacy data spells a handful
/// of genres inconsistently.
const GENRE_ALIASES: &[(&str, &str)] = &[("Sci Fi", "Sci-Fi")];

/// Derive a stable lookup key from a display name: lowercased, runs of
/// whitespace and punctuation collapsed to single underscores, apostrophes
/// and backticks dropped.
pub fn sanitise_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;

    for ch in raw.chars() {
        if ch.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.extend(ch.to_lowercase());
        } else if ch == '\'' || ch == '`' {
            // Dropped entirely: "God's" keys as "gods", not "god_s"
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Map a legacy genre spelling to its canonical form. Only exact known
/// aliases are rewritten.
pub fn canonical_genre(genre: &str) -> &str {
    GENRE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == genre)
        .map_or(genre, |(_, canonical)| canonical)
}

/// Split a legacy comma-separated genre list.
///
/// Only the canonical comma-separated form is accepted. An empty value or a
/// foreign delimiter is an error for the caller to record per row — flagged,
/// never guessed.
pub fn split_genres(raw: &str) -> Result<Vec<String>, AniTrackError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AniTrackError::Error("genre list is empty".to_string()));
    }
    if let Some(delimiter) = trimmed
        .chars()
        .find(|ch| AMBIGUOUS_GENRE_DELIMITERS.contains(ch))
    {
        return Err(AniTrackError::Error(format!(
            "genre list '{trimmed}' uses ambiguous delimiter '{delimiter}'"
        )));
    }

    let mut genres = Vec::new();
    for token in trimmed.split(',') {
        let genre = token.trim();
        if genre.is_empty() {
            return Err(AniTrackError::Error(format!(
                "genre list '{trimmed}' contains an empty entry"
            )));
        }
        genres.push(canonical_genre(genre).to_string());
    }
    Ok(genres)
}
