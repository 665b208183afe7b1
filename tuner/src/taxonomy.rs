//! Deterministic classification of a parsed playlist/API entry into a
//! catalog lane, and lane sharding for the Indexer.
//!
//! The exact classification rules are left deliberately conservative here,
//! driven by the same fields Xtream panels and flat M3U playlists actually
//! expose: an explicit Xtream `stream_type`/`category`, falling back to
//! `group-title` keywords for flat M3U sources.

/// Which catalog lane a parsed entry belongs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    /// A movie (VOD, single asset).
    Movies,
    /// A series episode (VOD, grouped by show/season).
    Series,
    /// A live channel.
    Live,
}

/// Group-title keywords (case-insensitive substring match) that indicate a
/// flat M3U entry belongs to the Series lane.
const SERIES_KEYWORDS: [&str; 3] = ["series", "tv shows", "tv-shows"];
/// Group-title keywords that indicate the Movies lane.
const MOVIES_KEYWORDS: [&str; 2] = ["vod", "movies"];

/// Classifies an entry using an explicit Xtream `stream_type`/category hint
/// when present, otherwise falling back to [`classify_group_title`].
#[must_use]
pub fn classify(xtream_stream_type: Option<&str>, group_title: Option<&str>) -> Lane {
    if let Some(t) = xtream_stream_type {
        match t.to_ascii_lowercase().as_str() {
            "movie" | "vod" => return Lane::Movies,
            "series" => return Lane::Series,
            "live" => return Lane::Live,
            _ => {}
        }
    }

    classify_group_title(group_title.unwrap_or_default())
}

/// Classifies a flat M3U `group-title` by keyword, defaulting to
/// [`Lane::Live`] when no keyword matches (the conservative choice, since
/// most IPTV M3U playlists are predominantly live channels).
#[must_use]
pub fn classify_group_title(group_title: &str) -> Lane {
    let lower = group_title.to_ascii_lowercase();
    if SERIES_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Lane::Series;
    }
    if MOVIES_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Lane::Movies;
    }
    Lane::Live
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xtream_hint_takes_precedence() {
        assert_eq!(classify(Some("movie"), Some("US | Series")), Lane::Movies);
        assert_eq!(classify(Some("series"), None), Lane::Series);
        assert_eq!(classify(Some("live"), Some("VOD")), Lane::Live);
    }

    #[test]
    fn group_title_keywords() {
        assert_eq!(classify(None, Some("US | TV Shows")), Lane::Series);
        assert_eq!(classify(None, Some("UK VOD Movies")), Lane::Movies);
        assert_eq!(classify(None, Some("News Channels")), Lane::Live);
        assert_eq!(classify(None, None), Lane::Live);
    }
}
