//! Canonical catalog entities.

use serde::{Deserialize, Serialize};

/// A video-on-demand movie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movie {
    /// Stable id, unchanged across catalog refreshes.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Release year, if known.
    #[serde(default)]
    pub year: Option<u16>,
    /// Upstream stream URL.
    pub stream_url: String,
    /// Poster/artwork URL, if known.
    #[serde(default)]
    pub artwork_url: Option<String>,
}

/// One episode of a [`Series`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Episode {
    /// Stable id, unchanged across catalog refreshes.
    pub id: String,
    /// 1-based season number this episode belongs to.
    pub season_num: u32,
    /// 1-based episode number within its season.
    pub episode_num: u32,
    /// Display title.
    pub title: String,
    /// Upstream stream URL.
    pub stream_url: String,
}

/// One season of a [`Series`]: episodes ordered by `episode_num` ascending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Season {
    /// Season number.
    pub number: u32,
    /// Episodes, ordered by `episode_num` ascending.
    pub episodes: Vec<Episode>,
}

/// A TV series, grouping [`Season`]s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Series {
    /// Stable id, unchanged across catalog refreshes.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Release year, if known.
    #[serde(default)]
    pub year: Option<u16>,
    /// Seasons, ordered by season number ascending.
    #[serde(default)]
    pub seasons: Vec<Season>,
    /// Poster/artwork URL, if known.
    #[serde(default)]
    pub artwork_url: Option<String>,
}

/// A live TV channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveChannel {
    /// Internal identifier.
    pub channel_id: String,
    /// External channel identifier used by the tuner surface (the
    /// HDHomeRun-facing "dial number").
    pub guide_number: String,
    /// Display name.
    pub guide_name: String,
    /// Primary upstream stream URL. When `stream_urls` is non-empty,
    /// invariant: `stream_urls[0] == stream_url`.
    pub stream_url: String,
    /// Ranked backup URLs, primary first. May be empty (legacy catalogs).
    #[serde(default)]
    pub stream_urls: Vec<String>,
    /// Whether this channel has been linked to an XMLTV channel.
    #[serde(default)]
    pub epg_linked: bool,
    /// `tvg-id` used to join this channel to an XMLTV programme schedule.
    #[serde(default)]
    pub tvg_id: String,
}

impl LiveChannel {
    /// Normalizes `stream_urls` so that, if non-empty, its first element is
    /// always `stream_url`, restoring that invariant after construction or a
    /// legacy load.
    pub fn normalize_stream_urls(&mut self) {
        if self.stream_urls.is_empty() {
            return;
        }
        if self.stream_urls[0] != self.stream_url {
            if let Some(pos) =
                self.stream_urls.iter().position(|u| u == &self.stream_url)
            {
                self.stream_urls.swap(0, pos);
            } else {
                self.stream_urls.insert(0, self.stream_url.clone());
            }
        }
    }
}

/// An XMLTV channel identity, used only for joining [`LiveChannel`]s to an
/// EPG schedule (see [`crate::epg_link`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XmltvChannel {
    /// `<channel id="…">` attribute.
    pub id: String,
    /// All `<display-name>` values for this channel.
    pub display_names: Vec<String>,
}

/// The aggregate catalog: every movie, series, and live channel known to the
/// bridge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    /// All movies.
    #[serde(default)]
    pub movies: Vec<Movie>,
    /// All series.
    #[serde(default)]
    pub series: Vec<Series>,
    /// All live channels. Accepts the legacy field name `live_channels` on
    /// load.
    #[serde(default, alias = "live_channels")]
    pub live: Vec<LiveChannel>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_moves_primary_to_front() {
        let mut ch = LiveChannel {
            channel_id: "1".into(),
            guide_number: "101".into(),
            guide_name: "News".into(),
            stream_url: "http://b/2".into(),
            stream_urls: vec!["http://a/1".into(), "http://b/2".into()],
            epg_linked: false,
            tvg_id: String::new(),
        };
        ch.normalize_stream_urls();
        assert_eq!(ch.stream_urls[0], "http://b/2");
    }

    #[test]
    fn normalize_is_noop_on_empty_backups() {
        let mut ch = LiveChannel {
            channel_id: "1".into(),
            guide_number: "101".into(),
            guide_name: "News".into(),
            stream_url: "http://old/1".into(),
            stream_urls: vec![],
            epg_linked: false,
            tvg_id: String::new(),
        };
        ch.normalize_stream_urls();
        assert!(ch.stream_urls.is_empty());
        assert_eq!(ch.stream_url, "http://old/1");
    }
}
