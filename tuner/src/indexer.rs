//! Indexer: resolves a provider, fetches its playlist or Xtream API
//! responses, parses them into a [`Catalog`], and persists the result.

use std::collections::HashMap;

use serde::Deserialize;

use crate::{
    catalog::{model::XmltvChannel, Episode, LiveChannel, Movie, Season, Series, Store},
    config::Config,
    epg_link,
    error::{ConfigError, ParseError},
    http_client,
    provider_probe,
    taxonomy::{self, Lane},
};

/// Runs one full index cycle: resolve a provider, fetch, parse, and persist.
///
/// # Errors
///
/// [`ConfigError`] if no provider is configured at all, or if every
/// candidate fails (the aggregate error lists each host's reason). Transport
/// errors for individual candidates are not surfaced directly: the caller
/// only sees the aggregate once every candidate is exhausted, matching the
/// failover policy.
pub async fn run(cfg: &Config, catalog: &Store) -> Result<(), ConfigError> {
    if cfg.provider_urls.is_empty() && cfg.m3u_url.is_none() {
        return Err(ConfigError {
            reason: "no PROVIDER_URL(S)/M3U_URL configured".to_string(),
        });
    }

    if let Some(base) = resolve_player_api_base(cfg).await {
        match index_via_player_api(cfg, &base).await {
            Ok((movies, series, live)) => {
                catalog.replace(movies, series, live);
                catalog.save(&cfg.catalog).await?;
                return Ok(());
            }
            Err(e) => {
                tuner_log::log::warn!(
                    "indexer: player_api at {base} failed, falling back to M3U: {e}"
                );
            }
        }
    }

    index_via_m3u(cfg, catalog).await
}

/// Tries to find a working Xtream `player_api.php` base, only when
/// credentials and at least one provider base are configured.
async fn resolve_player_api_base(cfg: &Config) -> Option<String> {
    if cfg.provider_user.is_empty() || cfg.provider_pass.is_empty() || cfg.provider_urls.is_empty() {
        return None;
    }
    provider_probe::first_working_player_api(&cfg.provider_urls, &cfg.provider_user, &cfg.provider_pass)
        .await
}

async fn index_via_m3u(cfg: &Config, catalog: &Store) -> Result<(), ConfigError> {
    let candidates = cfg.candidate_m3u_urls();
    if candidates.is_empty() {
        return Err(ConfigError {
            reason: "no M3U candidates resolved from configuration".to_string(),
        });
    }

    let results = provider_probe::probe_all(&candidates).await;
    let best = results
        .iter()
        .find(|r| r.status == provider_probe::ProbeStatus::Ok)
        .map(|r| r.url.clone());

    let Some(best_url) = best else {
        let reasons: Vec<String> = results
            .iter()
            .map(|r| format!("{}: {:?}", r.url, r.status))
            .collect();
        return Err(ConfigError {
            reason: format!("no provider candidate succeeded: {}", reasons.join("; ")),
        });
    };

    let client = http_client::shared();
    let body = client
        .get(&best_url)
        .send()
        .await
        .map_err(|e| ConfigError {
            reason: format!("failed to fetch playlist from {best_url}: {e}"),
        })?
        .text()
        .await
        .map_err(|e| ConfigError {
            reason: format!("failed to read playlist body from {best_url}: {e}"),
        })?;

    let parsed = parse_m3u(&body).map_err(|e| ConfigError { reason: e.to_string() })?;
    let (movies, series, live) = if cfg.live_only {
        (Vec::new(), Vec::new(), parsed.live)
    } else {
        (parsed.movies, parsed.series, parsed.live)
    };

    catalog.replace(movies, series, live);
    catalog.save(&cfg.catalog).await
}

/// Parsed halves of an M3U playlist, before the `live_only` filter is
/// applied.
pub(crate) struct ParsedM3u {
    movies: Vec<Movie>,
    series: Vec<Series>,
    live: Vec<LiveChannel>,
}

/// One `#EXTINF:` entry plus its following URL line.
pub(crate) struct Entry {
    tvg_id: Option<String>,
    name: String,
    group_title: Option<String>,
    url: String,
}

/// Parses an M3U / M3U-plus playlist into movies, series, and live channels.
///
/// Lane assignment uses [`taxonomy::classify_group_title`] on each entry's
/// `group-title` attribute. Series episodes are recognized by an `SxxEyy`
/// marker in the display name; the remainder of the name (with the marker
/// stripped) becomes the show title, grouping episodes across entries that
/// share it.
///
/// # Errors
///
/// [`ParseError`] if the input does not start with `#EXTM3U`.
pub(crate) fn parse_m3u(text: &str) -> Result<ParsedM3u, ParseError> {
    let mut lines = text.lines();
    let Some(first) = lines.next() else {
        return Err(ParseError {
            location: "line 1".to_string(),
            reason: "empty playlist".to_string(),
        });
    };
    if !first.trim_start().starts_with("#EXTM3U") {
        return Err(ParseError {
            location: "line 1".to_string(),
            reason: "missing #EXTM3U header".to_string(),
        });
    }

    let mut entries = Vec::new();
    let mut pending: Option<(Option<String>, String, Option<String>)> = None;

    for (lineno, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            let (attrs_and_duration, name) = match rest.rsplit_once(',') {
                Some((a, n)) => (a, n.trim().to_string()),
                None => (rest, String::new()),
            };
            let tvg_id = extract_attr(attrs_and_duration, "tvg-id");
            let group_title = extract_attr(attrs_and_duration, "group-title");
            pending = Some((tvg_id, name, group_title));
        } else if !line.is_empty() && !line.starts_with('#') {
            if let Some((tvg_id, name, group_title)) = pending.take() {
                entries.push(Entry {
                    tvg_id,
                    name,
                    group_title,
                    url: line.to_string(),
                });
            } else {
                return Err(ParseError {
                    location: format!("line {}", lineno + 1),
                    reason: "stream URL with no preceding #EXTINF".to_string(),
                });
            }
        }
    }

    let mut movies = Vec::new();
    let mut live = Vec::new();
    let mut shows: HashMap<String, Series> = HashMap::new();
    let mut next_guide_number = 1u32;

    for entry in entries {
        match taxonomy::classify_group_title(entry.group_title.as_deref().unwrap_or_default()) {
            Lane::Movies => {
                let (title, year) = split_title_year(&entry.name);
                movies.push(Movie {
                    id: stable_id("movie", &entry.url),
                    title,
                    year,
                    stream_url: entry.url,
                    artwork_url: None,
                });
            }
            Lane::Series => {
                if let Some((show_title, season_num, episode_num)) = split_episode_marker(&entry.name) {
                    let series_id = stable_id("series", &show_title);
                    let show = shows.entry(show_title.clone()).or_insert_with(|| Series {
                        id: series_id.clone(),
                        title: show_title.clone(),
                        year: None,
                        seasons: Vec::new(),
                        artwork_url: None,
                    });
                    let season = match show.seasons.iter_mut().find(|s| s.number == season_num) {
                        Some(s) => s,
                        None => {
                            show.seasons.push(Season {
                                number: season_num,
                                episodes: Vec::new(),
                            });
                            show.seasons.last_mut().unwrap()
                        }
                    };
                    season.episodes.push(Episode {
                        id: stable_id("ep", &entry.url),
                        season_num,
                        episode_num,
                        title: entry.name.clone(),
                        stream_url: entry.url,
                    });
                } else {
                    // No recognizable SxxEyy marker: treat the whole entry as
                    // a single-episode "series" rather than dropping it.
                    let series_id = stable_id("series", &entry.name);
                    shows.entry(entry.name.clone()).or_insert_with(|| Series {
                        id: series_id,
                        title: entry.name.clone(),
                        year: None,
                        seasons: vec![Season {
                            number: 1,
                            episodes: vec![Episode {
                                id: stable_id("ep", &entry.url),
                                season_num: 1,
                                episode_num: 1,
                                title: entry.name.clone(),
                                stream_url: entry.url.clone(),
                            }],
                        }],
                        artwork_url: None,
                    });
                }
            }
            Lane::Live => {
                let channel_id = stable_id("live", &entry.url);
                let guide_number = next_guide_number.to_string();
                next_guide_number += 1;
                live.push(LiveChannel {
                    channel_id,
                    guide_number,
                    guide_name: entry.name,
                    stream_url: entry.url.clone(),
                    stream_urls: vec![entry.url],
                    epg_linked: false,
                    tvg_id: entry.tvg_id.unwrap_or_default(),
                });
            }
        }
    }

    for season in shows.values_mut() {
        for s in &mut season.seasons {
            s.episodes.sort_by_key(|e| e.episode_num);
        }
        season.seasons.sort_by_key(|s| s.number);
    }

    Ok(ParsedM3u {
        movies,
        series: shows.into_values().collect(),
        live,
    })
}

/// Extracts a `key="value"` attribute from an `#EXTINF` attribute string.
fn extract_attr(attrs: &str, key: &str) -> Option<String> {
    let needle = format!("{key}=\"");
    let start = attrs.find(&needle)? + needle.len();
    let rest = &attrs[start..];
    let end = rest.find('"')?;
    let value = &rest[..end];
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Splits a trailing `(YYYY)` from a movie title, if present.
fn split_title_year(name: &str) -> (String, Option<u16>) {
    let trimmed = name.trim();
    if let Some(open) = trimmed.rfind('(') {
        if let Some(close) = trimmed[open..].find(')') {
            let inner = &trimmed[open + 1..open + close];
            if let Ok(year) = inner.parse::<u16>() {
                if (1888..=2100).contains(&year) {
                    let title = trimmed[..open].trim().to_string();
                    return (title, Some(year));
                }
            }
        }
    }
    (trimmed.to_string(), None)
}

/// Recognizes an `SxxEyy` (case-insensitive) marker in `name`, returning
/// `(show_title, season, episode)` with the marker and surrounding
/// separators stripped from the show title.
fn split_episode_marker(name: &str) -> Option<(String, u32, u32)> {
    let upper = name.to_ascii_uppercase();
    let bytes = upper.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'S' && bytes[i + 1].is_ascii_digit() {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            if j < bytes.len() && bytes[j] == b'E' && j + 1 < bytes.len() && bytes[j + 1].is_ascii_digit() {
                let season_num: u32 = upper[i + 1..j].parse().ok()?;
                let mut k = j + 1;
                while k < bytes.len() && bytes[k].is_ascii_digit() {
                    k += 1;
                }
                let episode_num: u32 = upper[j + 1..k].parse().ok()?;
                let show_title = name[..i].trim_end_matches(['-', ' ', '.']).trim().to_string();
                let show_title = if show_title.is_empty() {
                    name.to_string()
                } else {
                    show_title
                };
                return Some((show_title, season_num, episode_num));
            }
            i = j;
        } else {
            i += 1;
        }
    }
    None
}

/// Derives a stable id from a kind tag and a stable seed (typically the
/// stream URL, which does not change across refreshes for the same asset).
fn stable_id(kind: &str, seed: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    seed.hash(&mut hasher);
    format!("{kind}-{:016x}", hasher.finish())
}

// --- Xtream `player_api.php` JSON path -------------------------------------

#[derive(Debug, Deserialize)]
struct XtreamLiveStream {
    stream_id: u64,
    name: String,
    #[serde(default)]
    epg_channel_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XtreamVodStream {
    stream_id: u64,
    name: String,
    #[serde(default)]
    container_extension: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XtreamSeries {
    series_id: u64,
    name: String,
    #[serde(default)]
    release_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XtreamSeriesInfoResponse {
    #[serde(default)]
    episodes: HashMap<String, Vec<XtreamEpisode>>,
}

#[derive(Debug, Deserialize)]
struct XtreamEpisode {
    id: String,
    #[serde(default)]
    episode_num: u32,
    title: String,
    #[serde(default)]
    container_extension: Option<String>,
}

async fn index_via_player_api(
    cfg: &Config,
    base: &str,
) -> Result<(Vec<Movie>, Vec<Series>, Vec<LiveChannel>), ConfigError> {
    let client = http_client::shared();
    let base = base.trim_end_matches('/');
    let user = &cfg.provider_user;
    let pass = &cfg.provider_pass;

    let live = fetch_json::<Vec<XtreamLiveStream>>(&client, base, user, pass, "get_live_streams")
        .await?
        .into_iter()
        .enumerate()
        .map(|(i, s)| LiveChannel {
            channel_id: s.stream_id.to_string(),
            guide_number: (i as u32 + 1).to_string(),
            guide_name: s.name,
            stream_url: format!("{base}/live/{user}/{pass}/{}.ts", s.stream_id),
            stream_urls: vec![format!("{base}/live/{user}/{pass}/{}.ts", s.stream_id)],
            epg_linked: false,
            tvg_id: s.epg_channel_id.unwrap_or_default(),
        })
        .collect();

    if cfg.live_only {
        return Ok((Vec::new(), Vec::new(), live));
    }

    let movies = fetch_json::<Vec<XtreamVodStream>>(&client, base, user, pass, "get_vod_streams")
        .await?
        .into_iter()
        .map(|s| {
            let ext = s.container_extension.as_deref().unwrap_or("mp4");
            let (title, year) = split_title_year(&s.name);
            Movie {
                id: s.stream_id.to_string(),
                title,
                year,
                stream_url: format!("{base}/movie/{user}/{pass}/{}.{ext}", s.stream_id),
                artwork_url: None,
            }
        })
        .collect();

    let series_list = fetch_json::<Vec<XtreamSeries>>(&client, base, user, pass, "get_series").await?;
    let mut series = Vec::with_capacity(series_list.len());
    for s in series_list {
        let year = s
            .release_date
            .as_deref()
            .and_then(|d| d.get(0..4))
            .and_then(|y| y.parse::<u16>().ok());

        let info_url = format!(
            "{base}/player_api.php?username={user}&password={pass}&action=get_series_info&series_id={}",
            s.series_id
        );
        let info: XtreamSeriesInfoResponse = client
            .get(&info_url)
            .send()
            .await
            .map_err(|e| ConfigError {
                reason: format!("get_series_info failed for series {}: {e}", s.series_id),
            })?
            .json()
            .await
            .map_err(|e| ConfigError {
                reason: format!("malformed get_series_info response for series {}: {e}", s.series_id),
            })?;

        let mut seasons: Vec<Season> = info
            .episodes
            .into_iter()
            .filter_map(|(season_key, eps)| {
                let number: u32 = season_key.parse().ok()?;
                let mut episodes: Vec<Episode> = eps
                    .into_iter()
                    .map(|e| {
                        let ext = e.container_extension.as_deref().unwrap_or("mp4");
                        Episode {
                            id: e.id.clone(),
                            season_num: number,
                            episode_num: e.episode_num,
                            title: e.title,
                            stream_url: format!("{base}/series/{user}/{pass}/{}.{ext}", e.id),
                        }
                    })
                    .collect();
                episodes.sort_by_key(|e| e.episode_num);
                Some(Season { number, episodes })
            })
            .collect();
        seasons.sort_by_key(|s| s.number);

        series.push(Series {
            id: s.series_id.to_string(),
            title: s.name,
            year,
            seasons,
            artwork_url: None,
        });
    }

    Ok((movies, series, live))
}

async fn fetch_json<T: for<'de> Deserialize<'de>>(
    client: &reqwest::Client,
    base: &str,
    user: &str,
    pass: &str,
    action: &str,
) -> Result<T, ConfigError> {
    let url = format!("{base}/player_api.php?username={user}&password={pass}&action={action}");
    client
        .get(&url)
        .send()
        .await
        .map_err(|e| ConfigError {
            reason: format!("{action} request failed: {e}"),
        })?
        .json::<T>()
        .await
        .map_err(|e| ConfigError {
            reason: format!("{action} response malformed: {e}"),
        })
}

/// Applies [`epg_link::apply_deterministic_matches`] against a set of XMLTV
/// channels and an alias map, exposing the Indexer's side of the EPG-link
/// contract.
pub fn link_epg(
    live: &mut [LiveChannel],
    xmltv: &[XmltvChannel],
    aliases: &HashMap<String, String>,
) -> Vec<epg_link::MatchOutcome> {
    epg_link::apply_deterministic_matches(live, xmltv, aliases)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = concat!(
        "#EXTM3U\n",
        "#EXTINF:-1 tvg-id=\"espn.us\" group-title=\"Sports\",ESPN\n",
        "http://srv/live/espn\n",
        "#EXTINF:-1 group-title=\"VOD | Movies\",Up (2009)\n",
        "http://srv/vod/up.mp4\n",
        "#EXTINF:-1 group-title=\"TV Shows\",Show Name S01E01\n",
        "http://srv/series/show-s1e1.mp4\n",
        "#EXTINF:-1 group-title=\"TV Shows\",Show Name S01E02\n",
        "http://srv/series/show-s1e2.mp4\n",
    );

    #[test]
    fn rejects_missing_header() {
        assert!(parse_m3u("not a playlist").is_err());
    }

    #[test]
    fn parses_live_movie_and_series_lanes() {
        let parsed = parse_m3u(SAMPLE).unwrap();
        assert_eq!(parsed.live.len(), 1);
        assert_eq!(parsed.live[0].guide_name, "ESPN");
        assert_eq!(parsed.live[0].tvg_id, "espn.us");

        assert_eq!(parsed.movies.len(), 1);
        assert_eq!(parsed.movies[0].title, "Up");
        assert_eq!(parsed.movies[0].year, Some(2009));

        assert_eq!(parsed.series.len(), 1);
        let show = &parsed.series[0];
        assert_eq!(show.title, "Show Name");
        assert_eq!(show.seasons.len(), 1);
        assert_eq!(show.seasons[0].episodes.len(), 2);
        assert_eq!(show.seasons[0].episodes[0].episode_num, 1);
        assert_eq!(show.seasons[0].episodes[1].episode_num, 2);
    }

    #[test]
    fn split_title_year_extracts_trailing_parens() {
        assert_eq!(split_title_year("Up (2009)"), ("Up".to_string(), Some(2009)));
        assert_eq!(split_title_year("No Year Here"), ("No Year Here".to_string(), None));
    }

    #[test]
    fn split_episode_marker_recognizes_sxxeyy() {
        assert_eq!(
            split_episode_marker("Show Name S01E02"),
            Some(("Show Name".to_string(), 1, 2))
        );
        assert_eq!(split_episode_marker("No Marker Here"), None);
    }

    #[test]
    fn stable_id_is_deterministic() {
        assert_eq!(stable_id("movie", "http://a"), stable_id("movie", "http://a"));
        assert_ne!(stable_id("movie", "http://a"), stable_id("movie", "http://b"));
    }
}
