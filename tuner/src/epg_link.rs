//! Deterministic `tvg-id`/alias/normalized-name matching of live channels
//! against XMLTV channel identities.

use std::collections::HashMap;

use crate::catalog::model::{LiveChannel, XmltvChannel};

/// Noise tokens stripped during name normalization.
const NOISE_TOKENS: [&str; 14] = [
    "hd", "uhd", "fhd", "sd", "4k", "us", "usa", "uk", "ca", "canada", "cdn",
    "hq", "vip", "backup", "raw",
];

/// Outcome of attempting to match one [`LiveChannel`] to an XMLTV id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// Already linked before this pass ran; left untouched.
    AlreadyLinked,
    /// Newly matched to the given XMLTV id, via the given tier.
    Matched { xmltv_id: String, tier: MatchTier },
    /// No match found.
    Unmatched,
    /// A normalized-name match existed but was ambiguous (mapped to more
    /// than one XMLTV id) and was therefore not applied.
    Ambiguous,
}

/// Which matching tier produced a [`MatchOutcome::Matched`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTier {
    /// Case-insensitive exact match of `tvg_id` against an XMLTV channel id.
    TvgIdExact,
    /// The channel's normalized guide name was present in the alias map.
    AliasExact,
    /// The channel's normalized guide name mapped to exactly one XMLTV
    /// channel id across all ids and display names.
    NormalizedNameExact,
}

/// Normalizes a channel/display name for fuzzy matching: lowercase,
/// non-alphanumeric runs collapsed to single spaces, tokenized, noise tokens
/// dropped, remaining tokens concatenated, and the substring `"channel"`
/// removed.
#[must_use]
pub fn normalize(name: &str) -> String {
    let lower = name.to_ascii_lowercase();

    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in lower.chars() {
        if c.is_ascii_alphanumeric() {
            current.push(c);
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    let kept: String = tokens
        .into_iter()
        .filter(|t| !NOISE_TOKENS.contains(&t.as_str()))
        .collect::<Vec<_>>()
        .join("");

    kept.replace("channel", "")
}

/// Applies deterministic matching tiers, in order, to every channel in
/// `channels`, mutating already-unlinked channels in place when a match is
/// found. Already-linked channels are counted (in the returned outcomes) but
/// left alone. Returns one [`MatchOutcome`] per input channel, in order.
pub fn apply_deterministic_matches(
    channels: &mut [LiveChannel],
    xmltv: &[XmltvChannel],
    aliases: &HashMap<String, String>,
) -> Vec<MatchOutcome> {
    let tvg_id_index: HashMap<String, String> = xmltv
        .iter()
        .map(|c| (c.id.to_ascii_lowercase(), c.id.clone()))
        .collect();

    // Build the normalized-name index across *all* ids and display names;
    // a normalized key mapping to more than one distinct xmltv id is
    // ambiguous and must never be applied.
    let mut normalized_index: HashMap<String, Vec<String>> = HashMap::new();
    for c in xmltv {
        let mut names = c.display_names.clone();
        names.push(c.id.clone());
        for name in names {
            let key = normalize(&name);
            if key.is_empty() {
                continue;
            }
            let ids = normalized_index.entry(key).or_default();
            if !ids.contains(&c.id) {
                ids.push(c.id.clone());
            }
        }
    }

    channels
        .iter_mut()
        .map(|ch| {
            if ch.epg_linked {
                return MatchOutcome::AlreadyLinked;
            }

            if !ch.tvg_id.is_empty() {
                if let Some(id) = tvg_id_index.get(&ch.tvg_id.to_ascii_lowercase()) {
                    ch.tvg_id = id.clone();
                    ch.epg_linked = true;
                    return MatchOutcome::Matched {
                        xmltv_id: id.clone(),
                        tier: MatchTier::TvgIdExact,
                    };
                }
            }

            let normalized_name = normalize(&ch.guide_name);

            if let Some(id) = aliases.get(&normalized_name) {
                ch.tvg_id = id.clone();
                ch.epg_linked = true;
                return MatchOutcome::Matched {
                    xmltv_id: id.clone(),
                    tier: MatchTier::AliasExact,
                };
            }

            match normalized_index.get(&normalized_name) {
                Some(ids) if ids.len() == 1 => {
                    ch.tvg_id = ids[0].clone();
                    ch.epg_linked = true;
                    MatchOutcome::Matched {
                        xmltv_id: ids[0].clone(),
                        tier: MatchTier::NormalizedNameExact,
                    }
                }
                Some(_) => MatchOutcome::Ambiguous,
                None => MatchOutcome::Unmatched,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(guide_name: &str, tvg_id: &str) -> LiveChannel {
        LiveChannel {
            channel_id: guide_name.to_string(),
            guide_number: "1".into(),
            guide_name: guide_name.to_string(),
            stream_url: "http://a".into(),
            stream_urls: vec![],
            epg_linked: false,
            tvg_id: tvg_id.to_string(),
        }
    }

    fn xmltv(id: &str, names: &[&str]) -> XmltvChannel {
        XmltvChannel {
            id: id.to_string(),
            display_names: names.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn normalize_drops_noise_and_channel_substring() {
        assert_eq!(normalize("ESPN HD (US)"), "espn");
        assert_eq!(normalize("Discovery Channel 4K"), "discovery");
        assert_eq!(normalize("CNN  -  USA"), "cnn");
    }

    #[test]
    fn tvg_id_exact_wins_first() {
        let mut channels = vec![channel("Whatever", "ESPN.us")];
        let xmltv = vec![xmltv("espn.us", &["ESPN"])];
        let outcomes =
            apply_deterministic_matches(&mut channels, &xmltv, &HashMap::new());
        assert_eq!(
            outcomes[0],
            MatchOutcome::Matched {
                xmltv_id: "espn.us".into(),
                tier: MatchTier::TvgIdExact,
            }
        );
        assert_eq!(channels[0].tvg_id, "espn.us");
        assert!(channels[0].epg_linked);
    }

    #[test]
    fn alias_exact_used_when_no_tvg_id_match() {
        let mut channels = vec![channel("Sports Channel One", "")];
        let xmltv = vec![xmltv("s1.us", &["Something Else"])];
        let mut aliases = HashMap::new();
        aliases.insert(normalize("Sports Channel One"), "s1.us".to_string());

        let outcomes = apply_deterministic_matches(&mut channels, &xmltv, &aliases);
        assert_eq!(
            outcomes[0],
            MatchOutcome::Matched {
                xmltv_id: "s1.us".into(),
                tier: MatchTier::AliasExact,
            }
        );
    }

    #[test]
    fn ambiguous_normalized_name_is_not_applied() {
        let mut channels = vec![channel("News 1", "")];
        let xmltv = vec![
            xmltv("news1-a", &["News 1"]),
            xmltv("news1-b", &["News 1"]),
        ];
        let outcomes =
            apply_deterministic_matches(&mut channels, &xmltv, &HashMap::new());
        assert_eq!(outcomes[0], MatchOutcome::Ambiguous);
        assert!(!channels[0].epg_linked);
        assert_eq!(channels[0].tvg_id, "");
    }

    #[test]
    fn already_linked_channels_are_left_alone() {
        let mut ch = channel("Whatever", "old.id");
        ch.epg_linked = true;
        let mut channels = vec![ch];
        let xmltv = vec![xmltv("new.id", &["Whatever"])];
        let outcomes =
            apply_deterministic_matches(&mut channels, &xmltv, &HashMap::new());
        assert_eq!(outcomes[0], MatchOutcome::AlreadyLinked);
        assert_eq!(channels[0].tvg_id, "old.id");
    }

    #[test]
    fn deterministic_for_fixed_inputs() {
        let mut channels = vec![channel("ESPN", "")];
        let xmltv = vec![xmltv("espn.us", &["ESPN"])];
        let first = apply_deterministic_matches(&mut channels.clone(), &xmltv, &HashMap::new());
        let second = apply_deterministic_matches(&mut channels, &xmltv, &HashMap::new());
        assert_eq!(first, second);
    }
}
