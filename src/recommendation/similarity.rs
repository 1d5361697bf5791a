//! Similarity Ranker
//!
//! Stateless scorer that ranks candidate media against a seed set using
//! keyword categories found in title + caption and city co-location.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::catalog::{MediaItem, PlaceRecord};

use super::engine::MatchReason;

const TOPIC_BONUS: f64 = 2.5;
const SAME_CITY_BONUS: f64 = 1.5;
const RATE_WEIGHT: f64 = 0.1;

/// Category -> substrings that signal it (matched on lowercased text)
const KEYWORD_CATEGORIES: &[(&str, &[&str])] = &[
    ("tower", &["tower", "برج"]),
    ("bridge", &["bridge", "پل"]),
    ("palace", &["palace", "کاخ"]),
    ("shrine", &["shrine", "حرم"]),
    ("square", &["square", "میدان"]),
    (
        "heritage",
        &["historical", "history", "ancient", "ruins", "historical site", "تاریخی"],
    ),
    ("poetry", &["poetry", "verse", "hafez", "شعر"]),
];

/// A candidate with its similarity score and the signal that placed it
#[derive(Debug, Clone)]
pub struct SimilarMatch {
    pub media: MediaItem,
    pub score: f64,
    pub reason: MatchReason,
}

/// Categories mentioned in a piece of text
pub fn extract_categories(text: &str) -> BTreeSet<&'static str> {
    let text = text.to_lowercase();
    KEYWORD_CATEGORIES
        .iter()
        .filter(|(_, tokens)| tokens.iter().any(|token| text.contains(token)))
        .map(|(category, _)| *category)
        .collect()
}

fn media_categories(media: &MediaItem) -> BTreeSet<&'static str> {
    extract_categories(&format!("{} {}", media.title, media.caption))
}

/// Rank `candidates` against `seeds`.
///
/// Score = 2.5 for a shared category + 1.5 for a seed city + overall_rate / 10.
/// Returns at most `limit` matches, best first, ties by media id.
pub fn rank_similar(
    seeds: &[MediaItem],
    candidates: &[MediaItem],
    places: &HashMap<String, PlaceRecord>,
    excluded: &HashSet<String>,
    limit: usize,
) -> Vec<SimilarMatch> {
    if seeds.is_empty() || limit == 0 {
        return Vec::new();
    }

    let mut seed_categories = BTreeSet::new();
    let mut seed_cities = HashSet::new();
    for seed in seeds {
        seed_categories.extend(media_categories(seed));
        if let Some(place) = places.get(&seed.place_id) {
            seed_cities.insert(place.city_id.as_str());
        }
    }

    let mut scored: Vec<SimilarMatch> = candidates
        .iter()
        .filter(|candidate| !excluded.contains(&candidate.media_id))
        .map(|candidate| {
            let topic = !media_categories(candidate).is_disjoint(&seed_categories);
            let same_city = places
                .get(&candidate.place_id)
                .map_or(false, |place| seed_cities.contains(place.city_id.as_str()));

            let mut score = candidate.overall_rate * RATE_WEIGHT;
            if topic {
                score += TOPIC_BONUS;
            }
            if same_city {
                score += SAME_CITY_BONUS;
            }

            let reason = if topic {
                MatchReason::SimilarTopic
            } else if same_city {
                MatchReason::SameCity
            } else {
                MatchReason::Similar
            };

            SimilarMatch {
                media: candidate.clone(),
                score,
                reason,
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.media.media_id.cmp(&b.media.media_id))
    });
    scored.truncate(limit);
    scored
}
