//! Recommendation Engine
//!
//! Turns the catalog, the rating history, the CF model snapshots and the
//! feedback log into ranked, reason-tagged media lists. Every strategy is a
//! read-only function of those inputs; the only writer is [`RecommendationEngine::train`],
//! which swaps in new model snapshots.

use chrono::{Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::catalog::{place_lookup, CatalogProvider, MediaItem, PlaceRecord, RatingTriple};
use crate::config::{Config, EngineConfig, MlConfig};
use crate::error::{Error, Result};
use crate::feedback::{self, AbSummary, FeedbackAction, FeedbackEvent, FeedbackStore};
use crate::location::{resolve_city, CityResolution};

use super::ab::{self, AbBucket, AbGroup};
use super::calendar::{self, Season, WeatherSection};
use super::metrics::{self, PerformanceTimer};
use super::model::{CollaborativeModel, ModelParams, ModelSlot};
use super::similarity::rank_similar;

/// Requests slower than this are logged at warn level
const SLOW_REQUEST_MS: u64 = 500;

/// Named strategies the engine serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Popular,
    Nearest,
    Personalized,
    Weather,
    Occasions,
    Random,
    Similar,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Popular => "popular",
            Strategy::Nearest => "nearest",
            Strategy::Personalized => "personalized",
            Strategy::Weather => "weather",
            Strategy::Occasions => "occasions",
            Strategy::Random => "random",
            Strategy::Similar => "similar",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "popular" => Some(Strategy::Popular),
            "nearest" | "nearby" => Some(Strategy::Nearest),
            "personalized" => Some(Strategy::Personalized),
            "weather" => Some(Strategy::Weather),
            "occasions" | "occasion" => Some(Strategy::Occasions),
            "random" | "explore" => Some(Strategy::Random),
            "similar" => Some(Strategy::Similar),
            _ => None,
        }
    }

    /// Feedback log key; `Similar` batches are not rated
    pub fn feedback_action(&self) -> Option<FeedbackAction> {
        match self {
            Strategy::Popular => Some(FeedbackAction::Popular),
            Strategy::Nearest => Some(FeedbackAction::Nearest),
            Strategy::Personalized => Some(FeedbackAction::Personalized),
            Strategy::Weather => Some(FeedbackAction::Weather),
            Strategy::Occasions => Some(FeedbackAction::Occasions),
            Strategy::Random => Some(FeedbackAction::Random),
            Strategy::Similar => None,
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an item is in the list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchReason {
    Popular,
    PopularFallback,
    YourNearest,
    HighUserRating,
    MlPersonalized,
    SimilarTopic,
    SameCity,
    Similar,
    WeatherNow,
    WeatherSnow,
    WeatherSummer,
    RandomExplore,
    /// Carries the occasion id, serialized as `occasion_<id>`
    Occasion(&'static str),
}

impl MatchReason {
    pub fn tag(&self) -> Cow<'static, str> {
        match self {
            MatchReason::Popular => "popular".into(),
            MatchReason::PopularFallback => "popular_fallback".into(),
            MatchReason::YourNearest => "your_nearest".into(),
            MatchReason::HighUserRating => "high_user_rating".into(),
            MatchReason::MlPersonalized => "ml_personalized".into(),
            MatchReason::SimilarTopic => "similar_topic".into(),
            MatchReason::SameCity => "same_city".into(),
            MatchReason::Similar => "similar".into(),
            MatchReason::WeatherNow => "weather_now".into(),
            MatchReason::WeatherSnow => "weather_snow".into(),
            MatchReason::WeatherSummer => "weather_summer".into(),
            MatchReason::RandomExplore => "random_explore".into(),
            MatchReason::Occasion(id) => format!("occasion_{id}").into(),
        }
    }
}

impl std::fmt::Display for MatchReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.tag())
    }
}

impl Serialize for MatchReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.tag())
    }
}

/// A media item as served, with the signals that placed it
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedItem {
    #[serde(flatten)]
    pub media: MediaItem,
    pub match_reason: MatchReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ml_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ab_bucket: Option<AbBucket>,
}

impl RecommendedItem {
    pub fn new(media: MediaItem, match_reason: MatchReason) -> Self {
        Self {
            media,
            match_reason,
            ml_score: None,
            user_rate: None,
            similarity_score: None,
            ab_bucket: None,
        }
    }

    pub fn media_id(&self) -> &str {
        &self.media.media_id
    }
}

/// A titled group of items (weather and occasion strategies)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    pub id: String,
    pub title: String,
    pub cities: Vec<String>,
    pub items: Vec<RecommendedItem>,
}

/// One upward recommendation call
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationRequest {
    #[serde(skip)]
    pub strategy: Option<Strategy>,
    pub limit: Option<usize>,
    pub user_id: Option<String>,
    pub city_id: Option<String>,
    pub client_ip: Option<String>,
    /// Explicit A/B group override ("A" or "B")
    pub version: Option<String>,
    /// Seed media id(s) for `Similar`, comma separated
    pub media_id: Option<String>,
}

impl RecommendationRequest {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy: Some(strategy),
            ..Default::default()
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn city(mut self, city_id: impl Into<String>) -> Self {
        self.city_id = Some(city_id.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn seed(mut self, media_id: impl Into<String>) -> Self {
        self.media_id = Some(media_id.into());
        self
    }

    fn seed_ids(&self) -> Vec<String> {
        self.media_id
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationResponse {
    pub strategy: Strategy,
    /// Strategy that actually produced the baseline (`fallback_popular`
    /// when personalization had nothing)
    pub source: &'static str,
    pub ab_group: AbGroup,
    pub limit: usize,
    pub excluded_count: usize,
    /// For sectioned strategies: the de-duplicated union in section order
    pub items: Vec<RecommendedItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sections: Option<Vec<Section>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<CityResolution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub season: Option<Season>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainReport {
    /// Media model readiness, the one the strategies consult
    pub trained: bool,
    pub place_trained: bool,
    pub media_samples: usize,
    pub place_samples: usize,
    pub skipped_rows: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub ml_enabled: bool,
    pub models_ready: bool,
    pub place_model_ready: bool,
    pub media_ratings_samples: usize,
    pub place_ratings_samples: usize,
    pub media_model_users: usize,
    pub media_model_items: usize,
    pub place_model_users: usize,
    pub place_model_items: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterestCount {
    pub id: String,
    pub name: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInterests {
    pub user_id: String,
    pub cities: Vec<InterestCount>,
    pub places: Vec<InterestCount>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRating {
    pub media_id: String,
    pub rate: f64,
    pub liked: bool,
    /// Absent when the rated media is no longer in the catalog
    pub media: Option<MediaItem>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRatings {
    pub user_id: String,
    pub count: usize,
    pub items: Vec<UserRating>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RatedMedia {
    #[serde(flatten)]
    pub media: MediaItem,
    pub user_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFeed {
    pub items: Vec<MediaItem>,
    pub rated_high: Vec<RatedMedia>,
    pub rated_low: Vec<RatedMedia>,
}

/// Feedback as submitted by a client
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackInput {
    pub user_id: String,
    pub action: FeedbackAction,
    pub liked: bool,
    #[serde(default)]
    pub shown_media_ids: Vec<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Catalog read once per call so every step sees the same data
struct CatalogView {
    media: Vec<MediaItem>,
    places: HashMap<String, PlaceRecord>,
}

impl CatalogView {
    fn by_id(&self) -> HashMap<&str, &MediaItem> {
        self.media
            .iter()
            .map(|media| (media.media_id.as_str(), media))
            .collect()
    }

    fn city_of(&self, media: &MediaItem) -> Option<&str> {
        self.places
            .get(&media.place_id)
            .map(|place| place.city_id.as_str())
    }
}

/// `(overall_rate desc, ratings_count desc)`, then media id
fn by_rating_stats(a: &MediaItem, b: &MediaItem) -> Ordering {
    b.overall_rate
        .partial_cmp(&a.overall_rate)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.ratings_count.cmp(&a.ratings_count))
        .then_with(|| a.media_id.cmp(&b.media_id))
}

/// Drop rows no model can learn from; returns the kept rows and the skip count
pub fn to_training_triples(raw: Vec<RatingTriple>) -> (Vec<RatingTriple>, usize) {
    let total = raw.len();
    let kept: Vec<RatingTriple> = raw
        .into_iter()
        .filter(|t| {
            !t.user_id.trim().is_empty() && !t.item_id.trim().is_empty() && t.rate.is_finite()
        })
        .collect();
    let skipped = total - kept.len();
    if skipped > 0 {
        warn!("Skipped {} malformed rating rows", skipped);
    }
    (kept, skipped)
}

/// Flatten sections in order, keeping the first occurrence of each media id
fn flatten_sections(sections: &[Section]) -> Vec<RecommendedItem> {
    let mut seen = HashSet::new();
    sections
        .iter()
        .flat_map(|section| section.items.iter())
        .filter(|item| seen.insert(item.media.media_id.clone()))
        .cloned()
        .collect()
}

/// Main recommendation engine
pub struct RecommendationEngine {
    provider: Arc<dyn CatalogProvider>,
    feedback: Arc<dyn FeedbackStore>,
    config: EngineConfig,
    ml_enabled: bool,
    ip_prefixes: Vec<(String, String)>,
    media_model: ModelSlot,
    place_model: ModelSlot,
    media_ready: AtomicBool,
    place_ready: AtomicBool,
}

impl RecommendationEngine {
    pub fn new(
        provider: Arc<dyn CatalogProvider>,
        feedback: Arc<dyn FeedbackStore>,
        config: EngineConfig,
        ml: &MlConfig,
    ) -> Self {
        let params = ModelParams::from(ml);
        Self {
            provider,
            feedback,
            config,
            ml_enabled: ml.enabled,
            ip_prefixes: Vec::new(),
            media_model: ModelSlot::new("media", params.clone()),
            place_model: ModelSlot::new("place", params),
            media_ready: AtomicBool::new(false),
            place_ready: AtomicBool::new(false),
        }
    }

    pub fn from_config(
        config: &Config,
        provider: Arc<dyn CatalogProvider>,
        feedback: Arc<dyn FeedbackStore>,
    ) -> Self {
        Self::new(provider, feedback, config.engine.clone(), &config.ml)
            .with_ip_prefixes(config.geo.ip_prefixes.clone())
    }

    pub fn with_ip_prefixes(mut self, prefixes: Vec<(String, String)>) -> Self {
        self.ip_prefixes = prefixes;
        self
    }

    pub fn provider(&self) -> &Arc<dyn CatalogProvider> {
        &self.provider
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether the media model may be consulted
    pub fn models_ready(&self) -> bool {
        self.ml_enabled && self.media_ready.load(AtomicOrdering::Acquire)
    }

    pub fn place_model_ready(&self) -> bool {
        self.ml_enabled && self.place_ready.load(AtomicOrdering::Acquire)
    }

    /// Clamp a caller limit to `1..=max_limit`; absent means the default
    pub fn clamp_limit(&self, limit: Option<usize>) -> usize {
        limit
            .unwrap_or(self.config.default_limit)
            .clamp(1, self.config.max_limit)
    }

    fn view(&self) -> Result<CatalogView> {
        Ok(CatalogView {
            media: self.provider.list_media()?,
            places: place_lookup(self.provider.list_all_places()?),
        })
    }

    /// The media model, if ML is on and its last training succeeded
    fn media_ml_model(&self) -> Option<Arc<CollaborativeModel>> {
        if !self.models_ready() {
            return None;
        }
        let snapshot = self.media_model.snapshot();
        snapshot.is_trained().then_some(snapshot)
    }

    fn base_quota(&self, limit: usize) -> usize {
        (limit as f64 * self.config.personalized_base_share).ceil() as usize
    }

    // ========================================================================
    // Strategies
    // ========================================================================

    /// Well rated, well voted items; the whole catalog when nothing qualifies
    pub fn popular(&self, limit: usize, excluded: &HashSet<String>) -> Result<Vec<RecommendedItem>> {
        let _timer = PerformanceTimer::new("popular");

        let mut candidates: Vec<MediaItem> = self
            .provider
            .list_media()?
            .into_iter()
            .filter(|media| !excluded.contains(&media.media_id))
            .collect();
        candidates.sort_by(by_rating_stats);

        let qualifying: Vec<MediaItem> = candidates
            .iter()
            .filter(|media| {
                media.overall_rate >= self.config.popular_min_rate
                    && media.ratings_count >= self.config.popular_min_votes
            })
            .cloned()
            .collect();

        let (pool, reason) = if qualifying.is_empty() {
            debug!("No media passes the popularity floor, using the full catalog");
            metrics::record_degraded("popular", "fallback_catalog");
            (candidates, MatchReason::PopularFallback)
        } else {
            (qualifying, MatchReason::Popular)
        };

        Ok(pool
            .into_iter()
            .take(limit)
            .map(|media| RecommendedItem::new(media, reason))
            .collect())
    }

    /// Items in one city, ML-ranked when a user is known
    pub fn nearest(
        &self,
        city_id: &str,
        user_id: Option<&str>,
        limit: usize,
        excluded: &HashSet<String>,
    ) -> Result<Vec<RecommendedItem>> {
        let _timer = PerformanceTimer::new("nearest");
        let view = self.view()?;
        let cities: HashSet<&str> = [city_id].into_iter().collect();
        Ok(self.rank_in_cities(
            &view,
            &cities,
            user_id,
            limit,
            excluded,
            MatchReason::YourNearest,
            "nearest",
        ))
    }

    /// The user's own favourites, then model picks, then look-alikes.
    ///
    /// Empty when the user has never rated anything.
    pub fn personalized(
        &self,
        user_id: &str,
        limit: usize,
        excluded: &HashSet<String>,
    ) -> Result<Vec<RecommendedItem>> {
        let _timer = PerformanceTimer::new("personalized");

        let user_ratings = self.provider.list_user_ratings(user_id)?;
        if user_ratings.is_empty() {
            debug!("User {} has no ratings, nothing to personalize", user_id);
            return Ok(Vec::new());
        }

        let view = self.view()?;
        let by_id = view.by_id();

        // (a) base set
        let mut base: Vec<(&MediaItem, f64)> = user_ratings
            .iter()
            .filter(|t| t.rate >= self.config.personalized_min_user_rate)
            .filter(|t| !excluded.contains(&t.item_id))
            .filter_map(|t| by_id.get(t.item_id.as_str()).map(|media| (*media, t.rate)))
            .collect();
        base.sort_by(|(a, rate_a), (b, rate_b)| {
            rate_b
                .partial_cmp(rate_a)
                .unwrap_or(Ordering::Equal)
                .then_with(|| by_rating_stats(a, b))
        });
        base.truncate(self.base_quota(limit));

        let seeds: Vec<MediaItem> = base.iter().map(|(media, _)| (*media).clone()).collect();
        let mut taken: HashSet<String> = excluded.clone();
        taken.extend(seeds.iter().map(|media| media.media_id.clone()));

        let mut items: Vec<RecommendedItem> = base
            .into_iter()
            .map(|(media, rate)| {
                let mut item = RecommendedItem::new(media.clone(), MatchReason::HighUserRating);
                item.user_rate = Some(rate);
                item
            })
            .collect();

        // (b) ML fill
        let remaining = limit.saturating_sub(items.len());
        if remaining > 0 {
            match self.media_ml_model() {
                Some(model) => match model.recommend(user_id, (limit * 3).max(limit), false) {
                    Ok(ranked) => {
                        let mut added = 0;
                        for (media_id, score) in ranked {
                            if added >= remaining {
                                break;
                            }
                            if taken.contains(&media_id) {
                                continue;
                            }
                            if let Some(media) = by_id.get(media_id.as_str()) {
                                let mut item =
                                    RecommendedItem::new((*media).clone(), MatchReason::MlPersonalized);
                                item.ml_score = Some(score);
                                items.push(item);
                                taken.insert(media_id);
                                added += 1;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("ML fill skipped for {}: {}", user_id, e);
                        metrics::record_degraded("personalized", "ml_fill");
                    }
                },
                None => {
                    debug!("Models not ready, skipping ML fill for {}", user_id);
                    metrics::record_degraded("personalized", "ml_fill");
                }
            }
        }

        // (c) similarity fill
        let cap = limit.min(self.config.similar_fill_cap);
        for found in rank_similar(&seeds, &view.media, &view.places, &taken, cap) {
            let mut item = RecommendedItem::new(found.media, found.reason);
            item.similarity_score = Some(found.score);
            items.push(item);
        }

        items.truncate(limit);
        debug!(
            "Personalized {} items for user {}",
            items.len(),
            user_id
        );
        Ok(items)
    }

    /// Three weather sections for the season of `today`
    pub fn weather(
        &self,
        today: NaiveDate,
        user_id: Option<&str>,
        limit: usize,
        excluded: &HashSet<String>,
    ) -> Result<Vec<Section>> {
        let _timer = PerformanceTimer::new("weather");
        let season = Season::of(today);
        let view = self.view()?;

        Ok(WeatherSection::ALL
            .iter()
            .map(|section| {
                let cities: HashSet<&str> = section.cities(season).iter().copied().collect();
                let reason = match section {
                    WeatherSection::GoNow => MatchReason::WeatherNow,
                    WeatherSection::SnowCold => MatchReason::WeatherSnow,
                    WeatherSection::SummerCool => MatchReason::WeatherSummer,
                };
                Section {
                    id: section.id().to_string(),
                    title: section.title().to_string(),
                    cities: section.cities(season).iter().map(|c| c.to_string()).collect(),
                    items: self.rank_in_cities(&view, &cities, user_id, limit, excluded, reason, "weather"),
                }
            })
            .collect())
    }

    /// One section per active occasion: curated media first, then the
    /// occasion's cities. Empty sections are dropped.
    pub fn occasions(
        &self,
        today: NaiveDate,
        user_id: Option<&str>,
        limit: usize,
        excluded: &HashSet<String>,
    ) -> Result<Vec<Section>> {
        let _timer = PerformanceTimer::new("occasions");
        let view = self.view()?;
        let by_id = view.by_id();

        let mut sections = Vec::new();
        for occasion in calendar::active_occasions(today, self.config.occasion_window_days) {
            let reason = MatchReason::Occasion(occasion.id);

            let mut items: Vec<RecommendedItem> = occasion
                .curated_media
                .iter()
                .filter(|id| !excluded.contains(**id))
                .filter_map(|id| by_id.get(*id))
                .take(limit)
                .map(|media| RecommendedItem::new((*media).clone(), reason))
                .collect();

            let remaining = limit.saturating_sub(items.len());
            if remaining > 0 {
                let mut skip = excluded.clone();
                skip.extend(items.iter().map(|item| item.media.media_id.clone()));
                let cities: HashSet<&str> = occasion.cities.iter().copied().collect();
                items.extend(self.rank_in_cities(
                    &view,
                    &cities,
                    user_id,
                    remaining,
                    &skip,
                    reason,
                    "occasions",
                ));
            }

            if items.is_empty() {
                debug!("Occasion {} has no media, dropped", occasion.id);
                continue;
            }
            sections.push(Section {
                id: occasion.id.to_string(),
                title: occasion.title.to_string(),
                cities: occasion.cities.iter().map(|c| c.to_string()).collect(),
                items,
            });
        }

        Ok(sections)
    }

    /// Uniform sample of the non-excluded catalog
    pub fn random(&self, limit: usize, excluded: &HashSet<String>) -> Result<Vec<RecommendedItem>> {
        // Oversample by the excluded count so `limit` survivors remain
        Ok(self
            .provider
            .sample_random_media(limit + excluded.len())?
            .into_iter()
            .filter(|media| !excluded.contains(&media.media_id))
            .take(limit)
            .map(|media| RecommendedItem::new(media, MatchReason::RandomExplore))
            .collect())
    }

    /// "More like these"
    pub fn similar(
        &self,
        seed_ids: &[String],
        limit: usize,
        excluded: &HashSet<String>,
    ) -> Result<Vec<RecommendedItem>> {
        let _timer = PerformanceTimer::new("similar");
        let view = self.view()?;

        let seeds: Vec<MediaItem> = view
            .media
            .iter()
            .filter(|media| seed_ids.contains(&media.media_id))
            .cloned()
            .collect();
        if seeds.is_empty() {
            return Err(Error::not_found("media", seed_ids.join(",")));
        }

        let mut skip = excluded.clone();
        skip.extend(seed_ids.iter().cloned());

        Ok(rank_similar(&seeds, &view.media, &view.places, &skip, limit)
            .into_iter()
            .map(|found| {
                let mut item = RecommendedItem::new(found.media, found.reason);
                item.similarity_score = Some(found.score);
                item
            })
            .collect())
    }

    /// Media whose place is in `cities`, ordered by ML score (missing scores
    /// last) and then by rating stats.
    #[allow(clippy::too_many_arguments)]
    fn rank_in_cities(
        &self,
        view: &CatalogView,
        cities: &HashSet<&str>,
        user_id: Option<&str>,
        limit: usize,
        excluded: &HashSet<String>,
        reason: MatchReason,
        strategy: &'static str,
    ) -> Vec<RecommendedItem> {
        let model = match user_id {
            Some(_) => {
                let model = self.media_ml_model();
                if model.is_none() {
                    metrics::record_degraded(strategy, "ml_score");
                }
                model
            }
            None => None,
        };

        let mut scored: Vec<(&MediaItem, Option<f64>)> = view
            .media
            .iter()
            .filter(|media| !excluded.contains(&media.media_id))
            .filter(|media| view.city_of(media).map_or(false, |city| cities.contains(city)))
            .map(|media| {
                let score = match (&model, user_id) {
                    (Some(model), Some(user)) => model.predict_rating(user, &media.media_id).ok(),
                    _ => None,
                };
                (media, score)
            })
            .collect();

        scored.sort_by(|(a, score_a), (b, score_b)| {
            let score_a = score_a.unwrap_or(-1.0);
            let score_b = score_b.unwrap_or(-1.0);
            score_b
                .partial_cmp(&score_a)
                .unwrap_or(Ordering::Equal)
                .then_with(|| by_rating_stats(a, b))
        });

        scored
            .into_iter()
            .take(limit)
            .map(|(media, score)| {
                let mut item = RecommendedItem::new(media.clone(), reason);
                item.ml_score = score;
                item
            })
            .collect()
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Serve a request for today's date
    pub fn recommend(&self, request: &RecommendationRequest) -> Result<RecommendationResponse> {
        self.recommend_on(request, Local::now().date_naive())
    }

    /// Serve a request as of `today`.
    ///
    /// Resolves the A/B group, loads the exclusion set from the latest
    /// feedback, runs the strategy and, for group B users, mixes in the
    /// explore half.
    pub fn recommend_on(
        &self,
        request: &RecommendationRequest,
        today: NaiveDate,
    ) -> Result<RecommendationResponse> {
        let strategy = request
            .strategy
            .ok_or_else(|| Error::bad_request("strategy is required"))?;
        let timer = PerformanceTimer::new(strategy.as_str());

        let limit = self.clamp_limit(request.limit);
        let user_id = request
            .user_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());
        let group = ab::resolve_group(user_id, request.version.as_deref());
        let excluded = match (user_id, strategy.feedback_action()) {
            (Some(user), Some(action)) => feedback::exclusion_for(self.feedback.as_ref(), user, action)?,
            _ => HashSet::new(),
        };

        let variant_b = group == AbGroup::B && user_id.is_some();
        let baseline_limit = if variant_b {
            limit - ab::explore_share(limit)
        } else {
            limit
        };

        let mut response = RecommendationResponse {
            strategy,
            source: strategy.as_str(),
            ab_group: group,
            limit,
            excluded_count: excluded.len(),
            items: Vec::new(),
            sections: None,
            city: None,
            season: None,
        };

        let baseline = match strategy {
            Strategy::Popular => self.popular(baseline_limit, &excluded)?,
            Strategy::Nearest => {
                let cities = self.provider.list_cities()?;
                let resolved = resolve_city(
                    &cities,
                    request.city_id.as_deref(),
                    request.client_ip.as_deref(),
                    &self.ip_prefixes,
                )?;
                let items = self.nearest(&resolved.city.city_id, user_id, baseline_limit, &excluded)?;
                response.city = Some(resolved);
                items
            }
            Strategy::Personalized => {
                let items = match user_id {
                    Some(user) => self.personalized(user, baseline_limit, &excluded)?,
                    None => Vec::new(),
                };
                if items.is_empty() && baseline_limit > 0 {
                    debug!("Personalized empty for {:?}, falling back to popular", user_id);
                    metrics::record_degraded("personalized", "fallback_popular");
                    response.source = "fallback_popular";
                    self.popular(baseline_limit, &excluded)?
                } else {
                    items
                }
            }
            Strategy::Weather | Strategy::Occasions => {
                let sections = if strategy == Strategy::Weather {
                    response.season = Some(Season::of(today));
                    self.weather(today, user_id, baseline_limit, &excluded)?
                } else {
                    self.occasions(today, user_id, baseline_limit, &excluded)?
                };
                let mut flat = flatten_sections(&sections);
                if variant_b {
                    flat.truncate(baseline_limit);
                } else {
                    response.sections = Some(sections);
                }
                flat
            }
            Strategy::Random => self.random(baseline_limit, &excluded)?,
            Strategy::Similar => {
                let seeds = request.seed_ids();
                if seeds.is_empty() {
                    return Err(Error::bad_request("mediaId is required for similar"));
                }
                self.similar(&seeds, baseline_limit, &excluded)?
            }
        };

        response.items = if variant_b {
            self.compose_variant_b(baseline, limit, &excluded)?
        } else {
            baseline
        };

        metrics::record_served(strategy.as_str(), group.as_str(), response.items.len());
        debug!(
            "Served {} {} items (group {}, source {}, {} excluded)",
            response.items.len(),
            strategy,
            group,
            response.source,
            excluded.len()
        );
        timer.log_if_slow(SLOW_REQUEST_MS);

        Ok(response)
    }

    /// Baseline half interleaved with a random explore half
    fn compose_variant_b(
        &self,
        mut baseline: Vec<RecommendedItem>,
        limit: usize,
        excluded: &HashSet<String>,
    ) -> Result<Vec<RecommendedItem>> {
        let half = ab::explore_share(limit);
        baseline.truncate(limit - half);

        let mut skip = excluded.clone();
        skip.extend(baseline.iter().map(|item| item.media.media_id.clone()));
        let explore = self.random(half, &skip)?;

        Ok(ab::interleave(baseline, explore, limit)
            .into_iter()
            .map(|(mut item, bucket)| {
                item.ab_bucket = Some(bucket);
                item
            })
            .collect())
    }

    // ========================================================================
    // Models
    // ========================================================================

    /// Retrain both models from the provider's current ratings.
    ///
    /// Fitting failures are reported through `trained: false`, never as an
    /// error; only provider failures propagate.
    pub fn train(&self) -> Result<TrainReport> {
        if !self.ml_enabled {
            warn!("ML disabled, training skipped");
            return Ok(TrainReport {
                trained: false,
                place_trained: false,
                media_samples: 0,
                place_samples: 0,
                skipped_rows: 0,
            });
        }

        let _timer = PerformanceTimer::new("train_models");
        let (media_triples, media_skipped) =
            to_training_triples(self.provider.list_media_rating_triples()?);
        let (place_triples, place_skipped) =
            to_training_triples(self.provider.list_place_rating_triples()?);

        let media_ok = Self::train_slot(&self.media_model, &media_triples);
        let place_ok = Self::train_slot(&self.place_model, &place_triples);
        self.media_ready.store(media_ok, AtomicOrdering::Release);
        self.place_ready.store(place_ok, AtomicOrdering::Release);
        if !place_ok {
            warn!("⚠️ Place model not ready, media recommendations unaffected");
        }

        info!(
            "🧠 Training finished: media ready={}, place ready={} (media {} rows, place {} rows)",
            media_ok,
            place_ok,
            media_triples.len(),
            place_triples.len()
        );

        Ok(TrainReport {
            trained: media_ok,
            place_trained: place_ok,
            media_samples: media_triples.len(),
            place_samples: place_triples.len(),
            skipped_rows: media_skipped + place_skipped,
        })
    }

    fn train_slot(slot: &ModelSlot, triples: &[RatingTriple]) -> bool {
        match slot.train(triples) {
            Ok(true) => {
                metrics::record_training(slot.name(), "ok");
                true
            }
            Ok(false) => {
                metrics::record_training(slot.name(), "skipped");
                false
            }
            Err(e) => {
                warn!("{} model not updated: {}", slot.name(), e);
                metrics::record_training(slot.name(), "failed");
                false
            }
        }
    }

    pub fn status(&self) -> Result<EngineStatus> {
        let media = self.media_model.snapshot();
        let place = self.place_model.snapshot();
        Ok(EngineStatus {
            ml_enabled: self.ml_enabled,
            models_ready: self.models_ready(),
            place_model_ready: self.place_model_ready(),
            media_ratings_samples: self.provider.list_media_rating_triples()?.len(),
            place_ratings_samples: self.provider.list_place_rating_triples()?.len(),
            media_model_users: media.user_count(),
            media_model_items: media.item_count(),
            place_model_users: place.user_count(),
            place_model_items: place.item_count(),
        })
    }

    // ========================================================================
    // User views and feedback
    // ========================================================================

    /// The user's media ratings, best first, each with its media item
    pub fn user_ratings(&self, user_id: &str) -> Result<UserRatings> {
        let view = self.view()?;
        let by_id = view.by_id();

        let mut items: Vec<UserRating> = self
            .provider
            .list_user_ratings(user_id)?
            .into_iter()
            .map(|rating| UserRating {
                liked: rating.rate >= self.config.personalized_min_user_rate,
                media: by_id.get(rating.item_id.as_str()).map(|media| (*media).clone()),
                media_id: rating.item_id,
                rate: rating.rate,
            })
            .collect();
        items.sort_by(|a, b| {
            b.rate
                .partial_cmp(&a.rate)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.media_id.cmp(&b.media_id))
        });

        Ok(UserRatings {
            user_id: user_id.to_string(),
            count: items.len(),
            items,
        })
    }

    /// Cities and places the user rated highly, most frequent first
    pub fn user_interests(&self, user_id: &str) -> Result<UserInterests> {
        let view = self.view()?;
        let by_id = view.by_id();
        let city_names: HashMap<String, String> = self
            .provider
            .list_cities()?
            .into_iter()
            .map(|city| (city.city_id, city.city_name))
            .collect();

        let mut cities: BTreeMap<String, usize> = BTreeMap::new();
        let mut places: BTreeMap<String, usize> = BTreeMap::new();
        for rating in self.provider.list_user_ratings(user_id)? {
            if rating.rate < self.config.personalized_min_user_rate {
                continue;
            }
            let Some(media) = by_id.get(rating.item_id.as_str()) else {
                continue;
            };
            *places.entry(media.place_id.clone()).or_default() += 1;
            if let Some(city) = view.city_of(media) {
                *cities.entry(city.to_string()).or_default() += 1;
            }
        }

        let ranked = |counts: BTreeMap<String, usize>, name_of: &dyn Fn(&str) -> String| {
            let mut out: Vec<InterestCount> = counts
                .into_iter()
                .map(|(id, count)| InterestCount {
                    name: name_of(&id),
                    id,
                    count,
                })
                .collect();
            // BTreeMap order gives the id tie-break; the sort is stable
            out.sort_by(|a, b| b.count.cmp(&a.count));
            out
        };

        Ok(UserInterests {
            user_id: user_id.to_string(),
            cities: ranked(cities, &|id| city_names.get(id).cloned().unwrap_or_else(|| id.to_string())),
            places: ranked(places, &|id| {
                view.places
                    .get(id)
                    .map(|place| place.place_name.clone())
                    .unwrap_or_else(|| id.to_string())
            }),
        })
    }

    /// The whole catalog by rating stats, plus the user's rated items split
    /// into liked and disliked
    pub fn media_feed(&self, user_id: Option<&str>) -> Result<MediaFeed> {
        let mut items = self.provider.list_media()?;
        items.sort_by(by_rating_stats);

        let mut rated_high = Vec::new();
        let mut rated_low = Vec::new();
        if let Some(user) = user_id.filter(|id| !id.is_empty()) {
            let by_id: HashMap<&str, &MediaItem> =
                items.iter().map(|media| (media.media_id.as_str(), media)).collect();
            for rating in self.provider.list_user_ratings(user)? {
                let Some(media) = by_id.get(rating.item_id.as_str()) else {
                    continue;
                };
                let rated = RatedMedia {
                    media: (*media).clone(),
                    user_rate: rating.rate,
                };
                if rating.rate >= self.config.personalized_min_user_rate {
                    rated_high.push(rated);
                } else {
                    rated_low.push(rated);
                }
            }
        }

        let by_user_rate = |a: &RatedMedia, b: &RatedMedia| {
            a.user_rate
                .partial_cmp(&b.user_rate)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.media.media_id.cmp(&b.media.media_id))
        };
        rated_high.sort_by(|a, b| by_user_rate(b, a));
        rated_low.sort_by(by_user_rate);

        Ok(MediaFeed {
            items,
            rated_high,
            rated_low,
        })
    }

    /// Validate and append a feedback event, stamped with the user's A/B group
    pub fn record_feedback(&self, input: FeedbackInput) -> Result<FeedbackEvent> {
        let group = ab::resolve_group(Some(input.user_id.trim()), input.version.as_deref());
        let event = FeedbackEvent::new(
            &input.user_id,
            input.action,
            input.liked,
            input.shown_media_ids,
            Some(group),
        )?;
        self.feedback.append(event.clone())?;
        info!(
            "📊 Feedback recorded: user={}, action={}, liked={}, shown={}",
            event.user_id,
            event.action,
            event.liked,
            event.shown_media_ids.len()
        );
        Ok(event)
    }

    pub fn ab_summary(&self, days: Option<i64>) -> Result<AbSummary> {
        feedback::ab_summary(
            self.feedback.as_ref(),
            days.unwrap_or(feedback::DEFAULT_SUMMARY_DAYS),
            Utc::now(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CityRecord, InMemoryCatalog};
    use crate::feedback::InMemoryFeedbackStore;

    fn media(id: &str, place: &str, title: &str) -> MediaItem {
        MediaItem {
            media_id: id.into(),
            place_id: place.into(),
            title: title.into(),
            caption: String::new(),
            author_display_name: "tester".into(),
            image_url: None,
            created_at: None,
            overall_rate: 0.0,
            ratings_count: 0,
        }
    }

    fn engine_with(catalog: InMemoryCatalog) -> RecommendationEngine {
        RecommendationEngine::new(
            Arc::new(catalog),
            Arc::new(InMemoryFeedbackStore::new()),
            EngineConfig::default(),
            &MlConfig::default(),
        )
    }

    fn small_catalog() -> InMemoryCatalog {
        let catalog = InMemoryCatalog::new();
        catalog
            .upsert_city(CityRecord {
                city_id: "tehran".into(),
                city_name: "Tehran".into(),
                coordinates: [35.69, 51.39],
            })
            .unwrap();
        catalog
            .upsert_place(PlaceRecord {
                place_id: "azadi".into(),
                city_id: "tehran".into(),
                place_name: "Azadi".into(),
                coordinates: [35.7, 51.33],
            })
            .unwrap();
        for id in ["m1", "m2", "m3"] {
            catalog.upsert_media(media(id, "azadi", "Azadi tower")).unwrap();
        }
        catalog
    }

    #[test]
    fn test_match_reason_tags() {
        assert_eq!(MatchReason::PopularFallback.tag(), "popular_fallback");
        assert_eq!(MatchReason::Occasion("nowruz").tag(), "occasion_nowruz");
        assert_eq!(
            serde_json::to_string(&MatchReason::MlPersonalized).unwrap(),
            "\"ml_personalized\""
        );
    }

    #[test]
    fn test_strategy_parse_and_actions() {
        assert_eq!(Strategy::parse("Occasion"), Some(Strategy::Occasions));
        assert_eq!(Strategy::parse(" nearby "), Some(Strategy::Nearest));
        assert_eq!(Strategy::parse("explore"), Some(Strategy::Random));
        assert_eq!(Strategy::parse("explore").map(|s| s.as_str()), Some("random"));
        assert_eq!(Strategy::parse("bogus"), None);
        assert_eq!(Strategy::Similar.feedback_action(), None);
        assert_eq!(
            Strategy::Weather.feedback_action(),
            Some(FeedbackAction::Weather)
        );
    }

    #[test]
    fn test_clamp_limit() {
        let engine = engine_with(InMemoryCatalog::new());
        assert_eq!(engine.clamp_limit(None), 20);
        assert_eq!(engine.clamp_limit(Some(0)), 1);
        assert_eq!(engine.clamp_limit(Some(500)), 100);
    }

    #[test]
    fn test_training_rows_are_sanitized() {
        let (kept, skipped) = to_training_triples(vec![
            RatingTriple::new("u1", "m1", 4.0),
            RatingTriple::new("", "m1", 4.0),
            RatingTriple::new("u1", " ", 4.0),
            RatingTriple::new("u2", "m2", f64::NAN),
        ]);
        assert_eq!(kept.len(), 1);
        assert_eq!(skipped, 3);
    }

    #[test]
    fn test_untrained_engine_reports_not_ready() {
        let engine = engine_with(small_catalog());
        let status = engine.status().unwrap();
        assert!(status.ml_enabled);
        assert!(!status.models_ready);
        assert_eq!(status.media_model_items, 0);

        // No ratings at all: nothing to fit
        let report = engine.train().unwrap();
        assert!(!report.trained);
        assert!(!engine.models_ready());
    }

    #[test]
    fn test_train_then_status() {
        let catalog = small_catalog();
        catalog.upsert_rating("u1", "m1", 5.0).unwrap();
        catalog.upsert_rating("u2", "m2", 3.0).unwrap();
        let engine = engine_with(catalog);

        let report = engine.train().unwrap();
        assert!(report.trained);
        assert_eq!(report.media_samples, 2);

        let status = engine.status().unwrap();
        assert!(status.models_ready);
        assert_eq!(status.media_model_users, 2);
        assert_eq!(status.media_model_items, 2);
        assert_eq!(status.place_model_items, 1);
    }

    #[test]
    fn test_disabled_ml_never_trains() {
        let catalog = small_catalog();
        catalog.upsert_rating("u1", "m1", 5.0).unwrap();
        let ml = MlConfig {
            enabled: false,
            ..MlConfig::default()
        };
        let engine = RecommendationEngine::new(
            Arc::new(catalog),
            Arc::new(InMemoryFeedbackStore::new()),
            EngineConfig::default(),
            &ml,
        );
        assert!(!engine.train().unwrap().trained);
        assert!(!engine.status().unwrap().ml_enabled);
    }

    #[test]
    fn test_flatten_sections_dedupes_in_order() {
        let item = |id: &str| RecommendedItem::new(media(id, "p", "t"), MatchReason::WeatherNow);
        let sections = vec![
            Section {
                id: "a".into(),
                title: "A".into(),
                cities: vec![],
                items: vec![item("m1"), item("m2")],
            },
            Section {
                id: "b".into(),
                title: "B".into(),
                cities: vec![],
                items: vec![item("m2"), item("m3")],
            },
        ];
        let ids: Vec<String> = flatten_sections(&sections)
            .iter()
            .map(|i| i.media_id().to_string())
            .collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn test_similar_requires_known_seed() {
        let engine = engine_with(small_catalog());
        let err = engine
            .similar(&["missing".to_string()], 5, &HashSet::new())
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));

        let request = RecommendationRequest::new(Strategy::Similar);
        assert!(matches!(
            engine.recommend(&request),
            Err(Error::BadRequest { .. })
        ));
    }
}
