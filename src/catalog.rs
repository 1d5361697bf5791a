//! Catalog provider
//!
//! Read-only snapshots of cities, places, media items and rating triples.
//! The engine only ever reads through [`CatalogProvider`]; the in-memory
//! implementation here backs the service binary and the tests.

use chrono::{DateTime, Utc};
use rand::seq::{IteratorRandom, SliceRandom};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::RwLock;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// A city places belong to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CityRecord {
    pub city_id: String,
    pub city_name: String,
    /// `[latitude, longitude]`
    pub coordinates: [f64; 2],
}

/// A place media items are taken at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceRecord {
    pub place_id: String,
    pub city_id: String,
    pub place_name: String,
    pub coordinates: [f64; 2],
}

/// A photo/post of a place.
///
/// `overall_rate` and `ratings_count` are derived by the provider on every
/// read; values stored alongside the item are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaItem {
    pub media_id: String,
    pub place_id: String,
    pub title: String,
    #[serde(default)]
    pub caption: String,
    #[serde(default)]
    pub author_display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub overall_rate: f64,
    #[serde(default)]
    pub ratings_count: u32,
}

/// `(user, item, rate)` for either media or place granularity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingTriple {
    pub user_id: String,
    #[serde(alias = "mediaId", alias = "placeId")]
    pub item_id: String,
    pub rate: f64,
}

impl RatingTriple {
    pub fn new(user_id: impl Into<String>, item_id: impl Into<String>, rate: f64) -> Self {
        Self {
            user_id: user_id.into(),
            item_id: item_id.into(),
            rate,
        }
    }
}

/// Read-only view of the catalog and its ratings
pub trait CatalogProvider: Send + Sync {
    fn list_cities(&self) -> Result<Vec<CityRecord>>;

    /// Places, optionally restricted to one city
    fn list_places(&self, city_id: Option<&str>) -> Result<Vec<PlaceRecord>>;

    /// Media with `overall_rate`/`ratings_count` aggregated from current ratings
    fn list_media(&self) -> Result<Vec<MediaItem>>;

    fn list_media_rating_triples(&self) -> Result<Vec<RatingTriple>>;

    /// Place-level triples derived by the provider from media ratings,
    /// one per `(user, place)`
    fn list_place_rating_triples(&self) -> Result<Vec<RatingTriple>>;

    /// One user's media ratings
    fn list_user_ratings(&self, user_id: &str) -> Result<Vec<RatingTriple>> {
        Ok(self
            .list_media_rating_triples()?
            .into_iter()
            .filter(|t| t.user_id == user_id)
            .collect())
    }

    /// Uniform sample without replacement
    fn sample_random_media(&self, limit: usize) -> Result<Vec<MediaItem>>;

    fn list_all_places(&self) -> Result<Vec<PlaceRecord>> {
        self.list_places(None)
    }
}

/// Turns a user's rating of a media item into a rating of its place
pub trait PlaceRatingTransform: Send + Sync {
    fn place_rate(&self, media: &MediaItem, media_rate: f64) -> f64;
}

/// Uses the media rating as the place rating
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughPlaceRating;

impl PlaceRatingTransform for PassThroughPlaceRating {
    fn place_rate(&self, _media: &MediaItem, media_rate: f64) -> f64 {
        media_rate
    }
}

/// Serialized form of a catalog
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSnapshot {
    #[serde(default)]
    pub cities: Vec<CityRecord>,
    #[serde(default)]
    pub places: Vec<PlaceRecord>,
    #[serde(default)]
    pub media: Vec<MediaItem>,
    #[serde(default)]
    pub ratings: Vec<RatingTriple>,
}

#[derive(Default)]
struct CatalogState {
    cities: BTreeMap<String, CityRecord>,
    places: BTreeMap<String, PlaceRecord>,
    media: BTreeMap<String, MediaItem>,
    /// (user, media) -> rate, last write wins
    ratings: BTreeMap<(String, String), f64>,
}

/// In-memory catalog
pub struct InMemoryCatalog {
    state: RwLock<CatalogState>,
    place_transform: Box<dyn PlaceRatingTransform>,
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self {
            state: RwLock::new(CatalogState::default()),
            place_transform: Box::new(PassThroughPlaceRating),
        }
    }
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a snapshot. Duplicate ids are rejected.
    pub fn from_snapshot(snapshot: CatalogSnapshot) -> Result<Self> {
        let catalog = Self::new();
        {
            let mut state = catalog.write_state()?;
            for city in snapshot.cities {
                if state.cities.insert(city.city_id.clone(), city.clone()).is_some() {
                    return Err(Error::catalog(format!("duplicate city id '{}'", city.city_id)));
                }
            }
            for place in snapshot.places {
                if state.places.insert(place.place_id.clone(), place.clone()).is_some() {
                    return Err(Error::catalog(format!(
                        "duplicate place id '{}'",
                        place.place_id
                    )));
                }
            }
            for media in snapshot.media {
                if media.media_id.trim().is_empty() {
                    return Err(Error::catalog("media item with empty id"));
                }
                if state.media.insert(media.media_id.clone(), media.clone()).is_some() {
                    return Err(Error::catalog(format!(
                        "duplicate media id '{}'",
                        media.media_id
                    )));
                }
            }
            for rating in snapshot.ratings {
                check_rate(rating.rate)?;
                if !state.media.contains_key(&rating.item_id) {
                    return Err(Error::not_found("media", rating.item_id));
                }
                state
                    .ratings
                    .insert((rating.user_id, rating.item_id), rating.rate);
            }
        }
        Ok(catalog)
    }

    /// Load a JSON [`CatalogSnapshot`] from disk
    pub fn from_snapshot_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let snapshot: CatalogSnapshot = serde_json::from_str(&raw)?;
        info!(
            "Loaded catalog snapshot from {}: {} cities, {} places, {} media, {} ratings",
            path.display(),
            snapshot.cities.len(),
            snapshot.places.len(),
            snapshot.media.len(),
            snapshot.ratings.len()
        );
        Self::from_snapshot(snapshot)
    }

    /// Swap the place-rating derivation
    pub fn with_place_transform(mut self, transform: impl PlaceRatingTransform + 'static) -> Self {
        self.place_transform = Box::new(transform);
        self
    }

    pub fn upsert_city(&self, city: CityRecord) -> Result<()> {
        self.write_state()?.cities.insert(city.city_id.clone(), city);
        Ok(())
    }

    pub fn upsert_place(&self, place: PlaceRecord) -> Result<()> {
        self.write_state()?.places.insert(place.place_id.clone(), place);
        Ok(())
    }

    pub fn upsert_media(&self, media: MediaItem) -> Result<()> {
        self.write_state()?.media.insert(media.media_id.clone(), media);
        Ok(())
    }

    /// Record a user's rating of a media item, replacing any earlier one
    pub fn upsert_rating(&self, user_id: &str, media_id: &str, rate: f64) -> Result<()> {
        check_rate(rate)?;
        let mut state = self.write_state()?;
        if !state.media.contains_key(media_id) {
            return Err(Error::not_found("media", media_id));
        }
        state
            .ratings
            .insert((user_id.to_string(), media_id.to_string()), rate);
        debug!("Rating upserted: user={}, media={}, rate={}", user_id, media_id, rate);
        Ok(())
    }

    fn read_state(&self) -> Result<std::sync::RwLockReadGuard<'_, CatalogState>> {
        self.state
            .read()
            .map_err(|_| Error::catalog("catalog lock poisoned"))
    }

    fn write_state(&self) -> Result<std::sync::RwLockWriteGuard<'_, CatalogState>> {
        self.state
            .write()
            .map_err(|_| Error::catalog("catalog lock poisoned"))
    }
}

/// Attach fresh rating aggregates to each media item
fn aggregate_media(state: &CatalogState) -> Vec<MediaItem> {
    let mut sums: HashMap<&str, (f64, u32)> = HashMap::new();
    for ((_, media_id), rate) in &state.ratings {
        let entry = sums.entry(media_id.as_str()).or_insert((0.0, 0));
        entry.0 += rate;
        entry.1 += 1;
    }

    state
        .media
        .values()
        .map(|media| {
            let mut item = media.clone();
            let (sum, count) = sums.get(media.media_id.as_str()).copied().unwrap_or((0.0, 0));
            item.ratings_count = count;
            item.overall_rate = if count == 0 {
                0.0
            } else {
                round2(sum / count as f64)
            };
            item
        })
        .collect()
}

fn check_rate(rate: f64) -> Result<()> {
    if rate.is_finite() {
        Ok(())
    } else {
        Err(Error::bad_request(format!("rating must be a finite number, got {rate}")))
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

impl CatalogProvider for InMemoryCatalog {
    fn list_cities(&self) -> Result<Vec<CityRecord>> {
        let state = self.read_state()?;
        let mut cities: Vec<CityRecord> = state.cities.values().cloned().collect();
        cities.sort_by(|a, b| a.city_name.cmp(&b.city_name));
        Ok(cities)
    }

    fn list_places(&self, city_id: Option<&str>) -> Result<Vec<PlaceRecord>> {
        let state = self.read_state()?;
        let mut places: Vec<PlaceRecord> = state
            .places
            .values()
            .filter(|place| city_id.map_or(true, |id| place.city_id == id))
            .cloned()
            .collect();
        places.sort_by(|a, b| a.place_name.cmp(&b.place_name));
        Ok(places)
    }

    fn list_media(&self) -> Result<Vec<MediaItem>> {
        let state = self.read_state()?;
        Ok(aggregate_media(&state))
    }

    fn list_media_rating_triples(&self) -> Result<Vec<RatingTriple>> {
        let state = self.read_state()?;
        Ok(state
            .ratings
            .iter()
            .map(|((user_id, media_id), rate)| RatingTriple::new(user_id, media_id, *rate))
            .collect())
    }

    fn list_place_rating_triples(&self) -> Result<Vec<RatingTriple>> {
        let state = self.read_state()?;

        // Several rated media at one place collapse to their mean
        let mut sums: BTreeMap<(&str, &str), (f64, u32)> = BTreeMap::new();
        for ((user_id, media_id), rate) in &state.ratings {
            let Some(media) = state.media.get(media_id) else {
                continue;
            };
            let place_rate = self.place_transform.place_rate(media, *rate);
            let entry = sums
                .entry((user_id.as_str(), media.place_id.as_str()))
                .or_insert((0.0, 0));
            entry.0 += place_rate;
            entry.1 += 1;
        }

        Ok(sums
            .into_iter()
            .map(|((user_id, place_id), (sum, count))| {
                RatingTriple::new(user_id, place_id, sum / count as f64)
            })
            .collect())
    }

    fn sample_random_media(&self, limit: usize) -> Result<Vec<MediaItem>> {
        let state = self.read_state()?;
        let mut rng = rand::thread_rng();
        let mut sample = aggregate_media(&state)
            .into_iter()
            .choose_multiple(&mut rng, limit);
        sample.shuffle(&mut rng);
        Ok(sample)
    }
}

/// Index places by id
pub fn place_lookup(places: Vec<PlaceRecord>) -> HashMap<String, PlaceRecord> {
    places
        .into_iter()
        .map(|place| (place.place_id.clone(), place))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn media(id: &str, place: &str, title: &str) -> MediaItem {
        MediaItem {
            media_id: id.to_string(),
            place_id: place.to_string(),
            title: title.to_string(),
            caption: String::new(),
            author_display_name: String::new(),
            image_url: None,
            created_at: None,
            overall_rate: 0.0,
            ratings_count: 0,
        }
    }

    fn sample_catalog() -> InMemoryCatalog {
        InMemoryCatalog::from_snapshot(CatalogSnapshot {
            cities: vec![CityRecord {
                city_id: "tehran".into(),
                city_name: "Tehran".into(),
                coordinates: [35.7, 51.4],
            }],
            places: vec![PlaceRecord {
                place_id: "azadi".into(),
                city_id: "tehran".into(),
                place_name: "Azadi Tower".into(),
                coordinates: [35.7, 51.3],
            }],
            media: vec![media("m1", "azadi", "Azadi at dusk"), media("m2", "azadi", "Square")],
            ratings: vec![
                RatingTriple::new("u1", "m1", 5.0),
                RatingTriple::new("u2", "m1", 4.0),
                RatingTriple::new("u3", "m1", 4.0),
            ],
        })
        .unwrap()
    }

    #[test]
    fn test_media_stats_are_recomputed_on_read() {
        let catalog = sample_catalog();
        let items = catalog.list_media().unwrap();
        let m1 = items.iter().find(|m| m.media_id == "m1").unwrap();
        assert_eq!(m1.ratings_count, 3);
        assert!((m1.overall_rate - 4.33).abs() < 1e-9);

        let m2 = items.iter().find(|m| m.media_id == "m2").unwrap();
        assert_eq!(m2.ratings_count, 0);
        assert_eq!(m2.overall_rate, 0.0);

        catalog.upsert_rating("u1", "m1", 1.0).unwrap();
        let items = catalog.list_media().unwrap();
        let m1 = items.iter().find(|m| m.media_id == "m1").unwrap();
        assert_eq!(m1.ratings_count, 3);
        assert!((m1.overall_rate - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_duplicate_media_rejected() {
        let result = InMemoryCatalog::from_snapshot(CatalogSnapshot {
            media: vec![media("m1", "p", "a"), media("m1", "p", "b")],
            ..Default::default()
        });
        assert!(matches!(result, Err(Error::Catalog { .. })));
    }

    #[test]
    fn test_place_triples_use_transform() {
        struct Halve;
        impl PlaceRatingTransform for Halve {
            fn place_rate(&self, _media: &MediaItem, media_rate: f64) -> f64 {
                media_rate / 2.0
            }
        }

        let catalog = sample_catalog().with_place_transform(Halve);
        let triples = catalog.list_place_rating_triples().unwrap();
        assert_eq!(triples.len(), 3);
        assert!(triples.iter().all(|t| t.item_id == "azadi"));
        assert!(triples.iter().any(|t| t.user_id == "u1" && t.rate == 2.5));
    }

    #[test]
    fn test_place_triples_average_media_at_the_same_place() {
        let catalog = sample_catalog();
        catalog.upsert_media(media("m3", "azadi", "Azadi square")).unwrap();
        catalog.upsert_rating("zed", "m1", 5.0).unwrap();
        catalog.upsert_rating("zed", "m3", 1.0).unwrap();

        let zed: Vec<RatingTriple> = catalog
            .list_place_rating_triples()
            .unwrap()
            .into_iter()
            .filter(|t| t.user_id == "zed")
            .collect();
        assert_eq!(zed, vec![RatingTriple::new("zed", "azadi", 3.0)]);
    }

    #[test]
    fn test_invalid_ratings_rejected() {
        let catalog = sample_catalog();
        assert!(matches!(
            catalog.upsert_rating("u1", "m1", f64::NAN),
            Err(Error::BadRequest { .. })
        ));
        assert!(matches!(
            catalog.upsert_rating("u1", "m1", f64::INFINITY),
            Err(Error::BadRequest { .. })
        ));
        assert!(matches!(
            catalog.upsert_rating("u1", "ghost", 4.0),
            Err(Error::NotFound { .. })
        ));

        let unknown_media = InMemoryCatalog::from_snapshot(CatalogSnapshot {
            media: vec![media("m1", "p", "a")],
            ratings: vec![RatingTriple::new("u1", "ghost", 4.0)],
            ..Default::default()
        });
        assert!(matches!(unknown_media, Err(Error::NotFound { .. })));

        let bad_rate = InMemoryCatalog::from_snapshot(CatalogSnapshot {
            media: vec![media("m1", "p", "a")],
            ratings: vec![RatingTriple::new("u1", "m1", f64::NAN)],
            ..Default::default()
        });
        assert!(matches!(bad_rate, Err(Error::BadRequest { .. })));
    }

    #[test]
    fn test_user_ratings_are_filtered_by_user() {
        let catalog = sample_catalog();
        let ratings = catalog.list_user_ratings("u3").unwrap();
        assert_eq!(ratings, vec![RatingTriple::new("u3", "m1", 4.0)]);
        assert!(catalog.list_user_ratings("nobody").unwrap().is_empty());
    }

    #[test]
    fn test_sample_random_media_is_bounded_and_distinct() {
        let catalog = sample_catalog();
        let sample = catalog.sample_random_media(5).unwrap();
        assert_eq!(sample.len(), 2);
        let ids: HashSet<_> = sample.iter().map(|m| m.media_id.clone()).collect();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_snapshot_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"{
                "cities": [{"cityId": "shiraz", "cityName": "Shiraz", "coordinates": [29.6, 52.5]}],
                "places": [{"placeId": "hafezieh", "cityId": "shiraz", "placeName": "Hafezieh", "coordinates": [29.6, 52.5]}],
                "media": [{"mediaId": "m9", "placeId": "hafezieh", "title": "Hafez poetry night"}],
                "ratings": [{"userId": "u1", "mediaId": "m9", "rate": 4.5}]
            }"#,
        )
        .unwrap();

        let catalog = InMemoryCatalog::from_snapshot_file(&path).unwrap();
        assert_eq!(catalog.list_places(Some("shiraz")).unwrap().len(), 1);
        assert!(catalog.list_places(Some("tehran")).unwrap().is_empty());
        let triples = catalog.list_media_rating_triples().unwrap();
        assert_eq!(triples, vec![RatingTriple::new("u1", "m9", 4.5)]);
    }
}
