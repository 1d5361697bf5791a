//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use sightline::catalog::{CityRecord, InMemoryCatalog, MediaItem, PlaceRecord};
use sightline::config::{EngineConfig, MlConfig};
use sightline::feedback::InMemoryFeedbackStore;
use sightline::recommendation::engine::RecommendationEngine;

pub fn city(id: &str, name: &str) -> CityRecord {
    CityRecord {
        city_id: id.into(),
        city_name: name.into(),
        coordinates: [0.0, 0.0],
    }
}

pub fn place(id: &str, city_id: &str) -> PlaceRecord {
    PlaceRecord {
        place_id: id.into(),
        city_id: city_id.into(),
        place_name: id.replace('-', " "),
        coordinates: [0.0, 0.0],
    }
}

pub fn media(id: &str, place_id: &str, title: &str) -> MediaItem {
    MediaItem {
        media_id: id.into(),
        place_id: place_id.into(),
        title: title.into(),
        caption: String::new(),
        author_display_name: "fixture".into(),
        image_url: None,
        created_at: None,
        overall_rate: 0.0,
        ratings_count: 0,
    }
}

/// Give `media_id` one rating per entry, each from a distinct rater
pub fn rate_many(catalog: &InMemoryCatalog, media_id: &str, rates: &[f64]) {
    for (i, rate) in rates.iter().enumerate() {
        catalog
            .upsert_rating(&format!("rater-{i}"), media_id, *rate)
            .unwrap();
    }
}

/// Six cities, ten places, twelve media and six raters.
///
/// Only `azadi-sunset` (4.6, 5 votes), `hafez-tomb` (4.6, 5) and
/// `naqsh-square` (4.3, 5) pass the default popularity floor.
pub fn tour_catalog() -> InMemoryCatalog {
    let catalog = InMemoryCatalog::new();

    for (id, name) in [
        ("tehran", "Tehran"),
        ("shiraz", "Shiraz"),
        ("isfahan", "Isfahan"),
        ("tabriz", "Tabriz"),
        ("kish", "Kish"),
        ("mashhad", "Mashhad"),
    ] {
        catalog.upsert_city(city(id, name)).unwrap();
    }

    for (id, city_id) in [
        ("azadi", "tehran"),
        ("milad", "tehran"),
        ("golestan", "tehran"),
        ("hafezieh", "shiraz"),
        ("eram", "shiraz"),
        ("naqsh", "isfahan"),
        ("khaju", "isfahan"),
        ("elgoli", "tabriz"),
        ("kish-beach", "kish"),
        ("imam-reza", "mashhad"),
    ] {
        catalog.upsert_place(place(id, city_id)).unwrap();
    }

    for (id, place_id, title) in [
        ("azadi-sunset", "azadi", "Azadi Tower at sunset"),
        ("milad-night", "milad", "Milad Tower night view"),
        ("golestan-hall", "golestan", "Golestan Palace mirror hall"),
        ("hafez-tomb", "hafezieh", "Hafez tomb poetry night"),
        ("eram-garden", "eram", "Eram garden in spring"),
        ("naqsh-square", "naqsh", "Naqsh-e Jahan Square"),
        ("khaju-bridge", "khaju", "Khaju Bridge at dusk"),
        ("elgoli-snow", "elgoli", "El Goli pool in snow"),
        ("kish-coral", "kish-beach", "Coral beach"),
        ("reza-shrine", "imam-reza", "Imam Reza shrine courtyard"),
        ("occasion-nowruz-hafezieh", "hafezieh", "Nowruz at Hafezieh"),
        ("occasion-yalda-golestan", "golestan", "Yalda night at Golestan"),
    ] {
        catalog.upsert_media(media(id, place_id, title)).unwrap();
    }

    let ratings: &[(&str, &[(&str, f64)])] = &[
        (
            "alice",
            &[
                ("azadi-sunset", 5.0),
                ("milad-night", 4.5),
                ("hafez-tomb", 5.0),
                ("naqsh-square", 4.0),
                ("khaju-bridge", 2.0),
                ("reza-shrine", 4.5),
            ],
        ),
        (
            "bob",
            &[
                ("azadi-sunset", 4.5),
                ("hafez-tomb", 4.5),
                ("naqsh-square", 5.0),
                ("eram-garden", 4.0),
                ("elgoli-snow", 3.0),
            ],
        ),
        (
            "carol",
            &[
                ("azadi-sunset", 4.0),
                ("hafez-tomb", 5.0),
                ("naqsh-square", 4.5),
                ("golestan-hall", 5.0),
                ("kish-coral", 3.5),
            ],
        ),
        (
            "dave",
            &[
                ("azadi-sunset", 5.0),
                ("hafez-tomb", 4.0),
                ("naqsh-square", 3.5),
                ("milad-night", 4.0),
                ("khaju-bridge", 4.5),
            ],
        ),
        (
            "erin",
            &[
                ("azadi-sunset", 4.5),
                ("hafez-tomb", 4.5),
                ("naqsh-square", 4.5),
                ("reza-shrine", 5.0),
                ("elgoli-snow", 4.0),
            ],
        ),
        (
            "frank",
            &[
                ("milad-night", 3.0),
                ("golestan-hall", 4.0),
                ("kish-coral", 4.5),
                ("eram-garden", 5.0),
            ],
        ),
    ];
    for (user, rated) in ratings {
        for (media_id, rate) in rated.iter() {
            catalog.upsert_rating(user, media_id, *rate).unwrap();
        }
    }

    catalog
}

pub fn engine_over(
    catalog: InMemoryCatalog,
    ml: MlConfig,
) -> (Arc<RecommendationEngine>, Arc<InMemoryFeedbackStore>) {
    let feedback = Arc::new(InMemoryFeedbackStore::new());
    let engine = RecommendationEngine::new(
        Arc::new(catalog),
        feedback.clone(),
        EngineConfig::default(),
        &ml,
    )
    .with_ip_prefixes(vec![("5.160.".to_string(), "tehran".to_string())]);
    (Arc::new(engine), feedback)
}

pub fn tour_engine() -> (Arc<RecommendationEngine>, Arc<InMemoryFeedbackStore>) {
    engine_over(tour_catalog(), MlConfig::default())
}
