//! Seasons, weather sections and the occasion calendar.
//!
//! All lookups take the reference date explicitly so callers decide what
//! "today" means (the engine uses the server's local date).

use chrono::{Datelike, NaiveDate};
use once_cell::sync::Lazy;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Season {
    Winter,
    Spring,
    Summer,
    Autumn,
}

impl Season {
    /// Winter: Dec–Feb, spring: Mar–May, summer: Jun–Aug, autumn otherwise
    pub fn from_month(month: u32) -> Self {
        match month {
            12 | 1 | 2 => Season::Winter,
            3..=5 => Season::Spring,
            6..=8 => Season::Summer,
            _ => Season::Autumn,
        }
    }

    pub fn of(date: NaiveDate) -> Self {
        Self::from_month(date.month())
    }
}

/// Which of the three weather sections a list belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeatherSection {
    GoNow,
    SnowCold,
    SummerCool,
}

impl WeatherSection {
    pub const ALL: [WeatherSection; 3] = [
        WeatherSection::GoNow,
        WeatherSection::SnowCold,
        WeatherSection::SummerCool,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            WeatherSection::GoNow => "go-now",
            WeatherSection::SnowCold => "snow-cold",
            WeatherSection::SummerCool => "summer-cool",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            WeatherSection::GoNow => "Best right now",
            WeatherSection::SnowCold => "Snow and cold",
            WeatherSection::SummerCool => "Cool summer escapes",
        }
    }

    /// City ids for this section in the given season
    pub fn cities(&self, season: Season) -> &'static [&'static str] {
        match self {
            WeatherSection::GoNow => match season {
                Season::Winter => &["kish", "qeshm", "bandarabbas", "shiraz"],
                Season::Summer => &["ardabil", "astara", "tonkabon", "tabriz"],
                Season::Spring => &["shiraz", "isfahan", "mashhad", "tehran"],
                Season::Autumn => &["shiraz", "isfahan", "kish", "qeshm"],
            },
            WeatherSection::SnowCold => &["tabriz", "ardabil", "astara", "gorgan", "tonkabon"],
            WeatherSection::SummerCool => &["ardabil", "astara", "tonkabon", "tabriz"],
        }
    }
}

/// A dated cultural occasion with its curated media and city fallback
#[derive(Debug, Clone)]
pub struct Occasion {
    pub id: &'static str,
    pub title: &'static str,
    pub month: u32,
    pub day: u32,
    pub cities: &'static [&'static str],
    pub always_show: bool,
    pub curated_media: &'static [&'static str],
}

impl Occasion {
    /// Active if always shown, or `today` is within `window_days` of the
    /// target date in the previous, current or next year.
    pub fn is_active(&self, today: NaiveDate, window_days: i64) -> bool {
        if self.always_show {
            return true;
        }
        days_to_nearest(self.month, self.day, today)
            .map_or(false, |distance| distance <= window_days)
    }
}

/// Absolute distance in days from `today` to the closest (month, day)
/// across years y-1, y and y+1. None if the date never exists (e.g. Feb 30).
pub fn days_to_nearest(month: u32, day: u32, today: NaiveDate) -> Option<i64> {
    let year = today.year();
    (year - 1..=year + 1)
        .filter_map(|y| NaiveDate::from_ymd_opt(y, month, day))
        .map(|target| (target - today).num_days().abs())
        .min()
}

pub static OCCASIONS: Lazy<Vec<Occasion>> = Lazy::new(|| {
    vec![
        Occasion {
            id: "bahman22",
            title: "22 Bahman",
            month: 2,
            day: 11,
            cities: &["tehran"],
            always_show: true,
            curated_media: &[
                "occasion-22bahman-azadi",
                "occasion-22bahman-milad",
                "occasion-22bahman-imam-khomeini",
            ],
        },
        Occasion {
            id: "nowruz",
            title: "Nowruz",
            month: 3,
            day: 21,
            cities: &["shiraz", "isfahan", "tehran"],
            always_show: true,
            curated_media: &["occasion-nowruz-hafezieh", "occasion-nowruz-cyrus"],
        },
        Occasion {
            id: "yalda",
            title: "Yalda Night",
            month: 12,
            day: 21,
            cities: &["tehran", "isfahan", "shiraz"],
            always_show: true,
            curated_media: &["occasion-yalda-golestan"],
        },
        Occasion {
            id: "christmas",
            title: "Christmas",
            month: 12,
            day: 25,
            cities: &["tehran", "isfahan"],
            always_show: true,
            curated_media: &[
                "occasion-christmas-mirzaye-shirazi",
                "occasion-christmas-vank",
                "occasion-christmas-saint-mary",
            ],
        },
        Occasion {
            id: "imammahdi",
            title: "Birth of Imam Mahdi",
            month: 2,
            day: 15,
            cities: &["mashhad", "tehran"],
            always_show: true,
            curated_media: &["occasion-imammahdi-mashhad"],
        },
        Occasion {
            id: "chaharshanbe_soori",
            title: "Chaharshanbe Soori",
            month: 3,
            day: 18,
            cities: &["isfahan", "tehran", "shiraz"],
            always_show: false,
            curated_media: &["occasion-chaharshanbe-soori-naqsh"],
        },
        Occasion {
            id: "sizdah_bedar",
            title: "Sizdah Bedar",
            month: 4,
            day: 2,
            cities: &["tehran", "shiraz", "isfahan", "mashhad"],
            always_show: false,
            curated_media: &[],
        },
        Occasion {
            id: "mehregan",
            title: "Mehregan",
            month: 10,
            day: 2,
            cities: &["tehran", "shiraz", "isfahan"],
            always_show: false,
            curated_media: &[],
        },
    ]
});

/// Occasions active on `today`, in table order
pub fn active_occasions(today: NaiveDate, window_days: i64) -> Vec<&'static Occasion> {
    OCCASIONS
        .iter()
        .filter(|occasion| occasion.is_active(today, window_days))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn dated(month: u32, day: u32) -> Occasion {
        Occasion {
            id: "sample",
            title: "Sample",
            month,
            day,
            cities: &[],
            always_show: false,
            curated_media: &[],
        }
    }

    #[test]
    fn test_season_boundaries() {
        assert_eq!(Season::from_month(12), Season::Winter);
        assert_eq!(Season::from_month(2), Season::Winter);
        assert_eq!(Season::from_month(3), Season::Spring);
        assert_eq!(Season::from_month(8), Season::Summer);
        assert_eq!(Season::from_month(9), Season::Autumn);
        assert_eq!(Season::from_month(11), Season::Autumn);
    }

    #[test]
    fn test_window_around_target() {
        let spring_equinox = dated(3, 21);
        assert!(spring_equinox.is_active(date(2024, 2, 5), 45));
        assert!(!spring_equinox.is_active(date(2024, 5, 10), 45));
    }

    #[test]
    fn test_window_wraps_year_boundary() {
        let new_year = dated(1, 10);
        assert!(new_year.is_active(date(2023, 12, 20), 45));
        let late_december = dated(12, 20);
        assert!(late_december.is_active(date(2024, 1, 15), 45));
        assert!(!late_december.is_active(date(2024, 6, 15), 45));
    }

    #[test]
    fn test_always_show_ignores_window() {
        let nowruz = OCCASIONS.iter().find(|o| o.id == "nowruz").unwrap();
        assert!(nowruz.is_active(date(2024, 8, 1), 45));
    }

    #[test]
    fn test_active_occasions_in_autumn() {
        let ids: Vec<&str> = active_occasions(date(2024, 10, 15), 45)
            .iter()
            .map(|o| o.id)
            .collect();
        assert!(ids.contains(&"mehregan"));
        assert!(!ids.contains(&"sizdah_bedar"));
        assert!(ids.contains(&"yalda"));
    }

    #[test]
    fn test_go_now_follows_season() {
        assert!(WeatherSection::GoNow.cities(Season::Winter).contains(&"kish"));
        assert!(WeatherSection::GoNow.cities(Season::Summer).contains(&"ardabil"));
        assert_eq!(WeatherSection::SnowCold.cities(Season::Summer).len(), 5);
    }
}
