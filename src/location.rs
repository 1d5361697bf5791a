//! City resolution for the nearest-by-city strategy.

use serde::Serialize;

use crate::catalog::CityRecord;
use crate::error::{Error, Result};

/// How the target city was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CitySource {
    Override,
    Ip,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CityResolution {
    pub city: CityRecord,
    pub source: CitySource,
}

/// Pick the target city.
///
/// An explicit `preferred` id or name (case-insensitive) wins; otherwise the
/// client IP is matched against `ip_prefixes` (`(prefix, city_id)` pairs,
/// longest prefix first). Anything else is `CityUnresolved`.
pub fn resolve_city(
    cities: &[CityRecord],
    preferred: Option<&str>,
    client_ip: Option<&str>,
    ip_prefixes: &[(String, String)],
) -> Result<CityResolution> {
    if let Some(wanted) = preferred.map(str::trim).filter(|s| !s.is_empty()) {
        if let Some(city) = find_city(cities, wanted) {
            return Ok(CityResolution {
                city: city.clone(),
                source: CitySource::Override,
            });
        }
        tracing::debug!("Preferred city '{}' not in catalog, trying IP", wanted);
    }

    let client_ip = client_ip.map(str::trim).filter(|s| !s.is_empty());
    if let Some(ip) = client_ip {
        let matched = ip_prefixes
            .iter()
            .filter(|(prefix, _)| ip.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len());
        if let Some(city) = matched.and_then(|(_, city_id)| find_city(cities, city_id)) {
            return Ok(CityResolution {
                city: city.clone(),
                source: CitySource::Ip,
            });
        }
    }

    Err(Error::CityUnresolved {
        client_ip: client_ip.map(str::to_string),
    })
}

fn find_city<'a>(cities: &'a [CityRecord], wanted: &str) -> Option<&'a CityRecord> {
    cities.iter().find(|city| {
        city.city_id.eq_ignore_ascii_case(wanted) || city.city_name.to_lowercase() == wanted.to_lowercase()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cities() -> Vec<CityRecord> {
        vec![
            CityRecord {
                city_id: "tehran".into(),
                city_name: "Tehran".into(),
                coordinates: [35.69, 51.39],
            },
            CityRecord {
                city_id: "shiraz".into(),
                city_name: "Shiraz".into(),
                coordinates: [29.59, 52.58],
            },
        ]
    }

    fn prefixes() -> Vec<(String, String)> {
        vec![
            ("5.".into(), "tehran".into()),
            ("5.160.".into(), "shiraz".into()),
        ]
    }

    #[test]
    fn test_override_by_id_or_name() {
        let r = resolve_city(&cities(), Some("SHIRAZ"), None, &[]).unwrap();
        assert_eq!(r.city.city_id, "shiraz");
        assert_eq!(r.source, CitySource::Override);
    }

    #[test]
    fn test_ip_uses_longest_prefix() {
        let r = resolve_city(&cities(), None, Some("5.160.1.2"), &prefixes()).unwrap();
        assert_eq!(r.city.city_id, "shiraz");
        assert_eq!(r.source, CitySource::Ip);

        let r = resolve_city(&cities(), None, Some("5.1.1.1"), &prefixes()).unwrap();
        assert_eq!(r.city.city_id, "tehran");
    }

    #[test]
    fn test_unknown_override_falls_through_to_ip() {
        let r = resolve_city(&cities(), Some("atlantis"), Some("5.9.9.9"), &prefixes()).unwrap();
        assert_eq!(r.city.city_id, "tehran");
    }

    #[test]
    fn test_unresolved_carries_ip() {
        let err = resolve_city(&cities(), None, Some("10.0.0.1"), &prefixes()).unwrap_err();
        match err {
            Error::CityUnresolved { client_ip } => assert_eq!(client_ip.as_deref(), Some("10.0.0.1")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
