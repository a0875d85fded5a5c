//! Persisted dataset rows and the facet payloads merged into them.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Latitude/longitude pair in WGS84 degrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    /// Latitude.
    pub lat: f64,
    /// Longitude.
    pub lng: f64,
    /// Postcode, county and similar keys written by the import.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Coordinates {
    /// Creates a coordinate pair.
    pub fn new(lat: f64, lng: f64) -> Self {
        Self {
            lat,
            lng,
            extra: BTreeMap::new(),
        }
    }
}

/// Contact channels for a listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactInfo {
    /// Phone number as reported by the directory.
    #[serde(default)]
    pub phone: Option<String>,
    /// Website URL.
    #[serde(default)]
    pub website: Option<String>,
    /// Email address; only ever written by other sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Social handles and other channels owned by other tools.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Per-facet refresh timestamps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetTimestamps {
    /// Last successful details merge.
    #[serde(default)]
    pub data_updated_at: Option<DateTime<Utc>>,
    /// Last successful images merge.
    #[serde(default)]
    pub images_updated_at: Option<DateTime<Utc>>,
}

/// One farm shop listing in the persisted dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessRecord {
    /// Stable local identifier and merge join key.
    pub id: String,
    /// Display name, also the primary identity hint.
    pub name: String,
    /// Coordinates; immutable once set.
    #[serde(default)]
    pub location: Option<Coordinates>,
    /// Formatted postal address.
    #[serde(default)]
    pub address: String,
    /// Phone/website/email.
    #[serde(default)]
    pub contact_info: ContactInfo,
    /// Directory rating (1-5).
    #[serde(default)]
    pub rating: Option<f64>,
    /// Number of reviews behind `rating`.
    #[serde(default)]
    pub user_ratings_total: Option<u32>,
    /// Directory categories.
    #[serde(default)]
    pub place_types: Vec<String>,
    /// Ranked, deduplicated image URLs.
    #[serde(default)]
    pub images: Vec<String>,
    /// Cached directory identifier.
    #[serde(default)]
    pub external_ref: Option<String>,
    /// Facet refresh timestamps.
    #[serde(default)]
    pub last_updated: FacetTimestamps,
    /// Keys owned by other tools, carried through untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl BusinessRecord {
    /// Creates a bare record as an upstream import would.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            location: None,
            address: String::new(),
            contact_info: ContactInfo::default(),
            rating: None,
            user_ratings_total: None,
            place_types: Vec::new(),
            images: Vec::new(),
            external_ref: None,
            last_updated: FacetTimestamps::default(),
            extra: BTreeMap::new(),
        }
    }

    /// Builder-style helper for setting coordinates.
    pub fn with_location(mut self, lat: f64, lng: f64) -> Self {
        self.location = Some(Coordinates::new(lat, lng));
        self
    }

    /// Builder-style helper for pre-seeding a cached reference.
    pub fn with_external_ref(mut self, external_ref: impl Into<String>) -> Self {
        self.external_ref = Some(external_ref.into());
        self
    }

    /// Whether `images` already holds at most `max_images` distinct,
    /// non-empty URLs.
    pub fn images_within(&self, max_images: usize) -> bool {
        let mut seen = HashSet::with_capacity(self.images.len());
        self.images.len() <= max_images
            && self
                .images
                .iter()
                .all(|url| !url.trim().is_empty() && seen.insert(url.as_str()))
    }

    /// Drops empty and repeated URLs, keeps the first `max_images`, and
    /// reports whether anything changed.
    pub fn clamp_images(&mut self, max_images: usize) -> bool {
        if self.images_within(max_images) {
            return false;
        }
        let mut seen = HashSet::with_capacity(self.images.len());
        self.images.retain(|url| !url.trim().is_empty() && seen.insert(url.clone()));
        self.images.truncate(max_images);
        true
    }

    /// Identity hint handed to place resolution.
    pub fn identity_hint(&self) -> IdentityHint {
        IdentityHint {
            name: self.name.clone(),
            address: (!self.address.trim().is_empty()).then(|| self.address.clone()),
            location: self.location.clone(),
        }
    }
}

/// Name plus approximate position used to find a listing in the directory.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityHint {
    /// Business name.
    pub name: String,
    /// Known address, if any.
    pub address: Option<String>,
    /// Approximate coordinates used as a location bias.
    pub location: Option<Coordinates>,
}

impl IdentityHint {
    /// Free-text query string: name followed by the address when known.
    pub fn query(&self) -> String {
        match &self.address {
            Some(address) => format!("{} {}", self.name.trim(), address.trim()),
            None => self.name.trim().to_string(),
        }
    }
}

/// Payload of a successful details fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaceDetails {
    /// Formatted address.
    pub address: String,
    /// Formatted phone number.
    pub phone: Option<String>,
    /// Website URL.
    pub website: Option<String>,
    /// Rating.
    pub rating: Option<f64>,
    /// Review count.
    pub user_ratings_total: Option<u32>,
    /// Directory-reported coordinates.
    pub location: Option<Coordinates>,
    /// Directory categories.
    pub place_types: Vec<String>,
}

/// A photo reference reported by the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacePhoto {
    /// Externally resolvable image URL.
    pub url: String,
    /// Reported pixel width.
    pub width: u32,
    /// Reported pixel height.
    pub height: u32,
}

impl PlacePhoto {
    /// Creates a photo reference.
    pub fn new(url: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            url: url.into(),
            width,
            height,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn unknown_keys_survive_round_trip() {
        let raw = r#"{
            "id": "farm_a",
            "name": "Green Farm",
            "slug": "green-farm",
            "offerings": ["eggs"],
            "contactInfo": {"phone": null, "website": null, "email": "shop@example.com"}
        }"#;
        let record: BusinessRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(record.extra.get("slug").unwrap(), "green-farm");
        assert_eq!(
            record.contact_info.email.as_deref(),
            Some("shop@example.com")
        );

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["slug"], "green-farm");
        assert_eq!(value["offerings"][0], "eggs");
        assert_eq!(value["externalRef"], serde_json::Value::Null);
        assert_eq!(value["lastUpdated"]["imagesUpdatedAt"], serde_json::Value::Null);
    }

    #[test]
    fn nested_unknown_keys_survive_round_trip() {
        let raw = r#"{
            "id": "farm_a",
            "name": "Green Farm",
            "location": {"lat": 51.5, "lng": -0.1, "postcode": "AB1 2CD", "city": "Town"},
            "contactInfo": {"phone": "01234", "website": null, "instagram": "@green"}
        }"#;
        let record: BusinessRecord = serde_json::from_str(raw).unwrap();
        let location = record.location.as_ref().unwrap();
        assert_eq!(location.lat, 51.5);
        assert_eq!(location.extra.get("postcode").unwrap(), "AB1 2CD");

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["location"]["city"], "Town");
        assert_eq!(value["location"]["lng"], -0.1);
        assert_eq!(value["contactInfo"]["instagram"], "@green");
        assert_eq!(value["contactInfo"]["phone"], "01234");
    }

    #[test]
    fn image_bound_detects_excess_and_duplicates() {
        let mut record = BusinessRecord::new("r1", "Green Farm");
        record.images = vec!["a".into(), "b".into(), "c".into()];
        assert!(record.images_within(3));
        assert!(!record.images_within(2));

        record.images = vec!["a".into(), "".into(), "b".into(), "a".into(), "c".into(), "d".into()];
        assert!(!record.images_within(10));
        assert!(record.clamp_images(3));
        assert_eq!(record.images, vec!["a", "b", "c"]);
        assert!(!record.clamp_images(3));
    }

    #[test]
    fn identity_hint_prefers_address_when_known() {
        let mut record = BusinessRecord::new("r1", "Green Farm").with_location(51.5, -0.1);
        assert_eq!(record.identity_hint().query(), "Green Farm");
        record.address = "1 Lane, Town".to_string();
        let hint = record.identity_hint();
        assert_eq!(hint.query(), "Green Farm 1 Lane, Town");
        assert_eq!(hint.location, Some(Coordinates::new(51.5, -0.1)));
    }
}
