//! Google Places (legacy JSON web service) transport.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use super::PlacesApi;
use crate::error::{FailureKind, ServiceError};
use crate::record::{Coordinates, IdentityHint, PlaceDetails, PlacePhoto};

const USER_AGENT: &str = concat!("farmsync/", env!("CARGO_PKG_VERSION"));
/// Default endpoint root for the places web service.
pub const DEFAULT_API_BASE: &str = "https://maps.googleapis.com/maps/api/place";
const DETAILS_FIELDS: &str =
    "formatted_address,formatted_phone_number,website,rating,user_ratings_total,geometry,types";

/// [`PlacesApi`] backed by the Google Places web service.
#[derive(Clone)]
pub struct GooglePlacesApi {
    client: Client,
    base: Url,
    api_key: String,
    search_radius_m: u32,
    photo_max_width: u32,
}

impl GooglePlacesApi {
    /// Builds a new transport. `api_base` must be an absolute URL.
    pub fn new(
        api_key: String,
        api_base: &str,
        timeout: Duration,
        search_radius_m: u32,
        photo_max_width: u32,
    ) -> Result<Self, ServiceError> {
        if api_key.trim().is_empty() {
            return Err(ServiceError::new(
                FailureKind::AuthDenied,
                "missing places API key",
            ));
        }
        let base = Url::parse(&format!("{}/", api_base.trim_end_matches('/'))).map_err(|err| {
            ServiceError::new(
                FailureKind::InvalidRequest,
                format!("invalid api base {api_base:?}: {err}"),
            )
        })?;
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|err| {
                ServiceError::new(
                    FailureKind::InvalidRequest,
                    format!("failed to build HTTP client: {err}"),
                )
            })?;
        Ok(Self {
            client,
            base,
            api_key: api_key.trim().to_string(),
            search_radius_m,
            photo_max_width,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ServiceError> {
        self.base.join(path).map_err(|err| {
            ServiceError::new(FailureKind::InvalidRequest, format!("bad endpoint {path}: {err}"))
        })
    }

    /// URL the display layer can fetch directly for a photo reference.
    pub fn photo_url(&self, photo_reference: &str) -> Result<String, ServiceError> {
        let mut url = self.endpoint("photo")?;
        url.query_pairs_mut()
            .append_pair("maxwidth", &self.photo_max_width.to_string())
            .append_pair("photoreference", photo_reference)
            .append_pair("key", &self.api_key);
        Ok(url.into())
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Envelope<T>, ServiceError> {
        let mut url = self.endpoint(path)?;
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in params {
                pairs.append_pair(key, value);
            }
            pairs.append_pair("key", &self.api_key);
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(classify_transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(ServiceError::new(
                classify_status(status),
                format!("{path} returned {status}: {}", truncate(&body, 200)),
            ));
        }
        response.json::<Envelope<T>>().await.map_err(|err| {
            ServiceError::new(
                FailureKind::MalformedResponse,
                format!("{path} body could not be decoded: {err}"),
            )
        })
    }
}

#[async_trait]
impl PlacesApi for GooglePlacesApi {
    async fn resolve_place(&self, hint: &IdentityHint) -> Result<String, ServiceError> {
        let mut params = vec![("query", hint.query())];
        if let Some(location) = &hint.location {
            params.push(("location", format!("{},{}", location.lat, location.lng)));
            params.push(("radius", self.search_radius_m.to_string()));
        }
        let envelope: Envelope<Vec<SearchResult>> =
            self.get_json("textsearch/json", &params).await?;
        envelope
            .into_payload("textsearch")?
            .into_iter()
            .find_map(|result| result.place_id.filter(|id| !id.trim().is_empty()))
            .ok_or_else(|| ServiceError::not_found(format!("no match for {:?}", hint.query())))
    }

    async fn fetch_details(&self, external_ref: &str) -> Result<PlaceDetails, ServiceError> {
        let params = [
            ("place_id", external_ref.to_string()),
            ("fields", DETAILS_FIELDS.to_string()),
        ];
        let envelope: Envelope<DetailsResult> = self.get_json("details/json", &params).await?;
        let result = envelope.into_payload("details")?;
        Ok(PlaceDetails {
            address: result.formatted_address.unwrap_or_default(),
            phone: result.formatted_phone_number.filter(|v| !v.is_empty()),
            website: result.website.filter(|v| !v.is_empty()),
            rating: result.rating,
            user_ratings_total: result.user_ratings_total,
            location: result
                .geometry
                .map(|g| Coordinates::new(g.location.lat, g.location.lng)),
            place_types: result.types,
        })
    }

    async fn fetch_photos(&self, external_ref: &str) -> Result<Vec<PlacePhoto>, ServiceError> {
        let params = [
            ("place_id", external_ref.to_string()),
            ("fields", "photos".to_string()),
        ];
        let envelope: Envelope<PhotosResult> = self.get_json("details/json", &params).await?;
        let result = envelope.into_payload("photos")?;
        let mut photos = Vec::with_capacity(result.photos.len());
        for photo in result.photos {
            let Some(reference) = photo.photo_reference.filter(|r| !r.is_empty()) else {
                continue;
            };
            photos.push(PlacePhoto::new(
                self.photo_url(&reference)?,
                photo.width,
                photo.height,
            ));
        }
        Ok(photos)
    }
}

/// Body wrapper shared by every legacy places endpoint.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(alias = "results")]
    result: Option<T>,
}

impl<T> Envelope<T> {
    fn into_payload(self, call: &str) -> Result<T, ServiceError> {
        if self.status != "OK" {
            let kind = classify_api_status(&self.status);
            let detail = self.error_message.unwrap_or_default();
            return Err(ServiceError::new(
                kind,
                format!("{call} status {}: {detail}", self.status)
                    .trim_end_matches(": ")
                    .to_string(),
            ));
        }
        self.result.ok_or_else(|| {
            ServiceError::new(
                FailureKind::MalformedResponse,
                format!("{call} returned OK without a result"),
            )
        })
    }
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    place_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DetailsResult {
    #[serde(default)]
    formatted_address: Option<String>,
    #[serde(default)]
    formatted_phone_number: Option<String>,
    #[serde(default)]
    website: Option<String>,
    #[serde(default)]
    rating: Option<f64>,
    #[serde(default)]
    user_ratings_total: Option<u32>,
    #[serde(default)]
    geometry: Option<Geometry>,
    #[serde(default)]
    types: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    location: LatLng,
}

#[derive(Debug, Deserialize)]
struct LatLng {
    lat: f64,
    lng: f64,
}

#[derive(Debug, Deserialize)]
struct PhotosResult {
    #[serde(default)]
    photos: Vec<PhotoEntry>,
}

#[derive(Debug, Deserialize)]
struct PhotoEntry {
    #[serde(default)]
    photo_reference: Option<String>,
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
}

fn classify_api_status(status: &str) -> FailureKind {
    match status {
        "ZERO_RESULTS" | "NOT_FOUND" => FailureKind::NotFound,
        "INVALID_REQUEST" => FailureKind::InvalidRequest,
        "REQUEST_DENIED" => FailureKind::AuthDenied,
        "OVER_QUERY_LIMIT" => FailureKind::RateLimited,
        "UNKNOWN_ERROR" => FailureKind::Unavailable,
        _ => FailureKind::MalformedResponse,
    }
}

fn classify_status(status: StatusCode) -> FailureKind {
    match status {
        StatusCode::TOO_MANY_REQUESTS => FailureKind::RateLimited,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FailureKind::AuthDenied,
        StatusCode::NOT_FOUND => FailureKind::NotFound,
        StatusCode::REQUEST_TIMEOUT => FailureKind::Timeout,
        s if s.is_server_error() => FailureKind::Unavailable,
        _ => FailureKind::InvalidRequest,
    }
}

fn classify_transport_error(err: reqwest::Error) -> ServiceError {
    let kind = if err.is_timeout() {
        FailureKind::Timeout
    } else if err.is_builder() {
        FailureKind::InvalidRequest
    } else {
        FailureKind::Unavailable
    };
    ServiceError::new(kind, format!("http error: {err}"))
}

fn truncate(body: &str, max_chars: usize) -> &str {
    match body.char_indices().nth(max_chars) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
