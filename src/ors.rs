use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoverageError, UpstreamError};
use crate::geo::Point;

pub const DEFAULT_ORS_BASE_URL: &str = "https://api.openrouteservice.org";
pub const MISSING_API_KEY: &str = "ORS_API_KEY environment variable not configured";

/// Routing profiles accepted by the isochrones endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Profile {
    #[default]
    DrivingCar,
    DrivingHgv,
    CyclingRegular,
    CyclingRoad,
    CyclingMountain,
    CyclingElectric,
    FootWalking,
    FootHiking,
    Wheelchair,
}

impl Profile {
    pub fn as_str(self) -> &'static str {
        match self {
            Profile::DrivingCar => "driving-car",
            Profile::DrivingHgv => "driving-hgv",
            Profile::CyclingRegular => "cycling-regular",
            Profile::CyclingRoad => "cycling-road",
            Profile::CyclingMountain => "cycling-mountain",
            Profile::CyclingElectric => "cycling-electric",
            Profile::FootWalking => "foot-walking",
            Profile::FootHiking => "foot-hiking",
            Profile::Wheelchair => "wheelchair",
        }
    }
}

impl FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "driving-car" => Profile::DrivingCar,
            "driving-hgv" => Profile::DrivingHgv,
            "cycling-regular" => Profile::CyclingRegular,
            "cycling-road" => Profile::CyclingRoad,
            "cycling-mountain" => Profile::CyclingMountain,
            "cycling-electric" => Profile::CyclingElectric,
            "foot-walking" => Profile::FootWalking,
            "foot-hiking" => Profile::FootHiking,
            "wheelchair" => Profile::Wheelchair,
            other => return Err(format!("unknown routing profile: {other}")),
        })
    }
}

/// Unknown or missing profiles resolve to driving-car.
pub fn parse_profile(s: Option<&str>) -> Profile {
    let Some(s) = s else {
        return Profile::default();
    };
    s.parse().unwrap_or_else(|e: String| {
        tracing::debug!("{e}; using {}", Profile::default().as_str());
        Profile::default()
    })
}

/// One isochrone call: a batch of origins sharing a single time range.
#[derive(Debug, Clone, PartialEq)]
pub struct IsochroneRequest {
    pub profile: Profile,
    pub locations: Vec<Point>,
    pub range_seconds: u64,
    pub smoothing: f64,
}

#[derive(Debug, Serialize)]
struct IsochroneBody<'a> {
    locations: &'a [Point],
    range: [u64; 1],
    range_type: &'static str,
    attributes: [&'static str; 1],
    smoothing: f64,
}

impl IsochroneRequest {
    fn body(&self) -> IsochroneBody<'_> {
        IsochroneBody {
            locations: &self.locations,
            range: [self.range_seconds],
            range_type: "time",
            attributes: ["area"],
            smoothing: self.smoothing,
        }
    }
}

#[derive(Debug, Deserialize)]
struct IsochroneResponse {
    #[serde(default)]
    features: Option<Vec<Value>>,
}

/// Anything that can turn a batch of origins into isochrone features.
pub trait IsochroneSource: Send + Sync + 'static {
    /// Where requests go, for status output.
    fn upstream(&self) -> &str;

    fn isochrones(
        &self,
        request: &IsochroneRequest,
    ) -> impl Future<Output = Result<Vec<Value>, UpstreamError>> + Send;
}

#[derive(Debug, Clone)]
pub struct OrsSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub timeout: Duration,
}

/// OpenRouteService isochrones client.
#[derive(Clone)]
pub struct OrsClient {
    http: reqwest::Client,
    base_url: String,
    api_key: HeaderValue,
}

impl std::fmt::Debug for OrsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrsClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl OrsClient {
    pub fn new(settings: &OrsSettings) -> Result<Self, CoverageError> {
        let api_key = settings
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| CoverageError::Configuration(MISSING_API_KEY.to_string()))?;
        let mut api_key = HeaderValue::from_str(api_key).map_err(|_| {
            CoverageError::Configuration(
                "ORS_API_KEY contains characters not allowed in an HTTP header".to_string(),
            )
        })?;
        api_key.set_sensitive(true);

        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| CoverageError::Configuration(format!("build http client: {e}")))?;

        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn endpoint(&self, profile: Profile) -> String {
        format!("{}/v2/isochrones/{}", self.base_url, profile.as_str())
    }
}

impl IsochroneSource for OrsClient {
    fn upstream(&self) -> &str {
        &self.base_url
    }

    async fn isochrones(&self, request: &IsochroneRequest) -> Result<Vec<Value>, UpstreamError> {
        let url = self.endpoint(request.profile);
        let resp = self
            .http
            .post(&url)
            .header(AUTHORIZATION, self.api_key.clone())
            .json(&request.body())
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(UpstreamError::RateLimited);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body: truncate_for_log(&body),
            });
        }

        let parsed: IsochroneResponse = resp
            .json()
            .await
            .map_err(|e| UpstreamError::Decode(e.to_string()))?;
        Ok(parsed.features.unwrap_or_default())
    }
}

fn truncate_for_log(text: &str) -> String {
    let trimmed = text.trim();
    let max_len = 300usize;
    if trimmed.len() <= max_len {
        return trimmed.to_string();
    }
    let mut end = max_len;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}
