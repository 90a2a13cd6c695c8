use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::error::{CoverageError, LOCATIONS_REQUIRED, UpstreamError};
use crate::geo::{CoverageFeature, Point, synthetic_coverage};
use crate::ors::{IsochroneRequest, IsochroneSource, Profile};

pub const DEFAULT_MAX_LOCATIONS: usize = 60;
pub const DEFAULT_BATCH_SIZE: usize = 5;
pub const DEFAULT_RATE_LIMIT_BACKOFF: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy)]
pub struct CoverageLimits {
    pub max_locations: usize,
    pub batch_size: usize,
    pub rate_limit_backoff: Duration,
}

impl Default for CoverageLimits {
    fn default() -> Self {
        Self {
            max_locations: DEFAULT_MAX_LOCATIONS,
            batch_size: DEFAULT_BATCH_SIZE,
            rate_limit_backoff: DEFAULT_RATE_LIMIT_BACKOFF,
        }
    }
}

/// Per-request knobs coming from the query string.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoverageQuery {
    pub minutes: u32,
    pub profile: Profile,
    pub generalize: f64,
}

impl Default for CoverageQuery {
    fn default() -> Self {
        Self {
            minutes: 20,
            profile: Profile::DrivingCar,
            generalize: 30.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Feature {
    /// Passed through from the routing service untouched.
    Upstream(Value),
    Synthetic(CoverageFeature),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    kind: &'static str,
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn new(features: Vec<Feature>) -> Self {
        Self {
            kind: "FeatureCollection",
            features,
        }
    }

    pub fn synthetic(locations: &[Point], minutes: u32) -> Self {
        Self::new(
            synthetic_coverage(locations, minutes)
                .into_iter()
                .map(Feature::Synthetic)
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    Fulfilled { features: usize },
    FulfilledAfterRetry { features: usize },
    Dropped { error: UpstreamError },
}

impl BatchOutcome {
    pub fn is_dropped(&self) -> bool {
        matches!(self, BatchOutcome::Dropped { .. })
    }

    pub fn features(&self) -> usize {
        match self {
            BatchOutcome::Fulfilled { features }
            | BatchOutcome::FulfilledAfterRetry { features } => *features,
            BatchOutcome::Dropped { .. } => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverageSource {
    /// Every batch answered.
    Isochrones,
    /// Some batches were dropped but the rest produced features.
    Partial,
    /// Nothing came back; circles were synthesized.
    Synthetic,
}

impl CoverageSource {
    pub fn as_str(self) -> &'static str {
        match self {
            CoverageSource::Isochrones => "isochrones",
            CoverageSource::Partial => "partial",
            CoverageSource::Synthetic => "synthetic",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoverageOutcome {
    pub collection: FeatureCollection,
    pub batches: Vec<BatchOutcome>,
    pub source: CoverageSource,
    pub sampled: usize,
}

impl CoverageOutcome {
    pub fn dropped_batches(&self) -> usize {
        self.batches.iter().filter(|b| b.is_dropped()).count()
    }

    pub fn retried_batches(&self) -> usize {
        self.batches
            .iter()
            .filter(|b| matches!(b, BatchOutcome::FulfilledAfterRetry { .. }))
            .count()
    }

    pub fn upstream_features(&self) -> usize {
        self.batches.iter().map(BatchOutcome::features).sum()
    }
}

/// Reads `{"locations": [[lon, lat], ...]}`. A body that is not JSON at all maps to
/// `FallbackConstruction`.
pub fn parse_locations(body: &[u8]) -> Result<Vec<Point>, CoverageError> {
    let doc: Value =
        serde_json::from_slice(body).map_err(|_| CoverageError::FallbackConstruction)?;
    let Some(raw) = doc.get("locations").filter(|v| v.is_array()) else {
        return Err(CoverageError::invalid(LOCATIONS_REQUIRED));
    };
    serde_json::from_value(raw.clone())
        .map_err(|e| CoverageError::invalid(format!("invalid locations: {e}")))
}

/// Fixed-stride downsampling: output `i` is input `floor(i * n / max)`.
pub fn sample_locations(locations: &[Point], max: usize) -> Vec<Point> {
    if locations.len() <= max {
        return locations.to_vec();
    }
    let step = locations.len() as f64 / max as f64;
    (0..max)
        .map(|i| locations[(i as f64 * step).floor() as usize])
        .collect()
}

pub fn batch_locations(locations: &[Point], batch_size: usize) -> Vec<&[Point]> {
    locations.chunks(batch_size.max(1)).collect()
}

pub struct CoverageAggregator<S> {
    source: S,
    limits: CoverageLimits,
}

impl<S: IsochroneSource> CoverageAggregator<S> {
    pub fn new(source: S, limits: CoverageLimits) -> Self {
        Self { source, limits }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub async fn compute(&self, locations: &[Point], query: &CoverageQuery) -> CoverageOutcome {
        let sampled = sample_locations(locations, self.limits.max_locations);
        let range_seconds = u64::from(query.minutes) * 60;

        let mut features = Vec::new();
        let mut batches = Vec::new();
        for (idx, batch) in batch_locations(&sampled, self.limits.batch_size)
            .into_iter()
            .enumerate()
        {
            let request = IsochroneRequest {
                profile: query.profile,
                locations: batch.to_vec(),
                range_seconds,
                smoothing: query.generalize,
            };
            let outcome = match self.fetch_batch(&request).await {
                Ok((found, retried)) => {
                    let n = found.len();
                    tracing::debug!("batch {} returned {} features", idx, n);
                    features.extend(found.into_iter().map(Feature::Upstream));
                    if retried {
                        BatchOutcome::FulfilledAfterRetry { features: n }
                    } else {
                        BatchOutcome::Fulfilled { features: n }
                    }
                }
                Err(error) => {
                    tracing::warn!("batch {} skipped: {}", idx, error);
                    BatchOutcome::Dropped { error }
                }
            };
            batches.push(outcome);
        }

        let source = if sampled.is_empty() {
            CoverageSource::Isochrones
        } else if features.is_empty() {
            tracing::warn!(
                "isochrone service returned nothing for {} locations; using distance fallback",
                sampled.len()
            );
            features.extend(
                synthetic_coverage(&sampled, query.minutes)
                    .into_iter()
                    .map(Feature::Synthetic),
            );
            CoverageSource::Synthetic
        } else if batches.iter().any(BatchOutcome::is_dropped) {
            CoverageSource::Partial
        } else {
            CoverageSource::Isochrones
        };

        CoverageOutcome {
            collection: FeatureCollection::new(features),
            batches,
            source,
            sampled: sampled.len(),
        }
    }

    /// One request, plus exactly one retry after a 429. The bool is true when the retry was used.
    async fn fetch_batch(
        &self,
        request: &IsochroneRequest,
    ) -> Result<(Vec<Value>, bool), UpstreamError> {
        match self.source.isochrones(request).await {
            Ok(found) => Ok((found, false)),
            Err(e) if e.is_rate_limited() => {
                tracing::warn!(
                    "rate limited; retrying once in {}ms",
                    self.limits.rate_limit_backoff.as_millis()
                );
                tokio::time::sleep(self.limits.rate_limit_backoff).await;
                self.source.isochrones(request).await.map(|found| (found, true))
            }
            Err(e) => Err(e),
        }
    }
}
