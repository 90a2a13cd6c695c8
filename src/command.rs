use std::io::Write;

use anyhow::{Context, bail};
use tokio::io::AsyncReadExt;

use crate::cli::CoverageArgs;
use crate::coverage::{
    CoverageAggregator, CoverageLimits, CoverageQuery, FeatureCollection, parse_locations,
    sample_locations,
};
use crate::geo::Point;
use crate::ors::{IsochroneSource, OrsClient, parse_profile};

pub async fn run(opts: CoverageArgs) -> anyhow::Result<()> {
    if !opts.generalize.is_finite() {
        bail!("--generalize must be a finite number");
    }
    let query = CoverageQuery {
        minutes: opts.minutes,
        profile: parse_profile(Some(&opts.profile)),
        generalize: opts.generalize,
    };
    let limits = opts.limits.limits();

    let raw = read_input(opts.input.as_deref()).await?;
    let locations = parse_locations(&raw).context("parse locations document")?;
    tracing::info!(
        "{} locations, {} min, profile={}",
        locations.len(),
        query.minutes,
        query.profile.as_str()
    );

    let source = if opts.offline {
        None
    } else {
        Some(OrsClient::new(&opts.upstream.settings())?)
    };
    let collection = build_collection(&locations, &query, limits, source).await;

    let out = if opts.pretty {
        serde_json::to_vec_pretty(&collection)?
    } else {
        serde_json::to_vec(&collection)?
    };
    match &opts.output {
        Some(path) => {
            std::fs::write(path, &out).with_context(|| format!("write {}", path.display()))?;
            tracing::info!(
                "Wrote {} features to {}",
                collection.features.len(),
                path.display()
            );
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&out)?;
            stdout.write_all(b"\n")?;
        }
    }
    Ok(())
}

async fn read_input(path: Option<&std::path::Path>) -> anyhow::Result<Vec<u8>> {
    match path {
        Some(p) => tokio::fs::read(p)
            .await
            .with_context(|| format!("read {}", p.display())),
        None => {
            let mut buf = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut buf)
                .await
                .context("read stdin")?;
            Ok(buf)
        }
    }
}

/// Without a source this is the offline path: circles around the sampled points.
async fn build_collection<S: IsochroneSource>(
    locations: &[Point],
    query: &CoverageQuery,
    limits: CoverageLimits,
    source: Option<S>,
) -> FeatureCollection {
    let Some(source) = source else {
        let sampled = sample_locations(locations, limits.max_locations);
        return FeatureCollection::synthetic(&sampled, query.minutes);
    };

    let outcome = CoverageAggregator::new(source, limits)
        .compute(locations, query)
        .await;
    tracing::info!(
        "{} batches, {} dropped, source={}",
        outcome.batches.len(),
        outcome.dropped_batches(),
        outcome.source.as_str()
    );
    outcome.collection
}
