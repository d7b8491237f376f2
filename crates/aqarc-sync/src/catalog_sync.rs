//! Mirror the catalog's reference tables into the store.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use aqarc_catalog::CatalogClient;
use aqarc_core::{CountryId, Sensor, SensorId};
use futures::TryStreamExt;
use serde::Serialize;
use tracing::{info, warn};

use crate::store::IngestStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatalogSyncSummary {
    pub parameters: u64,
    pub countries: u64,
    pub locations: u64,
    pub sensors: u64,
    pub dropped_sensors: usize,
}

/// Fetch parameters, countries, locations and sensors and insert the ones the store does
/// not have yet, parents first.
pub async fn sync_catalog(
    client: &CatalogClient,
    store: &dyn IngestStore,
    country_codes: &[String],
    page_size: u32,
) -> Result<CatalogSyncSummary> {
    let mut summary = CatalogSyncSummary::default();

    let parameters: Vec<_> = client
        .list_parameters(page_size)
        .try_collect()
        .await
        .context("listing parameters")?;
    summary.parameters = store
        .upsert_parameters(&parameters)
        .await
        .context("storing parameters")?;

    let countries: Vec<_> = client
        .list_countries(page_size)
        .try_collect::<Vec<_>>()
        .await
        .context("listing countries")?
        .into_iter()
        .filter(|c| {
            country_codes.is_empty()
                || country_codes.iter().any(|code| code.eq_ignore_ascii_case(&c.code))
        })
        .collect();
    if countries.is_empty() {
        warn!(?country_codes, "no catalog countries match the configured filter");
        return Ok(summary);
    }
    summary.countries = store
        .upsert_countries(&countries)
        .await
        .context("storing countries")?;

    let country_ids: Vec<CountryId> = if country_codes.is_empty() {
        Vec::new()
    } else {
        countries.iter().map(|c| c.id).collect()
    };
    let details: Vec<_> = client
        .list_location_details(&country_ids, page_size)
        .try_collect()
        .await
        .context("listing locations")?;

    let known_countries: Vec<CountryId> = countries.iter().map(|c| c.id).collect();
    let mut locations = Vec::with_capacity(details.len());
    let mut sensors: BTreeMap<SensorId, Sensor> = BTreeMap::new();
    for detail in details {
        let mut location = detail.location;
        if let Some(country_id) = location.country_id {
            if !known_countries.contains(&country_id) {
                warn!(
                    location_id = location.id,
                    country_id,
                    "location country not stored; dropping reference"
                );
                location.country_id = None;
            }
        }
        for sensor in detail.sensors {
            sensors.entry(sensor.id).or_insert(sensor);
        }
        locations.push(location);
    }
    summary.locations = store
        .upsert_locations(&locations)
        .await
        .context("storing locations")?;

    let known_parameters = store
        .known_parameter_ids()
        .await
        .context("loading stored parameters")?;
    let (keep, dropped): (Vec<Sensor>, Vec<Sensor>) = sensors
        .into_values()
        .partition(|s| known_parameters.contains(&s.parameter_id));
    for sensor in &dropped {
        warn!(
            sensor_id = sensor.id,
            parameter_id = sensor.parameter_id,
            parameter = %sensor.parameter_name,
            "sensor references an unknown parameter; skipping"
        );
    }
    summary.dropped_sensors = dropped.len();
    summary.sensors = store.upsert_sensors(&keep).await.context("storing sensors")?;

    info!(
        parameters = summary.parameters,
        countries = summary.countries,
        locations = summary.locations,
        sensors = summary.sensors,
        dropped_sensors = summary.dropped_sensors,
        "catalog sync complete"
    );
    Ok(summary)
}
