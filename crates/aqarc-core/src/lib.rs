//! Core domain model for AQARC: catalog entities, measurement batches and the
//! canonical sensor index used to repair archive-time sensor ids.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::RangeInclusive;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "aqarc-core";

pub type LocationId = i64;
pub type SensorId = i64;
pub type ParameterId = i64;
pub type CountryId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// Monitoring location as described by the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: LocationId,
    pub name: String,
    pub coordinates: Option<Coordinates>,
    /// `None` means the catalog does not know when coverage starts.
    pub first_observed: Option<DateTime<Utc>>,
    pub last_observed: Option<DateTime<Utc>>,
    pub country_id: Option<CountryId>,
}

impl Location {
    /// Inclusive range of archive years covered by this location, if both ends are known.
    pub fn coverage_years(&self) -> Option<RangeInclusive<i32>> {
        let first = self.first_observed?.year();
        let last = self.last_observed?.year();
        (first <= last).then_some(first..=last)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub id: ParameterId,
    pub name: String,
    pub units: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Country {
    pub id: CountryId,
    pub code: String,
    pub name: String,
    pub first_observed: Option<DateTime<Utc>>,
    pub last_observed: Option<DateTime<Utc>>,
}

/// A sensor is only meaningful through its parameter. Name and units travel with it because
/// archive rows identify the parameter by those two columns only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sensor {
    pub id: SensorId,
    pub parameter_id: ParameterId,
    pub parameter_name: String,
    pub parameter_units: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    pub location_id: LocationId,
    pub sensor_id: SensorId,
    pub timestamp: DateTime<Utc>,
}

/// One archived observation. `parameter` and `units` are recorded at archive-write time;
/// `units` may be empty when the archive file lacks the column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub location_id: LocationId,
    pub sensor_id: SensorId,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub parameter: String,
    pub units: String,
}

impl MeasurementRecord {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            location_id: self.location_id,
            sensor_id: self.sensor_id,
            timestamp: self.timestamp,
        }
    }
}

/// Ordered rows for one location, rewritten in place while conflicts are repaired.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordBatch {
    rows: Vec<MeasurementRecord>,
}

impl RecordBatch {
    pub fn new(rows: Vec<MeasurementRecord>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[MeasurementRecord] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn extend(&mut self, rows: impl IntoIterator<Item = MeasurementRecord>) {
        self.rows.extend(rows);
    }

    pub fn distinct_sensors(&self) -> BTreeSet<SensorId> {
        self.rows.iter().map(|r| r.sensor_id).collect()
    }

    /// Rewrite every row carrying `from` to the sensor `resolve` returns for it. Row order
    /// is kept. Returns the number of rewritten rows.
    ///
    /// Nothing is modified when `resolve` fails for any affected row.
    pub fn remap_sensor<E>(
        &mut self,
        from: SensorId,
        mut resolve: impl FnMut(&MeasurementRecord) -> Result<SensorId, E>,
    ) -> Result<usize, E> {
        let replacements = self
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.sensor_id == from)
            .map(|(position, row)| resolve(row).map(|sensor_id| (position, sensor_id)))
            .collect::<Result<Vec<_>, E>>()?;

        for (position, sensor_id) in &replacements {
            self.rows[*position].sensor_id = *sensor_id;
        }
        Ok(replacements.len())
    }

    /// Drop rows whose natural key already appeared earlier in the batch. Returns how many
    /// rows were removed.
    pub fn dedup_natural_keys(&mut self) -> usize {
        let before = self.rows.len();
        let mut seen = HashSet::with_capacity(before);
        self.rows.retain(|r| seen.insert(r.natural_key()));
        before - self.rows.len()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("no canonical sensor for parameter `{0}`")]
    UnknownParameter(String),
    #[error("parameter id {0} was never observed with any sensor")]
    UnknownParameterId(ParameterId),
}

/// Canonical spelling of a unit string: `µg/m³`, `μg/m³` and `ug/m3` compare equal.
pub fn normalize_units(units: &str) -> String {
    units
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            'µ' | 'μ' => 'u',
            '³' => '3',
            '²' => '2',
            other => other,
        })
        .flat_map(char::to_lowercase)
        .collect()
}

/// Parameter → canonical sensor mapping. The canonical sensor is the lowest sensor id seen
/// for a parameter, which makes the choice independent of catalog ordering.
///
/// Several parameters share a name and differ only in units (`no2` in ppm and in µg/m³),
/// so name lookups are keyed by name and normalized units together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CanonicalSensorIndex {
    by_parameter_id: HashMap<ParameterId, SensorId>,
    by_name_and_units: HashMap<(String, String), SensorId>,
    units_by_name: HashMap<String, BTreeSet<String>>,
}

impl CanonicalSensorIndex {
    pub fn build<'a>(sensors: impl IntoIterator<Item = &'a Sensor>) -> Self {
        let mut index = Self::default();
        for sensor in sensors {
            index
                .by_parameter_id
                .entry(sensor.parameter_id)
                .and_modify(|current| *current = (*current).min(sensor.id))
                .or_insert(sensor.id);

            let units = normalize_units(&sensor.parameter_units);
            index
                .units_by_name
                .entry(sensor.parameter_name.clone())
                .or_default()
                .insert(units.clone());
            index
                .by_name_and_units
                .entry((sensor.parameter_name.clone(), units))
                .and_modify(|current| *current = (*current).min(sensor.id))
                .or_insert(sensor.id);
        }
        index
    }

    /// Canonical sensor for a parameter as an archive row names it. Without units the name
    /// must be unambiguous; a name seen in several units is reported as unknown.
    pub fn canonical_sensor_for(
        &self,
        parameter: &str,
        units: &str,
    ) -> Result<SensorId, IndexError> {
        let wanted = normalize_units(units);
        let key_units = if wanted.is_empty() {
            match self.units_by_name.get(parameter) {
                Some(variants) if variants.len() == 1 => variants.iter().next().cloned(),
                _ => None,
            }
        } else {
            Some(wanted)
        };

        key_units
            .and_then(|key_units| {
                self.by_name_and_units
                    .get(&(parameter.to_string(), key_units))
                    .copied()
            })
            .ok_or_else(|| {
                let label = if units.trim().is_empty() {
                    parameter.to_string()
                } else {
                    format!("{parameter} [{}]", units.trim())
                };
                IndexError::UnknownParameter(label)
            })
    }

    pub fn canonical_sensor_for_id(
        &self,
        parameter_id: ParameterId,
    ) -> Result<SensorId, IndexError> {
        self.by_parameter_id
            .get(&parameter_id)
            .copied()
            .ok_or(IndexError::UnknownParameterId(parameter_id))
    }

    pub fn len(&self) -> usize {
        self.by_parameter_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_parameter_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sensor(id: SensorId, parameter_id: ParameterId, name: &str) -> Sensor {
        sensor_in(id, parameter_id, name, "")
    }

    fn sensor_in(id: SensorId, parameter_id: ParameterId, name: &str, units: &str) -> Sensor {
        Sensor {
            id,
            parameter_id,
            parameter_name: name.to_string(),
            parameter_units: units.to_string(),
        }
    }

    fn row(sensor_id: SensorId, hour: u32, parameter: &str) -> MeasurementRecord {
        MeasurementRecord {
            location_id: 5,
            sensor_id,
            timestamp: Utc.with_ymd_and_hms(2023, 1, 1, hour, 0, 0).unwrap(),
            value: 3.4,
            parameter: parameter.to_string(),
            units: String::new(),
        }
    }

    #[test]
    fn canonical_choice_ignores_input_order() {
        let sensors = vec![
            sensor(309, 2, "pm25"),
            sensor(101, 2, "pm25"),
            sensor(102, 2, "pm25"),
            sensor(44, 7, "no2"),
            sensor(12, 7, "no2"),
        ];
        let expected = CanonicalSensorIndex::build(&sensors);

        let mut reversed = sensors.clone();
        reversed.reverse();
        let mut rotated = sensors.clone();
        rotated.rotate_left(2);

        for variant in [reversed, rotated] {
            assert_eq!(CanonicalSensorIndex::build(&variant), expected);
        }
        assert_eq!(expected.canonical_sensor_for("pm25", ""), Ok(101));
        assert_eq!(expected.canonical_sensor_for_id(7), Ok(12));
        assert_eq!(expected.len(), 2);
    }

    #[test]
    fn same_name_in_different_units_keeps_separate_canonical_sensors() {
        let index = CanonicalSensorIndex::build(&[
            sensor_in(50, 7, "no2", "ppm"),
            sensor_in(60, 5, "no2", "µg/m³"),
            sensor_in(61, 5, "no2", "µg/m³"),
        ]);
        assert_eq!(index.canonical_sensor_for("no2", "µg/m³"), Ok(60));
        assert_eq!(index.canonical_sensor_for("no2", "ug/m3"), Ok(60));
        assert_eq!(index.canonical_sensor_for("no2", "PPM"), Ok(50));
        assert_eq!(index.canonical_sensor_for_id(5), Ok(60));
    }

    #[test]
    fn ambiguous_name_without_units_is_unknown() {
        let index = CanonicalSensorIndex::build(&[
            sensor_in(50, 7, "no2", "ppm"),
            sensor_in(60, 5, "no2", "µg/m³"),
            sensor_in(70, 2, "pm25", "µg/m³"),
        ]);
        assert_eq!(
            index.canonical_sensor_for("no2", ""),
            Err(IndexError::UnknownParameter("no2".to_string()))
        );
        assert_eq!(index.canonical_sensor_for("pm25", ""), Ok(70));
        assert_eq!(
            index.canonical_sensor_for("pm25", "ppm"),
            Err(IndexError::UnknownParameter("pm25 [ppm]".to_string()))
        );
    }

    #[test]
    fn every_observed_parameter_has_one_canonical_sensor() {
        let sensors = vec![sensor(3, 1, "o3"), sensor(9, 10, "o3"), sensor(4, 5, "co")];
        let index = CanonicalSensorIndex::build(&sensors);
        assert_eq!(index.canonical_sensor_for_id(1), Ok(3));
        assert_eq!(index.canonical_sensor_for_id(10), Ok(9));
        assert_eq!(index.canonical_sensor_for("o3", ""), Ok(3));
        assert_eq!(index.canonical_sensor_for("co", ""), Ok(4));
    }

    #[test]
    fn unknown_parameter_is_reported() {
        let index = CanonicalSensorIndex::build(&[sensor(1, 1, "pm10")]);
        assert_eq!(
            index.canonical_sensor_for("bc", ""),
            Err(IndexError::UnknownParameter("bc".to_string()))
        );
    }

    #[test]
    fn remap_rewrites_only_affected_rows() {
        let mut batch =
            RecordBatch::new(vec![row(102, 0, "pm25"), row(7, 1, "no2"), row(102, 2, "pm25")]);
        let rewritten = batch
            .remap_sensor(102, |r| match r.parameter.as_str() {
                "pm25" => Ok::<_, IndexError>(101),
                _ => Ok(0),
            })
            .unwrap();
        assert_eq!(rewritten, 2);
        let sensors: Vec<_> = batch.rows().iter().map(|r| r.sensor_id).collect();
        assert_eq!(sensors, vec![101, 7, 101]);
    }

    #[test]
    fn failed_remap_leaves_rows_in_place() {
        let original = vec![row(7, 0, "no2"), row(102, 1, "pm25"), row(7, 2, "no2")];
        let mut batch = RecordBatch::new(original.clone());
        let index = CanonicalSensorIndex::build(&[sensor(1, 1, "no2")]);
        let err = batch
            .remap_sensor(102, |r| index.canonical_sensor_for(&r.parameter, &r.units))
            .unwrap_err();
        assert_eq!(err, IndexError::UnknownParameter("pm25".to_string()));
        assert_eq!(batch.rows(), original.as_slice());
    }

    #[test]
    fn dedup_keeps_first_row_per_natural_key() {
        let mut first = row(101, 0, "pm25");
        first.value = 1.0;
        let mut second = row(101, 0, "pm25");
        second.value = 2.0;
        let mut batch = RecordBatch::new(vec![first, second, row(101, 1, "pm25")]);
        assert_eq!(batch.dedup_natural_keys(), 1);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.rows()[0].value, 1.0);
    }

    #[test]
    fn coverage_years_require_both_dates() {
        let mut location = Location {
            id: 5,
            name: "Station".into(),
            coordinates: None,
            first_observed: Some(Utc.with_ymd_and_hms(2019, 6, 1, 0, 0, 0).unwrap()),
            last_observed: Some(Utc.with_ymd_and_hms(2021, 2, 1, 0, 0, 0).unwrap()),
            country_id: Some(79),
        };
        assert_eq!(location.coverage_years(), Some(2019..=2021));
        location.last_observed = None;
        assert_eq!(location.coverage_years(), None);
    }
}
