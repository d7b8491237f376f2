//! Relational store seam: the Postgres implementation used in production and an in-memory
//! one that enforces the same key and foreign-key rules.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::OnceLock;

use aqarc_core::{
    Country, CountryId, Location, LocationId, MeasurementRecord, NaturalKey, Parameter, ParameterId,
    Sensor, SensorId,
};
use async_trait::async_trait;
use regex::Regex;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgDatabaseError, PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// SQLSTATE for `foreign_key_violation`.
pub const FOREIGN_KEY_VIOLATION: &str = "23503";

/// Postgres caps a statement at 65535 bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;

/// Column names the measurement table uses for the sensor reference.
const SENSOR_COLUMNS: [&str; 2] = ["sensors_id", "sensor_id"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub column: String,
    pub value: String,
    pub constraint: Option<String>,
    pub detail: String,
}

impl ForeignKeyViolation {
    /// The offending sensor id, when the violated reference is the sensor column.
    pub fn sensor_id(&self) -> Option<SensorId> {
        if SENSOR_COLUMNS.contains(&self.column.as_str()) {
            self.value.parse().ok()
        } else {
            None
        }
    }

    pub fn for_sensor(sensor_id: SensorId) -> Self {
        Self {
            column: "sensors_id".to_string(),
            value: sensor_id.to_string(),
            constraint: Some("measurements_sensors_id_fkey".to_string()),
            detail: format!(
                "Key (sensors_id)=({sensor_id}) is not present in table \"sensors\"."
            ),
        }
    }

    pub fn for_location(location_id: LocationId) -> Self {
        Self {
            column: "location_id".to_string(),
            value: location_id.to_string(),
            constraint: Some("measurements_location_id_fkey".to_string()),
            detail: format!(
                "Key (location_id)=({location_id}) is not present in table \"locations\"."
            ),
        }
    }
}

impl fmt::Display for ForeignKeyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.column, self.value)?;
        if let Some(constraint) = &self.constraint {
            write!(f, " ({constraint})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("foreign key violation on {0}")]
    ForeignKey(ForeignKeyViolation),
    #[error("foreign key violation with unparseable detail: {0}")]
    UnparsedForeignKey(String),
    #[error("store query failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Parse Postgres' `Key (col)=(value) is not present in table "t".` detail line.
pub fn parse_foreign_key_detail(detail: &str) -> Option<(String, String)> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"Key \(([^)]+)\)=\(([^)]*)\)").ok())
        .as_ref()?;
    let captures = pattern.captures(detail)?;
    Some((captures[1].trim().to_string(), captures[2].trim().to_string()))
}

fn map_db_error(err: sqlx::Error) -> StoreError {
    let violation = match &err {
        sqlx::Error::Database(db_err)
            if db_err.code().as_deref() == Some(FOREIGN_KEY_VIOLATION) =>
        {
            let constraint = db_err.constraint().map(str::to_string);
            let detail = db_err
                .try_downcast_ref::<PgDatabaseError>()
                .and_then(|pg| pg.detail())
                .unwrap_or_else(|| db_err.message())
                .to_string();
            Some((detail, constraint))
        }
        _ => None,
    };

    match violation {
        Some((detail, constraint)) => match parse_foreign_key_detail(&detail) {
            Some((column, value)) => StoreError::ForeignKey(ForeignKeyViolation {
                column,
                value,
                constraint,
                detail,
            }),
            None => StoreError::UnparsedForeignKey(detail),
        },
        None => StoreError::Database(err),
    }
}

/// A stored location and whether any measurement references it.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationState {
    pub location: Location,
    pub ingested: bool,
}

#[async_trait]
pub trait IngestStore: Send + Sync {
    /// Insert every row, ignoring natural keys already present. All rows are applied or
    /// none are. Returns the number of newly inserted rows.
    async fn upsert_measurements(&self, rows: &[MeasurementRecord]) -> Result<u64, StoreError>;
    /// Every stored location ordered by id, with its ingested flag, in one round-trip.
    async fn location_states(&self) -> Result<Vec<LocationState>, StoreError>;
    async fn load_sensors(&self) -> Result<Vec<Sensor>, StoreError>;
    async fn known_parameter_ids(&self) -> Result<HashSet<ParameterId>, StoreError>;
    async fn upsert_parameters(&self, parameters: &[Parameter]) -> Result<u64, StoreError>;
    async fn upsert_countries(&self, countries: &[Country]) -> Result<u64, StoreError>;
    async fn upsert_locations(&self, locations: &[Location]) -> Result<u64, StoreError>;
    async fn upsert_sensors(&self, sensors: &[Sensor]) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Shared bulk insert: one transaction, chunked by the bind limit, conflicts ignored.
    async fn insert_chunked<T, F>(
        &self,
        head: &str,
        columns: usize,
        conflict: &str,
        items: &[T],
        mut bind: F,
    ) -> Result<u64, StoreError>
    where
        T: Sync,
        F: FnMut(sqlx::query_builder::Separated<'_, '_, Postgres, &'static str>, &T) + Send,
    {
        if items.is_empty() {
            return Ok(0);
        }
        let chunk_rows = (MAX_BIND_PARAMS / columns).max(1);
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for chunk in items.chunks(chunk_rows) {
            let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(head);
            builder.push_values(chunk, |b, item| bind(b, item));
            builder.push(conflict);
            let result = builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(map_db_error)?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }
}

#[async_trait]
impl IngestStore for PgStore {
    async fn upsert_measurements(&self, rows: &[MeasurementRecord]) -> Result<u64, StoreError> {
        let inserted = self
            .insert_chunked(
                "INSERT INTO measurements (location_id, sensors_id, observed_at, value) ",
                4,
                " ON CONFLICT (location_id, sensors_id, observed_at) DO NOTHING",
                rows,
                |mut b, row| {
                    b.push_bind(row.location_id)
                        .push_bind(row.sensor_id)
                        .push_bind(row.timestamp)
                        .push_bind(row.value);
                },
            )
            .await?;
        debug!(rows = rows.len(), inserted, "measurement upsert committed");
        Ok(inserted)
    }

    async fn location_states(&self) -> Result<Vec<LocationState>, StoreError> {
        let rows = sqlx::query(
            "SELECT l.location_id, l.location_name, l.latitude, l.longitude, \
                    l.first_date, l.last_date, l.country_id, \
                    EXISTS (SELECT 1 FROM measurements m WHERE m.location_id = l.location_id) \
                        AS ingested \
             FROM locations l ORDER BY l.location_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<LocationState, StoreError> {
                Ok(LocationState {
                    location: location_from_row(row)?,
                    ingested: row.try_get("ingested")?,
                })
            })
            .collect()
    }

    async fn load_sensors(&self) -> Result<Vec<Sensor>, StoreError> {
        let rows = sqlx::query(
            "SELECT s.sensor_id, s.parameter_id, p.parameter_name, p.units \
             FROM sensors s JOIN parameters p ON p.parameter_id = s.parameter_id \
             ORDER BY s.sensor_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<Sensor, StoreError> {
                Ok(Sensor {
                    id: row.try_get("sensor_id")?,
                    parameter_id: row.try_get("parameter_id")?,
                    parameter_name: row.try_get("parameter_name")?,
                    parameter_units: row
                        .try_get::<Option<String>, _>("units")?
                        .unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn known_parameter_ids(&self) -> Result<HashSet<ParameterId>, StoreError> {
        let ids: Vec<ParameterId> = sqlx::query_scalar("SELECT parameter_id FROM parameters")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().collect())
    }

    async fn upsert_parameters(&self, parameters: &[Parameter]) -> Result<u64, StoreError> {
        self.insert_chunked(
            "INSERT INTO parameters \
             (parameter_id, parameter_name, units, display_name, description) ",
            5,
            " ON CONFLICT (parameter_id) DO NOTHING",
            parameters,
            |mut b, p| {
                b.push_bind(p.id)
                    .push_bind(p.name.clone())
                    .push_bind(p.units.clone())
                    .push_bind(p.display_name.clone())
                    .push_bind(p.description.clone());
            },
        )
        .await
    }

    async fn upsert_countries(&self, countries: &[Country]) -> Result<u64, StoreError> {
        self.insert_chunked(
            "INSERT INTO countries \
             (country_id, country_code, country_name, first_date, last_date) ",
            5,
            " ON CONFLICT (country_id) DO NOTHING",
            countries,
            |mut b, c| {
                b.push_bind(c.id)
                    .push_bind(c.code.clone())
                    .push_bind(c.name.clone())
                    .push_bind(c.first_observed)
                    .push_bind(c.last_observed);
            },
        )
        .await
    }

    async fn upsert_locations(&self, locations: &[Location]) -> Result<u64, StoreError> {
        self.insert_chunked(
            "INSERT INTO locations \
             (location_id, location_name, latitude, longitude, first_date, last_date, country_id) ",
            7,
            " ON CONFLICT (location_id) DO NOTHING",
            locations,
            |mut b, l| {
                b.push_bind(l.id)
                    .push_bind(l.name.clone())
                    .push_bind(l.coordinates.map(|c| c.latitude))
                    .push_bind(l.coordinates.map(|c| c.longitude))
                    .push_bind(l.first_observed)
                    .push_bind(l.last_observed)
                    .push_bind(l.country_id);
            },
        )
        .await
    }

    async fn upsert_sensors(&self, sensors: &[Sensor]) -> Result<u64, StoreError> {
        self.insert_chunked(
            "INSERT INTO sensors (sensor_id, parameter_id) ",
            2,
            " ON CONFLICT (sensor_id) DO NOTHING",
            sensors,
            |mut b, s| {
                b.push_bind(s.id).push_bind(s.parameter_id);
            },
        )
        .await
    }
}

fn location_from_row(row: &PgRow) -> Result<Location, StoreError> {
    let latitude: Option<f64> = row.try_get("latitude")?;
    let longitude: Option<f64> = row.try_get("longitude")?;
    Ok(Location {
        id: row.try_get("location_id")?,
        name: row
            .try_get::<Option<String>, _>("location_name")?
            .unwrap_or_default(),
        coordinates: latitude
            .zip(longitude)
            .map(|(latitude, longitude)| aqarc_core::Coordinates {
                latitude,
                longitude,
            }),
        first_observed: row.try_get("first_date")?,
        last_observed: row.try_get("last_date")?,
        country_id: row.try_get("country_id")?,
    })
}

#[derive(Debug, Default)]
struct MemoryTables {
    parameters: BTreeMap<ParameterId, Parameter>,
    countries: BTreeMap<CountryId, Country>,
    locations: BTreeMap<LocationId, Location>,
    sensors: BTreeMap<SensorId, Sensor>,
    measurements: BTreeMap<NaturalKey, f64>,
    measurement_calls: usize,
}

/// In-process store with Postgres' key semantics: natural-key conflicts are ignored,
/// dangling references abort the whole call.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn measurement_count(&self) -> usize {
        self.tables.lock().await.measurements.len()
    }

    pub async fn measurements_for(&self, location_id: LocationId) -> Vec<(NaturalKey, f64)> {
        self.tables
            .lock()
            .await
            .measurements
            .iter()
            .filter(|(key, _)| key.location_id == location_id)
            .map(|(key, value)| (*key, *value))
            .collect()
    }

    /// Number of `upsert_measurements` calls, successful or not.
    pub async fn measurement_calls(&self) -> usize {
        self.tables.lock().await.measurement_calls
    }
}

#[async_trait]
impl IngestStore for MemoryStore {
    async fn upsert_measurements(&self, rows: &[MeasurementRecord]) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        tables.measurement_calls += 1;

        for row in rows {
            if !tables.locations.contains_key(&row.location_id) {
                let violation = ForeignKeyViolation::for_location(row.location_id);
                return Err(StoreError::ForeignKey(violation));
            }
            if !tables.sensors.contains_key(&row.sensor_id) {
                let violation = ForeignKeyViolation::for_sensor(row.sensor_id);
                return Err(StoreError::ForeignKey(violation));
            }
        }

        let mut inserted = 0u64;
        for row in rows {
            if let std::collections::btree_map::Entry::Vacant(slot) =
                tables.measurements.entry(row.natural_key())
            {
                slot.insert(row.value);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn location_states(&self) -> Result<Vec<LocationState>, StoreError> {
        let tables = self.tables.lock().await;
        let ingested: HashSet<LocationId> =
            tables.measurements.keys().map(|key| key.location_id).collect();
        Ok(tables
            .locations
            .values()
            .map(|location| LocationState {
                location: location.clone(),
                ingested: ingested.contains(&location.id),
            })
            .collect())
    }

    /// Name and units come from the parameters table, as the Postgres join does.
    async fn load_sensors(&self) -> Result<Vec<Sensor>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .sensors
            .values()
            .filter_map(|s| {
                let parameter = tables.parameters.get(&s.parameter_id)?;
                Some(Sensor {
                    parameter_name: parameter.name.clone(),
                    parameter_units: parameter.units.clone(),
                    ..s.clone()
                })
            })
            .collect())
    }

    async fn known_parameter_ids(&self) -> Result<HashSet<ParameterId>, StoreError> {
        Ok(self.tables.lock().await.parameters.keys().copied().collect())
    }

    async fn upsert_parameters(&self, parameters: &[Parameter]) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        Ok(insert_missing(&mut tables.parameters, parameters, |p| p.id))
    }

    async fn upsert_countries(&self, countries: &[Country]) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        Ok(insert_missing(&mut tables.countries, countries, |c| c.id))
    }

    async fn upsert_locations(&self, locations: &[Location]) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        if let Some(missing) = locations
            .iter()
            .filter_map(|l| l.country_id)
            .find(|id| !tables.countries.contains_key(id))
        {
            return Err(StoreError::ForeignKey(ForeignKeyViolation {
                column: "country_id".to_string(),
                value: missing.to_string(),
                constraint: Some("locations_country_id_fkey".to_string()),
                detail: format!(
                    "Key (country_id)=({missing}) is not present in table \"countries\"."
                ),
            }));
        }
        Ok(insert_missing(&mut tables.locations, locations, |l| l.id))
    }

    async fn upsert_sensors(&self, sensors: &[Sensor]) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        if let Some(missing) = sensors
            .iter()
            .map(|s| s.parameter_id)
            .find(|id| !tables.parameters.contains_key(id))
        {
            return Err(StoreError::ForeignKey(ForeignKeyViolation {
                column: "parameter_id".to_string(),
                value: missing.to_string(),
                constraint: Some("sensors_parameter_id_fkey".to_string()),
                detail: format!(
                    "Key (parameter_id)=({missing}) is not present in table \"parameters\"."
                ),
            }));
        }
        Ok(insert_missing(&mut tables.sensors, sensors, |s| s.id))
    }
}

fn insert_missing<K: Ord, T: Clone>(
    table: &mut BTreeMap<K, T>,
    items: &[T],
    key: impl Fn(&T) -> K,
) -> u64 {
    let mut inserted = 0u64;
    for item in items {
        if let std::collections::btree_map::Entry::Vacant(slot) = table.entry(key(item)) {
            slot.insert(item.clone());
            inserted += 1;
        }
    }
    inserted
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn parses_postgres_foreign_key_detail() {
        let detail = r#"Key (sensors_id)=(102) is not present in table "sensors"."#;
        assert_eq!(
            parse_foreign_key_detail(detail),
            Some(("sensors_id".to_string(), "102".to_string()))
        );
        assert_eq!(parse_foreign_key_detail("something else entirely"), None);
    }

    #[test]
    fn violation_exposes_sensor_only_for_sensor_columns() {
        assert_eq!(ForeignKeyViolation::for_sensor(102).sensor_id(), Some(102));
        assert_eq!(ForeignKeyViolation::for_location(5).sensor_id(), None);
        let garbage = ForeignKeyViolation {
            column: "sensors_id".into(),
            value: "abc".into(),
            constraint: None,
            detail: String::new(),
        };
        assert_eq!(garbage.sensor_id(), None);
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .upsert_parameters(&[Parameter {
                id: 2,
                name: "pm25".into(),
                units: "µg/m³".into(),
                display_name: None,
                description: None,
            }])
            .await
            .unwrap();
        store
            .upsert_sensors(&[Sensor {
                id: 101,
                parameter_id: 2,
                parameter_name: "pm25".into(),
                parameter_units: "µg/m³".into(),
            }])
            .await
            .unwrap();
        store
            .upsert_locations(&[Location {
                id: 5,
                name: "site".into(),
                coordinates: None,
                first_observed: None,
                last_observed: None,
                country_id: None,
            }])
            .await
            .unwrap();
        store
    }

    fn row(sensor_id: SensorId, hour: u32) -> MeasurementRecord {
        MeasurementRecord {
            location_id: 5,
            sensor_id,
            timestamp: Utc.with_ymd_and_hms(2020, 1, 1, hour, 0, 0).unwrap(),
            value: 1.5,
            parameter: "pm25".into(),
            units: "µg/m³".into(),
        }
    }

    #[tokio::test]
    async fn memory_store_ignores_existing_natural_keys() {
        let store = seeded().await;
        assert_eq!(store.upsert_measurements(&[row(101, 0), row(101, 1)]).await.unwrap(), 2);
        assert_eq!(store.upsert_measurements(&[row(101, 0), row(101, 1)]).await.unwrap(), 0);
        assert_eq!(store.measurement_count().await, 2);
    }

    #[tokio::test]
    async fn location_states_flag_ingested_locations() {
        let store = seeded().await;
        store
            .upsert_locations(&[Location {
                id: 6,
                name: "untouched".into(),
                coordinates: None,
                first_observed: None,
                last_observed: None,
                country_id: None,
            }])
            .await
            .unwrap();
        store.upsert_measurements(&[row(101, 0)]).await.unwrap();

        let states = store.location_states().await.unwrap();
        let flags: Vec<_> = states.iter().map(|s| (s.location.id, s.ingested)).collect();
        assert_eq!(flags, vec![(5, true), (6, false)]);
    }

    #[tokio::test]
    async fn loaded_sensors_carry_parameter_units() {
        let store = seeded().await;
        let sensors = store.load_sensors().await.unwrap();
        assert_eq!(sensors.len(), 1);
        assert_eq!(sensors[0].parameter_units, "µg/m³");
    }

    #[tokio::test]
    async fn memory_store_rejects_whole_call_on_dangling_sensor() {
        let store = seeded().await;
        let err = store
            .upsert_measurements(&[row(101, 0), row(102, 1)])
            .await
            .unwrap_err();
        match err {
            StoreError::ForeignKey(violation) => assert_eq!(violation.sensor_id(), Some(102)),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.measurement_count().await, 0);
        assert_eq!(store.measurement_calls().await, 1);
    }

    #[tokio::test]
    async fn sensors_require_known_parameters() {
        let store = seeded().await;
        let err = store
            .upsert_sensors(&[Sensor {
                id: 900,
                parameter_id: 99,
                parameter_name: "so2".into(),
                parameter_units: "ppb".into(),
            }])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ForeignKey(v) if v.column == "parameter_id"));
    }
}
