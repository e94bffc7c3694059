//! # Telemetry Record Model
//!
//! Sensor nodes publish loosely shaped JSON. Inside the engine every message is
//! a `TelemetryRecord` with a fixed set of known fields, each metric explicitly
//! optional, plus a bag of any other scalar fields the node chose to send.
//!
//! Records are shared between buffers as `Arc<TelemetryRecord>` and are never
//! mutated after the gateway stamps them.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::utils::timefmt::{parse_day_of_year_stamp, rfc3339_millis};

/// Wire name of the origin identity.
pub const FIELD_ORIGIN: &str = "ID";
/// Wire name of the sensor-reported timestamp.
pub const FIELD_SENSOR_TIME: &str = "Tiempo_UTC";
/// Wire name of the free-text node location.
pub const FIELD_LOCATION: &str = "Location";
/// Wire name of the node self-reported status.
pub const FIELD_STATUS: &str = "Status";
/// Column name of the gateway arrival timestamp.
pub const FIELD_RECEIVED_AT: &str = "received_at";

/// # Metric
///
/// The environmental quantities a node may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Metric {
    /// Air temperature, °C (`Temp_C`).
    TempC,
    /// Relative humidity, % (`Humidity_Per`).
    HumidityPer,
    /// UV index (`UVI`).
    Uvi,
    /// Atmospheric pressure, hPa (`Pressure_hPa`).
    PressureHpa,
    /// Carbon monoxide, ppm (`CO_ppm`).
    CoPpm,
    /// Carbon dioxide, ppm (`CO2_ppm`).
    Co2Ppm,
}

impl Metric {
    /// Every metric, in column order.
    pub const ALL: [Metric; 6] = [
        Metric::TempC,
        Metric::HumidityPer,
        Metric::Uvi,
        Metric::PressureHpa,
        Metric::CoPpm,
        Metric::Co2Ppm,
    ];

    /// The metrics charted for the home sensor.
    pub const CHARTED: [Metric; 4] = [
        Metric::TempC,
        Metric::HumidityPer,
        Metric::Uvi,
        Metric::PressureHpa,
    ];

    /// Field name on the wire.
    pub fn wire_name(self) -> &'static str {
        match self {
            Metric::TempC => "Temp_C",
            Metric::HumidityPer => "Humidity_Per",
            Metric::Uvi => "UVI",
            Metric::PressureHpa => "Pressure_hPa",
            Metric::CoPpm => "CO_ppm",
            Metric::Co2Ppm => "CO2_ppm",
        }
    }

    /// Human readable label.
    pub fn label(self) -> &'static str {
        match self {
            Metric::TempC => "Temperature",
            Metric::HumidityPer => "Humidity",
            Metric::Uvi => "UV index",
            Metric::PressureHpa => "Atmospheric pressure",
            Metric::CoPpm => "Carbon monoxide",
            Metric::Co2Ppm => "Carbon dioxide",
        }
    }

    /// Display unit.
    pub fn unit(self) -> &'static str {
        match self {
            Metric::TempC => "°C",
            Metric::HumidityPer => "%",
            Metric::Uvi => "index",
            Metric::PressureHpa => "hPa",
            Metric::CoPpm | Metric::Co2Ppm => "ppm",
        }
    }

    /// Looks a metric up by its wire name.
    pub fn from_wire(name: &str) -> Option<Metric> {
        Metric::ALL.into_iter().find(|m| m.wire_name() == name)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl Serialize for Metric {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.wire_name())
    }
}

/// # Readings
///
/// One optional slot per metric. Absence is explicit: a heartbeat record has
/// every slot empty.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Readings {
    temp_c: Option<f64>,
    humidity_per: Option<f64>,
    uvi: Option<f64>,
    pressure_hpa: Option<f64>,
    co_ppm: Option<f64>,
    co2_ppm: Option<f64>,
}

impl Readings {
    fn slot(&self, metric: Metric) -> &Option<f64> {
        match metric {
            Metric::TempC => &self.temp_c,
            Metric::HumidityPer => &self.humidity_per,
            Metric::Uvi => &self.uvi,
            Metric::PressureHpa => &self.pressure_hpa,
            Metric::CoPpm => &self.co_ppm,
            Metric::Co2Ppm => &self.co2_ppm,
        }
    }

    fn slot_mut(&mut self, metric: Metric) -> &mut Option<f64> {
        match metric {
            Metric::TempC => &mut self.temp_c,
            Metric::HumidityPer => &mut self.humidity_per,
            Metric::Uvi => &mut self.uvi,
            Metric::PressureHpa => &mut self.pressure_hpa,
            Metric::CoPpm => &mut self.co_ppm,
            Metric::Co2Ppm => &mut self.co2_ppm,
        }
    }

    /// Value of `metric`, if reported.
    pub fn get(&self, metric: Metric) -> Option<f64> {
        *self.slot(metric)
    }

    /// Sets `metric` to `value`.
    pub fn set(&mut self, metric: Metric, value: f64) {
        *self.slot_mut(metric) = Some(value);
    }

    /// Builder-style `set`.
    pub fn with(mut self, metric: Metric, value: f64) -> Self {
        self.set(metric, value);
        self
    }

    /// Reported metrics in column order.
    pub fn iter(&self) -> impl Iterator<Item = (Metric, f64)> + '_ {
        Metric::ALL
            .into_iter()
            .filter_map(move |m| self.get(m).map(|v| (m, v)))
    }

    /// `true` when no metric was reported.
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

/// # Field Value
///
/// A scalar as it appears in projections and exports.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Any numeric value.
    Number(f64),
    /// Text.
    Text(String),
    /// Boolean flag.
    Bool(bool),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldValue::Number(n) => serializer.serialize_f64(*n),
            FieldValue::Text(s) => serializer.serialize_str(s),
            FieldValue::Bool(b) => serializer.serialize_bool(*b),
        }
    }
}

/// # Field
///
/// A column of the tabular view. The derived ordering is the canonical column
/// order used when every present field is exported: identity first, then node
/// metadata, metrics, any extra fields by name, and arrival time last.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    /// `ID`
    Origin,
    /// `Tiempo_UTC`
    SensorTime,
    /// `Location`
    Location,
    /// `Status`
    Status,
    /// One of the known metrics.
    Metric(Metric),
    /// A field the decoder did not recognise.
    Extra(String),
    /// `received_at`
    ReceivedAt,
}

impl Field {
    /// Column name, identical to the wire name where one exists.
    pub fn name(&self) -> &str {
        match self {
            Field::Origin => FIELD_ORIGIN,
            Field::SensorTime => FIELD_SENSOR_TIME,
            Field::Location => FIELD_LOCATION,
            Field::Status => FIELD_STATUS,
            Field::Metric(m) => m.wire_name(),
            Field::Extra(name) => name,
            Field::ReceivedAt => FIELD_RECEIVED_AT,
        }
    }

    /// Resolves a column name. Unknown names become `Field::Extra`.
    pub fn parse(name: &str) -> Field {
        match name {
            FIELD_ORIGIN => Field::Origin,
            FIELD_SENSOR_TIME => Field::SensorTime,
            FIELD_LOCATION => Field::Location,
            FIELD_STATUS => Field::Status,
            FIELD_RECEIVED_AT => Field::ReceivedAt,
            other => match Metric::from_wire(other) {
                Some(m) => Field::Metric(m),
                None => Field::Extra(other.to_string()),
            },
        }
    }
}

impl From<Metric> for Field {
    fn from(metric: Metric) -> Self {
        Field::Metric(metric)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// # Raw Telemetry
///
/// A successfully decoded message that has not yet been stamped by the
/// gateway. Admission policies look at this form.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTelemetry {
    /// Emitting node identity.
    pub origin_id: String,
    /// Reported metrics.
    pub readings: Readings,
    /// Sensor-reported time, verbatim.
    pub sensor_time: Option<String>,
    /// Node location.
    pub location: Option<String>,
    /// Node status.
    pub status: Option<String>,
    /// Unrecognised scalar fields.
    pub extra: BTreeMap<String, FieldValue>,
}

impl RawTelemetry {
    /// A record carrying only an origin (a heartbeat).
    pub fn new(origin_id: impl Into<String>) -> Self {
        Self {
            origin_id: origin_id.into(),
            readings: Readings::default(),
            sensor_time: None,
            location: None,
            status: None,
            extra: BTreeMap::new(),
        }
    }

    /// Builder-style metric setter.
    pub fn with_metric(mut self, metric: Metric, value: f64) -> Self {
        self.readings.set(metric, value);
        self
    }

    /// Stamps arrival time and sequence, producing the immutable record.
    pub fn stamp(self, received_at: DateTime<Utc>, sequence: u64) -> TelemetryRecord {
        TelemetryRecord {
            origin_id: self.origin_id,
            readings: self.readings,
            sensor_time: self.sensor_time,
            location: self.location,
            status: self.status,
            extra: self.extra,
            received_at,
            sequence,
        }
    }
}

/// # Telemetry Record
///
/// One accepted message. `received_at` and `sequence` are assigned by the
/// gateway on arrival, never taken from the sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    /// Emitting node identity.
    pub origin_id: String,
    /// Reported metrics.
    pub readings: Readings,
    /// Sensor-reported time, verbatim.
    pub sensor_time: Option<String>,
    /// Node location.
    pub location: Option<String>,
    /// Node status.
    pub status: Option<String>,
    /// Unrecognised scalar fields.
    pub extra: BTreeMap<String, FieldValue>,
    /// Local arrival time.
    pub received_at: DateTime<Utc>,
    /// Gateway-wide arrival order.
    pub sequence: u64,
}

impl TelemetryRecord {
    /// Value of `field` in this record, `None` when absent.
    pub fn value(&self, field: &Field) -> Option<FieldValue> {
        match field {
            Field::Origin => Some(FieldValue::Text(self.origin_id.clone())),
            Field::SensorTime => self.sensor_time.clone().map(FieldValue::Text),
            Field::Location => self.location.clone().map(FieldValue::Text),
            Field::Status => self.status.clone().map(FieldValue::Text),
            Field::Metric(m) => self.readings.get(*m).map(FieldValue::Number),
            Field::Extra(name) => self.extra.get(name).cloned(),
            Field::ReceivedAt => Some(FieldValue::Text(rfc3339_millis(self.received_at))),
        }
    }

    /// Every field this record carries, in canonical column order.
    pub fn present_fields(&self) -> Vec<Field> {
        let mut fields = vec![Field::Origin];
        if self.sensor_time.is_some() {
            fields.push(Field::SensorTime);
        }
        if self.location.is_some() {
            fields.push(Field::Location);
        }
        if self.status.is_some() {
            fields.push(Field::Status);
        }
        fields.extend(self.readings.iter().map(|(m, _)| Field::Metric(m)));
        fields.extend(self.extra.keys().map(|k| Field::Extra(k.clone())));
        fields.push(Field::ReceivedAt);
        fields
    }

    /// `Tiempo_UTC` parsed as a day-of-year stamp, when it is one.
    pub fn sensor_time(&self) -> Option<DateTime<Utc>> {
        self.sensor_time.as_deref().and_then(parse_day_of_year_stamp)
    }

    /// `true` for records carrying no metric at all.
    pub fn is_heartbeat(&self) -> bool {
        self.readings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn stamped(raw: RawTelemetry) -> TelemetryRecord {
        raw.stamp(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(), 7)
    }

    #[test]
    fn metric_catalogue_round_trips_wire_names() {
        for metric in Metric::ALL {
            assert_eq!(Metric::from_wire(metric.wire_name()), Some(metric));
            assert_eq!(Field::parse(metric.wire_name()), Field::Metric(metric));
        }
        assert_eq!(Metric::from_wire("temp_c"), None);
    }

    #[test]
    fn field_parse_falls_back_to_extra() {
        assert_eq!(Field::parse("ID"), Field::Origin);
        assert_eq!(Field::parse("received_at"), Field::ReceivedAt);
        assert_eq!(Field::parse("Battery_V"), Field::Extra("Battery_V".into()));
    }

    #[test]
    fn canonical_column_order() {
        let mut fields = vec![
            Field::ReceivedAt,
            Field::Extra("Battery_V".into()),
            Field::Metric(Metric::Co2Ppm),
            Field::Metric(Metric::TempC),
            Field::Status,
            Field::Origin,
        ];
        fields.sort();
        let names: Vec<_> = fields.iter().map(Field::name).collect();
        assert_eq!(
            names,
            vec!["ID", "Status", "Temp_C", "CO2_ppm", "Battery_V", "received_at"]
        );
    }

    #[test]
    fn heartbeat_has_only_identity_and_arrival() {
        let record = stamped(RawTelemetry::new("A1"));
        assert!(record.is_heartbeat());
        assert_eq!(record.present_fields(), vec![Field::Origin, Field::ReceivedAt]);
        assert_eq!(record.value(&Field::Metric(Metric::TempC)), None);
        assert_eq!(
            record.value(&Field::ReceivedAt),
            Some(FieldValue::Text("2025-03-01T12:00:00.000Z".into()))
        );
    }

    #[test]
    fn readings_iterate_in_column_order() {
        let readings = Readings::default()
            .with(Metric::Co2Ppm, 612.5)
            .with(Metric::TempC, 21.0);
        let seen: Vec<_> = readings.iter().collect();
        assert_eq!(seen, vec![(Metric::TempC, 21.0), (Metric::Co2Ppm, 612.5)]);
    }

    #[test]
    fn sensor_time_parses_day_of_year() {
        let mut raw = RawTelemetry::new("B2");
        raw.sensor_time = Some("2025-060-08:30:00".into());
        let record = stamped(raw);
        assert_eq!(
            record.sensor_time(),
            Some(Utc.with_ymd_and_hms(2025, 3, 1, 8, 30, 0).unwrap())
        );
    }

    #[test]
    fn field_values_display_for_export() {
        assert_eq!(FieldValue::Number(23.5).to_string(), "23.5");
        assert_eq!(FieldValue::Number(400.0).to_string(), "400");
        assert_eq!(FieldValue::Bool(true).to_string(), "true");
    }
}
