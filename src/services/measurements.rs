use crate::models::icomfort::ZoneState;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

pub const HUMIDITY_UNIT: &str = "%";
pub const TEMPERATURE_UNIT: &str = "°F";
pub const SENSOR_DOMAIN: &str = "sensor";

/// One time-series point: measurement named after the unit, tagged with the entity it describes.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementPoint {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, f64>,
    pub time: DateTime<Utc>,
}

impl MeasurementPoint {
    fn sensor(unit: &str, entity_id: String, value: f64, time: DateTime<Utc>) -> Self {
        MeasurementPoint {
            measurement: unit.to_string(),
            tags: BTreeMap::from([
                ("domain".to_string(), SENSOR_DOMAIN.to_string()),
                ("entity_id".to_string(), entity_id),
            ]),
            fields: BTreeMap::from([("value".to_string(), value)]),
            time,
        }
    }

    pub fn entity_id(&self) -> Option<&str> {
        self.tags.get("entity_id").map(String::as_str)
    }
}

/// Humidity first, then ambient temperature; each only when the zone reported it.
pub fn to_points(state: &ZoneState, now: DateTime<Utc>) -> Vec<MeasurementPoint> {
    let mut points = Vec::with_capacity(2);
    if let Some(h) = state.humidity {
        points.push(MeasurementPoint::sensor(
            HUMIDITY_UNIT,
            format!("{}_humidity", state.system_name),
            h,
            now,
        ));
    }
    if let Some(t) = state.ambient_temperature {
        points.push(MeasurementPoint::sensor(
            TEMPERATURE_UNIT,
            format!("{}_temp", state.system_name),
            t,
            now,
        ));
    }
    points
}
