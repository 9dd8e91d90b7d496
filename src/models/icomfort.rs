//! Models for the iComfort web portal.
//!
//! The portal is organised as homes, each holding one or more Lennox Climate Control
//! systems (LCCs), each holding one or more zones. Identifiers are opaque strings as
//! they appear in the dashboard links.
//!
//! Notes
//! - Raw payload types mirror the `RefreshLatestZoneDetailByIndex` JSON and keep every field optional;
//!   required-ness is decided when flattening into [`ZoneState`].
//! - Numeric readings arrive as numbers, numeric strings or `{ "Value": ... }` wrappers.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;

// =====================
// Scalar ID newtype wrappers
// =====================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HomeId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LccId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ZoneId(pub String);

/// The (home, controller, zone) triple a poll is aimed at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ZoneContext {
    pub home_id: HomeId,
    pub lcc_id: LccId,
    pub zone_id: ZoneId,
}

impl ZoneContext {
    pub fn new(home_id: impl Into<String>, lcc_id: impl Into<String>, zone_id: impl Into<String>) -> Self {
        ZoneContext {
            home_id: HomeId(home_id.into()),
            lcc_id: LccId(lcc_id.into()),
            zone_id: ZoneId(zone_id.into()),
        }
    }
}

impl fmt::Display for ZoneContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "home={} lcc={} zone={}", self.home_id.0, self.lcc_id.0, self.zone_id.0)
    }
}

/// Home -> ordered, de-duplicated (controller, zone) pairs, as discovered on the dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HomeZones(BTreeMap<HomeId, Vec<(LccId, ZoneId)>>);

impl HomeZones {
    /// Returns false when the pair was already known for this home.
    pub fn insert(&mut self, home_id: HomeId, lcc_id: LccId, zone_id: ZoneId) -> bool {
        let pairs = self.0.entry(home_id).or_default();
        if pairs.iter().any(|(l, z)| *l == lcc_id && *z == zone_id) {
            return false;
        }
        pairs.push((lcc_id, zone_id));
        true
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    pub fn home_count(&self) -> usize {
        self.0.len()
    }

    /// Every zone as a [`ZoneContext`], homes in key order, zones in discovery order.
    pub fn contexts(&self) -> Vec<ZoneContext> {
        self.0
            .iter()
            .flat_map(|(home, pairs)| {
                pairs.iter().map(move |(lcc, zone)| ZoneContext {
                    home_id: home.clone(),
                    lcc_id: lcc.clone(),
                    zone_id: zone.clone(),
                })
            })
            .collect()
    }
}

// =====================
// Raw zone detail payload
// =====================

/// Status code reported when the thermostat is reachable by the portal.
pub const LCC_ONLINE: &str = "LCC_ONLINE";

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneDetailResponse {
    #[serde(rename = "Code")]
    pub code: String,
    #[serde(default)]
    pub data: Option<ZoneDetailData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneDetailData {
    #[serde(rename = "HomeName", default)]
    pub home_name: Option<String>,
    #[serde(rename = "centralMode", default)]
    pub central_mode: Option<ModeValue>,
    #[serde(rename = "isSysteminAwayMode", default)]
    pub is_system_in_away_mode: Option<bool>,
    #[serde(rename = "sysNotificationCount", default)]
    pub sys_notification_count: Option<u32>,
    #[serde(rename = "systemName", default)]
    pub system_name: Option<String>,
    #[serde(rename = "zoneDetail", default)]
    pub zone_detail: Option<ZoneDetail>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneDetail {
    #[serde(rename = "AmbientTemperature", default)]
    pub ambient_temperature: Option<Wrapped>,
    #[serde(rename = "CoolSetPoint", default)]
    pub cool_set_point: Option<Wrapped>,
    #[serde(rename = "HeatSetPoint", default)]
    pub heat_set_point: Option<Wrapped>,
    #[serde(rename = "SingleSetPoint", default)]
    pub single_set_point: Option<Wrapped>,
    #[serde(rename = "Humidity", default)]
    pub humidity: Option<LooseNumber>,
}

/// A `{ "Value": x }` wrapper around a numeric reading.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Wrapped {
    #[serde(rename = "Value")]
    pub value: LooseNumber,
}

/// `centralMode` is a string on some firmware and an integer code on others.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ModeValue {
    Code(i64),
    Name(String),
}

impl fmt::Display for ModeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModeValue::Code(c) => write!(f, "{}", c),
            ModeValue::Name(n) => f.write_str(n),
        }
    }
}

/// A number that may be sent as a JSON number, a numeric string or a `{ "Value": ... }` wrapper.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LooseNumber(pub f64);

impl<'de> Deserialize<'de> for LooseNumber {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;
        impl<'de> serde::de::Visitor<'de> for V {
            type Value = LooseNumber;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a number, a numeric string or an object with a \"Value\" key")
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(LooseNumber(value as f64))
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(LooseNumber(value as f64))
            }

            fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(LooseNumber(value))
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                value
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .map(LooseNumber)
                    .ok_or_else(|| E::invalid_value(serde::de::Unexpected::Str(value), &self))
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::MapAccess<'de>,
            {
                let mut found = None;
                while let Some(key) = map.next_key::<String>()? {
                    if key == "Value" {
                        found = Some(map.next_value::<LooseNumber>()?);
                    } else {
                        map.next_value::<serde::de::IgnoredAny>()?;
                    }
                }
                found.ok_or_else(|| serde::de::Error::missing_field("Value"))
            }
        }

        deserializer.deserialize_any(V)
    }
}

// =====================
// Flat record
// =====================

/// One zone's status, flattened from a [`ZoneDetailResponse`].
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneState {
    pub home_name: Option<String>,
    pub system_name: String,
    pub central_mode: Option<String>,
    pub is_away_mode: bool,
    pub notification_count: u32,
    pub ambient_temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub cool_set_point: Option<f64>,
    pub heat_set_point: Option<f64>,
    pub single_set_point: Option<f64>,
}
