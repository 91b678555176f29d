//! GTFS-realtime feed decoding.
//!
//! Feeds arrive either as protobuf (decoded through the standard
//! `gtfs_realtime::FeedMessage` schema) or as JSON, where some vendors wrap
//! the feed in a `{"response": …}` envelope and spell fields in camelCase.
//! Every path converts into the owned entity model below so the rest of the
//! pipeline sees a single shape.

pub mod fetch;

use prost::Message;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Upper bound on a single feed response (50 MB).
pub const MAX_FEED_SIZE: usize = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Network error: {0}")]
    NetworkMessage(String),
    #[error("Protobuf decode error: {0}")]
    Protobuf(#[from] prost::DecodeError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Feed body shape, selected by the `format` config key: `"FeedMessage"`
/// for the bare GTFS feed, any vendor name for the `{"response": …}` wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum FeedFormat {
    #[default]
    FeedMessage,
    #[serde(other)]
    Vendor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum FeedProtocol {
    #[serde(rename = "protobuf")]
    Protobuf,
    #[default]
    #[serde(other)]
    Json,
}

impl FeedProtocol {
    pub fn accept_header(self) -> &'static str {
        match self {
            FeedProtocol::Protobuf => "application/x-protobuf",
            FeedProtocol::Json => "application/json",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedEntity {
    pub id: String,
    #[serde(default, alias = "isDeleted")]
    pub is_deleted: bool,
    #[serde(default)]
    pub vehicle: Option<VehicleData>,
    #[serde(default, alias = "tripUpdate")]
    pub trip_update: Option<TripUpdateData>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VehicleData {
    #[serde(default)]
    pub vehicle: Option<VehicleDescriptor>,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default, deserialize_with = "flexible_u64")]
    pub timestamp: Option<u64>,
    #[serde(default)]
    pub trip: Option<TripDescriptor>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VehicleDescriptor {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub bearing: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TripDescriptor {
    #[serde(default, alias = "routeId")]
    pub route_id: Option<String>,
    #[serde(default, alias = "tripId")]
    pub trip_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TripUpdateData {
    #[serde(default)]
    pub trip: Option<TripDescriptor>,
    #[serde(default, alias = "stopTimeUpdate")]
    pub stop_time_update: Vec<StopTimeUpdate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopTimeUpdate {
    #[serde(default, alias = "stopId")]
    pub stop_id: Option<String>,
    #[serde(default)]
    pub arrival: Option<StopTimeEvent>,
    #[serde(default)]
    pub departure: Option<StopTimeEvent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopTimeEvent {
    #[serde(default, deserialize_with = "flexible_i64")]
    pub time: Option<i64>,
    #[serde(default)]
    pub delay: Option<i64>,
}

impl FeedEntity {
    pub fn vehicle_id(&self) -> Option<&str> {
        self.vehicle
            .as_ref()?
            .vehicle
            .as_ref()?
            .id
            .as_deref()
            .filter(|id| !id.is_empty())
    }

    pub fn position(&self) -> Option<&Position> {
        self.vehicle.as_ref()?.position.as_ref()
    }

    pub fn timestamp(&self) -> Option<u64> {
        self.vehicle.as_ref()?.timestamp
    }

    pub fn route_id(&self) -> Option<&str> {
        self.vehicle
            .as_ref()?
            .trip
            .as_ref()?
            .route_id
            .as_deref()
            .filter(|r| !r.is_empty())
    }

    pub fn trip_id(&self) -> Option<&str> {
        self.vehicle
            .as_ref()?
            .trip
            .as_ref()?
            .trip_id
            .as_deref()
            .filter(|t| !t.is_empty())
    }
}

/// Vendors sometimes encode numeric timestamps as strings; accept both.
fn flexible_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Float(f64),
        Text(String),
    }
    Ok(match Option::<Raw>::deserialize(deserializer)? {
        None => None,
        Some(Raw::Int(n)) => Some(n),
        Some(Raw::Float(f)) => Some(f as u64),
        Some(Raw::Text(s)) => s.trim().parse().ok(),
    })
}

fn flexible_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Float(f64),
        Text(String),
    }
    Ok(match Option::<Raw>::deserialize(deserializer)? {
        None => None,
        Some(Raw::Int(n)) => Some(n),
        Some(Raw::Float(f)) => Some(f as i64),
        Some(Raw::Text(s)) => s.trim().parse().ok(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct FeedDocument {
    #[serde(default)]
    entity: Vec<FeedEntity>,
}

#[derive(Debug, Deserialize)]
struct VendorEnvelope {
    response: FeedDocument,
}

/// Decodes a JSON feed body into entities.
pub fn decode_json(bytes: &[u8], format: FeedFormat) -> Result<Vec<FeedEntity>, FeedError> {
    match format {
        FeedFormat::FeedMessage => {
            let doc: FeedDocument = serde_json::from_slice(bytes)?;
            Ok(doc.entity)
        }
        FeedFormat::Vendor => {
            let envelope: VendorEnvelope = serde_json::from_slice(bytes)?;
            Ok(envelope.response.entity)
        }
    }
}

/// Decodes a protobuf feed body through the standard GTFS-realtime schema.
pub fn decode_protobuf(bytes: &[u8]) -> Result<Vec<FeedEntity>, FeedError> {
    let message = gtfs_realtime::FeedMessage::decode(bytes)?;
    Ok(message.entity.into_iter().map(convert_entity).collect())
}

fn convert_entity(entity: gtfs_realtime::FeedEntity) -> FeedEntity {
    FeedEntity {
        id: entity.id,
        is_deleted: entity.is_deleted.unwrap_or(false),
        vehicle: entity.vehicle.map(convert_vehicle),
        trip_update: entity.trip_update.map(convert_trip_update),
    }
}

fn convert_vehicle(vehicle: gtfs_realtime::VehiclePosition) -> VehicleData {
    VehicleData {
        vehicle: vehicle.vehicle.map(|v| VehicleDescriptor {
            id: v.id,
            label: v.label,
        }),
        position: vehicle.position.map(|p| Position {
            latitude: p.latitude as f64,
            longitude: p.longitude as f64,
            speed: p.speed.map(|s| s as f64),
            bearing: p.bearing.map(|b| b as f64),
        }),
        timestamp: vehicle.timestamp,
        trip: vehicle.trip.map(convert_trip_descriptor),
    }
}

fn convert_trip_descriptor(trip: gtfs_realtime::TripDescriptor) -> TripDescriptor {
    TripDescriptor {
        route_id: trip.route_id,
        trip_id: trip.trip_id,
    }
}

fn convert_trip_update(update: gtfs_realtime::TripUpdate) -> TripUpdateData {
    TripUpdateData {
        trip: Some(convert_trip_descriptor(update.trip)),
        stop_time_update: update
            .stop_time_update
            .into_iter()
            .map(|stu| StopTimeUpdate {
                stop_id: stu.stop_id,
                arrival: stu.arrival.map(convert_stop_time_event),
                departure: stu.departure.map(convert_stop_time_event),
            })
            .collect(),
    }
}

fn convert_stop_time_event(event: gtfs_realtime::trip_update::StopTimeEvent) -> StopTimeEvent {
    StopTimeEvent {
        time: event.time,
        delay: event.delay.map(|d| d as i64),
    }
}
