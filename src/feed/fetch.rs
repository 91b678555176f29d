//! Per-cycle feed retrieval.
//!
//! All position and trip-update URLs are fetched concurrently with
//! wait-for-all semantics: one failing request never cancels the others,
//! and the cycle proceeds with whatever decoded successfully.

use futures::future::join_all;
use tracing::{debug, warn};

use super::{decode_json, decode_protobuf, FeedEntity, FeedError, FeedProtocol, MAX_FEED_SIZE};
use crate::config::GtfsRealtimeApi;

/// Fetches every configured feed URL for one cycle and returns the merged
/// position entities. Trip-update feeds, when configured, are indexed by
/// entity id and their stop time updates copied onto the matching position
/// entities (replacing any carried by the position feed itself).
pub async fn fetch_cycle(
    client: &reqwest::Client,
    api: &GtfsRealtimeApi,
    api_key: Option<&str>,
) -> Vec<FeedEntity> {
    let positions = fetch_all(client, &api.url, api, api_key).await;
    if api.trips_url.is_empty() {
        return positions;
    }

    let trips = fetch_all(client, &api.trips_url, api, api_key).await;
    merge_trip_updates(positions, trips)
}

async fn fetch_all(
    client: &reqwest::Client,
    urls: &[String],
    api: &GtfsRealtimeApi,
    api_key: Option<&str>,
) -> Vec<FeedEntity> {
    let requests = urls
        .iter()
        .map(|url| fetch_one(client, url, api, api_key));
    let results = join_all(requests).await;

    let mut entities = Vec::new();
    for (url, result) in urls.iter().zip(results) {
        match result {
            Ok(batch) => {
                debug!(url = %url, entities = batch.len(), "fetched feed");
                entities.extend(batch);
            }
            Err(e) => warn!(url = %url, error = %e, "feed fetch failed, continuing"),
        }
    }
    entities
}

async fn fetch_one(
    client: &reqwest::Client,
    url: &str,
    api: &GtfsRealtimeApi,
    api_key: Option<&str>,
) -> Result<Vec<FeedEntity>, FeedError> {
    let mut request = client.get(url).header("Accept", api.protocol.accept_header());
    if let (Some(header), Some(key)) = (api.key_header.as_deref(), api_key) {
        request = request.header(header, key);
    }

    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(FeedError::NetworkMessage(format!(
            "HTTP {} from {url}",
            response.status()
        )));
    }

    let bytes = response.bytes().await?;
    if bytes.len() > MAX_FEED_SIZE {
        return Err(FeedError::NetworkMessage(format!(
            "response too large: {} bytes (max {MAX_FEED_SIZE})",
            bytes.len()
        )));
    }

    match api.protocol {
        FeedProtocol::Protobuf => decode_protobuf(&bytes),
        FeedProtocol::Json => decode_json(&bytes, api.format),
    }
}

/// Replaces each position entity's trip update with the one published under
/// the same entity id in the trip feed, when present.
pub fn merge_trip_updates(
    mut positions: Vec<FeedEntity>,
    trips: Vec<FeedEntity>,
) -> Vec<FeedEntity> {
    let mut by_id: std::collections::HashMap<String, super::TripUpdateData> = trips
        .into_iter()
        .filter_map(|e| e.trip_update.map(|tu| (e.id, tu)))
        .collect();

    for entity in &mut positions {
        if let Some(update) = by_id.remove(&entity.id) {
            entity.trip_update = Some(update);
        }
    }
    positions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{StopTimeUpdate, TripUpdateData};

    fn position_entity(id: &str) -> FeedEntity {
        FeedEntity {
            id: id.to_string(),
            ..Default::default()
        }
    }

    fn trip_entity(id: &str, stop_id: &str) -> FeedEntity {
        FeedEntity {
            id: id.to_string(),
            trip_update: Some(TripUpdateData {
                trip: None,
                stop_time_update: vec![StopTimeUpdate {
                    stop_id: Some(stop_id.to_string()),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }
    }

    #[test]
    fn trip_updates_replace_by_entity_id() {
        let mut position = position_entity("59125");
        position.trip_update = Some(TripUpdateData::default());
        let merged = merge_trip_updates(
            vec![position, position_entity("other")],
            vec![trip_entity("59125", "S4")],
        );

        let update = merged[0].trip_update.as_ref().unwrap();
        assert_eq!(update.stop_time_update[0].stop_id.as_deref(), Some("S4"));
        assert!(merged[1].trip_update.is_none());
    }

    #[test]
    fn positions_without_trip_feed_pass_through() {
        let merged = merge_trip_updates(vec![position_entity("a")], vec![]);
        assert_eq!(merged.len(), 1);
        assert!(merged[0].trip_update.is_none());
    }
}
