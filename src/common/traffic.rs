//! Traffic stat records and the stats-key parser shared by both control APIs
//!
//! Both cores report counters under keys of the form
//! `<inbound|outbound|user>>>><id>>>>traffic>>><uplink|downlink>`.
//! `downlink` is accounted as `down` and `uplink` as `up` for every kind of
//! record.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Tag of the inbound that carries the control API itself
pub const API_TAG: &str = "api";

static STAT_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(inbound|outbound|user)>>>([^>]+)>>>traffic>>>(downlink|uplink)$")
        .expect("valid stats key regex")
});

/// Per-tag traffic of an inbound or outbound
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Traffic {
    pub is_inbound: bool,
    pub is_outbound: bool,
    pub tag: String,
    pub up: i64,
    pub down: i64,
}

/// Per-client traffic keyed by email
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTraffic {
    pub email: String,
    pub up: i64,
    pub down: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Uplink,
    Downlink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatKind {
    Inbound,
    Outbound,
    User,
}

/// A decoded stats key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatKey<'a> {
    pub kind: StatKind,
    pub id: &'a str,
    pub direction: Direction,
}

/// Decode a stats key; unrelated keys yield `None`.
pub fn parse_stat_key(key: &str) -> Option<StatKey<'_>> {
    let caps = STAT_KEY.captures(key)?;
    let kind = match caps.get(1)?.as_str() {
        "inbound" => StatKind::Inbound,
        "outbound" => StatKind::Outbound,
        _ => StatKind::User,
    };
    let direction = match caps.get(3)?.as_str() {
        "downlink" => Direction::Downlink,
        _ => Direction::Uplink,
    };
    Some(StatKey {
        kind,
        id: caps.get(2)?.as_str(),
        direction,
    })
}

/// Folds raw counters into one record per tag and per email.
///
/// Output order follows the first appearance of each id.
#[derive(Debug, Default)]
pub struct TrafficAggregator {
    tags: Vec<Traffic>,
    tag_index: HashMap<(StatKind, String), usize>,
    clients: Vec<ClientTraffic>,
    client_index: HashMap<String, usize>,
}

impl TrafficAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one counter. Returns false when the key was ignored.
    pub fn record(&mut self, key: &str, value: i64) -> bool {
        let Some(stat) = parse_stat_key(key) else {
            return false;
        };

        match stat.kind {
            StatKind::User => {
                let idx = match self.client_index.get(stat.id) {
                    Some(&idx) => idx,
                    None => {
                        self.clients.push(ClientTraffic {
                            email: stat.id.to_string(),
                            ..Default::default()
                        });
                        self.client_index
                            .insert(stat.id.to_string(), self.clients.len() - 1);
                        self.clients.len() - 1
                    }
                };
                let client = &mut self.clients[idx];
                match stat.direction {
                    Direction::Downlink => client.down = value,
                    Direction::Uplink => client.up = value,
                }
            }
            kind => {
                if stat.id == API_TAG {
                    return false;
                }
                let key = (kind, stat.id.to_string());
                let idx = match self.tag_index.get(&key) {
                    Some(&idx) => idx,
                    None => {
                        self.tags.push(Traffic {
                            is_inbound: kind == StatKind::Inbound,
                            is_outbound: kind == StatKind::Outbound,
                            tag: stat.id.to_string(),
                            ..Default::default()
                        });
                        self.tag_index.insert(key, self.tags.len() - 1);
                        self.tags.len() - 1
                    }
                };
                let traffic = &mut self.tags[idx];
                match stat.direction {
                    Direction::Downlink => traffic.down = value,
                    Direction::Uplink => traffic.up = value,
                }
            }
        }
        true
    }

    pub fn finish(self) -> (Vec<Traffic>, Vec<ClientTraffic>) {
        (self.tags, self.clients)
    }
}
