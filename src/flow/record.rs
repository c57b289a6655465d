//! Flow identity and the published per-interval record.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::IpAddr;

use crate::geo::GeoLocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Outbound => write!(f, "outbound"),
            Direction::Inbound => write!(f, "inbound"),
        }
    }
}

/// Transport protocol guessed from capture output. `Other` is a normal result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Protocol {
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
    #[serde(rename = "ICMP")]
    Icmp,
    Other,
}

impl Protocol {
    /// Guesses the protocol from the text after `src > dst:`.
    pub fn from_remainder(remainder: &str) -> Self {
        let upper = remainder.to_ascii_uppercase();
        if upper.contains("ICMP") {
            Protocol::Icmp
        } else if upper.contains("UDP") {
            Protocol::Udp
        } else if upper.contains("TCP") || upper.contains("FLAGS") {
            Protocol::Tcp
        } else {
            Protocol::Other
        }
    }
}

/// Identity of a flow within one interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub direction: Direction,
    pub remote_ip: IpAddr,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FlowRecord {
    pub direction: Direction,
    pub remote_ip: IpAddr,
    pub remote_port: Option<u16>,
    pub protocol: Protocol,
    pub app: String,
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub city: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub bytes: u64,
    pub mb_s: f64,
    pub last_seen: DateTime<Utc>,
}

impl FlowRecord {
    /// Copies location fields. Coordinates are set together or not at all.
    pub fn apply_geo(&mut self, geo: Option<&GeoLocation>) {
        match geo {
            Some(g) => {
                self.lat = Some(g.lat);
                self.lon = Some(g.lon);
                self.country = g.country.clone();
                self.country_code = g.country_code.clone();
                self.city = g.city.clone();
            }
            None => {
                self.lat = None;
                self.lon = None;
                self.country = None;
                self.country_code = None;
                self.city = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_from_remainder() {
        assert_eq!(Protocol::from_remainder("tcp 1500"), Protocol::Tcp);
        assert_eq!(Protocol::from_remainder("Flags [P.], seq 1:10, length 9"), Protocol::Tcp);
        assert_eq!(Protocol::from_remainder("UDP, length 512"), Protocol::Udp);
        assert_eq!(Protocol::from_remainder("ICMP echo request, id 1, length 64"), Protocol::Icmp);
        assert_eq!(Protocol::from_remainder("length 40"), Protocol::Other);
    }

    #[test]
    fn test_record_serializes_flat() {
        let mut record = FlowRecord {
            direction: Direction::Inbound,
            remote_ip: "198.51.100.9".parse().unwrap(),
            remote_port: Some(443),
            protocol: Protocol::Tcp,
            app: "Unknown".into(),
            country: None,
            country_code: None,
            city: None,
            lat: None,
            lon: None,
            bytes: 1000,
            mb_s: 0.001,
            last_seen: Utc::now(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["direction"], "inbound");
        assert_eq!(json["protocol"], "TCP");
        assert!(json["lat"].is_null());

        record.apply_geo(Some(&GeoLocation {
            lat: 1.0,
            lon: 2.0,
            country: Some("US".into()),
            country_code: None,
            city: None,
        }));
        assert_eq!(record.lat, Some(1.0));
        assert_eq!(record.lon, Some(2.0));
    }
}
