//! Sightings: one observation of an advertised URL from a transport.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum TransportKind {
    Ble,
    FatBeacon,
    MdnsPublic,
    MdnsLocal,
    Ssdp,
    WifiDirect,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Ble => "ble",
            TransportKind::FatBeacon => "fat-beacon",
            TransportKind::MdnsPublic => "mdns-public",
            TransportKind::MdnsLocal => "mdns-local",
            TransportKind::Ssdp => "ssdp",
            TransportKind::WifiDirect => "wifidirect",
        }
    }

    /// Sightings from these transports mean nothing once the emitter is out of range.
    pub fn is_range_bound(&self) -> bool {
        matches!(
            self,
            TransportKind::Ble
                | TransportKind::FatBeacon
                | TransportKind::WifiDirect
                | TransportKind::MdnsLocal
        )
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hardware or network address of the emitter.
///
/// `stable` is false for addresses the emitter is free to rotate (BLE random
/// addresses, SSDP source ports); those never serve as an Identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAddress {
    pub value: String,
    pub stable: bool,
}

impl DeviceAddress {
    pub fn stable(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            stable: true,
        }
    }

    pub fn rotating(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            stable: false,
        }
    }
}

/// Transport-specific extras attached to a sighting.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransportData {
    pub rssi: Option<i16>,
    pub tx_power: Option<i8>,
    pub address: Option<DeviceAddress>,
    pub port: Option<u16>,
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub txt: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sighting {
    url: String,
    transport: TransportKind,
    data: TransportData,
    scan_offset_ms: u64,
    is_public: bool,
}

impl Sighting {
    pub fn builder(transport: TransportKind, url: impl Into<String>) -> SightingBuilder {
        SightingBuilder {
            sighting: Sighting {
                url: url.into(),
                transport,
                data: TransportData::default(),
                scan_offset_ms: 0,
                is_public: true,
            },
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn data(&self) -> &TransportData {
        &self.data
    }

    pub fn scan_offset_ms(&self) -> u64 {
        self.scan_offset_ms
    }

    pub fn is_public(&self) -> bool {
        self.is_public
    }

    /// Whether the metadata service can say anything about this URL.
    pub fn is_resolvable(&self) -> bool {
        match self.transport {
            TransportKind::Ble | TransportKind::Ssdp | TransportKind::MdnsPublic => true,
            // A Wi-Fi Direct peer without a port advertises a plain URL.
            TransportKind::WifiDirect => self.data.port.is_none(),
            TransportKind::FatBeacon | TransportKind::MdnsLocal => false,
        }
    }
}

pub struct SightingBuilder {
    sighting: Sighting,
}

impl SightingBuilder {
    pub fn rssi(mut self, rssi: i16) -> Self {
        self.sighting.data.rssi = Some(rssi);
        self
    }

    pub fn tx_power(mut self, tx_power: i8) -> Self {
        self.sighting.data.tx_power = Some(tx_power);
        self
    }

    pub fn address(mut self, address: DeviceAddress) -> Self {
        self.sighting.data.address = Some(address);
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.sighting.data.port = Some(port);
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.sighting.data.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.sighting.data.description = Some(description.into());
        self
    }

    pub fn txt(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.sighting.data.txt.insert(key.into(), value.into());
        self
    }

    pub fn scan_offset_ms(mut self, offset_ms: u64) -> Self {
        self.sighting.scan_offset_ms = offset_ms;
        self
    }

    pub fn private(mut self) -> Self {
        self.sighting.is_public = false;
        self
    }

    pub fn build(self) -> Sighting {
        self.sighting
    }
}

/// Dedup key for a physical emitter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum Identity {
    Address(String),
    Url(String),
}

impl Identity {
    /// A stable device address wins; anything else falls back to the raw URL.
    pub fn of(sighting: &Sighting) -> Self {
        match &sighting.data.address {
            Some(address) if address.stable => match sighting.data.port {
                Some(port) => Identity::Address(format!("{}#{}", address.value, port)),
                None => Identity::Address(address.value.clone()),
            },
            _ => Identity::Url(sighting.url.clone()),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Address(address) => write!(f, "addr:{address}"),
            Identity::Url(url) => write!(f, "url:{url}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotating_addresses_fall_back_to_url() {
        let first = Sighting::builder(TransportKind::Ble, "http://example.com")
            .address(DeviceAddress::rotating("AA:BB"))
            .build();
        let second = Sighting::builder(TransportKind::Ble, "http://example.com")
            .address(DeviceAddress::rotating("CC:DD"))
            .build();

        assert_eq!(Identity::of(&first), Identity::Url("http://example.com".into()));
        assert_eq!(Identity::of(&first), Identity::of(&second));
    }

    #[test]
    fn stable_address_includes_port() {
        let sighting = Sighting::builder(TransportKind::WifiDirect, "wifidirect://aa:bb:1234")
            .address(DeviceAddress::stable("aa:bb"))
            .port(1234)
            .build();

        assert_eq!(Identity::of(&sighting), Identity::Address("aa:bb#1234".into()));
        assert!(!sighting.is_resolvable());
    }
}
