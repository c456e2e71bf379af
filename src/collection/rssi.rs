use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

const WINDOW: usize = 10;
/// Typical path loss at one metre, relative to the advertised tx power.
const PATH_LOSS_AT_ONE_METRE: f64 = 41.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum Region {
    Near,
    Mid,
    Far,
}

impl Region {
    pub fn from_distance(distance_m: f64) -> Self {
        if distance_m < 0.5 {
            Region::Near
        } else if distance_m < 2.0 {
            Region::Mid
        } else {
            Region::Far
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Region::Near => "near",
            Region::Mid => "mid",
            Region::Far => "far",
        })
    }
}

/// Running mean over the most recent readings for one emitter.
#[derive(Debug, Clone, Default)]
pub struct RssiFilter {
    readings: VecDeque<i16>,
    tx_power: Option<i8>,
}

impl RssiFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, rssi: i16, tx_power: Option<i8>) {
        if self.readings.len() == WINDOW {
            self.readings.pop_front();
        }
        self.readings.push_back(rssi);
        if tx_power.is_some() {
            self.tx_power = tx_power;
        }
    }

    pub fn smoothed(&self) -> Option<f64> {
        if self.readings.is_empty() {
            return None;
        }
        let sum: f64 = self.readings.iter().map(|&rssi| f64::from(rssi)).sum();
        Some(sum / self.readings.len() as f64)
    }

    pub fn distance_m(&self) -> Option<f64> {
        Some(distance_from(self.smoothed()?, self.tx_power?))
    }

    pub fn region(&self) -> Option<Region> {
        self.distance_m().map(Region::from_distance)
    }
}

/// Log-distance path loss estimate in metres.
pub fn distance_from(rssi: f64, tx_power: i8) -> f64 {
    10f64.powf((f64::from(tx_power) - rssi - PATH_LOSS_AT_ONE_METRE) / 20.0)
}
