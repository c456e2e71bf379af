//! JSON shapes exchanged with the metadata resolution service.

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::models::ResolvedMetadata;

const DEFAULT_ICON_PATH: &str = "/favicon.ico";

#[derive(Debug, Serialize)]
pub struct ResolveRequest<'a> {
    pub objects: Vec<RequestObject<'a>>,
}

#[derive(Debug, Serialize)]
pub struct RequestObject<'a> {
    pub url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i16>,
    #[serde(rename = "txpower", skip_serializing_if = "Option::is_none")]
    pub tx_power: Option<i8>,
}

/// Items are kept as raw values so one bad entry cannot sink the batch.
#[derive(Debug, Deserialize)]
pub struct ResolveResponse {
    #[serde(default)]
    pub metadata: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetadataItem {
    /// The URL as it was sent.
    pub id: String,
    /// The URL after redirects.
    pub url: String,
    #[serde(default)]
    pub display_url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "icon")]
    pub icon_url: Option<String>,
    #[serde(alias = "score")]
    pub rank: f64,
    #[serde(default, alias = "groupId", alias = "groupid")]
    pub group: Option<String>,
}

impl MetadataItem {
    pub fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn into_metadata(self, latency_ms: u64) -> ResolvedMetadata {
        let icon_url = absolute_icon_url(&self.url, self.icon_url.as_deref());
        ResolvedMetadata {
            display_url: self.display_url.unwrap_or_else(|| self.url.clone()),
            request_url: self.id,
            site_url: self.url,
            title: self.title,
            description: self.description,
            icon_url,
            icon: None,
            rank: self.rank,
            group_id: self.group,
            latency_ms,
        }
    }
}

/// Resolves a possibly relative icon reference against the site URL.
/// Sites that name no icon get the conventional favicon path.
pub fn absolute_icon_url(site_url: &str, icon: Option<&str>) -> Option<String> {
    let icon = icon.map(str::trim).filter(|icon| !icon.is_empty()).unwrap_or(DEFAULT_ICON_PATH);
    if icon.starts_with("http://") || icon.starts_with("https://") {
        return Some(icon.to_string());
    }
    let base = Url::parse(site_url).ok()?;
    base.join(icon).ok().map(String::from)
}
