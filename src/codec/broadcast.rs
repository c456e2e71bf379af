//! Preparing a URL for broadcast. Shortening and the beacon write itself are
//! done by collaborators outside this crate.

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{encode, encoded_len, CodecError, MAX_URI_BYTES};

#[async_trait]
pub trait UrlShortener: Send + Sync {
    async fn shorten(&self, url: &str) -> Result<String>;
}

/// Receives the final URL to write onto a beacon. Connection handling and
/// the chunked write protocol live behind this trait.
#[async_trait]
pub trait BeaconWriter: Send + Sync {
    async fn write_url(&self, url: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedUrl {
    pub original: String,
    /// URL that is actually broadcast; differs from `original` when shortened.
    pub url: String,
    pub payload: Vec<u8>,
}

impl PreparedUrl {
    pub fn was_shortened(&self) -> bool {
        self.original != self.url
    }
}

/// Encodes `url` directly when it fits, otherwise asks the shortener first.
pub async fn prepare_broadcast(url: &str, shortener: &dyn UrlShortener) -> Result<PreparedUrl> {
    let broadcast_url = match encoded_len(url) {
        Some(len) if len <= MAX_URI_BYTES => url.to_string(),
        Some(len) => {
            log::debug!("{url} encodes to {len} bytes, shortening");
            shortener
                .shorten(url)
                .await
                .with_context(|| format!("failed to shorten {url}"))?
        }
        None => {
            // Surface the precise reason the URL cannot be encoded.
            return Err(encode(url).err().unwrap_or(CodecError::UnknownScheme))
                .with_context(|| format!("cannot broadcast {url}"));
        }
    };

    let payload =
        encode(&broadcast_url).with_context(|| format!("shortened url {broadcast_url} still too long"))?;

    Ok(PreparedUrl {
        original: url.to_string(),
        url: broadcast_url,
        payload,
    })
}

/// Prepares `url` and hands the result to the beacon writer.
pub async fn configure_beacon(
    url: &str,
    shortener: &dyn UrlShortener,
    writer: &dyn BeaconWriter,
) -> Result<PreparedUrl> {
    let prepared = prepare_broadcast(url, shortener).await?;
    writer
        .write_url(&prepared.url)
        .await
        .context("beacon write failed")?;
    Ok(prepared)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct FixedShortener(&'static str);

    #[async_trait]
    impl UrlShortener for FixedShortener {
        async fn shorten(&self, _url: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[derive(Default)]
    struct RecordingWriter {
        written: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BeaconWriter for RecordingWriter {
        async fn write_url(&self, url: &str) -> Result<()> {
            self.written.lock().unwrap().push(url.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn short_urls_skip_the_shortener() {
        let shortener = FixedShortener("https://goo.gl/unused");
        let prepared = prepare_broadcast("https://example.com", &shortener).await.unwrap();
        assert_eq!(prepared.url, "https://example.com");
        assert!(!prepared.was_shortened());
    }

    #[tokio::test]
    async fn long_urls_are_shortened_then_written() {
        let shortener = FixedShortener("https://goo.gl/abc");
        let writer = RecordingWriter::default();
        let long = "https://www.example.com/a/very/long/path/that/cannot/fit";

        let prepared = configure_beacon(long, &shortener, &writer).await.unwrap();

        assert!(prepared.was_shortened());
        assert_eq!(prepared.payload, encode("https://goo.gl/abc").unwrap());
        assert_eq!(*writer.written.lock().unwrap(), vec!["https://goo.gl/abc".to_string()]);
    }

    #[tokio::test]
    async fn unusable_shortener_output_is_an_error() {
        let shortener = FixedShortener("https://still.far.too.long.example/path/more");
        let long = "https://www.example.com/a/very/long/path/that/cannot/fit";
        assert!(prepare_broadcast(long, &shortener).await.is_err());
        assert!(prepare_broadcast("ftp://example.com", &shortener).await.is_err());
    }
}
