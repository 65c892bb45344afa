//! Bounded image download for `/predict-url`.

use futures::StreamExt;
use reqwest::{header, Client, Url};
use std::time::Duration;

use crate::config::ServiceConfig;
use crate::error::FetchError;

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const ACCEPT: &str = "image/avif,image/webp,image/apng,image/svg+xml,image/*,*/*;q=0.8";

/// A fetched image and the content type the server reported for it.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Debug, Clone)]
pub struct ImageFetcher {
    client: Client,
    max_bytes: usize,
}

impl ImageFetcher {
    pub fn new(timeout: Duration, max_bytes: usize, use_system_proxy: bool) -> Result<Self, FetchError> {
        let mut builder = Client::builder().timeout(timeout).user_agent(USER_AGENT);
        if !use_system_proxy {
            builder = builder.no_proxy();
        }
        Ok(Self {
            client: builder.build()?,
            max_bytes,
        })
    }

    pub fn from_config(cfg: &ServiceConfig) -> Result<Self, FetchError> {
        Self::new(cfg.fetch_timeout(), cfg.max_url_bytes, cfg.fetch_use_system_proxy)
    }

    pub async fn fetch(&self, raw_url: &str) -> Result<FetchedImage, FetchError> {
        let url = parse_url(raw_url)?;

        let resp = self
            .client
            .get(url.clone())
            .header(header::ACCEPT, ACCEPT)
            .header(header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .header(header::REFERER, url.as_str())
            .send()
            .await?
            .error_for_status()?;

        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.starts_with("image/") {
            return Err(FetchError::NotAnImage(content_type));
        }

        if let Some(len) = resp.content_length() {
            if len > self.max_bytes as u64 {
                return Err(FetchError::TooLarge { limit: self.max_bytes });
            }
        }

        let mut bytes = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if bytes.len() + chunk.len() > self.max_bytes {
                return Err(FetchError::TooLarge { limit: self.max_bytes });
            }
            bytes.extend_from_slice(&chunk);
        }

        tracing::info!("fetched {} bytes ({}) from {}", bytes.len(), content_type, url);
        Ok(FetchedImage { bytes, content_type })
    }
}

fn parse_url(raw: &str) -> Result<Url, FetchError> {
    let url = Url::parse(raw.trim()).map_err(|e| FetchError::InvalidUrl(format!("{}: {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(FetchError::InvalidUrl(format!("unsupported scheme {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_http_urls_are_accepted() {
        assert!(parse_url("https://example.com/car.jpg").is_ok());
        assert!(parse_url(" http://example.com/car.jpg ").is_ok());
        assert!(matches!(parse_url("file:///etc/passwd"), Err(FetchError::InvalidUrl(_))));
        assert!(matches!(parse_url("not a url"), Err(FetchError::InvalidUrl(_))));
    }

    #[test]
    fn too_large_message_names_the_limit() {
        let e = FetchError::TooLarge { limit: 10 * 1024 * 1024 };
        assert_eq!(e.to_string(), "Image file too large (max 10MB)");
        let e = FetchError::TooLarge { limit: 1024 };
        assert_eq!(e.to_string(), "Image file too large (max 1KB)");
    }
}
