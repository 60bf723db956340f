//! A2: HTTP Fetcher — bounded-retry GET/POST shared by OCSP (C3) and RIM
//! (C4) transport.
//!
//! Fallback-after-primary-exhausted is the caller's responsibility (§9:
//! "fallback URL attempted exactly once after primary is exhausted"); this
//! module only owns the retry loop against a single URL.

use std::time::Duration;

use thiserror::Error;

pub const OCSP_RETRY_COUNT: u32 = 3;
pub const RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("URL must be https: {0}")]
    NotHttps(String),
    #[error("request failed after {attempts} attempts: {last_error}")]
    ExhaustedRetries { attempts: u32, last_error: String },
}

pub struct HttpFetcher {
    client: reqwest::Client,
    retries: u32,
    retry_delay: Duration,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
            retries: OCSP_RETRY_COUNT,
            retry_delay: RETRY_DELAY,
        }
    }
}

impl HttpFetcher {
    pub fn with_retries(retries: u32, retry_delay: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            retries,
            retry_delay,
        }
    }

    pub async fn post(&self, url: &str, body: Vec<u8>, content_type: &str) -> Result<Vec<u8>, FetchError> {
        require_https(url)?;
        let mut last_error = String::new();
        for attempt in 0..=self.retries {
            match self
                .client
                .post(url)
                .header("Content-Type", content_type)
                .body(body.clone())
                .send()
                .await
            {
                Ok(resp) => match resp.bytes().await {
                    Ok(bytes) => return Ok(bytes.to_vec()),
                    Err(e) => last_error = e.to_string(),
                },
                Err(e) => last_error = e.to_string(),
            }
            if attempt < self.retries {
                tokio::time::sleep(self.retry_delay).await;
            }
        }
        Err(FetchError::ExhaustedRetries {
            attempts: self.retries + 1,
            last_error,
        })
    }

    pub async fn get(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        require_https(url)?;
        let mut last_error = String::new();
        for attempt in 0..=self.retries {
            match self.client.get(url).send().await {
                Ok(resp) => match resp.bytes().await {
                    Ok(bytes) => return Ok(bytes.to_vec()),
                    Err(e) => last_error = e.to_string(),
                },
                Err(e) => last_error = e.to_string(),
            }
            if attempt < self.retries {
                tokio::time::sleep(self.retry_delay).await;
            }
        }
        Err(FetchError::ExhaustedRetries {
            attempts: self.retries + 1,
            last_error,
        })
    }
}

fn require_https(url: &str) -> Result<(), FetchError> {
    if !url.starts_with("https://") {
        return Err(FetchError::NotHttps(url.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_https() {
        assert!(matches!(require_https("http://example.com"), Err(FetchError::NotHttps(_))));
        assert!(require_https("https://example.com").is_ok());
    }

    #[tokio::test]
    async fn test_post_rejects_non_https_without_network() {
        let fetcher = HttpFetcher::default();
        let err = fetcher.post("http://insecure.example.com", vec![], "application/ocsp-request").await;
        assert!(matches!(err, Err(FetchError::NotHttps(_))));
    }
}
