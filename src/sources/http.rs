use super::{FetchContext, SourceError};
use anyhow::{Context, Error};
use reqwest::header::{ACCEPT, CONTENT_LENGTH};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::*;

const USER_AGENT: &str = "AllDownloads/1.0 (+https://github.com/alldownloads/alldownloads)";
const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

/// Shared HTTP client for all sources. Every request races the fetch context.
#[derive(Clone, Debug)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .context("failed to build HTTP client")?;
        Ok(HttpClient { client })
    }

    async fn send(
        &self,
        cx: &FetchContext,
        url: &str,
        request: RequestBuilder,
    ) -> Result<Response, SourceError> {
        let response = cx
            .run(async {
                request.send().await.map_err(|source| SourceError::Http {
                    url: url.to_owned(),
                    source,
                })
            })
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                url: url.to_owned(),
                status,
            });
        }
        Ok(response)
    }

    pub async fn get_text(&self, cx: &FetchContext, url: &str) -> Result<String, SourceError> {
        let request = self.client.get(url).header(ACCEPT, ACCEPT_HTML);
        let response = self.send(cx, url, request).await?;
        cx.run(async {
            response.text().await.map_err(|source| SourceError::Http {
                url: url.to_owned(),
                source,
            })
        })
        .await
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        cx: &FetchContext,
        url: &str,
    ) -> Result<T, SourceError> {
        let request = self.client.get(url).header(ACCEPT, "application/json");
        let response = self.send(cx, url, request).await?;
        let body = cx
            .run(async {
                response.bytes().await.map_err(|source| SourceError::Http {
                    url: url.to_owned(),
                    source,
                })
            })
            .await?;
        serde_json::from_slice(&body).map_err(|err| SourceError::Parse {
            what: "JSON response",
            reason: format!("{url}: {err}"),
        })
    }

    /// HEAD request; redirects are followed so `Response::url` is the final location.
    pub async fn head(&self, cx: &FetchContext, url: &str) -> Result<Response, SourceError> {
        let request = self.client.head(url);
        self.send(cx, url, request).await
    }

    /// Size advertised by a HEAD request, or 0 when it cannot be determined.
    pub async fn content_length(&self, cx: &FetchContext, url: &str) -> i64 {
        match self.head(cx, url).await {
            Ok(response) => header_length(&response).unwrap_or(0),
            Err(err) => {
                debug!(message = "Could not determine file size", url, error = %err);
                0
            }
        }
    }
}

pub(crate) fn header_length(response: &Response) -> Option<i64> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

/// Last path segment of `url` without its query string.
pub fn extract_filename(url: &str) -> String {
    let path = url.split(|c: char| c == '?' || c == '#').next().unwrap_or(url);
    match path.rsplit('/').next() {
        Some(name) if !name.is_empty() => name.to_owned(),
        _ => "download".to_owned(),
    }
}

/// Looks `filename` up in a `SHA256SUMS`-style listing.
pub fn find_checksum(sums: &str, filename: &str) -> Option<String> {
    sums.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let digest = fields.next()?;
        let name = fields.next()?.trim_start_matches('*');
        (name == filename).then(|| digest.to_owned())
    })
}
