//! Shared HTTP plumbing for the REST pollers

use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;

use kimp_core::{PriceFeedError, PriceFeedResult};

const USER_AGENT: &str = concat!("kimp-price-feed/", env!("CARGO_PKG_VERSION"));
const MAX_ERROR_BODY: usize = 256;

/// Client with an explicit request timeout so a hung upstream cannot stall a poll task
pub fn build_client(timeout: Duration) -> PriceFeedResult<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| PriceFeedError::Config(format!("http client: {}", e)))
}

/// GET `url` and decode the body as JSON
pub async fn get_json<T: DeserializeOwned>(
    client: &Client,
    url: &str,
    query: &[(&str, String)],
) -> PriceFeedResult<T> {
    let response = client
        .get(url)
        .query(query)
        .header("accept", "application/json")
        .send()
        .await
        .map_err(map_reqwest_error)?;

    let status = response.status();
    let body = response.text().await.map_err(map_reqwest_error)?;

    if !status.is_success() {
        return Err(PriceFeedError::UpstreamStatus {
            status: status.as_u16(),
            body: truncate(&body),
        });
    }

    serde_json::from_str(&body).map_err(|e| {
        PriceFeedError::InvalidMessage(format!("{} in {}", e, truncate(&body)))
    })
}

pub fn map_reqwest_error(e: reqwest::Error) -> PriceFeedError {
    if e.is_timeout() {
        PriceFeedError::Network(format!("timeout: {}", e))
    } else if let Some(status) = e.status() {
        PriceFeedError::UpstreamStatus {
            status: status.as_u16(),
            body: e.to_string(),
        }
    } else if e.is_decode() {
        PriceFeedError::InvalidMessage(e.to_string())
    } else {
        PriceFeedError::Network(e.to_string())
    }
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}
