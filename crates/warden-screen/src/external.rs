//! HTTP-backed external moderation capability.
//!
//! Implements [`ModerationProvider`] against a hosted classification endpoint
//! that scores text across content categories. The content screen treats this
//! capability as advisory: when it is unreachable the screen degrades to its
//! local pattern tables.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use warden_types::errors::WardenError;
use warden_types::traits::ModerationProvider;
use warden_types::ExternalFlag;

/// Connection and response budget for one classification call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// External moderation provider backed by an HTTP classification endpoint.
pub struct HttpModerationProvider {
    /// HTTP client for API requests.
    client: Client,
    /// Classification endpoint URL.
    endpoint: String,
    /// Optional bearer token.
    api_key: Option<String>,
}

// -- Classification API request/response types --

/// Request body for the classification endpoint.
#[derive(Debug, Serialize)]
struct ClassifyRequest<'a> {
    input: &'a str,
}

/// Response from the classification endpoint.
#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    results: Vec<ClassifyResult>,
}

/// One scored result in the response.
#[derive(Debug, Deserialize)]
struct ClassifyResult {
    category_scores: std::collections::HashMap<String, f64>,
}

impl HttpModerationProvider {
    /// Create a provider for the given endpoint.
    pub fn new(endpoint: String, api_key: Option<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            endpoint,
            api_key,
        }
    }

    /// Flatten response results into flags, keeping the max score per category.
    fn parse_response(resp: ClassifyResponse) -> Vec<ExternalFlag> {
        let mut scores: std::collections::HashMap<String, f64> = std::collections::HashMap::new();
        for result in resp.results {
            for (category, score) in result.category_scores {
                let entry = scores.entry(category).or_insert(0.0);
                if score > *entry {
                    *entry = score;
                }
            }
        }

        let mut flags: Vec<ExternalFlag> = scores
            .into_iter()
            .map(|(category, score)| ExternalFlag { category, score })
            .collect();
        flags.sort_by(|a, b| b.score.total_cmp(&a.score));
        flags
    }
}

#[async_trait]
impl ModerationProvider for HttpModerationProvider {
    /// Score text against the classification endpoint.
    async fn classify(&self, text: &str) -> Result<Vec<ExternalFlag>, WardenError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .json(&ClassifyRequest { input: text });

        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| WardenError::Moderation(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WardenError::Moderation(format!(
                "classification endpoint error (HTTP {status}): {body}"
            )));
        }

        let resp_body: ClassifyResponse = response
            .json()
            .await
            .map_err(|e| WardenError::Moderation(format!("failed to parse response: {e}")))?;

        Ok(Self::parse_response(resp_body))
    }
}
