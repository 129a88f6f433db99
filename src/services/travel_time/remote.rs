//! Remote routing service client
//!
//! Speaks a sources-to-targets table protocol: one POST with the distinct
//! coordinates involved, one duration matrix back.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::TravelTimeProvider;
use crate::types::Coordinates;

/// Remote routing client configuration
#[derive(Debug, Clone)]
pub struct RemoteRoutingConfig {
    /// Base URL of the routing service (health checks)
    pub base_url: String,
    /// Full URL of the table endpoint
    pub table_url: String,
    /// Per-request timeout in seconds
    pub timeout_seconds: u64,
}

impl RemoteRoutingConfig {
    pub fn new(base_url: impl Into<String>, table_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            table_url: table_url.into(),
            timeout_seconds: 5,
        }
    }
}

/// HTTP client for the external routing service
pub struct RemoteRoutingClient {
    client: Client,
    config: RemoteRoutingConfig,
}

impl RemoteRoutingClient {
    pub fn new(config: RemoteRoutingConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self { client, config })
    }

    fn build_table_request(pairs: &[(Coordinates, Coordinates)]) -> (TableRequest, Vec<(usize, usize)>) {
        // Distinct coordinates, preserving first-seen order
        let mut locations: Vec<TableLocation> = Vec::new();
        let index_of = |locations: &mut Vec<TableLocation>, c: &Coordinates| {
            if let Some(i) = locations
                .iter()
                .position(|l| l.lat == c.lat && l.lng == c.lng)
            {
                i
            } else {
                locations.push(TableLocation { lat: c.lat, lng: c.lng });
                locations.len() - 1
            }
        };

        let cells: Vec<(usize, usize)> = pairs
            .iter()
            .map(|(from, to)| {
                let i = index_of(&mut locations, from);
                let j = index_of(&mut locations, to);
                (i, j)
            })
            .collect();

        (
            TableRequest {
                sources: locations.clone(),
                targets: locations,
                units: "minutes".to_string(),
            },
            cells,
        )
    }
}

#[async_trait]
impl TravelTimeProvider for RemoteRoutingClient {
    async fn fetch_minutes(&self, pairs: &[(Coordinates, Coordinates)]) -> Result<Vec<f64>> {
        if pairs.is_empty() {
            return Ok(vec![]);
        }

        let (request, cells) = Self::build_table_request(pairs);

        debug!(
            locations = request.sources.len(),
            pairs = pairs.len(),
            "requesting travel-time table"
        );

        let response = self
            .client
            .post(&self.config.table_url)
            .json(&request)
            .send()
            .await
            .context("failed to reach routing service")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("routing service returned {}: {}", status, body);
        }

        let table: TableResponse = response
            .json()
            .await
            .context("failed to parse routing service response")?;

        let n = table.durations.len();
        cells
            .iter()
            .map(|&(i, j)| {
                table
                    .durations
                    .get(i)
                    .and_then(|row| row.get(j))
                    .and_then(|cell| *cell)
                    .ok_or_else(|| {
                        anyhow::anyhow!("missing duration for cell ({}, {}) in {}x{} table", i, j, n, n)
                    })
            })
            .collect()
    }

    fn name(&self) -> &str {
        "remote"
    }
}

/// Check the routing service before first use
pub async fn check_remote_health(base_url: &str) -> Result<()> {
    let client = Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()?;

    let url = format!("{}/status", base_url.trim_end_matches('/'));
    let response = client.get(&url).send().await?;

    if response.status().is_success() {
        Ok(())
    } else {
        anyhow::bail!("routing service returned status {}", response.status())
    }
}

// Table API types

#[derive(Debug, Clone, Serialize)]
struct TableLocation {
    lat: f64,
    lng: f64,
}

#[derive(Debug, Serialize)]
struct TableRequest {
    sources: Vec<TableLocation>,
    targets: Vec<TableLocation>,
    units: String,
}

#[derive(Debug, Deserialize)]
struct TableResponse {
    /// Row-major duration matrix in minutes; null cells mean unroutable
    durations: Vec<Vec<Option<f64>>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RemoteRoutingConfig {
        RemoteRoutingConfig::new("http://localhost:5000", "http://localhost:5000/table")
    }

    #[test]
    fn test_config_defaults() {
        let config = config();
        assert_eq!(config.timeout_seconds, 5);
        assert_eq!(config.table_url, "http://localhost:5000/table");
    }

    #[test]
    fn test_build_table_request_deduplicates_locations() {
        let a = Coordinates { lat: 40.0, lng: -3.7 };
        let b = Coordinates { lat: 40.1, lng: -3.8 };
        let c = Coordinates { lat: 40.2, lng: -3.9 };

        let (request, cells) = RemoteRoutingClient::build_table_request(&[(a, b), (b, c), (a, c)]);

        assert_eq!(request.sources.len(), 3);
        assert_eq!(request.targets.len(), 3);
        assert_eq!(cells, vec![(0, 1), (1, 2), (0, 2)]);
    }

    #[test]
    fn test_table_response_parses_null_cells() {
        let json = r#"{ "durations": [[0.0, 12.5], [null, 0.0]] }"#;
        let table: TableResponse = serde_json::from_str(json).unwrap();
        assert_eq!(table.durations[0][1], Some(12.5));
        assert_eq!(table.durations[1][0], None);
    }

    #[tokio::test]
    #[ignore = "Requires running routing service"]
    async fn test_remote_integration() {
        let client = RemoteRoutingClient::new(config()).unwrap();
        let a = Coordinates { lat: 40.4168, lng: -3.7038 };
        let b = Coordinates { lat: 40.45, lng: -3.69 };

        let minutes = client.fetch_minutes(&[(a, b)]).await.unwrap();
        assert_eq!(minutes.len(), 1);
        assert!(minutes[0] > 0.0);
    }
}
