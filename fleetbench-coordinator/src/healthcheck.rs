//! Probing the health of a worker server.

use anyhow::{Context, Result};

use crate::config::Config;
use crate::web::HEALTH_PATH;

/// Probes a worker server.
///
/// Probes `endpoint` if given, otherwise the worker at the configured `http_addr`.
pub async fn healthcheck(config: &Config, endpoint: Option<&str>) -> Result<()> {
    let base = match endpoint {
        Some(endpoint) => endpoint.trim_end_matches('/').to_owned(),
        None => format!("http://{}", config.http_addr),
    };
    let url = format!("{base}/{HEALTH_PATH}");

    tracing::debug!(%url, "sending healthcheck request");
    let response = reqwest::Client::new()
        .get(&url)
        .send()
        .await
        .with_context(|| format!("worker at {base} is not reachable"))?;
    if !response.status().is_success() {
        anyhow::bail!("worker at {base} returned {}", response.status());
    }

    tracing::info!(worker = %base, "OK");
    Ok(())
}
