//! `pipemill submit <seed-file>` — upload a seed through the API.

use anyhow::{bail, Context};
use std::path::Path;

pub async fn submit(api_url: &str, seed_file: &Path) -> anyhow::Result<()> {
    let body = std::fs::read(seed_file)
        .with_context(|| format!("read seed file {}", seed_file.display()))?;

    let response = reqwest::Client::new()
        .post(format!("{api_url}/api/upload/seed"))
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await
        .with_context(|| format!("reach {api_url}"))?;

    let status = response.status();
    let payload: serde_json::Value = response.json().await.unwrap_or_default();

    if status.is_success() && payload["ok"] == true {
        println!(
            "submitted job {} ({})",
            payload["data"]["jobId"].as_str().unwrap_or("?"),
            payload["data"]["name"].as_str().unwrap_or("?"),
        );
        Ok(())
    } else {
        let message = payload["message"].as_str().unwrap_or("upload failed");
        bail!("{message} ({status})");
    }
}
