//! `pipemill status [jobId]` — job list or one job's task table.

use anyhow::{bail, Context};
use serde_json::Value;

pub async fn status(api_url: &str, job_id: Option<&str>) -> anyhow::Result<()> {
    match job_id {
        None => list(api_url).await,
        Some(job_id) => detail(api_url, job_id).await,
    }
}

async fn fetch(url: &str) -> anyhow::Result<Value> {
    let response = reqwest::Client::new()
        .get(url)
        .send()
        .await
        .with_context(|| format!("reach {url}"))?;
    let status = response.status();
    let payload: Value = response.json().await.unwrap_or_default();
    if !status.is_success() || payload["ok"] != true {
        let message = payload["message"].as_str().unwrap_or("request failed");
        bail!("{message} ({status})");
    }
    Ok(payload["data"].clone())
}

async fn list(api_url: &str) -> anyhow::Result<()> {
    let jobs = fetch(&format!("{api_url}/api/jobs")).await?;
    let jobs = jobs.as_array().cloned().unwrap_or_default();
    if jobs.is_empty() {
        println!("no jobs");
        return Ok(());
    }

    println!("{:<16} {:<10} {:>9} {:<10} NAME", "JOB", "STATUS", "PROGRESS", "CATEGORY");
    for job in jobs {
        let progress = job["progress"]
            .as_u64()
            .map(|p| format!("{p}%"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<16} {:<10} {:>9} {:<10} {}",
            job["id"].as_str().unwrap_or("?"),
            job["status"].as_str().unwrap_or("?"),
            progress,
            job["displayCategory"].as_str().unwrap_or("?"),
            job["name"].as_str().unwrap_or(""),
        );
    }
    Ok(())
}

async fn detail(api_url: &str, job_id: &str) -> anyhow::Result<()> {
    let job = fetch(&format!("{api_url}/api/jobs/{job_id}")).await?;

    println!(
        "{} ({}) pipeline={} status={} location={}",
        job["id"].as_str().unwrap_or("?"),
        job["name"].as_str().unwrap_or(""),
        job["pipeline"].as_str().unwrap_or("?"),
        job["status"].as_str().unwrap_or("?"),
        job["location"].as_str().unwrap_or("?"),
    );

    let Some(tasks) = job["tasksStatus"].as_object() else {
        return Ok(());
    };
    println!("{:<20} {:<10} {:<18} {:>8}", "TASK", "STATE", "STAGE", "ATTEMPTS");
    for (task_id, task) in tasks {
        let stage = task["currentStage"]
            .as_str()
            .or_else(|| task["failedStage"].as_str())
            .unwrap_or("-");
        println!(
            "{:<20} {:<10} {:<18} {:>8}",
            task_id,
            task["state"].as_str().unwrap_or("?"),
            stage,
            task["attempts"].as_u64().unwrap_or(0),
        );
        if let Some(message) = task["error"]["message"].as_str() {
            println!("    error: {message}");
        }
    }
    Ok(())
}
