//! Process and host resource readings for the health endpoint.

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::fs;

/// Memory figures in bytes. Fields are absent where `/proc` is unavailable.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryUsage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rss_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rss_peak_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_total_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_available_bytes: Option<u64>,
}

#[derive(Debug, Clone)]
struct ProcessStatus {
    rss_bytes: u64,
    peak_bytes: Option<u64>,
}

#[derive(Debug, Clone)]
struct MemInfo {
    total_bytes: u64,
    available_bytes: u64,
}

pub async fn read_memory_usage() -> MemoryUsage {
    let mut usage = MemoryUsage::default();

    if let Ok(status) = read_process_status().await {
        usage.rss_bytes = Some(status.rss_bytes);
        usage.rss_peak_bytes = status.peak_bytes;
    }
    if let Ok(contents) = fs::read_to_string("/proc/meminfo").await
        && let Ok(info) = parse_meminfo(&contents)
    {
        usage.host_total_bytes = Some(info.total_bytes);
        usage.host_available_bytes = Some(info.available_bytes);
    }

    usage
}

async fn read_process_status() -> Result<ProcessStatus> {
    let contents = fs::read_to_string("/proc/self/status")
        .await
        .context("reading /proc/self/status")?;
    parse_process_status(&contents)
}

fn parse_process_status(contents: &str) -> Result<ProcessStatus> {
    let mut rss_kb = None;
    let mut peak_kb = None;

    for line in contents.lines() {
        if line.starts_with("VmRSS:") {
            rss_kb = parse_kb(line);
        } else if line.starts_with("VmHWM:") {
            peak_kb = parse_kb(line);
        }
    }

    let rss_kb = rss_kb.context("missing VmRSS in /proc/self/status")?;
    Ok(ProcessStatus {
        rss_bytes: rss_kb.saturating_mul(1024),
        peak_bytes: peak_kb.map(|kb| kb.saturating_mul(1024)),
    })
}

fn parse_meminfo(contents: &str) -> Result<MemInfo> {
    let mut total_kb = None;
    let mut available_kb = None;

    for line in contents.lines() {
        if line.starts_with("MemTotal:") {
            total_kb = parse_kb(line);
        } else if line.starts_with("MemAvailable:") {
            available_kb = parse_kb(line);
        }
    }

    let total_kb = total_kb.context("missing MemTotal in /proc/meminfo")?;
    let available_kb = available_kb.context("missing MemAvailable in /proc/meminfo")?;

    Ok(MemInfo {
        total_bytes: total_kb.saturating_mul(1024),
        available_bytes: available_kb.saturating_mul(1024),
    })
}

fn parse_kb(line: &str) -> Option<u64> {
    line.split_whitespace().nth(1)?.parse::<u64>().ok()
}
