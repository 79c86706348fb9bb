//! # Heartbeat Reporter — Node → Controller Status Push
//!
//! Every interval the reporter snapshots workload states and system
//! metrics and POSTs them to the controller's heartbeat endpoint. Failures
//! are logged and swallowed; the next interval is the retry.

use std::time::Duration;

use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use sysinfo::System;
use tracing::{info, warn};

use crate::config::daemon::FleetConfig;
use crate::fleet::{HeartbeatPayload, WorkloadInfo};
use crate::metrics;
use crate::orchestrator::OrchestratorHandle;

pub struct HeartbeatReporter {
    handle: OrchestratorHandle,
    client: reqwest::Client,
    url: String,
    client_name: String,
    interval: Duration,
    sys: System,
}

impl HeartbeatReporter {
    /// Returns `None` when no central URL is configured.
    pub fn new(handle: OrchestratorHandle, config: &FleetConfig) -> Option<Self> {
        let central = config.central_api_url.as_deref()?;
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.api_token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Some(HeartbeatReporter {
            handle,
            client,
            url: format!("{}/api/heartbeat", central.trim_end_matches('/')),
            client_name: config
                .client_name
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            interval: Duration::from_secs_f64(config.heartbeat_interval_seconds.max(1.0)),
            sys: System::new(),
        })
    }

    /// Report loop; runs until the task is cancelled at shutdown.
    pub async fn run(mut self) {
        info!(url = %self.url, interval_secs = self.interval.as_secs_f64(), "heartbeat reporter started");
        loop {
            self.send_heartbeat().await;
            tokio::time::sleep(self.interval).await;
        }
    }

    async fn send_heartbeat(&mut self) {
        let payload = self.build_payload().await;
        match self.client.post(&self.url).json(&payload).send().await {
            Ok(response) if !response.status().is_success() => {
                warn!(status = response.status().as_u16(), url = %self.url, "heartbeat rejected");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "heartbeat failed"),
        }
    }

    async fn build_payload(&mut self) -> HeartbeatPayload {
        let states = self.handle.list_workloads().await;
        HeartbeatPayload {
            client_name: self.client_name.clone(),
            timestamp: Utc::now().to_rfc3339(),
            deployed_version: self.handle.deployed_version().await,
            workloads: states.iter().map(WorkloadInfo::from).collect(),
            system: metrics::collect(&mut self.sys),
        }
    }
}
