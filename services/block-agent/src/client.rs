//! Scheduler API client.
//!
//! Implements [`Scheduler`] over the scheduler's HTTP API:
//! - `POST /v1/blocks/{block}/boot`
//! - `POST /v1/blocks/{block}/occupancy`
//! - `POST /v1/blocks/{block}/error`
//! - `POST /v1/jobs/{job}/requeue`
//! - `POST /v1/jobs/{job}/kill`
//! - `POST /v1/jobs/{job}/configuring`

use std::time::Duration;

use async_trait::async_trait;
use bgwatch_id::{BlockName, JobId, UserName};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::scheduler::{Scheduler, SchedulerError};

/// Scheduler API client.
pub struct SchedulerClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct BootRequest<'a> {
    user: Option<&'a UserName>,
}

#[derive(Debug, Serialize)]
struct RequeueRequest<'a> {
    block: &'a BlockName,
    reason: &'a str,
}

#[derive(Debug, Serialize)]
struct OccupancyRequest<'a> {
    user: &'a UserName,
}

#[derive(Debug, Serialize)]
struct ConfiguringRequest {
    configuring: bool,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct BlockErrorRequest {
    observed_at: DateTime<Utc>,
}

impl SchedulerClient {
    /// Create a new scheduler client.
    pub fn new(config: &Config) -> Result<Self, SchedulerError> {
        Self::with_base_url(&config.scheduler_url)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self, SchedulerError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SchedulerError::Unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        operation: &'static str,
        path: &str,
        body: &B,
    ) -> Result<(), SchedulerError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, operation, "Calling scheduler");

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| SchedulerError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, operation, "Scheduler rejected request");
            return Err(SchedulerError::Rejected {
                operation,
                message: format!("{status} - {body}"),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl Scheduler for SchedulerClient {
    async fn boot_block(
        &self,
        block: &BlockName,
        user: Option<&UserName>,
    ) -> Result<(), SchedulerError> {
        self.post(
            "boot",
            &format!("/v1/blocks/{block}/boot"),
            &BootRequest { user },
        )
        .await
    }

    async fn requeue_job(
        &self,
        job_id: JobId,
        block: &BlockName,
        reason: &str,
    ) -> Result<(), SchedulerError> {
        self.post(
            "requeue",
            &format!("/v1/jobs/{job_id}/requeue"),
            &RequeueRequest { block, reason },
        )
        .await
    }

    async fn kill_job(&self, job_id: JobId) -> Result<(), SchedulerError> {
        self.post("kill", &format!("/v1/jobs/{job_id}/kill"), &serde_json::json!({}))
            .await
    }

    async fn assign_occupancy(
        &self,
        block: &BlockName,
        user: &UserName,
    ) -> Result<(), SchedulerError> {
        self.post(
            "assign",
            &format!("/v1/blocks/{block}/occupancy"),
            &OccupancyRequest { user },
        )
        .await
    }

    async fn signal_block_error(&self, block: &BlockName) {
        let request = BlockErrorRequest {
            observed_at: Utc::now(),
        };
        if let Err(e) = self
            .post("block_error", &format!("/v1/blocks/{block}/error"), &request)
            .await
        {
            warn!(block = %block, error = %e, "Failed to report block error");
        }
    }

    async fn set_job_configuring(&self, job_id: JobId, configuring: bool) {
        let request = ConfiguringRequest {
            configuring,
            updated_at: Utc::now(),
        };
        if let Err(e) = self
            .post("configuring", &format!("/v1/jobs/{job_id}/configuring"), &request)
            .await
        {
            warn!(job_id = %job_id, error = %e, "Failed to update job configuring state");
        }
    }
}
