//! Remote report store
//!
//! Defines the backend trait the sync core talks to, and the REST
//! implementation used in production.

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::types::{
    ApprovalRequest, DeclineRequest, Paginated, Report, ReportFilters, ReportPatch,
    ReportStatistics, StatisticsFilters,
};
use crate::config::ApiConfig;
use crate::error::{Result, SyncError};

/// Report backend trait
///
/// The backend is the single source of truth; every call either returns the
/// authoritative state or an error.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Fetch one page of reports matching the filters
    async fn list_reports(&self, filters: &ReportFilters) -> Result<Paginated<Report>>;

    /// Fetch aggregate counts
    async fn report_statistics(&self, filters: &StatisticsFilters) -> Result<ReportStatistics>;

    async fn approve_report(&self, report_id: &str, request: &ApprovalRequest) -> Result<Report>;

    async fn decline_report(&self, report_id: &str, request: &DeclineRequest) -> Result<Report>;

    async fn update_report(&self, report_id: &str, patch: &ReportPatch) -> Result<Report>;

    async fn delete_report(&self, report_id: &str) -> Result<()>;
}

/// REST client for the report backend
#[derive(Clone)]
pub struct HttpReportStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpReportStore {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn report_url(&self, report_id: &str, action: Option<&str>) -> String {
        let id = urlencoding::encode(report_id);
        match action {
            Some(action) => self.url(&format!("/reports/{}/{}", id, action)),
            None => self.url(&format!("/reports/{}", id)),
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Send a request and fail on any non-2xx status, keeping the body as message
    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = self.authorize(request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Api {
                status: status.as_u16(),
                message: if body.is_empty() {
                    status.to_string()
                } else {
                    body
                },
            });
        }

        Ok(response)
    }

    async fn execute_json<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = self.execute(request).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl ReportStore for HttpReportStore {
    async fn list_reports(&self, filters: &ReportFilters) -> Result<Paginated<Report>> {
        let request = self.client.get(self.url("/reports")).query(filters);
        self.execute_json(request).await
    }

    async fn report_statistics(&self, filters: &StatisticsFilters) -> Result<ReportStatistics> {
        let request = self.client.get(self.url("/reports/statistics")).query(filters);
        self.execute_json(request).await
    }

    async fn approve_report(&self, report_id: &str, request: &ApprovalRequest) -> Result<Report> {
        let url = self.report_url(report_id, Some("approve"));
        self.execute_json(self.client.post(url).json(request)).await
    }

    async fn decline_report(&self, report_id: &str, request: &DeclineRequest) -> Result<Report> {
        let url = self.report_url(report_id, Some("decline"));
        self.execute_json(self.client.post(url).json(request)).await
    }

    async fn update_report(&self, report_id: &str, patch: &ReportPatch) -> Result<Report> {
        let url = self.report_url(report_id, None);
        self.execute_json(self.client.put(url).json(patch)).await
    }

    async fn delete_report(&self, report_id: &str) -> Result<()> {
        let url = self.report_url(report_id, None);
        self.execute(self.client.delete(url)).await?;
        Ok(())
    }
}
