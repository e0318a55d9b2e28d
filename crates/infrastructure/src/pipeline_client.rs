use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use forestshield_core::{MonitoringError, MonitoringResult, PipelineConfig};
use forestshield_domain::ports::{AnalysisOutcome, AnalysisPipeline, AnalysisRequest};

/// HTTP client for the external satellite-image analysis pipeline.
///
/// The pipeline (lambda-backed NDVI analysis) is an external collaborator:
/// this client only speaks its JSON contract. Transport and domain errors
/// both surface as `MonitoringError::Pipeline` and are retried by the job
/// queue within its attempt budget.
pub struct HttpAnalysisPipeline {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAnalysisPipeline {
    pub fn new(config: &PipelineConfig, endpoint: String) -> MonitoringResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| MonitoringError::Pipeline(format!("failed to build http client: {e}")))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl AnalysisPipeline for HttpAnalysisPipeline {
    async fn analyze(&self, request: AnalysisRequest) -> MonitoringResult<AnalysisOutcome> {
        debug!(
            "requesting analysis for ({}, {}) window {}..{}",
            request.latitude, request.longitude, request.start_date, request.end_date
        );

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| MonitoringError::Pipeline(format!("pipeline request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(MonitoringError::Pipeline(format!(
                "pipeline returned status {}",
                response.status()
            )));
        }

        let outcome: AnalysisOutcome = response
            .json()
            .await
            .map_err(|e| MonitoringError::Pipeline(format!("invalid pipeline response: {e}")))?;

        debug!(
            "analysis done: {:.2}% deforestation across {} images in {}ms",
            outcome.deforestation_percentage, outcome.images_found, outcome.processing_time_ms
        );
        Ok(outcome)
    }
}

/// Stand-in pipeline for deployments without a configured endpoint.
///
/// Always reports zero deforestation so scheduling, retries and event flow
/// stay exercisable without the imaging stack.
pub struct StubAnalysisPipeline;

#[async_trait]
impl AnalysisPipeline for StubAnalysisPipeline {
    async fn analyze(&self, request: AnalysisRequest) -> MonitoringResult<AnalysisOutcome> {
        warn!(
            "no pipeline endpoint configured, returning stub result for ({}, {})",
            request.latitude, request.longitude
        );
        Ok(AnalysisOutcome {
            deforestation_percentage: 0.0,
            images_found: 0,
            processing_time_ms: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[tokio::test]
    async fn test_stub_pipeline_reports_zero() {
        let pipeline = StubAnalysisPipeline;
        let outcome = pipeline
            .analyze(AnalysisRequest {
                latitude: -3.0,
                longitude: -60.0,
                start_date: NaiveDate::from_ymd_opt(2026, 7, 1).unwrap(),
                end_date: NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
                cloud_cover_max: 20.0,
            })
            .await
            .unwrap();
        assert_eq!(outcome.deforestation_percentage, 0.0);
        assert_eq!(outcome.images_found, 0);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_pipeline_error() {
        let config = PipelineConfig {
            endpoint: None,
            request_timeout_seconds: 1,
        };
        let pipeline =
            HttpAnalysisPipeline::new(&config, "http://127.0.0.1:1/analyze".to_string()).unwrap();
        let err = pipeline
            .analyze(AnalysisRequest {
                latitude: 0.0,
                longitude: 0.0,
                start_date: NaiveDate::from_ymd_opt(2026, 7, 1).unwrap(),
                end_date: NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
                cloud_cover_max: 20.0,
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
