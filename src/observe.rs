//! Observability port.
//!
//! The scheduler opens one span per launch and closes it when the launch
//! settles; the reporter forwards the final summary. Where those go is
//! decided by the injected [`Observer`]:
//!
//! | Observer | Destination |
//! |----------|-------------|
//! | [`NoopObserver`] | nowhere (default) |
//! | [`TracingObserver`] | structured `tracing` events |
//! | [`HttpObserver`] | JSON POSTs to a collector endpoint |
//!
//! Forwarding is best effort. Observer errors are logged by the caller and
//! never affect scheduling or the exit status.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::aggregate::Report;
use crate::context::LaunchId;
use crate::outcome::{Outcome, duration_ms};

/// Result type for observer operations.
pub type ObserveResult<T> = Result<T, ObserveError>;

/// Errors from forwarding telemetry.
#[derive(Debug, thiserror::Error)]
pub enum ObserveError {
    #[error("Failed to reach collector: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Collector rejected submission: HTTP {0}")]
    Rejected(u16),

    #[error("Observer error: {0}")]
    Other(String),
}

/// Identity of one launch span.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanInfo {
    pub unit_id: String,
    pub attempt: u32,
    pub worker_ordinal: usize,
    pub launch_id: LaunchId,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
}

/// How a launch span ended.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanEnd {
    pub success: bool,
    pub status: &'static str,
    #[serde(with = "duration_ms")]
    pub duration_ms: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SpanEnd {
    pub fn from_outcome(outcome: &Outcome) -> Self {
        Self {
            success: outcome.is_success(),
            status: outcome.label(),
            duration_ms: outcome.duration(),
            error: outcome.error().map(|e| e.short_message().to_string()),
        }
    }
}

/// Receives spans and summaries from a run.
#[async_trait]
pub trait Observer: Send + Sync {
    /// A launch started.
    fn span_started(&self, _span: &SpanInfo) {}

    /// A launch settled. Called exactly once per launch.
    fn span_finished(&self, span: &SpanInfo, end: &SpanEnd) -> ObserveResult<()>;

    /// The run finished and its report was built.
    async fn record_summary(&self, report: &Report) -> ObserveResult<()>;

    /// Waits for in-flight submissions.
    async fn flush(&self) {}
}

/// An observer that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

#[async_trait]
impl Observer for NoopObserver {
    fn span_finished(&self, _span: &SpanInfo, _end: &SpanEnd) -> ObserveResult<()> {
        Ok(())
    }

    async fn record_summary(&self, _report: &Report) -> ObserveResult<()> {
        Ok(())
    }
}

/// An observer that turns spans and summaries into `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

#[async_trait]
impl Observer for TracingObserver {
    fn span_started(&self, span: &SpanInfo) {
        info!(
            target: "e2e::span",
            unit = %span.unit_id,
            attempt = span.attempt,
            worker = span.worker_ordinal,
            launch = span.launch_id,
            "span started"
        );
    }

    fn span_finished(&self, span: &SpanInfo, end: &SpanEnd) -> ObserveResult<()> {
        info!(
            target: "e2e::span",
            unit = %span.unit_id,
            attempt = span.attempt,
            worker = span.worker_ordinal,
            launch = span.launch_id,
            success = end.success,
            status = end.status,
            duration_ms = duration_ms::millis(end.duration_ms),
            "span finished"
        );
        Ok(())
    }

    async fn record_summary(&self, report: &Report) -> ObserveResult<()> {
        let summary = &report.summary;
        info!(
            target: "e2e::summary",
            run = %report.run_id,
            total = summary.total,
            passed = summary.passed,
            failed = summary.failed,
            flaky = summary.flaky,
            duration_ms = duration_ms::millis(summary.duration_ms),
            "run summary"
        );
        Ok(())
    }
}

/// An observer that POSTs spans and the summary to a collector.
///
/// Span submissions are fire-and-forget tasks tracked so that [`flush`]
/// can wait for them before the process exits.
///
/// [`flush`]: Observer::flush
pub struct HttpObserver {
    client: reqwest::Client,
    endpoint: String,
    service: String,
    tracker: TaskTracker,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpanPayload<'a> {
    service: &'a str,
    name: &'static str,
    #[serde(flatten)]
    span: &'a SpanInfo,
    #[serde(flatten)]
    end: &'a SpanEnd,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SummaryPayload<'a> {
    service: &'a str,
    run_id: &'a str,
    #[serde(flatten)]
    summary: &'a crate::aggregate::Summary,
    units: Vec<UnitTag<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UnitTag<'a> {
    unit_id: &'a str,
    success: bool,
    retry_count: u32,
    #[serde(with = "duration_ms")]
    duration_ms: Duration,
}

impl HttpObserver {
    /// Creates an observer posting to `endpoint` (e.g. `http://collector:8126/e2e`).
    pub fn new(endpoint: impl Into<String>, service: impl Into<String>) -> ObserveResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            service: service.into(),
            tracker: TaskTracker::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path)
    }
}

async fn post_json<T: Serialize + ?Sized>(
    client: &reqwest::Client,
    url: &str,
    body: &T,
) -> ObserveResult<()> {
    let response = client.post(url).json(body).send().await?;
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(ObserveError::Rejected(status.as_u16()))
    }
}

#[async_trait]
impl Observer for HttpObserver {
    fn span_finished(&self, span: &SpanInfo, end: &SpanEnd) -> ObserveResult<()> {
        let payload = SpanPayload {
            service: &self.service,
            name: "e2e.test",
            span,
            end,
        };
        let body = serde_json::to_value(&payload).map_err(|e| ObserveError::Other(e.to_string()))?;
        let client = self.client.clone();
        let url = self.url("spans");

        self.tracker.spawn(async move {
            if let Err(e) = post_json(&client, &url, &body).await {
                warn!("Failed to forward span to {}: {}", url, e);
            }
        });
        Ok(())
    }

    async fn record_summary(&self, report: &Report) -> ObserveResult<()> {
        let payload = SummaryPayload {
            service: &self.service,
            run_id: &report.run_id,
            summary: &report.summary,
            units: report
                .results
                .iter()
                .map(|r| UnitTag {
                    unit_id: &r.unit.id,
                    success: r.passed(),
                    retry_count: r.retry_count,
                    duration_ms: r.outcome.duration(),
                })
                .collect(),
        };
        post_json(&self.client, &self.url("summary"), &payload).await
    }

    async fn flush(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// A launch span owned by the scheduler.
///
/// [`finish`](Self::finish) consumes the span, so it cannot be closed twice.
pub struct LaunchSpan {
    info: SpanInfo,
    observer: Arc<dyn Observer>,
}

impl LaunchSpan {
    /// Opens a span and notifies the observer.
    pub fn start(observer: Arc<dyn Observer>, info: SpanInfo) -> Self {
        observer.span_started(&info);
        Self { info, observer }
    }

    /// Closes the span with the launch's outcome. Forwarding errors are logged.
    pub fn finish(self, outcome: &Outcome) {
        let end = SpanEnd::from_outcome(outcome);
        if let Err(e) = self.observer.span_finished(&self.info, &end) {
            warn!(
                "Failed to record span for {} attempt {}: {}",
                self.info.unit_id, self.info.attempt, e
            );
        }
    }
}
