use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::errors::{AppError, Result};

fn metrics_error(e: prometheus::Error) -> AppError {
    AppError::Internal(anyhow::anyhow!("metrics registry error: {}", e))
}

pub struct MetricsService {
    registry: Registry,
    uploads: IntCounter,
    uploaded_bytes: IntCounter,
    quota_rejections: IntCounter,
    downloads: IntCounter,
    deletes: IntCounter,
    orphaned_blobs: IntCounter,
    swept_blobs: IntCounter,
    responses: IntCounterVec,
}

impl MetricsService {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let counter = IntCounter::new(name, help).map_err(metrics_error)?;
            registry
                .register(Box::new(counter.clone()))
                .map_err(metrics_error)?;
            Ok(counter)
        };

        let uploads = counter("uploads_total", "Files committed to storage")?;
        let uploaded_bytes = counter("uploaded_bytes_total", "Bytes committed to storage")?;
        let quota_rejections = counter("quota_rejections_total", "Uploads refused by the quota check")?;
        let downloads = counter("downloads_total", "Files served")?;
        let deletes = counter("deletes_total", "Files deleted")?;
        let orphaned_blobs = counter(
            "orphaned_blobs_total",
            "Blobs a compensating removal failed to delete",
        )?;
        let swept_blobs = counter("swept_blobs_total", "Orphaned blobs removed by the sweeper")?;

        let responses = IntCounterVec::new(
            Opts::new("http_responses_total", "HTTP responses by status class"),
            &["class"],
        )
        .map_err(metrics_error)?;
        registry
            .register(Box::new(responses.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            uploads,
            uploaded_bytes,
            quota_rejections,
            downloads,
            deletes,
            orphaned_blobs,
            swept_blobs,
            responses,
        })
    }

    pub fn record_upload(&self, bytes: u64) {
        self.uploads.inc();
        self.uploaded_bytes.inc_by(bytes);
    }

    pub fn record_quota_rejection(&self) {
        self.quota_rejections.inc();
    }

    pub fn record_download(&self) {
        self.downloads.inc();
    }

    pub fn record_delete(&self) {
        self.deletes.inc();
    }

    pub fn record_orphaned_blob(&self) {
        self.orphaned_blobs.inc();
    }

    pub fn record_swept_blobs(&self, count: u64) {
        self.swept_blobs.inc_by(count);
    }

    pub fn record_response(&self, status: u16) {
        let class = match status {
            100..=199 => "1xx",
            200..=299 => "2xx",
            300..=399 => "3xx",
            400..=499 => "4xx",
            _ => "5xx",
        };
        self.responses.with_label_values(&[class]).inc();
    }

    pub fn uploads_total(&self) -> u64 {
        self.uploads.get()
    }

    pub fn quota_rejections_total(&self) -> u64 {
        self.quota_rejections.get()
    }

    pub fn orphaned_blobs_total(&self) -> u64 {
        self.orphaned_blobs.get()
    }

    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| AppError::Internal(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_counters() {
        let metrics = MetricsService::new().unwrap();
        metrics.record_upload(600);
        metrics.record_quota_rejection();
        metrics.record_response(201);
        metrics.record_response(413);

        assert_eq!(metrics.uploads_total(), 1);
        assert_eq!(metrics.quota_rejections_total(), 1);

        let text = metrics.render().unwrap();
        assert!(text.contains("uploaded_bytes_total 600"));
        assert!(text.contains("http_responses_total{class=\"4xx\"} 1"));
    }

    #[test]
    fn test_services_have_independent_registries() {
        let first = MetricsService::new().unwrap();
        let second = MetricsService::new().unwrap();
        first.record_delete();
        assert!(!second.render().unwrap().contains("deletes_total 1"));
    }
}
