use anyhow::Result;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct ProviderMetrics {
    registry: Registry,
    store_available: IntGauge,
    auth_attempts: IntCounterVec,
    notifications: IntCounterVec,
}

impl ProviderMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let store_available = IntGauge::new(
            "user_store_available",
            "Whether the last user store availability probe succeeded",
        )?;
        registry.register(Box::new(store_available.clone()))?;

        let auth_attempts = IntCounterVec::new(
            Opts::new(
                "auth_attempts_total",
                "Count of authentication attempts grouped by method and outcome",
            ),
            &["method", "outcome"],
        )?;
        registry.register(Box::new(auth_attempts.clone()))?;

        let notifications = IntCounterVec::new(
            Opts::new(
                "user_action_notifications_total",
                "Count of user action notifications grouped by channel and outcome",
            ),
            &["channel", "outcome"],
        )?;
        registry.register(Box::new(notifications.clone()))?;

        Ok(Self {
            registry,
            store_available,
            auth_attempts,
            notifications,
        })
    }

    pub fn set_store_availability(&self, available: bool) {
        self.store_available.set(if available { 1 } else { 0 });
    }

    pub fn record_auth_attempt(&self, method: &str, success: bool) {
        let outcome = if success { "ok" } else { "failed" };
        self.auth_attempts.with_label_values(&[method, outcome]).inc();
    }

    pub fn record_notification(&self, channel: &str, success: bool) {
        let outcome = if success { "ok" } else { "failed" };
        self.notifications
            .with_label_values(&[channel, outcome])
            .inc();
    }

    pub fn render(&self) -> Result<Response> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            )
            .body(Body::from(buffer))?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_tracks_availability() {
        let metrics = ProviderMetrics::new().expect("metrics");
        metrics.set_store_availability(true);
        metrics.record_auth_attempt("password", false);
        metrics.record_notification("http", true);
        let families = metrics.registry.gather();
        let names: Vec<_> = families.iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.contains(&"user_store_available".to_string()));
        assert!(names.contains(&"auth_attempts_total".to_string()));
        assert!(names.contains(&"user_action_notifications_total".to_string()));
    }
}
