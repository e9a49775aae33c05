//! Process-wide recorder for the `metrics` facade used by the HTTP middleware.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static HTTP_METRICS: OnceCell<Option<PrometheusHandle>> = OnceCell::new();

/// Install the Prometheus recorder once. Later calls are no-ops; a recorder
/// already installed by someone else yields `false`.
pub fn install_http_metrics_recorder() -> bool {
    HTTP_METRICS
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install HTTP metrics recorder");
                None
            }
        })
        .is_some()
}

/// Render HTTP metrics in Prometheus text format (empty before install).
pub fn render_http_metrics() -> String {
    HTTP_METRICS
        .get()
        .and_then(|handle| handle.as_ref())
        .map(|handle| handle.render())
        .unwrap_or_default()
}
