pub mod logging;
pub mod metrics;

pub use logging::{init_tracing, LogFormat, LogSettings};
pub use metrics::{install_http_metrics_recorder, render_http_metrics};
