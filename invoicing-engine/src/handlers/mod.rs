//! HTTP handlers for the invoicing engine.

pub mod app;
pub mod documents;
pub mod metrics;
pub mod payments;

use prometheus::HistogramTimer;
use service_core::error::AppError;

use crate::services::metrics::{ERRORS_TOTAL, HTTP_REQUESTS_TOTAL};

/// Record the outcome counters for one operation and stop its timer.
pub(crate) fn observe<T>(
    operation: &str,
    timer: HistogramTimer,
    result: Result<T, AppError>,
) -> Result<T, AppError> {
    match &result {
        Ok(_) => {
            HTTP_REQUESTS_TOTAL
                .with_label_values(&[operation, "ok"])
                .inc();
        }
        Err(e) => {
            HTTP_REQUESTS_TOTAL
                .with_label_values(&[operation, "error"])
                .inc();
            ERRORS_TOTAL.with_label_values(&[e.kind()]).inc();
        }
    }
    timer.observe_duration();
    result
}
