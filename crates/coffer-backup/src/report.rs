//! Run-level anomaly accumulation and the end-of-run summary logging.

use tracing::{error, info};

/// What kind of anomaly a run recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyKind {
    Exception,
    UnexpectedState,
    VerifyFailure,
}

/// One per-file (or run-level) problem captured instead of propagated.
#[derive(Debug, Clone)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub path: Option<String>,
    pub message: String,
}

impl Anomaly {
    pub fn exception(path: Option<String>, message: impl Into<String>) -> Self {
        Self {
            kind: AnomalyKind::Exception,
            path,
            message: message.into(),
        }
    }
}

/// Log the anomalies table at the end of a run.
pub fn log_anomalies_report(anomalies: &[Anomaly]) {
    if anomalies.is_empty() {
        return;
    }
    error!("*******************************************");
    error!("*** The following errors were detected: ***");
    error!("*******************************************");
    error!("{:<18} {:<40} {}", "Kind", "Path", "Error");
    error!("{} {} {}", "-".repeat(18), "-".repeat(40), "-".repeat(30));
    for anomaly in anomalies {
        error!(
            "{:<18} {:<40} {}",
            format!("{:?}", anomaly.kind),
            anomaly.path.as_deref().unwrap_or("-"),
            anomaly.message
        );
    }
}

/// Dotted-label summary lines, in the order given.
pub fn log_summary(rows: &[(&str, String)]) {
    for (label, value) in rows {
        info!("{:.<45} {}", format!("{label} "), value);
    }
}

/// The standard success banner.
pub fn log_success_banner(operation: &str) {
    info!("***************");
    info!("*** SUCCESS ***");
    info!("***************");
    info!("No errors detected during {operation}.");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anomaly_constructors() {
        let a = Anomaly::exception(Some("/p".to_string()), "failed");
        assert_eq!(a.kind, AnomalyKind::Exception);
        assert_eq!(a.path.as_deref(), Some("/p"));
        assert_eq!(a.message, "failed");
    }
}
