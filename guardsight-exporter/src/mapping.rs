//! Prometheus naming helpers.

/// Check whether `name` matches the metric name pattern
/// `[a-zA-Z_:][a-zA-Z0-9_:]*`.
pub fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// Build a full metric name: `{prefix}_{suffix}`, or just `suffix` without a prefix.
pub fn build_metric_name(prefix: &str, suffix: &str) -> String {
    if prefix.is_empty() {
        suffix.to_string()
    } else {
        format!("{}_{}", prefix, suffix)
    }
}

/// Prometheus metric type of a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    /// Get the TYPE comment string for Prometheus exposition format.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

/// Map a flag to 1 or 0.
pub fn bool_to_value(flag: bool) -> f64 {
    if flag { 1.0 } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_valid_metric_name() {
        assert!(is_valid_metric_name("adguard"));
        assert!(is_valid_metric_name("dns:home"));
        assert!(is_valid_metric_name("_private"));
        assert!(!is_valid_metric_name("ad-guard"));
        assert!(!is_valid_metric_name("1dns"));
        assert!(!is_valid_metric_name(""));
    }

    #[test]
    fn test_repeated_and_trailing_underscores_are_valid() {
        assert!(is_valid_metric_name("adguard_"));
        assert!(is_valid_metric_name("home__dns"));
        assert!(is_valid_metric_name("adguard__dns_queries_total"));
    }

    #[test]
    fn test_build_metric_name() {
        assert_eq!(
            build_metric_name("adguard", "dns_queries_total"),
            "adguard_dns_queries_total"
        );
        assert_eq!(build_metric_name("", "running"), "running");
    }

    #[test]
    fn test_bool_to_value() {
        assert_eq!(bool_to_value(true), 1.0);
        assert_eq!(bool_to_value(false), 0.0);
    }
}
