use std::fmt::Write;

use crate::api::LimiterStats;

/// Renders a stats snapshot in the Prometheus text exposition format.
pub fn render_stats(stats: &LimiterStats, namespace: &str) -> String {
    let ns = if namespace.is_empty() {
        "hubgate"
    } else {
        namespace
    };

    let mut out = String::new();
    let mut metric = |name: &str, kind: &str, help: &str, value: u64| {
        let _ = write!(
            out,
            "# HELP {ns}_{name} {help}\n# TYPE {ns}_{name} {kind}\n{ns}_{name} {value}\n"
        );
    };
    metric(
        "available_tokens",
        "gauge",
        "Tokens left in the shared bucket",
        u64::from(stats.available_tokens),
    );
    metric(
        "capacity",
        "gauge",
        "Shared bucket capacity",
        u64::from(stats.capacity),
    );
    metric("granted_total", "counter", "Total tickets granted", stats.granted);
    metric(
        "superseded_total",
        "counter",
        "Total tickets superseded by a fresher request",
        stats.superseded,
    );
    metric(
        "cancelled_total",
        "counter",
        "Total tickets withdrawn by their caller",
        stats.cancelled,
    );
    metric("pending", "gauge", "Tickets currently waiting", stats.pending);
    metric(
        "wait_time_sum_ns",
        "counter",
        "Sum of enqueue-to-grant time in ns",
        stats.wait_time_sum_ns,
    );
    metric(
        "wait_time_samples",
        "counter",
        "Total wait time samples",
        stats.wait_time_samples,
    );

    if !stats.priorities.is_empty() {
        let _ = write!(
            out,
            "# HELP {ns}_priority_granted_total Tickets granted per priority\n# TYPE {ns}_priority_granted_total counter\n"
        );
        for entry in &stats.priorities {
            let _ = writeln!(
                out,
                "{ns}_priority_granted_total{{rank=\"{}\"}} {}",
                entry.priority.rank(),
                entry.granted
            );
        }
        let _ = write!(
            out,
            "# HELP {ns}_priority_pending Tickets waiting per priority\n# TYPE {ns}_priority_pending gauge\n"
        );
        for entry in &stats.priorities {
            let _ = writeln!(
                out,
                "{ns}_priority_pending{{rank=\"{}\"}} {}",
                entry.priority.rank(),
                entry.pending
            );
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Priority, PriorityStats};

    #[test]
    fn renders_totals_and_per_priority_series() {
        let stats = LimiterStats {
            available_tokens: 2,
            capacity: 5,
            granted: 7,
            superseded: 1,
            pending: 1,
            priorities: vec![PriorityStats {
                priority: Priority::POLLING,
                pending: 1,
                granted: 3,
                superseded: 1,
                cancelled: 0,
                generation: 4,
                floor_progress: Some((3, 3)),
                private_tokens: None,
            }],
            ..Default::default()
        };

        let text = render_stats(&stats, "");
        assert!(text.contains("hubgate_available_tokens 2\n"));
        assert!(text.contains("# TYPE hubgate_granted_total counter\nhubgate_granted_total 7\n"));
        assert!(text.contains("hubgate_priority_granted_total{rank=\"2\"} 3\n"));
        assert!(text.contains("hubgate_priority_pending{rank=\"2\"} 1\n"));
    }

    #[test]
    fn honours_namespace() {
        let text = render_stats(&LimiterStats::default(), "hub");
        assert!(text.contains("hub_pending 0\n"));
        assert!(!text.contains("priority_"));
    }
}
