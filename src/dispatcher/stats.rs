//! Per-tool call statistics.
//!
//! In-memory sliding window per `(catalog, tool)`: success rate, average
//! latency and the most frequent error codes.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

#[derive(Debug, Clone)]
struct CallRecord {
    success: bool,
    latency_ms: u64,
    timestamp: Instant,
    error_code: Option<&'static str>,
}

/// Sliding window for a single tool.
#[derive(Debug)]
struct ToolWindow {
    records: VecDeque<CallRecord>,
    window_size: usize,
}

impl ToolWindow {
    fn new(window_size: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(window_size),
            window_size,
        }
    }

    fn record(&mut self, success: bool, latency_ms: u64, error_code: Option<&'static str>) {
        if self.records.len() >= self.window_size {
            self.records.pop_front();
        }
        self.records.push_back(CallRecord {
            success,
            latency_ms,
            timestamp: Instant::now(),
            error_code,
        });
    }

    fn success_rate(&self) -> f64 {
        if self.records.is_empty() {
            return 0.0;
        }
        let ok = self.records.iter().filter(|r| r.success).count();
        ok as f64 / self.records.len() as f64
    }

    fn avg_latency_ms(&self) -> f64 {
        if self.records.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.records.iter().map(|r| r.latency_ms).sum();
        sum as f64 / self.records.len() as f64
    }

    fn error_patterns(&self) -> Vec<(String, usize)> {
        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        for record in self.records.iter().filter(|r| !r.success) {
            *counts.entry(record.error_code.unwrap_or("UNKNOWN")).or_default() += 1;
        }
        let mut patterns: Vec<(String, usize)> =
            counts.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        patterns.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        patterns
    }

    fn last_call_age_ms(&self) -> Option<u64> {
        self.records
            .back()
            .map(|r| r.timestamp.elapsed().as_millis() as u64)
    }
}

/// Statistics report for one tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolStatsReport {
    pub catalog: String,
    pub tool: String,
    pub total_calls: usize,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub error_patterns: Vec<(String, usize)>,
    pub last_call_age_ms: Option<u64>,
}

/// Call statistics for every tool that has been called.
#[derive(Debug)]
pub struct ToolStats {
    window_size: usize,
    windows: HashMap<(String, String), ToolWindow>,
}

impl ToolStats {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size: window_size.max(1),
            windows: HashMap::new(),
        }
    }

    pub fn record(
        &mut self,
        catalog: &str,
        tool: &str,
        success: bool,
        latency_ms: u64,
        error_code: Option<&'static str>,
    ) {
        let window_size = self.window_size;
        self.windows
            .entry((catalog.to_string(), tool.to_string()))
            .or_insert_with(|| ToolWindow::new(window_size))
            .record(success, latency_ms, error_code);
    }

    /// Reports filtered by catalog and/or tool, sorted by catalog then tool.
    pub fn reports(&self, catalog: Option<&str>, tool: Option<&str>) -> Vec<ToolStatsReport> {
        let mut reports: Vec<ToolStatsReport> = self
            .windows
            .iter()
            .filter(|((c, t), _)| {
                catalog.map_or(true, |want| want == c) && tool.map_or(true, |want| want == t)
            })
            .map(|((c, t), window)| ToolStatsReport {
                catalog: c.clone(),
                tool: t.clone(),
                total_calls: window.records.len(),
                success_rate: window.success_rate(),
                avg_latency_ms: window.avg_latency_ms(),
                error_patterns: window.error_patterns(),
                last_call_age_ms: window.last_call_age_ms(),
            })
            .collect();
        reports.sort_by(|a, b| (&a.catalog, &a.tool).cmp(&(&b.catalog, &b.tool)));
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate_and_latency() {
        let mut stats = ToolStats::new(10);
        stats.record("infra", "docker-ps", true, 100, None);
        stats.record("infra", "docker-ps", true, 300, None);
        stats.record("infra", "docker-ps", false, 200, Some("TIMEOUT"));
        stats.record("infra", "docker-ps", false, 0, Some("TIMEOUT"));

        let reports = stats.reports(Some("infra"), Some("docker-ps"));
        assert_eq!(reports.len(), 1);
        let r = &reports[0];
        assert_eq!(r.total_calls, 4);
        assert!((r.success_rate - 0.5).abs() < f64::EPSILON);
        assert!((r.avg_latency_ms - 150.0).abs() < f64::EPSILON);
        assert_eq!(r.error_patterns, vec![("TIMEOUT".to_string(), 2)]);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut stats = ToolStats::new(3);
        stats.record("infra", "t", false, 10, Some("TOOL_FAILED"));
        for _ in 0..3 {
            stats.record("infra", "t", true, 10, None);
        }
        let r = &stats.reports(None, None)[0];
        assert_eq!(r.total_calls, 3);
        assert!((r.success_rate - 1.0).abs() < f64::EPSILON);
        assert!(r.error_patterns.is_empty());
    }

    #[test]
    fn test_reports_filter_and_order() {
        let mut stats = ToolStats::new(10);
        stats.record("ops", "b", true, 1, None);
        stats.record("infra", "b", true, 1, None);
        stats.record("infra", "a", true, 1, None);

        let all: Vec<(String, String)> = stats
            .reports(None, None)
            .into_iter()
            .map(|r| (r.catalog, r.tool))
            .collect();
        assert_eq!(
            all,
            vec![
                ("infra".to_string(), "a".to_string()),
                ("infra".to_string(), "b".to_string()),
                ("ops".to_string(), "b".to_string()),
            ]
        );
        assert_eq!(stats.reports(Some("infra"), None).len(), 2);
        assert_eq!(stats.reports(None, Some("b")).len(), 2);
        assert!(stats.reports(Some("nope"), None).is_empty());
    }
}
