//! Metrics capability and Prometheus text exposition.
//!
//! Services receive an `Arc<dyn Metrics>` at construction; there is no
//! process-wide registry. [`Registry`] is the default implementation and
//! renders everything it has seen for the `/metrics` endpoint.

use std::collections::BTreeMap;
use std::sync::Mutex;

pub trait Metrics: Send + Sync {
    fn incr(&self, name: &str, labels: &[(&str, &str)]);
    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn incr(&self, _name: &str, _labels: &[(&str, &str)]) {}
    fn set_gauge(&self, _name: &str, _labels: &[(&str, &str)], _value: f64) {}
}

/// `(metric name, rendered label set)`.
type SeriesKey = (String, String);

/// In-process metric registry.
#[derive(Debug, Default)]
pub struct Registry {
    counters: Mutex<BTreeMap<SeriesKey, u64>>,
    gauges: Mutex<BTreeMap<SeriesKey, f64>>,
}

fn help_for(name: &str) -> &'static str {
    match name {
        "nimbus_auth_attempts_total" => "Login attempts by outcome.",
        "nimbus_autoscale_actions_total" => "Auto-scaling actions by kind.",
        "nimbus_provision_total" => "Provisioning tasks by outcome.",
        "nimbus_webhook_deliveries_total" => "Pipeline webhook deliveries by outcome.",
        "nimbus_cron_runs_total" => "Cron job runs by status.",
        "nimbus_scaling_groups" => "Scaling groups seen by the last reconcile tick.",
        _ => "Nimbus metric.",
    }
}

fn render_labels(labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let mut sorted: Vec<&(&str, &str)> = labels.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let inner = sorted
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(",");
    format!("{{{inner}}}")
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter series (0 if never incremented).
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), render_labels(labels));
        self.counters
            .lock()
            .expect("counters lock")
            .get(&key)
            .copied()
            .unwrap_or(0)
    }

    /// Render all series in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        let counters = self.counters.lock().expect("counters lock");
        let mut last = None;
        for ((name, labels), value) in counters.iter() {
            if last != Some(name) {
                out.push_str(&format!("# HELP {name} {}\n", help_for(name)));
                out.push_str(&format!("# TYPE {name} counter\n"));
                last = Some(name);
            }
            out.push_str(&format!("{name}{labels} {value}\n"));
        }

        let gauges = self.gauges.lock().expect("gauges lock");
        let mut last = None;
        for ((name, labels), value) in gauges.iter() {
            if last != Some(name) {
                out.push_str(&format!("# HELP {name} {}\n", help_for(name)));
                out.push_str(&format!("# TYPE {name} gauge\n"));
                last = Some(name);
            }
            out.push_str(&format!("{name}{labels} {value:.2}\n"));
        }
        out
    }
}

impl Metrics for Registry {
    fn incr(&self, name: &str, labels: &[(&str, &str)]) {
        let key = (name.to_string(), render_labels(labels));
        *self
            .counters
            .lock()
            .expect("counters lock")
            .entry(key)
            .or_insert(0) += 1;
    }

    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = (name.to_string(), render_labels(labels));
        self.gauges.lock().expect("gauges lock").insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_empty() {
        assert_eq!(Registry::new().render_prometheus(), "");
    }

    #[test]
    fn counters_grouped_under_one_header() {
        let registry = Registry::new();
        registry.incr("nimbus_auth_attempts_total", &[("outcome", "success")]);
        registry.incr("nimbus_auth_attempts_total", &[("outcome", "success")]);
        registry.incr("nimbus_auth_attempts_total", &[("outcome", "failure_password")]);

        let output = registry.render_prometheus();
        assert_eq!(output.matches("# TYPE nimbus_auth_attempts_total counter").count(), 1);
        assert!(output.contains("nimbus_auth_attempts_total{outcome=\"success\"} 2"));
        assert!(output.contains("nimbus_auth_attempts_total{outcome=\"failure_password\"} 1"));
        assert_eq!(registry.counter("nimbus_auth_attempts_total", &[("outcome", "success")]), 2);
    }

    #[test]
    fn gauges_render_with_labels_sorted() {
        let registry = Registry::new();
        registry.set_gauge("nimbus_scaling_groups", &[("status", "active"), ("a", "b")], 3.0);
        let output = registry.render_prometheus();
        assert!(output.contains("# TYPE nimbus_scaling_groups gauge"));
        assert!(output.contains("nimbus_scaling_groups{a=\"b\",status=\"active\"} 3.00"));
    }
}
