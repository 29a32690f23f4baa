//! Prometheus text exposition rendering.
//!
//! Rendering is deterministic: series are emitted sorted by name, then by
//! lexicographically sorted `key="value"` pairs, with one `# HELP`/`# TYPE`
//! preamble per family. Identical snapshots render byte-identical output.

use crate::registry::{MetricsSnapshot, SeriesSnapshot, SeriesValue};
use std::fmt::Write;

/// Render a snapshot into the text exposition format.
///
/// # Errors
///
/// Returns `std::fmt::Error` if writing into the output buffer fails; the
/// exporter maps this to a 500 and counts it, never panics.
pub fn render(snapshot: &MetricsSnapshot) -> Result<String, std::fmt::Error> {
    let mut out = String::new();
    let mut current_family: Option<&str> = None;

    for series in &snapshot.series {
        if current_family != Some(series.name.as_str()) {
            writeln!(out, "# HELP {} {}", series.name, help_text(&series.name))?;
            writeln!(out, "# TYPE {} {}", series.name, series.kind.as_str())?;
            current_family = Some(series.name.as_str());
        }
        render_series(&mut out, series)?;
    }

    Ok(out)
}

fn render_series(out: &mut String, series: &SeriesSnapshot) -> Result<(), std::fmt::Error> {
    match &series.value {
        SeriesValue::Counter(v) | SeriesValue::Gauge(v) => {
            write!(out, "{}", series.name)?;
            render_labels(out, &series.labels, None)?;
            writeln!(out, " {v}")?;
        }
        SeriesValue::Histogram {
            bounds,
            counts,
            sum,
            count,
        } => {
            // Bucket counts are cumulative by construction.
            for (bound, bucket_count) in bounds.iter().zip(counts.iter()) {
                write!(out, "{}_bucket", series.name)?;
                render_labels(out, &series.labels, Some(&format!("{bound}")))?;
                writeln!(out, " {bucket_count}")?;
            }
            write!(out, "{}_bucket", series.name)?;
            render_labels(out, &series.labels, Some("+Inf"))?;
            writeln!(out, " {count}")?;

            write!(out, "{}_sum", series.name)?;
            render_labels(out, &series.labels, None)?;
            writeln!(out, " {sum}")?;

            write!(out, "{}_count", series.name)?;
            render_labels(out, &series.labels, None)?;
            writeln!(out, " {count}")?;
        }
    }
    Ok(())
}

fn render_labels(
    out: &mut String,
    labels: &[(String, String)],
    le: Option<&str>,
) -> Result<(), std::fmt::Error> {
    if labels.is_empty() && le.is_none() {
        return Ok(());
    }
    out.push('{');
    let mut first = true;
    for (key, value) in labels {
        if !first {
            out.push(',');
        }
        write!(out, "{key}=\"{}\"", escape(value))?;
        first = false;
    }
    if let Some(le) = le {
        if !first {
            out.push(',');
        }
        write!(out, "le=\"{le}\"")?;
    }
    out.push('}');
    Ok(())
}

/// Escape a label value per the exposition format: backslash, double quote
/// and line feed.
fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn help_text(name: &str) -> &str {
    match name {
        "simple_reconcile_total" => "Reconcile outcomes by result",
        "simple_reconcile_duration_seconds" => "Reconcile duration in seconds",
        "certwatcher_read_certificate_total" => "Successful certificate reloads",
        "certwatcher_read_certificate_errors_total" => "Failed certificate reloads",
        "export_errors_total" => "Metrics exposition render failures",
        "cardinality_rejected_total" => "Samples rejected by the cardinality guard",
        "publish_failed_total" => "Publish events dropped after exhausting delivery attempts",
        "publish_dropped_total" => "Publish events evicted by the queue-full policy",
        other => other,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::registry::{MetricKind, MetricRegistry};

    fn sample_registry() -> MetricRegistry {
        let registry = MetricRegistry::new(128, vec![("cluster".to_string(), "us".to_string())]);
        registry.inc_counter("simple_reconcile_total", &[("result", "updated")], 1.0);
        registry.inc_counter("simple_reconcile_total", &[("result", "skipped")], 2.0);
        registry.set_gauge("queue_depth", &[], 7.0);
        registry.observe("simple_reconcile_duration_seconds", &[], 0.042);
        registry
    }

    #[test]
    fn test_render_is_deterministic() {
        let registry = sample_registry();
        let a = render(&registry.snapshot()).unwrap();
        let b = render(&registry.snapshot()).unwrap();
        assert_eq!(a, b, "identical snapshots must render byte-identical");
    }

    #[test]
    fn test_identical_value_sets_render_identically_across_registries() {
        // Insertion order differs; output must not.
        let first = MetricRegistry::new(128, Vec::new());
        first.inc_counter("b_total", &[], 1.0);
        first.inc_counter("a_total", &[("k", "2")], 1.0);
        first.inc_counter("a_total", &[("k", "1")], 1.0);

        let second = MetricRegistry::new(128, Vec::new());
        second.inc_counter("a_total", &[("k", "1")], 1.0);
        second.inc_counter("a_total", &[("k", "2")], 1.0);
        second.inc_counter("b_total", &[], 1.0);

        assert_eq!(
            render(&first.snapshot()).unwrap(),
            render(&second.snapshot()).unwrap()
        );
    }

    #[test]
    fn test_preamble_and_ordering() {
        let registry = sample_registry();
        let text = render(&registry.snapshot()).unwrap();

        assert!(text.contains("# TYPE simple_reconcile_total counter"));
        assert!(text.contains("# HELP simple_reconcile_total Reconcile outcomes by result"));
        assert!(text.contains("# TYPE queue_depth gauge"));
        assert!(text.contains("# TYPE simple_reconcile_duration_seconds histogram"));

        // Label pairs sorted by key: cluster before result.
        assert!(text
            .contains(r#"simple_reconcile_total{cluster="us",result="skipped"} 2"#));
        assert!(text
            .contains(r#"simple_reconcile_total{cluster="us",result="updated"} 1"#));

        // Families sorted by name.
        let queue_pos = text.find("# HELP queue_depth").unwrap();
        let reconcile_pos = text.find("# HELP simple_reconcile_total").unwrap();
        assert!(queue_pos < reconcile_pos);
    }

    #[test]
    fn test_histogram_rendering() {
        let registry = MetricRegistry::new(128, Vec::new());
        registry.observe("d_seconds", &[], 0.042);
        registry.observe("d_seconds", &[], 0.042);

        let text = render(&registry.snapshot()).unwrap();
        assert!(text.contains(r#"d_seconds_bucket{le="0.05"} 2"#));
        assert!(text.contains(r#"d_seconds_bucket{le="0.025"} 0"#));
        assert!(text.contains(r#"d_seconds_bucket{le="+Inf"} 2"#));
        assert!(text.contains("d_seconds_sum 0.084"));
        assert!(text.contains("d_seconds_count 2"));
    }

    #[test]
    fn test_label_value_escaping() {
        let registry = MetricRegistry::new(128, Vec::new());
        registry.inc_counter("weird_total", &[("msg", "say \"hi\"\nback\\slash")], 1.0);

        let text = render(&registry.snapshot()).unwrap();
        assert!(text.contains(r#"msg="say \"hi\"\nback\\slash""#));
    }

    #[test]
    fn test_empty_snapshot_renders_empty() {
        let registry = MetricRegistry::new(128, Vec::new());
        assert_eq!(render(&registry.snapshot()).unwrap(), "");
    }
}
