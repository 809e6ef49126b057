// Telemetry module for structured logging and metrics

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize structured logging with JSON formatting
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(log_level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(json_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;

    tracing::info!(
        log_level = log_level,
        "Structured logging initialized with JSON formatting"
    );

    Ok(())
}

/// Initialize Prometheus metrics exporter and describe the scheduler metrics
#[tracing::instrument]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "periodic_jobs_submitted_total",
        "Total number of accepted job submissions"
    );
    describe_counter!(
        "periodic_jobs_dispatched_total",
        "Total number of jobs handed to workers"
    );
    describe_counter!(
        "periodic_jobs_completed_total",
        "Total number of jobs reported done"
    );
    describe_counter!(
        "periodic_jobs_failed_total",
        "Total number of jobs reported failed"
    );
    describe_counter!(
        "periodic_jobs_requeued_total",
        "Total number of jobs returned to ready after timeout or worker loss"
    );
    describe_gauge!(
        "periodic_waiting_workers",
        "Number of workers blocked in GRAB"
    );

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_job_submitted(func: &str) {
    counter!("periodic_jobs_submitted_total", "func" => func.to_string()).increment(1);
}

#[inline]
pub fn record_job_dispatched(func: &str) {
    counter!("periodic_jobs_dispatched_total", "func" => func.to_string()).increment(1);
}

#[inline]
pub fn record_job_completed(func: &str) {
    counter!("periodic_jobs_completed_total", "func" => func.to_string()).increment(1);
}

#[inline]
pub fn record_job_failed(func: &str) {
    counter!("periodic_jobs_failed_total", "func" => func.to_string()).increment(1);
}

/// Record a requeue; `reason` is `timeout` or `disconnect`
#[inline]
pub fn record_job_requeued(func: &str, reason: &'static str) {
    counter!(
        "periodic_jobs_requeued_total",
        "func" => func.to_string(),
        "reason" => reason
    )
    .increment(1);
}

#[inline]
pub fn update_waiting_workers(count: usize) {
    gauge!("periodic_waiting_workers").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::{
        Counter, CounterFn, Gauge, GaugeFn, Histogram, HistogramFn, Key, KeyName, Metadata,
        Recorder, SharedString, Unit,
    };
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// Last value of one metric series
    #[derive(Default)]
    struct Cell(Mutex<f64>);

    impl CounterFn for Cell {
        fn increment(&self, value: u64) {
            *self.0.lock().unwrap() += value as f64;
        }

        fn absolute(&self, value: u64) {
            *self.0.lock().unwrap() = value as f64;
        }
    }

    impl GaugeFn for Cell {
        fn increment(&self, value: f64) {
            *self.0.lock().unwrap() += value;
        }

        fn decrement(&self, value: f64) {
            *self.0.lock().unwrap() -= value;
        }

        fn set(&self, value: f64) {
            *self.0.lock().unwrap() = value;
        }
    }

    impl HistogramFn for Cell {
        fn record(&self, value: f64) {
            *self.0.lock().unwrap() = value;
        }
    }

    /// Recorder that keeps every series in memory, keyed as `name{label=value,...}`
    #[derive(Default)]
    struct CapturingRecorder {
        series: Mutex<HashMap<String, Arc<Cell>>>,
    }

    impl CapturingRecorder {
        fn cell(&self, key: &Key) -> Arc<Cell> {
            let mut labels: Vec<String> = key
                .labels()
                .map(|label| format!("{}={}", label.key(), label.value()))
                .collect();
            labels.sort();
            let id = format!("{}{{{}}}", key.name(), labels.join(","));
            self.series.lock().unwrap().entry(id).or_default().clone()
        }

        fn value(&self, id: &str) -> Option<f64> {
            self.series
                .lock()
                .unwrap()
                .get(id)
                .map(|cell| *cell.0.lock().unwrap())
        }
    }

    impl Recorder for CapturingRecorder {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
            Counter::from_arc(self.cell(key))
        }

        fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
            Gauge::from_arc(self.cell(key))
        }

        fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
            Histogram::from_arc(self.cell(key))
        }
    }

    #[test]
    fn test_second_logging_init_is_rejected() {
        // Another test may have installed the global subscriber first
        let _ = init_logging("info");
        assert!(init_logging("info").is_err());
    }

    #[test]
    fn test_job_counters_carry_function_label() {
        let recorder = CapturingRecorder::default();
        metrics::with_local_recorder(&recorder, || {
            record_job_submitted("email");
            record_job_submitted("email");
            record_job_submitted("sms");
            record_job_dispatched("email");
            record_job_completed("email");
            record_job_failed("sms");
        });

        assert_eq!(
            recorder.value("periodic_jobs_submitted_total{func=email}"),
            Some(2.0)
        );
        assert_eq!(
            recorder.value("periodic_jobs_submitted_total{func=sms}"),
            Some(1.0)
        );
        assert_eq!(
            recorder.value("periodic_jobs_dispatched_total{func=email}"),
            Some(1.0)
        );
        assert_eq!(
            recorder.value("periodic_jobs_completed_total{func=email}"),
            Some(1.0)
        );
        assert_eq!(
            recorder.value("periodic_jobs_failed_total{func=sms}"),
            Some(1.0)
        );
    }

    #[test]
    fn test_requeues_split_by_reason_and_waiting_gauge_tracks_last_value() {
        let recorder = CapturingRecorder::default();
        metrics::with_local_recorder(&recorder, || {
            record_job_requeued("email", "timeout");
            record_job_requeued("email", "disconnect");
            record_job_requeued("email", "timeout");
            update_waiting_workers(3);
            update_waiting_workers(1);
        });

        assert_eq!(
            recorder.value("periodic_jobs_requeued_total{func=email,reason=timeout}"),
            Some(2.0)
        );
        assert_eq!(
            recorder.value("periodic_jobs_requeued_total{func=email,reason=disconnect}"),
            Some(1.0)
        );
        assert_eq!(recorder.value("periodic_waiting_workers{}"), Some(1.0));
    }
}
