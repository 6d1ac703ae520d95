//! Telemetry helpers for tracing subscribers and Prometheus metrics.

use std::{
    io,
    path::{Path, PathBuf},
    sync::OnceLock,
    thread,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{
    filter::{EnvFilter, filter_fn},
    fmt,
    prelude::*,
};

use crate::pipeline::config::TelemetryOptions;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static PROM_UPKEEP_THREAD: OnceLock<thread::JoinHandle<()>> = OnceLock::new();
static EXPORTER_INSTALLED: OnceLock<()> = OnceLock::new();

/// Keeps the Chrome trace writer alive; the trace is flushed on drop.
pub struct TelemetryGuard {
    chrome_guard: Option<tracing_chrome::FlushGuard>,
    chrome_trace_path: Option<PathBuf>,
}

/// Install the process-wide tracing subscriber.
///
/// The filter comes from `RUST_LOG`, falling back to `info` (or `debug` when
/// `verbose` is set).
pub fn init_tracing(opts: &TelemetryOptions, verbose: bool) -> Result<TelemetryGuard> {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (chrome_layer, chrome_guard) = match opts.chrome_trace_path.as_ref() {
        Some(path) => match build_chrome_layer(path) {
            Ok((layer, guard)) => (Some(layer), Some(guard)),
            Err(err) => {
                eprintln!(
                    "failed to initialise chrome trace writer at {}: {err}",
                    path.display()
                );
                (None, None)
            }
        },
        None => (None, None),
    };
    let span_only_filter = filter_fn(|metadata| metadata.is_span());

    let subscriber = tracing_subscriber::registry()
        .with(chrome_layer.map(|layer| layer.with_filter(span_only_filter)))
        .with(
            fmt::layer()
                .with_target(false)
                .with_timer(fmt::time::uptime())
                .with_filter(env_filter),
        )
        .with(tracing_error::ErrorLayer::default());
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| anyhow!("tracing subscriber already installed: {err}"))?;

    Ok(TelemetryGuard {
        chrome_trace_path: chrome_guard
            .as_ref()
            .and(opts.chrome_trace_path.clone()),
        chrome_guard,
    })
}

/// Install the global metrics recorder, optionally with an HTTP scrape endpoint.
///
/// With an address the exporter runs its own listener thread and
/// [`render_metrics`] stays empty. Calling this more than once is a no-op.
pub fn init_metrics(opts: &TelemetryOptions) -> Result<()> {
    if PROM_HANDLE.get().is_some() || EXPORTER_INSTALLED.get().is_some() {
        return Ok(());
    }
    if let Some(addr) = opts.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .with_context(|| format!("failed to install Prometheus exporter on {addr}"))?;
        tracing::info!("Serving Prometheus metrics on http://{addr}/metrics");
        let _ = EXPORTER_INSTALLED.set(());
        return Ok(());
    }

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder).context("metrics recorder already installed")?;

    let upkeep_handle = handle.clone();
    let upkeep = spawn_thread("prometheus-upkeep", move || {
        loop {
            thread::sleep(Duration::from_secs(5));
            upkeep_handle.run_upkeep();
        }
    })
    .context("failed to spawn prometheus upkeep thread")?;
    let _ = PROM_UPKEEP_THREAD.set(upkeep);
    let _ = PROM_HANDLE.set(handle);
    Ok(())
}

/// Current metrics in Prometheus text format, when a recorder is installed.
pub fn render_metrics() -> Option<String> {
    PROM_HANDLE.get().map(PrometheusHandle::render)
}

/// Spawn a named thread that inherits the current tracing dispatcher.
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

fn build_chrome_layer(
    path: &Path,
) -> io::Result<(
    tracing_chrome::ChromeLayer<tracing_subscriber::Registry>,
    tracing_chrome::FlushGuard,
)> {
    let file = std::fs::File::create(path)?;
    let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
        .writer(file)
        .include_args(true)
        .trace_style(tracing_chrome::TraceStyle::Threaded)
        .build();
    Ok((layer, guard))
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(guard) = self.chrome_guard.take() {
            guard.flush();
        }
        if let Some(path) = self.chrome_trace_path.as_ref() {
            eprintln!("Chrome trace written to {}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    use super::*;

    #[test]
    fn spawned_threads_carry_their_name() {
        let handle = spawn_thread("parking-test", || {
            thread::current().name().map(str::to_string)
        })
        .unwrap();
        assert_eq!(handle.join().unwrap().as_deref(), Some("parking-test"));
    }

    #[test]
    fn metrics_init_is_idempotent() {
        let opts = TelemetryOptions::default();
        init_metrics(&opts).unwrap();
        init_metrics(&opts).unwrap();
        metrics::counter!("parking_test_counter_total").increment(1);
        let rendered = render_metrics().unwrap();
        assert!(rendered.contains("parking_test_counter_total"));
    }

    #[test]
    fn spawned_threads_run_closure() {
        let flag = Arc::new(AtomicBool::new(false));
        let worker_flag = flag.clone();
        spawn_thread("parking-flag", move || worker_flag.store(true, Ordering::SeqCst))
            .unwrap()
            .join()
            .unwrap();
        assert!(flag.load(Ordering::SeqCst));
    }
}
