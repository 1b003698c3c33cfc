use std::io;

use tracing::{Subscriber, info};
use tracing_subscriber::{
    EnvFilter, Layer, fmt, fmt::MakeWriter, prelude::*, registry::LookupSpan,
};

// Log lines go to the given writer only, stdout carries the requests
pub fn log_layer<S, W>(writer: W) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    fmt::layer().with_target(false).with_writer(writer)
}

// Install the global subscriber, RUST_LOG takes precedence over the
// build dependent default level
pub fn init_logging() {
    let level = if cfg!(debug_assertions) { "trace" } else { "info" };

    let (filter, from_env) = match EnvFilter::try_from_default_env() {
        Ok(f) => (f, true),
        Err(_) => (EnvFilter::new(level), false),
    };

    tracing_subscriber::registry()
        .with(log_layer(io::stderr))
        .with(filter)
        .init();

    // Only visible once the subscriber is installed
    if !from_env {
        info!("\"RUST_LOG\" variable not set, defaulting to {level}");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Write,
        sync::{Arc, Mutex},
    };

    use tracing::warn;

    use super::*;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_logs_go_to_the_given_writer() {
        let captured = Captured::default();

        let subscriber = tracing_subscriber::registry().with(log_layer({
            let captured = captured.clone();
            move || captured.clone()
        }));

        tracing::subscriber::with_default(subscriber, || {
            warn!("NVML unavailable");
        });

        let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("NVML unavailable"));
    }
}
