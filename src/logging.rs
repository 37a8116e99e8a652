//! Logger configuration: a JSON `tracing` subscriber whose level filter is
//! reloadable and whose sink (stderr, stdout, or a file) can be swapped at
//! runtime. Reopening installs the new handle before the old one is dropped,
//! which is what log rotators rely on.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::sync::{Arc, LazyLock, Mutex, OnceLock};

use arc_swap::ArcSwap;
use miette::{IntoDiagnostic, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

enum Sink {
    Stderr,
    Stdout,
    File(Mutex<File>),
}

static SINK: LazyLock<ArcSwap<Sink>> = LazyLock::new(|| ArcSwap::from_pointee(Sink::Stderr));
static RELOAD_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

/// Writes every log line to whatever sink is current at write time.
#[derive(Clone, Copy)]
struct SinkWriter;

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &**SINK.load() {
            Sink::Stderr => io::stderr().write(buf),
            Sink::Stdout => io::stdout().write(buf),
            Sink::File(file) => file
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &**SINK.load() {
            Sink::Stderr => io::stderr().flush(),
            Sink::Stdout => io::stdout().flush(),
            Sink::File(file) => file
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .flush(),
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SinkWriter {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        *self
    }
}

/// Apply the active log configuration: parse the level, open the sink, and
/// either install the subscriber (first call) or reload the filter and swap
/// the sink in place. Also the `reload/reopen-log-file` entry point: a
/// fresh file handle is opened and swapped in, and the previous one closes
/// when its last writer drops it.
pub fn configure_logger() -> Result<()> {
    let settings = crate::settings::active();

    let filter = EnvFilter::try_new(&settings.log.level).into_diagnostic()?;
    let sink = match settings.log.filename.as_str() {
        "stderr" => Sink::Stderr,
        "stdout" => Sink::Stdout,
        path => Sink::File(Mutex::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .into_diagnostic()?,
        )),
    };

    match RELOAD_HANDLE.get() {
        Some(handle) => {
            SINK.store(Arc::new(sink));
            handle.reload(filter).into_diagnostic()?;
        }
        None => {
            let (filter_layer, handle) = reload::Layer::new(filter);
            SINK.store(Arc::new(sink));
            let init_result = tracing_subscriber::registry()
                .with(filter_layer)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(SinkWriter),
                )
                .try_init();
            let _ = RELOAD_HANDLE.set(handle);
            init_result.into_diagnostic()?;
        }
    }

    Ok(())
}

/// Shutdown hook: point the sink back at stderr so a file sink is flushed
/// and closed before exit.
pub fn close_log_file() {
    SINK.store(Arc::new(Sink::Stderr));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_sink_reopen_swaps_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.log");

        SINK.store(Arc::new(Sink::File(Mutex::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .unwrap(),
        ))));
        let mut writer = SinkWriter;
        writer.write_all(b"before rotation\n").unwrap();

        // Rotate: rename the file, then open a fresh handle at the old path.
        let rotated = dir.path().join("daemon.log.1");
        std::fs::rename(&path, &rotated).unwrap();
        SINK.store(Arc::new(Sink::File(Mutex::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .unwrap(),
        ))));
        writer.write_all(b"after rotation\n").unwrap();

        assert!(std::fs::read_to_string(&rotated)
            .unwrap()
            .contains("before rotation"));
        assert!(std::fs::read_to_string(&path)
            .unwrap()
            .contains("after rotation"));

        close_log_file();
    }
}
