//! Log sinks for the plugin log and the transaction log.
//!
//! Both logs are append-only files fed through an unbounded channel so
//! that proxy threads never block on disk. The two differ in flush
//! policy: the plugin log batches writes and flushes on an interval,
//! while the transaction log is an audit trail and flushes after every
//! batch of records. On shutdown a sink drains whatever is still
//! queued before the final flush, so records emitted during teardown
//! still reach disk.

use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use env_logger::Builder;
use log::LevelFilter;
use pingora::{
    server::{ListenFds, ShutdownWatch},
    services::Service,
};
use tokio::{
    fs::{create_dir_all, File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    time::interval,
};

const FLUSH_INTERVAL: Duration = Duration::from_secs(2);
const BATCH_LIMIT: usize = 64;

/// `std::io::Write` front half of a sink, handed to `env_logger`.
pub struct AsyncWriter {
    sender: UnboundedSender<Vec<u8>>,
}

impl Write for AsyncWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        // A closed channel means the sink service has stopped.
        self.sender
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "log sink stopped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Channel-fed append-only file writer, run as a background service.
pub struct FileSink {
    service_name: &'static str,
    path: PathBuf,
    /// Flush after every batch instead of on the interval tick.
    eager_flush: bool,
    sender: UnboundedSender<Vec<u8>>,
    receiver: UnboundedReceiver<Vec<u8>>,
}

impl FileSink {
    /// The plugin log: throughput over durability, interval flushes.
    pub fn plugin_log(path: PathBuf) -> Self {
        Self::new("plugin log", path, false)
    }

    /// The transaction log: one record per finished transaction, kept
    /// durable with eager flushes.
    pub fn transaction_log(path: PathBuf) -> Self {
        Self::new("transaction log", path, true)
    }

    fn new(service_name: &'static str, path: PathBuf, eager_flush: bool) -> Self {
        let (sender, receiver) = unbounded_channel::<Vec<u8>>();
        Self {
            service_name,
            path,
            eager_flush,
            sender,
            receiver,
        }
    }

    pub fn sender(&self) -> UnboundedSender<Vec<u8>> {
        self.sender.clone()
    }

    pub fn writer(&self) -> AsyncWriter {
        AsyncWriter {
            sender: self.sender.clone(),
        }
    }

    async fn open_file(&self) -> io::Result<BufWriter<File>> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .await?;
        Ok(BufWriter::new(file))
    }
}

async fn write_batch(
    file: &mut BufWriter<File>,
    batch: &mut Vec<Vec<u8>>,
    eager_flush: bool,
) -> io::Result<()> {
    for line in batch.drain(..) {
        file.write_all(&line).await?;
    }
    if eager_flush {
        file.flush().await?;
    }
    Ok(())
}

#[async_trait]
impl Service for FileSink {
    async fn start_service(&mut self, _fds: Option<ListenFds>, mut shutdown: ShutdownWatch) {
        let mut file = match self.open_file().await {
            Ok(file) => file,
            Err(e) => {
                log::error!(
                    "{}: cannot open {}: {e}; records will be dropped",
                    self.service_name,
                    self.path.display()
                );
                return;
            }
        };

        let mut ticker = interval(FLUSH_INTERVAL);
        let mut batch: Vec<Vec<u8>> = Vec::with_capacity(BATCH_LIMIT);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = self.receiver.recv_many(&mut batch, BATCH_LIMIT) => {
                    if received == 0 {
                        // All senders are gone.
                        break;
                    }
                    if let Err(e) = write_batch(&mut file, &mut batch, self.eager_flush).await {
                        log::error!("{}: dropped {received} record(s): {e}", self.service_name);
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = file.flush().await {
                        log::error!("{}: flush failed: {e}", self.service_name);
                    }
                }
            }
        }

        // Late records are still in the channel; get them to disk.
        while let Ok(line) = self.receiver.try_recv() {
            batch.push(line);
        }
        if let Err(e) = write_batch(&mut file, &mut batch, false).await {
            log::error!("{}: lost records at shutdown: {e}", self.service_name);
        }
        if let Err(e) = file.flush().await {
            log::error!("{}: final flush failed: {e}", self.service_name);
        }
        log::info!("{} stopped", self.service_name);
    }

    fn name(&self) -> &'static str {
        self.service_name
    }

    fn threads(&self) -> Option<usize> {
        Some(1)
    }
}

/// Initializes the global logger. With logging disabled everything is
/// filtered out; otherwise records stream through the returned sink.
pub fn init_logger(enabled: bool, level: LevelFilter, path: PathBuf) -> Option<FileSink> {
    if !enabled {
        Builder::new().filter_level(LevelFilter::Off).init();
        return None;
    }
    let sink = FileSink::plugin_log(path);
    Builder::from_env(env_logger::Env::default())
        .filter(None, level)
        .target(env_logger::Target::Pipe(Box::new(sink.writer())))
        .init();
    Some(sink)
}
