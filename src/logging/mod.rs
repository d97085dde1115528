//! Logging bootstrap
//!
//! env_logger initialization with an optional asynchronous log-file pipe:
//! log lines go through an unbounded channel into a buffered file writer
//! task, so request workers never block on disk.

use std::io::{self, Write};

use env_logger::Builder;
use log::LevelFilter;
use tokio::{
    fs::{create_dir_all, metadata, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        watch,
    },
};

use crate::config;

pub struct AsyncWriter {
    sender: UnboundedSender<Vec<u8>>,
}

impl Write for AsyncWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let data = buf.to_vec();
        self.sender
            .send(data)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct Logger {
    sender: UnboundedSender<Vec<u8>>,
    receiver: UnboundedReceiver<Vec<u8>>,
    config: config::Log,
}

impl Logger {
    pub fn new(config: config::Log) -> Self {
        let (sender, receiver) = unbounded_channel::<Vec<u8>>();
        Self {
            sender,
            receiver,
            config,
        }
    }

    fn create_async_writer(&self) -> AsyncWriter {
        AsyncWriter {
            sender: self.sender.clone(),
        }
    }

    fn level_filter(&self) -> LevelFilter {
        self.config
            .level
            .as_deref()
            .and_then(|level| level.parse().ok())
            .unwrap_or(LevelFilter::Info)
    }

    /// Initialize env_logger, piped through the async writer when a log
    /// file is configured.
    pub fn init_env_logger(&self) {
        let mut builder = Builder::from_env(env_logger::Env::default());
        builder.filter(None, self.level_filter());
        if self.config.path.is_some() {
            let writer = self.create_async_writer();
            builder.target(env_logger::Target::Pipe(Box::new(writer)));
        }
        builder.init();
    }

    /// Drain log lines into the configured file until shutdown flips.
    /// No-op when no file path is configured.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let Some(log_file_path) = self.config.path.clone() else {
            return;
        };

        if let Some(parent) = std::path::Path::new(&log_file_path).parent() {
            if metadata(parent).await.is_err() {
                if let Err(e) = create_dir_all(parent).await {
                    eprintln!("Failed to create log path: {e}");
                    return;
                }
            }
        }

        let file = match OpenOptions::new()
            .append(true)
            .create(true)
            .open(&log_file_path)
            .await
        {
            Ok(file) => file,
            Err(e) => {
                eprintln!("Failed to open or create log file: {e}");
                return;
            }
        };
        let mut file = BufWriter::new(file);

        loop {
            tokio::select! {
                biased;
                // Shutdown signal handling
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("Shutdown signal received, stopping write log");
                        break;
                    }
                },

                data = self.receiver.recv() => {
                    match data {
                        Some(data) => {
                            if let Err(e) = file.write_all(&data).await {
                                eprintln!("Failed to write to log file: {e}");
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        if let Err(e) = file.flush().await {
            eprintln!("Failed to flush log file: {e}");
        }
    }
}
