//! Flow-controlled delivery of rendered outputs.
//!
//! Each download runs through a capacity-one channel between a file pump task
//! and the HTTP response body. The pump only ever holds one chunk it could
//! not hand over, so a slow client parks the transfer at a single buffered
//! chunk instead of pulling the whole file into memory.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Configuration for output delivery.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Maximum number of concurrent downloads across all addresses.
    pub max_streams: usize,
    /// Read size per chunk, in bytes.
    pub chunk_size: usize,
    /// Remove the output file once it has been fully handed to the client.
    pub delete_after_send: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_streams: 10,
            chunk_size: 64 * 1024,
            delete_after_send: true,
        }
    }
}

struct Session {
    id: u64,
    cancel: CancellationToken,
}

/// How a pump task ended.
enum StreamOutcome {
    /// Every chunk was accepted by the receiver.
    Completed,
    /// Cancelled: a newer stream for the same address, or shutdown.
    Superseded,
    /// The response body was dropped before the end of the file.
    Disconnected,
    /// The output file failed mid-read.
    ReadError,
}

/// Hands rendered outputs to clients, one active stream per address.
///
/// Starting a stream first registers it, replacing (and cancelling) any
/// previous stream for the same address; only then is the global capacity
/// checked, so a client re-requesting its download never competes with its
/// own dying stream for a slot.
pub struct OutputStreamer {
    config: StreamConfig,
    sessions: Mutex<HashMap<IpAddr, Session>>,
    next_id: AtomicU64,
}

impl OutputStreamer {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Number of streams currently registered.
    pub fn active_streams(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Begin streaming the file at `path` to `address`.
    ///
    /// Returns the response stream together with the file size, or an error
    /// when the output is missing or capacity is exhausted.
    pub async fn start(
        self: &Arc<Self>,
        address: IpAddr,
        path: PathBuf,
    ) -> Result<DownloadStream> {
        let session_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        let active = {
            let mut sessions = self.sessions.lock();
            if let Some(previous) = sessions.insert(
                address,
                Session {
                    id: session_id,
                    cancel: cancel.clone(),
                },
            ) {
                previous.cancel.cancel();
                info!(address = %address, "superseding previous stream for address");
            }
            sessions.len()
        };
        if active > self.config.max_streams {
            self.release(address, session_id);
            return Err(Error::StreamCapacity {
                active: active - 1,
                max: self.config.max_streams,
            });
        }

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => {
                self.release(address, session_id);
                return Err(Error::OutputMissing { path });
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.release(address, session_id);
                return Err(Error::OutputMissing { path });
            }
            Err(err) => {
                self.release(address, session_id);
                return Err(err.into());
            }
        };
        let size = metadata.len();
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(err) => {
                self.release(address, session_id);
                return Err(err.into());
            }
        };

        let (tx, rx) = mpsc::channel(1);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.pump(address, session_id, cancel, file, path, tx).await;
        });

        Ok(DownloadStream { size, rx })
    }

    /// Cancel every active stream; used at shutdown.
    pub fn close_all(&self) {
        let mut sessions = self.sessions.lock();
        for (_, session) in sessions.drain() {
            session.cancel.cancel();
        }
    }

    /// Drop the session entry, unless a newer stream already replaced it.
    fn release(&self, address: IpAddr, session_id: u64) {
        let mut sessions = self.sessions.lock();
        if sessions
            .get(&address)
            .is_some_and(|session| session.id == session_id)
        {
            sessions.remove(&address);
        }
    }

    async fn pump(
        self: Arc<Self>,
        address: IpAddr,
        session_id: u64,
        cancel: CancellationToken,
        mut file: File,
        path: PathBuf,
        tx: mpsc::Sender<std::io::Result<Bytes>>,
    ) {
        let outcome = Self::pump_file(self.config.chunk_size, &cancel, &mut file, &tx).await;
        self.release(address, session_id);

        match outcome {
            StreamOutcome::Completed => {
                debug!(address = %address, path = %path.display(), "stream completed");
                if self.config.delete_after_send {
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => debug!(path = %path.display(), "removed output after send"),
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(err) => {
                            warn!(path = %path.display(), error = %err, "failed to remove sent output");
                        }
                    }
                }
            }
            StreamOutcome::Superseded => info!(address = %address, "stream cancelled"),
            StreamOutcome::Disconnected => {
                debug!(address = %address, "client left before the end of the stream");
            }
            // A file that fails mid-read is not worth retrying against.
            StreamOutcome::ReadError => {
                warn!(address = %address, path = %path.display(), "stream failed while reading output");
                if let Err(err) = tokio::fs::remove_file(&path).await
                    && err.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(path = %path.display(), error = %err, "failed to remove unreadable output");
                }
            }
        }
    }

    /// The transfer loop. Alternates between reading one chunk and draining
    /// it into the channel; with its capacity of one, channel writability is
    /// the signal that the client consumed the previous chunk.
    async fn pump_file(
        chunk_size: usize,
        cancel: &CancellationToken,
        file: &mut File,
        tx: &mpsc::Sender<std::io::Result<Bytes>>,
    ) -> StreamOutcome {
        enum Flow {
            Reading,
            Draining(Bytes),
        }

        let mut flow = Flow::Reading;
        loop {
            match flow {
                Flow::Reading => {
                    let mut buf = BytesMut::with_capacity(chunk_size);
                    tokio::select! {
                        _ = cancel.cancelled() => return StreamOutcome::Superseded,
                        read = file.read_buf(&mut buf) => match read {
                            // End of file: completion means the receiver also
                            // drained the final chunk, which is exactly when
                            // the capacity-one channel becomes writable again.
                            Ok(0) => {
                                tokio::select! {
                                    _ = cancel.cancelled() => return StreamOutcome::Superseded,
                                    permit = tx.reserve() => {
                                        return match permit {
                                            Ok(_) => StreamOutcome::Completed,
                                            Err(_) => StreamOutcome::Disconnected,
                                        };
                                    }
                                }
                            }
                            Ok(_) => flow = Flow::Draining(buf.freeze()),
                            Err(err) => {
                                let _ = tx.try_send(Err(err));
                                return StreamOutcome::ReadError;
                            }
                        }
                    }
                }
                Flow::Draining(chunk) => match tx.try_send(Ok(chunk)) {
                    Ok(()) => flow = Flow::Reading,
                    Err(TrySendError::Full(retained)) => {
                        tokio::select! {
                            _ = cancel.cancelled() => return StreamOutcome::Superseded,
                            permit = tx.reserve() => match permit {
                                Ok(permit) => {
                                    permit.send(retained);
                                    flow = Flow::Reading;
                                }
                                Err(_) => return StreamOutcome::Disconnected,
                            }
                        }
                    }
                    Err(TrySendError::Closed(_)) => return StreamOutcome::Disconnected,
                },
            }
        }
    }
}

/// Response body stream for one download, plus the output's size for the
/// `Content-Length` header.
#[derive(Debug)]
pub struct DownloadStream {
    size: u64,
    rx: mpsc::Receiver<std::io::Result<Bytes>>,
}

impl DownloadStream {
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Stream for DownloadStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
