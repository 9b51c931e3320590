//! Background preparation of open segment files.
//!
//! Appends never wait for file allocation on the happy path: a background preparer keeps a
//! small pool of pre-allocated open segments ready. A consumer dequeues a ready segment, or
//! waits for the in-flight creation to complete. On close, pending acquisitions are flushed
//! with `Canceled`, unused prepared files are removed, and an in-flight creation is marked
//! canceled so that its completion only cleans up after itself.

use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use bytes::BufMut;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::StoreError;
use crate::segment;

/// Number of open segments that we try to keep ready for writing.
const TARGET_POOL_SIZE: usize = 2;

/// A pre-allocated open segment, ready for appends.
pub(crate) struct PreparedSegment {
    /// The segment counter, embedded in its `open-<counter>` filename.
    pub counter: u64,
    /// The path of the segment file.
    pub path: PathBuf,
    /// The segment file, with the format header already written.
    pub file: fs::File,
}

enum PrepareMsg {
    Acquire(oneshot::Sender<Result<PreparedSegment, StoreError>>),
    Close(oneshot::Sender<()>),
}

/// A handle to the background segment preparer.
pub(crate) struct Preparer {
    tx: mpsc::UnboundedSender<PrepareMsg>,
}

impl Preparer {
    /// Spawn the preparer for the given directory.
    ///
    /// `next_counter` must be greater than the counter of any open segment already on disk.
    pub(crate) fn spawn(dir: PathBuf, segment_size: u64, next_counter: u64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = PrepareTask {
            dir,
            segment_size,
            next_counter,
            rx,
            pool: VecDeque::new(),
            pending: VecDeque::new(),
            inflight: None,
            closing: false,
        };
        tokio::spawn(task.run());
        Self { tx }
    }

    /// Acquire a prepared segment, waiting for one to be created if the pool is empty.
    pub(crate) async fn acquire(&self) -> Result<PreparedSegment, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(PrepareMsg::Acquire(tx)).map_err(|_| StoreError::Canceled)?;
        rx.await.map_err(|_| StoreError::Canceled)?
    }

    /// Shut the preparer down, removing unused prepared segments.
    pub(crate) async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(PrepareMsg::Close(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

struct PrepareTask {
    dir: PathBuf,
    segment_size: u64,
    next_counter: u64,
    rx: mpsc::UnboundedReceiver<PrepareMsg>,
    pool: VecDeque<PreparedSegment>,
    pending: VecDeque<oneshot::Sender<Result<PreparedSegment, StoreError>>>,
    inflight: Option<JoinHandle<Result<PreparedSegment, StoreError>>>,
    closing: bool,
}

impl PrepareTask {
    async fn run(mut self) {
        loop {
            self.maybe_prepare_segment();
            self.process_pending();

            if self.closing && self.inflight.is_none() {
                return;
            }

            let mut inflight = self.inflight.take();
            let inflight_active = inflight.is_some();
            tokio::select! {
                msg = self.rx.recv() => {
                    self.inflight = inflight;
                    match msg {
                        Some(PrepareMsg::Acquire(tx)) => {
                            if self.closing {
                                let _ = tx.send(Err(StoreError::Canceled));
                            } else {
                                self.pending.push_back(tx);
                            }
                        }
                        Some(PrepareMsg::Close(done)) => {
                            self.begin_close();
                            let _ = done.send(());
                        }
                        None => {
                            self.begin_close();
                        }
                    }
                },
                res = async { inflight.as_mut().expect("guarded by branch precondition").await }, if inflight_active => {
                    match res {
                        Ok(Ok(prepared)) => {
                            if self.closing {
                                // Creation was canceled: the completion only cleans up.
                                tracing::debug!(file=?prepared.path, "canceled creation of prepared segment");
                                let _ = fs::remove_file(&prepared.path);
                            } else {
                                tracing::debug!(file=?prepared.path, "completed creation of prepared segment");
                                self.pool.push_back(prepared);
                            }
                        }
                        Ok(Err(err)) => {
                            // A failed creation fails every waiting acquisition; the store
                            // surfaces this as an I/O error and refuses further appends.
                            tracing::error!(error=%err, "failed to create prepared segment");
                            self.fail_pending();
                        }
                        Err(join_err) => {
                            tracing::error!(error=%join_err, "prepared segment creation task panicked");
                            self.fail_pending();
                        }
                    }
                }
            }
        }
    }

    /// If the pool is below target and no creation is in flight, start creating a segment.
    fn maybe_prepare_segment(&mut self) {
        if self.closing || self.inflight.is_some() || self.pool.len() >= TARGET_POOL_SIZE {
            return;
        }
        let counter = self.next_counter;
        self.next_counter += 1;
        let dir = self.dir.clone();
        let size = self.segment_size;
        self.inflight = Some(tokio::task::spawn_blocking(move || create_segment(&dir, counter, size)));
    }

    /// Serve waiting acquisitions from the pool.
    fn process_pending(&mut self) {
        while !self.pending.is_empty() && !self.pool.is_empty() {
            let tx = self.pending.pop_front().expect("pending checked non-empty");
            let prepared = self.pool.pop_front().expect("pool checked non-empty");
            let _ = tx.send(Ok(prepared));
        }
    }

    fn fail_pending(&mut self) {
        for tx in self.pending.drain(..) {
            let _ = tx.send(Err(StoreError::Canceled));
        }
    }

    fn begin_close(&mut self) {
        self.closing = true;
        // Flush pending acquisitions.
        for tx in self.pending.drain(..) {
            let _ = tx.send(Err(StoreError::Canceled));
        }
        // Remove unused prepared segments.
        for prepared in self.pool.drain(..) {
            let _ = fs::remove_file(&prepared.path);
        }
        // An in-flight creation keeps running; its completion cleans up (see `run`).
    }
}

/// Create and pre-allocate one open segment file, leaving its format header in place.
fn create_segment(dir: &Path, counter: u64, size: u64) -> Result<PreparedSegment, StoreError> {
    let path = dir.join(segment::open_name(counter));
    let mut file = fs::OpenOptions::new().create_new(true).read(true).write(true).open(&path)?;
    file.set_len(size)?;

    let mut header = Vec::with_capacity(segment::SEGMENT_HEADER_SIZE as usize);
    header.put_u64_le(segment::SEGMENT_FORMAT);
    file.write_all(&header)?;
    file.sync_all()?;
    crate::snapshot::sync_dir(dir)?;

    Ok(PreparedSegment { counter, path, file })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_returns_distinct_prepared_segments() {
        let dir = tempfile::tempdir().unwrap();
        let preparer = Preparer::spawn(dir.path().to_path_buf(), 4096, 1);

        let first = preparer.acquire().await.unwrap();
        let second = preparer.acquire().await.unwrap();
        assert_ne!(first.counter, second.counter);
        assert!(first.path.exists());
        assert!(second.path.exists());
        assert_eq!(first.file.metadata().unwrap().len(), 4096);

        preparer.close().await;
    }

    #[tokio::test]
    async fn close_removes_unused_segments_and_cancels_acquires() {
        let dir = tempfile::tempdir().unwrap();
        let preparer = Preparer::spawn(dir.path().to_path_buf(), 4096, 1);

        // Let the pool fill, then close.
        let held = preparer.acquire().await.unwrap();
        preparer.close().await;

        // The handed-out segment is the caller's business; everything else is gone.
        let remaining: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().map(String::from))
            .filter(|name| segment::parse_open_name(name).is_some())
            .collect();
        assert_eq!(remaining, vec![held.path.file_name().unwrap().to_str().unwrap().to_string()]);

        assert!(matches!(preparer.acquire().await, Err(StoreError::Canceled)));
    }
}
