//! Spillable pipe: a unidirectional buffer between a producer and a consumer
//! that transparently overflows from memory to a temporary file.
//!
//! `write` returns `false` once the in-memory watermark is crossed; the
//! producer must then await `committed()` before writing more. The excess is
//! streamed to a spill file by a background flusher and delivered to the
//! consumer, strictly in write order, before any newer in-memory bytes. The
//! spill file is private to the pipe and unlinked when the pipe is dropped.

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::trace;

const FILE_READ_CHUNK: usize = 16 * 1024;

static SPILL_SEQ: AtomicU64 = AtomicU64::new(0);

/// Creates a connected writer/reader pair. Bytes buffered beyond `watermark`
/// are spilled to a file under `temp_dir`.
pub fn spill_pipe(temp_dir: impl Into<PathBuf>, watermark: usize) -> (PipeWriter, PipeReader) {
    let shared = Arc::new(Shared {
        temp_dir: temp_dir.into(),
        watermark,
        state: Mutex::new(State::default()),
        data_ready: Notify::new(),
        commit_done: Notify::new(),
    });
    (
        PipeWriter {
            shared: shared.clone(),
        },
        PipeReader {
            shared,
            file: None,
        },
    )
}

#[derive(Default)]
struct State {
    /// In-memory queue; always newer than anything in the spill file.
    memory: VecDeque<Bytes>,
    mem_bytes: usize,
    /// Bytes handed to the flusher but not yet durable in the file.
    to_disk: VecDeque<Bytes>,
    committing: bool,
    flusher_running: bool,
    spill_path: Option<PathBuf>,
    /// Bytes written to the spill file so far.
    flushed: u64,
    /// Bytes the reader has taken back out of the spill file.
    read_off: u64,
    /// Tail pushed back by the consumer; delivered before everything else.
    pushed_back: Option<Bytes>,
    ended: bool,
    error: Option<String>,
}

struct Shared {
    temp_dir: PathBuf,
    watermark: usize,
    state: Mutex<State>,
    data_ready: Notify,
    commit_done: Notify,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(path) = state.spill_path.take() {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

fn terminal_error(message: &str) -> std::io::Error {
    std::io::Error::other(message.to_string())
}

/// Producer half of a spillable pipe.
pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// Queues `data` for delivery. Returns `true` if it was accepted in
    /// memory, `false` if the pipe has begun committing to disk; in the
    /// latter case the producer must await [`PipeWriter::committed`] before
    /// writing more.
    pub fn write(&mut self, data: Bytes) -> std::io::Result<bool> {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(msg) = &state.error {
            return Err(terminal_error(msg));
        }
        if state.ended {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "write after end",
            ));
        }
        if data.is_empty() {
            return Ok(true);
        }

        if state.committing {
            // Producer got ahead of the commit signal; keep ordering by
            // routing the bytes through the disk queue.
            state.to_disk.push_back(data);
            return Ok(false);
        }

        state.mem_bytes += data.len();
        state.memory.push_back(data);

        if state.mem_bytes > self.shared.watermark {
            let queued: Vec<Bytes> = state.memory.drain(..).collect();
            state.to_disk.extend(queued);
            state.mem_bytes = 0;
            state.committing = true;
            if !state.flusher_running {
                state.flusher_running = true;
                tokio::spawn(flush_loop(self.shared.clone()));
            }
            Ok(false)
        } else {
            self.shared.data_ready.notify_one();
            Ok(true)
        }
    }

    /// Resolves once the in-flight disk write has completed and the producer
    /// may write again. Returns immediately when no commit is in progress.
    pub async fn committed(&self) -> std::io::Result<()> {
        loop {
            let notified = self.shared.commit_done.notified();
            {
                let state = self.shared.state.lock().unwrap();
                if let Some(msg) = &state.error {
                    return Err(terminal_error(msg));
                }
                if !state.committing {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Marks no-more-data. The consumer sees EOF after every buffered byte
    /// has been delivered.
    pub fn end(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        state.ended = true;
        self.shared.data_ready.notify_one();
    }

    pub fn is_committing(&self) -> bool {
        self.shared.state.lock().unwrap().committing
    }
}

/// Consumer half of a spillable pipe.
pub struct PipeReader {
    shared: Arc<Shared>,
    file: Option<File>,
}

enum Step {
    Deliver(Bytes),
    ReadFile { path: PathBuf, offset: u64, len: usize },
    Eof,
    Wait,
}

impl PipeReader {
    /// Returns the next chunk in write order, or `None` after the producer
    /// called `end` and every byte has been delivered.
    pub async fn next(&mut self) -> std::io::Result<Option<Bytes>> {
        loop {
            let shared = self.shared.clone();
            let notified = shared.data_ready.notified();
            let step = self.plan_step()?;
            match step {
                Step::Deliver(chunk) => return Ok(Some(chunk)),
                Step::Eof => return Ok(None),
                Step::ReadFile { path, offset, len } => {
                    let chunk = self.read_spilled(&path, offset, len).await?;
                    let mut state = self.shared.state.lock().unwrap();
                    state.read_off += chunk.len() as u64;
                    return Ok(Some(chunk));
                }
                Step::Wait => notified.await,
            }
        }
    }

    /// Pushes back an unconsumed tail; it is delivered again by the next
    /// `next` call, ahead of everything else.
    pub fn unconsume(&mut self, tail: Bytes) {
        if !tail.is_empty() {
            let mut state = self.shared.state.lock().unwrap();
            debug_assert!(state.pushed_back.is_none());
            state.pushed_back = Some(tail);
        }
    }

    fn plan_step(&self) -> std::io::Result<Step> {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(msg) = &state.error {
            return Err(terminal_error(msg));
        }
        if let Some(chunk) = state.pushed_back.take() {
            return Ok(Step::Deliver(chunk));
        }
        if state.read_off < state.flushed {
            let path = state.spill_path.clone().expect("spill file must exist");
            let remaining = (state.flushed - state.read_off) as usize;
            return Ok(Step::ReadFile {
                path,
                offset: state.read_off,
                len: remaining.min(FILE_READ_CHUNK),
            });
        }
        // The spill file is fully drained; older bytes may still be in
        // flight to disk, in which case memory must wait its turn.
        if state.to_disk.is_empty() && !state.committing {
            if let Some(chunk) = state.memory.pop_front() {
                state.mem_bytes -= chunk.len();
                return Ok(Step::Deliver(chunk));
            }
            if state.ended {
                return Ok(Step::Eof);
            }
        }
        Ok(Step::Wait)
    }

    async fn read_spilled(&mut self, path: &PathBuf, offset: u64, len: usize) -> std::io::Result<Bytes> {
        if self.file.is_none() {
            match File::open(path).await {
                Ok(f) => self.file = Some(f),
                Err(e) => return Err(poison_shared(&self.shared, e)),
            }
        }
        let shared = self.shared.clone();
        let file = self.file.as_mut().unwrap();
        if let Err(e) = file.seek(SeekFrom::Start(offset)).await {
            return Err(poison_shared(&shared, e));
        }
        // The range is durable; short reads only happen on I/O failure.
        let mut buf = vec![0u8; len];
        if let Err(e) = file.read_exact(&mut buf).await {
            return Err(poison_shared(&shared, e));
        }
        Ok(Bytes::from(buf))
    }
}

fn poison_shared(shared: &Shared, e: std::io::Error) -> std::io::Error {
    let mut state = shared.state.lock().unwrap();
    if state.error.is_none() {
        state.error = Some(e.to_string());
    }
    shared.data_ready.notify_one();
    shared.commit_done.notify_one();
    e
}

/// Streams queued bytes to the spill file until the queue is empty, then
/// signals the commit and exits. Respawned on the next overflow.
async fn flush_loop(shared: Arc<Shared>) {
    let mut file: Option<File> = None;

    loop {
        let (batch, path) = {
            let mut state = shared.state.lock().unwrap();
            if state.to_disk.is_empty() {
                state.flusher_running = false;
                if state.committing {
                    state.committing = false;
                    shared.commit_done.notify_one();
                }
                shared.data_ready.notify_one();
                return;
            }
            let batch: Vec<Bytes> = state.to_disk.drain(..).collect();
            if state.spill_path.is_none() {
                let name = format!(
                    "courier.spill.{}.{}",
                    std::process::id(),
                    SPILL_SEQ.fetch_add(1, Ordering::Relaxed)
                );
                state.spill_path = Some(shared.temp_dir.join(name));
            }
            (batch, state.spill_path.clone().unwrap())
        };

        if file.is_none() {
            match OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(f) => file = Some(f),
                Err(e) => {
                    fail_flush(&shared, e);
                    return;
                }
            }
        }

        let handle = file.as_mut().unwrap();
        let mut written = 0u64;
        for chunk in &batch {
            if let Err(e) = handle.write_all(chunk).await {
                fail_flush(&shared, e);
                return;
            }
            written += chunk.len() as u64;
        }
        if let Err(e) = handle.flush().await {
            fail_flush(&shared, e);
            return;
        }

        trace!(bytes = written, path = %path.display(), "spilled to disk");
        let mut state = shared.state.lock().unwrap();
        state.flushed += written;
        shared.data_ready.notify_one();
    }
}

fn fail_flush(shared: &Shared, e: std::io::Error) {
    let mut state = shared.state.lock().unwrap();
    if state.error.is_none() {
        state.error = Some(format!("spill file write failed: {e}"));
    }
    state.flusher_running = false;
    state.committing = false;
    shared.data_ready.notify_one();
    shared.commit_done.notify_one();
}
