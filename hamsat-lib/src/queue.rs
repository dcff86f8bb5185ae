//! Durable, class-segregated forwarding queues.
//!
//! Frames from relay-flagged spacecraft are appended to a per-class log file
//! and queued in memory; a single background dispatcher retries delivery to
//! each craft's relay target until it is confirmed, so a restart replays
//! whatever was not yet delivered. Order is FIFO within a class; there is no
//! ordering across classes.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::frame::FrameDecoder;
use crate::spacecraft::{RelayTarget, SpacecraftId, SpacecraftRegistry};
use crate::{Error, Result};

/// Downlink class a frame is queued and relayed under.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum QueueClass {
    #[default]
    LowRate,
    HighRate,
    AltModulation,
}

impl QueueClass {
    pub const ALL: [QueueClass; 3] =
        [QueueClass::LowRate, QueueClass::HighRate, QueueClass::AltModulation];

    #[must_use]
    pub fn log_name(self) -> &'static str {
        match self {
            QueueClass::LowRate => "low_rate.log",
            QueueClass::HighRate => "high_rate.log",
            QueueClass::AltModulation => "alt_modulation.log",
        }
    }

    fn index(self) -> usize {
        match self {
            QueueClass::LowRate => 0,
            QueueClass::HighRate => 1,
            QueueClass::AltModulation => 2,
        }
    }
}

/// One queued frame, exactly as received, awaiting relay delivery.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub spacecraft: SpacecraftId,
    pub class: QueueClass,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// A FIFO queue of [`QueueEntry`]s backed by an append-only log file.
///
/// Enqueue, peek, and commit-dequeue are each atomic: the log write and the
/// in-memory queue update happen under one lock, so producers on many
/// connection workers and the single dispatcher never see them disagree.
pub struct DurableQueue {
    path: PathBuf,
    entries: Mutex<VecDeque<QueueEntry>>,
}

impl DurableQueue {
    /// Open the queue at `path`, replaying any entries not yet delivered.
    ///
    /// Replay stops at the first undecodable line; entries before it are
    /// kept and the log is rewritten to that good prefix. Skipping onward
    /// would risk replaying a half-written record as a frame.
    ///
    /// # Errors
    /// [`Error::Io`] reading or rewriting the log.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut entries = VecDeque::new();
        let mut truncated = false;

        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (lineno, line) in reader.lines().enumerate() {
                let line = line?;
                match serde_json::from_str::<QueueEntry>(&line) {
                    Ok(entry) => entries.push_back(entry),
                    Err(err) => {
                        warn!(
                            ?path,
                            line = lineno + 1,
                            %err,
                            "corrupt queue log entry, truncating to good prefix"
                        );
                        truncated = true;
                        break;
                    }
                }
            }
        }

        let queue = DurableQueue {
            path,
            entries: Mutex::new(entries),
        };
        if truncated {
            queue.rewrite_locked(&queue.entries.lock().expect("queue lock poisoned"))?;
        }
        Ok(queue)
    }

    /// Append `entry` to the log, then enqueue it.
    ///
    /// # Errors
    /// [`Error::QueuePersist`] when the log write fails; the entry is not
    /// enqueued in that case.
    pub fn enqueue(&self, entry: QueueEntry) -> Result<()> {
        let mut entries = self.entries.lock().expect("queue lock poisoned");
        let line = serde_json::to_string(&entry)
            .map_err(|err| Error::QueuePersist(err.to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| Error::QueuePersist(format!("{}: {err}", self.path.display())))?;
        writeln!(file, "{line}")
            .and_then(|()| file.flush())
            .map_err(|err| Error::QueuePersist(format!("{}: {err}", self.path.display())))?;
        entries.push_back(entry);
        Ok(())
    }

    /// The head entry, without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<QueueEntry> {
        self.entries
            .lock()
            .expect("queue lock poisoned")
            .front()
            .cloned()
    }

    /// Remove the head entry after confirmed delivery and compact the log.
    ///
    /// # Errors
    /// [`Error::Io`] rewriting the log. The in-memory head is removed first,
    /// so a failed compaction means at worst a redelivery after restart.
    pub fn commit_dequeue(&self) -> Result<()> {
        let mut entries = self.entries.lock().expect("queue lock poisoned");
        entries.pop_front();
        self.rewrite_locked(&entries)
    }

    /// Rewrite the log to match `entries`. Caller holds the lock.
    fn rewrite_locked(&self, entries: &VecDeque<QueueEntry>) -> Result<()> {
        let tmp = self.path.with_extension("log.tmp");
        {
            let mut file = File::create(&tmp)?;
            for entry in entries {
                let line = serde_json::to_string(entry)
                    .map_err(|err| Error::QueuePersist(err.to_string()))?;
                writeln!(file, "{line}")?;
            }
            file.flush()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("queue lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the log file and every queued entry.
    ///
    /// # Errors
    /// [`Error::Io`] removing the log.
    pub fn clear(&self) -> Result<()> {
        let mut entries = self.entries.lock().expect("queue lock poisoned");
        entries.clear();
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// The set of per-class durable queues plus the dispatcher that drains them.
pub struct ForwardingQueue {
    queues: [DurableQueue; 3],
}

impl ForwardingQueue {
    /// Open (or create) the queue logs under `dir`.
    ///
    /// # Errors
    /// [`Error::Io`] creating the directory or replaying a log.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        Ok(ForwardingQueue {
            queues: [
                DurableQueue::open(dir.join(QueueClass::LowRate.log_name()))?,
                DurableQueue::open(dir.join(QueueClass::HighRate.log_name()))?,
                DurableQueue::open(dir.join(QueueClass::AltModulation.log_name()))?,
            ],
        })
    }

    #[must_use]
    pub fn queue(&self, class: QueueClass) -> &DurableQueue {
        &self.queues[class.index()]
    }

    /// Durably enqueue a frame for relay.
    ///
    /// # Errors
    /// [`Error::QueuePersist`] when the class log cannot be appended.
    pub fn add(&self, entry: QueueEntry) -> Result<()> {
        self.queue(entry.class).enqueue(entry)
    }

    #[must_use]
    pub fn len(&self, class: QueueClass) -> usize {
        self.queue(class).len()
    }

    #[must_use]
    pub fn total_len(&self) -> usize {
        self.queues.iter().map(DurableQueue::len).sum()
    }

    /// Administrative reset: drop all class logs and queued entries. Data
    /// loss is accepted; this exists to recover from log corruption.
    ///
    /// # Errors
    /// [`Error::Io`] removing a log file.
    pub fn delete(&self) -> Result<()> {
        for queue in &self.queues {
            queue.clear()?;
        }
        Ok(())
    }
}

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How long the dispatcher sleeps between poll cycles.
    pub poll_interval: Duration,
    /// Pause between successive deliveries so the receiver can keep up.
    pub pacing: Duration,
    /// Connect and write timeout for one delivery attempt.
    pub io_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            poll_interval: Duration::from_secs(1),
            pacing: Duration::from_millis(100),
            io_timeout: Duration::from_secs(10),
        }
    }
}

enum Outcome {
    Delivered,
    /// Entry can never be delivered; commit it away.
    Discard,
    /// Transient failure; retry the same head next cycle.
    Failed,
}

/// Handle to the background dispatcher thread.
pub struct Dispatcher {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Start draining `queue` in a background thread.
    ///
    /// # Panics
    /// If the thread cannot be spawned.
    #[must_use]
    pub fn start(
        queue: Arc<ForwardingQueue>,
        registry: Arc<SpacecraftRegistry>,
        config: DispatcherConfig,
    ) -> Self {
        let (stop_tx, stop_rx) = bounded(1);
        let handle = thread::Builder::new()
            .name("forward_dispatcher".into())
            .spawn(move || run_dispatcher(&queue, &registry, &config, &stop_rx))
            .expect("failed to spawn dispatcher thread");
        Dispatcher {
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Stop after the current poll cycle and wait for the thread.
    pub fn shutdown(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("dispatcher thread panicked");
            }
        }
    }
}

fn run_dispatcher(
    queue: &ForwardingQueue,
    registry: &Arc<SpacecraftRegistry>,
    config: &DispatcherConfig,
    stop_rx: &Receiver<()>,
) {
    info!("forward dispatcher started");
    loop {
        match stop_rx.recv_timeout(config.poll_interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        for class in QueueClass::ALL {
            let q = queue.queue(class);
            while let Some(entry) = q.peek() {
                match deliver(registry, &entry, config) {
                    Outcome::Delivered => {
                        if let Err(err) = q.commit_dequeue() {
                            error!(%err, ?class, "could not remove delivered frame from log; it will be resent");
                            break;
                        }
                        thread::sleep(config.pacing);
                    }
                    Outcome::Discard => {
                        if let Err(err) = q.commit_dequeue() {
                            error!(%err, ?class, "could not drop queue entry");
                            break;
                        }
                    }
                    // head entry stays put and is retried next cycle;
                    // entries behind it wait
                    Outcome::Failed => break,
                }
            }
        }
    }
    info!("forward dispatcher stopped");
}

fn deliver(
    registry: &Arc<SpacecraftRegistry>,
    entry: &QueueEntry,
    config: &DispatcherConfig,
) -> Outcome {
    let Some(craft) = registry.lookup(entry.spacecraft) else {
        warn!(id = entry.spacecraft, "queued frame for unknown spacecraft, dropping");
        return Outcome::Discard;
    };
    let Some(target) = craft.forward.clone() else {
        warn!(id = entry.spacecraft, "spacecraft no longer relay-flagged, dropping queued frame");
        return Outcome::Discard;
    };
    let frame = match FrameDecoder::decode_frame(registry, &entry.data) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(id = entry.spacecraft, %err, "queued frame is not decodable, dropping");
            return Outcome::Discard;
        }
    };

    let buffers = frame.relay_buffers();
    debug!(
        host = %target.host,
        port = target.port,
        buffers = buffers.len(),
        "trying relay server"
    );
    match send_buffers(&target, &buffers, config.io_timeout) {
        Ok(()) => {
            info!(id = entry.spacecraft, host = %target.host, port = target.port, "frame relayed");
            Outcome::Delivered
        }
        Err(err) => {
            info!(host = %target.host, port = target.port, %err, "could not reach relay server, will retry");
            Outcome::Failed
        }
    }
}

fn send_buffers(target: &RelayTarget, buffers: &[Vec<u8>], timeout: Duration) -> io::Result<()> {
    let addr = (target.host.as_str(), target.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "relay host did not resolve"))?;
    let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_write_timeout(Some(timeout))?;
    for buffer in buffers {
        stream.write_all(buffer)?;
    }
    stream.flush()?;
    Ok(())
}
