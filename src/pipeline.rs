//! Outbound send path
//!
//! Producers serialize messages into an active [`SendBuffer`] under the fill
//! lock; [`SendPipeline::push`] moves that buffer onto a FIFO guarded by a
//! separate queue lock, and one writer thread per device drains the queue
//! into an [`OutputSink`]. A slow write therefore never blocks a producer.
//!
//! Buffers cycle pool -> active -> queue -> writer -> pool and have exactly
//! one owner at every step: they are moved, never shared.
//!
//! Ordering holds per producer thread. Commits from several threads to the
//! same pipeline interleave in lock-acquisition order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::midi::{cc, convert, Message};

/// Destination of the writer thread
pub trait OutputSink: Send + Sync + 'static {
    /// Blocking write of one buffer's contents
    fn write(&self, bytes: &[u8]) -> Result<()>;

    /// Called after `write` fails. No retry follows.
    fn write_failed(&self, _error: &Error) {}
}

/// Fixed-capacity byte buffer recycled through a [`SendBufferPool`]
#[derive(Debug)]
pub struct SendBuffer {
    id: u64,
    data: Box<[u8]>,
    write_pos: usize,
    full: bool,
}

impl SendBuffer {
    fn new(id: u64, capacity: usize) -> Self {
        Self {
            id,
            data: vec![0u8; capacity].into_boxed_slice(),
            write_pos: 0,
            full: false,
        }
    }

    /// Pool-assigned identity, stable across reuse
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.write_pos
    }

    pub fn is_empty(&self) -> bool {
        self.write_pos == 0
    }

    /// Set after a message did not fit; further messages are refused
    pub fn is_full(&self) -> bool {
        self.full
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.write_pos
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.write_pos]
    }

    /// Append a whole message or nothing
    fn append(&mut self, message: &Message) -> bool {
        if self.full {
            return false;
        }
        match message.write_to(&mut self.data[self.write_pos..]) {
            Some(n) => {
                self.write_pos += n;
                true
            }
            None => {
                self.full = true;
                false
            }
        }
    }

    fn reset(&mut self) {
        self.write_pos = 0;
        self.full = false;
    }
}

/// Free list of equally sized send buffers
pub struct SendBufferPool {
    buffer_capacity: usize,
    free: Mutex<Vec<SendBuffer>>,
    next_id: AtomicU64,
}

impl SendBufferPool {
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            buffer_capacity,
            free: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Pop an idle buffer, or allocate one when the free list is empty
    pub fn get_buffer(&self) -> SendBuffer {
        if let Some(buffer) = self.free.lock().pop() {
            return buffer;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        trace!("Allocating send buffer #{} ({} bytes)", id, self.buffer_capacity);
        SendBuffer::new(id, self.buffer_capacity)
    }

    /// Reset the write cursor and put the buffer back on the free list
    pub fn return_buffer(&self, mut buffer: SendBuffer) {
        buffer.reset();
        self.free.lock().push(buffer);
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Buffers currently idle in the pool
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Buffers ever allocated by this pool
    pub fn allocated(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }
}

/// What `commit` does with a message that does not fit the active buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Drop the message and refuse further commits until the next push
    #[default]
    Drop,
    /// Enqueue the full buffer and continue in a fresh one
    Flush,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Bytes per send buffer
    pub buffer_capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            buffer_capacity: 4096,
            overflow: OverflowPolicy::Drop,
        }
    }
}

#[derive(Default)]
struct Queue {
    buffers: VecDeque<SendBuffer>,
    shutdown: bool,
}

struct Shared {
    name: String,
    options: PipelineOptions,
    pool: SendBufferPool,
    sink: Arc<dyn OutputSink>,
    /// Fill lock
    active: Mutex<Option<SendBuffer>>,
    /// Queue lock
    queue: Mutex<Queue>,
    queue_signal: Condvar,
    closed: AtomicBool,
    dropped: AtomicU64,
    write_failures: AtomicU64,
}

impl Shared {
    fn fill(&self, active: &mut Option<SendBuffer>, message: &Message) -> Result<()> {
        let buffer = active.get_or_insert_with(|| self.pool.get_buffer());
        let was_full = buffer.is_full();
        if buffer.append(message) {
            return Ok(());
        }

        match self.options.overflow {
            OverflowPolicy::Drop => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                // One warning per buffer
                if !was_full {
                    warn!(
                        "{}: send buffer full ({} bytes), dropping {} and later commits until push",
                        self.name,
                        buffer.capacity(),
                        message
                    );
                }
            }
            OverflowPolicy::Flush => {
                if let Some(full) = active.take() {
                    if !full.is_empty() {
                        self.enqueue(full)?;
                    } else {
                        self.pool.return_buffer(full);
                    }
                }
                let mut fresh = self.pool.get_buffer();
                if !fresh.append(message) {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!("{}: {} does not fit an empty send buffer", self.name, message);
                }
                *active = Some(fresh);
            }
        }
        Ok(())
    }

    /// Hand `buffer` to the writer. Fails once the writer has been told to stop.
    fn enqueue(&self, buffer: SendBuffer) -> Result<()> {
        let mut queue = self.queue.lock();
        if queue.shutdown {
            drop(queue);
            self.pool.return_buffer(buffer);
            return Err(Error::PipelineClosed);
        }
        queue.buffers.push_back(buffer);
        drop(queue);
        self.queue_signal.notify_one();
        Ok(())
    }

    fn run_writer(&self) {
        debug!("Writer thread for '{}' started", self.name);
        loop {
            let buffer = {
                let mut queue = self.queue.lock();
                loop {
                    if let Some(buffer) = queue.buffers.pop_front() {
                        break buffer;
                    }
                    if queue.shutdown {
                        debug!("Writer thread for '{}' exiting", self.name);
                        return;
                    }
                    self.queue_signal.wait(&mut queue);
                }
            };

            self.write(&buffer);
            self.pool.return_buffer(buffer);
        }
    }

    fn write(&self, buffer: &SendBuffer) {
        let bytes = buffer.as_bytes();
        match self.sink.write(bytes) {
            Ok(()) => trace!("{}: wrote {} byte(s)", self.name, bytes.len()),
            Err(Error::NotConnected) => {
                debug!("{}: output not connected, discarding {} byte(s)", self.name, bytes.len());
            }
            Err(e) => {
                self.write_failures.fetch_add(1, Ordering::Relaxed);
                warn!("{}: write of {} byte(s) failed: {}", self.name, bytes.len(), e);
                self.sink.write_failed(&e);
            }
        }
    }
}

/// Pooled, single-writer outbound pipeline for one device
pub struct SendPipeline {
    shared: Arc<Shared>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl SendPipeline {
    /// Start the writer thread. `name` shows up in logs and the thread name.
    pub fn new(name: impl Into<String>, sink: Arc<dyn OutputSink>, options: PipelineOptions) -> Result<Self> {
        let name = name.into();
        let shared = Arc::new(Shared {
            pool: SendBufferPool::new(options.buffer_capacity),
            name: name.clone(),
            options,
            sink,
            active: Mutex::new(None),
            queue: Mutex::new(Queue::default()),
            queue_signal: Condvar::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
        });

        let writer_shared = shared.clone();
        let writer = thread::Builder::new()
            .name(format!("midi-writer-{}", name))
            .spawn(move || writer_shared.run_writer())
            .map_err(|e| Error::Backend(format!("failed to spawn writer thread: {}", e)))?;

        Ok(Self {
            shared,
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Take the fill lock, failing once `shutdown` has started.
    ///
    /// `closed` is set under this lock, so a caller that gets the guard
    /// finishes before `shutdown` stops the writer.
    fn lock_active(&self) -> Result<MutexGuard<'_, Option<SendBuffer>>> {
        let active = self.shared.active.lock();
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::PipelineClosed);
        }
        Ok(active)
    }

    /// Serialize `message` into the active buffer. Never blocks on I/O.
    pub fn commit(&self, message: Message) -> Result<()> {
        let mut active = self.lock_active()?;
        self.shared.fill(&mut active, &message)
    }

    /// Commit several messages in order under one fill-lock acquisition
    pub fn commit_all(&self, messages: &[Message]) -> Result<()> {
        let mut active = self.lock_active()?;
        for message in messages {
            self.shared.fill(&mut active, message)?;
        }
        Ok(())
    }

    /// Commit one Control Change per `(controller, value)` pair, in order
    pub fn commit_control_changes(&self, channel: u8, changes: &[(u8, u8)]) -> Result<()> {
        let mut active = self.lock_active()?;
        for &(controller, value) in changes {
            self.shared
                .fill(&mut active, &Message::control_change(channel, controller, value))?;
        }
        Ok(())
    }

    /// Commit a 14-bit NRPN write as NRPN MSB, NRPN LSB, Data Entry MSB,
    /// Data Entry LSB
    pub fn commit_nrpn(&self, channel: u8, parameter: u16, value: u16) -> Result<()> {
        let (param_msb, param_lsb) = convert::split_14bit(parameter);
        let (value_msb, value_lsb) = convert::split_14bit(value);
        self.commit_control_changes(
            channel,
            &[
                (cc::NRPN_MSB, param_msb),
                (cc::NRPN_LSB, param_lsb),
                (cc::DATA_ENTRY_MSB, value_msb),
                (cc::DATA_ENTRY_LSB, value_lsb),
            ],
        )
    }

    /// Hand the active buffer to the writer thread. No-op when nothing was
    /// committed since the last push.
    pub fn push(&self) -> Result<()> {
        let mut active = self.lock_active()?;
        if active.as_ref().map_or(true, SendBuffer::is_empty) {
            return Ok(());
        }
        match active.take() {
            // Enqueue under the fill lock so concurrent pushes keep their order
            Some(buffer) => self.shared.enqueue(buffer),
            None => Ok(()),
        }
    }

    /// Stop accepting commits, let the writer drain the queue, then join it.
    ///
    /// Committed but unpushed bytes are discarded. A hung transport write
    /// stalls this call. Idempotent.
    pub fn shutdown(&self) {
        let unpushed = {
            let mut active = self.shared.active.lock();
            if self.shared.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            active.take()
        };

        if let Some(buffer) = unpushed {
            if !buffer.is_empty() {
                debug!(
                    "{}: discarding {} unpushed byte(s) on shutdown",
                    self.shared.name,
                    buffer.len()
                );
            }
            self.shared.pool.return_buffer(buffer);
        }

        self.shared.queue.lock().shutdown = true;
        self.shared.queue_signal.notify_all();

        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if writer.join().is_err() {
                error!("Writer thread for '{}' panicked", self.shared.name);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn pool(&self) -> &SendBufferPool {
        &self.shared.pool
    }

    /// Buffers waiting for the writer
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().buffers.len()
    }

    /// Messages discarded because they did not fit
    pub fn dropped_messages(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn write_failures(&self) -> u64 {
        self.shared.write_failures.load(Ordering::Relaxed)
    }
}

impl Drop for SendPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}
