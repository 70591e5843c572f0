//! Self-healing port slots
//!
//! A [`ConnectionSlot`] is the logical binding to one port, independent of the
//! physical device plugged in at any moment. Its connection thread searches
//! for a matching port, opens it, watches the enumeration list for it to
//! disappear and starts over, until the slot is closed.
//!
//! Disconnects are inferred by polling [`PortAccess::enumerate`] because
//! backends do not reliably report them. A port missing from the list is a
//! strong but not certain disconnect signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::framer::MessageFramer;
use crate::midi::Message;
use crate::pipeline::OutputSink;
use crate::port::{InputHandle, OutputHandle, PortAccess, PortDescriptor, PortDirection};
use crate::router::{EventRouter, ListenerId};
use crate::search::DeviceSearchTerm;

/// Connection state of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
}

/// Timing for the connection thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotOptions {
    /// Wait between failed search/open attempts
    pub retry_interval: Duration,
    /// Wait between enumeration checks while open
    pub poll_interval: Duration,
}

impl Default for SlotOptions {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(1000),
            poll_interval: Duration::from_millis(1000),
        }
    }
}

/// Direction-specific open/close behaviour plugged into a [`ConnectionSlot`]
pub trait PortBinding: Send + Sync + 'static {
    fn direction(&self) -> PortDirection;

    /// Open `port` and keep whatever handle the binding needs
    fn open(&self, access: &dyn PortAccess, port: &PortDescriptor) -> Result<()>;

    /// Release the handle from the last successful `open`
    fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Cancelled,
    Nudged,
    TimedOut,
}

#[derive(Default)]
struct WakeState {
    cancelled: bool,
    nudged: bool,
}

/// Cancellation token plus an early-wakeup request, waited on with a timeout
#[derive(Default)]
struct Signal {
    state: Mutex<WakeState>,
    cond: Condvar,
}

impl Signal {
    fn wait(&self, timeout: Duration) -> Wake {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.cancelled {
                return Wake::Cancelled;
            }
            if std::mem::take(&mut state.nudged) {
                return Wake::Nudged;
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return if state.cancelled { Wake::Cancelled } else { Wake::TimedOut };
            }
        }
    }

    fn cancel(&self) {
        self.state.lock().cancelled = true;
        self.cond.notify_all();
    }

    fn nudge(&self) {
        self.state.lock().nudged = true;
        self.cond.notify_all();
    }
}

struct SlotInner {
    access: Arc<dyn PortAccess>,
    binding: Arc<dyn PortBinding>,
    direction: PortDirection,
    options: SlotOptions,
    search_term: RwLock<Arc<DeviceSearchTerm>>,
    state: Mutex<ConnectionState>,
    details: Mutex<Option<PortDescriptor>>,
    state_listeners: EventRouter<bool>,
    signal: Signal,
}

impl SlotInner {
    fn run(&self) {
        debug!("Connection thread started for {} slot '{}'", self.direction, self.term());
        let mut attempt = 0usize;

        loop {
            self.transition(ConnectionState::Connecting);
            let term = self.term();

            let port = match self.try_open(&term) {
                Ok(port) => port,
                Err(e) => {
                    attempt += 1;
                    if attempt == 1 {
                        info!("Waiting for {} port matching '{}': {}", self.direction, term, e);
                    } else {
                        debug!("{} slot attempt #{} for '{}': {}", self.direction, attempt, term, e);
                    }
                    if self.signal.wait(self.options.retry_interval) == Wake::Cancelled {
                        break;
                    }
                    continue;
                }
            };

            attempt = 0;
            info!("Connected {} port: {}", self.direction, port);
            *self.details.lock() = Some(port.clone());
            self.transition(ConnectionState::Open);

            let cancelled = self.monitor(&port);

            self.transition(ConnectionState::Closed);
            self.binding.close();

            if cancelled {
                info!("Closed {} port '{}'", self.direction, port.name);
                break;
            }
            warn!("🔌 MIDI {} '{}' disconnected, searching again", self.direction, port.name);
        }

        self.transition(ConnectionState::Closed);
        debug!("Connection thread for {} slot exited", self.direction);
    }

    fn term(&self) -> Arc<DeviceSearchTerm> {
        self.search_term.read().clone()
    }

    fn try_open(&self, term: &DeviceSearchTerm) -> Result<PortDescriptor> {
        let candidates = self.access.enumerate(self.direction)?;
        let port = term
            .select(&candidates)
            .cloned()
            .ok_or_else(|| Error::PortNotFound {
                direction: self.direction,
                term: term.to_string(),
            })?;

        self.binding.open(self.access.as_ref(), &port)?;
        Ok(port)
    }

    /// Returns true when leaving because of cancellation
    fn monitor(&self, port: &PortDescriptor) -> bool {
        loop {
            if self.signal.wait(self.options.poll_interval) == Wake::Cancelled {
                return true;
            }

            match self.access.enumerate(self.direction) {
                Ok(ports) if ports.iter().any(|p| p.id == port.id) => {}
                Ok(_) => {
                    debug!("{}", Error::ConnectionLost { id: port.id.clone() });
                    return false;
                }
                Err(e) => {
                    warn!("Enumeration failed while monitoring '{}': {}", port.name, e);
                    return false;
                }
            }
        }
    }

    /// Record the new state and notify on Open/Closed edges only
    fn transition(&self, to: ConnectionState) {
        let from = std::mem::replace(&mut *self.state.lock(), to);
        match (from, to) {
            (ConnectionState::Open, ConnectionState::Open) => {}
            (_, ConnectionState::Open) => {
                self.state_listeners.dispatch(&true);
            }
            (ConnectionState::Open, _) => {
                self.state_listeners.dispatch(&false);
            }
            _ => {}
        }
    }
}

/// Logical binding to one port that reconnects by itself
pub struct ConnectionSlot {
    inner: Arc<SlotInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ConnectionSlot {
    pub fn new(
        access: Arc<dyn PortAccess>,
        binding: Arc<dyn PortBinding>,
        search_term: DeviceSearchTerm,
        options: SlotOptions,
    ) -> Self {
        let direction = binding.direction();
        Self {
            inner: Arc::new(SlotInner {
                access,
                binding,
                direction,
                options,
                search_term: RwLock::new(Arc::new(search_term)),
                state: Mutex::new(ConnectionState::Closed),
                details: Mutex::new(None),
                state_listeners: EventRouter::new("connection-state"),
                signal: Signal::default(),
            }),
            thread: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Start the connection thread with the current search term.
    ///
    /// Fails if the thread is already running or the slot has been closed.
    pub fn begin_connect(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::SlotClosed);
        }

        let mut running = self.thread.lock();
        if running.is_some() {
            return Err(Error::AlreadyRunning);
        }

        let inner = self.inner.clone();
        let handle = thread::Builder::new()
            .name(format!("midi-slot-{}", self.inner.direction))
            .spawn(move || inner.run())
            .map_err(|e| Error::Backend(format!("failed to spawn connection thread: {}", e)))?;

        *running = Some(handle);
        Ok(())
    }

    /// Replace the search term, then start the connection thread
    pub fn begin_connect_with(&self, search_term: DeviceSearchTerm) -> Result<()> {
        self.change_search_term(search_term);
        self.begin_connect()
    }

    /// Replace the term used by the next connection attempt.
    ///
    /// An already open port is left alone. A slot that is still searching
    /// retries right away with the new term.
    pub fn change_search_term(&self, search_term: DeviceSearchTerm) {
        info!("{} slot search term changed to '{}'", self.inner.direction, search_term);
        *self.inner.search_term.write() = Arc::new(search_term);
        if self.state() != ConnectionState::Open {
            self.inner.signal.nudge();
        }
    }

    /// Stop the connection thread, closing any open port. Idempotent.
    ///
    /// Blocks until the thread has exited, unless called from the connection
    /// thread itself (e.g. inside a state listener).
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.inner.signal.cancel();

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                debug!("close() called on the connection thread; it will exit at its next wait");
            } else if handle.join().is_err() {
                error!("{} connection thread panicked", self.inner.direction);
            }
        }
    }

    /// Run the enumeration check now instead of at the next poll tick
    pub fn check_connection(&self) {
        self.inner.signal.nudge();
    }

    /// Handle usable by other components to request an early check
    pub fn waker(&self) -> SlotWaker {
        SlotWaker {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some()
    }

    pub fn direction(&self) -> PortDirection {
        self.inner.direction
    }

    /// Descriptor of the current or most recently opened port
    pub fn details(&self) -> Option<PortDescriptor> {
        self.inner.details.lock().clone()
    }

    pub fn search_term(&self) -> Arc<DeviceSearchTerm> {
        self.inner.term()
    }

    /// Called with `true` on every transition to Open and `false` on every
    /// transition out of it, from the connection thread
    pub fn subscribe_state<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&bool) + Send + Sync + 'static,
    {
        self.inner.state_listeners.subscribe(listener)
    }

    pub fn unsubscribe_state(&self, id: ListenerId) -> bool {
        self.inner.state_listeners.unsubscribe(id)
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.close();
    }
}

/// Weak handle that asks a slot to re-check its port
#[derive(Clone)]
pub struct SlotWaker {
    inner: Weak<SlotInner>,
}

impl SlotWaker {
    pub fn check_connection(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.signal.nudge();
        }
    }
}

fn open_failed(port: &PortDescriptor, err: Error) -> Error {
    match err {
        Error::PortOpenFailed { .. } => err,
        other => Error::PortOpenFailed {
            id: port.id.clone(),
            reason: other.to_string(),
        },
    }
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// Receives raw chunks on the backend thread, frames them and fans out
struct InputReceiver {
    framer: Mutex<MessageFramer>,
    raw: EventRouter<[u8]>,
    messages: EventRouter<[Message]>,
}

impl InputReceiver {
    fn receive(&self, bytes: &[u8]) {
        self.raw.dispatch(bytes);

        let batch = self.framer.lock().feed(bytes).to_vec();
        if !batch.is_empty() {
            self.messages.dispatch(batch.as_slice());
        }
    }
}

struct InputBinding {
    receiver: Arc<InputReceiver>,
    handle: Mutex<Option<Box<dyn InputHandle>>>,
}

impl PortBinding for InputBinding {
    fn direction(&self) -> PortDirection {
        PortDirection::Input
    }

    fn open(&self, access: &dyn PortAccess, port: &PortDescriptor) -> Result<()> {
        // Parser state belongs to one port binding
        self.receiver.framer.lock().reset();

        let receiver = self.receiver.clone();
        let handle = access
            .open_input(&port.id, Box::new(move |bytes: &[u8]| receiver.receive(bytes)))
            .map_err(|e| open_failed(port, e))?;

        *self.handle.lock() = Some(handle);
        Ok(())
    }

    fn close(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.close();
        }
    }
}

/// Input slot: parsed messages and raw chunks from whichever matching port
/// is currently connected
pub struct MidiInputSlot {
    slot: ConnectionSlot,
    receiver: Arc<InputReceiver>,
}

impl MidiInputSlot {
    pub fn new(access: Arc<dyn PortAccess>, search_term: DeviceSearchTerm, options: SlotOptions) -> Self {
        let receiver = Arc::new(InputReceiver {
            framer: Mutex::new(MessageFramer::new()),
            raw: EventRouter::new("midi-raw"),
            messages: EventRouter::new("midi-messages"),
        });
        let binding = Arc::new(InputBinding {
            receiver: receiver.clone(),
            handle: Mutex::new(None),
        });

        Self {
            slot: ConnectionSlot::new(access, binding, search_term, options),
            receiver,
        }
    }

    pub fn slot(&self) -> &ConnectionSlot {
        &self.slot
    }

    pub fn begin_connect(&self) -> Result<()> {
        self.slot.begin_connect()
    }

    pub fn change_search_term(&self, search_term: DeviceSearchTerm) {
        self.slot.change_search_term(search_term)
    }

    pub fn close(&self) {
        self.slot.close()
    }

    pub fn state(&self) -> ConnectionState {
        self.slot.state()
    }

    pub fn subscribe_state<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&bool) + Send + Sync + 'static,
    {
        self.slot.subscribe_state(listener)
    }

    /// Parsed messages, one batch per received chunk
    pub fn subscribe_messages<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&[Message]) + Send + Sync + 'static,
    {
        self.receiver.messages.subscribe(listener)
    }

    pub fn unsubscribe_messages(&self, id: ListenerId) -> bool {
        self.receiver.messages.unsubscribe(id)
    }

    /// Raw chunks exactly as delivered by the backend, before framing
    pub fn subscribe_raw<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.receiver.raw.subscribe(listener)
    }

    pub fn unsubscribe_raw(&self, id: ListenerId) -> bool {
        self.receiver.raw.unsubscribe(id)
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Open output handle, shared between the writer and direct sends
type SharedOutput = Arc<Mutex<Box<dyn OutputHandle>>>;

/// Current output handle of a slot.
///
/// The port lock only guards swapping the handle. Writes run on a cloned
/// [`SharedOutput`] after it is released; closing swaps the handle out and an
/// in-flight write finishes on the old one.
struct OutputPort {
    current: Mutex<Option<SharedOutput>>,
}

impl OutputPort {
    fn write(&self, bytes: &[u8]) -> Result<()> {
        let handle = self.current.lock().clone();
        match handle {
            Some(handle) => handle.lock().send(bytes, 0),
            None => Err(Error::NotConnected),
        }
    }
}

struct OutputBinding {
    port: Arc<OutputPort>,
}

impl PortBinding for OutputBinding {
    fn direction(&self) -> PortDirection {
        PortDirection::Output
    }

    fn open(&self, access: &dyn PortAccess, port: &PortDescriptor) -> Result<()> {
        let handle = access.open_output(&port.id).map_err(|e| open_failed(port, e))?;
        *self.port.current.lock() = Some(Arc::new(Mutex::new(handle)));
        Ok(())
    }

    fn close(&self) {
        let handle = self.port.current.lock().take();
        if let Some(handle) = handle {
            match Arc::try_unwrap(handle) {
                Ok(handle) => handle.into_inner().close(),
                // Dropped by the in-flight write once it returns
                Err(_) => debug!("Output write still in flight, deferring port close"),
            }
        }
    }
}

/// [`OutputSink`] writing through an output slot's current port
struct SlotSink {
    port: Arc<OutputPort>,
    waker: SlotWaker,
}

impl OutputSink for SlotSink {
    fn write(&self, bytes: &[u8]) -> Result<()> {
        self.port.write(bytes)
    }

    fn write_failed(&self, error: &Error) {
        if !matches!(error, Error::NotConnected) {
            self.waker.check_connection();
        }
    }
}

/// Output slot: writes go to whichever matching port is currently connected
pub struct MidiOutputSlot {
    slot: ConnectionSlot,
    port: Arc<OutputPort>,
}

impl MidiOutputSlot {
    pub fn new(access: Arc<dyn PortAccess>, search_term: DeviceSearchTerm, options: SlotOptions) -> Self {
        let port = Arc::new(OutputPort {
            current: Mutex::new(None),
        });
        let binding = Arc::new(OutputBinding { port: port.clone() });

        Self {
            slot: ConnectionSlot::new(access, binding, search_term, options),
            port,
        }
    }

    pub fn slot(&self) -> &ConnectionSlot {
        &self.slot
    }

    pub fn begin_connect(&self) -> Result<()> {
        self.slot.begin_connect()
    }

    pub fn change_search_term(&self, search_term: DeviceSearchTerm) {
        self.slot.change_search_term(search_term)
    }

    pub fn close(&self) {
        self.slot.close()
    }

    pub fn state(&self) -> ConnectionState {
        self.slot.state()
    }

    pub fn subscribe_state<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&bool) + Send + Sync + 'static,
    {
        self.slot.subscribe_state(listener)
    }

    /// Sink for a send pipeline. Failed writes trigger an early port check.
    pub fn sink(&self) -> Arc<dyn OutputSink> {
        Arc::new(SlotSink {
            port: self.port.clone(),
            waker: self.slot.waker(),
        })
    }

    /// Blocking write on the caller's thread, bypassing any pipeline
    pub fn send(&self, bytes: &[u8]) -> Result<()> {
        let result = self.port.write(bytes);
        if let Err(ref e) = result {
            if !matches!(e, Error::NotConnected) {
                warn!("MIDI send failed: {}", e);
                self.slot.check_connection();
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{PipelineOptions, SendPipeline};
    use crate::port::fake::{wait_until, FakePortAccess};

    const WAIT: Duration = Duration::from_secs(3);

    fn fast() -> SlotOptions {
        SlotOptions {
            retry_interval: Duration::from_millis(10),
            poll_interval: Duration::from_millis(10),
        }
    }

    fn record_states(slot: &ConnectionSlot) -> Arc<Mutex<Vec<bool>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        slot.subscribe_state(move |open| s.lock().push(*open));
        seen
    }

    fn linn() -> PortDescriptor {
        PortDescriptor::new("hw:2,0", "LinnStrument MIDI 1")
    }

    #[test]
    fn test_retries_until_port_appears() {
        let access = FakePortAccess::new();
        access.plug(PortDirection::Input, PortDescriptor::new("hw:1,0", "Launchpad"));

        let input = MidiInputSlot::new(Arc::new(access.clone()), DeviceSearchTerm::new("linnstrument"), fast());
        let seen = record_states(input.slot());
        input.begin_connect().unwrap();

        thread::sleep(Duration::from_millis(80));
        assert_eq!(input.state(), ConnectionState::Connecting);
        assert!(seen.lock().is_empty());
        assert!(access.enumeration_count() > 1);

        access.plug(PortDirection::Input, linn());
        assert!(wait_until(WAIT, || input.state() == ConnectionState::Open));

        // Several poll ticks later there is still exactly one notification
        thread::sleep(Duration::from_millis(80));
        assert_eq!(*seen.lock(), vec![true]);
        assert_eq!(input.slot().details(), Some(linn()));

        input.close();
        assert_eq!(input.state(), ConnectionState::Closed);
        assert_eq!(*seen.lock(), vec![true, false]);
    }

    #[test]
    fn test_reconnects_after_unplug() {
        let access = FakePortAccess::new();
        access.plug(PortDirection::Input, linn());

        let input = MidiInputSlot::new(Arc::new(access.clone()), DeviceSearchTerm::new("linn"), fast());
        let seen = record_states(input.slot());
        input.begin_connect().unwrap();
        assert!(wait_until(WAIT, || input.state() == ConnectionState::Open));

        access.unplug(PortDirection::Input, "hw:2,0");
        assert!(wait_until(WAIT, || seen.lock().len() == 2));
        assert_ne!(input.state(), ConnectionState::Open);

        access.plug(PortDirection::Input, linn());
        assert!(wait_until(WAIT, || input.state() == ConnectionState::Open));
        assert_eq!(*seen.lock(), vec![true, false, true]);
        assert_eq!(access.open_count(), 2);
    }

    #[test]
    fn test_open_failures_are_retried() {
        let access = FakePortAccess::new();
        access.plug(PortDirection::Output, linn());
        access.fail_next_opens(3);

        let output = MidiOutputSlot::new(Arc::new(access.clone()), DeviceSearchTerm::new("linn"), fast());
        output.begin_connect().unwrap();

        assert!(wait_until(WAIT, || output.state() == ConnectionState::Open));
        assert_eq!(access.open_count(), 1);
        output.close();
    }

    #[test]
    fn test_begin_connect_twice_fails() {
        let access = FakePortAccess::new();
        let input = MidiInputSlot::new(Arc::new(access), DeviceSearchTerm::any(), fast());

        input.begin_connect().unwrap();
        assert!(matches!(input.begin_connect(), Err(Error::AlreadyRunning)));
        input.close();
    }

    #[test]
    fn test_close_is_idempotent_and_terminal() {
        let access = FakePortAccess::new();
        access.plug(PortDirection::Input, linn());
        let input = MidiInputSlot::new(Arc::new(access.clone()), DeviceSearchTerm::any(), fast());

        input.begin_connect().unwrap();
        assert!(wait_until(WAIT, || input.state() == ConnectionState::Open));

        input.close();
        input.close();
        assert_eq!(input.state(), ConnectionState::Closed);
        assert!(!access.has_input_callback("hw:2,0"));
        assert!(matches!(input.begin_connect(), Err(Error::SlotClosed)));
    }

    #[test]
    fn test_close_before_begin() {
        let access = FakePortAccess::new();
        let output = MidiOutputSlot::new(Arc::new(access), DeviceSearchTerm::any(), fast());
        output.close();
        assert_eq!(output.state(), ConnectionState::Closed);
        assert!(!output.slot().is_running());
    }

    #[test]
    fn test_search_term_change_applies_to_next_attempt() {
        let access = FakePortAccess::new();
        access.plug(PortDirection::Input, linn());
        access.plug(PortDirection::Input, PortDescriptor::new("hw:3,0", "Push 2"));

        let input = MidiInputSlot::new(Arc::new(access.clone()), DeviceSearchTerm::new("linn"), fast());
        input.begin_connect().unwrap();
        assert!(wait_until(WAIT, || input.state() == ConnectionState::Open));

        input.change_search_term(DeviceSearchTerm::new("push"));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(input.slot().details().map(|d| d.id), Some("hw:2,0".to_string()));

        access.unplug(PortDirection::Input, "hw:2,0");
        assert!(wait_until(WAIT, || {
            input.slot().details().map(|d| d.id) == Some("hw:3,0".to_string())
                && input.state() == ConnectionState::Open
        }));
        input.close();
    }

    #[test]
    fn test_search_term_change_while_searching_retries_now() {
        let access = FakePortAccess::new();
        access.plug(PortDirection::Input, linn());

        let slow = SlotOptions {
            retry_interval: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
        };
        let input = MidiInputSlot::new(Arc::new(access.clone()), DeviceSearchTerm::new("push"), slow);
        input.begin_connect().unwrap();
        assert!(wait_until(WAIT, || access.enumeration_count() >= 1));

        input.change_search_term(DeviceSearchTerm::new("linn"));
        assert!(wait_until(WAIT, || input.state() == ConnectionState::Open));
        input.close();
    }

    #[test]
    fn test_panicking_state_listener_does_not_stop_slot() {
        let access = FakePortAccess::new();
        access.plug(PortDirection::Input, linn());
        let input = MidiInputSlot::new(Arc::new(access.clone()), DeviceSearchTerm::any(), fast());
        input.subscribe_state(|_| panic!("bad listener"));
        let seen = record_states(input.slot());

        input.begin_connect().unwrap();
        assert!(wait_until(WAIT, || input.state() == ConnectionState::Open));

        access.unplug(PortDirection::Input, "hw:2,0");
        assert!(wait_until(WAIT, || input.state() != ConnectionState::Open));
        access.plug(PortDirection::Input, linn());
        assert!(wait_until(WAIT, || seen.lock().len() >= 3));
        input.close();
    }

    #[test]
    fn test_input_frames_and_dispatches() {
        let access = FakePortAccess::new();
        access.plug(PortDirection::Input, linn());
        let input = MidiInputSlot::new(Arc::new(access.clone()), DeviceSearchTerm::any(), fast());

        let messages = Arc::new(Mutex::new(Vec::new()));
        let m = messages.clone();
        input.subscribe_messages(move |batch: &[Message]| m.lock().extend_from_slice(batch));

        let raw = Arc::new(Mutex::new(Vec::new()));
        let r = raw.clone();
        input.subscribe_raw(move |bytes: &[u8]| r.lock().push(bytes.to_vec()));

        input.begin_connect().unwrap();
        assert!(wait_until(WAIT, || access.has_input_callback("hw:2,0")));

        assert!(access.inject("hw:2,0", &[0x90, 0x3C]));
        assert!(access.inject("hw:2,0", &[0x64, 0x3D, 0x64, 0xF8]));

        assert_eq!(
            *messages.lock(),
            vec![Message::note_on(0, 0x3C, 0x64), Message::note_on(0, 0x3D, 0x64)]
        );
        assert_eq!(*raw.lock(), vec![vec![0x90, 0x3C], vec![0x64, 0x3D, 0x64, 0xF8]]);
        input.close();
    }

    #[test]
    fn test_running_status_reset_on_reconnect() {
        let access = FakePortAccess::new();
        access.plug(PortDirection::Input, linn());
        let input = MidiInputSlot::new(Arc::new(access.clone()), DeviceSearchTerm::any(), fast());

        let messages = Arc::new(Mutex::new(Vec::new()));
        let m = messages.clone();
        input.subscribe_messages(move |batch: &[Message]| m.lock().extend_from_slice(batch));

        input.begin_connect().unwrap();
        assert!(wait_until(WAIT, || access.has_input_callback("hw:2,0")));
        access.inject("hw:2,0", &[0x90, 0x3C, 0x64]);

        access.unplug(PortDirection::Input, "hw:2,0");
        assert!(wait_until(WAIT, || input.state() != ConnectionState::Open));
        access.plug(PortDirection::Input, linn());
        assert!(wait_until(WAIT, || access.has_input_callback("hw:2,0")));

        // Data with no status on the new binding is discarded
        access.inject("hw:2,0", &[0x3D, 0x64]);
        assert_eq!(messages.lock().len(), 1);
        input.close();
    }

    #[test]
    fn test_output_send_and_not_connected() {
        let access = FakePortAccess::new();
        let output = MidiOutputSlot::new(Arc::new(access.clone()), DeviceSearchTerm::new("linn"), fast());
        assert!(matches!(output.send(&[0x90, 0x3C, 0x64]), Err(Error::NotConnected)));

        access.plug(PortDirection::Output, linn());
        output.begin_connect().unwrap();
        assert!(wait_until(WAIT, || output.state() == ConnectionState::Open));

        output.send(&[0x90, 0x3C, 0x64]).unwrap();
        assert_eq!(access.written(), vec![vec![0x90, 0x3C, 0x64]]);
        output.close();
    }

    #[test]
    fn test_write_failure_triggers_early_check() {
        let access = FakePortAccess::new();
        access.plug(PortDirection::Output, linn());
        let slow_poll = SlotOptions {
            retry_interval: Duration::from_millis(10),
            poll_interval: Duration::from_secs(30),
        };
        let output = MidiOutputSlot::new(Arc::new(access.clone()), DeviceSearchTerm::any(), slow_poll);
        let sink = output.sink();

        output.begin_connect().unwrap();
        assert!(wait_until(WAIT, || output.state() == ConnectionState::Open));

        access.unplug(PortDirection::Output, "hw:2,0");
        let err = sink.write(&[0xB0, 0x07, 0x64]).unwrap_err();
        sink.write_failed(&err);

        assert!(wait_until(Duration::from_secs(1), || output.state() != ConnectionState::Open));
        output.close();
    }

    #[test]
    fn test_message_listeners_run_without_framer_lock() {
        let access = FakePortAccess::new();
        access.plug(PortDirection::Input, linn());
        let input = MidiInputSlot::new(Arc::new(access.clone()), DeviceSearchTerm::any(), fast());

        let receiver = Arc::downgrade(&input.receiver);
        let framer_free = Arc::new(Mutex::new(Vec::new()));
        let f = framer_free.clone();
        input.subscribe_messages(move |_batch: &[Message]| {
            if let Some(receiver) = receiver.upgrade() {
                f.lock().push(receiver.framer.try_lock().is_some());
            }
        });

        input.begin_connect().unwrap();
        assert!(wait_until(WAIT, || access.has_input_callback("hw:2,0")));
        access.inject("hw:2,0", &[0x90, 0x3C, 0x64]);

        assert_eq!(*framer_free.lock(), vec![true]);
        input.close();
    }

    #[test]
    fn test_reopen_while_write_in_flight() {
        let access = FakePortAccess::new();
        access.plug(PortDirection::Output, linn());
        let output = MidiOutputSlot::new(Arc::new(access.clone()), DeviceSearchTerm::any(), fast());
        let sink = output.sink();
        output.begin_connect().unwrap();
        assert!(wait_until(WAIT, || output.state() == ConnectionState::Open));

        access.set_write_delay(Duration::from_millis(800));
        let slow_write = thread::spawn(move || sink.write(&[0x90, 0x3C, 0x64]));
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        access.unplug(PortDirection::Output, "hw:2,0");
        assert!(wait_until(WAIT, || output.state() != ConnectionState::Open));
        access.set_write_delay(Duration::ZERO);
        access.plug(PortDirection::Output, linn());

        // Reopened and writable while the old handle is still busy
        assert!(wait_until(WAIT, || output.state() == ConnectionState::Open));
        output.send(&[0xB0, 0x07, 0x64]).unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(access.open_count(), 2);
        assert!(access.written().contains(&vec![0xB0, 0x07, 0x64]));

        let _ = slow_write.join().unwrap();
        output.close();
    }

    #[test]
    fn test_pipeline_write_failure_checks_port() {
        let access = FakePortAccess::new();
        access.plug(PortDirection::Output, linn());
        let slow_poll = SlotOptions {
            retry_interval: Duration::from_millis(10),
            poll_interval: Duration::from_secs(30),
        };
        let output = MidiOutputSlot::new(Arc::new(access.clone()), DeviceSearchTerm::any(), slow_poll);
        let pipeline = SendPipeline::new("linn", output.sink(), PipelineOptions::default()).unwrap();

        output.begin_connect().unwrap();
        assert!(wait_until(WAIT, || output.state() == ConnectionState::Open));
        let checks = access.enumeration_count();

        access.set_fail_writes(true);
        pipeline.commit(Message::note_on(0, 60, 100)).unwrap();
        pipeline.push().unwrap();
        assert!(wait_until(WAIT, || pipeline.write_failures() == 1));

        // Port is still listed, so the early check keeps it open
        assert!(wait_until(WAIT, || access.enumeration_count() > checks));
        assert_eq!(output.state(), ConnectionState::Open);

        access.set_fail_writes(false);
        pipeline.commit(Message::note_off(0, 60, 0)).unwrap();
        pipeline.push().unwrap();
        assert!(wait_until(WAIT, || access.written() == vec![vec![0x80, 60, 0]]));

        pipeline.shutdown();
        output.close();
    }
}
