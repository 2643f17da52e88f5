//! The transport-agnostic bus engine
//!
//! A [`Bus`] owns a transport driver and, in asynchronous mode, three worker
//! threads: a receive thread looping on the driver's blocking read, a
//! transmit thread draining the outgoing queue, and an optional sanity thread
//! ticking device health checks on a drift-free absolute deadline. In
//! synchronous mode no threads are spawned and the application drives I/O
//! through [`Bus::read_message`] and [`Bus::write_message`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{info, warn};
use multican_common::messages::BusMessage;
use multican_common::traits::{BusDriver, RxEvent};
use snafu::{ResultExt, Snafu};

use crate::options::BusOptions;

/// Receives frames and bus-level events from the engine.
///
/// `handle_frame` runs on the receive thread, which is the sole dispatcher of
/// a bus: implementations need no internal locking for state only they
/// mutate.
pub trait FrameHandler<M>: Send + Sync {
    /// Called for every good frame.
    fn handle_frame(&self, msg: &M);

    /// Called when the driver reports an error frame. The engine has already
    /// raised the bus error flag.
    fn handle_bus_error(&self, msg: &M);

    /// Called once per sanity tick; returns true when every device passed
    /// its sanity check.
    fn check_devices(&self) -> bool;
}

/// Error returned by [`Bus::init`]
#[derive(Debug, Snafu)]
pub enum InitError {
    /// The transport failed to open; no threads were spawned
    #[snafu(display("failed to initialize bus {bus}"))]
    Driver {
        /// Name of the bus
        bus: String,
        /// The driver failure
        source: multican_common::traits::DriverError,
    },
    /// A worker thread could not be spawned
    #[snafu(display("failed to spawn {label} thread for bus {bus}"))]
    SpawnThread {
        /// Name of the bus
        bus: String,
        /// Which worker failed to spawn
        label: &'static str,
        /// The spawn failure
        source: std::io::Error,
    },
}

/// Error returned by [`Bus::write_message`] when the driver rejects a frame.
/// The frame remains at the head of the queue.
#[derive(Debug, Snafu)]
#[snafu(display("failed to write message on bus {bus}"))]
pub struct WriteError {
    bus: String,
    source: multican_common::traits::DriverError,
}

/// Emits at most one warning per period, so a wedged transport cannot flood
/// the log from a tight loop.
#[derive(Debug)]
struct Throttle {
    last: Mutex<Option<Instant>>,
    period: Duration,
}

impl Throttle {
    fn new(period: Duration) -> Self {
        Self {
            last: Mutex::new(None),
            period,
        }
    }

    fn ready(&self) -> bool {
        let mut last = self.last.lock().unwrap();
        let now = Instant::now();
        match *last {
            Some(t) if now.duration_since(t) < self.period => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// The outgoing queue and the state shared between the bus, its worker
/// threads and every [`BusHandle`].
#[derive(Debug)]
struct OutgoingQueue<M> {
    bus_name: String,
    msgs: Mutex<VecDeque<M>>,
    /// Wakes the transmit thread after a push
    transmit_wake: Condvar,
    /// Wakes waiters on an empty queue (required for global sync)
    queue_empty: Condvar,
    running: AtomicBool,
    /// While passive, frames are popped as if written and dropped silently
    passive: AtomicBool,
    max_queue_size: usize,
    overflow_warning: Throttle,
}

impl<M> OutgoingQueue<M> {
    fn wait_for_empty(&self) -> MutexGuard<'_, VecDeque<M>> {
        let guard = self.msgs.lock().unwrap();
        self.queue_empty
            .wait_while(guard, |q| {
                !q.is_empty() && self.running.load(Ordering::Relaxed)
            })
            .unwrap()
    }
}

/// A cheap, cloneable sending handle onto a bus's outgoing queue.
///
/// Devices keep one as their backreference to the bus they are attached to;
/// the queue stays alive for as long as any handle does.
#[derive(Debug, Clone)]
pub struct BusHandle<M> {
    queue: Arc<OutgoingQueue<M>>,
}

impl<M: BusMessage> BusHandle<M> {
    /// Copy a message to the outgoing queue and wake the transmit thread.
    pub fn send(&self, msg: M) {
        let mut queue = self.queue.msgs.lock().unwrap();
        self.send_locked(&mut queue, msg);
    }

    /// Push a message while the caller already holds the queue lock, e.g.
    /// one obtained from [`wait_for_empty_queue`](Self::wait_for_empty_queue).
    pub fn send_locked(&self, queue: &mut VecDeque<M>, msg: M) {
        if queue.len() >= self.queue.max_queue_size && self.queue.overflow_warning.ready() {
            warn!(
                "Exceeding max queue size ({}) on bus {}",
                self.queue.max_queue_size, self.queue.bus_name
            );
        }
        queue.push_back(msg);
        self.queue.transmit_wake.notify_all();
    }

    /// Block until the outgoing queue is empty (or the bus is stopped) and
    /// return the held lock, so the caller can inspect or push atomically.
    pub fn wait_for_empty_queue(&self) -> MutexGuard<'_, VecDeque<M>> {
        self.queue.wait_for_empty()
    }

    /// Current length of the outgoing queue.
    pub fn queue_len(&self) -> usize {
        self.queue.msgs.lock().unwrap().len()
    }

    /// Name of the bus this handle belongs to.
    pub fn bus_name(&self) -> &str {
        &self.queue.bus_name
    }
}

/// Bus health flags, aggregated by the sanity check.
#[derive(Debug, Default)]
struct BusFlags {
    /// Set by error frames, cleared by the next good receive
    bus_error: AtomicBool,
    missing_device_or_has_error: AtomicBool,
    all_devices_active: AtomicBool,
}

/// Everything the worker threads need; assembled by [`Bus::init`].
struct BusCore<M> {
    name: String,
    activate_bus_on_reception: bool,
    queue: Arc<OutgoingQueue<M>>,
    flags: Arc<BusFlags>,
    driver: Arc<dyn BusDriver<M>>,
    handler: Arc<dyn FrameHandler<M>>,
    read_warning: Throttle,
    write_warning: Throttle,
}

impl<M: BusMessage> BusCore<M> {
    fn running(&self) -> bool {
        self.queue.running.load(Ordering::Relaxed)
    }

    /// Read and dispatch one message. Returns true if a frame was delivered.
    fn read_message(&self) -> bool {
        match self.driver.receive() {
            Ok(RxEvent::Frame(msg)) => {
                if self.queue.passive.load(Ordering::Relaxed) && self.activate_bus_on_reception {
                    self.queue.passive.store(false, Ordering::Relaxed);
                    warn!("Auto-activated bus {}", self.name);
                }
                // Any good frame proves the bus is functional
                self.flags.bus_error.store(false, Ordering::Relaxed);
                self.handler.handle_frame(&msg);
                true
            }
            Ok(RxEvent::BusError(msg)) => {
                self.flags.bus_error.store(true, Ordering::Relaxed);
                self.handler.handle_bus_error(&msg);
                false
            }
            Ok(RxEvent::Idle) => false,
            Err(e) => {
                if self.read_warning.ready() {
                    warn!("Read error on bus {}: {e}", self.name);
                }
                false
            }
        }
    }

    /// Write the frame at the head of the queue. Helper for the synchronous
    /// manager path; the queue mutex must not be held by the caller.
    fn write_message(&self) -> Result<bool, WriteError> {
        let msg = {
            let mut queue = self.queue.msgs.lock().unwrap();
            if self.queue.passive.load(Ordering::Relaxed) {
                return Ok(queue.pop_front().is_some());
            }
            match queue.front() {
                Some(msg) => msg.clone(),
                None => return Ok(false),
            }
        };
        self.driver.transmit(&msg).context(WriteSnafu {
            bus: self.name.clone(),
        })?;
        self.queue.msgs.lock().unwrap().pop_front();
        Ok(true)
    }

    /// One lap of the transmit thread: wait for a frame, write it, and pop
    /// it only if the write succeeded so a failed frame stays at the head.
    fn process_output_queue(&self) -> bool {
        let mut queue = self.queue.msgs.lock().unwrap();
        while queue.is_empty() && self.running() {
            self.queue.queue_empty.notify_all();
            queue = self.queue.transmit_wake.wait(queue).unwrap();
        }
        if !self.running() {
            return true;
        }
        let Some(msg) = queue.front().cloned() else {
            return true;
        };
        drop(queue);

        let write_success = if self.queue.passive.load(Ordering::Relaxed) {
            true
        } else {
            match self.driver.transmit(&msg) {
                Ok(()) => true,
                Err(e) => {
                    if self.write_warning.ready() {
                        warn!("Write error on bus {}: {e}", self.name);
                    }
                    false
                }
            }
        };

        if write_success {
            self.queue.msgs.lock().unwrap().pop_front();
        }
        write_success
    }

    fn sanity_check(&self) {
        let all_ok = self.handler.check_devices();
        self.flags.missing_device_or_has_error.store(
            !all_ok || self.flags.bus_error.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
        self.flags
            .all_devices_active
            .store(all_ok, Ordering::Relaxed);
    }

    fn receive_worker(&self) {
        while self.running() {
            self.read_message();
        }
        info!("receive thread for bus {} terminated", self.name);
    }

    fn transmit_worker(&self) {
        while self.running() {
            self.process_output_queue();
        }
        info!("transmit thread for bus {} terminated", self.name);
    }

    fn sanity_worker(&self, interval: Duration) {
        let mut next_loop = Instant::now();
        while self.running() {
            next_loop += interval;
            if let Some(remaining) = next_loop.checked_duration_since(Instant::now()) {
                thread::sleep(remaining);
            }
            if !self.running() {
                break;
            }
            self.sanity_check();
        }
        info!("sanity check thread for bus {} terminated", self.name);
    }
}

/// A bus engine carrying messages of type `M` over a boxed transport driver.
///
/// Dropping the bus stops and joins its worker threads.
pub struct Bus<M: BusMessage> {
    options: BusOptions,
    queue: Arc<OutgoingQueue<M>>,
    flags: Arc<BusFlags>,
    driver: Arc<dyn BusDriver<M>>,
    core: Option<Arc<BusCore<M>>>,
    receive_thread: Option<JoinHandle<()>>,
    transmit_thread: Option<JoinHandle<()>>,
    sanity_thread: Option<JoinHandle<()>>,
}

impl<M: BusMessage> Bus<M> {
    /// Create a bus from options and a transport driver. The bus does
    /// nothing until [`init`](Self::init) is called.
    pub fn new(options: BusOptions, driver: Box<dyn BusDriver<M>>) -> Self {
        let queue = Arc::new(OutgoingQueue {
            bus_name: options.name.clone(),
            msgs: Mutex::new(VecDeque::new()),
            transmit_wake: Condvar::new(),
            queue_empty: Condvar::new(),
            running: AtomicBool::new(false),
            passive: AtomicBool::new(options.start_passive),
            max_queue_size: options.max_queue_size,
            overflow_warning: Throttle::new(Duration::from_secs(1)),
        });
        Self {
            options,
            queue,
            flags: Arc::new(BusFlags::default()),
            driver: Arc::from(driver),
            core: None,
            receive_thread: None,
            transmit_thread: None,
            sanity_thread: None,
        }
    }

    /// Open the transport and, on an asynchronous bus, spawn the worker
    /// threads. Registrations must be complete before this is called.
    pub fn init(&mut self, handler: Arc<dyn FrameHandler<M>>) -> Result<(), InitError> {
        self.driver.initialize().context(DriverSnafu {
            bus: self.options.name.clone(),
        })?;

        self.queue.running.store(true, Ordering::Relaxed);
        let core = Arc::new(BusCore {
            name: self.options.name.clone(),
            activate_bus_on_reception: self.options.activate_bus_on_reception,
            queue: self.queue.clone(),
            flags: self.flags.clone(),
            driver: self.driver.clone(),
            handler,
            read_warning: Throttle::new(Duration::from_secs(1)),
            write_warning: Throttle::new(Duration::from_secs(1)),
        });
        self.core = Some(core.clone());

        if self.options.asynchronous {
            let bus_name = self.options.name.clone();
            let spawn = move |label: &'static str, f: Box<dyn FnOnce() + Send>| {
                thread::Builder::new()
                    .name(format!("{bus_name}-{label}"))
                    .spawn(f)
                    .context(SpawnThreadSnafu {
                        bus: bus_name.clone(),
                        label,
                    })
            };

            let c = core.clone();
            let receive = spawn("receive", Box::new(move || c.receive_worker()))?;
            apply_fifo_priority(
                &receive,
                self.options.priority_receive_thread,
                "receive",
                &self.options.name,
            );
            self.receive_thread = Some(receive);

            let c = core.clone();
            let transmit = spawn("transmit", Box::new(move || c.transmit_worker()))?;
            apply_fifo_priority(
                &transmit,
                self.options.priority_transmit_thread,
                "transmit",
                &self.options.name,
            );
            self.transmit_thread = Some(transmit);

            if let Some(interval) = self.options.sanity_check_interval() {
                let c = core.clone();
                let sanity = spawn("sanity", Box::new(move || c.sanity_worker(interval)))?;
                apply_fifo_priority(
                    &sanity,
                    self.options.priority_sanity_thread,
                    "sanity",
                    &self.options.name,
                );
                self.sanity_thread = Some(sanity);
            }
        }

        Ok(())
    }

    /// Name of the bus.
    pub fn name(&self) -> &str {
        &self.options.name
    }

    /// The options the bus was created with.
    pub fn options(&self) -> &BusOptions {
        &self.options
    }

    /// Get a cloneable sending handle onto this bus.
    pub fn handle(&self) -> BusHandle<M> {
        BusHandle {
            queue: self.queue.clone(),
        }
    }

    /// Copy a message to the outgoing queue.
    pub fn send(&self, msg: M) {
        self.handle().send(msg);
    }

    /// Push a message while holding the queue lock.
    pub fn send_locked(&self, queue: &mut VecDeque<M>, msg: M) {
        self.handle().send_locked(queue, msg);
    }

    /// Block until the outgoing queue is empty and return the held lock.
    pub fn wait_for_empty_queue(&self) -> MutexGuard<'_, VecDeque<M>> {
        self.queue.wait_for_empty()
    }

    /// Activate the bus: outgoing frames are written to the transport again.
    pub fn activate(&self) {
        self.queue.passive.store(false, Ordering::Relaxed);
    }

    /// Passivate the bus: outgoing frames are consumed without being written.
    pub fn passivate(&self) {
        self.queue.passive.store(true, Ordering::Relaxed);
    }

    /// True if the bus is in passive state.
    pub fn is_passive(&self) -> bool {
        self.queue.passive.load(Ordering::Relaxed)
    }

    /// True if a device timed out or the transport reported an error.
    pub fn is_missing_device_or_has_error(&self) -> bool {
        self.flags
            .missing_device_or_has_error
            .load(Ordering::Relaxed)
    }

    /// True if every device passed its last sanity check.
    pub fn all_devices_active(&self) -> bool {
        self.flags.all_devices_active.load(Ordering::Relaxed)
    }

    /// True if the bus runs its own worker threads.
    pub fn is_asynchronous(&self) -> bool {
        self.options.asynchronous
    }

    /// The transport's pollable file descriptor, if it has one.
    pub fn pollable_fd(&self) -> Option<std::os::fd::RawFd> {
        self.driver.pollable_fd()
    }

    /// Read and dispatch one message (synchronous mode).
    pub fn read_message(&self) -> bool {
        match &self.core {
            Some(core) => core.read_message(),
            None => false,
        }
    }

    /// Write the frame at the head of the queue (synchronous mode).
    ///
    /// Returns `Ok(true)` if a frame was consumed, `Ok(false)` on an empty
    /// queue, and `Err` when the driver rejected the frame, which then stays
    /// at the head for the next attempt.
    pub fn write_message(&self) -> Result<bool, WriteError> {
        match &self.core {
            Some(core) => core.write_message(),
            None => Ok(false),
        }
    }

    /// Run one sanity pass over all devices, updating the bus health flags.
    /// Called periodically by the sanity thread on asynchronous buses.
    pub fn sanity_check(&self) {
        if let Some(core) = &self.core {
            core.sanity_check();
        }
    }

    /// Stop the worker threads, optionally waiting for them to terminate.
    pub fn stop_threads(&mut self, wait: bool) {
        {
            // Taking the queue lock orders the store against a transmit
            // thread that is about to wait, so the notify cannot be lost
            let _guard = self.queue.msgs.lock().unwrap();
            self.queue.running.store(false, Ordering::Relaxed);
        }
        self.queue.transmit_wake.notify_all();
        self.queue.queue_empty.notify_all();

        if wait {
            for handle in [
                self.receive_thread.take(),
                self.transmit_thread.take(),
                self.sanity_thread.take(),
            ]
            .into_iter()
            .flatten()
            {
                handle.join().ok();
            }
        }
    }
}

impl<M: BusMessage> Drop for Bus<M> {
    fn drop(&mut self) {
        self.stop_threads(true);
    }
}

#[cfg(unix)]
fn apply_fifo_priority(handle: &JoinHandle<()>, priority: i32, label: &str, bus: &str) {
    use std::os::unix::thread::JoinHandleExt;

    if priority <= 0 {
        return;
    }
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: the pthread handle is valid for the lifetime of the JoinHandle
    let rc = unsafe { libc::pthread_setschedparam(handle.as_pthread_t(), libc::SCHED_FIFO, &param) };
    if rc != 0 {
        warn!(
            "Failed to set {label} thread priority for bus {bus}: {}",
            std::io::Error::from_raw_os_error(rc)
        );
    }
}

#[cfg(not(unix))]
fn apply_fifo_priority(_handle: &JoinHandle<()>, _priority: i32, _label: &str, _bus: &str) {}
