//! The dispatcher: a set of open ports served by one background poll loop.
//!
//! Ports are registered under their interface name. A single thread polls the
//! waker together with every port descriptor and hands readable ports their
//! next frame; any thread may open, close, or send at the same time. Changes to
//! the port set are signalled through the waker, which makes the loop rebuild
//! its poll set before waiting again.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use macaddr::MacAddr6;
use tracing::{debug, error, info, warn};

use crate::capture::{CaptureConfig, CaptureFactory, SystemCaptureFactory};
use crate::config::Config;
use crate::error::DispatchError;
use crate::filter::FrameFilter;
use crate::port::{FrameCallback, Port, Stats};
use crate::waker::Waker;

/// State shared with the loop thread.
struct Shared {
    ports: Mutex<HashMap<String, Arc<Port>>>,
    modified: AtomicBool,
    waker: Waker,
    poll_interval: Duration,
}

impl Shared {
    fn ports(&self) -> MutexGuard<'_, HashMap<String, Arc<Port>>> {
        self.ports.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn port(&self, name: &str) -> Option<Arc<Port>> {
        self.ports().get(name).cloned()
    }

    /// Flag the port set as changed and wake the loop.
    fn touch(&self) {
        self.modified.store(true, Ordering::SeqCst);
        self.wake();
    }

    fn wake(&self) {
        if let Err(e) = self.waker.notify() {
            warn!("Failed to wake dispatcher loop: {}", e);
        }
    }

    fn snapshot(&self) -> Vec<Arc<Port>> {
        // Clear first so a change made while copying is picked up next round
        self.modified.store(false, Ordering::SeqCst);
        self.ports().values().cloned().collect()
    }
}

struct Worker {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
    /// Disconnects when the loop thread exits.
    done: mpsc::Receiver<()>,
}

impl Worker {
    fn is_current_thread(&self) -> bool {
        self.handle.thread().id() == thread::current().id()
    }

    fn is_running(&self) -> bool {
        !self.stop.load(Ordering::SeqCst) && !self.handle.is_finished()
    }
}

/// Multiplexes raw frame I/O on any number of interfaces.
///
/// Dropping the dispatcher stops its loop without waiting for it.
pub struct Dispatcher {
    shared: Arc<Shared>,
    factory: Arc<dyn CaptureFactory>,
    config: Config,
    worker: Mutex<Option<Worker>>,
}

impl Dispatcher {
    /// Create a dispatcher over the platform's native capture backend.
    pub fn new(verbose: bool) -> Result<Self, DispatchError> {
        let config = Config {
            verbose,
            ..Config::default()
        };
        Self::with_factory(Arc::new(SystemCaptureFactory), config)
    }

    pub fn with_factory(
        factory: Arc<dyn CaptureFactory>,
        config: Config,
    ) -> Result<Self, DispatchError> {
        let waker = Waker::new().map_err(DispatchError::Waker)?;
        Ok(Self {
            shared: Arc::new(Shared {
                ports: Mutex::new(HashMap::new()),
                modified: AtomicBool::new(false),
                waker,
                poll_interval: config.poll_interval,
            }),
            factory,
            config,
            worker: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Open `name` and start delivering its frames to `on_frame`.
    ///
    /// Frames rejected by `filter` are counted as discards. The loop is
    /// started unless `keep_closed` is set; see [`start`](Self::start).
    pub fn open(
        &self,
        name: &str,
        on_frame: FrameCallback,
        filter: Option<FrameFilter>,
        verbose: bool,
        keep_closed: bool,
    ) -> Result<(), DispatchError> {
        if self.shared.ports().contains_key(name) {
            return Err(DispatchError::AlreadyOpen(name.to_string()));
        }

        let port = Port::open_with_config(
            self.factory.as_ref(),
            name,
            on_frame,
            filter,
            verbose || self.config.verbose,
            &CaptureConfig::from(&self.config),
        )?;

        {
            let mut ports = self.shared.ports();
            if ports.contains_key(name) {
                drop(ports);
                port.close();
                return Err(DispatchError::AlreadyOpen(name.to_string()));
            }
            ports.insert(name.to_string(), Arc::new(port));
        }
        self.shared.touch();

        if !keep_closed {
            self.start()?;
        }
        Ok(())
    }

    /// Close `name`. Returns false if it was not open.
    pub fn close(&self, name: &str) -> bool {
        let Some(port) = self.shared.ports().remove(name) else {
            return false;
        };
        port.close();
        self.shared.touch();
        true
    }

    /// Transmit a frame on an open interface.
    pub fn send(&self, name: &str, frame: &[u8]) -> Result<usize, DispatchError> {
        let port = self
            .shared
            .port(name)
            .ok_or_else(|| DispatchError::NotOpen(name.to_string()))?;
        Ok(port.send(frame)?)
    }

    /// Counters of an open interface.
    pub fn statistics(&self, name: &str) -> Option<Stats> {
        self.shared.port(name).map(|port| port.statistics())
    }

    /// Names of all open interfaces, sorted.
    pub fn interfaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.ports().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn mac_address(&self, name: &str) -> Result<MacAddr6, DispatchError> {
        let port = self
            .shared
            .port(name)
            .ok_or_else(|| DispatchError::NotOpen(name.to_string()))?;
        Ok(port.mac_address()?)
    }

    /// Bring an open interface up or down. `Ok(false)` if the OS refused.
    pub fn set_link_up(&self, name: &str, up: bool) -> Result<bool, DispatchError> {
        let port = self
            .shared
            .port(name)
            .ok_or_else(|| DispatchError::NotOpen(name.to_string()))?;
        Ok(if up { port.up() } else { port.down() })
    }

    pub fn is_running(&self) -> bool {
        self.lock_worker().as_ref().is_some_and(Worker::is_running)
    }

    /// Start the loop if it is not already running. A previous loop that is
    /// still shutting down is joined first.
    pub fn start(&self) -> Result<(), DispatchError> {
        let previous = {
            let mut slot = self.lock_worker();
            match slot.take() {
                Some(running) if running.is_running() => {
                    *slot = Some(running);
                    return Ok(());
                }
                previous => previous,
            }
        };
        // The old loop may be inside a callback that calls back into us
        if let Some(previous) = previous {
            self.retire(previous);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let shared = Arc::clone(&self.shared);
        let flag = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("rawlink-dispatch".to_string())
            .spawn(move || {
                let _done = done_tx;
                run_loop(&shared, &flag);
            })
            .map_err(DispatchError::Spawn)?;
        let started = Worker {
            handle,
            stop,
            done: done_rx,
        };

        let mut slot = self.lock_worker();
        if slot.as_ref().is_some_and(Worker::is_running) {
            // Lost a race with a concurrent start
            drop(slot);
            self.retire(started);
            return Ok(());
        }
        let stale = slot.replace(started);
        drop(slot);
        if let Some(stale) = stale {
            self.retire(stale);
        }
        info!("Dispatcher loop started");
        Ok(())
    }

    /// Signal a loop to exit and join it. Must not be called with the worker
    /// slot locked.
    fn retire(&self, worker: Worker) {
        worker.stop.store(true, Ordering::SeqCst);
        self.shared.wake();
        if !worker.is_current_thread() && worker.handle.join().is_err() {
            error!("Dispatcher loop panicked");
        }
    }

    /// Stop the loop and close every open interface.
    ///
    /// `Some(Duration::ZERO)` returns without waiting, `Some(d)` waits at most
    /// `d` for the loop to exit, and `None` waits until it has. Returns true
    /// if the loop is known to have exited.
    pub fn stop(&self, timeout: Option<Duration>) -> bool {
        let worker = self.lock_worker().take();
        if let Some(worker) = &worker {
            worker.stop.store(true, Ordering::SeqCst);
        }

        let ports: Vec<Arc<Port>> = self.shared.ports().drain().map(|(_, p)| p).collect();
        for port in &ports {
            port.close();
        }
        self.shared.touch();

        let Some(worker) = worker else {
            return true;
        };
        info!("Stopping dispatcher loop ({} ports closed)", ports.len());

        // Called from a frame callback: the loop exits once the callback returns
        if worker.is_current_thread() {
            self.park(worker);
            return false;
        }

        let exited = match timeout {
            Some(wait) if wait.is_zero() => worker.handle.is_finished(),
            Some(wait) => !matches!(
                worker.done.recv_timeout(wait),
                Err(mpsc::RecvTimeoutError::Timeout)
            ),
            None => true,
        };

        if exited {
            if worker.handle.join().is_err() {
                error!("Dispatcher loop panicked");
            }
            info!("Dispatcher loop stopped");
        } else {
            debug!("Dispatcher loop still shutting down");
            self.park(worker);
        }
        exited
    }

    /// Keep a stopping loop's handle so the next `start` can join it.
    fn park(&self, worker: Worker) {
        let mut slot = self.lock_worker();
        if slot.is_none() {
            *slot = Some(worker);
        }
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop(Some(Duration::ZERO));
    }
}

fn run_loop(shared: &Shared, stop: &AtomicBool) {
    let timeout_ms = libc::c_int::try_from(shared.poll_interval.as_millis())
        .unwrap_or(libc::c_int::MAX)
        .max(1);
    let mut ports: Vec<Arc<Port>> = Vec::new();
    let mut fds: Vec<libc::pollfd> = Vec::new();
    let mut rebuild = true;

    while !stop.load(Ordering::SeqCst) {
        if rebuild || shared.modified.load(Ordering::SeqCst) {
            rebuild = false;
            (ports, fds) = poll_set(shared);
            debug!("Polling {} ports", ports.len());
        }

        for pfd in fds.iter_mut() {
            pfd.revents = 0;
        }
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                error!("poll failed: {}", err);
                thread::sleep(shared.poll_interval);
                rebuild = true;
            }
            continue;
        }
        if ready == 0 || stop.load(Ordering::SeqCst) {
            continue;
        }

        if fds[0].revents != 0 {
            if let Err(e) = shared.waker.drain() {
                warn!("Failed to drain waker: {}", e);
            }
            rebuild = true;
            continue;
        }

        for (pfd, port) in fds[1..].iter_mut().zip(&ports) {
            if pfd.revents == 0 {
                continue;
            }
            if pfd.revents & libc::POLLNVAL != 0 {
                if !port.is_closed() {
                    warn!("Descriptor of {} is no longer valid", port.name());
                }
                // Ignored by poll until the next rebuild
                pfd.fd = -1;
                continue;
            }
            if port.is_closed() {
                continue;
            }
            port.dispatch();
        }
    }

    debug!("Dispatcher loop exiting");
}

/// Waker first, then every open port that still has a descriptor.
fn poll_set(shared: &Shared) -> (Vec<Arc<Port>>, Vec<libc::pollfd>) {
    let mut ports = Vec::new();
    let mut fds = vec![libc::pollfd {
        fd: shared.waker.raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    }];
    for port in shared.snapshot() {
        if let Some(fd) = port.raw_fd() {
            fds.push(libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            });
            ports.push(port);
        }
    }
    (ports, fds)
}
