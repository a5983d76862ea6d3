//! In-process capture backend.
//!
//! Each open creates a `UnixDatagram` pair: the port reads from one end, and
//! the [`LoopbackHandle`] writes frames into the other, so the dispatcher
//! polls a real descriptor. Transmitted frames are recorded on the interface,
//! and receive errors can be queued to exercise the error paths.
//!
//! ```no_run
//! use std::sync::Arc;
//! use macaddr::MacAddr6;
//! use rawlink::capture::LoopbackFactory;
//! use rawlink::{Config, Dispatcher};
//!
//! let factory = Arc::new(LoopbackFactory::new().with_interface("veth0", MacAddr6::nil()));
//! let handle = factory.handle("veth0").unwrap();
//! let dispatcher = Dispatcher::with_factory(factory, Config::default()).unwrap();
//! dispatcher
//!     .open("veth0", Arc::new(|frame: &[u8]| println!("{} bytes", frame.len())), None, false, false)
//!     .unwrap();
//! handle.inject(&[0xaa; 60]).unwrap();
//! ```

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use macaddr::MacAddr6;

use super::{check_interface_name, CaptureConfig, CaptureFactory, PacketCapture};
use crate::error::CaptureError;
use crate::port::MIN_FRAME_LEN;

const INJECT_TIMEOUT: Duration = Duration::from_secs(1);

struct Peer {
    id: u64,
    socket: UnixDatagram,
}

struct Interface {
    mac: MacAddr6,
    up: AtomicBool,
    reject_runts: bool,
    peer: Mutex<Option<Peer>>,
    sent: Mutex<Vec<Vec<u8>>>,
    recv_errors: Mutex<VecDeque<i32>>,
    opens: AtomicU64,
}

impl Interface {
    fn peer(&self) -> MutexGuard<'_, Option<Peer>> {
        self.peer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sent(&self) -> MutexGuard<'_, Vec<Vec<u8>>> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn recv_errors(&self) -> MutexGuard<'_, VecDeque<i32>> {
        self.recv_errors.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Registry of simulated interfaces; hand it to the dispatcher as its factory.
#[derive(Default)]
pub struct LoopbackFactory {
    interfaces: Mutex<HashMap<String, Arc<Interface>>>,
    reject_runts: bool,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse frames shorter than 60 bytes with `InvalidInput`, like drivers
    /// that do not pad. Applies to interfaces added afterwards.
    pub fn reject_runts(mut self, reject: bool) -> Self {
        self.reject_runts = reject;
        self
    }

    pub fn with_interface(self, name: &str, mac: MacAddr6) -> Self {
        self.add_interface(name, mac);
        self
    }

    /// Register an interface, replacing any previous one of the same name.
    pub fn add_interface(&self, name: &str, mac: MacAddr6) -> LoopbackHandle {
        let iface = Arc::new(Interface {
            mac,
            up: AtomicBool::new(true),
            reject_runts: self.reject_runts,
            peer: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            recv_errors: Mutex::new(VecDeque::new()),
            opens: AtomicU64::new(0),
        });
        self.lock().insert(name.to_string(), Arc::clone(&iface));
        LoopbackHandle {
            name: name.to_string(),
            iface,
        }
    }

    /// Test-side handle for a registered interface.
    pub fn handle(&self, name: &str) -> Option<LoopbackHandle> {
        self.lock().get(name).map(|iface| LoopbackHandle {
            name: name.to_string(),
            iface: Arc::clone(iface),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Interface>>> {
        self.interfaces.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CaptureFactory for LoopbackFactory {
    fn open(
        &self,
        interface: &str,
        _config: &CaptureConfig,
    ) -> Result<Box<dyn PacketCapture>, CaptureError> {
        check_interface_name(interface)?;
        let iface = self
            .lock()
            .get(interface)
            .cloned()
            .ok_or_else(|| CaptureError::InterfaceNotFound(interface.to_string()))?;

        let (port_side, test_side) = UnixDatagram::pair()?;
        port_side.set_nonblocking(true)?;
        // Injection waits for the port to drain a full queue
        test_side.set_write_timeout(Some(INJECT_TIMEOUT))?;

        let id = iface.opens.fetch_add(1, Ordering::SeqCst) + 1;
        *iface.peer() = Some(Peer {
            id,
            socket: test_side,
        });

        Ok(Box::new(LoopbackCapture {
            name: interface.to_string(),
            id,
            iface,
            socket: RwLock::new(Some(port_side)),
        }))
    }
}

/// Test side of a simulated interface.
#[derive(Clone)]
pub struct LoopbackHandle {
    name: String,
    iface: Arc<Interface>,
}

impl LoopbackHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a frame for the port currently open on this interface.
    pub fn inject(&self, frame: &[u8]) -> io::Result<()> {
        match self.iface.peer().as_ref() {
            Some(peer) => peer.socket.send(frame).map(|_| ()),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("{} is not open", self.name),
            )),
        }
    }

    /// Make a future receive fail with `errno`. Errors are returned in the
    /// order queued, one per receive, before any pending frame is read. The
    /// descriptor only polls readable while a frame is queued, so inject one
    /// after the errors when a dispatcher is reading.
    pub fn fail_recv(&self, errno: i32) {
        self.iface.recv_errors().push_back(errno);
    }

    /// Every frame transmitted on this interface so far, oldest first.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.iface.sent().clone()
    }

    pub fn is_open(&self) -> bool {
        self.iface.peer().is_some()
    }

    pub fn is_up(&self) -> bool {
        self.iface.up.load(Ordering::SeqCst)
    }

    /// Number of times a capture handle has been opened on this interface.
    pub fn open_count(&self) -> u64 {
        self.iface.opens.load(Ordering::SeqCst)
    }
}

/// Port side of a simulated interface.
pub struct LoopbackCapture {
    name: String,
    id: u64,
    iface: Arc<Interface>,
    socket: RwLock<Option<UnixDatagram>>,
}

impl PacketCapture for LoopbackCapture {
    fn interface_name(&self) -> &str {
        &self.name
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let guard = self.socket.read().unwrap_or_else(|e| e.into_inner());
        let socket = guard
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        if let Some(errno) = self.iface.recv_errors().pop_front() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        match socket.recv(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn send(&self, frame: &[u8]) -> io::Result<usize> {
        if self.socket.read().unwrap_or_else(|e| e.into_inner()).is_none() {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        if !self.iface.up.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::ENETDOWN));
        }
        if self.iface.reject_runts && frame.len() < MIN_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {} bytes is shorter than {}", frame.len(), MIN_FRAME_LEN),
            ));
        }
        self.iface.sent().push(frame.to_vec());
        Ok(frame.len())
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.socket
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|s| s.as_raw_fd())
    }

    fn mac_address(&self) -> io::Result<MacAddr6> {
        Ok(self.iface.mac)
    }

    fn set_link_up(&self, up: bool) -> io::Result<()> {
        self.iface.up.store(up, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        let socket = self
            .socket
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if socket.is_some() {
            let mut peer = self.iface.peer();
            // A newer open may already own the interface
            if peer.as_ref().map(|p| p.id) == Some(self.id) {
                *peer = None;
            }
        }
    }
}

impl Drop for LoopbackCapture {
    fn drop(&mut self) {
        self.close();
    }
}
