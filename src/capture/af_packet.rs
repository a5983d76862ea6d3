//! AF_PACKET socket implementation

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::RwLock;

use macaddr::MacAddr6;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use super::{check_interface_name, CaptureConfig, PacketCapture};
use crate::error::CaptureError;

const ETH_P_ALL: u16 = 0x0003;
const PACKET_AUXDATA: libc::c_int = 8;
const PACKET_OUTGOING: u8 = 4;
const TP_STATUS_VLAN_VALID: u32 = 1 << 4;
const TP_STATUS_VLAN_TPID_VALID: u32 = 1 << 6;
const ETHERTYPE_VLAN: u16 = 0x8100;
pub(crate) const VLAN_TAG_LEN: usize = 4;

/// `struct tpacket_auxdata` from `<linux/if_packet.h>`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct TpacketAuxdata {
    tp_status: u32,
    tp_len: u32,
    tp_snaplen: u32,
    tp_mac: u16,
    tp_net: u16,
    tp_vlan_tci: u16,
    tp_vlan_tpid: u16,
}

/// AF_PACKET socket bound to one interface in promiscuous mode.
pub struct AfPacketCapture {
    name: String,
    ifindex: i32,
    socket: RwLock<Option<Socket>>,
}

impl AfPacketCapture {
    /// Create a new AF_PACKET socket bound to the specified interface
    pub fn open(name: &str, config: &CaptureConfig) -> Result<Self, CaptureError> {
        check_interface_name(name)?;

        let ifindex = if_nametoindex(name)?;

        let protocol = Protocol::from(i32::from(ETH_P_ALL.to_be()));
        let socket = Socket::new(Domain::PACKET, Type::RAW, Some(protocol))
            .map_err(|e| CaptureError::from_os(name, e))?;
        let fd = socket.as_raw_fd();

        // Bind to interface
        let mut sll: libc::sockaddr_ll = unsafe { mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = ETH_P_ALL.to_be();
        sll.sll_ifindex = ifindex;

        let ret = unsafe {
            libc::bind(
                fd,
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(CaptureError::from_os(name, io::Error::last_os_error()));
        }

        set_promisc(fd, ifindex, true).map_err(|e| CaptureError::from_os(name, e))?;
        setsockopt_int(fd, libc::SOL_PACKET, PACKET_AUXDATA, 1)
            .map_err(|e| CaptureError::from_os(name, e))?;

        socket.set_nonblocking(true)?;
        socket.set_read_timeout(Some(config.read_timeout))?;
        if let Err(e) = socket.set_recv_buffer_size(config.buffer_size) {
            debug!("Could not size receive buffer on {}: {}", name, e);
        }

        Ok(Self {
            name: name.to_string(),
            ifindex,
            socket: RwLock::new(Some(socket)),
        })
    }

    pub fn ifindex(&self) -> i32 {
        self.ifindex
    }

    fn with_fd<T>(&self, f: impl FnOnce(RawFd) -> io::Result<T>) -> io::Result<T> {
        let guard = self
            .socket
            .read()
            .map_err(|_| io::Error::other("socket lock poisoned"))?;
        match guard.as_ref() {
            Some(socket) => f(socket.as_raw_fd()),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }
}

impl PacketCapture for AfPacketCapture {
    fn interface_name(&self) -> &str {
        &self.name
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        if buf.len() <= VLAN_TAG_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "receive buffer too small",
            ));
        }
        self.with_fd(|fd| recv_frame(fd, buf))
    }

    fn send(&self, frame: &[u8]) -> io::Result<usize> {
        let guard = self
            .socket
            .read()
            .map_err(|_| io::Error::other("socket lock poisoned"))?;
        match guard.as_ref() {
            Some(socket) => socket.send(frame),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.socket
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|s| s.as_raw_fd()))
    }

    fn mac_address(&self) -> io::Result<MacAddr6> {
        self.with_fd(|fd| {
            let mut ifr = ifreq_for(&self.name)?;
            let ret = unsafe { libc::ioctl(fd, libc::SIOCGIFHWADDR, &mut ifr) };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            let data = unsafe { ifr.ifr_ifru.ifru_hwaddr.sa_data };
            let mut octets = [0u8; 6];
            for (dst, src) in octets.iter_mut().zip(data.iter()) {
                *dst = *src as u8;
            }
            Ok(MacAddr6::from(octets))
        })
    }

    fn set_link_up(&self, up: bool) -> io::Result<()> {
        self.with_fd(|fd| {
            let mut ifr = ifreq_for(&self.name)?;
            if unsafe { libc::ioctl(fd, libc::SIOCGIFFLAGS, &mut ifr) } < 0 {
                return Err(io::Error::last_os_error());
            }
            let flags = unsafe { ifr.ifr_ifru.ifru_flags };
            let iff_up = libc::IFF_UP as libc::c_short;
            let wanted = if up { flags | iff_up } else { flags & !iff_up };
            if wanted == flags {
                return Ok(());
            }
            ifr.ifr_ifru.ifru_flags = wanted;
            if unsafe { libc::ioctl(fd, libc::SIOCSIFFLAGS, &ifr) } < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        })
    }

    fn close(&self) {
        let socket = match self.socket.write() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(socket) = socket {
            let _ = set_promisc(socket.as_raw_fd(), self.ifindex, false);
            drop(socket);
        }
    }
}

impl Drop for AfPacketCapture {
    fn drop(&mut self) {
        self.close();
    }
}

fn if_nametoindex(name: &str) -> Result<i32, CaptureError> {
    let c_name =
        CString::new(name).map_err(|_| CaptureError::InvalidInterfaceName(name.to_string()))?;
    let idx = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if idx == 0 {
        return Err(CaptureError::InterfaceNotFound(name.to_string()));
    }
    i32::try_from(idx).map_err(|_| CaptureError::InterfaceNotFound(name.to_string()))
}

fn ifreq_for(name: &str) -> io::Result<libc::ifreq> {
    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
    let bytes = name.as_bytes();
    if bytes.len() >= ifr.ifr_name.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "interface name too long",
        ));
    }
    for (dst, src) in ifr.ifr_name.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    Ok(ifr)
}

fn setsockopt_int(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_promisc(fd: RawFd, ifindex: i32, enable: bool) -> io::Result<()> {
    let mreq = libc::packet_mreq {
        mr_ifindex: ifindex,
        mr_type: libc::PACKET_MR_PROMISC as u16,
        mr_alen: 0,
        mr_address: [0; 8],
    };

    let optname = if enable {
        libc::PACKET_ADD_MEMBERSHIP
    } else {
        libc::PACKET_DROP_MEMBERSHIP
    };

    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_PACKET,
            optname,
            &mreq as *const libc::packet_mreq as *const libc::c_void,
            mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// `recvmsg` one frame, skipping our own transmissions and putting back the
/// 802.1Q tag the kernel moved into the auxiliary data.
fn recv_frame(fd: RawFd, buf: &mut [u8]) -> io::Result<Option<usize>> {
    let capacity = buf.len() - VLAN_TAG_LEN;
    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: capacity,
    };
    // u64 keeps the buffer aligned for cmsghdr
    let mut control = [0u64; 8];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &mut addr as *mut libc::sockaddr_ll as *mut libc::c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = mem::size_of_val(&control) as _;

    let n = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_DONTWAIT) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err);
    }
    let mut len = n as usize;

    if addr.sll_pkttype == PACKET_OUTGOING {
        return Ok(None);
    }

    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    while !cmsg.is_null() {
        let header = unsafe { &*cmsg };
        if header.cmsg_level == libc::SOL_PACKET && header.cmsg_type == PACKET_AUXDATA {
            let aux = unsafe {
                std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const TpacketAuxdata)
            };
            if let Some((tpid, tci)) = vlan_tag(&aux) {
                len = insert_vlan_tag(buf, len, tpid, tci);
            }
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
    }

    Ok(Some(len))
}

fn vlan_tag(aux: &TpacketAuxdata) -> Option<(u16, u16)> {
    if aux.tp_vlan_tci == 0 && aux.tp_status & TP_STATUS_VLAN_VALID == 0 {
        return None;
    }
    let tpid = if aux.tp_status & TP_STATUS_VLAN_TPID_VALID != 0 {
        aux.tp_vlan_tpid
    } else {
        ETHERTYPE_VLAN
    };
    Some((tpid, aux.tp_vlan_tci))
}

/// Insert a VLAN tag after the MAC addresses of the `len`-byte frame in `buf`,
/// returning the new length. Frames too short to carry MAC addresses, or with
/// no room left in `buf`, are returned unchanged.
pub(crate) fn insert_vlan_tag(buf: &mut [u8], len: usize, tpid: u16, tci: u16) -> usize {
    const MACS: usize = 12;
    if len < MACS || len + VLAN_TAG_LEN > buf.len() {
        return len;
    }
    buf.copy_within(MACS..len, MACS + VLAN_TAG_LEN);
    buf[MACS..MACS + 2].copy_from_slice(&tpid.to_be_bytes());
    buf[MACS + 2..MACS + 4].copy_from_slice(&tci.to_be_bytes());
    len + VLAN_TAG_LEN
}
