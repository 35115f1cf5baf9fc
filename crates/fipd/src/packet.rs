//! Raw Ethernet I/O for FIP.
//!
//! One AF_PACKET socket bound to the FIP ethertype on a single interface,
//! in all-multicast mode so the ENode and VN2VN group addresses arrive.

use std::io::Read;
use std::os::fd::AsRawFd;

use anyhow::{Context, Result};
use bytes::Bytes;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;

use fip_core::wire::{MacAddr, FIP_ETHERTYPE};
use fip_ctlr::Transport;

pub struct PacketSocket {
    fd: AsyncFd<Socket>,
}

impl PacketSocket {
    pub fn open(interface_index: u32) -> Result<Self> {
        let proto = i32::from(FIP_ETHERTYPE.to_be());
        let socket = Socket::new(Domain::PACKET, Type::RAW, Some(Protocol::from(proto)))
            .context("socket(AF_PACKET)")?;

        // SAFETY: sockaddr_ll fits in sockaddr_storage and all-zero is valid
        // for both.
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let sll = unsafe {
            &mut *(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_ll)
        };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = FIP_ETHERTYPE.to_be();
        sll.sll_ifindex = interface_index as i32;
        let len = std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
        // SAFETY: storage holds an initialized sockaddr_ll of `len` bytes.
        let addr = unsafe { SockAddr::new(storage, len) };
        socket.bind(&addr).context("bind(AF_PACKET)")?;

        let mreq = libc::packet_mreq {
            mr_ifindex: interface_index as i32,
            mr_type: libc::PACKET_MR_ALLMULTI as u16,
            mr_alen: 0,
            mr_address: [0; 8],
        };
        // SAFETY: valid fd and a correctly sized packet_mreq.
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_PACKET,
                libc::PACKET_ADD_MEMBERSHIP,
                &mreq as *const libc::packet_mreq as *const libc::c_void,
                std::mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error()).context("PACKET_ADD_MEMBERSHIP");
        }

        socket.set_nonblocking(true).context("O_NONBLOCK")?;
        let fd = AsyncFd::new(socket).context("register with reactor")?;
        Ok(Self { fd })
    }

    /// Receive one frame, Ethernet header included.
    pub async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                let mut socket: &Socket = inner.get_ref();
                socket.read(buf)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

impl Transport for PacketSocket {
    fn send(&self, frame: Bytes) {
        match self.fd.get_ref().send(&frame) {
            Ok(n) => tracing::trace!(bytes = n, "FIP frame sent"),
            Err(e) => tracing::warn!(error = %e, "FIP send failed"),
        }
    }
}

/// Get the OS interface index for a named network interface.
pub fn if_index(name: &str) -> Result<u32> {
    let name_cstr = std::ffi::CString::new(name).context("interface name contains null byte")?;
    let index = unsafe { libc::if_nametoindex(name_cstr.as_ptr()) };
    if index == 0 {
        anyhow::bail!("interface '{}' not found", name);
    }
    Ok(index)
}

/// Burned-in MAC of `name`, from sysfs.
pub fn interface_mac(name: &str) -> Result<MacAddr> {
    let path = format!("/sys/class/net/{name}/address");
    let text = std::fs::read_to_string(&path).with_context(|| format!("read {path}"))?;
    parse_mac(text.trim()).with_context(|| format!("bad MAC in {path}"))
}

fn parse_mac(s: &str) -> Option<MacAddr> {
    let bytes = hex::decode(s.replace(':', "")).ok()?;
    let arr: [u8; 6] = bytes.try_into().ok()?;
    Some(MacAddr(arr))
}
