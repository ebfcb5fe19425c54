//! Linux HCI User Channel socket.
//!
//! A User Channel gives the process exclusive, raw access to one controller:
//! the kernel's own host stack is bypassed entirely. Binding requires the
//! device to be down, so opening issues HCIDEVDOWN first. We use `libc`
//! directly; the HCI socket address family and ioctls are too niche for the
//! higher-level wrappers.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::transport::Transport;

const BTPROTO_HCI: libc::c_int = 1;
const HCI_CHANNEL_USER: libc::c_ushort = 1;

// _IOW('H', 202, int)
const HCIDEVDOWN: libc::c_ulong = (1 << 30) | (4 << 16) | ((b'H' as libc::c_ulong) << 8) | 202;

// Largest packet a controller can hand us: an ACL data packet with a 64 KiB
// payload, its 4-byte header and the type discriminator.
const RECV_BUF_LEN: usize = 5 + u16::MAX as usize;

#[repr(C)]
#[derive(Copy, Clone)]
struct sockaddr_hci {
    hci_family: libc::sa_family_t,
    hci_dev: libc::c_ushort,
    hci_channel: libc::c_ushort,
}

/// An HCI User Channel bound to one controller.
#[derive(Debug)]
pub struct HciSocket {
    fd: AsyncFd<OwnedFd>,
}

impl HciSocket {
    /// Take exclusive ownership of controller `dev` (`hci<dev>`).
    ///
    /// Brings the device down first; User Channel sockets can only bind to a
    /// device that is down. Requires `CAP_NET_ADMIN`.
    pub fn open(dev: u16) -> io::Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_BLUETOOTH,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                BTPROTO_HCI,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        if unsafe { libc::ioctl(fd.as_raw_fd(), HCIDEVDOWN, libc::c_int::from(dev)) } < 0 {
            return Err(io::Error::last_os_error());
        }

        let addr = sockaddr_hci {
            hci_family: libc::AF_BLUETOOTH as libc::sa_family_t,
            hci_dev: dev,
            hci_channel: HCI_CHANNEL_USER,
        };
        if unsafe {
            libc::bind(
                fd.as_raw_fd(),
                (&addr as *const sockaddr_hci).cast(),
                mem::size_of::<sockaddr_hci>() as libc::socklen_t,
            )
        } < 0
        {
            return Err(io::Error::last_os_error());
        }

        // A previous owner may have left events queued; drop them so the
        // first thing the adapter sees is a response to its own traffic.
        let mut stale = [0u8; RECV_BUF_LEN];
        loop {
            let n = unsafe {
                libc::read(fd.as_raw_fd(), stale.as_mut_ptr().cast(), stale.len())
            };
            if n <= 0 {
                break;
            }
        }

        Ok(Self {
            fd: AsyncFd::with_interest(fd, Interest::READABLE | Interest::WRITABLE)?,
        })
    }
}

impl Transport for HciSocket {
    fn poll_recv(&self, cx: &mut Context<'_>) -> Poll<io::Result<Bytes>> {
        loop {
            let mut guard = std::task::ready!(self.fd.poll_read_ready(cx))?;
            let mut buf = vec![0u8; RECV_BUF_LEN];
            match guard.try_io(|fd| {
                let n = unsafe {
                    libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                }
                Ok(Ok(n)) => {
                    buf.truncate(n);
                    return Poll::Ready(Ok(Bytes::from(buf)));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_send(&self, cx: &mut Context<'_>, packet: &[u8]) -> Poll<io::Result<()>> {
        loop {
            let mut guard = std::task::ready!(self.fd.poll_write_ready(cx))?;
            match guard.try_io(|fd| {
                let n = unsafe {
                    libc::write(fd.as_raw_fd(), packet.as_ptr().cast(), packet.len())
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(n)) if n == packet.len() => return Poll::Ready(Ok(())),
                Ok(Ok(_)) => {
                    return Poll::Ready(Err(io::Error::other("partial HCI packet write")));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}
