//! tun device.
//!
//! Every packet read or written is preceded by a 4-byte header naming its
//! address family: the `tun_pi` packet information header (flags and
//! ethertype) on Linux, a network-order `AF_*` value on FreeBSD. Reads and
//! writes go through `readv`/`writev` so the header never has to be copied
//! next to the packet.

use crate::packet::OutboundPacket;
use crate::packet_io::PacketIO;
use map646_core::AddressFamily;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::task::{Context, Poll};
use tokio::io::unix::AsyncFd;
use tracing::{debug, warn};

pub use sys::{decode_frame_header, encode_frame_header};

/// Size of the framing header in front of every packet.
pub const FRAME_HEADER_LEN: usize = 4;

#[cfg(target_os = "linux")]
mod sys {
    use super::FRAME_HEADER_LEN;
    use map646_core::AddressFamily;
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    const TUNSETIFF: libc::c_ulong = 0x400454ca;
    const IFF_TUN: libc::c_short = 0x0001;

    #[repr(C)]
    struct IfReq {
        ifr_name: [libc::c_char; libc::IFNAMSIZ],
        ifr_flags: libc::c_short,
        _padding: [u8; 22],
    }

    /// Packet information header for a packet of `family`.
    pub fn encode_frame_header(family: AddressFamily) -> [u8; FRAME_HEADER_LEN] {
        let ethertype = family.ethertype().to_be_bytes();
        [0, 0, ethertype[0], ethertype[1]]
    }

    /// Address family named by a packet information header, if known.
    pub fn decode_frame_header(header: &[u8; FRAME_HEADER_LEN]) -> Option<AddressFamily> {
        AddressFamily::from_ethertype(u16::from_be_bytes([header[2], header[3]]))
    }

    /// Open `/dev/net/tun` and attach it to interface `name`, keeping the
    /// packet information header. Returns the name the kernel assigned.
    pub fn open(name: &str) -> io::Result<(OwnedFd, String)> {
        let raw = unsafe {
            libc::open(
                b"/dev/net/tun\0".as_ptr().cast::<libc::c_char>(),
                libc::O_RDWR | libc::O_CLOEXEC,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut ifr = IfReq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: IFF_TUN,
            _padding: [0; 22],
        };
        for (slot, &b) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
            *slot = b as libc::c_char;
        }

        let result = unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF, &mut ifr) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }

        let len = ifr
            .ifr_name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(libc::IFNAMSIZ);
        let bytes: Vec<u8> = ifr.ifr_name[..len].iter().map(|&c| c as u8).collect();
        Ok((fd, String::from_utf8_lossy(&bytes).into_owned()))
    }
}

#[cfg(target_os = "freebsd")]
mod sys {
    use super::FRAME_HEADER_LEN;
    use map646_core::AddressFamily;
    use std::ffi::CString;
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    /// `_IOW('t', 96, int)`: prefix every packet with its address family.
    const TUNSIFHEAD: libc::c_ulong = 0x8004_7460;

    pub fn encode_frame_header(family: AddressFamily) -> [u8; FRAME_HEADER_LEN] {
        let af = match family {
            AddressFamily::Inet => libc::AF_INET,
            AddressFamily::Inet6 => libc::AF_INET6,
        };
        (af as u32).to_be_bytes()
    }

    pub fn decode_frame_header(header: &[u8; FRAME_HEADER_LEN]) -> Option<AddressFamily> {
        match u32::from_be_bytes(*header) as libc::c_int {
            libc::AF_INET => Some(AddressFamily::Inet),
            libc::AF_INET6 => Some(AddressFamily::Inet6),
            _ => None,
        }
    }

    /// Open `/dev/<name>` with the address family header enabled.
    pub fn open(name: &str) -> io::Result<(OwnedFd, String)> {
        let path = CString::new(format!("/dev/{name}"))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let raw = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let on: libc::c_int = 1;
        let result = unsafe { libc::ioctl(fd.as_raw_fd(), TUNSIFHEAD, &on) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((fd, name.to_string()))
    }
}

/// A tun interface carrying both IPv4 and IPv6.
pub struct TunDevice {
    fd: AsyncFd<OwnedFd>,
    name: String,
}

impl TunDevice {
    /// Create (or attach to) the tun interface `name`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(name: &str) -> io::Result<Self> {
        if name.is_empty() || name.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid interface name {name:?}"),
            ));
        }

        let (fd, name) = sys::open(name)?;
        set_nonblocking(&fd)?;
        debug!("opened tun device {name}");

        Ok(Self {
            fd: AsyncFd::new(fd)?,
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PacketIO for TunDevice {
    fn poll_recv(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<(AddressFamily, usize)>> {
        loop {
            let mut guard = match self.fd.poll_read_ready(cx) {
                Poll::Ready(Ok(guard)) => guard,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            let mut header = [0u8; FRAME_HEADER_LEN];
            let read = guard.try_io(|inner| {
                let iov = [
                    libc::iovec {
                        iov_base: header.as_mut_ptr().cast(),
                        iov_len: header.len(),
                    },
                    libc::iovec {
                        iov_base: buf.as_mut_ptr().cast(),
                        iov_len: buf.len(),
                    },
                ];
                let n = unsafe {
                    libc::readv(inner.as_raw_fd(), iov.as_ptr(), iov.len() as libc::c_int)
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });

            let n = match read {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            };

            if n < FRAME_HEADER_LEN {
                warn!("short read of {n} bytes from {}", self.name);
                continue;
            }
            match decode_frame_header(&header) {
                Some(family) => return Poll::Ready(Ok((family, n - FRAME_HEADER_LEN))),
                None => warn!("ignoring packet with frame header {header:02x?} on {}", self.name),
            }
        }
    }

    fn send(&mut self, packet: &OutboundPacket) -> io::Result<()> {
        let header = encode_frame_header(packet.family);
        let mut iov = Vec::with_capacity(4);
        iov.push(libc::iovec {
            iov_base: header.as_ptr() as *mut _,
            iov_len: header.len(),
        });
        for segment in packet.segments() {
            iov.push(libc::iovec {
                iov_base: segment.as_ptr() as *mut _,
                iov_len: segment.len(),
            });
        }

        let expected = FRAME_HEADER_LEN + packet.len();
        let n = unsafe {
            libc::writev(self.fd.as_raw_fd(), iov.as_ptr(), iov.len() as libc::c_int)
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else if n as usize != expected {
            Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "incomplete packet write",
            ))
        } else {
            Ok(())
        }
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let result = unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
