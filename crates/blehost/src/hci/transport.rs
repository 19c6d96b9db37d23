//! HCI transports.
//!
//! The host core speaks to the controller through the [`Transport`] trait:
//! an opaque bidirectional packet stream. Three implementations are
//! provided: the kernel HCI socket (already packet-framed), and H4 framing
//! over a TCP stream or a serial device.

use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::constants::{HCI_ACL_PKT, HCI_COMMAND_PKT, HCI_EVENT_PKT, HCI_SCO_PKT};
use super::HciError;

/// A framed, bidirectional byte stream to the controller. Every packet
/// includes its leading packet-indicator byte.
pub trait Transport: Send + Sync {
    /// Blocks until a complete HCI packet is available.
    fn read_packet(&self) -> io::Result<Vec<u8>>;

    /// Writes one complete HCI packet.
    fn write_packet(&self, packet: &[u8]) -> io::Result<()>;

    /// Shuts the transport down, unblocking any pending read.
    fn close(&self);
}

const AF_BLUETOOTH: i32 = 31;
const BTPROTO_HCI: i32 = 1;
const HCI_CHANNEL_USER: u16 = 1;

#[repr(C)]
struct SockaddrHci {
    hci_family: libc::sa_family_t,
    hci_dev: u16,
    hci_channel: u16,
}

/// A raw kernel HCI socket bound to a local controller.
#[derive(Debug)]
pub struct HciSocket {
    fd: RawFd,
    closed: AtomicBool,
}

impl HciSocket {
    /// Opens the HCI user channel for device `dev_id` (0 for the first
    /// controller). Requires the device to be down and the caller to hold
    /// CAP_NET_ADMIN.
    pub fn open(dev_id: u16) -> Result<Self, HciError> {
        let fd = unsafe {
            libc::socket(
                AF_BLUETOOTH,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                BTPROTO_HCI,
            )
        };
        if fd < 0 {
            return Err(HciError::Socket(io::Error::last_os_error()));
        }

        let addr = SockaddrHci {
            hci_family: AF_BLUETOOTH as libc::sa_family_t,
            hci_dev: dev_id,
            hci_channel: HCI_CHANNEL_USER,
        };
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<SockaddrHci>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(HciError::Bind(err));
        }

        Ok(Self {
            fd,
            closed: AtomicBool::new(false),
        })
    }
}

impl Transport for HciSocket {
    fn read_packet(&self) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; 1024];
        loop {
            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "hci socket closed"));
            }
            buf.truncate(n as usize);
            return Ok(buf);
        }
    }

    fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        let n = unsafe {
            libc::write(
                self.fd,
                packet.as_ptr() as *const libc::c_void,
                packet.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            unsafe { libc::shutdown(self.fd, libc::SHUT_RDWR) };
        }
    }
}

impl AsRawFd for HciSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for HciSocket {
    fn drop(&mut self) {
        self.close();
        unsafe { libc::close(self.fd) };
    }
}

/// H4 framing over any byte stream: a 1-byte packet indicator followed by a
/// type-specific header that carries the payload length.
pub struct H4Stream {
    reader: Mutex<Box<dyn Read + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    closer: Box<dyn Fn() + Send + Sync>,
}

impl H4Stream {
    /// Connects to an H4-over-TCP controller (e.g. an emulator).
    pub fn tcp<A: ToSocketAddrs>(addr: A, timeout: Duration) -> io::Result<Self> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address"))?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        let closer_stream = stream.try_clone()?;
        Ok(Self {
            reader: Mutex::new(Box::new(reader)),
            writer: Mutex::new(Box::new(stream)),
            closer: Box::new(move || {
                let _ = closer_stream.shutdown(std::net::Shutdown::Both);
            }),
        })
    }

    /// Opens an H4 serial device by path.
    pub fn serial(path: &str) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let reader = file.try_clone()?;
        Ok(Self {
            reader: Mutex::new(Box::new(reader)),
            writer: Mutex::new(Box::new(file)),
            closer: Box::new(|| {}),
        })
    }

    /// Wraps an arbitrary stream pair, mostly useful for tests.
    pub fn from_parts(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closer: Box::new(|| {}),
        }
    }

    fn read_exact_locked(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<()> {
        reader.read_exact(buf)
    }
}

impl Transport for H4Stream {
    fn read_packet(&self) -> io::Result<Vec<u8>> {
        let mut reader = self.reader.lock().unwrap();
        let mut indicator = [0u8; 1];
        Self::read_exact_locked(&mut **reader, &mut indicator)?;

        // Header length and the offset of the length field depend on the
        // packet type.
        let (header_len, len_at, len_bytes) = match indicator[0] {
            HCI_EVENT_PKT => (2usize, 1usize, 1usize),
            HCI_ACL_PKT => (4, 2, 2),
            HCI_COMMAND_PKT => (3, 2, 1),
            HCI_SCO_PKT => (3, 2, 1),
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown H4 packet indicator 0x{other:02x}"),
                ))
            }
        };

        let mut header = vec![0u8; header_len];
        Self::read_exact_locked(&mut **reader, &mut header)?;
        let payload_len = if len_bytes == 2 {
            u16::from_le_bytes([header[len_at], header[len_at + 1]]) as usize
        } else {
            header[len_at] as usize
        };

        let mut packet = Vec::with_capacity(1 + header_len + payload_len);
        packet.extend_from_slice(&indicator);
        packet.extend_from_slice(&header);
        let start = packet.len();
        packet.resize(start + payload_len, 0);
        Self::read_exact_locked(&mut **reader, &mut packet[start..])?;
        Ok(packet)
    }

    fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().unwrap();
        writer.write_all(packet)?;
        writer.flush()
    }

    fn close(&self) {
        (self.closer)();
    }
}
