//! Platform raw-socket implementation of the capture socket seam.

use std::io;
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, Shutdown, SocketAddrV4};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::capture::{CaptureSocket, SocketProvider};

/// Idle receives return at this cadence so a cancelled session winds down
/// even if the shutdown does not interrupt a blocked read.
const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// A raw IPv4 socket delivering full network-layer datagrams, header
/// included, for all traffic the interface sees.
pub struct RawIpSocket {
    inner: Socket,
}

impl RawIpSocket {
    pub fn open(bind_addr: Ipv4Addr) -> io::Result<Self> {
        // Protocol 0 (IPPROTO_IP): network-layer datagrams, no transport
        // demultiplexing.
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::from(0)))?;
        socket.bind(&SocketAddrV4::new(bind_addr, 0).into())?;
        socket.set_header_included_v4(true)?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        enable_receive_all(&socket)?;
        Ok(Self { inner: socket })
    }
}

impl CaptureSocket for RawIpSocket {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        // socket2 receives into MaybeUninit bytes; an initialized &mut [u8]
        // is layout-identical, so the cast is sound.
        let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
        self.inner.recv(uninit)
    }

    fn shutdown(&self) -> io::Result<()> {
        self.inner.shutdown(Shutdown::Both)
    }
}

pub struct RawSocketProvider;

impl SocketProvider for RawSocketProvider {
    type Socket = RawIpSocket;

    fn open(&self, bind_addr: Ipv4Addr) -> io::Result<RawIpSocket> {
        RawIpSocket::open(bind_addr)
    }
}

/// The receive-all option: deliver every IPv4 datagram the interface sees,
/// not only traffic addressed to this host.
#[cfg(windows)]
fn enable_receive_all(socket: &Socket) -> io::Result<()> {
    use std::os::windows::io::AsRawSocket;
    use windows::Win32::Networking::WinSock::{WSAIoctl, SIO_RCVALL, SOCKET};

    let enabled: u32 = 1;
    let mut bytes_returned: u32 = 0;
    let rc = unsafe {
        WSAIoctl(
            SOCKET(socket.as_raw_socket() as usize),
            SIO_RCVALL,
            Some(&enabled as *const u32 as *const core::ffi::c_void),
            std::mem::size_of::<u32>() as u32,
            None,
            0,
            &mut bytes_returned,
            None,
            None,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(windows))]
fn enable_receive_all(_socket: &Socket) -> io::Result<()> {
    // No RCVALL equivalent for a raw IP socket here; the socket still sees
    // every inbound datagram delivered to this host.
    tracing::debug!("receive-all ioctl not available on this platform");
    Ok(())
}
