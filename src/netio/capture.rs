//! Link capture: turns frames on the wire into `(buffer, length,
//! source, interface)` tuples.
//!
//! Two profiles exist. The raw profile opens one `AF_PACKET`
//! datagram socket per interface and strips the IPv4/UDP envelope in
//! user space; it is the preferred path because a plain UDP socket
//! misses frames sent to 255.255.255.255 when the host has no
//! address on that subnet yet. The portable profile is a wildcard
//! UDP socket on port 67 and reports the interface as unknown.
//!
//! Buffers are owned by a pool and travel linearly: capture, queue,
//! dispatcher, then back to the pool on drop.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::UdpSocket;

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;
pub const BUFFER_SIZE: usize = 2048;

/// Pool of reusable receive/send buffers. Returned buffers keep
/// whatever bytes the previous user wrote; consumers that care must
/// zero what they touch.
pub struct BufferPool {
    free: Mutex<Vec<Box<[u8]>>>,
}

impl BufferPool {
    pub fn new(preallocate: usize) -> Arc<Self> {
        let free = (0..preallocate)
            .map(|_| vec![0u8; BUFFER_SIZE].into_boxed_slice())
            .collect();
        Arc::new(Self {
            free: Mutex::new(free),
        })
    }

    pub fn take(self: &Arc<Self>) -> PooledBuffer {
        let data = self
            .free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| vec![0u8; BUFFER_SIZE].into_boxed_slice());
        PooledBuffer {
            data: Some(data),
            pool: self.clone(),
        }
    }

    fn give(&self, buffer: Box<[u8]>) {
        self.free.lock().unwrap().push(buffer);
    }

    pub fn idle(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

/// A buffer on loan from the pool; hands itself back on drop.
pub struct PooledBuffer {
    data: Option<Box<[u8]>>,
    pool: Arc<BufferPool>,
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.data.as_ref().unwrap()
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.as_mut().unwrap()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.give(data);
        }
    }
}

/// One captured BOOTREQUEST payload.
pub struct Inbound {
    pub buffer: PooledBuffer,
    pub len: usize,
    pub source: SocketAddrV4,
    /// Known in the raw profile, `None` in the portable one.
    pub interface: Option<String>,
}

impl Inbound {
    pub fn payload(&self) -> &[u8] {
        &self.buffer[..self.len]
    }
}

/// The capture seam: a lazy, restartable sequence of inbound
/// payloads. Frames that fail envelope decode are dropped before
/// this boundary.
#[async_trait]
pub trait PacketSource: Send + Sync {
    async fn recv(&self) -> std::io::Result<Inbound>;
    /// Name for the startup banner and logs.
    fn label(&self) -> String;
}

/// Builds the portable-profile socket: wildcard bind on the server
/// port with SO_BROADCAST and SO_REUSEADDR, shared between capture
/// and the reply path.
pub fn open_portable_socket(port: u16) -> std::io::Result<Arc<UdpSocket>> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let bind: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into();
    socket.bind(&bind.into())?;
    Ok(Arc::new(UdpSocket::from_std(socket.into())?))
}

/// Portable profile: a plain UDP socket, interface unknown.
pub struct UdpCapture {
    socket: Arc<UdpSocket>,
    pool: Arc<BufferPool>,
}

impl UdpCapture {
    pub fn new(socket: Arc<UdpSocket>, pool: Arc<BufferPool>) -> Self {
        Self { socket, pool }
    }
}

#[async_trait]
impl PacketSource for UdpCapture {
    async fn recv(&self) -> std::io::Result<Inbound> {
        loop {
            let mut buffer = self.pool.take();
            let (len, source) = self.socket.recv_from(&mut buffer).await?;
            let SocketAddr::V4(source) = source else { continue };
            return Ok(Inbound {
                buffer,
                len,
                source,
                interface: None,
            });
        }
    }

    fn label(&self) -> String {
        String::from("udp:*")
    }
}

/// Folds 16-bit words with end-around carry; a valid IPv4 header
/// (checksum field included) folds to 0xFFFF.
pub(crate) fn ones_complement_sum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Strips the IPv4 and UDP headers off a raw frame. Returns the
/// payload window and the source endpoint, or `None` for anything
/// that is not well-formed UDP to `port` (dropped silently).
pub(crate) fn parse_ipv4_udp(
    frame: &[u8],
    port: u16,
) -> Option<(usize, usize, SocketAddrV4)> {
    if frame.len() < 20 || frame[0] >> 4 != 4 {
        return None;
    }
    let ihl = ((frame[0] & 0x0F) as usize) * 4;
    if ihl < 20 || frame.len() < ihl + 8 {
        return None;
    }
    if frame[9] != 17 {
        return None;
    }
    if ones_complement_sum(&frame[..ihl]) != 0xFFFF {
        return None;
    }
    let total = u16::from_be_bytes([frame[2], frame[3]]) as usize;
    if total < ihl + 8 || frame.len() < total {
        return None;
    }

    let source_ip = Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]);
    let udp = &frame[ihl..];
    let source_port = u16::from_be_bytes([udp[0], udp[1]]);
    let dest_port = u16::from_be_bytes([udp[2], udp[3]]);
    if dest_port != port {
        return None;
    }
    let udp_len = u16::from_be_bytes([udp[4], udp[5]]) as usize;
    if udp_len < 8 || ihl + udp_len > total {
        return None;
    }
    Some((
        ihl + 8,
        udp_len - 8,
        SocketAddrV4::new(source_ip, source_port),
    ))
}

/// Raw profile: an `AF_PACKET` datagram socket bound to one
/// interface. The kernel strips the Ethernet header; the IPv4/UDP
/// envelope is checked and stripped here.
#[cfg(target_os = "linux")]
pub struct RawCapture {
    fd: tokio::io::unix::AsyncFd<socket2::Socket>,
    interface: String,
    pool: Arc<BufferPool>,
}

#[cfg(target_os = "linux")]
impl RawCapture {
    pub fn open(interface: &str, pool: Arc<BufferPool>) -> std::io::Result<Self> {
        use std::os::fd::AsRawFd;

        let protocol = (libc::ETH_P_IP as u16).to_be();
        let socket = socket2::Socket::new(
            socket2::Domain::PACKET,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::from(protocol as i32)),
        )?;
        socket.set_nonblocking(true)?;

        let name = std::ffi::CString::new(interface)
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
        let ifindex = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if ifindex == 0 {
            return Err(std::io::Error::last_os_error());
        }

        let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = protocol;
        sll.sll_ifindex = ifindex as i32;
        let rc = unsafe {
            libc::bind(
                socket.as_raw_fd(),
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }

        Ok(Self {
            fd: tokio::io::unix::AsyncFd::new(socket)?,
            interface: interface.to_string(),
            pool,
        })
    }
}

#[cfg(target_os = "linux")]
#[async_trait]
impl PacketSource for RawCapture {
    async fn recv(&self) -> std::io::Result<Inbound> {
        use std::os::fd::AsRawFd;

        loop {
            // Bounded poll so cancellation is observed within a
            // second even on a silent wire.
            let readable = tokio::time::timeout(
                std::time::Duration::from_secs(1),
                self.fd.readable(),
            )
            .await;
            let Ok(readable) = readable else { continue };
            let mut guard = readable?;

            let mut buffer = self.pool.take();
            let received = guard.try_io(|inner| {
                let fd = inner.get_ref().as_raw_fd();
                let n = unsafe {
                    libc::recv(fd, buffer.as_mut_ptr() as *mut libc::c_void, buffer.len(), 0)
                };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            let len = match received {
                Ok(Ok(len)) => len,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            };

            let Some((offset, payload_len, source)) =
                parse_ipv4_udp(&buffer[..len], SERVER_PORT)
            else {
                continue;
            };
            buffer.copy_within(offset..offset + payload_len, 0);
            return Ok(Inbound {
                buffer,
                len: payload_len,
                source,
                interface: Some(self.interface.clone()),
            });
        }
    }

    fn label(&self) -> String {
        format!("raw:{}", self.interface)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds an IPv4+UDP envelope with a valid header checksum.
    fn envelope(src: Ipv4Addr, sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
        let udp_len = 8 + payload.len();
        let total = 20 + udp_len;
        let mut frame = vec![0u8; total];
        frame[0] = 0x45;
        frame[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        frame[8] = 64;
        frame[9] = 17;
        frame[12..16].copy_from_slice(&src.octets());
        frame[16..20].copy_from_slice(&Ipv4Addr::BROADCAST.octets());
        let checksum = !ones_complement_sum(&frame[..20]);
        frame[10..12].copy_from_slice(&checksum.to_be_bytes());

        frame[20..22].copy_from_slice(&sport.to_be_bytes());
        frame[22..24].copy_from_slice(&dport.to_be_bytes());
        frame[24..26].copy_from_slice(&(udp_len as u16).to_be_bytes());
        frame[28..].copy_from_slice(payload);
        frame
    }

    #[test]
    fn strips_the_envelope() {
        let src: Ipv4Addr = "0.0.0.0".parse().unwrap();
        let frame = envelope(src, 68, 67, b"request-bytes");
        let (offset, len, source) = parse_ipv4_udp(&frame, 67).unwrap();
        assert_eq!(&frame[offset..offset + len], b"request-bytes");
        assert_eq!(source, SocketAddrV4::new(src, 68));
    }

    #[test]
    fn wrong_port_is_dropped() {
        let frame = envelope("10.0.0.5".parse().unwrap(), 68, 53, b"x");
        assert!(parse_ipv4_udp(&frame, 67).is_none());
    }

    #[test]
    fn bad_checksum_is_dropped() {
        let mut frame = envelope("10.0.0.5".parse().unwrap(), 68, 67, b"x");
        frame[10] ^= 0xFF;
        assert!(parse_ipv4_udp(&frame, 67).is_none());
    }

    #[test]
    fn non_udp_is_dropped() {
        let mut frame = envelope("10.0.0.5".parse().unwrap(), 68, 67, b"x");
        frame[9] = 6;
        // Checksum must stay valid for the drop to be protocol-based.
        frame[10..12].copy_from_slice(&[0, 0]);
        let checksum = !ones_complement_sum(&frame[..20]);
        frame[10..12].copy_from_slice(&checksum.to_be_bytes());
        assert!(parse_ipv4_udp(&frame, 67).is_none());
    }

    #[test]
    fn short_frames_are_dropped() {
        assert!(parse_ipv4_udp(&[0x45, 0, 0], 67).is_none());
    }

    #[test]
    fn buffers_return_to_the_pool() {
        let pool = BufferPool::new(1);
        assert_eq!(pool.idle(), 1);
        {
            let _buffer = pool.take();
            assert_eq!(pool.idle(), 0);
        }
        assert_eq!(pool.idle(), 1);
    }
}
