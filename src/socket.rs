//! Raw socket plumbing shared by the accept operation and the demo harness.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Error;

/// Close-on-drop socket handle. Ownership transfers with `into_raw`.
#[derive(Debug)]
pub struct OwnedSocket {
    fd: RawFd,
}

impl OwnedSocket {
    /// Wrap an already-open descriptor.
    ///
    /// # Safety
    /// `fd` must be a valid, open socket that nothing else will close.
    pub unsafe fn from_raw(fd: RawFd) -> OwnedSocket {
        OwnedSocket { fd }
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd
    }

    /// Give up ownership; the caller becomes responsible for closing.
    pub fn into_raw(self) -> RawFd {
        let fd = self.fd;
        std::mem::forget(self);
        fd
    }
}

impl Drop for OwnedSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Slot an accept operation transfers the connected socket into.
pub type PeerSlot = Arc<Mutex<Option<OwnedSocket>>>;

/// Optional slot the peer's endpoint is copied out to.
pub type EndpointSlot = Arc<Mutex<Option<Endpoint>>>;

/// Socket address storage with an explicit length, as produced by the
/// platform's accept output buffer.
#[derive(Clone)]
pub struct Endpoint {
    storage: libc::sockaddr_storage,
    len: usize,
}

impl Endpoint {
    pub fn new() -> Endpoint {
        Endpoint {
            storage: unsafe { mem::zeroed() },
            len: 0,
        }
    }

    /// Largest address this storage can hold.
    pub const fn capacity() -> usize {
        mem::size_of::<libc::sockaddr_storage>()
    }

    /// Copy raw sockaddr bytes in. `bytes.len()` must not exceed `capacity`.
    pub fn assign(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= Self::capacity());
        let dst = &mut self.storage as *mut libc::sockaddr_storage as *mut u8;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        }
        self.len = bytes.len();
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Decode into a std address, if the stored family is one we speak.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self.storage.ss_family as libc::c_int {
            libc::AF_INET => {
                let sa = &self.storage as *const _ as *const libc::sockaddr_in;
                let (ip, port) = unsafe {
                    (
                        Ipv4Addr::from((*sa).sin_addr.s_addr.to_ne_bytes()),
                        u16::from_be((*sa).sin_port),
                    )
                };
                Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
            }
            libc::AF_INET6 => {
                let sa = &self.storage as *const _ as *const libc::sockaddr_in6;
                let (ip, port, flowinfo, scope) = unsafe {
                    (
                        Ipv6Addr::from((*sa).sin6_addr.s6_addr),
                        u16::from_be((*sa).sin6_port),
                        (*sa).sin6_flowinfo,
                        (*sa).sin6_scope_id,
                    )
                };
                Some(SocketAddr::V6(SocketAddrV6::new(ip, port, flowinfo, scope)))
            }
            _ => None,
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new()
    }
}

/// Open a non-blocking stream socket for the given address family.
pub fn stream_socket(family: libc::c_int) -> Result<OwnedSocket, Error> {
    let fd = unsafe {
        libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(unsafe { OwnedSocket::from_raw(fd) })
}

/// Address family of a bound socket.
pub fn socket_family(fd: RawFd) -> Result<libc::c_int, Error> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(storage.ss_family as libc::c_int)
}

/// Local address of a bound socket.
pub fn local_addr(fd: RawFd) -> Result<SocketAddr, Error> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    let mut endpoint = Endpoint::new();
    let bytes = unsafe {
        std::slice::from_raw_parts(&storage as *const _ as *const u8, len as usize)
    };
    endpoint.assign(bytes);
    endpoint
        .to_socket_addr()
        .ok_or_else(|| Error::Io(io::Error::other("unsupported address family")))
}

/// Create a bound, listening, non-blocking TCP socket with SO_REUSEADDR.
pub fn create_listener(addr: &str, backlog: i32) -> Result<OwnedSocket, Error> {
    let parsed: SocketAddr = addr
        .parse()
        .map_err(|e: std::net::AddrParseError| Error::ReactorSetup(format!("invalid address: {e}")))?;

    let domain = if parsed.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };

    let socket = stream_socket(domain)?;
    let fd = socket.as_raw();

    let optval: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let addr_len = match parsed {
        SocketAddr::V4(v4) => {
            let sa = &mut storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sa = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_addr.s6_addr = v6.ip().octets();
                (*sa).sin6_scope_id = v6.scope_id();
            }
            mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    };

    let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, addr_len) };
    if ret < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    let ret = unsafe { libc::listen(fd, backlog) };
    if ret < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_roundtrip_v4() {
        let mut storage: libc::sockaddr_in = unsafe { mem::zeroed() };
        storage.sin_family = libc::AF_INET as libc::sa_family_t;
        storage.sin_port = 8080u16.to_be();
        storage.sin_addr.s_addr = u32::from_ne_bytes([127, 0, 0, 1]);
        let bytes = unsafe {
            std::slice::from_raw_parts(
                &storage as *const _ as *const u8,
                mem::size_of::<libc::sockaddr_in>(),
            )
        };
        let mut endpoint = Endpoint::new();
        endpoint.assign(bytes);
        let addr = endpoint.to_socket_addr().unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse().unwrap());
    }

    #[test]
    fn test_endpoint_unknown_family() {
        let endpoint = Endpoint::new();
        assert!(endpoint.to_socket_addr().is_none());
        assert!(endpoint.is_empty());
    }

    #[test]
    fn test_listener_bind_and_query() {
        let listener = create_listener("127.0.0.1:0", 128).unwrap();
        let addr = local_addr(listener.as_raw()).unwrap();
        assert!(addr.port() > 0);
        assert_eq!(socket_family(listener.as_raw()).unwrap(), libc::AF_INET);
    }

    #[test]
    fn test_invalid_listen_addr() {
        assert!(matches!(
            create_listener("not-an-address", 1),
            Err(Error::ReactorSetup(_))
        ));
    }

    #[test]
    fn test_stream_socket_nonblocking() {
        let socket = stream_socket(libc::AF_INET).unwrap();
        let flags = unsafe { libc::fcntl(socket.as_raw(), libc::F_GETFL) };
        assert!(flags & libc::O_NONBLOCK != 0);
    }
}
