//! Address resolution, peer identifiers, and client-side port binding.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use log::{trace, warn};

use super::socket::TransportOptions;

/// Ports below this need privilege to bind.
pub const PRIVILEGED_PORT_CEILING: u16 = 1024;

/// Address family of a transport endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddrFamily {
    /// IPv4.
    Inet,
    /// IPv6.
    Inet6,
    /// Unix-domain.
    Unix,
    /// Sockets-direct; treated as IPv4 for binding but preserved in
    /// identifiers.
    InetSdp,
}

impl AddrFamily {
    /// Parse the configured spelling.
    pub fn parse(s: &str) -> Option<AddrFamily> {
        match s {
            "inet" => Some(AddrFamily::Inet),
            "inet6" => Some(AddrFamily::Inet6),
            "unix" => Some(AddrFamily::Unix),
            "inet-sdp" => Some(AddrFamily::InetSdp),
            _ => None,
        }
    }

    /// Whether identifiers are `host:port` shaped.
    pub fn is_inet(&self) -> bool {
        !matches!(self, AddrFamily::Unix)
    }
}

/// A resolved remote endpoint.
#[derive(Clone, Debug)]
pub enum ResolvedAddr {
    /// An internet endpoint.
    Inet(SocketAddr),
    /// A unix-domain path.
    Unix(PathBuf),
}

impl ResolvedAddr {
    /// The peer identifier: `"<host>:<port>"` for inet families, the path
    /// for unix.
    pub fn identifier(&self) -> String {
        match self {
            ResolvedAddr::Inet(addr) => format!("{}:{}", addr.ip(), addr.port()),
            ResolvedAddr::Unix(path) => path.display().to_string(),
        }
    }
}

/// Decide the family for a client that did not configure one: a connect
/// path means unix, a remote host means inet.
pub fn guess_family(options: &TransportOptions) -> io::Result<AddrFamily> {
    if let Some(family) = options.address_family {
        return Ok(family);
    }
    if options.connect_path.is_some() {
        return Ok(AddrFamily::Unix);
    }
    if options.remote_host.is_some() {
        return Ok(AddrFamily::Inet);
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        "neither remote-host nor connect-path configured",
    ))
}

/// Resolve the remote endpoint a client should connect to.
pub fn client_remote_addr(options: &TransportOptions) -> io::Result<(ResolvedAddr, AddrFamily)> {
    let family = guess_family(options)?;
    match family {
        AddrFamily::Unix => {
            let path = options.connect_path.clone().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "connect-path not configured")
            })?;
            Ok((ResolvedAddr::Unix(path), family))
        }
        _ => {
            let host = options.remote_host.clone().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "remote-host not configured")
            })?;
            let port = options.remote_port.unwrap_or(super::socket::DEFAULT_REMOTE_PORT);
            let want_v6 = family == AddrFamily::Inet6;
            let addr = (host.as_str(), port)
                .to_socket_addrs()?
                .find(|a| a.is_ipv6() == want_v6)
                .or_else(|| {
                    // fall back to whatever resolution produced
                    (host.as_str(), port).to_socket_addrs().ok()?.next()
                })
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::AddrNotAvailable,
                        format!("no address found for {host}"),
                    )
                })?;
            Ok((ResolvedAddr::Inet(addr), family))
        }
    }
}

/// Read the system's reserved-port set; entries are skipped while walking
/// for a privileged port. Any parse trouble yields an empty set.
pub fn reserved_ports() -> [bool; PRIVILEGED_PORT_CEILING as usize] {
    let mut reserved = [false; PRIVILEGED_PORT_CEILING as usize];
    let raw = match std::fs::read_to_string("/proc/sys/net/ipv4/ip_local_reserved_ports") {
        Ok(raw) => raw,
        Err(_) => return reserved,
    };
    for entry in raw.trim().split(',').filter(|e| !e.is_empty()) {
        let (lo, hi) = match entry.split_once('-') {
            Some((lo, hi)) => (lo.trim().parse::<u16>(), hi.trim().parse::<u16>()),
            None => {
                let port = entry.trim().parse::<u16>();
                (port.clone(), port)
            }
        };
        if let (Ok(lo), Ok(hi)) = (lo, hi) {
            for port in lo..=hi.min(PRIVILEGED_PORT_CEILING - 1) {
                reserved[port as usize] = true;
            }
        }
    }
    reserved
}

pub(crate) fn sockaddr_storage_from(
    addr: &SocketAddr,
) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin as *const libc::sockaddr_in as *const u8,
                    &mut storage as *mut libc::sockaddr_storage as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in>(),
                );
            }
            (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin6 as *const libc::sockaddr_in6 as *const u8,
                    &mut storage as *mut libc::sockaddr_storage as *mut u8,
                    std::mem::size_of::<libc::sockaddr_in6>(),
                );
            }
            (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

pub(crate) fn sockaddr_un_from(path: &Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_os_str().as_bytes();
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "unix socket path too long",
        ));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes.iter()) {
        *dst = *src as libc::c_char;
    }
    let len = std::mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
    Ok((addr, len as libc::socklen_t))
}

fn try_bind_port(fd: RawFd, addr: &SocketAddr, port: u16) -> io::Result<()> {
    let mut with_port = *addr;
    with_port.set_port(port);
    let (storage, len) = sockaddr_storage_from(&with_port);
    let rc = unsafe {
        libc::bind(
            fd,
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )
    };
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Bind a client socket before connect.
///
/// Inet clients claim a privileged port by walking downward from 1023,
/// skipping the system's reserved set, stopping on success or a permission
/// error; relaxing the secure-port requirement uses an ephemeral port
/// instead. Unix clients bind to the configured path, if any.
pub fn client_bind(
    fd: RawFd,
    family: AddrFamily,
    local: &SocketAddr,
    options: &TransportOptions,
) -> io::Result<()> {
    match family {
        AddrFamily::Unix => {
            let Some(path) = options.bind_path.as_deref() else {
                trace!("bind-path not specified, letting connect assign one");
                return Ok(());
            };
            let (addr, len) = sockaddr_un_from(path)?;
            let rc = unsafe {
                libc::bind(fd, &addr as *const libc::sockaddr_un as *const libc::sockaddr, len)
            };
            if rc == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
        _ => {
            if options.bind_insecure {
                // ephemeral port; nothing to do
                return Ok(());
            }
            let reserved = reserved_ports();
            let mut port = PRIVILEGED_PORT_CEILING - 1;
            while port > 0 {
                if reserved[port as usize] {
                    port -= 1;
                    continue;
                }
                match try_bind_port(fd, local, port) {
                    Ok(()) => {
                        trace!("bound client to privileged port {port}");
                        return Ok(());
                    }
                    Err(err) if err.raw_os_error() == Some(libc::EACCES) => {
                        warn!("no privilege to bind below {PRIVILEGED_PORT_CEILING}: {err}");
                        return Err(err);
                    }
                    Err(_) => port -= 1,
                }
            }
            Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                "no privileged port available",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_options() -> TransportOptions {
        TransportOptions::default()
    }

    #[test]
    fn family_guessing() {
        let mut opts = base_options();
        assert!(guess_family(&opts).is_err());

        opts.remote_host = Some("127.0.0.1".to_owned());
        assert_eq!(guess_family(&opts).unwrap(), AddrFamily::Inet);

        opts.connect_path = Some("/tmp/sock".into());
        assert_eq!(guess_family(&opts).unwrap(), AddrFamily::Unix);

        opts.address_family = Some(AddrFamily::Inet6);
        assert_eq!(guess_family(&opts).unwrap(), AddrFamily::Inet6);
    }

    #[test]
    fn identifiers() {
        let inet = ResolvedAddr::Inet("10.0.0.5:24007".parse().unwrap());
        assert_eq!(inet.identifier(), "10.0.0.5:24007");

        let unix = ResolvedAddr::Unix("/run/stackfs.sock".into());
        assert_eq!(unix.identifier(), "/run/stackfs.sock");
    }

    #[test]
    fn resolve_loopback() {
        let mut opts = base_options();
        opts.remote_host = Some("127.0.0.1".to_owned());
        opts.remote_port = Some(9999);
        let (addr, family) = client_remote_addr(&opts).unwrap();
        assert_eq!(family, AddrFamily::Inet);
        assert_eq!(addr.identifier(), "127.0.0.1:9999");
    }
}
