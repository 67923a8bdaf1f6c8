//! # Socket Control Module
//!
//! Thin wrappers over the per-socket OS knobs the desync engine needs:
//! the transport user-timeout armed while a mangled payload is in flight,
//! the abortive linger that turns a teardown into a visible RST, the IP
//! TTL / hop-limit override for fresh upstream sockets, and Nagle
//! disabling. Everything here is a single `setsockopt` away from the
//! kernel; tokio's setters are used where they exist and `libc` fills the
//! gaps.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;
use tokio::net::TcpStream;

use crate::config::Params;
use crate::system::protect;

#[cfg(unix)]
fn setsockopt_int(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Arm (or with `secs == 0` disarm) the transport-level user timeout:
/// give up when the peer acks nothing for this long.
///
/// Linux exposes `TCP_USER_TIMEOUT` (in milliseconds); platforms without
/// an equivalent report success and do nothing.
#[cfg(target_os = "linux")]
pub fn set_timeout(fd: RawFd, secs: u32) -> io::Result<()> {
    let millis = secs.saturating_mul(1000) as libc::c_int;
    match setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_USER_TIMEOUT, millis) {
        Ok(()) => Ok(()),
        Err(e) => {
            log::error!("setsockopt TCP_USER_TIMEOUT failed: {}", e);
            Err(e)
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_timeout(_fd: RawFd, _secs: u32) -> io::Result<()> {
    Ok(())
}

/// Make the next close abortive: the peer sees an RST instead of a
/// graceful EOF, signaling failure rather than a silently finished stream.
pub fn set_linger_abort(stream: &TcpStream) -> io::Result<()> {
    match stream.set_linger(Some(Duration::from_secs(0))) {
        Ok(()) => Ok(()),
        Err(e) => {
            log::error!("setsockopt SO_LINGER failed: {}", e);
            Err(e)
        }
    }
}

/// Override the IP TTL (IPv4) or unicast hop limit (IPv6) of a socket.
#[cfg(unix)]
pub fn set_ttl_raw(fd: RawFd, ttl: u8, v6: bool) -> io::Result<()> {
    if v6 {
        setsockopt_int(
            fd,
            libc::IPPROTO_IPV6,
            libc::IPV6_UNICAST_HOPS,
            ttl as libc::c_int,
        )
    } else {
        setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_TTL, ttl as libc::c_int)
    }
}

/// Disable Nagle's algorithm; failures are survivable and only logged.
pub fn optimize_socket(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        log::warn!("Failed to set TCP_NODELAY: {}", e);
    }
}

/// Per-socket preparation of a fresh upstream connection: optional TTL
/// override and optional handoff to the VPN protect helper.
pub fn socket_mod(params: &Params, stream: &TcpStream, dst: &SocketAddr) -> io::Result<()> {
    if params.custom_ttl {
        if let Err(e) = set_ttl_raw(stream.as_raw_fd(), params.def_ttl, dst.is_ipv6()) {
            log::error!("Failed to override TTL to {}: {}", params.def_ttl, e);
            return Err(e);
        }
    }
    if let Some(path) = &params.protect_path {
        return protect::protect(stream.as_raw_fd(), path);
    }
    Ok(())
}
