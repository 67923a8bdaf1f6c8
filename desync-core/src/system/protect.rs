//! VPN protect handoff (Linux).
//!
//! On Android-style systems a privileged helper marks sockets so the VPN
//! tunnel does not route them. The handoff is a tiny blocking exchange
//! over a Unix-domain socket: one data byte carrying the connection's file
//! descriptor as `SCM_RIGHTS` ancillary payload, answered by a one-byte
//! ack. Both directions run under a one-second timeout, so a wedged helper
//! cannot stall connection setup for long.

#[cfg(target_os = "linux")]
use std::io::{self, Read};
#[cfg(target_os = "linux")]
use std::os::fd::{AsRawFd, RawFd};
#[cfg(target_os = "linux")]
use std::os::unix::net::UnixStream;
#[cfg(target_os = "linux")]
use std::time::Duration;

/// Hand `conn_fd` to the protect helper listening at `path`.
#[cfg(target_os = "linux")]
pub fn protect(conn_fd: RawFd, path: &str) -> io::Result<()> {
    let mut helper = match UnixStream::connect(path) {
        Ok(stream) => stream,
        Err(e) => {
            log::error!("Failed to connect to protect helper at {}: {}", path, e);
            return Err(e);
        }
    };
    helper.set_read_timeout(Some(Duration::from_secs(1)))?;
    helper.set_write_timeout(Some(Duration::from_secs(1)))?;

    send_fd(&helper, conn_fd)?;

    let mut ack = [0u8; 1];
    match helper.read(&mut ack) {
        Ok(n) if n >= 1 => Ok(()),
        Ok(_) => {
            log::error!("Protect helper closed without acking");
            Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "no ack from protect helper",
            ))
        }
        Err(e) => {
            log::error!("Failed to read protect ack: {}", e);
            Err(e)
        }
    }
}

/// One `sendmsg` carrying a single data byte plus the fd in a
/// `SCM_RIGHTS` control message.
#[cfg(target_os = "linux")]
fn send_fd(helper: &UnixStream, conn_fd: RawFd) -> io::Result<()> {
    let fd_size = std::mem::size_of::<RawFd>() as libc::c_uint;

    let mut data = [1u8];
    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };

    // Room for one cmsghdr plus an aligned fd.
    let mut cmsg_buf = [0u8; 64];
    let control_len = unsafe { libc::CMSG_SPACE(fd_size) } as usize;

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = control_len;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fd_size) as usize;
        std::ptr::copy_nonoverlapping(
            &conn_fd as *const RawFd as *const u8,
            libc::CMSG_DATA(cmsg),
            std::mem::size_of::<RawFd>(),
        );
    }

    let sent = unsafe { libc::sendmsg(helper.as_raw_fd(), &msg, 0) };
    if sent < 0 {
        let e = io::Error::last_os_error();
        log::error!("sendmsg to protect helper failed: {}", e);
        return Err(e);
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn protect(_conn_fd: std::os::fd::RawFd, path: &str) -> std::io::Result<()> {
    log::warn!("Socket protect requested ({}) but is Linux-only", path);
    Ok(())
}
