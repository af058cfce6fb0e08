//! SO_REUSEPORT listener construction.

use std::net::{SocketAddr, TcpListener};

use socket2::{Domain, Socket, Type};

use crate::ServerError;

/// Build a blocking listener with SO_REUSEPORT set, so every worker thread can
/// bind the same address and the kernel spreads incoming connections across
/// them without a shared accept lock.
pub(crate) fn bind_reuseport(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)
        .map_err(ServerError::Bind)?;
    socket.set_reuse_address(true).map_err(ServerError::Bind)?;
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = socket.as_raw_fd();
        let value: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEPORT,
                &value as *const _ as *const libc::c_void,
                std::mem::size_of_val(&value) as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(ServerError::Bind(std::io::Error::last_os_error()));
        }
    }
    socket.bind(&addr.into()).map_err(ServerError::Bind)?;
    socket.listen(1024).map_err(ServerError::Bind)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_listeners_share_one_port() {
        let first = bind_reuseport(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        let addr = first.local_addr().unwrap();
        let second = bind_reuseport(addr).unwrap();
        assert_eq!(second.local_addr().unwrap().port(), addr.port());
    }
}
