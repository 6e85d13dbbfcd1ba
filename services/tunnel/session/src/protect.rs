//! Socket protection for VPN mode.
//!
//! When the client runs underneath a VPN service on the same device, every
//! socket the transport creates has to be excluded from the VPN routing or the
//! tunnel would loop into itself. The host app does that on request: it
//! listens on a local Unix socket, receives the fd as `SCM_RIGHTS` ancillary
//! data, and answers with a single byte.
//!
//! Protection is best effort. A failed hand-off is logged and the socket is
//! used unprotected.

#[cfg(unix)]
pub use self::unix::UnixSocketProtector;

/// Native socket handle passed to a protector
#[cfg(unix)]
pub type RawSocket = std::os::fd::RawFd;
/// Native socket handle passed to a protector
#[cfg(windows)]
pub type RawSocket = std::os::windows::io::RawSocket;

/// Strategy run on every socket the transport creates
pub trait SocketProtector: Send + Sync {
    /// Protect `fd`; failures are handled inside and never abort the dial
    fn protect(&self, fd: RawSocket);
}

/// Protector that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProtector;

impl SocketProtector for NoopProtector {
    fn protect(&self, _fd: RawSocket) {}
}

#[cfg(unix)]
mod unix {
    use super::{RawSocket, SocketProtector};
    use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
    use std::io::{self, IoSlice, Read};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::path::PathBuf;
    use std::time::Duration;
    use tracing::{debug, warn};

    /// Send and receive timeout on the protect socket
    const PROTECT_TIMEOUT: Duration = Duration::from_secs(1);

    /// Hands each socket to a local protect service over a Unix socket
    #[derive(Debug, Clone)]
    pub struct UnixSocketProtector {
        path: PathBuf,
    }

    impl UnixSocketProtector {
        /// Create a protector talking to the service at `path`
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }

        /// Run the hand-off once, reporting the first failure
        pub(crate) fn try_protect(&self, fd: RawSocket) -> io::Result<()> {
            let mut sock = UnixStream::connect(&self.path)?;
            sock.set_read_timeout(Some(PROTECT_TIMEOUT))?;
            sock.set_write_timeout(Some(PROTECT_TIMEOUT))?;

            send_fd(&sock, fd)?;

            let mut ack = [0u8; 1];
            let n = sock.read(&mut ack)?;
            if n != 1 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "protect service closed without acknowledgement",
                ));
            }
            Ok(())
        }
    }

    impl SocketProtector for UnixSocketProtector {
        fn protect(&self, fd: RawSocket) {
            match self.try_protect(fd) {
                Ok(()) => debug!("Protected fd {}", fd),
                Err(e) => warn!("Failed to protect fd {}: {}", fd, e),
            }
        }
    }

    /// Send `fd` as `SCM_RIGHTS` along with a one-byte payload
    fn send_fd(sock: &UnixStream, fd: RawSocket) -> io::Result<()> {
        let payload = [b'!'];
        let iov = [IoSlice::new(&payload)];
        let fds = [fd];
        let cmsgs = [ControlMessage::ScmRights(&fds)];

        sendmsg::<()>(sock.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)?;
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use nix::sys::socket::{recvmsg, ControlMessageOwned};
        use std::io::{IoSliceMut, Write};
        use std::net::UdpSocket;
        use std::os::fd::{FromRawFd, RawFd};
        use std::os::unix::net::UnixListener;
        use std::time::{SystemTime, UNIX_EPOCH};

        fn socket_path(tag: &str) -> PathBuf {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .subsec_nanos();
            std::env::temp_dir().join(format!(
                "tunnel-protect-{}-{}-{}.sock",
                tag,
                std::process::id(),
                nanos
            ))
        }

        #[test]
        fn test_protect_acknowledged() {
            let path = socket_path("ack");
            let listener = UnixListener::bind(&path).unwrap();
            let server = std::thread::spawn(move || {
                let (mut conn, _) = listener.accept().unwrap();
                let mut byte = [0u8; 1];
                conn.read_exact(&mut byte).unwrap();
                conn.write_all(&[1]).unwrap();
                byte[0]
            });

            let target = UdpSocket::bind("127.0.0.1:0").unwrap();
            let protector = UnixSocketProtector::new(&path);
            protector.try_protect(target.as_raw_fd()).unwrap();

            assert_eq!(server.join().unwrap(), b'!');
            let _ = std::fs::remove_file(&path);
        }

        #[test]
        fn test_protect_passes_fd_as_scm_rights() {
            let path = socket_path("rights");
            let listener = UnixListener::bind(&path).unwrap();
            let server = std::thread::spawn(move || {
                let (mut conn, _) = listener.accept().unwrap();
                let mut byte = [0u8; 1];
                let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
                let fds: Vec<RawFd> = {
                    let mut iov = [IoSliceMut::new(&mut byte)];
                    let msg = recvmsg::<()>(
                        conn.as_raw_fd(),
                        &mut iov,
                        Some(&mut cmsg_buf),
                        MsgFlags::empty(),
                    )
                    .unwrap();
                    msg.cmsgs()
                        .flat_map(|cmsg| match cmsg {
                            ControlMessageOwned::ScmRights(fds) => fds,
                            _ => Vec::new(),
                        })
                        .collect()
                };
                assert_eq!(fds.len(), 1);

                // The received descriptor is a duplicate of the caller's socket
                let received = unsafe { UdpSocket::from_raw_fd(fds[0]) };
                let local = received.local_addr().unwrap();
                conn.write_all(&[1]).unwrap();
                (byte[0], local)
            });

            let target = UdpSocket::bind("127.0.0.1:0").unwrap();
            let protector = UnixSocketProtector::new(&path);
            protector.try_protect(target.as_raw_fd()).unwrap();

            let (payload, received_addr) = server.join().unwrap();
            assert_eq!(payload, b'!');
            assert_eq!(received_addr, target.local_addr().unwrap());
            let _ = std::fs::remove_file(&path);
        }

        #[test]
        fn test_protect_without_ack_fails() {
            let path = socket_path("noack");
            let listener = UnixListener::bind(&path).unwrap();
            let server = std::thread::spawn(move || {
                let (mut conn, _) = listener.accept().unwrap();
                let mut byte = [0u8; 1];
                conn.read_exact(&mut byte).unwrap();
            });

            let target = UdpSocket::bind("127.0.0.1:0").unwrap();
            let protector = UnixSocketProtector::new(&path);
            let err = protector.try_protect(target.as_raw_fd()).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

            server.join().unwrap();
            let _ = std::fs::remove_file(&path);
        }

        #[test]
        fn test_protect_missing_service_is_not_fatal() {
            let protector = UnixSocketProtector::new(socket_path("missing"));
            let target = UdpSocket::bind("127.0.0.1:0").unwrap();

            assert!(protector.try_protect(target.as_raw_fd()).is_err());
            // The public entry point swallows the failure
            protector.protect(target.as_raw_fd());
        }
    }
}
