use std::io;
use std::net::*;
use std::time::Duration;

use super::ControlChannel;
use crate::error::{Error, Result};

/// Which side of a connection this process is.
///
/// The role fixes the order of any symmetric exchange over the control
/// channel: the client writes first and the server reads first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

fn connect_until_success(server_addr: SocketAddrV4, wait_on_failure: Duration) -> io::Result<TcpStream> {
    loop {
        match TcpStream::connect(server_addr) {
            Ok(stream) => break Ok(stream),
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                std::thread::sleep(wait_on_failure)
            }
            Err(e) => break Err(e),
        }
    }
}

/// Establishes the TCP control connection with one remote peer.
pub struct Connecter {
    role: Role,
    stream: TcpStream,
}

impl Connecter {
    /// The default TCP port to use.
    pub const DEFAULT_PORT: u16 = 13337;

    /// Connect with the specified remote peer on the given TCP port.
    ///
    /// If `with` is `None`, this is the server side and waits for one peer
    /// to connect. Otherwise this is the client side; it retries while the
    /// server is not listening yet.
    pub fn new_on_port(with: Option<Ipv4Addr>, port: u16) -> Result<Self> {
        let (role, stream) = if let Some(addr) = with {
            let server_addr = SocketAddrV4::new(addr, port);
            let stream = connect_until_success(server_addr, Duration::from_millis(200))
                .map_err(|source| Error::Io { op: "connect", source })?;
            (Role::Client, stream)
        } else {
            let inaddr_any = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
            let listener =
                TcpListener::bind(inaddr_any).map_err(|source| Error::Io { op: "listen", source })?;
            let (stream, peer) = listener
                .accept()
                .map_err(|source| Error::Io { op: "accept", source })?;
            log::debug!("accepted control connection from {}", peer);
            (Role::Server, stream)
        };

        stream
            .set_nodelay(true)
            .map_err(|source| Error::Io { op: "connect", source })?;
        Ok(Self { role, stream })
    }

    /// Connect with the specified remote peer on [`Self::DEFAULT_PORT`].
    pub fn new(with: Option<Ipv4Addr>) -> Result<Self> {
        Self::new_on_port(with, Self::DEFAULT_PORT)
    }

    /// Get the role of this side.
    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Take the role and the connected stream.
    pub fn into_parts(self) -> (Role, TcpStream) {
        (self.role, self.stream)
    }

    /// Take the role and a control channel over the connected stream.
    pub fn into_channel(self) -> (Role, ControlChannel) {
        (self.role, ControlChannel::from(self.stream))
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn roles_follow_direction() -> anyhow::Result<()> {
        let port = 23337;
        let server = thread::spawn(move || Connecter::new_on_port(None, port));
        let client = Connecter::new_on_port(Some(Ipv4Addr::LOCALHOST), port)?;
        let server = server.join().unwrap()?;

        assert_eq!(client.role(), Role::Client);
        assert_eq!(server.role(), Role::Server);

        let (_, mut c) = client.into_channel();
        let (_, mut s) = server.into_channel();
        c.write_all("hello", b"hi")?;
        let mut buf = [0u8; 2];
        s.read_exact("hello", &mut buf)?;
        assert_eq!(&buf, b"hi");
        Ok(())
    }
}
