use err_derive::Error;
use log::{debug, error};
use socket2::{Domain, Socket, Type};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::mpsc::Sender;
use std::thread::JoinHandle;
use std::time::Duration;

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(display = "Communication error")]
    CommunicationError(#[error(source)] std::io::Error),

    #[error(display = "Failed to translate server address")]
    AddrResolutionError,

    #[error(display = "Not connected")]
    NotConnected,
}

/// What the read side of a connection reports back to the session driver.
#[derive(Debug)]
pub enum TransportEvent {
    /// A chunk of inbound bytes, with no frame alignment guarantees.
    Data(Vec<u8>),
    /// A read error.  The stream is torn down after this.
    Error(std::io::Error),
    /// Clean end of stream.
    End,
}

/// The byte-pipe collaborator.  The session only ever supplies a host/port
/// and whole outbound frames; suspension, addressing and teardown live here.
pub trait Transport {
    fn connect(&mut self, host: &str, port: u16) -> Result<()>;
    fn send(&mut self, frame: &[u8]) -> Result<()>;
    fn disconnect(&mut self);
}

/// TCP transport with a background read pump.  Inbound chunks, errors and
/// end-of-stream are forwarded over the channel given at construction; the
/// driver feeds them back into the session's handler entry points.
pub struct TcpTransport {
    events: Sender<TransportEvent>,
    stream: Option<TcpStream>,
    rx_thread: Option<JoinHandle<()>>,
    connect_timeout: Duration,
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

impl TcpTransport {
    pub fn new(events: Sender<TransportEvent>) -> TcpTransport {
        TcpTransport {
            events,
            stream: None,
            rx_thread: None,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    fn spawn_rx_thread(&mut self, stream: TcpStream) -> Result<()> {
        let events = self.events.clone();
        let conn = stream.try_clone()?;

        self.stream = Some(stream);
        self.rx_thread = Some(std::thread::spawn(move || {
            TcpTransport::pump(conn, events)
        }));
        Ok(())
    }

    fn pump(mut conn: TcpStream, events: Sender<TransportEvent>) {
        let mut buf = [0u8; 4096];
        loop {
            match conn.read(&mut buf) {
                Ok(0) => {
                    debug!("Transport reached end of stream");
                    let _ = events.send(TransportEvent::End);
                    break;
                }
                Ok(n) => {
                    if events.send(TransportEvent::Data(buf[..n].to_vec())).is_err() {
                        // Driver went away; nothing left to deliver to.
                        break;
                    }
                }
                Err(err) => {
                    let _ = events.send(TransportEvent::Error(err));
                    break;
                }
            }
        }
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        self.disconnect();

        let addr_iter = (host, port)
            .to_socket_addrs()
            .map_err(|_| Error::AddrResolutionError)?;

        let mut last_err = Error::AddrResolutionError;
        for addr in addr_iter {
            debug!("Trying {}", addr);
            match connect_to(addr, self.connect_timeout) {
                Ok(stream) => {
                    debug!("Success: {}", addr);
                    return self.spawn_rx_thread(stream);
                }
                Err(err) => {
                    debug!("Connection to {} failed: {}", addr, err);
                    last_err = err;
                }
            }
        }

        Err(last_err)
    }

    fn send(&mut self, frame: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        stream.write_all(frame)?;
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            debug!("Shutting down transport...");
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(rx_thread) = self.rx_thread.take() {
            if let Err(e) = rx_thread.join() {
                error!("Receiving thread panicked: {:?}", e);
            }
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Helper to create a TcpStream with a connect timeout
fn connect_to(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let socket = match addr {
        SocketAddr::V4(_) => Socket::new(Domain::ipv4(), Type::stream(), None)?,
        SocketAddr::V6(_) => {
            let s = Socket::new(Domain::ipv6(), Type::stream(), None)?;
            s.set_only_v6(false)?;
            s
        }
    };

    socket.set_keepalive(Some(timeout))?;
    socket.connect_timeout(&addr.into(), timeout)?;

    Ok(socket.into_tcp_stream())
}
