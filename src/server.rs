//! TCP server for the console and WebSocket shells.
//!
//! One acceptor thread per listener, one worker thread per connection.
//! Workers are detached; they own their connection and clean up after
//! themselves. Stopping the server asks every live connection to shut down
//! through the registry.

use crate::config::Config;
use crate::handler::HandlerFactory;
use crate::runtime::{Connection, ConnectionRegistry, Mode, TcpTransport, Transport};
use crate::shell::ShellFactory;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Server instance
pub struct Server {
    config: Config,
    handle: ServerHandle,
}

impl Server {
    /// Create a new server instance running the built-in shell.
    pub fn new(config: Config) -> Self {
        let handle = ServerHandle::new(config.max_connections);
        Server { config, handle }
    }

    /// Bind the listeners and start accepting connections.
    pub fn bind(self) -> io::Result<RunningServer> {
        let factory = Arc::new(ShellFactory::new(
            self.handle.clone(),
            self.config.prompt.clone(),
        ));
        let ctx = Arc::new(AcceptContext {
            handle: self.handle.clone(),
            factory,
            read_size: self.config.read_buffer,
        });

        let mut listeners = vec![(create_listener(&self.config.console)?, Mode::Line)];
        if let Some(addr) = &self.config.websocket {
            listeners.push((create_listener(addr)?, Mode::WebSocket));
        }

        let mut addrs = Vec::with_capacity(listeners.len());
        let mut acceptors = Vec::with_capacity(listeners.len());
        for (listener, mode) in listeners {
            let addr = listener.local_addr()?;
            info!(
                address = %addr,
                ?mode,
                max_connections = self.handle.registry.capacity(),
                "Server listening"
            );
            addrs.push((addr, mode));
            self.handle.listening(addr);

            let ctx = Arc::clone(&ctx);
            let acceptor = thread::Builder::new()
                .name(format!("accept-{addr}"))
                .spawn(move || accept_loop(listener, mode, &ctx))?;
            acceptors.push(acceptor);
        }

        Ok(RunningServer {
            handle: self.handle,
            addrs,
            acceptors,
        })
    }
}

struct AcceptContext {
    handle: ServerHandle,
    factory: Arc<dyn HandlerFactory>,
    read_size: usize,
}

/// A server whose listeners are bound and accepting.
pub struct RunningServer {
    #[cfg_attr(not(test), allow(dead_code))]
    handle: ServerHandle,
    addrs: Vec<(SocketAddr, Mode)>,
    acceptors: Vec<JoinHandle<()>>,
}

impl RunningServer {
    #[cfg(test)]
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Bound address of the listener serving `mode`.
    pub fn local_addr(&self, mode: Mode) -> Option<SocketAddr> {
        self.addrs.iter().find(|(_, m)| *m == mode).map(|(a, _)| *a)
    }

    /// Block until every acceptor has exited (after [`ServerHandle::stop`]).
    pub fn wait(self) {
        for acceptor in self.acceptors {
            let _ = acceptor.join();
        }
    }
}

/// Cloneable handle for stopping a server from any thread, including a
/// connection's own worker.
#[derive(Clone)]
pub struct ServerHandle {
    stopping: Arc<AtomicBool>,
    registry: Arc<ConnectionRegistry>,
    addrs: Arc<Mutex<Vec<SocketAddr>>>,
}

impl ServerHandle {
    pub fn new(max_connections: usize) -> Self {
        Self {
            stopping: Arc::new(AtomicBool::new(false)),
            registry: Arc::new(ConnectionRegistry::new(max_connections)),
            addrs: Arc::default(),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    fn listening(&self, addr: SocketAddr) {
        self.addrs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(addr);
    }

    /// Stop accepting and shut down every live connection.
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        // Acceptors are blocked in accept(); poke each one awake.
        let addrs = self
            .addrs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for addr in addrs {
            let _ = TcpStream::connect(addr);
        }
        let closed = if self.registry.is_empty() {
            0
        } else {
            self.registry.close_all()
        };
        info!(connections = closed, "Server stopped");
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

fn accept_loop(listener: TcpListener, mode: Mode, ctx: &AcceptContext) {
    for stream in listener.incoming() {
        if ctx.handle.is_stopping() {
            break;
        }
        match stream {
            Ok(stream) => spawn_connection(stream, mode, ctx),
            Err(e) => error!(error = %e, "Failed to accept connection"),
        }
    }
    debug!(?mode, "Acceptor exiting");
}

fn spawn_connection(stream: TcpStream, mode: Mode, ctx: &AcceptContext) {
    let peer = stream.peer_addr().ok();
    let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new(stream));
    let handler = ctx.factory.create(mode);
    let registry = ctx.handle.registry();

    let Some(conn) = Connection::accept(registry, transport, mode, handler, ctx.read_size) else {
        warn!(peer = ?peer, "Connection limit reached");
        return;
    };

    let key = conn.key();
    // A stop that ran between accept() and registration has already swept
    // the registry; dropping the connection here tears it down.
    if ctx.handle.is_stopping() {
        debug!(conn = key, peer = ?peer, "Server stopping, dropping new connection");
        return;
    }
    debug!(conn = key, peer = ?peer, ?mode, active = registry.len(), "New connection");

    // On spawn failure the closure, and with it the connection, is dropped,
    // which tears it down and deregisters it.
    if let Err(e) = thread::Builder::new()
        .name(format!("conn-{key}"))
        .spawn(move || conn.run())
    {
        error!(conn = key, error = %e, "Failed to spawn connection thread");
    }
}

fn create_listener(addr: &str) -> io::Result<TcpListener> {
    let addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("no address for {addr}"))
    })?;

    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::websocket::frame::{apply_mask, encode_header, OP_TEXT};
    use crate::runtime::REPORT_HEADER;
    use std::io::{Read, Write};
    use std::time::{Duration, Instant};

    fn test_config() -> Config {
        Config {
            console: "127.0.0.1:0".to_string(),
            websocket: Some("127.0.0.1:0".to_string()),
            max_connections: 8,
            read_buffer: 64,
            prompt: "> ".to_string(),
            log_level: "info".to_string(),
        }
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }

    /// Read until `needle` shows up in what has been received.
    fn read_until(stream: &mut TcpStream, needle: &[u8]) -> Vec<u8> {
        let mut got = Vec::new();
        let mut buf = [0u8; 1024];
        while !got.windows(needle.len()).any(|w| w == needle) {
            let n = stream.read(&mut buf).unwrap();
            assert!(n > 0, "eof before {:?}", String::from_utf8_lossy(needle));
            got.extend_from_slice(&buf[..n]);
        }
        got
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_console_round_trip() {
        let server = Server::new(test_config());
        let registry = Arc::clone(server.handle.registry());
        let running = server.bind().unwrap();
        let addr = running.local_addr(Mode::Line).unwrap();

        let mut client = connect(addr);
        read_until(&mut client, b"> ");
        client.write_all(b"(cog-get-atoms 'ConceptNode)\n").unwrap();
        let got = read_until(&mut client, b"ConceptNode)\n> ");
        assert_eq!(got, b"(cog-get-atoms 'ConceptNode)\n> ");

        client.write_all(b"stats\r\n").unwrap();
        let got = read_until(&mut client, b"\n> ");
        assert!(String::from_utf8_lossy(&got).starts_with(REPORT_HEADER));

        client.write_all(b"quit\n").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
        wait_for(|| registry.is_empty());

        let handle = running.handle();
        handle.stop();
        running.wait();
        assert!(handle.is_stopping());
    }

    #[test]
    fn test_websocket_round_trip() {
        let running = Server::new(test_config()).bind().unwrap();
        let addr = running.local_addr(Mode::WebSocket).unwrap();

        let mut client = connect(addr);
        client
            .write_all(
                b"GET /shell HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\
                  Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 13\r\n\r\n",
            )
            .unwrap();
        let got = read_until(&mut client, b"\r\n\r\n");
        let text = String::from_utf8_lossy(&got);
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

        let key = [9, 8, 7, 6];
        let (header, len) = encode_header(OP_TEXT, 5);
        let mut frame = header[..len].to_vec();
        frame[1] |= 0x80;
        frame.extend_from_slice(&key);
        let mut body = b"hello".to_vec();
        apply_mask(&mut body, key);
        frame.extend_from_slice(&body);
        client.write_all(&frame).unwrap();

        let got = read_until(&mut client, b"hello\n");
        assert_eq!(got, [0x81, 6, b'h', b'e', b'l', b'l', b'o', b'\n']);

        let handle = running.handle();
        handle.stop();
        running.wait();
    }

    #[test]
    fn test_stop_closes_live_connections() {
        let server = Server::new(test_config());
        let registry = Arc::clone(server.handle.registry());
        let running = server.bind().unwrap();
        let addr = running.local_addr(Mode::Line).unwrap();

        let mut clients: Vec<_> = (0..3).map(|_| connect(addr)).collect();
        for client in &mut clients {
            read_until(client, b"> ");
        }
        wait_for(|| registry.len() == 3);

        let handle = running.handle();
        handle.stop();
        handle.stop();
        running.wait();

        for client in &mut clients {
            let mut buf = [0u8; 16];
            assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
        }
        wait_for(|| registry.is_empty());
    }

    #[test]
    fn test_connection_limit() {
        let mut config = test_config();
        config.max_connections = 1;
        config.websocket = None;
        let server = Server::new(config);
        let registry = Arc::clone(server.handle.registry());
        let running = server.bind().unwrap();
        assert!(running.local_addr(Mode::WebSocket).is_none());
        let addr = running.local_addr(Mode::Line).unwrap();

        let mut first = connect(addr);
        read_until(&mut first, b"> ");

        let mut second = connect(addr);
        let mut buf = [0u8; 16];
        assert_eq!(second.read(&mut buf).unwrap_or(0), 0);
        assert_eq!(registry.len(), 1);

        running.handle().stop();
        running.wait();
    }

    #[test]
    fn test_shutdown_command_stops_server() {
        let server = Server::new(test_config());
        let handle = server.handle.clone();
        let running = server.bind().unwrap();
        let addr = running.local_addr(Mode::Line).unwrap();

        let mut idle = connect(addr);
        read_until(&mut idle, b"> ");
        let mut admin = connect(addr);
        read_until(&mut admin, b"> ");
        wait_for(|| handle.registry().len() == 2);

        admin.write_all(b"shutdown
").unwrap();
        read_until(&mut admin, b"Shutting down\n");

        // Acceptors exit and every session, including the idle one, ends.
        running.wait();
        assert!(handle.is_stopping());
        let mut buf = [0u8; 16];
        assert_eq!(idle.read(&mut buf).unwrap_or(0), 0);
        wait_for(|| handle.registry().is_empty());
    }

    #[test]
    fn test_connection_accepted_during_stop_is_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = connect(listener.local_addr().unwrap());
        let (stream, _) = listener.accept().unwrap();

        let handle = ServerHandle::new(4);
        let ctx = AcceptContext {
            handle: handle.clone(),
            factory: Arc::new(ShellFactory::new(handle.clone(), "> ")),
            read_size: 64,
        };
        handle.stop();

        spawn_connection(stream, Mode::Line, &ctx);
        assert!(handle.registry().is_empty());
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
    }
}
