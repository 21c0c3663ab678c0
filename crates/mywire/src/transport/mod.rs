//! Async packet transport over TCP, a Unix socket or TLS.
//!
//! [`Transport`] owns the socket plus the framing state: the packet codec,
//! the optional compression envelope and the buffers between them. Bytes
//! are read in chunks and decoded; a compressed block that carries several
//! packets is inflated once and served from the inflated buffer before the
//! socket is touched again.

pub mod compress;
pub mod framing;

pub use compress::{CompressedCodec, MIN_COMPRESS_LENGTH};
pub use framing::PacketCodec;

use std::io;
use std::net::SocketAddr;

use asupersync::io::{AsyncRead, AsyncWrite, ReadBuf};
use asupersync::net::TcpStream;
#[cfg(unix)]
use asupersync::net::UnixStream;
use asupersync::time::{timeout, wall_now};
use mywire_core::{Error, InterfaceErrorKind, OperationalErrorKind, Result};

use crate::config::MySqlConfig;

const READ_CHUNK: usize = 8192;

enum Socket {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    #[cfg(feature = "tls")]
    Tls(Box<TlsSocket>),
    #[cfg(test)]
    Memory(testing::MemorySocket),
    Closed,
}

impl Socket {
    async fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(s) => read_some_from(s, buf).await,
            #[cfg(unix)]
            Socket::Unix(s) => read_some_from(s, buf).await,
            #[cfg(feature = "tls")]
            Socket::Tls(s) => s.read_plain(buf).await,
            #[cfg(test)]
            Socket::Memory(s) => Ok(s.read(buf)),
            Socket::Closed => Err(not_connected()),
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Socket::Tcp(s) => write_all_to(s, buf).await,
            #[cfg(unix)]
            Socket::Unix(s) => write_all_to(s, buf).await,
            #[cfg(feature = "tls")]
            Socket::Tls(s) => s.write_all(buf).await,
            #[cfg(test)]
            Socket::Memory(s) => {
                s.write(buf);
                Ok(())
            }
            Socket::Closed => Err(not_connected()),
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        match self {
            Socket::Tcp(s) => flush_stream(s).await,
            #[cfg(unix)]
            Socket::Unix(s) => flush_stream(s).await,
            #[cfg(feature = "tls")]
            Socket::Tls(s) => s.flush().await,
            #[cfg(test)]
            Socket::Memory(_) => Ok(()),
            Socket::Closed => Err(not_connected()),
        }
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed")
}

async fn read_some_from<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut [u8]) -> io::Result<usize> {
    let mut read_buf = ReadBuf::new(buf);
    std::future::poll_fn(|cx| std::pin::Pin::new(&mut *stream).poll_read(cx, &mut read_buf))
        .await?;
    Ok(read_buf.filled().len())
}

/// Read until `buf` is full or the source ends; returns the bytes read.
pub(crate) async fn read_full<S: AsyncRead + Unpin>(source: &mut S, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = read_some_from(source, &mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn write_all_to<S: AsyncWrite + Unpin>(stream: &mut S, buf: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        let n = std::future::poll_fn(|cx| {
            std::pin::Pin::new(&mut *stream).poll_write(cx, &buf[written..])
        })
        .await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "connection closed"));
        }
        written += n;
    }
    Ok(())
}

async fn flush_stream<S: AsyncWrite + Unpin>(stream: &mut S) -> io::Result<()> {
    std::future::poll_fn(|cx| std::pin::Pin::new(&mut *stream).poll_flush(cx)).await
}

#[cfg(feature = "tls")]
struct TlsSocket {
    tcp: TcpStream,
    tls: rustls::ClientConnection,
}

#[cfg(feature = "tls")]
impl TlsSocket {
    async fn handshake(mut tcp: TcpStream, config: &MySqlConfig) -> Result<Self> {
        use crate::tls::{build_client_config, server_name, tls_error};

        let client_config = build_client_config(&config.tls, config.ssl_mode)?;
        let name = server_name(&config.tls, &config.host)?;
        let mut tls = rustls::ClientConnection::new(std::sync::Arc::new(client_config), name)
            .map_err(|e| tls_error(format!("Failed to create TLS connection: {}", e)))?;

        while tls.is_handshaking() {
            while tls.wants_write() {
                let mut out = Vec::new();
                tls.write_tls(&mut out)
                    .map_err(|e| tls_error(format!("TLS handshake write error: {}", e)))?;
                if !out.is_empty() {
                    write_all_to(&mut tcp, &out).await?;
                }
            }
            flush_stream(&mut tcp).await?;

            if tls.wants_read() {
                let mut buf = [0u8; READ_CHUNK];
                let n = read_some_from(&mut tcp, &mut buf).await?;
                if n == 0 {
                    return Err(tls_error("Connection closed during TLS handshake"));
                }
                let mut cursor = io::Cursor::new(&buf[..n]);
                tls.read_tls(&mut cursor)
                    .map_err(|e| tls_error(format!("TLS handshake read error: {}", e)))?;
                tls.process_new_packets()
                    .map_err(|e| tls_error(format!("TLS handshake error: {}", e)))?;
            }
        }
        Ok(Self { tcp, tls })
    }

    async fn read_plain(&mut self, out: &mut [u8]) -> io::Result<usize> {
        use std::io::Read;
        loop {
            match self.tls.reader().read(out) {
                Ok(n) if n > 0 => return Ok(n),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            if !self.tls.wants_read() {
                return Ok(0);
            }

            let mut enc = [0u8; READ_CHUNK];
            let n = read_some_from(&mut self.tcp, &mut enc).await?;
            if n == 0 {
                return Ok(0);
            }
            let mut cursor = io::Cursor::new(&enc[..n]);
            self.tls.read_tls(&mut cursor)?;
            self.tls
                .process_new_packets()
                .map_err(|e| io::Error::other(format!("TLS error: {}", e)))?;
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        use std::io::Write;
        self.tls.writer().write_all(buf)?;
        self.flush().await
    }

    async fn flush(&mut self) -> io::Result<()> {
        use std::io::Write;
        self.tls.writer().flush()?;
        while self.tls.wants_write() {
            let mut out = Vec::new();
            self.tls.write_tls(&mut out)?;
            if !out.is_empty() {
                write_all_to(&mut self.tcp, &out).await?;
            }
        }
        flush_stream(&mut self.tcp).await
    }
}

/// Pick the address to dial: IPv4 first unless IPv6 is forced.
fn select_address(addrs: &[SocketAddr], force_ipv6: bool) -> Option<SocketAddr> {
    addrs
        .iter()
        .find(|a| a.is_ipv6() == force_ipv6)
        .or_else(|| addrs.first())
        .copied()
}

/// A framed, optionally compressed and encrypted connection to a server.
pub struct Transport {
    socket: Socket,
    codec: PacketCodec,
    compression: Option<CompressedCodec>,
    read_buf: Vec<u8>,
    inflated: Vec<u8>,
    address: String,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("address", &self.address)
            .field("open", &self.is_open())
            .field("compressed", &self.compression.is_some())
            .field("sequence", &self.codec.sequence())
            .finish_non_exhaustive()
    }
}

impl Transport {
    fn with_socket(socket: Socket, address: String) -> Self {
        Self {
            socket,
            codec: PacketCodec::new(),
            compression: None,
            read_buf: Vec::with_capacity(READ_CHUNK),
            inflated: Vec::new(),
            address,
        }
    }

    /// A transport with no socket; every I/O call fails.
    pub fn closed(address: impl Into<String>) -> Self {
        Self::with_socket(Socket::Closed, address.into())
    }

    /// Open a TCP or Unix socket connection.
    pub async fn open(config: &MySqlConfig) -> Result<Self> {
        let address = config.address();

        #[cfg(unix)]
        if let Some(path) = &config.unix_socket {
            let stream = match timeout(wall_now(), config.connect_timeout, UnixStream::connect(path)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    return Err(connect_error(
                        format!("Can't connect to local MySQL server through socket '{}'", address),
                        e,
                    )
                    .with_address(address));
                }
                Err(_) => return Err(timeout_error(&address, config.connect_timeout)),
            };
            tracing::debug!(address = %address, "connected over unix socket");
            return Ok(Self::with_socket(Socket::Unix(stream), address));
        }
        #[cfg(not(unix))]
        if config.unix_socket.is_some() {
            return Err(Error::NotSupported(
                "Unix sockets are not available on this platform".to_string(),
            ));
        }

        let addrs = asupersync::net::lookup_all((config.host.clone(), config.port))
            .await
            .map_err(|e| {
                connect_error(format!("Failed resolving {}", address), e)
                    .with_address(address.clone())
            })?;
        let socket_addr = select_address(&addrs, config.force_ipv6).ok_or_else(|| {
            Error::operational(
                OperationalErrorKind::Connect,
                format!("No addresses found for {}", address),
            )
            .with_address(address.clone())
        })?;

        let stream = TcpStream::connect_timeout(socket_addr, config.connect_timeout)
            .await
            .map_err(|e| {
                connect_error(format!("Can't connect to MySQL server on {}", address), e)
                    .with_address(address.clone())
            })?;
        stream.set_nodelay(true).ok();
        tracing::debug!(address = %address, resolved = %socket_addr, "connected over tcp");
        Ok(Self::with_socket(Socket::Tcp(stream), address))
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.socket, Socket::Closed)
    }

    pub fn is_unix_socket(&self) -> bool {
        #[cfg(unix)]
        if matches!(self.socket, Socket::Unix(_)) {
            return true;
        }
        false
    }

    pub fn is_tls(&self) -> bool {
        #[cfg(feature = "tls")]
        if matches!(self.socket, Socket::Tls(_)) {
            return true;
        }
        false
    }

    pub fn is_compressed(&self) -> bool {
        self.compression.is_some()
    }

    pub fn sequence(&self) -> u8 {
        self.codec.sequence()
    }

    /// Start a new command exchange: both sequence counters go back to 0.
    pub fn reset_sequence(&mut self) {
        self.codec.reset_sequence();
        if let Some(compression) = &mut self.compression {
            compression.reset_sequence();
        }
    }

    /// Wrap all further traffic in the compressed envelope.
    ///
    /// Sequence checks move to the envelope; servers number the inner
    /// packets inconsistently once compression is on.
    pub fn enable_compression(&mut self) {
        self.codec.set_lenient(true);
        self.compression = Some(CompressedCodec::new());
        tracing::debug!(address = %self.address, "compression enabled");
    }

    /// Frame `payload`, write it and wait until it is flushed.
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let mut framed = Vec::with_capacity(payload.len() + 4);
        self.codec.encode(payload, &mut framed);
        let wire = match &mut self.compression {
            None => framed,
            Some(compression) => {
                let mut out = Vec::with_capacity(framed.len() + 7);
                compression.encode(&framed, &mut out)?;
                out
            }
        };
        tracing::trace!(len = payload.len(), wire = wire.len(), "sending packet");
        self.socket
            .write_all(&wire)
            .await
            .map_err(|e| Error::from(e).with_address(self.address.clone()))?;
        self.drain().await
    }

    /// Wait until everything written so far has reached the socket.
    pub async fn drain(&mut self) -> Result<()> {
        self.socket
            .flush()
            .await
            .map_err(|e| Error::from(e).with_address(self.address.clone()))
    }

    /// Receive one logical packet payload.
    pub async fn recv(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(packet) = self.try_decode()? {
                return Ok(packet);
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self
                .socket
                .read_some(&mut chunk)
                .await
                .map_err(|e| Error::from(e).with_address(self.address.clone()))?;
            if n == 0 {
                return Err(self.eof_error());
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn try_decode(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(compression) = &mut self.compression else {
            return self.codec.decode(&mut self.read_buf);
        };
        loop {
            if let Some(packet) = self.codec.decode(&mut self.inflated)? {
                return Ok(Some(packet));
            }
            match compression.decode(&mut self.read_buf)? {
                Some(body) => self.inflated.extend_from_slice(&body),
                None => return Ok(None),
            }
        }
    }

    fn eof_error(&self) -> Error {
        if self.read_buf.is_empty() && self.inflated.is_empty() {
            Error::operational(
                OperationalErrorKind::Disconnected,
                "Lost connection to MySQL server during query",
            )
            .with_address(self.address.clone())
        } else {
            Error::interface(
                InterfaceErrorKind::Framing,
                format!(
                    "Connection to {} closed in the middle of a packet",
                    self.address
                ),
            )
        }
    }

    /// Upgrade the TCP socket to TLS in place.
    #[cfg(feature = "tls")]
    pub async fn switch_to_tls(&mut self, config: &MySqlConfig) -> Result<()> {
        match std::mem::replace(&mut self.socket, Socket::Closed) {
            Socket::Tcp(tcp) => {
                let tls = TlsSocket::handshake(tcp, config).await?;
                tracing::debug!(
                    address = %self.address,
                    version = ?tls.tls.protocol_version(),
                    "TLS established"
                );
                self.socket = Socket::Tls(Box::new(tls));
                Ok(())
            }
            other => {
                self.socket = other;
                Err(crate::tls::tls_error("TLS is only available on TCP connections"))
            }
        }
    }

    #[cfg(not(feature = "tls"))]
    pub async fn switch_to_tls(&mut self, _config: &MySqlConfig) -> Result<()> {
        Err(Error::NotSupported(
            "TLS requested but mywire was built without the 'tls' feature".to_string(),
        ))
    }

    /// Drop the socket and any buffered bytes.
    pub fn close(&mut self) {
        self.socket = Socket::Closed;
        self.read_buf.clear();
        self.inflated.clear();
        self.compression = None;
        self.codec = PacketCodec::new();
    }
}

/// The connect (or handshake) did not finish within `limit`.
pub(crate) fn timeout_error(address: &str, limit: std::time::Duration) -> Error {
    Error::operational(
        OperationalErrorKind::Timeout,
        format!("Can't connect to MySQL server on {} (timed out after {:?})", address, limit),
    )
    .with_address(address)
}

fn connect_error(message: String, e: io::Error) -> Error {
    let kind = if e.kind() == io::ErrorKind::TimedOut {
        OperationalErrorKind::Timeout
    } else {
        OperationalErrorKind::Connect
    };
    Error::Operational(mywire_core::OperationalError {
        kind,
        message: format!("{} ({})", message, e),
        address: None,
        source: Some(Box::new(e)),
    })
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory socket for driving the connection from scripted server bytes.

    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::{PacketCodec, Socket, Transport};

    pub(crate) struct MemorySocket {
        incoming: VecDeque<u8>,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl MemorySocket {
        pub(crate) fn read(&mut self, buf: &mut [u8]) -> usize {
            let n = buf.len().min(self.incoming.len());
            for (slot, byte) in buf.iter_mut().zip(self.incoming.drain(..n)) {
                *slot = byte;
            }
            n
        }

        pub(crate) fn write(&mut self, buf: &[u8]) {
            if let Ok(mut written) = self.written.lock() {
                written.extend_from_slice(buf);
            }
        }
    }

    /// Server-side script: frames payloads with explicit sequence ids.
    #[derive(Default)]
    pub(crate) struct Script {
        bytes: Vec<u8>,
    }

    impl Script {
        pub(crate) fn packet(mut self, sequence: u8, payload: &[u8]) -> Self {
            let mut codec = PacketCodec::new();
            codec.set_sequence(sequence);
            codec.encode(payload, &mut self.bytes);
            self
        }

        pub(crate) fn raw(mut self, bytes: &[u8]) -> Self {
            self.bytes.extend_from_slice(bytes);
            self
        }

        pub(crate) fn into_bytes(self) -> Vec<u8> {
            self.bytes
        }
    }

    impl Transport {
        /// Transport reading `incoming`; the returned buffer collects writes.
        pub(crate) fn memory(incoming: Vec<u8>) -> (Self, Arc<Mutex<Vec<u8>>>) {
            let written = Arc::new(Mutex::new(Vec::new()));
            let socket = MemorySocket {
                incoming: incoming.into(),
                written: Arc::clone(&written),
            };
            (
                Self::with_socket(Socket::Memory(socket), "memory".to_string()),
                written,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::Script;
    use super::*;
    use asupersync::runtime::RuntimeBuilder;

    #[test]
    fn address_selection_prefers_ipv4() {
        let v6: SocketAddr = "[::1]:3306".parse().unwrap();
        let v4: SocketAddr = "127.0.0.1:3306".parse().unwrap();
        assert_eq!(select_address(&[v6, v4], false), Some(v4));
        assert_eq!(select_address(&[v6, v4], true), Some(v6));
        assert_eq!(select_address(&[v4], true), Some(v4));
        assert_eq!(select_address(&[], false), None);
    }

    #[test]
    fn send_frames_with_sequence() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let (mut transport, written) = Transport::memory(Vec::new());
            transport.send(b"\x0e").await.unwrap();
            transport.send(b"\x0e").await.unwrap();
            transport.reset_sequence();
            transport.send(b"\x01").await.unwrap();
            assert_eq!(
                *written.lock().unwrap(),
                vec![1, 0, 0, 0, 0x0e, 1, 0, 0, 1, 0x0e, 1, 0, 0, 0, 0x01]
            );
        });
    }

    #[test]
    fn recv_reads_packets_in_order() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let script = Script::default().packet(1, b"first").packet(2, b"second");
            let (mut transport, _) = Transport::memory(script.into_bytes());
            transport.send(b"\x03SELECT").await.unwrap();
            assert_eq!(transport.recv().await.unwrap(), b"first");
            assert_eq!(transport.recv().await.unwrap(), b"second");

            let err = transport.recv().await.unwrap_err();
            assert!(matches!(err, Error::Operational(_)));
        });
    }

    #[test]
    fn truncated_packet_is_framing_error() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let script = Script::default().raw(&[10, 0, 0, 0, b'a', b'b']);
            let (mut transport, _) = Transport::memory(script.into_bytes());
            match transport.recv().await {
                Err(Error::Interface(e)) => assert_eq!(e.kind, InterfaceErrorKind::Framing),
                other => panic!("expected framing error, got {other:?}"),
            }
        });
    }

    #[test]
    fn compressed_block_with_several_packets() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let mut inner = Vec::new();
            let mut codec = PacketCodec::new();
            codec.set_sequence(1);
            codec.encode(&[b'x'; 40], &mut inner);
            codec.encode(&[b'y'; 40], &mut inner);
            let mut wire = Vec::new();
            let mut server = CompressedCodec::new();
            server.set_sequence(1);
            server.encode(&inner, &mut wire).unwrap();

            let (mut transport, written) = Transport::memory(wire);
            transport.enable_compression();
            transport.send(b"\x03SELECT 1").await.unwrap();
            assert_eq!(transport.recv().await.unwrap(), vec![b'x'; 40]);
            assert_eq!(transport.recv().await.unwrap(), vec![b'y'; 40]);

            // 13 framed bytes: sent stored, compressed length 0
            let sent = written.lock().unwrap().clone();
            assert_eq!(&sent[..7], &[13, 0, 0, 0, 0, 0, 0]);
        });
    }

    #[test]
    fn compressed_envelope_out_of_order_is_desync() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let mut inner = Vec::new();
            let mut codec = PacketCodec::new();
            codec.set_sequence(1);
            codec.encode(b"reply", &mut inner);
            let mut wire = Vec::new();
            let mut server = CompressedCodec::new();
            // one envelope went missing
            server.set_sequence(2);
            server.encode(&inner, &mut wire).unwrap();

            let (mut transport, _) = Transport::memory(wire);
            transport.enable_compression();
            transport.send(b"\x0e").await.unwrap();
            match transport.recv().await {
                Err(Error::Interface(e)) => assert_eq!(e.kind, InterfaceErrorKind::Desync),
                other => panic!("expected desync, got {other:?}"),
            }
        });
    }

    #[test]
    fn closed_transport_fails() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let mut transport = Transport::closed("db:3306");
            assert!(!transport.is_open());
            let err = transport.send(b"\x0e").await.unwrap_err();
            assert!(err.is_connection_error());
        });
    }
}
