//! Connection-level plumbing for the load client.
//!
//! Every connection the client dials is wrapped in a [`CountingStream`]
//! that adds transferred byte counts to a pair of shared atomic counters,
//! so throughput can be sampled without touching the HTTP layer. TLS is
//! layered on top of the counting wrapper, meaning the counters reflect
//! bytes on the wire. The [`Dialer`] also implements the optional SOCKS5
//! and environment-proxy paths and the transport-level timeouts.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use hyper::client::connect::{Connected, Connection};
use hyper::service::Service;
use hyper::Uri;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{sleep, Sleep};
use tokio_native_tls::{TlsConnector, TlsStream};
use tracing::debug;

/// Stream wrapper that counts transferred bytes and enforces per-operation
/// read/write deadlines.
///
/// Counts are only added for operations that succeed; a failed read or
/// write leaves the counters untouched. The counters are plain 64-bit
/// signed atomics shared across every connection of a run.
pub struct CountingStream<S> {
    inner: S,
    read_bytes: Arc<AtomicI64>,
    write_bytes: Arc<AtomicI64>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> CountingStream<S> {
    pub fn new(
        inner: S,
        read_bytes: Arc<AtomicI64>,
        write_bytes: Arc<AtomicI64>,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner,
            read_bytes,
            write_bytes,
            read_timeout,
            write_timeout,
            read_deadline: None,
            write_deadline: None,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CountingStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.read_deadline = None;
                let n = buf.filled().len() - before;
                this.read_bytes.fetch_add(n as i64, Ordering::Relaxed);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                this.read_deadline = None;
                Poll::Ready(Err(e))
            }
            Poll::Pending => {
                if let Some(timeout) = this.read_timeout {
                    let deadline = this
                        .read_deadline
                        .get_or_insert_with(|| Box::pin(sleep(timeout)));
                    if deadline.as_mut().poll(cx).is_ready() {
                        this.read_deadline = None;
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "read timed out",
                        )));
                    }
                }
                Poll::Pending
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CountingStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.write_deadline = None;
                this.write_bytes.fetch_add(n as i64, Ordering::Relaxed);
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => {
                this.write_deadline = None;
                Poll::Ready(Err(e))
            }
            Poll::Pending => {
                if let Some(timeout) = this.write_timeout {
                    let deadline = this
                        .write_deadline
                        .get_or_insert_with(|| Box::pin(sleep(timeout)));
                    if deadline.as_mut().poll(cx).is_ready() {
                        this.write_deadline = None;
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "write timed out",
                        )));
                    }
                }
                Poll::Pending
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// A dialed connection, TLS or plaintext, with byte accounting underneath.
pub enum LoadStream {
    Plain(CountingStream<TcpStream>),
    Tls(Box<TlsStream<CountingStream<TcpStream>>>),
}

impl AsyncRead for LoadStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            LoadStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            LoadStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for LoadStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            LoadStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            LoadStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            LoadStream::Plain(s) => Pin::new(s).poll_flush(cx),
            LoadStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            LoadStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            LoadStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

impl Connection for LoadStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// Single-host dialer used as the client's connector.
///
/// The destination URI hyper passes in is ignored; the dialer always
/// connects to the one configured target, optionally through a SOCKS5
/// proxy or an `HTTP(S)_PROXY` CONNECT tunnel.
#[derive(Clone)]
pub struct Dialer {
    inner: Arc<DialerInner>,
}

struct DialerInner {
    host: String,
    port: u16,
    tls: Option<TlsConnector>,
    socks5: Option<String>,
    dial_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    read_bytes: Arc<AtomicI64>,
    write_bytes: Arc<AtomicI64>,
}

impl Dialer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host: String,
        port: u16,
        tls: Option<TlsConnector>,
        socks5: Option<String>,
        dial_timeout: Option<Duration>,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
        read_bytes: Arc<AtomicI64>,
        write_bytes: Arc<AtomicI64>,
    ) -> Self {
        Self {
            inner: Arc::new(DialerInner {
                host,
                port,
                tls,
                socks5,
                dial_timeout,
                read_timeout,
                write_timeout,
                read_bytes,
                write_bytes,
            }),
        }
    }
}

impl Service<Uri> for Dialer {
    type Response = LoadStream;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = io::Result<LoadStream>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _dst: Uri) -> Self::Future {
        let inner = self.inner.clone();
        Box::pin(async move { inner.dial().await })
    }
}

impl DialerInner {
    fn addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    async fn dial(&self) -> io::Result<LoadStream> {
        let tcp = if let Some(proxy) = &self.socks5 {
            self.dial_socks5(proxy).await?
        } else if let Some(proxy) = self.env_proxy() {
            self.dial_connect_tunnel(&proxy).await?
        } else {
            self.dial_tcp(&self.addr()).await?
        };
        tcp.set_nodelay(true)?;

        let counted = CountingStream::new(
            tcp,
            self.read_bytes.clone(),
            self.write_bytes.clone(),
            self.read_timeout,
            self.write_timeout,
        );

        match &self.tls {
            Some(connector) => {
                let stream = connector
                    .connect(&self.host, counted)
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                Ok(LoadStream::Tls(Box::new(stream)))
            }
            None => Ok(LoadStream::Plain(counted)),
        }
    }

    async fn dial_tcp(&self, addr: &str) -> io::Result<TcpStream> {
        match self.dial_timeout {
            Some(t) => tokio::time::timeout(t, TcpStream::connect(addr))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))?,
            None => TcpStream::connect(addr).await,
        }
    }

    /// The proxy configured in the environment for this scheme, if any.
    fn env_proxy(&self) -> Option<String> {
        let names: [&str; 2] = if self.tls.is_some() {
            ["HTTPS_PROXY", "https_proxy"]
        } else {
            ["HTTP_PROXY", "http_proxy"]
        };
        for name in names {
            if let Ok(value) = std::env::var(name) {
                if !value.is_empty() {
                    return Some(value);
                }
            }
        }
        None
    }

    /// Tunnel through an HTTP proxy with a CONNECT request.
    async fn dial_connect_tunnel(&self, proxy: &str) -> io::Result<TcpStream> {
        let proxy_addr = proxy
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string();
        debug!(proxy = %proxy_addr, "dialing through HTTP proxy");

        let mut stream = self.dial_tcp(&proxy_addr).await?;
        let target = self.addr();
        let connect = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
        stream.write_all(connect.as_bytes()).await?;

        let mut head = Vec::with_capacity(256);
        let mut buf = [0u8; 256];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            if head.len() > 8192 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "proxy CONNECT response too large",
                ));
            }
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "proxy closed connection during CONNECT",
                ));
            }
            head.extend_from_slice(&buf[..n]);
        }

        let status_line = head.split(|&b| b == b'\r').next().unwrap_or(&[]);
        let status_line = String::from_utf8_lossy(status_line);
        let ok = status_line
            .split_whitespace()
            .nth(1)
            .map(|code| code.starts_with('2'))
            .unwrap_or(false);
        if !ok {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("proxy CONNECT failed: {}", status_line.trim()),
            ));
        }
        Ok(stream)
    }

    /// Connect through a SOCKS5 proxy (no authentication, domain ATYP).
    async fn dial_socks5(&self, proxy: &str) -> io::Result<TcpStream> {
        let proxy_addr = proxy.strip_prefix("socks5://").unwrap_or(proxy);
        debug!(proxy = %proxy_addr, "dialing through SOCKS5 proxy");

        let mut stream = self.dial_tcp(proxy_addr).await?;

        stream.write_all(&[0x05, 0x01, 0x00]).await?;
        let mut greeting = [0u8; 2];
        stream.read_exact(&mut greeting).await?;
        if greeting != [0x05, 0x00] {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "socks5 proxy rejected no-auth negotiation",
            ));
        }

        if self.host.len() > 255 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "socks5 target host name too long",
            ));
        }
        let mut request = vec![0x05, 0x01, 0x00, 0x03, self.host.len() as u8];
        request.extend_from_slice(self.host.as_bytes());
        request.extend_from_slice(&self.port.to_be_bytes());
        stream.write_all(&request).await?;

        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await?;
        if reply[1] != 0x00 {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("socks5 connect failed with code {}", reply[1]),
            ));
        }
        let bound_len = match reply[3] {
            0x01 => 4,
            0x04 => 16,
            0x03 => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                len[0] as usize
            }
            atyp => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("socks5 reply with unknown address type {}", atyp),
                ));
            }
        };
        let mut bound = vec![0u8; bound_len + 2];
        stream.read_exact(&mut bound).await?;

        Ok(stream)
    }
}
