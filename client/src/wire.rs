//! Newline-framed request/response exchanges over TCP, every step bounded by
//! the operation timeout.

use crate::error::NetError;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub struct LineStream {
    reader: BufReader<TcpStream>,
    io_timeout: Duration,
}

impl LineStream {
    pub async fn connect(addr: SocketAddr, io_timeout: Duration) -> Result<Self, NetError> {
        let stream = timeout(io_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetError::Timeout("connection"))??;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream, io_timeout))
    }

    pub fn new(stream: TcpStream, io_timeout: Duration) -> Self {
        Self {
            reader: BufReader::new(stream),
            io_timeout,
        }
    }

    pub async fn write_line(&mut self, line: &str) -> Result<(), NetError> {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');

        timeout(self.io_timeout, self.reader.get_mut().write_all(&bytes))
            .await
            .map_err(|_| NetError::Timeout("write"))??;
        Ok(())
    }

    /// Next line without its terminator. EOF is `NetError::Closed`.
    pub async fn read_line(&mut self, waiting_for: &'static str) -> Result<String, NetError> {
        let mut line = String::new();
        let read = timeout(self.io_timeout, self.reader.read_line(&mut line))
            .await
            .map_err(|_| NetError::Timeout(waiting_for))??;

        if read == 0 {
            return Err(NetError::Closed);
        }
        Ok(line.trim_end_matches(|c| c == '\r' || c == '\n').to_string())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.reader.get_ref().peer_addr().ok()
    }

    /// The socket plus whatever was read past the last line.
    pub fn into_parts(self) -> (TcpStream, Vec<u8>) {
        let pending = self.reader.buffer().to_vec();
        (self.reader.into_inner(), pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_line_exchange_keeps_read_ahead() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let peer = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            tokio::io::AsyncReadExt::read_exact(&mut socket, &mut buf)
                .await
                .unwrap();
            assert_eq!(&buf, b"PING\n");
            socket.write_all(b"PONG\r\nEXTRA").await.unwrap();
            socket
        });

        let mut conn = LineStream::connect(addr, Duration::from_secs(1))
            .await
            .unwrap();
        conn.write_line("PING").await.unwrap();
        assert_eq!(conn.read_line("pong").await.unwrap(), "PONG");

        let _socket = peer.await.unwrap();
        let (mut stream, mut pending) = conn.into_parts();
        let mut rest = vec![0u8; 5 - pending.len()];
        tokio::io::AsyncReadExt::read_exact(&mut stream, &mut rest)
            .await
            .unwrap();
        pending.extend_from_slice(&rest);
        assert_eq!(pending, b"EXTRA");
    }

    #[tokio::test]
    async fn test_read_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _peer = tokio::spawn(async move { listener.accept().await.unwrap() });

        let mut conn = LineStream::connect(addr, Duration::from_millis(50))
            .await
            .unwrap();
        let err = conn.read_line("reply").await.unwrap_err();
        assert!(matches!(err, NetError::Timeout("reply")));
    }

    #[tokio::test]
    async fn test_eof_is_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let mut conn = LineStream::connect(addr, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(
            conn.read_line("reply").await,
            Err(NetError::Closed)
        ));
    }
}
