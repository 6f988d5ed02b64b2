//! The stream to one server: opening it, logging in, and tearing it down.

use std::sync::Arc;

use log::{debug, trace};
use tokio::io::AsyncWriteExt;
use tokio::net::{tcp::OwnedWriteHalf, TcpStream};
use tokio::time::{sleep, timeout};

use crate::{
    config::{Endpoint, Settings},
    error::RconError,
    packet::{Packet, PacketType, AUTH_FAILURE_ID},
    reader::{poll_for, AnswerRegistry, ResponseReader},
};

/// Owns the socket, the task reading from it, the registry its answers go
/// to and the id counter. Callers must hold the client's write lock while
/// using it.
pub(crate) struct Connection {
    endpoint: Endpoint,
    settings: Settings,
    registry: Arc<AnswerRegistry>,
    reader: ResponseReader,
    writer: Option<OwnedWriteHalf>,
    ready: bool,
    next_packet_id: i32,
}

impl Connection {
    pub(crate) fn new(endpoint: Endpoint, settings: Settings) -> Self {
        Connection {
            endpoint,
            settings,
            registry: Arc::new(AnswerRegistry::new()),
            reader: ResponseReader::new(),
            writer: None,
            ready: false,
            next_packet_id: 0,
        }
    }

    /// Open the stream, start reading from it and log in if we have a
    /// password. On failure everything opened so far is released again.
    pub(crate) async fn connect(&mut self) -> Result<(), RconError> {
        let result = self.open().await;
        if result.is_err() {
            self.dispose_transport().await;
        }
        result
    }

    async fn open(&mut self) -> Result<(), RconError> {
        let host = self.endpoint.host.as_str();
        let port = self.endpoint.port;

        let stream = timeout(self.settings.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                RconError::UnreachableHost(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                ))
            })?
            .map_err(RconError::UnreachableHost)?;
        // small request packets, don't let Nagle hold them back
        if let Err(err) = stream.set_nodelay(true) {
            debug!("ignoring error while disabling nagle: {}", err);
        }

        trace!("opened tcp stream to {}:{}", host, port);

        // waiters on the previous stream keep its registry to themselves
        self.registry = Arc::new(AnswerRegistry::new());
        let (read_half, write_half) = stream.into_split();
        self.reader.bind(read_half, self.registry.clone());
        self.writer = Some(write_half);

        if !self.endpoint.password.is_empty() {
            trace!("attempting auth");
            self.authenticate().await?;
            trace!("auth complete");
        }

        self.ready = true;
        Ok(())
    }

    async fn authenticate(&mut self) -> Result<(), RconError> {
        let id = self.next_id();
        let login = Packet::new(id, PacketType::Login, self.endpoint.password.as_str());
        self.write(&login).await?;

        let registry = &self.registry;
        // a rejected login comes back under the failure id, not ours
        let answer = poll_for(self.settings.timeout, self.settings.poll_interval, || {
            registry
                .consume(AUTH_FAILURE_ID)
                .or_else(|| registry.consume(id))
        })
        .await;

        // srcds sends an empty response value before the auth response
        registry.forget(id);

        match answer {
            Some(answer) if answer.is_valid() => Ok(()),
            _ => Err(RconError::AuthenticationError),
        }
    }

    /// Reconnect if the last connect failed or the server hung up on us.
    pub(crate) async fn ensure_healthy(&mut self) -> Result<(), RconError> {
        if self.is_healthy() {
            return Ok(());
        }

        debug!(
            "connection to {}:{} lost, reconnecting",
            self.endpoint.host, self.endpoint.port
        );
        self.dispose_transport().await;
        sleep(self.settings.reconnect_delay).await;
        self.connect().await
    }

    /// Registry of the current stream. Requests written now get their
    /// answers there.
    pub(crate) fn registry(&self) -> Arc<AnswerRegistry> {
        self.registry.clone()
    }

    pub(crate) fn is_healthy(&self) -> bool {
        self.ready && self.writer.is_some() && self.reader.is_running()
    }

    /// Ids start at 1 and wrap back to 1; zero and negative ids are never used.
    pub(crate) fn next_id(&mut self) -> i32 {
        self.next_packet_id = match self.next_packet_id.checked_add(1) {
            Some(id) => id,
            None => 1,
        };
        self.next_packet_id
    }

    pub(crate) async fn write(&mut self, packet: &Packet) -> Result<(), RconError> {
        let writer = self.writer.as_mut().ok_or(RconError::NotConnected)?;
        trace!("sending packet id {} to server", packet.id());

        let result = async {
            writer.write_all(&packet.pack()).await?;
            writer.flush().await
        }
        .await;

        if let Err(err) = result {
            self.ready = false;
            return Err(RconError::SendError(err));
        }
        Ok(())
    }

    /// Stop the reader, then close the stream. Never fails; whatever can't be
    /// closed cleanly is dropped.
    pub(crate) async fn dispose_transport(&mut self) {
        self.ready = false;
        self.reader.stop();

        if let Some(mut writer) = self.writer.take() {
            if let Err(err) = writer.shutdown().await {
                debug!("ignoring error while closing stream: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;
    use crate::server::{echo, Server};

    fn quick_settings() -> Settings {
        Settings {
            timeout: Duration::from_millis(200),
            connect_timeout: Duration::from_secs(1),
            reconnect_delay: Duration::ZERO,
            ..Settings::default()
        }
    }

    #[test]
    fn ids_wrap_to_one() {
        let mut conn = Connection::new(
            Endpoint::new("127.0.0.1", 1, ""),
            Settings::default(),
        );
        assert_eq!(conn.next_id(), 1);
        assert_eq!(conn.next_id(), 2);

        conn.next_packet_id = i32::MAX;
        assert_eq!(conn.next_id(), 1);
    }

    #[tokio::test]
    async fn unreachable_host_is_connect_error() {
        // grab a free port, then close it again
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut conn = Connection::new(
            Endpoint::new("127.0.0.1", port, ""),
            quick_settings(),
        );
        let result = conn.connect().await;

        assert!(matches!(result, Err(RconError::UnreachableHost(_))));
        assert!(!conn.is_healthy());
    }

    #[tokio::test]
    async fn silent_login_is_auth_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // accept and hold the stream open without ever answering
        let held = tokio::spawn(async move { listener.accept().await });

        let mut conn = Connection::new(
            Endpoint::new("127.0.0.1", port, "secret"),
            quick_settings(),
        );
        let result = conn.connect().await;

        assert!(matches!(result, Err(RconError::AuthenticationError)));
        assert!(!conn.is_healthy());
        assert!(conn.writer.is_none());
        held.abort();
    }

    #[tokio::test]
    async fn write_without_stream_is_not_connected() {
        let mut conn = Connection::new(
            Endpoint::new("127.0.0.1", 1, ""),
            Settings::default(),
        );
        let packet = Packet::new(1, PacketType::Command, "list");
        assert!(matches!(
            conn.write(&packet).await,
            Err(RconError::NotConnected)
        ));

        // disposing twice is fine
        conn.dispose_transport().await;
        conn.dispose_transport().await;
    }

    #[tokio::test]
    async fn srcds_login_leaves_nothing_behind() {
        let server = Server::start_srcds("127.0.0.1:0", "secret", echo).await.unwrap();
        let mut conn = Connection::new(
            Endpoint::new("127.0.0.1", server.port(), "secret"),
            quick_settings(),
        );
        conn.connect().await.unwrap();
        let registry = conn.registry();

        // whichever of the two login answers came second must not linger
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.is_empty());
        assert!(conn.is_healthy());
    }

    #[tokio::test]
    async fn reconnect_keeps_old_registry_for_old_waiters() {
        let server = Server::start("127.0.0.1:0", "", echo).await.unwrap();
        let mut conn = Connection::new(
            Endpoint::new("127.0.0.1", server.port(), ""),
            quick_settings(),
        );
        conn.connect().await.unwrap();
        let old = conn.registry();
        let id = conn.next_id();
        conn.write(&Packet::new(id, PacketType::Command, "last words"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.drop_connections();
        tokio::time::sleep(Duration::from_millis(50)).await;
        conn.ensure_healthy().await.unwrap();

        assert!(!Arc::ptr_eq(&old, &conn.registry()));
        assert_eq!(old.consume(id).unwrap().body(), "last words");
    }
}
