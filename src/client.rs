use std::sync::Arc;

use log::{error, trace, warn};
use tokio::sync::Mutex;

use crate::{
    config::{Endpoint, Settings},
    connection::Connection,
    error::RconError,
    packet::{Packet, PacketType},
    reader::{AnswerRegistry, Response},
};

/// Asynchronous rcon client sharing one connection between all callers.
///
/// Writes are serialized under a lock; answers are read by a background task
/// and matched to requests by packet id, within the stream the request was
/// written to. The client reconnects and logs in again on its own whenever
/// the server drops the connection. Wrap it in an [Arc] to share it between
/// tasks.
///
/// Most servers handle one request at a time and answer in order. Requests
/// issued concurrently are written in call order, and each caller waits for
/// its own id, which is only correct as long as the server keeps that order.
///
/// ## Example
/// ```no_run
/// use rconlink::client::Client;
/// use rconlink::packet::PacketType;
/// use std::error::Error;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn Error>> {
///     let client = Client::connect("127.0.0.1", 25575, "<put rcon password here>").await?;
///     let response = client.command("list").await?;
///     println!("{}", response.body());
///
///     // legacy style: an empty string for "no answer" and for any failure
///     let text = client.send(PacketType::Command, "list").await;
///     println!("{}", text);
///     Ok(())
/// }
/// ```
pub struct Client {
    settings: Settings,
    // None until `configure` succeeds; the lock doubles as the write lock
    connection: Mutex<Option<Connection>>,
}

impl Client {
    pub fn new(settings: Settings) -> Self {
        Client {
            settings,
            connection: Mutex::new(None),
        }
    }

    /// Create a client with default settings and configure it.
    pub async fn connect(host: &str, port: u16, password: &str) -> Result<Self, RconError> {
        let client = Client::new(Settings::default());
        client.configure(host, port, password).await?;
        Ok(client)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Connect and log in. Does nothing if the client is already configured;
    /// call [Client::dispose] first to point it somewhere else. If connecting
    /// or logging in fails, the client stays unconfigured and this can be
    /// called again.
    pub async fn configure(&self, host: &str, port: u16, password: &str) -> Result<(), RconError> {
        self.configure_endpoint(Endpoint::new(host, port, password)).await
    }

    pub async fn configure_endpoint(&self, endpoint: Endpoint) -> Result<(), RconError> {
        let mut guard = self.connection.lock().await;
        if guard.is_some() {
            trace!("already configured, ignoring {:?}", endpoint);
            return Ok(());
        }

        let mut connection = Connection::new(endpoint, self.settings.clone());
        connection.connect().await?;
        *guard = Some(connection);
        Ok(())
    }

    pub async fn is_configured(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    /// Run a command and wait for its answer. In case of a response being
    /// split between multiple packets, the ones that arrived together are
    /// joined.
    pub async fn command(&self, command: &str) -> Result<Response, RconError> {
        self.request(PacketType::Command, command).await
    }

    /// Send a packet of any type and wait for the answer carrying its id.
    pub async fn request(&self, kind: PacketType, command: &str) -> Result<Response, RconError> {
        let (id, registry) = self.write_request(kind, command).await?;
        self.wait(id, &registry).await
    }

    /// Like [Client::request], but every failure turns into an empty string,
    /// so "the server said nothing" and "something broke" look the same.
    /// Failures are logged.
    pub async fn send(&self, kind: PacketType, command: &str) -> String {
        match self.request(kind, command).await {
            Ok(response) => response.into_body(),
            // timeouts were already logged by `wait`
            Err(RconError::NotConfigured | RconError::TimeoutError(_)) => String::new(),
            Err(err) => {
                error!("exception while sending: {}", err);
                String::new()
            }
        }
    }

    /// Send without waiting for the answer. The answer is still collected so
    /// the registry doesn't fill up: in the background if the server
    /// multiplexes, otherwise before this returns.
    pub async fn send_fire_and_forget(&self, kind: PacketType, command: &str) {
        let (id, registry) = match self.write_request(kind, command).await {
            Ok(written) => written,
            Err(RconError::NotConfigured) => return,
            Err(err) => {
                error!("exception while sending: {}", err);
                return;
            }
        };

        if self.settings.server_multiplexes {
            let settings = self.settings.clone();
            tokio::spawn(async move {
                let answer = registry
                    .wait_for(id, settings.timeout, settings.poll_interval)
                    .await;
                trace!("discarding answer to packet id {}: {:?}", id, answer.is_some());
            });
        } else {
            let _ = self.wait(id, &registry).await;
        }
    }

    /// Close the connection and forget the endpoint. Safe to call any number
    /// of times, and while requests are waiting: they keep polling the
    /// registry of the closed stream and time out, even if a new connection
    /// reuses their ids.
    pub async fn dispose(&self) {
        let mut guard = self.connection.lock().await;
        if let Some(mut connection) = guard.take() {
            connection.dispose_transport().await;
        }
    }

    /// The locked part of a request: reconnect if needed, pick an id, write.
    /// Returns the id and the registry its answer will be filed in.
    async fn write_request(
        &self,
        kind: PacketType,
        command: &str,
    ) -> Result<(i32, Arc<AnswerRegistry>), RconError> {
        let mut guard = self.connection.lock().await;
        let connection = guard.as_mut().ok_or(RconError::NotConfigured)?;

        connection.ensure_healthy().await?;
        let id = connection.next_id();
        connection.write(&Packet::new(id, kind, command)).await?;
        Ok((id, connection.registry()))
    }

    async fn wait(&self, id: i32, registry: &AnswerRegistry) -> Result<Response, RconError> {
        match registry
            .wait_for(id, self.settings.timeout, self.settings.poll_interval)
            .await
        {
            Some(response) => Ok(response),
            None => {
                warn!("no answer to packet id {} within {:?}", id, self.settings.timeout);
                Err(RconError::TimeoutError(self.settings.timeout))
            }
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Client::new(Settings::default())
    }
}
