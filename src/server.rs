//! A small rcon server for tests and local experiments.
//!
//! It checks the password on login and hands every other packet to a
//! handler, which decides what to send back.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use log::{error, info, trace};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};

use crate::{
    error::RconError,
    packet::{Packet, PacketType, AUTH_FAILURE_ID},
};

/// What the server does with a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Answer with one response packet per entry, all carrying the request id.
    Frames(Vec<String>),
    /// Never answer.
    Silent,
    /// Close the connection.
    Hangup,
}

impl Reply {
    pub fn text(body: impl Into<String>) -> Self {
        Reply::Frames(vec![body.into()])
    }
}

/// Answers every command with the command itself.
pub fn echo(command: &str) -> Reply {
    Reply::text(command)
}

type Handler = dyn Fn(&str) -> Reply + Send + Sync;

pub struct Server {
    addr: SocketAddr,
    accept_task: JoinHandle<()>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Server {
    /// Listen on `addr` (use port 0 for any free port). An empty password
    /// accepts commands without a login.
    pub async fn start<F>(addr: &str, password: &str, handler: F) -> Result<Server, RconError>
    where
        F: Fn(&str) -> Reply + Send + Sync + 'static,
    {
        Server::listen(addr, password, handler, false).await
    }

    /// Like [Server::start], but answers a login the way srcds does: an empty
    /// response value under the login id, then the auth response.
    pub async fn start_srcds<F>(addr: &str, password: &str, handler: F) -> Result<Server, RconError>
    where
        F: Fn(&str) -> Reply + Send + Sync + 'static,
    {
        Server::listen(addr, password, handler, true).await
    }

    async fn listen<F>(
        addr: &str,
        password: &str,
        handler: F,
        srcds_login: bool,
    ) -> Result<Server, RconError>
    where
        F: Fn(&str) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(RconError::BindError)?;
        let addr = listener.local_addr().map_err(RconError::BindError)?;

        let password: Arc<str> = Arc::from(password);
        let handler: Arc<Handler> = Arc::new(handler);
        let connections = Arc::new(Mutex::new(Vec::new()));
        let tracked = connections.clone();

        let accept_task = tokio::spawn(async move {
            info!("server running on {}", addr);
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let password = password.clone();
                        let handler = handler.clone();
                        let task = tokio::spawn(async move {
                            if let Err(err) = Server::process(stream, peer, &password, &*handler, srcds_login).await {
                                trace!("connection from {} ended: {}", peer, err);
                            }
                        });
                        let mut tracked = tracked.lock().unwrap_or_else(PoisonError::into_inner);
                        tracked.retain(|task: &JoinHandle<()>| !task.is_finished());
                        tracked.push(task);
                    }
                    Err(e) => error!("{:?}", e),
                }
            }
        });

        Ok(Server {
            addr,
            accept_task,
            connections,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Close every open connection, as if the server had restarted. New
    /// connections are still accepted.
    pub fn drop_connections(&self) {
        let mut connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for task in connections.drain(..) {
            task.abort();
        }
    }

    async fn process(
        mut stream: TcpStream,
        peer: SocketAddr,
        password: &str,
        handler: &Handler,
        srcds_login: bool,
    ) -> Result<(), RconError> {
        info!("accept from {:?}", peer);
        let mut authenticated = password.is_empty();

        loop {
            let packet = Packet::read_from(&mut stream).await?;
            trace!("receive packet id {} from {}", packet.id(), peer);

            let replies = match packet.packet_type() {
                PacketType::Login => {
                    authenticated = packet.body() == password.as_bytes();
                    let id = if authenticated { packet.id() } else { AUTH_FAILURE_ID };
                    let auth = Packet::new(id, PacketType::AUTH_RESPONSE, "");
                    if srcds_login {
                        vec![Packet::new(packet.id(), PacketType::Response, ""), auth]
                    } else {
                        vec![auth]
                    }
                }
                _ if !authenticated => vec![Packet::new(AUTH_FAILURE_ID, PacketType::Response, "")],
                _ => match handler(&*packet.body_text()) {
                    Reply::Frames(bodies) => bodies
                        .into_iter()
                        .map(|body| Packet::new(packet.id(), PacketType::Response, body))
                        .collect(),
                    Reply::Silent => Vec::new(),
                    Reply::Hangup => return Ok(()),
                },
            };

            // one write, so split answers arrive together
            let bytes: Vec<u8> = replies.iter().flat_map(Packet::pack).collect();
            if !bytes.is_empty() {
                stream
                    .write_all(&bytes)
                    .await
                    .map_err(RconError::SendError)?;
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.drop_connections();
    }
}
