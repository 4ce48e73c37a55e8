//! TCP and OpenSSH stream-local forwarding, plus the agent socket bridge.
//!
//! All callbacks approve unconditionally; the sandbox's network boundary is
//! the actual policy. Listener tasks belong to the connection that created
//! them and are torn down with it.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use russh::Channel;
use russh::server::Handle;
use russh::server::Msg;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Live forwarding listeners owned by one SSH connection.
#[derive(Default)]
pub(crate) struct ForwardTasks {
    tcp: HashMap<(String, u32), JoinHandle<()>>,
    unix: HashMap<String, JoinHandle<()>>,
    agents: Vec<JoinHandle<()>>,
}

impl ForwardTasks {
    /// Handles `tcpip-forward`: listen on the requested address and open a
    /// forwarded-tcpip channel back to the client for every connection.
    /// Port 0 is resolved to the bound port for the reply.
    pub async fn add_tcp(
        &mut self,
        address: &str,
        port: &mut u32,
        handle: Handle,
        sid: &str,
    ) -> anyhow::Result<bool> {
        let bind_address = if address.is_empty() { "0.0.0.0" } else { address };
        let listener = match TcpListener::bind((bind_address, *port as u16)).await {
            Ok(listener) => listener,
            Err(err) => {
                warn!(session = %sid, address = %bind_address, port = *port, error = %err, "tcpip-forward bind failed");
                return Ok(false);
            }
        };
        if *port == 0 {
            *port = listener.local_addr()?.port() as u32;
        }
        info!(session = %sid, address = %bind_address, port = *port, "tcpip-forward listening");

        let advertised_address = address.to_string();
        let advertised_port = *port;
        let sid = sid.to_string();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    break;
                };
                let channel = handle
                    .channel_open_forwarded_tcpip(
                        advertised_address.clone(),
                        advertised_port,
                        peer.ip().to_string(),
                        peer.port() as u32,
                    )
                    .await;
                match channel {
                    Ok(channel) => {
                        tokio::spawn(pump_tcp(channel, stream));
                    }
                    Err(_) => {
                        debug!(session = %sid, "client refused forwarded-tcpip channel");
                        break;
                    }
                }
            }
        });

        self.tcp
            .insert((advertised_key(address), advertised_port), task);
        Ok(true)
    }

    pub fn remove_tcp(&mut self, address: &str, port: u32) {
        if let Some(task) = self.tcp.remove(&(advertised_key(address), port)) {
            task.abort();
        }
    }

    /// Handles `streamlocal-forward@openssh.com` the same way, over a unix
    /// socket path.
    pub async fn add_unix(
        &mut self,
        socket_path: &Path,
        handle: Handle,
        sid: &str,
    ) -> anyhow::Result<bool> {
        // A stale socket file from a previous run would fail the bind.
        let _ = std::fs::remove_file(socket_path);
        let listener = match UnixListener::bind(socket_path) {
            Ok(listener) => listener,
            Err(err) => {
                warn!(session = %sid, path = %socket_path.display(), error = %err, "streamlocal-forward bind failed");
                return Ok(false);
            }
        };
        info!(session = %sid, path = %socket_path.display(), "streamlocal-forward listening");

        let advertised_path = socket_path.display().to_string();
        let task_path = advertised_path.clone();
        let sid = sid.to_string();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let channel = handle
                    .channel_open_forwarded_streamlocal(task_path.clone())
                    .await;
                match channel {
                    Ok(channel) => {
                        tokio::spawn(pump_unix(channel, stream));
                    }
                    Err(_) => {
                        debug!(session = %sid, "client refused forwarded-streamlocal channel");
                        break;
                    }
                }
            }
        });

        self.unix.insert(advertised_path, task);
        Ok(true)
    }

    pub fn remove_unix(&mut self, socket_path: &str) {
        if let Some(task) = self.unix.remove(socket_path) {
            task.abort();
        }
        let _ = std::fs::remove_file(socket_path);
    }

    pub fn abort_all(&mut self) {
        for task in self.tcp.values() {
            task.abort();
        }
        for task in self.unix.values() {
            task.abort();
        }
        for task in &self.agents {
            task.abort();
        }
        self.tcp.clear();
        self.unix.clear();
        self.agents.clear();
    }
}

/// `direct-tcpip`: the client asked us to dial out.
pub(crate) fn spawn_direct_tcpip(channel: Channel<Msg>, host: String, port: u16) {
    tokio::spawn(async move {
        match TcpStream::connect((host.as_str(), port)).await {
            Ok(stream) => pump_tcp(channel, stream).await,
            Err(err) => {
                debug!(host = %host, port, error = %err, "direct-tcpip connect failed");
            }
        }
    });
}

/// `direct-streamlocal@openssh.com`: dial a unix socket instead.
pub(crate) fn spawn_direct_streamlocal(channel: Channel<Msg>, path: PathBuf) {
    tokio::spawn(async move {
        match UnixStream::connect(&path).await {
            Ok(stream) => pump_unix(channel, stream).await,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "direct-streamlocal connect failed");
            }
        }
    });
}

impl ForwardTasks {
    /// Exposes the client's agent inside the sandbox: a unix listener whose
    /// accepted connections are bridged onto agent channels. Returns the
    /// socket path for `SSH_AUTH_SOCK`; the listener dies with the
    /// connection.
    pub fn add_agent(&mut self, handle: Handle, sid: &str) -> anyhow::Result<String> {
        let dir = std::env::temp_dir().join(format!("deck-agent-{sid}"));
        std::fs::create_dir_all(&dir)?;
        let socket_path = dir.join("agent.sock");
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)?;
        let exported = socket_path.display().to_string();

        let sid = sid.to_string();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                match handle.channel_open_agent().await {
                    Ok(channel) => {
                        tokio::spawn(pump_unix(channel, stream));
                    }
                    Err(_) => {
                        debug!(session = %sid, "client refused agent channel");
                        break;
                    }
                }
            }
        });
        self.agents.push(task);

        Ok(exported)
    }
}

async fn pump_tcp(channel: Channel<Msg>, mut stream: TcpStream) {
    let mut channel_stream = channel.into_stream();
    let _ = tokio::io::copy_bidirectional(&mut stream, &mut channel_stream).await;
}

async fn pump_unix(channel: Channel<Msg>, mut stream: UnixStream) {
    let mut channel_stream = channel.into_stream();
    let _ = tokio::io::copy_bidirectional(&mut stream, &mut channel_stream).await;
}

fn advertised_key(address: &str) -> String {
    if address.is_empty() {
        "0.0.0.0".to_string()
    } else {
        address.to_string()
    }
}
