//! SSH front-end: interactive PTY sessions, non-PTY exec, SFTP and port
//! forwarding, all inside the sandbox's trust boundary.

mod exec;
mod forward;
mod sftp;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use russh::Channel;
use russh::ChannelId;
use russh::CryptoVec;
use russh::Pty;
use russh::Sig;
use russh::keys::Algorithm;
use russh::keys::PrivateKey;
use russh::server::Auth;
use russh::server::Handler;
use russh::server::Msg;
use russh::server::Server;
use russh::server::Session;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use deck_core::pty::TtyOptions;
use deck_core::pty::TtySize;
use deck_core::pty::spawn_tty;

use crate::session_id::generate_session_id;
use forward::ForwardTasks;

/// Fixed sandbox password; the network boundary is the real gate.
const SANDBOX_PASSWORD: &str = "sandbox-ssh";

const AUTH_REJECTION_TIME: Duration = Duration::from_secs(1);

pub struct SshServer {
    work_dir: PathBuf,
    default_work_dir: PathBuf,
}

impl SshServer {
    pub fn new(work_dir: PathBuf, default_work_dir: PathBuf) -> Self {
        Self {
            work_dir,
            default_work_dir,
        }
    }

    /// Accepts SSH connections until the listener fails.
    pub async fn serve(mut self, port: u16) -> anyhow::Result<()> {
        let key = PrivateKey::random(
            &mut russh::keys::ssh_key::rand_core::OsRng,
            Algorithm::Ed25519,
        )?;
        let config = Arc::new(russh::server::Config {
            auth_rejection_time: AUTH_REJECTION_TIME,
            keys: vec![key],
            ..Default::default()
        });
        info!(port, "ssh server listening");
        self.run_on_address(config, ("0.0.0.0", port)).await?;
        Ok(())
    }
}

impl Server for SshServer {
    type Handler = SshHandler;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> SshHandler {
        let sid = generate_session_id();
        info!(session = %sid, peer = ?peer, "new ssh connection");
        SshHandler {
            sid,
            work_dir: self.work_dir.clone(),
            default_work_dir: self.default_work_dir.clone(),
            channels: HashMap::new(),
            forwards: ForwardTasks::default(),
        }
    }
}

/// Per-channel session state, built up by the request callbacks until shell
/// or exec starts the actual work.
#[derive(Default)]
struct SessionChannel {
    /// Held until a subsystem (sftp) claims the raw channel.
    channel: Option<Channel<Msg>>,
    pty: Option<PtyParams>,
    env: Vec<(String, String)>,
    input_tx: Option<mpsc::Sender<Vec<u8>>>,
    resize_tx: Option<mpsc::Sender<TtySize>>,
    cancel: Option<CancellationToken>,
    child_pid: Arc<StdMutex<Option<Pid>>>,
    agent_requested: bool,
}

struct PtyParams {
    term: String,
    rows: u16,
    cols: u16,
}

pub struct SshHandler {
    sid: String,
    work_dir: PathBuf,
    default_work_dir: PathBuf,
    channels: HashMap<ChannelId, SessionChannel>,
    forwards: ForwardTasks,
}

impl SshHandler {
    fn resolved_work_dir(&self) -> PathBuf {
        if self.work_dir.exists() {
            self.work_dir.clone()
        } else {
            self.default_work_dir.clone()
        }
    }

    fn state(&mut self, channel: ChannelId) -> &mut SessionChannel {
        self.channels.entry(channel).or_default()
    }

    /// Sets up agent forwarding when the client asked for it: a local unix
    /// listener whose connections are bridged onto agent channels, exported
    /// to the child as `SSH_AUTH_SOCK`.
    fn maybe_forward_agent(&mut self, channel: ChannelId, session: &mut Session) {
        let state = self.state(channel);
        if !state.agent_requested {
            return;
        }
        match self.forwards.add_agent(session.handle(), &self.sid) {
            Ok(socket_path) => {
                let state = self.state(channel);
                state
                    .env
                    .push(("SSH_AUTH_SOCK".to_string(), socket_path));
            }
            Err(err) => {
                warn!(session = %self.sid, error = %err, "failed to set up agent forwarding");
            }
        }
    }

    fn start_pty_session(&mut self, channel_id: ChannelId, session: &mut Session) {
        let sid = self.sid.clone();
        let work_dir = self.resolved_work_dir();
        let state = self.state(channel_id);

        // Only the sftp subsystem consumes the raw channel object.
        state.channel.take();

        let Some(pty) = state.pty.as_ref() else {
            return;
        };
        let term = pty.term.clone();
        let initial_size = TtySize {
            rows: pty.rows,
            cols: pty.cols,
        };

        let (input_tx, input_rx) = mpsc::channel::<Vec<u8>>(64);
        let (output_tx, mut output_rx) = mpsc::channel::<Vec<u8>>(64);
        // One slot: older resize events are dropped so the session stays
        // responsive under a resize storm.
        let (resize_tx, resize_rx) = mpsc::channel::<TtySize>(1);
        let cancel = CancellationToken::new();
        let _ = resize_tx.try_send(initial_size);

        state.input_tx = Some(input_tx);
        state.resize_tx = Some(resize_tx);
        state.cancel = Some(cancel.clone());
        let env = state.env.clone();

        let handle = session.handle();
        let output_handle = handle.clone();
        let output_task = tokio::spawn(async move {
            while let Some(chunk) = output_rx.recv().await {
                if output_handle
                    .data(channel_id, CryptoVec::from_slice(&chunk))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let result = spawn_tty(TtyOptions {
                session_id: sid.clone(),
                work_dir: Some(work_dir),
                term,
                env,
                input: input_rx,
                output: output_tx,
                resize: resize_rx,
                cancel,
            })
            .await;
            if let Err(err) = &result {
                debug!(session = %sid, error = %err, "pty session ended with message");
            }

            // Drain buffered output before tearing the channel down.
            let _ = output_task.await;
            let _ = handle.exit_status_request(channel_id, 0).await;
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;
            info!(session = %sid, "ssh session closed");
        });
    }

    fn start_exec_session(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
        raw_command: Option<String>,
    ) {
        let sid = self.sid.clone();
        let work_dir = self.resolved_work_dir();
        let state = self.state(channel_id);
        state.channel.take();

        let (input_tx, input_rx) = mpsc::channel::<Vec<u8>>(64);
        let cancel = CancellationToken::new();
        state.input_tx = Some(input_tx);
        state.cancel = Some(cancel.clone());

        let request = exec::ExecRequest {
            sid,
            raw_command,
            work_dir,
            env: state.env.clone(),
            input: input_rx,
            cancel,
            child_pid: Arc::clone(&state.child_pid),
        };
        tokio::spawn(exec::run(request, session.handle(), channel_id));
    }
}

impl Handler for SshHandler {
    type Error = anyhow::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!(session = %self.sid, user, "public key authentication accepted");
        Ok(Auth::Accept)
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if password == SANDBOX_PASSWORD {
            debug!(session = %self.sid, user, "password authentication succeeded");
            Ok(Auth::Accept)
        } else {
            debug!(session = %self.sid, user, "password authentication failed");
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let id = channel.id();
        let state = self.state(id);
        state.channel = Some(channel);
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let state = self.state(channel);
        state.pty = Some(PtyParams {
            term: term.to_string(),
            rows: row_height as u16,
            cols: col_width as u16,
        });
        session.channel_success(channel)?;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get(&channel) {
            if let Some(resize_tx) = &state.resize_tx {
                // Slot full means an older event is pending; dropping this
                // one keeps the session responsive.
                let _ = resize_tx.try_send(TtySize {
                    rows: row_height as u16,
                    cols: col_width as u16,
                });
            }
        }
        Ok(())
    }

    async fn agent_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.state(channel).agent_requested = true;
        session.channel_success(channel)?;
        Ok(true)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.maybe_forward_agent(channel, session);
        if self.state(channel).pty.is_some() {
            self.start_pty_session(channel, session);
        } else {
            // A shell without a PTY behaves like exec with no command.
            self.start_exec_session(channel, session, None);
        }
        session.channel_success(channel)?;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let raw_command = String::from_utf8_lossy(data).into_owned();
        self.maybe_forward_agent(channel, session);
        self.start_exec_session(channel, session, Some(raw_command));
        session.channel_success(channel)?;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != "sftp" {
            error!(session = %self.sid, subsystem = %name, "subsystem not supported");
            session.channel_failure(channel_id)?;
            return Ok(());
        }

        let Some(channel) = self.state(channel_id).channel.take() else {
            session.channel_failure(channel_id)?;
            return Ok(());
        };
        session.channel_success(channel_id)?;

        info!(session = %self.sid, "initializing sftp subsystem");
        let sid = self.sid.clone();
        tokio::spawn(async move {
            sftp::serve(channel, &sid).await;
        });
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get(&channel) {
            if let Some(input_tx) = &state.input_tx {
                let _ = input_tx.send(data.to_vec()).await;
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Closing the stdin side unblocks the managed copy into the child.
        if let Some(state) = self.channels.get_mut(&channel) {
            state.input_tx.take();
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.remove(&channel) {
            if let Some(cancel) = state.cancel {
                cancel.cancel();
            }
        }
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get(&channel) {
            let pid = state.child_pid.lock().ok().and_then(|pid| *pid);
            if let Some(pid) = pid {
                let _ = kill(pid, posix_signal(&signal));
            }
        }
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(
            session = %self.sid,
            host = %host_to_connect,
            port = port_to_connect,
            origin = %originator_address,
            origin_port = originator_port,
            "direct-tcpip open"
        );
        forward::spawn_direct_tcpip(channel, host_to_connect.to_string(), port_to_connect as u16);
        Ok(true)
    }

    async fn channel_open_direct_streamlocal(
        &mut self,
        channel: Channel<Msg>,
        socket_path: &str,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(session = %self.sid, path = %socket_path, "direct-streamlocal open");
        forward::spawn_direct_streamlocal(channel, PathBuf::from(socket_path));
        Ok(true)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.forwards
            .add_tcp(address, port, session.handle(), &self.sid)
            .await
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.forwards.remove_tcp(address, port);
        Ok(true)
    }

    async fn streamlocal_forward(
        &mut self,
        socket_path: &str,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.forwards
            .add_unix(Path::new(socket_path), session.handle(), &self.sid)
            .await
    }

    async fn cancel_streamlocal_forward(
        &mut self,
        socket_path: &str,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.forwards.remove_unix(socket_path);
        Ok(true)
    }
}

impl Drop for SshHandler {
    fn drop(&mut self) {
        // Connection gone: end every live session and listener it owned.
        for state in self.channels.values() {
            if let Some(cancel) = &state.cancel {
                cancel.cancel();
            }
        }
        self.forwards.abort_all();
    }
}

fn posix_signal(signal: &Sig) -> Signal {
    match signal {
        Sig::INT => Signal::SIGINT,
        Sig::TERM => Signal::SIGTERM,
        Sig::KILL => Signal::SIGKILL,
        Sig::QUIT => Signal::SIGQUIT,
        Sig::HUP => Signal::SIGHUP,
        _ => Signal::SIGKILL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_ssh_signals_map_to_their_posix_numbers() {
        assert_eq!(posix_signal(&Sig::INT), Signal::SIGINT);
        assert_eq!(posix_signal(&Sig::TERM), Signal::SIGTERM);
        assert_eq!(posix_signal(&Sig::KILL), Signal::SIGKILL);
        assert_eq!(posix_signal(&Sig::QUIT), Signal::SIGQUIT);
        assert_eq!(posix_signal(&Sig::HUP), Signal::SIGHUP);
    }

    #[test]
    fn unknown_ssh_signals_map_to_sigkill() {
        assert_eq!(posix_signal(&Sig::USR1), Signal::SIGKILL);
        assert_eq!(
            posix_signal(&Sig::Custom("WINCH".to_string())),
            Signal::SIGKILL
        );
    }
}
