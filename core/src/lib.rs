//! Process-supervision core for the deck sandbox daemon.
//!
//! The daemon runs as PID 1 inside the sandbox container, which makes it
//! responsible for reaping every orphaned child while foreground code is
//! simultaneously waiting on specific PIDs. The modules here implement that
//! contract: the [`reap`] registry arbitrates between the global reaper and
//! per-command waiters, [`execute`] runs one-shot commands on top of it, and
//! [`pty`] hosts interactive shell sessions in pseudo-terminals.

pub mod execute;
pub mod pty;
pub mod reap;
