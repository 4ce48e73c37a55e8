//! Supervisor for the sandbox desktop stack.
//!
//! Brings up Xvfb, the desktop environment, the VNC server and the noVNC
//! proxy (plus an on-demand browser) under a privilege-dropped user, keeps
//! them alive with per-process restart loops, and tears the whole set down
//! by process group on shutdown.

mod browser;
mod process;
mod supervisor;

pub use browser::BrowserOpenRequest;
pub use process::ProcessStatus;
pub use supervisor::DesktopError;
pub use supervisor::DesktopSupervisor;
pub use supervisor::SystemStatus;
