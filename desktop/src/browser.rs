use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use crate::process::ManagedProcess;
use crate::process::ProcessSpec;
use crate::supervisor::DesktopError;
use crate::supervisor::DesktopSupervisor;
use crate::supervisor::display_name;
use crate::supervisor::target_user;

const CHROME_PROCESS_NAME: &str = "google-chrome";
const CHROME_BINARY: &str = "/usr/bin/google-chrome";
const BROWSER_PRIORITY: i32 = 900;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserOpenRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub incognito: bool,
    #[serde(default)]
    pub remote_debug: bool,
}

impl DesktopSupervisor {
    /// Starts Chrome (or restarts it with new parameters). Any existing
    /// browser record is stopped and replaced first.
    pub async fn open_browser(&self, request: BrowserOpenRequest) -> Result<(), DesktopError> {
        if let Some(existing) = self.remove_record(CHROME_PROCESS_NAME) {
            existing.stop();
        }

        let record = ManagedProcess::new(self.browser_spec(&request));
        self.insert_record(Arc::clone(&record));
        tokio::spawn(record.run_loop());

        info!(url = %request.url, remote_debug = request.remote_debug, "browser opened");
        Ok(())
    }

    /// Force-closes the browser and its whole process group. The record is
    /// removed; a later open starts from a clean slate.
    pub fn close_browser(&self) {
        if let Some(record) = self.remove_record(CHROME_PROCESS_NAME) {
            record.stop();
            info!("browser closed and cleaned up");
        }
    }

    fn browser_spec(&self, request: &BrowserOpenRequest) -> ProcessSpec {
        let mut args: Vec<String> = [
            // Container-survival flags.
            "--no-sandbox",
            "--test-type",
            "--disable-dev-shm-usage",
            "--disable-gpu",
            // Keep the session silent: no first-run UI, prompts or popups.
            "--no-first-run",
            "--no-default-browser-check",
            "--disable-notifications",
            "--disable-infobars",
            "--disable-extensions",
            "--disable-popup-blocking",
            // Automation friendliness.
            "--password-store=basic",
            "--disable-features=Translate",
            "--disable-hang-monitor",
            "--mute-audio",
            // Deterministic geometry for screenshots and pointer math.
            "--start-maximized",
            "--window-size=1280,720",
        ]
        .iter()
        .map(|flag| flag.to_string())
        .collect();

        if request.incognito {
            args.push("--incognito".to_string());
        }
        if request.remote_debug {
            args.push("--remote-debugging-port=9222".to_string());
            args.push("--remote-debugging-address=0.0.0.0".to_string());
        }
        if !request.url.is_empty() {
            args.push(request.url.clone());
        }

        let user = target_user();
        let display = display_name();
        // Empty until initialize() has run; the browser can be opened alone.
        let mut config_dir = self.config_dir();
        if config_dir.as_os_str().is_empty() {
            config_dir = std::env::temp_dir();
        }

        ProcessSpec {
            name: CHROME_PROCESS_NAME.to_string(),
            command: CHROME_BINARY.to_string(),
            args,
            user: user.clone(),
            priority: BROWSER_PRIORITY,
            env: vec![
                ("DISPLAY".to_string(), display),
                ("HOME".to_string(), format!("/home/{user}")),
                ("USER".to_string(), user),
            ],
            log_file: config_dir.join("chrome.log"),
            err_file: config_dir.join("chrome.err"),
            auto_restart: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_replaces_the_previous_browser_record() {
        let supervisor = DesktopSupervisor::new();
        supervisor
            .open_browser(BrowserOpenRequest {
                url: "https://example.com".to_string(),
                ..Default::default()
            })
            .await
            .expect("open browser");
        assert!(supervisor.record(CHROME_PROCESS_NAME).is_ok());

        supervisor
            .open_browser(BrowserOpenRequest::default())
            .await
            .expect("reopen browser");
        assert!(supervisor.record(CHROME_PROCESS_NAME).is_ok());

        supervisor.close_browser();
        assert!(supervisor.record(CHROME_PROCESS_NAME).is_err());
    }

    #[test]
    fn browser_spec_reflects_request_toggles() {
        let supervisor = DesktopSupervisor::new();
        let spec = supervisor.browser_spec(&BrowserOpenRequest {
            url: "https://example.com".to_string(),
            incognito: true,
            remote_debug: true,
        });

        assert_eq!(spec.name, CHROME_PROCESS_NAME);
        assert!(!spec.auto_restart);
        assert!(spec.args.iter().any(|a| a == "--incognito"));
        assert!(spec.args.iter().any(|a| a == "--remote-debugging-port=9222"));
        assert_eq!(spec.args.last().map(String::as_str), Some("https://example.com"));

        let plain = supervisor.browser_spec(&BrowserOpenRequest::default());
        assert!(!plain.args.iter().any(|a| a == "--incognito"));
        assert!(!plain.args.iter().any(|a| a.starts_with("--remote-debugging")));
    }
}
