use crate::controller::BackendControl;
use rcon::Connection;
use std::process::Stdio;
use tokio::net::TcpStream;
use tokio::process::Command;

/// Runs the configured start command once and the configured stop commands in order,
/// fire-and-forget: exit status is logged but never inspected. A backend that never
/// comes up simply surfaces as a failed upstream dial on the next client.
pub struct ShellCommandBackend {
    start_command: String,
    stop_commands: Vec<String>,
}

impl ShellCommandBackend {
    pub fn new(start_command: String, stop_commands: Vec<String>) -> Self {
        ShellCommandBackend {
            start_command,
            stop_commands,
        }
    }

    fn spawn_shell(command: &str) -> std::io::Result<tokio::process::Child> {
        #[cfg(target_os = "windows")]
        {
            Command::new("cmd")
                .args(["/C", command])
                .stdin(Stdio::null())
                .spawn()
        }
        #[cfg(not(target_os = "windows"))]
        {
            Command::new("sh")
                .args(["-c", command])
                .stdin(Stdio::null())
                .spawn()
        }
    }
}

impl BackendControl for ShellCommandBackend {
    async fn start(&self) {
        match Self::spawn_shell(&self.start_command) {
            Ok(mut child) => {
                log::info!("Launched backend start command: {}", self.start_command);
                tokio::spawn(async move {
                    if let Err(e) = child.wait().await {
                        log::warn!("Failed to wait on backend start command: {e}");
                    }
                });
            }
            Err(e) => log::error!("Failed to spawn backend start command: {e}"),
        }
    }

    async fn stop(&self) {
        for command in &self.stop_commands {
            match Self::spawn_shell(command) {
                Ok(mut child) => {
                    if let Err(e) = child.wait().await {
                        log::warn!("Failed to wait on backend stop command {command:?}: {e}");
                    }
                }
                Err(e) => log::error!("Failed to spawn backend stop command {command:?}: {e}"),
            }
        }
    }
}

/// Supplements [`ShellCommandBackend`]'s start command with an RCON-issued stop. The
/// controller's token-based shutdown check remains the sole authority over *when* to
/// stop; this only changes *how* the stop is delivered.
pub struct RconBackend {
    start_command: String,
    rcon_addr: String,
    rcon_password: String,
}

impl RconBackend {
    pub fn new(start_command: String, rcon_port: u16, rcon_password: String) -> Self {
        RconBackend {
            start_command,
            rcon_addr: format!("127.0.0.1:{rcon_port}"),
            rcon_password,
        }
    }
}

impl BackendControl for RconBackend {
    async fn start(&self) {
        match ShellCommandBackend::spawn_shell(&self.start_command) {
            Ok(mut child) => {
                log::info!("Launched backend start command: {}", self.start_command);
                tokio::spawn(async move {
                    if let Err(e) = child.wait().await {
                        log::warn!("Failed to wait on backend start command: {e}");
                    }
                });
            }
            Err(e) => log::error!("Failed to spawn backend start command: {e}"),
        }
    }

    async fn stop(&self) {
        log::info!("Connecting to RCON at {} to send stop command...", self.rcon_addr);
        match Connection::<TcpStream>::connect(&self.rcon_addr, &self.rcon_password).await {
            Ok(mut conn) => {
                if let Err(e) = conn.cmd("stop").await {
                    log::warn!("RCON stop command failed: {e}");
                } else {
                    log::info!("Stop command sent over RCON.");
                }
            }
            Err(e) => log::warn!("Could not connect to RCON at {}: {e}", self.rcon_addr),
        }
    }
}
