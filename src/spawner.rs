//! Default backend spawner
//!
//! Spawns one backend process per user from a configured command template and
//! resolves once the assigned port accepts connections. This is deliberately
//! thin: health monitoring and restart policy belong to the backend platform,
//! not the router. There is no startup timeout; a start that never binds its
//! port parks its waiters until the process exits.

use crate::lifecycle::BackendSpawner;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info};

pub struct CommandSpawner {
    command_template: String,
    next_port: AtomicU16,
    poll_interval: Duration,
    /// Children are held for the process lifetime so they are reaped with us
    children: Arc<Mutex<Vec<Child>>>,
}

impl CommandSpawner {
    pub fn new(command_template: impl Into<String>, base_port: u16, poll_interval: Duration) -> Self {
        Self {
            command_template: command_template.into(),
            next_port: AtomicU16::new(base_port),
            poll_interval,
            children: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn render_command(&self, user: &str, port: u16) -> String {
        self.command_template
            .replace("{port}", &port.to_string())
            .replace("{user}", user)
    }
}

impl BackendSpawner for CommandSpawner {
    fn start(&self, user: &str) -> BoxFuture<'static, anyhow::Result<u16>> {
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        let cmdline = self.render_command(user, port);
        let poll_interval = self.poll_interval;
        let children = Arc::clone(&self.children);
        let user = user.to_string();

        Box::pin(async move {
            let args = shell_words::split(&cmdline)
                .map_err(|e| anyhow::anyhow!("invalid backend command '{cmdline}': {e}"))?;
            let (program, rest) = args
                .split_first()
                .ok_or_else(|| anyhow::anyhow!("empty backend command"))?;

            info!(user, port, command = %cmdline, "Spawning backend");
            let mut child = Command::new(program)
                .args(rest)
                .env("NBGATE_USER", &user)
                .env("NBGATE_PORT", port.to_string())
                .spawn()
                .map_err(|e| anyhow::anyhow!("failed to spawn '{program}': {e}"))?;

            loop {
                if let Some(status) = child.try_wait()? {
                    anyhow::bail!("backend for {user} exited during startup: {status}");
                }
                if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                    break;
                }
                tokio::time::sleep(poll_interval).await;
            }

            debug!(user, port, "Backend accepting connections");
            children.lock().push(child);
            Ok(port)
        })
    }
}
