//! Process Spawner
//!
//! Nodes are separate OS processes: spawn re-invokes this executable with
//! the `node` subcommand, kill delivers SIGKILL. The registry is never told
//! about a kill; it observes the heartbeat gap on its own, so a kill and a
//! real crash look identical from the membership side.

use std::collections::HashMap;
use std::time::Duration;

use nix::sys::signal::{kill as send_signal, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use crate::client::HttpClient;
use crate::error::{Error, Result};
use crate::protocol::NodeRole;

/// Owns the node child processes
pub struct Spawner {
    host: String,
    registry_url: String,
    children: HashMap<String, Child>,
    /// Per-id respawn counter; becomes the node's startup_epoch
    epochs: HashMap<String, u64>,
}

impl Spawner {
    pub fn new(host: String, registry_url: String) -> Self {
        Self {
            host,
            registry_url,
            children: HashMap::new(),
            epochs: HashMap::new(),
        }
    }

    /// Start a node process. Returns the startup epoch assigned to it.
    pub fn spawn_node(
        &mut self,
        node_id: &str,
        port: u16,
        role: NodeRole,
        delay_ms: u64,
    ) -> Result<u64> {
        let epoch = self
            .epochs
            .entry(node_id.to_string())
            .and_modify(|e| *e += 1)
            .or_insert(1);
        let epoch = *epoch;

        let exe = std::env::current_exe()
            .map_err(|e| Error::Spawn(format!("cannot locate own executable: {}", e)))?;
        let child = Command::new(exe)
            .arg("node")
            .arg("--id")
            .arg(node_id)
            .arg("--port")
            .arg(port.to_string())
            .arg("--role")
            .arg(role.to_string())
            .arg("--registry")
            .arg(&self.registry_url)
            .arg("--host")
            .arg(&self.host)
            .arg("--replication-delay-ms")
            .arg(delay_ms.to_string())
            .arg("--startup-epoch")
            .arg(epoch.to_string())
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| Error::Spawn(format!("'{}': {}", node_id, e)))?;

        tracing::info!(
            "spawned '{}' (pid {:?}) as {} on port {} with {}ms delay, epoch {}",
            node_id,
            child.id(),
            role,
            port,
            delay_ms,
            epoch
        );
        self.children.insert(node_id.to_string(), child);
        Ok(epoch)
    }

    /// Kill a node process with SIGKILL. No drain, no deregistration: the
    /// registry only sees the heartbeat gap, exactly as it would for a real
    /// crash.
    pub fn kill(&mut self, node_id: &str) -> Result<()> {
        self.signal(node_id, Signal::SIGKILL)
    }

    /// Gracefully stop everything we spawned; used on coordinator shutdown.
    /// SIGTERM lets each node drain and deregister.
    pub fn kill_all(&mut self) {
        let ids: Vec<String> = self.children.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.signal(&id, Signal::SIGTERM) {
                tracing::warn!("shutdown stop of '{}' failed: {}", id, e);
            }
        }
    }

    fn signal(&mut self, node_id: &str, signal: Signal) -> Result<()> {
        let mut child = self
            .children
            .remove(node_id)
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::Kill(format!("'{}' already exited", node_id)))?;

        send_signal(Pid::from_raw(pid as i32), signal)
            .map_err(|e| Error::Kill(format!("'{}' (pid {}): {}", node_id, pid, e)))?;
        tracing::info!("sent {} to '{}' (pid {})", signal, node_id, pid);

        // Reap in the background so the child never lingers as a zombie
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(())
    }

    /// Whether we hold a live child handle for this id
    pub fn owns(&self, node_id: &str) -> bool {
        self.children.contains_key(node_id)
    }
}

/// Poll a freshly spawned node's health endpoint until it answers
pub async fn wait_healthy(client: &HttpClient, base_url: &str, deadline: Duration) -> Result<()> {
    let started = tokio::time::Instant::now();
    loop {
        match client.health(base_url).await {
            Ok(health) => {
                tracing::debug!("'{}' healthy after {:?}", health.node_id, started.elapsed());
                return Ok(());
            }
            Err(_) if started.elapsed() < deadline => {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Err(e) => {
                return Err(Error::Spawn(format!(
                    "{} not healthy within {:?}: {}",
                    base_url, deadline, e
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epochs_increment_per_id() {
        let mut spawner = Spawner::new("127.0.0.1".into(), "http://127.0.0.1:7600".into());
        // Exercise the epoch accounting without real processes
        assert_eq!(*spawner.epochs.entry("f".into()).or_insert(1), 1);
        spawner.epochs.entry("f".into()).and_modify(|e| *e += 1);
        assert_eq!(spawner.epochs["f"], 2);
        assert!(!spawner.owns("f"));
    }

    #[tokio::test]
    async fn test_kill_unknown_node_errors() {
        let mut spawner = Spawner::new("127.0.0.1".into(), "http://127.0.0.1:7600".into());
        let err = spawner.kill("follower-9").expect_err("nothing spawned");
        assert!(matches!(err, Error::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn test_wait_healthy_times_out_on_dead_port() {
        let client = HttpClient::new();
        let err = wait_healthy(&client, "http://127.0.0.1:1", Duration::from_millis(300))
            .await
            .expect_err("nothing listening");
        assert!(matches!(err, Error::Spawn(_)));
    }
}
