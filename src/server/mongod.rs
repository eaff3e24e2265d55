//! mongod process management: spawning, readiness, log forwarding and shutdown.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use mongodb::{Client, bson::doc, options::ClientOptions};
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use super::instance::{InstanceFactory, InstanceInfo, ServerInstance};
use crate::config::ServerOptions;

/// Ports probed above the base port before giving up
const PORT_RANGE: u16 = 100;

/// Grace period between SIGTERM and SIGKILL
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Check if a port is available by attempting to bind to it.
pub fn is_port_available(ip: &str, port: u16) -> bool {
    TcpListener::bind((ip, port)).is_ok_and(|listener| listener.local_addr().is_ok())
}

/// First free port in `base_port..base_port + PORT_RANGE`
pub fn allocate_port(ip: &str, base_port: u16) -> Result<u16> {
    let end = base_port.saturating_add(PORT_RANGE);
    (base_port..end)
        .find(|port| is_port_available(ip, *port))
        .ok_or_else(|| anyhow!("No available ports in range {base_port}-{end}"))
}

pub fn build_uri(ip: &str, port: u16, repl_set: Option<&str>) -> String {
    match repl_set {
        Some(rs) => format!("mongodb://{ip}:{port}/?replicaSet={rs}"),
        None => format!("mongodb://{ip}:{port}/"),
    }
}

enum DataDir {
    Temporary(TempDir),
    Configured(PathBuf),
}

impl DataDir {
    fn path(&self) -> PathBuf {
        match self {
            Self::Temporary(dir) => dir.path().to_path_buf(),
            Self::Configured(path) => path.clone(),
        }
    }
}

struct RunningMongod {
    child: Child,
    info: InstanceInfo,
    // Dropped (and removed, if temporary) after the process exited
    _data_dir: DataDir,
}

/// An ephemeral mongod spawned from [`ServerOptions`].
pub struct MongodInstance {
    options: ServerOptions,
    db_name: String,
    running: Option<RunningMongod>,
}

impl MongodInstance {
    pub fn new(options: ServerOptions) -> Self {
        let db_name = options
            .db_name
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self {
            options,
            db_name,
            running: None,
        }
    }

    fn prepare_data_dir(&self) -> Result<DataDir> {
        match &self.options.db_path {
            Some(path) => {
                let path = PathBuf::from(path);
                std::fs::create_dir_all(&path)
                    .with_context(|| format!("Failed to create db_path {}", path.display()))?;
                Ok(DataDir::Configured(path))
            }
            None => {
                let dir = tempfile::Builder::new()
                    .prefix("instant-mongo-")
                    .tempdir()
                    .context("Failed to create temporary data directory")?;
                Ok(DataDir::Temporary(dir))
            }
        }
    }

    fn resolve_port(&self) -> Result<u16> {
        match self.options.port {
            Some(p) if !is_port_available(&self.options.ip, p) => {
                bail!("Port {p} is already in use. Please choose a different port.")
            }
            Some(p) => Ok(p),
            None => allocate_port(&self.options.ip, self.options.base_port),
        }
    }

    fn build_command(&self, port: u16, db_path: &std::path::Path) -> Command {
        let mut cmd = Command::new(&self.options.binary_path);
        cmd.arg("--port")
            .arg(port.to_string())
            .arg("--bind_ip")
            .arg(&self.options.ip)
            .arg("--dbpath")
            .arg(db_path)
            .arg("--storageEngine")
            .arg(&self.options.storage_engine);

        if let Some(rs) = &self.options.repl_set {
            cmd.arg("--replSet").arg(rs);
        }

        cmd.args(&self.options.args);

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn_log_readers(child: &mut Child, port: u16) {
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(text)) = lines.next_line().await {
                    debug!(target: "mongod", port, "{text}");
                }
                debug!(port, "mongod stdout reader exiting");
            });
        }

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(text)) = lines.next_line().await {
                    debug!(target: "mongod", port, "{text}");
                }
                debug!(port, "mongod stderr reader exiting");
            });
        }
    }

    /// Poll with a `ping` until mongod answers or the startup timeout elapses
    async fn wait_until_ready(&self, child: &mut Child, port: u16) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(self.options.startup_timeout_secs);
        let probe_uri = format!("mongodb://{}:{port}/?directConnection=true", self.options.ip);
        let mut options = ClientOptions::parse(probe_uri.as_str())
            .await
            .context("Failed to build readiness probe options")?;
        options.server_selection_timeout = Some(Duration::from_millis(500));
        options.connect_timeout = Some(Duration::from_millis(500));
        let client = Client::with_options(options).context("Failed to create probe client")?;

        loop {
            if let Some(status) = child.try_wait().context("Failed to poll mongod")? {
                bail!("mongod exited during startup ({status})");
            }

            match client.database("admin").run_command(doc! { "ping": 1 }).await {
                Ok(_) => break,
                Err(e) => debug!("mongod not ready on port {port}: {e}"),
            }

            if Instant::now() >= deadline {
                bail!(
                    "mongod did not accept connections within {} seconds",
                    self.options.startup_timeout_secs
                );
            }
            sleep(Duration::from_millis(250)).await;
        }

        if let Some(rs) = &self.options.repl_set {
            // A single-member replica set has to be initiated before it elects a primary
            let host = format!("{}:{port}", self.options.ip);
            let init = client
                .database("admin")
                .run_command(doc! {
                    "replSetInitiate": {
                        "_id": rs.as_str(),
                        "members": [ { "_id": 0, "host": host } ],
                    }
                })
                .await;
            if let Err(e) = init {
                warn!("replSetInitiate for '{rs}' failed: {e}");
            }
        }

        client.shutdown().await;
        Ok(())
    }
}

#[async_trait]
impl ServerInstance for MongodInstance {
    async fn start(&mut self) -> Result<InstanceInfo> {
        if self.running.is_some() {
            self.stop().await?;
        }

        let port = self.resolve_port()?;
        let data_dir = self.prepare_data_dir()?;
        let db_path = data_dir.path();

        info!(
            "Starting mongod '{}' on {}:{} (dbpath {})",
            self.options.binary_path,
            self.options.ip,
            port,
            db_path.display()
        );

        let mut child = self
            .build_command(port, &db_path)
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", self.options.binary_path))?;
        Self::spawn_log_readers(&mut child, port);

        if let Err(e) = self.wait_until_ready(&mut child, port).await {
            if let Err(kill_err) = shutdown_child(child).await {
                warn!("Failed to reap mongod after failed start: {kill_err}");
            }
            return Err(e);
        }

        let info = InstanceInfo {
            port,
            db_name: self.db_name.clone(),
            ip: self.options.ip.clone(),
            storage_engine: self.options.storage_engine.clone(),
            repl_set: self.options.repl_set.clone(),
            db_path: db_path.display().to_string(),
            uri: build_uri(&self.options.ip, port, self.options.repl_set.as_deref()),
            pid: child.id(),
            started_at: chrono::Utc::now(),
        };
        info!("mongod running at {}", info.uri);

        self.running = Some(RunningMongod {
            child,
            info: info.clone(),
            _data_dir: data_dir,
        });
        Ok(info)
    }

    async fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            debug!("mongod already stopped");
            return Ok(());
        };

        debug!(pid = ?running.info.pid, port = running.info.port, "Stopping mongod");
        let status = shutdown_child(running.child)
            .await
            .context("Failed to stop mongod")?;
        info!("mongod on port {} exited ({status})", running.info.port);
        Ok(())
    }

    fn info(&self) -> Option<&InstanceInfo> {
        self.running.as_ref().map(|r| &r.info)
    }
}

/// Spawns [`MongodInstance`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct MongodFactory;

impl InstanceFactory for MongodFactory {
    fn create(&self, options: &ServerOptions) -> Box<dyn ServerInstance> {
        Box::new(MongodInstance::new(options.clone()))
    }
}

/// Shut down a child with SIGTERM, escalating to SIGKILL after a grace period.
pub async fn shutdown_child(mut child: Child) -> std::io::Result<std::process::ExitStatus> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let Some(pid) = child.id() else {
            // Already reaped
            return child.wait().await;
        };
        let pid = i32::try_from(pid)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid overflow"))?;

        if let Err(e) = signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
            if e == nix::errno::Errno::ESRCH {
                return child.wait().await;
            }
            return Err(std::io::Error::other(e));
        }

        if let Ok(result) = timeout(SHUTDOWN_GRACE, child.wait()).await {
            return result;
        }
        warn!("mongod ignored SIGTERM, killing");
    }

    child.kill().await?;
    child.wait().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_uri() {
        assert_eq!(build_uri("127.0.0.1", 4000, None), "mongodb://127.0.0.1:4000/");
        assert_eq!(
            build_uri("127.0.0.1", 4000, Some("rs0")),
            "mongodb://127.0.0.1:4000/?replicaSet=rs0"
        );
        let uri = build_uri("127.0.0.1", 4000, Some("rs0"));
        assert!(crate::connection::validate_uri(&uri).is_ok());
    }

    #[test]
    fn test_allocate_port_skips_bound_port() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let taken = listener.local_addr().unwrap().port();
        assert!(!is_port_available("127.0.0.1", taken));

        if taken < u16::MAX - PORT_RANGE {
            let port = allocate_port("127.0.0.1", taken).unwrap();
            assert_ne!(port, taken);
        }
    }

    #[test]
    fn test_new_uses_configured_db_name() {
        let options = ServerOptions {
            db_name: Some("test".to_string()),
            ..ServerOptions::default()
        };
        let instance = MongodInstance::new(options);
        assert_eq!(instance.db_name, "test");
        assert!(!instance.is_running());
    }

    #[tokio::test]
    async fn test_start_fails_for_missing_binary() {
        let options = ServerOptions {
            binary_path: "/nonexistent/mongod".to_string(),
            startup_timeout_secs: 1,
            ..ServerOptions::default()
        };
        let mut instance = MongodInstance::new(options);
        assert!(instance.start().await.is_err());
        assert!(instance.info().is_none());
        // Stopping a never-started instance is fine
        assert!(instance.stop().await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_child_terminates_process() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        assert!(shutdown_child(child).await.is_ok());
    }
}
