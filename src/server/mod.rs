//! Lifecycle of the single ephemeral mongod instance.
//!
//! The controller owns at most one [`ServerInstance`] and funnels every change
//! through `start`/`stop`. Status transitions are published on a
//! [`StatusChannel`] before the triggering call returns. Calls are serialized
//! in the order they reach the instance lock, so the last completed call
//! decides the final status.

mod instance;
mod mongod;
mod status;

pub use instance::{InstanceFactory, InstanceInfo, ServerInstance};
pub use mongod::{MongodFactory, MongodInstance, allocate_port, build_uri, is_port_available};
pub use status::{ServerStatus, StatusChannel, StatusSubscription};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::ServerOptions;
use crate::error::{ExplorerError, ExplorerResult};

pub struct ServerLifecycleController {
    options: RwLock<ServerOptions>,
    factory: Arc<dyn InstanceFactory>,
    instance: Mutex<Option<Box<dyn ServerInstance>>>,
    info: RwLock<Option<InstanceInfo>>,
    status: StatusChannel,
    terminated: AtomicBool,
}

impl ServerLifecycleController {
    pub fn new(options: ServerOptions, factory: Arc<dyn InstanceFactory>) -> Self {
        Self {
            options: RwLock::new(options),
            factory,
            instance: Mutex::new(None),
            info: RwLock::new(None),
            status: StatusChannel::new(ServerStatus::Stopped),
            terminated: AtomicBool::new(false),
        }
    }

    /// Controller spawning real mongod processes
    pub fn with_mongod(options: ServerOptions) -> Self {
        Self::new(options, Arc::new(MongodFactory))
    }

    pub fn status(&self) -> ServerStatus {
        self.status.current()
    }

    pub fn subscribe(&self) -> StatusSubscription {
        self.status.subscribe()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn set_info(&self, info: Option<InstanceInfo>) {
        *self.info.write().unwrap_or_else(PoisonError::into_inner) = info;
    }

    fn set_status(&self, status: ServerStatus) {
        self.status.publish(status);
    }

    /// Start the server. A running instance is stopped first, so this always
    /// ends with a fresh instance or in `Stopped` when startup fails.
    pub async fn start(&self) -> &Self {
        if let Err(e) = self.try_start().await {
            error!("{}", e.detailed());
        }
        self
    }

    /// Like [`start`](Self::start) but hands the failure back to the caller.
    /// The status is `Stopped` after a failure either way.
    pub async fn try_start(&self) -> ExplorerResult<InstanceInfo> {
        if self.is_terminated() {
            return Err(ExplorerError::Lifecycle {
                action: "start",
                source: anyhow::anyhow!("the controller has been terminated"),
            });
        }

        self.set_status(ServerStatus::Starting);

        let mut guard = self.instance.lock().await;
        let instance = guard.get_or_insert_with(|| {
            let options = self.options.read().unwrap_or_else(PoisonError::into_inner);
            self.factory.create(&options)
        });

        if instance.is_running() {
            info!("Server already running - restarting mongo server");
            self.set_info(None);
            if let Err(e) = instance.stop().await {
                warn!("Failed to stop previous instance: {e:#}");
            }
        }

        match instance.start().await {
            Ok(info) => {
                info!("Database is running on port {}", info.port);
                self.set_info(Some(info.clone()));
                self.set_status(ServerStatus::Running);
                Ok(info)
            }
            Err(source) => {
                self.set_info(None);
                self.set_status(ServerStatus::Stopped);
                Err(ExplorerError::Lifecycle {
                    action: "start",
                    source,
                })
            }
        }
    }

    /// Stop the server. Stopping a stopped server succeeds and only re-asserts
    /// `Stopped`. The `Stopped` status is published once the instance is down.
    pub async fn stop(&self) -> ExplorerResult<()> {
        if matches!(
            self.status(),
            ServerStatus::Running | ServerStatus::Starting
        ) {
            self.set_status(ServerStatus::Stopping);
        }

        let mut guard = self.instance.lock().await;
        let result = match guard.as_mut() {
            Some(instance) if instance.is_running() => {
                self.set_info(None);
                instance.stop().await.map_err(|source| ExplorerError::Lifecycle {
                    action: "stop",
                    source,
                })
            }
            _ => {
                info!("Server already stopped");
                Ok(())
            }
        };
        self.set_status(ServerStatus::Stopped);
        drop(guard);

        if result.is_ok() {
            info!("Database stopped");
        }
        result
    }

    /// Replace the configuration snapshot. An idle instance is discarded so the
    /// next start picks up the new options; a running one keeps its settings.
    pub async fn set_options(&self, options: ServerOptions) {
        *self.options.write().unwrap_or_else(PoisonError::into_inner) = options;

        let mut guard = self.instance.lock().await;
        if guard.as_ref().is_some_and(|i| !i.is_running()) {
            *guard = None;
        }
    }

    /// Process-wide teardown: stop the instance, close the status channel and
    /// drop all subscribers. The controller refuses to start afterwards.
    pub async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut guard = self.instance.lock().await;
        if let Some(mut instance) = guard.take()
            && instance.is_running()
        {
            if let Err(e) = instance.stop().await {
                warn!("Failed to stop mongo server during teardown: {e:#}");
            } else {
                info!("Mongo server stopped");
            }
        }
        drop(guard);

        self.set_info(None);
        self.set_status(ServerStatus::Stopped);
        self.status.close();
    }

    pub fn instance_info(&self) -> Option<InstanceInfo> {
        self.info
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn uri(&self) -> Option<String> {
        self.instance_info().map(|i| i.uri)
    }

    pub fn db_name(&self) -> Option<String> {
        self.instance_info().map(|i| i.db_name)
    }

    pub fn port(&self) -> Option<u16> {
        self.instance_info().map(|i| i.port)
    }
}
