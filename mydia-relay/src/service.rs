use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;

use crate::RelayState;
use crate::cleanup::CleanupTask;
use crate::config::ConfHandle;
use crate::listener::RelayListener;
use crate::log::{LogDeleterTask, LoggerGuard};
use crate::namespace::NamespaceDeriver;
use crate::pending::PendingRequests;
use crate::ratelimit::RedeemRateLimiter;
use crate::registry::ConnectionRegistry;
use crate::storage::RelayStore;
use crate::task::{ChildTask, ShutdownHandle, ShutdownSignal};
use tokio::runtime::{self, Runtime};

pub const SERVICE_NAME: &str = "mydia-relay";

#[allow(clippy::large_enum_variant)] // `Running` is bigger than `Stopped` but we don't care
enum ServiceState {
    Stopped,
    Running {
        shutdown_handle: ShutdownHandle,
        runtime: Runtime,
    },
}

pub struct RelayService {
    conf_handle: ConfHandle,
    state: ServiceState,
    _logger_guard: LoggerGuard,
}

impl RelayService {
    pub fn load(conf_handle: ConfHandle) -> anyhow::Result<Self> {
        let conf = conf_handle.get_conf();

        let logger_guard =
            crate::log::init(&conf.log_file, conf.log_directive.as_deref()).context("failed to setup logger")?;

        info!(version = env!("CARGO_PKG_VERSION"));

        Ok(RelayService {
            conf_handle,
            state: ServiceState::Stopped,
            _logger_guard: logger_guard,
        })
    }

    pub fn start(&mut self) -> anyhow::Result<()> {
        let runtime = runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to create runtime")?;

        let conf_handle = self.conf_handle.clone();

        // spawn_tasks needs to run in the runtime in order to bind the sockets.
        let tasks = runtime.block_on(spawn_tasks(conf_handle))?;

        trace!("Tasks created");

        let mut join_all = futures::future::select_all(tasks.inner.into_iter().map(|child| Box::pin(child.join())));

        runtime.spawn(async {
            loop {
                let (result, _, rest) = join_all.await;

                match result {
                    Ok(Ok(())) => trace!("A task terminated gracefully"),
                    Ok(Err(error)) => error!(error = format!("{error:#}"), "A task failed"),
                    Err(error) => error!(%error, "Something went very wrong with a task"),
                }

                if rest.is_empty() {
                    break;
                } else {
                    join_all = futures::future::select_all(rest);
                }
            }
        });

        self.state = ServiceState::Running {
            shutdown_handle: tasks.shutdown_handle,
            runtime,
        };

        Ok(())
    }

    /// Blocks the calling thread until an interrupt is received.
    pub fn wait_for_shutdown_signal(&self) {
        if let ServiceState::Running { runtime, .. } = &self.state {
            match runtime.block_on(tokio::signal::ctrl_c()) {
                Ok(()) => info!("Received interrupt signal"),
                Err(error) => error!(%error, "Couldn't listen for the interrupt signal"),
            }
        }
    }

    pub fn stop(&mut self) {
        match std::mem::replace(&mut self.state, ServiceState::Stopped) {
            ServiceState::Stopped => {
                info!("Attempted to stop relay service, but it's already stopped");
            }
            ServiceState::Running {
                shutdown_handle,
                runtime,
            } => {
                info!("Stopping relay service");

                // Send shutdown signals to all tasks.
                shutdown_handle.signal();

                runtime.block_on(async {
                    tokio::select! {
                        _ = shutdown_handle.all_closed() => {
                            debug!("All tasks closed gracefully");
                        }
                        _ = tokio::time::sleep(Duration::from_secs(10)) => {
                            warn!("Some tasks didn't terminate in time");
                        }
                    }
                });

                runtime.shutdown_timeout(Duration::from_secs(3));

                self.state = ServiceState::Stopped;
            }
        }
    }
}

struct Tasks {
    inner: Vec<ChildTask<anyhow::Result<()>>>,
    shutdown_handle: ShutdownHandle,
    shutdown_signal: ShutdownSignal,
}

impl Tasks {
    fn new() -> Self {
        let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();

        Self {
            inner: Vec::new(),
            shutdown_handle,
            shutdown_signal,
        }
    }

    fn register<T>(&mut self, task: T)
    where
        T: crate::task::Task<Output = anyhow::Result<()>> + 'static,
    {
        let child = crate::task::spawn_task(task, self.shutdown_signal.clone());
        self.inner.push(child);
    }
}

async fn spawn_tasks(conf_handle: ConfHandle) -> anyhow::Result<Tasks> {
    let conf = conf_handle.get_conf();

    let store = RelayStore::open(&conf.database_path)
        .await
        .with_context(|| format!("couldn't open database at {}", conf.database_path))?;
    store.setup().await.context("couldn't prepare database")?;

    let mut tasks = Tasks::new();

    let state = RelayState {
        conf_handle: conf_handle.clone(),
        store: store.clone(),
        connections: ConnectionRegistry::new(),
        pendings: PendingRequests::new(),
        redeem_limiter: RedeemRateLimiter::new(conf.redeem_rate_limit),
        namespace: Arc::new(NamespaceDeriver::new(conf.master_pepper.clone())),
        shutdown_signal: tasks.shutdown_signal.clone(),
    };

    conf.listeners
        .iter()
        .map(|listener_urls| {
            RelayListener::init_and_bind(listener_urls, state.clone())
                .with_context(|| format!("failed to initialize {}", listener_urls.internal_url))
        })
        .collect::<anyhow::Result<Vec<RelayListener>>>()
        .context("failed to bind listener")?
        .into_iter()
        .for_each(|listener| tasks.register(listener));

    tasks.register(CleanupTask {
        conf_handle,
        store,
        redeem_limiter: state.redeem_limiter.clone(),
    });

    tasks.register(LogDeleterTask {
        path: conf.log_file.clone(),
    });

    Ok(tasks)
}
