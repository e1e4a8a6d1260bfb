//! Per-stop polling workers and the handle the host drives them through.
//!
//! Each configured stop gets its own task and timer. Workers publish their
//! status on a `watch` channel the handle reads from, and report every
//! committed update to a single sink task that owns the snapshot cache.

mod context;
mod poller;
mod sink;

pub use context::{AuthAlarm, ConfigSnapshot, fetch_stop};
pub use poller::{PollState, StopPoller, StopStatus, build_snapshot};

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::cache::{CacheInfo, SnapshotCache};
use crate::config::ServiceConfig;
use crate::diagnostics::{Diagnostics, StopDiagnostics};
use crate::error::ServiceError;
use crate::fetch::auth::UrlParam;
use crate::fetch::{BasicClient, HttpClient, connect};
use crate::model::StopSnapshot;
use poller::{StopCommand, StopTask};
use sink::{SinkMessage, run_sink};

const COMMAND_BUFFER: usize = 4;
const SINK_BUFFER: usize = 64;
const UPDATE_BUFFER: usize = 64;

type Connect<C> = dyn Fn(&ServiceConfig) -> reqwest::Result<C> + Send + Sync;

struct StopWorker {
    status: watch::Receiver<StopStatus>,
    commands: mpsc::Sender<StopCommand>,
    task: JoinHandle<()>,
}

/// A running service. Dropping it without calling [`Handle::stop`] leaves
/// the workers running until the runtime shuts down.
pub struct Handle<C: HttpClient + 'static> {
    config_tx: watch::Sender<Arc<ConfigSnapshot<C>>>,
    shutdown_tx: watch::Sender<bool>,
    stops: BTreeMap<String, StopWorker>,
    sink_tx: mpsc::Sender<SinkMessage>,
    sink_task: JoinHandle<()>,
    updates: broadcast::Sender<StopStatus>,
    alarm: Arc<AuthAlarm>,
    connect: Arc<Connect<C>>,
}

impl Handle<UrlParam<BasicClient>> {
    /// Validates `config` and starts one worker per stop against the 511 API.
    /// Must be called from within a tokio runtime.
    pub fn start(config: ServiceConfig) -> Result<Self, ServiceError> {
        Self::start_with(config, connect)
    }
}

impl<C: HttpClient + 'static> Handle<C> {
    /// Like [`Handle::start`] with a caller-supplied client factory.
    pub fn start_with<F>(config: ServiceConfig, connect: F) -> Result<Self, ServiceError>
    where
        F: Fn(&ServiceConfig) -> reqwest::Result<C> + Send + Sync + 'static,
    {
        let connect: Arc<Connect<C>> = Arc::new(connect);
        let ctx = Arc::new(ConfigSnapshot::build(1, config, connect.as_ref())?);

        let cache = ctx.config.cache.enabled.then(|| {
            SnapshotCache::open(
                ctx.config.cache.path.clone(),
                std::time::Duration::from_secs(ctx.config.cache.max_age_minutes * 60),
                Utc::now(),
            )
        });
        let (sink_tx, sink_rx) = mpsc::channel(SINK_BUFFER);
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        let sink_task = tokio::spawn(run_sink(sink_rx, cache, updates.clone()));

        let (config_tx, _) = watch::channel(Arc::clone(&ctx));
        let (shutdown_tx, _) = watch::channel(false);

        let mut handle = Self {
            config_tx,
            shutdown_tx,
            stops: BTreeMap::new(),
            sink_tx,
            sink_task,
            updates,
            alarm: Arc::new(AuthAlarm::default()),
            connect,
        };
        for stop in &ctx.config.stops {
            handle.spawn_stop(&ctx, &stop.stop_code);
        }
        info!(
            stops = ctx.config.stops.len(),
            agency = %ctx.config.agency,
            interval_secs = ctx.config.poll_interval_seconds,
            "Started stop polling"
        );
        Ok(handle)
    }

    fn spawn_stop(&mut self, ctx: &ConfigSnapshot<C>, stop_code: &str) {
        let Some(stop) = ctx.config.stop(stop_code) else {
            return;
        };
        let poller = StopPoller::new(stop, &ctx.config.agency);
        let (status_tx, status_rx) = watch::channel(poller.status());
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);

        let task = StopTask {
            stop_code: stop_code.to_string(),
            poller,
            config_rx: self.config_tx.subscribe(),
            shutdown_rx: self.shutdown_tx.subscribe(),
            commands: cmd_rx,
            status_tx,
            sink_tx: self.sink_tx.clone(),
            alarm: Arc::clone(&self.alarm),
        };
        let span = info_span!("stop", stop_code = %stop_code);
        let task = tokio::spawn(task.run().instrument(span));

        self.stops.insert(
            stop_code.to_string(),
            StopWorker {
                status: status_rx,
                commands: cmd_tx,
                task,
            },
        );
    }

    fn current(&self) -> Arc<ConfigSnapshot<C>> {
        self.config_tx.borrow().clone()
    }

    fn worker(&self, stop_code: &str) -> Result<&StopWorker, ServiceError> {
        self.stops
            .get(stop_code)
            .ok_or_else(|| ServiceError::UnknownStop(stop_code.to_string()))
    }

    /// Workers addressed by `stop_code`, or all of them.
    fn targets(&self, stop_code: Option<&str>) -> Result<Vec<&StopWorker>, ServiceError> {
        match stop_code {
            Some(code) => Ok(vec![self.worker(code)?]),
            None => Ok(self.stops.values().collect()),
        }
    }

    pub fn version(&self) -> u64 {
        self.config_tx.borrow().version
    }

    pub fn config(&self) -> Arc<ServiceConfig> {
        Arc::clone(&self.config_tx.borrow().config)
    }

    pub fn status(&self, stop_code: &str) -> Option<StopStatus> {
        self.stops.get(stop_code).map(|w| w.status.borrow().clone())
    }

    pub fn snapshot(&self, stop_code: &str) -> Option<StopSnapshot> {
        self.status(stop_code).map(|s| s.snapshot)
    }

    /// Snapshots for every configured stop, in configuration order.
    pub fn snapshots(&self) -> Vec<StopSnapshot> {
        self.current()
            .config
            .stops
            .iter()
            .filter_map(|stop| self.snapshot(&stop.stop_code))
            .collect()
    }

    /// Every committed update, from all stops.
    pub fn subscribe(&self) -> broadcast::Receiver<StopStatus> {
        self.updates.subscribe()
    }

    /// Asks one stop, or all stops, to poll now. A stop with a poll already
    /// in flight or a refresh already queued treats this as satisfied.
    pub fn refresh(&self, stop_code: Option<&str>) -> Result<(), ServiceError> {
        for worker in self.targets(stop_code)? {
            if worker.commands.try_send(StopCommand::Refresh).is_err() {
                debug!("Refresh already pending");
            }
        }
        Ok(())
    }

    pub fn reset_health(&self, stop_code: Option<&str>) -> Result<(), ServiceError> {
        for worker in self.targets(stop_code)? {
            if worker.commands.try_send(StopCommand::ResetHealth).is_err() {
                warn!("Stop worker busy, health reset dropped");
            }
        }
        Ok(())
    }

    /// Swaps in a new configuration. Polls in flight are cancelled and re-run
    /// under it; stops that were added or removed are started or stopped.
    pub async fn reload(&mut self, config: ServiceConfig) -> Result<(), ServiceError> {
        let version = self.version() + 1;
        let ctx = Arc::new(ConfigSnapshot::build(version, config, self.connect.as_ref())?);
        self.config_tx.send_replace(Arc::clone(&ctx));

        let removed: Vec<String> = self
            .stops
            .keys()
            .filter(|code| ctx.config.stop(code).is_none())
            .cloned()
            .collect();
        for code in removed {
            if let Some(worker) = self.stops.remove(&code) {
                if let Err(e) = worker.task.await {
                    warn!(stop_code = %code, error = %e, "Stop worker ended abnormally");
                }
            }
        }
        for stop in &ctx.config.stops {
            if !self.stops.contains_key(&stop.stop_code) {
                self.spawn_stop(&ctx, &stop.stop_code);
            }
        }
        info!(version, stops = self.stops.len(), "Configuration reloaded");
        Ok(())
    }

    /// Removes cached snapshots for one stop or all stops. Returns how many were removed.
    pub async fn clear_cache(&self, stop_code: Option<&str>) -> usize {
        let (reply, rx) = oneshot::channel();
        let msg = SinkMessage::ClearCache {
            stop_code: stop_code.map(str::to_string),
            reply,
        };
        if self.sink_tx.send(msg).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn cache_info(&self) -> CacheInfo {
        let (reply, rx) = oneshot::channel();
        if self.sink_tx.send(SinkMessage::CacheInfo { reply }).await.is_err() {
            return CacheInfo::disabled();
        }
        rx.await.unwrap_or_else(|_| CacheInfo::disabled())
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        let ctx = self.current();
        let stops = ctx
            .config
            .stops
            .iter()
            .filter_map(|stop| {
                self.status(&stop.stop_code)
                    .map(|status| StopDiagnostics::from_status(&status))
            })
            .collect();

        Diagnostics {
            config: ctx.config.redacted(),
            config_version: ctx.version,
            auth_alarm: self.alarm.is_raised(),
            rate_limiter: ctx.fetcher.limiter().status(),
            cache: self.cache_info().await,
            stops,
        }
    }

    /// Cancels in-flight polls, waits for every worker to exit and flushes the cache.
    pub async fn stop(self) {
        self.shutdown_tx.send_replace(true);
        for (code, worker) in self.stops {
            if let Err(e) = worker.task.await {
                warn!(stop_code = %code, error = %e, "Stop worker ended abnormally");
            }
        }
        drop(self.sink_tx);
        if let Err(e) = self.sink_task.await {
            warn!(error = %e, "Result sink ended abnormally");
        }
        info!("Stopped stop polling");
    }
}
