use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::context::{AuthAlarm, ConfigSnapshot, fetch_stop};
use super::sink::SinkMessage;
use crate::aggregate::aggregate;
use crate::config::StopConfig;
use crate::error::{FetchError, ParseError};
use crate::fetch::HttpClient;
use crate::health::{HealthMonitor, HealthReport};
use crate::mapper::map_prediction;
use crate::model::{ErrorKind, ErrorReason, StopSnapshot};
use crate::parser::parse_predictions;

const MAX_START_JITTER_MS: u64 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    Idle,
    Fetching,
    Success,
    Failed,
}

/// What the host sees for one stop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopStatus {
    pub snapshot: StopSnapshot,
    pub health: HealthReport,
    /// `Success` or `Failed` for the last finished poll, `None` before one finishes.
    pub last_outcome: Option<PollState>,
}

/// Runs the fetched body through parse, map and aggregate.
///
/// A well-formed payload with nothing due yields a fresh snapshot with no lines.
pub fn build_snapshot<C: HttpClient>(
    ctx: &ConfigSnapshot<C>,
    stop: &StopConfig,
    body: &[u8],
    now: DateTime<Utc>,
) -> Result<StopSnapshot, ParseError> {
    let predictions = match parse_predictions(body, now) {
        Ok(predictions) => predictions,
        Err(ParseError::Empty) => Vec::new(),
        Err(e) => return Err(e),
    };
    let enriched: Vec<_> = predictions
        .iter()
        .map(|p| map_prediction(p, stop, ctx.config.show_icons))
        .collect();
    let lines = aggregate(&enriched, &ctx.aggregate_options(), now);
    Ok(StopSnapshot::fresh(stop, &ctx.config.agency, lines, now))
}

/// Poll state for one stop. Owns the stop's snapshot exclusively.
#[derive(Debug)]
pub struct StopPoller {
    stop_code: String,
    last_good: Option<StopSnapshot>,
    current: StopSnapshot,
    health: HealthMonitor,
    state: PollState,
    last_outcome: Option<PollState>,
}

impl StopPoller {
    pub fn new(stop: &StopConfig, agency: &str) -> Self {
        Self {
            stop_code: stop.stop_code.clone(),
            last_good: None,
            current: StopSnapshot::pending(stop, agency),
            health: HealthMonitor::new(),
            state: PollState::Idle,
            last_outcome: None,
        }
    }

    /// Uses a cached snapshot as the fallback until a poll succeeds.
    pub fn seed(&mut self, cached: StopSnapshot) {
        if self.last_good.is_none() {
            debug!(stop_code = %self.stop_code, "Seeded last-known-good snapshot from cache");
            self.last_good = Some(cached);
        }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn snapshot(&self) -> &StopSnapshot {
        &self.current
    }

    pub fn status(&self) -> StopStatus {
        StopStatus {
            snapshot: self.current.clone(),
            health: self.health.report(),
            last_outcome: self.last_outcome,
        }
    }

    pub fn reset_health(&mut self) {
        self.health.reset();
    }

    pub fn begin(&mut self) {
        self.state = PollState::Fetching;
    }

    /// Drops an in-flight poll without touching the held snapshot.
    pub fn abandon(&mut self) {
        if self.state == PollState::Fetching {
            debug!(stop_code = %self.stop_code, "Poll cancelled");
        }
        self.state = PollState::Idle;
    }

    /// Commits the outcome of a poll and returns the new status.
    pub fn complete<C: HttpClient>(
        &mut self,
        ctx: &ConfigSnapshot<C>,
        stop: &StopConfig,
        fetched: Result<Bytes, FetchError>,
        alarm: &AuthAlarm,
        now: DateTime<Utc>,
    ) -> StopStatus {
        let built = match &fetched {
            Ok(body) => build_snapshot(ctx, stop, body, now).map_err(|e| ErrorReason::from(&e)),
            Err(e) => Err(ErrorReason::from(e)),
        };

        match built {
            Ok(snapshot) => {
                debug!(stop_code = %self.stop_code, lines = snapshot.lines.len(), "Poll succeeded");
                self.health.record_success(now);
                alarm.clear();
                self.last_good = Some(snapshot.clone());
                self.current = snapshot;
                self.state = PollState::Success;
            }
            Err(reason) => {
                self.report_failure(&reason, alarm);
                self.health.record_failure(now, reason.clone());
                self.current = match self.last_good.clone() {
                    Some(good) => good.into_stale(reason),
                    None => StopSnapshot::unavailable(stop, &ctx.config.agency, reason),
                };
                self.state = PollState::Failed;
            }
        }

        self.last_outcome = Some(self.state);
        let status = self.status();
        self.state = PollState::Idle;
        status
    }

    fn report_failure(&self, reason: &ErrorReason, alarm: &AuthAlarm) {
        match reason.kind {
            ErrorKind::AuthError if alarm.raise() => {
                error!(stop_code = %self.stop_code, reason = %reason.message, "API key rejected; polls will keep failing until the key is fixed");
            }
            ErrorKind::AuthError => {
                debug!(stop_code = %self.stop_code, reason = %reason.message, "API key still rejected");
            }
            _ => {
                warn!(
                    stop_code = %self.stop_code,
                    kind = ?reason.kind,
                    reason = %reason.message,
                    stale = self.last_good.is_some(),
                    "Poll failed"
                );
            }
        }
    }

    /// One complete poll, without cancellation.
    pub async fn poll_once<C: HttpClient>(
        &mut self,
        ctx: &ConfigSnapshot<C>,
        stop: &StopConfig,
        alarm: &AuthAlarm,
    ) -> StopStatus {
        self.begin();
        let fetched = fetch_stop(ctx, &stop.stop_code).await;
        self.complete(ctx, stop, fetched, alarm, Utc::now())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopCommand {
    Refresh,
    ResetHealth,
}

/// Resolves once shutdown is signalled or the handle is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

enum Interrupt {
    Fetched(Result<Bytes, FetchError>),
    Reconfigured,
    Shutdown,
}

enum PollExit {
    Done,
    Removed,
    Shutdown,
}

/// Worker loop for one stop: its own timer, strictly sequential polls.
pub(crate) struct StopTask<C> {
    pub stop_code: String,
    pub poller: StopPoller,
    pub config_rx: watch::Receiver<Arc<ConfigSnapshot<C>>>,
    pub shutdown_rx: watch::Receiver<bool>,
    pub commands: mpsc::Receiver<StopCommand>,
    pub status_tx: watch::Sender<StopStatus>,
    pub sink_tx: mpsc::Sender<SinkMessage>,
    pub alarm: Arc<AuthAlarm>,
}

impl<C: HttpClient + 'static> StopTask<C> {
    pub async fn run(mut self) {
        self.seed_from_cache().await;

        let mut ctx = self.config_rx.borrow_and_update().clone();
        if ctx.config.stop(&self.stop_code).is_none() {
            return;
        }
        let mut ticker = self.ticker(&ctx, false);
        let mut ticker_version = ctx.version;

        loop {
            let poll = tokio::select! {
                _ = shutdown_requested(&mut self.shutdown_rx) => break,
                changed = self.config_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    ctx = self.config_rx.borrow_and_update().clone();
                    if ctx.config.stop(&self.stop_code).is_none() {
                        info!("Stop removed from configuration");
                        break;
                    }
                    false
                }
                cmd = self.commands.recv() => match cmd {
                    Some(StopCommand::Refresh) => {
                        debug!("Manual refresh");
                        true
                    }
                    Some(StopCommand::ResetHealth) => {
                        self.poller.reset_health();
                        self.publish_local();
                        false
                    }
                    None => break,
                },
                _ = ticker.tick() => true,
            };

            if poll {
                match self.poll(&mut ctx).await {
                    PollExit::Done => {}
                    PollExit::Removed => {
                        info!("Stop removed from configuration");
                        break;
                    }
                    PollExit::Shutdown => break,
                }
            }

            if ctx.version != ticker_version {
                ticker = self.ticker(&ctx, poll);
                ticker_version = ctx.version;
            }
        }
        debug!("Stop worker exiting");
    }

    async fn seed_from_cache(&mut self) {
        let (reply, rx) = oneshot::channel();
        let asked = self
            .sink_tx
            .send(SinkMessage::Seed {
                stop_code: self.stop_code.clone(),
                reply,
            })
            .await;
        if asked.is_ok() {
            if let Ok(Some(cached)) = rx.await {
                self.poller.seed(cached);
            }
        }
    }

    /// Periodic timer, offset so stops of one configuration do not all fire
    /// together. After a poll the first tick is a full period away.
    fn ticker(&self, ctx: &ConfigSnapshot<C>, just_polled: bool) -> Interval {
        let period = ctx.config.poll_interval();
        let offset = if just_polled {
            period
        } else {
            let stops = ctx.config.stops.len().max(1) as u32;
            let index = ctx
                .config
                .stops
                .iter()
                .position(|s| s.stop_code == self.stop_code)
                .unwrap_or(0) as u32;
            let jitter = Duration::from_millis(rand::rng().random_range(0..=MAX_START_JITTER_MS));
            start_offset(period, index, stops).saturating_add(jitter)
        };

        let now = Instant::now();
        let start = now.checked_add(offset).unwrap_or(now);
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    }

    /// Polls until an outcome is committed. A reload mid-poll abandons the
    /// attempt and starts over under the new configuration; shutdown abandons it.
    async fn poll(&mut self, ctx: &mut Arc<ConfigSnapshot<C>>) -> PollExit {
        loop {
            let Some(stop) = ctx.config.stop(&self.stop_code).cloned() else {
                return PollExit::Removed;
            };
            let current = Arc::clone(ctx);

            self.poller.begin();
            let interrupt = tokio::select! {
                fetched = fetch_stop(&current, &self.stop_code) => Interrupt::Fetched(fetched),
                changed = self.config_rx.changed() => match changed {
                    Ok(()) => Interrupt::Reconfigured,
                    Err(_) => Interrupt::Shutdown,
                },
                _ = shutdown_requested(&mut self.shutdown_rx) => Interrupt::Shutdown,
            };

            match interrupt {
                Interrupt::Fetched(fetched) => {
                    let status = self
                        .poller
                        .complete(&current, &stop, fetched, &self.alarm, Utc::now());
                    self.publish(status).await;
                    self.drain_commands();
                    return PollExit::Done;
                }
                Interrupt::Reconfigured => {
                    self.poller.abandon();
                    *ctx = self.config_rx.borrow_and_update().clone();
                    debug!(version = ctx.version, "Configuration changed mid-poll, restarting");
                }
                Interrupt::Shutdown => {
                    self.poller.abandon();
                    return PollExit::Shutdown;
                }
            }
        }
    }

    /// Refreshes requested while a poll was in flight are satisfied by it.
    fn drain_commands(&mut self) {
        let mut reset = false;
        while let Ok(cmd) = self.commands.try_recv() {
            if cmd == StopCommand::ResetHealth {
                reset = true;
            }
        }
        if reset {
            self.poller.reset_health();
            self.publish_local();
        }
    }

    fn publish_local(&self) {
        self.status_tx.send_replace(self.poller.status());
    }

    async fn publish(&self, status: StopStatus) {
        self.status_tx.send_replace(status.clone());
        if self.sink_tx.send(SinkMessage::Update(status)).await.is_err() {
            debug!("Result sink closed, update not recorded");
        }
    }
}

/// Share of `period` that stop number `index` of `stops` waits before its first tick.
fn start_offset(period: Duration, index: u32, stops: u32) -> Duration {
    (period / stops.max(1)).saturating_mul(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::model::Freshness;
    use crate::test_support::{Reply, ScriptedClient, payload};
    use chrono::SecondsFormat;

    fn config() -> ServiceConfig {
        let mut stop = StopConfig::new("13543");
        stop.line_names.insert("24".into(), "24 Divisadero".into());
        ServiceConfig {
            api_key: "k".into(),
            show_icons: false,
            time_format: crate::config::TimeFormat::Verbose,
            stops: vec![stop],
            ..Default::default()
        }
    }

    fn ctx(client: ScriptedClient) -> ConfigSnapshot<ScriptedClient> {
        ConfigSnapshot::build(1, config(), &move |_: &ServiceConfig| Ok(client.clone())).unwrap()
    }

    fn at(offset_secs: i64) -> String {
        (Utc::now() + chrono::TimeDelta::seconds(offset_secs)).to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    fn good_body() -> String {
        let (later, sooner) = (at(15 * 60 + 20), at(3 * 60 + 20));
        payload(&[("24", "Jackson St", later.as_str()), ("24", "Jackson St", sooner.as_str())])
    }

    #[tokio::test]
    async fn test_success_produces_fresh_snapshot() {
        let ctx = ctx(ScriptedClient::new(vec![Reply::ok(good_body())]));
        let stop = config().stops[0].clone();
        let mut poller = StopPoller::new(&stop, "SF");
        assert_eq!(poller.snapshot().freshness, Freshness::Pending);

        let status = poller.poll_once(&ctx, &stop, &AuthAlarm::default()).await;

        assert_eq!(status.last_outcome, Some(PollState::Success));
        assert_eq!(poller.state(), PollState::Idle);
        let snapshot = status.snapshot;
        assert_eq!(snapshot.freshness, Freshness::Fresh);
        assert_eq!(snapshot.error, None);
        assert_eq!(snapshot.lines[0].line, "24 Divisadero");
        let times: Vec<_> = snapshot.lines[0].arrivals.iter().map(|a| a.formatted_time.as_str()).collect();
        assert_eq!(times, ["3 min", "15 min"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_without_prior_data() {
        let client = ScriptedClient::new(vec![Reply::status(401)]);
        let ctx = ctx(client.clone());
        let stop = config().stops[0].clone();
        let mut poller = StopPoller::new(&stop, "SF");
        let alarm = AuthAlarm::default();

        let status = poller.poll_once(&ctx, &stop, &alarm).await;

        assert_eq!(client.calls(), 1);
        assert_eq!(status.last_outcome, Some(PollState::Failed));
        assert_eq!(status.snapshot.freshness, Freshness::Unavailable);
        assert!(status.snapshot.lines.is_empty());
        assert_eq!(status.snapshot.error.as_ref().unwrap().kind, ErrorKind::AuthError);
        assert!(alarm.is_raised());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_serve_last_good_as_stale() {
        let client = ScriptedClient::new(vec![Reply::ok(good_body())]);
        let ctx = ctx(client);
        let stop = config().stops[0].clone();
        let mut poller = StopPoller::new(&stop, "SF");
        let alarm = AuthAlarm::default();

        let good = poller.poll_once(&ctx, &stop, &alarm).await.snapshot;
        for _ in 0..3 {
            let status = poller.poll_once(&ctx, &stop, &alarm).await;
            let snapshot = status.snapshot;
            assert_eq!(snapshot.freshness, Freshness::Stale);
            assert_eq!(snapshot.lines, good.lines);
            assert_eq!(snapshot.last_updated, good.last_updated);
            assert_eq!(snapshot.error.as_ref().unwrap().kind, ErrorKind::TransportError);
        }
        assert_eq!(poller.status().health.consecutive_failures, 3);
    }

    #[tokio::test]
    async fn test_malformed_payload_keeps_previous_data() {
        let ctx = ctx(ScriptedClient::new(vec![Reply::ok(good_body()), Reply::ok("<html>oops</html>")]));
        let stop = config().stops[0].clone();
        let mut poller = StopPoller::new(&stop, "SF");
        let alarm = AuthAlarm::default();

        poller.poll_once(&ctx, &stop, &alarm).await;
        let status = poller.poll_once(&ctx, &stop, &alarm).await;

        assert_eq!(status.snapshot.freshness, Freshness::Stale);
        assert_eq!(status.snapshot.error.as_ref().unwrap().kind, ErrorKind::MalformedPayload);
        assert_eq!(status.snapshot.arrival_count(), 2);
    }

    #[tokio::test]
    async fn test_empty_payload_is_fresh_with_no_lines() {
        let ctx = ctx(ScriptedClient::new(vec![Reply::ok(r#"{"ServiceDelivery":{}}"#)]));
        let stop = config().stops[0].clone();
        let mut poller = StopPoller::new(&stop, "SF");

        let status = poller.poll_once(&ctx, &stop, &AuthAlarm::default()).await;

        assert_eq!(status.snapshot.freshness, Freshness::Fresh);
        assert!(status.snapshot.lines.is_empty());
        assert_eq!(status.snapshot.error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seeded_snapshot_is_served_on_failure() {
        let ctx = ctx(ScriptedClient::new(vec![Reply::status(500)]));
        let stop = config().stops[0].clone();
        let cached = StopSnapshot::fresh(&stop, "SF", Vec::new(), Utc::now());
        let mut poller = StopPoller::new(&stop, "SF");
        poller.seed(cached.clone());

        let status = poller.poll_once(&ctx, &stop, &AuthAlarm::default()).await;

        assert_eq!(status.snapshot.freshness, Freshness::Stale);
        assert_eq!(status.snapshot.last_updated, cached.last_updated);
    }

    #[test]
    fn test_start_offsets_spread_over_period() {
        let period = Duration::from_secs(60);
        assert_eq!(start_offset(period, 0, 3), Duration::ZERO);
        assert_eq!(start_offset(period, 2, 3), Duration::from_secs(40));
        assert_eq!(start_offset(period, 0, 0), Duration::ZERO);

        let huge = Duration::from_secs(u64::MAX);
        assert!(start_offset(huge, 1, 2) < huge);
    }

    #[test]
    fn test_abandon_leaves_snapshot_untouched() {
        let stop = config().stops[0].clone();
        let mut poller = StopPoller::new(&stop, "SF");
        let before = poller.snapshot().clone();
        poller.begin();
        assert_eq!(poller.state(), PollState::Fetching);
        poller.abandon();
        assert_eq!(poller.state(), PollState::Idle);
        assert_eq!(poller.snapshot(), &before);
        assert_eq!(poller.status().last_outcome, None);
    }
}
