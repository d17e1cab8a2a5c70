//! Orchestrator
//!
//! Runs campaigns: one profile against one target, bounded by count or
//! duration. Each campaign is its own tokio task with its own factory,
//! scheduler and cancellation token; campaigns share only the read-only
//! profile and the process-wide recorder/dispatcher pair.
//!
//! State machine:
//! ```text
//! Pending -> Running -> Completed
//!                    -> Failed
//!                    -> Cancelling -> Completed
//! ```

use crate::dispatcher::{CampaignNotice, NoticeKind, ReportDispatcher};
use crate::emitter::Emitter;
use crate::error::CampaignError;
use crate::factory::PacketFactory;
use crate::metrics::SurgeMetrics;
use crate::profile::{Profile, ProfileCatalog, RunLimit};
use crate::scheduler::RateScheduler;
use crate::target::{Endpoint, Target, local_address_for};
use crate::telemetry::{Outcome, TelemetryRecorder};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A campaign further behind schedule than this stops catching up and
/// re-anchors its deadlines at the current time.
const MAX_SCHEDULE_LAG: Duration = Duration::from_secs(1);

/// Finished campaigns kept for status queries before the oldest are dropped.
pub const DEFAULT_RETAINED_CAMPAIGNS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CampaignState {
    Pending,
    Running,
    Cancelling,
    Completed,
    Failed,
}

impl CampaignState {
    pub fn can_transition(self, next: CampaignState) -> bool {
        use CampaignState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelling)
                | (Cancelling, Completed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CampaignState::Completed | CampaignState::Failed)
    }
}

/// Start request from the control surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignRequest {
    pub profile: String,
    pub target: String,
    /// Overrides the profile's run limit when set (with `duration_secs`
    /// unset).
    #[serde(default)]
    pub count: Option<u64>,
    #[serde(default)]
    pub duration_secs: Option<f64>,
    /// Fixed seed for a reproducible unit sequence.
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Snapshot of one campaign for status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignStatus {
    pub id: Uuid,
    pub profile: String,
    pub target: String,
    pub state: CampaignState,
    pub units_emitted: u64,
    pub units_failed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    pub seed: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct Timeline {
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

struct Campaign {
    id: Uuid,
    profile: Arc<Profile>,
    target: String,
    limit: RunLimit,
    seed: u64,
    state: watch::Sender<CampaignState>,
    units_emitted: AtomicU64,
    units_failed: AtomicU64,
    timeline: Mutex<Timeline>,
    token: CancellationToken,
}

impl Campaign {
    fn state(&self) -> CampaignState {
        *self.state.borrow()
    }

    /// Apply a forward transition. Returns false if it is not allowed from
    /// the current state.
    fn transition(&self, next: CampaignState) -> bool {
        let mut from = None;
        let applied = self.state.send_if_modified(|state| {
            if state.can_transition(next) {
                from = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });
        if let Some(from) = from {
            info!(campaign = %self.id, from = ?from, to = ?next, "Campaign state changed");
            let mut timeline = self.timeline.lock();
            match next {
                CampaignState::Running => timeline.started_at = Some(Utc::now()),
                CampaignState::Completed | CampaignState::Failed => {
                    timeline.ended_at = Some(Utc::now())
                }
                _ => {}
            }
        }
        applied
    }

    fn status(&self) -> CampaignStatus {
        let timeline = self.timeline.lock();
        let (count, duration_secs) = match self.limit {
            RunLimit::Count(n) => (Some(n), None),
            RunLimit::Duration(d) => (None, Some(d.as_secs_f64())),
        };
        CampaignStatus {
            id: self.id,
            profile: self.profile.name().to_string(),
            target: self.target.clone(),
            state: self.state(),
            units_emitted: self.units_emitted.load(Ordering::Relaxed),
            units_failed: self.units_failed.load(Ordering::Relaxed),
            count,
            duration_secs,
            seed: self.seed,
            started_at: timeline.started_at,
            ended_at: timeline.ended_at,
            error: timeline.error.clone(),
        }
    }

    /// End the campaign on a fatal error. One that is already being stopped
    /// can only complete, so it does, keeping the error.
    fn fail(&self, reason: String) -> NoticeKind {
        self.timeline.lock().error = Some(reason);
        if self.transition(CampaignState::Failed) {
            return NoticeKind::Failed;
        }
        self.transition(CampaignState::Cancelling);
        self.transition(CampaignState::Completed);
        NoticeKind::Stopped
    }

    fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.timeline.lock().ended_at
    }

    fn notice(&self, kind: NoticeKind, reason: Option<String>) -> CampaignNotice {
        CampaignNotice {
            kind,
            campaign_id: self.id,
            profile: self.profile.name().to_string(),
            target: self.target.clone(),
            units_emitted: self.units_emitted.load(Ordering::Relaxed),
            reason,
            timestamp: Utc::now(),
        }
    }
}

/// What a campaign task needs, cloned out of the orchestrator.
struct CampaignContext {
    campaign: Arc<Campaign>,
    endpoint: Endpoint,
    source: std::net::IpAddr,
    emitter: Arc<dyn Emitter>,
    recorder: Arc<TelemetryRecorder>,
    dispatcher: Arc<ReportDispatcher>,
    metrics: Option<Arc<SurgeMetrics>>,
}

pub struct Orchestrator {
    catalog: Arc<ProfileCatalog>,
    emitter: Arc<dyn Emitter>,
    recorder: Arc<TelemetryRecorder>,
    dispatcher: Arc<ReportDispatcher>,
    metrics: Option<Arc<SurgeMetrics>>,
    campaigns: RwLock<HashMap<Uuid, Arc<Campaign>>>,
    /// Campaign tasks. Pushed and collected under this lock together with
    /// the root cancellation, so shutdown never misses one.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    retained: usize,
    root: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        catalog: Arc<ProfileCatalog>,
        emitter: Arc<dyn Emitter>,
        recorder: Arc<TelemetryRecorder>,
        dispatcher: Arc<ReportDispatcher>,
    ) -> Self {
        Self {
            catalog,
            emitter,
            recorder,
            dispatcher,
            metrics: None,
            campaigns: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            retained: DEFAULT_RETAINED_CAMPAIGNS,
            root: CancellationToken::new(),
        }
    }

    /// Keep at most `retained` finished campaigns.
    pub fn with_retention(mut self, retained: usize) -> Self {
        self.retained = retained;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<SurgeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn catalog(&self) -> &ProfileCatalog {
        &self.catalog
    }

    /// Validate the request, resolve the target and launch the campaign.
    ///
    /// Request errors (unknown profile, bad limit, malformed target) are
    /// returned without creating a campaign. An unresolvable target creates
    /// a campaign that ends `Failed` without emitting, or `Completed` if it
    /// was stopped while the lookup ran.
    pub async fn start(&self, request: CampaignRequest) -> Result<Uuid, CampaignError> {
        if self.root.is_cancelled() {
            return Err(CampaignError::ShuttingDown);
        }

        let profile = self.catalog.get(&request.profile)?;
        let limit = if request.count.is_some() || request.duration_secs.is_some() {
            RunLimit::from_parts(request.count, request.duration_secs)?
        } else {
            profile.limit()
        };
        let target = Target::parse(&request.target)?;
        let seed = request.seed.unwrap_or_else(rand::random);

        let (state, _) = watch::channel(CampaignState::Pending);
        let campaign = Arc::new(Campaign {
            id: Uuid::new_v4(),
            profile,
            target: target.to_string(),
            limit,
            seed,
            state,
            units_emitted: AtomicU64::new(0),
            units_failed: AtomicU64::new(0),
            timeline: Mutex::new(Timeline::default()),
            token: self.root.child_token(),
        });
        let id = campaign.id;
        {
            let mut campaigns = self.campaigns.write();
            prune_finished(&mut campaigns, self.retained);
            campaigns.insert(id, Arc::clone(&campaign));
        }
        campaign.transition(CampaignState::Running);

        let address = match target.resolve().await {
            Ok(address) => address,
            Err(e) => {
                error!(campaign = %id, target = %target, error = %e, "Campaign failed to start");
                let kind = campaign.fail(e.to_string());
                self.dispatcher.notify(campaign.notice(kind, Some(e.to_string())));
                return Err(e);
            }
        };
        let source = local_address_for(address).await;

        info!(
            campaign = %id,
            profile = %campaign.profile.name(),
            target = %campaign.target,
            %address,
            seed,
            limit = ?limit,
            "Campaign started"
        );
        self.dispatcher.notify(campaign.notice(NoticeKind::Started, None));

        let ctx = CampaignContext {
            campaign: Arc::clone(&campaign),
            endpoint: Endpoint {
                address,
                port: target.port,
            },
            source,
            emitter: Arc::clone(&self.emitter),
            recorder: Arc::clone(&self.recorder),
            dispatcher: Arc::clone(&self.dispatcher),
            metrics: self.metrics.clone(),
        };
        let mut tasks = self.tasks.lock();
        if self.root.is_cancelled() {
            drop(tasks);
            warn!(campaign = %id, "Engine shut down before the campaign could run");
            campaign.transition(CampaignState::Cancelling);
            campaign.transition(CampaignState::Completed);
            self.dispatcher.notify(campaign.notice(NoticeKind::Stopped, None));
            return Err(CampaignError::ShuttingDown);
        }
        tasks.retain(|t| !t.is_finished());
        tasks.push(tokio::spawn(supervise(ctx)));

        Ok(id)
    }

    fn campaign(&self, id: Uuid) -> Result<Arc<Campaign>, CampaignError> {
        self.campaigns
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| CampaignError::UnknownCampaign(id.to_string()))
    }

    /// Request cooperative cancellation. The in-flight unit, if any, is
    /// allowed to finish. Stopping a finished campaign is a no-op.
    pub fn stop(&self, id: Uuid) -> Result<CampaignStatus, CampaignError> {
        let campaign = self.campaign(id)?;
        if campaign.transition(CampaignState::Cancelling) {
            campaign.token.cancel();
        } else {
            debug!(campaign = %id, state = ?campaign.state(), "Stop ignored");
        }
        Ok(campaign.status())
    }

    pub fn status(&self, id: Uuid) -> Result<CampaignStatus, CampaignError> {
        Ok(self.campaign(id)?.status())
    }

    /// All campaigns, oldest first.
    pub fn status_all(&self) -> Vec<CampaignStatus> {
        let mut all: Vec<CampaignStatus> =
            self.campaigns.read().values().map(|c| c.status()).collect();
        all.sort_by_key(|s| s.started_at);
        all
    }

    /// Wait until the campaign reaches a terminal state.
    pub async fn wait(&self, id: Uuid) -> Result<CampaignStatus, CampaignError> {
        let campaign = self.campaign(id)?;
        let mut rx = campaign.state.subscribe();
        // the sender lives in `campaign`, so the channel cannot close here
        let _ = rx.wait_for(|state| state.is_terminal()).await;
        Ok(campaign.status())
    }

    pub fn running(&self) -> usize {
        self.campaigns
            .read()
            .values()
            .filter(|c| !c.state().is_terminal())
            .count()
    }

    /// Cancel every campaign and wait for their tasks to finish.
    pub async fn shutdown(&self) {
        let handles = {
            let mut tasks = self.tasks.lock();
            self.root.cancel();
            std::mem::take(&mut *tasks)
        };
        info!(campaigns = handles.len(), "Waiting for campaigns to stop");
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Campaign task ended abnormally");
            }
        }
    }
}

/// Drop the oldest finished campaigns until at most `retained` remain.
fn prune_finished(campaigns: &mut HashMap<Uuid, Arc<Campaign>>, retained: usize) {
    let mut finished: Vec<(Option<DateTime<Utc>>, Uuid)> = campaigns
        .values()
        .filter(|c| c.state().is_terminal())
        .map(|c| (c.ended_at(), c.id))
        .collect();
    if finished.len() <= retained {
        return;
    }
    finished.sort_unstable();
    let excess = finished.len() - retained;
    for (_, id) in finished.into_iter().take(excess) {
        campaigns.remove(&id);
    }
    debug!(dropped = excess, "Pruned finished campaigns");
}

/// Runs the campaign on its own task so a panic ends it `Failed` instead of
/// leaving it `Running`.
async fn supervise(ctx: CampaignContext) {
    let campaign = Arc::clone(&ctx.campaign);
    let dispatcher = Arc::clone(&ctx.dispatcher);
    if let Err(e) = tokio::spawn(run_campaign(ctx)).await {
        let reason = format!("campaign task aborted: {e}");
        error!(campaign = %campaign.id, error = %e, "Campaign task aborted");
        let kind = campaign.fail(reason.clone());
        dispatcher.notify(campaign.notice(kind, Some(reason)));
    }
}

/// Keeps `campaigns_running` honest even if the campaign task unwinds.
struct RunningGauge(Option<Arc<SurgeMetrics>>);

impl RunningGauge {
    fn enter(metrics: Option<Arc<SurgeMetrics>>) -> Self {
        if let Some(m) = &metrics {
            m.campaigns_running.inc();
        }
        Self(metrics)
    }
}

impl Drop for RunningGauge {
    fn drop(&mut self) {
        if let Some(m) = &self.0 {
            m.campaigns_running.dec();
        }
    }
}

async fn run_campaign(ctx: CampaignContext) {
    let CampaignContext {
        campaign,
        endpoint,
        source,
        emitter,
        recorder,
        dispatcher,
        metrics,
    } = ctx;
    let profile = Arc::clone(&campaign.profile);
    let mut factory = PacketFactory::new(campaign.seed, source);
    let mut scheduler = RateScheduler::new(&profile, campaign.seed);
    let gauge = RunningGauge::enter(metrics);

    let started = Instant::now();
    let end = match campaign.limit {
        RunLimit::Duration(d) => Some(started + d),
        RunLimit::Count(_) => None,
    };
    let mut deadline = started;
    let mut seq: u64 = 0;

    loop {
        if campaign.token.is_cancelled() {
            break;
        }
        if let RunLimit::Count(n) = campaign.limit {
            if seq >= n {
                break;
            }
        }

        deadline = match deadline.checked_add(scheduler.next_delay()) {
            Some(next) => next,
            None => {
                warn!(campaign = %campaign.id, "Next emission lies beyond the clock range");
                break;
            }
        };
        if end.is_some_and(|end| deadline > end) {
            break;
        }
        let now = Instant::now();
        if now.saturating_duration_since(deadline) > MAX_SCHEDULE_LAG {
            debug!(
                campaign = %campaign.id,
                lag_ms = (now - deadline).as_millis() as u64,
                "Campaign behind schedule, re-anchoring"
            );
            deadline = now;
        }

        tokio::select! {
            biased;
            _ = campaign.token.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => {}
        }

        let unit = factory.build(&profile, &endpoint, seq);
        let event = emitter
            .send(&unit)
            .await
            .with_campaign(campaign.id, campaign.target.clone());
        if event.outcome == Outcome::Failed {
            campaign.units_failed.fetch_add(1, Ordering::Relaxed);
        }
        recorder.record(event);

        seq += 1;
        campaign.units_emitted.store(seq, Ordering::Relaxed);
    }

    drop(gauge);

    let cancelled = campaign.token.is_cancelled();
    if cancelled {
        // engine shutdown cancels without going through stop()
        campaign.transition(CampaignState::Cancelling);
    }
    campaign.transition(CampaignState::Completed);

    let kind = if cancelled {
        NoticeKind::Stopped
    } else {
        NoticeKind::Completed
    };
    info!(
        campaign = %campaign.id,
        units = seq,
        failed = campaign.units_failed.load(Ordering::Relaxed),
        elapsed_ms = started.elapsed().as_millis() as u64,
        cancelled,
        "Campaign finished"
    );
    dispatcher.notify(campaign.notice(kind, None));
}
