//! Owns the current turn: elects the holder, drives the clock and serializes adjudications.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime},
};

use serde::Serialize;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    config::{AcceptPolicy, AppConfig, ExpiryPolicy},
    dao::{
        models::{
            PlayerTurnRecord, RecordFilter, ScoreAdjustment, ScoreRecord, Table, TurnFields,
        },
        storage::StorageError,
        turn_store::TurnStore,
    },
    error::ServiceError,
    services::{
        reconciliation::ReconcileSignal,
        score_ledger::{ScoreLedger, adjustment_id_for_turn},
    },
    state::{
        clock::{Clock, ClockTick, TurnClock},
        election::{ElectedHolder, elect_holder},
        state_machine::{TurnEvent, TurnHolder, TurnPhase, TurnStateMachine, Verdict},
    },
};

const UPDATE_BUFFER: usize = 256;
const CLEAR_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Coarse phase exposed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    /// Nobody holds the turn.
    Idle,
    /// A holder is answering and the countdown runs.
    Active,
    /// A verdict is being written.
    Resolving,
}

/// Read model of the current turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnView {
    /// Player currently answering.
    pub holder: Option<String>,
    /// Deadline in store time.
    pub deadline: Option<SystemTime>,
    /// Store time estimated at the moment the view was taken.
    pub server_now: SystemTime,
    /// Whole seconds left on the countdown.
    pub remaining_seconds: u64,
    /// Coarse phase.
    pub phase: PhaseKind,
    /// Verdict being written while resolving.
    pub verdict: Option<Verdict>,
    /// Bumped on every phase change.
    pub version: usize,
}

/// What happened to the holder's claim after the score was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ClearStatus {
    /// The claim was cleared.
    Cleared,
    /// The claim changed underneath the verdict (reset, re-claim); the stale clear was dropped.
    Superseded,
    /// Retries exhausted; reconciliation keeps retrying the clear.
    Pending,
}

/// Result of one accepted or failed answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjudicationReport {
    /// Player the verdict was about.
    pub player: String,
    /// Verdict applied.
    pub verdict: Verdict,
    /// Score change requested by the verdict.
    pub delta: i64,
    /// Player's total after the adjustment.
    pub points: i64,
    /// The score step found this turn already scored.
    pub duplicate: bool,
    /// Fate of the holder's claim.
    pub clear: ClearStatus,
    /// Holder elected once the claim was cleared.
    pub next_holder: Option<String>,
}

/// Non-fatal problem met while adjudicating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjudicationWarning {
    /// Player the verdict was about.
    pub player: String,
    /// Human readable explanation.
    pub message: String,
}

/// Notifications published to the delivery layer.
#[derive(Debug, Clone)]
pub enum TurnUpdate {
    /// The turn view changed.
    Snapshot(TurnView),
    /// Once-per-second countdown update.
    Tick {
        /// Player answering.
        holder: String,
        /// Whole seconds left.
        remaining_seconds: u64,
    },
    /// The holder ran out of time.
    Expired {
        /// Player whose turn expired.
        holder: String,
    },
    /// Fresh score table.
    Scores(Vec<ScoreRecord>),
    /// Fresh roster.
    Players(Vec<PlayerTurnRecord>),
    /// A verdict was applied.
    Adjudicated(AdjudicationReport),
    /// A verdict completed only partially.
    Warning(AdjudicationWarning),
}

/// One coordinator per game session.
#[derive(Clone)]
pub struct TurnCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    store: Arc<dyn TurnStore>,
    ledger: ScoreLedger,
    config: Arc<AppConfig>,
    shared: RwLock<SharedTurn>,
    /// Serializes every store-mutating or recomputing operation.
    gate: Mutex<Worker>,
    updates: broadcast::Sender<TurnUpdate>,
    disposed: AtomicBool,
}

struct SharedTurn {
    machine: TurnStateMachine,
    clock: TurnClock,
    elected: Option<ElectedHolder>,
}

#[derive(Default)]
struct Worker {
    pending_clear: Option<PendingClear>,
    records: Option<Vec<PlayerTurnRecord>>,
    scores: Option<Vec<ScoreRecord>>,
    announced: bool,
}

/// Clear owed to a claim whose score is already recorded.
#[derive(Debug, Clone)]
struct PendingClear {
    record_id: Uuid,
    player: String,
    turn_started_at: SystemTime,
    verdict: Verdict,
}

impl PendingClear {
    fn still_applies(&self, record: &PlayerTurnRecord) -> bool {
        claim_is_current(record, self.record_id, self.turn_started_at)
    }
}

enum ClearStep {
    Done,
    Superseded,
}

fn claim_is_current(record: &PlayerTurnRecord, record_id: Uuid, started_at: SystemTime) -> bool {
    record.id == record_id && record.is_queued() && record.turn_started_at == Some(started_at)
}

fn fields_after(verdict: Verdict, fields: TurnFields) -> TurnFields {
    match verdict {
        Verdict::Accept => fields.cleared(),
        Verdict::Fail => fields.failed(),
    }
}

fn view_of(shared: &SharedTurn) -> TurnView {
    let snapshot = shared.machine.snapshot();
    let (phase, verdict) = match &snapshot.phase {
        TurnPhase::Idle => (PhaseKind::Idle, None),
        TurnPhase::Active(_) => (PhaseKind::Active, None),
        TurnPhase::Resolving { verdict, .. } => (PhaseKind::Resolving, Some(*verdict)),
    };
    let holder = snapshot.phase.holder();
    TurnView {
        holder: holder.map(|holder| holder.name.clone()),
        deadline: holder.map(|holder| holder.deadline),
        server_now: shared.clock.server_now(),
        remaining_seconds: shared.clock.remaining_seconds(),
        phase,
        verdict,
        version: snapshot.version,
    }
}

fn turn_holder(elected: &ElectedHolder) -> TurnHolder {
    TurnHolder {
        name: elected.name.clone(),
        deadline: elected.deadline,
    }
}

impl TurnCoordinator {
    /// Build an idle coordinator. Call [`TurnCoordinator::start`] before use.
    pub fn new(store: Arc<dyn TurnStore>, config: Arc<AppConfig>, clock: Arc<dyn Clock>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        let ledger = ScoreLedger::new(store.clone(), config.score_retry_attempts);
        let shared = SharedTurn {
            machine: TurnStateMachine::new(),
            clock: TurnClock::new(config.turn_duration, clock),
            elected: None,
        };
        Self {
            inner: Arc::new(CoordinatorInner {
                store,
                ledger,
                config,
                shared: RwLock::new(shared),
                gate: Mutex::new(Worker::default()),
                updates,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Receive every update published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TurnUpdate> {
        self.inner.updates.subscribe()
    }

    /// Initial full read of the store.
    pub async fn start(&self) -> Result<(), ServiceError> {
        self.ensure_live()?;
        let mut worker = self.inner.gate.lock().await;
        self.recompute(&mut worker).await?;
        self.refresh_scores(&mut worker).await
    }

    /// Stop the clock and refuse further work.
    pub async fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        let mut shared = self.inner.shared.write().await;
        if shared.clock.stop() {
            info!("turn clock stopped: session disposed");
        }
    }

    /// Current read model.
    pub async fn snapshot(&self) -> TurnView {
        view_of(&*self.inner.shared.read().await)
    }

    /// Seconds left on the running countdown.
    pub async fn remaining_seconds(&self) -> u64 {
        self.inner.shared.read().await.clock.remaining_seconds()
    }

    /// Player currently holding the turn, if any.
    pub async fn holder(&self) -> Option<String> {
        let shared = self.inner.shared.read().await;
        shared.machine.phase().holder().map(|holder| holder.name.clone())
    }

    /// Apply one reconciliation signal.
    pub async fn reconcile(&self, signal: &ReconcileSignal) -> Result<(), ServiceError> {
        self.ensure_live()?;
        let mut worker = self.inner.gate.lock().await;
        self.retry_pending_clear(&mut worker).await;
        if signal.touches(Table::PlayerTurns) {
            self.recompute(&mut worker).await?;
        }
        if signal.touches(Table::Scores) {
            self.refresh_scores(&mut worker).await?;
        }
        Ok(())
    }

    /// Score the holder's answer as correct.
    pub async fn accept(
        &self,
        expected_holder: Option<&str>,
    ) -> Result<AdjudicationReport, ServiceError> {
        self.adjudicate(Verdict::Accept, expected_holder).await
    }

    /// Score the holder's answer as wrong.
    pub async fn fail(
        &self,
        expected_holder: Option<&str>,
    ) -> Result<AdjudicationReport, ServiceError> {
        self.adjudicate(Verdict::Fail, expected_holder).await
    }

    /// Clear every claim. Returns how many records were cleared.
    pub async fn reset_round(&self) -> Result<usize, ServiceError> {
        self.ensure_live()?;
        let mut worker = self.inner.gate.lock().await;
        if let Some(pending) = worker.pending_clear.take() {
            info!(player = %pending.player, "round reset supersedes deferred turn clear");
        }
        let cleared = self.clear_round().await?;
        info!(cleared, "round reset");
        self.recompute(&mut worker).await?;
        Ok(cleared)
    }

    /// Advance the countdown. Returns the holder whose turn just expired, once per turn.
    pub async fn tick(&self) -> Option<String> {
        let (tick, holder) = {
            let mut shared = self.inner.shared.write().await;
            let tick = shared.clock.tick();
            (tick, shared.clock.holder().map(str::to_owned))
        };
        let holder = holder?;
        match tick {
            ClockTick::Running { remaining_seconds } => {
                self.publish(TurnUpdate::Tick {
                    holder,
                    remaining_seconds,
                });
                None
            }
            ClockTick::Expired => {
                info!(player = %holder, "turn expired");
                self.publish(TurnUpdate::Expired {
                    holder: holder.clone(),
                });
                Some(holder)
            }
            ClockTick::Idle | ClockTick::Overdue => None,
        }
    }

    /// Apply the expiry policy to a turn that ran out.
    pub async fn on_expired(
        &self,
        holder: &str,
    ) -> Result<Option<AdjudicationReport>, ServiceError> {
        match self.inner.config.expiry_policy {
            ExpiryPolicy::AwaitAdjudicator => Ok(None),
            ExpiryPolicy::AutoFail => {
                info!(player = %holder, "expiry treated as a failed answer");
                self.adjudicate(Verdict::Fail, Some(holder)).await.map(Some)
            }
        }
    }

    fn ensure_live(&self) -> Result<(), ServiceError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            Err(ServiceError::InvalidState("turn session disposed".into()))
        } else {
            Ok(())
        }
    }

    fn publish(&self, update: TurnUpdate) {
        // No subscriber is fine.
        let _ = self.inner.updates.send(update);
    }

    async fn adjudicate(
        &self,
        verdict: Verdict,
        expected_holder: Option<&str>,
    ) -> Result<AdjudicationReport, ServiceError> {
        self.ensure_live()?;
        let mut worker = self.inner.gate.lock().await;
        self.recompute(&mut worker).await?;

        let target = {
            let mut shared = self.inner.shared.write().await;
            let target = match (shared.machine.phase(), &shared.elected) {
                (TurnPhase::Active(holder), Some(elected)) if holder.name == elected.name => {
                    elected.clone()
                }
                _ => {
                    return Err(ServiceError::InvalidState(
                        "no active turn to adjudicate".into(),
                    ));
                }
            };
            if let Some(expected) = expected_holder {
                if expected != target.name {
                    return Err(ServiceError::Conflict(format!(
                        "{expected} no longer holds the turn"
                    )));
                }
            }
            shared
                .machine
                .apply(TurnEvent::AdjudicationStarted(verdict))?;
            self.publish(TurnUpdate::Snapshot(view_of(&shared)));
            target
        };
        info!(player = %target.name, ?verdict, "adjudication started");

        let delta = self.inner.config.delta_for(verdict);
        let adjustment_id = adjustment_id_for_turn(target.record_id, target.turn_started_at);
        let scored = tokio::time::timeout(
            self.inner.config.resolution_timeout,
            self.inner.ledger.adjust(&target.name, delta, adjustment_id),
        )
        .await;
        let adjustment = match scored {
            Ok(Ok(adjustment)) => adjustment,
            Ok(Err(err)) => {
                warn!(player = %target.name, error = %err, "score step failed; adjudication aborted");
                self.abort_resolution().await;
                return Err(err.into());
            }
            Err(_) => {
                warn!(player = %target.name, "score step timed out; adjudication aborted");
                self.abort_resolution().await;
                return Err(ServiceError::Timeout);
            }
        };

        let clear = self.clear_after_verdict(&mut worker, &target, verdict).await;
        if verdict == Verdict::Accept
            && self.inner.config.accept_policy == AcceptPolicy::ResetRound
            && clear == ClearStatus::Cleared
        {
            match self.clear_round().await {
                Ok(cleared) => info!(cleared, "accepted answer closed the round"),
                Err(err) => warn!(error = %err, "round reset after accept incomplete"),
            }
        }

        let next_holder = self.finish_resolution(&mut worker).await;
        if let Err(err) = self.refresh_scores(&mut worker).await {
            debug!(error = %err, "score refresh after adjudication deferred");
        }

        let report = AdjudicationReport {
            player: target.name.clone(),
            verdict,
            delta,
            points: adjustment.points(),
            duplicate: matches!(adjustment, ScoreAdjustment::AlreadyApplied { .. }),
            clear,
            next_holder,
        };
        info!(
            player = %report.player,
            ?verdict,
            points = report.points,
            next_holder = ?report.next_holder,
            "adjudication finished"
        );
        self.publish(TurnUpdate::Adjudicated(report.clone()));

        if clear == ClearStatus::Pending {
            self.publish(TurnUpdate::Warning(AdjudicationWarning {
                player: report.player.clone(),
                message: "score recorded; clearing the turn is still being retried".into(),
            }));
            return Err(ServiceError::PartialAdjudication {
                player: report.player,
                points: report.points,
                duplicate: report.duplicate,
            });
        }
        Ok(report)
    }

    async fn abort_resolution(&self) {
        let mut shared = self.inner.shared.write().await;
        match shared.machine.apply(TurnEvent::AdjudicationAborted) {
            Ok(_) => self.publish(TurnUpdate::Snapshot(view_of(&shared))),
            Err(err) => warn!(error = %err, "could not abort adjudication"),
        }
    }

    /// Read every record and overlay a deferred clear, dropping it once superseded.
    async fn read_effective(
        &self,
        worker: &mut Worker,
    ) -> Result<(Vec<PlayerTurnRecord>, SystemTime), StorageError> {
        let mut records = self
            .inner
            .store
            .read_player_records(RecordFilter::All)
            .await?;
        let now = self.inner.store.authoritative_now().await?;

        let mut superseded = false;
        if let Some(pending) = &worker.pending_clear {
            match records
                .iter_mut()
                .find(|record| record.id == pending.record_id)
            {
                Some(record) if pending.still_applies(record) => {
                    let fields = fields_after(pending.verdict, record.turn_fields());
                    let stamped = record.last_updated_at;
                    record.apply_turn_fields(fields, stamped);
                }
                _ => superseded = true,
            }
        }
        if superseded {
            if let Some(pending) = worker.pending_clear.take() {
                info!(player = %pending.player, "deferred turn clear superseded");
            }
        }

        Ok((records, now))
    }

    async fn recompute(&self, worker: &mut Worker) -> Result<(), ServiceError> {
        let (records, now) = self.read_effective(worker).await?;
        let elected = elect_holder(&records, self.inner.config.turn_duration);

        {
            let mut shared = self.inner.shared.write().await;
            shared.clock.resync(now);
            let phase = shared.machine.phase().clone();
            let changed = match (&phase, &elected) {
                (TurnPhase::Resolving { .. }, _) => false,
                (TurnPhase::Active(current), Some(next))
                    if current.name == next.name
                        && current.deadline == next.deadline
                        && shared.clock.is_running() =>
                {
                    false
                }
                (_, Some(next)) => {
                    shared
                        .machine
                        .apply(TurnEvent::HolderElected(turn_holder(next)))?;
                    shared.clock.start(&next.name, next.deadline, now);
                    info!(
                        player = %next.name,
                        drift_ms = shared.clock.drift_ms(),
                        "turn holder elected; clock started"
                    );
                    true
                }
                (TurnPhase::Active(current), None) => {
                    shared.machine.apply(TurnEvent::QueueDrained)?;
                    shared.clock.stop();
                    info!(player = %current.name, "queue drained; clock stopped");
                    true
                }
                (TurnPhase::Idle, None) => false,
            };
            if !phase_is_resolving(&phase) {
                shared.elected = elected;
            }
            if changed || !worker.announced {
                worker.announced = true;
                self.publish(TurnUpdate::Snapshot(view_of(&shared)));
            }
        }

        self.publish_players(worker, records);
        Ok(())
    }

    /// Leave `Resolving` towards the next holder or `Idle`.
    async fn finish_resolution(&self, worker: &mut Worker) -> Option<String> {
        let effective = self.read_effective(worker).await;
        let mut shared = self.inner.shared.write().await;

        let (elected, records) = match effective {
            Ok((records, now)) => {
                let elected = elect_holder(&records, self.inner.config.turn_duration);
                match &elected {
                    Some(next) => {
                        shared.clock.start(&next.name, next.deadline, now);
                    }
                    None => {
                        shared.clock.stop();
                        shared.clock.resync(now);
                    }
                }
                (elected, Some(records))
            }
            Err(err) => {
                warn!(error = %err, "queue unreadable after adjudication; waiting for reconciliation");
                shared.clock.stop();
                (None, None)
            }
        };

        let next = elected.as_ref().map(turn_holder);
        if let Err(err) = shared
            .machine
            .apply(TurnEvent::AdjudicationFinished(next.clone()))
        {
            warn!(error = %err, "could not finish adjudication");
        }
        shared.elected = elected;
        self.publish(TurnUpdate::Snapshot(view_of(&shared)));
        drop(shared);

        if let Some(records) = records {
            self.publish_players(worker, records);
        }
        next.map(|holder| holder.name)
    }

    async fn clear_after_verdict(
        &self,
        worker: &mut Worker,
        target: &ElectedHolder,
        verdict: Verdict,
    ) -> ClearStatus {
        let attempts = self.inner.config.clear_retry_attempts;
        for attempt in 1..=attempts {
            match self
                .try_clear(target.record_id, &target.name, target.turn_started_at, verdict)
                .await
            {
                Ok(ClearStep::Done) => return ClearStatus::Cleared,
                Ok(ClearStep::Superseded) => {
                    info!(player = %target.name, "claim changed during adjudication; stale clear dropped");
                    return ClearStatus::Superseded;
                }
                Err(err) => {
                    warn!(player = %target.name, attempt, attempts, error = %err, "turn clear failed");
                    if attempt < attempts {
                        tokio::time::sleep(CLEAR_RETRY_DELAY * attempt).await;
                    }
                }
            }
        }

        warn!(
            player = %target.name,
            "turn clear retries exhausted; score kept, clear deferred to reconciliation"
        );
        worker.pending_clear = Some(PendingClear {
            record_id: target.record_id,
            player: target.name.clone(),
            turn_started_at: target.turn_started_at,
            verdict,
        });
        ClearStatus::Pending
    }

    /// Check-before-write clear of one scored claim.
    async fn try_clear(
        &self,
        record_id: Uuid,
        player: &str,
        started_at: SystemTime,
        verdict: Verdict,
    ) -> Result<ClearStep, StorageError> {
        let record = self
            .inner
            .store
            .read_player_records(RecordFilter::Name(player.to_owned()))
            .await?
            .into_iter()
            .find(|record| record.id == record_id);
        let Some(record) = record else {
            return Ok(ClearStep::Superseded);
        };
        if !claim_is_current(&record, record_id, started_at) {
            return Ok(ClearStep::Superseded);
        }

        let expected = record.turn_fields();
        let updated = self
            .inner
            .store
            .conditional_update_player_record(record_id, expected, fields_after(verdict, expected))
            .await?;
        Ok(if updated {
            ClearStep::Done
        } else {
            ClearStep::Superseded
        })
    }

    async fn retry_pending_clear(&self, worker: &mut Worker) {
        let Some(pending) = worker.pending_clear.clone() else {
            return;
        };
        match self
            .try_clear(
                pending.record_id,
                &pending.player,
                pending.turn_started_at,
                pending.verdict,
            )
            .await
        {
            Ok(ClearStep::Done) => {
                info!(player = %pending.player, "deferred turn clear applied");
                worker.pending_clear = None;
            }
            Ok(ClearStep::Superseded) => {
                info!(player = %pending.player, "deferred turn clear superseded");
                worker.pending_clear = None;
            }
            Err(err) => {
                debug!(player = %pending.player, error = %err, "deferred turn clear still failing")
            }
        }
    }

    async fn clear_round(&self) -> Result<usize, StorageError> {
        let store = &self.inner.store;
        let records = store.read_player_records(RecordFilter::All).await?;
        let mut cleared = 0;

        for record in records
            .into_iter()
            .filter(|record| record.turn_fields().has_claim_state())
        {
            let mut expected = record.turn_fields();
            for _ in 0..2 {
                if store
                    .conditional_update_player_record(record.id, expected, expected.cleared())
                    .await?
                {
                    cleared += 1;
                    break;
                }
                let fresh = store
                    .read_player_records(RecordFilter::Name(record.name.clone()))
                    .await?
                    .into_iter()
                    .find(|candidate| candidate.id == record.id);
                match fresh {
                    Some(fresh) if fresh.turn_fields().has_claim_state() => {
                        expected = fresh.turn_fields();
                    }
                    _ => break,
                }
            }
        }

        Ok(cleared)
    }

    async fn refresh_scores(&self, worker: &mut Worker) -> Result<(), ServiceError> {
        let scores = self.inner.ledger.scores().await?;
        if worker.scores.as_ref() != Some(&scores) {
            worker.scores = Some(scores.clone());
            self.publish(TurnUpdate::Scores(scores));
        }
        Ok(())
    }

    fn publish_players(&self, worker: &mut Worker, records: Vec<PlayerTurnRecord>) {
        if worker.records.as_ref() != Some(&records) {
            worker.records = Some(records.clone());
            self.publish(TurnUpdate::Players(records));
        }
    }
}

fn phase_is_resolving(phase: &TurnPhase) -> bool {
    matches!(phase, TurnPhase::Resolving { .. })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dao::turn_store::memory::MemoryTurnStore,
        services::{
            buzz_gateway::{BuzzGateway, ClaimOutcome},
            reconciliation::{ResyncReason, SignalSource},
        },
        state::clock::ManualClock,
    };

    const TURN: Duration = Duration::from_secs(15);

    struct Harness {
        clock: ManualClock,
        store: MemoryTurnStore,
        gateway: BuzzGateway,
        coordinator: TurnCoordinator,
    }

    impl Harness {
        fn new(config: AppConfig) -> Self {
            let clock = ManualClock::default();
            let store = MemoryTurnStore::new(Arc::new(clock.clone()));
            let shared: Arc<dyn TurnStore> = Arc::new(store.clone());
            Self {
                gateway: BuzzGateway::new(shared.clone(), true),
                coordinator: TurnCoordinator::new(
                    shared,
                    Arc::new(config),
                    Arc::new(clock.clone()),
                ),
                clock,
                store,
            }
        }

        async fn buzz(&self, name: &str) {
            let outcome = self.gateway.claim(Some(name)).await.unwrap();
            assert!(matches!(outcome, ClaimOutcome::Accepted { .. }), "{outcome:?}");
        }

        async fn sync(&self) {
            let signal = ReconcileSignal {
                source: SignalSource::Resync(ResyncReason::Requested),
                tables: Table::ALL.to_vec(),
                sequence: 0,
            };
            self.coordinator.reconcile(&signal).await.unwrap();
        }

        async fn record(&self, name: &str) -> PlayerTurnRecord {
            self.store
                .read_player_records(RecordFilter::Name(name.into()))
                .await
                .unwrap()
                .remove(0)
        }

        async fn points(&self, name: &str) -> Option<i64> {
            self.store
                .read_scores()
                .await
                .unwrap()
                .into_iter()
                .find(|score| score.player == name)
                .map(|score| score.points)
        }
    }

    #[tokio::test]
    async fn accepted_answer_scores_and_clears_the_turn() {
        let harness = Harness::new(AppConfig::default());
        let t0 = harness.clock.now();
        harness.buzz("alice").await;
        harness.sync().await;

        let view = harness.coordinator.snapshot().await;
        assert_eq!(view.holder.as_deref(), Some("alice"));
        assert_eq!(view.deadline, Some(t0 + TURN));
        assert_eq!(view.phase, PhaseKind::Active);
        assert_eq!(view.remaining_seconds, 15);

        let report = harness.coordinator.accept(None).await.unwrap();
        assert_eq!(report.points, 1);
        assert_eq!(report.clear, ClearStatus::Cleared);
        assert_eq!(report.next_holder, None);
        assert_eq!(harness.points("alice").await, Some(1));

        let record = harness.record("alice").await;
        assert!(!record.has_buzzed);
        assert!(!record.has_failed);
        assert_eq!(record.turn_started_at, None);

        let view = harness.coordinator.snapshot().await;
        assert_eq!(view.holder, None);
        assert_eq!(view.phase, PhaseKind::Idle);
        assert_eq!(view.remaining_seconds, 15);
    }

    #[tokio::test]
    async fn failed_answer_passes_the_turn_on() {
        let harness = Harness::new(AppConfig::default());
        let t0 = harness.clock.now();
        harness.buzz("alice").await;
        harness.clock.advance(Duration::from_secs(2));
        harness.buzz("bob").await;
        harness.sync().await;
        assert_eq!(harness.coordinator.holder().await.as_deref(), Some("alice"));

        let report = harness.coordinator.fail(Some("alice")).await.unwrap();
        assert_eq!(report.next_holder.as_deref(), Some("bob"));
        assert_eq!(harness.points("alice").await, Some(-1));
        assert!(harness.record("alice").await.has_failed);

        let view = harness.coordinator.snapshot().await;
        assert_eq!(view.holder.as_deref(), Some("bob"));
        assert_eq!(view.deadline, Some(t0 + Duration::from_secs(2) + TURN));
        assert_eq!(view.remaining_seconds, 15);
    }

    #[tokio::test]
    async fn stale_expected_holder_is_rejected_without_scoring() {
        let harness = Harness::new(AppConfig::default());
        harness.buzz("alice").await;
        harness.sync().await;

        let err = harness.coordinator.accept(Some("bob")).await.unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
        assert_eq!(harness.points("alice").await, None);
        assert_eq!(
            harness.coordinator.snapshot().await.phase,
            PhaseKind::Active
        );
    }

    #[tokio::test]
    async fn verdict_without_holder_is_invalid() {
        let harness = Harness::new(AppConfig::default());
        harness.sync().await;
        assert!(matches!(
            harness.coordinator.fail(None).await,
            Err(ServiceError::InvalidState(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_clear_never_rescores() {
        let harness = Harness::new(AppConfig::default());
        harness.buzz("alice").await;
        harness.clock.advance(Duration::from_secs(1));
        harness.buzz("bob").await;
        harness.sync().await;
        harness.store.faults().fail_updates(3);

        let err = harness.coordinator.fail(None).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::PartialAdjudication { ref player, points: -1, duplicate: false }
                if player == "alice"
        ));
        // The deferred clear already hides alice from the queue.
        assert_eq!(harness.coordinator.holder().await.as_deref(), Some("bob"));
        assert!(!harness.record("alice").await.has_failed);

        harness.sync().await;
        assert!(harness.record("alice").await.has_failed);
        assert_eq!(harness.points("alice").await, Some(-1));
        assert_eq!(harness.coordinator.holder().await.as_deref(), Some("bob"));
    }

    #[tokio::test(start_paused = true)]
    async fn score_failure_aborts_and_retry_counts_once() {
        let config = AppConfig {
            score_retry_attempts: 1,
            ..AppConfig::default()
        };
        let harness = Harness::new(config);
        harness.buzz("alice").await;
        harness.sync().await;
        // The increment lands but its reply never arrives.
        harness.store.faults().lose_adjustment_acks(1);

        assert!(harness.coordinator.accept(None).await.is_err());
        let view = harness.coordinator.snapshot().await;
        assert_eq!(view.phase, PhaseKind::Active);
        assert_eq!(view.holder.as_deref(), Some("alice"));

        let report = harness.coordinator.accept(None).await.unwrap();
        assert!(report.duplicate);
        assert_eq!(harness.points("alice").await, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_during_adjudication_drops_the_stale_clear() {
        let harness = Harness::new(AppConfig::default());
        harness.buzz("alice").await;
        harness.sync().await;
        harness.store.faults().fail_updates(1);

        let coordinator = harness.coordinator.clone();
        let verdict = tokio::spawn(async move { coordinator.fail(None).await });
        // Let the first clear attempt fail and back off.
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Another replica resets the round directly in the store.
        let record = harness.record("alice").await;
        let fields = record.turn_fields();
        assert!(
            harness
                .store
                .conditional_update_player_record(record.id, fields, fields.cleared())
                .await
                .unwrap()
        );

        let report = verdict.await.unwrap().unwrap();
        assert_eq!(report.clear, ClearStatus::Superseded);
        assert!(!harness.record("alice").await.has_failed);
        assert_eq!(harness.points("alice").await, Some(-1));
    }

    #[tokio::test]
    async fn reset_round_clears_every_claim() {
        let harness = Harness::new(AppConfig::default());
        harness.buzz("alice").await;
        harness.buzz("bob").await;
        harness.sync().await;

        assert_eq!(harness.coordinator.reset_round().await.unwrap(), 2);
        assert_eq!(harness.coordinator.holder().await, None);
        assert!(!harness.record("bob").await.has_buzzed);
    }

    #[tokio::test]
    async fn accept_can_close_the_whole_round() {
        let config = AppConfig {
            accept_policy: AcceptPolicy::ResetRound,
            ..AppConfig::default()
        };
        let harness = Harness::new(config);
        harness.buzz("alice").await;
        harness.clock.advance(Duration::from_secs(1));
        harness.buzz("bob").await;
        harness.sync().await;

        let report = harness.coordinator.accept(None).await.unwrap();
        assert_eq!(report.next_holder, None);
        assert!(!harness.record("bob").await.has_buzzed);
    }

    #[tokio::test]
    async fn expiry_can_fail_the_holder() {
        let config = AppConfig {
            expiry_policy: ExpiryPolicy::AutoFail,
            ..AppConfig::default()
        };
        let harness = Harness::new(config);
        harness.buzz("alice").await;
        harness.sync().await;

        harness.clock.advance(Duration::from_secs(5));
        assert_eq!(harness.coordinator.tick().await, None);
        harness.clock.advance(TURN);
        let expired = harness.coordinator.tick().await.unwrap();
        assert_eq!(expired, "alice");
        assert_eq!(harness.coordinator.tick().await, None);

        let report = harness.coordinator.on_expired(&expired).await.unwrap();
        assert_eq!(report.map(|report| report.verdict), Some(Verdict::Fail));
        assert!(harness.record("alice").await.has_failed);
    }

    #[tokio::test]
    async fn overdue_turn_stops_ticking_until_adjudicated() {
        let harness = Harness::new(AppConfig::default());
        harness.buzz("alice").await;
        harness.sync().await;
        let mut updates = harness.coordinator.subscribe();

        harness.clock.advance(TURN + Duration::from_secs(1));
        assert_eq!(harness.coordinator.tick().await.as_deref(), Some("alice"));
        for _ in 0..3 {
            harness.clock.advance(Duration::from_secs(1));
            assert_eq!(harness.coordinator.tick().await, None);
        }

        let mut published = Vec::new();
        while let Ok(update) = updates.try_recv() {
            match update {
                TurnUpdate::Tick { .. } => published.push("tick"),
                TurnUpdate::Expired { .. } => published.push("expired"),
                _ => {}
            }
        }
        assert_eq!(published, vec!["expired"]);
        assert_eq!(harness.coordinator.holder().await.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn holder_changes_are_published_once() {
        let harness = Harness::new(AppConfig::default());
        let mut updates = harness.coordinator.subscribe();
        harness.buzz("alice").await;
        harness.sync().await;
        harness.sync().await;

        let mut snapshots = Vec::new();
        while let Ok(update) = updates.try_recv() {
            if let TurnUpdate::Snapshot(view) = update {
                snapshots.push(view.holder);
            }
        }
        assert_eq!(snapshots, vec![Some("alice".to_owned())]);
    }

    #[tokio::test]
    async fn disposed_coordinator_refuses_work() {
        let harness = Harness::new(AppConfig::default());
        harness.buzz("alice").await;
        harness.sync().await;
        harness.coordinator.dispose().await;

        assert!(matches!(
            harness.coordinator.accept(None).await,
            Err(ServiceError::InvalidState(_))
        ));
        assert_eq!(harness.coordinator.remaining_seconds().await, 15);
    }
}
