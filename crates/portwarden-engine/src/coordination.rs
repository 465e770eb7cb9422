/*!
 * Coordination level (System2).
 *
 * The [`ResourceArbiter`] serializes access to shared resources, in
 * practice an RS-485 bus that several ports transmit on. At most one
 * [`Grant`] per resource exists at a time; dropping it hands the resource
 * to the next waiter chosen by the active [`ArbitrationStrategy`]. Ties go
 * to the lowest requester id.
 *
 * The System2 governor watches for waiters older than the starvation bound
 * and moves them to the head of the next decision.
 */
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::{self, Instant};
use tracing::{debug, info};

use portwarden_core::config::ArbitrationStrategy;
use portwarden_core::error::Error as CoreError;
use portwarden_core::types::Id;
use portwarden_core::utils::bounded;

use crate::error::{Error, Result};
use crate::governor::{ControlStrategy, Role, Sensed};
use crate::meta::ParameterStore;
use crate::psrlv::{ResponseOutcome, Severity, ValidationOutcome};

/// Priority assumed for requesters without one
pub const DEFAULT_PRIORITY: u32 = 100;

/// Arbitration settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArbiterPolicy {
    /// Choice among waiters
    pub strategy: ArbitrationStrategy,
    /// A waiter older than this is starving
    pub starvation: Duration,
}

#[derive(Debug)]
struct Holder {
    requester: Id,
    ticket: u64,
    since: Instant,
}

#[derive(Debug)]
struct Waiter {
    requester: Id,
    ticket: u64,
    since: Instant,
    tx: oneshot::Sender<Grant>,
}

#[derive(Debug, Default)]
struct ResourceState {
    holder: Option<Holder>,
    last_holder: Option<Id>,
    waiters: Vec<Waiter>,
    boosted: Option<u64>,
}

#[derive(Debug, Default)]
struct ArbiterState {
    resources: HashMap<String, ResourceState>,
    priorities: HashMap<Id, u32>,
    utilization: HashMap<Id, Duration>,
    next_ticket: u64,
}

/// A waiter that has exceeded the starvation bound
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StarvingWaiter {
    /// Contended resource
    pub resource: String,
    /// Who is waiting
    pub requester: Id,
    /// Waiter ticket
    pub ticket: u64,
    /// How long it has waited, in milliseconds
    pub waited_ms: u64,
}

/// Point-in-time view of one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Resource name
    pub resource: String,
    /// Current holder
    pub holder: Option<Id>,
    /// Queued requesters in arrival order
    pub waiting: Vec<Id>,
}

/// Serializes access to named shared resources
#[derive(Debug)]
pub struct ResourceArbiter {
    state: Mutex<ArbiterState>,
    policy: RwLock<ArbiterPolicy>,
}

impl ResourceArbiter {
    /// Create an arbiter with the given policy
    pub fn new(policy: ArbiterPolicy) -> Self {
        Self {
            state: Mutex::new(ArbiterState::default()),
            policy: RwLock::new(policy),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ArbiterState>> {
        self.state
            .lock()
            .map_err(|_| CoreError::runtime("Failed to acquire arbiter lock").into())
    }

    /// Current policy
    pub fn policy(&self) -> ArbiterPolicy {
        match self.policy.read() {
            Ok(policy) => *policy,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Replace the policy; takes effect at the next decision
    pub fn set_policy(&self, policy: ArbiterPolicy) {
        if let Ok(mut current) = self.policy.write() {
            if *current != policy {
                info!("Arbitration policy now {:?}", policy);
                *current = policy;
            }
        }
    }

    /// Static priority of a requester; lower wins
    pub fn set_priority(&self, requester: &Id, priority: u32) -> Result<()> {
        self.lock()?.priorities.insert(requester.clone(), priority);
        Ok(())
    }

    /// Wait for exclusive use of `resource`, for at most `timeout`
    pub async fn acquire(self: &Arc<Self>, resource: &str, requester: &Id, timeout: Duration) -> Result<Grant> {
        let (ticket, mut rx) = {
            let mut state = self.lock()?;
            state.next_ticket += 1;
            let ticket = state.next_ticket;
            let res = state.resources.entry(resource.to_string()).or_default();

            if res.holder.is_none() && res.waiters.is_empty() {
                res.holder = Some(Holder {
                    requester: requester.clone(),
                    ticket,
                    since: Instant::now(),
                });
                debug!("Granted {} to {} immediately", resource, requester);
                return Ok(Grant::new(self.clone(), resource, requester.clone(), ticket));
            }

            let (tx, rx) = oneshot::channel();
            res.waiters.push(Waiter {
                requester: requester.clone(),
                ticket,
                since: Instant::now(),
                tx,
            });
            (ticket, rx)
        };

        let limit = bounded(timeout);
        match time::timeout(limit, &mut rx).await {
            Ok(Ok(grant)) => return Ok(grant),
            Ok(Err(_)) => return Err(Error::arbitration(format!("{} hand-off lost", resource))),
            Err(_) => {}
        }

        {
            let mut state = self.lock()?;
            if let Some(res) = state.resources.get_mut(resource) {
                let before = res.waiters.len();
                res.waiters.retain(|w| w.ticket != ticket);
                if res.waiters.len() != before {
                    if res.boosted == Some(ticket) {
                        res.boosted = None;
                    }
                    return Err(Error::timeout(format!(
                        "{} waited {:?} for {}",
                        requester, limit, resource
                    )));
                }
            }
        }

        // The grant arrived between the timeout and the lock
        rx.try_recv()
            .map_err(|_| Error::timeout(format!("{} waited {:?} for {}", requester, limit, resource)))
    }

    fn release(self: &Arc<Self>, resource: &str, ticket: u64) {
        let policy = self.policy();
        let mut guard = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let state = &mut *guard;
        let Some(res) = state.resources.get_mut(resource) else {
            return;
        };
        if !res.holder.as_ref().is_some_and(|h| h.ticket == ticket) {
            return;
        }
        let Some(holder) = res.holder.take() else {
            return;
        };

        *state
            .utilization
            .entry(holder.requester.clone())
            .or_default() += holder.since.elapsed();
        res.last_holder = Some(holder.requester);

        while let Some(index) = choose_next(&policy, res, &state.priorities, &state.utilization) {
            let waiter = res.waiters.remove(index);
            if res.boosted == Some(waiter.ticket) {
                res.boosted = None;
            }
            res.holder = Some(Holder {
                requester: waiter.requester.clone(),
                ticket: waiter.ticket,
                since: Instant::now(),
            });
            let grant = Grant::new(self.clone(), resource, waiter.requester.clone(), waiter.ticket);
            match waiter.tx.send(grant) {
                Ok(()) => {
                    debug!("Handed {} to {}", resource, waiter.requester);
                    return;
                }
                Err(mut unclaimed) => {
                    unclaimed.armed = false;
                    res.holder = None;
                }
            }
        }
    }

    /// Waiters older than the starvation bound that are not yet boosted
    pub fn starving(&self) -> Result<Vec<StarvingWaiter>> {
        let bound = self.policy().starvation;
        let state = self.lock()?;
        let mut starving = Vec::new();
        for (name, res) in &state.resources {
            for waiter in &res.waiters {
                let waited = waiter.since.elapsed();
                if waited >= bound && res.boosted != Some(waiter.ticket) {
                    starving.push(StarvingWaiter {
                        resource: name.clone(),
                        requester: waiter.requester.clone(),
                        ticket: waiter.ticket,
                        waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                    });
                }
            }
        }
        starving.sort_by(|a, b| b.waited_ms.cmp(&a.waited_ms).then(a.ticket.cmp(&b.ticket)));
        Ok(starving)
    }

    /// Put a waiter at the head of the next decision for its resource.
    ///
    /// Returns false if the waiter is gone or another waiter already holds
    /// the boost.
    pub fn boost(&self, resource: &str, ticket: u64) -> Result<bool> {
        let mut state = self.lock()?;
        let Some(res) = state.resources.get_mut(resource) else {
            return Ok(false);
        };
        if !res.waiters.iter().any(|w| w.ticket == ticket) {
            return Ok(false);
        }
        if res.boosted.is_some_and(|b| b != ticket && res.waiters.iter().any(|w| w.ticket == b)) {
            return Ok(false);
        }
        res.boosted = Some(ticket);
        Ok(true)
    }

    /// Whether `ticket` is boosted or no longer waiting
    pub fn is_served(&self, resource: &str, ticket: u64) -> Result<bool> {
        let state = self.lock()?;
        let Some(res) = state.resources.get(resource) else {
            return Ok(true);
        };
        let waiting = res.waiters.iter().any(|w| w.ticket == ticket);
        Ok(!waiting || res.boosted == Some(ticket))
    }

    /// Halve recorded utilization so load balancing tracks recent use
    pub fn decay_utilization(&self) -> Result<()> {
        let mut state = self.lock()?;
        for used in state.utilization.values_mut() {
            *used /= 2;
        }
        Ok(())
    }

    /// Snapshot of every resource, sorted by name
    pub fn snapshot(&self) -> Result<Vec<ResourceSnapshot>> {
        let state = self.lock()?;
        let mut resources: Vec<ResourceSnapshot> = state
            .resources
            .iter()
            .map(|(name, res)| ResourceSnapshot {
                resource: name.clone(),
                holder: res.holder.as_ref().map(|h| h.requester.clone()),
                waiting: res.waiters.iter().map(|w| w.requester.clone()).collect(),
            })
            .collect();
        resources.sort_by(|a, b| a.resource.cmp(&b.resource));
        Ok(resources)
    }
}

fn choose_next(
    policy: &ArbiterPolicy,
    res: &ResourceState,
    priorities: &HashMap<Id, u32>,
    utilization: &HashMap<Id, Duration>,
) -> Option<usize> {
    if let Some(boosted) = res.boosted {
        if let Some(index) = res.waiters.iter().position(|w| w.ticket == boosted) {
            return Some(index);
        }
    }

    let indexed = res.waiters.iter().enumerate();
    match policy.strategy {
        ArbitrationStrategy::Priority => indexed
            .min_by(|(_, a), (_, b)| {
                let pa = priorities.get(&a.requester).copied().unwrap_or(DEFAULT_PRIORITY);
                let pb = priorities.get(&b.requester).copied().unwrap_or(DEFAULT_PRIORITY);
                pa.cmp(&pb)
                    .then_with(|| a.requester.cmp(&b.requester))
                    .then(a.ticket.cmp(&b.ticket))
            })
            .map(|(i, _)| i),
        ArbitrationStrategy::RoundRobin => {
            let after_last = |w: &Waiter| match &res.last_holder {
                Some(last) => w.requester > *last,
                None => true,
            };
            let order = |(_, a): &(usize, &Waiter), (_, b): &(usize, &Waiter)| {
                a.requester.cmp(&b.requester).then(a.ticket.cmp(&b.ticket))
            };
            res.waiters
                .iter()
                .enumerate()
                .filter(|(_, w)| after_last(w))
                .min_by(order)
                .or_else(|| res.waiters.iter().enumerate().min_by(order))
                .map(|(i, _)| i)
        }
        ArbitrationStrategy::LoadBalance => indexed
            .min_by(|(_, a), (_, b)| {
                let ua = utilization.get(&a.requester).copied().unwrap_or_default();
                let ub = utilization.get(&b.requester).copied().unwrap_or_default();
                ua.cmp(&ub)
                    .then_with(|| a.requester.cmp(&b.requester))
                    .then(a.ticket.cmp(&b.ticket))
            })
            .map(|(i, _)| i),
    }
}

/// Exclusive use of a resource; dropping it releases the resource
#[derive(Debug)]
pub struct Grant {
    arbiter: Arc<ResourceArbiter>,
    resource: String,
    requester: Id,
    ticket: u64,
    acquired: Instant,
    armed: bool,
}

impl Grant {
    fn new(arbiter: Arc<ResourceArbiter>, resource: &str, requester: Id, ticket: u64) -> Self {
        Self {
            arbiter,
            resource: resource.to_string(),
            requester,
            ticket,
            acquired: Instant::now(),
            armed: true,
        }
    }

    /// Granted resource
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Grant holder
    pub fn requester(&self) -> &Id {
        &self.requester
    }

    /// How long the grant has been held
    pub fn held_for(&self) -> Duration {
        self.acquired.elapsed()
    }
}

impl Drop for Grant {
    fn drop(&mut self) {
        if self.armed {
            self.arbiter.release(&self.resource, self.ticket);
        }
    }
}

/// What the coordination governor sees
#[derive(Debug, Clone)]
pub struct CoordinationObservation {
    /// Waiters past the starvation bound
    pub starving: Vec<StarvingWaiter>,
    /// Resource view
    pub resources: Vec<ResourceSnapshot>,
}

/// System2 strategy: apply the current arbitration policy and relieve starvation
#[derive(Debug)]
pub struct CoordinationStrategy {
    arbiter: Arc<ResourceArbiter>,
    parameters: Arc<ParameterStore>,
    boosted: Vec<StarvingWaiter>,
    total_boosts: u64,
}

impl CoordinationStrategy {
    /// Create the strategy
    pub fn new(arbiter: Arc<ResourceArbiter>, parameters: Arc<ParameterStore>) -> Self {
        Self {
            arbiter,
            parameters,
            boosted: Vec::new(),
            total_boosts: 0,
        }
    }
}

#[async_trait]
impl ControlStrategy for CoordinationStrategy {
    type Observation = CoordinationObservation;
    type Action = Vec<StarvingWaiter>;

    fn role(&self) -> Role {
        Role::Coordination
    }

    fn scope(&self) -> String {
        "shared resources".to_string()
    }

    async fn probe(&mut self) -> Result<CoordinationObservation> {
        let params = self.parameters.snapshot();
        self.arbiter.set_policy(ArbiterPolicy {
            strategy: params.strategy,
            starvation: params.starvation(),
        });
        Ok(CoordinationObservation {
            starving: self.arbiter.starving()?,
            resources: self.arbiter.snapshot()?,
        })
    }

    fn sense(&mut self, observation: &CoordinationObservation) -> Sensed<Vec<StarvingWaiter>> {
        let contended = observation.resources.iter().filter(|r| !r.waiting.is_empty()).count();
        if observation.starving.is_empty() {
            return Sensed::nominal(format!("{} contended resources", contended));
        }
        Sensed::act(
            Severity::Minor,
            format!(
                "{} contended resources, {} starving waiters",
                contended,
                observation.starving.len()
            ),
            observation.starving.clone(),
        )
    }

    async fn respond(&mut self, starving: Vec<StarvingWaiter>) -> ResponseOutcome {
        let mut boosted = Vec::new();
        for waiter in starving {
            match self.arbiter.boost(&waiter.resource, waiter.ticket) {
                Ok(true) => boosted.push(waiter),
                Ok(false) => {}
                Err(e) => return ResponseOutcome::Failed(e.to_string()),
            }
        }
        if boosted.is_empty() {
            return ResponseOutcome::NoOp;
        }
        let detail = boosted
            .iter()
            .map(|w| format!("{} on {}", w.requester, w.resource))
            .collect::<Vec<_>>()
            .join(", ");
        self.total_boosts += boosted.len() as u64;
        self.boosted = boosted;
        ResponseOutcome::Executed(format!("boosted {}", detail))
    }

    fn learn(&mut self, _: &CoordinationObservation, _: Severity, outcome: &ResponseOutcome) -> String {
        if let Err(e) = self.arbiter.decay_utilization() {
            return format!("utilization decay failed: {}", e);
        }
        match outcome {
            ResponseOutcome::Executed(_) => format!("+{} boosts", self.boosted.len()),
            _ => {
                self.boosted.clear();
                String::new()
            }
        }
    }

    async fn validate(&mut self) -> Result<ValidationOutcome> {
        for waiter in &self.boosted {
            if !self.arbiter.is_served(&waiter.resource, waiter.ticket)? {
                return Ok(ValidationOutcome::Failed(format!(
                    "boost for {} on {} was lost",
                    waiter.requester, waiter.resource
                )));
            }
        }
        Ok(ValidationOutcome::Passed)
    }

    fn model_summary(&self) -> String {
        format!("{:?}, {} boosts so far", self.arbiter.policy().strategy, self.total_boosts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn arbiter(strategy: ArbitrationStrategy) -> Arc<ResourceArbiter> {
        Arc::new(ResourceArbiter::new(ArbiterPolicy {
            strategy,
            starvation: Duration::from_millis(100),
        }))
    }

    type Log = Arc<Mutex<Vec<Id>>>;

    async fn queue(arbiter: &Arc<ResourceArbiter>, requester: &str, log: &Log) -> tokio::task::JoinHandle<Result<()>> {
        let arbiter = arbiter.clone();
        let log = log.clone();
        let id: Id = requester.into();
        let handle = tokio::spawn(async move {
            let _grant = arbiter.acquire("bus-a", &id, Duration::from_secs(5)).await?;
            log.lock().map_err(|_| Error::governor("log poisoned"))?.push(id);
            Ok(())
        });
        // Let the waiter enqueue before the next one
        time::sleep(Duration::from_millis(5)).await;
        handle
    }

    async fn finish(handles: Vec<tokio::task::JoinHandle<Result<()>>>, log: &Log) -> Result<Vec<Id>> {
        for handle in handles {
            handle.await.map_err(|e| Error::governor(e.to_string()))??;
        }
        let order = log.lock().map_err(|_| Error::governor("log poisoned"))?.clone();
        Ok(order)
    }

    #[tokio::test]
    async fn test_priority_lower_value_wins() -> Result<()> {
        let arbiter = arbiter(ArbitrationStrategy::Priority);
        arbiter.set_priority(&"b".into(), 5)?;
        arbiter.set_priority(&"c".into(), 1)?;
        let log = Log::default();

        let holder = arbiter.acquire("bus-a", &"a".into(), Duration::from_secs(1)).await?;
        let handles = vec![queue(&arbiter, "b", &log).await, queue(&arbiter, "c", &log).await];
        assert_eq!(arbiter.snapshot()?[0].waiting.len(), 2);

        drop(holder);
        let order = finish(handles, &log).await?;
        assert_eq!(order, vec![Id::from("c"), Id::from("b")]);
        Ok(())
    }

    #[tokio::test]
    async fn test_priority_tie_breaks_on_lowest_id() -> Result<()> {
        let arbiter = arbiter(ArbitrationStrategy::Priority);
        let log = Log::default();

        let holder = arbiter.acquire("bus-a", &"a".into(), Duration::from_secs(1)).await?;
        let handles = vec![queue(&arbiter, "z", &log).await, queue(&arbiter, "m", &log).await];
        drop(holder);

        let order = finish(handles, &log).await?;
        assert_eq!(order, vec![Id::from("m"), Id::from("z")]);
        let state = arbiter.snapshot()?;
        assert!(state[0].holder.is_none());
        assert!(state[0].waiting.is_empty());
        Ok(())
    }

    #[test]
    fn test_round_robin_rotates_after_last_holder() {
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        let (tx3, _rx3) = oneshot::channel();
        let now = Instant::now();
        let res = ResourceState {
            holder: None,
            last_holder: Some("b".into()),
            waiters: vec![
                Waiter { requester: "a".into(), ticket: 1, since: now, tx: tx1 },
                Waiter { requester: "d".into(), ticket: 2, since: now, tx: tx2 },
                Waiter { requester: "c".into(), ticket: 3, since: now, tx: tx3 },
            ],
            boosted: None,
        };
        let policy = ArbiterPolicy {
            strategy: ArbitrationStrategy::RoundRobin,
            starvation: Duration::from_secs(1),
        };
        let pick = choose_next(&policy, &res, &HashMap::new(), &HashMap::new());
        assert_eq!(pick, Some(2));

        let wrapped = ResourceState {
            last_holder: Some("z".into()),
            ..res
        };
        assert_eq!(
            choose_next(&policy, &wrapped, &HashMap::new(), &HashMap::new()),
            Some(0)
        );
    }

    #[test]
    fn test_load_balance_prefers_least_used() {
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        let now = Instant::now();
        let res = ResourceState {
            holder: None,
            last_holder: None,
            waiters: vec![
                Waiter { requester: "a".into(), ticket: 1, since: now, tx: tx1 },
                Waiter { requester: "b".into(), ticket: 2, since: now, tx: tx2 },
            ],
            boosted: None,
        };
        let mut used = HashMap::new();
        used.insert(Id::from("a"), Duration::from_millis(900));
        used.insert(Id::from("b"), Duration::from_millis(100));
        let policy = ArbiterPolicy {
            strategy: ArbitrationStrategy::LoadBalance,
            starvation: Duration::from_secs(1),
        };
        assert_eq!(choose_next(&policy, &res, &HashMap::new(), &used), Some(1));

        let boosted = ResourceState {
            boosted: Some(1),
            ..res
        };
        assert_eq!(choose_next(&policy, &boosted, &HashMap::new(), &used), Some(0));
    }

    #[tokio::test]
    async fn test_at_most_one_grant_per_resource() -> Result<()> {
        let arbiter = arbiter(ArbitrationStrategy::RoundRobin);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for i in 0..8 {
            let arbiter = arbiter.clone();
            let active = active.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let id: Id = format!("port-{}", i).into();
                let _grant = arbiter.acquire("bus-a", &id, Duration::from_secs(5)).await?;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, Error>(())
            }));
        }
        for task in tasks {
            task.await.map_err(|e| Error::governor(e.to_string()))??;
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_times_out_and_leaves_queue() -> Result<()> {
        let arbiter = arbiter(ArbitrationStrategy::Priority);
        let _holder = arbiter.acquire("bus-a", &"a".into(), Duration::from_secs(1)).await?;

        let result = arbiter.acquire("bus-a", &"b".into(), Duration::from_millis(50)).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(arbiter.snapshot()?[0].waiting.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_abandoned_waiter_is_skipped() -> Result<()> {
        let arbiter = arbiter(ArbitrationStrategy::Priority);
        let log = Log::default();
        let holder = arbiter.acquire("bus-a", &"a".into(), Duration::from_secs(1)).await?;

        let abandoned = queue(&arbiter, "b", &log).await;
        abandoned.abort();
        let _ = abandoned.await;
        let patient = queue(&arbiter, "c", &log).await;

        drop(holder);
        let order = finish(vec![patient], &log).await?;
        assert_eq!(order, vec![Id::from("c")]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_starving_waiter_is_boosted() -> Result<()> {
        let arbiter = arbiter(ArbitrationStrategy::Priority);
        arbiter.set_priority(&"low".into(), 50)?;
        arbiter.set_priority(&"high".into(), 1)?;
        let log = Log::default();
        let holder = arbiter.acquire("bus-a", &"a".into(), Duration::from_secs(30)).await?;

        let starving = queue(&arbiter, "low", &log).await;
        time::sleep(Duration::from_millis(200)).await;
        let favoured = queue(&arbiter, "high", &log).await;

        let waiters = arbiter.starving()?;
        assert_eq!(waiters.len(), 1);
        assert_eq!(waiters[0].requester, Id::from("low"));
        assert!(arbiter.boost(&waiters[0].resource, waiters[0].ticket)?);
        assert!(arbiter.starving()?.is_empty());
        assert!(arbiter.is_served(&waiters[0].resource, waiters[0].ticket)?);

        drop(holder);
        let order = finish(vec![starving, favoured], &log).await?;
        assert_eq!(order, vec![Id::from("low"), Id::from("high")]);
        Ok(())
    }
}
