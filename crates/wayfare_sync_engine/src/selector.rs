//! Route selection by health.
//!
//! Every route call feeds its outcome back into the selector. A route's
//! score is its recent success rate discounted by its mean latency:
//!
//! ```text
//! score = success_rate / (1 + mean_latency_secs)
//! ```
//!
//! A route that fails `failure_threshold` times in a row is demoted and
//! skipped until its cool-down has passed and a probe succeeds.
//!
//! # Invariants
//!
//! - Selection is deterministic: equal scores go to the route registered
//!   first.
//! - A pinned route is never substituted; if it is demoted or unavailable
//!   selection fails.

use crate::clock::{to_chrono, Clock};
use crate::config::{RoutePreference, SyncConfig};
use crate::error::{RouteError, RouteResult};
use crate::route::RouteAdapter;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use wayfare_sync_protocol::RouteId;

/// Parameters of health tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    /// Outcomes kept per route.
    pub window: usize,
    /// Consecutive failures that demote a route.
    pub failure_threshold: u32,
    /// Time before a demoted route is probed.
    pub cool_down: Duration,
}

impl From<&SyncConfig> for HealthPolicy {
    fn from(config: &SyncConfig) -> Self {
        Self {
            window: config.health_window,
            failure_threshold: config.failure_threshold,
            cool_down: config.cool_down,
        }
    }
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

/// Recent history of one route.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteHealth {
    outcomes: VecDeque<bool>,
    latencies: VecDeque<Duration>,
    consecutive_failures: u32,
    last_failure: Option<DateTime<Utc>>,
    last_error: Option<String>,
    demoted: bool,
    cooling_until: Option<DateTime<Utc>>,
}

impl RouteHealth {
    /// Share of successful calls in the window; 1.0 with no history.
    pub fn success_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 1.0;
        }
        let successes = self.outcomes.iter().filter(|ok| **ok).count();
        successes as f64 / self.outcomes.len() as f64
    }

    /// Mean latency of successful calls in the window.
    pub fn mean_latency(&self) -> Duration {
        if self.latencies.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.latencies.iter().sum();
        total / self.latencies.len() as u32
    }

    /// Selection score.
    pub fn score(&self) -> f64 {
        self.success_rate() / (1.0 + self.mean_latency().as_secs_f64())
    }

    /// Failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether the route is excluded from selection.
    pub fn is_demoted(&self) -> bool {
        self.demoted
    }

    /// When the route may next be probed.
    pub fn cooling_until(&self) -> Option<DateTime<Utc>> {
        self.cooling_until
    }

    fn push_outcome(&mut self, ok: bool, window: usize) {
        self.outcomes.push_back(ok);
        while self.outcomes.len() > window {
            self.outcomes.pop_front();
        }
    }

    fn push_latency(&mut self, latency: Duration, window: usize) {
        self.latencies.push_back(latency);
        while self.latencies.len() > window {
            self.latencies.pop_front();
        }
    }
}

/// Serializable view of a route's health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteHealthReport {
    /// Route id.
    pub route: RouteId,
    /// Selection score.
    pub score: f64,
    /// Share of successful calls.
    pub success_rate: f64,
    /// Mean latency in milliseconds.
    pub mean_latency_ms: u64,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Excluded from selection.
    pub demoted: bool,
    /// Next probe time.
    pub cooling_until: Option<DateTime<Utc>>,
    /// Most recent error.
    pub last_error: Option<String>,
    /// Time of the most recent failure.
    pub last_failure: Option<DateTime<Utc>>,
}

/// Chooses the route for each sync run.
pub struct RouteSelector {
    routes: Vec<Arc<dyn RouteAdapter>>,
    health: Mutex<HashMap<RouteId, RouteHealth>>,
    policy: RwLock<HealthPolicy>,
    clock: Arc<dyn Clock>,
}

impl RouteSelector {
    /// Creates a selector over `routes`, in preference order for ties.
    pub fn new(routes: Vec<Arc<dyn RouteAdapter>>, clock: Arc<dyn Clock>) -> Self {
        let health = routes
            .iter()
            .map(|r| (r.id().clone(), RouteHealth::default()))
            .collect();
        Self {
            routes,
            health: Mutex::new(health),
            policy: RwLock::new(HealthPolicy::default()),
            clock,
        }
    }

    /// Replaces the health policy.
    pub fn set_policy(&self, policy: HealthPolicy) {
        *self.policy.write() = policy;
    }

    /// Registered routes.
    pub fn routes(&self) -> &[Arc<dyn RouteAdapter>] {
        &self.routes
    }

    /// A route by id.
    pub fn route(&self, id: &RouteId) -> Option<Arc<dyn RouteAdapter>> {
        self.routes.iter().find(|r| r.id() == id).cloned()
    }

    /// Picks the route for a run.
    pub fn select(&self, preference: &RoutePreference) -> RouteResult<Arc<dyn RouteAdapter>> {
        let health = self.health.lock();
        let usable = |route: &Arc<dyn RouteAdapter>| {
            route.is_available() && !health.get(route.id()).is_some_and(RouteHealth::is_demoted)
        };

        match preference {
            RoutePreference::Pinned(id) => {
                let route = self
                    .route(id)
                    .ok_or_else(|| RouteError::Unavailable(format!("unknown route {id}")))?;
                if usable(&route) {
                    Ok(route)
                } else {
                    Err(RouteError::Unavailable(format!("pinned route {id} is unavailable")))
                }
            }
            RoutePreference::Automatic => {
                let mut best: Option<(&Arc<dyn RouteAdapter>, f64)> = None;
                for route in self.routes.iter().filter(|&r| usable(r)) {
                    let score = health.get(route.id()).map_or(1.0, RouteHealth::score);
                    if best.map_or(true, |(_, top)| score > top) {
                        best = Some((route, score));
                    }
                }
                let (route, score) =
                    best.ok_or_else(|| RouteError::Unavailable("no healthy route".into()))?;
                debug!(route = %route.id(), score, "route selected");
                Ok(route.clone())
            }
        }
    }

    /// Records a successful call.
    pub fn record_success(&self, id: &RouteId, latency: Duration) {
        let window = self.policy.read().window;
        let mut health = self.health.lock();
        let entry = health.entry(id.clone()).or_default();
        entry.push_outcome(true, window);
        entry.push_latency(latency, window);
        entry.consecutive_failures = 0;
    }

    /// Records a failed call. Errors that say nothing about the route are
    /// ignored.
    pub fn record_failure(&self, id: &RouteId, error: &RouteError) {
        if !error.counts_against_route() {
            return;
        }
        let policy = *self.policy.read();
        let now = self.clock.now();
        let mut health = self.health.lock();
        let entry = health.entry(id.clone()).or_default();
        entry.push_outcome(false, policy.window);
        entry.consecutive_failures += 1;
        entry.last_failure = Some(now);
        entry.last_error = Some(error.to_string());

        if !entry.demoted && entry.consecutive_failures >= policy.failure_threshold {
            entry.demoted = true;
            entry.cooling_until = Some(now + to_chrono(policy.cool_down));
            warn!(
                route = %id,
                failures = entry.consecutive_failures,
                cool_down_ms = policy.cool_down.as_millis() as u64,
                "route demoted"
            );
        }
    }

    /// Probes demoted routes whose cool-down has passed and routes that
    /// report themselves unavailable; restores the ones that answer.
    pub async fn refresh(&self) {
        let now = self.clock.now();
        let due: Vec<Arc<dyn RouteAdapter>> = {
            let health = self.health.lock();
            self.routes
                .iter()
                .filter(|route| {
                    let cooled = health.get(route.id()).is_some_and(|h| {
                        h.demoted && h.cooling_until.map_or(true, |until| until <= now)
                    });
                    cooled || !route.is_available()
                })
                .cloned()
                .collect()
        };

        for route in due {
            let result = route.probe().await;
            let cool_down = self.policy.read().cool_down;
            let mut health = self.health.lock();
            let entry = health.entry(route.id().clone()).or_default();
            match result {
                Ok(()) => {
                    if entry.demoted {
                        info!(route = %route.id(), "route restored after probe");
                    }
                    entry.demoted = false;
                    entry.consecutive_failures = 0;
                    entry.cooling_until = None;
                }
                Err(error) => {
                    debug!(route = %route.id(), %error, "probe failed");
                    entry.last_error = Some(error.to_string());
                    if entry.demoted {
                        entry.cooling_until = Some(self.clock.now() + to_chrono(cool_down));
                    }
                }
            }
        }
    }

    /// Health of one route.
    pub fn health(&self, id: &RouteId) -> Option<RouteHealth> {
        self.health.lock().get(id).cloned()
    }

    /// Health of every route, in registration order.
    pub fn report(&self) -> Vec<RouteHealthReport> {
        let health = self.health.lock();
        self.routes
            .iter()
            .map(|route| {
                let h = health.get(route.id()).cloned().unwrap_or_default();
                RouteHealthReport {
                    route: route.id().clone(),
                    score: h.score(),
                    success_rate: h.success_rate(),
                    mean_latency_ms: h.mean_latency().as_millis() as u64,
                    consecutive_failures: h.consecutive_failures,
                    demoted: h.demoted,
                    cooling_until: h.cooling_until,
                    last_error: h.last_error.clone(),
                    last_failure: h.last_failure,
                }
            })
            .collect()
    }
}
