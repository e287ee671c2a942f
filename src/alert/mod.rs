//! Alert engine: rule evaluation, cooldowns, dedup, status lifecycle.
//!
//! Inputs: upstream anomaly events (`alerts`), per-meter and regional
//! aggregates, and a periodic sweep over cached state (meter liveness,
//! region loads). Every firing passes four gates in order (cooldown
//! check, condition evaluation, cooldown claim, cross-engine dedup
//! marker), then persists and publishes on `alerts_processed`. Cache
//! failures at the cooldown or dedup gates fail closed: a suppressed
//! alert beats a duplicate storm.

mod api;
mod eval;
mod rules;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{topics, Bus, Publisher};
use crate::cache::Cache;
use crate::config::defaults::LIVENESS_SWEEP_SECS;
use crate::metrics::Metrics;
use crate::store::{Store, StoreError};
use crate::types::{
    Alert, AlertStatus, AlertStatusUpdate, AnomalyEvent, MeterAggregate, RegionalAggregate,
    Severity,
};

pub use api::router;
pub use eval::{EvalContext, RuleEvaluator};
pub use rules::{seed_rules, Aggregation, AlertRule, Condition, Op};

/// Consumer group name shared by this engine's topic subscriptions.
const CONSUMER_GROUP: &str = "alert-engine";

/// Overload-window lookback for the `overload_minutes_10m` context field.
const OVERLOAD_LOOKBACK_SECS: i64 = 600;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("alert not found")]
    NotFound,
    #[error("illegal transition {from} → {to}")]
    Illegal { from: AlertStatus, to: AlertStatus },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

struct AlertInner {
    publisher: Publisher,
    store: Store,
    cache: Arc<Cache>,
    metrics: Arc<Metrics>,
    rules: Vec<AlertRule>,
}

/// Shared alert engine handle (consumer loops + HTTP surface).
#[derive(Clone)]
pub struct AlertEngine {
    inner: Arc<AlertInner>,
}

impl AlertEngine {
    pub fn new(bus: Arc<Bus>, store: Store, cache: Arc<Cache>, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(AlertInner {
                publisher: Publisher::new(bus, Arc::clone(&metrics)),
                store,
                cache,
                metrics,
                rules: seed_rules(),
            }),
        }
    }

    /// Consumer loops plus the periodic cached-state sweep.
    pub async fn run(self, cancel: CancellationToken) {
        let bus = Arc::clone(self.inner.publisher.bus());
        let mut anomalies = bus.subscribe(topics::ALERTS, CONSUMER_GROUP);
        let mut aggregates = bus.subscribe(topics::AGGREGATES_1M, CONSUMER_GROUP);
        let mut regionals = bus.subscribe(topics::AGGREGATES_1M_REGIONAL, CONSUMER_GROUP);
        let mut sweep = tokio::time::interval(Duration::from_secs(LIVENESS_SWEEP_SECS));
        let mut evaluator = RuleEvaluator::new();

        info!(
            "[AlertEngine] {} rules seeded, consuming {}, {}, {}",
            self.inner.rules.len(),
            topics::ALERTS,
            topics::AGGREGATES_1M,
            topics::AGGREGATES_1M_REGIONAL
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[AlertEngine] Shutdown signal received");
                    break;
                }
                record = anomalies.recv() => {
                    match record {
                        Ok(record) => match record.json::<AnomalyEvent>() {
                            Ok(event) => {
                                let ctx = anomaly_context(&event);
                                self.process(&mut evaluator, &ctx).await;
                            }
                            Err(e) => debug!("[AlertEngine] Undecodable anomaly event: {e}"),
                        },
                        Err(e) => { warn!("[AlertEngine] Consumer error: {e}"); break; }
                    }
                }
                record = aggregates.recv() => {
                    match record {
                        Ok(record) => match record.json::<MeterAggregate>() {
                            Ok(agg) => {
                                let ctx = meter_aggregate_context(&agg);
                                self.process(&mut evaluator, &ctx).await;
                            }
                            Err(e) => debug!("[AlertEngine] Undecodable aggregate: {e}"),
                        },
                        Err(e) => { warn!("[AlertEngine] Consumer error: {e}"); break; }
                    }
                }
                record = regionals.recv() => {
                    match record {
                        Ok(record) => match record.json::<RegionalAggregate>() {
                            Ok(agg) => {
                                let ctx = self.regional_context(&agg);
                                self.process(&mut evaluator, &ctx).await;
                            }
                            Err(e) => debug!("[AlertEngine] Undecodable regional aggregate: {e}"),
                        },
                        Err(e) => { warn!("[AlertEngine] Consumer error: {e}"); break; }
                    }
                }
                _ = sweep.tick() => self.sweep_cached_state(&mut evaluator).await,
            }
        }
    }

    /// Periodic evaluation over cached state: meter liveness for the
    /// outage rule and last-known region loads.
    async fn sweep_cached_state(&self, evaluator: &mut RuleEvaluator) {
        let now = Utc::now();
        match self.inner.cache.all_meter_liveness() {
            Ok(entries) => {
                for (meter_id, liveness) in entries {
                    let ago_ms = (now - liveness.last_seen).num_milliseconds();
                    let ctx = EvalContext::new(Some(liveness.region), Some(meter_id))
                        .with("last_seen_ago_ms", ago_ms);
                    self.process(evaluator, &ctx).await;
                }
            }
            Err(e) => debug!("[AlertEngine] Liveness sweep unavailable: {e}"),
        }

        match self.inner.cache.all_region_loads() {
            Ok(loads) => {
                for (region, load) in loads {
                    let ctx = EvalContext::new(Some(region), None)
                        .with("load_percentage", load);
                    self.process(evaluator, &ctx).await;
                }
            }
            Err(e) => debug!("[AlertEngine] Region load sweep unavailable: {e}"),
        }
    }

    fn regional_context(&self, agg: &RegionalAggregate) -> EvalContext {
        let now = Utc::now().timestamp();
        let from = now - OVERLOAD_LOOKBACK_SECS;
        let _ = self.inner.cache.trim_overload_before(&agg.region, from);
        let overload_minutes = self
            .inner
            .cache
            .overload_minutes_between(&agg.region, from, now)
            .unwrap_or(0);

        let mut ctx = EvalContext::new(Some(agg.region.clone()), None)
            .with("load_percentage", agg.load_percentage)
            .with("total_power_kw", agg.total_power_kw)
            .with("meter_count", agg.meter_count)
            .with("overload_minutes_10m", overload_minutes);
        // Present only for regions whose meters report feed-in, so the
        // low-generation rule stays quiet elsewhere.
        if let Some(generation) = agg.generation_percentage {
            ctx = ctx.with("generation_percentage", generation);
        }
        ctx.timestamp = agg.window_start;
        ctx
    }

    /// Run every enabled rule against one context.
    pub async fn process(&self, evaluator: &mut RuleEvaluator, ctx: &EvalContext) {
        for rule in &self.inner.rules {
            if !rule.enabled {
                continue;
            }

            // Gate 1: cooldown check (fail closed).
            match self.inner.cache.cooldown_active(
                &rule.id,
                ctx.region.as_deref(),
                ctx.meter_id.as_deref(),
            ) {
                Ok(false) => {}
                Ok(true) => {
                    self.inner.metrics.alerts_cooldown_suppressed.inc();
                    continue;
                }
                Err(e) => {
                    debug!("[AlertEngine] Cooldown check unavailable for {}: {e}", rule.id);
                    continue;
                }
            }

            // Gate 2: conditions. Evaluation errors never crash the loop.
            match evaluator.evaluate(rule, ctx) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    self.inner.metrics.rule_eval_errors.inc();
                    warn!("[AlertEngine] Rule {} evaluation error: {e}", rule.id);
                    continue;
                }
            }

            // Gate 3: cooldown claim (fail closed).
            match self.inner.cache.claim_cooldown(
                &rule.id,
                ctx.region.as_deref(),
                ctx.meter_id.as_deref(),
                rule.cooldown(),
            ) {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    self.inner.metrics.alerts_cooldown_suppressed.inc();
                    continue;
                }
            }

            // Gate 4: cross-engine dedup marker (fail closed).
            let alert_type = alert_type_for(rule);
            match self.inner.cache.claim_active_alert(
                ctx.region.as_deref(),
                alert_type,
                ctx.meter_id.as_deref(),
            ) {
                Ok(true) => {}
                Ok(false) => {
                    self.inner.metrics.alerts_dedup_suppressed.inc();
                    continue;
                }
                Err(e) => {
                    debug!("[AlertEngine] Dedup marker unavailable for {}: {e}", rule.id);
                    continue;
                }
            }

            self.fire(rule, alert_type, ctx).await;
        }
    }

    async fn fire(&self, rule: &AlertRule, alert_type: &str, ctx: &EvalContext) {
        let alert = Alert {
            id: Uuid::new_v4(),
            alert_type: alert_type.to_string(),
            severity: severity_for(rule, ctx),
            region: ctx.region.clone(),
            meter_id: ctx.meter_id.clone(),
            message: message_for(rule, ctx),
            status: AlertStatus::Active,
            timestamp: ctx.timestamp,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_at: None,
            metadata: ctx.data.clone(),
        };

        if let Err(e) = self.inner.store.insert_alert(&alert).await {
            warn!("[AlertEngine] Alert persist failed ({}): {e}", alert.id);
        }

        let key = alert
            .meter_id
            .clone()
            .unwrap_or_else(|| alert.id.to_string());
        if let Err(e) = self
            .inner
            .publisher
            .publish_json(topics::ALERTS_PROCESSED, &key, &alert)
            .await
        {
            warn!("[AlertEngine] Alert publish failed ({}): {e}", alert.id);
            return;
        }
        self.inner.metrics.alerts_published.inc();
        info!(
            "[AlertEngine] 🚨 {} [{}] {}",
            alert.alert_type, alert.severity, alert.message
        );
    }

    // ------------------------------------------------------------------
    // Status lifecycle
    // ------------------------------------------------------------------

    /// Transition an alert and publish the status update.
    pub async fn transition(
        &self,
        id: Uuid,
        to: AlertStatus,
        acknowledged_by: Option<String>,
    ) -> Result<Alert, StatusError> {
        let Some(mut alert) = self.inner.store.get_alert(id)? else {
            return Err(StatusError::NotFound);
        };
        if !alert.status.can_transition_to(to) {
            return Err(StatusError::Illegal {
                from: alert.status,
                to,
            });
        }

        let now = Utc::now();
        alert.status = to;
        match to {
            AlertStatus::Acknowledged => {
                alert.acknowledged_by = acknowledged_by;
                alert.acknowledged_at = Some(now);
            }
            AlertStatus::Resolved => {
                alert.resolved_at = Some(now);
            }
            AlertStatus::Active => {}
        }
        self.inner.store.update_alert(&alert).await?;

        let update = AlertStatusUpdate {
            alert_id: alert.id,
            status: alert.status,
            region: alert.region.clone(),
            meter_id: alert.meter_id.clone(),
            acknowledged_by: alert.acknowledged_by.clone(),
            timestamp: now,
        };
        if let Err(e) = self
            .inner
            .publisher
            .publish_json(topics::ALERT_STATUS_UPDATES, &alert.id.to_string(), &update)
            .await
        {
            warn!("[AlertEngine] Status update publish failed ({}): {e}", alert.id);
        }
        Ok(alert)
    }

    fn store(&self) -> &Store {
        &self.inner.store
    }
}

// ============================================================================
// Context builders & message generation
// ============================================================================

fn anomaly_context(event: &AnomalyEvent) -> EvalContext {
    let mut ctx = EvalContext::new(Some(event.region.clone()), Some(event.meter_id.clone()))
        .with("event_type", event.event_type.clone())
        .with("kind", format!("{:?}", event.kind).to_lowercase())
        .with("severity", event.severity.to_string())
        .with("power_kw", event.power_kw)
        .with("baseline_kw", event.baseline_kw)
        .with("change", event.change);
    ctx.timestamp = event.timestamp;
    ctx
}

fn meter_aggregate_context(agg: &MeterAggregate) -> EvalContext {
    let mut ctx = EvalContext::new(Some(agg.region.clone()), Some(agg.meter_id.clone()))
        .with("consumption", agg.energy_kwh_sum)
        .with("avg_power_kw", agg.avg_power_kw)
        .with("max_power_kw", agg.max_power_kw);
    ctx.timestamp = agg.window_start;
    ctx
}

/// Forwarded anomalies keep the upstream `ANOMALY` type so the dedup
/// keyspace matches the detector's events.
fn alert_type_for(rule: &AlertRule) -> &str {
    if rule.id == "anomaly_forward" {
        AnomalyEvent::EVENT_TYPE
    } else {
        &rule.rule_type
    }
}

/// Forwarded anomalies keep the detector's severity; everything else uses
/// the rule's.
fn severity_for(rule: &AlertRule, ctx: &EvalContext) -> Severity {
    if rule.id == "anomaly_forward" {
        if let Some(severity) = ctx
            .data
            .get("severity")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
        {
            return severity;
        }
    }
    rule.severity
}

fn message_for(rule: &AlertRule, ctx: &EvalContext) -> String {
    let region = ctx.region.as_deref().unwrap_or("unknown region");
    let meter = ctx.meter_id.as_deref().unwrap_or("unknown meter");
    let number = |field: &str| ctx.data.get(field).and_then(|v| v.as_f64());

    match rule.id.as_str() {
        "regional_overload" => format!(
            "Regional overload: {region} at {:.1}% of capacity",
            number("load_percentage").unwrap_or(0.0)
        ),
        "meter_outage" => format!(
            "Meter {meter} silent for {:.0}s",
            number("last_seen_ago_ms").unwrap_or(0.0) / 1000.0
        ),
        "high_consumption" => format!(
            "High consumption on {meter}: hourly average above 1000 kWh"
        ),
        "low_generation" => format!(
            "Low generation in {region}: {:.1}%",
            number("generation_percentage").unwrap_or(0.0)
        ),
        "anomaly_forward" => format!(
            "Anomaly on {meter}: {} at {:.2} kW (baseline {:.2} kW)",
            ctx.data
                .get("kind")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown"),
            number("power_kw").unwrap_or(0.0),
            number("baseline_kw").unwrap_or(0.0)
        ),
        other => format!("Rule {other} triggered for {region}/{meter}"),
    }
}
