//! Autoscaler — threshold scaling of group desired size.
//!
//! For each group with a policy, reads the trailing utilization of the
//! group's hosts, compares it against the policy's water marks, and
//! applies the decision through [`GroupStore::set_desired_size`]. The
//! reconciliation engine picks the new size up on its next tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use hyperfleet_core::config::GroupScalingConfig;
use hyperfleet_core::{ControllerConfig, GroupId};
use hyperfleet_metrics::MetricsCollector;
use hyperfleet_scheduler::{GroupError, GroupStore};

/// A scaling decision for a single group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Set the desired size to this value.
    ScaleTo(u32),
    NoChange,
}

/// Per-group threshold policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingPolicy {
    pub group: GroupId,
    /// Instances added or removed per decision.
    pub increment: u32,
    /// Utilization (0.0-1.0) above which the group grows.
    pub high_water: f64,
    /// Utilization below which the group shrinks.
    pub low_water: f64,
    /// Minimum time between two changes.
    pub cooldown: Duration,
}

impl ScalingPolicy {
    pub fn from_config(group: &str, cfg: &GroupScalingConfig) -> Self {
        Self {
            group: group.to_string(),
            increment: cfg.increment.max(1),
            high_water: cfg.high_water,
            low_water: cfg.low_water,
            cooldown: cfg.cooldown(),
        }
    }

    /// One policy per group declared in `config`.
    pub fn all(config: &ControllerConfig) -> Vec<Self> {
        config
            .groups
            .iter()
            .map(|(id, cfg)| Self::from_config(id, &cfg.scaling))
            .collect()
    }
}

/// Evaluates group utilization and moves desired sizes.
pub struct Autoscaler {
    groups: Arc<GroupStore>,
    collector: Arc<MetricsCollector>,
    policies: Vec<ScalingPolicy>,
    /// Time of the last change per group (cooldown tracking).
    last_change: HashMap<GroupId, Instant>,
}

impl Autoscaler {
    pub fn new(
        groups: Arc<GroupStore>,
        collector: Arc<MetricsCollector>,
        policies: Vec<ScalingPolicy>,
    ) -> Self {
        Self {
            groups,
            collector,
            policies,
            last_change: HashMap::new(),
        }
    }

    pub fn policies(&self) -> &[ScalingPolicy] {
        &self.policies
    }

    /// Decide the next desired size for one group.
    ///
    /// A returned [`ScaleDecision::ScaleTo`] starts the group's cooldown.
    pub fn evaluate(
        &mut self,
        policy: &ScalingPolicy,
        utilization: f64,
        desired: u32,
        min: u32,
        max: u32,
        now: Instant,
    ) -> ScaleDecision {
        if let Some(last) = self.last_change.get(&policy.group)
            && now.saturating_duration_since(*last) < policy.cooldown
        {
            return ScaleDecision::NoChange;
        }

        let target = if utilization > policy.high_water && desired < max {
            desired.saturating_add(policy.increment).min(max)
        } else if utilization < policy.low_water && desired > min {
            desired.saturating_sub(policy.increment).max(min)
        } else {
            return ScaleDecision::NoChange;
        };

        self.last_change.insert(policy.group.clone(), now);
        debug!(
            group = %policy.group,
            from = desired,
            to = target,
            utilization,
            high_water = policy.high_water,
            low_water = policy.low_water,
            "scaling decision"
        );
        ScaleDecision::ScaleTo(target)
    }

    /// Evaluate every group with a policy and apply the decisions.
    ///
    /// Groups without utilization samples are skipped.
    pub async fn evaluate_all(&mut self) -> anyhow::Result<Vec<(GroupId, ScaleDecision)>> {
        let mut decisions = Vec::new();

        for policy in self.policies.clone() {
            let record = match self.groups.get(&policy.group) {
                Ok(record) => record,
                Err(GroupError::NotFound(_)) => {
                    debug!(group = %policy.group, "policy for unknown group");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let Some(utilization) = self.collector.group_utilization(&record.hosts).await else {
                debug!(group = %policy.group, "no utilization samples yet");
                continue;
            };

            let decision = self.evaluate(
                &policy,
                utilization,
                record.desired_size,
                record.min_size,
                record.max_size,
                Instant::now(),
            );

            if let ScaleDecision::ScaleTo(target) = decision {
                match self.groups.set_desired_size(&policy.group, target).await {
                    Ok(applied) => info!(
                        group = %policy.group,
                        from = record.desired_size,
                        to = applied,
                        utilization,
                        "autoscaled"
                    ),
                    Err(e) => warn!(group = %policy.group, target, error = %e, "scaling action failed"),
                }
            }

            decisions.push((policy.group, decision));
        }

        Ok(decisions)
    }

    pub async fn run(&mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = interval.as_secs(),
            groups = self.policies.len(),
            "autoscaler started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.evaluate_all().await {
                        tracing::error!(error = %e, "autoscaler evaluation failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hyperfleet_cluster::HostRegistry;
    use hyperfleet_core::config::MetricsConfig;
    use hyperfleet_core::{
        GatewayError, GatewayResult, HostSpec, HostUtilization, InstanceTemplate, MetricsSource,
        Resources,
    };
    use hyperfleet_scheduler::GroupDefinition;
    use hyperfleet_state::StateStore;

    struct NoSource;

    #[async_trait]
    impl MetricsSource for NoSource {
        async fn sample(&self, host: &HostSpec) -> GatewayResult<HostUtilization> {
            Err(GatewayError::Unreachable(host.name.clone()))
        }
    }

    fn policy(cooldown: Duration) -> ScalingPolicy {
        ScalingPolicy {
            group: "web".to_string(),
            increment: 2,
            high_water: 0.8,
            low_water: 0.3,
            cooldown,
        }
    }

    async fn setup(desired: u32) -> (Arc<GroupStore>, Arc<MetricsCollector>) {
        let groups = Arc::new(GroupStore::new(StateStore::open_in_memory().unwrap()));
        groups
            .sync(&[GroupDefinition {
                id: "web".to_string(),
                template: InstanceTemplate::new("ubuntu-24.04", Resources::new(1, 1 << 30, 0)),
                min_size: 1,
                max_size: 6,
                desired_size: desired,
                hosts: vec!["kvm-1".to_string()],
            }])
            .await
            .unwrap();
        let collector = Arc::new(MetricsCollector::new(
            Arc::new(NoSource),
            Arc::new(HostRegistry::new()),
            &MetricsConfig::default(),
        ));
        (groups, collector)
    }

    async fn scaler(desired: u32) -> (Autoscaler, Arc<GroupStore>, Arc<MetricsCollector>) {
        let (groups, collector) = setup(desired).await;
        let scaler = Autoscaler::new(
            Arc::clone(&groups),
            Arc::clone(&collector),
            vec![policy(Duration::ZERO)],
        );
        (scaler, groups, collector)
    }

    #[tokio::test]
    async fn scale_up_above_high_water() {
        let (mut scaler, _, _) = scaler(2).await;
        let p = policy(Duration::ZERO);
        assert_eq!(scaler.evaluate(&p, 0.9, 2, 1, 6, Instant::now()), ScaleDecision::ScaleTo(4));
    }

    #[tokio::test]
    async fn scale_up_is_capped_at_max() {
        let (mut scaler, _, _) = scaler(5).await;
        let p = policy(Duration::ZERO);
        assert_eq!(scaler.evaluate(&p, 0.95, 5, 1, 6, Instant::now()), ScaleDecision::ScaleTo(6));
        assert_eq!(scaler.evaluate(&p, 0.95, 6, 1, 6, Instant::now()), ScaleDecision::NoChange);
    }

    #[tokio::test]
    async fn scale_down_below_low_water_respects_min() {
        let (mut scaler, _, _) = scaler(2).await;
        let p = policy(Duration::ZERO);
        assert_eq!(scaler.evaluate(&p, 0.1, 4, 1, 6, Instant::now()), ScaleDecision::ScaleTo(2));
        assert_eq!(scaler.evaluate(&p, 0.1, 2, 1, 6, Instant::now()), ScaleDecision::ScaleTo(1));
        assert_eq!(scaler.evaluate(&p, 0.1, 1, 1, 6, Instant::now()), ScaleDecision::NoChange);
    }

    #[tokio::test]
    async fn no_change_between_water_marks() {
        let (mut scaler, _, _) = scaler(2).await;
        let p = policy(Duration::ZERO);
        assert_eq!(scaler.evaluate(&p, 0.5, 3, 1, 6, Instant::now()), ScaleDecision::NoChange);
        assert_eq!(scaler.evaluate(&p, 0.8, 3, 1, 6, Instant::now()), ScaleDecision::NoChange);
    }

    #[tokio::test]
    async fn cooldown_blocks_consecutive_changes() {
        let (mut scaler, _, _) = scaler(2).await;
        let p = policy(Duration::from_secs(60));
        let start = Instant::now();

        assert_eq!(scaler.evaluate(&p, 0.9, 2, 1, 6, start), ScaleDecision::ScaleTo(4));
        // Opposite direction is blocked too.
        assert_eq!(
            scaler.evaluate(&p, 0.1, 4, 1, 6, start + Duration::from_secs(30)),
            ScaleDecision::NoChange
        );
        assert_eq!(
            scaler.evaluate(&p, 0.9, 4, 1, 6, start + Duration::from_secs(60)),
            ScaleDecision::ScaleTo(6)
        );
    }

    #[tokio::test]
    async fn no_change_does_not_start_cooldown() {
        let (mut scaler, _, _) = scaler(2).await;
        let p = policy(Duration::from_secs(60));
        let start = Instant::now();
        assert_eq!(scaler.evaluate(&p, 0.5, 2, 1, 6, start), ScaleDecision::NoChange);
        assert_eq!(scaler.evaluate(&p, 0.9, 2, 1, 6, start), ScaleDecision::ScaleTo(4));
    }

    #[tokio::test]
    async fn evaluate_all_applies_to_group_store() {
        let (mut scaler, groups, collector) = scaler(2).await;
        collector.record("kvm-1", HostUtilization { cpu: 0.2, memory: 0.95 }).await;
        // Samples from hosts outside the group's pool are ignored.
        collector.record("kvm-2", HostUtilization { cpu: 0.0, memory: 0.0 }).await;

        let decisions = scaler.evaluate_all().await.unwrap();
        assert_eq!(decisions, vec![("web".to_string(), ScaleDecision::ScaleTo(4))]);
        assert_eq!(groups.target_size("web").unwrap(), 4);
    }

    #[tokio::test]
    async fn evaluate_all_skips_groups_without_samples() {
        let (mut scaler, groups, _) = scaler(2).await;
        assert!(scaler.evaluate_all().await.unwrap().is_empty());
        assert_eq!(groups.target_size("web").unwrap(), 2);
    }

    #[tokio::test]
    async fn policy_for_unknown_group_is_skipped() {
        let (groups, collector) = setup(2).await;
        let mut other = policy(Duration::ZERO);
        other.group = "batch".to_string();
        let mut scaler = Autoscaler::new(groups, Arc::clone(&collector), vec![other]);
        collector.record("kvm-1", HostUtilization { cpu: 0.9, memory: 0.9 }).await;
        assert!(scaler.evaluate_all().await.unwrap().is_empty());
    }

    #[test]
    fn policy_from_config() {
        let cfg = GroupScalingConfig {
            min: 1,
            max: 10,
            desired: 2,
            increment: 0,
            cooldown: "90s".to_string(),
            high_water: 0.75,
            low_water: 0.25,
        };
        let p = ScalingPolicy::from_config("web", &cfg);
        assert_eq!(p.increment, 1);
        assert_eq!(p.cooldown, Duration::from_secs(90));
        assert_eq!(p.high_water, 0.75);
    }
}
