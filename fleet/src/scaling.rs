//! Scaling and rebalancing decisions
//!
//! Pure functions over instance loads so the arithmetic can be checked
//! without a runtime.

use botfleet_config::ScalingPolicy;
use botfleet_types::{InstanceId, StrategyId};
use chrono::{DateTime, Utc};

/// Instance count the autoscaler wants
///
/// `ceil(current × max(cpu / targetCpu, mem / targetMem))` plus pending
/// scale-up requests, clamped to the policy bounds.
pub fn desired_count(
    current: usize,
    avg_cpu: f64,
    avg_memory: f64,
    pending_scale_up: usize,
    policy: &ScalingPolicy,
) -> usize {
    let cpu_ratio = avg_cpu / policy.target_cpu_utilization;
    let memory_ratio = avg_memory / policy.target_memory_utilization;
    let ratio = cpu_ratio.max(memory_ratio);

    let scaled = if current == 0 || !ratio.is_finite() || ratio <= 0.0 {
        current
    } else {
        (current as f64 * ratio).ceil() as usize
    };

    scaled
        .saturating_add(pending_scale_up)
        .clamp(policy.min_instances, policy.max_instances)
}

/// Load of one instance, as seen by scale-down and rebalance
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceLoad {
    pub instance_id: InstanceId,
    pub strategies: Vec<StrategyId>,
    pub created_at: DateTime<Utc>,
}

/// Removal preference: fewest strategies, then oldest
pub fn removal_order(loads: &[InstanceLoad]) -> Vec<InstanceId> {
    let mut ordered: Vec<&InstanceLoad> = loads.iter().collect();
    ordered.sort_by(|a, b| {
        a.strategies
            .len()
            .cmp(&b.strategies.len())
            .then(a.created_at.cmp(&b.created_at))
            .then(a.instance_id.cmp(&b.instance_id))
    });
    ordered.into_iter().map(|l| l.instance_id.clone()).collect()
}

/// One strategy move proposed by [`plan_moves`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedMove {
    pub strategy_id: StrategyId,
    pub from: InstanceId,
    pub to: InstanceId,
}

/// Moves that bring every instance to at most `ceil(total / instances)`
pub fn plan_moves(loads: &[InstanceLoad]) -> Vec<PlannedMove> {
    if loads.len() < 2 {
        return Vec::new();
    }
    let total: usize = loads.iter().map(|l| l.strategies.len()).sum();
    let target = total.div_ceil(loads.len());

    let mut sorted: Vec<&InstanceLoad> = loads.iter().collect();
    sorted.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

    // Spare capacity per underloaded instance
    let mut receivers: Vec<(InstanceId, usize)> = sorted
        .iter()
        .filter(|l| l.strategies.len() < target)
        .map(|l| (l.instance_id.clone(), target - l.strategies.len()))
        .collect();

    let mut moves = Vec::new();
    for load in sorted.iter().filter(|l| l.strategies.len() > target) {
        let mut strategies = load.strategies.clone();
        strategies.sort();
        let excess = strategies.split_off(target);

        for strategy_id in excess {
            let Some(receiver) = receivers.iter_mut().find(|(_, room)| *room > 0) else {
                return moves;
            };
            receiver.1 -= 1;
            moves.push(PlannedMove {
                strategy_id,
                from: load.instance_id.clone(),
                to: receiver.0.clone(),
            });
        }
    }
    moves
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn policy(min: usize, max: usize) -> ScalingPolicy {
        ScalingPolicy {
            min_instances: min,
            max_instances: max,
            target_cpu_utilization: 70.0,
            target_memory_utilization: 80.0,
            ..Default::default()
        }
    }

    fn load(id: &str, strategies: usize, age_secs: i64) -> InstanceLoad {
        InstanceLoad {
            instance_id: id.to_string(),
            strategies: (0..strategies).map(|n| format!("{}-s{}", id, n)).collect(),
            created_at: Utc::now() - Duration::seconds(age_secs),
        }
    }

    #[test]
    fn test_scale_up_on_cpu() {
        // 2 × 105/70 = 3
        assert_eq!(desired_count(2, 105.0, 10.0, 0, &policy(1, 10)), 3);
    }

    #[test]
    fn test_memory_dominates_when_higher() {
        // 4 × max(35/70, 100/80) = 5
        assert_eq!(desired_count(4, 35.0, 100.0, 0, &policy(1, 10)), 5);
    }

    #[test]
    fn test_scale_down_is_clamped_to_min() {
        assert_eq!(desired_count(5, 1.0, 1.0, 0, &policy(2, 10)), 2);
    }

    #[test]
    fn test_pending_requests_add_capacity() {
        assert_eq!(desired_count(3, 70.0, 80.0, 1, &policy(1, 10)), 4);
        assert_eq!(desired_count(10, 70.0, 80.0, 1, &policy(1, 10)), 10);
    }

    #[test]
    fn test_empty_fleet_starts_at_min() {
        assert_eq!(desired_count(0, 0.0, 0.0, 0, &policy(2, 5)), 2);
    }

    #[test]
    fn test_removal_prefers_fewest_then_oldest() {
        let loads = vec![
            load("i-a", 2, 100),
            load("i-b", 0, 10),
            load("i-c", 0, 500),
            load("i-d", 1, 1000),
        ];
        assert_eq!(removal_order(&loads), vec!["i-c", "i-b", "i-d", "i-a"]);
    }

    #[test]
    fn test_plan_moves_levels_load() {
        let loads = vec![load("i-1", 5, 0), load("i-2", 1, 0), load("i-3", 0, 0)];
        let moves = plan_moves(&loads);

        // total 6 over 3 instances → at most 2 each
        assert_eq!(moves.len(), 3);
        assert!(moves.iter().all(|m| m.from == "i-1"));
        assert_eq!(moves.iter().filter(|m| m.to == "i-2").count(), 1);
        assert_eq!(moves.iter().filter(|m| m.to == "i-3").count(), 2);
    }

    #[test]
    fn test_balanced_fleet_has_no_moves() {
        let loads = vec![load("i-1", 2, 0), load("i-2", 2, 0), load("i-3", 1, 0)];
        assert!(plan_moves(&loads).is_empty());
        assert!(plan_moves(&[load("i-1", 7, 0)]).is_empty());
    }

    proptest! {
        #[test]
        fn prop_desired_count_within_bounds(
            current in 0usize..40,
            cpu in 0.0f64..400.0,
            memory in 0.0f64..400.0,
            pending in 0usize..5,
            min in 0usize..5,
            span in 0usize..20,
        ) {
            let policy = policy(min, min + span);
            let desired = desired_count(current, cpu, memory, pending, &policy);
            prop_assert!(desired >= policy.min_instances);
            prop_assert!(desired <= policy.max_instances);
        }

        #[test]
        fn prop_desired_count_covers_utilization(
            current in 1usize..20,
            cpu in 0.0f64..300.0,
            memory in 0.0f64..300.0,
        ) {
            let policy = policy(0, 1000);
            let desired = desired_count(current, cpu, memory, 0, &policy);
            // The new fleet brings average utilization back to the targets
            let ratio = (cpu / 70.0).max(memory / 80.0);
            if ratio > 0.0 {
                prop_assert!(desired as f64 >= current as f64 * ratio - 1e-9);
                prop_assert!((desired as f64) < current as f64 * ratio + 1.0);
            }
        }

        #[test]
        fn prop_moves_never_exceed_target(sizes in proptest::collection::vec(0usize..12, 2..6)) {
            let loads: Vec<InstanceLoad> = sizes
                .iter()
                .enumerate()
                .map(|(n, size)| load(&format!("i-{}", n), *size, 0))
                .collect();
            let total: usize = sizes.iter().sum();
            let target = total.div_ceil(sizes.len());

            let moves = plan_moves(&loads);
            for l in &loads {
                let out = moves.iter().filter(|m| m.from == l.instance_id).count();
                let incoming = moves.iter().filter(|m| m.to == l.instance_id).count();
                prop_assert!(l.strategies.len() - out + incoming <= target);
            }
        }
    }
}
