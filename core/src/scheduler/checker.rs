// Firing classification run by the trigger phase

use crate::models::{FiredJob, FiredStatus, Timestamp};

/// A single classification rule.
///
/// Returns `None` when the rule has no opinion about the firing, letting the
/// next checker in the chain decide.
pub trait JobChecker: Send + Sync {
    fn check(&self, job: &FiredJob, now: Timestamp) -> Option<FiredStatus>;
}

/// Rejects firings that are later than the definition's misfire threshold
#[derive(Debug, Clone, Copy, Default)]
pub struct MisfireChecker;

impl JobChecker for MisfireChecker {
    fn check(&self, job: &FiredJob, now: Timestamp) -> Option<FiredStatus> {
        // Early firings (negative lateness) come from the acquire lookahead
        let lateness = now - job.fired.fired_time;
        if lateness <= job.detail.misfire_threshold {
            return None;
        }
        Some(job.detail.misfire_policy.classification())
    }
}

/// Ordered list of checkers; the first decisive answer wins and a firing
/// nobody objects to is executed
pub struct CheckerChain {
    checkers: Vec<Box<dyn JobChecker>>,
}

impl CheckerChain {
    /// Chain without any rule: every firing executes
    pub fn empty() -> Self {
        Self {
            checkers: Vec::new(),
        }
    }

    pub fn with_checker(mut self, checker: impl JobChecker + 'static) -> Self {
        self.checkers.push(Box::new(checker));
        self
    }

    pub fn len(&self) -> usize {
        self.checkers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkers.is_empty()
    }

    pub fn check(&self, job: &FiredJob, now: Timestamp) -> FiredStatus {
        self.checkers
            .iter()
            .find_map(|checker| checker.check(job, now))
            .unwrap_or(FiredStatus::Executing)
    }
}

impl Default for CheckerChain {
    fn default() -> Self {
        Self::empty().with_checker(MisfireChecker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobDetail, JobFired, JobStatus, MisfirePolicy};
    use proptest::prelude::*;

    fn fired_job(fired_time: Timestamp, threshold: i64) -> FiredJob {
        FiredJob {
            fired: JobFired {
                id: 1,
                job_detail_id: 1,
                fired_time,
                status: FiredStatus::Acquired,
                created_time: 0,
                updated_time: 0,
            },
            detail: JobDetail {
                id: 1,
                name: "job".to_string(),
                pool: "default".to_string(),
                source: "MAIN".to_string(),
                class: "log".to_string(),
                args: serde_json::Value::Null,
                priority: 100,
                expression: None,
                next_fire_time: fired_time,
                pre_fire_time: None,
                misfire_threshold: threshold,
                misfire_policy: MisfirePolicy::Missed,
                status: JobStatus::Acquired,
                deleted: false,
                deleted_time: None,
                created_time: 0,
                updated_time: 0,
            },
        }
    }

    struct AlwaysMissed;

    impl JobChecker for AlwaysMissed {
        fn check(&self, _job: &FiredJob, _now: Timestamp) -> Option<FiredStatus> {
            Some(FiredStatus::Missed)
        }
    }

    #[test]
    fn test_on_time_firing_executes() {
        let chain = CheckerChain::default();
        assert_eq!(chain.check(&fired_job(1_000, 300), 1_001), FiredStatus::Executing);
    }

    #[test]
    fn test_threshold_boundary_is_inclusive() {
        let chain = CheckerChain::default();
        assert_eq!(chain.check(&fired_job(1_000, 300), 1_300), FiredStatus::Executing);
        assert_eq!(chain.check(&fired_job(1_000, 300), 1_301), FiredStatus::Missed);
    }

    #[test]
    fn test_far_past_firing_is_missed() {
        let chain = CheckerChain::default();
        assert_eq!(chain.check(&fired_job(0, 300), 10_000), FiredStatus::Missed);
    }

    #[test]
    fn test_early_firing_executes() {
        let chain = CheckerChain::default();
        assert_eq!(chain.check(&fired_job(1_060, 300), 1_000), FiredStatus::Executing);
    }

    #[test]
    fn test_first_decisive_checker_wins() {
        let chain = CheckerChain::empty()
            .with_checker(AlwaysMissed)
            .with_checker(MisfireChecker);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.check(&fired_job(1_000, 300), 1_000), FiredStatus::Missed);
    }

    #[test]
    fn test_empty_chain_always_executes() {
        let chain = CheckerChain::empty();
        assert!(chain.is_empty());
        assert_eq!(chain.check(&fired_job(0, 0), i64::MAX / 2), FiredStatus::Executing);
    }

    proptest! {
        #[test]
        fn prop_classification_follows_lateness(
            fired_time in 0i64..1_000_000,
            lateness in -120i64..100_000,
            threshold in 0i64..10_000,
        ) {
            let chain = CheckerChain::default();
            let status = chain.check(&fired_job(fired_time, threshold), fired_time + lateness);
            if lateness <= threshold {
                prop_assert_eq!(status, FiredStatus::Executing);
            } else {
                prop_assert_eq!(status, FiredStatus::Missed);
            }
        }
    }
}
