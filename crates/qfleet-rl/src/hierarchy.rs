//! Hierarchical aggregation of learners
//!
//! Individual agent kinds feed a category learner, categories feed a fleet
//! learner. Each level is an ordinary [`QLearner`] keyed by a coarser agent
//! kind; children are blended into the parent with an exponential moving
//! average.

use std::sync::Arc;

use tracing::debug;

use qfleet_core::{QFleetError, Result};

use crate::learner::QLearner;

/// Blends the tables of child learners into one parent learner
pub struct HierarchicalAggregator {
    parent: Arc<QLearner>,
    children: Vec<Arc<QLearner>>,
    blend_rate: f64,
}

impl HierarchicalAggregator {
    /// `blend_rate` is the EMA weight given to child values, in (0, 1]
    pub fn new(parent: Arc<QLearner>, blend_rate: f64) -> Result<Self> {
        if !(blend_rate > 0.0 && blend_rate <= 1.0) {
            return Err(QFleetError::Config(format!(
                "blend_rate must be in (0, 1], got {blend_rate}"
            )));
        }
        Ok(Self {
            parent,
            children: Vec::new(),
            blend_rate,
        })
    }

    pub fn with_child(mut self, child: Arc<QLearner>) -> Self {
        self.children.push(child);
        self
    }

    pub fn parent(&self) -> &Arc<QLearner> {
        &self.parent
    }

    pub fn children(&self) -> &[Arc<QLearner>] {
        &self.children
    }

    /// Blend every child's current table into the parent.
    ///
    /// Returns the number of entries blended.
    pub async fn aggregate(&self) -> usize {
        let mut blended = 0;
        for child in &self.children {
            let entries = child.snapshot().await;
            blended += self.parent.blend(&entries, self.blend_rate).await;
        }
        debug!(
            "Blended {} entries from {} children into {}",
            blended,
            self.children.len(),
            self.parent.agent_kind()
        );
        blended
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qfleet_core::{LearnerConfig, StateFingerprint};

    fn learner(kind: &str) -> Arc<QLearner> {
        Arc::new(QLearner::new(kind, LearnerConfig::greedy().with_learning_rate(1.0)).unwrap())
    }

    #[test]
    fn test_rejects_bad_blend_rate() {
        assert!(HierarchicalAggregator::new(learner("fleet"), 0.0).is_err());
        assert!(HierarchicalAggregator::new(learner("fleet"), 1.5).is_err());
    }

    #[tokio::test]
    async fn test_aggregate_blends_children() {
        let fp = StateFingerprint::from_raw("s");
        let gen = learner("test-generator");
        let cov = learner("coverage-analyzer");
        gen.update(&fp, "a", 10.0, None, &[]).await.unwrap();
        cov.update(&fp, "a", 20.0, None, &[]).await.unwrap();

        let category = learner("testing");
        let aggregator = HierarchicalAggregator::new(category.clone(), 0.5)
            .unwrap()
            .with_child(gen)
            .with_child(cov);

        assert_eq!(aggregator.aggregate().await, 2);
        // Adopt 10, then 0.5 * 10 + 0.5 * 20
        let value = category.entry(&fp, "a").await.unwrap().q_value;
        assert!((value - 15.0).abs() < 1e-12);
        assert_eq!(category.stats().await.dirty_entries, 1);
    }

    #[tokio::test]
    async fn test_multi_level_hierarchy() {
        let fp = StateFingerprint::from_raw("s");
        let gen = learner("test-generator");
        gen.update(&fp, "a", 8.0, None, &[]).await.unwrap();

        let category = learner("testing");
        let fleet = learner("fleet");
        let level1 = HierarchicalAggregator::new(category.clone(), 1.0).unwrap().with_child(gen);
        let level2 = HierarchicalAggregator::new(fleet.clone(), 1.0).unwrap().with_child(category);

        level1.aggregate().await;
        level2.aggregate().await;
        assert_eq!(fleet.entry(&fp, "a").await.unwrap().q_value, 8.0);
        assert_eq!(level2.children().len(), 1);
    }
}
