//! Decision evaluation
//!
//! A posture profile carries an optional decision tree (produced externally
//! during calibration) and flat fallback thresholds. Evaluation is a pure
//! function of the profile and the feature vector:
//! - Tree present and well-formed: walk from the root, `<=` goes left
//! - Otherwise: threshold ladder over the instantaneous angle
//!
//! Boundary values always resolve to the lower-severity class.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::PostureError;
use crate::types::{
    Classification, ClassificationSource, FeatureVector, PostureClass, Sample, Thresholds,
    FEATURE_COUNT,
};

/// Confidence reported by the threshold fallback, per class
pub const FALLBACK_GOOD_CONFIDENCE: f64 = 0.9;
pub const FALLBACK_WARNING_CONFIDENCE: f64 = 0.6;
pub const FALLBACK_BAD_CONFIDENCE: f64 = 0.8;

/// A node of a decision tree stored as a flat arena
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecisionNode {
    Leaf {
        prediction: PostureClass,
        confidence: f64,
    },
    Branch {
        feature_index: usize,
        threshold: f64,
        /// Arena index taken when `feature <= threshold`
        left: usize,
        /// Arena index taken when `feature > threshold`
        right: usize,
    },
}

/// Structural defect found in a decision tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeDefect {
    Empty,
    DanglingChild { node: usize, child: usize },
    UnknownFeature { node: usize, feature_index: usize },
    NonFiniteThreshold { node: usize },
    ConfidenceOutOfRange { node: usize },
    Cycle { node: usize },
}

impl std::fmt::Display for TreeDefect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TreeDefect::Empty => write!(f, "tree has no nodes"),
            TreeDefect::DanglingChild { node, child } => {
                write!(f, "node {node} points at missing node {child}")
            }
            TreeDefect::UnknownFeature {
                node,
                feature_index,
            } => write!(f, "node {node} branches on unknown feature {feature_index}"),
            TreeDefect::NonFiniteThreshold { node } => {
                write!(f, "node {node} has a non-finite threshold")
            }
            TreeDefect::ConfidenceOutOfRange { node } => {
                write!(f, "leaf {node} has confidence outside [0, 1]")
            }
            TreeDefect::Cycle { node } => write!(f, "cycle through node {node}"),
        }
    }
}

/// Binary decision tree, root at index 0
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    pub nodes: Vec<DecisionNode>,
}

impl DecisionTree {
    pub fn new(nodes: Vec<DecisionNode>) -> Self {
        Self { nodes }
    }

    pub fn from_json(json: &str) -> Result<Self, PostureError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Check every reachable node; returns the first defect found
    pub fn validate(&self) -> Result<(), TreeDefect> {
        if self.nodes.is_empty() {
            return Err(TreeDefect::Empty);
        }

        // 0 = unvisited, 1 = on the current path, 2 = done
        let mut marks = vec![0u8; self.nodes.len()];
        let mut stack: Vec<(usize, bool)> = vec![(0, false)];

        while let Some((index, children_done)) = stack.pop() {
            if children_done {
                marks[index] = 2;
                continue;
            }
            match marks[index] {
                1 => return Err(TreeDefect::Cycle { node: index }),
                2 => continue,
                _ => {}
            }
            marks[index] = 1;
            stack.push((index, true));

            match &self.nodes[index] {
                DecisionNode::Leaf { confidence, .. } => {
                    if !(0.0..=1.0).contains(confidence) {
                        return Err(TreeDefect::ConfidenceOutOfRange { node: index });
                    }
                }
                DecisionNode::Branch {
                    feature_index,
                    threshold,
                    left,
                    right,
                } => {
                    if *feature_index >= FEATURE_COUNT {
                        return Err(TreeDefect::UnknownFeature {
                            node: index,
                            feature_index: *feature_index,
                        });
                    }
                    if !threshold.is_finite() {
                        return Err(TreeDefect::NonFiniteThreshold { node: index });
                    }
                    for child in [*left, *right] {
                        if child >= self.nodes.len() {
                            return Err(TreeDefect::DanglingChild { node: index, child });
                        }
                        if marks[child] == 1 {
                            return Err(TreeDefect::Cycle { node: child });
                        }
                        stack.push((child, false));
                    }
                }
            }
        }
        Ok(())
    }

    /// Walk the tree for one feature vector
    ///
    /// The walk is bounded by the arena size, so a cycle reports a defect
    /// instead of looping.
    pub fn walk(&self, features: &FeatureVector) -> Result<Classification, TreeDefect> {
        if self.nodes.is_empty() {
            return Err(TreeDefect::Empty);
        }
        let mut index = 0usize;
        let mut dominant_feature = None;

        for _ in 0..=self.nodes.len() {
            // `index` is bounds-checked before every move
            match &self.nodes[index] {
                DecisionNode::Leaf {
                    prediction,
                    confidence,
                } => {
                    if !(0.0..=1.0).contains(confidence) {
                        return Err(TreeDefect::ConfidenceOutOfRange { node: index });
                    }
                    return Ok(Classification {
                        class: *prediction,
                        confidence: *confidence,
                        dominant_feature,
                        source: ClassificationSource::Tree,
                    });
                }
                DecisionNode::Branch {
                    feature_index,
                    threshold,
                    left,
                    right,
                } => {
                    let value = features
                        .get(*feature_index)
                        .ok_or(TreeDefect::UnknownFeature {
                            node: index,
                            feature_index: *feature_index,
                        })?;
                    if !threshold.is_finite() {
                        return Err(TreeDefect::NonFiniteThreshold { node: index });
                    }
                    dominant_feature = Some(*feature_index);
                    let next = if value <= *threshold { *left } else { *right };
                    if next >= self.nodes.len() {
                        return Err(TreeDefect::DanglingChild {
                            node: index,
                            child: next,
                        });
                    }
                    index = next;
                }
            }
        }

        Err(TreeDefect::Cycle { node: index })
    }
}

/// Threshold ladder over the instantaneous angle
pub fn classify_by_thresholds(angle: f64, thresholds: &Thresholds) -> Classification {
    let (class, confidence) = if angle <= thresholds.good {
        (PostureClass::Good, FALLBACK_GOOD_CONFIDENCE)
    } else if angle <= thresholds.warning {
        (PostureClass::Warning, FALLBACK_WARNING_CONFIDENCE)
    } else {
        // Also covers NaN, which never compares `<=`
        (PostureClass::Bad, FALLBACK_BAD_CONFIDENCE)
    };
    Classification {
        class,
        confidence,
        dominant_feature: None,
        source: ClassificationSource::Thresholds,
    }
}

/// Evaluate the tree if present, falling back to thresholds on absence or defect
pub fn evaluate(
    tree: Option<&DecisionTree>,
    thresholds: &Thresholds,
    features: &FeatureVector,
) -> Classification {
    if let Some(tree) = tree {
        match tree.walk(features) {
            Ok(classification) => return classification,
            Err(defect) => {
                warn!(%defect, "malformed decision tree, using threshold fallback");
            }
        }
    }
    classify_by_thresholds(features.angle, thresholds)
}

/// Classify one sample, preferring the device's own prediction when present
pub fn classify_sample(
    profile: &PostureProfile,
    sample: &Sample,
    features: &FeatureVector,
) -> Classification {
    match sample.prediction {
        Some(prediction) if (0.0..=1.0).contains(&prediction.confidence) => Classification {
            class: prediction.class,
            confidence: prediction.confidence,
            dominant_feature: None,
            source: ClassificationSource::Device,
        },
        _ => profile.classify(features),
    }
}

/// Classifier inputs for one calibration profile, replaced wholesale on recalibration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PostureProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree: Option<DecisionTree>,
    #[serde(default)]
    pub thresholds: Thresholds,
}

impl PostureProfile {
    pub fn with_thresholds(thresholds: Thresholds) -> Self {
        Self {
            tree: None,
            thresholds,
        }
    }

    /// Build a profile, dropping a tree that fails validation
    pub fn new(tree: Option<DecisionTree>, thresholds: Thresholds) -> Result<Self, PostureError> {
        thresholds.validate()?;
        let tree = match tree {
            Some(tree) => match tree.validate() {
                Ok(()) => Some(tree),
                Err(defect) => {
                    warn!(%defect, "discarding malformed decision tree");
                    None
                }
            },
            None => None,
        };
        Ok(Self { tree, thresholds })
    }

    pub fn from_json(json: &str) -> Result<Self, PostureError> {
        let raw: PostureProfile = serde_json::from_str(json)?;
        Self::new(raw.tree, raw.thresholds)
    }

    pub fn has_tree(&self) -> bool {
        self.tree.is_some()
    }

    pub fn classify(&self, features: &FeatureVector) -> Classification {
        evaluate(self.tree.as_ref(), &self.thresholds, features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn leaf(prediction: PostureClass, confidence: f64) -> DecisionNode {
        DecisionNode::Leaf {
            prediction,
            confidence,
        }
    }

    fn branch(feature_index: usize, threshold: f64, left: usize, right: usize) -> DecisionNode {
        DecisionNode::Branch {
            feature_index,
            threshold,
            left,
            right,
        }
    }

    /// mean <= 8 → Good, mean <= 15 → Warning, else Bad
    fn ladder_tree() -> DecisionTree {
        DecisionTree::new(vec![
            branch(0, 8.0, 1, 2),
            leaf(PostureClass::Good, 0.95),
            branch(0, 15.0, 3, 4),
            leaf(PostureClass::Warning, 0.7),
            leaf(PostureClass::Bad, 0.85),
        ])
    }

    fn with_mean(mean: f64) -> FeatureVector {
        FeatureVector {
            mean,
            angle: mean,
            ..Default::default()
        }
    }

    #[test]
    fn test_tree_walk_warning() {
        let result = ladder_tree().walk(&with_mean(10.0)).unwrap();
        assert_eq!(result.class, PostureClass::Warning);
        assert_eq!(result.confidence, 0.7);
        assert_eq!(result.dominant_feature, Some(0));
        assert_eq!(result.source, ClassificationSource::Tree);
    }

    #[test]
    fn test_tree_boundary_goes_left() {
        let tree = ladder_tree();
        assert_eq!(tree.walk(&with_mean(8.0)).unwrap().class, PostureClass::Good);
        assert_eq!(tree.walk(&with_mean(15.0)).unwrap().class, PostureClass::Warning);
        assert_eq!(tree.walk(&with_mean(15.01)).unwrap().class, PostureClass::Bad);
    }

    #[test]
    fn test_dominant_feature_is_last_branch() {
        let tree = DecisionTree::new(vec![
            branch(0, 8.0, 1, 2),
            leaf(PostureClass::Good, 0.9),
            branch(3, 2.0, 3, 4),
            leaf(PostureClass::Warning, 0.6),
            leaf(PostureClass::Bad, 0.9),
        ]);
        let features = FeatureVector {
            mean: 12.0,
            angular_velocity: 5.0,
            ..Default::default()
        };
        let result = tree.walk(&features).unwrap();
        assert_eq!(result.class, PostureClass::Bad);
        assert_eq!(result.dominant_feature, Some(3));
    }

    #[test]
    fn test_single_leaf_tree() {
        let tree = DecisionTree::new(vec![leaf(PostureClass::Good, 1.0)]);
        let result = tree.walk(&with_mean(80.0)).unwrap();
        assert_eq!(result.class, PostureClass::Good);
        assert_eq!(result.dominant_feature, None);
    }

    #[test]
    fn test_validate_detects_defects() {
        assert_eq!(ladder_tree().validate(), Ok(()));
        assert_eq!(DecisionTree::new(vec![]).validate(), Err(TreeDefect::Empty));

        let dangling = DecisionTree::new(vec![branch(0, 1.0, 1, 7), leaf(PostureClass::Good, 0.9)]);
        assert_eq!(
            dangling.validate(),
            Err(TreeDefect::DanglingChild { node: 0, child: 7 })
        );

        let cyclic = DecisionTree::new(vec![branch(0, 1.0, 1, 2), leaf(PostureClass::Good, 0.9), branch(1, 1.0, 0, 1)]);
        assert!(matches!(cyclic.validate(), Err(TreeDefect::Cycle { .. })));

        let unknown = DecisionTree::new(vec![branch(9, 1.0, 1, 1), leaf(PostureClass::Good, 0.9)]);
        assert!(matches!(unknown.validate(), Err(TreeDefect::UnknownFeature { .. })));

        let confident = DecisionTree::new(vec![leaf(PostureClass::Good, 1.5)]);
        assert!(matches!(confident.validate(), Err(TreeDefect::ConfidenceOutOfRange { .. })));
    }

    #[test]
    fn test_cyclic_walk_terminates() {
        let tree = DecisionTree::new(vec![branch(0, 100.0, 0, 0)]);
        assert!(matches!(tree.walk(&with_mean(1.0)), Err(TreeDefect::Cycle { .. })));
    }

    #[test]
    fn test_malformed_tree_falls_back() {
        let tree = DecisionTree::new(vec![branch(0, 8.0, 1, 5), leaf(PostureClass::Good, 0.9)]);
        let result = evaluate(Some(&tree), &Thresholds::default(), &with_mean(12.0));
        assert_eq!(result.class, PostureClass::Warning);
        assert_eq!(result.source, ClassificationSource::Thresholds);
    }

    #[test]
    fn test_threshold_ladder() {
        let thresholds = Thresholds::default();
        assert_eq!(classify_by_thresholds(3.0, &thresholds).class, PostureClass::Good);
        assert_eq!(classify_by_thresholds(8.0, &thresholds).class, PostureClass::Good);
        assert_eq!(classify_by_thresholds(8.5, &thresholds).class, PostureClass::Warning);
        assert_eq!(classify_by_thresholds(15.0, &thresholds).class, PostureClass::Warning);
        assert_eq!(classify_by_thresholds(30.0, &thresholds).class, PostureClass::Bad);
        assert_eq!(classify_by_thresholds(30.0, &thresholds).confidence, 0.8);
        assert_eq!(classify_by_thresholds(f64::NAN, &thresholds).class, PostureClass::Bad);
    }

    #[test]
    fn test_profile_drops_malformed_tree() {
        let json = r#"{
            "tree": {"nodes": [{"type": "branch", "feature_index": 0, "threshold": 8.0, "left": 1, "right": 3}]},
            "thresholds": {"good": 5.0, "warning": 10.0, "bad": 20.0}
        }"#;
        let profile = PostureProfile::from_json(json).unwrap();
        assert!(!profile.has_tree());
        assert_eq!(profile.thresholds.good, 5.0);
    }

    #[test]
    fn test_profile_keeps_valid_tree() {
        let profile = PostureProfile::new(Some(ladder_tree()), Thresholds::default()).unwrap();
        let json = serde_json::to_string(&profile).unwrap();
        let loaded = PostureProfile::from_json(&json).unwrap();
        assert_eq!(loaded, profile);
        assert_eq!(loaded.classify(&with_mean(10.0)).class, PostureClass::Warning);
    }

    #[test]
    fn test_device_prediction_preferred() {
        let profile = PostureProfile::default();
        let sample = Sample::new(0, 2.0).with_prediction(PostureClass::Bad, 0.75);
        let result = classify_sample(&profile, &sample, &with_mean(2.0));
        assert_eq!(result.class, PostureClass::Bad);
        assert_eq!(result.source, ClassificationSource::Device);

        let junk = Sample::new(0, 2.0).with_prediction(PostureClass::Bad, 7.0);
        let result = classify_sample(&profile, &junk, &with_mean(2.0));
        assert_eq!(result.class, PostureClass::Good);
        assert_eq!(result.source, ClassificationSource::Thresholds);
    }

    proptest! {
        #[test]
        fn prop_thresholds_monotonic(a in -90.0f64..90.0, b in -90.0f64..90.0) {
            let thresholds = Thresholds::default();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let lo_class = classify_by_thresholds(lo, &thresholds).class;
            let hi_class = classify_by_thresholds(hi, &thresholds).class;
            prop_assert!(lo_class <= hi_class);
        }

        #[test]
        fn prop_tree_is_deterministic(mean in -90.0f64..90.0, velocity in 0.0f64..50.0) {
            let tree = ladder_tree();
            let features = FeatureVector { mean, angular_velocity: velocity, ..Default::default() };
            let first = evaluate(Some(&tree), &Thresholds::default(), &features);
            let second = evaluate(Some(&tree), &Thresholds::default(), &features);
            prop_assert_eq!(first, second);
        }
    }
}
