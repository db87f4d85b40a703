//! Quorum counting over a possibly-joint cluster configuration.

use std::collections::BTreeSet;

use crate::raft_types::NodeId;

/// The set of nodes a leader must replicate to, possibly spanning two
/// constituent sets during a joint-consensus membership change.
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ClusterConfiguration {
    pub nodes: BTreeSet<NodeId>,
    pub joint: Option<JointConfiguration>,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct JointConfiguration {
    pub old_nodes: BTreeSet<NodeId>,
}

impl ClusterConfiguration {
    pub fn new_initial(id: NodeId) -> Self {
        let mut nodes = BTreeSet::new();
        nodes.insert(id);
        Self { nodes, joint: None }
    }

    pub fn new_uniform(nodes: BTreeSet<NodeId>) -> Self {
        Self { nodes, joint: None }
    }

    pub fn new_joint(old_nodes: BTreeSet<NodeId>, new_nodes: BTreeSet<NodeId>) -> Self {
        Self { nodes: new_nodes, joint: Some(JointConfiguration { old_nodes }) }
    }

    pub fn is_joint(&self) -> bool {
        self.joint.is_some()
    }

    /// All nodes a leader must send RPCs to: the union of old and new sets.
    pub fn all_nodes(&self) -> BTreeSet<NodeId> {
        let mut all = self.nodes.clone();
        if let Some(joint) = &self.joint {
            all.extend(joint.old_nodes.iter().copied());
        }
        all
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains(&id) || self.joint.as_ref().map_or(false, |j| j.old_nodes.contains(&id))
    }

    pub fn to_final(&self) -> Self {
        Self { nodes: self.nodes.clone(), joint: None }
    }

    /// `true` iff `matched` contains a quorum of every constituent set of this
    /// configuration (both old and new, when in joint consensus).
    pub fn has_quorum<F>(&self, is_matched: F) -> bool
    where
        F: Fn(NodeId) -> bool,
    {
        let new_ok = is_majority(&self.nodes, &is_matched);
        match &self.joint {
            None => new_ok,
            Some(joint) => new_ok && is_majority(&joint.old_nodes, &is_matched),
        }
    }
}

fn is_majority<F>(set: &BTreeSet<NodeId>, is_matched: &F) -> bool
where
    F: Fn(NodeId) -> bool,
{
    if set.is_empty() {
        return true;
    }
    let matched = set.iter().filter(|id| is_matched(**id)).count();
    matched * 2 > set.len()
}

#[cfg(test)]
mod test {
    use super::*;
    use maplit::btreeset;

    #[test]
    fn uniform_quorum_is_simple_majority() {
        let cfg = ClusterConfiguration::new_uniform(btreeset! {1, 2, 3});
        assert!(cfg.has_quorum(|id| id == 1 || id == 2));
        assert!(!cfg.has_quorum(|id| id == 1));
    }

    #[test]
    fn joint_quorum_needs_majority_of_both_sets() {
        let cfg = ClusterConfiguration::new_joint(btreeset! {1, 2, 3}, btreeset! {3, 4, 5});
        // Majority of new (3,4) but not of old.
        assert!(!cfg.has_quorum(|id| matches!(id, 3 | 4)));
        // Majority of both.
        assert!(cfg.has_quorum(|id| matches!(id, 1 | 2 | 3 | 4)));
    }
}
