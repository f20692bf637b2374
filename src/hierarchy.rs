//! Agent/delegation graph: parent/child hierarchy with depth and fan-out
//! limits, cycle prevention, and traversal (spec §4.E).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;
#[cfg(feature = "diagnostics")]
use miette::Diagnostic;

use crate::config::HierarchyLimits;
use crate::event_bus::{EmitterError, Event, EventEmitter, HierarchyEvent};

#[derive(Debug, Error)]
#[cfg_attr(feature = "diagnostics", derive(Diagnostic))]
pub enum HierarchyError {
    #[error("agent {0} is already registered")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(swarmctl::hierarchy::duplicate)))]
    AlreadyRegistered(String),
    #[error("parent {0} does not exist")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(swarmctl::hierarchy::unknown_parent)))]
    UnknownParent(String),
    #[error("parent {parent} already has {max_children} children")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(swarmctl::hierarchy::max_children)))]
    MaxChildrenExceeded { parent: String, max_children: usize },
    #[error("depth {depth} exceeds maximum {max_depth}")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(swarmctl::hierarchy::max_depth)))]
    MaxDepthExceeded { depth: u32, max_depth: u32 },
    #[error("registering {candidate} under {ancestor} would create a cycle")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(swarmctl::hierarchy::cycle)))]
    WouldCreateCycle { ancestor: String, candidate: String },
    #[error("delegation {0} is already registered")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(swarmctl::hierarchy::duplicate_delegation)))]
    DuplicateDelegation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DelegationStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl DelegationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DelegationStatus::Completed | DelegationStatus::Failed | DelegationStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentNode {
    pub agent_id: String,
    pub parent_id: Option<String>,
    pub depth: u32,
    pub children: Vec<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationRecord {
    pub id: String,
    pub parent_agent_id: String,
    pub child_agent_id: String,
    pub task_id: String,
    pub status: DelegationStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HierarchyTree {
    pub node: AgentNode,
    pub children: Vec<HierarchyTree>,
}

#[derive(Debug, Clone)]
pub struct DelegationCapacity {
    pub can_delegate: bool,
    pub reason: Option<String>,
    pub remaining_depth: u32,
    pub remaining_children: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HierarchyExport {
    pub nodes: Vec<AgentNode>,
    pub delegations: Vec<DelegationRecord>,
}

#[derive(Default)]
struct Indexes {
    by_depth: FxHashMap<u32, FxHashSet<String>>,
    by_status: FxHashMap<String, FxHashSet<String>>,
    roots: FxHashSet<String>,
}

impl Indexes {
    fn insert(&mut self, node: &AgentNode) {
        self.by_depth.entry(node.depth).or_default().insert(node.agent_id.clone());
        self.by_status.entry(node.status.clone()).or_default().insert(node.agent_id.clone());
        if node.parent_id.is_none() {
            self.roots.insert(node.agent_id.clone());
        }
    }

    fn remove(&mut self, node: &AgentNode) {
        if let Some(set) = self.by_depth.get_mut(&node.depth) {
            set.remove(&node.agent_id);
        }
        if let Some(set) = self.by_status.get_mut(&node.status) {
            set.remove(&node.agent_id);
        }
        self.roots.remove(&node.agent_id);
    }

    fn move_status(&mut self, agent_id: &str, old: &str, new: &str) {
        if let Some(set) = self.by_status.get_mut(old) {
            set.remove(agent_id);
        }
        self.by_status.entry(new.to_string()).or_default().insert(agent_id.to_string());
    }
}

pub struct HierarchyRegistry {
    limits: HierarchyLimits,
    nodes: parking_lot::RwLock<FxHashMap<String, AgentNode>>,
    delegations: parking_lot::RwLock<FxHashMap<String, DelegationRecord>>,
    indexes: parking_lot::RwLock<Indexes>,
    emitter: Option<Arc<dyn EventEmitter>>,
}

impl HierarchyRegistry {
    pub fn new(limits: HierarchyLimits) -> Self {
        Self {
            limits,
            nodes: parking_lot::RwLock::new(FxHashMap::default()),
            delegations: parking_lot::RwLock::new(FxHashMap::default()),
            indexes: parking_lot::RwLock::new(Indexes::default()),
            emitter: None,
        }
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    #[tracing::instrument(skip(self, metadata), fields(agent_id = %child_id))]
    pub fn register_hierarchy(
        &self,
        parent_id: Option<&str>,
        child_id: &str,
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<(), HierarchyError> {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(child_id) {
            return Err(HierarchyError::AlreadyRegistered(child_id.to_string()));
        }

        let depth = match parent_id {
            None => 0,
            Some(parent) => {
                let parent_node = nodes.get(parent).ok_or_else(|| HierarchyError::UnknownParent(parent.to_string()))?;
                if parent_node.children.len() >= self.limits.max_children {
                    return Err(HierarchyError::MaxChildrenExceeded {
                        parent: parent.to_string(),
                        max_children: self.limits.max_children,
                    });
                }
                let depth = parent_node.depth + 1;
                if depth > self.limits.max_depth {
                    return Err(HierarchyError::MaxDepthExceeded { depth, max_depth: self.limits.max_depth });
                }
                if self.would_create_cycle(&nodes, parent, child_id) {
                    return Err(HierarchyError::WouldCreateCycle {
                        ancestor: parent.to_string(),
                        candidate: child_id.to_string(),
                    });
                }
                depth
            }
        };

        let now = Utc::now();
        let node = AgentNode {
            agent_id: child_id.to_string(),
            parent_id: parent_id.map(str::to_string),
            depth,
            children: Vec::new(),
            status: "idle".to_string(),
            created_at: now,
            updated_at: now,
            metadata: metadata.unwrap_or_default(),
        };

        if let Some(parent) = parent_id
            && let Some(parent_node) = nodes.get_mut(parent)
        {
            parent_node.children.push(child_id.to_string());
            parent_node.updated_at = now;
        }

        self.indexes.write().insert(&node);
        nodes.insert(child_id.to_string(), node);
        drop(nodes);

        self.emit(Event::Hierarchy(HierarchyEvent::Registered {
            agent_id: child_id.to_string(),
            parent_id: parent_id.map(str::to_string),
            depth,
        }));
        Ok(())
    }

    fn would_create_cycle(&self, nodes: &FxHashMap<String, AgentNode>, ancestor: &str, candidate: &str) -> bool {
        let mut cursor = Some(ancestor.to_string());
        let mut hops = 0usize;
        while let Some(id) = cursor {
            if id == candidate {
                return true;
            }
            hops += 1;
            if hops > self.limits.max_depth as usize + 2 {
                return false;
            }
            cursor = nodes.get(&id).and_then(|n| n.parent_id.clone());
        }
        false
    }

    pub fn register_delegation(
        &self,
        id: &str,
        parent_agent_id: &str,
        child_agent_id: &str,
        task_id: &str,
    ) -> Result<DelegationRecord, HierarchyError> {
        let mut delegations = self.delegations.write();
        if delegations.contains_key(id) {
            return Err(HierarchyError::DuplicateDelegation(id.to_string()));
        }
        let record = DelegationRecord {
            id: id.to_string(),
            parent_agent_id: parent_agent_id.to_string(),
            child_agent_id: child_agent_id.to_string(),
            task_id: task_id.to_string(),
            status: DelegationStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            result: None,
            error: None,
        };
        delegations.insert(id.to_string(), record.clone());
        Ok(record)
    }

    pub fn update_delegation_status(
        &self,
        id: &str,
        status: DelegationStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Option<DelegationRecord> {
        let mut delegations = self.delegations.write();
        let record = delegations.get_mut(id)?;
        let from = format!("{:?}", record.status);
        record.status = status;
        if status.is_terminal() {
            record.completed_at = Some(Utc::now());
        }
        record.result = result.or(record.result.take());
        record.error = error.or(record.error.take());
        let updated = record.clone();
        drop(delegations);
        self.emit(Event::Hierarchy(HierarchyEvent::DelegationUpdated {
            delegation_id: id.to_string(),
            from,
            to: format!("{status:?}"),
        }));
        Some(updated)
    }

    /// Unknown agents are ignored, per spec: no error surfaced.
    pub fn update_node_status(&self, agent_id: &str, status: &str) {
        let mut nodes = self.nodes.write();
        let Some(node) = nodes.get_mut(agent_id) else { return };
        let old_status = std::mem::replace(&mut node.status, status.to_string());
        node.updated_at = Utc::now();
        drop(nodes);
        self.indexes.write().move_status(agent_id, &old_status, status);
        self.emit(Event::Hierarchy(HierarchyEvent::NodeStatusChanged {
            agent_id: agent_id.to_string(),
            status: status.to_string(),
        }));
    }

    pub fn get_node(&self, agent_id: &str) -> Option<AgentNode> {
        self.nodes.read().get(agent_id).cloned()
    }

    pub fn get_hierarchy(&self, agent_id: &str) -> Option<HierarchyTree> {
        let nodes = self.nodes.read();
        Self::build_tree(&nodes, agent_id)
    }

    fn build_tree(nodes: &FxHashMap<String, AgentNode>, agent_id: &str) -> Option<HierarchyTree> {
        let node = nodes.get(agent_id)?.clone();
        let children = node
            .children
            .iter()
            .filter_map(|child_id| Self::build_tree(nodes, child_id))
            .collect();
        Some(HierarchyTree { node, children })
    }

    /// Leaf-to-root order, excluding `agent_id` itself.
    pub fn get_ancestors(&self, agent_id: &str) -> Vec<String> {
        let nodes = self.nodes.read();
        let mut ancestors = Vec::new();
        let mut cursor = nodes.get(agent_id).and_then(|n| n.parent_id.clone());
        while let Some(id) = cursor {
            cursor = nodes.get(&id).and_then(|n| n.parent_id.clone());
            ancestors.push(id);
        }
        ancestors
    }

    pub fn get_descendants(&self, agent_id: &str) -> Vec<String> {
        let nodes = self.nodes.read();
        let mut out = Vec::new();
        let mut stack: Vec<String> = nodes.get(agent_id).map(|n| n.children.clone()).unwrap_or_default();
        while let Some(id) = stack.pop() {
            if let Some(node) = nodes.get(&id) {
                stack.extend(node.children.iter().cloned());
            }
            out.push(id);
        }
        out
    }

    pub fn find_common_ancestor(&self, a: &str, b: &str) -> Option<String> {
        let ancestors_a: FxHashSet<String> = std::iter::once(a.to_string()).chain(self.get_ancestors(a)).collect();
        let mut cursor = Some(b.to_string());
        while let Some(id) = cursor {
            if ancestors_a.contains(&id) {
                return Some(id);
            }
            cursor = self.nodes.read().get(&id).and_then(|n| n.parent_id.clone());
        }
        None
    }

    pub fn get_children(&self, agent_id: &str) -> Vec<String> {
        self.nodes.read().get(agent_id).map(|n| n.children.clone()).unwrap_or_default()
    }

    pub fn get_by_depth(&self, depth: u32) -> Vec<String> {
        self.indexes.read().by_depth.get(&depth).map(|s| s.iter().cloned().collect()).unwrap_or_default()
    }

    pub fn get_by_status(&self, status: &str) -> Vec<String> {
        self.indexes.read().by_status.get(status).map(|s| s.iter().cloned().collect()).unwrap_or_default()
    }

    #[tracing::instrument(skip(self))]
    pub fn prune_hierarchy(&self, agent_id: &str) -> (bool, Vec<String>) {
        let mut nodes = self.nodes.write();
        let Some(root) = nodes.get(agent_id).cloned() else {
            return (false, Vec::new());
        };

        let mut removed = Vec::new();
        let mut stack = vec![agent_id.to_string()];
        let mut indexes = self.indexes.write();
        while let Some(id) = stack.pop() {
            if let Some(node) = nodes.remove(&id) {
                stack.extend(node.children.iter().cloned());
                indexes.remove(&node);
                removed.push(id);
            }
        }

        if let Some(parent_id) = &root.parent_id
            && let Some(parent) = nodes.get_mut(parent_id)
        {
            parent.children.retain(|c| c != agent_id);
            parent.updated_at = Utc::now();
        }
        drop(indexes);
        drop(nodes);

        self.emit(Event::Hierarchy(HierarchyEvent::Pruned {
            agent_id: agent_id.to_string(),
            removed: removed.clone(),
        }));
        (true, removed)
    }

    pub fn can_delegate(&self, agent_id: &str) -> DelegationCapacity {
        let nodes = self.nodes.read();
        let Some(node) = nodes.get(agent_id) else {
            return DelegationCapacity {
                can_delegate: false,
                reason: Some("unknown agent".to_string()),
                remaining_depth: 0,
                remaining_children: 0,
            };
        };
        let remaining_depth = self.limits.max_depth.saturating_sub(node.depth);
        let remaining_children = self.limits.max_children.saturating_sub(node.children.len());
        let (can_delegate, reason) = if remaining_depth == 0 {
            (false, Some("max depth reached".to_string()))
        } else if remaining_children == 0 {
            (false, Some("max children reached".to_string()))
        } else {
            (true, None)
        };
        DelegationCapacity { can_delegate, reason, remaining_depth, remaining_children }
    }

    pub fn export_state(&self) -> HierarchyExport {
        HierarchyExport {
            nodes: self.nodes.read().values().cloned().collect(),
            delegations: self.delegations.read().values().cloned().collect(),
        }
    }

    pub fn import_state(&self, export: HierarchyExport) {
        let mut nodes = self.nodes.write();
        let mut indexes = self.indexes.write();
        nodes.clear();
        *indexes = Indexes::default();
        for node in export.nodes {
            indexes.insert(&node);
            nodes.insert(node.agent_id.clone(), node);
        }
        drop(nodes);
        drop(indexes);
        let mut delegations = self.delegations.write();
        delegations.clear();
        for delegation in export.delegations {
            delegations.insert(delegation.id.clone(), delegation);
        }
    }

    fn emit(&self, event: Event) {
        if let Some(emitter) = &self.emitter
            && let Err(err) = emitter.emit(event)
            && !matches!(err, EmitterError::Closed)
        {
            tracing::warn!(error = %err, "failed to emit hierarchy event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> HierarchyRegistry {
        HierarchyRegistry::new(HierarchyLimits { max_children: 2, max_depth: 3 })
    }

    #[test]
    fn register_root_then_children() {
        let reg = registry();
        reg.register_hierarchy(None, "p", None).unwrap();
        reg.register_hierarchy(Some("p"), "c1", None).unwrap();
        reg.register_hierarchy(Some("p"), "c2", None).unwrap();
        assert_eq!(reg.get_children("p"), vec!["c1".to_string(), "c2".to_string()]);
        assert_eq!(reg.get_node("c1").unwrap().depth, 1);
    }

    #[test]
    fn max_children_enforced() {
        let reg = registry();
        reg.register_hierarchy(None, "p", None).unwrap();
        reg.register_hierarchy(Some("p"), "c1", None).unwrap();
        reg.register_hierarchy(Some("p"), "c2", None).unwrap();
        let err = reg.register_hierarchy(Some("p"), "c3", None).unwrap_err();
        assert!(matches!(err, HierarchyError::MaxChildrenExceeded { .. }));
    }

    #[test]
    fn max_depth_enforced() {
        let reg = registry();
        reg.register_hierarchy(None, "a", None).unwrap();
        reg.register_hierarchy(Some("a"), "b", None).unwrap();
        reg.register_hierarchy(Some("b"), "c", None).unwrap();
        let err = reg.register_hierarchy(Some("c"), "d", None).unwrap_err();
        assert!(matches!(err, HierarchyError::MaxDepthExceeded { .. }));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let reg = registry();
        reg.register_hierarchy(None, "p", None).unwrap();
        let err = reg.register_hierarchy(None, "p", None).unwrap_err();
        assert!(matches!(err, HierarchyError::AlreadyRegistered(_)));
    }

    #[test]
    fn prune_removes_all_descendants_from_indexes() {
        let reg = registry();
        reg.register_hierarchy(None, "p", None).unwrap();
        reg.register_hierarchy(Some("p"), "c1", None).unwrap();
        reg.register_hierarchy(Some("c1"), "g1", None).unwrap();

        let (pruned, removed) = reg.prune_hierarchy("c1");
        assert!(pruned);
        assert_eq!(removed.len(), 2);
        assert!(reg.get_node("c1").is_none());
        assert!(reg.get_node("g1").is_none());
        assert_eq!(reg.get_children("p"), Vec::<String>::new());
        assert!(reg.get_by_depth(1).is_empty());
    }

    #[test]
    fn common_ancestor_found() {
        let reg = registry();
        reg.register_hierarchy(None, "root", None).unwrap();
        reg.register_hierarchy(Some("root"), "a", None).unwrap();
        reg.register_hierarchy(Some("a"), "b", None).unwrap();
        assert_eq!(reg.find_common_ancestor("b", "a"), Some("a".to_string()));
        assert_eq!(reg.find_common_ancestor("b", "root"), Some("root".to_string()));
    }

    #[test]
    fn export_then_import_round_trips() {
        let reg = registry();
        reg.register_hierarchy(None, "p", None).unwrap();
        reg.register_hierarchy(Some("p"), "c1", None).unwrap();
        reg.register_delegation("d1", "p", "c1", "t1").unwrap();

        let exported = reg.export_state();
        let fresh = registry();
        fresh.import_state(exported);

        assert_eq!(fresh.get_node("c1").unwrap().depth, 1);
        assert_eq!(fresh.get_children("p"), vec!["c1".to_string()]);
    }

    #[test]
    fn can_delegate_reports_remaining_capacity() {
        let reg = registry();
        reg.register_hierarchy(None, "p", None).unwrap();
        let capacity = reg.can_delegate("p");
        assert!(capacity.can_delegate);
        assert_eq!(capacity.remaining_children, 2);
        assert_eq!(capacity.remaining_depth, 3);
    }

    #[test]
    fn unknown_agent_status_update_is_ignored() {
        let reg = registry();
        reg.update_node_status("ghost", "active");
    }
}
