//! Operational-transformation conflict resolver for concurrent edits.
//!
//! Accepts a stream of [`DocumentChange`] records from arbitrary sources
//! (the local editor, remote peers relayed over the transport) and keeps a
//! causally consistent pending-change table, detecting and where possible
//! transparently resolving conflicts before a caller treats a change as
//! applied.
//!
//! Per-change lifecycle:
//! ```text
//! submitted ──► conflict-free ──► transformed ──► applied
//!      │
//!      └──► conflicts detected ──► auto-resolved ──► applied
//!                   │
//!                   └──► unresolved ──► surfaced to caller
//!                                │
//!                                └──► resolve_conflict(strategy)
//! ```
//!
//! The resolver is transport-agnostic and fully synchronous: no I/O, no
//! timers, and handlers run to completion. Callers assign monotonically
//! increasing timestamps per change; transform order is deterministic
//! given that assignment.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::now_millis;

/// Half-open `[start, end)` span in document coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionRange {
    pub start: u64,
    pub end: u64,
}

impl PositionRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Zero-width range at a caret position.
    pub fn caret(position: u64) -> Self {
        Self {
            start: position,
            end: position,
        }
    }

    pub fn width(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// Strict half-open overlap test. Touching ranges do not overlap.
    pub fn overlaps(&self, other: &PositionRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Width of the intersection; zero for a caret inside a span.
    pub fn overlap_width(&self, other: &PositionRange) -> u64 {
        let lo = self.start.max(other.start);
        let hi = self.end.min(other.end);
        hi.saturating_sub(lo)
    }

    /// Smallest range covering both.
    pub fn union(&self, other: &PositionRange) -> PositionRange {
        PositionRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// Kind of edit a change describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Delete,
    Replace,
}

/// One edit operation. Immutable once created; the resolver derives new
/// values but never mutates an entry in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChange {
    pub id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    /// Caller-assigned, monotonically increasing per change.
    pub timestamp: u64,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub position: PositionRange,
    pub content: String,
    #[serde(
        rename = "originalContent",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub original_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl DocumentChange {
    /// Insertion carrying its content span: `[position, position + len)`.
    pub fn insert(
        user_id: impl Into<String>,
        timestamp: u64,
        position: u64,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        let end = position + content.len() as u64;
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            timestamp,
            kind: ChangeKind::Insert,
            position: PositionRange::new(position, end),
            content,
            original_content: None,
            metadata: None,
        }
    }

    pub fn delete(user_id: impl Into<String>, timestamp: u64, start: u64, end: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            timestamp,
            kind: ChangeKind::Delete,
            position: PositionRange::new(start, end),
            content: String::new(),
            original_content: None,
            metadata: None,
        }
    }

    pub fn replace(
        user_id: impl Into<String>,
        timestamp: u64,
        start: u64,
        end: u64,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            timestamp,
            kind: ChangeKind::Replace,
            position: PositionRange::new(start, end),
            content: content.into(),
            original_content: None,
            metadata: None,
        }
    }

    pub fn with_position(mut self, position: PositionRange) -> Self {
        self.position = position;
        self
    }

    pub fn with_original_content(mut self, original: impl Into<String>) -> Self {
        self.original_content = Some(original.into());
        self
    }

    /// How far this change shifts positions after it: insert grows by the
    /// content length, delete shrinks by the removed width, replace by the
    /// difference.
    fn length_delta(&self) -> i64 {
        match self.kind {
            ChangeKind::Insert => self.content.len() as i64,
            ChangeKind::Delete => -(self.position.width() as i64),
            ChangeKind::Replace => self.content.len() as i64 - self.position.width() as i64,
        }
    }
}

/// Kind of conflict detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    ConcurrentEdit,
    LockViolation,
    VersionMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// A detected conflict. Destroyed on resolution, automatic or manual.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ConflictKind,
    /// At least one change; exactly the two overlapping changes for a
    /// concurrent edit.
    pub changes: Vec<DocumentChange>,
    #[serde(rename = "affectedRange")]
    pub affected_range: PositionRange,
    pub severity: Severity,
    #[serde(rename = "autoResolvable")]
    pub auto_resolvable: bool,
    pub timestamp: u64,
}

/// How a caller wants a surfaced conflict settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    AcceptLocal,
    AcceptRemote,
    Merge,
    Manual,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::AcceptLocal => "accept_local",
            StrategyKind::AcceptRemote => "accept_remote",
            StrategyKind::Merge => "merge",
            StrategyKind::Manual => "manual",
        }
    }
}

/// Caller-supplied resolution for one conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionStrategy {
    #[serde(rename = "type")]
    pub kind: StrategyKind,
    pub description: String,
    /// Required for `merge` and `manual`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<String>,
}

impl ResolutionStrategy {
    pub fn accept_local() -> Self {
        Self {
            kind: StrategyKind::AcceptLocal,
            description: "keep the local change".into(),
            result: None,
        }
    }

    pub fn accept_remote() -> Self {
        Self {
            kind: StrategyKind::AcceptRemote,
            description: "keep the remote change".into(),
            result: None,
        }
    }

    pub fn merge(result: impl Into<String>) -> Self {
        Self {
            kind: StrategyKind::Merge,
            description: "merge both changes".into(),
            result: Some(result.into()),
        }
    }

    pub fn manual(result: impl Into<String>) -> Self {
        Self {
            kind: StrategyKind::Manual,
            description: "manually edited resolution".into(),
            result: Some(result.into()),
        }
    }
}

/// Result of [`ConflictResolver::apply_change`].
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The change (possibly transformed or merged) is now pending.
    Applied(DocumentChange),
    /// Unresolved conflicts; the change was not applied.
    Conflicted(Vec<ConflictInfo>),
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied(_))
    }

    pub fn applied(&self) -> Option<&DocumentChange> {
        match self {
            ApplyOutcome::Applied(change) => Some(change),
            ApplyOutcome::Conflicted(_) => None,
        }
    }
}

/// Events recorded by the resolver, drained with
/// [`ConflictResolver::take_events`].
#[derive(Debug, Clone, PartialEq)]
pub enum ResolverEvent {
    ChangeApplied(DocumentChange),
    ConflictsDetected(Vec<ConflictInfo>),
    ConflictResolved {
        conflict_id: String,
        strategy: String,
    },
    ResolutionError(String),
}

/// Global document lock. At most one owner; clearing is explicit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockState {
    pub locked: bool,
    pub owner: Option<String>,
}

/// The conflict resolver.
#[derive(Default)]
pub struct ConflictResolver {
    /// Changes accepted but not yet superseded or cleared, by change id.
    pending: HashMap<String, DocumentChange>,
    /// Unresolved conflicts awaiting a caller strategy, by conflict id.
    conflicts: HashMap<String, ConflictInfo>,
    version: u64,
    lock: LockState,
    events: VecDeque<ResolverEvent>,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit a change.
    ///
    /// Detects conflicts against the pending table, auto-resolves where a
    /// deterministic rule exists, and otherwise surfaces the conflicts
    /// without applying anything — each call is all-or-nothing.
    pub fn apply_change(&mut self, change: DocumentChange) -> ApplyOutcome {
        if change.position.start > change.position.end {
            let reason = format!(
                "change {} has inverted range [{}, {})",
                change.id, change.position.start, change.position.end
            );
            log::warn!("{reason}");
            self.events.push_back(ResolverEvent::ResolutionError(reason));
            let affected_range = change.position;
            let info = ConflictInfo {
                id: Uuid::new_v4().to_string(),
                kind: ConflictKind::VersionMismatch,
                changes: vec![change],
                affected_range,
                severity: Severity::Medium,
                auto_resolvable: false,
                timestamp: now_millis(),
            };
            return ApplyOutcome::Conflicted(vec![info]);
        }

        let found = self.detect_conflicts(&change);
        if found.is_empty() {
            let transformed = self.transform_incoming(change);
            self.rebase_later_pending(&transformed);
            self.pending
                .insert(transformed.id.clone(), transformed.clone());
            self.version += 1;
            self.events
                .push_back(ResolverEvent::ChangeApplied(transformed.clone()));
            return ApplyOutcome::Applied(transformed);
        }

        self.events
            .push_back(ResolverEvent::ConflictsDetected(found.clone()));

        if found.iter().all(|c| c.auto_resolvable) {
            let applied = self.auto_resolve_all(&found, change);
            self.events
                .push_back(ResolverEvent::ChangeApplied(applied.clone()));
            return ApplyOutcome::Applied(applied);
        }

        // At least one conflict needs the caller; apply nothing.
        for conflict in &found {
            self.conflicts.insert(conflict.id.clone(), conflict.clone());
        }
        log::debug!(
            "{} unresolved conflict(s) for change by {}",
            found.len(),
            found
                .last()
                .and_then(|c| c.changes.last())
                .map(|c| c.user_id.as_str())
                .unwrap_or("?")
        );
        ApplyOutcome::Conflicted(found)
    }

    /// Settle a surfaced conflict with a caller-supplied strategy.
    ///
    /// Returns `false` — with zero state mutation — for an unknown
    /// conflict id or a merge/manual strategy missing its `result`.
    pub fn resolve_conflict(&mut self, conflict_id: &str, strategy: &ResolutionStrategy) -> bool {
        let Some(conflict) = self.conflicts.get(conflict_id) else {
            return false;
        };

        let resolved: DocumentChange = match strategy.kind {
            StrategyKind::AcceptLocal => match conflict.changes.first() {
                Some(change) => change.clone(),
                None => return false,
            },
            StrategyKind::AcceptRemote => match conflict.changes.last() {
                Some(change) => change.clone(),
                None => return false,
            },
            StrategyKind::Merge | StrategyKind::Manual => {
                let Some(result) = strategy.result.clone() else {
                    return false;
                };
                let author = conflict
                    .changes
                    .last()
                    .map(|c| c.user_id.clone())
                    .unwrap_or_default();
                let mut metadata = serde_json::Map::new();
                metadata.insert("resolved".into(), serde_json::Value::Bool(true));
                metadata.insert(
                    "strategy".into(),
                    serde_json::Value::String(strategy.kind.as_str().into()),
                );
                DocumentChange {
                    id: Uuid::new_v4().to_string(),
                    user_id: author,
                    timestamp: now_millis(),
                    kind: ChangeKind::Replace,
                    position: conflict.affected_range,
                    content: result,
                    original_content: conflict.changes.first().map(|c| c.content.clone()),
                    metadata: Some(metadata),
                }
            }
        };

        // Commit: discard the losers, keep the winner, drop the conflict.
        let Some(conflict) = self.conflicts.remove(conflict_id) else {
            return false;
        };
        for change in &conflict.changes {
            if change.id != resolved.id {
                self.pending.remove(&change.id);
            }
        }
        self.pending.insert(resolved.id.clone(), resolved);
        self.version += 1;
        self.events.push_back(ResolverEvent::ConflictResolved {
            conflict_id: conflict_id.to_string(),
            strategy: strategy.kind.as_str().to_string(),
        });
        log::info!(
            "conflict {conflict_id} resolved via {}",
            strategy.kind.as_str()
        );
        true
    }

    /// Set or clear the document lock. Last-writer-wins; affects only the
    /// conflict detection of changes submitted afterwards.
    pub fn set_lock(&mut self, locked: bool, owner: Option<String>) {
        self.lock = LockState {
            locked,
            owner: if locked { owner } else { None },
        };
    }

    pub fn lock(&self) -> &LockState {
        &self.lock
    }

    /// Pending changes in timestamp order.
    pub fn pending_changes(&self) -> Vec<DocumentChange> {
        let mut changes: Vec<DocumentChange> = self.pending.values().cloned().collect();
        changes.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        changes
    }

    /// Unresolved conflicts.
    pub fn conflicts(&self) -> Vec<ConflictInfo> {
        self.conflicts.values().cloned().collect()
    }

    pub fn conflict(&self, conflict_id: &str) -> Option<&ConflictInfo> {
        self.conflicts.get(conflict_id)
    }

    /// Document version counter, bumped per applied change.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Drain recorded events.
    pub fn take_events(&mut self) -> Vec<ResolverEvent> {
        self.events.drain(..).collect()
    }

    /// Clear pending changes, conflicts, version, and lock. For
    /// document-close teardown, not runtime recovery.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.conflicts.clear();
        self.version = 0;
        self.lock = LockState::default();
        self.events.clear();
    }

    fn detect_conflicts(&self, change: &DocumentChange) -> Vec<ConflictInfo> {
        let mut found = Vec::new();

        if self.lock.locked && self.lock.owner.as_deref() != Some(change.user_id.as_str()) {
            found.push(ConflictInfo {
                id: Uuid::new_v4().to_string(),
                kind: ConflictKind::LockViolation,
                changes: vec![change.clone()],
                affected_range: change.position,
                severity: Severity::High,
                auto_resolvable: false,
                timestamp: now_millis(),
            });
        }

        for pending in self.pending.values() {
            if pending.id == change.id {
                continue;
            }
            if pending.position.overlaps(&change.position) {
                found.push(concurrent_edit(pending, change));
            }
        }
        found
    }

    /// Transform a conflict-free change against every pending change with
    /// a strictly earlier timestamp, in timestamp order.
    fn transform_incoming(&self, change: DocumentChange) -> DocumentChange {
        let mut earlier: Vec<&DocumentChange> = self
            .pending
            .values()
            .filter(|p| p.timestamp < change.timestamp)
            .collect();
        earlier.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));

        earlier
            .into_iter()
            .fold(change, |acc, prior| transform_one(acc, prior))
    }

    /// Re-transform pending changes with a later timestamp than an
    /// incoming change that arrived out of order, so final positions are
    /// the same for any arrival permutation. Entries are replaced, never
    /// mutated in place.
    fn rebase_later_pending(&mut self, incoming: &DocumentChange) {
        let later_ids: Vec<String> = self
            .pending
            .values()
            .filter(|p| p.timestamp > incoming.timestamp)
            .map(|p| p.id.clone())
            .collect();
        for id in later_ids {
            if let Some(entry) = self.pending.remove(&id) {
                let rebased = transform_one(entry, incoming);
                self.pending.insert(rebased.id.clone(), rebased);
            }
        }
    }

    /// Resolve a set of conflicts known to all be auto-resolvable,
    /// threading the incoming change through each rule, then apply it.
    fn auto_resolve_all(
        &mut self,
        conflicts: &[ConflictInfo],
        incoming: DocumentChange,
    ) -> DocumentChange {
        let mut current = incoming;

        for conflict in conflicts {
            let pending_id = match conflict.changes.first() {
                Some(change) => change.id.clone(),
                None => continue,
            };
            let Some(pending) = self.pending.get(&pending_id).cloned() else {
                continue; // already superseded by an earlier rule in this batch
            };

            let strategy = if pending.user_id == current.user_id {
                // Same author: the chronologically later content wins over
                // the combined span.
                let merged = merge_same_author(&pending, &current);
                self.pending.remove(&pending_id);
                current = merged;
                "merge"
            } else if current.timestamp >= pending.timestamp {
                current = transform_one(current, &pending);
                "transform"
            } else {
                // Out-of-order arrival: the pending change is the later
                // one; rewrite it in place instead.
                let shifted = transform_one(pending.clone(), &current);
                self.pending.remove(&pending_id);
                self.pending.insert(shifted.id.clone(), shifted);
                "transform"
            };

            self.events.push_back(ResolverEvent::ConflictResolved {
                conflict_id: conflict.id.clone(),
                strategy: strategy.to_string(),
            });
            log::debug!("auto-resolved conflict {} via {strategy}", conflict.id);
        }

        self.pending.insert(current.id.clone(), current.clone());
        self.version += 1;
        current
    }
}

/// Build the conflict record for two overlapping changes. The existing
/// pending change is listed first, the incoming one last.
fn concurrent_edit(pending: &DocumentChange, incoming: &DocumentChange) -> ConflictInfo {
    let overlap = pending.position.overlap_width(&incoming.position);
    let same_author = pending.user_id == incoming.user_id;

    let severity = if same_author {
        Severity::Medium
    } else if overlap > 0 {
        Severity::High
    } else {
        Severity::Low
    };

    // Same-author overlaps always merge; cross-author zero-width overlaps
    // transform; anything else needs the caller.
    let auto_resolvable = same_author || overlap == 0;

    ConflictInfo {
        id: Uuid::new_v4().to_string(),
        kind: ConflictKind::ConcurrentEdit,
        changes: vec![pending.clone(), incoming.clone()],
        affected_range: pending.position.union(&incoming.position),
        severity,
        auto_resolvable,
        timestamp: now_millis(),
    }
}

/// Shift `target`'s window by `prior`'s length delta, when `prior` sits at
/// or before it. `prior` must be the earlier change.
fn transform_one(mut target: DocumentChange, prior: &DocumentChange) -> DocumentChange {
    if prior.position.start > target.position.start {
        return target;
    }
    let delta = prior.length_delta();
    target.position = PositionRange {
        start: shift(target.position.start, delta),
        end: shift(target.position.end, delta),
    };
    target
}

fn shift(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta as u64)
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

/// Merge two overlapping changes by the same author: the later content
/// wins over the union of both spans.
fn merge_same_author(a: &DocumentChange, b: &DocumentChange) -> DocumentChange {
    let (earlier, later) = if b.timestamp >= a.timestamp {
        (a, b)
    } else {
        (b, a)
    };
    let mut metadata = later.metadata.clone().unwrap_or_default();
    metadata.insert("merged".into(), serde_json::Value::Bool(true));
    DocumentChange {
        id: Uuid::new_v4().to_string(),
        user_id: later.user_id.clone(),
        timestamp: later.timestamp,
        kind: later.kind,
        position: earlier.position.union(&later.position),
        content: later.content.clone(),
        original_content: Some(earlier.content.clone()),
        metadata: Some(metadata),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_overlap_strict() {
        let a = PositionRange::new(0, 5);
        assert!(a.overlaps(&PositionRange::new(3, 8)));
        assert!(a.overlaps(&PositionRange::new(0, 5)));
        // Touching ranges do not overlap.
        assert!(!a.overlaps(&PositionRange::new(5, 9)));
        // Equal carets do not overlap.
        let caret = PositionRange::caret(5);
        assert!(!caret.overlaps(&PositionRange::caret(5)));
        // A caret strictly inside a span does.
        assert!(a.overlaps(&PositionRange::caret(3)));
        assert_eq!(a.overlap_width(&PositionRange::caret(3)), 0);
    }

    #[test]
    fn test_length_delta() {
        assert_eq!(DocumentChange::insert("a", 1, 0, "Hello").length_delta(), 5);
        assert_eq!(DocumentChange::delete("a", 1, 2, 6).length_delta(), -4);
        assert_eq!(DocumentChange::replace("a", 1, 2, 6, "xy").length_delta(), -2);
        assert_eq!(
            DocumentChange::replace("a", 1, 2, 4, "wxyz").length_delta(),
            2
        );
    }

    #[test]
    fn test_conflict_free_change_applies() {
        let mut resolver = ConflictResolver::new();
        let change = DocumentChange::insert("alice", 1, 0, "Hello");

        let outcome = resolver.apply_change(change.clone());
        assert!(outcome.is_applied());
        assert_eq!(resolver.version(), 1);
        assert_eq!(resolver.pending_changes().len(), 1);

        let events = resolver.take_events();
        assert!(matches!(events[0], ResolverEvent::ChangeApplied(_)));
    }

    #[test]
    fn test_disjoint_changes_coexist() {
        let mut resolver = ConflictResolver::new();
        assert!(resolver
            .apply_change(DocumentChange::insert("alice", 1, 0, "Hello"))
            .is_applied());
        assert!(resolver
            .apply_change(DocumentChange::insert("bob", 2, 20, "World"))
            .is_applied());
        assert_eq!(resolver.version(), 2);
        assert!(resolver.conflicts().is_empty());
    }

    #[test]
    fn test_adjacency_transform_deterministic() {
        // Two caret inserts at the same position from different users:
        // no conflict, and the later one lands shifted by the earlier
        // one's length — for either arrival order.
        let c1 = DocumentChange::insert("alice", 1, 5, "AB")
            .with_position(PositionRange::caret(5));
        let c2 = DocumentChange::insert("bob", 2, 5, "CD")
            .with_position(PositionRange::caret(5));

        // Arrival order c1, c2.
        let mut resolver = ConflictResolver::new();
        assert!(resolver.apply_change(c1.clone()).is_applied());
        let out = resolver.apply_change(c2.clone());
        let applied = out.applied().expect("no conflict expected");
        assert_eq!(applied.position, PositionRange::caret(7));

        // Arrival order c2, c1: same final positions.
        let mut resolver = ConflictResolver::new();
        assert!(resolver.apply_change(c2.clone()).is_applied());
        let out = resolver.apply_change(c1.clone());
        let applied = out.applied().expect("no conflict expected");
        assert_eq!(applied.position, PositionRange::caret(5));
        let positions: Vec<PositionRange> = resolver
            .pending_changes()
            .iter()
            .map(|c| c.position)
            .collect();
        assert_eq!(
            positions,
            vec![PositionRange::caret(5), PositionRange::caret(7)]
        );
    }

    #[test]
    fn test_transform_shifts_by_delete() {
        let mut resolver = ConflictResolver::new();
        assert!(resolver
            .apply_change(DocumentChange::delete("alice", 1, 2, 5))
            .is_applied());

        let late = DocumentChange::insert("bob", 2, 9, "Y")
            .with_position(PositionRange::caret(9));
        let out = resolver.apply_change(late);
        assert_eq!(out.applied().unwrap().position, PositionRange::caret(6));
    }

    #[test]
    fn test_earlier_changes_do_not_transform() {
        let mut resolver = ConflictResolver::new();
        assert!(resolver
            .apply_change(DocumentChange::insert("alice", 10, 0, "Hello"))
            .is_applied());

        // Timestamp earlier than the pending change: untouched.
        let early = DocumentChange::insert("bob", 5, 20, "x")
            .with_position(PositionRange::caret(20));
        let out = resolver.apply_change(early);
        assert_eq!(out.applied().unwrap().position, PositionRange::caret(20));
    }

    #[test]
    fn test_same_position_ambiguous_insert_escalates() {
        let mut resolver = ConflictResolver::new();
        assert!(resolver
            .apply_change(DocumentChange::insert("alice", 1, 0, "Hello"))
            .is_applied());

        let outcome = resolver.apply_change(DocumentChange::insert("bob", 2, 0, "World"));
        let conflicts = match outcome {
            ApplyOutcome::Conflicted(c) => c,
            ApplyOutcome::Applied(c) => panic!("expected conflict, applied {c:?}"),
        };
        assert_eq!(conflicts.len(), 1);
        let info = &conflicts[0];
        assert_eq!(info.kind, ConflictKind::ConcurrentEdit);
        assert_eq!(info.severity, Severity::High);
        assert!(!info.auto_resolvable);
        assert_eq!(info.changes.len(), 2);

        // The change was not applied.
        assert_eq!(resolver.pending_changes().len(), 1);
        assert_eq!(resolver.version(), 1);
        assert_eq!(resolver.conflicts().len(), 1);
    }

    #[test]
    fn test_same_author_overlap_auto_merges() {
        let mut resolver = ConflictResolver::new();
        assert!(resolver
            .apply_change(DocumentChange::insert("alice", 1, 0, "Hello"))
            .is_applied());

        let outcome = resolver.apply_change(DocumentChange::insert("alice", 2, 3, "World"));
        let merged = outcome.applied().expect("same-author merge always succeeds");

        assert_eq!(merged.content, "World");
        assert_eq!(merged.position, PositionRange::new(0, 8));
        assert_eq!(merged.original_content.as_deref(), Some("Hello"));
        assert_eq!(
            merged.metadata.as_ref().unwrap()["merged"],
            serde_json::Value::Bool(true)
        );

        // The merged change replaced the earlier pending entry.
        assert_eq!(resolver.pending_changes().len(), 1);
        assert!(resolver.conflicts().is_empty());
    }

    #[test]
    fn test_cross_author_zero_width_overlap_auto_transforms() {
        let mut resolver = ConflictResolver::new();
        assert!(resolver
            .apply_change(DocumentChange::insert("alice", 1, 0, "Hello"))
            .is_applied());

        // Bob's caret sits strictly inside Alice's span: zero-width
        // overlap, low severity, resolved by transforming the later one.
        let caret = DocumentChange::insert("bob", 2, 3, "X")
            .with_position(PositionRange::caret(3));
        let outcome = resolver.apply_change(caret);
        let applied = outcome.applied().expect("adjacency transform succeeds");
        assert_eq!(applied.position, PositionRange::caret(8));

        let events = resolver.take_events();
        let detected = events
            .iter()
            .find_map(|e| match e {
                ResolverEvent::ConflictsDetected(c) => Some(c.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(detected[0].severity, Severity::Low);
        assert!(detected[0].auto_resolvable);
        assert!(resolver.conflicts().is_empty());
    }

    #[test]
    fn test_lock_violation_regardless_of_overlap() {
        let mut resolver = ConflictResolver::new();
        resolver.set_lock(true, Some("alice".into()));

        // No positional overlap with anything, still blocked.
        let outcome = resolver.apply_change(DocumentChange::insert("bob", 1, 40, "x"));
        let conflicts = match outcome {
            ApplyOutcome::Conflicted(c) => c,
            _ => panic!("expected lock violation"),
        };
        assert_eq!(conflicts[0].kind, ConflictKind::LockViolation);
        assert_eq!(conflicts[0].severity, Severity::High);
        assert!(!conflicts[0].auto_resolvable);

        // The owner edits freely.
        assert!(resolver
            .apply_change(DocumentChange::insert("alice", 2, 0, "ok"))
            .is_applied());
    }

    #[test]
    fn test_lock_is_last_writer_wins() {
        let mut resolver = ConflictResolver::new();
        resolver.set_lock(true, Some("alice".into()));
        resolver.set_lock(true, Some("bob".into()));
        assert_eq!(resolver.lock().owner.as_deref(), Some("bob"));

        resolver.set_lock(false, None);
        assert!(!resolver.lock().locked);
        assert!(resolver.lock().owner.is_none());

        // Unlocked again: anyone may edit.
        assert!(resolver
            .apply_change(DocumentChange::insert("carol", 1, 0, "hi"))
            .is_applied());
    }

    #[test]
    fn test_lock_does_not_retroactively_conflict() {
        let mut resolver = ConflictResolver::new();
        assert!(resolver
            .apply_change(DocumentChange::insert("bob", 1, 0, "Hello"))
            .is_applied());

        resolver.set_lock(true, Some("alice".into()));
        // The already-pending change from bob stays pending.
        assert_eq!(resolver.pending_changes().len(), 1);
        assert!(resolver.conflicts().is_empty());
    }

    #[test]
    fn test_manual_merge_scenario() {
        // A inserts "Hello" at 0 (t=1); B inserts "World" at 0 (t=2).
        let mut resolver = ConflictResolver::new();
        let c1 = DocumentChange::insert("alice", 1, 0, "Hello");
        assert!(resolver.apply_change(c1).is_applied());

        let c2 = DocumentChange::insert("bob", 2, 0, "World");
        let conflicts = match resolver.apply_change(c2) {
            ApplyOutcome::Conflicted(c) => c,
            _ => panic!("expected ambiguous conflict"),
        };
        let conflict_id = conflicts[0].id.clone();

        // Merge collapses both into one replace over the affected range.
        let ok = resolver.resolve_conflict(&conflict_id, &ResolutionStrategy::merge("HelloWorld"));
        assert!(ok);

        let pending = resolver.pending_changes();
        assert_eq!(pending.len(), 1);
        let resolved = &pending[0];
        assert_eq!(resolved.kind, ChangeKind::Replace);
        assert_eq!(resolved.position, PositionRange::new(0, 5));
        assert_eq!(resolved.content, "HelloWorld");
        assert_eq!(
            resolved.metadata.as_ref().unwrap()["resolved"],
            serde_json::Value::Bool(true)
        );
        assert!(resolver.conflicts().is_empty());
    }

    #[test]
    fn test_accept_local_keeps_first() {
        let mut resolver = ConflictResolver::new();
        let c1 = DocumentChange::insert("alice", 1, 0, "Hello");
        let c1_id = c1.id.clone();
        resolver.apply_change(c1);
        let conflicts = match resolver.apply_change(DocumentChange::insert("bob", 2, 0, "World")) {
            ApplyOutcome::Conflicted(c) => c,
            _ => panic!("expected conflict"),
        };

        assert!(resolver.resolve_conflict(&conflicts[0].id, &ResolutionStrategy::accept_local()));

        let pending = resolver.pending_changes();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, c1_id);
        assert_eq!(pending[0].user_id, "alice");
    }

    #[test]
    fn test_accept_remote_keeps_last() {
        let mut resolver = ConflictResolver::new();
        resolver.apply_change(DocumentChange::insert("alice", 1, 0, "Hello"));
        let c2 = DocumentChange::insert("bob", 2, 0, "World");
        let c2_id = c2.id.clone();
        let conflicts = match resolver.apply_change(c2) {
            ApplyOutcome::Conflicted(c) => c,
            _ => panic!("expected conflict"),
        };

        assert!(resolver.resolve_conflict(&conflicts[0].id, &ResolutionStrategy::accept_remote()));

        let pending = resolver.pending_changes();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, c2_id);
        assert_eq!(pending[0].user_id, "bob");
    }

    #[test]
    fn test_merge_without_result_fails_cleanly() {
        let mut resolver = ConflictResolver::new();
        resolver.apply_change(DocumentChange::insert("alice", 1, 0, "Hello"));
        let conflicts = match resolver.apply_change(DocumentChange::insert("bob", 2, 0, "World")) {
            ApplyOutcome::Conflicted(c) => c,
            _ => panic!("expected conflict"),
        };

        let strategy = ResolutionStrategy {
            kind: StrategyKind::Merge,
            description: "missing result".into(),
            result: None,
        };
        let version_before = resolver.version();
        assert!(!resolver.resolve_conflict(&conflicts[0].id, &strategy));

        // Nothing changed: the conflict is still pending.
        assert_eq!(resolver.conflicts().len(), 1);
        assert_eq!(resolver.pending_changes().len(), 1);
        assert_eq!(resolver.version(), version_before);
    }

    #[test]
    fn test_unknown_conflict_id_fails_cleanly() {
        let mut resolver = ConflictResolver::new();
        assert!(!resolver.resolve_conflict("no-such-id", &ResolutionStrategy::accept_local()));
    }

    #[test]
    fn test_inverted_range_rejected() {
        let mut resolver = ConflictResolver::new();
        let bad = DocumentChange::delete("alice", 1, 9, 3);
        let outcome = resolver.apply_change(bad);

        let conflicts = match outcome {
            ApplyOutcome::Conflicted(c) => c,
            _ => panic!("expected rejection"),
        };
        assert_eq!(conflicts[0].kind, ConflictKind::VersionMismatch);
        assert_eq!(resolver.pending_changes().len(), 0);
        assert_eq!(resolver.version(), 0);

        let events = resolver.take_events();
        assert!(matches!(events[0], ResolverEvent::ResolutionError(_)));
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut resolver = ConflictResolver::new();
        resolver.set_lock(true, Some("alice".into()));
        resolver.apply_change(DocumentChange::insert("alice", 1, 0, "Hello"));
        resolver.apply_change(DocumentChange::insert("bob", 2, 0, "World"));
        assert!(!resolver.conflicts().is_empty());

        resolver.reset();
        assert!(resolver.pending_changes().is_empty());
        assert!(resolver.conflicts().is_empty());
        assert_eq!(resolver.version(), 0);
        assert!(!resolver.lock().locked);
        assert!(resolver.take_events().is_empty());
    }

    #[test]
    fn test_events_for_conflict_lifecycle() {
        let mut resolver = ConflictResolver::new();
        resolver.apply_change(DocumentChange::insert("alice", 1, 0, "Hello"));
        let conflicts = match resolver.apply_change(DocumentChange::insert("bob", 2, 0, "World")) {
            ApplyOutcome::Conflicted(c) => c,
            _ => panic!("expected conflict"),
        };
        resolver.resolve_conflict(&conflicts[0].id, &ResolutionStrategy::manual("HW"));

        let events = resolver.take_events();
        assert!(matches!(events[0], ResolverEvent::ChangeApplied(_)));
        assert!(matches!(events[1], ResolverEvent::ConflictsDetected(_)));
        assert!(matches!(
            events[2],
            ResolverEvent::ConflictResolved { .. }
        ));
    }

    #[test]
    fn test_change_serde_wire_shape() {
        let change = DocumentChange::insert("alice", 1, 0, "Hi");
        let value = serde_json::to_value(&change).unwrap();
        assert_eq!(value["type"], "insert");
        assert_eq!(value["userId"], "alice");
        assert_eq!(value["position"]["start"], 0);
        assert_eq!(value["position"]["end"], 2);

        let back: DocumentChange = serde_json::from_value(value).unwrap();
        assert_eq!(back, change);
    }
}
