//! The operation schedule: a dependency DAG over per-shard groups.
//!
//! Callers submit operations against single shards, optionally depending on
//! earlier operations. The schedule batches operations on the same shard
//! into *groups* — the unit the executor reads, applies, and writes back as
//! one storage transaction — while keeping the group graph acyclic and as
//! shallow as the dependencies allow. Groups on one shard run strictly in
//! list order; cross-shard ordering is enforced through group ancestry.
//!
//! Nodes live in arenas keyed by integer ids and carry their full transitive
//! ancestor and descendant closures, so there are no owning cycles and both
//! admissibility ("no remaining ancestors") and cancellation ("this op and
//! everything downstream") are set lookups.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use coffer_base::{Error, Result};

/// Default separation between a group's depth and an op's desired depth
/// before the schedule prefers opening a new group.
pub const DEFAULT_DEPTH_LIMIT: u32 = 2;

/// Identifier of a scheduled operation. Never reused within a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
pub struct OpId(u64);

/// Identifier of an operation group. Never reused within a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
pub struct GroupId(u64);

/// Lifecycle of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupState {
    Available,
    Started,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Available,
    Started,
}

struct OpNode<T> {
    shard: String,
    group: GroupId,
    parents: BTreeSet<OpId>,
    ancestors: BTreeSet<OpId>,
    descendants: BTreeSet<OpId>,
    value: Option<T>,
}

struct GroupNode {
    shard: String,
    ops: Vec<OpId>,
    parents: BTreeSet<GroupId>,
    ancestors: BTreeSet<GroupId>,
    descendants: BTreeSet<GroupId>,
    state: GroupState,
    depth: u32,
}

struct ShardSlot {
    groups: Vec<GroupId>,
    state: SlotState,
}

struct Inner<T> {
    depth_limit: u32,
    next_op: u64,
    next_group: u64,
    ops: HashMap<OpId, OpNode<T>>,
    groups: HashMap<GroupId, GroupNode>,
    shards: BTreeMap<String, ShardSlot>,
}

/// A dependency-aware scheduler of per-shard operation groups.
///
/// `T` is the caller's per-operation value; it is handed back when the
/// operation's group is taken for execution, or when the operation is
/// cancelled by a failure upstream.
pub struct Schedule<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Schedule<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Schedule<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Schedule")
            .field("ops", &inner.ops.len())
            .field("groups", &inner.groups.len())
            .field("shards", &inner.shards.len())
            .finish()
    }
}

impl<T> Default for Schedule<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Schedule<T> {
    /// A schedule with the default depth limit.
    pub fn new() -> Self {
        Self::with_depth_limit(DEFAULT_DEPTH_LIMIT)
    }

    /// A schedule with a custom depth limit.
    pub fn with_depth_limit(depth_limit: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                depth_limit,
                next_op: 0,
                next_group: 0,
                ops: HashMap::new(),
                groups: HashMap::new(),
                shards: BTreeMap::new(),
            })),
        }
    }

    /// Submit an operation on `shard` depending on `deps`.
    ///
    /// Every dependency must name a live operation; unknown ids fail
    /// `Schedule`. Returns the new operation's id.
    pub fn add(&self, shard: &str, deps: &[OpId], value: T) -> Result<OpId> {
        let mut inner = self.inner.lock();
        for dep in deps {
            if !inner.ops.contains_key(dep) {
                return Err(Error::Schedule(format!("unknown dependency {dep}")));
            }
        }
        let id = OpId(inner.next_op);
        inner.next_op += 1;
        inner.insert_op(id, shard, deps, Some(value))?;
        trace!(op = %id, shard, "scheduled");
        Ok(id)
    }

    /// The next runnable group: the head group of the first idle shard with
    /// no remaining group ancestors. `None` when nothing is admissible.
    pub fn next_group(&self) -> Option<GroupHandle<T>> {
        let inner = self.inner.lock();
        for (shard, slot) in &inner.shards {
            if slot.state != SlotState::Available {
                continue;
            }
            let Some(&head) = slot.groups.first() else {
                continue;
            };
            let group = &inner.groups[&head];
            if group.state == GroupState::Available && group.ancestors.is_empty() {
                return Some(GroupHandle {
                    inner: self.inner.clone(),
                    id: head,
                    shard: shard.clone(),
                });
            }
        }
        None
    }

    /// Every shard the schedule currently holds operations for.
    pub fn shards(&self) -> Vec<String> {
        self.inner.lock().shards.keys().cloned().collect()
    }

    /// Number of live operations.
    pub fn len(&self) -> usize {
        self.inner.lock().ops.len()
    }

    /// Whether the schedule holds no operations.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().ops.is_empty()
    }

    /// The group ids of `shard` in execution order, with their op ids.
    ///
    /// Introspection for tests and diagnostics.
    pub fn shard_groups(&self, shard: &str) -> Vec<Vec<OpId>> {
        let inner = self.inner.lock();
        inner
            .shards
            .get(shard)
            .map(|slot| {
                slot.groups
                    .iter()
                    .map(|g| inner.groups[g].ops.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A handle to one schedulable group.
///
/// Handles are snapshots of admissibility, not leases: a handle taken before
/// a failure elsewhere may go stale, in which case [`started`] fails
/// `Schedule` and the handle should be discarded.
///
/// [`started`]: GroupHandle::started
pub struct GroupHandle<T> {
    inner: Arc<Mutex<Inner<T>>>,
    id: GroupId,
    shard: String,
}

impl<T> Clone for GroupHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            id: self.id,
            shard: self.shard.clone(),
        }
    }
}

impl<T> fmt::Debug for GroupHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupHandle")
            .field("id", &self.id)
            .field("shard", &self.shard)
            .finish()
    }
}

impl<T> GroupHandle<T> {
    /// The shard this group operates on.
    pub fn shard(&self) -> &str {
        &self.shard
    }

    /// The group's operations in execution order.
    pub fn ops(&self) -> Vec<OpId> {
        let inner = self.inner.lock();
        inner
            .groups
            .get(&self.id)
            .map(|g| g.ops.clone())
            .unwrap_or_default()
    }

    /// Transition AVAILABLE -> STARTED, marking the shard busy.
    ///
    /// Fails `Schedule` when the handle is stale (the group completed,
    /// failed, or was rebalanced away) or the shard is already running.
    pub fn started(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let group = inner
            .groups
            .get(&self.id)
            .ok_or_else(|| Error::Schedule(format!("stale group handle {}", self.id)))?;
        if group.state != GroupState::Available {
            return Err(Error::Schedule(format!("group {} already started", self.id)));
        }
        let slot = inner
            .shards
            .get(&self.shard)
            .ok_or_else(|| Error::Schedule(format!("no shard slot for {}", self.shard)))?;
        if slot.state != SlotState::Available {
            return Err(Error::Schedule(format!("shard {} already running", self.shard)));
        }
        inner.groups.get_mut(&self.id).expect("checked above").state = GroupState::Started;
        inner.shards.get_mut(&self.shard).expect("checked above").state = SlotState::Started;
        trace!(group = %self.id, shard = %self.shard, "group started");
        Ok(())
    }

    /// Move the operations' values out for execution.
    ///
    /// Only valid on a started group.
    pub fn take_values(&self) -> Result<Vec<(OpId, T)>> {
        let mut inner = self.inner.lock();
        let group = inner
            .groups
            .get(&self.id)
            .ok_or_else(|| Error::Schedule(format!("stale group handle {}", self.id)))?;
        if group.state != GroupState::Started {
            return Err(Error::Schedule(format!("group {} not started", self.id)));
        }
        let ops = group.ops.clone();
        let mut values = Vec::with_capacity(ops.len());
        for id in ops {
            let node = inner.ops.get_mut(&id).expect("group op exists");
            if let Some(value) = node.value.take() {
                values.push((id, value));
            }
        }
        Ok(values)
    }

    /// Transition STARTED -> COMPLETED: the group's write reached storage.
    ///
    /// Removes the group and its operations, releasing every dependant that
    /// waited on them and the shard itself.
    pub fn completed(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let group = inner
            .groups
            .get(&self.id)
            .ok_or_else(|| Error::Schedule(format!("stale group handle {}", self.id)))?;
        if group.state != GroupState::Started {
            return Err(Error::Schedule(format!("group {} not started", self.id)));
        }
        let ops = group.ops.clone();
        for id in ops {
            inner.remove_op(id);
        }
        inner.remove_group(self.id);
        if let Some(slot) = inner.shards.get_mut(&self.shard) {
            slot.state = SlotState::Available;
            if slot.groups.is_empty() {
                inner.shards.remove(&self.shard);
            }
        }
        trace!(group = %self.id, shard = %self.shard, "group completed");
        Ok(())
    }

    /// Transition STARTED -> FAILED: the group's write was lost.
    ///
    /// Cancels the group's operations and all their transitive descendants,
    /// returning the cancelled values so the caller can reject their
    /// futures, then rebalances the surviving operations.
    pub fn failed(&self) -> Result<Vec<T>> {
        let mut inner = self.inner.lock();
        let ops = {
            let group = inner
                .groups
                .get_mut(&self.id)
                .ok_or_else(|| Error::Schedule(format!("stale group handle {}", self.id)))?;
            if group.state != GroupState::Started {
                return Err(Error::Schedule(format!("group {} not started", self.id)));
            }
            group.state = GroupState::Failed;
            group.ops.clone()
        };
        let mut doomed: BTreeSet<OpId> = ops.iter().copied().collect();
        for id in &ops {
            doomed.extend(inner.ops[id].descendants.iter().copied());
        }
        if let Some(slot) = inner.shards.get_mut(&self.shard) {
            slot.state = SlotState::Available;
        }
        let values = inner.cancel_ops(&doomed);
        inner.rebalance();
        trace!(group = %self.id, cancelled = doomed.len(), "group failed");
        Ok(values)
    }

    /// Cancel one operation and its transitive descendants.
    ///
    /// Group siblings of the failed operation are left in place. Returns the
    /// cancelled values, then rebalances the survivors. Fails `Schedule` for
    /// an unknown op or one whose group is already running.
    pub fn op_failed(&self, op: OpId) -> Result<Vec<T>> {
        let mut inner = self.inner.lock();
        let node = inner
            .ops
            .get(&op)
            .ok_or_else(|| Error::Schedule(format!("unknown operation {op}")))?;
        if inner.groups[&node.group].state == GroupState::Started && node.group != self.id {
            return Err(Error::Schedule(format!("operation {op} is running")));
        }
        let mut doomed: BTreeSet<OpId> = node.descendants.clone();
        doomed.insert(op);
        let values = inner.cancel_ops(&doomed);
        inner.rebalance();
        trace!(op = %op, cancelled = doomed.len(), "operation failed");
        Ok(values)
    }
}

impl<T> Inner<T> {
    /// Place one operation, wiring op and group dependency closures.
    ///
    /// `value` is `None` only during a rebalance, for an op whose value was
    /// already taken by the executor.
    fn insert_op(&mut self, id: OpId, shard: &str, deps: &[OpId], value: Option<T>) -> Result<()> {
        let dep_groups: BTreeSet<GroupId> =
            deps.iter().map(|d| self.ops[d].group).collect();
        self.shards.entry(shard.to_string()).or_insert(ShardSlot {
            groups: Vec::new(),
            state: SlotState::Available,
        });
        let group = self.place(shard, &dep_groups)?;

        // Op-level closures.
        let parents: BTreeSet<OpId> = deps.iter().copied().collect();
        let mut ancestors = parents.clone();
        for dep in deps {
            ancestors.extend(self.ops[dep].ancestors.iter().copied());
        }
        for a in &ancestors {
            self.ops.get_mut(a).expect("ancestor exists").descendants.insert(id);
        }
        self.ops.insert(
            id,
            OpNode {
                shard: shard.to_string(),
                group,
                parents,
                ancestors,
                descendants: BTreeSet::new(),
                value,
            },
        );
        self.groups.get_mut(&group).expect("placed group").ops.push(id);

        // Group-level edges to every dependency group.
        for dep_group in &dep_groups {
            if *dep_group != group && self.groups.contains_key(dep_group) {
                self.add_group_parent(group, *dep_group)?;
            }
        }
        self.recompute_depths(group);
        Ok(())
    }

    /// Choose the group for a new op on `shard`, or open a new one.
    ///
    /// Slot order is materialised as parent edges between neighbouring
    /// groups, so group ancestry is the single source of truth for both
    /// cross-shard and same-shard ordering. The lower-bound scan below then
    /// automatically excludes any group the op's dependencies transitively
    /// wait on, whichever shards the chain runs through.
    fn place(&mut self, shard: &str, dep_groups: &BTreeSet<GroupId>) -> Result<GroupId> {
        let slot = &self.shards[shard];

        // Rightmost same-shard group that constrains placement: a group that
        // directly holds a dependency may be reused, a group that is an
        // ancestor of a dependency group must stay strictly before us.
        // `floor` is where a fresh group may be inserted: always strictly
        // after the bound, reused or not.
        let mut start = 0;
        let mut floor = 0;
        for (i, g) in slot.groups.iter().enumerate() {
            if dep_groups.contains(g) {
                start = i;
                floor = i + 1;
            } else if dep_groups
                .iter()
                .any(|dg| self.groups[dg].ancestors.contains(g))
            {
                start = i + 1;
                floor = i + 1;
            }
        }
        // Never place ahead of a group that is already running.
        if let Some(started_at) = slot
            .groups
            .iter()
            .rposition(|g| self.groups[g].state != GroupState::Available)
        {
            start = start.max(started_at + 1);
            floor = floor.max(started_at + 1);
        }

        let desired = dep_groups
            .iter()
            .filter(|dg| self.groups[dg].shard != shard)
            .map(|dg| self.groups[dg].depth + 1)
            .max()
            .unwrap_or(0);

        // Among admissible groups, take the one closest to the desired
        // depth; on ties the earlier group wins unless a later one has no
        // dependants yet.
        let mut chosen: Option<(usize, u32)> = None;
        for (i, g) in slot.groups.iter().enumerate().skip(start) {
            let group = &self.groups[g];
            if group.state != GroupState::Available {
                continue;
            }
            let dist = group.depth.abs_diff(desired);
            match chosen {
                None => chosen = Some((i, dist)),
                Some((_, best)) if dist < best => chosen = Some((i, dist)),
                Some((_, best)) if dist == best && group.descendants.is_empty() => {
                    chosen = Some((i, dist));
                }
                _ => {}
            }
        }

        if let Some((i, dist)) = chosen {
            let gid = slot.groups[i];
            let depth = self.groups[&gid].depth;
            let split = dist >= self.depth_limit || desired > depth + self.depth_limit + 1;
            if !split {
                return Ok(gid);
            }
        }

        // Open a new group just before the first same-shard group that is
        // deeper than we want to be.
        let mut at = floor;
        while at < slot.groups.len() && self.groups[&slot.groups[at]].depth <= desired {
            at += 1;
        }
        let predecessor = at.checked_sub(1).map(|i| slot.groups[i]);
        let successor = slot.groups.get(at).copied();
        let gid = GroupId(self.next_group);
        self.next_group += 1;
        self.groups.insert(
            gid,
            GroupNode {
                shard: shard.to_string(),
                ops: Vec::new(),
                parents: BTreeSet::new(),
                ancestors: BTreeSet::new(),
                descendants: BTreeSet::new(),
                state: GroupState::Available,
                depth: desired,
            },
        );
        self.shards
            .get_mut(shard)
            .expect("slot exists")
            .groups
            .insert(at, gid);
        // Knit the slot chain into the ancestry sets.
        if let Some(prev) = predecessor {
            self.add_group_parent(gid, prev)?;
        }
        if let Some(next) = successor {
            self.add_group_parent(next, gid)?;
        }
        Ok(gid)
    }

    /// Add `parent` as a dependency of `group`, updating both closures.
    fn add_group_parent(&mut self, group: GroupId, parent: GroupId) -> Result<()> {
        if group == parent || self.groups[&group].parents.contains(&parent) {
            return Ok(());
        }
        if self.groups[&group].descendants.contains(&parent) {
            return Err(Error::Schedule(format!(
                "group dependency cycle between {group} and {parent}"
            )));
        }
        self.groups.get_mut(&group).expect("group exists").parents.insert(parent);
        let mut ups: BTreeSet<GroupId> = self.groups[&parent].ancestors.clone();
        ups.insert(parent);
        let mut downs: BTreeSet<GroupId> = self.groups[&group].descendants.clone();
        downs.insert(group);
        for up in &ups {
            let node = self.groups.get_mut(up).expect("ancestor exists");
            node.descendants.extend(downs.iter().copied());
        }
        for down in &downs {
            let node = self.groups.get_mut(down).expect("descendant exists");
            node.ancestors.extend(ups.iter().copied());
        }
        Ok(())
    }

    /// Recompute depths of `group` and its descendants in topological order.
    fn recompute_depths(&mut self, group: GroupId) {
        let mut affected: Vec<GroupId> = self.groups[&group]
            .descendants
            .iter()
            .copied()
            .chain([group])
            .collect();
        // Ancestor-set size is a topological key over a DAG.
        affected.sort_by_key(|g| self.groups[g].ancestors.len());
        for g in affected {
            let node = &self.groups[&g];
            let depth = node
                .parents
                .iter()
                .filter(|p| self.groups[p].shard != node.shard)
                .map(|p| self.groups[p].depth + 1)
                .max()
                .unwrap_or(0);
            self.groups.get_mut(&g).expect("group exists").depth = depth;
        }
    }

    /// Remove one op from the arena and every closure that names it.
    fn remove_op(&mut self, id: OpId) -> Option<T> {
        let node = self.ops.remove(&id)?;
        for a in &node.ancestors {
            if let Some(anc) = self.ops.get_mut(a) {
                anc.descendants.remove(&id);
            }
        }
        for d in &node.descendants {
            if let Some(desc) = self.ops.get_mut(d) {
                desc.ancestors.remove(&id);
                desc.parents.remove(&id);
            }
        }
        node.value
    }

    /// Remove one group from the arena, its closures, and its shard slot.
    fn remove_group(&mut self, id: GroupId) {
        let Some(node) = self.groups.remove(&id) else {
            return;
        };
        for a in &node.ancestors {
            if let Some(anc) = self.groups.get_mut(a) {
                anc.descendants.remove(&id);
            }
        }
        let mut children = Vec::new();
        for d in &node.descendants {
            if let Some(desc) = self.groups.get_mut(d) {
                desc.ancestors.remove(&id);
                if desc.parents.remove(&id) {
                    children.push(*d);
                }
            }
        }
        if let Some(slot) = self.shards.get_mut(&node.shard) {
            slot.groups.retain(|g| *g != id);
        }
        for child in children {
            self.recompute_depths(child);
        }
    }

    /// Drop a set of ops, their group memberships, and any emptied groups.
    fn cancel_ops(&mut self, doomed: &BTreeSet<OpId>) -> Vec<T> {
        let mut values = Vec::new();
        let mut touched_groups = BTreeSet::new();
        for id in doomed {
            if let Some(node) = self.ops.get(id) {
                touched_groups.insert(node.group);
            }
            if let Some(value) = self.remove_op(*id) {
                values.push(value);
            }
        }
        for gid in touched_groups {
            let emptied = match self.groups.get_mut(&gid) {
                Some(group) => {
                    group.ops.retain(|op| !doomed.contains(op));
                    group.ops.is_empty()
                }
                None => false,
            };
            if emptied {
                self.remove_group(gid);
            }
        }
        // Emptied shards disappear so the executor stops reading them.
        self.shards.retain(|_, slot| !slot.groups.is_empty());
        values
    }

    /// Rebuild the schedule from its surviving operations.
    ///
    /// Started groups are carried over verbatim with their original ids;
    /// every other op is re-added in topological order, which re-derives
    /// grouping and depths from scratch. Id counters carry over, so no id is
    /// ever reused.
    fn rebalance(&mut self) {
        let mut fresh = Inner {
            depth_limit: self.depth_limit,
            next_op: self.next_op,
            next_group: self.next_group,
            ops: HashMap::new(),
            groups: HashMap::new(),
            shards: BTreeMap::new(),
        };

        // Keep running groups exactly as they are: their ops execute against
        // state that is already being read.
        let mut started: Vec<GroupId> = self
            .groups
            .iter()
            .filter(|(_, g)| g.state == GroupState::Started)
            .map(|(id, _)| *id)
            .collect();
        started.sort();
        let mut carried: BTreeSet<OpId> = BTreeSet::new();
        for gid in started {
            let group = self.groups.get_mut(&gid).expect("started group");
            let shard = group.shard.clone();
            let ops = std::mem::take(&mut group.ops);
            fresh.groups.insert(
                gid,
                GroupNode {
                    shard: shard.clone(),
                    ops: ops.clone(),
                    parents: BTreeSet::new(),
                    ancestors: BTreeSet::new(),
                    descendants: BTreeSet::new(),
                    state: GroupState::Started,
                    depth: 0,
                },
            );
            fresh.shards.insert(
                shard.clone(),
                ShardSlot {
                    groups: vec![gid],
                    state: SlotState::Started,
                },
            );
            for id in ops {
                carried.insert(id);
                let node = self.ops.get_mut(&id).expect("started op");
                // A started group has no remaining ancestors, so its ops
                // only ever depend on each other.
                fresh.ops.insert(
                    id,
                    OpNode {
                        shard: shard.clone(),
                        group: gid,
                        parents: node.parents.clone(),
                        ancestors: node.ancestors.clone(),
                        descendants: BTreeSet::new(),
                        value: node.value.take(),
                    },
                );
            }
        }

        // Everything else is re-added in topological order.
        let mut rest: Vec<OpId> = self
            .ops
            .keys()
            .filter(|id| !carried.contains(id))
            .copied()
            .collect();
        rest.sort_by_key(|id| (self.ops[id].ancestors.len(), *id));
        for id in rest {
            let node = self.ops.get_mut(&id).expect("surviving op");
            let shard = node.shard.clone();
            let deps: Vec<OpId> = node.parents.iter().copied().collect();
            let value = node.value.take();
            // Dependencies on ops carried inside started groups still exist
            // in the fresh arena; anything else was satisfied before the
            // rebalance and is dropped from the parent set.
            let live: Vec<OpId> = deps
                .iter()
                .filter(|d| fresh.ops.contains_key(d))
                .copied()
                .collect();
            let _placed = fresh.insert_op(id, &shard, &live, value);
            debug_assert!(_placed.is_ok(), "rebalance placement cannot fail");
        }

        *self = fresh;
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn independent_ops_on_one_shard_batch() {
        let schedule: Schedule<&str> = Schedule::new();
        let w1 = schedule.add("A", &[], "w1").unwrap();
        let w2 = schedule.add("A", &[], "w2").unwrap();
        assert_eq!(schedule.shard_groups("A"), vec![vec![w1, w2]]);

        let group = schedule.next_group().unwrap();
        group.started().unwrap();
        let values: Vec<&str> = group
            .take_values()
            .unwrap()
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        assert_eq!(values, vec!["w1", "w2"]);
    }

    #[test]
    fn indirect_dependency_forces_split() {
        let schedule: Schedule<()> = Schedule::new();
        let w1 = schedule.add("A", &[], ()).unwrap();
        let w2 = schedule.add("B", &[w1], ()).unwrap();
        let w3 = schedule.add("A", &[w2], ()).unwrap();
        assert_eq!(schedule.shard_groups("A"), vec![vec![w1], vec![w3]]);
        assert_eq!(schedule.shard_groups("B"), vec![vec![w2]]);

        // Only the first A group is admissible.
        let first = schedule.next_group().unwrap();
        assert_eq!(first.shard(), "A");
        assert_eq!(first.ops(), vec![w1]);
        first.started().unwrap();
        assert!(schedule.next_group().is_none());
        first.completed().unwrap();

        // Completing it unblocks the B group, not the second A group.
        let second = schedule.next_group().unwrap();
        assert_eq!(second.shard(), "B");
        assert_eq!(second.ops(), vec![w2]);
        second.started().unwrap();
        second.completed().unwrap();

        let third = schedule.next_group().unwrap();
        assert_eq!(third.shard(), "A");
        assert_eq!(third.ops(), vec![w3]);
    }

    #[test]
    fn depth_limited_reshuffle_opens_leading_group() {
        let schedule: Schedule<()> = Schedule::with_depth_limit(2);
        let w1 = schedule.add("A", &[], ()).unwrap();
        let w2 = schedule.add("B", &[w1], ()).unwrap();
        let w3 = schedule.add("C", &[w2], ()).unwrap();
        let w4 = schedule.add("C", &[], ()).unwrap();
        // The independent op goes into a new leading C group instead of
        // joining the deep end of the chain.
        assert_eq!(schedule.shard_groups("C"), vec![vec![w4], vec![w3]]);
    }

    #[test]
    fn close_depths_share_a_group() {
        let schedule: Schedule<()> = Schedule::with_depth_limit(2);
        let w1 = schedule.add("A", &[], ()).unwrap();
        let w2 = schedule.add("B", &[w1], ()).unwrap();
        let w3 = schedule.add("B", &[], ()).unwrap();
        // Depth distance 1 is under the limit: both B ops batch together.
        assert_eq!(schedule.shard_groups("B"), vec![vec![w2, w3]]);
    }

    #[test]
    fn unknown_dependency_fails() {
        let schedule: Schedule<()> = Schedule::new();
        let w1 = schedule.add("A", &[], ()).unwrap();
        let group = schedule.next_group().unwrap();
        group.started().unwrap();
        group.completed().unwrap();
        assert!(matches!(
            schedule.add("A", &[w1], ()),
            Err(Error::Schedule(_))
        ));
    }

    #[test]
    fn next_group_requires_completed_ancestors() {
        let schedule: Schedule<()> = Schedule::new();
        let w1 = schedule.add("A", &[], ()).unwrap();
        let _w2 = schedule.add("B", &[w1], ()).unwrap();

        let first = schedule.next_group().unwrap();
        assert_eq!(first.shard(), "A");
        first.started().unwrap();
        // B's group still has an uncompleted ancestor.
        assert!(schedule.next_group().is_none());
        first.completed().unwrap();
        assert_eq!(schedule.next_group().unwrap().shard(), "B");
    }

    #[test]
    fn started_group_stops_accepting_ops() {
        let schedule: Schedule<&str> = Schedule::new();
        let w1 = schedule.add("A", &[], "w1").unwrap();
        let group = schedule.next_group().unwrap();
        group.started().unwrap();
        let w5 = schedule.add("A", &[], "w5").unwrap();
        assert_eq!(schedule.shard_groups("A"), vec![vec![w1], vec![w5]]);
    }

    #[test]
    fn group_failure_cancels_descendants() {
        let schedule: Schedule<&str> = Schedule::new();
        let w1 = schedule.add("A", &[], "w1").unwrap();
        let w2 = schedule.add("B", &[w1], "w2").unwrap();
        let _w3 = schedule.add("C", &[w2], "w3").unwrap();

        let group = schedule.next_group().unwrap();
        assert_eq!(group.shard(), "A");
        group.started().unwrap();
        // Added after the group started: lands in its own group, survives.
        let w5 = schedule.add("A", &[], "w5").unwrap();

        let mut cancelled = group.failed().unwrap();
        cancelled.sort();
        assert_eq!(cancelled, vec!["w1", "w2", "w3"]);
        assert_eq!(schedule.shard_groups("A"), vec![vec![w5]]);
        assert!(schedule.shard_groups("B").is_empty());
        assert!(schedule.shard_groups("C").is_empty());
        assert_eq!(schedule.len(), 1);
    }

    #[test]
    fn stale_handle_fails_started() {
        let schedule: Schedule<&str> = Schedule::new();
        let w1 = schedule.add("A", &[], "w1").unwrap();
        let _w2 = schedule.add("B", &[w1], "w2").unwrap();

        let a_group = schedule.next_group().unwrap();
        a_group.started().unwrap();
        // Handle to B taken while A is running: no group is admissible yet,
        // so grab the stale case through failure instead.
        a_group.failed().unwrap();
        assert!(matches!(a_group.started(), Err(Error::Schedule(_))));
        assert!(matches!(a_group.completed(), Err(Error::Schedule(_))));
    }

    #[test]
    fn rebalance_after_failure_preserves_started_groups() {
        let schedule: Schedule<&str> = Schedule::new();
        let a1 = schedule.add("A", &[], "a1").unwrap();
        let b1 = schedule.add("B", &[], "b1").unwrap();
        let _b2 = schedule.add("C", &[b1], "b2").unwrap();

        // Start A and B concurrently.
        let first = schedule.next_group().unwrap();
        assert_eq!(first.shard(), "A");
        first.started().unwrap();
        let second = schedule.next_group().unwrap();
        assert_eq!(second.shard(), "B");
        second.started().unwrap();

        // Failing B must leave the running A group untouched.
        let mut cancelled = second.failed().unwrap();
        cancelled.sort();
        assert_eq!(cancelled, vec!["b1", "b2"]);
        assert_eq!(schedule.shard_groups("A"), vec![vec![a1]]);
        first.completed().unwrap();
        assert!(schedule.is_empty());
    }

    #[test]
    fn op_failed_spares_group_siblings() {
        let schedule: Schedule<&str> = Schedule::new();
        let w1 = schedule.add("A", &[], "w1").unwrap();
        let w2 = schedule.add("A", &[], "w2").unwrap();
        let _w3 = schedule.add("B", &[w2], "w3").unwrap();
        // w1 and w2 share a group.
        assert_eq!(schedule.shard_groups("A"), vec![vec![w1, w2]]);

        let group = schedule.next_group().unwrap();
        let mut cancelled = group.op_failed(w2).unwrap();
        cancelled.sort();
        assert_eq!(cancelled, vec!["w2", "w3"]);
        assert_eq!(schedule.shard_groups("A"), vec![vec![w1]]);
        assert!(schedule.shard_groups("B").is_empty());
    }

    #[test]
    fn cross_shard_chain_orders_execution() {
        let schedule: Schedule<u32> = Schedule::new();
        let mut prev = None;
        for (i, shard) in ["A", "B", "C", "A"].iter().enumerate() {
            let deps: Vec<OpId> = prev.into_iter().collect();
            prev = Some(schedule.add(shard, &deps, i as u32).unwrap());
        }
        let mut order = Vec::new();
        while let Some(group) = schedule.next_group() {
            group.started().unwrap();
            for (_, v) in group.take_values().unwrap() {
                order.push(v);
            }
            group.completed().unwrap();
        }
        assert_eq!(order, vec![0, 1, 2, 3]);
        assert!(schedule.is_empty());
    }

    #[test]
    fn deep_fanout_keeps_dag_consistent() {
        let schedule: Schedule<usize> = Schedule::new();
        let roots: Vec<OpId> = (0..4)
            .map(|i| schedule.add("A", &[], i).unwrap())
            .collect();
        let mids: Vec<OpId> = roots
            .iter()
            .enumerate()
            .map(|(i, r)| schedule.add("B", &[*r], 10 + i).unwrap())
            .collect();
        let _tip = schedule.add("C", &mids, 20).unwrap();

        let mut seen = Vec::new();
        while let Some(group) = schedule.next_group() {
            group.started().unwrap();
            for (_, v) in group.take_values().unwrap() {
                seen.push(v);
            }
            group.completed().unwrap();
        }
        assert_eq!(seen.len(), 9);
        // The tip runs last.
        assert_eq!(*seen.last().unwrap(), 20);
        assert!(schedule.is_empty());
    }

    #[test]
    fn completion_releases_only_direct_dependants() {
        let schedule: Schedule<&str> = Schedule::new();
        let a = schedule.add("A", &[], "a").unwrap();
        let b = schedule.add("B", &[], "b").unwrap();
        let _c = schedule.add("C", &[a, b], "c").unwrap();

        let first = schedule.next_group().unwrap();
        first.started().unwrap();
        first.completed().unwrap();
        // C still waits on B.
        let second = schedule.next_group().unwrap();
        assert_eq!(second.shard(), "B");
        second.started().unwrap();
        second.completed().unwrap();
        let third = schedule.next_group().unwrap();
        assert_eq!(third.shard(), "C");
    }

    #[test]
    fn dependency_on_running_group_waits_for_commit() {
        let schedule: Schedule<&str> = Schedule::new();
        let a = schedule.add("A", &[], "a").unwrap();
        let group = schedule.next_group().unwrap();
        group.started().unwrap();

        // Depending on an op that is mid-flight is legal; the dependant
        // stays inadmissible until the write commits.
        let _b = schedule.add("B", &[a], "b").unwrap();
        assert!(schedule.next_group().is_none());
        group.completed().unwrap();
        assert_eq!(schedule.next_group().unwrap().shard(), "B");
    }

    #[test]
    fn failed_chain_leaves_unrelated_shards_runnable() {
        let schedule: Schedule<&str> = Schedule::new();
        let a = schedule.add("A", &[], "a").unwrap();
        let _b = schedule.add("B", &[a], "b").unwrap();
        let _x = schedule.add("X", &[], "x").unwrap();

        let group = schedule.next_group().unwrap();
        assert_eq!(group.shard(), "A");
        group.started().unwrap();
        group.failed().unwrap();

        // X was never part of the failed chain.
        let survivor = schedule.next_group().unwrap();
        assert_eq!(survivor.shard(), "X");
        survivor.started().unwrap();
        survivor.completed().unwrap();
        assert!(schedule.is_empty());
    }

    #[test]
    fn ids_are_never_reused_across_rebalance() {
        let schedule: Schedule<&str> = Schedule::new();
        let mut seen = std::collections::HashSet::new();
        for round in 0..3 {
            let a = schedule.add("A", &[], "a").unwrap();
            let b = schedule.add("B", &[a], "b").unwrap();
            assert!(seen.insert(a), "round {round} reused {a}");
            assert!(seen.insert(b), "round {round} reused {b}");
            let group = schedule.next_group().unwrap();
            group.started().unwrap();
            group.failed().unwrap();
        }
        assert!(schedule.is_empty());
    }

    #[test]
    fn shards_reports_only_live_slots() {
        let schedule: Schedule<&str> = Schedule::new();
        let a = schedule.add("A", &[], "a").unwrap();
        let _b = schedule.add("B", &[a], "b").unwrap();
        assert_eq!(schedule.shards(), vec!["A".to_string(), "B".to_string()]);

        let group = schedule.next_group().unwrap();
        group.started().unwrap();
        group.completed().unwrap();
        assert_eq!(schedule.shards(), vec!["B".to_string()]);
    }

    #[test]
    fn take_values_requires_started_group() {
        let schedule: Schedule<&str> = Schedule::new();
        schedule.add("A", &[], "a").unwrap();
        let group = schedule.next_group().unwrap();
        assert!(matches!(group.take_values(), Err(Error::Schedule(_))));
        group.started().unwrap();
        assert_eq!(group.take_values().unwrap().len(), 1);
        // Values move out exactly once.
        assert!(group.take_values().unwrap().is_empty());
    }

    #[test]
    fn deep_chain_depths_follow_cross_shard_edges() {
        let schedule: Schedule<u32> = Schedule::new();
        // A -> B -> A -> B zig-zag: four groups, alternating shards.
        let mut prev: Option<OpId> = None;
        for (i, shard) in ["A", "B", "A", "B"].iter().enumerate() {
            let deps: Vec<OpId> = prev.into_iter().collect();
            prev = Some(schedule.add(shard, &deps, i as u32).unwrap());
        }
        assert_eq!(schedule.shard_groups("A").len(), 2);
        assert_eq!(schedule.shard_groups("B").len(), 2);

        let mut order = Vec::new();
        while let Some(group) = schedule.next_group() {
            group.started().unwrap();
            for (_, v) in group.take_values().unwrap() {
                order.push(v);
            }
            group.completed().unwrap();
        }
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Whatever DAG is thrown at it, the schedule executes every
        /// operation exactly once and never before its dependencies.
        #[test]
        fn dependencies_always_execute_first(
            plan in proptest::collection::vec(
                (0u8..3, proptest::collection::vec(any::<prop::sample::Index>(), 0..3)),
                1..32,
            )
        ) {
            let schedule: Schedule<usize> = Schedule::new();
            let mut ids: Vec<OpId> = Vec::new();
            let mut dep_map: Vec<Vec<usize>> = Vec::new();
            for (i, (shard, picks)) in plan.iter().enumerate() {
                let mut deps: Vec<usize> = Vec::new();
                if !ids.is_empty() {
                    deps = picks.iter().map(|pick| pick.index(ids.len())).collect();
                    deps.sort_unstable();
                    deps.dedup();
                }
                let dep_ids: Vec<OpId> = deps.iter().map(|d| ids[*d]).collect();
                let shard = ["A", "B", "C"][*shard as usize];
                ids.push(schedule.add(shard, &dep_ids, i).unwrap());
                dep_map.push(deps);
            }

            let mut done = vec![false; ids.len()];
            while let Some(group) = schedule.next_group() {
                group.started().unwrap();
                for (_, i) in group.take_values().unwrap() {
                    for dep in &dep_map[i] {
                        prop_assert!(done[*dep], "op {i} ran before dependency {dep}");
                    }
                    prop_assert!(!done[i], "op {i} ran twice");
                    done[i] = true;
                }
                group.completed().unwrap();
            }
            prop_assert!(done.iter().all(|d| *d));
            prop_assert!(schedule.is_empty());
        }
    }
}
