// Copyright 2024 dxram-rs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt::{Display, Formatter};

use dxram_types::{NodeId, NodeRole, INVALID_NODE_ID};

/// Index of the superpeer responsible for `target` in a sorted list: the
/// first id `>= target`, wrapping to the first entry.
fn responsible_index(superpeers: &[NodeId], target: NodeId) -> Option<usize> {
    if superpeers.is_empty() {
        return None;
    }
    let index = match superpeers.binary_search(&target) {
        Ok(i) => i,
        Err(i) if i == superpeers.len() => 0,
        Err(i) => i,
    };
    Some(index)
}

/// Consistent hashing successor of `target` in the sorted `superpeers`.
pub fn responsible_superpeer(superpeers: &[NodeId], target: NodeId) -> Option<NodeId> {
    responsible_index(superpeers, target).map(|i| superpeers[i])
}

fn insert_sorted(list: &mut Vec<NodeId>, node: NodeId) -> bool {
    match list.binary_search(&node) {
        Ok(_) => false,
        Err(i) => {
            list.insert(i, node);
            true
        }
    }
}

fn remove_sorted(list: &mut Vec<NodeId>, node: NodeId) -> Option<usize> {
    let index = list.binary_search(&node).ok()?;
    list.remove(index);
    Some(index)
}

/// One node's view of the ring.
///
/// On a superpeer `superpeers` holds every other known superpeer, never the
/// node itself. On a peer it holds all superpeers it heard of.
#[derive(Debug, Clone)]
pub struct OverlayState {
    me: NodeId,
    role: NodeRole,
    predecessor: Option<NodeId>,
    successor: Option<NodeId>,
    my_superpeer: Option<NodeId>,
    bootstrap: Option<NodeId>,
    /// Superpeers this node expects to see in `superpeers`.
    expected_superpeers: usize,
    backup_count: usize,
    superpeers: Vec<NodeId>,
    peers: Vec<NodeId>,
}

impl OverlayState {
    pub fn new(me: NodeId, role: NodeRole, total_superpeers: usize, backup_count: usize) -> Self {
        let expected_superpeers = if role.is_superpeer() {
            total_superpeers.saturating_sub(1)
        } else {
            total_superpeers
        };
        Self {
            me,
            role,
            predecessor: None,
            successor: None,
            my_superpeer: None,
            bootstrap: None,
            expected_superpeers,
            backup_count,
            superpeers: Vec::new(),
            peers: Vec::new(),
        }
    }

    pub fn me(&self) -> NodeId { self.me }

    pub fn role(&self) -> NodeRole { self.role }

    pub fn is_superpeer(&self) -> bool { self.role.is_superpeer() }

    /// Turns this peer into a superpeer; it stops counting itself.
    pub fn become_superpeer(&mut self) {
        if !self.role.is_superpeer() {
            self.role = NodeRole::Superpeer;
            self.expected_superpeers = self.expected_superpeers.saturating_sub(1);
            self.my_superpeer = None;
        }
    }

    pub fn predecessor(&self) -> Option<NodeId> { self.predecessor }

    pub fn successor(&self) -> Option<NodeId> { self.successor }

    pub fn my_superpeer(&self) -> Option<NodeId> { self.my_superpeer }

    pub fn set_my_superpeer(&mut self, superpeer: Option<NodeId>) { self.my_superpeer = superpeer; }

    pub fn bootstrap(&self) -> Option<NodeId> { self.bootstrap }

    pub fn set_bootstrap(&mut self, bootstrap: NodeId) { self.bootstrap = Some(bootstrap); }

    pub fn superpeers(&self) -> &[NodeId] { &self.superpeers }

    pub fn peers(&self) -> &[NodeId] { &self.peers }

    pub fn expected_superpeers(&self) -> usize { self.expected_superpeers }

    pub fn is_stable(&self) -> bool { self.expected_superpeers == self.superpeers.len() }

    pub fn is_only_superpeer(&self) -> bool { self.is_superpeer() && self.superpeers.is_empty() }

    pub fn set_successor(&mut self, successor: Option<NodeId>) {
        self.successor = successor;
        if let Some(s) = successor {
            self.insert_superpeer(s);
        }
    }

    pub fn set_predecessor(&mut self, predecessor: Option<NodeId>) {
        self.predecessor = predecessor;
        if let Some(p) = predecessor {
            self.insert_superpeer(p);
        }
    }

    /// Replaces the known superpeers wholesale, e.g. from a join response.
    pub fn replace_superpeers(&mut self, superpeers: Vec<NodeId>) {
        self.superpeers.clear();
        for superpeer in superpeers {
            self.insert_superpeer(superpeer);
        }
    }

    pub fn replace_peers(&mut self, peers: Vec<NodeId>) {
        self.peers.clear();
        for peer in peers {
            self.insert_peer(peer);
        }
    }

    pub fn insert_superpeer(&mut self, superpeer: NodeId) -> bool {
        if superpeer == INVALID_NODE_ID || (self.is_superpeer() && superpeer == self.me) {
            return false;
        }
        insert_sorted(&mut self.superpeers, superpeer)
    }

    /// Drops `superpeer`; a successor or predecessor pointing at it moves
    /// on to its ring neighbour.
    pub fn remove_superpeer(&mut self, superpeer: NodeId) -> bool {
        let Some(index) = remove_sorted(&mut self.superpeers, superpeer) else {
            return false;
        };
        let len = self.superpeers.len();
        if self.successor == Some(superpeer) {
            self.successor = (len > 0).then(|| self.superpeers[if index < len { index } else { 0 }]);
        }
        if self.predecessor == Some(superpeer) {
            self.predecessor = (len > 0).then(|| self.superpeers[if index > 0 { index - 1 } else { len - 1 }]);
        }
        if self.my_superpeer == Some(superpeer) {
            self.my_superpeer = responsible_superpeer(&self.superpeers, self.me);
        }
        true
    }

    pub fn contains_superpeer(&self, node: NodeId) -> bool { self.superpeers.binary_search(&node).is_ok() }

    pub fn insert_peer(&mut self, peer: NodeId) -> bool {
        if peer == INVALID_NODE_ID {
            return false;
        }
        insert_sorted(&mut self.peers, peer)
    }

    pub fn remove_peer(&mut self, peer: NodeId) -> bool { remove_sorted(&mut self.peers, peer).is_some() }

    pub fn contains_peer(&self, node: NodeId) -> bool { self.peers.binary_search(&node).is_ok() }

    pub fn responsible_superpeer(&self, target: NodeId) -> Option<NodeId> {
        responsible_superpeer(&self.superpeers, target)
    }

    /// Where a request about `target` goes: the responsible superpeer among
    /// all superpeers including this node, and the superpeer right before it
    /// if there is more than one.
    pub fn route(&self, target: NodeId) -> Option<(NodeId, Option<NodeId>)> {
        let all = self.all_superpeers();
        let index = responsible_index(&all, target)?;
        let len = all.len();
        let predecessor = (len > 1).then(|| all[(index + len - 1) % len]);
        Some((all[index], predecessor))
    }

    /// The superpeers holding replicas of `node`'s metadata: up to
    /// `backup_count` ring successors of `node`, empty when this superpeer
    /// is alone.
    pub fn backup_superpeers(&self, node: NodeId) -> Vec<NodeId> {
        if self.is_only_superpeer() || self.superpeers.is_empty() {
            return Vec::new();
        }
        let len = self.superpeers.len();
        let count = len.min(self.backup_count);
        let start = match self.superpeers.binary_search(&node) {
            Ok(i) => i + 1,
            Err(i) => i,
        };
        (0..count).map(|i| self.superpeers[(start + i) % len]).collect()
    }

    /// The id range `node` keeps metadata for: its own area plus those of
    /// the superpeers it backs up. `(node, node)` stands for the whole ring.
    pub fn responsible_area(&self, node: NodeId) -> (NodeId, NodeId) {
        let len = self.superpeers.len();
        if len <= self.backup_count {
            return (node, node);
        }
        let Some(index) = self
            .predecessor
            .and_then(|p| self.superpeers.binary_search(&p).ok())
        else {
            return (node, node);
        };
        let start = (index + len - self.backup_count) % len;
        (self.superpeers[start], node)
    }

    /// Every superpeer including this node, sorted.
    pub fn all_superpeers(&self) -> Vec<NodeId> {
        let mut all = self.superpeers.clone();
        if self.is_superpeer() {
            insert_sorted(&mut all, self.me);
        }
        all
    }
}

impl Display for OverlayState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "superpeer overlay:")?;
        for superpeer in self.all_superpeers() {
            if superpeer == self.me {
                write!(f, " [0x{superpeer:04X}]")?;
            } else {
                write!(f, " 0x{superpeer:04X}")?;
            }
        }
        write!(f, "; peers:")?;
        for peer in &self.peers {
            write!(f, " 0x{peer:04X}")?;
        }
        Ok(())
    }
}
