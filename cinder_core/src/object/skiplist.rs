//! Probabilistic ordered structure backing large sorted sets. Nodes are kept
//! in an index arena rather than behind raw pointers; `NIL` marks the end of
//! a level's chain. Ordering is by (score, member) so equal scores stay in
//! lexicographic member order.

use hashbrown::HashMap;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::cmp::Ordering;

const MAX_LEVEL: usize = 32;
const LEVEL_P: f64 = 0.25;
const NIL: usize = usize::max_value();

struct Node {
    member: Vec<u8>,
    score: f64,
    forward: Vec<usize>,
}

pub struct SkipList {
    nodes: Vec<Node>,
    free: Vec<usize>,
    head: [usize; MAX_LEVEL],
    level: usize,
    len: usize,
    rng: SmallRng,
}

#[inline]
fn key_cmp(a_score: f64, a_member: &[u8], b_score: f64, b_member: &[u8]) -> Ordering {
    match a_score.partial_cmp(&b_score) {
        Some(Ordering::Equal) | None => a_member.cmp(b_member),
        Some(other) => other,
    }
}

impl SkipList {
    pub fn new() -> SkipList {
        SkipList {
            nodes: Vec::new(),
            free: Vec::new(),
            head: [NIL; MAX_LEVEL],
            level: 1,
            len: 0,
            rng: SmallRng::from_entropy(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    fn random_level(&mut self) -> usize {
        let mut level = 1;
        while level < MAX_LEVEL && self.rng.gen::<f64>() < LEVEL_P {
            level += 1;
        }
        level
    }

    /// Fills `update` with, per level, the index of the last node ordered
    /// before (score, member); NIL stands for the head.
    fn find_predecessors(&self, score: f64, member: &[u8], update: &mut [usize; MAX_LEVEL]) {
        let mut prev = NIL;
        for lvl in (0..self.level).rev() {
            let mut next = match prev {
                NIL => self.head[lvl],
                p => self.nodes[p].forward[lvl],
            };
            while next != NIL {
                let node = &self.nodes[next];
                if key_cmp(node.score, &node.member, score, member) == Ordering::Less {
                    prev = next;
                    next = node.forward[lvl];
                } else {
                    break;
                }
            }
            update[lvl] = prev;
        }
    }

    pub fn insert(&mut self, member: Vec<u8>, score: f64) {
        let mut update = [NIL; MAX_LEVEL];
        self.find_predecessors(score, &member, &mut update);

        let level = self.random_level();
        if level > self.level {
            for slot in update.iter_mut().take(level).skip(self.level) {
                *slot = NIL;
            }
            self.level = level;
        }

        let node = Node { member, score, forward: vec![NIL; level] };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };

        for lvl in 0..level {
            let next = match update[lvl] {
                NIL => self.head[lvl],
                p => self.nodes[p].forward[lvl],
            };
            self.nodes[idx].forward[lvl] = next;
            match update[lvl] {
                NIL => self.head[lvl] = idx,
                p => self.nodes[p].forward[lvl] = idx,
            }
        }
        self.len += 1;
    }

    pub fn remove(&mut self, member: &[u8], score: f64) -> bool {
        let mut update = [NIL; MAX_LEVEL];
        self.find_predecessors(score, member, &mut update);

        let target = match update[0] {
            NIL => self.head[0],
            p => self.nodes[p].forward[0],
        };
        if target == NIL {
            return false;
        }
        {
            let node = &self.nodes[target];
            if node.score != score || node.member != member {
                return false;
            }
        }

        for lvl in 0..self.level {
            let next = match update[lvl] {
                NIL => self.head[lvl],
                p => self.nodes[p].forward[lvl],
            };
            if next == target {
                let after = self.nodes[target].forward[lvl];
                match update[lvl] {
                    NIL => self.head[lvl] = after,
                    p => self.nodes[p].forward[lvl] = after,
                }
            }
        }
        while self.level > 1 && self.head[self.level - 1] == NIL {
            self.level -= 1;
        }

        self.free.push(target);
        self.len -= 1;
        true
    }

    pub fn iter(&self) -> SkipIter {
        SkipIter { list: self, next: self.head[0] }
    }
}

pub struct SkipIter<'a> {
    list: &'a SkipList,
    next: usize,
}

impl<'a> Iterator for SkipIter<'a> {
    type Item = (&'a [u8], f64);

    fn next(&mut self) -> Option<(&'a [u8], f64)> {
        if self.next == NIL {
            return None;
        }
        let node = &self.list.nodes[self.next];
        self.next = node.forward[0];
        Some((&node.member, node.score))
    }
}

/// The general sorted set encoding: a skiplist ordered by (score, member)
/// paired with a member-to-score table for O(1) score lookups.
pub struct SortedSet {
    list: SkipList,
    scores: HashMap<Vec<u8>, f64>,
}

impl SortedSet {
    pub fn new() -> SortedSet {
        SortedSet { list: SkipList::new(), scores: HashMap::new() }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    #[inline]
    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.scores.get(member).copied()
    }

    /// Inserts or updates a member. Returns true when the member is new.
    pub fn insert(&mut self, member: &[u8], score: f64) -> bool {
        match self.scores.get(member).copied() {
            Some(old) => {
                if old != score {
                    self.list.remove(member, old);
                    self.list.insert(member.to_vec(), score);
                    self.scores.insert(member.to_vec(), score);
                }
                false
            }
            None => {
                self.list.insert(member.to_vec(), score);
                self.scores.insert(member.to_vec(), score);
                true
            }
        }
    }

    pub fn remove(&mut self, member: &[u8]) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.list.remove(member, score);
                true
            }
            None => false,
        }
    }

    /// Iterates members in (score, member) order.
    pub fn iter(&self) -> SkipIter {
        self.list.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(set: &SortedSet) -> Vec<(Vec<u8>, f64)> {
        set.iter().map(|(m, s)| (m.to_vec(), s)).collect()
    }

    #[test]
    fn test_ordering_by_score_then_member() {
        let mut set = SortedSet::new();
        set.insert(b"b", 2.0);
        set.insert(b"a", 2.0);
        set.insert(b"c", 1.0);

        assert_eq!(
            members(&set),
            vec![(b"c".to_vec(), 1.0), (b"a".to_vec(), 2.0), (b"b".to_vec(), 2.0)]
        );
    }

    #[test]
    fn test_update_score_moves_member() {
        let mut set = SortedSet::new();
        assert!(set.insert(b"x", 1.0));
        assert!(set.insert(b"y", 2.0));
        assert!(!set.insert(b"x", 3.0));

        assert_eq!(set.len(), 2);
        assert_eq!(set.score(b"x"), Some(3.0));
        assert_eq!(members(&set), vec![(b"y".to_vec(), 2.0), (b"x".to_vec(), 3.0)]);
    }

    #[test]
    fn test_remove() {
        let mut set = SortedSet::new();
        set.insert(b"m", 5.0);
        assert!(set.remove(b"m"));
        assert!(!set.remove(b"m"));
        assert_eq!(set.len(), 0);
        assert_eq!(set.score(b"m"), None);
    }

    #[test]
    fn test_many_inserts_stay_sorted() {
        let mut set = SortedSet::new();
        for i in 0..500 {
            let member = format!("m{:03}", i);
            let score = f64::from((i * 7919) % 501);
            set.insert(member.as_bytes(), score);
        }
        assert_eq!(set.len(), 500);

        let collected = members(&set);
        for pair in collected.windows(2) {
            let ordering = key_cmp(pair[0].1, &pair[0].0, pair[1].1, &pair[1].0);
            assert_eq!(ordering, Ordering::Less);
        }
    }

    #[test]
    fn test_skiplist_remove_missing() {
        let mut list = SkipList::new();
        list.insert(b"a".to_vec(), 1.0);
        assert!(!list.remove(b"a", 2.0));
        assert!(!list.remove(b"b", 1.0));
        assert!(list.remove(b"a", 1.0));
        assert_eq!(list.len(), 0);
    }
}
