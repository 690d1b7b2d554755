use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::ops::Bound;

const MAX_LEVEL: usize = 32;
const LEVEL_P: f64 = 0.25;

/// Sentinel arena index meaning "no node".
const NIL: u32 = u32::MAX;
/// Sentinel arena index addressing the head tower.
const HEAD: u32 = u32::MAX - 1;

#[derive(Debug, Clone, Copy)]
struct Link {
    next: u32,
    /// Number of level-0 steps this link advances (rank distance to `next`;
    /// for links to `NIL`, the number of elements remaining to the tail).
    span: u32,
}

const EMPTY_LINK: Link = Link { next: NIL, span: 0 };

#[derive(Debug)]
struct Node<K, V> {
    key: K,
    value: V,
    links: Vec<Link>,
}

/// An indexed skip-list multiset of `(key, value)` pairs, ordered by
/// `(value, key)`.
///
/// Rank bookkeeping (span counts per link) makes range counting O(log N)
/// without walking the matched entries. Freed nodes are recycled through a
/// free list, so long-lived lists do not fragment the arena.
#[derive(Debug)]
pub struct RankedList<K, V> {
    nodes: Vec<Node<K, V>>,
    free: Vec<u32>,
    head: [Link; MAX_LEVEL],
    level: usize,
    len: usize,
    rng: SmallRng,
}

impl<K: Ord, V: PartialOrd> RankedList<K, V> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: [EMPTY_LINK; MAX_LEVEL],
            level: 1,
            len: 0,
            rng: SmallRng::from_entropy(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Add one `(key, value)` entry. Duplicate values are allowed; duplicate
    /// `(key, value)` pairs are the caller's responsibility.
    pub fn insert(&mut self, key: K, value: V) {
        let mut update = [HEAD; MAX_LEVEL];
        let mut rank = [0usize; MAX_LEVEL];

        let mut x = HEAD;
        for lvl in (0..self.level).rev() {
            rank[lvl] = if lvl + 1 == self.level { 0 } else { rank[lvl + 1] };
            loop {
                let Link { next, span } = self.link(x, lvl);
                if next != NIL && self.precedes(next, &value, &key) {
                    rank[lvl] += span as usize;
                    x = next;
                } else {
                    break;
                }
            }
            update[lvl] = x;
        }

        let height = self.random_height();
        if height > self.level {
            for lvl in self.level..height {
                rank[lvl] = 0;
                update[lvl] = HEAD;
                self.head[lvl].span = self.len as u32;
            }
            self.level = height;
        }

        let idx = self.alloc(key, value, height);
        for lvl in 0..height {
            let prev = update[lvl];
            let Link { next, span } = self.link(prev, lvl);
            let skipped = (rank[0] - rank[lvl]) as u32;
            self.set_link(idx, lvl, Link { next, span: span - skipped });
            self.set_link(
                prev,
                lvl,
                Link {
                    next: idx,
                    span: skipped + 1,
                },
            );
        }
        for lvl in height..self.level {
            let Link { next, span } = self.link(update[lvl], lvl);
            self.set_link(update[lvl], lvl, Link { next, span: span + 1 });
        }
        self.len += 1;
    }

    /// Remove the entry with exactly this key and value. Returns whether an
    /// entry was removed.
    pub fn remove(&mut self, key: &K, value: &V) -> bool {
        let mut update = [HEAD; MAX_LEVEL];

        let mut x = HEAD;
        for lvl in (0..self.level).rev() {
            loop {
                let Link { next, .. } = self.link(x, lvl);
                if next != NIL && self.precedes(next, value, key) {
                    x = next;
                } else {
                    break;
                }
            }
            update[lvl] = x;
        }

        let target = self.link(x, 0).next;
        if target == NIL {
            return false;
        }
        {
            let n = &self.nodes[target as usize];
            if n.value != *value || n.key != *key {
                return false;
            }
        }

        for lvl in 0..self.level {
            let Link { next, span } = self.link(update[lvl], lvl);
            if next == target {
                let t = self.link(target, lvl);
                self.set_link(
                    update[lvl],
                    lvl,
                    Link {
                        next: t.next,
                        span: span + t.span - 1,
                    },
                );
            } else {
                self.set_link(update[lvl], lvl, Link { next, span: span - 1 });
            }
        }
        while self.level > 1 && self.head[self.level - 1].next == NIL {
            self.level -= 1;
        }
        self.len -= 1;
        self.free.push(target);
        true
    }

    /// Move one entry from `old_value` to `new_value` under a single mutable
    /// borrow; no intermediate state is observable. Returns `false` (and
    /// changes nothing) when the `(key, old_value)` pair is absent.
    pub fn update(&mut self, key: K, old_value: &V, new_value: V) -> bool {
        if !self.remove(&key, old_value) {
            return false;
        }
        self.insert(key, new_value);
        true
    }

    /// Whether an entry with exactly this key and value exists.
    pub fn contains(&self, key: &K, value: &V) -> bool {
        let mut x = HEAD;
        for lvl in (0..self.level).rev() {
            loop {
                let Link { next, .. } = self.link(x, lvl);
                if next != NIL && self.precedes(next, value, key) {
                    x = next;
                } else {
                    break;
                }
            }
        }
        let target = self.link(x, 0).next;
        if target == NIL {
            return false;
        }
        let n = &self.nodes[target as usize];
        n.value == *value && n.key == *key
    }

    /// Number of entries whose value lies within the bounds.
    pub fn count_in_range(&self, lo: Bound<V>, hi: Bound<V>) -> usize {
        let below = match &lo {
            Bound::Unbounded => 0,
            Bound::Included(v) => self.count_until(v, false),
            Bound::Excluded(v) => self.count_until(v, true),
        };
        let upto = match &hi {
            Bound::Unbounded => self.len,
            Bound::Included(v) => self.count_until(v, true),
            Bound::Excluded(v) => self.count_until(v, false),
        };
        upto.saturating_sub(below)
    }

    /// Visit every entry whose value lies within the bounds, in ascending
    /// `(value, key)` order. `visit` receives the entry's zero-based rank in
    /// the whole list.
    pub fn for_each_in_range<F>(&self, lo: Bound<V>, hi: Bound<V>, mut visit: F)
    where
        F: FnMut(usize, &K, &V),
    {
        let mut x = HEAD;
        let mut rank = 0usize;
        for lvl in (0..self.level).rev() {
            loop {
                let Link { next, span } = self.link(x, lvl);
                if next == NIL {
                    break;
                }
                let nv = &self.nodes[next as usize].value;
                let advance = match &lo {
                    Bound::Unbounded => false,
                    Bound::Included(v) => nv < v,
                    Bound::Excluded(v) => nv <= v,
                };
                if advance {
                    rank += span as usize;
                    x = next;
                } else {
                    break;
                }
            }
        }

        let mut cur = self.link(x, 0).next;
        while cur != NIL {
            let n = &self.nodes[cur as usize];
            let in_range = match &hi {
                Bound::Unbounded => true,
                Bound::Included(v) => n.value <= *v,
                Bound::Excluded(v) => n.value < *v,
            };
            if !in_range {
                break;
            }
            visit(rank, &n.key, &n.value);
            rank += 1;
            cur = n.links[0].next;
        }
    }

    /// Number of entries with value strictly below `value`, or at most
    /// `value` when `inclusive`.
    fn count_until(&self, value: &V, inclusive: bool) -> usize {
        let mut x = HEAD;
        let mut r = 0usize;
        for lvl in (0..self.level).rev() {
            loop {
                let Link { next, span } = self.link(x, lvl);
                if next == NIL {
                    break;
                }
                let nv = &self.nodes[next as usize].value;
                let advance = if inclusive { nv <= value } else { nv < value };
                if advance {
                    r += span as usize;
                    x = next;
                } else {
                    break;
                }
            }
        }
        r
    }

    /// Whether the node at `idx` orders strictly before `(value, key)`.
    fn precedes(&self, idx: u32, value: &V, key: &K) -> bool {
        let n = &self.nodes[idx as usize];
        if n.value < *value {
            return true;
        }
        if *value < n.value {
            return false;
        }
        n.key < *key
    }

    fn link(&self, at: u32, lvl: usize) -> Link {
        if at == HEAD {
            self.head[lvl]
        } else {
            self.nodes[at as usize].links[lvl]
        }
    }

    fn set_link(&mut self, at: u32, lvl: usize, link: Link) {
        if at == HEAD {
            self.head[lvl] = link;
        } else {
            self.nodes[at as usize].links[lvl] = link;
        }
    }

    fn alloc(&mut self, key: K, value: V, height: usize) -> u32 {
        let links = vec![EMPTY_LINK; height];
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx as usize] = Node { key, value, links };
                idx
            }
            None => {
                self.nodes.push(Node { key, value, links });
                (self.nodes.len() - 1) as u32
            }
        }
    }

    fn random_height(&mut self) -> usize {
        let mut h = 1;
        while h < MAX_LEVEL && self.rng.gen::<f64>() < LEVEL_P {
            h += 1;
        }
        h
    }
}

impl<K: Ord, V: PartialOrd> Default for RankedList<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    fn collect(list: &RankedList<u32, i64>) -> Vec<(usize, u32, i64)> {
        let mut out = Vec::new();
        list.for_each_in_range(Bound::Unbounded, Bound::Unbounded, |rank, k, v| {
            out.push((rank, *k, *v));
        });
        out
    }

    #[test]
    fn insert_orders_by_value() {
        let mut list = RankedList::new();
        list.insert(1u32, 30i64);
        list.insert(2, 10);
        list.insert(3, 20);

        let entries = collect(&list);
        assert_eq!(entries, vec![(0, 2, 10), (1, 3, 20), (2, 1, 30)]);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn value_ties_order_by_key() {
        let mut list = RankedList::new();
        list.insert(5u32, 7i64);
        list.insert(2, 7);
        list.insert(9, 7);

        let entries = collect(&list);
        assert_eq!(entries, vec![(0, 2, 7), (1, 5, 7), (2, 9, 7)]);
    }

    #[test]
    fn remove_exact_pair_only() {
        let mut list = RankedList::new();
        list.insert(1u32, 5i64);
        list.insert(2, 5);

        assert!(!list.remove(&1, &6));
        assert!(!list.remove(&3, &5));
        assert!(list.remove(&1, &5));
        assert!(!list.remove(&1, &5));
        assert_eq!(collect(&list), vec![(0, 2, 5)]);
    }

    #[test]
    fn update_moves_entry() {
        let mut list = RankedList::new();
        list.insert(1u32, 10i64);
        list.insert(2, 20);

        assert!(list.update(1, &10, 30));
        assert!(!list.update(1, &10, 40));
        assert_eq!(collect(&list), vec![(0, 2, 20), (1, 1, 30)]);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn count_in_range_respects_bounds() {
        let mut list = RankedList::new();
        for (k, v) in [(1u32, 10i64), (2, 20), (3, 20), (4, 30)] {
            list.insert(k, v);
        }

        assert_eq!(
            list.count_in_range(Bound::Included(10), Bound::Included(30)),
            4
        );
        assert_eq!(
            list.count_in_range(Bound::Excluded(10), Bound::Excluded(30)),
            2
        );
        assert_eq!(
            list.count_in_range(Bound::Included(20), Bound::Included(20)),
            2
        );
        assert_eq!(
            list.count_in_range(Bound::Excluded(20), Bound::Excluded(20)),
            0
        );
        // inverted range counts nothing
        assert_eq!(
            list.count_in_range(Bound::Included(30), Bound::Included(10)),
            0
        );
        assert_eq!(list.count_in_range(Bound::Unbounded, Bound::Unbounded), 4);
    }

    #[test]
    fn for_each_in_range_streams_matches() {
        let mut list = RankedList::new();
        for (k, v) in [(1u32, 10i64), (2, 20), (3, 30), (4, 40)] {
            list.insert(k, v);
        }

        let mut seen = Vec::new();
        list.for_each_in_range(Bound::Excluded(10), Bound::Included(30), |rank, k, v| {
            seen.push((rank, *k, *v));
        });
        assert_eq!(seen, vec![(1, 2, 20), (2, 3, 30)]);
    }

    #[test]
    fn contains_checks_exact_pair() {
        let mut list = RankedList::new();
        list.insert(1u32, 10i64);
        assert!(list.contains(&1, &10));
        assert!(!list.contains(&1, &11));
        assert!(!list.contains(&2, &10));
    }

    #[test]
    fn arena_recycles_freed_nodes() {
        let mut list = RankedList::new();
        for k in 0..64u32 {
            list.insert(k, k as i64);
        }
        for k in 0..64u32 {
            assert!(list.remove(&k, &(k as i64)));
        }
        assert!(list.is_empty());
        for k in 0..64u32 {
            list.insert(k, -(k as i64));
        }
        assert_eq!(list.len(), 64);
        assert_eq!(
            list.count_in_range(Bound::Included(-63), Bound::Included(0)),
            64
        );
    }

    #[test]
    fn randomized_against_sorted_vec() {
        let mut rng = SmallRng::seed_from_u64(0xA01);
        let mut list = RankedList::new();
        let mut oracle: Vec<(i64, u32)> = Vec::new();

        for k in 0..500u32 {
            let v = rng.gen_range(-100i64..100);
            list.insert(k, v);
            oracle.push((v, k));
        }
        // remove a random half
        let mut keys: Vec<u32> = (0..500).collect();
        keys.shuffle(&mut rng);
        for &k in keys.iter().take(250) {
            let v = oracle
                .iter()
                .find(|(_, key)| *key == k)
                .map(|(v, _)| *v)
                .unwrap();
            assert!(list.remove(&k, &v));
            oracle.retain(|(_, key)| *key != k);
        }
        oracle.sort_unstable();
        assert_eq!(list.len(), oracle.len());

        for _ in 0..200 {
            let lo = rng.gen_range(-110i64..110);
            let hi = rng.gen_range(-110i64..110);
            let expected = oracle.iter().filter(|(v, _)| lo < *v && *v < hi).count();
            assert_eq!(
                list.count_in_range(Bound::Excluded(lo), Bound::Excluded(hi)),
                expected,
                "count mismatch for ({lo}, {hi})"
            );

            let mut walked = Vec::new();
            list.for_each_in_range(Bound::Excluded(lo), Bound::Excluded(hi), |_, k, v| {
                walked.push((*v, *k));
            });
            let expected_walk: Vec<(i64, u32)> = oracle
                .iter()
                .filter(|(v, _)| lo < *v && *v < hi)
                .copied()
                .collect();
            assert_eq!(walked, expected_walk, "enumeration mismatch for ({lo}, {hi})");
        }
    }

    #[test]
    fn ranks_are_absolute_positions() {
        let mut list = RankedList::new();
        for (k, v) in [(1u32, 5i64), (2, 15), (3, 25), (4, 35)] {
            list.insert(k, v);
        }

        let mut ranks = Vec::new();
        list.for_each_in_range(Bound::Included(15), Bound::Unbounded, |rank, _, _| {
            ranks.push(rank);
        });
        assert_eq!(ranks, vec![1, 2, 3]);
    }
}
