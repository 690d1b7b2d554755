use crate::error::AoiError;
use crate::group::{AoiGroup, CoverHint, RangeHint};
use aoispace_common::{AoiEvent, AoiKey, Coord};
use std::ops::Bound;

impl<K: AoiKey, P: Coord, const D: usize> AoiGroup<K, P, D> {
    /// Current position of an element.
    pub fn position(&self, key: &K) -> Option<[P; D]> {
        self.elements.get(key).map(|e| e.pos)
    }

    /// Current (clamped) watch range of an element.
    pub fn watch_range(&self, key: &K) -> Option<[P; D]> {
        self.elements.get(key).map(|e| e.watch_range)
    }

    /// Who currently sees this element, in ascending key order.
    pub fn watchers_of(&self, key: &K) -> Option<Vec<K>> {
        self.elements.get(key).map(|e| {
            let mut v: Vec<K> = e.related_watchers.iter().copied().collect();
            v.sort_unstable();
            v
        })
    }

    /// Whom this element currently sees, in ascending key order.
    pub fn makers_of(&self, key: &K) -> Option<Vec<K>> {
        self.elements.get(key).map(|e| {
            let mut v: Vec<K> = e.related_makers.iter().copied().collect();
            v.sort_unstable();
            v
        })
    }

    /// All makers strictly inside the open box `pos ± range`, except the keys
    /// in `excludes_sorted` (must be sorted ascending).
    pub fn makers_in_range(&self, pos: &[P; D], range: &[P; D], excludes_sorted: &[K]) -> Vec<K> {
        self.makers_in_range_with(pos, range, excludes_sorted, None)
    }

    /// All watchers whose observation box strictly contains `pos`, except the
    /// keys in `excludes_sorted` (must be sorted ascending).
    pub fn watchers_covering(&self, pos: &[P; D], excludes_sorted: &[K]) -> Vec<K> {
        self.watchers_covering_with(pos, excludes_sorted, None)
    }

    /// Deliver `event` to every watcher currently seeing `key`, in ascending
    /// key order, with `key` as the sender.
    pub fn broadcast_to_watchers(
        &mut self,
        key: &K,
        event: &AoiEvent<P, D>,
    ) -> Result<(), AoiError> {
        let watchers = self.watchers_of(key).ok_or(AoiError::KeyNotFound)?;
        for w in &watchers {
            self.emit(w, key, event);
        }
        Ok(())
    }

    /// Deliver `event` to every watcher whose box strictly contains `pos`,
    /// with `sender` as the sender. The sender key does not need to belong to
    /// the group.
    pub fn broadcast_to_watchers_at(&mut self, pos: &[P; D], sender: &K, event: &AoiEvent<P, D>) {
        let watchers = self.watchers_covering_with(pos, &[], None);
        for w in &watchers {
            self.emit(w, sender, event);
        }
    }

    /// Pick the maker-list axis with the fewest candidates in the open box.
    /// Ties resolve to the lowest axis.
    pub(crate) fn makers_range_hint(&self, pos: &[P; D], range: &[P; D]) -> RangeHint {
        let mut hint = RangeHint {
            axis: 0,
            complexity: usize::MAX,
        };
        for i in 0..D {
            let count = self.axes[i].makers.count_in_range(
                Bound::Excluded(pos[i] - range[i]),
                Bound::Excluded(pos[i] + range[i]),
            );
            if count < hint.complexity {
                hint = RangeHint {
                    axis: i,
                    complexity: count,
                };
            }
        }
        hint
    }

    /// Pick the cheapest watcher-edge probe for `pos`: per axis, either the
    /// lower-edge list over `(pos - 2·max, pos)` or the upper-edge list over
    /// `(pos, pos + 2·max)`. Each window alone over-approximates the watchers
    /// covering `pos`, since a covering watcher's lower edge lies above
    /// `pos - 2·range` and its range never exceeds the max.
    pub(crate) fn watchers_cover_hint(&self, pos: &[P; D]) -> CoverHint {
        let mut hint = CoverHint {
            axis: 0,
            use_lower: true,
            complexity: usize::MAX,
        };
        for i in 0..D {
            let span = self.doubled_max(i);
            let count = self.axes[i]
                .watcher_lower
                .count_in_range(Bound::Excluded(pos[i] - span), Bound::Excluded(pos[i]));
            if count < hint.complexity {
                hint = CoverHint {
                    axis: i,
                    use_lower: true,
                    complexity: count,
                };
            }
            let count = self.axes[i]
                .watcher_upper
                .count_in_range(Bound::Excluded(pos[i]), Bound::Excluded(pos[i] + span));
            if count < hint.complexity {
                hint = CoverHint {
                    axis: i,
                    use_lower: false,
                    complexity: count,
                };
            }
        }
        hint
    }

    pub(crate) fn makers_in_range_with(
        &self,
        pos: &[P; D],
        range: &[P; D],
        excludes_sorted: &[K],
        hint: Option<&RangeHint>,
    ) -> Vec<K> {
        debug_assert!(excludes_sorted.windows(2).all(|w| w[0] <= w[1]));
        let computed;
        let hint = match hint {
            Some(h) => h,
            None => {
                computed = self.makers_range_hint(pos, range);
                &computed
            }
        };

        let mut makers = Vec::new();
        let i = hint.axis;
        let elements = &self.elements;
        self.axes[i].makers.for_each_in_range(
            Bound::Excluded(pos[i] - range[i]),
            Bound::Excluded(pos[i] + range[i]),
            |_, k, _| {
                if excludes_sorted.binary_search(k).is_ok() {
                    return;
                }
                let Some(e) = elements.get(k) else { return };
                for d in 0..D {
                    let lo = pos[d] - range[d];
                    let hi = pos[d] + range[d];
                    if !(lo < e.pos[d]) || !(e.pos[d] < hi) {
                        return;
                    }
                }
                makers.push(*k);
            },
        );
        makers
    }

    pub(crate) fn watchers_covering_with(
        &self,
        pos: &[P; D],
        excludes_sorted: &[K],
        hint: Option<&CoverHint>,
    ) -> Vec<K> {
        debug_assert!(excludes_sorted.windows(2).all(|w| w[0] <= w[1]));
        let computed;
        let hint = match hint {
            Some(h) => h,
            None => {
                computed = self.watchers_cover_hint(pos);
                &computed
            }
        };

        let mut watchers = Vec::new();
        let i = hint.axis;
        let span = self.doubled_max(i);
        let (list, lo, hi) = if hint.use_lower {
            (&self.axes[i].watcher_lower, pos[i] - span, pos[i])
        } else {
            (&self.axes[i].watcher_upper, pos[i], pos[i] + span)
        };
        let elements = &self.elements;
        list.for_each_in_range(Bound::Excluded(lo), Bound::Excluded(hi), |_, k, _| {
            if excludes_sorted.binary_search(k).is_ok() {
                return;
            }
            let Some(e) = elements.get(k) else { return };
            if e.box_contains(pos) {
                watchers.push(*k);
            }
        });
        watchers
    }

    /// Re-derive every element's relations through the public queries and
    /// verify the per-axis index membership and cardinality invariants.
    /// Intended for tests and debugging; O(N · query cost).
    pub fn check_consistency(&self) -> bool {
        let mut watcher_count = 0usize;
        let mut maker_count = 0usize;

        for (key, e) in &self.elements {
            if e.related_watchers.contains(key) || e.related_makers.contains(key) {
                return false;
            }

            if e.role.is_watcher() {
                watcher_count += 1;
                for i in 0..D {
                    if !self.axes[i].watcher_lower.contains(key, &e.lower(i)) {
                        return false;
                    }
                    if !self.axes[i].watcher_upper.contains(key, &e.upper(i)) {
                        return false;
                    }
                }
                let mut derived =
                    self.makers_in_range(&e.pos, &e.watch_range, std::slice::from_ref(key));
                derived.sort_unstable();
                let mut stored: Vec<K> = e.related_makers.iter().copied().collect();
                stored.sort_unstable();
                if derived != stored {
                    return false;
                }
                for m in &e.related_makers {
                    match self.elements.get(m) {
                        Some(me) if me.related_watchers.contains(key) => {}
                        _ => return false,
                    }
                }
            } else if !e.related_makers.is_empty() {
                return false;
            }

            if e.role.is_maker() {
                maker_count += 1;
                for i in 0..D {
                    if !self.axes[i].makers.contains(key, &e.pos[i]) {
                        return false;
                    }
                }
                let mut derived = self.watchers_covering(&e.pos, std::slice::from_ref(key));
                derived.sort_unstable();
                let mut stored: Vec<K> = e.related_watchers.iter().copied().collect();
                stored.sort_unstable();
                if derived != stored {
                    return false;
                }
                for w in &e.related_watchers {
                    match self.elements.get(w) {
                        Some(we) if we.related_makers.contains(key) => {}
                        _ => return false,
                    }
                }
            } else if !e.related_watchers.is_empty() {
                return false;
            }
        }

        for i in 0..D {
            if self.axes[i].makers.len() != maker_count {
                return false;
            }
            if self.axes[i].watcher_lower.len() != watcher_count {
                return false;
            }
            if self.axes[i].watcher_upper.len() != watcher_count {
                return false;
            }
        }
        true
    }
}
