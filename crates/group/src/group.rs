use crate::diff::diff_sorted_keys;
use crate::element::{Axis, Element};
use crate::error::AoiError;
use aoispace_common::{AoiEvent, AoiKey, Coord, EventKind, WatchRole};
use std::collections::HashMap;
use std::ops::Bound;

/// Callback slot invoked inline for every emitted event. The references are
/// only valid for the duration of the call; the callback cannot re-enter the
/// engine because it holds no reference to it.
pub type EventCallback<K, P, const D: usize> = Box<dyn FnMut(&K, &K, &AoiEvent<P, D>)>;

/// Which maintenance strategy a move runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MoveStrategy {
    Recompute,
    Shift,
}

/// Pivot choice for a maker range query: the axis with the fewest candidates.
pub(crate) struct RangeHint {
    pub(crate) axis: usize,
    pub(crate) complexity: usize,
}

/// Pivot choice for a watcher-edge query: axis plus which edge list to walk.
pub(crate) struct CoverHint {
    pub(crate) axis: usize,
    pub(crate) use_lower: bool,
    pub(crate) complexity: usize,
}

/// Per-slab pivot choices for a shifting watcher.
struct WatcherShiftHint<const D: usize> {
    leave_axis: [usize; D],
    enter_axis: [usize; D],
    complexity: usize,
}

/// Per-slab pivot choices for a shifting maker.
struct MakerShiftHint<const D: usize> {
    leave_axis: [usize; D],
    leave_use_lower: [bool; D],
    enter_axis: [usize; D],
    enter_use_lower: [bool; D],
    complexity: usize,
}

/// The area-of-interest group: a population of keyed elements in a
/// `D`-dimensional space, each optionally watching an axis-aligned open box
/// around itself and/or being watchable by others.
///
/// All operations run synchronously on the caller's thread and invoke the
/// event callback inline before returning. Within one operation, LEAVE events
/// come first, then MOVE (maker moves only), then ENTER.
pub struct AoiGroup<K, P, const D: usize> {
    pub(crate) max_watch_range: [P; D],
    pub(crate) elements: HashMap<K, Element<K, P, D>>,
    pub(crate) axes: [Axis<K, P>; D],
    pub(crate) callback: Option<EventCallback<K, P, D>>,
    pub(crate) force_strategy: Option<MoveStrategy>,
}

impl<K: AoiKey, P: Coord, const D: usize> AoiGroup<K, P, D> {
    /// Create an empty group. Every component of `max_watch_range` must be
    /// strictly positive; watch ranges are clamped to it on assignment.
    pub fn new(max_watch_range: [P; D]) -> Self {
        for i in 0..D {
            assert!(
                P::default() < max_watch_range[i],
                "max_watch_range must be strictly positive in every dimension"
            );
        }
        Self {
            max_watch_range,
            elements: HashMap::new(),
            axes: std::array::from_fn(|_| Axis::new()),
            callback: None,
            force_strategy: None,
        }
    }

    /// Install the event callback. Replaces any previous one.
    pub fn set_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&K, &K, &AoiEvent<P, D>) + 'static,
    {
        self.callback = Some(Box::new(callback));
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.elements.contains_key(key)
    }

    /// Add an element. Emits one ENTER per relation the new element
    /// establishes: as a maker, to every watcher covering its position; as a
    /// watcher, to itself for every maker inside its box.
    pub fn enter(
        &mut self,
        key: K,
        pos: [P; D],
        role: WatchRole,
        watch_range: [P; D],
    ) -> Result<(), AoiError> {
        if self.elements.contains_key(&key) {
            return Err(AoiError::KeyExists);
        }
        let watch_range = self.clamped_range(watch_range);
        tracing::debug!(?key, ?role, "element enters the group");
        self.elements
            .insert(key, Element::new(role, pos, watch_range));
        if role.is_maker() {
            self.attach_maker(&key);
        }
        if role.is_watcher() {
            self.attach_watcher(&key);
        }
        Ok(())
    }

    /// Remove an element. Emits one LEAVE per watcher that saw it (maker role
    /// only); removing a watcher is silent.
    pub fn leave(&mut self, key: &K) -> Result<(), AoiError> {
        let role = self.elements.get(key).ok_or(AoiError::KeyNotFound)?.role;
        tracing::debug!(?key, "element leaves the group");
        if role.is_maker() {
            self.shed_maker(key);
        }
        if role.is_watcher() {
            self.shed_watcher(key);
        }
        self.elements.remove(key);
        Ok(())
    }

    /// Move an element to an absolute position. A move to the current
    /// position is a no-op. Emits ENTER/LEAVE for relations that change, and
    /// MOVE to kept watchers when the mover is a maker; a moving watcher
    /// never emits MOVE.
    pub fn move_to(&mut self, key: &K, pos: [P; D]) -> Result<(), AoiError> {
        let element = self.elements.get_mut(key).ok_or(AoiError::KeyNotFound)?;
        if element.pos == pos {
            return Ok(());
        }
        let old_pos = element.pos;
        let role = element.role;
        element.pos = pos;
        tracing::trace!(?key, from = ?old_pos, to = ?pos, "element moves");
        if role.is_maker() {
            self.move_maker(key, &old_pos);
        }
        if role.is_watcher() {
            self.move_watcher(key, &old_pos);
        }
        Ok(())
    }

    /// Move an element by a relative delta.
    pub fn move_by(&mut self, key: &K, delta: [P; D]) -> Result<(), AoiError> {
        let element = self.elements.get(key).ok_or(AoiError::KeyNotFound)?;
        let pos = std::array::from_fn(|i| element.pos[i] + delta[i]);
        self.move_to(key, pos)
    }

    /// Change the element's role bits, inserting/removing it from the
    /// per-axis indexes and recomputing relations for each bit that flips.
    pub fn change_watch_role(&mut self, key: &K, role: WatchRole) -> Result<(), AoiError> {
        let element = self.elements.get_mut(key).ok_or(AoiError::KeyNotFound)?;
        let old_role = element.role;
        element.role = role;
        if old_role == role {
            return Ok(());
        }
        tracing::debug!(?key, ?old_role, ?role, "watch role changes");
        if old_role.is_maker() && !role.is_maker() {
            self.shed_maker(key);
        }
        if !old_role.is_maker() && role.is_maker() {
            self.attach_maker(key);
        }
        if old_role.is_watcher() && !role.is_watcher() {
            self.shed_watcher(key);
        }
        if !old_role.is_watcher() && role.is_watcher() {
            self.attach_watcher(key);
        }
        Ok(())
    }

    /// Change the element's watch range (clamped per dimension). For a
    /// watcher this re-derives its visible makers as if it had moved in
    /// place; ENTER/LEAVE only, never MOVE.
    pub fn change_watch_range(&mut self, key: &K, watch_range: [P; D]) -> Result<(), AoiError> {
        let watch_range = self.clamped_range(watch_range);
        let element = self.elements.get_mut(key).ok_or(AoiError::KeyNotFound)?;
        if element.watch_range == watch_range {
            return Ok(());
        }
        let old_pos = element.pos;
        let old_range = element.watch_range;
        let is_watcher = element.role.is_watcher();
        element.watch_range = watch_range;
        if is_watcher {
            self.update_watcher(key, &old_pos, &old_range, None);
        }
        Ok(())
    }

    pub(crate) fn emit(&mut self, receiver: &K, sender: &K, event: &AoiEvent<P, D>) {
        if let Some(cb) = self.callback.as_mut() {
            cb(receiver, sender, event);
        }
    }

    pub(crate) fn doubled_max(&self, axis: usize) -> P {
        self.max_watch_range[axis] + self.max_watch_range[axis]
    }

    fn clamped_range(&self, watch_range: [P; D]) -> [P; D] {
        let zero = P::default();
        std::array::from_fn(|i| {
            let r = watch_range[i];
            if r < zero {
                zero
            } else if self.max_watch_range[i] < r {
                self.max_watch_range[i]
            } else {
                r
            }
        })
    }

    /// Register the element in the maker indexes, seed its watcher relations,
    /// and announce it to every watcher covering its position.
    fn attach_maker(&mut self, key: &K) {
        let pos = match self.elements.get(key) {
            Some(e) => e.pos,
            None => return,
        };
        for i in 0..D {
            self.axes[i].makers.insert(*key, pos[i]);
        }

        let watchers = self.watchers_covering_with(&pos, std::slice::from_ref(key), None);
        for w in &watchers {
            if let Some(we) = self.elements.get_mut(w) {
                we.related_makers.insert(*key);
            }
        }
        if let Some(e) = self.elements.get_mut(key) {
            e.related_watchers.extend(watchers.iter().copied());
        }

        if !watchers.is_empty() {
            let event = AoiEvent::enter(pos);
            for w in &watchers {
                self.emit(w, key, &event);
            }
        }
    }

    /// Register the element in the watcher-edge indexes, seed its maker
    /// relations, and tell it about every maker already inside its box.
    fn attach_watcher(&mut self, key: &K) {
        let (pos, range) = match self.elements.get(key) {
            Some(e) => (e.pos, e.watch_range),
            None => return,
        };
        for i in 0..D {
            self.axes[i].watcher_lower.insert(*key, pos[i] - range[i]);
            self.axes[i].watcher_upper.insert(*key, pos[i] + range[i]);
        }

        let makers = self.makers_in_range_with(&pos, &range, std::slice::from_ref(key), None);
        for m in &makers {
            if let Some(me) = self.elements.get_mut(m) {
                me.related_watchers.insert(*key);
            }
        }
        if let Some(e) = self.elements.get_mut(key) {
            e.related_makers.extend(makers.iter().copied());
        }

        for m in &makers {
            let mpos = match self.elements.get(m) {
                Some(me) => me.pos,
                None => continue,
            };
            let event = AoiEvent::enter(mpos);
            self.emit(key, m, &event);
        }
    }

    /// Drop the maker role: clear the maker indexes and reciprocal relations,
    /// then emit LEAVE to every watcher that saw the element, in key order.
    fn shed_maker(&mut self, key: &K) {
        let (pos, watcher_set) = match self.elements.get_mut(key) {
            Some(e) => (e.pos, std::mem::take(&mut e.related_watchers)),
            None => return,
        };
        for i in 0..D {
            self.axes[i].makers.remove(key, &pos[i]);
        }

        let mut watchers: Vec<K> = watcher_set.into_iter().collect();
        watchers.sort_unstable();
        for w in &watchers {
            if let Some(we) = self.elements.get_mut(w) {
                we.related_makers.remove(key);
            }
        }

        if !watchers.is_empty() {
            let event = AoiEvent::leave(pos);
            for w in &watchers {
                self.emit(w, key, &event);
            }
        }
    }

    /// Drop the watcher role: clear the edge indexes and reciprocal
    /// relations. Emits nothing.
    fn shed_watcher(&mut self, key: &K) {
        let (pos, range, makers) = match self.elements.get_mut(key) {
            Some(e) => (e.pos, e.watch_range, std::mem::take(&mut e.related_makers)),
            None => return,
        };
        for i in 0..D {
            self.axes[i].watcher_lower.remove(key, &(pos[i] - range[i]));
            self.axes[i].watcher_upper.remove(key, &(pos[i] + range[i]));
        }
        for m in makers {
            if let Some(me) = self.elements.get_mut(&m) {
                me.related_watchers.remove(key);
            }
        }
    }

    fn move_watcher(&mut self, key: &K, old_pos: &[P; D]) {
        let (new_pos, range) = match self.elements.get(key) {
            Some(e) => (e.pos, e.watch_range),
            None => return,
        };
        // Shift requires old and new boxes to overlap on every axis.
        for i in 0..D {
            let step = abs_diff(new_pos[i], old_pos[i]);
            if !(step < range[i] + range[i]) {
                self.update_watcher(key, old_pos, &range, None);
                return;
            }
        }

        let recompute = self.makers_range_hint(&new_pos, &range);
        let shift = self.watcher_shift_hint(&new_pos, old_pos, &range);
        let strategy = match self.force_strategy {
            Some(s) => s,
            None if recompute.complexity <= shift.complexity => MoveStrategy::Recompute,
            None => MoveStrategy::Shift,
        };
        tracing::trace!(
            ?key,
            recompute = recompute.complexity,
            shift = shift.complexity,
            ?strategy,
            "watcher move"
        );
        match strategy {
            MoveStrategy::Recompute => self.update_watcher(key, old_pos, &range, Some(&recompute)),
            MoveStrategy::Shift => self.shift_watcher(key, old_pos, &shift),
        }
    }

    fn move_maker(&mut self, key: &K, old_pos: &[P; D]) {
        let new_pos = match self.elements.get(key) {
            Some(e) => e.pos,
            None => return,
        };
        // A watcher box is at most max-wide on each side, so boxes further
        // apart than twice the max cannot overlap.
        for i in 0..D {
            let step = abs_diff(new_pos[i], old_pos[i]);
            if !(step < self.doubled_max(i)) {
                self.update_maker(key, old_pos, None);
                return;
            }
        }

        let recompute = self.watchers_cover_hint(&new_pos);
        let shift = self.maker_shift_hint(&new_pos, old_pos);
        let strategy = match self.force_strategy {
            Some(s) => s,
            None if recompute.complexity <= shift.complexity => MoveStrategy::Recompute,
            None => MoveStrategy::Shift,
        };
        tracing::trace!(
            ?key,
            recompute = recompute.complexity,
            shift = shift.complexity,
            ?strategy,
            "maker move"
        );
        match strategy {
            MoveStrategy::Recompute => self.update_maker(key, old_pos, Some(&recompute)),
            MoveStrategy::Shift => self.shift_maker(key, old_pos, &shift),
        }
    }

    /// Recompute path for a watcher whose position or range changed: query
    /// the full new box, diff against the stored relations, apply and emit.
    fn update_watcher(
        &mut self,
        key: &K,
        old_pos: &[P; D],
        old_range: &[P; D],
        hint: Option<&RangeHint>,
    ) {
        let (new_pos, new_range) = match self.elements.get(key) {
            Some(e) => (e.pos, e.watch_range),
            None => return,
        };
        for i in 0..D {
            self.axes[i].watcher_lower.update(
                *key,
                &(old_pos[i] - old_range[i]),
                new_pos[i] - new_range[i],
            );
            self.axes[i].watcher_upper.update(
                *key,
                &(old_pos[i] + old_range[i]),
                new_pos[i] + new_range[i],
            );
        }

        let mut new_makers =
            self.makers_in_range_with(&new_pos, &new_range, std::slice::from_ref(key), hint);
        new_makers.sort_unstable();
        let mut old_makers: Vec<K> = match self.elements.get(key) {
            Some(e) => e.related_makers.iter().copied().collect(),
            None => return,
        };
        old_makers.sort_unstable();

        let (leaves, _keeps, enters) = diff_sorted_keys(&old_makers, &new_makers);

        if let Some(e) = self.elements.get_mut(key) {
            for m in &leaves {
                e.related_makers.remove(m);
            }
            for m in &enters {
                e.related_makers.insert(*m);
            }
        }
        for m in &leaves {
            if let Some(me) = self.elements.get_mut(m) {
                me.related_watchers.remove(key);
            }
        }
        for m in &enters {
            if let Some(me) = self.elements.get_mut(m) {
                me.related_watchers.insert(*key);
            }
        }

        for m in &leaves {
            let mpos = match self.elements.get(m) {
                Some(me) => me.pos,
                None => continue,
            };
            let event = AoiEvent::leave(mpos);
            self.emit(key, m, &event);
        }
        for m in &enters {
            let mpos = match self.elements.get(m) {
                Some(me) => me.pos,
                None => continue,
            };
            let event = AoiEvent::enter(mpos);
            self.emit(key, m, &event);
        }
        // a moving watcher never emits MOVE
    }

    /// Recompute path for a maker that moved: query watchers covering the new
    /// position, diff, apply, and emit LEAVE / MOVE / ENTER in that order.
    fn update_maker(&mut self, key: &K, old_pos: &[P; D], hint: Option<&CoverHint>) {
        let new_pos = match self.elements.get(key) {
            Some(e) => e.pos,
            None => return,
        };
        for i in 0..D {
            self.axes[i].makers.update(*key, &old_pos[i], new_pos[i]);
        }

        let mut new_watchers =
            self.watchers_covering_with(&new_pos, std::slice::from_ref(key), hint);
        new_watchers.sort_unstable();
        let mut old_watchers: Vec<K> = match self.elements.get(key) {
            Some(e) => e.related_watchers.iter().copied().collect(),
            None => return,
        };
        old_watchers.sort_unstable();

        let (leaves, keeps, enters) = diff_sorted_keys(&old_watchers, &new_watchers);

        if let Some(e) = self.elements.get_mut(key) {
            for w in &leaves {
                e.related_watchers.remove(w);
            }
            for w in &enters {
                e.related_watchers.insert(*w);
            }
        }
        for w in &leaves {
            if let Some(we) = self.elements.get_mut(w) {
                we.related_makers.remove(key);
            }
        }
        for w in &enters {
            if let Some(we) = self.elements.get_mut(w) {
                we.related_makers.insert(*key);
            }
        }

        if !(leaves.is_empty() && keeps.is_empty() && enters.is_empty()) {
            let mut event = AoiEvent::movement(new_pos, *old_pos);
            event.kind = EventKind::Leave;
            for w in &leaves {
                self.emit(w, key, &event);
            }
            event.kind = EventKind::Move;
            for w in &keeps {
                self.emit(w, key, &event);
            }
            event.kind = EventKind::Enter;
            for w in &enters {
                self.emit(w, key, &event);
            }
        }
    }

    /// Estimate the cost of each leave/enter slab of a shifting watcher and
    /// pick the cheapest maker-list pivot per slab.
    fn watcher_shift_hint(
        &self,
        new_pos: &[P; D],
        old_pos: &[P; D],
        range: &[P; D],
    ) -> WatcherShiftHint<D> {
        let mut hint = WatcherShiftHint {
            leave_axis: [0; D],
            enter_axis: [0; D],
            complexity: 0,
        };
        for d in 0..D {
            let mut best_axis = 0;
            let mut best = usize::MAX;
            for i in 0..D {
                let count = if i == d {
                    if old_pos[d] < new_pos[d] {
                        self.axes[i].makers.count_in_range(
                            Bound::Excluded(old_pos[i] - range[i]),
                            Bound::Included(new_pos[i] - range[i]),
                        )
                    } else {
                        self.axes[i].makers.count_in_range(
                            Bound::Included(new_pos[i] + range[i]),
                            Bound::Excluded(old_pos[i] + range[i]),
                        )
                    }
                } else {
                    self.axes[i].makers.count_in_range(
                        Bound::Excluded(old_pos[i] - range[i]),
                        Bound::Excluded(old_pos[i] + range[i]),
                    )
                };
                if count < best {
                    best_axis = i;
                    best = count;
                }
            }
            hint.leave_axis[d] = best_axis;
            hint.complexity += best;

            let mut best_axis = 0;
            let mut best = usize::MAX;
            for i in 0..D {
                let count = if i == d {
                    if old_pos[d] < new_pos[d] {
                        self.axes[i].makers.count_in_range(
                            Bound::Included(old_pos[i] + range[i]),
                            Bound::Excluded(new_pos[i] + range[i]),
                        )
                    } else {
                        self.axes[i].makers.count_in_range(
                            Bound::Excluded(new_pos[i] - range[i]),
                            Bound::Included(old_pos[i] - range[i]),
                        )
                    }
                } else {
                    self.axes[i].makers.count_in_range(
                        Bound::Excluded(new_pos[i] - range[i]),
                        Bound::Excluded(new_pos[i] + range[i]),
                    )
                };
                if count < best {
                    best_axis = i;
                    best = count;
                }
            }
            hint.enter_axis[d] = best_axis;
            hint.complexity += best;
        }
        hint
    }

    /// Shift path for a moving watcher: enumerate only the 2·D thin slabs of
    /// the symmetric difference between the old and new boxes.
    fn shift_watcher(&mut self, key: &K, old_pos: &[P; D], hint: &WatcherShiftHint<D>) {
        let (new_pos, range) = match self.elements.get(key) {
            Some(e) => (e.pos, e.watch_range),
            None => return,
        };
        for i in 0..D {
            self.axes[i]
                .watcher_lower
                .update(*key, &(old_pos[i] - range[i]), new_pos[i] - range[i]);
            self.axes[i]
                .watcher_upper
                .update(*key, &(old_pos[i] + range[i]), new_pos[i] + range[i]);
        }

        let mut leave_makers: Vec<K> = Vec::new();
        let mut enter_makers: Vec<K> = Vec::new();

        for d in 0..D {
            let pivot = hint.leave_axis[d];
            let (lo, hi) = if pivot == d {
                if old_pos[d] < new_pos[d] {
                    (
                        Bound::Excluded(old_pos[d] - range[d]),
                        Bound::Included(new_pos[d] - range[d]),
                    )
                } else {
                    (
                        Bound::Included(new_pos[d] + range[d]),
                        Bound::Excluded(old_pos[d] + range[d]),
                    )
                }
            } else {
                (
                    Bound::Excluded(old_pos[pivot] - range[pivot]),
                    Bound::Excluded(old_pos[pivot] + range[pivot]),
                )
            };
            {
                let elements = &self.elements;
                let axes = &self.axes;
                axes[pivot].makers.for_each_in_range(lo, hi, |_, k, _| {
                    if k == key {
                        return;
                    }
                    let Some(e) = elements.get(k) else { return };
                    if maker_in_leave_slab(&e.pos, d, &new_pos, old_pos, &range) {
                        leave_makers.push(*k);
                    }
                });
            }

            let pivot = hint.enter_axis[d];
            let (lo, hi) = if pivot == d {
                if old_pos[d] < new_pos[d] {
                    (
                        Bound::Included(old_pos[d] + range[d]),
                        Bound::Excluded(new_pos[d] + range[d]),
                    )
                } else {
                    (
                        Bound::Excluded(new_pos[d] - range[d]),
                        Bound::Included(old_pos[d] - range[d]),
                    )
                }
            } else {
                (
                    Bound::Excluded(new_pos[pivot] - range[pivot]),
                    Bound::Excluded(new_pos[pivot] + range[pivot]),
                )
            };
            {
                let elements = &self.elements;
                let axes = &self.axes;
                axes[pivot].makers.for_each_in_range(lo, hi, |_, k, _| {
                    if k == key {
                        return;
                    }
                    let Some(e) = elements.get(k) else { return };
                    if maker_in_enter_slab(&e.pos, d, &new_pos, old_pos, &range) {
                        enter_makers.push(*k);
                    }
                });
            }
        }

        // A maker straddling two slab frontiers can be collected twice.
        leave_makers.sort_unstable();
        leave_makers.dedup();
        enter_makers.sort_unstable();
        enter_makers.dedup();

        if let Some(e) = self.elements.get_mut(key) {
            for m in &leave_makers {
                e.related_makers.remove(m);
            }
            for m in &enter_makers {
                e.related_makers.insert(*m);
            }
        }
        for m in &leave_makers {
            if let Some(me) = self.elements.get_mut(m) {
                me.related_watchers.remove(key);
            }
        }
        for m in &enter_makers {
            if let Some(me) = self.elements.get_mut(m) {
                me.related_watchers.insert(*key);
            }
        }

        for m in &leave_makers {
            let mpos = match self.elements.get(m) {
                Some(me) => me.pos,
                None => continue,
            };
            let event = AoiEvent::leave(mpos);
            self.emit(key, m, &event);
        }
        for m in &enter_makers {
            let mpos = match self.elements.get(m) {
                Some(me) => me.pos,
                None => continue,
            };
            let event = AoiEvent::enter(mpos);
            self.emit(key, m, &event);
        }
    }

    /// Estimate the cost of each leave/enter slab of a shifting maker and
    /// pick the cheapest watcher-edge pivot (axis plus edge list) per slab.
    fn maker_shift_hint(&self, new_pos: &[P; D], old_pos: &[P; D]) -> MakerShiftHint<D> {
        let mut hint = MakerShiftHint {
            leave_axis: [0; D],
            leave_use_lower: [true; D],
            enter_axis: [0; D],
            enter_use_lower: [true; D],
            complexity: 0,
        };
        for d in 0..D {
            let mut best_axis = 0;
            let mut best_lower = true;
            let mut best = usize::MAX;
            for i in 0..D {
                if i == d {
                    let count = if old_pos[d] < new_pos[d] {
                        self.axes[i].watcher_upper.count_in_range(
                            Bound::Excluded(old_pos[i]),
                            Bound::Included(new_pos[i]),
                        )
                    } else {
                        self.axes[i].watcher_lower.count_in_range(
                            Bound::Included(new_pos[i]),
                            Bound::Excluded(old_pos[i]),
                        )
                    };
                    if count < best {
                        best_axis = i;
                        best = count;
                    }
                } else {
                    let span = self.doubled_max(i);
                    let count = self.axes[i].watcher_lower.count_in_range(
                        Bound::Excluded(old_pos[i] - span),
                        Bound::Excluded(old_pos[i]),
                    );
                    if count < best {
                        best_axis = i;
                        best_lower = true;
                        best = count;
                    }
                    let count = self.axes[i].watcher_upper.count_in_range(
                        Bound::Excluded(old_pos[i]),
                        Bound::Excluded(old_pos[i] + span),
                    );
                    if count < best {
                        best_axis = i;
                        best_lower = false;
                        best = count;
                    }
                }
            }
            hint.leave_axis[d] = best_axis;
            hint.leave_use_lower[d] = best_lower;
            hint.complexity += best;

            let mut best_axis = 0;
            let mut best_lower = true;
            let mut best = usize::MAX;
            for i in 0..D {
                if i == d {
                    let count = if old_pos[d] < new_pos[d] {
                        self.axes[i].watcher_lower.count_in_range(
                            Bound::Included(old_pos[i]),
                            Bound::Excluded(new_pos[i]),
                        )
                    } else {
                        self.axes[i].watcher_upper.count_in_range(
                            Bound::Excluded(new_pos[i]),
                            Bound::Included(old_pos[i]),
                        )
                    };
                    if count < best {
                        best_axis = i;
                        best = count;
                    }
                } else {
                    let span = self.doubled_max(i);
                    let count = self.axes[i].watcher_lower.count_in_range(
                        Bound::Excluded(new_pos[i] - span),
                        Bound::Excluded(new_pos[i]),
                    );
                    if count < best {
                        best_axis = i;
                        best_lower = true;
                        best = count;
                    }
                    let count = self.axes[i].watcher_upper.count_in_range(
                        Bound::Excluded(new_pos[i]),
                        Bound::Excluded(new_pos[i] + span),
                    );
                    if count < best {
                        best_axis = i;
                        best_lower = false;
                        best = count;
                    }
                }
            }
            hint.enter_axis[d] = best_axis;
            hint.enter_use_lower[d] = best_lower;
            hint.complexity += best;
        }
        hint
    }

    /// Shift path for a moving maker: collect leaving and entering watchers
    /// from the 2·D slabs, then emit LEAVE, MOVE (to kept watchers), ENTER.
    fn shift_maker(&mut self, key: &K, old_pos: &[P; D], hint: &MakerShiftHint<D>) {
        let new_pos = match self.elements.get(key) {
            Some(e) => e.pos,
            None => return,
        };
        for i in 0..D {
            self.axes[i].makers.update(*key, &old_pos[i], new_pos[i]);
        }

        let mut leave_watchers: Vec<K> = Vec::new();
        let mut enter_watchers: Vec<K> = Vec::new();

        for d in 0..D {
            let pivot = hint.leave_axis[d];
            let (lower_list, lo, hi) = if pivot == d {
                if old_pos[d] < new_pos[d] {
                    (
                        false,
                        Bound::Excluded(old_pos[d]),
                        Bound::Included(new_pos[d]),
                    )
                } else {
                    (
                        true,
                        Bound::Included(new_pos[d]),
                        Bound::Excluded(old_pos[d]),
                    )
                }
            } else {
                let span = self.doubled_max(pivot);
                if hint.leave_use_lower[d] {
                    (
                        true,
                        Bound::Excluded(old_pos[pivot] - span),
                        Bound::Excluded(old_pos[pivot]),
                    )
                } else {
                    (
                        false,
                        Bound::Excluded(old_pos[pivot]),
                        Bound::Excluded(old_pos[pivot] + span),
                    )
                }
            };
            {
                let elements = &self.elements;
                let axes = &self.axes;
                let list = if lower_list {
                    &axes[pivot].watcher_lower
                } else {
                    &axes[pivot].watcher_upper
                };
                list.for_each_in_range(lo, hi, |_, k, _| {
                    if k == key {
                        return;
                    }
                    let Some(e) = elements.get(k) else { return };
                    if watcher_in_leave_slab(e, d, &new_pos, old_pos) {
                        leave_watchers.push(*k);
                    }
                });
            }

            let pivot = hint.enter_axis[d];
            let (lower_list, lo, hi) = if pivot == d {
                if old_pos[d] < new_pos[d] {
                    (
                        true,
                        Bound::Included(old_pos[d]),
                        Bound::Excluded(new_pos[d]),
                    )
                } else {
                    (
                        false,
                        Bound::Excluded(new_pos[d]),
                        Bound::Included(old_pos[d]),
                    )
                }
            } else {
                let span = self.doubled_max(pivot);
                if hint.enter_use_lower[d] {
                    (
                        true,
                        Bound::Excluded(new_pos[pivot] - span),
                        Bound::Excluded(new_pos[pivot]),
                    )
                } else {
                    (
                        false,
                        Bound::Excluded(new_pos[pivot]),
                        Bound::Excluded(new_pos[pivot] + span),
                    )
                }
            };
            {
                let elements = &self.elements;
                let axes = &self.axes;
                let list = if lower_list {
                    &axes[pivot].watcher_lower
                } else {
                    &axes[pivot].watcher_upper
                };
                list.for_each_in_range(lo, hi, |_, k, _| {
                    if k == key {
                        return;
                    }
                    let Some(e) = elements.get(k) else { return };
                    if watcher_in_enter_slab(e, d, &new_pos, old_pos) {
                        enter_watchers.push(*k);
                    }
                });
            }
        }

        leave_watchers.sort_unstable();
        leave_watchers.dedup();
        enter_watchers.sort_unstable();
        enter_watchers.dedup();

        if let Some(e) = self.elements.get_mut(key) {
            for w in &leave_watchers {
                e.related_watchers.remove(w);
            }
        }
        for w in &leave_watchers {
            if let Some(we) = self.elements.get_mut(w) {
                we.related_makers.remove(key);
            }
        }

        // Kept watchers are whatever remains after the leavers are gone and
        // before the enterers are added.
        let mut keep_watchers: Vec<K> = match self.elements.get(key) {
            Some(e) => e.related_watchers.iter().copied().collect(),
            None => Vec::new(),
        };
        keep_watchers.sort_unstable();

        if let Some(e) = self.elements.get_mut(key) {
            for w in &enter_watchers {
                e.related_watchers.insert(*w);
            }
        }
        for w in &enter_watchers {
            if let Some(we) = self.elements.get_mut(w) {
                we.related_makers.insert(*key);
            }
        }

        if !(leave_watchers.is_empty() && keep_watchers.is_empty() && enter_watchers.is_empty()) {
            let mut event = AoiEvent::movement(new_pos, *old_pos);
            event.kind = EventKind::Leave;
            for w in &leave_watchers {
                self.emit(w, key, &event);
            }
            event.kind = EventKind::Move;
            for w in &keep_watchers {
                self.emit(w, key, &event);
            }
            event.kind = EventKind::Enter;
            for w in &enter_watchers {
                self.emit(w, key, &event);
            }
        }
    }
}

fn abs_diff<P: Coord>(a: P, b: P) -> P {
    if a < b {
        b - a
    } else {
        a - b
    }
}

/// Maker position lies in the watcher's leave slab for direction `d`: inside
/// the old box, outside the new box, crossing the `d` frontier.
fn maker_in_leave_slab<P: Coord, const D: usize>(
    mpos: &[P; D],
    d: usize,
    new_pos: &[P; D],
    old_pos: &[P; D],
    range: &[P; D],
) -> bool {
    for i in 0..D {
        if i == d {
            if old_pos[d] < new_pos[d] {
                let old_edge = old_pos[i] - range[i];
                let new_edge = new_pos[i] - range[i];
                if !(old_edge < mpos[i]) || new_edge < mpos[i] {
                    return false;
                }
            } else {
                let old_edge = old_pos[i] + range[i];
                let new_edge = new_pos[i] + range[i];
                if mpos[i] < new_edge || !(mpos[i] < old_edge) {
                    return false;
                }
            }
        } else {
            let lo = old_pos[i] - range[i];
            let hi = old_pos[i] + range[i];
            if !(lo < mpos[i]) || !(mpos[i] < hi) {
                return false;
            }
        }
    }
    true
}

/// Maker position lies in the watcher's enter slab for direction `d`.
fn maker_in_enter_slab<P: Coord, const D: usize>(
    mpos: &[P; D],
    d: usize,
    new_pos: &[P; D],
    old_pos: &[P; D],
    range: &[P; D],
) -> bool {
    for i in 0..D {
        if i == d {
            if old_pos[d] < new_pos[d] {
                let old_edge = old_pos[i] + range[i];
                let new_edge = new_pos[i] + range[i];
                if mpos[i] < old_edge || !(mpos[i] < new_edge) {
                    return false;
                }
            } else {
                let old_edge = old_pos[i] - range[i];
                let new_edge = new_pos[i] - range[i];
                if !(new_edge < mpos[i]) || old_edge < mpos[i] {
                    return false;
                }
            }
        } else {
            let lo = new_pos[i] - range[i];
            let hi = new_pos[i] + range[i];
            if !(lo < mpos[i]) || !(mpos[i] < hi) {
                return false;
            }
        }
    }
    true
}

/// Watcher saw the maker's old position but cannot see the new one, crossing
/// the `d` frontier.
fn watcher_in_leave_slab<K, P: Coord, const D: usize>(
    e: &Element<K, P, D>,
    d: usize,
    new_pos: &[P; D],
    old_pos: &[P; D],
) -> bool {
    for i in 0..D {
        let lower = e.lower(i);
        let upper = e.upper(i);
        if i == d {
            if old_pos[d] < new_pos[d] {
                if !(lower < old_pos[i] && old_pos[i] < upper && !(new_pos[i] < upper)) {
                    return false;
                }
            } else if !(!(lower < new_pos[i]) && lower < old_pos[i] && old_pos[i] < upper) {
                return false;
            }
        } else if !(lower < old_pos[i]) || !(old_pos[i] < upper) {
            return false;
        }
    }
    true
}

/// Watcher sees the maker's new position but did not see the old one.
fn watcher_in_enter_slab<K, P: Coord, const D: usize>(
    e: &Element<K, P, D>,
    d: usize,
    new_pos: &[P; D],
    old_pos: &[P; D],
) -> bool {
    for i in 0..D {
        let lower = e.lower(i);
        let upper = e.upper(i);
        if i == d {
            if old_pos[d] < new_pos[d] {
                if !(!(lower < old_pos[i]) && lower < new_pos[i] && new_pos[i] < upper) {
                    return false;
                }
            } else if !(lower < new_pos[i] && new_pos[i] < upper && !(old_pos[i] < upper)) {
                return false;
            }
        } else if !(lower < new_pos[i]) || !(new_pos[i] < upper) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use std::cell::RefCell;
    use std::rc::Rc;

    type Recorded = (u32, u32, EventKind, [i64; 2], [i64; 2]);
    type Log = Rc<RefCell<Vec<Recorded>>>;

    fn recording_group(max: [i64; 2]) -> (AoiGroup<u32, i64, 2>, Log) {
        let mut group = AoiGroup::new(max);
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        group.set_callback(move |receiver, sender, event| {
            sink.borrow_mut()
                .push((*receiver, *sender, event.kind, event.pos, event.pos_from));
        });
        (group, log)
    }

    fn drain(log: &Log) -> Vec<Recorded> {
        log.borrow_mut().drain(..).collect()
    }

    #[test]
    #[should_panic(expected = "strictly positive")]
    fn construction_rejects_nonpositive_max() {
        let _ = AoiGroup::<u32, i64, 2>::new([0, 10]);
    }

    #[test]
    fn duplicate_and_unknown_keys_error_without_effect() {
        let (mut g, log) = recording_group([10, 10]);
        g.enter(1, [0, 0], WatchRole::BOTH, [5, 5]).unwrap();
        drain(&log);

        assert_eq!(
            g.enter(1, [1, 1], WatchRole::NONE, [0, 0]),
            Err(AoiError::KeyExists)
        );
        assert_eq!(g.position(&1), Some([0, 0]));

        assert_eq!(g.leave(&2), Err(AoiError::KeyNotFound));
        assert_eq!(g.move_to(&2, [0, 0]), Err(AoiError::KeyNotFound));
        assert_eq!(g.move_by(&2, [1, 0]), Err(AoiError::KeyNotFound));
        assert_eq!(
            g.change_watch_role(&2, WatchRole::BOTH),
            Err(AoiError::KeyNotFound)
        );
        assert_eq!(
            g.change_watch_range(&2, [5, 5]),
            Err(AoiError::KeyNotFound)
        );
        assert!(drain(&log).is_empty());
        assert!(g.check_consistency());
    }

    #[test]
    fn watch_range_is_clamped_on_enter_and_change() {
        let mut g: AoiGroup<u32, i64, 2> = AoiGroup::new([10, 10]);
        g.enter(1, [0, 0], WatchRole::WATCHER, [-5, 50]).unwrap();
        assert_eq!(g.watch_range(&1), Some([0, 10]));

        g.change_watch_range(&1, [100, -1]).unwrap();
        assert_eq!(g.watch_range(&1), Some([10, 0]));
        assert!(g.check_consistency());
    }

    #[test]
    fn move_to_current_position_is_silent() {
        let (mut g, log) = recording_group([10, 10]);
        g.enter(1, [0, 0], WatchRole::BOTH, [5, 5]).unwrap();
        g.enter(2, [2, 0], WatchRole::BOTH, [5, 5]).unwrap();
        drain(&log);

        g.move_to(&1, [0, 0]).unwrap();
        assert!(drain(&log).is_empty());
    }

    #[test]
    fn unchanged_watch_range_is_silent() {
        let (mut g, log) = recording_group([10, 10]);
        g.enter(1, [0, 0], WatchRole::WATCHER, [5, 5]).unwrap();
        g.enter(2, [2, 0], WatchRole::MAKER, [0, 0]).unwrap();
        drain(&log);

        g.change_watch_range(&1, [5, 5]).unwrap();
        // clamping makes an oversized request equal to the stored range too
        g.change_watch_range(&1, [5, 5]).unwrap();
        assert!(drain(&log).is_empty());
    }

    #[test]
    fn range_change_on_non_watcher_only_stores() {
        let (mut g, log) = recording_group([10, 10]);
        g.enter(1, [0, 0], WatchRole::MAKER, [0, 0]).unwrap();
        g.enter(2, [1, 0], WatchRole::MAKER, [0, 0]).unwrap();
        drain(&log);

        g.change_watch_range(&1, [5, 5]).unwrap();
        assert_eq!(g.watch_range(&1), Some([5, 5]));
        assert!(drain(&log).is_empty());
        assert!(g.makers_of(&1).unwrap().is_empty());

        // the stored range takes effect when the watcher bit appears
        g.change_watch_role(&1, WatchRole::BOTH).unwrap();
        assert_eq!(g.makers_of(&1).unwrap(), vec![2]);
        assert!(g.check_consistency());
    }

    #[test]
    fn zero_range_watcher_sees_nothing() {
        let (mut g, log) = recording_group([10, 10]);
        g.enter(1, [0, 0], WatchRole::WATCHER, [0, 10]).unwrap();
        g.enter(2, [0, 0], WatchRole::MAKER, [0, 0]).unwrap();
        g.enter(3, [0, 3], WatchRole::MAKER, [0, 0]).unwrap();

        assert!(drain(&log).is_empty());
        assert!(g.makers_of(&1).unwrap().is_empty());
        assert!(g.check_consistency());
    }

    #[test]
    fn enter_then_leave_is_net_zero_for_peers() {
        let (mut g, log) = recording_group([10, 10]);
        for (k, pos) in [(1u32, [0i64, 0]), (2, [4, 0]), (3, [0, 4])] {
            g.enter(k, pos, WatchRole::BOTH, [10, 10]).unwrap();
        }
        drain(&log);
        let relations_before: Vec<_> = [1u32, 2, 3]
            .iter()
            .map(|k| (g.makers_of(k).unwrap(), g.watchers_of(k).unwrap()))
            .collect();

        g.enter(9, [1, 1], WatchRole::BOTH, [10, 10]).unwrap();
        let mut entered_peers: Vec<u32> = drain(&log)
            .into_iter()
            .filter(|(receiver, _, kind, _, _)| *kind == EventKind::Enter && *receiver != 9)
            .map(|(receiver, _, _, _, _)| receiver)
            .collect();
        entered_peers.sort_unstable();
        assert_eq!(entered_peers, vec![1, 2, 3]);

        g.leave(&9).unwrap();
        let left_peers: Vec<u32> = drain(&log)
            .into_iter()
            .filter(|(_, sender, kind, _, _)| *kind == EventKind::Leave && *sender == 9)
            .map(|(receiver, _, _, _, _)| receiver)
            .collect();
        assert_eq!(left_peers, entered_peers);

        let relations_after: Vec<_> = [1u32, 2, 3]
            .iter()
            .map(|k| (g.makers_of(k).unwrap(), g.watchers_of(k).unwrap()))
            .collect();
        assert_eq!(relations_before, relations_after);
        assert!(g.check_consistency());
    }

    #[test]
    fn long_jump_releases_old_peers_before_new_ones() {
        let (mut g, log) = recording_group([10, 10]);
        g.enter(1, [0, 0], WatchRole::WATCHER, [5, 5]).unwrap();
        g.enter(2, [2, 0], WatchRole::MAKER, [0, 0]).unwrap();
        g.enter(3, [100, 0], WatchRole::MAKER, [0, 0]).unwrap();
        drain(&log);

        g.move_to(&1, [100, 1]).unwrap();
        let events = drain(&log);
        assert_eq!(
            events,
            vec![
                (1, 2, EventKind::Leave, [2, 0], [2, 0]),
                (1, 3, EventKind::Enter, [100, 0], [100, 0]),
            ]
        );
        assert!(g.check_consistency());
    }

    #[test]
    fn successive_moves_match_a_single_move() {
        let populate = |g: &mut AoiGroup<u32, i64, 2>| {
            for k in 0..40u32 {
                let x = (k % 8) as i64 * 6;
                let y = (k / 8) as i64 * 6;
                g.enter(k, [x, y], WatchRole::BOTH, [8, 8]).unwrap();
            }
            g.enter(100, [0, 0], WatchRole::BOTH, [9, 9]).unwrap();
        };

        let mut stepped: AoiGroup<u32, i64, 2> = AoiGroup::new([10, 10]);
        populate(&mut stepped);
        stepped.move_to(&100, [13, 7]).unwrap();
        stepped.move_to(&100, [25, 14]).unwrap();

        let mut direct: AoiGroup<u32, i64, 2> = AoiGroup::new([10, 10]);
        populate(&mut direct);
        direct.move_to(&100, [25, 14]).unwrap();

        assert_eq!(stepped.makers_of(&100), direct.makers_of(&100));
        assert_eq!(stepped.watchers_of(&100), direct.watchers_of(&100));
        assert!(stepped.check_consistency());
        assert!(direct.check_consistency());
    }

    #[test]
    fn shift_and_recompute_paths_agree() {
        let mut rng = SmallRng::seed_from_u64(0x5EED);
        let mut population: Vec<(u32, [i64; 2], WatchRole, [i64; 2])> = Vec::new();
        for k in 0..600u32 {
            population.push((
                k,
                [rng.gen_range(0..1000), rng.gen_range(0..1000)],
                WatchRole::MAKER,
                [0, 0],
            ));
        }
        for k in 600..1000u32 {
            population.push((
                k,
                [rng.gen_range(0..1000), rng.gen_range(0..1000)],
                WatchRole::WATCHER,
                [rng.gen_range(1..=20), rng.gen_range(1..=20)],
            ));
        }
        const MOVER: u32 = 1000;

        let build = |strategy: MoveStrategy,
                     population: &[(u32, [i64; 2], WatchRole, [i64; 2])]|
         -> (AoiGroup<u32, i64, 2>, Log) {
            let (mut group, log) = recording_group([20, 20]);
            for (k, pos, role, range) in population {
                group.enter(*k, *pos, *role, *range).unwrap();
            }
            group
                .enter(MOVER, [500, 500], WatchRole::BOTH, [15, 15])
                .unwrap();
            group.force_strategy = Some(strategy);
            (group, log)
        };

        let (mut recompute, rlog) = build(MoveStrategy::Recompute, &population);
        let (mut shift, slog) = build(MoveStrategy::Shift, &population);
        assert_eq!(drain(&rlog), drain(&slog));

        let mut pos = [500i64, 500];
        for step in 0..80 {
            pos[0] += rng.gen_range(-12i64..=12);
            pos[1] += rng.gen_range(-12i64..=12);
            recompute.move_to(&MOVER, pos).unwrap();
            shift.move_to(&MOVER, pos).unwrap();
            assert_eq!(drain(&rlog), drain(&slog), "event streams diverged at step {step}");
            if step % 20 == 0 {
                assert!(recompute.check_consistency());
                assert!(shift.check_consistency());
            }
        }

        // both engines agree with a brute-force oracle over the static peers
        let mut expected_makers: Vec<u32> = population
            .iter()
            .filter(|(_, mpos, role, _)| {
                role.is_maker()
                    && (0..2).all(|i| pos[i] - 15 < mpos[i] && mpos[i] < pos[i] + 15)
            })
            .map(|(k, _, _, _)| *k)
            .collect();
        expected_makers.sort_unstable();
        assert_eq!(recompute.makers_of(&MOVER).unwrap(), expected_makers);
        assert_eq!(shift.makers_of(&MOVER).unwrap(), expected_makers);

        let mut expected_watchers: Vec<u32> = population
            .iter()
            .filter(|(_, wpos, role, range)| {
                role.is_watcher()
                    && (0..2).all(|i| {
                        wpos[i] - range[i] < pos[i] && pos[i] < wpos[i] + range[i]
                    })
            })
            .map(|(k, _, _, _)| *k)
            .collect();
        expected_watchers.sort_unstable();
        assert_eq!(recompute.watchers_of(&MOVER).unwrap(), expected_watchers);
        assert_eq!(shift.watchers_of(&MOVER).unwrap(), expected_watchers);

        assert!(recompute.check_consistency());
        assert!(shift.check_consistency());
    }
}
