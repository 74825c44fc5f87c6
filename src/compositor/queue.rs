use std::collections::VecDeque;

use crate::compositor::surface::CommitId;

/// Generic double-buffered state for surface addons: pending edits are
/// frozen into packets keyed by the surface's commit id, and applied in
/// order up to a given id.
pub struct StateQueue<T> {
    pub pending: T,
    dirty: bool,
    queue: VecDeque<(CommitId, T)>,
    pub current: T,
}

impl<T: Default> Default for StateQueue<T> {
    fn default() -> Self {
        Self {
            pending: T::default(),
            dirty: false,
            queue: VecDeque::new(),
            current: T::default(),
        }
    }
}

impl<T: Default + Clone> StateQueue<T> {
    /// Marks the pending state edited; an unedited pending state produces
    /// no packet at commit time.
    pub fn touch(&mut self) -> &mut T {
        self.dirty = true;
        &mut self.pending
    }

    pub fn commit(&mut self, id: CommitId) {
        if !self.dirty {
            return;
        }

        self.queue.push_back((id, std::mem::take(&mut self.pending)));
        self.pending = self.queue.back().unwrap().1.clone();
        self.dirty = false;
    }

    /// Applies every queued packet with an id at or below `id`, in order.
    pub fn apply(&mut self, id: CommitId) {
        while let Some((packet_id, _)) = self.queue.front() {
            if *packet_id > id {
                break;
            }

            let (_, state) = self.queue.pop_front().unwrap();
            self.current = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn applies_in_commit_order() {
        let mut queue: StateQueue<i32> = StateQueue::default();

        *queue.touch() = 10;
        queue.commit(1);
        *queue.touch() = 20;
        queue.commit(2);

        queue.apply(1);
        assert_eq!(queue.current, 10);

        queue.apply(2);
        assert_eq!(queue.current, 20);
    }

    #[test]
    fn unedited_state_produces_no_packet() {
        let mut queue: StateQueue<i32> = StateQueue::default();

        *queue.touch() = 10;
        queue.commit(1);
        queue.commit(2);
        queue.apply(2);

        assert_eq!(queue.current, 10);
    }

    #[test]
    fn pending_edits_accumulate() {
        let mut queue: StateQueue<i32> = StateQueue::default();

        *queue.touch() = 10;
        queue.commit(1);

        // The next pending state starts from the last committed one.
        assert_eq!(*queue.touch(), 10);
    }

    #[test]
    fn apply_stops_at_future_ids() {
        let mut queue: StateQueue<i32> = StateQueue::default();

        *queue.touch() = 10;
        queue.commit(5);
        queue.apply(4);
        assert_eq!(queue.current, 0);

        queue.apply(5);
        assert_eq!(queue.current, 10);
    }
}
