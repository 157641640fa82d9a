//! Immutable, structurally shared sequences.
//!
//! Nothing here is ever mutated after construction: every operation builds a
//! new value that shares its tail with the old one. That is what makes these
//! types safe to keep inside an [`AtomicReference`](crate::AtomicReference)
//! and replace wholesale with a CAS.

use std::fmt;
use std::iter::FromIterator;
use std::sync::Arc;

struct Node<T> {
    value: T,
    next: PersistentList<T>,
}

/// Singly-linked cons list.
pub struct PersistentList<T> {
    head: Option<Arc<Node<T>>>,
    len: usize,
}

impl<T> PersistentList<T> {
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    /// New list with `value` in front of `self`. O(1).
    pub fn prepend(&self, value: T) -> Self {
        Self {
            head: Some(Arc::new(Node {
                value,
                next: self.clone(),
            })),
            len: self.len + 1,
        }
    }

    pub fn first(&self) -> Option<&T> {
        self.head.as_ref().map(|node| &node.value)
    }

    /// Everything but the first element; empty for an empty list. O(1).
    pub fn rest(&self) -> Self {
        match &self.head {
            Some(node) => node.next.clone(),
            None => Self::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            next: self.head.as_deref(),
        }
    }

    /// True when both lists are the same allocation chain.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (&self.head, &other.head) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl<T: Clone> PersistentList<T> {
    pub fn reversed(&self) -> Self {
        self.iter()
            .fold(Self::new(), |acc, value| acc.prepend(value.clone()))
    }
}

impl<T> Clone for PersistentList<T> {
    fn clone(&self) -> Self {
        Self {
            head: self.head.clone(),
            len: self.len,
        }
    }
}

impl<T> Default for PersistentList<T> {
    fn default() -> Self {
        Self::new()
    }
}

// Unlink iteratively so dropping a long uniquely-owned chain cannot blow the
// stack. Stops at the first node someone else still shares.
impl<T> Drop for PersistentList<T> {
    fn drop(&mut self) {
        let mut head = self.head.take();
        while let Some(node) = head {
            match Arc::try_unwrap(node) {
                Ok(mut node) => head = node.next.head.take(),
                Err(_) => break,
            }
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for PersistentList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T: PartialEq> PartialEq for PersistentList<T> {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.iter().eq(other.iter())
    }
}

/// Builds a list whose first element is the first item yielded.
impl<T: Clone> FromIterator<T> for PersistentList<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::new(), |acc, value| acc.prepend(value))
            .reversed()
    }
}

pub struct Iter<'a, T> {
    next: Option<&'a Node<T>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        self.next.map(|node| {
            self.next = node.next.head.as_deref();
            &node.value
        })
    }
}

impl<'a, T> IntoIterator for &'a PersistentList<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}

/// Incremental rebuild of the queue's front: `front ++ reverse(back)`,
/// advanced a constant number of steps per queue operation.
///
/// `live` counts how many elements copied into `rev_front` are still in the
/// queue; pops that happen mid-rotation decrement it so popped elements are
/// left out of the rebuilt front.
enum Rotation<T> {
    Idle,
    Reversing {
        live: usize,
        front: PersistentList<T>,
        rev_front: PersistentList<T>,
        back: PersistentList<T>,
        rev_back: PersistentList<T>,
    },
    Appending {
        live: usize,
        rev_front: PersistentList<T>,
        acc: PersistentList<T>,
    },
    Done(PersistentList<T>),
}

impl<T> Clone for Rotation<T> {
    fn clone(&self) -> Self {
        match self {
            Rotation::Idle => Rotation::Idle,
            Rotation::Reversing {
                live,
                front,
                rev_front,
                back,
                rev_back,
            } => Rotation::Reversing {
                live: *live,
                front: front.clone(),
                rev_front: rev_front.clone(),
                back: back.clone(),
                rev_back: rev_back.clone(),
            },
            Rotation::Appending {
                live,
                rev_front,
                acc,
            } => Rotation::Appending {
                live: *live,
                rev_front: rev_front.clone(),
                acc: acc.clone(),
            },
            Rotation::Done(list) => Rotation::Done(list.clone()),
        }
    }
}

impl<T: Clone> Rotation<T> {
    fn step(&self) -> Self {
        match self {
            Rotation::Reversing {
                live,
                front,
                rev_front,
                back,
                rev_back,
            } => match (front.first(), back.first()) {
                (Some(x), Some(y)) => Rotation::Reversing {
                    live: live + 1,
                    front: front.rest(),
                    rev_front: rev_front.prepend(x.clone()),
                    back: back.rest(),
                    rev_back: rev_back.prepend(y.clone()),
                },
                (None, Some(y)) if back.len() == 1 => Rotation::Appending {
                    live: *live,
                    rev_front: rev_front.clone(),
                    acc: rev_back.prepend(y.clone()),
                },
                _ => self.clone(),
            },
            Rotation::Appending { live: 0, acc, .. } => Rotation::Done(acc.clone()),
            Rotation::Appending {
                live,
                rev_front,
                acc,
            } => match rev_front.first() {
                Some(x) => Rotation::Appending {
                    live: live - 1,
                    rev_front: rev_front.rest(),
                    acc: acc.prepend(x.clone()),
                },
                None => self.clone(),
            },
            Rotation::Idle | Rotation::Done(_) => self.clone(),
        }
    }

    /// Account for one element popped off the live front.
    fn invalidate(&self) -> Self {
        match self {
            Rotation::Reversing {
                live,
                front,
                rev_front,
                back,
                rev_back,
            } => Rotation::Reversing {
                live: live.saturating_sub(1),
                front: front.clone(),
                rev_front: rev_front.clone(),
                back: back.clone(),
                rev_back: rev_back.clone(),
            },
            Rotation::Appending { live: 0, acc, .. } => Rotation::Done(acc.rest()),
            Rotation::Appending {
                live,
                rev_front,
                acc,
            } => Rotation::Appending {
                live: live - 1,
                rev_front: rev_front.clone(),
                acc: acc.clone(),
            },
            Rotation::Idle | Rotation::Done(_) => self.clone(),
        }
    }
}

/// FIFO queue with worst-case O(1) `push_back`, `first` and `rest`
/// (Hood-Melville rotation).
///
/// Recently pushed items sit newest-first in `back`. Once `back` outgrows
/// the front, a rotation starts that rebuilds `front ++ reverse(back)` two
/// steps per operation, finishing before the old front runs out. No single
/// operation walks a whole list, so a pop inside a CAS retry loop costs the
/// same as a push and cannot be starved by producers.
///
/// Items given to [`prepend`](PersistentQueue::prepend) bypass the rotation
/// in a separate list that is always dequeued first.
pub struct PersistentQueue<T> {
    jumped: PersistentList<T>,
    front_len: usize,
    front: PersistentList<T>,
    rotation: Rotation<T>,
    back: PersistentList<T>,
}

impl<T> PersistentQueue<T> {
    pub const fn new() -> Self {
        Self {
            jumped: PersistentList::new(),
            front_len: 0,
            front: PersistentList::new(),
            rotation: Rotation::Idle,
            back: PersistentList::new(),
        }
    }

    /// New queue with `value` at the head, ahead of everything queued. O(1).
    pub fn prepend(&self, value: T) -> Self {
        Self {
            jumped: self.jumped.prepend(value),
            ..self.clone()
        }
    }

    pub fn first(&self) -> Option<&T> {
        match self.jumped.first() {
            Some(value) => Some(value),
            None if self.front_len == 0 => None,
            None => self.front.first(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.jumped.is_empty() && self.front_len == 0
    }

    pub fn len(&self) -> usize {
        self.jumped.len() + self.front_len + self.back.len()
    }
}

impl<T: Clone> PersistentQueue<T> {
    /// New queue with `value` at the tail. O(1).
    pub fn push_back(&self, value: T) -> Self {
        Self::settle(
            self.jumped.clone(),
            self.front_len,
            self.front.clone(),
            self.rotation.clone(),
            self.back.prepend(value),
        )
    }

    /// Queue without its head; empty for an empty queue. O(1).
    pub fn rest(&self) -> Self {
        if !self.jumped.is_empty() {
            return Self {
                jumped: self.jumped.rest(),
                ..self.clone()
            };
        }
        if self.front_len == 0 {
            return self.clone();
        }
        Self::settle(
            PersistentList::new(),
            self.front_len - 1,
            self.front.rest(),
            self.rotation.invalidate(),
            self.back.clone(),
        )
    }

    /// Head and remainder in one step, or `None` when empty.
    pub fn pop_front(&self) -> Option<(T, Self)> {
        let head = self.first()?.clone();
        Some((head, self.rest()))
    }

    /// Items in dequeue order. Each step is one O(1) pop on a private copy.
    pub fn iter(&self) -> QueueIter<T> {
        QueueIter {
            remaining: self.clone(),
        }
    }

    // Start a rotation when `back` outgrows the front, then advance the
    // running one by two steps.
    fn settle(
        jumped: PersistentList<T>,
        mut front_len: usize,
        mut front: PersistentList<T>,
        mut rotation: Rotation<T>,
        mut back: PersistentList<T>,
    ) -> Self {
        if back.len() > front_len {
            front_len += back.len();
            rotation = Rotation::Reversing {
                live: 0,
                front: front.clone(),
                rev_front: PersistentList::new(),
                back,
                rev_back: PersistentList::new(),
            };
            back = PersistentList::new();
        }

        match rotation.step().step() {
            Rotation::Done(rebuilt) => {
                front = rebuilt;
                rotation = Rotation::Idle;
            }
            advanced => rotation = advanced,
        }

        Self {
            jumped,
            front_len,
            front,
            rotation,
            back,
        }
    }
}

pub struct QueueIter<T> {
    remaining: PersistentQueue<T>,
}

impl<T: Clone> Iterator for QueueIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let (head, rest) = self.remaining.pop_front()?;
        self.remaining = rest;
        Some(head)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.remaining.len();
        (len, Some(len))
    }
}

impl<T> Clone for PersistentQueue<T> {
    fn clone(&self) -> Self {
        Self {
            jumped: self.jumped.clone(),
            front_len: self.front_len,
            front: self.front.clone(),
            rotation: self.rotation.clone(),
            back: self.back.clone(),
        }
    }
}

impl<T> Default for PersistentQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + fmt::Debug> fmt::Debug for PersistentQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T: Clone> FromIterator<T> for PersistentQueue<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::new(), |acc, value| acc.push_back(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::AtomicReference;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn list_prepend_first_rest() {
        let empty = PersistentList::new();
        assert!(empty.is_empty());
        assert_eq!(empty.first(), None);
        assert!(empty.rest().is_empty());

        let one = empty.prepend(1);
        let two = one.prepend(2);
        assert_eq!(two.first(), Some(&2));
        assert_eq!(two.len(), 2);
        assert!(two.rest().ptr_eq(&one));

        // older versions are untouched
        assert!(empty.is_empty());
        assert_eq!(one.iter().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn list_from_iter_keeps_order() {
        let list: PersistentList<_> = (1..=4).collect();
        assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(list.reversed().first(), Some(&4));
        assert_eq!(format!("{:?}", list), "[1, 2, 3, 4]");
    }

    #[test]
    fn long_list_drops_without_overflow() {
        let mut list = PersistentList::new();
        for i in 0..500_000 {
            list = list.prepend(i);
        }
        assert_eq!(list.len(), 500_000);
        drop(list);
    }

    #[test]
    fn shared_tail_survives_drop_of_newer_version() {
        let base: PersistentList<_> = (0..3).collect();
        let longer = base.prepend(99);
        drop(longer);
        assert_eq!(base.iter().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn queue_is_fifo() {
        let q: PersistentQueue<_> = (1..=5).collect();
        assert_eq!(q.len(), 5);

        let mut drained = Vec::new();
        let mut cur = q.clone();
        while let Some((head, rest)) = cur.pop_front() {
            drained.push(head);
            cur = rest;
        }
        assert_eq!(drained, vec![1, 2, 3, 4, 5]);
        assert!(cur.is_empty());

        // the original is unchanged
        assert_eq!(q.iter().collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn queue_interleaved_push_and_pop() {
        let q = PersistentQueue::new().push_back('a').push_back('b');
        let (a, q) = q.pop_front().unwrap();
        let q = q.push_back('c');
        let (b, q) = q.pop_front().unwrap();
        let (c, q) = q.pop_front().unwrap();
        assert_eq!((a, b, c), ('a', 'b', 'c'));
        assert!(q.pop_front().is_none());
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn queue_prepend_jumps_the_line() {
        let q = PersistentQueue::new().push_back(2).push_back(3).prepend(1);
        assert_eq!(q.first(), Some(&1));
        assert_eq!(q.iter().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(format!("{:?}", q), "[1, 2, 3]");
        assert_eq!(q.rest().first(), Some(&2));
    }

    #[test]
    fn queue_matches_vecdeque_under_mixed_operations() {
        // small LCG so the sequence is reproducible without extra crates
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = move || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) as u32
        };

        let mut queue = PersistentQueue::new();
        let mut model = VecDeque::new();
        let mut snapshots = Vec::new();
        for n in 0..5_000u32 {
            match next() % 20 {
                0 => {
                    queue = queue.prepend(n);
                    model.push_front(n);
                }
                1..=10 => {
                    queue = queue.push_back(n);
                    model.push_back(n);
                }
                _ => {
                    assert_eq!(queue.first(), model.front());
                    queue = queue.rest();
                    model.pop_front();
                }
            }
            assert_eq!(queue.len(), model.len());
            assert_eq!(queue.is_empty(), model.is_empty());
            if n % 97 == 0 {
                snapshots.push((queue.clone(), model.clone()));
            }
        }

        // every older version still drains to what it held at the time
        for (old, expected) in snapshots {
            assert_eq!(old.iter().collect::<Vec<_>>(), expected.into_iter().collect::<Vec<_>>());
        }
    }

    #[test]
    fn pops_mid_rotation_leave_older_versions_intact() {
        let base: PersistentQueue<_> = (0..7).collect();
        let popped = base.rest().rest();
        let grown = popped.push_back(7).push_back(8);
        assert_eq!(base.iter().collect::<Vec<_>>(), (0..7).collect::<Vec<_>>());
        assert_eq!(popped.iter().collect::<Vec<_>>(), (2..7).collect::<Vec<_>>());
        assert_eq!(grown.iter().collect::<Vec<_>>(), (2..9).collect::<Vec<_>>());
    }

    #[test]
    fn long_queue_drops_without_overflow() {
        let q: PersistentQueue<_> = (0..300_000).collect();
        assert_eq!(q.len(), 300_000);
        assert_eq!(q.first(), Some(&0));
        drop(q);
    }

    #[test]
    fn pop_wins_while_producers_keep_pushing() {
        let queue: PersistentQueue<usize> = (0..200_000).collect();
        let atom = Arc::new(AtomicReference::new(queue));
        let stop = Arc::new(AtomicBool::new(false));
        let pushes = Arc::new(AtomicUsize::new(0));
        let cap = 1_000_000;

        let producers: Vec<_> = (0..3)
            .map(|_| {
                let atom = Arc::clone(&atom);
                let stop = Arc::clone(&stop);
                let pushes = Arc::clone(&pushes);
                thread::spawn(move || {
                    let mut n = 0;
                    while !stop.load(Ordering::SeqCst) && n < cap {
                        atom.swap(|q| q.push_back(usize::MAX));
                        pushes.fetch_add(1, Ordering::SeqCst);
                        n += 1;
                    }
                })
            })
            .collect();

        // let the producers get going before popping
        while pushes.load(Ordering::SeqCst) < 1_000 {
            thread::yield_now();
        }

        let mut popped = Vec::new();
        for _ in 0..1_000 {
            let mut head = None;
            atom.swap(|q| match q.pop_front() {
                Some((value, rest)) => {
                    head = Some(value);
                    rest
                }
                None => {
                    head = None;
                    q.clone()
                }
            });
            popped.extend(head);
        }
        // if the pops had been starved, the producers would have hit their cap
        let pushed_while_popping = pushes.load(Ordering::SeqCst);
        stop.store(true, Ordering::SeqCst);
        for producer in producers {
            producer.join().unwrap();
        }

        assert_eq!(popped, (0..1_000).collect::<Vec<_>>());
        assert!(pushed_while_popping < 3 * cap);
    }
}
