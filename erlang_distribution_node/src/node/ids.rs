use std::sync::atomic::{AtomicU64, Ordering};

use crate::etf::{Atom, Pid, Reference};

const PID_ID_BITS: u32 = 15;
const PID_ID_MASK: u64 = (1 << PID_ID_BITS) - 1;
const PID_SERIAL_MASK: u64 = (1 << 13) - 1;
const REF_FIRST_MASK: u64 = (1 << 18) - 1;

/// Hands out pids and references for one node incarnation. Counters
/// wrap around once their wire fields are exhausted.
#[derive(Debug)]
pub struct IdGenerator {
    node: Atom,
    creation: u32,
    pids: AtomicU64,
    refs: AtomicU64,
}

impl IdGenerator {
    pub fn new(node: Atom, creation: u32) -> Self {
        IdGenerator {
            node,
            creation,
            pids: AtomicU64::new(1),
            refs: AtomicU64::new(1),
        }
    }

    pub fn next_pid(&self) -> Pid {
        let n = self.pids.fetch_add(1, Ordering::Relaxed);
        Pid::new(
            self.node.clone(),
            (n & PID_ID_MASK) as u32,
            ((n >> PID_ID_BITS) & PID_SERIAL_MASK) as u32,
            self.creation,
        )
    }

    pub fn next_reference(&self) -> Reference {
        let n = self.refs.fetch_add(1, Ordering::Relaxed);
        Reference {
            node: self.node.clone(),
            creation: self.creation,
            ids: vec![
                (n & REF_FIRST_MASK) as u32,
                (n >> 18) as u32,
                (n >> 50) as u32,
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn pids_are_unique_and_carry_the_identity() {
        let ids = IdGenerator::new(Atom::from("a@host"), 7);
        let pids: HashSet<Pid> = (0..1000).map(|_| ids.next_pid()).collect();
        assert_eq!(pids.len(), 1000);
        assert!(pids.iter().all(|pid| pid.node == "a@host"[..] && pid.creation == 7));
    }

    #[test]
    fn pid_ids_roll_over_into_the_serial() {
        let ids = IdGenerator::new(Atom::from("a@host"), 1);
        ids.pids.store(PID_ID_MASK, Ordering::Relaxed);
        let last = ids.next_pid();
        let next = ids.next_pid();
        assert_eq!((last.id, last.serial), (0x7fff, 0));
        assert_eq!((next.id, next.serial), (0, 1));

        ids.pids.store(1 << 28, Ordering::Relaxed);
        let wrapped = ids.next_pid();
        assert_eq!((wrapped.id, wrapped.serial), (0, 0));
    }

    #[test]
    fn references_spread_over_three_words() {
        let ids = IdGenerator::new(Atom::from("a@host"), 1);
        assert_eq!(ids.next_reference().ids, vec![1, 0, 0]);
        ids.refs.store(1 << 18, Ordering::Relaxed);
        assert_eq!(ids.next_reference().ids, vec![0, 1, 0]);
        assert_ne!(ids.next_reference(), ids.next_reference());
    }

    #[test]
    fn generators_are_independent() {
        let a = IdGenerator::new(Atom::from("a@host"), 1);
        let b = IdGenerator::new(Atom::from("b@host"), 1);
        assert_eq!(a.next_pid().id, b.next_pid().id);
    }
}
