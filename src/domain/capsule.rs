//! Capsule array (§3, §4.10): fixed-capacity, append-only on collapse,
//! compacted by swap-with-last on expand.

use crate::error::CallerError;
use crate::fixed::Aabb;

pub trait Capsule {
    fn capsule_id(&self) -> u64;
    fn bounds(&self) -> Aabb;
}

pub struct CapsuleArray<C> {
    capacity: usize,
    items: Vec<C>,
}

impl<C: Capsule> CapsuleArray<C> {
    pub fn new(capacity: usize) -> Self {
        CapsuleArray { capacity, items: Vec::with_capacity(capacity) }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a capsule. Fails if the array is already at capacity.
    pub fn push(&mut self, capsule: C) -> Result<(), CallerError> {
        if self.items.len() >= self.capacity {
            tracing::warn!(capacity = self.capacity, "capsule array full");
            return Err(CallerError::CapsuleArrayFull);
        }
        self.items.push(capsule);
        Ok(())
    }

    /// Remove by id via linear search, compacting with swap-with-last.
    /// Absent match returns an error but does not reorder the array.
    pub fn remove_by_id(&mut self, id: u64) -> Result<C, CallerError> {
        match self.items.iter().position(|c| c.capsule_id() == id) {
            Some(idx) => Ok(self.items.swap_remove(idx)),
            None => Err(CallerError::CapsuleNotFound(id)),
        }
    }

    pub fn get(&self, index: usize) -> Option<&C> {
        self.items.get(index)
    }

    /// Point-inside-bounds test, used by the pre-ladder "collapsed
    /// precedence" check (§4.2 step 4, §8 invariant).
    pub fn find_containing(&self, point: crate::fixed::Point) -> Option<&C> {
        self.items.iter().find(|c| c.bounds().contains(point))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::{Point, Q16};

    #[derive(Debug, Clone, PartialEq)]
    struct Dummy {
        id: u64,
        bounds: Aabb,
    }

    impl Capsule for Dummy {
        fn capsule_id(&self) -> u64 {
            self.id
        }
        fn bounds(&self) -> Aabb {
            self.bounds
        }
    }

    fn unit_bounds() -> Aabb {
        Aabb::new(
            Point::new(Q16::from_int(-1), Q16::from_int(-1), Q16::from_int(-1)),
            Point::new(Q16::from_int(1), Q16::from_int(1), Q16::from_int(1)),
        )
    }

    #[test]
    fn push_and_remove_round_trip_count() {
        let mut arr: CapsuleArray<Dummy> = CapsuleArray::new(4);
        let before = arr.len();
        arr.push(Dummy { id: 1, bounds: unit_bounds() }).unwrap();
        assert_eq!(arr.len(), before + 1);
        arr.remove_by_id(1).unwrap();
        assert_eq!(arr.len(), before);
    }

    #[test]
    fn remove_by_id_compacts_with_swap_remove_not_shift() {
        let mut arr: CapsuleArray<Dummy> = CapsuleArray::new(4);
        arr.push(Dummy { id: 1, bounds: unit_bounds() }).unwrap();
        arr.push(Dummy { id: 2, bounds: unit_bounds() }).unwrap();
        arr.push(Dummy { id: 3, bounds: unit_bounds() }).unwrap();
        arr.remove_by_id(1).unwrap();
        // swap_remove moves the last element (id 3) into slot 0
        assert_eq!(arr.get(0).unwrap().id, 3);
        assert_eq!(arr.len(), 2);
    }

    #[test]
    fn remove_missing_id_errors_without_reordering() {
        let mut arr: CapsuleArray<Dummy> = CapsuleArray::new(4);
        arr.push(Dummy { id: 1, bounds: unit_bounds() }).unwrap();
        arr.push(Dummy { id: 2, bounds: unit_bounds() }).unwrap();
        let err = arr.remove_by_id(99).unwrap_err();
        assert_eq!(err, CallerError::CapsuleNotFound(99));
        assert_eq!(arr.get(0).unwrap().id, 1);
        assert_eq!(arr.get(1).unwrap().id, 2);
    }

    #[test]
    fn push_past_capacity_fails() {
        let mut arr: CapsuleArray<Dummy> = CapsuleArray::new(1);
        arr.push(Dummy { id: 1, bounds: unit_bounds() }).unwrap();
        let err = arr.push(Dummy { id: 2, bounds: unit_bounds() }).unwrap_err();
        assert_eq!(err, CallerError::CapsuleArrayFull);
    }

    #[test]
    fn find_containing_respects_bounds() {
        let mut arr: CapsuleArray<Dummy> = CapsuleArray::new(4);
        arr.push(Dummy { id: 1, bounds: unit_bounds() }).unwrap();
        assert!(arr.find_containing(Point::ZERO).is_some());
        assert!(arr.find_containing(Point::new(Q16::from_int(5), Q16::ZERO, Q16::ZERO)).is_none());
    }
}
