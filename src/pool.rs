//! Item Vault - Thumbnail Pool Allocator
//!
//! Thumbnails are batched into pools: one image file holding a grid of
//! `rows x columns` slots. Each pool carries an allocation bitmap with one byte
//! per row, bit `i` (from the LSB) set when column `i` is occupied.
//!
//! Pools are never deleted, even when every slot is free again.

use serde::Serialize;
use uuid::Uuid;

use crate::model::{ImageSlot, PoolRecord};
use crate::tracker::ModificationTracker;

/// Grid shape of every pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolGeometry {
    pub rows: usize,
    pub columns: usize,
}

impl Default for PoolGeometry {
    fn default() -> Self {
        Self { rows: 8, columns: 8 }
    }
}

impl PoolGeometry {
    pub fn capacity(&self) -> usize {
        self.rows * self.columns
    }

    /// Bitmap value of a fully occupied row
    fn full_row(&self) -> u8 {
        if self.columns >= 8 {
            u8::MAX
        } else {
            (1u8 << self.columns) - 1
        }
    }

    /// (row, column) of a slot index
    pub fn locate(&self, index: u32) -> (usize, usize) {
        let index = index as usize;
        (index / self.columns, index % self.columns)
    }
}

/// Result of a slot allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAllocation {
    pub slot: ImageSlot,
    /// A new, empty pool was created for this slot
    pub created: bool,
}

/// Occupancy of one pool, as exposed to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolAllocation {
    pub name: String,
    pub occupied: Vec<bool>,
}

/// Pool directory in creation order
#[derive(Debug, Clone)]
pub struct ImagePoolAllocator {
    geometry: PoolGeometry,
    pools: Vec<PoolRecord>,
}

impl ImagePoolAllocator {
    pub fn new(geometry: PoolGeometry) -> Self {
        Self {
            geometry,
            pools: Vec::new(),
        }
    }

    /// Rebuild from persisted records, normalising bitmap lengths to the geometry
    pub fn from_records(geometry: PoolGeometry, records: Vec<PoolRecord>) -> Self {
        let pools = records
            .into_iter()
            .map(|mut record| {
                if record.bitmap.len() != geometry.rows {
                    log::warn!(
                        "Pool {} has {} bitmap rows, expected {}",
                        record.name,
                        record.bitmap.len(),
                        geometry.rows
                    );
                    record.bitmap.resize(geometry.rows, 0);
                }
                record
            })
            .collect();
        Self { geometry, pools }
    }

    pub fn geometry(&self) -> PoolGeometry {
        self.geometry
    }

    pub fn records(&self) -> &[PoolRecord] {
        &self.pools
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pools.iter().any(|pool| pool.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pools.iter().map(|pool| pool.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Whether `slot` points at an occupied slot of a known pool
    pub fn is_allocated(&self, slot: &ImageSlot) -> bool {
        if slot.index as usize >= self.geometry.capacity() {
            return false;
        }
        let (row, column) = self.geometry.locate(slot.index);
        self.pools
            .iter()
            .find(|pool| pool.name == slot.name)
            .map_or(false, |pool| pool.bitmap[row] & (1u8 << column) != 0)
    }

    /// Number of occupied slots across all pools
    pub fn occupied_count(&self) -> usize {
        self.pools
            .iter()
            .flat_map(|pool| pool.bitmap.iter())
            .map(|row| row.count_ones() as usize)
            .sum()
    }

    /// Take the lowest free slot, creating a pool when all are full
    ///
    /// Scans pools in creation order, rows from the first byte, columns from the
    /// lowest bit. Never fails. Marks the owning pool and the core record dirty.
    pub fn allocate_slot(&mut self, tracker: &mut ModificationTracker) -> SlotAllocation {
        tracker.mark_core_dirty();

        let full_row = self.geometry.full_row();
        for pool in self.pools.iter_mut() {
            let free = pool
                .bitmap
                .iter()
                .enumerate()
                .find(|(_, row)| **row & full_row != full_row);
            if let Some((row, &value)) = free {
                let column = (0..self.geometry.columns)
                    .find(|&column| value & (1u8 << column) == 0)
                    .unwrap_or(0);
                pool.bitmap[row] |= 1 << column;
                tracker.mark_images_dirty([pool.name.clone()]);
                return SlotAllocation {
                    slot: ImageSlot {
                        name: pool.name.clone(),
                        index: (row * self.geometry.columns + column) as u32,
                    },
                    created: false,
                };
            }
        }

        let name = self.fresh_name();
        let mut bitmap = vec![0u8; self.geometry.rows];
        bitmap[0] = 1;
        log::debug!("Created thumbnail pool {}", name);
        self.pools.push(PoolRecord {
            name: name.clone(),
            bitmap,
        });
        tracker.mark_images_dirty([name.clone()]);
        SlotAllocation {
            slot: ImageSlot { name, index: 0 },
            created: true,
        }
    }

    /// Clear a slot; returns whether it was occupied
    ///
    /// The pool image itself is untouched, only the bitmap in the core record
    /// changes.
    pub fn free_slot(&mut self, slot: &ImageSlot, tracker: &mut ModificationTracker) -> bool {
        if slot.index as usize >= self.geometry.capacity() {
            return false;
        }
        let (row, column) = self.geometry.locate(slot.index);
        let Some(pool) = self.pools.iter_mut().find(|pool| pool.name == slot.name) else {
            return false;
        };
        let mask = 1u8 << column;
        if pool.bitmap[row] & mask == 0 {
            return false;
        }
        pool.bitmap[row] &= !mask;
        tracker.mark_core_dirty();
        true
    }

    /// Pools the next `count` allocations would land in
    ///
    /// `None` marks an allocation that would create a new pool.
    pub fn plan_allocations(&self, count: usize) -> Vec<Option<String>> {
        let full_row = self.geometry.full_row();
        let mut plan = Vec::with_capacity(count);
        for pool in &self.pools {
            let free: usize = pool
                .bitmap
                .iter()
                .map(|row| (!(*row) & full_row).count_ones() as usize)
                .sum();
            for _ in 0..free {
                if plan.len() == count {
                    return plan;
                }
                plan.push(Some(pool.name.clone()));
            }
        }
        plan.resize(count, None);
        plan
    }

    /// Occupancy per pool, slot by slot in row-major order
    pub fn query_allocation(&self) -> Vec<PoolAllocation> {
        self.pools
            .iter()
            .map(|pool| PoolAllocation {
                name: pool.name.clone(),
                occupied: pool
                    .bitmap
                    .iter()
                    .flat_map(|&row| {
                        (0..self.geometry.columns).map(move |column| row & (1u8 << column) != 0)
                    })
                    .collect(),
            })
            .collect()
    }

    fn fresh_name(&self) -> String {
        loop {
            let name = Uuid::new_v4().to_string();
            if !self.contains(&name) {
                return name;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> PoolGeometry {
        PoolGeometry { rows: 2, columns: 3 }
    }

    #[test]
    fn test_first_allocation_creates_pool() {
        let mut tracker = ModificationTracker::new();
        let mut allocator = ImagePoolAllocator::new(PoolGeometry::default());

        let first = allocator.allocate_slot(&mut tracker);
        assert!(first.created);
        assert_eq!(first.slot.index, 0);
        assert_eq!(allocator.records()[0].bitmap, vec![1, 0, 0, 0, 0, 0, 0, 0]);
        assert!(tracker.is_unsaved());
        assert_eq!(tracker.current().images[&first.slot.name], 1);
    }

    #[test]
    fn test_n_allocations_set_n_bits_in_order() {
        let mut tracker = ModificationTracker::new();
        let mut allocator = ImagePoolAllocator::new(small());

        let slots: Vec<_> = (0..14).map(|_| allocator.allocate_slot(&mut tracker)).collect();
        assert_eq!(allocator.occupied_count(), 14);
        assert_eq!(allocator.len(), 3);

        let first_pool = &slots[0].slot.name;
        for (n, allocation) in slots.iter().enumerate().take(6) {
            assert_eq!(&allocation.slot.name, first_pool);
            assert_eq!(allocation.slot.index as usize, n);
        }
        assert!(slots[6].created);
        assert_eq!(slots[13].slot.index, 1);
    }

    #[test]
    fn test_freed_slot_is_reused_first() {
        let mut tracker = ModificationTracker::new();
        let mut allocator = ImagePoolAllocator::new(small());
        let slots: Vec<_> = (0..8).map(|_| allocator.allocate_slot(&mut tracker).slot).collect();

        assert!(allocator.free_slot(&slots[4], &mut tracker));
        assert!(!allocator.free_slot(&slots[4], &mut tracker));
        assert!(!allocator.is_allocated(&slots[4]));

        let again = allocator.allocate_slot(&mut tracker);
        assert_eq!(again.slot, slots[4]);
        assert_eq!(allocator.len(), 2);
    }

    #[test]
    fn test_empty_pool_is_kept() {
        let mut tracker = ModificationTracker::new();
        let mut allocator = ImagePoolAllocator::new(small());
        let slot = allocator.allocate_slot(&mut tracker).slot;
        allocator.free_slot(&slot, &mut tracker);
        assert_eq!(allocator.len(), 1);
        assert_eq!(allocator.occupied_count(), 0);
    }

    #[test]
    fn test_plan_matches_allocation() {
        let mut tracker = ModificationTracker::new();
        let mut allocator = ImagePoolAllocator::new(small());
        for _ in 0..5 {
            allocator.allocate_slot(&mut tracker);
        }
        let pool = allocator.records()[0].name.clone();
        assert_eq!(allocator.plan_allocations(3), vec![Some(pool), None, None]);
    }

    #[test]
    fn test_query_allocation_bits() {
        let allocator = ImagePoolAllocator::from_records(
            small(),
            vec![PoolRecord {
                name: "p".into(),
                bitmap: vec![0b101, 0b010],
            }],
        );
        assert_eq!(
            allocator.query_allocation(),
            vec![PoolAllocation {
                name: "p".into(),
                occupied: vec![true, false, true, false, true, false],
            }]
        );
        assert!(allocator.is_allocated(&ImageSlot { name: "p".into(), index: 4 }));
        assert!(!allocator.is_allocated(&ImageSlot { name: "p".into(), index: 3 }));
        assert!(!allocator.is_allocated(&ImageSlot { name: "q".into(), index: 0 }));
    }
}
