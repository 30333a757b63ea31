//! The entity database: identity index, table set, and schema transitions.

use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::rc::Rc;

use log::{debug, trace};
use strata_memory::{ColumnAllocator, SystemAllocator};

use crate::component::{column_name, hash_name, ComponentDescriptor, ComponentRegistry, ID_COLUMN};
use crate::entity::{EntityId, EntityIds, EntityLocation};
use crate::error::StoreError;
use crate::query::{Query, QueryIter};
use crate::table::ArchetypeTable;

/// Identity key of the void archetype in the tables map.
///
/// Deliberately not the canonical column hash of the bare-id schema: the
/// void table is reserved for freshly spawned entities, and hash folds that
/// arrive at the bare-id schema key a separate table.
const VOID_ARCHETYPE_HASH: u64 = u64::MAX;

/// An in-memory database of entities, partitioned into one dense table per
/// distinct component set.
///
/// All mutation goes through the store: it locates an entity's row via the
/// index, relocates the row between tables when the entity's component set
/// changes, and keeps the index consistent with every swap-remove along the
/// way.
///
/// Single-threaded by design; the store is neither `Send` nor `Sync`.
pub struct EntityStore {
    registry: ComponentRegistry,
    ids: EntityIds,
    index: HashMap<EntityId, EntityLocation>,
    // Insertion-ordered so a table index stays valid while the store lives;
    // `table_ids` maps a schema's identity hash to its position here.
    tables: Vec<ArchetypeTable>,
    table_ids: HashMap<u64, usize>,
    alloc: Rc<dyn ColumnAllocator>,
}

impl EntityStore {
    pub fn new(registry: ComponentRegistry) -> Self {
        Self::with_allocator(registry, Rc::new(SystemAllocator))
    }

    pub fn with_allocator(registry: ComponentRegistry, alloc: Rc<dyn ColumnAllocator>) -> Self {
        let void = ArchetypeTable::new(vec![ComponentDescriptor::id()]);
        let mut table_ids = HashMap::new();
        table_ids.insert(VOID_ARCHETYPE_HASH, 0);
        Self {
            registry,
            ids: EntityIds::new(),
            index: HashMap::new(),
            tables: vec![void],
            table_ids,
            alloc,
        }
    }

    /// Creates an entity with no components. It lives in the void archetype
    /// until a component is set.
    pub fn spawn(&mut self) -> Result<EntityId, StoreError> {
        let entity = self.ids.alloc();
        let row = self.tables[0].append_undefined(&*self.alloc)?;
        self.tables[0].set_typed(row, ID_COLUMN, entity);
        self.index.insert(entity, EntityLocation { table: 0, row });
        trace!("spawned {entity:?} at row {row} of the void archetype");
        Ok(entity)
    }

    /// Removes an entity and all its components. Panics if the entity is not
    /// present.
    pub fn despawn(&mut self, entity: EntityId) {
        let location = self.location(entity);
        let table = &mut self.tables[location.table];

        let last = table.len() - 1;
        if location.row != last {
            let displaced = table.entity_at(last);
            self.index.insert(displaced, location);
        }
        table.swap_remove(location.row);
        self.index.remove(&entity);
        trace!("despawned {entity:?} from table {}", location.table);
    }

    /// Sets a component on an entity.
    ///
    /// If the entity's table already carries the column this is an in-place
    /// write; otherwise the entity's row is relocated to the table for the
    /// grown component set, creating that table on first demand.
    pub fn set_component<T: Copy + 'static>(
        &mut self,
        entity: EntityId,
        namespace: &str,
        component: &str,
        value: T,
    ) -> Result<(), StoreError> {
        let location = self.location(entity);
        let descriptor = self.descriptor_for::<T>(namespace, component);

        let src = &mut self.tables[location.table];
        if src.has_component(&descriptor.name) {
            src.set_typed(location.row, &descriptor.name, value);
            return Ok(());
        }

        let estimate = src.hash() ^ hash_name(&descriptor.name);
        let mut grown = src.descriptors();
        grown.push(descriptor.clone());

        let (dest_index, dest_row) = self.transition(entity, location, grown, estimate)?;
        self.tables[dest_index].set_typed(dest_row, &descriptor.name, value);
        Ok(())
    }

    /// Removes a component from an entity. A no-op (and no allocation) if
    /// the entity does not carry it.
    pub fn remove_component(
        &mut self,
        entity: EntityId,
        namespace: &str,
        component: &str,
    ) -> Result<(), StoreError> {
        let location = self.location(entity);
        let name = column_name(namespace, component);

        let src = &self.tables[location.table];
        let Some(removed) = src.column_index(&name) else {
            return Ok(());
        };

        let mut shrunk = src.descriptors();
        shrunk.remove(removed);
        let estimate = shrunk.iter().fold(0, |acc, d| acc ^ hash_name(&d.name));
        debug_assert_ne!(estimate, src.hash());

        self.transition(entity, location, shrunk, estimate)?;
        Ok(())
    }

    /// Copy of the entity's component value, or `None` if the entity does
    /// not carry it.
    pub fn get_component<T: Copy + 'static>(
        &self,
        entity: EntityId,
        namespace: &str,
        component: &str,
    ) -> Option<T> {
        let location = self.location(entity);
        self.tables[location.table].get_typed(location.row, &column_name(namespace, component))
    }

    /// The table currently holding the entity's row.
    pub fn archetype_of(&self, entity: EntityId) -> &ArchetypeTable {
        &self.tables[self.location(entity).table]
    }

    /// The entity's current physical location. Invalidated by schema
    /// transitions and removals in the same table.
    pub fn location_of(&self, entity: EntityId) -> EntityLocation {
        self.location(entity)
    }

    pub fn contains(&self, entity: EntityId) -> bool {
        self.index.contains_key(&entity)
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Every table in insertion order; table 0 is the void archetype.
    pub fn tables(&self) -> &[ArchetypeTable] {
        &self.tables
    }

    /// The identity keys of the tables map.
    pub fn table_hashes(&self) -> impl Iterator<Item = u64> + '_ {
        self.table_ids.keys().copied()
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    /// Tables matching `query`, in insertion order, skipping the void
    /// archetype and empty tables.
    pub fn query<'a>(&'a self, query: &'a Query) -> QueryIter<'a> {
        QueryIter::new(&self.tables, query)
    }

    fn location(&self, entity: EntityId) -> EntityLocation {
        *self
            .index
            .get(&entity)
            .unwrap_or_else(|| panic!("{entity:?} is not present in this store"))
    }

    fn descriptor_for<T: Copy + 'static>(
        &self,
        namespace: &str,
        component: &str,
    ) -> ComponentDescriptor {
        let descriptor = self.registry.expect(namespace, component);
        assert!(
            descriptor.token == TypeId::of::<T>(),
            "component {} registered as {} but accessed as {}",
            descriptor.name,
            descriptor.type_name,
            type_name::<T>(),
        );
        descriptor.clone()
    }

    /// Relocates an entity's row to the table for `descriptors`, creating
    /// that table if needed. Returns the destination (table, row).
    ///
    /// The destination row's shared columns are copies of the source row;
    /// a column only present in the destination is left undefined for the
    /// caller to fill. On allocation failure every intermediate step is
    /// rolled back and the store is unchanged.
    fn transition(
        &mut self,
        entity: EntityId,
        from: EntityLocation,
        descriptors: Vec<ComponentDescriptor>,
        estimate: u64,
    ) -> Result<(usize, usize), StoreError> {
        let (dest_index, created) = self.ensure_table(descriptors, estimate);

        // The tables vec may have grown; resolve tables by index from here on.
        let dest_row = match self.tables[dest_index].append_undefined(&*self.alloc) {
            Ok(row) => row,
            Err(e) => {
                if created {
                    self.discard_last_table();
                }
                return Err(e.into());
            }
        };

        let (src, dest) = pair_mut(&mut self.tables, from.table, dest_index);
        for (index, column) in src.columns().iter().enumerate() {
            if let Some(dest_column) = dest.column_index(column.name()) {
                dest.set_raw(dest_row, dest_column, src.get_raw(from.row, index));
            }
        }

        let last = src.len() - 1;
        if from.row != last {
            let displaced = src.entity_at(last);
            src.swap_remove(from.row);
            self.index.insert(displaced, from);
        } else {
            src.swap_remove(from.row);
        }
        self.index.insert(
            entity,
            EntityLocation {
                table: dest_index,
                row: dest_row,
            },
        );
        trace!(
            "relocated {entity:?} from ({}, {}) to ({dest_index}, {dest_row})",
            from.table,
            from.row,
        );
        Ok((dest_index, dest_row))
    }

    /// Index of the table for `descriptors`, creating it if needed; the
    /// second result says whether this call created it.
    ///
    /// `estimate` is the incrementally folded hash. The tables map is always
    /// keyed by the canonical hash of the sorted column set, which can
    /// disagree with the estimate: the void archetype sits under a sentinel
    /// key, so folds starting from its hash miss and are re-keyed here.
    fn ensure_table(&mut self, descriptors: Vec<ComponentDescriptor>, estimate: u64) -> (usize, bool) {
        if let Some(&index) = self.table_ids.get(&estimate) {
            return (index, false);
        }

        let table = ArchetypeTable::new(descriptors);
        let canonical = table.hash();
        if canonical != estimate {
            if let Some(&index) = self.table_ids.get(&canonical) {
                return (index, false);
            }
            debug!("archetype hash estimate {estimate:#018x} re-keyed to {canonical:#018x}");
        }

        let index = self.tables.len();
        debug!(
            "created archetype table {index} ({canonical:#018x}, {} columns)",
            table.columns().len(),
        );
        self.tables.push(table);
        self.table_ids.insert(canonical, index);
        (index, true)
    }

    /// Rolls back a table created earlier in the same operation. It is the
    /// last entry and holds no rows.
    fn discard_last_table(&mut self) {
        let mut table = self.tables.pop().expect("a table was just created");
        debug_assert!(table.is_empty());
        self.table_ids.remove(&table.hash());
        table.release(&*self.alloc);
    }
}

impl Drop for EntityStore {
    fn drop(&mut self) {
        let alloc = Rc::clone(&self.alloc);
        for table in &mut self.tables {
            table.release(&*alloc);
        }
    }
}

/// Mutable access to two distinct tables at once.
fn pair_mut(
    tables: &mut [ArchetypeTable],
    a: usize,
    b: usize,
) -> (&mut ArchetypeTable, &mut ArchetypeTable) {
    debug_assert_ne!(a, b);
    if a < b {
        let (left, right) = tables.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = tables.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}
