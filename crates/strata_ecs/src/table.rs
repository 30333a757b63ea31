//! Dense, column-oriented storage for one archetype.
//!
//! Every entity whose component set matches the table's column set occupies
//! one row; each column is a single raw byte buffer holding that component
//! for every row. All columns share `len` and `capacity`, so a row index is
//! valid across the whole table.

use std::alloc::Layout;
use std::any::{type_name, TypeId};
use std::ptr::{self, NonNull};
use std::slice;

use strata_memory::{AllocError, ColumnAllocator};

use crate::component::{hash_name, ComponentDescriptor, ID_COLUMN};
use crate::entity::EntityId;

/// One component type across every row of a table.
pub struct Column {
    descriptor: ComponentDescriptor,
    // Dangling (but aligned) until the first capacity growth, and forever for
    // zero-sized components.
    data: NonNull<u8>,
}

impl Column {
    fn new(descriptor: ComponentDescriptor) -> Self {
        let data = NonNull::new(descriptor.align as *mut u8).expect("alignment is never zero");
        Self { descriptor, data }
    }

    pub fn descriptor(&self) -> &ComponentDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn layout(&self, rows: usize) -> Layout {
        Layout::from_size_align(self.descriptor.size * rows, self.descriptor.align)
            .expect("column layout overflows")
    }

    /// # Safety
    /// `row` must be within the current capacity.
    unsafe fn cell_ptr(&self, row: usize) -> *mut u8 {
        unsafe { self.data.as_ptr().add(row * self.descriptor.size) }
    }
}

/// The physical storage for one archetype.
pub struct ArchetypeTable {
    columns: Vec<Column>,
    len: usize,
    capacity: usize,
    hash: u64,
}

impl ArchetypeTable {
    /// Builds an empty table over `descriptors`.
    ///
    /// The id column is placed first and the remaining columns are sorted by
    /// type token (ties broken by name), giving every schema a canonical
    /// column order. The table hash is computed over the resulting set.
    pub(crate) fn new(mut descriptors: Vec<ComponentDescriptor>) -> Self {
        descriptors.sort_by(|a, b| {
            (a.name.as_str() != ID_COLUMN, a.token, a.name.as_str()).cmp(&(
                b.name.as_str() != ID_COLUMN,
                b.token,
                b.name.as_str(),
            ))
        });
        debug_assert_eq!(
            descriptors.first().map(|d| d.name.as_str()),
            Some(ID_COLUMN),
            "every table carries the id column",
        );

        let mut table = Self {
            columns: descriptors.into_iter().map(Column::new).collect(),
            len: 0,
            capacity: 0,
            hash: 0,
        };
        table.recompute_hash();
        table
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Identity hash: the xor-fold of [`hash_name`] over every column name.
    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.descriptor.name == name)
    }

    pub fn has_component(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn has_components<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> bool {
        names.into_iter().all(|name| self.has_component(name))
    }

    /// Id of the entity stored at `row`.
    pub fn entity_at(&self, row: usize) -> EntityId {
        self.get_typed::<EntityId>(row, ID_COLUMN)
            .expect("id column is always present")
    }

    pub(crate) fn recompute_hash(&mut self) -> u64 {
        self.hash = self
            .columns
            .iter()
            .fold(0, |acc, c| acc ^ hash_name(&c.descriptor.name));
        self.hash
    }

    pub(crate) fn descriptors(&self) -> Vec<ComponentDescriptor> {
        self.columns.iter().map(|c| c.descriptor.clone()).collect()
    }

    fn grown_capacity(mut capacity: usize, needed: usize) -> usize {
        while capacity < needed {
            capacity = capacity.saturating_add(capacity / 2).saturating_add(8);
        }
        capacity
    }

    /// Ensures capacity for `additional` rows beyond `len`.
    ///
    /// All column buffers grow together: the new buffers are acquired first,
    /// so a failed allocation frees them again and leaves the table
    /// untouched.
    pub fn reserve(
        &mut self,
        alloc: &dyn ColumnAllocator,
        additional: usize,
    ) -> Result<(), AllocError> {
        let needed = self.len + additional;
        if self.capacity >= needed {
            return Ok(());
        }
        let new_capacity = Self::grown_capacity(self.capacity, needed);

        let mut fresh: Vec<NonNull<u8>> = Vec::with_capacity(self.columns.len());
        let mut failed = None;
        for column in &self.columns {
            if column.descriptor.size == 0 {
                fresh.push(column.data);
                continue;
            }
            match alloc.allocate(column.layout(new_capacity)) {
                Ok(ptr) => fresh.push(ptr),
                Err(e) => {
                    failed = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failed {
            for (column, ptr) in self.columns.iter().zip(fresh) {
                if column.descriptor.size != 0 {
                    unsafe { alloc.deallocate(ptr, column.layout(new_capacity)) };
                }
            }
            return Err(e);
        }

        let old_capacity = self.capacity;
        for (column, ptr) in self.columns.iter_mut().zip(fresh) {
            if column.descriptor.size == 0 {
                continue;
            }
            unsafe {
                ptr::copy_nonoverlapping(
                    column.data.as_ptr(),
                    ptr.as_ptr(),
                    self.len * column.descriptor.size,
                );
                if old_capacity != 0 {
                    alloc.deallocate(column.data, column.layout(old_capacity));
                }
            }
            column.data = ptr;
        }
        self.capacity = new_capacity;
        Ok(())
    }

    /// Appends a row with unspecified contents, growing if needed.
    pub fn append_undefined(&mut self, alloc: &dyn ColumnAllocator) -> Result<usize, AllocError> {
        self.reserve(alloc, 1)?;
        let row = self.len;
        self.len += 1;
        Ok(row)
    }

    /// Reverts the immediately preceding `append_undefined`. Must not be
    /// separated from it by any other mutation.
    pub fn undo_append(&mut self) {
        debug_assert!(self.len > 0);
        self.len -= 1;
    }

    fn check_token<T: 'static>(&self, column: &Column) {
        assert!(
            column.descriptor.token == TypeId::of::<T>(),
            "type mismatch on column {:?}: stored {}, accessed as {}",
            column.descriptor.name,
            column.descriptor.type_name,
            type_name::<T>(),
        );
    }

    fn check_row(&self, row: usize) {
        assert!(row < self.len, "row {row} out of bounds (len {})", self.len);
    }

    /// Overwrites one cell. Panics if the column exists with a different
    /// type token; zero-sized writes are no-ops.
    pub fn set_typed<T: Copy + 'static>(&mut self, row: usize, name: &str, value: T) {
        self.check_row(row);
        let index = self
            .column_index(name)
            .unwrap_or_else(|| panic!("no column named {name:?}"));
        let column = &self.columns[index];
        self.check_token::<T>(column);
        if column.descriptor.size == 0 {
            return;
        }
        unsafe { ptr::write(column.cell_ptr(row).cast::<T>(), value) };
    }

    /// Copy of the cell value, or `None` if the table has no such column.
    pub fn get_typed<T: Copy + 'static>(&self, row: usize, name: &str) -> Option<T> {
        self.check_row(row);
        let column = &self.columns[self.column_index(name)?];
        self.check_token::<T>(column);
        Some(unsafe { ptr::read(column.cell_ptr(row).cast::<T>()) })
    }

    /// Borrow of one cell's bytes; valid until the next capacity change.
    pub fn get_raw(&self, row: usize, column: usize) -> &[u8] {
        self.check_row(row);
        let column = &self.columns[column];
        unsafe { slice::from_raw_parts(column.cell_ptr(row), column.descriptor.size) }
    }

    pub fn set_raw(&mut self, row: usize, column: usize, bytes: &[u8]) {
        self.check_row(row);
        let column = &self.columns[column];
        assert_eq!(
            bytes.len(),
            column.descriptor.size,
            "cell write size mismatch on column {:?}",
            column.descriptor.name,
        );
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), column.cell_ptr(row), bytes.len()) };
    }

    /// The live cells of one column as raw bytes; valid until the next
    /// capacity change.
    pub fn column_bytes(&self, name: &str) -> Option<&[u8]> {
        let column = &self.columns[self.column_index(name)?];
        Some(unsafe {
            slice::from_raw_parts(column.data.as_ptr(), self.len * column.descriptor.size)
        })
    }

    /// O(1) removal: overwrites `row` with the last row in every column and
    /// shrinks `len`.
    ///
    /// Does not touch any external index; the store fixes up the displaced
    /// row's identity.
    pub fn swap_remove(&mut self, row: usize) {
        self.check_row(row);
        let last = self.len - 1;
        if row != last {
            for column in &self.columns {
                let size = column.descriptor.size;
                if size == 0 {
                    continue;
                }
                unsafe { ptr::copy_nonoverlapping(column.cell_ptr(last), column.cell_ptr(row), size) };
            }
        }
        self.len = last;
    }

    /// Frees every column buffer. The owning store calls this on drop and
    /// when rolling back a freshly created table.
    pub(crate) fn release(&mut self, alloc: &dyn ColumnAllocator) {
        self.len = 0;
        if self.capacity == 0 {
            return;
        }
        for column in &mut self.columns {
            if column.descriptor.size == 0 {
                continue;
            }
            unsafe { alloc.deallocate(column.data, column.layout(self.capacity)) };
            column.data = NonNull::new(column.descriptor.align as *mut u8)
                .expect("alignment is never zero");
        }
        self.capacity = 0;
    }
}

#[cfg(test)]
mod tests {
    use strata_memory::SystemAllocator;

    use super::*;
    use crate::component::column_name;

    #[derive(Copy, Clone, Debug, PartialEq)]
    struct Vec3 {
        x: f32,
        y: f32,
        z: f32,
    }

    #[derive(Copy, Clone, Debug, PartialEq)]
    struct Marker;

    fn descriptors(extra: &[ComponentDescriptor]) -> Vec<ComponentDescriptor> {
        let mut all = vec![ComponentDescriptor::id()];
        all.extend(extra.iter().cloned());
        all
    }

    fn vec3_descriptor() -> ComponentDescriptor {
        ComponentDescriptor::of::<Vec3>(column_name("game", "location"))
    }

    #[test]
    fn id_column_is_first_and_hash_ignores_declaration_order() {
        let a = ComponentDescriptor::of::<f32>(column_name("game", "heat"));
        let b = ComponentDescriptor::of::<u32>(column_name("game", "score"));

        let forward = ArchetypeTable::new(descriptors(&[a.clone(), b.clone()]));
        let backward = ArchetypeTable::new(descriptors(&[b, a]));

        assert_eq!(forward.columns()[0].name(), ID_COLUMN);
        assert_eq!(backward.columns()[0].name(), ID_COLUMN);
        assert_eq!(forward.hash(), backward.hash());
        let names: Vec<_> = forward.columns().iter().map(Column::name).collect();
        let names_again: Vec<_> = backward.columns().iter().map(Column::name).collect();
        assert_eq!(names, names_again);
    }

    #[test]
    fn capacity_grows_by_half_plus_eight() {
        let alloc = SystemAllocator;
        let mut table = ArchetypeTable::new(descriptors(&[]));

        table.append_undefined(&alloc).unwrap();
        assert_eq!(table.capacity(), 8);

        for _ in 1..9 {
            table.append_undefined(&alloc).unwrap();
        }
        assert_eq!(table.len(), 9);
        assert_eq!(table.capacity(), 20);

        table.release(&alloc);
    }

    #[test]
    fn undo_append_reverts_length_only() {
        let alloc = SystemAllocator;
        let mut table = ArchetypeTable::new(descriptors(&[]));

        let row = table.append_undefined(&alloc).unwrap();
        assert_eq!(row, 0);
        table.undo_append();
        assert_eq!(table.len(), 0);
        assert_eq!(table.capacity(), 8);

        table.release(&alloc);
    }

    #[test]
    fn swap_remove_moves_the_last_row_in_every_column() {
        let alloc = SystemAllocator;
        let mut table = ArchetypeTable::new(descriptors(&[vec3_descriptor()]));
        let name = column_name("game", "location");

        for i in 0..3 {
            let row = table.append_undefined(&alloc).unwrap();
            table.set_typed(
                row,
                &name,
                Vec3 {
                    x: i as f32,
                    y: 0.0,
                    z: 0.0,
                },
            );
        }
        table.swap_remove(0);

        assert_eq!(table.len(), 2);
        let moved: Vec3 = table.get_typed(0, &name).unwrap();
        assert_eq!(moved.x, 2.0);

        table.release(&alloc);
    }

    #[test]
    fn has_components_checks_the_whole_set() {
        let a = ComponentDescriptor::of::<f32>(column_name("game", "heat"));
        let table = ArchetypeTable::new(descriptors(&[a, vec3_descriptor()]));

        assert!(table.has_components(["game.heat", "game.location", ID_COLUMN]));
        assert!(!table.has_components(["game.heat", "game.rotation"]));
    }

    #[test]
    fn zero_sized_columns_store_presence_without_bytes() {
        let alloc = SystemAllocator;
        let marker = ComponentDescriptor::of::<Marker>(column_name("game", "marker"));
        let mut table = ArchetypeTable::new(descriptors(&[marker]));
        let name = column_name("game", "marker");

        let row = table.append_undefined(&alloc).unwrap();
        table.set_typed(row, &name, Marker);

        assert!(table.has_component(&name));
        assert_eq!(table.get_typed::<Marker>(row, &name), Some(Marker));
        assert_eq!(table.column_bytes(&name).unwrap().len(), 0);

        table.release(&alloc);
    }

    #[test]
    #[should_panic(expected = "type mismatch")]
    fn mistyped_access_panics() {
        let alloc = SystemAllocator;
        let mut table = ArchetypeTable::new(descriptors(&[vec3_descriptor()]));
        let row = table.append_undefined(&alloc).unwrap();
        let _ = table.get_typed::<f32>(row, &column_name("game", "location"));
    }

    #[test]
    fn raw_access_round_trips_cell_bytes() {
        let alloc = SystemAllocator;
        let mut table = ArchetypeTable::new(descriptors(&[vec3_descriptor()]));
        let column = table.column_index(&column_name("game", "location")).unwrap();

        let row = table.append_undefined(&alloc).unwrap();
        let bytes = [7u8; size_of::<Vec3>()];
        table.set_raw(row, column, &bytes);
        assert_eq!(table.get_raw(row, column), &bytes[..]);

        table.release(&alloc);
    }
}
