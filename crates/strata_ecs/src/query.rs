//! Structural queries over the tables of an entity store.

use crate::component::column_name;
use crate::table::ArchetypeTable;

/// A query over component-name sets.
///
/// `All` is a conjunction: a table matches when it contains every component
/// named in every group. `Any` is a disjunction: a table matches when it
/// contains at least one of the named components.
#[derive(Clone, Debug)]
pub enum Query {
    All(Vec<Vec<String>>),
    Any(Vec<Vec<String>>),
}

impl Query {
    /// Conjunctive query over groups of `(namespace, component)` pairs.
    pub fn all(groups: &[&[(&str, &str)]]) -> Self {
        Self::All(canonicalise(groups))
    }

    /// Disjunctive query over groups of `(namespace, component)` pairs.
    pub fn any(groups: &[&[(&str, &str)]]) -> Self {
        Self::Any(canonicalise(groups))
    }

    pub(crate) fn matches(&self, table: &ArchetypeTable) -> bool {
        match self {
            Query::All(groups) => groups
                .iter()
                .all(|group| group.iter().all(|name| table.has_component(name))),
            Query::Any(groups) => groups
                .iter()
                .any(|group| group.iter().any(|name| table.has_component(name))),
        }
    }
}

fn canonicalise(groups: &[&[(&str, &str)]]) -> Vec<Vec<String>> {
    groups
        .iter()
        .map(|group| {
            group
                .iter()
                .map(|(namespace, component)| column_name(namespace, component))
                .collect()
        })
        .collect()
}

/// Walks the store's tables in insertion order, yielding every non-empty
/// table whose column set satisfies the query.
///
/// The void archetype (table 0) is never yielded. The iterator borrows the
/// store, so no mutation can occur while it lives.
pub struct QueryIter<'a> {
    tables: &'a [ArchetypeTable],
    query: &'a Query,
    index: usize,
}

impl<'a> QueryIter<'a> {
    pub(crate) fn new(tables: &'a [ArchetypeTable], query: &'a Query) -> Self {
        // Table 0 is the void archetype.
        Self {
            tables,
            query,
            index: 1,
        }
    }
}

impl<'a> Iterator for QueryIter<'a> {
    type Item = &'a ArchetypeTable;

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.tables.len() {
            let table = &self.tables[self.index];
            self.index += 1;
            if !table.is_empty() && self.query.matches(table) {
                return Some(table);
            }
        }
        None
    }
}
