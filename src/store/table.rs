use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use crate::error::StoreError;
use crate::events::index::{self, IndexKey, IndexValue};
use crate::events::{EventRecord, PrimaryKey, StoreName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

/// A range over index keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRange {
    All,
    /// Exactly this key.
    Only(IndexKey),
    /// Every key starting with these components.
    Prefix(IndexKey),
    Between {
        lower: Bound<IndexKey>,
        upper: Bound<IndexKey>,
    },
}

type Entry = (IndexKey, PrimaryKey);

impl KeyRange {
    /// Translates the key range into bounds over `(key, primary key)` entries.
    ///
    /// Returns `None` for an empty range, which `BTreeSet::range` would
    /// otherwise reject with a panic.
    fn bounds(&self) -> Option<(Bound<Entry>, Bound<Entry>)> {
        let (lower, upper) = match self {
            KeyRange::All => (Bound::Unbounded, Bound::Unbounded),
            KeyRange::Only(k) => (
                Bound::Included((k.clone(), PrimaryKey::MIN)),
                Bound::Included((k.clone(), PrimaryKey::MAX)),
            ),
            KeyRange::Prefix(p) => {
                let mut end = p.clone();
                end.push(IndexValue::Max);
                (
                    Bound::Included((p.clone(), PrimaryKey::MIN)),
                    Bound::Excluded((end, PrimaryKey::MIN)),
                )
            }
            KeyRange::Between { lower, upper } => {
                let lower = match lower {
                    Bound::Included(k) => Bound::Included((k.clone(), PrimaryKey::MIN)),
                    Bound::Excluded(k) => Bound::Excluded((k.clone(), PrimaryKey::MAX)),
                    Bound::Unbounded => Bound::Unbounded,
                };
                let upper = match upper {
                    Bound::Included(k) => Bound::Included((k.clone(), PrimaryKey::MAX)),
                    Bound::Excluded(k) => Bound::Excluded((k.clone(), PrimaryKey::MIN)),
                    Bound::Unbounded => Bound::Unbounded,
                };
                (lower, upper)
            }
        };

        let empty = match (&lower, &upper) {
            (Bound::Included(a), Bound::Included(b)) => a > b,
            (Bound::Included(a), Bound::Excluded(b))
            | (Bound::Excluded(a), Bound::Included(b))
            | (Bound::Excluded(a), Bound::Excluded(b)) => a >= b,
            _ => false,
        };

        (!empty).then_some((lower, upper))
    }
}

/// Append-only table for one event type with its secondary indexes.
#[derive(Debug, Clone)]
pub struct EventTable {
    store: StoreName,
    rows: BTreeMap<PrimaryKey, EventRecord>,
    indexes: BTreeMap<&'static str, BTreeSet<Entry>>,
}

impl EventTable {
    pub fn new(store: StoreName) -> Self {
        let indexes = index::index_names(store)
            .iter()
            .map(|name| (*name, BTreeSet::new()))
            .collect();

        Self {
            store,
            rows: BTreeMap::new(),
            indexes,
        }
    }

    pub fn store(&self) -> StoreName {
        self.store
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn contains(&self, key: &PrimaryKey) -> bool {
        self.rows.contains_key(key)
    }

    pub fn get(&self, key: &PrimaryKey) -> Option<&EventRecord> {
        self.rows.get(key)
    }

    pub fn index_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.indexes.keys().copied()
    }

    /// Fails if `record` belongs to another store or its key is taken.
    pub(crate) fn check_insert(&self, record: &EventRecord) -> Result<(), StoreError> {
        if record.store() != self.store {
            return Err(StoreError::WrongStore {
                expected: self.store,
                found: record.store(),
            });
        }
        if self.rows.contains_key(&record.key) {
            return Err(StoreError::DuplicateKey {
                store: self.store,
                key: record.key,
            });
        }
        Ok(())
    }

    /// Adds a record already accepted by [`EventTable::check_insert`] and
    /// updates every index.
    pub(crate) fn push(&mut self, record: EventRecord) {
        for (name, entries) in self.indexes.iter_mut() {
            if let Some(key) = index::project(&record, name) {
                entries.insert((key, record.key));
            }
        }
        self.rows.insert(record.key, record);
    }

    /// Records in primary-key order.
    pub fn iter(&self, direction: Direction) -> Box<dyn Iterator<Item = &EventRecord> + '_> {
        match direction {
            Direction::Forward => Box::new(self.rows.values()),
            Direction::Backward => Box::new(self.rows.values().rev()),
        }
    }

    /// Ordered scan over a secondary index yielding `(index key, record)`.
    ///
    /// Entries sharing an index key come out in primary-key order (reversed
    /// for a backward scan).
    pub fn scan_entries<'a>(
        &'a self,
        index: &str,
        range: &KeyRange,
        direction: Direction,
    ) -> Result<Box<dyn Iterator<Item = (&'a IndexKey, &'a EventRecord)> + 'a>, StoreError> {
        let entries = self
            .indexes
            .get(index)
            .ok_or_else(|| StoreError::UnknownIndex {
                store: self.store,
                index: index.to_string(),
            })?;

        let Some(bounds) = range.bounds() else {
            return Ok(Box::new(std::iter::empty()));
        };

        let rows = &self.rows;
        let iter = entries
            .range(bounds)
            .filter_map(move |(key, pk)| rows.get(pk).map(|record| (key, record)));

        Ok(match direction {
            Direction::Forward => Box::new(iter),
            Direction::Backward => Box::new(iter.rev()),
        })
    }

    pub fn scan<'a>(
        &'a self,
        index: &str,
        range: &KeyRange,
        direction: Direction,
    ) -> Result<impl Iterator<Item = &'a EventRecord> + 'a, StoreError> {
        Ok(self
            .scan_entries(index, range, direction)?
            .map(|(_, record)| record))
    }
}
