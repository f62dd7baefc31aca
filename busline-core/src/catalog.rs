//! The global, refcounted multiset of currently-advertised definitions.
//!
//! An entry exists iff at least one peer currently advertises that
//! identifier. `add`/`remove` are the only mutators; both are owned
//! exclusively by the dispatcher task, so no internal locking is needed
//! (mirrors the single-writer discipline of a `SubscriptionIndex`).

use crate::packet::Definition;
use hashbrown::HashMap;
use tracing::warn;

struct CatalogEntry {
    definition: Definition,
    refcount: usize,
}

/// `identifier -> (Definition, refcount)`.
#[derive(Default)]
pub struct Catalog {
    entries: HashMap<String, CatalogEntry>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `def` or raises the refcount of its existing entry.
    ///
    /// Returns `true` iff this is the first time `def.identifier` has been
    /// seen (the catalog entry was just created). A field-set mismatch with
    /// the existing entry is logged but never rejected.
    pub fn add(&mut self, def: Definition) -> bool {
        match self.entries.get_mut(&def.identifier) {
            Some(entry) => {
                if entry.definition.fields != def.fields || entry.definition.kind != def.kind {
                    warn!(
                        identifier = %def.identifier,
                        "definition fields/kind diverge from existing catalog entry; keeping the first"
                    );
                }
                entry.refcount += 1;
                false
            }
            None => {
                self.entries.insert(
                    def.identifier.clone(),
                    CatalogEntry {
                        definition: def,
                        refcount: 1,
                    },
                );
                true
            }
        }
    }

    /// Decrements the refcount for `identifier`. Returns the retired
    /// `Definition` iff the refcount just reached zero (the entry was
    /// removed). Removing an unknown identifier is logged and is a no-op.
    pub fn remove(&mut self, identifier: &str) -> Option<Definition> {
        let Some(entry) = self.entries.get_mut(identifier) else {
            warn!(identifier, "undef for an identifier not present in the catalog");
            return None;
        };

        entry.refcount -= 1;
        if entry.refcount == 0 {
            self.entries.remove(identifier).map(|e| e.definition)
        } else {
            None
        }
    }

    /// A snapshot of every currently-advertised definition. Iteration order
    /// is unspecified but stable within a single call.
    pub fn snapshot(&self) -> Vec<Definition> {
        self.entries.values().map(|e| e.definition.clone()).collect()
    }

    #[cfg(test)]
    pub(crate) fn refcount(&self, identifier: &str) -> Option<usize> {
        self.entries.get(identifier).map(|e| e.refcount)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::DefinitionKind;

    fn def(id: &str) -> Definition {
        Definition::new(id, DefinitionKind::Event)
    }

    #[test]
    fn add_new_identifier_returns_true_and_seeds_refcount_one() {
        let mut catalog = Catalog::new();
        assert!(catalog.add(def("tick")));
        assert_eq!(catalog.refcount("tick"), Some(1));
    }

    #[test]
    fn add_existing_identifier_raises_refcount_without_rebroadcast_signal() {
        let mut catalog = Catalog::new();
        assert!(catalog.add(def("tick")));
        assert!(!catalog.add(def("tick")));
        assert_eq!(catalog.refcount("tick"), Some(2));
    }

    #[test]
    fn remove_decrements_and_retires_entry_at_zero() {
        let mut catalog = Catalog::new();
        catalog.add(def("tick"));
        catalog.add(def("tick"));
        assert_eq!(catalog.remove("tick"), None);
        assert_eq!(catalog.refcount("tick"), Some(1));
        let removed = catalog.remove("tick");
        assert_eq!(removed.map(|d| d.identifier), Some("tick".to_owned()));
        assert_eq!(catalog.refcount("tick"), None);
    }

    #[test]
    fn remove_unknown_identifier_is_non_fatal() {
        let mut catalog = Catalog::new();
        assert_eq!(catalog.remove("nope"), None);
        assert!(catalog.is_empty());
    }

    #[test]
    fn snapshot_reflects_current_entries() {
        let mut catalog = Catalog::new();
        catalog.add(def("a"));
        catalog.add(def("b"));
        let mut ids: Vec<_> = catalog.snapshot().into_iter().map(|d| d.identifier).collect();
        ids.sort();
        assert_eq!(ids, vec!["a".to_owned(), "b".to_owned()]);
    }

    #[test]
    fn field_divergence_on_existing_identifier_is_accepted_not_rejected() {
        let mut catalog = Catalog::new();
        catalog.add(def("tick"));
        let mut diverged = def("tick");
        diverged.is_array = true;
        diverged.fields.push(crate::packet::FieldSpec {
            name: "n".into(),
            field_type: crate::packet::FieldType::Number,
            units: String::new(),
        });
        assert!(!catalog.add(diverged));
        assert_eq!(catalog.refcount("tick"), Some(2));
    }
}
