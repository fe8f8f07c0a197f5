use std::collections::{BTreeMap, BTreeSet};

/// Conjunction of node tags. The empty filter matches every node.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SchedulingTagFilter {
    tags: BTreeSet<String>,
}

impl SchedulingTagFilter {
    pub fn new<I: IntoIterator<Item = String>>(tags: I) -> Self {
        SchedulingTagFilter {
            tags: tags.into_iter().filter(|t| !t.is_empty()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn can_schedule(&self, node_tags: &BTreeSet<String>) -> bool {
        self.tags.is_subset(node_tags)
    }

    pub fn tags(&self) -> impl Iterator<Item = &String> {
        self.tags.iter()
    }
}

#[derive(Debug)]
struct FilterEntry {
    index: usize,
    count: usize,
}

/// Reference-counted registry of the tag filters in use by operations. Each distinct filter gets
/// a stable slot index while at least one operation holds it; freed slots are reused.
#[derive(Debug, Default)]
pub struct SchedulingTagFilterRegistry {
    filters: Vec<Option<SchedulingTagFilter>>,
    free_indexes: BTreeSet<usize>,
    entries: BTreeMap<SchedulingTagFilter, FilterEntry>,
}

pub const EMPTY_SCHEDULING_TAG_FILTER_INDEX: usize = usize::MAX;

impl SchedulingTagFilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, filter: &SchedulingTagFilter) -> usize {
        if filter.is_empty() {
            return EMPTY_SCHEDULING_TAG_FILTER_INDEX;
        }
        if let Some(entry) = self.entries.get_mut(filter) {
            entry.count += 1;
            return entry.index;
        }

        let index = match self.free_indexes.iter().next().copied() {
            Some(index) => {
                self.free_indexes.remove(&index);
                self.filters[index] = Some(filter.clone());
                index
            }
            None => {
                self.filters.push(Some(filter.clone()));
                self.filters.len() - 1
            }
        };
        self.entries.insert(filter.clone(), FilterEntry { index, count: 1 });
        index
    }

    pub fn unregister(&mut self, filter: &SchedulingTagFilter) {
        if filter.is_empty() {
            return;
        }
        let remove = match self.entries.get_mut(filter) {
            Some(entry) => {
                entry.count -= 1;
                entry.count == 0
            }
            None => false,
        };
        if remove {
            if let Some(entry) = self.entries.remove(filter) {
                self.filters[entry.index] = None;
                self.free_indexes.insert(entry.index);
            }
        }
    }

    #[cfg(test)]
    pub fn get(&self, index: usize) -> Option<&SchedulingTagFilter> {
        self.filters.get(index).and_then(Option::as_ref)
    }

    pub fn registered_filters(&self) -> impl Iterator<Item = (usize, &SchedulingTagFilter)> {
        self.filters
            .iter()
            .enumerate()
            .filter_map(|(index, filter)| filter.as_ref().map(|f| (index, f)))
    }

    pub fn clear(&mut self) {
        self.filters.clear();
        self.free_indexes.clear();
        self.entries.clear();
    }
}
