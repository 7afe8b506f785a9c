//! In-memory indices owned by the symbol-source front-end.
//!
//! The symbol index is append-only while a loader runs and becomes
//! queryable once [`publish`] sorts it; the line index keeps itself ordered
//! and serves queries as soon as records arrive. Both are guarded by
//! short-held locks in the front-ends, one lock per index.
//!
//! [`publish`]: struct.SymbolIndex.html#method.publish

use std::collections::btree_map::BTreeMap;
use std::collections::HashMap;
use std::ops::Bound;

use symsrc_common::{SourceLineInfo, SymbolInfo};

/// Symbols sorted by name, with an address view into the same storage.
#[derive(Default)]
pub(crate) struct SymbolIndex {
    /// All symbol records; sorted by name after `publish`.
    names: Vec<SymbolInfo>,
    /// RVA to index in `names`. The first record at an address wins.
    by_addr: BTreeMap<u64, usize>,
    /// Whether `publish` has run. Lookups report nothing until then.
    sorted: bool,
}

impl SymbolIndex {
    /// Appends a record during loading. O(1); the index stays unqueryable
    /// until [`publish`] runs.
    ///
    /// [`publish`]: struct.SymbolIndex.html#method.publish
    pub fn append(&mut self, record: SymbolInfo) {
        self.names.push(record);
    }

    /// The number of records collected so far.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Sorts the name index, builds the address view, and infers missing
    /// sizes from the distance to the next symbol.
    ///
    /// Runs once, after the loader finishes or is cancelled. Inferred sizes
    /// leave `perfect_size` unset.
    pub fn publish(&mut self) {
        dmsort::sort_by(&mut self.names, |a, b| a.name.cmp(&b.name));

        self.by_addr.clear();
        for (index, record) in self.names.iter().enumerate() {
            self.by_addr.entry(record.rva).or_insert(index);
        }

        let addresses: Vec<usize> = self.by_addr.values().copied().collect();
        for pair in addresses.windows(2) {
            let next_rva = self.names[pair[1]].rva;
            let record = &mut self.names[pair[0]];
            if record.size.is_none() {
                record.size = Some(next_rva - record.rva);
                record.perfect_size = false;
            }
        }

        self.sorted = true;
    }

    /// Finds the record whose RVA equals the query exactly.
    pub fn find_exact(&self, rva: u64) -> Option<SymbolInfo> {
        if !self.sorted {
            return None;
        }

        let &index = self.by_addr.get(&rva)?;
        Some(self.names[index].clone())
    }

    /// Finds the highest record at or below the query.
    ///
    /// The returned record carries the displacement of the query from the
    /// record's start.
    pub fn find_exact_or_lower(&self, rva: u64) -> Option<SymbolInfo> {
        if !self.sorted {
            return None;
        }

        let (&found_rva, &index) = self
            .by_addr
            .range((Bound::Unbounded, Bound::Included(rva)))
            .next_back()?;

        let mut record = self.names[index].clone();
        record.displacement = rva - found_rva;
        Some(record)
    }

    /// Exact name lookup.
    pub fn find_by_name(&self, name: &str, case_sensitive: bool) -> Option<SymbolInfo> {
        if !self.sorted {
            return None;
        }

        if case_sensitive {
            let index = self
                .names
                .binary_search_by(|record| record.name.as_str().cmp(name))
                .ok()?;
            Some(self.names[index].clone())
        } else {
            self.names
                .iter()
                .find(|record| record.name.eq_ignore_ascii_case(name))
                .cloned()
        }
    }

    /// Range lookup of all records whose name starts with `prefix`.
    pub fn find_by_prefix(&self, prefix: &str, case_sensitive: bool, out: &mut Vec<SymbolInfo>) {
        if !self.sorted {
            return;
        }

        if case_sensitive {
            let start = self
                .names
                .partition_point(|record| record.name.as_str() < prefix);

            for record in &self.names[start..] {
                if !record.name.starts_with(prefix) {
                    break;
                }
                out.push(record.clone());
            }
        } else {
            for record in &self.names {
                // `get` refuses non-boundary indexes, so names with
                // multi-byte codepoints cannot panic the scan.
                if record
                    .name
                    .get(..prefix.len())
                    .map_or(false, |head| head.eq_ignore_ascii_case(prefix))
                {
                    out.push(record.clone());
                }
            }
        }
    }

    /// Visits all records in name order; the callback returns `false` to
    /// stop.
    pub fn for_each(&self, callback: &mut dyn FnMut(&SymbolInfo) -> bool) {
        for record in &self.names {
            if !callback(record) {
                break;
            }
        }
    }
}

/// One address-to-line record; file names live in the interning table.
struct CachedLine {
    line_number: u32,
    file_index: u32,
}

/// Address-ordered line records with interned file names.
///
/// Unlike the symbol index, the map is kept ordered online, so records are
/// queryable the moment they are inserted.
#[derive(Default)]
pub(crate) struct LineIndex {
    lines: BTreeMap<u64, CachedLine>,
    files: Vec<String>,
    files_by_name: HashMap<String, u32>,
}

impl LineIndex {
    fn intern(&mut self, file_name: &str) -> u32 {
        if let Some(&index) = self.files_by_name.get(file_name) {
            return index;
        }

        let index = self.files.len() as u32;
        self.files.push(file_name.to_string());
        self.files_by_name.insert(file_name.to_string(), index);
        index
    }

    /// Inserts a record; a repeated RVA replaces the previous record.
    pub fn insert(&mut self, rva: u64, line_number: u32, file_name: &str) {
        let file_index = self.intern(file_name);
        self.lines.insert(
            rva,
            CachedLine {
                line_number,
                file_index,
            },
        );
    }

    /// The number of line records.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Address-exact lookup.
    pub fn find(&self, rva: u64) -> Option<SourceLineInfo> {
        let cached = self.lines.get(&rva)?;
        Some(SourceLineInfo {
            rva,
            line_number: cached.line_number,
            source_file: self
                .files
                .get(cached.file_index as usize)
                .cloned()
                .unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn record(name: &str, rva: u64) -> SymbolInfo {
        SymbolInfo {
            rva,
            virtual_address: 0x40_0000 + rva,
            name: name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_unpublished_index_reports_nothing() {
        let mut index = SymbolIndex::default();
        index.append(record("zeta", 0x1000));
        index.append(record("alpha", 0x2000));

        assert_eq!(index.find_exact(0x1000), None);
        assert_eq!(index.find_by_name("zeta", true), None);
    }

    #[test]
    fn test_publish_sorts_by_name() {
        let mut index = SymbolIndex::default();
        index.append(record("zeta", 0x1000));
        index.append(record("alpha", 0x2000));
        index.append(record("mid", 0x1800));
        index.publish();

        let mut names = Vec::new();
        index.for_each(&mut |record| {
            names.push(record.name.clone());
            true
        });
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_exact_and_lower_lookup() {
        let mut index = SymbolIndex::default();
        index.append(record("a", 0x1000));
        index.append(record("b", 0x2000));
        index.publish();

        assert_eq!(index.find_exact(0x1000).unwrap().name, "a");
        assert_eq!(index.find_exact(0x1004), None);

        let lower = index.find_exact_or_lower(0x1004).unwrap();
        assert_eq!(lower.name, "a");
        assert_eq!(lower.displacement, 4);

        let exact = index.find_exact_or_lower(0x2000).unwrap();
        assert_eq!(exact.name, "b");
        assert_eq!(exact.displacement, 0);

        assert_eq!(index.find_exact_or_lower(0xfff), None);
    }

    #[test]
    fn test_size_inference_from_gaps() {
        let mut index = SymbolIndex::default();
        index.append(record("a", 0x1000));
        let mut sized = record("b", 0x1800);
        sized.size = Some(0x10);
        sized.perfect_size = true;
        index.append(sized);
        index.append(record("c", 0x2000));
        index.publish();

        let a = index.find_exact(0x1000).unwrap();
        assert_eq!(a.size, Some(0x800));
        assert!(!a.perfect_size);

        // Declared sizes are not overwritten.
        let b = index.find_exact(0x1800).unwrap();
        assert_eq!(b.size, Some(0x10));
        assert!(b.perfect_size);

        // The last symbol has nothing to infer from.
        let c = index.find_exact(0x2000).unwrap();
        assert_eq!(c.size, None);
    }

    #[test]
    fn test_name_lookup_case_folding() {
        let mut index = SymbolIndex::default();
        index.append(record("CreateFileW", 0x1000));
        index.publish();

        assert!(index.find_by_name("CreateFileW", true).is_some());
        assert!(index.find_by_name("createfilew", true).is_none());
        assert!(index.find_by_name("createfilew", false).is_some());
    }

    #[test]
    fn test_prefix_lookup_multibyte_names() {
        let mut index = SymbolIndex::default();
        index.append(record("naïve_sort", 0x1000));
        index.append(record("naive_sort", 0x2000));
        index.publish();

        // "naï" is 4 bytes; the 3-byte prefix ends inside the codepoint and
        // must simply not match.
        let mut out = Vec::new();
        index.find_by_prefix("nai", false, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "naive_sort");

        let mut exact = Vec::new();
        index.find_by_prefix("naï", false, &mut exact);
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].name, "naïve_sort");
    }

    #[test]
    fn test_prefix_lookup() {
        let mut index = SymbolIndex::default();
        index.append(record("NtClose", 0x1000));
        index.append(record("NtCreateFile", 0x2000));
        index.append(record("RtlZeroMemory", 0x3000));
        index.publish();

        let mut out = Vec::new();
        index.find_by_prefix("Nt", true, &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].name, "NtClose");
        assert_eq!(out[1].name, "NtCreateFile");

        let mut folded = Vec::new();
        index.find_by_prefix("nt", false, &mut folded);
        assert_eq!(folded.len(), 2);

        let mut none = Vec::new();
        index.find_by_prefix("nt", true, &mut none);
        assert!(none.is_empty());
    }

    #[test]
    fn test_line_index_last_write_wins() {
        let mut index = LineIndex::default();
        index.insert(0x1000, 10, "main.c");
        index.insert(0x1000, 12, "main.c");

        let info = index.find(0x1000).unwrap();
        assert_eq!(info.line_number, 12);
        assert_eq!(info.source_file, "main.c");
        assert_eq!(index.len(), 1);

        assert_eq!(index.find(0x1001), None);
    }
}
