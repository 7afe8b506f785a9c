//! Enumeration of the provider's lexical hierarchy.
//!
//! The walk visits the tree in a fixed order — compilands (functions with
//! their statics, blocks and labels, then data, blocks, labels), global
//! publics, global functions, global data — and emits one normalized
//! [`SymbolInfo`] record per entity to a caller-supplied sink. The sink
//! returns `false` to abort the walk; loaders use that both for early
//! termination and for cooperative cancellation.
//!
//! Providers hand out the same underlying symbol through more than one path
//! (a function is a child of its compiland and of the global scope), so a
//! visited set keyed by the provider's unique id guards every emission.
//!
//! [`SymbolInfo`]: ../../symsrc_common/struct.SymbolInfo.html

use std::collections::HashSet;

use symsrc_common::{SymbolInfo, SymbolKind};
use symsrc_demangle::{is_mangled, undecorate, UndecorateFlags};

use super::{
    DiaError, DiaLineRecord, LocationKind, ProviderSession, SymbolHandle, SymbolTag,
};

/// Options controlling what the enumerator collects per record.
///
/// Undecorated names and sizes are the expensive parts of normalization;
/// callers that only need addresses can switch them off.
#[derive(Clone, Copy, Debug)]
pub struct EnumerateOptions {
    /// Resolve symbol sizes, for data symbols through the type chain.
    pub collect_size: bool,
    /// Undecorate mangled names through the demangler.
    pub collect_undecorated_names: bool,
}

impl Default for EnumerateOptions {
    fn default() -> Self {
        EnumerateOptions {
            collect_size: true,
            collect_undecorated_names: true,
        }
    }
}

/// Resolves the size of a symbol, for data symbols via its type.
///
/// Data symbols carry their size on the *type* in most cases; the exceptions
/// are function-typed data (the symbol itself), and type records the
/// provider could not resolve, where the type length is tried first with the
/// symbol's own length as fallback. A result of 0 or the all-ones sentinel
/// counts as unknown and triggers one last attempt on the symbol itself.
fn resolve_symbol_size(
    session: &dyn ProviderSession,
    symbol: SymbolHandle,
    tag: SymbolTag,
) -> Option<u64> {
    match tag {
        SymbolTag::Data => {
            let mut size = None;

            if let Some(type_symbol) = session.symbol_type(symbol) {
                size = match session.symbol_tag(type_symbol) {
                    Some(SymbolTag::FunctionType) => session.symbol_length(symbol),
                    Some(SymbolTag::PointerType)
                    | Some(SymbolTag::ArrayType)
                    | Some(SymbolTag::Udt) => session.symbol_length(type_symbol),
                    Some(SymbolTag::Null) => session
                        .symbol_length(type_symbol)
                        .or_else(|| session.symbol_length(symbol)),
                    // Native scalar.
                    Some(_) => session.symbol_length(type_symbol),
                    None => None,
                };
            }

            // One last attempt.
            match size {
                Some(size) if size != 0 && size != u64::MAX => Some(size),
                _ => session.symbol_length(symbol).or(size),
            }
        }
        SymbolTag::Function | SymbolTag::Block => session.symbol_length(symbol),
        _ => None,
    }
}

/// Normalizes a provider symbol into a [`SymbolInfo`] record.
///
/// Returns `None` when the symbol has no usable tag, when any of the address
/// properties is missing, or when the provider failed to relocate the symbol
/// (its virtual address equals its section offset). Such records are skipped
/// by the walk, they never abort it.
///
/// [`SymbolInfo`]: ../../symsrc_common/struct.SymbolInfo.html
pub fn convert_symbol(
    session: &dyn ProviderSession,
    symbol: SymbolHandle,
    options: &EnumerateOptions,
) -> Option<SymbolInfo> {
    let tag = session.symbol_tag(symbol)?;

    let mut name = session.symbol_name(symbol).unwrap_or_default();
    if let Some(position) = name.find('(') {
        name.truncate(position);
    }

    let mut undecorated_name = String::new();
    if options.collect_undecorated_names && is_mangled(&name) {
        if let Some(undecorated) = undecorate(&name, UndecorateFlags::COMPLETE) {
            undecorated_name = undecorated;
        }
    }

    let segment = session.symbol_segment(symbol)?;
    let offset = session.symbol_offset(symbol)?;
    let virtual_address = session.symbol_virtual_address(symbol)?;

    // The provider failed to relocate this symbol.
    if virtual_address == u64::from(offset) {
        return None;
    }

    let rva = u64::from(session.symbol_rva(symbol)?);

    let mut size = None;
    let mut perfect_size = false;
    if options.collect_size {
        if let Some(resolved) = resolve_symbol_size(session, symbol, tag) {
            if resolved != 0 && resolved != u64::MAX {
                size = Some(resolved);
                perfect_size = true;
            }
        }
    }

    let (kind, public_symbol) = match tag {
        SymbolTag::PublicSymbol => (SymbolKind::Public, true),
        SymbolTag::Function => (SymbolKind::Function, false),
        SymbolTag::Data => (SymbolKind::Data, false),
        SymbolTag::Label => (SymbolKind::Label, false),
        SymbolTag::Block => (SymbolKind::Block, false),
        _ => (SymbolKind::Unknown, false),
    };

    Some(SymbolInfo {
        virtual_address,
        rva,
        segment,
        offset,
        size,
        perfect_size,
        displacement: 0,
        name,
        undecorated_name,
        kind,
        public_symbol,
    })
}

struct Walk<'a> {
    session: &'a dyn ProviderSession,
    options: &'a EnumerateOptions,
    visited: HashSet<u32>,
    sink: &'a mut dyn FnMut(SymbolInfo) -> bool,
}

impl Walk<'_> {
    /// Emits one symbol, deduplicated by provider id.
    ///
    /// Returns `false` only when the sink requested termination.
    fn emit(&mut self, symbol: SymbolHandle) -> bool {
        let id = match self.session.symbol_id(symbol) {
            Some(id) => id,
            None => return true,
        };

        if !self.visited.insert(id) {
            log::trace!("[dia] repeated symbol {id}");
            return true;
        }

        match convert_symbol(self.session, symbol, self.options) {
            Some(record) => (self.sink)(record),
            None => true,
        }
    }

    fn function(&mut self, function: SymbolHandle) -> bool {
        if let Some(id) = self.session.symbol_id(function) {
            // The whole subtree was walked before through another path.
            if self.visited.contains(&id) {
                log::trace!("[dia] repeated function {id}");
                return true;
            }
        }

        if !self.emit(function) {
            return false;
        }

        for data in self.session.children(function, SymbolTag::Data) {
            if self.session.symbol_location(data) == Some(LocationKind::Static) && !self.emit(data)
            {
                return false;
            }
        }

        for block in self.session.children(function, SymbolTag::Block) {
            if !self.emit(block) {
                return false;
            }
        }

        for label in self.session.children(function, SymbolTag::Label) {
            if !self.emit(label) {
                return false;
            }
        }

        true
    }

    fn compiland(&mut self, compiland: SymbolHandle) -> bool {
        for function in self.session.children(compiland, SymbolTag::Function) {
            if !self.function(function) {
                return false;
            }
        }

        for data in self.session.children(compiland, SymbolTag::Data) {
            if !self.emit(data) {
                return false;
            }
        }

        for block in self.session.children(compiland, SymbolTag::Block) {
            if !self.emit(block) {
                return false;
            }
        }

        for label in self.session.children(compiland, SymbolTag::Label) {
            if !self.emit(label) {
                return false;
            }
        }

        true
    }
}

/// Walks the session's lexical hierarchy, emitting normalized records.
///
/// Order: per compiland first functions (each recursing one level into its
/// static data, blocks and labels), then data, blocks and labels; then the
/// global publics, global functions and global data. Each underlying symbol
/// id is emitted at most once.
///
/// Returns `Ok(false)` when the sink aborted the walk, `Ok(true)` when it
/// ran to completion.
pub fn enumerate_lexical_hierarchy(
    session: &dyn ProviderSession,
    options: &EnumerateOptions,
    sink: &mut dyn FnMut(SymbolInfo) -> bool,
) -> Result<bool, DiaError> {
    let global = session.global_scope()?;

    let mut walk = Walk {
        session,
        options,
        visited: HashSet::new(),
        sink,
    };

    if let Some(id) = session.symbol_id(global) {
        walk.visited.insert(id);
    }

    for compiland in session.children(global, SymbolTag::Compiland) {
        if !walk.compiland(compiland) {
            return Ok(false);
        }
    }

    for public in session.children(global, SymbolTag::PublicSymbol) {
        if !walk.emit(public) {
            return Ok(false);
        }
    }

    for function in session.children(global, SymbolTag::Function) {
        if !walk.emit(function) {
            return Ok(false);
        }
    }

    for data in session.children(global, SymbolTag::Data) {
        if !walk.emit(data) {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Extracts source-line records for every function in the session.
///
/// For each function's `(rva, length)` range the provider enumerates the
/// intersecting line records; records are forwarded in provider order so a
/// map keyed by RVA ends up last-write-wins. The sink returns `false` to
/// abort.
pub fn extract_line_info(
    session: &dyn ProviderSession,
    sink: &mut dyn FnMut(DiaLineRecord) -> bool,
) -> Result<(), DiaError> {
    let global = session.global_scope()?;

    for function in session.children(global, SymbolTag::Function) {
        let rva = match session.symbol_rva(function) {
            Some(rva) => rva,
            None => continue,
        };

        let length = match session.symbol_length(function) {
            Some(length) if length > 0 => length as u32,
            _ => continue,
        };

        for record in session.find_lines_by_rva(rva, length) {
            if !sink(record) {
                return Ok(());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::dia::mock::{MockSession, MockSymbol};

    fn options() -> EnumerateOptions {
        EnumerateOptions::default()
    }

    fn collect(session: &MockSession) -> Vec<SymbolInfo> {
        let mut records = Vec::new();
        let complete = enumerate_lexical_hierarchy(session, &options(), &mut |record| {
            records.push(record);
            true
        })
        .unwrap();
        assert!(complete);
        records
    }

    #[test]
    fn test_emits_public() {
        let mut session = MockSession::new(0x40_0000);
        session.add_public(MockSymbol::public("foo", 0x1000));

        let records = collect(&session);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "foo");
        assert_eq!(records[0].rva, 0x1000);
        assert_eq!(records[0].kind, SymbolKind::Public);
        assert!(records[0].public_symbol);
        assert_eq!(records[0].virtual_address, 0x40_1000);
    }

    #[test]
    fn test_no_duplicate_ids() {
        let mut session = MockSession::new(0x40_0000);
        let compiland = session.add_compiland("main.obj");
        // The function is reachable both through its compiland and through
        // the global scope; it must come out once.
        session.add_function(compiland, MockSymbol::function("main", 0x1000, 0x40));

        let records = collect(&session);
        let mains: Vec<_> = records.iter().filter(|r| r.name == "main").collect();
        assert_eq!(mains.len(), 1);
    }

    #[test]
    fn test_nested_static_emitted_once() {
        let mut session = MockSession::new(0x40_0000);
        let compiland = session.add_compiland("main.obj");
        let function = session.add_function(compiland, MockSymbol::function("main", 0x1000, 0x40));
        // A static inside a block inside a block; the provider flattens
        // lexical scopes onto the containing function.
        session.add_function_child(function, MockSymbol::data("s_counter", 0x1020, 4));

        let records = collect(&session);
        let statics: Vec<_> = records.iter().filter(|r| r.name == "s_counter").collect();
        assert_eq!(statics.len(), 1);
        assert_eq!(statics[0].rva, 0x1020);
        assert_eq!(statics[0].kind, SymbolKind::Data);
    }

    #[test]
    fn test_rejects_unrelocated() {
        // With no load address applied, the virtual address degenerates to
        // the section offset, the signature of a failed relocation.
        let mut session = MockSession::new(0);
        session.add_public(MockSymbol::public("broken", 0x1000));

        assert!(collect(&session).is_empty());
    }

    #[test]
    fn test_rejects_missing_address() {
        let mut session = MockSession::new(0x40_0000);
        let mut symbol = MockSymbol::public("no_address", 0x1000);
        symbol.rva = None;
        session.add_public(symbol);

        assert!(collect(&session).is_empty());
    }

    #[test]
    fn test_strips_name_suffix() {
        let mut session = MockSession::new(0x40_0000);
        session.add_public(MockSymbol::public("operator_new(unsigned int)", 0x1000));

        let records = collect(&session);
        assert_eq!(records[0].name, "operator_new");
    }

    #[test]
    fn test_undecorates_mangled_names_only() {
        let mut session = MockSession::new(0x40_0000);
        session.add_public(MockSymbol::public("?bar@@YAHXZ", 0x1000));
        session.add_public(MockSymbol::public("plain", 0x2000));

        let records = collect(&session);
        assert_eq!(records[0].undecorated_name, "int __cdecl bar(void)");
        assert_eq!(records[1].undecorated_name, "");
    }

    #[test]
    fn test_size_resolution_via_type_chain() {
        let mut session = MockSession::new(0x40_0000);
        let compiland = session.add_compiland("main.obj");

        let mut array = MockSymbol::data("g_table", 0x2000, 0);
        array.type_tag = Some(SymbolTag::ArrayType);
        array.type_length = Some(0x100);
        session.add_compiland_child(compiland, array);

        let mut fnptr = MockSymbol::data("g_hook", 0x2200, 8);
        fnptr.type_tag = Some(SymbolTag::FunctionType);
        fnptr.type_length = Some(0xdead); // must not be used
        session.add_compiland_child(compiland, fnptr);

        let mut unresolved = MockSymbol::data("g_opaque", 0x2300, 0x10);
        unresolved.type_tag = Some(SymbolTag::Null);
        unresolved.type_length = None;
        session.add_compiland_child(compiland, unresolved);

        let records = collect(&session);
        let by_name = |name: &str| records.iter().find(|r| r.name == name).unwrap();

        assert_eq!(by_name("g_table").size, Some(0x100));
        assert!(by_name("g_table").perfect_size);
        assert_eq!(by_name("g_hook").size, Some(8));
        assert_eq!(by_name("g_opaque").size, Some(0x10));
    }

    #[test]
    fn test_zero_size_is_unknown() {
        let mut session = MockSession::new(0x40_0000);
        let compiland = session.add_compiland("main.obj");

        let mut zero = MockSymbol::data("g_empty", 0x2000, 0);
        zero.type_tag = Some(SymbolTag::BaseType);
        zero.type_length = Some(0);
        session.add_compiland_child(compiland, zero);

        let records = collect(&session);
        assert_eq!(records[0].size, None);
        assert!(!records[0].perfect_size);
    }

    #[test]
    fn test_sink_aborts_walk() {
        let mut session = MockSession::new(0x40_0000);
        session.add_public(MockSymbol::public("a", 0x1000));
        session.add_public(MockSymbol::public("b", 0x2000));

        let mut seen = 0;
        let complete = enumerate_lexical_hierarchy(&session, &options(), &mut |_| {
            seen += 1;
            false
        })
        .unwrap();

        assert!(!complete);
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_extract_line_info() {
        let mut session = MockSession::new(0x40_0000);
        let compiland = session.add_compiland("main.obj");
        session.add_function(compiland, MockSymbol::function("main", 0x1000, 0x40));
        session.add_line("main.c", 0x1000, 10);
        session.add_line("main.c", 0x1010, 11);
        session.add_line("other.c", 0x9000, 99); // outside any function

        let mut lines = Vec::new();
        extract_line_info(&session, &mut |record| {
            lines.push(record);
            true
        })
        .unwrap();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].rva, 0x1000);
        assert_eq!(lines[0].line_number, 10);
        assert_eq!(lines[1].rva, 0x1010);
        assert_eq!(lines[1].line_number, 11);
        assert_eq!(lines[0].file_name, "main.c");
    }
}
