use std::path::Path;
use std::time::{Duration, Instant};

use similar_asserts::assert_eq;

use symsrc::{PdbSymbolSource, SymbolKind, SymbolQueryKind, SymbolSource};
use symsrc_debuginfo::dia::mock::{MockProvider, MockSession, MockSymbol};
use symsrc_debuginfo::DiaErrorKind;

const IMAGE_BASE: u64 = 0x40_0000;
const IMAGE_SIZE: u64 = 0x10_0000;

fn load(session: MockSession) -> PdbSymbolSource {
    let mut source = PdbSymbolSource::new();
    source
        .load_with_provider(
            Box::new(MockProvider::with_session(session)),
            Path::new("app.pdb"),
            None,
            IMAGE_BASE,
            IMAGE_SIZE,
        )
        .expect("load failed");
    source
}

fn load_and_join(session: MockSession) -> PdbSymbolSource {
    let mut source = load(session);
    source.join();
    source
}

#[test]
fn test_single_public_symbol() {
    let mut session = MockSession::new(0);
    session.add_public(MockSymbol::public("foo", 0x1000));

    let source = load_and_join(session);
    assert!(source.is_open());
    assert!(!source.is_loading());

    let by_name = source.find_symbol_by_name("foo", true).unwrap();
    assert_eq!(by_name.rva, 0x1000);
    assert_eq!(by_name.kind, SymbolKind::Public);
    assert!(by_name.public_symbol);
    assert_eq!(by_name.virtual_address, IMAGE_BASE + 0x1000);

    let exact = source.find_symbol_exact(0x1000).unwrap();
    assert_eq!(exact.name, by_name.name);
    assert_eq!(exact.rva, by_name.rva);

    let lower = source.find_symbol_exact_or_lower(0x1004).unwrap();
    assert_eq!(lower.name, "foo");
    assert_eq!(lower.displacement, 4);

    assert!(source.find_symbol_exact(0x1004).is_none());
    assert!(source.find_symbol_exact_or_lower(0xfff).is_none());
}

#[test]
fn test_mismatched_pdb_leaves_source_closed() {
    let mut source = PdbSymbolSource::new();
    let error = source
        .load_with_provider(
            Box::new(MockProvider::failing(DiaErrorKind::Mismatch)),
            Path::new("app.pdb"),
            None,
            IMAGE_BASE,
            IMAGE_SIZE,
        )
        .unwrap_err();

    assert_eq!(error.dia_kind(), Some(DiaErrorKind::Mismatch));
    assert!(!source.is_open());
    assert!(!source.is_loading());
    assert!(source.find_symbol_by_name("foo", true).is_none());

    let mut count = 0;
    source.enum_symbols(&mut |_| {
        count += 1;
        true
    });
    assert_eq!(count, 0);
}

#[test]
fn test_nested_static_lookup() {
    let mut session = MockSession::new(0);
    let compiland = session.add_compiland("main.obj");
    let function = session.add_function(compiland, MockSymbol::function("main", 0x1000, 0x40));
    session.add_function_child(function, MockSymbol::data("s_counter", 0x1020, 4));

    let source = load_and_join(session);

    let mut statics = 0;
    source.enum_symbols(&mut |record| {
        if record.name == "s_counter" {
            statics += 1;
        }
        true
    });
    assert_eq!(statics, 1);

    let record = source.find_symbol_by_name("s_counter", true).unwrap();
    assert_eq!(record.virtual_address, IMAGE_BASE + 0x1020);

    let lower = source.find_symbol_exact_or_lower(0x1021).unwrap();
    assert_eq!(lower.name, "s_counter");
    assert_eq!(lower.displacement, 1);
}

#[test]
fn test_prefix_and_case_folded_lookups() {
    let mut session = MockSession::new(0);
    session.add_public(MockSymbol::public("NtClose", 0x1000));
    session.add_public(MockSymbol::public("NtCreateFile", 0x2000));
    session.add_public(MockSymbol::public("RtlZeroMemory", 0x3000));

    let source = load_and_join(session);

    let prefixed = source.find_symbols_by_prefix("Nt", true);
    assert_eq!(prefixed.len(), 2);
    assert_eq!(prefixed[0].name, "NtClose");
    assert_eq!(prefixed[1].name, "NtCreateFile");

    assert!(source.find_symbols_by_prefix("nt", true).is_empty());
    assert_eq!(source.find_symbols_by_prefix("nt", false).len(), 2);

    assert!(source.find_symbol_by_name("ntclose", false).is_some());
    assert!(source.find_symbol_by_name("ntclose", true).is_none());
}

#[test]
fn test_session_rva_query() {
    let mut session = MockSession::new(0);
    let compiland = session.add_compiland("main.obj");
    session.add_function(compiland, MockSymbol::function("main", 0x1000, 0x40));
    session.add_function(compiland, MockSymbol::function("helper", 0x1100, 0x20));
    session.add_public(MockSymbol::public("main_pub", 0x1000));

    // The provider answers these itself; no join, the indices may not have
    // published yet.
    let source = load(session);

    let function = source
        .find_symbol_by_rva(0x1104, SymbolQueryKind::Function)
        .unwrap();
    assert_eq!(function.name, "helper");
    assert_eq!(function.kind, SymbolKind::Function);
    assert_eq!(function.displacement, 4);

    let any = source.find_symbol_by_rva(0x1104, SymbolQueryKind::Any).unwrap();
    assert_eq!(any.name, "helper");

    let public = source
        .find_symbol_by_rva(0x1004, SymbolQueryKind::Public)
        .unwrap();
    assert_eq!(public.name, "main_pub");
    assert_eq!(public.displacement, 4);
    assert!(public.public_symbol);

    assert!(source
        .find_symbol_by_rva(0xfff, SymbolQueryKind::Any)
        .is_none());
}

#[test]
fn test_source_line_lookup() {
    let mut session = MockSession::new(0);
    let compiland = session.add_compiland("main.obj");
    session.add_function(compiland, MockSymbol::function("main", 0x2000, 0x100));
    session.add_line("file.c", 0x2000, 10);
    session.add_line("file.c", 0x2010, 11);

    let source = load_and_join(session);

    let line = source.find_source_line_info(0x2010).unwrap();
    assert_eq!(line.line_number, 11);
    assert_eq!(line.source_file, "file.c");

    assert!(source.find_source_line_info(0x2008).is_none());
}

#[test]
fn test_mangled_name_undecorated() {
    let mut session = MockSession::new(0);
    session.add_public(MockSymbol::public("?bar@@YAHXZ", 0x1000));

    let source = load_and_join(session);

    let record = source.find_symbol_by_name("?bar@@YAHXZ", true).unwrap();
    assert_eq!(record.undecorated_name, "int __cdecl bar(void)");
    assert_eq!(record.display_name(), "int __cdecl bar(void)");
}

#[test]
fn test_cancellation_keeps_partial_index() {
    // Enough symbols that cancellation lands mid-walk most of the time;
    // correctness must not depend on where it lands.
    let mut session = MockSession::new(0);
    for index in 0..20_000u32 {
        session.add_public(MockSymbol::public(
            &format!("sym_{index:05}"),
            0x1000 + index * 0x10,
        ));
    }

    let source = load(session);

    // Wait until some symbols have been appended, then cancel.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let mut count = 0;
        source.enum_symbols(&mut |_| {
            count += 1;
            count < 64
        });
        if count >= 64 || !source.is_loading() || Instant::now() > deadline {
            break;
        }
        std::thread::sleep(Duration::from_micros(50));
    }

    source.cancel_loading();

    let mut source = source;
    source.join();
    assert!(!source.is_loading());
    assert!(source.is_open());

    // Whatever was emitted before the cancellation is sorted and findable.
    let mut names = Vec::new();
    source.enum_symbols(&mut |record| {
        names.push(record.name.clone());
        true
    });

    for pair in names.windows(2) {
        assert!(pair[0] <= pair[1], "name index is not sorted");
    }

    for name in &names {
        let found = source.find_symbol_by_name(name, true).unwrap();
        assert!(source.find_symbol_exact(found.rva).is_some());
    }
}

#[test]
fn test_drop_joins_workers() {
    let mut session = MockSession::new(0);
    for index in 0..5_000u32 {
        session.add_public(MockSymbol::public(
            &format!("sym_{index:05}"),
            0x1000 + index * 0x10,
        ));
    }

    // Dropping mid-load must signal shutdown and join without hanging.
    let source = load(session);
    drop(source);
}
