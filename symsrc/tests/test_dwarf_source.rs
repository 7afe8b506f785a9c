use similar_asserts::assert_eq;

use symsrc::{DwarfSymbolSource, SymbolKind, SymbolSource};
use symsrc_common::ByteView;
use symsrc_debuginfo::testutils::MinimalPe;

const LOAD_BASE: u64 = 0x7ff6_4000_0000;

#[test]
fn test_coff_publics_from_image() {
    let image = MinimalPe::new()
        .section(b".text\0\0\0", 0x1000, 0x200)
        .coff_symbol(b"start\0\0\0", 2, 1, 0x10)
        .coff_symbol_long("a_rather_long_symbol_name", 2, 1, 0x40)
        .build();

    let mut source = DwarfSymbolSource::new();
    source
        .load_image(ByteView::from_vec(image), LOAD_BASE, 0x3000)
        .unwrap();
    assert!(source.is_open());
    source.join();
    assert!(!source.is_loading());

    let start = source.find_symbol_by_name("start", true).unwrap();
    assert_eq!(start.rva, 0x1010);
    assert_eq!(start.kind, SymbolKind::Public);
    assert!(start.public_symbol);
    assert_eq!(start.virtual_address, LOAD_BASE + 0x1010);

    // The gap to the next symbol was inferred as its size.
    assert_eq!(start.size, Some(0x30));
    assert!(!start.perfect_size);

    let long = source
        .find_symbol_by_name("a_rather_long_symbol_name", true)
        .unwrap();
    assert_eq!(long.rva, 0x1040);

    let lower = source.find_symbol_exact_or_lower(0x1012).unwrap();
    assert_eq!(lower.name, "start");
    assert_eq!(lower.displacement, 2);

    // No DWARF line programs in this image.
    assert!(source.find_source_line_info(0x1010).is_none());
}

#[test]
fn test_malformed_image_fails_synchronously() {
    let mut source = DwarfSymbolSource::new();
    let error = source
        .load_image(ByteView::from_slice(b"MZ but not a pe"), LOAD_BASE, 0x1000)
        .unwrap_err();

    assert!(matches!(error, symsrc::SourceError::Pe(_)));
    assert!(!source.is_open());
    assert!(!source.is_loading());
}

#[test]
fn test_image_without_symbols() {
    let image = MinimalPe::new().section(b".text\0\0\0", 0x1000, 0x200).build();

    let mut source = DwarfSymbolSource::new();
    source
        .load_image(ByteView::from_vec(image), LOAD_BASE, 0x2000)
        .unwrap();
    source.join();

    assert!(source.is_open());
    assert!(source.find_symbol_exact_or_lower(0x2000).is_none());
    assert!(source.find_symbols_by_prefix("", true).is_empty());
}
