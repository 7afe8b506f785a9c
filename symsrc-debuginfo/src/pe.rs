//! A view over a mapped Portable Executable image.
//!
//! The view parses a PE image just deep enough for the needs of the symbol
//! source: section headers, the COFF symbol table and the COFF string table.
//! It is the foundation the DWARF object adapter in [`crate::dwarf`] builds
//! on, and also yields the public symbols MinGW-style toolchains leave in the
//! COFF symbol table.

use std::error::Error;
use std::fmt;

use goblin::pe::header::CoffHeader;
use goblin::pe::optional_header::{MAGIC_32, MAGIC_64};
use goblin::pe::section_table::SectionTable;
use goblin::pe::symbol::{SymbolTable, IMAGE_SYM_CLASS_EXTERNAL};
use goblin::pe::{self};
use goblin::strtab::Strtab;
use scroll::{Pread, LE};
use thiserror::Error;

/// An error when dealing with [`PeModuleView`](struct.PeModuleView.html).
#[derive(Debug, Error)]
#[error("invalid PE file")]
pub struct PeError {
    #[source]
    source: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl PeError {
    /// Creates a new PE error from an arbitrary error payload.
    pub(crate) fn new<E>(source: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        let source = Some(source.into());
        Self { source }
    }
}

/// A public symbol found in the COFF symbol table.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CoffPublicSymbol {
    /// The raw symbol name.
    pub name: String,
    /// The symbol's address relative to the image base.
    pub rva: u32,
}

/// A parsed view over a mapped PE image.
///
/// The view borrows the mapping and validates on construction that the
/// DOS/NT header chain is intact and that every section's raw data lies
/// within the mapping. All accessors after that are infallible or fail only
/// for data that is genuinely absent (for example a missing COFF symbol
/// table).
pub struct PeModuleView<'data> {
    pe: pe::PE<'data>,
    data: &'data [u8],
}

impl<'data> PeModuleView<'data> {
    /// Tests whether the buffer could contain a PE image.
    pub fn test(data: &[u8]) -> bool {
        data.get(0..2) == Some(&b"MZ"[..])
    }

    /// Tries to parse a PE image from the given mapping.
    pub fn parse(data: &'data [u8]) -> Result<Self, PeError> {
        let pe = pe::PE::parse(data).map_err(PeError::new)?;

        for section in &pe.sections {
            let start = section.pointer_to_raw_data as usize;
            let end = start + section.size_of_raw_data as usize;
            if section.size_of_raw_data > 0 && end > data.len() {
                return Err(PeError::new(format!(
                    "section {} claims raw data {:#x}..{:#x} beyond mapping of {:#x} bytes",
                    section.name().unwrap_or("?"),
                    start,
                    end,
                    data.len()
                )));
            }
        }

        Ok(PeModuleView { pe, data })
    }

    /// Returns the raw data of the mapping.
    pub fn data(&self) -> &'data [u8] {
        self.data
    }

    /// The address at which the image prefers to be loaded into memory.
    pub fn image_base(&self) -> u64 {
        self.pe.image_base as u64
    }

    /// The size of a pointer in the image: 4 for PE32, 8 for PE32+.
    ///
    /// Falls back to 4 when the optional header is missing, which only
    /// happens for object files rather than mapped images.
    pub fn pointer_size(&self) -> u8 {
        match self.pe.header.optional_header {
            Some(ref header) if header.standard_fields.magic == MAGIC_64 => 8,
            Some(ref header) if header.standard_fields.magic == MAGIC_32 => 4,
            _ => 4,
        }
    }

    /// An ordered list of the section headers in this image.
    pub fn sections(&self) -> &[SectionTable] {
        &self.pe.sections
    }

    /// Returns the raw data of a section, bounded by the smaller of the
    /// section's virtual and raw sizes.
    ///
    /// Sections without raw data (purely virtual sections such as `.bss`)
    /// yield an empty slice.
    pub fn section_data(&self, section: &SectionTable) -> &'data [u8] {
        let start = section.pointer_to_raw_data as usize;
        let size = section.virtual_size.min(section.size_of_raw_data) as usize;
        self.data.get(start..start + size).unwrap_or(&[])
    }

    fn coff_header(&self) -> &CoffHeader {
        &self.pe.header.coff_header
    }

    /// Returns the COFF symbol table, if the image carries one.
    pub fn symbol_table(&self) -> Result<SymbolTable<'data>, PeError> {
        self.coff_header().symbols(self.data).map_err(PeError::new)
    }

    /// Returns the COFF string table, if the image carries one.
    ///
    /// Section names longer than eight characters are stored here and
    /// referenced as `/offset` from the section header.
    pub fn string_table(&self) -> Result<Strtab<'data>, PeError> {
        self.coff_header().strings(self.data).map_err(PeError::new)
    }

    /// Collects the externally visible symbols from the COFF symbol table.
    ///
    /// Only defined symbols are returned: the storage class must be
    /// external and the symbol must live in one of the image's sections.
    /// Auxiliary records are skipped.
    pub fn coff_public_symbols(&self) -> Result<Vec<CoffPublicSymbol>, PeError> {
        let symbols = self.symbol_table()?;
        let strings = self.string_table().ok();

        let mut publics = Vec::new();
        let mut aux = 0usize;

        for (_, inline_name, symbol) in symbols.iter() {
            if aux > 0 {
                aux -= 1;
                continue;
            }
            aux = symbol.number_of_aux_symbols as usize;

            if symbol.storage_class != IMAGE_SYM_CLASS_EXTERNAL || symbol.section_number < 1 {
                continue;
            }

            let section = match self.pe.sections.get(symbol.section_number as usize - 1) {
                Some(section) => section,
                None => continue,
            };

            let name = match inline_name {
                Some(name) => name.to_string(),
                None => {
                    // Long names store a string-table offset in the second
                    // half of the name field.
                    let offset: u32 = match symbol.name.pread_with(4, LE) {
                        Ok(offset) => offset,
                        Err(_) => continue,
                    };
                    match strings.as_ref().and_then(|s| s.get_at(offset as usize)) {
                        Some(name) => name.to_string(),
                        None => continue,
                    }
                }
            };

            if name.is_empty() {
                continue;
            }

            publics.push(CoffPublicSymbol {
                name,
                rva: section.virtual_address + symbol.value,
            });
        }

        Ok(publics)
    }
}

impl fmt::Debug for PeModuleView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeModuleView")
            .field("image_base", &format_args!("{:#x}", self.image_base()))
            .field("pointer_size", &self.pointer_size())
            .field("sections", &self.pe.sections.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::testutils::MinimalPe;

    #[test]
    fn test_parse_minimal() {
        let image = MinimalPe::new()
            .section(b".text\0\0\0", 0x1000, 0x200)
            .build();

        let view = PeModuleView::parse(&image).unwrap();
        assert!(PeModuleView::test(&image));
        assert_eq!(view.pointer_size(), 8);
        assert_eq!(view.image_base(), 0x14000_0000);
        assert_eq!(view.sections().len(), 1);
        assert_eq!(view.sections()[0].name().unwrap(), ".text");
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(PeModuleView::parse(b"not a pe file").is_err());
        assert!(!PeModuleView::test(b"not a pe file"));
    }

    #[test]
    fn test_rejects_truncated_section() {
        let mut image = MinimalPe::new()
            .section(b".text\0\0\0", 0x1000, 0x200)
            .build();

        // Chop off the section's raw data.
        image.truncate(image.len() - 0x100);
        assert!(PeModuleView::parse(&image).is_err());
    }

    #[test]
    fn test_section_data_bounded_by_virtual_size() {
        let image = MinimalPe::new()
            .section_with_virtual_size(b".data\0\0\0", 0x1000, 0x200, 0x80)
            .build();

        let view = PeModuleView::parse(&image).unwrap();
        let section = &view.sections()[0];
        assert_eq!(view.section_data(section).len(), 0x80);
    }

    #[test]
    fn test_coff_public_symbols() {
        let image = MinimalPe::new()
            .section(b".text\0\0\0", 0x1000, 0x200)
            .coff_symbol(b"frobnica", 2, 1, 0x10)
            .coff_symbol_long("a_rather_long_symbol_name", 2, 1, 0x40)
            .coff_symbol(b"static\0\0", 3, 1, 0x50)
            .build();

        let view = PeModuleView::parse(&image).unwrap();
        let publics = view.coff_public_symbols().unwrap();

        assert_eq!(
            publics,
            vec![
                CoffPublicSymbol {
                    name: "frobnica".into(),
                    rva: 0x1010,
                },
                CoffPublicSymbol {
                    name: "a_rather_long_symbol_name".into(),
                    rva: 0x1040,
                },
            ]
        );
    }
}
