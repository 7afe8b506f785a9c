//! DWARF debug information embedded in PE images.
//!
//! Some toolchains (most prominently MinGW) leave DWARF sections inside the
//! PE image instead of producing a PDB. The external DWARF reader does not
//! know anything about PE; the [`ObjectAccess`] trait in this module is the
//! narrow adapter it is driven through. [`PeObjectAccess`] implements the
//! adapter over [`PeModuleView`], and the extraction functions below walk
//! the loaded DWARF data into symbol and line records.
//!
//! [`ObjectAccess`]: trait.ObjectAccess.html
//! [`PeObjectAccess`]: struct.PeObjectAccess.html
//! [`PeModuleView`]: ../pe/struct.PeModuleView.html

use std::borrow::Cow;
use std::error::Error;
use std::fmt;

use gimli::read::{AttributeValue, Error as GimliError};
use gimli::{constants, RunTimeEndian, SectionId};
use goblin::strtab::Strtab;
use thiserror::Error;

use crate::pe::{PeError, PeModuleView};

#[doc(hidden)]
pub use gimli;
pub use gimli::RunTimeEndian as Endian;

type Slice<'a> = gimli::read::EndianSlice<'a, RunTimeEndian>;
type DwarfInner<'a> = gimli::read::Dwarf<Slice<'a>>;
type Unit<'a> = gimli::read::Unit<Slice<'a>>;
type Die<'d, 'u> = gimli::read::DebuggingInformationEntry<'u, 'u, Slice<'d>, usize>;

/// The error kind for [`DwarfError`].
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DwarfErrorKind {
    /// A section was requested by an index outside the object's range.
    InvalidSectionIndex(usize),

    /// The PE container of the DWARF data could not be parsed.
    MalformedImage,

    /// The DWARF data is corrupted. See the cause for more information.
    CorruptedData,
}

impl fmt::Display for DwarfErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSectionIndex(index) => write!(f, "section {index} does not exist"),
            Self::MalformedImage => write!(f, "malformed PE image"),
            Self::CorruptedData => write!(f, "corrupted dwarf debug data"),
        }
    }
}

/// An error handling DWARF debugging information.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct DwarfError {
    kind: DwarfErrorKind,
    #[source]
    source: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl DwarfError {
    /// Creates a new DWARF error from a known kind of error as well as an
    /// arbitrary error payload.
    fn new<E>(kind: DwarfErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        let source = Some(source.into());
        Self { kind, source }
    }

    /// Returns the corresponding [`DwarfErrorKind`] for this error.
    ///
    /// [`DwarfErrorKind`]: enum.DwarfErrorKind.html
    pub fn kind(&self) -> DwarfErrorKind {
        self.kind
    }
}

impl From<DwarfErrorKind> for DwarfError {
    fn from(kind: DwarfErrorKind) -> Self {
        Self { kind, source: None }
    }
}

impl From<GimliError> for DwarfError {
    fn from(e: GimliError) -> Self {
        Self::new(DwarfErrorKind::CorruptedData, e)
    }
}

impl From<PeError> for DwarfError {
    fn from(e: PeError) -> Self {
        Self::new(DwarfErrorKind::MalformedImage, e)
    }
}

/// Information about one section of the object being adapted.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SectionInfo<'data> {
    /// The section name, with long names already resolved.
    pub name: Cow<'data, str>,
    /// The usable size of the section in bytes.
    pub size: u64,
}

/// Object-access callbacks required by the DWARF reader.
///
/// The reader is format-agnostic and pulls everything it needs through these
/// six operations. Index 0 is a synthetic "null" section with an empty name
/// and size 0; index `k` refers to the object's section `k − 1`.
pub trait ObjectAccess<'data> {
    /// Returns name and size for the section at `index`.
    ///
    /// The size is the smaller of the section's virtual and raw sizes.
    fn section_info(&self, index: usize) -> Result<SectionInfo<'data>, DwarfError>;

    /// The byte order of the object's data.
    fn endianity(&self) -> RunTimeEndian;

    /// The size in bytes of a length field.
    fn length_size(&self) -> u8;

    /// The size in bytes of a pointer.
    fn pointer_size(&self) -> u8;

    /// The number of sections, including the synthetic null section.
    fn section_count(&self) -> usize;

    /// Returns the raw data of the section at `index`.
    ///
    /// The null section at index 0 has no data.
    fn load_section(&self, index: usize) -> Result<Option<&'data [u8]>, DwarfError>;
}

/// [`ObjectAccess`] over a mapped PE image.
///
/// Section names starting with `/` are resolved through the COFF string
/// table (the number after the slash is the offset into the table); this is
/// how MinGW stores the long `.debug_*` names.
///
/// [`ObjectAccess`]: trait.ObjectAccess.html
pub struct PeObjectAccess<'data, 'object> {
    view: &'object PeModuleView<'data>,
    strings: Option<Strtab<'data>>,
}

impl<'data, 'object> PeObjectAccess<'data, 'object> {
    /// Creates the adapter over a parsed PE view.
    pub fn new(view: &'object PeModuleView<'data>) -> Self {
        // A missing string table is not an error; it only means no section
        // carries a long name.
        let strings = view.string_table().ok();
        PeObjectAccess { view, strings }
    }

    fn resolve_name(&self, raw: &'data [u8]) -> Cow<'data, str> {
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let name = String::from_utf8_lossy(&raw[..end]);

        if let Some(offset) = name.strip_prefix('/').and_then(|n| n.parse::<usize>().ok()) {
            if let Some(resolved) = self.strings.as_ref().and_then(|s| s.get_at(offset)) {
                return Cow::Borrowed(resolved);
            }
        }

        name
    }
}

impl<'data, 'object> ObjectAccess<'data> for PeObjectAccess<'data, 'object> {
    fn section_info(&self, index: usize) -> Result<SectionInfo<'data>, DwarfError> {
        if index == 0 {
            return Ok(SectionInfo {
                name: Cow::Borrowed(""),
                size: 0,
            });
        }

        let section = self
            .view
            .sections()
            .get(index - 1)
            .ok_or(DwarfErrorKind::InvalidSectionIndex(index))?;

        Ok(SectionInfo {
            name: self.resolve_name(&section.name),
            size: section.virtual_size.min(section.size_of_raw_data) as u64,
        })
    }

    fn endianity(&self) -> RunTimeEndian {
        // PE images are little-endian on all supported targets.
        RunTimeEndian::Little
    }

    fn length_size(&self) -> u8 {
        self.view.pointer_size()
    }

    fn pointer_size(&self) -> u8 {
        self.view.pointer_size()
    }

    fn section_count(&self) -> usize {
        self.view.sections().len() + 1
    }

    fn load_section(&self, index: usize) -> Result<Option<&'data [u8]>, DwarfError> {
        if index == 0 {
            return Ok(None);
        }

        let section = self
            .view
            .sections()
            .get(index - 1)
            .ok_or(DwarfErrorKind::InvalidSectionIndex(index))?;

        Ok(Some(self.view.section_data(section)))
    }
}

/// Loads all DWARF sections of an object through its access callbacks.
///
/// Sections the object does not carry are loaded as empty, which the reader
/// treats as absent.
pub fn load_dwarf<'data, A>(access: &A) -> Result<DwarfInner<'data>, DwarfError>
where
    A: ObjectAccess<'data> + ?Sized,
{
    let endian = access.endianity();

    gimli::read::Dwarf::load(|section: SectionId| -> Result<Slice<'data>, DwarfError> {
        for index in 1..access.section_count() {
            let info = access.section_info(index)?;
            if info.name == section.name() {
                let data = access.load_section(index)?.unwrap_or_default();
                let size = (info.size as usize).min(data.len());
                return Ok(Slice::new(&data[..size], endian));
            }
        }

        Ok(Slice::new(&[], endian))
    })
}

/// A function symbol extracted from the DWARF information.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DwarfFunction {
    /// The function's address relative to the image base.
    pub rva: u64,
    /// The size of the function body, if declared.
    pub size: Option<u64>,
    /// The linkage name if present, otherwise the source-level name.
    pub name: String,
}

/// A source-line record extracted from the DWARF line programs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DwarfLineRecord {
    /// The instruction address relative to the image base.
    pub rva: u64,
    /// The 1-based line number.
    pub line: u32,
    /// The path of the source file.
    pub file: String,
}

fn entry_name<'data>(
    dwarf: &DwarfInner<'data>,
    unit: &Unit<'data>,
    entry: &Die<'data, '_>,
) -> Result<Option<String>, DwarfError> {
    for attribute in [constants::DW_AT_linkage_name, constants::DW_AT_name] {
        if let Some(value) = entry.attr_value(attribute)? {
            if let Ok(string) = dwarf.attr_string(unit, value) {
                return Ok(Some(string.to_string_lossy().into_owned()));
            }
        }
    }

    Ok(None)
}

/// Walks all compilation units and emits one record per function.
///
/// Addresses in the DWARF data are virtual addresses assuming the image's
/// preferred base; `image_base` rebases them to RVAs. Subprograms without an
/// address (declarations, fully inlined functions) are skipped. The sink
/// returns `false` to abort the walk early.
pub fn enumerate_functions<'data>(
    dwarf: &DwarfInner<'data>,
    image_base: u64,
    sink: &mut dyn FnMut(DwarfFunction) -> bool,
) -> Result<(), DwarfError> {
    let mut headers = dwarf.units();

    while let Some(header) = headers.next()? {
        let unit = dwarf.unit(header)?;

        let mut entries = unit.entries();
        while let Some((_, entry)) = entries.next_dfs()? {
            if entry.tag() != constants::DW_TAG_subprogram {
                continue;
            }

            let low_pc = match entry.attr_value(constants::DW_AT_low_pc)? {
                Some(AttributeValue::Addr(address)) if address != 0 => address,
                _ => continue,
            };

            let size = match entry.attr_value(constants::DW_AT_high_pc)? {
                Some(AttributeValue::Addr(end)) => end.checked_sub(low_pc),
                Some(AttributeValue::Udata(length)) => Some(length),
                _ => None,
            };

            let name = match entry_name(dwarf, &unit, entry)? {
                Some(name) => name,
                None => continue,
            };

            let function = DwarfFunction {
                rva: low_pc.wrapping_sub(image_base),
                size,
                name,
            };

            if !sink(function) {
                return Ok(());
            }
        }
    }

    Ok(())
}

/// Runs all line programs and emits one record per line row.
///
/// Rows without a line number and end-of-sequence markers are skipped. The
/// sink returns `false` to abort the walk early.
pub fn enumerate_lines<'data>(
    dwarf: &DwarfInner<'data>,
    image_base: u64,
    sink: &mut dyn FnMut(DwarfLineRecord) -> bool,
) -> Result<(), DwarfError> {
    let mut headers = dwarf.units();

    while let Some(header) = headers.next()? {
        let unit = dwarf.unit(header)?;

        let program = match unit.line_program.clone() {
            Some(program) => program,
            None => continue,
        };

        let mut rows = program.rows();
        while let Some((header, row)) = rows.next_row()? {
            if row.end_sequence() {
                continue;
            }

            let line = match row.line() {
                Some(line) => line.get() as u32,
                None => continue,
            };

            let file = match row.file(header) {
                Some(file) => file,
                None => continue,
            };

            let mut path = String::new();
            if let Some(directory) = file.directory(header) {
                if let Ok(directory) = dwarf.attr_string(&unit, directory) {
                    path.push_str(&directory.to_string_lossy());
                }
            }

            match dwarf.attr_string(&unit, file.path_name()) {
                Ok(name) => {
                    if !path.is_empty() && !path.ends_with('/') && !path.ends_with('\\') {
                        path.push('/');
                    }
                    path.push_str(&name.to_string_lossy());
                }
                Err(_) => continue,
            }

            let record = DwarfLineRecord {
                rva: row.address().wrapping_sub(image_base),
                line,
                file: path,
            };

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
    use crate::testutils::MinimalPe;

    #[test]
    fn test_null_section() {
        let image = MinimalPe::new().section(b".text\0\0\0", 0x1000, 0x200).build();
        let view = PeModuleView::parse(&image).unwrap();
        let access = PeObjectAccess::new(&view);

        let null = access.section_info(0).unwrap();
        assert_eq!(null.name, "");
        assert_eq!(null.size, 0);
        assert_eq!(access.load_section(0).unwrap(), None);
    }

    #[test]
    fn test_section_index_offset() {
        let image = MinimalPe::new()
            .section(b".text\0\0\0", 0x1000, 0x200)
            .section_with_data(".rdata", 0x2000, b"\x01\x02\x03\x04")
            .build();
        let view = PeModuleView::parse(&image).unwrap();
        let access = PeObjectAccess::new(&view);

        assert_eq!(access.section_count(), 3);
        assert_eq!(access.section_info(1).unwrap().name, ".text");
        assert_eq!(access.section_info(2).unwrap().name, ".rdata");
        assert_eq!(
            access.load_section(2).unwrap().unwrap(),
            &b"\x01\x02\x03\x04"[..]
        );
        assert!(access.section_info(3).is_err());
    }

    #[test]
    fn test_long_section_name_via_string_table() {
        let image = MinimalPe::new()
            .section_with_data(".debug_info", 0x3000, b"")
            .build();
        let view = PeModuleView::parse(&image).unwrap();
        let access = PeObjectAccess::new(&view);

        assert_eq!(access.section_info(1).unwrap().name, ".debug_info");
    }

    #[test]
    fn test_size_is_min_of_virtual_and_raw() {
        let image = MinimalPe::new()
            .section_with_virtual_size(b".data\0\0\0", 0x1000, 0x200, 0x80)
            .build();
        let view = PeModuleView::parse(&image).unwrap();
        let access = PeObjectAccess::new(&view);

        assert_eq!(access.section_info(1).unwrap().size, 0x80);
    }

    #[test]
    fn test_pointer_sizes() {
        let image = MinimalPe::new().section(b".text\0\0\0", 0x1000, 0x200).build();
        let view = PeModuleView::parse(&image).unwrap();
        let access = PeObjectAccess::new(&view);

        assert_eq!(access.pointer_size(), 8);
        assert_eq!(access.length_size(), 8);
        assert_eq!(access.endianity(), RunTimeEndian::Little);
    }

    #[test]
    fn test_load_dwarf_without_debug_sections() {
        let image = MinimalPe::new().section(b".text\0\0\0", 0x1000, 0x200).build();
        let view = PeModuleView::parse(&image).unwrap();
        let access = PeObjectAccess::new(&view);

        let dwarf = load_dwarf(&access).unwrap();

        let mut functions = Vec::new();
        enumerate_functions(&dwarf, 0x1_4000_0000, &mut |f| {
            functions.push(f);
            true
        })
        .unwrap();
        assert!(functions.is_empty());

        let mut lines = Vec::new();
        enumerate_lines(&dwarf, 0x1_4000_0000, &mut |l| {
            lines.push(l);
            true
        })
        .unwrap();
        assert!(lines.is_empty());
    }
}
