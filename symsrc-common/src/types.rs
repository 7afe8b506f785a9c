use std::fmt;
use std::str::FromStr;

/// An error returned for unknown or invalid [`SymbolKind`] names.
///
/// [`SymbolKind`]: enum.SymbolKind.html
#[derive(Debug)]
pub struct UnknownSymbolKindError;

impl fmt::Display for UnknownSymbolKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown symbol kind")
    }
}

impl std::error::Error for UnknownSymbolKindError {}

/// The kind of entity a symbol record describes.
///
/// The kinds map directly onto the tags of the debug information's lexical
/// hierarchy. Records promoted from the public symbol table additionally
/// carry the [`public_symbol`](struct.SymbolInfo.html#structfield.public_symbol)
/// flag.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone, Default)]
pub enum SymbolKind {
    /// A linker-visible public symbol.
    Public,

    /// A function with a body in the program.
    Function,

    /// A global or static data item.
    Data,

    /// A code label, usually the target of a jump.
    Label,

    /// A nested lexical scope inside a function.
    Block,

    /// The debug information did not declare a usable tag.
    #[default]
    Unknown,
}

impl SymbolKind {
    /// Returns the name of the symbol kind.
    pub fn name(self) -> &'static str {
        match self {
            SymbolKind::Public => "public",
            SymbolKind::Function => "function",
            SymbolKind::Data => "data",
            SymbolKind::Label => "label",
            SymbolKind::Block => "block",
            SymbolKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SymbolKind {
    type Err = UnknownSymbolKindError;

    fn from_str(string: &str) -> Result<SymbolKind, UnknownSymbolKindError> {
        Ok(match string {
            "public" => SymbolKind::Public,
            "function" => SymbolKind::Function,
            "data" => SymbolKind::Data,
            "label" => SymbolKind::Label,
            "block" => SymbolKind::Block,
            "unknown" => SymbolKind::Unknown,
            _ => return Err(UnknownSymbolKindError),
        })
    }
}

/// A normalized symbol record.
///
/// Records are produced by the lexical enumerator and the DWARF loader, and
/// are plain values: they carry no references back into the provider that
/// produced them. A record is only ever emitted with a valid [`rva`]; entries
/// the debug information failed to relocate are rejected before they reach
/// any index.
///
/// [`rva`]: struct.SymbolInfo.html#structfield.rva
#[derive(Clone, Default, Eq, PartialEq)]
pub struct SymbolInfo {
    /// The absolute address of the symbol after relocation by the load base.
    ///
    /// Zero means the address is unknown or not present.
    pub virtual_address: u64,

    /// The address of the symbol relative to the image base.
    pub rva: u64,

    /// The legacy section index from the debug information.
    pub segment: u32,

    /// The legacy section-relative offset from the debug information.
    pub offset: u32,

    /// The byte length of the symbol, if known.
    pub size: Option<u64>,

    /// Whether `size` was declared by the debug information.
    ///
    /// Sizes inferred from the distance to the next symbol leave this unset.
    pub perfect_size: bool,

    /// For nearest-lower lookups, the delta from the matched symbol's start.
    pub displacement: u64,

    /// The raw, possibly mangled name with any trailing parenthesized suffix
    /// stripped.
    pub name: String,

    /// The undecorated form of `name`.
    ///
    /// Only present when undecoration was requested, the raw name begins with
    /// the mangled-name sigil, and the result differs from `name`. Empty
    /// otherwise.
    pub undecorated_name: String,

    /// The kind of entity this record describes.
    pub kind: SymbolKind,

    /// Whether this record is (or was promoted from) a public symbol.
    pub public_symbol: bool,
}

impl SymbolInfo {
    /// Returns the best name available for display.
    ///
    /// Prefers the undecorated name when one was stored.
    pub fn display_name(&self) -> &str {
        if self.undecorated_name.is_empty() {
            &self.name
        } else {
            &self.undecorated_name
        }
    }

    /// Determines whether the given RVA is covered by this symbol.
    ///
    /// If the size is unknown, the address is assumed to be covered if it is
    /// at or past the symbol start. Otherwise, the address must be in the
    /// half-open interval `[rva, rva + size)`.
    pub fn contains(&self, rva: u64) -> bool {
        rva >= self.rva && self.size.map_or(true, |size| rva < self.rva + size)
    }
}

impl fmt::Debug for SymbolInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolInfo")
            .field("name", &self.name)
            .field("rva", &format_args!("{:#x}", self.rva))
            .field("virtual_address", &format_args!("{:#x}", self.virtual_address))
            .field("size", &self.size)
            .field("kind", &self.kind)
            .field("public_symbol", &self.public_symbol)
            .finish()
    }
}

/// An address-to-source-line mapping record.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SourceLineInfo {
    /// The instruction address relative to the image base.
    pub rva: u64,

    /// Absolute line number starting at 1. Zero means no line number.
    pub line_number: u32,

    /// The name of the source file containing the line.
    pub source_file: String,
}
