//! Undecoration of mangled MSVC symbol names.
//!
//! Symbols in Windows debug information carry names mangled by the compiler.
//! This crate turns them back into human-readable form. The flag surface
//! mirrors the classic `UNDNAME_*` constants so that callers can make the
//! same display choices the platform demangler offered; the heavy lifting is
//! delegated to the [`msvc-demangler`] crate.
//!
//! Names that do not start with the mangling sigil (`?`) have no undecorated
//! form. An undecoration whose output equals the input is likewise reported
//! as "no demangled form", so callers never store redundant copies.
//!
//! # Examples
//!
//! ```
//! use symsrc_demangle::{undecorate, UndecorateFlags};
//!
//! let name = undecorate("?bar@@YAHXZ", UndecorateFlags::COMPLETE);
//! assert_eq!(name.as_deref(), Some("int __cdecl bar(void)"));
//! ```
//!
//! [`msvc-demangler`]: https://docs.rs/msvc-demangler

#![warn(missing_docs)]

use msvc_demangler::DemangleFlags as MsvcFlags;

bitflags::bitflags! {
    /// Display choices for [`undecorate`].
    ///
    /// The values match the `UNDNAME_*` constants of the platform API, so a
    /// flag word recorded by an existing debugger configuration keeps its
    /// meaning.
    ///
    /// [`undecorate`]: fn.undecorate.html
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct UndecorateFlags: u32 {
        /// Removes leading underscores from Microsoft extended keywords.
        const NO_LEADING_UNDERSCORES = 0x1;
        /// Disables expansion of Microsoft extended keywords.
        const NO_MS_KEYWORDS = 0x2;
        /// Disables expansion of the return type for the primary declaration.
        const NO_FUNCTION_RETURNS = 0x4;
        /// Disables expansion of the declaration model.
        const NO_ALLOCATION_MODEL = 0x8;
        /// Disables expansion of the declaration language specifier.
        const NO_ALLOCATION_LANGUAGE = 0x10;
        /// Disables expansion of Microsoft keywords on the `this` type.
        const NO_MS_THISTYPE = 0x20;
        /// Disables expansion of CV modifiers on the `this` type.
        const NO_CV_THISTYPE = 0x40;
        /// Disables all modifiers on the `this` type.
        const NO_THISTYPE = Self::NO_MS_THISTYPE.bits() | Self::NO_CV_THISTYPE.bits();
        /// Disables expansion of access specifiers for members.
        const NO_ACCESS_SPECIFIERS = 0x80;
        /// Disables expansion of throw-signatures for functions and pointers
        /// to functions.
        const NO_THROW_SIGNATURES = 0x100;
        /// Disables expansion of the static or virtual member specifier.
        const NO_MEMBER_TYPE = 0x200;
        /// Disables expansion of the Microsoft model for UDT returns.
        const NO_RETURN_UDT_MODEL = 0x400;
        /// Gets only the name for the primary declaration: `scope::…::name`.
        /// Template parameters are still expanded.
        const NAME_ONLY = 0x1000;
        /// The input is a bare type encoding rather than a symbol name.
        const TYPE_ONLY = 0x2000;
        /// Suppresses `enum`/`class`/`struct`/`union` tags.
        const NO_ECSU = 0x8000;
        /// Does not include `__ptr64` annotations in the output.
        const NO_PTR64 = 0x20000;
    }
}

impl UndecorateFlags {
    /// Enables full undecoration.
    pub const COMPLETE: UndecorateFlags = UndecorateFlags::empty();
}

/// The sigil that starts every MSVC-mangled name.
pub const MANGLED_SIGIL: char = '?';

/// Tests whether a raw symbol name carries an MSVC mangling.
///
/// Only names starting with the mangling sigil can be undecorated; callers
/// use this to avoid invoking the demangler on plain names.
pub fn is_mangled(name: &str) -> bool {
    name.starts_with(MANGLED_SIGIL)
}

fn translate_flags(flags: UndecorateFlags) -> MsvcFlags {
    let mut msvc = MsvcFlags::COMPLETE;

    if flags.contains(UndecorateFlags::NO_LEADING_UNDERSCORES) {
        msvc |= MsvcFlags::NO_LEADING_UNDERSCORES;
    }
    if flags.contains(UndecorateFlags::NO_MS_KEYWORDS) {
        msvc |= MsvcFlags::NO_MS_KEYWORDS;
    }
    if flags.contains(UndecorateFlags::NO_FUNCTION_RETURNS) {
        msvc |= MsvcFlags::NO_FUNCTION_RETURNS;
    }
    if flags.contains(UndecorateFlags::NO_ALLOCATION_MODEL) {
        msvc |= MsvcFlags::NO_ALLOCATION_MODEL;
    }
    if flags.contains(UndecorateFlags::NO_ALLOCATION_LANGUAGE) {
        msvc |= MsvcFlags::NO_ALLOCATION_LANGUAGE;
    }
    if flags.contains(UndecorateFlags::NO_MS_THISTYPE) {
        msvc |= MsvcFlags::NO_MS_THISTYPE;
    }
    if flags.contains(UndecorateFlags::NO_CV_THISTYPE) {
        msvc |= MsvcFlags::NO_CV_THISTYPE;
    }
    if flags.contains(UndecorateFlags::NO_ACCESS_SPECIFIERS) {
        msvc |= MsvcFlags::NO_ACCESS_SPECIFIERS;
    }
    if flags.contains(UndecorateFlags::NO_THROW_SIGNATURES) {
        msvc |= MsvcFlags::NO_THROW_SIGNATURES;
    }
    if flags.contains(UndecorateFlags::NO_MEMBER_TYPE) {
        msvc |= MsvcFlags::NO_MEMBER_TYPE;
    }
    if flags.contains(UndecorateFlags::NO_RETURN_UDT_MODEL) {
        msvc |= MsvcFlags::NO_RETURN_UDT_MODEL;
    }
    if flags.contains(UndecorateFlags::NAME_ONLY) {
        msvc |= MsvcFlags::NAME_ONLY;
    }
    if flags.contains(UndecorateFlags::NO_ECSU) {
        msvc |= MsvcFlags::NO_CLASS_TYPE;
    }
    // NO_PTR64 and TYPE_ONLY have no backend equivalent; `__ptr64` output is
    // only controlled through the MS-keyword expansion, and bare type
    // encodings are undecorated best-effort.

    msvc
}

/// Undecorates a mangled symbol name.
///
/// Returns `None` when the name has no demangled form: the input does not
/// parse as a mangled name, or the undecorated output equals the input.
pub fn undecorate(name: &str, flags: UndecorateFlags) -> Option<String> {
    let undecorated = msvc_demangler::demangle(name, translate_flags(flags)).ok()?;

    if undecorated == name {
        None
    } else {
        Some(undecorated)
    }
}

/// Undecorates a mangled symbol name into a caller-supplied buffer.
///
/// The buffer is cleared first and reused across calls, so a loader walking
/// many symbols amortizes its allocations. Returns `true` when a demangled
/// form was produced.
pub fn undecorate_into(name: &str, flags: UndecorateFlags, buffer: &mut String) -> bool {
    buffer.clear();

    match undecorate(name, flags) {
        Some(undecorated) => {
            buffer.push_str(&undecorated);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_undecorate_complete() {
        assert_eq!(
            undecorate("?bar@@YAHXZ", UndecorateFlags::COMPLETE).as_deref(),
            Some("int __cdecl bar(void)")
        );
    }

    #[test]
    fn test_undecorate_name_only() {
        assert_eq!(
            undecorate("?bar@@YAHXZ", UndecorateFlags::NAME_ONLY).as_deref(),
            Some("bar")
        );
    }

    #[test]
    fn test_undecorate_no_function_returns() {
        let name = undecorate("?bar@@YAHXZ", UndecorateFlags::NO_FUNCTION_RETURNS).unwrap();
        assert!(!name.contains("int"), "return type not suppressed: {name}");
    }

    #[test]
    fn test_undecorate_plain_name() {
        assert_eq!(undecorate("main", UndecorateFlags::COMPLETE), None);
        assert!(!is_mangled("main"));
        assert!(!is_mangled("_imp__GetProcAddress"));
    }

    #[test]
    fn test_undecorate_invalid() {
        assert_eq!(undecorate("?", UndecorateFlags::COMPLETE), None);
    }

    #[test]
    fn test_undecorate_into_reuses_buffer() {
        let mut buffer = String::from("stale");

        assert!(undecorate_into(
            "?bar@@YAHXZ",
            UndecorateFlags::COMPLETE,
            &mut buffer
        ));
        assert_eq!(buffer, "int __cdecl bar(void)");

        assert!(!undecorate_into("main", UndecorateFlags::COMPLETE, &mut buffer));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_thistype_flag_is_composite() {
        assert_eq!(
            UndecorateFlags::NO_THISTYPE,
            UndecorateFlags::NO_MS_THISTYPE | UndecorateFlags::NO_CV_THISTYPE
        );
    }
}
