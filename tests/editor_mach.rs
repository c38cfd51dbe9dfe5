//! Mach-O editor integration coverage beyond the inline unit tests:
//! `__LINKEDIT`-last gating on section injection (spec.md §9 Open
//! Question 3) and a full inject/save/reparse round trip.

use polyforge::editor::mach::MachEditor;
use polyforge::editor::BinaryEditor;
use polyforge::error::EditorError;
use scroll::{Pwrite, LE};

const MH_MAGIC_64: u32 = 0xfeedfacf;
const MH_EXECUTE: u32 = 0x2;
const CPU_TYPE_X86_64: u32 = 0x01000007;
const LC_SEGMENT_64: u32 = 0x19;
const LC_MAIN: u32 = 0x80000028;
const VM_PROT_READ: u32 = 0x1;
const VM_PROT_EXECUTE: u32 = 0x4;
const MACH_HEADER_SIZE: usize = 32;
const SEGMENT_COMMAND_SIZE: usize = 72;
const SECTION_SIZE: usize = 80;
const LC_MAIN_SIZE: usize = 24;

fn page_align_up(n: u64) -> u64 {
    n.div_ceil(0x1000) * 0x1000
}

/// `__TEXT` segment with one `__text` section, optionally followed by an
/// empty `__LINKEDIT` segment.
fn build_macho(with_linkedit: bool) -> Vec<u8> {
    let text = vec![0x90u8; 16];
    let nsegs = if with_linkedit { 2 } else { 1 };
    let ncmds = nsegs + 1;
    let mut sizeofcmds = SEGMENT_COMMAND_SIZE as u32 + SECTION_SIZE as u32 + LC_MAIN_SIZE as u32;
    if with_linkedit {
        sizeofcmds += SEGMENT_COMMAND_SIZE as u32;
    }

    let mut out = vec![0u8; MACH_HEADER_SIZE];
    out.pwrite_with(MH_MAGIC_64, 0, LE).unwrap();
    out.pwrite_with(CPU_TYPE_X86_64, 4, LE).unwrap();
    out.pwrite_with(0x80000003u32, 8, LE).unwrap();
    out.pwrite_with(MH_EXECUTE, 12, LE).unwrap();
    out.pwrite_with(ncmds, 16, LE).unwrap();
    out.pwrite_with(sizeofcmds, 20, LE).unwrap();

    let header_and_cmds = MACH_HEADER_SIZE as u64 + sizeofcmds as u64;
    let text_fileoff = page_align_up(header_and_cmds);
    let text_vmaddr = 0x100000000u64 + text_fileoff;

    let mut seg = vec![0u8; SEGMENT_COMMAND_SIZE];
    seg.pwrite_with(LC_SEGMENT_64, 0, LE).unwrap();
    seg.pwrite_with(SEGMENT_COMMAND_SIZE as u32 + SECTION_SIZE as u32, 4, LE).unwrap();
    seg[8..14].copy_from_slice(b"__TEXT");
    seg.pwrite_with(text_vmaddr, 24, LE).unwrap();
    seg.pwrite_with(text.len() as u64, 32, LE).unwrap();
    seg.pwrite_with(text_fileoff, 40, LE).unwrap();
    seg.pwrite_with(text.len() as u64, 48, LE).unwrap();
    seg.pwrite_with(VM_PROT_READ | VM_PROT_EXECUTE, 56, LE).unwrap();
    seg.pwrite_with(VM_PROT_READ | VM_PROT_EXECUTE, 60, LE).unwrap();
    seg.pwrite_with(1u32, 64, LE).unwrap();
    out.extend_from_slice(&seg);

    let mut sect = vec![0u8; SECTION_SIZE];
    sect[0..6].copy_from_slice(b"__text");
    sect[16..22].copy_from_slice(b"__TEXT");
    sect.pwrite_with(text_vmaddr, 32, LE).unwrap();
    sect.pwrite_with(text.len() as u64, 40, LE).unwrap();
    sect.pwrite_with(text_fileoff as u32, 48, LE).unwrap();
    out.extend_from_slice(&sect);

    if with_linkedit {
        let linkedit_fileoff = text_fileoff + text.len() as u64;
        let mut le = vec![0u8; SEGMENT_COMMAND_SIZE];
        le.pwrite_with(LC_SEGMENT_64, 0, LE).unwrap();
        le.pwrite_with(SEGMENT_COMMAND_SIZE as u32, 4, LE).unwrap();
        le[8..18].copy_from_slice(b"__LINKEDIT");
        le.pwrite_with(text_vmaddr + text.len() as u64, 24, LE).unwrap();
        le.pwrite_with(0u64, 32, LE).unwrap();
        le.pwrite_with(linkedit_fileoff, 40, LE).unwrap();
        le.pwrite_with(0u64, 48, LE).unwrap();
        le.pwrite_with(VM_PROT_READ, 56, LE).unwrap();
        le.pwrite_with(VM_PROT_READ, 60, LE).unwrap();
        le.pwrite_with(0u32, 64, LE).unwrap();
        out.extend_from_slice(&le);
    }

    let mut main_cmd = vec![0u8; LC_MAIN_SIZE];
    main_cmd.pwrite_with(LC_MAIN, 0, LE).unwrap();
    main_cmd.pwrite_with(LC_MAIN_SIZE as u32, 4, LE).unwrap();
    main_cmd.pwrite_with(4u64, 8, LE).unwrap();
    out.extend_from_slice(&main_cmd);

    out.resize(text_fileoff as usize, 0);
    out.extend_from_slice(&text);
    out
}

#[test]
fn injection_allowed_when_linkedit_is_last() {
    let mut editor = MachEditor::build(build_macho(true), "test").unwrap();
    editor.inject_section("stub", &[0xAAu8; 64]).unwrap();

    let path = std::env::temp_dir().join("polyforge_mach_linkedit_last.bin");
    let survives = editor.save_changes(path.to_str().unwrap()).unwrap();
    assert!(!survives);

    let data = std::fs::read(&path).unwrap();
    let reparsed = MachEditor::build(data, "test").unwrap();
    assert!(reparsed.calculate_va("__NEW__stub", 0).is_ok());
    let _ = std::fs::remove_file(&path);
}

#[test]
fn injection_rejected_when_linkedit_is_not_last() {
    let mut editor = MachEditor::build(build_macho(false), "test").unwrap();
    let err = editor.inject_section("stub", &[0xAAu8; 64]).unwrap_err();
    assert!(matches!(err, EditorError::Malformed(_)));
}
