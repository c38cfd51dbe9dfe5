//! Mach-O binary editor (spec components C6, C8), grounded on
//! `src/macos/binary_editor.cpp`.
//!
//! Supports 64-bit x86-64 `MH_EXECUTE` images only (spec.md §4.1: "reject
//! non-x86-64 fat binaries"); fat/universal binaries and 32-bit slices are
//! rejected at `build()`.

use scroll::{Pread, Pwrite, LE};

use crate::editor::{page_align_up, BinaryEditor, Section, SectionPrefix};
use crate::error::EditorError;
use crate::host::Address;

const MH_MAGIC_64: u32 = 0xfeedfacf;
const MH_EXECUTE: u32 = 0x2;
const CPU_TYPE_X86_64: u32 = 0x01000007;
const LC_SEGMENT_64: u32 = 0x19;
const LC_MAIN: u32 = 0x80000028;
const LC_UNIXTHREAD: u32 = 0x5;

const VM_PROT_READ: u32 = 0x1;
const VM_PROT_WRITE: u32 = 0x2;
const VM_PROT_EXECUTE: u32 = 0x4;

const NEW_SEGMENT_MIN_SIZE: u64 = 0x4000;

const MACH_HEADER_SIZE: usize = 32;
const SEGMENT_COMMAND_SIZE: usize = 72;
const SECTION_SIZE: usize = 80;
const LC_MAIN_SIZE: usize = 24;

#[derive(Debug, Clone, Default)]
struct MachSection {
    sectname: String,
    segname: String,
    addr: u64,
    size: u64,
    offset: u32,
    flags: u32,
    content: Vec<u8>,
}

impl SectionPrefix for MachEditor {
    const PREFIX: &'static str = "__";
}

pub struct MachEditor {
    entry_off: Option<u64>, // LC_MAIN entryoff, if present
    entry_va: Address,
    sections: Vec<Section>,
    text_index: usize,
    mod_init_func_index: Option<usize>,
    max_protection: u32,
    highest_va_end: Address,
    linkedit_is_last: bool,
}

fn read_cstr16(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

impl MachEditor {
    fn section_index(&self, name: &str) -> Option<usize> {
        self.sections.iter().position(|s| s.name == name)
    }
}

impl BinaryEditor for MachEditor {
    fn build(data: Vec<u8>, _path_hint: &str) -> Result<Self, EditorError> {
        if data.len() < MACH_HEADER_SIZE {
            return Err(EditorError::Malformed("truncated Mach-O header".into()));
        }
        let magic: u32 = data.pread_with(0, LE)?;
        if magic != MH_MAGIC_64 {
            return Err(EditorError::Malformed("not a 64-bit little-endian Mach-O (fat/32-bit binaries unsupported)".into()));
        }
        let cputype: u32 = data.pread_with(4, LE)?;
        if cputype != CPU_TYPE_X86_64 {
            return Err(EditorError::Malformed("non-x86-64 Mach-O slice".into()));
        }
        let filetype: u32 = data.pread_with(12, LE)?;
        if filetype != MH_EXECUTE {
            return Err(EditorError::Malformed("not MH_EXECUTE".into()));
        }
        let ncmds: u32 = data.pread_with(16, LE)?;

        let mut sections: Vec<Section> = Vec::new();
        let mut entry_off = None;
        let mut entry_va = 0u64;
        let mut highest_va_end = 0u64;
        let mut max_protection = VM_PROT_READ | VM_PROT_WRITE | VM_PROT_EXECUTE;
        let mut segment_order: Vec<(String, u64)> = Vec::new(); // (segname, file end)

        let mut off = MACH_HEADER_SIZE;
        for _ in 0..ncmds {
            let cmd: u32 = data.pread_with(off, LE)?;
            let cmdsize: u32 = data.pread_with(off + 4, LE)?;
            if cmd == LC_SEGMENT_64 {
                let mut name_buf = [0u8; 16];
                name_buf.copy_from_slice(&data[off + 8..off + 24]);
                let segname = read_cstr16(&name_buf);
                let vmaddr: u64 = data.pread_with(off + 24, LE)?;
                let _vmsize: u64 = data.pread_with(off + 32, LE)?;
                let fileoff: u64 = data.pread_with(off + 40, LE)?;
                let filesize: u64 = data.pread_with(off + 48, LE)?;
                let maxprot: u32 = data.pread_with(off + 56, LE)?;
                let nsects: u32 = data.pread_with(off + 64, LE)?;
                if segname != "__LINKEDIT" {
                    max_protection &= maxprot | VM_PROT_READ;
                }
                segment_order.push((segname.clone(), fileoff + filesize));

                let mut sect_off = off + SEGMENT_COMMAND_SIZE;
                for _ in 0..nsects {
                    let mut sname_buf = [0u8; 16];
                    sname_buf.copy_from_slice(&data[sect_off..sect_off + 16]);
                    let sectname = read_cstr16(&sname_buf);
                    let mut segname_buf = [0u8; 16];
                    segname_buf.copy_from_slice(&data[sect_off + 16..sect_off + 32]);
                    let sect_segname = read_cstr16(&segname_buf);
                    let addr: u64 = data.pread_with(sect_off + 32, LE)?;
                    let size: u64 = data.pread_with(sect_off + 40, LE)?;
                    let file_offset: u32 = data.pread_with(sect_off + 48, LE)?;
                    let flags: u32 = data.pread_with(sect_off + 64, LE)?;

                    let name = format!("{}{}", sect_segname, sectname);
                    let content = if size > 0 && file_offset as u64 + size <= data.len() as u64 {
                        data[file_offset as usize..(file_offset as u64 + size) as usize].to_vec()
                    } else {
                        Vec::new()
                    };
                    highest_va_end = highest_va_end.max(addr + size);
                    if sectname == "__text" {
                        // text_index resolved after the loop
                    }
                    if sectname == "__mod_init_func" {
                        // mod_init_func_index resolved after the loop
                    }
                    sections.push(Section {
                        name,
                        va: addr,
                        file_offset: file_offset as u64,
                        size,
                        executable: segname == "__TEXT",
                        writable: segname != "__TEXT",
                        content,
                    });
                    let _ = flags;
                    sect_off += SECTION_SIZE;
                }
            } else if cmd == LC_MAIN {
                let off_val: u64 = data.pread_with(off + 8, LE)?;
                entry_off = Some(off_val);
            } else if cmd == LC_UNIXTHREAD {
                // legacy entry point form; not parsed further, LC_MAIN is
                // what every modern macOS linker emits and is all this
                // crate supports.
            }
            off += cmdsize as usize;
        }

        let text_index = sections.iter().position(|s| s.name == "__TEXT__text").ok_or_else(|| EditorError::Malformed("__TEXT,__text section not found".into()))?;
        let mod_init_func_index = sections.iter().position(|s| s.name == "__DATA_CONST__mod_init_func" || s.name.ends_with("__mod_init_func"));

        if let Some(entry_off) = entry_off {
            entry_va = sections[text_index].va - sections[text_index].file_offset + entry_off;
        }

        segment_order.sort_by_key(|(_, end)| *end);
        let linkedit_is_last = segment_order.last().map(|(name, _)| name == "__LINKEDIT").unwrap_or(false);

        Ok(MachEditor {
            entry_off,
            entry_va,
            sections,
            text_index,
            mod_init_func_index,
            max_protection: max_protection & 0x7,
            highest_va_end,
            linkedit_is_last,
        })
    }

    fn first_execution_va(&self) -> Address {
        if let Some(idx) = self.mod_init_func_index {
            if self.sections[idx].size >= 8 {
                return u64::from_le_bytes(self.sections[idx].content[0..8].try_into().unwrap());
            }
        }
        self.entry_va
    }

    fn exec_first(&mut self, va: Address) -> Address {
        let prev = self.first_execution_va();
        if let Some(idx) = self.mod_init_func_index {
            if self.sections[idx].content.len() < 8 {
                self.sections[idx].content.resize(8, 0);
            }
            self.sections[idx].content[0..8].copy_from_slice(&va.to_le_bytes());
            self.sections[idx].size = self.sections[idx].content.len() as u64;
        } else {
            self.entry_va = va;
        }
        prev
    }

    fn text_section_va(&self) -> Address {
        self.sections[self.text_index].va
    }

    fn text_section_size(&self) -> u64 {
        self.sections[self.text_index].size
    }

    fn text_section_content(&self) -> &[u8] {
        &self.sections[self.text_index].content
    }

    fn text_section_ra(&self, entry_point_ra: Address) -> Address {
        entry_point_ra - (self.entry_va - self.text_section_va())
    }

    fn inject_section(&mut self, name: &str, content: &[u8]) -> Result<(), EditorError> {
        if !self.linkedit_is_last {
            return Err(EditorError::Malformed("__LINKEDIT is not the last segment; refusing to inject".into()));
        }
        let full_name = format!("__NEW{}{}", Self::PREFIX, name);
        if self.section_index(&full_name).is_some() {
            return Err(EditorError::SectionAlreadyExists(full_name));
        }
        let content = if content.is_empty() { vec![0u8] } else { content.to_vec() };
        let seg_size = (content.len() as u64).max(NEW_SEGMENT_MIN_SIZE);
        let seg_size = page_align_up(seg_size);

        let va = page_align_up(self.highest_va_end) + 0x1000;
        self.highest_va_end = va + seg_size;

        self.sections.push(Section {
            name: full_name,
            va,
            file_offset: 0, // assigned at save time
            size: content.len() as u64,
            executable: true,
            writable: false,
            content,
        });
        Ok(())
    }

    fn update_content(&mut self, name: &str, content: &[u8]) -> Result<(), EditorError> {
        let idx = self.section_index(name).ok_or_else(|| EditorError::SectionNotFound(name.to_string()))?;
        self.sections[idx].content = content.to_vec();
        self.sections[idx].size = content.len() as u64;
        Ok(())
    }

    fn calculate_va(&self, name: &str, offset: u64) -> Result<Address, EditorError> {
        let section = self.sections.iter().find(|s| s.name == name).ok_or_else(|| EditorError::SectionNotFound(name.to_string()))?;
        if offset >= section.size {
            return Err(EditorError::InvalidOffset { section: name.to_string(), offset, size: section.size });
        }
        Ok(section.va + offset)
    }

    fn text_section_name(&self) -> &str {
        &self.sections[self.text_index].name
    }

    fn save_changes(&self, path: &str) -> Result<bool, EditorError> {
        if path.is_empty() {
            return Err(EditorError::MalformedPath);
        }

        // Simplified full rebuild: one LC_SEGMENT_64 per distinct segname,
        // one section per tracked `Section`, LC_MAIN last. Matches the
        // teacher's `MachWriter::write_into` full-rebuild pattern rather
        // than in-place patching.
        let mut seg_names: Vec<String> = Vec::new();
        for s in &self.sections {
            let seg = s.name.split("__").nth(1).map(|n| format!("__{n}")).unwrap_or_else(|| "__TEXT".to_string());
            if !seg_names.contains(&seg) {
                seg_names.push(seg);
            }
        }

        let ncmds = seg_names.len() as u32 + 1; // + LC_MAIN
        let mut sizeofcmds = 0u32;
        for seg in &seg_names {
            let nsects = self.sections.iter().filter(|s| s.name.starts_with(seg)).count() as u32;
            sizeofcmds += SEGMENT_COMMAND_SIZE as u32 + nsects * SECTION_SIZE as u32;
        }
        sizeofcmds += LC_MAIN_SIZE as u32;

        let mut out = vec![0u8; MACH_HEADER_SIZE];
        out.pwrite_with(MH_MAGIC_64, 0, LE)?;
        out.pwrite_with(CPU_TYPE_X86_64, 4, LE)?;
        out.pwrite_with(0x80000003u32, 8, LE)?; // CPU_SUBTYPE_X86_64_ALL | LIB64
        out.pwrite_with(MH_EXECUTE, 12, LE)?;
        out.pwrite_with(ncmds, 16, LE)?;
        out.pwrite_with(sizeofcmds, 20, LE)?;
        out.pwrite_with(0u32, 24, LE)?; // flags
        out.pwrite_with(0u32, 28, LE)?; // reserved

        let header_and_cmds_size = MACH_HEADER_SIZE as u64 + sizeofcmds as u64;
        let mut cursor = page_align_up(header_and_cmds_size);
        let mut body = Vec::new();
        let mut file_offsets = vec![0u64; self.sections.len()];
        for (idx, s) in self.sections.iter().enumerate() {
            let off = cursor + body.len() as u64;
            file_offsets[idx] = off;
            body.extend_from_slice(&s.content);
        }

        for seg in &seg_names {
            let members: Vec<usize> = self.sections.iter().enumerate().filter(|(_, s)| s.name.starts_with(seg.as_str())).map(|(i, _)| i).collect();
            let seg_vmaddr = members.iter().map(|&i| self.sections[i].va).min().unwrap_or(0);
            let seg_vmsize = members.iter().map(|&i| self.sections[i].va + self.sections[i].size).max().unwrap_or(0) - seg_vmaddr;
            let seg_fileoff = members.iter().map(|&i| file_offsets[i]).min().unwrap_or(0);
            let seg_filesize = members.iter().map(|&i| file_offsets[i] + self.sections[i].size).max().unwrap_or(0) - seg_fileoff;
            let executable = members.iter().any(|&i| self.sections[i].executable);
            let writable = members.iter().any(|&i| self.sections[i].writable);
            let prot = VM_PROT_READ | if executable { VM_PROT_EXECUTE } else { 0 } | if writable { VM_PROT_WRITE } else { 0 };

            let mut cmd_buf = vec![0u8; SEGMENT_COMMAND_SIZE];
            cmd_buf.pwrite_with(LC_SEGMENT_64, 0, LE)?;
            cmd_buf.pwrite_with(SEGMENT_COMMAND_SIZE as u32 + members.len() as u32 * SECTION_SIZE as u32, 4, LE)?;
            let mut segname_bytes = [0u8; 16];
            let bytes = seg.as_bytes();
            segname_bytes[..bytes.len().min(16)].copy_from_slice(&bytes[..bytes.len().min(16)]);
            cmd_buf[8..24].copy_from_slice(&segname_bytes);
            cmd_buf.pwrite_with(seg_vmaddr, 24, LE)?;
            cmd_buf.pwrite_with(seg_vmsize, 32, LE)?;
            cmd_buf.pwrite_with(seg_fileoff, 40, LE)?;
            cmd_buf.pwrite_with(seg_filesize, 48, LE)?;
            cmd_buf.pwrite_with(self.max_protection.min(prot | VM_PROT_READ), 56, LE)?;
            cmd_buf.pwrite_with(prot, 60, LE)?;
            cmd_buf.pwrite_with(members.len() as u32, 64, LE)?;
            cmd_buf.pwrite_with(0u32, 68, LE)?; // flags
            out.extend_from_slice(&cmd_buf);

            for &i in &members {
                let s = &self.sections[i];
                let (segpart, sectpart) = s.name.split_at(seg.len());
                let _ = segpart;
                let mut sect_buf = vec![0u8; SECTION_SIZE];
                let mut sectname_bytes = [0u8; 16];
                let b = sectpart.as_bytes();
                sectname_bytes[..b.len().min(16)].copy_from_slice(&b[..b.len().min(16)]);
                sect_buf[0..16].copy_from_slice(&sectname_bytes);
                sect_buf[16..32].copy_from_slice(&segname_bytes);
                sect_buf.pwrite_with(s.va, 32, LE)?;
                sect_buf.pwrite_with(s.size, 40, LE)?;
                sect_buf.pwrite_with(file_offsets[i] as u32, 48, LE)?;
                sect_buf.pwrite_with(0u32, 52, LE)?; // align
                sect_buf.pwrite_with(0u32, 56, LE)?; // reloff
                sect_buf.pwrite_with(0u32, 60, LE)?; // nreloc
                sect_buf.pwrite_with(0u32, 64, LE)?; // flags
                out.extend_from_slice(&sect_buf);
            }
        }

        let entryoff = self.entry_off.unwrap_or(0);
        let mut main_buf = vec![0u8; LC_MAIN_SIZE];
        main_buf.pwrite_with(LC_MAIN, 0, LE)?;
        main_buf.pwrite_with(LC_MAIN_SIZE as u32, 4, LE)?;
        main_buf.pwrite_with(entryoff, 8, LE)?;
        main_buf.pwrite_with(0u64, 16, LE)?; // stacksize
        out.extend_from_slice(&main_buf);

        out.resize(cursor as usize, 0);
        cursor = out.len() as u64;
        let _ = cursor;
        out.extend_from_slice(&body);

        std::fs::write(path, &out)?;
        Ok(false) // Mach-O: no trailer bytes survive save_changes
    }
}
