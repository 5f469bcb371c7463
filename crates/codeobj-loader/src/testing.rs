//! Test support: hand-assembled ELF64 little-endian objects.
//!
//! The builder lays sections out as
//! `null, .text, [.dynsym, .dynstr], [.symtab, .strtab], .shstrtab, extras…`
//! with the section header table either after the data (default) or right
//! after the file header ([`ElfBuilder::headers_first`]). Defined symbols
//! live in `.text`; undefined ones go to `.dynsym`. Header records are
//! `Pod` structs written with `bytemuck`, their fields stored little-endian.

use bytemuck::{Pod, Zeroable};
use goblin::elf::section_header::{SHT_DYNSYM, SHT_NOBITS, SHT_PROGBITS, SHT_STRTAB, SHT_SYMTAB};
use goblin::elf::sym::{STB_GLOBAL, STT_FUNC, STT_NOTYPE, STT_OBJECT};

/// Machine number of AMD GPU code objects.
pub const EM_AMDGPU: u16 = 224;

const EHDR_SIZE: usize = std::mem::size_of::<FileHeader>();
const SHDR_SIZE: usize = std::mem::size_of::<SectionHeader>();
const SYM_SIZE: usize = std::mem::size_of::<SymbolEntry>();
const PHDR_SIZE: u16 = 56;
const _: () = assert!(EHDR_SIZE == 64 && SHDR_SIZE == 64 && SYM_SIZE == 24);
const TEXT_INDEX: u16 = 1;

const SHF_WRITE: u64 = 0x1;
const SHF_ALLOC: u64 = 0x2;
const SHF_EXECINSTR: u64 = 0x4;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
struct FileHeader {
    ident: [u8; 16],
    kind: u16,
    machine: u16,
    version: u32,
    entry: u64,
    phoff: u64,
    shoff: u64,
    flags: u32,
    ehsize: u16,
    phentsize: u16,
    phnum: u16,
    shentsize: u16,
    shnum: u16,
    shstrndx: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
struct SectionHeader {
    name: u32,
    kind: u32,
    flags: u64,
    addr: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    addralign: u64,
    entsize: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
struct SymbolEntry {
    name: u32,
    info: u8,
    other: u8,
    shndx: u16,
    value: u64,
    size: u64,
}

#[derive(Debug, Clone)]
struct SymbolSpec {
    name: String,
    value: u64,
    size: u64,
    kind: u8,
    defined: bool,
}

#[derive(Debug, Clone)]
struct SectionSpec {
    name: String,
    kind: u32,
    flags: u64,
    data: Vec<u8>,
    nobits_size: u64,
    link: u32,
    info: u32,
    entsize: u64,
}

impl SectionSpec {
    fn new(name: &str, kind: u32, flags: u64, data: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            flags,
            data,
            nobits_size: 0,
            link: 0,
            info: 0,
            entsize: 0,
        }
    }

    fn size(&self) -> u64 {
        if self.kind == SHT_NOBITS {
            self.nobits_size
        } else {
            self.data.len() as u64
        }
    }
}

/// Builder for small, well-formed ELF objects.
#[derive(Debug, Clone)]
pub struct ElfBuilder {
    elf_type: u16,
    machine: u16,
    version: u32,
    headers_first: bool,
    with_sections: bool,
    text: Vec<u8>,
    symbols: Vec<SymbolSpec>,
    dynamic: Vec<SymbolSpec>,
    extras: Vec<SectionSpec>,
}

impl Default for ElfBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ElfBuilder {
    /// A position-independent AMD GPU object with an empty `.text`.
    pub fn new() -> Self {
        Self {
            elf_type: goblin::elf::header::ET_DYN,
            machine: EM_AMDGPU,
            version: 1,
            headers_first: false,
            with_sections: true,
            text: Vec::new(),
            symbols: Vec::new(),
            dynamic: Vec::new(),
            extras: Vec::new(),
        }
    }

    pub fn elf_type(mut self, elf_type: u16) -> Self {
        self.elf_type = elf_type;
        self
    }

    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    /// Sets both the identification and header version fields.
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Place the section header table directly after the file header.
    pub fn headers_first(mut self) -> Self {
        self.headers_first = true;
        self
    }

    /// Emit only the file header, with no section table.
    pub fn without_sections(mut self) -> Self {
        self.with_sections = false;
        self
    }

    pub fn text(mut self, bytes: Vec<u8>) -> Self {
        self.text = bytes;
        self
    }

    /// Defined function symbol in `.symtab`.
    pub fn function(mut self, name: &str, value: u64, size: u64) -> Self {
        self.symbols.push(defined(name, value, size, STT_FUNC));
        self
    }

    /// Defined data symbol in `.symtab`.
    pub fn object(mut self, name: &str, value: u64, size: u64) -> Self {
        self.symbols.push(defined(name, value, size, STT_OBJECT));
        self
    }

    /// Defined function symbol in `.dynsym`.
    pub fn dynamic_function(mut self, name: &str, value: u64, size: u64) -> Self {
        self.dynamic.push(defined(name, value, size, STT_FUNC));
        self
    }

    /// Defined data symbol in `.dynsym`.
    pub fn dynamic_object(mut self, name: &str, value: u64, size: u64) -> Self {
        self.dynamic.push(defined(name, value, size, STT_OBJECT));
        self
    }

    /// Undefined global reference in `.dynsym`.
    pub fn undefined(mut self, name: &str) -> Self {
        self.dynamic.push(SymbolSpec {
            name: name.to_string(),
            value: 0,
            size: 0,
            kind: STT_NOTYPE,
            defined: false,
        });
        self
    }

    /// Extra `SHT_PROGBITS` section appended after the string tables.
    pub fn progbits(mut self, name: &str, data: Vec<u8>) -> Self {
        self.extras
            .push(SectionSpec::new(name, SHT_PROGBITS, SHF_ALLOC, data));
        self
    }

    /// Extra `SHT_NOBITS` section appended after the string tables.
    pub fn nobits(mut self, name: &str, size: u64) -> Self {
        let mut section = SectionSpec::new(name, SHT_NOBITS, SHF_ALLOC | SHF_WRITE, Vec::new());
        section.nobits_size = size;
        self.extras.push(section);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        if !self.with_sections {
            let mut out = vec![0u8; EHDR_SIZE];
            self.write_header(&mut out, 0, 0, 0);
            return out;
        }

        let mut sections = vec![
            SectionSpec::new("", 0, 0, Vec::new()),
            SectionSpec::new(".text", SHT_PROGBITS, SHF_ALLOC | SHF_EXECINSTR, self.text.clone()),
        ];
        if !self.dynamic.is_empty() {
            push_symbol_table(&mut sections, ".dynsym", SHT_DYNSYM, ".dynstr", &self.dynamic);
        }
        if !self.symbols.is_empty() {
            push_symbol_table(&mut sections, ".symtab", SHT_SYMTAB, ".strtab", &self.symbols);
        }

        let shstrndx = sections.len();
        sections.push(SectionSpec::new(".shstrtab", SHT_STRTAB, 0, Vec::new()));
        sections.extend(self.extras.iter().cloned());

        let mut shstrtab = StringTable::new();
        let name_offsets: Vec<u32> = sections.iter().map(|s| shstrtab.add(&s.name)).collect();
        sections[shstrndx].data = shstrtab.into_bytes();

        let table_size = SHDR_SIZE * sections.len();
        let mut cursor = EHDR_SIZE;
        let mut shoff = 0;
        if self.headers_first {
            shoff = cursor;
            cursor += table_size;
        }

        let mut offsets = vec![0u64; sections.len()];
        for (index, section) in sections.iter().enumerate().skip(1) {
            cursor = align_up(cursor, 8);
            offsets[index] = cursor as u64;
            if section.kind != SHT_NOBITS {
                cursor += section.data.len();
            }
        }
        if !self.headers_first {
            cursor = align_up(cursor, 8);
            shoff = cursor;
            cursor += table_size;
        }

        let mut out = vec![0u8; cursor];
        self.write_header(&mut out, shoff as u64, sections.len() as u16, shstrndx as u16);

        for (index, section) in sections.iter().enumerate() {
            let start = offsets[index] as usize;
            if section.kind != SHT_NOBITS {
                out[start..start + section.data.len()].copy_from_slice(&section.data);
            }

            let shdr = SectionHeader {
                name: name_offsets[index].to_le(),
                kind: section.kind.to_le(),
                flags: section.flags.to_le(),
                addr: 0,
                offset: offsets[index].to_le(),
                size: section.size().to_le(),
                link: section.link.to_le(),
                info: section.info.to_le(),
                addralign: if index == 0 { 0 } else { 8u64.to_le() },
                entsize: section.entsize.to_le(),
            };
            let at = shoff + index * SHDR_SIZE;
            out[at..at + SHDR_SIZE].copy_from_slice(bytemuck::bytes_of(&shdr));
        }

        out
    }

    fn write_header(&self, out: &mut [u8], shoff: u64, shnum: u16, shstrndx: u16) {
        let mut ident = [0u8; 16];
        ident[..4].copy_from_slice(b"\x7fELF");
        ident[4] = 2; // ELFCLASS64
        ident[5] = 1; // ELFDATA2LSB
        ident[6] = self.version as u8;

        let header = FileHeader {
            ident,
            kind: self.elf_type.to_le(),
            machine: self.machine.to_le(),
            version: self.version.to_le(),
            shoff: shoff.to_le(),
            ehsize: (EHDR_SIZE as u16).to_le(),
            phentsize: PHDR_SIZE.to_le(),
            shentsize: if shnum == 0 { 0 } else { (SHDR_SIZE as u16).to_le() },
            shnum: shnum.to_le(),
            shstrndx: shstrndx.to_le(),
            ..FileHeader::default()
        };
        out[..EHDR_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
    }
}

fn defined(name: &str, value: u64, size: u64, kind: u8) -> SymbolSpec {
    SymbolSpec {
        name: name.to_string(),
        value,
        size,
        kind,
        defined: true,
    }
}

fn push_symbol_table(
    sections: &mut Vec<SectionSpec>,
    name: &str,
    kind: u32,
    strtab_name: &str,
    symbols: &[SymbolSpec],
) {
    let mut strings = StringTable::new();
    let mut data = vec![0u8; SYM_SIZE];
    for symbol in symbols {
        let name_offset = strings.add(&symbol.name);
        let entry = SymbolEntry {
            name: name_offset.to_le(),
            info: (STB_GLOBAL << 4) | symbol.kind,
            other: 0,
            shndx: if symbol.defined { TEXT_INDEX.to_le() } else { 0 },
            value: symbol.value.to_le(),
            size: symbol.size.to_le(),
        };
        data.extend_from_slice(bytemuck::bytes_of(&entry));
    }

    let table_index = sections.len();
    let mut table = SectionSpec::new(name, kind, SHF_ALLOC, data);
    table.link = (table_index + 1) as u32;
    table.info = 1;
    table.entsize = SYM_SIZE as u64;
    sections.push(table);
    sections.push(SectionSpec::new(strtab_name, SHT_STRTAB, SHF_ALLOC, strings.into_bytes()));
}

struct StringTable {
    bytes: Vec<u8>,
}

impl StringTable {
    fn new() -> Self {
        Self { bytes: vec![0] }
    }

    fn add(&mut self, name: &str) -> u32 {
        if name.is_empty() {
            return 0;
        }
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(0);
        offset
    }

    fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}
