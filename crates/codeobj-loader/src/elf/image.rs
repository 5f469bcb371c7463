//! Object header, section table and extent computation

use goblin::container::{Container, Ctx};
use goblin::elf::header::{Header, ET_DYN};
use goblin::elf::section_header::{SectionHeader, SHT_DYNSYM, SHT_NOBITS, SHT_SYMTAB};
use goblin::elf::sym::Symtab;
use goblin::elf::Elf;
use goblin::strtab::Strtab;

use super::symbols::SymbolTable;
use super::ElfError;

/// The only object version this reader accepts.
pub const EV_CURRENT: u32 = 1;

const EI_VERSION: usize = 6;

/// One entry of the section header table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionInfo<'a> {
    pub index: usize,
    /// Name from the section-name string table, if resolvable
    pub name: Option<&'a str>,
    /// `sh_type`
    pub kind: u32,
    pub offset: u64,
    pub size: u64,
    pub link: u32,
    pub entry_size: u64,
}

impl SectionInfo<'_> {
    /// Whether the section occupies bytes in the file image.
    pub fn has_file_data(&self) -> bool {
        self.kind != SHT_NOBITS
    }
}

/// A parsed, borrowed view of an ELF object.
///
/// Parsing validates the identification bytes, the version marker and the
/// section header table bounds; symbol tables are decoded on demand.
pub struct ElfImage<'a> {
    bytes: &'a [u8],
    header: Header,
    ctx: Ctx,
    sections: Vec<SectionHeader>,
    section_names: Option<Strtab<'a>>,
}

impl<'a> ElfImage<'a> {
    /// Parse `bytes` as an ELF object.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ElfError> {
        let header = Elf::parse_header(bytes)?;
        if header.e_version != EV_CURRENT {
            return Err(ElfError::UnsupportedVersion(header.e_version));
        }
        if u32::from(header.e_ident[EI_VERSION]) != EV_CURRENT {
            return Err(ElfError::UnsupportedVersion(u32::from(header.e_ident[EI_VERSION])));
        }

        let ctx = Ctx::new(header.container()?, header.endianness()?);
        let sections = Self::parse_sections(bytes, &header, ctx)?;

        let section_names = sections
            .get(header.e_shstrndx as usize)
            .filter(|sh| sh.sh_type != SHT_NOBITS)
            .filter(|sh| in_bounds(bytes, sh.sh_offset, sh.sh_size))
            .and_then(|sh| Strtab::parse(bytes, sh.sh_offset as usize, sh.sh_size as usize, 0x0).ok());

        Ok(Self {
            bytes,
            header,
            ctx,
            sections,
            section_names,
        })
    }

    fn parse_sections(bytes: &[u8], header: &Header, ctx: Ctx) -> Result<Vec<SectionHeader>, ElfError> {
        // An object may legitimately carry no section table at all.
        if header.e_shnum == 0 || header.e_shoff == 0 {
            return Ok(Vec::new());
        }

        let expected = match ctx.container {
            Container::Big => 64,
            Container::Little => 40,
        };
        if header.e_shentsize != expected {
            return Err(ElfError::BadSectionEntrySize {
                found: header.e_shentsize,
                expected,
            });
        }

        let table_size = u64::from(header.e_shentsize) * u64::from(header.e_shnum);
        if !in_bounds(bytes, header.e_shoff, table_size) {
            return Err(ElfError::Truncated {
                what: "section header table",
                offset: header.e_shoff,
                size: table_size,
                len: bytes.len(),
            });
        }

        Ok(SectionHeader::parse(
            bytes,
            header.e_shoff as usize,
            header.e_shnum as usize,
            ctx,
        )?)
    }

    /// Raw image bytes.
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// `e_machine` of the object (e.g. `EM_AMDGPU`).
    pub fn machine(&self) -> u16 {
        self.header.e_machine
    }

    /// Whether the object is position independent (`ET_DYN`).
    pub fn is_position_independent(&self) -> bool {
        self.header.e_type == ET_DYN
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    /// Iterate over the section header table in index order.
    pub fn sections(&self) -> impl Iterator<Item = SectionInfo<'a>> + '_ {
        (0..self.sections.len()).map(move |index| self.section(index))
    }

    fn section(&self, index: usize) -> SectionInfo<'a> {
        let sh = &self.sections[index];
        SectionInfo {
            index,
            name: self.section_names.as_ref().and_then(|names| names.get_at(sh.sh_name)),
            kind: sh.sh_type,
            offset: sh.sh_offset,
            size: sh.sh_size,
            link: sh.sh_link,
            entry_size: sh.sh_entsize,
        }
    }

    /// First section of the given `sh_type`.
    pub fn find_section(&self, kind: u32) -> Option<SectionInfo<'a>> {
        self.sections().find(|section| section.kind == kind)
    }

    /// First section whose name matches.
    pub fn section_by_name(&self, name: &str) -> Option<SectionInfo<'a>> {
        self.sections().find(|section| section.name == Some(name))
    }

    /// Static symbol table (`SHT_SYMTAB`), if present.
    pub fn symbol_table(&self) -> Result<Option<SymbolTable<'a>>, ElfError> {
        self.find_section(SHT_SYMTAB)
            .map(|section| self.symbol_table_at(section.index))
            .transpose()
    }

    /// Dynamic symbol table (`SHT_DYNSYM`), if present.
    pub fn dynamic_symbol_table(&self) -> Result<Option<SymbolTable<'a>>, ElfError> {
        self.find_section(SHT_DYNSYM)
            .map(|section| self.symbol_table_at(section.index))
            .transpose()
    }

    /// Decode the symbol table stored in section `index` together with the
    /// string table it links to.
    pub fn symbol_table_at(&self, index: usize) -> Result<SymbolTable<'a>, ElfError> {
        let sh = &self.sections[index];
        let sym_size = match self.ctx.container {
            Container::Big => 24u64,
            Container::Little => 16u64,
        };
        if sh.sh_entsize != 0 && sh.sh_entsize != sym_size {
            return Err(ElfError::BadSymbolEntrySize {
                section: index,
                found: sh.sh_entsize,
                expected: sym_size,
            });
        }
        if !in_bounds(self.bytes, sh.sh_offset, sh.sh_size) {
            return Err(ElfError::Truncated {
                what: "symbol table",
                offset: sh.sh_offset,
                size: sh.sh_size,
                len: self.bytes.len(),
            });
        }

        let strtab = self
            .sections
            .get(sh.sh_link as usize)
            .filter(|link| link.sh_type != SHT_NOBITS)
            .ok_or(ElfError::InvalidLink {
                section: index,
                link: sh.sh_link,
            })?;
        if !in_bounds(self.bytes, strtab.sh_offset, strtab.sh_size) {
            return Err(ElfError::Truncated {
                what: "string table",
                offset: strtab.sh_offset,
                size: strtab.sh_size,
                len: self.bytes.len(),
            });
        }

        let count = (sh.sh_size / sym_size) as usize;
        let symbols = Symtab::parse(self.bytes, sh.sh_offset as usize, count, self.ctx)?;
        let names = Strtab::parse(self.bytes, strtab.sh_offset as usize, strtab.sh_size as usize, 0x0)?;

        Ok(SymbolTable::new(index, symbols, names))
    }

    /// Declared size of the first symbol named `name` across the static
    /// symbol tables, or zero when no such symbol exists.
    pub fn symbol_size(&self, name: &str) -> Result<u64, ElfError> {
        for section in self.sections().filter(|s| s.kind == SHT_SYMTAB) {
            let table = self.symbol_table_at(section.index)?;
            if let Some(symbol) = table.find(name) {
                return Ok(symbol.size);
            }
        }
        Ok(0)
    }

    /// Number of bytes the object occupies: the section that starts last,
    /// plus its file size, or the section header table if that comes later.
    ///
    /// This is how many bytes must be copied when the image is relocated
    /// into device-visible memory.
    pub fn extent(&self) -> u64 {
        let header = &self.header;
        let mut max_offset = header.e_shoff;
        let mut total = header
            .e_shoff
            .saturating_add(u64::from(header.e_shentsize) * u64::from(header.e_shnum));

        for sh in &self.sections {
            if sh.sh_offset > max_offset {
                max_offset = sh.sh_offset;
                total = max_offset;
                if sh.sh_type != SHT_NOBITS {
                    total = total.saturating_add(sh.sh_size);
                }
            }
        }

        total
    }
}

fn in_bounds(bytes: &[u8], offset: u64, size: u64) -> bool {
    offset
        .checked_add(size)
        .is_some_and(|end| end <= bytes.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ElfBuilder;
    use goblin::elf::section_header::SHT_PROGBITS;

    #[test]
    fn parses_sections_and_names() {
        let image = ElfBuilder::new()
            .text(vec![0xAA; 32])
            .function("kernel_a", 0, 32)
            .undefined("host_counter")
            .build();

        let elf = ElfImage::parse(&image).unwrap();
        let names: Vec<_> = elf.sections().filter_map(|s| s.name).collect();
        assert!(names.contains(&".text"));
        assert!(names.contains(&".symtab"));
        assert!(names.contains(&".dynsym"));

        let text = elf.section_by_name(".text").unwrap();
        assert_eq!(text.kind, SHT_PROGBITS);
        assert_eq!(text.size, 32);
        assert!(elf.is_position_independent());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut image = ElfBuilder::new().build();
        image[1] = b'X';
        assert!(matches!(ElfImage::parse(&image), Err(ElfError::Decode(_))));
    }

    #[test]
    fn rejects_non_current_version() {
        let image = ElfBuilder::new().version(2).build();
        assert!(matches!(ElfImage::parse(&image), Err(ElfError::UnsupportedVersion(2))));
    }

    #[test]
    fn rejects_truncated_section_table() {
        let image = ElfBuilder::new().function("k", 0, 4).build();
        let cut = &image[..image.len() - 10];
        assert!(matches!(
            ElfImage::parse(cut),
            Err(ElfError::Truncated {
                what: "section header table",
                ..
            })
        ));
    }

    #[test]
    fn extent_covers_whole_image_and_ignores_trailing_bytes() {
        let mut image = ElfBuilder::new().text(vec![1; 100]).function("k", 0, 100).build();
        let exact = image.len() as u64;
        image.extend_from_slice(&[0xEE; 77]);

        let elf = ElfImage::parse(&image).unwrap();
        assert_eq!(elf.extent(), exact);
    }

    #[test]
    fn extent_excludes_trailing_nobits_size() {
        let image = ElfBuilder::new()
            .headers_first()
            .text(vec![3; 16])
            .nobits(".bss", 1 << 20)
            .build();

        let elf = ElfImage::parse(&image).unwrap();
        assert_eq!(elf.extent(), image.len() as u64);
    }

    #[test]
    fn extent_with_headers_first_ends_at_last_section() {
        let image = ElfBuilder::new()
            .headers_first()
            .text(vec![3; 16])
            .progbits(".rodata", vec![9; 40])
            .build();

        let elf = ElfImage::parse(&image).unwrap();
        let rodata = elf.section_by_name(".rodata").unwrap();
        assert_eq!(elf.extent(), rodata.offset + rodata.size);
        assert_eq!(elf.extent(), image.len() as u64);
    }

    #[test]
    fn symbol_size_finds_first_match_or_zero() {
        let image = ElfBuilder::new()
            .object("table", 0x40, 256)
            .object("table", 0x80, 8)
            .function("kern", 0, 64)
            .build();

        let elf = ElfImage::parse(&image).unwrap();
        assert_eq!(elf.symbol_size("table").unwrap(), 256);
        assert_eq!(elf.symbol_size("kern").unwrap(), 64);
        assert_eq!(elf.symbol_size("missing").unwrap(), 0);
    }

    #[test]
    fn object_without_symbols_reports_not_found() {
        let image = ElfBuilder::new().build();
        let elf = ElfImage::parse(&image).unwrap();
        assert!(elf.symbol_table().unwrap().is_none());
        assert_eq!(elf.symbol_size("anything").unwrap(), 0);
    }

    #[test]
    fn object_without_section_table_is_accepted() {
        let image = ElfBuilder::new().without_sections().build();
        let elf = ElfImage::parse(&image).unwrap();
        assert_eq!(elf.section_count(), 0);
        assert_eq!(elf.symbol_size("k").unwrap(), 0);
    }
}
