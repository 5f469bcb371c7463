//! Symbol table view

use goblin::elf::sym::{
    Sym, Symtab, STT_COMMON, STT_FILE, STT_FUNC, STT_NOTYPE, STT_OBJECT, STT_SECTION, STT_TLS,
};
use goblin::strtab::Strtab;

const SHN_UNDEF: usize = 0;

/// `STT_*` classification of a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolType {
    NoType,
    Object,
    Func,
    Section,
    File,
    Common,
    Tls,
    Other(u8),
}

impl From<u8> for SymbolType {
    fn from(value: u8) -> Self {
        match value {
            STT_NOTYPE => SymbolType::NoType,
            STT_OBJECT => SymbolType::Object,
            STT_FUNC => SymbolType::Func,
            STT_SECTION => SymbolType::Section,
            STT_FILE => SymbolType::File,
            STT_COMMON => SymbolType::Common,
            STT_TLS => SymbolType::Tls,
            other => SymbolType::Other(other),
        }
    }
}

/// A decoded symbol with its name resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfSymbol<'a> {
    /// Empty when the symbol is unnamed or its name offset is out of range
    pub name: &'a str,
    pub value: u64,
    pub size: u64,
    /// Index of the section the symbol is defined in; zero when undefined
    pub section_index: usize,
    pub kind: SymbolType,
    pub binding: u8,
}

impl ElfSymbol<'_> {
    pub fn is_undefined(&self) -> bool {
        self.section_index == SHN_UNDEF
    }
}

/// Symbols of one `SHT_SYMTAB` or `SHT_DYNSYM` section, paired with the
/// string table named by the section's link field.
pub struct SymbolTable<'a> {
    section_index: usize,
    symbols: Symtab<'a>,
    names: Strtab<'a>,
}

impl<'a> SymbolTable<'a> {
    pub(crate) fn new(section_index: usize, symbols: Symtab<'a>, names: Strtab<'a>) -> Self {
        Self {
            section_index,
            symbols,
            names,
        }
    }

    /// Section this table was read from.
    pub fn section_index(&self) -> usize {
        self.section_index
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ElfSymbol<'a>> + '_ {
        self.symbols.iter().map(move |sym| self.describe(&sym))
    }

    fn describe(&self, sym: &Sym) -> ElfSymbol<'a> {
        ElfSymbol {
            name: self.names.get_at(sym.st_name).unwrap_or(""),
            value: sym.st_value,
            size: sym.st_size,
            section_index: sym.st_shndx,
            kind: SymbolType::from(sym.st_type()),
            binding: sym.st_bind(),
        }
    }

    /// First symbol with exactly this name.
    pub fn find(&self, name: &str) -> Option<ElfSymbol<'a>> {
        self.iter().find(|symbol| symbol.name == name)
    }

    /// Named symbols with no defining section, in table order.
    pub fn undefined(&self) -> impl Iterator<Item = ElfSymbol<'a>> + '_ {
        self.iter()
            .filter(|symbol| symbol.is_undefined() && !symbol.name.is_empty())
    }

    /// Names of [`Self::undefined`] symbols.
    pub fn undefined_names(&self) -> Vec<&'a str> {
        self.undefined().map(|symbol| symbol.name).collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::elf::ElfImage;
    use crate::testing::ElfBuilder;

    use super::*;

    #[test]
    fn undefined_names_skip_null_and_defined_entries() {
        let image = ElfBuilder::new()
            .dynamic_function("kernel_entry", 0, 16)
            .undefined("host_flag")
            .undefined("host_table")
            .build();

        let elf = ElfImage::parse(&image).unwrap();
        let dynsym = elf.dynamic_symbol_table().unwrap().unwrap();
        assert_eq!(dynsym.len(), 4);
        assert_eq!(dynsym.undefined_names(), vec!["host_flag", "host_table"]);
    }

    #[test]
    fn symbol_kinds_are_decoded() {
        let image = ElfBuilder::new()
            .function("k", 0x10, 32)
            .object("g", 0x40, 8)
            .build();

        let elf = ElfImage::parse(&image).unwrap();
        let symtab = elf.symbol_table().unwrap().unwrap();

        let k = symtab.find("k").unwrap();
        assert_eq!(k.kind, SymbolType::Func);
        assert_eq!(k.value, 0x10);
        assert!(!k.is_undefined());

        let g = symtab.find("g").unwrap();
        assert_eq!(g.kind, SymbolType::Object);
        assert_eq!(g.size, 8);
    }

    #[test]
    fn first_match_wins_on_duplicates() {
        let image = ElfBuilder::new()
            .object("dup", 0x0, 4)
            .object("dup", 0x8, 12)
            .build();

        let elf = ElfImage::parse(&image).unwrap();
        let symtab = elf.symbol_table().unwrap().unwrap();
        assert_eq!(symtab.find("dup").unwrap().size, 4);
    }
}
