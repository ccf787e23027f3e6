// Shared synthetic binaries for the integration tests.
//
// Each builder assembles an image byte by byte so a test controls exactly
// which hardening features the target carries. The layouts are minimal but
// structurally honest: goblin parses them the same way it parses real
// toolchain output.

use std::path::{Path, PathBuf};

use binward::binary::debug_info::DebugInfo;
use binward::binary::signing::SidecarSignatureVerifier;
use binward::engine::results::{CollectingSink, ResultRecord};
use binward::{AnalysisEngine, Policy, RuleRegistry, ScanSummary};

// ---------------------------------------------------------------- ELF ----

pub const ET_REL: u16 = 1;
pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;
pub const ET_CORE: u16 = 4;

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_PHDR: u32 = 6;
const PT_GNU_STACK: u32 = 0x6474_e551;
const PT_GNU_RELRO: u32 = 0x6474_e552;

const DT_FLAGS_1: u64 = 0x6fff_fffb;
const DF_1_NOW: u64 = 0x1;

/// Configurable 64-bit little-endian ELF image.
pub struct ElfFixture {
    pub e_type: u16,
    /// Emit a PT_PHDR segment, the marker for an executable shared object.
    pub phdr_segment: bool,
    /// `p_flags` of the PT_GNU_STACK segment, or no segment at all.
    pub gnu_stack_flags: Option<u32>,
    pub gnu_relro: bool,
    /// Emit a PT_DYNAMIC segment carrying DT_FLAGS_1 = DF_1_NOW.
    pub bind_now: bool,
    /// Contents of the .comment section.
    pub comment: Option<&'static str>,
    /// Function symbols to place in .symtab.
    pub symbols: Vec<&'static str>,
}

impl Default for ElfFixture {
    fn default() -> Self {
        ElfFixture {
            e_type: ET_DYN,
            phdr_segment: true,
            gnu_stack_flags: Some(0x6), // RW
            gnu_relro: false,
            bind_now: false,
            comment: Some("GCC: (GNU) 12.2.0"),
            symbols: Vec::new(),
        }
    }
}

impl ElfFixture {
    /// A PIE executable with every mitigation the ELF rules look for.
    pub fn hardened_executable() -> Self {
        ElfFixture {
            e_type: ET_DYN,
            phdr_segment: true,
            gnu_stack_flags: Some(0x6),
            gnu_relro: true,
            bind_now: true,
            comment: Some("GCC: (GNU) 12.2.0"),
            symbols: vec!["main", "__stack_chk_fail", "__memcpy_chk"],
        }
    }

    /// A fixed-address executable with an executable stack and lazy,
    /// writable relocations.
    pub fn unhardened_executable() -> Self {
        ElfFixture {
            e_type: ET_EXEC,
            phdr_segment: false,
            gnu_stack_flags: Some(0x7), // RWX
            gnu_relro: false,
            bind_now: false,
            comment: Some("GCC: (GNU) 12.2.0"),
            symbols: vec!["main", "memcpy", "strcpy"],
        }
    }

    pub fn build(&self) -> Vec<u8> {
        const EHDR_LEN: usize = 64;
        const PHDR_LEN: usize = 56;
        const SHDR_LEN: usize = 64;
        const SYM_LEN: usize = 24;

        let base: u64 = if self.e_type == ET_EXEC { 0x40_0000 } else { 0 };

        let mut phdr_count = 1; // PT_LOAD
        if self.phdr_segment {
            phdr_count += 1;
        }
        if self.bind_now {
            phdr_count += 1;
        }
        if self.gnu_stack_flags.is_some() {
            phdr_count += 1;
        }
        if self.gnu_relro {
            phdr_count += 1;
        }

        let mut cursor = EHDR_LEN + phdr_count * PHDR_LEN;

        // Dynamic array: the bind-now flag entry, then the terminator.
        let dynamic_off = cursor;
        let mut dynamic = Vec::new();
        if self.bind_now {
            for (tag, value) in [(DT_FLAGS_1, DF_1_NOW), (0, 0)] {
                dynamic.extend_from_slice(&tag.to_le_bytes());
                dynamic.extend_from_slice(&value.to_le_bytes());
            }
        }
        cursor += dynamic.len();

        let comment_off = cursor;
        let mut comment = Vec::new();
        if let Some(text) = self.comment {
            comment.extend_from_slice(text.as_bytes());
            comment.push(0);
        }
        cursor += comment.len();

        // Symbol string table, null byte first.
        let mut strtab = vec![0u8];
        let mut name_offsets = Vec::new();
        for name in &self.symbols {
            name_offsets.push(strtab.len() as u32);
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
        }

        // Symbol table: the null symbol, then one STT_FUNC per name.
        let symtab_off = cursor;
        let mut symtab = vec![0u8; SYM_LEN];
        for name_off in &name_offsets {
            let mut sym = [0u8; SYM_LEN];
            sym[0..4].copy_from_slice(&name_off.to_le_bytes()); // st_name
            sym[4] = 0x12; // STB_GLOBAL | STT_FUNC
            sym[6..8].copy_from_slice(&1u16.to_le_bytes()); // st_shndx
            sym[8..16].copy_from_slice(&(base + 0x1000).to_le_bytes()); // st_value
            symtab.extend_from_slice(&sym);
        }
        cursor += symtab.len();
        let strtab_off = cursor;
        cursor += strtab.len();

        // Section plan: [null, .comment?, .symtab?, .strtab?, .shstrtab].
        struct Shdr {
            name: u32,
            sh_type: u32,
            flags: u64,
            offset: u64,
            size: u64,
            link: u32,
            info: u32,
            entsize: u64,
        }

        let has_sections = self.comment.is_some() || !self.symbols.is_empty();
        let mut shstrtab = vec![0u8];
        let mut intern = |table: &mut Vec<u8>, name: &str| -> u32 {
            let off = table.len() as u32;
            table.extend_from_slice(name.as_bytes());
            table.push(0);
            off
        };

        let mut shdrs = Vec::new();
        if has_sections {
            shdrs.push(Shdr {
                name: 0,
                sh_type: 0,
                flags: 0,
                offset: 0,
                size: 0,
                link: 0,
                info: 0,
                entsize: 0,
            });
            if self.comment.is_some() {
                let name = intern(&mut shstrtab, ".comment");
                shdrs.push(Shdr {
                    name,
                    sh_type: 1, // SHT_PROGBITS
                    flags: 0x30, // SHF_MERGE | SHF_STRINGS
                    offset: comment_off as u64,
                    size: comment.len() as u64,
                    link: 0,
                    info: 0,
                    entsize: 1,
                });
            }
            if !self.symbols.is_empty() {
                let symtab_name = intern(&mut shstrtab, ".symtab");
                let strtab_name = intern(&mut shstrtab, ".strtab");
                let strtab_index = shdrs.len() as u32 + 1;
                shdrs.push(Shdr {
                    name: symtab_name,
                    sh_type: 2, // SHT_SYMTAB
                    flags: 0,
                    offset: symtab_off as u64,
                    size: symtab.len() as u64,
                    link: strtab_index,
                    info: 1, // first global symbol
                    entsize: SYM_LEN as u64,
                });
                shdrs.push(Shdr {
                    name: strtab_name,
                    sh_type: 3, // SHT_STRTAB
                    flags: 0,
                    offset: strtab_off as u64,
                    size: strtab.len() as u64,
                    link: 0,
                    info: 0,
                    entsize: 0,
                });
            }
            let shstrtab_name = intern(&mut shstrtab, ".shstrtab");
            let shstrtab_off = cursor;
            cursor += shstrtab.len();
            shdrs.push(Shdr {
                name: shstrtab_name,
                sh_type: 3, // SHT_STRTAB
                flags: 0,
                offset: shstrtab_off as u64,
                size: shstrtab.len() as u64,
                link: 0,
                info: 0,
                entsize: 0,
            });
        }

        // Section header table lands 8-byte aligned at the end of the file.
        let shoff = (cursor + 7) & !7;

        let mut data = Vec::with_capacity(shoff + shdrs.len() * SHDR_LEN);

        // ELF header.
        let mut ehdr = [0u8; EHDR_LEN];
        ehdr[0..4].copy_from_slice(b"\x7fELF");
        ehdr[4] = 2; // ELFCLASS64
        ehdr[5] = 1; // little endian
        ehdr[6] = 1; // EV_CURRENT
        ehdr[16..18].copy_from_slice(&self.e_type.to_le_bytes());
        ehdr[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        ehdr[20..24].copy_from_slice(&1u32.to_le_bytes()); // e_version
        ehdr[24..32].copy_from_slice(&(base + 0x1000).to_le_bytes()); // e_entry
        ehdr[32..40].copy_from_slice(&(EHDR_LEN as u64).to_le_bytes()); // e_phoff
        if has_sections {
            ehdr[40..48].copy_from_slice(&(shoff as u64).to_le_bytes()); // e_shoff
        }
        ehdr[52..54].copy_from_slice(&(EHDR_LEN as u16).to_le_bytes()); // e_ehsize
        ehdr[54..56].copy_from_slice(&(PHDR_LEN as u16).to_le_bytes()); // e_phentsize
        ehdr[56..58].copy_from_slice(&(phdr_count as u16).to_le_bytes()); // e_phnum
        ehdr[58..60].copy_from_slice(&(SHDR_LEN as u16).to_le_bytes()); // e_shentsize
        ehdr[60..62].copy_from_slice(&(shdrs.len() as u16).to_le_bytes()); // e_shnum
        if has_sections {
            // .shstrtab is always last.
            ehdr[62..64].copy_from_slice(&((shdrs.len() - 1) as u16).to_le_bytes());
        }
        data.extend_from_slice(&ehdr);

        // Program headers.
        let phdr = |p_type: u32, flags: u32, offset: u64, vaddr: u64, size: u64, align: u64| {
            let mut ph = [0u8; PHDR_LEN];
            ph[0..4].copy_from_slice(&p_type.to_le_bytes());
            ph[4..8].copy_from_slice(&flags.to_le_bytes());
            ph[8..16].copy_from_slice(&offset.to_le_bytes());
            ph[16..24].copy_from_slice(&vaddr.to_le_bytes()); // p_vaddr
            ph[24..32].copy_from_slice(&vaddr.to_le_bytes()); // p_paddr
            ph[32..40].copy_from_slice(&size.to_le_bytes()); // p_filesz
            ph[40..48].copy_from_slice(&size.to_le_bytes()); // p_memsz
            ph[48..56].copy_from_slice(&align.to_le_bytes());
            ph
        };

        if self.phdr_segment {
            let table_len = (phdr_count * PHDR_LEN) as u64;
            data.extend_from_slice(&phdr(
                PT_PHDR,
                0x4, // R
                EHDR_LEN as u64,
                base + EHDR_LEN as u64,
                table_len,
                8,
            ));
        }
        data.extend_from_slice(&phdr(PT_LOAD, 0x5, 0, base, 0x1000, 0x1000)); // R+X
        if self.bind_now {
            data.extend_from_slice(&phdr(
                PT_DYNAMIC,
                0x6, // R+W
                dynamic_off as u64,
                base + dynamic_off as u64,
                dynamic.len() as u64,
                8,
            ));
        }
        if let Some(flags) = self.gnu_stack_flags {
            data.extend_from_slice(&phdr(PT_GNU_STACK, flags, 0, 0, 0, 16));
        }
        if self.gnu_relro {
            data.extend_from_slice(&phdr(PT_GNU_RELRO, 0x4, 0, base, 0x100, 1));
        }

        data.extend_from_slice(&dynamic);
        data.extend_from_slice(&comment);
        data.extend_from_slice(&symtab);
        data.extend_from_slice(&strtab);
        if has_sections {
            data.extend_from_slice(&shstrtab);
            while data.len() < shoff {
                data.push(0);
            }
            for sh in &shdrs {
                let mut out = [0u8; SHDR_LEN];
                out[0..4].copy_from_slice(&sh.name.to_le_bytes());
                out[4..8].copy_from_slice(&sh.sh_type.to_le_bytes());
                out[8..16].copy_from_slice(&sh.flags.to_le_bytes());
                // sh_addr stays zero; offsets carry the mapping.
                out[24..32].copy_from_slice(&sh.offset.to_le_bytes());
                out[32..40].copy_from_slice(&sh.size.to_le_bytes());
                out[40..44].copy_from_slice(&sh.link.to_le_bytes());
                out[44..48].copy_from_slice(&sh.info.to_le_bytes());
                out[48..56].copy_from_slice(&1u64.to_le_bytes()); // sh_addralign
                out[56..64].copy_from_slice(&sh.entsize.to_le_bytes());
                data.extend_from_slice(&out);
            }
        }

        data
    }
}

// ----------------------------------------------------------------- PE ----

const IMAGE_SCN_CNT_CODE: u32 = 0x20;
const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x40;
const IMAGE_SCN_MEM_SHARED: u32 = 0x1000_0000;
const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

const IMAGE_FILE_EXECUTABLE_IMAGE: u16 = 0x2;
const IMAGE_FILE_LARGE_ADDRESS_AWARE: u16 = 0x20;
const IMAGE_FILE_DLL: u16 = 0x2000;

const IMAGE_DLLCHARACTERISTICS_HIGH_ENTROPY_VA: u16 = 0x20;
const IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE: u16 = 0x40;
const IMAGE_DLLCHARACTERISTICS_NX_COMPAT: u16 = 0x100;
const IMAGE_DLLCHARACTERISTICS_GUARD_CF: u16 = 0x4000;

const DOS_STUB_LEN: usize = 0x80;
const FILE_ALIGN: usize = 0x200;
const SECTION_ALIGN: u32 = 0x1000;

/// Configurable PE image with a .text and .rdata section. The load config
/// blob, when present, is mapped at RVA 0x2000 inside .rdata.
pub struct PeFixture {
    pub is_64bit: bool,
    pub is_dll: bool,
    pub machine: u16,
    pub extra_coff_characteristics: u16,
    pub dll_characteristics: u16,
    pub subsystem: u16,
    pub image_base: u64,
    pub linker_version: (u8, u8),
    pub load_config: Option<Vec<u8>>,
    /// Optional third section at RVA 0x3000: name and characteristics.
    pub extra_section: Option<(&'static str, u32)>,
}

impl PeFixture {
    /// A 64-bit user-mode executable with every header mitigation enabled.
    pub fn hardened_64bit_exe() -> Self {
        PeFixture {
            is_64bit: true,
            is_dll: false,
            machine: 0x8664, // AMD64
            extra_coff_characteristics: IMAGE_FILE_LARGE_ADDRESS_AWARE,
            dll_characteristics: IMAGE_DLLCHARACTERISTICS_HIGH_ENTROPY_VA
                | IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE
                | IMAGE_DLLCHARACTERISTICS_NX_COMPAT
                | IMAGE_DLLCHARACTERISTICS_GUARD_CF,
            subsystem: 2, // WINDOWS_GUI
            image_base: 0x1_8000_0000,
            linker_version: (14, 20),
            load_config: Some(guard_load_config_64()),
            extra_section: None,
        }
    }

    /// A 64-bit executable with no mitigations and a writable, shared,
    /// executable data section.
    pub fn unhardened_64bit_exe() -> Self {
        PeFixture {
            is_64bit: true,
            is_dll: false,
            machine: 0x8664,
            extra_coff_characteristics: 0,
            dll_characteristics: 0,
            subsystem: 2,
            image_base: 0x1400_0000,
            linker_version: (14, 20),
            load_config: None,
            extra_section: Some((
                ".shared",
                IMAGE_SCN_CNT_INITIALIZED_DATA
                    | IMAGE_SCN_MEM_READ
                    | IMAGE_SCN_MEM_WRITE
                    | IMAGE_SCN_MEM_EXECUTE
                    | IMAGE_SCN_MEM_SHARED,
            )),
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let mut sections: Vec<(&str, u32)> = vec![
            (".text", IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ),
            (".rdata", IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ),
        ];
        if let Some((name, characteristics)) = self.extra_section {
            sections.push((name, characteristics));
        }

        let opt_len: usize = if self.is_64bit { 240 } else { 224 };
        let size_of_headers = FILE_ALIGN; // header block fits in one unit

        let mut data = Vec::new();

        // DOS header: magic plus the PE header pointer at 0x3c.
        let mut dos = [0u8; DOS_STUB_LEN];
        dos[0..2].copy_from_slice(b"MZ");
        dos[0x3c..0x40].copy_from_slice(&(DOS_STUB_LEN as u32).to_le_bytes());
        data.extend_from_slice(&dos);

        data.extend_from_slice(b"PE\0\0");

        // COFF file header.
        let mut coff_characteristics = IMAGE_FILE_EXECUTABLE_IMAGE | self.extra_coff_characteristics;
        if self.is_dll {
            coff_characteristics |= IMAGE_FILE_DLL;
        }
        let mut coff = [0u8; 20];
        coff[0..2].copy_from_slice(&self.machine.to_le_bytes());
        coff[2..4].copy_from_slice(&(sections.len() as u16).to_le_bytes());
        coff[16..18].copy_from_slice(&(opt_len as u16).to_le_bytes());
        coff[18..20].copy_from_slice(&coff_characteristics.to_le_bytes());
        data.extend_from_slice(&coff);

        // Optional header, standard fields.
        let magic: u16 = if self.is_64bit { 0x20b } else { 0x10b };
        data.extend_from_slice(&magic.to_le_bytes());
        data.push(self.linker_version.0);
        data.push(self.linker_version.1);
        data.extend_from_slice(&0x200u32.to_le_bytes()); // size_of_code
        data.extend_from_slice(&0x400u32.to_le_bytes()); // size_of_initialized_data
        data.extend_from_slice(&0u32.to_le_bytes()); // size_of_uninitialized_data
        data.extend_from_slice(&0x1000u32.to_le_bytes()); // address_of_entry_point
        data.extend_from_slice(&0x1000u32.to_le_bytes()); // base_of_code
        if !self.is_64bit {
            data.extend_from_slice(&0x2000u32.to_le_bytes()); // base_of_data
        }

        // Optional header, windows fields.
        if self.is_64bit {
            data.extend_from_slice(&self.image_base.to_le_bytes());
        } else {
            data.extend_from_slice(&(self.image_base as u32).to_le_bytes());
        }
        data.extend_from_slice(&SECTION_ALIGN.to_le_bytes());
        data.extend_from_slice(&(FILE_ALIGN as u32).to_le_bytes());
        data.extend_from_slice(&6u16.to_le_bytes()); // major_operating_system_version
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes()); // image version
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&6u16.to_le_bytes()); // major_subsystem_version
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes()); // win32_version_value
        let size_of_image = SECTION_ALIGN * (sections.len() as u32 + 1);
        data.extend_from_slice(&size_of_image.to_le_bytes());
        data.extend_from_slice(&(size_of_headers as u32).to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes()); // checksum
        data.extend_from_slice(&self.subsystem.to_le_bytes());
        data.extend_from_slice(&self.dll_characteristics.to_le_bytes());
        if self.is_64bit {
            data.extend_from_slice(&0x10_0000u64.to_le_bytes()); // stack reserve
            data.extend_from_slice(&0x1000u64.to_le_bytes()); // stack commit
            data.extend_from_slice(&0x10_0000u64.to_le_bytes()); // heap reserve
            data.extend_from_slice(&0x1000u64.to_le_bytes()); // heap commit
        } else {
            data.extend_from_slice(&0x10_0000u32.to_le_bytes());
            data.extend_from_slice(&0x1000u32.to_le_bytes());
            data.extend_from_slice(&0x10_0000u32.to_le_bytes());
            data.extend_from_slice(&0x1000u32.to_le_bytes());
        }
        data.extend_from_slice(&0u32.to_le_bytes()); // loader_flags
        data.extend_from_slice(&16u32.to_le_bytes()); // number_of_rva_and_sizes

        // Data directories. Only the load config entry (index 10) is used.
        for index in 0..16u32 {
            if index == 10 {
                if let Some(blob) = &self.load_config {
                    data.extend_from_slice(&0x2000u32.to_le_bytes());
                    data.extend_from_slice(&(blob.len() as u32).to_le_bytes());
                    continue;
                }
            }
            data.extend_from_slice(&[0u8; 8]);
        }

        // Section table. Each section holds one file-alignment unit of raw
        // data, laid out in order after the headers.
        for (index, (name, characteristics)) in sections.iter().enumerate() {
            let va = SECTION_ALIGN * (index as u32 + 1);
            let raw_ptr = (size_of_headers + index * FILE_ALIGN) as u32;
            let mut sh = [0u8; 40];
            sh[..name.len().min(8)].copy_from_slice(&name.as_bytes()[..name.len().min(8)]);
            sh[8..12].copy_from_slice(&(FILE_ALIGN as u32).to_le_bytes()); // virtual_size
            sh[12..16].copy_from_slice(&va.to_le_bytes());
            sh[16..20].copy_from_slice(&(FILE_ALIGN as u32).to_le_bytes()); // size_of_raw_data
            sh[20..24].copy_from_slice(&raw_ptr.to_le_bytes());
            sh[36..40].copy_from_slice(&characteristics.to_le_bytes());
            data.extend_from_slice(&sh);
        }

        // Raw section data. The load config blob sits at the start of
        // .rdata, which maps it to RVA 0x2000.
        while data.len() < size_of_headers {
            data.push(0);
        }
        for (index, _) in sections.iter().enumerate() {
            let mut raw = vec![0u8; FILE_ALIGN];
            if index == 1 {
                if let Some(blob) = &self.load_config {
                    raw[..blob.len()].copy_from_slice(blob);
                }
            }
            data.extend_from_slice(&raw);
        }

        data
    }
}

/// IMAGE_LOAD_CONFIG_DIRECTORY64 with a security cookie and fully populated
/// control flow guard fields.
pub fn guard_load_config_64() -> Vec<u8> {
    let mut blob = vec![0u8; 148];
    blob[0..4].copy_from_slice(&148u32.to_le_bytes()); // Size
    blob[88..96].copy_from_slice(&0x1_8000_2100u64.to_le_bytes()); // SecurityCookie
    blob[112..120].copy_from_slice(&0x1_8000_1100u64.to_le_bytes()); // GuardCFCheckFunctionPointer
    blob[128..136].copy_from_slice(&0x1_8000_2200u64.to_le_bytes()); // GuardCFFunctionTable
    blob[136..144].copy_from_slice(&2u64.to_le_bytes()); // GuardCFFunctionCount
    blob[144..148].copy_from_slice(&0x500u32.to_le_bytes()); // GuardFlags
    blob
}

/// IMAGE_LOAD_CONFIG_DIRECTORY32 with a populated SE handler table and no
/// guard instrumentation.
pub fn seh_load_config_32() -> Vec<u8> {
    let mut blob = vec![0u8; 92];
    blob[0..4].copy_from_slice(&92u32.to_le_bytes()); // Size
    blob[60..64].copy_from_slice(&0xBB40_E64Eu32.to_le_bytes()); // SecurityCookie
    blob[64..68].copy_from_slice(&0x40_3000u32.to_le_bytes()); // SEHandlerTable
    blob[68..72].copy_from_slice(&4u32.to_le_bytes()); // SEHandlerCount
    blob
}

// ------------------------------------------------------------- Mach-O ----

pub const MH_EXECUTE: u32 = 0x2;
pub const MH_DYLIB: u32 = 0x6;
pub const MH_PIE: u32 = 0x20_0000;
pub const MH_ALLOW_STACK_EXECUTION: u32 = 0x20000;

pub const CPU_TYPE_X86_64: u32 = 0x0100_0007;
pub const CPU_TYPE_ARM64: u32 = 0x0100_000c;

/// A thin 64-bit Mach-O consisting of a bare header.
pub fn macho_thin(cputype: u32, filetype: u32, flags: u32) -> Vec<u8> {
    let mut header = vec![0u8; 32];
    header[0..4].copy_from_slice(&0xfeed_facfu32.to_le_bytes()); // MH_MAGIC_64
    header[4..8].copy_from_slice(&cputype.to_le_bytes());
    header[12..16].copy_from_slice(&filetype.to_le_bytes());
    // ncmds and sizeofcmds stay zero.
    header[24..28].copy_from_slice(&flags.to_le_bytes());
    header
}

/// A fat Mach-O whose slices are bare thin headers at 4 KiB intervals.
pub fn macho_fat(slices: &[(u32, u32, u32)]) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&0xcafe_babeu32.to_be_bytes()); // FAT_MAGIC
    data.extend_from_slice(&(slices.len() as u32).to_be_bytes());

    // Fat arch records are big endian: cputype, cpusubtype, offset, size,
    // align (as a power of two).
    for (index, (cputype, _, _)) in slices.iter().enumerate() {
        let offset = 0x1000u32 * (index as u32 + 1);
        data.extend_from_slice(&cputype.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&offset.to_be_bytes());
        data.extend_from_slice(&32u32.to_be_bytes());
        data.extend_from_slice(&12u32.to_be_bytes());
    }

    for (index, (cputype, filetype, flags)) in slices.iter().enumerate() {
        let offset = 0x1000 * (index + 1);
        while data.len() < offset {
            data.push(0);
        }
        data.extend_from_slice(&macho_thin(*cputype, *filetype, *flags));
    }
    data
}

// ----------------------------------------------------------- sidecars ----

/// One MSVC C++ object module entry for a debug info sidecar. An empty
/// library names a loose object.
pub fn msvc_module(object: &str, library: &str, version: &str, command_line: &str) -> serde_json::Value {
    let library = if library.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::Value::from(library)
    };
    serde_json::json!({
        "object": object,
        "library": library,
        "language": "cxx",
        "compiler_name": "Microsoft (R) Optimizing Compiler",
        "front_end_version": version,
        "back_end_version": version,
        "command_line": command_line,
        "has_security_checks": command_line.contains("/GS"),
        "has_functions": true,
        "contributes_to_executable_section": true,
    })
}

pub fn write_debug_info(target: &Path, modules: &[serde_json::Value]) {
    let doc = serde_json::json!({
        "modules": modules,
        "safe_buffers_functions": [],
    });
    std::fs::write(
        DebugInfo::sidecar_path(target),
        serde_json::to_string_pretty(&doc).expect("serialize debug info"),
    )
    .expect("write debug info sidecar");
}

pub fn write_signature(target: &Path, signed: bool, valid: bool, algorithms: &[&str]) {
    let doc = serde_json::json!({
        "signed": signed,
        "valid": valid,
        "algorithms": algorithms,
        "validation_error": null,
    });
    std::fs::write(
        SidecarSignatureVerifier::sidecar_path(target),
        serde_json::to_string(&doc).expect("serialize signature verdict"),
    )
    .expect("write signature sidecar");
}

// --------------------------------------------------------------- scan ----

/// Runs every built-in rule over `targets` with the default policy and
/// returns the summary plus all collected results.
pub fn scan(targets: &[PathBuf]) -> (ScanSummary, Vec<ResultRecord>) {
    scan_with_policy(targets, &Policy::default())
}

pub fn scan_with_policy(targets: &[PathBuf], policy: &Policy) -> (ScanSummary, Vec<ResultRecord>) {
    let registry = RuleRegistry::built_in().expect("built-in rules register cleanly");
    let sink = CollectingSink::new();
    let verifier = SidecarSignatureVerifier;
    let summary = AnalysisEngine::new(&registry, policy, &sink, &verifier)
        .sequential(true)
        .run(targets);
    (summary, sink.snapshot())
}

/// The single result a rule produced for a one-target scan.
pub fn result_for<'r>(records: &'r [ResultRecord], rule_id: &str) -> &'r ResultRecord {
    let mut matches = records.iter().filter(|r| r.rule_id == rule_id);
    let first = matches
        .next()
        .unwrap_or_else(|| panic!("no result recorded for {rule_id}"));
    assert!(
        matches.next().is_none(),
        "expected exactly one result for {rule_id}"
    );
    first
}
