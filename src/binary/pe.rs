//! Portable executable metadata extraction.
//!
//! Everything the PE rules interrogate is pulled out of the image once,
//! up front, into an owned [`PeMetadata`]. Rules never touch raw bytes.

use anyhow::{anyhow, Context};
use goblin::pe::PE;
use scroll::Pread;

use crate::version::ToolVersion;

// Machine types (IMAGE_FILE_MACHINE_*).
pub const IMAGE_FILE_MACHINE_I386: u16 = 0x14c;
pub const IMAGE_FILE_MACHINE_ARM: u16 = 0x1c0;
pub const IMAGE_FILE_MACHINE_ARMNT: u16 = 0x1c4;
pub const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
pub const IMAGE_FILE_MACHINE_ARM64: u16 = 0xaa64;

// COFF characteristics.
pub const IMAGE_FILE_RELOCS_STRIPPED: u16 = 0x0001;
pub const IMAGE_FILE_LARGE_ADDRESS_AWARE: u16 = 0x0020;
pub const IMAGE_FILE_DLL: u16 = 0x2000;

// Optional header DLL characteristics.
pub const IMAGE_DLLCHARACTERISTICS_HIGH_ENTROPY_VA: u16 = 0x0020;
pub const IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE: u16 = 0x0040;
pub const IMAGE_DLLCHARACTERISTICS_NX_COMPAT: u16 = 0x0100;
pub const IMAGE_DLLCHARACTERISTICS_NO_SEH: u16 = 0x0400;
pub const IMAGE_DLLCHARACTERISTICS_GUARD_CF: u16 = 0x4000;

// Section characteristics.
pub const IMAGE_SCN_MEM_SHARED: u32 = 0x1000_0000;
pub const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
pub const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

// GuardFlags bits in the load configuration.
pub const IMAGE_GUARD_CF_INSTRUMENTED: u32 = 0x0000_0100;
pub const IMAGE_GUARD_CF_FUNCTION_TABLE_PRESENT: u32 = 0x0000_0400;

// CLR header flags.
pub const COMIMAGE_FLAGS_ILONLY: u32 = 0x0000_0001;
pub const COMIMAGE_FLAGS_32BITREQUIRED: u32 = 0x0000_0002;
pub const COMIMAGE_FLAGS_IL_LIBRARY: u32 = 0x0000_0004;

// Subsystem values the rules care about.
pub const IMAGE_SUBSYSTEM_WINDOWS_CE_GUI: u16 = 9;
pub const IMAGE_SUBSYSTEM_EFI_APPLICATION: u16 = 10;
pub const IMAGE_SUBSYSTEM_EFI_BOOT_SERVICE_DRIVER: u16 = 11;
pub const IMAGE_SUBSYSTEM_EFI_RUNTIME_DRIVER: u16 = 12;
pub const IMAGE_SUBSYSTEM_EFI_ROM: u16 = 13;
pub const IMAGE_SUBSYSTEM_XBOX: u16 = 14;
pub const IMAGE_SUBSYSTEM_WINDOWS_BOOT_APPLICATION: u16 = 16;

/// Page size assumed by the W^X section-alignment check.
pub const PAGE_SIZE: u32 = 0x1000;

/// Imports that mark an image as a kernel-mode driver.
const KERNEL_MODE_IMPORTS: &[&str] = &[
    "ntoskrnl.exe",
    "hal.dll",
    "scsiport.sys",
    "win32k.sys",
    "ataport.sys",
    "drmk.sys",
    "ks.sys",
    "mcd.sys",
    "pciidex.sys",
    "storport.sys",
    "tape.sys",
];

/// IMAGE_LOAD_CONFIG_DIRECTORY32, truncated after GuardFlags.
#[derive(Debug, Clone, Copy, Pread)]
struct RawLoadConfig32 {
    size: u32,
    _time_date_stamp: u32,
    _major_version: u16,
    _minor_version: u16,
    _global_flags_clear: u32,
    _global_flags_set: u32,
    _critical_section_default_timeout: u32,
    _decommit_free_block_threshold: u32,
    _decommit_total_free_threshold: u32,
    _lock_prefix_table: u32,
    _maximum_allocation_size: u32,
    _virtual_memory_threshold: u32,
    _process_heap_flags: u32,
    _process_affinity_mask: u32,
    _csd_version: u16,
    _dependent_load_flags: u16,
    _edit_list: u32,
    security_cookie: u32,
    se_handler_table: u32,
    se_handler_count: u32,
    guard_cf_check_function_pointer: u32,
    guard_cf_dispatch_function_pointer: u32,
    guard_cf_function_table: u32,
    guard_cf_function_count: u32,
    guard_flags: u32,
}

const RAW_LOAD_CONFIG32_LEN: usize = 92;

/// IMAGE_LOAD_CONFIG_DIRECTORY64, truncated after GuardFlags. Note the
/// affinity mask and heap flags swap places relative to the 32-bit layout.
#[derive(Debug, Clone, Copy, Pread)]
struct RawLoadConfig64 {
    size: u32,
    _time_date_stamp: u32,
    _major_version: u16,
    _minor_version: u16,
    _global_flags_clear: u32,
    _global_flags_set: u32,
    _critical_section_default_timeout: u32,
    _decommit_free_block_threshold: u64,
    _decommit_total_free_threshold: u64,
    _lock_prefix_table: u64,
    _maximum_allocation_size: u64,
    _virtual_memory_threshold: u64,
    _process_affinity_mask: u64,
    _process_heap_flags: u32,
    _csd_version: u16,
    _dependent_load_flags: u16,
    _edit_list: u64,
    security_cookie: u64,
    se_handler_table: u64,
    se_handler_count: u64,
    guard_cf_check_function_pointer: u64,
    guard_cf_dispatch_function_pointer: u64,
    guard_cf_function_table: u64,
    guard_cf_function_count: u64,
    guard_flags: u32,
}

const RAW_LOAD_CONFIG64_LEN: usize = 148;

/// IMAGE_COR20_HEADER prefix, through the Flags field.
#[derive(Debug, Clone, Copy, Pread)]
struct RawCorHeader {
    _cb: u32,
    _major_runtime_version: u16,
    _minor_runtime_version: u16,
    _metadata_rva: u32,
    _metadata_size: u32,
    flags: u32,
}

const RAW_COR_HEADER_LEN: usize = 20;

/// Width-normalized view of the load configuration fields the rules use.
///
/// `size` is the structure's own embedded Size field. Images linked by older
/// toolsets carry a short structure, so every consumer gates on `size`
/// before trusting a field.
#[derive(Debug, Clone, Copy)]
pub struct LoadConfig {
    pub size: u32,
    pub security_cookie: u64,
    pub se_handler_table: u64,
    pub se_handler_count: u64,
    pub guard_cf_check_function_pointer: u64,
    pub guard_cf_dispatch_function_pointer: u64,
    pub guard_cf_function_table: u64,
    pub guard_cf_function_count: u64,
    pub guard_flags: u32,
}

impl LoadConfig {
    /// Minimum Size for the structured exception handler fields to be valid.
    pub const SEH_FIELDS_LEN: u32 = 72;
    /// Minimum Size for control flow guard fields, 32-bit layout.
    pub const GUARD_FIELDS_LEN32: u32 = 0x5c;
    /// Minimum Size for control flow guard fields, 64-bit layout.
    pub const GUARD_FIELDS_LEN64: u32 = 0x90;

    pub fn has_seh_fields(&self) -> bool {
        self.size >= Self::SEH_FIELDS_LEN
    }

    pub fn has_guard_fields(&self, is_64bit: bool) -> bool {
        if is_64bit {
            self.size >= Self::GUARD_FIELDS_LEN64
        } else {
            self.size >= Self::GUARD_FIELDS_LEN32
        }
    }
}

/// A data directory entry. Absent directories are all zeroes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryEntry {
    pub rva: u32,
    pub size: u32,
}

impl DirectoryEntry {
    pub fn is_present(&self) -> bool {
        self.rva != 0
    }
}

/// The optional-header data directories the rules consult.
#[derive(Debug, Clone, Copy, Default)]
pub struct Directories {
    pub import_table: DirectoryEntry,
    pub resource_table: DirectoryEntry,
    pub exception_table: DirectoryEntry,
    pub certificate_table: DirectoryEntry,
    pub debug_table: DirectoryEntry,
    pub architecture: DirectoryEntry,
    pub global_ptr: DirectoryEntry,
    pub tls_table: DirectoryEntry,
    pub load_config_table: DirectoryEntry,
    pub bound_import_table: DirectoryEntry,
    pub import_address_table: DirectoryEntry,
    pub delay_import_descriptor: DirectoryEntry,
    pub clr_runtime_header: DirectoryEntry,
}

/// One section-table row.
#[derive(Debug, Clone)]
pub struct SectionInfo {
    pub name: String,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub characteristics: u32,
}

impl SectionInfo {
    pub fn is_executable(&self) -> bool {
        self.characteristics & IMAGE_SCN_MEM_EXECUTE != 0
    }

    pub fn is_writable(&self) -> bool {
        self.characteristics & IMAGE_SCN_MEM_WRITE != 0
    }

    pub fn is_shared(&self) -> bool {
        self.characteristics & IMAGE_SCN_MEM_SHARED != 0
    }

    /// Whether `rva` falls inside this section's mapped range.
    pub fn contains_rva(&self, rva: u32) -> bool {
        rva >= self.virtual_address
            && (rva - self.virtual_address) < self.virtual_size.max(self.size_of_raw_data)
    }
}

/// Owned, pre-digested PE metadata.
#[derive(Debug, Clone)]
pub struct PeMetadata {
    pub machine: u16,
    pub coff_characteristics: u16,
    pub dll_characteristics: u16,
    pub subsystem: u16,
    pub subsystem_version: ToolVersion,
    pub linker_version: ToolVersion,
    pub is_64bit: bool,
    pub is_dll: bool,
    pub image_base: u64,
    pub section_alignment: u32,
    pub sections: Vec<SectionInfo>,
    pub imports: Vec<String>,
    pub directories: Directories,
    pub cor_flags: Option<u32>,
    pub load_config: Option<LoadConfig>,
    pub pdb_path: Option<String>,
}

impl PeMetadata {
    pub fn parse(bytes: &[u8]) -> anyhow::Result<Self> {
        let pe = PE::parse(bytes).context("malformed portable executable")?;
        let optional = pe
            .header
            .optional_header
            .ok_or_else(|| anyhow!("image has no optional header"))?;

        let sections: Vec<SectionInfo> = pe
            .sections
            .iter()
            .map(|s| SectionInfo {
                name: s.name().unwrap_or_default().to_string(),
                virtual_address: s.virtual_address,
                virtual_size: s.virtual_size,
                size_of_raw_data: s.size_of_raw_data,
                pointer_to_raw_data: s.pointer_to_raw_data,
                characteristics: s.characteristics,
            })
            .collect();

        let dirs = &optional.data_directories;
        let entry = |d: Option<&goblin::pe::data_directories::DataDirectory>| {
            d.map(|d| DirectoryEntry {
                rva: d.virtual_address,
                size: d.size,
            })
            .unwrap_or_default()
        };
        let directories = Directories {
            import_table: entry(dirs.get_import_table()),
            resource_table: entry(dirs.get_resource_table()),
            exception_table: entry(dirs.get_exception_table()),
            certificate_table: entry(dirs.get_certificate_table()),
            debug_table: entry(dirs.get_debug_table()),
            architecture: entry(dirs.get_architecture()),
            global_ptr: entry(dirs.get_global_ptr()),
            tls_table: entry(dirs.get_tls_table()),
            load_config_table: entry(dirs.get_load_config_table()),
            bound_import_table: entry(dirs.get_bound_import_table()),
            import_address_table: entry(dirs.get_import_address_table()),
            delay_import_descriptor: entry(dirs.get_delay_import_descriptor()),
            clr_runtime_header: entry(dirs.get_clr_runtime_header()),
        };

        let is_64bit = pe.is_64;

        let cor_flags = if directories.clr_runtime_header.is_present() {
            read_cor_flags(bytes, &sections, directories.clr_runtime_header.rva)
        } else {
            None
        };

        let load_config = if directories.load_config_table.is_present() {
            read_load_config(bytes, &sections, directories.load_config_table.rva, is_64bit)
        } else {
            None
        };

        let pdb_path = pe.debug_data.as_ref().and_then(|d| {
            d.codeview_pdb70_debug_info.as_ref().map(|cv| {
                String::from_utf8_lossy(cv.filename)
                    .trim_end_matches('\0')
                    .to_string()
            })
        });

        let standard = &optional.standard_fields;
        let windows = &optional.windows_fields;

        Ok(PeMetadata {
            machine: pe.header.coff_header.machine,
            coff_characteristics: pe.header.coff_header.characteristics,
            dll_characteristics: windows.dll_characteristics,
            subsystem: windows.subsystem,
            subsystem_version: ToolVersion::new(
                u32::from(windows.major_subsystem_version),
                u32::from(windows.minor_subsystem_version),
                0,
                0,
            ),
            linker_version: ToolVersion::new(
                u32::from(standard.major_linker_version),
                u32::from(standard.minor_linker_version),
                0,
                0,
            ),
            is_64bit,
            is_dll: pe.is_lib,
            image_base: windows.image_base,
            section_alignment: windows.section_alignment,
            sections,
            imports: pe.libraries.iter().map(|l| l.to_string()).collect(),
            directories,
            cor_flags,
            load_config,
            pdb_path,
        })
    }

    pub fn is_exe(&self) -> bool {
        !self.is_dll
    }

    pub fn relocs_stripped(&self) -> bool {
        self.coff_characteristics & IMAGE_FILE_RELOCS_STRIPPED != 0
    }

    pub fn is_large_address_aware(&self) -> bool {
        self.coff_characteristics & IMAGE_FILE_LARGE_ADDRESS_AWARE != 0
    }

    pub fn has_dynamic_base(&self) -> bool {
        self.dll_characteristics & IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE != 0
    }

    pub fn has_high_entropy_va(&self) -> bool {
        self.dll_characteristics & IMAGE_DLLCHARACTERISTICS_HIGH_ENTROPY_VA != 0
    }

    pub fn has_nx_compat(&self) -> bool {
        self.dll_characteristics & IMAGE_DLLCHARACTERISTICS_NX_COMPAT != 0
    }

    pub fn has_no_seh(&self) -> bool {
        self.dll_characteristics & IMAGE_DLLCHARACTERISTICS_NO_SEH != 0
    }

    pub fn has_guard_cf_characteristic(&self) -> bool {
        self.dll_characteristics & IMAGE_DLLCHARACTERISTICS_GUARD_CF != 0
    }

    /// A CLR runtime header is present.
    pub fn is_managed(&self) -> bool {
        self.directories.clr_runtime_header.is_present()
    }

    /// Pure IL, no native code.
    pub fn is_il_only(&self) -> bool {
        matches!(self.cor_flags, Some(f) if f & COMIMAGE_FLAGS_ILONLY != 0)
    }

    pub fn is_il_library(&self) -> bool {
        matches!(self.cor_flags, Some(f) if f & COMIMAGE_FLAGS_IL_LIBRARY != 0)
    }

    /// Managed image that also carries native code.
    pub fn is_mixed_mode(&self) -> bool {
        matches!(self.cor_flags, Some(f) if f & COMIMAGE_FLAGS_ILONLY == 0)
    }

    pub fn requires_32bit(&self) -> bool {
        matches!(self.cor_flags, Some(f) if f & COMIMAGE_FLAGS_32BITREQUIRED != 0)
    }

    /// Image that carries resources and nothing executable. For IL-only
    /// assemblies the method table is not examined here, so those report
    /// false and are filtered by the IL-only checks instead.
    pub fn is_resource_only(&self) -> bool {
        if self.is_il_only() {
            return self.is_il_library();
        }
        let d = &self.directories;
        if !d.resource_table.is_present() {
            return false;
        }
        !d.tls_table.is_present()
            && !d.import_address_table.is_present()
            && !d.global_ptr.is_present()
            && !d.delay_import_descriptor.is_present()
            && !d.bound_import_table.is_present()
            && !d.load_config_table.is_present()
            && !d.architecture.is_present()
            && !d.exception_table.is_present()
            && !d.clr_runtime_header.is_present()
            && !d.import_table.is_present()
    }

    /// Imports any of the kernel-mode entry libraries.
    pub fn is_kernel_mode(&self) -> bool {
        self.imports.iter().any(|import| {
            KERNEL_MODE_IMPORTS
                .iter()
                .any(|km| import.eq_ignore_ascii_case(km))
        })
    }

    pub fn is_boot(&self) -> bool {
        matches!(
            self.subsystem,
            IMAGE_SUBSYSTEM_EFI_APPLICATION
                | IMAGE_SUBSYSTEM_EFI_BOOT_SERVICE_DRIVER
                | IMAGE_SUBSYSTEM_EFI_RUNTIME_DRIVER
                | IMAGE_SUBSYSTEM_EFI_ROM
                | IMAGE_SUBSYSTEM_WINDOWS_BOOT_APPLICATION
        )
    }

    pub fn is_xbox(&self) -> bool {
        self.subsystem == IMAGE_SUBSYSTEM_XBOX
    }

    /// WiX burn bundles carry a marker section.
    pub fn is_wix_binary(&self) -> bool {
        self.sections.iter().any(|s| s.name == ".wixburn")
    }

    /// .NET native images link against the mrt100 runtime.
    pub fn is_dotnet_native(&self) -> bool {
        self.imports.iter().any(|import| {
            import.eq_ignore_ascii_case("mrt100.dll") || import.eq_ignore_ascii_case("mrt100_app.dll")
        })
    }

    /// Native UWP images link the store-flavored CRT.
    pub fn is_native_universal_windows_platform(&self) -> bool {
        !self.is_managed()
            && self.imports.iter().any(|import| {
                import.eq_ignore_ascii_case("MSVCP140_APP.dll")
                    || import.eq_ignore_ascii_case("VCRUNTIME140_APP.dll")
            })
    }

    /// The generated native host that boots a .NET core application.
    pub fn is_dotnet_core_bootstrap_exe(&self) -> bool {
        self.pdb_path
            .as_deref()
            .map(|p| p.to_ascii_lowercase().ends_with("apphost.pdb"))
            .unwrap_or(false)
    }

    pub fn is_wince_pre7(&self) -> bool {
        self.subsystem == IMAGE_SUBSYSTEM_WINDOWS_CE_GUI
            && self.subsystem_version < ToolVersion::new(7, 0, 0, 0)
    }

    /// Carries an embedded authenticode certificate table.
    pub fn has_certificate_table(&self) -> bool {
        self.directories.certificate_table.is_present() && self.directories.certificate_table.size > 0
    }
}

/// Maps an RVA to a file offset via the section that covers it.
fn rva_to_offset(sections: &[SectionInfo], rva: u32) -> Option<usize> {
    for section in sections {
        if rva >= section.virtual_address {
            let delta = rva - section.virtual_address;
            if delta < section.size_of_raw_data {
                return Some(section.pointer_to_raw_data as usize + delta as usize);
            }
        }
    }
    None
}

/// Copies up to `N` bytes at `rva` into a zero-padded buffer, so short
/// on-disk structures still parse and report their embedded size.
fn read_padded<const N: usize>(bytes: &[u8], sections: &[SectionInfo], rva: u32) -> Option<[u8; N]> {
    let offset = rva_to_offset(sections, rva)?;
    if offset >= bytes.len() {
        return None;
    }
    let available = (bytes.len() - offset).min(N);
    let mut buf = [0u8; N];
    buf[..available].copy_from_slice(&bytes[offset..offset + available]);
    Some(buf)
}

fn read_cor_flags(bytes: &[u8], sections: &[SectionInfo], rva: u32) -> Option<u32> {
    let buf = read_padded::<RAW_COR_HEADER_LEN>(bytes, sections, rva)?;
    let header: RawCorHeader = buf.pread_with(0, scroll::LE).ok()?;
    Some(header.flags)
}

fn read_load_config(
    bytes: &[u8],
    sections: &[SectionInfo],
    rva: u32,
    is_64bit: bool,
) -> Option<LoadConfig> {
    if is_64bit {
        let buf = read_padded::<RAW_LOAD_CONFIG64_LEN>(bytes, sections, rva)?;
        let raw: RawLoadConfig64 = buf.pread_with(0, scroll::LE).ok()?;
        Some(LoadConfig {
            size: raw.size,
            security_cookie: raw.security_cookie,
            se_handler_table: raw.se_handler_table,
            se_handler_count: raw.se_handler_count,
            guard_cf_check_function_pointer: raw.guard_cf_check_function_pointer,
            guard_cf_dispatch_function_pointer: raw.guard_cf_dispatch_function_pointer,
            guard_cf_function_table: raw.guard_cf_function_table,
            guard_cf_function_count: raw.guard_cf_function_count,
            guard_flags: raw.guard_flags,
        })
    } else {
        let buf = read_padded::<RAW_LOAD_CONFIG32_LEN>(bytes, sections, rva)?;
        let raw: RawLoadConfig32 = buf.pread_with(0, scroll::LE).ok()?;
        Some(LoadConfig {
            size: raw.size,
            security_cookie: u64::from(raw.security_cookie),
            se_handler_table: u64::from(raw.se_handler_table),
            se_handler_count: u64::from(raw.se_handler_count),
            guard_cf_check_function_pointer: u64::from(raw.guard_cf_check_function_pointer),
            guard_cf_dispatch_function_pointer: u64::from(raw.guard_cf_dispatch_function_pointer),
            guard_cf_function_table: u64::from(raw.guard_cf_function_table),
            guard_cf_function_count: u64::from(raw.guard_cf_function_count),
            guard_flags: raw.guard_flags,
        })
    }
}
