//! FORTIFY_SOURCE usage check.

use crate::engine::results::RuleResult;
use crate::rules::{reasons, shared, AnalysisContext, Applicability, Rule};

/// glibc functions that have a `__*_chk` fortified variant. Sorted so
/// membership tests can binary search.
const FORTIFIABLE_FUNCTIONS: &[&str] = &[
    "asprintf",
    "confstr",
    "dprintf",
    "fdelt",
    "fgets",
    "fgetws",
    "fprintf",
    "fread",
    "fwprintf",
    "getcwd",
    "getdomainname",
    "getgroups",
    "gethostname",
    "gets",
    "getwd",
    "longjmp",
    "mbsnrtowcs",
    "mbsrtowcs",
    "mbstowcs",
    "memcpy",
    "memmove",
    "mempcpy",
    "memset",
    "poll",
    "ppoll",
    "pread",
    "printf",
    "read",
    "readlink",
    "readlinkat",
    "realpath",
    "recv",
    "recvfrom",
    "snprintf",
    "sprintf",
    "stack",
    "stpcpy",
    "stpncpy",
    "strcat",
    "strcpy",
    "strncat",
    "strncpy",
    "swprintf",
    "syslog",
    "vasprintf",
    "vdprintf",
    "vfprintf",
    "vfwprintf",
    "vprintf",
    "vsnprintf",
    "vsprintf",
    "vswprintf",
    "vsyslog",
    "vwprintf",
    "wcpcpy",
    "wcpncpy",
    "wcrtomb",
    "wcscat",
    "wcscpy",
    "wcsncat",
    "wcsncpy",
    "wcsnrtombs",
    "wcsrtombs",
    "wcstombs",
    "wctomb",
    "wmemcpy",
    "wmemmove",
    "wmempcpy",
    "wmemset",
    "wprintf",
];

fn is_fortifiable(name: &str) -> bool {
    FORTIFIABLE_FUNCTIONS.binary_search(&name).is_ok()
}

/// `__memcpy_chk` maps back to `memcpy`.
fn fortified_source(name: &str) -> Option<&str> {
    name.strip_prefix("__")?.strip_suffix("_chk")
}

/// BA3030: GCC-built binaries should use the checked libc variants.
pub struct UseCheckedFunctionsWithGcc;

impl Rule for UseCheckedFunctionsWithGcc {
    fn id(&self) -> &'static str {
        "BA3030"
    }

    fn name(&self) -> &'static str {
        "UseCheckedFunctionsWithGcc"
    }

    fn description(&self) -> &'static str {
        "GCC can automatically replace unsafe functions with checked variants when it \
         can statically determine the length of a buffer or string. In the case of an \
         overflow, the checked version will safely exit the program (rather than \
         potentially allowing an exploit). This feature requires compiling with \
         optimizations enabled ('-O1' or higher) and defining the preprocessor macro \
         '_FORTIFY_SOURCE' ('-D_FORTIFY_SOURCE=2')."
    }

    fn can_analyze(&self, ctx: &AnalysisContext) -> Applicability {
        let elf = match shared::elf_binary(ctx) {
            Ok(elf) => elf,
            Err(gate) => return gate,
        };
        if !elf.built_exclusively_with_gcc() {
            return shared::skip(reasons::ELF_NOT_GCC);
        }
        Applicability::Applicable
    }

    fn analyze(&self, ctx: &AnalysisContext) -> Vec<RuleResult> {
        let Some(elf) = ctx.target.elf() else {
            return Vec::new();
        };

        let mut protected = 0usize;
        let mut unprotected = 0usize;
        for name in &elf.symbols {
            if is_fortifiable(name) {
                unprotected += 1;
            } else if fortified_source(name).map_or(false, is_fortifiable) {
                protected += 1;
            }
        }

        if protected > 0 {
            if unprotected > 0 {
                // The compiler fortifies a call only when it can prove the
                // destination length, so a mix is still a deliberate opt-in.
                return vec![RuleResult::pass(format!(
                    "Some checked functions were found in '{}'; however, there were \
                     also some unchecked functions, which can occur when the compiler \
                     cannot statically determine the length of a buffer or string. We \
                     recommend reviewing your usage of functions such as 'memcpy' or \
                     'strcpy'.",
                    ctx.target.file_name,
                ))];
            }
            return vec![RuleResult::pass(format!(
                "All fortifiable functions in '{}' use their checked variants, so the \
                 binary is protected from overflows caused by those functions' use.",
                ctx.target.file_name,
            ))];
        }

        if unprotected > 0 {
            return vec![RuleResult::error(format!(
                "'{}' calls functions that have fortified variants without using any \
                 of them. This means '_FORTIFY_SOURCE' checks were not enabled, or the \
                 compiler could not apply them. Compile with optimizations enabled \
                 ('-O1' or higher) and '-D_FORTIFY_SOURCE=2' so unsafe functions are \
                 replaced with their checked counterparts.",
                ctx.target.file_name,
            ))];
        }

        vec![RuleResult::pass(format!(
            "No fortifiable functions are used in '{}', so '_FORTIFY_SOURCE' \
             hardening does not apply to it.",
            ctx.target.file_name,
        ))]
    }
}
