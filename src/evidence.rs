use std::cmp::Ordering;
use std::fmt;
use std::slice;

/// Default cap on evidence lines rendered for a single result message.
pub const DEFAULT_MAX_RECORDS: usize = 100;

// 4 comes from: at least one object line, the truncation message for the
// library containing it, the message for entirely elided libraries, and the
// grand-total message.
const MIN_RECORDS: usize = 4;

/// Identifying characteristics of one object file that contributed to a
/// linked binary: the object name, the static library it came from (if any),
/// and an optional rule-dependent annotation such as "[disabled warnings: 4018]".
#[derive(Debug, Clone, Eq)]
pub struct CompilandRecord {
    pub object: String,
    pub library: Option<String>,
    pub suffix: Option<String>,
}

fn ci_cmp(a: &str, b: &str) -> Ordering {
    a.bytes()
        .map(|c| c.to_ascii_lowercase())
        .cmp(b.bytes().map(|c| c.to_ascii_lowercase()))
}

fn ci_cmp_opt(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => ci_cmp(a, b),
    }
}

fn sanitize_name(name: &str) -> Option<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return None;
    }
    // Debug records carry whichever separator the build machine used.
    let base = trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed);
    if base.is_empty() {
        return None;
    }
    Some(base.to_string())
}

impl CompilandRecord {
    pub fn new(object: impl Into<String>, library: Option<String>) -> Self {
        CompilandRecord {
            object: object.into(),
            library,
            suffix: None,
        }
    }

    pub fn with_suffix(
        object: impl Into<String>,
        library: Option<String>,
        suffix: impl Into<String>,
    ) -> Self {
        CompilandRecord {
            object: object.into(),
            library,
            suffix: Some(suffix.into()),
        }
    }

    /// Builds a record with file paths reduced to their base names.
    ///
    /// When the object and library names are identical the object is a
    /// precompiled header; it is logically an object, so the library name is
    /// dropped.
    pub fn sanitized(object: &str, library: Option<&str>, suffix: Option<String>) -> Self {
        let library = match library {
            Some(lib) if lib == object => None,
            other => other,
        };

        CompilandRecord {
            object: sanitize_name(object).unwrap_or_default(),
            library: library.and_then(sanitize_name),
            suffix,
        }
    }
}

impl fmt::Display for CompilandRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.library {
            Some(library) if library != &self.object => {
                write!(f, "{} ({})", self.object, library)?;
            }
            _ => f.write_str(&self.object)?,
        }

        if let Some(suffix) = &self.suffix {
            if !suffix.trim().is_empty() {
                write!(f, " {}", suffix)?;
            }
        }
        Ok(())
    }
}

impl PartialEq for CompilandRecord {
    fn eq(&self, other: &Self) -> bool {
        ci_cmp(&self.object, &other.object) == Ordering::Equal
            && ci_cmp_opt(self.library.as_deref(), other.library.as_deref()) == Ordering::Equal
            && self.suffix == other.suffix
    }
}

impl Ord for CompilandRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        ci_cmp_opt(self.library.as_deref(), other.library.as_deref())
            .then_with(|| ci_cmp(&self.object, &other.object))
            .then_with(|| self.suffix.cmp(&other.suffix))
    }
}

impl PartialOrd for CompilandRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// An append-only list of [`CompilandRecord`] whose rendered form is bounded
/// to a configured number of display lines.
///
/// Truncation compresses the display only; every added record stays in the
/// list and is visible through [`TruncatedRecordList::iter`] or the
/// untruncated [`TruncatedRecordList::create_sorted_object_list`].
#[derive(Debug, Clone)]
pub struct TruncatedRecordList {
    records: Vec<CompilandRecord>,
    max_records: usize,
    sorted: bool,
}

impl Default for TruncatedRecordList {
    fn default() -> Self {
        TruncatedRecordList::new()
    }
}

impl TruncatedRecordList {
    pub fn new() -> Self {
        TruncatedRecordList::with_max_records(DEFAULT_MAX_RECORDS)
    }

    /// A limit below four is raised to four, the smallest budget that can
    /// hold one object line plus every truncation message.
    pub fn with_max_records(max_records: usize) -> Self {
        TruncatedRecordList {
            records: Vec::new(),
            max_records: max_records.max(MIN_RECORDS),
            sorted: true,
        }
    }

    pub fn add(&mut self, record: CompilandRecord) {
        self.sorted = false;
        self.records.push(record);
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn max_records(&self) -> usize {
        self.max_records
    }

    pub fn iter(&self) -> slice::Iter<'_, CompilandRecord> {
        self.records.iter()
    }

    /// Renders every record, sorted, one per line.
    pub fn create_sorted_object_list(&mut self) -> String {
        self.ensure_sorted();
        self.create_all_object_list()
    }

    /// Renders the records compressed to at most `max_records` lines.
    ///
    /// Records are grouped into contiguous per-library blocks; each block is
    /// granted roughly sqrt(budget) lines so that neither one huge library
    /// nor a flood of tiny ones monopolizes the output. Blocks that do not
    /// fit spend their last granted line on a per-library truncation note,
    /// libraries elided outright are summarized in one aggregate line, and a
    /// grand-total line always closes a truncated listing. Output is
    /// deterministic for a given record set and limit, and contains exactly
    /// `max_records` lines whenever truncation occurs.
    pub fn create_truncated_object_list(&mut self) -> String {
        self.ensure_sorted();
        if self.records.len() <= self.max_records {
            // No truncation necessary. (Also keeps the expansion loop below
            // finite: it relies on the records outnumbering the budget.)
            return self.create_all_object_list();
        }

        let mut block_starts = Vec::new();
        let mut block_display_sizes = Vec::new();

        // One line is reserved for the grand-total message.
        let mut remaining = self.rough_fit_blocks(
            &mut block_starts,
            &mut block_display_sizes,
            self.max_records - 1,
        );
        let any_fully_truncated =
            block_starts.last().copied().unwrap_or(0) != self.records.len();
        if any_fully_truncated {
            // The aggregate message for elided libraries costs one more line.
            remaining = self.rough_fit_blocks(
                &mut block_starts,
                &mut block_display_sizes,
                self.max_records - 2,
            );
        }

        expand_blocks_to_consume_space(&block_starts, &mut block_display_sizes, remaining);

        let mut out = String::new();
        let mut total_truncated_libraries = 0usize;
        let mut total_truncated_objects = 0usize;
        for idx in 0..block_display_sizes.len() {
            let block_start = block_starts[idx];
            let block_len = block_starts[idx + 1] - block_start;
            let display = block_display_sizes[idx];
            if display == block_len {
                self.append_records(&mut out, block_start, block_start + display);
            } else {
                // The truncation message itself displaces one record slot.
                let truncated = block_len - display + 1;
                self.append_records(&mut out, block_start, block_start + block_len - truncated);
                match &self.records[block_start].library {
                    Some(library) => out.push_str(&format!(
                        "({} object files truncated from {})\n",
                        truncated, library
                    )),
                    None => out.push_str(&format!("({} object files truncated)\n", truncated)),
                }
                total_truncated_objects += truncated;
                total_truncated_libraries += 1;
            }
        }

        if any_fully_truncated {
            let mut ptr = block_starts.last().copied().unwrap_or(0);
            let fully_truncated_objects = self.records.len() - ptr;
            let mut fully_truncated_libraries = 0usize;
            while ptr != self.records.len() {
                fully_truncated_libraries += 1;
                ptr = self.next_library_transition(ptr);
            }

            out.push_str(&format!(
                "({} entire libraries truncated containing {} object files)\n",
                fully_truncated_libraries, fully_truncated_objects
            ));
            total_truncated_objects += fully_truncated_objects;
            total_truncated_libraries += fully_truncated_libraries;
        }

        if total_truncated_objects != 0 {
            out.push_str(&format!(
                "({} total objects truncated from {} total libraries, raise the evidence limit to list all objects)\n",
                total_truncated_objects, total_truncated_libraries
            ));
        }

        debug_assert_eq!(out.lines().count(), self.max_records);
        out
    }

    /// One pass of handing each library block up to `target` display slots,
    /// where `target` balances library count against per-library depth.
    /// Returns the unconsumed budget. `block_starts` gets one extra trailing
    /// entry so every display size has its block length at `starts[i+1] - starts[i]`.
    fn rough_fit_blocks(
        &self,
        block_starts: &mut Vec<usize>,
        block_display_sizes: &mut Vec<usize>,
        mut space: usize,
    ) -> usize {
        block_starts.clear();
        block_display_sizes.clear();
        block_starts.push(0);

        let target = 2usize.max((space as f64).sqrt() as usize);

        let mut ptr = 0;
        while space != 0 && ptr != self.records.len() {
            let next = self.next_library_transition(ptr);
            block_starts.push(next);
            let consumed = target.min(next - ptr).min(space);
            space -= consumed;
            block_display_sizes.push(consumed);
            ptr = next;
        }

        space
    }

    fn next_library_transition(&self, start_at: usize) -> usize {
        if start_at >= self.records.len() {
            return self.records.len();
        }

        let first = self.records[start_at].library.as_deref();
        let mut idx = start_at;
        while idx < self.records.len()
            && ci_cmp_opt(first, self.records[idx].library.as_deref()) == Ordering::Equal
        {
            idx += 1;
        }
        idx
    }

    fn append_records(&self, out: &mut String, first: usize, last: usize) {
        for record in &self.records[first..last] {
            out.push_str(&record.to_string());
            out.push('\n');
        }
    }

    fn create_all_object_list(&self) -> String {
        let mut out = String::new();
        for record in &self.records {
            out.push_str(&record.to_string());
            out.push('\n');
        }
        out
    }

    fn ensure_sorted(&mut self) {
        if !self.sorted {
            self.records.sort();
            self.sorted = true;
        }
    }
}

impl Extend<CompilandRecord> for TruncatedRecordList {
    fn extend<T: IntoIterator<Item = CompilandRecord>>(&mut self, iter: T) {
        self.sorted = false;
        self.records.extend(iter);
    }
}

/// Hands leftover budget back to still-truncated blocks, one slot per block
/// per sweep, until the budget is gone.
fn expand_blocks_to_consume_space(
    block_starts: &[usize],
    block_display_sizes: &mut [usize],
    mut remaining: usize,
) {
    if block_display_sizes.is_empty() {
        return;
    }

    let mut idx = 0;
    while remaining != 0 {
        let block_len = block_starts[idx + 1] - block_starts[idx];
        if block_display_sizes[idx] != block_len {
            block_display_sizes[idx] += 1;
            remaining -= 1;
        }

        idx += 1;
        if idx == block_display_sizes.len() {
            idx = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(object: &str, library: &str) -> CompilandRecord {
        CompilandRecord::new(object, Some(library.to_string()))
    }

    #[test]
    fn sanitized_collapses_precompiled_header() {
        let rec = CompilandRecord::sanitized(
            r"z:\build\pch.obj",
            Some(r"z:\build\pch.obj"),
            None,
        );
        assert_eq!(rec.object, "pch.obj");
        assert_eq!(rec.library, None);
    }

    #[test]
    fn sanitized_reduces_paths_to_base_names() {
        let rec = CompilandRecord::sanitized(
            r"d:\src\obj\util.obj",
            Some("/usr/lib/libcmt.lib"),
            Some("[cookie]".to_string()),
        );
        assert_eq!(rec.object, "util.obj");
        assert_eq!(rec.library.as_deref(), Some("libcmt.lib"));
        assert_eq!(rec.to_string(), "util.obj (libcmt.lib) [cookie]");
    }

    #[test]
    fn display_omits_matching_library() {
        let rec = CompilandRecord::new("solo.obj", None);
        assert_eq!(rec.to_string(), "solo.obj");

        let rec = CompilandRecord::new("same.obj", Some("same.obj".to_string()));
        assert_eq!(rec.to_string(), "same.obj");
    }

    #[test]
    fn ordering_is_library_major_and_case_insensitive() {
        let mut list = vec![
            record("b.obj", "ZLIB.LIB"),
            record("a.obj", "zlib.lib"),
            CompilandRecord::new("direct.obj", None),
            record("c.obj", "acme.lib"),
        ];
        list.sort();

        // Library-less records sort first, then libraries case-insensitively.
        assert_eq!(list[0].object, "direct.obj");
        assert_eq!(list[1].object, "c.obj");
        assert_eq!(list[2].object, "a.obj");
        assert_eq!(list[3].object, "b.obj");
    }

    #[test]
    fn suffix_breaks_ties_ordinally() {
        let a = CompilandRecord::with_suffix("x.obj", None, "AAA");
        let b = CompilandRecord::with_suffix("x.obj", None, "aaa");
        assert!(a < b);
        assert_ne!(a, b);

        let c = CompilandRecord::with_suffix("X.OBJ", None, "AAA");
        assert_eq!(a, c);
    }

    #[test]
    fn small_max_is_raised_to_minimum() {
        let list = TruncatedRecordList::with_max_records(1);
        assert_eq!(list.max_records(), 4);
    }

    #[test]
    fn no_truncation_below_limit() {
        let mut list = TruncatedRecordList::with_max_records(10);
        for i in 0..10 {
            list.add(record(&format!("obj{}.obj", i), "lib.lib"));
        }
        assert_eq!(
            list.create_truncated_object_list(),
            list.create_sorted_object_list()
        );
        assert_eq!(list.create_sorted_object_list().lines().count(), 10);
    }

    #[test]
    fn truncated_output_has_exactly_max_lines() {
        let mut list = TruncatedRecordList::with_max_records(10);
        for lib in 0..4 {
            for i in 0..20 {
                list.add(record(
                    &format!("obj{:02}.obj", i),
                    &format!("lib{}.lib", lib),
                ));
            }
        }

        let out = list.create_truncated_object_list();
        assert_eq!(out.lines().count(), 10);
        // Repeated rendering is stable.
        assert_eq!(out, list.create_truncated_object_list());
    }

    #[test]
    fn single_giant_library_reports_per_library_and_total() {
        let mut list = TruncatedRecordList::with_max_records(5);
        for i in 0..50 {
            list.add(record(&format!("obj{:02}.obj", i), "huge.lib"));
        }

        let out = list.create_truncated_object_list();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 5);
        // budget: 5 - 1 (total line) = 4; one block, sqrt(4) = 2 target,
        // expanded round-robin to 4; 3 records shown + library note.
        assert_eq!(lines[0], "obj00.obj (huge.lib)");
        assert_eq!(lines[1], "obj01.obj (huge.lib)");
        assert_eq!(lines[2], "obj02.obj (huge.lib)");
        assert_eq!(lines[3], "(47 object files truncated from huge.lib)");
        assert_eq!(
            lines[4],
            "(47 total objects truncated from 1 total libraries, raise the evidence limit to list all objects)"
        );
    }

    #[test]
    fn elided_libraries_get_one_aggregate_line() {
        // 30 libraries of 4 objects against a budget of 12: sqrt(10) -> 3
        // per block, so only a handful of libraries fit and the rest are
        // elided entirely.
        let mut list = TruncatedRecordList::with_max_records(12);
        for lib in 0..30 {
            for i in 0..4 {
                list.add(record(
                    &format!("o{}.obj", i),
                    &format!("lib{:02}.lib", lib),
                ));
            }
        }

        let out = list.create_truncated_object_list();
        assert_eq!(out.lines().count(), 12);
        assert!(out.contains(" entire libraries truncated containing "));
        assert!(out.contains(" total objects truncated from "));
    }
}
