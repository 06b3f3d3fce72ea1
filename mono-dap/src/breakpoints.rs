// Breakpoint and catchpoint bookkeeping
//
// Ids come from one process-wide counter and are never reused. The table
// only records what the client asked for; resolving into the engine is the
// session's job.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_BREAKPOINT_ID: AtomicU32 = AtomicU32::new(1);

pub fn next_breakpoint_id() -> u32 {
    NEXT_BREAKPOINT_ID.fetch_add(1, Ordering::Relaxed)
}

const MONO_EXTENSIONS: &[&str] = &[
    ".cs", ".csx", ".cake", ".fs", ".fsi", ".ml", ".mli", ".fsx", ".fsscript", ".hx", ".vb",
];

/// Whether the runtime can have debug info for this source file
pub fn has_mono_extension(path: &str) -> bool {
    let Some(ext) = Path::new(path).extension().and_then(|ext| ext.to_str()) else {
        return false;
    };
    let ext = format!(".{}", ext.to_ascii_lowercase());
    MONO_EXTENSIONS.contains(&ext.as_str())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBreakpoint {
    pub id: u32,
    pub path: String,
    /// Engine line
    pub line: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catchpoint {
    pub id: u32,
    pub exception: String,
}

/// Outcome of replacing the breakpoints of one file
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BreakpointUpdate {
    /// One id per requested line, in request order
    pub ids: Vec<u32>,
    pub added: Vec<SourceBreakpoint>,
    pub removed: Vec<u32>,
}

#[derive(Debug, Default)]
pub struct BreakpointTable {
    breakpoints: BTreeMap<u32, SourceBreakpoint>,
    catchpoints: Vec<Catchpoint>,
}

impl BreakpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the breakpoints of `path` with `lines` (engine lines)
    pub fn apply(&mut self, path: &str, lines: &[i64]) -> BreakpointUpdate {
        let existing: BTreeMap<i64, u32> = self
            .breakpoints
            .values()
            .filter(|bp| bp.path == path)
            .map(|bp| (bp.line, bp.id))
            .collect();

        let mut update = BreakpointUpdate::default();

        for (line, id) in &existing {
            if !lines.contains(line) {
                self.breakpoints.remove(id);
                update.removed.push(*id);
            }
        }

        let mut assigned: BTreeMap<i64, u32> = BTreeMap::new();
        for line in lines {
            let id = match existing.get(line).or_else(|| assigned.get(line)) {
                Some(id) => *id,
                None => {
                    let bp = SourceBreakpoint {
                        id: next_breakpoint_id(),
                        path: path.to_string(),
                        line: *line,
                    };
                    self.breakpoints.insert(bp.id, bp.clone());
                    update.added.push(bp.clone());
                    bp.id
                }
            };
            assigned.insert(*line, id);
            update.ids.push(id);
        }

        update
    }

    /// Replace every catchpoint, returning (removed ids, added catchpoints)
    pub fn replace_catchpoints(&mut self, names: &[String]) -> (Vec<u32>, Vec<Catchpoint>) {
        let removed = self.catchpoints.drain(..).map(|cp| cp.id).collect();

        for name in names {
            self.catchpoints.push(Catchpoint {
                id: next_breakpoint_id(),
                exception: name.clone(),
            });
        }

        (removed, self.catchpoints.clone())
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = &SourceBreakpoint> {
        self.breakpoints.values()
    }

    pub fn catchpoints(&self) -> &[Catchpoint] {
        &self.catchpoints
    }

    pub fn clear(&mut self) {
        self.breakpoints.clear();
        self.catchpoints.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_same_lines_keep_ids() {
        let mut table = BreakpointTable::new();
        let first = table.apply("/src/Program.cs", &[10, 20]);
        let second = table.apply("/src/Program.cs", &[10, 20]);

        assert_eq!(first.ids, second.ids);
        assert!(second.added.is_empty());
        assert!(second.removed.is_empty());
    }

    #[test]
    fn test_diff_per_file() {
        let mut table = BreakpointTable::new();
        let first = table.apply("/src/A.cs", &[1, 2]);
        table.apply("/src/B.cs", &[2]);

        let update = table.apply("/src/A.cs", &[2, 3]);

        assert_eq!(update.removed, vec![first.ids[0]]);
        assert_eq!(update.ids[0], first.ids[1]);
        assert_eq!(update.added.len(), 1);
        assert_eq!(update.added[0].line, 3);
        assert!(update.ids[1] > first.ids[1]);

        // B.cs is untouched
        assert_eq!(table.breakpoints().filter(|bp| bp.path == "/src/B.cs").count(), 1);
        assert_eq!(table.breakpoints().count(), 3);
    }

    #[test]
    fn test_duplicate_lines_share_an_id() {
        let mut table = BreakpointTable::new();
        let update = table.apply("/src/A.cs", &[5, 5]);

        assert_eq!(update.ids[0], update.ids[1]);
        assert_eq!(update.added.len(), 1);
    }

    #[test]
    fn test_ids_are_never_reused() {
        let mut table = BreakpointTable::new();
        let first = table.apply("/src/A.cs", &[1]);
        table.apply("/src/A.cs", &[]);
        let again = table.apply("/src/A.cs", &[1]);

        assert!(again.ids[0] > first.ids[0]);
    }

    #[test]
    fn test_replace_catchpoints() {
        let mut table = BreakpointTable::new();
        let (removed, added) = table.replace_catchpoints(&["System.Exception".to_string()]);
        assert!(removed.is_empty());
        assert_eq!(added[0].exception, "System.Exception");
        let first_id = added[0].id;

        let (removed, added) = table.replace_catchpoints(&[]);
        assert_eq!(removed, vec![first_id]);
        assert!(added.is_empty());
        assert!(table.catchpoints().is_empty());
    }

    #[test]
    fn test_mono_extensions() {
        assert!(has_mono_extension("/src/Program.cs"));
        assert!(has_mono_extension("C:\\src\\Module.FS"));
        assert!(has_mono_extension("script.fsx"));
        assert!(!has_mono_extension("/src/main.rs"));
        assert!(!has_mono_extension("Makefile"));
    }
}
