//! Task-file parser: one pass over the lines into a flat arena.
//!
//! Tasks reference parents and children by index into [`TaskFile::tasks`];
//! a key→index map is built at the end of the parse. Keys are derived
//! from the heading path, a duplicate-text sibling ordinal, and a
//! whitespace-insensitive text fingerprint, so they survive edits to
//! unrelated lines.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task arena
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct Task {
    /// Stable identifier (hex digest prefix).
    pub key: String,
    /// Item text with continuation lines joined by a single space.
    pub text: String,
    pub checked: bool,
    /// Nesting depth: 0 for top-level items.
    pub depth: usize,
    /// Heading path scoping this task.
    pub phase_path: Vec<String>,
    /// Index of the parent task in the arena.
    pub parent: Option<usize>,
    /// Indices of child tasks, in source order.
    pub children: Vec<usize>,
    /// Zero-based first and last source line of the item (inclusive;
    /// covers continuation lines).
    pub line_range: (usize, usize),
}

/// A parsed task file. Discarded and re-parsed between orchestrator
/// iterations; mutations go through [`crate::mutate`] against the file.
#[derive(Debug, Clone)]
pub struct TaskFile {
    pub path: PathBuf,
    /// Flat arena in source order.
    pub tasks: Vec<Task>,
    key_index: HashMap<String, usize>,
    pub line_count: usize,
}

impl TaskFile {
    pub fn get(&self, key: &str) -> Option<&Task> {
        self.key_index.get(key).map(|&i| &self.tasks[i])
    }

    pub fn index_of(&self, key: &str) -> Option<usize> {
        self.key_index.get(key).copied()
    }

    pub fn total(&self) -> usize {
        self.tasks.len()
    }

    pub fn completed(&self) -> usize {
        self.tasks.iter().filter(|t| t.checked).count()
    }

    pub fn pending(&self) -> usize {
        self.tasks.iter().filter(|t| !t.checked).count()
    }

    /// Pending tasks whose every ancestor is checked or skipped, in
    /// source order. A pending parent is returned itself; its children
    /// are not (the parent gets the chance to run or decompose first).
    pub fn find_runnable_pending_tasks(&self, skipped: &[String]) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| !t.checked && !skipped.contains(&t.key))
            .filter(|t| {
                let mut ancestor = t.parent;
                while let Some(i) = ancestor {
                    let a = &self.tasks[i];
                    if !a.checked && !skipped.contains(&a.key) {
                        return false;
                    }
                    ancestor = a.parent;
                }
                true
            })
            .collect()
    }

    /// Last source line of the subtree rooted at `index` (the task's own
    /// range when it has no children).
    pub fn subtree_end_line(&self, index: usize) -> usize {
        let task = &self.tasks[index];
        task.children
            .iter()
            .map(|&c| self.subtree_end_line(c))
            .max()
            .unwrap_or(task.line_range.1)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn task_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([ \t]*)- \[( |x|X)\]\s*(.*)$").unwrap())
}

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(#+)\s+(.*?)\s*$").unwrap())
}

/// Indentation depth of a leading-whitespace run: one tab or two spaces
/// per level (odd spaces round down).
fn indent_depth(ws: &str) -> usize {
    let tabs = ws.chars().filter(|&c| c == '\t').count();
    let spaces = ws.chars().filter(|&c| c == ' ').count();
    tabs + spaces / 2
}

/// Parse markdown text into a [`TaskFile`].
pub fn parse_task_file(text: &str, path: &Path) -> TaskFile {
    let mut tasks: Vec<Task> = Vec::new();
    let mut phase_stack: Vec<(usize, String)> = Vec::new();
    // (depth, arena index) stack for parenting.
    let mut open: Vec<(usize, usize)> = Vec::new();
    let mut in_fence = false;
    let mut line_count = 0;

    for (lineno, line) in text.lines().enumerate() {
        line_count = lineno + 1;
        let trimmed = line.trim_start();

        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }

        if let Some(caps) = heading_re().captures(line) {
            let level = caps[1].len();
            phase_stack.retain(|(l, _)| *l < level);
            phase_stack.push((level, caps[2].to_string()));
            open.clear();
            continue;
        }

        if let Some(caps) = task_line_re().captures(line) {
            let depth = indent_depth(&caps[1]);
            let checked = !caps[2].trim().is_empty();
            let item_text = caps[3].trim().to_string();
            if item_text.is_empty() {
                continue;
            }

            while open.last().is_some_and(|&(d, _)| d >= depth) {
                open.pop();
            }
            let parent = open.last().map(|&(_, i)| i);

            let index = tasks.len();
            tasks.push(Task {
                key: String::new(),
                text: item_text,
                checked,
                depth,
                phase_path: phase_stack.iter().map(|(_, t)| t.clone()).collect(),
                parent,
                children: Vec::new(),
                line_range: (lineno, lineno),
            });
            if let Some(p) = parent {
                tasks[p].children.push(index);
            }
            open.push((depth, index));
            continue;
        }

        // Continuation: a non-blank line indented past where a child
        // marker would sit extends the preceding task's text.
        if !trimmed.is_empty() {
            if let Some(&(depth, index)) = open.last() {
                let ws_len = line.len() - trimmed.len();
                if indent_depth(&line[..ws_len]) > depth + 1 {
                    let task = &mut tasks[index];
                    task.text.push(' ');
                    task.text.push_str(trimmed);
                    task.line_range.1 = lineno;
                }
            }
        }
    }

    assign_keys(&mut tasks);

    let key_index = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.key.clone(), i))
        .collect();

    TaskFile {
        path: path.to_path_buf(),
        tasks,
        key_index,
        line_count,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Keys
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Whitespace-insensitive, case-insensitive digest of the item text.
fn text_fingerprint(text: &str) -> String {
    let normalized = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(&digest[..8])
}

/// Assign keys once the arena is complete. The sibling ordinal counts
/// only *duplicate-text* siblings, so inserting an unrelated sibling
/// above does not renumber existing tasks.
fn assign_keys(tasks: &mut [Task]) {
    let fingerprints: Vec<String> = tasks.iter().map(|t| text_fingerprint(&t.text)).collect();
    let phases: Vec<String> = tasks.iter().map(|t| t.phase_path.join(">")).collect();

    // (phase, parent, fingerprint) → occurrences seen so far, in source
    // order. A parent index alone pins one phase for nested tasks, but
    // top-level tasks all share `parent == None`; the phase path keeps
    // same-text tasks in different phases from renumbering each other.
    let mut seen: HashMap<(&str, Option<usize>, &str), usize> = HashMap::new();
    for i in 0..tasks.len() {
        let fp = fingerprints[i].as_str();
        let phase = phases[i].as_str();
        let ordinal = *seen
            .entry((phase, tasks[i].parent, fp))
            .and_modify(|o| *o += 1)
            .or_insert(0);
        let material = format!("{phase}|{ordinal}|{fp}");
        let digest = Sha256::digest(material.as_bytes());
        tasks[i].key = hex::encode(&digest[..8]);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> TaskFile {
        parse_task_file(text, Path::new("TASKS.md"))
    }

    // ── Basic structure ─────────────────────────────────────────────

    #[test]
    fn parses_flat_list() {
        let tf = parse("- [ ] one\n- [x] two\n- [ ] three\n");
        assert_eq!(tf.total(), 3);
        assert_eq!(tf.completed(), 1);
        assert_eq!(tf.tasks[1].text, "two");
        assert!(tf.tasks[1].checked);
    }

    #[test]
    fn heading_scopes_phase_path() {
        let tf = parse("# Setup\n- [ ] a\n## Deps\n- [ ] b\n# Build\n- [ ] c\n");
        assert_eq!(tf.tasks[0].phase_path, vec!["Setup"]);
        assert_eq!(tf.tasks[1].phase_path, vec!["Setup", "Deps"]);
        assert_eq!(tf.tasks[2].phase_path, vec!["Build"]);
    }

    #[test]
    fn indentation_builds_tree() {
        let tf = parse("- [ ] parent\n  - [ ] child\n    - [ ] grandchild\n- [ ] sibling\n");
        assert_eq!(tf.tasks[0].depth, 0);
        assert_eq!(tf.tasks[1].depth, 1);
        assert_eq!(tf.tasks[1].parent, Some(0));
        assert_eq!(tf.tasks[2].parent, Some(1));
        assert_eq!(tf.tasks[3].parent, None);
        assert_eq!(tf.tasks[0].children, vec![1]);
    }

    #[test]
    fn tab_indentation_counts_one_level() {
        let tf = parse("- [ ] parent\n\t- [ ] child\n");
        assert_eq!(tf.tasks[1].depth, 1);
        assert_eq!(tf.tasks[1].parent, Some(0));
    }

    #[test]
    fn fenced_code_blocks_ignored() {
        let tf = parse("- [ ] real\n```\n- [ ] fake\n```\n- [ ] also real\n");
        assert_eq!(tf.total(), 2);
        assert_eq!(tf.tasks[1].text, "also real");
    }

    #[test]
    fn empty_task_text_skipped() {
        let tf = parse("- [ ]\n- [ ]   \n- [ ] kept\n");
        assert_eq!(tf.total(), 1);
        assert_eq!(tf.tasks[0].text, "kept");
    }

    #[test]
    fn capital_x_counts_as_checked() {
        let tf = parse("- [X] done\n");
        assert!(tf.tasks[0].checked);
    }

    #[test]
    fn continuation_lines_join_with_space() {
        let tf = parse("- [ ] implement the parser\n      covering fenced blocks\n- [ ] next\n");
        assert_eq!(tf.tasks[0].text, "implement the parser covering fenced blocks");
        assert_eq!(tf.tasks[0].line_range, (0, 1));
        assert_eq!(tf.total(), 2);
    }

    // ── Keys ────────────────────────────────────────────────────────

    #[test]
    fn keys_stable_across_unrelated_insertions() {
        let before = parse("# P\n- [ ] alpha\n- [ ] beta\n");
        let after = parse("# P\nSome prose inserted here.\n\n- [ ] alpha\n- [ ] beta\n");
        assert_eq!(before.tasks[0].key, after.tasks[0].key);
        assert_eq!(before.tasks[1].key, after.tasks[1].key);
    }

    #[test]
    fn duplicate_sibling_text_gets_distinct_keys() {
        let tf = parse("- [ ] fix tests\n- [ ] fix tests\n");
        assert_ne!(tf.tasks[0].key, tf.tasks[1].key);
    }

    #[test]
    fn duplicate_keys_stable_under_unrelated_sibling_insertion() {
        let before = parse("- [ ] fix tests\n- [ ] fix tests\n");
        let after = parse("- [ ] something new\n- [ ] fix tests\n- [ ] fix tests\n");
        assert_eq!(before.tasks[0].key, after.tasks[1].key);
        assert_eq!(before.tasks[1].key, after.tasks[2].key);
    }

    #[test]
    fn same_text_different_phase_differs() {
        let tf = parse("# A\n- [ ] build\n# B\n- [ ] build\n");
        assert_ne!(tf.tasks[0].key, tf.tasks[1].key);
    }

    #[test]
    fn ordinals_are_scoped_per_phase() {
        // A new phase with the same text above B must not renumber B's
        // task: phases do not share an ordinal sequence.
        let before = parse("# A\n- [ ] cleanup\n# B\n- [ ] cleanup\n");
        let after = parse("# A\n- [ ] cleanup\n# A2\n- [ ] cleanup\n# B\n- [ ] cleanup\n");
        assert_eq!(before.tasks[0].key, after.tasks[0].key);
        assert_eq!(before.tasks[1].key, after.tasks[2].key);
    }

    #[test]
    fn key_lookup_round_trips() {
        let tf = parse("- [ ] a\n  - [ ] b\n");
        let key = tf.tasks[1].key.clone();
        assert_eq!(tf.get(&key).unwrap().text, "b");
    }

    // ── Runnable selection ──────────────────────────────────────────

    #[test]
    fn pending_parent_hides_children() {
        let tf = parse("- [ ] parent\n  - [ ] child\n");
        let runnable = tf.find_runnable_pending_tasks(&[]);
        assert_eq!(runnable.len(), 1);
        assert_eq!(runnable[0].text, "parent");
    }

    #[test]
    fn checked_parent_exposes_pending_children() {
        let tf = parse("- [x] parent\n  - [ ] child\n");
        let runnable = tf.find_runnable_pending_tasks(&[]);
        assert_eq!(runnable.len(), 1);
        assert_eq!(runnable[0].text, "child");
    }

    #[test]
    fn skipped_parent_exposes_children() {
        let tf = parse("- [ ] parent\n  - [ ] child\n");
        let parent_key = tf.tasks[0].key.clone();
        let runnable = tf.find_runnable_pending_tasks(&[parent_key]);
        assert_eq!(runnable.len(), 1);
        assert_eq!(runnable[0].text, "child");
    }

    #[test]
    fn all_checked_means_none_runnable() {
        let tf = parse("- [x] a\n  - [x] b\n");
        assert!(tf.find_runnable_pending_tasks(&[]).is_empty());
    }

    // ── Performance ─────────────────────────────────────────────────

    #[test]
    fn two_hundred_tasks_parse_quickly() {
        let mut doc = String::from("# Big\n");
        for i in 0..200 {
            doc.push_str(&format!("- [ ] task number {i}\n"));
        }
        let start = std::time::Instant::now();
        let tf = parse(&doc);
        assert_eq!(tf.total(), 200);
        assert!(start.elapsed().as_millis() < 100);
    }
}
