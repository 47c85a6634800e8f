//! In-place task-file mutations.
//!
//! Every operation re-reads the file, targets the specific lines of one
//! task, and rewrites the file atomically (temp file + rename in the
//! same directory). Surrounding content is preserved byte-for-byte.

use std::path::Path;

use ih_domain::{Error, Result};

use crate::parse::{parse_task_file, Task, TaskFile};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn load(path: &Path) -> Result<(String, TaskFile)> {
    let text = std::fs::read_to_string(path)?;
    let parsed = parse_task_file(&text, path);
    Ok((text, parsed))
}

fn require_task<'a>(parsed: &'a TaskFile, key: &str) -> Result<&'a Task> {
    parsed.get(key).ok_or_else(|| {
        Error::Validation(format!(
            "no task with key {key} in {} — the file may have changed since the last parse",
            parsed.path.display()
        ))
    })
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::fs::write(tmp.path(), content)?;
    tmp.persist(path)
        .map_err(|e| Error::Io(e.error))?;
    Ok(())
}

fn leading_whitespace(line: &str) -> &str {
    &line[..line.len() - line.trim_start().len()]
}

/// Rejoin lines with a trailing newline matching the original file.
fn join_lines(lines: &[String], had_trailing_newline: bool) -> String {
    let mut out = lines.join("\n");
    if had_trailing_newline {
        out.push('\n');
    }
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Mutations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Flip a task's `[ ]` to `[x]`. Already-checked tasks are left alone,
/// so a repeated call produces identical file bytes.
pub fn mark_task_checked(path: &Path, key: &str) -> Result<()> {
    let (text, parsed) = load(path)?;
    let task = require_task(&parsed, key)?;
    if task.checked {
        return Ok(());
    }

    let mut lines: Vec<String> = text.lines().map(String::from).collect();
    let line = &lines[task.line_range.0];
    lines[task.line_range.0] = line.replacen("- [ ]", "- [x]", 1);

    write_atomic(path, &join_lines(&lines, text.ends_with('\n')))?;
    tracing::debug!(key, text = %task.text, "task checked");
    Ok(())
}

/// Append `<!-- anton: {note} -->` on an indented line following the
/// task. A note already present below the task is not duplicated.
pub fn append_task_note(path: &Path, key: &str, note: &str) -> Result<()> {
    let (text, parsed) = load(path)?;
    let task = require_task(&parsed, key)?;

    let mut lines: Vec<String> = text.lines().map(String::from).collect();
    let indent = format!("{}  ", leading_whitespace(&lines[task.line_range.0]));
    let note_line = format!("{indent}<!-- anton: {note} -->");

    // Idempotency: look for the same note between this task and the
    // next task/heading.
    let end = parsed.index_of(key).map(|i| parsed.subtree_end_line(i)).unwrap_or(task.line_range.1);
    for existing in lines.iter().skip(task.line_range.1 + 1).take(end.saturating_sub(task.line_range.1) + 4) {
        if existing.trim() == note_line.trim() {
            return Ok(());
        }
    }

    lines.insert(task.line_range.1 + 1, note_line);
    write_atomic(path, &join_lines(&lines, text.ends_with('\n')))?;
    Ok(())
}

/// Insert new unchecked children immediately after the parent's
/// subtree. Returns the newly parsed task records (in insertion order).
/// An empty `texts` slice is a no-op.
pub fn insert_sub_tasks(path: &Path, parent_key: &str, texts: &[String]) -> Result<Vec<Task>> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }

    let (text, parsed) = load(path)?;
    let parent = require_task(&parsed, parent_key)?;
    let parent_index = parsed
        .index_of(parent_key)
        .ok_or_else(|| Error::Validation(format!("no task with key {parent_key}")))?;

    let mut lines: Vec<String> = text.lines().map(String::from).collect();
    let indent = format!("{}  ", leading_whitespace(&lines[parent.line_range.0]));
    let insert_at = parsed.subtree_end_line(parent_index) + 1;

    for (offset, t) in texts.iter().enumerate() {
        lines.insert(insert_at + offset, format!("{indent}- [ ] {}", t.trim()));
    }

    write_atomic(path, &join_lines(&lines, text.ends_with('\n')))?;
    tracing::info!(parent = %parent.text, count = texts.len(), "subtasks inserted");

    // Re-parse and return the records at the inserted lines.
    let (_, reparsed) = load(path)?;
    let inserted: Vec<Task> = reparsed
        .tasks
        .iter()
        .filter(|t| t.line_range.0 >= insert_at && t.line_range.0 < insert_at + texts.len())
        .cloned()
        .collect();
    Ok(inserted)
}

/// Check a parent once all its children are checked, cascading upward.
pub fn auto_complete_ancestors(path: &Path, key: &str) -> Result<()> {
    let mut current = key.to_string();
    loop {
        let (_, parsed) = load(path)?;
        let task = require_task(&parsed, &current)?;
        let Some(parent_index) = task.parent else {
            return Ok(());
        };
        let parent = &parsed.tasks[parent_index];
        let all_checked = parent
            .children
            .iter()
            .all(|&c| parsed.tasks[c].checked);
        if parent.checked || !all_checked {
            return Ok(());
        }
        let parent_key = parent.key.clone();
        mark_task_checked(path, &parent_key)?;
        current = parent_key;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
