//! The tool surface exposed to the LLM.
//!
//! The name list is part of the external contract; executors live
//! outside this crate behind [`ToolExecutor`]. The slim variant drops
//! every mutating tool plus `spawn_task` and is used for read-only
//! auxiliary sessions (discovery, decomposition, AI review).

use ih_domain::chat::{ToolCall, ToolDefinition};
use serde_json::json;

/// Closed list of tool names, in schema order.
pub const TOOL_NAMES: &[&str] = &[
    "read_file",
    "read_files",
    "write_file",
    "edit_file",
    "edit_range",
    "apply_patch",
    "insert_file",
    "list_dir",
    "search_files",
    "exec",
    "spawn_task",
    "vault_search",
    "vault_note",
];

/// Tools that mutate the filesystem or spawn work; excluded from the
/// slim variant.
const MUTATING: &[&str] = &[
    "write_file",
    "edit_file",
    "edit_range",
    "apply_patch",
    "insert_file",
    "exec",
    "spawn_task",
];

/// Executes tool calls on behalf of a session.
///
/// Returns `(content, is_error)`; errors are surfaced to the model as
/// tool results, not raised; the model gets a chance to recover.
#[async_trait::async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, call: &ToolCall) -> (String, bool);
}

/// Build the tool schema. `slim` keeps only read/search/vault tools.
pub fn tool_definitions(slim: bool) -> Vec<ToolDefinition> {
    all_definitions()
        .into_iter()
        .filter(|t| !slim || !MUTATING.contains(&t.name.as_str()))
        .collect()
}

fn all_definitions() -> Vec<ToolDefinition> {
    let def = |name: &str, description: &str, parameters: serde_json::Value| ToolDefinition {
        name: name.into(),
        description: description.into(),
        parameters,
    };

    vec![
        def(
            "read_file",
            "Read a file, optionally a line range.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "start_line": { "type": "integer" },
                    "end_line": { "type": "integer" }
                },
                "required": ["path"]
            }),
        ),
        def(
            "read_files",
            "Read several files in one call.",
            json!({
                "type": "object",
                "properties": {
                    "paths": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["paths"]
            }),
        ),
        def(
            "write_file",
            "Create or overwrite a file with the given content.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "content": { "type": "string" }
                },
                "required": ["path", "content"]
            }),
        ),
        def(
            "edit_file",
            "Replace an exact text occurrence in a file.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "old_text": { "type": "string" },
                    "new_text": { "type": "string" }
                },
                "required": ["path", "old_text", "new_text"]
            }),
        ),
        def(
            "edit_range",
            "Replace a line range in a file.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "start_line": { "type": "integer" },
                    "end_line": { "type": "integer" },
                    "new_text": { "type": "string" }
                },
                "required": ["path", "start_line", "end_line", "new_text"]
            }),
        ),
        def(
            "apply_patch",
            "Apply a unified diff. Only files in touched_files may change.",
            json!({
                "type": "object",
                "properties": {
                    "patch": { "type": "string" },
                    "touched_files": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["patch", "touched_files"]
            }),
        ),
        def(
            "insert_file",
            "Insert text at a line without replacing anything.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "line": { "type": "integer" },
                    "text": { "type": "string" }
                },
                "required": ["path", "line", "text"]
            }),
        ),
        def(
            "list_dir",
            "List a directory.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "recursive": { "type": "boolean" }
                },
                "required": ["path"]
            }),
        ),
        def(
            "search_files",
            "Search file contents with a regex.",
            json!({
                "type": "object",
                "properties": {
                    "pattern": { "type": "string" },
                    "path": { "type": "string" },
                    "max_results": { "type": "integer" }
                },
                "required": ["pattern"]
            }),
        ),
        def(
            "exec",
            "Run a shell command in the project.",
            json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string" },
                    "cwd": { "type": "string" },
                    "timeout_sec": { "type": "integer" }
                },
                "required": ["command"]
            }),
        ),
        def(
            "spawn_task",
            "Delegate a self-contained subtask to a fresh agent session.",
            json!({
                "type": "object",
                "properties": {
                    "prompt": { "type": "string" }
                },
                "required": ["prompt"]
            }),
        ),
        def(
            "vault_search",
            "Search durable notes and archived tool output.",
            json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "limit": { "type": "integer" }
                },
                "required": ["query"]
            }),
        ),
        def(
            "vault_note",
            "Store a durable note that survives context compaction.",
            json!({
                "type": "object",
                "properties": {
                    "key": { "type": "string" },
                    "value": { "type": "string" }
                },
                "required": ["key", "value"]
            }),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_schema_covers_contract_names() {
        let defs = tool_definitions(false);
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, TOOL_NAMES.to_vec());
    }

    #[test]
    fn slim_schema_drops_mutators_and_spawn() {
        let defs = tool_definitions(true);
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["read_file", "read_files", "list_dir", "search_files", "vault_search", "vault_note"]
        );
    }

    #[test]
    fn every_schema_is_an_object_with_required() {
        for def in tool_definitions(false) {
            assert_eq!(def.parameters["type"], "object", "{}", def.name);
            assert!(def.parameters["required"].is_array(), "{}", def.name);
        }
    }
}
