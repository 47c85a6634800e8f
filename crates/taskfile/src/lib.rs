//! Markdown task-list parsing and mutation.
//!
//! A task file is GitHub-flavored markdown whose `- [ ]` / `- [x]` items
//! form a tree under heading-scoped phases. Parses are cheap and
//! regenerated on every orchestrator iteration; only the markdown file
//! itself is durable.

pub mod mutate;
pub mod parse;

pub use mutate::{append_task_note, auto_complete_ancestors, insert_sub_tasks, mark_task_checked};
pub use parse::{parse_task_file, Task, TaskFile};
