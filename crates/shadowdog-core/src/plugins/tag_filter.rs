//! Tag filter plugin (C7): replace Commands whose tags don't include
//! the active tag (from `SHADOWDOG_TAG`) with `Empty`.

use crate::types::Task;

const ACTIVE_TAG_ENV: &str = "SHADOWDOG_TAG";

/// No active tag means the filter is a no-op, since there's nothing
/// to filter by.
pub fn apply(task: Task) -> Task {
    match std::env::var(ACTIVE_TAG_ENV) {
        Ok(tag) if !tag.is_empty() => rewrite(task, &tag),
        _ => task,
    }
}

fn rewrite(task: Task, tag: &str) -> Task {
    match task {
        Task::Command(resolved) => {
            if resolved.command.tags.contains(tag) {
                Task::Command(resolved)
            } else {
                Task::Empty
            }
        }
        Task::Parallel(tasks) => Task::Parallel(tasks.into_iter().map(|t| rewrite(t, tag)).collect()),
        Task::Serial(tasks) => Task::Serial(tasks.into_iter().map(|t| rewrite(t, tag)).collect()),
        Task::Empty => Task::Empty,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Command, RelativePath, ResolvedCommand};
    use std::collections::BTreeSet;

    fn tagged(name: &str, tags: &[&str]) -> Task {
        Task::Command(ResolvedCommand {
            command: Command {
                command: name.to_string(),
                working_directory: RelativePath::new(".").unwrap(),
                tags: tags.iter().map(|t| t.to_string()).collect::<BTreeSet<_>>(),
                artifacts: vec![],
            },
            files: vec![],
            environment_names: vec![],
            watcher_label: None,
        })
    }

    #[test]
    fn no_active_tag_is_identity() {
        std::env::remove_var(ACTIVE_TAG_ENV);
        let task = Task::Parallel(vec![tagged("a", &["frontend"])]);
        assert_eq!(apply(task.clone()), task);
    }

    #[test]
    fn non_matching_command_becomes_empty() {
        // SAFETY: no other test in this module mutates this var concurrently within one process run.
        unsafe { std::env::set_var(ACTIVE_TAG_ENV, "backend") };
        let task = Task::Parallel(vec![tagged("a", &["frontend"]), tagged("b", &["backend"])]);
        let filtered = apply(task);
        unsafe { std::env::remove_var(ACTIVE_TAG_ENV) };
        match filtered {
            Task::Parallel(children) => {
                assert_eq!(children[0], Task::Empty);
                assert!(matches!(children[1], Task::Command(_)));
            }
            other => panic!("expected Parallel, got {other:?}"),
        }
    }
}
