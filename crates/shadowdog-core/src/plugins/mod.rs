//! Command Plugins (C7): pure `Task -> Task` transformations applied
//! left-to-right over the configured plugin list (spec.md §4.7).

pub mod fusion;
pub mod layering;
pub mod tag_filter;

use crate::error::Result;
use crate::types::{PluginConfig, Task};

/// Run every configured plugin over `task`, in configuration order.
/// An unrecognized plugin name is logged and skipped rather than
/// treated as fatal, since the plugin list is user-authored config.
pub fn apply_all(task: Task, plugins: &[PluginConfig]) -> Result<Task> {
    let mut current = task;
    for plugin in plugins {
        current = match plugin.name.as_str() {
            "tagFilter" => tag_filter::apply(current),
            "fusion" => fusion::apply(current),
            "layering" => layering::apply(current)?,
            other => {
                tracing::warn!(plugin = other, "unrecognized command plugin, skipping");
                current
            }
        };
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Command, RelativePath, ResolvedCommand};

    fn command(name: &str) -> Task {
        Task::Command(ResolvedCommand {
            command: Command {
                command: name.to_string(),
                working_directory: RelativePath::new(".").unwrap(),
                tags: Default::default(),
                artifacts: vec![],
            },
            files: vec![],
            environment_names: vec![],
            watcher_label: None,
        })
    }

    #[test]
    fn unknown_plugin_name_is_skipped_not_fatal() {
        let task = Task::Parallel(vec![command("echo a")]);
        let plugins = vec![PluginConfig {
            name: "doesNotExist".to_string(),
            options: serde_json::Value::Null,
        }];
        let result = apply_all(task.clone(), &plugins).unwrap();
        assert_eq!(result, task);
    }

    #[test]
    fn empty_plugin_list_is_identity() {
        let task = Task::Parallel(vec![command("echo a")]);
        let result = apply_all(task.clone(), &[]).unwrap();
        assert_eq!(result, task);
    }
}
