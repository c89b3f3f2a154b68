//! Command fusion plugin (C7): merge Commands sharing a command-family
//! prefix and working directory into one fused Command whose inputs,
//! invalidators, artifacts and tags are the concatenations of the
//! components (spec.md §4.7).
//!
//! Grouping is deliberately simple, matching the spec's own
//! illustrative example: the command string's last whitespace-
//! delimited token is the varying part, everything before it is the
//! family prefix.

use std::collections::HashMap;

use crate::types::{Command, RelativePath, ResolvedCommand, Task};

pub fn apply(task: Task) -> Task {
    match task {
        Task::Parallel(children) => Task::Parallel(fuse_siblings(children)),
        Task::Serial(children) => Task::Serial(children.into_iter().map(apply).collect()),
        other => other,
    }
}

fn fuse_siblings(children: Vec<Task>) -> Vec<Task> {
    let mut commands = Vec::new();
    let mut others = Vec::new();
    for child in children {
        match child {
            Task::Command(resolved) => commands.push(resolved),
            other => others.push(apply(other)),
        }
    }
    let mut result: Vec<Task> = fuse_commands(commands).into_iter().map(Task::Command).collect();
    result.extend(others);
    result
}

/// Splits `command` into (family prefix, varying last token). A
/// single-token command has no varying part and is never fused.
fn split_last_token(command: &str) -> Option<(String, String)> {
    let tokens: Vec<&str> = command.split_whitespace().collect();
    let (last, prefix_tokens) = tokens.split_last()?;
    if prefix_tokens.is_empty() {
        return None;
    }
    Some((prefix_tokens.join(" "), (*last).to_string()))
}

fn fuse_commands(commands: Vec<ResolvedCommand>) -> Vec<ResolvedCommand> {
    let mut order: Vec<(RelativePath, String)> = Vec::new();
    let mut groups: HashMap<(RelativePath, String), Vec<ResolvedCommand>> = HashMap::new();
    let mut unfusable = Vec::new();

    for resolved in commands {
        match split_last_token(&resolved.command.command) {
            Some((prefix, _)) => {
                let key = (resolved.command.working_directory.clone(), prefix);
                if !groups.contains_key(&key) {
                    order.push(key.clone());
                }
                groups.entry(key).or_default().push(resolved);
            }
            None => unfusable.push(resolved),
        }
    }

    let mut out = Vec::new();
    for key in order {
        let mut members = groups.remove(&key).expect("key was just inserted into order");
        if members.len() == 1 {
            out.push(members.pop().expect("len checked above"));
        } else {
            out.push(fuse_group(&key.1, members));
        }
    }
    out.extend(unfusable);
    out
}

fn fuse_group(prefix: &str, members: Vec<ResolvedCommand>) -> ResolvedCommand {
    let working_directory = members[0].command.working_directory.clone();
    let watcher_label = members[0].watcher_label.clone();

    let mut last_tokens = Vec::new();
    let mut tags = std::collections::BTreeSet::new();
    let mut artifacts = Vec::new();
    let mut files = Vec::new();
    let mut environment_names = Vec::new();

    for member in members {
        if let Some((_, last)) = split_last_token(&member.command.command) {
            last_tokens.push(last);
        }
        tags.extend(member.command.tags);
        artifacts.extend(member.command.artifacts);
        files.extend(member.files);
        environment_names.extend(member.environment_names);
    }

    ResolvedCommand {
        command: Command {
            command: format!("{prefix} {}", last_tokens.join(" ")),
            working_directory,
            tags,
            artifacts,
        },
        files,
        environment_names,
        watcher_label,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Artifact;

    fn resolved(command: &str, output: &str) -> ResolvedCommand {
        ResolvedCommand {
            command: Command {
                command: command.to_string(),
                working_directory: RelativePath::new(".").unwrap(),
                tags: Default::default(),
                artifacts: vec![Artifact {
                    output: RelativePath::new(output).unwrap(),
                    description: None,
                    ignore: vec![],
                }],
            },
            files: vec![],
            environment_names: vec![],
            watcher_label: None,
        }
    }

    #[test]
    fn fuses_shared_prefix_same_working_directory() {
        let task = Task::Parallel(vec![
            Task::Command(resolved("bundle exec rake t1", "dist/t1.out")),
            Task::Command(resolved("bundle exec rake t2", "dist/t2.out")),
        ]);
        let fused = apply(task);
        match fused {
            Task::Parallel(children) => {
                assert_eq!(children.len(), 1);
                match &children[0] {
                    Task::Command(rc) => {
                        assert_eq!(rc.command.command, "bundle exec rake t1 t2");
                        assert_eq!(rc.command.artifacts.len(), 2);
                    }
                    other => panic!("expected fused Command, got {other:?}"),
                }
            }
            other => panic!("expected Parallel, got {other:?}"),
        }
    }

    #[test]
    fn different_working_directories_are_not_fused() {
        let mut b = resolved("bundle exec rake t2", "dist/t2.out");
        b.command.working_directory = RelativePath::new("other").unwrap();
        let task = Task::Parallel(vec![Task::Command(resolved("bundle exec rake t1", "dist/t1.out")), Task::Command(b)]);
        let fused = apply(task);
        match fused {
            Task::Parallel(children) => assert_eq!(children.len(), 2),
            other => panic!("expected Parallel, got {other:?}"),
        }
    }

    #[test]
    fn single_token_command_is_never_fused() {
        let task = Task::Parallel(vec![Task::Command(resolved("make", "dist/a.out")), Task::Command(resolved("make", "dist/b.out"))]);
        let fused = apply(task);
        match fused {
            Task::Parallel(children) => assert_eq!(children.len(), 2),
            other => panic!("expected Parallel, got {other:?}"),
        }
    }
}
