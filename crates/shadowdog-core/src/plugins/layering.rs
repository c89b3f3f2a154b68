//! Dependency layering plugin (C7): build a DAG where an edge exists
//! when one Command's input is another Command's output, topologically
//! sort, and emit a `Serial` of `Parallel` layers preserving original
//! order within a layer (spec.md §4.7).
//!
//! Grounded on `crates/task-graph/src/graph.rs::TaskGraph` — the
//! `petgraph` `DiGraph`/`toposort`/`is_cyclic_directed` combination and
//! its level-assignment loop in `get_parallel_groups` are reused
//! near-verbatim, generalized from named task nodes to
//! artifact-path edges.

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::algo::{is_cyclic_directed, tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::{Error, Result};
use crate::types::{ResolvedCommand, Task};

pub fn apply(task: Task) -> Result<Task> {
    let commands = collect_commands(&task);
    if commands.len() <= 1 {
        return Ok(task);
    }

    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let nodes: Vec<NodeIndex> = (0..commands.len()).map(|i| graph.add_node(i)).collect();

    for (consumer_idx, consumer) in commands.iter().enumerate() {
        for input in &consumer.files {
            for (producer_idx, producer) in commands.iter().enumerate() {
                if producer_idx == consumer_idx {
                    continue;
                }
                if producer.command.artifacts.iter().any(|a| &a.output == input) {
                    graph.add_edge(nodes[producer_idx], nodes[consumer_idx], ());
                }
            }
        }
    }

    if is_cyclic_directed(&graph) {
        return Err(Error::cycle_detected(cycle_outputs(&graph, &commands)));
    }

    let sorted = toposort(&graph, None).map_err(|_| Error::cycle_detected(cycle_outputs(&graph, &commands)))?;

    let mut level_of: HashMap<NodeIndex, usize> = HashMap::new();
    let mut layers: Vec<Vec<usize>> = Vec::new();
    for node in sorted {
        let mut level = 0;
        for edge in graph.edges_directed(node, Direction::Incoming) {
            let dep_level = level_of[&edge.source()];
            level = level.max(dep_level + 1);
        }
        if level >= layers.len() {
            layers.resize(level + 1, Vec::new());
        }
        layers[level].push(graph[node]);
        level_of.insert(node, level);
    }

    for layer in &mut layers {
        layer.sort_unstable();
    }

    let serial = Task::Serial(
        layers
            .into_iter()
            .map(|layer| Task::Parallel(layer.into_iter().map(|idx| Task::Command(commands[idx].clone())).collect()))
            .collect(),
    );
    Ok(serial)
}

fn collect_commands(task: &Task) -> Vec<ResolvedCommand> {
    let mut out = Vec::new();
    collect_into(task, &mut out);
    out
}

fn collect_into(task: &Task, out: &mut Vec<ResolvedCommand>) {
    match task {
        Task::Command(resolved) => out.push(resolved.clone()),
        Task::Parallel(tasks) | Task::Serial(tasks) => {
            for t in tasks {
                collect_into(t, out);
            }
        }
        Task::Empty => {}
    }
}

fn cycle_outputs(graph: &DiGraph<usize, ()>, commands: &[ResolvedCommand]) -> Vec<String> {
    let mut outputs = Vec::new();
    for scc in tarjan_scc(graph) {
        let in_cycle = scc.len() > 1 || graph.contains_edge(scc[0], scc[0]);
        if !in_cycle {
            continue;
        }
        for node in scc {
            let idx = graph[node];
            outputs.extend(commands[idx].command.artifacts.iter().map(|a| a.output.to_string_lossy()));
        }
    }
    outputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Artifact, Command, RelativePath};

    fn resolved(command: &str, inputs: &[&str], outputs: &[&str]) -> ResolvedCommand {
        ResolvedCommand {
            command: Command {
                command: command.to_string(),
                working_directory: RelativePath::new(".").unwrap(),
                tags: Default::default(),
                artifacts: outputs
                    .iter()
                    .map(|o| Artifact {
                        output: RelativePath::new(*o).unwrap(),
                        description: None,
                        ignore: vec![],
                    })
                    .collect(),
            },
            files: inputs.iter().map(|i| RelativePath::new(*i).unwrap()).collect(),
            environment_names: vec![],
            watcher_label: None,
        }
    }

    #[test]
    fn layers_independent_commands_together() {
        let task = Task::Parallel(vec![
            Task::Command(resolved("build a", &[], &["dist/a.out"])),
            Task::Command(resolved("build b", &[], &["dist/b.out"])),
        ]);
        let layered = apply(task).unwrap();
        match layered {
            Task::Serial(layers) => {
                assert_eq!(layers.len(), 1);
                match &layers[0] {
                    Task::Parallel(children) => assert_eq!(children.len(), 2),
                    other => panic!("expected Parallel, got {other:?}"),
                }
            }
            other => panic!("expected Serial, got {other:?}"),
        }
    }

    #[test]
    fn producer_then_consumer_become_two_layers() {
        let task = Task::Parallel(vec![
            Task::Command(resolved("build b", &["dist/a.out"], &["dist/b.out"])),
            Task::Command(resolved("build a", &[], &["dist/a.out"])),
        ]);
        let layered = apply(task).unwrap();
        match layered {
            Task::Serial(layers) => {
                assert_eq!(layers.len(), 2);
                match (&layers[0], &layers[1]) {
                    (Task::Parallel(first), Task::Parallel(second)) => {
                        assert_eq!(first.len(), 1);
                        assert_eq!(second.len(), 1);
                        if let Task::Command(rc) = &first[0] {
                            assert_eq!(rc.command.command, "build a");
                        }
                        if let Task::Command(rc) = &second[0] {
                            assert_eq!(rc.command.command, "build b");
                        }
                    }
                    other => panic!("expected two Parallel layers, got {other:?}"),
                }
            }
            other => panic!("expected Serial, got {other:?}"),
        }
    }

    #[test]
    fn cycle_is_rejected_with_structured_error() {
        let task = Task::Parallel(vec![
            Task::Command(resolved("build a", &["dist/b.out"], &["dist/a.out"])),
            Task::Command(resolved("build b", &["dist/a.out"], &["dist/b.out"])),
        ]);
        let err = apply(task).unwrap_err();
        match err {
            Error::CycleDetected { outputs } => {
                assert!(outputs.iter().any(|o| o == "dist/a.out" || o == "dist/b.out"));
            }
            other => panic!("expected CycleDetected, got {other:?}"),
        }
    }
}
