//! Human-readable dependency graph visualization.

use std::path::{Path, PathBuf};

use anyhow::Result;
use dagflow::DirGraph;

use crate::graph::GraphBuilder;
use crate::paths;
use crate::ui;

pub fn run(directory: &Path) -> Result<()> {
    let root = paths::get_absolute_path(directory)?;
    let tree = GraphBuilder::new().build(&root)?;
    if tree.graph.is_empty() && tree.post_graph.is_empty() {
        ui::warn(&format!(
            "no Terraform directories found under {}",
            root.display()
        ));
        return Ok(());
    }

    ui::header("Dependency graph");
    let mut sources = tree.graph.sources();
    sources.sort();
    for source in sources {
        print_subtree(&tree.graph, &source, &root, 0);
        println!();
    }

    if !tree.post_graph.is_empty() {
        ui::section("Outside the graph");
        for dir in &tree.post_graph {
            ui::dim(&relative_display(dir, &root));
        }
    }
    Ok(())
}

/// One line per node, indented by depth. Diamond nodes print once per
/// path, which makes shared dependencies visible.
fn print_subtree(graph: &DirGraph, node: &PathBuf, root: &Path, depth: usize) {
    println!("{}> {}", "\t".repeat(depth), relative_display(node, root));
    let mut successors = graph.successors(node);
    successors.sort();
    for successor in successors {
        print_subtree(graph, &successor, root, depth + 1);
    }
}

fn relative_display(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .display()
        .to_string()
}
