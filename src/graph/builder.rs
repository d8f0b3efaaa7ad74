//! Builds the dependency graph for a configuration tree.
//!
//! Discovery walks the tree for Terraform directories, then each
//! directory with explicit dependency metadata is grown into the graph
//! depth-first. Directories with no `depends_on` at all go to the flat
//! post-graph batch instead. Symlinked directories sharing a backing
//! target are chained so they never `init` the same directory
//! concurrently.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use dagflow::DirGraph;
use thiserror::Error;
use walkdir::WalkDir;

use crate::config::WrapperConfig;
use crate::config::resolver::{self, ConfigError};
use crate::paths;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{dir} is a dependency but declares no depends_on; add `depends_on: []` to mark it dependency-free")]
    MissingDependsOn { dir: PathBuf },
    #[error("dependency cycle detected: {}", format_cycle(cycle))]
    Cycle { cycle: Vec<PathBuf> },
    #[error("failed to scan {root}")]
    Walk {
        root: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

fn format_cycle(cycle: &[PathBuf]) -> String {
    cycle
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Result of scanning a tree: the DAG plus the flat batch of
/// directories that declared no dependency metadata.
#[derive(Debug)]
pub struct DiscoveredTree {
    pub graph: DirGraph,
    pub post_graph: Vec<PathBuf>,
}

/// Grows a [`DirGraph`] from wrapper config metadata, caching merged
/// configs so each directory's file stack is only resolved once.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    configs: HashMap<PathBuf, WrapperConfig>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph and post-graph batch for every applicable
    /// Terraform directory under `root`. Fails on cyclic dependencies
    /// and on dependencies with no dependency metadata of their own.
    pub fn build(&mut self, root: &Path) -> Result<DiscoveredTree, GraphError> {
        let config_dirs = discover_config_dirs(root)?;
        let mut graph = DirGraph::new();
        let mut post_graph = Vec::new();
        let mut visited = HashSet::new();

        for dir in &config_dirs {
            let config = self.config_for(dir)?;
            if !config.apply_automatically {
                continue;
            }
            match config.depends_on {
                None => {
                    if config.config {
                        post_graph.push(dir.clone());
                    }
                }
                Some(_) => self.graph_dependencies(dir, &mut graph, &mut visited)?,
            }
        }

        connect_symlinks(root, &config_dirs, &mut graph)?;

        // Symlink chaining may have pulled post-graph entries into the
        // graph; they must not run twice.
        post_graph.retain(|dir| !graph.contains(dir));

        if graph.has_cycle() {
            return Err(GraphError::Cycle {
                cycle: graph.find_cycle().unwrap_or_default(),
            });
        }
        Ok(DiscoveredTree { graph, post_graph })
    }

    /// Merged wrapper config for `dir`, cached across the whole build.
    pub fn config_for(&mut self, dir: &Path) -> Result<WrapperConfig, ConfigError> {
        if let Some(config) = self.configs.get(dir) {
            return Ok(config.clone());
        }
        let config = resolver::parse_wrapper_configs(dir)?;
        self.configs.insert(dir.to_path_buf(), config.clone());
        Ok(config)
    }

    /// Depth-first graph growth from one directory, guarded by `visited`
    /// so diamonds terminate and cycles do not recurse forever.
    fn graph_dependencies(
        &mut self,
        start: &Path,
        graph: &mut DirGraph,
        visited: &mut HashSet<PathBuf>,
    ) -> Result<(), GraphError> {
        let mut worklist = vec![start.to_path_buf()];
        while let Some(current) = worklist.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            let config = self.config_for(&current)?;
            if config.config {
                graph.add_node(current.clone());
            }
            let Some(depends_on) = config.depends_on else {
                return Err(GraphError::MissingDependsOn { dir: current });
            };

            for dependency in &depends_on {
                if *dependency == current {
                    continue;
                }
                graph.add_node(dependency.clone());
                if graph.contains(&current) {
                    graph.add_edge(dependency.clone(), current.clone());
                }
            }

            if graph.contains(&current) {
                for inherited in self.inherited_dependencies(&current)? {
                    if inherited != current {
                        graph.add_edge(inherited, current.clone());
                    }
                }
            }

            worklist.extend(graph.predecessors(&current));
            worklist.extend(depends_on);
        }
        Ok(())
    }

    /// Dependencies inherited from the nearest ancestor wrapper config
    /// that declares any. Only the closest declaring ancestor counts;
    /// farther ancestors are already layered into it by the merge.
    fn inherited_dependencies(&self, dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
        let files = resolver::find_wrapper_config_files(dir);
        for file in files.iter().rev() {
            if file.parent() == Some(dir) {
                continue;
            }
            let config = resolver::parse_wrapper_config_file(file)?;
            if let Some(depends_on) = config.depends_on {
                return Ok(depends_on);
            }
        }
        Ok(Vec::new())
    }
}

/// Every directory under `root` directly containing a `*.tf` file.
fn discover_config_dirs(root: &Path) -> Result<BTreeSet<PathBuf>, GraphError> {
    let mut dirs = BTreeSet::new();
    let walker = WalkDir::new(root).follow_links(true).into_iter();
    for entry in walker.filter_entry(|entry| {
        entry
            .file_name()
            .to_str()
            .is_none_or(|name| !paths::is_ignored_dir(name))
    }) {
        let entry = entry.map_err(|source| GraphError::Walk {
            root: root.to_path_buf(),
            source: source.into(),
        })?;
        if entry.file_type().is_file()
            && entry.path().extension().is_some_and(|ext| ext == "tf")
            && let Some(parent) = entry.path().parent()
        {
            dirs.insert(paths::normalize(parent));
        }
    }
    Ok(dirs)
}

/// Chain symlinked configuration directories that share a backing
/// target, so two links never run `init` on the same real directory at
/// the same time. The chain anchors on the target when the target
/// itself is a configuration directory.
fn connect_symlinks(
    root: &Path,
    config_dirs: &BTreeSet<PathBuf>,
    graph: &mut DirGraph,
) -> Result<(), GraphError> {
    let symlinks = paths::get_symlinks(root).map_err(|source| GraphError::Walk {
        root: root.to_path_buf(),
        source: source.into(),
    })?;

    for (target, links) in symlinks {
        let links: Vec<PathBuf> = links
            .into_iter()
            .filter(|link| config_dirs.contains(link))
            .collect();
        let mut previous = if graph.contains(&target) || config_dirs.contains(&target) {
            Some(target)
        } else {
            None
        };
        for link in links {
            if let Some(previous) = previous {
                graph.add_edge(previous, link.clone());
            }
            previous = Some(link);
        }
    }
    Ok(())
}
