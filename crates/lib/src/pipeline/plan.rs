//! Chained runs.
//!
//! A plan is a JSON array of build specs. Specs name the plan members they
//! depend on; each dependency's installation prefix is made visible to its
//! dependents by seeding their environment overlay.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use super::{Pipeline, PipelineError, PipelineOutcome};
use crate::build::toolchain::Toolchain;
use crate::build::types::BuildSpec;
use crate::env::EnvironmentOverlay;

#[derive(Debug, Error)]
pub enum PlanError {
  #[error("failed to read plan {}: {source}", .path.display())]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid plan: {0}")]
  Parse(#[from] serde_json::Error),

  #[error("plan lists '{0}' more than once")]
  DuplicateName(String),

  #[error("'{spec}' depends on '{dependency}', which is not in the plan")]
  UnknownDependency { spec: String, dependency: String },

  #[error("dependency cycle involving '{0}'")]
  Cycle(String),

  #[error("no plan member named '{0}'")]
  UnknownMember(String),
}

#[derive(Debug, Clone)]
pub struct Plan {
  specs: Vec<BuildSpec>,
}

impl Plan {
  pub fn new(specs: Vec<BuildSpec>) -> Result<Self, PlanError> {
    let mut seen = HashSet::new();
    for spec in &specs {
      if !seen.insert(spec.name.as_str()) {
        return Err(PlanError::DuplicateName(spec.name.clone()));
      }
    }
    Ok(Self { specs })
  }

  pub fn from_json(text: &str) -> Result<Self, PlanError> {
    Self::new(serde_json::from_str(text)?)
  }

  pub fn load(path: &Path) -> Result<Self, PlanError> {
    let text = std::fs::read_to_string(path).map_err(|source| PlanError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_json(&text)
  }

  pub fn specs(&self) -> &[BuildSpec] {
    &self.specs
  }

  pub fn get(&self, name: &str) -> Option<&BuildSpec> {
    self.specs.iter().find(|spec| spec.name == name)
  }

  /// Specs in an order where every dependency precedes its dependents.
  pub fn order(&self) -> Result<Vec<&BuildSpec>, PlanError> {
    let mut graph = DiGraph::<usize, ()>::new();
    let nodes: HashMap<&str, NodeIndex> = self
      .specs
      .iter()
      .enumerate()
      .map(|(i, spec)| (spec.name.as_str(), graph.add_node(i)))
      .collect();

    for spec in &self.specs {
      let dependent = nodes[spec.name.as_str()];
      for dependency in &spec.depends_on {
        let &dep = nodes
          .get(dependency.as_str())
          .ok_or_else(|| PlanError::UnknownDependency {
            spec: spec.name.clone(),
            dependency: dependency.clone(),
          })?;
        graph.add_edge(dep, dependent, ());
      }
    }

    let sorted = toposort(&graph, None).map_err(|cycle| PlanError::Cycle(self.specs[graph[cycle.node_id()]].name.clone()))?;
    Ok(sorted.into_iter().map(|idx| &self.specs[graph[idx]]).collect())
  }

  /// `name` and everything it transitively depends on, in run order.
  pub fn select(&self, name: &str) -> Result<Vec<&BuildSpec>, PlanError> {
    if self.get(name).is_none() {
      return Err(PlanError::UnknownMember(name.to_string()));
    }

    let mut wanted = HashSet::new();
    let mut stack = vec![name];
    while let Some(current) = stack.pop() {
      if !wanted.insert(current) {
        continue;
      }
      if let Some(spec) = self.get(current) {
        stack.extend(spec.depends_on.iter().map(String::as_str));
      }
    }

    Ok(
      self
        .order()?
        .into_iter()
        .filter(|spec| wanted.contains(spec.name.as_str()))
        .collect(),
    )
  }

  /// Overlay rules that expose `spec`'s dependencies' prefixes, with the
  /// first-listed dependency searched first.
  pub fn seed_overlay(&self, spec: &BuildSpec) -> EnvironmentOverlay {
    spec
      .depends_on
      .iter()
      .rev()
      .filter_map(|name| self.get(name))
      .fold(EnvironmentOverlay::new(), |overlay, dep| {
        overlay.extend(EnvironmentOverlay::for_prefix(&dep.prefix))
      })
  }

  /// Run the whole plan, or only `only` and its dependencies.
  ///
  /// A skipped spec does not stop the plan and its prefix still seeds its
  /// dependents. The first failure does.
  pub async fn run<T: Toolchain>(&self, pipeline: &Pipeline<T>, only: Option<&str>) -> Result<PlanReport, PipelineError> {
    let specs = match only {
      Some(name) => self.select(name)?,
      None => self.order()?,
    };

    let prefixes: BTreeMap<String, PathBuf> = self
      .specs
      .iter()
      .map(|spec| (spec.name.clone(), spec.prefix.clone()))
      .collect();

    let total = specs.len();
    let mut report = PlanReport::default();
    for (index, spec) in specs.into_iter().enumerate() {
      info!(dependency = %spec.id(), progress = %format!("{}/{}", index + 1, total), "plan member");

      let deps = spec
        .depends_on
        .iter()
        .filter_map(|name| prefixes.get_key_value(name))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

      let outcome = pipeline.run_with(spec, &self.seed_overlay(spec), &deps).await?;
      report.entries.push(PlanEntry {
        id: spec.id(),
        outcome,
      });
    }

    Ok(report)
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanEntry {
  pub id: String,
  #[serde(flatten)]
  pub outcome: PipelineOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PlanReport {
  pub entries: Vec<PlanEntry>,
}

impl PlanReport {
  pub fn built(&self) -> usize {
    self
      .entries
      .iter()
      .filter(|e| matches!(e.outcome, PipelineOutcome::Built(_)))
      .count()
  }

  pub fn skipped(&self) -> usize {
    self.entries.len() - self.built()
  }
}
