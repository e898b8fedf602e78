//! Execution plan: the structured document a run is built from.
//!
//! A plan declares streams (ownership domains), an ordered list of phases
//! (each a set of chunks), and a communication table. Plans are validated
//! structurally before any task is created; a malformed plan aborts the run
//! up front.

use crate::error::{OrchestratorError, Result};
use crate::model::StreamSpec;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A chunk is one task-to-be: a named unit of work inside a phase, owned by
/// a stream, with optional extra intra-phase dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSpec {
    pub name: String,
    pub stream: String,
    pub description: Option<String>,
    /// Extra dependencies on other chunks, by name. The implicit dependency
    /// on the whole previous phase is added at ingestion, not declared here.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub chunks: Vec<ChunkSpec>,
}

/// A declared cross-stream handoff, fired when every `from` task at
/// `trigger_phase` completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunicationRule {
    pub from: String,
    pub to: String,
    pub trigger_phase: u32,
    /// Opaque description of the handed-off interface/contract.
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub streams: Vec<StreamSpec>,
    pub phases: Vec<PhaseSpec>,
    #[serde(default)]
    pub communication: Vec<CommunicationRule>,
}

impl ExecutionPlan {
    pub fn from_yaml(content: &str) -> Result<Self> {
        let plan: ExecutionPlan = serde_yaml::from_str(content)
            .map_err(|e| OrchestratorError::PlanValidation(format!("invalid YAML: {}", e)))?;
        plan.validate()?;
        Ok(plan)
    }

    /// Structural validation. Rejects the plan before any task exists.
    pub fn validate(&self) -> Result<()> {
        if self.phases.is_empty() {
            return Err(OrchestratorError::PlanValidation(
                "plan declares no phases".to_string(),
            ));
        }
        if self.streams.is_empty() {
            return Err(OrchestratorError::PlanValidation(
                "plan declares no streams".to_string(),
            ));
        }

        let mut stream_names = HashSet::new();
        let mut owned = HashMap::new();
        for stream in &self.streams {
            if !stream_names.insert(stream.name.as_str()) {
                return Err(OrchestratorError::PlanValidation(format!(
                    "duplicate stream: {}",
                    stream.name
                )));
            }
            for resource in &stream.owned_resources {
                if let Some(other) = owned.insert(resource.as_str(), stream.name.as_str()) {
                    return Err(OrchestratorError::PlanValidation(format!(
                        "resource {} owned by both {} and {}",
                        resource, other, stream.name
                    )));
                }
            }
        }

        // Chunk names must be unique across the whole plan; dependencies are
        // declared by name and may reach back to earlier phases.
        let mut chunk_phase: HashMap<&str, usize> = HashMap::new();
        for (phase_idx, phase) in self.phases.iter().enumerate() {
            if phase.chunks.is_empty() {
                return Err(OrchestratorError::PlanValidation(format!(
                    "phase {} has no chunks",
                    phase_idx + 1
                )));
            }
            for chunk in &phase.chunks {
                if !stream_names.contains(chunk.stream.as_str()) {
                    return Err(OrchestratorError::PlanValidation(format!(
                        "chunk {} references undeclared stream {}",
                        chunk.name, chunk.stream
                    )));
                }
                if chunk_phase.insert(chunk.name.as_str(), phase_idx).is_some() {
                    return Err(OrchestratorError::PlanValidation(format!(
                        "duplicate chunk name: {}",
                        chunk.name
                    )));
                }
            }
        }

        for (phase_idx, phase) in self.phases.iter().enumerate() {
            for chunk in &phase.chunks {
                for dep in &chunk.depends_on {
                    match chunk_phase.get(dep.as_str()) {
                        None => {
                            return Err(OrchestratorError::PlanValidation(format!(
                                "chunk {} depends on unknown chunk {}",
                                chunk.name, dep
                            )));
                        }
                        Some(&dep_phase) if dep_phase > phase_idx => {
                            return Err(OrchestratorError::PlanValidation(format!(
                                "chunk {} (phase {}) depends on {} in a later phase",
                                chunk.name,
                                phase_idx + 1,
                                dep
                            )));
                        }
                        Some(_) => {}
                    }
                }
            }
            // Intra-phase edges must be acyclic; toposort doubles as the check.
            self.ordered_chunks(phase_idx)?;
        }

        for rule in &self.communication {
            for stream in [&rule.from, &rule.to] {
                if !stream_names.contains(stream.as_str()) {
                    return Err(OrchestratorError::PlanValidation(format!(
                        "communication rule references undeclared stream {}",
                        stream
                    )));
                }
            }
            if rule.trigger_phase == 0 || rule.trigger_phase as usize > self.phases.len() {
                return Err(OrchestratorError::PlanValidation(format!(
                    "communication rule trigger_phase {} is out of range (plan has {} phases)",
                    rule.trigger_phase,
                    self.phases.len()
                )));
            }
        }

        Ok(())
    }

    /// Chunks of one phase in dependency order, so ingestion can create each
    /// task after everything it references. Fails on an intra-phase cycle.
    pub fn ordered_chunks(&self, phase_idx: usize) -> Result<Vec<&ChunkSpec>> {
        let phase = &self.phases[phase_idx];
        let mut graph: DiGraph<&ChunkSpec, ()> = DiGraph::new();
        let mut indices: HashMap<&str, NodeIndex> = HashMap::new();

        for chunk in &phase.chunks {
            let idx = graph.add_node(chunk);
            indices.insert(chunk.name.as_str(), idx);
        }
        for chunk in &phase.chunks {
            for dep in &chunk.depends_on {
                // Cross-phase deps resolve against already-created tasks.
                if let Some(&dep_idx) = indices.get(dep.as_str()) {
                    graph.add_edge(dep_idx, indices[chunk.name.as_str()], ());
                }
            }
        }

        let order = toposort(&graph, None).map_err(|cycle| {
            OrchestratorError::PlanValidation(format!(
                "cyclic depends_on involving chunk {}",
                graph[cycle.node_id()].name
            ))
        })?;
        Ok(order.into_iter().map(|idx| graph[idx]).collect())
    }

    pub fn stream(&self, name: &str) -> Option<&StreamSpec> {
        self.streams.iter().find(|s| s.name == name)
    }
}
