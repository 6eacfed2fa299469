//! 迭代式检索-推理状态机

pub mod builder;
pub mod engine;
pub mod nodes;
pub mod query;
pub mod types;

pub use builder::WorkflowBuilder;
pub use engine::Orchestrator;
pub use nodes::{
    Evidence, EvidencePipeline, ExecuteNode, GenerateNode, NodeContext, NodeHandler, NodeOutput,
    PlanNode, ReplanNode, RetrieveNode, TransformNode,
};
pub use query::{Formulation, FormulationInput, QueryFormulator};
pub use types::*;
