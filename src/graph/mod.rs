// src/graph/mod.rs

pub mod engine;
pub mod node;

pub use engine::ExprGraph;
pub use node::{Binding, Node, NodeId};
