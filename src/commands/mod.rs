pub mod graph;
pub mod pipeline;
pub mod run;
