mod judging;

pub use judging::JudgePipeline;
