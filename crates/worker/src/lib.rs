pub mod processor;

pub use processor::AnalysisJobProcessor;
