/// Interface to an optional external memory layer. The driver consults it at
/// most once per run, before the first iteration, and attaches the returned
/// context to the system prompt when the relevance score clears the
/// configured threshold. The driver is fully functional without a provider.
pub trait MemoryProvider {
    fn recall(&self, task_text: &str) -> Option<Recall>;
}

/// Supplementary context for a task, with a relevance score in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Recall {
    pub context: String,
    pub relevance: f64,
}

pub const DEFAULT_RELEVANCE_THRESHOLD: f64 = 0.4;
