/// How chatty a progress line is. `V` lines show with `-v`, `VV` with `-vv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    V,
    VV,
}

/// Receives user-facing progress lines. Never fails, never blocks for long.
pub trait ProgressSink: Send + Sync {
    fn println(&self, level: Level, line: &str);
}

/// Forwards progress lines up to a verbosity to `tracing`.
#[derive(Debug, Clone, Copy)]
pub struct TracingProgress {
    verbosity: Option<Level>,
}

impl TracingProgress {
    pub fn new(verbosity: Option<Level>) -> Self {
        Self { verbosity }
    }

    pub fn admits(&self, level: Level) -> bool {
        self.verbosity.is_some_and(|verbosity| level <= verbosity)
    }
}

impl ProgressSink for TracingProgress {
    fn println(&self, level: Level, line: &str) {
        if self.admits(level) {
            tracing::info!(target: "chunkhaul::progress", "{line}");
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn println(&self, _level: Level, _line: &str) {}
}
