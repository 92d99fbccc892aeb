use std::env;

/// Interpreter tuning knobs.
#[derive(Clone, Debug)]
pub struct Config {
    /// Capacity of the operand stack, the root stack and the call trace.
    pub stack_capacity: usize,
    /// Deepest allowed nesting of evaluation steps. There is no tail-call
    /// elimination, so this also bounds recursion in user functions.
    pub max_depth: usize,
    /// Live-object count that triggers the first collection.
    pub gc_threshold: usize,
    /// Amount the threshold grows after each collection.
    pub gc_increment: usize,
    /// Run a full collection after every top-level form of a batch.
    pub collect_after_each_form: bool,
    /// Print each top-level result in `eval_text`.
    pub echo_results: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            stack_capacity: 8192,
            max_depth: 1000,
            gc_threshold: 10_000,
            gc_increment: 1000,
            collect_after_each_form: false,
            echo_results: true,
        }
    }
}

impl Config {
    /// Defaults overridden by `CARP_STACK_SIZE`, `CARP_MAX_DEPTH`,
    /// `CARP_GC_THRESHOLD`, `CARP_GC_INCREMENT` and `CARP_GC_EACH_FORM=1`.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Some(n) = env_usize("CARP_STACK_SIZE") {
            config.stack_capacity = n;
        }
        if let Some(n) = env_usize("CARP_MAX_DEPTH") {
            config.max_depth = n;
        }
        if let Some(n) = env_usize("CARP_GC_THRESHOLD") {
            config.gc_threshold = n;
        }
        if let Some(n) = env_usize("CARP_GC_INCREMENT") {
            config.gc_increment = n;
        }
        config.collect_after_each_form = env::var("CARP_GC_EACH_FORM")
            .map(|v| v == "1")
            .unwrap_or(false);
        config
    }

    /// Host stack for the thread running the interpreter, sized so that
    /// `max_depth` nested evaluations fit in an unoptimised build.
    pub fn host_stack_bytes(&self) -> usize {
        const PER_LEVEL: usize = 16 * 1024;
        const BASE: usize = 8 * 1024 * 1024;
        BASE.saturating_add(self.max_depth.saturating_mul(PER_LEVEL))
    }
}

fn env_usize(name: &str) -> Option<usize> {
    let raw = env::var(name).ok()?;
    match raw.parse() {
        Ok(n) => Some(n),
        Err(_) => {
            log::warn!("ignoring {}={:?}: not a number", name, raw);
            None
        }
    }
}
