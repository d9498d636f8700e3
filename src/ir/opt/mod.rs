use crate::ir::def::Function;
use crate::ir::layout::DataLayout;
use crate::ir::verify;
use crate::target::TargetInfo;
use std::env;

pub mod vectorize;

pub use vectorize::{VectorizeStats, DEFAULT_CHUNK};

/// Drives the vectorizer over functions, with optional IR verification
/// around the pass.
pub struct Engine;

#[derive(Debug, Default, Clone, Copy)]
pub struct EngineStats {
    pub functions_changed: usize,
    pub vector_instructions: usize,
    pub scalars_vectorized: usize,
}

impl EngineStats {
    fn accumulate(&mut self, other: VectorizeStats) {
        if other.changed() {
            self.functions_changed += 1;
        }
        self.vector_instructions += other.vector_instructions;
        self.scalars_vectorized += other.scalars_vectorized;
    }
}

impl Engine {
    pub fn new() -> Self {
        Self
    }

    fn env_bool(key: &str, default_v: bool) -> bool {
        match env::var(key) {
            Ok(v) => matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            ),
            Err(_) => default_v,
        }
    }

    fn env_usize(key: &str, default_v: usize) -> usize {
        env::var(key)
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(default_v)
    }

    fn verify_each_pass() -> bool {
        Self::env_bool("LANEFUSE_VERIFY_EACH_PASS", false)
    }

    fn chunk() -> usize {
        Self::env_usize("LANEFUSE_CHUNK", DEFAULT_CHUNK)
    }

    fn verify_or_panic(func: &Function, stage: &str) {
        if let Err(e) = verify::verify_ir(func) {
            panic!(
                "IR verification failed at {}: {}\nFunction: {}",
                stage, e, func.name
            );
        }
    }

    pub fn run_function(
        &self,
        func: &mut Function,
        target: &TargetInfo,
        layout: &DataLayout,
    ) -> VectorizeStats {
        if Self::verify_each_pass() {
            Self::verify_or_panic(func, "Before Vectorize");
        }
        let stats = vectorize::optimize_chunked(func, target, layout, Self::chunk());
        if Self::verify_each_pass() {
            Self::verify_or_panic(func, "After Vectorize");
        }
        stats
    }

    pub fn run_module(
        &self,
        funcs: &mut [Function],
        target: &TargetInfo,
        layout: &DataLayout,
    ) -> EngineStats {
        let mut stats = EngineStats::default();
        for func in funcs.iter_mut() {
            stats.accumulate(self.run_function(func, target, layout));
        }
        stats
    }
}
