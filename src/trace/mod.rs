// SPDX-License-Identifier: PMPL-1.0-or-later

//! Stage 4 seam: final confirmation of the low-confidence survivors.
//!
//! The real implementation drives heavy external tooling (a code property
//! graph extractor and a learned code embedder); the orchestrator treats it
//! as opaque and assumes it is the slowest stage. [`PassThroughTrace`]
//! confirms every candidate and keeps the pipeline complete when that
//! tooling is not deployed.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Contract of the final stage: consume one `(code, path, candidates)`
/// record, emit the confirmed subset. Implementations may block for seconds
/// per call and may impose their own timeouts on external tools.
pub trait TraceStage: Send + Sync {
    fn confirm(&self, code: &str, path: &str, candidates: &[String]) -> Result<Vec<String>>;
}

/// Locations and endpoints handed to trace implementations untouched.
#[derive(Debug, Clone, Default)]
pub struct TraceTooling {
    pub codebert_model_path: PathBuf,
    pub joern_path: PathBuf,
    pub redis_host: String,
    pub redis_port: u16,
}

/// Default stage-4 implementation: every surviving candidate is confirmed.
pub struct PassThroughTrace;

impl TraceStage for PassThroughTrace {
    fn confirm(&self, _code: &str, _path: &str, candidates: &[String]) -> Result<Vec<String>> {
        Ok(candidates.to_vec())
    }
}

/// Build the configured trace stage. External tooling integration plugs in
/// here; until then every run falls back to the pass-through confirmation.
pub fn build_stage(tooling: &TraceTooling) -> Arc<dyn TraceStage> {
    debug!(
        "trace tooling: joern at {}, codebert at {}, side-store endpoint {}:{}",
        tooling.joern_path.display(),
        tooling.codebert_model_path.display(),
        tooling.redis_host,
        tooling.redis_port
    );
    Arc::new(PassThroughTrace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_through_confirms_everything() {
        let stage = PassThroughTrace;
        let candidates = vec!["a.vul".to_string(), "b.vul".to_string()];
        let confirmed = stage.confirm("int f() {}", "t.c", &candidates).unwrap();
        assert_eq!(confirmed, candidates);
    }

    #[test]
    fn pass_through_keeps_empty_empty() {
        let stage = PassThroughTrace;
        assert!(stage.confirm("int f() {}", "t.c", &[]).unwrap().is_empty());
    }
}
