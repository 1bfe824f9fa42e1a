// SPDX-License-Identifier: PMPL-1.0-or-later

//! Revenant: recurring-vulnerability clone detection for C/C++ code bases.
//!
//! Given a corpus of known vulnerable/patched function pairs (one pair per
//! CVE) and a target project, Revenant reports the target functions that are
//! clones of a vulnerable function and never received the corresponding
//! patch. Candidate functions are pushed through a cascade of progressively
//! more expensive similarity tests:
//!
//! 1. **Features**: a shuffle-and-feature-dropout Bloom structure over
//!    one-hot code fingerprints prunes the bulk of the project.
//! 2. **Token**: multiset Jaccard over token bags, with a length-bucket
//!    index so only plausibly-sized bags are compared.
//! 3. **Syntax**: patch-diff line hashes plus AST-node Jaccard separate
//!    still-vulnerable clones from already-patched ones.
//! 4. **Trace**: an opaque confirmation stage (taint flow + embeddings via
//!    external tooling) behind the [`trace::TraceStage`] seam.
//!
//! Stages run concurrently over bounded queues; a full queue is the only
//! throttle.

pub mod config;
pub mod dataset;
pub mod features;
pub mod pipeline;
pub mod purify;
pub mod sim;
pub mod store;
pub mod syntax;
pub mod token;
pub mod trace;
pub mod types;
