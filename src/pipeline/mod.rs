//! Pipeline stages for requirement-driven extraction.
//!
//! Each submodule implements exactly one step, so each is testable on its
//! own. [`crate::extract::Pipeline`] wires them together.
//!
//! ## Data Flow
//!
//! ```text
//! contract + content ──▶ dispatch ──▶ sanitize ──▶ summary
//!                      (model call)  (repair +    (graph +
//!                           ▲        validate)    diagram)
//!                           └── retry ──┘
//! ```
//!
//! 1. [`dispatch`] builds the text-only or multimodal request and makes one
//!    bounded call; the only stage with network I/O
//! 2. [`retry`] wraps every model call in bounded exponential backoff
//! 3. [`sanitize`] recovers JSON from a free-text reply and validates it
//!    against the contract
//! 4. [`summary`] turns a valid extraction into a summary graph and renders
//!    it as a Mermaid diagram

pub mod dispatch;
pub mod retry;
pub mod sanitize;
pub mod summary;
