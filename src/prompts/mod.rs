//! Prompt module for LLM-based operations.
//!
//! This module provides the built-in persona texts and the completion template
//! every stage is sent through.

pub mod personas;
pub mod template;

pub use personas::*;
pub use template::*;
