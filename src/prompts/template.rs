//! Completion prompt template.
//!
//! Every stage sends the persona text followed directly by its context,
//! wrapped in a fixed question/answer frame.

/// Prompt template for a single completion
/// Placeholder: {question}
pub const QUESTION_TEMPLATE: &str = "Question: {question}\n\nAnswer:";

/// Build the completion prompt from a persona and the accumulated context
pub fn build_question_prompt(persona: &str, context: &str) -> String {
    let combined = format!("{}{}", persona, context);
    QUESTION_TEMPLATE.replace("{question}", &combined)
}
