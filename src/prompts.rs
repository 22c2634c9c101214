//! Prompts for contract synthesis, extraction, and summary graphs.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth**: changing how the model is instructed
//!    requires editing exactly one place.
//!
//! 2. **Testability**: unit tests can inspect the prompts directly without
//!    a live model, making prompt regressions easy to catch.
//!
//! Callers can override the extraction system prompt via
//! [`crate::config::PipelineConfig::system_prompt`]; the constants here are
//! used only when no override is provided.

use crate::contract::{ExtractionContract, RecordShape, NOT_FOUND};
use crate::document::DocumentContent;
use serde_json::Value;

/// System prompt for turning a requirement into an extraction contract.
pub const CONTRACT_SYSTEM_PROMPT: &str = r#"You are an expert prompt engineer who designs information-extraction templates for academic literature.

Given a user's requirement, you produce a JSON template that another model will follow to extract exactly that information from a paper.

Rules:
1. The JSON structure must contain every field the user cares about, and nothing unrelated.
2. Write each field's value as its type followed by a short description, e.g. "number - bandgap in eV" or "string - synthesis method".
3. Use nested objects for grouped fields and a one-element array holding an object template for repeated records.
4. If a single paper may describe many items (e.g. a review covering many materials), make target_json_structure an ARRAY holding one object template.
5. Account for different kinds of papers (research articles, reviews).
6. Output ONLY the JSON object, with no commentary and no code fences."#;

/// Default system prompt for per-document extraction.
pub const DEFAULT_EXTRACTION_SYSTEM_PROMPT: &str = r#"You are a meticulous research assistant who extracts structured data from academic papers.

Follow these rules precisely:

1. ACCURACY
   - Report only what the paper states; never guess or invent values
   - Keep units and significant figures exactly as written

2. COMPLETENESS
   - Fill every field of the target structure
   - Use "N/A" for any field the paper does not mention

3. FIGURES
   - When images are attached, read values from figures and tables as well as the text

4. OUTPUT FORMAT
   - Output ONLY the JSON value matching the target structure
   - Do NOT wrap it in code fences
   - Do NOT add commentary or explanations"#;

/// System prompt for summary-graph generation.
pub const SUMMARY_SYSTEM_PROMPT: &str = r#"You summarise structured research data as a concise hierarchy for a diagram.

Output ONLY a JSON object of the form:
{"label": "central topic", "children": [{"label": "branch", "children": [{"label": "detail"}]}]}

Rules:
- The root label is the paper's title or main subject
- Use 3 to 7 branches (e.g. materials, methods, key findings, applications)
- Keep every label short: a few words or a single value with its unit
- At most 4 levels deep
- Do NOT wrap the JSON in code fences"#;

/// Build the user turn for contract synthesis.
///
/// `feedback` refines an earlier contract; `previous_error` explains why the
/// last reply was unusable so the model can correct it.
pub fn contract_prompt(requirement: &str, feedback: Option<&str>, previous_error: Option<&str>) -> String {
    let mut prompt = format!(
        r#"User requirement:
"""{requirement}"""

Produce a template in exactly this format:
{{
  "extraction_prompt": "detailed extraction instructions ...",
  "target_json_structure": {{ "field_name": "type - description" }},
  "validation_criteria": [
    "free-text rule",
    {{"field": "field_name", "check": "required"}},
    {{"field": "field_name", "check": "type", "type": "number"}},
    {{"field": "field_name", "check": "pattern", "pattern": "regex"}},
    {{"field": "field_name", "check": "one_of", "values": ["a", "b"]}}
  ],
  "special_instructions": ["instruction", "..."]
}}

Supported checks are required, non_empty, type, pattern and one_of; field paths may be dotted (e.g. "synthesis.method")."#
    );
    if let Some(feedback) = feedback.map(str::trim).filter(|f| !f.is_empty()) {
        prompt.push_str(&format!(
            "\n\nRevise the template according to this feedback:\n\"\"\"{feedback}\"\"\""
        ));
    }
    if let Some(err) = previous_error {
        prompt.push_str(&format!(
            "\n\nYour previous reply could not be used ({err}). Return a single valid JSON object in the format above."
        ));
    }
    prompt
}

/// Build the user turn for extracting one document under a contract.
pub fn extraction_prompt(contract: &ExtractionContract, content: &DocumentContent) -> String {
    let template = serde_json::to_string_pretty(&contract.schema_template())
        .unwrap_or_else(|_| contract.schema_template().to_string());

    let mut prompt = String::new();
    if !contract.extraction_instructions().is_empty() {
        prompt.push_str(contract.extraction_instructions());
        prompt.push_str("\n\n");
    }
    prompt.push_str("Target JSON structure:\n");
    prompt.push_str(&template);
    prompt.push('\n');

    let rules: Vec<String> = contract
        .validation_criteria()
        .iter()
        .map(|c| c.describe())
        .chain(contract.special_instructions().iter().cloned())
        .collect();
    if !rules.is_empty() {
        prompt.push_str("\nRequirements:\n");
        for rule in rules {
            prompt.push_str(&format!("- {rule}\n"));
        }
    }

    if !content.images().is_empty() {
        prompt.push_str(&format!(
            "\n{} figure image(s) from the paper are attached in document order.\n",
            content.images().len()
        ));
    }

    prompt.push_str(&format!("\nPaper content:\n\"\"\"{}\"\"\"\n\n", content.text()));
    let shape = match contract.record_shape() {
        RecordShape::Single => "a single JSON object",
        RecordShape::Many => "a JSON array with one object per item",
    };
    prompt.push_str(&format!(
        "Extract the information strictly following the structure above and return {shape}. \
         If a field is not mentioned in the paper, use \"{NOT_FOUND}\" as its value. \
         Return only JSON, without any explanation."
    ));
    prompt
}

/// Build the user turn for summarising one extraction.
pub fn summary_prompt(data: &Value, source_id: &str) -> String {
    let data = serde_json::to_string_pretty(data).unwrap_or_else(|_| data.to_string());
    format!(
        "Summarise the information extracted from document \"{source_id}\" as a hierarchy.\n\n\
         Extracted data:\n{data}\n\n\
         Return only the JSON hierarchy."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{FieldKind, FieldSpec, ValidationCriterion};
    use crate::document::{assemble, RawDocument};
    use serde_json::json;

    fn contract() -> ExtractionContract {
        ExtractionContract::builder("material and bandgap")
            .instructions("Extract the material and its bandgap.")
            .field("material_name", FieldSpec::new(FieldKind::String, "name"))
            .field("bandgap", FieldSpec::new(FieldKind::String, "with unit"))
            .criterion(ValidationCriterion::Required { field: "material_name".into() })
            .special_instruction("Prefer experimental values")
            .build()
            .unwrap()
    }

    #[test]
    fn contract_prompt_embeds_requirement_and_feedback() {
        let p = contract_prompt("bandgap values", Some("add synthesis method"), None);
        assert!(p.contains("bandgap values"));
        assert!(p.contains("add synthesis method"));
        assert!(p.contains("target_json_structure"));
        assert!(!p.contains("previous reply"));

        let retry = contract_prompt("x", None, Some("reply was not JSON"));
        assert!(retry.contains("reply was not JSON"));
    }

    #[test]
    fn extraction_prompt_contains_schema_rules_and_text() {
        let content = assemble(RawDocument::new("d", "ZnO has a bandgap of 3.37 eV."), 5, None);
        let p = extraction_prompt(&contract(), &content);
        assert!(p.starts_with("Extract the material"));
        assert!(p.contains("\"material_name\": \"string - name\""));
        assert!(p.contains("`material_name` must be present"));
        assert!(p.contains("Prefer experimental values"));
        assert!(p.contains("3.37 eV"));
        assert!(p.contains("\"N/A\""));
        assert!(p.contains("a single JSON object"));
        assert!(!p.contains("image(s)"));
    }

    #[test]
    fn summary_prompt_embeds_data() {
        let p = summary_prompt(&json!({"material_name": "ZnO"}), "paper-1");
        assert!(p.contains("paper-1"));
        assert!(p.contains("ZnO"));
    }

    #[test]
    fn system_prompts_demand_bare_json() {
        for p in [CONTRACT_SYSTEM_PROMPT, DEFAULT_EXTRACTION_SYSTEM_PROMPT, SUMMARY_SYSTEM_PROMPT] {
            assert!(p.contains("JSON"));
            assert!(p.contains("code fences"));
        }
    }
}
