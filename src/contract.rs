//! Extraction contracts: the machine-checkable form of a user requirement.
//!
//! A contract is synthesized once per requirement (see
//! [`crate::Pipeline::synthesize_contract`]) and then shared read-only, via
//! `Arc`, by every document in the run. Its fields are private and there are
//! no setters; the only ways to obtain one are the synthesis reply parser,
//! [`ContractBuilder`], or deserialising a previously saved contract.

use crate::output::{lookup_path, IssueKind, ValidationIssue};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Value the model is told to use for fields the document does not mention.
pub const NOT_FOUND: &str = "N/A";

/// Expected JSON type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    Array,
    Object,
    #[default]
    Any,
}

impl FieldKind {
    pub fn matches(self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
            FieldKind::Any => true,
        }
    }

    /// Parse a leading type word such as `"number"` or `"list"`.
    fn from_word(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "string" | "str" | "text" => Some(FieldKind::String),
            "number" | "integer" | "int" | "float" | "double" | "numeric" => Some(FieldKind::Number),
            "boolean" | "bool" => Some(FieldKind::Boolean),
            "array" | "list" => Some(FieldKind::Array),
            "object" | "map" | "dict" => Some(FieldKind::Object),
            "any" => Some(FieldKind::Any),
            _ => None,
        }
    }

    fn of_value(value: &Value) -> Self {
        match value {
            Value::String(_) => FieldKind::String,
            Value::Number(_) => FieldKind::Number,
            Value::Bool(_) => FieldKind::Boolean,
            Value::Array(_) => FieldKind::Array,
            Value::Object(_) => FieldKind::Object,
            Value::Null => FieldKind::Any,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Array => "array",
            FieldKind::Object => "object",
            FieldKind::Any => "any",
        };
        f.write_str(s)
    }
}

/// One field of the target schema.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FieldSpec {
    pub kind: FieldKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Nested fields of an object, or the item template of an array of objects.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub children: IndexMap<String, FieldSpec>,
}

impl FieldSpec {
    pub fn new(kind: FieldKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            children: IndexMap::new(),
        }
    }

    pub fn object(description: impl Into<String>, children: IndexMap<String, FieldSpec>) -> Self {
        Self {
            kind: FieldKind::Object,
            description: description.into(),
            children,
        }
    }

    /// Infer a spec from a template value written by the model.
    ///
    /// `"number - bandgap in eV"` → Number with description, `{"type":
    /// "string", "description": ".."}` → explicit spec, `{..}` → nested
    /// object, `[{..}]` → array with an item template, other JSON values →
    /// their own type.
    fn from_template(value: &Value) -> Self {
        match value {
            Value::String(s) => Self::from_description(s),
            Value::Object(map) => {
                if let Some(explicit) = Self::explicit(map) {
                    return explicit;
                }
                let children = map
                    .iter()
                    .map(|(k, v)| (k.clone(), Self::from_template(v)))
                    .collect();
                Self::object("", children)
            }
            Value::Array(items) => {
                let children = match items.first() {
                    Some(Value::Object(map)) if Self::explicit(map).is_none() => map
                        .iter()
                        .map(|(k, v)| (k.clone(), Self::from_template(v)))
                        .collect(),
                    _ => IndexMap::new(),
                };
                Self {
                    kind: FieldKind::Array,
                    description: String::new(),
                    children,
                }
            }
            other => Self::new(FieldKind::of_value(other), ""),
        }
    }

    fn from_description(text: &str) -> Self {
        let text = text.trim();
        let (head, rest) = match text.find(|c: char| !c.is_ascii_alphabetic()) {
            Some(i) => text.split_at(i),
            None => (text, ""),
        };
        match FieldKind::from_word(head) {
            Some(kind) => {
                let description = rest
                    .trim_start_matches(|c: char| c.is_whitespace() || "-:–—,(".contains(c))
                    .trim_end_matches(')')
                    .trim();
                Self::new(kind, description)
            }
            // Descriptive text without a type word; the original template used "" for strings.
            None if text.is_empty() => Self::new(FieldKind::Any, ""),
            None => Self::new(FieldKind::Any, text),
        }
    }

    fn explicit(map: &serde_json::Map<String, Value>) -> Option<Self> {
        let kind = FieldKind::from_word(map.get("type")?.as_str()?)?;
        let allowed = ["type", "description", "unit", "example", "properties", "items"];
        if !map.keys().all(|k| allowed.contains(&k.as_str())) {
            return None;
        }
        let mut spec = Self::new(
            kind,
            map.get("description").and_then(Value::as_str).unwrap_or(""),
        );
        if let Some(Value::Object(props)) = map.get("properties").or_else(|| map.get("items")) {
            spec.children = props
                .iter()
                .map(|(k, v)| (k.clone(), Self::from_template(v)))
                .collect();
        }
        Some(spec)
    }

    /// Template value shown to the model for this field.
    pub(crate) fn template(&self) -> Value {
        match self.kind {
            FieldKind::Object if !self.children.is_empty() => Value::Object(
                self.children
                    .iter()
                    .map(|(k, v)| (k.clone(), v.template()))
                    .collect(),
            ),
            FieldKind::Array if !self.children.is_empty() => Value::Array(vec![Value::Object(
                self.children
                    .iter()
                    .map(|(k, v)| (k.clone(), v.template()))
                    .collect(),
            )]),
            _ if self.description.is_empty() => Value::String(self.kind.to_string()),
            _ => Value::String(format!("{} - {}", self.kind, self.description)),
        }
    }
}

/// Whether the document yields one record or a list of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordShape {
    /// A single JSON object.
    #[default]
    Single,
    /// A JSON array of objects, e.g. every material in a review article.
    Many,
}

/// A check run against each extracted record.
///
/// Only the first five variants are machine-checkable; `Advisory` criteria
/// are passed to the model as instructions and otherwise ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum ValidationCriterion {
    /// The field must be present and not a placeholder.
    Required { field: String },
    /// The field must not be empty (`""`, `[]`, `{}`, placeholder).
    NonEmpty { field: String },
    /// When present, the field must have this JSON type.
    Type { field: String, kind: FieldKind },
    /// When present, the field's text must match this regex.
    Pattern { field: String, pattern: String },
    /// When present, the field must equal one of these values (case-insensitive).
    OneOf { field: String, values: Vec<String> },
    /// Free-text guidance for the model.
    Advisory { text: String },
}

impl ValidationCriterion {
    /// Parse one criterion from the synthesis reply.
    ///
    /// Strings become advisory criteria. Objects need a `field` and a
    /// recognised `check`; anything else is kept as advisory text so no
    /// guidance is lost.
    fn from_reply(value: &Value) -> Option<Self> {
        let map = match value {
            Value::String(s) if s.trim().is_empty() => return None,
            Value::String(s) => return Some(Self::Advisory { text: s.trim().to_string() }),
            Value::Object(map) => map,
            _ => return None,
        };
        let text = map
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Value::Object(map.clone()).to_string());
        let advisory = || Some(Self::Advisory { text: text.clone() });

        let Some(field) = map.get("field").and_then(Value::as_str).map(str::to_string) else {
            return advisory();
        };
        let check = map.get("check").and_then(Value::as_str).unwrap_or("required");
        match check.to_ascii_lowercase().as_str() {
            "required" | "present" => Some(Self::Required { field }),
            "non_empty" | "nonempty" | "not_empty" => Some(Self::NonEmpty { field }),
            "type" => match map.get("type").and_then(Value::as_str).and_then(FieldKind::from_word) {
                Some(kind) => Some(Self::Type { field, kind }),
                None => advisory(),
            },
            "pattern" | "regex" => match map.get("pattern").and_then(Value::as_str) {
                Some(p) if Regex::new(p).is_ok() => Some(Self::Pattern {
                    field,
                    pattern: p.to_string(),
                }),
                _ => advisory(),
            },
            "one_of" | "enum" => match map.get("values").and_then(Value::as_array) {
                Some(vals) if !vals.is_empty() => Some(Self::OneOf {
                    field,
                    values: vals
                        .iter()
                        .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                        .collect(),
                }),
                _ => advisory(),
            },
            _ => advisory(),
        }
    }

    pub fn is_advisory(&self) -> bool {
        matches!(self, Self::Advisory { .. })
    }

    /// Human-readable form, used in prompts.
    pub fn describe(&self) -> String {
        match self {
            Self::Required { field } => format!("`{field}` must be present"),
            Self::NonEmpty { field } => format!("`{field}` must not be empty"),
            Self::Type { field, kind } => format!("`{field}` must be a {kind}"),
            Self::Pattern { field, pattern } => format!("`{field}` must match /{pattern}/"),
            Self::OneOf { field, values } => format!("`{field}` must be one of: {}", values.join(", ")),
            Self::Advisory { text } => text.clone(),
        }
    }

    /// Check one record. `prefix` is prepended to the reported path.
    pub fn check(&self, record: &Value, prefix: &str) -> Option<ValidationIssue> {
        let (field, verdict) = match self {
            Self::Advisory { .. } => return None,
            Self::Required { field } => (
                field,
                match lookup_path(record, field) {
                    Some(v) if !is_placeholder(v) => None,
                    _ => Some("required field is missing".to_string()),
                },
            ),
            Self::NonEmpty { field } => (
                field,
                match lookup_path(record, field) {
                    Some(v) if !is_empty_value(v) => None,
                    _ => Some("field is empty".to_string()),
                },
            ),
            Self::Type { field, kind } => (
                field,
                match lookup_path(record, field) {
                    Some(v) if !is_placeholder(v) && !kind.matches(v) => {
                        Some(format!("expected {kind}, found {}", FieldKind::of_value(v)))
                    }
                    _ => None,
                },
            ),
            Self::Pattern { field, pattern } => (
                field,
                match (lookup_path(record, field), Regex::new(pattern)) {
                    (Some(v), Ok(re)) if !is_placeholder(v) && !re.is_match(&value_text(v)) => {
                        Some(format!("value {} does not match /{pattern}/", v))
                    }
                    _ => None,
                },
            ),
            Self::OneOf { field, values } => (
                field,
                match lookup_path(record, field) {
                    Some(v) if !is_placeholder(v) => {
                        let text = value_text(v);
                        if values.iter().any(|allowed| allowed.eq_ignore_ascii_case(&text)) {
                            None
                        } else {
                            Some(format!("value {} is not one of [{}]", v, values.join(", ")))
                        }
                    }
                    _ => None,
                },
            ),
        };
        verdict.map(|message| {
            ValidationIssue::new(IssueKind::Criterion, Some(&join_path(prefix, field)), message)
        })
    }
}

/// `null`, `""` and the not-found marker mean "the document does not say".
///
/// Only the slashed `N/A` marker counts; bare `NA`/`Na` is a real value
/// (sodium, numerical aperture) in the papers this runs on.
pub fn is_placeholder(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => {
            let s = s.trim();
            s.is_empty() || s.eq_ignore_ascii_case(NOT_FOUND)
        }
        _ => false,
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        other => is_placeholder(other),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn join_path(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{prefix}.{field}")
    }
}

/// The machine-checkable extraction contract derived from a requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionContract {
    requirement: String,
    target_schema: IndexMap<String, FieldSpec>,
    extraction_instructions: String,
    #[serde(default)]
    validation_criteria: Vec<ValidationCriterion>,
    #[serde(default)]
    special_instructions: Vec<String>,
    #[serde(default)]
    record_shape: RecordShape,
}

impl ExtractionContract {
    pub fn builder(requirement: impl Into<String>) -> ContractBuilder {
        ContractBuilder {
            contract: ExtractionContract {
                requirement: requirement.into(),
                target_schema: IndexMap::new(),
                extraction_instructions: String::new(),
                validation_criteria: Vec::new(),
                special_instructions: Vec::new(),
                record_shape: RecordShape::Single,
            },
        }
    }

    /// Parse the model's contract-synthesis reply.
    ///
    /// Accepts the keys `extraction_prompt` / `extraction_instructions` /
    /// `instructions`, `target_json_structure` / `target_schema` / `schema`,
    /// `validation_criteria` and `special_instructions`. Fails with a
    /// human-readable reason when the reply is not an object or the schema is
    /// missing or empty.
    pub fn from_reply(requirement: &str, reply: &Value) -> Result<Self, String> {
        let map = reply
            .as_object()
            .ok_or_else(|| format!("expected a JSON object, found {}", FieldKind::of_value(reply)))?;

        let pick = |keys: &[&str]| keys.iter().find_map(|k| map.get(*k));

        let structure = pick(&["target_json_structure", "target_schema", "schema", "json_structure"])
            .ok_or("reply has no target_json_structure")?;
        let (record_shape, fields) = match structure {
            Value::Object(fields) => (RecordShape::Single, fields),
            Value::Array(items) => match items.first() {
                Some(Value::Object(fields)) => (RecordShape::Many, fields),
                _ => return Err("target_json_structure array has no object template".into()),
            },
            other => {
                return Err(format!(
                    "target_json_structure must be an object, found {}",
                    FieldKind::of_value(other)
                ))
            }
        };

        let target_schema: IndexMap<String, FieldSpec> = fields
            .iter()
            .filter(|(k, _)| !k.trim().is_empty())
            .map(|(k, v)| (k.clone(), FieldSpec::from_template(v)))
            .collect();
        if target_schema.is_empty() {
            return Err("target schema is empty".into());
        }

        let extraction_instructions = pick(&["extraction_prompt", "extraction_instructions", "instructions"])
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();

        let validation_criteria = pick(&["validation_criteria", "validation_rules"])
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(ValidationCriterion::from_reply).collect())
            .unwrap_or_default();

        let special_instructions = pick(&["special_instructions"])
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            requirement: requirement.to_string(),
            target_schema,
            extraction_instructions,
            validation_criteria,
            special_instructions,
            record_shape,
        })
    }

    pub fn requirement(&self) -> &str {
        &self.requirement
    }

    pub fn target_schema(&self) -> &IndexMap<String, FieldSpec> {
        &self.target_schema
    }

    pub fn extraction_instructions(&self) -> &str {
        &self.extraction_instructions
    }

    pub fn validation_criteria(&self) -> &[ValidationCriterion] {
        &self.validation_criteria
    }

    pub fn special_instructions(&self) -> &[String] {
        &self.special_instructions
    }

    pub fn record_shape(&self) -> RecordShape {
        self.record_shape
    }

    /// JSON template shown to the model: one object, or an array of one
    /// object for [`RecordShape::Many`].
    pub fn schema_template(&self) -> Value {
        let object = Value::Object(
            self.target_schema
                .iter()
                .map(|(k, v)| (k.clone(), v.template()))
                .collect(),
        );
        match self.record_shape {
            RecordShape::Single => object,
            RecordShape::Many => Value::Array(vec![object]),
        }
    }

    /// Schema and criteria checks for one record.
    ///
    /// Every issue returned here is advisory; shape failures are detected
    /// earlier by the sanitizer.
    pub fn validate_record(&self, record: &Value, prefix: &str) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        check_fields(&self.target_schema, record, prefix, &mut issues);
        issues.extend(
            self.validation_criteria
                .iter()
                .filter_map(|c| c.check(record, prefix)),
        );
        issues
    }
}

fn check_fields(
    fields: &IndexMap<String, FieldSpec>,
    record: &Value,
    prefix: &str,
    issues: &mut Vec<ValidationIssue>,
) {
    let Some(obj) = record.as_object() else {
        return;
    };
    for (name, spec) in fields {
        let path = join_path(prefix, name);
        let Some(value) = obj.get(name) else {
            issues.push(ValidationIssue::new(IssueKind::MissingField, Some(&path), "field is missing"));
            continue;
        };
        if is_placeholder(value) {
            continue;
        }
        if !spec.kind.matches(value) {
            issues.push(ValidationIssue::new(
                IssueKind::TypeMismatch,
                Some(&path),
                format!("expected {}, found {}", spec.kind, FieldKind::of_value(value)),
            ));
            continue;
        }
        if spec.children.is_empty() {
            continue;
        }
        match value {
            Value::Object(_) => check_fields(&spec.children, value, &path, issues),
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    check_fields(&spec.children, item, &join_path(&path, &i.to_string()), issues);
                }
            }
            _ => {}
        }
    }
}

/// Builder for hand-written contracts (tests, saved templates, callers that
/// already know their schema).
#[derive(Debug)]
pub struct ContractBuilder {
    contract: ExtractionContract,
}

impl ContractBuilder {
    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.contract.target_schema.insert(name.into(), spec);
        self
    }

    pub fn instructions(mut self, text: impl Into<String>) -> Self {
        self.contract.extraction_instructions = text.into();
        self
    }

    pub fn criterion(mut self, criterion: ValidationCriterion) -> Self {
        self.contract.validation_criteria.push(criterion);
        self
    }

    pub fn special_instruction(mut self, text: impl Into<String>) -> Self {
        self.contract.special_instructions.push(text.into());
        self
    }

    pub fn record_shape(mut self, shape: RecordShape) -> Self {
        self.contract.record_shape = shape;
        self
    }

    pub fn build(self) -> Result<ExtractionContract, String> {
        if self.contract.target_schema.is_empty() {
            return Err("target schema is empty".into());
        }
        Ok(self.contract)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn synthesis_reply() -> Value {
        json!({
            "extraction_prompt": "Extract the material and its bandgap.",
            "target_json_structure": {
                "material_name": "string - name of the material",
                "bandgap": "string (value with unit)",
                "measurements": [{"property": "string", "value": "number"}],
                "meta": {"year": 0, "peer_reviewed": false}
            },
            "validation_criteria": [
                "Values must come from the text",
                {"field": "material_name", "check": "required"},
                {"field": "bandgap", "check": "pattern", "pattern": "eV$"},
                {"field": "bandgap", "check": "pattern", "pattern": "(unclosed"}
            ],
            "special_instructions": ["Use N/A for missing values", ""]
        })
    }

    #[test]
    fn parses_synthesis_reply() {
        let c = ExtractionContract::from_reply("material and bandgap", &synthesis_reply()).unwrap();
        let keys: Vec<&str> = c.target_schema().keys().map(String::as_str).collect();
        assert_eq!(keys, ["material_name", "bandgap", "measurements", "meta"]);
        assert_eq!(c.target_schema()["material_name"].kind, FieldKind::String);
        assert_eq!(c.target_schema()["material_name"].description, "name of the material");
        assert_eq!(c.target_schema()["bandgap"].description, "value with unit");
        assert_eq!(c.target_schema()["measurements"].kind, FieldKind::Array);
        assert_eq!(c.target_schema()["measurements"].children["value"].kind, FieldKind::Number);
        assert_eq!(c.target_schema()["meta"].children["peer_reviewed"].kind, FieldKind::Boolean);
        assert_eq!(c.record_shape(), RecordShape::Single);
        assert_eq!(c.special_instructions(), ["Use N/A for missing values"]);

        let criteria = c.validation_criteria();
        assert_eq!(criteria.len(), 4);
        assert!(criteria[0].is_advisory());
        assert_eq!(criteria[1], ValidationCriterion::Required { field: "material_name".into() });
        assert!(matches!(criteria[2], ValidationCriterion::Pattern { .. }));
        // an invalid regex is kept as guidance only
        assert!(criteria[3].is_advisory());
    }

    #[test]
    fn array_structure_means_many_records() {
        let reply = json!({"target_json_structure": [{"name": "string"}]});
        let c = ExtractionContract::from_reply("all materials", &reply).unwrap();
        assert_eq!(c.record_shape(), RecordShape::Many);
        assert!(c.schema_template().is_array());
    }

    #[test]
    fn empty_or_missing_schema_is_rejected() {
        assert!(ExtractionContract::from_reply("x", &json!({"target_json_structure": {}})).is_err());
        assert!(ExtractionContract::from_reply("x", &json!({"extraction_prompt": "hi"})).is_err());
        assert!(ExtractionContract::from_reply("x", &json!(["not", "an", "object"])).is_err());
    }

    #[test]
    fn explicit_type_objects() {
        let reply = json!({"target_json_structure": {
            "a": {"type": "number", "description": "count"},
            "b": {"type": "string", "nested": 1}
        }});
        let c = ExtractionContract::from_reply("x", &reply).unwrap();
        assert_eq!(c.target_schema()["a"], FieldSpec::new(FieldKind::Number, "count"));
        // unknown keys mean this is a nested object template, not a type spec
        assert_eq!(c.target_schema()["b"].kind, FieldKind::Object);
    }

    #[test]
    fn validate_record_reports_missing_and_mismatched() {
        let c = ExtractionContract::from_reply("x", &synthesis_reply()).unwrap();
        let record = json!({
            "material_name": "ZnO",
            "bandgap": "3.37 eV",
            "measurements": [{"property": "gap", "value": "high"}],
        });
        let issues = c.validate_record(&record, "");
        assert!(issues.iter().any(|i| i.kind == IssueKind::MissingField && i.path.as_deref() == Some("meta")));
        assert!(issues
            .iter()
            .any(|i| i.kind == IssueKind::TypeMismatch && i.path.as_deref() == Some("measurements.0.value")));
        assert!(!issues.iter().any(|i| i.kind == IssueKind::Criterion));
    }

    #[test]
    fn placeholders_are_not_type_mismatches() {
        let c = ExtractionContract::builder("x")
            .field("gap", FieldSpec::new(FieldKind::Number, ""))
            .criterion(ValidationCriterion::Required { field: "gap".into() })
            .build()
            .unwrap();
        let issues = c.validate_record(&json!({"gap": "N/A"}), "");
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::Criterion);
    }

    #[test]
    fn element_symbols_are_not_placeholders() {
        let c = ExtractionContract::builder("x")
            .field("element", FieldSpec::new(FieldKind::String, "chemical symbol"))
            .criterion(ValidationCriterion::Required { field: "element".into() })
            .build()
            .unwrap();
        for symbol in ["Na", "NA", "na"] {
            let issues = c.validate_record(&json!({ "element": symbol }), "");
            assert!(issues.is_empty(), "{symbol}: {issues:?}");
        }
        assert!(is_placeholder(&json!("n/a")));
        assert!(!is_placeholder(&json!("Na")));
    }

    #[test]
    fn criteria_checks() {
        let rec = json!({"phase": "Wurtzite", "gap": "3.37 eV", "tags": []});
        let one_of = ValidationCriterion::OneOf {
            field: "phase".into(),
            values: vec!["wurtzite".into(), "zincblende".into()],
        };
        assert!(one_of.check(&rec, "").is_none());
        let pattern = ValidationCriterion::Pattern { field: "gap".into(), pattern: r"^\d+(\.\d+)? eV$".into() };
        assert!(pattern.check(&rec, "").is_none());
        let non_empty = ValidationCriterion::NonEmpty { field: "tags".into() };
        let issue = non_empty.check(&rec, "2").expect("empty array");
        assert_eq!(issue.path.as_deref(), Some("2.tags"));
        let ty = ValidationCriterion::Type { field: "gap".into(), kind: FieldKind::Number };
        assert!(ty.check(&rec, "").is_some());
    }

    #[test]
    fn builder_requires_fields() {
        assert!(ExtractionContract::builder("x").build().is_err());
    }

    #[test]
    fn contract_round_trips_through_json() {
        let c = ExtractionContract::from_reply("x", &synthesis_reply()).unwrap();
        let text = serde_json::to_string(&c).unwrap();
        let back: ExtractionContract = serde_json::from_str(&text).unwrap();
        assert_eq!(back, c);
    }
}
