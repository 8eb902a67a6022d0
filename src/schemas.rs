//! Structured-output payloads exchanged with the LLM.
//!
//! Each struct doubles as a JSON Schema (via schemars) sent with the
//! request and as the deserialisation target for the response. Doc
//! comments become field descriptions in the schema, so they are written
//! as instructions to the model.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Classifier output for a user turn: does this need the agent stack?
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RequireAgent {
    /// True if answering requires running a calculation over data.
    #[serde(default)]
    pub calculation_required: bool,

    /// True if answering requires searching the web.
    #[serde(default)]
    pub web_search_required: bool,

    /// Is this a complex question that requires multiple steps to answer?
    #[serde(default)]
    pub complex_question: bool,

    /// If any flag above is true, summarise the conversation into a
    /// context-rich request for the downstream agent. Otherwise leave
    /// this field empty.
    #[serde(default)]
    pub context_rich_agent_request: String,
}

impl RequireAgent {
    /// Any classifier flag set means the complex path is taken.
    pub fn agent_required(&self) -> bool {
        self.calculation_required || self.web_search_required || self.complex_question
    }
}

/// What an image element is, for instruction selection and tool choice.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ImageElementType {
    Chart,
    Table,
    Diagram,
    Text,
    Other,
}

impl ImageElementType {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageElementType::Chart => "chart",
            ImageElementType::Table => "table",
            ImageElementType::Diagram => "diagram",
            ImageElementType::Text => "text",
            ImageElementType::Other => "other",
        }
    }
}

impl std::fmt::Display for ImageElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One element identified inside an input image.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ImageElement {
    /// A short description of the image element, e.g. 'a chart showing
    /// the sales data for 2023'. If the image carries chart/table titles
    /// or captions, use those.
    pub element_desc: String,

    /// The location of the element within the image, e.g. 'top right
    /// corner'.
    #[serde(default)]
    pub element_location: String,

    /// Use chart for any form of chart or graph; table for tabular
    /// information; diagram for flow charts, network relationships, or
    /// similar linked-shape drawings with text annotations; text for a
    /// body of text (light annotations inside charts or tables do not
    /// count); other for everything else, such as photographs.
    pub element_type: ImageElementType,

    /// Is the element required to address the user question?
    #[serde(default)]
    pub required: bool,
}

/// Content breakdown of one input image.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ImageBreakdown {
    /// True when the image content cannot be extracted, e.g. low
    /// resolution or blurry.
    #[serde(default)]
    pub unreadable: bool,

    /// Why the image is unreadable; leave blank when it is readable.
    #[serde(default)]
    pub image_quality: String,

    #[serde(default)]
    pub elements: Vec<ImageElement>,
}

/// How uploaded files should be grouped into planner runs.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FileGrouping {
    /// Groups of file paths processed one by one. Default to a single
    /// group with all files; split per file only when the user clearly
    /// wants one response per file. A file may repeat across groups when
    /// the user instructs it to be reused.
    pub file_groups: Vec<Vec<String>>,
}

/// A task generated from the plan's next todo item.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct TaskSpec {
    /// Image keys identifying images relevant to the task.
    #[serde(default)]
    pub image_keys: Vec<String>,

    /// Variable keys identifying variables relevant to the task.
    #[serde(default)]
    pub variable_keys: Vec<String>,

    /// Any relevant context that will help in performing the task; the
    /// more information the better. If past tasks have been performed,
    /// extract all relevant information into the context. The context
    /// must be independently sufficient to verify all acceptance
    /// criteria without any further information.
    #[serde(default)]
    pub context: String,

    /// All outputs from previous tasks required to perform this task,
    /// including a description of what they are. Structured outputs
    /// such as JSON or Mermaid from previous tasks must be restated in
    /// full with no alteration.
    #[serde(default)]
    pub previous_outputs: String,

    /// The original user request this task contributes to answering.
    pub user_request: String,

    /// A detailed description of the action to perform.
    pub task_description: String,

    /// Task-level criteria that must hold for the task to count as
    /// successful. Never ask for anything to be saved to file; images
    /// must be produced as output variables.
    pub acceptance_criteria: Vec<String>,

    /// True only when data tables exist AND the task requires querying
    /// one of them.
    #[serde(default)]
    pub querying_structured_data: bool,

    /// Names of tools required to perform the task; empty if none.
    #[serde(default)]
    pub tools: Vec<String>,
}

/// The task persisted as `current_task.json`: a fresh opaque id plus the
/// generated spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentTask {
    pub task_id: String,
    #[serde(flatten)]
    pub spec: TaskSpec,
}

/// One declared code output.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OutputVariable {
    /// The variable name as it appears in the code.
    pub name: String,

    /// True when the runtime value is an image (or a list or map of
    /// images) rather than printable data.
    #[serde(default)]
    pub is_image: bool,
}

/// One standard-worker attempt: either a direct result or python code.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct TaskArtefact {
    /// Leave blank when there are no failures; otherwise summarise why
    /// the previous run(s) failed.
    #[serde(default)]
    pub summary_of_previous_failures: String,

    /// Think step by step about what needs to be done. If a previous
    /// attempt failed validation, state exactly what to adjust and why
    /// the adjustment will work.
    #[serde(default)]
    pub thought: String,

    /// The successful outcome when the task completes without code.
    /// Leave empty when code must run to produce the result.
    #[serde(default)]
    pub result: String,

    /// Executable python code, with the result stored in a variable and
    /// printed. Use supplied functions where possible; never recreate
    /// them. Leave empty if no code is required.
    #[serde(default)]
    pub python_code: String,

    /// Output variable names future tasks need direct access to.
    /// Printed values don't need to be outputs; images always do.
    #[serde(default)]
    pub output_variables: Vec<OutputVariable>,

    /// True when the code mutates databases, writes executables, or
    /// otherwise acts outside the task's data scope.
    #[serde(default)]
    pub is_malicious: bool,
}

/// One SQL-worker attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct TaskArtefactSql {
    /// Leave blank when there are no failures; otherwise summarise why
    /// the previous run(s) failed.
    #[serde(default)]
    pub summary_of_previous_failures: String,

    /// Think step by step. If the context lacks what the query needs,
    /// generate no code and explain why instead.
    #[serde(default)]
    pub thought: String,

    /// An executable SQL query over the available tables. Never invent
    /// table names, column names, or column values; prefer aggregation
    /// over printing many raw rows. Leave blank if the context is
    /// insufficient.
    #[serde(default)]
    pub sql_code: String,

    /// If no SQL could be generated, explain why.
    #[serde(default)]
    pub reason_code_not_created: String,
}

/// The rendered outcome of a validated task.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct TaskResult {
    /// A detailed summary of all actions taken and critical outcomes.
    /// If the task was accepted purely because of inconclusive repeated
    /// failure, state that explicitly.
    #[serde(default)]
    pub result: String,

    /// Every output with its actual content. Images are the exception:
    /// name and describe the output image variable instead of restating
    /// its encoding.
    #[serde(default)]
    pub output: String,
}

impl TaskResult {
    /// The string form recorded on the worker row.
    pub fn render(&self) -> String {
        format!("# Task result\n{}\n\n# Task output\n{}", self.result, self.output)
    }
}

/// Acceptance-criteria verdict for one worker attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct TaskValidation {
    /// Description of the most recent failure, if any.
    #[serde(default)]
    pub most_recent_failure: String,

    /// The failure before the last, when at least two exist.
    #[serde(default)]
    pub second_most_recent_failure: String,

    /// The failure before the second last, when at least three exist.
    #[serde(default)]
    pub third_most_recent_failure: String,

    /// True only when there are at least three failures and they are
    /// identical.
    #[serde(default)]
    pub three_identical_failures: bool,

    /// True when all acceptance criteria are met, or immediately when
    /// three_identical_failures is true (to avoid endless retries).
    #[serde(default)]
    pub task_completed: bool,

    /// The task result when completed; blank otherwise. If completion is
    /// due to repeated failure, say so in the result.
    #[serde(default)]
    pub validated_result: TaskResult,

    /// Which criteria failed and why; empty when all are met.
    #[serde(default)]
    pub failed_criteria: String,
}

/// Does a sandbox error mean a required tool was never supplied?
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ToolMissing {
    /// True if the error indicates a tool or function is not available.
    #[serde(default)]
    pub tool_not_available: bool,
}

/// Has the worker hit the same wall three times in a row?
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RepeatFail {
    /// True only after seeing the exact same error at least three times
    /// in a row. Different code failing with different errors does not
    /// count.
    #[serde(default)]
    pub repeated_failure: bool,

    /// When repeated_failure is true, a non-technical summary of what
    /// keeps failing.
    #[serde(default)]
    pub failure_summary: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_task_flattens_the_spec() {
        let task = CurrentTask {
            task_id: "abc123".to_string(),
            spec: TaskSpec {
                user_request: "total revenue".to_string(),
                task_description: "Sum the revenue column".to_string(),
                acceptance_criteria: vec!["one number".to_string()],
                querying_structured_data: true,
                ..Default::default()
            },
        };

        let json = serde_json::to_value(&task).expect("serialise");
        assert_eq!(json["task_id"], "abc123");
        assert_eq!(json["task_description"], "Sum the revenue column");

        let back: CurrentTask = serde_json::from_value(json).expect("deserialise");
        assert_eq!(back.spec.acceptance_criteria.len(), 1);
    }

    #[test]
    fn task_result_render_shape() {
        let result = TaskResult {
            result: "Summed revenue.".to_string(),
            output: "42".to_string(),
        };
        assert_eq!(
            result.render(),
            "# Task result\nSummed revenue.\n\n# Task output\n42"
        );
    }

    #[test]
    fn lenient_defaults_tolerate_sparse_llm_output() {
        let artefact: TaskArtefact =
            serde_json::from_str(r#"{"thought": "just answer", "result": "done"}"#)
                .expect("deserialise");
        assert!(artefact.python_code.is_empty());
        assert!(!artefact.is_malicious);
        assert!(artefact.output_variables.is_empty());
    }

    #[test]
    fn image_breakdown_parses_element_types() {
        let breakdown: ImageBreakdown = serde_json::from_str(
            r#"{"elements": [
                {"element_desc": "sales by region chart", "element_type": "chart"},
                {"element_desc": "footnotes", "element_type": "text", "required": true}
            ]}"#,
        )
        .expect("deserialise");

        assert!(!breakdown.unreadable);
        assert_eq!(breakdown.elements[0].element_type, ImageElementType::Chart);
        assert_eq!(breakdown.elements[0].element_type.as_str(), "chart");
        assert!(breakdown.elements[1].required);
    }
}
