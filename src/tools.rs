//! Tool registry: the catalogue of functions workers may call.
//!
//! Tools are opaque to the core. The registry only carries names and
//! docstrings: the docstrings are rendered into planner and worker
//! prompts, and the names are handed to the sandbox, which binds the
//! actual implementations on its side of the process boundary.

use std::sync::Arc;

/// One registered tool.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub docstring: &'static str,
}

/// Fixed tool catalogue, populated at process start.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<ToolSpec>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<ToolSpec>) -> Arc<Self> {
        Arc::new(Self { tools })
    }

    /// The standard catalogue.
    pub fn standard() -> Arc<Self> {
        Self::new(vec![
            ToolSpec {
                name: "get_chart_readings_from_image",
                docstring: "get_chart_readings_from_image(image) -> str\n\
                    Extract the readings of a chart image as structured text. \
                    Returns series names, axis labels, and the data points read \
                    off the chart.",
            },
            ToolSpec {
                name: "get_text_and_table_json_from_image",
                docstring: "get_text_and_table_json_from_image(image) -> str\n\
                    Read the text body and any tabular content of an image and \
                    return them as a JSON string.",
            },
            ToolSpec {
                name: "get_facts_from_pdf",
                docstring: "get_facts_from_pdf(filepath, questions) -> str\n\
                    Extract relevant facts from a PDF document as question and \
                    answer pairs targeted at the supplied questions.",
            },
            ToolSpec {
                name: "search_web_general",
                docstring: "search_web_general(query) -> str\n\
                    Search the web and return a digest of relevant results with \
                    source URLs for citation.",
            },
        ])
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|tool| tool.name).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.iter().any(|tool| tool.name == name)
    }

    pub fn docstring(&self, name: &str) -> Option<&'static str> {
        self.tools
            .iter()
            .find(|tool| tool.name == name)
            .map(|tool| tool.docstring)
    }

    /// The full catalogue rendered for planner prompts.
    pub fn catalogue_markdown(&self) -> String {
        self.tools
            .iter()
            .map(|tool| format!("# {}\n{}", tool.name, tool.docstring))
            .collect::<Vec<_>>()
            .join("\n\n---\n\n")
    }

    /// A subset catalogue rendered for worker prompts. Unknown names are
    /// skipped.
    pub fn subset_markdown(&self, names: &[String]) -> String {
        names
            .iter()
            .filter_map(|name| {
                self.docstring(name)
                    .map(|doc| format!("# {name}\n{doc}"))
            })
            .collect::<Vec<_>>()
            .join("\n\n---\n\n")
    }
}
