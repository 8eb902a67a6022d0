//! Input file classification and the instruction library.

use crate::schemas::ImageElementType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// What a classified input file is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileKind {
    /// Tabular data, loadable into the planner's SQL engine.
    Csv,
    /// A PDF document, opened by workers through tools.
    Pdf,
    /// A plain-text document with the detected encoding.
    Text { encoding: String },
    /// A raster image. The subtypes come from the content breakdown
    /// pass (empty until it has run) and key the instruction library.
    Image { subtypes: Vec<ImageElementType> },
}

/// A classified input file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputFile {
    pub path: PathBuf,
    pub kind: FileKind,
}

impl InputFile {
    /// The file stem used for table and image naming.
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Classification outcome for one user turn's files.
#[derive(Debug, Default)]
pub struct ClassifiedFiles {
    pub files: Vec<InputFile>,
    pub errors: Vec<String>,
}

/// Classify each path: CSV by read probe, PDF by extension, image by
/// signature, text by encoding probe; everything else is rejected.
/// Image subtypes are filled in later by the content breakdown pass.
pub fn classify_files(paths: &[String]) -> ClassifiedFiles {
    let mut result = ClassifiedFiles::default();

    for raw_path in paths {
        let path = Path::new(raw_path);
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| raw_path.clone());

        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        if extension == "csv" {
            match probe_csv(path) {
                Ok(()) => {
                    result.files.push(InputFile {
                        path: path.to_path_buf(),
                        kind: FileKind::Csv,
                    });
                }
                Err(error) => {
                    let message: String = error.chars().take(250).collect();
                    result.errors.push(format!(
                        "The CSV file `{name}` cannot be processed due to format issues. Error: {message}"
                    ));
                }
            }
            continue;
        }

        if extension == "pdf" {
            result.files.push(InputFile {
                path: path.to_path_buf(),
                kind: FileKind::Pdf,
            });
            continue;
        }

        let Ok(bytes) = std::fs::read(path) else {
            result.errors.push(format!("File `{name}` cannot be read"));
            continue;
        };

        if is_image(&bytes) {
            result.files.push(InputFile {
                path: path.to_path_buf(),
                kind: FileKind::Image {
                    subtypes: Vec::new(),
                },
            });
            continue;
        }

        if let Some(encoding) = detect_text_encoding(&bytes) {
            result.files.push(InputFile {
                path: path.to_path_buf(),
                kind: FileKind::Text {
                    encoding: encoding.to_string(),
                },
            });
            continue;
        }

        result.errors.push(format!(
            "Unsupported file type `.{extension}` for file `{name}`"
        ));
    }

    result
}

/// Verify a CSV is readable: headers parse and the first rows scan.
pub fn probe_csv(path: &Path) -> std::result::Result<(), String> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|error| error.to_string())?;

    reader.headers().map_err(|error| error.to_string())?;
    for record in reader.records().take(100_000) {
        record.map_err(|error| error.to_string())?;
    }
    Ok(())
}

/// Image signature sniffing (PNG, JPEG, GIF, BMP, WEBP).
fn is_image(bytes: &[u8]) -> bool {
    bytes.starts_with(&[0x89, b'P', b'N', b'G'])
        || bytes.starts_with(&[0xFF, 0xD8, 0xFF])
        || bytes.starts_with(b"GIF87a")
        || bytes.starts_with(b"GIF89a")
        || bytes.starts_with(b"BM")
        || (bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP")
}

/// Probe the encodings the system accepts for text documents.
fn detect_text_encoding(bytes: &[u8]) -> Option<&'static str> {
    if std::str::from_utf8(bytes).is_ok() {
        return Some("utf-8");
    }
    if bytes.starts_with(&[0xFF, 0xFE]) || bytes.starts_with(&[0xFE, 0xFF]) {
        return Some("utf-16");
    }
    None
}

/// Handling guidance keyed on `(file_category, subtype)`.
pub fn instruction_for(category: &str, subtype: &str) -> Option<&'static str> {
    match (category, subtype) {
        ("data", "csv") => Some(
            "When querying a data file such as csv, you must do so via SQL query. \
             If required, create intermediate queries such as those that give you precise \
             values in a field to apply an accurate filter on. \
             You must not ever make up table names, column names, or values in tables. \
             If you don't know, use intermediate queries to get the information you need.",
        ),
        ("image", "chart") => Some(
            "You must use the provided tool get_chart_readings_from_image to extract the \
             chart readings as text first before performing further actions. \
             This must be a standalone task.",
        ),
        ("image", "table") => Some(
            "You must use the provided tool get_text_and_table_json_from_image, read the \
             table contents as a JSON string first before performing further actions. \
             This must be a standalone task.",
        ),
        ("image", "diagram") => Some(
            "You must convert the diagram into mermaid code first before performing \
             further actions.",
        ),
        ("image", "text") => Some(
            "You must use the provided tool get_text_and_table_json_from_image, read the \
             text content as a JSON string first before performing further actions. \
             This must be a standalone task.",
        ),
        ("document", "pdf") => Some(
            "You must first use the provided tool get_facts_from_pdf to extract relevant \
             facts in the form of question answer pairs from each document until there are \
             no longer any unanswered questions. Extracting from each file must be a \
             standalone task.\n\
             When compiling the final response, you must aggressively use in-line citations, \
             and your answer should be in markdown format. \
             If the document(s) do not contain all necessary information, you can use the \
             search_web_general tool to search the web.",
        ),
        ("non_file", "web_search") => Some(
            "You must use the search_web_general tool to search the web for information \
             that can answer the user's question.",
        ),
        _ => None,
    }
}

/// Compose the instruction blocks for one group of classified files:
/// one block per distinct `(category, subtype)` pair seen, images first,
/// then data, then documents.
pub fn instructions_for_files(files: &[InputFile]) -> Vec<String> {
    let mut image_subtypes: BTreeSet<&'static str> = BTreeSet::new();
    let mut data_subtypes: BTreeSet<&'static str> = BTreeSet::new();
    let mut document_subtypes: BTreeSet<&'static str> = BTreeSet::new();

    for file in files {
        match &file.kind {
            FileKind::Csv => {
                data_subtypes.insert("csv");
            }
            FileKind::Pdf => {
                document_subtypes.insert("pdf");
            }
            FileKind::Text { .. } => {
                document_subtypes.insert("text");
            }
            FileKind::Image { subtypes } => {
                image_subtypes.extend(subtypes.iter().map(|subtype| subtype.as_str()));
            }
        }
    }

    let mut instructions = Vec::new();
    for subtype in image_subtypes {
        if let Some(body) = instruction_for("image", subtype) {
            instructions.push(format!(
                "# Instructions for handling - {subtype} image:\n\n{body}"
            ));
        }
    }
    for subtype in data_subtypes {
        if let Some(body) = instruction_for("data", subtype) {
            instructions.push(format!(
                "# Instructions for handling - {subtype} data:\n\n{body}"
            ));
        }
    }
    for subtype in document_subtypes {
        if let Some(body) = instruction_for("document", subtype) {
            instructions.push(format!(
                "# Instructions for handling - {subtype} document:\n\n{body}"
            ));
        }
    }

    instructions
}

/// Instruction used when the classifier flags a web-search request with
/// no files attached.
pub fn web_search_instruction() -> String {
    let body = instruction_for("non_file", "web_search").unwrap_or_default();
    format!("# Instructions for web search:\n\n{body}")
}
