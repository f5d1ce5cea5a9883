// Dataset Formatter - JSONL instruction records rendered through a prompt template

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use crate::errors::{FinetuneError, FinetuneResult};
use crate::models::templates::{join_prompt, PromptTemplate};

/// One instruction record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub instruction: String,
    /// Optional context; null and missing both mean empty
    #[serde(default, deserialize_with = "null_as_empty")]
    pub input: String,
    pub output: String,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl TrainingExample {
    pub fn new(
        instruction: impl Into<String>,
        input: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            instruction: instruction.into(),
            input: input.into(),
            output: output.into(),
        }
    }

    /// Instruction plus input, as shown to the model
    pub fn prompt(&self) -> String {
        join_prompt(&self.instruction, &self.input)
    }

    pub fn format(self, template: PromptTemplate) -> FormattedExample {
        let formatted_text = template
            .template()
            .format_example(&self.prompt(), &self.output);
        FormattedExample {
            example: self,
            formatted_text,
        }
    }
}

/// A record with its rendered training text
#[derive(Debug, Clone, PartialEq)]
pub struct FormattedExample {
    pub example: TrainingExample,
    pub formatted_text: String,
}

fn parse_line(path: &Path, line_no: usize, line: &str) -> FinetuneResult<TrainingExample> {
    let example: TrainingExample =
        serde_json::from_str(line).map_err(|e| FinetuneError::DataFormat {
            path: path.to_path_buf(),
            line: Some(line_no),
            reason: e.to_string(),
        })?;
    if example.instruction.trim().is_empty() {
        return Err(FinetuneError::DataFormat {
            path: path.to_path_buf(),
            line: Some(line_no),
            reason: "`instruction` is empty".to_string(),
        });
    }
    Ok(example)
}

fn open_lines(path: &Path) -> FinetuneResult<Lines<BufReader<File>>> {
    let file = File::open(path).map_err(|e| FinetuneError::DataFormat {
        path: path.to_path_buf(),
        line: None,
        reason: format!("cannot open: {}", e),
    })?;
    Ok(BufReader::new(file).lines())
}

/// A validated JSONL file of instruction records.
///
/// `open` checks every line once; `iter` re-reads the file lazily, so the
/// dataset can be walked any number of times without holding it in memory.
#[derive(Debug, Clone)]
pub struct InstructionDataset {
    path: PathBuf,
    template: PromptTemplate,
    len: usize,
}

impl InstructionDataset {
    pub fn open(path: impl AsRef<Path>, template: PromptTemplate) -> FinetuneResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut len = 0;

        for (idx, line) in open_lines(&path)?.enumerate() {
            let line = line.map_err(|e| FinetuneError::DataFormat {
                path: path.clone(),
                line: Some(idx + 1),
                reason: e.to_string(),
            })?;
            if line.trim().is_empty() {
                continue;
            }
            parse_line(&path, idx + 1, &line)?;
            len += 1;
        }

        if len == 0 {
            return Err(FinetuneError::DataFormat {
                path,
                line: None,
                reason: "dataset contains no records".to_string(),
            });
        }

        tracing::info!(
            "Loaded {} training examples from {} ({} template)",
            len,
            path.display(),
            template.template().family_name()
        );
        Ok(Self {
            path,
            template,
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn template(&self) -> PromptTemplate {
        self.template
    }

    /// Fresh pass over the file
    pub fn iter(&self) -> FinetuneResult<FormattedExamples> {
        Ok(FormattedExamples {
            lines: open_lines(&self.path)?.enumerate(),
            path: self.path.clone(),
            template: self.template,
        })
    }
}

/// Lazy iterator over formatted records
pub struct FormattedExamples {
    lines: std::iter::Enumerate<Lines<BufReader<File>>>,
    path: PathBuf,
    template: PromptTemplate,
}

impl Iterator for FormattedExamples {
    type Item = FinetuneResult<FormattedExample>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (idx, line) = self.lines.next()?;
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    return Some(Err(FinetuneError::DataFormat {
                        path: self.path.clone(),
                        line: Some(idx + 1),
                        reason: e.to_string(),
                    }))
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            return Some(
                parse_line(&self.path, idx + 1, &line).map(|ex| ex.format(self.template)),
            );
        }
    }
}
