//! Deterministic local output for development and tests.

use super::{GenerationError, GenerationRequest, Generator};
use async_trait::async_trait;
use quire_core::TaskKind;

/// Characters of source text quoted in a generated section.
const EXCERPT_CHARS: usize = 280;

/// Produces output from the request alone, without any remote call.
#[derive(Clone, Debug, Default)]
pub struct DryRunGenerator;

impl DryRunGenerator {
    pub fn new() -> Self {
        Self
    }
}

fn excerpt(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match collapsed.char_indices().nth(EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}...", &collapsed[..cut]),
        None => collapsed,
    }
}

#[async_trait]
impl Generator for DryRunGenerator {
    async fn invoke(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let document = &request.document;
        let body = match &document.text {
            Some(text) => excerpt(text),
            None => format!(
                "{} ({}, {} bytes)",
                document.name, document.mime_type, document.size
            ),
        };

        let output = match request.kind {
            TaskKind::Generate => {
                let mut section = format!("## {}\n\n{body}", document.name);
                if let Some(instructions) = &request.instructions {
                    section.push_str(&format!("\n\n_Guidance: {instructions}_"));
                }
                section
            }
            TaskKind::Refine => {
                let source = document.text.as_deref().unwrap_or(&body);
                format!(
                    "{}\n\n<!-- refinement pass {} of {} -->",
                    source.trim_end(),
                    request.step,
                    request.total_steps
                )
            }
        };
        Ok(output)
    }

    fn name(&self) -> &'static str {
        "dry_run"
    }
}
