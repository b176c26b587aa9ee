//! Answer synthesis: the generation backend seam and the prompt template.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use futures::stream;

use crate::document::SearchResult;
use crate::error::{RagError, Result};

/// A stream of answer fragments, in generation order.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// A generative model that turns a prompt into an answer.
///
/// Failures must be reported as errors (typically
/// [`RagError::GenerationFailure`] or [`RagError::BackendUnavailable`]);
/// an implementation must never paper over a failure with an empty answer.
#[async_trait]
pub trait AnswerSynthesizer: Send + Sync {
    /// A short name for log fields and error messages.
    fn name(&self) -> &str;

    /// Generate the complete answer for `prompt`.
    async fn generate(&self, prompt: &str) -> Result<String>;

    /// Generate the answer as a stream of fragments.
    ///
    /// The default implementation yields the whole [`generate`](AnswerSynthesizer::generate)
    /// output as a single fragment. Backends with native streaming should override it.
    async fn generate_stream(&self, prompt: &str) -> Result<TextStream> {
        let answer = self.generate(prompt).await?;
        Ok(Box::pin(stream::once(async move { Ok(answer) })))
    }
}

/// The classic "stuff" question-answering prompt.
pub const DEFAULT_TEMPLATE: &str = "Use the following pieces of context to answer the question at the end. \
If you don't know the answer, just say that you don't know, don't try to make up an answer.

{context}

Question: {question}
Helpful Answer:";

/// A deterministic prompt template with `{context}` and `{question}` placeholders.
///
/// Retrieved chunks are joined with a blank line, in result order, and
/// substituted for `{context}`. Placeholders are expanded in a single pass,
/// so braces inside the document or query are left untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    template: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self { template: DEFAULT_TEMPLATE.to_string() }
    }
}

impl PromptTemplate {
    /// Create a custom template.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::InvalidConfiguration`] unless the template contains
    /// both `{context}` and `{question}`.
    pub fn new(template: impl Into<String>) -> Result<Self> {
        let template = template.into();
        for placeholder in ["{context}", "{question}"] {
            if !template.contains(placeholder) {
                return Err(RagError::InvalidConfiguration(format!(
                    "prompt template is missing the {placeholder} placeholder"
                )));
            }
        }
        Ok(Self { template })
    }

    /// The raw template text.
    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Render the prompt for `question` over the retrieved `results`.
    ///
    /// Each passage is trimmed and passages are separated by a blank line.
    pub fn render(&self, results: &[SearchResult], question: &str) -> String {
        let context =
            results.iter().map(|r| r.chunk.text.trim()).collect::<Vec<_>>().join("\n\n");

        let mut prompt = String::with_capacity(self.template.len() + context.len() + question.len());
        let mut rest = self.template.as_str();
        while let Some(pos) = rest.find('{') {
            prompt.push_str(&rest[..pos]);
            let tail = &rest[pos..];
            if let Some(after) = tail.strip_prefix("{context}") {
                prompt.push_str(&context);
                rest = after;
            } else if let Some(after) = tail.strip_prefix("{question}") {
                prompt.push_str(question);
                rest = after;
            } else {
                prompt.push('{');
                rest = &tail[1..];
            }
        }
        prompt.push_str(rest);
        prompt
    }
}
