//! Deterministic offline backends for tests and demos.
//!
//! [`HashEmbeddingProvider`] embeds text as a hashed bag of words, so texts
//! sharing words score as similar under cosine similarity.
//! [`ExtractiveSynthesizer`] answers with the context line that shares the
//! most words with the question. Neither needs a model server.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::synthesizer::AnswerSynthesizer;

/// Lowercased alphanumeric words of `text`.
fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()).map(str::to_lowercase)
}

/// 64-bit FNV-1a.
fn fnv1a(word: &str) -> u64 {
    word.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// An [`EmbeddingProvider`] that hashes each word into one of `dimensions`
/// buckets and L2-normalizes the counts.
#[derive(Debug)]
pub struct HashEmbeddingProvider {
    dimensions: usize,
    calls: AtomicUsize,
}

impl HashEmbeddingProvider {
    /// Create a provider producing vectors of the given length.
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions: dimensions.max(1), calls: AtomicUsize::new(0) }
    }

    /// Number of texts embedded so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    fn name(&self) -> &str {
        "hash"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let mut embedding = vec![0.0f32; self.dimensions];
        for word in words(text) {
            let bucket = (fnv1a(&word) % self.dimensions as u64) as usize;
            embedding[bucket] += 1.0;
        }
        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            embedding.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// An [`AnswerSynthesizer`] that picks the prompt line sharing the most
/// distinct words with the prompt's `Question:` line.
///
/// Answers "I don't know." when no line overlaps. Every prompt it receives is
/// recorded for inspection.
#[derive(Debug, Default)]
pub struct ExtractiveSynthesizer {
    prompts: Mutex<Vec<String>>,
}

impl ExtractiveSynthesizer {
    /// Create a new synthesizer.
    pub fn new() -> Self {
        Self::default()
    }

    /// The prompts received so far, oldest first.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AnswerSynthesizer for ExtractiveSynthesizer {
    fn name(&self) -> &str {
        "extractive"
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }

        let Some(question) = prompt.lines().rev().find_map(|l| l.strip_prefix("Question:")) else {
            return Ok("I don't know.".to_string());
        };
        let question_words: HashSet<String> = words(question).collect();

        let mut best: Option<(usize, &str)> = None;
        for line in prompt.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("Question:") || line.ends_with("Answer:") {
                continue;
            }
            let line_words: HashSet<String> = words(line).collect();
            let overlap = line_words.intersection(&question_words).count();
            if overlap > 0 && best.is_none_or(|(score, _)| overlap > score) {
                best = Some((overlap, line));
            }
        }

        Ok(best.map_or_else(|| "I don't know.".to_string(), |(_, line)| line.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::cosine_similarity;

    #[tokio::test]
    async fn shared_words_score_higher() {
        let provider = HashEmbeddingProvider::new(128);
        let query = provider.embed("Where did the dog go?").await.unwrap();
        let dog = provider.embed("The dog ran.").await.unwrap();
        let cat = provider.embed("The cat sat.").await.unwrap();

        assert_eq!(query.len(), 128);
        assert!(cosine_similarity(&query, &dog) > cosine_similarity(&query, &cat));
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn empty_text_embeds_to_zero_vector() {
        let provider = HashEmbeddingProvider::new(8);
        assert!(provider.embed("  ...  ").await.unwrap().iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn extractive_answer_picks_best_line() {
        let synthesizer = ExtractiveSynthesizer::new();
        let prompt = "Context:\nThe cat sat.\nThe dog ran.\n\nQuestion: where did the dog go?\nHelpful Answer:";
        let answer = synthesizer.generate(prompt).await.unwrap();
        assert_eq!(answer, "The dog ran.");
        assert_eq!(synthesizer.prompts().len(), 1);
    }

    #[tokio::test]
    async fn extractive_answer_without_overlap() {
        let synthesizer = ExtractiveSynthesizer::new();
        let answer = synthesizer.generate("Nothing here.\nQuestion: why?").await.unwrap();
        assert_eq!(answer, "I don't know.");
    }
}
