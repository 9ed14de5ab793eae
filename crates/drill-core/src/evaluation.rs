//! Answer evaluation and hint generation through an LLM provider.
//!
//! Every provider call goes through a [`RetryPolicy`]. Streaming evaluation
//! only retries opening the stream; a failure after text has started flowing
//! is returned to the caller, since the learner has already seen part of it.

use std::sync::Arc;

use drill_llm::{CompletionRequest, LlmProvider, StreamEvent};
use drill_store::Exercise;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{LlmConfig, RetryConfig};
use crate::decoder::{parse_evaluation, Evaluation, FeedbackDecoder};
use crate::error::{DrillError, Result};
use crate::retry::RetryPolicy;

const EVALUATION_SYSTEM_PROMPT: &str = r#"You are an expert learning instructor evaluating student responses.

Give constructive, specific feedback that:
- Acknowledges what the student did well
- Identifies specific areas for improvement
- Connects feedback to the validation criteria
- Encourages a growth mindset

Assessment levels:
- "strong": meets all validation criteria, shows clear understanding (score 80-100)
- "developing": partially meets criteria, shows emerging understanding (score 50-79)
- "needs_support": does not meet criteria, needs more guidance (score 0-49)

Return ONLY valid JSON with exactly these keys, in this order, with no markdown:
{"assessment": "strong|developing|needs_support", "internal_score": 85, "feedback": "Specific, constructive feedback..."}

Rules:
- Feedback is 2-3 sentences
- The score must match the assessment level
- Be encouraging but honest"#;

const HINT_SYSTEM_PROMPT: &str = "You are a patient tutor writing progressive hints for a learning exercise.

Hint levels:
- Level 1: conceptual nudge toward the relevant idea
- Level 2: points at the specific part of the problem to focus on
- Level 3: nearly gives the solution away without stating it

Each hint builds on the previous ones and never repeats them.
Reply with the hint text only: one or two sentences, no preamble, no markdown.";

/// Calls the LLM provider for evaluations and hints.
#[derive(Clone)]
pub struct Evaluator {
    provider: Arc<dyn LlmProvider>,
    evaluation_policy: RetryPolicy,
    hint_policy: RetryPolicy,
    config: LlmConfig,
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator")
            .field("evaluation_policy", &self.evaluation_policy)
            .field("hint_policy", &self.hint_policy)
            .field("model", &self.config.model)
            .finish_non_exhaustive()
    }
}

impl Evaluator {
    /// Creates an evaluator with per-operation default timeouts from `llm`.
    #[must_use]
    pub fn new(provider: Arc<dyn LlmProvider>, llm: LlmConfig, retry: &RetryConfig) -> Self {
        let policy = RetryPolicy::from_config(retry);
        Self {
            provider,
            evaluation_policy: policy.clone().with_default_timeout(llm.evaluation_timeout()),
            hint_policy: policy.with_default_timeout(llm.hint_timeout()),
            config: llm,
        }
    }

    /// Evaluates an answer with a buffered provider call.
    pub async fn evaluate(
        &self,
        exercise: &Exercise,
        answer: &str,
        hints_used: u32,
        max_hints: u32,
        cancel: &CancellationToken,
    ) -> Result<Evaluation> {
        let request = self.evaluation_request(exercise, answer, hints_used, max_hints);
        let raw = self
            .evaluation_policy
            .run(cancel, request, |request| async move {
                self.provider.complete(&request).await
            })
            .await?;
        debug!(bytes = raw.len(), "Received evaluation");
        Ok(parse_evaluation(&raw)?)
    }

    /// Evaluates an answer with a streamed provider call.
    ///
    /// `on_feedback` receives each character of the feedback text as it
    /// arrives. The returned evaluation is parsed from the complete response.
    pub async fn evaluate_streaming<F>(
        &self,
        exercise: &Exercise,
        answer: &str,
        hints_used: u32,
        max_hints: u32,
        cancel: &CancellationToken,
        mut on_feedback: F,
    ) -> Result<Evaluation>
    where
        F: FnMut(char) + Send,
    {
        let request = self.evaluation_request(exercise, answer, hints_used, max_hints);
        let mut stream = self
            .evaluation_policy
            .run(cancel, request, |request| async move {
                self.provider.stream(&request).await
            })
            .await?;

        let mut decoder = FeedbackDecoder::new();
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(DrillError::Cancelled),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(StreamEvent::TextDelta(text))) => {
                    decoder.push(&text).into_iter().for_each(&mut on_feedback);
                }
                Some(Ok(StreamEvent::Done)) | None => break,
                Some(Err(err)) => return Err(err.into()),
            }
        }

        debug!(bytes = decoder.raw().len(), "Evaluation stream finished");
        Ok(decoder.finish()?)
    }

    /// Generates the hint for `level`, given the hints already written for
    /// lower levels.
    pub async fn generate_hint(
        &self,
        exercise: &Exercise,
        level: u32,
        previous: &[String],
        cancel: &CancellationToken,
    ) -> Result<String> {
        let request = CompletionRequest::new(
            HINT_SYSTEM_PROMPT,
            hint_prompt(exercise, level, previous),
            self.config.hint_max_tokens,
            self.config.hint_temperature,
        );
        let text = self
            .hint_policy
            .run(cancel, request, |request| async move {
                self.provider.complete(&request).await
            })
            .await?;

        let hint = text.trim();
        if hint.is_empty() {
            return Err(DrillError::malformed("hint response was empty"));
        }
        info!(level, "Generated hint");
        Ok(hint.to_string())
    }

    fn evaluation_request(
        &self,
        exercise: &Exercise,
        answer: &str,
        hints_used: u32,
        max_hints: u32,
    ) -> CompletionRequest {
        CompletionRequest::new(
            EVALUATION_SYSTEM_PROMPT,
            evaluation_prompt(exercise, answer, hints_used, max_hints),
            self.config.evaluation_max_tokens,
            self.config.evaluation_temperature,
        )
    }
}

fn evaluation_prompt(exercise: &Exercise, answer: &str, hints_used: u32, max_hints: u32) -> String {
    let criteria = serde_json::to_string_pretty(&exercise.validation_criteria)
        .unwrap_or_else(|_| exercise.validation_criteria.to_string());
    let mut prompt = format!(
        "Exercise Type: {}\nExercise Prompt: {}\n",
        exercise.exercise_type, exercise.prompt
    );
    if let Some(material) = &exercise.material {
        prompt.push_str(&format!("Material:\n{material}\n"));
    }
    prompt.push_str(&format!(
        "\nValidation Criteria:\n{criteria}\n\n\
         Model Answer: {}\nModel Explanation: {}\n\n\
         Student Answer:\n{answer}\n\n\
         Hints Used: {hints_used}/{max_hints}\n\n\
         Evaluate this answer against the validation criteria. Using hints is fine; \
         focus on the understanding demonstrated.\n\n\
         Return ONLY the JSON evaluation object.",
        exercise.model_answer, exercise.model_explanation
    ));
    prompt
}

fn hint_prompt(exercise: &Exercise, level: u32, previous: &[String]) -> String {
    let mut prompt = format!(
        "Exercise Type: {}\nExercise Prompt: {}\n",
        exercise.exercise_type, exercise.prompt
    );
    if let Some(material) = &exercise.material {
        prompt.push_str(&format!("Material:\n{material}\n"));
    }
    prompt.push_str(&format!("Model Answer: {}\n", exercise.model_answer));
    if !previous.is_empty() {
        prompt.push_str("\nHints already given:\n");
        for (index, hint) in previous.iter().enumerate() {
            prompt.push_str(&format!("Level {}: {hint}\n", index + 1));
        }
    }
    prompt.push_str(&format!("\nWrite the level {level} hint."));
    prompt
}
