//! Synthetic span generator
//!
//! Produces the span lifecycle of fake agent runs so the pipeline and the
//! local transport can be exercised without an instrumented application.

use crate::span::{new_span_id, new_trace_id, SpanData, SpanEvent, SpanStatus};
use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};

const TOOLS: &[(&str, &str, &str)] = &[
    ("getWeather", r#"{"city":"Paris"}"#, r#"{"temperature":21,"unit":"C"}"#),
    ("searchDocs", r#"{"query":"rate limits"}"#, r#"["Rate limits reset every minute"]"#),
    ("readFile", r#"{"path":"src/main.rs"}"#, r#""fn main() {}""#),
];

const PROMPTS: &[&str] = &[
    "What's the weather in Paris?",
    "How do rate limits work?",
    "Fix the bug in main.rs",
];

/// Configuration for synthetic runs
#[derive(Debug, Clone)]
pub struct SpanGeneratorConfig {
    /// Model steps per run
    pub steps_per_run: usize,

    /// Tool calls after each step but the last
    pub tool_calls_per_step: usize,

    /// Every n-th run fails (0 = never)
    pub fail_every: u64,

    /// Supply run ids through telemetry metadata instead of letting the
    /// pipeline generate them
    pub metadata_run_ids: bool,

    /// Model id recorded on every span
    pub model: String,
}

impl Default for SpanGeneratorConfig {
    fn default() -> Self {
        Self {
            steps_per_run: 2,
            tool_calls_per_step: 1,
            fail_every: 0,
            metadata_run_ids: false,
            model: "gpt-4o-mini".to_string(),
        }
    }
}

/// Generates the start and end events of synthetic agent runs
pub struct SpanGenerator {
    config: SpanGeneratorConfig,
    runs_generated: AtomicU64,
}

impl SpanGenerator {
    pub fn new() -> Self {
        Self::with_config(SpanGeneratorConfig::default())
    }

    pub fn with_config(config: SpanGeneratorConfig) -> Self {
        Self {
            config,
            runs_generated: AtomicU64::new(0),
        }
    }

    pub fn runs_generated(&self) -> u64 {
        self.runs_generated.load(Ordering::Relaxed)
    }

    /// Lifecycle events of one run starting now, in emission order
    pub fn generate_run(&self) -> Vec<SpanEvent> {
        self.generate_run_at(Utc::now())
    }

    /// Lifecycle events of one run starting at `start`
    pub fn generate_run_at(&self, start: DateTime<Utc>) -> Vec<SpanEvent> {
        let n = self.runs_generated.fetch_add(1, Ordering::Relaxed) + 1;
        let failing = self.config.fail_every > 0 && n % self.config.fail_every == 0;
        let prompt = PROMPTS[(n as usize - 1) % PROMPTS.len()];

        let trace_id = new_trace_id();
        let mut run = SpanData::new(trace_id.as_str(), new_span_id(), "ai.generateText", start)
            .with_attribute("ai.model.id", self.config.model.as_str())
            .with_attribute(
                "ai.prompt",
                serde_json::json!({
                    "messages": [
                        {"role": "system", "content": "You are a helpful assistant."},
                        {"role": "user", "content": [{"type": "text", "text": prompt}]}
                    ]
                })
                .to_string(),
            );
        if self.config.metadata_run_ids {
            run.set_attribute("ai.telemetry.metadata.tcc.runId", format!("demo-run-{}", n));
        }

        let mut events = vec![SpanEvent::Start(run.clone())];
        let mut clock = start + Duration::milliseconds(5);
        let mut prompt_tokens = 0i64;
        let mut completion_tokens = 0i64;
        let steps = self.config.steps_per_run.max(1);

        for step_index in 0..steps {
            let last_step = step_index + 1 == steps;
            let step_prompt = 120 + 40 * step_index as i64;
            let step_completion = 18 + 7 * step_index as i64;
            prompt_tokens += step_prompt;
            completion_tokens += step_completion;

            let mut step = SpanData::new(trace_id.as_str(), new_span_id(), "ai.generateText.doGenerate", clock)
                .with_parent(run.span_id.as_str())
                .with_attribute("ai.model.id", self.config.model.as_str());
            events.push(SpanEvent::Start(step.clone()));

            clock += Duration::milliseconds(180);
            step.set_attribute("ai.usage.promptTokens", step_prompt);
            step.set_attribute("ai.usage.completionTokens", step_completion);
            if last_step {
                step.set_attribute("ai.response.text", format!("Here is what I found about: {}", prompt));
            }
            step.end(clock, SpanStatus::ok());
            events.push(SpanEvent::End(step));

            if last_step {
                break;
            }

            for call_index in 0..self.config.tool_calls_per_step {
                let (name, args, result) = TOOLS[(step_index + call_index) % TOOLS.len()];
                clock += Duration::milliseconds(10);

                let mut call = SpanData::new(trace_id.as_str(), new_span_id(), "ai.toolCall", clock)
                    .with_parent(run.span_id.as_str())
                    .with_attribute("ai.toolCall.name", name)
                    .with_attribute("ai.toolCall.id", format!("call_{}", new_span_id()))
                    .with_attribute("ai.toolCall.args", args);
                events.push(SpanEvent::Start(call.clone()));

                clock += Duration::milliseconds(60);
                let status = if failing && call_index + 1 == self.config.tool_calls_per_step {
                    SpanStatus::error(format!("{} timed out", name))
                } else {
                    call.set_attribute("ai.toolCall.result", result);
                    SpanStatus::ok()
                };
                call.end(clock, status);
                events.push(SpanEvent::End(call));
            }
            clock += Duration::milliseconds(5);
        }

        clock += Duration::milliseconds(5);
        run.set_attribute("ai.usage.promptTokens", prompt_tokens);
        run.set_attribute("ai.usage.completionTokens", completion_tokens);
        run.set_attribute("ai.response.text", format!("Here is what I found about: {}", prompt));
        let status = if failing {
            SpanStatus::error("tool call failed")
        } else {
            SpanStatus::ok()
        };
        run.end(clock, status);
        events.push(SpanEvent::End(run));

        events
    }
}

impl Default for SpanGenerator {
    fn default() -> Self {
        Self::new()
    }
}
