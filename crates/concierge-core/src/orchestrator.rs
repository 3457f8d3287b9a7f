use std::any::Any;
use std::panic::AssertUnwindSafe;

use chrono::{DateTime, Utc};
use concierge_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use concierge_providers::{ChatMessage, CompletionOptions, ProviderRegistry};
use concierge_tools::ActionRegistry;
use concierge_types::{ActionResults, HistoryTurn, Plan};
use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::Level;

const HISTORY_WINDOW: usize = 5;
const PLAN_TEMPERATURE: f32 = 0.3;
const PLAN_MAX_TOKENS: u32 = 500;
const RESPONSE_TEMPERATURE: f32 = 0.7;
const RESPONSE_MAX_TOKENS: u32 = 2000;

pub const GENERIC_APOLOGY: &str =
    "I apologize, but I encountered an error processing your request. Please try again.";
pub const INSUFFICIENT_PERMISSIONS: &str = "Insufficient permissions";

const RESPONSE_SYSTEM_PROMPT: &str = "You are a helpful AI assistant. Provide clear, concise, \
and accurate responses based on the execution results.";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OrchestrationOutcome {
    Success {
        response: String,
        plan: Plan,
        results: ActionResults,
        timestamp: DateTime<Utc>,
    },
    Denied {
        error: String,
        required_permissions: Vec<String>,
        missing_permissions: Vec<String>,
    },
    #[serde(rename = "error")]
    Failed { error: String, response: String },
}

impl OrchestrationOutcome {
    /// Text to show the end user for this outcome.
    pub fn content(&self) -> String {
        match self {
            OrchestrationOutcome::Success { response, .. } => response.clone(),
            OrchestrationOutcome::Denied {
                error,
                missing_permissions,
                ..
            } => format!("{error}: missing {}", missing_permissions.join(", ")),
            OrchestrationOutcome::Failed { response, .. } => response.clone(),
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            OrchestrationOutcome::Success { .. } => "success",
            OrchestrationOutcome::Denied { .. } => "denied",
            OrchestrationOutcome::Failed { .. } => "error",
        }
    }
}

/// Plans a query with the model, runs the permitted actions, and asks the
/// model to narrate the results.
#[derive(Clone)]
pub struct Orchestrator {
    providers: ProviderRegistry,
    actions: ActionRegistry,
    model: Option<String>,
    process: ProcessKind,
}

impl Orchestrator {
    pub fn new(providers: ProviderRegistry, actions: ActionRegistry) -> Self {
        Self {
            providers,
            actions,
            model: None,
            process: ProcessKind::Server,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model.filter(|m| !m.trim().is_empty());
        self
    }

    pub fn with_process(mut self, process: ProcessKind) -> Self {
        self.process = process;
        self
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    pub async fn plan_and_execute(
        &self,
        query: &str,
        context: &Value,
        history: &[HistoryTurn],
        permissions: &[String],
    ) -> OrchestrationOutcome {
        let outcome = AssertUnwindSafe(self.run(query, context, history, permissions))
            .catch_unwind()
            .await;
        let detail = match outcome {
            Ok(Ok(outcome)) => return outcome,
            Ok(Err(err)) => err.to_string(),
            Err(panic) => panic_message(panic.as_ref()),
        };
        emit_event(
            Level::ERROR,
            self.process,
            ObservabilityEvent {
                event: "orchestration.failed",
                component: "orchestrator",
                status: Some("error"),
                detail: Some(&detail),
                ..Default::default()
            },
        );
        OrchestrationOutcome::Failed {
            error: format!("Orchestration error: {detail}"),
            response: GENERIC_APOLOGY.to_string(),
        }
    }

    async fn run(
        &self,
        query: &str,
        context: &Value,
        history: &[HistoryTurn],
        permissions: &[String],
    ) -> anyhow::Result<OrchestrationOutcome> {
        tracing::info!("orchestrating query {}", redact_text(query));
        let plan = self.create_plan(query, context, history).await?;

        let missing = missing_permissions(&plan, permissions);
        if !missing.is_empty() {
            let detail = missing.join(",");
            emit_event(
                Level::WARN,
                self.process,
                ObservabilityEvent {
                    event: "orchestration.denied",
                    component: "orchestrator",
                    status: Some("denied"),
                    error_code: Some("PERMISSION_DENIED"),
                    detail: Some(&detail),
                    ..Default::default()
                },
            );
            return Ok(OrchestrationOutcome::Denied {
                error: INSUFFICIENT_PERMISSIONS.to_string(),
                required_permissions: plan.required_permissions,
                missing_permissions: missing,
            });
        }

        let results = self.execute_plan(&plan, context).await;
        let response = self.generate_response(query, &results, history).await?;
        Ok(OrchestrationOutcome::Success {
            response,
            plan,
            results,
            timestamp: Utc::now(),
        })
    }

    /// Never fails on model trouble: anything unusable becomes [`Plan::fallback`].
    /// The only error is a context that cannot be serialized.
    pub async fn create_plan(
        &self,
        query: &str,
        context: &Value,
        history: &[HistoryTurn],
    ) -> anyhow::Result<Plan> {
        let mut messages = vec![ChatMessage::system(self.plan_system_prompt().await)];
        messages.extend(history_window(history));
        messages.push(ChatMessage::user(format!(
            "User Query: {query}\n\nContext: {}\n\nCreate an execution plan for this query.",
            serde_json::to_string_pretty(context)?
        )));

        let options = self.options(PLAN_TEMPERATURE, PLAN_MAX_TOKENS);
        let plan = match self.providers.default_chat(&messages, &options).await {
            Ok(raw) => parse_plan(&raw).unwrap_or_else(|| {
                tracing::warn!("plan response held no usable JSON object; using fallback plan");
                Plan::fallback()
            }),
            Err(err) => {
                tracing::warn!("plan creation failed: {}; using fallback plan", err);
                Plan::fallback()
            }
        };
        let actions = plan.actions.join(",");
        emit_event(
            Level::INFO,
            self.process,
            ObservabilityEvent {
                event: "orchestration.plan",
                component: "orchestrator",
                status: Some(plan.intent.as_str()),
                detail: Some(&actions),
                ..Default::default()
            },
        );
        Ok(plan)
    }

    /// Runs each listed action in order. Unknown names are skipped; a failing
    /// or panicking handler is recorded as `{"error": msg}` and the rest still run.
    pub async fn execute_plan(&self, plan: &Plan, context: &Value) -> ActionResults {
        let mut results = ActionResults::new();
        for name in &plan.actions {
            let Some(action) = self.actions.get(name).await else {
                tracing::debug!("skipping unknown action `{}`", name);
                continue;
            };
            let params = action_params(plan.params_for(name), context);
            let outcome = AssertUnwindSafe(action.execute(params)).catch_unwind().await;
            let value = match outcome {
                Ok(Ok(value)) => value,
                Ok(Err(err)) => json!({"error": err.to_string()}),
                Err(panic) => json!({"error": panic_message(panic.as_ref())}),
            };
            if let Some(error) = value.get("error").and_then(Value::as_str) {
                emit_event(
                    Level::WARN,
                    self.process,
                    ObservabilityEvent {
                        event: "action.failed",
                        component: "orchestrator",
                        action: Some(name.as_str()),
                        status: Some("error"),
                        detail: Some(error),
                        ..Default::default()
                    },
                );
            }
            results.insert(name.clone(), value);
        }
        results
    }

    /// Model failure turns into an apology that names the error.
    pub async fn generate_response(
        &self,
        query: &str,
        results: &ActionResults,
        history: &[HistoryTurn],
    ) -> anyhow::Result<String> {
        let mut messages = vec![ChatMessage::system(RESPONSE_SYSTEM_PROMPT)];
        messages.extend(history_window(history));
        messages.push(ChatMessage::user(format!(
            "User Query: {query}\n\nExecution Results:\n{}\n\nProvide a helpful, natural response that answers the user's question based on these results.",
            serde_json::to_string_pretty(results)?
        )));

        let options = self.options(RESPONSE_TEMPERATURE, RESPONSE_MAX_TOKENS);
        Ok(match self.providers.default_chat(&messages, &options).await {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!("response generation failed: {}", err);
                format!("I apologize, but I encountered an error processing your request: {err}")
            }
        })
    }

    async fn plan_system_prompt(&self) -> String {
        let actions = self
            .actions
            .list()
            .await
            .into_iter()
            .map(|a| format!("- {}: {}", a.name, a.description))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            r#"You are an AI assistant that creates execution plans for user queries.

Available Actions:
{actions}

Create a JSON plan with this exact structure:
{{
    "intent": "user's intent (search/create/update/delete/analyze/query)",
    "actions": ["list", "of", "actions", "to", "execute"],
    "parameters": {{"action_name": {{"param": "value"}}}},
    "required_permissions": ["permission1", "permission2"]
}}

Return ONLY the JSON object, no additional text or markdown formatting."#
        )
    }

    fn options(&self, temperature: f32, max_tokens: u32) -> CompletionOptions {
        CompletionOptions {
            temperature,
            max_tokens,
            model: self.model.clone(),
        }
    }
}

/// Reads the span from the first `{` to the last `}` as a plan.
pub fn parse_plan(raw: &str) -> Option<Plan> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&raw[start..=end]).ok()
}

/// Required permissions the caller lacks, in plan order, without repeats.
pub fn missing_permissions(plan: &Plan, held: &[String]) -> Vec<String> {
    let mut missing: Vec<String> = Vec::new();
    for perm in &plan.required_permissions {
        if !held.contains(perm) && !missing.contains(perm) {
            missing.push(perm.clone());
        }
    }
    missing
}

fn history_window(history: &[HistoryTurn]) -> impl Iterator<Item = ChatMessage> + '_ {
    let skip = history.len().saturating_sub(HISTORY_WINDOW);
    history
        .iter()
        .skip(skip)
        .map(|turn| ChatMessage::new(turn.role.clone(), turn.content.clone()))
}

fn action_params(declared: Option<&Value>, context: &Value) -> Value {
    let mut params = match declared {
        Some(Value::Object(map)) => map.clone(),
        None | Some(Value::Null) => Map::new(),
        Some(other) => {
            let mut wrapped = Map::new();
            wrapped.insert("input".to_string(), other.clone());
            wrapped
        }
    };
    params.insert("context".to_string(), context.clone());
    Value::Object(params)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        return (*msg).to_string();
    }
    if let Some(msg) = panic.downcast_ref::<String>() {
        return msg.clone();
    }
    "task panicked".to_string()
}
