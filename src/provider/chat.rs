//! Chat-completions backend built on async-openai.
//!
//! Transfers are advertised to the model as function tools, one per permitted
//! target, named `transfer_to_<snake_case_name>`. Calling one of them is how
//! the model asks for a handoff; plain text is a final answer.

use std::future::Future;
use std::pin::Pin;

use async_openai::{
    config::{AzureConfig, Config, OpenAIConfig},
    error::OpenAIError,
    types::{
        ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionTool, ChatCompletionToolArgs,
        ChatCompletionToolType, CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
        FunctionObjectArgs,
    },
    Client,
};
use schemars::JsonSchema;
use serde::Deserialize;
use tower::{BoxError, Service, ServiceBuilder};
use tracing::{debug, debug_span, Instrument};

use super::{
    boxed, BackendError, BackendRequest, BackendResponse, BackendSvc, Outcome, TransferDirective,
};
use crate::config::{BackendConfig, Vendor};
use crate::conversation::TurnSource;
use crate::error::{DispatchError, Result};
use crate::registry::Responder;
use crate::resilience::{RetryLayer, RetryPolicy, TimeoutLayer, TransientOnly};
use crate::usage::Usage;

const TRANSFER_PREFIX: &str = "transfer_to_";
const MAX_TOOL_NAME_LEN: usize = 64;

/// Arguments the model may pass when calling a transfer tool.
#[derive(Debug, Default, Deserialize, JsonSchema)]
struct TransferArgs {
    /// Why the conversation is being handed over, for the receiving responder.
    #[serde(default)]
    note: Option<String>,
}

/// Tool name advertised for a transfer to `responder`.
pub fn transfer_tool_name(responder: &str) -> String {
    let slug: String = responder
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    let mut name = format!("{TRANSFER_PREFIX}{slug}");
    name.truncate(MAX_TOOL_NAME_LEN);
    name
}

/// Tool name → target responder, for one invocation.
struct TransferTable {
    entries: Vec<(String, String, String)>, // (tool, target, scope)
}

impl TransferTable {
    fn new(targets: &[std::sync::Arc<Responder>]) -> Self {
        let mut entries: Vec<(String, String, String)> = Vec::with_capacity(targets.len());
        for (i, target) in targets.iter().enumerate() {
            let mut tool = transfer_tool_name(target.name());
            if entries.iter().any(|(t, _, _)| *t == tool) {
                let suffix = format!("_{i}");
                tool.truncate(MAX_TOOL_NAME_LEN - suffix.len());
                tool.push_str(&suffix);
            }
            entries.push((tool, target.name().to_string(), target.scope().to_string()));
        }
        Self { entries }
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn lookup(&self, tool: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(t, _, _)| t == tool)
            .map(|(_, target, _)| target.as_str())
    }

    fn tools(&self) -> std::result::Result<Vec<ChatCompletionTool>, OpenAIError> {
        let schema = schemars::schema_for!(TransferArgs);
        let parameters = serde_json::to_value(schema.schema)
            .unwrap_or_else(|_| serde_json::json!({ "type": "object" }));
        self.entries
            .iter()
            .map(|(tool, target, scope)| {
                let description = if scope.is_empty() {
                    format!("Handoff to the {target} responder to handle the request.")
                } else {
                    format!("Handoff to the {target} responder to handle the request. {scope}")
                };
                ChatCompletionToolArgs::default()
                    .r#type(ChatCompletionToolType::Function)
                    .function(
                        FunctionObjectArgs::default()
                            .name(tool.clone())
                            .description(description)
                            .parameters(parameters.clone())
                            .build()?,
                    )
                    .build()
            })
            .collect()
    }
}

fn system_prompt(responder: &Responder, targets: &[std::sync::Arc<Responder>]) -> String {
    if targets.is_empty() {
        return responder.instructions().to_string();
    }
    let mut prompt = format!(
        "{}\n\nYou can hand the conversation to one of these responders by calling its transfer tool:",
        responder.instructions()
    );
    for target in targets {
        if target.scope().is_empty() {
            prompt.push_str(&format!("\n- {}", target.name()));
        } else {
            prompt.push_str(&format!("\n- {}: {}", target.name(), target.scope()));
        }
    }
    prompt
}

fn build_request(
    model: &str,
    req: &BackendRequest,
    table: &TransferTable,
) -> std::result::Result<CreateChatCompletionRequest, OpenAIError> {
    let mut messages: Vec<ChatCompletionRequestMessage> =
        Vec::with_capacity(req.conversation.len() + 1);
    messages.push(
        ChatCompletionRequestSystemMessageArgs::default()
            .content(system_prompt(&req.responder, &req.targets))
            .build()?
            .into(),
    );
    for turn in req.conversation.turns() {
        let message: ChatCompletionRequestMessage = match turn.source {
            TurnSource::User => ChatCompletionRequestUserMessageArgs::default()
                .content(turn.text.clone())
                .build()?
                .into(),
            TurnSource::System => ChatCompletionRequestSystemMessageArgs::default()
                .content(turn.text.clone())
                .build()?
                .into(),
            TurnSource::Responder => ChatCompletionRequestAssistantMessageArgs::default()
                .content(turn.text.clone())
                .build()?
                .into(),
        };
        messages.push(message);
    }

    let mut args = CreateChatCompletionRequestArgs::default();
    args.model(model).messages(messages);
    if !table.is_empty() {
        args.tools(table.tools()?);
    }
    args.build()
}

/// Turn the first choice of a response into an [`Outcome`].
fn interpret(
    content: Option<&str>,
    tool_calls: &[ChatCompletionMessageToolCall],
    table: &TransferTable,
) -> std::result::Result<Outcome, BackendError> {
    if let Some(call) = tool_calls.first() {
        let name = call.function.name.as_str();
        let target = match table.lookup(name) {
            Some(target) => target.to_string(),
            // Not one we advertised; let the loop reject it by name.
            None => match name.strip_prefix(TRANSFER_PREFIX) {
                Some(rest) => rest.to_string(),
                None => {
                    return Err(BackendError::Protocol(format!(
                        "model called unknown tool {name:?}"
                    )))
                }
            },
        };
        let args: TransferArgs = if call.function.arguments.trim().is_empty() {
            TransferArgs::default()
        } else {
            serde_json::from_str(&call.function.arguments).map_err(|e| {
                BackendError::Protocol(format!("invalid arguments for {name}: {e}"))
            })?
        };
        let note = args.note.filter(|n| !n.trim().is_empty());
        return Ok(Outcome::Transfer(TransferDirective { target, note }));
    }

    match content {
        Some(text) if !text.trim().is_empty() => Ok(Outcome::FinalAnswer(text.to_string())),
        _ => Err(BackendError::Protocol(
            "response had neither text nor a transfer".to_string(),
        )),
    }
}

fn map_openai_error(err: OpenAIError) -> BackendError {
    match err {
        OpenAIError::JSONDeserialize(e) => {
            BackendError::Protocol(format!("could not decode response: {e}"))
        }
        OpenAIError::InvalidArgument(message) => BackendError::Protocol(message),
        other => BackendError::Unavailable(other.to_string()),
    }
}

/// A [`ModelBackend`](super::ModelBackend) speaking the chat-completions API.
#[derive(Clone)]
pub struct ChatCompletionsBackend<C: Config> {
    client: Client<C>,
    default_model: String,
}

impl<C: Config> std::fmt::Debug for ChatCompletionsBackend<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsBackend")
            .field("default_model", &self.default_model)
            .finish()
    }
}

impl<C: Config> ChatCompletionsBackend<C> {
    pub fn with_client(client: Client<C>, default_model: impl Into<String>) -> Self {
        Self {
            client,
            default_model: default_model.into(),
        }
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }
}

fn require(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(DispatchError::BackendUnavailable {
            message: format!("{what} is empty"),
        });
    }
    Ok(())
}

impl ChatCompletionsBackend<AzureConfig> {
    pub fn azure(
        endpoint: &str,
        api_key: &str,
        api_version: &str,
        deployment: &str,
        default_model: impl Into<String>,
    ) -> Result<Self> {
        require(endpoint, "Azure endpoint")?;
        require(api_key, "Azure API key")?;
        require(api_version, "Azure API version")?;
        require(deployment, "Azure deployment")?;
        if !(endpoint.starts_with("https://") || endpoint.starts_with("http://")) {
            return Err(DispatchError::BackendUnavailable {
                message: format!("Azure endpoint {endpoint:?} is not an http(s) URL"),
            });
        }
        let config = AzureConfig::new()
            .with_api_base(endpoint)
            .with_api_key(api_key)
            .with_api_version(api_version)
            .with_deployment_id(deployment);
        Ok(Self::with_client(Client::with_config(config), default_model))
    }
}

impl ChatCompletionsBackend<OpenAIConfig> {
    pub fn openai(
        api_key: &str,
        base_url: Option<&str>,
        default_model: impl Into<String>,
    ) -> Result<Self> {
        require(api_key, "OpenAI API key")?;
        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(base) = base_url {
            config = config.with_api_base(base);
        }
        Ok(Self::with_client(Client::with_config(config), default_model))
    }
}

impl<C> Service<BackendRequest> for ChatCompletionsBackend<C>
where
    C: Config + Clone + Send + Sync + 'static,
{
    type Response = BackendResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: BackendRequest) -> Self::Future {
        let client = self.client.clone();
        let model = req
            .responder
            .model()
            .map(str::to_string)
            .unwrap_or_else(|| self.default_model.clone());
        let span = debug_span!(
            "chat_completion",
            responder = %req.responder.name(),
            model = %model
        );
        let fut = async move {
            let table = TransferTable::new(&req.targets);
            let request = build_request(&model, &req, &table)
                .map_err(|e| BackendError::Protocol(e.to_string()))?;
            debug!(
                messages = request.messages.len(),
                transfer_tools = table.entries.len(),
                "sending chat completion"
            );

            let response = client
                .chat()
                .create(request)
                .await
                .map_err(map_openai_error)?;

            let usage = response
                .usage
                .as_ref()
                .map(|u| Usage::new(u.prompt_tokens as usize, u.completion_tokens as usize))
                .unwrap_or_else(Usage::unreported);
            let choice = response
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| BackendError::Protocol("no choices in response".to_string()))?;
            let tool_calls = choice.message.tool_calls.unwrap_or_default();
            let outcome = interpret(choice.message.content.as_deref(), &tool_calls, &table)?;
            debug!(outcome = ?outcome, "chat completion interpreted");

            Ok::<_, BoxError>(BackendResponse { outcome, usage })
        };
        Box::pin(fut.instrument(span))
    }
}

/// Build the configured vendor client wrapped in the retry and timeout
/// layers. Credential problems surface here, before any run starts.
pub fn backend_from_config(config: &BackendConfig) -> Result<BackendSvc> {
    let retry = RetryLayer::new(RetryPolicy::from(&config.retry), TransientOnly);
    let timeout = TimeoutLayer::new(config.request_timeout);
    let svc = match &config.vendor {
        Vendor::Azure {
            endpoint,
            api_version,
            deployment,
        } => {
            let backend = ChatCompletionsBackend::azure(
                endpoint,
                &config.api_key,
                api_version,
                deployment,
                config.model.clone(),
            )?;
            boxed(ServiceBuilder::new().layer(retry).layer(timeout).service(backend))
        }
        Vendor::OpenAi { base_url } => {
            let backend = ChatCompletionsBackend::openai(
                &config.api_key,
                base_url.as_deref(),
                config.model.clone(),
            )?;
            boxed(ServiceBuilder::new().layer(retry).layer(timeout).service(backend))
        }
    };
    Ok(svc)
}
