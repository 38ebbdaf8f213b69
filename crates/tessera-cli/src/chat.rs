use std::io::Write;
use std::path::{Path, PathBuf};

use clap::Args;
use tessera_ai::{
    AbortController, AssembledResponse, ChatClient, ChatError, ChatMessage, ChatOptions, Chunk,
    ScriptedProvider, Tool,
};
use tracing::info;

use crate::config::{load_cli_config, CliConfig};
use crate::logging::init_tracing;
use crate::paths::TesseraPaths;

#[derive(Args, Debug, Clone, Default)]
pub struct ChatArgs {
    /// Prompt text. Words are joined with single spaces.
    #[arg(value_name = "PROMPT")]
    pub prompt: Vec<String>,
    #[arg(long)]
    pub model: Option<String>,
    /// Provider id, overrides `[provider].id`.
    #[arg(long)]
    pub provider: Option<String>,
    #[arg(long)]
    pub base_url: Option<String>,
    #[arg(long)]
    pub system: Option<String>,
    #[arg(long)]
    pub timeout_ms: Option<u64>,
    #[arg(long)]
    pub max_attempts: Option<u32>,
    /// JSON file holding an array of tool declarations.
    #[arg(long)]
    pub tools: Option<PathBuf>,
    /// Replay a JSON array of chunks instead of calling a provider.
    #[arg(long)]
    pub replay: Option<PathBuf>,
    /// Print the assembled response as JSON instead of streaming text.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

pub async fn run_chat(args: ChatArgs, conf_dir: Option<PathBuf>) -> Result<(), String> {
    let paths = TesseraPaths::resolve(conf_dir.as_deref());
    let config = load_cli_config(&paths)?;
    init_tracing(&config.log);

    let prompt = args.prompt.join(" ");
    if prompt.trim().is_empty() {
        return Err("prompt is required".to_string());
    }
    let messages = build_messages(args.system.as_deref(), &prompt);
    let tools = match args.tools.as_deref() {
        Some(path) => load_tools(&paths.user_input(path))?,
        None => Vec::new(),
    };

    let replay = args.replay.as_deref().map(|path| paths.user_input(path));
    let client = build_client(&args, &config, replay.as_deref())?;
    let model = args
        .model
        .clone()
        .or_else(|| config.model.clone())
        .ok_or_else(|| "model is required: pass --model or set [provider].model".to_string())?;

    let controller = AbortController::new();
    let mut options = ChatOptions::new(model)
        .with_tools(tools)
        .with_abort_signal(controller.signal());
    if let Some(timeout_ms) = args.timeout_ms {
        options = options.with_timeout_ms(timeout_ms);
    }
    if let Some(max_attempts) = args.max_attempts {
        options = options.with_retry_policy(client.config().retry.clone().max_attempts(max_attempts));
    }
    if !args.json {
        options = options.on_content(|text| {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(text.as_bytes())?;
            stdout.flush()?;
            Ok(())
        });
    }

    let interrupt = controller.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling chat request");
            interrupt.abort();
        }
    });

    let result = client.send_chat(&messages, options).await;
    ctrl_c.abort();

    match result {
        Ok(response) => print_response(&response, args.json),
        Err(error) => {
            report_partial(&error, args.json);
            Err(error.to_string())
        }
    }
}

fn build_client(
    args: &ChatArgs,
    config: &CliConfig,
    replay: Option<&Path>,
) -> Result<ChatClient, String> {
    if let Some(path) = replay {
        let chunks = load_replay(path)?;
        let provider = ScriptedProvider::from_chunks(chunks).with_id("replay");
        return ChatClient::with_provider(std::sync::Arc::new(provider), config.client.clone())
            .map_err(|error| error.to_string());
    }

    let mut settings = config.provider.clone();
    if let Some(provider) = args.provider.as_deref() {
        if !provider.trim().eq_ignore_ascii_case(settings.provider.trim()) {
            settings.api_key = crate::config::default_key_env(provider)
                .and_then(|key| std::env::var(key).ok())
                .filter(|value| !value.trim().is_empty());
            settings.base_url = None;
        }
        settings.provider = provider.to_string();
    }
    if let Some(base_url) = args.base_url.as_deref() {
        settings.base_url = Some(base_url.to_string());
    }
    ChatClient::from_settings(settings, config.client.clone()).map_err(|error| error.to_string())
}

fn build_messages(system: Option<&str>, prompt: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    if let Some(system) = system.map(str::trim).filter(|value| !value.is_empty()) {
        messages.push(ChatMessage::system(system));
    }
    messages.push(ChatMessage::user(prompt));
    messages
}

fn load_tools(path: &Path) -> Result<Vec<Tool>, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|error| format!("read {} failed: {error}", path.display()))?;
    serde_json::from_str(&content)
        .map_err(|error| format!("parse tools {} failed: {error}", path.display()))
}

fn load_replay(path: &Path) -> Result<Vec<Chunk>, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|error| format!("read {} failed: {error}", path.display()))?;
    serde_json::from_str(&content)
        .map_err(|error| format!("parse replay {} failed: {error}", path.display()))
}

fn print_response(response: &AssembledResponse, json: bool) -> Result<(), String> {
    if json {
        let rendered = serde_json::to_string_pretty(response)
            .map_err(|error| format!("serialize response failed: {error}"))?;
        println!("{rendered}");
        return Ok(());
    }

    if !response.content.is_empty() && !response.content.ends_with('\n') {
        println!();
    }
    if response.has_tool_calls() {
        let rendered = serde_json::to_string_pretty(&response.tool_calls)
            .map_err(|error| format!("serialize tool calls failed: {error}"))?;
        println!("{rendered}");
    }
    if let Some(finish_reason) = response
        .metadata_value("finishReason")
        .and_then(|value| value.as_str())
    {
        eprintln!("[finish: {finish_reason}]");
    }
    Ok(())
}

fn report_partial(error: &ChatError, json: bool) {
    let Some(partial) = error.partial.as_ref() else {
        return;
    };
    if json {
        if let Ok(rendered) = serde_json::to_string_pretty(partial) {
            println!("{rendered}");
        }
        return;
    }
    if !partial.content.is_empty() {
        println!();
    }
    eprintln!(
        "[partial: {} chars, {} tool calls]",
        partial.content.len(),
        partial.tool_calls.len()
    );
}
