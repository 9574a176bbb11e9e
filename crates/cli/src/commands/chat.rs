//! `switchyard chat`: Interactive or single-message chat mode.

use std::io::Write;
use std::path::Path;

use switchyard_agent::{Agent, AgentBuilder, AgentStreamEvent};
use switchyard_config::AppConfig;
use switchyard_core::error::Error;
use switchyard_core::message::{InvocationOutcome, ToolCallMessage, ToolCallResultMessage};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::commands::config_cmd;
use crate::tools;

pub async fn run(
    config_path: Option<&Path>,
    message: Option<String>,
    stream: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config =
        config_cmd::load(config_path).map_err(|e| format!("Failed to load config: {e}"))?;

    // Local endpoints (Ollama, LM Studio) run without a key
    if !config.has_api_key() && !is_local(&config.provider.base_url) {
        print_key_help(config_path);
        return Err("No API key found. See above for setup instructions.".into());
    }

    let agent = AgentBuilder::from_config(&config)
        .tools(tools::builtin_registry())
        .build()?;

    // Ctrl+C cancels whatever turn is running and ends the session
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    match message {
        Some(msg) => {
            if !stream {
                eprint!("  Thinking...");
            }
            let result = turn(&agent, msg, stream, &cancel).await;
            if !stream {
                eprint!("\r              \r");
            }
            let reply = result?;
            if !stream {
                println!("{reply}");
            }
        }
        None => interactive(&agent, &config, stream, &cancel).await?,
    }

    Ok(())
}

async fn interactive(
    agent: &Agent,
    config: &AppConfig,
    stream: bool,
    cancel: &CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    println!();
    println!("  Switchyard: Interactive Mode");
    println!();
    println!("  Provider:  {} ({})", config.provider.name, config.provider.base_url);
    println!("  Model:     {}", config.provider.model);
    println!("  Tools:     {}", agent.tools().names().join(", "));
    println!();
    println!("  Type your message and press Enter.");
    println!("  '/clear' forgets the conversation, 'exit' or Ctrl+C quits.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        let input = line.trim();

        match input {
            "" => continue,
            "exit" | "quit" => break,
            "/clear" => {
                agent.clear_history().await;
                println!("  (history cleared)");
                println!();
                continue;
            }
            _ => {}
        }

        if !stream {
            eprint!("  ...");
        }
        let result = turn(agent, input.to_string(), stream, cancel).await;
        if !stream {
            eprint!("\r     \r");
        }

        match result {
            Ok(reply) => {
                if !stream {
                    println!();
                    for line in reply.lines() {
                        println!("  Assistant > {line}");
                    }
                }
                println!();
            }
            Err(Error::Cancelled) => break,
            Err(e) => {
                eprintln!("  [Error] {e}");
                println!();
            }
        }
    }

    println!();
    println!("  Goodbye!");
    println!();
    Ok(())
}

/// Run one turn and return the final reply text.
///
/// When streaming, text is written to stdout as it arrives and tool activity
/// is reported on stderr.
async fn turn(
    agent: &Agent,
    input: String,
    stream: bool,
    cancel: &CancellationToken,
) -> Result<String, Error> {
    if !stream {
        return agent
            .chat(input, cancel)
            .await
            .map(|reply| reply.content);
    }

    let mut events = agent.stream(input, cancel);
    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    let mut reply = String::new();

    while let Some(event) = events.recv().await {
        match event? {
            AgentStreamEvent::Chunk { content } => {
                let _ = write!(stdout, "{content}");
                let _ = stdout.flush();
            }
            AgentStreamEvent::ToolCalls { message } => {
                let _ = writeln!(stderr, "{}", describe_calls(&message));
            }
            AgentStreamEvent::ToolResults { message } => {
                let _ = writeln!(stderr, "{}", describe_results(&message));
            }
            AgentStreamEvent::Done { message } => {
                let _ = writeln!(stdout);
                reply = message.content;
            }
        }
    }

    Ok(reply)
}

fn describe_calls(message: &ToolCallMessage) -> String {
    message
        .invocations
        .iter()
        .map(|inv| {
            format!(
                "  [tool] {}({})",
                inv.tool_name,
                serde_json::Value::Object(inv.inputs.clone())
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn describe_results(message: &ToolCallResultMessage) -> String {
    message
        .invocations
        .iter()
        .map(|inv| match &inv.outcome {
            Some(InvocationOutcome::Success { result }) => {
                format!("  [tool] {} -> {result}", inv.tool_name)
            }
            Some(InvocationOutcome::Failed { error, .. }) => {
                format!("  [tool] {} failed: {error}", inv.tool_name)
            }
            None => format!("  [tool] {} -> (no outcome)", inv.tool_name),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_local(base_url: &str) -> bool {
    base_url.contains("://localhost") || base_url.contains("://127.0.0.1")
}

fn print_key_help(config_path: Option<&Path>) {
    eprintln!();
    eprintln!("  ERROR: No API key configured!");
    eprintln!();
    eprintln!("  Set one of these environment variables:");
    eprintln!("    export OPENROUTER_API_KEY='sk-or-v1-...'   (OpenRouter)");
    eprintln!("    export OPENAI_API_KEY='sk-...'             (OpenAI direct)");
    eprintln!("    export SWITCHYARD_API_KEY='sk-...'         (generic)");
    eprintln!();
    eprintln!("  Or add it to your config file:");
    eprintln!("    {}", config_cmd::config_path(config_path).display());
    eprintln!();
}
