//! Cowork 命令行入口
//!
//! `cowork [--conversation ID] [--config PATH] [--working-dir DIR] <request...>`
//! 每个 StreamEvent 作为一行 JSON 输出到 stdout；日志走 stderr；Ctrl+C 取消当前会话。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use cowork::agents::{LlmAgentBackend, LlmDirectResponder};
use cowork::config::{load_config, AppConfig, CoworkSettings};
use cowork::core::SessionSupervisor;
use cowork::llm::{create_llm_from_config, LlmClient, Message};
use cowork::{CoworkEngine, CoworkRequest, RunOutcome};

struct CliArgs {
    conversation_id: Option<String>,
    config_path: Option<PathBuf>,
    working_dir: Option<PathBuf>,
    request: String,
}

fn parse_args() -> anyhow::Result<CliArgs> {
    let mut conversation_id = None;
    let mut config_path = None;
    let mut working_dir = None;
    let mut words = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--conversation" => {
                conversation_id = Some(args.next().context("--conversation needs a value")?)
            }
            "--config" => {
                config_path = Some(PathBuf::from(args.next().context("--config needs a value")?))
            }
            "--working-dir" => {
                working_dir = Some(PathBuf::from(
                    args.next().context("--working-dir needs a value")?,
                ))
            }
            _ => words.push(arg),
        }
    }

    if words.is_empty() {
        bail!("usage: cowork [--conversation ID] [--config PATH] [--working-dir DIR] <request...>");
    }
    Ok(CliArgs {
        conversation_id,
        config_path,
        working_dir,
        request: words.join(" "),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cowork::observability::init();
    let args = parse_args()?;

    let cfg = match load_config(args.config_path.clone()) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            AppConfig::default()
        }
    };
    let settings = CoworkSettings::from_config(&cfg);
    let llm = create_llm_from_config(&cfg);
    let stream_timeout = Duration::from_secs(cfg.llm.timeouts.stream);

    let engine = Arc::new(CoworkEngine::new(
        Arc::clone(&llm),
        Arc::new(LlmAgentBackend::new(Arc::clone(&llm), settings.task_timeout)),
        Arc::new(LlmDirectResponder::new(Arc::clone(&llm), stream_timeout)),
        settings,
    ));

    let conversation_id = args
        .conversation_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut request = CoworkRequest::new(conversation_id, vec![Message::user(args.request)]);
    if let Some(dir) = args.working_dir {
        request = request.with_working_dir(dir);
    }

    let supervisor = SessionSupervisor::new();
    let ctrl_c = supervisor.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Ctrl+C received, cancelling");
            ctrl_c.cancel();
        }
    });

    let (mut rx, handle) = engine.spawn(request, supervisor.cancel_token());
    while let Some(event) = rx.recv().await {
        let line = serde_json::to_string(&event).context("Failed to encode event")?;
        println!("{}", line);
    }

    let outcome = handle.await.context("Cowork task panicked")?;
    let (prompt, completion, total) = llm.token_usage();
    tracing::info!(prompt, completion, total, "LLM token usage");

    match outcome {
        RunOutcome::Failed { message } => bail!("cowork run failed: {}", message),
        _ => Ok(()),
    }
}
