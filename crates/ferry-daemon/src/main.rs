mod commands;
mod notifier;
mod runtime;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::Result;
use tokio::io::{AsyncBufReadExt, BufReader};

use ferry_core::format::status_message;
use ferry_core::progress::{ProgressReporter, ProgressSender};
use ferry_core::sink::OutboxSink;
use ferry_core::source::LocalSourceProvider;
use ferry_core::{Context, TransferManager, TransferOrchestrator};

use crate::commands::{Command, HELP, WELCOME};
use crate::notifier::ConsoleNotifier;
use crate::runtime::{load_runtime, DaemonArgs, Operator};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = DaemonArgs::parse();
    let runtime = load_runtime(&args)?;
    for warning in &runtime.warnings {
        log::warn!("{warning}");
    }

    let (progress, events) = ProgressSender::channel();
    let reporter = ProgressReporter::new(
        Arc::new(ConsoleNotifier::new(!args.no_progress)),
        runtime.pipeline.progress_interval,
    )
    .spawn(events);

    let ctx = Context::new(
        runtime.pipeline.clone(),
        Arc::new(LocalSourceProvider::new(&runtime.source_root)),
        Arc::new(OutboxSink::new(&runtime.outbox, runtime.pipeline.sink_limit)),
        progress,
    )?;
    ctx.source.login().await?;
    let manager = TransferManager::new(TransferOrchestrator::new(Arc::new(ctx)));

    let resumed = manager.resume_interrupted().await?;
    if !resumed.is_empty() {
        log::info!("resumed {} interrupted request(s)", resumed.len());
    }

    println!(
        "ferry ready: serving {} into {}",
        runtime.source_root.display(),
        runtime.outbox.display()
    );
    println!("{WELCOME}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                log::info!("interrupt received, shutting down");
                break;
            }
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => {
                    if let Some(reply) = dispatch(&manager, runtime.operator, &line).await {
                        println!("{reply}");
                    }
                }
                None => {
                    log::info!("stdin closed; running until interrupted");
                    stdin_open = false;
                }
            },
        }
    }

    manager.shutdown().await;
    drop(manager);
    if tokio::time::timeout(Duration::from_secs(5), reporter).await.is_err() {
        log::warn!("progress reporter did not drain in time");
    }
    Ok(())
}

async fn dispatch(manager: &TransferManager, operator: Operator, line: &str) -> Option<String> {
    let reply = match Command::parse(line) {
        Command::Empty => return None,
        Command::Start => WELCOME.to_string(),
        Command::Help => HELP.to_string(),
        Command::Usage(usage) => usage.to_string(),
        Command::Unknown(_) => {
            "❓ Unknown command. Send a folder link or /help for usage.".to_string()
        }
        Command::Download(link) => {
            match manager
                .start(operator.owner, operator.destination, &link)
                .await
            {
                Ok(request) => format!(
                    "✅ Download #{} queued: {} ({} files)",
                    request.id, request.name, request.total_files
                ),
                Err(err) => format!("❌ {err}"),
            }
        }
        Command::Status => match manager.status(operator.owner).await {
            Ok(requests) => status_message(&requests),
            Err(err) => format!("❌ {err}"),
        },
        Command::Cancel(id) => match manager.cancel(operator.owner, id).await {
            Ok(id) => format!("🛑 Cancelling download #{id}"),
            Err(err) => format!("❌ {err}"),
        },
        Command::Resume(id) => match manager.resume(operator.owner, id).await {
            Ok(request) => format!(
                "▶️ Resuming download #{} from chunk {}",
                request.id,
                request.current_chunk + 1
            ),
            Err(err) => format!("❌ {err}"),
        },
    };
    Some(reply)
}
