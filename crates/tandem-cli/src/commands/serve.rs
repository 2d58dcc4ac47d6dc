//! Serve command: start one rank of the pool
//!
//! Rank 0 binds the listener, waits for every worker, then runs a line based
//! chat console. Other ranks dial the primary and follow its requests until
//! it disconnects.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Args;
use console::style;
use futures::StreamExt;
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

use tandem_core::{
    broadcast::BroadcastChannel,
    config::TandemConfig,
    engine::{ChatUpdate, Primary, SamplingParams, Worker},
    generation::GenerationLoop,
    model,
    relay::CloseReason,
    runtime::{self, ProcessContext},
    session::{ChatSession, PromptTemplate},
    shard::ShardManifest,
    sync::RequestSynchronizer,
    tokenizer::Tokenizer,
    transport::{TcpTransport, Transport, PRIMARY_RANK},
};

use crate::backend::{self, HfTokenizer};
use crate::commands::Command;
use crate::config::Overrides;
use crate::utils::{create_spinner, format_duration, print_output, print_warning, unprinted_suffix};

#[derive(Args, Debug)]
pub struct ServeCommand {
    #[command(flatten)]
    pub overrides: Overrides,
}

#[async_trait]
impl Command for ServeCommand {
    fn apply_overrides(&self, config: &mut TandemConfig) {
        self.overrides.apply(config);
    }

    async fn execute(&self, config: &TandemConfig, json_output: bool) -> Result<()> {
        config.validate().context("Invalid configuration")?;

        let ctx = runtime::init(ProcessContext {
            rank: config.cluster.rank,
            world_size: config.cluster.world_size,
            seed: config.model.seed,
        })?;

        let manifest = ShardManifest::discover(
            &config.model.checkpoint_dir,
            &config.model.shard_extension,
            ctx.world_size,
        )?;
        let preamble = config.chat.resolve_preamble()?;
        let fingerprint = config.fingerprint(&preamble);

        let spinner = (ctx.is_primary() && !json_output).then(|| create_spinner("Loading model shard..."));
        let started = Instant::now();
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(HfTokenizer::from_file(&config.model.tokenizer_path)?);
        let loader = backend::model_loader()?;
        let shard = loader.load_sharded(&manifest, ctx.rank, ctx.world_size, &config.model)?;
        if let Some(spinner) = &spinner {
            spinner.set_message("Waiting for the pool...");
        }

        let transport = connect(config).await?;
        if let Some(spinner) = spinner {
            spinner.finish_with_message(format!(
                "Pool of {} ready in {}",
                ctx.world_size,
                format_duration(started.elapsed())
            ));
        }

        let channel = BroadcastChannel::new(transport, config.sync.payload_capacity, config.sync.timeout());
        let synchronizer = RequestSynchronizer::new(
            channel,
            Arc::clone(&tokenizer),
            &config.sync,
            config.chat.stop_marker.clone(),
        );
        let generator = GenerationLoop::new(model::shared(shard), tokenizer, config.model.max_seq_len);

        if ctx.is_primary() {
            let template = PromptTemplate {
                preamble,
                user_tag: config.chat.user_tag.clone(),
                assistant_tag: config.chat.assistant_tag.clone(),
            };
            let primary = Primary::new(synchronizer, generator, template.clone(), config.chat.history_length);
            primary.start(ctx.seed, fingerprint).await?;

            let session = ChatSession::new(template, config.chat.history_length);
            run_console(&primary, session, SamplingParams::from_config(&config.chat), json_output).await
        } else {
            let worker = Worker::new(synchronizer, generator);
            worker.start(ctx.seed, fingerprint).await?;
            let served = worker.serve().await?;
            info!(served, "Worker finished");
            Ok(())
        }
    }
}

async fn connect(config: &TandemConfig) -> Result<Arc<dyn Transport>> {
    let cluster = &config.cluster;
    let timeout = Duration::from_millis(cluster.connect_timeout_ms);

    let transport = if cluster.rank == PRIMARY_RANK {
        let pending = TcpTransport::bind(&cluster.primary_addr).await?;
        info!(addr = %pending.local_addr()?, workers = cluster.world_size - 1, "Waiting for workers");
        pending.accept(cluster.world_size, timeout).await?
    } else {
        TcpTransport::connect(cluster.rank, cluster.world_size, &cluster.primary_addr, timeout).await?
    };
    Ok(Arc::new(transport))
}

/// Read user lines from stdin and stream each reply to stdout
async fn run_console(
    primary: &Primary,
    mut session: ChatSession,
    params: SamplingParams,
    json_output: bool,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    if !json_output {
        println!(
            "{} Type a message; {} resets the conversation, {} exits.",
            style("Ready.").green().bold(),
            style("/clear").cyan(),
            style("/quit").cyan()
        );
    }

    loop {
        if !json_output {
            print!("{} ", style("You:").bold());
            std::io::stdout().flush()?;
        }
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let message = line.trim();
        match message {
            "" => continue,
            "/quit" | "/exit" => break,
            "/clear" => {
                session.clear();
                debug!("Conversation cleared");
                continue;
            }
            _ => {}
        }

        session.push_user(message);
        let stream = match primary.generate(session.turns().to_vec(), params).await {
            Ok(stream) => stream,
            Err(e) if e.is_request_scoped() => {
                session.abandon_pending();
                print_warning(&e.to_string());
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let last = if json_output {
            stream.fold(None, |_, update| async move { Some(update) }).await
        } else {
            stream_reply(stream, session.template().assistant_tag.as_str()).await?
        };

        if let Some(update) = last {
            if json_output {
                print_output(&reply_json(&update), true)?;
            } else {
                report_close(&update);
            }
            session.commit(update.transcript);
        }
    }

    info!("Console closed");
    Ok(())
}

async fn stream_reply(
    mut stream: tandem_core::engine::ChatStream,
    assistant_tag: &str,
) -> Result<Option<ChatUpdate>> {
    let mut stdout = std::io::stdout();
    let mut printed = String::new();
    let mut last = None;

    write!(stdout, "{} ", style(assistant_tag.trim_start_matches('#').trim()).bold())?;
    while let Some(update) = stream.next().await {
        if let Some(suffix) = unprinted_suffix(&printed, update.reply()) {
            write!(stdout, "{suffix}")?;
            stdout.flush()?;
            printed = update.reply().to_string();
        }
        last = Some(update);
    }
    writeln!(stdout)?;
    Ok(last)
}

fn report_close(update: &ChatUpdate) {
    if let Some(notice) = update.truncated {
        print_warning(&format!(
            "prompt was {} tokens and was cut to the first {}; older context was lost",
            notice.encoded_len, notice.capacity
        ));
    }
    if let Some(CloseReason::Aborted { code, message }) = &update.finished {
        print_warning(&format!("reply aborted ({code}): {message}"));
    }
}

fn reply_json(update: &ChatUpdate) -> serde_json::Value {
    let finished = match &update.finished {
        Some(CloseReason::Finished(reason)) => json!({ "finish_reason": reason }),
        Some(CloseReason::Aborted { code, message }) => json!({ "aborted": { "code": code, "message": message } }),
        None => serde_json::Value::Null,
    };
    json!({
        "reply": update.reply(),
        "finished": finished,
        "truncated": update.truncated.map(|n| json!({
            "encoded_len": n.encoded_len,
            "capacity": n.capacity,
        })),
    })
}
