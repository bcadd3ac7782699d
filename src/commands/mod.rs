//! Verb handlers of the command front.

pub(crate) mod metrics;
mod parsing;

use std::io;
use std::sync::Arc;

use futures::StreamExt;
use inference_protocol::{response_data, response_err, response_ok, CommandHeader, FinishChunk, OpCode};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{KernelConfig, ModelConfig};
use crate::container::{LoadOutcome, ModelContainer};
use crate::errors::{KernelError, KernelResult};
use crate::generation::Generator;
use crate::templating::RenderOptions;
use crate::tools::ToolCallPipeline;

use self::metrics::{inc_cancelled_streams, inc_generations_started, log_event, record_command, snapshot_metrics};
use self::parsing::{
    is_force_flag, parse_json_payload, parse_model_name, sampling_from_params, ChatPayload, GeneratePayload,
};

/// Everything a connection needs to serve commands.
pub struct KernelServices {
    pub config: KernelConfig,
    pub container: Arc<ModelContainer>,
    pub generator: Generator,
    /// Cancelled on shutdown; every request token is a child of it.
    pub shutdown: CancellationToken,
}

impl KernelServices {
    pub fn new(config: KernelConfig, container: Arc<ModelContainer>, generator: Generator) -> Self {
        Self {
            config,
            container,
            generator,
            shutdown: CancellationToken::new(),
        }
    }
}

/// Runs one command and writes its reply. Only write failures are returned.
pub async fn execute_command<W>(
    out: &mut W,
    header: CommandHeader,
    payload: Vec<u8>,
    services: &KernelServices,
    client_id: usize,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    debug!(client_id, opcode = header.opcode.as_str(), tag = %header.tag, len = payload.len(), "command");

    let result = match header.opcode {
        OpCode::Ping => Ok(response_ok("PING", "PONG")),
        OpCode::Load => handle_load(services, &payload).await,
        OpCode::Unload => handle_unload(services, &payload).await,
        OpCode::Generate => handle_generate(services, &payload).await,
        OpCode::Stream => return handle_stream(out, services, &payload, &header.tag, client_id).await,
        OpCode::Chat => handle_chat(services, &payload).await,
        OpCode::Status => Ok(handle_status(services).await),
    };

    let response = match result {
        Ok(bytes) => {
            record_command(true);
            bytes
        }
        Err(err) => {
            record_command(false);
            log_event("command_failed", client_id, Some(&header.tag), &err.to_string());
            response_err(err.code(), &err.to_string())
        }
    };
    out.write_all(&response).await?;
    out.flush().await
}

async fn handle_load(services: &KernelServices, payload: &[u8]) -> KernelResult<Vec<u8>> {
    let model_name = parse_model_name(payload).or_else(|| services.config.model.model_name.clone());
    let config = ModelConfig {
        model_name,
        ..services.config.model.clone()
    };

    let shutdown = services.shutdown.clone();
    let progress = Box::new(move |fraction: f32| {
        debug!(progress = fraction, "model load progress");
        !shutdown.is_cancelled()
    });

    match services.container.load_model(&config, progress).await? {
        LoadOutcome::Loaded => {
            let name = config.model_name.unwrap_or_default();
            Ok(response_ok("LOAD", &format!("Loaded model '{}'", name)))
        }
        LoadOutcome::Aborted => Ok(response_ok("LOAD_ABORTED", "Model load aborted")),
    }
}

async fn handle_unload(services: &KernelServices, payload: &[u8]) -> KernelResult<Vec<u8>> {
    let force = is_force_flag(payload);
    services.container.unload_model(force).await?;
    Ok(response_ok("UNLOAD", if force { "Model unloaded (forced)" } else { "Model unloaded" }))
}

fn finish_frame(finish: &FinishChunk) -> KernelResult<Vec<u8>> {
    let body = serde_json::to_vec(finish).map_err(|e| KernelError::InvalidRequest(e.to_string()))?;
    Ok(response_data("finish", &body))
}

async fn handle_generate(services: &KernelServices, payload: &[u8]) -> KernelResult<Vec<u8>> {
    let request: GeneratePayload = parse_json_payload("GEN", payload)?;
    let config = sampling_from_params(request.params, &services.config.sampling.overrides)?;

    inc_generations_started();
    let finish = services
        .generator
        .generate_once(request.prompt, config, services.shutdown.child_token())
        .await?;
    finish_frame(&finish)
}

/// One `DATA` frame per chunk. A failed write cancels the generation.
async fn handle_stream<W>(
    out: &mut W,
    services: &KernelServices,
    payload: &[u8],
    tag: &str,
    client_id: usize,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let setup = parse_json_payload::<GeneratePayload>("STREAM", payload).and_then(|request| {
        let config = sampling_from_params(request.params, &services.config.sampling.overrides)?;
        Ok((request.prompt, config))
    });
    let (prompt, config) = match setup {
        Ok(setup) => setup,
        Err(err) => {
            record_command(false);
            return out.write_all(&response_err(err.code(), &err.to_string())).await;
        }
    };

    inc_generations_started();
    let cancel = services.shutdown.child_token();
    let mut stream = services.generator.generate_stream(prompt, config, cancel.clone());

    while let Some(chunk) = stream.next().await {
        let frame = match chunk {
            Ok(chunk) => {
                let kind = if chunk.is_finish() { "finish" } else { "data" };
                match serde_json::to_vec(&chunk) {
                    Ok(body) => response_data(kind, &body),
                    Err(e) => response_err("INVALID_REQUEST", &e.to_string()),
                }
            }
            Err(err) => {
                record_command(false);
                log_event("stream_failed", client_id, Some(tag), &err.to_string());
                response_err(err.code(), &err.to_string())
            }
        };

        if let Err(e) = out.write_all(&frame).await {
            cancel.cancel();
            inc_cancelled_streams();
            log_event("stream_cancelled", client_id, Some(tag), "client write failed");
            return Err(e);
        }
    }

    record_command(true);
    out.flush().await
}

async fn handle_chat(services: &KernelServices, payload: &[u8]) -> KernelResult<Vec<u8>> {
    let request: ChatPayload = parse_json_payload("CHAT", payload)?;
    let mut config = sampling_from_params(request.params, &services.config.sampling.overrides)?;

    let (prompt, marker) = {
        let model = services.container.current().await.ok_or(KernelError::NoModelLoaded)?;
        let template = model
            .template()
            .ok_or_else(|| KernelError::Template(format!("no chat template for model '{}'", model.name())))?;

        let eos_token = if config.ban_eos_token { "" } else { model.tokens().eos_piece() };
        let prompt = template.render(
            &request.messages,
            &RenderOptions {
                add_generation_prompt: request.add_generation_prompt,
                bos_token: model.tokens().bos_piece(),
                eos_token,
                tools: &config.tools,
                template_vars: request.template_vars.as_ref(),
            },
        )?;

        for stop in &template.metadata().stop_strings {
            config.add_stop_string(stop);
        }
        (prompt, template.metadata().tool_start.clone())
    };

    inc_generations_started();
    let finish = ToolCallPipeline::new(&services.generator, marker)
        .run(&prompt, config, services.shutdown.child_token())
        .await?;
    finish_frame(&finish)
}

async fn handle_status(services: &KernelServices) -> Vec<u8> {
    let metrics = snapshot_metrics();
    let state = services.container.state().await;
    let model = services
        .container
        .current()
        .await
        .map(|m| format!("{} max_seq_len={}", m.name(), m.max_seq_len()))
        .unwrap_or_else(|| "-".to_string());

    response_ok(
        "STATUS",
        &format!(
            "uptime_s={} total_commands={} total_errors={} generations_started={} cancelled_streams={} state={} model={}",
            metrics.uptime_s,
            metrics.total_commands,
            metrics.total_errors,
            metrics.generations_started,
            metrics.cancelled_streams,
            state,
            model
        ),
    )
}
