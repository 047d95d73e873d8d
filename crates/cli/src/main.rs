//! Command-line client for the Quire gateway.

mod api_client;

use anyhow::{Context, Result};
use api_client::{ApiClient, InitUploadRequest, RequestError, StartTaskRequest, TaskOptions};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_SERVER: &str = "http://127.0.0.1:8080";
const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;
const MAX_RETRIES: u32 = 3;
const MAX_RECONNECTS: u32 = 5;

#[derive(Parser)]
#[command(name = "quire")]
#[command(about = "Client for the Quire upload and task gateway")]
#[command(version)]
struct Cli {
    /// Gateway base URL
    #[arg(long, global = true, env = "QUIRE_SERVER", default_value = DEFAULT_SERVER)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file in parallel chunks and print its input reference
    Upload {
        /// File to upload
        path: PathBuf,
        /// Chunk size in bytes
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: u64,
        /// MIME type (guessed from the extension when omitted)
        #[arg(long)]
        mime_type: Option<String>,
        /// Maximum chunks in flight (capped by the server's limit)
        #[arg(long)]
        parallel: Option<u32>,
        /// Resume an existing upload session, sending only missing chunks
        #[arg(long)]
        resume: Option<String>,
    },
    /// Show the state of an upload session
    UploadStatus { upload_id: String },
    /// Abort an upload session
    AbortUpload { upload_id: String },
    /// Start a generate task over one or more inputs
    Generate {
        /// Input references (`upload:<id>` or `task:<id>`)
        #[arg(required = true)]
        inputs: Vec<String>,
        #[arg(long)]
        instructions: Option<String>,
        /// Follow progress until the task finishes
        #[arg(long)]
        watch: bool,
    },
    /// Start a refine task over a single input
    Refine {
        /// Input reference (`upload:<id>` or `task:<id>`)
        input: String,
        #[arg(long)]
        passes: Option<u32>,
        #[arg(long)]
        instructions: Option<String>,
        /// Follow progress until the task finishes
        #[arg(long)]
        watch: bool,
    },
    /// Show a task's status
    Status { task_id: String },
    /// Print a completed task's output
    Output {
        task_id: String,
        /// Print the output as JSON sections
        #[arg(long)]
        sections: bool,
    },
    /// Stream a task's progress events, reconnecting if the connection drops
    Watch {
        task_id: String,
        /// First sequence number to show
        #[arg(long, default_value_t = 0)]
        from: u64,
    },
    /// Request cancellation of a task
    Cancel { task_id: String },
    /// Check server health and version
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let Cli { server, command } = Cli::parse();
    let client = ApiClient::new(&server)?;

    match command {
        Commands::Upload {
            path,
            chunk_size,
            mime_type,
            parallel,
            resume,
        } => handle_upload_command(&client, &path, chunk_size, mime_type, parallel, resume).await,
        Commands::UploadStatus { upload_id } => handle_upload_status(&client, &upload_id).await,
        Commands::AbortUpload { upload_id } => {
            client.abort_upload(&upload_id).await?;
            println!("Aborted upload {upload_id}");
            Ok(())
        }
        Commands::Generate {
            inputs,
            instructions,
            watch,
        } => {
            let req = StartTaskRequest {
                input_refs: inputs,
                options: TaskOptions {
                    instructions,
                    passes: None,
                },
            };
            let started = client.start_generate(req).await?;
            handle_started_task(&client, &started.task_id, watch).await
        }
        Commands::Refine {
            input,
            passes,
            instructions,
            watch,
        } => {
            let req = StartTaskRequest {
                input_refs: vec![input],
                options: TaskOptions {
                    instructions,
                    passes,
                },
            };
            let started = client.start_refine(req).await?;
            handle_started_task(&client, &started.task_id, watch).await
        }
        Commands::Status { task_id } => handle_status_command(&client, &task_id).await,
        Commands::Output { task_id, sections } => {
            handle_output_command(&client, &task_id, sections).await
        }
        Commands::Watch { task_id, from } => {
            let stage = watch_task(&client, &task_id, from).await?;
            finish_with_stage(&stage)
        }
        Commands::Cancel { task_id } => {
            let response = client.cancel_task(&task_id).await?;
            println!("Cancellation accepted: {}", response.accepted);
            println!("Stage: {}", response.stage);
            Ok(())
        }
        Commands::Health => handle_health_command(&client).await,
    }
}

// =============================================================================
// Uploads
// =============================================================================

/// Byte ranges for each chunk of a `len`-byte file split at `chunk_size`.
fn chunk_ranges(len: u64, chunk_size: u64) -> Vec<Range<u64>> {
    if chunk_size == 0 {
        return Vec::new();
    }
    (0..len.div_ceil(chunk_size))
        .map(|i| {
            let start = i * chunk_size;
            start..(start + chunk_size).min(len)
        })
        .collect()
}

fn guess_mime_type(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_string()
}

async fn handle_upload_command(
    client: &ApiClient,
    path: &Path,
    chunk_size: u64,
    mime_type: Option<String>,
    parallel: Option<u32>,
    resume: Option<String>,
) -> Result<()> {
    if chunk_size == 0 {
        anyhow::bail!("--chunk-size must be greater than zero");
    }
    let data = Bytes::from(
        tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?,
    );
    if data.is_empty() {
        anyhow::bail!("cannot upload an empty file");
    }
    let ranges = chunk_ranges(data.len() as u64, chunk_size);
    let total_chunks = u32::try_from(ranges.len()).context("file has too many chunks")?;

    let (upload_id, server_parallel, pending) = match resume {
        Some(upload_id) => {
            let status = client.upload_status(&upload_id).await?;
            if status.total_chunks != total_chunks {
                anyhow::bail!(
                    "upload {upload_id} expects {} chunks but {} splits into {total_chunks}; \
                     use the original --chunk-size",
                    status.total_chunks,
                    path.display()
                );
            }
            println!(
                "Resuming upload {upload_id}: {} of {} chunks already received",
                status.received_count, status.total_chunks
            );
            let capabilities = client.capabilities().await?;
            (
                upload_id,
                capabilities.max_parallel_chunks,
                status.missing_chunks,
            )
        }
        None => {
            let filename = path
                .file_name()
                .and_then(|name| name.to_str())
                .context("file name is not valid UTF-8")?
                .to_string();
            let req = InitUploadRequest {
                filename,
                file_size: i64::try_from(data.len()).context("file too large")?,
                file_type: mime_type.unwrap_or_else(|| guess_mime_type(path)),
                total_chunks: i64::from(total_chunks),
            };
            let init = client.init_upload(req).await?;
            println!("Created upload {} ({total_chunks} chunks)", init.upload_id);
            (init.upload_id, init.max_parallel_chunks, (0..total_chunks).collect())
        }
    };

    let limit = parallel
        .unwrap_or(server_parallel)
        .min(server_parallel)
        .max(1) as usize;
    upload_chunks(client, &upload_id, &data, &ranges, &pending, limit).await?;

    let completed = client.complete_upload(&upload_id).await?;
    let artifact = completed.artifact_ref;
    println!("Upload complete");
    println!("  File: {} ({})", artifact.filename, artifact.mime_type);
    println!("  Size: {}", format_bytes(artifact.size));
    println!("  SHA-256: {}", artifact.sha256);
    println!("  Input ref: upload:{}", completed.upload_id);
    Ok(())
}

async fn upload_chunks(
    client: &ApiClient,
    upload_id: &str,
    data: &Bytes,
    ranges: &[Range<u64>],
    pending: &[u32],
    limit: usize,
) -> Result<()> {
    let mut in_flight = FuturesUnordered::new();
    let mut sent = 0usize;

    for &index in pending {
        let range = ranges
            .get(index as usize)
            .with_context(|| format!("server reported unknown chunk {index}"))?;
        let chunk = data.slice(range.start as usize..range.end as usize);
        in_flight.push(send_chunk_with_retry(client, upload_id, index, chunk));

        if in_flight.len() >= limit
            && let Some(result) = in_flight.next().await
        {
            result?;
            sent += 1;
        }
    }

    while let Some(result) = in_flight.next().await {
        result?;
        sent += 1;
    }

    tracing::debug!(upload_id, sent, "chunks uploaded");
    Ok(())
}

/// Upload one chunk, retrying transport failures and retryable statuses.
///
/// A `duplicate_chunk` rejection means an earlier attempt already landed, so
/// it counts as success.
async fn send_chunk_with_retry(
    client: &ApiClient,
    upload_id: &str,
    index: u32,
    chunk: Bytes,
) -> Result<()> {
    let mut attempt = 0;
    loop {
        let err = match client.upload_chunk(upload_id, index, chunk.clone()).await {
            Ok(receipt) => {
                tracing::debug!(
                    index,
                    received = receipt.received_count,
                    total = receipt.total_chunks,
                    "chunk accepted"
                );
                return Ok(());
            }
            Err(err) => err,
        };

        let retryable = match err.downcast_ref::<RequestError>() {
            Some(request) if request.code == "duplicate_chunk" => {
                tracing::debug!(index, "chunk already received");
                return Ok(());
            }
            Some(request) => request.is_retryable(),
            None => err.downcast_ref::<reqwest::Error>().is_some(),
        };

        attempt += 1;
        if !retryable || attempt > MAX_RETRIES {
            return Err(err.context(format!("chunk {index} upload failed")));
        }
        let delay = backoff_delay(attempt);
        eprintln!(
            "  Chunk {index} failed ({err}), retrying in {}s...",
            delay.as_secs()
        );
        tokio::time::sleep(delay).await;
    }
}

/// 1s, 2s, 4s, ...
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1 << attempt.saturating_sub(1).min(5))
}

async fn handle_upload_status(client: &ApiClient, upload_id: &str) -> Result<()> {
    let status = client.upload_status(upload_id).await?;
    println!("Upload: {}", status.upload_id);
    println!("File: {}", status.filename);
    println!("State: {}", status.state);
    println!(
        "Chunks: {} of {} received",
        status.received_count, status.total_chunks
    );
    if !status.missing_chunks.is_empty() {
        println!("Missing: {}", format_indices(&status.missing_chunks));
    }
    if let Some(artifact) = status.artifact_ref {
        println!("Size: {}", format_bytes(artifact.size));
        println!("SHA-256: {}", artifact.sha256);
    }
    if let Some(reason) = status.reason {
        println!("Reason: {reason}");
    }
    Ok(())
}

/// Render chunk indices compactly, collapsing consecutive runs.
fn format_indices(indices: &[u32]) -> String {
    let mut parts = Vec::new();
    let mut iter = indices.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{start}-{end}"));
        }
    }
    parts.join(",")
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

// =============================================================================
// Tasks
// =============================================================================

async fn handle_started_task(client: &ApiClient, task_id: &str, watch: bool) -> Result<()> {
    println!("Started task {task_id}");
    if !watch {
        println!("Follow with: quire watch {task_id}");
        return Ok(());
    }
    let stage = watch_task(client, task_id, 0).await?;
    if stage == "completed" {
        println!("Output ref: task:{task_id}");
    }
    finish_with_stage(&stage)
}

async fn handle_status_command(client: &ApiClient, task_id: &str) -> Result<()> {
    let status = client.task_status(task_id).await?;
    println!("Task: {}", status.task_id);
    println!("Kind: {}", status.kind);
    println!("Stage: {}", status.stage);
    println!("Progress: {}%", status.progress_percent);
    println!("Message: {}", status.message);
    if status.attempt > 0 {
        println!("Attempt: {}", status.attempt);
    }
    if let Some(reason) = status.reason {
        println!("Reason: {reason}");
    }
    if let Some(output_ref) = status.output_ref {
        println!("Output: {output_ref}");
    }
    Ok(())
}

async fn handle_output_command(client: &ApiClient, task_id: &str, sections: bool) -> Result<()> {
    let output = client.task_output(task_id).await?;
    if sections {
        for section in &output.sections {
            println!("--- {} ---", section.source);
            println!("{}", section.content);
        }
    } else {
        println!("{}", output.content);
    }
    Ok(())
}

/// Follow the event stream to a terminal event and return its stage.
///
/// When the connection drops before a terminal event, reconnect from one
/// past the last sequence seen so nothing is skipped or repeated.
async fn watch_task(client: &ApiClient, task_id: &str, from: u64) -> Result<String> {
    let mut next = from;
    let mut reconnects = 0;

    loop {
        let interrupted = match client.events(task_id, next).await {
            Ok(events) => {
                let mut events = std::pin::pin!(events);
                let mut interrupted = None;
                while let Some(event) = events.next().await {
                    match event {
                        Ok(event) => {
                            reconnects = 0;
                            next = event.sequence + 1;
                            print_event(&event);
                            if event.is_terminal() {
                                return Ok(event.stage);
                            }
                        }
                        Err(err) => {
                            interrupted = Some(err);
                            break;
                        }
                    }
                }
                interrupted.unwrap_or_else(|| anyhow::anyhow!("event stream closed"))
            }
            Err(err) => {
                let fatal = matches!(
                    err.downcast_ref::<RequestError>(),
                    Some(request) if !request.is_retryable()
                );
                if fatal {
                    return Err(err);
                }
                err
            }
        };

        reconnects += 1;
        if reconnects > MAX_RECONNECTS {
            return Err(interrupted.context("gave up reconnecting to event stream"));
        }
        let delay = backoff_delay(reconnects);
        tracing::warn!(
            error = %interrupted,
            from_sequence = next,
            "event stream interrupted, reconnecting in {}s",
            delay.as_secs()
        );
        tokio::time::sleep(delay).await;
    }
}

fn print_event(event: &api_client::ProgressEvent) {
    let mut line = format!(
        "[{:>3}%] #{} {}: {}",
        event.progress_percent, event.sequence, event.stage, event.message
    );
    if event.attempt > 1 {
        line.push_str(&format!(" (attempt {})", event.attempt));
    }
    if let Some(reason) = &event.reason {
        line.push_str(&format!(" - {reason}"));
    }
    println!("{line}");
}

fn finish_with_stage(stage: &str) -> Result<()> {
    match stage {
        "completed" => Ok(()),
        other => anyhow::bail!("task finished as {other}"),
    }
}

async fn handle_health_command(client: &ApiClient) -> Result<()> {
    let health = client.health().await?;
    println!("Status: {}", health.status);
    println!("Server version: {}", health.version);
    println!("Client version: {}", env!("CARGO_PKG_VERSION"));

    if health.version != env!("CARGO_PKG_VERSION") {
        eprintln!(
            "Warning: version mismatch (server: {}, client: {})",
            health.version,
            env!("CARGO_PKG_VERSION")
        );
    }

    let caps = client.capabilities().await?;
    println!("API version: {}", caps.api_version);
    println!("Max chunk size: {}", format_bytes(caps.max_chunk_body_size));
    println!("Max parallel chunks: {}", caps.max_parallel_chunks);
    println!(
        "Task retries: {} attempts, {}ms initial backoff (x{}, max {}ms)",
        caps.retry.max_attempts,
        caps.retry.initial_backoff_ms,
        caps.retry.backoff_multiplier,
        caps.retry.max_backoff_ms
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_ranges_cover_file() {
        assert_eq!(chunk_ranges(10, 4), vec![0..4, 4..8, 8..10]);
        assert_eq!(chunk_ranges(8, 4), vec![0..4, 4..8]);
        assert_eq!(chunk_ranges(3, 4), vec![0..3]);
        assert!(chunk_ranges(0, 4).is_empty());
        assert!(chunk_ranges(10, 0).is_empty());
    }

    #[test]
    fn format_indices_collapses_runs() {
        assert_eq!(format_indices(&[0, 1, 2, 5, 7, 8]), "0-2,5,7-8");
        assert_eq!(format_indices(&[3]), "3");
        assert_eq!(format_indices(&[]), "");
    }

    #[test]
    fn backoff_doubles() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(40), Duration::from_secs(32));
    }

    #[test]
    fn mime_type_guessed_from_extension() {
        assert_eq!(guess_mime_type(Path::new("notes.txt")), "text/plain");
        assert_eq!(guess_mime_type(Path::new("report.pdf")), "application/pdf");
        assert_eq!(
            guess_mime_type(Path::new("blob")),
            "application/octet-stream"
        );
    }

    #[test]
    fn finish_reports_non_completed_stage() {
        assert!(finish_with_stage("completed").is_ok());
        let err = finish_with_stage("cancelled").unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[test]
    fn cli_parses_commands() {
        let cli = Cli::try_parse_from([
            "quire",
            "--server",
            "http://example.test",
            "refine",
            "task:abc",
            "--passes",
            "2",
        ])
        .unwrap();
        assert_eq!(cli.server, "http://example.test");
        assert!(matches!(
            cli.command,
            Commands::Refine {
                passes: Some(2),
                ..
            }
        ));

        assert!(Cli::try_parse_from(["quire", "generate"]).is_err());
    }
}
