use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand, ValueHint};
use futures::{StreamExt, stream::BoxStream};
use iocraft::prelude::*;
use resumable_upload::{
    AbortHandle, CallOptions, UploadClient, UploadEvent, UploadMetadata, UploadOutcome,
    UploadSource,
};
use serde_json::{Map, Value};
use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
};
use tokio::{io::AsyncReadExt, sync::watch};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use url::Url;

use crate::ui::{
    ConfigHeader, ErrorMessage, InputPrompt, ProgressBar, SessionStatus, SuccessMessage,
};

mod config;
mod ui;

const STDIN_READ_SIZE: usize = 64 * 1024;

#[derive(Parser)]
#[command(name = "rupload")]
#[command(version)]
#[command(about = "Resumable chunked uploads from the command line")]
struct Cli {
    /// Upload endpoint, overriding the configured one
    #[arg(short, long, global = true)]
    endpoint: Option<Url>,
    /// Bytes per chunk request
    #[arg(long, global = true)]
    chunk_size: Option<u64>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct PayloadArgs {
    /// File to upload, or `-` for stdin
    #[arg(value_hint = ValueHint::FilePath)]
    path: PathBuf,
    /// Name recorded in the session metadata (defaults to the file name)
    #[arg(short, long)]
    name: Option<String>,
    /// Declared size in bytes; required for stdin
    #[arg(short, long)]
    size: Option<u64>,
    /// MIME type of the payload
    #[arg(short = 't', long)]
    mime_type: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Open an upload session without sending data
    Create {
        #[command(flatten)]
        payload: PayloadArgs,
    },
    /// Show how many bytes a session has received
    Status {
        session: Url,
        /// Declared size of the payload, if known
        #[arg(short, long)]
        size: Option<u64>,
    },
    /// Upload a file or stdin
    Upload {
        #[command(flatten)]
        payload: PayloadArgs,
    },
    /// Continue an interrupted upload
    Resume {
        session: Url,
        #[command(flatten)]
        payload: PayloadArgs,
    },
    /// Patch session metadata with a JSON object (inline, or `@file`)
    Update { session: Url, patch: String },
    /// Delete an upload session
    Delete { session: Url },
    /// Store an auth token in the OS keyring
    SetToken { token: String },
    /// Configure rupload interactively
    Config,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let cli = Cli::parse();

    rt.block_on(async {
        match cli.command {
            Commands::Config => interactive_config(),
            Commands::SetToken { token } => config::set_token_keyring(token),
            command => {
                let config = config::read_config()?;
                debug!(authenticated = config.token.is_some(), "configuration loaded");

                let mut client_config = config.client;
                if let Some(chunk_size) = cli.chunk_size {
                    client_config.chunk_size = chunk_size;
                }
                let client = UploadClient::new(client_config)?;

                let endpoint = cli.endpoint.or(config.endpoint);
                let load_endpoint = || {
                    endpoint.clone().ok_or(anyhow!(
                        "No upload endpoint; pass --endpoint or run `rupload config`"
                    ))
                };

                match command {
                    Commands::Create { payload } => {
                        create_session(&client, &load_endpoint()?, payload).await
                    }
                    Commands::Status { session, size } => {
                        print_status(&client, &session, size).await
                    }
                    Commands::Upload { payload } => {
                        upload(&client, Target::New(load_endpoint()?), payload).await
                    }
                    Commands::Resume { session, payload } => {
                        upload(&client, Target::Existing(session), payload).await
                    }
                    Commands::Update { session, patch } => {
                        update_session(&client, &session, &patch).await
                    }
                    Commands::Delete { session } => {
                        client.delete_upload(&session, &CallOptions::new()).await?;
                        element!(SuccessMessage(message: format!("Deleted {session}"))).print();
                        Ok(())
                    }
                    Commands::Config | Commands::SetToken { .. } => {
                        unreachable!("handled before loading configuration")
                    }
                }
            }
        }
    })
}

enum Target {
    New(Url),
    Existing(Url),
}

fn is_stdin(args: &PayloadArgs) -> bool {
    args.path.as_os_str() == "-"
}

fn describe_payload(args: &PayloadArgs) -> Result<UploadMetadata> {
    let metadata = if is_stdin(args) {
        let size = args
            .size
            .ok_or(anyhow!("--size is required when uploading from stdin"))?;
        UploadMetadata::new(args.name.clone().unwrap_or_else(|| "stdin".to_string()), size)
    } else {
        let file_meta = fs::metadata(&args.path)
            .with_context(|| format!("Failed to read {}", args.path.display()))?;
        if !file_meta.is_file() {
            bail!("{} is not a regular file", args.path.display());
        }
        let name = match &args.name {
            Some(name) => name.clone(),
            None => args
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or(anyhow!("Cannot derive a name from {}", args.path.display()))?,
        };
        let mut metadata = UploadMetadata::new(name, args.size.unwrap_or(file_meta.len()));
        if let Ok(modified) = file_meta.modified() {
            metadata = metadata.with_last_modified(modified);
        }
        metadata
    };

    Ok(match &args.mime_type {
        Some(mime_type) => metadata.with_mime_type(mime_type),
        None => metadata,
    })
}

/// Pumps stdin into a bounded stream source. Reading stops while a chunk is in flight.
fn stdin_source() -> UploadSource {
    let (writer, source) = UploadSource::channel(4);
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = vec![0u8; STDIN_READ_SIZE];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) => {
                    writer.finish();
                    break;
                }
                Ok(n) => {
                    if writer.write(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    writer.fail(err).await;
                    break;
                }
            }
        }
    });
    source
}

fn payload_source(args: &PayloadArgs) -> UploadSource {
    if is_stdin(args) {
        stdin_source()
    } else {
        UploadSource::file(&args.path)
    }
}

async fn create_session(client: &UploadClient, endpoint: &Url, payload: PayloadArgs) -> Result<()> {
    let metadata = describe_payload(&payload)?;
    let session = client
        .create_upload(endpoint, &metadata, &CallOptions::new())
        .await?;
    println!("{}", session.url);
    Ok(())
}

async fn print_status(client: &UploadClient, session: &Url, size: Option<u64>) -> Result<()> {
    let metadata = size.map(|size| UploadMetadata::new(String::new(), size));
    let received = client
        .get_upload_status(session, metadata.as_ref(), &CallOptions::new())
        .await?;
    element!(SessionStatus(session: session.to_string(), received: received, total: size)).print();
    Ok(())
}

/// Aborts the client's uploads on the first Ctrl-C.
fn abort_on_ctrl_c(abort: AbortHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            abort.abort();
        }
    });
}

async fn upload(client: &UploadClient, target: Target, payload: PayloadArgs) -> Result<()> {
    let metadata = describe_payload(&payload)?;
    let source = payload_source(&payload);
    abort_on_ctrl_c(client.abort_handle());

    let (title, mut stream): (&str, BoxStream<'_, _>) = match &target {
        Target::New(endpoint) => (
            "Uploading",
            client.upload_events(endpoint, &metadata, source, None),
        ),
        Target::Existing(session) => (
            "Resuming",
            client.resume_events(session, &metadata, source, None),
        ),
    };

    let (tx, rx) = watch::channel(0.0);

    let process_stream = async {
        let mut outcome = None;
        while let Some(event) = stream.next().await {
            match event? {
                UploadEvent::Progress(fraction) => {
                    let _ = tx.send((fraction * 100.0) as f32);
                }
                UploadEvent::Complete(result) => {
                    outcome = Some(result);
                    break;
                }
            }
        }
        outcome.ok_or(anyhow!("Upload ended without a result"))
    };

    let mut progress_bar = element!(ProgressBar(title: title.to_string(), progress: Some(rx)));

    let outcome = tokio::select! {
        result = process_stream => result?,
        _ = progress_bar.render_loop() => {
            unreachable!("render_loop should not terminate")
        }
    };

    match outcome {
        UploadOutcome::Completed { session } => {
            element!(SuccessMessage(message: format!("Upload complete: {session}"))).print();
        }
        UploadOutcome::Cancelled {
            session: Some(session),
        } => {
            element!(ErrorMessage(message: "Upload cancelled".to_string())).print();
            println!(
                "Resume with: rupload resume {} {}",
                session,
                payload.path.display()
            );
        }
        UploadOutcome::Cancelled { session: None } => {
            element!(ErrorMessage(message: "Upload cancelled before a session was created".to_string()))
                .print();
        }
    }

    Ok(())
}

fn parse_patch(patch: &str) -> Result<Map<String, Value>> {
    let text = match patch.strip_prefix('@') {
        Some(path) => {
            fs::read_to_string(path).with_context(|| format!("Failed to read {path}"))?
        }
        None => patch.to_string(),
    };
    serde_json::from_str(&text).context("Patch must be a JSON object")
}

async fn update_session(client: &UploadClient, session: &Url, patch: &str) -> Result<()> {
    let patch = parse_patch(patch)?;
    client
        .update_upload(session, &patch, &CallOptions::new())
        .await?;
    element!(SuccessMessage(message: format!("Updated {session}"))).print();
    Ok(())
}

fn read_input(prompt: &str, default: Option<&str>, description: Option<&str>) -> Result<String> {
    element! {
        InputPrompt(
            prompt: prompt.to_string(),
            default: default.map(|s| s.to_string()),
            description: description.map(|s| s.to_string())
        )
    }
    .print();

    print!("> ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim().to_string();

    if input.is_empty() {
        if let Some(def) = default {
            Ok(def.to_string())
        } else {
            Ok(input)
        }
    } else {
        Ok(input)
    }
}

fn interactive_config() -> Result<()> {
    element!(ConfigHeader()).print();

    let endpoint = loop {
        let endpoint_str = read_input(
            "Upload endpoint",
            None,
            Some("The URL sessions are created at"),
        )?;

        match Url::parse(&endpoint_str) {
            Ok(url) => break url,
            Err(e) => {
                element!(ErrorMessage(message: format!("Invalid URL: {}", e))).print();
                println!();
            }
        }
    };

    let default_chunk_size = resumable_upload::DEFAULT_CHUNK_SIZE.to_string();
    let chunk_size = loop {
        let chunk_size_str = read_input(
            "Chunk size",
            Some(default_chunk_size.as_str()),
            Some("Bytes sent per request"),
        )?;

        match chunk_size_str.parse::<u64>() {
            Ok(size) if size > 0 => break size,
            _ => {
                element!(ErrorMessage(message: "Chunk size must be a positive integer".to_string()))
                    .print();
                println!();
            }
        }
    };

    let token = read_input(
        "Token",
        None,
        Some("Optional: bearer token sent with every request (stored in OS keyring)"),
    )?;
    if !token.is_empty() {
        config::set_token_keyring(token)?;
    }

    let config_file = config::ConfigFile {
        endpoint: Some(endpoint),
        chunk_size: Some(chunk_size),
        ..config::ConfigFile::default()
    };

    config::write_config(config_file)?;

    element!(SuccessMessage(message: "Configuration complete!".to_string())).print();

    Ok(())
}
