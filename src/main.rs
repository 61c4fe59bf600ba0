use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use a3s_watch::containers::{Containers, ContainersDataSource, StaticRuntime};
use a3s_watch::{signatures, Decoder, Event, Pipeline, ProcFs, RawRecord, WatchConfig};

/// A3S Watch - runtime security monitor for trace event streams
#[derive(Debug, Parser)]
#[command(name = "a3s-watch", version, about)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, default_value = "a3s-watch.toml")]
    config: PathBuf,

    /// Pass decoded events through without running signatures
    #[arg(long)]
    no_detect: bool,

    /// Read raw records (JSON lines) from a file instead of stdin
    #[arg(long)]
    input: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the event stream, logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = WatchConfig::load(&cli.config)?;
    if cli.no_detect {
        config.engine.enabled = false;
    }

    let runtime = Arc::new(StaticRuntime::new(config.containers.static_containers.clone()));
    let containers = Arc::new(Containers::new(runtime, config.containers.proc_root.clone()));
    let inspector = Arc::new(ProcFs::new(config.decode.proc_root.clone()));
    let decoder = Decoder::discover(&config.decode, containers.clone(), inspector).await;

    let (records_tx, records_rx) = mpsc::channel(config.pipeline.stage_buffer_size.max(1));
    let (events_tx, mut events_rx) = mpsc::channel(config.pipeline.output_buffer_size.max(1));
    let cancel = CancellationToken::new();

    let mut pipeline = Pipeline::new(config, decoder)
        .signatures(signatures::builtin())
        .data_source(Arc::new(ContainersDataSource::new(containers)));
    let handle = pipeline.start(records_rx, events_tx, cancel.clone()).await?;

    let reader = match cli.input {
        Some(path) => {
            let file = tokio::fs::File::open(&path).await?;
            tokio::spawn(read_records(file, records_tx, cancel.clone()))
        }
        None => tokio::spawn(read_records(tokio::io::stdin(), records_tx, cancel.clone())),
    };

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, draining");
                cancel.cancel();
            }
        }
    });

    let mut stdout = tokio::io::stdout();
    if let Err(e) = write_events(&mut events_rx, &mut stdout).await {
        // Reader went away (e.g. a closed pipe): stop and drain
        tracing::warn!(error = %e, "Failed to write events, stopping");
        cancel.cancel();
    }
    // Remaining sends fail fast once the receiver is gone
    drop(events_rx);

    handle.wait().await;
    reader.await?;
    Ok(())
}

/// Feed JSON-lines raw records into the pipeline until EOF or cancellation
async fn read_records<R>(source: R, tx: mpsc::Sender<RawRecord>, cancel: CancellationToken)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(source).lines();
    let mut line_no = 0u64;
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read input");
                break;
            }
        };
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RawRecord>(&line) {
            Ok(record) => {
                if tx.send(record).await.is_err() {
                    break;
                }
            }
            Err(e) => tracing::warn!(line = line_no, error = %e, "Skipping malformed record"),
        }
    }
    tracing::debug!(lines = line_no, "Input reader stopped");
}

/// Write events as JSON lines until the stream ends; returns how many
async fn write_events<W>(events: &mut mpsc::Receiver<Event>, out: &mut W) -> std::io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;
    while let Some(event) = events.recv().await {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        out.write_all(&line).await?;
        written += 1;
    }
    out.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_events_json_lines() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(Event::new("ProcessStart")).await.unwrap();
        tx.send(Event::new("FileCreate")).await.unwrap();
        drop(tx);

        let mut out = Vec::new();
        assert_eq!(write_events(&mut rx, &mut out).await.unwrap(), 2);

        let names: Vec<String> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str::<Event>(line).unwrap().event_name)
            .collect();
        assert_eq!(names, vec!["ProcessStart", "FileCreate"]);
    }

    #[tokio::test]
    async fn test_write_events_closed_reader_is_an_error() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(Event::new("ProcessStart")).await.unwrap();

        let (mut writer, reader) = tokio::io::duplex(64);
        drop(reader);

        let err = write_events(&mut rx, &mut writer).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
    }
}
