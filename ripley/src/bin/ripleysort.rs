//! `ripleysort`: re-sorts a nearly-ordered NDJSON stream of timestamped
//! requests, using a bounded reorder buffer (§4.6).

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use ripley_core::{record, Emission, ReorderBuffer};

/// Re-sorts a captured request stream that is only nearly timestamp-ordered.
#[derive(Parser, Debug)]
#[command(name = "ripleysort", version, about)]
struct Cli {
    /// Reorder buffer bound: absorbs disorder up to this many positions.
    #[arg(long, default_value_t = 0)]
    buffer_len: usize,

    /// Abort on the first out-of-order emission the buffer could not absorb.
    #[arg(long)]
    strict: bool,

    /// Log output format.
    #[arg(long, default_value = "text")]
    log_format: ripley_core::LogFormat,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    ripley_core::trace::install(cli.log_format);

    match run(cli).await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            tracing::error!(error = %e, "sort aborted");
            std::process::exit(2);
        }
    }
}

/// Runs to completion, returning the exit code for the non-abort paths.
/// A strict-mode abort surfaces as `Err` instead, which `main` maps to `2`.
async fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut buffer = ReorderBuffer::new(cli.buffer_len);
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    let mut exit_code = 0;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request = match record::decode(&line) {
            Ok(request) => request,
            Err(e) => {
                if cli.strict {
                    anyhow::bail!("bad input: {e}");
                }
                tracing::warn!(error = %e, line = %line, "bad input line");
                exit_code = 126;
                continue;
            }
        };

        if let Some(emission) = buffer.push(request) {
            emit(&mut stdout, &emission, cli.strict, &mut exit_code).await?;
        }
    }

    for emission in buffer.drain() {
        emit(&mut stdout, &emission, cli.strict, &mut exit_code).await?;
    }

    stdout.flush().await?;
    Ok(exit_code)
}

/// Writes one emission to stdout, handling the out-of-order bookkeeping.
async fn emit(
    stdout: &mut (impl AsyncWriteExt + Unpin),
    emission: &Emission,
    strict: bool,
    exit_code: &mut i32,
) -> anyhow::Result<()> {
    if emission.out_of_order {
        if strict {
            anyhow::bail!("out of order emission: {}", emission.request.timestamp);
        }
        tracing::warn!(
            timestamp = %emission.request.timestamp,
            "out of order emission, buffer too small to absorb"
        );
        *exit_code = 126;
    }

    let line = serde_json::to_string(&emission.request)?;
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    Ok(())
}
