//! Operator CLI for the Crucible control plane: submit code, poll status,
//! inspect the DLQ — a thin client over the daemon's HTTP surface.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "crucible")]
#[command(about = "Crucible evaluation platform CLI", long_about = None)]
struct Cli {
    /// Daemon base URL.
    #[arg(long, default_value = "http://127.0.0.1:8700", env = "CRUCIBLE_ADDR")]
    addr: String,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit code for evaluation and print the eval id.
    Submit {
        /// Read code from this file ('-' for stdin).
        #[arg(long, conflicts_with = "code")]
        file: Option<String>,

        /// Inline code.
        #[arg(long)]
        code: Option<String>,

        #[arg(long, default_value = "python")]
        language: String,

        #[arg(long)]
        image: Option<String>,

        #[arg(long)]
        timeout_seconds: Option<u64>,

        /// urgent | normal | batch | maintenance
        #[arg(long)]
        priority: Option<String>,

        /// Keep the workload around after a failure, for debugging.
        #[arg(long)]
        preserve: bool,

        /// Idempotency key: a repeat submit with the same key reuses the id.
        #[arg(long)]
        idempotency_key: Option<String>,
    },

    /// Fetch one evaluation record.
    Status { id: String },

    /// List evaluations, optionally filtered by status.
    List {
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Print the audit event trail for one evaluation.
    Events { id: String },

    /// Show the dead-letter queue.
    Dlq,

    /// Daemon liveness and gauges.
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let http = reqwest::Client::new();

    match cli.cmd {
        Commands::Submit {
            file,
            code,
            language,
            image,
            timeout_seconds,
            priority,
            preserve,
            idempotency_key,
        } => {
            let code = match (file, code) {
                (Some(path), None) if path == "-" => {
                    use std::io::Read;
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("read stdin")?;
                    buf
                }
                (Some(path), None) => {
                    std::fs::read_to_string(&path).with_context(|| format!("read {path}"))?
                }
                (None, Some(inline)) => inline,
                _ => anyhow::bail!("exactly one of --file or --code is required"),
            };

            let mut body = serde_json::json!({
                "code": code,
                "language": language,
                "preserve": preserve,
            });
            if let Some(image) = image {
                body["image"] = image.into();
            }
            if let Some(t) = timeout_seconds {
                body["timeout_seconds"] = t.into();
            }
            if let Some(p) = priority {
                body["priority"] = p.into();
            }

            let mut req = http.post(format!("{}/eval", cli.addr)).json(&body);
            if let Some(key) = idempotency_key {
                req = req.header("idempotency-key", key);
            }
            print_json(req).await
        }

        Commands::Status { id } => print_json(http.get(format!("{}/eval/{id}", cli.addr))).await,

        Commands::List { status, limit } => {
            let mut url = format!("{}/evaluations?limit={limit}", cli.addr);
            if let Some(status) = status {
                url.push_str(&format!("&status={status}"));
            }
            print_json(http.get(url)).await
        }

        Commands::Events { id } => {
            print_json(http.get(format!("{}/eval/{id}/events", cli.addr))).await
        }

        Commands::Dlq => print_json(http.get(format!("{}/dlq", cli.addr))).await,

        Commands::Health => print_json(http.get(format!("{}/health", cli.addr))).await,
    }
}

/// Send the request, pretty-print the JSON body, fail on transport errors.
/// HTTP error statuses still print their body (the daemon returns structured
/// errors) but exit non-zero.
async fn print_json(req: reqwest::RequestBuilder) -> Result<()> {
    let resp = req.send().await.context("daemon unreachable")?;
    let status = resp.status();
    let value: serde_json::Value = resp.json().await.context("malformed response body")?;
    println!("{}", serde_json::to_string_pretty(&value)?);

    if !status.is_success() {
        anyhow::bail!("daemon returned {status}");
    }
    Ok(())
}
