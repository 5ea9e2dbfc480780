use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, bail};
use neurolet::{AnalysisService, BatchEvent, BatchRun, ImageSource, Modality, ServiceConfig};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

const USAGE: &str = "\
Usage: neurolet analyze <image>... [--modality auto|brain|chest] [--concurrency <n>]
       neurolet status

Commands:
  analyze          Analyze a batch of images and print results as JSON
  status           Start the inference service and report its status

Options:
  --modality <m>     Inference path: auto, brain or chest [default: auto]
  --concurrency <n>  Maximum analyze calls in flight [default: NEUROLET_CONCURRENCY or 2]

Environment:
  NEUROLET_EXECUTABLE, NEUROLET_ARGS, NEUROLET_PORT, NEUROLET_BRAIN_MODEL,
  NEUROLET_CHEST_MODEL, NEUROLET_HISTORY_FILE, NEUROLET_LOG, LOG_FORMAT=json";

#[derive(Debug, PartialEq)]
enum Command {
    Analyze {
        images: Vec<PathBuf>,
        modality: Modality,
        concurrency: Option<usize>,
    },
    Status,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(command).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let mut rest = args.iter().skip(1); // skip argv[0]
    let command = match rest.next().map(String::as_str) {
        Some("analyze") => "analyze",
        Some("status") => "status",
        Some("--help" | "-h") | None => return Err(String::new()),
        Some(other) => return Err(format!("unknown command: {other}")),
    };

    let mut images = Vec::new();
    let mut modality = Modality::Auto;
    let mut concurrency = None;

    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "--modality" => {
                let value = rest.next().ok_or("--modality requires a value")?;
                modality = value.parse()?;
            }
            "--concurrency" => {
                let value = rest.next().ok_or("--concurrency requires a value")?;
                let n: usize = value
                    .parse()
                    .map_err(|_| format!("invalid concurrency '{value}'"))?;
                if n == 0 {
                    return Err("--concurrency must be at least 1".to_string());
                }
                concurrency = Some(n);
            }
            "--help" | "-h" => return Err(String::new()),
            flag if flag.starts_with('-') => return Err(format!("unknown flag: {flag}")),
            path => images.push(PathBuf::from(path)),
        }
    }

    match command {
        "analyze" if images.is_empty() => Err("analyze requires at least one image".to_string()),
        "analyze" => Ok(Command::Analyze {
            images,
            modality,
            concurrency,
        }),
        _ if !images.is_empty() => Err(format!("unexpected argument: {}", images[0].display())),
        _ => Ok(Command::Status),
    }
}

/// `RUST_LOG` wins; otherwise `NEUROLET_LOG` sets the level for our crates.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("NEUROLET_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("neurolet={level},neurolet_cli={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

async fn run(command: Command) -> anyhow::Result<()> {
    let config = ServiceConfig::from_env().context("invalid configuration")?;
    let service = AnalysisService::new(config).context("failed to create inference client")?;

    let result = match command {
        Command::Status => status(&service).await,
        Command::Analyze {
            images,
            modality,
            concurrency,
        } => analyze(&service, images, modality, concurrency).await,
    };

    service.shutdown().await;
    result
}

async fn status(service: &Arc<AnalysisService>) -> anyhow::Result<()> {
    let summary = service.initialize().await;
    let models = match service.models_info().await {
        Ok(models) => serde_json::to_value(models)?,
        Err(e) => serde_json::json!({ "error": e.to_string() }),
    };

    let report = serde_json::json!({
        "ready": summary.ready,
        "message": summary.message,
        "status": summary.status,
        "models": models,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn analyze(
    service: &Arc<AnalysisService>,
    images: Vec<PathBuf>,
    modality: Modality,
    concurrency: Option<usize>,
) -> anyhow::Result<()> {
    let summary = service.initialize().await;
    if !summary.ready {
        bail!("inference service not ready: {}", summary.message);
    }

    let images: Vec<ImageSource> = images.into_iter().map(ImageSource::Path).collect();
    let mut handle = service.submit_batch(images, modality, concurrency)?;
    info!(batch_id = %handle.id(), "Batch started");

    let signal = shutdown_signal();
    tokio::pin!(signal);
    let mut cancelled = false;

    let run = loop {
        tokio::select! {
            _ = &mut signal, if !cancelled => {
                cancelled = true;
                handle.cancel();
            }
            event = handle.next_event() => match event {
                Some(BatchEvent::Progress(progress)) => {
                    let line = serde_json::json!({
                        "completed": progress.completed,
                        "total": progress.total,
                        "outcome": progress.outcome,
                    });
                    println!("{line}");
                }
                Some(BatchEvent::Finished(run)) => break run,
                None => break handle.snapshot(),
            },
        }
    };

    println!("{}", serde_json::to_string_pretty(&report(&run))?);
    Ok(())
}

fn report(run: &BatchRun) -> serde_json::Value {
    let not_analyzed: Vec<&str> = run
        .missing()
        .into_iter()
        .map(|r| r.image_name.as_str())
        .collect();
    serde_json::json!({
        "batch_id": run.batch_id,
        "status": run.status,
        "total": run.total(),
        "succeeded": run.successes(),
        "failed": run.failures(),
        "not_analyzed": not_analyzed,
        "results": run.ordered_outcomes(),
    })
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, cancelling batch...");
        }
        _ = terminate => {
            info!("Received SIGTERM, cancelling batch...");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("neurolet")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parses_analyze_with_options() {
        let command = parse_args(&args(&[
            "analyze",
            "a.png",
            "--modality",
            "Chest",
            "b.jpg",
            "--concurrency",
            "3",
        ]))
        .unwrap();
        assert_eq!(
            command,
            Command::Analyze {
                images: vec![PathBuf::from("a.png"), PathBuf::from("b.jpg")],
                modality: Modality::Chest,
                concurrency: Some(3),
            }
        );
    }

    #[test]
    fn analyze_defaults() {
        let command = parse_args(&args(&["analyze", "scan.png"])).unwrap();
        assert_eq!(
            command,
            Command::Analyze {
                images: vec![PathBuf::from("scan.png")],
                modality: Modality::Auto,
                concurrency: None,
            }
        );
    }

    #[test]
    fn parses_status() {
        assert_eq!(parse_args(&args(&["status"])).unwrap(), Command::Status);
        assert!(parse_args(&args(&["status", "extra.png"])).is_err());
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(parse_args(&args(&[])), Err(String::new()));
        assert_eq!(parse_args(&args(&["--help"])), Err(String::new()));
        assert!(parse_args(&args(&["analyze"])).is_err());
        assert!(parse_args(&args(&["analyze", "a.png", "--modality", "knee"])).is_err());
        assert!(parse_args(&args(&["analyze", "a.png", "--concurrency", "0"])).is_err());
        assert!(parse_args(&args(&["analyze", "a.png", "--concurrency"])).is_err());
        assert!(parse_args(&args(&["analyze", "a.png", "--fast"])).is_err());
        assert!(parse_args(&args(&["train"])).is_err());
    }
}
