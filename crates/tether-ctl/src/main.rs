//! tether-ctl: command-line client for a Tether telemetry server.

mod cmd;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tether_core::config::TetherConfig;

use cmd::download::DownloadArgs;

fn print_usage(config: &TetherConfig) {
    println!("Usage: tether-ctl [--host <host>] [--port <port>] <command>");
    println!();
    println!("Commands:");
    println!("  files                       List files on the server");
    println!("  stats <file>                Show channels and time span of a file");
    println!("  download <file> [options]   Stream a file into memory");
    println!("      --topic <topic>         Only this topic (repeatable, default: all)");
    println!("      --start <secs>          Start offset from the beginning of the file");
    println!("      --end <secs>            End offset, exclusive");
    println!("      --cache <path>          Also write a local cache (relative to the cache dir)");
    println!("  replay <cache-file>         Re-ingest a local cache file");
    println!();
    println!("Options:");
    println!("  --host <host>   Server host (default: {})", config.server.host);
    println!("  --port <port>   Server port (default: {})", config.server.port);
    println!();
    println!("Config file: {}", TetherConfig::file_path().display());
}

fn parse_download(args: &[&str]) -> Result<DownloadArgs> {
    let mut out = DownloadArgs::default();
    let mut i = 0;
    while i < args.len() {
        let flag = args[i];
        let mut value = || {
            i += 1;
            args.get(i)
                .copied()
                .with_context(|| format!("{flag} requires a value"))
        };
        match flag {
            "--topic" => out.topics.push(value()?.to_string()),
            "--start" => out.start = Some(value()?.parse().context("--start must be seconds")?),
            "--end" => out.end = Some(value()?.parse().context("--end must be seconds")?),
            "--cache" => out.cache = Some(PathBuf::from(value()?)),
            other if other.starts_with("--") => bail!("unknown option {other}"),
            file if out.filename.is_empty() => out.filename = file.to_string(),
            extra => bail!("unexpected argument {extra}"),
        }
        i += 1;
    }
    if out.filename.is_empty() {
        bail!("download requires a file name");
    }
    Ok(out)
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut config = TetherConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TetherConfig::default()
    });

    let args: Vec<String> = std::env::args().skip(1).collect();

    // Global options may appear anywhere before the command's own flags.
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                i += 1;
                config.server.host = args.get(i).context("--host requires a value")?.clone();
            }
            "--port" => {
                i += 1;
                config.server.port = args
                    .get(i)
                    .context("--port requires a value")?
                    .parse()
                    .context("--port must be a number")?;
            }
            other => remaining.push(other),
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["files"] | [] => cmd::browse::cmd_files(&config).await,
        ["stats", file] => cmd::browse::cmd_stats(&config, file).await,
        ["download", rest @ ..] => {
            let download = parse_download(rest)?;
            cmd::download::cmd_download(&config, download).await
        }
        ["replay", path] => cmd::replay::cmd_replay(&config, &PathBuf::from(*path)),
        ["help"] | ["--help"] | ["-h"] => {
            print_usage(&config);
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage(&config);
            std::process::exit(1);
        }
    }
}
