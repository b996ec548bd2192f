//! Boxed terminal output.

use tether_core::{FileInfo, Statistics, Timestamp};
use tether_ingest::{IngestReport, StoreSnapshot};

pub fn banner(title: &str) {
    println!("═══════════════════════════════════════");
    println!("  {title}");
    println!("═══════════════════════════════════════");
}

fn seconds(ns: Timestamp) -> f64 {
    ns as f64 * 1e-9
}

pub fn files(host: &str, port: u16, files: &[FileInfo]) {
    if files.is_empty() {
        println!("No files on {host}:{port}.");
        return;
    }
    banner(&format!("Files on {host}:{port} ({})", files.len()));
    for f in files {
        println!("  ┌─ {}", f.name);
        println!("  │  size     : {:.1} MB", f.size_megabytes);
        println!("  └─ modified : {}", f.modified);
    }
}

pub fn statistics(filename: &str, stats: &Statistics) {
    banner(filename);
    println!("  Library   : {}", stats.library);
    println!("  Profile   : {}", stats.profile);
    println!("  Messages  : {}", stats.message_count);
    println!("  Duration  : {:.3}s", stats.duration_secs());
    println!("  Channels  : {}", stats.channels.len());

    for c in &stats.channels {
        println!("  ┌─ [{}] {}", c.id, c.topic);
        println!("  │  schema   : {} ({})", c.schema_name, c.schema_encoding);
        println!("  │  encoding : {}", c.message_encoding);
        println!("  │  messages : {}", c.message_count);
        println!(
            "  └─ span     : {:.3}s … {:.3}s",
            seconds(c.start_time.saturating_sub(stats.start_time)),
            seconds(c.end_time.saturating_sub(stats.start_time))
        );
    }
}

pub fn series(snapshot: &StoreSnapshot) {
    if snapshot.series_count() == 0 {
        println!("\n  No series decoded.");
        return;
    }
    println!(
        "\n  Series ({}, {} points):",
        snapshot.series_count(),
        snapshot.point_count()
    );
    for (name, points) in &snapshot.numeric {
        let (min, max) = points.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
            (lo.min(p.value), hi.max(p.value))
        });
        println!("  ┌─ {name}");
        println!("  │  points : {}", points.len());
        println!("  └─ range  : {min} … {max}");
    }
    for (name, points) in &snapshot.strings {
        println!("  ┌─ {name}");
        println!("  │  points : {}", points.len());
        match points.last() {
            Some(last) => println!("  └─ last   : {:?}", last.text),
            None => println!("  └─ last   : -"),
        }
    }
}

pub fn report(report: &IngestReport) {
    println!();
    if report.has_warnings() {
        println!("  Warnings:");
        for line in report.to_string().lines() {
            println!("    {line}");
        }
    } else {
        println!("  {report}");
    }
}
