//! Human and JSON rendering of replication results.

use colored::Colorize;
use freightliner_core::checkpoint::Checkpoint;
use freightliner_core::engine::ReplicationOutcome;

/// Print a replication outcome as a human summary or JSON
pub fn print_outcome(outcome: &ReplicationOutcome, dry_run: bool, json: bool) {
    if json {
        let doc = serde_json::json!({
            "planned": outcome.planned,
            "tags_copied": outcome.result.tags_copied,
            "tags_skipped": outcome.result.tags_skipped,
            "errors": outcome.result.errors,
            "bytes_transferred": outcome.result.bytes_transferred,
            "checkpoint_id": outcome.checkpoint_id,
            "dry_run": dry_run,
        });
        println!("{}", serde_json::to_string_pretty(&doc).unwrap_or_default());
        return;
    }

    if dry_run {
        println!("{}", "Dry run - no images were pushed".yellow().bold());
        println!("Planned {} tag(s):", outcome.planned.len());
        for tag in &outcome.planned {
            println!("  {tag}");
        }
        return;
    }

    let result = &outcome.result;
    println!(
        "Copied {} tag(s), skipped {}, {} error(s), {} transferred",
        result.tags_copied.to_string().green().bold(),
        result.tags_skipped,
        if result.errors > 0 {
            result.errors.to_string().red().bold().to_string()
        } else {
            result.errors.to_string()
        },
        human_bytes(result.bytes_transferred),
    );
    if let Some(id) = &outcome.checkpoint_id {
        println!("Checkpoint: {id}");
    }
}

/// Print a checkpoint list
pub fn print_checkpoint_list(checkpoints: &[Checkpoint], json: bool) {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(checkpoints).unwrap_or_default()
        );
        return;
    }
    if checkpoints.is_empty() {
        println!("No checkpoints");
        return;
    }
    println!(
        "{:<38} {:<12} {:>7} {:>7} {:>7}  {}",
        "ID", "STATUS", "COPIED", "FAILED", "TOTAL", "CREATED"
    );
    for cp in checkpoints {
        println!(
            "{:<38} {:<12} {:>7} {:>7} {:>7}  {}",
            cp.id,
            cp.status,
            cp.total_tags_copied,
            cp.total_errors,
            cp.planned.len(),
            cp.created_at.to_rfc3339(),
        );
    }
}

/// Print one checkpoint in full
pub fn print_checkpoint(checkpoint: &Checkpoint, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(checkpoint).unwrap_or_default()
        );
        return;
    }
    println!("Checkpoint {}", checkpoint.id.bold());
    println!("  Status:      {}", checkpoint.status);
    println!("  Source:      {}", checkpoint.source);
    println!("  Destination: {}", checkpoint.destination);
    println!("  Created:     {}", checkpoint.created_at.to_rfc3339());
    println!(
        "  Progress:    {}/{} tags, {} skipped, {} error(s)",
        checkpoint.completed.len(),
        checkpoint.planned.len(),
        checkpoint.total_tags_skipped,
        checkpoint.total_errors,
    );
    if !checkpoint.failed.is_empty() {
        println!("  Failures:");
        for (tag, error) in &checkpoint.failed {
            println!("    {} {}", tag.red(), error);
        }
    }
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.0 KiB");
        assert_eq!(human_bytes(5 * 1024 * 1024), "5.0 MiB");
    }
}
