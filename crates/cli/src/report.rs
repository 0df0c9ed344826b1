//! Coloured terminal output.

use colored::Colorize;
use qp_core::runtime::DrainReport;
use qp_protocol::{StageId, StageMessage, ValidationError};

pub fn print_valid(message: &StageMessage) {
    let envelope = message.envelope();
    let stages: Vec<&str> = envelope.stages_with_payload().map(StageId::payload_key).collect();

    println!(
        "{} valid {}",
        "✓".green().bold(),
        message.stage().message_type().bold()
    );
    println!("  idempotencyId:   {}", message.idempotency_id());
    println!(
        "  completedStages: {} ({})",
        message.completed_stages(),
        message.completed_stages().bits()
    );
    println!("  payloads:        {}", stages.join(", "));
    println!("  someData:        {}", message.payload().some_data);
}

pub fn print_invalid(error: &ValidationError) {
    println!("{} {}", "✗".red().bold(), error.to_string().red());
}

pub fn print_drain(report: &DrainReport) {
    println!("{}", "Pipeline run".bold().underline());

    for stage in StageId::ALL {
        let stats = report.stats(stage);
        let failures = if stats.failures == 0 {
            "0 failed".green()
        } else {
            format!("{} failed", stats.failures).red()
        };
        println!(
            "  {:<16} {} invocation(s), {}",
            stage.queue_name(),
            stats.invocations,
            failures
        );
    }

    for (stage, reason) in &report.dead_lettered {
        println!(
            "{} dead-lettered on {}: {}",
            "✗".red().bold(),
            stage.queue_name(),
            reason
        );
    }

    if report.terminated_invalid > 0 {
        println!(
            "{} {} malformed message(s) reached the terminal stage",
            "!".yellow().bold(),
            report.terminated_invalid
        );
    }

    match report.final_envelope() {
        Some(envelope) if report.terminated_valid > 0 => {
            println!("{} pipeline complete", "✓".green().bold());
            match serde_json::to_string_pretty(envelope) {
                Ok(json) => println!("{json}"),
                Err(e) => println!("{} {e}", "could not render envelope:".red()),
            }
        }
        _ => println!("{} pipeline did not complete", "✗".red().bold()),
    }
}
