//! Human readable summary of a plan run, printed to stdout by the `run` command.

use std::time::Duration;

use fleetbench_stats::{Representation, Statistics};
use fleetbench_stats::representation::{DefaultOutcome, Percentile};
use yansi::Paint;

use crate::aggregate::{StageOutcome, StageStatus};
use crate::coordinator::RunSummary;
use crate::report::TestIteration;

/// Prints stage outcomes and a short breakdown of every recorded test.
pub fn print_summary(summary: &RunSummary) {
    println!();
    println!("{}", "## STAGES".bold());
    for outcome in &summary.outcomes {
        print_outcome(outcome);
    }

    for test in summary.report.tests() {
        for iteration in &test.iterations {
            println!();
            println!(
                "{} {} (iteration {}, stage {})",
                "## Test".bold(),
                test.name.bold().blue(),
                iteration.index,
                iteration.stage
            );
            print_iteration(iteration);
        }
    }
}

fn print_outcome(outcome: &StageOutcome) {
    match outcome.status {
        StageStatus::Passed => println!("  {} {}", "PASSED".bold().green(), outcome.stage),
        StageStatus::Skipped => println!("  {} {}", "SKIPPED".bold().yellow(), outcome.stage),
        StageStatus::Failed => {
            println!("  {} {}", "FAILED".bold().red(), outcome.stage);
            for failure in &outcome.failures {
                println!("    {failure}");
            }
        }
    }
    for warning in &outcome.warnings {
        println!("    {} {warning}", "warning:".yellow());
    }
}

fn print_iteration(iteration: &TestIteration) {
    match iteration.merged_statistics() {
        Ok(Some(merged)) => print_operations(&merged),
        Ok(None) => {}
        Err(err) => println!("  {}", format!("statistics unavailable: {err}").red()),
    }

    for result in iteration.results() {
        let aggregated = if result.suspicious {
            result.aggregated.as_str().bold().red()
        } else {
            result.aggregated.as_str().bold()
        };
        println!("  {}: {aggregated}", result.name);
        for (worker, value) in &result.workers {
            println!("    worker {worker}: {}", value.value);
        }
    }
}

fn print_operations(stats: &Statistics) {
    for (name, operation) in stats.operations() {
        let Ok(Some(outcome)) = DefaultOutcome::compute(operation, ()) else {
            continue;
        };

        print!("  {} ({} ops", format!("{name}:").bold().green(), outcome.requests.bold());
        if outcome.errors > 0 {
            print!(", {}", format!("{} FAILURES", outcome.errors).bold().red());
        }
        print!(") avg: {:.2?}", nanos(outcome.mean).bold());

        for p in [50.0, 90.0, 99.0] {
            if let Ok(Some(value)) = stats.representation::<Percentile>(name, p) {
                print!("; p{p}: {:.2?}", nanos(value.value));
            }
        }
        println!();
    }
}

fn nanos(value: f64) -> Duration {
    Duration::from_nanos(value.max(0.0) as u64)
}
