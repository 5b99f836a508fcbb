use colored::Colorize;
use octofhir_conformance::{Discovery, Outcome, RunReport, TestResult};
use tabled::builder::Builder;
use tabled::settings::Style;

/// One line per result as it is recorded.
pub fn print_result(result: &TestResult) {
    let mark = match result.outcome {
        Outcome::Success => "✓".green(),
        Outcome::Fail => "✗".red(),
        Outcome::Skipped => "−".yellow(),
    };
    println!(
        "{} {:<16} {} {}",
        mark,
        result.code.bold(),
        result.title,
        format!("[{}]", result.category).dimmed()
    );
    if let Some(message) = result.message() {
        let message = match result.outcome {
            Outcome::Fail => message.red(),
            _ => message.normal(),
        };
        println!("    {message}");
    }
}

pub fn print_summary(report: &RunReport) {
    let mut builder = Builder::default();
    builder.push_record(["Category", "Success", "Fail", "Skipped"]);
    for (category, counts) in &report.summary.categories {
        builder.push_record([
            category.clone(),
            counts.success.to_string(),
            counts.fail.to_string(),
            counts.skipped.to_string(),
        ]);
    }
    let totals = &report.summary.totals;
    builder.push_record([
        "Total".to_string(),
        totals.success.to_string(),
        totals.fail.to_string(),
        totals.skipped.to_string(),
    ]);
    let table = builder.build().with(Style::rounded()).to_string();
    println!();
    println!("{table}");
    println!("{}: {}", "Server".cyan(), report.server);
}

pub fn print_listing(discovery: &Discovery) {
    if discovery.is_empty() {
        println!("No test cases match.");
        return;
    }
    for (module, cases) in discovery.listing() {
        println!("{}", module.name.cyan().bold());
        for case in cases {
            println!("  {:<16} {}", case.resolved_code(), case.resolved_title());
        }
    }
    println!("{} cases", discovery.case_count());
}

pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}
