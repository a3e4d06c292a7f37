use anyhow::{bail, Context, Result};
use std::env;
use std::path::Path;

use trust_reconciliation::{
    audit, db, exceptions, load_records_csv, logging, AppConfig, EventRange, ExceptionAction,
    ExceptionStatus, ExportFormat, MatchingCoordinator, RecordKey, SourceKind,
};

const USAGE: &str = "\
Usage:
  trust-reconciliation import <company> <payout|bank|ledger> <file.csv>
  trust-reconciliation run <company>
  trust-reconciliation exceptions <company> [open|resolved|ignored]
  trust-reconciliation resolve <exception-id> [kind:ref]
  trust-reconciliation ignore <exception-id>...
  trust-reconciliation sweep <company>
  trust-reconciliation verify <company>
  trust-reconciliation export <company> <json|csv>

Environment: RECON_DB_PATH, RECON_SETTINGS_PATH, RECON_LOG_LEVEL, RECON_LOG_JSON, RECON_ACTOR_ID";

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let config = AppConfig::from_env()?;
    logging::init(&config.log_level, config.log_json)?;

    let command = args.get(1).map(String::as_str).unwrap_or("help");
    let rest: &[String] = args.get(2..).unwrap_or(&[]);

    match command {
        "import" => run_import(&config, rest),
        "run" => run_matching(&config, rest),
        "exceptions" => list_exceptions(&config, rest),
        "resolve" => resolve(&config, rest),
        "ignore" => ignore(&config, rest),
        "sweep" => sweep(&config, rest),
        "verify" => verify(&config, rest),
        "export" => export(&config, rest),
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => bail!("unknown command {:?}\n\n{}", other, USAGE),
    }
}

fn arg<'a>(rest: &'a [String], index: usize, name: &str) -> Result<&'a str> {
    rest.get(index)
        .map(String::as_str)
        .with_context(|| format!("missing <{}>\n\n{}", name, USAGE))
}

fn open_store(config: &AppConfig) -> Result<rusqlite::Connection> {
    db::open(&config.db_path).with_context(|| format!("Failed to open database {:?}", config.db_path))
}

fn run_import(config: &AppConfig, rest: &[String]) -> Result<()> {
    let company_id = arg(rest, 0, "company")?;
    let kind: SourceKind = arg(rest, 1, "kind")?.parse()?;
    let csv_path = Path::new(arg(rest, 2, "file.csv")?);

    println!("📥 Importing {} records for {}", kind, company_id);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let import = load_records_csv(csv_path, kind)
        .with_context(|| format!("Failed to load {:?}", csv_path))?;
    println!("✓ Loaded {} records from CSV", import.records.len());
    for row in &import.rejected {
        println!("   ⚠️  line {}: {}", row.line, row.message);
    }

    let conn = open_store(config)?;
    let summary = db::ingest_records(&conn, company_id, &import.records)?;
    println!("✓ Inserted: {}", summary.inserted);
    println!("✓ Skipped duplicates: {}", summary.duplicates);

    let counts = db::record_counts(&conn, company_id)?;
    for (kind, count) in counts {
        println!("   {:<8} {}", kind, count);
    }

    Ok(())
}

fn run_matching(config: &AppConfig, rest: &[String]) -> Result<()> {
    let company_id = arg(rest, 0, "company")?;
    let settings = config.load_settings()?;
    let conn = open_store(config)?;

    println!("🧭 Matching run for {}", company_id);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let report = MatchingCoordinator::new(&conn, settings)
        .with_actor(&config.actor_id)
        .run_matching(company_id)?;

    for stage in &report.stages {
        println!(
            "   {:<14} processed {:>5}  matched {:>5}  exceptions {:>5}  skipped {:>5}",
            stage.stage.as_str(),
            stage.processed,
            stage.matched,
            stage.exceptions,
            stage.skipped
        );
    }
    for error in &report.errors {
        println!(
            "   ⚠️  [{}] {}:{} {}",
            error.stage.as_str(),
            error.source_kind.map(|k| k.as_str()).unwrap_or("-"),
            error.source_ref.as_deref().unwrap_or("-"),
            error.message
        );
    }

    println!("\n{}", report.summary());
    if report.success {
        println!("✅ Run completed");
    } else {
        println!("⚠️  Run completed with {} errors", report.errors.len());
    }

    Ok(())
}

fn list_exceptions(config: &AppConfig, rest: &[String]) -> Result<()> {
    let company_id = arg(rest, 0, "company")?;
    let status = match rest.get(1) {
        Some(s) => Some(s.parse::<ExceptionStatus>()?),
        None => Some(ExceptionStatus::Open),
    };
    let conn = open_store(config)?;

    let list = db::get_exceptions(&conn, company_id, status)?;
    println!("🚩 {} exceptions for {}", list.len(), company_id);

    for exception in &list {
        let subject = exception
            .subject()
            .map(|k| k.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "   {} {:<8} {:<28} {:<24} → {}",
            exception.id,
            exception.severity.as_str(),
            exception.exception_type.as_str(),
            subject,
            exception.proposed_action.label()
        );
    }

    Ok(())
}

fn resolve(config: &AppConfig, rest: &[String]) -> Result<()> {
    let exception_id = arg(rest, 0, "exception-id")?;
    let action = match rest.get(1) {
        Some(key) => ExceptionAction::resolve_with(key.parse::<RecordKey>()?),
        None => ExceptionAction::resolve(),
    };
    let conn = open_store(config)?;

    let outcome = trust_reconciliation::transition(&conn, exception_id, &action, &config.actor_id)?;
    println!("✓ Exception {} → {}", exception_id, outcome.exception.status);
    if let Some(m) = outcome.retroactive_match {
        println!("✓ Linked {} ↔ {} ({})", m.left_key(), m.right_key(), m.strategy);
    }

    Ok(())
}

fn ignore(config: &AppConfig, rest: &[String]) -> Result<()> {
    if rest.is_empty() {
        bail!("missing <exception-id>\n\n{}", USAGE);
    }
    let conn = open_store(config)?;

    let report = trust_reconciliation::bulk_transition(&conn, rest, &ExceptionAction::Ignore, &config.actor_id);
    println!("✓ Ignored: {}", report.succeeded.len());
    for failure in &report.failures {
        println!("   ❌ {} [{}] {}", failure.exception_id, failure.kind, failure.message);
    }

    Ok(())
}

fn sweep(config: &AppConfig, rest: &[String]) -> Result<()> {
    let company_id = arg(rest, 0, "company")?;
    let settings = config.load_settings()?;
    let conn = open_store(config)?;

    let generated = exceptions::generate_for_company(&conn, company_id, &settings, &config.actor_id)?;
    println!("✓ Generated {} exceptions", generated.len());

    Ok(())
}

fn verify(config: &AppConfig, rest: &[String]) -> Result<()> {
    let company_id = arg(rest, 0, "company")?;
    let conn = open_store(config)?;

    let report = audit::verify_integrity(&conn, company_id)?;
    match &report.first_failure {
        None => {
            println!("✅ Audit chain valid ({} events)", report.checked);
            Ok(())
        }
        Some(failure) => {
            println!("❌ Audit chain broken at event {} (seq {})", failure.event_id, failure.seq);
            println!("   {}: expected {}, found {}", failure.reason, failure.expected, failure.actual);
            report.into_result()?;
            Ok(())
        }
    }
}

fn export(config: &AppConfig, rest: &[String]) -> Result<()> {
    let company_id = arg(rest, 0, "company")?;
    let format: ExportFormat = arg(rest, 1, "json|csv")?.parse()?;
    let conn = open_store(config)?;

    let output = audit::export_audit_trail(&conn, company_id, format, &EventRange::all())?;
    print!("{}", output);

    Ok(())
}
