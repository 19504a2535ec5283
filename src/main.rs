use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use unit_hunter::cli::{Cli, Commands, OutputFormat};
use unit_hunter::config::{ScannerSettings, clear_db, resolve_db_path};
use unit_hunter::criteria::UnitCriteria;
use unit_hunter::error::EntryFailure;
use unit_hunter::logging::{Verbosity, init_subscriber};
use unit_hunter::member::MemberCriteria;
use unit_hunter::scanner::{ScannerState, SearchConfig, UnitScanner};
use unit_hunter::snapshot::Snapshot;
use unit_hunter::source::JavaSourceParser;
use unit_hunter::unit::{Member, MemberKind};

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_subscriber(Verbosity::from_flags(cli.verbose, cli.quiet));

    match cli.command.clone() {
        Commands::Clear => {
            let db_path = resolve_db_path(&cli)?;
            clear_db(&db_path)?;
            info!(path = %db_path.display(), "snapshot cleared");
        }
        Commands::Stats => {
            let db_path = resolve_db_path(&cli)?;
            let stats = Snapshot::open(&db_path)
                .with_context(|| format!("Failed to open snapshot: {}", db_path.display()))?
                .stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Load { paths } => {
            let scanner = open_scanner(&cli, None)?;
            let output = load_paths(&scanner, &paths)?;
            persist(&cli, &scanner)?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Find {
            paths,
            name,
            extends,
            annotated,
            method,
            min_methods,
            parallel,
            class_paths,
            format,
        } => {
            let scanner = open_scanner(&cli, parallel)?;
            let query = FindQuery {
                name,
                extends,
                annotated,
                method,
                min_methods,
            };
            let result = find_units(&scanner, &paths, &query)?;
            persist(&cli, &scanner)?;
            if class_paths {
                write_class_paths(&result, format)?;
            } else {
                write_find_output(&result, format)?;
            }
        }
    }

    Ok(())
}

fn open_scanner(cli: &Cli, parallel: Option<usize>) -> Result<UnitScanner> {
    let mut settings = ScannerSettings::default();
    if let Some(n) = parallel {
        settings = settings.with_max_parallel_tasks(n);
    }
    let scanner = UnitScanner::new(Arc::new(JavaSourceParser::new()), settings);

    if !cli.no_snapshot {
        let db_path = resolve_db_path(cli)?;
        if db_path.exists() {
            match scanner.load_snapshot(&db_path) {
                Ok(roots) => info!(roots, path = %db_path.display(), "snapshot loaded"),
                Err(e) => warn!(error = %e, path = %db_path.display(), "snapshot ignored"),
            }
        }
    }
    Ok(scanner)
}

fn persist(cli: &Cli, scanner: &UnitScanner) -> Result<()> {
    if cli.no_snapshot {
        return Ok(());
    }
    let db_path = resolve_db_path(cli)?;
    let roots = scanner
        .save_snapshot(&db_path)
        .with_context(|| format!("Failed to write snapshot: {}", db_path.display()))?;
    info!(roots, path = %db_path.display(), "snapshot saved");
    Ok(())
}

struct FindQuery {
    name: Option<String>,
    extends: Option<String>,
    annotated: Option<String>,
    method: Option<String>,
    min_methods: Option<usize>,
}

impl FindQuery {
    fn criteria(&self) -> UnitCriteria {
        let mut criteria = UnitCriteria::create();
        if let Some(name) = self.name.clone() {
            criteria = criteria.by_name(move |fqn| fqn.contains(&name));
        }
        if let Some(extends) = &self.extends {
            criteria = criteria.subtype_of(extends.clone());
        }
        if let Some(annotated) = &self.annotated {
            criteria = criteria.annotated_with(annotated.clone());
        }
        if let Some(members) = self.member_criteria() {
            criteria = criteria.by_members(members);
        }
        criteria
    }

    fn member_criteria(&self) -> Option<MemberCriteria> {
        if self.method.is_none() && self.min_methods.is_none() {
            return None;
        }
        let mut members = MemberCriteria::create().of_kind(MemberKind::Method);
        if let Some(method) = self.method.clone() {
            members = members.by_name(move |name| name == method);
        }
        if let Some(min) = self.min_methods {
            members = members.result(move |found| found.len() >= min);
        }
        Some(members)
    }
}

#[derive(Debug, Serialize)]
struct FoundUnit {
    name: String,
    kind: String,
    key: String,
    class_path: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    members: Vec<String>,
}

#[derive(Debug, Serialize)]
struct FindResult {
    paths: Vec<String>,
    state: ScannerState,
    matched: usize,
    units: Vec<FoundUnit>,
    class_paths: Vec<String>,
    skipped: Vec<String>,
    failures: Vec<EntryFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    duration_ms: u64,
}

#[derive(Debug, Serialize)]
struct LoadResult {
    paths: Vec<String>,
    state: ScannerState,
    units: usize,
    cached_roots: usize,
    skipped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    duration_ms: u64,
}

fn display_paths(paths: &[PathBuf]) -> Vec<String> {
    paths.iter().map(|p| p.display().to_string()).collect()
}

fn find_units(scanner: &UnitScanner, paths: &[PathBuf], query: &FindQuery) -> Result<FindResult> {
    let start = Instant::now();
    let config = SearchConfig::for_paths(paths)
        .by(query.criteria())
        .wait_for_search_ending(false);

    let context = scanner.find_by(config)?;
    // root failures still leave the results of the other roots usable
    let error = match context.wait_for_search_ending() {
        Ok(()) => None,
        Err(e) => {
            warn!(error = %e, "search finished with errors");
            Some(e.to_string())
        }
    };

    let units = context
        .get_items_found()
        .into_iter()
        .map(|item| {
            let members = context
                .criteria()
                .member_criteria()
                .into_iter()
                .flat_map(|criteria| context.members_found_for(&item.key, criteria))
                .map(|m| describe_member(&m))
                .collect();
            FoundUnit {
                name: item.unit.name.clone(),
                kind: format!("{:?}", item.unit.kind).to_ascii_lowercase(),
                key: item.key.as_str().to_string(),
                class_path: item.class_path(),
                members,
            }
        })
        .collect::<Vec<_>>();

    let result = FindResult {
        paths: display_paths(paths),
        state: scanner.state(),
        matched: units.len(),
        units,
        class_paths: context.get_class_paths().into_iter().collect(),
        skipped: context
            .get_skipped_keys()
            .into_iter()
            .map(|k| k.as_str().to_string())
            .collect(),
        failures: context.get_failures(),
        error,
        duration_ms: start.elapsed().as_millis() as u64,
    };
    context.close();
    Ok(result)
}

fn describe_member(member: &Member) -> String {
    format!("{}#{}", member.owner, member.signature)
}

fn load_paths(scanner: &UnitScanner, paths: &[PathBuf]) -> Result<LoadResult> {
    let start = Instant::now();
    let context = scanner.find_by(SearchConfig::for_paths(paths).wait_for_search_ending(false))?;
    let error = context.wait_for_search_ending().err().map(|e| {
        warn!(error = %e, "load finished with errors");
        e.to_string()
    });

    let result = LoadResult {
        paths: display_paths(paths),
        state: scanner.state(),
        units: context.len(),
        cached_roots: scanner.cache().len(),
        skipped: context.get_skipped_keys().len(),
        error,
        duration_ms: start.elapsed().as_millis() as u64,
    };
    context.close();
    Ok(result)
}

fn write_find_output(result: &FindResult, format: OutputFormat) -> Result<()> {
    let content = match format {
        OutputFormat::Json => serde_json::to_string_pretty(result)?,
        OutputFormat::Text => {
            let mut out = String::new();
            out.push_str(&format!("matched: {}\n", result.matched));
            out.push_str(&format!("state: {:?}\n", result.state));
            out.push_str(&format!("duration_ms: {}\n", result.duration_ms));
            for unit in &result.units {
                out.push_str(&format!("- {} ({}) {}\n", unit.name, unit.kind, unit.key));
                for member in &unit.members {
                    out.push_str(&format!("    {member}\n"));
                }
            }
            for key in &result.skipped {
                out.push_str(&format!("skipped: {key}\n"));
            }
            if let Some(error) = &result.error {
                out.push_str(&format!("error: {error}\n"));
            }
            out
        }
    };
    write_stdout(&content);
    Ok(())
}

fn write_class_paths(result: &FindResult, format: OutputFormat) -> Result<()> {
    let content = match format {
        OutputFormat::Json => serde_json::to_string_pretty(&result.class_paths)?,
        OutputFormat::Text => result.class_paths.join("\n"),
    };
    write_stdout(&content);
    Ok(())
}

fn write_stdout(content: &str) {
    print!("{content}");
    if !content.ends_with('\n') {
        println!();
    }
}

