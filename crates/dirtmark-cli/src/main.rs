#![forbid(unsafe_code)]

use std::error::Error;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dirtmark_config::MANIFEST_FILE;
use dirtmark_engine::classify::check_names;
use dirtmark_engine::{
    BuildExecutor, CancelFlag, Change, ChangeSet, DependencyGraph, DirtyReason, ManifestSource,
    Plan, RequestedScope, Session, TargetId, TargetReport, WorkChunk,
};
use dirtmark_targets::{BuildTarget, Variant};

type CliResult = Result<(), Box<dyn Error>>;

#[derive(Debug, Parser)]
#[command(name = "dirtmark", about = "Decide what an incremental build must recompile")]
#[command(version)]
struct Cli {
    /// Project directory (defaults to the current directory)
    #[arg(long, global = true)]
    project: Option<PathBuf>,
    /// Log engine decisions
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List compilation chunks in build order, grouped by parallel level
    Chunks,
    /// Show what the given changes would rebuild
    Plan {
        #[command(flatten)]
        request: Request,
        /// Print the chain of reasons for every dirty target
        #[arg(long)]
        explain: bool,
    },
    /// Rebuild what the given changes make dirty
    Build {
        #[command(flatten)]
        request: Request,
        /// Shell command run once per chunk; see DIRTMARK_TARGETS and DIRTMARK_VARIANT
        #[arg(long)]
        exec: String,
    },
    /// Mark the planned targets as built without running anything
    Record {
        #[command(flatten)]
        request: Request,
    },
    /// Forget the build state of targets so they rebuild next time
    Invalidate {
        /// Targets such as `core` or `core:test`
        #[arg(required = true)]
        targets: Vec<BuildTarget>,
    },
    /// Show every target and whether it is up to date
    Status,
    /// Remove all recorded build state
    Clean,
}

/// Changes and scope shared by `plan`, `build` and `record`.
#[derive(Debug, Args)]
struct Request {
    /// A source file that was created or modified
    #[arg(long = "changed", value_name = "PATH")]
    changed: Vec<PathBuf>,
    /// A source file that was deleted
    #[arg(long = "removed", value_name = "PATH")]
    removed: Vec<PathBuf>,
    /// A library root that changed, as `NAME` or `NAME=PATH`
    #[arg(long = "library", value_name = "LIBRARY")]
    libraries: Vec<String>,
    /// A module whose dependency declarations changed
    #[arg(long = "declaration", value_name = "MODULE")]
    declarations: Vec<String>,
    /// Rebuild every target regardless of state
    #[arg(long, conflicts_with_all = ["targets", "variant"])]
    full: bool,
    /// Build these targets plus their dirty dependencies
    #[arg(long = "target", value_name = "TARGET")]
    targets: Vec<BuildTarget>,
    /// Build every target of one variant plus their dirty dependencies
    #[arg(long, value_parser = parse_variant, conflicts_with = "targets")]
    variant: Option<Variant>,
    /// Compare every target against its recorded signature
    #[arg(long)]
    scan: bool,
}

fn parse_variant(s: &str) -> Result<Variant, String> {
    Variant::ALL
        .into_iter()
        .find(|v| v.as_str() == s)
        .ok_or_else(|| format!("unknown variant `{s}` (expected `production` or `test`)"))
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match project_root(cli.project) {
        Ok(root) => match cli.command {
            Command::Chunks => cmd_chunks(&root),
            Command::Plan { request, explain } => cmd_plan(&root, &request, explain),
            Command::Build { request, exec } => cmd_build(&root, &request, &exec),
            Command::Record { request } => cmd_record(&root, &request),
            Command::Invalidate { targets } => cmd_invalidate(&root, &targets),
            Command::Status => cmd_status(&root),
            Command::Clean => cmd_clean(&root),
        },
        Err(e) => Err(e),
    };

    if let Err(msg) = result {
        eprintln!("error: {msg}");
        process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "dirtmark=debug,dirtmark_engine=debug"
    } else {
        "dirtmark=info,dirtmark_engine=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();
}

/// The project root: `--project` or the current directory, which must hold a manifest.
fn project_root(project: Option<PathBuf>) -> Result<PathBuf, Box<dyn Error>> {
    let root = match project {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    if !root.join(MANIFEST_FILE).exists() {
        return Err(format!("no {MANIFEST_FILE} found in {}", root.display()).into());
    }
    Ok(root)
}

fn open_session(root: &Path) -> Result<Session, Box<dyn Error>> {
    Ok(Session::open(Arc::new(ManifestSource::new(root)))?)
}

/// Turn the request flags into a change set, checking names against the
/// session's graph.
///
/// The session is opened per invocation, so its graph already reflects any
/// edited declarations and planning uses it without reloading.
fn change_set(session: &Session, request: &Request) -> Result<ChangeSet, Box<dyn Error>> {
    let mut changes = ChangeSet::new();
    for path in &request.changed {
        changes.push(Change::SourceChanged(path.clone()));
    }
    for path in &request.removed {
        changes.push(Change::SourceRemoved(path.clone()));
    }
    for module in &request.declarations {
        changes.push(Change::DependencyDeclarationChanged(module.clone()));
    }
    let graph = session.graph();
    for spec in &request.libraries {
        let (name, root) = match spec.split_once('=') {
            Some((name, root)) => (name, Some(PathBuf::from(root))),
            None => (spec.as_str(), None),
        };
        let roots = match root {
            Some(root) => vec![root],
            None => graph
                .library_id(name)
                .and_then(|id| graph.library(id))
                .map(|lib| lib.roots.clone())
                .unwrap_or_default(),
        };
        if roots.is_empty() {
            changes.push(Change::LibraryRootChanged {
                library: name.to_owned(),
                root: PathBuf::new(),
            });
        }
        for root in roots {
            changes.push(Change::LibraryRootChanged {
                library: name.to_owned(),
                root,
            });
        }
    }
    check_names(&graph, &changes)?;
    Ok(changes)
}

fn requested_scope(graph: &DependencyGraph, request: &Request) -> RequestedScope {
    if request.full {
        RequestedScope::FullRebuild
    } else if let Some(variant) = request.variant {
        RequestedScope::variant(graph, variant)
    } else if request.targets.is_empty() {
        RequestedScope::Incremental
    } else {
        RequestedScope::RebuildTargets(request.targets.iter().cloned().collect())
    }
}

fn name(graph: &DependencyGraph, id: TargetId) -> String {
    graph
        .build_target(id)
        .map_or_else(|| format!("#{}", id.index()), ToString::to_string)
}

fn describe(graph: &DependencyGraph, reason: &DirtyReason) -> String {
    match reason {
        DirtyReason::Seed(seed) => seed.to_string(),
        DirtyReason::Dependency { via, depth } => {
            format!("depends on `{}` (depth {depth})", name(graph, *via))
        }
        DirtyReason::ChunkMember { via } => {
            format!("compiled together with `{}`", name(graph, *via))
        }
    }
}

fn print_plan(plan: &Plan, explain: bool) {
    let graph = &plan.graph;
    for &pruned in plan.dirty.pruned() {
        eprintln!("   Unchanged `{}`", name(graph, pruned));
    }
    for target in plan.dirty.targets() {
        eprintln!("       Dirty `{}`", name(graph, target));
        if explain {
            for (id, reason) in plan.dirty.explain(target) {
                eprintln!("             `{}`: {}", name(graph, id), describe(graph, reason));
            }
        }
    }
    if plan.work.is_empty() {
        eprintln!("    Nothing to build");
        return;
    }
    for chunk in plan.work.chunks() {
        let members: Vec<String> = chunk.build_targets.iter().map(ToString::to_string).collect();
        eprintln!("       Build {}", members.join(", "));
    }
}

fn cmd_chunks(root: &Path) -> CliResult {
    let session = open_session(root)?;
    let graph = session.graph();
    for (level, chunks) in graph.parallel_levels().iter().enumerate() {
        eprintln!("Level {level}:");
        for &id in chunks {
            let Some(chunk) = graph.chunk(id) else {
                continue;
            };
            let members: Vec<String> = chunk.targets.iter().map(|&t| name(&graph, t)).collect();
            eprintln!("  [{}] {}", id.index(), members.join(", "));
        }
    }
    Ok(())
}

fn planned(
    session: &mut Session,
    request: &Request,
) -> Result<(ChangeSet, RequestedScope), Box<dyn Error>> {
    session.set_scan(request.scan);
    let changes = change_set(session, request)?;
    let scope = requested_scope(&session.graph(), request);
    Ok((changes, scope))
}

fn cmd_plan(root: &Path, request: &Request, explain: bool) -> CliResult {
    let mut session = open_session(root)?;
    let (changes, scope) = planned(&mut session, request)?;
    let plan = session
        .plan_current(&changes, &scope, &CancelFlag::new())?
        .ok_or("planning was cancelled")?;
    print_plan(&plan, explain);
    Ok(())
}

fn cmd_build(root: &Path, request: &Request, exec: &str) -> CliResult {
    let mut session = open_session(root)?;
    let (changes, scope) = planned(&mut session, request)?;
    let executor = CommandExecutor {
        script: exec.to_owned(),
        root: root.to_owned(),
    };
    let start = std::time::Instant::now();
    let (plan, summary) = session
        .build_current(&changes, &scope, &executor, &CancelFlag::new())?
        .ok_or("build was cancelled")?;

    print_plan(&plan, false);
    for (target, message) in &summary.failed {
        eprintln!("      Failed `{target}`: {message}");
    }
    for target in &summary.skipped {
        eprintln!("     Skipped `{target}` (a dependency failed)");
    }
    if !summary.is_success() {
        return Err(format!(
            "{} target(s) failed, {} skipped",
            summary.failed.len(),
            summary.skipped.len()
        )
        .into());
    }
    eprintln!(
        "    Finished {} target(s) in {:.2}s",
        summary.succeeded.len(),
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

fn cmd_record(root: &Path, request: &Request) -> CliResult {
    let mut session = open_session(root)?;
    let (changes, scope) = planned(&mut session, request)?;
    let (_, summary) = session
        .build_current(&changes, &scope, &RecordOnly, &CancelFlag::new())?
        .ok_or("recording was cancelled")?;
    eprintln!("    Recorded {} target(s)", summary.succeeded.len());
    Ok(())
}

fn cmd_invalidate(root: &Path, targets: &[BuildTarget]) -> CliResult {
    let session = open_session(root)?;
    let graph = session.graph();
    for target in targets {
        if graph.target_id(target).is_none() {
            return Err(format!("unknown target `{target}`").into());
        }
        session.store().invalidate(target)?;
        eprintln!(" Invalidated `{target}`");
    }
    Ok(())
}

fn cmd_status(root: &Path) -> CliResult {
    let mut session = open_session(root)?;
    session.set_scan(true);
    let plan = session
        .plan(&ChangeSet::new(), &RequestedScope::Incremental, &CancelFlag::new())?
        .ok_or("status check was cancelled")?;
    let graph = &plan.graph;
    for id in graph.target_ids() {
        let Some(target) = graph.build_target(id) else {
            continue;
        };
        match plan.dirty.reason(id) {
            Some(reason) => eprintln!("  [!!] {target}: {}", describe(graph, reason)),
            None => match session.store().entry(target) {
                Some(state) => eprintln!("  [ok] {target} (built at {})", state.built_at),
                None => eprintln!("  [ok] {target}"),
            },
        }
    }
    Ok(())
}

fn cmd_clean(root: &Path) -> CliResult {
    let session = open_session(root)?;
    let state_dir = root.join(&session.settings().state_dir);
    drop(session);
    dirtmark_util::fs::remove_dir_all_if_exists(&state_dir)?;
    eprintln!("    Cleaned build state");
    Ok(())
}

/// Runs a shell command per chunk.
///
/// The command sees `DIRTMARK_TARGETS` (space-separated targets) and
/// `DIRTMARK_VARIANT`. Each stdout line names an output file; a line of
/// the form `target=path` belongs to that target alone, any other line to
/// every member of the chunk.
struct CommandExecutor {
    script: String,
    root: PathBuf,
}

impl BuildExecutor for CommandExecutor {
    fn build_chunk(&self, chunk: &WorkChunk) -> Vec<TargetReport> {
        let names: Vec<String> = chunk.build_targets.iter().map(ToString::to_string).collect();
        let envs = [
            ("DIRTMARK_TARGETS", names.join(" ")),
            ("DIRTMARK_VARIANT", chunk.variant.to_string()),
        ];
        let failed = |message: String| -> Vec<TargetReport> {
            chunk
                .build_targets
                .iter()
                .map(|_| TargetReport::Failed {
                    message: message.clone(),
                })
                .collect()
        };

        let output = match dirtmark_util::process::run_shell(&self.script, &self.root, &envs) {
            Ok(output) => output,
            Err(e) => return failed(e.to_string()),
        };
        if !output.success {
            let stderr = output.stderr.trim();
            let message = match output.exit_code {
                Some(code) if stderr.is_empty() => format!("command exited with {code}"),
                Some(code) => format!("command exited with {code}: {stderr}"),
                None => "command was killed by a signal".to_owned(),
            };
            return failed(message);
        }
        outputs_by_target(&names, &output.stdout)
            .into_iter()
            .map(|outputs| TargetReport::Succeeded { outputs })
            .collect()
    }

    fn discard_outputs(&self, target: &BuildTarget, outputs: &[PathBuf]) {
        for output in outputs {
            let path = self.root.join(output);
            if let Err(e) = dirtmark_util::fs::remove_file_if_exists(&path) {
                tracing::warn!(build_target = %target, "cannot discard output: {e}");
            }
        }
    }
}

/// Split executor stdout into per-target output lists, in `names` order.
fn outputs_by_target(names: &[String], stdout: &str) -> Vec<Vec<PathBuf>> {
    let mut outputs = vec![Vec::new(); names.len()];
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let owner = line
            .split_once('=')
            .and_then(|(target, path)| Some((names.iter().position(|n| n == target)?, path)));
        match owner {
            Some((index, path)) => {
                if let Some(list) = outputs.get_mut(index) {
                    list.push(PathBuf::from(path));
                }
            }
            None => {
                for list in &mut outputs {
                    list.push(PathBuf::from(line));
                }
            }
        }
    }
    outputs
}

/// Reports success for every member without building anything.
struct RecordOnly;

impl BuildExecutor for RecordOnly {
    fn build_chunk(&self, chunk: &WorkChunk) -> Vec<TargetReport> {
        chunk
            .targets
            .iter()
            .map(|_| TargetReport::Succeeded {
                outputs: Vec::new(),
            })
            .collect()
    }
}
