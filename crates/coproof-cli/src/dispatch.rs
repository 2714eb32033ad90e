use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use coproof_core::{
    Engine, EngineConfig, EngineError, EnvSnapshot, ExecutionOutcome, Identity, ProjectRemote,
    ReindexReport,
};
use coproof_domain::{render_statement, ScaffoldRequest, StatementId, StatementParser};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::cli::{
    CommandGroupCli, MirrorCommand, ParseArgs, ProposalArgs, RemoteArgs, ScaffoldArgs, ShowArgs,
    StatementArgs, SubmitArgs,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandInfo {
    pub name: &'static str,
}

impl CommandInfo {
    pub const fn new(name: &'static str) -> Self {
        Self { name }
    }
}

/// Settings shared by every command of one invocation.
#[derive(Debug)]
pub struct CommandContext {
    config: EngineConfig,
}

impl CommandContext {
    pub fn new(storage: Option<&Path>) -> coproof_core::Result<Self> {
        let snapshot = EnvSnapshot::capture();
        let mut config = EngineConfig::from_snapshot(&snapshot)?;
        if let Some(root) = storage {
            if snapshot.var("COPROOF_INDEX_PATH").is_none() {
                config.index_path = root.join("index.sqlite");
            }
            config.storage_root = root.to_path_buf();
        }
        Ok(Self { config })
    }

    fn engine(&self) -> coproof_core::Result<Engine> {
        debug!(storage = %self.config.storage_root.display(), "opening engine");
        Engine::from_config(self.config.clone())
    }
}

pub fn dispatch_command(
    ctx: &CommandContext,
    group: &CommandGroupCli,
) -> (CommandInfo, ExecutionOutcome) {
    match group {
        CommandGroupCli::Scaffold(args) => {
            let info = CommandInfo::new("scaffold");
            (info, scaffold(ctx, args))
        }
        CommandGroupCli::Parse(args) => {
            let info = CommandInfo::new("parse");
            (info, parse(ctx, args))
        }
        CommandGroupCli::Mirror(cmd) => match cmd {
            MirrorCommand::Ensure(args) => {
                let info = CommandInfo::new("mirror ensure");
                core_call(info, ctx, |engine| {
                    let path = engine.ensure_mirror(&project_remote(args))?;
                    Ok(ExecutionOutcome::success(
                        format!("mirror ready at {}", path.display()),
                        json!({ "project": args.project, "path": path }),
                    ))
                })
            }
            MirrorCommand::Fetch(args) => {
                let info = CommandInfo::new("mirror fetch");
                core_call(info, ctx, |engine| {
                    let path = engine.fetch_mirror(&project_remote(args))?;
                    Ok(ExecutionOutcome::success(
                        format!("fetched {}", args.project),
                        json!({ "project": args.project, "path": path }),
                    ))
                })
            }
            MirrorCommand::Evict(args) => {
                let info = CommandInfo::new("mirror evict");
                core_call(info, ctx, |engine| {
                    let removed = engine.evict_mirror(&args.project)?;
                    let message = if removed {
                        format!("evicted mirror for {}", args.project)
                    } else {
                        format!("no mirror for {}", args.project)
                    };
                    Ok(ExecutionOutcome::success(
                        message,
                        json!({ "project": args.project, "removed": removed }),
                    ))
                })
            }
        },
        CommandGroupCli::Sync(args) => {
            let info = CommandInfo::new("sync");
            core_call(info, ctx, |engine| {
                let report = engine.sync_project(&project_remote(args))?;
                Ok(reindex_outcome(&report))
            })
        }
        CommandGroupCli::Reindex(args) => {
            let info = CommandInfo::new("reindex");
            core_call(info, ctx, |engine| {
                let report = engine.reindex(&args.project)?;
                Ok(reindex_outcome(&report))
            })
        }
        CommandGroupCli::Graph(args) => {
            let info = CommandInfo::new("graph");
            core_call(info, ctx, |engine| {
                let statements = engine.store().load_project(&args.project)?;
                let snapshot = engine.store().snapshot(&args.project)?;
                let resolved = statements.iter().filter(|node| node.is_resolved).count();
                Ok(ExecutionOutcome::success(
                    format!("{} statements ({resolved} resolved)", statements.len()),
                    json!({ "snapshot": snapshot, "statements": statements }),
                ))
            })
        }
        CommandGroupCli::Show(args) => {
            let info = CommandInfo::new("show");
            core_call(info, ctx, |engine| show(engine, args))
        }
        CommandGroupCli::Submit(args) => {
            let info = CommandInfo::new("submit");
            let request = match scaffold_request(&args.statement) {
                Ok(request) => request,
                Err(err) => return (info, input_error(&err)),
            };
            core_call(info, ctx, |engine| submit(engine, args, &request))
        }
        CommandGroupCli::Verify(args) => {
            let info = CommandInfo::new("verify");
            core_call(info, ctx, |engine| verify(engine, args))
        }
        CommandGroupCli::Merge(args) => {
            let info = CommandInfo::new("merge");
            core_call(info, ctx, |engine| merge(engine, args))
        }
    }
}

fn core_call<F>(info: CommandInfo, ctx: &CommandContext, action: F) -> (CommandInfo, ExecutionOutcome)
where
    F: FnOnce(&Engine) -> coproof_core::Result<ExecutionOutcome>,
{
    let outcome = ctx
        .engine()
        .and_then(|engine| action(&engine))
        .unwrap_or_else(|err| {
            debug!(command = info.name, error = ?err, "command failed");
            ExecutionOutcome::from_error(&err)
        });
    (info, outcome)
}

fn reindex_outcome(report: &ReindexReport) -> ExecutionOutcome {
    let at = report.commit.as_deref().map_or("an empty branch", short);
    let mut message = format!("indexed {} statements at {at}", report.indexed);
    if !report.skipped.is_empty() {
        message.push_str(&format!(" ({} files skipped)", report.skipped.len()));
    }
    ExecutionOutcome::success(message, to_details(report))
}

fn scaffold(ctx: &CommandContext, args: &ScaffoldArgs) -> ExecutionOutcome {
    let request = match scaffold_request(&args.statement) {
        Ok(request) => request,
        Err(err) => return input_error(&err),
    };
    let rendered = match render_statement(&request, &ctx.config.naming) {
        Ok(rendered) => rendered,
        Err(err) => return ExecutionOutcome::from_error(&EngineError::from(err)),
    };

    let Some(dir) = &args.write else {
        return ExecutionOutcome::success(
            rendered.source.clone(),
            json!({
                "passthrough": true,
                "statement_id": rendered.statement_id,
                "source_path": rendered.paths.source,
                "companion_path": rendered.paths.companion,
                "source": rendered.source,
                "companion": rendered.companion,
            }),
        );
    };

    let mut written = vec![(rendered.paths.source.clone(), rendered.source.clone())];
    if let Some(companion) = &rendered.companion {
        written.push((rendered.paths.companion.clone(), companion.clone()));
    }
    for (rel, contents) in &written {
        if let Err(err) = write_under(dir, rel, contents) {
            return ExecutionOutcome::failure(
                format!("{err:#}"),
                json!({ "reason": "scaffold_write_failed", "path": rel }),
            );
        }
    }
    let paths: Vec<&str> = written.iter().map(|(rel, _)| rel.as_str()).collect();
    ExecutionOutcome::success(
        format!("wrote {} for statement {}", paths.join(", "), rendered.statement_id),
        json!({ "statement_id": rendered.statement_id, "written": paths }),
    )
}

fn parse(ctx: &CommandContext, args: &ParseArgs) -> ExecutionOutcome {
    let contents = match read_input(&args.file) {
        Ok(contents) => contents,
        Err(err) => return input_error(&err),
    };
    let rel_path = args.rel_path.clone().unwrap_or_else(|| {
        args.file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    });
    let parser = StatementParser::new(ctx.config.naming.clone());
    match parser.parse(&rel_path, &contents) {
        Ok(parsed) => ExecutionOutcome::success(
            format!(
                "{} {} ({}, {} dependencies)",
                parsed.kind,
                parsed.statement_id,
                parsed
                    .parent_statement_id
                    .as_ref()
                    .map_or_else(|| "root".to_string(), |parent| format!("parent {parent}")),
                parsed.dependencies.len()
            ),
            to_details(&parsed),
        ),
        Err(err) => ExecutionOutcome::from_error(&EngineError::from(err)),
    }
}

fn show(engine: &Engine, args: &ShowArgs) -> coproof_core::Result<ExecutionOutcome> {
    let files = engine.read_statement(
        &project_remote(&args.remote),
        &args.statement_id,
        args.revision.as_deref(),
    )?;
    let Some(source) = files.source.clone() else {
        return Ok(ExecutionOutcome::user_error(
            format!(
                "statement {} has no {} at {}",
                files.statement_id,
                files.source_path,
                short(&files.commit)
            ),
            json!({ "reason": "statement_not_found", "files": files }),
        ));
    };
    let mut details = to_details(&files);
    if let Value::Object(map) = &mut details {
        map.insert("passthrough".into(), json!(true));
    }
    Ok(ExecutionOutcome::success(source, details))
}

fn submit(
    engine: &Engine,
    args: &SubmitArgs,
    request: &ScaffoldRequest,
) -> coproof_core::Result<ExecutionOutcome> {
    let author = Identity::new(&args.author_name, &args.author_email);
    let outcome = engine.submit_statement(
        &project_remote(&args.remote),
        &author,
        request,
        args.branch.as_deref(),
    )?;
    let message = match &outcome.commit {
        Some(commit) => format!(
            "pushed {} to {} ({})",
            outcome.statement_id,
            outcome.branch,
            short(commit)
        ),
        None => format!("{} already holds {}", outcome.branch, outcome.statement_id),
    };
    Ok(ExecutionOutcome::success(message, to_details(&outcome)))
}

fn verify(engine: &Engine, args: &ProposalArgs) -> coproof_core::Result<ExecutionOutcome> {
    let outcome =
        engine.verify_proposal(&project_remote(&args.remote), &args.branch, &args.statement_id)?;
    let mut details = to_details(&outcome);
    if !outcome.report.valid {
        return Ok(ExecutionOutcome::user_error(
            format!("proof checker rejected {}", outcome.branch),
            details,
        ));
    }
    if outcome.report.contains_open_marker {
        if let Value::Object(map) = &mut details {
            map.insert(
                "hint".into(),
                json!("The proposal compiles but still contains open proof markers."),
            );
        }
    }
    Ok(ExecutionOutcome::success(
        format!("{} compiles against the default branch", outcome.branch),
        details,
    ))
}

fn merge(engine: &Engine, args: &ProposalArgs) -> coproof_core::Result<ExecutionOutcome> {
    let report = engine.merge_proposal(&project_remote(&args.remote), &args.branch, &args.statement_id)?;
    let details = to_details(&report);
    Ok(match &report.merge {
        Some(merge) => ExecutionOutcome::success(
            format!(
                "merged {} into {} ({})",
                merge.source_branch,
                merge.target_branch,
                short(&merge.commit)
            ),
            details,
        ),
        None => ExecutionOutcome::user_error(
            format!("proof checker rejected {}; nothing merged", args.branch),
            details,
        ),
    })
}

fn scaffold_request(args: &StatementArgs) -> anyhow::Result<ScaffoldRequest> {
    let companion = args.companion.as_deref().map(read_input).transpose()?;
    Ok(ScaffoldRequest {
        statement_id: args
            .statement_id
            .clone()
            .unwrap_or_else(|| StatementId::generate().to_string()),
        parent_statement_id: args.parent_statement_id.clone(),
        kind: args.kind,
        name: args.name.clone(),
        signature: args.signature.clone(),
        proof_body: args.proof_body.clone(),
        dependency_ids: args.dependencies.clone(),
        companion,
    })
}

fn read_input(path: &Path) -> anyhow::Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn write_under(root: &Path, rel: &str, contents: &str) -> anyhow::Result<PathBuf> {
    let target = root.join(rel);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(&target, contents)
        .with_context(|| format!("failed to write {}", target.display()))?;
    Ok(target)
}

fn input_error(err: &anyhow::Error) -> ExecutionOutcome {
    ExecutionOutcome::user_error(format!("{err:#}"), json!({ "reason": "unreadable_input" }))
}

fn project_remote(args: &RemoteArgs) -> ProjectRemote {
    ProjectRemote::new(&args.project, &args.remote)
}

fn to_details<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn short(commit: &str) -> &str {
    commit.get(..12).unwrap_or(commit)
}
