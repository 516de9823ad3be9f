mod args;
mod logging;

use anyhow::{Context, Result};
use args::{Args, Command};
use birdwatch::{AuditModel, EventPayload, VmProfile};
use clap::Parser;
use std::path::Path;

fn main() -> Result<()> {
    let args = Args::parse();
    logging::initialize_logging(args.log_level.as_deref(), args.log_file.as_deref())?;

    match args.command {
        Command::Inspect { auditlog } => inspect(&auditlog),
        Command::Events { auditlog } => events(&auditlog),
        Command::Trace {
            auditlog,
            traceno,
            no_ir,
        } => trace(&auditlog, traceno, no_ir),
        Command::Profile { profiles } => profile(&profiles),
    }
}

fn load(path: &Path) -> Result<AuditModel> {
    AuditModel::load(path).with_context(|| format!("loading audit log {}", path.display()))
}

fn inspect(path: &Path) -> Result<()> {
    let model = load(path)?;
    println!("{}", path.display());
    println!("  events:     {}", model.events.len());
    println!("  traces:     {}", model.trace_numbers().count());
    println!("  aborts:     {}", model.aborts.len());
    println!("  prototypes: {}", model.prototypes.len());
    println!("  ctypes:     {}", model.ctypes.len());
    println!("  memory:     {} records", model.memory().len());
    Ok(())
}

fn events(path: &Path) -> Result<()> {
    let model = load(path)?;
    for event in &model.events {
        let detail = match &event.payload {
            EventPayload::NewPrototype { address } => {
                let name = model
                    .prototypes
                    .get(address)
                    .map(|p| p.declname.as_str())
                    .unwrap_or("?");
                format!("prototype {name} @ {address:#x}")
            }
            EventPayload::NewCtype { id, desc } => format!("ctype {id}: {desc}"),
            EventPayload::TraceStop { traceno } => format!("trace {traceno}"),
            EventPayload::TraceAbort { abort } => {
                format!("abort: {}", model.aborts[*abort].trace_error)
            }
            EventPayload::Lex | EventPayload::Other => String::new(),
        };
        println!(
            "{:12.6}s {:<14} {}",
            event.reltime as f64 / 1e9,
            event.name,
            detail
        );
    }
    Ok(())
}

fn trace(path: &Path, traceno: u16, no_ir: bool) -> Result<()> {
    let model = load(path)?;
    let trace = model
        .trace(traceno)
        .with_context(|| format!("no trace {traceno} in {}", path.display()))?;

    println!("trace {traceno}  start {}", trace.start_id());
    match trace.parent() {
        Some(parent) => println!("  parent:   {}", parent.number()),
        None => println!("  parent:   none (root)"),
    }
    println!("  children: {:?}", trace.children());
    println!("  events:   {}", trace.events().len());
    println!("  mcode:    {} bytes", trace.data().szmcode);

    println!("contour:");
    for li in trace.contour() {
        println!(
            "  {:>3} {}:{} {} (defined at line {})",
            li.framedepth, li.chunkname, li.chunkline, li.declname, li.declline
        );
    }

    println!("bytecode:");
    for (pos, bc) in trace.bytecodes().iter().enumerate() {
        match bc {
            Some(bc) => println!("  [{pos:3}] {bc}"),
            None => println!("  [{pos:3}] ?"),
        }
    }

    if !no_ir {
        println!("ir:");
        for ins in trace.instructions()? {
            println!("  {ins}");
        }
    }
    Ok(())
}

fn profile(paths: &[std::path::PathBuf]) -> Result<()> {
    let mut profiles = Vec::new();
    for path in paths {
        profiles.push(
            VmProfile::load(path).with_context(|| format!("loading profile {}", path.display()))?,
        );
    }
    let selected = match profiles.as_slice() {
        [one] => one.clone(),
        [first, .., last] => first.delta(last).context("profiles disagree on shape")?,
        [] => unreachable!("clap requires at least one path"),
    };

    println!("total samples: {}", selected.total_samples());
    for (state, count) in selected.total_vmst_samples() {
        if *count > 0 {
            println!("  {state:<8} {count}");
        }
    }
    println!("hot traces:");
    for hot in selected.hot_traces().iter().take(20) {
        let label = hot
            .traceno
            .map(|t| t.to_string())
            .unwrap_or_else(|| "none".to_string());
        let states: Vec<String> = hot
            .vmst
            .iter()
            .map(|(name, count)| format!("{name}:{count}"))
            .collect();
        println!("  {label:>5}  {:>8}  {}", hot.total, states.join(" "));
    }
    Ok(())
}
