use anyhow::Result;
use clap::Parser;
use gustav_core::{describe, list_conditions, ExperimentBuilder, GustavError, SettingsFile};
use serde_json::{json, Value};
use std::io::IsTerminal;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

#[derive(Parser)]
#[command(name = "gustav", version = "0.3.0", about = "Psychoacoustic experiment runner")]
struct Cli {
    /// Print the resolved configuration and exit.
    #[arg(short = 'c', long = "config")]
    config: bool,
    /// Print the condition table and exit.
    #[arg(short = 'l', long = "list")]
    list: bool,
    /// Run without writing data or log files.
    #[arg(short = 'd', long = "dontrecord")]
    dont_record: bool,
    #[arg(short = 'f', long = "frontend")]
    frontend: Option<String>,
    #[arg(short = 's', long = "settingsFile", default_value = "settings.yaml")]
    settings_file: PathBuf,
    #[arg(short = 'i', long = "subjectID")]
    subject_id: Option<String>,
    /// Emit machine-readable output.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = cli.json;
    match run_command(cli) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            let code = match err.downcast_ref::<GustavError>() {
                Some(core) if core.is_config() => ("config_error", 2),
                _ => ("run_failed", 1),
            };
            if json_mode {
                emit_json(&json_error(code.0, err.to_string()));
            } else {
                eprintln!("gustav: {:#}", err);
            }
            std::process::exit(code.1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr);
    Registry::default().with(filter).with(fmt_layer).init();
}

fn run_command(cli: Cli) -> Result<Option<Value>> {
    let settings = SettingsFile::load(&cli.settings_file)?;
    tracing::debug!(path = %cli.settings_file.display(), "settings loaded");

    if cli.list {
        let table = list_conditions(&settings)?;
        if cli.json {
            return Ok(Some(json!({ "ok": true, "table": table })));
        }
        print!("{}", table);
        return Ok(None);
    }

    if cli.config {
        let description = describe(&settings)?;
        if cli.json {
            return Ok(Some(json!({ "ok": true, "config": description })));
        }
        print_description(&description);
        return Ok(None);
    }

    let mut builder = ExperimentBuilder::new(settings);
    if let Some(name) = &cli.frontend {
        builder = builder.frontend_name(name);
    }
    if let Some(subject) = &cli.subject_id {
        builder = builder.subject(subject);
    }
    if cli.dont_record {
        builder = builder.record(false);
    }
    let summary = builder.configure()?.run()?;
    if cli.json {
        return Ok(Some(json!({ "ok": true, "summary": summary })));
    }
    print_summary(&summary);
    Ok(None)
}

fn print_description(desc: &gustav_core::ExperimentDescription) {
    println!("experiment: {}", desc.name);
    if !desc.note.is_empty() {
        println!("note: {}", desc.note);
    }
    println!("method: {}", desc.method);
    println!("frontend: {}", desc.frontend);
    println!("record: {}", desc.record);
    if !desc.data_file.is_empty() {
        println!("data_file: {}", desc.data_file);
    }
    if !desc.log_file.is_empty() {
        println!("log_file: {}", desc.log_file);
    }
    println!("valid_keys: {:?}", desc.valid_keys);
    println!("quit_keys: {:?}", desc.quit_keys);
    println!("variables: {:?}", desc.variables);
    println!("conditions: {}", desc.conditions);
    println!("order: {}", desc.order);
    if !desc.ignored.is_empty() {
        println!("ignored: {:?}", desc.ignored);
    }
    println!("blocks: {}", desc.blocks);
    for (name, count) in &desc.stim_sets {
        println!("stim[{}]: {} tokens", name, count);
    }
    for (point, names) in &desc.hooks {
        println!("hooks[{}]: {}", point, names.join(", "));
    }
    if !desc.disabled.is_empty() {
        println!("disabled: {:?}", desc.disabled);
    }
}

fn print_summary(summary: &gustav_core::RunSummary) {
    println!("experiment: {}", summary.name);
    println!("subject: {}", summary.subject);
    println!("blocks_run: {}", summary.blocks_run);
    println!("trials_run: {}", summary.trials_run);
    println!("cancelled: {}", summary.cancelled);
    if let Some(path) = &summary.data_file {
        println!("data_file: {}", path.display());
    }
    if let Some(path) = &summary.log_file {
        println!("log_file: {}", path.display());
    }
    for block in &summary.blocks {
        match &block.adaptive {
            Some(result) if result.good_run => println!(
                "block {} (condition {}): mean={:.3} sd={:.3} [{}]",
                block.block, block.condition, result.mean, result.sd, result.msg
            ),
            Some(result) => println!(
                "block {} (condition {}): no estimate [{}]",
                block.block, block.condition, result.msg
            ),
            None => println!(
                "block {} (condition {}): {} trials",
                block.block, block.condition, block.trials
            ),
        }
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}
