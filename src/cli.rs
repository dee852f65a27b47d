//! Command-line surface for the bundled prime counter.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::config::Settings;
use crate::demo;
use crate::engine::{Args, Program, Structural};
use crate::executor::{ContinuousExecutor, StepExecutor, TurnOutcome, TurnRecord, TurnState};

#[derive(Parser, Debug)]
#[command(name = "colloquy")]
#[command(about = "Run resumable conversational programs", long_about = None)]
pub struct Cli {
    /// Data directory (defaults to ~/.colloquy)
    #[arg(long, global = true, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct EntryArgs {
    /// Entry argument; the value is parsed as JSON, falling back to a string
    #[arg(long = "arg", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub args: Vec<(String, Value)>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print every step's name, documentation and request schema
    Docs,

    /// Converse live over stdin/stdout
    Run {
        #[command(flatten)]
        entry: EntryArgs,
    },

    /// Converse over stdin/stdout, replaying one turn at a time
    Steprun {
        #[command(flatten)]
        entry: EntryArgs,
    },

    /// Advance a persisted conversation by exactly one turn
    Step {
        /// Turn record file; a bare file name is kept under the records directory
        #[arg(long, value_name = "FILE")]
        record: PathBuf,

        /// User reply to the last assistant message
        #[arg(long)]
        reply: Option<String>,

        #[command(flatten)]
        entry: EntryArgs,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))?;
    if key.is_empty() {
        return Err(format!("missing key in `{raw}`"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

impl EntryArgs {
    /// Configured defaults overridden by the command line.
    pub fn resolve(&self, settings: &Settings) -> Args {
        let mut merged: Map<String, Value> = settings.entry_args.clone();
        for (key, value) in &self.args {
            merged.insert(key.clone(), value.clone());
        }
        Args::from_json(merged)
    }
}

fn record_path(record: &Path, settings: &Settings) -> PathBuf {
    let bare = record.is_relative() && record.parent() == Some(Path::new(""));
    if bare {
        settings.records_dir.join(record)
    } else {
        record.to_path_buf()
    }
}

pub async fn execute(command: Command, settings: &Settings) -> Result<()> {
    let program = demo::shared_prime_counter()?;
    let mut stdout = std::io::stdout();
    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin());

    match command {
        Command::Docs => print_docs(&program, &mut stdout),
        Command::Run { entry } => {
            run_live(program, entry.resolve(settings), &mut stdin, &mut stdout).await
        }
        Command::Steprun { entry } => {
            run_stepwise(program, entry.resolve(settings), &mut stdin, &mut stdout).await
        }
        Command::Step {
            record,
            reply,
            entry,
        } => {
            let path = record_path(&record, settings);
            step_once(
                program,
                &path,
                reply,
                entry.resolve(settings),
                &mut stdout,
            )
            .await
        }
    }
}

pub fn print_docs<R: Structural>(program: &Program<R>, out: &mut impl Write) -> Result<()> {
    let definitions = program.steps().iter().chain(program.entry_definition());
    for definition in definitions {
        writeln!(out, "{}", definition.name)?;
        writeln!(out, "{}", definition.doc)?;
        writeln!(
            out,
            "{}",
            serde_json::to_string_pretty(&definition.request_schema())?
        )?;
        writeln!(out, "===")?;
    }
    Ok(())
}

async fn read_reply(input: &mut (impl AsyncBufRead + Unpin), out: &mut impl Write) -> Result<Option<String>> {
    write!(out, "User: ")?;
    out.flush()?;
    let mut line = String::new();
    if input.read_line(&mut line).await? == 0 {
        writeln!(out)?;
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

/// Drive `program` live until it ends or `input` runs dry.
pub async fn run_live<R: Structural + std::fmt::Debug>(
    program: Arc<Program<R>>,
    args: Args,
    input: &mut (impl AsyncBufRead + Unpin),
    out: &mut impl Write,
) -> Result<()> {
    let mut executor = ContinuousExecutor::start(program, args);
    loop {
        let state = executor.wait_for_turn().await?;
        for message in executor.drain_messages() {
            writeln!(out, "Assistant: {message}")?;
        }
        if state == TurnState::Ended {
            break;
        }
        match read_reply(input, out).await? {
            Some(reply) => executor.post_reply(reply)?,
            None => {
                tracing::info!("input closed before the conversation ended");
                return Ok(());
            }
        }
    }
    let result = executor.join().await?;
    writeln!(out, "Result: {result:?}")?;
    Ok(())
}

/// Drive `program` through a [`StepExecutor`], one turn per reply.
pub async fn run_stepwise<R: Structural + std::fmt::Debug>(
    program: Arc<Program<R>>,
    args: Args,
    input: &mut (impl AsyncBufRead + Unpin),
    out: &mut impl Write,
) -> Result<()> {
    let mut executor = StepExecutor::start(program);
    loop {
        let outcome = executor.run(args.clone()).await?;
        writeln!(out, "Assistant: {}", outcome.message().text)?;
        if let TurnOutcome::Completed { value, .. } = outcome {
            writeln!(out, "Result: {value:?}")?;
            return Ok(());
        }
        match read_reply(input, out).await? {
            Some(reply) => executor.push_user_message(reply)?,
            None => return Ok(()),
        }
    }
}

/// Load the record at `path`, apply `reply`, run one turn and save.
pub async fn step_once<R: Structural + std::fmt::Debug>(
    program: Arc<Program<R>>,
    path: &Path,
    reply: Option<String>,
    args: Args,
    out: &mut impl Write,
) -> Result<()> {
    let record = TurnRecord::load_or_default(path)?;
    let mut executor = StepExecutor::from_record(program, record)?;
    if let Some(reply) = reply {
        executor
            .push_user_message(reply)
            .context("Cannot add the reply to this conversation")?;
    }

    let outcome = executor.run(args).await?;
    tracing::debug!(
        path = %path.display(),
        new_entries = executor.delta().len(),
        "saving turn record"
    );
    executor.to_record().save(path)?;

    writeln!(out, "Assistant: {}", outcome.message().text)?;
    if let TurnOutcome::Completed { value, .. } = outcome {
        writeln!(out, "Result: {value:?}")?;
    }
    Ok(())
}
