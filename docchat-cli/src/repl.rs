//! Line-oriented chat loop.
//!
//! Lines starting with `:` are commands; anything else is a question.
//! Ctrl-C cancels the operation in flight and returns to the prompt.

use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use docchat_rag::{Document, IngestReport, QueryEvent, Role, Session};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio_util::sync::CancellationToken;

const PROMPT: &str = "docchat> ";

const HELP: &str = "\
Commands:
  :load <path>     index a text file (replaces the current document)
  :save <dir>      save the index and document to a directory
  :restore <dir>   load a saved index without re-embedding
  :history         show this conversation
  :status          show the session state
  :help            show this help
  :quit            exit
Anything else is a question about the loaded document.
Ctrl-C cancels a running load or answer.";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Load(PathBuf),
    Save(PathBuf),
    Restore(PathBuf),
    History,
    Status,
    Help,
    Quit,
    Ask(String),
    Nothing,
}

impl Command {
    fn parse(line: &str) -> std::result::Result<Self, String> {
        let line = line.trim();
        let Some(rest) = line.strip_prefix(':') else {
            return Ok(if line.is_empty() { Command::Nothing } else { Command::Ask(line.to_string()) });
        };

        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };
        let path = || {
            if arg.is_empty() { Err(format!(":{name} needs a path")) } else { Ok(PathBuf::from(arg)) }
        };

        match name {
            "load" | "l" => path().map(Command::Load),
            "save" => path().map(Command::Save),
            "restore" => path().map(Command::Restore),
            "history" | "h" => Ok(Command::History),
            "status" | "s" => Ok(Command::Status),
            "help" | "?" => Ok(Command::Help),
            "quit" | "q" | "exit" => Ok(Command::Quit),
            other => Err(format!("unknown command :{other} (try :help)")),
        }
    }
}

/// Run the chat loop until `:quit` or end of input.
pub async fn run(session: Arc<Session>, initial_document: Option<PathBuf>) -> Result<()> {
    if let Some(path) = initial_document {
        load(&session, &path).await;
    } else {
        println!("Load a document with :load <path>. Type :help for commands.");
    }

    let mut editor = DefaultEditor::new().context("failed to initialize line editor")?;
    loop {
        let (returned, line) = tokio::task::spawn_blocking(move || {
            let line = editor.readline(PROMPT);
            (editor, line)
        })
        .await
        .context("line editor task failed")?;
        editor = returned;

        let line = match line {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e).context("failed to read input"),
        };
        if !line.trim().is_empty() {
            let _ = editor.add_history_entry(line.as_str());
        }

        match Command::parse(&line) {
            Ok(Command::Nothing) => {}
            Ok(Command::Quit) => break,
            Ok(Command::Help) => println!("{HELP}"),
            Ok(Command::Load(path)) => load(&session, &path).await,
            Ok(Command::Save(dir)) => match session.save_snapshot(&dir).await {
                Ok(()) => println!("Saved to {}", dir.display()),
                Err(e) => eprintln!("error: {e}"),
            },
            Ok(Command::Restore(dir)) => {
                let cancel = CancellationToken::new();
                match interruptible(&cancel, session.restore_snapshot(&dir, &cancel)).await {
                    Ok(report) => print_report("Restored", &report),
                    Err(e) => eprintln!("error: {e}"),
                }
            }
            Ok(Command::History) => print_history(&session),
            Ok(Command::Status) => print_status(&session),
            Ok(Command::Ask(question)) => ask(&session, question).await,
            Err(message) => eprintln!("{message}"),
        }
    }
    Ok(())
}

async fn load(session: &Session, path: &Path) {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) => {
            eprintln!("error: cannot read {}: {e}", path.display());
            return;
        }
    };
    let id = path.file_name().map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
    let document = Document::new(id, text).with_source_uri(path.display().to_string());

    println!("Processing {}...", path.display());
    let cancel = CancellationToken::new();
    match interruptible(&cancel, session.ingest(document, &cancel)).await {
        Ok(report) => print_report("Loaded", &report),
        Err(e) => eprintln!("error: {e}"),
    }
}

async fn ask(session: &Arc<Session>, question: String) {
    let cancel = CancellationToken::new();
    let mut events = session.spawn_query(question, cancel.clone());
    let mut stdout = std::io::stdout();

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                continue;
            }
        };
        let Some(event) = event else { break };

        match event {
            QueryEvent::Retrieved(results) => {
                if results.is_empty() {
                    println!("(no relevant passages found)");
                }
                for (rank, result) in results.iter().enumerate() {
                    let excerpt: String = result.chunk.text.chars().take(160).collect();
                    println!("[{}] {} ({:.3}): {}", rank + 1, result.chunk.id, result.score, excerpt.replace('\n', " "));
                }
                println!();
            }
            QueryEvent::Delta(fragment) => {
                print!("{fragment}");
                let _ = stdout.flush();
            }
            QueryEvent::Completed(_) => println!(),
            QueryEvent::Failed(e) => eprintln!("\nerror: {e}"),
        }
    }
}

/// Await `operation`, cancelling `cancel` on Ctrl-C and then waiting for
/// the operation to wind down.
async fn interruptible<T>(cancel: &CancellationToken, operation: impl Future<Output = T>) -> T {
    tokio::pin!(operation);
    tokio::select! {
        output = &mut operation => output,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            operation.await
        }
    }
}

fn print_report(verb: &str, report: &IngestReport) {
    let dimensions = report.dimensions.map_or_else(|| "-".to_string(), |d| d.to_string());
    println!("{verb} {}: {} chunks, {dimensions} dimensions", report.document_id, report.chunk_count);
}

fn print_history(session: &Session) {
    let history = session.history();
    if history.is_empty() {
        println!("(no messages yet)");
    }
    for message in history {
        let who = match message.role {
            Role::User => "you",
            Role::Assistant => "docchat",
        };
        println!("{who}: {}", message.text);
    }
}

fn print_status(session: &Session) {
    let pipeline = session.pipeline();
    let config = pipeline.config();
    println!("session:   {}", session.id());
    println!("state:     {}", session.state());
    println!("document:  {}", session.document_id().as_deref().unwrap_or("-"));
    if let Some(index) = session.index() {
        println!("chunks:    {}", index.len());
        println!("metric:    {}", index.metric());
    }
    println!("models:    {} / {}", pipeline.embedding_provider().name(), pipeline.synthesizer().name());
    println!("top_k:     {}", config.top_k);
    println!("chunking:  {:?} {}/{}", config.chunking, config.chunk_size, config.chunk_overlap);
    println!("cache:     {:?}", config.cache_policy);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_lines_are_questions() {
        assert_eq!(Command::parse("  what happened? "), Ok(Command::Ask("what happened?".into())));
        assert_eq!(Command::parse("   "), Ok(Command::Nothing));
    }

    #[test]
    fn commands_take_paths() {
        assert_eq!(Command::parse(":load notes/my file.txt"), Ok(Command::Load("notes/my file.txt".into())));
        assert_eq!(Command::parse(":restore faiss_index"), Ok(Command::Restore("faiss_index".into())));
        assert!(Command::parse(":save").is_err());
    }

    #[test]
    fn short_aliases_and_unknown_commands() {
        assert_eq!(Command::parse(":q"), Ok(Command::Quit));
        assert_eq!(Command::parse(":status"), Ok(Command::Status));
        assert!(Command::parse(":frobnicate").unwrap_err().contains("unknown command"));
    }
}
