use std::io;
use std::path::Path;
use std::sync::Arc;

use rustyline::completion::{Completer, Pair};
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::history::FileHistory;
use rustyline::validate::Validator;
use rustyline::{Config, Context, Editor, Helper};

use crate::command::{Command, COMMANDS};
use crate::control::{ControlInterface, Dispatch};

/*
    @@@
    @CmdCompleter;
    . Drops CmdCompleter into 'rl.set_helper(Some(...))' and get instant, prefix-based command completion.
    . Plugs into rustyline to provide simple tab-completion based on the fixed list of command names.
*/
struct CmdCompleter {
    commands: Vec<String>,
}
impl Helper for CmdCompleter {}
impl Hinter for CmdCompleter {
    type Hint = String;
}
impl Highlighter for CmdCompleter {}
impl Validator for CmdCompleter {}
impl Completer for CmdCompleter {
    type Candidate = Pair;
    fn complete(
        &self,
        line: &str,
        _pos: usize,
        _ctx: &Context<'_>,
    ) -> Result<(usize, Vec<Pair>), ReadlineError> {
        let mut matches = Vec::new();
        for cmd in &self.commands {
            if cmd.starts_with(line) {
                matches.push(Pair {
                    display: cmd.clone(),
                    replacement: cmd.clone(),
                });
            }
        }
        Ok((0, matches))
    }
}

/*
    @@@
    @run_shell();
    . Interactive control session on stdin with history and completion; every line goes through the shared dispatch path.
    . Each readline call runs on a blocking thread so the monitor, the signal task and socket sessions keep running behind the prompt.
    . Ctrl-C and Ctrl-D behave like quit: stop everything, then leave.
*/
pub async fn run_shell(ctl: Arc<ControlInterface>, log_dir: &Path) -> rustyline::Result<()> {
    let config = Config::builder().build();
    let mut rl: Editor<CmdCompleter, FileHistory> = Editor::with_config(config)?;
    rl.set_helper(Some(CmdCompleter {
        commands: COMMANDS.iter().map(|s| s.to_string()).collect(),
    }));
    let history = log_dir.join("history.txt");
    let _ = rl.load_history(&history);

    loop {
        let (line, editor) = tokio::task::spawn_blocking(move || {
            let mut rl = rl;
            let line = rl.readline("taskmaster> ");
            (line, rl)
        })
        .await
        .map_err(|e| ReadlineError::Io(io::Error::new(io::ErrorKind::Other, e)))?;
        rl = editor;

        match line {
            Ok(line) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                rl.add_history_entry(input)?;
                match ctl.handle_line(input).await {
                    Dispatch::Reply(text) => {
                        if !text.is_empty() {
                            println!("{text}");
                        }
                    }
                    Dispatch::Shutdown(text) => {
                        println!("{text}");
                        break;
                    }
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                if let Dispatch::Shutdown(text) = ctl.dispatch(Command::Shutdown).await {
                    println!("{text}");
                }
                break;
            }
            Err(err) => {
                eprintln!("Error: {err:?}");
                break;
            }
        }
    }

    rl.save_history(&history)?;
    Ok(())
}
