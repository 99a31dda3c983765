use crate::error::CommandParseError;

/// Command names offered by the shell completer, in help order.
pub const COMMANDS: &[&str] = &[
    "status", "start", "stop", "restart", "startall", "stopall", "reload", "config", "attach",
    "help", "quit", "exit",
];

pub const HELP: &str = "\
commands:
  status                 show every program instance and its state
  start <program>        start all instances of a program
  stop <program>         stop all instances of a program
  restart <program>      restart all instances of a program
  startall               start every program
  stopall                stop every program
  reload                 re-read the config file and apply the changes
  config [program ...]   print the effective configuration
  attach <program> [i]   print the last output lines of instance i
  help                   show this help
  quit | exit            stop everything and shut the daemon down";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    All,
    One(String),
}

/// One parsed control line. Signals translate into the same enum, so
/// every mutation funnels through the identical dispatch path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    Start(Target),
    Stop(Target),
    Restart(String),
    Reload,
    Config(Vec<String>),
    Attach { name: String, index: usize },
    Help,
    Shutdown,
    /// Flips the log level between INFO and DEBUG. Not reachable from
    /// the text protocol, only via SIGUSR2.
    ToggleVerbosity,
}

/*
    @@@
    @parse_line();
    . Splits one control line on whitespace; the first word selects the command.
    . Wrong arity comes back as a usage message, an unknown first word as an error naming it.
    . Both are session-level errors: the caller replies with the text and keeps the session open.
*/
pub fn parse_line(line: &str) -> Result<Command, CommandParseError> {
    let mut words = line.split_whitespace();
    let head = words.next().ok_or(CommandParseError::Empty)?;
    let args: Vec<&str> = words.collect();

    match head {
        "status" => exact(Command::Status, &args, "status"),
        "reload" => exact(Command::Reload, &args, "reload"),
        "startall" => exact(Command::Start(Target::All), &args, "startall"),
        "stopall" => exact(Command::Stop(Target::All), &args, "stopall"),
        "help" => exact(Command::Help, &args, "help"),
        "quit" | "exit" => exact(Command::Shutdown, &args, "quit"),
        "start" => one_name(&args, "start <program>").map(|n| Command::Start(Target::One(n))),
        "stop" => one_name(&args, "stop <program>").map(|n| Command::Stop(Target::One(n))),
        "restart" => one_name(&args, "restart <program>").map(Command::Restart),
        "config" => Ok(Command::Config(args.iter().map(|s| s.to_string()).collect())),
        "attach" => match args.as_slice() {
            [name] => Ok(Command::Attach { name: name.to_string(), index: 0 }),
            [name, index] => index
                .parse::<usize>()
                .map(|index| Command::Attach { name: name.to_string(), index })
                .map_err(|_| CommandParseError::Usage("attach <program> [index]")),
            _ => Err(CommandParseError::Usage("attach <program> [index]")),
        },
        other => Err(CommandParseError::Unknown(other.to_string())),
    }
}

fn exact(cmd: Command, args: &[&str], usage: &'static str) -> Result<Command, CommandParseError> {
    if args.is_empty() {
        Ok(cmd)
    } else {
        Err(CommandParseError::Usage(usage))
    }
}

fn one_name(args: &[&str], usage: &'static str) -> Result<String, CommandParseError> {
    match args {
        [name] => Ok((*name).to_string()),
        _ => Err(CommandParseError::Usage(usage)),
    }
}
