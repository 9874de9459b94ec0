use crate::cli::{Cli, Command, ConfigArgs, ConfigCommand, RunArgs};
use crate::config::{self, Config};
use crate::driver::{
    CancelToken, DEFAULT_EXIT_SIGNAL, DEFAULT_MAX_ITERATIONS, Driver, PROMPT_FILE_NAME, Verbosity,
};
use crate::history::FailureReason;
use crate::invoker::AgentInvoker;
use crate::prompt::PromptResolver;
use crate::retry::RetryPolicy;
use crate::version;
use std::env;
use std::fmt::Display;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

pub fn run(cli: Cli, cancel: &CancelToken) -> Result<(), CliError> {
    let Some(command) = cli.command else {
        cmd_intro();
        return Ok(());
    };
    dispatch(command, cancel)
}

pub fn exit_code_for(result: Result<(), CliError>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliError::Cancelled) => {
            eprintln!("Cancelled.");
            ExitCode::from(130)
        }
        Err(err) => {
            eprintln!("Error: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn dispatch(command: Command, cancel: &CancelToken) -> Result<(), CliError> {
    match command {
        Command::Run(args) => cmd_run(args, cancel),
        Command::Init => cmd_init(),
        Command::Prompts => cmd_prompts(),
        Command::Config(args) => cmd_config(args),
        Command::Version => cmd_version(),
    }
}

#[derive(Debug)]
pub(crate) enum CliError {
    Message(String),
    Io(io::Error),
    Cancelled,
}

impl Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Message(message) => write!(f, "{}", message),
            CliError::Io(err) => write!(f, "{}", err),
            CliError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl From<io::Error> for CliError {
    fn from(value: io::Error) -> Self {
        CliError::Io(value)
    }
}

fn cmd_intro() {
    println!("atom - autonomous iteration driver\n");
    println!("atom runs a coding agent against one task until it emits the exit signal,");
    println!("retrying transient failures and stopping at the iteration cap.\n");
    println!("Get started:");
    println!("  atom run \"fix the failing tests\"");
    println!("  atom run --toolname atom_review --dir /path/to/project");
    println!("  atom run --ephemeral --quiet \"summarize this repository\"\n");
    println!("Common commands:");
    println!("  atom init");
    println!("  atom prompts");
    println!("  atom config list");
    println!("  atom version\n");
    println!("More help:");
    println!("  atom --help");
    println!("  atom <command> --help");
}

fn cmd_version() -> Result<(), CliError> {
    println!("atom v{}", version::VERSION);
    Ok(())
}

fn cmd_init() -> Result<(), CliError> {
    let home = config::atom_home();
    let mut created = Vec::new();
    let mut existing = Vec::new();
    for name in ["bin", "tools", "prompts"] {
        let dir = home.join(name);
        if dir.is_dir() {
            existing.push(dir);
        } else {
            fs::create_dir_all(&dir).map_err(CliError::Io)?;
            created.push(dir);
        }
    }

    println!("User scope: {}", home.display());
    for dir in &created {
        println!("Created {}", dir.display());
    }
    for dir in &existing {
        println!("Exists  {}", dir.display());
    }
    Ok(())
}

fn cmd_prompts() -> Result<(), CliError> {
    let project_dir = env::current_dir().ok();
    let resolver = PromptResolver::new(project_dir.as_deref());
    let prompts = resolver.list();
    if prompts.is_empty() {
        println!("No prompt files found.");
        println!("Searched:");
        for dir in resolver.search_dirs() {
            println!("  {}", dir.display());
        }
        return Ok(());
    }

    let width = prompts
        .iter()
        .map(|(name, _)| name.len())
        .max()
        .unwrap_or(0)
        .max("NAME".len());
    println!("{:<width$}  SOURCE", "NAME");
    for (name, source) in prompts {
        println!("{:<width$}  {}", name, source.display());
    }
    Ok(())
}

fn cmd_config(args: ConfigArgs) -> Result<(), CliError> {
    let project_dir = env::current_dir().ok();
    let config =
        Config::load(project_dir.as_deref()).map_err(|err| CliError::Message(err.to_string()))?;
    match args.command {
        Some(ConfigCommand::Get(args)) => {
            let value = config
                .get(&args.key)
                .ok_or_else(|| CliError::Message(format!("Config key not found: {}", args.key)))?;
            println!("{}", value);
            Ok(())
        }
        Some(ConfigCommand::List) | None => {
            for (key, value) in config.list() {
                println!("{} = {}", key, value);
            }
            Ok(())
        }
    }
}

fn cmd_run(args: RunArgs, cancel: &CancelToken) -> Result<(), CliError> {
    // The user-scope layout is part of the CLI contract.
    ensure_user_layout()?;

    let conversation_dir = if args.ephemeral {
        None
    } else {
        Some(match args.dir.clone() {
            Some(dir) => dir,
            None => env::current_dir().map_err(CliError::Io)?,
        })
    };

    let task_text = resolve_task_text(&args, conversation_dir.as_deref())?;

    let config = Config::load(conversation_dir.as_deref())
        .map_err(|err| CliError::Message(err.to_string()))?;
    let max_iterations = args
        .max_iterations
        .or_else(|| {
            config
                .get_u64("defaults.max_iterations")
                .map(|value| value as u32)
        })
        .unwrap_or(DEFAULT_MAX_ITERATIONS);
    let exit_signal = args
        .exit_signal
        .clone()
        .unwrap_or_else(|| config.get_or("defaults.exit_signal", DEFAULT_EXIT_SIGNAL));
    let cleanup = args.cleanup || config.get_bool("defaults.cleanup").unwrap_or(false);
    let verbosity = if args.verbose {
        Verbosity::Verbose
    } else if args.quiet {
        Verbosity::Quiet
    } else {
        Verbosity::Auto
    };

    let resolver = PromptResolver::new(conversation_dir.as_deref());
    let system_prompt = resolver
        .compose(args.toolname.as_deref(), max_iterations)
        .map_err(|err| CliError::Message(err.to_string()))?;
    let invoker =
        AgentInvoker::from_config(&config).map_err(|err| CliError::Message(err.to_string()))?;
    let retry_policy = RetryPolicy::from_config(&config);

    let driver = match conversation_dir {
        Some(dir) => Driver::new(system_prompt, dir),
        None => Driver::ephemeral(system_prompt),
    }
    .map_err(|err| CliError::Message(err.to_string()))?
    .with_max_iterations(max_iterations)
    .with_exit_signal(exit_signal)
    .with_verbosity(verbosity)
    .with_cleanup(cleanup)
    .with_retry_policy(retry_policy)
    .with_invoker(Box::new(invoker));

    let outcome = driver.run(&task_text, cancel);

    if args.json {
        let rendered = serde_json::to_string_pretty(&outcome)
            .map_err(|err| CliError::Message(err.to_string()))?;
        println!("{}", rendered);
    } else if !outcome.output.is_empty() {
        println!("{}", outcome.output);
    }

    match (outcome.success, outcome.reason) {
        (true, _) => Ok(()),
        (false, Some(FailureReason::Cancelled)) => Err(CliError::Cancelled),
        (false, reason) => {
            let tag = reason.map(|r| r.as_str()).unwrap_or("failed");
            let detail = outcome
                .error_detail
                .map(|detail| format!(": {}", detail))
                .unwrap_or_default();
            Err(CliError::Message(format!(
                "run failed after {} iteration(s) ({}{})",
                outcome.iterations, tag, detail
            )))
        }
    }
}

fn resolve_task_text(args: &RunArgs, conversation_dir: Option<&std::path::Path>) -> Result<String, CliError> {
    if !args.prompt.is_empty() {
        return Ok(args.prompt.join(" "));
    }
    let Some(dir) = conversation_dir else {
        return Err(CliError::Message(
            "a task prompt is required with --ephemeral".to_string(),
        ));
    };
    let prompt_path: PathBuf = dir.join(PROMPT_FILE_NAME);
    fs::read_to_string(&prompt_path).map_err(|_| {
        CliError::Message(format!(
            "No task prompt given and no {} in {}",
            PROMPT_FILE_NAME,
            dir.display()
        ))
    })
}

fn ensure_user_layout() -> Result<(), CliError> {
    let home = config::atom_home();
    for name in ["bin", "tools", "prompts"] {
        fs::create_dir_all(home.join(name)).map_err(CliError::Io)?;
    }
    Ok(())
}
