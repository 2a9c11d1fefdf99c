mod cli;
mod commands;

use cli::{CliError, CliOptions, Command};
use commands::CommandError;

const DEFAULT_LOG_FILTER: &str = "gateway_cli=info,llm_gateway=info";

#[tokio::main]
async fn main() {
    if let Err(err) = load_dotenv() {
        eprintln!("{err}");
        std::process::exit(1);
    }

    let options = match CliOptions::parse(std::env::args().skip(1)) {
        Ok(options) => options,
        Err(CliError::HelpRequested) => {
            print_usage();
            std::process::exit(0);
        }
        Err(err) => {
            eprintln!("error: {err}");
            eprintln!();
            print_usage();
            std::process::exit(2);
        }
    };

    init_tracing(options.json_logs);

    if let Err(err) = run(&options.command).await {
        eprintln!("gateway-cli failed: {err}");
        let code = match err {
            CommandError::Gateway(err) if err.is_cancellation() => 130,
            CommandError::Config(_) => 2,
            _ => 1,
        };
        std::process::exit(code);
    }
}

async fn run(command: &Command) -> Result<(), CommandError> {
    match command {
        Command::Resolve(selection) => commands::resolve(selection),
        Command::Complete(args) => commands::complete(args).await,
        Command::Estimate(args) => commands::estimate(args),
    }
}

fn load_dotenv() -> Result<(), String> {
    match dotenvy::dotenv() {
        Ok(_) => Ok(()),
        Err(err) if err.not_found() => Ok(()),
        Err(err) => Err(format!("failed to load .env file: {err}")),
    }
}

fn init_tracing(json_logs: bool) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_usage() {
    eprintln!(
        "Usage: cargo run -p gateway-cli -- <command> [options]\n\
         \n\
         Commands:\n\
         - resolve   Print the ordered candidate models for a lane\n\
         - complete  Send a prompt through the lane orchestrator\n\
         - estimate  Estimate tokens, cost and duration for a workload\n\
         \n\
         Options:\n\
         - --lane text|json|tool_calling  Lane to route through (default: text)\n\
         - --model MODEL                  Explicit primary model\n\
         - --fallback MODEL               Extra fallback model (repeatable)\n\
         - --prompt TEXT                  User prompt (complete)\n\
         - --system TEXT                  System prompt (complete)\n\
         - --max-tokens N                 Completion token cap (complete)\n\
         - --temperature T                Sampling temperature (complete)\n\
         - --stream                       Print stream events as JSON lines (complete)\n\
         - --workload NAME                crm_migration|document_parsing|data_enrichment (estimate)\n\
         - --count ENTITY=N               Entity count (estimate, repeatable)\n\
         - --json-logs                    Emit logs as JSON\n\
         - --help                         Show this help text"
    );
}
