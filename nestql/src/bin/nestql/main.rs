mod commands;
mod context;
mod examples;
mod output;
mod theme;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{ColorChoice, Command, CommandFactory, FromArgMatches, Parser, Subcommand};
use colored::{Colorize, control::ShouldColorize};
use nestql::Method;

use commands::{
    request::{RequestArgs, handle_request},
    resources::handle_resources,
    seed::{SeedArgs, handle_seed},
};
use context::CliContext;
use examples::{ExampleGroup, command_examples};
use output::{GlobalOptions, OutputFormat, OutputManager};
use theme::{GLYPH_ARROW, PALETTE};

const ENVIRONMENT_VARIABLES: &[(&str, &str)] = &[
    ("NESTQL_CONFIG", "Path to the TOML config file (default: nestql.toml)"),
    ("REDIS_URL", "Redis connection URL for the redis backend"),
    ("RUST_LOG", "Log filter, e.g. nestql=debug"),
];

#[derive(Parser)]
#[command(name = "nestql", version)]
#[command(
    about = "Query and mutate nested resources from the command line",
    long_about = r#"Runs nestql requests against the Chinook demo schema:

• Flat and structured filters, embeds, sorting and pagination
• Nested create/update documents with `$op` annotations
• In-memory store by default, Redis when configured
"#
)]
#[command(subcommand_required = true, arg_required_else_help = true)]
struct Cli {
    /// Output format
    #[arg(long, value_enum, default_value = "table", global = true)]
    output: OutputFormat,

    /// Config file
    #[arg(long, env = "NESTQL_CONFIG", default_value = "nestql.toml", global = true)]
    config: PathBuf,

    /// Only print errors
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    /// Print the resolved request and backend
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read a collection, entity, attribute or relationship
    Get(RequestArgs),

    /// Create entities, or members of a relationship
    Post(RequestArgs),

    /// Replace an entity
    Put(RequestArgs),

    /// Patch an entity, attribute or collection
    Patch(RequestArgs),

    /// Delete an entity, or every entity matching the query
    Delete(RequestArgs),

    /// Show the methods allowed on a path
    Options(RequestArgs),

    /// List the registered resources
    Resources,

    /// Load the Chinook fixture into the configured Redis namespace
    Seed(SeedArgs),
}

/// The derived command plus themed help, per-command examples and the
/// environment appendix.
fn cli_command(use_color: bool) -> Command {
    let mut command = Cli::command()
        .styles(PALETTE.help_styles())
        .color(if use_color { ColorChoice::Auto } else { ColorChoice::Never })
        .after_long_help(environment_help(use_color));
    for example in command_examples() {
        let help = examples_help(example.groups, use_color);
        command = command.mut_subcommand(example.name, |subcommand| subcommand.after_long_help(help));
    }
    command
}

fn paint(text: &str, color: colored::Color, use_color: bool) -> String {
    if use_color {
        text.color(color).bold().to_string()
    } else {
        text.to_string()
    }
}

fn examples_help(groups: &[ExampleGroup], use_color: bool) -> String {
    let mut lines = vec![paint("Examples:", PALETTE.heading, use_color)];
    for group in groups {
        lines.push(format!("  {}", paint(group.title, PALETTE.key, use_color)));
        lines.extend(group.commands.iter().map(|command| format!("    {GLYPH_ARROW} {command}")));
    }
    lines.join("\n")
}

fn environment_help(use_color: bool) -> String {
    let mut lines = vec![paint("Environment Variables:", PALETTE.heading, use_color)];
    let width = ENVIRONMENT_VARIABLES.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    for (key, description) in ENVIRONMENT_VARIABLES {
        let padded = format!("{key:width$}");
        lines.push(format!("  {}  {description}", paint(&padded, PALETTE.key, use_color)));
    }
    lines.push(String::new());
    lines.push("Use 'nestql <command> --help' to view examples for each command.".to_string());
    lines.join("\n")
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let use_color = ShouldColorize::from_env().should_colorize();
    let matches = cli_command(use_color).get_matches();
    let cli = Cli::from_arg_matches(&matches).unwrap_or_else(|err| err.exit());
    if cli.no_color {
        colored::control::set_override(false);
    }

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let output = OutputManager::new(GlobalOptions {
        output_format: cli.output,
        quiet: cli.quiet,
        verbose: cli.verbose,
        no_color: cli.no_color,
    });
    let mut context = CliContext::load(&cli.config).await?;
    output.verbose(&format!("store backend: {:?}", context.config.store.backend));

    let (method, args) = match cli.command {
        Commands::Get(args) => (Method::Get, args),
        Commands::Post(args) => (Method::Post, args),
        Commands::Put(args) => (Method::Put, args),
        Commands::Patch(args) => (Method::Patch, args),
        Commands::Delete(args) => (Method::Delete, args),
        Commands::Options(args) => (Method::Options, args),
        Commands::Resources => return handle_resources(&context, &output),
        Commands::Seed(args) => return handle_seed(args, &mut context, &output).await,
    };
    handle_request(method, args, &mut context, &output).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_definition_is_consistent() {
        cli_command(false).debug_assert();
    }

    #[test]
    fn request_arguments_parse() {
        let matches = cli_command(false)
            .try_get_matches_from([
                "nestql", "--output", "json", "get", "/albums/1", "-p", "embeds=tracks", "--ctx", "user=2",
            ])
            .unwrap();
        let cli = Cli::from_arg_matches(&matches).unwrap();
        assert_eq!(cli.output, OutputFormat::Json);
        let Commands::Get(args) = cli.command else {
            panic!("expected a get command");
        };
        assert_eq!(args.path, "/albums/1");
        assert_eq!(args.params, vec!["embeds=tracks"]);
        assert_eq!(args.context, vec!["user=2"]);
    }

    #[test]
    fn help_lists_examples_without_color() {
        let help = examples_help(commands::resources::EXAMPLES, false);
        assert!(help.starts_with("Examples:"));
        assert!(help.contains("nestql resources"));
    }
}
