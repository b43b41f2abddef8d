use anyhow::Result;
use clap::Args;
use nestql::examples::chinook;

use crate::context::{CliContext, CliStore};
use crate::examples::ExampleGroup;
use crate::output::OutputManager;

pub const EXAMPLES: &[ExampleGroup] = &[ExampleGroup {
    title: "Redis",
    commands: &[
        "REDIS_URL=redis://127.0.0.1/ nestql --config redis.toml seed",
        "nestql --config redis.toml seed --clear",
    ],
}];

#[derive(Args)]
pub struct SeedArgs {
    /// Delete every key of the namespace first
    #[arg(long)]
    pub clear: bool,
}

pub async fn handle_seed(args: SeedArgs, cli: &mut CliContext, output: &OutputManager) -> Result<()> {
    let tables = chinook::seed(cli.engine.registry())?;
    let CliStore::Redis(store) = &mut cli.store else {
        output.warning("The memory backend is seeded on every run; nothing to do.");
        return Ok(());
    };
    if args.clear {
        let removed = store.clear().await?;
        output.info(&format!("Removed {removed} keys from `{}`", store.namespace()));
    }
    let version = store.replace(&tables).await?;
    output.success(&format!(
        "Seeded the Chinook fixture into `{}` (version {version})",
        store.namespace()
    ));
    Ok(())
}
