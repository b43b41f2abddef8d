use anyhow::Result;
use comfy_table::Cell;

use crate::context::CliContext;
use crate::examples::ExampleGroup;
use crate::output::OutputManager;

pub const EXAMPLES: &[ExampleGroup] = &[ExampleGroup {
    title: "Schema",
    commands: &["nestql resources", "nestql --output json resources"],
}];

pub fn handle_resources(cli: &CliContext, output: &OutputManager) -> Result<()> {
    let registry = cli.registry();
    if output.options.output_format == crate::output::OutputFormat::Json {
        let descriptors: Vec<_> = registry.resources().collect();
        println!("{}", serde_json::to_string_pretty(&descriptors)?);
        return Ok(());
    }

    output.heading("Registered resources");
    let mut table = output.create_table();
    output.add_table_header(&mut table, vec!["Resource", "Identity", "Fields", "Relationships", "Page size"]);
    for descriptor in registry.resources() {
        let fields: Vec<&str> = descriptor
            .fields
            .iter()
            .filter(|field| field.is_rendered())
            .map(|field| field.name.as_str())
            .collect();
        let relationships: Vec<String> = descriptor
            .relationships
            .iter()
            .map(|relationship| format!("{} → {}", relationship.name, relationship.target))
            .collect();
        table.add_row(vec![
            Cell::new(&descriptor.name),
            Cell::new(descriptor.identity.join(", ")),
            Cell::new(fields.join(", ")),
            Cell::new(relationships.join("\n")),
            Cell::new(descriptor.page_max_size.map(|size| size.to_string()).unwrap_or_default()),
        ]);
    }
    println!("{table}");
    if cli.config.render.links {
        output.info(&format!("links rendered under `{}`", cli.config.render.url_prefix));
    }
    Ok(())
}
