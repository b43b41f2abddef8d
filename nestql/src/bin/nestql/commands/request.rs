use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Args;
use nestql::{Method, QueryParams, Request, RequestContext, Router};
use serde_json::Value;

use crate::context::CliContext;
use crate::examples::ExampleGroup;
use crate::output::OutputManager;

pub const GET_EXAMPLES: &[ExampleGroup] = &[
    ExampleGroup {
        title: "Collections",
        commands: &[
            "nestql get /albums -p sort=-title -p limit=5",
            "nestql get /albums --query 'album_id-lte=10&album_id-gt=8'",
            "nestql get /albums -p 'query={\"artist\":{\"name\":{\"$like\":\"A%\"}}}'",
        ],
    },
    ExampleGroup {
        title: "Entities and sub-paths",
        commands: &[
            "nestql get /albums/1 -p embeds=tracks.name,artist -p tracks._limit_=2",
            "nestql get /albums/1/tracks/1/genre",
            "nestql --output json get /employees --ctx user=2",
        ],
    },
];

pub const WRITE_EXAMPLES: &[ExampleGroup] = &[
    ExampleGroup {
        title: "Nested writes",
        commands: &[
            "nestql post /albums --body '{\"title\":\"X\",\"artist\":{\"artist_id\":1}}'",
            "nestql patch /albums/1 --body '{\"tracks\":[{\"$op\":\"remove\",\"track_id\":6}]}'",
            "nestql put /albums/4 --body '{\"title\":\"Let There Be Rock\",\"artist_id\":1}'",
            "nestql post /playlists/4/tracks --body-file track.json",
        ],
    },
];

pub const DELETE_EXAMPLES: &[ExampleGroup] = &[ExampleGroup {
    title: "Deletes and method discovery",
    commands: &[
        "nestql delete /albums/11",
        "nestql delete /tracks -p genre_id=2",
        "nestql options /albums/1/tracks",
    ],
}];

#[derive(Args)]
pub struct RequestArgs {
    /// Resource path, e.g. /albums/1/tracks
    pub path: String,

    /// Query parameter as KEY=VALUE (repeatable)
    #[arg(short = 'p', long = "param", value_name = "KEY=VALUE")]
    pub params: Vec<String>,

    /// Raw query string, e.g. 'embeds=tracks&sort=-title'
    #[arg(long)]
    pub query: Option<String>,

    /// JSON request body
    #[arg(long, conflicts_with = "body_file")]
    pub body: Option<String>,

    /// File holding the JSON request body
    #[arg(long)]
    pub body_file: Option<PathBuf>,

    /// Request context value as KEY=VALUE; `user=2` sets the current user
    #[arg(long = "ctx", value_name = "KEY=VALUE")]
    pub context: Vec<String>,
}

pub async fn handle_request(
    method: Method,
    args: RequestArgs,
    cli: &mut CliContext,
    output: &OutputManager,
) -> Result<()> {
    let mut params = args.query.as_deref().map(QueryParams::parse).unwrap_or_default();
    for raw in &args.params {
        let (key, value) = split_pair(raw)?;
        params.push(key, value);
    }
    let ctx = build_context(&args.context)?;
    output.verbose(&format!("{method} {} ?{}", args.path, params.to_query_string()));

    let mut request = Request::new(method, args.path.clone()).with_params(params);
    if let Some(body) = read_body(&args)? {
        request = request.with_body(body);
    }

    let router = Router::new(&cli.engine);
    let response = router.dispatch(&mut cli.store, &ctx, request).await;
    if response.is_success() {
        output.display_response(&response)?;
        output.status(method.as_str(), &args.path, response.status);
        return Ok(());
    }

    let message = response.body["message"].as_str().unwrap_or("request failed");
    output.error(message);
    if let Some(issues) = response.body.get("errors").and_then(Value::as_array) {
        for issue in issues {
            output.bullet(&format!(
                "{}: {} ({})",
                issue["field"].as_str().unwrap_or(""),
                issue["message"].as_str().unwrap_or(""),
                issue["code"].as_str().unwrap_or("")
            ));
        }
    }
    bail!("{method} {} failed with status {}", args.path, response.status)
}

fn split_pair(raw: &str) -> Result<(&str, &str)> {
    raw.split_once('=')
        .with_context(|| format!("Expected KEY=VALUE, got `{raw}`"))
}

fn read_body(args: &RequestArgs) -> Result<Option<Value>> {
    let raw = match (&args.body, &args.body_file) {
        (Some(body), _) => body.clone(),
        (None, Some(path)) => {
            fs::read_to_string(path).with_context(|| format!("Failed to read body from {}", path.display()))?
        }
        (None, None) => return Ok(None),
    };
    let body = serde_json::from_str(&raw).context("Request body is not valid JSON")?;
    Ok(Some(body))
}

/// Values parse as JSON when they can (`user=2` is a number), else as strings.
fn build_context(pairs: &[String]) -> Result<RequestContext> {
    let mut ctx = RequestContext::new();
    for raw in pairs {
        let (key, value) = split_pair(raw)?;
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        ctx = ctx.with(key, value);
    }
    Ok(ctx)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn context_values_prefer_json() {
        let ctx = build_context(&["user=2".to_string(), "role=admin".to_string()]).unwrap();
        assert_eq!(ctx.user(), Some(&json!(2)));
        assert_eq!(ctx.get("role"), Some(&json!("admin")));
        assert!(build_context(&["broken".to_string()]).is_err());
    }

    #[test]
    fn pairs_split_on_the_first_equals() {
        assert_eq!(split_pair("query={\"a\":1}=x").unwrap(), ("query", "{\"a\":1}=x"));
    }
}
