use crate::commands::{request, resources, seed};

/// Titled block of sample invocations shown after a command's long help.
#[derive(Clone, Copy)]
pub struct ExampleGroup {
    pub title: &'static str,
    pub commands: &'static [&'static str],
}

pub struct CommandExample {
    pub name: &'static str,
    pub groups: &'static [ExampleGroup],
}

const fn example(name: &'static str, groups: &'static [ExampleGroup]) -> CommandExample {
    CommandExample { name, groups }
}

static COMMAND_EXAMPLES: &[CommandExample] = &[
    example("get", request::GET_EXAMPLES),
    example("post", request::WRITE_EXAMPLES),
    example("put", request::WRITE_EXAMPLES),
    example("patch", request::WRITE_EXAMPLES),
    example("delete", request::DELETE_EXAMPLES),
    example("options", request::DELETE_EXAMPLES),
    example("resources", resources::EXAMPLES),
    example("seed", seed::EXAMPLES),
];

pub fn command_examples() -> &'static [CommandExample] {
    COMMAND_EXAMPLES
}
