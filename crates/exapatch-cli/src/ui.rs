use colored::Colorize;

// ---------------------------------------------------------------------------
// Colored message helpers
// ---------------------------------------------------------------------------
//
// Human messages go to stderr; stdout is reserved for JSON results.

fn prefix() -> String {
    "[exapatch]".bold().cyan().to_string()
}

/// Print an informational message: [exapatch] message
pub fn info(msg: &str) {
    eprintln!("{} {}", prefix(), msg);
}

/// Print a success message in green.
pub fn success(msg: &str) {
    eprintln!("{} {}", prefix(), msg.green());
}

/// Print an error message: [exapatch] ERROR: message (in red)
pub fn error(msg: &str) {
    eprintln!("{} {}", "[exapatch]".bold().red(), format!("ERROR: {}", msg).red());
}

pub fn warn(msg: &str) {
    eprintln!("{} {}", prefix(), msg.yellow());
}

/// Print a JSON value to stdout.
pub fn json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
