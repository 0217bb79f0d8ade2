use std::env;
use std::path::{Path, PathBuf};

/// Lines of tool output kept in error messages.
const DIAGNOSTIC_LINES: usize = 20;

/// Resolves `program` the way the OS would when spawning it: paths with a
/// separator are taken as-is, bare names are searched on `PATH`.
pub fn find_on_path(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .flat_map(|dir| executable_names(program).map(move |name| dir.join(name)))
        .find(|full| full.is_file())
}

#[cfg(windows)]
fn executable_names(program: &str) -> impl Iterator<Item = String> + '_ {
    ["", ".exe", ".cmd", ".bat"]
        .into_iter()
        .map(move |ext| format!("{program}{ext}"))
}

#[cfg(not(windows))]
fn executable_names(program: &str) -> impl Iterator<Item = String> + '_ {
    std::iter::once(program.to_string())
}

/// The last lines of a failed tool's output. snarkjs reports most errors on
/// stdout, so stdout is used when stderr is empty.
pub fn diagnostic_tail(stdout: &str, stderr: &str) -> String {
    let source = if stderr.trim().is_empty() { stdout } else { stderr };
    let lines: Vec<&str> = source.trim_end().lines().collect();
    if lines.is_empty() {
        return "<no output>".to_string();
    }
    let start = lines.len().saturating_sub(DIAGNOSTIC_LINES);
    lines[start..].join("\n")
}

/// Whether `value` is a non-empty, even-length hexadecimal string.
pub fn is_hex(value: &str) -> bool {
    !value.is_empty() && value.len() % 2 == 0 && hex::decode(value).is_ok()
}
