//! Argument expansion for builtins and external commands.
//!
//! Only bare symbols are expanded; quoting an argument keeps it literal. A
//! leading `~` becomes the home directory, and arguments containing glob
//! metacharacters are replaced by the sorted paths they match. A pattern that
//! matches nothing is passed through unchanged, as shells do.

use glob::glob;

use crate::Error;
use crate::cell::Cell;

fn is_pattern(text: &str) -> bool {
    text.contains(['*', '?', '['])
}

fn tilde(text: &str) -> Option<String> {
    let rest = text.strip_prefix('~')?;
    if !(rest.is_empty() || rest.starts_with('/')) {
        return None;
    }
    let home = dirs::home_dir()?;
    Some(format!("{}{rest}", home.display()))
}

/// Expands every symbol argument of `args`, returning a new list.
pub fn expand(args: &Cell) -> Result<Cell, Error> {
    let mut out = Vec::new();
    for arg in args.iter() {
        let Cell::Symbol(text) = &arg else {
            out.push(arg);
            continue;
        };
        let home = tilde(text);
        let text = home.clone().unwrap_or_else(|| text.to_string());
        if !is_pattern(&text) {
            out.push(match home {
                None => arg,
                Some(path) => Cell::symbol(&path),
            });
            continue;
        }
        let entries = glob(&text).map_err(|e| Error::syntax(format!("bad pattern {text}: {e}")))?;
        let mut matches: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|path| path.to_string_lossy().to_string())
            .collect();
        if matches.is_empty() {
            out.push(arg);
            continue;
        }
        matches.sort();
        out.extend(matches.iter().map(|path| Cell::string(path)));
    }
    Ok(Cell::list(out))
}
