//! Cell segmentation
//!
//! Submitted code is split into cells on blank-line boundaries and each cell
//! is bracketed by printed markers, so the merged kernel stdout can be cut
//! back into per-cell output in submission order. A cell whose end marker
//! never appears is the one that was running when execution stopped.

use once_cell::sync::Lazy;
use regex::Regex;

static CELL_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{2,}").unwrap());

fn start_marker(n: usize) -> String {
    format!("===CELL_START_{n}===")
}

fn end_marker(n: usize) -> String {
    format!("===CELL_END_{n}===")
}

/// Code rewritten with boundary markers, plus the cell count.
#[derive(Debug, Clone)]
pub struct CellPlan {
    pub wrapped: String,
    pub count: usize,
}

/// Wrap code so each cell announces its own start and end on stdout.
pub fn wrap(code: &str) -> CellPlan {
    let mut cells: Vec<&str> = CELL_SPLIT
        .split(code.trim())
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .collect();
    if cells.is_empty() {
        cells.push(code);
    }

    let wrapped = cells
        .iter()
        .enumerate()
        .map(|(i, cell)| {
            format!(
                "print(\"{}\", flush=True)\n{}\nprint(\"{}\", flush=True)",
                start_marker(i),
                cell,
                end_marker(i)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    CellPlan {
        wrapped,
        count: cells.len(),
    }
}

/// Per-cell stdout slice recovered from the merged stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCell {
    pub stdout: String,
    /// Start marker was seen: the cell began executing.
    pub started: bool,
    /// End marker was seen: the cell ran to completion.
    pub completed: bool,
}

/// Cut the merged stdout stream back into per-cell output.
pub fn parse(stdout: &str, count: usize) -> Vec<ParsedCell> {
    (0..count)
        .map(|i| {
            let start = start_marker(i);
            let end = end_marker(i);

            let Some(pos) = stdout.find(&start) else {
                return ParsedCell {
                    stdout: String::new(),
                    started: false,
                    completed: false,
                };
            };
            let body_start = pos + start.len();
            let rest = &stdout[body_start..];

            match rest.find(&end) {
                Some(end_pos) => ParsedCell {
                    stdout: rest[..end_pos].trim_matches('\n').to_string(),
                    started: true,
                    completed: true,
                },
                None => ParsedCell {
                    stdout: rest.trim_matches('\n').to_string(),
                    started: true,
                    completed: false,
                },
            }
        })
        .collect()
}
