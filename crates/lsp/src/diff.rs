//! Incremental content changes between two document snapshots.

use lsp_types::{Position, Range, TextDocumentContentChangeEvent};
use similar::{DiffOp, TextDiff};

/// Computes the content changes that turn `old` into `new`.
///
/// Each contiguous run of changed lines becomes one change whose range covers whole lines,
/// `[(start, 0), (end, 0))`, in `old` coordinates. Changes are returned bottom-of-file first,
/// so applying them in order never shifts the lines a later change refers to.
///
/// An empty side yields a single rangeless change carrying all of `new`, which servers treat as
/// a full replacement. Identical inputs yield no changes.
pub fn content_changes(old: &str, new: &str) -> Vec<TextDocumentContentChangeEvent> {
	if old == new {
		return Vec::new();
	}
	if old.is_empty() || new.is_empty() {
		return vec![full_change(new)];
	}

	let diff = TextDiff::from_lines(old, new);
	let new_lines = diff.new_slices();
	let mut changes = Vec::new();
	let mut hunk: Option<Hunk> = None;

	for op in diff.ops() {
		if let DiffOp::Equal { .. } = op {
			if let Some(done) = hunk.take() {
				changes.push(done.into_change(new_lines));
			}
			continue;
		}
		let (old_range, new_range) = (op.old_range(), op.new_range());
		match &mut hunk {
			Some(open) => {
				open.old_end = old_range.end;
				open.new_end = new_range.end;
			}
			None => {
				hunk = Some(Hunk {
					old_start: old_range.start,
					old_end: old_range.end,
					new_start: new_range.start,
					new_end: new_range.end,
				})
			}
		}
	}
	if let Some(done) = hunk {
		changes.push(done.into_change(new_lines));
	}

	changes.reverse();
	changes
}

/// A change that replaces the whole document.
pub fn full_change(text: &str) -> TextDocumentContentChangeEvent {
	TextDocumentContentChangeEvent {
		range: None,
		range_length: None,
		text: text.to_string(),
	}
}

/// Line indices of one zero-context hunk.
///
/// An insertion-only hunk has `old_start == old_end`, the index of the line the new text goes
/// in front of, i.e. one past the anchor line of a unified diff header.
struct Hunk {
	old_start: usize,
	old_end: usize,
	new_start: usize,
	new_end: usize,
}

impl Hunk {
	fn into_change(self, new_lines: &[&str]) -> TextDocumentContentChangeEvent {
		TextDocumentContentChangeEvent {
			range: Some(Range::new(line_start(self.old_start), line_start(self.old_end))),
			range_length: None,
			text: new_lines[self.new_start..self.new_end].concat(),
		}
	}
}

fn line_start(line: usize) -> Position {
	Position::new(line as u32, 0)
}
