//! Flattening of `workspace/applyEdit` payloads for the host.

use std::collections::BTreeMap;

use lsp_types::{DocumentChangeOperation, DocumentChanges, OneOf, TextDocumentEdit, TextEdit, Uri, WorkspaceEdit};

use crate::uri::path_from_uri;

/// Text edits of `edit` keyed by file path.
///
/// `documentChanges` wins over `changes` when both are present. Resource operations and
/// non-file URIs are skipped.
pub(super) fn workspace_edit_changes(edit: &WorkspaceEdit) -> BTreeMap<String, Vec<TextEdit>> {
	let mut changes: BTreeMap<String, Vec<TextEdit>> = BTreeMap::new();
	let mut push = |uri: &Uri, edits: Vec<TextEdit>| {
		if let Some(path) = path_from_uri(uri) {
			changes.entry(path.display().to_string()).or_default().extend(edits);
		}
	};

	match &edit.document_changes {
		Some(DocumentChanges::Edits(edits)) => {
			for doc in edits {
				push(&doc.text_document.uri, text_edits(doc));
			}
		}
		Some(DocumentChanges::Operations(operations)) => {
			for operation in operations {
				if let DocumentChangeOperation::Edit(doc) = operation {
					push(&doc.text_document.uri, text_edits(doc));
				}
			}
		}
		None => {
			for (uri, edits) in edit.changes.iter().flatten() {
				push(uri, edits.clone());
			}
		}
	}
	changes
}

fn text_edits(doc: &TextDocumentEdit) -> Vec<TextEdit> {
	doc.edits
		.iter()
		.map(|edit| match edit {
			OneOf::Left(edit) => edit.clone(),
			OneOf::Right(annotated) => annotated.text_edit.clone(),
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;
	use serde_json::json;

	use super::*;

	#[test]
	fn test_changes_map() {
		let edit: WorkspaceEdit = serde_json::from_value(json!({
			"changes": {
				"file:///work/app/src/main.rs": [
					{"range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 2}}, "newText": "pub fn"},
				],
			},
		}))
		.unwrap();

		let changes = workspace_edit_changes(&edit);
		assert_eq!(changes.keys().collect::<Vec<_>>(), vec!["/work/app/src/main.rs"]);
		assert_eq!(changes["/work/app/src/main.rs"][0].new_text, "pub fn");
	}

	#[test]
	fn test_document_changes_win_and_skip_resource_ops() {
		let edit: WorkspaceEdit = serde_json::from_value(json!({
			"changes": {"file:///ignored.rs": []},
			"documentChanges": [
				{"kind": "create", "uri": "file:///work/app/new.rs"},
				{
					"textDocument": {"uri": "file:///work/app/lib.rs", "version": 3},
					"edits": [
						{"range": {"start": {"line": 1, "character": 0}, "end": {"line": 1, "character": 0}}, "newText": "use std::fmt;\n"},
						{
							"range": {"start": {"line": 4, "character": 0}, "end": {"line": 4, "character": 3}},
							"newText": "bar",
							"annotationId": "rename",
						},
					],
				},
			],
		}))
		.unwrap();

		let changes = workspace_edit_changes(&edit);
		assert_eq!(changes.len(), 1);
		let edits = &changes["/work/app/lib.rs"];
		assert_eq!(edits.iter().map(|e| e.new_text.as_str()).collect::<Vec<_>>(), vec!["use std::fmt;\n", "bar"]);
	}
}
