//! Text synchronization notification params built from views.

use lsp_types::{
	DidChangeTextDocumentParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams, DidSaveTextDocumentParams,
	TextDocumentContentChangeEvent, TextDocumentIdentifier, TextDocumentItem, TextDocumentSaveReason,
	VersionedTextDocumentIdentifier, WillSaveTextDocumentParams,
};

use crate::Result;
use crate::editor::View;
use crate::uri::uri_from_view;

/// `text` is passed in so the opened content matches the snapshot later changes are diffed against.
pub(super) fn did_open(view: &dyn View, language_id: &str, text: String) -> Result<DidOpenTextDocumentParams> {
	Ok(DidOpenTextDocumentParams {
		text_document: TextDocumentItem::new(uri_from_view(view)?, language_id.to_string(), view.change_count(), text),
	})
}

pub(super) fn did_change(view: &dyn View, content_changes: Vec<TextDocumentContentChangeEvent>) -> Result<DidChangeTextDocumentParams> {
	Ok(DidChangeTextDocumentParams {
		text_document: VersionedTextDocumentIdentifier::new(uri_from_view(view)?, view.change_count()),
		content_changes,
	})
}

pub(super) fn will_save(view: &dyn View, reason: TextDocumentSaveReason) -> Result<WillSaveTextDocumentParams> {
	Ok(WillSaveTextDocumentParams {
		text_document: TextDocumentIdentifier::new(uri_from_view(view)?),
		reason,
	})
}

pub(super) fn did_save(view: &dyn View, include_text: bool) -> Result<DidSaveTextDocumentParams> {
	Ok(DidSaveTextDocumentParams {
		text_document: TextDocumentIdentifier::new(uri_from_view(view)?),
		text: include_text.then(|| view.entire_content()),
	})
}

pub(super) fn did_close(view: &dyn View) -> Result<DidCloseTextDocumentParams> {
	Ok(DidCloseTextDocumentParams {
		text_document: TextDocumentIdentifier::new(uri_from_view(view)?),
	})
}
