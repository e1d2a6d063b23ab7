//! The fixed set of host-issued requests: method, required capability and params per kind.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use lsp_types::request::{
	CodeActionRequest, Completion, DocumentColor, DocumentHighlightRequest, DocumentSymbolRequest, ExecuteCommand, Formatting,
	GotoDeclaration, GotoDefinition, GotoImplementation, GotoTypeDefinition, HoverRequest, PrepareRenameRequest, RangeFormatting,
	References, Rename, Request, ResolveCompletionItem, SignatureHelpRequest, WorkspaceSymbolRequest,
};
use lsp_types::{
	CodeActionContext, CodeActionParams, CompletionParams, Diagnostic, DocumentColorParams, DocumentFormattingParams,
	DocumentHighlightParams, DocumentRangeFormattingParams, DocumentSymbolParams, ExecuteCommandParams, FormattingOptions,
	GotoDefinitionParams, HoverParams, Position, Range, ReferenceContext, ReferenceParams, RenameParams, SignatureHelpParams,
	TextDocumentIdentifier, TextDocumentPositionParams, WorkspaceSymbolParams,
};
use serde::Serialize;
use serde_json::Value as JsonValue;

use super::{RequestError, RequestOptions};
use crate::editor::View;
use crate::uri::uri_from_view;

/// A request the host can issue for a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum RequestKind {
	/// Hover information at the caret.
	Hover,
	/// Completion items at the caret.
	Completion,
	/// Details of one completion item.
	ResolveCompletion,
	/// Signatures of the call at the caret.
	SignatureHelp,
	/// Go to definition.
	Definition,
	/// Go to type definition.
	TypeDefinition,
	/// Go to implementation.
	Implementation,
	/// Go to declaration.
	Declaration,
	/// References to the symbol at the caret, declaration excluded.
	References,
	/// Occurrences of the symbol at the caret in this document.
	DocumentHighlight,
	/// Symbols of the document.
	DocumentSymbol,
	/// Workspace symbols matching a query.
	WorkspaceSymbol,
	/// Rename the symbol at the caret.
	Rename,
	/// Check that the symbol at the caret can be renamed.
	PrepareRename,
	/// Format the whole document.
	Formatting,
	/// Format the selection.
	RangeFormatting,
	/// Code actions for the selection or the diagnostics at the caret.
	CodeAction,
	/// Color literals of the document.
	DocumentColor,
	/// Run a server command.
	ExecuteCommand,
}

impl RequestKind {
	/// Every kind.
	pub const ALL: [RequestKind; 19] = [
		Self::Hover,
		Self::Completion,
		Self::ResolveCompletion,
		Self::SignatureHelp,
		Self::Definition,
		Self::TypeDefinition,
		Self::Implementation,
		Self::Declaration,
		Self::References,
		Self::DocumentHighlight,
		Self::DocumentSymbol,
		Self::WorkspaceSymbol,
		Self::Rename,
		Self::PrepareRename,
		Self::Formatting,
		Self::RangeFormatting,
		Self::CodeAction,
		Self::DocumentColor,
		Self::ExecuteCommand,
	];

	/// The LSP method name.
	pub fn method(self) -> &'static str {
		match self {
			Self::Hover => HoverRequest::METHOD,
			Self::Completion => Completion::METHOD,
			Self::ResolveCompletion => ResolveCompletionItem::METHOD,
			Self::SignatureHelp => SignatureHelpRequest::METHOD,
			Self::Definition => GotoDefinition::METHOD,
			Self::TypeDefinition => GotoTypeDefinition::METHOD,
			Self::Implementation => GotoImplementation::METHOD,
			Self::Declaration => GotoDeclaration::METHOD,
			Self::References => References::METHOD,
			Self::DocumentHighlight => DocumentHighlightRequest::METHOD,
			Self::DocumentSymbol => DocumentSymbolRequest::METHOD,
			Self::WorkspaceSymbol => WorkspaceSymbolRequest::METHOD,
			Self::Rename => Rename::METHOD,
			Self::PrepareRename => PrepareRenameRequest::METHOD,
			Self::Formatting => Formatting::METHOD,
			Self::RangeFormatting => RangeFormatting::METHOD,
			Self::CodeAction => CodeActionRequest::METHOD,
			Self::DocumentColor => DocumentColor::METHOD,
			Self::ExecuteCommand => ExecuteCommand::METHOD,
		}
	}
}

impl fmt::Display for RequestKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.method())
	}
}

impl FromStr for RequestKind {
	type Err = RequestError;

	fn from_str(method: &str) -> Result<Self, Self::Err> {
		Self::ALL.into_iter().find(|kind| kind.method() == method).ok_or(RequestError::NotAvailable)
	}
}

/// Where a request is aimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cursor {
	/// The caret.
	pub position: Position,
	/// The visual selection, if any.
	pub selection: Option<Range>,
}

impl Cursor {
	/// A caret with no selection.
	pub fn at(line: u32, character: u32) -> Self {
		Self {
			position: Position::new(line, character),
			selection: None,
		}
	}

	/// The same caret with `selection` active.
	pub fn with_selection(self, selection: Range) -> Self {
		Self {
			selection: Some(selection),
			..self
		}
	}

	/// The selection, or an empty range at the caret.
	pub fn range(&self) -> Range {
		self.selection.unwrap_or(Range::new(self.position, self.position))
	}
}

/// Everything a params builder may use.
pub struct RequestInput<'a> {
	/// The view the request is issued from.
	pub view: &'a dyn View,
	/// Caret and selection.
	pub cursor: Cursor,
	/// Host options.
	pub options: &'a RequestOptions,
	/// Diagnostics the chosen session's config reported at the caret.
	pub diagnostics: Vec<Diagnostic>,
}

impl RequestInput<'_> {
	fn text_document(&self) -> Result<TextDocumentIdentifier, RequestError> {
		Ok(TextDocumentIdentifier::new(uri_from_view(self.view)?))
	}

	fn text_document_position(&self) -> Result<TextDocumentPositionParams, RequestError> {
		Ok(TextDocumentPositionParams::new(self.text_document()?, self.cursor.position))
	}

	fn formatting_options(&self) -> FormattingOptions {
		FormattingOptions {
			tab_size: self.view.tab_size(),
			insert_spaces: self.view.translate_tabs_to_spaces(),
			..FormattingOptions::default()
		}
	}
}

/// Builds the params of one request.
pub type ParamsBuilder = fn(&RequestInput<'_>) -> Result<JsonValue, RequestError>;
/// Reshapes a response when the host asks for `process_response`.
pub type ResponseProcessor = fn(JsonValue, &RequestOptions) -> JsonValue;

/// One row of the [`RequestTable`].
#[derive(Clone)]
pub struct RequestRow {
	/// What the row serves.
	pub kind: RequestKind,
	/// Capability the session must advertise, in dotted form.
	pub capability: Option<&'static str>,
	/// Params builder.
	pub params: ParamsBuilder,
	/// Response post-processing.
	pub process: Option<ResponseProcessor>,
}

impl fmt::Debug for RequestRow {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RequestRow")
			.field("kind", &self.kind)
			.field("capability", &self.capability)
			.finish_non_exhaustive()
	}
}

/// The requests a dispatcher can issue, built once and shared.
#[derive(Debug, Clone)]
pub struct RequestTable {
	rows: IndexMap<RequestKind, RequestRow>,
}

impl RequestTable {
	/// An empty table.
	pub fn empty() -> Self {
		Self { rows: IndexMap::new() }
	}

	/// Every supported request.
	pub fn standard() -> Self {
		let rows: [(RequestKind, &'static str, ParamsBuilder); 18] = [
			(RequestKind::Hover, "hoverProvider", hover),
			(RequestKind::ResolveCompletion, "completionProvider.resolveProvider", resolve_completion),
			(RequestKind::SignatureHelp, "signatureHelpProvider", signature_help),
			(RequestKind::Definition, "definitionProvider", goto),
			(RequestKind::TypeDefinition, "typeDefinitionProvider", goto),
			(RequestKind::Implementation, "implementationProvider", goto),
			(RequestKind::Declaration, "declarationProvider", goto),
			(RequestKind::References, "referencesProvider", references),
			(RequestKind::DocumentHighlight, "documentHighlightProvider", document_highlight),
			(RequestKind::DocumentSymbol, "documentSymbolProvider", document_symbol),
			(RequestKind::WorkspaceSymbol, "workspaceSymbolProvider", workspace_symbol),
			(RequestKind::Rename, "renameProvider", rename),
			(RequestKind::PrepareRename, "renameProvider.prepareProvider", prepare_rename),
			(RequestKind::Formatting, "documentFormattingProvider", formatting),
			(RequestKind::RangeFormatting, "documentRangeFormattingProvider", range_formatting),
			(RequestKind::CodeAction, "codeActionProvider", code_action),
			(RequestKind::DocumentColor, "colorProvider", document_color),
			(RequestKind::ExecuteCommand, "executeCommandProvider", execute_command),
		];

		let mut table = Self::empty();
		for (kind, capability, params) in rows {
			table.insert(RequestRow {
				kind,
				capability: Some(capability),
				params,
				process: None,
			});
		}
		table.insert(RequestRow {
			kind: RequestKind::Completion,
			capability: Some("completionProvider"),
			params: completion,
			process: Some(filter_completion_items),
		});
		table
	}

	/// Adds or replaces the row for `row.kind`.
	pub fn insert(&mut self, row: RequestRow) {
		self.rows.insert(row.kind, row);
	}

	/// The row for `kind`.
	pub fn get(&self, kind: RequestKind) -> Option<&RequestRow> {
		self.rows.get(&kind)
	}

	/// Every row.
	pub fn rows(&self) -> impl Iterator<Item = &RequestRow> {
		self.rows.values()
	}
}

fn to_json(params: impl Serialize) -> Result<JsonValue, RequestError> {
	serde_json::to_value(params).map_err(|e| RequestError::Rpc(crate::Error::Rpc(e.into())))
}

fn required<'a, T>(value: &'a Option<T>, name: &'static str) -> Result<&'a T, RequestError> {
	value.as_ref().ok_or(RequestError::MissingOption(name))
}

fn hover(input: &RequestInput<'_>) -> Result<JsonValue, RequestError> {
	to_json(HoverParams {
		text_document_position_params: input.text_document_position()?,
		work_done_progress_params: Default::default(),
	})
}

fn completion(input: &RequestInput<'_>) -> Result<JsonValue, RequestError> {
	to_json(CompletionParams {
		text_document_position: input.text_document_position()?,
		work_done_progress_params: Default::default(),
		partial_result_params: Default::default(),
		context: None,
	})
}

fn resolve_completion(input: &RequestInput<'_>) -> Result<JsonValue, RequestError> {
	required(&input.options.item, "item").cloned()
}

fn signature_help(input: &RequestInput<'_>) -> Result<JsonValue, RequestError> {
	to_json(SignatureHelpParams {
		context: None,
		text_document_position_params: input.text_document_position()?,
		work_done_progress_params: Default::default(),
	})
}

/// Shared by definition, type definition, implementation and declaration.
fn goto(input: &RequestInput<'_>) -> Result<JsonValue, RequestError> {
	to_json(GotoDefinitionParams {
		text_document_position_params: input.text_document_position()?,
		work_done_progress_params: Default::default(),
		partial_result_params: Default::default(),
	})
}

fn references(input: &RequestInput<'_>) -> Result<JsonValue, RequestError> {
	to_json(ReferenceParams {
		text_document_position: input.text_document_position()?,
		work_done_progress_params: Default::default(),
		partial_result_params: Default::default(),
		context: ReferenceContext {
			include_declaration: false,
		},
	})
}

fn document_highlight(input: &RequestInput<'_>) -> Result<JsonValue, RequestError> {
	to_json(DocumentHighlightParams {
		text_document_position_params: input.text_document_position()?,
		work_done_progress_params: Default::default(),
		partial_result_params: Default::default(),
	})
}

fn document_symbol(input: &RequestInput<'_>) -> Result<JsonValue, RequestError> {
	to_json(DocumentSymbolParams {
		text_document: input.text_document()?,
		work_done_progress_params: Default::default(),
		partial_result_params: Default::default(),
	})
}

fn workspace_symbol(input: &RequestInput<'_>) -> Result<JsonValue, RequestError> {
	to_json(WorkspaceSymbolParams {
		partial_result_params: Default::default(),
		work_done_progress_params: Default::default(),
		query: required(&input.options.query, "query")?.clone(),
	})
}

fn rename(input: &RequestInput<'_>) -> Result<JsonValue, RequestError> {
	let new_name = required(&input.options.new_name, "new_name")?.clone();
	to_json(RenameParams {
		text_document_position: input.text_document_position()?,
		new_name,
		work_done_progress_params: Default::default(),
	})
}

fn prepare_rename(input: &RequestInput<'_>) -> Result<JsonValue, RequestError> {
	to_json(input.text_document_position()?)
}

fn formatting(input: &RequestInput<'_>) -> Result<JsonValue, RequestError> {
	to_json(DocumentFormattingParams {
		text_document: input.text_document()?,
		options: input.formatting_options(),
		work_done_progress_params: Default::default(),
	})
}

fn range_formatting(input: &RequestInput<'_>) -> Result<JsonValue, RequestError> {
	to_json(DocumentRangeFormattingParams {
		text_document: input.text_document()?,
		range: input.cursor.range(),
		options: input.formatting_options(),
		work_done_progress_params: Default::default(),
	})
}

/// With a selection, asks for actions on it. At a caret, asks with the diagnostics found there,
/// over the range of the first one.
fn code_action(input: &RequestInput<'_>) -> Result<JsonValue, RequestError> {
	let (range, diagnostics) = match input.cursor.selection {
		Some(selection) => (selection, Vec::new()),
		None => {
			let range = input.diagnostics.first().map_or_else(|| input.cursor.range(), |d| d.range);
			(range, input.diagnostics.clone())
		}
	};
	to_json(CodeActionParams {
		text_document: input.text_document()?,
		range,
		context: CodeActionContext {
			diagnostics,
			..CodeActionContext::default()
		},
		work_done_progress_params: Default::default(),
		partial_result_params: Default::default(),
	})
}

fn document_color(input: &RequestInput<'_>) -> Result<JsonValue, RequestError> {
	to_json(DocumentColorParams {
		text_document: input.text_document()?,
		work_done_progress_params: Default::default(),
		partial_result_params: Default::default(),
	})
}

fn execute_command(input: &RequestInput<'_>) -> Result<JsonValue, RequestError> {
	to_json(ExecuteCommandParams {
		command: required(&input.options.command, "command")?.clone(),
		arguments: input.options.arguments.clone().unwrap_or_default(),
		work_done_progress_params: Default::default(),
	})
}

/// Keeps the completion items whose label starts with `base`. Always returns a plain item list.
fn filter_completion_items(response: JsonValue, options: &RequestOptions) -> JsonValue {
	let items = match response {
		JsonValue::Array(items) => items,
		JsonValue::Object(mut list) => match list.remove("items") {
			Some(JsonValue::Array(items)) => items,
			_ => Vec::new(),
		},
		_ => Vec::new(),
	};
	let base = options.base.as_deref().unwrap_or_default();
	items
		.into_iter()
		.filter(|item| item.get("label").and_then(JsonValue::as_str).is_some_and(|label| label.starts_with(base)))
		.collect()
}
