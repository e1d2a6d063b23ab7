//! Client capabilities announced in `initialize`.

use lsp_types::{
	ClientCapabilities, CodeActionClientCapabilities, CodeActionKind, CodeActionKindLiteralSupport, CodeActionLiteralSupport, CompletionClientCapabilities,
	CompletionItemCapability, CompletionItemCapabilityResolveSupport, DocumentColorClientCapabilities, DynamicRegistrationClientCapabilities,
	GotoCapability, HoverClientCapabilities, MarkupKind, MessageActionItemCapabilities, PublishDiagnosticsClientCapabilities, RenameClientCapabilities,
	ShowMessageRequestClientCapabilities, SignatureHelpClientCapabilities, SignatureInformationSettings, TextDocumentClientCapabilities,
	TextDocumentSyncClientCapabilities, WindowClientCapabilities, WorkspaceClientCapabilities, WorkspaceEditClientCapabilities,
};
use serde_json::Value as JsonValue;

/// Capabilities for a session, with the config's experimental capabilities attached.
pub fn client_capabilities(enable_snippets: bool, experimental: Option<JsonValue>) -> ClientCapabilities {
	let static_registration = || DynamicRegistrationClientCapabilities {
		dynamic_registration: Some(false),
	};
	let goto = || GotoCapability {
		dynamic_registration: Some(false),
		link_support: Some(true),
	};

	ClientCapabilities {
		workspace: Some(WorkspaceClientCapabilities {
			configuration: Some(true),
			did_change_configuration: Some(static_registration()),
			workspace_folders: Some(true),
			apply_edit: Some(true),
			symbol: Some(lsp_types::WorkspaceSymbolClientCapabilities {
				dynamic_registration: Some(false),
				..Default::default()
			}),
			execute_command: Some(static_registration()),
			workspace_edit: Some(WorkspaceEditClientCapabilities {
				document_changes: Some(true),
				resource_operations: None,
				failure_handling: Some(lsp_types::FailureHandlingKind::Abort),
				normalizes_line_endings: Some(false),
				change_annotation_support: None,
			}),
			..Default::default()
		}),
		text_document: Some(TextDocumentClientCapabilities {
			synchronization: Some(TextDocumentSyncClientCapabilities {
				dynamic_registration: Some(false),
				will_save: Some(true),
				will_save_wait_until: Some(false),
				did_save: Some(true),
			}),
			completion: Some(CompletionClientCapabilities {
				completion_item: Some(CompletionItemCapability {
					snippet_support: Some(enable_snippets),
					resolve_support: Some(CompletionItemCapabilityResolveSupport {
						properties: vec![String::from("documentation"), String::from("detail"), String::from("additionalTextEdits")],
					}),
					deprecated_support: Some(true),
					..Default::default()
				}),
				..Default::default()
			}),
			hover: Some(HoverClientCapabilities {
				content_format: Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]),
				..Default::default()
			}),
			signature_help: Some(SignatureHelpClientCapabilities {
				signature_information: Some(SignatureInformationSettings {
					documentation_format: Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]),
					parameter_information: None,
					active_parameter_support: Some(true),
				}),
				..Default::default()
			}),
			definition: Some(goto()),
			type_definition: Some(goto()),
			implementation: Some(goto()),
			declaration: Some(goto()),
			references: Some(static_registration()),
			document_highlight: Some(static_registration()),
			document_symbol: Some(lsp_types::DocumentSymbolClientCapabilities {
				dynamic_registration: Some(false),
				symbol_kind: None,
				hierarchical_document_symbol_support: Some(true),
				tag_support: None,
			}),
			rename: Some(RenameClientCapabilities {
				dynamic_registration: Some(false),
				prepare_support: Some(true),
				prepare_support_default_behavior: None,
				honors_change_annotations: Some(false),
			}),
			formatting: Some(static_registration()),
			range_formatting: Some(static_registration()),
			code_action: Some(CodeActionClientCapabilities {
				code_action_literal_support: Some(CodeActionLiteralSupport {
					code_action_kind: CodeActionKindLiteralSupport {
						value_set: [
							CodeActionKind::QUICKFIX,
							CodeActionKind::REFACTOR,
							CodeActionKind::REFACTOR_EXTRACT,
							CodeActionKind::REFACTOR_INLINE,
							CodeActionKind::REFACTOR_REWRITE,
							CodeActionKind::SOURCE,
							CodeActionKind::SOURCE_ORGANIZE_IMPORTS,
						]
						.iter()
						.map(|kind| kind.as_str().to_string())
						.collect(),
					},
				}),
				..Default::default()
			}),
			color_provider: Some(DocumentColorClientCapabilities {
				dynamic_registration: Some(false),
			}),
			publish_diagnostics: Some(PublishDiagnosticsClientCapabilities {
				related_information: Some(true),
				..Default::default()
			}),
			..Default::default()
		}),
		window: Some(WindowClientCapabilities {
			show_message: Some(ShowMessageRequestClientCapabilities {
				message_action_item: Some(MessageActionItemCapabilities {
					additional_properties_support: Some(false),
				}),
			}),
			..Default::default()
		}),
		experimental,
		..Default::default()
	}
}
