//! `window/showMessageRequest`: one choice, answered exactly once.

use std::sync::Arc;

use lsp_types::ShowMessageRequestParams;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, warn};
use ulf_rpc::RequestId;

use crate::editor::Editor;
use crate::session::Session;

/// The answer owed to the server. Dropping it unanswered replies `null`.
struct PendingReply {
	session: Arc<Session>,
	id: Option<RequestId>,
	titles: Vec<String>,
}

impl PendingReply {
	fn answer(mut self, choice: Option<usize>) {
		let result = match choice.and_then(|index| self.titles.get(index)) {
			Some(title) => json!({"title": title}),
			None => JsonValue::Null,
		};
		self.send(result);
	}

	fn send(&mut self, result: JsonValue) {
		let Some(id) = self.id.take() else {
			return;
		};
		if let Err(e) = self.session.send_response(id, result) {
			debug!(config = %self.session.config().name, error = %e, "message request reply not sent");
		}
	}
}

impl Drop for PendingReply {
	fn drop(&mut self) {
		self.send(JsonValue::Null);
	}
}

/// Offers the request's actions through the editor and forwards the pick.
pub(super) fn show(editor: &dyn Editor, session: &Arc<Session>, params: JsonValue, id: RequestId) {
	let params: ShowMessageRequestParams = match serde_json::from_value(params) {
		Ok(params) => params,
		Err(e) => {
			warn!(config = %session.config().name, error = %e, "malformed showMessageRequest");
			PendingReply {
				session: session.clone(),
				id: Some(id),
				titles: Vec::new(),
			}
			.answer(None);
			return;
		}
	};

	let titles: Vec<String> = params.actions.unwrap_or_default().into_iter().map(|action| action.title).collect();
	let reply = PendingReply {
		session: session.clone(),
		id: Some(id),
		titles: titles.clone(),
	};
	editor.show_message_request(&session.config().name, &params.message, titles, Box::new(move |choice| reply.answer(choice)));
}
