//! The `/db/:id` WebSocket surface: query/execute request-response framed by
//! a client-chosen `id`, plus table subscriptions that push `change` frames
//! as the owning [`sirannon_core::Database`]'s own CDC poll loop dispatches
//! them. Deliberately does not run a second poller against the file: per
//! the CDC design notes, a WS handler must ride the Database's existing
//! `watch`/`on` machinery rather than open its own cursor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value as JsonValue};
use sirannon_cdc::{ChangeEvent, Filter, SubscriptionHandle};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, warn};

use crate::api_error::ApiError;
use crate::wire::params_from_json;
use crate::state::{AppState, RequestContext};

pub async fn ws_upgrade_handler(
   ws: WebSocketUpgrade,
   State(state): State<AppState>,
   Path(id): Path<String>,
) -> Response {
   let ctx = RequestContext { database_id: id.clone(), method: "GET".to_string(), path: "/db/:id".to_string() };
   if let Err(denial) = state.check_on_request(&ctx) {
      return (denial.status, axum::Json(json!({ "error": { "code": denial.code, "message": denial.message } }))).into_response();
   }

   ws.max_message_size(state.settings.max_body_bytes).on_upgrade(move |socket| handle_socket(socket, state, id))
}

async fn handle_socket(socket: WebSocket, state: AppState, id: String) {
   let (mut sender, mut receiver) = socket.split();

   let db = match state.registry.get(&id).await {
      Some(db) if !db.is_closed() => db,
      _ => {
         let err = ApiError::from(&sirannon_core::Error::DatabaseNotFound(id.clone()));
         let _ = sender.send(Message::Text(error_frame(None, &err))).await;
         let _ = sender
            .send(Message::Close(Some(CloseFrame { code: 1008, reason: "database not found or closed".into() })))
            .await;
         return;
      }
   };

   let (tx, mut rx) = mpsc::unbounded_channel::<String>();
   let subscriptions: Arc<Mutex<HashMap<String, SubscriptionHandle>>> = Arc::new(Mutex::new(HashMap::new()));

   let mut send_task = tokio::spawn(async move {
      while let Some(text) = rx.recv().await {
         if sender.send(Message::Text(text)).await.is_err() {
            break;
         }
      }
      let _ = sender.send(Message::Close(Some(CloseFrame { code: 1001, reason: "server shutting down".into() }))).await;
   });

   let max_body_bytes = state.settings.max_body_bytes;

   loop {
      tokio::select! {
         frame = receiver.next() => {
            let Some(frame) = frame else { break };
            match frame {
               Ok(Message::Text(text)) => {
                  if text.len() > max_body_bytes {
                     let _ = tx.send(error_frame(None, &ApiError::new("PAYLOAD_TOO_LARGE", "message exceeds the maximum allowed size")));
                     continue;
                  }
                  process_message(&text, &db, &tx, &subscriptions).await;
               }
               Ok(Message::Close(_)) => break,
               Ok(_) => {}
               Err(err) => {
                  debug!(id = %id, error = %err, "websocket receive error");
                  break;
               }
            }
         }
         _ = &mut send_task => {
            break;
         }
      }
   }

   for (_, handle) in subscriptions.lock().expect("subscription map poisoned").drain() {
      handle.unsubscribe();
   }
   send_task.abort();
}

async fn process_message(
   text: &str,
   db: &Arc<sirannon_core::Database>,
   tx: &UnboundedSender<String>,
   subscriptions: &Arc<Mutex<HashMap<String, SubscriptionHandle>>>,
) {
   let value: JsonValue = match serde_json::from_str(text) {
      Ok(v) => v,
      Err(e) => {
         let _ = tx.send(error_frame(None, &ApiError::invalid_json(e.to_string())));
         return;
      }
   };

   let id = value.get("id").cloned();
   let kind = value.get("type").and_then(JsonValue::as_str).map(str::to_string);

   let (Some(id), Some(kind)) = (id, kind) else {
      let _ = tx.send(error_frame(id.as_ref(), &ApiError::new("INVALID_MESSAGE", "message requires \"id\" and \"type\"")));
      return;
   };

   match kind.as_str() {
      "query" => handle_query(&id, &value, db, tx).await,
      "execute" => handle_execute(&id, &value, db, tx).await,
      "subscribe" => handle_subscribe(&id, &value, db, tx, subscriptions).await,
      "unsubscribe" => handle_unsubscribe(&id, subscriptions, tx),
      other => {
         let _ = tx.send(error_frame(Some(&id), &ApiError::new("UNKNOWN_TYPE", format!("unknown message type \"{other}\""))));
      }
   }
}

async fn handle_query(id: &JsonValue, value: &JsonValue, db: &Arc<sirannon_core::Database>, tx: &UnboundedSender<String>) {
   let Some(sql) = value.get("sql").and_then(JsonValue::as_str) else {
      let _ = tx.send(error_frame(Some(id), &ApiError::invalid_request("missing \"sql\" field")));
      return;
   };
   let params = match params_from_json(value.get("params").cloned()) {
      Ok(p) => p,
      Err(err) => {
         let _ = tx.send(error_frame(Some(id), &err));
         return;
      }
   };

   match db.query(sql, params).await {
      Ok(rows) => {
         let _ = tx.send(result_frame(id, json!({ "rows": rows })));
      }
      Err(err) => {
         let _ = tx.send(error_frame(Some(id), &ApiError::from(&err)));
      }
   }
}

async fn handle_execute(id: &JsonValue, value: &JsonValue, db: &Arc<sirannon_core::Database>, tx: &UnboundedSender<String>) {
   let Some(sql) = value.get("sql").and_then(JsonValue::as_str) else {
      let _ = tx.send(error_frame(Some(id), &ApiError::invalid_request("missing \"sql\" field")));
      return;
   };
   let params = match params_from_json(value.get("params").cloned()) {
      Ok(p) => p,
      Err(err) => {
         let _ = tx.send(error_frame(Some(id), &err));
         return;
      }
   };

   match db.execute(sql, params).await {
      Ok(result) => {
         let _ = tx.send(result_frame(
            id,
            json!({ "changes": result.changes, "lastInsertRowId": crate::wire::last_insert_row_id_json(result.last_insert_rowid) }),
         ));
      }
      Err(err) => {
         let _ = tx.send(error_frame(Some(id), &ApiError::from(&err)));
      }
   }
}

async fn handle_subscribe(
   id: &JsonValue,
   value: &JsonValue,
   db: &Arc<sirannon_core::Database>,
   tx: &UnboundedSender<String>,
   subscriptions: &Arc<Mutex<HashMap<String, SubscriptionHandle>>>,
) {
   let key = id.to_string();
   if subscriptions.lock().expect("subscription map poisoned").contains_key(&key) {
      let _ = tx.send(error_frame(Some(id), &ApiError::new("DUPLICATE_SUBSCRIPTION", "a subscription with this id already exists")));
      return;
   }

   let Some(table) = value.get("table").and_then(JsonValue::as_str) else {
      let _ = tx.send(error_frame(Some(id), &ApiError::invalid_request("missing \"table\" field")));
      return;
   };

   let filter: Option<Filter> = match value.get("filter") {
      None | Some(JsonValue::Null) => None,
      Some(JsonValue::Object(map)) => Some(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
      Some(_) => {
         let _ = tx.send(error_frame(Some(id), &ApiError::invalid_request("\"filter\" must be an object")));
         return;
      }
   };

   if let Err(err) = db.watch(table).await {
      let _ = tx.send(error_frame(Some(id), &ApiError::from(&err)));
      return;
   }

   let id_for_callback = id.clone();
   let tx_for_callback = tx.clone();
   let callback: sirannon_cdc::Callback = Arc::new(move |event: &ChangeEvent| {
      if tx_for_callback.send(change_frame(&id_for_callback, event)).is_err() {
         warn!(table = %event.table, "dropping change event: websocket sender gone");
      }
      Ok(())
   });

   match db.on(table, filter, callback) {
      Ok(handle) => {
         subscriptions.lock().expect("subscription map poisoned").insert(key, handle);
         let _ = tx.send(result_frame_bare(id, "subscribed"));
      }
      Err(err) => {
         let _ = tx.send(error_frame(Some(id), &ApiError::from(&err)));
      }
   }
}

fn handle_unsubscribe(id: &JsonValue, subscriptions: &Arc<Mutex<HashMap<String, SubscriptionHandle>>>, tx: &UnboundedSender<String>) {
   let key = id.to_string();
   let removed = subscriptions.lock().expect("subscription map poisoned").remove(&key);
   match removed {
      Some(handle) => {
         handle.unsubscribe();
         let _ = tx.send(result_frame_bare(id, "unsubscribed"));
      }
      None => {
         let _ = tx.send(error_frame(Some(id), &ApiError::new("SUBSCRIPTION_NOT_FOUND", "no subscription with this id")));
      }
   }
}

fn error_frame(id: Option<&JsonValue>, err: &ApiError) -> String {
   let mut obj = serde_json::Map::new();
   obj.insert("type".to_string(), json!("error"));
   if let Some(id) = id {
      obj.insert("id".to_string(), id.clone());
   }
   obj.insert("error".to_string(), serde_json::to_value(err).unwrap_or(JsonValue::Null));
   JsonValue::Object(obj).to_string()
}

fn result_frame(id: &JsonValue, data: JsonValue) -> String {
   json!({ "type": "result", "id": id, "data": data }).to_string()
}

fn result_frame_bare(id: &JsonValue, kind: &str) -> String {
   json!({ "type": kind, "id": id }).to_string()
}

fn change_frame(id: &JsonValue, event: &ChangeEvent) -> String {
   let mut event_obj = serde_json::Map::new();
   event_obj.insert("type".to_string(), json!(event.operation.as_str()));
   event_obj.insert("table".to_string(), json!(event.table));
   event_obj.insert("row".to_string(), serde_json::to_value(&event.row).unwrap_or(JsonValue::Null));
   if let Some(old_row) = &event.old_row {
      event_obj.insert("oldRow".to_string(), serde_json::to_value(old_row).unwrap_or(JsonValue::Null));
   }
   // Transmitted as a decimal string: `seq` can exceed JS's safe integer
   // range over a long-lived subscription.
   event_obj.insert("seq".to_string(), json!(event.seq.to_string()));
   event_obj.insert("timestamp".to_string(), json!(event.timestamp));

   json!({ "type": "change", "id": id, "event": JsonValue::Object(event_obj) }).to_string()
}

#[cfg(test)]
mod tests {
   use super::*;
   use sirannon_cdc::ChangeOperation;

   #[test]
   fn change_frame_transmits_large_seq_as_decimal_string() {
      // 2^53, past JS's safe-integer boundary.
      let big_seq: u64 = 9_007_199_254_740_993;
      let event = ChangeEvent {
         operation: ChangeOperation::Insert,
         table: "t".to_string(),
         row: [("id".to_string(), json!(1))].into_iter().collect(),
         old_row: None,
         seq: big_seq,
         timestamp: 0.0,
      };

      let frame: JsonValue = serde_json::from_str(&change_frame(&json!("sub-1"), &event)).unwrap();
      let seq = frame["event"]["seq"].as_str().expect("seq must be transmitted as a string");
      assert_eq!(seq, big_seq.to_string());
      assert_eq!(seq.parse::<u64>().unwrap(), big_seq);
      assert_eq!(frame["event"]["type"], json!("INSERT"));
   }

   #[test]
   fn change_frame_includes_old_row_only_when_present() {
      let event = ChangeEvent {
         operation: ChangeOperation::Delete,
         table: "t".to_string(),
         row: [("id".to_string(), json!(1))].into_iter().collect(),
         old_row: Some([("id".to_string(), json!(1)), ("v".to_string(), json!(10))].into_iter().collect()),
         seq: 1,
         timestamp: 0.0,
      };

      let frame: JsonValue = serde_json::from_str(&change_frame(&json!("sub-1"), &event)).unwrap();
      assert_eq!(frame["event"]["oldRow"]["v"], json!(10));
   }
}
