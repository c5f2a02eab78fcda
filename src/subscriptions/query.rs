//! Subscription query documents
//!
//! Every category maps to one GraphQL subscription document scoped to an
//! operation through `$operation_id` and ordered newest-first by remote id.
//! The server re-sends the full matching result set on every change, so a
//! push is a snapshot that may overlap earlier pushes, never a diff.

use super::category::SubscriptionCategory;
use super::event::EventFilter;
use serde::Serialize;
use serde_json::json;

/// A ready-to-send subscription request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionQuery {
    #[serde(rename = "operationName")]
    pub operation_name: &'static str,
    #[serde(rename = "query")]
    pub document: String,
    pub variables: serde_json::Value,
    /// Client-side constraints; never sent to the server
    #[serde(skip)]
    pub filter: EventFilter,
}

const TASK_OUTPUT: &str = r#"subscription TaskOutputEvents($operation_id: Int!) {
  task_output(where: {task: {callback: {operation_id: {_eq: $operation_id}}}}, order_by: {id: desc}) {
    id
    output
    timestamp
    task_id
    task {
      id
      command
      params
      original_params
      display_params
      status
      timestamp
      completed_time
      callback_id
      operator_id
      comment_operator
    }
  }
}"#;

const CALLBACK: &str = r#"subscription CallbackEvents($operation_id: Int!) {
  callback(where: {operation_id: {_eq: $operation_id}}, order_by: {id: desc}) {
    id
    display_id
    agent_callback_id
    init_callback
    last_checkin
    user
    host
    pid
    ip
    external_ip
    process_name
    description
    operator_id
    active
    registered_payload_id
    integrity_level
    locked
    operation_id
    sleep_info
    architecture
    domain
    os
  }
}"#;

const FILE: &str = r#"subscription FileEvents($operation_id: Int!) {
  filemeta(where: {operation_id: {_eq: $operation_id}}, order_by: {id: desc}) {
    id
    agent_file_id
    total_chunks
    chunks_received
    chunk_size
    full_remote_path
    host
    is_download_from_agent
    is_screenshot
    is_payload
    timestamp
    complete
    deleted
    operator_id
    operation_id
    task_id
    filename_text
    md5
    sha1
  }
}"#;

const ALERT: &str = r#"subscription AlertEvents($operation_id: Int!) {
  operationalert(where: {operation_id: {_eq: $operation_id}}, order_by: {id: desc}) {
    id
    message
    alert
    source
    severity
    resolved
    operation_id
    callback_id
    timestamp
  }
}"#;

const SCREENSHOT: &str = r#"subscription ScreenshotEvents($operation_id: Int!) {
  filemeta(where: {operation_id: {_eq: $operation_id}, is_screenshot: {_eq: true}, deleted: {_eq: false}}, order_by: {id: desc}) {
    id
    agent_file_id
    filename_text
    full_remote_path
    host
    complete
    total_chunks
    chunks_received
    md5
    sha1
    comment
    operator_id
    timestamp
    deleted
    task_id
    callback_id
  }
}"#;

const KEYLOG: &str = r#"subscription KeylogEvents($operation_id: Int!) {
  keylog(where: {operation_id: {_eq: $operation_id}}, order_by: {id: desc}) {
    id
    task_id
    keystrokes
    window
    timestamp
    operation_id
    user
    task {
      callback_id
    }
  }
}"#;

const PROCESS: &str = r#"subscription ProcessEvents($operation_id: Int!) {
  mythictree(where: {tree_type: {_eq: "process"}, operation_id: {_eq: $operation_id}, deleted: {_eq: false}}, order_by: {id: desc}) {
    id
    name
    full_path
    parent_path
    host
    metadata
    operation_id
    callback_id
    task_id
    timestamp
    deleted
    os
  }
}"#;

const CREDENTIAL: &str = r#"subscription CredentialEvents($operation_id: Int!) {
  credential(where: {operation_id: {_eq: $operation_id}, deleted: {_eq: false}}, order_by: {id: desc}) {
    id
    type
    account
    realm
    credential_text
    comment
    operation_id
    operator_id
    task_id
    timestamp
    deleted
    metadata
  }
}"#;

const ARTIFACT: &str = r#"subscription ArtifactEvents($operation_id: Int!) {
  artifact(where: {operation_id: {_eq: $operation_id}, deleted: {_eq: false}}, order_by: {id: desc}) {
    id
    artifact
    base_artifact
    host
    type
    operation_id
    operator_id
    task_id
    timestamp
    deleted
    metadata
  }
}"#;

const TOKEN: &str = r#"subscription TokenEvents($operation_id: Int!) {
  token(where: {operation_id: {_eq: $operation_id}, deleted: {_eq: false}}, order_by: {id: desc}) {
    id
    token_id
    user
    groups
    privileges
    thread_id
    process_id
    session_id
    logon_sid
    integrity_level_int
    restricted
    default_dacl
    handle
    capabilities
    app_container_sid
    app_container_number
    task_id
    operation_id
    timestamp
    host
    deleted
  }
}"#;

const GENERIC: &str = r#"subscription OperationEvents($operation_id: Int!) {
  task_output(where: {task: {callback: {operation_id: {_eq: $operation_id}}}}, order_by: {id: desc}) {
    id
    output
    timestamp
    task_id
  }
}"#;

/// Build the subscription request for `category` scoped to `operation_id`.
///
/// `All` has no dedicated server-side feed and uses the generic task-output
/// document. The filter is carried along for the worker to apply per event.
pub fn build_subscription_query(
    category: SubscriptionCategory,
    operation_id: i64,
    filter: &EventFilter,
) -> SubscriptionQuery {
    let (operation_name, document) = match category {
        SubscriptionCategory::TaskOutput => ("TaskOutputEvents", TASK_OUTPUT),
        SubscriptionCategory::Callback => ("CallbackEvents", CALLBACK),
        SubscriptionCategory::File => ("FileEvents", FILE),
        SubscriptionCategory::Alert => ("AlertEvents", ALERT),
        SubscriptionCategory::Screenshot => ("ScreenshotEvents", SCREENSHOT),
        SubscriptionCategory::Keylog => ("KeylogEvents", KEYLOG),
        SubscriptionCategory::Process => ("ProcessEvents", PROCESS),
        SubscriptionCategory::Credential => ("CredentialEvents", CREDENTIAL),
        SubscriptionCategory::Artifact => ("ArtifactEvents", ARTIFACT),
        SubscriptionCategory::Token => ("TokenEvents", TOKEN),
        SubscriptionCategory::All => ("OperationEvents", GENERIC),
    };

    SubscriptionQuery {
        operation_name,
        document: document.to_string(),
        variables: json!({ "operation_id": operation_id }),
        filter: filter.clone(),
    }
}
