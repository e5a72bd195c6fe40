//! Catalog endpoint handler - `catalog/<name>` services.

use serde_json::{json, Value};

use crate::gateway::Gateway;
use crate::ipc::router::{opt_millis_field, str_field};
use crate::types::{Error, Result};

pub async fn handle(gateway: &Gateway, catalog: &str, method: &str, body: Value) -> Result<Value> {
    let endpoint = gateway.endpoint(catalog);
    match method {
        "CallTool" => {
            let tool = str_field(&body, "tool")?;
            let arguments = match body.get("arguments") {
                None | Some(Value::Null) => Value::Object(serde_json::Map::new()),
                Some(v @ Value::Object(_)) => v.clone(),
                Some(_) => return Err(Error::validation("arguments must be an object")),
            };
            let deadline = opt_millis_field(&body, "timeout_ms")?;

            let result = endpoint.call(&tool, arguments, deadline).await?;
            Ok(json!({
                "request_id": result.request_id.as_str(),
                "instance_id": result.instance_id.as_str(),
                "content": result.content,
                "is_error": result.is_error,
                "elapsed_ms": result.elapsed_ms,
            }))
        }

        "ListTools" => {
            let tools: Vec<Value> = endpoint
                .tools()?
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "backend": t.backend.to_string(),
                        "concurrency": t.concurrency,
                    })
                })
                .collect();
            Ok(json!({
                "catalog": endpoint.name(),
                "count": tools.len(),
                "tools": tools,
            }))
        }

        _ => Err(Error::not_found(format!("Unknown catalog method: {}", method))),
    }
}
