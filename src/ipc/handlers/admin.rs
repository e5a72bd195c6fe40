//! Admin service handler - catalogs, instances, statistics.

use serde_json::{json, Value};
use std::path::PathBuf;

use crate::gateway::Gateway;
use crate::ipc::router::{opt_str_field, str_field};
use crate::types::{Error, InstanceId, Result};

pub async fn handle(gateway: &Gateway, method: &str, body: Value) -> Result<Value> {
    match method {
        "ListCatalogs" => {
            let snapshot = gateway.registry().snapshot();
            let catalogs: Vec<Value> = snapshot
                .catalogs()
                .map(|c| {
                    json!({
                        "name": c.name,
                        "tools": c.tool_names(),
                    })
                })
                .collect();
            Ok(json!({
                "generation": snapshot.generation(),
                "catalogs": catalogs,
            }))
        }

        "ReloadCatalogs" => {
            let path = opt_str_field(&body, "path").map(PathBuf::from);
            let generation = gateway.reload_from_file(path.as_deref())?;
            Ok(json!({
                "generation": generation,
                "catalogs": gateway.registry().catalog_names(),
            }))
        }

        "ListInstances" => {
            let catalog = opt_str_field(&body, "catalog");
            let instances: Vec<_> = gateway
                .supervisor()
                .instances()
                .into_iter()
                .filter(|i| catalog.as_deref().map_or(true, |c| c == i.catalog))
                .collect();
            Ok(json!({
                "count": instances.len(),
                "instances": serde_json::to_value(&instances)?,
            }))
        }

        "DrainInstance" => {
            let raw = str_field(&body, "instance_id")?;
            let instance_id = InstanceId::from_string(raw).map_err(Error::validation)?;
            let snapshot = gateway.supervisor().drain(&instance_id)?;
            Ok(serde_json::to_value(snapshot)?)
        }

        "GetToolStats" => {
            let catalog = opt_str_field(&body, "catalog");
            let tool = opt_str_field(&body, "tool");
            let reports = gateway
                .dispatcher()
                .tool_stats(catalog.as_deref(), tool.as_deref());
            Ok(json!({
                "count": reports.len(),
                "tools": serde_json::to_value(&reports)?,
            }))
        }

        _ => Err(Error::not_found(format!("Unknown admin method: {}", method))),
    }
}
