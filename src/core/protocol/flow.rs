use super::Protocol;
use crate::core::io::Connector;
use serde_json::{Map, Value, json};

fn job_endpoint(connector: &Connector, upstream: bool) -> Value {
    let (process, port) = if upstream {
        (connector.source(), connector.source_port())
    } else {
        (connector.target(), connector.target_port())
    };
    json!({
        "job_uri": process.job().uri(),
        "process": {
            "uri": process.uri(),
            "instance_name": process.instance_name(),
            "port": port,
        },
    })
}

impl Protocol {
    /// The lineage of the last run: the job of every child and one flow per
    /// connector, with the resource that travelled along it.
    pub fn job_flow(&self) -> Value {
        let jobs: Map<String, Value> = self
            .processes()
            .into_iter()
            .map(|(name, process)| (name, process.job().to_json()))
            .collect();

        let flows: Vec<Value> = self
            .connectors()
            .iter()
            .map(|connector| {
                let consumed = connector
                    .target()
                    .job()
                    .inputs()
                    .into_iter()
                    .find(|trace| trace.port == connector.target_port())
                    .and_then(|trace| trace.resource_uri);
                json!({
                    "from": job_endpoint(connector, true),
                    "to": job_endpoint(connector, false),
                    "resource_uri": consumed,
                })
            })
            .collect();

        json!({
            "uri": self.uri(),
            "title": self.title(),
            "job_uri": self.job().uri(),
            "jobs": jobs,
            "flows": flows,
        })
    }
}
