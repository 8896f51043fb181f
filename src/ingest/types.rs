use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error_handling::types::IngestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventOp {
    Create,
    Update,
    Delete,
}

/// One typed event from a router's management stream. Payload fields are
/// optional because routers emit attribute deltas: a later event for the
/// same identity only carries what changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordEvent {
    /// Identity of the emitting router/controller.
    pub source: String,
    pub op: EventOp,
    pub payload: EventPayload,
}

impl RecordEvent {
    /// Decode boundary for the wire format. Malformed input is an
    /// `IngestError` for the caller to log and drop.
    pub fn from_json(raw: &str) -> Result<RecordEvent, IngestError> {
        serde_json::from_str(raw).map_err(|e| IngestError::DecodeFailed(e.to_string()))
    }

    pub fn identity(&self) -> &str {
        match &self.payload {
            EventPayload::Site(d) => &d.identity,
            EventPayload::Host(d) => &d.identity,
            EventPayload::Router(d) => &d.identity,
            EventPayload::Link(d) => &d.identity,
            EventPayload::Listener(d) => &d.identity,
            EventPayload::Connector(d) => &d.identity,
            EventPayload::Process(d) => &d.identity,
            EventPayload::Flow(d) => &d.identity,
        }
    }

    pub fn kind_label(&self) -> &'static str {
        match &self.payload {
            EventPayload::Site(_) => "site",
            EventPayload::Host(_) => "host",
            EventPayload::Router(_) => "router",
            EventPayload::Link(_) => "link",
            EventPayload::Listener(_) => "listener",
            EventPayload::Connector(_) => "connector",
            EventPayload::Process(_) => "process",
            EventPayload::Flow(_) => "flow",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EventPayload {
    Site(SiteDelta),
    Host(HostDelta),
    Router(RouterDelta),
    Link(LinkDelta),
    Listener(ListenerDelta),
    Connector(ConnectorDelta),
    Process(ProcessDelta),
    Flow(FlowDelta),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteDelta {
    pub identity: String,
    pub name: Option<String>,
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostDelta {
    pub identity: String,
    /// Owning site id; required on first sight.
    pub parent: Option<String>,
    pub name: Option<String>,
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterDelta {
    pub identity: String,
    /// Owning site id; required on first sight.
    pub parent: Option<String>,
    pub name: Option<String>,
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkDelta {
    pub identity: String,
    /// Source router id; required on first sight.
    pub parent: Option<String>,
    pub name: Option<String>,
    pub peer: Option<String>,
    pub link_cost: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerDelta {
    pub identity: String,
    /// Owning router id; required on first sight.
    pub parent: Option<String>,
    pub name: Option<String>,
    pub address: Option<String>,
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorDelta {
    pub identity: String,
    /// Owning router id; required on first sight.
    pub parent: Option<String>,
    pub address: Option<String>,
    pub protocol: Option<String>,
    pub dest_host: Option<String>,
    pub dest_port: Option<String>,
    pub process: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessDelta {
    pub identity: String,
    /// Owning site id; required on first sight.
    pub parent: Option<String>,
    pub name: Option<String>,
    /// Logical grouping (image/deployment); the group record is created on
    /// first assignment.
    pub group: Option<String>,
    pub source_host: Option<String>,
    pub image_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDelta {
    pub identity: String,
    /// Listener or connector the leg was observed at; required on first
    /// sight.
    pub parent: Option<String>,
    pub counter_flow: Option<String>,
    pub source_host: Option<String>,
    pub source_port: Option<String>,
    pub octets: Option<u64>,
    pub process: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_flow_event() {
        let raw = r#"{
            "source": "r1",
            "op": "CREATE",
            "payload": {
                "kind": "flow",
                "identity": "f1",
                "parent": "l1",
                "counterFlow": "g1",
                "octets": 42
            }
        }"#;
        let event = RecordEvent::from_json(raw).unwrap();
        assert_eq!(event.op, EventOp::Create);
        assert_eq!(event.identity(), "f1");
        match event.payload {
            EventPayload::Flow(f) => {
                assert_eq!(f.counter_flow.as_deref(), Some("g1"));
                assert_eq!(f.octets, Some(42));
            }
            _ => panic!("wrong payload kind"),
        }
    }

    #[test]
    fn malformed_input_is_an_error_not_a_panic() {
        assert!(RecordEvent::from_json("{not json").is_err());
        assert!(RecordEvent::from_json(r#"{"source":"r1","op":"CREATE","payload":{"kind":"widget","identity":"x"}}"#).is_err());
    }
}
