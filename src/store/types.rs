use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of record kinds held by the entity store.
///
/// The string forms double as the REST resource roots, so
/// `RecordKind::from_root("sites")` is how the web layer resolves a path
/// segment into a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Site,
    Host,
    Router,
    Link,
    Listener,
    Connector,
    Address,
    Process,
    ProcessGroup,
    Flow,
    FlowPair,
    SitePair,
    ProcessPair,
    ProcessGroupPair,
    EventSource,
    Collector,
}

impl RecordKind {
    pub fn label(&self) -> &'static str {
        match self {
            RecordKind::Site => "site",
            RecordKind::Host => "host",
            RecordKind::Router => "router",
            RecordKind::Link => "link",
            RecordKind::Listener => "listener",
            RecordKind::Connector => "connector",
            RecordKind::Address => "address",
            RecordKind::Process => "process",
            RecordKind::ProcessGroup => "processgroup",
            RecordKind::Flow => "flow",
            RecordKind::FlowPair => "flowpair",
            RecordKind::SitePair => "sitepair",
            RecordKind::ProcessPair => "processpair",
            RecordKind::ProcessGroupPair => "processgrouppair",
            RecordKind::EventSource => "eventsource",
            RecordKind::Collector => "collector",
        }
    }

    /// Resolve a REST resource root (`"sites"`, `"flowpairs"`, ...) into a kind.
    pub fn from_root(root: &str) -> Option<RecordKind> {
        match root {
            "sites" => Some(RecordKind::Site),
            "hosts" => Some(RecordKind::Host),
            "routers" => Some(RecordKind::Router),
            "links" => Some(RecordKind::Link),
            "listeners" => Some(RecordKind::Listener),
            "connectors" => Some(RecordKind::Connector),
            "addresses" => Some(RecordKind::Address),
            "processes" => Some(RecordKind::Process),
            "processgroups" => Some(RecordKind::ProcessGroup),
            "flows" => Some(RecordKind::Flow),
            "flowpairs" => Some(RecordKind::FlowPair),
            "sitepairs" => Some(RecordKind::SitePair),
            "processpairs" => Some(RecordKind::ProcessPair),
            "processgrouppairs" => Some(RecordKind::ProcessGroupPair),
            "eventsources" => Some(RecordKind::EventSource),
            "collectors" => Some(RecordKind::Collector),
            _ => None,
        }
    }
}

/// Lifecycle of one half-flow leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FlowState {
    Active,
    Paired,
}

/// Lifecycle of a correlated pair: `Pending` until process attribution for
/// both legs has completed, `Complete` after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FlowPairState {
    Pending,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteRecord {
    pub identity: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub name: String,
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRecord {
    pub identity: String,
    /// Owning site id.
    pub parent: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub name: String,
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterRecord {
    pub identity: String,
    /// Owning site id.
    pub parent: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub name: String,
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkRecord {
    pub identity: String,
    /// Source router id.
    pub parent: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub name: String,
    /// Target router id; unset while the far end has not announced itself.
    pub peer: Option<String>,
    pub link_cost: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerRecord {
    pub identity: String,
    /// Owning router id.
    pub parent: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub name: Option<String>,
    pub address: Option<String>,
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorRecord {
    pub identity: String,
    /// Owning router id.
    pub parent: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub address: Option<String>,
    pub protocol: Option<String>,
    pub dest_host: Option<String>,
    pub dest_port: Option<String>,
    /// Workload served behind this connector, once resolved.
    pub process: Option<String>,
}

/// A logical service name. Created implicitly on first listener/connector
/// reference; the identity is the service name itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressRecord {
    pub identity: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub name: String,
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub identity: String,
    /// Owning site id.
    pub parent: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub name: String,
    pub group_name: Option<String>,
    /// Filled in when the group record is created on first assignment.
    pub group_identity: Option<String>,
    pub source_host: Option<String>,
    pub image_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessGroupRecord {
    pub identity: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub name: String,
}

/// One half of an observed connection, attached at a listener (client leg)
/// or a connector (server leg).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRecord {
    pub identity: String,
    /// Listener or connector id this leg was observed at.
    pub parent: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Identity of the correlated peer leg. Immutable once set.
    pub counter_flow: Option<String>,
    pub source_host: Option<String>,
    pub source_port: Option<String>,
    pub octets: u64,
    /// Workload attribution, once resolved.
    pub process: Option<String>,
    pub state: FlowState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowPairRecord {
    pub identity: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub address: Option<String>,
    pub source_site: String,
    pub dest_site: String,
    /// The listener-side leg.
    pub client_flow: String,
    /// The connector-side leg.
    pub server_flow: String,
    pub process_pair: Option<String>,
    pub process_group_pair: Option<String>,
    pub state: FlowPairState,
}

/// Directed derived pair (site-to-site, process-to-process or
/// group-to-group) with the number of live flow pairs contributing to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairRecord {
    pub identity: String,
    pub start_time: DateTime<Utc>,
    pub source_id: String,
    pub dest_id: String,
    pub record_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSourceRecord {
    pub identity: String,
    pub beacon_type: String,
    pub start_time: DateTime<Utc>,
    pub last_heard: DateTime<Utc>,
    pub messages: u64,
}

/// The collector's own identity plus a snapshot of its pipeline counters,
/// published on the diagnostics surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectorInfo {
    pub identity: String,
    pub origin: String,
    pub start_time: DateTime<Utc>,
    pub events_processed: u64,
    pub events_dropped: u64,
    pub flow_pairs_formed: u64,
    pub flows_evicted: u64,
}
