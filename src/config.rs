use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::errors::HarnessError;

/// Produces the argv used to launch a server. Called at every start so the
/// caller can re-resolve paths between restarts.
pub type CommandSupplier = Arc<dyn Fn() -> Vec<String> + Send + Sync>;

/// Immutable identity of one server in the cluster: everything the
/// supervisor needs to launch it and nothing about its runtime state.
#[derive(Clone)]
pub struct ServerSpec {
    pub(crate) name: String,
    pub(crate) working_dir: PathBuf,
    pub(crate) heap_mb: u32,
    pub(crate) debug_port: u16,
    pub(crate) properties: BTreeMap<String, String>,
    pub(crate) command: CommandSupplier,
}

impl ServerSpec {
    /// Creates an identity with the default 64m heap and debugging
    /// disabled. The name must be unique within the cluster; uniqueness is
    /// enforced at registration.
    pub fn new<S, P, F>(name: S, working_dir: P, command: F) -> Self
    where
        S: Into<String>,
        P: Into<PathBuf>,
        F: Fn() -> Vec<String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            working_dir: working_dir.into(),
            heap_mb: 64,
            debug_port: 0,
            properties: BTreeMap::new(),
            command: Arc::new(command),
        }
    }

    /// Sets the heap size in megabytes. Must be positive; validated at
    /// registration.
    pub fn with_heap_mb(mut self, heap_mb: u32) -> Self {
        self.heap_mb = heap_mb;
        self
    }

    /// Enables the debug agent on the given port. 0 disables it.
    pub fn with_debug_port(mut self, debug_port: u16) -> Self {
        self.debug_port = debug_port;
        self
    }

    /// Adds one `-D<key>=<value>` system property to the server's options.
    pub fn with_property<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// The cluster-unique server name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ServerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSpec")
            .field("name", &self.name)
            .field("working_dir", &self.working_dir)
            .field("heap_mb", &self.heap_mb)
            .field("debug_port", &self.debug_port)
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////

const SERVER_INFO_DELIM: char = ';';
const FIELD_DELIM: char = ':';

/// Endpoint metadata for one server, as handed to test clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    name: String,
    host: String,
    port: u16,
}

impl ServerInfo {
    /// Creates the endpoint record for a named server.
    pub fn new<S, H>(name: S, host: H, port: u16) -> Self
    where
        S: Into<String>,
        H: Into<String>,
    {
        Self {
            name: name.into(),
            host: host.into(),
            port,
        }
    }

    /// The server name this record belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The host clients connect to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port clients connect to.
    pub fn port(&self) -> u16 {
        self.port
    }

    fn encode(&self) -> String {
        format!("{}:{}:{}", self.name, self.host, self.port)
    }

    fn decode(token: &str) -> Result<Self, HarnessError> {
        let mut fields = token.split(FIELD_DELIM);
        let (name, host, port) = match (fields.next(), fields.next(), fields.next(), fields.next())
        {
            (Some(name), Some(host), Some(port), None) => (name, host, port),
            _ => {
                return Err(HarnessError::ConfigInvalid(format!(
                    "malformed server token: {token:?}"
                )))
            }
        };
        if name.is_empty() {
            return Err(HarnessError::ConfigInvalid(format!(
                "empty server name in token: {token:?}"
            )));
        }
        let port = port.parse::<u16>().map_err(|_| {
            HarnessError::ConfigInvalid(format!("bad port in server token: {token:?}"))
        })?;
        Ok(Self::new(name, host, port))
    }
}

/// The set of server endpoints in the cluster, encodable to the
/// `;`-delimited wire form exchanged with test clients.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterInfo {
    servers: HashMap<String, ServerInfo>,
}

impl ClusterInfo {
    /// Builds the descriptor from per-server records. Later duplicates of a
    /// name replace earlier ones.
    pub fn new<I>(servers: I) -> Self
    where
        I: IntoIterator<Item = ServerInfo>,
    {
        Self {
            servers: servers
                .into_iter()
                .map(|info| (info.name.clone(), info))
                .collect(),
        }
    }

    /// Looks up one server's endpoint by name.
    pub fn server_info(&self, name: &str) -> Option<&ServerInfo> {
        self.servers.get(name)
    }

    /// Iterates every server record; order is unspecified.
    pub fn servers(&self) -> impl Iterator<Item = &ServerInfo> {
        self.servers.values()
    }

    /// Encodes the descriptor as `name:host:port;name:host:port;…`.
    /// Order is unspecified; `decode` accepts any order.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for info in self.servers.values() {
            out.push_str(&info.encode());
            out.push(SERVER_INFO_DELIM);
        }
        out
    }

    /// Decodes a descriptor produced by [`ClusterInfo::encode`].
    pub fn decode(from: &str) -> Result<Self, HarnessError> {
        let mut servers = HashMap::new();
        for token in from.split(SERVER_INFO_DELIM) {
            if token.is_empty() {
                // trailing delimiter
                continue;
            }
            let info = ServerInfo::decode(token)?;
            servers.insert(info.name.clone(), info);
        }
        Ok(Self { servers })
    }
}
