//! Read-once, immutable configuration.
//!
//! The file is INI-shaped: `[servers]` lists one comma-separated
//! `host:port` set per backend family plus the listening port, `[backend]`
//! selects a backend and path template per family, and `[limits]` holds the
//! tuning knobs. Servers identify themselves by matching their own
//! `(host, port)` against the per-family lists.

use std::collections::HashMap;
use std::path::Path;

use ini::ini;

pub const DEFAULT_PORT: u16 = 4711;
pub const DEFAULT_MAX_OPERATION_SIZE: u64 = 8 * 1024 * 1024;
pub const DEFAULT_STATEMENT_CACHE_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("could not read configuration: {0}")]
    Read(String),
    #[error("section [{0}] is missing")]
    MissingSection(&'static str),
    #[error("key {key} in section [{section}] is missing")]
    MissingKey {
        section: &'static str,
        key: &'static str,
    },
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("invalid server address: {0}")]
    InvalidAddress(String),
}

/// The three pluggable backend families.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum BackendKind {
    Object,
    Kv,
    Db,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [BackendKind::Object, BackendKind::Kv, BackendKind::Db];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Object => "object",
            BackendKind::Kv => "kv",
            BackendKind::Db => "db",
        }
    }
}

/// One `host:port` entry of a server list.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    /// Parse `host[:port]`, defaulting the port.
    pub fn parse(input: &str, default_port: u16) -> Result<Self, Error> {
        let input = input.trim();

        if input.is_empty() {
            return Err(Error::InvalidAddress(input.to_string()));
        }

        match input.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| Error::InvalidAddress(input.to_string()))?;
                Ok(Self {
                    host: host.to_string(),
                    port,
                })
            }
            None => Ok(Self {
                host: input.to_string(),
                port: default_port,
            }),
        }
    }

}

impl std::fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Backend selection for one family.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub name: String,
    path: String,
}

impl BackendConfig {
    /// The backend-specific path with `{PORT}` substituted.
    pub fn path_for_port(&self, port: u16) -> String {
        self.path.replace("{PORT}", &port.to_string())
    }
}

#[derive(Clone, Debug)]
pub struct Configuration {
    servers: HashMap<BackendKind, Vec<ServerAddress>>,
    backends: HashMap<BackendKind, BackendConfig>,
    port: u16,
    max_operation_size: u64,
    statement_cache_capacity: usize,
}

type IniMap = HashMap<String, HashMap<String, Option<String>>>;

impl Configuration {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let path = path
            .to_str()
            .ok_or_else(|| Error::Read(format!("non-utf8 path {}", path.display())))?;
        let map = ini!(safe path).map_err(Error::Read)?;

        Self::from_map(map)
    }

    fn from_map(map: IniMap) -> Result<Self, Error> {
        let servers_section = map
            .get("servers")
            .ok_or(Error::MissingSection("servers"))?;
        let backend_section = map
            .get("backend")
            .ok_or(Error::MissingSection("backend"))?;
        let limits_section = map.get("limits");

        let port = match servers_section.get("port").and_then(|v| v.as_deref()) {
            Some(value) => value.parse().map_err(|_| Error::InvalidValue {
                key: "port",
                value: value.to_string(),
            })?,
            None => DEFAULT_PORT,
        };

        let mut servers = HashMap::new();
        let mut backends = HashMap::new();

        for kind in BackendKind::ALL {
            let list = servers_section
                .get(kind.as_str())
                .and_then(|v| v.clone())
                .ok_or(Error::MissingKey {
                    section: "servers",
                    key: kind.as_str(),
                })?;

            let list = list
                .split(',')
                .map(|entry| ServerAddress::parse(entry, port))
                .collect::<Result<Vec<_>, _>>()?;

            if list.is_empty() {
                return Err(Error::MissingKey {
                    section: "servers",
                    key: kind.as_str(),
                });
            }

            servers.insert(kind, list);

            let name = backend_section
                .get(kind.as_str())
                .and_then(|v| v.clone())
                .ok_or(Error::MissingKey {
                    section: "backend",
                    key: kind.as_str(),
                })?;

            let path = backend_section
                .get(&format!("{}-path", kind.as_str()))
                .and_then(|v| v.clone())
                .unwrap_or_default();

            backends.insert(kind, BackendConfig { name, path });
        }

        let get_limit = |key: &'static str| -> Option<String> {
            limits_section
                .and_then(|section| section.get(key))
                .and_then(|v| v.clone())
        };

        let max_operation_size = match get_limit("max_operation_size") {
            Some(value) => value.parse().map_err(|_| Error::InvalidValue {
                key: "max_operation_size",
                value,
            })?,
            None => DEFAULT_MAX_OPERATION_SIZE,
        };

        let statement_cache_capacity = match get_limit("statement_cache_capacity") {
            Some(value) => value.parse().map_err(|_| Error::InvalidValue {
                key: "statement_cache_capacity",
                value,
            })?,
            None => DEFAULT_STATEMENT_CACHE_CAPACITY,
        };

        Ok(Self {
            servers,
            backends,
            port,
            max_operation_size,
            statement_cache_capacity,
        })
    }

    pub fn servers(&self, kind: BackendKind) -> &[ServerAddress] {
        &self.servers[&kind]
    }

    pub fn server_count(&self, kind: BackendKind) -> usize {
        self.servers[&kind].len()
    }

    pub fn backend(&self, kind: BackendKind) -> &BackendConfig {
        &self.backends[&kind]
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn max_operation_size(&self) -> u64 {
        self.max_operation_size
    }

    pub fn statement_cache_capacity(&self) -> usize {
        self.statement_cache_capacity
    }

    /// Whether the daemon at `(host, port)` hosts `kind`.
    pub fn is_server_for(&self, kind: BackendKind, host: &str, port: u16) -> bool {
        self.servers[&kind]
            .iter()
            .any(|address| address.host == host && address.port == port)
    }

    /// Backend families hosted by the daemon at `(host, port)`, in
    /// object/kv/db order.
    pub fn hosted_kinds(&self, host: &str, port: u16) -> Vec<BackendKind> {
        BackendKind::ALL
            .into_iter()
            .filter(|kind| self.is_server_for(*kind, host, port))
            .collect()
    }

    /// The union of all configured server addresses, deduplicated, in
    /// first-seen order. Client connections are keyed by an index into this
    /// list.
    pub fn all_servers(&self) -> Vec<ServerAddress> {
        let mut seen = Vec::new();

        for kind in BackendKind::ALL {
            for address in &self.servers[&kind] {
                if !seen.contains(address) {
                    seen.push(address.clone());
                }
            }
        }

        seen
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    const FIXTURE: &str = r#"
[servers]
object = alpha:4711,beta:4711
kv = alpha:4711
db = beta:4711
port = 4711

[backend]
object = memory
object-path = /var/lib/julea/objects/{PORT}
kv = memory
kv-path = /var/lib/julea/kv/{PORT}
db = sqlite
db-path = /var/lib/julea/db-{PORT}.sqlite

[limits]
max_operation_size = 1048576
statement_cache_capacity = 32
"#;

    #[test]
    fn parses_all_sections() {
        let file = write_config(FIXTURE);
        let config = Configuration::load(file.path()).unwrap();

        assert_eq!(config.port(), 4711);
        assert_eq!(config.server_count(BackendKind::Object), 2);
        assert_eq!(config.server_count(BackendKind::Kv), 1);
        assert_eq!(config.servers(BackendKind::Db)[0].host, "beta");
        assert_eq!(config.max_operation_size(), 1_048_576);
        assert_eq!(config.statement_cache_capacity(), 32);

        assert_eq!(config.backend(BackendKind::Db).name, "sqlite");
        assert_eq!(
            config.backend(BackendKind::Db).path_for_port(4711),
            "/var/lib/julea/db-4711.sqlite"
        );
    }

    #[test]
    fn self_identification() {
        let file = write_config(FIXTURE);
        let config = Configuration::load(file.path()).unwrap();

        assert_eq!(
            config.hosted_kinds("alpha", 4711),
            vec![BackendKind::Object, BackendKind::Kv]
        );
        assert_eq!(
            config.hosted_kinds("beta", 4711),
            vec![BackendKind::Object, BackendKind::Db]
        );
        assert!(config.hosted_kinds("gamma", 4711).is_empty());
        assert!(!config.is_server_for(BackendKind::Kv, "alpha", 4712));
    }

    #[test]
    fn union_of_servers_is_deduplicated() {
        let file = write_config(FIXTURE);
        let config = Configuration::load(file.path()).unwrap();

        let all = config.all_servers();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].to_string(), "alpha:4711");
        assert_eq!(all[1].to_string(), "beta:4711");
    }

    #[test]
    fn addresses_default_the_port() {
        let address = ServerAddress::parse("gamma", 4711).unwrap();
        assert_eq!(address.port, 4711);

        assert!(ServerAddress::parse("gamma:notaport", 4711).is_err());
        assert!(ServerAddress::parse("", 4711).is_err());
    }

    #[test]
    fn missing_sections_are_reported() {
        let file = write_config("[servers]\nobject = a\nkv = a\ndb = a\n");
        assert!(matches!(
            Configuration::load(file.path()),
            Err(Error::MissingSection("backend"))
        ));
    }
}
