//! Persisted key layout.
//!
//! ```text
//! <prefix>/hosts/<name>/host
//! <prefix>/hosts/<name>/keypair
//! <prefix>/hosts/<name>/listeners/<id>
//! <prefix>/hosts/<name>/locations/<id>/{path,options,upstream}
//! <prefix>/hosts/<name>/locations/<id>/middlewares/<type>/<id>
//! <prefix>/upstreams/<id>/upstream
//! <prefix>/upstreams/<id>/endpoints/<id>
//! ```
//!
//! External tooling reads this layout directly, so it must stay stable.

const HOSTS: &str = "hosts";
const UPSTREAMS: &str = "upstreams";

/// A key that maps onto the domain model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRef {
    /// `hosts/<name>` directory
    HostDir { host: String },
    /// `hosts/<name>/host` record
    HostRecord { host: String },
    KeyPair { host: String },
    Listener { host: String, id: String },
    LocationDir { host: String, location: String },
    LocationPath { host: String, location: String },
    LocationOptions { host: String, location: String },
    LocationUpstream { host: String, location: String },
    Middleware {
        host: String,
        location: String,
        type_name: String,
        id: String,
    },
    /// `upstreams/<id>` directory
    UpstreamDir { upstream: String },
    /// `upstreams/<id>/upstream` record
    UpstreamRecord { upstream: String },
    Endpoint { upstream: String, id: String },
}

/// Builds and classifies keys below a fixed prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    /// `prefix` is normalized to a single leading slash and no trailing one.
    pub fn new(prefix: &str) -> Self {
        let trimmed = prefix.trim_matches('/');
        let prefix = if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{trimmed}")
        };
        Self { prefix }
    }

    /// Root of the layout; what the change feed watches.
    pub fn root(&self) -> &str {
        if self.prefix.is_empty() { "/" } else { &self.prefix }
    }

    pub fn hosts(&self) -> String {
        format!("{}/{HOSTS}", self.prefix)
    }

    pub fn host_dir(&self, host: &str) -> String {
        format!("{}/{host}", self.hosts())
    }

    pub fn host_record(&self, host: &str) -> String {
        format!("{}/host", self.host_dir(host))
    }

    pub fn key_pair(&self, host: &str) -> String {
        format!("{}/keypair", self.host_dir(host))
    }

    pub fn listeners(&self, host: &str) -> String {
        format!("{}/listeners", self.host_dir(host))
    }

    pub fn listener(&self, host: &str, id: &str) -> String {
        format!("{}/{id}", self.listeners(host))
    }

    pub fn locations(&self, host: &str) -> String {
        format!("{}/locations", self.host_dir(host))
    }

    pub fn location_dir(&self, host: &str, location: &str) -> String {
        format!("{}/{location}", self.locations(host))
    }

    pub fn location_path(&self, host: &str, location: &str) -> String {
        format!("{}/path", self.location_dir(host, location))
    }

    pub fn location_options(&self, host: &str, location: &str) -> String {
        format!("{}/options", self.location_dir(host, location))
    }

    pub fn location_upstream(&self, host: &str, location: &str) -> String {
        format!("{}/upstream", self.location_dir(host, location))
    }

    pub fn middlewares(&self, host: &str, location: &str) -> String {
        format!("{}/middlewares", self.location_dir(host, location))
    }

    pub fn middleware(&self, host: &str, location: &str, type_name: &str, id: &str) -> String {
        format!("{}/{type_name}/{id}", self.middlewares(host, location))
    }

    pub fn upstreams(&self) -> String {
        format!("{}/{UPSTREAMS}", self.prefix)
    }

    pub fn upstream_dir(&self, upstream: &str) -> String {
        format!("{}/{upstream}", self.upstreams())
    }

    pub fn upstream_record(&self, upstream: &str) -> String {
        format!("{}/upstream", self.upstream_dir(upstream))
    }

    pub fn endpoints(&self, upstream: &str) -> String {
        format!("{}/endpoints", self.upstream_dir(upstream))
    }

    pub fn endpoint(&self, upstream: &str, id: &str) -> String {
        format!("{}/{id}", self.endpoints(upstream))
    }

    /// Map a store key to the entity it belongs to; `None` for keys outside the layout.
    pub fn classify(&self, key: &str) -> Option<KeyRef> {
        let rest = key.strip_prefix(self.prefix.as_str())?;
        let rest = rest.strip_prefix('/')?;
        let segments: Vec<&str> = rest.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return None;
        }
        let key_ref = match segments.as_slice() {
            [HOSTS, host] => KeyRef::HostDir { host: host.to_string() },
            [HOSTS, host, "host"] => KeyRef::HostRecord { host: host.to_string() },
            [HOSTS, host, "keypair"] => KeyRef::KeyPair { host: host.to_string() },
            [HOSTS, host, "listeners", id] => KeyRef::Listener {
                host: host.to_string(),
                id: id.to_string(),
            },
            [HOSTS, host, "locations", location] => KeyRef::LocationDir {
                host: host.to_string(),
                location: location.to_string(),
            },
            [HOSTS, host, "locations", location, "path"] => KeyRef::LocationPath {
                host: host.to_string(),
                location: location.to_string(),
            },
            [HOSTS, host, "locations", location, "options"] => KeyRef::LocationOptions {
                host: host.to_string(),
                location: location.to_string(),
            },
            [HOSTS, host, "locations", location, "upstream"] => KeyRef::LocationUpstream {
                host: host.to_string(),
                location: location.to_string(),
            },
            [HOSTS, host, "locations", location, "middlewares", type_name, id] => {
                KeyRef::Middleware {
                    host: host.to_string(),
                    location: location.to_string(),
                    type_name: type_name.to_string(),
                    id: id.to_string(),
                }
            }
            [UPSTREAMS, upstream] => KeyRef::UpstreamDir {
                upstream: upstream.to_string(),
            },
            [UPSTREAMS, upstream, "upstream"] => KeyRef::UpstreamRecord {
                upstream: upstream.to_string(),
            },
            [UPSTREAMS, upstream, "endpoints", id] => KeyRef::Endpoint {
                upstream: upstream.to_string(),
                id: id.to_string(),
            },
            _ => return None,
        };
        Some(key_ref)
    }
}
