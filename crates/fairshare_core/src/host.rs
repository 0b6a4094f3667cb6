//! Static host table.
//!
//! One line per host in the `<name>.hosts` file:
//!
//! ```text
//! # host      max_load  login options...
//! node1       4
//! node2       2.5       -p 2222 -l batch
//! ```
//!
//! Blank lines and `#` comments are ignored.

use crate::{CoreError, CoreResult};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Capacity and login configuration for one worker host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    /// Host name used for remote login
    pub name: String,
    /// Maximum number of concurrent workers
    pub max_load: f64,
    /// Extra options passed to the remote-login command
    pub login_options: String,
}

impl HostInfo {
    /// Create host info with no login options
    #[must_use]
    pub fn new(name: impl Into<String>, max_load: f64) -> Self {
        Self {
            name: name.into(),
            max_load,
            login_options: String::new(),
        }
    }

    /// Set login options
    #[must_use]
    pub fn with_login_options(mut self, options: impl Into<String>) -> Self {
        self.login_options = options.into();
        self
    }

    fn render(&self) -> String {
        if self.login_options.is_empty() {
            format!("{}\t{}", self.name, self.max_load)
        } else {
            format!("{}\t{}\t{}", self.name, self.max_load, self.login_options)
        }
    }
}

/// Host table, kept in file order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostTable {
    hosts: IndexMap<String, HostInfo>,
}

impl HostTable {
    /// Create an empty host table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse host table text
    ///
    /// # Errors
    ///
    /// Returns error if a line lacks a valid max load
    pub fn parse(source: &str, text: &str) -> CoreResult<Self> {
        let mut table = Self::new();
        for (index, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let parse_error = |message: String| CoreError::ParseError {
                source: source.to_string(),
                line: index + 1,
                message,
            };

            let mut fields = line.split_whitespace();
            let name = fields.next().unwrap_or_default();
            let max_load: f64 = fields
                .next()
                .ok_or_else(|| parse_error(format!("missing max load for host {}", name)))?
                .parse()
                .map_err(|_| parse_error(format!("invalid max load for host {}", name)))?;
            if !max_load.is_finite() || max_load < 0.0 {
                return Err(parse_error(format!(
                    "max load must be a finite non-negative number for host {}",
                    name
                )));
            }
            let login_options = fields.collect::<Vec<_>>().join(" ");

            table.set(HostInfo {
                name: name.to_string(),
                max_load,
                login_options,
            });
        }
        Ok(table)
    }

    /// Load the host table from a file; a missing file yields an empty table
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: &Path) -> CoreResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&path.display().to_string(), &text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "host table missing, starting empty");
                Ok(Self::new())
            }
            Err(err) => Err(CoreError::io(path, &err)),
        }
    }

    /// Write the host table back to a file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub fn save(&self, path: &Path) -> CoreResult<()> {
        std::fs::write(path, self.render()).map_err(|err| CoreError::io(path, &err))
    }

    /// Render in host file format
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for info in self.hosts.values() {
            out.push_str(&info.render());
            out.push('\n');
        }
        out
    }

    /// Insert or replace a host, returning the previous entry
    pub fn set(&mut self, info: HostInfo) -> Option<HostInfo> {
        self.hosts.insert(info.name.clone(), info)
    }

    /// Look up a host
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&HostInfo> {
        self.hosts.get(name)
    }

    /// Iterate hosts in file order
    pub fn iter(&self) -> impl Iterator<Item = &HostInfo> {
        self.hosts.values()
    }

    /// Sum of all hosts' max load
    #[must_use]
    pub fn total_capacity(&self) -> f64 {
        self.hosts.values().map(|h| h.max_load).sum()
    }

    /// Number of hosts
    #[must_use]
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// Whether the table has no hosts
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}
