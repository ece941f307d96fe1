//! Fleet inventory: hosts and groups loaded from YAML.
//!
//! A file carries an ordered `hosts:` list and a `groups:` map. Group
//! membership resolves recursively through `children`, visiting each group
//! once and each host once, in declaration order. A directory loads every
//! `*.yaml`/`*.yml` file in name order into one inventory.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::host::{BaseOs, Host};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub children: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub hosts: Vec<Host>,
    #[serde(default)]
    pub groups: BTreeMap<String, Group>,
}

/// Which hosts a command operates on. Empty filters select everything.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    pub group: Option<String>,
    pub names: Vec<String>,
    pub base: Option<BaseOs>,
}

impl Inventory {
    pub fn load(path: &Path) -> Result<Self> {
        let inventory = if path.is_dir() {
            Self::load_dir(path)?
        } else {
            Self::load_file(path)?
        };
        inventory.validate()?;
        debug!(
            hosts = inventory.hosts.len(),
            groups = inventory.groups.len(),
            "inventory loaded"
        );
        Ok(inventory)
    }

    pub fn from_yaml(body: &str) -> Result<Self> {
        serde_yaml::from_str(body).context("failed to parse inventory YAML")
    }

    fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read inventory from {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("in {}", path.display()))
    }

    fn load_dir(dir: &Path) -> Result<Self> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("failed to read inventory directory {}", dir.display()))?
        {
            let path = entry?.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == "yaml" || e == "yml");
            if path.is_file() && is_yaml {
                files.push(path);
            }
        }
        files.sort();

        let mut merged = Inventory::default();
        for file in files {
            let part = Self::load_file(&file)?;
            merged.hosts.extend(part.hosts);
            for (name, group) in part.groups {
                if merged.groups.insert(name.clone(), group).is_some() {
                    bail!("group '{}' defined twice (again in {})", name, file.display());
                }
            }
        }
        Ok(merged)
    }

    /// Reject duplicate hosts, empty addresses and dangling group references.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for host in &self.hosts {
            if !names.insert(host.name.as_str()) {
                bail!("host '{}' is defined more than once", host.name);
            }
            if host.addr.trim().is_empty() {
                bail!("host '{}' has no address", host.name);
            }
            if host.base == BaseOs::Unknown {
                warn!(host = %host.name, "host has no recognised base OS, it cannot be built");
            }
        }

        for (name, group) in &self.groups {
            if let Some(missing) = group.hosts.iter().find(|h| !names.contains(h.as_str())) {
                bail!("group '{name}' references unknown host '{missing}'");
            }
            if let Some(missing) = group.children.iter().find(|c| !self.groups.contains_key(*c)) {
                bail!("group '{name}' references unknown child group '{missing}'");
            }
        }
        Ok(())
    }

    pub fn host(&self, name: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.name == name)
    }

    /// Hosts of a group and its descendants, de-duplicated, first occurrence
    /// wins. `None` for an unknown group.
    pub fn hosts_in_group(&self, group: &str) -> Option<Vec<&Host>> {
        self.groups.get(group)?;

        let mut visited = HashSet::new();
        let mut seen = HashSet::new();
        let mut names = Vec::new();
        self.collect_group(group, &mut visited, &mut seen, &mut names);

        Some(names.into_iter().filter_map(|n| self.host(n)).collect())
    }

    fn collect_group<'a>(
        &'a self,
        group: &'a str,
        visited: &mut HashSet<&'a str>,
        seen: &mut HashSet<&'a str>,
        out: &mut Vec<&'a str>,
    ) {
        if !visited.insert(group) {
            return;
        }
        let Some(def) = self.groups.get(group) else {
            return;
        };
        for host in &def.hosts {
            if seen.insert(host.as_str()) {
                out.push(host.as_str());
            }
        }
        for child in &def.children {
            self.collect_group(child, visited, seen, out);
        }
    }

    /// Apply a selector, preserving inventory order (or group order when a
    /// group is named). Unknown group or host names are errors.
    pub fn select(&self, selector: &Selector) -> Result<Vec<Host>> {
        let mut hosts: Vec<&Host> = match &selector.group {
            Some(group) => self
                .hosts_in_group(group)
                .with_context(|| format!("unknown group '{group}'"))?,
            None => self.hosts.iter().collect(),
        };

        if !selector.names.is_empty() {
            if let Some(unknown) = selector.names.iter().find(|n| self.host(n).is_none()) {
                bail!("unknown host '{unknown}'");
            }
            hosts.retain(|h| selector.names.contains(&h.name));
        }

        if let Some(base) = selector.base {
            hosts.retain(|h| h.base == base);
        }

        Ok(hosts.into_iter().cloned().collect())
    }
}
