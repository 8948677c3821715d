//! Per-peer key table
//!
//! A server socket authenticates each peer with that peer's key. `KeyMapping`
//! holds those keys, validated up front so installing them later only fails
//! for kernel reasons.

use std::collections::btree_map::{self, BTreeMap};
use std::net::IpAddr;

use serde::Deserialize;
use tracing::warn;

use crate::accessor::validate_key_length;
use crate::errors::{Error, Result};
use crate::types::KeyMaterial;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "BTreeMap<IpAddr, String>")]
pub struct KeyMapping {
    keys: BTreeMap<IpAddr, KeyMaterial>,
}

impl KeyMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the key for `addr`. An empty key means the peer has no
    /// password and is skipped.
    pub fn insert(&mut self, addr: IpAddr, key: impl Into<KeyMaterial>) -> Result<()> {
        let key = key.into();
        validate_key_length(key.len())?;
        if key.is_empty() {
            warn!("Peer {} has an empty key; skipping it", addr);
            return Ok(());
        }
        self.keys.insert(addr, key);
        Ok(())
    }

    /// Add an ASCII password for `addr`.
    pub fn insert_password(&mut self, addr: IpAddr, password: &str) -> Result<()> {
        if !password.is_ascii() {
            return Err(Error::invalid_argument(format!(
                "password for peer {} is not ASCII",
                addr
            )));
        }
        self.insert(addr, password.as_bytes())
    }

    pub fn get(&self, addr: &IpAddr) -> Option<&KeyMaterial> {
        self.keys.get(addr)
    }

    pub fn remove(&mut self, addr: &IpAddr) -> Option<KeyMaterial> {
        self.keys.remove(addr)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Entries in address order.
    pub fn iter(&self) -> btree_map::Iter<'_, IpAddr, KeyMaterial> {
        self.keys.iter()
    }
}

impl TryFrom<BTreeMap<IpAddr, String>> for KeyMapping {
    type Error = Error;

    fn try_from(passwords: BTreeMap<IpAddr, String>) -> Result<Self> {
        let mut mapping = KeyMapping::new();
        for (addr, password) in passwords {
            mapping.insert_password(addr, &password)?;
        }
        Ok(mapping)
    }
}

impl<'a> IntoIterator for &'a KeyMapping {
    type Item = (&'a IpAddr, &'a KeyMaterial);
    type IntoIter = btree_map::Iter<'a, IpAddr, KeyMaterial>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
