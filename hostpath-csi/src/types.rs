//! Type-safe wrappers for CSI driver domain types.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::csi;
use crate::error::Error;

/// Topology segment key advertised for every volume and node.
pub const TOPOLOGY_KEY: &str = "topology.hostpath.csi/node";

/// Volume context key carrying the backing directory.
pub const CONTEXT_PATH: &str = "path";

/// Maximum length of a volume id in bytes.
const VOLUME_ID_MAX_LEN: usize = 128;

/// A caller-supplied volume identifier.
///
/// Volume ids double as directory names under the volume root, so they
/// must be a single, non-hidden path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeId(String);

impl VolumeId {
    pub fn parse(volume_id: impl Into<String>) -> Result<Self, Error> {
        let volume_id = volume_id.into();
        let reason = if volume_id.is_empty() {
            Some("must not be empty")
        } else if volume_id.len() > VOLUME_ID_MAX_LEN {
            Some("must be at most 128 bytes")
        } else if volume_id.starts_with('.') {
            Some("must not start with '.'")
        } else if volume_id.contains(['/', '\0']) {
            Some("must not contain '/' or NUL")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(Error::InvalidVolumeId { volume_id, reason }),
            None => Ok(Self(volume_id)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A ListVolumes continuation token: the offset into the sorted volume list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ListToken(usize);

impl ListToken {
    /// Parse a starting token. An empty token starts from the beginning.
    pub fn parse(token: &str) -> Result<Self, Error> {
        if token.is_empty() {
            return Ok(Self(0));
        }
        token
            .parse::<usize>()
            .map(Self)
            .map_err(|_| Error::InvalidStartingToken(token.to_string()))
    }

    pub fn offset(self) -> usize {
        self.0
    }
}

impl fmt::Display for ListToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One page of a listing plus the token for the next page, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub entries: Vec<T>,
    pub next: Option<ListToken>,
}

impl<T> Page<T> {
    /// Slice `items` starting at `token`, returning at most `max_entries`
    /// items (`0` means no limit).
    pub fn slice(items: Vec<T>, token: ListToken, max_entries: i32) -> Result<Self, Error> {
        if max_entries < 0 {
            return Err(Error::InvalidMaxEntries(max_entries));
        }
        let total = items.len();
        let start = token.offset().min(total);
        let limit = if max_entries == 0 {
            total
        } else {
            max_entries as usize
        };

        let entries: Vec<T> = items.into_iter().skip(start).take(limit).collect();
        let end = start + entries.len();
        let next = (end < total).then_some(ListToken(end));
        Ok(Self { entries, next })
    }
}

/// Topology segment identifying `node_id` as the only accessible node.
pub fn node_topology(node_id: &str) -> csi::Topology {
    csi::Topology {
        segments: HashMap::from([(TOPOLOGY_KEY.to_string(), node_id.to_string())]),
    }
}
