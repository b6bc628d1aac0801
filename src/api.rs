//! Request and response shapes of the volume plugin protocol. Field names
//! follow the wire format, which capitalizes everything.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRequest {
    #[serde(rename = "Name")]
    pub name: String,
    /// Per-request overrides: pool, name, size, fstype, features.
    #[serde(rename = "Opts", default)]
    pub opts: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveRequest {
    #[serde(rename = "Name")]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountRequest {
    #[serde(rename = "Name")]
    pub name: String,
    /// Opaque caller id; the matching unmount must present the same one.
    #[serde(rename = "ID", default)]
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnmountRequest {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "ID", default)]
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRequest {
    #[serde(rename = "Name")]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRequest {
    #[serde(rename = "Name")]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountResponse {
    #[serde(rename = "Mountpoint")]
    pub mountpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathResponse {
    #[serde(rename = "Mountpoint")]
    pub mountpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Mountpoint", skip_serializing_if = "Option::is_none")]
    pub mountpoint: Option<String>,
    #[serde(rename = "CreatedAt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetResponse {
    #[serde(rename = "Volume")]
    pub volume: VolumeInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse {
    #[serde(rename = "Volumes")]
    pub volumes: Vec<VolumeInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    #[serde(rename = "Scope")]
    pub scope: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitiesResponse {
    #[serde(rename = "Capabilities")]
    pub capabilities: Capability,
}

impl CapabilitiesResponse {
    /// Volume names are cluster-wide, so the driver reports global scope.
    pub fn global() -> Self {
        Self {
            capabilities: Capability {
                scope: "global".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivateResponse {
    #[serde(rename = "Implements")]
    pub implements: Vec<String>,
}

impl Default for ActivateResponse {
    fn default() -> Self {
        Self {
            implements: vec!["VolumeDriver".to_string()],
        }
    }
}

/// Protocol errors ride in the response body, not the HTTP status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(rename = "Err")]
    pub err: String,
}

impl ErrorResponse {
    pub fn none() -> Self {
        Self { err: String::new() }
    }

    pub fn new(message: impl ToString) -> Self {
        Self {
            err: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_deserialize_the_wire_field_names() {
        let request: CreateRequest = serde_json::from_str(
            r#"{"Name": "volumes/rw-1", "Opts": {"size": "1024", "fstype": "ext4"}}"#,
        )
        .unwrap();
        assert_eq!(request.name, "volumes/rw-1");
        assert_eq!(request.opts["size"], "1024");

        let request: MountRequest =
            serde_json::from_str(r#"{"Name": "volumes/rw-1", "ID": "c1"}"#).unwrap();
        assert_eq!(request.id, "c1");
    }

    #[test]
    fn opts_default_to_empty() {
        let request: CreateRequest = serde_json::from_str(r#"{"Name": "a"}"#).unwrap();
        assert!(request.opts.is_empty());
    }

    #[test]
    fn volume_info_omits_absent_fields() {
        let info = VolumeInfo {
            name: "volumes/a".to_string(),
            mountpoint: None,
            created_at: None,
        };
        assert_eq!(
            serde_json::to_string(&info).unwrap(),
            r#"{"Name":"volumes/a"}"#
        );
    }

    #[test]
    fn capabilities_scope_is_global() {
        let json = serde_json::to_string(&CapabilitiesResponse::global()).unwrap();
        assert_eq!(json, r#"{"Capabilities":{"Scope":"global"}}"#);
    }

    #[test]
    fn activate_announces_the_volume_driver() {
        let json = serde_json::to_string(&ActivateResponse::default()).unwrap();
        assert_eq!(json, r#"{"Implements":["VolumeDriver"]}"#);
    }
}
