//! Device protocol variants.
//!
//! Each variant renders the protocol-neutral [`PortChange`] into the request
//! its management plane understands. New vendors are new variants here; the
//! rest of the system only sees [`PortDriver`](crate::PortDriver).

use crate::{CapabilitySet, PortChange};
use portctl_types::{AdminState, Operation, PortConfig, PortId, PortMode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

const OC_INTERFACES: &str = "http://openconfig.net/yang/interfaces";
const OC_ETHERNET: &str = "http://openconfig.net/yang/interfaces/ethernet";
const OC_VLAN: &str = "http://openconfig.net/yang/vlan";

/// Management protocol family of a switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    /// NETCONF with OpenConfig interface models.
    Netconf,
    /// SNMP SET against IF-MIB and Q-BRIDGE-MIB.
    Snmp,
    /// Vendor REST/JSON API.
    VendorApi,
}

impl DriverKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Netconf => "netconf",
            DriverKind::Snmp => "snmp",
            DriverKind::VendorApi => "vendor_api",
        }
    }

    /// Operations the protocol can express.
    ///
    /// SNMP has no switchport-mode object in the standard MIBs and no
    /// transactional restore.
    pub fn default_capabilities(&self) -> CapabilitySet {
        match self {
            DriverKind::Netconf | DriverKind::VendorApi => CapabilitySet::all(),
            DriverKind::Snmp => CapabilitySet::all()
                .without(Operation::SetMode)
                .without(Operation::Rollback),
        }
    }

    /// Renders a mutating change. `None` if the protocol cannot express it.
    pub fn render(&self, port: &PortId, change: &PortChange) -> Option<String> {
        match self {
            DriverKind::Netconf => Some(netconf_edit(port, change)),
            DriverKind::Snmp => snmp_set(port, change),
            DriverKind::VendorApi => Some(vendor_patch(port, change)),
        }
    }

    /// Renders the read used by `verify`.
    pub fn render_read(&self, port: &PortId) -> String {
        match self {
            DriverKind::Netconf => format!(
                "<get-config><source><running/></source><filter type=\"subtree\">\
                 <interfaces xmlns=\"{}\"><interface><name>{}</name></interface></interfaces>\
                 </filter></get-config>",
                OC_INTERFACES, port
            ),
            DriverKind::Snmp => {
                let idx = if_index(port);
                format!(
                    "GET IF-MIB::ifAdminStatus.{idx} Q-BRIDGE-MIB::dot1qPvid.{idx}",
                    idx = idx
                )
            }
            DriverKind::VendorApi => json!({
                "method": "GET",
                "path": format!("/interfaces/{}", port),
            })
            .to_string(),
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn if_index(port: &PortId) -> String {
    port.number()
        .map(|n| n.to_string())
        .unwrap_or_else(|| port.to_string())
}

fn oc_mode(mode: PortMode) -> &'static str {
    match mode {
        PortMode::Access => "ACCESS",
        PortMode::Trunk => "TRUNK",
        PortMode::Routed => "ROUTED",
    }
}

fn netconf_fragment(config: &PortConfig) -> String {
    let mut body = format!(
        "<config><enabled>{}</enabled></config>",
        config.admin.is_up()
    );
    if config.vlan.is_some() || config.mode.is_some() {
        let mut vlan_cfg = String::new();
        if let Some(mode) = config.mode {
            vlan_cfg.push_str(&format!("<interface-mode>{}</interface-mode>", oc_mode(mode)));
        }
        if let Some(vlan) = config.vlan {
            vlan_cfg.push_str(&format!("<access-vlan>{}</access-vlan>", vlan));
        }
        body.push_str(&format!(
            "<ethernet xmlns=\"{}\"><switched-vlan xmlns=\"{}\"><config>{}</config></switched-vlan></ethernet>",
            OC_ETHERNET, OC_VLAN, vlan_cfg
        ));
    }
    body
}

fn netconf_edit(port: &PortId, change: &PortChange) -> String {
    let (operation, body) = match change {
        PortChange::Activate | PortChange::Deactivate => (
            "merge",
            format!(
                "<config><enabled>{}</enabled></config>",
                matches!(change, PortChange::Activate)
            ),
        ),
        PortChange::SetVlan(vlan) => (
            "merge",
            format!(
                "<ethernet xmlns=\"{}\"><switched-vlan xmlns=\"{}\"><config>\
                 <access-vlan>{}</access-vlan></config></switched-vlan></ethernet>",
                OC_ETHERNET, OC_VLAN, vlan
            ),
        ),
        PortChange::SetMode(mode) => (
            "merge",
            format!(
                "<ethernet xmlns=\"{}\"><switched-vlan xmlns=\"{}\"><config>\
                 <interface-mode>{}</interface-mode></config></switched-vlan></ethernet>",
                OC_ETHERNET,
                OC_VLAN,
                oc_mode(*mode)
            ),
        ),
        PortChange::Rollback(snapshot) => ("replace", netconf_fragment(snapshot)),
    };
    format!(
        "<edit-config><target><running/></target><config>\
         <interfaces xmlns=\"{}\"><interface operation=\"{}\"><name>{}</name>{}</interface></interfaces>\
         </config></edit-config>",
        OC_INTERFACES, operation, port, body
    )
}

fn snmp_set(port: &PortId, change: &PortChange) -> Option<String> {
    let idx = if_index(port);
    match change {
        PortChange::Activate => Some(format!("SET IF-MIB::ifAdminStatus.{} i 1", idx)),
        PortChange::Deactivate => Some(format!("SET IF-MIB::ifAdminStatus.{} i 2", idx)),
        PortChange::SetVlan(vlan) => Some(format!("SET Q-BRIDGE-MIB::dot1qPvid.{} u {}", idx, vlan)),
        PortChange::SetMode(_) | PortChange::Rollback(_) => None,
    }
}

fn vendor_patch(port: &PortId, change: &PortChange) -> String {
    let body = match change {
        PortChange::Activate => json!({ "admin": AdminState::Up }),
        PortChange::Deactivate => json!({ "admin": AdminState::Down }),
        PortChange::SetVlan(vlan) => json!({ "vlan": vlan }),
        PortChange::SetMode(mode) => json!({ "mode": mode }),
        PortChange::Rollback(snapshot) => json!({ "replace": snapshot }),
    };
    json!({
        "method": "PATCH",
        "path": format!("/interfaces/{}", port),
        "body": body,
    })
    .to_string()
}
