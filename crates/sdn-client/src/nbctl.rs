//! `ovn-nbctl` backed client
//!
//! A thin process shim: every trait call becomes one `ovn-nbctl`
//! invocation (commands chained with `--` run as one transaction). Reads use
//! `--format=json --data=json` and decode the OVSDB JSON encoding of atoms,
//! sets and maps. Argument building and output decoding are plain functions
//! so they can be tested without the binary.

use crate::error::SdnError;
use crate::models::*;
use crate::sdn_trait::SdnClientTrait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Default binary name
pub const NBCTL_BINARY: &str = "ovn-nbctl";

/// Client shelling out to `ovn-nbctl`
#[derive(Debug, Clone)]
pub struct NbctlClient {
    binary: String,
    db: Option<String>,
    timeout: Duration,
}

impl NbctlClient {
    /// Create a new client
    ///
    /// # Arguments
    /// * `db` - northbound database address (e.g. `tcp:10.0.0.1:6641`); `None` uses the default socket
    /// * `timeout` - per-command timeout passed to `ovn-nbctl` and enforced locally
    pub fn new(db: Option<String>, timeout: Duration) -> Self {
        Self {
            binary: NBCTL_BINARY.to_string(),
            db,
            timeout,
        }
    }

    /// Use a different binary (e.g. a wrapper script).
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn global_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(db) = &self.db {
            args.push(format!("--db={}", db));
        }
        args.push(format!("--timeout={}", self.timeout.as_secs().max(1)));
        args
    }

    async fn run(&self, args: Vec<String>) -> Result<String, SdnError> {
        let mut full = self.global_args();
        full.extend(args);
        let command_line = format!("{} {}", self.binary, full.join(" "));
        debug!("Running {}", command_line);

        let mut command = Command::new(&self.binary);
        command.args(&full).kill_on_drop(true);

        // Local deadline slightly past the server-side timeout
        let deadline = self.timeout + Duration::from_secs(5);
        let output = tokio::time::timeout(deadline, command.output())
            .await
            .map_err(|_| SdnError::Timeout(deadline))??;

        if !output.status.success() {
            return Err(SdnError::Command {
                command: command_line,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn find(&self, table: &str, columns: &[&str], conditions: &[String]) -> Result<Vec<Row>, SdnError> {
        let output = self.run(find_args(table, columns, conditions)).await?;
        parse_rows(&output)
    }
}

/// One decoded table row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row(HashMap<String, Value>);

impl Row {
    /// String atom of a column; empty for missing columns and empty sets.
    pub fn string(&self, column: &str) -> String {
        match self.0.get(column) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            Some(v @ Value::Array(_)) => match atom_uuid(v) {
                Some(uuid) => uuid,
                None => set_values(v).first().map(atom_string).unwrap_or_default(),
            },
            _ => String::new(),
        }
    }

    /// Integer atom of a column.
    pub fn int(&self, column: &str) -> Option<i64> {
        self.0.get(column).and_then(Value::as_i64)
    }

    /// Members of a set column as strings (UUIDs unwrapped).
    pub fn set(&self, column: &str) -> Vec<String> {
        self.0
            .get(column)
            .map(|v| set_values(v).iter().map(atom_string).collect())
            .unwrap_or_default()
    }

    /// A map column.
    pub fn map(&self, column: &str) -> BTreeMap<String, String> {
        let Some(Value::Array(parts)) = self.0.get(column) else {
            return BTreeMap::new();
        };
        match parts.as_slice() {
            [Value::String(tag), Value::Array(pairs)] if tag == "map" => pairs
                .iter()
                .filter_map(|pair| match pair.as_array().map(Vec::as_slice) {
                    Some([k, v]) => Some((atom_string(k), atom_string(v))),
                    _ => None,
                })
                .collect(),
            _ => BTreeMap::new(),
        }
    }
}

fn atom_uuid(value: &Value) -> Option<String> {
    match value.as_array().map(Vec::as_slice) {
        Some([Value::String(tag), Value::String(id)]) if tag == "uuid" || tag == "named-uuid" => {
            Some(id.clone())
        }
        _ => None,
    }
}

fn atom_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => atom_uuid(other).unwrap_or_default(),
    }
}

fn set_values(value: &Value) -> Vec<Value> {
    match value.as_array().map(Vec::as_slice) {
        Some([Value::String(tag), Value::Array(members)]) if tag == "set" => members.clone(),
        Some([Value::String(tag), Value::Array(_)]) if tag == "map" => Vec::new(),
        _ => vec![value.clone()],
    }
}

/// Decodes `--format=json` table output into rows.
pub fn parse_rows(output: &str) -> Result<Vec<Row>, SdnError> {
    if output.trim().is_empty() {
        return Ok(Vec::new());
    }
    let table: Value = serde_json::from_str(output)?;
    let headings: Vec<String> = table
        .get("headings")
        .and_then(Value::as_array)
        .ok_or_else(|| SdnError::Parse("missing headings".to_string()))?
        .iter()
        .map(atom_string)
        .collect();
    let data = table
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| SdnError::Parse("missing data".to_string()))?;

    data.iter()
        .map(|row| {
            let cells = row
                .as_array()
                .ok_or_else(|| SdnError::Parse(format!("row is not an array: {}", row)))?;
            Ok(Row(headings.iter().cloned().zip(cells.iter().cloned()).collect()))
        })
        .collect()
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn external_id_args(column_prefix: &str, ids: &ExternalIds) -> Vec<String> {
    ids.iter()
        .map(|(k, v)| format!("{}:{}={}", column_prefix, k, quote(v)))
        .collect()
}

fn chain(commands: Vec<Vec<String>>) -> Vec<String> {
    let mut args = Vec::new();
    for (i, command) in commands.into_iter().filter(|c| !c.is_empty()).enumerate() {
        if i > 0 {
            args.push("--".to_string());
        }
        args.extend(command);
    }
    args
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

/// `find` with JSON output.
pub fn find_args(table: &str, columns: &[&str], conditions: &[String]) -> Vec<String> {
    let mut args = strings(&["--format=json", "--data=json"]);
    args.push(format!("--columns={}", columns.join(",")));
    args.push("find".to_string());
    args.push(table.to_string());
    args.extend(conditions.iter().cloned());
    args
}

/// Router port networks: each gateway with its block's prefix length.
pub fn router_port_networks(gateway: &str, cidr: &str) -> Vec<String> {
    gateway
        .split(',')
        .zip(cidr.split(','))
        .filter_map(|(gw, block)| {
            let prefix = block.split_once('/')?.1;
            Some(format!("{}/{}", gw.trim(), prefix.trim()))
        })
        .collect()
}

/// Name of the router port facing `switch`.
pub fn router_port_name(router: &str, switch: &str) -> String {
    format!("{}-{}", router, switch)
}

/// Name of the switch port facing `router`.
pub fn switch_router_port_name(switch: &str, router: &str) -> String {
    format!("{}-{}", switch, router)
}

/// Switch creation, configuration and router attachment in one transaction.
pub fn create_switch_args(switch: &LogicalSwitch, router: &str) -> Vec<String> {
    let lrp = router_port_name(router, &switch.name);
    let lsp = switch_router_port_name(&switch.name, router);

    let mut set = strings(&["set", "logical_switch", &switch.name]);
    set.push(format!("other_config:subnet={}", quote(&switch.cidr)));
    set.push(format!("other_config:gateway={}", quote(&switch.gateway)));
    set.push(format!("other_config:gateway_mac={}", quote(&switch.gateway_mac)));
    set.push(format!(
        "other_config:exclude_ips={}",
        quote(&switch.exclude_ips.join(" "))
    ));
    set.extend(external_id_args("external_ids", &switch.external_ids));

    let mut lrp_add = strings(&["--may-exist", "lrp-add", router, &lrp, &switch.gateway_mac]);
    lrp_add.extend(router_port_networks(&switch.gateway, &switch.cidr));

    chain(vec![
        strings(&["--may-exist", "ls-add", &switch.name]),
        set,
        lrp_add,
        strings(&["--may-exist", "lsp-add", &switch.name, &lsp]),
        strings(&["lsp-set-type", &lsp, "router"]),
        strings(&["lsp-set-addresses", &lsp, "router"]),
        vec![
            "lsp-set-options".to_string(),
            lsp.clone(),
            format!("router-port={}", lrp),
        ],
    ])
}

/// Switch deletion together with its router port.
pub fn delete_switch_args(name: &str, router: &str) -> Vec<String> {
    chain(vec![
        strings(&["--if-exists", "ls-del", name]),
        strings(&["--if-exists", "lrp-del", &router_port_name(router, name)]),
    ])
}

/// Port creation with addresses, port security and ownership.
pub fn create_port_args(port: &LogicalSwitchPort) -> Vec<String> {
    let addresses = port.addresses();
    let mut set = strings(&["set", "logical_switch_port", &port.name]);
    set.extend(external_id_args("external_ids", &port.external_ids));
    set.push(format!("external_ids:{}={}", EXTERNAL_ID_SWITCH, quote(&port.switch)));

    chain(vec![
        strings(&["--may-exist", "lsp-add", &port.switch, &port.name]),
        strings(&["lsp-set-addresses", &port.name, &addresses]),
        strings(&["lsp-set-port-security", &port.name, &addresses]),
        set,
    ])
}

/// Replaces all static routes of a router.
pub fn static_route_args(router: &str, routes: &[StaticRoute]) -> Vec<String> {
    let mut commands = vec![strings(&["--if-exists", "lr-route-del", router])];
    for route in routes {
        commands.push(strings(&[
            "--may-exist",
            "lr-route-add",
            router,
            &route.ip_prefix,
            &route.nexthop,
        ]));
    }
    chain(commands)
}

/// Port group replacement: destroy, recreate with ports, ownership and ACLs.
pub fn apply_port_group_args(group: &PortGroup) -> Vec<String> {
    let mut pg_add = strings(&["pg-add", &group.name]);
    pg_add.extend(group.ports.iter().cloned());

    let mut set = strings(&["set", "port_group", &group.name]);
    set.extend(external_id_args("external_ids", &group.external_ids));

    let mut commands = vec![
        strings(&["--if-exists", "destroy", "port_group", &group.name]),
        pg_add,
        set,
    ];
    for acl in &group.acls {
        commands.push(vec![
            "--type=port-group".to_string(),
            "acl-add".to_string(),
            group.name.clone(),
            acl.direction.to_string(),
            acl.priority.to_string(),
            acl.match_expr.clone(),
            acl.action.to_string(),
        ]);
    }
    chain(commands)
}

fn parse_direction(s: &str) -> Option<AclDirection> {
    match s {
        "from-lport" => Some(AclDirection::FromLport),
        "to-lport" => Some(AclDirection::ToLport),
        _ => None,
    }
}

fn parse_action(s: &str) -> Option<AclAction> {
    match s {
        "allow-related" => Some(AclAction::AllowRelated),
        "drop" => Some(AclAction::Drop),
        _ => None,
    }
}

fn parse_protocol(s: &str) -> LbProtocol {
    match s {
        "udp" => LbProtocol::Udp,
        _ => LbProtocol::Tcp,
    }
}

fn parse_nat_type(s: &str) -> Option<NatType> {
    match s {
        "snat" => Some(NatType::Snat),
        "dnat_and_snat" => Some(NatType::DnatAndSnat),
        _ => None,
    }
}

/// Splits an `addresses` value (`"<mac> <ip>..."`) into MAC and addresses.
pub fn parse_addresses(addresses: &str) -> (String, Vec<String>) {
    let mut parts = addresses.split_whitespace();
    let mac = parts.next().unwrap_or_default().to_string();
    (mac, parts.map(str::to_string).collect())
}

#[async_trait::async_trait]
impl SdnClientTrait for NbctlClient {
    async fn list_logical_switches(&self) -> Result<Vec<LogicalSwitch>, SdnError> {
        let rows = self
            .find("logical_switch", &["name", "other_config", "external_ids"], &[])
            .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let config = row.map("other_config");
                let get = |key: &str| config.get(key).cloned().unwrap_or_default();
                LogicalSwitch {
                    name: row.string("name"),
                    cidr: get("subnet"),
                    gateway: get("gateway"),
                    exclude_ips: get("exclude_ips")
                        .split_whitespace()
                        .map(str::to_string)
                        .collect(),
                    gateway_mac: get("gateway_mac"),
                    external_ids: row.map("external_ids"),
                }
            })
            .collect())
    }

    async fn logical_switch_exists(&self, name: &str) -> Result<bool, SdnError> {
        let rows = self
            .find("logical_switch", &["name"], &[format!("name={}", quote(name))])
            .await?;
        Ok(!rows.is_empty())
    }

    async fn create_logical_switch(&self, switch: &LogicalSwitch, router: &str) -> Result<(), SdnError> {
        if switch.name.is_empty() {
            return Err(SdnError::InvalidRequest("logical switch name is empty".to_string()));
        }
        self.run(create_switch_args(switch, router)).await.map(|_| ())
    }

    async fn delete_logical_switch(&self, name: &str, router: &str) -> Result<(), SdnError> {
        self.run(delete_switch_args(name, router)).await.map(|_| ())
    }

    async fn list_logical_routers(&self) -> Result<Vec<LogicalRouter>, SdnError> {
        let routers = self
            .find("logical_router", &["name", "static_routes", "external_ids"], &[])
            .await?;
        let routes: HashMap<String, StaticRoute> = self
            .find("logical_router_static_route", &["_uuid", "ip_prefix", "nexthop"], &[])
            .await?
            .iter()
            .map(|row| {
                (
                    row.string("_uuid"),
                    StaticRoute {
                        ip_prefix: row.string("ip_prefix"),
                        nexthop: row.string("nexthop"),
                    },
                )
            })
            .collect();

        Ok(routers
            .iter()
            .map(|row| {
                let mut static_routes: Vec<StaticRoute> = row
                    .set("static_routes")
                    .iter()
                    .filter_map(|uuid| routes.get(uuid).cloned())
                    .collect();
                static_routes.sort();
                LogicalRouter {
                    name: row.string("name"),
                    static_routes,
                    external_ids: row.map("external_ids"),
                }
            })
            .collect())
    }

    async fn create_logical_router(&self, name: &str, external_ids: &ExternalIds) -> Result<(), SdnError> {
        let mut set = strings(&["set", "logical_router", name]);
        set.extend(external_id_args("external_ids", external_ids));
        let set = if external_ids.is_empty() { Vec::new() } else { set };
        self.run(chain(vec![strings(&["--may-exist", "lr-add", name]), set]))
            .await
            .map(|_| ())
    }

    async fn delete_logical_router(&self, name: &str) -> Result<(), SdnError> {
        self.run(strings(&["--if-exists", "lr-del", name])).await.map(|_| ())
    }

    async fn set_static_routes(&self, router: &str, routes: &[StaticRoute]) -> Result<(), SdnError> {
        self.run(static_route_args(router, routes)).await.map(|_| ())
    }

    async fn list_logical_switch_ports(&self, switch: Option<&str>) -> Result<Vec<LogicalSwitchPort>, SdnError> {
        let conditions: Vec<String> = switch
            .map(|s| vec![format!("external_ids:{}={}", EXTERNAL_ID_SWITCH, quote(s))])
            .unwrap_or_default();
        let rows = self
            .find("logical_switch_port", &["name", "addresses", "external_ids"], &conditions)
            .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let mut external_ids = row.map("external_ids");
                let switch = external_ids.remove(EXTERNAL_ID_SWITCH).unwrap_or_default();
                let (mac, ips) = parse_addresses(&row.string("addresses"));
                LogicalSwitchPort {
                    name: row.string("name"),
                    switch,
                    mac,
                    ips,
                    external_ids,
                }
            })
            .collect())
    }

    async fn create_logical_switch_port(&self, port: &LogicalSwitchPort) -> Result<(), SdnError> {
        if port.switch.is_empty() {
            return Err(SdnError::InvalidRequest(format!("port {} has no switch", port.name)));
        }
        self.run(create_port_args(port)).await.map(|_| ())
    }

    async fn delete_logical_switch_port(&self, name: &str) -> Result<(), SdnError> {
        self.run(strings(&["--if-exists", "lsp-del", name])).await.map(|_| ())
    }

    async fn list_nat_rules(&self, router: &str) -> Result<Vec<NatRule>, SdnError> {
        let routers = self
            .find("logical_router", &["nat"], &[format!("name={}", quote(router))])
            .await?;
        let Some(router_row) = routers.first() else {
            return Err(SdnError::NotFound(format!("logical router {}", router)));
        };
        let members = router_row.set("nat");
        let rows = self
            .find("nat", &["_uuid", "type", "external_ip", "logical_ip", "external_ids"], &[])
            .await?;
        Ok(rows
            .iter()
            .filter(|row| members.contains(&row.string("_uuid")))
            .filter_map(|row| {
                Some(NatRule {
                    router: router.to_string(),
                    nat_type: parse_nat_type(&row.string("type"))?,
                    external_ip: row.string("external_ip"),
                    logical_ip: row.string("logical_ip"),
                    external_ids: row.map("external_ids"),
                })
            })
            .collect())
    }

    async fn add_nat_rule(&self, rule: &NatRule) -> Result<(), SdnError> {
        let args = strings(&[
            "--may-exist",
            "lr-nat-add",
            &rule.router,
            &rule.nat_type.to_string(),
            &rule.external_ip,
            &rule.logical_ip,
        ]);
        self.run(args).await.map(|_| ())
    }

    async fn delete_nat_rule(&self, router: &str, nat_type: NatType, logical_ip: &str) -> Result<(), SdnError> {
        let args = strings(&["--if-exists", "lr-nat-del", router, &nat_type.to_string(), logical_ip]);
        self.run(args).await.map(|_| ())
    }

    async fn list_load_balancers(&self) -> Result<Vec<LoadBalancer>, SdnError> {
        let rows = self
            .find("load_balancer", &["name", "protocol", "vips"], &[])
            .await?;
        Ok(rows
            .iter()
            .map(|row| LoadBalancer {
                name: row.string("name"),
                protocol: parse_protocol(&row.string("protocol")),
                vips: row
                    .map("vips")
                    .into_iter()
                    .map(|(vip, backends)| {
                        let backends = backends
                            .split(',')
                            .filter(|b| !b.is_empty())
                            .map(str::to_string)
                            .collect();
                        (vip, backends)
                    })
                    .collect(),
            })
            .collect())
    }

    async fn create_load_balancer(&self, name: &str, protocol: LbProtocol) -> Result<(), SdnError> {
        let existing = self
            .find("load_balancer", &["name"], &[format!("name={}", quote(name))])
            .await?;
        if !existing.is_empty() {
            return Ok(());
        }
        let args = vec![
            "create".to_string(),
            "load_balancer".to_string(),
            format!("name={}", quote(name)),
            format!("protocol={}", protocol),
        ];
        self.run(args).await.map(|_| ())
    }

    async fn set_load_balancer_vip(&self, name: &str, vip: &str, backends: &[String]) -> Result<(), SdnError> {
        let args = vec![
            "set".to_string(),
            "load_balancer".to_string(),
            name.to_string(),
            format!("vips:{}={}", quote(vip), quote(&backends.join(","))),
        ];
        self.run(args).await.map(|_| ())
    }

    async fn delete_load_balancer_vip(&self, name: &str, vip: &str) -> Result<(), SdnError> {
        self.run(strings(&["--if-exists", "lb-del", name, vip])).await.map(|_| ())
    }

    async fn list_port_groups(&self) -> Result<Vec<PortGroup>, SdnError> {
        let groups = self
            .find("port_group", &["name", "ports", "acls", "external_ids"], &[])
            .await?;
        let port_names: HashMap<String, String> = self
            .find("logical_switch_port", &["_uuid", "name"], &[])
            .await?
            .iter()
            .map(|row| (row.string("_uuid"), row.string("name")))
            .collect();
        let acls: HashMap<String, Acl> = self
            .find("acl", &["_uuid", "direction", "priority", "match", "action"], &[])
            .await?
            .iter()
            .filter_map(|row| {
                let acl = Acl {
                    direction: parse_direction(&row.string("direction"))?,
                    priority: u16::try_from(row.int("priority")?).ok()?,
                    match_expr: row.string("match"),
                    action: parse_action(&row.string("action"))?,
                };
                Some((row.string("_uuid"), acl))
            })
            .collect();

        Ok(groups
            .iter()
            .map(|row| PortGroup {
                name: row.string("name"),
                ports: row
                    .set("ports")
                    .iter()
                    .filter_map(|uuid| port_names.get(uuid).cloned())
                    .collect(),
                acls: row
                    .set("acls")
                    .iter()
                    .filter_map(|uuid| acls.get(uuid).cloned())
                    .collect(),
                external_ids: row.map("external_ids"),
            })
            .collect())
    }

    async fn apply_port_group(&self, group: &PortGroup) -> Result<(), SdnError> {
        self.run(apply_port_group_args(group)).await.map(|_| ())
    }

    async fn delete_port_group(&self, name: &str) -> Result<(), SdnError> {
        self.run(strings(&["--if-exists", "destroy", "port_group", name]))
            .await
            .map(|_| ())
    }
}
