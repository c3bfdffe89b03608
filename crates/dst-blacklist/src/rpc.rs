//! Operator commands
//!
//! Each command takes positional JSON parameters and answers with a JSON
//! value. Failures map to a [`RpcFault`] carrying the numeric code the
//! transport reports back to the operator.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::blacklist::DstBlacklist;
use crate::error::{BlacklistError, Result};
use crate::types::{BlacklistFlags, Destination, Protocol};

/// Name accepted by `dst_blacklist.stats_get` to read every counter
pub const ALL_STATS: &str = "all";

/// Operator commands exposed by the blacklist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcMethod {
    MemInfo,
    Debug,
    View,
    HashStats,
    DeleteAll,
    Add,
    StatsGet,
}

impl RpcMethod {
    pub const ALL: [RpcMethod; 7] = [
        RpcMethod::MemInfo,
        RpcMethod::Debug,
        RpcMethod::View,
        RpcMethod::HashStats,
        RpcMethod::DeleteAll,
        RpcMethod::Add,
        RpcMethod::StatsGet,
    ];

    pub fn name(self) -> &'static str {
        match self {
            RpcMethod::MemInfo => "dst_blacklist.mem_info",
            RpcMethod::Debug => "dst_blacklist.debug",
            RpcMethod::View => "dst_blacklist.view",
            RpcMethod::HashStats => "dst_blacklist.hash_stats",
            RpcMethod::DeleteAll => "dst_blacklist.delete_all",
            RpcMethod::Add => "dst_blacklist.add",
            RpcMethod::StatsGet => "dst_blacklist.stats_get",
        }
    }

    pub fn doc(self) -> &'static str {
        match self {
            RpcMethod::MemInfo => "dst blacklist memory usage info.",
            RpcMethod::Debug => "dst blacklist debug info.",
            RpcMethod::View => "dst blacklist dump in human-readable format.",
            RpcMethod::HashStats => "dst blacklist entries per hash bucket.",
            RpcMethod::DeleteAll => {
                "Deletes all the entries from the dst blacklist except the permanent ones."
            }
            RpcMethod::Add => "Adds a new entry to the dst blacklist.",
            RpcMethod::StatsGet => "returns the dst blacklist measurement counters.",
        }
    }
}

impl FromStr for RpcMethod {
    type Err = BlacklistError;

    fn from_str(name: &str) -> Result<Self> {
        RpcMethod::ALL
            .into_iter()
            .find(|method| method.name() == name)
            .ok_or_else(|| BlacklistError::UnknownMethod(name.to_string()))
    }
}

impl fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Failure reported to the operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RpcFault {
    pub code: u16,
    pub message: String,
}

impl From<BlacklistError> for RpcFault {
    fn from(err: BlacklistError) -> Self {
        Self {
            code: err.fault_code(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for RpcFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

/// Dispatcher for the `dst_blacklist.*` commands
#[derive(Debug, Clone)]
pub struct BlacklistRpc {
    blacklist: DstBlacklist,
}

impl BlacklistRpc {
    pub fn new(blacklist: DstBlacklist) -> Self {
        Self { blacklist }
    }

    /// Name and help text of every command
    pub fn list_methods() -> Vec<(&'static str, &'static str)> {
        RpcMethod::ALL
            .into_iter()
            .map(|method| (method.name(), method.doc()))
            .collect()
    }

    /// Run `method` and turn any error into a fault
    pub fn handle(&self, method: &str, params: &Value) -> std::result::Result<Value, RpcFault> {
        self.call(method, params).map_err(RpcFault::from)
    }

    pub fn call(&self, method: &str, params: &Value) -> Result<Value> {
        let method: RpcMethod = method.parse()?;
        if !self.blacklist.is_enabled() {
            return Err(BlacklistError::Disabled);
        }
        debug!("rpc {} {}", method, params);

        match method {
            RpcMethod::MemInfo => to_json(self.blacklist.stats()),
            RpcMethod::Debug => to_json(self.blacklist.dump()),
            RpcMethod::View => Ok(Value::Array(
                self.blacklist
                    .view()
                    .into_iter()
                    .map(|entry| {
                        Value::String(format!(
                            "{{\n    protocol: {}\n    ip: {}\n    port: {}\n    expires in (s): {}\n    flags: {}\n}}",
                            entry.protocol, entry.address, entry.port, entry.expires_in, entry.flags
                        ))
                    })
                    .collect(),
            )),
            RpcMethod::HashStats => to_json(self.blacklist.hash_stats()),
            RpcMethod::DeleteAll => Ok(json!(self.blacklist.flush())),
            RpcMethod::Add => self.add(params),
            RpcMethod::StatsGet => self.stats_get(params),
        }
    }

    fn add(&self, params: &Value) -> Result<Value> {
        let ip = str_param(params, 0, "ip")?;
        let port = int_param(params, 1, "port")?;
        let proto = int_param(params, 2, "proto")?;
        let flags = int_param(params, 3, "flags")?;

        let port = u16::try_from(port)
            .map_err(|_| BlacklistError::InvalidParams(format!("port {} out of range", port)))?;
        let proto = u8::try_from(proto)
            .map_err(|_| BlacklistError::InvalidParams(format!("protocol {} out of range", proto)))?;
        if proto > Protocol::Sctp.as_u8() {
            return Err(BlacklistError::UnknownProtocol(proto));
        }
        let protocol = Protocol::from_u8(proto)?;
        let mut flags = u8::try_from(flags)
            .map(BlacklistFlags::from_bits)
            .map_err(|_| BlacklistError::InvalidParams(format!("flags {} out of range", flags)))?;

        let addr = parse_address(ip, &mut flags)?;
        let dest = Destination::new(protocol, addr, port);
        let outcome = self.blacklist.operator_add(&dest, flags)?;
        to_json(outcome)
    }

    fn stats_get(&self, params: &Value) -> Result<Value> {
        let name = str_param(params, 0, "name")?;
        let reset = match params.get(1) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(reset)) => *reset,
            Some(value) => value.as_i64().map(|v| v != 0).ok_or_else(|| {
                BlacklistError::InvalidParams(format!("reset must be a number, got {}", value))
            })?,
        };

        if name.eq_ignore_ascii_case(ALL_STATS) {
            to_json(self.blacklist.counters(reset)?)
        } else {
            let value = self.blacklist.counter(name, reset)?;
            let mut reply = serde_json::Map::new();
            reply.insert(name.to_ascii_lowercase(), json!(value));
            Ok(Value::Object(reply))
        }
    }
}

/// Parse an operator supplied address; IPv4 is tried first unless `flags`
/// already carries the IPv6 tag, in which case only IPv6 is accepted
fn parse_address(ip: &str, flags: &mut BlacklistFlags) -> Result<IpAddr> {
    let v6 = |s: &str| {
        let s = s
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or(s);
        s.parse::<Ipv6Addr>().ok()
    };

    let addr = if flags.contains(BlacklistFlags::IS_IPV6) {
        v6(ip).map(IpAddr::V6)
    } else {
        ip.parse::<Ipv4Addr>().ok().map(IpAddr::V4).or_else(|| {
            let addr = v6(ip)?;
            *flags |= BlacklistFlags::IS_IPV6;
            Some(IpAddr::V6(addr))
        })
    };
    addr.ok_or_else(|| BlacklistError::InvalidAddress(ip.to_string()))
}

fn param<'a>(params: &'a Value, index: usize, name: &str) -> Result<&'a Value> {
    params
        .get(index)
        .ok_or_else(|| BlacklistError::InvalidParams(format!("missing parameter {}", name)))
}

fn str_param<'a>(params: &'a Value, index: usize, name: &str) -> Result<&'a str> {
    param(params, index, name)?
        .as_str()
        .ok_or_else(|| BlacklistError::InvalidParams(format!("{} must be a string", name)))
}

fn int_param(params: &Value, index: usize, name: &str) -> Result<i64> {
    param(params, index, name)?
        .as_i64()
        .ok_or_else(|| BlacklistError::InvalidParams(format!("{} must be an integer", name)))
}

fn to_json<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|e| BlacklistError::Config(format!("cannot encode reply: {}", e)))
}
