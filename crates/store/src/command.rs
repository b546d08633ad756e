use tracing::debug;

use crate::stream::Record;
use crate::{Entry, Role, StoreError, StoreState, Stream, StreamId, Value};

/// Static metadata for one store command.
#[derive(Debug)]
pub struct CommandSpec {
    pub name: &'static str,
    /// Minimum number of arguments after the command name.
    pub min_args: usize,
    pub write: bool,
    /// Argument positions holding keys, checked against ACL key patterns.
    pub keys: &'static [usize],
}

const COMMANDS: &[CommandSpec] = &[
    CommandSpec { name: "ping", min_args: 0, write: false, keys: &[] },
    CommandSpec { name: "get", min_args: 1, write: false, keys: &[0] },
    CommandSpec { name: "set", min_args: 2, write: true, keys: &[0] },
    CommandSpec { name: "del", min_args: 1, write: true, keys: &[0] },
    CommandSpec { name: "exists", min_args: 1, write: false, keys: &[0] },
    CommandSpec { name: "incr", min_args: 1, write: true, keys: &[0] },
    CommandSpec { name: "xadd", min_args: 4, write: true, keys: &[0] },
    CommandSpec { name: "xlen", min_args: 1, write: false, keys: &[0] },
    CommandSpec { name: "xrange", min_args: 3, write: false, keys: &[0] },
    CommandSpec { name: "config", min_args: 2, write: false, keys: &[] },
    CommandSpec { name: "acl", min_args: 2, write: false, keys: &[] },
    CommandSpec { name: "replicaof", min_args: 2, write: false, keys: &[] },
];

/// Look up a command by name, case-insensitively.
#[must_use]
pub fn command_spec(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS
        .iter()
        .find(|spec| spec.name.eq_ignore_ascii_case(name))
}

impl StoreState {
    /// Execute one structured command against the state.
    ///
    /// Mutating commands queue [`crate::StoreEvent`]s for the caller to
    /// drain. ACL, role, and memory enforcement are the caller's concern;
    /// this is the raw dispatch used both for client traffic and for
    /// applying a replication feed.
    ///
    /// # Errors
    /// Returns an error for unknown commands, bad arity, or type
    /// mismatches.
    pub fn execute(&mut self, cmd: &str, args: &[String]) -> Result<Value, StoreError> {
        let spec = command_spec(cmd).ok_or_else(|| StoreError::UnknownCommand(cmd.to_owned()))?;
        if args.len() < spec.min_args {
            return Err(StoreError::WrongArity(spec.name.to_owned()));
        }
        match spec.name {
            "ping" => Ok(Value::str("PONG")),
            "get" => self.get(&args[0]),
            "set" => self.set(&args[0], &args[1]),
            "del" => self.del(args),
            "exists" => Ok(Value::Int(i64::from(self.keys.contains_key(&args[0])))),
            "incr" => self.incr(&args[0]),
            "xadd" => self.xadd(&args[0], &args[1], &args[2..]),
            "xlen" => self.xlen(&args[0]),
            "xrange" => self.xrange(&args[0], &args[1], &args[2]),
            "config" => self.config(&args[0], &args[1..]),
            "acl" => self.acl_command(&args[0], &args[1..]),
            "replicaof" => self.replicaof(&args[0], &args[1]),
            _ => unreachable!("command in table without dispatch arm"),
        }
    }

    fn get(&self, key: &str) -> Result<Value, StoreError> {
        match self.keys.get(key) {
            None => Ok(Value::Null),
            Some(Entry::String(s)) => Ok(Value::str(s.clone())),
            Some(Entry::Stream(_)) => Err(StoreError::WrongType),
        }
    }

    fn set(&mut self, key: &str, value: &str) -> Result<Value, StoreError> {
        self.keys
            .insert(key.to_owned(), Entry::String(value.to_owned()));
        self.push_key_event("set", key);
        Ok(Value::ok())
    }

    fn del(&mut self, keys: &[String]) -> Result<Value, StoreError> {
        let mut removed = 0;
        for key in keys {
            if self.keys.remove(key).is_some() {
                removed += 1;
                self.push_key_event("del", key);
            }
        }
        Ok(Value::Int(removed))
    }

    fn incr(&mut self, key: &str) -> Result<Value, StoreError> {
        let current = match self.keys.get(key) {
            None => 0,
            Some(Entry::String(s)) => s.parse::<i64>().map_err(|_| StoreError::NotAnInteger)?,
            Some(Entry::Stream(_)) => return Err(StoreError::WrongType),
        };
        let next = current
            .checked_add(1)
            .ok_or(StoreError::NotAnInteger)?;
        self.keys
            .insert(key.to_owned(), Entry::String(next.to_string()));
        self.push_key_event("incr", key);
        Ok(Value::Int(next))
    }

    fn xadd(&mut self, key: &str, id: &str, fields: &[String]) -> Result<Value, StoreError> {
        if fields.len() % 2 != 0 {
            return Err(StoreError::WrongArity("xadd".to_owned()));
        }
        let record: Record = fields
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();
        let entry = self
            .keys
            .entry(key.to_owned())
            .or_insert_with(|| Entry::Stream(Stream::default()));
        let Entry::Stream(stream) = entry else {
            return Err(StoreError::WrongType);
        };
        let added = if id == "*" {
            stream.add_auto(record)
        } else {
            let id: StreamId = id.parse()?;
            stream.add(id, record)?;
            id
        };
        self.push_key_event("xadd", key);
        Ok(Value::str(added.to_string()))
    }

    fn xlen(&self, key: &str) -> Result<Value, StoreError> {
        match self.keys.get(key) {
            None => Ok(Value::Int(0)),
            Some(Entry::Stream(stream)) => {
                Ok(Value::Int(i64::try_from(stream.len()).unwrap_or(i64::MAX)))
            }
            Some(Entry::String(_)) => Err(StoreError::WrongType),
        }
    }

    fn xrange(&self, key: &str, start: &str, end: &str) -> Result<Value, StoreError> {
        let Some(stream) = self.stream(key) else {
            return Ok(Value::Array(Vec::new()));
        };
        let start = if start == "-" {
            StreamId::ZERO
        } else {
            start.parse()?
        };
        let end = if end == "+" {
            StreamId { ms: u64::MAX, seq: u64::MAX }
        } else {
            end.parse()?
        };
        let items = stream
            .iter()
            .filter(|(id, _)| *id >= start && *id <= end)
            .map(|(id, record)| {
                let fields = record
                    .iter()
                    .flat_map(|(f, v)| [Value::str(f.clone()), Value::str(v.clone())])
                    .collect();
                Value::Array(vec![Value::str(id.to_string()), Value::Array(fields)])
            })
            .collect();
        Ok(Value::Array(items))
    }

    fn config(&mut self, action: &str, args: &[String]) -> Result<Value, StoreError> {
        if action.eq_ignore_ascii_case("set") {
            let [name, value] = args else {
                return Err(StoreError::WrongArity("config".to_owned()));
            };
            if !name.eq_ignore_ascii_case("maxmemory") {
                return Err(StoreError::UnknownConfig(name.clone()));
            }
            self.maxmemory = value.parse().map_err(|_| StoreError::NotAnInteger)?;
            Ok(Value::ok())
        } else if action.eq_ignore_ascii_case("get") {
            let [name] = args else {
                return Err(StoreError::WrongArity("config".to_owned()));
            };
            if !name.eq_ignore_ascii_case("maxmemory") {
                return Err(StoreError::UnknownConfig(name.clone()));
            }
            Ok(Value::Array(vec![
                Value::str("maxmemory"),
                Value::str(self.maxmemory.to_string()),
            ]))
        } else {
            Err(StoreError::UnknownConfig(action.to_owned()))
        }
    }

    fn acl_command(&mut self, action: &str, args: &[String]) -> Result<Value, StoreError> {
        if action.eq_ignore_ascii_case("setuser") {
            let Some((name, rules)) = args.split_first() else {
                return Err(StoreError::WrongArity("acl".to_owned()));
            };
            self.acl.set_user(name, rules)?;
            Ok(Value::ok())
        } else if action.eq_ignore_ascii_case("deluser") {
            let [name] = args else {
                return Err(StoreError::WrongArity("acl".to_owned()));
            };
            let removed = self.acl.del_user(name)?;
            Ok(Value::Int(i64::from(removed)))
        } else {
            Err(StoreError::UnknownCommand(format!("acl {action}")))
        }
    }

    fn replicaof(&mut self, host: &str, port: &str) -> Result<Value, StoreError> {
        let role = if host.eq_ignore_ascii_case("no") && port.eq_ignore_ascii_case("one") {
            Role::Primary
        } else {
            Role::Replica
        };
        if role != self.role {
            debug!(?role, "replication role changed");
            self.role = role;
            self.events.push(crate::StoreEvent::RoleChanged(role));
        }
        Ok(Value::ok())
    }
}
