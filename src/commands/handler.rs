//! Command dispatch.
//!
//! A request is the decoded argument list of one frame: the command name
//! followed by its arguments. [`CommandHandler::execute`] validates arity,
//! calls the matching [`StorageEngine`] operation and shapes the result into
//! the reply a Redis client expects.
//!
//! | Command                | Arity | Reply                                  |
//! |------------------------|-------|----------------------------------------|
//! | `PING [message]`       | 0..=1 | `+PONG`, or the message as a bulk      |
//! | `GET key`              | 1     | bulk, or null if absent                |
//! | `SET key value`        | 2     | `+OK`                                  |
//! | `GETSET key value`     | 2     | previous value as bulk, or null        |
//! | `SETNX key value`      | 2     | `:1` if stored, `:0` if the key exists |
//! | `SETEX key secs value` | 3     | `+OK`                                  |
//! | `PSETEX key ms value`  | 3     | `+OK`                                  |
//! | `APPEND key value`     | 2     | new length                             |
//! | `MSET key value ...`   | 2n    | `+OK`                                  |
//! | `MSETNX key value ...` | 2n    | `:1` if all stored, `:0` if none       |
//! | `MGET key [key ...]`   | 1..   | array of bulks and nulls               |
//! | `DEL key [key ...]`    | 1..   | number of keys removed                 |
//! | `EXISTS key [key ...]` | 1..   | number of keys present                 |
//! | `TYPE key`             | 1     | `+string` or `+none`                   |
//! | `INCR` / `DECR key`    | 1     | new value                              |
//! | `INCRBY` / `DECRBY`    | 2     | new value                              |
//! | `EXPIRE key seconds`   | 2     | `:1` if the key exists, else `:0`      |
//! | `PEXPIRE key millis`   | 2     | as EXPIRE                              |
//! | `TTL` / `PTTL key`     | 1     | remaining time, `-1` no expiry, `-2` absent |
//! | `DBSIZE`               | 0     | number of keys                         |
//! | `INFO [section]`       | 0..=1 | `# Section` blocks of `field:value`    |
//! | `QUIT`                 | any   | `+OK`; the connection then closes      |
//!
//! Every failure is an error reply; nothing here can fail the connection.

use crate::protocol::RespValue;
use crate::storage::{parse_i64, StorageEngine, StorageError};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Longest argument excerpt echoed back in an unknown-command error.
const MAX_ECHOED_ARG_LEN: usize = 128;

const NOT_AN_INTEGER: &str = "ERR value is not an integer or out of range";

/// Unit of a timeout argument or a reported time to live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeUnit {
    Seconds,
    Millis,
}

impl TimeUnit {
    fn duration(self, amount: u64) -> Duration {
        match self {
            TimeUnit::Seconds => Duration::from_secs(amount),
            TimeUnit::Millis => Duration::from_millis(amount),
        }
    }

    /// Largest amount whose value in milliseconds fits an `i64`.
    fn max_amount(self) -> i64 {
        match self {
            TimeUnit::Seconds => i64::MAX / 1000,
            TimeUnit::Millis => i64::MAX,
        }
    }
}

/// Executes requests against a shared [`StorageEngine`].
///
/// Cheap to clone; every connection gets its own copy.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    storage: Arc<StorageEngine>,
}

impl CommandHandler {
    pub fn new(storage: Arc<StorageEngine>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.storage
    }

    /// Runs one request and returns its reply.
    ///
    /// `request[0]` is the command name, matched case-insensitively.
    pub fn execute(&self, request: &[Bytes]) -> RespValue {
        let Some((name, args)) = request.split_first() else {
            return RespValue::error("ERR empty command");
        };

        match name.to_ascii_uppercase().as_slice() {
            b"PING" => self.cmd_ping(args),
            b"GET" => self.cmd_get(args),
            b"SET" => self.cmd_set(args),
            b"GETSET" => self.cmd_getset(args),
            b"SETNX" => self.cmd_setnx(args),
            b"SETEX" => self.cmd_setex(args, "setex", TimeUnit::Seconds),
            b"PSETEX" => self.cmd_setex(args, "psetex", TimeUnit::Millis),
            b"APPEND" => self.cmd_append(args),
            b"MSET" => self.cmd_mset(args),
            b"MSETNX" => self.cmd_msetnx(args),
            b"MGET" => self.cmd_mget(args),
            b"DEL" => self.cmd_del(args),
            b"EXISTS" => self.cmd_exists(args),
            b"TYPE" => self.cmd_type(args),
            b"INCR" => self.cmd_incr_by(args, "incr", Some(1)),
            b"DECR" => self.cmd_incr_by(args, "decr", Some(-1)),
            b"INCRBY" => self.cmd_incr_by(args, "incrby", None),
            b"DECRBY" => self.cmd_decr_by(args),
            b"EXPIRE" => self.cmd_expire(args, "expire", TimeUnit::Seconds),
            b"PEXPIRE" => self.cmd_expire(args, "pexpire", TimeUnit::Millis),
            b"TTL" => self.cmd_ttl(args, "ttl", TimeUnit::Seconds),
            b"PTTL" => self.cmd_ttl(args, "pttl", TimeUnit::Millis),
            b"DBSIZE" => self.cmd_dbsize(args),
            b"INFO" => self.cmd_info(args),
            b"QUIT" => RespValue::ok(),
            _ => unknown_command(name, args),
        }
    }

    // ========================================================================
    // Connection
    // ========================================================================

    /// PING [message]
    fn cmd_ping(&self, args: &[Bytes]) -> RespValue {
        match args {
            [] => RespValue::pong(),
            [message] => RespValue::bulk_string(message.clone()),
            _ => wrong_arity("ping"),
        }
    }

    // ========================================================================
    // Strings
    // ========================================================================

    /// GET key
    fn cmd_get(&self, args: &[Bytes]) -> RespValue {
        let [key] = args else {
            return wrong_arity("get");
        };
        RespValue::from_optional(self.storage.get(key))
    }

    /// SET key value
    fn cmd_set(&self, args: &[Bytes]) -> RespValue {
        match args {
            [key, value] => {
                self.storage.set(key.clone(), value.clone());
                RespValue::ok()
            }
            // Options such as EX/NX are not supported.
            [_, _, ..] => RespValue::error("ERR syntax error"),
            _ => wrong_arity("set"),
        }
    }

    /// GETSET key value
    fn cmd_getset(&self, args: &[Bytes]) -> RespValue {
        let [key, value] = args else {
            return wrong_arity("getset");
        };
        RespValue::from_optional(self.storage.getset(key.clone(), value.clone()))
    }

    /// SETNX key value
    fn cmd_setnx(&self, args: &[Bytes]) -> RespValue {
        let [key, value] = args else {
            return wrong_arity("setnx");
        };
        RespValue::integer(self.storage.set_nx(key.clone(), value.clone()) as i64)
    }

    /// SETEX key seconds value / PSETEX key milliseconds value
    fn cmd_setex(&self, args: &[Bytes], name: &str, unit: TimeUnit) -> RespValue {
        let [key, amount, value] = args else {
            return wrong_arity(name);
        };
        match parse_timeout(amount, name, unit) {
            Ok(Some(ttl)) => {
                self.storage.set_with_ttl(key.clone(), value.clone(), ttl);
                RespValue::ok()
            }
            Ok(None) => invalid_expire_time(name),
            Err(reply) => reply,
        }
    }

    /// APPEND key value
    fn cmd_append(&self, args: &[Bytes]) -> RespValue {
        let [key, value] = args else {
            return wrong_arity("append");
        };
        RespValue::integer(self.storage.append(key, value) as i64)
    }

    /// MSET key value [key value ...]
    fn cmd_mset(&self, args: &[Bytes]) -> RespValue {
        let Some(pairs) = key_value_pairs(args) else {
            return wrong_arity("mset");
        };
        self.storage.mset(&pairs);
        RespValue::ok()
    }

    /// MSETNX key value [key value ...]
    fn cmd_msetnx(&self, args: &[Bytes]) -> RespValue {
        let Some(pairs) = key_value_pairs(args) else {
            return wrong_arity("msetnx");
        };
        RespValue::integer(self.storage.mset_nx(&pairs) as i64)
    }

    /// MGET key [key ...]
    fn cmd_mget(&self, args: &[Bytes]) -> RespValue {
        if args.is_empty() {
            return wrong_arity("mget");
        }
        RespValue::array(
            self.storage
                .mget(args)
                .into_iter()
                .map(RespValue::from_optional)
                .collect(),
        )
    }

    /// INCR, DECR and INCRBY. `fixed` is the delta for the one-argument
    /// forms; `None` reads it from the second argument.
    fn cmd_incr_by(&self, args: &[Bytes], name: &str, fixed: Option<i64>) -> RespValue {
        let (key, delta) = match (args, fixed) {
            ([key], Some(delta)) => (key, delta),
            ([key, delta], None) => match parse_i64(delta) {
                Some(delta) => (key, delta),
                None => return RespValue::error(NOT_AN_INTEGER),
            },
            _ => return wrong_arity(name),
        };
        integer_reply(self.storage.incr_by(key, delta))
    }

    /// DECRBY key decrement
    fn cmd_decr_by(&self, args: &[Bytes]) -> RespValue {
        let [key, delta] = args else {
            return wrong_arity("decrby");
        };
        let Some(delta) = parse_i64(delta) else {
            return RespValue::error(NOT_AN_INTEGER);
        };
        integer_reply(self.storage.decr_by(key, delta))
    }

    // ========================================================================
    // Keyspace
    // ========================================================================

    /// DEL key [key ...]
    fn cmd_del(&self, args: &[Bytes]) -> RespValue {
        if args.is_empty() {
            return wrong_arity("del");
        }
        let removed = args.iter().filter(|key| self.storage.delete(key)).count();
        RespValue::integer(removed as i64)
    }

    /// EXISTS key [key ...]
    ///
    /// A key named twice is counted twice, as in Redis.
    fn cmd_exists(&self, args: &[Bytes]) -> RespValue {
        if args.is_empty() {
            return wrong_arity("exists");
        }
        let present = args.iter().filter(|key| self.storage.exists(key)).count();
        RespValue::integer(present as i64)
    }

    /// TYPE key
    fn cmd_type(&self, args: &[Bytes]) -> RespValue {
        let [key] = args else {
            return wrong_arity("type");
        };
        RespValue::simple_string(self.storage.key_type(key).unwrap_or("none"))
    }

    /// EXPIRE key seconds / PEXPIRE key milliseconds
    ///
    /// A non-positive timeout deletes the key immediately.
    fn cmd_expire(&self, args: &[Bytes], name: &str, unit: TimeUnit) -> RespValue {
        let [key, amount] = args else {
            return wrong_arity(name);
        };
        match parse_timeout(amount, name, unit) {
            Ok(Some(ttl)) => RespValue::integer(self.storage.expire(key, ttl) as i64),
            Ok(None) => RespValue::integer(self.storage.delete(key) as i64),
            Err(reply) => reply,
        }
    }

    /// TTL key / PTTL key
    fn cmd_ttl(&self, args: &[Bytes], name: &str, unit: TimeUnit) -> RespValue {
        let [key] = args else {
            return wrong_arity(name);
        };
        let remaining = match unit {
            TimeUnit::Seconds => self.storage.ttl(key),
            TimeUnit::Millis => self.storage.pttl(key),
        };
        RespValue::integer(remaining.unwrap_or(-2))
    }

    // ========================================================================
    // Server
    // ========================================================================

    /// DBSIZE
    fn cmd_dbsize(&self, args: &[Bytes]) -> RespValue {
        if !args.is_empty() {
            return wrong_arity("dbsize");
        }
        RespValue::integer(self.storage.len() as i64)
    }

    /// INFO [section]
    ///
    /// Sections are `server`, `stats` and `keyspace`; `all`, `default` or no
    /// argument selects every one. An unknown section yields an empty reply.
    fn cmd_info(&self, args: &[Bytes]) -> RespValue {
        let section = match args {
            [] => None,
            [section] => Some(section.to_ascii_lowercase()),
            _ => return RespValue::error("ERR syntax error"),
        };
        let everything = matches!(section.as_deref(), None | Some(b"all" | b"default"));

        let stats = self.storage.stats();
        let keyspace = if stats.keys > 0 {
            format!("db0:keys={}\r\n", stats.keys)
        } else {
            String::new()
        };
        let sections = [
            (
                "Server",
                format!(
                    "pocketkv_version:{}\r\nos:{}\r\narch:{}\r\n",
                    crate::VERSION,
                    std::env::consts::OS,
                    std::env::consts::ARCH,
                ),
            ),
            (
                "Stats",
                format!(
                    "get_ops:{}\r\nset_ops:{}\r\ndel_ops:{}\r\nexpired_keys:{}\r\n",
                    stats.get_ops, stats.set_ops, stats.del_ops, stats.expired,
                ),
            ),
            ("Keyspace", keyspace),
        ];

        let mut info = String::new();
        for (title, body) in sections {
            let wanted = everything
                || section.as_deref() == Some(title.to_ascii_lowercase().as_bytes());
            if !wanted {
                continue;
            }
            if !info.is_empty() {
                info.push_str("\r\n");
            }
            info.push_str("# ");
            info.push_str(title);
            info.push_str("\r\n");
            info.push_str(&body);
        }
        RespValue::bulk_string(info)
    }
}

/// Whether `request` asks the server to close the connection.
pub fn is_quit(request: &[Bytes]) -> bool {
    request
        .first()
        .is_some_and(|name| name.eq_ignore_ascii_case(b"QUIT"))
}

/// Parses a timeout argument. `Ok(None)` means it was zero or negative.
fn parse_timeout(arg: &[u8], name: &str, unit: TimeUnit) -> Result<Option<Duration>, RespValue> {
    let amount = parse_i64(arg).ok_or_else(|| RespValue::error(NOT_AN_INTEGER))?;
    if amount <= 0 {
        return Ok(None);
    }
    if amount > unit.max_amount() {
        return Err(invalid_expire_time(name));
    }
    Ok(Some(unit.duration(amount as u64)))
}

/// Splits `key value [key value ...]`. `None` for an empty or odd list.
fn key_value_pairs(args: &[Bytes]) -> Option<Vec<(Bytes, Bytes)>> {
    if args.is_empty() || args.len() % 2 != 0 {
        return None;
    }
    Some(
        args.chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect(),
    )
}

fn invalid_expire_time(name: &str) -> RespValue {
    RespValue::error(format!("ERR invalid expire time in '{}' command", name))
}

fn integer_reply(result: Result<i64, StorageError>) -> RespValue {
    match result {
        Ok(n) => RespValue::integer(n),
        Err(e) => RespValue::error(format!("ERR {}", e)),
    }
}

fn wrong_arity(name: &str) -> RespValue {
    RespValue::error(format!(
        "ERR wrong number of arguments for '{}' command",
        name
    ))
}

fn unknown_command(name: &[u8], args: &[Bytes]) -> RespValue {
    let name = printable(name);
    debug!(command = %name, "Unknown command");

    let mut message = format!("ERR unknown command '{}', with args beginning with: ", name);
    for arg in args {
        message.push('\'');
        message.push_str(&printable(arg));
        message.push_str("' ");
    }
    RespValue::error(message)
}

/// Lossy, single-line, length-capped rendering of client bytes for error
/// messages. CR and LF would corrupt the reply frame.
fn printable(bytes: &[u8]) -> String {
    let bytes = &bytes[..bytes.len().min(MAX_ECHOED_ARG_LEN)];
    String::from_utf8_lossy(bytes)
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect()
}
