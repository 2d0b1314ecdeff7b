//! Catalogue of the Lua scripts behind every atomic storage operation.
//!
//! Script sources are embedded at build time. Each one is prefixed with
//! `common.lua`, which holds the status codes and the shared helpers, and
//! compiled once into a [`redis::Script`] that is invoked by SHA with a
//! transparent `SCRIPT LOAD` fallback.

use crate::error::{SmithyError, SmithyResult};
use redis::{Script, Value};
use std::collections::HashMap;
use std::fmt;

macro_rules! lua_script {
    ($file:literal) => {
        concat!(
            include_str!("scripts/common.lua"),
            include_str!(concat!("scripts/", $file))
        )
    };
}

/// Names of the atomic scripts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScriptName {
    Publish,
    PublishScheduled,
    RequeueMessage,
    RequeueImmediate,
    RequeueDelayed,
    CheckQueueRateLimit,
    CreateQueue,
    SubscribeConsumer,
    UnacknowledgeMessage,
    AcknowledgeMessage,
    DeleteMessage,
    CheckoutMessage,
    DeleteConsumerGroup,
    SetQueueRateLimit,
    DeleteQueue,
    ClearQueueRateLimit,
    SetQueueState,
}

impl ScriptName {
    /// Every script of the catalogue
    pub const ALL: [ScriptName; 17] = [
        ScriptName::Publish,
        ScriptName::PublishScheduled,
        ScriptName::RequeueMessage,
        ScriptName::RequeueImmediate,
        ScriptName::RequeueDelayed,
        ScriptName::CheckQueueRateLimit,
        ScriptName::CreateQueue,
        ScriptName::SubscribeConsumer,
        ScriptName::UnacknowledgeMessage,
        ScriptName::AcknowledgeMessage,
        ScriptName::DeleteMessage,
        ScriptName::CheckoutMessage,
        ScriptName::DeleteConsumerGroup,
        ScriptName::SetQueueRateLimit,
        ScriptName::DeleteQueue,
        ScriptName::ClearQueueRateLimit,
        ScriptName::SetQueueState,
    ];

    /// Script name as used in logs and errors
    pub fn as_str(self) -> &'static str {
        match self {
            ScriptName::Publish => "PUBLISH",
            ScriptName::PublishScheduled => "PUBLISH_SCHEDULED",
            ScriptName::RequeueMessage => "REQUEUE_MESSAGE",
            ScriptName::RequeueImmediate => "REQUEUE_IMMEDIATE",
            ScriptName::RequeueDelayed => "REQUEUE_DELAYED",
            ScriptName::CheckQueueRateLimit => "CHECK_QUEUE_RATE_LIMIT",
            ScriptName::CreateQueue => "CREATE_QUEUE",
            ScriptName::SubscribeConsumer => "SUBSCRIBE_CONSUMER",
            ScriptName::UnacknowledgeMessage => "UNACKNOWLEDGE_MESSAGE",
            ScriptName::AcknowledgeMessage => "ACKNOWLEDGE_MESSAGE",
            ScriptName::DeleteMessage => "DELETE_MESSAGE",
            ScriptName::CheckoutMessage => "CHECKOUT_MESSAGE",
            ScriptName::DeleteConsumerGroup => "DELETE_CONSUMER_GROUP",
            ScriptName::SetQueueRateLimit => "SET_QUEUE_RATE_LIMIT",
            ScriptName::DeleteQueue => "DELETE_QUEUE",
            ScriptName::ClearQueueRateLimit => "CLEAR_QUEUE_RATE_LIMIT",
            ScriptName::SetQueueState => "SET_QUEUE_STATE",
        }
    }

    /// Lua source, prelude included
    pub fn source(self) -> &'static str {
        match self {
            ScriptName::Publish => lua_script!("publish.lua"),
            ScriptName::PublishScheduled => lua_script!("publish_scheduled.lua"),
            ScriptName::RequeueMessage => lua_script!("requeue_message.lua"),
            ScriptName::RequeueImmediate => lua_script!("requeue_immediate.lua"),
            ScriptName::RequeueDelayed => lua_script!("requeue_delayed.lua"),
            ScriptName::CheckQueueRateLimit => lua_script!("check_queue_rate_limit.lua"),
            ScriptName::CreateQueue => lua_script!("create_queue.lua"),
            ScriptName::SubscribeConsumer => lua_script!("subscribe_consumer.lua"),
            ScriptName::UnacknowledgeMessage => lua_script!("unacknowledge_message.lua"),
            ScriptName::AcknowledgeMessage => lua_script!("acknowledge_message.lua"),
            ScriptName::DeleteMessage => lua_script!("delete_message.lua"),
            ScriptName::CheckoutMessage => lua_script!("checkout_message.lua"),
            ScriptName::DeleteConsumerGroup => lua_script!("delete_consumer_group.lua"),
            ScriptName::SetQueueRateLimit => lua_script!("set_queue_rate_limit.lua"),
            ScriptName::DeleteQueue => lua_script!("delete_queue.lua"),
            ScriptName::ClearQueueRateLimit => lua_script!("clear_queue_rate_limit.lua"),
            ScriptName::SetQueueState => lua_script!("set_queue_state.lua"),
        }
    }
}

impl fmt::Display for ScriptName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compiled scripts, built once per client
pub struct ScriptRegistry {
    scripts: HashMap<ScriptName, Script>,
}

impl fmt::Debug for ScriptRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptRegistry")
            .field("scripts", &self.scripts.len())
            .finish()
    }
}

impl Default for ScriptRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptRegistry {
    /// Compile the whole catalogue
    pub fn new() -> Self {
        let scripts = ScriptName::ALL
            .iter()
            .map(|name| (*name, Script::new(name.source())))
            .collect();
        Self { scripts }
    }

    /// Compiled script for a name
    pub fn get(&self, name: ScriptName) -> SmithyResult<&Script> {
        self.scripts
            .get(&name)
            .ok_or_else(|| SmithyError::config(format!("script {} is not registered", name)))
    }

    /// SHA1 of a script, as used by EVALSHA
    pub fn hash(&self, name: ScriptName) -> Option<&str> {
        self.scripts.get(&name).map(|s| s.get_hash())
    }
}

/// Keys and arguments of one script invocation.
///
/// `queue` and `target` only serve to fill typed errors when the script
/// returns a symbolic error string.
#[derive(Debug, Clone, Default)]
pub struct ScriptCall {
    pub(crate) keys: Vec<String>,
    pub(crate) args: Vec<String>,
    queue: String,
    target: Option<String>,
}

impl ScriptCall {
    /// Invocation operating on a queue (`name@ns`)
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Default::default()
        }
    }

    /// Name the message or consumer group the call operates on
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Append a key
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.keys.push(key.into());
        self
    }

    /// Append several keys
    pub fn keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Append an argument
    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.args.push(arg.to_string());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.args.extend(args.into_iter().map(|a| a.to_string()));
        self
    }

    /// Subject of an error code: the queue for queue-level errors, the
    /// target for message and consumer group errors
    fn subject_for(&self, code: &str) -> &str {
        let targeted = code.starts_with("MESSAGE_")
            || code == "CONSUMER_GROUP_NOT_FOUND"
            || code == "CONSUMER_GROUP_NOT_EMPTY";
        match (&self.target, targeted) {
            (Some(target), true) => target,
            _ => &self.queue,
        }
    }

    /// Turn a symbolic error reply into a typed error; other replies pass
    /// through untouched
    pub fn check_reply(&self, reply: Value) -> SmithyResult<Value> {
        let code = match &reply {
            Value::BulkString(bytes) => std::str::from_utf8(bytes).ok(),
            Value::SimpleString(s) => Some(s.as_str()),
            _ => None,
        };
        if let Some(code) = code {
            if let Some(err) = SmithyError::from_script_code(code, self.subject_for(code)) {
                return Err(err);
            }
        }
        Ok(reply)
    }
}

/// Read an `"OK"` status reply
pub fn reply_ok(script: ScriptName, reply: &Value) -> SmithyResult<()> {
    match reply {
        Value::Okay => Ok(()),
        Value::SimpleString(s) if s == "OK" => Ok(()),
        Value::BulkString(b) if b.as_slice() == b"OK" => Ok(()),
        other => Err(SmithyError::unexpected_reply(script.as_str(), other)),
    }
}

/// Read an integer reply
pub fn reply_int(script: ScriptName, reply: &Value) -> SmithyResult<i64> {
    match reply {
        Value::Int(n) => Ok(*n),
        other => Err(SmithyError::unexpected_reply(script.as_str(), other)),
    }
}

/// Read a string reply, `None` for nil
pub fn reply_opt_string(script: ScriptName, reply: &Value) -> SmithyResult<Option<String>> {
    match reply {
        Value::Nil => Ok(None),
        Value::BulkString(bytes) => String::from_utf8(bytes.clone())
            .map(Some)
            .map_err(|_| SmithyError::unexpected_reply(script.as_str(), reply)),
        Value::SimpleString(s) => Ok(Some(s.clone())),
        other => Err(SmithyError::unexpected_reply(script.as_str(), other)),
    }
}

/// Read a non-nil string reply
pub fn reply_string(script: ScriptName, reply: &Value) -> SmithyResult<String> {
    reply_opt_string(script, reply)?
        .ok_or_else(|| SmithyError::unexpected_reply(script.as_str(), reply))
}

/// Read an array of strings
pub fn reply_strings(script: ScriptName, reply: &Value) -> SmithyResult<Vec<String>> {
    match reply {
        Value::Array(items) => items.iter().map(|v| reply_string(script, v)).collect(),
        other => Err(SmithyError::unexpected_reply(script.as_str(), other)),
    }
}

/// Read an array of integers
pub fn reply_ints(script: ScriptName, reply: &Value) -> SmithyResult<Vec<i64>> {
    match reply {
        Value::Array(items) => items.iter().map(|v| reply_int(script, v)).collect(),
        other => Err(SmithyError::unexpected_reply(script.as_str(), other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_catalogue_is_complete() {
        let names: HashSet<&str> = ScriptName::ALL.iter().map(|n| n.as_str()).collect();
        assert_eq!(names.len(), 17);

        let registry = ScriptRegistry::new();
        let hashes: HashSet<&str> = ScriptName::ALL
            .iter()
            .map(|n| registry.hash(*n).unwrap())
            .collect();
        assert_eq!(hashes.len(), 17);
    }

    #[test]
    fn test_sources_include_prelude() {
        for name in ScriptName::ALL {
            let source = name.source();
            assert!(source.starts_with("-- Shared helpers"), "{} misses the prelude", name);
            assert!(source.contains("local function pushPending"));
        }
    }

    #[test]
    fn test_error_codes_become_typed_errors() {
        let call = ScriptCall::new("orders@shop").target("m1");

        let err = call
            .check_reply(Value::BulkString(b"MESSAGE_NOT_REQUEUABLE".to_vec()))
            .unwrap_err();
        assert!(matches!(err, SmithyError::MessageNotRequeuable { ref message_id } if message_id == "m1"));

        let err = call
            .check_reply(Value::BulkString(b"QUEUE_NOT_FOUND".to_vec()))
            .unwrap_err();
        assert!(matches!(err, SmithyError::QueueNotFound { ref queue } if queue == "orders@shop"));

        let group_call = ScriptCall::new("orders@shop").target("billing");
        let err = group_call
            .check_reply(Value::BulkString(b"CONSUMER_GROUP_NOT_EMPTY".to_vec()))
            .unwrap_err();
        assert!(matches!(err, SmithyError::ConsumerGroupNotEmpty { ref group } if group == "billing"));
    }

    #[test]
    fn test_regular_replies_pass_through() {
        let call = ScriptCall::new("orders@shop");
        let ok = call.check_reply(Value::BulkString(b"OK".to_vec())).unwrap();
        assert!(reply_ok(ScriptName::CreateQueue, &ok).is_ok());

        let id = call
            .check_reply(Value::BulkString(b"3f1c9c5e-id".to_vec()))
            .unwrap();
        assert_eq!(
            reply_opt_string(ScriptName::CheckoutMessage, &id).unwrap().as_deref(),
            Some("3f1c9c5e-id")
        );
        assert_eq!(
            reply_opt_string(ScriptName::CheckoutMessage, &Value::Nil).unwrap(),
            None
        );
    }

    #[test]
    fn test_unexpected_shapes_are_reported() {
        let err = reply_int(ScriptName::CheckQueueRateLimit, &Value::Nil).unwrap_err();
        assert!(matches!(err, SmithyError::UnexpectedScriptReply { ref script, .. } if script == "CHECK_QUEUE_RATE_LIMIT"));

        let stats = Value::Array(vec![Value::Int(2), Value::Int(1), Value::Int(0)]);
        assert_eq!(reply_ints(ScriptName::DeleteMessage, &stats).unwrap(), vec![2, 1, 0]);
        assert!(reply_ok(ScriptName::CreateQueue, &Value::Int(1)).is_err());
    }

    #[test]
    fn test_call_builder() {
        let call = ScriptCall::new("q@ns")
            .key("a")
            .keys(["b", "c"])
            .arg(1)
            .args(vec!["x", "y"]);
        assert_eq!(call.keys, vec!["a", "b", "c"]);
        assert_eq!(call.args, vec!["1", "x", "y"]);
    }
}
