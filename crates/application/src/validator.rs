//! 命令参数校验。
//!
//! 命令词汇表是封闭的，每个命令对应一个固定的参数模式
//! （类型序列与参数个数上下限）。校验先于任何钩子执行。

use domain::ChatError;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    Str,
    Bool,
    UInt,
    Object,
    Array,
    Any,
}

impl ArgType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::Str => value.is_string(),
            Self::Bool => value.is_boolean(),
            Self::UInt => value.is_u64(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    pub args: &'static [ArgType],
    pub min_arity: usize,
}

const fn spec(name: &'static str, args: &'static [ArgType]) -> CommandSpec {
    CommandSpec {
        name,
        args,
        min_arity: args.len(),
    }
}

use ArgType::{Any, Array, Bool, Object, Str, UInt};

/// 全部客户端命令的参数模式。
pub static COMMANDS: &[CommandSpec] = &[
    spec("directAddToList", &[Str, Array]),
    spec("directGetAccessList", &[Str]),
    spec("directGetWhitelistMode", &[]),
    spec("directMessage", &[Str, Object]),
    spec("directRemoveFromList", &[Str, Array]),
    spec("directSetWhitelistMode", &[Bool]),
    spec("listJoinedSockets", &[]),
    spec("listRooms", &[]),
    spec("roomAddToList", &[Str, Str, Array]),
    spec("roomCreate", &[Str, Bool]),
    spec("roomDelete", &[Str]),
    spec("roomGetAccessList", &[Str, Str]),
    spec("roomGetOwner", &[Str]),
    spec("roomGetWhitelistMode", &[Str]),
    spec("roomHistoryGet", &[Str, UInt, UInt]),
    spec("roomHistoryInfo", &[Str]),
    spec("roomJoin", &[Str]),
    spec("roomLeave", &[Str]),
    spec("roomMessage", &[Str, Object]),
    spec("roomRecentHistory", &[Str]),
    spec("roomRemoveFromList", &[Str, Str, Array]),
    spec("roomSetWhitelistMode", &[Str, Bool]),
    spec("roomUserSeen", &[Str, Str]),
    spec("systemMessage", &[Any]),
];

pub fn command_spec(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|spec| spec.name == name)
}

/// 校验参数个数与类型；位置从 1 开始计。
pub fn validate(name: &str, args: &[Value]) -> Result<&'static CommandSpec, ChatError> {
    let spec = command_spec(name).ok_or_else(|| ChatError::no_command(name))?;
    if args.len() < spec.min_arity || args.len() > spec.args.len() {
        return Err(ChatError::WrongArgumentsCount {
            command: name.to_owned(),
            min: spec.min_arity,
            max: spec.args.len(),
            actual: args.len(),
        });
    }
    for (position, (value, expected)) in args.iter().zip(spec.args).enumerate() {
        if !expected.matches(value) {
            return Err(ChatError::bad_argument(name, position + 1));
        }
    }
    Ok(spec)
}
