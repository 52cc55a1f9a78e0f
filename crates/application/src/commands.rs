//! 命令管线。
//!
//! 每条命令的统一流程：参数校验 → 前置钩子 → 分发到用户方法 →
//! 后置钩子 → 应答。应答是 `(error, data…)` 回调形状；错误的
//! 序列化形式由服务配置决定。`exec` 入口让服务端代码不经真实
//! 套接字走同一条管线。

use domain::{ChatError, DirectListKind, ListKind, RoomName, SocketId, UserName};
use serde_json::{json, Value};

use crate::hooks::BeforeOutcome;
use crate::user::ChatUser;
use crate::validator;

/// 一次命令执行的调用方上下文。
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub user: UserName,
    pub socket: Option<SocketId>,
    pub bypass_permissions: bool,
    pub is_local_call: bool,
}

/// `exec` 的选项。
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// 以某个套接字的身份执行（套接字必须已注册）。
    pub id: Option<SocketId>,
    /// 没有套接字时，以该用户身份执行。
    pub user_name: Option<UserName>,
    pub bypass_permissions: bool,
    pub is_local_call: bool,
}

/// 统一管线：校验 → 前置钩子 → 分发 → 后置钩子。
pub async fn run_command(
    user: &ChatUser,
    ctx: &CommandContext,
    name: &str,
    args: Vec<Value>,
) -> Result<Vec<Value>, ChatError> {
    validator::validate(name, &args)?;

    let args = match user.hooks().before(name) {
        Some(hook) => match hook(ctx.clone(), args).await? {
            BeforeOutcome::Proceed(rewritten) => {
                // 改写后的参数仍须满足同一模式
                validator::validate(name, &rewritten)?;
                rewritten
            }
            BeforeOutcome::Complete(results) => return Ok(results),
        },
        None => args,
    };

    let results = dispatch(user, ctx, name, &args).await?;

    match user.hooks().after(name) {
        Some(hook) => hook(ctx.clone(), args, results).await,
        None => Ok(results),
    }
}

fn str_arg<'a>(name: &str, args: &'a [Value], i: usize) -> Result<&'a str, ChatError> {
    args.get(i)
        .and_then(Value::as_str)
        .ok_or_else(|| ChatError::bad_argument(name, i + 1))
}

fn bool_arg(name: &str, args: &[Value], i: usize) -> Result<bool, ChatError> {
    args.get(i)
        .and_then(Value::as_bool)
        .ok_or_else(|| ChatError::bad_argument(name, i + 1))
}

fn u64_arg(name: &str, args: &[Value], i: usize) -> Result<u64, ChatError> {
    args.get(i)
        .and_then(Value::as_u64)
        .ok_or_else(|| ChatError::bad_argument(name, i + 1))
}

fn room_arg(name: &str, args: &[Value], i: usize) -> Result<RoomName, ChatError> {
    RoomName::parse(str_arg(name, args, i)?)
}

fn user_arg(name: &str, args: &[Value], i: usize) -> Result<UserName, ChatError> {
    UserName::parse(str_arg(name, args, i)?)
}

// 名单值参数：字符串数组，每个元素都必须是合法用户名。
fn names_arg(name: &str, args: &[Value], i: usize) -> Result<Vec<UserName>, ChatError> {
    let values = args
        .get(i)
        .and_then(Value::as_array)
        .ok_or_else(|| ChatError::bad_argument(name, i + 1))?;
    values
        .iter()
        .map(|value| {
            value
                .as_str()
                .ok_or_else(|| ChatError::bad_argument(name, i + 1))
                .and_then(UserName::parse)
        })
        .collect()
}

async fn dispatch(
    user: &ChatUser,
    ctx: &CommandContext,
    name: &str,
    args: &[Value],
) -> Result<Vec<Value>, ChatError> {
    match name {
        "directAddToList" => {
            let kind = DirectListKind::parse(str_arg(name, args, 0)?)?;
            let names = names_arg(name, args, 1)?;
            user.direct_add_to_list(kind, names).await?;
            Ok(vec![])
        }
        "directGetAccessList" => {
            let kind = DirectListKind::parse(str_arg(name, args, 0)?)?;
            let list = user.direct_get_access_list(kind).await?;
            Ok(vec![json!(list)])
        }
        "directGetWhitelistMode" => {
            let mode = user.direct_get_whitelist_mode().await?;
            Ok(vec![json!(mode)])
        }
        "directMessage" => {
            let to = user_arg(name, args, 0)?;
            let message = user.direct_message(ctx, to, &args[1]).await?;
            Ok(vec![json!(message)])
        }
        "directRemoveFromList" => {
            let kind = DirectListKind::parse(str_arg(name, args, 0)?)?;
            let names = names_arg(name, args, 1)?;
            user.direct_remove_from_list(kind, names).await?;
            Ok(vec![])
        }
        "directSetWhitelistMode" => {
            user.direct_set_whitelist_mode(bool_arg(name, args, 0)?)
                .await?;
            Ok(vec![])
        }
        "listJoinedSockets" => {
            let sockets = user.list_joined_sockets().await?;
            Ok(vec![json!(sockets)])
        }
        "listRooms" => {
            let rooms = user.list_rooms().await?;
            Ok(vec![json!(rooms)])
        }
        "roomAddToList" => {
            let room = room_arg(name, args, 0)?;
            let kind = ListKind::parse(str_arg(name, args, 1)?)?;
            let names = names_arg(name, args, 2)?;
            user.room_add_to_list(ctx, room, kind, names).await?;
            Ok(vec![])
        }
        "roomCreate" => {
            let room = room_arg(name, args, 0)?;
            user.room_create(ctx, room, bool_arg(name, args, 1)?).await?;
            Ok(vec![])
        }
        "roomDelete" => {
            let room = room_arg(name, args, 0)?;
            user.room_delete(ctx, room).await?;
            Ok(vec![])
        }
        "roomGetAccessList" => {
            let room = room_arg(name, args, 0)?;
            let kind = ListKind::parse(str_arg(name, args, 1)?)?;
            let list = user.room_get_access_list(ctx, room, kind).await?;
            Ok(vec![json!(list)])
        }
        "roomGetOwner" => {
            let room = room_arg(name, args, 0)?;
            let owner = user.room_get_owner(ctx, room).await?;
            Ok(vec![json!(owner)])
        }
        "roomGetWhitelistMode" => {
            let room = room_arg(name, args, 0)?;
            let mode = user.room_get_whitelist_mode(ctx, room).await?;
            Ok(vec![json!(mode)])
        }
        "roomHistoryGet" => {
            let room = room_arg(name, args, 0)?;
            let from_id = u64_arg(name, args, 1)?;
            let limit = u64_arg(name, args, 2)? as usize;
            let messages = user.room_history_get(ctx, room, from_id, limit).await?;
            Ok(vec![json!(messages)])
        }
        "roomHistoryInfo" => {
            let room = room_arg(name, args, 0)?;
            let info = user.room_history_info(ctx, room).await?;
            Ok(vec![json!(info)])
        }
        "roomJoin" => {
            let room = room_arg(name, args, 0)?;
            let njoined = user.room_join(ctx, room).await?;
            Ok(vec![json!(njoined)])
        }
        "roomLeave" => {
            let room = room_arg(name, args, 0)?;
            let njoined = user.room_leave(ctx, room).await?;
            Ok(vec![json!(njoined)])
        }
        "roomMessage" => {
            let room = room_arg(name, args, 0)?;
            let id = user.room_message(ctx, room, &args[1]).await?;
            Ok(vec![json!({ "id": id })])
        }
        "roomRecentHistory" => {
            let room = room_arg(name, args, 0)?;
            let messages = user.room_recent_history(ctx, room).await?;
            Ok(vec![json!(messages)])
        }
        "roomRemoveFromList" => {
            let room = room_arg(name, args, 0)?;
            let kind = ListKind::parse(str_arg(name, args, 1)?)?;
            let names = names_arg(name, args, 2)?;
            user.room_remove_from_list(ctx, room, kind, names).await?;
            Ok(vec![])
        }
        "roomSetWhitelistMode" => {
            let room = room_arg(name, args, 0)?;
            let mode = bool_arg(name, args, 1)?;
            user.room_set_whitelist_mode(ctx, room, mode).await?;
            Ok(vec![])
        }
        "roomUserSeen" => {
            let room = room_arg(name, args, 0)?;
            let target = user_arg(name, args, 1)?;
            let seen = user.room_user_seen(ctx, room, target).await?;
            Ok(vec![json!(seen)])
        }
        "systemMessage" => {
            user.system_message(ctx, args[0].clone()).await?;
            Ok(vec![])
        }
        other => Err(ChatError::no_command(other)),
    }
}
