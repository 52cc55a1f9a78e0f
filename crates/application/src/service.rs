//! 服务门面。
//!
//! 把配置、状态存储、传输层、时钟与钩子装配成一个引擎实例：
//! 消费传输层的连接/命令/断开事件流，监听集群总线，暴露服务端
//! API（addUser / addRoom / removeRoom / disconnectUserSockets /
//! exec），并负责有序关闭。
//!
//! 状态存储与传输层按种类标签从工厂注册表构造（内建 "memory"），
//! 调用方也可以注册自己的种类或直接注入现成实例。

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use config::ChatConfig;
use domain::{
    ChatError, DirectMessaging, HistoryLimits, InstanceId, Room, RoomInit, RoomName, SocketId,
    UserName,
};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::associations::{room_lock, AssociationDeps, LocalUserState, UserAssociations};
use crate::bus::{BusEnvelope, BusPayload};
use crate::clock::{Clock, SystemClock};
use crate::commands::{run_command, CommandContext, ExecOptions};
use crate::events::{ServerEvent, ServerNotice};
use crate::hooks::HookRegistry;
use crate::state::{memory::MemoryStateStore, StateStore};
use crate::transport::{memory::MemoryTransport, CommandAck, Transport, TransportEvent};
use crate::user::ChatUser;

pub type StateFactory = Arc<dyn Fn(&ChatConfig) -> Arc<dyn StateStore> + Send + Sync>;
pub type TransportFactory = Arc<dyn Fn(&ChatConfig) -> Arc<dyn Transport> + Send + Sync>;

/// 引擎的共享内核；各组件经能力结构体取用其中的依赖。
pub struct EngineCore {
    pub(crate) instance: InstanceId,
    pub(crate) config: Arc<ChatConfig>,
    pub(crate) state: Arc<dyn StateStore>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) hooks: Arc<HookRegistry>,
    pub(crate) notices: broadcast::Sender<ServerNotice>,
    locals: RwLock<HashMap<UserName, Arc<LocalUserState>>>,
}

impl EngineCore {
    pub(crate) fn history_limits(&self) -> HistoryLimits {
        HistoryLimits {
            max_messages: self.config.history_max_messages,
            max_get_messages: self.config.history_max_get_messages,
        }
    }

    fn assoc_deps(&self) -> AssociationDeps {
        AssociationDeps {
            instance: self.instance,
            config: Arc::clone(&self.config),
            state: Arc::clone(&self.state),
            transport: Arc::clone(&self.transport),
            clock: Arc::clone(&self.clock),
            notices: self.notices.clone(),
        }
    }

    async fn local_state(&self, user: &UserName) -> Arc<LocalUserState> {
        let mut locals = self.locals.write().await;
        Arc::clone(locals.entry(user.clone()).or_default())
    }

    async fn peek_local(&self, user: &UserName) -> Option<Arc<LocalUserState>> {
        self.locals.read().await.get(user).cloned()
    }

    async fn drop_local_if_idle(&self, user: &UserName) {
        let mut locals = self.locals.write().await;
        if let Some(local) = locals.get(user) {
            if local.socket_count().await == 0 {
                locals.remove(user);
            }
        }
    }

    pub(crate) async fn make_user(self: &Arc<Self>, name: UserName) -> ChatUser {
        let local = self.local_state(&name).await;
        let assoc = UserAssociations::new(name.clone(), local, self.assoc_deps());
        ChatUser::new(Arc::clone(self), name, assoc)
    }

    /// 发布总线请求并在限期内收集目标实例的应答；超时只产生
    /// 一致性失败事件，从不作为错误返回。
    async fn broadcast_and_wait(
        &self,
        payload: BusPayload,
        targets: HashSet<InstanceId>,
        user: &UserName,
        op_type: &str,
    ) {
        let envelope = BusEnvelope::new(self.instance, payload);
        let mut rx = self.state.bus_subscribe();
        if let Err(err) = self.state.bus_publish(&envelope).await {
            warn!(user = %user, op = op_type, error = %err, "集群总线发布失败");
            let _ = self.notices.send(ServerNotice::TransportConsistencyFailure {
                user: user.clone(),
                op_type: op_type.to_owned(),
                detail: err.to_string(),
            });
            return;
        }
        let mut pending = targets;
        // 总是等待本实例的应答：保证本地部分先于命令应答完成
        pending.insert(self.instance);
        let request = envelope.id;
        let wait = async {
            while !pending.is_empty() {
                match rx.recv().await {
                    Ok(envelope) => {
                        if let BusPayload::Ack { request: id, from } = envelope.payload {
                            if id == request {
                                pending.remove(&from);
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "集群总线消费滞后");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        if tokio::time::timeout(self.config.bus_ack_timeout(), wait)
            .await
            .is_err()
        {
            warn!(user = %user, op = op_type, "等待集群应答超时，驱逐可能不完整");
            let _ = self.notices.send(ServerNotice::TransportConsistencyFailure {
                user: user.clone(),
                op_type: op_type.to_owned(),
                detail: "bus acknowledgement timed out".to_owned(),
            });
        }
    }

    /// 名单变更后的跨实例驱逐：对每个被驱逐用户清掉加入计数，
    /// 再让持有其套接字的实例执行本地离开并通告。
    /// `notify_userlist` 控制是否按成员变更广播 `roomUserLeft`
    /// （房间删除时只发 `roomAccessRemoved`）。
    pub(crate) async fn evict_users(
        &self,
        room: &RoomName,
        evicted: &[UserName],
        op_type: &str,
        notify_userlist: bool,
    ) {
        for user in evicted {
            if let Err(err) = self.state.join_count_clear(user, room).await {
                warn!(user = %user, room = %room, error = %err, "清除加入计数失败");
            }
            if notify_userlist && self.config.enable_userlist_updates {
                let _ = self
                    .transport
                    .channel_emit(
                        &crate::events::room_channel(room),
                        &ServerEvent::RoomUserLeft {
                            room: room.clone(),
                            user: user.clone(),
                        },
                    )
                    .await;
            }
            let targets: HashSet<InstanceId> = match self.state.user_sockets(user).await {
                Ok(sockets) => sockets.into_iter().map(|(_, instance)| instance).collect(),
                Err(err) => {
                    warn!(user = %user, error = %err, "查询套接字归属失败");
                    HashSet::new()
                }
            };
            self.broadcast_and_wait(
                BusPayload::DisconnectUserFromRoom {
                    user: user.clone(),
                    room: room.clone(),
                },
                targets,
                user,
                op_type,
            )
            .await;
        }
    }

    /// 删除房间：先置删除标记挡住后续加入，驱逐全部成员，最后
    /// 释放房间状态。
    pub(crate) async fn remove_room(&self, room_name: &RoomName) -> Result<(), ChatError> {
        let users = {
            let _guard = self
                .state
                .lock(&room_lock(room_name), self.config.lock_ttl())
                .await?;
            let mut room = self.state.room_load(room_name).await?;
            room.start_removing();
            self.state.room_store(&room).await?;
            room.userlist()
        };
        self.evict_users(room_name, &users, "removeRoom", false).await;
        self.state.room_remove(room_name).await?;
        info!(room = %room_name, evicted = users.len(), "房间已删除");
        Ok(())
    }
}

/// 服务构造器。
pub struct ChatServiceBuilder {
    config: ChatConfig,
    hooks: HookRegistry,
    clock: Arc<dyn Clock>,
    state_factories: HashMap<String, StateFactory>,
    transport_factories: HashMap<String, TransportFactory>,
    state_override: Option<Arc<dyn StateStore>>,
    transport_override: Option<Arc<dyn Transport>>,
}

impl ChatServiceBuilder {
    pub fn new(config: ChatConfig) -> Self {
        let mut state_factories: HashMap<String, StateFactory> = HashMap::new();
        state_factories.insert(
            "memory".to_owned(),
            Arc::new(|_config: &ChatConfig| Arc::new(MemoryStateStore::new()) as Arc<dyn StateStore>),
        );
        let mut transport_factories: HashMap<String, TransportFactory> = HashMap::new();
        transport_factories.insert(
            "memory".to_owned(),
            Arc::new(|_config: &ChatConfig| Arc::new(MemoryTransport::new()) as Arc<dyn Transport>),
        );
        Self {
            config,
            hooks: HookRegistry::default(),
            clock: Arc::new(SystemClock),
            state_factories,
            transport_factories,
            state_override: None,
            transport_override: None,
        }
    }

    /// 注册一种状态存储；种类标签可在配置里引用。
    pub fn register_state_kind(mut self, kind: impl Into<String>, factory: StateFactory) -> Self {
        self.state_factories.insert(kind.into(), factory);
        self
    }

    pub fn register_transport_kind(
        mut self,
        kind: impl Into<String>,
        factory: TransportFactory,
    ) -> Self {
        self.transport_factories.insert(kind.into(), factory);
        self
    }

    /// 直接注入状态存储实例（多实例部署共享一份时使用）。
    pub fn with_state(mut self, state: Arc<dyn StateStore>) -> Self {
        self.state_override = Some(state);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport_override = Some(transport);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn on_connect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<UserName, ChatError>> + Send + 'static,
    {
        self.hooks.on_connect = Some(Arc::new(move |auth| Box::pin(hook(auth))));
        self
    }

    pub fn on_start<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ChatError>> + Send + 'static,
    {
        self.hooks.on_start = Some(Arc::new(move || Box::pin(hook())));
        self
    }

    pub fn on_close<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ChatError>> + Send + 'static,
    {
        self.hooks.on_close = Some(Arc::new(move || Box::pin(hook())));
        self
    }

    /// `<command>Before` 钩子。
    pub fn before<F, Fut>(mut self, command: impl Into<String>, hook: F) -> Self
    where
        F: Fn(CommandContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<crate::hooks::BeforeOutcome, ChatError>> + Send + 'static,
    {
        self.hooks
            .set_before(command, Arc::new(move |ctx, args| Box::pin(hook(ctx, args))));
        self
    }

    /// `<command>After` 钩子。
    pub fn after<F, Fut>(mut self, command: impl Into<String>, hook: F) -> Self
    where
        F: Fn(CommandContext, Vec<Value>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Value>, ChatError>> + Send + 'static,
    {
        self.hooks.set_after(
            command,
            Arc::new(move |ctx, args, results| Box::pin(hook(ctx, args, results))),
        );
        self
    }

    pub fn direct_message_checker<F>(mut self, checker: F) -> Self
    where
        F: Fn(&Value) -> Result<(), ChatError> + Send + Sync + 'static,
    {
        self.hooks.direct_message_checker = Some(Arc::new(checker));
        self
    }

    pub fn room_message_checker<F>(mut self, checker: F) -> Self
    where
        F: Fn(&Value) -> Result<(), ChatError> + Send + Sync + 'static,
    {
        self.hooks.room_message_checker = Some(Arc::new(checker));
        self
    }

    pub fn build(self) -> Result<ChatService, ChatError> {
        self.config
            .validate()
            .map_err(|err| ChatError::server_error(err.to_string()))?;
        let state = match self.state_override {
            Some(state) => state,
            None => {
                let factory = self
                    .state_factories
                    .get(&self.config.state)
                    .ok_or_else(|| {
                        ChatError::server_error(format!("unknown state kind: {}", self.config.state))
                    })?;
                factory(&self.config)
            }
        };
        let transport = match self.transport_override {
            Some(transport) => transport,
            None => {
                let factory = self
                    .transport_factories
                    .get(&self.config.transport)
                    .ok_or_else(|| {
                        ChatError::server_error(format!(
                            "unknown transport kind: {}",
                            self.config.transport
                        ))
                    })?;
                factory(&self.config)
            }
        };
        let (notices, _) = broadcast::channel(64);
        let core = Arc::new(EngineCore {
            instance: InstanceId::generate(),
            config: Arc::new(self.config),
            state,
            transport,
            clock: self.clock,
            hooks: Arc::new(self.hooks),
            notices,
            locals: RwLock::new(HashMap::new()),
        });
        Ok(ChatService {
            core,
            tasks: StdMutex::new(Vec::new()),
        })
    }
}

pub struct ChatService {
    core: Arc<EngineCore>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl ChatService {
    pub fn instance_id(&self) -> InstanceId {
        self.core.instance
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<ServerNotice> {
        self.core.notices.subscribe()
    }

    /// 启动事件循环并触发 `onStart` 钩子。
    pub async fn start(&self) -> Result<(), ChatError> {
        let incoming = self
            .core
            .transport
            .take_incoming()
            .await
            .ok_or_else(|| ChatError::server_error("transport event stream already taken"))?;
        let bus = self.core.state.bus_subscribe();
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.push(tokio::spawn(intake_loop(Arc::clone(&self.core), incoming)));
        tasks.push(tokio::spawn(bus_loop(Arc::clone(&self.core), bus)));
        drop(tasks);
        if let Some(hook) = &self.core.hooks.on_start {
            hook().await?;
        }
        info!(instance = %self.core.instance, "聊天服务已启动");
        Ok(())
    }

    // ---- 服务端 API ----

    pub async fn add_user(&self, name: &UserName, record: DirectMessaging) -> Result<(), ChatError> {
        self.core.state.user_add(name, record).await
    }

    pub async fn add_room(&self, name: RoomName, init: RoomInit) -> Result<(), ChatError> {
        let room = Room::new(name, init, self.core.history_limits());
        self.core.state.room_add(room).await
    }

    pub async fn remove_room(&self, name: &RoomName) -> Result<(), ChatError> {
        self.core.remove_room(name).await
    }

    /// 断开该用户在所有实例上的全部套接字。
    pub async fn disconnect_user_sockets(&self, name: &UserName) -> Result<(), ChatError> {
        if !self.core.state.user_exists(name).await? {
            return Err(ChatError::no_user_online(name.as_str()));
        }
        let targets: HashSet<InstanceId> = self
            .core
            .state
            .user_sockets(name)
            .await?
            .into_iter()
            .map(|(_, instance)| instance)
            .collect();
        self.core
            .broadcast_and_wait(
                BusPayload::DisconnectUserSockets { user: name.clone() },
                targets,
                name,
                "disconnectUserSockets",
            )
            .await;
        Ok(())
    }

    /// 服务端入口：不经真实套接字走同一条命令管线。
    pub async fn exec(
        &self,
        command: &str,
        opts: ExecOptions,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, ChatError> {
        let user = match (&opts.id, &opts.user_name) {
            (Some(socket), _) => self
                .core
                .state
                .socket_user(socket)
                .await?
                .ok_or_else(|| ChatError::no_socket(socket.as_str()))?,
            (None, Some(name)) => {
                if !self.core.state.user_exists(name).await? {
                    return Err(ChatError::no_user_online(name.as_str()));
                }
                name.clone()
            }
            (None, None) => {
                return Err(ChatError::no_socket(
                    "exec requires a socket id or a user name",
                ))
            }
        };
        let ctx = CommandContext {
            user: user.clone(),
            socket: opts.id,
            bypass_permissions: opts.bypass_permissions,
            is_local_call: opts.is_local_call,
        };
        let chat_user = self.core.make_user(user).await;
        run_command(&chat_user, &ctx, command, args).await
    }

    /// 有序关闭：停止接入并等待既有连接退场，触发 `onClose`，
    /// 最后关闭状态存储。
    pub async fn close(&self) -> Result<(), ChatError> {
        self.core
            .transport
            .close(self.core.config.close_timeout())
            .await?;
        // 让强制断开产生的清理事件有机会被事件循环消化
        tokio::time::sleep(Duration::from_millis(20)).await;
        if let Some(hook) = &self.core.hooks.on_close {
            hook().await?;
        }
        self.core.state.close().await?;
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
        info!(instance = %self.core.instance, "聊天服务已关闭");
        Ok(())
    }
}

fn default_credentials(auth: &Value) -> Result<UserName, ChatError> {
    match auth {
        Value::String(name) => UserName::parse(name.clone()),
        Value::Object(fields) => {
            let name = fields
                .get("user")
                .or_else(|| fields.get("userName"))
                .and_then(Value::as_str)
                .ok_or_else(|| ChatError::not_allowed("no credentials supplied"))?;
            UserName::parse(name)
        }
        _ => Err(ChatError::not_allowed("no credentials supplied")),
    }
}

async fn intake_loop(
    core: Arc<EngineCore>,
    mut incoming: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = incoming.recv().await {
        match event {
            TransportEvent::Connected { socket, auth } => {
                handle_connection(&core, socket, auth).await;
            }
            TransportEvent::Command {
                socket,
                name,
                args,
                ack,
            } => {
                let result = handle_command(&core, &socket, &name, args).await;
                let payload = match result {
                    Ok(data) => CommandAck::ok(data),
                    Err(err) => {
                        debug!(socket = %socket, command = %name, error = %err, "命令失败");
                        CommandAck::err(err.serialize(core.config.use_raw_error_objects))
                    }
                };
                let _ = ack.send(payload);
            }
            TransportEvent::Disconnected { socket } => {
                handle_disconnect(&core, socket).await;
            }
        }
    }
}

async fn handle_connection(core: &Arc<EngineCore>, socket: SocketId, auth: Value) {
    let resolved = match &core.hooks.on_connect {
        Some(hook) => hook(auth).await,
        None => default_credentials(&auth),
    };
    let name = match resolved {
        Ok(name) => name,
        Err(err) => {
            reject_connection(core, &socket, err).await;
            return;
        }
    };
    let registered = async {
        // 首次连接即建档；与其他实例竞争建档不算失败
        match core
            .state
            .user_add(&name, DirectMessaging::default())
            .await
        {
            Ok(()) | Err(ChatError::UserExists(_)) => {}
            Err(err) => return Err(err),
        }
        let user = core.make_user(name.clone()).await;
        user.associations().register_socket(&socket).await
    }
    .await;
    match registered {
        Ok(_) => {
            let _ = core
                .transport
                .emit(
                    &socket,
                    &ServerEvent::LoginConfirmed {
                        user: name.clone(),
                        socket: socket.clone(),
                    },
                )
                .await;
        }
        Err(err) => {
            core.drop_local_if_idle(&name).await;
            reject_connection(core, &socket, err).await;
        }
    }
}

async fn reject_connection(core: &Arc<EngineCore>, socket: &SocketId, err: ChatError) {
    warn!(socket = %socket, error = %err, "连接被拒绝");
    let _ = core
        .transport
        .emit(
            socket,
            &ServerEvent::LoginRejected {
                error: err.serialize(core.config.use_raw_error_objects),
            },
        )
        .await;
    let _ = core.transport.disconnect(socket, "login rejected").await;
}

async fn handle_command(
    core: &Arc<EngineCore>,
    socket: &SocketId,
    name: &str,
    args: Vec<Value>,
) -> Result<Vec<Value>, ChatError> {
    let user = core
        .state
        .socket_user(socket)
        .await?
        .ok_or_else(|| ChatError::no_socket(socket.as_str()))?;
    let ctx = CommandContext {
        user: user.clone(),
        socket: Some(socket.clone()),
        bypass_permissions: false,
        is_local_call: false,
    };
    let chat_user = core.make_user(user).await;
    run_command(&chat_user, &ctx, name, args).await
}

async fn handle_disconnect(core: &Arc<EngineCore>, socket: SocketId) {
    match core.state.socket_user(&socket).await {
        Ok(Some(name)) => {
            let user = core.make_user(name.clone()).await;
            if let Err(err) = user.associations().remove_socket(&socket).await {
                warn!(socket = %socket, user = %name, error = %err, "套接字清理失败");
            }
            core.drop_local_if_idle(&name).await;
        }
        // 未注册的套接字（例如登录被拒后断开）
        Ok(None) => {}
        Err(err) => {
            warn!(socket = %socket, error = %err, "断开处理读取状态失败");
        }
    }
}

async fn bus_loop(core: Arc<EngineCore>, mut bus: broadcast::Receiver<BusEnvelope>) {
    loop {
        let envelope = match bus.recv().await {
            Ok(envelope) => envelope,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, instance = %core.instance, "集群总线消费滞后");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match envelope.payload {
            BusPayload::DisconnectUserFromRoom { ref user, ref room } => {
                if let Some(local) = core.peek_local(user).await {
                    let assoc =
                        UserAssociations::new(user.clone(), local, core.assoc_deps());
                    if let Err(err) = assoc.disconnect_from_room(room).await {
                        warn!(user = %user, room = %room, error = %err, "执行驱逐指令失败");
                    }
                }
                let _ = core
                    .state
                    .bus_publish(&BusEnvelope::ack(envelope.id, core.instance))
                    .await;
            }
            BusPayload::DisconnectUserSockets { ref user } => {
                if let Some(local) = core.peek_local(user).await {
                    let assoc =
                        UserAssociations::new(user.clone(), local, core.assoc_deps());
                    if let Err(err) = assoc.disconnect_instance_sockets("server request").await {
                        warn!(user = %user, error = %err, "强制断开指令执行失败");
                    }
                }
                let _ = core
                    .state
                    .bus_publish(&BusEnvelope::ack(envelope.id, core.instance))
                    .await;
            }
            BusPayload::Ack { .. } => {}
        }
    }
}
