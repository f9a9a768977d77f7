//! # RPC Session with Async Pumps
//!
//! A `Session` is one side of a bidirectional RPC link. It spawns two tasks:
//!
//! - a reader pump that pulls messages off the port and dispatches them, and
//! - a writer pump that drains the outbox into the port.
//!
//! The reader starts each invoked function itself and only hands it to a
//! separate task once it suspends. Callees therefore begin in packet order
//! while their results may come back in any order.
//!
//! Outbound packets go through an unbounded queue, so anything (including a
//! proxy being dropped) can emit a packet without awaiting.
//!
//! ## Tables
//!
//! - `named`: the stable API surface exposed to the peer.
//! - `id_functions`: local functions the peer can address by identifier,
//!   either exported callbacks or the resolve/reject continuations of our own
//!   outstanding calls.
//! - `pending`: one entry per outstanding call. Its resolve and reject ids
//!   both point at it, and settling through either removes both.
//! - `held`: proxies for remote functions, by identifier, held weakly. When
//!   the last clone of a proxy goes away the peer is told to release it.

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use rcopack::BoxFuture;
use rcopack::CallResult;
use rcopack::Callable;
use rcopack::Codec;
use rcopack::Function;
use rcopack::Limits;
use rcopack::OrderedMap;
use rcopack::Registry;
use rcopack::Value;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::debug;
use tracing::warn;

use crate::error::Error;
use crate::error::Result;
use crate::marshal;
use crate::packet::Invoke;
use crate::packet::Packet;
use crate::packet::Target;
use crate::transport::Port;
use crate::wire::Message;
use crate::wire::WireFormat;

/// Session settings. Fixed once the session is created.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    wire: WireFormat,
    id_prefix: String,
    registry: Arc<Registry>,
    limits: Limits,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outbound representation.
    pub fn wire(mut self, wire: WireFormat) -> Self {
        self.wire = wire;
        self
    }

    /// Prefix for generated function identifiers; shows up in logs.
    pub fn id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = prefix.into();
        self
    }

    /// Classes and safety functions known to this side's codec.
    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }
}

/// A local function the peer can address by identifier.
#[derive(Clone)]
enum IdFunction {
    /// Exported while marshalling; lives until the peer releases it.
    Callback(Function),
    /// Continuation of one of our calls.
    Settle { call: u64, ok: bool },
}

struct PendingCall {
    resolve: String,
    reject: String,
    tx: oneshot::Sender<Result<Value>>,
}

enum Outbound {
    Message(Message),
    Close,
}

struct Inner {
    codec: Codec,
    wire: WireFormat,
    id_prefix: String,
    outbox: mpsc::UnboundedSender<Outbound>,
    named: DashMap<String, Function>,
    id_functions: DashMap<String, IdFunction>,
    /// Function identity -> identifier, so a function is exported once.
    exported: DashMap<usize, String>,
    pending: DashMap<u64, PendingCall>,
    held: DashMap<String, Weak<RemoteFunction>>,
    next_id: AtomicU64,
    next_call: AtomicU64,
    closed: AtomicBool,
    reader: OnceLock<AbortHandle>,
}

/// One side of a bidirectional RPC link. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Creates a session over `port` and spawns its pumps.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: SessionConfig, port: impl Port) -> Self {
        let port: Arc<dyn Port> = Arc::new(port);
        let (outbox, rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            codec: Codec::new(config.registry).with_limits(config.limits),
            wire: config.wire,
            id_prefix: config.id_prefix,
            outbox,
            named: DashMap::new(),
            id_functions: DashMap::new(),
            exported: DashMap::new(),
            pending: DashMap::new(),
            held: DashMap::new(),
            next_id: AtomicU64::new(1),
            next_call: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            reader: OnceLock::new(),
        });

        tokio::spawn(write_pump(rx, port.clone()));
        let reader = tokio::spawn(read_pump(inner.clone(), port));
        let _ = inner.reader.set(reader.abort_handle());

        Self { inner }
    }

    pub fn wire(&self) -> WireFormat {
        self.inner.wire
    }

    pub fn codec(&self) -> &Codec {
        &self.inner.codec
    }

    /// Makes `func` callable by the peer under `name`, replacing any previous
    /// function with that name.
    pub fn expose(&self, name: impl Into<String>, func: Function) -> Option<Function> {
        self.inner.named.insert(name.into(), func)
    }

    pub fn withdraw(&self, name: &str) -> Option<Function> {
        self.inner.named.remove(name).map(|(_, f)| f)
    }

    /// Calls the peer's named function and waits for it to settle.
    ///
    /// A rejection arrives as `Error::Remote` with the thrown value.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        self.inner.call(Target::Named(name.to_owned()), args).await
    }

    /// Calls a peer function by identifier.
    pub async fn call_id(&self, id: &str, args: Vec<Value>) -> Result<Value> {
        self.inner.call(Target::Id(id.to_owned()), args).await
    }

    /// Invokes the peer's named function without continuations. Its result
    /// and any error it throws are discarded on the peer.
    pub fn notify(&self, name: &str, args: Vec<Value>) -> Result<()> {
        self.inner.send_invoke(Target::Named(name.to_owned()), args, None, None)
    }

    /// Tells the peer we no longer hold these function identifiers.
    ///
    /// Releasing an identifier twice, or one that was never held, is harmless.
    pub fn release_remote<I, S>(&self, ids: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        for id in &ids {
            self.inner.held.remove(id);
        }
        self.inner.post(&Packet::Release(ids))
    }

    /// Identifier of the remote function behind a proxy.
    pub fn remote_id(&self, func: &Function) -> Option<String> {
        self.inner
            .held
            .iter()
            .find(|e| e.value().as_ptr() as *const () as usize == func.id())
            .map(|e| e.key().clone())
    }

    /// Processes one inbound message. An invoked function runs here until
    /// it first suspends; the remainder continues on its own task.
    pub async fn handle(&self, msg: Message) -> Result<()> {
        if let Some(job) = self.inner.handle(msg)? {
            start(job).await;
        }
        Ok(())
    }

    /// Stops both pumps and fails every outstanding call with `Error::Closed`.
    pub fn close(&self) {
        if let Some(reader) = self.inner.reader.get() {
            reader.abort();
        }
        let _ = self.inner.outbox.send(Outbound::Close);
        self.inner.shut();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Calls still waiting to settle.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Local functions currently addressable by identifier.
    pub fn id_functions(&self) -> usize {
        self.inner.id_functions.len()
    }

    /// Remote functions with a live local proxy.
    pub fn held_functions(&self) -> usize {
        self.inner.held.iter().filter(|e| e.value().strong_count() > 0).count()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("wire", &self.inner.wire)
            .field("id_prefix", &self.inner.id_prefix)
            .field("pending", &self.inner.pending.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn read_pump(inner: Arc<Inner>, port: Arc<dyn Port>) {
    loop {
        match port.recv().await {
            Ok(Some(msg)) => match inner.handle(msg) {
                Ok(Some(job)) => start(job).await,
                Ok(None) => {}
                Err(e) => warn!(error = %e, "dropping inbound message"),
            },
            Ok(None) => {
                debug!("port closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "port receive failed");
                break;
            }
        }
    }
    inner.shut();
}

/// Polls `job` once on the calling task and spawns whatever is left, so
/// invoked functions start in the order their packets arrived.
async fn start(mut job: BoxFuture<()>) {
    if futures::poll!(job.as_mut()).is_pending() {
        tokio::spawn(job);
    }
}

async fn write_pump(mut rx: mpsc::UnboundedReceiver<Outbound>, port: Arc<dyn Port>) {
    while let Some(Outbound::Message(msg)) = rx.recv().await {
        if let Err(e) = port.send(msg).await {
            warn!(error = %e, "port send failed");
            break;
        }
    }
}

/// Removes a call's table entries when its future finishes or is dropped.
struct Abandon<'a> {
    inner: &'a Inner,
    call: u64,
}

impl Drop for Abandon<'_> {
    fn drop(&mut self) {
        self.inner.abandon(self.call);
    }
}

impl Inner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn fresh_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{}{}.{:016x}", self.id_prefix, n, rand::random::<u64>())
    }

    fn post(&self, packet: &Packet) -> Result<()> {
        let msg = self.wire.encode(&self.codec, packet.to_value())?;
        self.outbox.send(Outbound::Message(msg)).map_err(|_| Error::Closed)
    }

    /// Marks the session closed and fails everything still waiting.
    fn shut(&self) {
        self.closed.store(true, Ordering::Release);
        let calls: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for call in calls {
            if let Some(pending) = self.take_call(call) {
                let _ = pending.tx.send(Err(Error::Closed));
            }
        }
    }

    fn take_call(&self, call: u64) -> Option<PendingCall> {
        let (_, pending) = self.pending.remove(&call)?;
        self.id_functions.remove(&pending.resolve);
        self.id_functions.remove(&pending.reject);
        Some(pending)
    }

    fn abandon(&self, call: u64) {
        if self.take_call(call).is_some() {
            debug!(call, "abandoned call");
        }
    }

    /// Identifier the peer will use for `func`, exporting it on first sight.
    fn export(&self, func: &Function) -> String {
        self.exported
            .entry(func.id())
            .or_insert_with(|| {
                let id = self.fresh_id();
                self.id_functions.insert(id.clone(), IdFunction::Callback(func.clone()));
                id
            })
            .clone()
    }

    fn release_local(&self, id: &str) {
        match self.id_functions.get(id).map(|f| f.value().clone()) {
            Some(IdFunction::Callback(func)) => {
                // unmap first so a concurrent export mints a fresh id
                self.exported.remove_if(&func.id(), |_, exported| exported == id);
                self.id_functions.remove(id);
                debug!(id, "released exported function");
            }
            // a continuation is dropped together with its call
            Some(IdFunction::Settle { call, .. }) => self.abandon(call),
            None => {}
        }
    }

    /// Live proxy for a remote identifier, created on first sight.
    fn proxy(self: &Arc<Self>, id: &str) -> Function {
        let mut slot = self.held.entry(id.to_owned()).or_default();
        if let Some(live) = slot.upgrade() {
            return Function::from_arc(live);
        }
        let remote = Arc::new(RemoteFunction {
            id: id.to_owned(),
            session: Arc::downgrade(self),
        });
        *slot = Arc::downgrade(&remote);
        Function::from_arc(remote)
    }

    fn send_invoke(
        &self,
        target: Target,
        args: Vec<Value>,
        resolve: Option<String>,
        reject: Option<String>,
    ) -> Result<()> {
        let (args, tokens) = marshal::extract(&Value::list(args), self.codec.limits(), |f| self.export(f))?;
        debug!(function = %target, functions = tokens.as_ref().map_or(0, OrderedMap::len), "invoke");
        self.post(&Packet::Invoke(Invoke { target, args, tokens, resolve, reject }))
    }

    async fn call(&self, target: Target, args: Vec<Value>) -> Result<Value> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let call = self.next_call.fetch_add(1, Ordering::Relaxed);
        let resolve = self.fresh_id();
        let reject = self.fresh_id();
        let (tx, rx) = oneshot::channel();

        self.pending.insert(call, PendingCall { resolve: resolve.clone(), reject: reject.clone(), tx });
        self.id_functions.insert(resolve.clone(), IdFunction::Settle { call, ok: true });
        self.id_functions.insert(reject.clone(), IdFunction::Settle { call, ok: false });
        let _guard = Abandon { inner: self, call };

        // closed between the check and the insert: nobody is left to fail it
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.send_invoke(target, args, Some(resolve), Some(reject))?;

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Closed),
        }
    }

    fn settle(&self, call: u64, ok: bool, args: Vec<Value>) {
        let Some(pending) = self.take_call(call) else { return };
        let v = args.into_iter().next().unwrap_or(Value::Undefined);
        let _ = pending.tx.send(if ok { Ok(v) } else { Err(Error::Remote(v)) });
    }

    /// Applies one inbound message; an invocation comes back as the job that
    /// runs the callee.
    fn handle(self: &Arc<Self>, msg: Message) -> Result<Option<BoxFuture<()>>> {
        let value = msg.decode(&self.codec)?;
        match Packet::from_value(&value)? {
            Packet::Release(ids) => {
                debug!(count = ids.len(), "release");
                for id in &ids {
                    self.release_local(id);
                }
                Ok(None)
            }
            Packet::Invoke(inv) => self.dispatch(inv),
        }
    }

    fn dispatch(self: &Arc<Self>, inv: Invoke) -> Result<Option<BoxFuture<()>>> {
        let Invoke { target, args, tokens, resolve, reject } = inv;
        let args = match &tokens {
            Some(tokens) => marshal::inject(&args, tokens, self.codec.limits(), |id| self.proxy(id))?,
            None => args,
        };
        let args = match args {
            Value::List(list) => list.items(),
            _ => return Err(Error::Protocol("arguments are not a list".into())),
        };

        let func = match &target {
            Target::Named(name) => self.named.get(name).map(|f| f.value().clone()),
            Target::Id(id) => match self.id_functions.get(id).map(|f| f.value().clone()) {
                Some(IdFunction::Callback(func)) => Some(func),
                Some(IdFunction::Settle { call, ok }) => {
                    self.settle(call, ok, args);
                    return Ok(None);
                }
                None => None,
            },
        };

        let Some(func) = func else {
            warn!(function = %target, "invocation of missing function");
            if let Some(reject) = reject {
                let message = format!("function {} does not exist", target.name());
                self.send_invoke(Target::Id(reject), vec![Value::from(message)], None, None)?;
            }
            return Ok(None);
        };

        debug!(function = %target, "dispatch");
        let job: BoxFuture<()> = Box::pin(self.clone().run(target, func, args, resolve, reject));
        Ok(Some(job))
    }

    async fn run(
        self: Arc<Self>,
        target: Target,
        func: Function,
        args: Vec<Value>,
        resolve: Option<String>,
        reject: Option<String>,
    ) {
        let outcome = func.call(args).await;
        let (to, v) = match outcome {
            Ok(v) => (resolve, v),
            Err(thrown) => {
                if reject.is_none() {
                    warn!(function = %target, ?thrown, "dropping error from call without continuation");
                }
                (reject.clone(), thrown)
            }
        };
        let Some(to) = to else { return };
        let Err(e) = self.send_invoke(Target::Id(to.clone()), vec![v], None, None) else { return };
        warn!(function = %target, error = %e, "failed to send result");
        // a result that cannot be sent still settles the caller
        if let Some(reject) = reject.filter(|r| *r != to) {
            let _ = self.send_invoke(Target::Id(reject), vec![Value::from(e.to_string())], None, None);
        }
    }
}

/// Local stand-in for a function that lives on the peer.
struct RemoteFunction {
    id: String,
    session: Weak<Inner>,
}

impl Callable for RemoteFunction {
    fn call(&self, args: Vec<Value>) -> BoxFuture<CallResult> {
        let session = self.session.upgrade();
        let id = self.id.clone();
        Box::pin(async move {
            let Some(session) = session else {
                return Err(Error::Closed.into_thrown());
            };
            session.call(Target::Id(id), args).await.map_err(Error::into_thrown)
        })
    }
}

impl Drop for RemoteFunction {
    fn drop(&mut self) {
        let Some(session) = self.session.upgrade() else { return };
        // a newer proxy for the same id keeps the export alive
        if session.held.remove_if(&self.id, |_, w| w.strong_count() == 0).is_some() {
            debug!(id = %self.id, "proxy unreachable, releasing");
            let _ = session.post(&Packet::Release(vec![self.id.clone()]));
        }
    }
}
