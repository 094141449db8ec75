//! Radix-tree router, middleware chain, and per-request [`Context`].
//!
//! Routes are registered per [`Method`] against a `/`-separated path; a
//! segment starting with `:` binds a named parameter. Matching walks the
//! tree segment by segment, preferring a literal child over a parameter
//! child and backtracking when a literal branch turns out to have no
//! match further down.
//!
//! [`Router`] itself implements [`Handler`], so it slots into
//! [`ServerBuilder::handler`](crate::ServerBuilder::handler) exactly like
//! any other handler — there is no special integration point in
//! `server::connection` for it.

use crate::{
    arena::{Arena, ArenaBuf},
    errors::ErrorKind,
    limits::{RouterLimits, SlabLimits},
    ConnectionData, Handled, Handler, Method, Request, Response, StatusCode,
};
use std::{error, fmt, future::Future, pin::Pin, sync::Arc};
use tokio::{net::TcpStream, sync::oneshot};

/// A single step in a route's handler chain.
///
/// Implemented the same way [`Handler`](crate::Handler) is — a plain
/// struct holding whatever state the middleware needs (config, a shared
/// client, counters) — except `call` returns a boxed future rather than
/// `impl Future`, since a chain stores a `Vec` of differently-typed
/// steps behind one dynamic type.
///
/// A step that wants the rest of the chain to run calls
/// [`ctx.next()`](Context::next) before or after its own work; a step
/// that never calls it ends the chain there (equivalent to
/// [`ctx.abort()`](Context::abort)).
///
/// # Examples
/// ```
/// use kestrel_web::router::{Context, Middleware};
/// use kestrel_web::StatusCode;
/// use std::{future::Future, pin::Pin};
///
/// struct Logger;
///
/// impl Middleware for Logger {
///     fn call<'ctx, 'd>(
///         &'ctx self,
///         ctx: &'ctx mut Context<'d, ()>,
///     ) -> Pin<Box<dyn Future<Output = ()> + Send + 'ctx>> {
///         Box::pin(async move {
///             ctx.next().await;
///         })
///     }
/// }
///
/// struct Hello;
///
/// impl Middleware for Hello {
///     fn call<'ctx, 'd>(
///         &'ctx self,
///         ctx: &'ctx mut Context<'d, ()>,
///     ) -> Pin<Box<dyn Future<Output = ()> + Send + 'ctx>> {
///         Box::pin(async move {
///             ctx.response.status(StatusCode::Ok).body("hi");
///         })
///     }
/// }
/// ```
pub trait Middleware<S = ()>: Send + Sync + 'static
where
    S: ConnectionData,
{
    /// Runs this step. Call [`ctx.next()`](Context::next) to continue
    /// the chain; returning without calling it ends the chain here.
    fn call<'ctx, 'd>(
        &'ctx self,
        ctx: &'ctx mut Context<'d, S>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'ctx>>;

    /// Takes over a raw socket after this step's own [`Response::upgrade`]
    /// finalized the handshake, mirroring
    /// [`Handler::handle_ws`](crate::Handler::handle_ws) one level down.
    ///
    /// The default implementation does nothing. Only the terminal
    /// handler of a route — the last step in its chain — ever has this
    /// called; middleware steps that only run before/after `next()` can
    /// ignore it entirely.
    fn call_ws<'ctx>(
        &'ctx self,
        connection_data: &'ctx mut S,
        request: &'ctx Request,
        stream: &'ctx mut TcpStream,
        buffer: &'ctx mut [u8],
        arena: &'ctx Arena,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'ctx>> {
        let _ = (connection_data, request, stream, buffer, arena);
        Box::pin(async {})
    }
}

type Chain<S> = Arc<[Arc<dyn Middleware<S>>]>;

/// Per-request state handed to every [`Middleware`] step in a chain.
///
/// Holds the same `Request`/`Response`/connection-data triple
/// [`Handler::handle`](crate::Handler::handle) does, plus the path
/// parameters captured during route matching and the cursor driving the
/// chain.
pub struct Context<'a, S> {
    /// Connection-specific state, same as [`Handler::handle`]'s `data`.
    pub connection_data: &'a mut S,
    /// The parsed request being routed.
    pub request: &'a Request,
    /// The response under construction.
    pub response: &'a mut Response,
    params: &'a [(&'a [u8], &'a [u8])],
    chain: &'a [Arc<dyn Middleware<S>>],
    index: usize,
    aborted: bool,
    deferred: Option<oneshot::Receiver<Box<dyn FnOnce(&mut Response) + Send>>>,
}

impl<'a, S> Context<'a, S> {
    /// Looks up a path parameter captured during route matching (e.g.
    /// `:id` in `/users/:id` binds `b"id"`).
    #[inline]
    pub fn param(&self, name: &[u8]) -> Option<&'a [u8]> {
        self.params
            .iter()
            .find(|&&(n, _)| n == name)
            .map(|&(_, v)| v)
    }

    /// All path parameters captured during route matching, in
    /// registration order.
    #[inline]
    pub fn params(&self) -> &'a [(&'a [u8], &'a [u8])] {
        self.params
    }

    /// Stops the chain: no further steps run, even if they would
    /// otherwise have called [`next()`](Context::next).
    #[inline]
    pub fn abort(&mut self) {
        self.aborted = true;
        self.index = self.chain.len();
    }

    /// Ends the chain here and hands back a [`DeferToken`] that
    /// completes the response from outside this call, once external
    /// work (a worker-pool job, a background I/O operation) finishes.
    ///
    /// The response is built by whichever code calls
    /// [`DeferToken::finish`]; if the token is dropped without a call,
    /// the route reports a 503 instead of hanging forever.
    #[inline]
    pub fn defer(&mut self) -> DeferToken {
        let (tx, rx) = oneshot::channel();
        self.deferred = Some(rx);
        self.abort();
        DeferToken(tx)
    }

    /// Runs the remaining steps of the chain in order.
    ///
    /// A step that calls this recursively runs the tail of the chain
    /// before its own code after the `.await` point runs — the usual
    /// "onion" middleware composition.
    pub async fn next(&mut self) {
        while !self.aborted && self.index < self.chain.len() {
            let step = self.chain[self.index].clone();
            self.index += 1;
            step.call(self).await;
        }
    }
}

/// Hands the response for a [`Context::defer`]red request to whichever
/// task finishes the work that was deferred for.
pub struct DeferToken(oneshot::Sender<Box<dyn FnOnce(&mut Response) + Send>>);

impl DeferToken {
    /// Completes the deferred response. `build` runs on the
    /// connection's own task once the router resumes waiting for it,
    /// with exclusive access to the `Response`.
    ///
    /// Returns [`DeferError::Closed`] if the connection is already gone
    /// (e.g. the peer disconnected while the work was in flight).
    pub fn finish<F>(self, build: F) -> Result<(), DeferError>
    where
        F: FnOnce(&mut Response) + Send + 'static,
    {
        self.0.send(Box::new(build)).map_err(|_| DeferError::Closed)
    }
}

/// Error returned by [`DeferToken::finish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferError {
    /// The connection the deferred request belonged to is already gone.
    Closed,
}

impl fmt::Display for DeferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferError::Closed => write!(f, "connection closed before the deferred response finished"),
        }
    }
}
impl error::Error for DeferError {}

// RADIX TREE

const METHOD_COUNT: usize = 9;

struct RouteNode<S> {
    literal_children: Vec<(Box<[u8]>, RouteNode<S>)>,
    param_child: Option<(Box<[u8]>, Box<RouteNode<S>>)>,
    handlers: [Option<Chain<S>>; METHOD_COUNT],
}

impl<S> RouteNode<S> {
    fn new() -> Self {
        Self {
            literal_children: Vec::new(),
            param_child: None,
            handlers: std::array::from_fn(|_| None),
        }
    }

    fn insert(&mut self, segments: &[&[u8]], method: Method, chain: Chain<S>) -> Result<(), RouteError> {
        let Some((seg, rest)) = segments.split_first() else {
            let idx = method as usize;
            if self.handlers[idx].is_some() {
                return Err(RouteError::DuplicateRoute);
            }
            self.handlers[idx] = Some(chain);
            return Ok(());
        };

        if let Some(name) = seg.strip_prefix(b":") {
            if name.is_empty() {
                return Err(RouteError::EmptyParamName);
            }

            match &mut self.param_child {
                Some((existing, child)) if existing.as_ref() == name => child.insert(rest, method, chain),
                Some((existing, _)) => Err(RouteError::ParamConflict {
                    existing: String::from_utf8_lossy(existing).into_owned(),
                    new: String::from_utf8_lossy(name).into_owned(),
                }),
                None => {
                    let mut child = Box::new(RouteNode::new());
                    child.insert(rest, method, chain)?;
                    self.param_child = Some((Box::from(name), child));
                    Ok(())
                }
            }
        } else if let Some((_, child)) = self
            .literal_children
            .iter_mut()
            .find(|(lit, _)| lit.as_ref() == *seg)
        {
            child.insert(rest, method, chain)
        } else {
            let mut child = RouteNode::new();
            child.insert(rest, method, chain)?;
            self.literal_children.push((Box::from(*seg), child));
            Ok(())
        }
    }

    /// Walks the tree for `segments`, preferring a literal child and
    /// backtracking into the parameter child when the literal branch
    /// doesn't lead to a match.
    fn find_node<'a, 'arena>(
        &'a self,
        segments: &[&'a [u8]],
        params: &mut ArenaBuf<'arena, (&'a [u8], &'a [u8])>,
    ) -> Result<Option<&'a RouteNode<S>>, ErrorKind> {
        let Some((seg, rest)) = segments.split_first() else {
            return Ok(Some(self));
        };

        if let Some((_, child)) = self.literal_children.iter().find(|(lit, _)| lit.as_ref() == *seg) {
            if let Some(found) = child.find_node(rest, params)? {
                return Ok(Some(found));
            }
        }

        if let Some((name, child)) = &self.param_child {
            params
                .push((name.as_ref(), *seg))
                .map_err(|_| ErrorKind::SlabExhausted)?;
            if let Some(found) = child.find_node(rest, params)? {
                return Ok(Some(found));
            }
            params.pop();
        }

        Ok(None)
    }

    fn find<'a, 'arena>(
        &'a self,
        segments: &[&'a [u8]],
        method: Method,
        arena: &'arena Arena,
    ) -> Result<Option<(&'a Chain<S>, ArenaBuf<'arena, (&'a [u8], &'a [u8])>)>, ErrorKind> {
        let mut params = ArenaBuf::new(arena);
        let Some(node) = self.find_node(segments, &mut params)? else {
            return Ok(None);
        };
        let Some(chain) = node.handlers[method as usize].as_ref() else {
            return Ok(None);
        };
        Ok(Some((chain, params)))
    }
}

/// Error returned when registering a route conflicts with one already
/// registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// A `:` segment with no name following it (e.g. `/users/:`).
    EmptyParamName,
    /// Two different parameter names were registered at the same
    /// position (e.g. `/users/:id` then `/users/:name`) — only one
    /// parameter child is allowed per node.
    ParamConflict {
        /// The parameter name already registered at this position.
        existing: String,
        /// The conflicting name a later registration tried to add.
        new: String,
    },
    /// The same method and path were registered twice.
    DuplicateRoute,
    /// The path has more segments than [`RouterLimits::max_path_segments`].
    TooManySegments {
        /// The configured limit.
        limit: usize,
        /// The path's actual segment count.
        actual: usize,
    },
    /// The combined global + group + handler chain is longer than
    /// [`RouterLimits::max_chain_len`].
    ChainTooLong {
        /// The configured limit.
        limit: usize,
        /// The chain's actual length.
        actual: usize,
    },
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteError::EmptyParamName => write!(f, "path parameter has no name"),
            RouteError::ParamConflict { existing, new } => {
                write!(f, "parameter `:{new}` conflicts with already-registered `:{existing}` at the same position")
            }
            RouteError::DuplicateRoute => write!(f, "method and path already registered"),
            RouteError::TooManySegments { limit, actual } => {
                write!(f, "path has {actual} segments, limit is {limit}")
            }
            RouteError::ChainTooLong { limit, actual } => {
                write!(f, "middleware chain has {actual} steps, limit is {limit}")
            }
        }
    }
}
impl error::Error for RouteError {}

// PATH HELPERS

fn split_segments(path: &str) -> Vec<&[u8]> {
    let bytes = path.as_bytes();
    let bytes = bytes.strip_prefix(b"/").unwrap_or(bytes);
    let bytes = match bytes.len() {
        0 => bytes,
        _ => bytes.strip_suffix(b"/").unwrap_or(bytes),
    };

    if bytes.is_empty() {
        Vec::new()
    } else {
        bytes.split(|&b| b == b'/').collect()
    }
}

fn join_path(prefix: &str, path: &str) -> String {
    let prefix = prefix.strip_suffix('/').unwrap_or(prefix);
    let path = path.strip_prefix('/').unwrap_or(path);

    if path.is_empty() {
        format!("{prefix}/")
    } else {
        format!("{prefix}/{path}")
    }
}

fn check_route_limits(limits: &RouterLimits, segment_count: usize, chain_len: usize) -> Result<(), RouteError> {
    if segment_count > limits.max_path_segments {
        return Err(RouteError::TooManySegments {
            limit: limits.max_path_segments,
            actual: segment_count,
        });
    }

    if chain_len > limits.max_chain_len {
        return Err(RouteError::ChainTooLong {
            limit: limits.max_chain_len,
            actual: chain_len,
        });
    }

    Ok(())
}

fn build_chain<S>(global: &[Arc<dyn Middleware<S>>], group: &[Arc<dyn Middleware<S>>], handler: Arc<dyn Middleware<S>>) -> Chain<S> {
    let mut steps = Vec::with_capacity(global.len() + group.len() + 1);
    steps.extend(global.iter().cloned());
    steps.extend(group.iter().cloned());
    steps.push(handler);
    Arc::from(steps)
}

// BUILDER

/// Builder for a [`Router`].
///
/// Global middleware registered via [`middleware`](Self::middleware)
/// runs ahead of every route, in registration order. [`group`](Self::group)
/// opens a path-prefixed [`Group`] with its own middleware list that
/// only applies to routes registered within it.
pub struct RouterBuilder<S = ()>
where
    S: ConnectionData,
{
    root: RouteNode<S>,
    global: Vec<Arc<dyn Middleware<S>>>,
    limits: RouterLimits,
    slab_limits: SlabLimits,
}

impl<S: ConnectionData> Default for RouterBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ConnectionData> RouterBuilder<S> {
    /// Creates an empty builder with default [`RouterLimits`].
    pub fn new() -> Self {
        Self {
            root: RouteNode::new(),
            global: Vec::new(),
            limits: RouterLimits::default(),
            slab_limits: SlabLimits::default(),
        }
    }

    /// Overrides the default [`RouterLimits`].
    pub fn limits(mut self, limits: RouterLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Overrides the default [`SlabLimits`] for the arena backing route
    /// parameters captured during matching.
    ///
    /// `threaded` is always forced to `true` regardless of this value: the
    /// built [`Router`] is shared (via `Arc`) across every connection's
    /// task, so its arena must be safe to call from more than one at once.
    pub fn slab_limits(mut self, limits: SlabLimits) -> Self {
        self.slab_limits = limits;
        self
    }

    /// Registers middleware that runs ahead of every route.
    pub fn middleware<M: Middleware<S>>(mut self, middleware: M) -> Self {
        self.global.push(Arc::new(middleware));
        self
    }

    /// Registers a route, returning an error on a path/parameter conflict.
    pub fn try_route<M: Middleware<S>>(mut self, method: Method, path: &str, handler: M) -> Result<Self, RouteError> {
        let segments = split_segments(path);
        check_route_limits(&self.limits, segments.len(), self.global.len() + 1)?;

        let chain = build_chain(&self.global, &[], Arc::new(handler));
        self.root.insert(&segments, method, chain)?;
        Ok(self)
    }

    /// Registers a route.
    ///
    /// # Panics
    /// Panics on a path/parameter conflict — the common case of a route
    /// conflict being a registration-time programmer mistake, matching
    /// [`ServerBuilder`](crate::ServerBuilder)'s builder-misuse idiom.
    #[track_caller]
    pub fn route<M: Middleware<S>>(self, method: Method, path: &str, handler: M) -> Self {
        let path = path.to_owned();
        match self.try_route(method, &path, handler) {
            Ok(builder) => builder,
            Err(err) => panic!("registering {path:?} failed: {err}"),
        }
    }

    /// Opens a path-prefixed group with its own middleware list. Call
    /// [`Group::end`] to return to the parent builder.
    pub fn group(self, prefix: &str) -> Group<S> {
        Group {
            router: self,
            prefix: prefix.to_owned(),
            middleware: Vec::new(),
        }
    }

    /// Finalizes the builder into a [`Router`].
    pub fn build(self) -> Router<S> {
        let arena_limits = SlabLimits {
            threaded: true,
            ..self.slab_limits
        };

        Router {
            root: self.root,
            limits: self.limits,
            arena: Arena::new(&arena_limits),
        }
    }
}

/// A path-prefixed group of routes sharing an extra middleware list,
/// opened via [`RouterBuilder::group`].
pub struct Group<S: ConnectionData> {
    router: RouterBuilder<S>,
    prefix: String,
    middleware: Vec<Arc<dyn Middleware<S>>>,
}

impl<S: ConnectionData> Group<S> {
    /// Registers middleware that runs ahead of every route in this
    /// group, after the router's own global middleware.
    pub fn middleware<M: Middleware<S>>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Registers a route under this group's prefix, returning an error
    /// on a path/parameter conflict.
    pub fn try_route<M: Middleware<S>>(mut self, method: Method, path: &str, handler: M) -> Result<Self, RouteError> {
        let full_path = join_path(&self.prefix, path);
        let segments = split_segments(&full_path);
        check_route_limits(
            &self.router.limits,
            segments.len(),
            self.router.global.len() + self.middleware.len() + 1,
        )?;

        let chain = build_chain(&self.router.global, &self.middleware, Arc::new(handler));
        self.router.root.insert(&segments, method, chain)?;
        Ok(self)
    }

    /// Registers a route under this group's prefix.
    ///
    /// # Panics
    /// Panics on a path/parameter conflict, matching [`RouterBuilder::route`].
    #[track_caller]
    pub fn route<M: Middleware<S>>(self, method: Method, path: &str, handler: M) -> Self {
        let full_path = join_path(&self.prefix, path);
        match self.try_route(method, path, handler) {
            Ok(group) => group,
            Err(err) => panic!("registering {full_path:?} failed: {err}"),
        }
    }

    /// Closes the group, returning to the parent builder.
    pub fn end(self) -> RouterBuilder<S> {
        self.router
    }
}

// ROUTER

/// A radix-tree router with per-route middleware chains.
///
/// Implements [`Handler`], so it is registered with
/// [`ServerBuilder::handler`](crate::ServerBuilder::handler) exactly
/// like any other handler.
///
/// # Examples
/// ```
/// use kestrel_web::{router::{Context, Middleware, RouterBuilder}, Method, StatusCode};
/// use std::{future::Future, pin::Pin};
///
/// struct Greet;
///
/// impl Middleware for Greet {
///     fn call<'ctx, 'd>(
///         &'ctx self,
///         ctx: &'ctx mut Context<'d, ()>,
///     ) -> Pin<Box<dyn Future<Output = ()> + Send + 'ctx>> {
///         Box::pin(async move {
///             let name = ctx.param(b"name").unwrap_or(b"world");
///             ctx.response.status(StatusCode::Ok).body(name.to_vec());
///         })
///     }
/// }
///
/// let router = RouterBuilder::<()>::new()
///     .route(Method::Get, "/hello/:name", Greet)
///     .build();
/// ```
pub struct Router<S: ConnectionData = ()> {
    root: RouteNode<S>,
    limits: RouterLimits,
    arena: Arena,
}

impl<S: ConnectionData> Router<S> {
    /// Starts a [`RouterBuilder`].
    pub fn builder() -> RouterBuilder<S> {
        RouterBuilder::new()
    }
}

impl<S: ConnectionData> Handler<S> for Router<S> {
    async fn handle(&self, connection_data: &mut S, request: &Request, response: &mut Response) -> Handled {
        let segments = request.url().path_segments();

        let (chain, params) = match self.root.find(segments, request.method(), &self.arena) {
            Ok(Some(found)) => found,
            Ok(None) => {
                tracing::debug!(path = %String::from_utf8_lossy(request.url().path()), "no matching route");

                return response
                    .status(StatusCode::NotFound)
                    .header("content-type", "application/json")
                    .body(r#"{"error":"No matching route","code":"ROUTE_NOT_FOUND"}"#);
            }
            Err(ErrorKind::SlabExhausted) => {
                tracing::warn!("{}", ErrorKind::SlabExhausted);

                return response
                    .status(StatusCode::ServiceUnavailable)
                    .header("content-type", "application/json")
                    .body(r#"{"error":"Allocator capacity exhausted","code":"SLAB_EXHAUSTED"}"#);
            }
            Err(_) => unreachable!("Router::find only ever fails with SlabExhausted"),
        };

        let mut ctx = Context {
            connection_data,
            request,
            response: &mut *response,
            params: params.as_slice(),
            chain: &chain[..],
            index: 0,
            aborted: false,
            deferred: None,
        };

        ctx.next().await;
        let deferred = ctx.deferred.take();

        if let Some(rx) = deferred {
            match rx.await {
                Ok(build) => build(response),
                Err(_) => {
                    tracing::warn!("{}", ErrorKind::DeferredOnClosedConnection);
                    response
                        .status(StatusCode::ServiceUnavailable)
                        .body("deferred response was never finished");
                }
            }
        }

        if accepts_gzip(request) {
            response.try_gzip_encode(self.limits.gzip_min_body_len);
        }

        response.assert_complete()
    }

    async fn handle_ws(
        &self,
        connection_data: &mut S,
        request: &Request,
        stream: &mut TcpStream,
        buffer: &mut [u8],
        arena: &Arena,
    ) {
        let segments = request.url().path_segments();

        let Ok(Some((chain, _params))) = self.root.find(segments, request.method(), &self.arena) else {
            return;
        };

        if let Some(terminal) = chain.last() {
            terminal.call_ws(connection_data, request, stream, buffer, arena).await;
        }
    }
}

fn accepts_gzip(request: &Request) -> bool {
    let Some(header) = request.header(b"accept-encoding") else {
        return false;
    };

    header.split(|&b| b == b',').any(|token| {
        let token = token.split(|&b| b == b';').next().unwrap_or(token);
        let token = trim_ascii_ws(token);
        token.eq_ignore_ascii_case(b"gzip")
    })
}

fn trim_ascii_ws(mut src: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = src {
        src = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = src {
        src = rest;
    }
    src
}

pub(crate) fn gzip_compress(data: &[u8]) -> Option<Vec<u8>> {
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write as _;

    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 16), Compression::default());
    encoder.write_all(data).ok()?;
    encoder.finish().ok()
}



#[cfg(test)]
mod dispatch_tests {
    use super::*;

    struct First;
    impl Middleware for First {
        fn call<'ctx, 'd>(&'ctx self, ctx: &'ctx mut Context<'d, ()>) -> Pin<Box<dyn Future<Output = ()> + Send + 'ctx>> {
            Box::pin(async move {
                ctx.next().await;
            })
        }
    }

    struct Echo;
    impl Middleware for Echo {
        fn call<'ctx, 'd>(&'ctx self, ctx: &'ctx mut Context<'d, ()>) -> Pin<Box<dyn Future<Output = ()> + Send + 'ctx>> {
            Box::pin(async move {
                let id = ctx.param(b"id").unwrap_or(b"?").to_vec();
                ctx.response.status(StatusCode::Ok).body(id);
            })
        }
    }

    struct Blocker;
    impl Middleware for Blocker {
        fn call<'ctx, 'd>(&'ctx self, ctx: &'ctx mut Context<'d, ()>) -> Pin<Box<dyn Future<Output = ()> + Send + 'ctx>> {
            Box::pin(async move {
                ctx.response.status(StatusCode::Forbidden).body("no");
            })
        }
    }

    #[tokio::test]
    async fn routes_and_captures_params() {
        use crate::server::connection::HttpConnection;

        let router = Router::<()>::builder()
            .route(Method::Get, "/users/:id", Echo)
            .build();

        let mut t = HttpConnection::from_req("GET /users/7 HTTP/1.1\r\n\r\n");
        t.parse().unwrap();
        let mut data = ();

        router.handle(&mut data, &t.request, &mut t.response).await;

        assert!(t.response.buffer().ends_with(b"7"));
    }

    #[tokio::test]
    async fn middleware_before_next_runs_before_terminal_handler() {
        use crate::server::connection::HttpConnection;

        let router = Router::<()>::builder()
            .middleware(First)
            .route(Method::Get, "/ping", Echo)
            .build();

        let mut t = HttpConnection::from_req("GET /ping HTTP/1.1\r\n\r\n");
        t.parse().unwrap();
        let mut data = ();

        router.handle(&mut data, &t.request, &mut t.response).await;

        assert!(t.response.buffer().starts_with(b"HTTP/1.1 200"));
    }

    #[tokio::test]
    async fn middleware_not_calling_next_short_circuits() {
        use crate::server::connection::HttpConnection;

        let router = Router::<()>::builder()
            .middleware(Blocker)
            .route(Method::Get, "/ping", Echo)
            .build();

        let mut t = HttpConnection::from_req("GET /ping HTTP/1.1\r\n\r\n");
        t.parse().unwrap();
        let mut data = ();

        router.handle(&mut data, &t.request, &mut t.response).await;

        assert!(t.response.buffer().starts_with(b"HTTP/1.1 403"));
    }

    #[tokio::test]
    async fn unmatched_route_yields_404() {
        use crate::server::connection::HttpConnection;

        let router = Router::<()>::builder().build();

        let mut t = HttpConnection::from_req("GET /missing HTTP/1.1\r\n\r\n");
        t.parse().unwrap();
        let mut data = ();

        router.handle(&mut data, &t.request, &mut t.response).await;

        assert!(t.response.buffer().starts_with(b"HTTP/1.1 404"));
    }
}
