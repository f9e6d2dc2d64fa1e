//! Message router - the dispatch hub of the bus
//!
//! A single task owns every inbound socket, the route table, and the
//! control channel, and drives them from one poll loop:
//!
//! ```text
//!   agents ──► inbound socket ──┐
//!                               │        ┌──► stat sink
//!   scheduler ─► feed socket ───┼─ poll ─┼──► log sink
//!                               │  loop  ├──► heartbeat sink
//!   operator ─► control socket ─┘        └──► error sink
//! ```
//!
//! ## Concurrency
//!
//! There is no locking anywhere in the router: route-table mutation (via
//! the control protocol) and route lookup run on the same task, so they can
//! never interleave. Inbound sockets are swept with non-blocking receives;
//! when a sweep moves nothing the loop parks for one poll timeout, which
//! also bounds shutdown latency.
//!
//! ## Failure policy
//!
//! Nothing that arrives on a socket can crash the loop. Unroutable
//! envelopes go to the error socket (or are dropped and counted),
//! saturated destinations are counted and skipped, malformed control
//! requests are answered with an error reply or ignored.

pub mod control;
pub mod table;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument, trace, warn};

use crate::Envelope;
use crate::transport::{ControlSocket, MessageSocket, SocketRef};

use control::{ControlCommand, ControlReply, ParsedRequest, RouteAddParams, RouteDelParams};
use table::{
    RouteDescriptor, RouteDirection, RouteEntry, RouteSpec, RouteTable, RouterError,
};

/// How many envelopes to drain from one source per sweep. Bounds the time
/// between shutdown-flag checks under sustained load; FIFO per source is
/// preserved regardless.
const RECV_BATCH: usize = 64;

/// How many control requests to serve per sweep.
const CONTROL_BATCH: usize = 8;

/// Construction options for [`Router`].
pub struct RouterOptions {
    /// Where unroutable envelopes are forwarded. Without one they are
    /// dropped and counted.
    pub error_socket: Option<SocketRef>,

    /// Upper bound on idle parking, and therefore on shutdown latency.
    pub poll_timeout: Duration,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            error_socket: None,
            poll_timeout: Duration::from_millis(crate::util::get_default_poll_timeout_ms()),
        }
    }
}

/// Counters kept by the router loop, reported via the control protocol's
/// `stats` method and logged once on exit.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RouterStats {
    pub received: u64,
    pub forwarded: u64,
    pub unroutable: u64,
    pub dropped: u64,
    pub control_requests: u64,
    pub malformed_control: u64,
}

/// Cooperative stop signal for a running router.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    /// Request shutdown. Idempotent; observed at the top of the next loop
    /// iteration.
    pub fn shutdown(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// What the poll loop does with envelopes read from a source.
#[derive(Debug, Clone)]
enum SourceKind {
    /// Look the destination up by the envelope's `to` key.
    Dispatch,

    /// Forward everything to the feed route registered under this key.
    Feed { key: crate::RouteKey },
}

struct Source {
    socket: SocketRef,
    kind: SourceKind,
}

/// The router. See the module docs for the big picture.
pub struct Router {
    id: String,
    table: RouteTable,
    sources: Vec<Source>,
    registry: HashMap<String, SocketRef>,
    control: Option<Box<dyn ControlSocket>>,
    error_socket: Option<SocketRef>,
    poll_timeout: Duration,
    shutdown: Arc<AtomicBool>,
    stats: RouterStats,
}

impl Router {
    /// Create a router. No side effects: sockets are handed in already
    /// wired, `id` is used only for diagnostics.
    pub fn new(id: impl Into<String>, options: RouterOptions) -> Self {
        Self {
            id: id.into(),
            table: RouteTable::new(),
            sources: Vec::new(),
            registry: HashMap::new(),
            control: None,
            error_socket: options.error_socket,
            poll_timeout: options.poll_timeout,
            shutdown: Arc::new(AtomicBool::new(false)),
            stats: RouterStats::default(),
        }
    }

    /// Make a socket addressable by name from the control protocol.
    ///
    /// `route_add`/`route_del` requests carry socket names, not socket
    /// handles; only registered sockets can be referenced.
    pub fn register_socket(&mut self, socket: SocketRef) {
        let name = socket.name().to_string();
        if self.registry.insert(name.clone(), socket).is_some() {
            warn!("socket {name} re-registered, replacing previous entry");
        }
    }

    /// Install a route.
    ///
    /// The source socket joins the poll set if it is not in it yet. A
    /// source serves either dispatch-style or feed-style traffic, never
    /// both, and a feed source carries exactly one feed route.
    pub fn route(&mut self, spec: RouteSpec) -> Result<RouteEntry, RouterError> {
        let kind = match (&spec.to, &spec.from) {
            (Some(_), None) => SourceKind::Dispatch,
            (None, Some(key)) => SourceKind::Feed { key: key.clone() },
            // Let the table report the precise spec error.
            _ => {
                return self.table.insert(spec);
            }
        };

        if let Some(existing) = self
            .sources
            .iter()
            .find(|source| Arc::ptr_eq(&source.socket, &spec.src))
        {
            match (&existing.kind, &kind) {
                (SourceKind::Dispatch, SourceKind::Dispatch) => {}
                (SourceKind::Feed { .. }, SourceKind::Feed { .. }) => {
                    return Err(RouterError::InvalidSpec(format!(
                        "source {} already has a feed route",
                        spec.src.name()
                    )));
                }
                _ => {
                    return Err(RouterError::InvalidSpec(format!(
                        "source {} cannot mix dispatch and feed routes",
                        spec.src.name()
                    )));
                }
            }
        }

        let src = spec.src.clone();
        let entry = self.table.insert(spec)?;

        if !self
            .sources
            .iter()
            .any(|source| Arc::ptr_eq(&source.socket, &src))
        {
            trace!("registering source {} with the poller", src.name());
            self.sources.push(Source { socket: src, kind });
        }

        debug!(
            "route installed: {}={} -> {}",
            entry.direction,
            entry.key,
            entry.dest.name()
        );

        Ok(entry)
    }

    /// Read-only snapshot of the route table.
    pub fn routes(&self) -> Vec<RouteDescriptor> {
        self.table.descriptors()
    }

    /// Register the control channel serviced by the poll loop. Calling
    /// again replaces the previous registration.
    pub fn control(&mut self, socket: Box<dyn ControlSocket>) {
        if self.control.replace(socket).is_some() {
            debug!("control socket replaced");
        }
    }

    /// Request shutdown; observed at the top of the next loop iteration.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Handle for requesting shutdown from outside the loop.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Run the poll/dispatch loop until shutdown is requested.
    ///
    /// Consumes the router; on exit every socket it ever touched is closed
    /// exactly once and the final counters are returned.
    #[instrument(skip(self), fields(router = %self.id))]
    pub async fn run(mut self) -> RouterStats {
        debug!(
            "starting router loop ({} routes, poll timeout {:?})",
            self.table.len(),
            self.poll_timeout
        );

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                debug!("shutdown flag observed");
                break;
            }

            let mut busy = false;

            // Sweep message sources. Indexed iteration because dispatch
            // needs &mut self for the counters.
            for i in 0..self.sources.len() {
                let socket = self.sources[i].socket.clone();
                let kind = self.sources[i].kind.clone();

                for _ in 0..RECV_BATCH {
                    match socket.try_recv() {
                        Ok(Some(envelope)) => {
                            busy = true;
                            self.stats.received += 1;
                            self.dispatch(&kind, envelope);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            trace!("receive on {} failed: {e}", socket.name());
                            break;
                        }
                    }
                }
            }

            // Service the control channel from the same task, so table
            // mutation never races a lookup.
            if let Some(control_socket) = self.control.take() {
                for _ in 0..CONTROL_BATCH {
                    let body = match control_socket.try_recv() {
                        Ok(Some(body)) => body,
                        Ok(None) => break,
                        Err(e) => {
                            trace!("control receive failed: {e}");
                            break;
                        }
                    };

                    busy = true;
                    self.stats.control_requests += 1;

                    if let Some(reply) = self.handle_control(&body) {
                        if let Err(e) = control_socket.send(reply).await {
                            warn!("failed to send control reply: {e}");
                        }
                    }
                }
                self.control = Some(control_socket);
            }

            if busy {
                // Stay responsive to other tasks under sustained load.
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.poll_timeout).await;
            }
        }

        self.close_all();

        info!(
            "router stopped: received={} forwarded={} unroutable={} dropped={}",
            self.stats.received, self.stats.forwarded, self.stats.unroutable, self.stats.dropped
        );

        self.stats
    }

    /// Route one envelope read from a source.
    fn dispatch(&mut self, kind: &SourceKind, envelope: Envelope) {
        let entry = match kind {
            SourceKind::Dispatch => self.table.lookup(RouteDirection::Outgoing, &envelope.to),
            SourceKind::Feed { key } => self.table.lookup(RouteDirection::Incoming, key),
        };

        match entry {
            Some(entry) => {
                let dest = entry.dest.clone();
                self.forward(&dest, envelope);
            }
            None => self.unroutable(envelope),
        }
    }

    fn forward(&mut self, dest: &SocketRef, envelope: Envelope) {
        match dest.try_send(envelope) {
            Ok(()) => self.stats.forwarded += 1,
            Err(e) => {
                // Transient: the sender resends unacknowledged envelopes.
                self.stats.dropped += 1;
                warn!("send to {} failed: {e}", dest.name());
            }
        }
    }

    fn unroutable(&mut self, envelope: Envelope) {
        self.stats.unroutable += 1;

        match &self.error_socket {
            Some(error_socket) => {
                trace!("no route for {}, forwarding to error socket", envelope.to);
                if let Err(e) = error_socket.try_send(envelope) {
                    self.stats.dropped += 1;
                    warn!("send to error socket failed: {e}");
                }
            }
            None => {
                debug!("no route for {}, dropping", envelope.to);
            }
        }
    }

    /// Decode and serve one control request; `None` means no reply is owed.
    fn handle_control(&mut self, body: &str) -> Option<String> {
        match control::parse_request(body) {
            ParsedRequest::Ok(request) => {
                let reply = self.handle_command(request.command, request.id);
                Some(reply.to_json())
            }
            ParsedRequest::Invalid { error, id } => {
                self.stats.malformed_control += 1;
                warn!("bad control request: {error}");
                Some(ControlReply::err(error, id).to_json())
            }
            ParsedRequest::Unparsable(e) => {
                self.stats.malformed_control += 1;
                warn!("unparsable control request, ignoring: {e}");
                None
            }
        }
    }

    fn handle_command(&mut self, command: ControlCommand, id: serde_json::Value) -> ControlReply {
        match command {
            ControlCommand::Shutdown => {
                debug!("shutdown requested via control channel");
                self.shutdown();
                ControlReply::ok("Shutting down.", id)
            }

            ControlCommand::RouteAdd(params) => match self.route_from_params(params) {
                Ok(descriptor) => ControlReply::ok(descriptor, id),
                Err(e) => ControlReply::err(e, id),
            },

            ControlCommand::RouteDel(params) => match self.unroute_from_params(params) {
                Ok(descriptor) => ControlReply::ok(descriptor, id),
                Err(e) => ControlReply::err(e, id),
            },

            ControlCommand::RouteDump => ControlReply::ok(self.table.descriptors(), id),

            ControlCommand::Stats => ControlReply::ok(self.stats.clone(), id),
        }
    }

    fn route_from_params(&mut self, params: RouteAddParams) -> Result<RouteDescriptor, RouterError> {
        let src = self.resolve_socket(&params.src)?;
        let dest = self.resolve_socket(&params.dest)?;

        let entry = self.route(RouteSpec {
            to: params.to,
            from: params.from,
            src,
            dest,
            static_route: params.static_route,
        })?;

        Ok(entry.descriptor())
    }

    fn unroute_from_params(
        &mut self,
        params: RouteDelParams,
    ) -> Result<RouteDescriptor, RouterError> {
        let (direction, key) = match (params.to, params.from) {
            (Some(key), None) => (RouteDirection::Outgoing, key),
            (None, Some(key)) => (RouteDirection::Incoming, key),
            _ => {
                return Err(RouterError::InvalidSpec(
                    "route_del needs exactly one of `to` or `from`".to_string(),
                ));
            }
        };

        let entry = self.table.remove(direction, &key)?;

        // Sources with no remaining routes leave the poll set.
        let table = &self.table;
        self.sources
            .retain(|source| table.references_source(&source.socket));

        debug!("route removed: {direction}={key}");

        Ok(entry.descriptor())
    }

    fn resolve_socket(&self, name: &str) -> Result<SocketRef, RouterError> {
        self.registry
            .get(name)
            .cloned()
            .ok_or_else(|| RouterError::UnknownSocket(name.to_string()))
    }

    /// Close every socket the router touched, each exactly once.
    fn close_all(&mut self) {
        let mut seen: Vec<SocketRef> = Vec::new();

        let note = |socket: &SocketRef, seen: &mut Vec<SocketRef>| {
            if !seen.iter().any(|s| Arc::ptr_eq(s, socket)) {
                seen.push(socket.clone());
            }
        };

        for source in &self.sources {
            note(&source.socket, &mut seen);
        }
        for entry in self.table.iter() {
            note(&entry.src, &mut seen);
            note(&entry.dest, &mut seen);
        }
        for socket in self.registry.values() {
            note(socket, &mut seen);
        }
        if let Some(error_socket) = &self.error_socket {
            note(error_socket, &mut seen);
        }

        debug!("closing {} sockets", seen.len());
        for socket in seen {
            socket.close();
        }
    }
}
