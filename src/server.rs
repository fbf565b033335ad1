//! The session server.
//!
//! [`SessionHub`] holds the protocol: the archive index, the authoritative
//! options and the data reduced with them, and what each connection has
//! been told. It never touches a socket. [`Server`] is the `mio` event loop
//! that moves frames between sockets and the hub.
//!
//! Requests are handled one at a time in the order they arrive. A long
//! reduction holds up every other connection until it finishes.

use std::{
    collections::{BTreeMap, HashMap},
    io,
    net::SocketAddr,
    path::PathBuf,
    rc::Rc,
    time::{Duration, Instant},
};

use crossbeam_utils::atomic::AtomicCell;
use indicatif::ProgressBar;
use log::{debug, error, info, warn};
use mio::{
    net::{TcpListener, TcpStream},
    Events, Interest, Poll, Token,
};
use thiserror::Error;

use crate::{
    codec::{CodecError, OptionsSource, Request, RequestMessage, Response, ResponseMessage},
    index::ArchiveIndex,
    net::{FramedStream, ReadStatus},
    options::{AmpPhaseOptions, OptionsError},
    products::VisData,
    reduce::{reduce_with_progress, ReadMode, ReduceError, Reduction},
    ServerType,
};

pub type ConnectionId = usize;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Reduce(#[from] ReduceError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Options(#[from] OptionsError),

    #[error("Couldn't listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: io::Error,
    },

    #[error("Connection {0} doesn't exist")]
    UnknownConnection(ConnectionId),

    #[error("Couldn't install the interrupt handler: {0}")]
    Signal(#[from] ctrlc::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Where a connection is in its conversation with the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    ServerTypeAnnounced,
    Streaming,
    Closed,
}

#[derive(Debug)]
struct Connection {
    client_id: String,
    username: Option<String>,
    state: ConnectionState,
}

/// A response and the connection it goes to.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub to: ConnectionId,
    pub message: ResponseMessage,
}

pub struct SessionHub {
    files: Vec<PathBuf>,
    index: ArchiveIndex,
    server_type: ServerType,

    /// The options everything in `snapshot` was reduced with.
    authoritative: Rc<AmpPhaseOptions>,
    /// Who supplied `authoritative`, if anyone has.
    author: Option<String>,
    /// Bumped whenever `authoritative` is replaced.
    generation: u64,

    snapshot: Rc<VisData>,
    snapshot_generation: u64,

    connections: BTreeMap<ConnectionId, Connection>,
    next_connection: ConnectionId,

    progress: Option<ProgressBar>,
}

impl SessionHub {
    /// Index the files and reduce them with default options.
    pub fn new(
        files: Vec<PathBuf>,
        server_type: ServerType,
        progress: Option<ProgressBar>,
    ) -> Result<SessionHub, ServerError> {
        info!("Indexing {} file(s)", files.len());
        if let Some(p) = &progress {
            p.set_length(files.len() as u64);
            p.set_message("Indexing");
        }
        let index = ArchiveIndex::build_with_progress(&files, progress.as_ref());
        for skipped in &index.skipped {
            warn!("Not serving {}", skipped.display());
        }

        let mut options = AmpPhaseOptions::default();
        for header in index.headers() {
            options.ensure_windows(header);
        }
        let options = Rc::new(options);

        let mut hub = SessionHub {
            files,
            index,
            server_type,
            snapshot: Rc::new(VisData::new(options.clone())),
            authoritative: options,
            author: None,
            generation: 0,
            snapshot_generation: 0,
            connections: BTreeMap::new(),
            next_connection: 0,
            progress,
        };
        hub.recompute()?;
        Ok(hub)
    }

    /// Reduce every file with `options`, leaving the hub as it was.
    fn reduce_with(&mut self, options: &Rc<AmpPhaseOptions>) -> Result<VisData, ServerError> {
        if let Some(p) = &self.progress {
            p.reset();
            p.set_length(self.files.len() as u64);
            p.set_message("Reducing");
        }
        let reduction = reduce_with_progress(
            ReadMode::COMPUTE_VIS,
            &self.files,
            &mut self.index,
            None,
            options,
            self.progress.as_ref(),
        )?;
        if let Some(p) = &self.progress {
            p.finish();
        }
        Ok(reduction
            .vis
            .unwrap_or_else(|| VisData::new(options.clone())))
    }

    fn recompute(&mut self) -> Result<(), ServerError> {
        info!("Reducing with options generation {}", self.generation);
        let options = self.authoritative.clone();
        let vis = self.reduce_with(&options)?;
        info!("{} cycle(s) available", vis.num_cycles());
        self.snapshot = Rc::new(vis);
        self.snapshot_generation = self.generation;
        Ok(())
    }

    pub fn server_type(&self) -> ServerType {
        self.server_type
    }

    pub fn index(&self) -> &ArchiveIndex {
        &self.index
    }

    pub fn snapshot(&self) -> &Rc<VisData> {
        &self.snapshot
    }

    pub fn authoritative_options(&self) -> &Rc<AmpPhaseOptions> {
        &self.authoritative
    }

    pub fn author(&self) -> Option<&str> {
        self.author.as_deref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn num_connections(&self) -> usize {
        self.connections.len()
    }

    pub fn connection_state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.connections.get(&id).map(|c| c.state)
    }

    pub fn connect(&mut self) -> ConnectionId {
        let id = self.next_connection;
        self.next_connection += 1;
        self.connections.insert(
            id,
            Connection {
                client_id: String::new(),
                username: None,
                state: ConnectionState::Connected,
            },
        );
        debug!("Connection {id} opened");
        id
    }

    pub fn disconnect(&mut self, id: ConnectionId) {
        if self.connections.remove(&id).is_some() {
            debug!("Connection {id} closed");
        }
    }

    /// Tell every connection the server is going away.
    pub fn shutdown(&mut self) -> Vec<Outgoing> {
        self.connections
            .iter_mut()
            .map(|(&id, c)| {
                c.state = ConnectionState::Closed;
                Outgoing {
                    to: id,
                    message: ResponseMessage {
                        client_id: String::new(),
                        response: Response::Shutdown,
                    },
                }
            })
            .collect()
    }

    fn connection_mut(&mut self, id: ConnectionId) -> Result<&mut Connection, ServerError> {
        self.connections
            .get_mut(&id)
            .ok_or(ServerError::UnknownConnection(id))
    }

    fn reply(&self, to: ConnectionId, response: Response) -> Outgoing {
        Outgoing {
            to,
            message: ResponseMessage {
                client_id: self
                    .connections
                    .get(&to)
                    .map(|c| c.client_id.clone())
                    .unwrap_or_default(),
                response,
            },
        }
    }

    /// Handle one request, returning the responses it causes.
    pub fn handle(
        &mut self,
        from: ConnectionId,
        message: RequestMessage,
    ) -> Result<Vec<Outgoing>, ServerError> {
        let connection = self.connection_mut(from)?;
        if connection.state == ConnectionState::Closed {
            return Ok(vec![]);
        }
        connection.client_id = message.client_id;

        let mut out = vec![];
        match message.request {
            Request::ServerType => {
                debug!("Connection {from}: server type");
                let connection = self.connection_mut(from)?;
                if connection.state == ConnectionState::Connected {
                    connection.state = ConnectionState::ServerTypeAnnounced;
                }
                out.push(self.reply(from, Response::ServerType(self.server_type)));
            }

            Request::CurrentVisData | Request::ComputedVisData => {
                debug!("Connection {from}: data");
                self.connection_mut(from)?.state = ConnectionState::Streaming;
                let data = self.snapshot.clone();
                out.push(self.reply(
                    from,
                    match message.request {
                        Request::CurrentVisData => Response::CurrentVisData(data),
                        _ => Response::ComputedVisData(data),
                    },
                ));
            }

            Request::ComputeVisData(OptionsSource::UseProvided(mut options)) => {
                let username = match self.connection_mut(from)?.username.clone() {
                    Some(u) => u,
                    None => {
                        debug!("Connection {from}: options without a username");
                        out.push(self.reply(from, Response::UsernameRequired));
                        return Ok(out);
                    }
                };
                for header in self.index.headers() {
                    options.ensure_windows(header);
                }
                let options = Rc::new(options);
                let vis = match options
                    .validate()
                    .map_err(ServerError::from)
                    .and_then(|()| self.reduce_with(&options))
                {
                    Ok(vis) => vis,
                    Err(e) => {
                        warn!("Not adopting the options from {username}: {e}");
                        out.push(self.reply(from, Response::NoData));
                        return Ok(out);
                    }
                };
                info!("{username} changed the options");
                self.authoritative = options;
                self.author = Some(username.clone());
                self.generation += 1;
                info!("{} cycle(s) available", vis.num_cycles());
                self.snapshot = Rc::new(vis);
                self.snapshot_generation = self.generation;

                out.push(self.reply(from, Response::VisDataComputed));
                let others: Vec<ConnectionId> = self
                    .connections
                    .iter()
                    .filter(|(&id, c)| id != from && c.state != ConnectionState::Closed)
                    .map(|(&id, _)| id)
                    .collect();
                for id in others {
                    out.push(self.reply(
                        id,
                        Response::OptionsChanged {
                            author: username.clone(),
                        },
                    ));
                }
            }

            Request::ComputeVisData(OptionsSource::UseAuthoritative) => {
                debug!("Connection {from}: recompute with the authoritative options");
                let response = if self.snapshot_generation == self.generation {
                    Response::VisDataComputed
                } else {
                    match self.recompute() {
                        Ok(()) => Response::VisDataComputed,
                        Err(e) => {
                            warn!("Couldn't recompute: {e}");
                            Response::NoData
                        }
                    }
                };
                out.push(self.reply(from, response));
            }

            Request::SpectrumAt { mjd } => {
                debug!("Connection {from}: spectrum at MJD {mjd}");
                let reduction = reduce_with_progress(
                    ReadMode::GRAB_SPECTRUM,
                    &self.files,
                    &mut self.index,
                    Some(mjd),
                    &self.authoritative,
                    None,
                );
                let response = match reduction {
                    Ok(Reduction {
                        spectrum: Some(s), ..
                    }) => Response::Spectrum(s),
                    Ok(_) => Response::NoData,
                    Err(e) => {
                        warn!("Couldn't read a spectrum at MJD {mjd}: {e}");
                        Response::NoData
                    }
                };
                out.push(self.reply(from, response));
            }

            Request::Username(name) => {
                let name = name.trim().to_string();
                debug!("Connection {from} is {name}");
                self.connection_mut(from)?.username = Some(name);
            }
        }
        Ok(out)
    }
}

const LISTENER: Token = Token(usize::MAX);
const POLL_TIMEOUT: Duration = Duration::from_millis(250);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The event loop serving a [`SessionHub`] over TCP.
pub struct Server {
    hub: SessionHub,
    poll: Poll,
    listener: TcpListener,
    clients: HashMap<Token, FramedStream<TcpStream>>,
}

impl Server {
    pub fn bind(hub: SessionHub, addr: SocketAddr) -> Result<Server, ServerError> {
        let mut listener =
            TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        info!("Listening on {}", listener.local_addr()?);
        Ok(Server {
            hub,
            poll,
            listener,
            clients: HashMap::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> &SessionHub {
        &self.hub
    }

    /// Serve until `shutdown` is set, then tell every client and wait a
    /// little for them to hang up.
    pub fn run(&mut self, shutdown: &AtomicCell<bool>) -> Result<(), ServerError> {
        let mut events = Events::with_capacity(128);
        while !shutdown.load() {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }
            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept()?,
                    token => self.service(token),
                }
            }
            self.flush_all();
        }

        info!("Shutting down");
        let goodbyes = self.hub.shutdown();
        self.dispatch(goodbyes);
        self.flush_all();

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while !self.clients.is_empty() && Instant::now() < deadline {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    return Err(e.into());
                }
            }
            for event in events.iter() {
                let token = event.token();
                if token == LISTENER {
                    continue;
                }
                let closed = match self.clients.get_mut(&token) {
                    Some(client) => {
                        let _ = client.flush();
                        !matches!(client.read_available(), Ok(ReadStatus::Open))
                    }
                    None => false,
                };
                if closed {
                    self.drop_client(token);
                }
            }
        }
        if !self.clients.is_empty() {
            warn!(
                "{} client(s) didn't disconnect in time",
                self.clients.len()
            );
        }
        Ok(())
    }

    fn accept(&mut self) -> Result<(), ServerError> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    let id = self.hub.connect();
                    let token = Token(id);
                    self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    )?;
                    info!("Connection {id} from {addr}");
                    self.clients.insert(token, FramedStream::new(stream));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Read whatever a client sent and answer every complete request.
    fn service(&mut self, token: Token) {
        let client = match self.clients.get_mut(&token) {
            Some(c) => c,
            None => return,
        };
        let status = match client.read_available() {
            Ok(s) => s,
            Err(e) => {
                warn!("Dropping connection {}: {e}", token.0);
                self.drop_client(token);
                return;
            }
        };

        let mut requests = vec![];
        loop {
            match client.next_message::<RequestMessage>() {
                Ok(Some(r)) => requests.push(r),
                Ok(None) => break,
                Err(e) => {
                    warn!("Dropping connection {}: {e}", token.0);
                    self.drop_client(token);
                    return;
                }
            }
        }

        for request in requests {
            match self.hub.handle(token.0, request) {
                Ok(out) => self.dispatch(out),
                Err(e) => error!("Couldn't handle a request from connection {}: {e}", token.0),
            }
        }

        if status == ReadStatus::Closed {
            info!("Connection {} hung up", token.0);
            self.drop_client(token);
        }
    }

    fn dispatch(&mut self, out: Vec<Outgoing>) {
        for o in out {
            let token = Token(o.to);
            let result = match self.clients.get_mut(&token) {
                Some(client) => client.queue(&o.message),
                None => continue,
            };
            if let Err(e) = result {
                warn!("Dropping connection {}: {e}", o.to);
                self.drop_client(token);
            }
        }
    }

    fn flush_all(&mut self) {
        let failed: Vec<Token> = self
            .clients
            .iter_mut()
            .filter_map(|(&token, client)| match client.flush() {
                Ok(()) => None,
                Err(e) => {
                    warn!("Dropping connection {}: {e}", token.0);
                    Some(token)
                }
            })
            .collect();
        for token in failed {
            self.drop_client(token);
        }
    }

    fn drop_client(&mut self, token: Token) {
        if let Some(mut client) = self.clients.remove(&token) {
            let _ = self.poll.registry().deregister(client.get_mut());
        }
        self.hub.disconnect(token.0);
    }
}
