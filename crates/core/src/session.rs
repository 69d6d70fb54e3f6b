//! Session state owned by the UI loop.
//!
//! Every backend operation runs on a spawned task and reports back through a
//! [`SessionMessage`] tagged with the connection generation (and, for query
//! work, the tab and run it belongs to). [`Session::apply`] checks those tags
//! before touching any state, so completions that arrive after a reconnect, a
//! re-run or a closed tab are dropped instead of corrupting what is on screen.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::cancellation::CancellationToken;
use crate::connection_manager::{
    establish, Connection, ConnectionManager, ConnectionStatus, Connector,
};
use crate::pagination::{ColumnMetadata, FetchDirection, FetchOutcome, QueryRow, SharedIterator};
use crate::profiles::ConnectionProfile;
use crate::query_runner::{
    BufferedResult, ErrorKind, ExecutionHandle, ExecutionLimits, ExecutionOutcome, QueryRunner,
};
use crate::results_buffer::DisplayBuffer;
use crate::schema_cache::SchemaCatalog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TabId(u64);

impl TabId {
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RunId(u64);

impl RunId {
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }

    fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ConnectionGeneration(u64);

impl ConnectionGeneration {
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }

    fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryTag {
    pub generation: ConnectionGeneration,
    pub tab_id: TabId,
    pub run_id: RunId,
}

pub enum SessionMessage {
    Connected {
        generation: ConnectionGeneration,
        attempt: u64,
        profile: ConnectionProfile,
        connection: Arc<dyn Connection>,
        latency: Duration,
    },
    ConnectFailed {
        generation: ConnectionGeneration,
        attempt: u64,
        message: String,
    },
    SchemaLoaded {
        generation: ConnectionGeneration,
        schema: SchemaCatalog,
    },
    SchemaLoadFailed {
        generation: ConnectionGeneration,
        message: String,
    },
    QueryStarted {
        tag: QueryTag,
        sql: String,
    },
    QueryResult {
        tag: QueryTag,
        result: BufferedResult,
    },
    QueryStreaming {
        tag: QueryTag,
        iterator: SharedIterator,
    },
    QueryError {
        tag: QueryTag,
        kind: ErrorKind,
        message: String,
    },
    FetchedPage {
        tag: QueryTag,
        iterator: SharedIterator,
        direction: FetchDirection,
        outcome: FetchOutcome,
    },
    FetchError {
        tag: QueryTag,
        iterator: SharedIterator,
        kind: ErrorKind,
        message: String,
        connection_lost: bool,
    },
}

impl SessionMessage {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::ConnectFailed { .. } => "connect_failed",
            Self::SchemaLoaded { .. } => "schema_loaded",
            Self::SchemaLoadFailed { .. } => "schema_load_failed",
            Self::QueryStarted { .. } => "query_started",
            Self::QueryResult { .. } => "query_result",
            Self::QueryStreaming { .. } => "query_streaming",
            Self::QueryError { .. } => "query_error",
            Self::FetchedPage { .. } => "fetched_page",
            Self::FetchError { .. } => "fetch_error",
        }
    }

    #[must_use]
    pub fn generation(&self) -> ConnectionGeneration {
        match self {
            Self::Connected { generation, .. }
            | Self::ConnectFailed { generation, .. }
            | Self::SchemaLoaded { generation, .. }
            | Self::SchemaLoadFailed { generation, .. } => *generation,
            Self::QueryStarted { tag, .. }
            | Self::QueryResult { tag, .. }
            | Self::QueryStreaming { tag, .. }
            | Self::QueryError { tag, .. }
            | Self::FetchedPage { tag, .. }
            | Self::FetchError { tag, .. } => tag.generation,
        }
    }

    #[must_use]
    pub fn tag(&self) -> Option<QueryTag> {
        match self {
            Self::QueryStarted { tag, .. }
            | Self::QueryResult { tag, .. }
            | Self::QueryStreaming { tag, .. }
            | Self::QueryError { tag, .. }
            | Self::FetchedPage { tag, .. }
            | Self::FetchError { tag, .. } => Some(*tag),
            _ => None,
        }
    }

    fn connect_attempt(&self) -> Option<u64> {
        match self {
            Self::Connected { attempt, .. } | Self::ConnectFailed { attempt, .. } => {
                Some(*attempt)
            }
            _ => None,
        }
    }

    fn page_iterator(&self) -> Option<&SharedIterator> {
        match self {
            Self::FetchedPage { iterator, .. } | Self::FetchError { iterator, .. } => {
                Some(iterator)
            }
            _ => None,
        }
    }

    fn completes_execution(&self) -> bool {
        matches!(
            self,
            Self::QueryResult { .. } | Self::QueryStreaming { .. } | Self::QueryError { .. }
        )
    }
}

impl fmt::Debug for SessionMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionMessage")
            .field("kind", &self.name())
            .field("generation", &self.generation())
            .field("tag", &self.tag())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    StaleGeneration,
    StaleConnectAttempt,
    UnknownTab,
    StaleRun,
    StaleIterator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Accepted,
    Discarded(DiscardReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TabState {
    Idle,
    Running,
    Streaming {
        end_of_data: bool,
    },
    Buffered {
        rows_affected: Option<u64>,
        truncated: bool,
        elapsed: Duration,
    },
    Failed {
        kind: ErrorKind,
        message: String,
    },
}

#[derive(Debug)]
pub struct QueryTab {
    id: TabId,
    title: String,
    sql: String,
    run_id: RunId,
    state: TabState,
    columns: Vec<ColumnMetadata>,
    buffer: DisplayBuffer<QueryRow>,
    execution: Option<Arc<ExecutionHandle>>,
    iterator: Option<SharedIterator>,
    fetch_in_flight: bool,
    notice: Option<String>,
}

impl QueryTab {
    fn new(id: TabId) -> Self {
        Self {
            id,
            title: format!("Query {id}"),
            sql: String::new(),
            run_id: RunId::default(),
            state: TabState::Idle,
            columns: Vec::new(),
            buffer: DisplayBuffer::default(),
            execution: None,
            iterator: None,
            fetch_in_flight: false,
            notice: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> TabId {
        self.id
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    #[must_use]
    pub fn state(&self) -> &TabState {
        &self.state
    }

    #[must_use]
    pub fn columns(&self) -> &[ColumnMetadata] {
        &self.columns
    }

    #[must_use]
    pub fn buffer(&self) -> &DisplayBuffer<QueryRow> {
        &self.buffer
    }

    #[must_use]
    pub fn has_open_result(&self) -> bool {
        self.iterator.is_some()
    }

    #[must_use]
    pub fn fetch_in_flight(&self) -> bool {
        self.fetch_in_flight
    }

    #[must_use]
    pub fn notice(&self) -> Option<&str> {
        self.notice.as_deref()
    }

    /// The iterator currently backing this tab, if a result is being paged.
    #[must_use]
    pub fn iterator(&self) -> Option<&SharedIterator> {
        self.iterator.as_ref()
    }

    /// Cancels the running execution and releases the open iterator, if any.
    fn abandon_run(&mut self, runtime: &Handle) {
        if let Some(execution) = self.execution.take() {
            execution.cancel();
        }
        if let Some(iterator) = self.iterator.take() {
            close_in_background(runtime, iterator);
        }
        self.fetch_in_flight = false;
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("not connected")]
    NotConnected,
    #[error("tab {0} does not exist")]
    UnknownTab(TabId),
    #[error("tab {0} has no open result to page through")]
    NoOpenResult(TabId),
    #[error("a page fetch is already in flight for tab {0}")]
    FetchInFlight(TabId),
    #[error("statement is empty")]
    EmptyStatement,
}

/// All mutable client state, owned by a single loop.
pub struct Session {
    connector: Arc<dyn Connector>,
    runtime: Handle,
    tx: UnboundedSender<SessionMessage>,
    generation: ConnectionGeneration,
    connect_attempt: u64,
    connections: ConnectionManager,
    schema: Option<SchemaCatalog>,
    schema_load: Option<CancellationToken>,
    tabs: BTreeMap<TabId, QueryTab>,
    next_tab: u64,
    executing_tab: Option<TabId>,
    status_line: String,
}

impl Session {
    /// Creates a session and the receiving end of its message channel.
    /// Background work is spawned on `runtime`.
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        runtime: Handle,
        limits: ExecutionLimits,
    ) -> (Self, UnboundedReceiver<SessionMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Self {
            connector,
            runtime,
            tx,
            generation: ConnectionGeneration::default(),
            connect_attempt: 0,
            connections: ConnectionManager::new(limits),
            schema: None,
            schema_load: None,
            tabs: BTreeMap::new(),
            next_tab: 0,
            executing_tab: None,
            status_line: "not connected".to_string(),
        };
        (session, rx)
    }

    #[must_use]
    pub fn generation(&self) -> ConnectionGeneration {
        self.generation
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.connections.status()
    }

    #[must_use]
    pub fn status_line(&self) -> &str {
        &self.status_line
    }

    #[must_use]
    pub fn schema(&self) -> Option<&SchemaCatalog> {
        self.schema.as_ref()
    }

    #[must_use]
    pub fn executing_tab(&self) -> Option<TabId> {
        self.executing_tab
    }

    #[must_use]
    pub fn tab(&self, tab_id: TabId) -> Option<&QueryTab> {
        self.tabs.get(&tab_id)
    }

    pub fn tabs(&self) -> impl Iterator<Item = &QueryTab> {
        self.tabs.values()
    }

    #[must_use]
    pub fn tab_ids(&self) -> Vec<TabId> {
        self.tabs.keys().copied().collect()
    }

    #[must_use]
    pub fn active_profile(&self) -> Option<&ConnectionProfile> {
        self.connections.active_profile()
    }

    /// The runner bound to the active connection, for work that bypasses tabs.
    pub fn runner(&self) -> Result<Arc<QueryRunner>, SessionError> {
        self.connections
            .runner()
            .map_err(|_| SessionError::NotConnected)
    }

    /// Starts connecting in the background. Only the latest attempt can win.
    pub fn connect(&mut self, profile: ConnectionProfile) {
        self.connect_attempt += 1;
        let attempt = self.connect_attempt;
        let generation = self.generation;
        let connector = Arc::clone(&self.connector);
        let tx = self.tx.clone();

        info!(profile = %profile.name, attempt, "connecting");
        self.status_line = format!("connecting to {}", profile.display_target());
        self.runtime.spawn(async move {
            let message = match establish(connector.as_ref(), &profile).await {
                Ok((connection, latency)) => SessionMessage::Connected {
                    generation,
                    attempt,
                    profile,
                    connection,
                    latency,
                },
                Err(error) => SessionMessage::ConnectFailed {
                    generation,
                    attempt,
                    message: error.to_string(),
                },
            };
            post(&tx, message);
        });
    }

    /// Drops the active connection. Everything still in flight becomes stale.
    pub fn disconnect(&mut self) {
        self.teardown_connection();
        self.cancel_schema_load();
        self.schema = None;
        self.generation = self.generation.next();
        self.status_line = "disconnected".to_string();
        info!(generation = self.generation.get(), "disconnected");
    }

    pub fn open_tab(&mut self) -> TabId {
        self.next_tab += 1;
        let tab_id = TabId(self.next_tab);
        self.tabs.insert(tab_id, QueryTab::new(tab_id));
        tab_id
    }

    pub fn close_tab(&mut self, tab_id: TabId) -> Result<(), SessionError> {
        let mut tab = self
            .tabs
            .remove(&tab_id)
            .ok_or(SessionError::UnknownTab(tab_id))?;
        // `executing_tab` stays set until the cancelled run reports back.
        tab.abandon_run(&self.runtime);
        debug!(tab = tab_id.get(), "tab closed");
        Ok(())
    }

    pub fn execute_query(&mut self, tab_id: TabId, sql: &str) -> Result<QueryTag, SessionError> {
        let sql = sql.trim();
        if sql.is_empty() {
            return Err(SessionError::EmptyStatement);
        }
        let runner = self
            .connections
            .runner()
            .map_err(|_| SessionError::NotConnected)?;
        let tab = self
            .tabs
            .get_mut(&tab_id)
            .ok_or(SessionError::UnknownTab(tab_id))?;

        tab.abandon_run(&self.runtime);
        tab.run_id = tab.run_id.next();
        tab.sql = sql.to_string();
        tab.state = TabState::Running;
        tab.columns.clear();
        tab.buffer.clear();
        tab.notice = None;

        let handle = Arc::new(ExecutionHandle::new());
        tab.execution = Some(Arc::clone(&handle));
        let tag = QueryTag {
            generation: self.generation,
            tab_id,
            run_id: tab.run_id,
        };
        self.executing_tab = Some(tab_id);
        info!(tab = tab_id.get(), run = tag.run_id.get(), "executing statement");

        let tx = self.tx.clone();
        let sql = sql.to_string();
        self.runtime.spawn(async move {
            post(
                &tx,
                SessionMessage::QueryStarted {
                    tag,
                    sql: sql.clone(),
                },
            );
            let message = match runner.execute(&sql, handle).await {
                Ok(ExecutionOutcome::Streaming(iterator)) => {
                    SessionMessage::QueryStreaming { tag, iterator }
                }
                Ok(ExecutionOutcome::Buffered(result)) => SessionMessage::QueryResult { tag, result },
                Err(error) => SessionMessage::QueryError {
                    tag,
                    kind: error.kind(),
                    message: error.to_string(),
                },
            };
            post(&tx, message);
        });
        Ok(tag)
    }

    pub fn fetch_next_page(&mut self, tab_id: TabId) -> Result<(), SessionError> {
        self.fetch_page(tab_id, FetchDirection::Forward)
    }

    pub fn fetch_prev_page(&mut self, tab_id: TabId) -> Result<(), SessionError> {
        self.fetch_page(tab_id, FetchDirection::Backward)
    }

    /// Cancels the tab's running execution or in-flight fetch.
    /// Returns `false` when there was nothing to cancel.
    pub fn cancel_query(&mut self, tab_id: TabId) -> Result<bool, SessionError> {
        let tab = self
            .tabs
            .get_mut(&tab_id)
            .ok_or(SessionError::UnknownTab(tab_id))?;

        let mut cancelled = false;
        if let Some(execution) = &tab.execution {
            execution.cancel();
            cancelled = true;
        }
        if tab.fetch_in_flight {
            if let Some(iterator) = &tab.iterator {
                iterator.cancel_fetch();
                cancelled = true;
            }
        }
        if cancelled {
            info!(tab = tab_id.get(), "cancellation requested");
        }
        Ok(cancelled)
    }

    /// Applies one completion message, or discards it when its tags are stale.
    pub fn apply(&mut self, message: SessionMessage) -> Applied {
        if let Some(reason) = self.discard_reason(&message) {
            debug!(message = message.name(), ?reason, "discarding stale message");
            self.release_discarded(message);
            return Applied::Discarded(reason);
        }

        match message {
            SessionMessage::Connected {
                profile,
                connection,
                latency,
                ..
            } => self.on_connected(profile, connection, latency),
            SessionMessage::ConnectFailed { message, .. } => {
                warn!(%message, "connection failed");
                self.status_line = format!("connection failed: {message}");
            }
            SessionMessage::SchemaLoaded { schema, .. } => {
                info!(tables = schema.table_count(), "schema loaded");
                self.schema = Some(schema);
                self.schema_load = None;
            }
            SessionMessage::SchemaLoadFailed { message, .. } => {
                warn!(%message, "schema load failed");
                self.schema_load = None;
            }
            SessionMessage::QueryStarted { tag, sql } => {
                debug!(tab = tag.tab_id.get(), statement = %sql, "query started");
            }
            SessionMessage::QueryResult { tag, result } => self.on_query_result(tag, result),
            SessionMessage::QueryStreaming { tag, iterator } => {
                self.on_query_streaming(tag, iterator);
            }
            SessionMessage::QueryError { tag, kind, message } => {
                self.finish_execution(tag.tab_id);
                if let Some(tab) = self.tabs.get_mut(&tag.tab_id) {
                    tab.state = TabState::Failed { kind, message };
                }
            }
            SessionMessage::FetchedPage {
                tag,
                direction,
                outcome,
                ..
            } => self.on_fetched_page(tag, direction, outcome),
            SessionMessage::FetchError {
                tag,
                kind,
                message,
                connection_lost,
                ..
            } => self.on_fetch_error(tag, kind, &message, connection_lost),
        }
        Applied::Accepted
    }

    fn discard_reason(&mut self, message: &SessionMessage) -> Option<DiscardReason> {
        if message.generation() != self.generation {
            return Some(DiscardReason::StaleGeneration);
        }
        if let Some(attempt) = message.connect_attempt() {
            if attempt != self.connect_attempt {
                return Some(DiscardReason::StaleConnectAttempt);
            }
        }

        let tag = message.tag()?;
        let Some(tab) = self.tabs.get(&tag.tab_id) else {
            if message.completes_execution() && self.executing_tab == Some(tag.tab_id) {
                self.executing_tab = None;
            }
            return Some(DiscardReason::UnknownTab);
        };
        if tag.run_id != tab.run_id {
            return Some(DiscardReason::StaleRun);
        }
        if let Some(carried) = message.page_iterator() {
            let current = tab
                .iterator
                .as_ref()
                .is_some_and(|iterator| iterator.same_as(carried));
            if !current {
                return Some(DiscardReason::StaleIterator);
            }
        }
        None
    }

    fn release_discarded(&self, message: SessionMessage) {
        match message {
            SessionMessage::Connected { connection, .. } => {
                disconnect_in_background(&self.runtime, connection);
            }
            SessionMessage::QueryStreaming { iterator, .. } => {
                close_in_background(&self.runtime, iterator);
            }
            SessionMessage::FetchedPage { tag, iterator, .. }
            | SessionMessage::FetchError { tag, iterator, .. } => {
                let current = self
                    .tabs
                    .get(&tag.tab_id)
                    .and_then(|tab| tab.iterator.as_ref())
                    .is_some_and(|active| active.same_as(&iterator));
                if !current {
                    close_in_background(&self.runtime, iterator);
                }
            }
            _ => {}
        }
    }

    fn on_connected(
        &mut self,
        profile: ConnectionProfile,
        connection: Arc<dyn Connection>,
        latency: Duration,
    ) {
        self.teardown_connection();
        self.cancel_schema_load();
        self.schema = None;
        let target = profile.display_target();
        self.connections.install(profile, connection, latency);
        self.generation = self.generation.next();
        self.status_line = format!(
            "connected to {target} ({} ms)",
            latency.as_millis()
        );
        self.start_schema_load();
    }

    fn teardown_connection(&mut self) {
        for tab in self.tabs.values_mut() {
            let was_running = tab.execution.is_some();
            tab.abandon_run(&self.runtime);
            if was_running {
                tab.state = TabState::Failed {
                    kind: ErrorKind::Cancelled,
                    message: "connection closed".to_string(),
                };
            }
        }
        self.executing_tab = None;
        if let Some(connection) = self.connections.detach() {
            disconnect_in_background(&self.runtime, connection);
        }
    }

    fn cancel_schema_load(&mut self) {
        if let Some(token) = self.schema_load.take() {
            token.cancel();
        }
    }

    fn start_schema_load(&mut self) {
        let Some(connection) = self.connections.connection() else {
            return;
        };
        let token = CancellationToken::new();
        self.schema_load = Some(token.clone());
        let generation = self.generation;
        let tx = self.tx.clone();

        self.runtime.spawn(async move {
            let message = tokio::select! {
                biased;
                () = token.cancelled() => {
                    debug!(generation = generation.get(), "schema load cancelled");
                    return;
                }
                result = connection.fetch_schema() => match result {
                    Ok(schema) => SessionMessage::SchemaLoaded { generation, schema },
                    Err(error) => SessionMessage::SchemaLoadFailed {
                        generation,
                        message: error.to_string(),
                    },
                },
            };
            post(&tx, message);
        });
    }

    fn finish_execution(&mut self, tab_id: TabId) {
        if self.executing_tab == Some(tab_id) {
            self.executing_tab = None;
        }
        if let Some(tab) = self.tabs.get_mut(&tab_id) {
            tab.execution = None;
        }
    }

    fn on_query_result(&mut self, tag: QueryTag, result: BufferedResult) {
        self.finish_execution(tag.tab_id);
        let Some(tab) = self.tabs.get_mut(&tag.tab_id) else {
            return;
        };
        tab.columns = result.columns;
        tab.buffer.clear();
        tab.buffer.push_page(FetchDirection::Forward, result.rows);
        tab.state = TabState::Buffered {
            rows_affected: result.rows_affected,
            truncated: result.truncated,
            elapsed: result.elapsed,
        };
    }

    fn on_query_streaming(&mut self, tag: QueryTag, iterator: SharedIterator) {
        self.finish_execution(tag.tab_id);
        let Some(tab) = self.tabs.get_mut(&tag.tab_id) else {
            return;
        };
        tab.columns = iterator.columns().to_vec();
        tab.iterator = Some(iterator);
        tab.state = TabState::Streaming { end_of_data: false };
        if let Err(error) = self.fetch_next_page(tag.tab_id) {
            warn!(%error, "could not request first page");
        }
    }

    fn on_fetched_page(&mut self, tag: QueryTag, direction: FetchDirection, outcome: FetchOutcome) {
        let Some(tab) = self.tabs.get_mut(&tag.tab_id) else {
            return;
        };
        tab.fetch_in_flight = false;
        let page_size = tab.iterator.as_ref().map_or(0, SharedIterator::page_size);

        match outcome {
            FetchOutcome::Page(page) => {
                let short = page.len() < page_size;
                let evicted = tab.buffer.push_page(page.direction, page.rows);
                tab.notice = None;
                if let TabState::Streaming { end_of_data } = &mut tab.state {
                    match direction {
                        FetchDirection::Forward => *end_of_data = short,
                        FetchDirection::Backward => *end_of_data = false,
                    }
                }
                debug!(
                    tab = tag.tab_id.get(),
                    buffered = tab.buffer.len(),
                    offset = tab.buffer.offset(),
                    evicted,
                    "page applied"
                );
            }
            FetchOutcome::EndOfData => match direction {
                FetchDirection::Forward => {
                    tab.state = TabState::Streaming { end_of_data: true };
                }
                FetchDirection::Backward => {
                    tab.notice = Some("already at the start of the result".to_string());
                }
            },
            FetchOutcome::Unsupported => {
                tab.notice = Some("no earlier page is available".to_string());
            }
        }
    }

    fn on_fetch_error(
        &mut self,
        tag: QueryTag,
        kind: ErrorKind,
        message: &str,
        connection_lost: bool,
    ) {
        let Some(tab) = self.tabs.get_mut(&tag.tab_id) else {
            return;
        };
        tab.fetch_in_flight = false;
        tab.notice = Some(match kind {
            ErrorKind::Cancelled => "fetch cancelled".to_string(),
            _ => format!("fetch {}: {message}", kind.label()),
        });
        if connection_lost {
            warn!(tab = tag.tab_id.get(), %message, "connection lost while fetching");
            if let Some(iterator) = tab.iterator.take() {
                close_in_background(&self.runtime, iterator);
            }
        }
    }

    fn fetch_page(&mut self, tab_id: TabId, direction: FetchDirection) -> Result<(), SessionError> {
        let tab = self
            .tabs
            .get_mut(&tab_id)
            .ok_or(SessionError::UnknownTab(tab_id))?;
        let iterator = tab
            .iterator
            .clone()
            .ok_or(SessionError::NoOpenResult(tab_id))?;
        if tab.fetch_in_flight {
            return Err(SessionError::FetchInFlight(tab_id));
        }
        tab.fetch_in_flight = true;
        let tag = QueryTag {
            generation: self.generation,
            tab_id,
            run_id: tab.run_id,
        };

        let tx = self.tx.clone();
        self.runtime.spawn(async move {
            let message = match iterator.fetch(direction).await {
                Ok(outcome) => SessionMessage::FetchedPage {
                    tag,
                    iterator,
                    direction,
                    outcome,
                },
                Err(error) => SessionMessage::FetchError {
                    tag,
                    kind: ErrorKind::from(&error),
                    message: error.to_string(),
                    connection_lost: error.is_connection_lost(),
                    iterator,
                },
            };
            post(&tx, message);
        });
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("generation", &self.generation)
            .field("connections", &self.connections)
            .field("tabs", &self.tabs.len())
            .field("executing_tab", &self.executing_tab)
            .finish_non_exhaustive()
    }
}

fn post(tx: &UnboundedSender<SessionMessage>, message: SessionMessage) {
    if let Err(error) = tx.send(message) {
        debug!(message = error.0.name(), "session loop is gone, dropping message");
    }
}

fn close_in_background(runtime: &Handle, iterator: SharedIterator) {
    runtime.spawn(async move { iterator.close().await });
}

fn disconnect_in_background(runtime: &Handle, connection: Arc<dyn Connection>) {
    runtime.spawn(async move {
        if let Err(error) = connection.disconnect().await {
            warn!(%error, "failed to disconnect cleanly");
        }
    });
}
