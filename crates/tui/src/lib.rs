use std::collections::BTreeMap;
use std::io::{self, Stdout};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossterm::event::{
    self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent, KeyEventKind,
    KeyModifiers,
};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, Paragraph};
use ratatui::{Frame, Terminal};
use thiserror::Error;
use tidal_adapters::export::{export_iterator, ExportFormat};
use tidal_adapters::EngineConnector;
use tidal_core::cancellation::CancellationToken;
use tidal_core::connection_manager::{ConnectionStatus, Connector};
use tidal_core::pagination::{FetchDirection, FetchOutcome};
use tidal_core::profiles::ConnectionProfile;
use tidal_core::query_runner::ExecutionLimits;
use tidal_core::session::{
    Applied, ConnectionGeneration, QueryTab, Session, SessionMessage, TabId, TabState,
};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

const TICK_RATE: Duration = Duration::from_millis(50);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum TuiError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScrollKey {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Msg {
    Quit,
    ToggleHelp,
    Submit,
    CancelQuery,
    NextPage,
    PrevPage,
    NewTab,
    CloseTab,
    NextTab,
    Reconnect,
    Export,
    Scroll(ScrollKey),
    Input(char),
    Backspace,
    Tick,
}

struct TuiApp {
    session: Session,
    messages: UnboundedReceiver<SessionMessage>,
    runtime: Handle,
    profile: Option<ConnectionProfile>,
    active_tab: TabId,
    editors: BTreeMap<TabId, String>,
    scroll: usize,
    notice: String,
    export_tx: UnboundedSender<String>,
    export_rx: UnboundedReceiver<String>,
    show_help: bool,
    should_quit: bool,
}

impl TuiApp {
    fn new(
        connector: Arc<dyn Connector>,
        runtime: Handle,
        profile: Option<ConnectionProfile>,
    ) -> Self {
        let (mut session, messages) =
            Session::new(connector, runtime.clone(), ExecutionLimits::default());
        let active_tab = session.open_tab();
        let (export_tx, export_rx) = mpsc::unbounded_channel();
        let notice = if profile.is_some() {
            "Type a statement and press Enter".to_string()
        } else {
            "No profile configured; add one to profiles.toml".to_string()
        };

        let mut app = Self {
            session,
            messages,
            runtime,
            profile,
            active_tab,
            editors: BTreeMap::from([(active_tab, String::new())]),
            scroll: 0,
            notice,
            export_tx,
            export_rx,
            show_help: false,
            should_quit: false,
        };
        if let Some(profile) = app.profile.clone() {
            app.session.connect(profile);
        }
        app
    }

    fn handle(&mut self, msg: Msg) {
        match msg {
            Msg::Quit => self.should_quit = true,
            Msg::ToggleHelp => self.show_help = !self.show_help,
            Msg::Submit => self.run_statement(),
            Msg::CancelQuery => {
                self.notice = match self.session.cancel_query(self.active_tab) {
                    Ok(true) => "Cancellation requested".to_string(),
                    Ok(false) => "Nothing to cancel".to_string(),
                    Err(error) => error.to_string(),
                };
            }
            Msg::NextPage => self.request_page(FetchDirection::Forward),
            Msg::PrevPage => self.request_page(FetchDirection::Backward),
            Msg::NewTab => {
                let tab_id = self.session.open_tab();
                self.editors.insert(tab_id, String::new());
                self.switch_to(tab_id);
            }
            Msg::CloseTab => self.close_active_tab(),
            Msg::NextTab => {
                let tab_ids = self.session.tab_ids();
                if let Some(next) = next_tab(&tab_ids, self.active_tab) {
                    self.switch_to(next);
                }
            }
            Msg::Reconnect => match self.profile.clone() {
                Some(profile) => {
                    self.notice = format!("Reconnecting with profile `{}`", profile.name);
                    self.session.connect(profile);
                }
                None => self.notice = "No profile to reconnect with".to_string(),
            },
            Msg::Export => self.export_active_tab(),
            Msg::Scroll(key) => self.scroll_results(key),
            Msg::Input(character) => self.editor_mut().push(character),
            Msg::Backspace => {
                self.editor_mut().pop();
            }
            Msg::Tick => self.drain_messages(),
        }
    }

    fn drain_messages(&mut self) {
        while let Ok(message) = self.messages.try_recv() {
            self.on_message(message);
        }
        while let Ok(notice) = self.export_rx.try_recv() {
            self.notice = notice;
        }
    }

    fn on_message(&mut self, message: SessionMessage) {
        let landed_page = match &message {
            SessionMessage::FetchedPage {
                tag,
                direction,
                outcome: FetchOutcome::Page(page),
                ..
            } => Some((tag.tab_id, *direction, page.len())),
            _ => None,
        };

        match self.session.apply(message) {
            Applied::Accepted => {}
            Applied::Discarded(reason) => {
                debug!(?reason, "stale completion dropped");
                return;
            }
        }

        // Keep the freshly fetched page in view.
        if let Some((tab_id, direction, rows)) = landed_page {
            if tab_id == self.active_tab {
                self.scroll = match direction {
                    FetchDirection::Forward => self.active_buffer_len().saturating_sub(rows),
                    FetchDirection::Backward => 0,
                };
            }
        }
    }

    fn run_statement(&mut self) {
        let sql = self.editor().to_string();
        match self.session.execute_query(self.active_tab, &sql) {
            Ok(tag) => {
                self.scroll = 0;
                self.notice = format!("Run #{} started", tag.run_id.get());
            }
            Err(error) => self.notice = format!("Cannot run: {error}"),
        }
    }

    fn request_page(&mut self, direction: FetchDirection) {
        let result = match direction {
            FetchDirection::Forward => self.session.fetch_next_page(self.active_tab),
            FetchDirection::Backward => self.session.fetch_prev_page(self.active_tab),
        };
        if let Err(error) = result {
            self.notice = error.to_string();
        }
    }

    fn close_active_tab(&mut self) {
        let tab_ids = self.session.tab_ids();
        let fallback = next_tab(&tab_ids, self.active_tab).filter(|next| *next != self.active_tab);
        if let Err(error) = self.session.close_tab(self.active_tab) {
            self.notice = error.to_string();
            return;
        }
        self.editors.remove(&self.active_tab);

        let next = fallback.unwrap_or_else(|| {
            let tab_id = self.session.open_tab();
            self.editors.insert(tab_id, String::new());
            tab_id
        });
        self.switch_to(next);
    }

    fn switch_to(&mut self, tab_id: TabId) {
        self.active_tab = tab_id;
        self.scroll = 0;
        if let Some(tab) = self.session.tab(tab_id) {
            self.notice = format!("Switched to {}", tab.title());
        }
    }

    fn scroll_results(&mut self, key: ScrollKey) {
        let len = self.active_buffer_len();
        self.scroll = match key {
            ScrollKey::Up => self.scroll.saturating_sub(1),
            ScrollKey::Down => (self.scroll + 1).min(len.saturating_sub(1)),
        };
    }

    fn export_active_tab(&mut self) {
        let sql = self
            .session
            .tab(self.active_tab)
            .map(|tab| tab.sql().to_string())
            .unwrap_or_default();
        if sql.is_empty() {
            self.notice = "Run a statement before exporting".to_string();
            return;
        }
        let runner = match self.session.runner() {
            Ok(runner) => runner,
            Err(error) => {
                self.notice = format!("Cannot export: {error}");
                return;
            }
        };

        let path = export_path(self.active_tab);
        let tx = self.export_tx.clone();
        self.notice = format!("Exporting to {}", path.display());
        info!(path = %path.display(), "export started");
        self.runtime.spawn(async move {
            let cancel = CancellationToken::new();
            let exported = match runner.open_iterator(&sql, &cancel).await {
                Ok(iterator) => {
                    export_iterator(iterator, ExportFormat::from_path(&path), &path, &cancel)
                        .await
                        .map_err(|error| error.to_string())
                }
                Err(error) => Err(error.to_string()),
            };
            let notice = match exported {
                Ok(summary) => format!("Exported {} rows to {}", summary.rows, path.display()),
                Err(message) => {
                    warn!(%message, "export failed");
                    format!("Export failed: {message}")
                }
            };
            if tx.send(notice).is_err() {
                debug!("ui closed before export finished");
            }
        });
    }

    fn editor(&self) -> &str {
        self.editors
            .get(&self.active_tab)
            .map_or("", String::as_str)
    }

    fn editor_mut(&mut self) -> &mut String {
        self.editors.entry(self.active_tab).or_default()
    }

    fn active(&self) -> Option<&QueryTab> {
        self.session.tab(self.active_tab)
    }

    fn active_buffer_len(&self) -> usize {
        self.active().map_or(0, |tab| tab.buffer().len())
    }

    fn shutdown(&mut self) {
        self.session.disconnect();
    }
}

#[must_use]
pub fn ui_name() -> &'static str {
    "tidal-tui"
}

/// Runs the terminal client until the user quits. Connects to `profile`
/// right away when one is given.
pub fn run(profile: Option<ConnectionProfile>) -> Result<(), TuiError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("tidal-worker")
        .build()?;
    let connector: Arc<dyn Connector> = Arc::new(EngineConnector::default());
    let mut app = TuiApp::new(connector, runtime.handle().clone(), profile);

    let mut terminal = setup_terminal()?;
    let run_result = run_loop(&mut terminal, &mut app);
    let restore_result = restore_terminal(&mut terminal);

    app.shutdown();
    shutdown_runtime(runtime);

    if let Err(error) = run_result {
        restore_result?;
        return Err(error);
    }

    restore_result?;
    Ok(())
}

fn shutdown_runtime(runtime: Runtime) {
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    info!("runtime stopped");
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>, TuiError> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.clear()?;
    Ok(terminal)
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<(), TuiError> {
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    Ok(())
}

fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    app: &mut TuiApp,
) -> Result<(), TuiError> {
    let mut last_tick = Instant::now();

    loop {
        terminal.draw(|frame| render(frame, app))?;

        let timeout = TICK_RATE
            .checked_sub(last_tick.elapsed())
            .unwrap_or(Duration::ZERO);
        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    if let Some(message) = map_key_event(key) {
                        app.handle(message);
                    }
                }
            }
        }

        if last_tick.elapsed() >= TICK_RATE {
            app.handle(Msg::Tick);
            last_tick = Instant::now();
        }

        if app.should_quit {
            break;
        }
    }

    Ok(())
}

fn render(frame: &mut Frame<'_>, app: &TuiApp) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Min(6),
            Constraint::Length(4),
        ])
        .split(frame.area());

    let mut tab_spans = Vec::new();
    for tab in app.session.tabs() {
        let style = if tab.id() == app.active_tab {
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD)
        } else {
            Style::default()
        };
        tab_spans.push(Span::styled(format!(" {} ", tab.title()), style));
        tab_spans.push(Span::raw("|"));
    }
    tab_spans.pop();
    let header = Paragraph::new(Line::from(tab_spans)).block(
        Block::default()
            .borders(Borders::ALL)
            .title(connection_summary(
                &app.session.status(),
                app.session.generation(),
            )),
    );
    frame.render_widget(header, chunks[0]);

    let editor = Paragraph::new(format!("> {}", app.editor())).block(
        Block::default()
            .borders(Borders::ALL)
            .title("Statement (Enter to run)"),
    );
    frame.render_widget(editor, chunks[1]);

    let visible_limit = usize::from(chunks[2].height.saturating_sub(3)).max(1);
    let (results_title, results_lines) = match app.active() {
        Some(tab) => (
            format!("Results: {}", tab_state_label(tab)),
            result_lines(tab, app.scroll, visible_limit),
        ),
        None => ("Results".to_string(), vec![Line::from("No tab selected")]),
    };
    let results = Paragraph::new(results_lines)
        .block(Block::default().borders(Borders::ALL).title(results_title))
        .alignment(Alignment::Left);
    frame.render_widget(results, chunks[2]);

    let tab_notice = app.active().and_then(QueryTab::notice).unwrap_or("");
    let footer = Paragraph::new(vec![
        Line::from(format!("Status: {}", app.session.status_line())),
        Line::from(if tab_notice.is_empty() {
            app.notice.clone()
        } else {
            format!("{} | {tab_notice}", app.notice)
        }),
    ])
    .block(
        Block::default()
            .borders(Borders::ALL)
            .title("F1 help | PgDn/PgUp page | Ctrl+C cancel | Esc quit"),
    );
    frame.render_widget(footer, chunks[3]);

    if app.show_help {
        render_help_popup(frame);
    }
}

fn result_lines(tab: &QueryTab, scroll: usize, limit: usize) -> Vec<Line<'static>> {
    let mut lines = Vec::with_capacity(limit + 1);
    if !tab.columns().is_empty() {
        let header = tab
            .columns()
            .iter()
            .map(|column| column.name.as_str())
            .collect::<Vec<_>>()
            .join(" | ");
        lines.push(Line::from(Span::styled(
            format!("{:>7} | {header}", "#"),
            Style::default().add_modifier(Modifier::BOLD),
        )));
    }

    let buffer = tab.buffer();
    for (offset, row) in buffer.visible_rows(scroll, limit).into_iter().enumerate() {
        let absolute = buffer.absolute_index(scroll + offset) + 1;
        lines.push(Line::from(format!(
            "{absolute:>7} | {}",
            row.values.join(" | ")
        )));
    }

    if buffer.is_empty() {
        lines.push(Line::from("No rows"));
    }
    lines
}

fn tab_state_label(tab: &QueryTab) -> String {
    let label = match tab.state() {
        TabState::Idle => "idle".to_string(),
        TabState::Running => "running".to_string(),
        TabState::Streaming { end_of_data } => format!(
            "rows {}-{}{}",
            tab.buffer().offset() + 1,
            tab.buffer().offset() + tab.buffer().len() as u64,
            if *end_of_data { " (end of data)" } else { "" }
        ),
        TabState::Buffered {
            rows_affected: Some(affected),
            elapsed,
            ..
        } => format!("{affected} rows affected in {} ms", elapsed.as_millis()),
        TabState::Buffered {
            truncated, elapsed, ..
        } => format!(
            "{} rows in {} ms{}",
            tab.buffer().len(),
            elapsed.as_millis(),
            if *truncated { " (truncated)" } else { "" }
        ),
        TabState::Failed { kind, message } => format!("{}: {message}", kind.label()),
    };
    if tab.fetch_in_flight() {
        format!("{label} [fetching]")
    } else {
        label
    }
}

fn connection_summary(status: &ConnectionStatus, generation: ConnectionGeneration) -> String {
    if !status.is_connected {
        return format!("tidal | not connected | gen {}", generation.get());
    }
    let latency = status
        .last_latency
        .map_or_else(|| "-".to_string(), |latency| format!("{} ms", latency.as_millis()));
    format!(
        "tidal | {} | {} | {} | db {} | gen {} | {latency}",
        status.profile_name.as_deref().unwrap_or("-"),
        status.target.as_deref().unwrap_or("-"),
        status.adapter_name.as_deref().unwrap_or("-"),
        status.database_name.as_deref().unwrap_or("-"),
        generation.get(),
    )
}

fn next_tab(tab_ids: &[TabId], current: TabId) -> Option<TabId> {
    let position = tab_ids.iter().position(|tab_id| *tab_id == current)?;
    tab_ids.get((position + 1) % tab_ids.len()).copied()
}

fn export_path(tab_id: TabId) -> PathBuf {
    PathBuf::from(format!("tidal-export-{tab_id}.csv"))
}

fn render_help_popup(frame: &mut Frame<'_>) {
    let area = centered_rect(70, 60, frame.area());
    frame.render_widget(Clear, area);
    let help = Paragraph::new(vec![
        Line::from("Keys"),
        Line::from("Enter: run the statement in the active tab"),
        Line::from("Ctrl+C: cancel the running statement or fetch"),
        Line::from("PageDown / PageUp: next / previous page"),
        Line::from("Up / Down: scroll buffered rows"),
        Line::from("Ctrl+T: new tab, Ctrl+W: close tab, F2: next tab"),
        Line::from("Ctrl+R: reconnect, Ctrl+E: export to CSV"),
        Line::from("F1: toggle help, Esc: quit"),
    ])
    .block(Block::default().borders(Borders::ALL).title("Help"));
    frame.render_widget(help, area);
}

fn centered_rect(width_percent: u16, height_percent: u16, area: Rect) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100_u16 - height_percent) / 2),
            Constraint::Percentage(height_percent),
            Constraint::Percentage((100_u16 - height_percent) / 2),
        ])
        .split(area);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100_u16 - width_percent) / 2),
            Constraint::Percentage(width_percent),
            Constraint::Percentage((100_u16 - width_percent) / 2),
        ])
        .split(vertical[1])[1]
}

fn map_key_event(key: KeyEvent) -> Option<Msg> {
    match (key.modifiers, key.code) {
        (_, KeyCode::Esc) => Some(Msg::Quit),
        (_, KeyCode::F(1)) => Some(Msg::ToggleHelp),
        (_, KeyCode::F(2)) => Some(Msg::NextTab),
        (_, KeyCode::Enter) => Some(Msg::Submit),
        (_, KeyCode::PageDown) => Some(Msg::NextPage),
        (_, KeyCode::PageUp) => Some(Msg::PrevPage),
        (_, KeyCode::Up) => Some(Msg::Scroll(ScrollKey::Up)),
        (_, KeyCode::Down) => Some(Msg::Scroll(ScrollKey::Down)),
        (_, KeyCode::Backspace) => Some(Msg::Backspace),
        (KeyModifiers::CONTROL, KeyCode::Char('c')) => Some(Msg::CancelQuery),
        (KeyModifiers::CONTROL, KeyCode::Char('t')) => Some(Msg::NewTab),
        (KeyModifiers::CONTROL, KeyCode::Char('w')) => Some(Msg::CloseTab),
        (KeyModifiers::CONTROL, KeyCode::Char('r')) => Some(Msg::Reconnect),
        (KeyModifiers::CONTROL, KeyCode::Char('e')) => Some(Msg::Export),
        (KeyModifiers::NONE | KeyModifiers::SHIFT, KeyCode::Char(character)) => {
            Some(Msg::Input(character))
        }
        _ => None,
    }
}
